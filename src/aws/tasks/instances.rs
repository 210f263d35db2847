//! EC2 instance collector, fanned out per `(account, region)`.
use std::sync::Arc;

use aws_sdk_ec2::config::Region as SdkRegion;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::describe_instances::DescribeInstancesError;
use aws_sdk_ec2::types;
use chrono::{DateTime, Utc};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::aws::{self, clients, CollectPayload, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::Instance;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::string_value;

pub const TASK_KIND: &str = "aws:collect-instances";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_instances",
    help: "Number of collected AWS EC2 instances.",
    labels: &["account_id", "region"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no EC2 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe instances: {}", source))]
    DescribeInstances {
        source: SdkError<DescribeInstancesError>,
    },

    #[snafu(display("failed to upsert instances: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeInstances { source } => aws::is_permanent(source),
            Error::Upsert { .. } => false,
        };
        if permanent {
            TaskError::skip_retry(err)
        } else {
            TaskError::failed(err)
        }
    }
}

pub(crate) async fn handle(ctx: Arc<Context>, task: ActiveTask) -> Result<(), TaskError> {
    match task.decode::<CollectPayload>().map_err(TaskError::skip_retry)? {
        None => fan_out(&ctx, &task).await,
        Some(payload) if payload.region.is_empty() => fan_out(&ctx, &task).await,
        Some(payload) => collect(&ctx, &payload).await.map_err(Into::into),
    }
}

async fn fan_out(ctx: &Context, task: &ActiveTask) -> Result<(), TaskError> {
    let payloads = aws::account_region_payloads(&ctx.db, &clients::EC2).await;
    aws::enqueue_children(ctx, task, TASK_KIND, &payloads).await;
    Ok(())
}

async fn collect(ctx: &Context, payload: &CollectPayload) -> Result<(), Error> {
    ensure!(!payload.account_id.is_empty(), NoAccountId);
    let client = clients::EC2.get(&payload.account_id).context(ClientLookup {
        account_id: payload.account_id.clone(),
    })?;

    let instances = fetch(&client.inner, &payload.region).await?;
    let rows: Vec<Instance> = instances
        .iter()
        .map(|instance| map_instance(instance, &payload.account_id, &payload.region))
        .collect();

    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(
        TASK_KIND,
        &[&payload.account_id, &payload.region],
        count as f64,
    );
    info!(
        account_id = %payload.account_id,
        region = %payload.region,
        count,
        "collected AWS instances"
    );
    Ok(())
}

async fn fetch(client: &aws_sdk_ec2::Client, region: &str) -> Result<Vec<types::Instance>, Error> {
    let mut items = Vec::new();
    let mut next: Option<String> = None;
    loop {
        let out = client
            .describe_instances()
            .max_results(PAGE_SIZE)
            .set_next_token(next.clone())
            .customize()
            .config_override(
                aws_sdk_ec2::config::Config::builder().region(SdkRegion::new(region.to_owned())),
            )
            .send()
            .await
            .context(DescribeInstances)?;
        for reservation in out.reservations() {
            items.extend(reservation.instances().iter().cloned());
        }
        let token = out.next_token().map(ToOwned::to_owned);
        match token {
            None => break,
            Some(token) if next.as_ref() == Some(&token) => break,
            token => next = token,
        }
    }
    Ok(items)
}

fn map_instance(instance: &types::Instance, account_id: &str, region: &str) -> Instance {
    let name = instance
        .tags()
        .iter()
        .find(|tag| tag.key() == Some("Name"))
        .and_then(types::Tag::value);
    Instance {
        instance_id: string_value(instance.instance_id()),
        account_id: account_id.to_owned(),
        name: string_value(name),
        arch: string_value(
            instance
                .architecture()
                .map(types::ArchitectureValues::as_str),
        ),
        instance_type: string_value(instance.instance_type().map(types::InstanceType::as_str)),
        state: string_value(
            instance
                .state()
                .and_then(types::InstanceState::name)
                .map(types::InstanceStateName::as_str),
        ),
        platform: string_value(instance.platform_details()),
        vpc_id: string_value(instance.vpc_id()),
        subnet_id: string_value(instance.subnet_id()),
        image_id: string_value(instance.image_id()),
        region_name: region.to_owned(),
        launch_time: instance
            .launch_time()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
    }
}

async fn persist(db: &PgPool, rows: &[Instance]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_instances (instance_id, account_id, name, arch, instance_type, state, \
         platform, vpc_id, subnet_id, image_id, region_name, launch_time) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.instance_id)
            .push_bind(&row.account_id)
            .push_bind(&row.name)
            .push_bind(&row.arch)
            .push_bind(&row.instance_type)
            .push_bind(&row.state)
            .push_bind(&row.platform)
            .push_bind(&row.vpc_id)
            .push_bind(&row.subnet_id)
            .push_bind(&row.image_id)
            .push_bind(&row.region_name)
            .push_bind(row.launch_time);
    });
    query.push(
        " ON CONFLICT (instance_id, account_id) DO UPDATE SET \
         name = EXCLUDED.name, \
         arch = EXCLUDED.arch, \
         instance_type = EXCLUDED.instance_type, \
         state = EXCLUDED.state, \
         platform = EXCLUDED.platform, \
         vpc_id = EXCLUDED.vpc_id, \
         subnet_id = EXCLUDED.subnet_id, \
         image_id = EXCLUDED.image_id, \
         region_name = EXCLUDED.region_name, \
         launch_time = EXCLUDED.launch_time, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_reads_name_tag_and_state() {
        let instance = types::Instance::builder()
            .instance_id("i-0abc")
            .architecture(types::ArchitectureValues::X8664)
            .instance_type(types::InstanceType::M5Large)
            .state(
                types::InstanceState::builder()
                    .name(types::InstanceStateName::Running)
                    .build(),
            )
            .platform_details("Linux/UNIX")
            .vpc_id("vpc-1")
            .subnet_id("subnet-1")
            .image_id("ami-1")
            .tags(types::Tag::builder().key("Name").value("bastion").build())
            .build();
        let row = map_instance(&instance, "A", "eu-central-1");
        assert_eq!(row.instance_id, "i-0abc");
        assert_eq!(row.name, "bastion");
        assert_eq!(row.arch, "x86_64");
        assert_eq!(row.instance_type, "m5.large");
        assert_eq!(row.state, "running");
        assert_eq!(row.image_id, "ami-1");
        assert_eq!(row.launch_time, None);
    }

    #[test]
    fn mapping_without_name_tag_is_empty() {
        let instance = types::Instance::builder().instance_id("i-1").build();
        let row = map_instance(&instance, "A", "eu-central-1");
        assert_eq!(row.name, "");
        assert_eq!(row.state, "");
    }
}
