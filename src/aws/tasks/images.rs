//! AMI collector for self-owned images, fanned out per `(account, region)`.
use std::sync::Arc;

use aws_sdk_ec2::config::Region as SdkRegion;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::describe_images::DescribeImagesError;
use aws_sdk_ec2::types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::aws::{self, clients, CollectPayload, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::Image;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::string_value;

pub const TASK_KIND: &str = "aws:collect-images";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_images",
    help: "Number of collected AWS AMIs.",
    labels: &["account_id", "region"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no EC2 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe images: {}", source))]
    DescribeImages {
        source: SdkError<DescribeImagesError>,
    },

    #[snafu(display("failed to upsert images: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeImages { source } => aws::is_permanent(source),
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
        // An empty region also means fan-out: the payload was built by a
        // caller that knew the account but not the regions yet.
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

    let images = fetch(&client.inner, &payload.region).await?;
    let rows: Vec<Image> = images
        .iter()
        .map(|image| map_image(image, &payload.account_id, &payload.region))
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
        "collected AWS images"
    );
    Ok(())
}

async fn fetch(client: &aws_sdk_ec2::Client, region: &str) -> Result<Vec<types::Image>, Error> {
    let mut items = Vec::new();
    let mut next: Option<String> = None;
    loop {
        let out = client
            .describe_images()
            .owners("self")
            .max_results(PAGE_SIZE)
            .set_next_token(next.clone())
            .customize()
            .config_override(
                aws_sdk_ec2::config::Config::builder().region(SdkRegion::new(region.to_owned())),
            )
            .send()
            .await
            .context(DescribeImages)?;
        items.extend(out.images().iter().cloned());
        let token = out.next_token().map(ToOwned::to_owned);
        match token {
            None => break,
            Some(token) if next.as_ref() == Some(&token) => break,
            token => next = token,
        }
    }
    Ok(items)
}

fn map_image(image: &types::Image, account_id: &str, region: &str) -> Image {
    Image {
        image_id: string_value(image.image_id()),
        account_id: account_id.to_owned(),
        name: string_value(image.name()),
        owner_id: string_value(image.owner_id()),
        image_type: string_value(image.image_type().map(types::ImageTypeValues::as_str)),
        state: string_value(image.state().map(types::ImageState::as_str)),
        root_device_type: string_value(image.root_device_type().map(types::DeviceType::as_str)),
        region_name: region.to_owned(),
    }
}

async fn persist(db: &PgPool, rows: &[Image]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_images (image_id, account_id, name, owner_id, image_type, state, \
         root_device_type, region_name) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.image_id)
            .push_bind(&row.account_id)
            .push_bind(&row.name)
            .push_bind(&row.owner_id)
            .push_bind(&row.image_type)
            .push_bind(&row.state)
            .push_bind(&row.root_device_type)
            .push_bind(&row.region_name);
    });
    query.push(
        " ON CONFLICT (image_id, account_id) DO UPDATE SET \
         name = EXCLUDED.name, \
         owner_id = EXCLUDED.owner_id, \
         image_type = EXCLUDED.image_type, \
         state = EXCLUDED.state, \
         root_device_type = EXCLUDED.root_device_type, \
         region_name = EXCLUDED.region_name, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_fills_row_from_sdk_shape() {
        let image = types::Image::builder()
            .image_id("ami-1")
            .name("golden-image")
            .owner_id("123456789012")
            .image_type(types::ImageTypeValues::Machine)
            .state(types::ImageState::Available)
            .root_device_type(types::DeviceType::Ebs)
            .build();
        let row = map_image(&image, "123456789012", "eu-central-1");
        assert_eq!(row.image_id, "ami-1");
        assert_eq!(row.name, "golden-image");
        assert_eq!(row.image_type, "machine");
        assert_eq!(row.state, "available");
        assert_eq!(row.root_device_type, "ebs");
    }
}
