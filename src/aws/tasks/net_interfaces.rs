//! Network-interface collector, fanned out per `(account, region)`.
//!
//! The gauge for this resource is additionally grouped per VPC, computed
//! by an in-memory pass over the mapped rows.
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use aws_sdk_ec2::config::Region as SdkRegion;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::describe_network_interfaces::DescribeNetworkInterfacesError;
use aws_sdk_ec2::types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::aws::{self, clients, CollectPayload, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::NetworkInterface;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::{none_if_empty, string_value};

pub const TASK_KIND: &str = "aws:collect-net-interfaces";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_net_interfaces",
    help: "Number of collected AWS network interfaces per VPC.",
    labels: &["account_id", "region", "vpc_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no EC2 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe network interfaces: {}", source))]
    DescribeNetworkInterfaces {
        source: SdkError<DescribeNetworkInterfacesError>,
    },

    #[snafu(display("failed to upsert network interfaces: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeNetworkInterfaces { source } => aws::is_permanent(source),
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

    let interfaces = fetch(&client.inner, &payload.region).await?;
    let rows: Vec<NetworkInterface> = interfaces
        .iter()
        .map(|eni| map_interface(eni, &payload.account_id, &payload.region))
        .collect();

    persist(&ctx.db, &rows).await.context(Upsert)?;
    for (vpc_id, count) in group_by_vpc(&rows) {
        #[allow(clippy::cast_precision_loss)]
        metrics::add_metric(
            TASK_KIND,
            &[&payload.account_id, &payload.region, &vpc_id],
            count as f64,
        );
    }
    info!(
        account_id = %payload.account_id,
        region = %payload.region,
        count = rows.len(),
        "collected AWS network interfaces"
    );
    Ok(())
}

async fn fetch(
    client: &aws_sdk_ec2::Client,
    region: &str,
) -> Result<Vec<types::NetworkInterface>, Error> {
    let mut items = Vec::new();
    let mut next: Option<String> = None;
    loop {
        let out = client
            .describe_network_interfaces()
            .max_results(PAGE_SIZE)
            .set_next_token(next.clone())
            .customize()
            .config_override(
                aws_sdk_ec2::config::Config::builder().region(SdkRegion::new(region.to_owned())),
            )
            .send()
            .await
            .context(DescribeNetworkInterfaces)?;
        items.extend(out.network_interfaces().iter().cloned());
        let token = out.next_token().map(ToOwned::to_owned);
        match token {
            None => break,
            Some(token) if next.as_ref() == Some(&token) => break,
            token => next = token,
        }
    }
    Ok(items)
}

fn map_interface(
    eni: &types::NetworkInterface,
    account_id: &str,
    region: &str,
) -> NetworkInterface {
    let association = eni.association();
    NetworkInterface {
        interface_id: string_value(eni.network_interface_id()),
        account_id: account_id.to_owned(),
        region_name: region.to_owned(),
        az: string_value(eni.availability_zone()),
        interface_type: string_value(
            eni.interface_type()
                .map(types::NetworkInterfaceType::as_str),
        ),
        mac_address: string_value(eni.mac_address()),
        private_ip: parse_ip(eni.private_ip_address()),
        public_ip: parse_ip(association.and_then(types::NetworkInterfaceAssociation::public_ip)),
        public_ip_name: string_value(
            association.and_then(types::NetworkInterfaceAssociation::public_dns_name),
        ),
        vpc_id: string_value(eni.vpc_id()),
        subnet_id: string_value(eni.subnet_id()),
        instance_id: string_value(
            eni.attachment()
                .and_then(types::NetworkInterfaceAttachment::instance_id),
        ),
        status: string_value(eni.status().map(types::NetworkInterfaceStatus::as_str)),
        description: string_value(eni.description()),
    }
}

/// An unparsable or absent address becomes NULL, never an empty string.
fn parse_ip(value: Option<&str>) -> Option<IpAddr> {
    value.and_then(|v| v.parse().ok())
}

fn group_by_vpc(rows: &[NetworkInterface]) -> BTreeMap<String, usize> {
    let mut groups = BTreeMap::new();
    for row in rows {
        *groups.entry(row.vpc_id.clone()).or_insert(0) += 1;
    }
    groups
}

async fn persist(db: &PgPool, rows: &[NetworkInterface]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_net_interfaces (interface_id, account_id, region_name, az, \
         interface_type, mac_address, private_ip, public_ip, public_ip_name, vpc_id, subnet_id, \
         instance_id, status, description) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.interface_id)
            .push_bind(&row.account_id)
            .push_bind(&row.region_name)
            .push_bind(&row.az)
            .push_bind(&row.interface_type)
            .push_bind(&row.mac_address)
            .push_bind(row.private_ip)
            .push_bind(row.public_ip)
            .push_bind(none_if_empty(&row.public_ip_name))
            .push_bind(&row.vpc_id)
            .push_bind(&row.subnet_id)
            .push_bind(&row.instance_id)
            .push_bind(&row.status)
            .push_bind(&row.description);
    });
    query.push(
        " ON CONFLICT (interface_id, account_id) DO UPDATE SET \
         region_name = EXCLUDED.region_name, \
         az = EXCLUDED.az, \
         interface_type = EXCLUDED.interface_type, \
         mac_address = EXCLUDED.mac_address, \
         private_ip = EXCLUDED.private_ip, \
         public_ip = EXCLUDED.public_ip, \
         public_ip_name = EXCLUDED.public_ip_name, \
         vpc_id = EXCLUDED.vpc_id, \
         subnet_id = EXCLUDED.subnet_id, \
         instance_id = EXCLUDED.instance_id, \
         status = EXCLUDED.status, \
         description = EXCLUDED.description, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_parses_addresses_and_attachment() {
        let eni = types::NetworkInterface::builder()
            .network_interface_id("eni-1")
            .availability_zone("eu-central-1a")
            .interface_type(types::NetworkInterfaceType::Interface)
            .mac_address("02:00:00:00:00:01")
            .private_ip_address("10.0.1.5")
            .association(
                types::NetworkInterfaceAssociation::builder()
                    .public_ip("3.64.1.2")
                    .public_dns_name("ec2-3-64-1-2.eu-central-1.compute.amazonaws.com")
                    .build(),
            )
            .attachment(
                types::NetworkInterfaceAttachment::builder()
                    .instance_id("i-1")
                    .build(),
            )
            .vpc_id("vpc-1")
            .subnet_id("subnet-1")
            .status(types::NetworkInterfaceStatus::InUse)
            .build();
        let row = map_interface(&eni, "A", "eu-central-1");
        assert_eq!(row.private_ip, Some("10.0.1.5".parse().unwrap()));
        assert_eq!(row.public_ip, Some("3.64.1.2".parse().unwrap()));
        assert_eq!(
            row.public_ip_name,
            "ec2-3-64-1-2.eu-central-1.compute.amazonaws.com"
        );
        assert_eq!(row.instance_id, "i-1");
        assert_eq!(row.status, "in-use");
    }

    #[test]
    fn missing_addresses_become_null() {
        let eni = types::NetworkInterface::builder()
            .network_interface_id("eni-1")
            .build();
        let row = map_interface(&eni, "A", "eu-central-1");
        assert_eq!(row.private_ip, None);
        assert_eq!(row.public_ip, None);
        assert_eq!(row.public_ip_name, "");
    }

    #[test]
    fn gauge_groups_by_vpc() {
        let rows = vec![
            NetworkInterface {
                vpc_id: "vpc-1".to_owned(),
                ..NetworkInterface::default()
            },
            NetworkInterface {
                vpc_id: "vpc-1".to_owned(),
                ..NetworkInterface::default()
            },
            NetworkInterface {
                vpc_id: "vpc-2".to_owned(),
                ..NetworkInterface::default()
            },
        ];
        let groups = group_by_vpc(&rows);
        assert_eq!(groups.get("vpc-1"), Some(&2));
        assert_eq!(groups.get("vpc-2"), Some(&1));
    }
}
