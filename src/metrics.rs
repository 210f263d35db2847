//! Last-value metrics for non-deterministic workers.
//!
//! Collectors run concurrently across accounts and regions and emit
//! gauges with overlapping label sets; the store keeps exactly one value
//! per `(task kind, label tuple)`, the freshest write wins, and values
//! survive handler failures until the next write. That is precisely the
//! semantics of a labeled gauge, so each descriptor is one `GaugeVec`
//! registered at assembly.
use std::net::SocketAddr;

use once_cell::sync::Lazy;
use prometheus::{Encoder, GaugeVec, Opts, TextEncoder};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::watch;
use tracing::warn;
use warp::Filter;

use crate::registry::Registry;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid metrics address {:?}: {}", address, source))]
    ParseAddress {
        address: String,
        source: std::net::AddrParseError,
    },

    #[snafu(display("no metric descriptor registered for task {:?}", task_kind))]
    DescriptorLookup { task_kind: String },

    #[snafu(display("failed to build metric: {}", source))]
    BuildMetric { source: prometheus::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One gauge family per collector task kind. Labels identify the account
/// or project scope plus any extra grouping dimension.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub task_kind: &'static str,
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

pub static REGISTRY: Lazy<prometheus::Registry> = Lazy::new(prometheus::Registry::new);
static DESCRIPTORS: Lazy<Registry<&'static str, GaugeVec>> = Lazy::new(Registry::new);

/// Registers a descriptor into the process registry. Assembly only;
/// panics on duplicates like every other `must_register`.
pub fn must_register(descriptor: &Descriptor) {
    must_register_in(descriptor, &REGISTRY, &DESCRIPTORS);
}

fn must_register_in(
    descriptor: &Descriptor,
    registry: &prometheus::Registry,
    descriptors: &Registry<&'static str, GaugeVec>,
) {
    let gauge = GaugeVec::new(
        Opts::new(descriptor.name, descriptor.help),
        descriptor.labels,
    )
    .expect("valid metric descriptor");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metric registered twice");
    descriptors.must_register(descriptor.task_kind, gauge);
}

/// Records the most recent value for the task's label tuple,
/// overwriting whatever was there.
pub fn add_metric(task_kind: &str, labels: &[&str], value: f64) {
    if let Err(err) = add_metric_in(&DESCRIPTORS, task_kind, labels, value) {
        warn!(task_kind, "failed to record metric: {}", err);
    }
}

fn add_metric_in(
    descriptors: &Registry<&'static str, GaugeVec>,
    task_kind: &str,
    labels: &[&str],
    value: f64,
) -> Result<()> {
    let gauge = descriptors.get(task_kind).context(DescriptorLookup {
        task_kind: task_kind.to_owned(),
    })?;
    gauge
        .get_metric_with_label_values(labels)
        .context(BuildMetric)?
        .set(value);
    Ok(())
}

/// Renders the whole registry in the text exposition format.
#[must_use]
pub fn scrape() -> String {
    let families = REGISTRY.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .unwrap_or_else(|err| {
            warn!("failed to encode metrics: {}", err);
            String::new()
        })
}

/// Serves `/metrics` and `/healthz` until shutdown is signalled.
pub async fn serve(address: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let address: SocketAddr = address.parse().context(ParseAddress {
        address: address.to_owned(),
    })?;
    let metrics = warp::get()
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .map(scrape);
    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| "OK");
    let (_, server) =
        warp::serve(metrics.or(healthz)).bind_with_graceful_shutdown(address, async move {
            let _ = shutdown.changed().await;
        });
    server.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gathered_value(registry: &prometheus::Registry, name: &str, labels: &[&str]) -> Option<f64> {
        registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .and_then(|family| {
                family.get_metric().iter().find(|metric| {
                    let mut values: Vec<_> = metric
                        .get_label()
                        .iter()
                        .map(prometheus::proto::LabelPair::get_value)
                        .collect();
                    values.sort_unstable();
                    let mut expected = labels.to_vec();
                    expected.sort_unstable();
                    values == expected
                })
            })
            .map(|metric| metric.get_gauge().get_value())
    }

    #[test]
    fn freshest_value_wins_per_label_tuple() {
        let registry = prometheus::Registry::new();
        let descriptors: Registry<&'static str, GaugeVec> = Registry::new();
        must_register_in(
            &Descriptor {
                task_kind: "test:collect-things",
                name: "test_things",
                help: "Number of things",
                labels: &["account_id", "region"],
            },
            &registry,
            &descriptors,
        );

        add_metric_in(&descriptors, "test:collect-things", &["a", "eu-west-1"], 2.0).unwrap();
        add_metric_in(&descriptors, "test:collect-things", &["a", "eu-west-1"], 5.0).unwrap();
        add_metric_in(&descriptors, "test:collect-things", &["b", "eu-west-1"], 7.0).unwrap();

        assert_eq!(
            gathered_value(&registry, "test_things", &["a", "eu-west-1"]),
            Some(5.0)
        );
        assert_eq!(
            gathered_value(&registry, "test_things", &["b", "eu-west-1"]),
            Some(7.0)
        );
    }

    #[test]
    fn unknown_descriptor_is_an_error() {
        let descriptors: Registry<&'static str, GaugeVec> = Registry::new();
        let err = add_metric_in(&descriptors, "test:unknown", &["a"], 1.0).unwrap_err();
        assert!(err.to_string().contains("test:unknown"));
    }
}
