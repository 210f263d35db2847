//! GCP inventory: REST client, project client set, collectors, links.
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::queue::{ActiveTask, Context, Task};

pub mod api;
pub mod clients;
pub mod links;
pub mod tasks;

pub fn register_tasks() {
    tasks::register();
    links::register();
}

pub fn register_metrics() {
    tasks::register_metrics();
}

/// Child-task payload for project-scoped collectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPayload {
    #[serde(default)]
    pub project_id: String,
}

/// The trailing path segment of a resource URL, which is the resource's
/// short name.
#[must_use]
pub(crate) fn last_path_segment(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

/// The region a zone belongs to: the zone name minus its last hyphen
/// segment. Accepts both bare names and resource URLs.
#[must_use]
pub(crate) fn region_from_zone(zone: &str) -> String {
    let zone = last_path_segment(zone);
    match zone.rfind('-') {
        Some(cut) => zone[..cut].to_owned(),
        None => String::new(),
    }
}

/// One child payload per registered project. Every project fans out;
/// a recoverable per-project failure downstream never hides the others.
pub(crate) fn project_payloads() -> Vec<ProjectPayload> {
    clients::PROJECTS
        .entries()
        .into_iter()
        .map(|(project_id, _)| ProjectPayload { project_id })
        .collect()
}

/// Enqueues one child per payload onto the parent's queue, logging and
/// skipping failed enqueues. Returns the number actually enqueued.
pub(crate) async fn enqueue_children(
    ctx: &Context,
    parent: &ActiveTask,
    kind: &str,
    payloads: &[ProjectPayload],
) -> usize {
    let mut enqueued = 0;
    for payload in payloads {
        let child = match Task::with_payload(kind, payload) {
            Ok(child) => child,
            Err(err) => {
                warn!(project_id = %payload.project_id, "failed to encode child payload: {}", err);
                continue;
            }
        };
        match ctx.broker.enqueue(&child, Some(&parent.queue)).await {
            Ok(_) => enqueued += 1,
            Err(err) => {
                warn!(project_id = %payload.project_id, "failed to enqueue child task: {}", err);
            }
        }
    }
    enqueued
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_zone_minus_last_hyphen_segment() {
        assert_eq!(region_from_zone("europe-west3-a"), "europe-west3");
        assert_eq!(region_from_zone(""), "");
        assert_eq!(region_from_zone("zones/us-central1-b"), "us-central1");
        assert_eq!(
            region_from_zone(
                "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west3-a"
            ),
            "europe-west3"
        );
    }

    #[test]
    fn last_path_segment_extracts_resource_names() {
        assert_eq!(
            last_path_segment(
                "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west3-a/disks/data-0"
            ),
            "data-0"
        );
        assert_eq!(last_path_segment("plain-name"), "plain-name");
        assert_eq!(last_path_segment(""), "");
    }
}
