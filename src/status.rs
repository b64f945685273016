//! Computed object status and the events the reporter emits.

use std::{fmt, time::Duration};

use k8s_openapi::{api::core::v1::Pod, Resource as _};
use kube_core::DynamicObject;
use serde_json::Value;

use crate::{target::ObjectId, Error};

/// How long an unschedulable workload is given before its status is checked again.
pub const SCHEDULE_WINDOW: Duration = Duration::from_secs(15);

/// Reconcile status of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    InProgress,
    Failed,
    Current,
    Terminating,
    NotFound,
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::InProgress => "InProgress",
            Status::Failed => "Failed",
            Status::Current => "Current",
            Status::Terminating => "Terminating",
            Status::NotFound => "NotFound",
            Status::Unknown => "Unknown",
        })
    }
}

/// The computed status of one object, along with the objects it generated.
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub identifier: ObjectId,
    pub status: Status,
    pub message: String,
    /// Last observed state of the object; `None` once it has been deleted.
    pub resource: Option<DynamicObject>,
    /// Statuses of generated objects, e.g. the Pods of a ReplicaSet.
    pub generated_resources: Vec<ResourceStatus>,
}

impl ResourceStatus {
    /// Status of an object that no longer exists.
    ///
    /// Generated objects are not looked up, since they cannot be resolved
    /// reliably after their owner is gone.
    pub fn deleted(identifier: ObjectId) -> Self {
        Self {
            identifier,
            status: Status::NotFound,
            message: "Resource not found".to_string(),
            resource: None,
            generated_resources: Vec::new(),
        }
    }
}

/// An element of the reporter output stream.
#[derive(Debug)]
pub enum Event {
    /// The status of an object changed.
    ResourceUpdate(ResourceStatus),
    /// Every started watch has reached steady state.
    Sync,
    /// Fatal error; the stream closes after this.
    Error(Error),
}

/// Returns true if the object, or any object it generated,
/// is an in-progress Pod that has not been placed on a node.
pub(crate) fn is_object_unschedulable(rs: &ResourceStatus) -> bool {
    if rs.status != Status::InProgress {
        return false;
    }
    if rs.resource.as_ref().is_some_and(is_pod_unschedulable) {
        return true;
    }
    rs.generated_resources.iter().any(is_object_unschedulable)
}

fn is_pod_unschedulable(obj: &DynamicObject) -> bool {
    let is_pod = obj
        .types
        .as_ref()
        .is_some_and(|types| types.kind == Pod::KIND && types.api_version == Pod::API_VERSION);
    if !is_pod {
        return false;
    }

    let scheduled = obj
        .data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|cond| cond.get("type").and_then(Value::as_str) == Some("PodScheduled"))
        });
    match scheduled {
        Some(cond) => {
            cond.get("status").and_then(Value::as_str) == Some("False")
                && cond.get("reason").and_then(Value::as_str) == Some("Unschedulable")
        }
        // Not seen by the scheduler yet.
        None => obj
            .data
            .pointer("/spec/nodeName")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty),
    }
}
