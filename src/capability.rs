//! Capabilities the reporter consumes from its environment.
//!
//! Each capability is a narrow, object safe trait so that the reporter can be
//! driven by a live cluster (see [`cluster`](crate::cluster)) or by test doubles.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube_core::{ApiResource, DynamicObject};

use crate::{
    status::ResourceStatus,
    target::{GroupKind, ObjectId},
    Result,
};

/// The concrete, versioned endpoint a group kind resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestMapping {
    pub resource: ApiResource,
    /// Whether objects of this resource live in namespaces.
    pub namespaced: bool,
}

/// Resolves group kinds into REST mappings.
#[async_trait]
pub trait RestMapper: Send + Sync {
    /// Returns [`Error::NoMatch`](crate::Error::NoMatch) if the server does not serve the kind.
    async fn rest_mapping(&self, group_kind: &GroupKind) -> Result<RestMapping>;

    /// Drops cached mappings, e.g. after a CRD has changed.
    fn reset(&self);
}

/// Access to the cached list of resources served by the cluster.
#[async_trait]
pub trait DiscoveryCache: Send + Sync {
    fn invalidate(&self);

    /// Whether the server serves `resource` (plural name) under `group_version`.
    async fn has_resource(&self, group_version: &str, resource: &str) -> Result<bool>;
}

/// Reads objects from the cluster on demand.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn get(&self, id: &ObjectId) -> Result<Option<DynamicObject>>;

    async fn list(
        &self,
        group_kind: &GroupKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;
}

/// Computes the reconcile status of objects.
#[async_trait]
pub trait StatusReader: Send + Sync {
    /// Computes status from an observed object,
    /// using `reader` to look up generated objects.
    async fn read_status_for_object(
        &self,
        reader: &dyn ClusterReader,
        object: &DynamicObject,
    ) -> Result<ResourceStatus>;

    /// Fetches the object from the cluster and computes its status.
    async fn read_status(&self, reader: &dyn ClusterReader, id: &ObjectId)
        -> Result<ResourceStatus>;
}

/// Decides which objects to ignore.
pub trait ObjectFilter: Send + Sync {
    /// Returns true if the object should be excluded.
    fn filter(&self, object: &DynamicObject) -> bool;
}

/// Excludes every object not in the allow list.
#[derive(Debug, Clone, Default)]
pub struct AllowListFilter {
    pub allow_list: HashSet<ObjectId>,
}

impl AllowListFilter {
    pub fn new(ids: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            allow_list: ids.into_iter().collect(),
        }
    }
}

impl ObjectFilter for AllowListFilter {
    fn filter(&self, object: &DynamicObject) -> bool {
        !self.allow_list.contains(&ObjectId::from_object(object))
    }
}

/// A raw event from a list-then-watch stream.
#[derive(Debug)]
pub enum WatchEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
    /// A recoverable fault inside the stream.
    Error(String),
}

/// Resilient list-then-watch primitive.
///
/// The returned stream lists existing objects as [`WatchEvent::Added`] and then
/// follows changes, re-listing on recoverable faults by itself. It may run
/// forever: the reporter drops it once the watch is stopped, e.g. after the
/// resource's CRD or namespace is deleted.
#[async_trait]
pub trait ListerWatcher: Send + Sync {
    async fn list_watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<BoxStream<'static, WatchEvent>>;
}
