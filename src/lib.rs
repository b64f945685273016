//! kube-status-watcher reports the reconcile status of objects across a
//! changing set of resource types and namespaces.
//!
//! A [`Reporter`] runs one list-then-watch per [`Target`] and merges them into
//! a single stream of [`Event`]s. Watches start and stop on their own in
//! response to the cluster: a target whose CRD is not installed yet is started
//! once the CRD shows up, and stopped again when it is deleted.
//! The same goes for namespaces when watching in namespace scope.
//!
//! How object status is computed is up to the [`StatusReader`] supplied by the
//! caller; [`cluster`] provides the remaining capabilities for a live cluster.

pub mod capability;
pub use capability::{
    AllowListFilter, ClusterReader, DiscoveryCache, ListerWatcher, ObjectFilter, RestMapper,
    RestMapping, StatusReader, WatchEvent,
};
pub mod cluster;
pub mod config;
pub use config::{Capabilities, ReporterConfig, RestScope, RestScopeStrategy, Timings, WatchOptions};
mod error;
pub use error::{BoxError, Error, Result};
mod reporter;
pub use reporter::Reporter;
pub mod status;
pub use status::{Event, ResourceStatus, Status};
pub mod target;
pub use target::{GroupKind, ObjectId, Target};
pub mod telemetry;
pub use telemetry::{GaugeMetrics, WatchMetrics};
mod watcher;
pub use watcher::StatusWatcher;
