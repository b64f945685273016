use std::{sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::Deserialize;

use crate::{
    capability::{ClusterReader, DiscoveryCache, ListerWatcher, ObjectFilter, RestMapper, StatusReader},
    status::SCHEDULE_WINDOW,
    target::Target,
    telemetry::{GaugeMetrics, WatchMetrics},
};

/// Whether resources are listed and watched per namespace or across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RestScope {
    /// One watch per resource type across all namespaces.
    #[default]
    Root,
    /// One watch per resource type and namespace.
    /// Needs fewer permissions, but namespaces are tracked individually.
    Namespace,
}

/// The collaborators a [`Reporter`](crate::Reporter) works with.
#[derive(Clone)]
pub struct Capabilities {
    pub mapper: Arc<dyn RestMapper>,
    pub discovery: Arc<dyn DiscoveryCache>,
    pub status_reader: Arc<dyn StatusReader>,
    pub cluster_reader: Arc<dyn ClusterReader>,
    pub lister_watcher: Arc<dyn ListerWatcher>,
}

/// Timing knobs of the reporter. The defaults suit production use.
#[derive(Debug, Clone)]
pub struct Timings {
    /// First delay between watch start attempts.
    pub retry_initial_interval: Duration,
    pub retry_max_interval: Duration,
    pub retry_multiplier: f64,
    /// Total time budget for retrying one watch start.
    pub retry_max_elapsed_time: Duration,
    /// How often a watch start may be retried while its CRD is missing.
    pub max_no_match_retries: u32,
    /// Grace period before re-reading the status of an unschedulable object.
    pub schedule_window: Duration,
    /// How often to check whether all started watches have synced.
    pub sync_poll_interval: Duration,
    /// How often to check whether every watch has stopped.
    pub stop_poll_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            retry_initial_interval: Duration::from_millis(800),
            retry_max_interval: Duration::from_secs(30),
            retry_multiplier: 2.0,
            retry_max_elapsed_time: Duration::from_secs(120),
            max_no_match_retries: 2,
            schedule_window: SCHEDULE_WINDOW,
            sync_poll_interval: Duration::from_millis(100),
            stop_poll_interval: Duration::from_secs(5),
        }
    }
}

impl Timings {
    pub(crate) fn backoff(&self) -> impl Backoff + Send {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry_initial_interval,
            max_interval: self.retry_max_interval,
            multiplier: self.retry_multiplier,
            randomization_factor: 0.5,
            max_elapsed_time: Some(self.retry_max_elapsed_time),
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        backoff
    }
}

/// Parameters for a [`Reporter`](crate::Reporter).
pub struct ReporterConfig {
    pub capabilities: Capabilities,
    /// What to watch.
    pub targets: Vec<Target>,
    pub rest_scope: RestScope,
    /// Server-side label filter for every watch.
    pub label_selector: Option<String>,
    pub object_filter: Option<Arc<dyn ObjectFilter>>,
    /// Identifies the reporter in log messages.
    pub id: String,
    pub timings: Timings,
    pub metrics: Arc<dyn WatchMetrics>,
}

impl ReporterConfig {
    pub fn new(capabilities: Capabilities, targets: Vec<Target>) -> Self {
        Self {
            capabilities,
            targets,
            rest_scope: RestScope::default(),
            label_selector: None,
            object_filter: None,
            id: String::from("reporter"),
            timings: Timings::default(),
            metrics: Arc::new(GaugeMetrics),
        }
    }

    pub fn rest_scope(mut self, rest_scope: RestScope) -> Self {
        self.rest_scope = rest_scope;
        self
    }

    pub fn label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn object_filter(mut self, filter: Arc<dyn ObjectFilter>) -> Self {
        self.object_filter = Some(filter);
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn WatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// How a [`StatusWatcher`](crate::StatusWatcher) picks its [`RestScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RestScopeStrategy {
    /// Root scope if the watched objects span several namespaces,
    /// namespace scope otherwise.
    #[default]
    Automatic,
    Root,
    Namespace,
}

/// Options for [`StatusWatcher::watch`](crate::StatusWatcher::watch).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchOptions {
    pub rest_scope_strategy: RestScopeStrategy,
    pub label_selector: Option<String>,
    /// Use the watcher's own object filter instead of allow-listing the watched ids.
    pub use_custom_object_filter: bool,
    pub id: Option<String>,
}
