//! Watch metrics.

use crate::target::Target;

/// Name of the gauge counting running watches, labelled by `target`.
pub const WATCHES_GAUGE: &str = "kube_status_watcher_watches";

/// Records the lifecycle of individual watches.
///
/// Every [`watch_started`](Self::watch_started) is eventually followed by one
/// [`watch_ended`](Self::watch_ended) for the same target.
pub trait WatchMetrics: Send + Sync {
    fn watch_started(&self, target: &Target);

    fn watch_ended(&self, target: &Target);
}

/// Reports running watches to the installed [`metrics`] recorder.
/// Without a recorder this does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaugeMetrics;

impl WatchMetrics for GaugeMetrics {
    fn watch_started(&self, target: &Target) {
        ::metrics::increment_gauge!(WATCHES_GAUGE, 1.0, "target" => target.to_string());
    }

    fn watch_ended(&self, target: &Target) {
        ::metrics::decrement_gauge!(WATCHES_GAUGE, 1.0, "target" => target.to_string());
    }
}
