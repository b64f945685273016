//! Status watching for a fixed set of objects.

use std::{collections::BTreeSet, sync::Arc};

use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use tokio_util::sync::CancellationToken;

use crate::{
    capability::{AllowListFilter, ObjectFilter},
    config::{Capabilities, ReporterConfig, RestScope, RestScopeStrategy, Timings, WatchOptions},
    status::Event,
    target::{ObjectId, Target},
    telemetry::{GaugeMetrics, WatchMetrics},
    Reporter,
};

/// Watches the status of a set of objects, picking the watch targets and
/// scope from the objects themselves.
///
/// Unlike [`Reporter`], a `StatusWatcher` can be used any number of times;
/// each [`watch`](Self::watch) runs a new reporter.
#[derive(Clone)]
pub struct StatusWatcher {
    capabilities: Capabilities,
    /// Used instead of the allow list if [`WatchOptions::use_custom_object_filter`] is set.
    object_filter: Option<Arc<dyn ObjectFilter>>,
    timings: Timings,
    metrics: Arc<dyn WatchMetrics>,
}

impl StatusWatcher {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            object_filter: None,
            timings: Timings::default(),
            metrics: Arc::new(GaugeMetrics),
        }
    }

    pub fn object_filter(mut self, filter: Arc<dyn ObjectFilter>) -> Self {
        self.object_filter = Some(filter);
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

    /// Watches `ids` until `parent` is cancelled.
    pub fn watch(
        &self,
        parent: &CancellationToken,
        ids: &[ObjectId],
        options: &WatchOptions,
    ) -> BoxStream<'static, Event> {
        let scope = match options.rest_scope_strategy {
            RestScopeStrategy::Root => RestScope::Root,
            RestScopeStrategy::Namespace => RestScope::Namespace,
            RestScopeStrategy::Automatic => auto_select_rest_scope(ids),
        };
        let targets = match scope {
            RestScope::Root => root_scope_targets(ids),
            RestScope::Namespace => namespace_scope_targets(ids),
        };
        log::debug!(
            "Status watcher starting in {scope:?} scope mode (targets: {})",
            targets.len()
        );

        let object_filter: Arc<dyn ObjectFilter> = match &self.object_filter {
            Some(filter) if options.use_custom_object_filter => Arc::clone(filter),
            _ => Arc::new(AllowListFilter::new(ids.iter().cloned())),
        };

        let mut config = ReporterConfig::new(self.capabilities.clone(), targets)
            .rest_scope(scope)
            .object_filter(object_filter)
            .timings(self.timings.clone())
            .metrics(Arc::clone(&self.metrics));
        if let Some(selector) = &options.label_selector {
            config = config.label_selector(selector);
        }
        if let Some(id) = &options.id {
            config = config.id(id);
        }

        match Reporter::new(config).start(parent) {
            Ok(events) => events,
            Err(err) => stream::once(async move { Event::Error(err) }).boxed(),
        }
    }
}

/// Root scope pays off once the objects span more than one namespace.
fn auto_select_rest_scope(ids: &[ObjectId]) -> RestScope {
    let namespaces: BTreeSet<&str> = ids.iter().map(|id| id.namespace.as_str()).collect();
    if namespaces.len() > 1 {
        RestScope::Root
    } else {
        RestScope::Namespace
    }
}

/// One target per group kind, across all namespaces.
fn root_scope_targets(ids: &[ObjectId]) -> Vec<Target> {
    ids.iter()
        .map(|id| Target::new(&id.group, &id.kind, ""))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// One target per group kind and namespace.
fn namespace_scope_targets(ids: &[ObjectId]) -> Vec<Target> {
    ids.iter()
        .map(|id| Target::new(&id.group, &id.kind, &id.namespace))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{auto_select_rest_scope, namespace_scope_targets, root_scope_targets};
    use crate::{
        config::{RestScope, RestScopeStrategy, WatchOptions},
        target::{ObjectId, Target},
    };

    fn ids() -> Vec<ObjectId> {
        vec![
            ObjectId::new("apps", "Deployment", "a", "web"),
            ObjectId::new("apps", "Deployment", "b", "api"),
            ObjectId::new("", "ConfigMap", "a", "settings"),
            ObjectId::new("", "ConfigMap", "a", "flags"),
        ]
    }

    #[test]
    fn picks_root_scope_for_several_namespaces() {
        assert_eq!(auto_select_rest_scope(&ids()), RestScope::Root);
        assert_eq!(auto_select_rest_scope(&ids()[2..]), RestScope::Namespace);
        assert_eq!(auto_select_rest_scope(&[]), RestScope::Namespace);
    }

    #[test]
    fn root_scope_targets_are_unique_group_kinds() {
        assert_eq!(
            root_scope_targets(&ids()),
            [
                Target::new("", "ConfigMap", ""),
                Target::new("apps", "Deployment", ""),
            ]
        );
    }

    #[test]
    fn namespace_scope_targets_keep_namespaces() {
        assert_eq!(
            namespace_scope_targets(&ids()),
            [
                Target::new("", "ConfigMap", "a"),
                Target::new("apps", "Deployment", "a"),
                Target::new("apps", "Deployment", "b"),
            ]
        );
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: WatchOptions =
            serde_json::from_str(r#"{"restScopeStrategy": "Namespace", "labelSelector": "app=web"}"#)
                .unwrap();
        assert_eq!(options.rest_scope_strategy, RestScopeStrategy::Namespace);
        assert_eq!(options.label_selector.as_deref(), Some("app=web"));
        assert!(!options.use_custom_object_filter);
        assert_eq!(options.id, None);
    }
}
