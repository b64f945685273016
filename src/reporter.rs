//! The reporter: watches a set of targets and reports the status of every
//! observed object through one merged event stream.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use backoff::backoff::Backoff;
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use kube_core::{ApiResource, DynamicObject, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    capability::{ObjectFilter, WatchEvent},
    config::{Capabilities, ReporterConfig, RestScope, Timings},
    error::ExtKubeApiError,
    status::{is_object_unschedulable, Event, ResourceStatus},
    target::{self, GroupKind, ObjectId, Target},
    telemetry::WatchMetrics,
    Error, Result,
};

mod funnel;
mod task_manager;
mod watch_reference;

use funnel::EventFunnel;
use task_manager::TaskManager;
use watch_reference::{Lease, WatchHandle, WatchReference};

/// Capacity of each per-watch event channel.
const EVENT_CAPACITY: usize = 1;

/// Reports the status of objects using a network of watches,
/// one per [`Target`].
///
/// Unlike a plain watcher, the reporter
/// - computes the status of every object it observes,
/// - watches many resource types at once,
/// - resolves group kinds at runtime, so that kinds whose CRD is installed
///   later are picked up,
/// - starts and stops individual watches as CRDs and namespaces come and go,
/// - gives unschedulable Pods (and the objects generating them) a grace period
///   before reporting them as failed.
///
/// A reporter can only be started once.
pub struct Reporter {
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    config: Option<ReporterConfig>,
    shared: Option<Arc<Shared>>,
}

impl Reporter {
    pub fn new(config: ReporterConfig) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                config: Some(config),
                shared: None,
            }),
        }
    }

    /// Starts every watch and returns the merged event stream.
    ///
    /// The stream closes after `parent` is cancelled or [`stop`](Self::stop) is
    /// called and every watch has wound down. A fatal error is reported as one
    /// [`Event::Error`] right before the stream closes.
    ///
    /// Returns [`Error::AlreadyStarted`] if called more than once.
    pub fn start(&self, parent: &CancellationToken) -> Result<BoxStream<'static, Event>> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.shared.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let Some(config) = lifecycle.config.take() else {
            return Err(Error::AlreadyStarted);
        };

        let token = parent.child_token();
        let (funnel, output) =
            EventFunnel::with_terminal(token.clone(), |event| matches!(event, Event::Error(_)));
        let shared = Arc::new(Shared::new(config, token, funnel));
        lifecycle.shared = Some(Arc::clone(&shared));
        drop(lifecycle);

        for target in &shared.targets {
            shared.start_watch(target);
        }

        tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                shared.funnel.done().await;
                shared.stopped.store(true, Ordering::SeqCst);
                log::debug!("{}: reporter stopped", shared.id);
            }
        });

        let (sync_tx, sync_rx) = mpsc::channel(1);
        if let Err(err) = shared.funnel.add_input(sync_rx) {
            log::warn!("{}: reporter failed to start: {err}", shared.id);
            return Ok(stream::once(async move { Event::Error(err) }).boxed());
        }
        tokio::spawn(Arc::clone(&shared).wait_for_sync(sync_tx));
        tokio::spawn(Arc::clone(&shared).stop_when_idle());

        Ok(stream::unfold(output, |mut output| async move {
            let event = output.recv().await?;
            Some((event, output))
        })
        .boxed())
    }

    /// Cancels every watch. The event stream closes once they have stopped,
    /// without an error event.
    pub fn stop(&self) {
        if let Some(shared) = &self.lifecycle.lock().shared {
            shared.stop();
        }
    }

    /// Returns true if every started watch has synced.
    ///
    /// Watches that are not running, e.g. because their CRD is not installed,
    /// do not hold this back. Always false before start and after stop.
    pub fn has_synced(&self) -> bool {
        match &self.lifecycle.lock().shared {
            Some(shared) => shared.has_synced(),
            None => false,
        }
    }
}

/// State shared by all tasks of a started reporter.
struct Shared {
    id: String,
    capabilities: Capabilities,
    targets: Vec<Target>,
    rest_scope: RestScope,
    label_selector: Option<String>,
    object_filter: Option<Arc<dyn ObjectFilter>>,
    timings: Timings,
    metrics: Arc<dyn WatchMetrics>,

    // Written once on construction, read-only afterwards.
    by_group_kind: HashMap<GroupKind, HashSet<Target>>,
    by_namespace: HashMap<String, HashSet<Target>>,
    watch_refs: HashMap<Target, WatchReference>,

    token: CancellationToken,
    funnel: EventFunnel<Event>,
    tasks: TaskManager,
    stopped: AtomicBool,
    failed: AtomicBool,
}

impl Shared {
    fn new(config: ReporterConfig, token: CancellationToken, funnel: EventFunnel<Event>) -> Self {
        let mut by_group_kind = HashMap::<_, HashSet<_>>::new();
        let mut by_namespace = HashMap::<_, HashSet<_>>::new();
        let mut watch_refs = HashMap::new();
        for target in &config.targets {
            by_group_kind
                .entry(target.group_kind())
                .or_default()
                .insert(target.clone());
            by_namespace
                .entry(target.namespace.clone())
                .or_default()
                .insert(target.clone());
            watch_refs
                .entry(target.clone())
                .or_insert_with(WatchReference::default);
        }

        Self {
            id: config.id,
            capabilities: config.capabilities,
            targets: config.targets,
            rest_scope: config.rest_scope,
            label_selector: config.label_selector,
            object_filter: config.object_filter,
            timings: config.timings,
            metrics: config.metrics,
            by_group_kind,
            by_namespace,
            watch_refs,
            token,
            funnel,
            tasks: TaskManager::default(),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    fn stop(&self) {
        log::debug!("{}: stopping reporter", self.id);
        self.token.cancel();
    }

    fn has_synced(&self) -> bool {
        if self.token.is_cancelled() || self.stopped.load(Ordering::SeqCst) {
            return false;
        }

        let pending: Vec<&Target> = self
            .watch_refs
            .iter()
            .filter(|(_, reference)| reference.has_started() && !reference.has_synced())
            .map(|(target, _)| target)
            .collect();
        if !pending.is_empty() {
            log::trace!("{}: watches pending synchronization: {pending:?}", self.id);
            return false;
        }
        true
    }

    /// Sends a sync event once every started watch has synced.
    async fn wait_for_sync(self: Arc<Self>, events: mpsc::Sender<Event>) {
        // TODO: poll with backoff instead of a fixed interval, once consumers
        // no longer rely on the current sync latency.
        loop {
            if self.has_synced() {
                let _ = events.send(Event::Sync).await;
                return;
            }
            tokio::select! {
                () = self.token.cancelled() => return,
                () = tokio::time::sleep(self.timings.sync_poll_interval) => {}
            }
        }
    }

    /// Stops the reporter once no watch is running anymore,
    /// e.g. after every watched CRD has been deleted.
    async fn stop_when_idle(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => return,
                () = tokio::time::sleep(self.timings.stop_poll_interval) => {}
            }
            if self.watch_refs.values().all(|reference| !reference.has_started()) {
                log::debug!("{}: all watches stopped", self.id);
                self.stop();
                return;
            }
        }
    }

    /// Starts the watch for `target` in the background, unless it is already running.
    fn start_watch(self: &Arc<Self>, target: &Target) {
        let Some(reference) = self.watch_refs.get(target) else {
            return;
        };
        let Some(lease) = reference.start(&self.token) else {
            log::trace!("{}: watch start skipped (already started): {target}", self.id);
            return;
        };
        tokio::spawn(Arc::clone(self).start_watch_with_retry(target.clone(), lease));
    }

    fn stop_watch(&self, target: &Target) {
        if let Some(reference) = self.watch_refs.get(target) {
            reference.stop();
        }
    }

    async fn start_watch_with_retry(self: Arc<Self>, target: Target, mut lease: Lease) {
        let Some(reference) = self.watch_refs.get(&target) else {
            return;
        };
        let mut backoff = self.timings.backoff();
        let mut retries = 0;

        loop {
            let err = match self.start_watch_now(&target, &lease).await {
                Ok(()) => return,
                Err(err) => err,
            };

            if !err.is_no_match() {
                reference.stop_lease(&lease);
                let (events, input) = mpsc::channel(1);
                if let Err(funnel_err) = self.funnel.add_input(input) {
                    // Reporter already stopped.
                    log::debug!("{}: watch failed to start: {target}: {err} ({funnel_err})", self.id);
                    return;
                }
                self.handle_fatal_error(&events, err).await;
                return;
            }

            // CRD (or API extension) not installed yet.
            reference.restart(&lease);
            retries += 1;
            if retries > self.timings.max_no_match_retries {
                log::debug!("{}: watch start abort, reached retry limit: {retries}: {target}", self.id);
                return;
            }
            let Some(delay) = backoff.next_backoff() else {
                log::debug!("{}: watch start abort, retry budget exhausted: {target}", self.id);
                return;
            };
            log::debug!("{}: watch start error (blocking until CRD is added): {target}: {err}", self.id);

            tokio::select! {
                () = self.token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            lease = match reference.start(&self.token) {
                Some(lease) => lease,
                None => {
                    // Started by someone else in the meantime, e.g. a CRD event.
                    return;
                }
            };
        }
    }

    /// Opens the watch for `target` and runs its event loop in the background.
    async fn start_watch_now(self: &Arc<Self>, target: &Target, lease: &Lease) -> Result<()> {
        let group_kind = target.group_kind();
        let mapping = self.capabilities.mapper.rest_mapping(&group_kind).await?;
        let namespace = if mapping.namespaced {
            target.scoped_namespace()
        } else {
            None
        };

        let events = match self
            .capabilities
            .lister_watcher
            .list_watch(&mapping.resource, namespace, self.label_selector.as_deref())
            .await
        {
            Ok(events) => events,
            Err(err) if err.is_not_found() && !self.has_resource(&mapping.resource).await => {
                return Err(Error::NoMatch { group_kind });
            }
            Err(err) => return Err(err),
        };

        let (sender, input) = mpsc::channel(EVENT_CAPACITY);
        self.funnel.add_input(input)?;

        let handle = WatchHandle::default();
        let Some(reference) = self.watch_refs.get(target) else {
            return Ok(());
        };
        if !reference.set_watch(lease, handle.clone()) {
            log::debug!("{}: watch superseded before it started: {target}", self.id);
            return Ok(());
        }

        let lease = lease.clone();
        tokio::spawn(Arc::clone(self).run_watch(target.clone(), lease, handle, events, sender));
        Ok(())
    }

    /// Checks with a fresh discovery whether the server serves `resource`.
    async fn has_resource(&self, resource: &ApiResource) -> bool {
        let discovery = &self.capabilities.discovery;
        discovery.invalidate();
        match discovery
            .has_resource(&resource.api_version, &resource.plural)
            .await
        {
            Ok(found) => found,
            Err(err) => {
                log::error!(
                    "{}: failed to get discovery server resources for {}/{}: {err}",
                    self.id,
                    resource.api_version,
                    resource.plural
                );
                false
            }
        }
    }

    async fn run_watch(
        self: Arc<Self>,
        target: Target,
        lease: Lease,
        handle: WatchHandle,
        mut events: BoxStream<'static, WatchEvent>,
        sender: mpsc::Sender<Event>,
    ) {
        log::debug!("{}: watch starting: {target}", self.id);
        self.metrics.watch_started(&target);
        loop {
            let event = tokio::select! {
                () = lease.token.cancelled() => break,
                () = handle.stopped() => break,
                event = events.next() => event,
            };
            let Some(event) = event else {
                log::debug!("{}: watch event stream closed: {target}", self.id);
                break;
            };

            match event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                    self.on_apply(&lease.token, &sender, obj).await
                }
                WatchEvent::Deleted(obj) => self.on_delete(&lease.token, &sender, obj).await,
                WatchEvent::Error(err) => {
                    log::debug!("{}: watch error event: {target}: {err}", self.id)
                }
            }
        }
        self.metrics.watch_ended(&target);
        log::debug!("{}: watch stopped: {target}", self.id);

        // No more events for this target.
        if let Some(reference) = self.watch_refs.get(&target) {
            reference.stop_lease(&lease);
        }
    }

    fn is_filtered(&self, obj: &DynamicObject) -> bool {
        self.object_filter
            .as_ref()
            .is_some_and(|filter| filter.filter(obj))
    }

    /// Handles an added or modified object.
    async fn on_apply(
        self: &Arc<Self>,
        token: &CancellationToken,
        events: &mpsc::Sender<Event>,
        obj: DynamicObject,
    ) {
        if token.is_cancelled() {
            return;
        }
        let id = ObjectId::from_object(&obj);
        if self.is_filtered(&obj) {
            log::trace!("{}: watch event skipped: {id}", self.id);
            return;
        }
        log::trace!("{}: computing status for object: {id}", self.id);

        // A fresh observation supersedes any scheduled re-check.
        self.tasks.cancel(&id);

        let capabilities = &self.capabilities;
        let rs = match capabilities
            .status_reader
            .read_status_for_object(capabilities.cluster_reader.as_ref(), &obj)
            .await
        {
            Ok(rs) => rs,
            Err(err) => {
                let err = Error::Status {
                    id,
                    source: Box::new(err),
                };
                self.handle_fatal_error(events, err).await;
                return;
            }
        };

        if target::is_namespace(&obj) {
            self.on_namespace_apply(&obj);
        } else if target::is_crd(&obj) {
            self.on_crd_apply(&obj);
        }

        if token.is_cancelled() {
            return;
        }
        if is_object_unschedulable(&rs) {
            log::trace!("{}: object unschedulable: {id}", self.id);
            let recheck = Arc::clone(self).recheck(events.clone(), id.clone());
            self.tasks
                .schedule(token, id, self.timings.schedule_window, recheck);
        }

        let _ = events.send(Event::ResourceUpdate(rs)).await;
    }

    async fn on_delete(
        self: &Arc<Self>,
        token: &CancellationToken,
        events: &mpsc::Sender<Event>,
        obj: DynamicObject,
    ) {
        if token.is_cancelled() {
            return;
        }
        let id = ObjectId::from_object(&obj);
        if self.is_filtered(&obj) {
            log::trace!("{}: watch event skipped: {id}", self.id);
            return;
        }

        self.tasks.cancel(&id);

        if target::is_namespace(&obj) {
            self.on_namespace_delete(&obj);
        } else if target::is_crd(&obj) {
            self.on_crd_delete(&obj);
        }

        let _ = events
            .send(Event::ResourceUpdate(ResourceStatus::deleted(id)))
            .await;
    }

    /// Starts the watches waiting for the kind defined by a new or updated CRD.
    fn on_crd_apply(self: &Arc<Self>, obj: &DynamicObject) {
        let Some(group_kind) = target::crd_group_kind(obj) else {
            log::warn!(
                "{}: invalid CRD applied: missing group and/or kind: {}",
                self.id,
                ObjectId::from_object(obj)
            );
            return;
        };
        log::debug!("{}: CRD applied for {group_kind}", self.id);

        self.capabilities.mapper.reset();
        for target in self.by_group_kind.get(&group_kind).into_iter().flatten() {
            self.start_watch(target);
        }
    }

    fn on_crd_delete(&self, obj: &DynamicObject) {
        let Some(group_kind) = target::crd_group_kind(obj) else {
            log::warn!(
                "{}: invalid CRD deleted: missing group and/or kind: {}",
                self.id,
                ObjectId::from_object(obj)
            );
            return;
        };
        log::debug!("{}: CRD deleted for {group_kind}", self.id);

        for target in self.by_group_kind.get(&group_kind).into_iter().flatten() {
            self.stop_watch(target);
        }
        self.capabilities.mapper.reset();
    }

    fn on_namespace_apply(self: &Arc<Self>, obj: &DynamicObject) {
        // Root scope watches every namespace already.
        if self.rest_scope == RestScope::Root {
            return;
        }
        for target in self.by_namespace.get(&obj.name_any()).into_iter().flatten() {
            self.start_watch(target);
        }
    }

    fn on_namespace_delete(&self, obj: &DynamicObject) {
        if self.rest_scope == RestScope::Root {
            return;
        }
        for target in self.by_namespace.get(&obj.name_any()).into_iter().flatten() {
            self.stop_watch(target);
        }
    }

    /// Reads the status of an object from the cluster and reports it.
    async fn recheck(self: Arc<Self>, events: mpsc::Sender<Event>, id: ObjectId) {
        log::trace!("{}: re-reading object status: {id}", self.id);
        let capabilities = &self.capabilities;
        match capabilities
            .status_reader
            .read_status(capabilities.cluster_reader.as_ref(), &id)
            .await
        {
            Ok(rs) if !self.token.is_cancelled() => {
                let _ = events.send(Event::ResourceUpdate(rs)).await;
            }
            Ok(_) => {}
            Err(err) => {
                let err = Error::Status {
                    id,
                    source: Box::new(err),
                };
                self.handle_fatal_error(&events, err).await;
            }
        }
    }

    /// Reports `err` as the terminal error event and stops the reporter.
    /// Errors caused by the reporter shutting down are swallowed.
    async fn handle_fatal_error(&self, events: &mpsc::Sender<Event>, err: Error) {
        if err.is_cancelled() || self.token.is_cancelled() {
            log::debug!("{}: reporter error during shutdown: {err}", self.id);
            return;
        }
        if self.failed.swap(true, Ordering::SeqCst) {
            log::debug!("{}: reporter already failed: {err}", self.id);
            return;
        }
        log::warn!("{}: reporter error: {err}", self.id);
        // Nothing may follow the error, so stop first.
        self.stop();
        let _ = events.send(Event::Error(err)).await;
    }
}
