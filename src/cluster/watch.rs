use std::collections::HashMap;

use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use kube_client::{api::ListParams, Api, Client};
use kube_core::{ApiResource, DynamicObject, ResourceExt, TypeMeta};
use kube_runtime::{watcher, WatchStreamExt};

use crate::{
    capability::{ListerWatcher, WatchEvent},
    Result,
};

/// List-then-watch through [`kube_runtime::watcher`], which re-lists and
/// re-watches with backoff on recoverable errors.
pub struct KubeListerWatcher {
    client: Client,
}

impl KubeListerWatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ListerWatcher for KubeListerWatcher {
    async fn list_watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<BoxStream<'static, WatchEvent>> {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        };

        let mut probe = ListParams::default().limit(1);
        let mut config = watcher::Config::default();
        if let Some(selector) = label_selector {
            probe = probe.labels(selector);
            config = config.labels(selector);
        }
        // The watcher retries forever, so surface a missing resource up front.
        api.list(&probe).await?;

        let events = watcher(api, config).default_backoff();
        Ok(watch_events(events, resource.clone()).boxed())
    }
}

/// Identifies an object within one resource type.
type ObjectKey = (Option<String>, String);

fn key(obj: &DynamicObject) -> ObjectKey {
    (obj.namespace(), obj.name_any())
}

/// Translates watcher events into added, modified and deleted events.
///
/// A re-list reports objects that disappeared in the meantime as deleted.
fn watch_events(
    events: impl Stream<Item = watcher::Result<watcher::Event<DynamicObject>>> + Send + 'static,
    resource: ApiResource,
) -> impl Stream<Item = WatchEvent> + Send + 'static {
    let mut known = HashMap::<ObjectKey, DynamicObject>::new();

    events
        .map(move |event| {
            let translated = match event {
                Ok(watcher::Event::Applied(obj)) => {
                    let obj = with_types(obj, &resource);
                    match known.insert(key(&obj), obj.clone()) {
                        Some(_) => vec![WatchEvent::Modified(obj)],
                        None => vec![WatchEvent::Added(obj)],
                    }
                }
                Ok(watcher::Event::Deleted(obj)) => {
                    let obj = with_types(obj, &resource);
                    known.remove(&key(&obj));
                    vec![WatchEvent::Deleted(obj)]
                }
                Ok(watcher::Event::Restarted(objs)) => {
                    let mut previous = std::mem::take(&mut known);
                    let mut translated = Vec::with_capacity(objs.len());
                    for obj in objs {
                        let obj = with_types(obj, &resource);
                        let key = key(&obj);
                        translated.push(match previous.remove(&key) {
                            Some(_) => WatchEvent::Modified(obj.clone()),
                            None => WatchEvent::Added(obj.clone()),
                        });
                        known.insert(key, obj);
                    }
                    translated.extend(previous.into_values().map(WatchEvent::Deleted));
                    translated
                }
                Err(err) => vec![WatchEvent::Error(err.to_string())],
            };
            stream::iter(translated)
        })
        .flatten()
}

/// List items come without type information; fill it in from the resource.
fn with_types(mut obj: DynamicObject, resource: &ApiResource) -> DynamicObject {
    obj.types.get_or_insert_with(|| TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    });
    obj
}
