use std::collections::HashMap;

use async_trait::async_trait;
use kube_client::Client;
use parking_lot::Mutex;

use crate::{capability::DiscoveryCache, error::ExtKubeApiError, Result};

/// Caches the resource names served per group version.
pub struct CachedDiscovery {
    client: Client,
    /// group version -> plural resource names
    cache: Mutex<HashMap<String, Vec<String>>>,
}

impl CachedDiscovery {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::default(),
        }
    }

    async fn server_resources(&self, group_version: &str) -> Result<Vec<String>> {
        let list = if group_version.contains('/') {
            self.client.list_api_group_resources(group_version).await
        } else {
            self.client.list_core_api_resources(group_version).await
        };
        match list {
            Ok(list) => Ok(list.resources.into_iter().map(|r| r.name).collect()),
            // The whole group version is gone.
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl DiscoveryCache for CachedDiscovery {
    fn invalidate(&self) {
        self.cache.lock().clear();
    }

    async fn has_resource(&self, group_version: &str, resource: &str) -> Result<bool> {
        let cached = self.cache.lock().get(group_version).cloned();
        let resources = match cached {
            Some(resources) => resources,
            None => {
                let resources = self.server_resources(group_version).await?;
                self.cache
                    .lock()
                    .insert(group_version.to_string(), resources.clone());
                resources
            }
        };
        Ok(resources.iter().any(|name| name == resource))
    }
}
