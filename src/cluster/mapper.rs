use std::collections::HashMap;

use async_trait::async_trait;
use kube_client::{
    discovery::{self, Scope},
    error::DiscoveryError,
    Client,
};
use parking_lot::Mutex;

use crate::{
    capability::{RestMapper, RestMapping},
    target::GroupKind,
    Error, Result,
};

/// Resolves group kinds to their recommended version through API discovery.
///
/// Mappings are cached until [`reset`](RestMapper::reset).
pub struct DiscoveryRestMapper {
    client: Client,
    cache: Mutex<HashMap<GroupKind, RestMapping>>,
}

impl DiscoveryRestMapper {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::default(),
        }
    }
}

#[async_trait]
impl RestMapper for DiscoveryRestMapper {
    async fn rest_mapping(&self, group_kind: &GroupKind) -> Result<RestMapping> {
        if let Some(mapping) = self.cache.lock().get(group_kind) {
            return Ok(mapping.clone());
        }

        let no_match = || Error::NoMatch {
            group_kind: group_kind.clone(),
        };
        let group = match discovery::group(&self.client, &group_kind.group).await {
            Ok(group) => group,
            Err(kube_client::Error::Discovery(DiscoveryError::MissingApiGroup(_))) => {
                return Err(no_match())
            }
            Err(err) => return Err(err.into()),
        };
        let (resource, capabilities) = group
            .recommended_kind(&group_kind.kind)
            .ok_or_else(no_match)?;

        let mapping = RestMapping {
            resource,
            namespaced: capabilities.scope == Scope::Namespaced,
        };
        self.cache
            .lock()
            .insert(group_kind.clone(), mapping.clone());
        Ok(mapping)
    }

    fn reset(&self) {
        log::debug!("Resetting REST mapper");
        self.cache.lock().clear();
    }
}
