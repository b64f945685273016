use std::sync::Arc;

use async_trait::async_trait;
use kube_client::{api::ListParams, Api, Client};
use kube_core::DynamicObject;

use crate::{
    capability::{ClusterReader, RestMapper, RestMapping},
    target::{GroupKind, ObjectId},
    Result,
};

/// Reads arbitrary objects through the dynamic API.
pub struct KubeClusterReader {
    client: Client,
    mapper: Arc<dyn RestMapper>,
}

impl KubeClusterReader {
    pub fn new(client: Client, mapper: Arc<dyn RestMapper>) -> Self {
        Self { client, mapper }
    }

    fn api(&self, mapping: &RestMapping, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace.filter(|ns| mapping.namespaced && !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &mapping.resource),
            None => Api::all_with(self.client.clone(), &mapping.resource),
        }
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get(&self, id: &ObjectId) -> Result<Option<DynamicObject>> {
        let mapping = self.mapper.rest_mapping(&id.group_kind()).await?;
        let api = self.api(&mapping, Some(&id.namespace));
        Ok(api.get_opt(&id.name).await?)
    }

    async fn list(
        &self,
        group_kind: &GroupKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let mapping = self.mapper.rest_mapping(group_kind).await?;
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self.api(&mapping, namespace).list(&params).await?;
        Ok(list.items)
    }
}
