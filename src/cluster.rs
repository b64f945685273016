//! Capabilities backed by a live cluster.

use std::sync::Arc;

use kube_client::Client;

use crate::{capability::StatusReader, config::Capabilities};

pub mod discovery;
pub use discovery::CachedDiscovery;
pub mod mapper;
pub use mapper::DiscoveryRestMapper;
pub mod reader;
pub use reader::KubeClusterReader;
pub mod watch;
pub use watch::KubeListerWatcher;

/// Builds the capabilities of a reporter talking to `client`,
/// computing status with `status_reader`.
pub fn capabilities(client: Client, status_reader: Arc<dyn StatusReader>) -> Capabilities {
    let mapper = Arc::new(DiscoveryRestMapper::new(client.clone()));
    Capabilities {
        discovery: Arc::new(CachedDiscovery::new(client.clone())),
        cluster_reader: Arc::new(KubeClusterReader::new(client.clone(), mapper.clone())),
        lister_watcher: Arc::new(KubeListerWatcher::new(client)),
        mapper,
        status_reader,
    }
}
