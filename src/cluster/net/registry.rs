//! Name lookup for nodes: each worker registers under
//! `{node_prefix}{k}` and the client resolves the names into its table.

#[cfg(feature = "quic")]
use std::{net::SocketAddr, sync::Arc};

use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cluster::{
    config::ClusterConfig,
    contact::Link,
    error::{Error, Result},
    table::ClusterTable,
};

/// What a QUIC node or proxy publishes so clients can reach and
/// authenticate it.
#[cfg(feature = "quic")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub location: String,
    pub addr: SocketAddr,
    /// The node's self-signed certificate, pinned by clients.
    pub cert_der: Vec<u8>,
}

#[derive(Default)]
pub struct Registry {
    links: RwLock<HashMap<String, Link>>,
    #[cfg(feature = "quic")]
    registrations: RwLock<HashMap<String, Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `location` to `link`, replacing any earlier binding.
    pub async fn bind(&self, location: impl Into<String>, link: Link) {
        let location = location.into();
        debug!(%location, "bound");
        self.links.write().await.insert(location, link);
    }

    pub async fn unbind(&self, location: &str) -> Option<Link> {
        self.links.write().await.remove(location)
    }

    pub async fn lookup(&self, location: &str) -> Result<Link> {
        self.links
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| Error::config(format!("nothing registered as {}", location)))
    }

    /// Resolves workers `0..workers` and appends `client` as the fallback
    /// slot.
    pub async fn cluster_table(
        &self,
        config: &ClusterConfig,
        workers: usize,
        client: Link,
    ) -> Result<ClusterTable<Link>> {
        let mut slots = Vec::with_capacity(workers + 1);
        for k in 0..workers {
            slots.push(self.lookup(&config.location(k)).await?);
        }
        slots.push(client);
        info!(workers, "cluster table resolved");
        ClusterTable::new(slots)
    }

    #[cfg(feature = "quic")]
    pub async fn publish(&self, registration: Registration) {
        debug!(location = %registration.location, addr = %registration.addr, "published");
        self.registrations
            .write()
            .await
            .insert(registration.location.clone(), registration);
    }

    #[cfg(feature = "quic")]
    pub async fn registration(&self, location: &str) -> Result<Registration> {
        self.registrations
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| Error::config(format!("nothing published as {}", location)))
    }

    /// Connects to every published node from `endpoint` and binds the
    /// resulting links under their locations.
    #[cfg(feature = "quic")]
    pub async fn connect_all(
        &self,
        endpoint: &quinn::Endpoint,
        config: &ClusterConfig,
    ) -> Result<usize> {
        let registrations: Vec<Registration> =
            self.registrations.read().await.values().cloned().collect();
        let mut connected = 0;
        for registration in &registrations {
            let axon = super::axon::Axon::connect(endpoint, registration, config.clone()).await?;
            self.bind(registration.location.clone(), Arc::new(axon)).await;
            connected += 1;
        }
        Ok(connected)
    }
}
