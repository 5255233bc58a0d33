use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, debug_span, trace, Instrument};

use super::{
    registry::Registration,
    wire::{Reply, Request, PROTOCOL_VERSION},
};
use crate::cluster::{
    agent::{AgentId, AgentMessage, AgentResponse, ComputeAgent},
    config::ClusterConfig,
    contact::{AgentContact, ContactChannel, NodeLink},
    error::{Error, Result},
    handle::SessionSetup,
    hex::HexDisplayExt,
    proxy::{ProxyLink, ProxyReply, ProxyRequest},
};

/// A QUIC link from the client to one node, or from the user tier to a
/// proxy. Every request runs on its own bidirectional stream, so calls to
/// different agents never queue behind each other.
///
/// Can be cloned to obtain another handle to the same connection.
#[derive(Clone)]
pub struct Axon {
    conn: quinn::Connection,
    location: String,
    config: ClusterConfig,
}

impl Axon {
    /// Connects to a published node, trusting only the certificate it
    /// published.
    pub async fn connect(
        endpoint: &quinn::Endpoint,
        registration: &Registration,
        config: ClusterConfig,
    ) -> Result<Self> {
        let span = debug_span!("axon", location = %registration.location, remote = %registration.addr);
        async move {
            let mut roots = rustls::RootCertStore::empty();
            roots.add(&rustls::Certificate(registration.cert_der.clone()))?;
            let tls = rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let client_config = quinn::ClientConfig::new(Arc::new(tls));

            debug!("establishing QUIC connection");
            let conn = endpoint
                .connect_with(client_config, registration.addr, &registration.location)?
                .await?;
            debug!("connected via QUIC");
            Ok(Self {
                conn,
                location: registration.location.clone(),
                config,
            })
        }
        .instrument(span)
        .await
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Sends one request and waits for the node's reply.
    pub async fn request(&self, request: &Request) -> Result<Reply> {
        let buf = request.encode(self.config.compress_threshold)?;
        let (mut tx, mut rx) = self.conn.open_bi().await?;
        tx.write_all(&buf).await?;
        tx.finish().await?;
        let max = self.config.max_frame_len.saturating_add(super::wire::HEADER_LEN);
        let reply = rx.read_to_end(max).await?;
        trace!(sent = buf.len(), received = reply.len(), "round trip");
        Reply::decode(&reply, self.config.max_frame_len)
    }

    pub fn close(&self) {
        self.conn.close(0u32.into(), b"done");
    }
}

#[async_trait]
impl NodeLink for Axon {
    fn location(&self) -> &str {
        &self.location
    }

    async fn setup(&self, setup: SessionSetup) -> Result<()> {
        let request = Request::Setup {
            version: PROTOCOL_VERSION,
            setup,
        };
        match self.request(&request).await? {
            Reply::Ready => Ok(()),
            Reply::Rejected(reason) => Err(Error::config(reason)),
            Reply::Gone(reason) => Err(Error::Disconnected(reason)),
            other => Err(Error::UnexpectedMessage(format!(
                "{:?} in reply to a setup",
                other
            ))),
        }
    }

    async fn dispatch(&self, agent: ComputeAgent) -> Result<AgentContact> {
        let slot = agent.slot as usize;
        let request = Request::Dispatch {
            version: PROTOCOL_VERSION,
            agent,
        };
        match self.request(&request).await? {
            Reply::Enrolled(id) => {
                debug!(id = %id.short_hex(), location = %self.location, "agent enrolled remotely");
                let channel = AxonChannel {
                    axon: self.clone(),
                    agent: id,
                };
                Ok(AgentContact::new(id, slot, self.location.clone(), Arc::new(channel)))
            }
            Reply::Rejected(reason) => Err(Error::config(reason)),
            Reply::Gone(reason) => Err(Error::Disconnected(reason)),
            other => Err(Error::UnexpectedMessage(format!(
                "{:?} in reply to a dispatch",
                other
            ))),
        }
    }
}

#[async_trait]
impl ProxyLink for Axon {
    async fn call(&self, request: ProxyRequest) -> Result<ProxyReply> {
        self.request(&Request::Proxy(request)).await?.into_proxy_reply()
    }
}

struct AxonChannel {
    axon: Axon,
    agent: AgentId,
}

#[async_trait]
impl ContactChannel for AxonChannel {
    async fn send(&self, message: AgentMessage) -> Result<AgentResponse> {
        let request = Request::Send {
            agent: self.agent,
            message,
        };
        self.axon.request(&request).await?.into_response()
    }
}
