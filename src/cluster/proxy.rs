//! The middle tier between a user-facing renderer and the cluster: a proxy
//! agent on the client host that owns the broadcast coordinator and serves
//! requests over a channel. A QUIC endpoint can expose the same channel to
//! users in other processes.

use async_trait::async_trait;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, debug_span, Instrument};

use super::{
    agent::{AgentResponse, PrepareAction},
    broadcast::{BroadcastCoordinator, ResolutionVector},
    error::{Error, Result},
    ranges::DataRanges,
    scene::SceneFragment,
};

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum ProxyRequest {
    PrepareAction(PrepareAction),
    DoTransform,
    ComputeRanges,
    SetResolutions(Vec<i64>),
    Shutdown,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum ProxyReply {
    Prepared(Vec<Option<AgentResponse>>),
    Fragments(Vec<Option<SceneFragment>>),
    Ranges(Option<DataRanges>),
    ResolutionsSet,
    /// The offending stride of a refused resolution vector.
    InvalidResolution(i64),
    Stopped,
    Failed(String),
}

/// How a user-tier renderer reaches its proxy.
#[async_trait]
pub trait ProxyLink: Send + Sync {
    async fn call(&self, request: ProxyRequest) -> Result<ProxyReply>;
}

type Call = (ProxyRequest, oneshot::Sender<ProxyReply>);

pub struct ProxyAgent {
    coordinator: BroadcastCoordinator,
    resolutions: ResolutionVector,
}

impl ProxyAgent {
    pub fn new(coordinator: BroadcastCoordinator) -> Self {
        let resolutions = ResolutionVector::full(coordinator.workers());
        Self {
            coordinator,
            resolutions,
        }
    }

    pub fn coordinator(&self) -> &BroadcastCoordinator {
        &self.coordinator
    }

    pub async fn handle(&mut self, request: ProxyRequest) -> ProxyReply {
        match request {
            ProxyRequest::PrepareAction(action) => {
                ProxyReply::Prepared(self.coordinator.prepare_action(action).await)
            }
            ProxyRequest::DoTransform => {
                ProxyReply::Fragments(self.coordinator.do_transform(&self.resolutions).await)
            }
            ProxyRequest::ComputeRanges => {
                ProxyReply::Ranges(self.coordinator.compute_ranges().await)
            }
            ProxyRequest::SetResolutions(strides) => match ResolutionVector::new(strides) {
                Ok(resolutions) => {
                    self.resolutions = resolutions;
                    ProxyReply::ResolutionsSet
                }
                Err(Error::InvalidResolution(stride)) => ProxyReply::InvalidResolution(stride),
                Err(e) => ProxyReply::Failed(e.to_string()),
            },
            ProxyRequest::Shutdown => {
                self.coordinator.shutdown().await;
                ProxyReply::Stopped
            }
        }
    }

    /// Moves the proxy onto its own task. The task ends after `Shutdown` or
    /// once every contact is dropped.
    pub fn serve(mut self) -> (ProxyContact, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Call>(16);
        let task = tokio::spawn(
            async move {
                while let Some((request, reply)) = rx.recv().await {
                    let stop = matches!(request, ProxyRequest::Shutdown);
                    let response = self.handle(request).await;
                    let _ = reply.send(response);
                    if stop {
                        break;
                    }
                }
                debug!("proxy finished");
            }
            .instrument(debug_span!("proxy")),
        );
        (ProxyContact { tx }, task)
    }
}

/// The in-process link to a served proxy.
#[derive(Debug, Clone)]
pub struct ProxyContact {
    tx: mpsc::Sender<Call>,
}

#[async_trait]
impl ProxyLink for ProxyContact {
    async fn call(&self, request: ProxyRequest) -> Result<ProxyReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| Error::Disconnected("proxy is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected("proxy dropped the request".into()))
    }
}
