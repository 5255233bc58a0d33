//! The node-side runtime: enrolled agents, each driven by its own task.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    agent::{AgentId, AgentMessage, AgentResponse, ComputeAgent},
    config::ClusterConfig,
    depict::{DefaultDepictor, DepictParams, Depictor},
    error::{Error, Result},
    grid::NodeData,
    handle::{ClusterDataHandle, SessionSetup},
    ranges::DataRanges,
    scene::SceneFragment,
    transform::WorkerTransform,
};

/// Where a node's agents get their data from.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// The current data, `None` if there is none. A disconnect error marks
    /// the calling agent's link as failed for good.
    async fn load(&self) -> Result<Option<Arc<NodeData>>>;

    /// Revision counter bumped on every data change, if the source has one.
    fn watch(&self) -> Option<watch::Receiver<u64>> {
        None
    }

    /// Drops whatever caches can be dropped before an out-of-memory retry.
    fn reclaim(&self) {}
}

/// A fragment handed to a node's callback sink instead of being returned.
#[derive(Debug, Clone)]
pub struct DeliveredFragment {
    pub agent: AgentId,
    pub slot: u32,
    pub fragment: SceneFragment,
}

#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub id: AgentId,
    pub slot: u32,
    pub name: String,
    pub enrolled_at: DateTime<Utc>,
}

type Envelope = (AgentMessage, oneshot::Sender<AgentResponse>);

/// Agent mailboxes are small; a client never has more than one request in
/// flight per agent.
const MAILBOX: usize = 8;

struct Enrolled {
    tx: mpsc::Sender<Envelope>,
    info: AgentInfo,
}

/// A worker process's view of the session: its data source, its copy of the
/// client's handle, the agents the client has dispatched to it, and an
/// optional callback sink.
pub struct Node {
    location: String,
    source: Arc<dyn DataSource>,
    session: RwLock<Option<Arc<ClusterDataHandle<String>>>>,
    depictor: Arc<dyn Depictor>,
    config: ClusterConfig,
    agents: RwLock<HashMap<AgentId, Enrolled>>,
    callback: RwLock<Option<mpsc::UnboundedSender<DeliveredFragment>>>,
}

impl Node {
    pub fn new(
        location: impl Into<String>,
        source: Arc<dyn DataSource>,
        config: ClusterConfig,
    ) -> Arc<Self> {
        Self::with_depictor(location, source, Arc::new(DefaultDepictor), config)
    }

    pub fn with_depictor(
        location: impl Into<String>,
        source: Arc<dyn DataSource>,
        depictor: Arc<dyn Depictor>,
        config: ClusterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            location: location.into(),
            source,
            session: RwLock::new(None),
            depictor,
            config,
            agents: RwLock::new(HashMap::new()),
            callback: RwLock::new(None),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Mirrors the client's partition and table. A later setup replaces the
    /// earlier one; a rejected setup leaves it in place.
    pub async fn setup(&self, setup: SessionSetup) -> Result<()> {
        let handle = setup.into_handle()?;
        if handle.table().map_or(false, |t| !t.iter().any(|l| *l == self.location)) {
            warn!(location = %self.location, "node is not listed in the session table");
        }
        debug!(
            location = %self.location,
            token = ?handle.token(),
            capability = ?handle.capability(),
            "session set up"
        );
        *self.session.write().await = Some(Arc::new(handle));
        Ok(())
    }

    /// This node's copy of the client handle, once set up.
    pub async fn session(&self) -> Option<Arc<ClusterDataHandle<String>>> {
        self.session.read().await.clone()
    }

    /// From now on, fragments built by this node's agents go to the returned
    /// receiver and transforms answer `Delivered`.
    pub async fn register_callback(&self) -> mpsc::UnboundedReceiver<DeliveredFragment> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.callback.write().await = Some(tx);
        rx
    }

    /// Starts running `agent`. Re-enrolling an id replaces the old instance.
    pub async fn enroll(self: &Arc<Self>, agent: ComputeAgent) -> Result<AgentId> {
        let id = agent.id;
        let info = AgentInfo {
            id,
            slot: agent.slot,
            name: agent.name.clone(),
            enrolled_at: Utc::now(),
        };
        let (tx, rx) = mpsc::channel(MAILBOX);
        let runner = AgentRunner {
            params: DepictParams::from(&agent),
            transform: WorkerTransform::new(&self.config),
            revision: self.source.watch(),
            node: Arc::downgrade(self),
            agent,
        };
        let span = debug_span!("agent", slot = info.slot, location = %self.location, id = %id);
        tokio::spawn(runner.run(rx).instrument(span));
        if let Some(old) = self.agents.write().await.insert(id, Enrolled { tx, info }) {
            debug!(id = %old.info.id, "replaced enrolled agent");
        }
        debug!(id = %id, location = %self.location, "agent enrolled");
        Ok(id)
    }

    /// Hands `message` to an enrolled agent and waits for its answer.
    pub async fn deliver(&self, id: &AgentId, message: AgentMessage) -> Result<AgentResponse> {
        let tx = self
            .agents
            .read()
            .await
            .get(id)
            .map(|e| e.tx.clone())
            .ok_or_else(|| Error::Disconnected(format!("agent {} is not enrolled", id)))?;
        let stop = matches!(message, AgentMessage::Stop);
        trace!(id = %id, op = message.op(), "delivering");
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((message, reply_tx))
            .await
            .map_err(|_| Error::Disconnected(format!("agent {} has stopped", id)))?;
        let response = reply_rx
            .await
            .map_err(|_| Error::Disconnected(format!("agent {} dropped the request", id)))?;
        if stop {
            self.agents.write().await.remove(id);
        }
        Ok(response)
    }

    pub async fn agents(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<_> = self
            .agents
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by_key(|i| i.slot);
        infos
    }

    async fn callback(&self) -> Option<mpsc::UnboundedSender<DeliveredFragment>> {
        self.callback.read().await.clone()
    }
}

/// Owns one agent's state; lives in its own task until `Stop` or until the
/// node drops its mailbox.
struct AgentRunner {
    agent: ComputeAgent,
    params: DepictParams,
    transform: WorkerTransform,
    revision: Option<watch::Receiver<u64>>,
    node: Weak<Node>,
}

impl AgentRunner {
    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some((message, reply)) = rx.recv().await {
            let stop = matches!(message, AgentMessage::Stop);
            let response = self.handle(message).await;
            if reply.send(response).is_err() {
                trace!("requester went away before the reply");
            }
            if stop {
                break;
            }
        }
        debug!("agent finished");
    }

    async fn handle(&mut self, message: AgentMessage) -> AgentResponse {
        let Some(node) = self.node.upgrade() else {
            return AgentResponse::Disconnected("node shut down".into());
        };
        match message {
            AgentMessage::PrepareAction(action) => {
                if !action.maps.is_empty() {
                    self.params.maps = action.maps;
                }
                if !action.constants.is_empty() {
                    self.params.constants = action.constants;
                }
                if action.go {
                    self.transform.enable();
                }
                trace!(display = %action.display, go = action.go, "prepared");
                AgentResponse::Prepared
            }
            AgentMessage::Transform { resolution } => {
                self.observe_revision();
                let response = self
                    .transform
                    .run(
                        node.source.as_ref(),
                        node.depictor.as_ref(),
                        &self.params,
                        resolution,
                    )
                    .await;
                for diagnostic in self.transform.take_diagnostics() {
                    warn!(%diagnostic, "transform diagnostic");
                }
                match response {
                    AgentResponse::Fragment(fragment) => match node.callback().await {
                        Some(sink) => {
                            let delivered = DeliveredFragment {
                                agent: self.agent.id,
                                slot: self.agent.slot,
                                fragment,
                            };
                            match sink.send(delivered) {
                                Ok(()) => AgentResponse::Delivered,
                                // sink closed, return it the usual way
                                Err(mpsc::error::SendError(d)) => {
                                    AgentResponse::Fragment(d.fragment)
                                }
                            }
                        }
                        None => AgentResponse::Fragment(fragment),
                    },
                    other => other,
                }
            }
            AgentMessage::ComputeRanges => match node.source.load().await {
                Ok(Some(data)) => AgentResponse::Ranges(data.ranges()),
                Ok(None) => AgentResponse::Ranges(DataRanges::new()),
                Err(e) if e.is_disconnect() => AgentResponse::Disconnected(e.to_string()),
                Err(e) => AgentResponse::Infeasible(e.to_string()),
            },
            AgentMessage::Stop => AgentResponse::Stopped,
        }
    }

    /// A data change since the last transform counts as a `go`.
    fn observe_revision(&mut self) {
        if let Some(rx) = self.revision.as_mut() {
            if rx.has_changed().unwrap_or(false) {
                let revision = *rx.borrow_and_update();
                debug!(revision, "data changed since last transform");
                self.transform.enable();
            }
        }
    }
}
