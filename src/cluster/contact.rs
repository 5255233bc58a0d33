use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::trace;

use super::{
    agent::{AgentId, AgentMessage, AgentResponse, ComputeAgent},
    error::Result,
    handle::SessionSetup,
};

/// Carries messages to one dispatched agent.
#[async_trait]
pub trait ContactChannel: Send + Sync {
    async fn send(&self, message: AgentMessage) -> Result<AgentResponse>;
}

/// A connection to a node that can accept agents. The in-process and QUIC
/// transports both implement this.
#[async_trait]
pub trait NodeLink: Send + Sync {
    /// Registry name of the node behind this link.
    fn location(&self) -> &str;

    /// Installs the client's partition and table on the node.
    async fn setup(&self, setup: SessionSetup) -> Result<()>;

    /// Ships `agent` to the node and starts it there.
    async fn dispatch(&self, agent: ComputeAgent) -> Result<AgentContact>;
}

pub type Link = Arc<dyn NodeLink>;

/// The client's handle to a running agent.
#[derive(Clone)]
pub struct AgentContact {
    agent: AgentId,
    slot: usize,
    location: String,
    channel: Arc<dyn ContactChannel>,
}

impl AgentContact {
    pub fn new(
        agent: AgentId,
        slot: usize,
        location: impl Into<String>,
        channel: Arc<dyn ContactChannel>,
    ) -> Self {
        Self {
            agent,
            slot,
            location: location.into(),
            channel,
        }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn send(&self, message: AgentMessage) -> Result<AgentResponse> {
        trace!(slot = self.slot, agent = %self.agent, op = message.op(), "send");
        self.channel.send(message).await
    }
}

impl fmt::Debug for AgentContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContact")
            .field("agent", &self.agent)
            .field("slot", &self.slot)
            .field("location", &self.location)
            .finish()
    }
}
