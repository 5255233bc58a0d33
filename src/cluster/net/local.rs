use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::{
    agent::{AgentId, AgentMessage, AgentResponse, ComputeAgent},
    contact::{AgentContact, ContactChannel, NodeLink},
    error::{Error, Result},
    handle::SessionSetup,
    node::Node,
};

/// A node running in this process. Messages reach agents through the
/// node's channels without serialization.
#[derive(Clone)]
pub struct LocalLink {
    node: Arc<Node>,
    severed: Arc<AtomicBool>,
}

impl LocalLink {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            severed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Cuts the link as if the node had gone away; every contact made
    /// through it fails with a disconnect from now on.
    pub fn sever(&self) {
        debug!(location = %self.node.location(), "link severed");
        self.severed.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.severed.load(Ordering::SeqCst) {
            Err(Error::Disconnected(format!(
                "{} is unreachable",
                self.node.location()
            )))?
        }
        Ok(())
    }
}

#[async_trait]
impl NodeLink for LocalLink {
    fn location(&self) -> &str {
        self.node.location()
    }

    async fn setup(&self, setup: SessionSetup) -> Result<()> {
        self.check()?;
        self.node.setup(setup).await
    }

    async fn dispatch(&self, agent: ComputeAgent) -> Result<AgentContact> {
        self.check()?;
        let slot = agent.slot as usize;
        let id = self.node.enroll(agent).await?;
        let channel = LocalChannel {
            link: self.clone(),
            agent: id,
        };
        Ok(AgentContact::new(
            id,
            slot,
            self.node.location(),
            Arc::new(channel),
        ))
    }
}

struct LocalChannel {
    link: LocalLink,
    agent: AgentId,
}

#[async_trait]
impl ContactChannel for LocalChannel {
    async fn send(&self, message: AgentMessage) -> Result<AgentResponse> {
        self.link.check()?;
        self.link.node.deliver(&self.agent, message).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::{
        agent::{AgentTemplate, RenderStyle},
        config::ClusterConfig,
        handle::{ClusterDataHandle, HandleToken},
    };

    #[tokio::test]
    async fn severed_links_disconnect() {
        let handle = Arc::new(ClusterDataHandle::<()>::node(HandleToken::random()));
        let node = Node::new("cluster-node-0", handle, ClusterConfig::default());
        let link = LocalLink::new(node);
        let agent = AgentTemplate::new("render", RenderStyle::Points).instantiate(
            b"s",
            0,
            Duration::from_secs(1),
        );
        let contact = link.dispatch(agent.clone()).await.unwrap();
        assert_eq!(contact.slot(), 0);
        assert_eq!(contact.location(), "cluster-node-0");
        assert!(matches!(
            contact.send(AgentMessage::ComputeRanges).await,
            Ok(AgentResponse::Ranges(_))
        ));

        link.sever();
        let setup = SessionSetup {
            token: [1; 16],
            partition: None,
            locations: vec!["client".into()],
        };
        assert!(link.setup(setup).await.unwrap_err().is_disconnect());
        assert!(contact.send(AgentMessage::ComputeRanges).await.unwrap_err().is_disconnect());
        assert!(link.dispatch(agent).await.unwrap_err().is_disconnect());
    }
}
