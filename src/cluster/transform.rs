use std::{sync::Arc, time::Duration};

use tracing::{debug, debug_span, warn, Instrument};

use super::{
    agent::AgentResponse,
    config::ClusterConfig,
    depict::{Budget, DepictParams, Depictor},
    error::Result,
    grid::NodeData,
    node::DataSource,
    scene::SceneFragment,
};

/// Per-agent transform state on a node.
///
/// A transform only runs when something has changed since the last one
/// (`dirty`), and never again once the data source has been lost.
#[derive(Debug)]
pub struct WorkerTransform {
    dirty: bool,
    link_failed: bool,
    diagnostics: Vec<String>,
    retry_pause: Duration,
    fragment_budget: usize,
}

impl WorkerTransform {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            dirty: false,
            link_failed: false,
            diagnostics: Vec::new(),
            retry_pause: config.retry_pause,
            fragment_budget: config.fragment_budget,
        }
    }

    /// Marks the next transform as needed.
    pub fn enable(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn link_failed(&self) -> bool {
        self.link_failed
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<String> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Builds this node's fragment at stride `resolution`.
    pub async fn run(
        &mut self,
        source: &dyn DataSource,
        depictor: &dyn Depictor,
        params: &DepictParams,
        resolution: u32,
    ) -> AgentResponse {
        if self.link_failed {
            return AgentResponse::Disconnected("data source was lost".into());
        }
        if !self.dirty {
            return AgentResponse::Suppressed;
        }
        self.dirty = false;

        let span = debug_span!("transform", resolution);
        async {
            let data = match source.load().await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    self.diagnostics.push("no data to depict".into());
                    return AgentResponse::Fragment(SceneFragment::empty());
                }
                Err(e) if e.is_disconnect() => {
                    warn!(error = %e, "data source disconnected");
                    self.link_failed = true;
                    return AgentResponse::Disconnected(e.to_string());
                }
                Err(e) => {
                    self.diagnostics.push(e.to_string());
                    return AgentResponse::Infeasible(e.to_string());
                }
            };

            let data = match resolution {
                0 | 1 => data,
                stride => match data.downsample(stride as usize) {
                    Some(coarse) => {
                        debug!(
                            from = data.sample_count(),
                            to = coarse.sample_count(),
                            "down-sampled"
                        );
                        Arc::new(coarse)
                    }
                    None => data,
                },
            };

            match self.depict(depictor, &data, params) {
                Ok(fragment) => AgentResponse::Fragment(fragment),
                Err(e) if e.is_exhaustion() => {
                    warn!(error = %e, "out of memory, reclaiming and retrying once");
                    source.reclaim();
                    tokio::time::sleep(self.retry_pause).await;
                    match self.depict(depictor, &data, params) {
                        Ok(fragment) => AgentResponse::Fragment(fragment),
                        Err(e) => {
                            self.diagnostics.push(e.to_string());
                            AgentResponse::Infeasible(e.to_string())
                        }
                    }
                }
                Err(e) => {
                    self.diagnostics.push(e.to_string());
                    AgentResponse::Infeasible(e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    fn depict(
        &self,
        depictor: &dyn Depictor,
        data: &NodeData,
        params: &DepictParams,
    ) -> Result<SceneFragment> {
        let mut budget = Budget::new(self.fragment_budget);
        depictor.depict(data, params, &mut budget)
    }
}
