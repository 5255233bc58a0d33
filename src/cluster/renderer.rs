use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    agent::{AgentResponse, AgentTemplate, PrepareAction},
    assemble::{ClientAssembler, Composite},
    broadcast::{BroadcastCoordinator, ResolutionVector, SlotState},
    config::ClusterConfig,
    contact::Link,
    error::{Error, Result},
    handle::ClusterDataHandle,
    proxy::{ProxyLink, ProxyReply, ProxyRequest},
    ranges::DataRanges,
    scene::SceneFragment,
};

/// Renders a distributed data handle on the client: drives the workers'
/// agents and composes what they send back.
pub struct ClientRenderer {
    coordinator: BroadcastCoordinator,
    assembler: ClientAssembler,
    resolutions: ResolutionVector,
    display: String,
    /// Last fragment per slot, kept while the slot reports no change.
    cache: Vec<Option<SceneFragment>>,
    revision: watch::Receiver<u64>,
    needs_transform: bool,
}

impl ClientRenderer {
    pub fn new(
        handle: &ClusterDataHandle<Link>,
        template: AgentTemplate,
        config: ClusterConfig,
        display: impl Into<String>,
    ) -> Result<Self> {
        let coordinator = BroadcastCoordinator::new(handle, template, config)?;
        let workers = coordinator.workers();
        Ok(Self {
            coordinator,
            assembler: ClientAssembler::new(),
            resolutions: ResolutionVector::full(workers),
            display: display.into(),
            cache: vec![None; workers],
            revision: handle.subscribe(),
            needs_transform: true,
        })
    }

    pub fn coordinator(&self) -> &BroadcastCoordinator {
        &self.coordinator
    }

    pub fn assembler(&self) -> &ClientAssembler {
        &self.assembler
    }

    pub fn assembler_mut(&mut self) -> &mut ClientAssembler {
        &mut self.assembler
    }

    pub fn resolutions(&self) -> &ResolutionVector {
        &self.resolutions
    }

    /// Asks every worker to rebuild on the next render.
    pub fn request_update(&mut self) {
        self.needs_transform = true;
    }

    /// Installs new strides and re-renders with them.
    pub async fn set_resolutions(&mut self, strides: Vec<i64>) -> Result<Composite> {
        let resolutions = ResolutionVector::new(strides)?;
        if resolutions.len() != self.coordinator.workers() {
            warn!(
                got = resolutions.len(),
                workers = self.coordinator.workers(),
                "resolution vector does not match the workers, using full resolution"
            );
        }
        self.resolutions = resolutions;
        self.needs_transform = true;
        Ok(self.render().await)
    }

    /// One transform round.
    pub async fn render(&mut self) -> Composite {
        if self.revision.has_changed().unwrap_or(false) {
            let revision = *self.revision.borrow_and_update();
            debug!(revision, "client data changed, re-sending agents");
            self.coordinator.invalidate().await;
            self.cache = vec![None; self.coordinator.workers()];
            self.needs_transform = true;
        }
        if self.needs_transform {
            self.coordinator
                .prepare_action(PrepareAction::go(self.display.clone()))
                .await;
            self.needs_transform = false;
        }
        let responses = self.coordinator.transform_responses(&self.resolutions).await;
        for (slot, response) in responses.into_iter().enumerate() {
            match response {
                Some(AgentResponse::Fragment(fragment)) => self.cache[slot] = Some(fragment),
                Some(AgentResponse::Suppressed) | Some(AgentResponse::Delivered) => {}
                Some(AgentResponse::Infeasible(reason)) => {
                    warn!(slot, %reason, "worker could not build its fragment");
                    self.cache[slot] = None;
                }
                _ => self.cache[slot] = None,
            }
        }
        // a retired slot never contributes again
        for (slot, state) in self.coordinator.states().iter().enumerate() {
            if *state == SlotState::Disconnected {
                self.cache[slot] = None;
            }
        }
        let mut composite = self.assembler.assemble(self.cache.clone());
        composite
            .diagnostics
            .extend(self.coordinator.take_diagnostics());
        composite
    }

    pub async fn compute_ranges(&mut self) -> Option<DataRanges> {
        self.coordinator.compute_ranges().await
    }

    pub async fn shutdown(&mut self) {
        self.coordinator.shutdown().await;
    }
}

/// A renderer on the user tier, talking to the cluster only through a
/// proxy, in this process or over QUIC. Losing the proxy makes it
/// infeasible for good.
pub struct UserRenderer {
    proxy: Option<Arc<dyn ProxyLink>>,
    assembler: ClientAssembler,
    display: String,
    infeasible: bool,
}

impl UserRenderer {
    pub fn new(proxy: Arc<dyn ProxyLink>, display: impl Into<String>) -> Self {
        Self {
            proxy: Some(proxy),
            assembler: ClientAssembler::new(),
            display: display.into(),
            infeasible: false,
        }
    }

    pub fn is_infeasible(&self) -> bool {
        self.infeasible
    }

    pub fn assembler_mut(&mut self) -> &mut ClientAssembler {
        &mut self.assembler
    }

    pub async fn render(&mut self) -> Result<Composite> {
        let action = PrepareAction::go(self.display.clone());
        self.call(ProxyRequest::PrepareAction(action)).await?;
        match self.call(ProxyRequest::DoTransform).await? {
            ProxyReply::Fragments(fragments) => Ok(self.assembler.assemble(fragments)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_resolutions(&mut self, strides: Vec<i64>) -> Result<Composite> {
        match self.call(ProxyRequest::SetResolutions(strides)).await? {
            ProxyReply::ResolutionsSet => self.render().await,
            ProxyReply::InvalidResolution(stride) => Err(Error::InvalidResolution(stride)),
            ProxyReply::Failed(reason) => Err(Error::config(reason)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn compute_ranges(&mut self) -> Result<Option<DataRanges>> {
        match self.call(ProxyRequest::ComputeRanges).await? {
            ProxyReply::Ranges(ranges) => Ok(ranges),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.call(ProxyRequest::Shutdown).await?;
        self.proxy = None;
        Ok(())
    }

    async fn call(&mut self, request: ProxyRequest) -> Result<ProxyReply> {
        let proxy = self
            .proxy
            .as_ref()
            .ok_or_else(|| Error::Disconnected("no proxy link".into()))?;
        match proxy.call(request).await {
            Err(e) if e.is_disconnect() => {
                warn!(error = %e, "lost the proxy, renderer is now infeasible");
                self.proxy = None;
                self.infeasible = true;
                Err(e)
            }
            other => other,
        }
    }
}

fn unexpected(reply: ProxyReply) -> Error {
    Error::UnexpectedMessage(format!("{:?}", reply))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::{
        agent::{AxisMapping, DisplayAxis, RenderStyle},
        grid::{Field, Grid3, NodeData},
        handle::Capability,
        net::{local::LocalLink, registry::Registry},
        node::{DataSource, Node},
        partition::{LinearAxis, SpatialPartition},
        proxy::ProxyAgent,
        space::{CoordSpace, Point},
        table::ClusterTable,
        testkit::{cube, local_cluster, Fixed, Slow},
    };

    fn config(timeout_ms: u64) -> ClusterConfig {
        ClusterConfig::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
    }

    fn quadrants() -> SpatialPartition {
        SpatialPartition::linear(
            CoordSpace::meters(2),
            vec![LinearAxis::new(0., 10., 2), LinearAxis::new(0., 10., 2)],
        )
        .unwrap()
    }

    fn client_handle(table: ClusterTable<Link>) -> ClusterDataHandle<Link> {
        let mut handle = ClusterDataHandle::client();
        handle.setup(Some(quadrants()), Some(table)).unwrap();
        handle
    }

    fn points() -> AgentTemplate {
        AgentTemplate::new("render", RenderStyle::Points)
    }

    #[tokio::test]
    async fn four_workers_one_late() {
        let sources = vec![
            cube(2, 0.),
            cube(2, 1.),
            cube(2, 2.),
            Arc::new(Slow(Duration::from_secs(30))) as _,
        ];
        let cluster = local_cluster(sources, config(400));
        let handle = client_handle(cluster.table.clone());
        assert_eq!(handle.capability(), Capability::Distributed);

        let mut renderer = ClientRenderer::new(&handle, points(), config(400), "main").unwrap();
        let composite = renderer.render().await;
        assert_eq!(composite.children().len(), 3);
        assert_eq!(composite.visible().len(), 3);
    }

    #[tokio::test]
    async fn a_single_contributor_is_the_only_child() {
        let sources = vec![
            cube(2, 0.),
            Arc::new(Slow(Duration::from_secs(30))) as _,
            Arc::new(Slow(Duration::from_secs(30))) as _,
            Arc::new(Slow(Duration::from_secs(30))) as _,
        ];
        let cluster = local_cluster(sources, config(300));
        let handle = client_handle(cluster.table.clone());
        let mut renderer = ClientRenderer::new(&handle, points(), config(300), "main").unwrap();
        let composite = renderer.render().await;
        assert_eq!(composite.children().len(), 1);
    }

    #[tokio::test]
    async fn undersized_tables_are_rejected() {
        let cluster = local_cluster(vec![cube(2, 0.); 4], config(1000));
        // drop the fallback slot
        let links: Vec<Link> = cluster.table.iter().take(4).cloned().collect();
        let table = ClusterTable::new(links).unwrap();

        let mut handle = ClusterDataHandle::client();
        let err = handle.setup(Some(quadrants()), Some(table)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let point = Point::new(vec![7.5, 2.5], CoordSpace::meters(2));
        assert!(matches!(handle.owner(&point), Err(Error::Configuration(_))));
        assert!(ClientRenderer::new(&handle, points(), config(1000), "main").is_err());
    }

    #[tokio::test]
    async fn unchanged_slots_keep_their_fragment() {
        let cluster = local_cluster(vec![cube(2, 0.); 4], config(1000));
        let handle = client_handle(cluster.table.clone());
        let mut renderer = ClientRenderer::new(&handle, points(), config(1000), "main").unwrap();
        let first = renderer.render().await;
        assert_eq!(first.children().len(), 4);
        // workers suppress the second round, the cached fragments stand in
        let second = renderer.render().await;
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn resolution_changes_reach_the_workers() {
        let cluster = local_cluster(vec![cube(5, 0.); 4], config(1000));
        let handle = client_handle(cluster.table.clone());
        let mut renderer = ClientRenderer::new(&handle, points(), config(1000), "main").unwrap();
        let full = renderer.render().await;
        assert_eq!(full.visible()[0].geometry.vertex_count(), 125);

        let coarse = renderer.set_resolutions(vec![2, 1, 1, 1]).await.unwrap();
        let counts: Vec<usize> = coarse
            .visible()
            .iter()
            .map(|a| a.geometry.vertex_count())
            .collect();
        assert_eq!(counts, vec![27, 125, 125, 125]);

        assert!(matches!(
            renderer.set_resolutions(vec![0, 1, 1, 1]).await,
            Err(Error::InvalidResolution(0))
        ));
        // a mismatched length falls back to full resolution
        let all = renderer.set_resolutions(vec![3, 3]).await.unwrap();
        assert!(all.visible().iter().all(|a| a.geometry.vertex_count() == 125));
    }

    #[tokio::test]
    async fn client_data_changes_redispatch_agents() {
        let cluster = local_cluster(vec![cube(2, 0.); 4], config(1000));
        let handle = client_handle(cluster.table.clone());
        let mut renderer = ClientRenderer::new(&handle, points(), config(1000), "main").unwrap();
        renderer.render().await;
        assert_eq!(renderer.coordinator().active(), 4);

        handle.set_data(None).await;
        let composite = renderer.render().await;
        assert_eq!(composite.children().len(), 4);
        assert_eq!(renderer.coordinator().active(), 4);
        for node in &cluster.nodes[..4] {
            assert_eq!(node.agents().await.len(), 1);
        }
    }

    #[tokio::test]
    async fn disconnected_workers_drop_out() {
        let cluster = local_cluster(vec![cube(2, 0.); 4], config(1000));
        let handle = client_handle(cluster.table.clone());
        let mut renderer = ClientRenderer::new(&handle, points(), config(1000), "main").unwrap();
        assert_eq!(renderer.render().await.children().len(), 4);

        cluster.links[2].sever();
        renderer.request_update();
        let composite = renderer.render().await;
        assert_eq!(composite.children().len(), 3);
        assert_eq!(renderer.coordinator().states()[2], SlotState::Disconnected);
    }

    #[tokio::test]
    async fn time_sequences_follow_the_animation_control() {
        let grid = Grid3::linear([0.; 3], [1.; 3], [2; 3], CoordSpace::meters(3)).unwrap();
        let steps: Vec<Field> = (0..3)
            .map(|n| Field::from_fn("t", grid.clone(), move |_| n as f32))
            .collect();
        let data = NodeData::sequence("time", vec![0., 60., 120.], steps).unwrap();
        let source: Arc<dyn DataSource> = Arc::new(Fixed(Some(Arc::new(data))));
        let cluster = local_cluster(vec![source; 4], config(1000));
        let handle = client_handle(cluster.table.clone());
        let template = points().with_map(AxisMapping::new("time", DisplayAxis::Animation));

        let mut renderer = ClientRenderer::new(&handle, template.clone(), config(1000), "main").unwrap();
        // no control registered yet: every fragment is dropped with a diagnostic
        let composite = renderer.render().await;
        assert!(composite.children().is_empty());
        assert_eq!(composite.diagnostics.len(), 4);

        let mut renderer = ClientRenderer::new(&handle, template, config(1000), "main").unwrap();
        renderer.assembler_mut().controls_mut().set("time", 70.);
        let composite = renderer.render().await;
        assert_eq!(composite.children().len(), 4);
        assert_eq!(composite.visible().len(), 4);
    }

    #[tokio::test]
    async fn registry_builds_the_table() {
        let config = config(1000);
        let registry = Registry::new();
        let mut nodes = Vec::new();
        for k in 0..4 {
            let node = Node::new(config.location(k), cube(2, k as f32), config.clone());
            registry
                .bind(config.location(k), Arc::new(LocalLink::new(node.clone())))
                .await;
            nodes.push(node);
        }
        let client_node = Node::new("client", cube(2, 9.), config.clone());
        let table = registry
            .cluster_table(&config, 4, Arc::new(LocalLink::new(client_node)))
            .await
            .unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.fallback().location(), "client");

        let handle = client_handle(table);
        let mut renderer = ClientRenderer::new(&handle, points(), config.clone(), "main").unwrap();
        assert_eq!(renderer.render().await.children().len(), 4);
        let ranges = renderer.compute_ranges().await.unwrap();
        assert_eq!(ranges.get("x"), Some((0., 4.)));

        let missing = registry
            .cluster_table(&config, 5, Arc::new(LocalLink::new(nodes[0].clone())))
            .await;
        assert!(matches!(missing, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn user_renderer_goes_through_the_proxy() {
        let cluster = local_cluster(vec![cube(2, 0.); 4], config(1000));
        let handle = client_handle(cluster.table.clone());
        let coordinator = BroadcastCoordinator::new(&handle, points(), config(1000)).unwrap();
        let (contact, task) = ProxyAgent::new(coordinator).serve();
        let mut user = UserRenderer::new(Arc::new(contact), "main");

        assert_eq!(user.render().await.unwrap().children().len(), 4);
        assert!(user.compute_ranges().await.unwrap().is_some());
        assert!(matches!(
            user.set_resolutions(vec![1, -1, 1, 1]).await,
            Err(Error::InvalidResolution(-1))
        ));
        assert!(!user.is_infeasible());

        task.abort();
        let _ = task.await;
        assert!(user.render().await.unwrap_err().is_disconnect());
        assert!(user.is_infeasible());
        // the link stays dropped
        assert!(user.render().await.unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn proxy_shutdown_stops_agents() {
        let cluster = local_cluster(vec![cube(2, 0.); 4], config(1000));
        let handle = client_handle(cluster.table.clone());
        let coordinator = BroadcastCoordinator::new(&handle, points(), config(1000)).unwrap();
        let (contact, task) = ProxyAgent::new(coordinator).serve();
        let mut user = UserRenderer::new(Arc::new(contact), "main");
        user.render().await.unwrap();
        user.shutdown().await.unwrap();
        task.await.unwrap();
        for node in &cluster.nodes {
            assert!(node.agents().await.is_empty());
        }
    }
}
