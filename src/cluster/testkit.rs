//! In-process clusters for tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{
    config::ClusterConfig,
    contact::Link,
    error::Result,
    grid::{Field, Grid3, NodeData},
    net::local::LocalLink,
    node::{DataSource, Node},
    space::CoordSpace,
    table::ClusterTable,
};

/// Routes spans and events at debug and above to the test harness's
/// captured output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub struct Fixed(pub Option<Arc<NodeData>>);

#[async_trait]
impl DataSource for Fixed {
    async fn load(&self) -> Result<Option<Arc<NodeData>>> {
        Ok(self.0.clone())
    }
}

/// Never answers within any reasonable deadline.
pub struct Slow(pub Duration);

#[async_trait]
impl DataSource for Slow {
    async fn load(&self) -> Result<Option<Arc<NodeData>>> {
        tokio::time::sleep(self.0).await;
        Ok(None)
    }
}

/// An `n³` cube spanning `offset ..= offset + n - 1` on every axis.
pub fn cube_data(n: usize, offset: f32) -> NodeData {
    let last = offset + (n - 1) as f32;
    let grid = Grid3::linear([offset; 3], [last; 3], [n; 3], CoordSpace::meters(3))
        .expect("valid grid");
    NodeData::Field(Field::from_fn("t", grid, |p| p[0] + p[1] + p[2]))
}

pub fn cube(n: usize, offset: f32) -> Arc<dyn DataSource> {
    Arc::new(Fixed(Some(Arc::new(cube_data(n, offset)))))
}

pub struct LocalCluster {
    /// Worker nodes, then the client's own node in the fallback slot.
    pub nodes: Vec<Arc<Node>>,
    pub links: Vec<LocalLink>,
    pub table: ClusterTable<Link>,
}

/// One node per source plus an empty fallback node.
pub fn local_cluster(sources: Vec<Arc<dyn DataSource>>, config: ClusterConfig) -> LocalCluster {
    init_tracing();
    let workers = sources.len();
    let mut nodes: Vec<Arc<Node>> = sources
        .into_iter()
        .enumerate()
        .map(|(k, source)| Node::new(config.location(k), source, config.clone()))
        .collect();
    nodes.push(Node::new("client", Arc::new(Fixed(None)), config));
    let links: Vec<LocalLink> = nodes.iter().cloned().map(LocalLink::new).collect();
    let table = ClusterTable::new(
        links
            .iter()
            .map(|l| Arc::new(l.clone()) as Link)
            .collect(),
    )
    .expect("non-empty table");
    assert_eq!(table.len(), workers + 1);
    LocalCluster {
        nodes,
        links,
        table,
    }
}
