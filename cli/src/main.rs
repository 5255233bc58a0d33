use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use hashbrown::HashMap;
use tracing::info;

use ganglion::cluster::{
    agent::{ConstantMapping, RenderStyle},
    assemble::Composite,
    grid::{Field, Grid3, NodeData},
    handle::{HandleToken, Role},
    net::{endpoint::Endpoint, local::LocalLink, registry::Registry},
    space::CoordSpace,
    AgentTemplate, ClientRenderer, ClusterConfig, ClusterDataHandle, Link,
    Node, Result, SpatialPartition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// Nodes run in this process and share memory with the client.
    Local,
    /// Every node listens on its own loopback QUIC endpoint.
    Quic,
}

#[derive(Parser, Debug)]
#[command(name = "ganglion")]
#[command(about = "Render a synthetic grid spread over a local cluster")]
#[command(version)]
struct Args {
    /// Samples along each grid axis
    #[arg(short, long, default_value = "16")]
    size: usize,

    /// Split the grid into divide x divide worker blocks
    #[arg(short, long, default_value = "2")]
    divide: usize,

    #[arg(short, long, value_enum, default_value = "local")]
    transport: Transport,

    /// Stride applied to worker 0 on the second round
    #[arg(short, long, default_value = "2")]
    resolution: i64,

    /// Per-round deadline in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// Depict as textured slice stacks instead of points
    #[arg(long)]
    volume: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = ClusterConfig::builder()
        .timeout(Duration::from_millis(args.timeout_ms))
        .port(0)
        .build();

    let last = (args.size.max(2) - 1) as f32;
    let grid = Grid3::linear([0.; 3], [last; 3], [args.size.max(2); 3], CoordSpace::meters(3))?;
    let field = Field::from_fn("t", grid.clone(), |[x, y, z]| (x * 0.3).sin() + (y * 0.2).cos() + z * 0.1);
    let partition = SpatialPartition::from_grid_corners(&grid, args.divide)?;
    let workers = partition.size();
    let token = HandleToken::random();

    let registry = Registry::new();
    // endpoints must outlive the session
    let mut endpoints = Vec::new();
    let mut nodes = Vec::new();
    for k in 0..workers {
        // holds the worker's block; the session copy arrives with the setup
        let handle = Arc::new(ClusterDataHandle::<String>::node(token));
        handle
            .set_data(Some(NodeData::Field(field.split(args.divide, k)?)))
            .await;
        let node = Node::new(config.location(k), handle, config.clone());
        nodes.push(node.clone());
        match args.transport {
            Transport::Local => {
                registry
                    .bind(config.location(k), Arc::new(LocalLink::new(node.clone())))
                    .await
            }
            Transport::Quic => {
                let endpoint = Endpoint::bind_node(node.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), &config)?;
                registry.publish(endpoint.registration()?).await;
                endpoints.push(endpoint);
            }
        }
    }
    let client = quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    if args.transport == Transport::Quic {
        let connected = registry.connect_all(&client, &config).await?;
        info!(connected, "connected to nodes");
    }

    // the client's own node owns whatever the partition cannot place
    let own = Node::new(
        "client",
        Arc::new(ClusterDataHandle::<String>::node(token)),
        config.clone(),
    );
    let table = registry
        .cluster_table(&config, workers, Arc::new(LocalLink::new(own)))
        .await?;
    let mut handle = ClusterDataHandle::<Link>::new(Role::Client, token);
    handle.setup(Some(partition), Some(table))?;

    let template = if args.volume {
        AgentTemplate::new("render", RenderStyle::Volume).with_constant(ConstantMapping::Alpha(0.4))
    } else {
        AgentTemplate::new("render", RenderStyle::Points)
    };
    let mut renderer = ClientRenderer::new(&handle, template, config.clone(), "main")?;

    let composite = renderer.render().await;
    summarize("full resolution", &composite);
    for node in &nodes {
        if let Some(session) = node.session().await {
            info!(location = %node.location(), capability = ?session.capability(), "node set up");
        }
    }

    let mut strides = vec![1; workers];
    strides[0] = args.resolution;
    let composite = renderer.set_resolutions(strides).await?;
    summarize("reduced worker 0", &composite);

    if let Some(ranges) = renderer.compute_ranges().await {
        for axis in ["x", "y", "z", "value"] {
            if let Some((lo, hi)) = ranges.get(axis) {
                println!("{:>6}: {:.2} ..= {:.2}", axis, lo, hi);
            }
        }
    }

    renderer.shutdown().await;
    drop(endpoints);
    client.close(0u32.into(), b"done");
    Ok(())
}

fn summarize(label: &str, composite: &Composite) {
    let visible = composite.visible();
    let mut primitives: HashMap<String, usize> = HashMap::new();
    for appearance in &visible {
        *primitives
            .entry(format!("{:?}", appearance.geometry.primitive))
            .or_default() += appearance.geometry.vertex_count();
    }
    println!(
        "{}: {} contributing workers, {} shapes",
        label,
        composite.children().len(),
        visible.len()
    );
    for (primitive, vertices) in &primitives {
        println!("  {:<10} {} vertices", primitive, vertices);
    }
    for diagnostic in &composite.diagnostics {
        println!("  ! {}", diagnostic);
    }
}
