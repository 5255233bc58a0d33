use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use quinn::{Connecting, Connection, RecvStream, SendStream};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    ip_addr_to_socket_addr,
    registry::Registration,
    wire::{Reply, Request, HEADER_LEN, PROTOCOL_VERSION},
};
use crate::cluster::{
    config::ClusterConfig,
    error::{Error, Result},
    node::Node,
    proxy::{ProxyContact, ProxyLink},
};

/// Answers decoded requests on behalf of whatever sits behind an endpoint.
#[async_trait]
trait Service: Send + Sync + 'static {
    fn location(&self) -> &str;

    async fn answer(&self, request: Request) -> Result<Reply>;
}

fn check_version(version: u16) -> Result<()> {
    if version != PROTOCOL_VERSION {
        Err(Error::config(format!(
            "protocol version {} is not {}",
            version, PROTOCOL_VERSION
        )))?
    }
    Ok(())
}

struct NodeService(Arc<Node>);

#[async_trait]
impl Service for NodeService {
    fn location(&self) -> &str {
        self.0.location()
    }

    async fn answer(&self, request: Request) -> Result<Reply> {
        let node = &self.0;
        match request {
            Request::Setup { version, setup } => {
                check_version(version)?;
                node.setup(setup).await?;
                Ok(Reply::Ready)
            }
            Request::Dispatch { version, agent } => {
                check_version(version)?;
                Ok(Reply::Enrolled(node.enroll(agent).await?))
            }
            Request::Send { agent, message } => {
                trace!(id = %agent, op = message.op(), "remote delivery");
                Ok(Reply::Response(node.deliver(&agent, message).await?))
            }
            Request::Proxy(_) => Err(Error::config("no proxy at a node endpoint")),
        }
    }
}

struct ProxyService {
    location: String,
    contact: ProxyContact,
}

#[async_trait]
impl Service for ProxyService {
    fn location(&self) -> &str {
        &self.location
    }

    async fn answer(&self, request: Request) -> Result<Reply> {
        match request {
            Request::Proxy(request) => Ok(Reply::Proxy(self.contact.call(request).await?)),
            _ => Err(Error::config("a proxy endpoint only takes proxy requests")),
        }
    }
}

/// The QUIC server side of a node or of a proxy: accepts connections and
/// answers one request per stream.
pub struct Endpoint {
    ep: quinn::Endpoint,
    service: Arc<dyn Service>,
    cert_der: Vec<u8>,
}

impl Endpoint {
    /// Serves `node` on `ip` at the configured port (0 picks a free one).
    pub fn bind_node(node: Arc<Node>, ip: IpAddr, config: &ClusterConfig) -> Result<Self> {
        Self::bind(Arc::new(NodeService(node)), ip, config)
    }

    /// Serves a proxy's channel to users in other processes.
    pub fn bind_proxy(
        location: impl Into<String>,
        contact: ProxyContact,
        ip: IpAddr,
        config: &ClusterConfig,
    ) -> Result<Self> {
        let service = ProxyService {
            location: location.into(),
            contact,
        };
        Self::bind(Arc::new(service), ip, config)
    }

    /// Binds with a fresh self-signed certificate naming the service's
    /// location.
    fn bind(service: Arc<dyn Service>, ip: IpAddr, config: &ClusterConfig) -> Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec![service.location().to_owned()])?;
        let cert_der = cert.serialize_der()?;
        let key = rustls::PrivateKey(cert.serialize_private_key_der());

        // keep idle client connections open between render rounds
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
        let mut server_config =
            quinn::ServerConfig::with_single_cert(vec![rustls::Certificate(cert_der.clone())], key)?;
        server_config.transport_config(Arc::new(transport_config));

        let ep = quinn::Endpoint::server(server_config, ip_addr_to_socket_addr(ip, config.port))?;
        info!(location = %service.location(), addr = ?ep.local_addr().ok(), "listening");
        tokio::spawn(Self::start_acceptor(ep.clone(), service.clone(), config.clone()));
        Ok(Self {
            ep,
            service,
            cert_der,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.ep.local_addr()?)
    }

    /// What a client needs to reach this endpoint.
    pub fn registration(&self) -> Result<Registration> {
        Ok(Registration {
            location: self.service.location().to_owned(),
            addr: self.local_addr()?,
            cert_der: self.cert_der.clone(),
        })
    }

    pub fn close(&self) {
        self.ep.close(0u32.into(), b"shutting down");
    }

    /// Accepts incoming connections and spawns a task for each. Runs until
    /// the endpoint is closed.
    async fn start_acceptor(ep: quinn::Endpoint, service: Arc<dyn Service>, config: ClusterConfig) {
        while let Some(connecting) = ep.accept().await {
            tokio::spawn(Self::handle_connection(
                connecting,
                service.clone(),
                config.clone(),
            ));
        }
        debug!(location = %service.location(), "acceptor stopped");
    }

    async fn handle_connection(
        connecting: Connecting,
        service: Arc<dyn Service>,
        config: ClusterConfig,
    ) {
        let remote = connecting.remote_address();
        let span = debug_span!("axon", remote = %remote);
        async move {
            let conn: Connection = match connecting.await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "handshake failed");
                    return;
                }
            };
            debug!("client connected");
            loop {
                match conn.accept_bi().await {
                    Ok((tx, rx)) => {
                        tokio::spawn(
                            Self::handle_stream(tx, rx, service.clone(), config.clone())
                                .in_current_span(),
                        );
                    }
                    Err(e) => {
                        debug!(reason = %e, "client went away");
                        break;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_stream(
        mut tx: SendStream,
        mut rx: RecvStream,
        service: Arc<dyn Service>,
        config: ClusterConfig,
    ) {
        let reply = match Self::serve(&mut rx, &*service, &config).await {
            Ok(reply) => reply,
            Err(e) if e.is_disconnect() => Reply::Gone(e.to_string()),
            Err(e) => Reply::Rejected(e.to_string()),
        };
        let result: Result<()> = async {
            let buf = reply.encode(config.compress_threshold)?;
            tx.write_all(&buf).await?;
            tx.finish().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "could not send reply");
        }
    }

    async fn serve(rx: &mut RecvStream, service: &dyn Service, config: &ClusterConfig) -> Result<Reply> {
        let buf = rx
            .read_to_end(config.max_frame_len.saturating_add(HEADER_LEN))
            .await?;
        service
            .answer(Request::decode(&buf, config.max_frame_len)?)
            .await
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::cluster::{
        agent::{AgentMessage, AgentResponse, AgentTemplate, PrepareAction, RenderStyle},
        broadcast::BroadcastCoordinator,
        contact::NodeLink,
        handle::{Capability, ClusterDataHandle, Owner, SessionSetup},
        net::axon::Axon,
        partition::{LinearAxis, SpatialPartition},
        proxy::{ProxyAgent, ProxyRequest},
        renderer::UserRenderer,
        space::{CoordSpace, Point},
        table::ClusterTable,
        testkit::{cube, init_tracing, local_cluster},
    };

    fn config() -> ClusterConfig {
        ClusterConfig::builder()
            .port(0)
            .node_prefix("quic-node-")
            .build()
    }

    fn client() -> quinn::Endpoint {
        init_tracing();
        quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap()
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn agents_run_over_quic() {
        let config = config();
        let node = Node::new(config.location(0), cube(3, 0.), config.clone());
        let endpoint = Endpoint::bind_node(node.clone(), localhost(), &config).unwrap();
        let registration = endpoint.registration().unwrap();
        assert_ne!(registration.addr.port(), 0);

        let client = client();
        let axon = Axon::connect(&client, &registration, config.clone()).await.unwrap();
        let agent = AgentTemplate::new("render", RenderStyle::Points).instantiate(
            b"session",
            0,
            Duration::from_secs(5),
        );
        let contact = axon.dispatch(agent).await.unwrap();
        assert_eq!(node.agents().await.len(), 1);

        let prepared = contact
            .send(AgentMessage::PrepareAction(PrepareAction::go("main")))
            .await
            .unwrap();
        assert_eq!(prepared, AgentResponse::Prepared);
        match contact.send(AgentMessage::Transform { resolution: 1 }).await.unwrap() {
            AgentResponse::Fragment(fragment) => assert_eq!(fragment.appearances().count(), 1),
            other => panic!("unexpected response {:?}", other),
        }

        assert_eq!(contact.send(AgentMessage::Stop).await.unwrap(), AgentResponse::Stopped);
        // the agent is gone, which reads as a disconnect on the client
        let err = contact.send(AgentMessage::ComputeRanges).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn setup_reaches_remote_nodes() {
        let config = config();
        let node = Node::new(config.location(1), cube(2, 0.), config.clone());
        let endpoint = Endpoint::bind_node(node.clone(), localhost(), &config).unwrap();
        let client = client();
        let axon = Axon::connect(&client, &endpoint.registration().unwrap(), config.clone())
            .await
            .unwrap();

        let partition = SpatialPartition::linear(
            CoordSpace::meters(2),
            vec![LinearAxis::new(0., 10., 2), LinearAxis::new(0., 10., 1)],
        )
        .unwrap();
        let mut handle = ClusterDataHandle::<String>::client();
        let locations = vec![config.location(0), config.location(1), "client".to_owned()];
        handle
            .setup(Some(partition), Some(ClusterTable::new(locations).unwrap()))
            .unwrap();
        let setup: SessionSetup = handle.session_setup(String::clone).unwrap();
        axon.setup(setup.clone()).await.unwrap();

        let session = node.session().await.unwrap();
        assert_eq!(session.token(), handle.token());
        assert_eq!(session.capability(), Capability::Partitioned);
        let point = Point::new(vec![9., 3.], CoordSpace::meters(2));
        assert!(matches!(
            session.owner(&point),
            Ok(Owner::Slot { slot: 1, endpoint }) if *endpoint == config.location(1)
        ));

        // a table without a fallback slot is refused, not a disconnect
        let locations = setup.locations[..2].to_vec();
        let err = axon
            .setup(SessionSetup { locations, ..setup })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn closed_nodes_disconnect() {
        let config = config();
        let node = Node::new(config.location(1), cube(2, 0.), config.clone());
        let endpoint = Endpoint::bind_node(node, localhost(), &config).unwrap();
        let client = client();
        let axon = Axon::connect(&client, &endpoint.registration().unwrap(), config.clone())
            .await
            .unwrap();
        endpoint.close();
        let agent = AgentTemplate::new("render", RenderStyle::Points).instantiate(
            b"session",
            1,
            Duration::from_secs(5),
        );
        assert!(axon.dispatch(agent).await.unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn users_reach_a_remote_proxy() {
        let config = config();
        let cluster = local_cluster(vec![cube(2, 0.), cube(2, 1.)], config.clone());
        let coordinator = BroadcastCoordinator::with_table(
            cluster.table.clone(),
            2,
            AgentTemplate::new("render", RenderStyle::Points),
            config.clone(),
        )
        .unwrap();
        let (contact, task) = ProxyAgent::new(coordinator).serve();
        let endpoint = Endpoint::bind_proxy("proxy", contact, localhost(), &config).unwrap();

        let client = client();
        let axon = Axon::connect(&client, &endpoint.registration().unwrap(), config.clone())
            .await
            .unwrap();
        let mut user = UserRenderer::new(Arc::new(axon.clone()), "main");
        assert_eq!(user.render().await.unwrap().children().len(), 2);
        assert!(matches!(
            user.set_resolutions(vec![2, 0]).await,
            Err(Error::InvalidResolution(0))
        ));
        let ranges = user.compute_ranges().await.unwrap().unwrap();
        assert_eq!(ranges.get("x"), Some((0., 2.)));

        // the proxy endpoint does not take node traffic
        let agent = AgentTemplate::new("render", RenderStyle::Points).instantiate(
            b"session",
            0,
            Duration::from_secs(5),
        );
        assert!(matches!(axon.dispatch(agent).await, Err(Error::Configuration(_))));

        user.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(cluster.nodes[0].agents().await.is_empty());
        // the proxy task is gone, which the user sees as a disconnect
        assert!(user.render().await.unwrap_err().is_disconnect());
        assert!(matches!(
            axon.call(ProxyRequest::DoTransform).await,
            Err(Error::Disconnected(_))
        ));
    }
}
