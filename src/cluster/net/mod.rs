//! Transports between the client and its nodes.

#[cfg(feature = "quic")]
use std::net::{IpAddr, SocketAddr};

#[cfg(feature = "quic")]
pub mod axon;
#[cfg(feature = "quic")]
pub mod endpoint;
pub mod local;
pub mod registry;
pub mod wire;

/// Converts an IP address and port to a socket address.
#[cfg(feature = "quic")]
fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}
