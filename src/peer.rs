use std::net::SocketAddr;
use std::time::Instant;

use serde::Serialize;

/// A device seen on the local network. `address` is the peer's transfer
/// endpoint: the announcement's source IP plus its advertised port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: SocketAddr,
    pub display_name: String,
    pub last_seen: Instant, // for pruning old peers
}

impl Peer {
    pub fn new(address: SocketAddr, display_name: impl Into<String>, last_seen: Instant) -> Self {
        Self {
            address,
            display_name: display_name.into(),
            last_seen,
        }
    }
}

/// What the presentation layer sees for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub ip: String,
    pub name: String,
    pub port: u16,
}

impl From<&Peer> for DiscoveredDevice {
    fn from(peer: &Peer) -> Self {
        Self {
            ip: peer.address.ip().to_string(),
            name: peer.display_name.clone(),
            port: peer.address.port(),
        }
    }
}
