//! LAN presence over UDP broadcast.
//!
//! One socket carries both paths: the passive listener/announcer pair that
//! keeps the registry warm, and `scan()`, which probes and then reads a
//! registry snapshot once the discovery window has elapsed. The two paths
//! share only the registry.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use local_ip_address::local_ip;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::registry::PeerRegistry;

pub const MAGIC: &str = "vdrop";
pub const MAX_PACKET: usize = 1024;
const MAX_NAME_CHARS: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Announce,
    Probe,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub magic: String,
    pub kind: PacketKind,
    pub name: String,
    /// Transfer port of the sender; 0 for scan-only processes.
    pub port: u16,
    pub instance: Uuid,
}

impl DiscoveryPacket {
    pub fn new(kind: PacketKind, name: &str, port: u16, instance: Uuid) -> Self {
        Self {
            magic: MAGIC.to_string(),
            kind,
            name: name.chars().take(MAX_NAME_CHARS).collect(),
            port,
            instance,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = serde_json::to_vec(self)?;
        if data.len() > MAX_PACKET {
            return Err(Error::Protocol(format!(
                "discovery packet is {} bytes",
                data.len()
            )));
        }
        Ok(data)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() > MAX_PACKET {
            return Err(Error::Protocol(format!("oversized packet ({} bytes)", raw.len())));
        }
        let packet: DiscoveryPacket = serde_json::from_slice(raw)
            .map_err(|e| Error::Protocol(format!("malformed packet: {}", e)))?;
        if packet.magic != MAGIC {
            return Err(Error::Protocol(format!("foreign magic {:?}", packet.magic)));
        }
        Ok(packet)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub display_name: String,
    pub transfer_port: u16,
    pub discovery_port: u16,
    pub window: Duration,
    pub peer_ttl: Duration,
    pub announce_interval: Duration,
    pub evict_interval: Duration,
    pub broadcast: bool,
    pub extra_targets: Vec<SocketAddr>,
}

impl From<&Config> for DiscoverySettings {
    fn from(config: &Config) -> Self {
        Self {
            display_name: config.display_name.clone(),
            transfer_port: config.transfer_port,
            discovery_port: config.discovery_port,
            window: config.discovery_window(),
            peer_ttl: config.peer_ttl(),
            announce_interval: config.announce_interval(),
            evict_interval: config.evict_interval(),
            broadcast: config.broadcast,
            extra_targets: config.extra_targets.clone(),
        }
    }
}

pub struct Discovery {
    socket: Arc<UdpSocket>,
    registry: PeerRegistry,
    instance: Uuid,
    settings: DiscoverySettings,
    broadcast_addr: Option<SocketAddr>,
    targets: RwLock<Vec<SocketAddr>>,
}

impl Discovery {
    pub async fn bind(
        bind_addr: SocketAddr,
        registry: PeerRegistry,
        settings: DiscoverySettings,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        if let Err(e) = socket.set_broadcast(true) {
            tracing::warn!("set_broadcast failed: {}", e);
        }

        let broadcast_addr = if settings.broadcast {
            Some(SocketAddr::new(
                IpAddr::V4(subnet_broadcast()),
                settings.discovery_port,
            ))
        } else {
            None
        };
        tracing::info!(
            "Discovery on {} (broadcast to {:?}, {} extra targets)",
            socket.local_addr()?,
            broadcast_addr,
            settings.extra_targets.len()
        );

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            registry,
            instance: Uuid::new_v4(),
            targets: RwLock::new(settings.extra_targets.clone()),
            settings,
            broadcast_addr,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Adds a unicast destination for announcements and probes, for networks
    /// that drop broadcast traffic.
    pub fn add_target(&self, addr: SocketAddr) {
        let mut targets = self.targets.write();
        if !targets.contains(&addr) {
            targets.push(addr);
        }
    }

    /// Starts listener, announcer and evictor.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_listener(cancel.clone()),
            self.spawn_announcer(cancel.clone()),
            self.spawn_evictor(cancel),
        ]
    }

    pub fn spawn_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = this.socket.recv_from(&mut buf) => r,
                };
                match received {
                    Ok((len, from)) => this.handle_packet(&buf[..len], from).await,
                    Err(e) => {
                        tracing::debug!("UDP recv error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            tracing::debug!("Discovery listener stopped");
        })
    }

    fn spawn_announcer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.announce_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let packet = this.packet(PacketKind::Announce);
                this.send_to_all(&packet).await;
            }
        })
    }

    fn spawn_evictor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.evict_interval);
            // First tick fires immediately; nothing can be stale yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let removed = this
                    .registry
                    .evict_expired(std::time::Instant::now(), this.settings.peer_ttl);
                if removed > 0 {
                    tracing::debug!(
                        "Evicted {} stale peers, {} remain",
                        removed,
                        this.registry.len()
                    );
                }
            }
        })
    }

    /// Probes the network, waits out the discovery window and returns the
    /// live peers. Always returns once the window has elapsed.
    pub async fn scan(&self) -> Vec<Peer> {
        let deadline = Instant::now() + self.settings.window;

        let probe = self.packet(PacketKind::Probe);
        match timeout_at(deadline, self.send_to_all(&probe)).await {
            Ok(0) => tracing::warn!("Probe reached no destination; passive results only"),
            Ok(_) => {}
            Err(_) => tracing::warn!("Probe sending overran the discovery window"),
        }

        // Replies land in the registry via the listener task.
        tokio::time::sleep_until(deadline).await;
        let peers = self
            .registry
            .snapshot(std::time::Instant::now(), self.settings.peer_ttl);
        tracing::info!("Scan found {} peers", peers.len());
        peers
    }

    async fn handle_packet(&self, raw: &[u8], from: SocketAddr) {
        let packet = match DiscoveryPacket::decode(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Ignored packet from {}: {}", from, e);
                return;
            }
        };
        // Our own broadcast loops back to us.
        if packet.instance == self.instance {
            return;
        }

        // Port 0 is a scan-only process with nothing to send to.
        if packet.port != 0 {
            let address = SocketAddr::new(from.ip(), packet.port);
            self.registry.upsert(Peer::new(
                address,
                packet.name.clone(),
                std::time::Instant::now(),
            ));
            tracing::debug!("Saw {} ({}) via {:?}", packet.name, address, packet.kind);
        }

        // Answer probes unicast so the scanner hears us within its window
        // instead of waiting for the next periodic announce.
        if packet.kind == PacketKind::Probe && self.settings.transfer_port != 0 {
            let reply = self.packet(PacketKind::Announce);
            self.send_packet(&reply, from).await;
        }
    }

    fn packet(&self, kind: PacketKind) -> DiscoveryPacket {
        DiscoveryPacket::new(
            kind,
            &self.settings.display_name,
            self.settings.transfer_port,
            self.instance,
        )
    }

    fn destinations(&self) -> Vec<SocketAddr> {
        let mut dests: Vec<SocketAddr> = self.broadcast_addr.into_iter().collect();
        for target in self.targets.read().iter() {
            if !dests.contains(target) {
                dests.push(*target);
            }
        }
        dests
    }

    /// Returns how many destinations accepted the packet.
    async fn send_to_all(&self, packet: &DiscoveryPacket) -> usize {
        let mut delivered = 0;
        for dest in self.destinations() {
            if self.send_packet(packet, dest).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn send_packet(&self, packet: &DiscoveryPacket, dest: SocketAddr) -> bool {
        let data = match packet.encode() {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("Cannot encode discovery packet: {}", e);
                return false;
            }
        };
        match self.socket.send_to(&data, dest).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Discovery send to {} failed: {}", dest, e);
                false
            }
        }
    }
}

/// Broadcast address of the local /24, or the limited broadcast address.
fn subnet_broadcast() -> Ipv4Addr {
    match local_ip() {
        Ok(IpAddr::V4(v4)) => Ipv4Network::new(v4, 24)
            .map(|net| net.broadcast())
            .unwrap_or(Ipv4Addr::BROADCAST),
        _ => Ipv4Addr::BROADCAST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(name: &str, transfer_port: u16, window_ms: u64) -> DiscoverySettings {
        DiscoverySettings {
            display_name: name.to_string(),
            transfer_port,
            discovery_port: 0,
            window: Duration::from_millis(window_ms),
            peer_ttl: Duration::from_secs(15),
            announce_interval: Duration::from_millis(50),
            evict_interval: Duration::from_secs(10),
            broadcast: false,
            extra_targets: Vec::new(),
        }
    }

    async fn node(name: &str, transfer_port: u16, window_ms: u64) -> Arc<Discovery> {
        Discovery::bind(
            "127.0.0.1:0".parse().unwrap(),
            PeerRegistry::new(),
            settings(name, transfer_port, window_ms),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_packet_codec() {
        let id = Uuid::new_v4();
        let packet = DiscoveryPacket::new(PacketKind::Probe, &"n".repeat(200), 5005, id);
        assert_eq!(packet.name.len(), MAX_NAME_CHARS);

        let decoded = DiscoveryPacket::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);

        let foreign = br#"{"magic":"other","kind":"announce","name":"x","port":1,"instance":"00000000-0000-0000-0000-000000000000"}"#;
        assert!(DiscoveryPacket::decode(foreign).is_err());
        assert!(DiscoveryPacket::decode(b"garbage").is_err());
        assert!(DiscoveryPacket::decode(&vec![b' '; MAX_PACKET + 1]).is_err());
    }

    #[tokio::test]
    async fn test_scan_with_no_peers_is_bounded() {
        let lonely = node("lonely", 7000, 200).await;
        let cancel = CancellationToken::new();
        lonely.spawn_listener(cancel.clone());

        let started = std::time::Instant::now();
        let peers = lonely.scan().await;
        let elapsed = started.elapsed();

        assert!(peers.is_empty());
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(700), "took {:?}", elapsed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_scan_finds_responders() {
        let cancel = CancellationToken::new();
        let scanner = node("scanner", 7000, 300).await;
        scanner.spawn_listener(cancel.clone());

        for i in 0..5u16 {
            let peer = node(&format!("peer-{}", i), 7100 + i, 300).await;
            peer.spawn_listener(cancel.clone());
            scanner.add_target(peer.local_addr().unwrap());
        }
        // Our own address: self packets must be ignored.
        scanner.add_target(scanner.local_addr().unwrap());

        let started = std::time::Instant::now();
        let peers = scanner.scan().await;
        assert!(started.elapsed() < Duration::from_millis(800));

        let names: Vec<&str> = peers.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["peer-0", "peer-1", "peer-2", "peer-3", "peer-4"]);
        assert!(peers.iter().all(|p| p.address.ip().is_loopback()));
        assert_eq!(peers[2].address.port(), 7102);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_probe_registers_prober_on_responder() {
        let cancel = CancellationToken::new();
        let scanner = node("scanner", 7000, 150).await;
        let responder = node("responder", 7001, 150).await;
        scanner.spawn_listener(cancel.clone());
        responder.spawn_listener(cancel.clone());
        scanner.add_target(responder.local_addr().unwrap());

        scanner.scan().await;
        let seen = responder
            .registry()
            .snapshot(std::time::Instant::now(), Duration::from_secs(15));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].display_name, "scanner");
        assert_eq!(seen[0].address.port(), 7000);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_send_failure_does_not_abort_scan() {
        let cancel = CancellationToken::new();
        let scanner = node("scanner", 7000, 200).await;
        let responder = node("responder", 7001, 200).await;
        scanner.spawn_listener(cancel.clone());
        responder.spawn_listener(cancel.clone());

        // An IPv6 destination cannot be reached from an IPv4 socket.
        scanner.add_target("[::1]:9".parse().unwrap());
        scanner.add_target(responder.local_addr().unwrap());

        let peers = scanner.scan().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name, "responder");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_passive_announcements_fill_registry() {
        let cancel = CancellationToken::new();
        let listener = node("listener", 7000, 200).await;
        let announcer = node("announcer", 7001, 200).await;
        listener.spawn_listener(cancel.clone());
        announcer.add_target(listener.local_addr().unwrap());
        announcer.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let seen = listener
            .registry()
            .snapshot(std::time::Instant::now(), Duration::from_secs(15));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].display_name, "announcer");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_scan_only_process_is_not_registered() {
        let cancel = CancellationToken::new();
        let cli = node("cli", 0, 150).await;
        let responder = node("responder", 7001, 150).await;
        cli.spawn_listener(cancel.clone());
        responder.spawn_listener(cancel.clone());
        cli.add_target(responder.local_addr().unwrap());

        let peers = cli.scan().await;
        assert_eq!(peers.len(), 1);
        assert!(responder.registry().is_empty());
        cancel.cancel();
    }
}
