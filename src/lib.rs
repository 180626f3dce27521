pub mod catalog;
pub mod client;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod peer;
pub mod preview;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use catalog::{Catalog, ReceivedEntry};
pub use client::TransferClient;
pub use config::{Config, TransferLimits};
pub use discovery::{Discovery, DiscoverySettings};
pub use error::{Error, Result};
pub use peer::{DiscoveredDevice, Peer};
pub use registry::PeerRegistry;
pub use server::{TransferEvent, TransferServer};
pub use session::{Role, SessionState, TransferSession};

/// A running vdrop instance: discovery, the transfer server, the catalog and
/// an outbound client, with their background tasks.
pub struct Node {
    config: Config,
    registry: PeerRegistry,
    discovery: Arc<Discovery>,
    catalog: Arc<Catalog>,
    client: TransferClient,
    transfer_addr: SocketAddr,
    events: broadcast::Sender<TransferEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Opens the catalog, binds both sockets and starts the listener,
    /// announcer, evictor and accept loop.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let limits = TransferLimits::from(&config);

        let catalog = Arc::new(Catalog::open(&config.received_dir).await?);

        let server = TransferServer::bind(
            SocketAddr::new(config.bind_ip, config.transfer_port),
            catalog.clone(),
            limits.clone(),
        )
        .await?;
        let transfer_addr = server.local_addr()?;
        let events = server.events();

        // Advertise the port we actually got, which differs when configured as 0.
        let mut settings = DiscoverySettings::from(&config);
        settings.transfer_port = transfer_addr.port();
        let registry = PeerRegistry::new();
        let discovery = Discovery::bind(
            SocketAddr::new(config.bind_ip, config.discovery_port),
            registry.clone(),
            settings,
        )
        .await?;

        let cancel = CancellationToken::new();
        let mut tasks = discovery.spawn(cancel.clone());
        tasks.push(server.spawn(cancel.clone()));

        tracing::info!(
            "Node '{}' up: transfers on {}, discovery on {}",
            config.display_name,
            transfer_addr,
            discovery.local_addr()?
        );

        Ok(Self {
            client: TransferClient::new(limits),
            config,
            registry,
            discovery,
            catalog,
            transfer_addr,
            events,
            cancel,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr
    }

    pub fn discovery_addr(&self) -> Result<SocketAddr> {
        self.discovery.local_addr()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn add_discovery_target(&self, addr: SocketAddr) {
        self.discovery.add_target(addr);
    }

    /// Inbound session outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub async fn scan(&self) -> Vec<Peer> {
        self.discovery.scan().await
    }

    pub async fn send_file(
        &self,
        peer: SocketAddr,
        file_path: &Path,
        file_name: &str,
    ) -> Result<TransferSession> {
        self.client.send_file(peer, file_path, file_name).await
    }

    /// Received files, most recent first.
    pub fn received(&self) -> Arc<Vec<ReceivedEntry>> {
        self.catalog.list()
    }

    /// Stops background tasks. In-flight sessions run to completion or time out.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Node '{}' stopped", self.config.display_name);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
