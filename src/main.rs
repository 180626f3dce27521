use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vdrop_lib::commands::{self, parse_peer_addr};
use vdrop_lib::{
    logging, Catalog, Config, Discovery, DiscoverySettings, Node, PeerRegistry, SessionState,
    TransferClient, TransferLimits,
};

#[derive(Parser, Debug)]
#[command(name = "vdrop", version, about = "Drop files to devices on your LAN")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Name shown to other devices
    #[arg(long, global = true)]
    name: Option<String>,

    /// Where received files are stored
    #[arg(long, global = true)]
    received_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Announce this device and accept files until Ctrl-C
    Run {
        /// Extra discovery destinations (IP:PORT) besides broadcast
        #[arg(long = "target")]
        targets: Vec<SocketAddr>,
    },
    /// List devices that answer within the discovery window
    Scan,
    /// Send one file to a device
    Send {
        /// Peer as IP or IP:PORT
        ip: String,
        path: PathBuf,
        /// Name advertised to the peer (defaults to the file's name)
        #[arg(long = "as")]
        file_name: Option<String>,
    },
    /// List received files
    Received,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = logging::init(cli.log_dir.as_deref());

    if let Err(e) = run(cli).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> vdrop_lib::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(name) = cli.name {
        config.display_name = name;
    }
    if let Some(dir) = cli.received_dir {
        config.received_dir = dir;
    }
    config.validate()?;

    match cli.command {
        Command::Run { targets } => {
            config.extra_targets.extend(targets);
            let node = Node::start(config).await?;
            let mut events = node.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) if event.session.state() == SessionState::Completed => {
                            println!(
                                "received {} from {}",
                                event.stored_name.unwrap_or_default(),
                                event.session.peer_address
                            );
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Missed {} transfer events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            node.shutdown().await;
        }
        Command::Scan => {
            // Ephemeral port so a node already running here keeps the
            // well-known one; probe replies come back unicast.
            let mut settings = DiscoverySettings::from(&config);
            settings.transfer_port = 0;
            let discovery = Discovery::bind(
                SocketAddr::new(config.bind_ip, 0),
                PeerRegistry::new(),
                settings,
            )
            .await?;
            let cancel = tokio_util::sync::CancellationToken::new();
            discovery.spawn_listener(cancel.clone());

            let peers = discovery.scan().await;
            cancel.cancel();
            if peers.is_empty() {
                println!("no devices found");
            }
            for peer in &peers {
                println!("{:<24} {}", peer.display_name, peer.address);
            }
        }
        Command::Send {
            ip,
            path,
            file_name,
        } => {
            let addr = parse_peer_addr(&ip, config.transfer_port)?;
            let file_name = file_name
                .or_else(|| {
                    path.file_name()
                        .map(|n| n.to_string_lossy().to_string())
                })
                .ok_or_else(|| vdrop_lib::Error::Config("cannot derive a file name".into()))?;
            let client = TransferClient::new(TransferLimits::from(&config));
            let session = client.send_file(addr, &path, &file_name).await?;
            println!(
                "sent {} ({} bytes) to {}",
                file_name, session.bytes_transferred, addr
            );
        }
        Command::Received => {
            let catalog = Catalog::open(&config.received_dir).await?;
            let files = commands::received_files(&catalog.list());
            if files.is_empty() {
                println!("no files received");
            }
            for file in files {
                let preview = if file.preview.is_empty() { "-" } else { "preview" };
                println!("{:<40} {}", file.name, preview);
            }
        }
    }
    Ok(())
}
