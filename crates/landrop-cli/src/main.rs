use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use discovery_core::net::{list_interface_ips_result, local_ipv4};
use discovery_core::{BroadcastMode, DiscoveryConfig, DiscoveryEvent, DiscoveryService, LocalIdentity};
use landrop_core::{
    BatchDecision, OfferedBatch, Peer, SessionEvent, SessionId, SessionManager, SharedManifest, TransferConfig,
    TransferStatus,
};
use storage::LocalStorage;

#[derive(Parser, Debug)]
#[command(name = "landrop", version, about = "LANDrop LAN File Sharing")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for accepted files
    #[arg(long, global = true)]
    received_dir: Option<PathBuf>,

    /// Directory advertised to peers
    #[arg(long, global = true)]
    shared_dir: Option<PathBuf>,

    /// TCP port for incoming transfers (0 = auto-assign)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// UDP port used for discovery
    #[arg(long, global = true)]
    discovery_port: Option<u16>,

    /// Send one broadcast per interface instead of 255.255.255.255
    #[arg(long, global = true)]
    per_interface: bool,

    /// Hostname to advertise instead of the system one
    #[arg(long, global = true)]
    hostname: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show effective configuration and local identity
    Info,

    /// Receive files and announce this machine
    Listen {
        /// Accept every offered batch without asking
        #[arg(long)]
        accept_all: bool,

        /// Do not run discovery
        #[arg(long)]
        no_discovery: bool,
    },

    /// Discover peers on the local network
    Peers {
        /// Discovery timeout in seconds
        #[arg(long, default_value_t = 6)]
        timeout: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send files to one or more peers
    Send {
        /// File to send (repeatable)
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,

        /// Peer address ip:port (repeatable)
        #[arg(long = "peer", required = true)]
        peers: Vec<SocketAddr>,
    },

    /// Fetch a file from a peer's shared folder
    Download {
        /// Peer address ip:port
        #[arg(long)]
        peer: SocketAddr,

        /// Path relative to the peer's shared folder
        #[arg(long)]
        path: String,

        /// File name to expect (defaults to the last path component)
        #[arg(long)]
        name: Option<String>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

impl Cli {
    fn transfer_config(&self) -> TransferConfig {
        let mut cfg = TransferConfig::default();
        if let Some(dir) = &self.received_dir {
            cfg.received_dir = dir.clone();
        }
        if let Some(dir) = &self.shared_dir {
            cfg.shared_dir = dir.clone();
        }
        if let Some(port) = self.port {
            cfg.transfer_port = port;
        }
        cfg
    }

    fn discovery_config(&self) -> DiscoveryConfig {
        let mut cfg = DiscoveryConfig::default();
        if let Some(port) = self.discovery_port {
            cfg.discovery_port = port;
        }
        if self.per_interface {
            cfg.broadcast_mode = BroadcastMode::PerInterface;
        }
        cfg
    }

    fn identity(&self) -> LocalIdentity {
        let detected = LocalIdentity::detect();
        match &self.hostname {
            Some(name) => LocalIdentity::new(name.clone(), detected.addresses),
            None => detected,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let transfer = cli.transfer_config();
    let discovery = cli.discovery_config();

    match &cli.cmd {
        Commands::Info => show_info(&cli, &transfer, &discovery).await?,

        Commands::Listen { accept_all, no_discovery } => {
            listen(&cli, transfer, discovery, *accept_all, *no_discovery).await?;
        }

        Commands::Peers { timeout, json } => {
            discover_peers(&cli, transfer, discovery, *timeout, *json).await?;
        }

        Commands::Send { files, peers } => {
            // Outbound only; keep clear of a listener on the same machine.
            let transfer = TransferConfig { transfer_port: 0, ..transfer };
            send_files(transfer, files.clone(), peers.clone()).await?;
        }

        Commands::Download { peer, path, name, timeout } => {
            let transfer = TransferConfig { transfer_port: 0, ..transfer };
            let name = name.clone().unwrap_or_else(|| {
                path.rsplit('/').next().unwrap_or(path.as_str()).to_string()
            });
            download(transfer, *peer, path, &name, Duration::from_secs(*timeout)).await?;
        }
    }

    Ok(())
}

fn open_storage(cfg: &TransferConfig) -> Result<Arc<LocalStorage>> {
    cfg.ensure_dirs().context("Failed to create transfer directories")?;
    Ok(Arc::new(LocalStorage::new(
        cfg.received_dir.clone(),
        cfg.shared_dir.clone(),
    )))
}

async fn start_manager(cfg: &TransferConfig) -> Result<(SessionManager, mpsc::UnboundedReceiver<SessionEvent>)> {
    let storage = open_storage(cfg)?;
    SessionManager::start(cfg.clone(), storage)
        .await
        .context("Failed to start receiver")
}

async fn show_info(cli: &Cli, transfer: &TransferConfig, discovery: &DiscoveryConfig) -> Result<()> {
    let identity = cli.identity();
    let interfaces = list_interface_ips_result()?;

    println!("Device Information:");
    println!("  Hostname: {}", identity.hostname);
    match local_ipv4(&interfaces) {
        Some(ip) => println!("  LAN address: {}", ip),
        None => println!("  LAN address: none found"),
    }
    println!("  Interfaces:");
    for iface in &interfaces {
        let marker = if iface.is_loopback { " (loopback)" } else { "" };
        println!("    {} {} {}{}", iface.name, iface.family, iface.ip, marker);
    }
    let storage = open_storage(transfer)?;
    let manifest = SharedManifest::scan(storage.as_ref()).await?;
    println!("  Shared folder: {} ({})", transfer.shared_dir.display(), manifest.summary());
    println!("Transfer configuration:");
    println!("{}", serde_json::to_string_pretty(transfer)?);
    println!("Discovery configuration:");
    println!("{}", serde_json::to_string_pretty(discovery)?);
    Ok(())
}

/// Prints progress in 10% steps so large transfers stay readable.
#[derive(Default)]
struct ProgressPrinter {
    last: HashMap<SessionId, u8>,
    names: HashMap<SessionId, String>,
}

impl ProgressPrinter {
    fn created(&mut self, id: SessionId, name: &str) {
        self.names.insert(id, name.to_string());
    }

    fn progress(&mut self, id: SessionId, progress: u8) {
        let step = progress / 10 * 10;
        let last = self.last.entry(id).or_insert(0);
        if step > *last {
            *last = step;
            let name = self.names.get(&id).map(String::as_str).unwrap_or("?");
            println!("    {} {}: {}%", id, name, step);
        }
    }

    fn status(&mut self, id: SessionId, status: TransferStatus) {
        let name = self.names.get(&id).cloned().unwrap_or_default();
        match status {
            TransferStatus::Finished => println!("✓ {} {} finished", id, name),
            TransferStatus::Cancelled => println!("✗ {} {} cancelled", id, name),
            TransferStatus::Error => println!("✗ {} {} failed", id, name),
            TransferStatus::InProgress => println!("→ {} {} in progress", id, name),
            TransferStatus::Waiting => {}
        }
        if status.is_terminal() {
            self.last.remove(&id);
            self.names.remove(&id);
        }
    }
}

fn print_batch(batch: &OfferedBatch) {
    println!("\n← Incoming {} ({} file(s)):", batch.id, batch.files.len());
    for file in &batch.files {
        println!("    {} ({} bytes) from {}", file.file_name, file.file_size, file.peer.ip());
    }
}

async fn ask_accept(count: usize) -> Result<bool> {
    let prompt = format!("  Accept {} file(s)? [y/N] ", count);
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        use std::io::Write;
        print!("{}", prompt);
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
    })
    .await??;
    Ok(answer)
}

/// Ask about `batch` off the event loop so progress and Ctrl+C keep flowing.
async fn decide_batch(
    manager: SessionManager,
    batch: OfferedBatch,
    accept_all: bool,
    prompt: Arc<tokio::sync::Mutex<()>>,
) {
    let accept = if accept_all {
        true
    } else {
        let _turn = prompt.lock().await;
        match ask_accept(batch.files.len()).await {
            Ok(accept) => accept,
            Err(e) => {
                tracing::warn!("Could not read answer for {}: {:#}", batch.id, e);
                false
            }
        }
    };

    let decision = if accept {
        BatchDecision::accept_all(&batch)
    } else {
        BatchDecision::RejectAll
    };
    if let Err(e) = manager.resolve_batch(batch.id, decision).await {
        println!("✗ {}: {}", batch.id, e);
    }
}

fn print_peers(peers: &[Peer]) {
    println!("Discovered {} peer(s):", peers.len());
    for peer in peers {
        println!("\n  {} @ {}", peer.hostname, peer.transfer_addr());
        println!("    Version: {}", peer.version);
        if peer.has_shared_files() {
            println!("    Shared files:");
            for file in &peer.shared_files {
                println!("      - {} ({} bytes)", file.path, file.size);
            }
        }
    }
}

async fn listen(
    cli: &Cli,
    transfer: TransferConfig,
    discovery: DiscoveryConfig,
    accept_all: bool,
    no_discovery: bool,
) -> Result<()> {
    let storage = open_storage(&transfer)?;
    let (manager, mut sessions) = SessionManager::start(transfer.clone(), storage.clone())
        .await
        .context("Failed to start receiver")?;
    let port = manager.receiver_port().await?;

    let (mut service, mut peers) =
        DiscoveryService::new(discovery, cli.identity(), storage, port);
    if !no_discovery {
        if let Err(e) = service.start().await {
            println!("✗ Discovery unavailable: {}", e);
        }
    }

    println!("✓ Listening on port {}", port);
    println!("  Received files: {}", transfer.received_dir.display());
    println!("  Shared folder: {}", transfer.shared_dir.display());
    println!("  Press Ctrl+C to stop");

    let mut printer = ProgressPrinter::default();
    // One prompt on stdin at a time.
    let prompt = Arc::new(tokio::sync::Mutex::new(()));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = sessions.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::SessionCreated(s) => printer.created(s.id, &s.name),
                    SessionEvent::ProgressUpdated { id, progress } => printer.progress(id, progress),
                    SessionEvent::StatusChanged { id, status } => printer.status(id, status),
                    SessionEvent::BatchOffered(batch) => {
                        print_batch(&batch);
                        tokio::spawn(decide_batch(manager.clone(), batch, accept_all, prompt.clone()));
                    }
                }
            }
            Some(event) = peers.recv() => match event {
                DiscoveryEvent::PeersUpdated(list) => {
                    tracing::info!("{} peer(s) on the network", list.len());
                    for peer in &list {
                        tracing::debug!("  {} @ {}", peer.hostname, peer.transfer_addr());
                    }
                }
                DiscoveryEvent::Started => tracing::info!("Discovery running"),
                DiscoveryEvent::Stopped => tracing::info!("Discovery stopped"),
            },
        }
    }

    service.stop();
    println!("✓ Stopped");
    Ok(())
}

async fn discover_peers(
    cli: &Cli,
    transfer: TransferConfig,
    discovery: DiscoveryConfig,
    timeout: u64,
    json: bool,
) -> Result<()> {
    let storage = open_storage(&transfer)?;
    let (mut service, _events) =
        DiscoveryService::new(discovery, cli.identity(), storage, transfer.transfer_port);
    service.start().await.context("Failed to start discovery")?;

    tokio::time::sleep(Duration::from_secs(timeout)).await;
    let peers = service.peers();
    service.stop();

    if json {
        println!("{}", serde_json::to_string_pretty(&peers)?);
    } else {
        print_peers(&peers);
    }
    Ok(())
}

async fn send_files(transfer: TransferConfig, files: Vec<PathBuf>, peers: Vec<SocketAddr>) -> Result<()> {
    let (manager, mut events) = start_manager(&transfer).await?;

    println!("Sending {} file(s) to {} peer(s)...", files.len(), peers.len());
    let ids = manager.send_files(files, peers).await?;
    let mut pending: HashSet<SessionId> = ids.iter().copied().collect();
    let mut failed = 0;

    let mut printer = ProgressPrinter::default();
    while !pending.is_empty() {
        let Some(event) = events.recv().await else { break };
        match event {
            SessionEvent::SessionCreated(s) => printer.created(s.id, &s.name),
            SessionEvent::ProgressUpdated { id, progress } => printer.progress(id, progress),
            SessionEvent::StatusChanged { id, status } => {
                printer.status(id, status);
                if status.is_terminal() && pending.remove(&id) && status != TransferStatus::Finished {
                    failed += 1;
                }
            }
            SessionEvent::BatchOffered(batch) => {
                manager.resolve_batch(batch.id, BatchDecision::RejectAll).await?;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} transfer(s) did not complete", failed, ids.len());
    }
    println!("✓ All transfers complete");
    Ok(())
}

async fn download(
    transfer: TransferConfig,
    peer: SocketAddr,
    path: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let (manager, mut events) = start_manager(&transfer).await?;

    println!("Requesting {} from {}...", path, peer);
    manager
        .download_remote_file(peer, path, name)
        .await
        .context("Failed to send download request")?;

    let mut printer = ProgressPrinter::default();
    let mut expected: Option<SessionId> = None;

    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::SessionCreated(s) => printer.created(s.id, &s.name),
                SessionEvent::ProgressUpdated { id, progress } => printer.progress(id, progress),
                SessionEvent::BatchOffered(batch) => {
                    let wanted: HashSet<String> = batch
                        .files
                        .iter()
                        .filter(|f| f.file_name == name && f.peer.ip() == peer.ip())
                        .map(|f| f.file_name.clone())
                        .collect();
                    if let Some(file) = batch.files.iter().find(|f| wanted.contains(&f.file_name)) {
                        expected = Some(file.session);
                    }
                    manager.resolve_batch(batch.id, BatchDecision::Accept(wanted)).await?;
                }
                SessionEvent::StatusChanged { id, status } => {
                    printer.status(id, status);
                    if Some(id) == expected && status.is_terminal() {
                        return Ok(status);
                    }
                }
            }
        }
        Err::<TransferStatus, anyhow::Error>(anyhow::anyhow!("Session manager stopped"))
    };

    let status = tokio::time::timeout(timeout, wait)
        .await
        .context("Timed out waiting for the file")??;
    if status != TransferStatus::Finished {
        anyhow::bail!("Download of {} ended as {}", name, status);
    }
    println!("✓ Saved to {}", transfer.received_dir.join(name).display());
    Ok(())
}
