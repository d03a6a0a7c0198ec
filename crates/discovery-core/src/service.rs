//! The running discovery service.
//!
//! While started, four tasks share the roster: one receives datagrams, one
//! broadcasts requests, one expires stale peers and one rescans the shared
//! folder so the advertised file list stays current.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use landrop_core::{Peer, SharedManifest};
use storage::Storage;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

use crate::announce::{bind_socket, Announcer};
use crate::discover::{handle_datagram, Inbound};
use crate::error::DiscoveryError;
use crate::model::{DiscoveryConfig, DiscoveryEvent, LocalIdentity};
use crate::roster::PeerRoster;

/// Delay before the first roster publication after start.
const INITIAL_PUBLISH_DELAY: Duration = Duration::from_millis(200);

fn lock(roster: &Mutex<PeerRoster>) -> MutexGuard<'_, PeerRoster> {
    roster.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DiscoveryService<S> {
    config: DiscoveryConfig,
    storage: Arc<S>,
    transfer_port: Arc<AtomicU16>,
    manifest: Arc<RwLock<SharedManifest>>,
    roster: Arc<Mutex<PeerRoster>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    tasks: Vec<JoinHandle<()>>,
    bound_port: Option<u16>,
}

impl<S> DiscoveryService<S>
where
    S: Storage + 'static,
{
    pub fn new(
        config: DiscoveryConfig,
        identity: LocalIdentity,
        storage: Arc<S>,
        transfer_port: u16,
    ) -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let roster = PeerRoster::new(identity, config.peer_timeout());
        let service = Self {
            config,
            storage,
            transfer_port: Arc::new(AtomicU16::new(transfer_port)),
            manifest: Arc::new(RwLock::new(SharedManifest::default())),
            roster: Arc::new(Mutex::new(roster)),
            events,
            tasks: Vec::new(),
            bound_port: None,
        };
        (service, rx)
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// UDP port actually bound while running.
    pub fn local_port(&self) -> Option<u16> {
        self.bound_port
    }

    pub fn peers(&self) -> Vec<Peer> {
        lock(&self.roster).peers().to_vec()
    }

    pub fn identity(&self) -> LocalIdentity {
        lock(&self.roster).identity().clone()
    }

    pub fn manifest(&self) -> SharedManifest {
        self.manifest.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Advertise a new transfer port from the next datagram on.
    pub fn set_transfer_port(&self, port: u16) {
        self.transfer_port.store(port, Ordering::Relaxed);
    }

    /// Point the shared folder somewhere else and rescan it right away.
    pub async fn set_shared_root(&self, path: PathBuf) -> Result<(), DiscoveryError> {
        tracing::info!("Shared folder is now {}", path.display());
        self.storage.set_shared_dir(path);
        rescan(self.storage.as_ref(), &self.manifest).await?;
        Ok(())
    }

    pub async fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.is_running() {
            return Ok(());
        }

        lock(&self.roster).clear();
        if let Err(e) = rescan(self.storage.as_ref(), &self.manifest).await {
            tracing::warn!("{}", e);
        }

        let socket = match bind_socket(self.config.discovery_port) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                tracing::warn!("Discovery not started: {}", e);
                return Err(e);
            }
        };
        let port = socket
            .local_addr()
            .map_err(|source| DiscoveryError::Bind { port: self.config.discovery_port, source })?
            .port();

        let hostname = lock(&self.roster).identity().hostname.clone();
        let announcer = Announcer::new(
            socket.clone(),
            port,
            self.transfer_port.clone(),
            hostname,
            self.manifest.clone(),
            self.config.broadcast_mode,
        );
        announcer.broadcast().await;

        self.tasks = vec![
            tokio::spawn(receive_loop(socket, announcer.clone(), self.roster.clone(), self.events.clone())),
            tokio::spawn(broadcast_loop(announcer, self.config.broadcast_interval())),
            tokio::spawn(cleanup_loop(
                self.roster.clone(),
                self.events.clone(),
                self.config.cleanup_interval(),
            )),
            tokio::spawn(rescan_loop(
                self.storage.clone(),
                self.manifest.clone(),
                self.config.rescan_interval(),
            )),
            tokio::spawn(publish_later(self.roster.clone(), self.events.clone())),
        ];
        self.bound_port = Some(port);

        tracing::info!("Discovery started on UDP port {}", port);
        let _ = self.events.send(DiscoveryEvent::Started);
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.bound_port = None;
        lock(&self.roster).clear();

        tracing::info!("Discovery stopped");
        let _ = self.events.send(DiscoveryEvent::Stopped);
    }
}

impl<S> Drop for DiscoveryService<S> {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn rescan<S>(storage: &S, manifest: &RwLock<SharedManifest>) -> Result<(), DiscoveryError>
where
    S: Storage + ?Sized,
{
    let scanned = SharedManifest::scan(storage).await?;
    tracing::debug!("Shared folder: {}", scanned.summary());
    *manifest.write().unwrap_or_else(|e| e.into_inner()) = scanned;
    Ok(())
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    announcer: Announcer,
    roster: Arc<Mutex<PeerRoster>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, from): (usize, SocketAddr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms.
                tracing::debug!("Discovery receive failed: {}", e);
                continue;
            }
        };

        let (outcome, snapshot) = {
            let mut roster = lock(&roster);
            let outcome = handle_datagram(&mut roster, &buf[..n], from, Instant::now());
            (outcome, roster.peers().to_vec())
        };

        if let Inbound::Recorded { reply_to, .. } = outcome {
            let _ = events.send(DiscoveryEvent::PeersUpdated(snapshot));
            if let Some(to) = reply_to {
                announcer.respond(to).await;
            }
        }
    }
}

async fn broadcast_loop(announcer: Announcer, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        announcer.broadcast().await;
    }
}

async fn cleanup_loop(
    roster: Arc<Mutex<PeerRoster>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let (removed, snapshot) = {
            let mut roster = lock(&roster);
            let removed = roster.expire(Instant::now());
            (removed, roster.peers().to_vec())
        };
        if removed.is_empty() {
            continue;
        }
        for peer in &removed {
            tracing::info!("Peer {} ({}) went away", peer.hostname, peer.ip);
        }
        let _ = events.send(DiscoveryEvent::PeersUpdated(snapshot));
    }
}

async fn rescan_loop<S>(storage: Arc<S>, manifest: Arc<RwLock<SharedManifest>>, period: Duration)
where
    S: Storage + 'static,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if let Err(e) = rescan(storage.as_ref(), &manifest).await {
            tracing::warn!("{}", e);
        }
    }
}

async fn publish_later(roster: Arc<Mutex<PeerRoster>>, events: mpsc::UnboundedSender<DiscoveryEvent>) {
    sleep(INITIAL_PUBLISH_DELAY).await;
    let snapshot = lock(&roster).peers().to_vec();
    let _ = events.send(DiscoveryEvent::PeersUpdated(snapshot));
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::LocalStorage;
    use tempfile::TempDir;
    use tokio::time::timeout;

    struct Fixture {
        temp: TempDir,
        service: DiscoveryService<LocalStorage>,
        events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        port: u16,
        peer: UdpSocket,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp.path().join("in"), temp.path().join("shared")));
        let config = DiscoveryConfig {
            discovery_port: 0,
            ..DiscoveryConfig::default()
        };
        // Loopback traffic must not look like our own.
        let identity = LocalIdentity::new("test-host", vec![]);
        let (mut service, events) = DiscoveryService::new(config, identity, storage, 5556);
        service.start().await.unwrap();
        let port = service.local_port().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Fixture { temp, service, events, port, peer }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> DiscoveryEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for discovery event")
            .expect("event channel closed")
    }

    /// Skip events until the roster contains a peer called `hostname`.
    async fn wait_for_peer(events: &mut mpsc::UnboundedReceiver<DiscoveryEvent>, hostname: &str) -> Vec<Peer> {
        loop {
            if let DiscoveryEvent::PeersUpdated(peers) = next_event(events).await {
                if peers.iter().any(|p| p.hostname == hostname) {
                    return peers;
                }
            }
        }
    }

    async fn send(fx: &Fixture, datagram: &str) {
        fx.peer
            .send_to(datagram.as_bytes(), ("127.0.0.1", fx.port))
            .await
            .unwrap();
    }

    async fn recv(peer: &UdpSocket) -> Option<String> {
        let mut buf = [0u8; 4096];
        let (n, _) = timeout(Duration::from_millis(500), peer.recv_from(&mut buf)).await.ok()?.ok()?;
        Some(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    #[tokio::test]
    async fn test_request_gets_response_and_is_recorded() {
        let mut fx = fixture().await;
        assert_eq!(next_event(&mut fx.events).await, DiscoveryEvent::Started);

        let peer_port = fx.peer.local_addr().unwrap().port();
        send(&fx, &format!("LANDROP_DISCOVERY_V1|{}|7000|laptop|[]", peer_port)).await;

        let reply = recv(&fx.peer).await.expect("no discovery response");
        assert_eq!(reply, format!("LANDROP_RESPONSE_V1|{}|5556|test-host|[]", fx.port));

        let peers = wait_for_peer(&mut fx.events, "laptop").await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(peers[0].transfer_port, 7000);
        assert_eq!(peers[0].transfer_addr(), "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_response_is_not_answered() {
        let mut fx = fixture().await;
        let peer_port = fx.peer.local_addr().unwrap().port();
        send(&fx, &format!("LANDROP_RESPONSE_V1|{}|7000|laptop|[]", peer_port)).await;

        wait_for_peer(&mut fx.events, "laptop").await;
        assert_eq!(recv(&fx.peer).await, None);
    }

    #[tokio::test]
    async fn test_own_hostname_is_filtered() {
        let fx = fixture().await;
        let peer_port = fx.peer.local_addr().unwrap().port();
        send(&fx, &format!("LANDROP_DISCOVERY_V1|{}|7000|test-host|[]", peer_port)).await;

        assert_eq!(recv(&fx.peer).await, None);
        assert!(fx.service.peers().is_empty());
    }

    #[tokio::test]
    async fn test_advertised_state_follows_updates() {
        let fx = fixture().await;
        let shared = fx.temp.path().join("elsewhere");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::write(shared.join("song.mp3"), b"la la").unwrap();

        fx.service.set_shared_root(shared).await.unwrap();
        fx.service.set_transfer_port(6001);
        assert_eq!(fx.service.manifest().files().len(), 1);

        let peer_port = fx.peer.local_addr().unwrap().port();
        send(&fx, &format!("LANDROP_DISCOVERY_V1|{}|7000|laptop|[]", peer_port)).await;
        let reply = recv(&fx.peer).await.expect("no discovery response");
        assert_eq!(
            reply,
            format!(
                r#"LANDROP_RESPONSE_V1|{}|6001|test-host|[{{"name":"song.mp3","path":"song.mp3","size":"5","type":"file"}}]"#,
                fx.port
            )
        );
    }

    #[tokio::test]
    async fn test_stop_clears_roster() {
        let mut fx = fixture().await;
        let peer_port = fx.peer.local_addr().unwrap().port();
        send(&fx, &format!("LANDROP_RESPONSE_V1|{}|7000|laptop|[]", peer_port)).await;
        wait_for_peer(&mut fx.events, "laptop").await;

        fx.service.stop();
        assert!(!fx.service.is_running());
        assert!(fx.service.peers().is_empty());
        assert_eq!(fx.service.local_port(), None);

        // Second stop is a no-op.
        fx.service.stop();
        let mut stopped = 0;
        while let Ok(event) = fx.events.try_recv() {
            if event == DiscoveryEvent::Stopped {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn test_busy_port_does_not_start() {
        let fx = fixture().await;
        let storage = Arc::new(LocalStorage::new(fx.temp.path().join("a"), fx.temp.path().join("b")));
        let config = DiscoveryConfig {
            discovery_port: fx.port,
            ..DiscoveryConfig::default()
        };
        let (mut second, _events) =
            DiscoveryService::new(config, LocalIdentity::new("other", vec![]), storage, 5556);

        assert!(matches!(second.start().await, Err(DiscoveryError::Bind { .. })));
        assert!(!second.is_running());
    }
}
