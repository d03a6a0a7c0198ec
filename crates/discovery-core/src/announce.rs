use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use landrop_core::wire::{DiscoveryKind, DiscoveryMessage};
use landrop_core::SharedManifest;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::DiscoveryError;
use crate::model::BroadcastMode;
use crate::net::{broadcast_targets, list_interface_ips_result};

/// Bind the discovery socket exclusively on `port` with broadcast enabled.
pub fn bind_socket(port: u16) -> Result<UdpSocket, DiscoveryError> {
    let bind = |port: u16| -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // No SO_REUSEADDR: a second instance on this host must fail to bind.
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        UdpSocket::from_std(socket.into())
    };
    bind(port).map_err(|source| DiscoveryError::Bind { port, source })
}

/// Builds and sends our discovery datagrams.
#[derive(Debug, Clone)]
pub struct Announcer {
    socket: Arc<UdpSocket>,
    discovery_port: u16,
    transfer_port: Arc<AtomicU16>,
    hostname: String,
    manifest: Arc<RwLock<SharedManifest>>,
    mode: BroadcastMode,
}

impl Announcer {
    pub fn new(
        socket: Arc<UdpSocket>,
        discovery_port: u16,
        transfer_port: Arc<AtomicU16>,
        hostname: String,
        manifest: Arc<RwLock<SharedManifest>>,
        mode: BroadcastMode,
    ) -> Self {
        Self {
            socket,
            discovery_port,
            transfer_port,
            hostname,
            manifest,
            mode,
        }
    }

    pub fn datagram(&self, kind: DiscoveryKind) -> String {
        let manifest = self.manifest.read().unwrap_or_else(|e| e.into_inner());
        DiscoveryMessage::encode_with_json(
            kind,
            self.discovery_port,
            self.transfer_port.load(Ordering::Relaxed),
            &self.hostname,
            manifest.json(),
        )
    }

    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> bool {
        match self.socket.send_to(payload, target).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Discovery send to {} failed: {}", target, e);
                false
            }
        }
    }

    /// Broadcast a request. Returns how many targets the datagram went out to.
    pub async fn broadcast(&self) -> usize {
        let payload = self.datagram(DiscoveryKind::Request);

        let targets = match self.mode {
            BroadcastMode::Global => broadcast_targets(self.mode, &[], self.discovery_port),
            BroadcastMode::PerInterface => match list_interface_ips_result() {
                Ok(ifs) => broadcast_targets(self.mode, &ifs, self.discovery_port),
                Err(e) => {
                    tracing::warn!("Failed to list interfaces: {}", e);
                    broadcast_targets(self.mode, &[], self.discovery_port)
                }
            },
        };

        let mut sent = 0;
        for target in &targets {
            if self.send_to(payload.as_bytes(), *target).await {
                sent += 1;
            }
        }

        // Subnet-directed sends can all fail on odd adapters; try the
        // limited broadcast address once before giving up.
        let global = SocketAddr::from((Ipv4Addr::BROADCAST, self.discovery_port));
        if sent == 0 && !targets.contains(&global) && self.send_to(payload.as_bytes(), global).await {
            sent = 1;
        }

        if sent == 0 {
            tracing::warn!("Discovery broadcast reached no interface");
        }
        sent
    }

    /// Answer a request directly.
    pub async fn respond(&self, to: SocketAddr) -> bool {
        let payload = self.datagram(DiscoveryKind::Response);
        self.send_to(payload.as_bytes(), to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use landrop_core::model::{SharedFile, SharedFileKind};

    #[tokio::test]
    async fn test_datagram_format() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let manifest = SharedManifest::from_files(vec![SharedFile {
            name: "a.txt".into(),
            path: "a.txt".into(),
            size: 3,
            kind: SharedFileKind::File,
        }]);
        let port = Arc::new(AtomicU16::new(5556));
        let announcer = Announcer::new(
            socket,
            12346,
            port.clone(),
            "desk".into(),
            Arc::new(RwLock::new(manifest)),
            BroadcastMode::Global,
        );

        assert_eq!(
            announcer.datagram(DiscoveryKind::Request),
            r#"LANDROP_DISCOVERY_V1|12346|5556|desk|[{"name":"a.txt","path":"a.txt","size":"3","type":"file"}]"#
        );

        port.store(6000, Ordering::Relaxed);
        assert!(announcer
            .datagram(DiscoveryKind::Response)
            .starts_with("LANDROP_RESPONSE_V1|12346|6000|desk|"));
    }

    #[tokio::test]
    async fn test_respond_reaches_peer() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let announcer = Announcer::new(
            socket,
            12346,
            Arc::new(AtomicU16::new(5556)),
            "desk".into(),
            Arc::new(RwLock::new(SharedManifest::default())),
            BroadcastMode::Global,
        );

        assert!(announcer.respond(peer.local_addr().unwrap()).await);
        let mut buf = [0u8; 512];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"LANDROP_RESPONSE_V1|12346|5556|desk|[]");
    }

    #[tokio::test]
    async fn test_exclusive_bind() {
        let first = bind_socket(0).unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(matches!(bind_socket(port), Err(DiscoveryError::Bind { .. })));
    }
}
