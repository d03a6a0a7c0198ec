use std::net::SocketAddr;

use landrop_core::wire::{DiscoveryKind, DiscoveryMessage, WireError, PROTOCOL_VERSION};
use landrop_core::Peer;
use tokio::time::Instant;

use crate::roster::PeerRoster;

/// Outcome of one received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Malformed, foreign, another protocol version, or our own.
    Ignored,
    /// The sender was added or refreshed. Requests carry the address the
    /// response should go to.
    Recorded {
        peer: Peer,
        reply_to: Option<SocketAddr>,
    },
}

pub fn handle_datagram(
    roster: &mut PeerRoster,
    payload: &[u8],
    from: SocketAddr,
    now: Instant,
) -> Inbound {
    let text = String::from_utf8_lossy(payload);
    let msg = match DiscoveryMessage::decode(&text) {
        Ok(msg) => msg,
        Err(WireError::NotDiscovery) => return Inbound::Ignored,
        Err(e) => {
            tracing::warn!("Malformed discovery datagram from {}: {}", from, e);
            return Inbound::Ignored;
        }
    };

    if msg.version != PROTOCOL_VERSION {
        tracing::debug!("Ignoring discovery version {} from {}", msg.version, from);
        return Inbound::Ignored;
    }

    let ip = from.ip().to_canonical();
    if roster.is_self(ip, &msg.hostname) {
        return Inbound::Ignored;
    }

    let peer = Peer {
        ip,
        hostname: msg.hostname,
        transfer_port: msg.transfer_port,
        version: msg.version,
        shared_files: msg.shared_files,
    };
    if !roster.record(peer.clone(), now) {
        return Inbound::Ignored;
    }
    tracing::debug!("Heard from {} at {} ({} shared files)", peer.hostname, ip, peer.shared_file_count());

    let reply_to = match msg.kind {
        DiscoveryKind::Request => Some(SocketAddr::new(ip, msg.discovery_port)),
        DiscoveryKind::Response => None,
    };
    Inbound::Recorded { peer, reply_to }
}
