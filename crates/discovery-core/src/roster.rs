use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use landrop_core::Peer;
use tokio::time::Instant;

use crate::model::LocalIdentity;

/// The set of peers heard from recently.
///
/// A peer is matched by IP or, failing that, by hostname, and replaced in
/// place so the order stays stable for display. Staleness is tracked per IP.
#[derive(Debug)]
pub struct PeerRoster {
    identity: LocalIdentity,
    timeout: Duration,
    peers: Vec<Peer>,
    last_seen: HashMap<IpAddr, Instant>,
}

impl PeerRoster {
    pub fn new(identity: LocalIdentity, timeout: Duration) -> Self {
        Self {
            identity,
            timeout,
            peers: Vec::new(),
            last_seen: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn is_self(&self, ip: IpAddr, hostname: &str) -> bool {
        self.identity.matches(ip, hostname)
    }

    /// Insert or refresh `peer`. Returns `false` for our own messages, which
    /// are never recorded.
    pub fn record(&mut self, mut peer: Peer, now: Instant) -> bool {
        peer.ip = peer.ip.to_canonical();
        if self.is_self(peer.ip, &peer.hostname) {
            return false;
        }

        self.last_seen.insert(peer.ip, now);
        match self
            .peers
            .iter_mut()
            .find(|p| p.ip == peer.ip || p.hostname == peer.hostname)
        {
            Some(existing) => *existing = peer,
            None => self.peers.push(peer),
        }
        true
    }

    /// Drop peers not seen for longer than the timeout, and any entry that
    /// turns out to be ourselves. Returns what was removed.
    pub fn expire(&mut self, now: Instant) -> Vec<Peer> {
        let timeout = self.timeout;
        let identity = &self.identity;
        let last_seen = &self.last_seen;

        let (kept, removed): (Vec<Peer>, Vec<Peer>) = self.peers.drain(..).partition(|p| {
            let fresh = last_seen
                .get(&p.ip)
                .is_some_and(|seen| now.saturating_duration_since(*seen) <= timeout);
            fresh && !identity.matches(p.ip, &p.hostname)
        });

        self.peers = kept;
        let peers = &self.peers;
        self.last_seen.retain(|ip, _| peers.iter().any(|p| p.ip == *ip));
        removed
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.last_seen.clear();
    }
}
