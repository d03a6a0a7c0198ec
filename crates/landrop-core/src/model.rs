use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide session identifier, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable identity of one inbound TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Waiting,
    InProgress,
    Finished,
    Cancelled,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Finished | TransferStatus::Cancelled | TransferStatus::Error
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Waiting => "waiting",
            TransferStatus::InProgress => "in progress",
            TransferStatus::Finished => "finished",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedFileKind {
    File,
    Directory,
}

/// A file advertised by a peer in its discovery datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFile {
    pub name: String,
    pub path: String,
    #[serde(serialize_with = "size_as_string", deserialize_with = "size_from_any")]
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: SharedFileKind,
}

impl From<storage::SharedEntry> for SharedFile {
    fn from(entry: storage::SharedEntry) -> Self {
        SharedFile {
            name: entry.name,
            path: entry.relative_path,
            size: entry.size,
            kind: if entry.is_dir {
                SharedFileKind::Directory
            } else {
                SharedFileKind::File
            },
        }
    }
}

// Peers on the wire send sizes as decimal strings.
fn size_as_string<S: Serializer>(size: &u64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&size.to_string())
}

fn size_from_any<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    match Size::deserialize(d)? {
        Size::Number(n) => Ok(n),
        Size::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Another instance discovered on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub ip: IpAddr,
    pub hostname: String,
    pub transfer_port: u16,
    pub version: String,
    pub shared_files: Vec<SharedFile>,
}

impl Peer {
    pub fn has_shared_files(&self) -> bool {
        !self.shared_files.is_empty()
    }

    pub fn shared_file_count(&self) -> usize {
        self.shared_files.len()
    }

    /// Where this peer's receiver listens.
    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.transfer_port)
    }
}
