//! Wire formats shared by every LANDrop instance.
//!
//! All messages are UTF-8 text with `|` as the field separator. Fields are not
//! escaped, so a file name or hostname containing `|` cannot be represented;
//! existing peers rely on this exact layout.
//!
//! - Offer: `<fileName>|<fileSize>\n`
//! - Decision: `OK\n` / `NO\n`
//! - Download request: `DOWNLOAD_REQUEST|<relativePath>|<fileName>|<port>\n`
//! - Discovery: `LANDROP_{DISCOVERY,RESPONSE}_<ver>|<udpPort>|<tcpPort>|<host>|<json>`
//!
//! After an `OK` the sender streams raw file bytes with no framing and closes
//! the connection when done.

use thiserror::Error;

use crate::model::SharedFile;

pub const PROTOCOL_VERSION: &str = "V1";
pub const DOWNLOAD_REQUEST_PREFIX: &str = "DOWNLOAD_REQUEST|";
pub const DISCOVERY_REQUEST_PREFIX: &str = "LANDROP_DISCOVERY_";
pub const DISCOVERY_RESPONSE_PREFIX: &str = "LANDROP_RESPONSE_";

/// Upper bound for a single header line.
pub const MAX_HEADER_LEN: usize = 8 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("empty file name")]
    EmptyFileName,
    #[error("invalid file size: {0:?}")]
    InvalidSize(String),
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
    #[error("unexpected decision: {0:?}")]
    UnknownDecision(String),
    #[error("not a discovery message")]
    NotDiscovery,
}

/// The sender's proposal: name and size of the file it wants to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub file_name: String,
    pub file_size: u64,
}

impl Offer {
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Self {
        Self { file_name: file_name.into(), file_size }
    }

    pub fn encode(&self) -> String {
        format!("{}|{}\n", self.file_name, self.file_size)
    }

    pub fn decode(line: &str) -> Result<Self, WireError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(WireError::Empty);
        }

        let mut parts = line.split('|');
        let file_name = parts.next().unwrap_or_default();
        let size = parts.next().ok_or(WireError::MissingField("file size"))?;

        if file_name.is_empty() {
            return Err(WireError::EmptyFileName);
        }
        let file_size = size
            .trim()
            .parse::<u64>()
            .map_err(|_| WireError::InvalidSize(size.to_string()))?;

        Ok(Self::new(file_name, file_size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn encode(self) -> &'static str {
        match self {
            Decision::Accept => "OK\n",
            Decision::Reject => "NO\n",
        }
    }

    pub fn decode(line: &str) -> Result<Self, WireError> {
        match line.trim() {
            "OK" => Ok(Decision::Accept),
            "NO" => Ok(Decision::Reject),
            other => Err(WireError::UnknownDecision(other.to_string())),
        }
    }
}

/// Pull request for a file in the peer's shared folder. The peer answers by
/// opening a regular transfer back to `reply_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub relative_path: String,
    pub file_name: String,
    pub reply_port: u16,
}

impl DownloadRequest {
    pub fn encode(&self) -> String {
        format!(
            "{}{}|{}|{}\n",
            DOWNLOAD_REQUEST_PREFIX, self.relative_path, self.file_name, self.reply_port
        )
    }

    pub fn decode(line: &str) -> Result<Self, WireError> {
        let line = line.trim();
        let rest = line
            .strip_prefix(DOWNLOAD_REQUEST_PREFIX)
            .ok_or(WireError::MissingField("DOWNLOAD_REQUEST"))?;

        let mut parts = rest.split('|');
        let relative_path = parts.next().unwrap_or_default();
        let file_name = parts.next().ok_or(WireError::MissingField("file name"))?;
        let port = parts.next().ok_or(WireError::MissingField("reply port"))?;

        if relative_path.is_empty() {
            return Err(WireError::MissingField("relative path"));
        }
        let reply_port = parse_port(port)?;

        Ok(Self {
            relative_path: relative_path.to_string(),
            file_name: file_name.to_string(),
            reply_port,
        })
    }
}

/// First line a receiver reads from a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Offer(Offer),
    Download(DownloadRequest),
}

impl Header {
    pub fn decode(line: &str) -> Result<Self, WireError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(WireError::Empty);
        }
        if trimmed.starts_with(DOWNLOAD_REQUEST_PREFIX) {
            DownloadRequest::decode(trimmed).map(Header::Download)
        } else {
            Offer::decode(trimmed).map(Header::Offer)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// Periodic broadcast; receivers answer it.
    Request,
    /// Direct answer to a request; never answered.
    Response,
}

impl DiscoveryKind {
    fn prefix(self) -> &'static str {
        match self {
            DiscoveryKind::Request => DISCOVERY_REQUEST_PREFIX,
            DiscoveryKind::Response => DISCOVERY_RESPONSE_PREFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub kind: DiscoveryKind,
    pub version: String,
    pub discovery_port: u16,
    pub transfer_port: u16,
    pub hostname: String,
    pub shared_files: Vec<SharedFile>,
}

impl DiscoveryMessage {
    pub fn encode(&self) -> String {
        format!(
            "{}{}|{}|{}|{}|{}",
            self.kind.prefix(),
            self.version,
            self.discovery_port,
            self.transfer_port,
            self.hostname,
            encode_shared_files(&self.shared_files)
        )
    }

    /// Encode with an already serialized shared-file array.
    pub fn encode_with_json(
        kind: DiscoveryKind,
        discovery_port: u16,
        transfer_port: u16,
        hostname: &str,
        shared_files_json: &str,
    ) -> String {
        format!(
            "{}{}|{}|{}|{}|{}",
            kind.prefix(),
            PROTOCOL_VERSION,
            discovery_port,
            transfer_port,
            hostname,
            shared_files_json
        )
    }

    pub fn decode(datagram: &str) -> Result<Self, WireError> {
        let (kind, rest) = if let Some(rest) = datagram.strip_prefix(DISCOVERY_REQUEST_PREFIX) {
            (DiscoveryKind::Request, rest)
        } else if let Some(rest) = datagram.strip_prefix(DISCOVERY_RESPONSE_PREFIX) {
            (DiscoveryKind::Response, rest)
        } else {
            return Err(WireError::NotDiscovery);
        };

        // The JSON payload is the last field and is taken verbatim.
        let mut parts = rest.splitn(5, '|');
        let version = parts.next().unwrap_or_default();
        let discovery_port = parts.next().ok_or(WireError::MissingField("discovery port"))?;
        let transfer_port = parts.next().ok_or(WireError::MissingField("transfer port"))?;
        let hostname = parts.next().ok_or(WireError::MissingField("hostname"))?;
        let shared_files = parts.next().map(decode_shared_files).unwrap_or_default();

        Ok(Self {
            kind,
            version: version.to_string(),
            discovery_port: parse_port(discovery_port)?,
            transfer_port: parse_port(transfer_port)?,
            hostname: hostname.to_string(),
            shared_files,
        })
    }
}

fn parse_port(field: &str) -> Result<u16, WireError> {
    field
        .trim()
        .parse::<u16>()
        .map_err(|_| WireError::InvalidPort(field.to_string()))
}

/// Compact JSON array of shared files; `[]` when there are none.
pub fn encode_shared_files(files: &[SharedFile]) -> String {
    serde_json::to_string(files).unwrap_or_else(|_| "[]".to_string())
}

/// Lenient decoding: anything that is not a valid array yields an empty list.
pub fn decode_shared_files(json: &str) -> Vec<SharedFile> {
    match serde_json::from_str::<Vec<SharedFile>>(json.trim()) {
        Ok(files) => files,
        Err(e) => {
            tracing::debug!("Ignoring malformed shared file list: {}", e);
            Vec::new()
        }
    }
}
