use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// TCP port for incoming transfers (0 = auto-assign)
    pub transfer_port: u16,

    /// Chunk size used when streaming a file (64 KiB)
    pub chunk_size: usize,

    /// Directory where accepted files are written
    pub received_dir: PathBuf,

    /// Directory advertised to peers and served on download requests
    pub shared_dir: PathBuf,

    pub connect_timeout_ms: u64,

    /// How long a sender waits for OK/NO after its offer
    pub response_timeout_ms: u64,

    /// Coalescing window for simultaneous inbound offers
    pub batch_window_ms: u64,

    /// Grace delay before a finished or failed session is reclaimed
    pub reap_delay_ms: u64,

    /// Grace delay before a refused session is reclaimed
    pub refused_reap_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            transfer_port: 5556,
            chunk_size: 64 * 1024, // 64 KiB
            received_dir: PathBuf::from("./Received Files"),
            shared_dir: PathBuf::from("./Shared Files"),
            connect_timeout_ms: 10_000,
            response_timeout_ms: 30_000,
            batch_window_ms: 200,
            reap_delay_ms: 100,
            refused_reap_delay_ms: 500,
        }
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn reap_delay(&self) -> Duration {
        Duration::from_millis(self.reap_delay_ms)
    }

    pub fn refused_reap_delay(&self) -> Duration {
        Duration::from_millis(self.refused_reap_delay_ms)
    }

    pub fn with_dirs(mut self, received_dir: PathBuf, shared_dir: PathBuf) -> Self {
        self.received_dir = received_dir;
        self.shared_dir = shared_dir;
        self
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.received_dir)?;
        std::fs::create_dir_all(&self.shared_dir)?;
        Ok(())
    }
}
