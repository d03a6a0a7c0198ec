//! LANDrop Core - LAN File Transfer Library
//!
//! Push files to peers on the local network over a line-oriented TCP
//! protocol, batch simultaneous incoming offers into one decision, and serve
//! files from a shared folder on request.

pub mod batch;
pub mod config;
pub mod error;
mod lines;
pub mod manifest;
pub mod model;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod wire;

// Re-export commonly used types
pub use batch::BatchId;
pub use config::TransferConfig;
pub use error::{SessionError, TransferError};
pub use manifest::SharedManifest;
pub use model::{Direction, Peer, SessionId, SharedFile, TransferStatus};
pub use receiver::{Receiver, ReceiverEvent};
pub use sender::{Sender, SenderEvent, SenderHandle, SenderOptions};
pub use session::{BatchDecision, OfferedBatch, Session, SessionEvent, SessionManager};
