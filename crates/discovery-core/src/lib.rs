//! LAN peer discovery over UDP broadcast.
//!
//! Every instance periodically broadcasts a request carrying its ports,
//! hostname and shared-file list; whoever hears it records the sender and
//! answers directly with a response of the same shape.

pub mod announce;
pub mod discover;
pub mod error;
pub mod model;
pub mod net;
pub mod roster;
pub mod service;

pub use error::DiscoveryError;
pub use model::{BroadcastMode, DiscoveryConfig, DiscoveryEvent, InterfaceIp, LocalIdentity};
pub use roster::PeerRoster;
pub use service::DiscoveryService;
