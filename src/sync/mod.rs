//! Real-time synchronization over WebSockets.
//!
//! One process (usually the GUI backend) runs the [`server::SyncServer`];
//! CLI and API processes connect with [`client::SyncClient`]. The
//! [`manager::SyncManager`] wires either role to the local store: outbound
//! entity changes become broadcast events, inbound events are applied to
//! the store. Frames are defined in [`protocol`].

pub mod client;
pub mod manager;
pub mod protocol;
pub mod server;

pub use client::{ClientEvent, SyncClient, SyncClientConfig};
pub use manager::{SyncManager, SyncStats};
pub use protocol::{WireMessage, MAX_PAYLOAD_BYTES};
pub use server::{SyncServer, SyncServerConfig};
