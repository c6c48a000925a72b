//! devtunnel daemon library
//!
//! Core functionality for the device tunnel daemon:
//! - Device discovery through the helper's device lister
//! - Tunnel helper launching and handshake parsing
//! - Per-device supervisors with restart and back-off
//! - Reconciliation of the supervised set against attached devices
//! - HTTP control surface and client

pub mod address;
pub mod client;
pub mod daemon;
pub mod directory;
pub mod helper;
pub mod privilege;
pub mod reconciler;
pub mod server;
pub mod supervisor;
pub mod tunnel;

pub use address::{AddressTable, Endpoint};
pub use daemon::Daemon;
