//! Tunnel helper launching and process handles.
//!
//! A helper is started per device and reports its endpoint on the first line
//! of stdout, then keeps running until signalled.

pub mod error;
pub mod launcher;
pub mod process;

pub use error::TunnelError;
pub use launcher::{PendingTunnel, TunnelLauncher, TunnelVariant, parse_handshake};
pub use process::HelperProcess;
