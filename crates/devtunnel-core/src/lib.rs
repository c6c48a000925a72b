//! `devtunnel` Core Library
//!
//! Shared functionality for `devtunnel` components:
//! - Configuration resolution (defaults, file, environment)
//! - Device OS version parsing and comparison
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use version::OsVersion;
