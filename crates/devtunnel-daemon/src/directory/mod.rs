//! Device directory: enumerates attached devices and selects the ones that
//! need a tunnel.

pub mod usbmux;

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use devtunnel_core::OsVersion;

pub use usbmux::UsbmuxDirectory;

/// How a device is attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "USB", alias = "Usb")]
    Usb,
    #[serde(rename = "Network")]
    Network,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => f.write_str("USB"),
            Self::Network => f.write_str("Network"),
        }
    }
}

/// One device as reported by a single directory poll.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "Identifier")]
    pub identifier: String,
    #[serde(rename = "ConnectionType")]
    pub connection_type: ConnectionType,
    #[serde(rename = "ProductVersion")]
    pub os_version: String,
}

impl DeviceRecord {
    pub fn new(
        identifier: impl Into<String>,
        connection_type: ConnectionType,
        os_version: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            connection_type,
            os_version: os_version.into(),
        }
    }
}

/// Which attachments are considered when looking for devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    UsbOnly,
    UsbAndNetwork,
}

/// Errors from a directory query. The reconciler treats all of them as a
/// transient "no devices" tick.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Failed to run device lister: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Device lister exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Failed to parse device list: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Device lister did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// Source of attached devices.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// List attached devices, optionally restricted to one attachment kind.
    async fn list_devices(
        &self,
        usb_only: bool,
        network_only: bool,
    ) -> Result<Vec<DeviceRecord>, DirectoryError>;
}

/// Query the directory and keep devices whose OS version is at least
/// `min_version`.
///
/// USB devices are listed first; network devices are appended when the
/// transport allows them.
pub async fn eligible_devices(
    directory: &dyn DeviceDirectory,
    transport: Transport,
    min_version: &OsVersion,
) -> Result<Vec<DeviceRecord>, DirectoryError> {
    let mut devices = directory.list_devices(true, false).await?;
    if transport == Transport::UsbAndNetwork {
        devices.extend(directory.list_devices(false, true).await?);
    }

    devices.retain(|device| match OsVersion::parse(&device.os_version) {
        Ok(version) => {
            let eligible = version >= *min_version;
            if !eligible {
                debug!(
                    udid = %device.identifier,
                    version = %device.os_version,
                    "Device below tunnel threshold, ignoring"
                );
            }
            eligible
        }
        Err(e) => {
            warn!(udid = %device.identifier, error = %e, "Unparseable device OS version");
            false
        }
    });
    Ok(devices)
}
