//! Spawns tunnel helpers and reads their one-line handshake.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, info};

use devtunnel_core::OsVersion;

use super::error::TunnelError;
use super::process::HelperProcess;
use crate::address::Endpoint;
use crate::directory::{ConnectionType, DeviceRecord};
use crate::helper::HelperCommand;

/// Helper sub-command used to bring up a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelVariant {
    /// Lockdown tunnel for devices at or above the lockdown threshold.
    Lockdown,
    /// Remote tunnel over Wi-Fi for older network-attached devices.
    RemoteWifi,
    /// Remote tunnel over USB.
    Remote,
}

impl TunnelVariant {
    /// Pick the variant for a device. Checked in priority order: lockdown
    /// threshold first, then network attachment.
    pub fn select(
        connection_type: ConnectionType,
        version: &OsVersion,
        lockdown_version: &OsVersion,
    ) -> Self {
        if version >= lockdown_version {
            Self::Lockdown
        } else if connection_type == ConnectionType::Network {
            Self::RemoteWifi
        } else {
            Self::Remote
        }
    }

    pub const fn subcommand(self) -> &'static str {
        match self {
            Self::Lockdown => "lockdown",
            Self::RemoteWifi | Self::Remote => "remote",
        }
    }

    /// Helper arguments for `udid`.
    pub fn args(self, udid: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            self.subcommand(),
            "start-tunnel",
            "--script-mode",
            "--udid",
            udid,
        ]
        .into_iter()
        .map(String::from)
        .collect();
        if self == Self::RemoteWifi {
            args.extend(["-t".to_string(), "wifi".to_string()]);
        }
        args
    }
}

/// Parse the helper's handshake line, `"<ip> <port>"`.
pub fn parse_handshake(line: &str) -> Result<Endpoint, TunnelError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(TunnelError::EmptyResponse);
    }

    let mut tokens = line.split_whitespace();
    let (Some(ip), Some(port), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(TunnelError::MalformedHandshake(line.to_string()));
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| TunnelError::InvalidPort(port.to_string()))?;
    Ok(Endpoint::new(ip, port))
}

/// Starts tunnel helpers.
///
/// Spawns are serialized through one lock: the helper touches shared pairing
/// state on startup and is not safe to start concurrently. Handshake reads
/// happen outside the lock.
#[derive(Debug)]
pub struct TunnelLauncher {
    helper: HelperCommand,
    lockdown_version: OsVersion,
    spawn_lock: Mutex<()>,
}

impl TunnelLauncher {
    pub fn new(helper: HelperCommand, lockdown_version: OsVersion) -> Self {
        Self {
            helper,
            lockdown_version,
            spawn_lock: Mutex::new(()),
        }
    }

    pub fn variant_for(&self, device: &DeviceRecord) -> Result<TunnelVariant, TunnelError> {
        let version = OsVersion::parse(&device.os_version)
            .map_err(|_| TunnelError::InvalidVersion(device.os_version.clone()))?;
        Ok(TunnelVariant::select(
            device.connection_type,
            &version,
            &self.lockdown_version,
        ))
    }

    /// Spawn the helper for `device` under the global spawn lock.
    pub async fn spawn(&self, device: &DeviceRecord) -> Result<PendingTunnel, TunnelError> {
        let variant = self.variant_for(device)?;
        let args = variant.args(&device.identifier);

        let _guard = self.spawn_lock.lock().await;
        info!(
            udid = %device.identifier,
            cmd = %self.helper.display_args(&args),
            "Starting tunnel helper"
        );
        let mut child = self
            .helper
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(TunnelError::Spawn)?;

        let stdout = child.stdout.take().ok_or(TunnelError::NoStdout)?;
        Ok(PendingTunnel {
            udid: device.identifier.clone(),
            child,
            stdout: BufReader::new(stdout),
        })
    }

    /// Spawn the helper and wait for its endpoint.
    ///
    /// On failure the helper is killed when the pending handle is dropped.
    #[cfg(test)]
    async fn launch(
        &self,
        device: &DeviceRecord,
        timeout: Option<Duration>,
    ) -> Result<(Endpoint, HelperProcess), TunnelError> {
        let mut pending = self.spawn(device).await?;
        let endpoint = pending.read_handshake(timeout).await?;
        Ok((endpoint, pending.into_process()))
    }
}

/// A spawned helper whose handshake has not been read yet.
#[derive(Debug)]
pub struct PendingTunnel {
    udid: String,
    child: Child,
    stdout: BufReader<ChildStdout>,
}

impl PendingTunnel {
    /// Read exactly one line from the helper and parse it as an endpoint.
    ///
    /// Blocks until a full line or end of stream unless `timeout` is set.
    pub async fn read_handshake(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Endpoint, TunnelError> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| TunnelError::HandshakeTimeout(limit))?,
            None => read.await,
        };
        result.map_err(TunnelError::Read)?;

        let endpoint = parse_handshake(&line)?;
        info!(udid = %self.udid, %endpoint, "Tunnel handshake received");
        Ok(endpoint)
    }

    /// Hand over the running helper, draining the rest of its stdout in the
    /// background so it never blocks on a full pipe.
    pub fn into_process(self) -> HelperProcess {
        let Self {
            udid,
            child,
            mut stdout,
        } = self;

        let drain_udid = udid.clone();
        tokio::spawn(async move {
            let mut sink = tokio::io::sink();
            match tokio::io::copy_buf(&mut stdout, &mut sink).await {
                Ok(bytes) => debug!(udid = %drain_udid, bytes, "Tunnel helper stdout closed"),
                Err(e) => debug!(udid = %drain_udid, error = %e, "Tunnel helper stdout drain failed"),
            }
        });

        HelperProcess::new(udid, child)
    }
}
