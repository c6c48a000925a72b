//! Per-device tunnel supervisor.
//!
//! One supervisor task runs per tracked device. It repeatedly launches the
//! tunnel helper, publishes the reported endpoint, waits for the helper to
//! exit, retires the endpoint and backs off before the next attempt:
//!
//! ```text
//! STARTING -> RUNNING -> EXITED -> (back-off) -> STARTING -> ... -> REMOVED
//! ```
//!
//! The task stops only when its cancellation token fires (device removed or
//! daemon shutting down). On the way out the endpoint is removed before the
//! helper is signalled, so the table never points at a dead tunnel.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devtunnel_core::config::SupervisorConfig;

use crate::address::AddressTable;
use crate::directory::DeviceRecord;
use crate::tunnel::{HelperProcess, TunnelError, TunnelLauncher};

/// Timing knobs for a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTiming {
    /// Delay before relaunching after a failure or exit.
    pub backoff: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a helper.
    pub terminate_grace: Duration,
    /// Upper bound on the handshake read. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(3),
            terminate_grace: Duration::from_secs(5),
            handshake_timeout: None,
        }
    }
}

impl From<&SupervisorConfig> for SupervisorTiming {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            backoff: config.backoff(),
            terminate_grace: config.terminate_grace(),
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

/// How one helper run ended.
enum RunOutcome {
    /// The helper exited by itself; retry after back-off.
    Exited,
    /// The supervisor was cancelled; the helper has been stopped.
    Cancelled,
}

/// Supervises the tunnel helper of a single device.
pub struct DeviceSupervisor {
    device: DeviceRecord,
    launcher: Arc<TunnelLauncher>,
    table: AddressTable,
    timing: SupervisorTiming,
    cancel: CancellationToken,
}

impl DeviceSupervisor {
    pub const fn new(
        device: DeviceRecord,
        launcher: Arc<TunnelLauncher>,
        table: AddressTable,
        timing: SupervisorTiming,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device,
            launcher,
            table,
            timing,
            cancel,
        }
    }

    fn udid(&self) -> &str {
        &self.device.identifier
    }

    /// Run the supervisor on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Supervise until cancelled.
    pub async fn run(self) {
        info!(
            udid = %self.udid(),
            connection = %self.device.connection_type,
            version = %self.device.os_version,
            "Device supervisor started"
        );

        let mut attempt: u64 = 0;
        while !self.cancel.is_cancelled() {
            attempt = attempt.saturating_add(1);
            match self.start_helper().await {
                Ok(Some(mut process)) => {
                    if matches!(self.watch(&mut process).await, RunOutcome::Cancelled) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(udid = %self.udid(), attempt, error = %e, "start-tunnel failed");
                }
            }

            debug!(udid = %self.udid(), backoff = ?self.timing.backoff, "Backing off");
            tokio::select! {
                () = sleep(self.timing.backoff) => {}
                () = self.cancel.cancelled() => break,
            }
        }

        // Covers cancellation between publishing and watching.
        self.table.remove(self.udid());
        info!(udid = %self.udid(), "Device supervisor stopped");
    }

    /// Launch a helper and publish its endpoint.
    ///
    /// Returns `Ok(None)` when cancelled before the handshake completed; the
    /// half-started helper has been stopped by then.
    async fn start_helper(&self) -> Result<Option<HelperProcess>, TunnelError> {
        let mut pending = tokio::select! {
            result = self.launcher.spawn(&self.device) => result?,
            () = self.cancel.cancelled() => return Ok(None),
        };

        let handshake = tokio::select! {
            result = pending.read_handshake(self.timing.handshake_timeout) => Some(result),
            () = self.cancel.cancelled() => None,
        };

        let mut process = pending.into_process();
        match handshake {
            Some(Ok(endpoint)) => {
                info!(
                    udid = %self.udid(),
                    pid = ?process.id(),
                    %endpoint,
                    "Tunnel address published"
                );
                self.table.set(self.udid(), endpoint);
                Ok(Some(process))
            }
            Some(Err(e)) => {
                process.terminate(self.timing.terminate_grace).await;
                Err(e)
            }
            None => {
                process.terminate(self.timing.terminate_grace).await;
                Ok(None)
            }
        }
    }

    /// Wait for the helper to exit or for cancellation, retiring the
    /// endpoint either way.
    async fn watch(&self, process: &mut HelperProcess) -> RunOutcome {
        tokio::select! {
            status = process.wait() => {
                self.table.remove(self.udid());
                match status {
                    Ok(status) => warn!(udid = %self.udid(), %status, "Tunnel helper exited"),
                    Err(e) => error!(udid = %self.udid(), error = %e, "Failed to wait for tunnel helper"),
                }
                RunOutcome::Exited
            }
            () = self.cancel.cancelled() => {
                self.table.remove(self.udid());
                info!(udid = %self.udid(), pid = ?process.id(), "Terminating tunnel helper");
                process.terminate(self.timing.terminate_grace).await;
                RunOutcome::Cancelled
            }
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::address::Endpoint;
    use crate::directory::ConnectionType;
    use crate::helper::HelperCommand;
    use devtunnel_core::OsVersion;
    use std::path::Path;

    fn launcher(script: &str) -> Arc<TunnelLauncher> {
        Arc::new(TunnelLauncher::new(
            HelperCommand::new("sh").with_prefix(["-c", script, "helper"]),
            OsVersion::new(17, 4, 0),
        ))
    }

    fn fast_timing() -> SupervisorTiming {
        SupervisorTiming {
            backoff: Duration::from_millis(100),
            terminate_grace: Duration::from_secs(2),
            handshake_timeout: None,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        false
    }

    fn count_lines(path: &Path) -> usize {
        std::fs::read_to_string(path).map_or(0, |s| s.lines().count())
    }

    #[tokio::test]
    async fn publishes_endpoint_and_retires_it_on_cancel() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("term");
        let script = format!(
            r#"trap 'echo term >> "{}"; exit 0' TERM
echo "2001:db8::1 12345"
while :; do sleep 0.05; done"#,
            marker.display()
        );

        let table = AddressTable::new();
        let cancel = CancellationToken::new();
        let handle = DeviceSupervisor::new(
            DeviceRecord::new("AAA", ConnectionType::Usb, "17.4"),
            launcher(&script),
            table.clone(),
            fast_timing(),
            cancel.clone(),
        )
        .spawn();

        assert!(wait_until(|| table.contains("AAA")).await);
        assert_eq!(table.get("AAA").unwrap(), Endpoint::new("2001:db8::1", 12345));

        cancel.cancel();
        handle.await.unwrap();
        assert!(table.is_empty());
        assert_eq!(count_lines(&marker), 1, "helper should receive exactly one SIGTERM");
    }

    #[tokio::test]
    async fn relaunches_after_helper_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let starts = dir.path().join("starts");
        let script = format!(
            r#"echo start >> "{}"
echo "fd00::1 5000"
sleep 0.1"#,
            starts.display()
        );

        let table = AddressTable::new();
        let cancel = CancellationToken::new();
        let handle = DeviceSupervisor::new(
            DeviceRecord::new("AAA", ConnectionType::Usb, "17.4"),
            launcher(&script),
            table.clone(),
            fast_timing(),
            cancel.clone(),
        )
        .spawn();

        assert!(wait_until(|| count_lines(&starts) >= 3).await);
        cancel.cancel();
        handle.await.unwrap();
        assert!(!table.contains("AAA"));
    }

    #[tokio::test]
    async fn helper_exit_retires_endpoint_before_relaunch() {
        let dir = tempfile::TempDir::new().unwrap();
        let starts = dir.path().join("starts");
        let script = format!(
            r#"echo start >> "{}"
echo "fd00::1 5000"
sleep 0.3"#,
            starts.display()
        );

        let table = AddressTable::new();
        let cancel = CancellationToken::new();
        let timing = SupervisorTiming {
            backoff: Duration::from_millis(1500),
            ..fast_timing()
        };
        let handle = DeviceSupervisor::new(
            DeviceRecord::new("AAA", ConnectionType::Usb, "17.4"),
            launcher(&script),
            table.clone(),
            timing,
            cancel.clone(),
        )
        .spawn();

        assert!(wait_until(|| table.contains("AAA")).await);
        assert_eq!(table.get("AAA").unwrap(), Endpoint::new("fd00::1", 5000));

        // Exited, backing off: the entry is gone and nothing is relaunched yet.
        assert!(wait_until(|| !table.contains("AAA")).await);
        assert!(!handle.is_finished(), "supervisor must outlive its helper");
        assert_eq!(count_lines(&starts), 1);

        // After the back-off the helper is relaunched and republished.
        assert!(wait_until(|| count_lines(&starts) == 2).await);
        assert!(wait_until(|| table.contains("AAA")).await);

        cancel.cancel();
        handle.await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn empty_handshake_is_retried_without_publishing() {
        let dir = tempfile::TempDir::new().unwrap();
        let starts = dir.path().join("starts");
        let script = format!(r#"echo start >> "{}"; exit 1"#, starts.display());

        let table = AddressTable::new();
        let cancel = CancellationToken::new();
        let handle = DeviceSupervisor::new(
            DeviceRecord::new("AAA", ConnectionType::Usb, "17.4"),
            launcher(&script),
            table.clone(),
            fast_timing(),
            cancel.clone(),
        )
        .spawn();

        assert!(wait_until(|| count_lines(&starts) >= 2).await);
        assert!(table.is_empty());
        assert!(!handle.is_finished(), "supervisor must keep retrying");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_during_backoff_returns_promptly() {
        let table = AddressTable::new();
        let cancel = CancellationToken::new();
        let timing = SupervisorTiming {
            backoff: Duration::from_secs(60),
            ..fast_timing()
        };
        let handle = DeviceSupervisor::new(
            DeviceRecord::new("AAA", ConnectionType::Usb, "17.4"),
            launcher("exit 1"),
            table,
            timing,
            cancel.clone(),
        )
        .spawn();

        sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_during_handshake_stops_helper() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("term");
        let script = format!(
            r#"trap 'echo term >> "{}"; exit 0' TERM
while :; do sleep 0.05; done"#,
            marker.display()
        );

        let table = AddressTable::new();
        let cancel = CancellationToken::new();
        let handle = DeviceSupervisor::new(
            DeviceRecord::new("AAA", ConnectionType::Usb, "17.4"),
            launcher(&script),
            table.clone(),
            fast_timing(),
            cancel.clone(),
        )
        .spawn();

        sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(table.is_empty());
        assert_eq!(count_lines(&marker), 1);
    }
}
