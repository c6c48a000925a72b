//! Handle to a running tunnel helper.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, info, warn};

/// A tunnel helper that has been spawned and is owned by one supervisor.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct HelperProcess {
    udid: String,
    child: Child,
}

impl HelperProcess {
    pub(crate) const fn new(udid: String, child: Child) -> Self {
        Self { udid, child }
    }

    /// OS process id, `None` once the process has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Wait for the helper to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Stop the helper: SIGTERM, then SIGKILL if it is still alive after
    /// `grace`. Returns the exit status when it could be collected.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(udid = %self.udid, %status, "Tunnel helper already exited");
                return Some(status);
            }
            Ok(None) => {}
            Err(e) => warn!(udid = %self.udid, error = %e, "Failed to poll tunnel helper"),
        }

        self.send_terminate();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(udid = %self.udid, %status, "Tunnel helper terminated");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(udid = %self.udid, error = %e, "Error waiting for tunnel helper");
                self.child.kill().await.ok();
                None
            }
            Err(_) => {
                warn!(udid = %self.udid, ?grace, "Tunnel helper ignored SIGTERM, killing");
                self.child.kill().await.ok();
                self.child.try_wait().ok().flatten()
            }
        }
    }

    #[cfg(unix)]
    fn send_terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(udid = %self.udid, pid, error = %e, "Failed to send SIGTERM");
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(udid = %self.udid, error = %e, "Failed to kill tunnel helper");
        }
    }
}
