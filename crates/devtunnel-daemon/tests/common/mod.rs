//! Shared fixtures: a scriptable device directory and a shell stand-in for
//! the tunnel helper.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use devtunnel_core::OsVersion;
use devtunnel_daemon::directory::{
    ConnectionType, DeviceDirectory, DeviceRecord, DirectoryError, Transport,
};
use devtunnel_daemon::helper::HelperCommand;
use devtunnel_daemon::reconciler::ReconcilerSettings;
use devtunnel_daemon::supervisor::SupervisorTiming;
use devtunnel_daemon::tunnel::TunnelLauncher;

/// Device directory whose contents the test changes between ticks.
#[derive(Default)]
pub struct ScriptedDirectory {
    devices: Mutex<Vec<DeviceRecord>>,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl ScriptedDirectory {
    pub fn set(&self, devices: Vec<DeviceRecord>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every query wait forever, like a lister stuck on a dead
    /// connection.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceDirectory for ScriptedDirectory {
    async fn list_devices(
        &self,
        usb_only: bool,
        network_only: bool,
    ) -> Result<Vec<DeviceRecord>, DirectoryError> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DirectoryError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "usbmuxd not running".to_string(),
            });
        }
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .filter(|d| match d.connection_type {
                ConnectionType::Usb => !network_only,
                ConnectionType::Network => !usb_only,
            })
            .cloned()
            .collect())
    }
}

pub fn usb(udid: &str, version: &str) -> DeviceRecord {
    DeviceRecord::new(udid, ConnectionType::Usb, version)
}

pub fn network(udid: &str, version: &str) -> DeviceRecord {
    DeviceRecord::new(udid, ConnectionType::Network, version)
}

/// A fake helper that logs each start and each SIGTERM by udid, reports
/// `2001:db8::1 12345` for `AAA` and `fd00::2 2222` for anyone else, then
/// runs until signalled.
pub struct FakeHelper {
    _dir: tempfile::TempDir,
    starts: PathBuf,
    terms: PathBuf,
    exit_on_term: bool,
}

impl FakeHelper {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let starts = dir.path().join("starts");
        let terms = dir.path().join("terms");
        Self {
            _dir: dir,
            starts,
            terms,
            exit_on_term: true,
        }
    }

    /// Like [`FakeHelper::new`], but SIGTERM is only logged; the helper
    /// keeps running until SIGKILL.
    pub fn ignoring_sigterm() -> Self {
        Self {
            exit_on_term: false,
            ..Self::new()
        }
    }

    fn script(&self) -> String {
        let on_term = if self.exit_on_term { "; exit 0" } else { "" };
        // Arguments: <variant> start-tunnel --script-mode --udid <udid> [-t wifi]
        format!(
            r#"trap 'echo "$5" >> "{terms}"{on_term}' TERM
echo "$5" >> "{starts}"
case "$5" in
  AAA) echo "2001:db8::1 12345" ;;
  *) echo "fd00::2 2222" ;;
esac
while :; do sleep 0.05; done"#,
            terms = self.terms.display(),
            starts = self.starts.display(),
        )
    }

    pub fn launcher(&self) -> TunnelLauncher {
        TunnelLauncher::new(
            HelperCommand::new("sh").with_prefix(["-c".to_string(), self.script(), "helper".to_string()]),
            OsVersion::new(17, 4, 0),
        )
    }

    pub fn starts(&self) -> Vec<String> {
        read_lines(&self.starts)
    }

    pub fn terms(&self) -> Vec<String> {
        read_lines(&self.terms)
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn fast_settings(transport: Transport) -> ReconcilerSettings {
    ReconcilerSettings {
        transport,
        min_version: OsVersion::new(17, 0, 0),
        tick_interval: Duration::from_millis(50),
        directory_timeout: Duration::from_secs(2),
        supervisor: SupervisorTiming {
            backoff: Duration::from_millis(100),
            terminate_grace: Duration::from_secs(2),
            handshake_timeout: Some(Duration::from_secs(5)),
        },
    }
}

/// Poll `check` for up to five seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
