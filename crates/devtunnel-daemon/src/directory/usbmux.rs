//! Device directory backed by the helper's `usbmux list` sub-command.

use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

use super::{DeviceDirectory, DeviceRecord, DirectoryError};
use crate::helper::HelperCommand;

/// Lists devices by running `<helper> usbmux list [--usb|--network]` and
/// parsing the JSON array it prints.
#[derive(Debug, Clone)]
pub struct UsbmuxDirectory {
    helper: HelperCommand,
}

impl UsbmuxDirectory {
    pub const fn new(helper: HelperCommand) -> Self {
        Self { helper }
    }

    fn list_args(usb_only: bool, network_only: bool) -> Vec<&'static str> {
        let mut args = vec!["usbmux", "list"];
        if usb_only {
            args.push("--usb");
        }
        if network_only {
            args.push("--network");
        }
        args
    }
}

#[async_trait]
impl DeviceDirectory for UsbmuxDirectory {
    async fn list_devices(
        &self,
        usb_only: bool,
        network_only: bool,
    ) -> Result<Vec<DeviceRecord>, DirectoryError> {
        let args = Self::list_args(usb_only, network_only);
        let output = self
            .helper
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(DirectoryError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let devices: Vec<DeviceRecord> = serde_json::from_slice(&output.stdout)?;
        debug!(count = devices.len(), usb_only, network_only, "Listed devices");
        Ok(devices)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::ConnectionType;

    fn shell_helper(script: &str) -> HelperCommand {
        HelperCommand::new("sh").with_prefix(["-c", script, "helper"])
    }

    #[test]
    fn list_args_select_transport() {
        assert_eq!(UsbmuxDirectory::list_args(true, false), ["usbmux", "list", "--usb"]);
        assert_eq!(
            UsbmuxDirectory::list_args(false, true),
            ["usbmux", "list", "--network"]
        );
    }

    #[tokio::test]
    async fn parses_lister_output() {
        let script = r#"[ "$3" = "--usb" ] || exit 3
echo '[{"Identifier":"AAA","ConnectionType":"USB","ProductVersion":"17.4","DeviceName":"x"}]'"#;
        let directory = UsbmuxDirectory::new(shell_helper(script));
        let devices = directory.list_devices(true, false).await.unwrap();
        assert_eq!(
            devices,
            vec![DeviceRecord::new("AAA", ConnectionType::Usb, "17.4")]
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_with_stderr() {
        let directory = UsbmuxDirectory::new(shell_helper("echo 'usbmuxd not running' >&2; exit 1"));
        let err = directory.list_devices(true, false).await.unwrap_err();
        match err {
            DirectoryError::Failed { stderr, .. } => assert_eq!(stderr, "usbmuxd not running"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn garbage_output_is_a_parse_error() {
        let directory = UsbmuxDirectory::new(shell_helper("echo not-json"));
        let err = directory.list_devices(false, true).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Parse(_)));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let directory = UsbmuxDirectory::new(HelperCommand::new("/nonexistent/devtunnel-helper"));
        let err = directory.list_devices(true, false).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Spawn(_)));
    }
}
