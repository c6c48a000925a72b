//! Device set reconciler.
//!
//! A single control loop that polls the device directory on a fixed
//! interval, starts a [`DeviceSupervisor`] for every newly seen eligible
//! device and stops the supervisors of devices that disappeared.
//!
//! Stopping never blocks a tick: a stale supervisor is cancelled and parked
//! in a retiring set until its helper is gone. A device that comes back
//! while its old supervisor is still retiring is picked up once that
//! supervisor has finished.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devtunnel_core::OsVersion;
use devtunnel_core::config::Config;

use crate::address::AddressTable;
use crate::directory::{DeviceDirectory, DeviceRecord, DirectoryError, Transport, eligible_devices};
use crate::supervisor::{DeviceSupervisor, SupervisorTiming};
use crate::tunnel::TunnelLauncher;

/// Reconciler settings derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub transport: Transport,
    pub min_version: OsVersion,
    pub tick_interval: Duration,
    /// Upper bound on one directory query; a slower query counts as a failure.
    pub directory_timeout: Duration,
    pub supervisor: SupervisorTiming,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            transport: Transport::UsbOnly,
            min_version: OsVersion::new(17, 0, 0),
            tick_interval: Duration::from_secs(1),
            directory_timeout: Duration::from_secs(10),
            supervisor: SupervisorTiming::default(),
        }
    }
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> devtunnel_core::Result<Self> {
        Ok(Self {
            transport: if config.daemon.wifi {
                Transport::UsbAndNetwork
            } else {
                Transport::UsbOnly
            },
            min_version: config.supervisor.min_os_version()?,
            tick_interval: config.supervisor.tick_interval(),
            directory_timeout: config.supervisor.directory_timeout(),
            supervisor: SupervisorTiming::from(&config.supervisor),
        })
    }
}

/// Tracking entry for a supervised device.
struct ManagedDevice {
    record: DeviceRecord,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Identifiers started and stopped by one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Owns the tracked device set. Only the reconciler adds or removes
/// tracked devices; supervisors learn about removal through their token.
pub struct Reconciler {
    directory: Arc<dyn DeviceDirectory>,
    launcher: Arc<TunnelLauncher>,
    table: AddressTable,
    settings: ReconcilerSettings,
    shutdown: CancellationToken,
    managed: HashMap<String, ManagedDevice>,
    /// Cancelled supervisors whose helpers may still be shutting down.
    retiring: HashMap<String, ManagedDevice>,
}

impl Reconciler {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        launcher: Arc<TunnelLauncher>,
        table: AddressTable,
        settings: ReconcilerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            directory,
            launcher,
            table,
            settings,
            shutdown,
            managed: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Currently tracked identifiers, sorted.
    pub fn tracked(&self) -> BTreeSet<String> {
        self.managed.keys().cloned().collect()
    }

    /// Identifiers whose supervisors were stopped but have not finished yet.
    pub fn retiring(&self) -> BTreeSet<String> {
        self.retiring.keys().cloned().collect()
    }

    /// Run until the shutdown token fires, then stop every supervisor.
    pub async fn run(mut self) {
        info!(
            transport = ?self.settings.transport,
            min_version = %self.settings.min_version,
            interval = ?self.settings.tick_interval,
            "Device reconciler started"
        );

        while !self.shutdown.is_cancelled() {
            let report = self.tick().await;
            if !report.is_empty() {
                debug!(?report, tracked = self.managed.len(), "Reconciled device set");
            }

            tokio::select! {
                () = sleep(self.settings.tick_interval) => {}
                () = self.shutdown.cancelled() => break,
            }
        }

        self.shutdown_all().await;
        info!("Device reconciler stopped");
    }

    /// One reconciliation pass.
    ///
    /// A directory failure or timeout is logged and treated as an empty
    /// device set. Shutdown interrupts a pending directory query. Stale
    /// supervisors are cancelled but not awaited.
    pub async fn tick(&mut self) -> TickReport {
        let listed = tokio::select! {
            result = self.query_directory() => result,
            () = self.shutdown.cancelled() => return TickReport::default(),
        };
        let eligible = listed.unwrap_or_else(|e| {
            error!(error = %e, "list_devices failed");
            Vec::new()
        });

        self.reap_finished().await;
        self.reap_retiring().await;

        let mut report = TickReport::default();
        let mut present = BTreeSet::new();
        for device in eligible {
            if !present.insert(device.identifier.clone()) {
                continue;
            }
            if self.managed.contains_key(&device.identifier) || self.shutdown.is_cancelled() {
                continue;
            }
            if self.retiring.contains_key(&device.identifier) {
                debug!(
                    udid = %device.identifier,
                    "Previous supervisor still stopping, deferring start"
                );
                continue;
            }
            report.started.push(device.identifier.clone());
            self.start(device);
        }

        let stale: Vec<String> = self
            .managed
            .keys()
            .filter(|udid| !present.contains(*udid))
            .cloned()
            .collect();
        for udid in &stale {
            self.retire(udid);
        }
        report.stopped = stale;
        report
    }

    /// Stop every supervisor regardless of directory state and wait until
    /// all of them, including ones already retiring, have finished.
    pub async fn shutdown_all(&mut self) {
        let all: Vec<String> = self.managed.keys().cloned().collect();
        for udid in &all {
            self.retire(udid);
        }
        if self.retiring.is_empty() {
            return;
        }

        info!(count = self.retiring.len(), "Terminating all tunnel helpers");
        for (udid, retired) in std::mem::take(&mut self.retiring) {
            self.finish(&udid, retired).await;
        }
    }

    async fn query_directory(&self) -> Result<Vec<DeviceRecord>, DirectoryError> {
        let limit = self.settings.directory_timeout;
        timeout(
            limit,
            eligible_devices(
                self.directory.as_ref(),
                self.settings.transport,
                &self.settings.min_version,
            ),
        )
        .await
        .unwrap_or(Err(DirectoryError::Timeout(limit)))
    }

    fn start(&mut self, device: DeviceRecord) {
        info!(udid = %device.identifier, "Device attached, starting supervisor");
        let cancel = self.shutdown.child_token();
        let task = DeviceSupervisor::new(
            device.clone(),
            Arc::clone(&self.launcher),
            self.table.clone(),
            self.settings.supervisor,
            cancel.clone(),
        )
        .spawn();
        self.managed.insert(
            device.identifier.clone(),
            ManagedDevice {
                record: device,
                cancel,
                task,
            },
        );
    }

    /// Cancel a supervisor and park it until it finishes. The supervisor
    /// retires its own endpoint as soon as it observes the cancellation.
    fn retire(&mut self, udid: &str) {
        if let Some(managed) = self.managed.remove(udid) {
            info!(udid = %udid, "Device gone, terminating related process");
            managed.cancel.cancel();
            self.retiring.insert(udid.to_string(), managed);
        }
    }

    /// Collect retiring supervisors that have finished.
    async fn reap_retiring(&mut self) {
        let finished: Vec<String> = self
            .retiring
            .iter()
            .filter(|(_, retired)| retired.task.is_finished())
            .map(|(udid, _)| udid.clone())
            .collect();

        for udid in finished {
            if let Some(retired) = self.retiring.remove(&udid) {
                self.finish(&udid, retired).await;
            }
        }
    }

    /// Drop entries whose supervisor ended without being cancelled so the
    /// device is picked up again on this tick.
    async fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .managed
            .iter()
            .filter(|(_, managed)| managed.task.is_finished())
            .map(|(udid, _)| udid.clone())
            .collect();

        for udid in finished {
            if let Some(managed) = self.managed.remove(&udid) {
                warn!(udid = %udid, "Device supervisor ended unexpectedly, restarting");
                self.finish(&udid, managed).await;
            }
        }
    }

    /// Await a supervisor task. No other supervisor exists for `udid` at this
    /// point, so a panicked one's endpoint can be cleared safely.
    async fn finish(&self, udid: &str, device: ManagedDevice) {
        if let Err(e) = device.task.await {
            error!(
                udid = %udid,
                version = %device.record.os_version,
                error = %e,
                "Device supervisor panicked"
            );
            self.table.remove(udid);
        }
    }
}
