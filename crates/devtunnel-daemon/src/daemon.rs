//! Wires the reconciler, the address table and the control surface together.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::address::AddressTable;
use crate::directory::DeviceDirectory;
use crate::reconciler::{Reconciler, ReconcilerSettings};
use crate::server::{self, AppState};
use crate::tunnel::TunnelLauncher;

/// A fully assembled tunnel daemon.
pub struct Daemon {
    table: AddressTable,
    shutdown: CancellationToken,
    reconciler: Reconciler,
}

impl Daemon {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        launcher: Arc<TunnelLauncher>,
        settings: ReconcilerSettings,
    ) -> Self {
        let table = AddressTable::new();
        let shutdown = CancellationToken::new();
        let reconciler = Reconciler::new(
            directory,
            launcher,
            table.clone(),
            settings,
            shutdown.clone(),
        );
        Self {
            table,
            shutdown,
            reconciler,
        }
    }

    pub const fn table(&self) -> &AddressTable {
        &self.table
    }

    /// Token that stops the daemon when cancelled. `/shutdown`, Ctrl+C and
    /// SIGTERM all cancel it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the reconciler and serve the control surface until shutdown.
    ///
    /// Returns once every tunnel helper has been stopped.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let Self {
            table,
            shutdown,
            reconciler,
        } = self;

        let reconciler_handle = tokio::spawn(reconciler.run());

        let state = AppState {
            table,
            shutdown: shutdown.clone(),
        };
        let served = server::serve(listener, state).await;
        if let Err(e) = &served {
            error!(error = %e, "Control interface failed");
        }

        // Stop supervisors even when the server ended on its own.
        shutdown.cancel();
        if let Err(e) = reconciler_handle.await {
            error!(error = %e, "Device reconciler panicked");
        }
        info!("All tunnel helpers stopped");
        served
    }
}
