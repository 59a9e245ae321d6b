pub mod backoff;
pub mod channel;
pub mod dispatcher;
pub mod message;
pub mod state;
pub mod supervisor;
pub mod telemetry;

pub use backoff::Backoff;
pub use channel::{ChannelError, ChannelEvents, ChannelMessage, ConnectionState, SocketChannel};
pub use dispatcher::{CommandDispatcher, DispatchError};
pub use message::{Command, DeviceEvent, FileId, InboundMessage, TelemetryMessage};
pub use state::{LinkState, LinkStatus};
pub use supervisor::{ShutdownHandle, Supervisor};
pub use telemetry::{recompute_interval, Telemetry};

use crate::cloud::UploadEndpoints;
use crate::config::LinkConfig;
use crate::devices::{FileStorage, Printer};
use std::sync::Arc;
use tokio::sync::watch;

/// Resolve once `rx` reads true, or its sender is gone.
pub(crate) async fn wait_for_flag(rx: &mut watch::Receiver<bool>) {
    loop {
        let set = *rx.borrow_and_update();
        if set {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// The assembled link: shared state, telemetry handler, and supervisor.
pub struct CloudLink {
    state: Arc<LinkState>,
    telemetry: Arc<Telemetry>,
    supervisor: Arc<Supervisor>,
}

impl CloudLink {
    pub fn new(
        config: LinkConfig,
        printer: Arc<dyn Printer>,
        storage: Arc<dyn FileStorage>,
        uploads: Arc<dyn UploadEndpoints>,
    ) -> Self {
        let state = Arc::new(LinkState::new(config.push.idle()));
        let dispatcher = CommandDispatcher::new(printer, storage, uploads);
        let telemetry = Arc::new(Telemetry::new(
            state.clone(),
            dispatcher,
            config.push.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(config, telemetry.clone()));

        Self {
            state,
            telemetry,
            supervisor,
        }
    }

    pub fn state(&self) -> &Arc<LinkState> {
        &self.state
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.supervisor.shutdown_handle()
    }

    /// Run the supervisor on a background task.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    }
}
