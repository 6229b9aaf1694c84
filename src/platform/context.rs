use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::events::EventLog;
use crate::filesync::DataDir;
use crate::persistence::Store;
use crate::platform::config::AppConfig;
use crate::scheduler::JobScheduler;
use crate::session::SessionRegistry;

/// Everything a handler or background loop needs, threaded through Axum's
/// state extractor and the scheduler loops alike. Cheap to clone: a single
/// `Arc` around the shared pieces, mirroring the teacher's `PlatformContext`.
#[derive(Clone)]
pub struct PlatformContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

struct SharedState {
    config: AppConfig,
    store: Arc<dyn Store>,
    sessions: Arc<SessionRegistry>,
    events: Arc<EventLog>,
    data_dir: DataDir,
    scheduler: Arc<JobScheduler>,
}

impl PlatformContext {
    pub(crate) fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        sessions: Arc<SessionRegistry>,
        events: Arc<EventLog>,
        data_dir: DataDir,
        scheduler: Arc<JobScheduler>,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = SharedState {
            config,
            store,
            sessions,
            events,
            data_dir,
            scheduler,
        };

        Self {
            shared: Arc::new(shared),
            shutdown,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.shared.store)
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.shared.sessions)
    }

    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.shared.events)
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.shared.data_dir
    }

    pub fn scheduler(&self) -> Arc<JobScheduler> {
        Arc::clone(&self.shared.scheduler)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
