use std::sync::Arc;
use std::time::Duration;

use fieldsync_core::{UserProfile, WorkOrderSnapshot};
use fieldsync_engine::{EngineConfig, EngineError, SyncEngine};
use fieldsync_storage::{LocalStore, SqliteStorage};

use crate::backend::FakeBackend;
use crate::network::NetworkSwitch;

/// Grace period for background tasks to observe a link change.
const SETTLE: Duration = Duration::from_millis(50);

/// One technician's phone: an initialized engine wired to a fake backend
/// through a network switch the test controls.
pub struct TestDevice {
    pub engine: Arc<SyncEngine>,
    pub backend: Arc<FakeBackend>,
    pub profile: UserProfile,
    pub network: NetworkSwitch,
}

impl TestDevice {
    /// Deterministic defaults: no jitter, no automatic drains.
    pub fn config() -> EngineConfig {
        EngineConfig {
            jitter: false,
            auto_sync: false,
            sync_on_enqueue: false,
            ..EngineConfig::default()
        }
    }

    pub fn profile() -> UserProfile {
        UserProfile::new("tech-1", "Dana", "Reyes")
    }

    pub fn new(backend: Arc<FakeBackend>, config: EngineConfig) -> Result<Self, EngineError> {
        let storage = SqliteStorage::open_in_memory()?;
        Self::with_storage(backend, config, storage)
    }

    /// Device whose cache already holds `orders`, as if downloaded earlier.
    pub fn seeded(
        backend: Arc<FakeBackend>,
        config: EngineConfig,
        orders: &[WorkOrderSnapshot],
    ) -> Result<Self, EngineError> {
        let mut storage = SqliteStorage::open_in_memory()?;
        storage.replace_all(&Self::profile().user_id, orders, 1)?;
        Self::with_storage(backend, config, storage)
    }

    pub fn with_storage(
        backend: Arc<FakeBackend>,
        config: EngineConfig,
        storage: SqliteStorage,
    ) -> Result<Self, EngineError> {
        let (network, link) = NetworkSwitch::new();
        let remote: Arc<dyn fieldsync_engine::RemoteClient> = backend.clone();
        let engine = SyncEngine::new(config, storage, remote, link);
        let profile = Self::profile();
        engine.init(profile.clone())?;
        Ok(Self {
            engine,
            backend,
            profile,
            network,
        })
    }

    /// Bring the link up and wait out the hold-down window.
    pub async fn go_online(&self) {
        self.network.connect();
        tokio::time::sleep(self.engine.config().hold_down() + SETTLE).await;
    }

    pub async fn go_offline(&self) {
        self.network.disconnect();
        tokio::time::sleep(SETTLE).await;
    }
}
