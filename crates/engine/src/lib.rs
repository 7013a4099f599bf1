pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod remote;
pub mod retry;

pub use config::EngineConfig;
pub use connectivity::{ConnectivityMonitor, Debouncer, LinkState};
pub use coordinator::{
    DownloadReport, SyncError, SyncNotification, SyncReport, SyncState, SyncStatus,
};
pub use error::EngineError;
pub use remote::{PushAck, RemoteClient, RemoteError};
pub use retry::RetryPolicy;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fieldsync_core::{
    DailyHoursEntry, GpsLocation, MutationId, MutationOp, PendingMutation, UserId, UserProfile,
    WorkOrderId, WorkOrderSnapshot, WorkOrderStatus, clock::physical_now,
};
use fieldsync_storage::{
    DeadLetter, LocalStore, MutationQueue, QueueEntry, SqliteStorage, StorageError,
};

use crate::remote::with_timeout;

const NOTIFICATION_CAPACITY: usize = 64;
const DISCARDED_BY_USER: &str = "discarded by user";

type SharedDrain = Shared<BoxFuture<'static, Result<SyncReport, SyncError>>>;

struct Session {
    profile: UserProfile,
    generation: u64,
    monitor: ConnectivityMonitor,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Session {
    fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Identifies the session a drain or download was started for. Writes made
/// on behalf of a session that has since ended are refused.
#[derive(Debug, Clone)]
struct SessionKey {
    user: UserId,
    generation: u64,
}

enum Trigger {
    Connectivity(bool),
    Interval,
}

/// Offline-first sync engine for one device.
///
/// Offline actions are applied to the local store and queued in one
/// transaction and never touch the network. Only the drain talks to the
/// remote, one mutation at a time, in queue order.
pub struct SyncEngine {
    config: EngineConfig,
    retry: RetryPolicy,
    store: Mutex<SqliteStorage>,
    remote: Arc<dyn RemoteClient>,
    link: watch::Receiver<LinkState>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    retry_epoch: AtomicU64,
    state_tx: watch::Sender<SyncState>,
    notify_tx: broadcast::Sender<SyncNotification>,
    inflight: Mutex<Option<(u64, SharedDrain)>>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        storage: SqliteStorage,
        remote: Arc<dyn RemoteClient>,
        link: watch::Receiver<LinkState>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SyncState::default());
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self {
            retry: config.retry_policy(),
            config,
            store: Mutex::new(storage),
            remote,
            link,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            retry_epoch: AtomicU64::new(0),
            state_tx,
            notify_tx,
            inflight: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start a session for `profile`: connectivity monitoring, reconnect and
    /// background sync. Must be called inside a tokio runtime.
    pub fn init(self: &Arc<Self>, profile: UserProfile) -> Result<(), EngineError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let monitor = ConnectivityMonitor::spawn(
            Arc::clone(&self.remote),
            self.link.clone(),
            self.config.hold_down(),
            self.config.probe_interval(),
            self.config.call_timeout(),
        );
        let watcher = tokio::spawn(watch_connectivity(
            Arc::downgrade(self),
            monitor.subscribe(),
            generation,
            self.config.background_sync_interval(),
        ));

        let user_id = profile.user_id.clone();
        let previous = self.lock_session()?.replace(Session {
            profile,
            generation,
            monitor,
            tasks: vec![watcher],
        });
        if let Some(previous) = previous {
            info!(user = %previous.profile.user_id, "replacing previous session");
            previous.stop();
        }
        self.clear_inflight();

        self.state_tx.send_replace(SyncState::default());
        self.refresh_counts()?;
        info!(user = %user_id, generation, "sync engine initialized");
        Ok(())
    }

    /// End the session and wipe the user's offline state. Queued mutations
    /// that never reached the server are reported before they are dropped.
    pub fn teardown(&self) -> Result<(), EngineError> {
        let Some(session) = self.lock_session()?.take() else {
            return Ok(());
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        let user = session.profile.user_id.clone();
        session.stop();
        self.clear_inflight();

        let discarded = {
            let mut store = self.lock_store()?;
            let pending = store.pending_count(&user)?;
            if pending > 0 {
                warn!(user = %user, pending, "discarding unsynced mutations on logout");
                self.notify(SyncNotification::PendingDiscarded { count: pending });
            }
            store.clear_user(&user)?;
            pending
        };

        self.state_tx.send_replace(SyncState::default());
        info!(user = %user, discarded, "sync engine torn down");
        Ok(())
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.lock_session()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.profile.clone()))
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn state(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<SyncNotification> {
        self.notify_tx.subscribe()
    }

    /// Debounced reachability of the backend.
    pub fn is_online(&self) -> bool {
        self.lock_session()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.monitor.is_online()))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Offline actions
    // ------------------------------------------------------------------

    pub fn offline_check_in(
        self: &Arc<Self>,
        wo_id: &WorkOrderId,
        location: Option<GpsLocation>,
    ) -> Result<WorkOrderSnapshot, EngineError> {
        self.record_action(wo_id, MutationOp::CheckIn { location })
    }

    pub fn offline_check_out(
        self: &Arc<Self>,
        wo_id: &WorkOrderId,
        location: Option<GpsLocation>,
    ) -> Result<WorkOrderSnapshot, EngineError> {
        self.record_action(wo_id, MutationOp::CheckOut { location })
    }

    pub fn offline_add_comment(
        self: &Arc<Self>,
        wo_id: &WorkOrderId,
        text: &str,
    ) -> Result<WorkOrderSnapshot, EngineError> {
        self.record_action(
            wo_id,
            MutationOp::AddComment {
                text: text.to_string(),
            },
        )
    }

    pub fn offline_update_status(
        self: &Arc<Self>,
        wo_id: &WorkOrderId,
        status: WorkOrderStatus,
    ) -> Result<WorkOrderSnapshot, EngineError> {
        self.record_action(wo_id, MutationOp::UpdateStatus { status })
    }

    pub fn offline_add_daily_hours(
        self: &Arc<Self>,
        wo_id: &WorkOrderId,
        entry: DailyHoursEntry,
    ) -> Result<WorkOrderSnapshot, EngineError> {
        self.record_action(wo_id, MutationOp::AddDailyHours { entry })
    }

    /// Queues the terminal mutation. Later actions on the same work order are
    /// still accepted and replay after it.
    pub fn offline_complete_work_order(
        self: &Arc<Self>,
        wo_id: &WorkOrderId,
    ) -> Result<WorkOrderSnapshot, EngineError> {
        self.record_action(wo_id, MutationOp::Complete)
    }

    fn record_action(
        self: &Arc<Self>,
        wo_id: &WorkOrderId,
        op: MutationOp,
    ) -> Result<WorkOrderSnapshot, EngineError> {
        op.validate()?;
        let (key, author) = {
            let session = self.lock_session()?;
            let session = session.as_ref().ok_or(EngineError::NotInitialized)?;
            (
                SessionKey {
                    user: session.profile.user_id.clone(),
                    generation: session.generation,
                },
                session.profile.display_name(),
            )
        };
        let now = physical_now()?;

        let recorded = self.with_session_store(&key, |store| {
            store.enqueue(&key.user, wo_id, &op, &author, now)
        });
        let (mutation, snapshot) = match recorded {
            Ok(recorded) => recorded,
            Err(EngineError::Storage(StorageError::NotFound(_))) => {
                return Err(EngineError::WorkOrderNotCached(wo_id.clone()));
            }
            Err(e) => return Err(e),
        };

        info!(
            mutation_id = %mutation.mutation_id,
            seq = mutation.seq,
            work_order = %wo_id,
            op = op.op_type_name(),
            "offline action recorded"
        );
        self.refresh_counts()?;
        if self.config.sync_on_enqueue && self.is_online() {
            self.spawn_sync("enqueue");
        }
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Queries (always served from the local store)
    // ------------------------------------------------------------------

    /// Every cached work order that is not completed.
    pub fn get_work_orders(&self) -> Result<Vec<WorkOrderSnapshot>, EngineError> {
        self.read(|store, user| store.list_work_orders(user, false))
    }

    pub fn get_completed_work_orders(&self) -> Result<Vec<WorkOrderSnapshot>, EngineError> {
        self.read(|store, user| store.list_work_orders(user, true))
    }

    pub fn get_work_order(
        &self,
        wo_id: &WorkOrderId,
    ) -> Result<Option<WorkOrderSnapshot>, EngineError> {
        self.read(|store, user| store.get_work_order(user, wo_id))
    }

    pub fn pending_mutations(&self) -> Result<Vec<QueueEntry>, EngineError> {
        self.read(|store, user| store.list_pending(user))
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, EngineError> {
        self.read(|store, user| store.list_dead_letters(user))
    }

    // ------------------------------------------------------------------
    // Stuck mutations
    // ------------------------------------------------------------------

    /// Give a stuck mutation a fresh set of attempts and drain again if online.
    pub fn retry_stuck(self: &Arc<Self>, mutation_id: MutationId) -> Result<(), EngineError> {
        let key = self.session_key()?;
        if !self.with_session_store(&key, |store| store.reset_stuck(&key.user, mutation_id))? {
            return Err(EngineError::MutationNotFound(mutation_id));
        }
        info!(%mutation_id, "stuck mutation reset");
        self.refresh_counts()?;
        if self.is_online() {
            self.spawn_sync("retry_stuck");
        }
        Ok(())
    }

    /// Drop a queued mutation on the user's request. It is kept as a dead
    /// letter and its work order is re-rendered without it.
    pub fn discard_mutation(&self, mutation_id: MutationId) -> Result<(), EngineError> {
        let key = self.session_key()?;
        match self.dead_letter(&key, mutation_id, DISCARDED_BY_USER)? {
            Some(_) => Ok(()),
            None => Err(EngineError::MutationNotFound(mutation_id)),
        }
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    /// Replace the cached work orders with the backend's current assignment
    /// list. On failure the existing cache is left exactly as it was.
    pub async fn download_for_offline(self: &Arc<Self>) -> Result<DownloadReport, SyncError> {
        let key = self.session_key()?;
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        {
            let inflight = self
                .inflight
                .lock()
                .map_err(|_| EngineError::LockPoisoned)?;
            let mut busy = inflight.is_some();
            if !busy {
                self.state_tx.send_if_modified(|state| {
                    if state.sync_status.is_busy() {
                        busy = true;
                        return false;
                    }
                    state.sync_status = SyncStatus::Downloading;
                    state.is_downloading = true;
                    true
                });
            }
            if busy {
                return Err(SyncError::Busy);
            }
        }

        info!(user = %key.user, "download started");
        match self.fetch_and_replace(&key).await {
            Ok(count) => {
                self.refresh_counts_logged();
                self.set_status(SyncStatus::Idle, None);
                self.notify(SyncNotification::DownloadCompleted { count });
                info!(user = %key.user, count, "download finished");
                Ok(DownloadReport { count })
            }
            Err(SyncError::NotInitialized) => Err(SyncError::NotInitialized),
            Err(err) => {
                warn!(user = %key.user, error = %err, "download failed; cache unchanged");
                self.set_status(SyncStatus::Error, Some(err.to_string()));
                self.notify(SyncNotification::DownloadFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn fetch_and_replace(&self, key: &SessionKey) -> Result<usize, SyncError> {
        let orders = with_timeout(
            self.config.call_timeout(),
            self.remote.fetch_assigned_work_orders(&key.user),
        )
        .await?;
        let now = physical_now().map_err(EngineError::from)?;
        self.with_session_store(key, |store| store.replace_all(&key.user, &orders, now))?;
        Ok(orders.len())
    }

    // ------------------------------------------------------------------
    // Drain
    // ------------------------------------------------------------------

    /// Drain the queue now. Joins the running drain if there is one.
    pub async fn force_sync(self: &Arc<Self>) -> Result<SyncReport, SyncError> {
        let drain = self.start_or_join_drain()?;
        drain.await
    }

    fn start_or_join_drain(self: &Arc<Self>) -> Result<SharedDrain, SyncError> {
        let key = self.session_key()?;
        let mut slot = self
            .inflight
            .lock()
            .map_err(|_| EngineError::LockPoisoned)?;
        if let Some((generation, drain)) = slot.as_ref() {
            if *generation == key.generation {
                debug!("joining in-flight drain");
                return Ok(drain.clone());
            }
        }
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        if self.state_tx.borrow().sync_status == SyncStatus::Downloading {
            return Err(SyncError::Busy);
        }

        let engine = Arc::clone(self);
        let generation = key.generation;
        let drain = async move {
            let result = engine.drain(&key).await;
            engine.finish_drain(generation);
            result
        }
        .boxed()
        .shared();
        *slot = Some((generation, drain.clone()));
        Ok(drain)
    }

    fn finish_drain(&self, generation: u64) {
        if let Ok(mut slot) = self.inflight.lock() {
            if matches!(slot.as_ref(), Some((g, _)) if *g == generation) {
                *slot = None;
            }
        }
    }

    fn clear_inflight(&self) {
        if let Ok(mut slot) = self.inflight.lock() {
            *slot = None;
        }
    }

    async fn drain(self: &Arc<Self>, key: &SessionKey) -> Result<SyncReport, SyncError> {
        self.set_status(SyncStatus::Syncing, None);
        info!(user = %key.user, "sync started");

        let mut report = SyncReport::default();
        let outcome = match self.drain_queue(key, &mut report).await {
            Ok(()) => self.finish_clean_drain(key, report).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(report) => Ok(report),
            Err(SyncError::NotInitialized) => Err(SyncError::NotInitialized),
            Err(err) => {
                self.refresh_counts_logged();
                self.set_status(SyncStatus::Error, Some(err.to_string()));
                if matches!(err, SyncError::Remote(_) | SyncError::Local(_)) {
                    self.notify(SyncNotification::SyncFailed {
                        error: err.to_string(),
                    });
                }
                info!(
                    user = %key.user,
                    synced = report.synced,
                    dead_lettered = report.dead_lettered,
                    error = %err,
                    "sync halted"
                );
                Err(err)
            }
        }
    }

    async fn finish_clean_drain(
        &self,
        key: &SessionKey,
        report: SyncReport,
    ) -> Result<SyncReport, SyncError> {
        if self.config.refresh_after_sync && report.dead_lettered == 0 {
            match self.fetch_and_replace(key).await {
                Ok(count) => debug!(count, "refreshed work orders after sync"),
                Err(SyncError::NotInitialized) => return Err(SyncError::NotInitialized),
                Err(e) => warn!(error = %e, "refresh after sync failed"),
            }
        }

        let now = physical_now().map_err(EngineError::from)?;
        self.with_session_store(key, |store| store.set_last_sync_time(&key.user, now))?;
        self.refresh_counts_logged();

        if report.dead_lettered == 0 {
            self.set_status(SyncStatus::Success, None);
        } else {
            self.set_status(
                SyncStatus::Error,
                Some(format!(
                    "{} mutation(s) rejected by the server",
                    report.dead_lettered
                )),
            );
        }
        self.notify(SyncNotification::SyncCompleted {
            synced: report.synced,
            dead_lettered: report.dead_lettered,
        });
        info!(
            user = %key.user,
            synced = report.synced,
            dead_lettered = report.dead_lettered,
            "sync finished"
        );
        Ok(report)
    }

    /// Push queued mutations oldest first. A retryable failure halts the
    /// drain where it is. A mutation that runs out of attempts is marked
    /// stuck and only its own work order stays blocked behind it; the drain
    /// moves on and reports `Stuck` once nothing else can be delivered.
    async fn drain_queue(
        self: &Arc<Self>,
        key: &SessionKey,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        loop {
            if !self.is_online() {
                return Err(SyncError::Offline);
            }
            let Some(entry) =
                self.with_session_store(key, |store| store.next_in_order(&key.user))?
            else {
                return match self.first_stuck(key)? {
                    Some(stuck) => Err(SyncError::Stuck {
                        mutation_id: stuck.mutation_id,
                        entity_id: stuck.entity_id,
                    }),
                    None => Ok(()),
                };
            };

            let mutation = match entry {
                QueueEntry::Ready(mutation) => mutation,
                QueueEntry::Corrupt {
                    mutation_id, error, ..
                } => {
                    let error = RemoteError::Serialization(error).to_string();
                    self.dead_letter(key, mutation_id, &error)?;
                    report.dead_lettered += 1;
                    continue;
                }
            };

            debug!(
                mutation_id = %mutation.mutation_id,
                seq = mutation.seq,
                work_order = %mutation.entity_id,
                op = mutation.op.op_type_name(),
                attempt = mutation.attempt_count + 1,
                "pushing mutation"
            );
            let pushed = with_timeout(
                self.config.call_timeout(),
                self.remote.push_mutation(&key.user, &mutation),
            )
            .await;

            match pushed {
                Ok(ack) if ack.entity_id != mutation.entity_id => {
                    let error = RemoteError::Serialization(format!(
                        "ack for {} answered mutation on {}",
                        ack.entity_id, mutation.entity_id
                    ))
                    .to_string();
                    self.dead_letter(key, mutation.mutation_id, &error)?;
                    report.dead_lettered += 1;
                }
                Ok(ack) => {
                    let now = physical_now().map_err(EngineError::from)?;
                    self.with_session_store(key, |store| {
                        store.dequeue(&key.user, mutation.mutation_id, &ack.server_state, now)
                    })?;
                    report.synced += 1;
                    self.refresh_counts_logged();
                }
                Err(err) if err.is_retryable() => {
                    let record = self.with_session_store(key, |store| {
                        store.mark_failed(
                            &key.user,
                            mutation.mutation_id,
                            &err.to_string(),
                            self.retry.max_attempts,
                        )
                    })?;
                    let attempts = record.mutation.attempt_count;
                    if record.became_stuck {
                        warn!(
                            mutation_id = %mutation.mutation_id,
                            work_order = %mutation.entity_id,
                            attempts,
                            error = %err,
                            "mutation stuck"
                        );
                        self.notify(SyncNotification::MutationStuck {
                            mutation_id: mutation.mutation_id,
                            entity_id: mutation.entity_id,
                            attempts,
                            error: err.to_string(),
                        });
                        self.refresh_counts_logged();
                        continue;
                    }
                    warn!(
                        mutation_id = %mutation.mutation_id,
                        attempts,
                        error = %err,
                        "push failed; will retry"
                    );
                    self.schedule_retry(key, attempts);
                    return Err(SyncError::Remote(err));
                }
                Err(err) => {
                    self.dead_letter(key, mutation.mutation_id, &err.to_string())?;
                    report.dead_lettered += 1;
                }
            }
        }
    }

    fn first_stuck(&self, key: &SessionKey) -> Result<Option<PendingMutation>, EngineError> {
        let pending = self.with_session_store(key, |store| store.list_pending(&key.user))?;
        Ok(pending.into_iter().find_map(|entry| match entry {
            QueueEntry::Ready(mutation) if mutation.is_stuck() => Some(mutation),
            _ => None,
        }))
    }

    fn dead_letter(
        &self,
        key: &SessionKey,
        mutation_id: MutationId,
        error: &str,
    ) -> Result<Option<DeadLetter>, EngineError> {
        let now = physical_now()?;
        let letter = self.with_session_store(key, |store| {
            store.dead_letter(&key.user, mutation_id, error, now)
        })?;
        if let Some(letter) = &letter {
            self.notify(SyncNotification::MutationDeadLettered {
                mutation_id,
                entity_id: letter.entity_id.clone(),
                error: error.to_string(),
            });
            self.refresh_counts_logged();
        }
        Ok(letter)
    }

    /// Wake up after the backoff delay and drain again. Only the most recently
    /// scheduled retry fires.
    fn schedule_retry(self: &Arc<Self>, key: &SessionKey, failures: u32) {
        let Some(delay) = self.retry.next_delay(failures) else {
            return;
        };
        let epoch = self.retry_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = key.generation;
        let engine = Arc::downgrade(self);
        debug!(?delay, failures, "retry scheduled");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if engine.retry_epoch.load(Ordering::SeqCst) != epoch
                || engine.generation.load(Ordering::SeqCst) != generation
                || !engine.is_online()
            {
                return;
            }
            if let Err(e) = engine.force_sync().await {
                debug!(error = %e, "retry drain did not complete");
            }
        });
    }

    fn spawn_sync(self: &Arc<Self>, reason: &'static str) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.force_sync().await {
                Ok(report) => debug!(reason, synced = report.synced, "triggered drain finished"),
                Err(e) => debug!(reason, error = %e, "triggered drain did not complete"),
            }
        });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn lock_store(&self) -> Result<MutexGuard<'_, SqliteStorage>, EngineError> {
        self.store.lock().map_err(|_| EngineError::LockPoisoned)
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, Option<Session>>, EngineError> {
        self.session.lock().map_err(|_| EngineError::LockPoisoned)
    }

    fn session_key(&self) -> Result<SessionKey, EngineError> {
        let session = self.lock_session()?;
        let session = session.as_ref().ok_or(EngineError::NotInitialized)?;
        Ok(SessionKey {
            user: session.profile.user_id.clone(),
            generation: session.generation,
        })
    }

    /// Run `f` against the store unless the session it belongs to has ended.
    /// The check happens under the store lock, so a teardown either sees the
    /// write or the write never happens.
    fn with_session_store<T>(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut SqliteStorage) -> Result<T, StorageError>,
    ) -> Result<T, EngineError> {
        let mut store = self.lock_store()?;
        if self.generation.load(Ordering::SeqCst) != key.generation {
            return Err(EngineError::NotInitialized);
        }
        Ok(f(&mut store)?)
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&SqliteStorage, &UserId) -> Result<T, StorageError>,
    ) -> Result<T, EngineError> {
        let key = self.session_key()?;
        let store = self.lock_store()?;
        Ok(f(&store, &key.user)?)
    }

    fn refresh_counts(&self) -> Result<(), EngineError> {
        let key = self.session_key()?;
        let (pending, stuck, cached, last_sync) = {
            let store = self.lock_store()?;
            (
                store.pending_count(&key.user)?,
                store.stuck_count(&key.user)?,
                store.cached_count(&key.user)?,
                store.last_sync_time(&key.user)?,
            )
        };
        let online = self.is_online();
        self.state_tx.send_modify(|state| {
            state.is_online = online;
            state.pending_sync_count = pending;
            state.stuck_count = stuck;
            state.cached_count = cached;
            state.last_sync_time = last_sync;
        });
        Ok(())
    }

    fn refresh_counts_logged(&self) {
        if let Err(e) = self.refresh_counts() {
            warn!(error = %e, "failed to refresh sync state");
        }
    }

    fn set_status(&self, status: SyncStatus, error: Option<String>) {
        self.state_tx.send_modify(|state| {
            state.sync_status = status;
            state.is_downloading = status == SyncStatus::Downloading;
            match error {
                Some(error) => state.last_error = Some(error),
                None if matches!(status, SyncStatus::Success | SyncStatus::Idle) => {
                    state.last_error = None;
                }
                None => {}
            }
        });
    }

    fn notify(&self, notification: SyncNotification) {
        // No subscribers is fine; the persistent state still reflects it.
        let _ = self.notify_tx.send(notification);
    }
}

/// Publishes connectivity into the sync state and starts drains on
/// reconnect and on the background interval.
async fn watch_connectivity(
    engine: Weak<SyncEngine>,
    mut online: watch::Receiver<bool>,
    generation: u64,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            changed = online.changed() => match changed {
                Ok(()) => Trigger::Connectivity(*online.borrow_and_update()),
                Err(_) => return,
            },
            _ = ticker.tick() => Trigger::Interval,
        };

        let Some(engine) = engine.upgrade() else {
            return;
        };
        if engine.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let reason = match trigger {
            Trigger::Connectivity(is_online) => {
                engine.state_tx.send_modify(|state| state.is_online = is_online);
                if !is_online {
                    continue;
                }
                "reconnect"
            }
            Trigger::Interval => "interval",
        };

        let state = engine.state();
        if engine.config.auto_sync
            && engine.is_online()
            && state.pending_sync_count > state.stuck_count
        {
            engine.spawn_sync(reason);
        }
    }
}
