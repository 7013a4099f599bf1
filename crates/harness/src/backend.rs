use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fieldsync_core::{MutationId, PendingMutation, UserId, WorkOrderId, WorkOrderSnapshot};
use fieldsync_engine::{PushAck, RemoteClient, RemoteError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Applied,
    /// Same mutation id seen before; answered from the ledger.
    Replayed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PushRecord {
    pub mutation_id: MutationId,
    pub entity_id: WorkOrderId,
    pub op_type: &'static str,
    pub outcome: PushOutcome,
}

#[derive(Default)]
struct BackendState {
    orders: BTreeMap<WorkOrderId, WorkOrderSnapshot>,
    assignments: BTreeMap<UserId, Vec<WorkOrderId>>,
    ledger: HashMap<MutationId, PushAck>,
    log: Vec<PushRecord>,
    unreachable: bool,
    failing: BTreeMap<WorkOrderId, RemoteError>,
    drop_next_ack: bool,
    delay: Option<Duration>,
    fetch_error: Option<RemoteError>,
    probes: usize,
}

/// In-memory backend. Applies pushed mutations to its own copy of each work
/// order and keeps an idempotency ledger keyed by mutation id.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn assign(&self, user: &UserId, orders: Vec<WorkOrderSnapshot>) {
        let mut state = self.lock();
        let ids = state.assignments.entry(user.clone()).or_default();
        for order in &orders {
            if !ids.contains(&order.id) {
                ids.push(order.id.clone());
            }
        }
        for order in orders {
            state.orders.insert(order.id.clone(), order);
        }
    }

    /// Take a work order off the user's list; it stays on the server.
    pub fn unassign(&self, user: &UserId, id: &WorkOrderId) {
        if let Some(ids) = self.lock().assignments.get_mut(user) {
            ids.retain(|assigned| assigned != id);
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Every push for `entity_id` fails with `error` until healed.
    pub fn fail_entity(&self, entity_id: &WorkOrderId, error: RemoteError) {
        self.lock().failing.insert(entity_id.clone(), error);
    }

    pub fn reject_entity(&self, entity_id: &WorkOrderId, reason: &str) {
        self.fail_entity(
            entity_id,
            RemoteError::Rejected {
                reason: reason.to_string(),
            },
        );
    }

    pub fn heal(&self, entity_id: &WorkOrderId) {
        self.lock().failing.remove(entity_id);
    }

    /// Apply the next push but lose the answer on the way back.
    pub fn drop_next_ack(&self) {
        self.lock().drop_next_ack = true;
    }

    /// Hold every push for `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn fail_fetch(&self, error: Option<RemoteError>) {
        self.lock().fetch_error = error;
    }

    pub fn work_order(&self, id: &WorkOrderId) -> Option<WorkOrderSnapshot> {
        self.lock().orders.get(id).cloned()
    }

    pub fn push_log(&self) -> Vec<PushRecord> {
        self.lock().log.clone()
    }

    /// Mutation ids in the order they first took effect.
    pub fn applied(&self) -> Vec<MutationId> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.outcome == PushOutcome::Applied)
            .map(|r| r.mutation_id)
            .collect()
    }

    pub fn applied_ops(&self) -> Vec<&'static str> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.outcome == PushOutcome::Applied)
            .map(|r| r.op_type)
            .collect()
    }

    pub fn push_attempts(&self) -> usize {
        self.lock().log.len()
    }

    pub fn probes(&self) -> usize {
        self.lock().probes
    }
}

#[async_trait]
impl RemoteClient for FakeBackend {
    async fn fetch_assigned_work_orders(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<WorkOrderSnapshot>, RemoteError> {
        let state = self.lock();
        if state.unreachable {
            return Err(RemoteError::Connectivity("backend unreachable".into()));
        }
        if let Some(err) = &state.fetch_error {
            return Err(err.clone());
        }
        let ids = state.assignments.get(user_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.orders.get(id).cloned())
            .collect())
    }

    async fn push_mutation(
        &self,
        _user_id: &UserId,
        mutation: &PendingMutation,
    ) -> Result<PushAck, RemoteError> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.unreachable {
            return Err(RemoteError::Connectivity("backend unreachable".into()));
        }

        let mut record = PushRecord {
            mutation_id: mutation.mutation_id,
            entity_id: mutation.entity_id.clone(),
            op_type: mutation.op.op_type_name(),
            outcome: PushOutcome::Failed,
        };

        if let Some(err) = state.failing.get(&mutation.entity_id).cloned() {
            state.log.push(record);
            return Err(err);
        }

        if let Some(ack) = state.ledger.get(&mutation.mutation_id).cloned() {
            debug!(mutation_id = %mutation.mutation_id, "replayed mutation answered from ledger");
            record.outcome = PushOutcome::Replayed;
            state.log.push(record);
            return Ok(ack);
        }

        let Some(order) = state.orders.get_mut(&mutation.entity_id) else {
            state.log.push(record);
            return Err(RemoteError::Rejected {
                reason: format!("unknown work order {}", mutation.entity_id),
            });
        };
        order.apply(&mutation.patch());
        order.locally_modified = false;
        let ack = PushAck {
            entity_id: mutation.entity_id.clone(),
            server_state: order.clone(),
        };
        state.ledger.insert(mutation.mutation_id, ack.clone());
        record.outcome = PushOutcome::Applied;
        state.log.push(record);

        if state.drop_next_ack {
            state.drop_next_ack = false;
            return Err(RemoteError::Connectivity("connection reset before ack".into()));
        }
        Ok(ack)
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.probes += 1;
        if state.unreachable {
            return Err(RemoteError::Connectivity("backend unreachable".into()));
        }
        Ok(())
    }
}
