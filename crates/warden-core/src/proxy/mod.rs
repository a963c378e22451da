//! Operation queueing, merging, and replay toward the worker service.
//!
//! [`OperationProxy`] accepts operation requests and lifecycle notifications
//! at any time, including while the worker is disconnected. Requests made
//! while disconnected are merged into the pending-operation set; lifecycle
//! notifications update the per-user state map. When the supervisor reports a
//! fresh handshake, the proxy replays the minimal correct call sequence so the
//! worker recovers the semantic state it lost in the crash.
//!
//! # Thread Safety
//!
//! Entry points may be invoked concurrently from arbitrary tasks. One shared
//! mutex protects the pending set and lifecycle map; it is always released
//! before any outbound call so a slow transport can never be reentered while
//! the state is locked.

mod pending;

pub use pending::{PendingOperation, PendingSet};

use crate::lifecycle::{LifecycleEventType, LifecycleStage, UserId, SYSTEM_USER};
use crate::metrics::UserLifecycleTracker;
use crate::worker::{ResetCallback, WorkerClient};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Snapshot of the proxy's state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub connected: bool,
    pub crashed: bool,
    pub pending_init_boot_user: bool,
    pub pending_user_removals: Vec<UserId>,
    pub pending_factory_reset: bool,
    pub lifecycle_stages: HashMap<UserId, LifecycleStage>,
    pub current_user: Option<UserId>,
    pub previous_user: Option<UserId>,
}

/// One lifecycle call scheduled during replay.
type ReplayEvent = (LifecycleEventType, Option<UserId>, UserId);

/// Everything extracted under the lock for one reconnect replay.
struct ReplayPlan {
    init_boot_user: bool,
    users_removed: Vec<UserId>,
    factory_reset: Option<ResetCallback>,
    lifecycle: Vec<ReplayEvent>,
}

struct ProxyState {
    client: Option<Arc<dyn WorkerClient>>,
    crashed: bool,
    pending: PendingSet,
    stages: HashMap<UserId, LifecycleStage>,
    current_user: Option<UserId>,
    previous_user: Option<UserId>,
    tracker: UserLifecycleTracker,
}

impl ProxyState {
    /// The client to forward through right now, or `None` while disconnected
    /// or suspended after a crash.
    fn forwarding_client(&self) -> Option<Arc<dyn WorkerClient>> {
        if self.crashed {
            return None;
        }
        self.client.clone()
    }

    fn stamp_stage(&mut self, user_id: UserId, stage: LifecycleStage) {
        if let Some(old) = self.stages.get(&user_id) {
            // Stage merging intentionally overwrites without an ordinal
            // check; a backward move is suspicious enough to surface.
            if *old > stage {
                warn!(
                    "user {} lifecycle stage moved backward: {:?} -> {:?}",
                    user_id, old, stage
                );
            }
        }
        self.stages.insert(user_id, stage);
    }

    fn apply_lifecycle_event(
        &mut self,
        event: LifecycleEventType,
        from: Option<UserId>,
        to: UserId,
    ) {
        self.tracker.on_event(event, to, Instant::now());

        match event {
            LifecycleEventType::Switching => {
                self.current_user = Some(to);
                self.previous_user = from;
                self.stamp_stage(to, LifecycleStage::Switching);
            }
            LifecycleEventType::Stopping | LifecycleEventType::Stopped => {
                // No stage survives a stop; the next event starts fresh.
                self.stages.remove(&to);
            }
            other => {
                if let Some(stage) = LifecycleStage::from_event(other) {
                    self.stamp_stage(to, stage);
                }
            }
        }
    }

    /// Order users for lifecycle resynchronization: system user first, then
    /// the current foreground user, then everyone else.
    fn lifecycle_replay_plan(&self) -> Vec<ReplayEvent> {
        let mut order: Vec<UserId> = Vec::with_capacity(self.stages.len());
        if self.stages.contains_key(&SYSTEM_USER) {
            order.push(SYSTEM_USER);
        }
        if let Some(current) = self.current_user {
            if current != SYSTEM_USER && self.stages.contains_key(&current) {
                order.push(current);
            }
        }
        for user in self.stages.keys() {
            if !order.contains(user) {
                order.push(*user);
            }
        }

        let mut plan = Vec::new();
        for user in order {
            let stage = self.stages[&user];
            let is_current = self.current_user == Some(user);
            for event in stage.replay_events(is_current) {
                let from = match event {
                    LifecycleEventType::Switching => self.previous_user,
                    _ => None,
                };
                plan.push((event, from, user));
            }
        }
        plan
    }
}

/// Owns the pending-operation queue and the per-user lifecycle map.
pub struct OperationProxy {
    state: Mutex<ProxyState>,
}

impl OperationProxy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProxyState {
                client: None,
                crashed: false,
                pending: PendingSet::default(),
                stages: HashMap::new(),
                current_user: None,
                previous_user: None,
                tracker: UserLifecycleTracker::new(),
            }),
        }
    }

    /// Ask the worker to initialize the boot user, or queue the request until
    /// the next reconnect. Duplicate queued requests collapse.
    pub async fn request_init_boot_user(&self) {
        let client = {
            let mut state = self.state.lock().unwrap();
            match state.forwarding_client() {
                Some(client) => client,
                None => {
                    debug!("initBootUser deferred: worker not connected");
                    state.pending.merge(PendingOperation::InitBootUser);
                    return;
                }
            }
        };
        self.forward_init_boot_user(&client).await;
    }

    /// Notify the worker that `user_id` was removed, or append it to the
    /// queued removal list until the next reconnect.
    pub async fn request_user_removed(&self, user_id: UserId) {
        let client = {
            let mut state = self.state.lock().unwrap();
            match state.forwarding_client() {
                Some(client) => client,
                None => {
                    debug!("user removal of {} deferred: worker not connected", user_id);
                    state
                        .pending
                        .merge(PendingOperation::UsersRemoved(vec![user_id]));
                    return;
                }
            }
        };
        self.forward_user_removed(&client, user_id).await;
    }

    /// Hand the worker a factory-reset confirmation.
    ///
    /// The pending entry is stored (replacing any previous callback) even when
    /// the request is sent immediately: the confirmation flow must restart
    /// from scratch if the worker crashes before acknowledging. Only
    /// [`acknowledge_factory_reset`](Self::acknowledge_factory_reset) removes
    /// the entry.
    pub async fn request_factory_reset(&self, callback: ResetCallback) {
        let client = {
            let mut state = self.state.lock().unwrap();
            state
                .pending
                .merge(PendingOperation::FactoryReset(callback.clone()));
            state.forwarding_client()
        };
        match client {
            Some(client) => {
                self.forward_factory_reset(&client, callback).await;
            }
            None => debug!("factory reset deferred: worker not connected"),
        }
    }

    /// External confirmation that the factory reset was acknowledged; removes
    /// the re-armed pending entry. Returns whether one was pending.
    pub fn acknowledge_factory_reset(&self) -> bool {
        let cleared = self.state.lock().unwrap().pending.clear_factory_reset();
        if cleared {
            info!("factory reset acknowledged; pending entry cleared");
        }
        cleared
    }

    /// Record a user lifecycle transition and forward it if connected.
    ///
    /// While disconnected, no event is queued: the lifecycle map is updated
    /// and reconstructed wholesale on reconnect instead of replayed as a log.
    pub async fn record_lifecycle_event(
        &self,
        event: LifecycleEventType,
        from: Option<UserId>,
        to: UserId,
    ) {
        let client = {
            let mut state = self.state.lock().unwrap();
            state.apply_lifecycle_event(event, from, to);
            state.forwarding_client()
        };
        if let Some(client) = client {
            self.forward_lifecycle_event(&client, event, from, to).await;
        }
    }

    /// The worker reconnected and completed its handshake: store the client,
    /// clear the crashed flag, and replay pending operations and lifecycle
    /// state in the required order.
    pub async fn on_reconnected(&self, client: Arc<dyn WorkerClient>) {
        let plan = {
            let mut state = self.state.lock().unwrap();
            state.client = Some(client.clone());
            state.crashed = false;
            // Snapshot only: each entry leaves the pending set after its
            // send succeeds, so a crash mid-replay keeps the failed and
            // unsent remainder for the next reconnect. FactoryReset never
            // leaves except by explicit acknowledgment.
            ReplayPlan {
                init_boot_user: state.pending.has_init_boot_user(),
                users_removed: state.pending.users_removed().to_vec(),
                factory_reset: state.pending.factory_reset(),
                lifecycle: state.lifecycle_replay_plan(),
            }
        };

        info!(
            "worker reconnected; replaying {} queued removal(s), {} lifecycle event(s), init={}, factory_reset={}",
            plan.users_removed.len(),
            plan.lifecycle.len(),
            plan.init_boot_user,
            plan.factory_reset.is_some()
        );

        if plan.init_boot_user {
            if !self.forward_init_boot_user(&client).await {
                return;
            }
            self.state.lock().unwrap().pending.clear_init_boot_user();
        }
        for user_id in plan.users_removed {
            if !self.forward_user_removed(&client, user_id).await {
                return;
            }
            self.state.lock().unwrap().pending.remove_user_removed(user_id);
        }
        if let Some(callback) = plan.factory_reset {
            if !self.forward_factory_reset(&client, callback).await {
                return;
            }
        }
        for (event, from, to) in plan.lifecycle {
            if !self.forward_lifecycle_event(&client, event, from, to).await {
                return;
            }
        }
    }

    /// The worker crashed: keep accepting requests and state updates, but
    /// skip forwarding until the next [`on_reconnected`](Self::on_reconnected).
    pub fn handle_crash(&self) {
        let mut state = self.state.lock().unwrap();
        state.crashed = true;
        state.client = None;
        warn!("worker connection lost; deferring operations until reconnect");
    }

    /// Snapshot of the proxy state.
    pub fn status(&self) -> ProxyStatus {
        let state = self.state.lock().unwrap();
        ProxyStatus {
            connected: state.client.is_some() && !state.crashed,
            crashed: state.crashed,
            pending_init_boot_user: state.pending.has_init_boot_user(),
            pending_user_removals: state.pending.users_removed().to_vec(),
            pending_factory_reset: state.pending.has_factory_reset(),
            lifecycle_stages: state.stages.clone(),
            current_user: state.current_user,
            previous_user: state.previous_user,
        }
    }

    /// Render the diagnostic dump: pending operations, the lifecycle map with
    /// the current/previous user pair, and the lifecycle timing metrics.
    pub fn dump(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Operation proxy: connected={}, crashed={}",
            state.client.is_some() && !state.crashed,
            state.crashed
        );
        let _ = writeln!(out, "Pending operations: {:?}", state.pending);
        let _ = writeln!(
            out,
            "Lifecycle: current_user={:?}, previous_user={:?}",
            state.current_user, state.previous_user
        );
        let mut users: Vec<_> = state.stages.iter().collect();
        users.sort_by_key(|(user, _)| **user);
        for (user, stage) in users {
            let _ = writeln!(out, "  user {}: {:?}", user, stage);
        }
        state.tracker.dump_into(&mut out);
        out
    }

    /// Metrics-only dump: just the lifecycle timing section.
    pub fn dump_metrics(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        state.tracker.dump_into(&mut out);
        out
    }

    /// Machine-readable status snapshot.
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::to_value(self.status()).unwrap_or(serde_json::Value::Null)
    }

    // Forward helpers. Each returns whether the call went through; a failure
    // sets the crashed flag so further forwarding is suspended.

    async fn forward_init_boot_user(&self, client: &Arc<dyn WorkerClient>) -> bool {
        match client.init_boot_user().await {
            Ok(()) => {
                debug!("initBootUser forwarded");
                true
            }
            Err(e) => self.note_forward_failure("initBootUser", &e),
        }
    }

    async fn forward_user_removed(&self, client: &Arc<dyn WorkerClient>, user_id: UserId) -> bool {
        match client.on_user_removed(user_id).await {
            Ok(()) => {
                debug!("user removal of {} forwarded", user_id);
                true
            }
            Err(e) => self.note_forward_failure("onUserRemoved", &e),
        }
    }

    async fn forward_factory_reset(
        &self,
        client: &Arc<dyn WorkerClient>,
        callback: ResetCallback,
    ) -> bool {
        match client.on_factory_reset(callback).await {
            Ok(()) => {
                info!("factory reset forwarded; entry stays pending until acknowledged");
                true
            }
            Err(e) => self.note_forward_failure("onFactoryReset", &e),
        }
    }

    async fn forward_lifecycle_event(
        &self,
        client: &Arc<dyn WorkerClient>,
        event: LifecycleEventType,
        from: Option<UserId>,
        to: UserId,
    ) -> bool {
        match client.on_user_lifecycle_event(event, from, to).await {
            Ok(()) => true,
            Err(e) => self.note_forward_failure("onUserLifecycleEvent", &e),
        }
    }

    fn note_forward_failure(&self, call: &str, error: &crate::WardenError) -> bool {
        warn!("{} failed ({}); treating worker as crashed", call, error);
        self.handle_crash();
        false
    }
}

impl Default for OperationProxy {
    fn default() -> Self {
        Self::new()
    }
}
