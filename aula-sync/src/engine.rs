//! The synchronization engine: drains the pending-action queue for a scope
//! through a feature adapter, with a single-flight guarantee per scope,
//! throttled automatic resyncs, and per-action failure isolation.
//!
//! Concurrency model: one in-flight pass per scope (concurrent callers share
//! the same result), passes for different scopes interleave freely. The lock
//! map is in-memory only; after a crash mid-pass the persistent synced flags
//! and snapshots are what recovery is built from.

use crate::action::{PendingAction, ScopeKey, SyncOutcome};
use crate::error::{SyncError, SyncResult};
use crate::gateway::Connectivity;
use crate::store::{now_millis, ActionStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use events_bus::EventBus;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Event fired on the bus after every completed sync pass. Payload:
/// `{ "scope": <scope key>, "warnings": [..], "updated": bool }`.
pub const SYNC_COMPLETED_EVENT: &str = "aula_sync_completed";

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum time between automatic syncs of one scope.
    pub min_sync_interval: Duration,
    /// Whether automatic syncs run on metered connections.
    pub sync_on_metered: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_sync_interval: Duration::from_secs(300),
            sync_on_metered: false,
        }
    }
}

/// What a feature module contributes to a sync pass: the mapping from one
/// queued action to the site write(s) that deliver it.
///
/// Implementations must classify failures as [`SyncError::Rejected`] or
/// [`SyncError::Unreachable`]; the engine's retry and isolation decisions
/// hinge on that split. Adapters for ordered feature data (message threads)
/// should check whether the server already has the item — e.g. from a recent
/// fetch window — and return `Ok(())` without re-sending, so a send whose
/// confirmation was lost does not produce a duplicate.
#[async_trait]
pub trait ScopeAdapter: Send + Sync + 'static {
    /// Deliver one queued action to the server.
    async fn apply_one(&self, action: &PendingAction) -> SyncResult<()>;
}

type SharedPass = Shared<BoxFuture<'static, Result<SyncOutcome, Arc<SyncError>>>>;

/// Synchronization engine for one site.
pub struct SyncEngine {
    store: Arc<ActionStore>,
    bus: Arc<EventBus>,
    connectivity: Arc<dyn Connectivity>,
    config: EngineConfig,
    in_flight: DashMap<String, SharedPass>,
    blocked: DashMap<String, u32>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<ActionStore>,
        bus: Arc<EventBus>,
        connectivity: Arc<dyn Connectivity>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            connectivity,
            config,
            in_flight: DashMap::new(),
            blocked: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<ActionStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Mark a scope as in active use (e.g. the activity is being played).
    /// Blocked scopes are skipped by automatic sync and refused by forced
    /// sync. Calls nest; each `block` needs a matching [`Self::unblock`].
    pub fn block(&self, scope: &ScopeKey) {
        *self.blocked.entry(scope.to_string()).or_insert(0) += 1;
    }

    pub fn unblock(&self, scope: &ScopeKey) {
        let key = scope.to_string();
        let remove = match self.blocked.get_mut(&key) {
            Some(mut count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            self.blocked.remove(&key);
        }
    }

    pub fn is_blocked(&self, scope: &ScopeKey) -> bool {
        self.blocked.contains_key(&scope.to_string())
    }

    /// Whether enough time has passed since the scope's last sync pass.
    pub async fn is_sync_needed(&self, scope: &ScopeKey) -> SyncResult<bool> {
        let Some(last) = self.store.last_sync(scope).await? else {
            return Ok(true);
        };

        let elapsed = now_millis().saturating_sub(last);
        Ok(elapsed >= self.config.min_sync_interval.as_millis() as i64)
    }

    /// Automatic sync: skips silently when the scope is blocked, the network
    /// is metered, or the throttle interval has not elapsed.
    pub async fn sync_if_needed(
        self: &Arc<Self>,
        scope: &ScopeKey,
        adapter: Arc<dyn ScopeAdapter>,
    ) -> SyncResult<Option<SyncOutcome>> {
        if self.is_blocked(scope) {
            tracing::debug!(scope = %scope, "skipping automatic sync of blocked scope");
            return Ok(None);
        }

        if self.connectivity.is_metered() && !self.config.sync_on_metered {
            tracing::debug!(scope = %scope, "skipping automatic sync on metered network");
            return Ok(None);
        }

        if !self.is_sync_needed(scope).await? {
            return Ok(None);
        }

        self.sync(scope, adapter).await.map(Some)
    }

    /// Synchronize a scope now. If a pass is already in flight for the scope
    /// the caller shares its result instead of starting a second pass.
    pub async fn sync(
        self: &Arc<Self>,
        scope: &ScopeKey,
        adapter: Arc<dyn ScopeAdapter>,
    ) -> SyncResult<SyncOutcome> {
        if self.is_blocked(scope) {
            tracing::debug!(scope = %scope, "cannot sync blocked scope");
            return Err(SyncError::Blocked(scope.to_string()));
        }

        let this = Arc::clone(self);
        let scope_owned = scope.clone();

        self.run_scoped(scope, move || {
            async move { this.perform_pass(&scope_owned, adapter).await }.boxed()
        })
        .await
    }

    /// Run an arbitrary sync task under the scope's single-flight lock.
    /// Session-based scopes route their collision-aware passes through here
    /// so they share the same lock map and result sharing as queue scopes.
    pub async fn run_scoped<F>(self: &Arc<Self>, scope: &ScopeKey, task: F) -> SyncResult<SyncOutcome>
    where
        F: FnOnce() -> BoxFuture<'static, SyncResult<SyncOutcome>>,
    {
        let key = scope.to_string();

        let shared = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(scope = %scope, "joining in-flight sync pass");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let pass = task().map(|result| result.map_err(Arc::new)).boxed().shared();
                entry.insert(pass.clone());
                pass
            }
        };

        let result = shared.clone().await;

        // Only drop our own entry; a newer pass may already own the key.
        self.in_flight.remove_if(&key, |_, pass| pass.ptr_eq(&shared));

        result.map_err(SyncError::Shared)
    }

    /// Resolve once any in-flight sync for the scope settles. Returns
    /// immediately when none is running. UI read paths call this so they
    /// never observe mid-flight state.
    pub async fn wait_for_sync(&self, scope: &ScopeKey) {
        let shared = self.in_flight.get(&scope.to_string()).map(|entry| entry.value().clone());

        if let Some(shared) = shared {
            let _ = shared.await;
        }
    }

    /// The sanctioned way for UI code to drop a queued action (undo).
    pub async fn discard(&self, scope: &ScopeKey, item_key: &str, kind: crate::action::ActionKind) -> SyncResult<()> {
        self.store.delete(scope, item_key, kind).await
    }

    async fn perform_pass(&self, scope: &ScopeKey, adapter: Arc<dyn ScopeAdapter>) -> SyncResult<SyncOutcome> {
        let pass_id = Uuid::new_v4();
        tracing::debug!(scope = %scope, %pass_id, "starting sync pass");

        let pending = self.store.list_scope(scope).await?;

        if pending.is_empty() {
            self.store.set_last_sync(scope, now_millis()).await?;
            return Ok(SyncOutcome::default());
        }

        if !self.connectivity.is_online() {
            // Timestamp stays unset so the next check retries soon.
            return Err(SyncError::Unreachable("device is offline".to_string()));
        }

        let mut outcome = SyncOutcome::default();

        for action in &pending {
            match adapter.apply_one(action).await {
                Ok(()) => {
                    // Committed per action, never batched at the end of the
                    // pass, so an abort cannot resend what already landed.
                    self.store.delete(&action.scope, &action.item_key, action.kind).await?;
                    outcome.updated = true;
                }
                Err(err) if err.is_rejected() => {
                    // Retrying unchanged input would fail identically; drop
                    // the action and keep going with the rest.
                    tracing::warn!(
                        scope = %scope,
                        %pass_id,
                        item = %action.item_key,
                        error = %err,
                        "action rejected by server, discarding"
                    );
                    outcome.warnings.push(format!("{}: {err}", action.item_key));
                    self.store.delete(&action.scope, &action.item_key, action.kind).await?;
                }
                Err(err) => {
                    tracing::warn!(
                        scope = %scope,
                        %pass_id,
                        item = %action.item_key,
                        error = %err,
                        "aborting sync pass"
                    );
                    return Err(err);
                }
            }
        }

        self.finish_pass(scope, &outcome).await?;

        Ok(outcome)
    }

    /// Record the pass and notify subscribers. Shared by the queue path and
    /// the session/attempt path.
    pub(crate) async fn finish_pass(&self, scope: &ScopeKey, outcome: &SyncOutcome) -> SyncResult<()> {
        self.store.set_last_sync(scope, now_millis()).await?;

        let payload = serde_json::json!({
            "scope": scope.to_string(),
            "warnings": outcome.warnings,
            "updated": outcome.updated,
        });
        self.bus.trigger(SYNC_COMPLETED_EVENT, &payload, self.store.site_id());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::gateway::AlwaysOnline;
    use crate::store::LocalStoreConfig;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Reply {
        Accept,
        Reject,
        Unreachable,
    }

    /// Mocked online write gateway: scripted replies per item, records calls.
    struct ScriptedAdapter {
        replies: HashMap<String, Reply>,
        calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedAdapter {
        fn accepting() -> Self {
            Self {
                replies: HashMap::new(),
                calls: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn with_reply(mut self, item: &str, reply: Reply) -> Self {
            self.replies.insert(item.to_string(), reply);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ScopeAdapter for ScriptedAdapter {
        async fn apply_one(&self, action: &PendingAction) -> SyncResult<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.calls.lock().unwrap().push(action.item_key.clone());

            match self.replies.get(&action.item_key).copied().unwrap_or(Reply::Accept) {
                Reply::Accept => Ok(()),
                Reply::Reject => Err(SyncError::Rejected("invalid input".to_string())),
                Reply::Unreachable => Err(SyncError::Unreachable("connection lost".to_string())),
            }
        }
    }

    struct Offline;

    impl Connectivity for Offline {
        fn is_online(&self) -> bool {
            false
        }

        fn is_metered(&self) -> bool {
            false
        }
    }

    async fn test_engine(connectivity: Arc<dyn Connectivity>) -> (Arc<SyncEngine>, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();

        let config = LocalStoreConfig {
            db_path: temp_file.path().to_str().unwrap().to_string(),
            site_id: "site1".to_string(),
            max_connections: 5,
            enable_wal: true,
        };

        let store = Arc::new(ActionStore::open(config).await.unwrap());
        let bus = Arc::new(EventBus::new());
        let engine = Arc::new(SyncEngine::new(store, bus, connectivity, EngineConfig::default()));

        (engine, temp_file)
    }

    async fn queue_sends(engine: &SyncEngine, scope: &ScopeKey, items: &[&str]) {
        for (i, item) in items.iter().enumerate() {
            engine
                .store()
                .put(&PendingAction {
                    scope: scope.clone(),
                    item_key: (*item).to_string(),
                    kind: ActionKind::Send,
                    payload: json!({"text": item}),
                    course_id: 1,
                    created_at: 1_000 + i as i64,
                    site_id: "site1".to_string(),
                })
                .await
                .unwrap();
        }
    }

    // P1: concurrent sync calls for one scope share a single pass.
    #[tokio::test]
    async fn concurrent_syncs_write_each_action_once() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1", "m2", "m3"]).await;

        let adapter = Arc::new(ScriptedAdapter::accepting().with_delay(Duration::from_millis(10)));

        let first = engine.sync(&scope, adapter.clone());
        let second = engine.sync(&scope, adapter.clone());
        let (a, b) = tokio::join!(first, second);

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(adapter.calls().len(), 3);
    }

    // P2: delivered actions leave the queue; resync performs zero writes.
    #[tokio::test]
    async fn resync_after_success_performs_no_writes() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1", "m2"]).await;

        let adapter = Arc::new(ScriptedAdapter::accepting());
        let outcome = engine.sync(&scope, adapter.clone()).await.unwrap();
        assert!(outcome.updated);
        assert!(engine.store().list_scope(&scope).await.unwrap().is_empty());

        engine.sync(&scope, adapter.clone()).await.unwrap();
        assert_eq!(adapter.calls().len(), 2);
    }

    // P3: a rejection discards that action but the rest still go out.
    #[tokio::test]
    async fn rejection_does_not_block_remaining_actions() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1", "m2", "m3"]).await;

        let adapter = Arc::new(ScriptedAdapter::accepting().with_reply("m1", Reply::Reject));
        let outcome = engine.sync(&scope, adapter.clone()).await.unwrap();

        assert_eq!(adapter.calls(), vec!["m1", "m2", "m3"]);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(engine.store().list_scope(&scope).await.unwrap().is_empty());
    }

    // P3: losing connectivity mid-pass stops the pass; later actions stay
    // queued, earlier successes stay committed.
    #[tokio::test]
    async fn unreachable_aborts_pass_and_keeps_remaining_queue() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1", "m2", "m3"]).await;

        let adapter = Arc::new(ScriptedAdapter::accepting().with_reply("m2", Reply::Unreachable));
        let err = engine.sync(&scope, adapter.clone()).await.unwrap_err();

        assert!(err.is_unreachable());
        assert_eq!(adapter.calls(), vec!["m1", "m2"]);

        let remaining = engine.store().list_scope(&scope).await.unwrap();
        let items: Vec<&str> = remaining.iter().map(|a| a.item_key.as_str()).collect();
        assert_eq!(items, vec!["m2", "m3"]);
        assert!(engine.store().last_sync(&scope).await.unwrap().is_none());
    }

    // Scenario B: repeated unreachable syncs leave timestamp and queue alone.
    #[tokio::test]
    async fn unreachable_gateway_never_marks_scope_synced() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1"]).await;

        let adapter = Arc::new(ScriptedAdapter::accepting().with_reply("m1", Reply::Unreachable));

        for _ in 0..2 {
            let err = engine.sync(&scope, adapter.clone()).await.unwrap_err();
            assert!(err.is_unreachable());
        }

        assert!(engine.store().last_sync(&scope).await.unwrap().is_none());
        assert_eq!(engine.store().list_scope(&scope).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offline_device_fails_fast_without_gateway_calls() {
        let (engine, _file) = test_engine(Arc::new(Offline)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1"]).await;

        let adapter = Arc::new(ScriptedAdapter::accepting());
        let err = engine.sync(&scope, adapter.clone()).await.unwrap_err();

        assert!(err.is_unreachable());
        assert!(adapter.calls().is_empty());
        assert!(engine.store().last_sync(&scope).await.unwrap().is_none());
    }

    // Scenario C: an empty scope inside the throttle window stays quiet.
    #[tokio::test]
    async fn empty_scope_is_throttled_on_second_check() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("glossary", 9);
        let adapter = Arc::new(ScriptedAdapter::accepting());

        let first = engine.sync_if_needed(&scope, adapter.clone()).await.unwrap();
        assert_eq!(first, Some(SyncOutcome::default()));

        let second = engine.sync_if_needed(&scope, adapter.clone()).await.unwrap();
        assert_eq!(second, None);
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn blocked_scope_refuses_sync_and_skips_automatic() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("session", 3);
        queue_sends(&engine, &scope, &["m1"]).await;
        let adapter = Arc::new(ScriptedAdapter::accepting());

        engine.block(&scope);
        engine.block(&scope);

        assert!(matches!(
            engine.sync(&scope, adapter.clone()).await,
            Err(SyncError::Blocked(_))
        ));
        assert_eq!(engine.sync_if_needed(&scope, adapter.clone()).await.unwrap(), None);

        engine.unblock(&scope);
        assert!(engine.is_blocked(&scope));
        engine.unblock(&scope);
        assert!(!engine.is_blocked(&scope));

        engine.sync(&scope, adapter.clone()).await.unwrap();
        assert_eq!(adapter.calls().len(), 1);
    }

    #[tokio::test]
    async fn completed_pass_publishes_event_with_warnings() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1", "m2"]).await;

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        engine.bus().on(SYNC_COMPLETED_EVENT, "site1", move |payload| {
            *sink.lock().unwrap() = Some(payload.clone());
        });

        let adapter = Arc::new(ScriptedAdapter::accepting().with_reply("m2", Reply::Reject));
        engine.sync(&scope, adapter).await.unwrap();

        let payload = seen.lock().unwrap().clone().unwrap();
        assert_eq!(payload["scope"], "messages#1");
        assert_eq!(payload["updated"], true);
        assert_eq!(payload["warnings"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wait_for_sync_resolves_after_pass_settles() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1"]).await;

        let adapter = Arc::new(ScriptedAdapter::accepting().with_delay(Duration::from_millis(20)));

        let runner = Arc::clone(&engine);
        let runner_scope = scope.clone();
        let task = tokio::spawn(async move { runner.sync(&runner_scope, adapter).await });

        // Give the pass a moment to register in the lock map.
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.wait_for_sync(&scope).await;

        assert!(engine.store().list_scope(&scope).await.unwrap().is_empty());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn metered_network_skips_automatic_sync() {
        struct Metered;

        impl Connectivity for Metered {
            fn is_online(&self) -> bool {
                true
            }

            fn is_metered(&self) -> bool {
                true
            }
        }

        let (engine, _file) = test_engine(Arc::new(Metered)).await;
        let scope = ScopeKey::new("messages", 1);
        queue_sends(&engine, &scope, &["m1"]).await;
        let adapter = Arc::new(ScriptedAdapter::accepting());

        assert_eq!(engine.sync_if_needed(&scope, adapter.clone()).await.unwrap(), None);

        // A user-triggered sync still runs.
        engine.sync(&scope, adapter.clone()).await.unwrap();
        assert_eq!(adapter.calls().len(), 1);
    }

    #[tokio::test]
    async fn discard_removes_a_queued_action() {
        let (engine, _file) = test_engine(Arc::new(AlwaysOnline)).await;
        let scope = ScopeKey::new("glossary", 2);
        queue_sends(&engine, &scope, &["m1", "m2"]).await;

        engine.discard(&scope, "m1", ActionKind::Send).await.unwrap();

        let remaining = engine.store().list_scope(&scope).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].item_key, "m2");
    }
}
