//! Reconciliation for attempt-based scopes, where offline work is numbered
//! attempts rather than a queue of independent actions.
//!
//! A collision is an attempt number that exists both locally and on the
//! server. It can be one of three things: the leftovers of a sync pass that
//! failed halfway, an online attempt the user continued while offline, or two
//! genuinely different attempts that happen to share a number. The first two
//! are synced in place; the third is renumbered past the last online attempt
//! so no data overwrites the server's.

use crate::action::{ScopeKey, SyncOutcome};
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::tracks::{StateMap, TrackEntry, TrackFilter, TrackStore};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Server operations an attempt-based feature needs during reconciliation.
#[async_trait]
pub trait AttemptBackend: Send + Sync + 'static {
    /// Attempt numbers that exist on the server. Always fetched fresh, never
    /// from cache, so this fails with [`SyncError::Unreachable`] when the
    /// server cannot be contacted.
    async fn online_attempts(&self) -> SyncResult<Vec<i64>>;

    /// Authoritative element state of an online attempt, item id → element →
    /// value. `ignore_cache` forces a fresh fetch.
    async fn user_data(&self, attempt: i64, ignore_cache: bool) -> SyncResult<StateMap>;

    /// Whether an online attempt is still incomplete.
    async fn attempt_incomplete(&self, attempt: i64) -> SyncResult<bool>;

    /// Whether a local offline attempt is still incomplete.
    async fn offline_attempt_incomplete(&self, attempt: i64) -> SyncResult<bool>;

    /// Send one item's tracked elements for an attempt to the server.
    async fn send_tracks(&self, attempt: i64, item_id: i64, entries: &[TrackEntry]) -> SyncResult<()>;
}

/// Synchronizes the offline attempts of one scope against the server.
///
/// Runs under the engine's per-scope single-flight lock via
/// [`AttemptSyncer::sync_via`], so a queue-based and an attempt-based pass
/// for the same scope can never interleave.
pub struct AttemptSyncer {
    scope: ScopeKey,
    store: Arc<TrackStore>,
    backend: Arc<dyn AttemptBackend>,
    max_attempts: Option<i64>,
}

impl AttemptSyncer {
    pub fn new(scope: ScopeKey, store: Arc<TrackStore>, backend: Arc<dyn AttemptBackend>) -> Self {
        Self {
            scope,
            store,
            backend,
            max_attempts: None,
        }
    }

    /// Cap on attempt numbers the server accepts; attempts beyond it are
    /// left local and skipped.
    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// Synchronize now, sharing the engine's lock map, throttle timestamps
    /// and completion event.
    pub async fn sync_via(self: &Arc<Self>, engine: &Arc<SyncEngine>) -> SyncResult<SyncOutcome> {
        if engine.is_blocked(&self.scope) {
            tracing::debug!(scope = %self.scope, "cannot sync blocked scope");
            return Err(SyncError::Blocked(self.scope.to_string()));
        }

        let this = Arc::clone(self);
        let engine_for_task = Arc::clone(engine);

        engine
            .run_scoped(&self.scope, move || {
                async move {
                    let outcome = this.perform_pass().await?;
                    engine_for_task.finish_pass(&this.scope, &outcome).await?;
                    Ok(outcome)
                }
                .boxed()
            })
            .await
    }

    /// Automatic variant: skips when blocked or inside the throttle window.
    pub async fn sync_if_needed(self: &Arc<Self>, engine: &Arc<SyncEngine>) -> SyncResult<Option<SyncOutcome>> {
        if engine.is_blocked(&self.scope) {
            return Ok(None);
        }

        if !engine.is_sync_needed(&self.scope).await? {
            return Ok(None);
        }

        self.sync_via(engine).await.map(Some)
    }

    async fn perform_pass(&self) -> SyncResult<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        let offline = self.store.attempts(&self.scope).await?;
        if offline.is_empty() {
            return Ok(outcome);
        }

        let online = self.backend.online_attempts().await?;
        let last_online = online.iter().copied().max().unwrap_or(0);

        let collisions: Vec<i64> = offline.iter().copied().filter(|a| online.contains(a)).collect();

        let mut incomplete = if last_online > 0 {
            self.backend.attempt_incomplete(last_online).await?
        } else {
            false
        };

        if collisions.is_empty() {
            if incomplete {
                // New attempts can't be created while the online attempt is
                // open; keep the local data and try again later.
                outcome.warnings.push(format!(
                    "Online attempt {last_online} is still incomplete; offline attempts were not sent"
                ));
                return Ok(outcome);
            }

            for &attempt in &offline {
                if self.within_attempt_ceiling(attempt) {
                    self.sync_attempt(attempt).await?;
                    outcome.updated = true;
                }
            }

            return Ok(outcome);
        }

        let mut warnings = self.treat_collisions(&collisions, last_online, &offline).await?;
        outcome.warnings.append(&mut warnings);

        // Renumbering may have changed the local attempt list.
        let attempts = self.store.attempts(&self.scope).await?;

        if incomplete && attempts.contains(&last_online) {
            // The open online attempt was continued offline; syncing it
            // resumes that same attempt instead of creating a new one.
            incomplete = false;
        }

        let mut cannot_sync_some = false;

        for attempt in attempts {
            // Attempts at or below the last online number are resumptions or
            // retries and always go out. Anything above creates a new online
            // attempt, which needs the last online attempt to be finished.
            if !incomplete || attempt <= last_online {
                if self.within_attempt_ceiling(attempt) {
                    self.sync_attempt(attempt).await?;
                    outcome.updated = true;
                }
            } else {
                cannot_sync_some = true;
            }
        }

        if cannot_sync_some {
            outcome.warnings.push(format!(
                "Online attempt {last_online} is still incomplete; some offline attempts were not sent"
            ));
        }

        Ok(outcome)
    }

    fn within_attempt_ceiling(&self, attempt: i64) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Send one attempt's unsynced tracked data, item by item.
    ///
    /// Each item is marked synced right after its own write, so a failure
    /// partway leaves an accurate record of what the server already has. On a
    /// partial failure a snapshot of the server state is stored so the next
    /// pass can recognize this as a retryable failed sync.
    async fn sync_attempt(&self, attempt: i64) -> SyncResult<()> {
        tracing::debug!(scope = %self.scope, attempt, "syncing offline attempt");

        let tracks = self.store.tracks(&self.scope, attempt, TrackFilter::UnsyncedOnly).await?;

        // Only dotted elements travel; the rest is local bookkeeping kept to
        // make offline playback work.
        let mut per_item: BTreeMap<i64, Vec<TrackEntry>> = BTreeMap::new();
        for track in tracks {
            if track.element.contains('.') {
                per_item.entry(track.item_id).or_default().push(TrackEntry {
                    element: track.element,
                    value: track.value,
                });
            }
        }

        let mut something_synced = false;

        for (item_id, entries) in &per_item {
            if let Err(err) = self.backend.send_tracks(attempt, *item_id, entries).await {
                if something_synced {
                    tracing::error!(
                        scope = %self.scope,
                        attempt,
                        item_id,
                        "partial failure syncing attempt, saving snapshot"
                    );
                    self.save_sync_snapshot(attempt).await?;
                } else {
                    tracing::error!(scope = %self.scope, attempt, error = %err, "failed to sync attempt");
                }

                return Err(err);
            }

            if let Err(err) = self.store.mark_synced(&self.scope, attempt, *item_id).await {
                tracing::warn!(scope = %self.scope, attempt, item_id, error = %err, "failed to mark item as synced");
            }
            something_synced = true;
        }

        // Everything went out; drop the local copy. If the delete fails the
        // next pass finds an attempt with no unsynced data and cleans it up.
        if let Err(err) = self.store.delete_attempt(&self.scope, attempt).await {
            tracing::warn!(scope = %self.scope, attempt, error = %err, "failed to delete synced attempt");
        }

        Ok(())
    }

    /// Capture the server's state for an attempt so a later pass can tell a
    /// retryable failed sync from a divergence.
    async fn save_sync_snapshot(&self, attempt: i64) -> SyncResult<()> {
        let state = match self.backend.user_data(attempt, true).await {
            Ok(state) => state,
            Err(_) => {
                // Server unreachable; build the snapshot from the cached view
                // plus the entries we know were delivered.
                let mut state = self.backend.user_data(attempt, false).await.unwrap_or_default();

                let synced = self.store.tracks(&self.scope, attempt, TrackFilter::SyncedOnly).await?;
                for track in synced {
                    state.entry(track.item_id).or_default().insert(track.element, track.value);
                }

                state
            }
        };

        self.store.set_snapshot(&self.scope, attempt, &state).await
    }

    /// Whether a previously-failed sync of this attempt can simply be
    /// resumed: its snapshot must still match the server's current state.
    async fn can_retry_sync(&self, attempt: i64, last_online: i64) -> SyncResult<bool> {
        // The last online attempt's data was already fetched fresh this pass.
        let refresh = attempt != last_online;
        let site_data = self.backend.user_data(attempt, refresh).await?;

        let snapshot = self.store.snapshot(&self.scope, attempt).await?;

        Ok(matches!(
            snapshot,
            Some(snapshot) if !snapshot.is_empty() && snapshot_equals(&snapshot, &site_data)
        ))
    }

    /// Classify every collided attempt and renumber the ones that must become
    /// new attempts. Returns the warnings produced.
    async fn treat_collisions(
        &self,
        collisions: &[i64],
        last_online: i64,
        offline: &[i64],
    ) -> SyncResult<Vec<String>> {
        let mut warnings = Vec::new();
        // Renumbered past last_online, keeping their relative order.
        let mut new_same_order: Vec<i64> = Vec::new();
        // Created after the last offline attempt (edge case); keyed by
        // creation time, appended after everything else. At most one entry.
        let mut new_at_end: BTreeMap<i64, i64> = BTreeMap::new();

        let last_collision = collisions.iter().copied().max().unwrap_or(0);
        let mut last_offline = offline.iter().copied().max().unwrap_or(0);

        let last_offline_created = self
            .store
            .attempt_creation_time(&self.scope, last_offline)
            .await?
            .unwrap_or(0);
        let last_offline_incomplete = self.backend.offline_attempt_incomplete(last_offline).await?;

        for &attempt in collisions {
            let synced = self.store.tracks(&self.scope, attempt, TrackFilter::SyncedOnly).await?;

            if !synced.is_empty() {
                // Some data already landed: a previous pass failed halfway.
                let unsynced = self.store.tracks(&self.scope, attempt, TrackFilter::UnsyncedOnly).await?;
                let has_data_to_send = unsynced.iter().any(|track| track.element.contains('.'));

                if !has_data_to_send {
                    // Everything was delivered; only the local cleanup was
                    // missed.
                    if let Err(err) = self.store.delete_attempt(&self.scope, attempt).await {
                        tracing::warn!(scope = %self.scope, attempt, error = %err, "failed to delete delivered attempt");
                    }
                    continue;
                }

                if !self.can_retry_sync(attempt, last_online).await? {
                    self.add_to_new_or_delete(
                        attempt,
                        last_offline,
                        &mut new_same_order,
                        &mut new_at_end,
                        last_offline_created,
                        last_offline_incomplete,
                        &mut warnings,
                    )
                    .await?;
                }
                // Retryable: leave it in place, the sync loop resumes it.
            } else {
                let snapshot = self.store.snapshot(&self.scope, attempt).await?;

                let Some(snapshot) = snapshot.filter(|s| !s.is_empty()) else {
                    // No snapshot: this attempt never saw the server, it's a
                    // genuinely different attempt.
                    new_same_order.push(attempt);
                    continue;
                };

                // A snapshot without synced entries means the user continued
                // an online attempt offline. Compare against current server
                // state to see whether it diverged meanwhile.
                let refresh = attempt != last_online;
                let site_data = self.backend.user_data(attempt, refresh).await?;

                if !snapshot_equals(&snapshot, &site_data) {
                    self.add_to_new_or_delete(
                        attempt,
                        last_offline,
                        &mut new_same_order,
                        &mut new_at_end,
                        last_offline_created,
                        last_offline_incomplete,
                        &mut warnings,
                    )
                    .await?;
                }
                // Equal: still a plain continuation, sync it in place.
            }
        }

        new_same_order.sort_unstable();

        self.move_new_attempts(&new_same_order, last_online, last_collision, offline).await?;

        last_offline += new_same_order.len() as i64;
        self.create_new_attempts_at_end(&new_at_end, last_offline).await?;

        Ok(warnings)
    }

    /// Queue a collided attempt to become a new attempt, or discard it when
    /// that is impossible.
    async fn add_to_new_or_delete(
        &self,
        attempt: i64,
        last_offline: i64,
        new_same_order: &mut Vec<i64>,
        new_at_end: &mut BTreeMap<i64, i64>,
        last_offline_created: i64,
        last_offline_incomplete: bool,
        warnings: &mut Vec<String>,
    ) -> SyncResult<()> {
        if attempt == last_offline {
            new_same_order.push(attempt);
            return Ok(());
        }

        let created = self.store.attempt_creation_time(&self.scope, attempt).await?;

        match created {
            Some(time) if time > last_offline_created => {
                // Started after the last offline attempt: it can only go at
                // the end of the list, and only if the last attempt finished.
                if last_offline_incomplete {
                    tracing::debug!(
                        scope = %self.scope,
                        attempt,
                        "discarding attempt that cannot become a new attempt"
                    );

                    if let Err(err) = self.store.delete_attempt(&self.scope, attempt).await {
                        tracing::warn!(scope = %self.scope, attempt, error = %err, "failed to discard attempt");
                    }

                    warnings.push(format!("Local data for attempt {attempt} was discarded"));
                } else {
                    new_at_end.insert(time, attempt);
                }
            }
            _ => new_same_order.push(attempt),
        }

        Ok(())
    }

    /// Renumber collided attempts into fresh numbers above the last online
    /// attempt, first shifting every attempt after the last collision out of
    /// the way so nothing gets overwritten.
    ///
    /// Example: offline attempts 1, 2, 3 where 1 and 2 collide. 1 can be
    /// synced in place but 2 must become a new attempt: 3 becomes 4, then 2
    /// becomes 3.
    async fn move_new_attempts(
        &self,
        new_attempts: &[i64],
        last_online: i64,
        last_collision: i64,
        offline: &[i64],
    ) -> SyncResult<()> {
        if new_attempts.is_empty() {
            return Ok(());
        }

        let shift = new_attempts.len() as i64;

        // Highest first, so each move's target number is free.
        let mut trailing: Vec<i64> = offline.iter().copied().filter(|a| *a > last_collision).collect();
        trailing.sort_unstable_by(|a, b| b.cmp(a));

        let mut shifted: Vec<i64> = Vec::new();

        for &attempt in &trailing {
            if let Err(err) = self.store.change_attempt_number(&self.scope, attempt, attempt + shift).await {
                self.undo_shift(&shifted, shift).await;
                return Err(err);
            }

            shifted.push(attempt);
        }

        // Now renumber the collided attempts into the freed range, lowest
        // first so their relative order survives.
        let mut renumbered: Vec<(i64, i64)> = Vec::new();

        for (index, &attempt) in new_attempts.iter().enumerate() {
            let new_number = last_online + index as i64 + 1;

            if let Err(err) = self.store.change_attempt_number(&self.scope, attempt, new_number).await {
                // Undo in reverse so intermediate numbers are free again.
                for &(old, new) in renumbered.iter().rev() {
                    if let Err(undo_err) = self.store.change_attempt_number(&self.scope, new, old).await {
                        tracing::warn!(scope = %self.scope, new, old, error = %undo_err, "failed to undo renumbering");
                    }
                }

                self.undo_shift(&shifted, shift).await;
                return Err(err);
            }

            renumbered.push((attempt, new_number));
        }

        Ok(())
    }

    /// Best-effort compensation for a failed renumbering: move shifted
    /// attempts back to their original numbers, lowest first.
    async fn undo_shift(&self, shifted: &[i64], shift: i64) {
        for &attempt in shifted.iter().rev() {
            if let Err(err) = self.store.change_attempt_number(&self.scope, attempt + shift, attempt).await {
                tracing::warn!(scope = %self.scope, attempt, error = %err, "failed to undo attempt shift");
            }
        }
    }

    /// Append the edge-case attempts after the last offline attempt, oldest
    /// first.
    async fn create_new_attempts_at_end(
        &self,
        new_attempts: &BTreeMap<i64, i64>,
        last_offline: i64,
    ) -> SyncResult<()> {
        for (index, &attempt) in new_attempts.values().enumerate() {
            self.store
                .change_attempt_number(&self.scope, attempt, last_offline + index as i64 + 1)
                .await?;
        }

        Ok(())
    }
}

/// Compare a stored snapshot with state fetched from the site.
///
/// Only dotted elements are compared, in both directions: an item added on
/// the server that the user never generated data for does not count as a
/// divergence, and neither do the extra bookkeeping elements stored locally.
pub fn snapshot_equals(snapshot: &StateMap, site_data: &StateMap) -> bool {
    for (item_id, site_elements) in site_data {
        for (element, value) in site_elements {
            if element.contains('.')
                && snapshot.get(item_id).and_then(|s| s.get(element)) != Some(value)
            {
                return false;
            }
        }
    }

    for (item_id, snapshot_elements) in snapshot {
        for (element, value) in snapshot_elements {
            if element.contains('.')
                && site_data.get(item_id).and_then(|s| s.get(element)) != Some(value)
            {
                return false;
            }
        }
    }

    true
}
