//! Persistence for tracked session data (attempt/element scopes) and the
//! snapshots used to detect divergence from the authoritative state.
//!
//! Attempt-based features (tracked learning sessions) store one row per
//! (scope, attempt, item, element) with a synced flag, so a sync pass that
//! fails halfway leaves a recoverable mixed state instead of losing data.

use crate::action::ScopeKey;
use crate::error::{SyncError, SyncResult};
use crate::store::{now_millis, LocalStoreConfig};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;

/// Authoritative or captured session state: item id → element name → value.
pub type StateMap = BTreeMap<i64, BTreeMap<String, String>>;

/// One tracked element write, as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub element: String,
    pub value: String,
}

/// One tracked element as stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTrack {
    pub item_id: i64,
    pub element: String,
    pub value: String,
    pub synced: bool,
    pub created_at: i64,
}

/// Which tracks to read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackFilter {
    All,
    SyncedOnly,
    UnsyncedOnly,
}

/// Store for attempt-scoped tracked data and attempt snapshots.
pub struct TrackStore {
    pool: SqlitePool,
}

impl TrackStore {
    /// Open (creating if missing) a standalone track database.
    pub async fn open(config: LocalStoreConfig) -> SyncResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        if config.enable_wal {
            sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        }

        Self::with_pool(pool).await
    }

    /// Share an existing pool (same database file as the action store).
    pub async fn with_pool(pool: SqlitePool) -> SyncResult<Self> {
        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempt_tracks (
                scope TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                element TEXT NOT NULL,
                value TEXT NOT NULL DEFAULT '',
                synced INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (scope, attempt, item_id, element)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tracks_scope_attempt \
             ON attempt_tracks(scope, attempt, synced)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempt_snapshots (
                scope TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                state TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                PRIMARY KEY (scope, attempt)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record one tracked element write for an attempt. Overwrites a previous
    /// value for the same element and resets its synced flag.
    pub async fn insert_track(
        &self,
        scope: &ScopeKey,
        attempt: i64,
        item_id: i64,
        entry: &TrackEntry,
    ) -> SyncResult<()> {
        // Keep the original creation time when overwriting, so the attempt's
        // creation time stays stable.
        let created_at = self
            .attempt_creation_time(scope, attempt)
            .await?
            .unwrap_or_else(now_millis);

        sqlx::query(
            r#"
            INSERT INTO attempt_tracks (scope, attempt, item_id, element, value, synced, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT (scope, attempt, item_id, element)
            DO UPDATE SET value = excluded.value, synced = 0
            "#,
        )
        .bind(scope.to_string())
        .bind(attempt)
        .bind(item_id)
        .bind(&entry.element)
        .bind(&entry.value)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_tracks(
        &self,
        scope: &ScopeKey,
        attempt: i64,
        item_id: i64,
        entries: &[TrackEntry],
    ) -> SyncResult<()> {
        for entry in entries {
            self.insert_track(scope, attempt, item_id, entry).await?;
        }
        Ok(())
    }

    /// Read tracks for an attempt, optionally restricted by synced state.
    pub async fn tracks(
        &self,
        scope: &ScopeKey,
        attempt: i64,
        filter: TrackFilter,
    ) -> SyncResult<Vec<StoredTrack>> {
        let condition = match filter {
            TrackFilter::All => "",
            TrackFilter::SyncedOnly => "AND synced = 1",
            TrackFilter::UnsyncedOnly => "AND synced = 0",
        };

        let sql = format!(
            "SELECT item_id, element, value, synced, created_at \
             FROM attempt_tracks WHERE scope = ? AND attempt = ? {condition} \
             ORDER BY item_id ASC, element ASC",
        );

        let rows = sqlx::query(&sql)
            .bind(scope.to_string())
            .bind(attempt)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(decode_track).collect()
    }

    /// Mark one item's tracks as delivered. Called right after the item's
    /// own successful write, never batched at the end of a pass.
    pub async fn mark_synced(&self, scope: &ScopeKey, attempt: i64, item_id: i64) -> SyncResult<()> {
        sqlx::query(
            "UPDATE attempt_tracks SET synced = 1 \
             WHERE scope = ? AND attempt = ? AND item_id = ? AND synced = 0",
        )
        .bind(scope.to_string())
        .bind(attempt)
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        tracing::debug!(scope = %scope, attempt, item_id, "marked item tracks as synced");

        Ok(())
    }

    /// Distinct attempt numbers with local data, ascending.
    pub async fn attempts(&self, scope: &ScopeKey) -> SyncResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT attempt FROM attempt_tracks WHERE scope = ? ORDER BY attempt ASC",
        )
        .bind(scope.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("attempt").map_err(SyncError::from))
            .collect()
    }

    /// When the attempt's first track was written, epoch milliseconds.
    pub async fn attempt_creation_time(&self, scope: &ScopeKey, attempt: i64) -> SyncResult<Option<i64>> {
        let row = sqlx::query(
            "SELECT MIN(created_at) AS created_at FROM attempt_tracks WHERE scope = ? AND attempt = ?",
        )
        .bind(scope.to_string())
        .bind(attempt)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<Option<i64>, _>("created_at")?)
    }

    /// Renumber an offline attempt. Refuses to overwrite an existing target
    /// attempt, and marks the moved tracks as not synced: a renumbered
    /// attempt is a brand-new attempt whose data must all be resent.
    pub async fn change_attempt_number(
        &self,
        scope: &ScopeKey,
        attempt: i64,
        new_attempt: i64,
    ) -> SyncResult<()> {
        tracing::debug!(scope = %scope, attempt, new_attempt, "changing attempt number");

        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM attempt_tracks WHERE scope = ? AND attempt = ?",
        )
        .bind(scope.to_string())
        .bind(new_attempt)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        if count > 0 {
            return Err(SyncError::InvalidOperation(format!(
                "Attempt {new_attempt} already exists in scope {scope}"
            )));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE attempt_tracks SET attempt = ?, synced = 0 WHERE scope = ? AND attempt = ?",
        )
        .bind(new_attempt)
        .bind(scope.to_string())
        .bind(attempt)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE attempt_snapshots SET attempt = ? WHERE scope = ? AND attempt = ?")
            .bind(new_attempt)
            .bind(scope.to_string())
            .bind(attempt)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Delete an attempt's tracks and its snapshot.
    pub async fn delete_attempt(&self, scope: &ScopeKey, attempt: i64) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM attempt_tracks WHERE scope = ? AND attempt = ?")
            .bind(scope.to_string())
            .bind(attempt)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM attempt_snapshots WHERE scope = ? AND attempt = ?")
            .bind(scope.to_string())
            .bind(attempt)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(scope = %scope, attempt, "deleted offline attempt");

        Ok(())
    }

    pub async fn snapshot(&self, scope: &ScopeKey, attempt: i64) -> SyncResult<Option<StateMap>> {
        let row = sqlx::query("SELECT state FROM attempt_snapshots WHERE scope = ? AND attempt = ?")
            .bind(scope.to_string())
            .bind(attempt)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let state: String = row.try_get("state")?;
                Ok(Some(serde_json::from_str(&state)?))
            }
            None => Ok(None),
        }
    }

    /// Store (overwriting) the snapshot of authoritative state for an attempt.
    pub async fn set_snapshot(&self, scope: &ScopeKey, attempt: i64, state: &StateMap) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO attempt_snapshots (scope, attempt, state, captured_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (scope, attempt)
            DO UPDATE SET state = excluded.state, captured_at = excluded.captured_at
            "#,
        )
        .bind(scope.to_string())
        .bind(attempt)
        .bind(serde_json::to_string(state)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decode_track(row: SqliteRow) -> SyncResult<StoredTrack> {
    let item_id: i64 = row.try_get("item_id")?;
    let element: String = row.try_get("element")?;
    let value: String = row.try_get("value")?;
    let synced: i64 = row.try_get("synced")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(StoredTrack {
        item_id,
        element,
        value,
        synced: synced != 0,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn create_test_store() -> (TrackStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();

        let config = LocalStoreConfig {
            db_path: temp_file.path().to_str().unwrap().to_string(),
            site_id: "site1".to_string(),
            max_connections: 5,
            enable_wal: true,
        };

        (TrackStore::open(config).await.unwrap(), temp_file)
    }

    fn entry(element: &str, value: &str) -> TrackEntry {
        TrackEntry {
            element: element.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn tracks_filter_by_synced_state() {
        let (store, _file) = create_test_store().await;
        let scope = ScopeKey::new("session", 10);

        store.insert_track(&scope, 1, 100, &entry("cmi.core.exit", "suspend")).await.unwrap();
        store.insert_track(&scope, 1, 100, &entry("cmi.core.score.raw", "80")).await.unwrap();
        store.insert_track(&scope, 1, 200, &entry("cmi.core.exit", "")).await.unwrap();

        store.mark_synced(&scope, 1, 100).await.unwrap();

        let synced = store.tracks(&scope, 1, TrackFilter::SyncedOnly).await.unwrap();
        let unsynced = store.tracks(&scope, 1, TrackFilter::UnsyncedOnly).await.unwrap();
        assert_eq!(synced.len(), 2);
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].item_id, 200);
    }

    #[tokio::test]
    async fn overwriting_a_track_resets_its_synced_flag() {
        let (store, _file) = create_test_store().await;
        let scope = ScopeKey::new("session", 10);

        store.insert_track(&scope, 1, 100, &entry("cmi.core.score.raw", "50")).await.unwrap();
        store.mark_synced(&scope, 1, 100).await.unwrap();

        store.insert_track(&scope, 1, 100, &entry("cmi.core.score.raw", "90")).await.unwrap();

        let unsynced = store.tracks(&scope, 1, TrackFilter::UnsyncedOnly).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].value, "90");
    }

    #[tokio::test]
    async fn change_attempt_number_moves_data_and_unmarks_synced() {
        let (store, _file) = create_test_store().await;
        let scope = ScopeKey::new("session", 10);

        store.insert_track(&scope, 1, 100, &entry("cmi.core.exit", "suspend")).await.unwrap();
        store.mark_synced(&scope, 1, 100).await.unwrap();
        store.set_snapshot(&scope, 1, &StateMap::new()).await.unwrap();

        store.change_attempt_number(&scope, 1, 3).await.unwrap();

        assert_eq!(store.attempts(&scope).await.unwrap(), vec![3]);
        let moved = store.tracks(&scope, 3, TrackFilter::UnsyncedOnly).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert!(store.snapshot(&scope, 3).await.unwrap().is_some());
        assert!(store.snapshot(&scope, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn change_attempt_number_refuses_existing_target() {
        let (store, _file) = create_test_store().await;
        let scope = ScopeKey::new("session", 10);

        store.insert_track(&scope, 1, 100, &entry("cmi.core.exit", "")).await.unwrap();
        store.insert_track(&scope, 2, 100, &entry("cmi.core.exit", "")).await.unwrap();

        let err = store.change_attempt_number(&scope, 1, 2).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        // Nothing moved.
        assert_eq!(store.attempts(&scope).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn delete_attempt_removes_tracks_and_snapshot() {
        let (store, _file) = create_test_store().await;
        let scope = ScopeKey::new("session", 10);

        store.insert_track(&scope, 1, 100, &entry("cmi.core.exit", "")).await.unwrap();
        store.set_snapshot(&scope, 1, &StateMap::new()).await.unwrap();

        store.delete_attempt(&scope, 1).await.unwrap();

        assert!(store.attempts(&scope).await.unwrap().is_empty());
        assert!(store.snapshot(&scope, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_round_trips_state_map() {
        let (store, _file) = create_test_store().await;
        let scope = ScopeKey::new("session", 10);

        let mut state = StateMap::new();
        state
            .entry(100)
            .or_default()
            .insert("cmi.core.lesson_status".to_string(), "completed".to_string());

        store.set_snapshot(&scope, 2, &state).await.unwrap();
        assert_eq!(store.snapshot(&scope, 2).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn attempt_creation_time_is_first_track_time() {
        let (store, _file) = create_test_store().await;
        let scope = ScopeKey::new("session", 10);

        assert!(store.attempt_creation_time(&scope, 1).await.unwrap().is_none());

        store.insert_track(&scope, 1, 100, &entry("cmi.core.exit", "")).await.unwrap();
        let first = store.attempt_creation_time(&scope, 1).await.unwrap().unwrap();

        // A later overwrite keeps the original creation time.
        store.insert_track(&scope, 1, 100, &entry("cmi.core.exit", "suspend")).await.unwrap();
        assert_eq!(store.attempt_creation_time(&scope, 1).await.unwrap(), Some(first));
    }
}
