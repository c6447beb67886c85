//! Local persistence for pending actions and per-scope sync timestamps.
//!
//! Purely local: no network calls. Storage errors propagate uninterpreted so
//! callers can decide whether to retry or surface them. Everything is keyed
//! by the scope's string form plus the item identity within the scope.

use crate::action::{ActionKind, PendingAction, ScopeKey};
use crate::error::{SyncError, SyncResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

/// Configuration for the per-site local database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Path to the database file.
    pub db_path: String,
    /// Site this database belongs to.
    pub site_id: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Whether to enable WAL mode.
    pub enable_wal: bool,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            db_path: "aula_local.db".to_string(),
            site_id: "default".to_string(),
            max_connections: 5,
            enable_wal: true,
        }
    }
}

/// Write-ahead queue of not-yet-synchronized user actions, plus the
/// last-sync timestamps used to throttle automatic resyncs.
pub struct ActionStore {
    pool: SqlitePool,
    site_id: String,
}

impl ActionStore {
    /// Open (creating if missing) the local database for one site.
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

        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

        let store = Self {
            pool,
            site_id: config.site_id,
        };

        store.initialize_schema().await?;

        Ok(store)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_actions (
                scope TEXT NOT NULL,
                item_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                course_id INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                site_id TEXT NOT NULL,
                PRIMARY KEY (scope, item_key, kind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_scope_created \
             ON pending_actions(scope, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_times (
                scope TEXT PRIMARY KEY,
                last_sync INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Queue an action, applying the collapse rule for items that only exist
    /// locally: an `edit` over a queued `add` merges into the `add`, and a
    /// `delete` over a queued `add` erases the `add` and queues nothing,
    /// because the item has no server identity yet.
    pub async fn queue(&self, action: PendingAction) -> SyncResult<()> {
        match action.kind {
            ActionKind::Edit => {
                if let Some(mut add) = self.get(&action.scope, &action.item_key, ActionKind::Add).await? {
                    merge_payload(&mut add.payload, &action.payload);

                    tracing::debug!(
                        scope = %action.scope,
                        item = %action.item_key,
                        "collapsed queued edit into pending add"
                    );

                    return self.put(&add).await;
                }
            }
            ActionKind::Delete => {
                if self.get(&action.scope, &action.item_key, ActionKind::Add).await?.is_some() {
                    self.delete(&action.scope, &action.item_key, ActionKind::Add).await?;
                    self.delete(&action.scope, &action.item_key, ActionKind::Edit).await?;

                    tracing::debug!(
                        scope = %action.scope,
                        item = %action.item_key,
                        "dropped pending add for locally-deleted item"
                    );

                    return Ok(());
                }
            }
            _ => {}
        }

        self.put(&action).await
    }

    /// Insert or overwrite an action keyed by (scope, item, kind). No dedup
    /// beyond the key; [`ActionStore::queue`] owns the collapse rule.
    pub async fn put(&self, action: &PendingAction) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pending_actions (
                scope, item_key, kind, payload, course_id, created_at, site_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(action.scope.to_string())
        .bind(&action.item_key)
        .bind(action.kind.as_str())
        .bind(action.payload.to_string())
        .bind(action.course_id)
        .bind(action.created_at)
        .bind(&action.site_id)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            scope = %action.scope,
            item = %action.item_key,
            kind = action.kind.as_str(),
            "queued action for sync"
        );

        Ok(())
    }

    pub async fn get(
        &self,
        scope: &ScopeKey,
        item_key: &str,
        kind: ActionKind,
    ) -> SyncResult<Option<PendingAction>> {
        let row = sqlx::query(
            r#"
            SELECT scope, item_key, kind, payload, course_id, created_at, site_id
            FROM pending_actions
            WHERE scope = ? AND item_key = ? AND kind = ?
            "#,
        )
        .bind(scope.to_string())
        .bind(item_key)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_action).transpose()
    }

    /// All pending actions for one scope, ordered by creation time so that
    /// replay order is meaningful for features that need it.
    pub async fn list_scope(&self, scope: &ScopeKey) -> SyncResult<Vec<PendingAction>> {
        let rows = sqlx::query(
            r#"
            SELECT scope, item_key, kind, payload, course_id, created_at, site_id
            FROM pending_actions
            WHERE scope = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(scope.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_action).collect()
    }

    pub async fn has_pending(&self, scope: &ScopeKey) -> SyncResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM pending_actions WHERE scope = ?")
            .bind(scope.to_string())
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }

    pub async fn delete(&self, scope: &ScopeKey, item_key: &str, kind: ActionKind) -> SyncResult<()> {
        sqlx::query("DELETE FROM pending_actions WHERE scope = ? AND item_key = ? AND kind = ?")
            .bind(scope.to_string())
            .bind(item_key)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_scope(&self, scope: &ScopeKey) -> SyncResult<()> {
        sqlx::query("DELETE FROM pending_actions WHERE scope = ?")
            .bind(scope.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Last completed (even partially-failed) sync pass for a scope, epoch
    /// milliseconds. `None` when the scope was never synced.
    pub async fn last_sync(&self, scope: &ScopeKey) -> SyncResult<Option<i64>> {
        let row = sqlx::query("SELECT last_sync FROM sync_times WHERE scope = ?")
            .bind(scope.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.try_get("last_sync").map_err(SyncError::from)).transpose()
    }

    pub async fn set_last_sync(&self, scope: &ScopeKey, when: i64) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_times (scope, last_sync) VALUES (?, ?)
            ON CONFLICT (scope) DO UPDATE SET last_sync = excluded.last_sync
            "#,
        )
        .bind(scope.to_string())
        .bind(when)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Underlying pool, shared with the track store when a feature keeps both
    /// in one database file.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Current wall-clock time in epoch milliseconds, the store's timestamp unit.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn merge_payload(base: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_map {
            base_map.insert(key.clone(), value.clone());
        }
    }
}

fn decode_action(row: SqliteRow) -> SyncResult<PendingAction> {
    let scope: String = row.try_get("scope")?;
    let item_key: String = row.try_get("item_key")?;
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    let course_id: i64 = row.try_get("course_id")?;
    let created_at: i64 = row.try_get("created_at")?;
    let site_id: String = row.try_get("site_id")?;

    Ok(PendingAction {
        scope: scope.parse()?,
        item_key,
        kind: ActionKind::parse(&kind)?,
        payload: serde_json::from_str(&payload)?,
        course_id,
        created_at,
        site_id,
    })
}
