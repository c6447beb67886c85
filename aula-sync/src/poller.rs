//! Periodic refresh of an ordered thread view (messages, forum replies) that
//! merges confirmed server items with the local pending queue.
//!
//! The merged view is published on a watch channel. Polling pauses while a
//! send is in flight and waits out any running sync pass, so the UI never
//! renders mid-flight state.

use crate::action::ScopeKey;
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One entry of a thread view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadItem {
    pub sender: String,
    pub text: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Whether the item is still waiting in the local queue.
    pub pending: bool,
}

impl ThreadItem {
    pub fn new(sender: &str, text: &str, created_at: i64) -> Self {
        Self {
            sender: sender.to_string(),
            text: text.to_string(),
            created_at,
            pending: false,
        }
    }

    /// Content-derived identity, used to match a pending item against its
    /// confirmed counterpart once the server echoes it back. Queued items
    /// have no server id yet, so the id can't be part of the identity.
    pub fn identity(&self) -> String {
        format!("{}#{}#{}", self.sender, self.created_at, self.text)
    }
}

/// How the refresh loop obtains the two halves of the view.
#[async_trait]
pub trait ThreadFetcher: Send + Sync + 'static {
    /// Confirmed items from the server (or its cache).
    async fn fetch(&self) -> SyncResult<Vec<ThreadItem>>;

    /// Items still waiting in the local queue, rendered for display.
    async fn queued(&self) -> SyncResult<Vec<ThreadItem>>;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// How long a send may take before its confirmation can get lost; feeds
    /// the duplicate-detection window.
    pub ws_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            ws_timeout: Duration::from_secs(5),
        }
    }
}

/// Merge confirmed and queued items into one display list.
///
/// Queued items whose identity already appears among the confirmed ones are
/// dropped (the server has them). `carryover` keeps the previous cycle's
/// queued items for exactly one more cycle: an item that just left the queue
/// but hasn't shown up in a fetch yet is still displayed, so a sent message
/// doesn't flicker out of the view.
pub fn merge_thread(
    fetched: Vec<ThreadItem>,
    queued: Vec<ThreadItem>,
    carryover: &mut HashMap<String, ThreadItem>,
) -> Vec<ThreadItem> {
    let confirmed: HashSet<String> = fetched.iter().map(ThreadItem::identity).collect();

    let mut items = fetched;
    let mut next_carryover = HashMap::new();

    for mut item in queued {
        let id = item.identity();
        carryover.remove(&id);

        if confirmed.contains(&id) {
            continue;
        }

        item.pending = true;
        next_carryover.insert(id, item.clone());
        items.push(item);
    }

    for (id, mut item) in carryover.drain() {
        if confirmed.contains(&id) {
            continue;
        }

        item.pending = true;
        items.push(item);
    }

    *carryover = next_carryover;

    items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.text.cmp(&b.text)));

    items
}

/// Recent confirmed items a send adapter checks before re-sending a queued
/// item, so a send whose confirmation was lost doesn't go out twice.
pub struct RecentWindow {
    items: Vec<ThreadItem>,
}

impl RecentWindow {
    /// `first_queued_at` is the creation time of the oldest queued item.
    /// Anything the server received after `first_queued_at - ws_timeout - 1s`
    /// could be one of ours whose confirmation was lost; older items cannot.
    pub fn new(fetched: &[ThreadItem], first_queued_at: i64, ws_timeout: Duration) -> Self {
        let lower_bound = first_queued_at - ws_timeout.as_millis() as i64 - 1_000;

        Self {
            items: fetched.iter().filter(|item| item.created_at >= lower_bound).cloned().collect(),
        }
    }

    pub fn contains(&self, sender: &str, text: &str) -> bool {
        self.items.iter().any(|item| item.sender == sender && item.text == text)
    }
}

/// Suppresses polling while held. Dropped when the send settles, whatever
/// the outcome.
pub struct SendGuard {
    sending: Arc<AtomicUsize>,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.sending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Background refresh loop for one thread view.
pub struct RefreshLoop {
    sending: Arc<AtomicUsize>,
    rx: watch::Receiver<Vec<ThreadItem>>,
    handle: JoinHandle<()>,
}

impl RefreshLoop {
    pub fn start(
        scope: ScopeKey,
        engine: Arc<SyncEngine>,
        fetcher: Arc<dyn ThreadFetcher>,
        config: PollerConfig,
    ) -> Self {
        let sending = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(Vec::new());

        let sending_task = Arc::clone(&sending);

        let handle = tokio::spawn(async move {
            let mut carryover: HashMap<String, ThreadItem> = HashMap::new();
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if sending_task.load(Ordering::SeqCst) > 0 {
                    // A send is in flight; the view refreshes once it lands.
                    continue;
                }

                engine.wait_for_sync(&scope).await;

                match Self::refresh_once(fetcher.as_ref(), &mut carryover).await {
                    Ok(items) => {
                        let _ = tx.send(items);
                    }
                    Err(err) => {
                        tracing::debug!(scope = %scope, error = %err, "thread refresh failed");
                    }
                }
            }
        });

        Self { sending, rx, handle }
    }

    async fn refresh_once(
        fetcher: &dyn ThreadFetcher,
        carryover: &mut HashMap<String, ThreadItem>,
    ) -> SyncResult<Vec<ThreadItem>> {
        let fetched = fetcher.fetch().await?;
        let queued = fetcher.queued().await?;

        Ok(merge_thread(fetched, queued, carryover))
    }

    /// Watch the merged view. The initial value is empty until the first
    /// refresh completes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ThreadItem>> {
        self.rx.clone()
    }

    /// Pause polling for the duration of a send.
    pub fn begin_send(&self) -> SendGuard {
        self.sending.fetch_add(1, Ordering::SeqCst);

        SendGuard {
            sending: Arc::clone(&self.sending),
        }
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst) > 0
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for RefreshLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
