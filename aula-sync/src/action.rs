//! Data model for queued offline actions.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The unit of synchronization identity: a feature component, the instance it
/// acts on, and an optional sub-scope such as a discussion or group.
///
/// Rendered as `component#instance` or `component#instance#sub`, which is also
/// the key used in the persistent store and the in-memory lock map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub component: String,
    pub instance_id: i64,
    pub sub_id: Option<String>,
}

impl ScopeKey {
    pub fn new(component: &str, instance_id: i64) -> Self {
        Self {
            component: component.to_string(),
            instance_id,
            sub_id: None,
        }
    }

    pub fn with_sub(component: &str, instance_id: i64, sub_id: &str) -> Self {
        Self {
            component: component.to_string(),
            instance_id,
            sub_id: Some(sub_id.to_string()),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_id {
            Some(sub) => write!(f, "{}#{}#{}", self.component, self.instance_id, sub),
            None => write!(f, "{}#{}", self.component, self.instance_id),
        }
    }
}

impl FromStr for ScopeKey {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        let mut parts = s.splitn(3, '#');
        let component = parts
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SyncError::InvalidOperation(format!("Invalid scope key: {s}")))?;
        let instance_id = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| SyncError::InvalidOperation(format!("Invalid scope key: {s}")))?;

        Ok(Self {
            component: component.to_string(),
            instance_id,
            sub_id: parts.next().map(str::to_string),
        })
    }
}

/// Kind of queued mutation. Feature modules use the subset that makes sense
/// for them (messages only queue `Send`, glossaries `Add`/`Edit`/`Delete`,
/// moderated content `Approve`/`Disapprove`, ratings `Rate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Add,
    Edit,
    Delete,
    Approve,
    Disapprove,
    Rate,
    Send,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Add => "add",
            ActionKind::Edit => "edit",
            ActionKind::Delete => "delete",
            ActionKind::Approve => "approve",
            ActionKind::Disapprove => "disapprove",
            ActionKind::Rate => "rate",
            ActionKind::Send => "send",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "add" => Ok(ActionKind::Add),
            "edit" => Ok(ActionKind::Edit),
            "delete" => Ok(ActionKind::Delete),
            "approve" => Ok(ActionKind::Approve),
            "disapprove" => Ok(ActionKind::Disapprove),
            "rate" => Ok(ActionKind::Rate),
            "send" => Ok(ActionKind::Send),
            _ => Err(SyncError::InvalidOperation(format!("Unknown action kind: {s}"))),
        }
    }
}

/// One queued local mutation, not yet confirmed delivered to the server.
///
/// Keyed by (scope, item, kind). Created when a write could not reach the
/// server; mutated only by the engine (and the queue's collapse rule);
/// deleted once the corresponding online write succeeds or the user discards
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub scope: ScopeKey,
    /// Identity of the item within the scope. For items without a server id
    /// yet this is derived from content (e.g. concept name, message
    /// content + timestamp), never from a server-assigned id.
    pub item_key: String,
    pub kind: ActionKind,
    /// Feature-specific field map sent to the server on replay.
    pub payload: serde_json::Value,
    pub course_id: i64,
    /// Logical creation time, epoch milliseconds. Replay order follows it.
    pub created_at: i64,
    pub site_id: String,
}

/// Result of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Non-fatal problems surfaced to the user (rejected actions, discarded
    /// offline data).
    pub warnings: Vec<String>,
    /// Whether any data was sent to the site.
    pub updated: bool,
}
