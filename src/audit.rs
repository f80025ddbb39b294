//! Append-only audit events.
//!
//! Every mutation (entity create/delete, config writes, version bumps)
//! appends one TTL-expiring record under the subject's audit partition.
//! The sort key is an ISO-8601 UTC timestamp plus a short random suffix,
//! so records list in time order and never collide. Reading audit logs
//! is an external collaborator's job; the core only writes them.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default audit record retention, seconds (90 days).
pub const DEFAULT_AUDIT_RETENTION_SECS: u64 = 90 * 24 * 3600;

/// Operation recorded by an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CreateEntity,
    DeleteEntity,
    PutConfig,
    DeleteConfig,
    PutVersion,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CreateEntity => "create_entity",
            AuditAction::DeleteEntity => "delete_entity",
            AuditAction::PutConfig => "put_config",
            AuditAction::DeleteConfig => "delete_config",
            AuditAction::PutVersion => "put_version",
        }
    }
}

/// One audit record, ready to append.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    /// Entity id, `$SYSTEM`, or `$RESOURCE:{name}`.
    pub subject: String,
    pub action: AuditAction,
    /// Caller identity, when supplied.
    pub actor: Option<String>,
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub timestamp: String,
    /// Flat JSON detail payload.
    pub detail: serde_json::Value,
    /// Record expiry, unix seconds.
    pub ttl: u64,
}

impl AuditEvent {
    pub fn new(
        subject: impl Into<String>,
        action: AuditAction,
        actor: Option<&str>,
        detail: serde_json::Value,
        now_unix: u64,
    ) -> Self {
        Self {
            subject: subject.into(),
            action,
            actor: actor.map(str::to_string),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            detail,
            ttl: now_unix + DEFAULT_AUDIT_RETENTION_SECS,
        }
    }

    /// Sortable sort-key timestamp: the ISO timestamp plus an 8-hex
    /// suffix against same-millisecond collisions.
    pub fn sortable_ts(&self) -> String {
        let hex = Uuid::new_v4().simple().to_string();
        format!("{}#{}", self.timestamp, &hex[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sortable_ts_shape() {
        let event = AuditEvent::new(
            "u1",
            AuditAction::CreateEntity,
            Some("ops@example.com"),
            serde_json::json!({"cascade": false}),
            1_700_000_000,
        );
        let ts = event.sortable_ts();
        let (iso, suffix) = ts.rsplit_once('#').unwrap();
        assert_eq!(iso, event.timestamp);
        assert_eq!(suffix.len(), 8);
        assert!(iso.ends_with('Z'));
        assert_eq!(event.ttl, 1_700_000_000 + DEFAULT_AUDIT_RETENTION_SECS);
    }

    #[test]
    fn test_suffixes_differ() {
        let event = AuditEvent::new(
            "u1",
            AuditAction::PutConfig,
            None,
            serde_json::Value::Null,
            0,
        );
        assert_ne!(event.sortable_ts(), event.sortable_ts());
    }
}
