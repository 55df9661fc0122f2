//! Conflict arbitration for snapshot applies
//!
//! Concurrent edits from multiple devices are resolved when a change is
//! applied to a snapshot store. Two policies are supported:
//! - `LastApplied`: whatever is applied last wins, regardless of timestamps
//! - `RejectStale`: an incoming change older than the stored snapshot is refused

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApplyError;

use super::types::ChangeRecord;

/// How to arbitrate an apply against an existing snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Unconditionally overwrite (last-write-wins by apply order)
    #[default]
    LastApplied,
    /// Refuse changes whose timestamp predates the stored snapshot
    RejectStale,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last_applied" | "last-applied" | "lww" => Ok(ConflictPolicy::LastApplied),
            "reject_stale" | "reject-stale" => Ok(ConflictPolicy::RejectStale),
            other => Err(format!("unknown conflict policy '{}'", other)),
        }
    }
}

/// Outcome of checking an incoming change against the stored snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No snapshot exists yet
    Fresh,
    /// Overwrite the snapshot
    Overwrite,
    /// Snapshot is newer than the change; the change was applied anyway
    OverwriteOlder,
}

/// Applies a `ConflictPolicy` to individual changes
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Decide whether `incoming` may replace a snapshot last written at
    /// `stored`.
    pub fn check(
        &self,
        incoming: &ChangeRecord,
        stored: Option<DateTime<Utc>>,
    ) -> Result<Verdict, ApplyError> {
        let Some(stored) = stored else {
            return Ok(Verdict::Fresh);
        };

        if incoming.timestamp >= stored {
            return Ok(Verdict::Overwrite);
        }

        match self.policy {
            ConflictPolicy::LastApplied => {
                tracing::debug!(
                    entity_type = %incoming.entity_type,
                    entity_id = %incoming.entity_id,
                    %stored,
                    incoming = %incoming.timestamp,
                    "Applying change older than stored snapshot"
                );
                Ok(Verdict::OverwriteOlder)
            }
            ConflictPolicy::RejectStale => Err(ApplyError::Stale {
                entity_type: incoming.entity_type.clone(),
                entity_id: incoming.entity_id.clone(),
                stored,
                incoming: incoming.timestamp,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::Operation;
    use chrono::Duration;

    fn make_change(timestamp: DateTime<Utc>) -> ChangeRecord {
        let mut record =
            ChangeRecord::new("habits", "7", Operation::Update, serde_json::json!({}), "A");
        record.timestamp = timestamp;
        record
    }

    #[test]
    fn test_fresh_when_no_snapshot() {
        let resolver = ConflictResolver::new(ConflictPolicy::RejectStale);
        let verdict = resolver.check(&make_change(Utc::now()), None).unwrap();
        assert_eq!(verdict, Verdict::Fresh);
    }

    #[test]
    fn test_newer_change_overwrites() {
        let now = Utc::now();
        let resolver = ConflictResolver::new(ConflictPolicy::RejectStale);
        let verdict = resolver
            .check(&make_change(now), Some(now - Duration::seconds(5)))
            .unwrap();
        assert_eq!(verdict, Verdict::Overwrite);
    }

    #[test]
    fn test_last_applied_accepts_older_change() {
        let now = Utc::now();
        let resolver = ConflictResolver::default();
        let verdict = resolver
            .check(&make_change(now - Duration::seconds(5)), Some(now))
            .unwrap();
        assert_eq!(verdict, Verdict::OverwriteOlder);
    }

    #[test]
    fn test_reject_stale_refuses_older_change() {
        let now = Utc::now();
        let resolver = ConflictResolver::new(ConflictPolicy::RejectStale);
        let result = resolver.check(&make_change(now - Duration::seconds(5)), Some(now));
        assert!(matches!(result, Err(ApplyError::Stale { .. })));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "reject_stale".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::RejectStale
        );
        assert_eq!("LWW".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::LastApplied);
        assert!("merge".parse::<ConflictPolicy>().is_err());
    }
}
