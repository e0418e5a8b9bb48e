//! Audit events for `SafeKeep`.
//!
//! Every committed state change (safe lifecycle, grant changes, ownership
//! transfer, credential binding lifecycle, secret id issuance and
//! revocation) produces an [`AuditEvent`] that is fanned out to every
//! registered [`AuditSink`].
//!
//! Events are recorded after the mutation has committed in the secret
//! store. A failure to record is logged and never rolls the mutation back;
//! shipping the events anywhere durable is the sink's job.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::AuditError;
use crate::principal::Principal;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SafeCreated,
    SafeUpdated,
    SafeDeleted,
    GrantAdded,
    GrantRemoved,
    OwnershipTransferred,
    AppRoleCreated,
    AppRoleUpdated,
    AppRoleDeleted,
    SecretIdIssued,
    SecretIdsRevoked,
    BindingAssociated,
    BindingDisassociated,
    AwsRoleCreated,
    AwsRoleUpdated,
    AwsRoleDeleted,
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub id: String,
    /// When the change committed.
    pub timestamp: DateTime<Utc>,
    /// `kind:id` of the principal that made the change.
    pub actor: String,
    pub action: AuditAction,
    /// Safe path or binding name the change applies to.
    pub target: String,
    /// Action-specific details. Never contains secret id values.
    #[serde(default)]
    pub detail: Value,
}

impl AuditEvent {
    #[must_use]
    pub fn new(actor: &Principal, action: AuditAction, target: impl Into<String>, detail: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.key().to_string(),
            action,
            target: target.into(),
            detail,
        }
    }
}

/// Destination for audit events.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name (for error reporting).
    fn name(&self) -> &str;

    /// Persist one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be persisted.
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Fans events out to every registered sink.
#[derive(Default)]
pub struct AuditLog {
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
}

impl AuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Send `event` to every sink. Succeeds if at least one sink accepted it
    /// or none are registered.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AllSinksFailed`] if every sink fails.
    pub async fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let sinks = self.sinks.read().await;
        if sinks.is_empty() {
            return Ok(());
        }

        let mut any_success = false;
        for sink in sinks.iter() {
            match sink.record(event).await {
                Ok(()) => any_success = true,
                Err(e) => {
                    warn!(sink = sink.name(), error = %e, "audit sink failed");
                }
            }
        }

        if any_success {
            Ok(())
        } else {
            Err(AuditError::AllSinksFailed)
        }
    }

    /// Record the event of an already committed change.
    pub(crate) async fn committed(&self, event: AuditEvent) {
        if let Err(e) = self.log(&event).await {
            warn!(
                event_id = %event.id,
                action = ?event.action,
                target = %event.target,
                error = %e,
                "audit of committed change failed"
            );
        }
    }
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

/// In-memory sink, used by tests and for inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, oldest first.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "memory"
    }

    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AuditError::SinkFailure {
                name: "memory".to_owned(),
                reason: "sink is failing".to_owned(),
            });
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> AuditEvent {
        let alice = Principal::user("alice").unwrap();
        AuditEvent::new(&alice, AuditAction::SafeCreated, "shared/team", json!({}))
    }

    #[tokio::test]
    async fn log_without_sinks_succeeds() {
        AuditLog::new().log(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn one_healthy_sink_is_enough() {
        let log = AuditLog::new();
        let broken = Arc::new(MemoryAuditSink::new());
        broken.set_failing(true);
        let healthy = Arc::new(MemoryAuditSink::new());
        log.add_sink(broken.clone()).await;
        log.add_sink(healthy.clone()).await;

        log.log(&event()).await.unwrap();
        assert!(broken.events().await.is_empty());
        assert_eq!(healthy.events().await.len(), 1);
    }

    #[tokio::test]
    async fn all_sinks_failing_is_an_error() {
        let log = AuditLog::new();
        let broken = Arc::new(MemoryAuditSink::new());
        broken.set_failing(true);
        log.add_sink(broken).await;
        assert!(matches!(
            log.log(&event()).await,
            Err(AuditError::AllSinksFailed)
        ));
        // Post-commit recording swallows the failure.
        log.committed(event()).await;
    }

    #[test]
    fn event_records_actor_key() {
        let e = event();
        assert_eq!(e.actor, "user:alice");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["action"], "safe_created");
    }
}
