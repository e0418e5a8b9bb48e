//! Integration tests for ownership transfer recovery and audit emission.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use common::{FailingStore, engine, engine_with, fast_config, key, user};
use safekeep_core::audit::{AuditAction, AuditLog, MemoryAuditSink};
use safekeep_core::audit_file::FileAuditSink;
use safekeep_core::policy::PermissionLevel;
use safekeep_core::safe::SafeMetadata;
use safekeep_core::transfer::TransferStage;
use safekeep_core::{Error, ErrorKind, SafeKeep};

async fn with_safe(store: &Arc<FailingStore>) -> SafeKeep {
    let engine = engine(Arc::clone(store));
    engine
        .safes()
        .create_safe(&user("alice"), "shared/team", SafeMetadata::default())
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn failed_demotion_leaves_two_owners_until_retried() {
    let store = Arc::new(FailingStore::new());
    let engine = with_safe(&store).await;
    let alice = user("alice");

    // Room for the grant write only; the demotion write fails.
    store.set_write_budget(1);
    let err = engine
        .transfers()
        .transfer(&alice, "shared/team", &key("user:bob"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    assert!(matches!(
        err,
        Error::TransferFailed {
            at: TransferStage::OldOwnerDemoted,
            ..
        }
    ));

    let record = engine.safes().get_safe(&alice, "shared/team").await.unwrap();
    assert_eq!(record.owner, key("user:alice"));
    assert_eq!(record.owner_grants().count(), 2);

    store.heal();
    let outcome = engine
        .transfers()
        .transfer(&alice, "shared/team", &key("user:bob"))
        .await
        .unwrap();
    assert_eq!(outcome.stage, TransferStage::Completed);
    assert_eq!(outcome.previous_owner, key("user:alice"));

    let record = engine
        .safes()
        .get_safe(&user("bob"), "shared/team")
        .await
        .unwrap();
    assert_eq!(record.owner, key("user:bob"));
    assert_eq!(record.owner_grants().count(), 1);
    assert_eq!(
        record.grant(&key("user:alice"), &record.path).unwrap().level,
        PermissionLevel::Write
    );
}

#[tokio::test]
async fn abandoned_transfer_leaves_no_owner_behind() {
    let store = Arc::new(FailingStore::new());
    let engine = with_safe(&store).await;
    let alice = user("alice");
    let carol = user("carol");

    store.set_write_budget(1);
    engine
        .transfers()
        .transfer(&alice, "shared/team", &key("user:carol"))
        .await
        .unwrap_err();
    store.heal();

    engine
        .transfers()
        .transfer(&alice, "shared/team", &key("user:bob"))
        .await
        .unwrap();

    let record = engine
        .safes()
        .get_safe(&user("bob"), "shared/team")
        .await
        .unwrap();
    assert_eq!(record.owner, key("user:bob"));
    let owners: Vec<_> = record.owner_grants().map(|g| g.principal.clone()).collect();
    assert_eq!(owners, [key("user:bob")]);
    assert!(record.grant(&key("user:carol"), &record.path).is_none());

    let err = engine
        .safes()
        .add_user(&carol, "shared/team", "mallory", PermissionLevel::Write)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn failed_grant_stage_changes_nothing() {
    let store = Arc::new(FailingStore::new());
    let engine = with_safe(&store).await;
    store.set_write_budget(0);

    let err = engine
        .transfers()
        .transfer(&user("alice"), "shared/team", &key("user:bob"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TransferFailed {
            at: TransferStage::GrantsUpdated,
            ..
        }
    ));

    store.heal();
    let record = engine
        .safes()
        .get_safe(&user("alice"), "shared/team")
        .await
        .unwrap();
    assert_eq!(record.owner_grants().count(), 1);
    assert!(record.grant(&key("user:bob"), &record.path).is_none());
}

#[tokio::test]
async fn the_former_owner_loses_owner_rights() {
    let store = Arc::new(FailingStore::new());
    let engine = with_safe(&store).await;
    let alice = user("alice");
    engine
        .transfers()
        .transfer(&alice, "shared/team", &key("user:bob"))
        .await
        .unwrap();

    let err = engine
        .safes()
        .add_user(&alice, "shared/team", "carol", PermissionLevel::Read)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = engine
        .transfers()
        .transfer(&alice, "shared/team", &key("user:carol"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn committed_changes_emit_audit_events() {
    let store = Arc::new(FailingStore::new());
    let audit = Arc::new(AuditLog::new());
    let sink = Arc::new(MemoryAuditSink::new());
    audit.add_sink(sink.clone()).await;
    let engine = engine_with(store, fast_config(), audit);
    let alice = user("alice");

    engine
        .safes()
        .create_safe(&alice, "shared/team", SafeMetadata::default())
        .await
        .unwrap();
    engine
        .safes()
        .add_user(&alice, "shared/team", "bob", PermissionLevel::Read)
        .await
        .unwrap();
    // No-op, no event.
    engine
        .safes()
        .add_user(&alice, "shared/team", "bob", PermissionLevel::Read)
        .await
        .unwrap();
    engine
        .transfers()
        .transfer(&alice, "shared/team", &key("user:bob"))
        .await
        .unwrap();

    let events = sink.events().await;
    let actions: Vec<AuditAction> = events.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        [
            AuditAction::SafeCreated,
            AuditAction::GrantAdded,
            AuditAction::OwnershipTransferred,
        ]
    );
    assert!(events.iter().all(|e| e.actor == "user:alice"));
    assert!(events.iter().all(|e| e.target == "shared/team"));
}

#[tokio::test]
async fn failing_audit_sink_does_not_fail_the_operation() {
    let store = Arc::new(FailingStore::new());
    let audit = Arc::new(AuditLog::new());
    let sink = Arc::new(MemoryAuditSink::new());
    sink.set_failing(true);
    audit.add_sink(sink.clone()).await;
    let engine = engine_with(store, fast_config(), audit);

    engine
        .safes()
        .create_safe(&user("alice"), "shared/team", SafeMetadata::default())
        .await
        .unwrap();
    engine
        .safes()
        .get_safe(&user("alice"), "shared/team")
        .await
        .unwrap();
    assert!(sink.events().await.is_empty());
}

#[tokio::test]
async fn file_sink_receives_one_line_per_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");
    let audit = Arc::new(AuditLog::new());
    audit.add_sink(Arc::new(FileAuditSink::new(&path))).await;
    let engine = engine_with(Arc::new(FailingStore::new()), fast_config(), audit);
    let alice = user("alice");

    engine
        .approles()
        .create_app_role(&alice, safekeep_core::approle::AppRoleSpec::named("ci-runner"))
        .await
        .unwrap();
    let issued = engine.approles().issue_secret_id(&alice, "ci-runner").await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["action"], "app_role_created");
    assert_eq!(lines[1]["action"], "secret_id_issued");
    assert_eq!(lines[1]["detail"]["accessor"], issued.accessor.as_str());
    assert!(!contents.contains(issued.secret_id.as_str()));
}
