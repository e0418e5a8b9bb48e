//! Integration tests for the AppRole lifecycle.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use std::sync::Arc;

use common::{FailingStore, engine, user};
use safekeep_core::approle::{AppRolePatch, AppRoleSpec, RevokeStatus};
use safekeep_core::policy::{Action, PermissionLevel};
use safekeep_core::principal::Principal;
use safekeep_core::safe::SafeMetadata;
use safekeep_core::{Error, ErrorKind, SafeKeep};

fn spec(name: &str) -> AppRoleSpec {
    AppRoleSpec {
        token_ttl_secs: 600,
        token_max_ttl_secs: 3600,
        secret_id_num_uses: 5,
        policies: vec!["default".to_owned()],
        ..AppRoleSpec::named(name)
    }
}

async fn setup() -> (Arc<FailingStore>, SafeKeep) {
    let store = Arc::new(FailingStore::new());
    let engine = engine(Arc::clone(&store));
    engine
        .approles()
        .create_app_role(&user("alice"), spec("ci-runner"))
        .await
        .unwrap();
    (store, engine)
}

#[tokio::test]
async fn created_role_reads_back_unchanged() {
    let (_, engine) = setup().await;
    let read = engine
        .approles()
        .read_app_role(&user("alice"), "ci-runner")
        .await
        .unwrap();
    assert_eq!(read, spec("ci-runner"));

    let details = engine
        .approles()
        .read_app_role_details(&user("alice"), "ci-runner")
        .await
        .unwrap();
    assert!(!details.role_id.is_empty());
    assert_eq!(details.owner.to_string(), "user:alice");

    let err = engine
        .approles()
        .create_app_role(&user("bob"), spec("ci-runner"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[tokio::test]
async fn only_the_owner_reads_the_role() {
    let (_, engine) = setup().await;
    let err = engine
        .approles()
        .read_app_role(&user("bob"), "ci-runner")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(
        engine.approles().get_owner("ci-runner").await.unwrap(),
        Principal::user("alice").unwrap()
    );
}

#[tokio::test]
async fn update_merges_and_revalidates() {
    let (_, engine) = setup().await;
    let updated = engine
        .approles()
        .update_app_role(
            &user("alice"),
            "ci-runner",
            AppRolePatch {
                token_ttl_secs: Some(300),
                ..AppRolePatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.spec.token_ttl_secs, 300);
    assert_eq!(updated.spec.token_max_ttl_secs, 3600);

    let err = engine
        .approles()
        .update_app_role(
            &user("alice"),
            "ci-runner",
            AppRolePatch {
                token_ttl_secs: Some(7200),
                ..AppRolePatch::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn bulk_revoke_reports_each_accessor() {
    let (_, engine) = setup().await;
    let alice = user("alice");
    let roles = engine.approles();
    let first = roles.issue_secret_id(&alice, "ci-runner").await.unwrap();
    let second = roles.issue_secret_id(&alice, "ci-runner").await.unwrap();

    let request = vec![
        first.accessor.clone(),
        "no-such-accessor".to_owned(),
        second.accessor.clone(),
    ];
    let report = roles.revoke_secret_ids(&alice, "ci-runner", &request).await.unwrap();
    let statuses: Vec<RevokeStatus> = report.items.iter().map(|i| i.status).collect();
    assert_eq!(
        statuses,
        [RevokeStatus::Revoked, RevokeStatus::NotFound, RevokeStatus::Revoked]
    );
    assert!(report.partial_failure);
    let accessors: Vec<&str> = report.items.iter().map(|i| i.accessor.as_str()).collect();
    assert_eq!(accessors, [first.accessor.as_str(), "no-such-accessor", second.accessor.as_str()]);

    assert!(
        roles
            .read_secret_id_accessors(&alice, "ci-runner")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn revoking_an_already_revoked_accessor_succeeds() {
    let (_, engine) = setup().await;
    let alice = user("alice");
    let roles = engine.approles();
    let issued = roles.issue_secret_id(&alice, "ci-runner").await.unwrap();
    let request = vec![issued.accessor.clone()];

    roles.revoke_secret_ids(&alice, "ci-runner", &request).await.unwrap();
    let again = roles.revoke_secret_ids(&alice, "ci-runner", &request).await.unwrap();
    assert_eq!(again.items[0].status, RevokeStatus::AlreadyRevoked);
    assert!(!again.partial_failure);
}

#[tokio::test]
async fn store_failures_are_reported_per_accessor() {
    let (store, engine) = setup().await;
    let alice = user("alice");
    let issued = engine.approles().issue_secret_id(&alice, "ci-runner").await.unwrap();
    store.set_fail_revokes(true);

    let report = engine
        .approles()
        .revoke_secret_ids(&alice, "ci-runner", &[issued.accessor])
        .await
        .unwrap();
    assert_eq!(report.items[0].status, RevokeStatus::Failed);
    assert!(report.items[0].error.is_some());
    assert!(report.partial_failure);
}

#[tokio::test]
async fn the_role_may_issue_its_own_secret_id() {
    let (_, engine) = setup().await;
    let role = Principal::app_role("ci-runner").unwrap();
    engine.approles().issue_secret_id(&role, "ci-runner").await.unwrap();

    let err = engine
        .approles()
        .issue_secret_id(&user("bob"), "ci-runner")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn association_needs_the_role_or_the_safe() {
    let (_, engine) = setup().await;
    let bob = user("bob");
    let mallory = user("mallory");
    engine
        .safes()
        .create_safe(&bob, "apps/bobs", SafeMetadata::default())
        .await
        .unwrap();
    let roles = engine.approles();

    let err = roles
        .associate(&mallory, "ci-runner", "apps/bobs", PermissionLevel::Read)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    assert!(roles.associate(&bob, "ci-runner", "apps/bobs", PermissionLevel::Read).await.unwrap());

    let err = roles.disassociate(&mallory, "ci-runner", "apps/bobs").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(roles.list_entity_associations("ci-runner").await.unwrap().len(), 1);

    assert!(roles.disassociate(&bob, "ci-runner", "apps/bobs").await.unwrap());
    assert!(roles.list_entity_associations("ci-runner").await.unwrap().is_empty());
}

#[tokio::test]
async fn association_grants_access_to_the_safe() {
    let (_, engine) = setup().await;
    let alice = user("alice");
    engine
        .safes()
        .create_safe(&alice, "apps/ci", SafeMetadata::default())
        .await
        .unwrap();
    let role = Principal::app_role("ci-runner").unwrap();
    let authz = engine.authorizer();
    assert!(!authz.authorize(&role, "apps/ci", Action::Read).await.unwrap().is_allowed());

    engine
        .approles()
        .associate(&alice, "ci-runner", "apps/ci", PermissionLevel::Read)
        .await
        .unwrap();
    assert!(authz.authorize(&role, "apps/ci/config", Action::Read).await.unwrap().is_allowed());
    assert!(!authz.authorize(&role, "apps/ci", Action::Write).await.unwrap().is_allowed());

    let associations = engine.approles().list_entity_associations("ci-runner").await.unwrap();
    assert_eq!(associations.len(), 1);
    assert_eq!(associations[0].level, PermissionLevel::Read);

    let err = engine
        .approles()
        .associate(&alice, "ci-runner", "apps/ci", PermissionLevel::Owner)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    engine
        .approles()
        .disassociate(&alice, "ci-runner", "apps/ci")
        .await
        .unwrap();
    assert!(!authz.authorize(&role, "apps/ci", Action::Read).await.unwrap().is_allowed());
}

#[tokio::test]
async fn delete_cascades_and_retry_converges() {
    let (store, engine) = setup().await;
    let alice = user("alice");
    engine
        .safes()
        .create_safe(&alice, "apps/ci", SafeMetadata::default())
        .await
        .unwrap();
    engine
        .approles()
        .associate(&alice, "ci-runner", "apps/ci", PermissionLevel::Write)
        .await
        .unwrap();
    engine.approles().issue_secret_id(&alice, "ci-runner").await.unwrap();

    store.set_fail_role_deletes(true);
    let err = engine
        .approles()
        .delete_app_role(&alice, "ci-runner")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    let Error::PartialFailure { steps, .. } = err else {
        panic!("expected a partial failure");
    };
    let failed: Vec<&str> = steps.iter().filter(|s| !s.ok).map(|s| s.step.as_str()).collect();
    assert_eq!(failed, ["delete_backend_role", "delete_record"]);
    assert!(steps.iter().any(|s| s.ok && s.step.starts_with("revoke_secret_id:")));
    assert!(steps.iter().any(|s| s.ok && s.step == "remove_association:apps/ci"));

    // The record survives so the retry can find the role.
    engine.approles().read_app_role(&alice, "ci-runner").await.unwrap();

    store.heal();
    engine
        .approles()
        .delete_app_role(&alice, "ci-runner")
        .await
        .unwrap();
    let err = engine
        .approles()
        .read_app_role(&alice, "ci-runner")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn list_is_sorted_and_paginated() {
    let (_, engine) = setup().await;
    let alice = user("alice");
    for name in ["b-role", "a-role"] {
        engine.approles().create_app_role(&alice, spec(name)).await.unwrap();
    }
    let all = engine.approles().list_app_roles(&alice, 10, 0).await.unwrap();
    assert_eq!(all, ["a-role", "b-role", "ci-runner"]);
    let page = engine.approles().list_app_roles(&alice, 1, 1).await.unwrap();
    assert_eq!(page, ["b-role"]);
    assert!(engine.approles().list_app_roles(&user("bob"), 10, 0).await.unwrap().is_empty());
}
