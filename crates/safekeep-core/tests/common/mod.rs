//! Shared helpers for the `safekeep-core` integration tests.

#![allow(clippy::unwrap_used, dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use safekeep_core::audit::AuditLog;
use safekeep_core::config::EngineConfig;
use safekeep_core::error::StoreError;
use safekeep_core::principal::{OpenDirectory, Principal, PrincipalKey};
use safekeep_core::store::{
    AuthMethod, IssuedSecretId, KvSecretStore, PolicyDocument, RevokeOutcome, SecretStoreClient,
};
use safekeep_core::SafeKeep;
use safekeep_storage::MemoryBackend;
use serde_json::Value;

const UNLIMITED: u64 = u64::MAX;

/// A [`KvSecretStore`] with switchable failures.
pub struct FailingStore {
    inner: KvSecretStore,
    write_budget: AtomicU64,
    conflict_updates: AtomicBool,
    fail_role_deletes: AtomicBool,
    fail_revokes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: KvSecretStore::new(Arc::new(MemoryBackend::new())),
            write_budget: AtomicU64::new(UNLIMITED),
            conflict_updates: AtomicBool::new(false),
            fail_role_deletes: AtomicBool::new(false),
            fail_revokes: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &KvSecretStore {
        &self.inner
    }

    /// Allow `n` more successful policy writes, then fail them as unavailable.
    pub fn set_write_budget(&self, n: u64) {
        self.write_budget.store(n, Ordering::SeqCst);
    }

    /// Make every conditional update of an existing policy lose its race.
    pub fn set_conflict_updates(&self, on: bool) {
        self.conflict_updates.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_role_deletes(&self, on: bool) {
        self.fail_role_deletes.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_revokes(&self, on: bool) {
        self.fail_revokes.store(on, Ordering::SeqCst);
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        self.set_write_budget(UNLIMITED);
        self.set_conflict_updates(false);
        self.set_fail_role_deletes(false);
        self.set_fail_revokes(false);
    }

    fn take_write(&self) -> Result<(), StoreError> {
        self.write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                n => Some(n - 1),
            })
            .map(|_| ())
            .map_err(|_| unavailable("write budget exhausted"))
    }
}

fn unavailable(reason: &str) -> StoreError {
    StoreError::Unavailable {
        reason: reason.to_owned(),
    }
}

#[async_trait::async_trait]
impl SecretStoreClient for FailingStore {
    async fn read_policy(&self, path: &str) -> Result<Option<PolicyDocument>, StoreError> {
        self.inner.read_policy(path).await
    }

    async fn write_policy(
        &self,
        path: &str,
        body: &Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        if expected_version.is_some() && self.conflict_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict {
                path: path.to_owned(),
            });
        }
        self.take_write()?;
        self.inner.write_policy(path, body, expected_version).await
    }

    async fn delete_policy(&self, path: &str) -> Result<(), StoreError> {
        self.inner.delete_policy(path).await
    }

    async fn list_policies(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_policies(prefix).await
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_children(path).await
    }

    async fn secret_count(&self, path: &str) -> Result<usize, StoreError> {
        self.inner.secret_count(path).await
    }

    async fn create_folder(&self, path: &str) -> Result<(), StoreError> {
        self.inner.create_folder(path).await
    }

    async fn delete_folder(&self, path: &str) -> Result<(), StoreError> {
        self.inner.delete_folder(path).await
    }

    async fn create_role_backend(
        &self,
        method: AuthMethod,
        name: &str,
        spec: &Value,
    ) -> Result<(), StoreError> {
        self.inner.create_role_backend(method, name, spec).await
    }

    async fn update_role_backend(
        &self,
        method: AuthMethod,
        name: &str,
        spec: &Value,
    ) -> Result<(), StoreError> {
        self.inner.update_role_backend(method, name, spec).await
    }

    async fn delete_role_backend(&self, method: AuthMethod, name: &str) -> Result<(), StoreError> {
        if self.fail_role_deletes.load(Ordering::SeqCst) {
            return Err(unavailable("role deletion disabled"));
        }
        self.inner.delete_role_backend(method, name).await
    }

    async fn read_role_id(&self, role_name: &str) -> Result<String, StoreError> {
        self.inner.read_role_id(role_name).await
    }

    async fn issue_secret_id(&self, role_name: &str) -> Result<IssuedSecretId, StoreError> {
        self.inner.issue_secret_id(role_name).await
    }

    async fn list_secret_id_accessors(&self, role_name: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_secret_id_accessors(role_name).await
    }

    async fn revoke_secret_id_accessor(
        &self,
        role_name: &str,
        accessor: &str,
    ) -> Result<RevokeOutcome, StoreError> {
        if self.fail_revokes.load(Ordering::SeqCst) {
            return Err(unavailable("revocation disabled"));
        }
        self.inner.revoke_secret_id_accessor(role_name, accessor).await
    }
}

/// Configuration with fast, small retry budgets.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        upstream_timeout: Duration::from_secs(2),
        upstream_max_retries: 1,
        retry_base_delay: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

pub fn engine_with(store: Arc<FailingStore>, config: EngineConfig, audit: Arc<AuditLog>) -> SafeKeep {
    SafeKeep::new(config, store, Arc::new(OpenDirectory), audit)
}

pub fn engine(store: Arc<FailingStore>) -> SafeKeep {
    engine_with(store, fast_config(), Arc::new(AuditLog::new()))
}

pub fn user(id: &str) -> Principal {
    Principal::user(id).unwrap()
}

pub fn key(raw: &str) -> PrincipalKey {
    raw.parse().unwrap()
}
