//! Bounded timeouts and retries around secret store calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::store::{AuthMethod, IssuedSecretId, PolicyDocument, RevokeOutcome, SecretStoreClient};

/// Retry policy for store calls: every attempt is bounded by `timeout`,
/// transient failures are retried up to `max_retries` times with
/// exponential backoff plus jitter.
#[derive(Debug, Clone, Copy)]
pub struct Upstream {
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
}

impl Upstream {
    #[must_use]
    pub fn new(timeout: Duration, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            timeout,
            max_retries,
            base_delay,
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.upstream_timeout,
            config.upstream_max_retries,
            config.retry_base_delay,
        )
    }

    /// Run `call` under the policy. Non-transient errors are returned at
    /// once; the last transient error is returned when retries run out.
    ///
    /// # Errors
    ///
    /// Returns the store error, or [`StoreError::Timeout`] when the final
    /// attempt did not complete in time.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout {
                    operation: operation.to_owned(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                },
            };

            if !err.is_transient() || attempt >= self.max_retries {
                return Err(err);
            }

            warn!(
                operation,
                attempt = attempt + 1,
                max_retries = self.max_retries,
                error = %err,
                "secret store call failed, retrying"
            );
            self.sleep_with_jitter(attempt).await;
            attempt += 1;
        }
    }

    async fn sleep_with_jitter(&self, attempt: u32) {
        // Retry budgets are small, so the shift cannot overflow in practice.
        #[allow(clippy::cast_possible_truncation)]
        let base = (self.base_delay.as_millis() as u64)
            .saturating_mul(2u64.saturating_pow(attempt));
        #[allow(clippy::cast_precision_loss)]
        let base_f = base as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jitter = (base_f * 0.3 * rand_f64()) as u64;
        tokio::time::sleep(Duration::from_millis(base.saturating_add(jitter))).await;
    }
}

/// Pseudo-random f64 in [0, 1) from the system clock.
fn rand_f64() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

/// A [`SecretStoreClient`] that routes every call of an inner client through
/// an [`Upstream`] policy.
#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn SecretStoreClient>,
    upstream: Upstream,
}

impl GuardedStore {
    #[must_use]
    pub fn new(inner: Arc<dyn SecretStoreClient>, upstream: Upstream) -> Self {
        Self { inner, upstream }
    }
}

#[async_trait::async_trait]
impl SecretStoreClient for GuardedStore {
    async fn read_policy(&self, path: &str) -> Result<Option<PolicyDocument>, StoreError> {
        self.upstream
            .call("read_policy", || self.inner.read_policy(path))
            .await
    }

    async fn write_policy(
        &self,
        path: &str,
        body: &Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.upstream
            .call("write_policy", || {
                self.inner.write_policy(path, body, expected_version)
            })
            .await
    }

    async fn delete_policy(&self, path: &str) -> Result<(), StoreError> {
        self.upstream
            .call("delete_policy", || self.inner.delete_policy(path))
            .await
    }

    async fn list_policies(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.upstream
            .call("list_policies", || self.inner.list_policies(prefix))
            .await
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.upstream
            .call("list_children", || self.inner.list_children(path))
            .await
    }

    async fn secret_count(&self, path: &str) -> Result<usize, StoreError> {
        self.upstream
            .call("secret_count", || self.inner.secret_count(path))
            .await
    }

    async fn create_folder(&self, path: &str) -> Result<(), StoreError> {
        self.upstream
            .call("create_folder", || self.inner.create_folder(path))
            .await
    }

    async fn delete_folder(&self, path: &str) -> Result<(), StoreError> {
        self.upstream
            .call("delete_folder", || self.inner.delete_folder(path))
            .await
    }

    async fn create_role_backend(
        &self,
        method: AuthMethod,
        name: &str,
        spec: &Value,
    ) -> Result<(), StoreError> {
        self.upstream
            .call("create_role_backend", || {
                self.inner.create_role_backend(method, name, spec)
            })
            .await
    }

    async fn update_role_backend(
        &self,
        method: AuthMethod,
        name: &str,
        spec: &Value,
    ) -> Result<(), StoreError> {
        self.upstream
            .call("update_role_backend", || {
                self.inner.update_role_backend(method, name, spec)
            })
            .await
    }

    async fn delete_role_backend(&self, method: AuthMethod, name: &str) -> Result<(), StoreError> {
        self.upstream
            .call("delete_role_backend", || {
                self.inner.delete_role_backend(method, name)
            })
            .await
    }

    async fn read_role_id(&self, role_name: &str) -> Result<String, StoreError> {
        self.upstream
            .call("read_role_id", || self.inner.read_role_id(role_name))
            .await
    }

    async fn issue_secret_id(&self, role_name: &str) -> Result<IssuedSecretId, StoreError> {
        self.upstream
            .call("issue_secret_id", || self.inner.issue_secret_id(role_name))
            .await
    }

    async fn list_secret_id_accessors(&self, role_name: &str) -> Result<Vec<String>, StoreError> {
        self.upstream
            .call("list_secret_id_accessors", || {
                self.inner.list_secret_id_accessors(role_name)
            })
            .await
    }

    async fn revoke_secret_id_accessor(
        &self,
        role_name: &str,
        accessor: &str,
    ) -> Result<RevokeOutcome, StoreError> {
        self.upstream
            .call("revoke_secret_id_accessor", || {
                self.inner.revoke_secret_id_accessor(role_name, accessor)
            })
            .await
    }
}
