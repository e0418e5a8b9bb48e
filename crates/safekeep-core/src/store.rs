//! Secret store client contract.
//!
//! The secret store is the external key/value tree that persists policy
//! documents, folders, auth-method roles and secret ids. The core only
//! consumes it through [`SecretStoreClient`]. [`KvSecretStore`] implements
//! the contract over any [`StorageBackend`] and is what the CLI and the tests
//! run against.
//!
//! # Consistency
//!
//! Policy documents carry a version. [`SecretStoreClient::write_policy`] is a
//! conditional write against that version, which is how concurrent grant
//! mutations on one safe are serialized without holding an in-process lock
//! across I/O. Nothing else is assumed about read-after-write visibility
//! across different paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use safekeep_storage::StorageBackend;

use crate::error::StoreError;

const POLICY_PREFIX: &str = "policy/";
const FOLDER_PREFIX: &str = "folder/";
const AUTH_PREFIX: &str = "auth/";

/// A versioned policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Monotonic version, starting at 1 on creation.
    pub version: u64,
    /// Document body.
    pub body: Value,
}

/// Auth methods that host machine-identity roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    AppRole,
    Aws,
}

impl AuthMethod {
    #[must_use]
    pub fn mount(self) -> &'static str {
        match self {
            Self::AppRole => "approle",
            Self::Aws => "aws",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mount())
    }
}

/// A freshly issued secret id. The value is shown once and never stored.
#[derive(Clone, Serialize, Deserialize)]
pub struct IssuedSecretId {
    pub secret_id: String,
    pub accessor: String,
}

impl fmt::Debug for IssuedSecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedSecretId")
            .field("secret_id", &"[REDACTED]")
            .field("accessor", &self.accessor)
            .finish()
    }
}

/// Result of revoking a secret id accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeOutcome {
    Revoked,
    AlreadyRevoked,
}

/// Contract of the external secret store.
///
/// All methods are potentially blocking network I/O. Callers in the core
/// reach the store through [`GuardedStore`](crate::upstream::GuardedStore),
/// which bounds every call with a timeout and retries transient failures.
#[async_trait::async_trait]
pub trait SecretStoreClient: Send + Sync + 'static {
    /// Read a policy document. `Ok(None)` if absent.
    async fn read_policy(&self, path: &str) -> Result<Option<PolicyDocument>, StoreError>;

    /// Conditionally write a policy document and return its new version.
    ///
    /// `expected_version = None` requires the document to be absent;
    /// `Some(v)` requires the stored version to be `v`. Any mismatch is
    /// [`StoreError::Conflict`].
    async fn write_policy(
        &self,
        path: &str,
        body: &Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Delete a policy document. Idempotent.
    async fn delete_policy(&self, path: &str) -> Result<(), StoreError>;

    /// Paths of all policy documents under `prefix`, sorted.
    async fn list_policies(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Immediate child folder names of `path`, sorted.
    /// [`StoreError::NotFound`] if neither the folder nor any child exists.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Number of secrets stored directly in the folder at `path`.
    async fn secret_count(&self, path: &str) -> Result<usize, StoreError>;

    /// Create an empty folder. Idempotent.
    async fn create_folder(&self, path: &str) -> Result<(), StoreError>;

    /// Delete a folder node. Idempotent.
    async fn delete_folder(&self, path: &str) -> Result<(), StoreError>;

    /// Create a role in an auth method. [`StoreError::Conflict`] if it exists.
    async fn create_role_backend(
        &self,
        method: AuthMethod,
        name: &str,
        spec: &Value,
    ) -> Result<(), StoreError>;

    /// Replace the configuration of an existing role.
    async fn update_role_backend(
        &self,
        method: AuthMethod,
        name: &str,
        spec: &Value,
    ) -> Result<(), StoreError>;

    /// Delete a role together with every secret id issued under it. Idempotent.
    async fn delete_role_backend(&self, method: AuthMethod, name: &str) -> Result<(), StoreError>;

    /// The `role_id` of an AppRole.
    async fn read_role_id(&self, role_name: &str) -> Result<String, StoreError>;

    /// Issue a new secret id under an AppRole.
    async fn issue_secret_id(&self, role_name: &str) -> Result<IssuedSecretId, StoreError>;

    /// Accessors of live (non-revoked, unexpired) secret ids, sorted.
    async fn list_secret_id_accessors(&self, role_name: &str) -> Result<Vec<String>, StoreError>;

    /// Revoke a secret id by accessor. Revocation is terminal and idempotent.
    async fn revoke_secret_id_accessor(
        &self,
        role_name: &str,
        accessor: &str,
    ) -> Result<RevokeOutcome, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPolicy {
    version: u64,
    body: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredFolder {
    #[serde(default)]
    secrets: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRole {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role_id: Option<String>,
    spec: Value,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSecretId {
    secret_id_hash: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    num_uses: u64,
    revoked: bool,
}

/// [`SecretStoreClient`] implemented over a [`StorageBackend`].
///
/// Key layout:
///
/// - `policy/<path>`: versioned policy documents
/// - `folder/<path>`: folder nodes with their secrets
/// - `auth/<method>/role/<name>`: auth method roles
/// - `auth/approle/secret-id/<role>/<accessor>`: secret ids (SHA-256 hashed)
#[derive(Clone)]
pub struct KvSecretStore {
    backend: Arc<dyn StorageBackend>,
}

impl fmt::Debug for KvSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvSecretStore").finish_non_exhaustive()
    }
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        path: key.to_owned(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
        path: key.to_owned(),
        reason: format!("serialization failed: {e}"),
    })
}

fn hash_secret_id(secret_id: &str) -> String {
    hex::encode(Sha256::digest(secret_id.as_bytes()))
}

impl KvSecretStore {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn policy_key(path: &str) -> String {
        format!("{POLICY_PREFIX}{path}")
    }

    fn folder_key(path: &str) -> String {
        format!("{FOLDER_PREFIX}{path}")
    }

    fn role_key(method: AuthMethod, name: &str) -> String {
        format!("{AUTH_PREFIX}{method}/role/{name}")
    }

    fn secret_id_prefix(role_name: &str) -> String {
        format!("{AUTH_PREFIX}approle/secret-id/{role_name}/")
    }

    async fn read_role(&self, method: AuthMethod, name: &str) -> Result<StoredRole, StoreError> {
        let key = Self::role_key(method, name);
        let bytes = self
            .backend
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound { path: key.clone() })?;
        decode(&key, &bytes)
    }

    /// Store a secret in a folder, creating the folder if needed.
    ///
    /// Secret values are outside the core's concern; this exists so tests
    /// and local tooling can populate folders.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backend fails.
    pub async fn put_secret(&self, folder: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let folder_key = Self::folder_key(folder);
        let mut stored: StoredFolder = match self.backend.get(&folder_key).await? {
            Some(bytes) => decode(&folder_key, &bytes)?,
            None => StoredFolder::default(),
        };
        stored.secrets.insert(key.to_owned(), value.to_owned());
        self.backend
            .put(&folder_key, &encode(&folder_key, &stored)?)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecretStoreClient for KvSecretStore {
    async fn read_policy(&self, path: &str) -> Result<Option<PolicyDocument>, StoreError> {
        let key = Self::policy_key(path);
        let Some(bytes) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        let stored: StoredPolicy = decode(&key, &bytes)?;
        Ok(Some(PolicyDocument {
            version: stored.version,
            body: stored.body,
        }))
    }

    async fn write_policy(
        &self,
        path: &str,
        body: &Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let key = Self::policy_key(path);
        let conflict = || StoreError::Conflict {
            path: path.to_owned(),
        };

        let current_bytes = self.backend.get(&key).await?;
        let current_version = match &current_bytes {
            Some(bytes) => Some(decode::<StoredPolicy>(&key, bytes)?.version),
            None => None,
        };
        if current_version != expected_version {
            return Err(conflict());
        }

        let version = current_version.map_or(1, |v| v + 1);
        let new_bytes = encode(
            &key,
            &StoredPolicy {
                version,
                body: body.clone(),
            },
        )?;
        if self
            .backend
            .compare_and_swap(&key, current_bytes.as_deref(), &new_bytes)
            .await?
        {
            Ok(version)
        } else {
            Err(conflict())
        }
    }

    async fn delete_policy(&self, path: &str) -> Result<(), StoreError> {
        self.backend.delete(&Self::policy_key(path)).await?;
        Ok(())
    }

    async fn list_policies(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys = self.backend.list(&Self::policy_key(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(POLICY_PREFIX).map(String::from))
            .collect())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let folder_key = Self::folder_key(path);
        let prefix = format!("{folder_key}/");
        let keys = self.backend.list(&prefix).await?;
        let children: BTreeSet<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();

        if children.is_empty() && !self.backend.exists(&folder_key).await? {
            return Err(StoreError::NotFound {
                path: path.to_owned(),
            });
        }
        Ok(children.into_iter().collect())
    }

    async fn secret_count(&self, path: &str) -> Result<usize, StoreError> {
        let key = Self::folder_key(path);
        let bytes = self
            .backend
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_owned(),
            })?;
        let stored: StoredFolder = decode(&key, &bytes)?;
        Ok(stored.secrets.len())
    }

    async fn create_folder(&self, path: &str) -> Result<(), StoreError> {
        let key = Self::folder_key(path);
        let bytes = encode(&key, &StoredFolder::default())?;
        // Losing the race means the folder already exists, which is fine.
        self.backend.compare_and_swap(&key, None, &bytes).await?;
        Ok(())
    }

    async fn delete_folder(&self, path: &str) -> Result<(), StoreError> {
        self.backend.delete(&Self::folder_key(path)).await?;
        Ok(())
    }

    async fn create_role_backend(
        &self,
        method: AuthMethod,
        name: &str,
        spec: &Value,
    ) -> Result<(), StoreError> {
        let key = Self::role_key(method, name);
        let role = StoredRole {
            role_id: (method == AuthMethod::AppRole).then(|| uuid::Uuid::new_v4().to_string()),
            spec: spec.clone(),
            created_at: Utc::now(),
        };
        if self
            .backend
            .compare_and_swap(&key, None, &encode(&key, &role)?)
            .await?
        {
            Ok(())
        } else {
            Err(StoreError::Conflict { path: key })
        }
    }

    async fn update_role_backend(
        &self,
        method: AuthMethod,
        name: &str,
        spec: &Value,
    ) -> Result<(), StoreError> {
        let key = Self::role_key(method, name);
        let mut role = self.read_role(method, name).await?;
        role.spec = spec.clone();
        self.backend.put(&key, &encode(&key, &role)?).await?;
        Ok(())
    }

    async fn delete_role_backend(&self, method: AuthMethod, name: &str) -> Result<(), StoreError> {
        self.backend.delete(&Self::role_key(method, name)).await?;
        if method == AuthMethod::AppRole {
            for key in self.backend.list(&Self::secret_id_prefix(name)).await? {
                self.backend.delete(&key).await?;
            }
        }
        Ok(())
    }

    async fn read_role_id(&self, role_name: &str) -> Result<String, StoreError> {
        let role = self.read_role(AuthMethod::AppRole, role_name).await?;
        role.role_id.ok_or_else(|| StoreError::Corrupt {
            path: Self::role_key(AuthMethod::AppRole, role_name),
            reason: "approle has no role_id".to_owned(),
        })
    }

    async fn issue_secret_id(&self, role_name: &str) -> Result<IssuedSecretId, StoreError> {
        let role = self.read_role(AuthMethod::AppRole, role_name).await?;
        let ttl_secs = role
            .spec
            .get("secret_id_ttl_secs")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let num_uses = role
            .spec
            .get("secret_id_num_uses")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let secret_id = uuid::Uuid::new_v4().to_string();
        let accessor = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let entry = StoredSecretId {
            secret_id_hash: hash_secret_id(&secret_id),
            created_at: now,
            expires_at: (ttl_secs > 0).then(|| now + Duration::seconds(ttl_secs)),
            num_uses,
            revoked: false,
        };

        let key = format!("{}{accessor}", Self::secret_id_prefix(role_name));
        self.backend.put(&key, &encode(&key, &entry)?).await?;
        Ok(IssuedSecretId {
            secret_id,
            accessor,
        })
    }

    async fn list_secret_id_accessors(&self, role_name: &str) -> Result<Vec<String>, StoreError> {
        self.read_role(AuthMethod::AppRole, role_name).await?;
        let prefix = Self::secret_id_prefix(role_name);
        let now = Utc::now();
        let mut accessors = Vec::new();
        for key in self.backend.list(&prefix).await? {
            let Some(bytes) = self.backend.get(&key).await? else {
                continue;
            };
            let entry: StoredSecretId = decode(&key, &bytes)?;
            let expired = entry.expires_at.is_some_and(|at| at <= now);
            if !entry.revoked && !expired {
                if let Some(accessor) = key.strip_prefix(&prefix) {
                    accessors.push(accessor.to_owned());
                }
            }
        }
        Ok(accessors)
    }

    async fn revoke_secret_id_accessor(
        &self,
        role_name: &str,
        accessor: &str,
    ) -> Result<RevokeOutcome, StoreError> {
        let key = format!("{}{accessor}", Self::secret_id_prefix(role_name));
        loop {
            let Some(bytes) = self.backend.get(&key).await? else {
                return Err(StoreError::NotFound { path: key });
            };
            let mut entry: StoredSecretId = decode(&key, &bytes)?;
            if entry.revoked {
                return Ok(RevokeOutcome::AlreadyRevoked);
            }
            entry.revoked = true;
            if self
                .backend
                .compare_and_swap(&key, Some(&bytes), &encode(&key, &entry)?)
                .await?
            {
                return Ok(RevokeOutcome::Revoked);
            }
        }
    }
}
