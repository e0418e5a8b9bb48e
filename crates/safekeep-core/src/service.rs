//! The `SafeKeep` service: every component wired from one configuration and
//! one secret store.

use std::fmt;
use std::sync::Arc;

use safekeep_storage::MemoryBackend;

use crate::approle::AppRoleManager;
use crate::audit::AuditLog;
use crate::authz::Authorizer;
use crate::aws::AwsRoleManager;
use crate::config::EngineConfig;
use crate::principal::{OpenDirectory, PrincipalDirectory};
use crate::record::RecordStore;
use crate::safe::SafeRegistry;
use crate::store::{KvSecretStore, SecretStoreClient};
use crate::transfer::OwnershipTransfer;
use crate::upstream::{GuardedStore, Upstream};

/// State shared by every component.
pub(crate) struct Context {
    pub(crate) config: EngineConfig,
    /// The secret store behind the upstream guard.
    pub(crate) store: Arc<dyn SecretStoreClient>,
    pub(crate) records: RecordStore,
    pub(crate) directory: Arc<dyn PrincipalDirectory>,
    pub(crate) audit: Arc<AuditLog>,
}

/// Entry point of the core.
///
/// ```
/// # use safekeep_core::{SafeKeep, config::EngineConfig, principal::Principal};
/// # use safekeep_core::safe::SafeMetadata;
/// # tokio_test_runtime(async {
/// let engine = SafeKeep::in_memory(EngineConfig::default());
/// let alice = Principal::user("alice").unwrap();
/// engine.safes().create_safe(&alice, "shared/team", SafeMetadata::default()).await.unwrap();
/// assert!(engine.safes().is_authorized(&alice, "shared/team").await.unwrap());
/// # });
/// # fn tokio_test_runtime<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct SafeKeep {
    config: EngineConfig,
    audit: Arc<AuditLog>,
    safes: SafeRegistry,
    approles: AppRoleManager,
    aws_roles: AwsRoleManager,
    authorizer: Authorizer,
    transfers: OwnershipTransfer,
}

impl fmt::Debug for SafeKeep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeKeep")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SafeKeep {
    /// Build the service. Every store call goes through an upstream guard
    /// configured from `config`.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SecretStoreClient>,
        directory: Arc<dyn PrincipalDirectory>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let guarded: Arc<dyn SecretStoreClient> =
            Arc::new(GuardedStore::new(store, Upstream::from_config(&config)));
        let ctx = Arc::new(Context {
            records: RecordStore::new(Arc::clone(&guarded), config.max_conflict_retries),
            store: guarded,
            directory,
            audit: Arc::clone(&audit),
            config: config.clone(),
        });

        Self {
            config,
            audit,
            safes: SafeRegistry::new(Arc::clone(&ctx)),
            approles: AppRoleManager::new(Arc::clone(&ctx)),
            aws_roles: AwsRoleManager::new(Arc::clone(&ctx)),
            authorizer: Authorizer::new(Arc::clone(&ctx)),
            transfers: OwnershipTransfer::new(ctx),
        }
    }

    /// A service over an in-memory store that accepts every principal.
    #[must_use]
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::in_memory_with_directory(config, Arc::new(OpenDirectory))
    }

    #[must_use]
    pub fn in_memory_with_directory(
        config: EngineConfig,
        directory: Arc<dyn PrincipalDirectory>,
    ) -> Self {
        let store = KvSecretStore::new(Arc::new(MemoryBackend::new()));
        Self::new(config, Arc::new(store), directory, Arc::new(AuditLog::new()))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    #[must_use]
    pub fn safes(&self) -> &SafeRegistry {
        &self.safes
    }

    #[must_use]
    pub fn approles(&self) -> &AppRoleManager {
        &self.approles
    }

    #[must_use]
    pub fn aws_roles(&self) -> &AwsRoleManager {
        &self.aws_roles
    }

    #[must_use]
    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    #[must_use]
    pub fn transfers(&self) -> &OwnershipTransfer {
        &self.transfers
    }
}
