//! AppRole lifecycle.
//!
//! An AppRole is a [`CredentialBinding`] of kind [`BindingKind::AppRole`].
//! Its owner manages it; login with `role_id` and `secret_id` happens in
//! the secret store and is not handled here. Secret ids have their own
//! lifecycle: they are issued one at a time, shown once, and revoked by
//! accessor. Revocation is terminal.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent};
use crate::binding::{
    AppRoleSettings, Association, BindingKind, BindingRegistry, CredentialBinding, record_path,
};
use crate::error::{Error, Resource, StepOutcome, StoreError};
use crate::policy::{Action, PermissionLevel};
use crate::principal::{Principal, PrincipalKey, PrincipalKind};
use crate::service::Context;
use crate::store::{AuthMethod, IssuedSecretId, RevokeOutcome};

fn default_true() -> bool {
    true
}

/// Caller-supplied AppRole definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRoleSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub bind_secret_id: bool,
    #[serde(default)]
    pub token_ttl_secs: i64,
    #[serde(default)]
    pub token_max_ttl_secs: i64,
    #[serde(default)]
    pub secret_id_ttl_secs: i64,
    /// Uses per secret id; 0 is unlimited.
    #[serde(default)]
    pub secret_id_num_uses: i64,
    #[serde(default)]
    pub token_bound_cidrs: Vec<String>,
    #[serde(default)]
    pub secret_id_bound_cidrs: Vec<String>,
    #[serde(default)]
    pub policies: Vec<String>,
}

impl Default for AppRoleSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind_secret_id: true,
            token_ttl_secs: 0,
            token_max_ttl_secs: 0,
            secret_id_ttl_secs: 0,
            secret_id_num_uses: 0,
            token_bound_cidrs: Vec::new(),
            secret_id_bound_cidrs: Vec::new(),
            policies: Vec::new(),
        }
    }
}

impl AppRoleSpec {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn into_binding(self, owner: PrincipalKey) -> CredentialBinding {
        let now = Utc::now();
        CredentialBinding {
            name: self.name,
            owner,
            token_ttl_secs: self.token_ttl_secs,
            token_max_ttl_secs: self.token_max_ttl_secs,
            policies: self.policies,
            kind: BindingKind::AppRole(AppRoleSettings {
                bind_secret_id: self.bind_secret_id,
                secret_id_ttl_secs: self.secret_id_ttl_secs,
                secret_id_num_uses: self.secret_id_num_uses,
                token_bound_cidrs: self.token_bound_cidrs,
                secret_id_bound_cidrs: self.secret_id_bound_cidrs,
            }),
            associations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn from_binding(binding: &CredentialBinding) -> Result<Self, Error> {
        let BindingKind::AppRole(settings) = &binding.kind else {
            return Err(Error::not_found(Resource::AppRole, &binding.name));
        };
        Ok(Self {
            name: binding.name.clone(),
            bind_secret_id: settings.bind_secret_id,
            token_ttl_secs: binding.token_ttl_secs,
            token_max_ttl_secs: binding.token_max_ttl_secs,
            secret_id_ttl_secs: settings.secret_id_ttl_secs,
            secret_id_num_uses: settings.secret_id_num_uses,
            token_bound_cidrs: settings.token_bound_cidrs.clone(),
            secret_id_bound_cidrs: settings.secret_id_bound_cidrs.clone(),
            policies: binding.policies.clone(),
        })
    }
}

/// Partial AppRole update. Only supplied fields change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppRolePatch {
    #[serde(default)]
    pub bind_secret_id: Option<bool>,
    #[serde(default)]
    pub token_ttl_secs: Option<i64>,
    #[serde(default)]
    pub token_max_ttl_secs: Option<i64>,
    #[serde(default)]
    pub secret_id_ttl_secs: Option<i64>,
    #[serde(default)]
    pub secret_id_num_uses: Option<i64>,
    #[serde(default)]
    pub token_bound_cidrs: Option<Vec<String>>,
    #[serde(default)]
    pub secret_id_bound_cidrs: Option<Vec<String>>,
    #[serde(default)]
    pub policies: Option<Vec<String>>,
}

impl AppRolePatch {
    fn apply(&self, binding: &mut CredentialBinding) -> Result<(), Error> {
        let BindingKind::AppRole(settings) = &mut binding.kind else {
            return Err(Error::not_found(Resource::AppRole, &binding.name));
        };
        if let Some(v) = self.bind_secret_id {
            settings.bind_secret_id = v;
        }
        if let Some(v) = self.secret_id_ttl_secs {
            settings.secret_id_ttl_secs = v;
        }
        if let Some(v) = self.secret_id_num_uses {
            settings.secret_id_num_uses = v;
        }
        if let Some(v) = &self.token_bound_cidrs {
            settings.token_bound_cidrs.clone_from(v);
        }
        if let Some(v) = &self.secret_id_bound_cidrs {
            settings.secret_id_bound_cidrs.clone_from(v);
        }
        if let Some(v) = self.token_ttl_secs {
            binding.token_ttl_secs = v;
        }
        if let Some(v) = self.token_max_ttl_secs {
            binding.token_max_ttl_secs = v;
        }
        if let Some(v) = &self.policies {
            binding.policies.clone_from(v);
        }
        Ok(())
    }
}

/// An AppRole with its server-assigned fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRoleDetails {
    #[serde(flatten)]
    pub spec: AppRoleSpec,
    pub role_id: String,
    pub owner: PrincipalKey,
    pub associations: Vec<Association>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of revoking one accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeStatus {
    Revoked,
    AlreadyRevoked,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeItem {
    pub accessor: String,
    pub status: RevokeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-accessor results of a bulk revocation, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRevokeReport {
    pub items: Vec<RevokeItem>,
    /// True when any item is `not_found` or `failed`.
    pub partial_failure: bool,
}

/// AppRole management.
#[derive(Clone)]
pub struct AppRoleManager {
    bindings: BindingRegistry,
}

impl fmt::Debug for AppRoleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRoleManager").finish_non_exhaustive()
    }
}

impl AppRoleManager {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            bindings: BindingRegistry::new(ctx),
        }
    }

    fn ctx(&self) -> &Context {
        self.bindings.ctx()
    }

    async fn details(&self, binding: &CredentialBinding) -> Result<AppRoleDetails, Error> {
        let role_id = self
            .ctx()
            .store
            .read_role_id(&binding.name)
            .await
            .map_err(|e| Error::from_store_for(Resource::AppRole, &binding.name, e))?;
        Ok(AppRoleDetails {
            spec: AppRoleSpec::from_binding(binding)?,
            role_id,
            owner: binding.owner.clone(),
            associations: binding.associations.clone(),
            created_at: binding.created_at,
            updated_at: binding.updated_at,
        })
    }

    /// Create an AppRole owned by the actor.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a bad name, TTLs or CIDR entry
    /// - [`Error::AlreadyExists`] if the name is taken
    /// - [`Error::UpstreamUnavailable`] if the secret store fails
    pub async fn create_app_role(
        &self,
        actor: &Principal,
        spec: AppRoleSpec,
    ) -> Result<AppRoleDetails, Error> {
        let binding = self
            .bindings
            .create(actor, spec.into_binding(actor.key().clone()))
            .await?;
        self.details(&binding).await
    }

    /// The AppRole definition. Owner or administrator only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn read_app_role(&self, actor: &Principal, name: &str) -> Result<AppRoleSpec, Error> {
        let binding = self
            .bindings
            .load_owned(actor, AuthMethod::AppRole, name, Action::Read)
            .await?;
        AppRoleSpec::from_binding(&binding)
    }

    /// The AppRole definition with `role_id`, owner, associations and
    /// timestamps. Owner or administrator only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn read_app_role_details(
        &self,
        actor: &Principal,
        name: &str,
    ) -> Result<AppRoleDetails, Error> {
        let binding = self
            .bindings
            .load_owned(actor, AuthMethod::AppRole, name, Action::Read)
            .await?;
        self.details(&binding).await
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn read_role_id(&self, actor: &Principal, name: &str) -> Result<String, Error> {
        self.bindings
            .load_owned(actor, AuthMethod::AppRole, name, Action::Read)
            .await?;
        self.ctx()
            .store
            .read_role_id(name)
            .await
            .map_err(|e| Error::from_store_for(Resource::AppRole, name, e))
    }

    /// Names of the AppRoles the actor owns (all of them for
    /// administrators), sorted and paginated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the secret store fails.
    pub async fn list_app_roles(
        &self,
        actor: &Principal,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, Error> {
        let names = self
            .bindings
            .list_names(actor, AuthMethod::AppRole, |_| true)
            .await?;
        Ok(names.into_iter().skip(offset).take(limit).collect())
    }

    /// Change the supplied fields of an AppRole. The merged definition is
    /// validated as a whole.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] or [`Error::PermissionDenied`]
    /// - [`Error::InvalidArgument`] if the merged definition is invalid
    pub async fn update_app_role(
        &self,
        actor: &Principal,
        name: &str,
        patch: AppRolePatch,
    ) -> Result<AppRoleDetails, Error> {
        let binding = self
            .bindings
            .update(actor, AuthMethod::AppRole, name, |binding| patch.apply(binding))
            .await?;
        self.details(&binding).await
    }

    /// Delete an AppRole and everything hanging off it: outstanding secret
    /// ids, associations, the backend role and the record.
    ///
    /// Every step runs even if an earlier one failed, except that the
    /// record is kept while the backend role still exists so a retry can
    /// find it. Returns the step outcomes.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] or [`Error::PermissionDenied`]
    /// - [`Error::PartialFailure`] with the step outcomes when any step failed
    pub async fn delete_app_role(
        &self,
        actor: &Principal,
        name: &str,
    ) -> Result<Vec<StepOutcome>, Error> {
        let binding = self
            .bindings
            .load_owned(actor, AuthMethod::AppRole, name, Action::Delete)
            .await?;
        let ctx = self.ctx();
        let mut steps = Vec::new();

        match ctx.store.list_secret_id_accessors(name).await {
            Ok(accessors) => {
                for accessor in accessors {
                    let step = format!("revoke_secret_id:{accessor}");
                    match ctx.store.revoke_secret_id_accessor(name, &accessor).await {
                        Ok(_) | Err(StoreError::NotFound { .. }) => steps.push(StepOutcome::ok(step)),
                        Err(e) => steps.push(StepOutcome::failed(step, &e)),
                    }
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => steps.push(StepOutcome::failed("list_secret_ids", &e)),
        }

        for association in &binding.associations {
            let step = format!("remove_association:{}", association.safe);
            let safe = association.safe.clone();
            let result = ctx
                .records
                .mutate(
                    &record_path(AuthMethod::AppRole, name),
                    Resource::AppRole,
                    name,
                    |b: &mut CredentialBinding| {
                        let before = b.associations.len();
                        b.associations.retain(|a| a.safe != safe);
                        Ok(b.associations.len() != before)
                    },
                )
                .await;
            match result {
                Ok(_) => steps.push(StepOutcome::ok(step)),
                Err(e) => steps.push(StepOutcome::failed(step, &e)),
            }
        }

        let backend_deleted = match ctx
            .store
            .delete_role_backend(AuthMethod::AppRole, name)
            .await
        {
            Ok(()) => {
                steps.push(StepOutcome::ok("delete_backend_role"));
                true
            }
            Err(e) => {
                steps.push(StepOutcome::failed("delete_backend_role", &e));
                false
            }
        };

        if backend_deleted {
            match ctx.records.delete(&record_path(AuthMethod::AppRole, name)).await {
                Ok(()) => steps.push(StepOutcome::ok("delete_record")),
                Err(e) => steps.push(StepOutcome::failed("delete_record", &e)),
            }
        } else {
            steps.push(StepOutcome::failed(
                "delete_record",
                &"skipped while the backend role still exists",
            ));
        }

        let failed = steps.iter().filter(|s| !s.ok).count();
        ctx.audit
            .committed(AuditEvent::new(
                actor,
                AuditAction::AppRoleDeleted,
                name,
                json!({ "steps": steps, "failed_steps": failed }),
            ))
            .await;

        if failed > 0 {
            warn!(role = %name, failed, "approle deletion partially failed");
            return Err(Error::PartialFailure {
                operation: "delete_app_role".to_owned(),
                target: name.to_owned(),
                steps,
            });
        }
        info!(role = %name, actor = %actor, "approle deleted");
        Ok(steps)
    }

    /// Issue a secret id. Allowed for the owner, administrators and the
    /// AppRole itself. The secret id value is returned once.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] or [`Error::PermissionDenied`]
    /// - [`Error::InvalidArgument`] if the role does not bind secret ids
    pub async fn issue_secret_id(
        &self,
        actor: &Principal,
        name: &str,
    ) -> Result<IssuedSecretId, Error> {
        let binding = self.bindings.load(AuthMethod::AppRole, name).await?.record;
        let is_self = actor.kind() == PrincipalKind::AppRole && actor.id() == binding.name;
        if !is_self {
            self.bindings
                .require_owner(actor, &binding, Action::Write)?;
        }
        if let BindingKind::AppRole(settings) = &binding.kind {
            if !settings.bind_secret_id {
                return Err(Error::invalid(
                    "bind_secret_id",
                    format!("approle '{name}' does not use secret ids"),
                ));
            }
        }

        let issued = self
            .ctx()
            .store
            .issue_secret_id(name)
            .await
            .map_err(|e| Error::from_store_for(Resource::AppRole, name, e))?;

        info!(role = %name, accessor = %issued.accessor, "secret id issued");
        self.ctx()
            .audit
            .committed(AuditEvent::new(
                actor,
                AuditAction::SecretIdIssued,
                name,
                json!({ "accessor": issued.accessor }),
            ))
            .await;
        Ok(issued)
    }

    /// Accessors of the live secret ids of an AppRole.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn read_secret_id_accessors(
        &self,
        actor: &Principal,
        name: &str,
    ) -> Result<Vec<String>, Error> {
        self.bindings
            .load_owned(actor, AuthMethod::AppRole, name, Action::Read)
            .await?;
        self.ctx()
            .store
            .list_secret_id_accessors(name)
            .await
            .map_err(|e| Error::from_store_for(Resource::AppRole, name, e))
    }

    /// Revoke secret ids by accessor. Every accessor is attempted; the
    /// report carries one outcome per accessor in request order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`] for the
    /// role itself. Per-accessor failures are reported, not returned.
    pub async fn revoke_secret_ids(
        &self,
        actor: &Principal,
        name: &str,
        accessors: &[String],
    ) -> Result<BulkRevokeReport, Error> {
        self.bindings
            .load_owned(actor, AuthMethod::AppRole, name, Action::Write)
            .await?;

        let mut items = Vec::with_capacity(accessors.len());
        for accessor in accessors {
            let (status, error) = match self
                .ctx()
                .store
                .revoke_secret_id_accessor(name, accessor)
                .await
            {
                Ok(RevokeOutcome::Revoked) => (RevokeStatus::Revoked, None),
                Ok(RevokeOutcome::AlreadyRevoked) => (RevokeStatus::AlreadyRevoked, None),
                Err(StoreError::NotFound { .. }) => (RevokeStatus::NotFound, None),
                Err(e) => (RevokeStatus::Failed, Some(e.to_string())),
            };
            items.push(RevokeItem {
                accessor: accessor.clone(),
                status,
                error,
            });
        }

        let partial_failure = items
            .iter()
            .any(|i| matches!(i.status, RevokeStatus::NotFound | RevokeStatus::Failed));
        let revoked = items
            .iter()
            .filter(|i| i.status == RevokeStatus::Revoked)
            .count();

        info!(role = %name, requested = accessors.len(), revoked, partial_failure, "secret ids revoked");
        self.ctx()
            .audit
            .committed(AuditEvent::new(
                actor,
                AuditAction::SecretIdsRevoked,
                name,
                json!({ "items": items, "partial_failure": partial_failure }),
            ))
            .await;
        Ok(BulkRevokeReport {
            items,
            partial_failure,
        })
    }

    /// Associate the AppRole with a safe. Requires ownership of the role or
    /// of the safe; `owner` is not associable. Returns whether anything
    /// changed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for `owner` level or a non-root path
    /// - [`Error::NotFound`] if the role or safe does not exist
    /// - [`Error::PermissionDenied`]
    pub async fn associate(
        &self,
        actor: &Principal,
        name: &str,
        safe: &str,
        level: PermissionLevel,
    ) -> Result<bool, Error> {
        self.bindings
            .associate(actor, AuthMethod::AppRole, name, safe, level)
            .await
    }

    /// Remove the AppRole's association with a safe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn disassociate(
        &self,
        actor: &Principal,
        name: &str,
        safe: &str,
    ) -> Result<bool, Error> {
        self.bindings
            .disassociate(actor, AuthMethod::AppRole, name, safe)
            .await
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the role does not exist.
    pub async fn list_entity_associations(&self, name: &str) -> Result<Vec<Association>, Error> {
        Ok(self
            .bindings
            .load(AuthMethod::AppRole, name)
            .await?
            .record
            .associations)
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the role does not exist.
    pub async fn get_owner(&self, name: &str) -> Result<Principal, Error> {
        let binding = self.bindings.load(AuthMethod::AppRole, name).await?.record;
        Ok(Principal::from(binding.owner))
    }
}
