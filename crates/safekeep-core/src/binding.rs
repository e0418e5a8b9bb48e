//! Credential bindings: machine identities bound to safes.
//!
//! AppRoles, AWS EC2 roles and AWS IAM roles are one record type,
//! [`CredentialBinding`], tagged by [`BindingKind`]. They share validation,
//! ownership, the association set and the create/update/associate code path
//! in [`BindingRegistry`]; the AppRole and AWS managers only add what is
//! specific to their kind.
//!
//! A binding lives in two places: the auth method role in the secret store
//! (what the login flow checks) and the binding record (owner,
//! associations, timestamps) under `bindings/<method>/<name>`.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent};
use crate::authz::EffectiveGrants;
use crate::error::{Error, Resource};
use crate::policy::{Action, PermissionLevel, SafePath};
use crate::principal::{Principal, PrincipalKey};
use crate::record::Versioned;
use crate::safe::{self, safe_root};
use crate::service::Context;
use crate::store::AuthMethod;

const RECORD_PREFIX: &str = "bindings/";
const NAME_MAX_LEN: usize = 64;
const IAM_ARN_PREFIX: &str = "arn:aws:iam::";

/// AppRole-specific settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRoleSettings {
    pub bind_secret_id: bool,
    pub secret_id_ttl_secs: i64,
    pub secret_id_num_uses: i64,
    #[serde(default)]
    pub token_bound_cidrs: Vec<String>,
    #[serde(default)]
    pub secret_id_bound_cidrs: Vec<String>,
}

/// Instance attributes an EC2 login must match. Empty lists are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ec2Bounds {
    #[serde(default)]
    pub bound_ami_id: Vec<String>,
    #[serde(default)]
    pub bound_account_id: Vec<String>,
    #[serde(default)]
    pub bound_region: Vec<String>,
    #[serde(default)]
    pub bound_vpc_id: Vec<String>,
    #[serde(default)]
    pub bound_subnet_id: Vec<String>,
    #[serde(default)]
    pub bound_iam_role_arn: Vec<String>,
    #[serde(default)]
    pub bound_iam_instance_profile_arn: Vec<String>,
}

impl Ec2Bounds {
    fn is_unbounded(&self) -> bool {
        [
            &self.bound_ami_id,
            &self.bound_account_id,
            &self.bound_region,
            &self.bound_vpc_id,
            &self.bound_subnet_id,
            &self.bound_iam_role_arn,
            &self.bound_iam_instance_profile_arn,
        ]
        .iter()
        .all(|bound| bound.is_empty())
    }
}

/// IAM principals an IAM login must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamBounds {
    #[serde(default)]
    pub bound_iam_principal_arn: Vec<String>,
}

/// What kind of machine identity a binding is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BindingKind {
    AppRole(AppRoleSettings),
    Ec2(Ec2Bounds),
    Iam(IamBounds),
}

impl BindingKind {
    #[must_use]
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::AppRole(_) => AuthMethod::AppRole,
            Self::Ec2(_) | Self::Iam(_) => AuthMethod::Aws,
        }
    }
}

/// Access a binding has to a safe, applied at the safe root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub safe: SafePath,
    pub level: PermissionLevel,
}

/// A machine identity with TTLs, policies and a safe association set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBinding {
    pub name: String,
    pub owner: PrincipalKey,
    pub token_ttl_secs: i64,
    pub token_max_ttl_secs: i64,
    #[serde(default)]
    pub policies: Vec<String>,
    pub kind: BindingKind,
    #[serde(default)]
    pub associations: Vec<Association>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialBinding {
    #[must_use]
    pub fn method(&self) -> AuthMethod {
        self.kind.method()
    }

    /// The associated level on the safe rooted at `safe`, if any.
    #[must_use]
    pub fn association_level(&self, safe: &SafePath) -> Option<PermissionLevel> {
        self.associations
            .iter()
            .find(|a| a.safe == *safe)
            .map(|a| a.level)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        validate_name(&self.name)?;
        validate_ttls(self.token_ttl_secs, self.token_max_ttl_secs)?;
        for policy in &self.policies {
            if policy.trim().is_empty() || policy.chars().any(char::is_whitespace) {
                return Err(Error::invalid(
                    "policies",
                    format!("invalid policy name '{policy}'"),
                ));
            }
        }
        match &self.kind {
            BindingKind::AppRole(settings) => {
                if settings.secret_id_ttl_secs < 0 {
                    return Err(Error::invalid("secret_id_ttl_secs", "must not be negative"));
                }
                if settings.secret_id_num_uses < 0 {
                    return Err(Error::invalid("secret_id_num_uses", "must not be negative"));
                }
                validate_cidrs("token_bound_cidrs", &settings.token_bound_cidrs)?;
                validate_cidrs("secret_id_bound_cidrs", &settings.secret_id_bound_cidrs)?;
            }
            BindingKind::Ec2(bounds) => {
                if bounds.is_unbounded() {
                    return Err(Error::invalid(
                        "bounds",
                        "an ec2 role needs at least one bound attribute",
                    ));
                }
            }
            BindingKind::Iam(bounds) => {
                if bounds.bound_iam_principal_arn.is_empty() {
                    return Err(Error::invalid(
                        "bound_iam_principal_arn",
                        "an iam role needs at least one principal arn",
                    ));
                }
                if let Some(arn) = bounds
                    .bound_iam_principal_arn
                    .iter()
                    .find(|arn| !arn.starts_with(IAM_ARN_PREFIX))
                {
                    return Err(Error::invalid(
                        "bound_iam_principal_arn",
                        format!("'{arn}' does not start with '{IAM_ARN_PREFIX}'"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Role configuration handed to the auth method backend.
    pub(crate) fn backend_spec(&self) -> Value {
        let mut spec = serde_json::to_value(&self.kind).unwrap_or_default();
        if let Value::Object(map) = &mut spec {
            map.insert("token_ttl_secs".to_owned(), json!(self.token_ttl_secs));
            map.insert("token_max_ttl_secs".to_owned(), json!(self.token_max_ttl_secs));
            map.insert("policies".to_owned(), json!(self.policies));
        }
        spec
    }
}

/// Validate a binding name: 1 to 64 characters of `[a-z0-9_-]`.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] otherwise.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return Err(Error::invalid(
            "name",
            format!("must be 1 to {NAME_MAX_LEN} characters"),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-')))
    {
        return Err(Error::invalid(
            "name",
            format!("unsupported character '{c}' in '{name}'"),
        ));
    }
    Ok(())
}

fn validate_ttls(ttl: i64, max_ttl: i64) -> Result<(), Error> {
    if ttl < 0 {
        return Err(Error::invalid("token_ttl_secs", "must not be negative"));
    }
    if max_ttl < ttl {
        return Err(Error::invalid(
            "token_max_ttl_secs",
            format!("{max_ttl} is lower than token_ttl_secs {ttl}"),
        ));
    }
    Ok(())
}

/// Every entry must be a CIDR block or a single IP address.
fn validate_cidrs(field: &str, entries: &[String]) -> Result<(), Error> {
    for entry in entries {
        let entry = entry.trim();
        if entry.parse::<IpNet>().is_err() && entry.parse::<IpAddr>().is_err() {
            return Err(Error::invalid(field, format!("'{entry}' is not a CIDR block")));
        }
    }
    Ok(())
}

pub(crate) fn record_path(method: AuthMethod, name: &str) -> String {
    format!("{RECORD_PREFIX}{method}/{name}")
}

fn resource_for(method: AuthMethod) -> Resource {
    match method {
        AuthMethod::AppRole => Resource::AppRole,
        AuthMethod::Aws => Resource::AwsRole,
    }
}

/// Parse a path that must name an existing safe root's path.
fn parse_safe_root(raw: &str) -> Result<SafePath, Error> {
    let path = SafePath::parse(raw)?;
    match safe_root(&path) {
        Some(root) if root == path => Ok(root),
        _ => Err(Error::invalid(
            "safe",
            format!("'{path}' is not a safe root"),
        )),
    }
}

/// Remove every association pointing at `safe`. Failures are logged and
/// skipped; returns the number of bindings updated.
pub(crate) async fn purge_safe(ctx: &Context, safe: &SafePath) -> usize {
    let mut purged = 0;
    for method in [AuthMethod::AppRole, AuthMethod::Aws] {
        let prefix = format!("{RECORD_PREFIX}{method}/");
        let keys = match ctx.records.list(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(safe = %safe, %method, error = %e, "listing bindings for association purge failed");
                continue;
            }
        };
        for key in keys {
            let name = key.strip_prefix(&prefix).unwrap_or(&key).to_owned();
            let result = ctx
                .records
                .mutate(&key, resource_for(method), &name, |binding: &mut CredentialBinding| {
                    let before = binding.associations.len();
                    binding.associations.retain(|a| a.safe != *safe);
                    Ok(binding.associations.len() != before)
                })
                .await;
            match result {
                Ok((_, true)) => purged += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    warn!(safe = %safe, binding = %name, error = %e, "association purge failed");
                }
            }
        }
    }
    purged
}

/// Lifecycle and association operations shared by every binding kind.
#[derive(Clone)]
pub(crate) struct BindingRegistry {
    ctx: Arc<Context>,
}

impl fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingRegistry").finish_non_exhaustive()
    }
}

impl BindingRegistry {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub(crate) async fn load(
        &self,
        method: AuthMethod,
        name: &str,
    ) -> Result<Versioned<CredentialBinding>, Error> {
        self.ctx
            .records
            .require(&record_path(method, name), resource_for(method), name)
            .await
    }

    /// The binding's owner or an administrator.
    pub(crate) fn require_owner(
        &self,
        actor: &Principal,
        binding: &CredentialBinding,
        action: Action,
    ) -> Result<(), Error> {
        if binding.owner == *actor.key() || self.ctx.config.is_admin(actor) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                principal: actor.to_string(),
                target: binding.name.clone(),
                action,
            })
        }
    }

    /// Load a binding the actor owns (or administers).
    pub(crate) async fn load_owned(
        &self,
        actor: &Principal,
        method: AuthMethod,
        name: &str,
        action: Action,
    ) -> Result<CredentialBinding, Error> {
        let binding = self.load(method, name).await?.record;
        self.require_owner(actor, &binding, action)?;
        Ok(binding)
    }

    /// Create the auth method role and the binding record.
    pub(crate) async fn create(
        &self,
        actor: &Principal,
        binding: CredentialBinding,
    ) -> Result<CredentialBinding, Error> {
        binding.validate()?;
        let method = binding.method();
        let resource = resource_for(method);
        let path = record_path(method, &binding.name);

        if self.ctx.records.load::<CredentialBinding>(&path).await?.is_some() {
            return Err(Error::AlreadyExists {
                resource,
                id: binding.name.clone(),
            });
        }

        self.ctx
            .store
            .create_role_backend(method, &binding.name, &binding.backend_spec())
            .await
            .map_err(|e| Error::from_store_for(resource, &binding.name, e))?;

        if let Err(e) = self
            .ctx
            .records
            .create(&path, &binding, resource, &binding.name)
            .await
        {
            if let Err(cleanup) = self.ctx.store.delete_role_backend(method, &binding.name).await {
                warn!(binding = %binding.name, %method, error = %cleanup, "rollback of backend role failed");
            }
            return Err(e);
        }

        info!(binding = %binding.name, %method, owner = %actor, "credential binding created");
        let action = match method {
            AuthMethod::AppRole => AuditAction::AppRoleCreated,
            AuthMethod::Aws => AuditAction::AwsRoleCreated,
        };
        self.ctx
            .audit
            .committed(AuditEvent::new(
                actor,
                action,
                binding.name.as_str(),
                json!({ "kind": binding.kind, "policies": binding.policies }),
            ))
            .await;
        Ok(binding)
    }

    /// Apply `apply` to the record, re-validate, and push the result to the
    /// auth method backend.
    pub(crate) async fn update<F>(
        &self,
        actor: &Principal,
        method: AuthMethod,
        name: &str,
        mut apply: F,
    ) -> Result<CredentialBinding, Error>
    where
        F: FnMut(&mut CredentialBinding) -> Result<(), Error>,
    {
        let (binding, changed) = self
            .ctx
            .records
            .mutate(
                &record_path(method, name),
                resource_for(method),
                name,
                |binding: &mut CredentialBinding| {
                    self.require_owner(actor, binding, Action::Admin)?;
                    let before = binding.clone();
                    apply(binding)?;
                    binding.validate()?;
                    if *binding == before {
                        return Ok(false);
                    }
                    binding.updated_at = Utc::now();
                    Ok(true)
                },
            )
            .await?;

        if changed {
            self.ctx
                .store
                .update_role_backend(method, name, &binding.backend_spec())
                .await
                .map_err(|e| Error::from_store_for(resource_for(method), name, e))?;
            info!(binding = %name, %method, actor = %actor, "credential binding updated");
            let action = match method {
                AuthMethod::AppRole => AuditAction::AppRoleUpdated,
                AuthMethod::Aws => AuditAction::AwsRoleUpdated,
            };
            self.ctx
                .audit
                .committed(AuditEvent::new(actor, action, name, json!({})))
                .await;
        }
        Ok(binding)
    }

    /// Whether the actor owns the safe at `root`. `None` if the safe does
    /// not exist.
    async fn owns_safe(&self, actor: &Principal, root: &SafePath) -> Result<Option<bool>, Error> {
        let Some(record) = safe::load_record(&self.ctx, root).await? else {
            return Ok(None);
        };
        let grants = EffectiveGrants::for_record(
            self.ctx.config.is_admin(actor),
            actor,
            &record.record,
            None,
        );
        Ok(Some(grants.decide(root, Action::Admin).is_allowed()))
    }

    /// Give the binding `level` on a safe. Requires ownership of the binding
    /// or of the safe. Returns whether the record changed.
    pub(crate) async fn associate(
        &self,
        actor: &Principal,
        method: AuthMethod,
        name: &str,
        safe: &str,
        level: PermissionLevel,
    ) -> Result<bool, Error> {
        if level == PermissionLevel::Owner {
            return Err(Error::invalid(
                "level",
                "owner cannot be granted through an association",
            ));
        }
        let root = parse_safe_root(safe)?;
        let owns_safe = self
            .owns_safe(actor, &root)
            .await?
            .ok_or_else(|| Error::not_found(Resource::Safe, &root))?;

        let (_, changed) = self
            .ctx
            .records
            .mutate(
                &record_path(method, name),
                resource_for(method),
                name,
                |binding: &mut CredentialBinding| {
                    if !owns_safe {
                        self.require_owner(actor, binding, Action::Grant)?;
                    }
                    match binding.associations.iter_mut().find(|a| a.safe == root) {
                        Some(existing) if existing.level == level => return Ok(false),
                        Some(existing) => existing.level = level,
                        None => binding.associations.push(Association {
                            safe: root.clone(),
                            level,
                        }),
                    }
                    binding.updated_at = Utc::now();
                    Ok(true)
                },
            )
            .await?;

        if changed {
            info!(binding = %name, %method, safe = %root, %level, "binding associated with safe");
            self.ctx
                .audit
                .committed(AuditEvent::new(
                    actor,
                    AuditAction::BindingAssociated,
                    name,
                    json!({ "method": method, "safe": root, "level": level }),
                ))
                .await;
        }
        Ok(changed)
    }

    /// Remove the binding's association with a safe. Requires ownership of
    /// the binding or of the safe. Returns whether the record changed.
    pub(crate) async fn disassociate(
        &self,
        actor: &Principal,
        method: AuthMethod,
        name: &str,
        safe: &str,
    ) -> Result<bool, Error> {
        let root = parse_safe_root(safe)?;
        let owns_safe = self.owns_safe(actor, &root).await?.unwrap_or(false);

        let (_, changed) = self
            .ctx
            .records
            .mutate(
                &record_path(method, name),
                resource_for(method),
                name,
                |binding: &mut CredentialBinding| {
                    if !owns_safe {
                        self.require_owner(actor, binding, Action::Grant)?;
                    }
                    let before = binding.associations.len();
                    binding.associations.retain(|a| a.safe != root);
                    if binding.associations.len() == before {
                        return Ok(false);
                    }
                    binding.updated_at = Utc::now();
                    Ok(true)
                },
            )
            .await?;

        if changed {
            info!(binding = %name, %method, safe = %root, "binding disassociated from safe");
            self.ctx
                .audit
                .committed(AuditEvent::new(
                    actor,
                    AuditAction::BindingDisassociated,
                    name,
                    json!({ "method": method, "safe": root }),
                ))
                .await;
        }
        Ok(changed)
    }

    /// Names of the bindings of `method` owned by the actor (all of them
    /// for administrators) that satisfy `filter`, sorted.
    pub(crate) async fn list_names<F>(
        &self,
        actor: &Principal,
        method: AuthMethod,
        filter: F,
    ) -> Result<Vec<String>, Error>
    where
        F: Fn(&CredentialBinding) -> bool,
    {
        let admin = self.ctx.config.is_admin(actor);
        let mut names = Vec::new();
        for key in self.ctx.records.list(&format!("{RECORD_PREFIX}{method}/")).await? {
            let Some(Versioned { record, .. }) =
                self.ctx.records.load::<CredentialBinding>(&key).await?
            else {
                continue;
            };
            if (admin || record.owner == *actor.key()) && filter(&record) {
                names.push(record.name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the auth method role, then the record.
    pub(crate) async fn delete(
        &self,
        actor: &Principal,
        binding: &CredentialBinding,
    ) -> Result<(), Error> {
        let method = binding.method();
        self.ctx
            .store
            .delete_role_backend(method, &binding.name)
            .await?;
        self.ctx
            .records
            .delete(&record_path(method, &binding.name))
            .await?;
        info!(binding = %binding.name, %method, actor = %actor, "credential binding deleted");
        Ok(())
    }
}
