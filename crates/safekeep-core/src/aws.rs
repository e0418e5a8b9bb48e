//! AWS EC2 and IAM role management.
//!
//! AWS roles are [`CredentialBinding`]s of kind [`BindingKind::Ec2`] or
//! [`BindingKind::Iam`] under the `aws` auth method. Attaching one to a
//! safe is an association, exactly as for AppRoles.
//!
//! Detaching and deleting are different operations: [`detach_aws_role`]
//! only removes the association, [`delete_aws_role`] removes the
//! association and then the role itself.
//!
//! [`detach_aws_role`]: AwsRoleManager::detach_aws_role
//! [`delete_aws_role`]: AwsRoleManager::delete_aws_role

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditAction, AuditEvent};
use crate::binding::{BindingKind, BindingRegistry, CredentialBinding, Ec2Bounds, IamBounds};
use crate::error::{Error, Resource};
use crate::policy::{Action, PermissionLevel};
use crate::principal::Principal;
use crate::service::Context;
use crate::store::AuthMethod;

/// Definition of an EC2 role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ec2RoleSpec {
    pub name: String,
    #[serde(flatten)]
    pub bounds: Ec2Bounds,
    #[serde(default)]
    pub token_ttl_secs: i64,
    #[serde(default)]
    pub token_max_ttl_secs: i64,
    #[serde(default)]
    pub policies: Vec<String>,
}

/// Definition of an IAM role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamRoleSpec {
    pub name: String,
    #[serde(flatten)]
    pub bounds: IamBounds,
    #[serde(default)]
    pub token_ttl_secs: i64,
    #[serde(default)]
    pub token_max_ttl_secs: i64,
    #[serde(default)]
    pub policies: Vec<String>,
}

/// Partial update of an AWS role. Bounds replace the existing bounds and
/// must match the role's kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsRolePatch {
    #[serde(default)]
    pub token_ttl_secs: Option<i64>,
    #[serde(default)]
    pub token_max_ttl_secs: Option<i64>,
    #[serde(default)]
    pub policies: Option<Vec<String>>,
    #[serde(default)]
    pub ec2: Option<Ec2Bounds>,
    #[serde(default)]
    pub iam: Option<IamBounds>,
}

impl AwsRolePatch {
    fn apply(&self, binding: &mut CredentialBinding) -> Result<(), Error> {
        match (&mut binding.kind, &self.ec2, &self.iam) {
            (BindingKind::Ec2(current), Some(bounds), None) => current.clone_from(bounds),
            (BindingKind::Iam(current), None, Some(bounds)) => current.clone_from(bounds),
            (BindingKind::Ec2(_) | BindingKind::Iam(_), None, None) => {}
            (BindingKind::AppRole(_), _, _) => {
                return Err(Error::not_found(Resource::AwsRole, &binding.name));
            }
            _ => {
                return Err(Error::invalid(
                    "bounds",
                    format!("bounds do not match the kind of aws role '{}'", binding.name),
                ));
            }
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

/// AWS role management.
#[derive(Clone)]
pub struct AwsRoleManager {
    bindings: BindingRegistry,
}

impl fmt::Debug for AwsRoleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsRoleManager").finish_non_exhaustive()
    }
}

fn new_binding(
    actor: &Principal,
    name: String,
    kind: BindingKind,
    token_ttl_secs: i64,
    token_max_ttl_secs: i64,
    policies: Vec<String>,
) -> CredentialBinding {
    let now = Utc::now();
    CredentialBinding {
        name,
        owner: actor.key().clone(),
        token_ttl_secs,
        token_max_ttl_secs,
        policies,
        kind,
        associations: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

impl AwsRoleManager {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            bindings: BindingRegistry::new(ctx),
        }
    }

    /// Create an EC2 role owned by the actor.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a bad name, TTLs or empty bounds
    /// - [`Error::AlreadyExists`] if an AWS role with that name exists
    pub async fn create_ec2_role(
        &self,
        actor: &Principal,
        spec: Ec2RoleSpec,
    ) -> Result<CredentialBinding, Error> {
        let binding = new_binding(
            actor,
            spec.name,
            BindingKind::Ec2(spec.bounds),
            spec.token_ttl_secs,
            spec.token_max_ttl_secs,
            spec.policies,
        );
        self.bindings.create(actor, binding).await
    }

    /// Create an IAM role owned by the actor.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a bad name, TTLs or principal ARN
    /// - [`Error::AlreadyExists`] if an AWS role with that name exists
    pub async fn create_iam_role(
        &self,
        actor: &Principal,
        spec: IamRoleSpec,
    ) -> Result<CredentialBinding, Error> {
        let binding = new_binding(
            actor,
            spec.name,
            BindingKind::Iam(spec.bounds),
            spec.token_ttl_secs,
            spec.token_max_ttl_secs,
            spec.policies,
        );
        self.bindings.create(actor, binding).await
    }

    /// # Errors
    ///
    /// - [`Error::NotFound`] or [`Error::PermissionDenied`]
    /// - [`Error::InvalidArgument`] if the merged definition is invalid
    pub async fn update_aws_role(
        &self,
        actor: &Principal,
        name: &str,
        patch: AwsRolePatch,
    ) -> Result<CredentialBinding, Error> {
        self.bindings
            .update(actor, AuthMethod::Aws, name, |binding| patch.apply(binding))
            .await
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn read_aws_role(
        &self,
        actor: &Principal,
        name: &str,
    ) -> Result<CredentialBinding, Error> {
        self.bindings
            .load_owned(actor, AuthMethod::Aws, name, Action::Read)
            .await
    }

    /// Names of the AWS roles the actor owns (all of them for
    /// administrators), sorted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the secret store fails.
    pub async fn list_aws_roles(&self, actor: &Principal) -> Result<Vec<String>, Error> {
        self.bindings
            .list_names(actor, AuthMethod::Aws, |_| true)
            .await
    }

    /// Attach an AWS role to a safe. Requires ownership of the safe or of
    /// the role.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for `owner` level or a non-root path
    /// - [`Error::NotFound`] or [`Error::PermissionDenied`]
    pub async fn add_aws_role_to_safe(
        &self,
        actor: &Principal,
        safe: &str,
        name: &str,
        level: PermissionLevel,
    ) -> Result<bool, Error> {
        self.bindings
            .associate(actor, AuthMethod::Aws, name, safe, level)
            .await
    }

    /// Remove an AWS role's association with a safe. The role itself is
    /// kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn detach_aws_role(
        &self,
        actor: &Principal,
        safe: &str,
        name: &str,
    ) -> Result<bool, Error> {
        self.bindings
            .disassociate(actor, AuthMethod::Aws, name, safe)
            .await
    }

    /// Remove an AWS role's association with a safe, then delete the role.
    /// The deletion requires ownership of the role, which is checked before
    /// anything changes.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] or [`Error::PermissionDenied`]
    /// - [`Error::UpstreamUnavailable`] if the secret store fails
    pub async fn delete_aws_role(
        &self,
        actor: &Principal,
        safe: &str,
        name: &str,
    ) -> Result<(), Error> {
        self.bindings
            .load_owned(actor, AuthMethod::Aws, name, Action::Delete)
            .await?;
        self.bindings
            .disassociate(actor, AuthMethod::Aws, name, safe)
            .await?;
        let binding = self.bindings.load(AuthMethod::Aws, name).await?.record;
        self.bindings.delete(actor, &binding).await?;

        self.bindings
            .ctx()
            .audit
            .committed(AuditEvent::new(
                actor,
                AuditAction::AwsRoleDeleted,
                name,
                json!({ "safe": safe, "remaining_associations": binding.associations }),
            ))
            .await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::safe::SafeMetadata;
    use crate::service::SafeKeep;

    fn alice() -> Principal {
        Principal::user("alice").unwrap()
    }

    fn ec2_spec(name: &str) -> Ec2RoleSpec {
        Ec2RoleSpec {
            name: name.to_owned(),
            bounds: Ec2Bounds {
                bound_ami_id: vec!["ami-0abc".to_owned()],
                bound_region: vec!["us-east-1".to_owned()],
                ..Ec2Bounds::default()
            },
            token_ttl_secs: 60,
            token_max_ttl_secs: 600,
            policies: vec!["web".to_owned()],
        }
    }

    async fn engine() -> SafeKeep {
        let engine = SafeKeep::in_memory(EngineConfig::default());
        engine
            .safes()
            .create_safe(&alice(), "apps/web", SafeMetadata::default())
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn iam_role_requires_iam_arns() {
        let engine = engine().await;
        let err = engine
            .aws_roles()
            .create_iam_role(&alice(), IamRoleSpec {
                name: "deployer".to_owned(),
                bounds: IamBounds {
                    bound_iam_principal_arn: vec!["arn:aws:sts::1:assumed-role/x".to_owned()],
                },
                ..IamRoleSpec::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let role = engine
            .aws_roles()
            .create_iam_role(&alice(), IamRoleSpec {
                name: "deployer".to_owned(),
                bounds: IamBounds {
                    bound_iam_principal_arn: vec!["arn:aws:iam::123456789012:role/deployer".to_owned()],
                },
                ..IamRoleSpec::default()
            })
            .await
            .unwrap();
        assert!(matches!(role.kind, BindingKind::Iam(_)));
    }

    #[tokio::test]
    async fn detach_keeps_role_delete_removes_it() {
        let engine = engine().await;
        let aws = engine.aws_roles();
        aws.create_ec2_role(&alice(), ec2_spec("web-a")).await.unwrap();
        aws.create_ec2_role(&alice(), ec2_spec("web-b")).await.unwrap();
        aws.add_aws_role_to_safe(&alice(), "apps/web", "web-a", PermissionLevel::Read).await.unwrap();
        aws.add_aws_role_to_safe(&alice(), "apps/web", "web-b", PermissionLevel::Write).await.unwrap();

        assert!(aws.detach_aws_role(&alice(), "apps/web", "web-a").await.unwrap());
        assert!(aws.read_aws_role(&alice(), "web-a").await.unwrap().associations.is_empty());

        aws.delete_aws_role(&alice(), "apps/web", "web-b").await.unwrap();
        let err = aws.read_aws_role(&alice(), "web-b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(aws.list_aws_roles(&alice()).await.unwrap(), vec!["web-a"]);
    }

    #[tokio::test]
    async fn safe_owner_may_attach_foreign_role_but_not_delete_it() {
        let engine = engine().await;
        let bob = Principal::user("bob").unwrap();
        engine.aws_roles().create_ec2_role(&bob, ec2_spec("bobs-web")).await.unwrap();

        engine
            .aws_roles()
            .add_aws_role_to_safe(&alice(), "apps/web", "bobs-web", PermissionLevel::Read)
            .await
            .unwrap();
        let err = engine
            .aws_roles()
            .delete_aws_role(&alice(), "apps/web", "bobs-web")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        let role = engine.aws_roles().read_aws_role(&bob, "bobs-web").await.unwrap();
        assert_eq!(role.associations.len(), 1);
    }

    #[tokio::test]
    async fn update_rejects_mismatched_bounds() {
        let engine = engine().await;
        engine.aws_roles().create_ec2_role(&alice(), ec2_spec("web")).await.unwrap();
        let err = engine
            .aws_roles()
            .update_aws_role(&alice(), "web", AwsRolePatch {
                iam: Some(IamBounds::default()),
                ..AwsRolePatch::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let updated = engine
            .aws_roles()
            .update_aws_role(&alice(), "web", AwsRolePatch {
                policies: Some(vec!["web".to_owned(), "logs".to_owned()]),
                ..AwsRolePatch::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.policies, vec!["web", "logs"]);
    }
}
