//! Authorization engine.
//!
//! Answers `(principal, path, action) -> Allow | Deny(reason)`:
//!
//! 1. The safe root is the first two segments of the path, provided the
//!    first one is a known safe type prefix. Anything else is `NoSafe`.
//! 2. Configured administrators are allowed.
//! 3. The principal's grants on the safe are gathered: grants made to the
//!    principal itself or, for users, to any of their groups. AppRole and
//!    AWS role principals additionally receive the level of their
//!    association with the safe, at the safe root.
//! 4. The grants are resolved with [`most_specific_grant`] and compared with
//!    the action's minimum level.
//!
//! The engine only reads; decisions can be made concurrently.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::binding::{self, CredentialBinding};
use crate::error::Error;
use crate::policy::{Action, PermissionLevel, SafePath, most_specific_grant};
use crate::principal::{Principal, PrincipalKind};
use crate::safe::{self, SafeRecord};
use crate::service::Context;
use crate::store::AuthMethod;

/// Why access was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// The path is not inside an existing safe.
    NoSafe,
    /// No grant applies to the path.
    NoGrant,
    /// The most specific grant is `deny`.
    ExplicitDeny,
    /// The most specific grant is weaker than the action requires.
    Insufficient {
        held: PermissionLevel,
        required: PermissionLevel,
    },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSafe => f.write_str("path is not inside a safe"),
            Self::NoGrant => f.write_str("no grant applies"),
            Self::ExplicitDeny => f.write_str("explicitly denied"),
            Self::Insufficient { held, required } => {
                write!(f, "holds {held}, requires {required}")
            }
        }
    }
}

/// An authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// The grants of one principal on one safe.
#[derive(Debug, Clone)]
pub struct EffectiveGrants {
    admin: bool,
    grants: Vec<(SafePath, PermissionLevel)>,
}

impl EffectiveGrants {
    /// Collect the grants on `record` that apply to `principal`, plus an
    /// association-derived level at the safe root.
    pub(crate) fn for_record(
        admin: bool,
        principal: &Principal,
        record: &SafeRecord,
        associated: Option<PermissionLevel>,
    ) -> Self {
        let mut grants: Vec<(SafePath, PermissionLevel)> = record
            .grants
            .iter()
            .filter(|g| principal.matches(&g.principal))
            .map(|g| (g.path.clone(), g.level))
            .collect();
        if let Some(level) = associated {
            grants.push((record.path.clone(), level));
        }
        Self { admin, grants }
    }

    /// The resolved level at `path`. Administrators hold `owner` everywhere.
    #[must_use]
    pub fn level_at(&self, path: &SafePath) -> Option<PermissionLevel> {
        if self.admin {
            return Some(PermissionLevel::Owner);
        }
        most_specific_grant(self.grants.iter().map(|(p, l)| (p, *l)), path)
    }

    #[must_use]
    pub fn decide(&self, path: &SafePath, action: Action) -> Decision {
        if self.admin {
            return Decision::Allow;
        }
        let required = action.required_level();
        match self.level_at(path) {
            None => Decision::Deny(DenyReason::NoGrant),
            Some(PermissionLevel::Deny) => Decision::Deny(DenyReason::ExplicitDeny),
            Some(held) if held.satisfies(required) => Decision::Allow,
            Some(held) => Decision::Deny(DenyReason::Insufficient { held, required }),
        }
    }

    /// Whether any grant stronger than `deny` applies anywhere in the safe.
    #[must_use]
    pub fn has_any_access(&self) -> bool {
        self.admin || self.grants.iter().any(|(_, l)| *l != PermissionLevel::Deny)
    }

    /// Whether some node at or below `node` could be visible.
    pub(crate) fn may_allow_within(&self, node: &SafePath) -> bool {
        if self.decide(node, Action::List).is_allowed() {
            return true;
        }
        self.grants
            .iter()
            .any(|(path, level)| *level != PermissionLevel::Deny && node.is_prefix_of(path))
    }
}

/// The binding method a machine principal authenticates through.
fn binding_method(kind: PrincipalKind) -> Option<AuthMethod> {
    match kind {
        PrincipalKind::AppRole => Some(AuthMethod::AppRole),
        PrincipalKind::AwsRole => Some(AuthMethod::Aws),
        PrincipalKind::User | PrincipalKind::Group => None,
    }
}

/// Resolve the grants of `principal` on an already loaded safe record.
pub(crate) async fn grants_for_record(
    ctx: &Context,
    principal: &Principal,
    record: &SafeRecord,
) -> Result<EffectiveGrants, Error> {
    let admin = ctx.config.is_admin(principal);
    let associated = match binding_method(principal.kind()) {
        Some(method) if !admin => {
            let path = binding::record_path(method, principal.id());
            ctx.records
                .load::<CredentialBinding>(&path)
                .await?
                .and_then(|b| b.record.association_level(&record.path))
        }
        _ => None,
    };
    Ok(EffectiveGrants::for_record(admin, principal, record, associated))
}

/// The authorization engine.
#[derive(Clone)]
pub struct Authorizer {
    ctx: Arc<Context>,
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer").finish_non_exhaustive()
    }
}

impl Authorizer {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn is_admin(&self, principal: &Principal) -> bool {
        self.ctx.config.is_admin(principal)
    }

    /// The grants of `principal` on the safe rooted at `safe_root`, or
    /// `None` if no such safe exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the records cannot be read.
    pub async fn effective_grants(
        &self,
        principal: &Principal,
        safe_root: &SafePath,
    ) -> Result<Option<EffectiveGrants>, Error> {
        let Some(record) = safe::load_record(&self.ctx, safe_root).await? else {
            return Ok(None);
        };
        Ok(Some(
            grants_for_record(&self.ctx, principal, &record.record).await?,
        ))
    }

    /// Decide whether `principal` may perform `action` on `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a malformed path and
    /// [`Error::UpstreamUnavailable`] if the records cannot be read.
    pub async fn authorize(
        &self,
        principal: &Principal,
        path: &str,
        action: Action,
    ) -> Result<Decision, Error> {
        let path = SafePath::parse(path)?;
        let Some(root) = safe::safe_root(&path) else {
            return Ok(Decision::Deny(DenyReason::NoSafe));
        };
        if self.is_admin(principal) {
            return Ok(Decision::Allow);
        }
        Ok(match self.effective_grants(principal, &root).await? {
            Some(grants) => grants.decide(&path, action),
            None => Decision::Deny(DenyReason::NoSafe),
        })
    }

    /// Like [`authorize`](Self::authorize), but a denial is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when the decision is a denial.
    pub async fn require(
        &self,
        principal: &Principal,
        path: &str,
        action: Action,
    ) -> Result<(), Error> {
        match self.authorize(principal, path, action).await? {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => {
                tracing::debug!(principal = %principal, path, %action, %reason, "access denied");
                Err(Error::PermissionDenied {
                    principal: principal.to_string(),
                    target: path.to_owned(),
                    action,
                })
            }
        }
    }
}
