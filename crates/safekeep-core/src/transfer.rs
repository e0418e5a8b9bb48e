//! Safe ownership transfer.
//!
//! A transfer moves through
//! `Initiated -> GrantsUpdated -> OldOwnerDemoted -> Completed`:
//!
//! 1. **Initiated**: the caller is the recorded owner or an administrator,
//!    and the new owner is a known user other than the current owner.
//! 2. **GrantsUpdated**: a conditional write gives the new owner an `owner`
//!    grant on the safe root. Skipped if the grant is already there.
//! 3. **OldOwnerDemoted**: a second conditional write lowers the previous
//!    owner's grant to the configured level, drops `owner` grants left by
//!    abandoned transfers to other principals and records the new owner.
//! 4. **Completed**: an `ownership_transferred` audit event is emitted.
//!
//! A failure at any stage is reported as [`Error::TransferFailed`] with the
//! stage. If the demotion fails the safe is left with two `owner` grants;
//! calling [`OwnershipTransfer::transfer`] again skips stage 2 and re-runs
//! only the demotion.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent};
use crate::error::{Error, Resource};
use crate::policy::{Action, PermissionLevel, SafePath};
use crate::principal::{Principal, PrincipalKey, PrincipalKind};
use crate::safe::{self, SafeRecord, safe_root};
use crate::service::Context;

/// Stages of an ownership transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    Initiated,
    GrantsUpdated,
    OldOwnerDemoted,
    Completed,
}

impl TransferStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::GrantsUpdated => "grants_updated",
            Self::OldOwnerDemoted => "old_owner_demoted",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub safe: SafePath,
    pub previous_owner: PrincipalKey,
    pub new_owner: PrincipalKey,
    /// Level the previous owner keeps.
    pub demoted_to: PermissionLevel,
    pub stage: TransferStage,
}

/// Coordinates ownership transfers.
#[derive(Clone)]
pub struct OwnershipTransfer {
    ctx: Arc<Context>,
}

impl fmt::Debug for OwnershipTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipTransfer").finish_non_exhaustive()
    }
}

fn require_current_owner(
    ctx: &Context,
    actor: &Principal,
    record: &SafeRecord,
) -> Result<(), Error> {
    if record.owner == *actor.key() || ctx.config.is_admin(actor) {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            principal: actor.to_string(),
            target: record.path.to_string(),
            action: Action::TransferOwnership,
        })
    }
}

impl OwnershipTransfer {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Transfer ownership of the safe at `path` to `new_owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferFailed`] carrying the stage that failed and
    /// the underlying error; its [`kind`](Error::kind) is the underlying
    /// error's kind.
    pub async fn transfer(
        &self,
        actor: &Principal,
        path: &str,
        new_owner: &PrincipalKey,
    ) -> Result<TransferOutcome, Error> {
        let failed = |at: TransferStage, safe: &str| {
            let safe = safe.to_owned();
            move |source: Error| Error::TransferFailed {
                safe,
                at,
                source: Box::new(source),
            }
        };

        let root = self
            .initiate(actor, path, new_owner)
            .await
            .map_err(failed(TransferStage::Initiated, path))?;
        let record_path = safe::record_path(&root);
        let ctx = &self.ctx;

        let (_, granted) = ctx
            .records
            .mutate(
                &record_path,
                Resource::Safe,
                root.as_str(),
                |record: &mut SafeRecord| {
                    require_current_owner(ctx, actor, record)?;
                    if record.owner == *new_owner {
                        return Ok(false);
                    }
                    if !record.set_grant(new_owner, &root, PermissionLevel::Owner) {
                        return Ok(false);
                    }
                    record.updated_at = Utc::now();
                    Ok(true)
                },
            )
            .await
            .map_err(failed(TransferStage::GrantsUpdated, root.as_str()))?;
        if granted {
            info!(safe = %root, new_owner = %new_owner, "owner grant added for new owner");
        }

        let demoted_to = ctx.config.demoted_owner_level;
        let mut previous_owner = None;
        let mut dropped: Vec<PrincipalKey> = Vec::new();
        ctx.records
            .mutate(
                &record_path,
                Resource::Safe,
                root.as_str(),
                |record: &mut SafeRecord| {
                    previous_owner = None;
                    dropped.clear();
                    if record.owner == *new_owner {
                        return Ok(false);
                    }
                    require_current_owner(ctx, actor, record)?;
                    if record.grant(new_owner, &root).map(|g| g.level)
                        != Some(PermissionLevel::Owner)
                    {
                        return Err(Error::Conflict {
                            path: root.to_string(),
                            attempts: 1,
                        });
                    }
                    let old = record.owner.clone();
                    let stray: Vec<PrincipalKey> = record
                        .owner_grants()
                        .map(|g| g.principal.clone())
                        .filter(|p| *p != old && p != new_owner)
                        .collect();
                    for principal in &stray {
                        record.take_grant(principal, &root);
                    }
                    record.set_grant(&old, &root, demoted_to);
                    record.owner = new_owner.clone();
                    record.updated_at = Utc::now();
                    record.check_single_owner()?;
                    previous_owner = Some(old);
                    dropped = stray;
                    Ok(true)
                },
            )
            .await
            .map_err(|e| {
                warn!(safe = %root, new_owner = %new_owner, error = %e, "demotion of previous owner failed, safe has two owners");
                failed(TransferStage::OldOwnerDemoted, root.as_str())(e)
            })?;

        let Some(previous_owner) = previous_owner else {
            // Another caller finished the same transfer concurrently.
            return Err(failed(TransferStage::OldOwnerDemoted, root.as_str())(
                Error::Conflict {
                    path: root.to_string(),
                    attempts: 1,
                },
            ));
        };

        for principal in &dropped {
            warn!(safe = %root, principal = %principal, "dropped owner grant left by an abandoned transfer");
        }
        info!(safe = %root, previous_owner = %previous_owner, new_owner = %new_owner, %demoted_to, "ownership transferred");
        ctx.audit
            .committed(AuditEvent::new(
                actor,
                AuditAction::OwnershipTransferred,
                root.as_str(),
                json!({
                    "previous_owner": previous_owner,
                    "new_owner": new_owner,
                    "demoted_to": demoted_to,
                    "dropped_owner_grants": dropped,
                }),
            ))
            .await;

        Ok(TransferOutcome {
            safe: root,
            previous_owner,
            new_owner: new_owner.clone(),
            demoted_to,
            stage: TransferStage::Completed,
        })
    }

    async fn initiate(
        &self,
        actor: &Principal,
        path: &str,
        new_owner: &PrincipalKey,
    ) -> Result<SafePath, Error> {
        let path = SafePath::parse(path)?;
        let root = safe_root(&path)
            .filter(|root| *root == path)
            .ok_or_else(|| Error::invalid("path", format!("'{path}' is not a safe root")))?;
        let record = safe::load_record(&self.ctx, &root)
            .await?
            .ok_or_else(|| Error::not_found(Resource::Safe, &root))?
            .record;
        require_current_owner(&self.ctx, actor, &record)?;

        if new_owner.kind != PrincipalKind::User {
            return Err(Error::invalid(
                "new_owner",
                format!("'{new_owner}' is not a user"),
            ));
        }
        if record.owner == *new_owner {
            return Err(Error::invalid(
                "new_owner",
                format!("'{new_owner}' already owns '{root}'"),
            ));
        }
        if !self.ctx.directory.exists(new_owner).await? {
            return Err(Error::not_found(Resource::Principal, new_owner));
        }
        Ok(root)
    }
}
