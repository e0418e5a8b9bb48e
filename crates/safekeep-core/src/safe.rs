//! Safe registry.
//!
//! A safe is a top-level secret container at `<type>/<name>`, where the type
//! prefix is one of `apps`, `shared` or `users`. The registry owns the safe
//! record: metadata, the recorded owner, and every grant made on the safe
//! root or on folders below it.
//!
//! # Invariants
//!
//! - The recorded owner holds an `owner` grant on the safe root.
//! - `owner` grants only exist on the safe root.
//! - Outside an in-flight ownership transfer there is exactly one `owner`
//!   grant. [`add_grant`](SafeRegistry::add_grant) never creates one and
//!   [`remove_grant`](SafeRegistry::remove_grant) never removes the
//!   recorded owner's.
//!
//! Grant changes go through the conditional-write loop in
//! [`RecordStore::mutate`], so the invariants are re-checked against the
//! exact version being replaced.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEvent};
use crate::authz::{self, EffectiveGrants};
use crate::binding;
use crate::error::{Error, Resource, StoreError};
use crate::policy::{Action, PermissionLevel, SafePath};
use crate::principal::{Principal, PrincipalKey, PrincipalKind};
use crate::record::Versioned;
use crate::service::Context;

const RECORD_PREFIX: &str = "safes/";

/// The kind of a safe, which fixes its path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeType {
    /// Application safes under `apps/`.
    Application,
    /// Team safes under `shared/`.
    Shared,
    /// Personal safes under `users/`.
    Personal,
}

impl SafeType {
    pub const ALL: [SafeType; 3] = [Self::Application, Self::Shared, Self::Personal];

    /// The path prefix of safes of this type.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Application => "apps",
            Self::Shared => "shared",
            Self::Personal => "users",
        }
    }

    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.prefix() == prefix)
    }
}

impl fmt::Display for SafeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for SafeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "application" | "apps" => Ok(Self::Application),
            "shared" => Ok(Self::Shared),
            "personal" | "users" => Ok(Self::Personal),
            other => Err(Error::invalid(
                "safe type",
                format!("unknown safe type '{other}'"),
            )),
        }
    }
}

/// The safe root containing `path`: its first two segments, when the first
/// one is a known safe type prefix.
#[must_use]
pub fn safe_root(path: &SafePath) -> Option<SafePath> {
    let prefix = path.segments().next()?;
    SafeType::from_prefix(prefix)?;
    path.truncate(2)
}

/// One grant on a safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub principal: PrincipalKey,
    /// The safe root or a folder below it.
    pub path: SafePath,
    pub level: PermissionLevel,
}

/// The persisted state of a safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeRecord {
    pub path: SafePath,
    pub name: String,
    pub safe_type: SafeType,
    pub owner: PrincipalKey,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

impl SafeRecord {
    pub fn owner_grants(&self) -> impl Iterator<Item = &Grant> {
        self.grants
            .iter()
            .filter(|g| g.level == PermissionLevel::Owner)
    }

    #[must_use]
    pub fn grant(&self, principal: &PrincipalKey, path: &SafePath) -> Option<&Grant> {
        self.grants
            .iter()
            .find(|g| g.principal == *principal && g.path == *path)
    }

    /// Insert or overwrite a grant. Returns whether anything changed.
    pub(crate) fn set_grant(
        &mut self,
        principal: &PrincipalKey,
        path: &SafePath,
        level: PermissionLevel,
    ) -> bool {
        match self
            .grants
            .iter_mut()
            .find(|g| g.principal == *principal && g.path == *path)
        {
            Some(existing) if existing.level == level => false,
            Some(existing) => {
                existing.level = level;
                true
            }
            None => {
                self.grants.push(Grant {
                    principal: principal.clone(),
                    path: path.clone(),
                    level,
                });
                true
            }
        }
    }

    pub(crate) fn take_grant(&mut self, principal: &PrincipalKey, path: &SafePath) -> Option<Grant> {
        let index = self
            .grants
            .iter()
            .position(|g| g.principal == *principal && g.path == *path)?;
        Some(self.grants.remove(index))
    }

    fn is_owner_grant(&self, principal: &PrincipalKey, path: &SafePath) -> bool {
        *principal == self.owner && *path == self.path
    }

    pub(crate) fn check_invariants(&self) -> Result<(), Error> {
        let root = self.path.as_str();
        if self.grant(&self.owner, &self.path).map(|g| g.level) != Some(PermissionLevel::Owner) {
            return Err(Error::CannotRemoveOwner {
                path: root.to_owned(),
            });
        }
        if self.owner_grants().any(|g| g.path != self.path) {
            return Err(Error::invalid(
                "grant",
                format!("owner grants are only allowed on the safe root '{root}'"),
            ));
        }
        Ok(())
    }

    /// [`check_invariants`](Self::check_invariants) plus: the recorded
    /// owner's grant is the only `owner` grant. Holds whenever no transfer
    /// is in flight.
    pub(crate) fn check_single_owner(&self) -> Result<(), Error> {
        self.check_invariants()?;
        let count = self.owner_grants().count();
        if count != 1 {
            return Err(Error::invalid(
                "grant",
                format!("safe '{}' has {count} owner grants", self.path),
            ));
        }
        Ok(())
    }
}

/// Metadata supplied when creating a safe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafeMetadata {
    #[serde(default)]
    pub description: String,
}

/// Partial update of a safe's metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafePatch {
    #[serde(default)]
    pub description: Option<String>,
}

/// A node emitted by [`SafeRegistry::list_recursive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub path: SafePath,
    pub level: PermissionLevel,
}

/// A safe visible to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeSummary {
    pub path: SafePath,
    pub name: String,
    pub safe_type: SafeType,
    pub owner: PrincipalKey,
    pub description: String,
    /// The caller's level at the safe root, if any grant applies there.
    pub level: Option<PermissionLevel>,
}

/// Names of the visible safes by type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeNames {
    pub apps: Vec<String>,
    pub shared: Vec<String>,
    pub users: Vec<String>,
}

pub(crate) fn record_path(root: &SafePath) -> String {
    format!("{RECORD_PREFIX}{root}")
}

pub(crate) async fn load_record(
    ctx: &Context,
    root: &SafePath,
) -> Result<Option<Versioned<SafeRecord>>, Error> {
    ctx.records.load(&record_path(root)).await
}

/// Parse a path that must name a safe root.
fn parse_root(raw: &str) -> Result<SafePath, Error> {
    let path = SafePath::parse(raw)?;
    match safe_root(&path) {
        Some(root) if root == path => Ok(root),
        Some(_) => Err(Error::invalid(
            "path",
            format!("'{path}' is a folder, not a safe root"),
        )),
        None => Err(Error::invalid(
            "path",
            format!("'{path}' is not of the form <apps|shared|users>/<name>"),
        )),
    }
}

/// Parse a path that must lie inside a safe; returns `(path, root)`.
fn parse_within(raw: &str) -> Result<(SafePath, SafePath), Error> {
    let path = SafePath::parse(raw)?;
    let root = safe_root(&path).ok_or_else(|| {
        Error::invalid("path", format!("'{path}' is not inside a safe"))
    })?;
    Ok((path, root))
}

fn require_on_record(
    ctx: &Context,
    actor: &Principal,
    record: &SafeRecord,
    path: &SafePath,
    action: Action,
) -> Result<(), Error> {
    let grants = EffectiveGrants::for_record(ctx.config.is_admin(actor), actor, record, None);
    if grants.decide(path, action).is_allowed() {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            principal: actor.to_string(),
            target: path.to_string(),
            action,
        })
    }
}

/// Safe metadata and grant management.
#[derive(Clone)]
pub struct SafeRegistry {
    ctx: Arc<Context>,
}

impl fmt::Debug for SafeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeRegistry").finish_non_exhaustive()
    }
}

impl SafeRegistry {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Load a safe and check `action` against the caller's full effective
    /// grants, associations included.
    async fn load_authorized(
        &self,
        actor: &Principal,
        root: &SafePath,
        path: &SafePath,
        action: Action,
    ) -> Result<Versioned<SafeRecord>, Error> {
        let record = load_record(&self.ctx, root)
            .await?
            .ok_or_else(|| Error::not_found(Resource::Safe, root))?;
        let grants = authz::grants_for_record(&self.ctx, actor, &record.record).await?;
        if !grants.decide(path, action).is_allowed() {
            return Err(Error::PermissionDenied {
                principal: actor.to_string(),
                target: path.to_string(),
                action,
            });
        }
        Ok(record)
    }

    /// Create a safe owned by `owner`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a malformed path or unknown type prefix
    /// - [`Error::AlreadyExists`] if a safe already exists at the path
    /// - [`Error::UpstreamUnavailable`] if the secret store fails
    pub async fn create_safe(
        &self,
        owner: &Principal,
        path: &str,
        metadata: SafeMetadata,
    ) -> Result<SafeRecord, Error> {
        let root = parse_root(path)?;
        let safe_type = root
            .segments()
            .next()
            .and_then(SafeType::from_prefix)
            .ok_or_else(|| Error::invalid("path", format!("unknown safe type in '{root}'")))?;

        if load_record(&self.ctx, &root).await?.is_some() {
            return Err(Error::AlreadyExists {
                resource: Resource::Safe,
                id: root.to_string(),
            });
        }

        let now = Utc::now();
        let record = SafeRecord {
            name: root.name().to_owned(),
            path: root.clone(),
            safe_type,
            owner: owner.key().clone(),
            description: metadata.description,
            created_at: now,
            updated_at: now,
            grants: vec![Grant {
                principal: owner.key().clone(),
                path: root.clone(),
                level: PermissionLevel::Owner,
            }],
        };

        self.ctx.store.create_folder(root.as_str()).await?;
        self.ctx
            .records
            .create(&record_path(&root), &record, Resource::Safe, root.as_str())
            .await?;

        info!(safe = %root, owner = %owner, "safe created");
        self.ctx
            .audit
            .committed(AuditEvent::new(
                owner,
                AuditAction::SafeCreated,
                root.as_str(),
                json!({ "safe_type": safe_type }),
            ))
            .await;
        Ok(record)
    }

    /// Safe metadata and grants. Requires `read` on the safe root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn get_safe(&self, actor: &Principal, path: &str) -> Result<SafeRecord, Error> {
        let (_, root) = parse_within(path)?;
        Ok(self
            .load_authorized(actor, &root, &root, Action::Read)
            .await?
            .record)
    }

    /// Update safe metadata. Owner only; never changes the owner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`], [`Error::PermissionDenied`] or
    /// [`Error::Conflict`] after exhausting conditional write retries.
    pub async fn update_safe(
        &self,
        actor: &Principal,
        path: &str,
        patch: SafePatch,
    ) -> Result<SafeRecord, Error> {
        let root = parse_root(path)?;
        let ctx = &self.ctx;
        let (record, changed) = ctx
            .records
            .mutate(
                &record_path(&root),
                Resource::Safe,
                root.as_str(),
                |record: &mut SafeRecord| {
                    require_on_record(ctx, actor, record, &root, Action::Admin)?;
                    let mut changed = false;
                    if let Some(description) = &patch.description {
                        if record.description != *description {
                            record.description.clone_from(description);
                            changed = true;
                        }
                    }
                    if changed {
                        record.updated_at = Utc::now();
                    }
                    Ok(changed)
                },
            )
            .await?;

        if changed {
            info!(safe = %root, actor = %actor, "safe updated");
            ctx.audit
                .committed(AuditEvent::new(
                    actor,
                    AuditAction::SafeUpdated,
                    root.as_str(),
                    json!({ "description": record.description }),
                ))
                .await;
        }
        Ok(record)
    }

    /// Grant `level` on `path` (the safe root or a folder below it) to
    /// `principal`. Idempotent; a different existing level is overwritten.
    ///
    /// Returns whether the record changed.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] unless the actor owns the safe
    /// - [`Error::InvalidArgument`] for an `owner` grant; ownership moves
    ///   through [`OwnershipTransfer`](crate::transfer::OwnershipTransfer)
    /// - [`Error::CannotRemoveOwner`] when the grant would replace the
    ///   recorded owner's root grant
    /// - [`Error::Conflict`] after exhausting conditional write retries
    pub async fn add_grant(
        &self,
        actor: &Principal,
        path: &str,
        principal: &PrincipalKey,
        level: PermissionLevel,
    ) -> Result<bool, Error> {
        let (path, root) = parse_within(path)?;
        let ctx = &self.ctx;
        let (_, changed) = ctx
            .records
            .mutate(
                &record_path(&root),
                Resource::Safe,
                root.as_str(),
                |record: &mut SafeRecord| {
                    require_on_record(ctx, actor, record, &root, Action::Grant)?;
                    if record.grant(principal, &path).map(|g| g.level) == Some(level) {
                        return Ok(false);
                    }
                    if level == PermissionLevel::Owner {
                        return Err(Error::invalid(
                            "level",
                            format!(
                                "safe '{root}' already has an owner; use ownership transfer"
                            ),
                        ));
                    }
                    if record.is_owner_grant(principal, &path) {
                        return Err(Error::CannotRemoveOwner {
                            path: root.to_string(),
                        });
                    }
                    record.set_grant(principal, &path, level);
                    record.updated_at = Utc::now();
                    record.check_invariants()?;
                    Ok(true)
                },
            )
            .await?;

        if changed {
            info!(safe = %root, path = %path, principal = %principal, %level, "grant added");
            ctx.audit
                .committed(AuditEvent::new(
                    actor,
                    AuditAction::GrantAdded,
                    root.as_str(),
                    json!({ "principal": principal, "path": path, "level": level }),
                ))
                .await;
        } else {
            debug!(safe = %root, principal = %principal, "grant unchanged");
        }
        Ok(changed)
    }

    /// Remove the grant of `principal` on `path`. Removing a grant that does
    /// not exist is a no-op. Returns whether the record changed.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] unless the actor owns the safe
    /// - [`Error::CannotRemoveOwner`] for the recorded owner's root grant
    /// - [`Error::Conflict`] after exhausting conditional write retries
    pub async fn remove_grant(
        &self,
        actor: &Principal,
        path: &str,
        principal: &PrincipalKey,
    ) -> Result<bool, Error> {
        let (path, root) = parse_within(path)?;
        let ctx = &self.ctx;
        let (_, changed) = ctx
            .records
            .mutate(
                &record_path(&root),
                Resource::Safe,
                root.as_str(),
                |record: &mut SafeRecord| {
                    require_on_record(ctx, actor, record, &root, Action::Grant)?;
                    if record.is_owner_grant(principal, &path) {
                        return Err(Error::CannotRemoveOwner {
                            path: root.to_string(),
                        });
                    }
                    if record.take_grant(principal, &path).is_none() {
                        return Ok(false);
                    }
                    record.updated_at = Utc::now();
                    record.check_invariants()?;
                    Ok(true)
                },
            )
            .await?;

        if changed {
            info!(safe = %root, path = %path, principal = %principal, "grant removed");
            ctx.audit
                .committed(AuditEvent::new(
                    actor,
                    AuditAction::GrantRemoved,
                    root.as_str(),
                    json!({ "principal": principal, "path": path }),
                ))
                .await;
        }
        Ok(changed)
    }

    /// [`add_grant`](Self::add_grant) for a user.
    ///
    /// # Errors
    ///
    /// See [`add_grant`](Self::add_grant).
    pub async fn add_user(
        &self,
        actor: &Principal,
        path: &str,
        user: &str,
        level: PermissionLevel,
    ) -> Result<bool, Error> {
        let key = PrincipalKey::new(PrincipalKind::User, user)?;
        self.add_grant(actor, path, &key, level).await
    }

    /// # Errors
    ///
    /// See [`remove_grant`](Self::remove_grant).
    pub async fn remove_user(&self, actor: &Principal, path: &str, user: &str) -> Result<bool, Error> {
        let key = PrincipalKey::new(PrincipalKind::User, user)?;
        self.remove_grant(actor, path, &key).await
    }

    /// [`add_grant`](Self::add_grant) for a group.
    ///
    /// # Errors
    ///
    /// See [`add_grant`](Self::add_grant).
    pub async fn add_group(
        &self,
        actor: &Principal,
        path: &str,
        group: &str,
        level: PermissionLevel,
    ) -> Result<bool, Error> {
        let key = PrincipalKey::new(PrincipalKind::Group, group)?;
        self.add_grant(actor, path, &key, level).await
    }

    /// # Errors
    ///
    /// See [`remove_grant`](Self::remove_grant).
    pub async fn remove_group(
        &self,
        actor: &Principal,
        path: &str,
        group: &str,
    ) -> Result<bool, Error> {
        let key = PrincipalKey::new(PrincipalKind::Group, group)?;
        self.remove_grant(actor, path, &key).await
    }

    /// Depth-first listing of the folder tree below `path`.
    ///
    /// Children are visited in lexicographic order and a node is emitted
    /// when the actor may `list` it. The first `offset` visible nodes are
    /// skipped and traversal stops once `limit` nodes are collected, so
    /// consecutive pages of an unchanged tree are disjoint and ordered.
    /// Subtrees in which no grant can apply are not descended into.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a malformed path
    /// - [`Error::NotFound`] if no folder exists at `path`
    /// - [`Error::UpstreamUnavailable`] if the secret store fails
    pub async fn list_recursive(
        &self,
        actor: &Principal,
        path: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ListingEntry>, Error> {
        let start = SafePath::parse(path)?;
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }

        let children = self
            .ctx
            .store
            .list_children(start.as_str())
            .await
            .map_err(|e| Error::from_store_for(Resource::Folder, &start, e))?;

        let mut stack = Vec::new();
        push_children(&mut stack, &start, children)?;

        let mut cache: HashMap<SafePath, Option<EffectiveGrants>> = HashMap::new();
        let mut skipped = 0;

        while let Some(node) = stack.pop() {
            let Some(root) = safe_root(&node) else {
                // Above safe level (a type prefix); keep descending.
                let children = self.children_of(&node).await?;
                push_children(&mut stack, &node, children)?;
                continue;
            };

            if !cache.contains_key(&root) {
                let grants = match load_record(&self.ctx, &root).await? {
                    Some(record) => Some(
                        authz::grants_for_record(&self.ctx, actor, &record.record).await?,
                    ),
                    None => None,
                };
                cache.insert(root.clone(), grants);
            }
            let Some(Some(grants)) = cache.get(&root) else {
                continue;
            };

            if grants.decide(&node, Action::List).is_allowed() {
                if skipped < offset {
                    skipped += 1;
                } else {
                    let level = grants.level_at(&node).unwrap_or(PermissionLevel::Read);
                    out.push(ListingEntry {
                        path: node.clone(),
                        level,
                    });
                    if out.len() >= limit {
                        break;
                    }
                }
            }

            if grants.may_allow_within(&node) {
                let children = self.children_of(&node).await?;
                push_children(&mut stack, &node, children)?;
            }
        }
        Ok(out)
    }

    async fn children_of(&self, node: &SafePath) -> Result<Vec<String>, Error> {
        match self.ctx.store.list_children(node.as_str()).await {
            Ok(children) => Ok(children),
            Err(StoreError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every safe on which the actor holds a grant stronger than `deny`,
    /// optionally filtered by a case-insensitive substring of the path.
    /// Sorted by path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the secret store fails.
    pub async fn list_all_safes(
        &self,
        actor: &Principal,
        search: Option<&str>,
    ) -> Result<Vec<SafeSummary>, Error> {
        let needle = search
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty());
        let mut out = Vec::new();

        for key in self.ctx.records.list(RECORD_PREFIX).await? {
            if let Some(needle) = &needle {
                let path = key.strip_prefix(RECORD_PREFIX).unwrap_or(&key);
                if !path.contains(needle.as_str()) {
                    continue;
                }
            }
            let Some(Versioned { record, .. }) = self.ctx.records.load::<SafeRecord>(&key).await?
            else {
                continue;
            };
            let grants = authz::grants_for_record(&self.ctx, actor, &record).await?;
            if !grants.has_any_access() {
                continue;
            }
            out.push(SafeSummary {
                level: grants.level_at(&record.path),
                path: record.path,
                name: record.name,
                safe_type: record.safe_type,
                owner: record.owner,
                description: record.description,
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// One page of [`list_all_safes`](Self::list_all_safes): the first
    /// `offset` safes are skipped and at most `limit` are returned
    /// (all remaining when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the secret store fails.
    pub async fn list_safes_page(
        &self,
        actor: &Principal,
        search: Option<&str>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<SafeSummary>, Error> {
        let safes = self.list_all_safes(actor, search).await?;
        Ok(safes
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Names of the visible safes by type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the secret store fails.
    pub async fn list_safe_names(&self, actor: &Principal) -> Result<SafeNames, Error> {
        let mut names = SafeNames::default();
        for safe in self.list_all_safes(actor, None).await? {
            let bucket = match safe.safe_type {
                SafeType::Application => &mut names.apps,
                SafeType::Shared => &mut names.shared,
                SafeType::Personal => &mut names.users,
            };
            bucket.push(safe.name);
        }
        Ok(names)
    }

    /// Delete an empty safe. Association records pointing at the safe are
    /// purged afterwards on a best-effort basis.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] or [`Error::PermissionDenied`]
    /// - [`Error::NotEmpty`] if the safe still holds secrets or folders
    /// - [`Error::UpstreamUnavailable`] if the secret store fails
    pub async fn delete_safe(&self, actor: &Principal, path: &str) -> Result<(), Error> {
        let root = parse_root(path)?;
        let record = load_record(&self.ctx, &root)
            .await?
            .ok_or_else(|| Error::not_found(Resource::Safe, &root))?;
        require_on_record(&self.ctx, actor, &record.record, &root, Action::Delete)?;

        let secrets = match self.ctx.store.secret_count(root.as_str()).await {
            Ok(n) => n,
            Err(StoreError::NotFound { .. }) => 0,
            Err(e) => return Err(e.into()),
        };
        if secrets > 0 || !self.children_of(&root).await?.is_empty() {
            return Err(Error::NotEmpty {
                path: root.to_string(),
            });
        }

        self.ctx.records.delete(&record_path(&root)).await?;
        if let Err(e) = self.ctx.store.delete_folder(root.as_str()).await {
            warn!(safe = %root, error = %e, "safe record deleted but root folder removal failed");
        }
        let purged = binding::purge_safe(&self.ctx, &root).await;

        info!(safe = %root, actor = %actor, purged_associations = purged, "safe deleted");
        self.ctx
            .audit
            .committed(AuditEvent::new(
                actor,
                AuditAction::SafeDeleted,
                root.as_str(),
                json!({ "purged_associations": purged }),
            ))
            .await;
        Ok(())
    }

    /// Whether the actor holds owner privilege on the safe containing `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a malformed path and
    /// [`Error::UpstreamUnavailable`] if the secret store fails.
    pub async fn is_authorized(&self, actor: &Principal, path: &str) -> Result<bool, Error> {
        let path = SafePath::parse(path)?;
        let Some(root) = safe_root(&path) else {
            return Ok(false);
        };
        let Some(record) = load_record(&self.ctx, &root).await? else {
            return Ok(false);
        };
        let grants = authz::grants_for_record(&self.ctx, actor, &record.record).await?;
        Ok(grants.decide(&root, Action::Admin).is_allowed())
    }
}

/// Push children so that the lexicographically smallest is popped first.
fn push_children(
    stack: &mut Vec<SafePath>,
    parent: &SafePath,
    mut children: Vec<String>,
) -> Result<(), Error> {
    children.sort();
    for child in children.iter().rev() {
        stack.push(parent.join(child)?);
    }
    Ok(())
}
