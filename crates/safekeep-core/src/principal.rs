//! Principals: the resolved identities every core operation acts on behalf of.
//!
//! Authentication happens upstream; the core receives a [`Principal`] that is
//! trusted and immutable for the duration of a request. Grants and ownership
//! records refer to principals by value through [`PrincipalKey`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Error;

/// The kind of identity a principal represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// A human user.
    User,
    /// An LDAP group.
    Group,
    /// An AWS EC2 or IAM role.
    AwsRole,
    /// An AppRole machine identity.
    AppRole,
}

impl PrincipalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::AwsRole => "aws_role",
            Self::AppRole => "app_role",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            "aws_role" | "aws" | "awsrole" => Ok(Self::AwsRole),
            "app_role" | "approle" => Ok(Self::AppRole),
            other => Err(Error::invalid(
                "principal kind",
                format!("unknown principal kind '{other}'"),
            )),
        }
    }
}

/// The identity part of a principal, as stored in grants and ownership
/// records. Identifiers are lower-cased.
///
/// Displays and parses as `kind:id`, e.g. `user:alice` or `group:vault-admins`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrincipalKey {
    pub kind: PrincipalKind,
    pub id: String,
}

impl PrincipalKey {
    /// Build a key, normalizing the identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the identifier is empty or
    /// contains whitespace or `:`.
    pub fn new(kind: PrincipalKind, id: &str) -> Result<Self, Error> {
        let id = id.trim().to_ascii_lowercase();
        if id.is_empty() {
            return Err(Error::invalid("principal", "identifier is empty"));
        }
        if id.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(Error::invalid(
                "principal",
                format!("identifier '{id}' contains whitespace or ':'"),
            ));
        }
        Ok(Self { kind, id })
    }
}

impl fmt::Display for PrincipalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for PrincipalKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or_else(|| {
            Error::invalid("principal", format!("expected 'kind:id', got '{s}'"))
        })?;
        Self::new(kind.parse()?, id)
    }
}

/// A resolved caller identity.
///
/// For users, `groups` holds the LDAP group memberships resolved upstream;
/// grants made to any of those groups apply to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    key: PrincipalKey,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    groups: BTreeSet<String>,
}

impl Principal {
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a malformed identifier.
    pub fn new(kind: PrincipalKind, id: &str) -> Result<Self, Error> {
        Ok(Self {
            key: PrincipalKey::new(kind, id)?,
            groups: BTreeSet::new(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a malformed identifier.
    pub fn user(id: &str) -> Result<Self, Error> {
        Self::new(PrincipalKind::User, id)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a malformed identifier.
    pub fn app_role(name: &str) -> Result<Self, Error> {
        Self::new(PrincipalKind::AppRole, name)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a malformed identifier.
    pub fn aws_role(name: &str) -> Result<Self, Error> {
        Self::new(PrincipalKind::AwsRole, name)
    }

    /// Attach group memberships (users only; ignored for other kinds).
    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.key.kind == PrincipalKind::User {
            self.groups = groups
                .into_iter()
                .map(|g| g.as_ref().trim().to_ascii_lowercase())
                .filter(|g| !g.is_empty())
                .collect();
        }
        self
    }

    #[must_use]
    pub fn key(&self) -> &PrincipalKey {
        &self.key
    }

    #[must_use]
    pub fn kind(&self) -> PrincipalKind {
        self.key.kind
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    /// Whether a grant made to `grantee` applies to this principal: the same
    /// identity, or a group the user belongs to.
    #[must_use]
    pub fn matches(&self, grantee: &PrincipalKey) -> bool {
        if *grantee == self.key {
            return true;
        }
        self.key.kind == PrincipalKind::User
            && grantee.kind == PrincipalKind::Group
            && self.groups.contains(&grantee.id)
    }
}

impl From<PrincipalKey> for Principal {
    fn from(key: PrincipalKey) -> Self {
        Self {
            key,
            groups: BTreeSet::new(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}

/// Looks up whether a principal exists in the identity source (LDAP,
/// OIDC directory, ...). Used to validate ownership transfer targets.
#[async_trait::async_trait]
pub trait PrincipalDirectory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the directory cannot be
    /// queried.
    async fn exists(&self, key: &PrincipalKey) -> Result<bool, Error>;
}

/// A directory that accepts every well-formed principal.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenDirectory;

#[async_trait::async_trait]
impl PrincipalDirectory for OpenDirectory {
    async fn exists(&self, _key: &PrincipalKey) -> Result<bool, Error> {
        Ok(true)
    }
}

/// A directory backed by an explicit set of known principals.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    known: RwLock<BTreeSet<PrincipalKey>>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, key: PrincipalKey) {
        self.known.write().await.insert(key);
    }
}

#[async_trait::async_trait]
impl PrincipalDirectory for StaticDirectory {
    async fn exists(&self, key: &PrincipalKey) -> Result<bool, Error> {
        Ok(self.known.read().await.contains(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let key: PrincipalKey = "Group:Vault-Admins".parse().unwrap();
        assert_eq!(key.kind, PrincipalKind::Group);
        assert_eq!(key.id, "vault-admins");
        assert_eq!(key.to_string(), "group:vault-admins");
        assert_eq!(key.to_string().parse::<PrincipalKey>().unwrap(), key);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!("alice".parse::<PrincipalKey>().is_err());
        assert!("robot:alice".parse::<PrincipalKey>().is_err());
        assert!("user:".parse::<PrincipalKey>().is_err());
        assert!("user:al ice".parse::<PrincipalKey>().is_err());
    }

    #[test]
    fn user_matches_own_key_and_groups() {
        let alice = Principal::user("alice").unwrap().with_groups(["Devs", "ops"]);
        assert!(alice.matches(&"user:alice".parse().unwrap()));
        assert!(alice.matches(&"group:devs".parse().unwrap()));
        assert!(!alice.matches(&"group:finance".parse().unwrap()));
        assert!(!alice.matches(&"user:bob".parse().unwrap()));
    }

    #[test]
    fn groups_only_apply_to_users() {
        let role = Principal::app_role("ci").unwrap().with_groups(["devs"]);
        assert_eq!(role.groups().count(), 0);
        assert!(!role.matches(&"group:devs".parse().unwrap()));
    }

    #[tokio::test]
    async fn static_directory_knows_registered_principals() {
        let dir = StaticDirectory::new();
        let bob: PrincipalKey = "user:bob".parse().unwrap();
        assert!(!dir.exists(&bob).await.unwrap());
        dir.register(bob.clone()).await;
        assert!(dir.exists(&bob).await.unwrap());
    }
}
