//! Permission model for `SafeKeep`.
//!
//! Safes are governed by four permission levels: `deny`, `read`, `write` and
//! `owner`. Grants are attached to slash-delimited paths (a safe root or a
//! folder below it), and a request for a path is resolved against every grant
//! whose path is a segment-wise prefix of it:
//!
//! - the longest matching prefix wins, so an explicit grant on the exact path
//!   beats anything inherited from an ancestor;
//! - among grants at that same depth (e.g. a user grant and a group grant),
//!   `deny` beats everything, otherwise the strongest level wins.
//!
//! Everything in this module is pure: no I/O, no clocks, no shared state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// A permission level held by a principal on a path.
///
/// The derived ordering is `Deny < Read < Write < Owner`, but `Deny` is not
/// "weaker than read": it satisfies no action. Use
/// [`PermissionLevel::satisfies`] for access checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Explicitly denied.
    Deny,
    /// Read and list.
    Read,
    /// Read, list and write secrets.
    Write,
    /// Full control: grants, deletion, ownership transfer.
    Owner,
}

impl PermissionLevel {
    /// Whether holding `self` is enough for an action requiring `required`.
    #[must_use]
    pub fn satisfies(self, required: PermissionLevel) -> bool {
        self != Self::Deny && self >= required
    }

    /// Canonical lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Read => "read",
            Self::Write => "write",
            Self::Owner => "owner",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_permission(s)
    }
}

/// Parse a raw permission string.
///
/// Accepts `deny`, `read`, `write`, `owner` and the legacy alias `sudo`
/// (owner), case-insensitively and ignoring surrounding whitespace.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidPermission`] for anything else.
pub fn parse_permission(raw: &str) -> Result<PermissionLevel, PolicyError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "deny" => Ok(PermissionLevel::Deny),
        "read" => Ok(PermissionLevel::Read),
        "write" => Ok(PermissionLevel::Write),
        "owner" | "sudo" => Ok(PermissionLevel::Owner),
        _ => Err(PolicyError::InvalidPermission {
            raw: raw.to_owned(),
        }),
    }
}

/// An operation a principal asks to perform on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    List,
    Read,
    Write,
    AddSecret,
    Grant,
    Delete,
    TransferOwnership,
    Admin,
}

impl Action {
    /// The minimum permission level the action requires.
    #[must_use]
    pub fn required_level(self) -> PermissionLevel {
        match self {
            Self::List | Self::Read => PermissionLevel::Read,
            Self::Write | Self::AddSecret => PermissionLevel::Write,
            Self::Grant | Self::Delete | Self::TransferOwnership | Self::Admin => {
                PermissionLevel::Owner
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Read => "read",
            Self::Write => "write",
            Self::AddSecret => "add_secret",
            Self::Grant => "grant",
            Self::Delete => "delete",
            Self::TransferOwnership => "transfer_ownership",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized, slash-delimited path.
///
/// Normalization lower-cases the input and strips leading and trailing
/// slashes; `"/Shared/Team/"` and `"shared/team"` are the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SafePath(String);

impl SafePath {
    /// Parse and normalize a raw path.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPath`] if the path is empty, contains an
    /// empty, `.` or `..` segment, or uses characters outside `[a-z0-9._-]`.
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidPath {
            path: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let normalized = raw.trim().trim_matches('/').to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(invalid("path is empty"));
        }
        for segment in normalized.split('/') {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if segment == "." || segment == ".." {
                return Err(invalid("relative path segment"));
            }
            if let Some(c) = segment
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            {
                return Err(invalid(&format!("unsupported character '{c}'")));
            }
        }
        Ok(Self(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The last segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// The path made of the first `depth` segments, if there are that many.
    #[must_use]
    pub fn truncate(&self, depth: usize) -> Option<SafePath> {
        if depth == 0 || depth > self.depth() {
            return None;
        }
        let joined = self.segments().take(depth).collect::<Vec<_>>().join("/");
        Some(Self(joined))
    }

    /// Whether `self` equals `other` or is a segment-wise ancestor of it.
    ///
    /// `shared/team` is a prefix of `shared/team/prod` but not of
    /// `shared/teams`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &SafePath) -> bool {
        other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/'))
    }

    /// Append a single child segment.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPath`] if `child` is not a valid segment.
    pub fn join(&self, child: &str) -> Result<SafePath, PolicyError> {
        if child.contains('/') {
            return Err(PolicyError::InvalidPath {
                path: format!("{}/{child}", self.0),
                reason: "child name contains a separator".to_owned(),
            });
        }
        Self::parse(&format!("{}/{child}", self.0))
    }
}

impl fmt::Display for SafePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SafePath {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SafePath {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SafePath> for String {
    fn from(value: SafePath) -> Self {
        value.0
    }
}

/// Resolve the effective permission level for `path` from a set of grants.
///
/// Only grants whose path is a segment-wise prefix of `path` take part. The
/// deepest matching depth wins; at that depth `owner` is kept, `deny`
/// overrides the weaker levels, otherwise the strongest level is returned.
/// `None` means no grant matched.
///
/// ```
/// # use safekeep_core::policy::{most_specific_grant, PermissionLevel, SafePath};
/// let a = SafePath::parse("/a").unwrap();
/// let ab = SafePath::parse("/a/b").unwrap();
/// let grants = [(&a, PermissionLevel::Write), (&ab, PermissionLevel::Deny)];
/// let target = SafePath::parse("/a/b/c").unwrap();
/// assert_eq!(most_specific_grant(grants, &target), Some(PermissionLevel::Deny));
/// ```
pub fn most_specific_grant<'a, I>(grants: I, path: &SafePath) -> Option<PermissionLevel>
where
    I: IntoIterator<Item = (&'a SafePath, PermissionLevel)>,
{
    let mut best: Option<(usize, PermissionLevel)> = None;
    for (grant_path, level) in grants {
        if !grant_path.is_prefix_of(path) {
            continue;
        }
        let depth = grant_path.depth();
        best = match best {
            Some((current_depth, _)) if depth < current_depth => best,
            Some((current_depth, current)) if depth == current_depth => {
                Some((depth, combine_same_depth(current, level)))
            }
            _ => Some((depth, level)),
        };
    }
    best.map(|(_, level)| level)
}

fn combine_same_depth(a: PermissionLevel, b: PermissionLevel) -> PermissionLevel {
    if a == PermissionLevel::Owner || b == PermissionLevel::Owner {
        PermissionLevel::Owner
    } else if a == PermissionLevel::Deny || b == PermissionLevel::Deny {
        PermissionLevel::Deny
    } else {
        a.max(b)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn p(raw: &str) -> SafePath {
        SafePath::parse(raw).unwrap()
    }

    fn resolve(grants: &[(&str, PermissionLevel)], target: &str) -> Option<PermissionLevel> {
        let owned: Vec<(SafePath, PermissionLevel)> =
            grants.iter().map(|(path, l)| (p(path), *l)).collect();
        most_specific_grant(owned.iter().map(|(path, l)| (path, *l)), &p(target))
    }

    #[test]
    fn parse_permission_accepts_known_levels() {
        assert_eq!(parse_permission("read").unwrap(), PermissionLevel::Read);
        assert_eq!(parse_permission(" WRITE ").unwrap(), PermissionLevel::Write);
        assert_eq!(parse_permission("Deny").unwrap(), PermissionLevel::Deny);
        assert_eq!(parse_permission("owner").unwrap(), PermissionLevel::Owner);
        assert_eq!(parse_permission("sudo").unwrap(), PermissionLevel::Owner);
    }

    #[test]
    fn parse_permission_rejects_unknown() {
        let err = parse_permission("admin").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPermission { raw } if raw == "admin"));
        assert!(parse_permission("").is_err());
    }

    #[test]
    fn deny_satisfies_nothing() {
        for required in [PermissionLevel::Read, PermissionLevel::Write, PermissionLevel::Owner] {
            assert!(!PermissionLevel::Deny.satisfies(required));
        }
        assert!(PermissionLevel::Owner.satisfies(PermissionLevel::Read));
        assert!(!PermissionLevel::Read.satisfies(PermissionLevel::Write));
    }

    #[test]
    fn actions_map_to_minimum_levels() {
        assert_eq!(Action::List.required_level(), PermissionLevel::Read);
        assert_eq!(Action::Read.required_level(), PermissionLevel::Read);
        assert_eq!(Action::AddSecret.required_level(), PermissionLevel::Write);
        assert_eq!(Action::Grant.required_level(), PermissionLevel::Owner);
        assert_eq!(Action::Delete.required_level(), PermissionLevel::Owner);
        assert_eq!(Action::TransferOwnership.required_level(), PermissionLevel::Owner);
    }

    #[test]
    fn path_normalization() {
        assert_eq!(p("/Shared/Team/").as_str(), "shared/team");
        assert_eq!(p("apps/billing").depth(), 2);
        assert_eq!(p("apps/billing/prod").name(), "prod");
        assert!(SafePath::parse("").is_err());
        assert!(SafePath::parse("///").is_err());
        assert!(SafePath::parse("a//b").is_err());
        assert!(SafePath::parse("a/../b").is_err());
        assert!(SafePath::parse("a/b c").is_err());
    }

    #[test]
    fn prefix_is_segment_wise() {
        assert!(p("shared/team").is_prefix_of(&p("shared/team")));
        assert!(p("shared/team").is_prefix_of(&p("shared/team/prod")));
        assert!(!p("shared/team").is_prefix_of(&p("shared/teams")));
        assert!(!p("shared/team/prod").is_prefix_of(&p("shared/team")));
    }

    #[test]
    fn truncate_and_join() {
        let path = p("shared/team/prod/db");
        assert_eq!(path.truncate(2).unwrap(), p("shared/team"));
        assert!(path.truncate(5).is_none());
        assert_eq!(p("shared/team").join("prod").unwrap(), p("shared/team/prod"));
        assert!(p("shared/team").join("a/b").is_err());
    }

    #[test]
    fn deeper_deny_overrides_shallower_write() {
        let level = resolve(
            &[("/a", PermissionLevel::Write), ("/a/b", PermissionLevel::Deny)],
            "/a/b/c",
        );
        assert_eq!(level, Some(PermissionLevel::Deny));
    }

    #[test]
    fn deeper_grant_overrides_shallower_deny() {
        let level = resolve(
            &[("a", PermissionLevel::Deny), ("a/b", PermissionLevel::Read)],
            "a/b/c",
        );
        assert_eq!(level, Some(PermissionLevel::Read));
    }

    #[test]
    fn deny_wins_over_weaker_grants_at_equal_depth() {
        let level = resolve(
            &[("a/b", PermissionLevel::Write), ("a/b", PermissionLevel::Deny)],
            "a/b",
        );
        assert_eq!(level, Some(PermissionLevel::Deny));
    }

    #[test]
    fn owner_is_not_overridden_by_deny_at_equal_depth() {
        let level = resolve(
            &[("a/b", PermissionLevel::Deny), ("a/b", PermissionLevel::Owner)],
            "a/b/c",
        );
        assert_eq!(level, Some(PermissionLevel::Owner));
    }

    #[test]
    fn strongest_wins_at_equal_depth_without_deny() {
        let level = resolve(
            &[("a/b", PermissionLevel::Read), ("a/b", PermissionLevel::Write)],
            "a/b/c",
        );
        assert_eq!(level, Some(PermissionLevel::Write));
    }

    #[test]
    fn exact_path_beats_inherited() {
        let level = resolve(
            &[("a", PermissionLevel::Owner), ("a/b", PermissionLevel::Read)],
            "a/b",
        );
        assert_eq!(level, Some(PermissionLevel::Read));
    }

    #[test]
    fn non_matching_grants_are_ignored() {
        assert_eq!(resolve(&[("a/bc", PermissionLevel::Write)], "a/b"), None);
        assert_eq!(resolve(&[], "a/b"), None);
    }

    #[test]
    fn resolution_is_case_and_slash_insensitive() {
        let level = resolve(&[("/A/B/", PermissionLevel::Write)], "a/b/C");
        assert_eq!(level, Some(PermissionLevel::Write));
    }
}
