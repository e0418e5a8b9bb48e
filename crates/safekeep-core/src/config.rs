//! Engine configuration for `SafeKeep`.
//!
//! The configuration is an explicit value handed to each component at
//! construction; nothing reads process-wide state after startup. Defaults are
//! suitable for tests; [`EngineConfig::from_env`] overrides them from
//! `SAFEKEEP_*` environment variables.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::warn;

use crate::policy::{PermissionLevel, parse_permission};
use crate::principal::{Principal, PrincipalKey, PrincipalKind};

const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_UPSTREAM_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Core engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Principals with global administrator rights (users or groups).
    pub admins: BTreeSet<PrincipalKey>,
    /// Level the previous owner keeps after an ownership transfer.
    pub demoted_owner_level: PermissionLevel,
    /// Extra attempts for a conditional write that lost a version race.
    pub max_conflict_retries: u32,
    /// Timeout applied to every secret store call.
    pub upstream_timeout: Duration,
    /// Extra attempts for a store call that timed out or was unavailable.
    pub upstream_max_retries: u32,
    /// Base delay of the exponential backoff between store retries.
    pub retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admins: BTreeSet::new(),
            demoted_owner_level: PermissionLevel::Write,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            upstream_max_retries: DEFAULT_UPSTREAM_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SAFEKEEP_ADMINS`: comma-separated `kind:id` list (e.g. `user:root,group:vault-admins`)
    /// - `SAFEKEEP_DEMOTED_OWNER_LEVEL`: `read` or `write` (default: `write`)
    /// - `SAFEKEEP_CONFLICT_RETRIES`: conditional write retries (default: `3`)
    /// - `SAFEKEEP_UPSTREAM_TIMEOUT_MS`: store call timeout (default: `10000`)
    /// - `SAFEKEEP_UPSTREAM_RETRIES`: store call retries (default: `3`)
    /// - `SAFEKEEP_RETRY_BASE_MS`: backoff base delay (default: `100`)
    ///
    /// Malformed values are logged and replaced by the default.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let admins = std::env::var("SAFEKEEP_ADMINS")
            .map(|raw| parse_admins(&raw))
            .unwrap_or_default();

        let demoted_owner_level = std::env::var("SAFEKEEP_DEMOTED_OWNER_LEVEL")
            .ok()
            .and_then(|raw| match parse_permission(&raw) {
                Ok(level @ (PermissionLevel::Read | PermissionLevel::Write)) => Some(level),
                _ => {
                    warn!(value = %raw, "ignoring SAFEKEEP_DEMOTED_OWNER_LEVEL, expected read or write");
                    None
                }
            })
            .unwrap_or(defaults.demoted_owner_level);

        let max_conflict_retries =
            env_number("SAFEKEEP_CONFLICT_RETRIES").unwrap_or(defaults.max_conflict_retries);

        let upstream_timeout = env_number("SAFEKEEP_UPSTREAM_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.upstream_timeout);

        let upstream_max_retries =
            env_number("SAFEKEEP_UPSTREAM_RETRIES").unwrap_or(defaults.upstream_max_retries);

        let retry_base_delay = env_number("SAFEKEEP_RETRY_BASE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_base_delay);

        Self {
            admins,
            demoted_owner_level,
            max_conflict_retries,
            upstream_timeout,
            upstream_max_retries,
            retry_base_delay,
        }
    }

    /// Add an administrator.
    #[must_use]
    pub fn with_admin(mut self, admin: PrincipalKey) -> Self {
        self.admins.insert(admin);
        self
    }

    /// Whether `principal` is a global administrator, directly or through
    /// one of its groups.
    #[must_use]
    pub fn is_admin(&self, principal: &Principal) -> bool {
        self.admins.iter().any(|admin| principal.matches(admin))
    }
}

fn parse_admins(raw: &str) -> BTreeSet<PrincipalKey> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| match entry.parse::<PrincipalKey>() {
            Ok(key) if matches!(key.kind, PrincipalKind::User | PrincipalKind::Group) => Some(key),
            _ => {
                warn!(entry = %entry, "ignoring malformed SAFEKEEP_ADMINS entry");
                None
            }
        })
        .collect()
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        warn!(variable = name, value = %raw, "ignoring non-numeric value");
    }
    parsed
}
