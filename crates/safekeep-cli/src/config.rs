//! CLI configuration loaded from environment variables.

use safekeep_core::config::EngineConfig;

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory; state is gone when the process exits.
    Memory,
    /// Redb database file.
    Redb { path: String },
}

impl StorageBackendType {
    /// Parse the `SAFEKEEP_STORAGE` value. Unknown values fall back to memory.
    fn parse(kind: &str, path: String) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "redb" => Self::Redb { path },
            _ => Self::Memory,
        }
    }
}

/// Configuration of the `safekeep` binary.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub storage_backend: StorageBackendType,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub audit_file_path: Option<String>,
    pub engine: EngineConfig,
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SAFEKEEP_STORAGE`: `memory` or `redb` (default: `memory`)
    /// - `SAFEKEEP_STORAGE_PATH`: redb file (default: `./safekeep.redb`)
    /// - `SAFEKEEP_LOG_LEVEL`: log filter (default: `warn`)
    /// - `SAFEKEEP_AUDIT_FILE`: JSON lines audit log (optional)
    ///
    /// plus every variable read by [`EngineConfig::from_env`].
    #[must_use]
    pub fn from_env() -> Self {
        let storage_path =
            std::env::var("SAFEKEEP_STORAGE_PATH").unwrap_or_else(|_| "./safekeep.redb".to_owned());
        let storage_backend = StorageBackendType::parse(
            &std::env::var("SAFEKEEP_STORAGE").unwrap_or_else(|_| "memory".to_owned()),
            storage_path,
        );

        let log_level = std::env::var("SAFEKEEP_LOG_LEVEL").unwrap_or_else(|_| "warn".to_owned());
        let audit_file_path = std::env::var("SAFEKEEP_AUDIT_FILE")
            .ok()
            .filter(|p| !p.trim().is_empty());

        Self {
            storage_backend,
            log_level,
            audit_file_path,
            engine: EngineConfig::from_env(),
        }
    }
}
