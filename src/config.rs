//! Workspace configuration (`.stoneforge/config.yaml`).
//!
//! Typed configuration for the orchestration core. Missing fields use
//! sensible defaults; a missing file is all defaults (no error). Unknown
//! keys are rejected so typos surface instead of silently doing nothing.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use stoneforge_core::model::Pool;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level Stoneforge workspace configuration.
///
/// Parsed from `.stoneforge/config.yaml`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StoneforgeConfig {
    /// Element id of the local actor (used as `createdBy` on mutations).
    #[serde(default)]
    pub actor: Option<String>,

    /// Database file name, relative to `.stoneforge/`.
    #[serde(default = "default_database")]
    pub database: String,

    /// Sync layer settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Identity settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Playbook discovery.
    #[serde(default)]
    pub playbooks: PlaybooksConfig,

    /// Plugin packages.
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Session spawning.
    #[serde(default)]
    pub session: SessionConfig,

    /// Concurrency pools governing admission.
    #[serde(default)]
    pub pools: Vec<Pool>,
}

impl StoneforgeConfig {
    /// Load configuration from `path`. A missing file yields all defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    database: default_database(),
                    ..Self::default()
                });
            }
            Err(e) => {
                return Err(ConfigError {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                });
            }
        };
        let mut config: Self = serde_yaml::from_str(&raw).map_err(|e| ConfigError {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        if config.database.is_empty() {
            config.database = default_database();
        }
        for pool in &config.pools {
            pool.validate().map_err(|e| ConfigError {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        }
        Ok(config)
    }
}

fn default_database() -> String {
    "stoneforge.db".to_owned()
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// Sync layer settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Export automatically after mutating CLI commands.
    #[serde(default = "default_auto_export")]
    pub auto_export: bool,

    /// Elements file, relative to `.stoneforge/sync/`.
    #[serde(default = "default_elements_file")]
    pub elements_file: String,

    /// Dependencies file, relative to `.stoneforge/sync/`.
    #[serde(default = "default_dependencies_file")]
    pub dependencies_file: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_export: default_auto_export(),
            elements_file: default_elements_file(),
            dependencies_file: default_dependencies_file(),
        }
    }
}

const fn default_auto_export() -> bool {
    true
}

fn default_elements_file() -> String {
    "elements.jsonl".to_owned()
}

fn default_dependencies_file() -> String {
    "dependencies.jsonl".to_owned()
}

// ---------------------------------------------------------------------------
// IdentityConfig
// ---------------------------------------------------------------------------

/// How actors are resolved.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Resolution mode.
    #[serde(default)]
    pub mode: IdentityMode,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            mode: IdentityMode::default(),
        }
    }
}

/// Actor resolution modes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityMode {
    /// Trust the configured `actor` id.
    #[default]
    Simple,
    /// Require signed mutations (enforced by an outer layer).
    Signed,
}

// ---------------------------------------------------------------------------
// PlaybooksConfig / PluginsConfig
// ---------------------------------------------------------------------------

/// Playbook discovery paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaybooksConfig {
    /// Directories scanned for playbooks, relative to the workspace root.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Plugin packages loaded by the outer shell.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginsConfig {
    /// Package names.
    #[serde(default)]
    pub packages: Vec<String>,
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Session spawning settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Executable fallback chain, most preferred first.
    #[serde(default = "default_executable_chain")]
    pub executable_chain: Vec<String>,

    /// Extra arguments appended to every spawn.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable_chain: default_executable_chain(),
            extra_args: Vec::new(),
        }
    }
}

fn default_executable_chain() -> Vec<String> {
    vec!["claude".to_owned()]
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A configuration file could not be loaded or parsed.
#[derive(Debug)]
pub struct ConfigError {
    /// Path to the configuration file.
    pub path: std::path::PathBuf,
    /// Human-readable description of the problem.
    pub detail: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config '{}': {}", self.path.display(), self.detail)
    }
}

impl std::error::Error for ConfigError {}
