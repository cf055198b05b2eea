//! Workspace layout discovery and initialization.
//!
//! A Stoneforge workspace is a directory containing `.stoneforge/`:
//!
//! ```text
//! .stoneforge/
//!   config.yaml        # user-editable config
//!   stoneforge.db      # element store
//!   .gitignore         # ignores *.db*
//!   sync/              # elements.jsonl, dependencies.jsonl, conflicts.jsonl
//!   playbooks/
//!   .worktrees/        # per-session git worktrees
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::StoneforgeConfig;

/// Name of the workspace marker directory.
pub const STONEFORGE_DIR: &str = ".stoneforge";

const GITIGNORE_CONTENT: &str = "# Stoneforge local state\n*.db*\n.worktrees/\n";

const DEFAULT_CONFIG: &str = "\
# Stoneforge workspace configuration
# actor: el-000000          # element id mutations are attributed to
database: stoneforge.db
sync:
  auto_export: true
  elements_file: elements.jsonl
  dependencies_file: dependencies.jsonl
identity:
  mode: simple
playbooks:
  paths: []
plugins:
  packages: []
";

/// A located workspace: the root directory plus its parsed configuration.
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
    config: StoneforgeConfig,
}

impl Workspace {
    /// Walk up from `start` looking for `.stoneforge/`.
    ///
    /// # Errors
    /// Fails if no workspace is found or the config cannot be parsed.
    pub fn discover(start: &Path) -> Result<Self> {
        let mut cursor = Some(start);
        while let Some(dir) = cursor {
            if dir.join(STONEFORGE_DIR).is_dir() {
                return Self::open(dir);
            }
            cursor = dir.parent();
        }
        bail!(
            "No Stoneforge workspace found from '{}'.\n  \
             Initialize one: sf init",
            start.display()
        );
    }

    /// Open the workspace rooted at `root` (which must contain
    /// `.stoneforge/`).
    ///
    /// # Errors
    /// Fails if the marker directory is missing or the config is invalid.
    pub fn open(root: &Path) -> Result<Self> {
        let marker = root.join(STONEFORGE_DIR);
        if !marker.is_dir() {
            bail!("'{}' is not a Stoneforge workspace", root.display());
        }
        let config = StoneforgeConfig::load(&marker.join("config.yaml"))
            .context("loading workspace config")?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    /// Create the `.stoneforge/` layout under `root`. Idempotent: existing
    /// files are left untouched.
    ///
    /// # Errors
    /// I/O failures creating directories or seed files.
    pub fn init(root: &Path) -> Result<Self> {
        let marker = root.join(STONEFORGE_DIR);
        for dir in ["sync", "playbooks", ".worktrees"] {
            std::fs::create_dir_all(marker.join(dir))
                .with_context(|| format!("creating {STONEFORGE_DIR}/{dir}"))?;
        }

        let config_path = marker.join("config.yaml");
        if !config_path.exists() {
            std::fs::write(&config_path, DEFAULT_CONFIG).context("writing config.yaml")?;
        }
        let gitignore_path = marker.join(".gitignore");
        if !gitignore_path.exists() {
            std::fs::write(&gitignore_path, GITIGNORE_CONTENT).context("writing .gitignore")?;
        }

        tracing::info!(root = %root.display(), "initialized workspace");
        Self::open(root)
    }

    /// The workspace root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The parsed configuration.
    #[must_use]
    pub const fn config(&self) -> &StoneforgeConfig {
        &self.config
    }

    /// The `.stoneforge/` directory.
    #[must_use]
    pub fn stoneforge_dir(&self) -> PathBuf {
        self.root.join(STONEFORGE_DIR)
    }

    /// Path to the element store database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.stoneforge_dir().join(&self.config.database)
    }

    /// The `sync/` directory.
    #[must_use]
    pub fn sync_dir(&self) -> PathBuf {
        self.stoneforge_dir().join("sync")
    }

    /// The `.worktrees/` directory.
    #[must_use]
    pub fn worktrees_dir(&self) -> PathBuf {
        self.stoneforge_dir().join(".worktrees")
    }

    /// Sync file locations derived from the config.
    #[must_use]
    pub fn sync_paths(&self) -> stoneforge_core::sync::SyncPaths {
        let dir = self.sync_dir();
        stoneforge_core::sync::SyncPaths {
            elements: dir.join(&self.config.sync.elements_file),
            dependencies: dir.join(&self.config.sync.dependencies_file),
            conflicts: dir.join("conflicts.jsonl"),
        }
    }

    /// The configured actor id, or an error telling the user to set one.
    ///
    /// # Errors
    /// Fails when `actor` is unset — mutations need attribution.
    pub fn actor(&self) -> Result<&str> {
        self.config.actor.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No actor configured.\n  \
                 Set 'actor: el-…' in {STONEFORGE_DIR}/config.yaml"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_discover_from_nested_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        Workspace::init(dir.path()).expect("init");

        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).expect("mkdir");
        let ws = Workspace::discover(&nested).expect("discover");
        assert_eq!(ws.root(), dir.path());
        assert!(ws.db_path().ends_with(".stoneforge/stoneforge.db"));
        assert!(ws.sync_paths().elements.ends_with("sync/elements.jsonl"));
    }

    #[test]
    fn init_is_idempotent_and_preserves_edits() {
        let dir = tempfile::tempdir().expect("tempdir");
        Workspace::init(dir.path()).expect("init");

        let config_path = dir.path().join(STONEFORGE_DIR).join("config.yaml");
        std::fs::write(&config_path, "actor: el-abc123\n").expect("edit config");

        let ws = Workspace::init(dir.path()).expect("re-init");
        assert_eq!(ws.actor().expect("actor"), "el-abc123");
    }

    #[test]
    fn discover_outside_any_workspace_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Workspace::discover(dir.path()).is_err());
    }
}
