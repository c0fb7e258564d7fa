//! Configuration for the tidemark CLI.
//!
//! Values are layered with [`figment`]: built-in defaults, then a TOML file,
//! then `TIDEMARK_*` environment variables (nested keys separated by `__`,
//! e.g. `TIDEMARK_SCAN__BACKGROUND_LIMIT=50`).
//!
//! ```toml
//! database = "/var/lib/tidemark/cache.sqlite"
//!
//! [scan]
//! background_limit = 100
//!
//! [mounts.data]
//! mount_point = "/data"
//! root = "/srv/data"
//! read_only = false
//! home = "alice"
//! ```

pub mod error;

use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

const ENV_PREFIX: &str = "TIDEMARK_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Location of the SQLite cache.
    pub database: PathBuf,
    #[serde(default)]
    pub scan: ScanConfig,
    /// Storages to mount, keyed by a name only used in messages.
    #[serde(default)]
    pub mounts: BTreeMap<String, MountConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Maximum number of incomplete directories a background scan completes
    /// per storage. Unlimited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_limit: Option<usize>,
}

/// A local directory attached to the logical tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub mount_point: PathBuf,
    pub root: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    /// Marks the storage as the home of this user; scans of it are refused
    /// unless its root is writable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let database = project_dirs()
            .map(|dirs| dirs.data_dir().join("cache.sqlite"))
            .unwrap_or_else(|| PathBuf::from("tidemark.sqlite"));
        Self { database, scan: ScanConfig::default(), mounts: BTreeMap::new() }
    }
}

impl Config {
    /// The configuration file used when none is given explicitly.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Every configuration source, in order of precedence (lowest first).
    ///
    /// An explicit file must exist; the default file is optional.
    pub fn figment(file: Option<&Path>) -> Figment {
        let figment = Figment::from(Serialized::defaults(Config::default()));
        let figment = match file {
            Some(file) => figment.merge(Toml::file_exact(file)),
            None => match Self::default_path() {
                Some(default) => figment.merge(Toml::file_exact(default)),
                None => figment,
            },
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate the configuration.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        if let Some(file) = file
            && !file.is_file()
        {
            exn::bail!(ErrorKind::invalid(file.display().to_string(), "file does not exist"));
        }
        let config: Config = Self::figment(file).extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(database = %config.database.display(), mounts = config.mounts.len(), "Configuration loaded");
        Ok(config)
    }

    /// Check the mount setup: mount points absolute and unique, roots
    /// absolute, homes writable and one per owner.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashMap<&Path, &str> = HashMap::new();
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for (name, mount) in &self.mounts {
            if !mount.mount_point.is_absolute() {
                exn::bail!(ErrorKind::invalid(format!("mounts.{name}.mount_point"), "must be an absolute path"));
            }
            if mount.mount_point.components().any(|component| component == Component::ParentDir) {
                exn::bail!(ErrorKind::invalid(format!("mounts.{name}.mount_point"), "must not contain `..`"));
            }
            if !mount.root.is_absolute() {
                exn::bail!(ErrorKind::invalid(format!("mounts.{name}.root"), "must be an absolute path"));
            }
            // A home that can never be written to would never be scanned.
            if mount.home.is_some() && mount.read_only {
                exn::bail!(ErrorKind::invalid(format!("mounts.{name}.read_only"), "a home storage cannot be read-only"));
            }
            // Homes are cached under their owner, so two would share entries.
            if let Some(owner) = &mount.home
                && owners.insert(owner, name).is_some()
            {
                exn::bail!(ErrorKind::invalid(format!("mounts.{name}.home"), "user already has a home storage"));
            }
            // Path equality is component-wise: "/data/" and "/data" collide.
            if let Some(other) = seen.insert(&mount.mount_point, name) {
                tracing::warn!(first = other, second = %name, "Two mounts share a mount point");
                exn::bail!(ErrorKind::invalid(format!("mounts.{name}.mount_point"), "already used by another mount"));
            }
        }
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "tidemark")
}
