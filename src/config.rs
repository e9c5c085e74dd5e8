//! Configuration management for batch sizing, worker pools, and hub paths.

use std::{
   path::{Path, PathBuf},
   sync::OnceLock,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub const DEFAULT_MAX_DIFF_SIZE: u64 = 10 * 1024 * 1024;
pub const MIN_MAX_DIFF_SIZE: u64 = 1024;

/// Pipeline configuration loaded from config file and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub hub_root: Option<PathBuf>,

   pub source_database: String,
   pub target_database: String,

   pub merge_fetch_batch_size: usize,
   pub merge_batch_size:       usize,
   pub diff_batch_size:        usize,
   pub sync_batch_size:        usize,
   pub max_diff_size:          u64,
   pub diff_exclude:           Vec<String>,

   pub max_workers:          usize,
   pub max_inflight_batches: usize,
   pub lease_ttl_ms:         u64,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         hub_root: None,
         source_database: "src".to_string(),
         target_database: "target".to_string(),
         merge_fetch_batch_size: 10_000,
         merge_batch_size: 1_000,
         diff_batch_size: 10_000,
         sync_batch_size: 10_000,
         max_diff_size: DEFAULT_MAX_DIFF_SIZE,
         diff_exclude: vec!["_timestamp".to_string()],
         max_workers: 0,
         max_inflight_batches: 0,
         lease_ttl_ms: 120_000,
      }
   }
}

impl Config {
   pub fn load() -> Self {
      Self::load_with_local(None)
   }

   pub fn load_with_local(local_dir: Option<&Path>) -> Self {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));

      let global = config_file_path();
      if global.exists() {
         figment = figment.merge(Toml::file(global));
      }

      if let Some(dir) = local_dir {
         let local = local_config_path(dir);
         if local.exists() {
            figment = figment.merge(Toml::file(local));
         }
      }

      figment
         .merge(Env::prefixed("HUBPIPE_").lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   /// Number of CPU-pool workers, leaving one core for the coordinator.
   pub fn workers(&self) -> usize {
      if self.max_workers > 0 {
         return self.max_workers;
      }
      num_cpus::get().saturating_sub(1).max(1)
   }

   /// Upper bound on batches submitted but not yet completed.
   pub fn inflight_batches(&self) -> usize {
      if self.max_inflight_batches > 0 {
         return self.max_inflight_batches;
      }
      self.workers() * 2
   }

   /// Resolved hub root directory.
   pub fn hub_root(&self) -> PathBuf {
      self
         .hub_root
         .clone()
         .unwrap_or_else(|| base_dir().clone())
   }

   pub fn validate(&self) -> Result<()> {
      for (name, value) in [
         ("merge_fetch_batch_size", self.merge_fetch_batch_size),
         ("merge_batch_size", self.merge_batch_size),
         ("diff_batch_size", self.diff_batch_size),
         ("sync_batch_size", self.sync_batch_size),
      ] {
         if value == 0 {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")).into());
         }
      }
      if self.max_diff_size < MIN_MAX_DIFF_SIZE {
         return Err(
            ConfigError::Invalid(format!(
               "max_diff_size {} is below the minimum {}",
               self.max_diff_size, MIN_MAX_DIFF_SIZE
            ))
            .into(),
         );
      }
      if self.source_database == self.target_database {
         return Err(
            ConfigError::Invalid("source and target databases must differ".to_string()).into(),
         );
      }
      Ok(())
   }
}

/// Returns the global configuration instance
pub fn get() -> &'static Config {
   CONFIG.get_or_init(Config::load)
}

/// Initializes config for the hub rooted at `dir`, honoring a `.hubpipe.toml`
/// found there. An explicit `hub_root` in the layered config still wins.
pub fn init_for_dir(dir: &Path) -> &'static Config {
   let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
   CONFIG.get_or_init(|| {
      let mut cfg = Config::load_with_local(Some(&dir));
      cfg.hub_root.get_or_insert(dir);
      cfg
   })
}

/// Returns the base directory for hubpipe data and configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".hubpipe"))
}

pub fn local_config_path(dir: &Path) -> PathBuf {
   dir.join(".hubpipe.toml")
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}

macro_rules! define_paths {
   ($($fn_name:ident: $path:literal),* $(,)?) => {
      $(
         pub fn $fn_name() -> &'static PathBuf {
            static ONCE: OnceLock<PathBuf> = OnceLock::new();
            ONCE.get_or_init(|| base_dir().join($path))
         }
      )*
   };
}

define_paths! {
   config_file_path: "config.toml",
}
