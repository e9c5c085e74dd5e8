//! On-disk hub layout shared by every pipeline stage.

use std::{
   path::{Path, PathBuf},
   sync::Arc,
};

use crate::{
   Result,
   config::{self, Config},
   jobs::JobManager,
   ledger::Ledger,
   source::SourceBackend,
};

/// Resolves hub directories from a single root.
///
/// ```text
/// <root>/data/<database>/<collection>/   document collections
/// <root>/hub/build_config/               build configurations
/// <root>/hub/src_master/                 source master documents
/// <root>/hub/src_dump/                   download/upload provenance
/// <root>/hub/src_build/                  target snapshot status ledger
/// <root>/diff/<old>-<new>/               diff sets
/// <root>/logs/                           worker failure dumps
/// <root>/locks/<target>/                 writer leases
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubLayout {
   root: PathBuf,
}

impl HubLayout {
   pub fn new(root: impl Into<PathBuf>) -> Self {
      Self { root: root.into() }
   }

   pub fn from_config() -> Self {
      Self::new(config::get().hub_root())
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   pub fn data_dir(&self) -> PathBuf {
      self.root.join("data")
   }

   pub fn build_config_dir(&self) -> PathBuf {
      self.root.join("hub").join("build_config")
   }

   pub fn src_master_dir(&self) -> PathBuf {
      self.root.join("hub").join("src_master")
   }

   pub fn src_dump_dir(&self) -> PathBuf {
      self.root.join("hub").join("src_dump")
   }

   pub fn ledger_dir(&self) -> PathBuf {
      self.root.join("hub").join("src_build")
   }

   pub fn diff_dir(&self) -> PathBuf {
      self.root.join("diff")
   }

   pub fn log_dir(&self) -> PathBuf {
      self.root.join("logs")
   }

   pub fn locks_dir(&self, target: &str) -> PathBuf {
      self.root.join("locks").join(target)
   }
}

/// Everything an orchestrator needs: where the hub lives, the tunables, the
/// worker pools and the status ledger.
#[derive(Debug, Clone)]
pub struct Hub {
   pub layout: HubLayout,
   pub config: Arc<Config>,
   pub jobs:   Arc<JobManager>,
   pub ledger: Ledger,
}

impl Hub {
   pub fn new(layout: HubLayout, config: Config) -> Result<Self> {
      config.validate()?;
      let jobs = JobManager::new(config.workers())?;
      let ledger = Ledger::for_hub(&layout);
      Ok(Self { layout, config: Arc::new(config), jobs: Arc::new(jobs), ledger })
   }

   pub fn from_config() -> Result<Self> {
      Self::new(HubLayout::from_config(), config::get().clone())
   }

   pub fn sources(&self) -> SourceBackend {
      SourceBackend::new(self.layout.clone(), &self.config.source_database)
   }
}
