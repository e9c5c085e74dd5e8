//! Sync orchestrator: replays a diff set onto a live backend.
//!
//! Each diff file is committed by renaming it with the `.synced` suffix, so a
//! sync interrupted anywhere can simply be run again.

pub mod worker;

use std::{
   collections::HashMap,
   fmt,
   path::{Path, PathBuf},
   str::FromStr,
   sync::Arc,
};

use indicatif::ProgressBar;
use serde::Serialize;
use serde_json::{Map, json};

pub use self::worker::{DocStoreWorker, IndexWorker, SyncCounts, SyncTask, SyncWorker};
use crate::{
   Result,
   diff::{
      DiffMetadata, DiffType,
      descriptor::MAPPING_FILE,
      file::{self, is_synced, locate},
      jsondiff::{self, Patch},
   },
   error::{ConfigError, DiffError, Error, SyncError},
   hub::Hub,
   jobs::{FirstError, JobCategory, JobInfo, Outcome, dispatch_batches_observed},
   lease::WriterLease,
   ledger::{JobStatus, pending},
   store::{BackendDescriptor, BackendKind, IndexSettings},
   util,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStep {
   Mapping,
   Content,
   Meta,
}

impl SyncStep {
   pub const ALL: [Self; 3] = [Self::Mapping, Self::Content, Self::Meta];

   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Mapping => "mapping",
         Self::Content => "content",
         Self::Meta => "meta",
      }
   }
}

impl fmt::Display for SyncStep {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for SyncStep {
   type Err = ConfigError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      Self::ALL
         .into_iter()
         .find(|step| step.as_str() == s)
         .ok_or_else(|| ConfigError::Invalid(format!("unknown sync step {s}")))
   }
}

/// Progress of the content step, reported once per completed file.
#[derive(Debug, Clone, Default)]
pub struct SyncProgress {
   pub processed:    usize,
   pub total:        usize,
   pub current_file: Option<String>,
   pub counts:       SyncCounts,
}

/// Trait for receiving sync progress updates
pub trait SyncProgressCallback: Send {
   fn progress(&mut self, progress: SyncProgress);
}

impl<F: FnMut(SyncProgress) + Send> SyncProgressCallback for F {
   fn progress(&mut self, progress: SyncProgress) {
      self(progress);
   }
}

impl SyncProgressCallback for () {
   fn progress(&mut self, _progress: SyncProgress) {}
}

impl SyncProgressCallback for ProgressBar {
   fn progress(&mut self, progress: SyncProgress) {
      self.set_length(progress.total as u64);
      self.set_position(progress.processed as u64);
      if let Some(file) = &progress.current_file {
         self.set_message(file.clone());
      }
   }
}

/// Sync workers keyed by diff type and backend kind.
#[derive(Clone, Default)]
pub struct SyncerRegistry {
   workers: HashMap<(DiffType, BackendKind), Arc<dyn SyncWorker>>,
}

impl fmt::Debug for SyncerRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut keys: Vec<String> = self
         .workers
         .keys()
         .map(|(t, k)| format!("{t}/{k}"))
         .collect();
      keys.sort();
      f.debug_struct("SyncerRegistry").field("workers", &keys).finish()
   }
}

impl SyncerRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Registry with the built-in workers for every diff type on both kinds.
   pub fn with_defaults() -> Self {
      let mut registry = Self::new();
      for diff_type in DiffType::ALL {
         registry.register(diff_type, Arc::new(DocStoreWorker));
         registry.register(diff_type, Arc::new(IndexWorker));
      }
      registry
   }

   pub fn register(&mut self, diff_type: DiffType, worker: Arc<dyn SyncWorker>) {
      self.workers.insert((diff_type, worker.backend()), worker);
   }

   pub fn get(&self, diff_type: &str, backend: BackendKind) -> Result<Arc<dyn SyncWorker>> {
      diff_type
         .parse::<DiffType>()
         .ok()
         .and_then(|t| self.workers.get(&(t, backend)).cloned())
         .ok_or_else(|| {
            SyncError::UnsupportedBackend {
               diff_type: diff_type.to_string(),
               backend:   backend.to_string(),
            }
            .into()
         })
   }
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
   pub backend:     BackendKind,
   pub diff_folder: PathBuf,
   /// Defaults to `sync_batch_size`.
   pub batch_size:  Option<usize>,
   /// Strip existing `.synced` markers and replay every file.
   pub force:       bool,
   /// Defaults to the diff's old snapshot as a `backend` collection.
   pub target:      Option<BackendDescriptor>,
   pub steps:       Vec<SyncStep>,
}

impl SyncRequest {
   pub fn new(backend: BackendKind, diff_folder: impl Into<PathBuf>) -> Self {
      Self {
         backend,
         diff_folder: diff_folder.into(),
         batch_size: None,
         force: false,
         target: None,
         steps: SyncStep::ALL.to_vec(),
      }
   }

   fn wants(&self, step: SyncStep) -> bool {
      self.steps.contains(&step)
   }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
   pub target:          String,
   pub diff_type:       String,
   pub counts:          SyncCounts,
   pub files_synced:    usize,
   pub files_skipped:   usize,
   pub mapping_updated: bool,
   pub meta_pushed:     bool,
}

#[derive(Debug, Clone)]
pub struct Syncer {
   hub:      Hub,
   registry: Arc<SyncerRegistry>,
}

impl Syncer {
   pub fn new(hub: Hub) -> Self {
      Self { hub, registry: Arc::new(SyncerRegistry::with_defaults()) }
   }

   pub fn with_registry(mut self, registry: SyncerRegistry) -> Self {
      self.registry = Arc::new(registry);
      self
   }

   /// Runs the requested sync steps against the target backend.
   pub async fn sync(
      &self,
      req: SyncRequest,
      progress: &mut dyn SyncProgressCallback,
   ) -> Result<SyncReport> {
      let dir = req.diff_folder.clone();
      let meta = DiffMetadata::load(&dir)?;
      let worker = self.registry.get(&meta.diff.diff_type, req.backend)?;
      let target = req
         .target
         .clone()
         .unwrap_or_else(|| meta.old.backend.with_kind(req.backend));
      if target.kind != req.backend {
         return Err(ConfigError::Invalid(format!(
            "target {target} is not a {} backend",
            req.backend
         ))
         .into());
      }
      let snapshot = meta.new.backend.collection.clone();

      let _guard = self.hub.jobs.admit(
         JobInfo::new(JobCategory::Sync, &target.collection, "sync").describe(&meta.diff.diff_type),
      )?;
      let lease =
         WriterLease::acquire(&self.hub.layout, &target.collection, "sync", self.hub.config.lease_ttl_ms)
            .await?;

      if req.force {
         let reset = file::reset_synced(&dir)?;
         tracing::info!(dir = %dir.display(), reset, "forced sync, markers cleared");
      }
      tracing::info!(
         collection = %target,
         diff_type = %meta.diff.diff_type,
         dir = %dir.display(),
         files = meta.diff.files.len(),
         "starting sync"
      );

      let job = self.hub.ledger.start_job(
         &snapshot,
         &format!("sync-{}", req.backend),
         JobStatus::Syncing,
      )?;
      let result = self
         .run_steps(&req, &meta, &target, worker, progress)
         .await;
      self.hub.ledger.finish_job(&job, result.as_ref().map(|_| ()))?;
      let report = result?;
      lease.verify()?;

      if req.wants(SyncStep::Content) {
         self.hub.ledger.set_pending(&snapshot, pending::PUBLISH)?;
      }
      let mut synced = Map::new();
      synced.insert(
         req.backend.as_str().to_string(),
         json!({"target": target.to_string(), "counts": report.counts}),
      );
      self.hub.ledger.merge_fields(&snapshot, json!({ "sync": synced }))?;
      tracing::info!(
         collection = %target,
         added = report.counts.added,
         updated = report.counts.updated,
         deleted = report.counts.deleted,
         skipped = report.counts.skipped,
         "sync done"
      );
      Ok(report)
   }

   async fn run_steps(
      &self,
      req: &SyncRequest,
      meta: &DiffMetadata,
      target: &BackendDescriptor,
      worker: Arc<dyn SyncWorker>,
      progress: &mut dyn SyncProgressCallback,
   ) -> Result<SyncReport> {
      let is_index = req.backend == BackendKind::Index;
      let mut report = SyncReport {
         target:          target.to_string(),
         diff_type:       meta.diff.diff_type.clone(),
         counts:          SyncCounts::default(),
         files_synced:    0,
         files_skipped:   0,
         mapping_updated: false,
         meta_pushed:     false,
      };

      if req.wants(SyncStep::Mapping) && is_index {
         report.mapping_updated = self.sync_mapping(&req.diff_folder, meta, target)?;
      }
      if req.wants(SyncStep::Content) {
         self
            .sync_content(req, meta, target, worker, progress, &mut report)
            .await?;
      }
      if req.wants(SyncStep::Meta) && is_index {
         let coll = target.open()?;
         let mut settings = coll.settings()?;
         settings.meta = meta.meta.clone();
         coll.write_settings(&settings)?;
         report.meta_pushed = true;
         tracing::info!(collection = %target, "_meta pushed");
      }
      Ok(report)
   }

   /// Applies the stored additive mapping patch to the live mapping.
   fn sync_mapping(&self, dir: &Path, meta: &DiffMetadata, target: &BackendDescriptor) -> Result<bool> {
      let Some(entry) = &meta.diff.mapping_file else {
         return Ok(false);
      };
      let path = dir.join(MAPPING_FILE);
      let raw = std::fs::read(&path).map_err(|e| match e.kind() {
         std::io::ErrorKind::NotFound => Error::from(DiffError::MissingFile(path.display().to_string())),
         _ => e.into(),
      })?;
      let found = util::md5_hex(&raw);
      if found != entry.md5sum {
         return Err(DiffError::ChecksumMismatch {
            file: entry.name.clone(),
            expected: entry.md5sum.clone(),
            found,
         }
         .into());
      }
      let patch: Patch = serde_json::from_slice(&raw)?;

      let coll = target.open()?;
      let settings = coll.settings()?;
      let live = if settings.mapping.is_null() { json!({}) } else { settings.mapping.clone() };
      let mapping = jsondiff::apply(&live, &patch).map_err(|err| SyncError::MappingPatch {
         file:   entry.name.clone(),
         reason: err.to_string(),
      })?;
      if mapping == live {
         return Ok(false);
      }
      coll.write_settings(&IndexSettings { mapping, ..settings })?;
      tracing::info!(collection = %target, ops = patch.len(), "mapping updated");
      Ok(true)
   }

   async fn sync_content(
      &self,
      req: &SyncRequest,
      meta: &DiffMetadata,
      target: &BackendDescriptor,
      worker: Arc<dyn SyncWorker>,
      progress: &mut dyn SyncProgressCallback,
      report: &mut SyncReport,
   ) -> Result<()> {
      let dir = &req.diff_folder;
      let total = meta.diff.files.len();
      let mut pending_files = Vec::with_capacity(total);
      for entry in &meta.diff.files {
         if locate(dir, &entry.name).is_none() {
            return Err(DiffError::MissingFile(entry.name.clone()).into());
         }
         if is_synced(dir, &entry.name) {
            report.counts += SyncCounts::all_skipped(entry.total_ops());
            report.files_skipped += 1;
         } else {
            pending_files.push(entry.clone());
         }
      }
      let already = report.files_skipped;
      progress.progress(SyncProgress { processed: already, total, current_file: None, counts: report.counts });

      let names: Vec<String> = pending_files.iter().map(|f| f.name.clone()).collect();
      let batch_size = req.batch_size.unwrap_or(self.hub.config.sync_batch_size).max(1);
      let self_contained = meta.is_self_contained();
      let batches = pending_files
         .into_iter()
         .enumerate()
         .map(|(seq, entry)| {
            let task = SyncTask {
               dir: dir.clone(),
               entry,
               target: target.clone(),
               new: meta.new.backend.clone(),
               self_contained,
               batch_size,
            };
            let worker = Arc::clone(&worker);
            (seq, move || worker.sync_file(&task))
         });

      let mut processed = already;
      let mut running = report.counts;
      let base = JobInfo::new(JobCategory::Sync, &target.collection, "sync-content");
      let run = dispatch_batches_observed(
         &self.hub.jobs,
         &base,
         self.hub.config.inflight_batches(),
         batches,
         FirstError::new(),
         |seq, outcome| {
            processed += 1;
            if let Outcome::Done(counts) = outcome {
               running += *counts;
            }
            progress.progress(SyncProgress {
               processed,
               total,
               current_file: names.get(seq).cloned(),
               counts: running,
            });
         },
      )
      .await?;

      report.files_synced += run.done.len();
      for counts in run.values() {
         report.counts += counts;
      }
      Ok(())
   }
}
