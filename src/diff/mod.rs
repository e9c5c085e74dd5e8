//! Diff orchestrator: computes the patch set turning one snapshot into the
//! next.
//!
//! A diff type is a content strategy (plain or self-contained json-diff)
//! composed with a post-process strategy (identity or cold/hot correction).
//! Phases run strictly in order: mapping, count, content, reduce, post.
//! `metadata.json` is written as soon as the run starts and checkpointed
//! after every phase.

pub mod coldhot;
pub mod descriptor;
pub mod file;
pub mod jsondiff;
pub mod reduce;
pub mod worker;

use std::{
   collections::BTreeMap,
   fmt, fs,
   io::ErrorKind,
   path::{Path, PathBuf},
   str::FromStr,
};

use serde::Serialize;
use serde_json::{Value, json};

pub use self::descriptor::{DiffMetadata, FileEntry};
use self::{
   descriptor::{DiffInfo, DiffSection, DiffSide, DiffStats, MAPPING_FILE},
   worker::{ContentTask, Direction},
};
use crate::{
   Result,
   error::{ConfigError, DiffError, StoreError},
   hub::Hub,
   jobs::{FirstError, JobCategory, JobInfo, dispatch_batches},
   lease::WriterLease,
   ledger::{self, JobStatus, pending},
   store::{BackendDescriptor, chunk_ids},
   util,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStrategy {
   /// Adds carry ids; documents are fetched from the new snapshot at sync.
   Plain,
   /// Adds carry whole documents.
   SelfContained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcess {
   Identity,
   ColdHot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiffType {
   pub content: ContentStrategy,
   pub post:    PostProcess,
}

impl DiffType {
   pub const JSONDIFF: Self = Self { content: ContentStrategy::Plain, post: PostProcess::Identity };
   pub const JSONDIFF_SELFCONTAINED: Self =
      Self { content: ContentStrategy::SelfContained, post: PostProcess::Identity };
   pub const COLDHOT_JSONDIFF: Self = Self { content: ContentStrategy::Plain, post: PostProcess::ColdHot };
   pub const COLDHOT_JSONDIFF_SELFCONTAINED: Self =
      Self { content: ContentStrategy::SelfContained, post: PostProcess::ColdHot };

   pub const ALL: [Self; 4] = [
      Self::JSONDIFF,
      Self::JSONDIFF_SELFCONTAINED,
      Self::COLDHOT_JSONDIFF,
      Self::COLDHOT_JSONDIFF_SELFCONTAINED,
   ];

   pub const fn as_str(self) -> &'static str {
      match (self.content, self.post) {
         (ContentStrategy::Plain, PostProcess::Identity) => "jsondiff",
         (ContentStrategy::SelfContained, PostProcess::Identity) => "jsondiff-selfcontained",
         (ContentStrategy::Plain, PostProcess::ColdHot) => "coldhot-jsondiff",
         (ContentStrategy::SelfContained, PostProcess::ColdHot) => "coldhot-jsondiff-selfcontained",
      }
   }

   /// Name of the content function, recorded as `diff.func`.
   pub const fn func(self) -> &'static str {
      match self.content {
         ContentStrategy::Plain => "jsondiff",
         ContentStrategy::SelfContained => "jsondiff-selfcontained",
      }
   }

   pub const fn is_self_contained(self) -> bool {
      matches!(self.content, ContentStrategy::SelfContained)
   }
}

impl fmt::Display for DiffType {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for DiffType {
   type Err = ConfigError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      Self::ALL
         .into_iter()
         .find(|t| t.as_str() == s)
         .ok_or_else(|| ConfigError::Invalid(format!("unknown diff type {s}")))
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStep {
   Mapping,
   Count,
   Content,
   Reduce,
   Post,
}

impl DiffStep {
   pub const ALL: [Self; 5] = [Self::Mapping, Self::Count, Self::Content, Self::Reduce, Self::Post];

   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Mapping => "mapping",
         Self::Count => "count",
         Self::Content => "content",
         Self::Reduce => "reduce",
         Self::Post => "post",
      }
   }
}

impl fmt::Display for DiffStep {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for DiffStep {
   type Err = ConfigError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      Self::ALL
         .into_iter()
         .find(|step| step.as_str() == s)
         .ok_or_else(|| ConfigError::Invalid(format!("unknown diff step {s}")))
   }
}

/// Reuse policy for an existing diff directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
   /// Delete the directory first.
   Purge,
   /// Keep files and metadata; continue with the requested steps.
   Resume,
   /// Keep files but start from fresh metadata.
   Force,
}

impl DiffMode {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Purge => "purge",
         Self::Resume => "resume",
         Self::Force => "force",
      }
   }
}

impl FromStr for DiffMode {
   type Err = ConfigError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      match s {
         "purge" => Ok(Self::Purge),
         "resume" => Ok(Self::Resume),
         "force" => Ok(Self::Force),
         other => Err(ConfigError::Invalid(format!("unknown diff mode {other}"))),
      }
   }
}

#[derive(Debug, Clone)]
pub struct DiffRequest {
   pub old:        BackendDescriptor,
   pub new:        BackendDescriptor,
   /// Defaults to `diff_batch_size`.
   pub batch_size: Option<usize>,
   pub steps:      Vec<DiffStep>,
   pub mode:       Option<DiffMode>,
   /// Defaults to `diff_exclude`.
   pub exclude:    Option<Vec<String>>,
}

impl DiffRequest {
   pub fn new(old: BackendDescriptor, new: BackendDescriptor) -> Self {
      Self { old, new, batch_size: None, steps: DiffStep::ALL.to_vec(), mode: None, exclude: None }
   }

   fn wants(&self, step: DiffStep) -> bool {
      self.steps.contains(&step)
   }
}

#[derive(Debug, Clone)]
pub struct Differ {
   hub:       Hub,
   diff_type: DiffType,
}

/// Resolved inputs of one diff run.
struct DiffPlan {
   dir:        PathBuf,
   old:        BackendDescriptor,
   new:        BackendDescriptor,
   batch_size: usize,
   exclude:    Vec<String>,
}

impl Differ {
   pub const fn new(hub: Hub, diff_type: DiffType) -> Self {
      Self { hub, diff_type }
   }

   pub const fn diff_type(&self) -> DiffType {
      self.diff_type
   }

   /// Deterministic output directory for a pair of snapshots.
   pub fn diff_folder(&self, old: &BackendDescriptor, new: &BackendDescriptor) -> PathBuf {
      self
         .hub
         .layout
         .diff_dir()
         .join(format!("{}-{}", old.identity(), new.identity()))
   }

   /// Runs the requested phases and returns the final metadata.
   pub async fn diff(&self, req: DiffRequest) -> Result<DiffMetadata> {
      let plan = DiffPlan {
         dir:        self.diff_folder(&req.old, &req.new),
         old:        req.old.clone(),
         new:        req.new.clone(),
         batch_size: req.batch_size.unwrap_or(self.hub.config.diff_batch_size).max(1),
         exclude:    req
            .exclude
            .clone()
            .unwrap_or_else(|| self.hub.config.diff_exclude.clone()),
      };
      for side in [&plan.old, &plan.new] {
         if !side.open()?.exists() {
            return Err(StoreError::NoSuchCollection(side.to_string()).into());
         }
      }
      let snapshot = plan.new.collection.clone();

      let _guard = self
         .hub
         .jobs
         .admit(JobInfo::new(JobCategory::Diff, &snapshot, "diff").describe(self.diff_type.as_str()))?;
      let lease =
         WriterLease::acquire(&self.hub.layout, &snapshot, "diff", self.hub.config.lease_ttl_ms).await?;

      self.prepare_dir(&plan.dir, &req)?;
      let mut meta = self.initial_metadata(&plan, &req)?;
      if matches!(self.diff_type.post, PostProcess::ColdHot) && req.wants(DiffStep::Post) {
         coldhot::cold_backend(&meta)?;
      }
      meta.save(&plan.dir)?;
      tracing::info!(
         old = %plan.old,
         new = %plan.new,
         diff_type = %self.diff_type,
         dir = %plan.dir.display(),
         "starting diff"
      );

      for step in DiffStep::ALL {
         if !req.wants(step) {
            continue;
         }
         let job = self
            .hub
            .ledger
            .start_job(&snapshot, &format!("diff-{step}"), JobStatus::Diffing)?;
         let result = self.run_step(step, &plan, &mut meta).await;
         self.hub.ledger.finish_job(&job, result.as_ref().map(|_| ()))?;
         if let Err(err) = result {
            tracing::error!(snapshot = %snapshot, step = %step, "diff step failed: {err}");
            return Err(err);
         }
         meta.save(&plan.dir)?;
      }

      lease.verify()?;
      meta.save(&plan.dir)?;
      self.hub.ledger.clear_pending(&snapshot, pending::DIFF)?;
      self.hub.ledger.set_pending(&snapshot, pending::RELEASE_NOTE)?;
      self.hub.ledger.merge_fields(
         &snapshot,
         json!({"diff": {"folder": plan.dir.display().to_string(), "stats": meta.diff.stats}}),
      )?;
      tracing::info!(
         snapshot = %snapshot,
         add = meta.diff.stats.add,
         update = meta.diff.stats.update,
         delete = meta.diff.stats.delete,
         files = meta.diff.files.len(),
         "diff done"
      );
      Ok(meta)
   }

   fn prepare_dir(&self, dir: &Path, req: &DiffRequest) -> Result<()> {
      match req.mode {
         Some(DiffMode::Purge) => match fs::remove_dir_all(dir) {
            Ok(()) => tracing::info!(dir = %dir.display(), "purged previous diff"),
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
         },
         None if req.wants(DiffStep::Content) && !is_empty_dir(dir)? => {
            return Err(DiffError::DirectoryNotEmpty(dir.to_path_buf()).into());
         },
         _ => {},
      }
      fs::create_dir_all(dir)?;
      Ok(())
   }

   fn initial_metadata(&self, plan: &DiffPlan, req: &DiffRequest) -> Result<DiffMetadata> {
      let info = DiffInfo {
         generated_on: ledger::now(),
         exclude:      plan.exclude.clone(),
         steps:        req.steps.iter().map(|s| s.to_string()).collect(),
         mode:         req.mode.map(|m| m.as_str().to_string()),
         batch_size:   plan.batch_size,
      };

      let reuse = !matches!(req.mode, Some(DiffMode::Force | DiffMode::Purge));
      if reuse && let Some(mut meta) = DiffMetadata::try_load(&plan.dir)? {
         if meta.diff.diff_type != self.diff_type.as_str() {
            return Err(ConfigError::Invalid(format!(
               "{} holds a {} diff, not {}",
               plan.dir.display(),
               meta.diff.diff_type,
               self.diff_type
            ))
            .into());
         }
         meta.diff.info = DiffInfo { generated_on: meta.diff.info.generated_on.clone(), ..info };
         return Ok(meta);
      }

      let old_version = self.snapshot_version(&plan.old)?;
      let new_version = self.snapshot_version(&plan.new)?;
      let new_snapshot = self.hub.ledger.load(&plan.new.collection)?;
      let build_config = new_snapshot
         .as_ref()
         .map_or(Value::Null, |s| s.build_config.clone());
      let settings_meta = plan.new.open()?.settings()?.meta;
      let meta = if settings_meta.is_null() {
         new_snapshot.map_or_else(|| json!({}), |s| s.meta)
      } else {
         settings_meta
      };

      Ok(DiffMetadata {
         diff: DiffSection {
            diff_type: self.diff_type.as_str().to_string(),
            func: self.diff_type.func().to_string(),
            version: format!("{old_version}.{new_version}"),
            stats: DiffStats::default(),
            files: Vec::new(),
            mapping_file: None,
            info,
            cold: None,
         },
         old: DiffSide { backend: plan.old.clone(), version: old_version },
         new: DiffSide { backend: plan.new.clone(), version: new_version },
         meta,
         build_config,
      })
   }

   /// Build version from the ledger, else from the collection's `_meta`.
   fn snapshot_version(&self, backend: &BackendDescriptor) -> Result<String> {
      if let Some(snap) = self.hub.ledger.load(&backend.collection)?
         && let Some(version) = snap.build_version
      {
         return Ok(version);
      }
      let settings = backend.open()?.settings()?;
      Ok(settings
         .meta
         .get("build_version")
         .and_then(Value::as_str)
         .unwrap_or("unknown")
         .to_string())
   }

   async fn run_step(&self, step: DiffStep, plan: &DiffPlan, meta: &mut DiffMetadata) -> Result<()> {
      let base = JobInfo::new(JobCategory::Diff, &plan.new.collection, format!("diff-{step}"));
      match step {
         DiffStep::Mapping => self.mapping_step(plan, meta),
         DiffStep::Count => self.count_step(plan, meta, &base).await,
         DiffStep::Content => self.content_step(plan, meta, &base).await,
         DiffStep::Reduce => {
            reduce::reduce(&self.hub, &base, &plan.dir, meta, self.hub.config.max_diff_size).await?;
            Ok(())
         },
         DiffStep::Post => match self.diff_type.post {
            PostProcess::Identity => Ok(()),
            PostProcess::ColdHot => coldhot::correct(&self.hub, &base, &plan.dir, meta).await,
         },
      }
   }

   /// Mapping changes must be additive: a live index cannot retract fields.
   fn mapping_step(&self, plan: &DiffPlan, meta: &mut DiffMetadata) -> Result<()> {
      let old = normalize_mapping(plan.old.open()?.settings()?.mapping);
      let new = normalize_mapping(plan.new.open()?.settings()?.mapping);
      let patch = jsondiff::diff(&old, &new, &[]);

      let offending: Vec<String> = patch
         .iter()
         .filter(|op| !matches!(op, jsondiff::PatchOp::Add { .. }))
         .map(|op| format!("{} {}", op.kind(), op.path()))
         .collect();
      if !offending.is_empty() {
         return Err(DiffError::NonAdditiveMapping { ops: offending }.into());
      }

      let path = plan.dir.join(MAPPING_FILE);
      if patch.is_empty() {
         meta.diff.mapping_file = None;
         meta.diff.stats.mapping_changed = false;
         match fs::remove_file(&path) {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
         }
         return Ok(());
      }
      let bytes = serde_json::to_vec_pretty(&patch)?;
      util::write_bytes_atomic(&path, &bytes)?;
      meta.diff.mapping_file = Some(FileEntry {
         name: MAPPING_FILE.to_string(),
         md5sum: util::md5_hex(&bytes),
         add: patch.len() as u64,
         ..FileEntry::default()
      });
      meta.diff.stats.mapping_changed = true;
      tracing::info!(fields = patch.len(), "mapping diff written");
      Ok(())
   }

   async fn count_step(&self, plan: &DiffPlan, meta: &mut DiffMetadata, base: &JobInfo) -> Result<()> {
      let ids = plan.new.open()?.ids()?;
      let batches = chunk_ids(ids, plan.batch_size)
         .into_iter()
         .enumerate()
         .map(|(seq, ids)| {
            let new = plan.new.clone();
            (seq, move || worker::count_root_keys(&new, &ids))
         });
      let run = dispatch_batches(
         &self.hub.jobs,
         base,
         self.hub.config.inflight_batches(),
         batches,
         FirstError::new(),
      )
      .await?;

      let mut root_keys = BTreeMap::new();
      for counts in run.values() {
         for (key, n) in counts {
            *root_keys.entry(key).or_insert(0) += n;
         }
      }
      meta.diff.stats.root_keys = Some(root_keys);
      Ok(())
   }

   async fn content_step(&self, plan: &DiffPlan, meta: &mut DiffMetadata, base: &JobInfo) -> Result<()> {
      file::clear_content(&plan.dir)?;
      reduce::discard_plan(&plan.dir)?;
      meta.diff.files.clear();
      meta.recompute_stats();
      if matches!(self.diff_type.post, PostProcess::ColdHot) {
         meta.diff.cold = Some(coldhot::snapshot_cold(meta)?);
      }
      meta.save(&plan.dir)?;

      let new_batches = chunk_ids(plan.new.open()?.ids()?, plan.batch_size);
      let old_batches = chunk_ids(plan.old.open()?.ids()?, plan.batch_size);
      let tasks = new_batches
         .into_iter()
         .map(|ids| (Direction::NewVsOld, ids))
         .chain(old_batches.into_iter().map(|ids| (Direction::OldVsNew, ids)))
         .enumerate()
         .map(|(seq, (direction, ids))| {
            let task = ContentTask {
               seq,
               direction,
               old: plan.old.clone(),
               new: plan.new.clone(),
               ids,
               exclude: plan.exclude.clone(),
               self_contained: self.diff_type.is_self_contained(),
               out_dir: plan.dir.clone(),
            };
            (seq, move || worker::diff_batch(&task))
         });
      let run = dispatch_batches(
         &self.hub.jobs,
         base,
         self.hub.config.inflight_batches(),
         tasks,
         FirstError::new(),
      )
      .await?;

      meta.diff.files = run.values().collect();
      meta.recompute_stats();
      tracing::info!(
         files = meta.diff.files.len(),
         add = meta.diff.stats.add,
         update = meta.diff.stats.update,
         delete = meta.diff.stats.delete,
         "content diffed"
      );
      Ok(())
   }
}

/// A missing mapping diffs like an empty one.
fn normalize_mapping(mapping: Value) -> Value {
   if mapping.is_null() { json!({}) } else { mapping }
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
   match fs::read_dir(dir) {
      Ok(mut entries) => Ok(entries.next().is_none()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
      Err(e) => Err(e.into()),
   }
}
