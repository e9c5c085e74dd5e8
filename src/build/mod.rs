//! Build orchestrator: merges per-source collections into a target snapshot.
//!
//! Root sources are merged completely, with upsert, before any other source
//! starts. Other sources only update documents a root source created.

pub mod metadata;
pub mod worker;

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

pub use self::worker::{MergeTask, merge_batch};
use crate::{
   Result,
   error::{ConfigError, Error},
   hub::Hub,
   jobs::{FirstError, JobCategory, JobInfo, dispatch_batches},
   lease::WriterLease,
   ledger::{JobStatus, TargetSnapshot, pending},
   mapper::{DocCleaner, MapperRegistry},
   source::{BuildConfiguration, SourceBackend, SourceMaster},
   store::{BackendDescriptor, chunk_ids},
   target::{BuildHooks, NoHooks, TargetBackend},
};

pub const STEP_MERGE_ROOT: &str = "merge-root";
pub const STEP_MERGE_OTHERS: &str = "merge-others";
pub const STEP_FINALIZING: &str = "finalizing";
pub const STEP_POST_MERGE: &str = "post-merge";
pub const STEP_METADATA: &str = "metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStep {
   Merge,
   Post,
   Metadata,
}

impl BuildStep {
   pub const ALL: [Self; 3] = [Self::Merge, Self::Post, Self::Metadata];
}

impl FromStr for BuildStep {
   type Err = ConfigError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      match s {
         "merge" => Ok(Self::Merge),
         "post" => Ok(Self::Post),
         "metadata" => Ok(Self::Metadata),
         other => Err(ConfigError::Invalid(format!("unknown build step {other}"))),
      }
   }
}

impl fmt::Display for BuildStep {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let s = match self {
         Self::Merge => "merge",
         Self::Post => "post",
         Self::Metadata => "metadata",
      };
      f.write_str(s)
   }
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
   pub build_name:  String,
   /// Defaults to the build configuration's source list.
   pub sources:     Option<Vec<String>>,
   pub target_name: Option<String>,
   /// Skip the upload precondition check.
   pub force:       bool,
   /// Restrict the merge to these ids; defaults to the configuration's `ids`.
   pub ids:         Option<Vec<String>>,
   pub steps:       Vec<BuildStep>,
}

impl MergeRequest {
   pub fn new(build_name: impl Into<String>) -> Self {
      Self {
         build_name:  build_name.into(),
         sources:     None,
         target_name: None,
         force:       false,
         ids:         None,
         steps:       BuildStep::ALL.to_vec(),
      }
   }

   fn wants(&self, step: BuildStep) -> bool {
      self.steps.contains(&step)
   }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
   pub target_name:   String,
   pub build_version: Option<String>,
   pub merge_stats:   BTreeMap<String, u64>,
   pub total:         Option<u64>,
}

pub struct Builder {
   hub:     Hub,
   mappers: Arc<MapperRegistry>,
   cleaner: Option<DocCleaner>,
   hooks:   Arc<dyn BuildHooks>,
}

impl fmt::Debug for Builder {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Builder")
         .field("mappers", &self.mappers)
         .field("cleaner", &self.cleaner.is_some())
         .finish_non_exhaustive()
   }
}

/// Resolved inputs of one build, fixed before any batch work starts.
struct BuildPlan {
   config:     BuildConfiguration,
   masters:    BTreeMap<String, SourceMaster>,
   sources:    Vec<String>,
   root:       Vec<String>,
   others:     Vec<String>,
   ids:        Option<Vec<String>>,
   started_at: DateTime<Utc>,
}

impl Builder {
   pub fn new(hub: Hub) -> Self {
      Self { hub, mappers: Arc::new(MapperRegistry::new()), cleaner: None, hooks: Arc::new(NoHooks) }
   }

   pub fn with_mappers(mut self, mappers: MapperRegistry) -> Self {
      self.mappers = Arc::new(mappers);
      self
   }

   pub fn with_cleaner(mut self, cleaner: DocCleaner) -> Self {
      self.cleaner = Some(cleaner);
      self
   }

   pub fn with_hooks(mut self, hooks: Arc<dyn BuildHooks>) -> Self {
      self.hooks = hooks;
      self
   }

   /// Runs the requested build steps and returns the snapshot's stats.
   pub async fn merge(&self, req: MergeRequest) -> Result<BuildReport> {
      let sources = self.hub.sources();
      let plan = self.plan(&sources, &req)?;

      let mut target = TargetBackend::new(self.hub.layout.clone(), &self.hub.config.target_database)
         .with_hooks(Arc::clone(&self.hooks));
      if !req.wants(BuildStep::Merge) && req.target_name.is_none() {
         return Err(
            ConfigError::Invalid("a target name is required when the merge step is skipped".to_string())
               .into(),
         );
      }
      let target_name = target
         .set_target_name(req.target_name.as_deref(), &plan.config.name, plan.started_at)
         .to_string();

      let _guard = self
         .hub
         .jobs
         .admit(JobInfo::new(JobCategory::Build, &target_name, "merge").describe(&plan.config.name))?;
      let lease =
         WriterLease::acquire(&self.hub.layout, &target_name, "build", self.hub.config.lease_ttl_ms)
            .await?;

      tracing::info!(
         build = %plan.config.name,
         snapshot = %target_name,
         root = ?plan.root,
         others = ?plan.others,
         "starting build"
      );

      let merge_stats = if req.wants(BuildStep::Merge) {
         self.hub.ledger.create(TargetSnapshot {
            build_config: serde_json::to_value(&plan.config)?,
            started_at: Some(plan.started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            status: Some(JobStatus::Pending),
            ..TargetSnapshot::new(&target_name)
         })?;
         target.drop()?;
         target.prepare()?;
         self.merge_phases(&target, &plan).await?
      } else {
         self.hub.ledger.get(&target_name)?.merge_stats
      };

      if req.wants(BuildStep::Post) {
         self.post_merge(&target).await?;
      }

      let mut report = BuildReport {
         target_name: target_name.clone(),
         build_version: None,
         merge_stats,
         total: None,
      };
      if req.wants(BuildStep::Metadata) {
         lease.verify()?;
         let (version, total) = self
            .metadata_phase(&sources, &target, &plan, &report.merge_stats)
            .await?;
         report.build_version = Some(version);
         report.total = Some(total);
      }
      tracing::info!(snapshot = %target_name, stats = ?report.merge_stats, "build done");
      Ok(report)
   }

   fn plan(&self, sources: &SourceBackend, req: &MergeRequest) -> Result<BuildPlan> {
      let config = sources.get_build_configuration(&req.build_name)?;
      let requested = req
         .sources
         .clone()
         .unwrap_or_else(|| config.sources.clone());
      let resolved = sources.validate_sources((!requested.is_empty()).then_some(requested.as_slice()))?;

      if req.wants(BuildStep::Merge) {
         let busy = sources.uploading(&resolved)?;
         if !busy.is_empty() {
            return Err(Error::Busy {
               target: config.name.clone(),
               reason: format!("uploads running for {busy:?}"),
            });
         }
         if !req.force {
            sources.check_uploads(&resolved)?;
         }
      }
      // Sub-sources must agree on their release before anything is written.
      sources.get_src_metadata(&resolved)?;

      let masters = sources.get_src_master_docs()?;
      let (root, others) = config.split_root(&resolved, &masters)?;
      if root.is_empty() && !others.is_empty() {
         tracing::warn!(build = %config.name, "no root source selected, non-root sources cannot create documents");
      }
      let ids = match (&req.ids, &config.ids) {
         (Some(ids), _) => Some(ids.clone()),
         (None, Some(selection)) => Some(selection.resolve()?),
         (None, None) => None,
      };
      Ok(BuildPlan { config, masters, sources: resolved, root, others, ids, started_at: Utc::now() })
   }

   async fn merge_phases(
      &self,
      target: &TargetBackend,
      plan: &BuildPlan,
   ) -> Result<BTreeMap<String, u64>> {
      let target_name = target.target_name().unwrap_or_default().to_string();
      let mut stats = BTreeMap::new();

      for (step, group, upsert) in [
         (STEP_MERGE_ROOT, &plan.root, true),
         (STEP_MERGE_OTHERS, &plan.others, false),
      ] {
         let job = self.hub.ledger.start_job(&target_name, step, JobStatus::Building)?;
         let result = self.merge_group(target, plan, group, upsert, &mut stats).await;
         self.hub.ledger.finish_job(&job, result.as_ref().map(|_| ()))?;
         result?;
         self
            .hub
            .ledger
            .merge_fields(&target_name, json!({"merge_stats": stats}))?;
      }

      let job = self.hub.ledger.start_job(&target_name, STEP_FINALIZING, JobStatus::Building)?;
      let result = target.finalize();
      self.hub.ledger.finish_job(&job, result.as_ref().map(|_| ()))?;
      result?;
      Ok(stats)
   }

   async fn merge_group(
      &self,
      target: &TargetBackend,
      plan: &BuildPlan,
      group: &[String],
      upsert: bool,
      stats: &mut BTreeMap<String, u64>,
   ) -> Result<()> {
      for source in group {
         let count = self.merge_source(target, plan, source, upsert).await?;
         tracing::info!(source = %source, count, upsert, "source merged");
         stats.insert(source.clone(), count);
      }
      Ok(())
   }

   /// Dispatches one merge worker per sub-batch of `source`'s id space.
   async fn merge_source(
      &self,
      target: &TargetBackend,
      plan: &BuildPlan,
      source: &str,
      upsert: bool,
   ) -> Result<u64> {
      let cfg = &self.hub.config;
      let src = self.hub.sources().descriptor(source);
      let dest: BackendDescriptor = target.descriptor()?;

      let mut ids = src.open()?.ids()?;
      if let Some(only) = &plan.ids {
         let only: std::collections::HashSet<&String> = only.iter().collect();
         ids.retain(|id| only.contains(id));
      }
      let mapper = self
         .mappers
         .resolve_name(source, plan.masters.get(source).and_then(|m| m.mapper.as_deref()));
      tracing::debug!(source = %source, ids = ids.len(), mapper = %mapper, "merging source");

      let sub_batch = cfg.merge_batch_size;
      let batches = chunk_ids(ids, cfg.merge_fetch_batch_size)
         .into_iter()
         .flat_map(move |fetched| chunk_ids(fetched, sub_batch))
         .enumerate()
         .map(|(seq, ids)| {
            let task = MergeTask {
               source: source.to_string(),
               batch: seq,
               src: src.clone(),
               dest: dest.clone(),
               ids,
               mapper: mapper.clone(),
               upsert,
               log_dir: self.hub.layout.log_dir(),
            };
            let mappers = Arc::clone(&self.mappers);
            let cleaner = self.cleaner.clone();
            (seq, move || merge_batch(&task, &mappers, cleaner.as_ref()))
         });

      let info = JobInfo::new(JobCategory::Build, target.target_name().unwrap_or_default(), source)
         .describe(if upsert { STEP_MERGE_ROOT } else { STEP_MERGE_OTHERS });
      let run = dispatch_batches(&self.hub.jobs, &info, cfg.inflight_batches(), batches, FirstError::new()).await?;
      Ok(run.values().sum())
   }

   async fn post_merge(&self, target: &TargetBackend) -> Result<()> {
      let target_name = target.target_name().unwrap_or_default().to_string();
      let job = self.hub.ledger.start_job(&target_name, STEP_POST_MERGE, JobStatus::Building)?;
      let hook_target = target.clone();
      let result = self
         .hub
         .jobs
         .defer_to_thread(JobInfo::new(JobCategory::Io, &target_name, STEP_POST_MERGE), move || {
            hook_target.post_merge()
         })
         .await;
      self.hub.ledger.finish_job(&job, result.as_ref().map(|_| ()))?;
      result
   }

   async fn metadata_phase(
      &self,
      sources: &SourceBackend,
      target: &TargetBackend,
      plan: &BuildPlan,
      merge_stats: &BTreeMap<String, u64>,
   ) -> Result<(String, u64)> {
      let target_name = target.target_name().unwrap_or_default().to_string();
      let job = self.hub.ledger.start_job(&target_name, STEP_METADATA, JobStatus::Building)?;
      let result = self.compute_metadata(sources, target, plan, merge_stats).await;
      self.hub.ledger.finish_job(&job, result.as_ref().map(|_| ()))?;
      let (version, total) = result?;
      self.hub.ledger.set_pending(&target_name, pending::DIFF)?;
      Ok((version, total))
   }

   async fn compute_metadata(
      &self,
      sources: &SourceBackend,
      target: &TargetBackend,
      plan: &BuildPlan,
      merge_stats: &BTreeMap<String, u64>,
   ) -> Result<(String, u64)> {
      let target_name = target.target_name().unwrap_or_default().to_string();
      let merged: Vec<String> = if merge_stats.is_empty() {
         plan.sources.clone()
      } else {
         merge_stats.keys().cloned().collect()
      };
      let src_meta = sources.get_src_metadata(&merged)?;
      let mapping = metadata::union_mappings(&plan.masters, &merged)?;

      let count_target = target.clone();
      let total = self
         .hub
         .jobs
         .defer_to_thread(JobInfo::new(JobCategory::Io, &target_name, "count"), move || {
            count_target.collection()?.count()
         })
         .await?;

      let version = metadata::build_version(plan.started_at)?;
      let custom = target.custom_metadata()?;
      let meta = metadata::snapshot_meta(&src_meta, total, &version, plan.started_at, custom)?;

      let coll = target.collection()?;
      coll.write_settings(&crate::store::IndexSettings { mapping: mapping.clone(), meta: meta.clone() })?;

      self.hub.ledger.update(&target_name, None, |snap| {
         snap.build_version = Some(version.clone());
         snap.mapping = mapping;
         snap.meta = meta;
         snap.merge_stats = merge_stats.clone();
         Ok(())
      })?;
      Ok((version, total))
   }
}
