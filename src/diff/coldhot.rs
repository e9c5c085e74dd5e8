//! Cold/hot correction for tiered builds.
//!
//! A hot build is merged on top of a premerged cold collection. Fields the
//! cold collection still owns must survive a hot diff, so depth-1 removals of
//! cold keys are stripped and whole-document deletes of ids still present in
//! cold become field-level removals.

use std::{
   collections::BTreeSet,
   path::{Path, PathBuf},
};

use serde_json::Value;

use super::{
   descriptor::{ColdSnapshot, DiffMetadata, FileEntry},
   file::{DiffFile, UpdateEntry},
   jsondiff::{PatchOp, pointer},
};
use crate::{
   Result,
   error::{ConfigError, DiffError},
   hub::Hub,
   jobs::{FirstError, JobInfo, Outcome, dispatch_batches},
   store::{BackendDescriptor, Collection},
};

#[derive(Debug, Clone)]
pub struct FileCorrection {
   pub entry:             FileEntry,
   pub removes_stripped:  u64,
   pub deletes_converted: u64,
   pub deletes_dropped:   u64,
}

/// Resolves the cold collection declared by the new snapshot's build
/// configuration. It lives next to the new snapshot.
pub fn cold_backend(meta: &DiffMetadata) -> Result<BackendDescriptor> {
   let config = &meta.build_config;
   let name = config
      .get("cold_collection")
      .and_then(Value::as_str)
      .filter(|s| !s.is_empty());
   match name {
      Some(name) => Ok(meta.new.backend.with_collection(name)),
      None => {
         let build = config
            .get("name")
            .or_else(|| config.get("_id"))
            .and_then(Value::as_str)
            .unwrap_or(&meta.new.backend.collection);
         Err(ConfigError::MissingColdCollection(build.to_string()).into())
      },
   }
}

/// Records the cold collection's size; compared again by [`correct`].
pub fn snapshot_cold(meta: &DiffMetadata) -> Result<ColdSnapshot> {
   let backend = cold_backend(meta)?;
   let count = backend.open()?.count()?;
   Ok(ColdSnapshot { backend, count })
}

#[derive(Debug, Clone)]
pub struct CorrectionTask {
   pub dir:   PathBuf,
   pub entry: FileEntry,
   pub cold:  BackendDescriptor,
   /// Previous hot snapshot, i.e. the diff's old side.
   pub prev:  BackendDescriptor,
}

/// Corrects one diff file. Files needing no change are skipped and left
/// untouched on disk.
pub fn correct_file(task: &CorrectionTask) -> Outcome<FileCorrection> {
   match correct_inner(task) {
      Ok(Some(fix)) => Outcome::Done(fix),
      Ok(None) => Outcome::Skipped(format!("{} needs no correction", task.entry.name)),
      Err(err) => Outcome::Fatal(err),
   }
}

fn correct_inner(task: &CorrectionTask) -> Result<Option<FileCorrection>> {
   let path = task.dir.join(&task.entry.name);
   if !path.is_file() {
      return Err(DiffError::MissingFile(path.display().to_string()).into());
   }
   let mut file = DiffFile::read(&path)?;
   let cold = task.cold.open()?;
   let prev = task.prev.open()?;

   let mut removes_stripped = 0;
   let mut updates = Vec::with_capacity(file.update.len());
   for mut update in std::mem::take(&mut file.update) {
      let Some(cold_doc) = cold.get(&update.id)? else {
         updates.push(update);
         continue;
      };
      let before = update.patch.len();
      update.patch.retain(|op| !removes_cold_key(op, &cold_doc));
      removes_stripped += (before - update.patch.len()) as u64;
      if !update.patch.is_empty() {
         updates.push(update);
      }
   }

   let mut deletes_converted = 0;
   let mut deletes_dropped = 0;
   let mut deletes = Vec::with_capacity(file.delete.len());
   for id in std::mem::take(&mut file.delete) {
      match cold.get(&id)? {
         None => deletes.push(id),
         Some(cold_doc) => match hot_only_removal(&prev, &id, &cold_doc)? {
            Some(update) => {
               updates.push(update);
               deletes_converted += 1;
            },
            None => deletes_dropped += 1,
         },
      }
   }

   if removes_stripped == 0 && deletes_converted == 0 && deletes_dropped == 0 {
      return Ok(None);
   }
   file.update = updates;
   file.delete = deletes;
   let entry = file.write(&task.dir, &task.entry.name)?;
   tracing::debug!(
      file = %entry.name,
      removes_stripped,
      deletes_converted,
      deletes_dropped,
      "diff file corrected against cold collection"
   );
   Ok(Some(FileCorrection { entry, removes_stripped, deletes_converted, deletes_dropped }))
}

fn removes_cold_key(op: &PatchOp, cold_doc: &Value) -> bool {
   matches!(op, PatchOp::Remove { .. })
      && op
         .root_key()
         .is_some_and(|key| cold_doc.get(&key).is_some())
}

/// `keys(prev) - keys(cold)` as removals, or `None` when nothing is left to
/// remove.
fn hot_only_removal(prev: &Collection, id: &str, cold_doc: &Value) -> Result<Option<UpdateEntry>> {
   let Some(prev_doc) = prev.get(id)? else {
      return Ok(None);
   };
   let cold_keys: BTreeSet<&str> = root_keys(cold_doc).collect();
   let patch: Vec<PatchOp> = root_keys(&prev_doc)
      .filter(|k| *k != "_id" && !cold_keys.contains(k))
      .map(|k| PatchOp::Remove { path: pointer(&[k.to_string()]) })
      .collect();
   Ok((!patch.is_empty()).then(|| UpdateEntry { id: id.to_string(), patch }))
}

fn root_keys(doc: &Value) -> impl Iterator<Item = &str> {
   doc.as_object()
      .into_iter()
      .flat_map(|obj| obj.keys().map(String::as_str))
}

/// Post step of cold/hot diffs: corrects every file in `meta` in parallel,
/// then updates checksums and stats for the rewritten ones.
pub async fn correct(
   hub: &Hub,
   base: &JobInfo,
   dir: &Path,
   meta: &mut DiffMetadata,
) -> Result<()> {
   let cold = cold_backend(meta)?;
   let count = cold.open()?.count()?;
   match meta.diff.cold.as_ref().map(|c| c.count) {
      Some(seen) if seen != count => tracing::warn!(
         collection = %cold,
         content_step = seen,
         now = count,
         "cold collection changed since the content step; correction uses its current state"
      ),
      Some(_) => {},
      None => meta.diff.cold = Some(ColdSnapshot { backend: cold.clone(), count }),
   }

   let prev = meta.old.backend.clone();
   let batches = meta
      .diff
      .files
      .clone()
      .into_iter()
      .enumerate()
      .map(|(seq, entry)| {
         let task = CorrectionTask { dir: dir.to_path_buf(), entry, cold: cold.clone(), prev: prev.clone() };
         (seq, move || correct_file(&task))
      });
   let run = dispatch_batches(&hub.jobs, base, hub.config.inflight_batches(), batches, FirstError::new())
      .await?;

   let rewritten = run.done.len();
   let (mut stripped, mut converted, mut dropped) = (0, 0, 0);
   for (seq, fix) in run.done {
      stripped += fix.removes_stripped;
      converted += fix.deletes_converted;
      dropped += fix.deletes_dropped;
      if let Some(slot) = meta.diff.files.get_mut(seq) {
         *slot = fix.entry;
      }
   }
   meta.recompute_stats();
   tracing::info!(collection = %cold, rewritten, stripped, converted, dropped, "cold/hot correction done");
   Ok(())
}
