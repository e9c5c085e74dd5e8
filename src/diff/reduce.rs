//! Diff reduction: merges many small diff files into size-bounded chunks.
//!
//! The chunk plan is journaled to `reduce_plan.json` before any file moves,
//! and every chunk worker is idempotent, so a reducer interrupted at any
//! point finishes the same plan when re-run.

use std::{
   fs,
   io::ErrorKind,
   path::{Path, PathBuf},
   time::Instant,
};

use serde::{Deserialize, Serialize};

use super::{
   descriptor::{DiffMetadata, FileEntry},
   file::{DONE_DIR, DiffFile, reduced_file_name},
};
use crate::{
   Result,
   error::{DiffError, Error},
   hub::Hub,
   jobs::{FirstError, JobInfo, Outcome, dispatch_batches},
   util::{self, fail_point},
};

pub const REDUCE_PLAN_FILE: &str = "reduce_plan.json";

#[derive(Debug, Clone, Serialize)]
pub struct ReduceResult {
   pub performed:    bool,
   pub reason:       Option<String>,
   pub files_before: usize,
   pub files_after:  usize,
   pub renamed:      usize,
   pub merged:       usize,
   pub duration_ms:  u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ReducePlan {
   max_size: u64,
   chunks:   Vec<Vec<FileEntry>>,
}

/// Groups files in order, closing a chunk as soon as its accumulated size
/// reaches `max_size`. Returns indexes into `sizes`.
pub fn plan_chunks(sizes: &[u64], max_size: u64) -> Vec<Vec<usize>> {
   let mut chunks = Vec::new();
   let mut current = Vec::new();
   let mut acc = 0u64;
   for (i, size) in sizes.iter().enumerate() {
      current.push(i);
      acc += size;
      if acc >= max_size {
         chunks.push(std::mem::take(&mut current));
         acc = 0;
      }
   }
   if !current.is_empty() {
      chunks.push(current);
   }
   chunks
}

#[derive(Debug, Clone)]
pub struct ChunkTask {
   pub seq:    usize,
   pub dir:    PathBuf,
   pub inputs: Vec<FileEntry>,
}

impl ChunkTask {
   fn output_name(&self) -> String {
      reduced_file_name(self.seq)
   }

   fn done_dir(&self) -> PathBuf {
      self.dir.join(DONE_DIR)
   }

   /// Where an input currently lives: in the diff dir or already in `.done`.
   fn input_path(&self, name: &str) -> Option<PathBuf> {
      [self.dir.join(name), self.done_dir().join(name)]
         .into_iter()
         .find(|p| p.is_file())
   }
}

/// Produces the chunk's output file. Single-file chunks are renamed; larger
/// chunks are concatenated and their inputs moved to `.done`.
pub fn reduce_chunk(task: &ChunkTask) -> Outcome<FileEntry> {
   let result = match task.inputs.as_slice() {
      [] => return Outcome::Skipped(format!("chunk #{} is empty", task.seq)),
      [single] => rename_single(task, single),
      _ => merge_chunk(task),
   };
   Outcome::from_result(result)
}

fn rename_single(task: &ChunkTask, input: &FileEntry) -> Result<FileEntry> {
   let output = task.output_name();
   let from = task.dir.join(&input.name);
   let to = task.dir.join(&output);
   if from.is_file() {
      fs::rename(&from, &to)?;
      util::fsync_dir(&task.dir)?;
   } else if !to.is_file() {
      return Err(DiffError::MissingFile(from.display().to_string()).into());
   }
   Ok(FileEntry { name: output, ..input.clone() })
}

fn merge_chunk(task: &ChunkTask) -> Result<FileEntry> {
   let output = task.output_name();
   let out_path = task.dir.join(&output);
   let all_done = task
      .inputs
      .iter()
      .all(|input| task.done_dir().join(&input.name).is_file());

   if !(all_done && out_path.is_file()) {
      let mut merged: Option<DiffFile> = None;
      for input in &task.inputs {
         let path = task
            .input_path(&input.name)
            .ok_or_else(|| DiffError::MissingFile(input.name.clone()))?;
         let file = DiffFile::read(&path)?;
         match merged.as_mut() {
            None => merged = Some(file),
            Some(acc) => {
               if acc.source != file.source {
                  return Err(Error::Invariant {
                     op:     "reduce",
                     reason: format!(
                        "{} comes from {} but chunk #{} holds files from {}",
                        input.name, file.source, task.seq, acc.source
                     ),
                  });
               }
               acc.add.extend(file.add);
               acc.update.extend(file.update);
               acc.delete.extend(file.delete);
               if file.timestamp > acc.timestamp {
                  acc.timestamp = file.timestamp;
               }
            },
         }
      }
      let Some(merged) = merged else {
         return Err(Error::Invariant { op: "reduce", reason: format!("chunk #{} has no inputs", task.seq) });
      };
      merged.write(&task.dir, &output)?;
      fail_point("reduce.before_done_move")?;
   }

   fs::create_dir_all(task.done_dir())?;
   for input in &task.inputs {
      let from = task.dir.join(&input.name);
      if from.is_file() {
         fs::rename(&from, task.done_dir().join(&input.name))?;
      }
   }
   util::fsync_dir(&task.dir)?;

   Ok(FileEntry {
      name:   output,
      md5sum: util::md5_file(&out_path)?,
      add:    task.inputs.iter().map(|f| f.add).sum(),
      update: task.inputs.iter().map(|f| f.update).sum(),
      delete: task.inputs.iter().map(|f| f.delete).sum(),
   })
}

/// Reduces the diff files listed in `meta` and rewrites its file list and
/// stats. `metadata.json` is saved before the plan journal is removed.
pub async fn reduce(
   hub: &Hub,
   base: &JobInfo,
   dir: &Path,
   meta: &mut DiffMetadata,
   max_size: u64,
) -> Result<ReduceResult> {
   let start = Instant::now();
   let files_before = meta.diff.files.len();
   let plan = match load_plan(dir)? {
      Some(plan) => {
         tracing::info!(dir = %dir.display(), chunks = plan.chunks.len(), "resuming reduce plan");
         plan
      },
      None => {
         if meta.diff.files.is_empty() || meta.diff.files.iter().all(|f| f.name.starts_with("diff_r")) {
            return Ok(ReduceResult {
               performed: false,
               reason: Some("nothing to reduce".to_string()),
               files_before,
               files_after: files_before,
               renamed: 0,
               merged: 0,
               duration_ms: start.elapsed().as_millis() as u64,
            });
         }
         let plan = make_plan(dir, &meta.diff.files, max_size)?;
         util::write_json_atomic(&dir.join(REDUCE_PLAN_FILE), &plan)?;
         plan
      },
   };

   let renamed = plan.chunks.iter().filter(|c| c.len() == 1).count();
   let merged = plan.chunks.len() - renamed;
   let batches = plan
      .chunks
      .iter()
      .cloned()
      .enumerate()
      .map(|(seq, inputs)| {
         let task = ChunkTask { seq, dir: dir.to_path_buf(), inputs };
         (seq, move || reduce_chunk(&task))
      });
   let run = dispatch_batches(&hub.jobs, base, hub.config.inflight_batches(), batches, FirstError::new())
      .await?;

   meta.diff.files = run.values().collect();
   meta.recompute_stats();
   meta.save(dir)?;
   match fs::remove_file(dir.join(REDUCE_PLAN_FILE)) {
      Ok(()) => {},
      Err(e) if e.kind() == ErrorKind::NotFound => {},
      Err(e) => return Err(e.into()),
   }

   let result = ReduceResult {
      performed: true,
      reason: None,
      files_before,
      files_after: meta.diff.files.len(),
      renamed,
      merged,
      duration_ms: start.elapsed().as_millis() as u64,
   };
   tracing::info!(
      dir = %dir.display(),
      before = result.files_before,
      after = result.files_after,
      renamed,
      merged,
      "diff files reduced"
   );
   Ok(result)
}

/// Drops a leftover journal, e.g. before recomputing content from scratch.
pub fn discard_plan(dir: &Path) -> Result<()> {
   match fs::remove_file(dir.join(REDUCE_PLAN_FILE)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
   }
}

fn make_plan(dir: &Path, files: &[FileEntry], max_size: u64) -> Result<ReducePlan> {
   let mut files = files.to_vec();
   files.sort_by(|a, b| a.name.cmp(&b.name));
   let mut sizes = Vec::with_capacity(files.len());
   for file in &files {
      let path = dir.join(&file.name);
      let size = fs::metadata(&path).map_err(|e| match e.kind() {
         ErrorKind::NotFound => Error::from(DiffError::MissingFile(path.display().to_string())),
         _ => e.into(),
      })?;
      sizes.push(size.len());
   }
   let chunks = plan_chunks(&sizes, max_size)
      .into_iter()
      .map(|chunk| chunk.into_iter().map(|i| files[i].clone()).collect())
      .collect();
   Ok(ReducePlan { max_size, chunks })
}

fn load_plan(dir: &Path) -> Result<Option<ReducePlan>> {
   match fs::read_to_string(dir.join(REDUCE_PLAN_FILE)) {
      Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
   }
}
