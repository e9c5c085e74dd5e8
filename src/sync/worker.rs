//! Per-backend replay of one diff file.

use std::{ops::AddAssign, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
   Result,
   diff::{
      FileEntry,
      file::{DiffFile, is_synced, mark_synced},
      jsondiff,
   },
   error::DiffError,
   jobs::Outcome,
   store::{BackendDescriptor, BackendKind, Collection, chunk_ids},
   util::{self, fail_point},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
   pub added:   u64,
   pub updated: u64,
   pub deleted: u64,
   pub skipped: u64,
}

impl SyncCounts {
   pub const fn all_skipped(total: u64) -> Self {
      Self { added: 0, updated: 0, deleted: 0, skipped: total }
   }

   pub const fn applied(&self) -> u64 {
      self.added + self.updated + self.deleted
   }
}

impl AddAssign for SyncCounts {
   fn add_assign(&mut self, rhs: Self) {
      self.added += rhs.added;
      self.updated += rhs.updated;
      self.deleted += rhs.deleted;
      self.skipped += rhs.skipped;
   }
}

/// Everything a worker needs to replay one file; opens its own handles.
#[derive(Debug, Clone)]
pub struct SyncTask {
   pub dir:            PathBuf,
   pub entry:          FileEntry,
   pub target:         BackendDescriptor,
   /// Snapshot that add ids are fetched from.
   pub new:            BackendDescriptor,
   pub self_contained: bool,
   pub batch_size:     usize,
}

/// Replays diff files onto one kind of backend.
///
/// The default [`SyncWorker::sync_file`] implements the shared protocol:
/// create-only adds, patch updates where a conflicting patch is a skip, and
/// the `.synced` rename as the commit point. Backends differ in how they
/// account deletes.
pub trait SyncWorker: Send + Sync {
   fn backend(&self) -> BackendKind;

   /// Removes `id` from `target` and records the outcome in `counts`.
   fn delete(&self, target: &Collection, id: &str, counts: &mut SyncCounts) -> Result<()>;

   fn sync_file(&self, task: &SyncTask) -> Outcome<SyncCounts> {
      if is_synced(&task.dir, &task.entry.name) {
         return Outcome::Done(SyncCounts::all_skipped(task.entry.total_ops()));
      }
      Outcome::from_result(replay(self, task))
   }
}

fn replay<W: SyncWorker + ?Sized>(worker: &W, task: &SyncTask) -> Result<SyncCounts> {
   let path = task.dir.join(&task.entry.name);
   if !path.is_file() {
      return Err(DiffError::MissingFile(path.display().to_string()).into());
   }
   let found = util::md5_file(&path)?;
   if found != task.entry.md5sum {
      return Err(DiffError::ChecksumMismatch {
         file: task.entry.name.clone(),
         expected: task.entry.md5sum.clone(),
         found,
      }
      .into());
   }

   let file = DiffFile::read(&path)?;
   let target = task.target.open()?;
   target.create()?;
   let mut counts = SyncCounts::default();

   add_documents(task, &target, &file.add, &mut counts)?;
   for update in &file.update {
      let Some(current) = target.get(&update.id)? else {
         counts.skipped += 1;
         continue;
      };
      match jsondiff::apply(&current, &update.patch) {
         Ok(patched) if patched != current => {
            target.replace(&patched)?;
            counts.updated += 1;
         },
         Ok(_) => counts.skipped += 1,
         Err(err) => {
            tracing::debug!(id = %update.id, "patch no longer applies: {err}");
            counts.skipped += 1;
         },
      }
   }
   for id in &file.delete {
      worker.delete(&target, id, &mut counts)?;
   }

   fail_point("sync.before_mark_synced")?;
   mark_synced(&task.dir, &task.entry.name)?;
   tracing::debug!(
      file = %task.entry.name,
      collection = %task.target,
      added = counts.added,
      updated = counts.updated,
      deleted = counts.deleted,
      skipped = counts.skipped,
      "diff file synced"
   );
   Ok(counts)
}

/// Create-only writes; an existing document is a replay and counts as
/// skipped.
fn add_documents(task: &SyncTask, target: &Collection, add: &[Value], counts: &mut SyncCounts) -> Result<()> {
   let insert = |doc: &Value, counts: &mut SyncCounts| -> Result<()> {
      if target.insert_new(doc)? {
         counts.added += 1;
      } else {
         counts.skipped += 1;
      }
      Ok(())
   };

   if task.self_contained {
      for doc in add {
         insert(doc, counts)?;
      }
      return Ok(());
   }

   let ids: Vec<String> = add
      .iter()
      .filter_map(Value::as_str)
      .map(str::to_string)
      .collect();
   let source = task.new.open()?;
   for batch in chunk_ids(ids, task.batch_size) {
      let docs = source.get_many(&batch)?;
      if docs.len() < batch.len() {
         let missing = (batch.len() - docs.len()) as u64;
         tracing::warn!(collection = %task.new, missing, "added ids vanished from the new snapshot");
         counts.skipped += missing;
      }
      for doc in &docs {
         insert(doc, counts)?;
      }
   }
   Ok(())
}

/// Plain document store: deletes of absent documents are not counted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocStoreWorker;

impl SyncWorker for DocStoreWorker {
   fn backend(&self) -> BackendKind {
      BackendKind::DocStore
   }

   fn delete(&self, target: &Collection, id: &str, counts: &mut SyncCounts) -> Result<()> {
      if target.remove(id)? {
         counts.deleted += 1;
      }
      Ok(())
   }
}

/// Search index: separates "deleted" from "already absent".
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexWorker;

impl SyncWorker for IndexWorker {
   fn backend(&self) -> BackendKind {
      BackendKind::Index
   }

   fn delete(&self, target: &Collection, id: &str, counts: &mut SyncCounts) -> Result<()> {
      if target.remove(id)? {
         counts.deleted += 1;
      } else {
         counts.skipped += 1;
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;
   use crate::diff::{
      file::{UpdateEntry, batch_file_name},
      jsondiff::PatchOp,
   };

   struct Fixture {
      _dir: TempDir,
      task: SyncTask,
   }

   fn fixture() -> Fixture {
      let dir = TempDir::new().unwrap();
      let data = dir.path().join("data");
      let target = BackendDescriptor::new(BackendKind::Index, &data, "target", "old");
      let new = BackendDescriptor::new(BackendKind::DocStore, &data, "target", "new");
      target
         .open()
         .unwrap()
         .upsert_set(&[json!({"_id": "u", "v": 1}), json!({"_id": "d", "v": 1})])
         .unwrap();
      new.open()
         .unwrap()
         .upsert_set(&[json!({"_id": "a", "v": 1}), json!({"_id": "u", "v": 2})])
         .unwrap();

      let mut file = DiffFile::new("new");
      file.add = vec![json!("a")];
      file.update = vec![UpdateEntry {
         id:    "u".to_string(),
         patch: vec![PatchOp::Replace { path: "/v".into(), value: json!(2) }],
      }];
      file.delete = vec!["d".to_string(), "never".to_string()];
      let out = dir.path().join("diff");
      let entry = file.write(&out, &batch_file_name(0)).unwrap();
      let task = SyncTask { dir: out, entry, target, new, self_contained: false, batch_size: 10 };
      Fixture { _dir: dir, task }
   }

   #[test]
   fn replay_applies_then_commits() {
      let fx = fixture();
      let Outcome::Done(counts) = IndexWorker.sync_file(&fx.task) else { panic!("sync failed") };
      assert_eq!(counts, SyncCounts { added: 1, updated: 1, deleted: 1, skipped: 1 });
      assert!(is_synced(&fx.task.dir, &fx.task.entry.name));

      let target = fx.task.target.open().unwrap();
      assert_eq!(target.get("u").unwrap(), Some(json!({"_id": "u", "v": 2})));
      assert!(!target.contains("d"));

      let Outcome::Done(again) = IndexWorker.sync_file(&fx.task) else { panic!("resync failed") };
      assert_eq!(again, SyncCounts::all_skipped(4));
   }

   #[test]
   fn docstore_does_not_count_absent_deletes() {
      let fx = fixture();
      let Outcome::Done(counts) = DocStoreWorker.sync_file(&fx.task) else { panic!("sync failed") };
      assert_eq!(counts.deleted, 1);
      assert_eq!(counts.skipped, 0);
   }

   #[test]
   fn replaying_without_marker_skips_everything() {
      let fx = fixture();
      let _ = IndexWorker.sync_file(&fx.task);
      crate::diff::file::reset_synced(&fx.task.dir).unwrap();
      let Outcome::Done(counts) = IndexWorker.sync_file(&fx.task) else { panic!("replay failed") };
      assert_eq!(counts.applied(), 0);
      assert_eq!(counts.skipped, 4);
   }

   #[test]
   fn tampered_file_is_fatal() {
      let fx = fixture();
      let mut task = fx.task.clone();
      task.entry.md5sum = "0".repeat(32);
      assert!(matches!(
         IndexWorker.sync_file(&task),
         Outcome::Fatal(crate::Error::Diff(DiffError::ChecksumMismatch { .. }))
      ));
   }
}
