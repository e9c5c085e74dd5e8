//! Per-batch diff workers. Each worker opens its own collection handles and
//! writes at most one diff file.

use std::{collections::BTreeMap, path::PathBuf};

use serde_json::Value;

use super::{
   descriptor::FileEntry,
   file::{DiffFile, UpdateEntry, batch_file_name},
   jsondiff,
};
use crate::{
   Result,
   jobs::Outcome,
   store::{BackendDescriptor, doc_id},
};

/// Tallies top-level key presence over one batch of the new snapshot.
pub fn count_root_keys(new: &BackendDescriptor, ids: &[String]) -> Outcome<BTreeMap<String, u64>> {
   Outcome::from_result(count(new, ids))
}

fn count(new: &BackendDescriptor, ids: &[String]) -> Result<BTreeMap<String, u64>> {
   let coll = new.open()?;
   let mut counts = BTreeMap::new();
   for doc in coll.get_many(ids)? {
      if let Some(obj) = doc.as_object() {
         for key in obj.keys().filter(|k| k.as_str() != "_id") {
            *counts.entry(key.clone()).or_insert(0) += 1;
         }
      }
   }
   Ok(counts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
   /// Ids from the new snapshot: adds and updates.
   NewVsOld,
   /// Ids from the old snapshot: deletes.
   OldVsNew,
}

#[derive(Debug, Clone)]
pub struct ContentTask {
   pub seq:            usize,
   pub direction:      Direction,
   pub old:            BackendDescriptor,
   pub new:            BackendDescriptor,
   pub ids:            Vec<String>,
   pub exclude:        Vec<String>,
   pub self_contained: bool,
   pub out_dir:        PathBuf,
}

/// Computes one batch's add/update/delete sets and writes them if non-empty.
pub fn diff_batch(task: &ContentTask) -> Outcome<FileEntry> {
   let file = match task.direction {
      Direction::NewVsOld => new_vs_old(task),
      Direction::OldVsNew => old_vs_new(task),
   };
   match file {
      Ok(file) if file.is_empty() => Outcome::Skipped(format!("batch #{} has no changes", task.seq)),
      Ok(file) => Outcome::from_result(file.write(&task.out_dir, &batch_file_name(task.seq))),
      Err(err) => Outcome::Fatal(err),
   }
}

fn new_vs_old(task: &ContentTask) -> Result<DiffFile> {
   let old = task.old.open()?;
   let new = task.new.open()?;
   let mut file = DiffFile::new(task.new.identity());

   for new_doc in new.get_many(&task.ids)? {
      let Some(id) = doc_id(&new_doc).map(str::to_string) else {
         continue;
      };
      match old.get(&id)? {
         None if task.self_contained => file.add.push(new_doc),
         None => file.add.push(Value::String(id)),
         Some(old_doc) => {
            let patch = jsondiff::diff(&old_doc, &new_doc, &task.exclude);
            if !patch.is_empty() {
               file.update.push(UpdateEntry { id, patch });
            }
         },
      }
   }
   Ok(file)
}

fn old_vs_new(task: &ContentTask) -> Result<DiffFile> {
   let new = task.new.open()?;
   let mut file = DiffFile::new(task.new.identity());
   file.delete = task
      .ids
      .iter()
      .filter(|id| !new.contains(id))
      .cloned()
      .collect();
   Ok(file)
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;
   use crate::store::BackendKind;

   fn task(dir: &TempDir, direction: Direction, ids: &[&str], self_contained: bool) -> ContentTask {
      let data = dir.path().join("data");
      ContentTask {
         seq: 7,
         direction,
         old: BackendDescriptor::new(BackendKind::DocStore, &data, "target", "old"),
         new: BackendDescriptor::new(BackendKind::DocStore, &data, "target", "new"),
         ids: ids.iter().map(|s| s.to_string()).collect(),
         exclude: vec!["_timestamp".to_string()],
         self_contained,
         out_dir: dir.path().join("diff"),
      }
   }

   fn seed(t: &ContentTask) {
      t.old
         .open()
         .unwrap()
         .upsert_set(&[
            json!({"_id": "same", "v": 1, "_timestamp": "x"}),
            json!({"_id": "changed", "v": 1}),
            json!({"_id": "gone", "v": 1}),
         ])
         .unwrap();
      t.new
         .open()
         .unwrap()
         .upsert_set(&[
            json!({"_id": "same", "v": 1, "_timestamp": "y"}),
            json!({"_id": "changed", "v": 2}),
            json!({"_id": "fresh", "v": 1}),
         ])
         .unwrap();
   }

   #[test]
   fn new_vs_old_finds_adds_and_updates() {
      let dir = TempDir::new().unwrap();
      let t = task(&dir, Direction::NewVsOld, &["changed", "fresh", "same"], false);
      seed(&t);
      let Outcome::Done(entry) = diff_batch(&t) else { panic!("expected a diff file") };
      assert_eq!((entry.add, entry.update, entry.delete), (1, 1, 0));
      let file = DiffFile::read(&t.out_dir.join(&entry.name)).unwrap();
      assert_eq!(file.add, vec![json!("fresh")]);
      assert_eq!(file.update[0].id, "changed");
      assert_eq!(file.source, "new");
   }

   #[test]
   fn self_contained_adds_carry_documents() {
      let dir = TempDir::new().unwrap();
      let t = task(&dir, Direction::NewVsOld, &["fresh"], true);
      seed(&t);
      let Outcome::Done(entry) = diff_batch(&t) else { panic!("expected a diff file") };
      let file = DiffFile::read(&t.out_dir.join(&entry.name)).unwrap();
      assert_eq!(file.add, vec![json!({"_id": "fresh", "v": 1})]);
   }

   #[test]
   fn old_vs_new_finds_deletes_and_skips_empty() {
      let dir = TempDir::new().unwrap();
      let t = task(&dir, Direction::OldVsNew, &["changed", "gone", "same"], false);
      seed(&t);
      let Outcome::Done(entry) = diff_batch(&t) else { panic!("expected a diff file") };
      assert_eq!(entry.delete, 1);

      let t = task(&dir, Direction::OldVsNew, &["same"], false);
      assert!(matches!(diff_batch(&t), Outcome::Skipped(_)));
   }

   #[test]
   fn root_keys_are_counted() {
      let dir = TempDir::new().unwrap();
      let t = task(&dir, Direction::NewVsOld, &[], false);
      seed(&t);
      let ids: Vec<String> = ["same", "changed", "fresh"].iter().map(|s| s.to_string()).collect();
      let Outcome::Done(counts) = count_root_keys(&t.new, &ids) else { panic!("count failed") };
      assert_eq!(counts["v"], 3);
      assert_eq!(counts["_timestamp"], 1);
      assert!(!counts.contains_key("_id"));
   }
}
