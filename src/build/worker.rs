//! Merge worker: one id batch of one source into the target.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::{
   Result,
   jobs::Outcome,
   ledger,
   mapper::{DocCleaner, MapperRegistry},
   store::BackendDescriptor,
   util,
};

/// Everything a merge worker needs, as plain values. The worker opens its
/// own collection handles from the descriptors.
#[derive(Debug, Clone, Serialize)]
pub struct MergeTask {
   pub source:  String,
   pub batch:   usize,
   pub src:     BackendDescriptor,
   pub dest:    BackendDescriptor,
   pub ids:     Vec<String>,
   pub mapper:  String,
   /// Only root sources may create documents.
   pub upsert:  bool,
   #[serde(skip)]
   pub log_dir: PathBuf,
}

impl MergeTask {
   pub fn dump_path(&self) -> PathBuf {
      self
         .log_dir
         .join(format!("merge_{}_{}.json", self.source, self.batch))
   }
}

#[derive(Debug, Serialize)]
struct FailureDump<'a> {
   task:      &'a MergeTask,
   error:     String,
   log:       &'a [String],
   failed_at: String,
}

/// Runs a merge batch, returning the number of documents written.
///
/// On failure the task, the error and the worker's diagnostic log are dumped
/// to `<logs>/merge_<source>_<batch>.json` before the error is returned.
pub fn merge_batch(
   task: &MergeTask,
   mappers: &MapperRegistry,
   cleaner: Option<&DocCleaner>,
) -> Outcome<u64> {
   if task.ids.is_empty() {
      return Outcome::Skipped(format!("{} batch #{} has no ids", task.source, task.batch));
   }
   let mut log = Vec::new();
   match run(task, mappers, cleaner, &mut log) {
      Ok(written) => Outcome::Done(written),
      Err(err) => {
         let dump = FailureDump {
            task,
            error: err.to_string(),
            log: &log,
            failed_at: ledger::now(),
         };
         let path = task.dump_path();
         match util::write_json_atomic(&path, &dump) {
            Ok(()) => tracing::error!(
               source = %task.source,
               batch = task.batch,
               dump = %path.display(),
               "merge batch failed: {err}"
            ),
            Err(dump_err) => tracing::error!(
               source = %task.source,
               batch = task.batch,
               "merge batch failed: {err} (could not write dump: {dump_err})"
            ),
         }
         Outcome::Fatal(err)
      },
   }
}

fn run(
   task: &MergeTask,
   mappers: &MapperRegistry,
   cleaner: Option<&DocCleaner>,
   log: &mut Vec<String>,
) -> Result<u64> {
   let src = task.src.open()?;
   let dest = task.dest.open()?;

   let docs = src.get_many(&task.ids)?;
   log.push(format!("fetched {} of {} ids from {}", docs.len(), task.ids.len(), task.src));

   let docs: Vec<Value> = match cleaner {
      Some(clean) => docs.into_iter().filter_map(|d| clean(d)).collect(),
      None => docs,
   };
   log.push(format!("{} documents after cleaning", docs.len()));

   let mut mapper = mappers.instantiate(&task.mapper);
   if mapper.need_load() {
      log.push(format!("loading mapper {}", mapper.name()));
      mapper.load()?;
   }
   let docs = mapper.process(docs)?;
   log.push(format!("{} documents after mapper {}", docs.len(), mapper.name()));

   let written = if task.upsert {
      dest.upsert_set(&docs)?
   } else {
      dest.update_set(&docs)?
   };
   log.push(format!("wrote {written} documents to {} (upsert={})", task.dest, task.upsert));
   Ok(written)
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;
   use crate::{mapper::Mapper, store::BackendKind};

   fn task(dir: &TempDir, ids: &[&str], upsert: bool, mapper: &str) -> MergeTask {
      let root = dir.path().join("data");
      MergeTask {
         source: "a".to_string(),
         batch: 0,
         src: BackendDescriptor::new(BackendKind::DocStore, &root, "src", "a"),
         dest: BackendDescriptor::new(BackendKind::DocStore, &root, "target", "t"),
         ids: ids.iter().map(|s| s.to_string()).collect(),
         mapper: mapper.to_string(),
         upsert,
         log_dir: dir.path().join("logs"),
      }
   }

   struct Failing;

   impl Mapper for Failing {
      fn name(&self) -> &str {
         "failing"
      }

      fn process(&self, _docs: Vec<Value>) -> Result<Vec<Value>> {
         Err(crate::Error::Op { op: "mapper", reason: "bad record".to_string() })
      }
   }

   #[test]
   fn cleaner_drops_documents() {
      let dir = TempDir::new().unwrap();
      let t = task(&dir, &["1", "2"], true, "identity");
      t.src
         .open()
         .unwrap()
         .upsert_set(&[json!({"_id": "1", "keep": true}), json!({"_id": "2", "keep": false})])
         .unwrap();
      let cleaner: DocCleaner = std::sync::Arc::new(|d: Value| {
         d["keep"].as_bool().unwrap_or(false).then_some(d)
      });
      let out = merge_batch(&t, &MapperRegistry::new(), Some(&cleaner));
      assert!(matches!(out, Outcome::Done(1)));
      assert!(t.dest.open().unwrap().contains("1"));
      assert!(!t.dest.open().unwrap().contains("2"));
   }

   #[test]
   fn failure_writes_dump_file() {
      let dir = TempDir::new().unwrap();
      let t = task(&dir, &["1"], true, "failing");
      t.src.open().unwrap().upsert_set(&[json!({"_id": "1"})]).unwrap();
      let mut reg = MapperRegistry::new();
      reg.register("failing", || Failing);
      let out = merge_batch(&t, &reg, None);
      assert!(out.is_fatal());
      let dump: Value =
         serde_json::from_str(&std::fs::read_to_string(t.dump_path()).unwrap()).unwrap();
      assert!(dump["error"].as_str().unwrap().contains("bad record"));
      assert_eq!(dump["task"]["source"], "a");
   }

   #[test]
   fn empty_batch_is_skipped() {
      let dir = TempDir::new().unwrap();
      let t = task(&dir, &[], true, "identity");
      assert!(matches!(merge_batch(&t, &MapperRegistry::new(), None), Outcome::Skipped(_)));
   }
}
