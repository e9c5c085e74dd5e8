//! Status ledger for target snapshots.
//!
//! One JSON document per snapshot under `<hub>/hub/src_build/`. Every write
//! happens under an exclusive file lock and bumps `revision`, so a writer that
//! read revision N can only commit if nobody else committed in between.

use std::{
   collections::BTreeMap,
   fs,
   io::ErrorKind,
   path::{Path, PathBuf},
   time::Instant,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, error::Error, hub::HubLayout, lock::FileLock, util};

/// Marker key: an object carrying it replaces the destination subtree
/// instead of being deep-merged into it.
pub const REPLACE_SENTINEL: &str = "__REPLACE__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
   Pending,
   Building,
   Diffing,
   Syncing,
   Success,
   Failed,
}

/// Downstream actions flagged on a snapshot.
pub mod pending {
   pub const DIFF: &str = "diff";
   pub const RELEASE_NOTE: &str = "release_note";
   pub const PUBLISH: &str = "publish";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
   pub step:            String,
   pub status:          JobStatus,
   pub step_started_at: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub time_in_s:       Option<f64>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub pid:             Option<u32>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub err:             Option<String>,
   #[serde(flatten)]
   pub extra:           Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSnapshot {
   #[serde(rename = "_id")]
   pub target_name:   String,
   #[serde(default)]
   pub revision:      u64,
   #[serde(default)]
   pub build_config:  Value,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub build_version: Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub started_at:    Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub status:        Option<JobStatus>,
   #[serde(default)]
   pub jobs:          Vec<JobRecord>,
   #[serde(default)]
   pub merge_stats:   BTreeMap<String, u64>,
   #[serde(default)]
   pub mapping:       Value,
   #[serde(default, rename = "_meta")]
   pub meta:          Value,
   #[serde(default)]
   pub pending:       Vec<String>,
   #[serde(flatten)]
   pub extra:         Map<String, Value>,
}

impl TargetSnapshot {
   pub fn new(target_name: impl Into<String>) -> Self {
      Self { target_name: target_name.into(), ..Self::default() }
   }

   pub fn last_job(&self, step: &str) -> Option<&JobRecord> {
      self.jobs.iter().rev().find(|j| j.step == step)
   }

   /// Whether the most recent record for `step` succeeded.
   pub fn step_succeeded(&self, step: &str) -> bool {
      self
         .last_job(step)
         .is_some_and(|j| j.status == JobStatus::Success)
   }
}

/// Reference to the job record appended by [`Ledger::start_job`].
#[derive(Debug, Clone)]
pub struct JobHandle {
   pub target: String,
   pub step:   String,
   index:      usize,
   started:    Instant,
}

#[derive(Debug, Clone)]
pub struct Ledger {
   dir: PathBuf,
}

impl Ledger {
   pub fn new(dir: impl Into<PathBuf>) -> Self {
      Self { dir: dir.into() }
   }

   pub fn for_hub(layout: &HubLayout) -> Self {
      Self::new(layout.ledger_dir())
   }

   pub fn dir(&self) -> &Path {
      &self.dir
   }

   fn path(&self, target: &str) -> PathBuf {
      self.dir.join(format!("{target}.json"))
   }

   fn lock_path(&self, target: &str) -> PathBuf {
      self.dir.join(".locks").join(format!("{target}.lock"))
   }

   pub fn load(&self, target: &str) -> Result<Option<TargetSnapshot>> {
      let _lock = FileLock::acquire_shared(&self.lock_path(target))?;
      self.read(target)
   }

   pub fn get(&self, target: &str) -> Result<TargetSnapshot> {
      self.load(target)?.ok_or_else(|| Error::PreconditionNotMet {
         name:   target.to_string(),
         reason: "no status ledger entry for this snapshot".to_string(),
      })
   }

   /// Names of every snapshot with a ledger entry, sorted.
   pub fn list(&self) -> Result<Vec<String>> {
      let entries = match fs::read_dir(&self.dir) {
         Ok(entries) => entries,
         Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
         Err(e) => return Err(e.into()),
      };
      let mut names = Vec::new();
      for entry in entries {
         let path = entry?.path();
         if path.extension().and_then(|e| e.to_str()) == Some("json")
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
         {
            names.push(stem.to_string());
         }
      }
      names.sort();
      Ok(names)
   }

   /// Replaces whatever entry exists for the snapshot with `snapshot`.
   pub fn create(&self, mut snapshot: TargetSnapshot) -> Result<TargetSnapshot> {
      let _lock = FileLock::acquire_exclusive(&self.lock_path(&snapshot.target_name))?;
      let previous = self.read(&snapshot.target_name)?.map_or(0, |s| s.revision);
      snapshot.revision = previous + 1;
      util::write_json_atomic(&self.path(&snapshot.target_name), &snapshot)?;
      Ok(snapshot)
   }

   /// Read-modify-write under the snapshot's lock. When `expected_revision`
   /// is given the update is refused if the stored revision moved.
   pub fn update<F>(&self, target: &str, expected_revision: Option<u64>, f: F) -> Result<TargetSnapshot>
   where
      F: FnOnce(&mut TargetSnapshot) -> Result<()>,
   {
      let _lock = FileLock::acquire_exclusive(&self.lock_path(target))?;
      let mut snapshot = self
         .read(target)?
         .unwrap_or_else(|| TargetSnapshot::new(target));
      if let Some(expected) = expected_revision
         && snapshot.revision != expected
      {
         return Err(Error::LedgerConflict {
            target: target.to_string(),
            reason: format!("expected revision {expected}, found {}", snapshot.revision),
         });
      }
      f(&mut snapshot)?;
      snapshot.revision += 1;
      util::write_json_atomic(&self.path(target), &snapshot)?;
      Ok(snapshot)
   }

   /// Appends a job record for `step` and returns a handle to it.
   pub fn start_job(&self, target: &str, step: &str, status: JobStatus) -> Result<JobHandle> {
      let mut index = 0;
      self.update(target, None, |snap| {
         snap.jobs.push(JobRecord {
            step: step.to_string(),
            status,
            step_started_at: now(),
            time_in_s: None,
            pid: Some(std::process::id()),
            err: None,
            extra: Map::new(),
         });
         snap.status = Some(status);
         index = snap.jobs.len() - 1;
         Ok(())
      })?;
      tracing::debug!(snapshot = target, step = step, "job record started");
      Ok(JobHandle { target: target.to_string(), step: step.to_string(), index, started: Instant::now() })
   }

   /// Deep-merges `fields` into the handle's job record. Fails with
   /// [`Error::LedgerConflict`] if another record was appended since.
   pub fn merge_job(&self, handle: &JobHandle, fields: Value) -> Result<()> {
      self.update(&handle.target, None, |snap| {
         let is_last = snap.jobs.len() == handle.index + 1;
         let Some(record) = snap.jobs.get_mut(handle.index).filter(|r| is_last && r.step == handle.step)
         else {
            return Err(Error::LedgerConflict {
               target: handle.target.clone(),
               reason: format!("job record for {} is no longer the last entry", handle.step),
            });
         };
         let mut value = serde_json::to_value(&*record)?;
         deep_merge(&mut value, fields);
         *record = serde_json::from_value(value)?;
         snap.status = Some(record.status);
         Ok(())
      })?;
      Ok(())
   }

   /// Records the terminal status of a job, with elapsed time and the error
   /// string on failure.
   pub fn finish_job(&self, handle: &JobHandle, outcome: Result<(), &Error>) -> Result<()> {
      let elapsed = (handle.started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
      let fields = match outcome {
         Ok(()) => serde_json::json!({"status": JobStatus::Success, "time_in_s": elapsed}),
         Err(err) => serde_json::json!({
            "status": JobStatus::Failed,
            "time_in_s": elapsed,
            "err": err.to_string(),
         }),
      };
      self.merge_job(handle, fields)
   }

   /// Deep-merges `fields` into the snapshot document itself.
   pub fn merge_fields(&self, target: &str, fields: Value) -> Result<TargetSnapshot> {
      self.update(target, None, |snap| {
         let mut value = serde_json::to_value(&*snap)?;
         deep_merge(&mut value, fields);
         *snap = serde_json::from_value(value)?;
         Ok(())
      })
   }

   pub fn set_pending(&self, target: &str, action: &str) -> Result<()> {
      self.update(target, None, |snap| {
         if !snap.pending.iter().any(|p| p == action) {
            snap.pending.push(action.to_string());
         }
         Ok(())
      })?;
      Ok(())
   }

   pub fn clear_pending(&self, target: &str, action: &str) -> Result<()> {
      self.update(target, None, |snap| {
         snap.pending.retain(|p| p != action);
         Ok(())
      })?;
      Ok(())
   }

   fn read(&self, target: &str) -> Result<Option<TargetSnapshot>> {
      match fs::read_to_string(self.path(target)) {
         Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
         Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
         Err(e) => Err(e.into()),
      }
   }
}

pub fn now() -> String {
   Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Recursively merges `src` into `dst`. Objects merge key by key; any other
/// value overwrites. An object in `src` containing [`REPLACE_SENTINEL`]
/// replaces the destination subtree wholesale (the sentinel is stripped).
pub fn deep_merge(dst: &mut Value, src: Value) {
   match (dst, src) {
      (Value::Object(dst), Value::Object(src)) => {
         for (key, mut value) in src {
            let replace = value
               .as_object_mut()
               .is_some_and(|obj| obj.remove(REPLACE_SENTINEL).is_some());
            match dst.get_mut(&key) {
               Some(existing) if !replace => deep_merge(existing, value),
               _ => {
                  dst.insert(key, value);
               },
            }
         }
      },
      (dst, src) => *dst = src,
   }
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;

   #[test]
   fn deep_merge_merges_nested_objects() {
      let mut dst = json!({"a": {"x": 1, "y": 2}, "b": 1});
      deep_merge(&mut dst, json!({"a": {"y": 3, "z": 4}, "c": [1]}));
      assert_eq!(dst, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1, "c": [1]}));
   }

   #[test]
   fn replace_sentinel_swaps_subtree() {
      let mut dst = json!({"stats": {"old": 1, "keep": 2}});
      deep_merge(&mut dst, json!({"stats": {"__REPLACE__": true, "new": 3}}));
      assert_eq!(dst, json!({"stats": {"new": 3}}));
   }

   #[test]
   fn jobs_append_and_merge_into_last_record() {
      let dir = TempDir::new().unwrap();
      let ledger = Ledger::new(dir.path());
      ledger.create(TargetSnapshot::new("t1")).unwrap();

      let h = ledger.start_job("t1", "merge-root", JobStatus::Building).unwrap();
      ledger.merge_job(&h, json!({"merged": {"a": 3}})).unwrap();
      ledger.finish_job(&h, Ok(())).unwrap();

      let snap = ledger.get("t1").unwrap();
      assert_eq!(snap.jobs.len(), 1);
      assert_eq!(snap.jobs[0].status, JobStatus::Success);
      assert_eq!(snap.jobs[0].extra["merged"], json!({"a": 3}));
      assert!(snap.jobs[0].time_in_s.is_some());
      assert!(snap.step_succeeded("merge-root"));
   }

   #[test]
   fn stale_handle_is_refused() {
      let dir = TempDir::new().unwrap();
      let ledger = Ledger::new(dir.path());
      let first = ledger.start_job("t1", "merge-root", JobStatus::Building).unwrap();
      let _second = ledger.start_job("t1", "merge-others", JobStatus::Building).unwrap();
      let err = ledger.finish_job(&first, Ok(())).unwrap_err();
      assert!(matches!(err, Error::LedgerConflict { .. }));
   }

   #[test]
   fn update_checks_expected_revision() {
      let dir = TempDir::new().unwrap();
      let ledger = Ledger::new(dir.path());
      let snap = ledger.create(TargetSnapshot::new("t1")).unwrap();
      ledger
         .update("t1", Some(snap.revision), |s| {
            s.build_version = Some("20240101".to_string());
            Ok(())
         })
         .unwrap();
      let err = ledger.update("t1", Some(snap.revision), |_| Ok(())).unwrap_err();
      assert!(matches!(err, Error::LedgerConflict { .. }));
   }

   #[test]
   fn pending_flags_are_a_set() {
      let dir = TempDir::new().unwrap();
      let ledger = Ledger::new(dir.path());
      ledger.set_pending("t1", pending::DIFF).unwrap();
      ledger.set_pending("t1", pending::DIFF).unwrap();
      assert_eq!(ledger.get("t1").unwrap().pending, vec!["diff"]);
      ledger.clear_pending("t1", pending::DIFF).unwrap();
      assert!(ledger.get("t1").unwrap().pending.is_empty());
      assert_eq!(ledger.list().unwrap(), vec!["t1"]);
   }
}
