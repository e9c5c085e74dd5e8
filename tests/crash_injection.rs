#![cfg(feature = "failpoints")]

mod support;

use std::collections::BTreeSet;

use fail::FailScenario;
use hubpipe::{
   diff::{
      DiffMetadata, DiffRequest, DiffStep, DiffType, Differ,
      file::{DONE_DIR, DiffFile},
      reduce::{self, REDUCE_PLAN_FILE},
   },
   jobs::{JobCategory, JobInfo},
   ledger::JobStatus,
   store::BackendKind,
   sync::{SyncRequest, Syncer},
};
use serde_json::{Value, json};
use support::{TestHub, clone_collection, snapshot_docs};

fn docs(range: std::ops::Range<u32>, version: u32) -> Vec<Value> {
   range.map(|n| json!({"_id": format!("d{n:03}"), "v": version})).collect()
}

fn op_ids(dir: &std::path::Path, meta: &DiffMetadata) -> BTreeSet<String> {
   let mut ids = BTreeSet::new();
   for entry in &meta.diff.files {
      let file = DiffFile::read(&dir.join(&entry.name)).expect("diff file");
      ids.extend(file.ids().map(str::to_string));
   }
   ids
}

#[tokio::test]
async fn interrupted_reduce_finishes_its_journaled_plan() {
   let t = TestHub::new();
   let old = t.seed_target("old", &docs(0..4, 1), json!({}));
   let new = t.seed_target("new", &docs(2..7, 2), json!({}));
   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF_SELFCONTAINED);
   let folder = differ.diff_folder(&old, &new);
   let req = DiffRequest {
      batch_size: Some(1),
      steps: vec![DiffStep::Content],
      ..DiffRequest::new(old, new)
   };
   let mut meta = differ.diff(req).await.expect("content");
   let inputs: Vec<String> = meta.diff.files.iter().map(|f| f.name.clone()).collect();
   let ids_before = op_ids(&folder, &meta);
   assert!(inputs.len() > 1);

   let base = JobInfo::new(JobCategory::Diff, "new", "diff-reduce");
   let scenario = FailScenario::setup();
   fail::cfg("reduce.before_done_move", "return").unwrap();
   let err = reduce::reduce(&t.hub, &base, &folder, &mut meta.clone(), u64::MAX)
      .await
      .expect_err("expected failpoint error");
   assert!(err.to_string().contains("failpoint"));
   assert!(folder.join(REDUCE_PLAN_FILE).exists());
   assert!(folder.join("diff_r00000.json.gz").exists());
   assert!(inputs.iter().all(|name| folder.join(name).exists()));

   fail::remove("reduce.before_done_move");
   let result = reduce::reduce(&t.hub, &base, &folder, &mut meta, u64::MAX)
      .await
      .expect("resumed reduce");
   scenario.teardown();

   assert!(result.performed);
   assert_eq!(meta.diff.files.len(), 1);
   assert!(!folder.join(REDUCE_PLAN_FILE).exists());
   assert!(inputs.iter().all(|name| folder.join(DONE_DIR).join(name).exists()));
   assert_eq!(op_ids(&folder, &meta), ids_before);
   assert_eq!(DiffMetadata::load(&folder).unwrap().diff.files, meta.diff.files);
}

#[tokio::test]
async fn interrupted_sync_converges_on_rerun() {
   let t = TestHub::new();
   let old = t.seed_target("old", &docs(0..5, 1), json!({}));
   let new = t.seed_target("new", &docs(3..9, 2), json!({}));
   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF_SELFCONTAINED);
   let folder = differ.diff_folder(&old, &new);
   differ.diff(DiffRequest::new(old.clone(), new.clone())).await.expect("diff");

   let replica = t.target("replica");
   clone_collection(&old, &replica);
   let req = SyncRequest { target: Some(replica.clone()), ..SyncRequest::new(BackendKind::DocStore, &folder) };
   let syncer = Syncer::new(t.hub.clone());

   let scenario = FailScenario::setup();
   fail::cfg("sync.before_mark_synced", "return").unwrap();
   let err = syncer.sync(req.clone(), &mut ()).await.expect_err("expected failpoint error");
   assert!(err.to_string().contains("failpoint"));
   let snap = t.hub.ledger.get("new").unwrap();
   assert_eq!(snap.last_job("sync-docstore").unwrap().status, JobStatus::Failed);

   fail::remove("sync.before_mark_synced");
   let report = syncer.sync(req, &mut ()).await.expect("rerun");
   scenario.teardown();

   assert_eq!(report.files_skipped, 0);
   assert_eq!(snapshot_docs(&replica), snapshot_docs(&new));
   assert!(t.hub.ledger.get("new").unwrap().step_succeeded("sync-docstore"));
}
