mod support;

use std::{collections::BTreeMap, fs};

use hubpipe::{
   Error,
   diff::{
      DiffMetadata, DiffMode, DiffRequest, DiffStep, DiffType, Differ,
      file::DiffFile,
      jsondiff,
   },
   error::{DiffError, StoreError},
   ledger::{JobStatus, pending},
};
use serde_json::{Value, json};
use support::{TestHub, gene};

fn mapping() -> Value {
   json!({"symbol": {"type": "keyword"}, "taxid": {"type": "integer"}})
}

/// Reads back every op of a finished diff set, keyed by kind.
fn collect_ops(dir: &std::path::Path, meta: &DiffMetadata) -> (Vec<Value>, BTreeMap<String, Value>, Vec<String>) {
   let (mut adds, mut updates, mut deletes) = (Vec::new(), BTreeMap::new(), Vec::new());
   for entry in &meta.diff.files {
      let file = DiffFile::read(&dir.join(&entry.name)).expect("diff file");
      adds.extend(file.add);
      for u in file.update {
         updates.insert(u.id, serde_json::to_value(&u.patch).unwrap());
      }
      deletes.extend(file.delete);
   }
   deletes.sort();
   (adds, updates, deletes)
}

#[tokio::test]
async fn diffing_a_snapshot_against_itself_is_empty() {
   let t = TestHub::new();
   let snap = t.seed_target(
      "genedoc_1",
      &[gene("g1", "CDK2", 9606), gene("g2", "TP53", 9606), gene("g3", "BRCA1", 9606)],
      mapping(),
   );

   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF);
   let meta = differ.diff(DiffRequest::new(snap.clone(), snap.clone())).await.expect("diff");

   assert_eq!(meta.diff.stats.add, 0);
   assert_eq!(meta.diff.stats.update, 0);
   assert_eq!(meta.diff.stats.delete, 0);
   assert!(!meta.diff.stats.mapping_changed);
   assert!(meta.diff.files.is_empty());
   assert_eq!(meta.diff.version, "genedoc_1.genedoc_1");
   assert!(meta.is_consistent());
}

#[tokio::test]
async fn self_contained_diff_carries_adds_updates_and_deletes() {
   let t = TestHub::new();
   let old = t.seed_target(
      "genedoc_old",
      &[gene("g1", "CDK2", 9606), gene("g2", "TP53", 9606), gene("g3", "BRCA1", 9606)],
      mapping(),
   );
   let new = t.seed_target(
      "genedoc_new",
      &[gene("g2", "TP53", 10090), gene("g3", "BRCA1", 9606), gene("g4", "EGFR", 9606)],
      mapping(),
   );

   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF_SELFCONTAINED);
   let folder = differ.diff_folder(&old, &new);
   let meta = differ.diff(DiffRequest::new(old, new)).await.expect("diff");

   assert_eq!((meta.diff.stats.add, meta.diff.stats.update, meta.diff.stats.delete), (1, 1, 1));
   assert_eq!(meta.diff.version, "genedoc_old.genedoc_new");
   assert_eq!(meta.diff.func, "jsondiff-selfcontained");
   assert!(meta.is_consistent());

   let (adds, updates, deletes) = collect_ops(&folder, &meta);
   assert_eq!(adds, vec![gene("g4", "EGFR", 9606)]);
   assert_eq!(deletes, vec!["g1".to_string()]);
   assert_eq!(updates["g2"], json!([{"op": "replace", "path": "/taxid", "value": 10090}]));

   let on_disk = DiffMetadata::load(&folder).expect("metadata");
   assert_eq!(on_disk.diff.stats, meta.diff.stats);
   assert_eq!(on_disk.diff.stats.root_keys, Some(BTreeMap::from([
      ("symbol".to_string(), 3),
      ("taxid".to_string(), 3),
   ])));

   let snap = t.hub.ledger.get("genedoc_new").unwrap();
   assert!(snap.pending.iter().any(|p| p == pending::RELEASE_NOTE));
   assert!(!snap.pending.iter().any(|p| p == pending::DIFF));
   assert_eq!(snap.extra["diff"]["stats"]["add"], json!(1));
   for step in DiffStep::ALL {
      assert!(snap.step_succeeded(&format!("diff-{step}")), "{step}");
   }
}

#[tokio::test]
async fn plain_diff_adds_are_ids_only() {
   let t = TestHub::new();
   let old = t.seed_target("p_old", &[gene("g1", "CDK2", 9606)], mapping());
   let new = t.seed_target("p_new", &[gene("g1", "CDK2", 9606), gene("g9", "KRAS", 9606)], mapping());

   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF);
   let folder = differ.diff_folder(&old, &new);
   let meta = differ.diff(DiffRequest::new(old, new)).await.expect("diff");
   let (adds, _, _) = collect_ops(&folder, &meta);
   assert_eq!(adds, vec![json!("g9")]);
}

#[tokio::test]
async fn excluded_fields_do_not_produce_updates() {
   let t = TestHub::new();
   let old = t.seed_target("e_old", &[json!({"_id": "a", "v": 1, "_timestamp": "2024-01-01"})], json!({}));
   let new = t.seed_target("e_new", &[json!({"_id": "a", "v": 1, "_timestamp": "2024-06-01"})], json!({}));

   let meta = Differ::new(t.hub.clone(), DiffType::JSONDIFF)
      .diff(DiffRequest::new(old, new))
      .await
      .expect("diff");
   assert_eq!(meta.diff.stats.update, 0);
   assert_eq!(meta.diff.info.exclude, vec!["_timestamp".to_string()]);
}

#[tokio::test]
async fn retracting_a_mapping_field_fails_before_any_content() {
   let t = TestHub::new();
   let old = t.seed_target("m_old", &[gene("g1", "CDK2", 9606)], mapping());
   let new = t.seed_target(
      "m_new",
      &[gene("g1", "CDK2", 9606)],
      json!({"symbol": {"type": "keyword"}}),
   );

   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF);
   let folder = differ.diff_folder(&old, &new);
   let err = differ.diff(DiffRequest::new(old, new)).await.unwrap_err();
   assert!(matches!(err, Error::Diff(DiffError::NonAdditiveMapping { .. })), "{err}");
   assert_eq!(err.exit_code(), 4);

   let names: Vec<String> = fs::read_dir(&folder)
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect();
   assert_eq!(names, vec!["metadata.json".to_string()]);

   let snap = t.hub.ledger.get("m_new").unwrap();
   assert_eq!(snap.last_job("diff-mapping").unwrap().status, JobStatus::Failed);
   assert!(snap.last_job("diff-content").is_none());
}

#[tokio::test]
async fn added_mapping_fields_are_written_as_a_patch() {
   let t = TestHub::new();
   let old = t.seed_target("a_old", &[gene("g1", "CDK2", 9606)], json!({"symbol": {"type": "keyword"}}));
   let new = t.seed_target("a_new", &[gene("g1", "CDK2", 9606)], mapping());

   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF);
   let folder = differ.diff_folder(&old, &new);
   let meta = differ.diff(DiffRequest::new(old, new)).await.expect("diff");

   assert!(meta.diff.stats.mapping_changed);
   let entry = meta.diff.mapping_file.expect("mapping entry");
   let raw = fs::read(folder.join(&entry.name)).unwrap();
   assert_eq!(hubpipe::util::md5_hex(&raw), entry.md5sum);
   let patch: jsondiff::Patch = serde_json::from_slice(&raw).unwrap();
   assert_eq!(
      serde_json::to_value(&patch).unwrap(),
      json!([{"op": "add", "path": "/taxid", "value": {"type": "integer"}}])
   );
}

#[tokio::test]
async fn existing_folder_needs_a_mode() {
   let t = TestHub::new();
   let old = t.seed_target("r_old", &[gene("g1", "CDK2", 9606)], mapping());
   let new = t.seed_target("r_new", &[gene("g1", "CDK2", 9606), gene("g2", "TP53", 9606)], mapping());
   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF);

   differ.diff(DiffRequest::new(old.clone(), new.clone())).await.expect("first diff");
   let err = differ.diff(DiffRequest::new(old.clone(), new.clone())).await.unwrap_err();
   assert!(matches!(err, Error::Diff(DiffError::DirectoryNotEmpty(_))), "{err}");

   let purge = DiffRequest { mode: Some(DiffMode::Purge), ..DiffRequest::new(old.clone(), new.clone()) };
   let meta = differ.diff(purge).await.expect("purged diff");
   assert_eq!(meta.diff.stats.add, 1);

   let wrong_type = Differ::new(t.hub.clone(), DiffType::JSONDIFF_SELFCONTAINED);
   let resume = DiffRequest {
      mode: Some(DiffMode::Resume),
      steps: vec![DiffStep::Post],
      ..DiffRequest::new(old, new)
   };
   assert!(wrong_type.diff(resume).await.is_err());
}

#[tokio::test]
async fn missing_snapshot_is_reported() {
   let t = TestHub::new();
   let old = t.seed_target("x_old", &[gene("g1", "CDK2", 9606)], mapping());
   let err = Differ::new(t.hub.clone(), DiffType::JSONDIFF)
      .diff(DiffRequest::new(old, t.target("x_missing")))
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Store(StoreError::NoSuchCollection(_))), "{err}");
}

#[tokio::test]
async fn cold_hot_diff_requires_a_cold_collection() {
   let t = TestHub::new();
   let old = t.seed_target("c_old", &[gene("g1", "CDK2", 9606)], mapping());
   let new = t.seed_target("c_new", &[gene("g1", "CDK2", 9606)], mapping());
   let err = Differ::new(t.hub.clone(), DiffType::COLDHOT_JSONDIFF)
      .diff(DiffRequest::new(old, new))
      .await
      .unwrap_err();
   assert_eq!(err.exit_code(), 2, "{err}");
}
