mod support;

use std::{
   collections::HashMap,
   fs,
   path::{Path, PathBuf},
};

use hubpipe::{
   diff::{DiffRequest, DiffType, Differ},
   lease::WriterLease,
};
use jsonschema::JSONSchema;
use serde_json::{Value, json};
use support::{TestHub, gene};

fn load_schemas(root: &Path) -> HashMap<String, JSONSchema> {
   let schema_dir = root.join("schemas");
   let mut schemas = HashMap::new();
   for entry in fs::read_dir(schema_dir).expect("schema dir") {
      let entry = entry.expect("schema entry");
      let path = entry.path();
      if !path.is_file() {
         continue;
      }
      let name = path
         .file_name()
         .and_then(|n| n.to_str())
         .and_then(|n| n.strip_suffix(".schema.json"))
         .expect("schema file name");
      let raw = fs::read_to_string(&path).expect("schema read");
      let json: Value = serde_json::from_str(&raw).expect("schema json");
      let schema = JSONSchema::compile(&json).expect("schema compile");
      schemas.insert(name.to_string(), schema);
   }
   schemas
}

fn validate_instance(schema: &JSONSchema, instance: &Value, label: &str) {
   if let Err(errors) = schema.validate(instance) {
      let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
      panic!("schema validation failed for {label}: {}", messages.join("; "));
   }
}

fn fixture_paths(root: &Path, subdir: &str) -> Vec<PathBuf> {
   let dir = root.join(subdir);
   if !dir.exists() {
      return Vec::new();
   }
   let mut out = Vec::new();
   for entry in fs::read_dir(dir).expect("fixture dir") {
      let entry = entry.expect("fixture entry");
      let path = entry.path();
      if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("json") {
         out.push(path);
      }
   }
   out
}

fn read_json(path: &Path) -> Value {
   let raw = fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
   serde_json::from_str(&raw).unwrap_or_else(|e| panic!("parse {}: {e}", path.display()))
}

#[test]
fn fixtures_validate_against_schemas() {
   let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
   let schemas = load_schemas(&root);
   let fixtures = fixture_paths(&root, "tests/fixtures/schemas");
   assert!(!fixtures.is_empty());

   for path in fixtures {
      let name = path
         .file_stem()
         .and_then(|n| n.to_str())
         .expect("fixture name");
      let schema = schemas
         .get(name)
         .unwrap_or_else(|| panic!("schema not found for fixture: {name}"));
      validate_instance(schema, &read_json(&path), &format!("fixture {name} ({})", path.display()));
   }
}

#[test]
fn forward_compat_fixtures_fail_validation() {
   let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
   let schemas = load_schemas(&root);
   let fixtures = fixture_paths(&root, "tests/fixtures/schemas/forward");

   for path in fixtures {
      let name = path
         .file_stem()
         .and_then(|n| n.to_str())
         .expect("fixture name");
      let schema_name = name.trim_end_matches("_v99").to_string();
      let schema = schemas
         .get(&schema_name)
         .unwrap_or_else(|| panic!("schema not found for fixture: {schema_name}"));
      if schema.is_valid(&read_json(&path)) {
         panic!("forward compat fixture unexpectedly validated: {}", path.display());
      }
   }
}

/// Runs a real diff and checks every document the pipeline persisted.
#[tokio::test]
async fn persisted_documents_validate_against_schemas() {
   let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
   let schemas = load_schemas(&root);
   let t = TestHub::new();
   let old = t.seed_target("gd_1", &[gene("g1", "CDK2", 9606)], json!({"symbol": {"type": "keyword"}}));
   let new = t.seed_target(
      "gd_2",
      &[gene("g1", "CDK2", 10090), gene("g2", "TP53", 9606)],
      json!({"symbol": {"type": "keyword"}, "taxid": {"type": "integer"}}),
   );

   let differ = Differ::new(t.hub.clone(), DiffType::JSONDIFF_SELFCONTAINED);
   let folder = differ.diff_folder(&old, &new);
   differ.diff(DiffRequest::new(old, new)).await.expect("diff");

   validate_instance(&schemas["diff_metadata"], &read_json(&folder.join("metadata.json")), "metadata.json");
   validate_instance(
      &schemas["target_snapshot"],
      &read_json(&t.layout().ledger_dir().join("gd_2.json")),
      "ledger entry",
   );

   let _lease = WriterLease::acquire(t.layout(), "gd_2", "sync", 60_000).await.expect("lease");
   validate_instance(
      &schemas["writer_lease"],
      &read_json(&t.layout().locks_dir("gd_2").join("writer_lease.json")),
      "writer lease",
   );
}
