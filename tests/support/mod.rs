#![allow(dead_code)]

use std::{collections::BTreeMap, fs, path::Path};

use hubpipe::{
   config::Config,
   hub::{Hub, HubLayout},
   store::{BackendDescriptor, IndexSettings},
};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Small batches so a handful of documents spans several workers.
pub fn small_config() -> Config {
   Config {
      merge_fetch_batch_size: 4,
      merge_batch_size: 2,
      diff_batch_size: 3,
      sync_batch_size: 2,
      max_workers: 2,
      max_inflight_batches: 3,
      lease_ttl_ms: 5_000,
      ..Config::default()
   }
}

pub struct TestHub {
   pub dir: TempDir,
   pub hub: Hub,
}

impl TestHub {
   pub fn new() -> Self {
      Self::with_config(small_config())
   }

   pub fn with_config(config: Config) -> Self {
      let dir = TempDir::new().expect("temp hub");
      let hub = Hub::new(HubLayout::new(dir.path()), config).expect("hub");
      Self { dir, hub }
   }

   pub fn layout(&self) -> &HubLayout {
      &self.hub.layout
   }

   pub fn target(&self, name: &str) -> BackendDescriptor {
      BackendDescriptor::in_hub(&self.hub.layout, &self.hub.config.target_database, name)
   }

   pub fn source(&self, name: &str) -> BackendDescriptor {
      BackendDescriptor::in_hub(&self.hub.layout, &self.hub.config.source_database, name)
   }

   /// Registers a source: master document, a successful upload record and
   /// its collection.
   pub fn seed_source(&self, name: &str, mapping: Value, docs: &[Value]) {
      self.seed_source_release(name, "1.0", mapping, docs);
   }

   pub fn seed_source_release(&self, name: &str, release: &str, mapping: Value, docs: &[Value]) {
      write_json(
         &self.layout().src_master_dir().join(format!("{name}.json")),
         &json!({"_id": name, "mapping": mapping}),
      );
      write_json(
         &self.layout().src_dump_dir().join(format!("{name}.json")),
         &json!({
            "_id": name,
            "download": {"status": "success", "release": release},
            "upload": {"jobs": {name: {"status": "success", "release": release}}},
         }),
      );
      let coll = self.source(name).open().expect("source collection");
      coll.create().expect("create source");
      coll.upsert_set(docs).expect("seed source docs");
   }

   pub fn set_upload_status(&self, name: &str, status: &str) {
      write_json(
         &self.layout().src_dump_dir().join(format!("{name}.json")),
         &json!({
            "_id": name,
            "upload": {"jobs": {name: {"status": status, "release": "1.0"}}},
         }),
      );
   }

   pub fn seed_build_config(&self, name: &str, config: Value) {
      let mut config = config;
      config["name"] = json!(name);
      write_json(&self.layout().build_config_dir().join(format!("{name}.json")), &config);
   }

   /// Writes a target collection directly, bypassing the builder.
   pub fn seed_target(&self, name: &str, docs: &[Value], mapping: Value) -> BackendDescriptor {
      let desc = self.target(name);
      let coll = desc.open().expect("target collection");
      coll.create().expect("create target");
      for doc in docs {
         coll.replace(doc).expect("seed target doc");
      }
      coll
         .write_settings(&IndexSettings {
            mapping,
            meta: json!({"build_version": name, "stats": {"total": docs.len()}}),
         })
         .expect("settings");
      desc
   }
}

pub fn write_json(path: &Path, value: &Value) {
   fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
   fs::write(path, serde_json::to_vec_pretty(value).expect("json")).expect("write json");
}

/// Every document of a collection, keyed by id.
pub fn snapshot_docs(desc: &BackendDescriptor) -> BTreeMap<String, Value> {
   let coll = desc.open().expect("open");
   let ids = coll.ids().expect("ids");
   coll
      .get_many(&ids)
      .expect("docs")
      .into_iter()
      .map(|doc| (doc["_id"].as_str().expect("_id").to_string(), doc))
      .collect()
}

/// Copies every document of `from` into a fresh collection `to`.
pub fn clone_collection(from: &BackendDescriptor, to: &BackendDescriptor) {
   let dest = to.open().expect("open");
   dest.create().expect("create");
   for doc in snapshot_docs(from).values() {
      dest.replace(doc).expect("copy doc");
   }
   dest
      .write_settings(&from.open().expect("open").settings().expect("settings"))
      .expect("copy settings");
}

pub fn gene(id: &str, symbol: &str, taxid: u64) -> Value {
   json!({"_id": id, "symbol": symbol, "taxid": taxid})
}
