//! Directory-backed JSON document collections.

use std::{
   fs::{self, File},
   io::{ErrorKind, Write},
   path::{Path, PathBuf},
};

use serde_json::{Map, Value};

use super::{
   BackendDescriptor, IndexSettings, doc_id, id_file_name, id_from_file_name, is_digest_file_name,
};
use crate::{
   Result,
   error::StoreError,
   lock::FileLock,
   util::{self, temp_path},
};

/// Live handle on one collection. Cheap to construct; holds no open files
/// between calls.
#[derive(Debug, Clone)]
pub struct Collection {
   descriptor: BackendDescriptor,
   dir:        PathBuf,
}

impl Collection {
   pub(super) fn new(descriptor: BackendDescriptor) -> Self {
      let dir = descriptor.collection_dir();
      Self { descriptor, dir }
   }

   pub fn descriptor(&self) -> &BackendDescriptor {
      &self.descriptor
   }

   pub fn name(&self) -> &str {
      &self.descriptor.collection
   }

   pub fn exists(&self) -> bool {
      self.dir.is_dir()
   }

   pub fn create(&self) -> Result<()> {
      fs::create_dir_all(&self.dir)?;
      Ok(())
   }

   pub fn drop_collection(&self) -> Result<()> {
      let _lock = self.lock()?;
      match fs::remove_dir_all(&self.dir) {
         Ok(()) => {},
         Err(e) if e.kind() == ErrorKind::NotFound => {},
         Err(e) => return Err(e.into()),
      }
      match fs::remove_file(self.descriptor.settings_path()) {
         Ok(()) => {},
         Err(e) if e.kind() == ErrorKind::NotFound => {},
         Err(e) => return Err(e.into()),
      }
      Ok(())
   }

   pub fn count(&self) -> Result<u64> {
      Ok(self.ids()?.len() as u64)
   }

   /// All ids in the collection, sorted.
   pub fn ids(&self) -> Result<Vec<String>> {
      let entries = match fs::read_dir(&self.dir) {
         Ok(entries) => entries,
         Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StoreError::NoSuchCollection(self.descriptor.to_string()).into());
         },
         Err(e) => return Err(e.into()),
      };

      let mut ids = Vec::new();
      for entry in entries {
         let path = entry?.path();
         if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
         }
         let id = if is_digest_file_name(&path) {
            read_stored_id(&path)?
         } else {
            id_from_file_name(&path).ok_or_else(|| StoreError::Corrupt {
               path:   path.clone(),
               reason: "file name is not a hex-encoded id".to_string(),
            })?
         };
         ids.push(id);
      }
      ids.sort_unstable();
      Ok(ids)
   }

   /// Splits the sorted id space into consecutive batches of at most `size`.
   pub fn id_batches(&self, size: usize) -> Result<Vec<Vec<String>>> {
      Ok(chunk_ids(self.ids()?, size))
   }

   pub fn contains(&self, id: &str) -> bool {
      self.doc_path(id).is_file()
   }

   pub fn get(&self, id: &str) -> Result<Option<Value>> {
      let path = self.doc_path(id);
      match fs::read(&path) {
         Ok(raw) => {
            let doc = serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
               path:   path.clone(),
               reason: e.to_string(),
            })?;
            Ok(Some(doc))
         },
         Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
         Err(e) => Err(e.into()),
      }
   }

   /// Fetches the documents that exist among `ids`, in `ids` order.
   pub fn get_many(&self, ids: &[String]) -> Result<Vec<Value>> {
      let mut docs = Vec::with_capacity(ids.len());
      for id in ids {
         if let Some(doc) = self.get(id)? {
            docs.push(doc);
         }
      }
      Ok(docs)
   }

   /// Top-level `$set` of every document, creating missing ones.
   pub fn upsert_set(&self, docs: &[Value]) -> Result<u64> {
      self.set_fields(docs, true)
   }

   /// Top-level `$set` of every document that already exists; others are
   /// ignored.
   pub fn update_set(&self, docs: &[Value]) -> Result<u64> {
      self.set_fields(docs, false)
   }

   /// Writes `doc` only if no document with its id exists. Returns `false` on
   /// conflict.
   pub fn insert_new(&self, doc: &Value) -> Result<bool> {
      let id = self.require_id(doc)?;
      let _lock = self.lock()?;
      let path = self.doc_path(id);
      if path.exists() {
         return Ok(false);
      }
      self.create()?;
      write_doc(&path, doc)?;
      Ok(true)
   }

   /// Replaces the whole document.
   pub fn replace(&self, doc: &Value) -> Result<()> {
      let id = self.require_id(doc)?;
      let _lock = self.lock()?;
      self.create()?;
      write_doc(&self.doc_path(id), doc)
   }

   /// Removes a document. Returns whether it existed.
   pub fn remove(&self, id: &str) -> Result<bool> {
      match fs::remove_file(self.doc_path(id)) {
         Ok(()) => Ok(true),
         Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
         Err(e) => Err(e.into()),
      }
   }

   pub fn settings(&self) -> Result<IndexSettings> {
      let path = self.descriptor.settings_path();
      match fs::read_to_string(&path) {
         Ok(raw) => Ok(serde_json::from_str(&raw)?),
         Err(e) if e.kind() == ErrorKind::NotFound => Ok(IndexSettings::default()),
         Err(e) => Err(e.into()),
      }
   }

   pub fn write_settings(&self, settings: &IndexSettings) -> Result<()> {
      util::write_json_atomic(&self.descriptor.settings_path(), settings)
   }

   fn set_fields(&self, docs: &[Value], upsert: bool) -> Result<u64> {
      if docs.is_empty() {
         return Ok(0);
      }
      let _lock = self.lock()?;
      if upsert {
         self.create()?;
      }

      let mut written = 0u64;
      for doc in docs {
         let id = self.require_id(doc)?;
         let Some(fields) = doc.as_object() else {
            continue;
         };
         let path = self.doc_path(id);
         let mut current = match self.get(id)? {
            Some(Value::Object(existing)) => existing,
            Some(_) | None if !upsert => continue,
            _ => Map::new(),
         };
         for (key, value) in fields {
            current.insert(key.clone(), value.clone());
         }
         write_doc(&path, &Value::Object(current))?;
         written += 1;
      }
      Ok(written)
   }

   fn require_id<'a>(&self, doc: &'a Value) -> Result<&'a str> {
      doc_id(doc).ok_or_else(|| {
         StoreError::MissingId { collection: self.descriptor.collection.clone() }.into()
      })
   }

   fn doc_path(&self, id: &str) -> PathBuf {
      self.dir.join(id_file_name(id))
   }

   fn lock(&self) -> Result<FileLock> {
      FileLock::acquire_exclusive(&self.descriptor.lock_path())
   }
}

/// Reads the `_id` of a document stored under a digest file name.
fn read_stored_id(path: &Path) -> Result<String> {
   let corrupt = |reason: String| StoreError::Corrupt { path: path.to_path_buf(), reason };
   let doc: Value = serde_json::from_slice(&fs::read(path)?).map_err(|e| corrupt(e.to_string()))?;
   doc_id(&doc)
      .map(str::to_string)
      .ok_or_else(|| corrupt("document has no _id".to_string()).into())
}

pub(crate) fn chunk_ids(ids: Vec<String>, size: usize) -> Vec<Vec<String>> {
   let size = size.max(1);
   let mut batches = Vec::with_capacity(ids.len().div_ceil(size));
   let mut current = Vec::with_capacity(size.min(ids.len()));
   for id in ids {
      current.push(id);
      if current.len() == size {
         batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
      }
   }
   if !current.is_empty() {
      batches.push(current);
   }
   batches
}

fn write_doc(path: &Path, doc: &Value) -> Result<()> {
   let tmp = temp_path(path)?;
   {
      let mut file = File::create(&tmp)?;
      serde_json::to_writer(&mut file, doc)?;
      file.flush()?;
   }
   fs::rename(&tmp, path)?;
   Ok(())
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;
   use crate::store::BackendKind;

   fn collection(dir: &TempDir) -> Collection {
      BackendDescriptor::new(BackendKind::DocStore, dir.path(), "db", "coll")
         .open()
         .unwrap()
   }

   #[test]
   fn upsert_creates_and_merges_top_level() {
      let dir = TempDir::new().unwrap();
      let coll = collection(&dir);
      coll.upsert_set(&[json!({"_id": "a", "x": 1})]).unwrap();
      coll.upsert_set(&[json!({"_id": "a", "y": 2})]).unwrap();
      assert_eq!(coll.get("a").unwrap(), Some(json!({"_id": "a", "x": 1, "y": 2})));
   }

   #[test]
   fn update_never_creates() {
      let dir = TempDir::new().unwrap();
      let coll = collection(&dir);
      coll.create().unwrap();
      let written = coll.update_set(&[json!({"_id": "ghost", "x": 1})]).unwrap();
      assert_eq!(written, 0);
      assert!(!coll.contains("ghost"));
   }

   #[test]
   fn insert_new_reports_conflict() {
      let dir = TempDir::new().unwrap();
      let coll = collection(&dir);
      assert!(coll.insert_new(&json!({"_id": "a", "v": 1})).unwrap());
      assert!(!coll.insert_new(&json!({"_id": "a", "v": 2})).unwrap());
      assert_eq!(coll.get("a").unwrap(), Some(json!({"_id": "a", "v": 1})));
   }

   #[test]
   fn ids_are_sorted_and_batched() {
      let dir = TempDir::new().unwrap();
      let coll = collection(&dir);
      let docs: Vec<Value> = ["c", "a", "e", "b", "d"]
         .iter()
         .map(|id| json!({"_id": id}))
         .collect();
      coll.upsert_set(&docs).unwrap();
      assert_eq!(coll.ids().unwrap(), vec!["a", "b", "c", "d", "e"]);
      let batches = coll.id_batches(2).unwrap();
      assert_eq!(batches, vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
   }

   #[test]
   fn missing_collection_is_an_error_for_listing() {
      let dir = TempDir::new().unwrap();
      let coll = collection(&dir);
      assert!(coll.ids().is_err());
      assert_eq!(coll.get("x").unwrap(), None);
      assert!(!coll.remove("x").unwrap());
   }

   #[test]
   fn long_ids_are_stored_and_listed() {
      let dir = TempDir::new().unwrap();
      let coll = collection(&dir);
      let long = format!("chr7:g.55242465_{}delins", "GGAATTAAGAGAAGCA".repeat(9));
      coll
         .upsert_set(&[json!({"_id": long, "v": 1}), json!({"_id": "short", "v": 2})])
         .unwrap();

      assert!(coll.contains(&long));
      assert_eq!(coll.get(&long).unwrap(), Some(json!({"_id": long, "v": 1})));
      let mut expected = vec![long.clone(), "short".to_string()];
      expected.sort_unstable();
      assert_eq!(coll.ids().unwrap(), expected);

      assert!(coll.remove(&long).unwrap());
      assert_eq!(coll.ids().unwrap(), vec!["short"]);
   }
}
