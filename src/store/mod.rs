//! Document storage: serialisable backend descriptors and live collection
//! handles.
//!
//! A [`BackendDescriptor`] is plain configuration that can be cloned into any
//! worker. Workers never share a live [`Collection`]; each one calls
//! [`BackendDescriptor::open`] for its own handle.

mod dir;

use std::{
   fmt,
   path::{Path, PathBuf},
   str::FromStr,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use dir::Collection;
pub(crate) use dir::chunk_ids;

use crate::{Result, error::ConfigError, hub::HubLayout, util};

/// Kind of serving backend a collection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
   /// Plain document store.
   DocStore,
   /// Search index: a document store that also carries a field mapping and a
   /// `_meta` block.
   Index,
}

impl BackendKind {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::DocStore => "docstore",
         Self::Index => "index",
      }
   }
}

impl fmt::Display for BackendKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for BackendKind {
   type Err = ConfigError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      match s {
         "docstore" | "doc" => Ok(Self::DocStore),
         "index" => Ok(Self::Index),
         other => Err(ConfigError::Invalid(format!("unknown backend kind {other}"))),
      }
   }
}

/// Serialisable identity of a collection. Holds no open resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendDescriptor {
   pub kind:       BackendKind,
   pub root:       PathBuf,
   pub database:   String,
   pub collection: String,
}

impl BackendDescriptor {
   pub fn new(
      kind: BackendKind,
      root: impl Into<PathBuf>,
      database: impl Into<String>,
      collection: impl Into<String>,
   ) -> Self {
      Self { kind, root: root.into(), database: database.into(), collection: collection.into() }
   }

   /// Document-store collection under the hub's data directory.
   pub fn in_hub(layout: &HubLayout, database: &str, collection: &str) -> Self {
      Self::new(BackendKind::DocStore, layout.data_dir(), database, collection)
   }

   pub fn with_collection(&self, collection: impl Into<String>) -> Self {
      Self { collection: collection.into(), ..self.clone() }
   }

   pub fn with_kind(&self, kind: BackendKind) -> Self {
      Self { kind, ..self.clone() }
   }

   /// Short identity used to name diff directories.
   pub fn identity(&self) -> &str {
      &self.collection
   }

   pub fn database_dir(&self) -> PathBuf {
      self.root.join(&self.database)
   }

   pub fn collection_dir(&self) -> PathBuf {
      self.database_dir().join(&self.collection)
   }

   pub fn settings_path(&self) -> PathBuf {
      self
         .database_dir()
         .join(format!("{}.settings.json", self.collection))
   }

   pub fn lock_path(&self) -> PathBuf {
      self
         .database_dir()
         .join(".locks")
         .join(format!("{}.lock", self.collection))
   }

   /// Opens a fresh live handle.
   pub fn open(&self) -> Result<Collection> {
      Ok(Collection::new(self.clone()))
   }
}

impl fmt::Display for BackendDescriptor {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}:{}.{}", self.kind, self.database, self.collection)
   }
}

/// Mapping and `_meta` carried by index-kind collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
   #[serde(default)]
   pub mapping: Value,
   #[serde(default, rename = "_meta")]
   pub meta:    Value,
}

/// Returns the document's `_id` if it is a string.
pub fn doc_id(doc: &Value) -> Option<&str> {
   doc.get("_id").and_then(Value::as_str)
}

/// Longest hex stem used as a file name; longer ids are stored under a
/// digest so the name stays within filesystem limits.
const MAX_HEX_STEM: usize = 200;

/// Prefix of digest file names. `-` is not a hex digit, so digest names never
/// collide with hex-encoded ones.
const DIGEST_PREFIX: &str = "md5-";

/// Encodes an id into the file name used on disk.
pub fn id_file_name(id: &str) -> String {
   let stem = hex::encode(id.as_bytes());
   if stem.len() <= MAX_HEX_STEM {
      format!("{stem}.json")
   } else {
      format!("{DIGEST_PREFIX}{}.json", util::md5_hex(id.as_bytes()))
   }
}

/// Decodes a hex document file name back into its id. Digest names carry no
/// id; see [`is_digest_file_name`].
pub fn id_from_file_name(path: &Path) -> Option<String> {
   let name = path.file_name()?.to_str()?;
   let stem = name.strip_suffix(".json")?;
   let bytes = hex::decode(stem).ok()?;
   String::from_utf8(bytes).ok()
}

/// Whether `path` names a document stored under the digest of its id.
pub fn is_digest_file_name(path: &Path) -> bool {
   path
      .file_name()
      .and_then(|n| n.to_str())
      .is_some_and(|n| n.starts_with(DIGEST_PREFIX) && n.ends_with(".json"))
}
