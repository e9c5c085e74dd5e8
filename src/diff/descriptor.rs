//! `metadata.json`: the resumable record of one diff run.

use std::{
   collections::BTreeMap,
   fs,
   io::ErrorKind,
   path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, error::DiffError, store::BackendDescriptor, util};

pub const METADATA_FILE: &str = "metadata.json";
pub const MAPPING_FILE: &str = "mapping.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffMetadata {
   pub diff:         DiffSection,
   pub old:          DiffSide,
   pub new:          DiffSide,
   #[serde(default, rename = "_meta")]
   pub meta:         Value,
   #[serde(default)]
   pub build_config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffSide {
   pub backend: BackendDescriptor,
   pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffSection {
   #[serde(rename = "type")]
   pub diff_type:    String,
   pub func:         String,
   pub version:      String,
   pub stats:        DiffStats,
   #[serde(default)]
   pub files:        Vec<FileEntry>,
   #[serde(default)]
   pub mapping_file: Option<FileEntry>,
   pub info:         DiffInfo,
   /// Cold collection size when the content step ran (cold/hot diffs only).
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub cold:         Option<ColdSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
   pub update:          u64,
   pub add:             u64,
   pub delete:          u64,
   pub mapping_changed: bool,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub root_keys:       Option<BTreeMap<String, u64>>,
}

/// One diff file with its checksum and operation counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
   pub name:   String,
   pub md5sum: String,
   #[serde(default)]
   pub add:    u64,
   #[serde(default)]
   pub update: u64,
   #[serde(default)]
   pub delete: u64,
}

impl FileEntry {
   pub const fn total_ops(&self) -> u64 {
      self.add + self.update + self.delete
   }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffInfo {
   pub generated_on: String,
   #[serde(default)]
   pub exclude:      Vec<String>,
   #[serde(default)]
   pub steps:        Vec<String>,
   #[serde(default)]
   pub mode:         Option<String>,
   pub batch_size:   usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdSnapshot {
   pub backend: BackendDescriptor,
   pub count:   u64,
}

impl DiffMetadata {
   pub fn load(dir: &Path) -> Result<Self> {
      Self::try_load(dir)?.ok_or_else(|| DiffError::MissingMetadata(dir.to_path_buf()).into())
   }

   pub fn try_load(dir: &Path) -> Result<Option<Self>> {
      match fs::read_to_string(dir.join(METADATA_FILE)) {
         Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
         Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
         Err(e) => Err(e.into()),
      }
   }

   /// Atomically replaces `metadata.json`.
   pub fn save(&self, dir: &Path) -> Result<()> {
      util::write_json_atomic(&dir.join(METADATA_FILE), self)
   }

   /// Recomputes add/update/delete totals from the file list.
   pub fn recompute_stats(&mut self) {
      let stats = &mut self.diff.stats;
      stats.add = self.diff.files.iter().map(|f| f.add).sum();
      stats.update = self.diff.files.iter().map(|f| f.update).sum();
      stats.delete = self.diff.files.iter().map(|f| f.delete).sum();
   }

   /// Whether aggregate stats equal the sum over files.
   pub fn is_consistent(&self) -> bool {
      let mut copy = self.clone();
      copy.recompute_stats();
      copy.diff.stats == self.diff.stats
   }

   pub fn is_self_contained(&self) -> bool {
      self.diff.diff_type.ends_with("selfcontained")
   }
}
