//! Gzip-compressed diff files and their `.synced` markers.

use std::{
   fs,
   io::{ErrorKind, Read, Write},
   path::{Path, PathBuf},
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{descriptor::FileEntry, jsondiff::PatchOp};
use crate::{
   Result,
   error::{DiffError, StoreError},
   store::doc_id,
   util,
};

pub const DIFF_EXT: &str = ".json.gz";
pub const SYNCED_SUFFIX: &str = ".synced";
pub const DONE_DIR: &str = ".done";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffFile {
   /// Ids, or whole documents for self-contained diffs.
   #[serde(default)]
   pub add:       Vec<Value>,
   #[serde(default)]
   pub update:    Vec<UpdateEntry>,
   #[serde(default)]
   pub delete:    Vec<String>,
   pub source:    String,
   pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntry {
   #[serde(rename = "_id")]
   pub id:    String,
   pub patch: Vec<PatchOp>,
}

impl DiffFile {
   pub fn new(source: impl Into<String>) -> Self {
      Self { source: source.into(), timestamp: crate::ledger::now(), ..Self::default() }
   }

   pub fn is_empty(&self) -> bool {
      self.add.is_empty() && self.update.is_empty() && self.delete.is_empty()
   }

   pub fn total_ops(&self) -> u64 {
      (self.add.len() + self.update.len() + self.delete.len()) as u64
   }

   /// Ids touched by this file, in add, update, delete order.
   pub fn ids(&self) -> impl Iterator<Item = &str> {
      self
         .add
         .iter()
         .filter_map(|v| v.as_str().or_else(|| doc_id(v)))
         .chain(self.update.iter().map(|u| u.id.as_str()))
         .chain(self.delete.iter().map(String::as_str))
   }

   /// Serializes, compresses and atomically writes the file; returns its
   /// entry with the md5 of the bytes on disk.
   pub fn write(&self, dir: &Path, name: &str) -> Result<FileEntry> {
      let json = serde_json::to_vec(self)?;
      let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
      encoder.write_all(&json)?;
      let bytes = encoder.finish()?;
      util::write_bytes_atomic(&dir.join(name), &bytes)?;
      Ok(FileEntry {
         name:   name.to_string(),
         md5sum: util::md5_hex(&bytes),
         add:    self.add.len() as u64,
         update: self.update.len() as u64,
         delete: self.delete.len() as u64,
      })
   }

   pub fn read(path: &Path) -> Result<Self> {
      let raw = match fs::read(path) {
         Ok(raw) => raw,
         Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(DiffError::MissingFile(path.display().to_string()).into());
         },
         Err(e) => return Err(e.into()),
      };
      let mut json = Vec::with_capacity(raw.len() * 4);
      GzDecoder::new(raw.as_slice())
         .read_to_end(&mut json)
         .map_err(|e| StoreError::Corrupt { path: path.to_path_buf(), reason: e.to_string() })?;
      Ok(serde_json::from_slice(&json)?)
   }
}

/// `NNNNN.json.gz` for content batch `seq`.
pub fn batch_file_name(seq: usize) -> String {
   format!("{seq:05}{DIFF_EXT}")
}

/// `diff_rNNNNN.json.gz` for reduced chunk `seq`.
pub fn reduced_file_name(seq: usize) -> String {
   format!("diff_r{seq:05}{DIFF_EXT}")
}

pub fn synced_path(dir: &Path, name: &str) -> PathBuf {
   dir.join(format!("{name}{SYNCED_SUFFIX}"))
}

pub fn is_synced(dir: &Path, name: &str) -> bool {
   synced_path(dir, name).is_file()
}

/// Commit point of a sync: renames the file to carry the marker.
pub fn mark_synced(dir: &Path, name: &str) -> Result<()> {
   fs::rename(dir.join(name), synced_path(dir, name))?;
   util::fsync_dir(dir)
}

/// Path holding the file's content, whether or not it is marked synced.
pub fn locate(dir: &Path, name: &str) -> Option<PathBuf> {
   let plain = dir.join(name);
   if plain.is_file() {
      return Some(plain);
   }
   let synced = synced_path(dir, name);
   synced.is_file().then_some(synced)
}

/// Strips every `.synced` marker in `dir` so the diff can be replayed.
/// Returns the number of markers removed.
pub fn reset_synced(dir: &Path) -> Result<usize> {
   let mut reset = 0;
   for entry in fs::read_dir(dir)? {
      let path = entry?.path();
      let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
         continue;
      };
      if let Some(original) = name.strip_suffix(SYNCED_SUFFIX) {
         fs::rename(&path, dir.join(original))?;
         reset += 1;
      }
   }
   if reset > 0 {
      util::fsync_dir(dir)?;
   }
   tracing::info!(dir = %dir.display(), reset, "sync markers reset");
   Ok(reset)
}

/// Removes diff files (plain, synced and reduced-away) from `dir`, leaving
/// `metadata.json` in place.
pub fn clear_content(dir: &Path) -> Result<()> {
   match fs::remove_dir_all(dir.join(DONE_DIR)) {
      Ok(()) => {},
      Err(e) if e.kind() == ErrorKind::NotFound => {},
      Err(e) => return Err(e.into()),
   }
   let entries = match fs::read_dir(dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
      Err(e) => return Err(e.into()),
   };
   for entry in entries {
      let path = entry?.path();
      let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
      if name.ends_with(DIFF_EXT) || name.ends_with(SYNCED_SUFFIX) {
         fs::remove_file(&path)?;
      }
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;

   fn sample() -> DiffFile {
      DiffFile {
         add: vec![json!("a")],
         update: vec![UpdateEntry {
            id:    "b".to_string(),
            patch: vec![PatchOp::Remove { path: "/x".to_string() }],
         }],
         delete: vec!["c".to_string()],
         source: "new".to_string(),
         timestamp: "2024-01-01T00:00:00Z".to_string(),
      }
   }

   #[test]
   fn write_records_md5_of_compressed_bytes() {
      let dir = TempDir::new().unwrap();
      let entry = sample().write(dir.path(), &batch_file_name(3)).unwrap();
      assert_eq!(entry.name, "00003.json.gz");
      assert_eq!(entry.md5sum, util::md5_file(&dir.path().join(&entry.name)).unwrap());
      assert_eq!(entry.total_ops(), 3);
      assert_eq!(DiffFile::read(&dir.path().join(&entry.name)).unwrap(), sample());
   }

   #[test]
   fn synced_markers_flip_and_reset() {
      let dir = TempDir::new().unwrap();
      let entry = sample().write(dir.path(), "00000.json.gz").unwrap();
      assert!(!is_synced(dir.path(), &entry.name));
      mark_synced(dir.path(), &entry.name).unwrap();
      assert!(is_synced(dir.path(), &entry.name));
      assert!(locate(dir.path(), &entry.name).is_some());
      assert_eq!(reset_synced(dir.path()).unwrap(), 1);
      assert!(dir.path().join(&entry.name).is_file());
   }

   #[test]
   fn ids_cover_every_operation() {
      let file = sample();
      let ids: Vec<&str> = file.ids().collect();
      assert_eq!(ids, vec!["a", "b", "c"]);
   }
}
