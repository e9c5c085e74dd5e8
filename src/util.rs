//! Utility functions for filesystem operations

use std::{
   fs,
   io::{Read, Write},
   path::{Path, PathBuf},
};

use md5::{Digest, Md5};
use serde::Serialize;

use crate::{Result, error::Error};

/// Fsyncs a directory so renames inside it are durable.
pub fn fsync_dir(path: &Path) -> Result<()> {
   #[cfg(unix)]
   {
      let dir = fs::File::open(path)?;
      dir.sync_all()?;
   }
   #[cfg(not(unix))]
   {
      let _ = path;
   }
   Ok(())
}

/// Serializes `value` as pretty JSON and atomically replaces `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
   let data = serde_json::to_vec_pretty(value)?;
   write_bytes_atomic(path, &data)
}

/// Writes `data` to a temp sibling, fsyncs it, then renames over `path`.
pub fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<()> {
   if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
   }
   let tmp_path = temp_path(path)?;
   {
      let mut file = fs::File::create(&tmp_path)?;
      file.write_all(data)?;
      file.sync_all()?;
   }
   fs::rename(&tmp_path, path)?;
   if let Some(parent) = path.parent() {
      fsync_dir(parent)?;
   }
   Ok(())
}

pub fn temp_path(path: &Path) -> Result<PathBuf> {
   let name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| Error::Op {
         op:     "write",
         reason: format!("invalid path {}", path.display()),
      })?;
   Ok(path.with_file_name(format!("{name}.tmp")))
}

/// Hex md5 of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
   hex::encode(Md5::digest(data))
}

/// Hex md5 of a file's contents, streamed.
pub fn md5_file(path: &Path) -> Result<String> {
   let mut file = fs::File::open(path)?;
   let mut hasher = Md5::new();
   let mut buf = [0u8; 64 * 1024];
   loop {
      let n = file.read(&mut buf)?;
      if n == 0 {
         break;
      }
      hasher.update(&buf[..n]);
   }
   Ok(hex::encode(hasher.finalize()))
}

/// Recursively calculates the total size of a directory in bytes
pub fn get_dir_size(path: &Path) -> Result<u64> {
   let mut total = 0u64;

   if path.is_dir() {
      for entry in fs::read_dir(path)? {
         let entry = entry?;
         let metadata = entry.metadata()?;

         if metadata.is_dir() {
            total += get_dir_size(&entry.path())?;
         } else {
            total += metadata.len();
         }
      }
   }

   Ok(total)
}

/// Formats a byte count as a human-readable size string
pub fn format_size(bytes: u64) -> String {
   const KB: u64 = 1024;
   const MB: u64 = KB * 1024;
   const GB: u64 = MB * 1024;

   if bytes < KB {
      format!("{bytes} B")
   } else if bytes < MB {
      format!("{:.1} KB", bytes as f64 / KB as f64)
   } else if bytes < GB {
      format!("{:.1} MB", bytes as f64 / MB as f64)
   } else {
      format!("{:.1} GB", bytes as f64 / GB as f64)
   }
}

/// Named fail point; returns an error when armed through the `fail` crate.
#[cfg(feature = "failpoints")]
pub fn fail_point(name: &str) -> Result<()> {
   fail::fail_point!(name, |_| Err(Error::FailPoint(name.to_string())));
   Ok(())
}

#[cfg(not(feature = "failpoints"))]
#[inline(always)]
pub fn fail_point(_name: &str) -> Result<()> {
   Ok(())
}
