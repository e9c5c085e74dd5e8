use std::{
   fs::{self, File, OpenOptions},
   path::Path,
};

use fs4::FileExt;

use crate::Result;

/// Advisory file lock held until drop.
pub struct FileLock {
   file: File,
}

impl FileLock {
   fn open(path: &Path) -> Result<File> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      let file = OpenOptions::new()
         .create(true)
         .read(true)
         .write(true)
         .truncate(false)
         .open(path)?;
      Ok(file)
   }

   pub fn acquire_shared(path: &Path) -> Result<Self> {
      let file = Self::open(path)?;
      file.lock_shared()?;
      Ok(Self { file })
   }

   pub fn acquire_exclusive(path: &Path) -> Result<Self> {
      let file = Self::open(path)?;
      file.lock_exclusive()?;
      Ok(Self { file })
   }
}

impl Drop for FileLock {
   fn drop(&mut self) {
      let _ = FileExt::unlock(&self.file);
   }
}
