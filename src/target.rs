//! Output collection of a build.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
   Result,
   hub::HubLayout,
   store::{BackendDescriptor, Collection},
};

/// User-overridable build extension points.
pub trait BuildHooks: Send + Sync {
   /// Runs on the I/O pool after all merge batches succeeded.
   fn post_merge(&self, _target: &BackendDescriptor) -> Result<()> {
      Ok(())
   }

   /// Extra fields merged into the snapshot's `_meta`.
   fn custom_metadata(&self, _target: &BackendDescriptor) -> Result<Map<String, Value>> {
      Ok(Map::new())
   }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl BuildHooks for NoHooks {}

#[derive(Clone)]
pub struct TargetBackend {
   layout:      HubLayout,
   database:    String,
   target_name: Option<String>,
   hooks:       Arc<dyn BuildHooks>,
}

impl std::fmt::Debug for TargetBackend {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("TargetBackend")
         .field("database", &self.database)
         .field("target_name", &self.target_name)
         .finish_non_exhaustive()
   }
}

impl TargetBackend {
   pub fn new(layout: HubLayout, database: &str) -> Self {
      Self { layout, database: database.to_string(), target_name: None, hooks: Arc::new(NoHooks) }
   }

   pub fn with_hooks(mut self, hooks: Arc<dyn BuildHooks>) -> Self {
      self.hooks = hooks;
      self
   }

   /// Uses `name` if given, otherwise generates
   /// `<build>_<YYYYMMDD>_<8 random chars>`.
   pub fn set_target_name(&mut self, name: Option<&str>, build_name: &str, now: DateTime<Utc>) -> &str {
      let name = match name {
         Some(name) => name.to_string(),
         None => generate_target_name(build_name, now),
      };
      self.target_name.insert(name)
   }

   pub fn target_name(&self) -> Option<&str> {
      self.target_name.as_deref()
   }

   pub fn descriptor(&self) -> Result<BackendDescriptor> {
      let name = self.target_name.as_deref().ok_or_else(|| crate::Error::Op {
         op:     "target",
         reason: "target name not set".to_string(),
      })?;
      Ok(BackendDescriptor::in_hub(&self.layout, &self.database, name))
   }

   pub fn collection(&self) -> Result<Collection> {
      self.descriptor()?.open()
   }

   pub fn drop(&self) -> Result<()> {
      let coll = self.collection()?;
      tracing::info!(collection = %coll.descriptor(), "dropping target collection");
      coll.drop_collection()
   }

   pub fn prepare(&self) -> Result<()> {
      self.collection()?.create()
   }

   /// Called once all merge batches succeeded.
   pub fn finalize(&self) -> Result<()> {
      let coll = self.collection()?;
      let count = coll.count()?;
      tracing::info!(collection = %coll.descriptor(), count, "target finalized");
      Ok(())
   }

   pub fn post_merge(&self) -> Result<()> {
      self.hooks.post_merge(&self.descriptor()?)
   }

   pub fn custom_metadata(&self) -> Result<Map<String, Value>> {
      self.hooks.custom_metadata(&self.descriptor()?)
   }

   pub fn hooks(&self) -> Arc<dyn BuildHooks> {
      Arc::clone(&self.hooks)
   }
}

pub fn generate_target_name(build_name: &str, now: DateTime<Utc>) -> String {
   let suffix: String = Uuid::new_v4()
      .simple()
      .to_string()
      .chars()
      .filter(char::is_ascii_lowercase)
      .chain(std::iter::repeat('x'))
      .take(8)
      .collect();
   format!("{build_name}_{}_{suffix}", now.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
   use chrono::TimeZone;

   use super::*;

   #[test]
   fn generated_names_carry_build_and_date() {
      let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
      let name = generate_target_name("mygene", now);
      let (prefix, suffix) = name.rsplit_once('_').unwrap();
      assert_eq!(prefix, "mygene_20240309");
      assert_eq!(suffix.len(), 8);
      assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
   }

   #[test]
   fn explicit_name_wins() {
      let mut t = TargetBackend::new(HubLayout::new("/hub"), "target");
      let name = t.set_target_name(Some("custom"), "mygene", Utc::now()).to_string();
      assert_eq!(name, "custom");
      assert_eq!(t.descriptor().unwrap().collection, "custom");
   }
}
