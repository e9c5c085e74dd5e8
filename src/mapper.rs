//! Per-source document mappers and their registry.
//!
//! Mappers are resolved by name. A source's master document may name its
//! mapper explicitly; otherwise the first registered pattern matching the
//! source name wins, and sources with no match use [`IdentityMapper`].

use std::{collections::HashMap, fmt, sync::Arc};

use regex::Regex;
use serde_json::Value;

use crate::Result;

/// Transform applied to raw source documents before they are merged.
pub trait Mapper: Send {
   fn name(&self) -> &str;

   /// Whether [`Mapper::load`] must run before [`Mapper::process`].
   fn need_load(&self) -> bool {
      false
   }

   fn load(&mut self) -> Result<()> {
      Ok(())
   }

   fn process(&self, docs: Vec<Value>) -> Result<Vec<Value>>;
}

/// Builds a fresh mapper instance. Each merge worker calls the factory so
/// mapper state is loaded inside the worker.
pub type MapperFactory = Arc<dyn Fn() -> Box<dyn Mapper> + Send + Sync>;

/// Optional per-document cleaner applied before the mapper; returning `None`
/// drops the document.
pub type DocCleaner = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;

pub const IDENTITY: &str = "identity";

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapper;

impl Mapper for IdentityMapper {
   fn name(&self) -> &str {
      IDENTITY
   }

   fn process(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
      Ok(docs)
   }
}

#[derive(Clone, Default)]
pub struct MapperRegistry {
   mappers:  HashMap<String, MapperFactory>,
   patterns: Vec<(Regex, String)>,
}

impl fmt::Debug for MapperRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("MapperRegistry")
         .field("mappers", &self.mappers.keys().collect::<Vec<_>>())
         .field(
            "patterns",
            &self
               .patterns
               .iter()
               .map(|(re, name)| (re.as_str(), name.as_str()))
               .collect::<Vec<_>>(),
         )
         .finish()
   }
}

impl MapperRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn register<F, M>(&mut self, name: impl Into<String>, factory: F)
   where
      F: Fn() -> M + Send + Sync + 'static,
      M: Mapper + 'static,
   {
      self
         .mappers
         .insert(name.into(), Arc::new(move || Box::new(factory()) as Box<dyn Mapper>));
   }

   /// Routes every source whose name matches `pattern` to `mapper`.
   /// Patterns are tried in registration order.
   pub fn register_pattern(&mut self, pattern: &str, mapper: impl Into<String>) -> Result<()> {
      let re = Regex::new(pattern)?;
      self.patterns.push((re, mapper.into()));
      Ok(())
   }

   /// Name of the mapper that applies to `source`.
   pub fn resolve_name(&self, source: &str, declared: Option<&str>) -> String {
      if let Some(name) = declared
         && self.mappers.contains_key(name)
      {
         return name.to_string();
      }
      self
         .patterns
         .iter()
         .find(|(re, name)| re.is_match(source) && self.mappers.contains_key(name))
         .map_or_else(|| IDENTITY.to_string(), |(_, name)| name.clone())
   }

   /// Instantiates a mapper by resolved name, falling back to identity.
   pub fn instantiate(&self, name: &str) -> Box<dyn Mapper> {
      match self.mappers.get(name) {
         Some(factory) => factory(),
         None => Box::new(IdentityMapper),
      }
   }
}

#[cfg(test)]
mod tests {
   use serde_json::json;

   use super::*;

   struct Upper {
      loaded: bool,
   }

   impl Mapper for Upper {
      fn name(&self) -> &str {
         "upper"
      }

      fn need_load(&self) -> bool {
         !self.loaded
      }

      fn load(&mut self) -> Result<()> {
         self.loaded = true;
         Ok(())
      }

      fn process(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
         assert!(self.loaded, "process before load");
         Ok(docs
            .into_iter()
            .map(|mut d| {
               if let Some(s) = d.get("sym").and_then(Value::as_str) {
                  d["sym"] = json!(s.to_uppercase());
               }
               d
            })
            .collect())
      }
   }

   fn registry() -> MapperRegistry {
      let mut reg = MapperRegistry::new();
      reg.register("upper", || Upper { loaded: false });
      reg.register_pattern("^clinvar_.*$", "upper").unwrap();
      reg.register_pattern("^clinvar_hg19$", "missing").unwrap();
      reg
   }

   #[test]
   fn explicit_name_wins_over_patterns() {
      let reg = registry();
      assert_eq!(reg.resolve_name("dbsnp", Some("upper")), "upper");
   }

   #[test]
   fn first_matching_pattern_wins() {
      let reg = registry();
      assert_eq!(reg.resolve_name("clinvar_hg19", None), "upper");
      assert_eq!(reg.resolve_name("dbsnp", None), IDENTITY);
      assert_eq!(reg.resolve_name("dbsnp", Some("unregistered")), IDENTITY);
   }

   #[test]
   fn instances_are_fresh_and_loadable() {
      let reg = registry();
      let mut mapper = reg.instantiate("upper");
      assert!(mapper.need_load());
      mapper.load().unwrap();
      let out = mapper.process(vec![json!({"_id": "1", "sym": "cdk2"})]).unwrap();
      assert_eq!(out[0]["sym"], "CDK2");
      assert!(reg.instantiate("upper").need_load());
   }
}
