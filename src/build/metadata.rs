//! Snapshot metadata: build version, merged mapping and `_meta`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::{
   Result,
   error::ConfigError,
   source::{SourceMaster, SourceMetadata},
};

/// `YYYYMMDD` of the merge start time. `.` is reserved for minor versions.
pub fn build_version(started_at: DateTime<Utc>) -> Result<String> {
   let version = started_at.format("%Y%m%d").to_string();
   validate_build_version(&version)?;
   Ok(version)
}

pub fn validate_build_version(version: &str) -> Result<()> {
   if version.is_empty() || version.contains('.') {
      return Err(ConfigError::InvalidBuildVersion(version.to_string()).into());
   }
   Ok(())
}

/// Unions the mapping fragments of every merged source. Two sources
/// declaring different leaf values for the same path is a conflict.
pub fn union_mappings(masters: &BTreeMap<String, SourceMaster>, sources: &[String]) -> Result<Value> {
   let mut mapping = Value::Object(Map::new());
   for source in sources {
      let Some(master) = masters.get(source) else {
         continue;
      };
      if master.mapping.is_null() {
         continue;
      }
      union_into(&mut mapping, &master.mapping, source)?;
   }
   Ok(mapping)
}

fn union_into(dst: &mut Value, src: &Value, path: &str) -> Result<()> {
   match (dst, src) {
      (Value::Object(dst), Value::Object(src)) => {
         for (key, value) in src {
            let child = format!("{path}.{key}");
            match dst.get_mut(key) {
               Some(existing) => union_into(existing, value, &child)?,
               None => {
                  dst.insert(key.clone(), value.clone());
               },
            }
         }
         Ok(())
      },
      (dst, src) if *dst == *src => Ok(()),
      _ => Err(ConfigError::MappingConflict(path.to_string()).into()),
   }
}

/// Assembles the snapshot's `_meta` block.
pub fn snapshot_meta(
   src: &BTreeMap<String, SourceMetadata>,
   total: u64,
   build_version: &str,
   started_at: DateTime<Utc>,
   custom: Map<String, Value>,
) -> Result<Value> {
   let src_version: BTreeMap<&str, &str> = src
      .iter()
      .map(|(name, m)| (name.as_str(), m.version.as_str()))
      .collect();
   let mut meta = json!({
      "src": src,
      "stats": {"total": total},
      "src_version": src_version,
      "build_version": build_version,
      "build_date": started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
   });
   if let Some(obj) = meta.as_object_mut() {
      for (key, value) in custom {
         if key == "stats"
            && let (Some(stats), Value::Object(extra)) = (obj.get_mut("stats"), &value)
         {
            crate::ledger::deep_merge(stats, Value::Object(extra.clone()));
            continue;
         }
         obj.insert(key, value);
      }
   }
   Ok(meta)
}

#[cfg(test)]
mod tests {
   use chrono::TimeZone;

   use super::*;

   fn master(name: &str, mapping: Value) -> (String, SourceMaster) {
      (name.to_string(), SourceMaster { name: name.to_string(), mapping, ..Default::default() })
   }

   #[test]
   fn version_is_date_without_dots() {
      let t = Utc.with_ymd_and_hms(2023, 11, 2, 23, 59, 0).unwrap();
      assert_eq!(build_version(t).unwrap(), "20231102");
      assert!(validate_build_version("20231102.1").is_err());
   }

   #[test]
   fn mappings_union_and_detect_conflicts() {
      let masters: BTreeMap<_, _> = [
         master("a", json!({"sym": {"type": "keyword"}, "go": {"properties": {"bp": {"type": "text"}}}})),
         master("b", json!({"go": {"properties": {"cc": {"type": "text"}}}})),
         master("c", json!({"sym": {"type": "text"}})),
      ]
      .into_iter()
      .collect();
      let ab = union_mappings(&masters, &["a".to_string(), "b".to_string()]).unwrap();
      assert_eq!(ab["go"]["properties"]["cc"]["type"], "text");
      assert_eq!(ab["go"]["properties"]["bp"]["type"], "text");
      let err = union_mappings(&masters, &["a".to_string(), "c".to_string()]).unwrap_err();
      assert!(err.to_string().contains("c.sym.type"), "{err}");
   }

   #[test]
   fn custom_stats_merge_into_stats() {
      let mut custom = Map::new();
      custom.insert("stats".to_string(), json!({"with_go": 3}));
      custom.insert("biothing_type".to_string(), json!("gene"));
      let meta = snapshot_meta(&BTreeMap::new(), 10, "20240101", Utc::now(), custom).unwrap();
      assert_eq!(meta["stats"], json!({"total": 10, "with_go": 3}));
      assert_eq!(meta["biothing_type"], "gene");
   }
}
