//! Read-only view of source collections and the hub documents describing
//! them: build configurations, master documents and upload provenance.

use std::{
   collections::{BTreeMap, BTreeSet},
   fs,
   io::ErrorKind,
   path::{Path, PathBuf},
};

use regex::Regex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
   Result,
   error::{ConfigError, Error},
   hub::HubLayout,
   store::{BackendDescriptor, Collection},
};

/// Operator-defined build recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfiguration {
   #[serde(alias = "_id")]
   pub name:            String,
   #[serde(default)]
   pub sources:         Vec<String>,
   /// Root sources; `!name` entries invert the selection.
   #[serde(default)]
   pub root:            Vec<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub doc_root_key:    Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub ids:             Option<IdSelection>,
   /// Premerged "cold" collection underneath a hot build.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub cold_collection: Option<String>,
   #[serde(flatten)]
   pub extra:           Map<String, Value>,
}

/// Restricts a build to an explicit id list, inline or one id per line in a
/// file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum IdSelection {
   List(Vec<String>),
   Path(PathBuf),
}

impl IdSelection {
   pub fn resolve(&self) -> Result<Vec<String>> {
      match self {
         Self::List(ids) => Ok(ids.clone()),
         Self::Path(path) => {
            let raw = fs::read_to_string(path)?;
            Ok(raw
               .lines()
               .map(str::trim)
               .filter(|l| !l.is_empty())
               .map(str::to_string)
               .collect())
         },
      }
   }
}

impl BuildConfiguration {
   /// Partitions `sources` into (root, others) preserving input order.
   ///
   /// An empty `root` list makes every source a root source. Entries match a
   /// source by name, by `*` pattern, or by the source's main source name.
   pub fn split_root(
      &self,
      sources: &[String],
      masters: &BTreeMap<String, SourceMaster>,
   ) -> Result<(Vec<String>, Vec<String>)> {
      if self.root.is_empty() {
         return Ok((sources.to_vec(), Vec::new()));
      }
      let negated = self.root.iter().filter(|r| r.starts_with('!')).count();
      if negated != 0 && negated != self.root.len() {
         return Err(
            ConfigError::MalformedRoot(format!(
               "{}: cannot mix '!' and plain entries in {:?}",
               self.name, self.root
            ))
            .into(),
         );
      }
      let invert = negated != 0;
      let entries: Vec<&str> = self
         .root
         .iter()
         .map(|r| r.trim_start_matches('!'))
         .collect();

      let matchers = entries
         .iter()
         .map(|e| pattern_regex(e).map(|re| (*e, re)))
         .collect::<Result<Vec<_>>>()?;

      let (mut root, mut others) = (Vec::new(), Vec::new());
      for source in sources {
         let listed = matchers
            .iter()
            .any(|(entry, re)| source_matches(source, entry, re, masters));
         if listed != invert {
            root.push(source.clone());
         } else {
            others.push(source.clone());
         }
      }
      Ok((root, others))
   }
}

fn source_matches(
   source: &str,
   entry: &str,
   re: &Regex,
   masters: &BTreeMap<String, SourceMaster>,
) -> bool {
   source == entry
      || re.is_match(source)
      || masters
         .get(source)
         .is_some_and(|m| m.main_source() == entry)
}

/// Converts a `*` glob into an anchored regex.
pub fn pattern_regex(pattern: &str) -> Result<Regex> {
   let body = pattern
      .split('*')
      .map(regex::escape)
      .collect::<Vec<_>>()
      .join(".*");
   Ok(Regex::new(&format!("^{body}$"))?)
}

/// Per-source master document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMaster {
   #[serde(rename = "_id")]
   pub name:        String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub main_source: Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub mapper:      Option<String>,
   #[serde(default)]
   pub mapping:     Value,
}

impl SourceMaster {
   pub fn main_source(&self) -> &str {
      self.main_source.as_deref().unwrap_or(&self.name)
   }
}

/// Download/upload provenance for one main source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceDump {
   #[serde(rename = "_id")]
   pub name:     String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub download: Option<DownloadInfo>,
   #[serde(default)]
   pub upload:   UploadInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadInfo {
   pub status:     String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub release:    Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub started_at: Option<String>,
   #[serde(flatten)]
   pub extra:      Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadInfo {
   /// Keyed by sub-source (collection) name.
   #[serde(default)]
   pub jobs: BTreeMap<String, UploadJob>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadJob {
   pub status:     String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub release:    Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub started_at: Option<String>,
   #[serde(flatten)]
   pub extra:      Map<String, Value>,
}

pub const UPLOAD_SUCCESS: &str = "success";
pub const UPLOAD_RUNNING: &str = "uploading";

/// Provenance recorded in a snapshot's `_meta.src`, one entry per main source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
   pub version:  String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub download: Option<Value>,
   pub upload:   Value,
}

#[derive(Debug, Clone)]
pub struct SourceBackend {
   layout:   HubLayout,
   database: String,
}

impl SourceBackend {
   pub fn new(layout: HubLayout, database: &str) -> Self {
      Self { layout, database: database.to_string() }
   }

   pub fn get_build_configuration(&self, name: &str) -> Result<BuildConfiguration> {
      let path = self.layout.build_config_dir().join(format!("{name}.json"));
      read_doc::<BuildConfiguration>(&path)?
         .ok_or_else(|| ConfigError::MissingBuildConfig(name.to_string()).into())
   }

   pub fn get_src_master_docs(&self) -> Result<BTreeMap<String, SourceMaster>> {
      let docs: Vec<SourceMaster> = read_doc_dir(&self.layout.src_master_dir())?;
      Ok(docs.into_iter().map(|d| (d.name.clone(), d)).collect())
   }

   pub fn get_src_dump(&self, main_source: &str) -> Result<Option<SourceDump>> {
      read_doc(&self.layout.src_dump_dir().join(format!("{main_source}.json")))
   }

   /// Resolves source names (all master documents when `names` is `None`),
   /// expanding `*` patterns, and verifies each has a master document and a
   /// collection. Output is de-duplicated, in request order.
   pub fn validate_sources(&self, names: Option<&[String]>) -> Result<Vec<String>> {
      let masters = self.get_src_master_docs()?;
      let requested: Vec<String> = match names {
         Some(names) => names.to_vec(),
         None => masters.keys().cloned().collect(),
      };

      let mut seen = BTreeSet::new();
      let mut resolved = Vec::new();
      for name in &requested {
         let expanded: Vec<String> = if name.contains('*') {
            let re = pattern_regex(name)?;
            masters.keys().filter(|k| re.is_match(k)).cloned().collect()
         } else if masters.contains_key(name) {
            vec![name.clone()]
         } else {
            Vec::new()
         };
         if expanded.is_empty() {
            return Err(ConfigError::MissingSource(name.clone()).into());
         }
         for source in expanded {
            if !self.collection(&source)?.exists() {
               return Err(
                  ConfigError::MissingSource(format!("{source} (no collection in {})", self.database))
                     .into(),
               );
            }
            if seen.insert(source.clone()) {
               resolved.push(source);
            }
         }
      }
      Ok(resolved)
   }

   /// Collects provenance for the main sources behind `sources`. All
   /// sub-sources uploaded under one main source must share a version.
   pub fn get_src_metadata(&self, sources: &[String]) -> Result<BTreeMap<String, SourceMetadata>> {
      let masters = self.get_src_master_docs()?;
      let mut by_main: BTreeMap<String, Vec<&str>> = BTreeMap::new();
      for source in sources {
         let main = masters
            .get(source)
            .map_or(source.as_str(), SourceMaster::main_source);
         by_main.entry(main.to_string()).or_default().push(source);
      }

      let mut out = BTreeMap::new();
      for (main, subs) in by_main {
         let Some(dump) = self.get_src_dump(&main)? else {
            tracing::warn!(source = %main, "no provenance record, version unknown");
            continue;
         };
         let download_release = dump.download.as_ref().and_then(|d| d.release.clone());
         let versions: BTreeSet<String> = subs
            .iter()
            .filter_map(|sub| {
               dump
                  .upload
                  .jobs
                  .get(*sub)
                  .and_then(|j| j.release.clone())
                  .or_else(|| download_release.clone())
            })
            .collect();
         if versions.len() > 1 {
            return Err(
               ConfigError::VersionMismatch { name: main, versions: versions.into_iter().collect() }
                  .into(),
            );
         }
         let Some(version) = versions.into_iter().next() else {
            tracing::warn!(source = %main, "no release recorded");
            continue;
         };
         let jobs: BTreeMap<&str, &UploadJob> = subs
            .iter()
            .filter_map(|sub| dump.upload.jobs.get(*sub).map(|j| (*sub, j)))
            .collect();
         out.insert(main, SourceMetadata {
            version,
            download: dump.download.as_ref().map(serde_json::to_value).transpose()?,
            upload: serde_json::json!({ "jobs": jobs }),
         });
      }
      Ok(out)
   }

   /// Precondition: every source's latest upload succeeded.
   pub fn check_uploads(&self, sources: &[String]) -> Result<()> {
      let masters = self.get_src_master_docs()?;
      for source in sources {
         let main = masters
            .get(source)
            .map_or(source.as_str(), SourceMaster::main_source);
         let status = self
            .get_src_dump(main)?
            .and_then(|d| d.upload.jobs.get(source).map(|j| j.status.clone()));
         match status.as_deref() {
            Some(UPLOAD_SUCCESS) => {},
            Some(other) => {
               return Err(Error::PreconditionNotMet {
                  name:   source.clone(),
                  reason: format!("last upload status is {other}"),
               });
            },
            None => {
               return Err(Error::PreconditionNotMet {
                  name:   source.clone(),
                  reason: "no upload recorded".to_string(),
               });
            },
         }
      }
      Ok(())
   }

   /// Sources among `sources` with an upload currently running.
   pub fn uploading(&self, sources: &[String]) -> Result<Vec<String>> {
      let masters = self.get_src_master_docs()?;
      let mut busy = Vec::new();
      for source in sources {
         let main = masters
            .get(source)
            .map_or(source.as_str(), SourceMaster::main_source);
         if let Some(dump) = self.get_src_dump(main)?
            && dump
               .upload
               .jobs
               .get(source)
               .is_some_and(|j| j.status == UPLOAD_RUNNING)
         {
            busy.push(source.clone());
         }
      }
      Ok(busy)
   }

   pub fn descriptor(&self, source: &str) -> BackendDescriptor {
      BackendDescriptor::in_hub(&self.layout, &self.database, source)
   }

   pub fn collection(&self, source: &str) -> Result<Collection> {
      self.descriptor(source).open()
   }
}

fn read_doc<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
   match fs::read_to_string(path) {
      Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
   }
}

fn read_doc_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
   let entries = match fs::read_dir(dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
   };
   let mut paths: Vec<PathBuf> = entries
      .filter_map(|e| e.ok().map(|e| e.path()))
      .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
      .collect();
   paths.sort();
   let mut docs = Vec::with_capacity(paths.len());
   for path in paths {
      if let Some(doc) = read_doc(&path)? {
         docs.push(doc);
      }
   }
   Ok(docs)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn config(root: &[&str]) -> BuildConfiguration {
      BuildConfiguration {
         name:            "mygene".to_string(),
         sources:         vec![],
         root:            root.iter().map(|s| s.to_string()).collect(),
         doc_root_key:    None,
         ids:             None,
         cold_collection: None,
         extra:           Map::new(),
      }
   }

   fn sources() -> Vec<String> {
      ["entrez", "ensembl", "clinvar_hg19", "clinvar_hg38"]
         .iter()
         .map(|s| s.to_string())
         .collect()
   }

   fn masters() -> BTreeMap<String, SourceMaster> {
      let mut m = BTreeMap::new();
      for s in sources() {
         let main = s.starts_with("clinvar").then(|| "clinvar".to_string());
         m.insert(s.clone(), SourceMaster { name: s, main_source: main, ..Default::default() });
      }
      m
   }

   #[test]
   fn plain_root_list() {
      let (root, others) = config(&["entrez"]).split_root(&sources(), &masters()).unwrap();
      assert_eq!(root, vec!["entrez"]);
      assert_eq!(others, vec!["ensembl", "clinvar_hg19", "clinvar_hg38"]);
   }

   #[test]
   fn negated_root_list() {
      let (root, others) = config(&["!clinvar"]).split_root(&sources(), &masters()).unwrap();
      assert_eq!(root, vec!["entrez", "ensembl"]);
      assert_eq!(others, vec!["clinvar_hg19", "clinvar_hg38"]);
   }

   #[test]
   fn pattern_root_entry() {
      let (root, _) = config(&["clinvar_*"]).split_root(&sources(), &masters()).unwrap();
      assert_eq!(root, vec!["clinvar_hg19", "clinvar_hg38"]);
   }

   #[test]
   fn mixed_root_list_is_rejected() {
      let err = config(&["entrez", "!ensembl"])
         .split_root(&sources(), &masters())
         .unwrap_err();
      assert!(matches!(err, Error::Config(ConfigError::MalformedRoot(_))));
   }

   #[test]
   fn empty_root_means_all_root() {
      let (root, others) = config(&[]).split_root(&sources(), &masters()).unwrap();
      assert_eq!(root.len(), 4);
      assert!(others.is_empty());
   }

   #[test]
   fn subset_without_root_sources_has_an_empty_root_group() {
      let subset = vec!["ensembl".to_string(), "clinvar_hg19".to_string()];
      let (root, others) = config(&["entrez"]).split_root(&subset, &masters()).unwrap();
      assert!(root.is_empty());
      assert_eq!(others, subset);

      let (root, others) = config(&["!entrez"]).split_root(&subset, &masters()).unwrap();
      assert_eq!(root, subset);
      assert!(others.is_empty());
   }

   #[test]
   fn glob_to_regex_escapes() {
      let re = pattern_regex("a.b_*").unwrap();
      assert!(re.is_match("a.b_x"));
      assert!(!re.is_match("axb_x"));
   }
}
