//! Build command: merges sources into a new target snapshot.

use console::style;
use serde::Serialize;

use crate::{
   Result,
   build::{BuildStep, Builder, MergeRequest},
   hub::Hub,
};

#[derive(Serialize)]
struct BuildJson<'a> {
   schema_version: u32,
   build:          &'a str,
   #[serde(flatten)]
   report:         &'a crate::build::BuildReport,
}

pub async fn execute(
   build_name: String,
   sources: Vec<String>,
   target_name: Option<String>,
   force: bool,
   ids: Vec<String>,
   steps: Vec<String>,
   json: bool,
) -> Result<()> {
   let hub = Hub::from_config()?;
   let req = MergeRequest {
      sources: (!sources.is_empty()).then_some(sources),
      target_name,
      force,
      ids: (!ids.is_empty()).then_some(ids),
      steps: super::parse_steps(&steps, &BuildStep::ALL)?,
      ..MergeRequest::new(&build_name)
   };
   let report = Builder::new(hub).merge(req).await?;

   if json {
      let payload = BuildJson { schema_version: 1, build: &build_name, report: &report };
      println!("{}", serde_json::to_string_pretty(&payload)?);
      return Ok(());
   }

   println!("{}", style(format!("✓ Built {}", report.target_name)).green());
   for (source, count) in &report.merge_stats {
      println!("  {source}: {}", style(count).dim());
   }
   if let Some(version) = &report.build_version {
      println!("  version: {}", style(version).dim());
   }
   if let Some(total) = report.total {
      println!("  documents: {}", style(total).dim());
   }
   Ok(())
}
