//! Diff command: computes the patch set between two snapshots.

use console::style;
use serde::Serialize;

use crate::{
   Result,
   diff::{DiffMode, DiffRequest, DiffStep, DiffType, Differ, descriptor::DiffStats},
   hub::Hub,
   store::BackendDescriptor,
   util,
};

#[derive(Serialize)]
struct DiffJson {
   schema_version: u32,
   diff_type:      String,
   folder:         String,
   version:        String,
   files:          usize,
   stats:          DiffStats,
}

pub struct DiffArgs {
   pub old:        String,
   pub new:        String,
   pub diff_type:  String,
   pub steps:      Vec<String>,
   pub mode:       Option<String>,
   pub batch_size: Option<usize>,
   pub exclude:    Vec<String>,
   pub json:       bool,
}

pub async fn execute(args: DiffArgs) -> Result<()> {
   let hub = Hub::from_config()?;
   let diff_type: DiffType = args.diff_type.parse()?;
   let old = BackendDescriptor::in_hub(&hub.layout, &hub.config.target_database, &args.old);
   let new = BackendDescriptor::in_hub(&hub.layout, &hub.config.target_database, &args.new);

   let differ = Differ::new(hub, diff_type);
   let folder = differ.diff_folder(&old, &new);
   let req = DiffRequest {
      batch_size: args.batch_size,
      steps: super::parse_steps(&args.steps, &DiffStep::ALL)?,
      mode: args.mode.as_deref().map(str::parse::<DiffMode>).transpose()?,
      exclude: (!args.exclude.is_empty()).then_some(args.exclude),
      ..DiffRequest::new(old, new)
   };
   let meta = differ.diff(req).await?;

   if args.json {
      let payload = DiffJson {
         schema_version: 1,
         diff_type:      meta.diff.diff_type.clone(),
         folder:         folder.display().to_string(),
         version:        meta.diff.version.clone(),
         files:          meta.diff.files.len(),
         stats:          meta.diff.stats.clone(),
      };
      println!("{}", serde_json::to_string_pretty(&payload)?);
      return Ok(());
   }

   let stats = &meta.diff.stats;
   println!("{}", style(format!("✓ Diff {} complete", meta.diff.version)).green());
   println!("  folder: {}", style(folder.display()).dim());
   println!(
      "  add: {}  update: {}  delete: {}",
      style(stats.add).dim(),
      style(stats.update).dim(),
      style(stats.delete).dim()
   );
   let size = util::get_dir_size(&folder).unwrap_or(0);
   println!(
      "  files: {} ({})",
      style(meta.diff.files.len()).dim(),
      style(util::format_size(size)).dim()
   );
   if stats.mapping_changed {
      println!("  {}", style("mapping changed").yellow());
   }
   Ok(())
}
