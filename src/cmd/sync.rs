//! Sync commands: replay a diff set, or reset its sync markers.

use std::path::PathBuf;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::{
   Result,
   diff::file,
   error::Error,
   hub::Hub,
   store::{BackendDescriptor, BackendKind},
   sync::{SyncRequest, SyncStep, Syncer},
};

#[derive(Serialize)]
struct ResetJson {
   schema_version: u32,
   folder:         String,
   reset:          usize,
}

pub struct SyncArgs {
   pub diff_folder: PathBuf,
   pub backend:     String,
   pub target:      Option<String>,
   pub steps:       Vec<String>,
   pub force:       bool,
   pub batch_size:  Option<usize>,
   pub json:        bool,
}

pub async fn execute(args: SyncArgs) -> Result<()> {
   let hub = Hub::from_config()?;
   let backend: BackendKind = args.backend.parse()?;
   let target = args.target.as_deref().map(|name| {
      BackendDescriptor::in_hub(&hub.layout, &hub.config.target_database, name).with_kind(backend)
   });
   let req = SyncRequest {
      batch_size: args.batch_size,
      force: args.force,
      target,
      steps: super::parse_steps(&args.steps, &SyncStep::ALL)?,
      ..SyncRequest::new(backend, &args.diff_folder)
   };
   let syncer = Syncer::new(hub);

   let report = if args.json {
      syncer.sync(req, &mut ()).await?
   } else {
      let mut pb = ProgressBar::new(0);
      pb.set_style(
         ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
            .map_err(|e| Error::Op { op: "progress", reason: e.to_string() })?
            .progress_chars("█▓░"),
      );
      pb.set_message("syncing");
      let report = syncer.sync(req, &mut pb).await?;
      pb.finish_and_clear();
      report
   };

   if args.json {
      println!("{}", serde_json::to_string_pretty(&report)?);
      return Ok(());
   }

   let counts = &report.counts;
   println!("{}", style(format!("✓ Synced {}", report.target)).green());
   println!(
      "  added: {}  updated: {}  deleted: {}  skipped: {}",
      style(counts.added).dim(),
      style(counts.updated).dim(),
      style(counts.deleted).dim(),
      style(counts.skipped).dim()
   );
   println!(
      "  files: {} synced, {} already synced",
      style(report.files_synced).dim(),
      style(report.files_skipped).dim()
   );
   if report.mapping_updated {
      println!("  {}", style("mapping updated").yellow());
   }
   if report.meta_pushed {
      println!("  {}", style("_meta pushed").dim());
   }
   Ok(())
}

/// Strips `.synced` markers so the next sync replays every file.
pub fn reset(diff_folder: PathBuf, json: bool) -> Result<()> {
   let reset = file::reset_synced(&diff_folder)?;
   if json {
      let payload =
         ResetJson { schema_version: 1, folder: diff_folder.display().to_string(), reset };
      println!("{}", serde_json::to_string_pretty(&payload)?);
      return Ok(());
   }
   println!(
      "{} {}",
      style(format!("✓ Reset {reset} sync marker(s) in")).green(),
      style(diff_folder.display()).dim()
   );
   Ok(())
}
