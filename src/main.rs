use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hubpipe::{
   Result, cmd,
   cmd::{diff::DiffArgs, sync::SyncArgs},
   config,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the hubpipe application
#[derive(Parser)]
#[command(name = "hubpipe")]
#[command(about = "Build, diff and sync versioned knowledgebase snapshots")]
#[command(version)]
struct Cli {
   #[arg(long, env = "HUBPIPE_HUB", help = "Hub root directory (default: ~/.hubpipe)")]
   hub: Option<PathBuf>,

   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for hubpipe
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Merge sources into a new target snapshot")]
   Build {
      #[arg(help = "Build configuration name")]
      build_name: String,

      #[arg(long = "source", help = "Merge only these sources (repeatable)")]
      sources: Vec<String>,

      #[arg(long, help = "Target snapshot name (default: generated)")]
      target: Option<String>,

      #[arg(long, help = "Skip the upload precondition check")]
      force: bool,

      #[arg(long = "id", help = "Restrict the merge to these document ids (repeatable)")]
      ids: Vec<String>,

      #[arg(long = "step", help = "Steps to run: merge, post, metadata (default: all)")]
      steps: Vec<String>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Compute the patch set between two snapshots")]
   Diff {
      #[arg(help = "Old snapshot name")]
      old: String,

      #[arg(help = "New snapshot name")]
      new: String,

      #[arg(
         short = 't',
         long = "type",
         default_value = "jsondiff-selfcontained",
         help = "Diff type: jsondiff, jsondiff-selfcontained, coldhot-jsondiff, coldhot-jsondiff-selfcontained"
      )]
      diff_type: String,

      #[arg(long = "step", help = "Steps to run: mapping, count, content, reduce, post (default: all)")]
      steps: Vec<String>,

      #[arg(long, help = "Folder handling: purge, resume, force")]
      mode: Option<String>,

      #[arg(long, help = "Ids per diff batch")]
      batch_size: Option<usize>,

      #[arg(long, help = "Field names to ignore when comparing (repeatable)")]
      exclude: Vec<String>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Replay a diff folder onto a target backend")]
   Sync {
      #[arg(help = "Diff folder containing metadata.json")]
      diff_folder: PathBuf,

      #[arg(short = 'b', long, default_value = "docstore", help = "Backend kind: docstore, index")]
      backend: String,

      #[arg(long, help = "Target collection name (default: the diff's old snapshot)")]
      target: Option<String>,

      #[arg(long = "step", help = "Steps to run: mapping, content, meta (default: all)")]
      steps: Vec<String>,

      #[arg(long, help = "Replay files already marked as synced")]
      force: bool,

      #[arg(long, help = "Ids per sync batch")]
      batch_size: Option<usize>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Clear sync markers so the next sync replays every file")]
   ResetSynced {
      #[arg(help = "Diff folder")]
      diff_folder: PathBuf,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Show snapshot status and job history")]
   Status {
      #[arg(help = "Snapshot name (default: list all)")]
      target: Option<String>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
      .with_writer(std::io::stderr)
      .init();

   let cli = Cli::parse();
   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   if let Some(dir) = &cli.hub {
      config::init_for_dir(dir);
   }

   match cli.command {
      Cmd::Build { build_name, sources, target, force, ids, steps, json } => {
         cmd::build::execute(build_name, sources, target, force, ids, steps, json).await
      },
      Cmd::Diff { old, new, diff_type, steps, mode, batch_size, exclude, json } => {
         cmd::diff::execute(DiffArgs {
            old,
            new,
            diff_type,
            steps,
            mode,
            batch_size,
            exclude,
            json,
         })
         .await
      },
      Cmd::Sync { diff_folder, backend, target, steps, force, batch_size, json } => {
         cmd::sync::execute(SyncArgs {
            diff_folder,
            backend,
            target,
            steps,
            force,
            batch_size,
            json,
         })
         .await
      },
      Cmd::ResetSynced { diff_folder, json } => cmd::sync::reset(diff_folder, json),
      Cmd::Status { target, json } => cmd::status::execute(target, json),
   }
}
