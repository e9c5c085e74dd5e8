//! Status command.
//!
//! Lists target snapshots, or prints one snapshot's ledger: job records,
//! pending actions and merge stats.

use console::style;

use crate::{
   Result,
   hub::Hub,
   ledger::{JobStatus, TargetSnapshot},
};

pub fn execute(target: Option<String>, json: bool) -> Result<()> {
   let hub = Hub::from_config()?;
   match target {
      Some(name) => show(&hub.ledger.get(&name)?, json),
      None => list(&hub, json),
   }
}

fn list(hub: &Hub, json: bool) -> Result<()> {
   let mut snapshots = Vec::new();
   for name in hub.ledger.list()? {
      if let Some(snapshot) = hub.ledger.load(&name)? {
         snapshots.push(snapshot);
      }
   }
   if json {
      println!("{}", serde_json::to_string_pretty(&snapshots)?);
      return Ok(());
   }
   if snapshots.is_empty() {
      println!("{}", style("No snapshots").dim());
      return Ok(());
   }
   println!("{}", style("Snapshots:").bold());
   for snap in &snapshots {
      let version = snap.build_version.as_deref().unwrap_or("-");
      println!(
         "  {} {} {}",
         status_dot(snap.status),
         snap.target_name,
         style(format!("({version}, pending: {})", pending_list(snap))).dim()
      );
   }
   Ok(())
}

fn show(snap: &TargetSnapshot, json: bool) -> Result<()> {
   if json {
      println!("{}", serde_json::to_string_pretty(snap)?);
      return Ok(());
   }
   println!("{} {}", status_dot(snap.status), style(&snap.target_name).bold());
   if let Some(version) = &snap.build_version {
      println!("  version: {}", style(version).dim());
   }
   println!("  pending: {}", style(pending_list(snap)).dim());
   if !snap.merge_stats.is_empty() {
      println!("  merge stats:");
      for (source, count) in &snap.merge_stats {
         println!("    {source}: {}", style(count).dim());
      }
   }
   println!("  jobs:");
   for job in &snap.jobs {
      let elapsed = job.time_in_s.map(|t| format!(" {t:.2}s")).unwrap_or_default();
      println!(
         "    {} {} {}{}",
         status_dot(Some(job.status)),
         job.step,
         style(&job.step_started_at).dim(),
         style(elapsed).dim()
      );
      if let Some(err) = &job.err {
         println!("      {}", style(err).red());
      }
   }
   Ok(())
}

fn pending_list(snap: &TargetSnapshot) -> String {
   if snap.pending.is_empty() { "none".to_string() } else { snap.pending.join(", ") }
}

fn status_dot(status: Option<JobStatus>) -> console::StyledObject<&'static str> {
   match status {
      Some(JobStatus::Success) => style("●").green(),
      Some(JobStatus::Failed) => style("●").red(),
      Some(JobStatus::Pending) | None => style("●").dim(),
      Some(_) => style("●").yellow(),
   }
}
