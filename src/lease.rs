//! Cross-process writer lease for one target snapshot.
//!
//! `locks/<target>/writer_lease.json` names the current owner and is refreshed
//! by a heartbeat task. Every read-decide-write on it happens under an
//! exclusive `fs4` lock on `locks/<target>/lease_guard.lock`, so two processes
//! can never both decide the lease is free.
//!
//! The in-process [`crate::jobs::JobManager`] admission predicates cover
//! orchestrators sharing one process; the lease covers separate processes
//! sharing a hub.

use std::{
   fs,
   io::ErrorKind,
   path::PathBuf,
   time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Result, error::Error, hub::HubLayout, lock::FileLock, util};

pub const LEASE_SCHEMA_VERSION: u32 = 1;

const LEASE_FILE: &str = "writer_lease.json";
const GUARD_FILE: &str = "lease_guard.lock";

/// On-disk lease document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriterLeaseRecord {
   pub schema_version:    u32,
   pub owner_id:          String,
   pub pid:               u32,
   pub hostname:          String,
   pub operation:         String,
   pub started_at:        String,
   pub last_heartbeat_at: String,
   pub lease_epoch:       u64,
   pub lease_ttl_ms:      u64,
}

impl WriterLeaseRecord {
   /// A lease can be claimed once its heartbeat is older than its TTL, or
   /// immediately when its owner was a process on this host that has exited.
   fn claimable(&self, now: DateTime<Utc>) -> bool {
      self.heartbeat_expired(now) || self.owner_exited()
   }

   fn heartbeat_expired(&self, now: DateTime<Utc>) -> bool {
      match DateTime::parse_from_rfc3339(&self.last_heartbeat_at) {
         Ok(beat) => {
            let age = now.signed_duration_since(beat.with_timezone(&Utc));
            age.num_milliseconds() > i64::try_from(self.lease_ttl_ms).unwrap_or(i64::MAX)
         },
         Err(_) => true,
      }
   }

   fn owner_exited(&self) -> bool {
      self.hostname == hostname() && self.pid != std::process::id() && !pid_alive(self.pid)
   }

   fn owned_by(&self, owner_id: &str, epoch: u64) -> bool {
      self.owner_id == owner_id && self.lease_epoch == epoch
   }
}

#[derive(Debug, Clone)]
struct LeaseFiles {
   record: PathBuf,
   guard:  PathBuf,
}

impl LeaseFiles {
   fn for_target(layout: &HubLayout, target: &str) -> Self {
      let dir = layout.locks_dir(target);
      Self { record: dir.join(LEASE_FILE), guard: dir.join(GUARD_FILE) }
   }

   fn lock(&self) -> Result<FileLock> {
      FileLock::acquire_exclusive(&self.guard)
   }

   fn read(&self) -> Result<Option<WriterLeaseRecord>> {
      match fs::read(&self.record) {
         Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
         Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
         Err(e) => Err(e.into()),
      }
   }
}

/// Held writer lease. Dropping it stops the heartbeat and removes the lease
/// file if this owner still holds it.
#[derive(Debug)]
pub struct WriterLease {
   target:      String,
   files:       LeaseFiles,
   owner_id:    String,
   lease_epoch: u64,
   stop:        CancellationToken,
   heartbeat:   Option<JoinHandle<()>>,
}

impl WriterLease {
   /// Claims the writer lease on `target` for `operation`.
   ///
   /// Fails with [`Error::Busy`] while another owner's lease is live. A
   /// claimable lease is taken over with its epoch bumped, which makes the
   /// previous owner's [`WriterLease::verify`] fail.
   pub async fn acquire(
      layout: &HubLayout,
      target: &str,
      operation: &str,
      lease_ttl_ms: u64,
   ) -> Result<Self> {
      let files = LeaseFiles::for_target(layout, target);
      let owner_id = Uuid::new_v4().to_string();

      let claim_files = files.clone();
      let claim_target = target.to_string();
      let claim_owner = owner_id.clone();
      let claim_op = operation.to_string();
      let lease_epoch = tokio::task::spawn_blocking(move || {
         claim(&claim_files, &claim_target, claim_owner, &claim_op, lease_ttl_ms)
      })
      .await
      .map_err(|e| Error::Op { op: "lease", reason: format!("claim task lost: {e}") })??;
      tracing::debug!(snapshot = target, epoch = lease_epoch, "writer lease acquired for {operation}");

      let stop = CancellationToken::new();
      let heartbeat = spawn_heartbeat(files.clone(), owner_id.clone(), lease_epoch, lease_ttl_ms, stop.clone());

      Ok(Self {
         target: target.to_string(),
         files,
         owner_id,
         lease_epoch,
         stop,
         heartbeat: Some(heartbeat),
      })
   }

   pub fn lease_epoch(&self) -> u64 {
      self.lease_epoch
   }

   pub fn owner_id(&self) -> &str {
      &self.owner_id
   }

   /// Fails with [`Error::Busy`] if the lease was taken over since it was
   /// acquired.
   pub fn verify(&self) -> Result<()> {
      let _lock = self.files.lock()?;
      match self.files.read()? {
         Some(record) if record.owned_by(&self.owner_id, self.lease_epoch) => Ok(()),
         _ => Err(Error::Busy {
            target: self.target.clone(),
            reason: "writer lease ownership lost".to_string(),
         }),
      }
   }
}

impl Drop for WriterLease {
   fn drop(&mut self) {
      self.stop.cancel();
      if let Some(handle) = self.heartbeat.take() {
         handle.abort();
      }
      if let Err(err) = release(&self.files, &self.owner_id, self.lease_epoch) {
         tracing::warn!(snapshot = %self.target, "failed to release writer lease: {err}");
      }
   }
}

/// Reads the current lease record for `target`.
pub fn read_lease_record(layout: &HubLayout, target: &str) -> Result<WriterLeaseRecord> {
   let files = LeaseFiles::for_target(layout, target);
   files.read()?.ok_or_else(|| Error::Op {
      op:     "lease",
      reason: format!("no writer lease for {target}"),
   })
}

fn claim(
   files: &LeaseFiles,
   target: &str,
   owner_id: String,
   operation: &str,
   lease_ttl_ms: u64,
) -> Result<u64> {
   let _lock = files.lock()?;
   let now = Utc::now();
   let lease_epoch = match files.read() {
      Ok(None) => 1,
      Ok(Some(current)) if current.claimable(now) => {
         tracing::warn!(
            snapshot = target,
            previous_pid = current.pid,
            "taking over writer lease left by {}",
            current.operation
         );
         current.lease_epoch + 1
      },
      Ok(Some(current)) => {
         return Err(Error::Busy {
            target: target.to_string(),
            reason: format!("writer lease held by pid {} for {}", current.pid, current.operation),
         });
      },
      // An unreadable record cannot name a live owner.
      Err(err) => {
         tracing::warn!(snapshot = target, "replacing unreadable writer lease: {err}");
         1
      },
   };

   let stamp = timestamp(now);
   let record = WriterLeaseRecord {
      schema_version: LEASE_SCHEMA_VERSION,
      owner_id,
      pid: std::process::id(),
      hostname: hostname(),
      operation: operation.to_string(),
      started_at: stamp.clone(),
      last_heartbeat_at: stamp,
      lease_epoch,
      lease_ttl_ms,
   };
   util::write_json_atomic(&files.record, &record)?;
   Ok(lease_epoch)
}

fn spawn_heartbeat(
   files: LeaseFiles,
   owner_id: String,
   lease_epoch: u64,
   lease_ttl_ms: u64,
   stop: CancellationToken,
) -> JoinHandle<()> {
   let period = Duration::from_millis(lease_ttl_ms / 3).max(Duration::from_millis(250));
   tokio::spawn(async move {
      let mut ticks = time::interval(period);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
      ticks.tick().await;
      loop {
         tokio::select! {
            () = stop.cancelled() => break,
            _ = ticks.tick() => {},
         }
         let files = files.clone();
         let owner_id = owner_id.clone();
         let beat = tokio::task::spawn_blocking(move || refresh(&files, &owner_id, lease_epoch)).await;
         match beat {
            Ok(Ok(())) => {},
            Ok(Err(err)) => {
               tracing::warn!("writer lease heartbeat stopped: {err}");
               break;
            },
            Err(err) => {
               tracing::warn!("writer lease heartbeat task failed: {err}");
               break;
            },
         }
      }
   })
}

fn refresh(files: &LeaseFiles, owner_id: &str, lease_epoch: u64) -> Result<()> {
   let _lock = files.lock()?;
   let Some(mut record) = files.read()?.filter(|r| r.owned_by(owner_id, lease_epoch)) else {
      return Err(Error::Op { op: "lease", reason: "lease ownership lost".to_string() });
   };
   record.last_heartbeat_at = timestamp(Utc::now());
   util::write_json_atomic(&files.record, &record)
}

fn release(files: &LeaseFiles, owner_id: &str, lease_epoch: u64) -> Result<()> {
   let _lock = files.lock()?;
   if let Ok(Some(record)) = files.read()
      && record.owned_by(owner_id, lease_epoch)
   {
      fs::remove_file(&files.record)?;
   }
   Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
   at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
   let Ok(pid) = libc::pid_t::try_from(pid) else {
      return false;
   };
   // Signal 0 only probes for existence; EPERM means it exists under another
   // user.
   let rc = unsafe { libc::kill(pid, 0) };
   rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
   true
}

fn hostname() -> String {
   std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
