//! Job substrate: worker pools, the in-flight job registry, admission
//! control, and first-error-wins batch dispatch.
//!
//! The async coordinator never runs batch work itself. CPU-bound batch
//! workers go to a bounded rayon pool via [`JobManager::defer_to_process`];
//! short blocking calls such as ledger writes go to the tokio blocking pool
//! via [`JobManager::defer_to_thread`].

use std::{
   collections::HashMap,
   fmt,
   panic::{AssertUnwindSafe, catch_unwind},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::Instant,
};

use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{Result, config, error::Error};

/// What a job is doing, for the registry and admission predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCategory {
   Build,
   Diff,
   Sync,
   Worker,
   Io,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
   pub category:    JobCategory,
   pub target:      String,
   pub step:        String,
   pub description: String,
}

impl JobInfo {
   pub fn new(category: JobCategory, target: impl Into<String>, step: impl Into<String>) -> Self {
      Self { category, target: target.into(), step: step.into(), description: String::new() }
   }

   pub fn describe(mut self, description: impl Into<String>) -> Self {
      self.description = description.into();
      self
   }

   fn is_orchestrator(&self) -> bool {
      matches!(self.category, JobCategory::Build | JobCategory::Diff | JobCategory::Sync)
   }
}

impl fmt::Display for JobInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:?}:{}:{}", self.category, self.target, self.step)?;
      if !self.description.is_empty() {
         write!(f, " ({})", self.description)?;
      }
      Ok(())
   }
}

#[derive(Debug, Clone)]
pub struct RunningJob {
   pub id:         u64,
   pub info:       JobInfo,
   pub started_at: Instant,
}

/// Admission predicate: given a candidate job and the jobs currently running,
/// returns `Err(reason)` to refuse it.
pub type Predicate = Arc<dyn Fn(&JobInfo, &[JobInfo]) -> Result<(), String> + Send + Sync>;

pub type JobFuture<T> = BoxFuture<'static, Result<T>>;

type Registry = Arc<Mutex<HashMap<u64, RunningJob>>>;

pub struct JobManager {
   cpu:        rayon::ThreadPool,
   registry:   Registry,
   next_id:    AtomicU64,
   predicates: RwLock<Vec<(String, Predicate)>>,
}

impl fmt::Debug for JobManager {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("JobManager")
         .field("workers", &self.cpu.current_num_threads())
         .field("running", &self.registry.lock().len())
         .finish()
   }
}

impl JobManager {
   pub fn new(workers: usize) -> Result<Self> {
      let cpu = rayon::ThreadPoolBuilder::new()
         .num_threads(workers.max(1))
         .thread_name(|i| format!("hubpipe-worker-{i}"))
         .build()
         .map_err(|e| Error::Op { op: "jobs", reason: format!("failed to start pool: {e}") })?;
      let manager = Self {
         cpu,
         registry: Arc::new(Mutex::new(HashMap::new())),
         next_id: AtomicU64::new(1),
         predicates: RwLock::new(Vec::new()),
      };
      manager.add_predicate("one-writer-per-target", Arc::new(one_writer_per_target));
      Ok(manager)
   }

   pub fn from_config() -> Result<Self> {
      Self::new(config::get().workers())
   }

   pub fn workers(&self) -> usize {
      self.cpu.current_num_threads()
   }

   pub fn add_predicate(&self, name: impl Into<String>, predicate: Predicate) {
      self.predicates.write().push((name.into(), predicate));
   }

   /// Snapshot of every registered job.
   pub fn running(&self) -> Vec<RunningJob> {
      let mut jobs: Vec<RunningJob> = self.registry.lock().values().cloned().collect();
      jobs.sort_by_key(|j| j.id);
      jobs
   }

   /// Checks admission predicates and registers an orchestrator-level job.
   /// The returned guard unregisters it on drop.
   pub fn admit(&self, info: JobInfo) -> Result<JobGuard> {
      let mut registry = self.registry.lock();
      let running: Vec<JobInfo> = registry.values().map(|j| j.info.clone()).collect();
      for (name, predicate) in self.predicates.read().iter() {
         if let Err(reason) = predicate(&info, &running) {
            tracing::warn!(job = %info, predicate = %name, "job refused: {reason}");
            return Err(Error::Busy { target: info.target.clone(), reason });
         }
      }
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      registry.insert(id, RunningJob { id, info, started_at: Instant::now() });
      Ok(JobGuard { id, registry: Arc::clone(&self.registry) })
   }

   /// Runs `f` on the CPU worker pool. Submission happens immediately; the
   /// returned future resolves with the worker's result.
   pub fn defer_to_process<T, F>(&self, info: JobInfo, f: F) -> JobFuture<T>
   where
      T: Send + 'static,
      F: FnOnce() -> Result<T> + Send + 'static,
   {
      let (tx, rx) = oneshot::channel();
      let guard = self.register(info.clone());
      self.cpu.spawn(move || {
         let result = run_guarded(&info, f);
         drop(guard);
         let _ = tx.send(result);
      });
      receive(rx)
   }

   /// Runs a short blocking call on the I/O thread pool.
   pub fn defer_to_thread<T, F>(&self, info: JobInfo, f: F) -> JobFuture<T>
   where
      T: Send + 'static,
      F: FnOnce() -> Result<T> + Send + 'static,
   {
      let guard = self.register(info.clone());
      let handle = tokio::task::spawn_blocking(move || {
         let result = run_guarded(&info, f);
         drop(guard);
         result
      });
      async move {
         handle
            .await
            .map_err(|e| Error::Op { op: "jobs", reason: format!("thread job lost: {e}") })?
      }
      .boxed()
   }

   fn register(&self, info: JobInfo) -> JobGuard {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self
         .registry
         .lock()
         .insert(id, RunningJob { id, info, started_at: Instant::now() });
      JobGuard { id, registry: Arc::clone(&self.registry) }
   }
}

fn run_guarded<T, F>(info: &JobInfo, f: F) -> Result<T>
where
   F: FnOnce() -> Result<T>,
{
   catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
      tracing::error!(job = %info, "worker panicked");
      Err(Error::WorkerPanic { job: info.to_string() })
   })
}

fn receive<T: Send + 'static>(rx: oneshot::Receiver<Result<T>>) -> JobFuture<T> {
   async move {
      rx.await.map_err(|_| Error::Op {
         op:     "jobs",
         reason: "worker dropped its result channel".to_string(),
      })?
   }
   .boxed()
}

fn one_writer_per_target(candidate: &JobInfo, running: &[JobInfo]) -> Result<(), String> {
   if !candidate.is_orchestrator() {
      return Ok(());
   }
   match running
      .iter()
      .find(|j| j.is_orchestrator() && j.target == candidate.target)
   {
      Some(other) => Err(format!("{other} is already running")),
      None => Ok(()),
   }
}

/// Removes a job from the registry when dropped.
#[derive(Debug)]
pub struct JobGuard {
   id:       u64,
   registry: Registry,
}

impl Drop for JobGuard {
   fn drop(&mut self) {
      self.registry.lock().remove(&self.id);
   }
}

/// Result of one batch worker.
///
/// Keeps "nothing to do" distinct from success so callers cannot fold a skip
/// into their counts, and keeps fatal errors distinct from skips so they are
/// never retried silently.
#[derive(Debug)]
pub enum Outcome<T> {
   Done(T),
   Skipped(String),
   Fatal(Error),
}

impl<T> Outcome<T> {
   pub fn from_result(result: Result<T>) -> Self {
      match result {
         Ok(value) => Self::Done(value),
         Err(err) => Self::Fatal(err),
      }
   }

   pub const fn is_fatal(&self) -> bool {
      matches!(self, Self::Fatal(_))
   }
}

/// First-error-wins cell shared between the dispatcher and its workers.
#[derive(Debug, Default)]
pub struct FirstError {
   set:   AtomicBool,
   error: Mutex<Option<Error>>,
}

impl FirstError {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn is_set(&self) -> bool {
      self.set.load(Ordering::Acquire)
   }

   /// Records `err` if no error has been recorded yet. Returns whether this
   /// call won.
   pub fn record(&self, err: Error) -> bool {
      if self
         .set
         .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
         .is_ok()
      {
         *self.error.lock() = Some(err);
         true
      } else {
         tracing::debug!("discarding later batch error: {err}");
         false
      }
   }

   pub fn take(&self) -> Option<Error> {
      self.error.lock().take()
   }
}

/// Aggregated results of one dispatch phase.
#[derive(Debug)]
pub struct BatchRun<T> {
   pub done:    Vec<(usize, T)>,
   pub skipped: Vec<(usize, String)>,
}

impl<T> BatchRun<T> {
   pub fn values(self) -> impl Iterator<Item = T> {
      self.done.into_iter().map(|(_, v)| v)
   }
}

/// Submits batches in increasing sequence order with at most `max_inflight`
/// outstanding.
///
/// Once any batch reports [`Outcome::Fatal`] no further batches are
/// submitted; batches already running are awaited and their results
/// discarded, then the first error is returned with its batch number.
pub async fn dispatch_batches<T, I, F>(
   jobs: &JobManager,
   base: &JobInfo,
   max_inflight: usize,
   batches: I,
   abort: Arc<FirstError>,
) -> Result<BatchRun<T>>
where
   T: Send + 'static,
   I: IntoIterator<Item = (usize, F)>,
   F: FnOnce() -> Outcome<T> + Send + 'static,
{
   dispatch_batches_observed(jobs, base, max_inflight, batches, abort, |_, _| {}).await
}

/// [`dispatch_batches`] with a callback invoked on the coordinator for every
/// completed batch, in completion order.
pub async fn dispatch_batches_observed<T, I, F, O>(
   jobs: &JobManager,
   base: &JobInfo,
   max_inflight: usize,
   batches: I,
   abort: Arc<FirstError>,
   mut observe: O,
) -> Result<BatchRun<T>>
where
   T: Send + 'static,
   I: IntoIterator<Item = (usize, F)>,
   F: FnOnce() -> Outcome<T> + Send + 'static,
   O: FnMut(usize, &Outcome<T>),
{
   let max_inflight = max_inflight.max(1);
   let mut inflight = FuturesUnordered::new();
   let mut run = BatchRun { done: Vec::new(), skipped: Vec::new() };

   for (seq, work) in batches {
      if abort.is_set() {
         tracing::warn!(job = %base, batch = seq, "not dispatching remaining batches after failure");
         break;
      }
      let info = JobInfo { category: JobCategory::Worker, ..base.clone() }
         .describe(format!("batch #{seq}"));
      let future = jobs.defer_to_process(info, move || Ok(work()));
      inflight.push(async move { (seq, future.await) });

      while inflight.len() >= max_inflight {
         if let Some((seq, result)) = inflight.next().await {
            collect(base, seq, result, &abort, &mut run, &mut observe);
         }
      }
      tokio::task::yield_now().await;
   }

   while let Some((seq, result)) = inflight.next().await {
      collect(base, seq, result, &abort, &mut run, &mut observe);
   }

   if abort.is_set() {
      return Err(abort.take().unwrap_or_else(|| Error::Op {
         op:     "dispatch",
         reason: format!("{base} aborted by another failure"),
      }));
   }
   run.done.sort_by_key(|(seq, _)| *seq);
   run.skipped.sort_by_key(|(seq, _)| *seq);
   Ok(run)
}

fn collect<T>(
   base: &JobInfo,
   seq: usize,
   result: Result<Outcome<T>>,
   abort: &FirstError,
   run: &mut BatchRun<T>,
   observe: &mut impl FnMut(usize, &Outcome<T>),
) {
   let outcome = result.unwrap_or_else(Outcome::Fatal);
   observe(seq, &outcome);
   match outcome {
      Outcome::Done(value) => {
         if !abort.is_set() {
            run.done.push((seq, value));
         }
      },
      Outcome::Skipped(reason) => {
         tracing::debug!(job = %base, batch = seq, "batch skipped: {reason}");
         run.skipped.push((seq, reason));
      },
      Outcome::Fatal(err) => {
         tracing::error!(job = %base, batch = seq, "batch failed: {err}");
         abort.record(Error::Batch { op: step_name(base), batch: seq, reason: err.to_string() });
      },
   }
}

fn step_name(info: &JobInfo) -> &'static str {
   match info.category {
      JobCategory::Build => "merge",
      JobCategory::Diff => "diff",
      JobCategory::Sync => "sync",
      JobCategory::Worker | JobCategory::Io => "job",
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::atomic::AtomicUsize, time::Duration};

   use super::*;

   fn base() -> JobInfo {
      JobInfo::new(JobCategory::Build, "t1", "merge-root")
   }

   #[tokio::test]
   async fn sums_are_independent_of_completion_order() {
      let jobs = JobManager::new(4).unwrap();
      let batches = (0..20usize).map(|seq| {
         (seq, move || {
            std::thread::sleep(Duration::from_millis(((20 - seq) % 5) as u64));
            Outcome::Done(seq as u64)
         })
      });
      let run = dispatch_batches(&jobs, &base(), 3, batches, FirstError::new())
         .await
         .unwrap();
      assert_eq!(run.done.len(), 20);
      assert_eq!(run.values().sum::<u64>(), (0..20).sum::<u64>());
      assert!(jobs.running().is_empty());
   }

   #[tokio::test]
   async fn first_error_stops_further_dispatch() {
      let jobs = JobManager::new(1).unwrap();
      let started = Arc::new(AtomicUsize::new(0));
      let batches = (0..50usize).map(|seq| {
         let started = Arc::clone(&started);
         (seq, move || {
            started.fetch_add(1, Ordering::SeqCst);
            if seq == 2 {
               Outcome::Fatal(Error::Op { op: "test", reason: "boom".to_string() })
            } else {
               Outcome::Done(1u64)
            }
         })
      });
      let err = dispatch_batches(&jobs, &base(), 2, batches, FirstError::new())
         .await
         .unwrap_err();
      assert!(matches!(err, Error::Batch { batch: 2, .. }), "{err}");
      assert!(started.load(Ordering::SeqCst) < 50);
   }

   #[tokio::test]
   async fn panicking_worker_is_reported() {
      let jobs = JobManager::new(1).unwrap();
      let batches = std::iter::once((0usize, || -> Outcome<u64> { panic!("kaboom") }));
      let err = dispatch_batches(&jobs, &base(), 1, batches, FirstError::new())
         .await
         .unwrap_err();
      assert!(err.to_string().contains("panicked"), "{err}");
   }

   #[tokio::test]
   async fn admission_refuses_second_writer_on_same_target() {
      let jobs = JobManager::new(1).unwrap();
      let guard = jobs.admit(JobInfo::new(JobCategory::Build, "t1", "merge")).unwrap();
      let err = jobs
         .admit(JobInfo::new(JobCategory::Diff, "t1", "diff"))
         .unwrap_err();
      assert!(matches!(err, Error::Busy { .. }));
      jobs.admit(JobInfo::new(JobCategory::Build, "t2", "merge")).unwrap();
      drop(guard);
      jobs.admit(JobInfo::new(JobCategory::Diff, "t1", "diff")).unwrap();
   }

   #[test]
   fn first_error_keeps_the_first() {
      let cell = FirstError::new();
      assert!(cell.record(Error::Op { op: "a", reason: "1".to_string() }));
      assert!(!cell.record(Error::Op { op: "b", reason: "2".to_string() }));
      assert!(cell.take().unwrap().to_string().contains("a failed"));
   }
}
