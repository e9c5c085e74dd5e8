use std::{io, path::PathBuf};

use thiserror::Error;

/// Main error type for the hubpipe pipeline.
///
/// Every orchestrator and worker funnels its failures into this enum so the
/// status ledger can record a single string form and the CLI can map the
/// failure class onto an exit code.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// TOML deserialization error occurred.
   #[error("toml error: {0}")]
   Toml(#[from] toml::de::Error),

   /// Regex compilation error occurred.
   #[error("regex error: {0}")]
   Regex(#[from] regex::Error),

   /// Error occurred in the document store layer.
   #[error("store error: {0}")]
   Store(#[from] StoreError),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// Error raised by the diff orchestrator or its workers.
   #[error("diff error: {0}")]
   Diff(#[from] DiffError),

   /// Error raised by the sync orchestrator or its workers.
   #[error("sync error: {0}")]
   Sync(#[from] SyncError),

   /// A JSON patch could not be applied.
   #[error("patch error: {0}")]
   Patch(#[from] PatchError),

   /// Operation failed with context.
   #[error("{op} failed: {reason}")]
   Op { op: &'static str, reason: String },

   /// A required upstream stage has not completed successfully.
   #[error("precondition not met for {name}: {reason}")]
   PreconditionNotMet { name: String, reason: String },

   /// A batch worker failed; carries the batch sequence number for manual
   /// resumption.
   #[error("{op} batch #{batch} failed: {reason}")]
   Batch {
      op:     &'static str,
      batch:  usize,
      reason: String,
   },

   /// An internal invariant was violated.
   #[error("invariant violated during {op}: {reason}")]
   Invariant { op: &'static str, reason: String },

   /// A worker panicked instead of returning a result.
   #[error("worker panicked while running {job}")]
   WorkerPanic { job: String },

   /// Another writer modified the ledger between read and merge.
   #[error("ledger conflict on {target}: {reason}")]
   LedgerConflict { target: String, reason: String },

   /// The target is already being built, diffed or synced.
   #[error("{target} is busy: {reason}")]
   Busy { target: String, reason: String },

   /// A fail point fired (only with the `failpoints` feature).
   #[error("failpoint {0} triggered")]
   FailPoint(String),
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::Config(_) => 2,
         Self::PreconditionNotMet { .. } => 3,
         Self::Diff(DiffError::NonAdditiveMapping { .. }) => 4,
         Self::Busy { .. } => 10,
         _ => 1,
      }
   }
}

/// Errors that can occur while reading build configuration and source
/// metadata.
///
/// These are fatal and raised before any batch work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// No build configuration document exists with this name.
   #[error("build configuration {0} not found")]
   MissingBuildConfig(String),

   /// A source named in the build configuration cannot be resolved.
   #[error("source {0} not found")]
   MissingSource(String),

   /// The `root` list mixes negated and plain entries, or names unknown
   /// sources.
   #[error("malformed root list: {0}")]
   MalformedRoot(String),

   /// A cold/hot diff was requested but the build declares no cold collection.
   #[error("build {0} does not declare a cold collection")]
   MissingColdCollection(String),

   /// Sub-sources of one upload event reported different data versions.
   #[error("version mismatch for {name}: {versions:?}")]
   VersionMismatch { name: String, versions: Vec<String> },

   /// Two sources declare incompatible mapping fragments for the same field.
   #[error("mapping conflict at {0}")]
   MappingConflict(String),

   /// A computed build version is not usable.
   #[error("invalid build version {0}: '.' is reserved for minor versions")]
   InvalidBuildVersion(String),

   /// Generic invalid configuration value.
   #[error("invalid config: {0}")]
   Invalid(String),
}

/// Errors that can occur in the directory-backed document store.
#[derive(Debug, Error)]
pub enum StoreError {
   /// A document has no usable `_id` field.
   #[error("document in {collection} has no string _id")]
   MissingId { collection: String },

   /// The collection directory does not exist.
   #[error("collection {0} does not exist")]
   NoSuchCollection(String),

   /// A stored document or file name could not be decoded.
   #[error("corrupt entry {}: {reason}", .path.display())]
   Corrupt { path: PathBuf, reason: String },
}

/// Errors raised while computing or post-processing a diff.
#[derive(Debug, Error)]
pub enum DiffError {
   /// The mapping diff contains operations other than `add`.
   #[error(
      "mapping diff contains non-additive operations {ops:?}; an index mapping cannot retract \
       fields once live"
   )]
   NonAdditiveMapping { ops: Vec<String> },

   /// Refusing to overwrite an existing, non-empty diff directory.
   #[error("diff directory {path} is not empty; use purge or resume mode", path = .0.display())]
   DirectoryNotEmpty(PathBuf),

   /// No `metadata.json` in the diff directory.
   #[error("no diff metadata in {path}", path = .0.display())]
   MissingMetadata(PathBuf),

   /// A diff file on disk no longer matches its recorded checksum.
   #[error("checksum mismatch for {file}: expected {expected}, found {found}")]
   ChecksumMismatch {
      file:     String,
      expected: String,
      found:    String,
   },

   /// A diff file referenced in the metadata is missing on disk.
   #[error("diff file {0} is missing")]
   MissingFile(String),
}

/// Errors raised while replaying a diff onto a target backend.
#[derive(Debug, Error)]
pub enum SyncError {
   /// No sync worker is registered for this diff type and backend.
   #[error("no sync worker registered for diff type {diff_type} on {backend} backends")]
   UnsupportedBackend { diff_type: String, backend: String },

   /// The stored mapping patch does not apply to the live mapping.
   #[error("mapping patch {file} does not apply: {reason}")]
   MappingPatch { file: String, reason: String },
}

/// Errors that can occur while applying a JSON patch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
   /// The pointer does not resolve inside the document.
   #[error("path {0} not found")]
   PathNotFound(String),

   /// The pointer is syntactically invalid or addresses a non-container.
   #[error("invalid pointer {0}")]
   InvalidPointer(String),
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
