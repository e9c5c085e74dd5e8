//! Build, diff and sync pipeline for versioned knowledgebase snapshots.
//!
//! A hub merges uploaded sources into a target snapshot ([`build`]),
//! computes a patch set between two snapshots ([`diff`]) and replays that
//! patch set onto another backend ([`sync`]). Every stage records its jobs
//! in the per-snapshot [`ledger`].

pub mod build;
pub mod cmd;
pub mod config;
pub mod diff;
pub mod error;
pub mod hub;
pub mod jobs;
pub mod lease;
pub mod ledger;
pub mod lock;
pub mod mapper;
pub mod source;
pub mod store;
pub mod sync;
pub mod target;
pub mod util;

pub use error::{Error, Result};
