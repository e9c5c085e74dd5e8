//! CLI command implementations for hubpipe.
//!
//! Each module corresponds to one subcommand. Commands resolve a [`Hub`]
//! from the global configuration and print either styled text or, with
//! `--json`, a single JSON document.
//!
//! [`Hub`]: crate::hub::Hub

pub mod build;
pub mod diff;
pub mod status;
pub mod sync;

use std::str::FromStr;

use crate::Result;

/// Parses repeated `--step` values; an empty list selects every step.
pub(crate) fn parse_steps<T>(raw: &[String], all: &[T]) -> Result<Vec<T>>
where
   T: FromStr + Copy,
   crate::Error: From<T::Err>,
{
   if raw.is_empty() {
      return Ok(all.to_vec());
   }
   let mut steps = Vec::with_capacity(raw.len());
   for name in raw.iter().flat_map(|s| s.split(',')).map(str::trim).filter(|s| !s.is_empty()) {
      steps.push(name.parse::<T>()?);
   }
   Ok(steps)
}
