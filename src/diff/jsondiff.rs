//! Structural JSON diff producing RFC 6902-style patch operations.
//!
//! Objects are diffed key by key; arrays and scalars are replaced whole.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PatchError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
   Add { path: String, value: Value },
   Remove { path: String },
   Replace { path: String, value: Value },
}

impl PatchOp {
   pub fn path(&self) -> &str {
      match self {
         Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
      }
   }

   pub const fn kind(&self) -> &'static str {
      match self {
         Self::Add { .. } => "add",
         Self::Remove { .. } => "remove",
         Self::Replace { .. } => "replace",
      }
   }

   /// Top-level key addressed by a depth-1 path, e.g. `/symbol`.
   pub fn root_key(&self) -> Option<String> {
      let tokens = parse_pointer(self.path()).ok()?;
      match tokens.as_slice() {
         [key] => Some(key.clone()),
         _ => None,
      }
   }
}

pub type Patch = Vec<PatchOp>;

/// Computes the patch turning `old` into `new`. Field paths in `exclude`
/// (dotted, e.g. `_timestamp` or `meta.updated`) are ignored on both sides.
pub fn diff(old: &Value, new: &Value, exclude: &[String]) -> Patch {
   let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
   let mut ops = Vec::new();
   diff_at(old, new, &mut Vec::new(), &exclude, &mut ops);
   ops
}

fn diff_at(old: &Value, new: &Value, at: &mut Vec<String>, exclude: &HashSet<&str>, ops: &mut Patch) {
   match (old, new) {
      (Value::Object(old), Value::Object(new)) => diff_objects(old, new, at, exclude, ops),
      _ if old == new => {},
      _ => ops.push(PatchOp::Replace { path: pointer(at), value: new.clone() }),
   }
}

fn diff_objects(
   old: &Map<String, Value>,
   new: &Map<String, Value>,
   at: &mut Vec<String>,
   exclude: &HashSet<&str>,
   ops: &mut Patch,
) {
   for (key, old_value) in old {
      at.push(key.clone());
      if !exclude.contains(at.join(".").as_str()) {
         match new.get(key) {
            Some(new_value) => diff_at(old_value, new_value, at, exclude, ops),
            None => ops.push(PatchOp::Remove { path: pointer(at) }),
         }
      }
      at.pop();
   }
   for (key, new_value) in new {
      if old.contains_key(key) {
         continue;
      }
      at.push(key.clone());
      if !exclude.contains(at.join(".").as_str()) {
         ops.push(PatchOp::Add { path: pointer(at), value: new_value.clone() });
      }
      at.pop();
   }
}

/// Applies `patch` to a copy of `doc`. `remove` and `replace` require the
/// target to exist; `add` requires its parent to exist.
pub fn apply(doc: &Value, patch: &[PatchOp]) -> Result<Value, PatchError> {
   let mut out = doc.clone();
   for op in patch {
      apply_one(&mut out, op)?;
   }
   Ok(out)
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
   let tokens = parse_pointer(op.path())?;
   let Some((last, parents)) = tokens.split_last() else {
      return match op {
         PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
            *doc = value.clone();
            Ok(())
         },
         PatchOp::Remove { path } => Err(PatchError::InvalidPointer(path.clone())),
      };
   };

   let mut parent = &mut *doc;
   for token in parents {
      parent = child_mut(parent, token).ok_or_else(|| PatchError::PathNotFound(op.path().to_string()))?;
   }

   match (op, parent) {
      (PatchOp::Add { value, .. }, Value::Object(map)) => {
         map.insert(last.clone(), value.clone());
         Ok(())
      },
      (PatchOp::Add { value, path }, Value::Array(items)) => {
         let index = if last == "-" { items.len() } else { array_index(last, path)? };
         if index > items.len() {
            return Err(PatchError::PathNotFound(path.clone()));
         }
         items.insert(index, value.clone());
         Ok(())
      },
      (PatchOp::Remove { path }, Value::Object(map)) => map
         .remove(last)
         .map(|_| ())
         .ok_or_else(|| PatchError::PathNotFound(path.clone())),
      (PatchOp::Remove { path }, Value::Array(items)) => {
         let index = array_index(last, path)?;
         if index >= items.len() {
            return Err(PatchError::PathNotFound(path.clone()));
         }
         items.remove(index);
         Ok(())
      },
      (PatchOp::Replace { value, path }, parent) => {
         let slot = child_mut(parent, last).ok_or_else(|| PatchError::PathNotFound(path.clone()))?;
         *slot = value.clone();
         Ok(())
      },
      (op, _) => Err(PatchError::InvalidPointer(op.path().to_string())),
   }
}

fn child_mut<'a>(value: &'a mut Value, token: &str) -> Option<&'a mut Value> {
   match value {
      Value::Object(map) => map.get_mut(token),
      Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
      _ => None,
   }
}

fn array_index(token: &str, path: &str) -> Result<usize, PatchError> {
   token
      .parse::<usize>()
      .map_err(|_| PatchError::InvalidPointer(path.to_string()))
}

/// Encodes path segments as a JSON pointer.
pub fn pointer(segments: &[String]) -> String {
   segments
      .iter()
      .map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
      .collect()
}

/// Decodes a JSON pointer into path segments. `""` is the whole document.
pub fn parse_pointer(path: &str) -> Result<Vec<String>, PatchError> {
   if path.is_empty() {
      return Ok(Vec::new());
   }
   let Some(rest) = path.strip_prefix('/') else {
      return Err(PatchError::InvalidPointer(path.to_string()));
   };
   Ok(rest
      .split('/')
      .map(|t| t.replace("~1", "/").replace("~0", "~"))
      .collect())
}
