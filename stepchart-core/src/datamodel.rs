//! The session data model.
//!
//! Named JSON values addressed by dotted locations (`order.total`). The
//! first segment must have been declared by a `<data>` element; deeper
//! segments walk into JSON objects. When the model is case-insensitive,
//! every segment is folded to lowercase.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Session id system variable.
pub const SESSION_ID: &str = "_sessionid";
/// Document name system variable.
pub const NAME: &str = "_name";
/// Current event system variable.
pub const EVENT: &str = "_event";

const SYSTEM_VARIABLES: [&str; 3] = [SESSION_ID, NAME, EVENT];

/// Errors from data model access.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataModelError {
    #[error("location '{0}' is not declared")]
    Undeclared(String),

    #[error("location '{0}' is not inside an object")]
    NotAnObject(String),

    #[error("invalid location '{0}'")]
    InvalidLocation(String),

    #[error("system variable '{0}' is read-only")]
    ReadOnly(String),
}

/// Named values of one session.
#[derive(Debug, Clone, Default)]
pub struct DataModel {
    values: BTreeMap<String, Value>,
    case_sensitive: bool,
    dirty: bool,
}

impl DataModel {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            values: BTreeMap::new(),
            case_sensitive,
            dirty: false,
        }
    }

    /// Restores a model from its persisted JSON object.
    pub fn from_json(value: Value, case_sensitive: bool) -> Result<Self, DataModelError> {
        let Value::Object(map) = value else {
            return Err(DataModelError::InvalidLocation("<root>".into()));
        };
        Ok(Self {
            values: map.into_iter().collect(),
            case_sensitive,
            dirty: false,
        })
    }

    /// Returns the whole model as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<_, _>>(),
        )
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Returns whether the model changed since the last [`mark_clean`](Self::mark_clean).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Declares a top-level value, replacing any previous one.
    pub fn declare(&mut self, id: &str, value: Value) {
        let key = self.fold(id);
        self.values.insert(key, value);
        self.dirty = true;
    }

    /// Returns whether the top-level name is declared.
    pub fn is_declared(&self, id: &str) -> bool {
        self.values.contains_key(&self.fold(id))
    }

    /// Reads the value at a dotted location.
    pub fn get(&self, location: &str) -> Option<&Value> {
        let mut segments = location.split('.');
        let first = segments.next().filter(|s| !s.is_empty())?;
        let mut current = self.values.get(&self.fold(first))?;
        for segment in segments {
            current = current.as_object()?.get(&self.fold(segment))?;
        }
        Some(current)
    }

    /// Writes the value at a dotted location.
    ///
    /// The top-level name must be declared and every intermediate segment
    /// must be an object. System variables cannot be written.
    pub fn set(&mut self, location: &str, value: Value) -> Result<(), DataModelError> {
        let segments: Vec<String> = location.split('.').map(|s| self.fold(s)).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(DataModelError::InvalidLocation(location.to_string()));
        }
        if SYSTEM_VARIABLES.contains(&segments[0].as_str()) {
            return Err(DataModelError::ReadOnly(segments[0].clone()));
        }

        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return Err(DataModelError::InvalidLocation(location.to_string())),
        };
        if parents.is_empty() {
            if !self.values.contains_key(last) {
                return Err(DataModelError::Undeclared(location.to_string()));
            }
            self.values.insert(last.clone(), value);
            self.dirty = true;
            return Ok(());
        }

        let mut current = self
            .values
            .get_mut(&parents[0])
            .ok_or_else(|| DataModelError::Undeclared(location.to_string()))?;
        for segment in &parents[1..] {
            current = current
                .as_object_mut()
                .ok_or_else(|| DataModelError::NotAnObject(location.to_string()))?
                .get_mut(segment)
                .ok_or_else(|| DataModelError::Undeclared(location.to_string()))?;
        }
        current
            .as_object_mut()
            .ok_or_else(|| DataModelError::NotAnObject(location.to_string()))?
            .insert(last.clone(), value);
        self.dirty = true;
        Ok(())
    }

    /// Sets a system variable.
    pub fn set_system(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn fold(&self, segment: &str) -> String {
        if self.case_sensitive || segment.starts_with('_') {
            segment.to_string()
        } else {
            segment.to_lowercase()
        }
    }
}
