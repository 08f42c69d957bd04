//! Events, session and invoke identifiers, and event descriptor matching.

use crate::document::DocId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of one statechart run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random session id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one started invoke.
///
/// `node` and `instance` make the id structurally unique: restarting an
/// invoke under the same document node yields a new instance number, so
/// events addressed to an earlier instance never match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvokeId {
    /// Id visible to the chart (the `id` attribute, or a generated one).
    pub value: String,
    /// Document id of the invoke node.
    pub node: DocId,
    /// Per-session start counter.
    pub instance: u64,
}

impl InvokeId {
    pub fn new(value: impl Into<String>, node: DocId, instance: u64) -> Self {
        Self {
            value: value.into(),
            node,
            instance,
        }
    }
}

impl fmt::Display for InvokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.value, self.instance)
    }
}

/// Origin of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Raised by the engine itself (errors, done events).
    Platform,
    /// Raised by executable content.
    Internal,
    /// Delivered through the external queue.
    #[default]
    External,
}

impl EventType {
    pub(crate) fn code(&self) -> i64 {
        match self {
            EventType::Platform => 0,
            EventType::Internal => 1,
            EventType::External => 2,
        }
    }

    pub(crate) fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(EventType::Platform),
            1 => Some(EventType::Internal),
            2 => Some(EventType::External),
            _ => None,
        }
    }
}

/// A statechart event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default, rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<InvokeId>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, event_type: EventType) -> Self {
        Self {
            name: name.into(),
            event_type,
            send_id: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            data: Value::Null,
        }
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self::new(name, EventType::External)
    }

    pub fn internal(name: impl Into<String>) -> Self {
        Self::new(name, EventType::Internal)
    }

    pub fn platform(name: impl Into<String>) -> Self {
        Self::new(name, EventType::Platform)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    pub fn with_invoke_id(mut self, invoke_id: InvokeId) -> Self {
        self.invoke_id = Some(invoke_id);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>, origin_type: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self.origin_type = Some(origin_type.into());
        self
    }

    /// Returns the `_event` system variable value for this event.
    pub fn to_system_variable(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "type": match self.event_type {
                EventType::Platform => "platform",
                EventType::Internal => "internal",
                EventType::External => "external",
            },
            "sendid": self.send_id,
            "origin": self.origin,
            "origintype": self.origin_type,
            "invokeid": self.invoke_id.as_ref().map(|id| id.value.clone()),
            "data": self.data,
        })
    }
}

/// Returns whether `descriptor` matches the event name `event`.
///
/// A descriptor matches when it is `*`, equal to the name, or a prefix of the
/// name ending on a `.` token boundary. A trailing `.*` or `.` on the
/// descriptor is ignored.
pub fn descriptor_matches(descriptor: &str, event: &str) -> bool {
    if descriptor == "*" {
        return true;
    }
    let descriptor = descriptor.strip_suffix(".*").unwrap_or(descriptor);
    let descriptor = descriptor.strip_suffix('.').unwrap_or(descriptor);
    if descriptor.is_empty() {
        return false;
    }

    match event.strip_prefix(descriptor) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// Returns whether any descriptor in a space-separated list matches `event`.
pub fn any_descriptor_matches<S: AsRef<str>>(descriptors: &[S], event: &str) -> bool {
    descriptors
        .iter()
        .flat_map(|d| d.as_ref().split_whitespace())
        .any(|d| descriptor_matches(d, event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_prefix_matching() {
        assert!(descriptor_matches("error", "error.execution"));
        assert!(descriptor_matches("error.*", "error.execution"));
        assert!(descriptor_matches("error.", "error"));
        assert!(descriptor_matches("done.state.s1", "done.state.s1"));
        assert!(!descriptor_matches("err", "error.execution"));
        assert!(!descriptor_matches("error.execution.x", "error.execution"));
        assert!(descriptor_matches("*", "anything.at.all"));
    }

    #[test]
    fn test_descriptor_lists() {
        let descriptors = vec!["a.b c".to_string()];
        assert!(any_descriptor_matches(&descriptors, "c"));
        assert!(any_descriptor_matches(&descriptors, "a.b.d"));
        assert!(!any_descriptor_matches(&descriptors, "a"));
    }

    #[test]
    fn test_invoke_ids_differ_by_instance() {
        let first = InvokeId::new("child", DocId(4), 1);
        let second = InvokeId::new("child", DocId(4), 2);
        assert_ne!(first, second);
        assert_eq!(first.to_string(), "child#1");
    }

    #[test]
    fn test_event_json() {
        let event: Event = serde_json::from_str(r#"{"name": "go", "data": {"n": 1}}"#).unwrap();
        assert_eq!(event.event_type, EventType::External);
        assert_eq!(event.data["n"], 1);

        let var = event.to_system_variable();
        assert_eq!(var["name"], "go");
        assert_eq!(var["type"], "external");
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
