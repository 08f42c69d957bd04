//! Interpreter options.

use crate::livelock::DEFAULT_WINDOW;
use serde::{Deserialize, Serialize};

/// What to do when an `error.*` event matches no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnhandledErrorPolicy {
    /// Drop the event and carry on.
    #[default]
    Ignore,
    /// Run the exit sequence and end the session as halted.
    Halt,
    /// Run the exit sequence and end the session as destroyed.
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterOptions {
    /// Microsteps in the live-lock window.
    pub livelock_window: usize,
    pub unhandled_errors: UnhandledErrorPolicy,
    /// Whether data model locations are case-sensitive.
    pub case_sensitive: bool,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            livelock_window: DEFAULT_WINDOW,
            unhandled_errors: UnhandledErrorPolicy::Ignore,
            case_sensitive: true,
        }
    }
}

impl InterpreterOptions {
    pub fn with_livelock_window(mut self, window: usize) -> Self {
        self.livelock_window = window;
        self
    }

    pub fn with_unhandled_errors(mut self, policy: UnhandledErrorPolicy) -> Self {
        self.unhandled_errors = policy;
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }
}
