use crate::CoreError;
use serde::Serialize;
use std::fmt;

/// Lifecycle of a watcher instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Created,
    Connecting,
    Watching,
    Polling,
    Error,
    Stopped,
}

impl WatcherState {
    pub fn as_str(self) -> &'static str {
        match self {
            WatcherState::Created => "created",
            WatcherState::Connecting => "connecting",
            WatcherState::Watching => "watching",
            WatcherState::Polling => "polling",
            WatcherState::Error => "error",
            WatcherState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn validate_transition(from: WatcherState, to: WatcherState) -> Result<(), CoreError> {
    use WatcherState::{Connecting, Created, Error, Polling, Stopped, Watching};

    let valid = matches!(
        (from, to),
        (_, Stopped)
            | (Created | Error, Connecting)
            | (Connecting, Watching | Error)
            | (Watching, Polling | Connecting)
            | (Polling, Watching | Error)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
