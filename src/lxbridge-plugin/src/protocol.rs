//! Constants and types shared between the Rust host and the script prelude.
//!
//! Source scripts program against these literals, so they must not change.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// `lx.env`
pub const ENVIRONMENT_NAME: &str = "server";
/// `lx.version`
pub const RUNTIME_VERSION: &str = "external";

/// Canonical event names exposed as `lx.EVENT_NAMES`.
pub mod events {
    pub const REQUEST: &str = "request";
    pub const INITED: &str = "inited";
    pub const UPDATE_ALERT: &str = "updateAlert";

    /// `(constant, literal)` pairs in the order the prelude publishes them.
    pub const ALL: [(&str, &str); 3] = [
        ("request", REQUEST),
        ("inited", INITED),
        ("updateAlert", UPDATE_ALERT),
    ];
}

/// Prefix for failures raised while the script's top level runs.
pub const LOAD_ERROR_PREFIX: &str = "require script error: ";

/// Settlement state of a dispatched handler, as reported by the prelude.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Resolved {
        #[serde(default)]
        value: Value,
    },
    Rejected {
        message: String,
    },
}

/// Broad failure category, for callers that branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Load,
    Rejected,
    Stalled,
    Timeout,
    Engine,
}

/// Everything that can go wrong between loading a script and reading its answer.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Thrown while the script's top-level code ran.
    #[error("require script error: {0}")]
    Load(String),
    /// The handler's promise rejected (or it threw synchronously).
    #[error("{0}")]
    Rejected(String),
    #[error("plugin handler never settled")]
    Stalled,
    #[error("plugin timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// The embedded engine itself failed (prelude, conversions, job queue).
    #[error("script engine error: {0}")]
    Engine(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Load(_) => ErrorKind::Load,
            BridgeError::Rejected(_) => ErrorKind::Rejected,
            BridgeError::Stalled => ErrorKind::Stalled,
            BridgeError::Timeout(_) => ErrorKind::Timeout,
            BridgeError::Engine(_) => ErrorKind::Engine,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Engine(err.to_string())
    }
}
