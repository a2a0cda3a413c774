//! Error types for hyperkit

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("System not known: {0}")]
    SystemNotKnown(String),

    #[error("Malformed descriptor {}:{line}: {content:?}", .path.display())]
    MalformedDescriptor {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("Instance directory already exists: {}", .0.display())]
    DirectoryConflict(PathBuf),

    #[error("Command failed: {command} ({}): {stderr}", describe_exit(.code, .timed_out))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        timed_out: bool,
        stderr: String,
    },

    #[error("Guest property not yet available on {0}")]
    GuestPropertyUnavailable(String),

    #[error("Invalid state: instance {instance} is {current}, expected {expected}")]
    InvalidState {
        instance: String,
        current: String,
        expected: String,
    },

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for conditions the caller is expected to poll through
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::GuestPropertyUnavailable(_))
    }

    /// True if an external command exceeded its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::CommandFailed { timed_out: true, .. })
    }
}

fn describe_exit(code: &Option<i32>, timed_out: &bool) -> String {
    match (*timed_out, *code) {
        (true, _) => "timed out".to_string(),
        (false, Some(code)) => format!("exit code {}", code),
        (false, None) => "killed by signal".to_string(),
    }
}
