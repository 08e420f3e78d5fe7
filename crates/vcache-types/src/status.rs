use std::fmt;

use crate::status_code::{self, status_code_t, EngineCode, StatusCode};

/// A status value carrying a code and optional message.
///
/// The `#[must_use]` attribute ensures callers do not silently ignore error
/// statuses.
#[derive(Debug, Clone)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: Option<String>,
}

impl Status {
    /// Create a status with just a code.
    pub fn new(code: status_code_t) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create a status with a code and a descriptive message.
    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(msg.into()),
        }
    }

    /// Shorthand for the common "key not in the cache" error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::with_message(EngineCode::NOT_FOUND, msg)
    }

    /// Shorthand for an invalid-argument error.
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::with_message(StatusCode::INVALID_ARG, msg)
    }

    /// Shorthand for an I/O error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::with_message(StatusCode::IO_ERROR, msg)
    }

    /// Return the numeric status code.
    pub fn code(&self) -> status_code_t {
        self.code
    }

    /// Return the optional message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this status represents success (code == OK).
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// Produce a human-readable description like `"Engine::NotFound(2000) no such key"`.
    pub fn describe(&self) -> String {
        let name = status_code::to_string(self.code);
        match &self.message {
            Some(msg) => format!("{}({}) {}", name, self.code, msg),
            None => format!("{}({})", name, self.code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for Status {}

impl From<status_code_t> for Status {
    fn from(code: status_code_t) -> Self {
        Self::new(code)
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => EngineCode::NOT_FOUND,
            _ => StatusCode::IO_ERROR,
        };
        Self::with_message(code, err.to_string())
    }
}
