//! Error codes and the crate-wide error type.
//!
//! Every user-visible failure maps to exactly one stable [`ErrorCode`];
//! the code is the machine contract, the message is for humans. Engine
//! operations forward both to the registered event handler before
//! returning the error to the caller.

use thiserror::Error;

/// Stable machine-readable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Name lookup (workload, threadpool, class) failed
    NotFound,

    /// Name collision on create
    AlreadyExists,

    /// Out-of-range or wrong-type configuration
    InvalidValue,

    /// Operation disallowed for the current workload/threadpool state
    InvalidState,

    /// Malformed data inside an otherwise well-formed configuration
    InvalidData,

    /// `provide_step` backpressure; not fatal, caller retries
    QueueFull,

    /// Step id skew; the caller is desynced and should resync
    StepInvalid,

    /// Workload module's `config` callback failed; terminal
    ModuleFail,

    /// Structurally broken request or message
    MessageFormat,

    /// Should not happen; bug report material
    Internal,
}

impl ErrorCode {
    /// Short label used in logs and by front-ends keying on the code.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidValue => "invalid_value",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::InvalidData => "invalid_data",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::StepInvalid => "step_invalid",
            ErrorCode::ModuleFail => "module_fail",
            ErrorCode::MessageFormat => "message_format",
            ErrorCode::Internal => "internal",
        }
    }

    /// All codes in a stable order.
    pub fn all() -> Vec<ErrorCode> {
        vec![
            ErrorCode::NotFound,
            ErrorCode::AlreadyExists,
            ErrorCode::InvalidValue,
            ErrorCode::InvalidState,
            ErrorCode::InvalidData,
            ErrorCode::QueueFull,
            ErrorCode::StepInvalid,
            ErrorCode::ModuleFail,
            ErrorCode::MessageFormat,
            ErrorCode::Internal,
        ]
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} '{name}' was not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("invalid value for {what}: {message}")]
    InvalidValue { what: String, message: String },

    #[error("invalid data in {what}: {message}")]
    InvalidData { what: String, message: String },

    #[error("'{name}': operation not allowed: {message}")]
    InvalidState { name: String, message: String },

    #[error("step queue of workload '{0}' is full")]
    StepQueueFull(String),

    #[error("workload '{name}': step id {step_id} out of sequence (expected {expected})")]
    StepInvalid {
        name: String,
        step_id: u64,
        expected: u64,
    },

    #[error("module failed for workload '{name}': {message}")]
    ModuleFail { name: String, message: String },

    #[error("malformed request: {0}")]
    MessageFormat(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map to the stable machine code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Error::InvalidValue { .. } => ErrorCode::InvalidValue,
            Error::InvalidData { .. } => ErrorCode::InvalidData,
            Error::InvalidState { .. } => ErrorCode::InvalidState,
            Error::StepQueueFull(_) => ErrorCode::QueueFull,
            Error::StepInvalid { .. } => ErrorCode::StepInvalid,
            Error::ModuleFail { .. } => ErrorCode::ModuleFail,
            Error::MessageFormat(_) => ErrorCode::MessageFormat,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn invalid_value(what: impl Into<String>, message: impl Into<String>) -> Error {
        Error::InvalidValue {
            what: what.into(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(name: impl Into<String>, message: impl Into<String>) -> Error {
        Error::InvalidState {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
