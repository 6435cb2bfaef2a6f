//! Errors returned by the public API.
//!
//! Internal plumbing uses [`anyhow::Result`]. Anything a caller needs to branch
//! on gets a typed error here, with a machine-readable [`kind`] string and a
//! human-readable message.
//!
//! [`kind`]: SubmitError::kind

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{
    jobs::{JobId, JobStatus},
    prelude::*,
};

/// A single constraint violation on a single parameter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldViolation {
    /// The name of the offending field.
    pub field: String,

    /// What was wrong with it.
    pub message: String,
}

impl FieldViolation {
    /// Create a new violation.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A request was rejected before any job was created.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("no engine was specified")]
    MissingEngine,

    #[error("unknown engine {0:?}")]
    UnknownEngine(String),

    #[error("{}", foreign_field_message(.field, .engine, .owner.as_deref()))]
    ForeignField {
        /// The offending field.
        field: String,
        /// The engine we were validating for.
        engine: String,
        /// The engine which declares this field, if any.
        owner: Option<String>,
    },

    #[error("invalid parameters: {}", join_violations(.0))]
    InvalidFields(Vec<FieldViolation>),

    #[error("engine {engine:?} does not support language(s): {}", .codes.join(", "))]
    UnsupportedLanguage { engine: String, codes: Vec<String> },
}

impl ValidationError {
    /// A machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MissingEngine => "missing_engine",
            ValidationError::UnknownEngine(_) => "unknown_engine",
            ValidationError::ForeignField { .. } => "foreign_parameter",
            ValidationError::InvalidFields(_) => "invalid_parameters",
            ValidationError::UnsupportedLanguage { .. } => "unsupported_language",
        }
    }
}

fn foreign_field_message(field: &str, engine: &str, owner: Option<&str>) -> String {
    match owner {
        Some(owner) => format!(
            "parameter {field:?} is not accepted by engine {engine:?}; it belongs to engine {owner:?}"
        ),
        None => format!(
            "parameter {field:?} is not accepted by engine {engine:?} or any other engine"
        ),
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The requested engine cannot run here.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AvailabilityError {
    #[error("engine {engine:?} is not available{}", reason_suffix(.reason.as_deref()))]
    NotInstalled {
        engine: String,
        reason: Option<String>,
    },

    #[error("engine {engine:?} requires platform {required}, but this host is {actual}")]
    IncompatiblePlatform {
        engine: String,
        required: String,
        actual: String,
    },
}

impl AvailabilityError {
    /// A machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AvailabilityError::NotInstalled { .. } => "engine_unavailable",
            AvailabilityError::IncompatiblePlatform { .. } => "incompatible_platform",
        }
    }
}

fn reason_suffix(reason: Option<&str>) -> String {
    reason.map(|r| format!(": {r}")).unwrap_or_default()
}

/// Why [`Orchestrator::submit`](crate::orchestrator::Orchestrator::submit)
/// refused a request.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Availability(#[from] AvailabilityError),
}

impl SubmitError {
    /// A machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Validation(err) => err.kind(),
            SubmitError::Availability(err) => err.kind(),
        }
    }
}

/// Capability lookups against the registry.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CapabilityError {
    #[error("unknown engine {0:?}")]
    UnknownEngine(String),

    #[error("engine {engine:?} is not available{}", reason_suffix(.reason.as_deref()))]
    Unavailable {
        engine: String,
        reason: Option<String>,
    },

    #[error("engine {engine:?} requires platform {required}, but this host is {actual}")]
    IncompatiblePlatform {
        engine: String,
        required: String,
        actual: String,
    },

    #[error("engine {engine:?} does not support language(s): {}", .codes.join(", "))]
    UnsupportedLanguage { engine: String, codes: Vec<String> },
}

impl From<CapabilityError> for SubmitError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::UnknownEngine(engine) => {
                ValidationError::UnknownEngine(engine).into()
            }
            CapabilityError::Unavailable { engine, reason } => {
                AvailabilityError::NotInstalled { engine, reason }.into()
            }
            CapabilityError::IncompatiblePlatform {
                engine,
                required,
                actual,
            } => AvailabilityError::IncompatiblePlatform {
                engine,
                required,
                actual,
            }
            .into(),
            CapabilityError::UnsupportedLanguage { engine, codes } => {
                ValidationError::UnsupportedLanguage { engine, codes }.into()
            }
        }
    }
}

/// Why a job ended without a result.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Waited for a GPU slot for the whole job budget.
    QueueTimeout,
    /// The engine did not return within the job budget.
    ExecutionTimeout,
    /// The engine failed or returned malformed output.
    EngineCrash,
    /// The engine disappeared after the job was accepted.
    MidFlightUnavailable,
    /// The client gave up on the job.
    Cancelled,
}

impl JobErrorKind {
    /// The terminal status a job with this error ends in.
    pub fn terminal_status(self) -> JobStatus {
        match self {
            JobErrorKind::QueueTimeout | JobErrorKind::ExecutionTimeout => {
                JobStatus::TimedOut
            }
            JobErrorKind::EngineCrash
            | JobErrorKind::MidFlightUnavailable
            | JobErrorKind::Cancelled => JobStatus::Failed,
        }
    }

    /// A machine-readable error kind.
    pub fn as_str(self) -> &'static str {
        match self {
            JobErrorKind::QueueTimeout => "queue_timeout",
            JobErrorKind::ExecutionTimeout => "execution_timeout",
            JobErrorKind::EngineCrash => "engine_crash",
            JobErrorKind::MidFlightUnavailable => "mid_flight_unavailable",
            JobErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job ID that cannot be resolved.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum JobLookupError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} has expired")]
    Expired(JobId),
}

/// Why a job's result is not available.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ResultError {
    #[error("job {job_id} is not finished yet (status: {status})")]
    NotReady { job_id: JobId, status: JobStatus },

    #[error("job {job_id} ended with {kind}: {message}")]
    JobFailed {
        job_id: JobId,
        kind: JobErrorKind,
        message: String,
    },

    #[error(transparent)]
    Lookup(#[from] JobLookupError),
}

/// Why a synchronous wait for a job ended without a terminal state.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AwaitError {
    #[error(
        "job {job_id} did not finish within {waited:?}; submit it asynchronously and poll its status instead"
    )]
    StillRunning { job_id: JobId, waited: Duration },

    #[error(transparent)]
    Lookup(#[from] JobLookupError),
}

/// Why a synchronous submit-and-wait ended without a finished job.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProcessError {
    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Await(#[from] AwaitError),
}

impl ProcessError {
    /// A machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::Submit(err) => err.kind(),
            ProcessError::Await(AwaitError::StillRunning { .. }) => "still_running",
            ProcessError::Await(AwaitError::Lookup(JobLookupError::NotFound(_))) => {
                "not_found"
            }
            ProcessError::Await(AwaitError::Lookup(JobLookupError::Expired(_))) => {
                "expired"
            }
        }
    }
}
