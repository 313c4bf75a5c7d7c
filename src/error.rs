//! Error taxonomy for the control plane
//!
//! Validation and isolation errors propagate to the immediate caller. Lock
//! contention is retried inside the storage layer and only surfaces as
//! `Locked` or `Timeout` once the retry budget is spent.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Who asked for what, and when. Attached to every failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: &'static str,
    pub phase: Option<String>,
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            phase: None,
            actor: None,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op={}", self.operation)?;
        if let Some(ref phase) = self.phase {
            write!(f, " phase={phase}")?;
        }
        if let Some(ref actor) = self.actor {
            write!(f, " actor={actor}")?;
        }
        write!(f, " at={}", self.at.to_rfc3339())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid phase '{name}'{} [{context}]", fmt_hint(.hint))]
    InvalidPhase {
        name: String,
        hint: Option<String>,
        context: ErrorContext,
    },

    #[error("invalid argument: {message} [{context}]")]
    InvalidArgument {
        message: String,
        context: ErrorContext,
    },

    #[error("no pipeline phase has been set [{context}]")]
    NotInitialized { context: ErrorContext },

    #[error("config store still locked after {attempts} attempts [{context}]")]
    Locked { attempts: u32, context: ErrorContext },

    #[error("operation timed out after {elapsed:?} [{context}]")]
    Timeout {
        elapsed: Duration,
        context: ErrorContext,
    },

    #[error("isolation violation: {message} [{context}]")]
    IsolationViolation {
        message: String,
        context: ErrorContext,
    },

    #[error("storage error: {message} [{context}]")]
    Storage {
        message: String,
        context: ErrorContext,
    },

    #[error("configuration error: {message} [{context}]")]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("no phase definition for '{phase}' [{context}]")]
    UnknownPhase {
        phase: String,
        context: ErrorContext,
    },
}

impl PipelineError {
    /// Short machine-friendly kind, used in structured CLI output and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidPhase { .. } => "invalid_phase",
            PipelineError::InvalidArgument { .. } => "invalid_argument",
            PipelineError::NotInitialized { .. } => "not_initialized",
            PipelineError::Locked { .. } => "locked",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::IsolationViolation { .. } => "isolation_violation",
            PipelineError::Storage { .. } => "storage",
            PipelineError::Configuration { .. } => "configuration",
            PipelineError::UnknownPhase { .. } => "unknown_phase",
        }
    }

    pub const fn context(&self) -> &ErrorContext {
        match self {
            PipelineError::InvalidPhase { context, .. }
            | PipelineError::InvalidArgument { context, .. }
            | PipelineError::NotInitialized { context }
            | PipelineError::Locked { context, .. }
            | PipelineError::Timeout { context, .. }
            | PipelineError::IsolationViolation { context, .. }
            | PipelineError::Storage { context, .. }
            | PipelineError::Configuration { context, .. }
            | PipelineError::UnknownPhase { context, .. } => context,
        }
    }

    pub(crate) fn storage(err: impl std::fmt::Display, context: ErrorContext) -> Self {
        PipelineError::Storage {
            message: err.to_string(),
            context,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>, context: ErrorContext) -> Self {
        PipelineError::Configuration {
            message: message.into(),
            context,
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>, context: ErrorContext) -> Self {
        PipelineError::InvalidArgument {
            message: message.into(),
            context,
        }
    }
}

impl From<crate::config::ConfigError> for PipelineError {
    fn from(err: crate::config::ConfigError) -> Self {
        PipelineError::configuration(err.to_string(), ErrorContext::new("load_config"))
    }
}

fn fmt_hint(hint: &Option<String>) -> String {
    hint.as_ref().map(|h| format!(" ({h})")).unwrap_or_default()
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
