//! Error types for proxy-sidecar.
//!
//! # Error Message Style Guide
//!
//! All error messages follow a consistent format:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: All lowercase (Rust convention for error messages)
//! - **Context**: Include relevant identifiers (domain name, table, chain, path)
//!
//! ```text
//! "iptables -t nat -N PROXY_REDIRECT failed: chain already exists"
//! "domain not found: default_vm1"
//! "rule not found: no -s/--source value in 2 rules"
//! ```
//!
//! Callers that need to react to an error class use [`Error::kind`] rather
//! than matching on message text.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of an error, used to decide how the caller reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    /// The thing looked up does not exist (a domain, a rule).
    NotFound,
    /// The hypervisor refused the call in the current domain state
    /// (e.g. reading metadata of a migrating domain).
    InvalidOperation,
    /// Anything else.
    #[default]
    Other,
}

/// Result type alias using proxy-sidecar's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in proxy-sidecar operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Startup Errors
    // ========================================================================
    /// The launcher readiness marker never appeared.
    #[error("launcher readiness check failed: {} after {attempts} attempts: {reason}", path.display())]
    LauncherNotReady {
        /// Readiness marker that was polled.
        path: PathBuf,
        /// Number of checks performed.
        attempts: u32,
        /// Why polling gave up.
        reason: String,
    },

    /// Configuration is invalid.
    #[error("config operation failed: {operation}: {reason}")]
    Config {
        /// The operation that failed (e.g., "parse proxy server").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Hypervisor Errors
    // ========================================================================
    /// The hypervisor daemon or its client library is not reachable.
    #[error("hypervisor not available: {0}")]
    HypervisorUnavailable(String),

    /// Domain does not exist (anymore).
    #[error("domain not found: {name}")]
    DomainNotFound {
        /// Fully qualified domain name.
        name: String,
    },

    /// Hypervisor rejected an operation in the domain's current state.
    #[error("invalid hypervisor operation: {operation}: {reason}")]
    InvalidOperation {
        /// The operation that was rejected.
        operation: String,
        /// Message reported by the hypervisor.
        reason: String,
    },

    /// Any other hypervisor call failure.
    #[error("hypervisor operation failed: {operation}: {reason}")]
    Hypervisor {
        /// The operation that failed (e.g., "get domain state").
        operation: String,
        /// Message reported by the hypervisor.
        reason: String,
    },

    // ========================================================================
    // Packet Filter Errors
    // ========================================================================
    /// External command failed.
    #[error("command '{command}' failed: {reason}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message or reason for failure.
        reason: String,
    },

    /// No rule in a chain carried the expected fact.
    #[error("rule not found: {reason}")]
    RuleNotFound {
        /// What was missing.
        reason: String,
    },

    // ========================================================================
    // Proxy Errors
    // ========================================================================
    /// The proxy process could not be launched at all.
    #[error("proxy launch failed: {program}: {reason}")]
    ProxyLaunch {
        /// Program that was executed.
        program: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // IO Errors
    // ========================================================================
    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a domain not found error.
    pub fn domain_not_found(name: impl Into<String>) -> Self {
        Self::DomainNotFound { name: name.into() }
    }

    /// Create a generic hypervisor error.
    pub fn hypervisor(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Hypervisor {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid operation error.
    pub fn invalid_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a command failure error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a rule not found error.
    pub fn rule_not_found(reason: impl Into<String>) -> Self {
        Self::RuleNotFound {
            reason: reason.into(),
        }
    }

    /// Create a proxy launch error.
    pub fn proxy_launch(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProxyLaunch {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DomainNotFound { .. } | Error::RuleNotFound { .. } => ErrorKind::NotFound,
            Error::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            _ => ErrorKind::Other,
        }
    }

    /// Whether this error means the looked-up object does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Whether the hypervisor rejected the call in the current state.
    pub fn is_invalid_operation(&self) -> bool {
        self.kind() == ErrorKind::InvalidOperation
    }
}
