//! Error types for the tracing core
//!
//! Two families are kept apart: [`GuestError`] is raised by the guest
//! runtime itself and every interceptor forwards it untouched, while
//! [`TraceError`] belongs to the tracer (preload, persistence, config).

use thiserror::Error;

/// Errors raised by the guest runtime's own entry points
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuestError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Failed to load dynamic library {path}: {reason}")]
    DynlibLoad { path: String, reason: String },

    #[error("Unknown symbol '{symbol}' in {library}")]
    UnknownSymbol { library: String, symbol: String },

    #[error("Package not available: {0}")]
    PackageUnavailable(String),

    #[error("{0}")]
    Guest(String),
}

/// Result type for calls into the guest runtime
pub type GuestResult<T> = std::result::Result<T, GuestError>;

/// Errors produced by the tracer itself
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Package preload failed: {0}")]
    Preload(#[source] GuestError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tracer operations
pub type Result<T> = std::result::Result<T, TraceError>;
