//! Packtrace - usage tracer for sandboxed, file-backed language runtimes
//!
//! This library instruments a guest runtime for one workload execution and
//! records exactly what the workload touches: files opened for reading,
//! dynamic libraries loaded (with their linkage visibility) and the exported
//! symbols actually dereferenced inside them. The result is a deterministic
//! [`manifest::Manifest`] consumed by a bundle packer.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod context;
pub mod dynlib;
pub mod error;
pub mod file_access;
pub mod manifest;
pub mod module_registry;
pub mod runtime;
pub mod session;
pub mod sim;
pub mod symbols;

pub use context::{InstallReport, Recorder, RecorderSelection, TracerContext};
pub use error::{GuestError, GuestResult, TraceError};
pub use manifest::{Manifest, ManifestAssembler};
pub use session::{trace_workload, TraceOutcome};
