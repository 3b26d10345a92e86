//! Tracer context and interceptor installation
//!
//! [`TracerContext`] owns every recorder's log. Installing it on a runtime
//! wraps the file opener, the dynamic-library loader and the symbol
//! directory's registration hook, each exactly once. The runtime and the
//! workload share one cooperative thread, so logs sit behind `Rc<RefCell>`
//! and are only read back after the workload has stopped.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::dynlib::{DynlibCall, DynlibCallLog, TracingDynlibLoader};
use crate::file_access::{FileAccessLog, TracingFileOpener};
use crate::runtime::GuestRuntime;
use crate::symbols::{wrap_registered, SymbolAccess, TracingRegistrar};

/// Which recorders a trace should install
///
/// Disabling a recorder produces the same manifest as running on a runtime
/// that lacks the corresponding extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderSelection {
    pub files: bool,
    pub dynlibs: bool,
    pub symbols: bool,
    pub modules: bool,
}

impl Default for RecorderSelection {
    fn default() -> Self {
        Self {
            files: true,
            dynlibs: true,
            symbols: true,
            modules: true,
        }
    }
}

impl RecorderSelection {
    pub fn is_enabled(&self, recorder: Recorder) -> bool {
        match recorder {
            Recorder::FileAccess => self.files,
            Recorder::DynlibCalls => self.dynlibs,
            Recorder::SymbolAccess => self.symbols,
            Recorder::ModuleRegistry => self.modules,
        }
    }
}

/// The recorders a context can install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Recorder {
    FileAccess,
    DynlibCalls,
    SymbolAccess,
    ModuleRegistry,
}

impl Recorder {
    pub const ALL: [Recorder; 4] = [
        Recorder::FileAccess,
        Recorder::DynlibCalls,
        Recorder::SymbolAccess,
        Recorder::ModuleRegistry,
    ];
}

impl fmt::Display for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Recorder::FileAccess => "file-access",
            Recorder::DynlibCalls => "dynlib-calls",
            Recorder::SymbolAccess => "symbol-access",
            Recorder::ModuleRegistry => "module-registry",
        };
        f.write_str(name)
    }
}

/// Why a recorder is not active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Turned off in the recorder selection
    Disabled,
    /// This runtime build does not expose the extension point
    Unavailable,
    /// The extension point is already wrapped by another tracer
    AlreadyTraced,
}

/// Outcome of [`TracerContext::install`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub active: Vec<Recorder>,
    pub skipped: BTreeMap<Recorder, SkipReason>,
}

impl InstallReport {
    pub fn is_active(&self, recorder: Recorder) -> bool {
        self.active.contains(&recorder)
    }

    fn activate(&mut self, recorder: Recorder) {
        tracing::debug!(%recorder, "recorder installed");
        self.active.push(recorder);
    }

    fn skip(&mut self, recorder: Recorder, reason: SkipReason) {
        if reason != SkipReason::Disabled {
            tracing::warn!(%recorder, ?reason, "recorder skipped");
        }
        self.skipped.insert(recorder, reason);
    }
}

/// All recorder state for one traced runtime instance
#[derive(Debug)]
pub struct TracerContext {
    selection: RecorderSelection,
    files: Rc<RefCell<FileAccessLog>>,
    dynlibs: Rc<RefCell<DynlibCallLog>>,
    symbols: Rc<RefCell<SymbolAccess>>,
    report: Option<InstallReport>,
}

impl TracerContext {
    pub fn new(selection: RecorderSelection) -> Self {
        Self {
            selection,
            files: Rc::new(RefCell::new(FileAccessLog::new())),
            dynlibs: Rc::new(RefCell::new(DynlibCallLog::new())),
            symbols: Rc::new(RefCell::new(SymbolAccess::new())),
            report: None,
        }
    }

    pub fn selection(&self) -> RecorderSelection {
        self.selection
    }

    pub fn is_installed(&self) -> bool {
        self.report.is_some()
    }

    /// Report of the installation, if it happened
    pub fn report(&self) -> Option<&InstallReport> {
        self.report.as_ref()
    }

    /// Install every selected recorder on `runtime`
    ///
    /// Must run before any guest code. A second call is a no-op that
    /// returns the first report. Missing extension points only skip their
    /// own recorder.
    pub fn install<R: GuestRuntime + ?Sized>(&mut self, runtime: &mut R) -> InstallReport {
        if let Some(report) = &self.report {
            tracing::debug!("interceptors already installed, skipping");
            return report.clone();
        }

        let mut report = InstallReport::default();
        self.install_file_opener(runtime, &mut report);
        self.install_dynlib_loader(runtime, &mut report);
        self.install_symbol_tracing(runtime, &mut report);

        if !self.selection.modules {
            report.skip(Recorder::ModuleRegistry, SkipReason::Disabled);
        } else if runtime.module_registry().is_none() {
            report.skip(Recorder::ModuleRegistry, SkipReason::Unavailable);
        } else {
            report.activate(Recorder::ModuleRegistry);
        }

        tracing::info!(
            active = report.active.len(),
            skipped = report.skipped.len(),
            "interceptors installed"
        );
        self.report = Some(report.clone());
        report
    }

    fn install_file_opener<R: GuestRuntime + ?Sized>(&self, runtime: &mut R, report: &mut InstallReport) {
        let recorder = Recorder::FileAccess;
        if !self.selection.files {
            return report.skip(recorder, SkipReason::Disabled);
        }
        let Some(hook) = runtime.file_open_hook() else {
            return report.skip(recorder, SkipReason::Unavailable);
        };
        if hook.get().is_some_and(|opener| opener.is_traced()) {
            return report.skip(recorder, SkipReason::AlreadyTraced);
        }
        let log = Rc::clone(&self.files);
        if hook.wrap(|inner| Box::new(TracingFileOpener::new(inner, log))) {
            report.activate(recorder);
        } else {
            report.skip(recorder, SkipReason::Unavailable);
        }
    }

    fn install_dynlib_loader<R: GuestRuntime + ?Sized>(&self, runtime: &mut R, report: &mut InstallReport) {
        let recorder = Recorder::DynlibCalls;
        if !self.selection.dynlibs {
            return report.skip(recorder, SkipReason::Disabled);
        }
        let Some(hook) = runtime.dynlib_loader_hook() else {
            return report.skip(recorder, SkipReason::Unavailable);
        };
        if hook.get().is_some_and(|loader| loader.is_traced()) {
            return report.skip(recorder, SkipReason::AlreadyTraced);
        }
        let log = Rc::clone(&self.dynlibs);
        if hook.wrap(|inner| Box::new(TracingDynlibLoader::new(inner, log))) {
            report.activate(recorder);
        } else {
            report.skip(recorder, SkipReason::Unavailable);
        }
    }

    fn install_symbol_tracing<R: GuestRuntime + ?Sized>(&self, runtime: &mut R, report: &mut InstallReport) {
        let recorder = Recorder::SymbolAccess;
        if !self.selection.symbols {
            return report.skip(recorder, SkipReason::Disabled);
        }
        let Some(directory) = runtime.symbol_directory() else {
            return report.skip(recorder, SkipReason::Unavailable);
        };
        let hook = directory.registrar_hook();
        if hook.get().is_some_and(|registrar| registrar.is_traced()) {
            return report.skip(recorder, SkipReason::AlreadyTraced);
        }
        let access = Rc::clone(&self.symbols);
        if !hook.wrap(|inner| Box::new(TracingRegistrar::new(inner, access))) {
            return report.skip(recorder, SkipReason::Unavailable);
        }
        let wrapped = wrap_registered(directory, &self.symbols);
        tracing::debug!(wrapped, "wrapped export tables present at install time");
        report.activate(recorder);
    }

    fn is_active(&self, recorder: Recorder) -> bool {
        self.report
            .as_ref()
            .is_some_and(|report| report.is_active(recorder))
    }

    /// Read-mode opens in call order; `None` if the recorder is not active
    pub fn opened_files(&self) -> Option<Vec<String>> {
        self.is_active(Recorder::FileAccess)
            .then(|| self.files.borrow().paths().to_vec())
    }

    /// Loader invocations in call order; `None` if the recorder is not active
    pub fn dynlib_calls(&self) -> Option<Vec<DynlibCall>> {
        self.is_active(Recorder::DynlibCalls)
            .then(|| self.dynlibs.borrow().calls().to_vec())
    }

    /// Handles of successful loads mapped to their paths; `None` if the recorder is not active
    pub fn loaded_libs_by_handle(&self) -> Option<BTreeMap<u64, String>> {
        self.is_active(Recorder::DynlibCalls)
            .then(|| self.dynlibs.borrow().handles().clone())
    }

    /// Dereferenced symbols per library; `None` if the recorder is not active
    pub fn symbol_access(&self) -> Option<BTreeMap<String, Vec<String>>> {
        self.is_active(Recorder::SymbolAccess)
            .then(|| self.symbols.borrow().to_sorted())
    }
}

impl Default for TracerContext {
    fn default() -> Self {
        Self::new(RecorderSelection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_defaults_to_everything() {
        let selection = RecorderSelection::default();
        assert!(Recorder::ALL.iter().all(|r| selection.is_enabled(*r)));
    }

    #[test]
    fn test_selection_from_toml_fills_defaults() {
        let selection: RecorderSelection = toml::from_str("symbols = false").unwrap();
        assert!(selection.files);
        assert!(!selection.symbols);
    }

    #[test]
    fn test_uninstalled_context_reports_nothing() {
        let ctx = TracerContext::default();
        assert!(!ctx.is_installed());
        assert!(ctx.opened_files().is_none());
        assert!(ctx.dynlib_calls().is_none());
        assert!(ctx.loaded_libs_by_handle().is_none());
        assert!(ctx.symbol_access().is_none());
    }

    #[test]
    fn test_recorder_display() {
        assert_eq!(Recorder::SymbolAccess.to_string(), "symbol-access");
    }
}
