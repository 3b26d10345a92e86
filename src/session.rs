//! Traced workload execution
//!
//! Drives one workload through a freshly started runtime:
//! install interceptors, preload packages, run the workload and the
//! loader's support code, snapshot the module registry, assemble the
//! manifest. A failing workload still yields a (partial) manifest; only a
//! failed package preload aborts the trace.

use crate::config::TraceConfig;
use crate::context::{InstallReport, Recorder, TracerContext};
use crate::error::{GuestError, Result, TraceError};
use crate::manifest::{Manifest, ManifestAssembler};
use crate::module_registry::ModuleRegistrySnapshot;
use crate::runtime::GuestRuntime;

/// Result of a traced execution
#[derive(Debug)]
pub struct TraceOutcome {
    pub manifest: Manifest,
    pub install: InstallReport,
    /// Error the workload (or the support code) stopped with
    pub workload_error: Option<GuestError>,
    /// True when preload had to go through the installer package
    pub used_installer_fallback: bool,
}

/// How requested packages ended up loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadPath {
    /// Nothing to preload
    Skipped,
    /// Bulk load succeeded
    Bulk,
    /// Bulk load failed; packages were installed one by one through the installer
    Installer,
}

/// Preload `packages`, falling back to the installer package on failure
///
/// The fallback loads `installer` itself, then installs each package
/// through it. Failure of the fallback is fatal.
pub fn preload<R: GuestRuntime + ?Sized>(
    runtime: &mut R,
    packages: &[String],
    installer: &str,
) -> Result<PreloadPath> {
    if packages.is_empty() {
        return Ok(PreloadPath::Skipped);
    }

    match runtime.load_packages(packages) {
        Ok(()) => {
            tracing::info!(count = packages.len(), "packages preloaded");
            Ok(PreloadPath::Bulk)
        }
        Err(err) => {
            tracing::warn!(
                error = %err,
                "Failed to load packages with loadPackage, re-trying with {}.",
                installer
            );
            runtime
                .load_packages(&[installer.to_string()])
                .map_err(TraceError::Preload)?;
            for package in packages {
                tracing::debug!(package = package.as_str(), installer, "installing");
                runtime
                    .installer_install(installer, package)
                    .map_err(TraceError::Preload)?;
            }
            Ok(PreloadPath::Installer)
        }
    }
}

/// Run `source` under instrumentation and return its usage manifest
pub fn trace_workload<R: GuestRuntime + ?Sized>(
    runtime: &mut R,
    config: &TraceConfig,
    source: &str,
) -> Result<TraceOutcome> {
    config.validate()?;

    let mut context = TracerContext::new(config.recorders);
    let install = context.install(runtime);
    let registry_active = install.is_active(Recorder::ModuleRegistry);

    let before = if config.snapshot_before && registry_active {
        ModuleRegistrySnapshot::capture(runtime)
    } else {
        None
    };

    let preload_path = preload(runtime, &config.requires, &config.installer)?;

    tracing::info!("running workload");
    let mut workload_error = runtime.run(source).err();
    if let Some(err) = &workload_error {
        tracing::warn!(error = %err, "workload failed, manifest will be partial");
    } else {
        for code in &config.support_code {
            if let Err(err) = runtime.run(code) {
                tracing::warn!(error = %err, "support code failed");
                workload_error = Some(err);
                break;
            }
        }
    }

    let after = if registry_active {
        ModuleRegistrySnapshot::capture(runtime)
    } else {
        None
    };

    let manifest = ManifestAssembler::new(&context, source)
        .installer(&config.installer)
        .snapshots(before, after)
        .workload_error(workload_error.as_ref())
        .assemble(runtime);

    Ok(TraceOutcome {
        manifest,
        install,
        workload_error,
        used_installer_fallback: preload_path == PreloadPath::Installer,
    })
}
