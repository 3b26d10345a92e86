//! Usage manifest and its assembler
//!
//! The manifest is the only output of a trace: opened files, loader calls,
//! dereferenced symbols and the module registry, merged into one record for
//! the bundle packer. Fields of recorders that were not installed are left
//! out rather than emitted empty, so a consumer can tell "nothing used"
//! from "not observed".

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::{Recorder, TracerContext};
use crate::dynlib::DynlibCall;
use crate::error::{GuestError, Result};
use crate::module_registry::ModuleRegistrySnapshot;
use crate::runtime::GuestRuntime;

/// Manifest format identifier
pub const MANIFEST_FORMAT: &str = "packtrace-manifest-v1";

/// Module whose file location reveals the stdlib prefix when the runtime does not report it
const STDLIB_MARKER_MODULE: &str = "pathlib";

/// Provenance of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMeta {
    pub format: String,
    /// Version of packtrace that produced the manifest
    pub version: String,
    /// Hex SHA-256 of the workload source
    pub workload_sha256: String,
    /// Set when the workload stopped with an error; the manifest is then partial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_error: Option<String>,
}

/// Usage record of one workload execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub meta: ManifestMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_files: Option<Vec<String>>,
    #[serde(default)]
    pub loaded_packages: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dyn_lib_calls: Option<Vec<DynlibCall>>,
    /// Runtime handle to library path for every successful load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_libs_by_handle: Option<BTreeMap<u64, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_access: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_registry: Option<ModuleRegistrySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_registry_before: Option<ModuleRegistrySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdlib_prefix: Option<String>,
    /// Frozen dependency lock, present only when the on-demand installer ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<serde_json::Value>,
}

impl Manifest {
    /// True when the workload did not run to completion
    pub fn is_partial(&self) -> bool {
        self.meta.workload_error.is_some()
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Persist the manifest as JSON at `path`
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Hex SHA-256 digest of workload source text
pub fn workload_digest(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Normalize a runtime-reported stdlib prefix (runtimes report `//` in places)
pub fn normalize_stdlib_prefix(prefix: &str) -> String {
    let mut normalized = prefix.to_string();
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    normalized
}

/// Stdlib prefix derived from where the marker module was imported from
fn stdlib_prefix_from_registry(registry: &ModuleRegistrySnapshot) -> Option<String> {
    let path = registry.file_of(STDLIB_MARKER_MODULE).flatten()?;
    let suffix = format!("/{}.py", STDLIB_MARKER_MODULE);
    path.strip_suffix(suffix.as_str())
        .map(normalize_stdlib_prefix)
}

/// Merges recorder state and registry snapshots into a [`Manifest`]
///
/// Pure aggregation: nothing is recorded here, and any missing input just
/// leaves its field absent.
#[derive(Debug)]
pub struct ManifestAssembler<'a> {
    context: &'a TracerContext,
    workload_source: &'a str,
    installer: Option<&'a str>,
    before: Option<ModuleRegistrySnapshot>,
    after: Option<ModuleRegistrySnapshot>,
    workload_error: Option<String>,
}

impl<'a> ManifestAssembler<'a> {
    pub fn new(context: &'a TracerContext, workload_source: &'a str) -> Self {
        Self {
            context,
            workload_source,
            installer: None,
            before: None,
            after: None,
            workload_error: None,
        }
    }

    /// Name of the on-demand installer package whose lock should be frozen
    pub fn installer(mut self, installer: &'a str) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn snapshots(
        mut self,
        before: Option<ModuleRegistrySnapshot>,
        after: Option<ModuleRegistrySnapshot>,
    ) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    pub fn workload_error(mut self, error: Option<&GuestError>) -> Self {
        self.workload_error = error.map(ToString::to_string);
        self
    }

    pub fn assemble<R: GuestRuntime + ?Sized>(self, runtime: &R) -> Manifest {
        let loaded_packages = runtime.loaded_packages();

        let lock = self
            .installer
            .filter(|installer| loaded_packages.contains_key(*installer))
            .and_then(|_| runtime.freeze_lock());

        let registry_active = self
            .context
            .report()
            .is_some_and(|report| report.is_active(Recorder::ModuleRegistry));
        let (before, after) = if registry_active {
            (self.before, self.after)
        } else {
            (None, None)
        };

        let stdlib_prefix = runtime
            .stdlib_prefix()
            .map(|prefix| normalize_stdlib_prefix(&prefix))
            .or_else(|| after.as_ref().and_then(stdlib_prefix_from_registry));

        let manifest = Manifest {
            meta: ManifestMeta {
                format: MANIFEST_FORMAT.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                workload_sha256: workload_digest(self.workload_source),
                workload_error: self.workload_error,
            },
            opened_files: self.context.opened_files(),
            loaded_packages,
            dyn_lib_calls: self.context.dynlib_calls(),
            loaded_libs_by_handle: self.context.loaded_libs_by_handle(),
            symbol_access: self.context.symbol_access(),
            module_registry: after,
            module_registry_before: before,
            stdlib_prefix,
            lock,
        };
        tracing::info!(partial = manifest.is_partial(), "manifest assembled");
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ModuleRegistryEntry;

    #[test]
    fn test_digest_is_stable() {
        let a = workload_digest("import numpy");
        assert_eq!(a, workload_digest("import numpy"));
        assert_ne!(a, workload_digest("import scipy"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_normalize_stdlib_prefix() {
        assert_eq!(normalize_stdlib_prefix("/lib//python311.zip"), "/lib/python311.zip");
        assert_eq!(normalize_stdlib_prefix("///lib"), "/lib");
        assert_eq!(normalize_stdlib_prefix("/lib/python3.11"), "/lib/python3.11");
    }

    #[test]
    fn test_prefix_from_registry() {
        let registry = ModuleRegistrySnapshot::from_entries([ModuleRegistryEntry {
            module_name: "pathlib".to_string(),
            file_path: Some("/lib/python311.zip/pathlib.py".to_string()),
        }]);
        assert_eq!(
            stdlib_prefix_from_registry(&registry).as_deref(),
            Some("/lib/python311.zip")
        );
        assert!(stdlib_prefix_from_registry(&ModuleRegistrySnapshot::default()).is_none());
    }

    #[test]
    fn test_absent_fields_omitted() {
        let manifest = Manifest {
            meta: ManifestMeta {
                format: MANIFEST_FORMAT.to_string(),
                version: "0.0.0".to_string(),
                workload_sha256: workload_digest(""),
                workload_error: None,
            },
            opened_files: Some(vec!["/a".to_string()]),
            loaded_packages: BTreeMap::new(),
            dyn_lib_calls: None,
            loaded_libs_by_handle: None,
            symbol_access: None,
            module_registry: None,
            module_registry_before: None,
            stdlib_prefix: None,
            lock: None,
        };

        let json = manifest.to_json().unwrap();
        assert!(json.contains("\"openedFiles\""));
        assert!(json.contains("\"loadedPackages\""));
        assert!(!json.contains("dynLibCalls"));
        assert!(!json.contains("loadedLibsByHandle"));
        assert!(!json.contains("symbolAccess"));
        assert!(!json.contains("lock"));
        assert!(!json.contains("workloadError"));

        assert_eq!(Manifest::from_json(&json).unwrap(), manifest);
    }
}
