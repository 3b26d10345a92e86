//! Module-registry snapshotter
//!
//! Point-in-time copy of the guest's import registry. No filtering and no
//! diffing happens here; comparing a pre-workload and a post-workload
//! snapshot is left to the consumer (see [`crate::analysis::fresh_modules`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::runtime::{GuestRuntime, ModuleRegistryEntry};

/// Module name to backing file path (`None` for built-ins)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleRegistrySnapshot {
    modules: BTreeMap<String, Option<String>>,
}

impl ModuleRegistrySnapshot {
    /// Read the registry now; `None` if the runtime exposes no registry
    pub fn capture<R: GuestRuntime + ?Sized>(runtime: &R) -> Option<Self> {
        let entries = runtime.module_registry()?;
        let snapshot = Self::from_entries(entries);
        tracing::debug!(modules = snapshot.len(), "module registry captured");
        Some(snapshot)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ModuleRegistryEntry>) -> Self {
        Self {
            modules: entries
                .into_iter()
                .map(|entry| (entry.module_name, entry.file_path))
                .collect(),
        }
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Backing file of `module`; outer `None` when the module is not imported
    pub fn file_of(&self, module: &str) -> Option<Option<&str>> {
        self.modules.get(module).map(Option::as_deref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.modules
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_deref()))
    }

    /// File paths of every module with a backing file, in name order
    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.modules.values().filter_map(|path| path.as_deref())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
