//! Manifest analysis helpers for the bundle packer
//!
//! Read-only views over a finished [`Manifest`]: filtered file lists, the
//! paths imported under a prefix, the dynamic libraries worth keeping and
//! the modules a workload pulled in on top of a base image.

use std::cmp::Ordering;
use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use crate::error::TraceError;
use crate::manifest::Manifest;
use crate::module_registry::ModuleRegistrySnapshot;

/// Regex filter for opened paths the packer should ignore
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    patterns: Vec<Regex>,
}

impl ExcludeFilter {
    /// Compile a list of patterns
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, TraceError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|e| {
                    TraceError::Config(format!("Invalid exclude pattern '{}': {}", pattern.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// A filter that keeps everything
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(path))
    }
}

/// Drop duplicates, keeping the first occurrence of each item
fn dedup_in_order(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Opened files without excluded paths or repeats, in first-open order
pub fn opened_files_filtered(manifest: &Manifest, filter: &ExcludeFilter) -> Vec<String> {
    let opened = manifest.opened_files.as_deref().unwrap_or_default();
    dedup_in_order(
        opened
            .iter()
            .filter(|path| !filter.is_excluded(path))
            .cloned(),
    )
}

/// Every path the workload imported or opened
///
/// Registry file paths come first, then opened files, without repeats.
/// With `strip_prefix`, only paths under the prefix are kept, relative to it.
pub fn imported_paths(manifest: &Manifest, strip_prefix: Option<&str>) -> Vec<String> {
    let registry = manifest
        .module_registry
        .iter()
        .flat_map(|snapshot| snapshot.file_paths().map(String::from));
    let opened = manifest.opened_files.iter().flatten().cloned();
    let paths = registry.chain(opened);

    match strip_prefix {
        None => dedup_in_order(paths),
        Some(prefix) => {
            let dir = format!("{}/", prefix.trim_end_matches('/'));
            dedup_in_order(paths.filter_map(|path| path.strip_prefix(dir.as_str()).map(String::from)))
        }
    }
}

/// A dynamic library to ship, in the order it must be loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicLib {
    pub path: String,
    /// Index of the first load call for this path
    pub load_order: usize,
    /// Loaded with global symbol visibility at least once
    pub shared: bool,
}

impl PartialOrd for DynamicLib {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DynamicLib {
    fn cmp(&self, other: &Self) -> Ordering {
        self.load_order
            .cmp(&other.load_order)
            .then_with(|| self.path.cmp(&other.path))
    }
}

/// Shared objects the workload needs, sorted by load order
///
/// A library is kept when one of its symbols was dereferenced or when it
/// was loaded globally (other libraries may bind against it). Without
/// symbol data every loaded shared object is kept.
pub fn dynamic_libs(manifest: &Manifest) -> Vec<DynamicLib> {
    let Some(calls) = manifest.dyn_lib_calls.as_deref() else {
        return Vec::new();
    };

    let mut libs: Vec<DynamicLib> = Vec::new();
    for (idx, call) in calls.iter().enumerate() {
        if !call.path.ends_with(".so") {
            continue;
        }
        match libs.iter_mut().find(|lib| lib.path == call.path) {
            Some(lib) => lib.shared |= call.global,
            None => libs.push(DynamicLib {
                path: call.path.clone(),
                load_order: idx,
                shared: call.global,
            }),
        }
    }

    if let Some(access) = &manifest.symbol_access {
        libs.retain(|lib| lib.shared || access.contains_key(&lib.path));
    }
    libs.sort();
    libs
}

/// Modules present after the workload but not before, in name order
pub fn fresh_modules(before: &ModuleRegistrySnapshot, after: &ModuleRegistrySnapshot) -> Vec<String> {
    after
        .iter()
        .filter(|(name, _)| !before.contains(name))
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Most likely full path ending with `suffix`
///
/// With several candidates the shortest wins: `numpy/__init__.py` should
/// match the top-level package, not a copy vendored inside another one.
pub fn match_suffix<'a>(paths: &'a [String], suffix: &str) -> Option<&'a str> {
    paths
        .iter()
        .filter(|path| path.ends_with(suffix))
        .min_by_key(|path| path.len())
        .map(String::as_str)
}

/// What the bundle packer keeps from a manifest, exclusions applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    /// Opened files minus excluded paths and repeats
    pub opened_files: Vec<String>,
    pub dynamic_libs: Vec<DynamicLib>,
    /// Only with a pre-workload registry snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fresh_modules: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdlib_prefix: Option<String>,
}

impl UsageSummary {
    pub fn from_manifest(manifest: &Manifest, filter: &ExcludeFilter) -> Self {
        let fresh = manifest
            .module_registry_before
            .as_ref()
            .zip(manifest.module_registry.as_ref())
            .map(|(before, after)| fresh_modules(before, after));
        Self {
            opened_files: opened_files_filtered(manifest, filter),
            dynamic_libs: dynamic_libs(manifest),
            fresh_modules: fresh,
            stdlib_prefix: manifest.stdlib_prefix.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, TraceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
