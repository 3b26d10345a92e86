// Trace configuration
//
// Read from a standalone packtrace.toml or from the [tool.packtrace] table
// of the nearest pyproject.toml.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analysis::ExcludeFilter;
use crate::context::RecorderSelection;
use crate::error::TraceError;

/// Configuration for one traced workload execution
///
/// # Example
/// ```
/// use packtrace::config::TraceConfig;
///
/// let config = TraceConfig::default();
/// assert_eq!(config.installer, "micropip");
/// assert!(config.recorders.symbols);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    /// Packages preloaded before the workload runs
    pub requires: Vec<String>,

    /// Installer package used when bulk preload fails, and whose lock is frozen
    pub installer: String,

    /// Guest code run after the workload, for imports the bundle loader itself needs
    pub support_code: Vec<String>,

    /// Also snapshot the module registry before the workload runs
    pub snapshot_before: bool,

    /// Regexes of opened paths ignored by manifest analysis
    pub exclude: Vec<String>,

    /// Recorders to install
    pub recorders: RecorderSelection,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            requires: Vec::new(),
            installer: "micropip".to_string(),
            support_code: vec!["import pyodide.http".to_string()],
            snapshot_before: false,
            exclude: vec!["__pycache__".to_string()],
            recorders: RecorderSelection::default(),
        }
    }
}

impl TraceConfig {
    /// Parse a standalone configuration document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).with_context(|| "Failed to parse packtrace configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the `[tool.packtrace]` table of a pyproject document
    ///
    /// Returns `None` when the table is missing.
    pub fn from_pyproject_str(content: &str) -> Result<Option<Self>> {
        let document: toml::Table =
            toml::from_str(content).with_context(|| "Failed to parse pyproject.toml")?;
        let Some(section) = document
            .get("tool")
            .and_then(|tool| tool.get("packtrace"))
            .cloned()
        else {
            return Ok(None);
        };
        let config = section
            .try_into::<Self>()
            .with_context(|| "Invalid [tool.packtrace] section")?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load a configuration file; `pyproject.toml` files are read through their tool table
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        if path.file_name().is_some_and(|name| name == "pyproject.toml") {
            let config = Self::from_pyproject_str(&content)?;
            Ok(config.unwrap_or_default())
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Find the configuration governing `start`: a `packtrace.toml` or a
    /// `pyproject.toml` with a `[tool.packtrace]` table, searched upwards
    pub fn discover(start: &Path) -> Result<Option<Self>> {
        let Some(path) = find_config_file(start) else {
            return Ok(None);
        };
        tracing::debug!(path = %path.display(), "using configuration");
        if path.file_name().is_some_and(|name| name == "pyproject.toml") {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_pyproject_str(&content)
        } else {
            Self::from_file(&path).map(Some)
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), TraceError> {
        if self.installer.trim().is_empty() {
            return Err(TraceError::Config(
                "installer must name a package".to_string(),
            ));
        }

        if let Some(empty) = self.requires.iter().position(|p| p.trim().is_empty()) {
            return Err(TraceError::Config(format!(
                "requires[{}] is an empty package name",
                empty
            )));
        }

        self.exclude_filter().map(|_| ())
    }

    /// Compile the exclusion regexes
    pub fn exclude_filter(&self) -> std::result::Result<ExcludeFilter, TraceError> {
        ExcludeFilter::new(&self.exclude)
    }
}

/// Nearest `packtrace.toml`, or `pyproject.toml` mentioning the tool, in `start` or a parent
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = if start.is_dir() { start } else { start.parent()? };
    loop {
        let standalone = dir.join("packtrace.toml");
        if standalone.is_file() {
            return Some(standalone);
        }
        let pyproject = dir.join("pyproject.toml");
        if pyproject.is_file()
            && std::fs::read_to_string(&pyproject)
                .map(|content| content.contains("[tool.packtrace"))
                .unwrap_or(false)
        {
            return Some(pyproject);
        }
        dir = dir.parent()?;
    }
}
