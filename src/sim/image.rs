use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Contents of a simulated runtime image, loaded from TOML
///
/// # Example TOML
/// ```toml
/// stdlib_prefix = "/lib//python311.zip"
/// files = ["/lib/python311.zip/pathlib.py"]
///
/// [[library]]
/// path = "/lib/foo.so"
/// [[library.export]]
/// name = "bar"
/// kind = "function"
/// lazy = true
///
/// [[module]]
/// name = "pathlib"
/// file = "/lib/python311.zip/pathlib.py"
/// resident = true
///
/// [[package]]
/// name = "foo"
/// libraries = [{ path = "/lib/foo.so", global = true }]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimImage {
    /// Prefix the runtime reports for its standard library
    #[serde(default)]
    pub stdlib_prefix: Option<String>,

    /// Name of the on-demand installer package
    #[serde(default = "default_installer")]
    pub installer: String,

    /// Extra files present in the virtual filesystem
    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default, rename = "library")]
    pub libraries: Vec<LibrarySpec>,

    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleSpec>,

    #[serde(default, rename = "package")]
    pub packages: Vec<PackageSpec>,
}

fn default_installer() -> String {
    "micropip".to_string()
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// A shared object the loader can load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibrarySpec {
    pub path: String,
    /// Registered as a raw numeric handle instead of a readable table
    #[serde(default)]
    pub opaque: bool,
    #[serde(default, rename = "export")]
    pub exports: Vec<ExportSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Data,
    #[default]
    Function,
}

/// One exported symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ExportKind,
    /// Bound on first use instead of at load time
    #[serde(default)]
    pub lazy: bool,
    /// Data value, or the constant a function adds to the sum of its arguments
    #[serde(default)]
    pub value: i64,
}

/// An importable guest module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSpec {
    pub name: String,
    /// Backing file, `None` for built-ins
    #[serde(default)]
    pub file: Option<String>,
    /// Package that must be loaded before the module can be imported
    #[serde(default)]
    pub package: Option<String>,
    /// Modules imported when this one is
    #[serde(default)]
    pub imports: Vec<String>,
    /// Extension libraries loaded (locally) on import
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Already imported when the runtime starts
    #[serde(default)]
    pub resident: bool,
}

/// A library loaded eagerly when its package is installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageLibrary {
    pub path: String,
    #[serde(default)]
    pub global: bool,
}

/// An installable package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Files unpacked into the filesystem on install
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<PackageLibrary>,
    #[serde(default)]
    pub depends: Vec<String>,
    /// Not in the bulk loader's repository; only the installer can fetch it
    #[serde(default)]
    pub installer_only: bool,
}

impl SimImage {
    /// Parse and validate an image document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let image: Self =
            toml::from_str(content).with_context(|| "Failed to parse runtime image")?;
        image.validate()?;
        Ok(image)
    }

    /// Load an image from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read runtime image: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject duplicate names and dangling references
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for lib in &self.libraries {
            if !seen.insert(lib.path.as_str()) {
                anyhow::bail!("Duplicate library '{}'", lib.path);
            }
            let mut symbols = HashSet::new();
            for export in &lib.exports {
                if !symbols.insert(export.name.as_str()) {
                    anyhow::bail!("Duplicate export '{}' in library '{}'", export.name, lib.path);
                }
            }
        }

        let mut seen = HashSet::new();
        for package in &self.packages {
            if !seen.insert(package.name.as_str()) {
                anyhow::bail!("Duplicate package '{}'", package.name);
            }
            for dep in &package.depends {
                if self.package(dep).is_none() {
                    anyhow::bail!("Package '{}' depends on unknown package '{}'", package.name, dep);
                }
            }
        }
        self.check_dependency_cycles()?;

        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module.name.as_str()) {
                anyhow::bail!("Duplicate module '{}'", module.name);
            }
            if let Some(package) = &module.package {
                if self.package(package).is_none() {
                    anyhow::bail!(
                        "Module '{}' belongs to unknown package '{}'",
                        module.name,
                        package
                    );
                }
                if module.resident {
                    anyhow::bail!(
                        "Resident module '{}' cannot belong to package '{}'",
                        module.name,
                        package
                    );
                }
            }
        }
        Ok(())
    }

    /// Installing a package recurses into its dependencies, so they must form a DAG
    fn check_dependency_cycles(&self) -> Result<()> {
        let mut done: HashSet<&str> = HashSet::new();
        for package in &self.packages {
            let mut path = Vec::new();
            self.visit_dependencies(&package.name, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit_dependencies<'a>(
        &'a self,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|seen| *seen == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name);
            anyhow::bail!("Package dependency cycle: {}", cycle.join(" -> "));
        }
        path.push(name);
        if let Some(package) = self.package(name) {
            for dep in &package.depends {
                self.visit_dependencies(dep, path, done)?;
            }
        }
        path.pop();
        done.insert(name);
        Ok(())
    }

    pub fn library(&self, path: &str) -> Option<&LibrarySpec> {
        self.libraries.iter().find(|lib| lib.path == path)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|module| module.name == name)
    }

    pub fn package(&self, name: &str) -> Option<&PackageSpec> {
        self.packages.iter().find(|package| package.name == name)
    }

    /// Every path that exists in the filesystem at startup
    pub fn initial_paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .map(String::as_str)
            .chain(self.libraries.iter().map(|lib| lib.path.as_str()))
            .chain(self.modules.iter().filter_map(|m| m.file.as_deref()))
    }
}
