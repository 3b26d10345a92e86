//! Simulated guest runtime
//!
//! An in-memory runtime driven by line-oriented workload scripts. It has a
//! virtual filesystem, a dynamic-library loader with lazily bound exports,
//! a global symbol directory, a module registry and a package installer,
//! all reachable through [`GuestRuntime`]. Used by the CLI and for
//! differential runs with and without instrumentation.

mod image;
pub mod script;

pub use image::{ExportKind, ExportSpec, LibrarySpec, ModuleSpec, PackageLibrary, PackageSpec, SimImage};

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::error::{GuestError, GuestResult};
use crate::runtime::{
    DynlibLoader, ExportTable, ExportValue, FileHandle, FileOpener, GuestFunction, GuestRuntime,
    Hook, LibraryExports, LoadResult, ModuleRegistryEntry, OpenFlags, SymbolDirectory,
};
use script::Statement;

/// Channel recorded for packages from the bulk loader
const DEFAULT_CHANNEL: &str = "default channel";
/// Channel recorded for packages fetched by the installer
const INSTALLER_CHANNEL: &str = "pypi";

/// In-memory virtual filesystem
#[derive(Debug, Default)]
struct SimFs {
    files: BTreeSet<String>,
    next_fd: u32,
}

impl FileOpener for SimFs {
    fn open(&mut self, path: &str, flags: OpenFlags) -> GuestResult<FileHandle> {
        if flags.is_read_only() && !self.files.contains(path) {
            return Err(GuestError::NotFound(path.to_string()));
        }
        self.files.insert(path.to_string());
        self.next_fd += 1;
        Ok(FileHandle {
            fd: self.next_fd + 2,
            path: path.to_string(),
        })
    }
}

struct SimSymbol {
    value: ExportValue,
    resolved: Rc<Cell<bool>>,
}

/// Export table built from a [`LibrarySpec`]
///
/// Eager exports are resolved at load time; lazy functions resolve on
/// their first call, lazy data never does.
struct SimExportTable {
    symbols: BTreeMap<String, SimSymbol>,
}

impl SimExportTable {
    fn from_spec(spec: &LibrarySpec) -> Self {
        let symbols = spec
            .exports
            .iter()
            .map(|export| {
                let resolved = Rc::new(Cell::new(!export.lazy));
                let value = match export.kind {
                    ExportKind::Data => ExportValue::Data(export.value),
                    ExportKind::Function => {
                        let flag = Rc::clone(&resolved);
                        let base = export.value;
                        let name = export.name.clone();
                        ExportValue::Function(GuestFunction::new(move |args| {
                            flag.set(true);
                            args.iter()
                                .try_fold(base, |acc, arg| acc.checked_add(*arg))
                                .ok_or_else(|| {
                                    GuestError::Guest(format!("OverflowError: {} result out of range", name))
                                })
                        }))
                    }
                };
                (export.name.clone(), SimSymbol { value, resolved })
            })
            .collect();
        Self { symbols }
    }
}

impl ExportTable for SimExportTable {
    fn get(&self, name: &str) -> Option<ExportValue> {
        self.symbols.get(name).map(|symbol| symbol.value.clone())
    }

    fn symbol_names(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }

    fn is_resolved(&self, name: &str) -> bool {
        self.symbols
            .get(name)
            .is_some_and(|symbol| symbol.resolved.get())
    }
}

/// Loader resolving library paths against the image
struct SimLoader {
    image: Rc<SimImage>,
    next_handle: u64,
}

impl DynlibLoader for SimLoader {
    fn load(&mut self, path: &str, _global: bool) -> GuestResult<LoadResult> {
        let spec = self.image.library(path).ok_or_else(|| GuestError::DynlibLoad {
            path: path.to_string(),
            reason: "no such file".to_string(),
        })?;
        self.next_handle += 1;
        let handle = self.next_handle;
        let exports = if spec.opaque {
            LibraryExports::Handle(handle)
        } else {
            LibraryExports::Table(Box::new(SimExportTable::from_spec(spec)))
        };
        Ok(LoadResult { handle, exports })
    }
}

/// Extension points the runtime lets a tracer reach
#[derive(Debug, Clone, Copy)]
struct Exposure {
    file_open: bool,
    loader: bool,
    directory: bool,
    registry: bool,
}

/// A scripted, in-memory guest runtime
pub struct SimRuntime {
    image: Rc<SimImage>,
    fs: Hook<dyn FileOpener>,
    loader: Hook<dyn DynlibLoader>,
    directory: SymbolDirectory,
    modules: BTreeMap<String, Option<String>>,
    loaded_packages: BTreeMap<String, String>,
    output: Vec<String>,
    exposure: Exposure,
}

impl SimRuntime {
    /// Start a fresh runtime from an image
    pub fn new(image: SimImage) -> Self {
        let image = Rc::new(image);
        let fs = SimFs {
            files: image.initial_paths().map(String::from).collect(),
            next_fd: 0,
        };
        let modules = image
            .modules
            .iter()
            .filter(|module| module.resident)
            .map(|module| (module.name.clone(), module.file.clone()))
            .collect();
        Self {
            fs: Hook::new(Box::new(fs)),
            loader: Hook::new(Box::new(SimLoader {
                image: Rc::clone(&image),
                next_handle: 0,
            })),
            directory: SymbolDirectory::new(),
            modules,
            loaded_packages: BTreeMap::new(),
            output: Vec::new(),
            exposure: Exposure {
                file_open: true,
                loader: true,
                directory: true,
                registry: true,
            },
            image,
        }
    }

    /// Hide the file-open entry point from tracers
    pub fn without_file_hook(mut self) -> Self {
        self.exposure.file_open = false;
        self
    }

    /// Hide the dynamic-library loader from tracers
    pub fn without_loader_hook(mut self) -> Self {
        self.exposure.loader = false;
        self
    }

    /// Hide the symbol directory from tracers
    pub fn without_symbol_directory(mut self) -> Self {
        self.exposure.directory = false;
        self
    }

    /// Make the module registry unreadable
    pub fn without_module_registry(mut self) -> Self {
        self.exposure.registry = false;
        self
    }

    pub fn image(&self) -> &SimImage {
        &self.image
    }

    /// Lines printed by the workload so far
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Open a file through the (possibly wrapped) file-open entry point
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> GuestResult<FileHandle> {
        self.fs
            .get_mut()
            .ok_or_else(|| GuestError::Guest("filesystem unavailable".to_string()))?
            .open(path, flags)
    }

    /// Load a library through the (possibly wrapped) loader and register it
    pub fn load_dynlib(&mut self, path: &str, global: bool) -> GuestResult<u64> {
        let result = self
            .loader
            .get_mut()
            .ok_or_else(|| GuestError::Guest("loader unavailable".to_string()))?
            .load(path, global)?;
        if !self.directory.contains(path) {
            self.directory.register(path, result.exports);
        }
        Ok(result.handle)
    }

    fn lookup(&self, library: &str, symbol: &str) -> GuestResult<ExportValue> {
        self.directory.lookup(library, symbol)
    }

    fn import(&mut self, name: &str) -> GuestResult<()> {
        if self.modules.contains_key(name) {
            return Ok(());
        }
        let not_found = || GuestError::Guest(format!("ModuleNotFoundError: No module named '{}'", name));
        let spec = self.image.module(name).cloned().ok_or_else(not_found)?;
        if let Some(package) = &spec.package {
            if !self.loaded_packages.contains_key(package) {
                return Err(not_found());
            }
        }

        if let Some(file) = &spec.file {
            self.open(file, OpenFlags::READ_ONLY)?;
        }
        self.modules.insert(name.to_string(), spec.file.clone());

        let result = spec
            .libraries
            .iter()
            .try_for_each(|lib| self.load_dynlib(lib, false).map(|_| ()))
            .and_then(|()| spec.imports.iter().try_for_each(|dep| self.import(dep)));
        if result.is_err() {
            self.modules.remove(name);
        }
        result
    }

    fn install_package(&mut self, name: &str, channel: &str) -> GuestResult<()> {
        if self.loaded_packages.contains_key(name) {
            return Ok(());
        }
        let spec = self
            .image
            .package(name)
            .cloned()
            .ok_or_else(|| GuestError::PackageUnavailable(name.to_string()))?;
        for dep in &spec.depends {
            self.install_package(dep, channel)?;
        }
        for file in &spec.files {
            self.open(file, OpenFlags::WRITE_ONLY)?;
        }
        for lib in &spec.libraries {
            self.load_dynlib(&lib.path, lib.global)?;
        }
        self.loaded_packages.insert(name.to_string(), channel.to_string());
        Ok(())
    }

    /// Packages the bulk loader can provide, dependencies included
    fn check_bulk_available(&self, name: &str) -> GuestResult<()> {
        let spec = self
            .image
            .package(name)
            .filter(|spec| !spec.installer_only)
            .ok_or_else(|| GuestError::PackageUnavailable(name.to_string()))?;
        spec.depends
            .iter()
            .try_for_each(|dep| self.check_bulk_available(dep))
    }

    fn execute(&mut self, statement: Statement) -> GuestResult<()> {
        match statement {
            Statement::Open { path, write } => {
                let flags = if write {
                    OpenFlags::WRITE_ONLY
                } else {
                    OpenFlags::READ_ONLY
                };
                self.open(&path, flags).map(|_| ())
            }
            Statement::Dlopen { path, global } => self.load_dynlib(&path, global).map(|_| ()),
            Statement::Call {
                library,
                symbol,
                args,
            } => match self.lookup(&library, &symbol)? {
                ExportValue::Function(function) => {
                    let result = function.call(&args)?;
                    let args: Vec<String> = args.iter().map(i64::to_string).collect();
                    self.output
                        .push(format!("{}({}) = {}", symbol, args.join(", "), result));
                    Ok(())
                }
                ExportValue::Data(_) => Err(GuestError::Guest(format!(
                    "TypeError: '{}' is not callable",
                    symbol
                ))),
            },
            Statement::Read { library, symbol } => {
                let line = match self.lookup(&library, &symbol)? {
                    ExportValue::Data(value) => format!("{} = {}", symbol, value),
                    ExportValue::Function(_) => format!("{} = <function>", symbol),
                };
                self.output.push(line);
                Ok(())
            }
            Statement::Import(module) => self.import(&module),
            Statement::Install(package) => {
                let installer = self.image.installer.clone();
                if !self.loaded_packages.contains_key(&installer) {
                    self.load_packages(&[installer.clone()])?;
                }
                self.installer_install(&installer, &package)
            }
            Statement::Print(text) => {
                self.output.push(text);
                Ok(())
            }
            Statement::Fail(message) => Err(GuestError::Guest(message)),
        }
    }
}

impl GuestRuntime for SimRuntime {
    fn file_open_hook(&mut self) -> Option<&mut Hook<dyn FileOpener>> {
        self.exposure.file_open.then_some(&mut self.fs)
    }

    fn dynlib_loader_hook(&mut self) -> Option<&mut Hook<dyn DynlibLoader>> {
        self.exposure.loader.then_some(&mut self.loader)
    }

    fn symbol_directory(&mut self) -> Option<&mut SymbolDirectory> {
        self.exposure.directory.then_some(&mut self.directory)
    }

    fn module_registry(&self) -> Option<Vec<ModuleRegistryEntry>> {
        self.exposure.registry.then(|| {
            self.modules
                .iter()
                .map(|(name, file)| ModuleRegistryEntry {
                    module_name: name.clone(),
                    file_path: file.clone(),
                })
                .collect()
        })
    }

    fn loaded_packages(&self) -> BTreeMap<String, String> {
        self.loaded_packages.clone()
    }

    fn stdlib_prefix(&self) -> Option<String> {
        self.image.stdlib_prefix.clone()
    }

    fn freeze_lock(&self) -> Option<serde_json::Value> {
        if !self.loaded_packages.contains_key(&self.image.installer) {
            return None;
        }
        let packages: serde_json::Map<String, serde_json::Value> = self
            .loaded_packages
            .iter()
            .filter_map(|(name, channel)| {
                let spec = self.image.package(name)?;
                Some((
                    name.clone(),
                    serde_json::json!({
                        "name": name,
                        "version": spec.version,
                        "depends": spec.depends,
                        "source": channel,
                    }),
                ))
            })
            .collect();
        Some(serde_json::json!({
            "info": { "arch": "wasm32", "platform": "emscripten" },
            "packages": packages,
        }))
    }

    fn load_packages(&mut self, packages: &[String]) -> GuestResult<()> {
        packages
            .iter()
            .try_for_each(|name| self.check_bulk_available(name))?;
        packages
            .iter()
            .try_for_each(|name| self.install_package(name, DEFAULT_CHANNEL))
    }

    fn installer_install(&mut self, installer: &str, package: &str) -> GuestResult<()> {
        if !self.loaded_packages.contains_key(installer) {
            return Err(GuestError::Guest(format!(
                "ModuleNotFoundError: No module named '{}'",
                installer
            )));
        }
        self.install_package(package, INSTALLER_CHANNEL)
    }

    fn run(&mut self, source: &str) -> GuestResult<()> {
        let statements = script::parse(source)?;
        statements
            .into_iter()
            .try_for_each(|statement| self.execute(statement))
    }
}
