//! Guest runtime abstraction
//!
//! The traced runtime is an external collaborator. The tracer only sees the
//! extension points listed on [`GuestRuntime`]: the file-open entry point,
//! the dynamic-library loader, the global symbol directory with its
//! registration hook, and the module registry.
//!
//! Each replaceable entry point lives in a [`Hook`]. Wrapping a hook moves
//! the current implementation inside the wrapper, so the runtime keeps
//! calling through the same slot and every call reaches the original.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{GuestError, GuestResult};

/// Access-mode descriptor passed to the file-open entry point
///
/// The virtual filesystem encodes write capability in the low-order bit:
/// even flags are read-only, odd flags may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// `O_RDONLY`
    pub const READ_ONLY: Self = Self(0);
    /// `O_WRONLY`
    pub const WRITE_ONLY: Self = Self(1);

    /// Raw flag bits
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True when the parity bit marks the open as read-only
    pub fn is_read_only(self) -> bool {
        self.0 % 2 == 0
    }
}

/// Handle returned by a successful file open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub fd: u32,
    pub path: String,
}

/// Result of a dynamic-library load
pub struct LoadResult {
    /// Runtime-assigned library handle
    pub handle: u64,
    /// Export table of the loaded library, registered by the runtime afterwards
    pub exports: LibraryExports,
}

impl fmt::Debug for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadResult")
            .field("handle", &self.handle)
            .field("exports", &self.exports)
            .finish()
    }
}

/// A callable exported by a guest library
///
/// Cloning shares the underlying callable; [`GuestFunction::ptr_eq`] tells
/// whether two values are the same function object.
#[derive(Clone)]
pub struct GuestFunction {
    inner: Rc<dyn Fn(&[i64]) -> GuestResult<i64>>,
}

impl GuestFunction {
    pub fn new(f: impl Fn(&[i64]) -> GuestResult<i64> + 'static) -> Self {
        Self { inner: Rc::new(f) }
    }

    pub fn call(&self, args: &[i64]) -> GuestResult<i64> {
        (self.inner)(args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for GuestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuestFunction(..)")
    }
}

/// A value stored in a library's export table
#[derive(Debug, Clone)]
pub enum ExportValue {
    /// Primitive exported value (global variable, constant)
    Data(i64),
    /// Callable export, possibly a lazily bound stub
    Function(GuestFunction),
}

impl ExportValue {
    pub fn is_callable(&self) -> bool {
        matches!(self, ExportValue::Function(_))
    }
}

/// Read interface of a library's export table
pub trait ExportTable {
    /// Look up an exported symbol
    fn get(&self, name: &str) -> Option<ExportValue>;

    /// Names of every exported symbol, for bookkeeping only
    fn symbol_names(&self) -> Vec<String>;

    /// Runtime-internal marker: has the lazy-binding machinery resolved this symbol?
    fn is_resolved(&self, name: &str) -> bool;

    /// Marker set by tracing wrappers so a table is never wrapped twice
    fn is_traced(&self) -> bool {
        false
    }
}

/// What the symbol directory holds for one library
pub enum LibraryExports {
    /// Structured export table
    Table(Box<dyn ExportTable>),
    /// Opaque numeric handle with no readable table
    Handle(u64),
}

impl LibraryExports {
    pub fn is_traced(&self) -> bool {
        match self {
            LibraryExports::Table(table) => table.is_traced(),
            LibraryExports::Handle(_) => false,
        }
    }

    /// Look up a symbol; opaque handles expose nothing
    pub fn get(&self, name: &str) -> Option<ExportValue> {
        match self {
            LibraryExports::Table(table) => table.get(name),
            LibraryExports::Handle(_) => None,
        }
    }
}

impl fmt::Debug for LibraryExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryExports::Table(table) => f
                .debug_struct("Table")
                .field("symbols", &table.symbol_names().len())
                .field("traced", &table.is_traced())
                .finish(),
            LibraryExports::Handle(handle) => f.debug_tuple("Handle").field(handle).finish(),
        }
    }
}

/// File-open entry point of the virtual filesystem
pub trait FileOpener {
    fn open(&mut self, path: &str, flags: OpenFlags) -> GuestResult<FileHandle>;

    fn is_traced(&self) -> bool {
        false
    }
}

/// Dynamic-library loader entry point
pub trait DynlibLoader {
    fn load(&mut self, path: &str, global: bool) -> GuestResult<LoadResult>;

    fn is_traced(&self) -> bool {
        false
    }
}

/// Hook invoked when a loaded library's table is registered in the directory
pub trait ExportRegistrar {
    /// Returns the exports that actually get stored under `library`
    fn register(&mut self, library: &str, exports: LibraryExports) -> LibraryExports;

    fn is_traced(&self) -> bool {
        false
    }
}

/// Registrar that stores tables as given
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRegistrar;

impl ExportRegistrar for PassthroughRegistrar {
    fn register(&mut self, _library: &str, exports: LibraryExports) -> LibraryExports {
        exports
    }
}

/// Replaceable slot holding one entry-point implementation
pub struct Hook<T: ?Sized> {
    slot: Option<Box<T>>,
}

impl<T: ?Sized> Hook<T> {
    pub fn new(implementation: Box<T>) -> Self {
        Self {
            slot: Some(implementation),
        }
    }

    /// Current implementation
    pub fn get(&self) -> Option<&T> {
        self.slot.as_deref()
    }

    /// Current implementation, mutably
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.slot.as_deref_mut()
    }

    /// Replace the implementation with a wrapper that takes ownership of it
    ///
    /// Returns false when the slot is empty.
    pub fn wrap(&mut self, wrapper: impl FnOnce(Box<T>) -> Box<T>) -> bool {
        match self.slot.take() {
            Some(original) => {
                self.slot = Some(wrapper(original));
                true
            }
            None => false,
        }
    }
}

impl<T: ?Sized> fmt::Debug for Hook<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("present", &self.slot.is_some())
            .finish()
    }
}

/// Global symbol directory: library name to exports
pub struct SymbolDirectory {
    libraries: BTreeMap<String, LibraryExports>,
    registrar: Hook<dyn ExportRegistrar>,
}

impl SymbolDirectory {
    pub fn new() -> Self {
        Self::with_registrar(Box::new(PassthroughRegistrar))
    }

    pub fn with_registrar(registrar: Box<dyn ExportRegistrar>) -> Self {
        Self {
            libraries: BTreeMap::new(),
            registrar: Hook::new(registrar),
        }
    }

    /// Register a freshly loaded library through the registration hook
    pub fn register(&mut self, library: &str, exports: LibraryExports) {
        let exports = match self.registrar.get_mut() {
            Some(registrar) => registrar.register(library, exports),
            None => exports,
        };
        self.libraries.insert(library.to_string(), exports);
    }

    pub fn contains(&self, library: &str) -> bool {
        self.libraries.contains_key(library)
    }

    pub fn get(&self, library: &str) -> Option<&LibraryExports> {
        self.libraries.get(library)
    }

    /// Resolve `symbol` inside `library`
    pub fn lookup(&self, library: &str, symbol: &str) -> GuestResult<ExportValue> {
        let exports = self
            .libraries
            .get(library)
            .ok_or_else(|| GuestError::Guest(format!("library not loaded: {}", library)))?;
        exports.get(symbol).ok_or_else(|| GuestError::UnknownSymbol {
            library: library.to_string(),
            symbol: symbol.to_string(),
        })
    }

    pub fn library_names(&self) -> Vec<String> {
        self.libraries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    pub fn registrar_hook(&mut self) -> &mut Hook<dyn ExportRegistrar> {
        &mut self.registrar
    }

    /// Mutable access to every registered table, used to wrap tables in place
    pub fn libraries_mut(&mut self) -> impl Iterator<Item = (&String, &mut LibraryExports)> {
        self.libraries.iter_mut()
    }
}

impl Default for SymbolDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SymbolDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolDirectory")
            .field("libraries", &self.libraries)
            .field("registrar", &self.registrar)
            .finish()
    }
}

/// One row of the guest's module registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRegistryEntry {
    pub module_name: String,
    /// `None` for built-in modules with no backing file
    pub file_path: Option<String>,
}

/// A live, sandboxed guest runtime
///
/// Extension points that a runtime build does not expose return `None`.
pub trait GuestRuntime {
    fn file_open_hook(&mut self) -> Option<&mut Hook<dyn FileOpener>>;

    fn dynlib_loader_hook(&mut self) -> Option<&mut Hook<dyn DynlibLoader>>;

    fn symbol_directory(&mut self) -> Option<&mut SymbolDirectory>;

    /// Current import registry, `None` if it cannot be read
    fn module_registry(&self) -> Option<Vec<ModuleRegistryEntry>>;

    /// Packages loaded so far: name to the channel they came from
    fn loaded_packages(&self) -> BTreeMap<String, String>;

    /// Directory the standard library is imported from
    fn stdlib_prefix(&self) -> Option<String>;

    /// Dependency-lock snapshot from the on-demand installer
    fn freeze_lock(&self) -> Option<serde_json::Value>;

    /// Bulk package preload
    fn load_packages(&mut self, packages: &[String]) -> GuestResult<()>;

    /// Install one package through an already loaded installer package
    fn installer_install(&mut self, installer: &str, package: &str) -> GuestResult<()>;

    /// Execute guest source text
    fn run(&mut self, source: &str) -> GuestResult<()>;
}
