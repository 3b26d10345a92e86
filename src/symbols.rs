//! Symbol-access recorder
//!
//! Every library export table registered in the symbol directory is
//! wrapped in a [`TracedExports`] decorator. The decorator answers reads
//! exactly like the table it wraps and records which symbols the guest
//! actually dereferences:
//!
//! - a symbol the runtime's lazy-binding machinery already resolved is
//!   recorded on read and returned as is;
//! - an unresolved callable stub is handed out behind a forwarding
//!   callable that records the symbol right before its first call, so the
//!   stub is never resolved early;
//! - unresolved data is returned unchanged and not recorded.
//!
//! Once a `(library, symbol)` pair is recorded, reads skip the decorator
//! logic and return the inner value directly.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use fnv::{FnvHashMap, FnvHashSet};

use crate::runtime::{
    ExportRegistrar, ExportTable, ExportValue, GuestFunction, LibraryExports, SymbolDirectory,
};

/// Library name to the distinct symbols dereferenced through its table
#[derive(Debug, Default, Clone)]
pub struct SymbolAccess {
    by_library: FnvHashMap<String, FnvHashSet<String>>,
}

impl SymbolAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access; returns false if the pair was already recorded
    pub fn record(&mut self, library: &str, symbol: &str) -> bool {
        self.by_library
            .entry(library.to_string())
            .or_default()
            .insert(symbol.to_string())
    }

    pub fn contains(&self, library: &str, symbol: &str) -> bool {
        self.by_library
            .get(library)
            .is_some_and(|symbols| symbols.contains(symbol))
    }

    /// Number of distinct recorded pairs
    pub fn len(&self) -> usize {
        self.by_library.values().map(FnvHashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted view for serialization
    pub fn to_sorted(&self) -> BTreeMap<String, Vec<String>> {
        self.by_library
            .iter()
            .filter(|(_, symbols)| !symbols.is_empty())
            .map(|(library, symbols)| {
                let mut symbols: Vec<String> = symbols.iter().cloned().collect();
                symbols.sort();
                (library.clone(), symbols)
            })
            .collect()
    }
}

fn record_access(access: &RefCell<SymbolAccess>, library: &str, symbol: &str) {
    if access.borrow_mut().record(library, symbol) {
        tracing::debug!(library, symbol, "symbol accessed");
    }
}

/// Decorator over one library's export table
pub struct TracedExports {
    library: String,
    inner: Box<dyn ExportTable>,
    access: Rc<RefCell<SymbolAccess>>,
}

impl TracedExports {
    pub fn new(
        library: impl Into<String>,
        inner: Box<dyn ExportTable>,
        access: Rc<RefCell<SymbolAccess>>,
    ) -> Self {
        Self {
            library: library.into(),
            inner,
            access,
        }
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    fn recording_stub(&self, symbol: &str, target: GuestFunction) -> GuestFunction {
        let access = Rc::clone(&self.access);
        let library = self.library.clone();
        let symbol = symbol.to_string();
        GuestFunction::new(move |args| {
            record_access(&access, &library, &symbol);
            target.call(args)
        })
    }
}

impl ExportTable for TracedExports {
    fn get(&self, name: &str) -> Option<ExportValue> {
        let value = self.inner.get(name)?;
        if self.access.borrow().contains(&self.library, name) {
            return Some(value);
        }
        if self.inner.is_resolved(name) {
            record_access(&self.access, &self.library, name);
            return Some(value);
        }
        match value {
            ExportValue::Function(stub) => Some(ExportValue::Function(self.recording_stub(name, stub))),
            data @ ExportValue::Data(_) => Some(data),
        }
    }

    fn symbol_names(&self) -> Vec<String> {
        self.inner.symbol_names()
    }

    fn is_resolved(&self, name: &str) -> bool {
        self.inner.is_resolved(name)
    }

    fn is_traced(&self) -> bool {
        true
    }
}

/// Wrap a library's exports unless they are opaque or already traced
pub fn wrap_exports(
    library: &str,
    exports: LibraryExports,
    access: &Rc<RefCell<SymbolAccess>>,
) -> LibraryExports {
    match exports {
        LibraryExports::Table(table) if !table.is_traced() => LibraryExports::Table(Box::new(
            TracedExports::new(library, table, Rc::clone(access)),
        )),
        other => other,
    }
}

/// Wrap every table already registered in `directory`; returns how many were wrapped
pub fn wrap_registered(directory: &mut SymbolDirectory, access: &Rc<RefCell<SymbolAccess>>) -> usize {
    let mut wrapped = 0;
    for (library, exports) in directory.libraries_mut() {
        if matches!(exports, LibraryExports::Table(_)) && !exports.is_traced() {
            let original = std::mem::replace(exports, LibraryExports::Handle(0));
            *exports = wrap_exports(library, original, access);
            wrapped += 1;
        }
    }
    wrapped
}

/// Interceptor installed on the directory's registration hook
pub struct TracingRegistrar {
    inner: Box<dyn ExportRegistrar>,
    access: Rc<RefCell<SymbolAccess>>,
}

impl TracingRegistrar {
    pub fn new(inner: Box<dyn ExportRegistrar>, access: Rc<RefCell<SymbolAccess>>) -> Self {
        Self { inner, access }
    }
}

impl ExportRegistrar for TracingRegistrar {
    fn register(&mut self, library: &str, exports: LibraryExports) -> LibraryExports {
        let exports = self.inner.register(library, exports);
        tracing::debug!(library, "wrapping export table");
        wrap_exports(library, exports, &self.access)
    }

    fn is_traced(&self) -> bool {
        true
    }
}
