//! Dynamic-library recorder
//!
//! Eager loads issued during package preload and lazy loads issued while
//! the workload runs both go through the same loader entry point, so one
//! wrapper sees all of them.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::GuestResult;
use crate::runtime::{DynlibLoader, LoadResult};

/// One invocation of the loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynlibCall {
    pub path: String,
    /// Global (true) or local symbol visibility
    pub global: bool,
}

/// Append-only sequence of loader invocations, plus the handles of successful loads
#[derive(Debug, Default, Clone)]
pub struct DynlibCallLog {
    calls: Vec<DynlibCall>,
    handles: BTreeMap<u64, String>,
}

impl DynlibCallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: &str, global: bool) {
        self.calls.push(DynlibCall {
            path: path.to_string(),
            global,
        });
    }

    pub fn calls(&self) -> &[DynlibCall] {
        &self.calls
    }

    pub fn record_handle(&mut self, handle: u64, path: &str) {
        self.handles.insert(handle, path.to_string());
    }

    /// Runtime handle to library path, for loads that succeeded
    pub fn handles(&self) -> &BTreeMap<u64, String> {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Interceptor installed in place of the runtime's loader
pub struct TracingDynlibLoader {
    inner: Box<dyn DynlibLoader>,
    log: Rc<RefCell<DynlibCallLog>>,
}

impl TracingDynlibLoader {
    pub fn new(inner: Box<dyn DynlibLoader>, log: Rc<RefCell<DynlibCallLog>>) -> Self {
        Self { inner, log }
    }
}

impl DynlibLoader for TracingDynlibLoader {
    fn load(&mut self, path: &str, global: bool) -> GuestResult<LoadResult> {
        tracing::debug!(path, global, "loadDynlib");
        self.log.borrow_mut().record(path, global);
        let result = self.inner.load(path, global)?;
        self.log.borrow_mut().record_handle(result.handle, path);
        Ok(result)
    }

    fn is_traced(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuestError;
    use crate::runtime::LibraryExports;

    struct Loader {
        next: u64,
    }

    impl DynlibLoader for Loader {
        fn load(&mut self, path: &str, _global: bool) -> GuestResult<LoadResult> {
            if !path.ends_with(".so") {
                return Err(GuestError::DynlibLoad {
                    path: path.to_string(),
                    reason: "not a shared object".to_string(),
                });
            }
            self.next += 1;
            Ok(LoadResult {
                handle: self.next,
                exports: LibraryExports::Handle(self.next),
            })
        }
    }

    #[test]
    fn test_every_call_recorded_with_flag() {
        let log = Rc::new(RefCell::new(DynlibCallLog::new()));
        let mut loader = TracingDynlibLoader::new(Box::new(Loader { next: 0 }), Rc::clone(&log));

        assert_eq!(loader.load("/lib/a.so", true).unwrap().handle, 1);
        assert_eq!(loader.load("/lib/b.so", false).unwrap().handle, 2);
        assert_eq!(loader.load("/lib/a.so", false).unwrap().handle, 3);

        let log = log.borrow();
        assert_eq!(log.len(), 3);
        assert_eq!(log.handles()[&1], "/lib/a.so");
        assert_eq!(log.handles()[&3], "/lib/a.so");
        assert_eq!(
            log.calls()[0],
            DynlibCall {
                path: "/lib/a.so".to_string(),
                global: true
            }
        );
        assert!(!log.calls()[2].global);
    }

    #[test]
    fn test_failed_load_recorded_and_forwarded() {
        let log = Rc::new(RefCell::new(DynlibCallLog::new()));
        let mut loader = TracingDynlibLoader::new(Box::new(Loader { next: 0 }), Rc::clone(&log));

        let err = loader.load("/lib/libz.a", true).unwrap_err();
        assert!(matches!(err, GuestError::DynlibLoad { .. }));
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow().handles().is_empty());
    }

    #[test]
    fn test_call_serializes_flat() {
        let call = DynlibCall {
            path: "/lib/foo.so".to_string(),
            global: true,
        };
        let json = serde_json::to_string(&call).unwrap();
        assert_eq!(json, r#"{"path":"/lib/foo.so","global":true}"#);
    }
}
