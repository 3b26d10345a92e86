//! File-access recorder
//!
//! Wraps the virtual filesystem's open entry point and keeps every
//! read-only open in call order. Duplicates are kept: re-opening a path is
//! a signal for the packer, not noise.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::GuestResult;
use crate::runtime::{FileHandle, FileOpener, OpenFlags};

/// Append-only sequence of read-mode opens
#[derive(Debug, Default, Clone)]
pub struct FileAccessLog {
    paths: Vec<String>,
}

impl FileAccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: &str) {
        self.paths.push(path.to_string());
    }

    /// Recorded paths in call order
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Interceptor installed in place of the runtime's file opener
pub struct TracingFileOpener {
    inner: Box<dyn FileOpener>,
    log: Rc<RefCell<FileAccessLog>>,
}

impl TracingFileOpener {
    pub fn new(inner: Box<dyn FileOpener>, log: Rc<RefCell<FileAccessLog>>) -> Self {
        Self { inner, log }
    }
}

impl FileOpener for TracingFileOpener {
    fn open(&mut self, path: &str, flags: OpenFlags) -> GuestResult<FileHandle> {
        if flags.is_read_only() {
            tracing::debug!(path, flags = flags.bits(), "read-only open");
            self.log.borrow_mut().record(path);
        }
        self.inner.open(path, flags)
    }

    fn is_traced(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuestError;

    struct Vfs;

    impl FileOpener for Vfs {
        fn open(&mut self, path: &str, flags: OpenFlags) -> GuestResult<FileHandle> {
            if path == "/missing" {
                return Err(GuestError::NotFound(path.to_string()));
            }
            Ok(FileHandle {
                fd: 10 + flags.bits(),
                path: path.to_string(),
            })
        }
    }

    fn traced() -> (TracingFileOpener, Rc<RefCell<FileAccessLog>>) {
        let log = Rc::new(RefCell::new(FileAccessLog::new()));
        (TracingFileOpener::new(Box::new(Vfs), Rc::clone(&log)), log)
    }

    #[test]
    fn test_only_read_mode_recorded() {
        let (mut opener, log) = traced();
        opener.open("/a", OpenFlags::READ_ONLY).unwrap();
        opener.open("/a", OpenFlags::WRITE_ONLY).unwrap();
        opener.open("/a", OpenFlags::READ_ONLY).unwrap();

        assert_eq!(log.borrow().paths(), ["/a", "/a"]);
    }

    #[test]
    fn test_result_passed_through() {
        let (mut opener, _log) = traced();
        let handle = opener.open("/b", OpenFlags(4)).unwrap();
        assert_eq!(handle, Vfs.open("/b", OpenFlags(4)).unwrap());
    }

    #[test]
    fn test_error_passed_through_and_still_recorded() {
        let (mut opener, log) = traced();
        let err = opener.open("/missing", OpenFlags::READ_ONLY).unwrap_err();
        assert_eq!(err, GuestError::NotFound("/missing".to_string()));
        // The call happened, so it is an event
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_marks_itself_traced() {
        let (opener, _log) = traced();
        assert!(opener.is_traced());
        assert!(!Vfs.is_traced());
    }
}
