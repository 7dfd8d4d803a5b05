//! A [`DRef`] guards the single kernel descriptor backing one stored
//! object: it opens on demand, hands out reference-counted borrows, and
//! closes the descriptor exactly once the last borrow drops and an
//! eviction has actually been requested.
//!
//! Two concurrent [`DRef::borrow`] calls on a cell whose file is already
//! open never perform a second `open(2)`; they share the same
//! [`std::fs::File`] through an `Arc`.

use parking_lot::Mutex;
use std::{
    fs::File,
    io,
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

#[derive(thiserror::Error, Debug)]
pub enum DRefError {
    #[error("failed to open {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DRefError>;

type Opener = dyn Fn(&Path) -> io::Result<File> + Send + Sync;

struct Inner {
    file: Option<Arc<File>>,
    generation: u64,
    pending_close: bool,
}

/// The guarded resource described in the data model as `DescriptorCell`.
///
/// `borrow_count` transitioning from 1 to 0 is the only moment the cell
/// may close its descriptor, and it closes only if [`DRef::request_close`]
/// was called while borrows were outstanding (or is called now that the
/// count has reached zero).
pub struct DRef {
    open_path: Mutex<PathBuf>,
    opener: Box<Opener>,
    inner: Mutex<Inner>,
    borrow_count: AtomicI64,
}

impl DRef {
    /// A cell that opens lazily on first borrow.
    pub fn new(
        open_path: PathBuf,
        opener: impl Fn(&Path) -> io::Result<File> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            open_path: Mutex::new(open_path),
            opener: Box::new(opener),
            inner: Mutex::new(Inner {
                file: None,
                generation: 0,
                pending_close: false,
            }),
            borrow_count: AtomicI64::new(0),
        })
    }

    /// A cell that already has a descriptor open (the create path: the
    /// writable fd returned by `Tier::create` becomes the cell's first
    /// generation). Later reopens (after eviction closes the writable fd)
    /// go through `opener`, which should reopen read-only.
    pub fn preopened(
        open_path: PathBuf,
        file: File,
        opener: impl Fn(&Path) -> io::Result<File> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            open_path: Mutex::new(open_path),
            opener: Box::new(opener),
            inner: Mutex::new(Inner {
                file: Some(Arc::new(file)),
                generation: 0,
                pending_close: false,
            }),
            borrow_count: AtomicI64::new(0),
        })
    }

    /// Ensures the descriptor is open, then hands out a borrow. No syscall
    /// is performed if the descriptor was already open.
    pub fn borrow(self: &Arc<Self>) -> Result<BorrowHandle> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            let path = self.open_path.lock().clone();
            let file = (self.opener)(&path).map_err(|source| DRefError::OpenFailed {
                path,
                source,
            })?;
            inner.file = Some(Arc::new(file));
            inner.pending_close = false;
        }
        let file = inner.file.clone().expect("just ensured open");
        let generation = inner.generation;
        drop(inner);

        self.borrow_count.fetch_add(1, Ordering::AcqRel);
        Ok(BorrowHandle {
            dref: self.clone(),
            file,
            generation,
        })
    }

    /// Marks the cell for close. Closes immediately if no borrow is
    /// outstanding, otherwise defers to the last `drop`.
    pub fn request_close(&self) {
        let mut inner = self.inner.lock();
        inner.pending_close = true;
        if self.borrow_count.load(Ordering::Acquire) == 0 {
            Self::close_locked(&mut inner);
        }
    }

    /// Points future reopens at a new locator (used after migration) and
    /// requests the current descriptor be closed. Borrows already handed
    /// out keep reading the old, still-open file: unlinking or renaming a
    /// path does not invalidate descriptors already open against it.
    pub fn repoint(&self, new_path: PathBuf) {
        *self.open_path.lock() = new_path;
        self.request_close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().file.is_some()
    }

    pub fn borrow_count(&self) -> i64 {
        self.borrow_count.load(Ordering::Acquire)
    }

    fn close_locked(inner: &mut Inner) {
        if inner.file.take().is_some() {
            inner.generation = inner.generation.wrapping_add(1);
        }
        inner.pending_close = false;
    }

    fn release(&self) {
        if self.borrow_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut inner = self.inner.lock();
            if inner.pending_close {
                Self::close_locked(&mut inner);
            }
        }
    }
}

/// A transient right to use a [`DRef`]'s open descriptor. Drop releases
/// the borrow; if it was the last one and a close is pending, the
/// descriptor is closed here.
pub struct BorrowHandle {
    dref: Arc<DRef>,
    file: Arc<File>,
    generation: u64,
}

impl BorrowHandle {
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for BorrowHandle {
    fn drop(&mut self) {
        self.dref.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn opener(path: &Path) -> io::Result<File> {
        OpenOptions::new().read(true).open(path)
    }

    #[test]
    fn concurrent_borrows_share_one_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("obj");
        std::fs::write(&path, b"hello").unwrap();

        let dref = DRef::new(path, opener);
        let b1 = dref.borrow().unwrap();
        let b2 = dref.borrow().unwrap();
        assert_eq!(b1.generation(), b2.generation());
        assert_eq!(dref.borrow_count(), 2);
        assert!(dref.is_open());

        drop(b1);
        assert!(dref.is_open());
        drop(b2);
        assert!(dref.is_open(), "no close requested, so stays open");
    }

    #[test]
    fn close_deferred_until_last_borrow_drops() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("obj");
        std::fs::write(&path, b"hello").unwrap();

        let dref = DRef::new(path, opener);
        let b1 = dref.borrow().unwrap();
        let gen0 = b1.generation();

        dref.request_close();
        assert!(dref.is_open(), "borrower outstanding, close must defer");

        drop(b1);
        assert!(!dref.is_open());

        let b2 = dref.borrow().unwrap();
        assert_ne!(b2.generation(), gen0, "generation advances across reopen");
    }

    #[test]
    fn repoint_forces_reopen_at_new_path() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old");
        let new_path = dir.path().join("new");
        std::fs::write(&old_path, b"old-bytes").unwrap();
        std::fs::write(&new_path, b"new-bytes").unwrap();

        let dref = DRef::new(old_path, opener);
        let old_borrow = dref.borrow().unwrap();

        dref.repoint(new_path);
        // old borrower keeps reading the old, still-open file.
        assert!(old_borrow.as_raw_fd() >= 0);
        drop(old_borrow);

        let fresh = dref.borrow().unwrap();
        let mut buf = Vec::new();
        use std::io::Read;
        fresh.file().try_clone().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"new-bytes");
    }
}
