//! # Alloc
//!
//! Pages holding generated code, following write-xor-execute: a page is handed out read/write, filled by the
//! emitter, then sealed read/execute before anything can run it. It is never both at once.
//!
//! The pages themselves come from an injected [`PageProvider`]; [`SystemPages`] is the default.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use lazy_static::lazy_static;
use thiserror::Error;

pub use self::system::SystemPages;

pub mod system;

/// Errors raised while obtaining or protecting code pages
#[derive(Debug, Error)]
pub enum PageError {
    /// The operating system refused the mapping
    #[error("failed to map code pages: {0}")]
    Map(mmap::MapError),
    /// Changing the protection of a page failed
    #[error("failed to change page protection")]
    Protection(#[from] region::Error),
    /// The provider handed out a null page
    #[error("page provider returned a null page")]
    Null,
    /// The provider's bookkeeping lock was poisoned by a panicking thread
    #[error("page provider state is poisoned")]
    Poisoned,
}

/// Source of the memory pages generated code lives in
///
/// # Safety
///
/// - `allocate` must return memory valid for reads and writes of at least `size` bytes, not handed out elsewhere
/// - the protection changes must apply to every byte of the given range
pub unsafe trait PageProvider: Send + Sync {
    /// Allocates at least `size` bytes of read/write memory
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, PageError>;

    /// Returns memory obtained from [`PageProvider::allocate`]
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe a live allocation of this provider; it must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);

    /// Makes the range read/write and not executable
    ///
    /// # Safety
    ///
    /// The range must belong to a live allocation of this provider, and no code may be running from it.
    unsafe fn mark_writable(&self, ptr: NonNull<u8>, size: usize) -> Result<(), PageError>;

    /// Makes the range read/execute and not writable
    ///
    /// # Safety
    ///
    /// The range must belong to a live allocation of this provider.
    unsafe fn mark_executable(&self, ptr: NonNull<u8>, size: usize) -> Result<(), PageError>;
}

lazy_static! {
    /// Provider used when the caller doesn't inject one
    static ref SYSTEM_PAGES: Arc<SystemPages> = Arc::new(SystemPages::new());
}

/// Shared handle to the default page provider
pub fn system_pages() -> Arc<dyn PageProvider> {
    SYSTEM_PAGES.clone()
}

/// A live allocation, released through its provider on drop
struct PageAllocation {
    /// Provider the memory came from
    provider: Arc<dyn PageProvider>,
    /// Start of the allocation
    ptr: NonNull<u8>,
    /// Length requested by the emitter
    len: usize,
}

impl Drop for PageAllocation {
    fn drop(&mut self) {
        // Safety: the allocation is owned by this value and nothing refers to it past this point
        unsafe { self.provider.free(self.ptr, self.len) }
    }
}

/// A page the emitter may write into
pub struct WritablePage(PageAllocation);

impl WritablePage {
    /// Allocates `len` bytes and makes them writable
    pub fn allocate(provider: &Arc<dyn PageProvider>, len: usize) -> Result<Self, PageError> {
        let ptr = provider.allocate(len)?;
        let allocation = PageAllocation {
            provider: provider.clone(),
            ptr,
            len,
        };

        // Safety: freshly allocated, so no code runs from it yet
        unsafe { provider.mark_writable(ptr, len)? };

        Ok(Self(allocation))
    }

    /// Address the code will run at
    pub fn address(&self) -> usize {
        self.0.ptr.as_ptr() as usize
    }

    /// Seals the page: it becomes executable and is no longer writable
    pub fn seal(self) -> Result<ExecutablePage, PageError> {
        let allocation = self.0;
        // Safety: `allocation` is live and owned by us
        unsafe {
            allocation
                .provider
                .mark_executable(allocation.ptr, allocation.len)?
        };
        Ok(ExecutablePage(allocation))
    }
}

impl Deref for WritablePage {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // Safety: the provider guarantees `len` readable bytes while the allocation lives
        unsafe { slice::from_raw_parts(self.0.ptr.as_ptr(), self.0.len) }
    }
}

impl DerefMut for WritablePage {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: the page is writable and uniquely borrowed through `self`
        unsafe { slice::from_raw_parts_mut(self.0.ptr.as_ptr(), self.0.len) }
    }
}

/// A sealed page holding finished code
pub struct ExecutablePage(PageAllocation);

// Safety: the page is immutable once sealed
unsafe impl Send for ExecutablePage {}
unsafe impl Sync for ExecutablePage {}

impl ExecutablePage {
    /// Entry point of the code
    pub fn as_ptr(&self) -> *const u8 {
        self.0.ptr.as_ptr()
    }

    /// Address of the entry point
    pub fn address(&self) -> usize {
        self.as_ptr() as usize
    }
}

impl Deref for ExecutablePage {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // Safety: read/execute pages stay readable for as long as the allocation lives
        unsafe { slice::from_raw_parts(self.0.ptr.as_ptr(), self.0.len) }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use region::Protection;

    use super::*;

    /// Provider that records every call and forwards to [`SystemPages`]
    #[derive(Default)]
    pub(crate) struct CountingPages {
        /// Real provider
        inner: SystemPages,
        /// Live allocations
        pub(crate) live: AtomicUsize,
        /// Protection transitions in order
        pub(crate) transitions: Mutex<Vec<&'static str>>,
    }

    unsafe impl PageProvider for CountingPages {
        fn allocate(&self, size: usize) -> Result<NonNull<u8>, PageError> {
            let ptr = self.inner.allocate(size)?;
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(ptr)
        }

        unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.inner.free(ptr, size)
        }

        unsafe fn mark_writable(&self, ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            self.transitions.lock().unwrap().push("rw");
            self.inner.mark_writable(ptr, size)
        }

        unsafe fn mark_executable(&self, ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            self.transitions.lock().unwrap().push("rx");
            self.inner.mark_executable(ptr, size)
        }
    }

    #[test]
    /// Pages go read/write, then read/execute, and are released on drop
    fn test_page_lifecycle() {
        let counting = Arc::new(CountingPages::default());
        let provider: Arc<dyn PageProvider> = counting.clone();

        let mut page = WritablePage::allocate(&provider, 16).unwrap();
        page[..2].copy_from_slice(&[0x90, 0xc3]);

        let region = region::query(page.as_ptr()).unwrap();
        assert_eq!(region.protection(), Protection::READ_WRITE);

        let page = page.seal().unwrap();
        assert_eq!(&page[..2], [0x90, 0xc3]);

        let region = region::query(page.as_ptr()).unwrap();
        assert_eq!(region.protection(), Protection::READ_EXECUTE);

        assert_eq!(counting.live.load(Ordering::SeqCst), 1);
        drop(page);
        assert_eq!(counting.live.load(Ordering::SeqCst), 0);
        assert_eq!(*counting.transitions.lock().unwrap(), ["rw", "rx"]);
    }
}
