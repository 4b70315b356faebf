//! Default page provider backed by anonymous memory maps

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use region::Protection;

use super::{PageError, PageProvider};

/// Anonymous mapping owned by [`SystemPages`]
struct MappedRegion(mmap::MemoryMap);

// Safety: the map is only touched through the provider's mutex, and the memory itself isn't thread-bound
unsafe impl Send for MappedRegion {}

/// Page provider mapping fresh anonymous memory for every request
///
/// Each allocation gets its own mapping, so protection changes never affect neighbouring code.
#[derive(Default)]
pub struct SystemPages {
    /// Live maps keyed by their start address; dropping a map unmaps it
    maps: Mutex<HashMap<usize, MappedRegion>>,
}

impl SystemPages {
    /// Creates an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a fresh mapping
    ///
    /// Windows views can't gain execute rights later unless the mapping allowed them up front; the view is switched
    /// to read/write before any byte is written.
    fn map_options() -> &'static [mmap::MapOption] {
        #[cfg(windows)]
        {
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
            ]
        }
        #[cfg(not(windows))]
        {
            &[mmap::MapOption::MapReadable, mmap::MapOption::MapWritable]
        }
    }
}

unsafe impl PageProvider for SystemPages {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, PageError> {
        let map = mmap::MemoryMap::new(size.max(1), Self::map_options()).map_err(PageError::Map)?;
        let ptr = NonNull::new(map.data()).ok_or(PageError::Null)?;

        self.maps
            .lock()
            .map_err(|_| PageError::Poisoned)?
            .insert(ptr.as_ptr() as usize, MappedRegion(map));

        tracing::trace!(address = ptr.as_ptr() as usize, size, "mapped code page");
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _size: usize) {
        match self.maps.lock() {
            Ok(mut maps) => {
                maps.remove(&(ptr.as_ptr() as usize));
            }
            Err(_) => tracing::warn!(
                address = ptr.as_ptr() as usize,
                "leaking code page, provider state is poisoned"
            ),
        }
    }

    unsafe fn mark_writable(&self, ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
        region::protect(ptr.as_ptr(), size, Protection::READ_WRITE)?;
        Ok(())
    }

    unsafe fn mark_executable(&self, ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
        region::protect(ptr.as_ptr(), size, Protection::READ_EXECUTE)?;
        Ok(())
    }
}
