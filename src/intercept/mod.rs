//! # Intercept
//!
//! Swaps a single virtual-table entry for another function pointer. Tables usually live in read-only data, so the
//! page is made writable for the length of the write and its old protection restored straight after.

use std::marker::PhantomData;
use std::mem;
use std::ptr;

use region::Protection;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while swapping a table entry
#[derive(Debug, Error)]
pub enum InterceptError {
    /// The entry isn't aligned like a pointer
    #[error("vtable slot {0:#x} is not pointer aligned")]
    Misaligned(usize),
    /// The page holding the entry couldn't be made writable
    #[error("failed to unprotect vtable slot")]
    Protection(#[from] region::Error),
}

/// Writes `value` to `slot` with the page temporarily writable
///
/// # Safety
///
/// `slot` must be a live, aligned pointer-sized location.
unsafe fn write_slot(slot: *mut usize, value: usize) -> Result<usize, region::Error> {
    let _guard = region::protect_with_handle(slot as *const u8, mem::size_of::<usize>(), Protection::READ_WRITE)?;
    let previous = ptr::read_volatile(slot);
    ptr::write_volatile(slot, value);
    Ok(previous)
}

/// A swapped table entry, put back on drop
///
/// The lifetime ties the intercept to whatever owns the replacement code, so the entry can't outlive it.
#[must_use = "the table entry is restored as soon as the intercept drops"]
pub struct VtableIntercept<'a> {
    /// Table entry
    slot: *mut usize,
    /// Value the entry held before
    original: usize,
    /// Owner of the replacement
    _owner: PhantomData<&'a ()>,
}

impl<'a> VtableIntercept<'a> {
    /// Replaces the entry at `slot` with `replacement`
    ///
    /// # Safety
    ///
    /// `slot` must be a live table entry that stays valid for the life of the intercept, and `replacement` must be
    /// callable with the same signature as the function it replaces.
    pub unsafe fn install(slot: *mut usize, replacement: usize) -> Result<Self, InterceptError> {
        if slot as usize % mem::align_of::<usize>() != 0 {
            return Err(InterceptError::Misaligned(slot as usize));
        }

        let original = write_slot(slot, replacement)?;
        debug!(slot = ?slot, original = ?(original as *const u8), replacement = ?(replacement as *const u8), "vtable slot intercepted");
        Ok(Self {
            slot,
            original,
            _owner: PhantomData,
        })
    }

    /// Function the entry held before the intercept
    pub fn original(&self) -> usize {
        self.original
    }

    /// Address of the swapped entry
    pub fn slot(&self) -> *mut usize {
        self.slot
    }
}

impl Drop for VtableIntercept<'_> {
    fn drop(&mut self) {
        // Safety: the slot was writable through this same path when the intercept was installed
        if let Err(error) = unsafe { write_slot(self.slot, self.original) } {
            warn!(%error, slot = ?self.slot, "failed to restore vtable slot");
        }
    }
}
