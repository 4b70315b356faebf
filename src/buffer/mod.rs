//! # Buffer
//!
//! The virtual stack: a flat byte arena shaped by a [`ParamLayout`], with typed, bounds-checked accessors keyed by
//! parameter index.
//!
//! Generated code reads and writes these buffers through raw addresses, so every buffer reserves
//! [`ParamLayout::storage_size`] bytes, which includes a small zeroed tail past the last parameter.

use std::ffi::c_void;

use bytemuck::Pod;

use crate::signature::{ParamLayout, PassEncode};

/// A flat argument buffer laid out by a [`ParamLayout`]
///
/// `S` is the backing storage: an owned `Vec<u8>` for buffers handed to [`crate::call::CallHandle::execute`], or a
/// borrowed slice for the frame a hook trampoline builds on its own stack.
#[derive(Debug)]
pub struct VirtualStack<'l, S> {
    /// Offset table the storage follows
    layout: &'l ParamLayout,
    /// Backing bytes, at least `layout.storage_size()` long
    storage: S,
}

/// Owned argument buffer
pub type ArgBuffer<'l> = VirtualStack<'l, Vec<u8>>;

/// Argument frame borrowed from a running hook trampoline
pub type ArgFrame<'l, 'a> = VirtualStack<'l, &'a mut [u8]>;

impl<'l> VirtualStack<'l, Vec<u8>> {
    /// Creates a zeroed buffer for `layout`
    pub fn new(layout: &'l ParamLayout) -> Self {
        Self {
            layout,
            storage: vec![0; layout.storage_size()],
        }
    }
}

impl<'l, 'a> VirtualStack<'l, &'a mut [u8]> {
    /// Wraps a frame produced by generated code
    ///
    /// # Panics
    ///
    /// Panics if `storage` is shorter than the layout requires.
    pub fn from_frame(layout: &'l ParamLayout, storage: &'a mut [u8]) -> Self {
        assert!(
            storage.len() >= layout.storage_size(),
            "frame of {} bytes cannot hold a {} byte layout",
            storage.len(),
            layout.storage_size()
        );
        Self { layout, storage }
    }
}

impl<'l, S: AsRef<[u8]>> VirtualStack<'l, S> {
    /// Offset table of the buffer
    pub fn layout(&self) -> &'l ParamLayout {
        self.layout
    }

    /// Raw bytes, including the trailing slack
    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_ref()
    }

    /// Encoded parameter at `index`
    ///
    /// # Panics
    ///
    /// Panics if the signature has no parameter `index`.
    fn param(&self, index: usize) -> &'l PassEncode {
        self.layout.get(index).unwrap_or_else(|| {
            panic!(
                "parameter {index} out of range for a signature with {} parameters",
                self.layout.len()
            )
        })
    }

    /// Bytes of parameter `index`
    pub fn bytes(&self, index: usize) -> &[u8] {
        let range = self.param(index).range();
        &self.storage.as_ref()[range]
    }

    /// Reads parameter `index` as a `T`
    ///
    /// # Panics
    ///
    /// Panics if `T` is not exactly as large as the parameter.
    pub fn read<T: Pod>(&self, index: usize) -> T {
        bytemuck::pod_read_unaligned(self.bytes(index))
    }

    /// Reads the receiver slot
    ///
    /// # Panics
    ///
    /// Panics if the signature has no receiver.
    pub fn receiver(&self) -> *mut c_void {
        assert!(self.layout.has_receiver(), "signature has no receiver");
        let word = self.layout.word_size();
        let mut raw = [0u8; 8];
        raw[..word].copy_from_slice(&self.storage.as_ref()[..word]);
        u64::from_le_bytes(raw) as usize as *mut c_void
    }
}

impl<'l, S: AsRef<[u8]> + AsMut<[u8]>> VirtualStack<'l, S> {
    /// Mutable raw bytes, including the trailing slack
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut()
    }

    /// Pointer handed to generated code
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage.as_mut().as_mut_ptr()
    }

    /// Mutable bytes of parameter `index`
    pub fn bytes_mut(&mut self, index: usize) -> &mut [u8] {
        let range = self.param(index).range();
        &mut self.storage.as_mut()[range]
    }

    /// Writes `value` into parameter `index`
    ///
    /// # Panics
    ///
    /// Panics if `T` is not exactly as large as the parameter.
    pub fn write<T: Pod>(&mut self, index: usize, value: T) {
        let dst = self.bytes_mut(index);
        assert_eq!(
            dst.len(),
            std::mem::size_of::<T>(),
            "parameter {index} is {} bytes wide",
            dst.len()
        );
        dst.copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Writes a pointer into parameter `index`
    pub fn write_ptr<T>(&mut self, index: usize, ptr: *const T) {
        self.write(index, ptr as usize)
    }

    /// Stores the receiver in its slot at offset 0
    ///
    /// # Panics
    ///
    /// Panics if the signature has no receiver.
    pub fn set_receiver(&mut self, receiver: *const c_void) {
        assert!(self.layout.has_receiver(), "signature has no receiver");
        let word = self.layout.word_size();
        let raw = (receiver as usize as u64).to_le_bytes();
        self.storage.as_mut()[..word].copy_from_slice(&raw[..word]);
    }

    /// Copies the logical contents of `other` (receiver and parameters) into this buffer
    ///
    /// # Panics
    ///
    /// Panics if the two buffers follow different layouts.
    pub fn copy_from<T: AsRef<[u8]>>(&mut self, other: &VirtualStack<'_, T>) {
        assert_eq!(self.layout, other.layout, "buffers follow different layouts");
        let size = self.layout.size();
        self.storage.as_mut()[..size].copy_from_slice(&other.storage.as_ref()[..size]);
    }
}
