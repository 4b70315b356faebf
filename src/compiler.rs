//! # Compiler
//!
//! Entry points for building trampolines. A [`Compiler`] pairs a target platform with the page provider its code
//! goes into; the free functions use one for the running host with the system pages.
//!
//! ```no_run
//! use libtrampoline::signature::{CallConvention, FunctionFlags, PassInfo};
//!
//! extern "C" fn add(a: i32, b: i32) -> i32 {
//!     a + b
//! }
//!
//! let call = libtrampoline::compile_call(
//!     add as usize,
//!     CallConvention::Cdecl,
//!     Some(PassInfo::signed(4)),
//!     vec![PassInfo::signed(4), PassInfo::signed(4)],
//!     FunctionFlags::empty(),
//! )
//! .unwrap();
//!
//! let mut args = call.new_args();
//! args.write(0, 2i32);
//! args.write(1, 3i32);
//! let mut ret = [0u8; 4];
//! unsafe { call.execute(&mut args, &mut ret) };
//! assert_eq!(i32::from_ne_bytes(ret), 5);
//! ```

use std::fmt;
use std::ptr;
use std::sync::Arc;

use crate::abi::{backend, CallAbi, HookContext, Target};
use crate::alloc::{system_pages, PageProvider};
use crate::call::{write_forward, CallHandle, CallTarget};
use crate::code;
use crate::error::CompileError;
use crate::hook::{HookAction, HookHandle, HookInvocation};
use crate::signature::{CallConvention, FunctionFlags, ParamLayout, PassInfo, Signature};

/// Builds trampolines for one platform into one page provider
///
/// Compilation keeps all of its state on the calling thread, so a single compiler can be shared between threads.
#[derive(Clone)]
pub struct Compiler {
    /// Calling conventions of the platform
    abi: &'static dyn CallAbi,
    /// Where generated code lives
    pages: Arc<dyn PageProvider>,
}

impl Compiler {
    /// Compiler for the running platform using the system pages
    pub fn host() -> Result<Self, CompileError> {
        let target = Target::host().ok_or(CompileError::UnsupportedHost)?;
        Ok(Self::new(target, system_pages()))
    }

    /// Compiler for `target` placing its code in `pages`
    ///
    /// Code for a foreign target can be inspected but not run.
    pub fn new(target: Target, pages: Arc<dyn PageProvider>) -> Self {
        Self {
            abi: backend(target),
            pages,
        }
    }

    /// Platform the compiler emits code for
    pub fn target(&self) -> Target {
        self.abi.target()
    }

    /// Compiles a call to the function at `target`
    ///
    /// # Panics
    ///
    /// Panics if the signature is malformed.
    pub fn compile_call(
        &self,
        target: usize,
        convention: CallConvention,
        ret: Option<PassInfo>,
        params: Vec<PassInfo>,
        flags: FunctionFlags,
    ) -> Result<CallHandle, CompileError> {
        self.compile_signature_call(Signature::new(convention, ret, params, flags), target)
    }

    /// Compiles a call to the function at `target` described by `signature`
    pub fn compile_signature_call(&self, signature: Signature, target: usize) -> Result<CallHandle, CompileError> {
        CallHandle::compile(self.abi, &self.pages, signature, CallTarget::Direct(target))
    }

    /// Compiles a `thiscall` through slot `vtable_index` of the receiver's virtual table
    ///
    /// The receiver is adjusted by `this_offset` and the table pointer read `vtable_offset` bytes into it. The
    /// adjusted receiver is what the callee sees.
    pub fn compile_virtual_call(
        &self,
        vtable_index: usize,
        vtable_offset: usize,
        this_offset: usize,
        ret: Option<PassInfo>,
        params: Vec<PassInfo>,
        flags: FunctionFlags,
    ) -> Result<CallHandle, CompileError> {
        let signature = Signature::new(CallConvention::ThisCall, ret, params, flags);
        CallHandle::compile(
            self.abi,
            &self.pages,
            signature,
            CallTarget::Virtual {
                vtable_index,
                vtable_offset,
                this_offset,
            },
        )
    }

    /// Compiles a hook for functions of `signature`, recalling `original`
    ///
    /// The returned handle's entry point can replace `original` anywhere callers reach it through a pointer.
    pub fn compile_hook<F>(&self, signature: Signature, handler: F, original: usize) -> Result<HookHandle, CompileError>
    where
        F: Fn(&mut HookInvocation<'_>) -> HookAction + Send + Sync + 'static,
    {
        HookHandle::compile(self.abi, &self.pages, signature, original, Box::new(handler))
    }

    /// Hooks the function currently in the table entry at `slot`, returning the hook and that function
    ///
    /// The entry itself is left alone; [`HookHandle::install_vtable`] swaps it.
    ///
    /// # Safety
    ///
    /// `slot` must be a readable, pointer-aligned table entry holding a function of `signature`.
    pub unsafe fn hook_vtable_slot<F>(
        &self,
        signature: Signature,
        slot: *mut usize,
        handler: F,
    ) -> Result<(HookHandle, usize), CompileError>
    where
        F: Fn(&mut HookInvocation<'_>) -> HookAction + Send + Sync + 'static,
    {
        let original = ptr::read_volatile(slot);
        let hook = self.compile_hook(signature, handler, original)?;
        Ok((hook, original))
    }

    /// Emits a forward trampoline into a plain buffer as if it ran at `base`
    pub fn emit_call(&self, signature: &Signature, target: CallTarget, base: usize) -> Result<Vec<u8>, CompileError> {
        let layout = ParamLayout::new(signature, self.target().word_size());
        code::assemble_to_vec(base, |jit, state| {
            write_forward(self.abi, jit, state, signature, &layout, &target)
        })
    }

    /// Emits a hook trampoline into a plain buffer as if it ran at `base`
    ///
    /// `hook` and `dispatcher` are embedded as given; the code is for reading, not running.
    pub fn emit_hook(
        &self,
        signature: &Signature,
        hook: usize,
        dispatcher: usize,
        base: usize,
    ) -> Result<Vec<u8>, CompileError> {
        let layout = ParamLayout::new(signature, self.target().word_size());
        let context = HookContext {
            signature,
            layout: &layout,
            hook,
            dispatcher,
        };
        code::assemble_to_vec(base, |jit, state| self.abi.write_hook(jit, state, &context))
    }
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("target", &self.target())
            .finish_non_exhaustive()
    }
}

/// Compiles a call to the function at `target` for the running platform
pub fn compile_call(
    target: usize,
    convention: CallConvention,
    ret: Option<PassInfo>,
    params: Vec<PassInfo>,
    flags: FunctionFlags,
) -> Result<CallHandle, CompileError> {
    Compiler::host()?.compile_call(target, convention, ret, params, flags)
}

/// Compiles a virtual call for the running platform
pub fn compile_virtual_call(
    vtable_index: usize,
    vtable_offset: usize,
    this_offset: usize,
    ret: Option<PassInfo>,
    params: Vec<PassInfo>,
    flags: FunctionFlags,
) -> Result<CallHandle, CompileError> {
    Compiler::host()?.compile_virtual_call(vtable_index, vtable_offset, this_offset, ret, params, flags)
}

/// Compiles a hook for the running platform
pub fn compile_hook<F>(signature: Signature, handler: F, original: usize) -> Result<HookHandle, CompileError>
where
    F: Fn(&mut HookInvocation<'_>) -> HookAction + Send + Sync + 'static,
{
    Compiler::host()?.compile_hook(signature, handler, original)
}
