//! # Hook
//!
//! Hook trampolines: generated entry points with a native signature that repack every incoming call into a flat
//! parameter frame and hand it to a Rust handler.
//!
//! The handler sees the receiver, the parameters and the return buffer through a [`HookInvocation`]. It can edit
//! any of them, call the original implementation itself with [`HookInvocation::recall`], and decide with its
//! [`HookAction`] whether the original still runs afterwards. By-reference parameters are copied into the frame
//! on entry and back out to the caller's storage when the handler returns.

use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::slice;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::trace;

use crate::abi::{CallAbi, HookContext, Target};
use crate::alloc::{ExecutablePage, PageProvider};
use crate::buffer::{ArgFrame, VirtualStack};
use crate::call::{log_compiled, CallHandle, CallTarget};
use crate::code;
use crate::error::CompileError;
use crate::intercept::{InterceptError, VtableIntercept};
use crate::signature::Signature;

/// Handler invoked for every call that enters a hook
///
/// The handler runs on the native caller's thread. A panic cannot unwind through native frames, so a panicking
/// handler aborts the process.
pub type HookFn = dyn Fn(&mut HookInvocation<'_>) -> HookAction + Send + Sync;

/// Signature of the dispatcher hook trampolines call
type Dispatcher = extern "C" fn(*mut c_void, *mut u8, *mut u8, *const HookInner);

/// What happens after a handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookAction {
    /// Run the original with the (possibly edited) parameters, unless the handler already recalled it
    Ignored,
    /// Skip the original; the caller receives whatever the handler left in the return buffer
    Supercede,
}

/// State a hook trampoline points its dispatcher at
///
/// Boxed so its address is known before the trampoline is emitted and stays put for the life of the hook.
struct HookInner {
    /// Forward call into the original implementation, also the owner of the signature and layout
    original: CallHandle,
    /// User handler
    handler: Box<HookFn>,
}

impl HookInner {
    /// Runs the original with the receiver and parameters given, copying parameters back afterwards
    ///
    /// # Safety
    ///
    /// The original address the hook was compiled with must still be a function of the hooked signature.
    unsafe fn perform_recall<S>(&self, receiver: *mut c_void, params: &mut VirtualStack<'_, S>, ret: &mut [u8])
    where
        S: AsRef<[u8]> + AsMut<[u8]>,
    {
        let mut args = self.original.new_args();
        args.copy_from(params);
        if self.original.layout().has_receiver() {
            args.set_receiver(receiver);
        }
        self.original.execute(&mut args, ret);
        params.copy_from(&args);
    }
}

/// Entry from generated code into the handler
extern "C" fn dispatch(receiver: *mut c_void, params: *mut u8, ret: *mut u8, hook: *const HookInner) {
    // Safety: hook trampolines pass the `HookInner` they were compiled for, which outlives their code, together with
    // a frame and a return buffer sized for its layout
    let (hook, params, ret) = unsafe {
        let hook = &*hook;
        let layout = hook.original.layout();
        let ret_size = hook.original.ret_size();

        // padding and the return buffer are never written by the trampoline
        ptr::write_bytes(params.add(layout.size()), 0, layout.storage_size() - layout.size());
        ptr::write_bytes(ret, 0, ret_size);
        (
            hook,
            slice::from_raw_parts_mut(params, layout.storage_size()),
            slice::from_raw_parts_mut(ret, ret_size),
        )
    };

    let mut invocation = HookInvocation {
        hook,
        receiver,
        params: ArgFrame::from_frame(hook.original.layout(), params),
        ret,
        superseded: false,
    };
    let action = (hook.handler)(&mut invocation);
    trace!(?action, recalled = invocation.superseded, "hook handler returned");

    if action == HookAction::Ignored && !invocation.superseded {
        invocation.recall();
    }
}

/// One call passing through a hook
pub struct HookInvocation<'a> {
    /// Hook being run
    hook: &'a HookInner,
    /// Receiver of the call, null without one
    receiver: *mut c_void,
    /// Parameter frame on the trampoline's stack
    params: ArgFrame<'a, 'a>,
    /// Return buffer on the trampoline's stack
    ret: &'a mut [u8],
    /// Whether the original already ran for this call
    superseded: bool,
}

impl<'a> HookInvocation<'a> {
    /// Signature of the hooked function
    pub fn signature(&self) -> &Signature {
        self.hook.original.signature()
    }

    /// Receiver of the call, null when the convention has none
    pub fn receiver(&self) -> *mut c_void {
        self.receiver
    }

    /// Parameters as the caller passed them
    pub fn params(&self) -> &ArgFrame<'a, 'a> {
        &self.params
    }

    /// Parameters, editable before the original runs
    pub fn params_mut(&mut self) -> &mut ArgFrame<'a, 'a> {
        &mut self.params
    }

    /// Return buffer
    pub fn ret(&self) -> &[u8] {
        &*self.ret
    }

    /// Mutable return buffer
    pub fn ret_mut(&mut self) -> &mut [u8] {
        &mut *self.ret
    }

    /// Reads the return buffer as a `T`
    ///
    /// # Panics
    ///
    /// Panics if `T` is not exactly as large as the return value.
    pub fn ret_value<T: Pod>(&self) -> T {
        bytemuck::pod_read_unaligned(self.ret)
    }

    /// Writes `value` as the return value
    ///
    /// # Panics
    ///
    /// Panics if `T` is not exactly as large as the return value.
    pub fn set_ret<T: Pod>(&mut self, value: T) {
        assert_eq!(
            self.ret.len(),
            std::mem::size_of::<T>(),
            "return value is {} bytes wide",
            self.ret.len()
        );
        self.ret.copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Calls the original implementation now, with the current parameters
    ///
    /// Its result lands in the return buffer and by-reference parameters it changed are visible afterwards. The
    /// original will not run again once the handler returns.
    pub fn recall(&mut self) {
        // Safety: an invocation only exists while a native caller is inside the hook, whose original was promised
        // to be callable with this signature when the hook was compiled
        unsafe {
            self.hook
                .perform_recall(self.receiver, &mut self.params, &mut *self.ret)
        };
        self.superseded = true;
    }

    /// Whether the original already ran for this call
    pub fn is_superseded(&self) -> bool {
        self.superseded
    }
}

/// A compiled hook trampoline
///
/// The entry point can stand in for the original function anywhere a caller reaches it through a pointer. Dropping
/// the handle releases the trampoline and its recall path, so it must outlive every installed reference to it.
pub struct HookHandle {
    /// Generated entry point
    code: ExecutablePage,
    /// Dispatcher state the code points at
    inner: Box<HookInner>,
}

impl HookHandle {
    /// Compiles a hook for `signature` whose recall path calls `original`
    pub(crate) fn compile(
        abi: &dyn CallAbi,
        pages: &Arc<dyn PageProvider>,
        signature: Signature,
        original: usize,
        handler: Box<HookFn>,
    ) -> Result<Self, CompileError> {
        let original = CallHandle::compile(abi, pages, signature, CallTarget::Direct(original))?;
        let inner = Box::new(HookInner { original, handler });

        let context = HookContext {
            signature: inner.original.signature(),
            layout: inner.original.layout(),
            hook: &*inner as *const HookInner as usize,
            dispatcher: dispatch as Dispatcher as usize,
        };
        let (code, measured) = code::assemble(pages, |jit, state| abi.write_hook(jit, state, &context))?;
        log_compiled("hook", abi.target(), &code, measured.state.stack_usage);

        Ok(Self { code, inner })
    }

    /// Platform the code was emitted for
    pub fn target(&self) -> Target {
        self.inner.original.target()
    }

    /// Signature of the hooked function
    pub fn signature(&self) -> &Signature {
        self.inner.original.signature()
    }

    /// Forward call the recall path uses
    pub fn original(&self) -> &CallHandle {
        &self.inner.original
    }

    /// Entry point callers should reach instead of the original
    pub fn entry(&self) -> *const u8 {
        self.code.as_ptr()
    }

    /// Address of the entry point
    pub fn address(&self) -> usize {
        self.code.address()
    }

    /// Generated machine code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Runs the original implementation on a parameter buffer and copies the parameters back afterwards
    ///
    /// `receiver` is ignored when the convention has none.
    ///
    /// # Safety
    ///
    /// Same contract as [`CallHandle::execute`] on [`HookHandle::original`].
    ///
    /// # Panics
    ///
    /// Panics if `params` follows another layout or `ret` is too small for the result.
    pub unsafe fn perform_recall<S>(&self, receiver: *mut c_void, params: &mut VirtualStack<'_, S>, ret: &mut [u8])
    where
        S: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.inner.perform_recall(receiver, params, ret)
    }

    /// Points the vtable entry at `slot` to this hook until the returned guard drops
    ///
    /// # Safety
    ///
    /// `slot` must be a live, pointer-aligned table entry holding a function of the hooked signature, and nothing
    /// may call through it while it is being swapped.
    pub unsafe fn install_vtable(&self, slot: *mut usize) -> Result<VtableIntercept<'_>, InterceptError> {
        VtableIntercept::install(slot, self.address())
    }
}

impl fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("entry", &self.code.as_ptr())
            .field("size", &self.code.len())
            .field("original", &self.inner.original)
            .finish()
    }
}
