//! # Call
//!
//! Forward trampolines: generated functions that take a packed argument buffer, replay it in the real calling
//! convention of a native target and copy the result back.
//!
//! A compiled trampoline has the shape `extern "C" fn(args: *mut u8, ret: *mut u8)`, where `args` points at an
//! [`ArgBuffer`](crate::buffer::ArgBuffer) laid out by the handle's [`ParamLayout`].

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, Level};

use crate::abi::{CallAbi, PushOrder, Target};
use crate::alloc::{ExecutablePage, PageProvider};
use crate::buffer::{ArgBuffer, VirtualStack};
use crate::code::{self, disasm, CompilationState, Emitter};
use crate::error::CompileError;
use crate::signature::{CallConvention, ParamLayout, PassEncode, PassInfo, PassKind, Signature};

/// What a forward trampoline calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTarget {
    /// A fixed function address
    Direct(usize),
    /// A slot of the receiver's virtual table
    Virtual {
        /// Index of the slot in the table
        vtable_index: usize,
        /// Offset of the table pointer within the adjusted object
        vtable_offset: usize,
        /// Adjustment applied to the receiver before reading the table pointer
        this_offset: usize,
    },
}

/// Emits the body of a forward trampoline for one pass
pub(crate) fn write_forward(
    abi: &dyn CallAbi,
    jit: &mut Emitter<'_>,
    state: &mut CompilationState,
    signature: &Signature,
    layout: &ParamLayout,
    target: &CallTarget,
) {
    state.ret_buffer = abi.needs_ret_buffer(signature);
    state.variadic = signature.is_variadic();
    let receiver = signature.convention().has_receiver();

    abi.write_prologue(jit, state, signature);
    match abi.push_order() {
        PushOrder::StackRightToLeft => {
            for param in layout.params().iter().rev() {
                write_param(abi, jit, state, param);
            }
            if receiver {
                abi.write_push_this(jit, state);
            }
            if state.ret_buffer {
                abi.write_push_ret_buffer(jit, state);
            }
        }
        order => {
            if order == PushOrder::ReceiverFirst && receiver {
                abi.write_push_this(jit, state);
            }
            if state.ret_buffer {
                abi.write_push_ret_buffer(jit, state);
            }
            if order == PushOrder::RetBufferFirst && receiver {
                abi.write_push_this(jit, state);
            }
            for param in layout.params() {
                write_param(abi, jit, state, param);
            }
        }
    }

    abi.write_call(jit, state, signature, target);
    abi.write_rectify_stack(jit, state, signature);
    if let Some(ret) = signature.ret() {
        if !state.ret_buffer {
            abi.write_return_copy(jit, state, ret);
        }
    }
    abi.write_epilogue(jit, state, signature);
}

/// Places one declared parameter with the writer for its kind
fn write_param(abi: &dyn CallAbi, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode) {
    match param.info.kind() {
        _ if param.info.is_by_ref() => abi.write_push_pod(jit, state, param),
        PassKind::Integer => abi.write_push_pod(jit, state, param),
        PassKind::Float => abi.write_push_float(jit, state, param),
        PassKind::Aggregate => abi.write_push_object(jit, state, param),
    }
}

/// Logs a freshly sealed trampoline, with a full listing at TRACE
pub(crate) fn log_compiled(kind: &str, target: Target, page: &ExecutablePage, frame: u32) {
    debug!(
        kind,
        ?target,
        size = page.len(),
        frame,
        address = ?page.as_ptr(),
        "compiled trampoline"
    );
    if tracing::enabled!(Level::TRACE) {
        trace!(
            "{kind} trampoline at {:#x}:\n{}",
            page.address(),
            disasm::listing(page, target.bitness(), page.address() as u64)
        );
    }
}

/// A compiled forward call
///
/// Owns a copy of the signature it was built from, the offset table of its argument buffers and the executable
/// code. Dropping the handle releases the code page.
pub struct CallHandle {
    /// Platform the code was emitted for
    target: Target,
    /// Shape of the callee
    signature: Signature,
    /// Offset table of the argument buffer
    layout: ParamLayout,
    /// Function or virtual slot being called
    call_target: CallTarget,
    /// Generated code
    code: ExecutablePage,
}

impl CallHandle {
    /// Compiles a forward trampoline for `signature` with `abi`
    pub(crate) fn compile(
        abi: &dyn CallAbi,
        pages: &Arc<dyn PageProvider>,
        signature: Signature,
        call_target: CallTarget,
    ) -> Result<Self, CompileError> {
        if let CallTarget::Virtual { .. } = call_target {
            assert_eq!(
                signature.convention(),
                CallConvention::ThisCall,
                "virtual calls need a receiver"
            );
        }

        let target = abi.target();
        let layout = ParamLayout::new(&signature, target.word_size());
        let (code, measured) = code::assemble(pages, |jit, state| {
            write_forward(abi, jit, state, &signature, &layout, &call_target)
        })?;
        log_compiled("call", target, &code, measured.state.stack_usage);

        Ok(Self {
            target,
            signature,
            layout,
            call_target,
            code,
        })
    }

    /// Platform the code was emitted for
    pub fn target(&self) -> Target {
        self.target
    }

    /// Signature of the callee
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Calling convention of the callee
    pub fn convention(&self) -> CallConvention {
        self.signature.convention()
    }

    /// Number of declared parameters, receiver excluded
    pub fn param_count(&self) -> usize {
        self.layout.len()
    }

    /// Declared parameter `index` and its buffer offset
    pub fn param_info(&self, index: usize) -> Option<&PassEncode> {
        self.layout.get(index)
    }

    /// Shape of the return value, `None` for `void`
    pub fn return_info(&self) -> Option<&PassInfo> {
        self.signature.ret()
    }

    /// Bytes the return buffer passed to [`CallHandle::execute`] must hold
    pub fn ret_size(&self) -> usize {
        self.signature.ret_size(self.target.word_size())
    }

    /// Offset table of the argument buffer
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Function or virtual slot being called
    pub fn call_target(&self) -> CallTarget {
        self.call_target
    }

    /// Generated machine code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Entry point of the generated code
    pub fn entry(&self) -> *const u8 {
        self.code.as_ptr()
    }

    /// Creates a zeroed argument buffer for this call
    pub fn new_args(&self) -> ArgBuffer<'_> {
        ArgBuffer::new(&self.layout)
    }

    /// Calls the target with the arguments in `args`, writing the result into `ret`
    ///
    /// # Safety
    ///
    /// - The call target must be a function (or, for virtual calls, the receiver an object whose table slot is a
    ///   function) of exactly the compiled signature
    /// - Every pointer stored in `args`, the receiver included, must be valid for what the callee does with it
    ///
    /// # Panics
    ///
    /// Panics if the code was compiled for another platform, if `args` follows another layout, or if `ret` is
    /// smaller than [`CallHandle::ret_size`].
    pub unsafe fn execute<S>(&self, args: &mut VirtualStack<'_, S>, ret: &mut [u8])
    where
        S: AsRef<[u8]> + AsMut<[u8]>,
    {
        assert!(self.target.is_host(), "code for {:?} cannot run on this host", self.target);
        assert_eq!(args.layout(), &self.layout, "argument buffer follows another signature");
        assert!(
            ret.len() >= self.ret_size(),
            "return buffer of {} bytes cannot hold a {} byte result",
            ret.len(),
            self.ret_size()
        );

        // Safety: the page holds a complete trampoline for the host with this exact shape
        let entry: unsafe extern "C" fn(*mut u8, *mut u8) = std::mem::transmute(self.code.as_ptr());
        entry(args.as_mut_ptr(), ret.as_mut_ptr());
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("target", &self.target)
            .field("signature", &self.signature)
            .field("call_target", &self.call_target)
            .field("entry", &self.code.as_ptr())
            .field("size", &self.code.len())
            .finish()
    }
}
