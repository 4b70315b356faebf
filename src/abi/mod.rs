//! # ABI
//!
//! One backend per (architecture, platform ABI) pair. The forward and hook compilers only sequence the steps of a
//! trampoline; every step that depends on the calling convention goes through [`CallAbi`].

use crate::call::CallTarget;
use crate::code::x86::{self as asm, mem, Mem, Reg, Width};
use crate::code::{CompilationState, Emitter};
use crate::signature::{Classification, ParamLayout, PassEncode, PassInfo, Signature};

pub mod x64;
pub mod x86;

/// Platform a trampoline is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// IA-32, MSVC conventions: `thiscall` passes the receiver in `ecx`
    X86Windows,
    /// IA-32, System V conventions: the receiver is pushed like any argument
    X86Posix,
    /// x86-64 System V
    X64SystemV,
    /// x86-64 Microsoft
    X64Microsoft,
}

impl Target {
    /// Platform of the running process, if supported
    pub fn host() -> Option<Self> {
        if cfg!(all(target_arch = "x86_64", windows)) {
            Some(Self::X64Microsoft)
        } else if cfg!(target_arch = "x86_64") {
            Some(Self::X64SystemV)
        } else if cfg!(all(target_arch = "x86", windows)) {
            Some(Self::X86Windows)
        } else if cfg!(target_arch = "x86") {
            Some(Self::X86Posix)
        } else {
            None
        }
    }

    /// Pointer width in bytes
    pub fn word_size(self) -> usize {
        match self {
            Self::X86Windows | Self::X86Posix => 4,
            Self::X64SystemV | Self::X64Microsoft => 8,
        }
    }

    /// Decoder bitness of the generated code
    pub fn bitness(self) -> u32 {
        self.word_size() as u32 * 8
    }

    /// Whether code for this target can run in the current process
    pub fn is_host(self) -> bool {
        Self::host() == Some(self)
    }
}

/// Order in which a backend places the implicit and declared arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOrder {
    /// Declared parameters right to left, then the receiver, then the hidden return pointer
    StackRightToLeft,
    /// Hidden return pointer, receiver, then declared parameters left to right
    RetBufferFirst,
    /// Receiver, hidden return pointer, then declared parameters left to right
    ReceiverFirst,
}

/// Everything a backend needs to emit a hook trampoline
pub struct HookContext<'a> {
    /// Signature the trampoline receives calls with
    pub signature: &'a Signature,
    /// Offset table of the parameter frame handed to the dispatcher
    pub layout: &'a ParamLayout,
    /// Address passed as the dispatcher's last argument
    pub hook: usize,
    /// Address of the dispatcher
    pub dispatcher: usize,
}

/// Calling-convention specific pieces of a trampoline
///
/// The forward compiler calls these in a fixed sequence: prologue, one push per argument in [`CallAbi::push_order`],
/// call, stack rectification, return copy, epilogue. Every writer must make the same decisions on both passes.
pub trait CallAbi: Send + Sync {
    /// Platform this backend emits for
    fn target(&self) -> Target;

    /// How a by-value aggregate travels
    fn classify(&self, info: &PassInfo) -> Classification;

    /// Whether the return value comes back through a hidden pointer to the caller's return buffer
    fn needs_ret_buffer(&self, signature: &Signature) -> bool;

    /// Order of the arguments
    fn push_order(&self) -> PushOrder;

    /// Saves registers, loads the buffer pointers and reserves the outgoing argument area
    fn write_prologue(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, signature: &Signature);

    /// Places an integer, a pointer, or any by-reference value
    fn write_push_pod(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode);

    /// Places a by-value float
    fn write_push_float(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode);

    /// Places a by-value aggregate
    fn write_push_object(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode);

    /// Places the receiver stored at offset 0 of the argument buffer
    fn write_push_this(&self, jit: &mut Emitter<'_>, state: &mut CompilationState);

    /// Places the hidden return pointer
    fn write_push_ret_buffer(&self, jit: &mut Emitter<'_>, state: &mut CompilationState);

    /// Calls the target
    fn write_call(
        &self,
        jit: &mut Emitter<'_>,
        state: &mut CompilationState,
        signature: &Signature,
        target: &CallTarget,
    );

    /// Drops whatever the callee left on the stack that the caller owns
    fn write_rectify_stack(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, signature: &Signature);

    /// Copies a register-returned value into the return buffer
    fn write_return_copy(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, ret: &PassInfo);

    /// Restores registers and returns
    fn write_epilogue(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, signature: &Signature);

    /// Emits a complete hook trampoline
    fn write_hook(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, hook: &HookContext<'_>);
}

/// IA-32 with MSVC conventions
static X86_WINDOWS: x86::X86Abi = x86::X86Abi::new(true);
/// IA-32 with System V conventions
static X86_POSIX: x86::X86Abi = x86::X86Abi::new(false);
/// x86-64 System V
static X64_SYSTEM_V: x64::X64Abi = x64::X64Abi::new(false);
/// x86-64 Microsoft
static X64_MICROSOFT: x64::X64Abi = x64::X64Abi::new(true);

/// Backend for `target`
pub fn backend(target: Target) -> &'static dyn CallAbi {
    match target {
        Target::X86Windows => &X86_WINDOWS,
        Target::X86Posix => &X86_POSIX,
        Target::X64SystemV => &X64_SYSTEM_V,
        Target::X64Microsoft => &X64_MICROSOFT,
    }
}

/// Copies larger than this use `rep movsb`
const UNROLL_LIMIT: usize = 64;

/// Rounds `value` up to a multiple of `align`, which must be a power of two
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// `[base + offset]` for a non-negative offset
pub(crate) fn at(base: Reg, offset: usize) -> Mem {
    mem(base, offset as i32)
}

/// Copies `size` bytes from `src` to `dst`
///
/// Short copies go through `temp` a machine word at a time. Long ones use `rep movsb`, which clobbers the `di`, `si`
/// and `cx` registers unless `preserve` is set; with `preserve`, stack-relative operands are adjusted for the saves.
pub(crate) fn copy_bytes(
    jit: &mut Emitter<'_>,
    wide: bool,
    temp: Reg,
    dst: Mem,
    src: Mem,
    size: usize,
    preserve: bool,
) {
    if size <= UNROLL_LIMIT {
        let widths: &[Width] = if wide {
            &[Width::Qword, Width::Dword, Width::Word, Width::Byte]
        } else {
            &[Width::Dword, Width::Word, Width::Byte]
        };

        let mut done = 0;
        for &width in widths {
            while size - done >= width.bytes() {
                asm::load(jit, width, temp, src.offset(done as i32));
                asm::store(jit, width, dst.offset(done as i32), temp);
                done += width.bytes();
            }
        }
        return;
    }

    let saved = [Reg::Rdi, Reg::Rsi, Reg::Rcx];
    let adjust = |m: Mem| {
        if preserve && m.base == Reg::Rsp {
            m.offset((saved.len() * if wide { 8 } else { 4 }) as i32)
        } else {
            m
        }
    };

    if preserve {
        saved.iter().for_each(|&reg| asm::push(jit, reg));
    }
    // the source may be addressed through rdi, so load it first
    asm::lea(jit, wide, Reg::Rsi, adjust(src));
    asm::lea(jit, wide, Reg::Rdi, adjust(dst));
    asm::mov_imm32(jit, Reg::Rcx, size as u32);
    asm::cld(jit);
    asm::rep_movs(jit, Width::Byte);
    if preserve {
        saved.iter().rev().for_each(|&reg| asm::pop(jit, reg));
    }
}
