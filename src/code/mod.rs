//! # Code
//!
//! The opcode emitter and the two-pass assembly protocol.
//!
//! Every trampoline is emitted twice by the same function. The first pass runs against a measuring [`Emitter`] with
//! no backing memory and only counts bytes; the second writes into the final page, whose address is now known. Both
//! passes receive a fresh [`CompilationState`], so the only thing carried over is what the first pass measured.

use std::sync::Arc;

use crate::alloc::{ExecutablePage, PageProvider, WritablePage};
use crate::error::CompileError;

use self::x86::{Reg, Xmm};

pub mod disasm;
pub mod x86;

/// Append-only code cursor
pub struct Emitter<'a> {
    /// Destination bytes, `None` while measuring
    out: Option<&'a mut [u8]>,
    /// Address the first byte will execute at
    base: usize,
    /// Bytes emitted so far
    pos: usize,
    /// Set when a write ran past the end of `out`
    overflowed: bool,
}

/// A `rel32` operand whose target is filled in later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Fixup {
    /// Offset of the 4-byte operand
    at: usize,
}

impl Emitter<'static> {
    /// Creates an emitter that only counts bytes
    pub fn measuring() -> Self {
        Self {
            out: None,
            base: 0,
            pos: 0,
            overflowed: false,
        }
    }
}

impl<'a> Emitter<'a> {
    /// Creates an emitter writing into `out`, which will execute at `base`
    pub fn emitting(out: &'a mut [u8], base: usize) -> Self {
        Self {
            out: Some(out),
            base,
            pos: 0,
            overflowed: false,
        }
    }

    /// Whether this is the measuring pass
    pub fn is_measuring(&self) -> bool {
        self.out.is_none()
    }

    /// Bytes emitted so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Appends raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if let Some(out) = self.out.as_deref_mut() {
            match out.get_mut(self.pos..self.pos + bytes.len()) {
                Some(dst) => dst.copy_from_slice(bytes),
                None => self.overflowed = true,
            }
        }
        self.pos += bytes.len();
    }

    /// Appends one byte
    pub fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    /// Appends a little-endian `u16`
    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Appends a little-endian `u32`
    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Appends a little-endian `i32`
    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Appends a little-endian `u64`
    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Reserves a `rel32` operand to be patched once its target is known
    pub fn deferred_rel32(&mut self) -> Fixup {
        let at = self.pos;
        self.write_u32(0);
        Fixup { at }
    }

    /// Points a reserved `rel32` operand at the absolute address `target`
    ///
    /// The operand is relative to the end of itself, which only means something once the final address of the code
    /// is known, so this does nothing while measuring.
    pub fn patch_rel32(&mut self, fixup: Fixup, target: usize) {
        let next = self.base.wrapping_add(fixup.at + 4);
        let rel = (target as i64).wrapping_sub(next as i64) as i32;
        if let Some(dst) = self
            .out
            .as_deref_mut()
            .and_then(|out| out.get_mut(fixup.at..fixup.at + 4))
        {
            dst.copy_from_slice(&rel.to_le_bytes());
        }
    }
}

/// Mutable bookkeeping of one emission pass
///
/// Every allocation counter lives here and a fresh value is created for each pass, so both passes make the same
/// decisions in the same order.
#[derive(Debug, Clone, Default)]
pub struct CompilationState {
    /// Outgoing stack bytes the measuring pass used; zero while measuring
    pub reserved: u32,
    /// Outgoing stack bytes used so far
    pub stack_usage: u32,
    /// Integer argument registers handed out
    pub int_args: usize,
    /// Vector argument registers handed out
    pub float_args: usize,
    /// Round-robin index into the scratch registers
    scratch: usize,
    /// Round-robin index into the scratch vector registers
    float_scratch: usize,
    /// Register the receiver was loaded into, needed again for virtual dispatch
    pub this_reg: Option<Reg>,
    /// Whether the caller's return buffer is passed as a hidden pointer
    pub ret_buffer: bool,
    /// Whether the callee takes a variable argument list
    pub variadic: bool,
}

impl CompilationState {
    /// State for the measuring pass
    pub fn first_pass() -> Self {
        Self::default()
    }

    /// State for the emitting pass, seeded with what `first` measured
    pub fn second_pass(first: &Self) -> Self {
        Self {
            reserved: first.stack_usage,
            ..Self::default()
        }
    }

    /// Next scratch register from `set`, round-robin
    pub fn next_scratch(&mut self, set: &[Reg]) -> Reg {
        let reg = set[self.scratch % set.len()];
        self.scratch += 1;
        reg
    }

    /// Next scratch vector register from `set`, round-robin
    pub fn next_float_scratch(&mut self, set: &[Xmm]) -> Xmm {
        let reg = set[self.float_scratch % set.len()];
        self.float_scratch += 1;
        reg
    }
}

/// Result of the measuring pass
#[derive(Debug, Clone)]
pub struct Measurement {
    /// Code size in bytes
    pub size: usize,
    /// Final state of the measuring pass
    pub state: CompilationState,
}

/// Runs the measuring pass of `emit`
pub fn measure<F>(emit: &mut F) -> Measurement
where
    F: FnMut(&mut Emitter<'_>, &mut CompilationState),
{
    let mut state = CompilationState::first_pass();
    let mut jit = Emitter::measuring();
    emit(&mut jit, &mut state);
    Measurement {
        size: jit.position(),
        state,
    }
}

/// Runs the emitting pass of `emit` into `out`, which will execute at `base`
pub fn emit_into<F>(
    emit: &mut F,
    measured: &Measurement,
    out: &mut [u8],
    base: usize,
) -> Result<(), CompileError>
where
    F: FnMut(&mut Emitter<'_>, &mut CompilationState),
{
    let mut state = CompilationState::second_pass(&measured.state);
    let mut jit = Emitter::emitting(out, base);
    emit(&mut jit, &mut state);

    if jit.overflowed || jit.position() != measured.size {
        return Err(CompileError::SizeMismatch {
            measured: measured.size,
            emitted: jit.position(),
        });
    }
    Ok(())
}

/// Measures `emit`, allocates a page of exactly that size, emits into it and seals it
pub fn assemble<F>(
    provider: &Arc<dyn PageProvider>,
    mut emit: F,
) -> Result<(ExecutablePage, Measurement), CompileError>
where
    F: FnMut(&mut Emitter<'_>, &mut CompilationState),
{
    let measured = measure(&mut emit);

    let mut page = WritablePage::allocate(provider, measured.size)?;
    let base = page.address();
    emit_into(&mut emit, &measured, &mut page, base)?;

    Ok((page.seal()?, measured))
}

/// Measures and emits `emit` into a plain buffer as if it ran at `base`, for inspection
pub fn assemble_to_vec<F>(base: usize, mut emit: F) -> Result<Vec<u8>, CompileError>
where
    F: FnMut(&mut Emitter<'_>, &mut CompilationState),
{
    let measured = measure(&mut emit);
    let mut out = vec![0; measured.size];
    emit_into(&mut emit, &measured, &mut out, base)?;
    Ok(out)
}
