//! # x86
//!
//! Instruction writers for IA-32 and x86-64.
//!
//! The two share one encoder: 32-bit code simply never asks for 64-bit operands or the extended registers, so no REX
//! prefix is ever produced for it. Every writer picks its encoding from its operands alone, which keeps the
//! measuring and emitting passes the same length.

use super::{Emitter, Fixup};

/// General-purpose register, numbered by its hardware encoding
///
/// On IA-32 the first eight name `eax` through `edi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::missing_docs_in_private_items)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Hardware number
    fn code(self) -> u8 {
        self as u8
    }

    /// Low three bits that go in ModRM
    fn low(self) -> u8 {
        self.code() & 7
    }

    /// Whether the register needs a REX extension bit
    fn ext(self) -> bool {
        self.code() >= 8
    }
}

/// Vector register `xmm0` through `xmm15`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

/// Operand width of a load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    /// 8 bits
    Byte,
    /// 16 bits
    Word,
    /// 32 bits
    Dword,
    /// 64 bits
    Qword,
}

impl Width {
    /// Width of a value of `size` bytes, if it is a machine width
    pub fn of(size: usize) -> Option<Self> {
        match size {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Qword),
            _ => None,
        }
    }

    /// Size in bytes
    pub fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }
}

/// `[base + disp]` memory operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    /// Base register
    pub base: Reg,
    /// Signed displacement
    pub disp: i32,
}

/// Builds a `[base + disp]` operand
pub fn mem(base: Reg, disp: i32) -> Mem {
    Mem { base, disp }
}

impl Mem {
    /// The same operand `delta` bytes further
    pub fn offset(self, delta: i32) -> Self {
        Self {
            base: self.base,
            disp: self.disp + delta,
        }
    }
}

/// Writes a REX prefix if any bit is set (or `force` asks for the byte registers `spl`..`dil`)
fn rex(jit: &mut Emitter<'_>, w: bool, r: bool, b: bool, force: bool) {
    let value = 0x40 | (w as u8) << 3 | (r as u8) << 2 | b as u8;
    if value != 0x40 || force {
        jit.write_u8(value);
    }
}

/// Writes ModRM (and SIB/displacement) addressing `m`
///
/// `rsp`/`r12` bases need a SIB byte and `rbp`/`r13` bases always need a displacement.
fn modrm_mem(jit: &mut Emitter<'_>, reg: u8, m: Mem) {
    let base = m.base.low();
    let mode = if m.disp == 0 && base != 5 {
        0b00
    } else if i8::try_from(m.disp).is_ok() {
        0b01
    } else {
        0b10
    };

    jit.write_u8(mode << 6 | (reg & 7) << 3 | base);
    if base == 4 {
        jit.write_u8(0x24);
    }
    match mode {
        0b01 => jit.write_u8(m.disp as i8 as u8),
        0b10 => jit.write_i32(m.disp),
        _ => {}
    }
}

/// Writes `[prefix] [rex] opcode modrm` for a memory operand
fn op_mem(jit: &mut Emitter<'_>, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, m: Mem) {
    if let Some(prefix) = prefix {
        jit.write_u8(prefix);
    }
    rex(jit, w, reg >= 8, m.base.ext(), false);
    jit.write_bytes(opcode);
    modrm_mem(jit, reg, m);
}

/// Writes `[prefix] [rex] opcode modrm` for a register operand
fn op_reg(jit: &mut Emitter<'_>, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, rm: u8) {
    if let Some(prefix) = prefix {
        jit.write_u8(prefix);
    }
    rex(jit, w, reg >= 8, rm >= 8, false);
    jit.write_bytes(opcode);
    jit.write_u8(0xc0 | (reg & 7) << 3 | (rm & 7));
}

/// `push reg`
pub fn push(jit: &mut Emitter<'_>, reg: Reg) {
    rex(jit, false, false, reg.ext(), false);
    jit.write_u8(0x50 + reg.low());
}

/// `pop reg`
pub fn pop(jit: &mut Emitter<'_>, reg: Reg) {
    rex(jit, false, false, reg.ext(), false);
    jit.write_u8(0x58 + reg.low());
}

/// `push imm32`
pub fn push_imm32(jit: &mut Emitter<'_>, value: u32) {
    jit.write_u8(0x68);
    jit.write_u32(value);
}

/// `mov dst, src` at pointer width (`wide` selects 64 bits)
pub fn mov(jit: &mut Emitter<'_>, wide: bool, dst: Reg, src: Reg) {
    op_reg(jit, None, wide, &[0x8b], dst.code(), src.code());
}

/// Loads `width` bytes from `m` into `dst`, zero extending sub-dword values
pub fn load(jit: &mut Emitter<'_>, width: Width, dst: Reg, m: Mem) {
    match width {
        Width::Byte => op_mem(jit, None, false, &[0x0f, 0xb6], dst.code(), m),
        Width::Word => op_mem(jit, None, false, &[0x0f, 0xb7], dst.code(), m),
        Width::Dword => op_mem(jit, None, false, &[0x8b], dst.code(), m),
        Width::Qword => op_mem(jit, None, true, &[0x8b], dst.code(), m),
    }
}

/// Loads `width` bytes from `m` into `dst`, sign extending to 64 bits when `wide`, else to 32 bits
pub fn load_signed(jit: &mut Emitter<'_>, width: Width, wide: bool, dst: Reg, m: Mem) {
    match width {
        Width::Byte => op_mem(jit, None, wide, &[0x0f, 0xbe], dst.code(), m),
        Width::Word => op_mem(jit, None, wide, &[0x0f, 0xbf], dst.code(), m),
        Width::Dword if wide => op_mem(jit, None, true, &[0x63], dst.code(), m),
        Width::Dword => op_mem(jit, None, false, &[0x8b], dst.code(), m),
        Width::Qword => op_mem(jit, None, true, &[0x8b], dst.code(), m),
    }
}

/// Stores the low `width` bytes of `src` at `m`
pub fn store(jit: &mut Emitter<'_>, width: Width, m: Mem, src: Reg) {
    match width {
        Width::Byte => {
            let force = (4..8).contains(&src.code());
            rex(jit, false, src.ext(), m.base.ext(), force);
            jit.write_u8(0x88);
            modrm_mem(jit, src.code(), m);
        }
        Width::Word => op_mem(jit, Some(0x66), false, &[0x89], src.code(), m),
        Width::Dword => op_mem(jit, None, false, &[0x89], src.code(), m),
        Width::Qword => op_mem(jit, None, true, &[0x89], src.code(), m),
    }
}

/// `lea dst, [m]` at pointer width
pub fn lea(jit: &mut Emitter<'_>, wide: bool, dst: Reg, m: Mem) {
    op_mem(jit, None, wide, &[0x8d], dst.code(), m);
}

/// `movss`/`movsd xmm, [m]`
pub fn load_float(jit: &mut Emitter<'_>, double: bool, dst: Xmm, m: Mem) {
    let prefix = if double { 0xf2 } else { 0xf3 };
    op_mem(jit, Some(prefix), false, &[0x0f, 0x10], dst.0, m);
}

/// `movss`/`movsd [m], xmm`
pub fn store_float(jit: &mut Emitter<'_>, double: bool, m: Mem, src: Xmm) {
    let prefix = if double { 0xf2 } else { 0xf3 };
    op_mem(jit, Some(prefix), false, &[0x0f, 0x11], src.0, m);
}

/// `movq`/`movd dst, xmm`: copies the low bits of a vector register into a general-purpose one
pub fn mov_from_xmm(jit: &mut Emitter<'_>, double: bool, dst: Reg, src: Xmm) {
    op_reg(jit, Some(0x66), double, &[0x0f, 0x7e], src.0, dst.code());
}

/// Group-1 arithmetic with an immediate; picks the short form when `imm` fits in a byte
fn alu_imm(jit: &mut Emitter<'_>, wide: bool, op: u8, reg: Reg, imm: i32) {
    if let Ok(imm) = i8::try_from(imm) {
        op_reg(jit, None, wide, &[0x83], op, reg.code());
        jit.write_u8(imm as u8);
    } else {
        op_reg(jit, None, wide, &[0x81], op, reg.code());
        jit.write_i32(imm);
    }
}

/// `add reg, imm`
pub fn add_imm(jit: &mut Emitter<'_>, wide: bool, reg: Reg, imm: i32) {
    alu_imm(jit, wide, 0, reg, imm);
}

/// `sub reg, imm`
pub fn sub_imm(jit: &mut Emitter<'_>, wide: bool, reg: Reg, imm: i32) {
    alu_imm(jit, wide, 5, reg, imm);
}

/// `and reg, imm`
pub fn and_imm(jit: &mut Emitter<'_>, wide: bool, reg: Reg, imm: i32) {
    alu_imm(jit, wide, 4, reg, imm);
}

/// `sub reg, imm32`, always in the long form
///
/// Used where the immediate is only known after measuring.
pub fn sub_imm32(jit: &mut Emitter<'_>, wide: bool, reg: Reg, imm: u32) {
    op_reg(jit, None, wide, &[0x81], 5, reg.code());
    jit.write_u32(imm);
}

/// `shr reg, count`
pub fn shr_imm(jit: &mut Emitter<'_>, wide: bool, reg: Reg, count: u8) {
    op_reg(jit, None, wide, &[0xc1], 5, reg.code());
    jit.write_u8(count);
}

/// `mov reg8, imm8` for `al`, `cl`, `dl` or `bl`
pub fn mov_imm8(jit: &mut Emitter<'_>, reg: Reg, value: u8) {
    debug_assert!(reg.code() < 4, "only the legacy low byte registers are supported");
    jit.write_u8(0xb0 + reg.low());
    jit.write_u8(value);
}

/// `mov reg32, imm32` (zero extends on x86-64)
pub fn mov_imm32(jit: &mut Emitter<'_>, reg: Reg, value: u32) {
    rex(jit, false, false, reg.ext(), false);
    jit.write_u8(0xb8 + reg.low());
    jit.write_u32(value);
}

/// `mov reg64, imm64`
pub fn mov_imm64(jit: &mut Emitter<'_>, reg: Reg, value: u64) {
    rex(jit, true, false, reg.ext(), false);
    jit.write_u8(0xb8 + reg.low());
    jit.write_u64(value);
}

/// `call reg`
pub fn call_reg(jit: &mut Emitter<'_>, reg: Reg) {
    rex(jit, false, false, reg.ext(), false);
    jit.write_u8(0xff);
    jit.write_u8(0xd0 | reg.low());
}

/// `call rel32` with the target patched in later
pub fn call_deferred(jit: &mut Emitter<'_>) -> Fixup {
    jit.write_u8(0xe8);
    jit.deferred_rel32()
}

/// Absolute call to any 64-bit address: `call [rip+2]; jmp +8; dq target`
///
/// The target lives in the instruction stream, so the encoding is position independent and always 16 bytes long.
pub fn call_abs(jit: &mut Emitter<'_>, target: u64) {
    jit.write_bytes(&[0xff, 0x15, 0x02, 0x00, 0x00, 0x00]);
    jit.write_bytes(&[0xeb, 0x08]);
    jit.write_u64(target);
}

/// `ret` or `ret imm16`
pub fn ret(jit: &mut Emitter<'_>, pop: u16) {
    if pop == 0 {
        jit.write_u8(0xc3);
    } else {
        jit.write_u8(0xc2);
        jit.write_u16(pop);
    }
}

/// `cld`
pub fn cld(jit: &mut Emitter<'_>) {
    jit.write_u8(0xfc);
}

/// `rep movs` of `width` units
pub fn rep_movs(jit: &mut Emitter<'_>, width: Width) {
    jit.write_u8(0xf3);
    match width {
        Width::Byte => jit.write_u8(0xa4),
        Width::Word => jit.write_bytes(&[0x66, 0xa5]),
        Width::Dword => jit.write_u8(0xa5),
        Width::Qword => jit.write_bytes(&[0x48, 0xa5]),
    }
}

/// `fld dword/qword [m]`
pub fn fld(jit: &mut Emitter<'_>, double: bool, m: Mem) {
    let opcode = if double { 0xdd } else { 0xd9 };
    op_mem(jit, None, false, &[opcode], 0, m);
}

/// `fstp dword/qword [m]`
pub fn fstp(jit: &mut Emitter<'_>, double: bool, m: Mem) {
    let opcode = if double { 0xdd } else { 0xd9 };
    op_mem(jit, None, false, &[opcode], 3, m);
}
