//! # x86-64
//!
//! System V and Microsoft conventions. System V hands out integer and vector registers from two independent
//! sequences and splits small aggregates into eightbytes; Microsoft assigns one positional slot per argument, with
//! 32 bytes of shadow space below the stack arguments.
//!
//! Forward trampolines keep the argument buffer in `rbx`, the return buffer in `r14` and the entry stack pointer in
//! `r15`. Calls go through [`asm::call_abs`], so the code is the same length wherever it lands.

use super::{align_up, at, copy_bytes, CallAbi, HookContext, PushOrder, Target};
use crate::call::CallTarget;
use crate::code::x86::{self as asm, mem, Mem, Reg, Width, Xmm};
use crate::code::{CompilationState, Emitter};
use crate::signature::{
    classify_sysv, classify_with_budget, CallConvention, Classification, Eightbytes, PassEncode, PassFlags, PassInfo,
    PassKind, Signature, WordClass,
};

/// System V integer argument registers
const SYSV_INT: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
/// Microsoft integer argument registers
const MS_INT: [Reg; 4] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];
/// Registers free for staging stack arguments
const SCRATCH: [Reg; 3] = [Reg::Rax, Reg::R10, Reg::R11];
/// Vector registers free for staging stack arguments under System V
const SYSV_FLOAT_SCRATCH: [Xmm; 8] = [Xmm(8), Xmm(9), Xmm(10), Xmm(11), Xmm(12), Xmm(13), Xmm(14), Xmm(15)];
/// Vector registers free for staging stack arguments under Microsoft
const MS_FLOAT_SCRATCH: [Xmm; 2] = [Xmm(4), Xmm(5)];
/// Integer return registers
const RETURN_INT: [Reg; 2] = [Reg::Rax, Reg::Rdx];
/// Home area the Microsoft caller reserves for the four register arguments
const SHADOW: u32 = 32;
/// Registers a hook trampoline saves, in push order
const HOOK_SAVED: [Reg; 6] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::Rsi, Reg::Rdi];

/// Where one argument (or one eightbyte of it) travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Integer argument register, by index
    Int(usize),
    /// Vector argument register, by index
    Float(usize),
    /// Outgoing stack area, by offset from the stack pointer at the call
    Stack(u32),
}

/// How a hook trampoline receives one declared parameter
#[derive(Debug)]
enum Incoming {
    /// The value itself, as `(offset, length, slot)` pieces
    Value(Vec<(usize, usize, Slot)>),
    /// A pointer to the value
    Indirect(Slot),
}

/// x86-64 calling conventions
#[derive(Debug)]
pub struct X64Abi {
    /// Microsoft rather than System V
    windows: bool,
}

impl X64Abi {
    /// Creates the Microsoft (`windows`) or System V flavour
    pub(crate) const fn new(windows: bool) -> Self {
        Self { windows }
    }

    /// Integer argument registers
    fn int_regs(&self) -> &'static [Reg] {
        if self.windows {
            &MS_INT
        } else {
            &SYSV_INT
        }
    }

    /// Number of vector argument registers
    fn float_regs(&self) -> usize {
        if self.windows {
            4
        } else {
            8
        }
    }

    /// Scratch vector registers
    fn float_scratch(&self) -> &'static [Xmm] {
        if self.windows {
            &MS_FLOAT_SCRATCH
        } else {
            &SYSV_FLOAT_SCRATCH
        }
    }

    /// Bytes below the first stack argument
    fn shadow(&self) -> u32 {
        if self.windows {
            SHADOW
        } else {
            0
        }
    }

    /// Reserves an 8-byte aligned stack area of `size` bytes
    fn stack_slot(&self, state: &mut CompilationState, size: usize) -> u32 {
        let offset = state.stack_usage;
        state.stack_usage += align_up(size, 8) as u32;
        offset
    }

    /// Next integer argument slot
    ///
    /// Microsoft slots are positional, so `int_args` counts every argument there.
    fn next_int(&self, state: &mut CompilationState) -> Slot {
        let index = state.int_args;
        if index < self.int_regs().len() {
            state.int_args += 1;
            Slot::Int(index)
        } else {
            if self.windows {
                state.int_args += 1;
            }
            Slot::Stack(self.stack_slot(state, 8))
        }
    }

    /// Next vector argument slot
    fn next_float(&self, state: &mut CompilationState) -> Slot {
        if self.windows {
            let index = state.int_args;
            state.int_args += 1;
            if index < self.float_regs() {
                return Slot::Float(index);
            }
        } else if state.float_args < self.float_regs() {
            state.float_args += 1;
            return Slot::Float(state.float_args - 1);
        }
        Slot::Stack(self.stack_slot(state, 8))
    }

    /// Classification with the registers still available taken into account
    fn classify_in(&self, info: &PassInfo, state: &CompilationState) -> Classification {
        if self.windows {
            self.classify(info)
        } else {
            classify_with_budget(
                info,
                SYSV_INT.len().saturating_sub(state.int_args),
                self.float_regs().saturating_sub(state.float_args),
            )
        }
    }

    /// Register an integer slot is loaded into, a scratch register for stack slots
    fn staging_reg(&self, state: &mut CompilationState, slot: Slot) -> Reg {
        match slot {
            Slot::Int(index) => self.int_regs()[index],
            _ => state.next_scratch(&SCRATCH),
        }
    }

    /// Stores a staged integer into its stack slot, if it has one
    fn spill(&self, jit: &mut Emitter<'_>, slot: Slot, reg: Reg) {
        if let Slot::Stack(offset) = slot {
            asm::store(jit, Width::Qword, at(Reg::Rsp, offset as usize), reg);
        }
    }

    /// Loads `size` bytes at `src` into an integer slot
    ///
    /// Sizes that are no machine width are read as a full eightbyte, which the buffer slack covers.
    fn place_integer(
        &self,
        jit: &mut Emitter<'_>,
        state: &mut CompilationState,
        slot: Slot,
        src: Mem,
        size: usize,
        signed: bool,
    ) {
        let reg = self.staging_reg(state, slot);
        match Width::of(size) {
            Some(width) if signed => asm::load_signed(jit, width, true, reg, src),
            Some(width) => asm::load(jit, width, reg, src),
            None => asm::load(jit, Width::Qword, reg, src),
        }
        self.spill(jit, slot, reg);
    }

    /// Places the address of the buffer bytes at `offset` into an integer slot
    fn place_address(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, slot: Slot, offset: usize) {
        let reg = self.staging_reg(state, slot);
        if offset == 0 {
            asm::mov(jit, true, reg, Reg::Rbx);
        } else {
            asm::lea(jit, true, reg, at(Reg::Rbx, offset));
        }
        self.spill(jit, slot, reg);
    }

    /// Loads a float at `src` into a vector slot
    ///
    /// Variadic Microsoft callees also find register floats in the matching integer register.
    fn place_float(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, slot: Slot, src: Mem, double: bool) {
        let xmm = match slot {
            Slot::Float(index) => Xmm(index as u8),
            _ => state.next_float_scratch(self.float_scratch()),
        };
        asm::load_float(jit, double, xmm, src);
        match slot {
            Slot::Stack(offset) => asm::store_float(jit, double, at(Reg::Rsp, offset as usize), xmm),
            Slot::Float(index) if self.windows && state.variadic => {
                asm::mov_from_xmm(jit, double, MS_INT[index], xmm)
            }
            _ => {}
        }
    }

    /// Places every eightbyte of a register-class aggregate
    fn place_eightbytes(
        &self,
        jit: &mut Emitter<'_>,
        state: &mut CompilationState,
        words: &Eightbytes,
        src: Mem,
    ) {
        for (offset, len, class) in words.windows() {
            let src = src.offset(offset as i32);
            match class {
                WordClass::Integer => {
                    let slot = self.next_int(state);
                    self.place_integer(jit, state, slot, src, len, false);
                }
                WordClass::Sse => {
                    let slot = self.next_float(state);
                    self.place_float(jit, state, slot, src, len > 4);
                }
            }
        }
    }

    /// Sets `al` to the number of vector registers used, for variadic System V callees
    fn write_vector_count(&self, jit: &mut Emitter<'_>, state: &CompilationState) {
        if !self.windows && state.variadic {
            asm::mov_imm8(jit, Reg::Rax, state.float_args as u8);
        }
    }

    /// Assigns incoming slots to a hook's declared parameters, in the same order a caller fills them
    fn incoming(&self, state: &mut CompilationState, info: &PassInfo) -> Incoming {
        if info.is_by_ref() {
            return Incoming::Indirect(self.next_int(state));
        }

        let size = info.size();
        match info.kind() {
            PassKind::Integer => Incoming::Value(vec![(0, size, self.next_int(state))]),
            PassKind::Float => Incoming::Value(vec![(0, size, self.next_float(state))]),
            PassKind::Aggregate => match self.classify_in(info, state) {
                Classification::Pointer => Incoming::Indirect(self.next_int(state)),
                Classification::Memory => Incoming::Value(vec![(0, size, Slot::Stack(self.stack_slot(state, size)))]),
                Classification::Registers(words) => Incoming::Value(
                    words
                        .windows()
                        .map(|(offset, len, class)| {
                            let slot = match class {
                                WordClass::Integer => self.next_int(state),
                                WordClass::Sse => self.next_float(state),
                            };
                            (offset, len, slot)
                        })
                        .collect(),
                ),
            },
        }
    }
}

/// Stores the low `len` bytes of `reg` at `dst`, shifting it down as it goes
fn store_partial(jit: &mut Emitter<'_>, reg: Reg, dst: Mem, len: usize) {
    if let Some(width) = Width::of(len) {
        asm::store(jit, width, dst, reg);
        return;
    }

    let mut done = 0;
    for width in [Width::Dword, Width::Word, Width::Byte] {
        if len - done >= width.bytes() {
            asm::store(jit, width, dst.offset(done as i32), reg);
            done += width.bytes();
            if done < len {
                asm::shr_imm(jit, true, reg, (width.bytes() * 8) as u8);
            }
        }
    }
}

impl CallAbi for X64Abi {
    fn target(&self) -> Target {
        if self.windows {
            Target::X64Microsoft
        } else {
            Target::X64SystemV
        }
    }

    fn classify(&self, info: &PassInfo) -> Classification {
        if !self.windows {
            return classify_sysv(info);
        }

        let size = info.size();
        if Width::of(size).is_some() && !info.flags().intersects(PassFlags::DTOR | PassFlags::COPY_CTOR) {
            Classification::Registers(Eightbytes::single_integer(size))
        } else {
            Classification::Pointer
        }
    }

    fn needs_ret_buffer(&self, signature: &Signature) -> bool {
        match signature.ret() {
            Some(ret) if !ret.is_by_ref() && ret.kind() == PassKind::Aggregate => {
                let in_memory = self.classify(ret).is_in_memory();
                if self.windows {
                    in_memory || signature.convention() == CallConvention::ThisCall || ret.has_lifecycle()
                } else {
                    in_memory
                }
            }
            _ => false,
        }
    }

    fn push_order(&self) -> PushOrder {
        if self.windows {
            PushOrder::ReceiverFirst
        } else {
            PushOrder::RetBufferFirst
        }
    }

    fn write_prologue(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, _signature: &Signature) {
        let (args, ret) = if self.windows {
            (Reg::Rcx, Reg::Rdx)
        } else {
            (Reg::Rdi, Reg::Rsi)
        };

        asm::push(jit, Reg::Rbp);
        asm::mov(jit, true, Reg::Rbp, Reg::Rsp);
        asm::push(jit, Reg::R14);
        asm::push(jit, Reg::Rbx);
        asm::push(jit, Reg::R15);
        asm::mov(jit, true, Reg::R14, ret);
        asm::mov(jit, true, Reg::Rbx, args);

        asm::mov(jit, true, Reg::R15, Reg::Rsp);
        asm::and_imm(jit, true, Reg::Rsp, -16);
        asm::sub_imm32(jit, true, Reg::Rsp, align_up(state.reserved as usize, 16) as u32);
        state.stack_usage = self.shadow();
    }

    fn write_push_pod(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode) {
        let slot = self.next_int(state);
        if param.info.is_by_ref() {
            self.place_address(jit, state, slot, param.offset);
        } else {
            let src = at(Reg::Rbx, param.offset);
            self.place_integer(jit, state, slot, src, param.info.size(), param.info.is_signed());
        }
    }

    fn write_push_float(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode) {
        if param.info.is_by_ref() {
            return self.write_push_pod(jit, state, param);
        }

        let slot = self.next_float(state);
        self.place_float(jit, state, slot, at(Reg::Rbx, param.offset), param.info.size() == 8);
    }

    fn write_push_object(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode) {
        if param.info.is_by_ref() {
            return self.write_push_pod(jit, state, param);
        }

        let src = at(Reg::Rbx, param.offset);
        match self.classify_in(&param.info, state) {
            Classification::Registers(words) => self.place_eightbytes(jit, state, &words, src),
            Classification::Memory => {
                let size = param.info.size();
                let offset = self.stack_slot(state, size);
                copy_bytes(jit, true, Reg::Rax, at(Reg::Rsp, offset as usize), src, size, true);
            }
            Classification::Pointer => {
                let slot = self.next_int(state);
                self.place_address(jit, state, slot, param.offset);
            }
        }
    }

    fn write_push_this(&self, jit: &mut Emitter<'_>, state: &mut CompilationState) {
        let slot = self.next_int(state);
        self.place_integer(jit, state, slot, mem(Reg::Rbx, 0), 8, false);
        if let Slot::Int(index) = slot {
            state.this_reg = Some(self.int_regs()[index]);
        }
    }

    fn write_push_ret_buffer(&self, jit: &mut Emitter<'_>, state: &mut CompilationState) {
        let slot = self.next_int(state);
        let reg = self.staging_reg(state, slot);
        asm::mov(jit, true, reg, Reg::R14);
        self.spill(jit, slot, reg);
    }

    fn write_call(
        &self,
        jit: &mut Emitter<'_>,
        state: &mut CompilationState,
        _signature: &Signature,
        target: &CallTarget,
    ) {
        match *target {
            CallTarget::Direct(address) => {
                self.write_vector_count(jit, state);
                asm::call_abs(jit, address as u64);
            }
            CallTarget::Virtual {
                vtable_index,
                vtable_offset,
                this_offset,
            } => {
                let vtable = at(Reg::R10, this_offset + vtable_offset);
                match state.this_reg {
                    Some(this) => asm::load(jit, Width::Qword, Reg::R10, at(this, this_offset + vtable_offset)),
                    None => {
                        asm::load(jit, Width::Qword, Reg::R10, mem(Reg::Rbx, 0));
                        asm::load(jit, Width::Qword, Reg::R10, vtable);
                    }
                }
                asm::load(jit, Width::Qword, Reg::R11, at(Reg::R10, vtable_index * 8));
                self.write_vector_count(jit, state);
                asm::call_reg(jit, Reg::R11);
            }
        }
    }

    fn write_rectify_stack(&self, _jit: &mut Emitter<'_>, _state: &mut CompilationState, _signature: &Signature) {
        // the caller owns the outgoing area and the epilogue resets rsp
    }

    fn write_return_copy(&self, jit: &mut Emitter<'_>, _state: &mut CompilationState, ret: &PassInfo) {
        let dst = mem(Reg::R14, 0);
        if ret.is_by_ref() {
            asm::store(jit, Width::Qword, dst, Reg::Rax);
            return;
        }

        match ret.kind() {
            PassKind::Integer => asm::store(jit, Width::of(ret.size()).unwrap_or(Width::Qword), dst, Reg::Rax),
            PassKind::Float => asm::store_float(jit, ret.size() == 8, dst, Xmm(0)),
            PassKind::Aggregate => {
                if let Classification::Registers(words) = self.classify(ret) {
                    let (mut ints, mut vectors) = (0, 0);
                    for (offset, len, class) in words.windows() {
                        let dst = dst.offset(offset as i32);
                        match class {
                            WordClass::Integer => {
                                store_partial(jit, RETURN_INT[ints], dst, len);
                                ints += 1;
                            }
                            WordClass::Sse => {
                                asm::store_float(jit, len > 4, dst, Xmm(vectors));
                                vectors += 1;
                            }
                        }
                    }
                }
            }
        }
    }

    fn write_epilogue(&self, jit: &mut Emitter<'_>, _state: &mut CompilationState, _signature: &Signature) {
        asm::mov(jit, true, Reg::Rsp, Reg::R15);
        asm::pop(jit, Reg::R15);
        asm::pop(jit, Reg::Rbx);
        asm::pop(jit, Reg::R14);
        asm::pop(jit, Reg::Rbp);
        asm::ret(jit, 0);
    }

    fn write_hook(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, hook: &HookContext<'_>) {
        let signature = hook.signature;
        let layout = hook.layout;
        state.ret_buffer = self.needs_ret_buffer(signature);
        state.variadic = signature.is_variadic();
        state.stack_usage = self.shadow();

        let int_regs = self.int_regs();
        let frame = layout.storage_size();
        let save = (int_regs.len() + self.float_regs()) * 8;
        let locals = align_up(save + frame + align_up(signature.ret_size(8).max(16), 8), 16);
        let bottom = -((HOOK_SAVED.len() * 8 + locals) as i32);
        let int_save = |index: usize| mem(Reg::Rbp, bottom + (index * 8) as i32);
        let float_save = |index: usize| mem(Reg::Rbp, bottom + ((int_regs.len() + index) * 8) as i32);
        let params_at = mem(Reg::Rbp, bottom + save as i32);
        let ret_at = params_at.offset(frame as i32);
        let slot_mem = |slot: Slot| match slot {
            Slot::Int(index) => int_save(index),
            Slot::Float(index) => float_save(index),
            Slot::Stack(offset) => mem(Reg::Rbp, 16 + offset as i32),
        };

        // walk the arguments the way a caller assigns them
        let has_receiver = signature.convention().has_receiver();
        let has_hidden = state.ret_buffer;
        let (receiver, hidden) = if self.push_order() == PushOrder::ReceiverFirst {
            let receiver = has_receiver.then(|| self.next_int(state));
            (receiver, has_hidden.then(|| self.next_int(state)))
        } else {
            let hidden = has_hidden.then(|| self.next_int(state));
            (has_receiver.then(|| self.next_int(state)), hidden)
        };
        let incoming: Vec<Incoming> = layout.params().iter().map(|param| self.incoming(state, &param.info)).collect();

        asm::push(jit, Reg::Rbp);
        asm::mov(jit, true, Reg::Rbp, Reg::Rsp);
        HOOK_SAVED.iter().for_each(|&reg| asm::push(jit, reg));
        asm::sub_imm(jit, true, Reg::Rsp, (locals as u32 + self.shadow()) as i32);

        for (index, &reg) in int_regs.iter().enumerate() {
            asm::store(jit, Width::Qword, int_save(index), reg);
        }
        for index in 0..self.float_regs() {
            asm::store_float(jit, true, float_save(index), Xmm(index as u8));
        }

        match receiver {
            Some(slot) => asm::load(jit, Width::Qword, Reg::Rbx, slot_mem(slot)),
            None => asm::mov_imm32(jit, Reg::Rbx, 0),
        }
        if layout.has_receiver() {
            asm::store(jit, Width::Qword, params_at, Reg::Rbx);
        }
        if let Some(slot) = hidden {
            asm::load(jit, Width::Qword, Reg::R12, slot_mem(slot));
        }

        for (param, incoming) in layout.params().iter().zip(&incoming) {
            let dst = params_at.offset(param.offset as i32);
            match incoming {
                Incoming::Value(pieces) => {
                    for &(offset, len, slot) in pieces {
                        copy_bytes(jit, true, Reg::Rax, dst.offset(offset as i32), slot_mem(slot), len, false);
                    }
                }
                Incoming::Indirect(slot) => {
                    asm::load(jit, Width::Qword, Reg::R13, slot_mem(*slot));
                    copy_bytes(jit, true, Reg::Rax, dst, mem(Reg::R13, 0), param.info.size(), false);
                }
            }
        }

        // dispatch(receiver, params, ret, hook)
        let args = if self.windows {
            [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9]
        } else {
            [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx]
        };
        asm::mov(jit, true, args[0], Reg::Rbx);
        asm::lea(jit, true, args[1], params_at);
        asm::lea(jit, true, args[2], ret_at);
        asm::mov_imm64(jit, args[3], hook.hook as u64);
        asm::call_abs(jit, hook.dispatcher as u64);

        for (param, incoming) in layout.params().iter().zip(&incoming) {
            if let Incoming::Indirect(slot) = incoming {
                let src = params_at.offset(param.offset as i32);
                asm::load(jit, Width::Qword, Reg::R13, slot_mem(*slot));
                copy_bytes(jit, true, Reg::Rax, mem(Reg::R13, 0), src, param.info.size(), false);
            }
        }

        if let Some(ret) = signature.ret() {
            if state.ret_buffer {
                copy_bytes(jit, true, Reg::Rax, mem(Reg::R12, 0), ret_at, ret.size(), false);
                asm::mov(jit, true, Reg::Rax, Reg::R12);
            } else if ret.is_by_ref() {
                asm::load(jit, Width::Qword, Reg::Rax, ret_at);
            } else {
                match ret.kind() {
                    PassKind::Integer => {
                        let width = Width::of(ret.size()).unwrap_or(Width::Qword);
                        if ret.is_signed() {
                            asm::load_signed(jit, width, true, Reg::Rax, ret_at);
                        } else {
                            asm::load(jit, width, Reg::Rax, ret_at);
                        }
                    }
                    PassKind::Float => asm::load_float(jit, ret.size() == 8, Xmm(0), ret_at),
                    PassKind::Aggregate => {
                        if let Classification::Registers(words) = self.classify(ret) {
                            let (mut ints, mut vectors) = (0, 0);
                            for (offset, len, class) in words.windows() {
                                let src = ret_at.offset(offset as i32);
                                match class {
                                    WordClass::Integer => {
                                        asm::load(jit, Width::Qword, RETURN_INT[ints], src);
                                        ints += 1;
                                    }
                                    WordClass::Sse => {
                                        asm::load_float(jit, len > 4, Xmm(vectors), src);
                                        vectors += 1;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        asm::lea(jit, true, Reg::Rsp, mem(Reg::Rbp, -((HOOK_SAVED.len() * 8) as i32)));
        HOOK_SAVED.iter().rev().for_each(|&reg| asm::pop(jit, reg));
        asm::pop(jit, Reg::Rbp);
        asm::ret(jit, 0);
    }
}
