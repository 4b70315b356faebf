//! # IA-32
//!
//! Every argument travels on the stack. The MSVC and System V flavours differ in where the receiver goes, who pops
//! the hidden return pointer and which aggregates come back in registers.
//!
//! Forward trampolines keep the argument buffer in `ebx` and the return buffer in `edi`; hook trampolines keep the
//! receiver in `ebx`.

use super::{align_up, at, copy_bytes, CallAbi, HookContext, PushOrder, Target};
use crate::call::CallTarget;
use crate::code::x86::{self as asm, mem, Reg, Width};
use crate::code::{CompilationState, Emitter};
use crate::signature::{CallConvention, Classification, PassEncode, PassFlags, PassInfo, PassKind, Signature};

/// Registers free for staging a value before it is pushed
const SCRATCH: [Reg; 3] = [Reg::Rax, Reg::Rdx, Reg::Rcx];

/// Bytes of callee-saved registers a hook trampoline pushes below `ebp`
const HOOK_SAVED: i32 = 12;

/// IA-32 calling conventions
#[derive(Debug)]
pub struct X86Abi {
    /// MSVC flavour rather than System V
    windows: bool,
}

impl X86Abi {
    /// Creates the MSVC (`windows`) or System V flavour
    pub(crate) const fn new(windows: bool) -> Self {
        Self { windows }
    }

    /// Whether a parameter travels as a pointer to the value
    fn indirect(&self, info: &PassInfo) -> bool {
        info.is_by_ref()
            || (info.kind() == PassKind::Aggregate && self.classify(info) == Classification::Pointer)
    }

    /// Pushes the address of the buffer bytes at `offset`
    fn push_address(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, offset: usize) {
        if offset == 0 {
            asm::push(jit, Reg::Rbx);
        } else {
            let reg = state.next_scratch(&SCRATCH);
            asm::lea(jit, false, reg, at(Reg::Rbx, offset));
            asm::push(jit, reg);
        }
        state.stack_usage += 4;
    }
}

impl CallAbi for X86Abi {
    fn target(&self) -> Target {
        if self.windows {
            Target::X86Windows
        } else {
            Target::X86Posix
        }
    }

    fn classify(&self, info: &PassInfo) -> Classification {
        if !self.windows && info.flags().contains(PassFlags::DTOR) {
            Classification::Pointer
        } else {
            Classification::Memory
        }
    }

    fn needs_ret_buffer(&self, signature: &Signature) -> bool {
        match signature.ret() {
            Some(ret) if !ret.is_by_ref() && ret.kind() == PassKind::Aggregate => {
                !self.windows
                    || signature.convention() == CallConvention::ThisCall
                    || Width::of(ret.size()).is_none()
                    || ret.has_lifecycle()
            }
            _ => false,
        }
    }

    fn push_order(&self) -> PushOrder {
        PushOrder::StackRightToLeft
    }

    fn write_prologue(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, _signature: &Signature) {
        asm::push(jit, Reg::Rbp);
        asm::mov(jit, false, Reg::Rbp, Reg::Rsp);
        asm::push(jit, Reg::Rdi);
        asm::push(jit, Reg::Rbx);
        asm::load(jit, Width::Dword, Reg::Rdi, mem(Reg::Rbp, 12));
        asm::load(jit, Width::Dword, Reg::Rbx, mem(Reg::Rbp, 8));

        // pad so that the pushes to come leave esp aligned at the call
        let reserved = state.reserved as usize;
        asm::and_imm(jit, false, Reg::Rsp, -16);
        asm::sub_imm32(jit, false, Reg::Rsp, (align_up(reserved, 16) - reserved) as u32);
    }

    fn write_push_pod(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode) {
        if self.indirect(&param.info) {
            self.push_address(jit, state, param.offset);
            return;
        }

        let src = at(Reg::Rbx, param.offset);
        match param.info.size() {
            8 => {
                for half in [4, 0] {
                    let reg = state.next_scratch(&SCRATCH);
                    asm::load(jit, Width::Dword, reg, src.offset(half));
                    asm::push(jit, reg);
                }
                state.stack_usage += 8;
            }
            size => {
                let width = Width::of(size).unwrap_or(Width::Dword);
                let reg = state.next_scratch(&SCRATCH);
                if param.info.is_signed() {
                    asm::load_signed(jit, width, false, reg, src);
                } else {
                    asm::load(jit, width, reg, src);
                }
                asm::push(jit, reg);
                state.stack_usage += 4;
            }
        }
    }

    fn write_push_float(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode) {
        if param.info.is_by_ref() {
            return self.write_push_pod(jit, state, param);
        }

        let size = param.info.size();
        let double = size == 8;
        asm::fld(jit, double, at(Reg::Rbx, param.offset));
        asm::sub_imm(jit, false, Reg::Rsp, size as i32);
        asm::fstp(jit, double, mem(Reg::Rsp, 0));
        state.stack_usage += size as u32;
    }

    fn write_push_object(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, param: &PassEncode) {
        if self.indirect(&param.info) {
            return self.write_push_pod(jit, state, param);
        }

        let size = param.info.size();
        let room = align_up(size, 4);
        asm::sub_imm(jit, false, Reg::Rsp, room as i32);
        copy_bytes(jit, false, Reg::Rax, mem(Reg::Rsp, 0), at(Reg::Rbx, param.offset), size, true);
        state.stack_usage += room as u32;
    }

    fn write_push_this(&self, jit: &mut Emitter<'_>, state: &mut CompilationState) {
        if self.windows {
            asm::load(jit, Width::Dword, Reg::Rcx, mem(Reg::Rbx, 0));
            state.this_reg = Some(Reg::Rcx);
        } else {
            let reg = state.next_scratch(&SCRATCH);
            asm::load(jit, Width::Dword, reg, mem(Reg::Rbx, 0));
            asm::push(jit, reg);
            state.stack_usage += 4;
        }
    }

    fn write_push_ret_buffer(&self, jit: &mut Emitter<'_>, state: &mut CompilationState) {
        asm::push(jit, Reg::Rdi);
        state.stack_usage += 4;
    }

    fn write_call(
        &self,
        jit: &mut Emitter<'_>,
        _state: &mut CompilationState,
        _signature: &Signature,
        target: &CallTarget,
    ) {
        match *target {
            CallTarget::Direct(address) => {
                let fixup = asm::call_deferred(jit);
                jit.patch_rel32(fixup, address);
            }
            CallTarget::Virtual {
                vtable_index,
                vtable_offset,
                this_offset,
            } => {
                // ecx may already hold the receiver
                asm::load(jit, Width::Dword, Reg::Rdx, mem(Reg::Rbx, 0));
                asm::load(jit, Width::Dword, Reg::Rax, at(Reg::Rdx, this_offset + vtable_offset));
                asm::load(jit, Width::Dword, Reg::Rdx, at(Reg::Rax, vtable_index * 4));
                asm::call_reg(jit, Reg::Rdx);
            }
        }
    }

    fn write_rectify_stack(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, signature: &Signature) {
        let amount = if self.windows {
            match signature.convention() {
                CallConvention::ThisCall => 0,
                CallConvention::Cdecl => state.stack_usage,
            }
        } else if state.ret_buffer {
            // the callee pops the hidden pointer
            state.stack_usage - 4
        } else {
            state.stack_usage
        };

        if amount > 0 {
            asm::add_imm(jit, false, Reg::Rsp, amount as i32);
        }
    }

    fn write_return_copy(&self, jit: &mut Emitter<'_>, _state: &mut CompilationState, ret: &PassInfo) {
        let dst = mem(Reg::Rdi, 0);
        if ret.is_by_ref() {
            asm::store(jit, Width::Dword, dst, Reg::Rax);
            return;
        }

        match (ret.kind(), ret.size()) {
            (PassKind::Float, size) => asm::fstp(jit, size == 8, dst),
            (_, 8) => {
                asm::store(jit, Width::Dword, dst, Reg::Rax);
                asm::store(jit, Width::Dword, dst.offset(4), Reg::Rdx);
            }
            (_, size) => asm::store(jit, Width::of(size).unwrap_or(Width::Dword), dst, Reg::Rax),
        }
    }

    fn write_epilogue(&self, jit: &mut Emitter<'_>, _state: &mut CompilationState, _signature: &Signature) {
        asm::lea(jit, false, Reg::Rsp, mem(Reg::Rbp, -8));
        asm::pop(jit, Reg::Rbx);
        asm::pop(jit, Reg::Rdi);
        asm::pop(jit, Reg::Rbp);
        asm::ret(jit, 0);
    }

    fn write_hook(&self, jit: &mut Emitter<'_>, state: &mut CompilationState, hook: &HookContext<'_>) {
        let signature = hook.signature;
        let layout = hook.layout;
        state.ret_buffer = self.needs_ret_buffer(signature);

        // incoming stack arguments, as offsets from the first one at [ebp+8]
        let mut incoming = 0;
        let hidden = state.ret_buffer.then(|| {
            incoming += 4;
            0
        });
        let receiver = (signature.convention().has_receiver() && !self.windows).then(|| {
            incoming += 4;
            incoming - 4
        });
        let slots: Vec<(usize, bool)> = layout
            .params()
            .iter()
            .map(|param| {
                let indirect = self.indirect(&param.info);
                let slot = incoming;
                incoming += if indirect { 4 } else { align_up(param.info.size(), 4) };
                (slot, indirect)
            })
            .collect();
        let arg = |offset: usize| at(Reg::Rbp, 8 + offset);

        let frame = layout.storage_size();
        let locals = align_up(frame + align_up(signature.ret_size(4).max(8), 8), 16);
        let params_at = mem(Reg::Rbp, -HOOK_SAVED - locals as i32);
        let ret_at = params_at.offset(frame as i32);

        asm::push(jit, Reg::Rbp);
        asm::mov(jit, false, Reg::Rbp, Reg::Rsp);
        asm::push(jit, Reg::Rbx);
        asm::push(jit, Reg::Rsi);
        asm::push(jit, Reg::Rdi);
        asm::sub_imm(jit, false, Reg::Rsp, locals as i32);
        asm::and_imm(jit, false, Reg::Rsp, -16);

        if let Some(slot) = receiver {
            asm::load(jit, Width::Dword, Reg::Rbx, arg(slot));
        } else if signature.convention().has_receiver() {
            asm::mov(jit, false, Reg::Rbx, Reg::Rcx);
        } else {
            asm::mov_imm32(jit, Reg::Rbx, 0);
        }
        if layout.has_receiver() {
            asm::store(jit, Width::Dword, params_at, Reg::Rbx);
        }

        for (param, &(slot, indirect)) in layout.params().iter().zip(&slots) {
            let dst = params_at.offset(param.offset as i32);
            let size = param.info.size();
            if indirect {
                asm::load(jit, Width::Dword, Reg::Rdx, arg(slot));
                copy_bytes(jit, false, Reg::Rax, dst, mem(Reg::Rdx, 0), size, false);
            } else {
                copy_bytes(jit, false, Reg::Rax, dst, arg(slot), size, false);
            }
        }

        // dispatch(receiver, params, ret, hook), four pushes keep the alignment
        asm::push_imm32(jit, hook.hook as u32);
        asm::lea(jit, false, Reg::Rax, ret_at);
        asm::push(jit, Reg::Rax);
        asm::lea(jit, false, Reg::Rax, params_at);
        asm::push(jit, Reg::Rax);
        asm::push(jit, Reg::Rbx);
        let fixup = asm::call_deferred(jit);
        jit.patch_rel32(fixup, hook.dispatcher);
        asm::add_imm(jit, false, Reg::Rsp, 16);

        for (param, &(slot, indirect)) in layout.params().iter().zip(&slots) {
            if indirect {
                let src = params_at.offset(param.offset as i32);
                asm::load(jit, Width::Dword, Reg::Rdx, arg(slot));
                copy_bytes(jit, false, Reg::Rax, mem(Reg::Rdx, 0), src, param.info.size(), false);
            }
        }

        if let Some(ret) = signature.ret() {
            if let Some(slot) = hidden {
                asm::load(jit, Width::Dword, Reg::Rdx, arg(slot));
                copy_bytes(jit, false, Reg::Rax, mem(Reg::Rdx, 0), ret_at, ret.size(), false);
                asm::mov(jit, false, Reg::Rax, Reg::Rdx);
            } else if ret.is_by_ref() {
                asm::load(jit, Width::Dword, Reg::Rax, ret_at);
            } else if ret.kind() == PassKind::Float {
                asm::fld(jit, ret.size() == 8, ret_at);
            } else if ret.size() == 8 {
                asm::load(jit, Width::Dword, Reg::Rax, ret_at);
                asm::load(jit, Width::Dword, Reg::Rdx, ret_at.offset(4));
            } else {
                asm::load(jit, Width::of(ret.size()).unwrap_or(Width::Dword), Reg::Rax, ret_at);
            }
        }

        let pop = match (self.windows, signature.convention()) {
            (true, CallConvention::ThisCall) => incoming,
            (false, _) if hidden.is_some() => 4,
            _ => 0,
        };
        asm::lea(jit, false, Reg::Rsp, mem(Reg::Rbp, -HOOK_SAVED));
        asm::pop(jit, Reg::Rdi);
        asm::pop(jit, Reg::Rsi);
        asm::pop(jit, Reg::Rbx);
        asm::pop(jit, Reg::Rbp);
        asm::ret(jit, pop as u16);
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::{Instruction, Mnemonic, OpKind, Register};

    use super::*;
    use crate::call::write_forward;
    use crate::code::{assemble_to_vec, disasm};
    use crate::signature::{FieldKind, FunctionFlags, ParamLayout};

    /// Address the test code pretends to run at
    const BASE: usize = 0x1000_0000;

    /// Emits and decodes a forward trampoline
    fn forward(windows: bool, signature: &Signature, target: CallTarget) -> Vec<Instruction> {
        let abi = X86Abi::new(windows);
        let layout = ParamLayout::new(signature, 4);
        let code = assemble_to_vec(BASE, |jit, state| {
            write_forward(&abi, jit, state, signature, &layout, &target)
        })
        .unwrap();
        let decoded = disasm::decode(&code, 32, BASE as u64);
        assert_eq!(decoded.iter().map(|i| i.len()).sum::<usize>(), code.len());
        decoded
    }

    /// Emits and decodes a hook trampoline
    fn hook(windows: bool, signature: &Signature) -> Vec<Instruction> {
        let abi = X86Abi::new(windows);
        let layout = ParamLayout::new(signature, 4);
        let context = HookContext {
            signature,
            layout: &layout,
            hook: 0x2000_0000,
            dispatcher: BASE + 0x4000,
        };
        let code = assemble_to_vec(BASE, |jit, state| abi.write_hook(jit, state, &context)).unwrap();
        disasm::decode(&code, 32, BASE as u64)
    }

    /// Index of the first `call`
    fn call_index(code: &[Instruction]) -> usize {
        code.iter().position(|i| i.mnemonic() == Mnemonic::Call).unwrap()
    }

    #[test]
    /// MSVC `thiscall`: receiver in ecx, callee cleans up
    fn test_windows_thiscall() {
        let sig = Signature::new(
            CallConvention::ThisCall,
            Some(PassInfo::signed(4)),
            vec![PassInfo::signed(4), PassInfo::float(8)],
            FunctionFlags::empty(),
        );
        let code = forward(true, &sig, CallTarget::Direct(BASE + 0x5000));
        let call = call_index(&code);

        // sanity check
        assert_eq!(code[call].near_branch_target(), (BASE + 0x5000) as u64);

        let before = &code[call - 1];
        assert_eq!(before.mnemonic(), Mnemonic::Mov);
        assert_eq!(before.op0_register(), Register::ECX);
        assert_eq!(before.memory_base(), Register::EBX);

        // no stack fix-up after the call, the result goes straight to [edi]
        let after = &code[call + 1];
        assert_eq!(after.mnemonic(), Mnemonic::Mov);
        assert_eq!(after.memory_base(), Register::EDI);
        assert_eq!(after.op1_register(), Register::EAX);
        assert_eq!(code.last().unwrap().mnemonic(), Mnemonic::Ret);
    }

    #[test]
    /// The frame pad brings the pushed arguments to a multiple of 16 bytes
    fn test_alignment_pad() {
        let sig = Signature::new(
            CallConvention::Cdecl,
            None,
            vec![PassInfo::integer(4), PassInfo::integer(2), PassInfo::signed(1)],
            FunctionFlags::empty(),
        );
        let code = forward(false, &sig, CallTarget::Direct(BASE));
        let pad = code
            .iter()
            .find(|i| i.mnemonic() == Mnemonic::Sub && i.op0_register() == Register::ESP)
            .unwrap();
        assert_eq!(pad.immediate(1), 4);

        let pushes = code.iter().filter(|i| i.mnemonic() == Mnemonic::Push).count();
        // ebp, edi, ebx and three arguments
        assert_eq!(pushes, 6);
        assert!(code.iter().any(|i| i.mnemonic() == Mnemonic::Movsx));

        let call = call_index(&code);
        assert_eq!(code[call + 1].mnemonic(), Mnemonic::Add);
        assert_eq!(code[call + 1].immediate(1), 12);
    }

    #[test]
    /// System V returns every aggregate through a hidden pointer the callee pops
    fn test_posix_hidden_return() {
        let sig = Signature::new(
            CallConvention::Cdecl,
            Some(PassInfo::aggregate(
                12,
                [FieldKind::Int32, FieldKind::Int32, FieldKind::Int32],
            )),
            vec![PassInfo::integer(4)],
            FunctionFlags::empty(),
        );
        let code = forward(false, &sig, CallTarget::Direct(BASE));
        let call = call_index(&code);

        assert_eq!(code[call - 1].mnemonic(), Mnemonic::Push);
        assert_eq!(code[call - 1].op0_register(), Register::EDI);
        assert_eq!(code[call + 1].mnemonic(), Mnemonic::Add);
        assert_eq!(code[call + 1].immediate(1), 4);
        // nothing is copied back
        assert_eq!(code[call + 2].mnemonic(), Mnemonic::Lea);
    }

    #[test]
    /// MSVC returns small power-of-two aggregates in edx:eax
    fn test_windows_register_return() {
        let sig = Signature::new(
            CallConvention::Cdecl,
            Some(PassInfo::aggregate(8, [FieldKind::Int32, FieldKind::Int32])),
            vec![],
            FunctionFlags::empty(),
        );
        let code = forward(true, &sig, CallTarget::Direct(BASE));
        let call = call_index(&code);
        assert_eq!(code[call + 1].op1_register(), Register::EAX);
        assert_eq!(code[call + 2].op1_register(), Register::EDX);
        assert_eq!(code[call + 2].memory_displacement32(), 4);
    }

    #[test]
    /// Floats go through the x87 stack in both directions
    fn test_float_transfer() {
        let sig = Signature::new(
            CallConvention::Cdecl,
            Some(PassInfo::float(4)),
            vec![PassInfo::float(8)],
            FunctionFlags::empty(),
        );
        let code = forward(false, &sig, CallTarget::Direct(BASE));
        let mnemonics: Vec<_> = code.iter().map(Instruction::mnemonic).collect();
        let fld = mnemonics.iter().position(|m| *m == Mnemonic::Fld).unwrap();
        assert_eq!(mnemonics[fld + 1], Mnemonic::Sub);
        assert_eq!(mnemonics[fld + 2], Mnemonic::Fstp);

        let call = call_index(&code);
        assert_eq!(mnemonics[call + 2], Mnemonic::Fstp);
        assert_eq!(code[call + 2].memory_base(), Register::EDI);
    }

    #[test]
    /// Virtual calls read the slot through the receiver
    fn test_virtual_call() {
        let sig = Signature::new(CallConvention::ThisCall, None, vec![], FunctionFlags::empty());
        let code = forward(
            true,
            &sig,
            CallTarget::Virtual {
                vtable_index: 3,
                vtable_offset: 0,
                this_offset: 0,
            },
        );
        let call = call_index(&code);
        assert_eq!(code[call].op0_register(), Register::EDX);
        assert_eq!(code[call - 1].memory_base(), Register::EAX);
        assert_eq!(code[call - 1].memory_displacement32(), 12);
    }

    #[test]
    /// Aggregates are copied onto the stack, or passed by address when they have a destructor on System V
    fn test_object_push() {
        let object = PassInfo::aggregate(6, [FieldKind::Int32, FieldKind::Int16]);
        let sig = Signature::new(CallConvention::Cdecl, None, vec![object.clone()], FunctionFlags::empty());
        let code = forward(false, &sig, CallTarget::Direct(BASE));
        let call = call_index(&code);
        assert_eq!(code[call + 1].immediate(1), 8);

        let sig = Signature::new(
            CallConvention::Cdecl,
            None,
            vec![object.with_flags(PassFlags::DTOR)],
            FunctionFlags::empty(),
        );
        let code = forward(false, &sig, CallTarget::Direct(BASE));
        let call = call_index(&code);
        assert_eq!(code[call - 1].mnemonic(), Mnemonic::Push);
        assert_eq!(code[call - 1].op0_register(), Register::EBX);
        assert_eq!(code[call + 1].immediate(1), 4);
    }

    #[test]
    /// Hooks pop what their convention makes the callee pop
    fn test_hook_return_pop() {
        let sig = Signature::new(
            CallConvention::ThisCall,
            Some(PassInfo::integer(4)),
            vec![PassInfo::integer(4), PassInfo::float(8)],
            FunctionFlags::empty(),
        );
        let code = hook(true, &sig);
        let ret = code.last().unwrap();
        assert_eq!(ret.mnemonic(), Mnemonic::Ret);
        assert_eq!(ret.op0_kind(), OpKind::Immediate16);
        assert_eq!(ret.immediate16(), 12);
        assert!(code
            .iter()
            .any(|i| i.mnemonic() == Mnemonic::Mov && i.op1_register() == Register::ECX));

        let code = hook(false, &sig);
        assert_eq!(code.last().unwrap().op_count(), 0);

        let sig = Signature::new(
            CallConvention::Cdecl,
            Some(PassInfo::aggregate(12, [FieldKind::Int32; 3])),
            vec![],
            FunctionFlags::empty(),
        );
        let code = hook(false, &sig);
        assert_eq!(code.last().unwrap().immediate16(), 4);
    }

    #[test]
    /// Hooks hand the dispatcher its four arguments
    fn test_hook_dispatch() {
        let sig = Signature::new(
            CallConvention::Cdecl,
            None,
            vec![PassInfo::integer(4).by_ref()],
            FunctionFlags::empty(),
        );
        let code = hook(true, &sig);
        let call = call_index(&code);
        assert_eq!(code[call].near_branch_target(), (BASE + 0x4000) as u64);
        assert_eq!(code[call - 1].op0_register(), Register::EBX);
        let push_hook = &code[call - 6];
        assert_eq!(push_hook.mnemonic(), Mnemonic::Push);
        assert_eq!(push_hook.immediate32(), 0x2000_0000);

        // the by-reference parameter is copied back after the dispatcher returns
        let copy_back = code[call..]
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Mov && i.memory_base() == Register::EDX)
            .count();
        assert_eq!(copy_back, 1);
    }
}
