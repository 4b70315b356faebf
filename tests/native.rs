//! Trampolines executed against real native functions on the running host

#![cfg(target_arch = "x86_64")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libtrampoline::signature::FieldKind;
use libtrampoline::{
    compile_call, compile_hook, compile_virtual_call, CallConvention, Compiler, FunctionFlags, HookAction,
    HookInvocation, PassInfo, Signature,
};
use tracing_subscriber::EnvFilter;

/// Routes trampoline listings to the test output when `RUST_LOG` asks for them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Triple {
    a: i32,
    b: i32,
    c: i32,
}

#[repr(C)]
struct Counter {
    vtable: *const usize,
    value: i32,
}

extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn widen(a: u8, b: i16, c: u64) -> i64 {
    a as i64 + b as i64 + c as i64
}

extern "C" fn mix(a: f64, b: i64, c: f32) -> f64 {
    a * b as f64 + c as f64
}

extern "C" fn sum(t: Triple) -> i32 {
    t.a + t.b + t.c
}

extern "C" fn make(base: i32) -> Triple {
    Triple {
        a: base,
        b: base + 1,
        c: base + 2,
    }
}

extern "C" fn deref_len(s: *const u8, len: usize) -> u8 {
    unsafe { *s.add(len - 1) }
}

extern "C" fn bump(value: *mut i32) {
    unsafe { *value += 1 }
}

extern "C" fn many(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64, h: i64) -> i64 {
    a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f + 7 * g + 8 * h
}

extern "C" fn counter_get(this: *mut Counter) -> i32 {
    unsafe { (*this).value }
}

extern "C" fn counter_add(this: *mut Counter, by: i32) -> i32 {
    unsafe {
        (*this).value += by;
        (*this).value
    }
}

/// Signature of `add`
fn add_signature() -> Signature {
    Signature::new(
        CallConvention::Cdecl,
        Some(PassInfo::signed(4)),
        vec![PassInfo::signed(4), PassInfo::signed(4)],
        FunctionFlags::empty(),
    )
}

#[test]
/// The simplest call there is
fn test_add() {
    init_tracing();
    let call = compile_call(
        add as usize,
        CallConvention::Cdecl,
        Some(PassInfo::signed(4)),
        vec![PassInfo::signed(4), PassInfo::signed(4)],
        FunctionFlags::empty(),
    )
    .unwrap();

    let mut args = call.new_args();
    args.write(0, 2i32);
    args.write(1, 3i32);
    let mut ret = [0u8; 4];
    unsafe { call.execute(&mut args, &mut ret) };
    assert_eq!(i32::from_ne_bytes(ret), 5);
}

#[test]
/// Narrow integers are widened before the call
fn test_integer_widths() {
    init_tracing();
    let call = compile_call(
        widen as usize,
        CallConvention::Cdecl,
        Some(PassInfo::signed(8)),
        vec![PassInfo::integer(1), PassInfo::signed(2), PassInfo::integer(8)],
        FunctionFlags::empty(),
    )
    .unwrap();

    let mut args = call.new_args();
    args.write(0, 200u8);
    args.write(1, -300i16);
    args.write(2, 1u64 << 40);
    let mut ret = [0u8; 8];
    unsafe { call.execute(&mut args, &mut ret) };
    assert_eq!(i64::from_ne_bytes(ret), 200 - 300 + (1 << 40));
}

#[test]
/// Floats and integers interleave without disturbing each other's registers
fn test_floats() {
    init_tracing();
    let call = compile_call(
        mix as usize,
        CallConvention::Cdecl,
        Some(PassInfo::float(8)),
        vec![PassInfo::float(8), PassInfo::signed(8), PassInfo::float(4)],
        FunctionFlags::empty(),
    )
    .unwrap();

    let mut args = call.new_args();
    args.write(0, 1.5f64);
    args.write(1, 4i64);
    args.write(2, 0.25f32);
    let mut ret = [0u8; 8];
    unsafe { call.execute(&mut args, &mut ret) };
    assert_eq!(f64::from_ne_bytes(ret), 6.25);
}

#[test]
/// Pointers pass through untouched
fn test_pointers() {
    init_tracing();
    let call = compile_call(
        deref_len as usize,
        CallConvention::Cdecl,
        Some(PassInfo::integer(1)),
        vec![PassInfo::pointer(), PassInfo::integer(8)],
        FunctionFlags::empty(),
    )
    .unwrap();

    let text = b"trampoline";
    let mut args = call.new_args();
    args.write_ptr(0, text.as_ptr());
    args.write(1, text.len());
    let mut ret = [0u8; 1];
    unsafe { call.execute(&mut args, &mut ret) };
    assert_eq!(ret[0], b'e');
}

#[test]
/// Arguments beyond the register budget go to the stack
fn test_stack_arguments() {
    init_tracing();
    let call = compile_call(
        many as usize,
        CallConvention::Cdecl,
        Some(PassInfo::signed(8)),
        vec![PassInfo::signed(8); 8],
        FunctionFlags::empty(),
    )
    .unwrap();

    let mut args = call.new_args();
    for index in 0..8 {
        args.write(index, index as i64 + 1);
    }
    let mut ret = [0u8; 8];
    unsafe { call.execute(&mut args, &mut ret) };
    assert_eq!(i64::from_ne_bytes(ret), many(1, 2, 3, 4, 5, 6, 7, 8));
}

#[test]
/// Twelve-byte structures travel by value in both directions
fn test_struct_by_value() {
    init_tracing();
    let triple = PassInfo::aggregate(12, [FieldKind::Int32; 3]);

    let call = compile_call(
        sum as usize,
        CallConvention::Cdecl,
        Some(PassInfo::signed(4)),
        vec![triple.clone()],
        FunctionFlags::empty(),
    )
    .unwrap();
    let mut args = call.new_args();
    args.write(0, [10i32, 20, 30]);
    let mut ret = [0u8; 4];
    unsafe { call.execute(&mut args, &mut ret) };
    assert_eq!(i32::from_ne_bytes(ret), 60);

    let call = compile_call(
        make as usize,
        CallConvention::Cdecl,
        Some(triple),
        vec![PassInfo::signed(4)],
        FunctionFlags::empty(),
    )
    .unwrap();
    let mut args = call.new_args();
    args.write(0, 7i32);
    let mut ret = [0u8; 12];
    unsafe { call.execute(&mut args, &mut ret) };
    let made: [i32; 3] = bytemuck::cast(ret);
    assert_eq!(made, [7, 8, 9]);
}

#[test]
/// By-reference parameters see the callee's writes after the call
fn test_by_ref_write_back() {
    init_tracing();
    let call = compile_call(
        bump as usize,
        CallConvention::Cdecl,
        None,
        vec![PassInfo::signed(4).by_ref()],
        FunctionFlags::empty(),
    )
    .unwrap();

    let mut args = call.new_args();
    args.write(0, 41i32);
    unsafe { call.execute(&mut args, &mut [0u8; 0]) };
    assert_eq!(args.read::<i32>(0), 42);
}

#[test]
/// Virtual calls go through the receiver's table
fn test_virtual_dispatch() {
    init_tracing();
    let vtable = [counter_get as usize, counter_add as usize];
    let mut counter = Counter {
        vtable: vtable.as_ptr(),
        value: 5,
    };

    let call = compile_virtual_call(
        1,
        0,
        0,
        Some(PassInfo::signed(4)),
        vec![PassInfo::signed(4)],
        FunctionFlags::empty(),
    )
    .unwrap();
    let mut args = call.new_args();
    args.set_receiver(&mut counter as *mut Counter as *const _);
    args.write(0, 10i32);
    let mut ret = [0u8; 4];
    unsafe { call.execute(&mut args, &mut ret) };
    assert_eq!(i32::from_ne_bytes(ret), 15);
    assert_eq!(counter.value, 15);
}

#[test]
/// A forward call into a hook hands the handler the arguments and the caller the result
fn test_hook_round_trip() {
    init_tracing();
    let seen = Arc::new(AtomicUsize::new(0));
    let hook = compile_hook(
        add_signature(),
        {
            let seen = seen.clone();
            move |invocation: &mut HookInvocation<'_>| {
                assert_eq!(invocation.params().read::<i32>(0), 2);
                assert_eq!(invocation.params().read::<i32>(1), 3);
                seen.fetch_add(1, Ordering::SeqCst);
                HookAction::Ignored
            }
        },
        add as usize,
    )
    .unwrap();

    let call = Compiler::host()
        .unwrap()
        .compile_signature_call(add_signature(), hook.address())
        .unwrap();
    let mut args = call.new_args();
    args.write(0, 2i32);
    args.write(1, 3i32);
    let mut ret = [0u8; 4];
    unsafe { call.execute(&mut args, &mut ret) };

    assert_eq!(i32::from_ne_bytes(ret), 5);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
/// Handlers can rewrite parameters and replace results
fn test_hook_edits() {
    init_tracing();
    let doubled = compile_hook(
        add_signature(),
        |invocation: &mut HookInvocation<'_>| {
            let b: i32 = invocation.params().read(1);
            invocation.params_mut().write(1, b * 2);
            HookAction::Ignored
        },
        add as usize,
    )
    .unwrap();
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(doubled.entry()) };
    assert_eq!(f(2, 3), 8);

    let replaced = compile_hook(
        add_signature(),
        |invocation: &mut HookInvocation<'_>| {
            invocation.set_ret(-1i32);
            HookAction::Supercede
        },
        add as usize,
    )
    .unwrap();
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(replaced.entry()) };
    assert_eq!(f(2, 3), -1);
}

#[test]
/// Hooks returning structures by value
fn test_hook_struct_return() {
    init_tracing();
    let signature = Signature::new(
        CallConvention::Cdecl,
        Some(PassInfo::aggregate(12, [FieldKind::Int32; 3])),
        vec![PassInfo::signed(4)],
        FunctionFlags::empty(),
    );
    let hook = compile_hook(
        signature,
        |invocation: &mut HookInvocation<'_>| {
            invocation.recall();
            let mut made: [i32; 3] = invocation.ret_value();
            made[2] = 100;
            invocation.set_ret(made);
            HookAction::Supercede
        },
        make as usize,
    )
    .unwrap();

    let f: extern "C" fn(i32) -> Triple = unsafe { std::mem::transmute(hook.entry()) };
    assert_eq!(f(1), Triple { a: 1, b: 2, c: 100 });
}

#[test]
/// By-reference edits made in a handler reach the caller's storage
fn test_hook_by_ref_write_back() {
    init_tracing();
    let signature = Signature::new(
        CallConvention::Cdecl,
        None,
        vec![PassInfo::signed(4).by_ref()],
        FunctionFlags::empty(),
    );
    let hook = compile_hook(
        signature,
        |invocation: &mut HookInvocation<'_>| {
            invocation.recall();
            let value: i32 = invocation.params().read(0);
            invocation.params_mut().write(0, value * 10);
            HookAction::Supercede
        },
        bump as usize,
    )
    .unwrap();

    let f: extern "C" fn(*mut i32) = unsafe { std::mem::transmute(hook.entry()) };
    let mut value = 4;
    f(&mut value);
    assert_eq!(value, 50);
}

static ORIGINAL_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn counted(a: i32, b: i32) -> i32 {
    ORIGINAL_CALLS.fetch_add(1, Ordering::SeqCst);
    a - b
}

#[test]
/// The original runs once per call however the handler asks for it
fn test_recall_exactly_once() {
    init_tracing();
    let run = |handler: fn(&mut HookInvocation<'_>) -> HookAction| {
        let hook = compile_hook(add_signature(), handler, counted as usize).unwrap();
        let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(hook.entry()) };
        ORIGINAL_CALLS.store(0, Ordering::SeqCst);
        let result = f(9, 4);
        (result, ORIGINAL_CALLS.load(Ordering::SeqCst))
    };

    // explicit recall, then ignored
    assert_eq!(
        run(|invocation| {
            invocation.recall();
            assert!(invocation.is_superseded());
            HookAction::Ignored
        }),
        (5, 1)
    );
    // implicit recall
    assert_eq!(run(|_| HookAction::Ignored), (5, 1));
    // no recall at all
    assert_eq!(run(|_| HookAction::Supercede), (0, 0));
}

#[test]
/// Recall from outside a dispatch copies parameters back
fn test_perform_recall() {
    init_tracing();
    let signature = Signature::new(
        CallConvention::Cdecl,
        None,
        vec![PassInfo::signed(4).by_ref()],
        FunctionFlags::empty(),
    );
    let hook = compile_hook(signature, |_: &mut HookInvocation<'_>| HookAction::Ignored, bump as usize).unwrap();

    let mut params = hook.original().new_args();
    params.write(0, 1i32);
    unsafe { hook.perform_recall(std::ptr::null_mut(), &mut params, &mut [0u8; 0]) };
    assert_eq!(params.read::<i32>(0), 2);
}

#[test]
/// Hooked table slots route virtual calls through the handler until the intercept drops
fn test_vtable_intercept() {
    init_tracing();
    let mut vtable = vec![counter_get as usize, counter_add as usize];
    let mut counter = Counter {
        vtable: vtable.as_ptr(),
        value: 1,
    };
    let signature = Signature::new(
        CallConvention::ThisCall,
        Some(PassInfo::signed(4)),
        vec![PassInfo::signed(4)],
        FunctionFlags::empty(),
    );
    let compiler = Compiler::host().unwrap();
    let call = compiler
        .compile_virtual_call(1, 0, 0, Some(PassInfo::signed(4)), vec![PassInfo::signed(4)], FunctionFlags::empty())
        .unwrap();
    let invoke = |counter: &mut Counter, by: i32| {
        let mut args = call.new_args();
        args.set_receiver(counter as *mut Counter as *const _);
        args.write(0, by);
        let mut ret = [0u8; 4];
        unsafe { call.execute(&mut args, &mut ret) };
        i32::from_ne_bytes(ret)
    };

    let slot = &mut vtable[1] as *mut usize;
    let (hook, original) = unsafe {
        compiler.hook_vtable_slot(signature, slot, |invocation: &mut HookInvocation<'_>| {
            assert!(!invocation.receiver().is_null());
            let by: i32 = invocation.params().read(0);
            invocation.params_mut().write(0, by * 100);
            HookAction::Ignored
        })
    }
    .unwrap();
    assert_eq!(original, counter_add as usize);

    {
        let _intercept = unsafe { hook.install_vtable(slot) }.unwrap();
        assert_eq!(invoke(&mut counter, 2), 201);
    }
    assert_eq!(invoke(&mut counter, 2), 203);
    assert_eq!(vtable[1], counter_add as usize);
}
