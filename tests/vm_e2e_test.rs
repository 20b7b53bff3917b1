// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! End-to-end seed scenarios: each test
//! hand-assembles a small [`Chunk`] and drives it through [`Vm::call`],
//! exercising the interpreter the way a compiler's emitted output would.

use embera::array;
use embera::bytecode::{encode_abc, encode_ad, encode_jump, Chunk, Op};
use embera::error::RuntimeError;
use embera::thread::Thread;
use embera::{Value, Vm};

fn native_cmp1(thread: &mut Thread<'_>, _nargs: u8) -> Result<u8, RuntimeError> {
    let n = match thread.native_arg(0) {
        Value::Int(x) => x,
        _ => 0,
    };
    thread.set_native_result(0, Value::Int((n - 1).signum()));
    Ok(1)
}

fn native_sub_one(thread: &mut Thread<'_>, _nargs: u8) -> Result<u8, RuntimeError> {
    let n = match thread.native_arg(0) {
        Value::Int(x) => x,
        _ => 0,
    };
    thread.set_native_result(0, Value::Int(n - 1));
    Ok(1)
}

fn native_sign(thread: &mut Thread<'_>, _nargs: u8) -> Result<u8, RuntimeError> {
    let n = match thread.native_arg(0) {
        Value::Int(x) => x,
        _ => 0,
    };
    thread.set_native_result(0, Value::Int(n.signum()));
    Ok(1)
}

thread_local! {
    /// High-water mark of the thread's data stack length, sampled from
    /// inside the recursion itself so the regression test below can tell
    /// a bounded tail-call window from an unbounded one even though the
    /// stack has already unwound by the time `vm.call` returns.
    static MAX_STACK_SEEN: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

fn native_sub_one_and_sample_depth(thread: &mut Thread<'_>, _nargs: u8) -> Result<u8, RuntimeError> {
    let depth = embera::thread::stack_len(thread.thread_ref);
    MAX_STACK_SEEN.with(|cell| cell.set(cell.get().max(depth)));
    let n = match thread.native_arg(0) {
        Value::Int(x) => x,
        _ => 0,
    };
    thread.set_native_result(0, Value::Int(n - 1));
    Ok(1)
}

fn native_mul(thread: &mut Thread<'_>, _nargs: u8) -> Result<u8, RuntimeError> {
    let a = match thread.native_arg(0) {
        Value::Int(x) => x,
        _ => 0,
    };
    let b = match thread.native_arg(1) {
        Value::Int(x) => x,
        _ => 0,
    };
    thread.set_native_result(0, Value::Int(a * b));
    Ok(1)
}

#[test]
fn literal_load_and_return() {
    let vm = Vm::new();
    let chunk = Chunk {
        instrs: vec![
            encode_ad(Op::LoadLit, 0, 0),
            encode_abc(Op::Return, 0, 1, 0),
        ],
        literals: vec![Value::Float(3.14)],
        local_names: vec![],
        nparams: 0,
        is_vararg: false,
        max_stack: 1,
    };
    let name = vm.intern("pi");
    let method = vm.new_bytecode_method(name, chunk);
    let results = vm.call(method, &[]).expect("call must not fault");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0], Value::Float(3.14));
}

#[test]
fn vararg_echo() {
    let vm = Vm::new();
    // R0 = self (fixed param), LoadVararg spreads the rest starting at R1,
    // Return copies the full window (self + two varargs) back out.
    let chunk = Chunk {
        instrs: vec![
            encode_abc(Op::LoadVararg, 1, 0xFF, 0),
            encode_abc(Op::Return, 0, 3, 0),
        ],
        literals: vec![],
        local_names: vec![],
        nparams: 1,
        is_vararg: true,
        max_stack: 3,
    };
    let name = vm.intern("echo");
    let method = vm.new_bytecode_method(name, chunk);
    let results = vm
        .call(method, &[Value::Int(10), Value::Int(20), Value::Int(30)])
        .expect("call must not fault");
    assert_eq!(results, vec![Value::Int(10), Value::Int(20), Value::Int(30)]);
}

#[test]
fn recursive_factorial_via_tail_call() {
    let vm = Vm::new();
    let fact_name = vm.intern("fact");
    let cmp1 = vm.new_native("cmp1", native_cmp1);
    let sub_one = vm.new_native("subOne", native_sub_one);
    let mul = vm.new_native("mul", native_mul);

    // R0 = n, R1 = acc (defaults to 1 on first call, since the tail calls
    // always pass it explicitly as a non-null Int).
    let instrs = vec![
        encode_jump(Op::JNotNull, 1, 1),       // 0: if acc not null, skip default
        encode_ad(Op::LoadLit, 1, 0),          // 1: acc := 1
        encode_abc(Op::LoadReg, 3, 0, 0),      // 2: R3 := n
        encode_ad(Op::LoadLit, 2, 2),          // 3: R2 := cmp1
        encode_abc(Op::Call, 2, 1, 1),         // 4: R2 := sign(n - 1)
        encode_ad(Op::JLe, 2, 0),              // 5: skip next if R2 <= 0
        encode_jump(Op::Jump, 0, 1),           // 6: -> L_recurse (idx 8)
        encode_abc(Op::Return, 1, 1, 0),       // 7: L_base: return acc
        encode_abc(Op::LoadReg, 3, 0, 0),      // 8: L_recurse: R3 := n
        encode_ad(Op::LoadLit, 2, 3),          // 9: R2 := subOne
        encode_abc(Op::Call, 2, 1, 1),         // 10: R2 := n - 1
        encode_abc(Op::LoadReg, 5, 2, 0),      // 11: R5 := n2
        encode_abc(Op::LoadReg, 3, 0, 0),      // 12: R3 := n
        encode_abc(Op::LoadReg, 4, 1, 0),      // 13: R4 := acc
        encode_ad(Op::LoadLit, 2, 4),          // 14: R2 := mul
        encode_abc(Op::Call, 2, 2, 1),         // 15: R2 := n * acc
        encode_abc(Op::LoadReg, 6, 2, 0),      // 16: R6 := acc2
        encode_abc(Op::LoadReg, 3, 5, 0),      // 17: R3 := n2
        encode_abc(Op::LoadReg, 4, 6, 0),      // 18: R4 := acc2
        encode_ad(Op::GetGlobal, 2, 1),        // 19: R2 := global fact
        encode_abc(Op::TailCall, 2, 2, 0),     // 20: tail-call fact(n2, acc2)
    ];
    let chunk = Chunk {
        instrs,
        literals: vec![
            Value::Int(1),
            fact_name,
            cmp1,
            sub_one,
            mul,
        ],
        local_names: vec![],
        nparams: 2,
        is_vararg: false,
        max_stack: 7,
    };
    let fact = vm.new_bytecode_method(fact_name, chunk);
    vm.set_global(fact_name, fact);

    let results = vm.call(fact, &[Value::Int(4)]).expect("call must not fault");
    assert_eq!(results, vec![Value::Int(24)]);

    let results = vm.call(fact, &[Value::Int(1)]).expect("call must not fault");
    assert_eq!(results, vec![Value::Int(1)]);
}

/// A tail-recursive `countdown(n)` driven thousands of levels deep must
/// keep the thread's underlying data stack bounded: the rewritten
/// `TailCall` frame reuses its own window instead of growing it on every
/// level.
#[test]
fn tail_call_recursion_keeps_the_data_stack_bounded() {
    MAX_STACK_SEEN.with(|cell| cell.set(0));

    let vm = Vm::new();
    let countdown_name = vm.intern("countdown");
    let sign = vm.new_native("sign", native_sign);
    let sub_one = vm.new_native("subOneSampled", native_sub_one_and_sample_depth);

    // R0 = n (sole param).
    let instrs = vec![
        encode_abc(Op::LoadReg, 3, 0, 0),  // 0: R3 := n
        encode_ad(Op::LoadLit, 2, 0),      // 1: R2 := sign
        encode_abc(Op::Call, 2, 1, 1),     // 2: R2 := sign(n)
        encode_ad(Op::JLe, 2, 0),          // 3: skip next if R2 <= 0
        encode_jump(Op::Jump, 0, 1),       // 4: -> L_recurse (idx 6)
        encode_abc(Op::Return, 0, 1, 0),   // 5: L_base: return n
        encode_ad(Op::LoadLit, 2, 1),      // 6: L_recurse: R2 := subOneSampled
        encode_abc(Op::LoadReg, 3, 0, 0),  // 7: R3 := n
        encode_abc(Op::Call, 2, 1, 1),     // 8: R2 := n - 1
        encode_abc(Op::LoadReg, 3, 2, 0),  // 9: R3 := n - 1 (into arg slot)
        encode_ad(Op::GetGlobal, 2, 2),    // 10: R2 := global countdown
        encode_abc(Op::TailCall, 2, 1, 0), // 11: tail-call countdown(n - 1)
    ];
    let chunk = Chunk {
        instrs,
        literals: vec![sign, sub_one, countdown_name],
        local_names: vec![],
        nparams: 1,
        is_vararg: false,
        max_stack: 4,
    };
    let countdown = vm.new_bytecode_method(countdown_name, chunk);
    vm.set_global(countdown_name, countdown);

    const DEPTH: i64 = 3_000;
    let results = vm
        .call(countdown, &[Value::Int(DEPTH)])
        .expect("call must not fault");
    assert_eq!(results, vec![Value::Int(0)]);

    let observed = MAX_STACK_SEEN.with(std::cell::Cell::get);
    assert!(
        observed < 64,
        "stack grew with recursion depth ({DEPTH} levels): observed length {observed}"
    );
}

fn native_counter_get(thread: &mut Thread<'_>, _nargs: u8) -> Result<u8, RuntimeError> {
    let Value::Array(r) = thread.self_value() else {
        return Ok(0);
    };
    let cur = match array::closure_upvalue(r, 0) {
        Some(Value::Int(n)) => n,
        _ => 0,
    };
    let next = cur + 1;
    array::closure_set_upvalue(&thread.mutator, r, 0, Value::Int(next));
    thread.set_native_result(0, Value::Int(next));
    Ok(1)
}

fn native_counter_set(thread: &mut Thread<'_>, _nargs: u8) -> Result<u8, RuntimeError> {
    let Value::Array(r) = thread.self_value() else {
        return Ok(0);
    };
    let v = thread.native_arg(0);
    array::closure_set_upvalue(&thread.mutator, r, 0, v);
    Ok(0)
}

#[test]
fn closure_round_trip() {
    let vm = Vm::new();
    let getter = vm.new_native("counterGet", native_counter_get);
    let setter = vm.new_native("counterSet", native_counter_set);
    let closure = vm.new_closure(getter, setter, &[Value::Int(41)]);

    let results = vm.call(closure, &[]).expect("getter must not fault");
    assert_eq!(results, vec![Value::Int(42)]);

    let results = vm
        .call(closure, &[Value::Int(100)])
        .expect("setter must not fault");
    assert!(results.is_empty());

    let results = vm.call(closure, &[]).expect("getter must not fault");
    assert_eq!(results, vec![Value::Int(101)]);
}

#[test]
fn table_identity_and_iteration() {
    let vm = Vm::new();
    let t = vm.new_table(4);
    let t_again = t;
    assert_eq!(t, t_again, "a table value is isSame to itself");
    assert_ne!(t, vm.new_table(4), "distinct tables are never isSame");

    let key_one = Value::Int(1);
    let key_sym = vm.intern("name");
    let key_bool = Value::Bool(true);

    vm.table_set(t, key_one, Value::Float(1.5));
    vm.table_set(t, key_sym, vm.new_string(b"embera"));
    vm.table_set(t, key_bool, Value::Int(7));
    assert_eq!(vm.table_len(t), 3);

    assert_eq!(vm.table_get(t, key_one), Value::Float(1.5));
    vm.table_delete(t, key_one);
    assert_eq!(vm.table_get(t, key_one), Value::Null);
    assert_eq!(vm.table_len(t), 2);

    let mut seen = Vec::new();
    let mut cursor = Value::Null;
    while let Some((k, v)) = vm.table_next(t, cursor) {
        seen.push((k, v));
        cursor = k;
    }
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().any(|(k, _)| *k == key_sym));
    assert!(seen.iter().any(|(k, _)| *k == key_bool));
}

#[test]
fn gc_correctness_under_stress() {
    let vm = Vm::new();
    let anchor = vm.intern("anchor");
    let kept = vm.new_array(4);
    vm.array_append(kept, Value::Int(999));
    vm.set_global(anchor, kept);

    for i in 0..5_000 {
        let _garbage = vm.new_array(8);
        let _garbage_str = vm.new_string(format!("garbage-{i}").as_bytes());
        if i % 200 == 0 {
            vm.gc_step();
        }
    }
    let before_full_collect = vm.object_count();
    vm.collect_garbage();
    let after_full_collect = vm.object_count();
    assert!(
        after_full_collect < before_full_collect,
        "a full collection must reclaim the unreachable garbage: {after_full_collect} >= {before_full_collect}"
    );

    let Value::Array(r) = vm.get_global(anchor) else {
        panic!("anchored array must survive collection");
    };
    assert_eq!(array::len(r), 1);
    assert_eq!(array::get(r, 0), Value::Int(999));

    vm.collect_garbage();
    let Value::Array(r) = vm.get_global(anchor) else {
        panic!("anchored array must survive a second collection");
    };
    assert_eq!(array::get(r, 0), Value::Int(999));
}
