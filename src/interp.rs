// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! The bytecode dispatch loop and call protocol.
//!
//! Calling convention: a frame's registers are a contiguous window on its
//! thread's data stack, `base..end`. Arguments are placed starting at
//! `base` by the caller before the frame is pushed; any arguments past
//! the callee's declared parameter count become its variadic tail
//! (`vararg_base..vararg_base+vararg_count`), readable only via
//! `LoadVararg`.

use tracing::trace;

use crate::array;
use crate::bytecode::{Instr, Op, JUMP_BIAS};
use crate::error::{RuntimeError, VmFault};
use crate::frame::CallFrame;
use crate::method::{self, MethodBody};
use crate::thread::{self, Thread};
use crate::value::Value;
use crate::vm;

/// Push `args`, invoke `callee`, run to completion, and return whatever
/// results the callee produced.
pub fn call_values(
    thread: &mut Thread<'_>,
    callee: Value,
    args: &[Value],
) -> Result<Vec<Value>, VmFault> {
    let t = thread.thread_ref;
    let base = thread::stack_len(t);
    for &a in args {
        thread.push(a)?;
    }
    let depth_before = frame_depth_of(t);
    invoke(thread, callee, base, args.len() as u8, None, base)?;
    run_until(thread, depth_before)?;
    let results: Vec<Value> = (base..thread::stack_len(t))
        .map(|i| thread::get_slot(t, i))
        .collect();
    thread::truncate(t, base);
    Ok(results)
}

fn frame_depth_of(t: crate::heap::GcRef) -> usize {
    thread::frame_depth(t)
}

/// Dispatch `callee`, either running it to immediate completion (native)
/// or pushing a new bytecode frame, placing results starting at
/// `result_base`.
///
/// If `callee` is a symbol, it is first resolved against the call's
/// receiver (`R[base]`, the conventional `self`) via `getProperty`.
fn invoke(
    thread: &mut Thread<'_>,
    callee: Value,
    base: usize,
    nargs: u8,
    nresults: Option<u8>,
    result_base: usize,
) -> Result<(), VmFault> {
    let t = thread.thread_ref;
    let callee = if callee.is_symbol() {
        let self_val = if nargs > 0 {
            thread::get_slot(t, base)
        } else {
            Value::Null
        };
        vm::get_property(thread.root, self_val, callee)
    } else {
        callee
    };

    let closure_self = if let Value::Array(r) = callee {
        if array::is_closure(r) { Some(r) } else { None }
    } else {
        None
    };

    let method_ref = match callee {
        Value::Method(r) => r,
        Value::Array(r) if array::is_closure(r) => {
            // A setter call carries its new value as the lone argument;
            // a getter call carries none.
            let callable = if nargs > 0 {
                array::closure_setter(r)
            } else {
                array::closure_getter(r)
            };
            let Value::Method(m) = callable else {
                resolve_not_callable(thread, result_base, nresults);
                return Ok(());
            };
            m
        }
        _ => {
            resolve_not_callable(thread, result_base, nresults);
            return Ok(());
        }
    };

    let native_fn = method::with_body(method_ref, |b| match b {
        MethodBody::Native(f) => Some(*f),
        MethodBody::Bytecode(_) => None,
    });

    if let Some(f) = native_fn {
        let saved_base = thread::native_base(t);
        let saved_self = thread::native_self(t);
        thread::set_native_base(t, base);
        if let Some(r) = closure_self {
            thread::set_native_self(t, Value::Array(r));
        }
        let produced = f(thread, nargs).unwrap_or_else(|e| {
            let _ = Thread::recover(e);
            0
        });
        thread::set_native_base(t, saved_base);
        thread::set_native_self(t, saved_self);
        place_results(t, base, produced, result_base, nresults);
        return Ok(());
    }

    let (nparams, is_vararg, max_stack) = method::with_body(method_ref, |b| match b {
        MethodBody::Bytecode(c) => (c.nparams, c.is_vararg, c.max_stack),
        MethodBody::Native(_) => unreachable!(),
    });
    let fixed_end = base + nparams as usize;
    let (vararg_base, vararg_count) = if is_vararg && nargs as usize > nparams as usize {
        (base + nparams as usize, nargs as usize - nparams as usize)
    } else {
        (fixed_end, 0)
    };
    // Pad missing fixed params with null; if vararg args exist, the
    // register window still starts right after the fixed params — the
    // vararg tail stays reachable only via `LoadVararg`.
    if (nargs as usize) < nparams as usize {
        thread::reserve(t, nparams as usize - nargs as usize);
    }
    let end = base + max_stack as usize;
    thread::reserve(t, end.saturating_sub(thread::stack_len(t)));
    thread::push_frame(
        t,
        CallFrame {
            base,
            end,
            vararg_base,
            vararg_count,
            ip: 0,
            callee: method_ref,
            nresults,
            result_base,
            is_tail: false,
        },
    );
    Ok(())
}

fn resolve_not_callable(thread: &mut Thread<'_>, result_base: usize, nresults: Option<u8>) {
    let _ = Thread::recover(RuntimeError::NotCallable);
    place_results(thread.thread_ref, result_base, 0, result_base, nresults);
}

/// Copy `produced` result values from `src_base` to `dst_base`, padding
/// with `null` up to `nresults` if the caller asked for a fixed count.
fn place_results(
    t: crate::heap::GcRef,
    src_base: usize,
    produced: u8,
    dst_base: usize,
    nresults: Option<u8>,
) {
    let want = nresults.map_or(produced, |n| n);
    for i in 0..want {
        let v = if i < produced {
            thread::get_slot(t, src_base + i as usize)
        } else {
            Value::Null
        };
        thread::set_slot(t, dst_base + i as usize, v);
    }
    thread::truncate(t, dst_base + want as usize);
}

/// Run the interpreter loop until the thread's frame stack returns to
/// `stop_depth` (i.e. the frame that called in has returned).
fn run_until(thread: &mut Thread<'_>, stop_depth: usize) -> Result<(), VmFault> {
    while frame_depth_of(thread.thread_ref) > stop_depth {
        step(thread)?;
    }
    Ok(())
}

fn step(thread: &mut Thread<'_>) -> Result<(), VmFault> {
    let t = thread.thread_ref;
    let Some(mut frame) = thread::top_frame(t) else {
        return Ok(());
    };
    let chunk_ptr = frame.callee;
    let instr = method::with_body(chunk_ptr, |b| match b {
        MethodBody::Bytecode(c) => c.decode_at(frame.ip),
        MethodBody::Native(_) => unreachable!(),
    });
    let instr = match instr {
        Ok(i) => i,
        Err(_) => {
            // Corrupt bytecode in the callee is a soft error: unwind this
            // frame with no results.
            thread::pop_frame(t);
            place_results(t, frame.base, 0, frame.result_base, frame.nresults);
            return Ok(());
        }
    };
    trace!(target: "embera::interp", ip = frame.ip, "step");
    frame.ip += 1;

    match instr {
        Instr::Abc { op, a, b, c } => exec_abc(thread, &mut frame, op, a, b, c)?,
        Instr::Ad { op, a, d } => exec_ad(thread, &mut frame, op, a, d)?,
    }
    Ok(())
}

/// `LoadLit`/`LoadLitX` clone string literals on every load so running
/// methods can mutate their local copy without corrupting the literal
/// pool shared by every future call. Symbols are
/// interned and immutable, so they load by value unchanged.
fn clone_if_string(thread: &Thread<'_>, v: Value) -> Value {
    match v {
        Value::Str(r) => {
            let bytes = crate::strbuf::as_bytes(r);
            crate::strbuf::new_string(&thread.mutator, &bytes)
        }
        other => other,
    }
}

fn literal_at(chunk: crate::heap::GcRef, idx: usize) -> Value {
    method::with_body(chunk, |b| match b {
        MethodBody::Bytecode(c) => c.literals.get(idx).copied().unwrap_or(Value::Null),
        MethodBody::Native(_) => unreachable!(),
    })
}

fn exec_ad(
    thread: &mut Thread<'_>,
    frame: &mut CallFrame,
    op: Op,
    a: u8,
    d: u16,
) -> Result<(), VmFault> {
    let t = thread.thread_ref;
    match op {
        Op::LoadLit => {
            let lit = clone_if_string(thread, literal_at(frame.callee, d as usize));
            thread::set_slot(t, frame.base + a as usize, lit);
        }
        Op::LoadLitX => {
            let idx = method::with_body(frame.callee, |b| match b {
                MethodBody::Bytecode(c) => c.instrs.get(frame.ip).copied().unwrap_or(0) as usize,
                MethodBody::Native(_) => unreachable!(),
            });
            frame.ip += 1;
            let lit = clone_if_string(thread, literal_at(frame.callee, idx));
            thread::set_slot(t, frame.base + a as usize, lit);
        }
        Op::LoadPrim => {
            let v = match d {
                0 => Value::Null,
                1 => Value::Bool(false),
                _ => Value::Bool(true),
            };
            thread::set_slot(t, frame.base + a as usize, v);
        }
        Op::GetGlobal => {
            let key = literal_at(frame.callee, d as usize);
            let globals = thread::globals(t);
            let Value::Table(g) = globals else {
                unreachable!("globals is always a Table value");
            };
            let v = crate::table::get(g, key);
            thread::set_slot(t, frame.base + a as usize, v);
        }
        Op::SetGlobal => {
            let key = literal_at(frame.callee, d as usize);
            let v = thread::get_slot(t, frame.base + a as usize);
            let globals = thread::globals(t);
            let Value::Table(g) = globals else {
                unreachable!("globals is always a Table value");
            };
            crate::table::set(&thread.mutator, g, key, v);
        }
        Op::Jump => {
            let delta = d as i32 - JUMP_BIAS;
            frame.ip = (frame.ip as i32 + delta) as usize;
        }
        Op::JNull | Op::JNotNull | Op::JTrue | Op::JFalse => {
            let v = thread::get_slot(t, frame.base + a as usize);
            let takes_branch = match op {
                Op::JNull => v.is_null(),
                Op::JNotNull => !v.is_null(),
                Op::JTrue => v.is_truthy(),
                Op::JFalse => !v.is_truthy(),
                _ => unreachable!(),
            };
            if takes_branch {
                let delta = d as i32 - JUMP_BIAS;
                frame.ip = (frame.ip as i32 + delta) as usize;
            }
        }
        Op::JEq | Op::JNe | Op::JLt | Op::JLe | Op::JGt | Op::JGe => {
            let v = thread::get_slot(t, frame.base + a as usize);
            let skip = match (op, v) {
                (Op::JEq, Value::Int(n)) => n == 0,
                (Op::JEq, _) => false,
                (Op::JNe, Value::Int(n)) => n != 0,
                (Op::JNe, _) => true,
                (Op::JLt, Value::Int(n)) => n < 0,
                (Op::JLe, Value::Int(n)) => n <= 0,
                (Op::JGt, Value::Int(n)) => n > 0,
                (Op::JGe, Value::Int(n)) => n >= 0,
                (Op::JLt | Op::JLe | Op::JGt | Op::JGe, _) => false,
                _ => unreachable!(),
            };
            if skip {
                frame.ip += 1;
            }
        }
        _ => {
            // Unreachable given `step`'s `is_ad` routing: an opcode decoded
            // into the wrong instruction format. Corrupt bytecode is a soft
            // error, not an allocation failure — unwind this frame with no
            // results, same as a decode failure.
            let _ = Thread::recover(RuntimeError::CorruptBytecode(op as u8));
            thread::pop_frame(t);
            place_results(t, frame.base, 0, frame.result_base, frame.nresults);
            return Ok(());
        }
    }
    thread::set_top_frame(t, *frame);
    Ok(())
}

fn exec_abc(
    thread: &mut Thread<'_>,
    frame: &mut CallFrame,
    op: Op,
    a: u8,
    b: u8,
    c: u8,
) -> Result<(), VmFault> {
    let t = thread.thread_ref;
    match op {
        Op::LoadReg => {
            let v = thread::get_slot(t, frame.base + b as usize);
            thread::set_slot(t, frame.base + a as usize, v);
        }
        Op::LoadRegs => {
            for i in 0..c {
                let v = thread::get_slot(t, frame.base + b as usize + i as usize);
                thread::set_slot(t, frame.base + a as usize + i as usize, v);
            }
        }
        Op::LoadNulls => {
            for i in 0..b {
                thread::set_slot(t, frame.base + a as usize + i as usize, Value::Null);
            }
        }
        Op::LoadVararg => {
            let count = if b == 0xFF { frame.vararg_count } else { b as usize };
            for i in 0..count {
                let v = if i < frame.vararg_count {
                    thread::get_slot(t, frame.vararg_base + i)
                } else {
                    Value::Null
                };
                thread::set_slot(t, frame.base + a as usize + i, v);
            }
        }
        Op::JSame | Op::JDiff => {
            let lhs = thread::get_slot(t, frame.base + a as usize);
            let rhs = thread::get_slot(t, frame.base + b as usize);
            let same = lhs == rhs;
            let skip = if op == Op::JSame { same } else { !same };
            let _ = c;
            if skip {
                frame.ip += 1;
            }
        }
        Op::LoadStd => {
            let self_val = thread::get_slot(t, frame.base + b as usize);
            thread::set_slot(t, frame.base + a as usize + 1, self_val);
            let sym = vm::std_symbol(thread.root, c);
            thread::set_slot(t, frame.base + a as usize, sym);
        }
        Op::Call | Op::TailCall => {
            let callee = thread::get_slot(t, frame.base + a as usize);
            let nargs = if b == 0xFF {
                (thread::stack_len(t) - (frame.base + a as usize + 1)) as u8
            } else {
                b
            };
            let call_base = frame.base + a as usize + 1;
            let requested = if c == 0xFF { None } else { Some(c) };
            thread::set_top_frame(t, *frame);
            if op == Op::TailCall {
                let saved = *frame;
                // Rewrite the frame in place: move the
                // callee's self/args window down onto the outgoing frame's
                // own base so repeated tail calls reuse one fixed stack
                // window instead of climbing further with every level —
                // otherwise only the frame *count* would stay flat while
                // the underlying data stack still grew per call, defeating
                // the "constant stack depth" guarantee tail calls exist for.
                let new_base = saved.base;
                for i in 0..nargs as usize {
                    let v = thread::get_slot(t, call_base + i);
                    thread::set_slot(t, new_base + i, v);
                }
                thread::truncate(t, new_base + nargs as usize);
                thread::pop_frame(t);
                invoke(thread, callee, new_base, nargs, saved.nresults, saved.result_base)?;
                if let Some(mut f) = thread::top_frame(t) {
                    f.is_tail = true;
                    thread::set_top_frame(t, f);
                }
                return Ok(());
            }
            let result_base = frame.base + a as usize;
            invoke(thread, callee, call_base, nargs, requested, result_base)?;
        }
        Op::Return => {
            let nvals = if b == 0xFF {
                (thread::stack_len(t) - (frame.base + a as usize)) as u8
            } else {
                b
            };
            let src = frame.base + a as usize;
            thread::pop_frame(t);
            place_results(t, src, nvals, frame.result_base, frame.nresults);
            return Ok(());
        }
        Op::ForPrep | Op::RptPrep => {
            let self_val = thread::get_slot(t, frame.base + b as usize);
            thread::set_slot(t, frame.base + a as usize + 1, self_val);
            let sym = vm::std_symbol(thread.root, c);
            let method = vm::get_property(thread.root, self_val, sym);
            thread::set_slot(t, frame.base + a as usize, method);
            if op == Op::ForPrep {
                thread::set_slot(t, frame.base + a as usize + 2, Value::Int(0));
            }
        }
        _ => {
            // Unreachable given `step`'s `is_ad` routing: an opcode decoded
            // into the wrong instruction format. Corrupt bytecode is a soft
            // error, not an allocation failure — unwind this frame with no
            // results, same as a decode failure.
            let _ = Thread::recover(RuntimeError::CorruptBytecode(op as u8));
            thread::pop_frame(t);
            place_results(t, frame.base, 0, frame.result_base, frame.nresults);
            return Ok(());
        }
    }
    thread::set_top_frame(t, *frame);
    Ok(())
}
