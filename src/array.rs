// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! Dynamic arrays and the closure encoding: an array object flagged as
//! closure pairs a getter and setter callable with its upvalues.

use core::cell::{Cell, RefCell};

use crate::gc::Mutator;
use crate::heap::{GcRef, HeapData};
use crate::value::Value;

/// Payload for an `Array` heap object. Also backs `Closure` values: when
/// `is_closure` is set, slot 0 is the getter callable, slot 1 the setter
/// callable, and slots 2.. are upvalues.
pub struct ArrayData {
    pub type_val: Cell<Value>,
    pub(crate) is_closure: Cell<bool>,
    pub items: RefCell<Vec<Value>>,
}

impl ArrayData {
    fn new() -> Self {
        Self {
            type_val: Cell::new(Value::Null),
            is_closure: Cell::new(false),
            items: RefCell::new(Vec::new()),
        }
    }
}

fn with_array<R>(r: GcRef, f: impl FnOnce(&ArrayData) -> R) -> R {
    // SAFETY: `r` is only ever constructed for `HeapData::Array` payloads.
    unsafe {
        match &r.as_ref().data {
            HeapData::Array(a) => f(a),
            _ => unreachable!("expected array"),
        }
    }
}

/// Allocate a fresh, empty array with `capacity` pre-reserved.
pub fn new_array(m: &Mutator<'_>, capacity: usize) -> Value {
    let data = ArrayData::new();
    data.items.borrow_mut().reserve(capacity);
    let r = m.allocate(HeapData::Array(data));
    Value::Array(r)
}

/// Build a closure: slot 0 getter, slot 1 setter, slots 2.. upvalues.
pub fn new_closure(m: &Mutator<'_>, getter: Value, setter: Value, upvalues: &[Value]) -> Value {
    let data = ArrayData::new();
    data.is_closure.set(true);
    {
        let mut items = data.items.borrow_mut();
        items.push(getter);
        items.push(setter);
        items.extend_from_slice(upvalues);
    }
    let r = m.allocate(HeapData::Array(data));
    Value::Array(r)
}

#[must_use]
pub fn is_closure(r: GcRef) -> bool {
    with_array(r, |a| a.is_closure.get())
}

#[must_use]
pub fn get_type_val(r: GcRef) -> Value {
    with_array(r, |a| a.type_val.get())
}

pub fn set_type_val(m: &Mutator<'_>, r: GcRef, v: Value) {
    with_array(r, |a| a.type_val.set(v));
    m.barrier(r, v);
}

#[must_use]
pub fn closure_getter(r: GcRef) -> Value {
    with_array(r, |a| a.items.borrow()[0])
}

#[must_use]
pub fn closure_setter(r: GcRef) -> Value {
    with_array(r, |a| a.items.borrow()[1])
}

#[must_use]
pub fn closure_upvalue(r: GcRef, i: usize) -> Option<Value> {
    with_array(r, |a| a.items.borrow().get(2 + i).copied())
}

pub fn closure_set_upvalue(m: &Mutator<'_>, r: GcRef, i: usize, v: Value) {
    with_array(r, |a| {
        let mut items = a.items.borrow_mut();
        if 2 + i < items.len() {
            items[2 + i] = v;
        }
    });
    m.barrier(r, v);
}

#[must_use]
pub fn len(r: GcRef) -> usize {
    with_array(r, |a| a.items.borrow().len())
}

#[must_use]
pub fn get(r: GcRef, idx: usize) -> Value {
    with_array(r, |a| {
        a.items.borrow().get(idx).copied().unwrap_or(Value::Null)
    })
}

/// `set`: grows the array if needed, filling any gap with `null`.
pub fn set(m: &Mutator<'_>, r: GcRef, idx: usize, v: Value) {
    with_array(r, |a| {
        let mut items = a.items.borrow_mut();
        if idx >= items.len() {
            items.resize(idx + 1, Value::Null);
        }
        items[idx] = v;
    });
    m.barrier(r, v);
}

pub fn append(m: &Mutator<'_>, r: GcRef, v: Value) {
    with_array(r, |a| a.items.borrow_mut().push(v));
    m.barrier(r, v);
}

/// `repeat(pos, n, v)`: overwrite `n` slots starting at `pos` with `v`,
/// growing as needed.
pub fn repeat(m: &Mutator<'_>, r: GcRef, pos: usize, n: usize, v: Value) {
    with_array(r, |a| {
        let mut items = a.items.borrow_mut();
        let end = pos + n;
        if end > items.len() {
            items.resize(end, Value::Null);
        }
        for slot in &mut items[pos..end] {
            *slot = v;
        }
    });
    m.barrier(r, v);
}

/// `delete(pos, n)`: compacting remove of `n` elements starting at `pos`.
pub fn delete(r: GcRef, pos: usize, n: usize) {
    with_array(r, |a| {
        let mut items = a.items.borrow_mut();
        let end = (pos + n).min(items.len());
        if pos < end {
            items.drain(pos..end);
        }
    });
}

/// `insert(pos, n, v)`: open a gap of `n` slots at `pos`, filled with `v`.
pub fn insert(m: &Mutator<'_>, r: GcRef, pos: usize, n: usize, v: Value) {
    with_array(r, |a| {
        let mut items = a.items.borrow_mut();
        let pos = pos.min(items.len());
        let gap = core::iter::repeat(v).take(n);
        items.splice(pos..pos, gap);
    });
    m.barrier(r, v);
}

/// `splice(dst, pos, n, src, srcpos, m)`: replace `n` elements of `dst`
/// starting at `pos` with `m` elements of `src` starting at `srcpos`. Safe
/// when `src == dst` (copies the source slice out first).
pub fn splice(
    mutator: &Mutator<'_>,
    dst: GcRef,
    pos: usize,
    n: usize,
    src: GcRef,
    srcpos: usize,
    count: usize,
) {
    let source: Vec<Value> = with_array(src, |a| {
        let items = a.items.borrow();
        let end = (srcpos + count).min(items.len());
        if srcpos >= end {
            Vec::new()
        } else {
            items[srcpos..end].to_vec()
        }
    });
    with_array(dst, |a| {
        let mut items = a.items.borrow_mut();
        let pos = pos.min(items.len());
        let end = (pos + n).min(items.len());
        items.splice(pos..end, source.iter().copied());
    });
    for v in source {
        mutator.barrier(dst, v);
    }
}
