// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! Callable methods: either a native Rust function or a
//! compiled bytecode [`Chunk`](crate::bytecode::Chunk).

use core::cell::Cell;

use crate::bytecode::Chunk;
use crate::gc::Mutator;
use crate::heap::{GcRef, HeapData};
use crate::thread::Thread;
use crate::value::Value;

/// A host-provided function. Takes the running thread (for stack access)
/// and the argument count pushed onto it; returns the number of result
/// values pushed, or a soft error.
pub type NativeFn = fn(&mut Thread<'_>, u8) -> Result<u8, crate::error::RuntimeError>;

pub enum MethodBody {
    Native(NativeFn),
    Bytecode(Chunk),
}

/// Payload for a `Method` heap object.
pub struct MethodData {
    pub name: Cell<Value>,
    /// Human-readable origin (file/line or similar), carried for both
    /// native and bytecode methods. `Value::Null` until a loader sets it; the
    /// core never inspects its contents.
    pub source: Cell<Value>,
    pub body: MethodBody,
}

impl MethodData {
    pub(crate) fn trace(&self, mut visit: impl FnMut(Value)) {
        if !self.name.get().is_null() {
            visit(self.name.get());
        }
        if !self.source.get().is_null() {
            visit(self.source.get());
        }
        if let MethodBody::Bytecode(chunk) = &self.body {
            for lit in &chunk.literals {
                if lit.as_gcref().is_some() {
                    visit(*lit);
                }
            }
        }
    }
}

fn with_method<R>(r: GcRef, f: impl FnOnce(&MethodData) -> R) -> R {
    // SAFETY: `r` is only ever constructed for `HeapData::Method` payloads.
    unsafe {
        match &r.as_ref().data {
            HeapData::Method(m) => f(m),
            _ => unreachable!("expected method"),
        }
    }
}

#[must_use]
pub fn new_native(m: &Mutator<'_>, name: Value, f: NativeFn) -> Value {
    let data = MethodData {
        name: Cell::new(name),
        source: Cell::new(Value::Null),
        body: MethodBody::Native(f),
    };
    let r = m.allocate(HeapData::Method(data));
    m.barrier(r, name);
    Value::Method(r)
}

#[must_use]
pub fn new_bytecode(m: &Mutator<'_>, name: Value, chunk: Chunk) -> Value {
    let data = MethodData {
        name: Cell::new(name),
        source: Cell::new(Value::Null),
        body: MethodBody::Bytecode(chunk),
    };
    let r = m.allocate(HeapData::Method(data));
    m.barrier(r, name);
    Value::Method(r)
}

#[must_use]
pub fn name(r: GcRef) -> Value {
    with_method(r, |m| m.name.get())
}

#[must_use]
pub fn source(r: GcRef) -> Value {
    with_method(r, |m| m.source.get())
}

pub fn set_source(m: &Mutator<'_>, r: GcRef, v: Value) {
    with_method(r, |md| md.source.set(v));
    m.barrier(r, v);
}

#[must_use]
pub fn nparams(r: GcRef) -> u8 {
    with_method(r, |m| match &m.body {
        MethodBody::Native(_) => 0,
        MethodBody::Bytecode(c) => c.nparams,
    })
}

#[must_use]
pub fn is_vararg(r: GcRef) -> bool {
    with_method(r, |m| match &m.body {
        MethodBody::Native(_) => true,
        MethodBody::Bytecode(c) => c.is_vararg,
    })
}

pub(crate) fn with_body<R>(r: GcRef, f: impl FnOnce(&MethodBody) -> R) -> R {
    with_method(r, |m| f(&m.body))
}

#[cfg(test)]
mod method_test {
    use super::*;
    use crate::gc::{GcParams, GcState, Mutator};
    use crate::heap::Heap;
    use crate::symbol::{SymbolData, Symtab};

    /// A `Symbol` payload is the cheapest valid GC root for a unit test
    /// that never runs a collection cycle.
    fn fixture() -> (Heap, GcState, Symtab, GcRef) {
        let heap = Heap::new();
        let gc = GcState::new(GcParams::default());
        let symtab = Symtab::new(1);
        let root = heap.allocate(HeapData::Symbol(SymbolData {
            hash: 0,
            bytes: Vec::new().into_boxed_slice(),
            next: Cell::new(None),
        }));
        (heap, gc, symtab, root)
    }

    #[test]
    fn source_defaults_to_null_and_round_trips() {
        let (heap, gc, symtab, root) = fixture();
        let m = Mutator::new(&heap, &gc, &symtab, root);

        let method = new_native(&m, Value::Null, |_t, _n| Ok(0));
        let Value::Method(r) = method else { unreachable!() };
        assert_eq!(source(r), Value::Null);

        let descriptor = Value::Int(7);
        set_source(&m, r, descriptor);
        assert_eq!(source(r), descriptor);
    }
}
