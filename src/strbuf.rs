// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! Mutable string buffers. Unlike symbols, strings are
//! not interned and may be mutated in place; a trailing sentinel zero byte
//! is kept (not counted in `len`) so the buffer can be handed to C-style
//! callers in a host embedding without a copy.

use core::cell::{Cell, RefCell};

use crate::gc::Mutator;
use crate::heap::{GcRef, HeapData};
use crate::value::Value;

/// Payload for a `Str` heap object.
pub struct StringData {
    pub type_val: Cell<Value>,
    /// Visible bytes plus one trailing `0u8` sentinel.
    pub(crate) buf: RefCell<Vec<u8>>,
}

impl StringData {
    fn new(bytes: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(bytes.len() + 1);
        buf.extend_from_slice(bytes);
        buf.push(0);
        Self {
            type_val: Cell::new(Value::Null),
            buf: RefCell::new(buf),
        }
    }
}

fn with_string<R>(r: GcRef, f: impl FnOnce(&StringData) -> R) -> R {
    // SAFETY: `r` is only ever constructed for `HeapData::Str` payloads.
    unsafe {
        match &r.as_ref().data {
            HeapData::Str(s) => f(s),
            _ => unreachable!("expected string"),
        }
    }
}

#[must_use]
pub fn new_string(m: &Mutator<'_>, bytes: &[u8]) -> Value {
    let r = m.allocate(HeapData::Str(StringData::new(bytes)));
    Value::Str(r)
}

#[must_use]
pub fn len(r: GcRef) -> usize {
    with_string(r, |s| s.buf.borrow().len() - 1)
}

#[must_use]
pub fn get_type_val(r: GcRef) -> Value {
    with_string(r, |s| s.type_val.get())
}

pub fn set_type_val(m: &Mutator<'_>, r: GcRef, v: Value) {
    with_string(r, |s| s.type_val.set(v));
    m.barrier(r, v);
}

#[must_use]
pub fn as_bytes(r: GcRef) -> Vec<u8> {
    with_string(r, |s| {
        let buf = s.buf.borrow();
        buf[..buf.len() - 1].to_vec()
    })
}

/// Ensure at least `extra` more bytes (beyond the current visible length)
/// can be appended without another reallocation on the next call.
fn make_room(s: &StringData, extra: usize) {
    let mut buf = s.buf.borrow_mut();
    let visible = buf.len() - 1;
    buf.reserve((visible + extra + 1).saturating_sub(buf.capacity()));
}

pub fn append(r: GcRef, bytes: &[u8]) {
    with_string(r, |s| {
        make_room(s, bytes.len());
        let mut buf = s.buf.borrow_mut();
        let tail = buf.len() - 1;
        buf.truncate(tail);
        buf.extend_from_slice(bytes);
        buf.push(0);
    });
}

/// `substitute(pos, removed_len, bytes)`: replace `removed_len` visible
/// bytes starting at `pos` with `bytes`.
pub fn substitute(r: GcRef, pos: usize, removed_len: usize, bytes: &[u8]) {
    with_string(r, |s| {
        let mut buf = s.buf.borrow_mut();
        let visible = buf.len() - 1;
        let pos = pos.min(visible);
        let end = (pos + removed_len).min(visible);
        buf.splice(pos..end, bytes.iter().copied());
        if buf.last() != Some(&0) {
            buf.push(0);
        }
    });
}
