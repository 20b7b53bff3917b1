// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! Hash tables with Brent's variation, also the backing
//! store for `type` and `prototype` objects: a `Table` flagged `is_type`
//! is a type descriptor, not a plain hash map.

use core::cell::{Cell, RefCell};

use crate::gc::Mutator;
use crate::heap::{GcRef, HeapData};
use crate::value::Value;

const MIN_SIZE: usize = 8;

/// One slot in the table's backing array. `next` is an index-based
/// collision-chain link (never a raw pointer: growing the `Vec` would
/// otherwise invalidate it).
pub struct Node {
    pub key: Cell<Value>,
    pub val: Cell<Value>,
    next: Cell<Option<usize>>,
}

impl Node {
    fn empty() -> Self {
        Self {
            key: Cell::new(Value::Null),
            val: Cell::new(Value::Null),
            next: Cell::new(None),
        }
    }
}

/// Payload for a `Table` heap object.
pub struct TableData {
    pub type_val: Cell<Value>,
    /// The mixin/parent type this type inherits from, if any.
    /// Only meaningful when `is_type` is set.
    pub inherit_type: Cell<Value>,
    pub(crate) is_type: Cell<bool>,
    pub nodes: RefCell<Vec<Node>>,
    /// Descending cursor over candidate free slots.
    lastfree: Cell<usize>,
    /// The finalizer callable a type declares for its instances,
    /// `Value::Null` if none. Only
    /// meaningful when `is_type` is set; kept as a dedicated slot rather
    /// than a generic property lookup so the sweeper can check it without
    /// running the full `getProperty` dispatch mid-collection.
    pub finalizer: Cell<Value>,
}

impl TableData {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_SIZE).next_power_of_two();
        let mut nodes = Vec::with_capacity(capacity);
        nodes.resize_with(capacity, Node::empty);
        Self {
            type_val: Cell::new(Value::Null),
            inherit_type: Cell::new(Value::Null),
            is_type: Cell::new(false),
            nodes: RefCell::new(nodes),
            lastfree: Cell::new(capacity),
            finalizer: Cell::new(Value::Null),
        }
    }
}

fn with_table<R>(r: GcRef, f: impl FnOnce(&TableData) -> R) -> R {
    // SAFETY: `r` is only ever constructed for `HeapData::Table` payloads.
    unsafe {
        match &r.as_ref().data {
            HeapData::Table(t) => f(t),
            _ => unreachable!("expected table"),
        }
    }
}

#[must_use]
pub fn new_table(m: &Mutator<'_>, capacity: usize) -> Value {
    let r = m.allocate(HeapData::Table(TableData::new(capacity)));
    Value::Table(r)
}

/// Allocate a type object: a table flagged `is_type`,
#[must_use]
pub fn new_type(m: &Mutator<'_>, inherit: Value) -> Value {
    let data = TableData::new(MIN_SIZE);
    data.is_type.set(true);
    data.inherit_type.set(inherit);
    let r = m.allocate(HeapData::Table(data));
    m.barrier(r, inherit);
    Value::Table(r)
}

#[must_use]
pub fn is_type(r: GcRef) -> bool {
    with_table(r, |t| t.is_type.get())
}

#[must_use]
pub fn get_type_val(r: GcRef) -> Value {
    with_table(r, |t| t.type_val.get())
}

pub fn set_type_val(m: &Mutator<'_>, r: GcRef, v: Value) {
    with_table(r, |t| t.type_val.set(v));
    m.barrier(r, v);
}

#[must_use]
pub fn inherit_type(r: GcRef) -> Value {
    with_table(r, |t| t.inherit_type.get())
}

pub fn set_inherit_type(m: &Mutator<'_>, r: GcRef, v: Value) {
    with_table(r, |t| t.inherit_type.set(v));
    m.barrier(r, v);
}

/// The finalizer a type declares for its instances,
/// `Value::Null` if none. Only meaningful when `r` is flagged `is_type`.
#[must_use]
pub fn finalizer(r: GcRef) -> Value {
    with_table(r, |t| t.finalizer.get())
}

pub fn set_finalizer(m: &Mutator<'_>, r: GcRef, v: Value) {
    with_table(r, |t| t.finalizer.set(v));
    m.barrier(r, v);
}

#[must_use]
pub fn len(r: GcRef) -> usize {
    with_table(r, |t| {
        t.nodes
            .borrow()
            .iter()
            .filter(|n| !n.key.get().is_null())
            .count()
    })
}

/// Dual hashing strategy: a fast mask over the raw bit
/// pattern for keys that hash uniformly already (symbols, ints, bools),
/// a slower `%(capacity - 1 | 1)` reduction for keys that don't (floats,
/// pointers), matching `avm_table.cpp`'s `mainposition`.
fn main_position(key: Value, capacity: usize) -> usize {
    let raw = raw_hash(key);
    match key {
        Value::Symbol(_) | Value::Int(_) | Value::Bool(_) => (raw as usize) & (capacity - 1),
        _ => (raw as usize) % ((capacity - 1) | 1),
    }
}

fn raw_hash(key: Value) -> u64 {
    match key {
        Value::Null => 0,
        Value::Bool(b) => b as u64,
        Value::Int(n) => n as u64,
        Value::Float(f) => f.to_bits(),
        Value::Symbol(r) => {
            // SAFETY: symbol payload read-only access through its own cache.
            unsafe {
                match &r.as_ref().data {
                    HeapData::Symbol(s) => u64::from(s.hash),
                    _ => unreachable!(),
                }
            }
        }
        Value::Str(r) | Value::Array(r) | Value::Table(r) | Value::Method(r)
        | Value::Thread(r) | Value::Vm(r) => r.as_ptr() as u64,
    }
}

fn find(nodes: &[Node], key: Value, capacity: usize) -> Option<usize> {
    if key.is_null() {
        return None;
    }
    let mut idx = main_position(key, capacity);
    loop {
        let node = &nodes[idx];
        if node.key.get() == key {
            return Some(idx);
        }
        match node.next.get() {
            Some(n) => idx = n,
            None => return None,
        }
    }
}

#[must_use]
pub fn get(r: GcRef, key: Value) -> Value {
    with_table(r, |t| {
        let nodes = t.nodes.borrow();
        find(&nodes, key, nodes.len())
            .map(|i| nodes[i].val.get())
            .unwrap_or(Value::Null)
    })
}

/// `set(key, val)`: overwrite in place if `key` exists; otherwise insert
/// using Brent's variation, growing the table first if there is no spare
/// slot for the new node. Setting a key's value to `null` removes it
/// rather than leaving a live node with a null value, matching `avm_table.cpp`.
pub fn set(m: &Mutator<'_>, r: GcRef, key: Value, val: Value) {
    if key.is_null() {
        return;
    }
    let needs_resize = with_table(r, |t| {
        let mut nodes = t.nodes.borrow_mut();
        let capacity = nodes.len();
        if let Some(i) = find(&nodes, key, capacity) {
            if val.is_null() {
                nodes[i].key.set(Value::Null);
                nodes[i].val.set(Value::Null);
            } else {
                nodes[i].val.set(val);
            }
            return false;
        }
        if val.is_null() {
            return false;
        }
        drop(nodes);
        !insert_new(t, key, val)
    });
    if needs_resize {
        grow(r);
        with_table(r, |t| {
            let ok = insert_new(t, key, val);
            debug_assert!(ok, "insert must succeed immediately after growth");
        });
    }
    m.barrier(r, key);
    m.barrier(r, val);
}

/// Attempt to insert a brand-new `(key, val)` pair. Returns `false` if the
/// table is full and must be grown first.
fn insert_new(t: &TableData, key: Value, val: Value) -> bool {
    let mut nodes = t.nodes.borrow_mut();
    let capacity = nodes.len();
    let main = main_position(key, capacity);

    if nodes[main].key.get().is_null() {
        nodes[main].key.set(key);
        nodes[main].val.set(val);
        return true;
    }

    let Some(free) = find_free_slot(&nodes, t) else {
        return false;
    };

    let colliding_main = main_position(nodes[main].key.get(), capacity);
    if colliding_main != main {
        // The occupant of `main` is not living at its own main position
        // (it was displaced there by an earlier collision): evict it to
        // the free slot and place the new key at its rightful home.
        let prev = (0..capacity).find(|&i| nodes[i].next.get() == Some(main));
        if let Some(p) = prev {
            nodes[p].next.set(Some(free));
        }
        nodes[free].key.set(nodes[main].key.get());
        nodes[free].val.set(nodes[main].val.get());
        nodes[free].next.set(nodes[main].next.get());
        nodes[main].key.set(key);
        nodes[main].val.set(val);
        nodes[main].next.set(None);
    } else {
        // The occupant of `main` is at home: chain the new node off it.
        nodes[free].key.set(key);
        nodes[free].val.set(val);
        nodes[free].next.set(nodes[main].next.get());
        nodes[main].next.set(Some(free));
    }
    true
}

/// Walk `lastfree` downward looking for an empty slot.
fn find_free_slot(nodes: &[Node], t: &TableData) -> Option<usize> {
    let mut cursor = t.lastfree.get();
    while cursor > 0 {
        cursor -= 1;
        if nodes[cursor].key.get().is_null() {
            t.lastfree.set(cursor);
            return Some(cursor);
        }
    }
    t.lastfree.set(0);
    None
}

fn grow(r: GcRef) {
    let (old_nodes, new_cap) = with_table(r, |t| {
        let nodes = t.nodes.borrow();
        (
            core::mem::take(&mut *t.nodes.borrow_mut()),
            nodes.len().max(MIN_SIZE) * 2,
        )
    });
    let mut new_nodes = Vec::with_capacity(new_cap);
    new_nodes.resize_with(new_cap, Node::empty);
    with_table(r, |t| {
        *t.nodes.borrow_mut() = new_nodes;
        t.lastfree.set(new_cap);
    });
    for node in &old_nodes {
        let key = node.key.get();
        if !key.is_null() {
            with_table(r, |t| {
                let ok = insert_new(t, key, node.val.get());
                debug_assert!(ok, "a freshly doubled table must fit its old contents");
            });
        }
    }
}

/// `delete(key)`: remove the node holding `key`, then re-insert the rest
/// of its collision chain one node at a time so none of those entries are
/// stranded unreachable from their own main position.
pub fn delete(r: GcRef, key: Value) {
    let tail: Vec<(Value, Value)> = with_table(r, |t| {
        let mut nodes = t.nodes.borrow_mut();
        let capacity = nodes.len();
        if capacity == 0 {
            return Vec::new();
        }
        let main = main_position(key, capacity);
        let mut prev: Option<usize> = None;
        let mut idx = main;
        loop {
            if nodes[idx].key.get() == key {
                let next = nodes[idx].next.get();
                nodes[idx].key.set(Value::Null);
                nodes[idx].val.set(Value::Null);
                nodes[idx].next.set(None);
                if let Some(p) = prev {
                    nodes[p].next.set(None);
                }
                if t.lastfree.get() <= idx {
                    t.lastfree.set(idx + 1);
                }
                // Walk the rest of the chain out, clearing each node, so
                // it can be re-inserted fresh below.
                let mut collected = Vec::new();
                let mut cursor = next;
                while let Some(i) = cursor {
                    let k = nodes[i].key.get();
                    let v = nodes[i].val.get();
                    cursor = nodes[i].next.get();
                    nodes[i].key.set(Value::Null);
                    nodes[i].val.set(Value::Null);
                    nodes[i].next.set(None);
                    if t.lastfree.get() <= i {
                        t.lastfree.set(i + 1);
                    }
                    collected.push((k, v));
                }
                return collected;
            }
            match nodes[idx].next.get() {
                Some(n) => {
                    prev = Some(idx);
                    idx = n;
                }
                None => return Vec::new(),
            }
        }
    });
    for (k, v) in tail {
        with_table(r, |t| {
            let ok = insert_new(t, k, v);
            debug_assert!(ok, "re-inserting a node freed by delete must never overflow capacity");
        });
    }
}

/// Iteration order follows the backing array:
/// the first live slot after `key`, or the first live slot if `key` is
/// `null`.
#[must_use]
pub fn next(r: GcRef, key: Value) -> Option<(Value, Value)> {
    with_table(r, |t| {
        let nodes = t.nodes.borrow();
        let capacity = nodes.len();
        let start = if key.is_null() {
            0
        } else {
            match find(&nodes, key, capacity) {
                Some(i) => i + 1,
                None => return None,
            }
        };
        nodes[start..]
            .iter()
            .find(|n| !n.key.get().is_null())
            .map(|n| (n.key.get(), n.val.get()))
    })
}

#[cfg(test)]
mod table_test {
    use super::*;
    use crate::gc::{GcParams, GcState};
    use crate::heap::Heap;
    use crate::symbol::{SymbolData, Symtab};
    use std::collections::HashSet;

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

    fn unwrap_table(v: Value) -> GcRef {
        let Value::Table(r) = v else { unreachable!() };
        r
    }

    #[test]
    fn set_then_get_round_trips() {
        let (heap, gc, symtab, root) = fixture();
        let m = Mutator::new(&heap, &gc, &symtab, root);
        let r = unwrap_table(new_table(&m, 4));
        set(&m, r, Value::Int(1), Value::Bool(true));
        assert_eq!(get(r, Value::Int(1)), Value::Bool(true));
    }

    #[test]
    fn setting_null_deletes_the_key() {
        let (heap, gc, symtab, root) = fixture();
        let m = Mutator::new(&heap, &gc, &symtab, root);
        let r = unwrap_table(new_table(&m, 4));
        set(&m, r, Value::Int(1), Value::Int(42));
        set(&m, r, Value::Int(1), Value::Null);
        assert_eq!(get(r, Value::Int(1)), Value::Null);
        assert_eq!(len(r), 0);
    }

    #[test]
    fn delete_then_lookup_misses_but_other_keys_stay_findable() {
        let (heap, gc, symtab, root) = fixture();
        let m = Mutator::new(&heap, &gc, &symtab, root);
        let r = unwrap_table(new_table(&m, 4));
        for i in 0..20 {
            set(&m, r, Value::Int(i), Value::Int(i * 10));
        }
        delete(r, Value::Int(5));
        assert_eq!(get(r, Value::Int(5)), Value::Null);
        for i in 0..20 {
            if i != 5 {
                assert_eq!(get(r, Value::Int(i)), Value::Int(i * 10), "key {i} must survive deletion of key 5");
            }
        }
    }

    #[test]
    fn load_factor_100_percent_still_admits_successful_lookups() {
        let (heap, gc, symtab, root) = fixture();
        let m = Mutator::new(&heap, &gc, &symtab, root);
        let r = unwrap_table(new_table(&m, 8));
        let cap = with_table(r, |t| t.nodes.borrow().len());
        for i in 0..cap as i64 {
            set(&m, r, Value::Int(i), Value::Int(i));
        }
        for i in 0..cap as i64 {
            assert_eq!(get(r, Value::Int(i)), Value::Int(i));
        }
    }

    #[test]
    fn iteration_visits_every_live_key_exactly_once() {
        let (heap, gc, symtab, root) = fixture();
        let m = Mutator::new(&heap, &gc, &symtab, root);
        let r = unwrap_table(new_table(&m, 4));
        let keys = [
            Value::Int(1),
            Value::Bool(true),
            Value::Float(2.5),
            symtab.intern(&heap, b"name"),
        ];
        for (i, &k) in keys.iter().enumerate() {
            set(&m, r, k, Value::Int(i as i64));
        }
        set(&m, r, Value::Int(99), Value::Int(-1));
        delete(r, Value::Int(99));

        let mut seen = Vec::new();
        let mut cursor = Value::Null;
        while let Some((k, _)) = next(r, cursor) {
            seen.push(k);
            cursor = k;
        }
        assert_eq!(seen.len(), keys.len());
        let seen_set: HashSet<_> = seen.iter().copied().collect();
        for k in keys {
            assert!(seen_set.contains(&k));
        }
    }

    #[test]
    fn mixed_key_kinds_collide_through_both_hashing_strategies() {
        // Symbols/ints/bools hash through a fast mask; floats/pointers
        // through the slower `%(cap-1|1)` path — exercise
        // both in one table to make sure Brent chaining works across them.
        let (heap, gc, symtab, root) = fixture();
        let m = Mutator::new(&heap, &gc, &symtab, root);
        let r = unwrap_table(new_table(&m, 4));
        let s1 = symtab.intern(&heap, b"a");
        let s2 = symtab.intern(&heap, b"b");
        set(&m, r, s1, Value::Int(1));
        set(&m, r, s2, Value::Int(2));
        set(&m, r, Value::Float(1.25), Value::Int(3));
        set(&m, r, Value::Bool(false), Value::Int(4));
        assert_eq!(get(r, s1), Value::Int(1));
        assert_eq!(get(r, s2), Value::Int(2));
        assert_eq!(get(r, Value::Float(1.25)), Value::Int(3));
        assert_eq!(get(r, Value::Bool(false)), Value::Int(4));
    }

    proptest::proptest! {
        /// `tableSet(t, k, v); tableGet(t, k) == v` and, after a further
        /// `tableSet(t, k, null)`, `tableGet(t, k) == null`.
        #[test]
        fn set_get_delete_round_trips_for_arbitrary_int_keys(
            keys in proptest::collection::hash_set(-500i64..500, 1..60),
        ) {
            let (heap, gc, symtab, root) = fixture();
            let m = Mutator::new(&heap, &gc, &symtab, root);
            let r = unwrap_table(new_table(&m, 4));
            for &k in &keys {
                set(&m, r, Value::Int(k), Value::Int(k * 2));
            }
            for &k in &keys {
                proptest::prop_assert_eq!(get(r, Value::Int(k)), Value::Int(k * 2));
            }
            for &k in keys.iter().take(keys.len() / 2) {
                delete(r, Value::Int(k));
            }
            for (i, &k) in keys.iter().enumerate() {
                if i < keys.len() / 2 {
                    proptest::prop_assert_eq!(get(r, Value::Int(k)), Value::Null);
                } else {
                    proptest::prop_assert_eq!(get(r, Value::Int(k)), Value::Int(k * 2));
                }
            }
        }
    }
}
