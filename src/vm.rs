// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! The embedding surface: `Vm::new`, value builders,
//! stack and call operations, globals access. [`VmRootData`] is the heap
//! object that anchors everything else reachable from the VM — it is the
//! GC's root and is always kept black.

use core::cell::Cell;

use tracing::{debug, info};

use crate::array;
use crate::bytecode::Chunk;
use crate::dispatch;
use crate::error::VmFault;
use crate::gc::{GcParams, GcState, Mutator};
use crate::heap::{GcRef, Heap, HeapData};
use crate::interp;
use crate::method::{self, NativeFn};
use crate::strbuf;
use crate::symbol::Symtab;
use crate::table;
use crate::thread::{self, Thread};
use crate::value::Value;

/// Indices into the VM root's standard-symbol table`"). The compiler
/// (out of scope for this crate) is the only producer of these indices in
/// `LoadStd`/`ForPrep`/`RptPrep` operands; the core only needs to store
/// and retrieve them.
pub mod std_sym {
    pub const ADD: u8 = 0;
    pub const SUB: u8 = 1;
    pub const MUL: u8 = 2;
    pub const DIV: u8 = 3;
    /// The three-way comparison method (`<=>`) the compiler emits before
    /// `JEq`/`JNe`/`JLt`/`JLe`/`JGt`/`JGe`.
    pub const COMPARE: u8 = 4;
    pub const NEW: u8 = 5;
    /// The `()` call-operator method, used for the symbol-as-callee
    /// shortcut's eventual dispatch target on non-method callables.
    pub const CALL: u8 = 6;
    /// Iterator-protocol method consulted by `ForPrep`.
    pub const ITERATE: u8 = 7;
    /// Iterator-protocol method consulted by `RptPrep`.
    pub const NEXT: u8 = 8;

    pub const COUNT: usize = 9;
}

/// Payload for the singleton `VmRoot` heap object.
///
/// Holds the VM-wide standard type table,
/// plus the main thread, the standard-symbol table, and a
/// PRNG seed for any future `rand`-flavored native function. None of this
/// is itself swept by the object chain's ordinary pass until the VM is
/// torn down: the root is marked `FIXED`.
pub struct VmRootData {
    types: [Cell<Value>; Self::KIND_COUNT],
    all_type: Cell<Value>,
    main_thread: Cell<Value>,
    std_syms: [Cell<Value>; std_sym::COUNT],
    rand_state: Cell<u64>,
}

impl VmRootData {
    const KIND_COUNT: usize = 10;
    const IDX_NULL: usize = 0;
    const IDX_BOOL: usize = 1;
    const IDX_INT: usize = 2;
    const IDX_FLOAT: usize = 3;
    const IDX_SYMBOL: usize = 4;
    const IDX_STRING: usize = 5;
    const IDX_ARRAY: usize = 6;
    const IDX_TABLE: usize = 7;
    const IDX_METHOD: usize = 8;
    const IDX_THREAD: usize = 9;

    fn new(seed: u64) -> Self {
        Self {
            types: [const { Cell::new(Value::Null) }; Self::KIND_COUNT],
            all_type: Cell::new(Value::Null),
            main_thread: Cell::new(Value::Null),
            std_syms: [const { Cell::new(Value::Null) }; std_sym::COUNT],
            rand_state: Cell::new(seed),
        }
    }

    #[must_use]
    pub fn std_symbol(&self, idx: u8) -> Value {
        self.std_syms
            .get(idx as usize)
            .map(Cell::get)
            .unwrap_or(Value::Null)
    }

    pub fn set_std_symbol(&self, idx: u8, sym: Value) {
        if let Some(cell) = self.std_syms.get(idx as usize) {
            cell.set(sym);
        }
    }

    fn kind_index(v: Value) -> Option<usize> {
        Some(match v {
            Value::Null => Self::IDX_NULL,
            Value::Bool(_) => Self::IDX_BOOL,
            Value::Int(_) => Self::IDX_INT,
            Value::Float(_) => Self::IDX_FLOAT,
            Value::Symbol(_) => Self::IDX_SYMBOL,
            Value::Str(_) => Self::IDX_STRING,
            Value::Array(_) => Self::IDX_ARRAY,
            Value::Table(_) => Self::IDX_TABLE,
            Value::Method(_) => Self::IDX_METHOD,
            Value::Thread(_) => Self::IDX_THREAD,
            Value::Vm(_) => return None,
        })
    }

    #[must_use]
    pub fn standard_type(&self, v: Value) -> Value {
        Self::kind_index(v)
            .map(|i| self.types[i].get())
            .unwrap_or(Value::Null)
    }

    pub fn set_standard_type(&self, v: Value, ty: Value) {
        if let Some(i) = Self::kind_index(v) {
            self.types[i].set(ty);
        }
    }

    #[must_use]
    pub fn all_type(&self) -> Value {
        self.all_type.get()
    }

    pub fn set_all_type(&self, ty: Value) {
        self.all_type.set(ty);
    }

    #[must_use]
    pub fn main_thread(&self) -> Value {
        self.main_thread.get()
    }

    pub(crate) fn trace(&self, mut visit: impl FnMut(Value)) {
        for t in &self.types {
            if !t.get().is_null() {
                visit(t.get());
            }
        }
        if !self.all_type.get().is_null() {
            visit(self.all_type.get());
        }
        if !self.main_thread.get().is_null() {
            visit(self.main_thread.get());
        }
        for s in &self.std_syms {
            if !s.get().is_null() {
                visit(s.get());
            }
        }
    }
}

/// Read-only access to the VM root's payload given its heap pointer. Used
/// by [`crate::interp`] and [`crate::dispatch`] call sites that only have
/// a `GcRef` (a running thread does not hold a `&Vm`).
///
/// # Safety
/// `r` must point at a live `HeapData::VmRoot`, which is guaranteed for
/// any `GcRef` obtained from [`Thread::root`] or [`Vm`] internals.
pub(crate) fn with_root<R>(r: GcRef, f: impl FnOnce(&VmRootData) -> R) -> R {
    // SAFETY: see function doc.
    unsafe {
        match &r.as_ref().data {
            HeapData::VmRoot(root) => f(root),
            _ => unreachable!("expected vm root"),
        }
    }
}

/// `getProperty` reachable from a bare root pointer.
#[must_use]
pub(crate) fn get_property(root: GcRef, v: Value, key: Value) -> Value {
    with_root(root, |r| dispatch::get_property(r, v, key))
}

/// Standard-symbol lookup reachable from a bare root pointer.
#[must_use]
pub(crate) fn std_symbol(root: GcRef, idx: u8) -> Value {
    with_root(root, |r| r.std_symbol(idx))
}

/// A running VM instance: owns the heap, the collector, the symbol
/// table, and the root object. Not `Sync`/`Send` — embeddings run one VM
/// per cooperative thread of control.
pub struct Vm {
    heap: Heap,
    gc: GcState,
    symtab: Symtab,
    root: GcRef,
}

impl Vm {
    /// Create a VM with default GC pacing.
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(GcParams::default(), 0x2545_f491_4f6c_dd1d)
    }

    #[must_use]
    pub fn with_params(params: GcParams, symbol_seed: u64) -> Self {
        let heap = Heap::new();
        let gc = GcState::new(params);
        let symtab = Symtab::new(symbol_seed);
        let root = heap.allocate(HeapData::VmRoot(VmRootData::new(symbol_seed)));
        // SAFETY: header mutated once, immediately after allocation, before
        // the object is reachable from anything else.
        unsafe {
            let mut m = root.as_ref().header.mark.get();
            m.set_fixed();
            root.as_ref().header.mark.set(m);
        }
        info!(target: "embera::vm", "vm created");
        let vm = Self {
            heap,
            gc,
            symtab,
            root,
        };
        let globals = table::new_table(&vm.mutator(), 16);
        let main = thread::new_thread(&vm.mutator(), globals);
        vm.root_data().main_thread.set(main);
        vm.mutator().barrier(vm.root, main);
        vm.install_default_std_symbols();
        vm
    }

    /// Populate the well-known slots of the standard-symbol table
    /// with their conventional spellings. An embedding
    /// that needs more may register further slots with
    /// [`Self::set_std_symbol`].
    fn install_default_std_symbols(&self) {
        let defaults: &[(u8, &str)] = &[
            (std_sym::ADD, "+"),
            (std_sym::SUB, "-"),
            (std_sym::MUL, "*"),
            (std_sym::DIV, "/"),
            (std_sym::COMPARE, "<=>"),
            (std_sym::NEW, "New"),
            (std_sym::CALL, "()"),
            (std_sym::ITERATE, "iterator"),
            (std_sym::NEXT, "next"),
        ];
        for &(idx, name) in defaults {
            let sym = self.intern(name);
            self.set_std_symbol(idx, sym);
        }
    }

    fn mutator(&self) -> Mutator<'_> {
        Mutator::new(&self.heap, &self.gc, &self.symtab, self.root)
    }

    fn root_data(&self) -> &VmRootData {
        // SAFETY: `self.root` always holds `HeapData::VmRoot`.
        unsafe {
            match &self.root.as_ref().data {
                HeapData::VmRoot(r) => r,
                _ => unreachable!(),
            }
        }
    }

    #[must_use]
    pub fn main_thread(&self) -> Value {
        self.root_data().main_thread()
    }

    #[must_use]
    pub fn globals(&self) -> Value {
        let Value::Thread(t) = self.main_thread() else {
            unreachable!("main thread is always a Thread value");
        };
        thread::globals(t)
    }

    /// Look up or intern a symbol by its UTF-8 spelling.
    #[must_use]
    pub fn intern(&self, name: &str) -> Value {
        self.symtab.intern(&self.heap, name.as_bytes())
    }

    #[must_use]
    pub fn new_string(&self, bytes: &[u8]) -> Value {
        strbuf::new_string(&self.mutator(), bytes)
    }

    #[must_use]
    pub fn new_array(&self, capacity: usize) -> Value {
        array::new_array(&self.mutator(), capacity)
    }

    #[must_use]
    pub fn new_table(&self, capacity: usize) -> Value {
        table::new_table(&self.mutator(), capacity)
    }

    #[must_use]
    pub fn new_type(&self, inherit: Value) -> Value {
        dispatch_new_type(&self.mutator(), inherit)
    }

    #[must_use]
    pub fn new_native(&self, name: &str, f: NativeFn) -> Value {
        let sym = self.intern(name);
        method::new_native(&self.mutator(), sym, f)
    }

    #[must_use]
    pub fn new_bytecode_method(&self, name: Value, chunk: Chunk) -> Value {
        method::new_bytecode(&self.mutator(), name, chunk)
    }

    /// A method's human-readable origin, `Value::Null` until a loader sets one.
    #[must_use]
    pub fn method_source(&self, method: Value) -> Value {
        match method {
            Value::Method(r) => method::source(r),
            _ => Value::Null,
        }
    }

    pub fn set_method_source(&self, method: Value, source: Value) {
        if let Value::Method(r) = method {
            method::set_source(&self.mutator(), r, source);
        }
    }

    pub fn set_standard_type(&self, v: Value, ty: Value) {
        self.root_data().set_standard_type(v, ty);
        self.mutator().barrier(self.root, ty);
    }

    pub fn set_all_type(&self, ty: Value) {
        self.root_data().set_all_type(ty);
        self.mutator().barrier(self.root, ty);
    }

    #[must_use]
    pub fn get_property(&self, v: Value, key: Value) -> Value {
        dispatch::get_property(self.root_data(), v, key)
    }

    /// `typeOf(v)`: the type governing `v`'s method and
    /// property lookups — its own explicitly attached type if one was set
    /// with [`Self::set_type`], otherwise the VM's standard type for its
    /// kind.
    #[must_use]
    pub fn type_of(&self, v: Value) -> Value {
        dispatch::type_of(self.root_data(), v)
    }

    /// Attach `ty` directly to a single table, array, or string instance,
    /// distinct from [`Self::set_standard_type`]'s
    /// VM-wide default for the whole kind. A no-op for kinds that carry no
    /// per-instance type slot.
    pub fn set_type(&self, v: Value, ty: Value) {
        match v {
            Value::Table(r) => table::set_type_val(&self.mutator(), r, ty),
            Value::Array(r) => array::set_type_val(&self.mutator(), r, ty),
            Value::Str(r) => strbuf::set_type_val(&self.mutator(), r, ty),
            _ => {}
        }
    }

    /// Read a slot of the standard-symbol table.
    #[must_use]
    pub fn std_symbol(&self, idx: u8) -> Value {
        self.root_data().std_symbol(idx)
    }

    /// Register (or overwrite) a slot of the standard-symbol table.
    pub fn set_std_symbol(&self, idx: u8, sym: Value) {
        self.root_data().set_std_symbol(idx, sym);
        self.mutator().barrier(self.root, sym);
    }

    /// `table(key) → val`; `null` if `t` is
    /// not a table or the key is absent.
    #[must_use]
    pub fn table_get(&self, t: Value, key: Value) -> Value {
        match t {
            Value::Table(r) => table::get(r, key),
            _ => Value::Null,
        }
    }

    /// `tableSet(t, k, v)`; storing `null` deletes `k`. A
    /// no-op if `t` is not a table.
    pub fn table_set(&self, t: Value, key: Value, val: Value) {
        if let Value::Table(r) = t {
            table::set(&self.mutator(), r, key, val);
        }
    }

    pub fn table_delete(&self, t: Value, key: Value) {
        if let Value::Table(r) = t {
            table::delete(r, key);
        }
    }

    /// `next(key) → nextKey` iteration; pass `Value::Null`
    /// to start. `None` ends the walk.
    #[must_use]
    pub fn table_next(&self, t: Value, key: Value) -> Option<(Value, Value)> {
        match t {
            Value::Table(r) => table::next(r, key),
            _ => None,
        }
    }

    #[must_use]
    pub fn table_len(&self, t: Value) -> usize {
        match t {
            Value::Table(r) => table::len(r),
            _ => 0,
        }
    }

    #[must_use]
    pub fn array_len(&self, a: Value) -> usize {
        match a {
            Value::Array(r) => array::len(r),
            _ => 0,
        }
    }

    #[must_use]
    pub fn array_get(&self, a: Value, idx: usize) -> Value {
        match a {
            Value::Array(r) => array::get(r, idx),
            _ => Value::Null,
        }
    }

    pub fn array_set(&self, a: Value, idx: usize, val: Value) {
        if let Value::Array(r) = a {
            array::set(&self.mutator(), r, idx, val);
        }
    }

    pub fn array_append(&self, a: Value, val: Value) {
        if let Value::Array(r) = a {
            array::append(&self.mutator(), r, val);
        }
    }

    pub fn array_insert(&self, a: Value, pos: usize, n: usize, val: Value) {
        if let Value::Array(r) = a {
            array::insert(&self.mutator(), r, pos, n, val);
        }
    }

    pub fn array_delete(&self, a: Value, pos: usize, n: usize) {
        if let Value::Array(r) = a {
            array::delete(r, pos, n);
        }
    }

    pub fn array_splice(&self, dst: Value, pos: usize, n: usize, src: Value, srcpos: usize, count: usize) {
        if let (Value::Array(d), Value::Array(s)) = (dst, src) {
            array::splice(&self.mutator(), d, pos, n, s, srcpos, count);
        }
    }

    /// Build a closure value: slot 0 getter, slot 1 setter, slots 2..
    /// upvalues.
    #[must_use]
    pub fn new_closure(&self, getter: Value, setter: Value, upvalues: &[Value]) -> Value {
        let c = array::new_closure(&self.mutator(), getter, setter, upvalues);
        let Value::Array(r) = c else {
            unreachable!("new_closure always returns Value::Array");
        };
        self.mutator().barrier(r, getter);
        self.mutator().barrier(r, setter);
        for &v in upvalues {
            self.mutator().barrier(r, v);
        }
        c
    }

    #[must_use]
    pub fn closure_upvalue(&self, closure: Value, idx: usize) -> Option<Value> {
        match closure {
            Value::Array(r) => array::closure_upvalue(r, idx),
            _ => None,
        }
    }

    pub fn closure_set_upvalue(&self, closure: Value, idx: usize, val: Value) {
        if let Value::Array(r) = closure {
            array::closure_set_upvalue(&self.mutator(), r, idx, val);
        }
    }

    /// Add `mixin` to `ty`'s inheritance chain and, if the
    /// mixin defines a `New` method, invoke it with `ty` as the sole
    /// argument so the mixin may initialize state on the joining type.
    pub fn add_mixin(&self, ty: Value, mixin: Value) -> Result<(), VmFault> {
        let Value::Table(r) = ty else {
            return Ok(());
        };
        dispatch::add_mixin(&self.mutator(), r, mixin);
        let new_sym = self.std_symbol(std_sym::NEW);
        let ctor = dispatch::get_property(self.root_data(), mixin, new_sym);
        if !ctor.is_null() {
            self.call(ctor, &[ty])?;
        }
        Ok(())
    }

    /// Declare (or clear, with `Value::Null`) the finalizer a type's
    /// instances run when collected. A no-op if `ty`
    /// isn't a type.
    pub fn set_finalizer(&self, ty: Value, finalizer: Value) {
        if let Value::Table(r) = ty {
            if table::is_type(r) {
                table::set_finalizer(&self.mutator(), r, finalizer);
            }
        }
    }

    #[must_use]
    pub fn finalizer_of(&self, ty: Value) -> Value {
        match ty {
            Value::Table(r) if table::is_type(r) => table::finalizer(r),
            _ => Value::Null,
        }
    }

    pub fn set_global(&self, key: Value, val: Value) {
        let Value::Table(g) = self.globals() else {
            unreachable!("globals is always a Table value");
        };
        table::set(&self.mutator(), g, key, val);
    }

    #[must_use]
    pub fn get_global(&self, key: Value) -> Value {
        let Value::Table(g) = self.globals() else {
            unreachable!("globals is always a Table value");
        };
        table::get(g, key)
    }

    /// Invoke `callee` on the main thread with `args`, returning its
    /// result values. A `VmFault` is unrecoverable and should terminate
    /// the embedding; a `RuntimeError` has already been
    /// resolved to `null` results by the time it would reach here, so
    /// this only ever surfaces faults.
    pub fn call(&self, callee: Value, args: &[Value]) -> Result<Vec<Value>, VmFault> {
        let Value::Thread(t) = self.main_thread() else {
            unreachable!("main thread is always a Thread value");
        };
        let mut thread = Thread::new(self.mutator(), &self.symtab, t, self.root);
        debug!(target: "embera::vm", nargs = args.len(), "calling into vm");
        interp::call_values(&mut thread, callee, args)
    }

    /// Run one bounded unit of incremental GC work.
    pub fn gc_step(&self) {
        self.gc.step(&self.heap, &self.symtab, self.root);
    }

    /// Invoke and reclaim every object queued for finalization since the
    /// last call. Safe to call from any
    /// call boundary (never from inside a GC step itself, since a
    /// finalizer may run arbitrary bytecode and allocate); an embedding
    /// that never calls this simply never runs finalizers, matching the
    /// core's "no debugger protocol, no strong timing guarantee" stance.
    pub fn run_finalizers(&self) -> Result<(), VmFault> {
        for (obj, callable) in self.gc.take_pending_finalizers() {
            self.call(callable, &[obj])?;
            let Some(r) = obj.as_gcref() else {
                unreachable!("only heap objects are ever queued for finalization");
            };
            // SAFETY: the object was unlinked from the chain by the
            // sweeper and is reachable only through this pending-finalizer
            // entry, which we just drained.
            unsafe { self.heap.free(r) };
        }
        Ok(())
    }

    /// Force a full, synchronous collection cycle.
    pub fn collect_garbage(&self) {
        self.gc.collect_full(&self.heap, &self.symtab, self.root);
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.heap.object_count()
    }

    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symtab.len()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_new_type(m: &Mutator<'_>, inherit: Value) -> Value {
    table::new_type(m, inherit)
}
