// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! The incremental tri-color mark-and-sweep collector.
//!
//! State machine: `Begin -> Mark -> Pause -> Atomic -> SweepSymbols -> Sweep
//! -> Begin ...`. Each call to [`GcState::step`] performs a bounded amount
//! of work for the current phase and may advance to the next phase; a full,
//! synchronous collection is just "call `step` until we're back at `Begin`
//! having done at least one full lap", exposed as [`GcState::collect_full`].

use core::cell::{Cell, RefCell};

use crate::heap::{GcRef, HeapData, Heap};
use crate::symbol::Symtab;
use crate::value::Value;

/// Ceiling on live objects, past which a fresh allocation is a fatal
/// out-of-memory condition. Rust's global allocator
/// aborts the process on real exhaustion rather than handing back a
/// recoverable error, so this crate's "emergency collection on shortage"
/// hook is approximated by this soft accounting ceiling instead of a
/// retry-after-`alloc`-fails path — documented in `DESIGN.md`.
pub const OBJECT_CEILING: usize = 64 * 1024 * 1024;

/// The five (non-`Begin`) states plus `Begin` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    Mark,
    Pause,
    Atomic,
    SweepSymbols,
    Sweep,
}

/// Collection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Full non-generational mark and sweep every cycle.
    Full,
    /// Forced by an allocation failure; finalizers are skipped.
    Emergency,
    /// Only marks and sweeps new (non-old) objects.
    Generational,
}

/// Pacing tunables, named after their counterparts in `avm_config.h`
/// (`AVM_GCPAUSE`, `AVM_GCMUL`, `AVM_GCMAJOR`).
#[derive(Debug, Clone, Copy)]
pub struct GcParams {
    /// Percent of live-estimate growth allowed before the next cycle starts.
    pub gcpause: u32,
    /// Step multiplier: how much traversal work to do per byte allocated.
    pub gcstepmul: u32,
    /// Allocation count between forced major (full) cycles in generational mode.
    pub gcmajorinc: u32,
    /// Objects processed per `Mark`/`Sweep` step call.
    pub step_budget: usize,
}

impl Default for GcParams {
    fn default() -> Self {
        Self {
            gcpause: 200,
            gcstepmul: 200,
            gcmajorinc: 400,
            step_budget: 64,
        }
    }
}

/// Mutable garbage collector state shared by the whole VM.
pub struct GcState {
    phase: Cell<Phase>,
    mode: Cell<Mode>,
    gray: RefCell<Vec<GcRef>>,
    /// Threads re-added here instead of being blackened.
    gray_again: RefCell<Vec<GcRef>>,
    debt: Cell<i64>,
    estimate: Cell<usize>,
    params: GcParams,
    sweep_cursor: Cell<Option<GcRef>>,
    sweep_prev: Cell<Option<GcRef>>,
    major_counter: Cell<u32>,
    /// Objects found dead during a non-emergency sweep whose type declared
    /// a finalizer: `(dying object,
    /// finalizer callable)`, unlinked from the object chain but not yet
    /// freed. Drained by [`GcState::take_pending_finalizers`], which the
    /// embedding (`Vm::run_finalizers`) calls from an ordinary call
    /// boundary rather than from inside the sweeper itself, so running a
    /// finalizer's bytecode never re-enters mid-collection.
    pending_finalizers: RefCell<Vec<(Value, Value)>>,
}

impl GcState {
    #[must_use]
    pub fn new(params: GcParams) -> Self {
        Self {
            phase: Cell::new(Phase::Begin),
            mode: Cell::new(Mode::Full),
            gray: RefCell::new(Vec::new()),
            gray_again: RefCell::new(Vec::new()),
            debt: Cell::new(0),
            estimate: Cell::new(0),
            params,
            pending_finalizers: RefCell::new(Vec::new()),
            sweep_cursor: Cell::new(None),
            sweep_prev: Cell::new(None),
            major_counter: Cell::new(0),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    /// The `Pause` state is the only point the next cycle's mode may change.
    pub fn set_mode_at_pause(&self, mode: Mode) {
        if self.phase.get() == Phase::Pause {
            self.mode.set(mode);
        }
    }

    /// Record allocated bytes against the debt counter.
    pub fn add_debt(&self, bytes: usize) {
        self.debt.set(self.debt.get() + bytes as i64);
    }

    #[must_use]
    pub fn debt(&self) -> i64 {
        self.debt.get()
    }

    /// The GC invariant: a black object never
    /// points to a current-white one. Call on every store of one heap
    /// value into another (except thread/stack stores, which are exempt
    /// and instead pay an atomic re-mark cost).
    pub fn barrier(&self, heap: &Heap, parent: GcRef, child: Value) {
        let Some(child_ref) = child.as_gcref() else {
            return;
        };
        // SAFETY: headers are only touched through `Cell`.
        let parent_black = unsafe { parent.as_ref().header.mark.get().is_black() };
        if !parent_black {
            return;
        }
        let (child_white, child_dead) = unsafe {
            let mark = child_ref.as_ref().header.mark.get();
            (mark.is_white(), mark.is_dead(other_white(heap.current_white.get())))
        };
        if child_white && !child_dead {
            self.make_gray(child_ref);
        }
    }

    fn make_gray(&self, r: GcRef) {
        // SAFETY: header access through `Cell`.
        unsafe {
            let mut m = r.as_ref().header.mark.get();
            if m.is_gray() || m.is_black() {
                return;
            }
            m.to_gray();
            r.as_ref().header.mark.set(m);
        }
        self.gray.borrow_mut().push(r);
    }

    /// Perform one bounded unit of work; may cross a phase boundary.
    /// `root` is the VM root object (always kept reachable).
    pub fn step(&self, heap: &Heap, symtab: &Symtab, root: GcRef) {
        match self.phase.get() {
            Phase::Begin => self.begin(heap, root),
            Phase::Mark => self.mark_step(heap),
            Phase::Pause => self.phase.set(Phase::Atomic),
            Phase::Atomic => self.atomic(heap),
            Phase::SweepSymbols => self.sweep_symbols(heap, symtab),
            Phase::Sweep => self.sweep_step(heap),
        }
    }

    fn begin(&self, _heap: &Heap, root: GcRef) {
        self.gray.borrow_mut().clear();
        self.gray_again.borrow_mut().clear();
        self.estimate.set(0);
        self.make_gray(root);
        self.phase.set(Phase::Mark);
    }

    fn mark_step(&self, heap: &Heap) {
        let mut budget = self.params.step_budget;
        while budget > 0 {
            let Some(r) = self.gray.borrow_mut().pop() else {
                self.phase.set(Phase::Pause);
                return;
            };
            budget -= 1;
            self.blacken(heap, r);
        }
    }

    /// Mark `r` black (or keep it gray-again if it's a thread) and push
    /// any newly discovered white children onto the gray list.
    fn blacken(&self, heap: &Heap, r: GcRef) {
        // SAFETY: header and payload accessed through `Cell`/shared refs only.
        self.estimate.set(self.estimate.get() + crate::heap::object_size(r));
        let is_thread = unsafe { matches!(r.as_ref().data, HeapData::Thread(_)) };
        if is_thread {
            self.gray_again.borrow_mut().push(r);
        } else {
            unsafe {
                let mut m = r.as_ref().header.mark.get();
                m.to_black();
                r.as_ref().header.mark.set(m);
            }
        }
        let mut newly_white = Vec::new();
        unsafe {
            r.as_ref().data.trace(|v| {
                if let Some(cr) = v.as_gcref() {
                    let white = cr.as_ref().header.mark.get().is_white();
                    if white {
                        newly_white.push(cr);
                    }
                }
            });
        }
        for cr in newly_white {
            self.make_gray(cr);
        }
    }

    fn atomic(&self, heap: &Heap) {
        // Drain the gray list fully (no budget limit: atomic is stop-the-world).
        loop {
            let Some(r) = self.gray.borrow_mut().pop() else {
                break;
            };
            self.blacken(heap, r);
        }
        // Re-mark every gray-again thread (and anything it newly reaches).
        let threads: Vec<GcRef> = self.gray_again.borrow_mut().drain(..).collect();
        for th in threads {
            let mut newly_white = Vec::new();
            unsafe {
                th.as_ref().data.trace(|v| {
                    if let Some(cr) = v.as_gcref() {
                        if cr.as_ref().header.mark.get().is_white() {
                            newly_white.push(cr);
                        }
                    }
                });
            }
            for cr in newly_white {
                self.make_gray(cr);
            }
            loop {
                let Some(r) = self.gray.borrow_mut().pop() else {
                    break;
                };
                self.blacken(heap, r);
            }
        }
        heap.current_white.set(other_white(heap.current_white.get()));
        self.sweep_cursor.set(heap.head());
        self.sweep_prev.set(None);
        self.phase.set(Phase::SweepSymbols);
    }

    fn sweep_symbols(&self, heap: &Heap, symtab: &Symtab) {
        symtab.sweep_chunk(heap.current_white.get(), self.params.step_budget);
        self.phase.set(Phase::Sweep);
    }

    fn sweep_step(&self, heap: &Heap) {
        let other = other_white(heap.current_white.get());
        let mut budget = self.params.step_budget;
        let mut cursor = self.sweep_cursor.get();
        let mut prev = self.sweep_prev.get();
        while budget > 0 {
            let Some(r) = cursor else {
                self.sweep_cursor.set(None);
                self.sweep_prev.set(None);
                self.phase.set(Phase::Begin);
                self.finish_cycle(heap);
                return;
            };
            // Generational mode: once the sweep reaches an
            // object that survived a previous major cycle, every object
            // reachable further down the chain is at least as old (objects
            // are only ever prepended on allocation), so the minor sweep
            // can stop here rather than re-walking settled garbage.
            let is_old = unsafe { r.as_ref().header.mark.get().is_old() };
            if self.mode.get() == Mode::Generational && is_old {
                self.sweep_cursor.set(None);
                self.sweep_prev.set(None);
                self.phase.set(Phase::Begin);
                self.finish_cycle(heap);
                return;
            }
            budget -= 1;
            // SAFETY: header access through `Cell`.
            let next = unsafe { r.as_ref().header.next.get() };
            let dead = unsafe { r.as_ref().header.mark.get().is_dead(other) }
                && unsafe { !r.as_ref().header.mark.get().is_fixed() };
            if dead {
                match prev {
                    Some(p) => unsafe { p.as_ref().header.next.set(next) },
                    None => heap.set_head(next),
                }
                // Emergency collections skip finalizers to avoid re-entering
                // user code while recovering from allocation pressure.
                let fin = if self.mode.get() == Mode::Emergency {
                    None
                } else {
                    crate::heap::object_finalizer(r)
                };
                match fin {
                    Some(callable) => {
                        // SAFETY: unlinked from the chain; kept alive only
                        // by `pending_finalizers` until `Vm::run_finalizers`
                        // frees it after invoking `callable`.
                        unsafe {
                            let mut m = r.as_ref().header.mark.get();
                            m.set_finalized();
                            r.as_ref().header.mark.set(m);
                        }
                        let obj = crate::heap::ref_to_value(r);
                        self.pending_finalizers.borrow_mut().push((obj, callable));
                    }
                    None => {
                        // SAFETY: unlinked from the chain, not reachable elsewhere.
                        unsafe { heap.free(r) };
                    }
                }
            } else {
                unsafe {
                    let mut m = r.as_ref().header.mark.get();
                    if self.mode.get() == Mode::Generational {
                        m.set_old();
                    }
                    m.to_white(heap.current_white.get());
                    r.as_ref().header.mark.set(m);
                }
                prev = Some(r);
            }
            cursor = next;
        }
        self.sweep_cursor.set(cursor);
        self.sweep_prev.set(prev);
    }

    /// Drain the objects awaiting finalization, handing each `(dying
    /// object, finalizer callable)` pair to the caller. The caller (`Vm::
    /// run_finalizers`) is responsible for invoking the callable and then
    /// freeing the object via [`Heap::free`] — the GC no longer tracks it
    /// once it is returned here.
    #[must_use]
    pub fn take_pending_finalizers(&self) -> Vec<(Value, Value)> {
        self.pending_finalizers.borrow_mut().drain(..).collect()
    }

    /// Re-pace the collector and, in generational mode, track when a major
    /// (full) cycle is due.
    fn finish_cycle(&self, heap: &Heap) {
        // "the next-cycle threshold is estimate * gcpause / 100 above
        // current usage" — set debt so `Mutator::gc_check` only fires the
        // next cycle once allocation has grown past that threshold.
        let threshold = (self.estimate.get() as u64 * u64::from(self.params.gcpause) / 100) as i64;
        self.debt.set(heap.total_bytes.get() as i64 - threshold);
        if self.mode.get() == Mode::Generational {
            self.major_counter.set(self.major_counter.get() + 1);
            if self.major_counter.get() >= self.params.gcmajorinc {
                self.major_counter.set(0);
                self.mode.set(Mode::Full);
            }
        }
    }

    /// Run the collector synchronously until one full lap completes
    /// (`Begin` is reached again having passed through `Sweep`).
    pub fn collect_full(&self, heap: &Heap, symtab: &Symtab, root: GcRef) {
        // Force past `Begin` at least once so a call made at `Begin` does a
        // whole cycle rather than a no-op single step.
        self.step(heap, symtab, root);
        loop {
            self.step(heap, symtab, root);
            if self.phase.get() == Phase::Begin {
                break;
            }
        }
    }
}

#[must_use]
const fn other_white(current_white: u8) -> u8 {
    current_white ^ 0b11
}

/// A capability handle bundling the heap, GC state, symbol table, and VM
/// root together, handed to any function that allocates or mutates heap
/// objects. Keeping allocation and the write barrier behind one narrow
/// type, rather than letting embedding code poke `GcHeader`/`Heap` fields
/// directly, is the single narrow API this design calls for; bundling
/// the symbol table and root here too is what lets [`Mutator::allocate`]
/// run the two pre-allocation hooks described at its definition ("a GC
/// step if GC debt is positive, and an emergency full collection if the
/// allocator reports shortage") without every call site threading them
/// through separately.
pub struct Mutator<'a> {
    pub heap: &'a Heap,
    pub gc: &'a GcState,
    pub symtab: &'a Symtab,
    pub root: GcRef,
}

impl<'a> Mutator<'a> {
    #[must_use]
    pub const fn new(heap: &'a Heap, gc: &'a GcState, symtab: &'a Symtab, root: GcRef) -> Self {
        Self { heap, gc, symtab, root }
    }

    /// Apply the write barrier for storing `child` into `parent`.
    pub fn barrier(&self, parent: GcRef, child: Value) {
        self.gc.barrier(self.heap, parent, child);
    }

    /// Pre-allocation hook: advance the collector if debt
    /// is positive, then run an emergency full collection if the heap has
    /// grown past [`OBJECT_CEILING`] (the allocator-shortage substitute
    /// noted on that constant).
    pub fn gc_check(&self) {
        if self.gc.debt() > 0 {
            self.gc.step(self.heap, self.symtab, self.root);
            self.gc.debt.set(self.gc.debt.get() - self.gc.params.step_budget as i64 * 8);
        }
        if self.heap.object_count() >= OBJECT_CEILING {
            self.gc.mode.set(Mode::Emergency);
            self.gc.collect_full(self.heap, self.symtab, self.root);
            self.gc.mode.set(Mode::Full);
        }
    }

    /// Allocate a heap object, running the two
    /// pre-allocation hooks first, then charge the allocation against the
    /// GC's debt counter so a busy mutator's
    /// incremental work stays proportional to how much it allocates.
    #[must_use]
    pub fn allocate(&self, data: HeapData) -> GcRef {
        self.gc_check();
        let r = self.heap.allocate(data);
        self.gc.add_debt(crate::heap::object_size(r));
        r
    }
}

#[cfg(test)]
mod gc_test {
    use super::*;
    use crate::symbol::SymbolData;
    use crate::table;

    /// A `Symbol` payload makes a convenient, trivially-constructible GC
    /// root for these unit tests: `GcState` only cares about its header,
    /// never its payload kind.
    fn fixed_root(heap: &Heap) -> GcRef {
        let root = heap.allocate(HeapData::Symbol(SymbolData {
            hash: 0,
            bytes: Vec::new().into_boxed_slice(),
            next: Cell::new(None),
        }));
        // SAFETY: header mutated once, right after allocation, before the
        // object is reachable from anything else.
        unsafe {
            let mut mark = root.as_ref().header.mark.get();
            mark.set_fixed();
            root.as_ref().header.mark.set(mark);
        }
        root
    }

    #[test]
    fn allocating_charges_debt_and_gc_check_steps_when_due() {
        let heap = Heap::new();
        let gc = GcState::new(GcParams::default());
        let symtab = Symtab::new(1);
        let root = fixed_root(&heap);
        let m = Mutator::new(&heap, &gc, &symtab, root);
        assert_eq!(gc.debt(), 0);
        let before = heap.object_count();
        let _ = table::new_table(&m, 4);
        assert!(gc.debt() > 0, "allocating must charge the debt counter");
        assert_eq!(heap.object_count(), before + 1);
    }

    #[test]
    fn finalizer_is_queued_not_freed_on_sweep() {
        let heap = Heap::new();
        let gc = GcState::new(GcParams::default());
        let symtab = Symtab::new(1);
        let root = fixed_root(&heap);
        let m = Mutator::new(&heap, &gc, &symtab, root);

        let ty = table::new_type(&m, Value::Null);
        let Value::Table(ty_ref) = ty else { unreachable!() };
        let finalizer_marker = Value::Int(42);
        table::set_finalizer(&m, ty_ref, finalizer_marker);

        let instance = table::new_table(&m, 4);
        let Value::Table(inst_ref) = instance else { unreachable!() };
        table::set_type_val(&m, inst_ref, ty);

        // `ty` and `instance` are both left unrooted (never reachable from
        // `root`), so a full cycle must treat `instance` as dead; since its
        // type declares a finalizer, it should be queued rather than freed.
        gc.collect_full(&heap, &symtab, root);
        let pending = gc.take_pending_finalizers();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, finalizer_marker);
    }
}
