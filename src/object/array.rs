//! Array objects (§3, §9 Open Questions).
//!
//! The original source stores `ARRAY`'s backing `ValueArray` inside a
//! `Native` opaque wrapper, which spec.md flags as unsound: such a wrapper
//! is invisible to the collector, so its elements would never be traced.
//! This crate resolves that Open Question the way spec.md's own design
//! notes suggest — `Array` is a first-class object kind, traced like any
//! other (§C of SPEC_FULL.md).

use std::cell::RefCell;

use crate::value::Value;

/// A growable sequence of values, exposed to scripts via native functions.
/// `RefCell`-wrapped so natives (e.g. `array_push`) can mutate an array
/// reached through an aliased `ObjRef`, the same reasoning as
/// [`crate::object::ClassObj::methods`].
pub struct ArrayObj {
    pub items: RefCell<Vec<Value>>,
}

impl ArrayObj {
    pub fn new(items: Vec<Value>) -> Self {
        ArrayObj {
            items: RefCell::new(items),
        }
    }
}
