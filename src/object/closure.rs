//! Closure objects (§3): a `Function` bound to captured upvalues.

use crate::value::ObjRef;

/// A `Function` plus an ordered array of upvalue references, one per
/// capture the function's chunk declared. Fully populated before the
/// closure is reachable by script code (§3 invariant 3) — `CLOSURE`
/// allocates the array already sized and filled.
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Box<[ObjRef]>,
}

impl ClosureObj {
    pub fn new(function: ObjRef, upvalues: Box<[ObjRef]>) -> Self {
        ClosureObj { function, upvalues }
    }
}
