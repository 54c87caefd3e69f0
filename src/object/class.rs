//! Class objects (§3): a name plus a method table.

use std::cell::RefCell;

use crate::table::Table;
use crate::value::ObjRef;

/// A class's name and its method table (interned-name -> `Closure`).
/// `INHERIT` copies a superclass's table into a subclass's at inheritance
/// time (§4.6); later `METHOD` definitions on the subclass override
/// individual entries, and mutating the superclass's table afterwards is
/// not observed by the subclass (§8 Inheritance property).
///
/// Wrapped in a `RefCell` because every reference to a heap object is a
/// shared `&Obj` (objects are aliased freely, e.g. a class reachable from
/// both an instance and the globals table) — mutation needs interior
/// mutability rather than `&mut` access, the same reasoning as `Obj`'s own
/// `marked`/`next` cells.
pub struct ClassObj {
    pub name: ObjRef,
    pub methods: RefCell<Table>,
}

impl ClassObj {
    pub fn new(name: ObjRef) -> Self {
        ClassObj {
            name,
            methods: RefCell::new(Table::new()),
        }
    }
}
