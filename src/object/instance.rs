//! Instance objects (§3): a reference to a class plus a field table.

use std::cell::RefCell;

use crate::table::Table;
use crate::value::ObjRef;

/// An instance's class and its per-instance field table. Instances have no
/// static field shape (§4.6 `INHERIT` note) — fields are created the first
/// time `SET_PROPERTY` assigns them. `RefCell`-wrapped for the same reason
/// as [`crate::object::ClassObj::methods`].
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: RefCell<Table>,
}

impl InstanceObj {
    pub fn new(class: ObjRef) -> Self {
        InstanceObj {
            class,
            fields: RefCell::new(Table::new()),
        }
    }
}
