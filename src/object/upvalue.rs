//! Upvalue objects (§3, §4.7): a capture cell, open while it aliases a live
//! stack slot, closed once it owns its value.

use std::cell::Cell;

use crate::value::Value;

/// The state of an upvalue. `Open` carries the index of the stack slot it
/// aliases (decreasing slot index stands in for the C original's decreasing
/// slot address — see `crate::vm::Vm::open_upvalues`). The transition
/// `Open -> Closed` is one-way (§4.7).
#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct UpvalueObj {
    pub state: Cell<UpvalueState>,
}

impl UpvalueObj {
    pub fn new_open(slot: usize) -> Self {
        UpvalueObj {
            state: Cell::new(UpvalueState::Open(slot)),
        }
    }

    pub fn close(&self, value: Value) {
        self.state.set(UpvalueState::Closed(value));
    }
}
