//! Bound method objects (§3): a receiver paired with a closure.

use crate::value::{ObjRef, Value};

/// A receiver value plus the `Closure` to call it against, produced by
/// `GET_PROPERTY`/`GET_SUPER` when the named entry resolves to a method
/// instead of a field (§4.6 `bind_method`).
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

impl BoundMethodObj {
    pub fn new(receiver: Value, method: ObjRef) -> Self {
        BoundMethodObj { receiver, method }
    }
}
