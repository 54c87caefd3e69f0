//! Memory manager and allocator (§4.5): the single entry point through
//! which every heap object is created, accounted, and eventually freed by
//! the collector.
//!
//! The C original centers this on a `reallocate(ptr, old, new)` function
//! that also doubles as the GC trigger. Rust's ownership model makes a
//! literal realloc-everything entry point both unsafe and unidiomatic, so
//! this crate keeps the *role* — one place that accounts bytes, owns the
//! allocation list, and decides when to collect — as [`Heap::alloc`] plus
//! [`Heap::bytes_allocated`]/[`Heap::should_collect`], rather than the
//! literal signature.

use std::mem::{size_of, size_of_val};
use std::ptr::NonNull;

use crate::config::VmLimits;
use crate::object::{Obj, ObjData};
use crate::value::ObjRef;

/// Approximates the C original's `sizeof` accounting well enough to drive
/// the growth heuristic; exactness does not matter, only monotonicity.
fn estimate_size(data: &ObjData) -> usize {
    use ObjData::*;
    size_of_val(data)
        + match data {
            String(s) => s.bytes.len(),
            Array(a) => a.items.borrow().len() * size_of::<crate::value::Value>(),
            Closure(c) => c.upvalues.len() * size_of::<ObjRef>(),
            _ => 0,
        }
}

/// Owns every live heap object via an intrusive singly-linked list (§3
/// invariant 1) plus the string interning table (§4.2). One `Heap` backs
/// exactly one [`crate::vm::Vm`] — there is no process-wide singleton
/// (§9 Design Notes, "Global VM singleton").
pub struct Heap {
    head: Option<NonNull<Obj>>,
    bytes_allocated: usize,
    next_gc: usize,
    growth_factor: usize,
    strings: crate::intern::Interner,
    /// Set by tests to force a collection on every allocation (§4.5,
    /// "stress-GC enabled unconditionally on allocation").
    pub stress_gc: bool,
    objects_live: usize,
}

impl Heap {
    pub fn new(limits: VmLimits) -> Self {
        Heap {
            head: None,
            bytes_allocated: 0,
            next_gc: limits.initial_gc_threshold,
            growth_factor: limits.gc_growth_factor,
            strings: crate::intern::Interner::new(),
            stress_gc: false,
            objects_live: 0,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn objects_live(&self) -> usize {
        self.objects_live
    }

    /// Whether the next allocation should trigger a collection (§4.5: any
    /// growth past `next_gc`, or always when stress-GC is on).
    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    fn resize_threshold(&mut self) {
        self.next_gc = self.bytes_allocated.saturating_mul(self.growth_factor).max(1);
    }

    /// Allocates `data` on the heap, links it into the allocation list, and
    /// accounts its estimated size. The returned `ObjRef` is unmarked and
    /// unreachable from any root until the caller publishes it — callers
    /// that allocate more than one object in sequence must keep earlier
    /// results rooted (value stack or equivalent) across further
    /// allocations, per §4.5's allocation-site discipline.
    pub fn alloc(&mut self, data: ObjData) -> ObjRef {
        let size = estimate_size(&data);
        let obj = Box::new(Obj {
            marked: std::cell::Cell::new(false),
            next: std::cell::Cell::new(self.head),
            data,
        });
        let ptr = NonNull::from(Box::leak(obj));
        self.head = Some(ptr);
        self.bytes_allocated += size;
        self.objects_live += 1;
        log::trace!(
            "alloc {} ({} bytes, {} total)",
            unsafe { ptr.as_ref() }.data.kind_name(),
            size,
            self.bytes_allocated
        );
        ObjRef::new(ptr)
    }

    /// Interns `bytes` (§4.2): returns the canonical `String` object,
    /// allocating a new one only if no equal string already exists.
    pub fn intern_bytes(&mut self, bytes: &[u8]) -> ObjRef {
        if let Some(existing) = self.strings.find(bytes) {
            return existing;
        }
        let hash = crate::intern::hash_bytes(bytes);
        let obj = self.alloc(ObjData::String(crate::object::StringObj::new(
            bytes.to_vec().into_boxed_slice(),
            hash,
        )));
        self.strings.insert(obj);
        obj
    }

    pub fn intern_str(&mut self, s: &str) -> ObjRef {
        self.intern_bytes(s.as_bytes())
    }

    /// Concatenates two strings and interns the result (`ADD` on two
    /// strings, §4.6).
    pub fn concat_strings(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        let bytes = {
            let ObjData::String(sa) = &a.as_obj().data else {
                unreachable!("concat_strings requires String operands")
            };
            let ObjData::String(sb) = &b.as_obj().data else {
                unreachable!("concat_strings requires String operands")
            };
            let mut v = Vec::with_capacity(sa.bytes.len() + sb.bytes.len());
            v.extend_from_slice(&sa.bytes);
            v.extend_from_slice(&sb.bytes);
            v
        };
        self.intern_bytes(&bytes)
    }

    pub(crate) fn mark(&self, r: ObjRef) -> bool {
        let obj = r.as_obj();
        if obj.marked.get() {
            false
        } else {
            obj.marked.set(true);
            log::trace!("mark {} {:p}", obj.data.kind_name(), r.as_ptr());
            true
        }
    }

    /// Drops every string from the intern table whose backing object was
    /// not marked this cycle (§4.5 step 3, weak sweep), before the object
    /// sweep frees the underlying memory.
    pub(crate) fn weak_sweep_strings(&mut self) {
        self.strings.retain(|r| r.as_obj().marked.get());
    }

    /// Walks the allocation list, freeing every unmarked object and
    /// clearing `marked` on survivors (§4.5 step 4). Returns the number of
    /// objects freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut prev: Option<NonNull<Obj>> = None;
        let mut cur = self.head;
        while let Some(ptr) = cur {
            let next = unsafe { ptr.as_ref() }.next.get();
            if unsafe { ptr.as_ref() }.marked.get() {
                unsafe { ptr.as_ref() }.marked.set(false);
                prev = Some(ptr);
                cur = next;
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref() }.next.set(next),
                    None => self.head = next,
                }
                let size = estimate_size(&unsafe { ptr.as_ref() }.data);
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                self.objects_live -= 1;
                freed += 1;
                // SAFETY: the object is unmarked, meaning the mark phase
                // that just ran did not reach it from any root (§3
                // invariant 6); nothing outside this heap can reference it.
                unsafe { drop(Box::from_raw(ptr.as_ptr())) };
                cur = next;
            }
        }
        self.resize_threshold();
        log::debug!(
            "gc: freed {} objects, {} bytes live, next at {} bytes",
            freed,
            self.bytes_allocated,
            self.next_gc
        );
        freed
    }
}

impl Drop for Heap {
    /// Frees every remaining object at VM shutdown (§5, `freeVM`).
    fn drop(&mut self) {
        let mut cur = self.head;
        while let Some(ptr) = cur {
            let next = unsafe { ptr.as_ref() }.next.get();
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            cur = next;
        }
    }
}
