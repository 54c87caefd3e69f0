//! Generic open-addressed hash table (§4.3): interned-`String` key to
//! `Value`, used for globals, instance fields, and class method tables.
//!
//! Shares its probing/tombstone discipline with [`crate::intern::Interner`]
//! (§4.2) but is keyed by object identity instead of raw bytes, since every
//! key handed to this table is already a canonical interned string.

use crate::value::{ObjRef, Value};

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(ObjRef, Value),
}

const MAX_LOAD: f64 = 0.75;

/// An open-addressed linear-probing map from interned-`String` identity to
/// `Value`. Tombstones mark deleted entries so probe chains stay intact;
/// the table doubles whenever the load factor (including tombstones) would
/// exceed [`MAX_LOAD`].
pub struct Table {
    entries: Vec<Slot>,
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn hash_of(key: ObjRef) -> u32 {
        match &key.as_obj().data {
            crate::object::ObjData::String(s) => s.hash,
            _ => unreachable!("table keys are always interned strings"),
        }
    }

    fn find_slot(entries: &[Slot], capacity: usize, key: ObjRef) -> usize {
        let mut index = (Self::hash_of(key) as usize) % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) if *k == key => return index,
                Slot::Occupied(_, _) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Slot::Empty; 0];
        new_entries.resize_with(new_capacity, || Slot::Empty);
        let mut new_count = 0;
        for slot in self.entries.drain(..) {
            if let Slot::Occupied(k, v) = slot {
                let idx = Self::find_slot(&new_entries, new_capacity, k);
                new_entries[idx] = Slot::Occupied(k, v);
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    fn ensure_capacity(&mut self) {
        if self.entries.is_empty() {
            self.grow(8);
            return;
        }
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD {
            self.grow(self.entries.len() * 2);
        }
    }

    /// Reads `key`'s value. Returns `(found, value)`, mirroring the C
    /// original's out-parameter signature (§4.3).
    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.entries, self.entries.len(), key);
        match &self.entries[idx] {
            Slot::Occupied(_, v) => Some(*v),
            _ => None,
        }
    }

    /// Sets `key` to `value`, inserting a fresh entry if absent. Returns
    /// `true` when the key was new (§4.3).
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        self.ensure_capacity();
        let idx = Self::find_slot(&self.entries, self.entries.len(), key);
        let is_new = !matches!(self.entries[idx], Slot::Occupied(_, _));
        if is_new {
            self.count += 1;
        }
        self.entries[idx] = Slot::Occupied(key, value);
        is_new
    }

    /// Deletes `key`, leaving a tombstone behind so later probes still
    /// reach entries that hashed past it. Returns whether the key existed.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_slot(&self.entries, self.entries.len(), key);
        if matches!(self.entries[idx], Slot::Occupied(_, _)) {
            self.entries[idx] = Slot::Tombstone;
            self.count -= 1;
            true
        } else {
            false
        }
    }

    /// Copies every entry of `self` into `dst` (used by `INHERIT`, §4.6).
    pub fn add_all(&self, dst: &mut Table) {
        for slot in &self.entries {
            if let Slot::Occupied(k, v) = slot {
                dst.set(*k, *v);
            }
        }
    }

    /// Iterates over all occupied entries; used by the collector to mark
    /// keys and values (§4.5) and by the weak string sweep.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }

    /// Removes every entry whose key fails `keep`. Used by the intern
    /// table's weak sweep (unreachable strings are dropped from the
    /// canonicalization table before the object sweep frees them, §4.5
    /// step 3) when this table doubles as a string set.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for slot in &mut self.entries {
            if let Slot::Occupied(k, _) = slot {
                if !keep(*k) {
                    *slot = Slot::Tombstone;
                    self.count -= 1;
                }
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Clone for Slot {
    fn clone(&self) -> Self {
        match self {
            Slot::Empty => Slot::Empty,
            Slot::Tombstone => Slot::Tombstone,
            Slot::Occupied(k, v) => Slot::Occupied(*k, *v),
        }
    }
}
