// File: src/table.rs
//
// Open-addressed hash table used for instance fields, class methods, the
// native registry, and the interned-string set.
// Linear probing, power-of-two capacities, 0.75 load factor, tombstones.
// Keys are interned strings, so key equality is handle equality; each
// entry caches the key's hash so resizing never has to consult the heap.

use crate::heap::Arena;
use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    // An empty slot has no key and a nil value; a tombstone has no key
    // and a true value.
    fn empty() -> Entry {
        Entry { key: None, hash: 0, value: Value::Nil }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

pub struct Table {
    entries: Vec<Entry>,
    count: usize, // live entries + tombstones
}

impl Table {
    pub fn new() -> Table {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn byte_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    /// Inserts or replaces. Returns true when the key was not already
    /// present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.entries.is_empty() {
            self.grow();
        }
        let mut index = self.find_slot(key, hash);
        let is_new = self.entries[index].key.is_none();
        if is_new && !self.entries[index].is_tombstone() {
            if (self.count + 1) * MAX_LOAD_DENOMINATOR
                > self.entries.len() * MAX_LOAD_NUMERATOR
            {
                // The slot index is stale after a resize; probe again.
                self.grow();
                index = self.find_slot(key, hash);
            }
            self.count += 1;
        }
        self.entries[index] = Entry { key: Some(key), hash, value };
        is_new
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = self.find_slot(key, hash);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Tombstones the entry. The count is not decremented because the
    /// tombstone still participates in probe sequences.
    pub fn remove(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.find_slot(key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry { key: None, hash: 0, value: Value::Bool(true) };
        true
    }

    /// Copies every live entry of `from` into this table. Used by
    /// inheritance to seed a subclass method table.
    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Deduplicating lookup for the intern set: finds a key whose bytes
    /// equal `chars` even though the caller holds no key object yet.
    pub fn find_string(&self, arena: &Arena, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && arena.string(key).chars == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// GC support: drops every entry whose key did not survive the mark
    /// phase. This is what makes the intern set hold weak keys.
    pub fn remove_unmarked_keys(&mut self, arena: &Arena) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !arena.is_marked(key) {
                    *entry = Entry { key: None, hash: 0, value: Value::Bool(true) };
                }
            }
        }
    }

    // Returns the slot holding `key`, or the slot an insertion should
    // use (the first tombstone on the probe path, else the empty slot).
    fn find_slot(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(existing) => {
                    if existing == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    // Doubles the capacity and re-probes every live entry. Tombstones
    // are dropped, restoring the count to live entries only.
    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![Entry::empty(); new_capacity]);
        self.count = 0;
        let mask = new_capacity - 1;
        for entry in old {
            if entry.key.is_none() {
                continue;
            }
            let mut index = entry.hash as usize & mask;
            while self.entries[index].key.is_some() {
                index = (index + 1) & mask;
            }
            self.entries[index] = entry;
            self.count += 1;
        }
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Probing and resizing never look at the heap, so tests can use
    // fabricated handles and hashes.
    fn key(id: u32) -> ObjRef {
        ObjRef(id)
    }

    #[test]
    fn set_then_get() {
        let mut table = Table::new();
        assert!(table.set(key(1), 42, Value::Number(1.0)));
        assert_eq!(table.get(key(1), 42), Some(Value::Number(1.0)));
        assert!(!table.set(key(1), 42, Value::Number(2.0)));
        assert_eq!(table.get(key(1), 42), Some(Value::Number(2.0)));
    }

    #[test]
    fn remove_leaves_tombstone_probe_path_intact() {
        let mut table = Table::new();
        // Three keys that all collide on the same initial slot.
        table.set(key(1), 8, Value::Number(1.0));
        table.set(key(2), 16, Value::Number(2.0));
        table.set(key(3), 24, Value::Number(3.0));
        assert!(table.remove(key(2), 16));
        assert_eq!(table.get(key(3), 24), Some(Value::Number(3.0)));
        assert_eq!(table.get(key(2), 16), None);
        assert!(!table.remove(key(2), 16));
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let mut table = Table::new();
        table.set(key(1), 8, Value::Number(1.0));
        table.set(key(2), 16, Value::Number(2.0));
        table.remove(key(1), 8);
        table.set(key(3), 8, Value::Number(3.0));
        assert_eq!(table.get(key(3), 8), Some(Value::Number(3.0)));
        assert_eq!(table.get(key(2), 16), Some(Value::Number(2.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i), i.wrapping_mul(2654435761), Value::Number(i as f64));
        }
        assert!(table.capacity() >= 128);
        for i in 0..100 {
            assert_eq!(
                table.get(key(i), i.wrapping_mul(2654435761)),
                Some(Value::Number(i as f64))
            );
        }
    }

    #[test]
    fn resize_drops_tombstones() {
        let mut table = Table::new();
        for i in 0..6 {
            table.set(key(i), i, Value::Nil);
        }
        for i in 0..6 {
            table.remove(key(i), i);
        }
        for i in 10..16 {
            table.set(key(i), i, Value::Nil);
        }
        assert_eq!(table.live_count(), 6);
    }

    #[test]
    fn add_all_copies_live_entries() {
        let mut from = Table::new();
        from.set(key(1), 1, Value::Number(1.0));
        from.set(key(2), 2, Value::Number(2.0));
        from.remove(key(1), 1);

        let mut to = Table::new();
        to.add_all(&from);
        assert_eq!(to.get(key(2), 2), Some(Value::Number(2.0)));
        assert_eq!(to.get(key(1), 1), None);
    }
}
