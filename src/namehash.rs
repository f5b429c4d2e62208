//! The logical-name index.
//!
//! An open-chained hash table from logical name to bat id; chain links
//! reuse the slot's `next` field. All access happens under the pool's
//! name-index lock, which also guards the name cell of every slot.
//! Default temporary names (`tmp_<octal-id>`) resolve by parsing and are
//! never inserted here.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::common::types::{BatId, NIL_BAT};
use crate::common::{parse_tmp_name, tmp_name};
use crate::slots::SlotArena;

pub(crate) struct NameHash {
    buckets: Vec<BatId>,
    mask: usize,
}

fn hash_name(name: &str) -> u64 {
    let mut h = FnvHasher::default();
    h.write(name.as_bytes());
    h.finish()
}

impl NameHash {
    /// A table sized to the next power of two covering `limit` slots.
    pub(crate) fn new(limit: u32) -> Self {
        let n = (limit as usize).next_power_of_two().max(1024);
        NameHash {
            buckets: vec![NIL_BAT; n],
            mask: n - 1,
        }
    }

    fn bucket(&self, name: &str) -> usize {
        hash_name(name) as usize & self.mask
    }

    /// Inserts a named slot. The slot's name cell must already carry the
    /// name.
    ///
    /// The caller holds the name-index lock.
    pub(crate) fn insert(&mut self, arena: &SlotArena, name: &str, id: BatId) {
        let b = self.bucket(name);
        let slot = arena.get(id).expect("hashed id within limit");
        slot.next
            .store(self.buckets[b], std::sync::atomic::Ordering::Release);
        self.buckets[b] = id;
    }

    /// Unlinks `id` from the chain of `name`.
    ///
    /// The caller holds the name-index lock.
    pub(crate) fn remove(&mut self, arena: &SlotArena, name: &str, id: BatId) {
        let b = self.bucket(name);
        let mut cursor = self.buckets[b];
        let mut prev: Option<BatId> = None;
        while cursor != NIL_BAT {
            let slot = arena.get(cursor).expect("chained id within limit");
            let next = slot.next.load(std::sync::atomic::Ordering::Acquire);
            if cursor == id {
                match prev {
                    None => self.buckets[b] = next,
                    Some(p) => {
                        let pslot = arena.get(p).expect("chained id within limit");
                        pslot
                            .next
                            .store(next, std::sync::atomic::Ordering::Release);
                    }
                }
                slot.next
                    .store(NIL_BAT, std::sync::atomic::Ordering::Release);
                return;
            }
            prev = Some(cursor);
            cursor = next;
        }
    }

    /// Resolves a logical name to its id, nil when absent. Temporary
    /// names short-circuit to their id without touching the table.
    ///
    /// The caller holds the name-index lock.
    pub(crate) fn lookup(&self, arena: &SlotArena, name: &str) -> BatId {
        if let Some(id) = parse_tmp_name(name) {
            return match arena.get(id) {
                Some(slot) if !slot.status().is_empty() => id,
                _ => NIL_BAT,
            };
        }
        let mut cursor = self.buckets[self.bucket(name)];
        while cursor != NIL_BAT {
            let slot = arena.get(cursor).expect("chained id within limit");
            let slot_name = unsafe { slot.name() };
            match slot_name {
                Some(n) if n.as_ref() == name => return cursor,
                None if tmp_name(cursor) == name => return cursor,
                _ => {}
            }
            cursor = slot.next.load(std::sync::atomic::Ordering::Acquire);
        }
        NIL_BAT
    }

    /// Regrows the table after the slot table extended. Rebuilds every
    /// chain from the slots' name cells.
    ///
    /// The caller holds the name-index lock.
    pub(crate) fn rehash(&mut self, arena: &SlotArena, limit: u32) {
        let wanted = (limit as usize).next_power_of_two().max(1024);
        if wanted <= self.buckets.len() {
            return;
        }
        let mut grown = NameHash {
            buckets: vec![NIL_BAT; wanted],
            mask: wanted - 1,
        };
        for b in 0..self.buckets.len() {
            let mut cursor = self.buckets[b];
            while cursor != NIL_BAT {
                let slot = arena.get(cursor).expect("chained id within limit");
                let next = slot.next.load(std::sync::atomic::Ordering::Acquire);
                if let Some(name) = unsafe { slot.name() }.clone() {
                    grown.insert(arena, &name, cursor);
                }
                cursor = next;
            }
        }
        *self = grown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BatStatus;

    fn named(arena: &SlotArena, table: &mut NameHash, id: BatId, name: &str) {
        let slot = arena.get(id).unwrap();
        slot.status_on(BatStatus::LOADED);
        *unsafe { slot.name() } = Some(name.into());
        table.insert(arena, name, id);
    }

    #[test]
    fn test_insert_lookup_remove() {
        let arena = SlotArena::new();
        let mut table = NameHash::new(arena.limit());
        named(&arena, &mut table, 1, "a");
        named(&arena, &mut table, 2, "b");

        assert_eq!(table.lookup(&arena, "a"), 1);
        assert_eq!(table.lookup(&arena, "b"), 2);
        assert_eq!(table.lookup(&arena, "c"), 0);

        table.remove(&arena, "a", 1);
        assert_eq!(table.lookup(&arena, "a"), 0);
        assert_eq!(table.lookup(&arena, "b"), 2);
    }

    #[test]
    fn test_tmp_short_circuit() {
        let arena = SlotArena::new();
        let table = NameHash::new(arena.limit());
        // id 5 live, never hashed
        arena.get(5).unwrap().status_on(BatStatus::LOADED);
        assert_eq!(table.lookup(&arena, &tmp_name(5)), 5);
        // id 6 empty
        assert_eq!(table.lookup(&arena, &tmp_name(6)), 0);
    }

    #[test]
    fn test_chain_removal_middle() {
        let arena = SlotArena::new();
        let mut table = NameHash::new(arena.limit());
        // force one bucket by using the same table twice after rehash is
        // out of the picture: insert three, remove the middle by id
        named(&arena, &mut table, 1, "x");
        named(&arena, &mut table, 2, "y");
        named(&arena, &mut table, 3, "z");
        table.remove(&arena, "y", 2);
        assert_eq!(table.lookup(&arena, "x"), 1);
        assert_eq!(table.lookup(&arena, "y"), 0);
        assert_eq!(table.lookup(&arena, "z"), 3);
    }

    #[test]
    fn test_rehash_preserves_entries() {
        let arena = SlotArena::new();
        let mut table = NameHash::new(16);
        for (id, name) in [(1, "one"), (2, "two"), (3, "three")] {
            named(&arena, &mut table, id, name);
        }
        table.rehash(&arena, arena.limit());
        for (id, name) in [(1, "one"), (2, "two"), (3, "three")] {
            assert_eq!(table.lookup(&arena, name), id);
        }
    }
}
