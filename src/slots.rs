//! The slot table and its free lists.
//!
//! One slot per bat id, held in a two-level table: a fixed top array of
//! slab pointers, each slab a contiguous run of slots allocated on
//! demand. A slab never moves or frees until process teardown, so a
//! descriptor pointer obtained from a slot stays valid while the table
//! grows. Extension is serialised by the name-index lock.

use std::cell::UnsafeCell;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use fnv::FnvHasher;

use crate::common::BatStatus;
use crate::common::types::{
    BatId, FREE_SHARDS, MAX_BAT_ID, NIL_BAT, SLAB_COUNT, SLAB_SIZE,
};
use crate::desc::BatDesc;
use crate::errors::{PoolError, Result};

// Fields of a slot that only the holder of the swap-lock stripe for the
// slot's id may touch.
#[derive(Default)]
pub(crate) struct SlotBody {
    pub desc: Option<Box<BatDesc>>,
    pub options: Option<Box<str>>,
}

pub(crate) struct Slot {
    status: AtomicU32,
    refs: AtomicU32,
    lrefs: AtomicU32,
    shares: AtomicU32,
    /// Free-list link while free, hash-chain link while named.
    pub(crate) next: AtomicU32,
    /// Creator attribution for debugging.
    pub(crate) pid: AtomicU64,
    body: UnsafeCell<SlotBody>,
    /// Logical name; None renders the default temporary name. Guarded by
    /// the name-index lock.
    name: UnsafeCell<Option<Box<str>>>,
}

// The cells are guarded by the swap-lock stripe (body) and the
// name-index lock (name); the rest is atomic.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Slot {
            status: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            lrefs: AtomicU32::new(0),
            shares: AtomicU32::new(0),
            next: AtomicU32::new(NIL_BAT),
            pid: AtomicU64::new(0),
            body: UnsafeCell::new(SlotBody::default()),
            name: UnsafeCell::new(None),
        }
    }

    pub(crate) fn status(&self) -> BatStatus {
        BatStatus::from_bits_retain(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn status_on(&self, bits: BatStatus) {
        self.status.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn status_off(&self, bits: BatStatus) {
        self.status.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn status_set(&self, bits: BatStatus) {
        self.status.store(bits.bits(), Ordering::Release);
    }

    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn lrefs(&self) -> u32 {
        self.lrefs.load(Ordering::Acquire)
    }

    pub(crate) fn shares(&self) -> u32 {
        self.shares.load(Ordering::Acquire)
    }

    // Counter writes happen under the swap-lock stripe; the atomics only
    // make the unlocked reads above well defined.
    pub(crate) fn refs_add(&self, n: i32) -> u32 {
        if n >= 0 {
            self.refs.fetch_add(n as u32, Ordering::AcqRel) + n as u32
        } else {
            self.refs.fetch_sub((-n) as u32, Ordering::AcqRel) - (-n) as u32
        }
    }

    pub(crate) fn lrefs_add(&self, n: i32) -> u32 {
        if n >= 0 {
            self.lrefs.fetch_add(n as u32, Ordering::AcqRel) + n as u32
        } else {
            self.lrefs.fetch_sub((-n) as u32, Ordering::AcqRel) - (-n) as u32
        }
    }

    pub(crate) fn shares_add(&self, n: i32) -> u32 {
        if n >= 0 {
            self.shares.fetch_add(n as u32, Ordering::AcqRel) + n as u32
        } else {
            self.shares.fetch_sub((-n) as u32, Ordering::AcqRel) - (-n) as u32
        }
    }

    /// Zeroes every counter when a slot is installed or cleared.
    pub(crate) fn reset_counters(&self) {
        self.refs.store(0, Ordering::Release);
        self.lrefs.store(0, Ordering::Release);
        self.shares.store(0, Ordering::Release);
    }

    /// Debug attribution: which thread created the current tenant.
    #[allow(dead_code)]
    pub(crate) fn creator(&self) -> u64 {
        self.pid.load(Ordering::Relaxed)
    }

    /// Access to the swap-lock-guarded part of the slot.
    ///
    /// # Safety
    /// The caller must hold the swap-lock stripe for this slot's id.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn body(&self) -> &mut SlotBody {
        unsafe { &mut *self.body.get() }
    }

    /// Access to the logical name.
    ///
    /// # Safety
    /// The caller must hold the name-index lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn name(&self) -> &mut Option<Box<str>> {
        unsafe { &mut *self.name.get() }
    }

    /// The descriptor, if any.
    ///
    /// # Safety
    /// The caller must hold the swap-lock stripe, or a memory reference
    /// that pins the descriptor in place.
    pub(crate) unsafe fn desc(&self) -> Option<&BatDesc> {
        unsafe { (*self.body.get()).desc.as_deref() }
    }
}

pub(crate) struct SlotArena {
    slabs: Box<[OnceLock<Box<[Slot]>>]>,
    /// One past the last allocated slot; never shrinks.
    limit: AtomicU32,
    /// One past the highest id in use (the BBPsize of the directory).
    size: AtomicU32,
}

impl SlotArena {
    pub(crate) fn new() -> Self {
        let slabs: Vec<OnceLock<Box<[Slot]>>> =
            (0..SLAB_COUNT).map(|_| OnceLock::new()).collect();
        let arena = SlotArena {
            slabs: slabs.into_boxed_slice(),
            limit: AtomicU32::new(0),
            size: AtomicU32::new(1),
        };
        // slab 0 is always present so id 1 is available from the start
        arena.slabs[0].get_or_init(new_slab);
        arena.limit.store(SLAB_SIZE as u32, Ordering::Release);
        arena
    }

    pub(crate) fn limit(&self) -> BatId {
        self.limit.load(Ordering::Acquire)
    }

    pub(crate) fn size(&self) -> BatId {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, size: BatId) {
        self.size.store(size, Ordering::Release);
    }

    /// Raises size to cover `id`.
    pub(crate) fn bump_size(&self, id: BatId) {
        self.size.fetch_max(id + 1, Ordering::AcqRel);
    }

    pub(crate) fn get(&self, id: BatId) -> Option<&Slot> {
        if id == NIL_BAT || id >= self.limit() {
            return None;
        }
        let slab = self.slabs[id as usize / SLAB_SIZE].get()?;
        Some(&slab[id as usize % SLAB_SIZE])
    }

    /// Allocates the next slab. The caller holds the name-index lock,
    /// which serialises extension.
    pub(crate) fn extend(&self) -> Result<BatId> {
        let limit = self.limit();
        let slab_no = limit as usize / SLAB_SIZE;
        if slab_no >= SLAB_COUNT {
            return Err(PoolError::IdOverflow);
        }
        self.slabs[slab_no].get_or_init(new_slab);
        let new_limit = limit + SLAB_SIZE as u32;
        self.limit.store(new_limit, Ordering::Release);
        Ok(new_limit)
    }
}

fn new_slab() -> Box<[Slot]> {
    (0..SLAB_SIZE).map(|_| Slot::new()).collect()
}

// A shard of the free list. Slots are chained through their `next`
// field; the head is the lowest id pushed last.
#[derive(Default)]
pub(crate) struct FreeShard {
    pub(crate) head: BatId,
    pub(crate) len: usize,
}

impl FreeShard {
    pub(crate) fn push(&mut self, arena: &SlotArena, id: BatId) {
        let slot = arena.get(id).expect("freed id within limit");
        slot.next.store(self.head, Ordering::Release);
        self.head = id;
        self.len += 1;
    }

    pub(crate) fn pop(&mut self, arena: &SlotArena) -> Option<BatId> {
        if self.head == NIL_BAT {
            return None;
        }
        let id = self.head;
        let slot = arena.get(id).expect("free head within limit");
        self.head = slot.next.load(Ordering::Acquire);
        slot.next.store(NIL_BAT, Ordering::Release);
        self.len -= 1;
        Some(id)
    }
}

/// The free-list shard serving the calling thread.
pub(crate) fn shard_for_thread() -> usize {
    let mut h = FnvHasher::default();
    std::thread::current().id().hash(&mut h);
    (h.finish() as usize) & (FREE_SHARDS - 1)
}

// Guard against a configuration where ids could outgrow the table.
const _: () = assert!(SLAB_COUNT * SLAB_SIZE - 1 == MAX_BAT_ID as usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_get_bounds() {
        let arena = SlotArena::new();
        assert!(arena.get(0).is_none());
        assert!(arena.get(1).is_some());
        assert!(arena.get(SLAB_SIZE as u32 - 1).is_some());
        assert!(arena.get(SLAB_SIZE as u32).is_none());
    }

    #[test]
    fn test_extend_keeps_pointers() -> Result<()> {
        let arena = SlotArena::new();
        let before = arena.get(17).unwrap() as *const Slot;
        let new_limit = arena.extend()?;
        assert_eq!(new_limit, 2 * SLAB_SIZE as u32);
        assert!(arena.get(SLAB_SIZE as u32).is_some());
        // the old slab did not move
        assert_eq!(arena.get(17).unwrap() as *const Slot, before);
        Ok(())
    }

    #[test]
    fn test_free_shard_lifo() {
        let arena = SlotArena::new();
        let mut shard = FreeShard::default();
        shard.push(&arena, 5);
        shard.push(&arena, 3);
        assert_eq!(shard.len, 2);
        assert_eq!(shard.pop(&arena), Some(3));
        assert_eq!(shard.pop(&arena), Some(5));
        assert_eq!(shard.pop(&arena), None);
    }

    #[test]
    fn test_status_bits() {
        let arena = SlotArena::new();
        let slot = arena.get(1).unwrap();
        slot.status_on(BatStatus::LOADED | BatStatus::HOT);
        assert!(slot.status().contains(BatStatus::LOADED));
        slot.status_off(BatStatus::HOT);
        assert_eq!(slot.status(), BatStatus::LOADED);
        slot.status_set(BatStatus::empty());
        assert!(slot.status().is_empty());
    }
}
