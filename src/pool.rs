//! The buffer pool proper.
//!
//! The pool is the process-wide directory and residency manager for
//! bats: it maps ids to descriptors, counts memory and logical
//! references, lazily materialises descriptors from disk, evicts cold
//! clean bats under memory pressure, and keeps the on-disk image
//! consistent through the commit machinery.
//!
//! All the functions on the pool return `NoSuchBat` when handed an id
//! with no live slot. Status and counter writes go through the swap-lock
//! stripe of the id; waits on a status bit release the stripe, sleep
//! briefly and re-test. Lock order is swap stripe, then name index, then
//! free shard; the global quiescence guard takes everything in that
//! order after waiting out in-flight unloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::atom::{AtomId, atoms};
use crate::common::types::{
    BAT_MASK, BatId, DEFAULT_VM_CAP, FREE_SHARDS, MAX_NAME_LEN, NIL_BAT, SPIN,
};
use crate::common::{BatStatus, parse_tmp_name, physical_name, tmp_name};
use crate::desc::BatDesc;
use crate::errors::{PoolError, Result};
use crate::farm::{FarmRole, Farms};
use crate::namehash::NameHash;
use crate::slots::{FreeShard, SlotArena, shard_for_thread};
use crate::trim::TrimControl;

/// Options that can be set when creating a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Cap on resident heap bytes; above half of it, unfix starts
    /// evicting clean persistent bats. Zero disables pressure eviction.
    pub vm_cap: usize,

    /// Run the background trimmer thread.
    pub trimmer: bool,

    /// Map clean persistent heaps read-only instead of copying them.
    pub map_clean_heaps: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            vm_cap: *DEFAULT_VM_CAP,
            trimmer: true,
            map_clean_heaps: true,
        }
    }
}

// The BBPinfo pair recorded in the directory header.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DirInfo {
    pub logno: u64,
    pub transid: u64,
}

// Staged-backup bookkeeping for the commit machinery.
#[derive(Default)]
pub(crate) struct CommitState {
    /// Files staged since the backup directory was created.
    pub files: usize,
    pub dir: bool,
    pub subdir: bool,
}

/// Operation counters, updated without locks.
#[derive(Default)]
pub struct PoolStats {
    pub(crate) loads: AtomicU64,
    pub(crate) unloads: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) commits: AtomicU64,
}

impl PoolStats {
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
    pub fn unloads(&self) -> u64 {
        self.unloads.load(Ordering::Relaxed)
    }
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

pub(crate) struct RawPool {
    pub(crate) arena: SlotArena,
    swap: Vec<Mutex<()>>,
    free: Vec<Mutex<FreeShard>>,
    pub(crate) names: Mutex<NameHash>,
    pub(crate) farms: Mutex<Farms>,

    // held for the duration of a commit, recovery, or init
    pub(crate) sync_lock: Mutex<()>,
    pub(crate) commit_state: Mutex<CommitState>,
    pub(crate) info: Mutex<DirInfo>,

    unloads: Mutex<usize>,
    unloads_cv: Condvar,

    pub(crate) vm_in_use: AtomicUsize,
    pub(crate) opts: PoolOptions,
    pub(crate) stats: PoolStats,

    pub(crate) trim: TrimControl,
    trim_handle: Mutex<Option<thread::JoinHandle<()>>>,
    initialized: AtomicBool,
}

unsafe impl Send for RawPool {}
unsafe impl Sync for RawPool {}

/// The pool handle. Clones share one pool.
#[derive(Clone)]
pub struct Bbp(pub(crate) Arc<RawPool>);

impl Bbp {
    pub fn new(opts: PoolOptions) -> Self {
        let arena = SlotArena::new();
        let free: Vec<Mutex<FreeShard>> = (0..FREE_SHARDS)
            .map(|_| Mutex::new(FreeShard::default()))
            .collect();
        let pool = Bbp(Arc::new(RawPool {
            names: Mutex::new(NameHash::new(arena.limit())),
            arena,
            swap: (0..=BAT_MASK).map(|_| Mutex::new(())).collect(),
            free,
            farms: Mutex::new(Farms::new()),
            sync_lock: Mutex::new(()),
            commit_state: Mutex::new(CommitState::default()),
            info: Mutex::new(DirInfo::default()),
            unloads: Mutex::new(0),
            unloads_cv: Condvar::new(),
            vm_in_use: AtomicUsize::new(0),
            opts,
            stats: PoolStats::default(),
            trim: TrimControl::default(),
            trim_handle: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }));
        pool.0.rebuild_free_lists();
        pool
    }

    /// Registers a storage farm. Must be called before `init`.
    pub fn add_farm(&self, dir: &Path, roles: FarmRole) -> Result<()> {
        if self.0.initialized.load(Ordering::Acquire) {
            return Err(PoolError::Unexpected("add_farm after init"));
        }
        self.0.farms.lock().add(dir, roles)
    }

    /// Brings the pool up: locks the farms, recovers from any
    /// interrupted commit, reads the directory, and starts the trimmer.
    pub fn init(&self) -> Result<()> {
        let p = &self.0;
        if p.initialized.swap(true, Ordering::AcqRel) {
            return Err(PoolError::Unexpected("pool already initialised"));
        }
        let res = self.init_inner();
        if res.is_err() {
            p.initialized.store(false, Ordering::Release);
        }
        res
    }

    fn init_inner(&self) -> Result<()> {
        let p = &self.0;
        {
            let mut farms = p.farms.lock();
            if farms.is_empty() {
                return Err(PoolError::NoFarm);
            }
            farms.lock_all()?;
        }
        let root = p.persistent_root()?;
        let _sync = p.sync_lock.lock();

        crate::recovery::recover(&root)?;

        let dir_path = root.join("BBP.dir");
        if !dir_path.exists() {
            info!("first-time initialisation of {}", root.display());
            crate::dirfile::write_fresh(&root, 1, &DirInfo::default())?;
        }
        let manifest = crate::dirfile::read_dir(&root)?;
        {
            let mut names = p.names.lock();
            while p.arena.limit() < manifest.header.size {
                let new_limit = p.arena.extend()?;
                names.rehash(&p.arena, new_limit);
            }
        }
        for entry in &manifest.entries {
            p.install_from_entry(entry)?;
        }
        p.arena.set_size(manifest.header.size.max(1));
        *p.info.lock() = DirInfo {
            logno: manifest.header.logno,
            transid: manifest.header.transid,
        };
        p.rebuild_free_lists();
        p.diskscan(&root)?;
        debug!(
            "pool up: {} slots, {} persistent bats, logno {}, transid {}",
            p.arena.size(),
            manifest.entries.len(),
            manifest.header.logno,
            manifest.header.transid
        );
        if p.opts.trimmer {
            let weak = Arc::downgrade(&self.0);
            let handle = thread::Builder::new()
                .name("bbptrim".to_string())
                .spawn(move || crate::trim::trimmer_loop(weak))
                .map_err(|e| PoolError::Io(e.to_string()))?;
            *p.trim_handle.lock() = Some(handle);
        }
        Ok(())
    }

    /// Shuts the pool down: stops the trimmer and releases the farms.
    /// Dirty uncommitted state is abandoned; the last commit wins.
    pub fn exit(&self) {
        let p = &self.0;
        p.stop_trimmer();
        p.wait_unloads();
        p.farms.lock().unlock_all();
        p.initialized.store(false, Ordering::Release);
    }

    ///////////////////////////////////////////////////////////////////////
    // Creation and destruction.
    ///////////////////////////////////////////////////////////////////////

    /// Creates a transient bat of the given type, returning its id. The
    /// bat starts with one memory reference and no logical references.
    pub fn insert(&self, ttype: AtomId, capacity: u64) -> Result<BatId> {
        self.0.ensure_init()?;
        let id = self.0.alloc_id()?;
        let stem = physical_name(id);
        let desc = Box::new(BatDesc::new(id, ttype, capacity, &stem));
        self.0.install(id, desc)
    }

    /// Creates a view borrowing the heaps of `parent`. The view's
    /// creation reference pins the parent the way any first memory
    /// reference to a view does.
    pub fn insert_view(&self, parent: BatId) -> Result<BatId> {
        self.0.ensure_init()?;
        self.share(parent)?;
        let res = (|| {
            self.0.incref(parent, false)?;
            let id = self.0.alloc_id()?;
            let stem = physical_name(id);
            let pdesc = self.quickdesc(parent).ok_or(PoolError::NoSuchBat(parent))?;
            let desc = Box::new(BatDesc::view_of(id, pdesc, &stem));
            self.0.install(id, desc)
        })();
        if res.is_err() {
            let _ = self.unshare(parent);
        }
        res
    }

    ///////////////////////////////////////////////////////////////////////
    // Reference counting.
    ///////////////////////////////////////////////////////////////////////

    /// Takes a memory reference; returns the new count.
    pub fn fix(&self, id: BatId) -> Result<u32> {
        self.0.incref(id, false)
    }

    /// Drops a memory reference; returns the remaining count. The last
    /// unfix may evict or destroy the bat.
    pub fn unfix(&self, id: BatId) -> Result<u32> {
        self.0.decref(id, false)
    }

    /// Takes a logical reference; returns the new count.
    pub fn retain(&self, id: BatId) -> Result<u32> {
        self.0.incref(id, true)
    }

    /// Drops a logical reference; returns the remaining count.
    pub fn release(&self, id: BatId) -> Result<u32> {
        self.0.decref(id, true)
    }

    /// Converts one memory reference into one logical reference, the
    /// retain strictly first so the bat never goes through a both-zero
    /// window.
    pub fn keepref(&self, id: BatId) -> Result<()> {
        let p = &self.0;
        let slot = p.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        {
            let _g = p.swap_guard(id);
            if unsafe { slot.desc() }.is_none() {
                return Err(PoolError::NoSuchBat(id));
            }
            slot.lrefs_add(1);
            slot.status_on(BatStatus::HOT);
        }
        p.decref(id, false)?;
        Ok(())
    }

    /// Registers a borrower of this bat's heaps, taking one logical
    /// reference along with the share.
    pub fn share(&self, id: BatId) -> Result<u32> {
        let p = &self.0;
        let slot = p.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let _g = p.lock_clear(id, BatStatus::UNSTABLE);
        if unsafe { slot.desc() }.is_none() {
            return Err(PoolError::NoSuchBat(id));
        }
        slot.lrefs_add(1);
        Ok(slot.shares_add(1))
    }

    /// Returns a borrow taken with `share`.
    pub fn unshare(&self, id: BatId) -> Result<u32> {
        self.0.unshare_raw(id)
    }

    ///////////////////////////////////////////////////////////////////////
    // Descriptor access.
    ///////////////////////////////////////////////////////////////////////

    /// The loaded descriptor, materialising it from disk if necessary.
    ///
    /// The returned reference stays valid for as long as the caller
    /// holds a memory reference on `id`; slabs never move.
    pub fn descriptor(&self, id: BatId) -> Result<&BatDesc> {
        let p = &self.0;
        let slot = p.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        if slot.status().contains(BatStatus::LOADED) {
            if let Some(desc) = unsafe { slot.desc() } {
                return Ok(desc);
            }
        }
        p.load_bat(id)?;
        unsafe { slot.desc() }.ok_or(PoolError::NoSuchBat(id))
    }

    /// The descriptor metadata without loading any heap.
    pub fn quickdesc(&self, id: BatId) -> Option<&BatDesc> {
        let slot = self.0.arena.get(id)?;
        unsafe { slot.desc() }
    }

    /// Resolves a logical name; nil when absent.
    pub fn lookup(&self, name: &str) -> BatId {
        let p = &self.0;
        if let Some(id) = parse_tmp_name(name) {
            return match p.arena.get(id) {
                Some(slot) if !slot.status().is_empty() => id,
                _ => NIL_BAT,
            };
        }
        let names = p.names.lock();
        names.lookup(&p.arena, name)
    }

    /// The logical name of a bat.
    pub fn logical_name(&self, id: BatId) -> Option<String> {
        let p = &self.0;
        let slot = p.arena.get(id)?;
        if slot.status().is_empty() {
            return None;
        }
        let _names = p.names.lock();
        Some(match unsafe { slot.name() } {
            Some(n) => n.to_string(),
            None => tmp_name(id),
        })
    }

    /// Reads one fixed-width value, resolving views to their parent.
    pub fn fixed_value<T: bytemuck::Pod>(&self, id: BatId, pos: u64) -> Option<T> {
        let desc = self.quickdesc(id)?;
        match desc.view_parent() {
            None => desc.fixed_value(pos),
            Some(parent) => {
                if pos >= desc.count() {
                    return None;
                }
                self.fixed_value(parent, pos)
            }
        }
    }

    /// Attaches an opaque option string; it is persisted verbatim with
    /// the bat's manifest entry.
    pub fn set_options(&self, id: BatId, options: Option<&str>) -> Result<()> {
        let p = &self.0;
        let slot = p.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let _g = p.swap_guard(id);
        if unsafe { slot.desc() }.is_none() {
            return Err(PoolError::NoSuchBat(id));
        }
        unsafe { slot.body() }.options = options.map(Box::from);
        Ok(())
    }

    pub fn options(&self, id: BatId) -> Option<String> {
        let p = &self.0;
        let slot = p.arena.get(id)?;
        let _g = p.swap_guard(id);
        unsafe { slot.body() }.options.as_ref().map(|o| o.to_string())
    }

    ///////////////////////////////////////////////////////////////////////
    // Naming.
    ///////////////////////////////////////////////////////////////////////

    /// Gives the bat a new logical name. A temporary-form name must be
    /// the bat's own default name, anything else must be unused.
    pub fn rename(&self, id: BatId, new: &str) -> Result<()> {
        let p = &self.0;
        let slot = p.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        if new.len() > MAX_NAME_LEN {
            return Err(PoolError::NameTooLong);
        }
        if new.is_empty()
            || new
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
        {
            return Err(PoolError::NameIllegal(new.to_string()));
        }
        let _g = p.swap_guard(id);
        if unsafe { slot.desc() }.is_none() {
            return Err(PoolError::NoSuchBat(id));
        }
        let mut names = p.names.lock();
        match parse_tmp_name(new) {
            Some(tmp_id) if tmp_id != id => {
                return Err(PoolError::NameIllegal(new.to_string()));
            }
            Some(_) => {
                // back to the default temporary name
                if let Some(old) = unsafe { slot.name() }.take() {
                    names.remove(&p.arena, &old, id);
                }
            }
            None => {
                let holder = names.lookup(&p.arena, new);
                if holder == id {
                    return Ok(());
                }
                if holder != NIL_BAT {
                    return Err(PoolError::NameExists(new.to_string()));
                }
                if let Some(old) = unsafe { slot.name() }.take() {
                    names.remove(&p.arena, &old, id);
                }
                *unsafe { slot.name() } = Some(new.into());
                names.insert(&p.arena, new, id);
            }
        }
        // the stripe of the renamed id is held here
        if slot.status().contains(BatStatus::PERSISTENT) {
            slot.status_on(BatStatus::RENAMED);
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Residency policy.
    ///////////////////////////////////////////////////////////////////////

    /// Clears the hot bit so the trimmer may take the bat next round.
    pub fn cold(&self, id: BatId) {
        if let Some(slot) = self.0.arena.get(id) {
            slot.status_off(BatStatus::HOT);
        }
    }

    /// Caller-driven eviction. Ok(true) when the bat was unloaded,
    /// Ok(false) when it is pinned, busy, or not loaded.
    pub fn reclaim(&self, id: BatId) -> Result<bool> {
        let p = &self.0;
        let slot = p.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        {
            let _g = p.swap_guard(id);
            if unsafe { slot.desc() }.is_none() {
                return Err(PoolError::NoSuchBat(id));
            }
            let st = slot.status();
            if !st.contains(BatStatus::LOADED)
                || st.intersects(BatStatus::WAITING | BatStatus::SYNCING)
                || slot.refs() > 0
                || slot.shares() > 0
            {
                return Ok(false);
            }
            slot.status_on(BatStatus::UNLOADING);
            p.unload_begin();
        }
        p.unload(id)?;
        Ok(true)
    }

    /// Flags a bat persistent (entering the next commit) or transient
    /// again (files dropped at the next commit).
    pub fn set_persistent(&self, id: BatId, persistent: bool) -> Result<()> {
        let p = &self.0;
        let slot = p.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let mut dropped_lref = false;
        {
            let _g = p.lock_clear(id, BatStatus::UNSTABLE);
            let desc = unsafe { slot.desc() }.ok_or(PoolError::NoSuchBat(id))?;
            let st = slot.status();
            if persistent && !st.contains(BatStatus::PERSISTENT) {
                slot.status_on(BatStatus::PERSISTENT);
                slot.status_off(BatStatus::DELETED);
                if !st.contains(BatStatus::EXISTING) {
                    slot.status_on(BatStatus::NEW);
                }
                slot.lrefs_add(1);
                let mut state = desc.state();
                // a swapped-out image follows its bat to the new farm
                let old_root = p.heap_root(state.tail.role)?;
                let new_root = p.heap_root(FarmRole::PERSISTENT)?;
                if old_root != new_root {
                    for heap in std::iter::once(&state.tail).chain(state.vheap.as_ref()) {
                        if !heap.loaded() && heap.free > 0 {
                            let dst = new_root.join(&heap.filename);
                            if let Some(dir) = dst.parent() {
                                std::fs::create_dir_all(dir)?;
                            }
                            std::fs::rename(old_root.join(&heap.filename), dst)?;
                        }
                    }
                }
                state.tail.role = FarmRole::PERSISTENT;
                if let Some(vh) = state.vheap.as_mut() {
                    vh.role = FarmRole::PERSISTENT;
                }
                state.desc_dirty = true;
            } else if !persistent && st.contains(BatStatus::PERSISTENT) {
                slot.status_off(BatStatus::PERSISTENT | BatStatus::NEW);
                if st.contains(BatStatus::EXISTING) {
                    slot.status_on(BatStatus::DELETED);
                }
                dropped_lref = true;
            }
        }
        if dropped_lref {
            self.0.decref(id, true)?;
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Global state.
    ///////////////////////////////////////////////////////////////////////

    /// Quiesces the whole pool: waits out in-flight unloads, then holds
    /// the name index, every free shard, and every swap stripe until the
    /// guard drops.
    pub fn lock_all(&self) -> PoolGuard<'_> {
        let p = &self.0;
        p.wait_unloads();
        let names = p.names.lock();
        let free = p.free.iter().map(|m| m.lock()).collect();
        let swap = p.swap.iter().map(|m| m.lock()).collect();
        PoolGuard {
            _names: names,
            _free: free,
            _swap: swap,
        }
    }

    /// One past the highest id in use.
    pub fn size(&self) -> BatId {
        self.0.arena.size()
    }

    pub fn logno(&self) -> u64 {
        self.0.info.lock().logno
    }

    pub fn transid(&self) -> u64 {
        self.0.info.lock().transid
    }

    pub fn vm_in_use(&self) -> usize {
        self.0.vm_in_use.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &PoolStats {
        &self.0.stats
    }

    /// Debug accessors for the per-slot counters.
    pub fn refs(&self, id: BatId) -> u32 {
        self.0.arena.get(id).map_or(0, |s| s.refs())
    }

    pub fn lrefs(&self, id: BatId) -> u32 {
        self.0.arena.get(id).map_or(0, |s| s.lrefs())
    }

    pub fn shares(&self, id: BatId) -> u32 {
        self.0.arena.get(id).map_or(0, |s| s.shares())
    }

    pub(crate) fn status(&self, id: BatId) -> BatStatus {
        self.0
            .arena
            .get(id)
            .map_or(BatStatus::empty(), |s| s.status())
    }

    /// Whether the slot is empty (free or never used).
    pub fn is_free(&self, id: BatId) -> bool {
        self.0.arena.get(id).is_none_or(|s| {
            s.status().is_empty() && unsafe { s.desc() }.is_none()
        })
    }
}

/// Holds the whole pool quiescent; dropping releases everything.
pub struct PoolGuard<'a> {
    _names: MutexGuard<'a, NameHash>,
    _free: Vec<MutexGuard<'a, FreeShard>>,
    _swap: Vec<MutexGuard<'a, ()>>,
}

impl RawPool {
    pub(crate) fn ensure_init(&self) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(PoolError::Unexpected("pool not initialised"));
        }
        Ok(())
    }

    pub(crate) fn swap_guard(&self, id: BatId) -> MutexGuard<'_, ()> {
        self.swap[id as usize & BAT_MASK].lock()
    }

    // Takes the stripe for id once none of the given bits is set,
    // sleeping briefly between attempts.
    pub(crate) fn lock_clear(&self, id: BatId, mask: BatStatus) -> MutexGuard<'_, ()> {
        loop {
            let g = self.swap_guard(id);
            let busy = self
                .arena
                .get(id)
                .is_some_and(|slot| slot.status().intersects(mask));
            if !busy {
                return g;
            }
            drop(g);
            thread::sleep(SPIN);
        }
    }

    pub(crate) fn persistent_root(&self) -> Result<PathBuf> {
        Ok(self.farms.lock().resolve(FarmRole::PERSISTENT)?.to_path_buf())
    }

    pub(crate) fn heap_root(&self, role: FarmRole) -> Result<PathBuf> {
        Ok(self.farms.lock().resolve(role)?.to_path_buf())
    }

    pub(crate) fn vm_pressure(&self) -> bool {
        self.opts.vm_cap > 0 && self.vm_in_use.load(Ordering::Relaxed) > self.opts.vm_cap / 2
    }

    ///////////////////////////////////////////////////////////////////////
    // Unload accounting. The quiescence guard and the commit wait for
    // in-flight unloads to drain.
    ///////////////////////////////////////////////////////////////////////

    pub(crate) fn unload_begin(&self) {
        *self.unloads.lock() += 1;
    }

    pub(crate) fn unload_end(&self) {
        let mut n = self.unloads.lock();
        *n -= 1;
        if *n == 0 {
            self.unloads_cv.notify_all();
        }
    }

    pub(crate) fn wait_unloads(&self) {
        let mut n = self.unloads.lock();
        while *n > 0 {
            self.unloads_cv.wait(&mut n);
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Id allocation.
    ///////////////////////////////////////////////////////////////////////

    fn alloc_id(&self) -> Result<BatId> {
        let shard = shard_for_thread();
        if let Some(id) = self.free[shard].lock().pop(&self.arena) {
            return Ok(id);
        }
        // steal from the longest other shard when it is worth it
        if FREE_SHARDS > 1 {
            let victim = (0..FREE_SHARDS)
                .filter(|&s| s != shard)
                .max_by_key(|&s| self.free[s].lock().len);
            if let Some(v) = victim {
                let mut vs = self.free[v].lock();
                if vs.len > crate::common::types::STEAL_THRESHOLD {
                    if let Some(id) = vs.pop(&self.arena) {
                        return Ok(id);
                    }
                }
            }
        }
        // grow the table; extension is serialised by the name lock
        let (old_limit, new_limit) = {
            let mut names = self.names.lock();
            let old = self.arena.limit();
            let new = self.arena.extend()?;
            names.rehash(&self.arena, new);
            (old, new)
        };
        for id in (old_limit.max(1)..new_limit).rev() {
            let s = id as usize & (FREE_SHARDS - 1);
            self.free[s].lock().push(&self.arena, id);
        }
        self.free[shard]
            .lock()
            .pop(&self.arena)
            .ok_or(PoolError::IdOverflow)
    }

    // Rebuilds every free shard from the slots not currently in use.
    pub(crate) fn rebuild_free_lists(&self) {
        for shard in &self.free {
            let mut s = shard.lock();
            s.head = NIL_BAT;
            s.len = 0;
        }
        for id in (1..self.arena.limit()).rev() {
            let Some(slot) = self.arena.get(id) else { continue };
            if slot.status().is_empty() && unsafe { slot.desc() }.is_none() {
                let s = id as usize & (FREE_SHARDS - 1);
                self.free[s].lock().push(&self.arena, id);
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Slot installation.
    ///////////////////////////////////////////////////////////////////////

    fn install(&self, id: BatId, desc: Box<BatDesc>) -> Result<BatId> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        {
            let _g = self.swap_guard(id);
            slot.status_set(BatStatus::DELETING | BatStatus::HOT);
            slot.reset_counters();
            slot.refs_add(1);
            slot.pid.store(thread_token(), Ordering::Relaxed);
            let resident = desc.state().resident();
            let body = unsafe { slot.body() };
            body.desc = Some(desc);
            body.options = None;
            self.vm_in_use.fetch_add(resident, Ordering::Relaxed);
            // creation complete: publish as loaded
            slot.status_set(BatStatus::LOADED | BatStatus::HOT);
        }
        self.arena.bump_size(id);
        trace!("insert bat {id}");
        Ok(id)
    }

    // Rebuilds a slot from a directory entry at init time.
    fn install_from_entry(&self, entry: &crate::dirfile::DirEntry) -> Result<()> {
        let id = entry.id;
        let slot = self.arena.get(id).ok_or(PoolError::IdOverflow)?;
        let desc = Box::new(entry.to_desc()?);
        {
            let _g = self.swap_guard(id);
            slot.reset_counters();
            slot.lrefs_add(1);
            let body = unsafe { slot.body() };
            body.desc = Some(desc);
            body.options = entry.options.as_deref().map(Box::from);
            slot.status_set(BatStatus::PERSISTENT | BatStatus::EXISTING);
        }
        if entry.logical != tmp_name(id) {
            let mut names = self.names.lock();
            *unsafe { slot.name() } = Some(entry.logical.as_str().into());
            names.insert(&self.arena, &entry.logical, id);
        }
        self.arena.bump_size(id);
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Reference counting core.
    ///////////////////////////////////////////////////////////////////////

    pub(crate) fn incref(&self, id: BatId, logical: bool) -> Result<u32> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        // the first memory reference to a view drags its parent in first
        let mut fixed_parent = NIL_BAT;
        if !logical && slot.refs() == 0 {
            let parent = {
                let _g = self.lock_clear(id, BatStatus::UNSTABLE);
                match unsafe { slot.desc() } {
                    Some(d) => d.view_parent().unwrap_or(NIL_BAT),
                    None => return Err(PoolError::NoSuchBat(id)),
                }
            };
            if parent != NIL_BAT {
                self.incref(parent, false)?;
                fixed_parent = parent;
            }
        }
        let g = self.lock_clear(id, BatStatus::UNSTABLE);
        if unsafe { slot.desc() }.is_none() {
            drop(g);
            if fixed_parent != NIL_BAT {
                let _ = self.decref(fixed_parent, false);
            }
            return Err(PoolError::NoSuchBat(id));
        }
        let n = if logical {
            slot.lrefs_add(1)
        } else {
            slot.status_on(BatStatus::HOT);
            slot.refs_add(1)
        };
        Ok(n)
    }

    pub(crate) fn decref(&self, id: BatId, logical: bool) -> Result<u32> {
        #[derive(PartialEq)]
        enum Action {
            None,
            Unload,
            Destroy,
        }
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let mut action = Action::None;
        let mut parent_to_unfix = NIL_BAT;
        let remaining;
        {
            let _g = self.swap_guard(id);
            if logical {
                if slot.lrefs() == 0 {
                    debug_assert!(false, "release without retain on bat {id}");
                    return Err(PoolError::RefBalance(id));
                }
                remaining = slot.lrefs_add(-1);
            } else {
                if slot.refs() == 0 {
                    debug_assert!(false, "unfix without fix on bat {id}");
                    return Err(PoolError::RefBalance(id));
                }
                remaining = slot.refs_add(-1);
                if remaining == 0 {
                    if let Some(desc) = unsafe { slot.desc() } {
                        parent_to_unfix = desc.view_parent().unwrap_or(NIL_BAT);
                    }
                }
            }
            let st = slot.status();
            if slot.refs() == 0
                && !st.intersects(
                    BatStatus::UNLOADING
                        | BatStatus::LOADING
                        | BatStatus::SAVING
                        | BatStatus::DELETING,
                )
                && unsafe { slot.desc() }.is_some()
            {
                if slot.lrefs() == 0 {
                    if !st.contains(BatStatus::DELETED) {
                        slot.status_on(BatStatus::UNLOADING);
                        self.unload_begin();
                        action = Action::Destroy;
                    }
                } else if st.contains(BatStatus::LOADED)
                    && st.contains(BatStatus::PERSISTENT)
                    && !st.intersects(BatStatus::SYNCING | BatStatus::HOT)
                    && slot.shares() == 0
                    && self.vm_pressure()
                {
                    let desc = unsafe { slot.desc() }.ok_or(PoolError::NoSuchBat(id))?;
                    if !desc.dirty() && desc.view_parent().is_none() {
                        slot.status_on(BatStatus::UNLOADING);
                        self.unload_begin();
                        action = Action::Unload;
                    }
                }
            }
        }
        match action {
            Action::Destroy => self.destroy(id)?,
            Action::Unload => {
                self.unload(id)?;
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            Action::None => {}
        }
        if parent_to_unfix != NIL_BAT {
            self.decref(parent_to_unfix, false)?;
        }
        Ok(remaining)
    }

    ///////////////////////////////////////////////////////////////////////
    // Loader / unloader / destroy.
    ///////////////////////////////////////////////////////////////////////

    pub(crate) fn load_bat(&self, id: BatId) -> Result<()> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        loop {
            let g = self.swap_guard(id);
            let st = slot.status();
            if st.intersects(BatStatus::WAITING) {
                drop(g);
                thread::sleep(SPIN);
                continue;
            }
            if st.contains(BatStatus::LOADED) {
                return Ok(());
            }
            if unsafe { slot.desc() }.is_none() {
                return Err(PoolError::NoSuchBat(id));
            }
            slot.status_on(BatStatus::LOADING);
            drop(g);

            let result = self.materialise(id);

            let _g = self.swap_guard(id);
            slot.status_off(BatStatus::LOADING);
            return match result {
                Ok(()) => {
                    slot.status_on(BatStatus::LOADED | BatStatus::HOT);
                    self.stats.loads.fetch_add(1, Ordering::Relaxed);
                    if cfg!(debug_assertions) {
                        if let Some(desc) = unsafe { slot.desc() } {
                            let st = desc.state();
                            debug_assert!(
                                st.count * st.width as u64 <= st.tail.free
                                    || st.tail.parent != id
                                    || st.width == 0
                            );
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }
    }

    // Reads the heaps in while LOADING is set on the slot. A view pins
    // and materialises its parent instead of owning bytes.
    fn materialise(&self, id: BatId) -> Result<()> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let desc = unsafe { slot.desc() }.ok_or(PoolError::NoSuchBat(id))?;
        if let Some(parent) = desc.view_parent() {
            // the share keeps the parent from unloading; a view never
            // owns bytes of its own
            return self.load_bat(parent);
        }
        let persistent = slot.status().contains(BatStatus::PERSISTENT);
        let mut st = desc.state();
        let root = self.heap_root(st.tail.role)?;
        let prefer_map = self.opts.map_clean_heaps && persistent;
        let mut resident = 0usize;
        if !st.tail.loaded() && st.tail.free > 0 {
            resident += st.tail.load(&root, prefer_map)?;
        }
        if let Some(vh) = st.vheap.as_mut() {
            if !vh.loaded() && vh.free > 0 {
                resident += vh.load(&root, prefer_map)?;
            }
        }
        self.vm_in_use.fetch_add(resident, Ordering::Relaxed);
        Ok(())
    }

    // Saves if needed, then drops the in-memory image. The caller set
    // UNLOADING and incremented the unload counter.
    pub(crate) fn unload(&self, id: BatId) -> Result<()> {
        let res = self.unload_inner(id);
        self.unload_end();
        res
    }

    fn unload_inner(&self, id: BatId) -> Result<()> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        // the descriptor is pinned: UNLOADING keeps destroy away
        let desc = unsafe { slot.desc() }.ok_or(PoolError::NoSuchBat(id))?;
        if desc.view_parent().is_none() {
            if desc.dirty() {
                self.save_bat(id, None)?;
            }
            let released = {
                let mut st = desc.state();
                let mut n = st.tail.release();
                if let Some(vh) = st.vheap.as_mut() {
                    n += vh.release();
                }
                n
            };
            desc.drop_hash();
            self.vm_in_use.fetch_sub(released, Ordering::Relaxed);
        }
        {
            let _g = self.swap_guard(id);
            slot.status_off(BatStatus::LOADED | BatStatus::UNLOADING);
        }
        self.stats.unloads.fetch_add(1, Ordering::Relaxed);
        trace!("unloaded bat {id}");
        Ok(())
    }

    // Tears the slot down completely: element unfix, heap files of
    // transients, name, counters. The caller set UNLOADING and
    // incremented the unload counter.
    pub(crate) fn destroy(&self, id: BatId) -> Result<()> {
        let res = self.destroy_inner(id);
        self.unload_end();
        res
    }

    fn destroy_inner(&self, id: BatId) -> Result<()> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let desc = {
            let _g = self.swap_guard(id);
            let body = unsafe { slot.body() };
            body.options = None;
            body.desc.take()
        };
        let mut parent_unshare = NIL_BAT;
        if let Some(desc) = &desc {
            match desc.view_parent() {
                Some(p) => parent_unshare = p,
                None => {
                    // typed elements may own resources; let the type
                    // release them one by one
                    if let Some(unfix) = atoms().unfix(desc.ttype()) {
                        let st = desc.state();
                        if st.tail.loaded() {
                            let width = st.width as usize;
                            for pos in 0..st.count as usize {
                                unfix(&st.tail.bytes()[pos * width..(pos + 1) * width]);
                            }
                        }
                    }
                    let (resident, files) = {
                        let st = desc.state();
                        let root = self.heap_root(st.tail.role)?;
                        let mut files = vec![root.join(&st.tail.filename)];
                        files.push(root.join(format!("{}.new", st.tail.filename)));
                        if let Some(vh) = &st.vheap {
                            files.push(root.join(&vh.filename));
                        }
                        let stem = physical_name(id);
                        files.push(root.join(format!("{stem}.thashb")));
                        files.push(root.join(format!("{stem}.thashl")));
                        (st.resident(), files)
                    };
                    self.vm_in_use.fetch_sub(resident, Ordering::Relaxed);
                    for f in files {
                        let _ = std::fs::remove_file(f);
                    }
                }
            }
        }
        {
            let mut names = self.names.lock();
            if let Some(old) = unsafe { slot.name() }.take() {
                names.remove(&self.arena, &old, id);
            }
        }
        {
            let _g = self.swap_guard(id);
            slot.reset_counters();
            slot.status_set(BatStatus::empty());
        }
        self.free[id as usize & (FREE_SHARDS - 1)]
            .lock()
            .push(&self.arena, id);
        trace!("destroyed bat {id}");
        if parent_unshare != NIL_BAT {
            self.unshare_raw(parent_unshare)?;
        }
        Ok(())
    }

    // unshare also serves internal teardown paths that have no handle.
    fn unshare_raw(&self, id: BatId) -> Result<u32> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let remaining;
        {
            let _g = self.swap_guard(id);
            if slot.shares() == 0 {
                debug_assert!(false, "unshare without share on bat {id}");
                return Err(PoolError::RefBalance(id));
            }
            remaining = slot.shares_add(-1);
        }
        self.decref(id, true)?;
        Ok(remaining)
    }

    pub(crate) fn stop_trimmer(&self) {
        self.trim.shutdown.store(true, Ordering::Release);
        self.trim.kick();
        if let Some(handle) = self.trim_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RawPool {
    fn drop(&mut self) {
        self.trim.shutdown.store(true, Ordering::Release);
        self.trim.kick();
    }
}

// A compact token identifying the creating thread for debugging.
fn thread_token() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = fnv::FnvHasher::default();
    thread::current().id().hash(&mut h);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::atoms;
    use crate::common::tmp_name;
    use crate::testing::TestPool;

    fn int_type() -> AtomId {
        atoms().index("int").unwrap()
    }

    fn append_ints(pool: &Bbp, id: BatId, values: &[i32]) {
        let desc = pool.quickdesc(id).unwrap();
        for v in values {
            desc.append_fixed(&v.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn test_create_fix_unfix_drop() -> Result<()> {
        let tp = TestPool::new()?;
        let id = tp.insert(int_type(), 8)?;
        assert_eq!(tp.refs(id), 1);
        assert_eq!(tp.lrefs(id), 0);

        assert_eq!(tp.fix(id)?, 2);
        assert_eq!(tp.fix(id)?, 3);
        assert_eq!(tp.unfix(id)?, 2);
        assert_eq!(tp.unfix(id)?, 1);
        assert!(!tp.is_free(id));

        // dropping the creation reference kills the transient bat
        assert_eq!(tp.unfix(id)?, 0);
        assert!(tp.is_free(id));
        assert_eq!(tp.lookup(&tmp_name(id)), 0);

        // no files remain on disk for it
        let stem = physical_name(id);
        assert!(!tp.root().join(format!("{stem}.tail")).exists());

        // the id returns through the free list
        let again = tp.insert(int_type(), 8)?;
        assert_eq!(again, id);
        Ok(())
    }

    #[test]
    fn test_default_tmp_name_lookup() -> Result<()> {
        let tp = TestPool::new()?;
        let id = tp.insert(int_type(), 4)?;
        assert_eq!(tp.lookup(&tmp_name(id)), id);
        assert_eq!(tp.logical_name(id).unwrap(), tmp_name(id));
        // nothing is hashed for a default name
        assert_eq!(tp.lookup("nosuch"), 0);
        Ok(())
    }

    #[test]
    fn test_rename_collision() -> Result<()> {
        let tp = TestPool::new()?;
        let a = tp.insert(int_type(), 4)?;
        let b = tp.insert(int_type(), 4)?;
        tp.rename(a, "a")?;
        tp.rename(b, "b")?;

        let err = tp.rename(a, "b").unwrap_err();
        assert_eq!(err, PoolError::NameExists("b".to_string()));
        // the hash still answers for both names
        assert_eq!(tp.lookup("a"), a);
        assert_eq!(tp.lookup("b"), b);
        Ok(())
    }

    #[test]
    fn test_rename_rules() -> Result<()> {
        let tp = TestPool::new()?;
        let id = tp.insert(int_type(), 4)?;
        let other = tp.insert(int_type(), 4)?;

        // renaming to its own name is a no-op
        tp.rename(id, "t")?;
        tp.rename(id, "t")?;
        assert_eq!(tp.lookup("t"), id);

        // a temporary-form name must be the bat's own
        assert!(matches!(
            tp.rename(id, &tmp_name(other)),
            Err(PoolError::NameIllegal(_))
        ));
        tp.rename(id, &tmp_name(id))?;
        assert_eq!(tp.lookup("t"), 0);
        assert_eq!(tp.lookup(&tmp_name(id)), id);

        assert_eq!(
            tp.rename(id, &"x".repeat(300)).unwrap_err(),
            PoolError::NameTooLong
        );
        assert!(matches!(
            tp.rename(id, "a b"),
            Err(PoolError::NameIllegal(_))
        ));
        Ok(())
    }

    #[test]
    fn test_retain_release_roundtrip() -> Result<()> {
        let tp = TestPool::new()?;
        let id = tp.insert(int_type(), 4)?;
        let (r0, l0) = (tp.refs(id), tp.lrefs(id));
        tp.retain(id)?;
        tp.release(id)?;
        assert_eq!((tp.refs(id), tp.lrefs(id)), (r0, l0));
        tp.fix(id)?;
        tp.unfix(id)?;
        assert_eq!((tp.refs(id), tp.lrefs(id)), (r0, l0));
        Ok(())
    }

    #[test]
    fn test_keepref_converts() -> Result<()> {
        let tp = TestPool::new()?;
        let id = tp.insert(int_type(), 4)?;
        assert_eq!((tp.refs(id), tp.lrefs(id)), (1, 0));
        tp.keepref(id)?;
        assert_eq!((tp.refs(id), tp.lrefs(id)), (0, 1));
        assert!(!tp.is_free(id));
        // the logical reference now owns the bat
        tp.release(id)?;
        assert!(tp.is_free(id));
        Ok(())
    }

    #[test]
    fn test_view_lifecycle() -> Result<()> {
        let tp = TestPool::new()?;
        let parent = tp.insert(int_type(), 8)?;
        append_ints(&tp, parent, &[10, 20, 30]);
        tp.retain(parent)?;

        let view = tp.insert_view(parent)?;
        assert_eq!(tp.shares(parent), 1);
        assert!(tp.lrefs(parent) >= 2);
        assert_eq!(tp.fixed_value::<i32>(view, 1), Some(20));

        // the parent cannot be evicted while the view exists
        tp.unfix(parent)?;
        assert_eq!(tp.reclaim(parent)?, false);
        assert!(tp.status(parent).contains(BatStatus::LOADED));

        // destroying the view returns the borrow
        tp.unfix(view)?;
        assert!(tp.is_free(view));
        assert_eq!(tp.shares(parent), 0);

        // now the parent can go cold
        assert_eq!(tp.reclaim(parent)?, true);
        assert!(!tp.status(parent).contains(BatStatus::LOADED));

        tp.release(parent)?;
        assert!(tp.is_free(parent));
        Ok(())
    }

    #[test]
    fn test_reclaim_reload_roundtrip() -> Result<()> {
        let tp = TestPool::new()?;
        let id = tp.insert(int_type(), 8)?;
        append_ints(&tp, id, &[1, 2, 3, 4]);
        tp.retain(id)?;
        tp.unfix(id)?;

        assert_eq!(tp.reclaim(id)?, true);
        assert!(!tp.status(id).contains(BatStatus::LOADED));
        // the swapped-out transient image went to disk
        let stem = physical_name(id);
        assert!(tp.root().join(format!("{stem}.tail")).exists());

        // lazy reload brings the values back
        tp.fix(id)?;
        let desc = tp.descriptor(id)?;
        assert_eq!(desc.fixed_value::<i32>(3), Some(4));
        tp.unfix(id)?;
        tp.release(id)?;
        Ok(())
    }

    #[test]
    fn test_quickdesc_loads_nothing() -> Result<()> {
        let tp = TestPool::new()?;
        let id = tp.insert(int_type(), 8)?;
        append_ints(&tp, id, &[5, 6]);
        tp.retain(id)?;
        tp.unfix(id)?;
        tp.reclaim(id)?;
        let loads_before = tp.stats().loads();
        let desc = tp.quickdesc(id).unwrap();
        assert_eq!(desc.count(), 2);
        assert_eq!(tp.stats().loads(), loads_before);
        tp.release(id)?;
        Ok(())
    }

    #[test]
    fn test_element_unfix_runs_on_destroy() -> Result<()> {
        use std::sync::atomic::AtomicUsize;
        static DROPPED: AtomicUsize = AtomicUsize::new(0);
        fn count_drop(_: &[u8]) {
            DROPPED.fetch_add(1, Ordering::Relaxed);
        }

        let tp = TestPool::new()?;
        let handle = atoms().register("poolhandle", 8, false, Some(count_drop))?;
        let id = tp.insert(handle, 4)?;
        let desc = tp.quickdesc(id).unwrap();
        for v in [1u64, 2, 3] {
            desc.append_fixed(&v.to_le_bytes())?;
        }
        DROPPED.store(0, Ordering::Relaxed);
        tp.unfix(id)?;
        assert_eq!(DROPPED.load(Ordering::Relaxed), 3);
        Ok(())
    }

    #[test]
    fn test_lock_all_quiesces() -> Result<()> {
        let tp = TestPool::new()?;
        let id = tp.insert(int_type(), 4)?;
        {
            let _guard = tp.lock_all();
            // the pool is fully held here; dropping releases it
        }
        tp.unfix(id)?;
        Ok(())
    }

    #[test]
    fn test_pressure_eviction_on_unfix() -> Result<()> {
        let mut opts = PoolOptions {
            trimmer: false,
            ..Default::default()
        };
        opts.vm_cap = 1; // any resident byte counts as pressure
        let tp = TestPool::with_options(opts)?;
        let id = tp.insert(int_type(), 8)?;
        append_ints(&tp, id, &[1, 2, 3]);
        tp.set_persistent(id, true)?;
        tp.sync(None, None, 1, 1)?;
        tp.cold(id);

        // clean + persistent + cold + pressure: the last unfix evicts
        assert_eq!(tp.unfix(id)?, 0);
        assert!(!tp.status(id).contains(BatStatus::LOADED));
        assert!(tp.stats().evictions() >= 1);
        Ok(())
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "unfix without fix")]
    fn test_unbalanced_unfix_asserts() {
        let tp = TestPool::new().unwrap();
        let id = tp.insert(int_type(), 4).unwrap();
        let _ = tp.unfix(id);
        let _ = tp.unfix(id);
    }
}
