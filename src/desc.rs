//! The bat descriptor.
//!
//! A descriptor carries the identity of a bat (id, element type) and a
//! lock-guarded dynamic state: counts, sequence bases, property
//! witnesses, and the heaps. The pool owns descriptors through the slot
//! table; callers see them through shared references whose validity is
//! tied to the memory reference they hold.

use std::hash::Hasher;
use std::path::Path;

use fnv::FnvHasher;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::atom::{AtomId, atoms};
use crate::common::types::{BUN_NONE, BatId};
use crate::errors::{PoolError, Result};
use crate::farm::FarmRole;
use crate::heap::{Heap, HeapMode, read_value};

/// Extension of the tail file. Narrow string offsets use width-tagged
/// extensions; everything else is plain `tail`.
pub(crate) fn tail_ext(width: u16, varsized: bool) -> &'static str {
    if varsized {
        match width {
            1 => "tail1",
            2 => "tail2",
            4 => "tail4",
            _ => "tail",
        }
    } else {
        "tail"
    }
}

pub(crate) struct DescState {
    /// Element width in the tail (offset width for var-sized types).
    pub width: u16,
    pub count: u64,
    /// Element capacity of the tail allocation.
    pub capacity: u64,
    /// Prefix of the tail covered by the last commit.
    pub inserted: u64,
    pub hseqbase: u64,
    pub tseqbase: u64,
    /// Opaque catalog property word, persisted verbatim.
    pub props: u32,
    pub sorted: bool,
    pub revsorted: bool,
    pub key: bool,
    /// Positions witnessing a key violation.
    pub nokey: (u64, u64),
    pub nosorted: u64,
    pub norevsorted: u64,
    pub minpos: u64,
    pub maxpos: u64,
    /// Descriptor metadata changed since the last save.
    pub desc_dirty: bool,
    pub tail: Heap,
    pub vheap: Option<Heap>,
}

impl DescState {
    pub(crate) fn dirty(&self) -> bool {
        self.desc_dirty
            || self.tail.dirty
            || self.vheap.as_ref().is_some_and(|vh| vh.dirty)
    }

    pub(crate) fn resident(&self) -> usize {
        self.tail.resident() + self.vheap.as_ref().map_or(0, |vh| vh.resident())
    }
}

pub struct BatDesc {
    id: BatId,
    ttype: AtomId,
    state: Mutex<DescState>,
    // auxiliary tail hash; a rebuildable cache, dropped on modification
    idx: RwLock<Option<TailHash>>,
}

impl BatDesc {
    /// A fresh transient bat with room for `capacity` elements.
    pub(crate) fn new(id: BatId, ttype: AtomId, capacity: u64, stem: &str) -> Self {
        let width = atoms().size(ttype);
        let varsized = atoms().varsized(ttype);
        let ext = tail_ext(width, varsized);
        let tail = Heap::with_capacity(
            FarmRole::TRANSIENT,
            format!("{stem}.{ext}"),
            id,
            capacity * width as u64,
        );
        let vheap = varsized.then(|| {
            Heap::with_capacity(FarmRole::TRANSIENT, format!("{stem}.theap"), id, capacity)
        });
        let capacity = if width == 0 {
            capacity
        } else {
            tail.size / width as u64
        };
        BatDesc {
            id,
            ttype,
            state: Mutex::new(DescState {
                width,
                count: 0,
                capacity,
                inserted: 0,
                hseqbase: 0,
                tseqbase: BUN_NONE,
                props: 0,
                sorted: true,
                revsorted: true,
                key: true,
                nokey: (BUN_NONE, BUN_NONE),
                nosorted: BUN_NONE,
                norevsorted: BUN_NONE,
                minpos: BUN_NONE,
                maxpos: BUN_NONE,
                desc_dirty: true,
                tail,
                vheap,
            }),
            idx: RwLock::new(None),
        }
    }

    /// A view borrowing the heaps of `parent`. The view owns no bytes;
    /// its heaps record the parent id and stay unloaded forever.
    pub(crate) fn view_of(id: BatId, parent: &BatDesc, stem: &str) -> Self {
        let p = parent.state.lock();
        let ext = tail_ext(p.width, atoms().varsized(parent.ttype));
        let tail = Heap::unloaded(FarmRole::TRANSIENT, format!("{stem}.{ext}"), parent.id);
        let vheap = p.vheap.as_ref().map(|_| {
            Heap::unloaded(FarmRole::TRANSIENT, format!("{stem}.theap"), parent.id)
        });
        BatDesc {
            id,
            ttype: parent.ttype,
            state: Mutex::new(DescState {
                width: p.width,
                count: p.count,
                capacity: p.capacity,
                inserted: 0,
                hseqbase: p.hseqbase,
                tseqbase: p.tseqbase,
                props: p.props,
                sorted: p.sorted,
                revsorted: p.revsorted,
                key: p.key,
                nokey: p.nokey,
                nosorted: p.nosorted,
                norevsorted: p.norevsorted,
                minpos: p.minpos,
                maxpos: p.maxpos,
                desc_dirty: false,
                tail,
                vheap,
            }),
            idx: RwLock::new(None),
        }
    }

    // Rebuilds a descriptor from its directory entry; heaps stay
    // unloaded until first use.
    pub(crate) fn from_parts(id: BatId, ttype: AtomId, state: DescState) -> Self {
        BatDesc {
            id,
            ttype,
            state: Mutex::new(state),
            idx: RwLock::new(None),
        }
    }

    pub fn id(&self) -> BatId {
        self.id
    }

    pub fn ttype(&self) -> AtomId {
        self.ttype
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DescState> {
        self.state.lock()
    }

    /// The parent bat when this descriptor is a view.
    pub fn view_parent(&self) -> Option<BatId> {
        let st = self.state.lock();
        (st.tail.parent != self.id).then_some(st.tail.parent)
    }

    pub fn is_view(&self) -> bool {
        self.view_parent().is_some()
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    /// The prefix of the tail covered by the last commit.
    pub fn inserted(&self) -> u64 {
        self.state.lock().inserted
    }

    pub fn width(&self) -> u16 {
        self.state.lock().width
    }

    pub fn dirty(&self) -> bool {
        self.state.lock().dirty()
    }

    /// Marks the tail copy-on-write; its saves go through `.new` files.
    pub fn set_tail_mode(&self, mode: HeapMode) {
        self.state.lock().tail.mode = mode;
    }

    /// Appends one fixed-width element.
    pub fn append_fixed(&self, value: &[u8]) -> Result<u64> {
        let mut st = self.state.lock();
        if st.tail.parent != self.id {
            return Err(PoolError::Unexpected("append to a view"));
        }
        if value.len() != st.width as usize {
            return Err(PoolError::Unexpected("value width mismatch"));
        }
        st.tail.append(value)?;
        let pos = st.count;
        st.count += 1;
        st.capacity = st.tail.size / st.width.max(1) as u64;
        st.desc_dirty = true;
        if st.count > 1 {
            // properties are re-established lazily, not maintained here
            st.sorted = false;
            st.revsorted = false;
            st.key = false;
        }
        st.minpos = BUN_NONE;
        st.maxpos = BUN_NONE;
        drop(st);
        *self.idx.write() = None;
        Ok(pos)
    }

    /// Appends one string: bytes land in the var heap, the offset in the
    /// tail.
    pub fn append_str(&self, value: &str) -> Result<u64> {
        let mut st = self.state.lock();
        if st.tail.parent != self.id {
            return Err(PoolError::Unexpected("append to a view"));
        }
        let vh = st
            .vheap
            .as_mut()
            .ok_or(PoolError::Unexpected("append_str on a fixed-width bat"))?;
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        let off = vh.append(&bytes)?;
        let width = st.width as usize;
        st.tail.append(&off.to_le_bytes()[..width])?;
        let pos = st.count;
        st.count += 1;
        st.capacity = st.tail.size / st.width.max(1) as u64;
        st.desc_dirty = true;
        if st.count > 1 {
            st.sorted = false;
            st.revsorted = false;
            st.key = false;
        }
        drop(st);
        *self.idx.write() = None;
        Ok(pos)
    }

    /// Reads one fixed-width value. None when the position is out of
    /// range or the tail is not resident (views resolve via the pool).
    pub fn fixed_value<T: bytemuck::Pod>(&self, pos: u64) -> Option<T> {
        let st = self.state.lock();
        if pos >= st.count || !st.tail.loaded() {
            return None;
        }
        Some(read_value(st.tail.bytes(), pos, st.width as usize))
    }

    /// Reads one string value back out of the var heap.
    pub fn str_value(&self, pos: u64) -> Option<String> {
        let st = self.state.lock();
        if pos >= st.count || !st.tail.loaded() {
            return None;
        }
        let width = st.width as usize;
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(
            &st.tail.bytes()[pos as usize * width..pos as usize * width + width],
        );
        let off = u64::from_le_bytes(raw) as usize;
        let vh = st.vheap.as_ref()?;
        let bytes = vh.bytes();
        let end = bytes[off..].iter().position(|&b| b == 0)? + off;
        String::from_utf8(bytes[off..end].to_vec()).ok()
    }

    ///////////////////////////////////////////////////////////////////////
    // Auxiliary tail hash.
    ///////////////////////////////////////////////////////////////////////

    /// Builds the value-to-first-position hash over the resident tail.
    pub fn build_hash(&self) -> Result<()> {
        let st = self.state.lock();
        if st.tail.parent != self.id || !st.tail.loaded() {
            return Err(PoolError::Unexpected("hash on a view or unloaded tail"));
        }
        let hash = TailHash::build(st.tail.bytes(), st.width as usize, st.count);
        drop(st);
        *self.idx.write() = Some(hash);
        Ok(())
    }

    /// Finds the first position holding `value` via the hash, building
    /// nothing: None when no hash exists or the value is absent.
    pub fn hash_find(&self, value: &[u8]) -> Option<u64> {
        let idx = self.idx.read();
        let hash = idx.as_ref()?;
        let st = self.state.lock();
        hash.find(value, st.tail.bytes(), st.width as usize)
    }

    pub(crate) fn hash_dirty(&self) -> bool {
        self.idx.read().as_ref().is_some_and(|h| h.dirty)
    }

    pub(crate) fn save_hash(&self, root: &Path, stem: &str) -> Result<()> {
        let mut idx = self.idx.write();
        if let Some(hash) = idx.as_mut() {
            if hash.dirty {
                hash.save(root, stem)?;
            }
        }
        Ok(())
    }

    pub(crate) fn drop_hash(&self) {
        *self.idx.write() = None;
    }
}

// Open-chained hash from element bytes to the first tail position
// holding them. Persisted as two sibling files: the bucket array and the
// per-position link array.
pub(crate) struct TailHash {
    mask: u64,
    buckets: Vec<u64>,
    links: Vec<u64>,
    pub(crate) dirty: bool,
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut h = FnvHasher::default();
    h.write(bytes);
    h.finish()
}

impl TailHash {
    fn build(tail: &[u8], width: usize, count: u64) -> Self {
        let nbuckets = count.max(1).next_power_of_two();
        let mask = nbuckets - 1;
        let mut buckets = vec![BUN_NONE; nbuckets as usize];
        let mut links = vec![BUN_NONE; count as usize];
        for pos in 0..count as usize {
            let value = &tail[pos * width..(pos + 1) * width];
            let b = (hash_bytes(value) & mask) as usize;
            links[pos] = buckets[b];
            buckets[b] = pos as u64;
        }
        TailHash {
            mask,
            buckets,
            links,
            dirty: true,
        }
    }

    fn find(&self, value: &[u8], tail: &[u8], width: usize) -> Option<u64> {
        let mut cursor = self.buckets[(hash_bytes(value) & self.mask) as usize];
        let mut first = None;
        while cursor != BUN_NONE {
            let pos = cursor as usize;
            if &tail[pos * width..(pos + 1) * width] == value {
                first = Some(first.map_or(cursor, |f: u64| f.min(cursor)));
            }
            cursor = self.links[pos];
        }
        first
    }

    fn save(&mut self, root: &Path, stem: &str) -> Result<()> {
        let write = |name: String, words: &[u64]| -> Result<()> {
            let path = root.join(name);
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut bytes = Vec::with_capacity(words.len() * 8);
            for w in words {
                bytes.extend_from_slice(&w.to_le_bytes());
            }
            std::fs::write(path, bytes)?;
            Ok(())
        };
        write(format!("{stem}.thashb"), &self.buckets)?;
        write(format!("{stem}.thashl"), &self.links)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::physical_name;

    fn int_desc(id: BatId) -> BatDesc {
        let int = atoms().index("int").unwrap();
        BatDesc::new(id, int, 16, &physical_name(id))
    }

    #[test]
    fn test_append_and_read() -> Result<()> {
        let b = int_desc(1);
        for v in [3i32, 1, 4, 1, 5] {
            b.append_fixed(&v.to_le_bytes())?;
        }
        assert_eq!(b.count(), 5);
        assert_eq!(b.fixed_value::<i32>(2), Some(4));
        assert_eq!(b.fixed_value::<i32>(5), None);
        assert!(b.dirty());
        Ok(())
    }

    #[test]
    fn test_str_append() -> Result<()> {
        let str_t = atoms().index("str").unwrap();
        let b = BatDesc::new(2, str_t, 4, &physical_name(2));
        b.append_str("hello")?;
        b.append_str("")?;
        b.append_str("world")?;
        assert_eq!(b.str_value(0).as_deref(), Some("hello"));
        assert_eq!(b.str_value(1).as_deref(), Some(""));
        assert_eq!(b.str_value(2).as_deref(), Some("world"));
        Ok(())
    }

    #[test]
    fn test_view_shape() -> Result<()> {
        let parent = int_desc(3);
        parent.append_fixed(&9i32.to_le_bytes())?;
        let view = BatDesc::view_of(4, &parent, &physical_name(4));
        assert_eq!(view.view_parent(), Some(3));
        assert!(view.is_view());
        assert_eq!(view.count(), 1);
        assert!(view.append_fixed(&1i32.to_le_bytes()).is_err());
        Ok(())
    }

    #[test]
    fn test_tail_hash() -> Result<()> {
        let b = int_desc(5);
        for v in [7i32, 8, 7, 9] {
            b.append_fixed(&v.to_le_bytes())?;
        }
        b.build_hash()?;
        assert_eq!(b.hash_find(&7i32.to_le_bytes()), Some(0));
        assert_eq!(b.hash_find(&9i32.to_le_bytes()), Some(3));
        assert_eq!(b.hash_find(&42i32.to_le_bytes()), None);
        assert!(b.hash_dirty());

        // appending invalidates the cache
        b.append_fixed(&1i32.to_le_bytes())?;
        assert_eq!(b.hash_find(&7i32.to_le_bytes()), None);
        Ok(())
    }

    #[test]
    fn test_hash_save() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let b = int_desc(6);
        b.append_fixed(&1i32.to_le_bytes())?;
        b.build_hash()?;
        let stem = physical_name(6);
        b.save_hash(dir.path(), &stem)?;
        assert!(!b.hash_dirty());
        assert!(dir.path().join(format!("{stem}.thashb")).exists());
        assert!(dir.path().join(format!("{stem}.thashl")).exists());
        Ok(())
    }
}
