//! File-backed byte arrays.
//!
//! A heap is the storage of one part of a bat: the tail holds the
//! fixed-width elements (or offsets for var-sized types), the var heap
//! holds the variable-length bytes. A heap is either malloc'd, mapped
//! read-only from its committed file, or unloaded with only its metadata
//! resident. A view bat's heap carries the parent id instead of bytes of
//! its own; byte access then goes through the pool to the parent.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use log::trace;
use memmap2::Mmap;
use once_cell::sync::Lazy;

use crate::common::types::BatId;
use crate::errors::{PoolError, Result};
use crate::farm::FarmRole;

static PAGE: Lazy<usize> = Lazy::new(page_size::get);

// Allocations are rounded up to whole OS pages.
fn round_page(n: u64) -> u64 {
    let page = *PAGE as u64;
    n.div_ceil(page) * page
}

/// How the bytes of a heap are materialised.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HeapMode {
    /// Owned, writable memory.
    Mem,
    /// Read-only map of the committed file.
    Map,
    /// Copy-on-write private image; saved through a `.new` sibling file.
    Priv,
}

enum HeapData {
    Unloaded,
    Mem(Vec<u8>),
    Map(Mmap),
}

pub struct Heap {
    pub(crate) role: FarmRole,
    /// Id-derived stem plus extension, relative to the farm directory.
    pub(crate) filename: String,
    /// The bat owning the bytes; differs from the holder for view heaps.
    pub(crate) parent: BatId,
    /// Bytes in use.
    pub(crate) free: u64,
    /// Bytes allocated (page-rounded).
    pub(crate) size: u64,
    pub(crate) dirty: bool,
    pub(crate) mode: HeapMode,
    data: HeapData,
}

impl Heap {
    /// A heap known only by its metadata, as read from the directory.
    pub(crate) fn unloaded(role: FarmRole, filename: String, parent: BatId) -> Self {
        Heap {
            role,
            filename,
            parent,
            free: 0,
            size: 0,
            dirty: false,
            mode: HeapMode::Mem,
            data: HeapData::Unloaded,
        }
    }

    /// A fresh writable heap with room for `cap` bytes.
    pub(crate) fn with_capacity(
        role: FarmRole,
        filename: String,
        parent: BatId,
        cap: u64,
    ) -> Self {
        let size = round_page(cap.max(1));
        Heap {
            role,
            filename,
            parent,
            free: 0,
            size,
            dirty: false,
            mode: HeapMode::Mem,
            data: HeapData::Mem(vec![0u8; size as usize]),
        }
    }

    pub(crate) fn loaded(&self) -> bool {
        !matches!(self.data, HeapData::Unloaded)
    }

    pub(crate) fn mapped(&self) -> bool {
        matches!(self.data, HeapData::Map(_))
    }

    /// The resident bytes; empty when unloaded.
    pub(crate) fn bytes(&self) -> &[u8] {
        match &self.data {
            HeapData::Unloaded => &[],
            HeapData::Mem(v) => v,
            HeapData::Map(m) => m,
        }
    }

    // Promotes a mapped heap to owned memory so it can be written.
    fn writable(&mut self) -> Result<&mut Vec<u8>> {
        if let HeapData::Map(m) = &self.data {
            let mut v = vec![0u8; self.size.max(round_page(self.free)) as usize];
            let n = m.len().min(v.len());
            v[..n].copy_from_slice(&m[..n]);
            self.data = HeapData::Mem(v);
        }
        match &mut self.data {
            HeapData::Mem(v) => Ok(v),
            _ => Err(PoolError::Unexpected("write to unloaded heap")),
        }
    }

    /// Grows the heap so at least `need` bytes fit, doubling the
    /// allocation and rounding to whole pages.
    pub(crate) fn grow(&mut self, need: u64) -> Result<()> {
        if matches!(self.data, HeapData::Unloaded) && self.free == 0 {
            let mode = self.mode;
            *self = Heap::with_capacity(
                self.role,
                self.filename.clone(),
                self.parent,
                need,
            );
            self.mode = mode;
            return Ok(());
        }
        if need <= self.size && !self.mapped() {
            return Ok(());
        }
        let new_size = round_page(need.max(self.size * 2));
        let v = self.writable()?;
        v.resize(new_size as usize, 0);
        self.size = new_size;
        Ok(())
    }

    /// Appends raw bytes, returning the offset they landed at.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let need = self.free + bytes.len() as u64;
        if need > self.size || !matches!(self.data, HeapData::Mem(_)) {
            self.grow(need)?;
        }
        let off = self.free;
        let v = self.writable()?;
        v[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
        self.free = need;
        self.dirty = true;
        Ok(off)
    }

    /// Materialises the heap from its file. Clean heaps may be mapped
    /// read-only instead of copied. Returns the resident byte count.
    pub(crate) fn load(&mut self, root: &Path, prefer_map: bool) -> Result<usize> {
        debug_assert!(!self.loaded());
        let path = root.join(&self.filename);
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < self.free {
            return Err(PoolError::Corrupt(format!(
                "heap file {} shorter than its manifest entry ({} < {})",
                path.display(),
                file_len,
                self.free
            )));
        }
        if prefer_map && !self.dirty && self.free > 0 {
            let map = unsafe { Mmap::map(&file)? };
            self.size = round_page(file_len);
            self.data = HeapData::Map(map);
            self.mode = HeapMode::Map;
            trace!("mapped heap {} ({} bytes)", self.filename, file_len);
            return Ok(file_len as usize);
        }
        let size = round_page(self.free.max(1));
        let mut v = vec![0u8; size as usize];
        file.read_exact(&mut v[..self.free as usize])?;
        self.size = size;
        self.data = HeapData::Mem(v);
        self.mode = HeapMode::Mem;
        trace!("loaded heap {} ({} bytes)", self.filename, self.free);
        Ok(size as usize)
    }

    /// Writes the used prefix out and syncs it. Copy-on-write heaps are
    /// written to a `.new` sibling instead of the real file. `limit`
    /// clamps the written prefix when a commit targets an older count.
    pub(crate) fn save(&mut self, root: &Path, limit: Option<u64>) -> Result<()> {
        if !self.loaded() && self.free > 0 {
            // nothing newer in memory; the on-disk image is current
            return Ok(());
        }
        let path = root.join(&self.filename);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let dest = if self.mode == HeapMode::Priv {
            root.join(format!("{}.new", self.filename))
        } else {
            path
        };
        let wanted = limit.unwrap_or(self.free).min(self.free);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&dest)?;
        file.write_all(&self.bytes()[..wanted as usize])?;
        file.sync_data()?;
        self.dirty = false;
        trace!("saved heap {} ({} bytes)", self.filename, wanted);
        Ok(())
    }

    /// Drops the resident bytes, keeping the metadata. Returns the bytes
    /// released for the pool's memory accounting.
    pub(crate) fn release(&mut self) -> usize {
        let released = match &self.data {
            HeapData::Unloaded => 0,
            HeapData::Mem(v) => v.len(),
            HeapData::Map(m) => m.len(),
        };
        self.data = HeapData::Unloaded;
        released
    }

    /// Resident bytes for memory accounting.
    pub(crate) fn resident(&self) -> usize {
        match &self.data {
            HeapData::Unloaded => 0,
            HeapData::Mem(v) => v.len(),
            HeapData::Map(m) => m.len(),
        }
    }
}

/// Reads one fixed-width value out of a heap without assuming alignment.
pub(crate) fn read_value<T: bytemuck::Pod>(bytes: &[u8], pos: u64, width: usize) -> T {
    let start = pos as usize * width;
    bytemuck::pod_read_unaligned(&bytes[start..start + width])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_heap() -> Heap {
        Heap::with_capacity(FarmRole::TRANSIENT, "01/01.tail".to_string(), 1, 16)
    }

    #[test]
    fn test_append_and_grow() -> Result<()> {
        let mut h = mem_heap();
        let first_size = h.size;
        for i in 0u64..1024 {
            let off = h.append(&i.to_le_bytes())?;
            assert_eq!(off, i * 8);
        }
        assert_eq!(h.free, 8 * 1024);
        assert!(h.size >= h.free);
        assert!(h.size >= first_size);
        assert!(h.dirty);
        let v: u64 = read_value(h.bytes(), 1023, 8);
        assert_eq!(v, 1023);
        Ok(())
    }

    #[test]
    fn test_save_load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut h = mem_heap();
        for i in 0u64..100 {
            h.append(&i.to_le_bytes())?;
        }
        h.save(dir.path(), None)?;
        assert!(!h.dirty);

        let mut back = Heap::unloaded(FarmRole::TRANSIENT, h.filename.clone(), 1);
        back.free = h.free;
        back.load(dir.path(), false)?;
        assert_eq!(&back.bytes()[..h.free as usize], &h.bytes()[..h.free as usize]);
        Ok(())
    }

    #[test]
    fn test_mapped_load() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut h = mem_heap();
        h.append(&7u64.to_le_bytes())?;
        h.save(dir.path(), None)?;

        let mut back = Heap::unloaded(FarmRole::TRANSIENT, h.filename.clone(), 1);
        back.free = h.free;
        back.load(dir.path(), true)?;
        assert!(back.mapped());
        let v: u64 = read_value(back.bytes(), 0, 8);
        assert_eq!(v, 7);

        // writing promotes the map to owned memory
        back.append(&8u64.to_le_bytes())?;
        assert!(!back.mapped());
        assert_eq!(back.free, 16);
        Ok(())
    }

    #[test]
    fn test_short_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01.tail"), b"xy").unwrap();
        let mut h = Heap::unloaded(FarmRole::TRANSIENT, "01.tail".to_string(), 1);
        h.free = 100;
        let err = h.load(dir.path(), false).unwrap_err();
        assert!(matches!(err, PoolError::Corrupt(_)));
    }

    #[test]
    fn test_priv_saves_to_new() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut h = mem_heap();
        h.append(&1u64.to_le_bytes())?;
        h.mode = HeapMode::Priv;
        h.save(dir.path(), None)?;
        assert!(dir.path().join("01/01.tail.new").exists());
        assert!(!dir.path().join("01/01.tail").exists());
        Ok(())
    }

    #[test]
    fn test_release_accounting() -> Result<()> {
        let mut h = mem_heap();
        h.append(&[1, 2, 3, 4])?;
        let resident = h.resident();
        assert!(resident > 0);
        assert_eq!(h.release(), resident);
        assert!(!h.loaded());
        assert_eq!(h.free, 4);
        Ok(())
    }
}
