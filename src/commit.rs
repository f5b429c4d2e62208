//! The atomic commit machinery.
//!
//! A commit replaces the on-disk image of a set of persistent bats plus
//! the manifest. Old images are staged into `BACKUP/` (nested
//! `BACKUP/SUBCOMMIT/` for subcommits) before anything is overwritten,
//! so an interruption at any point is recoverable: either `BACKUP/`
//! still exists and recovery rolls everything back, or the publish
//! rename to `DELETE_ME/` went through and the commit is applied.
//!
//! Per-bat write order: SAVING set, old heap files staged, heaps written
//! (`.new` siblings for copy-on-write heaps), SAVING cleared. Publish:
//! new manifest flushed and fsynced, `BACKUP/` renamed to `DELETE_ME/`,
//! `DELETE_ME/` removed best-effort.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::atom::atoms;
use crate::common::types::{BatId, SPIN, STRBATMOVE_SIGNAL};
use crate::common::{BatStatus, physical_name, tmp_name};
use crate::desc::tail_ext;
use crate::dirfile::{DirEntry, DirWriter};
use crate::errors::{PoolError, Result};
use crate::heap::HeapMode;
use crate::pool::{Bbp, DirInfo, RawPool};

pub(crate) const BAKDIR: &str = "BACKUP";
pub(crate) const SUBDIR: &str = "SUBCOMMIT";
pub(crate) const DELDIR: &str = "DELETE_ME";

pub(crate) fn bakdir(root: &Path) -> PathBuf {
    root.join(BAKDIR)
}

pub(crate) fn subdir(root: &Path) -> PathBuf {
    root.join(BAKDIR).join(SUBDIR)
}

pub(crate) fn deldir(root: &Path) -> PathBuf {
    root.join(DELDIR)
}

impl Bbp {
    /// Commits a set of persistent bats and the manifest.
    ///
    /// With `ids` given this is a subcommit: only those bats (which the
    /// caller supplies in ascending order, optionally with target counts
    /// in `sizes`) are rewritten, every other manifest entry is carried
    /// forward byte-identically. Without `ids` every persistent bat is
    /// committed. `logno` and `transid` become the new BBPinfo pair.
    pub fn sync(
        &self,
        ids: Option<&[BatId]>,
        sizes: Option<&[u64]>,
        logno: u64,
        transid: u64,
    ) -> Result<()> {
        let p = &self.0;
        p.ensure_init()?;
        // two commits cannot overlap
        let _sync = p.sync_lock.lock();
        let root = p.persistent_root()?;
        let subcommit = ids.is_some();
        // target counts only make sense against a caller-supplied id set
        let sizes = if subcommit { sizes } else { None };

        let list: Vec<BatId> = match ids {
            Some(ids) => {
                if ids.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(PoolError::Unexpected("subcommit ids not ascending"));
                }
                if let Some(sizes) = sizes {
                    if sizes.len() != ids.len() {
                        return Err(PoolError::Unexpected("sizes do not match ids"));
                    }
                }
                ids.to_vec()
            }
            None => (1..p.arena.size())
                .filter(|&id| {
                    p.arena.get(id).is_some_and(|s| {
                        s.status()
                            .intersects(BatStatus::PERSISTENT | BatStatus::DELETED)
                    })
                })
                .collect(),
        };

        debug!(
            "commit begin: {} bats, subcommit={subcommit}, logno={logno}, transid={transid}",
            list.len()
        );
        p.prepare(&root, subcommit)?;

        // mark every participant, waiting out unloads in flight
        for &id in &list {
            if let Some(slot) = p.arena.get(id) {
                let _g = p.lock_clear(id, BatStatus::UNLOADING);
                slot.status_on(BatStatus::SYNCING);
            }
        }

        let result = p
            .sync_body(&root, &list, sizes, subcommit, logno, transid)
            .and_then(|()| p.swing_priv(&root, &list));
        match result {
            Ok(()) => {
                p.publish(&root, subcommit)?;
                *p.info.lock() = DirInfo { logno, transid };
                p.commit_epilogue(&root, &list, sizes)?;
                p.stats.commits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!("commit done: logno={logno}, transid={transid}");
                Ok(())
            }
            Err(e) => {
                warn!("commit failed, staging left for recovery: {e:?}");
                for &id in &list {
                    if let Some(slot) = p.arena.get(id) {
                        let _g = p.swap_guard(id);
                        slot.status_off(BatStatus::SYNCING);
                    }
                }
                *p.commit_state.lock() = Default::default();
                Err(e)
            }
        }
    }
}

impl RawPool {
    // Step 1 of a commit: make sure the staging directories exist and
    // hold the previous manifest as the "old" image.
    fn prepare(&self, root: &Path, subcommit: bool) -> Result<()> {
        let mut cs = self.commit_state.lock();
        if subcommit && !cs.subdir {
            crate::recovery::recover_subdir(root)?;
        }
        if cs.files == 0 && !cs.dir {
            crate::recovery::recover(root)?;
        }
        fs::create_dir_all(bakdir(root))?;
        if subcommit {
            fs::create_dir_all(subdir(root))?;
        }
        let staging = if subcommit { subdir(root) } else { bakdir(root) };
        let old = staging.join("BBP.dir");
        let cur = root.join("BBP.dir");
        if !old.exists() {
            if !cur.exists() {
                return Err(PoolError::Unexpected("no manifest to stage"));
            }
            fs::rename(&cur, &old)?;
        } else if cur.exists() {
            // a failed commit left its half-written manifest behind; the
            // staged old one wins
            fs::remove_file(&cur)?;
        }
        cs.dir = true;
        if subcommit {
            cs.subdir = true;
        }
        Ok(())
    }

    fn sync_body(
        &self,
        root: &Path,
        list: &[BatId],
        sizes: Option<&[u64]>,
        subcommit: bool,
        logno: u64,
        transid: u64,
    ) -> Result<()> {
        // save the dirty participants
        for (n, &id) in list.iter().enumerate() {
            let Some(slot) = self.arena.get(id) else { continue };
            let st = slot.status();
            if !st.contains(BatStatus::PERSISTENT) || st.contains(BatStatus::DELETED) {
                continue;
            }
            let clamp = sizes.map(|s| s[n]);
            self.save_bat(id, clamp)?;
        }

        // write the new manifest: directly into place for a full commit,
        // into the staging directory for a subcommit
        let info = DirInfo { logno, transid };
        let size = self.arena.size();
        if subcommit {
            let old = subdir(root).join("BBP.dir");
            let mut w =
                DirWriter::create(&bakdir(root).join("BBP.dir"), size, &info, Some(old.as_path()))?;
            for (n, &id) in list.iter().enumerate() {
                w.step(id)?;
                if self.in_manifest(id) {
                    let clamp = sizes.map(|s| s[n]);
                    w.entry(&self.dir_entry(id, clamp)?)?;
                }
            }
            w.finish()?;
        } else {
            let mut w = DirWriter::create(&root.join("BBP.dir"), size, &info, None)?;
            for &id in list {
                if self.in_manifest(id) {
                    w.entry(&self.dir_entry(id, None)?)?;
                }
            }
            w.finish()?;
        }
        Ok(())
    }

    fn in_manifest(&self, id: BatId) -> bool {
        self.arena.get(id).is_some_and(|s| {
            let st = s.status();
            st.contains(BatStatus::PERSISTENT) && !st.contains(BatStatus::DELETED)
        })
    }

    // Swings freshly written copy-on-write images into place. Runs
    // before the publish rename: a crash here still rolls back through
    // the staged originals and the kill markers.
    fn swing_priv(&self, root: &Path, list: &[BatId]) -> Result<()> {
        for &id in list {
            let Some(slot) = self.arena.get(id) else { continue };
            let Some(desc) = (unsafe { slot.desc() }) else { continue };
            let state = desc.state();
            if state.tail.mode == HeapMode::Priv {
                let new = root.join(format!("{}.new", state.tail.filename));
                if new.exists() {
                    fs::rename(new, root.join(&state.tail.filename))?;
                }
            }
        }
        Ok(())
    }

    // The commit point. Renaming the staging directory away declares the
    // new image current; everything in it is then garbage.
    fn publish(&self, root: &Path, subcommit: bool) -> Result<()> {
        if subcommit {
            fs::rename(bakdir(root).join("BBP.dir"), root.join("BBP.dir"))?;
        }
        let del = deldir(root);
        if del.exists() {
            fs::remove_dir_all(&del)?;
        }
        fs::rename(bakdir(root), &del)?;
        if let Err(e) = fs::remove_dir_all(&del) {
            debug!("leaving {} behind: {e}", del.display());
        }
        *self.commit_state.lock() = Default::default();
        Ok(())
    }

    // Post-publish bookkeeping: bit turnover, committed prefixes,
    // copy-on-write swing, deletion of committed-out bats.
    fn commit_epilogue(&self, root: &Path, list: &[BatId], sizes: Option<&[u64]>) -> Result<()> {
        for (n, &id) in list.iter().enumerate() {
            let Some(slot) = self.arena.get(id) else { continue };
            let st = slot.status();
            if st.contains(BatStatus::DELETED) {
                // committed out: its files go now, the slot dies when the
                // last reference does (or at a later commit's epilogue)
                if let Some(desc) = unsafe { slot.desc() } {
                    let state = desc.state();
                    let _ = fs::remove_file(root.join(&state.tail.filename));
                    if let Some(vh) = &state.vheap {
                        let _ = fs::remove_file(root.join(&vh.filename));
                    }
                    drop(state);
                }
                let destroy_now = {
                    let _g = self.swap_guard(id);
                    slot.status_off(BatStatus::SYNCING);
                    if slot.refs() == 0 && slot.lrefs() == 0 {
                        slot.status_on(BatStatus::UNLOADING);
                        self.unload_begin();
                        true
                    } else {
                        false
                    }
                };
                if destroy_now {
                    self.destroy(id)?;
                }
                continue;
            }
            if let Some(desc) = unsafe { slot.desc() } {
                let mut state = desc.state();
                let saved = sizes
                    .map(|s| s[n].min(state.count))
                    .unwrap_or(state.count);
                state.inserted = saved;
            }
            let _g = self.swap_guard(id);
            if slot.status().contains(BatStatus::NEW) {
                slot.status_off(BatStatus::NEW);
            }
            slot.status_on(BatStatus::EXISTING);
            slot.status_off(BatStatus::SYNCING | BatStatus::SWAPPED | BatStatus::RENAMED);
        }
        self.strbatmove_pass(root)?;
        Ok(())
    }

    // The gated rename of string-offset tails left behind by an old
    // directory generation, requested by the signal file the reader
    // wrote and run only after a commit went through.
    fn strbatmove_pass(&self, root: &Path) -> Result<()> {
        let signal = root.join(STRBATMOVE_SIGNAL);
        if !signal.exists() {
            return Ok(());
        }
        info!("renaming narrow string-offset tails");
        for id in 1..self.arena.size() {
            let Some(slot) = self.arena.get(id) else { continue };
            if !slot.status().contains(BatStatus::PERSISTENT) {
                continue;
            }
            let Some(desc) = (unsafe { slot.desc() }) else { continue };
            let st = desc.state();
            let ext = tail_ext(st.width, st.vheap.is_some());
            if ext != "tail" {
                let stem = physical_name(id);
                let old = root.join(format!("{stem}.tail"));
                let new = root.join(format!("{stem}.{ext}"));
                if old.exists() && !new.exists() {
                    fs::rename(old, new)?;
                }
            }
        }
        fs::remove_file(signal)?;
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Saving one bat.
    ///////////////////////////////////////////////////////////////////////

    /// Writes a bat out. A clean bat or a view only flushes a dirty
    /// auxiliary hash. Concurrent savers spin until the bit clears.
    pub(crate) fn save_bat(&self, id: BatId, clamp: Option<u64>) -> Result<()> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let desc = unsafe { slot.desc() }.ok_or(PoolError::NoSuchBat(id))?;
        loop {
            let g = self.swap_guard(id);
            let st = slot.status();
            if st.contains(BatStatus::SAVING) {
                drop(g);
                std::thread::sleep(SPIN);
                continue;
            }
            if desc.view_parent().is_some() || !desc.dirty() {
                drop(g);
                if desc.hash_dirty() {
                    let role = desc.state().tail.role;
                    let root = self.heap_root(role)?;
                    desc.save_hash(&root, &physical_name(id))?;
                }
                return Ok(());
            }
            let mut bits = BatStatus::SAVING;
            {
                let state = desc.state();
                if state.inserted < state.count {
                    bits |= BatStatus::SWAPPED;
                }
            }
            if !st.contains(BatStatus::PERSISTENT) {
                bits |= BatStatus::TMP;
            }
            slot.status_on(bits);
            break;
        }

        let res = (|| {
            let persistent = slot.status().contains(BatStatus::PERSISTENT);
            let root = self.heap_root(desc.state().tail.role)?;
            if persistent {
                // an existing image must be staged before it is touched
                self.stage_backup(&root, id)?;
            }
            let mut state = desc.state();
            let clamp_bytes = clamp.map(|c| c.min(state.count) * state.width as u64);
            state.tail.save(&root, clamp_bytes)?;
            if let Some(vh) = state.vheap.as_mut() {
                vh.save(&root, None)?;
            }
            state.desc_dirty = false;
            drop(state);
            if desc.hash_dirty() {
                desc.save_hash(&root, &physical_name(id))?;
            }
            Ok(())
        })();

        let _g = self.swap_guard(id);
        slot.status_off(BatStatus::SAVING | BatStatus::TMP);
        res
    }

    // Stages the existing on-disk files of a bat into the staging
    // directory: moved iff the source exists and the destination does
    // not already hold a copy. Copy-on-write heaps leave a kill marker
    // so recovery knows to delete a half-written `.new` file.
    fn stage_backup(&self, root: &Path, id: BatId) -> Result<()> {
        let cs_subdir = self.commit_state.lock().subdir;
        let staging = if cs_subdir { subdir(root) } else { bakdir(root) };
        fs::create_dir_all(&staging)?;
        let Some(slot) = self.arena.get(id) else {
            return Err(PoolError::NoSuchBat(id));
        };
        let desc = unsafe { slot.desc() }.ok_or(PoolError::NoSuchBat(id))?;
        let state = desc.state();
        let mut files = vec![(state.tail.filename.clone(), state.tail.mode)];
        if let Some(vh) = &state.vheap {
            files.push((vh.filename.clone(), vh.mode));
        }
        drop(state);
        let mut staged = 0usize;
        for (filename, mode) in files {
            let src = root.join(&filename);
            let leaf = src
                .file_name()
                .ok_or(PoolError::Unexpected("heap file without a name"))?
                .to_owned();
            let dst = staging.join(&leaf);
            if src.exists() && !dst.exists() {
                fs::rename(&src, &dst)?;
                staged += 1;
            }
            if mode == HeapMode::Priv {
                let marker = bakdir(root).join(format!("{}.new.kill", leaf.to_string_lossy()));
                fs::write(marker, b"")?;
            }
        }
        self.commit_state.lock().files += staged;
        Ok(())
    }

    // Assembles the manifest entry of a live bat.
    pub(crate) fn dir_entry(&self, id: BatId, clamp: Option<u64>) -> Result<DirEntry> {
        let slot = self.arena.get(id).ok_or(PoolError::NoSuchBat(id))?;
        let desc = unsafe { slot.desc() }.ok_or(PoolError::NoSuchBat(id))?;
        let options = {
            let _g = self.swap_guard(id);
            unsafe { slot.body() }.options.as_ref().map(|o| o.to_string())
        };
        let logical = {
            let _names = self.names.lock();
            match unsafe { slot.name() } {
                Some(n) => n.to_string(),
                None => tmp_name(id),
            }
        };
        let st = desc.state();
        let count = clamp.map_or(st.count, |c| c.min(st.count));
        let hfree = if clamp.is_some() {
            count * st.width as u64
        } else {
            st.tail.free
        };
        Ok(DirEntry {
            id,
            status: 1,
            logical,
            physical: physical_name(id),
            props: st.props,
            count,
            capacity: st.capacity,
            hseqbase: st.hseqbase,
            type_name: atoms().name(desc.ttype()),
            width: st.width,
            var: st.vheap.is_some(),
            flags: DirEntry::pack_flags(st.sorted, st.revsorted, st.key),
            nokey0: st.nokey.0,
            nokey1: st.nokey.1,
            nosorted: st.nosorted,
            norevsorted: st.norevsorted,
            seqbase: st.tseqbase,
            hfree,
            hsize: st.tail.size,
            minpos: st.minpos,
            maxpos: st.maxpos,
            vheap: st.vheap.as_ref().map(|vh| (vh.free, vh.size)),
            options,
        })
    }
}
