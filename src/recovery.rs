//! Startup recovery and the disk scan.
//!
//! Recovery rolls the data directory forward or back from any
//! interrupted commit using only what is on disk; it runs before the
//! manifest is read and is idempotent. The disk scan runs after the
//! directory is loaded and deletes files that no persistent bat
//! accounts for, stopping at anything it does not recognise.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use crate::commit::{bakdir, deldir, subdir};
use crate::common::types::{BatId, STRBATMOVE_SIGNAL};
use crate::common::{BatStatus, parse_physical_stem, physical_name, physical_subdir};
use crate::desc::tail_ext;
use crate::errors::Result;
use crate::pool::RawPool;

const LEFTDIR: &str = "LEFT";
const TEMPDIR: &str = "TEMP";

/// Rolls the data directory into a consistent state. Safe to run any
/// number of times; a second run finds nothing to do.
pub(crate) fn recover(root: &Path) -> Result<()> {
    // scratch space and published garbage go unconditionally
    remove_dir_quiet(&root.join(TEMPDIR));
    remove_dir_quiet(&deldir(root));

    recover_subdir(root)?;

    let bak = bakdir(root);
    let staged_manifest = bak.join("BBP.dir");
    let cur = root.join("BBP.dir");
    if staged_manifest.exists() {
        // an interrupted commit: the staged pre-commit manifest wins
        if cur.exists() {
            fs::rename(&cur, root.join("BBP.bak"))?;
        }
        fs::rename(&staged_manifest, &cur)?;
        info!("recovered pre-commit manifest from {}", bak.display());
    } else if !cur.exists() && root.join("BBP.bak").exists() {
        fs::rename(root.join("BBP.bak"), &cur)?;
        info!("recovered manifest from BBP.bak");
    }

    if bak.exists() {
        recover_backup_files(root, &bak)?;
        // the emptied staging directory is renamed away and dropped
        let grave = deldir(root);
        fs::rename(&bak, &grave)?;
        if let Err(e) = fs::remove_dir_all(&grave) {
            debug!("leaving {} behind: {e}", grave.display());
        }
    }
    Ok(())
}

/// Moves nested subcommit staging up into `BACKUP/`, replacing whatever
/// is there. In particular the staged pre-subcommit manifest overwrites
/// a half-published new one, which is what makes a subcommit crash roll
/// back.
pub(crate) fn recover_subdir(root: &Path) -> Result<()> {
    let sd = subdir(root);
    if !sd.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&sd)? {
        let entry = entry?;
        let dst = bakdir(root).join(entry.file_name());
        if dst.exists() {
            fs::remove_file(&dst)?;
        }
        fs::rename(entry.path(), dst)?;
    }
    fs::remove_dir(&sd)?;
    debug!("subcommit staging folded into {}", bakdir(root).display());
    Ok(())
}

// Every staged file goes back to its id-derived subdirectory; kill
// markers delete the half-written `.new` file they name; files whose
// name does not derive from an id are quarantined, never deleted.
fn recover_backup_files(root: &Path, bak: &Path) -> Result<()> {
    let mut markers = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(bak)? {
        let entry = entry?;
        if entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".kill") {
            markers.push(name);
        } else {
            files.push(name);
        }
    }

    for marker in markers {
        let target = marker.trim_end_matches(".kill");
        let stem = target.split('.').next().unwrap_or("");
        if let Some(id) = parse_physical_stem(stem) {
            let victim = join_subdir(root, id, target);
            if victim.exists() {
                fs::remove_file(&victim)?;
                debug!("kill marker dropped {}", victim.display());
            }
        }
        fs::remove_file(bak.join(&marker))?;
    }

    for name in files {
        let stem = name.split('.').next().unwrap_or("");
        match parse_physical_stem(stem) {
            Some(id) => {
                let dest = join_subdir(root, id, &name);
                if let Some(dir) = dest.parent() {
                    fs::create_dir_all(dir)?;
                }
                if dest.exists() {
                    fs::remove_file(&dest)?;
                }
                fs::rename(bak.join(&name), &dest)?;
                debug!("restored {}", dest.display());
            }
            None => {
                // never guess: park it for offline inspection
                let left = root.join(LEFTDIR);
                fs::create_dir_all(&left)?;
                fs::rename(bak.join(&name), left.join(&name))?;
                warn!("unrecognised staged file {name} moved to {LEFTDIR}/");
            }
        }
    }
    Ok(())
}

fn join_subdir(root: &Path, id: BatId, leaf: &str) -> std::path::PathBuf {
    let sub = physical_subdir(id);
    if sub.is_empty() {
        root.join(leaf)
    } else {
        root.join(sub).join(leaf)
    }
}

fn remove_dir_quiet(dir: &Path) {
    if dir.exists() {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("could not remove {}: {e}", dir.display());
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// Disk scan.
///////////////////////////////////////////////////////////////////////////

// The heap-class extensions a bat file may carry; auxiliary index files
// are rebuildable caches and never survive the scan.
const HEAP_EXTS: [&str; 6] = ["tail", "tail1", "tail2", "tail4", "theap", "tail.new"];
const AUX_EXTS: [&str; 4] = ["thashl", "thashb", "timprints", "torderidx"];

impl RawPool {
    /// Deletes every file under the data root that no persistent bat
    /// accounts for. Unknown names stop the scan of their directory.
    pub(crate) fn diskscan(&self, root: &Path) -> Result<()> {
        let tail_rename_pending = root.join(STRBATMOVE_SIGNAL).exists();
        self.scan_dir(root, root, tail_rename_pending)
    }

    fn scan_dir(&self, root: &Path, dir: &Path, rename_pending: bool) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if dir == root
                    && matches!(name.as_str(), "BACKUP" | "DELETE_ME" | LEFTDIR | TEMPDIR)
                {
                    continue;
                }
                if name.len() == 2 && name.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
                    self.scan_dir(root, &path, rename_pending)?;
                } else {
                    warn!("foreign directory {} left alone", path.display());
                }
                continue;
            }
            if dir == root
                && matches!(
                    name.as_str(),
                    "BBP.dir" | "BBP.bak" | STRBATMOVE_SIGNAL | ".farmlock"
                )
            {
                continue;
            }
            let Some((id, ext)) = classify(&name) else {
                warn!(
                    "unrecognised file {}; leaving {} unscanned",
                    name,
                    dir.display()
                );
                return Ok(());
            };
            if !self.file_accounted_for(root, &path, id, ext, rename_pending) {
                debug!("disk scan drops {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn file_accounted_for(
        &self,
        root: &Path,
        path: &Path,
        id: BatId,
        ext: &str,
        rename_pending: bool,
    ) -> bool {
        if AUX_EXTS.contains(&ext) || ext == "tail.new" {
            return false;
        }
        let Some(slot) = self.arena.get(id) else {
            return false;
        };
        if !slot.status().contains(BatStatus::PERSISTENT) || slot.lrefs() == 0 {
            return false;
        }
        let Some(desc) = (unsafe { slot.desc() }) else {
            return false;
        };
        let st = desc.state();
        let expected_ext = if ext == "theap" {
            if st.vheap.is_none() {
                return false;
            }
            "theap"
        } else {
            let wanted = tail_ext(st.width, st.vheap.is_some());
            // a pre-rename generation may still hold its data in `.tail`
            if ext != wanted && !(rename_pending && ext == "tail") {
                return false;
            }
            ext
        };
        // the file must also sit at the id-derived location
        path == root.join(format!("{}.{}", physical_name(id), expected_ext))
    }
}

fn classify(name: &str) -> Option<(BatId, &str)> {
    let dot = name.find('.')?;
    let (stem, ext) = (&name[..dot], &name[dot + 1..]);
    if !HEAP_EXTS.contains(&ext) && !AUX_EXTS.contains(&ext) {
        return None;
    }
    Some((parse_physical_stem(stem)?, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{bakdir, deldir, subdir};

    #[test]
    fn test_recover_empty_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        recover(dir.path()).unwrap();
        recover(dir.path()).unwrap();
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_temp_and_deleteme_removed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(TEMPDIR)).unwrap();
        fs::create_dir_all(deldir(dir.path())).unwrap();
        fs::write(deldir(dir.path()).join("junk"), b"x").unwrap();
        recover(dir.path()).unwrap();
        assert!(!dir.path().join(TEMPDIR).exists());
        assert!(!deldir(dir.path()).exists());
    }

    #[test]
    fn test_staged_manifest_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(bakdir(dir.path())).unwrap();
        fs::write(dir.path().join("BBP.dir"), b"new, uncommitted").unwrap();
        fs::write(bakdir(dir.path()).join("BBP.dir"), b"old, committed").unwrap();
        recover(dir.path()).unwrap();
        assert_eq!(
            fs::read(dir.path().join("BBP.dir")).unwrap(),
            b"old, committed"
        );
        assert!(!bakdir(dir.path()).exists());
    }

    #[test]
    fn test_subdir_manifest_overwrites_backup_one() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(subdir(dir.path())).unwrap();
        fs::write(bakdir(dir.path()).join("BBP.dir"), b"half-published new").unwrap();
        fs::write(subdir(dir.path()).join("BBP.dir"), b"pre-subcommit old").unwrap();
        recover(dir.path()).unwrap();
        assert_eq!(
            fs::read(dir.path().join("BBP.dir")).unwrap(),
            b"pre-subcommit old"
        );
    }

    #[test]
    fn test_staged_files_move_home() {
        let dir = tempfile::tempdir().unwrap();
        let bak = bakdir(dir.path());
        fs::create_dir_all(&bak).unwrap();
        // id 0o1234 lives in subdirectory 12
        fs::write(bak.join("1234.tail"), b"bytes").unwrap();
        // unknown name is quarantined
        fs::write(bak.join("strange.dat"), b"?").unwrap();
        recover(dir.path()).unwrap();
        assert_eq!(
            fs::read(dir.path().join("12/1234.tail")).unwrap(),
            b"bytes"
        );
        assert!(dir.path().join(LEFTDIR).join("strange.dat").exists());
        assert!(!bak.exists());
    }

    #[test]
    fn test_kill_marker_deletes_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let bak = bakdir(dir.path());
        fs::create_dir_all(&bak).unwrap();
        fs::create_dir_all(dir.path().join("12")).unwrap();
        fs::write(dir.path().join("12/1234.tail.new"), b"half-written").unwrap();
        fs::write(bak.join("1234.tail.new.kill"), b"").unwrap();
        recover(dir.path()).unwrap();
        assert!(!dir.path().join("12/1234.tail.new").exists());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("1234.tail"), Some((0o1234, "tail")));
        assert_eq!(classify("10.theap"), Some((0o10, "theap")));
        assert_eq!(classify("10.thashl"), Some((0o10, "thashl")));
        assert_eq!(classify("10.tail.new"), Some((0o10, "tail.new")));
        assert_eq!(classify("8.tail"), None);
        assert_eq!(classify("10.weird"), None);
        assert_eq!(classify("noext"), None);
    }
}
