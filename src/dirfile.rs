//! The BBP.dir manifest.
//!
//! A line-oriented text file enumerating every persistent bat and its
//! heap metadata:
//!
//! ```text
//! BBP.dir, GDKversion <u32>
//! <pointer-size> <oid-size> <max-int-size>
//! BBPsize=<max-id-plus-one>
//! BBPinfo=<log-seqno> <tx-id>
//! <id> <status> <logical> <physical> <props> <count> <capacity> <hseqbase> \
//!     <type> <width> <var> <flags> <nokey0> <nokey1> <nosorted> <norevsorted> \
//!     <seqbase> <hfree> <hsize> 0 <minpos> <maxpos> [<vhfree> <vhsize> 0] [<options>]
//! ```
//!
//! The reader validates every line and accepts the two previous format
//! generations: one without the per-bat min/max positions, one from
//! before the string-offset tails were renamed by width. The only disk
//! side effect of reading is the optional signal file that requests the
//! rename pass after the next successful commit.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::mem;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::atom::atoms;
use crate::common::physical_name;
use crate::common::types::{
    BUN_NONE, BatId, GDK_VERSION, GDK_VERSION_MINMAX_POS, GDK_VERSION_TAILN, MAX_BAT_ID,
    STRBATMOVE_SIGNAL,
};
use crate::desc::{BatDesc, DescState, tail_ext};
use crate::errors::{PoolError, Result};
use crate::farm::FarmRole;
use crate::heap::Heap;
use crate::pool::DirInfo;

// Tail property flag bits persisted in the <flags> field.
const FLAG_SORTED: u16 = 1 << 0;
const FLAG_REVSORTED: u16 = 1 << 1;
const FLAG_KEY: u16 = 1 << 2;

#[derive(Debug)]
pub(crate) struct DirHeader {
    pub version: u32,
    pub size: BatId,
    pub logno: u64,
    pub transid: u64,
}

#[derive(Debug)]
pub(crate) struct DirEntry {
    pub id: BatId,
    pub status: u32,
    pub logical: String,
    pub physical: String,
    pub props: u32,
    pub count: u64,
    pub capacity: u64,
    pub hseqbase: u64,
    pub type_name: String,
    pub width: u16,
    pub var: bool,
    pub flags: u16,
    pub nokey0: u64,
    pub nokey1: u64,
    pub nosorted: u64,
    pub norevsorted: u64,
    pub seqbase: u64,
    pub hfree: u64,
    pub hsize: u64,
    pub minpos: u64,
    pub maxpos: u64,
    pub vheap: Option<(u64, u64)>,
    pub options: Option<String>,
}

#[derive(Debug)]
pub(crate) struct Manifest {
    pub header: DirHeader,
    pub entries: Vec<DirEntry>,
}

impl DirEntry {
    /// Rebuilds the descriptor this entry describes; heaps stay
    /// unloaded.
    pub(crate) fn to_desc(&self) -> Result<BatDesc> {
        let ttype = match atoms().index(&self.type_name) {
            Some(t) => t,
            None => atoms().register_unknown(&self.type_name, self.width, self.var),
        };
        let ext = tail_ext(self.width, self.var);
        let mut tail = Heap::unloaded(
            FarmRole::PERSISTENT,
            format!("{}.{}", self.physical, ext),
            self.id,
        );
        tail.free = self.hfree;
        tail.size = self.hsize;
        let vheap = self.vheap.map(|(vfree, vsize)| {
            let mut vh = Heap::unloaded(
                FarmRole::PERSISTENT,
                format!("{}.theap", self.physical),
                self.id,
            );
            vh.free = vfree;
            vh.size = vsize;
            vh
        });
        Ok(BatDesc::from_parts(
            self.id,
            ttype,
            DescState {
                width: self.width,
                count: self.count,
                capacity: self.capacity,
                inserted: self.count,
                hseqbase: self.hseqbase,
                tseqbase: self.seqbase,
                props: self.props,
                sorted: self.flags & FLAG_SORTED != 0,
                revsorted: self.flags & FLAG_REVSORTED != 0,
                key: self.flags & FLAG_KEY != 0,
                nokey: (self.nokey0, self.nokey1),
                nosorted: self.nosorted,
                norevsorted: self.norevsorted,
                minpos: self.minpos,
                maxpos: self.maxpos,
                desc_dirty: false,
                tail,
                vheap,
            },
        ))
    }

    fn format(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} 0 {} {}",
            self.id,
            self.status,
            self.logical,
            self.physical,
            self.props,
            self.count,
            self.capacity,
            self.hseqbase,
            self.type_name,
            self.width,
            self.var as u8,
            self.flags,
            self.nokey0,
            self.nokey1,
            self.nosorted,
            self.norevsorted,
            self.seqbase,
            self.hfree,
            self.hsize,
            self.minpos,
            self.maxpos,
        );
        if let Some((vfree, vsize)) = self.vheap {
            line.push_str(&format!(" {vfree} {vsize} 0"));
        }
        if let Some(opts) = &self.options {
            if !opts.is_empty() {
                line.push(' ');
                line.push_str(opts);
            }
        }
        line
    }

    /// Packs tail property flags the way the manifest carries them.
    pub(crate) fn pack_flags(sorted: bool, revsorted: bool, key: bool) -> u16 {
        (sorted as u16) * FLAG_SORTED
            | (revsorted as u16) * FLAG_REVSORTED
            | (key as u16) * FLAG_KEY
    }
}

///////////////////////////////////////////////////////////////////////////
// Reading.
///////////////////////////////////////////////////////////////////////////

// One whitespace-separated line, consumed token by token.
struct Fields<'a> {
    it: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str) -> Self {
        Fields {
            it: line.split_whitespace(),
        }
    }

    fn next_str(&mut self) -> Option<&'a str> {
        self.it.next()
    }

    fn next_u64(&mut self) -> Option<u64> {
        self.it.next()?.parse().ok()
    }

    fn next_u32(&mut self) -> Option<u32> {
        self.it.next()?.parse().ok()
    }

    fn rest(&mut self) -> Option<String> {
        let rest: Vec<&str> = self.it.by_ref().collect();
        if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        }
    }
}

fn corrupt(what: impl Into<String>) -> PoolError {
    PoolError::Corrupt(what.into())
}

/// Reads and validates `BBP.dir` under `root`.
pub(crate) fn read_dir(root: &Path) -> Result<Manifest> {
    let path = root.join("BBP.dir");
    let file = File::open(&path)?;
    let mut lines = BufReader::new(file).lines();
    let header = read_header(&mut lines)?;
    if header.version <= GDK_VERSION_TAILN {
        // ask for the tail rename pass once the next commit has gone
        // through; reading must not touch the bat files themselves
        debug!("directory version {} needs the tail rename pass", header.version);
        fs::write(root.join(STRBATMOVE_SIGNAL), b"")?;
    }
    let entries = read_entries(&mut lines, &header, root)?;
    Ok(Manifest { header, entries })
}

fn read_header(lines: &mut Lines<BufReader<File>>) -> Result<DirHeader> {
    let magic = lines
        .next()
        .transpose()?
        .ok_or_else(|| corrupt("empty directory file"))?;
    let version: u32 = magic
        .strip_prefix("BBP.dir, GDKversion ")
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| corrupt("bad first line"))?;
    if version != GDK_VERSION
        && version != GDK_VERSION_TAILN
        && version != GDK_VERSION_MINMAX_POS
    {
        return Err(PoolError::VersionMismatch {
            found: version,
            expected: GDK_VERSION,
        });
    }

    let sizes = lines
        .next()
        .transpose()?
        .ok_or_else(|| corrupt("missing word-size line"))?;
    let mut f = Fields::new(&sizes);
    let ptr_size = f.next_u32().ok_or_else(|| corrupt("bad word-size line"))?;
    let oid_size = f.next_u32().ok_or_else(|| corrupt("bad word-size line"))?;
    let int_size = f.next_u32().ok_or_else(|| corrupt("bad word-size line"))?;
    if ptr_size != mem::size_of::<usize>() as u32
        || oid_size != mem::size_of::<u64>() as u32
        || int_size != mem::size_of::<i64>() as u32
    {
        return Err(PoolError::WordSizeMismatch);
    }

    let size_line = lines
        .next()
        .transpose()?
        .ok_or_else(|| corrupt("missing BBPsize line"))?;
    let size: BatId = size_line
        .strip_prefix("BBPsize=")
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| corrupt("bad BBPsize line"))?;
    if size > MAX_BAT_ID {
        return Err(PoolError::IdOverflow);
    }

    let info_line = lines
        .next()
        .transpose()?
        .ok_or_else(|| corrupt("missing BBPinfo line"))?;
    let mut f = Fields::new(
        info_line
            .strip_prefix("BBPinfo=")
            .ok_or_else(|| corrupt("bad BBPinfo line"))?,
    );
    let logno = f.next_u64().ok_or_else(|| corrupt("bad BBPinfo line"))?;
    let transid = f.next_u64().ok_or_else(|| corrupt("bad BBPinfo line"))?;

    Ok(DirHeader {
        version,
        size,
        logno,
        transid,
    })
}

// The entry loop's only successful exit is the end-of-file branch inside
// it; every malformed line breaks out to the single bailout below.
fn read_entries(
    lines: &mut Lines<BufReader<File>>,
    header: &DirHeader,
    root: &Path,
) -> Result<Vec<DirEntry>> {
    let mut entries: Vec<DirEntry> = Vec::new();
    let mut bail = String::new();
    loop {
        let line = match lines.next().transpose()? {
            None => return Ok(entries),
            Some(l) => l,
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_entry(&line, header, root) {
            Ok(entry) => {
                if let Some(last) = entries.last() {
                    if entry.id <= last.id {
                        bail = format!("ids out of order at {}", entry.id);
                        break;
                    }
                }
                entries.push(entry);
            }
            Err(e) => {
                bail = e;
                break;
            }
        }
    }
    warn!("directory entry rejected: {bail}");
    Err(corrupt(bail))
}

fn parse_entry(
    line: &str,
    header: &DirHeader,
    root: &Path,
) -> std::result::Result<DirEntry, String> {
    let mut f = Fields::new(line);
    let id = f
        .next_u32()
        .filter(|&id| id > 0 && id <= MAX_BAT_ID)
        .ok_or_else(|| format!("bad id in {line:?}"))? as BatId;
    if id >= header.size {
        return Err(format!("id {id} beyond BBPsize {}", header.size));
    }
    let status = f.next_u32().ok_or("missing status")?;
    let logical = f.next_str().ok_or("missing logical name")?.to_string();
    let physical = f.next_str().ok_or("missing physical name")?.to_string();
    if physical != physical_name(id) {
        return Err(format!("physical name {physical} does not derive from id {id}"));
    }
    let props = f.next_u32().ok_or("missing props")?;
    let count = f.next_u64().ok_or("missing count")?;
    let capacity = f.next_u64().ok_or("missing capacity")?;
    let hseqbase = f.next_u64().ok_or("missing hseqbase")?;

    let type_name = f.next_str().ok_or("missing type")?.to_string();
    let width = f.next_u32().ok_or("missing width")? as u16;
    let var = match f.next_u32().ok_or("missing var flag")? {
        0 => false,
        1 => true,
        v => return Err(format!("bad var flag {v}")),
    };
    if let Some(ttype) = atoms().index(&type_name) {
        if atoms().known(ttype) {
            if atoms().varsized(ttype) != var {
                return Err(format!("var flag contradicts type {type_name}"));
            }
            if var {
                if !matches!(width, 1 | 2 | 4 | 8) {
                    return Err(format!("bad offset width {width}"));
                }
            } else if width != atoms().size(ttype) {
                return Err(format!("width {width} contradicts type {type_name}"));
            }
        }
    }
    let flags = f.next_u32().ok_or("missing flags")? as u16;
    let nokey0 = f.next_u64().ok_or("missing nokey0")?;
    let nokey1 = f.next_u64().ok_or("missing nokey1")?;
    let nosorted = f.next_u64().ok_or("missing nosorted")?;
    let norevsorted = f.next_u64().ok_or("missing norevsorted")?;
    let seqbase = f.next_u64().ok_or("missing seqbase")?;
    let hfree = f.next_u64().ok_or("missing hfree")?;
    let hsize = f.next_u64().ok_or("missing hsize")?;
    if f.next_u32().ok_or("missing storage field")? != 0 {
        return Err("bad storage field".to_string());
    }
    let (minpos, maxpos) = if header.version > GDK_VERSION_MINMAX_POS {
        (
            f.next_u64().ok_or("missing minpos")?,
            f.next_u64().ok_or("missing maxpos")?,
        )
    } else {
        (BUN_NONE, BUN_NONE)
    };

    let vheap = if var {
        let vfree = f.next_u64().ok_or("missing vhfree")?;
        let vsize = f.next_u64().ok_or("missing vhsize")?;
        if f.next_u32().ok_or("missing vheap storage field")? != 0 {
            return Err("bad vheap storage field".to_string());
        }
        Some((vfree, vsize))
    } else {
        None
    };
    let options = f.rest();

    // the committed heap image must actually be there
    if hfree > 0 {
        let ext = tail_ext(width, var);
        let path = root.join(format!("{physical}.{ext}"));
        match fs::metadata(&path) {
            Ok(md) if md.len() >= hfree => {}
            Ok(md) => {
                return Err(format!(
                    "heap file {} too short ({} < {hfree})",
                    path.display(),
                    md.len()
                ));
            }
            Err(e) => return Err(format!("heap file {}: {e}", path.display())),
        }
    }
    if let Some((vfree, _)) = vheap {
        if vfree > 0 {
            let path = root.join(format!("{physical}.theap"));
            match fs::metadata(&path) {
                Ok(md) if md.len() >= vfree => {}
                Ok(_) => return Err(format!("var heap {} too short", path.display())),
                Err(e) => return Err(format!("var heap {}: {e}", path.display())),
            }
        }
    }

    Ok(DirEntry {
        id,
        status,
        logical,
        physical,
        props,
        count,
        capacity,
        hseqbase,
        type_name,
        width,
        var,
        flags,
        nokey0,
        nokey1,
        nosorted,
        norevsorted,
        seqbase,
        hfree,
        hsize,
        minpos,
        maxpos,
        vheap,
        options,
    })
}

///////////////////////////////////////////////////////////////////////////
// Writing.
///////////////////////////////////////////////////////////////////////////

// The not-yet-consumed entries of the previous manifest, for subcommit
// merging. Copied lines stay byte-identical.
struct OldEntries {
    lines: std::iter::Peekable<Lines<BufReader<File>>>,
}

impl OldEntries {
    fn open(path: &Path) -> Result<Self> {
        let mut lines = BufReader::new(File::open(path)?).lines();
        for _ in 0..4 {
            lines
                .next()
                .transpose()?
                .ok_or_else(|| corrupt("old manifest truncated"))?;
        }
        Ok(OldEntries {
            lines: lines.peekable(),
        })
    }

    fn peek_id(&mut self) -> Result<Option<BatId>> {
        match self.lines.peek() {
            None => Ok(None),
            Some(Err(_)) => Err(corrupt("old manifest unreadable")),
            Some(Ok(line)) => {
                let id = line
                    .split_whitespace()
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| corrupt("old manifest entry without id"))?;
                Ok(Some(id))
            }
        }
    }

    fn take_line(&mut self) -> Result<String> {
        self.lines
            .next()
            .transpose()
            .map_err(|_| corrupt("old manifest unreadable"))?
            .ok_or_else(|| corrupt("old manifest exhausted"))
    }
}

/// Streams a new manifest, optionally merging forward the entries of an
/// old one that the caller does not overwrite.
pub(crate) struct DirWriter {
    out: BufWriter<File>,
    old: Option<OldEntries>,
    path: PathBuf,
}

impl DirWriter {
    pub(crate) fn create(
        path: &Path,
        size: BatId,
        info: &DirInfo,
        old: Option<&Path>,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "BBP.dir, GDKversion {GDK_VERSION}")?;
        writeln!(
            out,
            "{} {} {}",
            mem::size_of::<usize>(),
            mem::size_of::<u64>(),
            mem::size_of::<i64>()
        )?;
        writeln!(out, "BBPsize={size}")?;
        writeln!(out, "BBPinfo={} {}", info.logno, info.transid)?;
        let old = match old {
            Some(p) => Some(OldEntries::open(p)?),
            None => None,
        };
        Ok(DirWriter {
            out,
            old,
            path: path.to_path_buf(),
        })
    }

    /// Advances the merge cursor past old entries below `id` and drops
    /// the old entry equal to it; the caller then emits the replacement
    /// (or nothing, deleting the bat from the manifest).
    pub(crate) fn step(&mut self, id: BatId) -> Result<()> {
        let Some(old) = self.old.as_mut() else {
            return Ok(());
        };
        while let Some(old_id) = old.peek_id()? {
            if old_id > id {
                break;
            }
            let line = old.take_line()?;
            if old_id < id {
                writeln!(self.out, "{line}")?;
            }
        }
        Ok(())
    }

    pub(crate) fn entry(&mut self, e: &DirEntry) -> Result<()> {
        writeln!(self.out, "{}", e.format())?;
        Ok(())
    }

    /// Copies any remaining old entries, flushes and syncs the file.
    pub(crate) fn finish(mut self) -> Result<()> {
        if let Some(old) = self.old.as_mut() {
            while old.peek_id()?.is_some() {
                let line = old.take_line()?;
                writeln!(self.out, "{line}")?;
            }
        }
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        debug!("manifest {} written", self.path.display());
        Ok(())
    }
}

/// An empty manifest for a brand-new database.
pub(crate) fn write_fresh(root: &Path, size: BatId, info: &DirInfo) -> Result<()> {
    DirWriter::create(&root.join("BBP.dir"), size, info, None)?.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: BatId, count: u64) -> DirEntry {
        DirEntry {
            id,
            status: 1,
            logical: format!("t{id}"),
            physical: physical_name(id),
            props: 0,
            count,
            capacity: count.max(1),
            hseqbase: 0,
            type_name: "int".to_string(),
            width: 4,
            var: false,
            flags: DirEntry::pack_flags(false, false, false),
            nokey0: BUN_NONE,
            nokey1: BUN_NONE,
            nosorted: BUN_NONE,
            norevsorted: BUN_NONE,
            seqbase: BUN_NONE,
            hfree: 0,
            hsize: 0,
            minpos: BUN_NONE,
            maxpos: BUN_NONE,
            vheap: None,
            options: None,
        }
    }

    fn write_manifest(root: &Path, size: BatId, entries: &[DirEntry]) {
        let mut w =
            DirWriter::create(&root.join("BBP.dir"), size, &DirInfo::default(), None).unwrap();
        for e in entries {
            w.entry(e).unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn test_write_read_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = entry(3, 4);
        e.options = Some("role=sql".to_string());
        write_manifest(dir.path(), 7, &[entry(2, 1), e]);

        let m = read_dir(dir.path()).unwrap();
        assert_eq!(m.header.version, GDK_VERSION);
        assert_eq!(m.header.size, 7);
        assert_eq!(m.entries.len(), 2);
        let back = &m.entries[1];
        assert_eq!(back.id, 3);
        assert_eq!(back.logical, "t3");
        assert_eq!(back.count, 4);
        assert_eq!(back.options.as_deref(), Some("role=sql"));
        assert_eq!(back.minpos, BUN_NONE);
    }

    #[test]
    fn test_merge_step() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 9, &[entry(2, 1), entry(3, 1), entry(5, 1)]);
        let old = dir.path().join("BBP.dir.old");
        fs::rename(dir.path().join("BBP.dir"), &old).unwrap();

        let mut w = DirWriter::create(
            &dir.path().join("BBP.dir"),
            9,
            &DirInfo {
                logno: 7,
                transid: 42,
            },
            Some(old.as_path()),
        )
        .unwrap();
        // overwrite 3, delete 5, keep 2 untouched
        w.step(3).unwrap();
        w.entry(&entry(3, 99)).unwrap();
        w.step(5).unwrap();
        w.finish().unwrap();

        let m = read_dir(dir.path()).unwrap();
        assert_eq!(m.header.logno, 7);
        assert_eq!(m.header.transid, 42);
        let ids: Vec<_> = m.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(m.entries[1].count, 99);
    }

    #[test]
    fn test_untouched_lines_stay_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 9, &[entry(2, 1), entry(5, 1)]);
        let original = fs::read_to_string(dir.path().join("BBP.dir")).unwrap();
        let wanted: Vec<&str> = original
            .lines()
            .skip(4)
            .filter(|l| l.starts_with("2 "))
            .collect();

        let old = dir.path().join("BBP.dir.old");
        fs::rename(dir.path().join("BBP.dir"), &old).unwrap();
        let mut w = DirWriter::create(
            &dir.path().join("BBP.dir"),
            9,
            &DirInfo::default(),
            Some(old.as_path()),
        )
        .unwrap();
        w.step(5).unwrap();
        w.entry(&entry(5, 7)).unwrap();
        w.finish().unwrap();

        let merged = fs::read_to_string(dir.path().join("BBP.dir")).unwrap();
        let kept: Vec<&str> = merged
            .lines()
            .skip(4)
            .filter(|l| l.starts_with("2 "))
            .collect();
        assert_eq!(kept, wanted);
    }

    #[test]
    fn test_version_rejection() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("BBP.dir"),
            "BBP.dir, GDKversion 60000\n8 8 8\nBBPsize=1\nBBPinfo=0 0\n",
        )
        .unwrap();
        let err = read_dir(dir.path()).unwrap_err();
        assert!(matches!(err, PoolError::VersionMismatch { found: 60000, .. }));
    }

    #[test]
    fn test_word_size_rejection() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("BBP.dir"),
            format!("BBP.dir, GDKversion {GDK_VERSION}\n4 4 4\nBBPsize=1\nBBPinfo=0 0\n"),
        )
        .unwrap();
        assert_eq!(read_dir(dir.path()).unwrap_err(), PoolError::WordSizeMismatch);
    }

    #[test]
    fn test_old_version_without_minmax() {
        let dir = tempfile::tempdir().unwrap();
        // a MINMAX_POS-generation entry line carries 12 heap fields
        let line = format!(
            "2 1 t2 {} 0 0 1 0 int 4 0 0 {n} {n} {n} {n} {n} 0 0 0\n",
            physical_name(2),
            n = BUN_NONE
        );
        fs::write(
            dir.path().join("BBP.dir"),
            format!(
                "BBP.dir, GDKversion {GDK_VERSION_MINMAX_POS}\n8 8 8\nBBPsize=3\nBBPinfo=0 0\n{line}"
            ),
        )
        .unwrap();
        let m = read_dir(dir.path()).unwrap();
        assert_eq!(m.entries[0].minpos, BUN_NONE);
        assert_eq!(m.entries[0].maxpos, BUN_NONE);
        // pre-tail-rename generations leave the signal file behind
        assert!(dir.path().join(STRBATMOVE_SIGNAL).exists());
    }

    #[test]
    fn test_unknown_type_retained() {
        let dir = tempfile::tempdir().unwrap();
        let line = format!(
            "2 1 t2 {} 0 0 1 0 uuid7 16 0 0 {n} {n} {n} {n} {n} 0 0 0 {n} {n}\n",
            physical_name(2),
            n = BUN_NONE
        );
        fs::write(
            dir.path().join("BBP.dir"),
            format!("BBP.dir, GDKversion {GDK_VERSION}\n8 8 8\nBBPsize=3\nBBPinfo=0 0\n{line}"),
        )
        .unwrap();
        let m = read_dir(dir.path()).unwrap();
        assert_eq!(m.entries[0].type_name, "uuid7");
        let desc = m.entries[0].to_desc().unwrap();
        assert_eq!(atoms().name(desc.ttype()), "uuid7");
        assert!(!atoms().known(desc.ttype()));
    }

    #[test]
    fn test_width_contradiction_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let line = format!(
            "2 1 t2 {} 0 0 1 0 int 8 0 0 {n} {n} {n} {n} {n} 0 0 0 {n} {n}\n",
            physical_name(2),
            n = BUN_NONE
        );
        fs::write(
            dir.path().join("BBP.dir"),
            format!("BBP.dir, GDKversion {GDK_VERSION}\n8 8 8\nBBPsize=3\nBBPinfo=0 0\n{line}"),
        )
        .unwrap();
        assert!(matches!(
            read_dir(dir.path()).unwrap_err(),
            PoolError::Corrupt(_)
        ));
    }

    #[test]
    fn test_missing_heap_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = entry(2, 4);
        e.hfree = 16;
        e.hsize = 4096;
        write_manifest(dir.path(), 3, &[e]);
        assert!(matches!(
            read_dir(dir.path()).unwrap_err(),
            PoolError::Corrupt(_)
        ));
    }
}
