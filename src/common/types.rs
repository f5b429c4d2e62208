//!
//! Pool default type declare
//!
use once_cell::sync::Lazy;
use std::time::Duration;

/// Bat identifier. Zero is reserved as nil; valid ids are positive.
pub type BatId = u32;

pub const NIL_BAT: BatId = 0;

/// Position marker meaning "no such position" (unknown min/max, no
/// property witness).
pub const BUN_NONE: u64 = u64::MAX;

// Slots come in contiguous slabs allocated on demand. A slab never moves
// once allocated, so descriptor pointers handed out earlier stay valid
// while the table grows.
pub(crate) const SLAB_SIZE: usize = 1 << 12;
pub(crate) const SLAB_COUNT: usize = 1 << 12;

/// Largest id the two-level slot table can address.
pub(crate) const MAX_BAT_ID: BatId = (SLAB_SIZE * SLAB_COUNT - 1) as BatId;

// The physical file stem encodes the id as 2-digit octal path segments;
// four segments is the widest stem the directory format carries.
const _: () = assert!((SLAB_SIZE * SLAB_COUNT - 1) as u64 <= 0o77_77_77_77);

// Swap-lock striping: status and counter writes for id go through the
// stripe `id & BAT_MASK`.
pub(crate) const BAT_MASK: usize = (1 << 7) - 1;

// Free-list sharding. A single shard by default; the sharded code is kept
// so a larger shard count can be chosen.
pub(crate) const FREE_SHARD_BITS: usize = 0;
pub(crate) const FREE_SHARDS: usize = 1 << FREE_SHARD_BITS;

// A shard only steals from another one when the victim holds more than
// this many free slots.
pub(crate) const STEAL_THRESHOLD: usize = 20;

/// Cadence of the sleep-then-retest wait on a status bit.
pub(crate) const SPIN: Duration = Duration::from_millis(1);

/// Longest accepted logical name.
pub(crate) const MAX_NAME_LEN: usize = 255;

// Directory format versions. Older versions gate both the width of the
// heap part of an entry line and the string-offset-heap rename step.
pub(crate) const GDK_VERSION: u32 = 61044;
pub(crate) const GDK_VERSION_TAILN: u32 = 61043;
pub(crate) const GDK_VERSION_MINMAX_POS: u32 = 61042;

/// Signal file requesting the tail rename pass after the next commit.
pub(crate) const STRBATMOVE_SIGNAL: &str = "needstrbatmove";

// Trimmer sleep bounds. The sleep shortens towards the minimum when heap
// bytes in use exceed half the configured cap.
pub(crate) const TRIM_SLEEP_MIN: Duration = Duration::from_millis(100);
pub(crate) const TRIM_SLEEP_MAX: Duration = Duration::from_secs(10);

// Address space the pool is prepared to devote to heap images. Narrow
// targets are bounded by what they can map at all; wide targets by not
// crowding out the rest of the engine.
#[cfg(target_pointer_width = "64")]
const MAX_HEAP_SPACE: u64 = 0xFFFF_FFFF_FFFF; // 256TB
#[cfg(not(target_pointer_width = "64"))]
const MAX_HEAP_SPACE: u64 = 0x7FFF_FFFF; // 2GB

// DefaultVmCap bounds the heap bytes kept resident before unfix starts
// evicting clean persistent bats; the trimmer treats half of it as
// pressure. A quarter of the heap space, clamped to 8GB.
pub(crate) static DEFAULT_VM_CAP: Lazy<usize> = Lazy::new(|| {
    let cap = MAX_HEAP_SPACE / 4;
    cap.min(8 << 30) as usize
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_bounds() {
        assert!(MAX_BAT_ID > 0);
        assert_eq!((MAX_BAT_ID as u64 + 1).count_ones(), 1);
        assert!(FREE_SHARDS >= 1);
    }
}
