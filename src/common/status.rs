//! Per-slot status word.

use std::fmt::{self, Display, Formatter};

use bitflags::bitflags;

bitflags! {
    // One bit per residency / lifecycle state of a slot. Writes go through
    // the slot's swap-lock stripe; waiters re-test after a bounded sleep.
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct BatStatus: u32 {
        /// The in-memory image of the bat is materialised.
        const LOADED     = 1 << 0;
        /// Some thread is materialising the bat from disk.
        const LOADING    = 1 << 1;
        /// Some thread is tearing the in-memory image down.
        const UNLOADING  = 1 << 2;
        /// Some thread is writing the bat to disk.
        const SAVING     = 1 << 3;
        /// The bat takes part in the commit in flight.
        const SYNCING    = 1 << 4;
        /// The delta part of the bat has been written out.
        const SWAPPED    = 1 << 5;
        /// Persistent bat logically deleted, files dropped at the next commit.
        const DELETED    = 1 << 6;
        /// Present in the last committed directory image.
        const EXISTING   = 1 << 7;
        /// The bat belongs to the persistent part of the store.
        const PERSISTENT = 1 << 8;
        /// Transient bat whose image is temporarily on disk.
        const TMP        = 1 << 9;
        /// Became persistent after the last commit.
        const NEW        = 1 << 10;
        /// Recently used; the trimmer skips it and clears the bit.
        const HOT        = 1 << 11;
        /// Renamed since the last commit; the directory entry must be rewritten.
        const RENAMED    = 1 << 12;
        /// The slot is being created or destroyed.
        const DELETING   = 1 << 13;

        /// Some thread is moving this slot between disk and memory.
        const WAITING = Self::LOADING.bits()
            | Self::UNLOADING.bits()
            | Self::SAVING.bits()
            | Self::DELETING.bits();
        /// The slot may change identity under a reader that backs off.
        const UNSTABLE = Self::DELETING.bits()
            | Self::UNLOADING.bits()
            | Self::LOADING.bits();
    }
}

impl Display for BatStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:0x}", self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composites() {
        assert!(BatStatus::WAITING.contains(BatStatus::LOADING));
        assert!(BatStatus::WAITING.contains(BatStatus::SAVING));
        assert!(BatStatus::UNSTABLE.contains(BatStatus::DELETING));
        assert!(!BatStatus::UNSTABLE.contains(BatStatus::SAVING));
    }

    #[test]
    fn test_roundtrip_bits() {
        let s = BatStatus::LOADED | BatStatus::PERSISTENT | BatStatus::HOT;
        assert_eq!(BatStatus::from_bits_retain(s.bits()), s);
    }
}
