//!
//! Process-wide directory and residency manager for the bat columns of
//! a column store: id directory, reference counting and eviction,
//! crash-safe commits, and the logical-name index.
//!

pub mod atom;
mod commit;
mod common;
mod desc;
mod dirfile;
pub mod errors;
mod farm;
mod heap;
mod namehash;
mod pool;
mod recovery;
mod slots;
mod trim;

#[cfg(test)]
mod testing;

pub use atom::{AtomId, AtomRegistry, AtomUnfix, atoms};
pub use common::types::{BUN_NONE, BatId};
pub use desc::BatDesc;
pub use errors::{PoolError, Result};
pub use farm::FarmRole;
pub use heap::HeapMode;
pub use pool::{Bbp, PoolGuard, PoolOptions, PoolStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works() {
        println!("{}", errors::PoolError::NameTooLong);

        let id: BatId = 64;
        assert_eq!(id & 0o77, 0);
    }
}
