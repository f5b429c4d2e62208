//! Storage farms.
//!
//! A farm maps a set of storage roles to a directory on disk. All farms
//! must be registered before the pool initialises; at init every farm
//! directory is created if needed and locked against other processes.

use std::fmt::{self, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use fs4::fs_std::FileExt;
use log::{debug, warn};

use crate::errors::{PoolError, Result};

bitflags! {
    /// Storage roles a farm can serve.
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct FarmRole: u32 {
        /// Committed bats and the BBP.dir manifest.
        const PERSISTENT = 1 << 0;
        /// Swapped-out transient bats.
        const TRANSIENT  = 1 << 1;
    }
}

impl Display for FarmRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:0x}", self.bits())
    }
}

pub(crate) const MAX_FARMS: usize = 32;

const FARM_LOCK_FILE: &str = ".farmlock";

pub(crate) struct Farm {
    pub(crate) path: PathBuf,
    pub(crate) roles: FarmRole,
    // held for the lifetime of the pool; dropping releases the lock
    lock_file: Option<File>,
}

#[derive(Default)]
pub(crate) struct Farms {
    farms: Vec<Farm>,
}

impl Farms {
    pub(crate) fn new() -> Self {
        Farms::default()
    }

    /// Registers a directory for the given roles. Re-registering the same
    /// directory merges the role masks.
    pub(crate) fn add(&mut self, dir: &Path, roles: FarmRole) -> Result<()> {
        if roles.is_empty() {
            return Err(PoolError::NoFarm);
        }
        if let Some(farm) = self.farms.iter_mut().find(|f| f.path == dir) {
            farm.roles |= roles;
            return Ok(());
        }
        if self.farms.len() >= MAX_FARMS {
            return Err(PoolError::TooManyFarms);
        }
        debug!("registering farm {} for roles {}", dir.display(), roles);
        self.farms.push(Farm {
            path: dir.to_path_buf(),
            roles,
            lock_file: None,
        });
        Ok(())
    }

    /// The directory serving a role. The transient role falls back to the
    /// persistent farm so a pool with a single farm serves everything.
    pub(crate) fn resolve(&self, role: FarmRole) -> Result<&Path> {
        if let Some(farm) = self.farms.iter().find(|f| f.roles.contains(role)) {
            return Ok(&farm.path);
        }
        if role == FarmRole::TRANSIENT {
            return self.resolve(FarmRole::PERSISTENT);
        }
        Err(PoolError::NoFarm)
    }

    /// Creates and locks every registered farm directory. Fails when some
    /// other process already holds a farm.
    pub(crate) fn lock_all(&mut self) -> Result<()> {
        for farm in &mut self.farms {
            if farm.lock_file.is_some() {
                continue;
            }
            fs::create_dir_all(&farm.path)?;
            let lock = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(farm.path.join(FARM_LOCK_FILE))?;
            if !lock.try_lock_exclusive()? {
                warn!("farm {} is held by another process", farm.path.display());
                return Err(PoolError::Io(format!(
                    "farm {} is locked by another process",
                    farm.path.display()
                )));
            }
            farm.lock_file = Some(lock);
        }
        Ok(())
    }

    pub(crate) fn unlock_all(&mut self) {
        for farm in &mut self.farms {
            farm.lock_file = None;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.farms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_and_fallback() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut farms = Farms::new();
        farms.add(dir.path(), FarmRole::PERSISTENT)?;

        assert_eq!(farms.resolve(FarmRole::PERSISTENT)?, dir.path());
        // no transient farm registered: falls back to the persistent one
        assert_eq!(farms.resolve(FarmRole::TRANSIENT)?, dir.path());
        Ok(())
    }

    #[test]
    fn test_merge_roles() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut farms = Farms::new();
        farms.add(dir.path(), FarmRole::PERSISTENT)?;
        farms.add(dir.path(), FarmRole::TRANSIENT)?;
        assert_eq!(farms.farms.len(), 1);
        assert_eq!(
            farms.farms[0].roles,
            FarmRole::PERSISTENT | FarmRole::TRANSIENT
        );
        Ok(())
    }

    #[test]
    fn test_too_many_farms() {
        let mut farms = Farms::new();
        for i in 0..MAX_FARMS {
            farms
                .add(Path::new(&format!("/tmp/farm-{i}")), FarmRole::TRANSIENT)
                .unwrap();
        }
        let err = farms
            .add(Path::new("/tmp/farm-overflow"), FarmRole::TRANSIENT)
            .unwrap_err();
        assert_eq!(err, PoolError::TooManyFarms);
    }

    #[test]
    fn test_lock_creates_dir() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep/db");
        let mut farms = Farms::new();
        farms.add(&nested, FarmRole::PERSISTENT)?;
        farms.lock_all()?;
        assert!(nested.join(FARM_LOCK_FILE).exists());
        farms.unlock_all();
        Ok(())
    }
}
