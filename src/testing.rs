use std::ops::Deref;
use std::path::Path;

use tempfile::TempDir;

use crate::{Bbp, FarmRole, PoolOptions, Result};

pub(crate) fn temp_root() -> Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("batpool-rs-").tempdir()?;
    Ok(dir)
}

pub(crate) struct TestPool {
    pub(crate) dir: Option<TempDir>,
    pub(crate) pool: Option<Bbp>,
    options: PoolOptions,
}

impl Deref for TestPool {
    type Target = Bbp;

    fn deref(&self) -> &Self::Target {
        self.pool.as_ref().unwrap()
    }
}

impl TestPool {
    pub(crate) fn new() -> Result<Self> {
        // tests drive eviction by hand unless they opt in
        Self::with_options(PoolOptions {
            trimmer: false,
            ..Default::default()
        })
    }

    pub(crate) fn with_options(options: PoolOptions) -> Result<Self> {
        let dir = temp_root()?;
        let pool = Bbp::new(options.clone());
        pool.add_farm(dir.path(), FarmRole::PERSISTENT | FarmRole::TRANSIENT)?;
        pool.init()?;

        Ok(Self {
            dir: Some(dir),
            pool: Some(pool),
            options,
        })
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.as_ref().unwrap().path()
    }

    /// Simulates a server restart: the pool goes down and a fresh one
    /// comes up on the same directory.
    pub(crate) fn restart(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.exit();
        }
        let pool = Bbp::new(self.options.clone());
        pool.add_farm(self.root(), FarmRole::PERSISTENT | FarmRole::TRANSIENT)?;
        pool.init()?;
        self.pool = Some(pool);
        Ok(())
    }

    /// Simulates a crash: the pool is dropped without an orderly exit.
    pub(crate) fn crash_and_restart(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            // no exit(): farms unlock only because the process "died"
            pool.0.farms.lock().unlock_all();
            drop(pool);
        }
        let pool = Bbp::new(self.options.clone());
        pool.add_farm(self.root(), FarmRole::PERSISTENT | FarmRole::TRANSIENT)?;
        pool.init()?;
        self.pool = Some(pool);
        Ok(())
    }
}
