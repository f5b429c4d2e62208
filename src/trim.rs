//! The background trimmer.
//!
//! A detached thread that first demotes idle bats by clearing their hot
//! bit, sleeps between 100 ms and 10 s (shorter under memory pressure),
//! then evicts the cold eligible ones. Aggressive mode additionally
//! takes bats whose image is entirely a read-only map. The thread holds
//! only a weak handle so a dropped pool takes its trimmer with it.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::common::BatStatus;
use crate::common::types::{TRIM_SLEEP_MAX, TRIM_SLEEP_MIN};
use crate::pool::{Bbp, RawPool};

#[derive(Default)]
pub(crate) struct TrimControl {
    pub(crate) shutdown: AtomicBool,
    pub(crate) aggressive: AtomicBool,
    gate: Mutex<()>,
    cv: Condvar,
}

impl TrimControl {
    pub(crate) fn kick(&self) {
        self.cv.notify_all();
    }

    // Sleeps up to `dur`, returning early when kicked. True on shutdown.
    fn sleep(&self, dur: Duration) -> bool {
        let mut gate = self.gate.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return true;
        }
        let _ = self.cv.wait_for(&mut gate, dur);
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Bbp {
    /// Switches the trimmer's aggressive mode, in which entirely mapped
    /// bats are evicted as well, and wakes it up.
    pub fn set_aggressive(&self, on: bool) {
        self.0.trim.aggressive.store(on, Ordering::Release);
        self.0.trim.kick();
    }
}

pub(crate) fn trimmer_loop(pool: Weak<RawPool>) {
    let mut sleep = TRIM_SLEEP_MIN;
    loop {
        let Some(p) = pool.upgrade() else { return };
        if p.trim.shutdown.load(Ordering::Acquire) {
            return;
        }

        // first pass: take the heat off bats nobody is working on
        for id in 1..p.arena.size() {
            let Some(slot) = p.arena.get(id) else { continue };
            if slot.refs() == 0
                && slot.lrefs() > 0
                && slot.status().contains(BatStatus::HOT)
            {
                slot.status_off(BatStatus::HOT);
            }
        }

        sleep = if p.vm_pressure() {
            TRIM_SLEEP_MIN
        } else {
            (sleep * 2).min(TRIM_SLEEP_MAX)
        };
        if p.trim.sleep(sleep) {
            return;
        }

        // second pass: evict what stayed cold
        let aggressive = p.trim.aggressive.load(Ordering::Acquire);
        let mut evicted = 0usize;
        for id in 1..p.arena.size() {
            let Some(slot) = p.arena.get(id) else { continue };
            let mut do_unload = false;
            {
                let _g = p.swap_guard(id);
                let st = slot.status();
                if st.contains(BatStatus::LOADED)
                    && !st.intersects(
                        BatStatus::UNLOADING
                            | BatStatus::LOADING
                            | BatStatus::SAVING
                            | BatStatus::SYNCING
                            | BatStatus::DELETING
                            | BatStatus::HOT,
                    )
                    && slot.refs() == 0
                    && slot.lrefs() > 0
                    && slot.shares() == 0
                {
                    if let Some(desc) = unsafe { slot.desc() } {
                        if desc.view_parent().is_none() {
                            let clean = !desc.dirty();
                            let mapped = desc.state().tail.mapped();
                            if clean || (aggressive && mapped) {
                                slot.status_on(BatStatus::UNLOADING);
                                p.unload_begin();
                                do_unload = true;
                            }
                        }
                    }
                }
            }
            if do_unload && p.unload(id).is_ok() {
                evicted += 1;
                p.stats
                    .evictions
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        if evicted > 0 {
            debug!(
                "trimmer evicted {evicted} bats, {} heap bytes resident",
                p.vm_in_use.load(std::sync::atomic::Ordering::Relaxed)
            );
        }
        drop(p);
    }
}
