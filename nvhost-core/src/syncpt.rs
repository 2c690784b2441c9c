// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sync point table.
//!
//! Each sync point has two cached views. `min` is the last value confirmed
//! by reading the hardware counter; `max` is the total number of increments
//! promised to hardware so far. For host-managed points `min` chases `max`
//! and may never pass it. Client-managed points are driven by someone else
//! (e.g. display vblank) and only `min` is meaningful.
//!
//! All comparisons between a counter and a threshold are wraparound-safe.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nvhost_common::settings::HostConfig;
use nvhost_common::{Error, NvResult, SyncptId};
use parking_lot::Mutex;

use crate::hw::Host1xHw;

/// `true` once `value` has counted up to or past `thresh`.
#[inline]
pub fn syncpt_reached(value: u32, thresh: u32) -> bool {
    (value.wrapping_sub(thresh) as i32) >= 0
}

pub struct SyncptTable {
    hw: Arc<dyn Host1xHw>,
    min: Box<[AtomicU32]>,
    max: Box<[AtomicU32]>,
    client_managed: Box<[bool]>,
    /// Wait base shadows.
    base: Box<[AtomicU32]>,
    /// Times each hardware mutex has been taken, for dumps.
    mlock_count: Box<[AtomicU32]>,
    cpu_incr_lock: Mutex<()>,
}

fn counters(n: u32) -> Box<[AtomicU32]> {
    (0..n).map(|_| AtomicU32::new(0)).collect()
}

impl SyncptTable {
    pub fn new(config: &HostConfig, hw: Arc<dyn Host1xHw>) -> Self {
        let client_managed = (0..config.num_syncpts)
            .map(|id| config.is_client_managed(id))
            .collect();
        Self {
            hw,
            min: counters(config.num_syncpts),
            max: counters(config.num_syncpts),
            client_managed,
            base: counters(config.num_wait_bases),
            mlock_count: counters(config.num_mlocks),
            cpu_incr_lock: Mutex::new(()),
        }
    }

    pub fn num_syncpts(&self) -> u32 {
        self.min.len() as u32
    }

    pub fn num_wait_bases(&self) -> u32 {
        self.base.len() as u32
    }

    pub fn is_valid(&self, id: SyncptId) -> bool {
        (id as usize) < self.min.len()
    }

    /// Reject an id coming from outside the engine.
    pub fn check(&self, id: SyncptId) -> NvResult<()> {
        if self.is_valid(id) {
            Ok(())
        } else {
            Err(Error::InvalidSyncpt(id))
        }
    }

    pub fn is_client_managed(&self, id: SyncptId) -> bool {
        self.client_managed[id as usize]
    }

    // ── Cached views ────────────────────────────────────────────────────

    pub fn read_min(&self, id: SyncptId) -> u32 {
        self.min[id as usize].load(Ordering::Acquire)
    }

    pub fn read_max(&self, id: SyncptId) -> u32 {
        self.max[id as usize].load(Ordering::Acquire)
    }

    /// Reserve `n` increments. Must be called before the work that performs
    /// them is handed to hardware.
    pub fn incr_max(&self, id: SyncptId, n: u32) -> u32 {
        self.max[id as usize]
            .fetch_add(n, Ordering::AcqRel)
            .wrapping_add(n)
    }

    /// Client-managed points only: set the expected target directly.
    pub fn set_max(&self, id: SyncptId, value: u32) {
        assert!(
            self.is_client_managed(id),
            "syncpt: set_max on host managed sync point {id}"
        );
        self.max[id as usize].store(value, Ordering::Release);
    }

    fn check_max(&self, id: SyncptId, live: u32) -> bool {
        if self.is_client_managed(id) {
            return true;
        }
        (self.read_max(id).wrapping_sub(live) as i32) >= 0
    }

    /// Merge the live hardware value into the cached `min` and return it.
    ///
    /// A host-managed counter running past `max` means increments were
    /// issued without being reserved. That is fatal.
    pub fn update_min(&self, id: SyncptId) -> u32 {
        let min = &self.min[id as usize];
        let live = loop {
            let old = min.load(Ordering::Acquire);
            let live = self.hw.syncpt_read(id);
            if min
                .compare_exchange(old, live, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break live;
            }
        };
        if !self.check_max(id, live) {
            self.dump(log::Level::Error);
            panic!(
                "syncpt: id {} hardware value {} beyond max {}",
                id,
                live,
                self.read_max(id)
            );
        }
        live
    }

    /// Whether `thresh` has been reached according to the cached `min`.
    pub fn is_expired(&self, id: SyncptId, thresh: u32) -> bool {
        let current = self.read_min(id);
        if self.is_client_managed(id) {
            return syncpt_reached(current, thresh);
        }
        // Between min and max the threshold is still pending; everything
        // else (including values that wrapped long ago) has expired.
        let future = self.read_max(id);
        future.wrapping_sub(thresh) >= current.wrapping_sub(thresh)
    }

    pub fn update_min_is_expired(&self, id: SyncptId, thresh: u32) -> bool {
        self.update_min(id);
        self.is_expired(id, thresh)
    }

    /// Order two thresholds by which one is reached first.
    pub fn compare(&self, id: SyncptId, a: u32, b: u32) -> CmpOrdering {
        let current = self.read_min(id);
        match (self.is_expired(id, a), self.is_expired(id, b)) {
            (true, false) => CmpOrdering::Less,
            (false, true) => CmpOrdering::Greater,
            _ => {
                let da = a.wrapping_sub(current) as i32;
                let db = b.wrapping_sub(current) as i32;
                da.cmp(&db)
            }
        }
    }

    // ── CPU increments ──────────────────────────────────────────────────

    /// Raw hardware increment. The caller has already reserved it.
    pub fn cpu_incr(&self, id: SyncptId) {
        self.hw.syncpt_cpu_incr(id);
    }

    /// CPU increment that also reserves it for client-managed points.
    pub fn incr(&self, id: SyncptId) {
        let _guard = self.cpu_incr_lock.lock();
        if self.is_client_managed(id) {
            self.incr_max(id, 1);
        }
        self.cpu_incr(id);
    }

    /// Declare everything reserved as done and write it to hardware.
    pub fn set_min_eq_max(&self, id: SyncptId) {
        let max = self.read_max(id);
        self.min[id as usize].store(max, Ordering::Release);
        self.hw.syncpt_write(id, max);
    }

    pub fn min_eq_max(&self, id: SyncptId) -> bool {
        self.read_min(id) == self.read_max(id)
    }

    // ── Power management ────────────────────────────────────────────────

    /// Refresh shadows from hardware before it loses state.
    pub fn save(&self) {
        for id in 0..self.num_syncpts() {
            if self.is_client_managed(id) {
                let live = self.hw.syncpt_read(id);
                self.min[id as usize].store(live, Ordering::Release);
            } else if !self.min_eq_max(id) {
                log::warn!(
                    "syncpt: id {} saved with work outstanding (min {} max {})",
                    id,
                    self.read_min(id),
                    self.read_max(id)
                );
                self.dump(log::Level::Warn);
            }
        }
        for base in 0..self.num_wait_bases() {
            self.update_wait_base(base);
        }
    }

    /// Write every shadow back after hardware lost state.
    pub fn reset(&self) {
        for id in 0..self.num_syncpts() {
            self.hw.syncpt_write(id, self.read_min(id));
        }
        for base in 0..self.num_wait_bases() {
            self.hw.wait_base_write(base, self.read_wait_base(base));
        }
    }

    // ── Wait bases ──────────────────────────────────────────────────────

    pub fn read_wait_base(&self, base: u32) -> u32 {
        self.base[base as usize].load(Ordering::Acquire)
    }

    pub fn update_wait_base(&self, base: u32) -> u32 {
        let value = self.hw.wait_base_read(base);
        self.base[base as usize].store(value, Ordering::Release);
        value
    }

    pub fn incr_wait_base(&self, base: u32, n: u32) -> u32 {
        let value = self.base[base as usize]
            .fetch_add(n, Ordering::AcqRel)
            .wrapping_add(n);
        self.hw.wait_base_write(base, value);
        value
    }

    // ── Hardware mutexes ────────────────────────────────────────────────

    pub fn num_mlocks(&self) -> u32 {
        self.mlock_count.len() as u32
    }

    pub fn mutex_try_lock(&self, idx: u32) -> NvResult<()> {
        assert!(idx < self.num_mlocks(), "syncpt: mlock {idx} out of range");
        if !self.hw.mlock_try(idx) {
            return Err(Error::MutexBusy(idx));
        }
        self.mlock_count[idx as usize].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn mutex_unlock(&self, idx: u32) {
        assert!(idx < self.num_mlocks(), "syncpt: mlock {idx} out of range");
        self.hw.mlock_release(idx);
        self.mlock_count[idx as usize].fetch_sub(1, Ordering::AcqRel);
    }

    pub fn mutex_lock_count(&self, idx: u32) -> u32 {
        self.mlock_count[idx as usize].load(Ordering::Acquire)
    }

    /// One line per sync point that has seen any activity.
    pub fn dump(&self, level: log::Level) {
        for id in 0..self.num_syncpts() {
            let min = self.read_min(id);
            let max = self.read_max(id);
            if min == 0 && max == 0 && !self.is_client_managed(id) {
                continue;
            }
            log::log!(
                level,
                "syncpt: id {:3} min {:10} max {:10} live {:10}{}",
                id,
                min,
                max,
                self.hw.syncpt_read(id),
                if self.is_client_managed(id) { " (client)" } else { "" }
            );
        }
        for base in 0..self.num_wait_bases() {
            let value = self.read_wait_base(base);
            if value != 0 {
                log::log!(level, "syncpt: wait base {} = {}", base, value);
            }
        }
        for idx in 0..self.num_mlocks() {
            let count = self.mutex_lock_count(idx);
            if count != 0 {
                log::log!(level, "syncpt: mlock {} held {} times", idx, count);
            }
        }
    }
}
