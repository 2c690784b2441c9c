// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Register-level fakes for unit tests. Nothing here fetches commands:
//! tests move sync points by hand.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nvhost_common::settings::HostConfig;
use nvhost_common::{ChannelId, HwError, MemError, PhysAddr, SyncptId, SYNCPTS_PER_BANK};
use parking_lot::{Condvar, Mutex};

use crate::hw::{DmaCtrl, Host1xHw};
use crate::mem::{MemClient, MemHandle};
use crate::syncpt::syncpt_reached;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeDma {
    pub start: PhysAddr,
    pub end: PhysAddr,
    pub put: PhysAddr,
    pub get: PhysAddr,
    pub ctrl: DmaCtrl,
}

#[derive(Default)]
struct HwState {
    syncpt: Vec<u32>,
    threshold: Vec<u32>,
    enabled: Vec<bool>,
    base: Vec<u32>,
    mlock: Vec<bool>,
    fail_irq: bool,
    irq_requested: bool,
    dma: Vec<FakeDma>,
    resets: Vec<u32>,
    fifo: Vec<VecDeque<u32>>,
    cmdproc_stop: u32,
}

impl HwState {
    fn pending(&self, id: usize) -> bool {
        self.enabled[id] && syncpt_reached(self.syncpt[id], self.threshold[id])
    }

    fn any_pending(&self) -> bool {
        (0..self.syncpt.len()).any(|id| self.pending(id))
    }
}

pub struct FakeHw {
    state: Mutex<HwState>,
    irq: Condvar,
}

impl FakeHw {
    pub fn new(config: &HostConfig) -> Arc<Self> {
        let n = config.num_syncpts as usize;
        let channels = config.channels.len();
        Arc::new(Self {
            state: Mutex::new(HwState {
                syncpt: vec![0; n],
                threshold: vec![0; n],
                enabled: vec![false; n],
                base: vec![0; config.num_wait_bases as usize],
                mlock: vec![false; config.num_mlocks as usize],
                dma: vec![FakeDma::default(); channels],
                resets: vec![0; channels],
                fifo: vec![VecDeque::new(); channels],
                ..HwState::default()
            }),
            irq: Condvar::new(),
        })
    }

    pub fn set_syncpt(&self, id: SyncptId, value: u32) {
        self.state.lock().syncpt[id as usize] = value;
        self.irq.notify_all();
    }

    pub fn threshold(&self, id: SyncptId) -> u32 {
        self.state.lock().threshold[id as usize]
    }

    pub fn intr_enabled(&self, id: SyncptId) -> bool {
        self.state.lock().enabled[id as usize]
    }

    pub fn fail_irq_request(&self, fail: bool) {
        self.state.lock().fail_irq = fail;
    }

    pub fn dma(&self, ch: ChannelId) -> FakeDma {
        self.state.lock().dma[ch as usize]
    }

    pub fn resets(&self, ch: ChannelId) -> u32 {
        self.state.lock().resets[ch as usize]
    }

    pub fn push_fifo(&self, ch: ChannelId, words: &[u32]) {
        self.state.lock().fifo[ch as usize].extend(words);
    }
}

impl Host1xHw for FakeHw {
    fn syncpt_read(&self, id: SyncptId) -> u32 {
        self.state.lock().syncpt[id as usize]
    }

    fn syncpt_write(&self, id: SyncptId, value: u32) {
        self.set_syncpt(id, value);
    }

    fn syncpt_cpu_incr(&self, id: SyncptId) {
        {
            let mut st = self.state.lock();
            let v = &mut st.syncpt[id as usize];
            *v = v.wrapping_add(1);
        }
        self.irq.notify_all();
    }

    fn wait_base_read(&self, base: u32) -> u32 {
        self.state.lock().base[base as usize]
    }

    fn wait_base_write(&self, base: u32, value: u32) {
        self.state.lock().base[base as usize] = value;
    }

    fn mlock_try(&self, idx: u32) -> bool {
        let mut st = self.state.lock();
        let held = &mut st.mlock[idx as usize];
        !std::mem::replace(held, true)
    }

    fn mlock_release(&self, idx: u32) {
        self.state.lock().mlock[idx as usize] = false;
    }

    fn request_irq(&self) -> Result<(), HwError> {
        let mut st = self.state.lock();
        if st.fail_irq {
            return Err(HwError::IrqUnavailable(0));
        }
        st.irq_requested = true;
        Ok(())
    }

    fn free_irq(&self) {
        self.state.lock().irq_requested = false;
    }

    fn set_syncpt_threshold(&self, id: SyncptId, thresh: u32) {
        self.state.lock().threshold[id as usize] = thresh;
        self.irq.notify_all();
    }

    fn enable_syncpt_intr(&self, id: SyncptId) {
        self.state.lock().enabled[id as usize] = true;
        self.irq.notify_all();
    }

    fn disable_syncpt_intr(&self, id: SyncptId) {
        self.state.lock().enabled[id as usize] = false;
    }

    fn ack_syncpt_intr(&self, _id: SyncptId) {}

    fn syncpt_intr_status(&self, bank: u32) -> u32 {
        let st = self.state.lock();
        let first = bank * SYNCPTS_PER_BANK;
        let last = (first + SYNCPTS_PER_BANK).min(st.syncpt.len() as u32);
        (first..last)
            .filter(|&id| st.pending(id as usize))
            .fold(0, |acc, id| acc | 1 << (id - first))
    }

    fn wait_irq(&self, timeout: Duration) -> bool {
        let mut st = self.state.lock();
        if !st.any_pending() {
            self.irq.wait_for(&mut st, timeout);
        }
        st.any_pending()
    }

    fn dma_setup(&self, ch: ChannelId, start: PhysAddr, end: PhysAddr) {
        let mut st = self.state.lock();
        let dma = &mut st.dma[ch as usize];
        dma.start = start;
        dma.end = end;
    }

    fn dma_ctrl(&self, ch: ChannelId, ctrl: DmaCtrl) {
        let mut st = self.state.lock();
        let dma = &mut st.dma[ch as usize];
        if ctrl.contains(DmaCtrl::GET_RESET | DmaCtrl::INIT_GET) {
            dma.get = dma.put;
        }
        dma.ctrl = ctrl;
    }

    fn dma_set_put(&self, ch: ChannelId, put: PhysAddr) {
        self.state.lock().dma[ch as usize].put = put;
    }

    fn dma_get(&self, ch: ChannelId) -> PhysAddr {
        self.state.lock().dma[ch as usize].get
    }

    fn cmdproc_stop(&self) -> u32 {
        self.state.lock().cmdproc_stop
    }

    fn set_cmdproc_stop(&self, mask: u32) {
        self.state.lock().cmdproc_stop = mask;
    }

    fn reset_module(&self, ch: ChannelId) {
        self.state.lock().resets[ch as usize] += 1;
    }

    fn fifo_entries(&self, ch: ChannelId) -> usize {
        self.state.lock().fifo[ch as usize].len()
    }

    fn fifo_read(&self, ch: ChannelId) -> u32 {
        self.state.lock().fifo[ch as usize].pop_front().unwrap_or(0)
    }
}

// ── Memory ──────────────────────────────────────────────────────────────

struct Allocation {
    handle: Weak<MemHandle>,
    phys: PhysAddr,
    pins: u32,
}

#[derive(Default)]
struct MemState {
    next_id: u32,
    next_phys: PhysAddr,
    allocs: HashMap<u32, Allocation>,
    fail: HashSet<u32>,
}

pub struct FakeMem {
    state: Mutex<MemState>,
}

impl FakeMem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemState {
                next_id: 1,
                next_phys: 0x1000_0000,
                ..MemState::default()
            }),
        })
    }

    /// Make every later pin of handle `id` fail.
    pub fn fail_pin(&self, id: u32) {
        self.state.lock().fail.insert(id);
    }

    pub fn pin_count(&self, handle: &MemHandle) -> u32 {
        self.state
            .lock()
            .allocs
            .get(&handle.id())
            .map_or(0, |a| a.pins)
    }

    /// Handles with at least one pin.
    pub fn pinned_handles(&self) -> usize {
        self.state.lock().allocs.values().filter(|a| a.pins > 0).count()
    }

    /// Word at bus address `phys`, if it belongs to a live allocation.
    pub fn read_phys(&self, phys: PhysAddr) -> Option<u32> {
        let st = self.state.lock();
        st.allocs.values().find_map(|a| {
            let handle = a.handle.upgrade()?;
            let bytes = handle.len() as u32 * 4;
            (phys >= a.phys && phys < a.phys + bytes)
                .then(|| handle.read(((phys - a.phys) / 4) as usize))
        })
    }
}

impl MemClient for FakeMem {
    fn name(&self) -> &str {
        "fake"
    }

    fn alloc(&self, words: usize) -> Result<Arc<MemHandle>, MemError> {
        let mut st = self.state.lock();
        let id = st.next_id;
        st.next_id += 1;
        let phys = st.next_phys;
        st.next_phys += ((words as u32 * 4) + 15) & !15;
        let handle = Arc::new(MemHandle::new(id, words));
        st.allocs.insert(
            id,
            Allocation {
                handle: Arc::downgrade(&handle),
                phys,
                pins: 0,
            },
        );
        Ok(handle)
    }

    fn pin(&self, handle: &Arc<MemHandle>) -> Result<PhysAddr, MemError> {
        let mut st = self.state.lock();
        if st.fail.contains(&handle.id()) {
            return Err(MemError::PinFailed(handle.id()));
        }
        let alloc = st
            .allocs
            .get_mut(&handle.id())
            .ok_or(MemError::PinFailed(handle.id()))?;
        alloc.pins += 1;
        Ok(alloc.phys)
    }

    fn unpin(&self, handles: &[Arc<MemHandle>]) {
        let mut st = self.state.lock();
        for handle in handles {
            let alloc = st
                .allocs
                .get_mut(&handle.id())
                .filter(|a| a.pins > 0);
            match alloc {
                Some(alloc) => alloc.pins -= 1,
                None => panic!("fake: unpin of unpinned handle {}", handle.id()),
            }
        }
    }
}
