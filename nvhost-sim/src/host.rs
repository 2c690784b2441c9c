// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software host1x.
//!
//! Holds the register file the engine programs through [`Host1xHw`] and
//! runs each channel's fetcher against [`SimMemory`]. Nothing here calls
//! back into the engine: sync point moves only show up as a pending
//! threshold interrupt, picked up by whoever is blocked in `wait_irq`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nvhost_common::settings::HostConfig;
use nvhost_common::{
    ChannelId, Error, HwError, NvResult, PhysAddr, SyncptId, SYNCPTS_PER_BANK,
};
use nvhost_core::hw::{DmaCtrl, Host1xHw};
use nvhost_core::opcodes::{CLASS_HOST1X, METHOD_INCR_SYNCPT, METHOD_WAIT_SYNCPT};
use nvhost_core::syncpt::syncpt_reached;
use parking_lot::{Condvar, Mutex};

use crate::cmdbuf::METHOD_ECHO;
use crate::fetch::{FetchBus, Fetcher, Step};
use crate::memory::SimMemory;

/// Words a channel may execute per [`SimHost::step`] before the next
/// channel gets a turn.
const STEP_BUDGET: usize = 64;

#[derive(Default)]
struct SimChannel {
    start: PhysAddr,
    end: PhysAddr,
    put: PhysAddr,
    get: PhysAddr,
    ctrl: DmaCtrl,
    fetcher: Fetcher,
    fifo: VecDeque<u32>,
    resets: u32,
    fault: Option<PhysAddr>,
}

#[derive(Default)]
struct SimState {
    syncpt: Vec<u32>,
    threshold: Vec<u32>,
    enabled: Vec<bool>,
    base: Vec<u32>,
    mlock: Vec<bool>,
    irq_requested: bool,
    fail_irq: bool,
    channels: Vec<SimChannel>,
    cmdproc_stop: u32,
}

impl SimState {
    fn pending(&self, id: usize) -> bool {
        self.enabled[id] && syncpt_reached(self.syncpt[id], self.threshold[id])
    }

    fn any_pending(&self) -> bool {
        (0..self.syncpt.len()).any(|id| self.pending(id))
    }

    fn runnable(&self, ch: usize) -> bool {
        let c = &self.channels[ch];
        !c.ctrl.contains(DmaCtrl::STOP)
            && self.cmdproc_stop & (1 << ch) == 0
            && c.fault.is_none()
            && (c.get != c.put || c.fetcher.in_gather())
    }
}

/// Method sink for one channel's fetcher.
struct ChannelBus<'a> {
    mem: &'a SimMemory,
    syncpt: &'a mut [u32],
    fifo: &'a mut VecDeque<u32>,
    incremented: bool,
}

impl FetchBus for ChannelBus<'_> {
    fn read_word(&self, addr: PhysAddr) -> Option<u32> {
        self.mem.read_word(addr)
    }

    fn write_method(&mut self, class: u32, offset: u32, value: u32) -> bool {
        match (class, offset) {
            (_, METHOD_INCR_SYNCPT) => {
                let id = (value & 0xFF) as usize;
                match self.syncpt.get_mut(id) {
                    Some(v) => {
                        *v = v.wrapping_add(1);
                        self.incremented = true;
                    }
                    None => log::warn!("sim: increment of invalid sync point {}", id),
                }
                true
            }
            (CLASS_HOST1X, METHOD_WAIT_SYNCPT) => {
                let id = (value >> 24) as usize;
                let thresh = value & 0x00FF_FFFF;
                match self.syncpt.get(id) {
                    Some(&v) => (v.wrapping_sub(thresh) << 8) as i32 >= 0,
                    None => {
                        log::warn!("sim: wait on invalid sync point {}", id);
                        true
                    }
                }
            }
            (CLASS_HOST1X, METHOD_ECHO) => {
                self.fifo.push_back(value);
                true
            }
            _ => {
                log::trace!(
                    "sim: class 0x{:X} method 0x{:X} <- 0x{:08X}",
                    class,
                    offset,
                    value
                );
                true
            }
        }
    }
}

pub struct SimHost {
    mem: Arc<SimMemory>,
    state: Mutex<SimState>,
    /// Notified when a threshold interrupt may have become pending.
    irq: Condvar,
    /// Notified when a channel may have become runnable.
    dma: Condvar,
}

impl SimHost {
    pub fn new(config: &HostConfig, mem: Arc<SimMemory>) -> Arc<Self> {
        let n = config.num_syncpts as usize;
        let mut channels = Vec::with_capacity(config.channels.len());
        channels.resize_with(config.channels.len(), SimChannel::default);
        Arc::new(Self {
            mem,
            state: Mutex::new(SimState {
                syncpt: vec![0; n],
                threshold: vec![0; n],
                enabled: vec![false; n],
                base: vec![0; config.num_wait_bases as usize],
                mlock: vec![false; config.num_mlocks as usize],
                channels,
                ..SimState::default()
            }),
            irq: Condvar::new(),
            dma: Condvar::new(),
        })
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.mem
    }

    /// Live sync point value, bypassing the register interface.
    pub fn syncpt_value(&self, id: SyncptId) -> u32 {
        self.state.lock().syncpt[id as usize]
    }

    pub fn irq_requested(&self) -> bool {
        self.state.lock().irq_requested
    }

    pub fn fail_irq_request(&self, fail: bool) {
        self.state.lock().fail_irq = fail;
    }

    pub fn resets(&self, ch: ChannelId) -> u32 {
        self.state.lock().channels[ch as usize].resets
    }

    /// Address of the last fetch fault on `ch`, if any. A faulted channel
    /// stays halted until its GET is reset.
    pub fn fault(&self, ch: ChannelId) -> Option<PhysAddr> {
        self.state.lock().channels[ch as usize].fault
    }

    pub fn words_executed(&self, ch: ChannelId) -> u64 {
        self.state.lock().channels[ch as usize]
            .fetcher
            .words_executed()
    }

    /// Give every runnable channel a turn. Returns `true` if any word was
    /// executed.
    pub fn step(&self) -> bool {
        let mut st = self.state.lock();
        let (progress, incremented) = Self::step_locked(&self.mem, &mut st);
        drop(st);
        if incremented {
            self.irq.notify_all();
        }
        progress
    }

    /// Step until no channel can make progress.
    pub fn run_until_idle(&self) {
        while self.step() {}
    }

    fn step_locked(mem: &SimMemory, st: &mut SimState) -> (bool, bool) {
        let mut progress = false;
        let mut incremented = false;
        for ch in 0..st.channels.len() {
            if !st.runnable(ch) {
                continue;
            }
            let SimState {
                syncpt, channels, ..
            } = &mut *st;
            let c = &mut channels[ch];
            let mut bus = ChannelBus {
                mem,
                syncpt: syncpt.as_mut_slice(),
                fifo: &mut c.fifo,
                incremented: false,
            };
            for _ in 0..STEP_BUDGET {
                match c.fetcher.step(&mut c.get, c.put, &mut bus) {
                    Step::Executed => progress = true,
                    Step::Idle | Step::Stalled => break,
                    Step::Fault(addr) => {
                        log::error!("sim: channel {} fetch fault at 0x{:08X}", ch, addr);
                        c.fault = Some(addr);
                        break;
                    }
                }
            }
            incremented |= bus.incremented;
        }
        (progress, incremented)
    }

    /// One pass of the DMA worker. Sleeps on the DMA condvar when no
    /// channel made progress.
    fn dma_pass(&self, period: Duration) {
        let mut st = self.state.lock();
        let (progress, incremented) = Self::step_locked(&self.mem, &mut st);
        if incremented {
            self.irq.notify_all();
        }
        if !progress {
            self.dma.wait_for(&mut st, period);
        }
    }

    fn notify_all(&self) {
        self.irq.notify_all();
        self.dma.notify_all();
    }
}

impl Host1xHw for SimHost {
    fn syncpt_read(&self, id: SyncptId) -> u32 {
        self.state.lock().syncpt[id as usize]
    }

    fn syncpt_write(&self, id: SyncptId, value: u32) {
        self.state.lock().syncpt[id as usize] = value;
        self.notify_all();
    }

    fn syncpt_cpu_incr(&self, id: SyncptId) {
        {
            let mut st = self.state.lock();
            let v = &mut st.syncpt[id as usize];
            *v = v.wrapping_add(1);
        }
        // A stalled wait may now pass.
        self.notify_all();
    }

    fn wait_base_read(&self, base: u32) -> u32 {
        self.state.lock().base[base as usize]
    }

    fn wait_base_write(&self, base: u32, value: u32) {
        self.state.lock().base[base as usize] = value;
    }

    fn mlock_try(&self, idx: u32) -> bool {
        let mut st = self.state.lock();
        !std::mem::replace(&mut st.mlock[idx as usize], true)
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
        let c = &mut st.channels[ch as usize];
        c.start = start;
        c.end = end;
    }

    fn dma_ctrl(&self, ch: ChannelId, ctrl: DmaCtrl) {
        {
            let mut st = self.state.lock();
            let c = &mut st.channels[ch as usize];
            if ctrl.contains(DmaCtrl::GET_RESET | DmaCtrl::INIT_GET) {
                c.get = c.put;
                c.fetcher.reset();
                c.fault = None;
            }
            c.ctrl = ctrl;
        }
        self.dma.notify_all();
    }

    fn dma_set_put(&self, ch: ChannelId, put: PhysAddr) {
        {
            let mut st = self.state.lock();
            let c = &mut st.channels[ch as usize];
            if put < c.start || put > c.end {
                log::warn!(
                    "sim: channel {} PUT 0x{:08X} outside 0x{:08X}..0x{:08X}",
                    ch,
                    put,
                    c.start,
                    c.end
                );
            }
            c.put = put;
        }
        self.dma.notify_all();
    }

    fn dma_get(&self, ch: ChannelId) -> PhysAddr {
        self.state.lock().channels[ch as usize].get
    }

    fn cmdproc_stop(&self) -> u32 {
        self.state.lock().cmdproc_stop
    }

    fn set_cmdproc_stop(&self, mask: u32) {
        self.state.lock().cmdproc_stop = mask;
        self.dma.notify_all();
    }

    fn reset_module(&self, ch: ChannelId) {
        let mut st = self.state.lock();
        let c = &mut st.channels[ch as usize];
        c.fetcher.reset();
        c.resets += 1;
        log::debug!("sim: channel {} module reset", ch);
    }

    fn fifo_entries(&self, ch: ChannelId) -> usize {
        self.state.lock().channels[ch as usize].fifo.len()
    }

    fn fifo_read(&self, ch: ChannelId) -> u32 {
        self.state.lock().channels[ch as usize]
            .fifo
            .pop_front()
            .unwrap_or(0)
    }
}

/// Worker that keeps every channel's fetcher running.
pub struct DmaThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DmaThread {
    /// `period` bounds how long a stalled channel waits before its blocked
    /// method is retried.
    pub fn spawn(sim: Arc<SimHost>, period: Duration) -> NvResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("nvhost-dma".into())
            .spawn(move || {
                log::debug!("sim: dma thread started");
                while !thread_stop.load(Ordering::Acquire) {
                    sim.dma_pass(period);
                }
                log::debug!("sim: dma thread stopped");
            })
            .map_err(|source| Error::Spawn {
                name: "nvhost-dma".into(),
                source,
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DmaThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
