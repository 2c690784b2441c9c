// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command DMA engine of one channel.
//!
//! Submitters take the engine lock with [`Cdma::begin`], push opcode pairs
//! into the push buffer and finish with [`CdmaSubmit::end`], which records
//! the batch in the sync queue and kicks DMA. [`Cdma::update`] reclaims
//! completed batches in FIFO order. A watchdog armed on the oldest pending
//! batch tears the channel down when it expires and resynchronizes the
//! queue so that only the context that timed out loses work.

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use nvhost_common::settings::{ChannelDesc, HostConfig};
use nvhost_common::{ChannelId, Error, NvResult, PhysAddr, SyncptId};
use parking_lot::{Mutex, MutexGuard};

use crate::hw::{DmaCtrl, Host1xHw};
use crate::mem::{MemClient, MemHandle};
use crate::opcodes;
use crate::push_buffer::{PushBuffer, SlotOwner};
use crate::semaphore::Semaphore;
use crate::sync_queue::{CtxSaveSlots, SyncQueue, SyncQueueEntry};
use crate::syncpt::{syncpt_reached, SyncptTable};
use crate::timeout::{DeadlineTimer, TimeoutContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmaRunState {
    /// DMA not fetching.
    Stopped,
    Running,
    /// Halted by timeout recovery, not yet restarted.
    TornDown,
}

/// Conditions a submitter can sleep on. Only one may be outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmaEvent {
    SyncQueueEmpty,
    SyncQueueSpace,
    PushBufferSpace,
}

/// Watchdog bookkeeping for the oldest timeable batch.
#[derive(Default)]
struct TimeoutState {
    ctx: Option<Arc<TimeoutContext>>,
    syncpt_id: SyncptId,
    syncpt_val: u32,
    generation: u64,
    start: Option<Instant>,
}

/// GATHER source of sync point increments used to replay the work of a
/// timed-out context in push buffer order.
struct ReplayBuffer {
    mem: Arc<MemHandle>,
    phys: PhysAddr,
    incrs: u32,
}

impl ReplayBuffer {
    fn new(client: &dyn MemClient, syncpt_id: SyncptId, incrs: u32) -> NvResult<Self> {
        let mem = client.alloc(incrs as usize)?;
        let word = opcodes::incr_syncpt(opcodes::COND_IMMEDIATE, syncpt_id);
        for i in 0..incrs as usize {
            mem.write(i, word);
        }
        let phys = client.pin(&mem)?;
        Ok(Self { mem, phys, incrs })
    }
}

struct CdmaState {
    run: CdmaRunState,
    event: Option<CdmaEvent>,
    pb: PushBuffer,
    queue: SyncQueue,
    /// PUT at `begin` of the submission in progress.
    first_get: PhysAddr,
    /// PUT last written to hardware.
    last_put: PhysAddr,
    slots_used: u32,
    slots_free: u32,
    /// Slots of abandoned submissions, reclaimed with the next batch.
    orphan_slots: u32,
    orphan_get: Option<PhysAddr>,
    timeout: TimeoutState,
    replay: Option<ReplayBuffer>,
}

impl CdmaState {
    fn status(&self, event: CdmaEvent) -> u32 {
        match event {
            CdmaEvent::SyncQueueEmpty => self.queue.is_empty() as u32,
            CdmaEvent::SyncQueueSpace => self.queue.space(),
            CdmaEvent::PushBufferSpace => self.pb.space(),
        }
    }
}

pub struct Cdma {
    id: ChannelId,
    name: String,
    syncpt_id: SyncptId,
    wait_base: Option<u32>,
    replay_incrs: u32,
    hw: Arc<dyn Host1xHw>,
    syncpt: Arc<SyncptTable>,
    mem: Arc<dyn MemClient>,
    state: Mutex<CdmaState>,
    sem: Semaphore,
    timer: DeadlineTimer,
}

impl Cdma {
    /// Allocate the push buffer and sync queue of channel `id`.
    pub fn new(
        id: ChannelId,
        desc: &ChannelDesc,
        config: &HostConfig,
        hw: Arc<dyn Host1xHw>,
        syncpt: Arc<SyncptTable>,
        mem: Arc<dyn MemClient>,
    ) -> NvResult<Arc<Self>> {
        let pb = PushBuffer::new(&*mem, config.push_buffer_size)?;
        let last_put = pb.put_pointer();

        let this: Arc<OnceLock<Weak<Cdma>>> = Arc::new(OnceLock::new());
        let timer_this = this.clone();
        let timer = DeadlineTimer::new(&format!("cdma-{}", desc.name), move |generation| {
            if let Some(cdma) = timer_this.get().and_then(Weak::upgrade) {
                cdma.handle_timeout(generation);
            }
        });
        let timer = match timer {
            Ok(timer) => timer,
            Err(err) => {
                let mut pb = pb;
                pb.destroy(&*mem);
                return Err(err);
            }
        };

        let cdma = Arc::new(Self {
            id,
            name: desc.name.clone(),
            syncpt_id: desc.syncpt,
            wait_base: desc.wait_base,
            replay_incrs: config.replay_incrs_per_slot,
            hw,
            syncpt,
            mem,
            state: Mutex::new(CdmaState {
                run: CdmaRunState::Stopped,
                event: None,
                pb,
                queue: SyncQueue::new(config.sync_queue_words),
                first_get: last_put,
                last_put,
                slots_used: 0,
                slots_free: 0,
                orphan_slots: 0,
                orphan_get: None,
                timeout: TimeoutState::default(),
                replay: None,
            }),
            sem: Semaphore::new(0),
            timer,
        });
        let _ = this.set(Arc::downgrade(&cdma));
        log::debug!("cdma[{}]: created on syncpt {}", cdma.name, cdma.syncpt_id);
        Ok(cdma)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn syncpt_id(&self) -> SyncptId {
        self.syncpt_id
    }

    pub fn state(&self) -> CdmaRunState {
        self.state.lock().run
    }

    pub fn push_buffer_space(&self) -> u32 {
        self.state.lock().pb.space()
    }

    pub fn sync_queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn sync_queue_space(&self) -> u32 {
        self.state.lock().queue.space()
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Current PUT of the push buffer (not necessarily kicked yet).
    pub fn put_pointer(&self) -> PhysAddr {
        self.state.lock().pb.put_pointer()
    }

    /// Opcode pair at bus address `addr` of the push buffer.
    pub fn read_slot(&self, addr: PhysAddr) -> (u32, u32) {
        let st = self.state.lock();
        st.pb.read_slot(st.pb.offset_of(addr))
    }

    /// Sync point threshold the watchdog is armed for.
    pub fn timer_target(&self) -> Option<(SyncptId, u32)> {
        let st = self.state.lock();
        st.timeout
            .ctx
            .as_ref()
            .map(|_| (st.timeout.syncpt_id, st.timeout.syncpt_val))
    }

    // ── Hardware control ────────────────────────────────────────────────

    fn start_locked(&self, st: &mut CdmaState) {
        if st.run != CdmaRunState::Stopped {
            return;
        }
        st.last_put = st.pb.put_pointer();
        self.hw.dma_ctrl(self.id, DmaCtrl::STOP);
        self.hw.dma_setup(self.id, st.pb.phys(), st.pb.end());
        self.hw.dma_set_put(self.id, st.last_put);
        self.hw
            .dma_ctrl(self.id, DmaCtrl::STOP | DmaCtrl::GET_RESET | DmaCtrl::INIT_GET);
        self.hw.dma_ctrl(self.id, DmaCtrl::empty());
        st.run = CdmaRunState::Running;
        log::debug!("cdma[{}]: started at 0x{:08X}", self.name, st.last_put);
    }

    fn kick_locked(&self, st: &mut CdmaState) {
        let put = st.pb.put_pointer();
        if put != st.last_put {
            self.hw.dma_set_put(self.id, put);
            st.last_put = put;
        }
    }

    /// Write the current PUT to hardware.
    pub fn kick(&self) {
        let mut st = self.state.lock();
        self.kick_locked(&mut st);
    }

    /// Wait for the sync queue to drain, then halt DMA.
    pub fn stop(&self) {
        let mut st = self.state.lock();
        if st.run == CdmaRunState::Running {
            self.wait_locked(&mut st, CdmaEvent::SyncQueueEmpty);
            self.hw.dma_ctrl(self.id, DmaCtrl::STOP);
            st.run = CdmaRunState::Stopped;
            self.stop_timer_locked(&mut st);
            log::debug!("cdma[{}]: stopped", self.name);
        }
    }

    /// Release the push buffer and replay buffer. The engine must be
    /// stopped.
    pub fn destroy(&self) {
        let mut st = self.state.lock();
        assert_eq!(
            st.run,
            CdmaRunState::Stopped,
            "cdma[{}]: destroy while running",
            self.name
        );
        st.queue.reset();
        st.pb.destroy(&*self.mem);
        if let Some(replay) = st.replay.take() {
            self.mem.unpin(std::slice::from_ref(&replay.mem));
        }
        self.timer.cancel();
    }

    /// Sleep until `event` holds; returns its status value. Releases the
    /// engine lock while asleep.
    fn wait_locked(&self, st: &mut MutexGuard<'_, CdmaState>, event: CdmaEvent) -> u32 {
        loop {
            let space = st.status(event);
            if space > 0 {
                return space;
            }
            log::trace!("cdma[{}]: waiting for {:?}", self.name, event);
            if let Some(other) = st.event {
                self.dump_locked(st, log::Level::Error);
                panic!(
                    "cdma[{}]: wait for {:?} while waiting for {:?}",
                    self.name, event, other
                );
            }
            st.event = Some(event);
            MutexGuard::unlocked(st, || self.sem.down());
        }
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Start a submission for `ctx`. Fails with [`Error::TimedOut`] if the
    /// context has already been abandoned.
    pub fn begin(&self, ctx: &Arc<TimeoutContext>) -> NvResult<CdmaSubmit<'_>> {
        let mut st = self.state.lock();
        if ctx.has_timed_out() {
            let min = self.syncpt.update_min(self.syncpt_id);
            log::debug!(
                "cdma[{}]: skip timed out context submit (min {} max {})",
                self.name,
                min,
                self.syncpt.read_max(self.syncpt_id)
            );
            return Err(Error::TimedOut);
        }
        if ctx.timeout_ms() > 0 && st.replay.is_none() {
            st.replay = Some(ReplayBuffer::new(
                &*self.mem,
                self.syncpt_id,
                self.replay_incrs,
            )?);
        }
        self.start_locked(&mut st);
        st.slots_free = 0;
        st.slots_used = 0;
        st.first_get = st.orphan_get.unwrap_or_else(|| st.pb.put_pointer());
        Ok(CdmaSubmit {
            cdma: self,
            st,
            ctxsave: None,
            ended: false,
        })
    }

    // ── Reclaim ─────────────────────────────────────────────────────────

    /// Release every batch whose sync point target has been reached.
    pub fn update(&self) {
        let mut st = self.state.lock();
        self.update_locked(&mut st);
    }

    fn update_locked(&self, st: &mut CdmaState) {
        if st.run != CdmaRunState::Running {
            return;
        }
        let mut signal = false;
        loop {
            let Some(head) = st.queue.head() else {
                if st.event == Some(CdmaEvent::SyncQueueEmpty) {
                    signal = true;
                }
                break;
            };
            assert_ne!(head.syncpt_id, nvhost_common::SYNCPT_INVALID);
            if !self.syncpt.update_min_is_expired(head.syncpt_id, head.syncpt_val) {
                if head.timeout_ms > 0 {
                    let (id, val, ms) = (head.syncpt_id, head.syncpt_val, head.timeout_ms);
                    let ctx = head.timeout.clone();
                    self.start_timer_locked(st, id, val, &ctx, ms);
                }
                break;
            }

            if st.timeout.ctx.is_some() {
                self.stop_timer_locked(st);
            }

            let entry = st.queue.dequeue_head();
            log::trace!(
                "cdma[{}]: reclaim syncpt {} val {} ({} slots, {} handles)",
                self.name,
                entry.syncpt_id,
                entry.syncpt_val,
                entry.nr_slots,
                entry.handles.len()
            );
            entry.client.unpin(&entry.handles);
            if entry.nr_slots > 0 {
                st.pb.pop(entry.nr_slots);
                if st.event == Some(CdmaEvent::PushBufferSpace) {
                    signal = true;
                }
            }
            if st.event == Some(CdmaEvent::SyncQueueSpace) {
                signal = true;
            }
        }
        if signal {
            st.event = None;
            self.sem.up();
        }
    }

    /// Wait up to `timeout` for every queued batch to complete.
    pub fn flush(&self, timeout: Duration) -> NvResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut st = self.state.lock();
            if st.queue.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::FlushTimeout(timeout.as_millis() as u64));
            }
            if let Some(other) = st.event {
                self.dump_locked(&st, log::Level::Error);
                panic!("cdma[{}]: flush while waiting for {:?}", self.name, other);
            }
            st.event = Some(CdmaEvent::SyncQueueEmpty);
            drop(st);

            if !self.sem.down_timeout(deadline - now) {
                let mut st = self.state.lock();
                if st.event == Some(CdmaEvent::SyncQueueEmpty) {
                    st.event = None;
                }
                if st.queue.is_empty() {
                    return Ok(());
                }
                return Err(Error::FlushTimeout(timeout.as_millis() as u64));
            }
        }
    }

    // ── Watchdog ────────────────────────────────────────────────────────

    fn start_timer_locked(
        &self,
        st: &mut CdmaState,
        syncpt_id: SyncptId,
        syncpt_val: u32,
        ctx: &Arc<TimeoutContext>,
        timeout_ms: u32,
    ) {
        if st.timeout.ctx.is_some() {
            return;
        }
        st.timeout = TimeoutState {
            ctx: Some(ctx.clone()),
            syncpt_id,
            syncpt_val,
            generation: self
                .timer
                .schedule(Duration::from_millis(u64::from(timeout_ms))),
            start: Some(Instant::now()),
        };
    }

    fn stop_timer_locked(&self, st: &mut CdmaState) {
        self.timer.cancel();
        st.timeout.ctx = None;
    }

    fn handle_timeout(&self, generation: u64) {
        let mut st = self.state.lock();
        let Some(ctx) = st.timeout.ctx.clone() else {
            log::debug!("cdma[{}]: timer cancelled", self.name);
            return;
        };
        if st.timeout.generation != generation {
            return;
        }
        let (sp_id, sp_val) = (st.timeout.syncpt_id, st.timeout.syncpt_val);

        // Stop this channel's command processor before looking at the
        // sync point, so nothing else completes behind our back.
        let stop_bit = 1u32 << self.id;
        self.hw.set_cmdproc_stop(self.hw.cmdproc_stop() | stop_bit);

        self.syncpt.update_min(sp_id);
        if self.syncpt.is_expired(sp_id, sp_val) {
            log::debug!(
                "cdma[{}]: timeout on syncpt {} thresh {} raced completion",
                self.name,
                sp_id,
                sp_val
            );
            self.hw.set_cmdproc_stop(self.hw.cmdproc_stop() & !stop_bit);
            self.update_locked(&mut st);
            return;
        }

        log::warn!(
            "cdma[{}]: timeout on syncpt {} thresh {} after {} ms (value {})",
            self.name,
            sp_id,
            sp_val,
            st.timeout.start.map_or(0, |s| s.elapsed().as_millis()),
            self.syncpt.read_min(sp_id)
        );
        self.dump_locked(&st, log::Level::Debug);

        // Teardown.
        self.hw.dma_ctrl(self.id, DmaCtrl::STOP);
        self.hw.reset_module(self.id);
        st.run = CdmaRunState::TornDown;

        let restart = self.resync_queue_locked(&mut st, &ctx, sp_id);
        ctx.mark_timed_out();
        self.stop_timer_locked(&mut st);

        // Roll GET back to the restart point and resume.
        self.hw.dma_set_put(self.id, restart);
        self.hw
            .dma_ctrl(self.id, DmaCtrl::STOP | DmaCtrl::GET_RESET | DmaCtrl::INIT_GET);
        self.hw.dma_ctrl(self.id, DmaCtrl::STOP);
        self.hw.dma_set_put(self.id, st.last_put);
        self.hw.dma_ctrl(self.id, DmaCtrl::empty());
        self.hw.set_cmdproc_stop(self.hw.cmdproc_stop() & !stop_bit);
        st.run = CdmaRunState::Running;
        log::debug!("cdma[{}]: restarted at 0x{:08X}", self.name, restart);

        self.update_locked(&mut st);
    }

    /// Rewrite the queued batches after a timeout of `ctx`. Returns the bus
    /// address DMA restarts from.
    fn resync_queue_locked(
        &self,
        st: &mut CdmaState,
        ctx: &Arc<TimeoutContext>,
        sp_id: SyncptId,
    ) -> PhysAddr {
        let mut value = self.syncpt.update_min(sp_id);
        let CdmaState {
            queue,
            pb,
            replay,
            last_put,
            ..
        } = st;
        log::debug!(
            "cdma[{}]: cleanup from value {} (queue read 0x{:X} write 0x{:X})",
            self.name,
            value,
            queue.read_cursor(),
            queue.write_cursor()
        );

        let mut entries = queue.iter_mut().peekable();

        // Batches that completed while the channel was being stopped.
        while let Some(entry) = entries.next_if(|e| syncpt_reached(value, e.syncpt_val)) {
            entry.dump(log::Level::Debug);
        }

        let restart = entries.peek().map_or(*last_put, |e| e.first_get);

        // Leading batches of the timed-out context: finish their increments
        // from the CPU and make their slots harmless.
        while let Some(entry) = entries.next_if(|e| Arc::ptr_eq(&e.timeout, ctx)) {
            let incrs = entry.syncpt_val.wrapping_sub(value);
            entry.timeout_ms = 0;
            log::debug!("cdma[{}]: CPU incr ({})", self.name, incrs);
            entry.dump(log::Level::Debug);
            for _ in 0..incrs {
                self.syncpt.cpu_incr(entry.syncpt_id);
            }
            if let Some(base) = self.wait_base {
                self.syncpt.incr_wait_base(base, incrs);
            }
            self.syncpt.update_min(entry.syncpt_id);
            pb.nop_slots(entry.first_get, entry.nr_slots);
            value = entry.syncpt_val;
        }

        // From the first other context on, increments of the timed-out
        // context must happen in push buffer order.
        let mut exec_ctxsave = false;
        for entry in entries {
            let incrs = entry.syncpt_val.wrapping_sub(value);
            if Arc::ptr_eq(&entry.timeout, ctx) {
                entry.timeout_ms = 0;
                let Some(replay) = replay.as_ref() else {
                    panic!("cdma[{}]: timed out without replay buffer", self.name);
                };
                self.replay_incrs_locked(pb, replay, entry, incrs, exec_ctxsave);
                exec_ctxsave = false;
            } else {
                log::debug!("cdma[{}]: switch to a different context", self.name);
                exec_ctxsave = true;
            }
            entry.dump(log::Level::Debug);
            value = entry.syncpt_val;
        }

        restart
    }

    /// Replace the slots of `entry` with GATHERs of the replay buffer that
    /// perform `incrs` increments. A leading context save is kept when it
    /// saves another context's state.
    fn replay_incrs_locked(
        &self,
        pb: &mut PushBuffer,
        replay: &ReplayBuffer,
        entry: &SyncQueueEntry,
        mut incrs: u32,
        exec_ctxsave: bool,
    ) {
        let mut offset = pb.offset_of(entry.first_get);
        let mut slots = entry.nr_slots;
        if exec_ctxsave {
            if let Some(save) = entry.ctxsave {
                // Abandoned slots ahead of the save are already no-ops.
                let skip = save.lead + save.slots;
                for _ in 0..skip {
                    offset = pb.next_offset(offset);
                }
                slots -= skip;
                incrs -= save.incrs;
            }
        }
        if incrs > slots * replay.incrs {
            pb.dump(log::Level::Error);
            panic!(
                "cdma[{}]: {} increments do not fit {} replay slots",
                self.name, incrs, slots
            );
        }
        log::debug!(
            "cdma[{}]: replay {} incrs in {} slots from 0x{:X}",
            self.name,
            incrs,
            slots,
            offset
        );
        for _ in 0..slots {
            if incrs > 0 {
                let n = incrs.min(replay.incrs);
                pb.write_slot(
                    offset,
                    opcodes::gather_nonincr(opcodes::METHOD_INCR_SYNCPT, n),
                    replay.phys,
                );
                incrs -= n;
            } else {
                pb.write_slot(offset, opcodes::NOOP, opcodes::NOOP);
            }
            offset = pb.next_offset(offset);
        }
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    fn dump_locked(&self, st: &CdmaState, level: log::Level) {
        log::log!(
            level,
            "cdma[{}]: {:?} event {:?} last_put 0x{:08X} hw get 0x{:08X} slots used {}",
            self.name,
            st.run,
            st.event,
            st.last_put,
            self.hw.dma_get(self.id),
            st.slots_used
        );
        if let Some(ctx) = &st.timeout.ctx {
            log::log!(
                level,
                "cdma[{}]: watchdog on syncpt {} thresh {} ({} ms)",
                self.name,
                st.timeout.syncpt_id,
                st.timeout.syncpt_val,
                ctx.timeout_ms()
            );
        }
        st.pb.dump(level);
        st.queue.dump(level);
    }

    pub fn dump(&self, level: log::Level) {
        let st = self.state.lock();
        self.dump_locked(&st, level);
    }
}

// ── Submission guard ────────────────────────────────────────────────────

/// An open submission. Holds the engine lock until [`end`](Self::end).
pub struct CdmaSubmit<'a> {
    cdma: &'a Cdma,
    st: MutexGuard<'a, CdmaState>,
    ctxsave: Option<CtxSaveSlots>,
    ended: bool,
}

impl CdmaSubmit<'_> {
    pub fn push(&mut self, op1: u32, op2: u32) {
        self.push_slot(SlotOwner::None, op1, op2);
    }

    /// Push a slot that gathers from `handle`.
    pub fn push_gather(
        &mut self,
        client: &Arc<dyn MemClient>,
        handle: &Arc<MemHandle>,
        op1: u32,
        op2: u32,
    ) {
        let owner = SlotOwner::Gather {
            client: Arc::downgrade(client),
            handle: Arc::downgrade(handle),
        };
        self.push_slot(owner, op1, op2);
    }

    fn push_slot(&mut self, owner: SlotOwner, op1: u32, op2: u32) {
        let cdma = self.cdma;
        if self.st.slots_free == 0 {
            cdma.kick_locked(&mut self.st);
            self.st.slots_free = cdma.wait_locked(&mut self.st, CdmaEvent::PushBufferSpace);
        }
        self.st.slots_free -= 1;
        self.st.slots_used += 1;
        self.st.pb.push(owner, op1, op2);
    }

    /// Slots pushed so far.
    pub fn slots_used(&self) -> u32 {
        self.st.slots_used
    }

    /// Record that the slots pushed so far are a context save performing
    /// `incrs` increments.
    pub fn mark_ctxsave(&mut self, incrs: u32) {
        self.ctxsave = Some(CtxSaveSlots {
            lead: 0,
            slots: self.st.slots_used,
            incrs,
        });
    }

    /// Kick DMA and queue the batch. `handles` are unpinned with `client`
    /// once `syncpt_val` is reached.
    pub fn end(
        mut self,
        client: Arc<dyn MemClient>,
        syncpt_id: SyncptId,
        syncpt_val: u32,
        handles: Vec<Arc<MemHandle>>,
        ctx: &Arc<TimeoutContext>,
    ) {
        let cdma = self.cdma;
        let was_idle = self.st.queue.is_empty();
        cdma.kick_locked(&mut self.st);

        let orphans = self.st.orphan_slots;
        let mut slots = self.st.slots_used + orphans;
        self.st.orphan_slots = 0;
        self.st.orphan_get = None;
        let mut ctxsave = self
            .ctxsave
            .take()
            .map(|save| CtxSaveSlots { lead: orphans, ..save });
        let mut remaining = handles.len() as u32;
        let mut handles = handles.into_iter();
        let first_get = self.st.first_get;

        while remaining > 0 || slots > 0 {
            cdma.wait_locked(&mut self.st, CdmaEvent::SyncQueueSpace);
            let n = self.st.queue.space_for(remaining);
            remaining -= n;
            let chunk: Vec<_> = handles.by_ref().take(n as usize).collect();
            let entry = SyncQueueEntry::new(
                syncpt_id,
                syncpt_val,
                first_get,
                ctx.clone(),
                slots,
                client.clone(),
                chunk,
                ctxsave.take(),
            );
            self.st.queue.enqueue(entry);
            // Only the first chunk carries slots.
            slots = 0;
        }

        if was_idle && ctx.timeout_ms() > 0 {
            cdma.start_timer_locked(&mut self.st, syncpt_id, syncpt_val, ctx, ctx.timeout_ms());
        }
        log::debug!(
            "cdma[{}]: submit syncpt {} val {} first_get 0x{:08X}",
            cdma.name,
            syncpt_id,
            syncpt_val,
            first_get
        );
        self.ended = true;
    }
}

impl Drop for CdmaSubmit<'_> {
    fn drop(&mut self) {
        if self.ended || self.st.slots_used == 0 {
            return;
        }
        log::warn!(
            "cdma[{}]: submission dropped with {} slots, replacing with no-ops",
            self.cdma.name,
            self.st.slots_used
        );
        let (start, used) = (self.st.first_get, self.st.slots_used);
        self.st.pb.nop_slots(start, used);
        self.st.orphan_slots += used;
        self.st.orphan_get = Some(start);
    }
}
