// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! A host1x channel: reference-counted access to one CDMA engine plus
//! job submission with hardware context switching.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nvhost_common::settings::{ChannelDesc, HostConfig};
use nvhost_common::{ChannelId, Error, NvResult, WORD_BYTES};
use parking_lot::Mutex;

use crate::cdma::Cdma;
use crate::hw::Host1xHw;
use crate::hwctx::HwContext;
use crate::intr::{Action, Intr, SubmitCompletion, Waiter};
use crate::mem::{pin_array, MemClient, MemHandle};
use crate::opcodes;
use crate::syncpt::SyncptTable;
use crate::timeout::TimeoutContext;

/// A span of a client command buffer to execute.
#[derive(Debug, Clone)]
pub struct Gather {
    pub handle: Arc<MemHandle>,
    /// Length in words.
    pub words: u32,
    /// Start, in words from the beginning of the handle.
    pub offset: u32,
}

/// One submission from a client.
pub struct Job {
    pub client: Arc<dyn MemClient>,
    pub timeout: Arc<TimeoutContext>,
    pub hwctx: Option<Arc<HwContext>>,
    pub gathers: Vec<Gather>,
    /// Buffers the gathers reference that must stay pinned until the job
    /// completes.
    pub handles: Vec<Arc<MemHandle>>,
    /// Increments of the channel sync point the gathers perform.
    pub syncpt_incrs: u32,
}

impl Job {
    pub fn new(client: Arc<dyn MemClient>, timeout: Arc<TimeoutContext>) -> Self {
        Self {
            client,
            timeout,
            hwctx: None,
            gathers: Vec::new(),
            handles: Vec::new(),
            syncpt_incrs: 0,
        }
    }

    pub fn with_hwctx(mut self, hwctx: Arc<HwContext>) -> Self {
        self.hwctx = Some(hwctx);
        self
    }

    pub fn gather(mut self, handle: Arc<MemHandle>, words: u32, incrs: u32) -> Self {
        self.gathers.push(Gather {
            handle,
            words,
            offset: 0,
        });
        self.syncpt_incrs += incrs;
        self
    }
}

pub struct Channel {
    id: ChannelId,
    desc: ChannelDesc,
    config: Arc<HostConfig>,
    hw: Arc<dyn Host1xHw>,
    syncpt: Arc<SyncptTable>,
    intr: Arc<Intr>,
    mem: Arc<dyn MemClient>,
    /// Open count. Held across bring-up and teardown of the engine.
    refs: Mutex<u32>,
    /// Taken briefly by the completion path, never across a drain.
    cdma: Mutex<Option<Arc<Cdma>>>,
    cur_ctx: Mutex<Option<Arc<HwContext>>>,
    /// Submissions whose completion has not been handled yet.
    busy: AtomicU32,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        desc: ChannelDesc,
        config: Arc<HostConfig>,
        hw: Arc<dyn Host1xHw>,
        syncpt: Arc<SyncptTable>,
        intr: Arc<Intr>,
        mem: Arc<dyn MemClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            desc,
            config,
            hw,
            syncpt,
            intr,
            mem,
            refs: Mutex::new(0),
            cdma: Mutex::new(None),
            cur_ctx: Mutex::new(None),
            busy: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn desc(&self) -> &ChannelDesc {
        &self.desc
    }

    pub fn refcount(&self) -> u32 {
        *self.refs.lock()
    }

    pub fn is_open(&self) -> bool {
        self.refcount() > 0
    }

    /// The engine, while the channel is open.
    pub fn cdma(&self) -> Option<Arc<Cdma>> {
        self.cdma.lock().clone()
    }

    pub fn cur_ctx(&self) -> Option<Arc<HwContext>> {
        self.cur_ctx.lock().clone()
    }

    /// Number of submissions still in flight.
    pub fn busy(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    /// Take a reference. The first one brings up the CDMA engine.
    pub fn open(&self) -> NvResult<()> {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            let cdma = Cdma::new(
                self.id,
                &self.desc,
                &self.config,
                self.hw.clone(),
                self.syncpt.clone(),
                self.mem.clone(),
            )?;
            *self.cdma.lock() = Some(cdma);
            log::info!("channel {} ({}): opened", self.id, self.desc.name);
        }
        *refs += 1;
        Ok(())
    }

    /// Drop a reference. The last one drains and releases the engine.
    pub fn close(&self) {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            log::warn!("channel {}: close without open", self.id);
            return;
        }
        *refs -= 1;
        if *refs > 0 {
            return;
        }
        // The engine stays reachable until drained so completions can
        // still reclaim.
        let cdma = self.cdma.lock().clone();
        if let Some(cdma) = cdma {
            cdma.stop();
            self.cdma.lock().take();
            cdma.destroy();
        }
        self.cur_ctx.lock().take();
        log::info!("channel {} ({}): closed", self.id, self.desc.name);
    }

    fn require_cdma(&self) -> NvResult<Arc<Cdma>> {
        self.cdma().ok_or(Error::InvalidChannel(self.id))
    }

    /// Submit `job`. Returns the sync point value that marks its
    /// completion.
    pub fn submit(self: &Arc<Self>, job: Job) -> NvResult<u32> {
        let cdma = self.require_cdma()?;
        let sp = self.desc.syncpt;
        // Once the batch is queued nothing may fail, so the waiters below
        // must not need to claim the line.
        self.intr.request_irq()?;

        let handles: Vec<Arc<MemHandle>> = job
            .gathers
            .iter()
            .map(|g| g.handle.clone())
            .chain(job.handles.iter().cloned())
            .collect();
        let phys = pin_array(&*job.client, &handles)?;

        // Allocated before the engine lock is taken.
        let complete_waiter = Waiter::new();
        let save_waiter = Waiter::new();
        let restore_waiter = Waiter::new();

        let mut sub = match cdma.begin(&job.timeout) {
            Ok(sub) => sub,
            Err(err) => {
                job.client.unpin(&handles);
                return Err(err);
            }
        };

        let (save_ctx, restore_ctx) = {
            let mut cur = self.cur_ctx.lock();
            let switching = match (&*cur, &job.hwctx) {
                (_, None) => false,
                (Some(prev), Some(next)) => !Arc::ptr_eq(prev, next),
                (None, Some(_)) => true,
            };
            if switching {
                let save = cur.take().filter(|prev| prev.save_program().is_some());
                let restore = job
                    .hwctx
                    .clone()
                    .filter(|next| next.is_valid() && next.restore_program().is_some());
                *cur = job.hwctx.clone();
                (save, restore)
            } else {
                (None, None)
            }
        };

        let save_incrs = save_ctx
            .as_ref()
            .and_then(|c| c.save_program())
            .map_or(0, |p| p.program.incrs);
        let restore_incrs = restore_ctx
            .as_ref()
            .and_then(|c| c.restore_program())
            .map_or(0, |p| p.program.incrs);
        let fence = self
            .syncpt
            .incr_max(sp, save_incrs + restore_incrs + job.syncpt_incrs);
        let base = fence.wrapping_sub(save_incrs + restore_incrs + job.syncpt_incrs);

        if let Some(prev) = &save_ctx {
            if let Some(save) = prev.save_program() {
                log::debug!("channel {}: save outgoing context", self.id);
                sub.push_gather(
                    prev.client(),
                    &save.program.handle,
                    opcodes::gather(save.program.words),
                    save.phys,
                );
                sub.mark_ctxsave(save_incrs);
                prev.set_valid();
            }
        }
        if let Some(next) = &restore_ctx {
            if let Some(restore) = next.restore_program() {
                log::debug!("channel {}: restore incoming context", self.id);
                sub.push_gather(
                    next.client(),
                    &restore.program.handle,
                    opcodes::gather(restore.program.words),
                    restore.phys,
                );
            }
        }

        sub.push(
            opcodes::setclass(self.desc.class_id, 0, 0),
            opcodes::NOOP,
        );
        for (gather, addr) in job.gathers.iter().zip(&phys) {
            sub.push_gather(
                &job.client,
                &gather.handle,
                opcodes::gather(gather.words),
                addr + gather.offset * WORD_BYTES,
            );
        }

        sub.end(job.client.clone(), sp, fence, handles, &job.timeout);

        // The batch is queued; from here on failures are only reported.
        if let Some(prev) = save_ctx {
            let thresh = base.wrapping_add(save_incrs);
            if let Err(err) = self
                .intr
                .add_waiter(sp, thresh, Action::CtxSave(prev), save_waiter)
            {
                log::warn!("channel {}: ctxsave waiter at {}: {}", self.id, thresh, err);
            }
        }
        if let Some(next) = restore_ctx {
            let thresh = base.wrapping_add(save_incrs + restore_incrs);
            if let Err(err) = self
                .intr
                .add_waiter(sp, thresh, Action::CtxRestore(next), restore_waiter)
            {
                log::warn!("channel {}: ctxrestore waiter at {}: {}", self.id, thresh, err);
            }
        }
        self.busy.fetch_add(1, Ordering::AcqRel);
        let receiver: Arc<dyn SubmitCompletion> = self.clone();
        if let Err(err) =
            self.intr
                .add_waiter(sp, fence, Action::SubmitComplete(receiver), complete_waiter)
        {
            // Reclaimed by the next completion on this channel instead.
            self.busy.fetch_sub(1, Ordering::AcqRel);
            log::warn!("channel {}: completion waiter at {}: {}", self.id, fence, err);
        }
        log::debug!(
            "channel {}: job with {} gathers, fence {}",
            self.id,
            job.gathers.len(),
            fence
        );
        Ok(fence)
    }

    /// Wait up to `timeout` for every submitted job to complete.
    pub fn flush(&self, timeout: Duration) -> NvResult<()> {
        match self.cdma() {
            Some(cdma) => cdma.flush(timeout),
            None => Ok(()),
        }
    }

    /// Read `count` words from the channel's output FIFO.
    pub fn read_fifo(&self, count: usize) -> NvResult<Vec<u32>> {
        let interval = Duration::from_micros(self.config.fifo_poll_interval_us);
        let deadline = Instant::now() + Duration::from_millis(self.config.fifo_drain_timeout_ms);
        let mut words = Vec::with_capacity(count);
        while words.len() < count {
            let available = self.hw.fifo_entries(self.id);
            if available == 0 {
                if Instant::now() >= deadline {
                    return Err(Error::FifoTimeout {
                        remaining: count - words.len(),
                    });
                }
                thread::sleep(interval);
                continue;
            }
            for _ in 0..available.min(count - words.len()) {
                words.push(self.hw.fifo_read(self.id));
            }
        }
        Ok(words)
    }
}

impl SubmitCompletion for Channel {
    fn submit_complete(&self, count: u32) {
        if let Some(cdma) = self.cdma() {
            cdma.update();
        }
        let prev = self.busy.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(prev >= count);
        if prev == count {
            log::trace!("channel {}: idle", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeHw, FakeMem};
    use crate::hwctx::CtxProgram;

    struct Rig {
        hw: Arc<FakeHw>,
        mem: Arc<FakeMem>,
        sp: Arc<SyncptTable>,
        intr: Arc<Intr>,
        ch: Arc<Channel>,
    }

    const SP: u32 = 22;

    fn rig_with(config: HostConfig) -> Rig {
        let config = Arc::new(config);
        let hw = FakeHw::new(&config);
        let mem = FakeMem::new();
        let sp = Arc::new(SyncptTable::new(&config, hw.clone()));
        let intr = Arc::new(Intr::new(hw.clone(), sp.clone()));
        let ch = Channel::new(
            1,
            config.channels[1].clone(),
            config.clone(),
            hw.clone(),
            sp.clone(),
            intr.clone(),
            mem.clone(),
        );
        Rig {
            hw,
            mem,
            sp,
            intr,
            ch,
        }
    }

    fn rig() -> Rig {
        let r = rig_with(HostConfig::default());
        r.ch.open().unwrap();
        r
    }

    impl Rig {
        fn job(&self, incrs: u32) -> Job {
            let cmds = self.mem.alloc(4).unwrap();
            Job::new(self.mem.clone(), TimeoutContext::new(0)).gather(cmds, 4, incrs)
        }

        fn complete_to(&self, value: u32) {
            self.hw.set_syncpt(SP, value);
            self.intr.on_interrupt(SP);
        }

        fn program(&self, incrs: u32) -> CtxProgram {
            CtxProgram {
                handle: self.mem.alloc(8).unwrap(),
                words: 8,
                incrs,
            }
        }

        fn hwctx(&self) -> Arc<HwContext> {
            HwContext::new(
                self.mem.clone(),
                TimeoutContext::new(0),
                Some(self.program(1)),
                Some(self.program(0)),
                None,
            )
            .unwrap()
        }
    }

    #[test]
    fn test_submit_requires_open() {
        let r = rig_with(HostConfig::default());
        let err = r.ch.submit(r.job(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidChannel(1)));
    }

    #[test]
    fn test_open_close_refcount() {
        let r = rig();
        r.ch.open().unwrap();
        assert_eq!(r.ch.refcount(), 2);
        let cdma = r.ch.cdma().unwrap();
        r.ch.close();
        assert!(Arc::ptr_eq(&cdma, &r.ch.cdma().unwrap()));
        r.ch.close();
        assert!(r.ch.cdma().is_none());
        assert_eq!(r.mem.pinned_handles(), 0);
        // An extra close is harmless.
        r.ch.close();
        assert_eq!(r.ch.refcount(), 0);
    }

    #[test]
    fn test_submit_and_complete() {
        let r = rig();
        let job = r.job(2);
        let cmds = job.gathers[0].handle.clone();
        let fence = r.ch.submit(job).unwrap();
        assert_eq!(fence, 2);
        assert_eq!(r.ch.busy(), 1);
        assert_eq!(r.mem.pin_count(&cmds), 1);
        assert_eq!(r.intr.thresholds(SP), vec![2]);

        r.complete_to(1);
        assert_eq!(r.ch.busy(), 1);
        r.complete_to(2);
        assert_eq!(r.ch.busy(), 0);
        assert_eq!(r.mem.pin_count(&cmds), 0);
        assert!(r.ch.cdma().unwrap().is_idle());
    }

    #[test]
    fn test_gather_slots() {
        let r = rig();
        let cdma = r.ch.cdma().unwrap();
        let start = cdma.put_pointer();
        let mut job = r.job(1);
        job.gathers[0].offset = 2;
        job.gathers[0].words = 2;
        let cmds = job.gathers[0].handle.clone();
        r.ch.submit(job).unwrap();
        let class = r.ch.desc().class_id;
        assert_eq!(
            cdma.read_slot(start),
            (opcodes::setclass(class, 0, 0), opcodes::NOOP)
        );
        let phys = r.mem.pin(&cmds).unwrap();
        r.mem.unpin(std::slice::from_ref(&cmds));
        assert_eq!(
            cdma.read_slot(start + 8),
            (opcodes::gather(2), phys + 8)
        );
    }

    #[test]
    fn test_pin_failure_rolls_back() {
        let r = rig();
        let first = r.mem.alloc(4).unwrap();
        let second = r.mem.alloc(4).unwrap();
        r.mem.fail_pin(second.id());
        let job = Job::new(r.mem.clone(), TimeoutContext::new(0))
            .gather(first.clone(), 4, 1)
            .gather(second.clone(), 4, 1);
        let err = r.ch.submit(job).unwrap_err();
        assert!(matches!(err, Error::Mem(_)));
        assert_eq!(r.mem.pin_count(&first), 0);
        assert_eq!(r.sp.read_max(SP), 0);
        assert!(r.ch.cdma().unwrap().is_idle());
        assert_eq!(r.ch.busy(), 0);
    }

    #[test]
    fn test_timed_out_context_unpins() {
        let r = rig();
        let ctx = TimeoutContext::new(50);
        ctx.mark_timed_out();
        let cmds = r.mem.alloc(4).unwrap();
        let job = Job::new(r.mem.clone(), ctx).gather(cmds.clone(), 4, 1);
        assert!(matches!(r.ch.submit(job), Err(Error::TimedOut)));
        assert_eq!(r.mem.pin_count(&cmds), 0);
        assert_eq!(r.sp.read_max(SP), 0);
    }

    #[test]
    fn test_context_switch_saves_and_restores() {
        let r = rig();
        let a = r.hwctx();
        let b = r.hwctx();

        // First use of A: nothing to save, nothing to restore.
        let f1 = r.ch.submit(r.job(1).with_hwctx(a.clone())).unwrap();
        assert_eq!(f1, 1);
        assert!(!a.is_valid());

        // Switch to B: A's state is saved (one increment).
        let cdma = r.ch.cdma().unwrap();
        let b_start = cdma.put_pointer();
        let f2 = r.ch.submit(r.job(1).with_hwctx(b.clone())).unwrap();
        assert_eq!(f2, 3);
        assert!(a.is_valid());
        let save = a.save_program().unwrap();
        assert_eq!(
            cdma.read_slot(b_start),
            (opcodes::gather(save.program.words), save.phys)
        );
        assert!(Arc::ptr_eq(&r.ch.cur_ctx().unwrap(), &b));

        // Back to A: B saved, A restored.
        let a_start = cdma.put_pointer();
        let f3 = r.ch.submit(r.job(1).with_hwctx(a.clone())).unwrap();
        assert_eq!(f3, 5);
        let restore = a.restore_program().unwrap();
        assert_eq!(
            cdma.read_slot(a_start + 8),
            (opcodes::gather(restore.program.words), restore.phys)
        );

        // Same context again: no switch.
        let f4 = r.ch.submit(r.job(1).with_hwctx(a.clone())).unwrap();
        assert_eq!(f4, 6);

        r.complete_to(f4);
        assert_eq!(a.saves_completed(), 1);
        assert_eq!(a.restores_completed(), 1);
        assert_eq!(b.saves_completed(), 1);
        assert_eq!(b.restores_completed(), 0);
        assert_eq!(r.ch.busy(), 0);
        assert!(cdma.is_idle());
    }

    #[test]
    fn test_read_fifo() {
        let config = HostConfig {
            fifo_drain_timeout_ms: 20,
            ..HostConfig::default()
        };
        let r = rig_with(config);
        r.hw.push_fifo(1, &[7, 8, 9]);
        assert_eq!(r.ch.read_fifo(2).unwrap(), vec![7, 8]);
        let err = r.ch.read_fifo(3).unwrap_err();
        assert!(matches!(err, Error::FifoTimeout { remaining: 2 }));
    }

    #[test]
    fn test_close_drains_pending_job() {
        use std::sync::mpsc;

        let r = rig();
        let job = r.job(1);
        let cmds = job.gathers[0].handle.clone();
        let fence = r.ch.submit(job).unwrap();

        let (closed_tx, closed_rx) = mpsc::channel();
        let ch = r.ch.clone();
        let closer = thread::spawn(move || {
            ch.close();
            closed_tx.send(()).unwrap();
        });
        thread::sleep(Duration::from_millis(30));
        assert!(closed_rx.try_recv().is_err());

        let (isr_tx, isr_rx) = mpsc::channel();
        let (hw, intr) = (r.hw.clone(), r.intr.clone());
        let isr = thread::spawn(move || {
            hw.set_syncpt(SP, fence);
            intr.on_interrupt(SP);
            isr_tx.send(()).unwrap();
        });
        isr_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        closed_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        isr.join().unwrap();
        closer.join().unwrap();

        assert!(r.ch.cdma().is_none());
        assert_eq!(r.ch.busy(), 0);
        assert_eq!(r.mem.pin_count(&cmds), 0);
    }

    #[test]
    fn test_irq_unavailable_rejects_before_queueing() {
        let r = rig();
        r.hw.fail_irq_request(true);
        let job = r.job(1);
        let cmds = job.gathers[0].handle.clone();
        let err = r.ch.submit(job).unwrap_err();
        assert!(matches!(err, Error::Hw(_)));
        assert!(r.ch.cdma().unwrap().is_idle());
        assert_eq!(r.mem.pin_count(&cmds), 0);
        assert_eq!(r.sp.read_max(SP), 0);
        assert_eq!(r.ch.busy(), 0);

        r.hw.fail_irq_request(false);
        let fence = r.ch.submit(r.job(1)).unwrap();
        assert_eq!(fence, 1);
        assert_eq!(r.ch.busy(), 1);
        r.complete_to(fence);
        assert_eq!(r.ch.busy(), 0);
        assert!(r.ch.cdma().unwrap().is_idle());
    }

    #[test]
    fn test_flush_waits_for_completion() {
        let r = rig();
        let fence = r.ch.submit(r.job(1)).unwrap();
        assert!(matches!(
            r.ch.flush(Duration::from_millis(20)),
            Err(Error::FlushTimeout(20))
        ));
        r.complete_to(fence);
        r.ch.flush(Duration::from_millis(20)).unwrap();
    }
}
