// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sync point interrupt dispatcher.
//!
//! Every sync point keeps a wait list sorted ascending by threshold. The
//! hardware threshold register always holds the head's threshold and the
//! sync point interrupt is enabled exactly while the list is non-empty.
//! When the interrupt fires, every waiter whose threshold has been reached
//! is removed under the list lock, grouped by action kind, and the handlers
//! run afterwards without the lock held.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nvhost_common::{intr_banks, Error, NvResult, SyncptId, SYNCPTS_PER_BANK};
use parking_lot::{Condvar, Mutex};

use crate::hw::Host1xHw;
use crate::hwctx::HwContext;
use crate::syncpt::{syncpt_reached, SyncptTable};

// ── Actions ─────────────────────────────────────────────────────────────

/// Receiver of batched submit-complete notifications.
pub trait SubmitCompletion: Send + Sync {
    /// `count` batches on this receiver's sync point have completed.
    fn submit_complete(&self, count: u32);
}

/// What to do once a threshold is reached.
pub enum Action {
    SubmitComplete(Arc<dyn SubmitCompletion>),
    CtxSave(Arc<HwContext>),
    CtxRestore(Arc<HwContext>),
    Wakeup(Arc<WaitEvent>),
    WakeupInterruptible(Arc<WaitEvent>),
}

/// Action kinds in delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    SubmitComplete = 0,
    CtxSave = 1,
    CtxRestore = 2,
    Wakeup = 3,
    WakeupInterruptible = 4,
}

const ACTION_KINDS: usize = 5;

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::SubmitComplete(_) => ActionKind::SubmitComplete,
            Self::CtxSave(_) => ActionKind::CtxSave,
            Self::CtxRestore(_) => ActionKind::CtxRestore,
            Self::Wakeup(_) => ActionKind::Wakeup,
            Self::WakeupInterruptible(_) => ActionKind::WakeupInterruptible,
        }
    }

    fn payload(&self) -> *const () {
        match self {
            Self::SubmitComplete(c) => Arc::as_ptr(c) as *const (),
            Self::CtxSave(c) | Self::CtxRestore(c) => Arc::as_ptr(c) as *const (),
            Self::Wakeup(e) | Self::WakeupInterruptible(e) => Arc::as_ptr(e) as *const (),
        }
    }

    fn run(self, count: u32) {
        match self {
            Self::SubmitComplete(receiver) => receiver.submit_complete(count),
            Self::CtxSave(ctx) => ctx.save_done(),
            Self::CtxRestore(ctx) => ctx.restore_done(),
            Self::Wakeup(event) | Self::WakeupInterruptible(event) => event.signal(),
        }
    }
}

// ── Waiter ──────────────────────────────────────────────────────────────

const WLS_PENDING: u8 = 0;
const WLS_REMOVED: u8 = 1;
const WLS_CANCELLED: u8 = 2;
const WLS_HANDLED: u8 = 3;

/// Waiter state. Moves forward only: pending, then removed or cancelled,
/// then handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterState {
    Pending,
    Removed,
    Cancelled,
    Handled,
}

/// One registration on a sync point threshold. Allocate it before calling
/// [`Intr::add_waiter`]; no allocation happens under the list lock.
pub struct Waiter {
    id: AtomicU32,
    thresh: AtomicU32,
    state: AtomicU8,
    action: Mutex<Option<Action>>,
    /// Submit-complete waiters coalesced into this one, itself included.
    count: AtomicU32,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU32::new(0),
            thresh: AtomicU32::new(0),
            state: AtomicU8::new(WLS_PENDING),
            action: Mutex::new(None),
            count: AtomicU32::new(1),
        })
    }

    pub fn thresh(&self) -> u32 {
        self.thresh.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WaiterState {
        match self.state.load(Ordering::Acquire) {
            WLS_PENDING => WaiterState::Pending,
            WLS_REMOVED => WaiterState::Removed,
            WLS_CANCELLED => WaiterState::Cancelled,
            _ => WaiterState::Handled,
        }
    }
}

// ── WaitEvent ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    Interrupted,
    TimedOut,
}

#[derive(Default)]
struct EventState {
    signaled: bool,
    interrupted: bool,
}

/// Condition a thread sleeps on until a wakeup action fires.
#[derive(Default)]
pub struct WaitEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl WaitEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        self.state.lock().signaled = true;
        self.cond.notify_all();
    }

    /// Wake interruptible sleepers without the event having fired.
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub fn wait(&self, timeout: Duration, interruptible: bool) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.signaled {
                return WaitStatus::Signaled;
            }
            if interruptible && state.interrupted {
                return WaitStatus::Interrupted;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.signaled {
                    WaitStatus::Signaled
                } else {
                    WaitStatus::TimedOut
                };
            }
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────────

pub struct Intr {
    hw: Arc<dyn Host1xHw>,
    syncpt: Arc<SyncptTable>,
    lists: Box<[Mutex<Vec<Arc<Waiter>>>]>,
    irq_requested: Mutex<bool>,
}

impl Intr {
    pub fn new(hw: Arc<dyn Host1xHw>, syncpt: Arc<SyncptTable>) -> Self {
        let lists = (0..syncpt.num_syncpts())
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Self {
            hw,
            syncpt,
            lists,
            irq_requested: Mutex::new(false),
        }
    }

    /// Claim the interrupt line on first use.
    pub fn request_irq(&self) -> NvResult<()> {
        let mut requested = self.irq_requested.lock();
        if !*requested {
            self.hw.request_irq()?;
            log::debug!("intr: interrupt line requested");
            *requested = true;
        }
        Ok(())
    }

    /// Register `waiter` to run `action` once sync point `id` reaches
    /// `thresh`.
    pub fn add_waiter(
        &self,
        id: SyncptId,
        thresh: u32,
        action: Action,
        waiter: Arc<Waiter>,
    ) -> NvResult<()> {
        if !self.syncpt.is_valid(id) {
            return Err(Error::InvalidSyncpt(id));
        }
        assert_eq!(
            waiter.state.load(Ordering::Acquire),
            WLS_PENDING,
            "intr: waiter registered twice"
        );
        self.request_irq()?;

        waiter.id.store(id, Ordering::Release);
        waiter.thresh.store(thresh, Ordering::Release);
        *waiter.action.lock() = Some(action);

        let mut list = self.lists[id as usize].lock();
        let was_empty = list.is_empty();
        // Scan from the tail; equal thresholds keep registration order.
        let pos = list
            .iter()
            .rposition(|w| (w.thresh().wrapping_sub(thresh) as i32) <= 0)
            .map_or(0, |i| i + 1);
        list.insert(pos, waiter);
        if pos == 0 {
            self.hw.set_syncpt_threshold(id, thresh);
            if was_empty {
                self.hw.enable_syncpt_intr(id);
            }
        }
        log::trace!("intr: syncpt {} add thresh {} at {}", id, thresh, pos);
        Ok(())
    }

    /// Withdraw a waiter. If delivery has already started, waits until it
    /// has finished.
    pub fn cancel(&self, waiter: &Arc<Waiter>) {
        loop {
            match waiter.state.compare_exchange(
                WLS_PENDING,
                WLS_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(WLS_REMOVED) => thread::yield_now(),
                Err(_) => break,
            }
        }

        let id = waiter.id.load(Ordering::Acquire);
        let mut list = self.lists[id as usize].lock();
        if waiter
            .state
            .compare_exchange(
                WLS_CANCELLED,
                WLS_HANDLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            if let Some(pos) = list.iter().position(|w| Arc::ptr_eq(w, waiter)) {
                list.remove(pos);
                if pos == 0 {
                    self.reprogram(id, &list);
                }
            }
            waiter.action.lock().take();
        }
    }

    fn reprogram(&self, id: SyncptId, list: &[Arc<Waiter>]) {
        match list.first() {
            Some(head) => {
                self.hw.set_syncpt_threshold(id, head.thresh());
                self.hw.enable_syncpt_intr(id);
            }
            None => self.hw.disable_syncpt_intr(id),
        }
    }

    /// Deliver every waiter on `id` whose threshold has been reached.
    pub fn on_interrupt(&self, id: SyncptId) {
        let value = self.syncpt.update_min(id);
        let mut buckets: [Vec<Arc<Waiter>>; ACTION_KINDS] = Default::default();

        {
            let mut list = self.lists[id as usize].lock();
            let reached = list
                .iter()
                .position(|w| !syncpt_reached(value, w.thresh()))
                .unwrap_or(list.len());
            for waiter in list.drain(..reached) {
                // Pending becomes removed; cancelled becomes handled.
                if waiter.state.fetch_add(1, Ordering::AcqRel) != WLS_PENDING {
                    waiter.action.lock().take();
                    continue;
                }
                let (kind, payload) = match waiter.action.lock().as_ref() {
                    Some(action) => (action.kind(), action.payload()),
                    None => {
                        waiter.state.store(WLS_HANDLED, Ordering::Release);
                        continue;
                    }
                };
                let bucket = &mut buckets[kind as usize];
                if kind == ActionKind::SubmitComplete {
                    if let Some(prev) = bucket.last() {
                        let same = prev
                            .action
                            .lock()
                            .as_ref()
                            .is_some_and(|a| a.payload() == payload);
                        if same {
                            prev.count.fetch_add(1, Ordering::AcqRel);
                            waiter.action.lock().take();
                            waiter.state.store(WLS_HANDLED, Ordering::Release);
                            continue;
                        }
                    }
                }
                bucket.push(waiter);
            }
            self.reprogram(id, &list);
        }

        for bucket in buckets {
            for waiter in bucket {
                let action = waiter.action.lock().take();
                if let Some(action) = action {
                    action.run(waiter.count.load(Ordering::Acquire));
                }
                waiter.state.store(WLS_HANDLED, Ordering::Release);
            }
        }
    }

    /// Interrupt service routine: acknowledge and deliver every pending
    /// threshold interrupt. Returns whether any was pending.
    pub fn isr(&self) -> bool {
        let num = self.syncpt.num_syncpts();
        let mut handled = false;
        for bank in 0..intr_banks(num) {
            let mut status = self.hw.syncpt_intr_status(bank);
            while status != 0 {
                let bit = status.trailing_zeros();
                status &= status - 1;
                let id = bank * SYNCPTS_PER_BANK + bit;
                if id >= num {
                    continue;
                }
                self.hw.disable_syncpt_intr(id);
                self.hw.ack_syncpt_intr(id);
                self.on_interrupt(id);
                handled = true;
            }
        }
        handled
    }

    pub fn waiter_count(&self, id: SyncptId) -> usize {
        self.lists[id as usize].lock().len()
    }

    /// Thresholds of the pending waiters on `id`, in list order.
    pub fn thresholds(&self, id: SyncptId) -> Vec<u32> {
        self.lists[id as usize]
            .lock()
            .iter()
            .map(|w| w.thresh())
            .collect()
    }

    /// Mask every threshold interrupt before power-down.
    pub fn suspend(&self) {
        for id in 0..self.syncpt.num_syncpts() {
            if !self.lists[id as usize].lock().is_empty() {
                self.hw.disable_syncpt_intr(id);
            }
        }
    }

    /// Reprogram every non-empty wait list after power-up.
    pub fn resume(&self) {
        for id in 0..self.syncpt.num_syncpts() {
            let list = self.lists[id as usize].lock();
            if !list.is_empty() {
                self.reprogram(id, &list);
            }
        }
    }

    pub fn dump(&self, level: log::Level) {
        for id in 0..self.syncpt.num_syncpts() {
            let list = self.lists[id as usize].lock();
            if list.is_empty() {
                continue;
            }
            let thresholds: Vec<u32> = list.iter().map(|w| w.thresh()).collect();
            log::log!(level, "intr: syncpt {} waiters {:?}", id, thresholds);
        }
    }
}

impl Drop for Intr {
    fn drop(&mut self) {
        if *self.irq_requested.get_mut() {
            self.hw.free_irq();
        }
    }
}

// ── IrqThread ───────────────────────────────────────────────────────────

/// Worker that waits on the interrupt line and runs the ISR.
pub struct IrqThread {
    stop: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IrqThread {
    pub fn spawn(intr: Arc<Intr>, period: Duration) -> NvResult<Self> {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("nvhost-irq".into())
            .spawn(move || {
                log::debug!("intr: irq thread started");
                while !thread_stop.load(Ordering::Acquire) {
                    if intr.hw.wait_irq(period) {
                        intr.isr();
                    }
                }
                log::debug!("intr: irq thread stopped");
            })
            .map_err(|source| Error::Spawn {
                name: "nvhost-irq".into(),
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

impl Drop for IrqThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
