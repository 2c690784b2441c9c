// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Submission timeouts: the per-context descriptor and the watchdog timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use nvhost_common::{Error, NvResult};
use parking_lot::{Condvar, Mutex};

/// Timeout state shared by every submission of one context.
#[derive(Debug, Default)]
pub struct TimeoutContext {
    timeout_ms: u32,
    has_timed_out: AtomicBool,
}

impl TimeoutContext {
    /// `timeout_ms == 0` disables the watchdog for this context.
    pub fn new(timeout_ms: u32) -> Arc<Self> {
        Arc::new(Self {
            timeout_ms,
            has_timed_out: AtomicBool::new(false),
        })
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    /// Sticky once set.
    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out.load(Ordering::Acquire)
    }

    pub(crate) fn mark_timed_out(&self) {
        self.has_timed_out.store(true, Ordering::Release);
    }
}

// ── DeadlineTimer ───────────────────────────────────────────────────────

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    generation: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// One-shot timer running its callback on a dedicated worker thread.
///
/// Every `schedule` returns a new generation number which is passed to the
/// callback, so a callback racing with a reschedule can tell whether it is
/// still current.
pub struct DeadlineTimer {
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl DeadlineTimer {
    pub fn new<F>(name: &str, callback: F) -> NvResult<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&thread_shared, callback))
            .map_err(|source| Error::Spawn {
                name: name.to_string(),
                source,
            })?;
        let worker_id = worker.thread().id();
        Ok(Self {
            shared,
            worker: Some(worker),
            worker_id,
        })
    }

    /// Arm (or re-arm) the timer to fire after `delay`.
    pub fn schedule(&self, delay: Duration) -> u64 {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        state.deadline = Some(Instant::now() + delay);
        self.shared.cond.notify_one();
        state.generation
    }

    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        state.deadline = None;
        self.shared.cond.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }
}

fn run<F: Fn(u64)>(shared: &TimerShared, callback: F) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        match state.deadline {
            None => shared.cond.wait(&mut state),
            Some(deadline) if Instant::now() >= deadline => {
                state.deadline = None;
                let generation = state.generation;
                parking_lot::MutexGuard::unlocked(&mut state, || callback(generation));
            }
            Some(deadline) => {
                shared.cond.wait_until(&mut state, deadline);
            }
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_one();
        if let Some(worker) = self.worker.take() {
            // The last owner may be the callback itself.
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}
