// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Counting semaphore.
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn up(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    pub fn down(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Returns `false` if `timeout` elapsed first.
    pub fn down_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                if *count == 0 {
                    return false;
                }
                break;
            }
        }
        *count -= 1;
        true
    }
}
