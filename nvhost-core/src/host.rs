// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The host: owner of the sync point table, the interrupt dispatcher and
//! every channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nvhost_common::settings::HostConfig;
use nvhost_common::{ChannelId, Error, NvResult, SyncptId};

use crate::channel::Channel;
use crate::hw::Host1xHw;
use crate::intr::{Action, Intr, WaitEvent, WaitStatus, Waiter};
use crate::mem::MemClient;
use crate::syncpt::SyncptTable;

pub struct Host {
    config: Arc<HostConfig>,
    hw: Arc<dyn Host1xHw>,
    mem: Arc<dyn MemClient>,
    syncpt: Arc<SyncptTable>,
    intr: Arc<Intr>,
    channels: Vec<Arc<Channel>>,
}

impl Host {
    pub fn new(
        config: HostConfig,
        hw: Arc<dyn Host1xHw>,
        mem: Arc<dyn MemClient>,
    ) -> NvResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let syncpt = Arc::new(SyncptTable::new(&config, hw.clone()));
        let intr = Arc::new(Intr::new(hw.clone(), syncpt.clone()));
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(id, desc)| {
                Channel::new(
                    id as ChannelId,
                    desc.clone(),
                    config.clone(),
                    hw.clone(),
                    syncpt.clone(),
                    intr.clone(),
                    mem.clone(),
                )
            })
            .collect();
        log::info!(
            "host: {} sync points, {} channels",
            config.num_syncpts,
            config.channels.len()
        );
        Ok(Arc::new(Self {
            config,
            hw,
            mem,
            syncpt,
            intr,
            channels,
        }))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn hw(&self) -> &Arc<dyn Host1xHw> {
        &self.hw
    }

    /// Memory client of the host itself.
    pub fn mem(&self) -> &Arc<dyn MemClient> {
        &self.mem
    }

    pub fn syncpt(&self) -> &Arc<SyncptTable> {
        &self.syncpt
    }

    pub fn intr(&self) -> &Arc<Intr> {
        &self.intr
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn channel(&self, id: ChannelId) -> NvResult<&Arc<Channel>> {
        self.channels
            .get(id as usize)
            .ok_or(Error::InvalidChannel(id))
    }

    /// Look a channel up by unit name.
    pub fn channel_by_name(&self, name: &str) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|c| c.desc().name == name)
    }

    // ── Sync points ─────────────────────────────────────────────────────

    pub fn read_syncpt(&self, id: SyncptId) -> NvResult<u32> {
        self.syncpt.check(id)?;
        Ok(self.syncpt.update_min(id))
    }

    pub fn incr_syncpt(&self, id: SyncptId) -> NvResult<()> {
        self.syncpt.check(id)?;
        self.syncpt.incr(id);
        Ok(())
    }

    pub fn mutex_lock(&self, idx: u32) -> NvResult<()> {
        if idx >= self.syncpt.num_mlocks() {
            return Err(Error::InvalidConfig(format!("no hardware mutex {idx}")));
        }
        self.syncpt.mutex_try_lock(idx)
    }

    pub fn mutex_unlock(&self, idx: u32) -> NvResult<()> {
        if idx >= self.syncpt.num_mlocks() {
            return Err(Error::InvalidConfig(format!("no hardware mutex {idx}")));
        }
        self.syncpt.mutex_unlock(idx);
        Ok(())
    }

    /// Wait until sync point `id` reaches `thresh`. `None` waits forever,
    /// `Some(Duration::ZERO)` only polls.
    pub fn wait_syncpt(&self, id: SyncptId, thresh: u32, timeout: Option<Duration>) -> NvResult<u32> {
        self.wait_inner(id, thresh, timeout, None)
    }

    /// Like [`wait_syncpt`](Self::wait_syncpt), but `event.interrupt()`
    /// ends the wait with [`Error::Interrupted`].
    pub fn wait_syncpt_interruptible(
        &self,
        id: SyncptId,
        thresh: u32,
        timeout: Option<Duration>,
        event: Arc<WaitEvent>,
    ) -> NvResult<u32> {
        self.wait_inner(id, thresh, timeout, Some(event))
    }

    fn wait_inner(
        &self,
        id: SyncptId,
        thresh: u32,
        timeout: Option<Duration>,
        event: Option<Arc<WaitEvent>>,
    ) -> NvResult<u32> {
        self.syncpt.check(id)?;
        if self.syncpt.update_min_is_expired(id, thresh) {
            return Ok(self.syncpt.read_min(id));
        }
        if timeout == Some(Duration::ZERO) {
            return Err(Error::WaitTimeout {
                id,
                thresh,
                value: self.syncpt.read_min(id),
            });
        }

        let interruptible = event.is_some();
        let event = event.unwrap_or_else(WaitEvent::new);
        let action = if interruptible {
            Action::WakeupInterruptible(event.clone())
        } else {
            Action::Wakeup(event.clone())
        };
        let waiter = Waiter::new();
        self.intr.add_waiter(id, thresh, action, waiter.clone())?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let period = Duration::from_millis(self.config.syncpt_check_period_ms);
        let mut stuck = 0u32;
        let result = loop {
            let chunk = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(Error::WaitTimeout {
                            id,
                            thresh,
                            value: self.syncpt.update_min(id),
                        });
                    }
                    period.min(deadline - now)
                }
                None => period,
            };
            match event.wait(chunk, interruptible) {
                WaitStatus::Signaled => break Ok(self.syncpt.read_min(id)),
                WaitStatus::Interrupted => break Err(Error::Interrupted),
                WaitStatus::TimedOut => {}
            }
            if self.syncpt.update_min_is_expired(id, thresh) {
                break Ok(self.syncpt.read_min(id));
            }
            if chunk == period {
                stuck += 1;
                log::warn!(
                    "syncpt: wait on id {} for {} stuck (value {}, check {})",
                    id,
                    thresh,
                    self.syncpt.read_min(id),
                    stuck
                );
                if stuck == self.config.max_stuck_check_count {
                    self.debug_dump(log::Level::Warn);
                }
            }
        };
        self.intr.cancel(&waiter);
        result
    }

    // ── Power management ────────────────────────────────────────────────

    /// Drain every open channel, then save sync point state and mask
    /// interrupts before the block loses power.
    pub fn suspend(&self, timeout: Duration) -> NvResult<()> {
        for channel in &self.channels {
            channel.flush(timeout)?;
        }
        self.syncpt.save();
        self.intr.suspend();
        log::info!("host: suspended");
        Ok(())
    }

    pub fn resume(&self) {
        self.syncpt.reset();
        self.intr.resume();
        log::info!("host: resumed");
    }

    pub fn debug_dump(&self, level: log::Level) {
        self.syncpt.dump(level);
        self.intr.dump(level);
        for channel in &self.channels {
            if let Some(cdma) = channel.cdma() {
                cdma.dump(level);
            }
        }
    }
}
