// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::Error;
use crate::types::{SyncptId, SLOT_BYTES};

/// One host1x channel: a command DMA engine feeding one hardware unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDesc {
    pub name: String,
    /// Sync point incremented by every submission on this channel.
    pub syncpt: SyncptId,
    /// Wait base re-based together with the sync point on timeout recovery.
    pub wait_base: Option<u32>,
    /// Host class id the unit answers to (used by `setclass`).
    pub class_id: u32,
}

impl ChannelDesc {
    pub fn new(name: &str, syncpt: SyncptId, wait_base: Option<u32>, class_id: u32) -> Self {
        Self {
            name: name.to_string(),
            syncpt,
            wait_base,
            class_id,
        }
    }
}

/// Engine configuration, built once at host initialization and shared
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct HostConfig {
    // Hardware geometry
    pub num_syncpts: u32,
    pub num_wait_bases: u32,
    pub num_mlocks: u32,
    /// Sync points driven by an external owner (e.g. vblank counters).
    pub client_managed: Vec<SyncptId>,
    pub channels: Vec<ChannelDesc>,

    // Ring sizes
    /// Push buffer size in bytes. Must be a power of two.
    pub push_buffer_size: u32,
    /// Sync queue size in 32-bit words.
    pub sync_queue_words: u32,
    /// Sync point increments carried by one replay GATHER.
    pub replay_incrs_per_slot: u32,

    // Waits
    pub syncpt_check_period_ms: u64,
    pub max_stuck_check_count: u32,

    // Read FIFO
    pub fifo_poll_interval_us: u64,
    pub fifo_drain_timeout_ms: u64,

    // Interrupt thread
    pub irq_poll_period_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            num_syncpts: 32,
            num_wait_bases: 8,
            num_mlocks: 16,
            client_managed: vec![26, 27],
            channels: vec![
                ChannelDesc::new("display", 11, None, 0x70),
                ChannelDesc::new("gr3d", 22, Some(1), 0x60),
                ChannelDesc::new("gr2d", 18, Some(0), 0x51),
                ChannelDesc::new("mpe", 19, Some(3), 0x20),
            ],
            push_buffer_size: 512 * SLOT_BYTES,
            sync_queue_words: 8192,
            replay_incrs_per_slot: 256,
            syncpt_check_period_ms: 2000,
            max_stuck_check_count: 15,
            fifo_poll_interval_us: 10,
            fifo_drain_timeout_ms: 100,
            irq_poll_period_ms: 10,
        }
    }
}

impl HostConfig {
    /// Number of opcode-pair slots in the push buffer.
    pub fn push_buffer_slots(&self) -> u32 {
        self.push_buffer_size / SLOT_BYTES
    }

    pub fn is_client_managed(&self, id: SyncptId) -> bool {
        self.client_managed.contains(&id)
    }

    /// Check the geometry for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_syncpts == 0 {
            return Err(Error::InvalidConfig("no sync points".into()));
        }
        if !self.push_buffer_size.is_power_of_two() || self.push_buffer_size < 2 * SLOT_BYTES {
            return Err(Error::InvalidConfig(format!(
                "push buffer size {} is not a power of two of at least two slots",
                self.push_buffer_size
            )));
        }
        // Room for a header plus one handle at either side of a wrap.
        if self.sync_queue_words < 64 {
            return Err(Error::InvalidConfig(format!(
                "sync queue of {} words is too small",
                self.sync_queue_words
            )));
        }
        if self.replay_incrs_per_slot == 0 {
            return Err(Error::InvalidConfig("replay buffer holds no increments".into()));
        }
        for &id in &self.client_managed {
            if id >= self.num_syncpts {
                return Err(Error::InvalidConfig(format!(
                    "client managed sync point {id} out of range"
                )));
            }
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if ch.syncpt >= self.num_syncpts {
                return Err(Error::InvalidConfig(format!(
                    "channel {i} ({}) uses sync point {} out of range",
                    ch.name, ch.syncpt
                )));
            }
            if self.is_client_managed(ch.syncpt) {
                return Err(Error::InvalidConfig(format!(
                    "channel {i} ({}) uses client managed sync point {}",
                    ch.name, ch.syncpt
                )));
            }
            if let Some(base) = ch.wait_base {
                if base >= self.num_wait_bases {
                    return Err(Error::InvalidConfig(format!(
                        "channel {i} ({}) uses wait base {base} out of range",
                        ch.name
                    )));
                }
            }
        }
        if self.channels.len() > 32 {
            return Err(Error::InvalidConfig("more than 32 channels".into()));
        }
        Ok(())
    }
}
