// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Register-level interface to a host1x block.
//!
//! The engine never touches registers directly; every access goes through
//! [`Host1xHw`] so the same scheduling code can drive real hardware, the
//! software simulator or a test fake.

use std::time::Duration;

use bitflags::bitflags;
use nvhost_common::{ChannelId, HwError, PhysAddr, SyncptId};

bitflags! {
    /// Channel DMA control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaCtrl: u32 {
        /// Halt fetching.
        const STOP = 1 << 0;
        /// Reset the GET pointer.
        const GET_RESET = 1 << 1;
        /// Load GET from PUT on reset.
        const INIT_GET = 1 << 2;
    }
}

pub trait Host1xHw: Send + Sync {
    // ── Sync points ─────────────────────────────────────────────────────

    fn syncpt_read(&self, id: SyncptId) -> u32;
    fn syncpt_write(&self, id: SyncptId, value: u32);
    /// Increment the live counter by one from the CPU side.
    fn syncpt_cpu_incr(&self, id: SyncptId);

    fn wait_base_read(&self, base: u32) -> u32;
    fn wait_base_write(&self, base: u32, value: u32);

    /// Try to take hardware mutex `idx`. Returns `false` if it is held.
    fn mlock_try(&self, idx: u32) -> bool;
    fn mlock_release(&self, idx: u32);

    // ── Sync point interrupts ───────────────────────────────────────────

    /// Claim the interrupt line shared by all sync point thresholds.
    fn request_irq(&self) -> Result<(), HwError>;
    fn free_irq(&self);

    fn set_syncpt_threshold(&self, id: SyncptId, thresh: u32);
    fn enable_syncpt_intr(&self, id: SyncptId);
    fn disable_syncpt_intr(&self, id: SyncptId);
    fn ack_syncpt_intr(&self, id: SyncptId);
    /// Pending threshold interrupts for ids `bank * 32 .. bank * 32 + 31`.
    fn syncpt_intr_status(&self, bank: u32) -> u32;

    /// Block until an interrupt may be pending or `timeout` elapses.
    fn wait_irq(&self, timeout: Duration) -> bool;

    // ── Channel DMA ─────────────────────────────────────────────────────

    fn dma_setup(&self, ch: ChannelId, start: PhysAddr, end: PhysAddr);
    fn dma_ctrl(&self, ch: ChannelId, ctrl: DmaCtrl);
    fn dma_set_put(&self, ch: ChannelId, put: PhysAddr);
    fn dma_get(&self, ch: ChannelId) -> PhysAddr;

    /// Command processor stop mask, one bit per channel.
    fn cmdproc_stop(&self) -> u32;
    fn set_cmdproc_stop(&self, mask: u32);

    /// Reset the hardware unit behind a channel.
    fn reset_module(&self, ch: ChannelId);

    // ── Read FIFO ───────────────────────────────────────────────────────

    /// Words currently available in the channel's output FIFO.
    fn fifo_entries(&self, ch: ChannelId) -> usize;
    fn fifo_read(&self, ch: ChannelId) -> u32;
}
