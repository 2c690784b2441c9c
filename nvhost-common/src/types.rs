// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Sync point index.
pub type SyncptId = u32;

/// Channel index (also the bit position in the command processor stop mask).
pub type ChannelId = u32;

/// 32-bit bus address as seen by the host1x DMA engine.
pub type PhysAddr = u32;

/// Sentinel for "no sync point".
pub const SYNCPT_INVALID: SyncptId = u32::MAX;

/// Bytes per command word.
pub const WORD_BYTES: u32 = 4;

/// Command words per push buffer slot (one opcode pair).
pub const SLOT_WORDS: u32 = 2;

/// Bytes per push buffer slot.
pub const SLOT_BYTES: u32 = SLOT_WORDS * WORD_BYTES;

/// Sync point interrupt status is reported in banks of 32 ids.
pub const SYNCPTS_PER_BANK: u32 = 32;

/// Number of status banks needed to cover `num_syncpts` sync points.
#[inline]
pub const fn intr_banks(num_syncpts: u32) -> u32 {
    num_syncpts.div_ceil(SYNCPTS_PER_BANK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intr_banks() {
        assert_eq!(intr_banks(1), 1);
        assert_eq!(intr_banks(32), 1);
        assert_eq!(intr_banks(33), 2);
        assert_eq!(intr_banks(192), 6);
    }

    #[test]
    fn test_slot_geometry() {
        assert_eq!(SLOT_BYTES, 8);
    }
}
