// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Push buffer: the ring of opcode pairs the channel DMA engine fetches.
//!
//! Offsets are in bytes. `cur` is where the next slot is written and
//! `fence` is the last slot known to have been consumed. `cur == fence`
//! means full, so one slot is always held back and a ring of N slots holds
//! at most N - 1 pending ones. A RESTART opcode in the word after the ring
//! jumps the fetcher back to the base.

use std::sync::{Arc, Weak};

use nvhost_common::{NvResult, PhysAddr, SLOT_BYTES, WORD_BYTES};

use crate::mem::{MemClient, MemHandle};
use crate::opcodes;

/// Who produced a push buffer slot. Diagnostic only: the owning handle
/// reference is held by the sync queue entry.
#[derive(Clone, Default)]
pub enum SlotOwner {
    /// Never written, or written by the engine itself.
    #[default]
    None,
    /// A GATHER of a client buffer.
    Gather {
        client: Weak<dyn MemClient>,
        handle: Weak<MemHandle>,
    },
    /// Consumed and popped.
    Freed,
}

pub struct PushBuffer {
    mem: Arc<MemHandle>,
    phys: PhysAddr,
    size: u32,
    fence: u32,
    cur: u32,
    owners: Vec<SlotOwner>,
}

impl PushBuffer {
    /// Allocate and pin a ring of `size` bytes from `client`.
    pub fn new(client: &dyn MemClient, size: u32) -> NvResult<Self> {
        assert!(
            size.is_power_of_two() && size >= 2 * SLOT_BYTES,
            "push_buffer: bad size {size}"
        );
        let words = (size / WORD_BYTES) as usize;
        let mem = client.alloc(words + 1)?;
        let phys = client.pin(&mem)?;
        mem.write(words, opcodes::restart(phys));
        log::debug!(
            "push_buffer: {} slots at 0x{:08X}",
            size / SLOT_BYTES,
            phys
        );
        Ok(Self {
            mem,
            phys,
            size,
            fence: size - SLOT_BYTES,
            cur: 0,
            owners: vec![SlotOwner::None; (size / SLOT_BYTES) as usize],
        })
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// One past the RESTART word.
    pub fn end(&self) -> PhysAddr {
        self.phys + self.size + WORD_BYTES
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn capacity(&self) -> u32 {
        self.size / SLOT_BYTES
    }

    /// Free slots.
    pub fn space(&self) -> u32 {
        (self.fence.wrapping_sub(self.cur) & (self.size - 1)) / SLOT_BYTES
    }

    /// Write one slot at `cur`. The caller must have seen `space() > 0`.
    pub fn push(&mut self, owner: SlotOwner, op1: u32, op2: u32) {
        if self.cur == self.fence {
            self.dump(log::Level::Error);
            panic!("push_buffer: push into full buffer at 0x{:X}", self.cur);
        }
        self.write_words(self.cur, op1, op2);
        self.owners[(self.cur / SLOT_BYTES) as usize] = owner;
        self.cur = (self.cur + SLOT_BYTES) & (self.size - 1);
    }

    /// Release `slots` consumed slots.
    pub fn pop(&mut self, slots: u32) {
        for _ in 0..slots {
            self.fence = (self.fence + SLOT_BYTES) & (self.size - 1);
            self.owners[(self.fence / SLOT_BYTES) as usize] = SlotOwner::Freed;
        }
    }

    /// Hardware PUT value for the current write position.
    pub fn put_pointer(&self) -> PhysAddr {
        self.phys + self.cur
    }

    /// Byte offset of a bus address inside the ring.
    pub fn offset_of(&self, addr: PhysAddr) -> u32 {
        debug_assert!(addr >= self.phys && addr < self.phys + self.size);
        addr - self.phys
    }

    /// Offset of the slot after `offset`.
    pub fn next_offset(&self, offset: u32) -> u32 {
        (offset + SLOT_BYTES) & (self.size - 1)
    }

    /// Overwrite an already pushed slot. Used by timeout recovery.
    pub fn write_slot(&mut self, offset: u32, op1: u32, op2: u32) {
        self.write_words(offset, op1, op2);
    }

    /// Replace `slots` slots starting at bus address `start` with no-ops.
    pub fn nop_slots(&mut self, start: PhysAddr, slots: u32) {
        let mut offset = self.offset_of(start);
        for _ in 0..slots {
            self.write_words(offset, opcodes::NOOP, opcodes::NOOP);
            offset = self.next_offset(offset);
        }
    }

    pub fn read_slot(&self, offset: u32) -> (u32, u32) {
        let idx = (offset / WORD_BYTES) as usize;
        (self.mem.read(idx), self.mem.read(idx + 1))
    }

    pub fn slot_owner(&self, index: u32) -> &SlotOwner {
        &self.owners[index as usize]
    }

    fn write_words(&self, offset: u32, op1: u32, op2: u32) {
        let idx = (offset / WORD_BYTES) as usize;
        self.mem.write(idx, op1);
        self.mem.write(idx + 1, op2);
    }

    /// Unpin the ring. The buffer must not be used afterwards.
    pub fn destroy(&mut self, client: &dyn MemClient) {
        client.unpin(std::slice::from_ref(&self.mem));
        self.owners.iter_mut().for_each(|o| *o = SlotOwner::Freed);
    }

    pub fn dump(&self, level: log::Level) {
        log::log!(
            level,
            "push_buffer: phys 0x{:08X} size 0x{:X} fence 0x{:X} cur 0x{:X} space {}",
            self.phys,
            self.size,
            self.fence,
            self.cur,
            self.space()
        );
        // Pending slots run from the one after fence up to cur.
        let mut offset = self.next_offset(self.fence);
        while offset != self.cur {
            let (op1, op2) = self.read_slot(offset);
            let owner = match self.slot_owner(offset / SLOT_BYTES) {
                SlotOwner::Gather { client, handle } => format!(
                    " [{} handle {}]",
                    client.upgrade().map(|c| c.name().to_string()).unwrap_or_default(),
                    handle.upgrade().map(|h| h.id()).unwrap_or(0)
                ),
                SlotOwner::Freed => " [freed]".to_string(),
                SlotOwner::None => String::new(),
            };
            log::log!(level, "  0x{:04X}: {:08X} {:08X}{}", offset, op1, op2, owner);
            offset = self.next_offset(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeMem;

    fn ring(slots: u32) -> (Arc<FakeMem>, PushBuffer) {
        let mem = FakeMem::new();
        let pb = PushBuffer::new(&*mem, slots * SLOT_BYTES).unwrap();
        (mem, pb)
    }

    #[test]
    fn test_eight_slots_hold_seven() {
        let (_mem, mut pb) = ring(8);
        assert_eq!(pb.space(), 7);
        for i in 0..7 {
            pb.push(SlotOwner::None, i, i);
        }
        assert_eq!(pb.space(), 0);
        pb.pop(1);
        assert_eq!(pb.space(), 1);
    }

    #[test]
    #[should_panic(expected = "full buffer")]
    fn test_push_when_full_is_fatal() {
        let (_mem, mut pb) = ring(8);
        for i in 0..8 {
            pb.push(SlotOwner::None, i, i);
        }
    }

    #[test]
    fn test_space_accounting_over_wrap() {
        let (_mem, mut pb) = ring(8);
        let capacity = 7;
        let mut occupied = 0u32;
        // Deterministic mix of pushes and pops that wraps several times.
        for round in 0..40u32 {
            let pushes = (round * 3 + 1) % 5;
            for _ in 0..pushes.min(capacity - occupied) {
                pb.push(SlotOwner::None, round, 0);
                occupied += 1;
                assert_eq!(pb.space() + occupied, capacity);
            }
            let pops = (round * 7 + 2) % 4;
            let pops = pops.min(occupied);
            pb.pop(pops);
            occupied -= pops;
            assert_eq!(pb.space() + occupied, capacity);
        }
    }

    #[test]
    fn test_restart_word_and_put_pointer() {
        let (mem, mut pb) = ring(8);
        let phys = pb.phys();
        assert_eq!(pb.put_pointer(), phys);
        pb.push(SlotOwner::None, 1, 2);
        assert_eq!(pb.put_pointer(), phys + SLOT_BYTES);
        assert_eq!(pb.read_slot(0), (1, 2));
        assert_eq!(pb.end(), phys + 8 * SLOT_BYTES + WORD_BYTES);
        assert_eq!(mem.read_phys(phys + 8 * SLOT_BYTES), Some(opcodes::restart(phys)));
    }

    #[test]
    fn test_pop_marks_owner_freed() {
        let (mem, mut pb) = ring(8);
        let client: Arc<dyn MemClient> = mem.clone();
        let handle = mem.alloc(4).unwrap();
        pb.push(
            SlotOwner::Gather {
                client: Arc::downgrade(&client),
                handle: Arc::downgrade(&handle),
            },
            opcodes::gather(4),
            0,
        );
        assert!(matches!(pb.slot_owner(0), SlotOwner::Gather { .. }));
        pb.pop(1);
        assert!(matches!(pb.slot_owner(0), SlotOwner::Freed));
    }

    #[test]
    fn test_nop_slots_wraps() {
        let (_mem, mut pb) = ring(8);
        for i in 0..7 {
            pb.push(SlotOwner::None, 0x100 + i, 0x200 + i);
        }
        pb.pop(7);
        let start = pb.put_pointer();
        for i in 0..3 {
            pb.push(SlotOwner::None, 0x300 + i, 0);
        }
        pb.nop_slots(start, 3);
        let mut offset = pb.offset_of(start);
        for _ in 0..3 {
            assert_eq!(pb.read_slot(offset), (opcodes::NOOP, opcodes::NOOP));
            offset = pb.next_offset(offset);
        }
        assert_eq!(offset, pb.offset_of(pb.put_pointer()));
    }

    #[test]
    fn test_destroy_unpins() {
        let (mem, mut pb) = ring(8);
        assert_eq!(mem.pinned_handles(), 1);
        pb.destroy(&*mem);
        assert_eq!(mem.pinned_handles(), 0);
    }
}
