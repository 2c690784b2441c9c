// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command stream opcodes.
//!
//! ## Opcode word (32 bits)
//!
//! | Bits  | Field                               |
//! |-------|-------------------------------------|
//! | 31:28 | Opcode                              |
//! | 27:16 | Method offset                       |
//! | 15:0  | Count / mask / immediate / class    |
//!
//! `SETCLASS` carries the class id in bits 15:6 and a write mask in 5:0.
//! `GATHER` is followed by one word holding the bus address of the gathered
//! buffer; with bit 15 set the gathered words are data for a non-incrementing
//! write to the method in bits 27:16. `RESTART` jumps the fetch pointer to
//! `(word & 0x0FFF_FFFF) << 4`.

use nvhost_common::SyncptId;

pub const OP_SETCLASS: u32 = 0;
pub const OP_INCR: u32 = 1;
pub const OP_NONINCR: u32 = 2;
pub const OP_MASK: u32 = 3;
pub const OP_IMM: u32 = 4;
pub const OP_RESTART: u32 = 5;
pub const OP_GATHER: u32 = 6;

/// Host class: sync point waits and other channel-level methods.
pub const CLASS_HOST1X: u32 = 0x1;

/// Method 0 of every class increments a sync point.
pub const METHOD_INCR_SYNCPT: u32 = 0x0;
/// Host class method: stall until a sync point reaches a threshold.
pub const METHOD_WAIT_SYNCPT: u32 = 0x8;

/// Increment as soon as the method is executed.
pub const COND_IMMEDIATE: u32 = 0;
/// Increment when the unit has finished all prior work.
pub const COND_OP_DONE: u32 = 1;

const GATHER_INSERT: u32 = 1 << 15;

pub const fn setclass(class_id: u32, offset: u32, mask: u32) -> u32 {
    (OP_SETCLASS << 28) | ((offset & 0xFFF) << 16) | ((class_id & 0x3FF) << 6) | (mask & 0x3F)
}

pub const fn incr(offset: u32, count: u32) -> u32 {
    (OP_INCR << 28) | ((offset & 0xFFF) << 16) | (count & 0xFFFF)
}

pub const fn nonincr(offset: u32, count: u32) -> u32 {
    (OP_NONINCR << 28) | ((offset & 0xFFF) << 16) | (count & 0xFFFF)
}

pub const fn mask(offset: u32, mask: u32) -> u32 {
    (OP_MASK << 28) | ((offset & 0xFFF) << 16) | (mask & 0xFFFF)
}

pub const fn imm(offset: u32, value: u32) -> u32 {
    (OP_IMM << 28) | ((offset & 0xFFF) << 16) | (value & 0xFFFF)
}

/// `addr` must be 16-byte aligned.
pub const fn restart(addr: u32) -> u32 {
    (OP_RESTART << 28) | (addr >> 4)
}

pub const fn gather(count: u32) -> u32 {
    (OP_GATHER << 28) | (count & 0x7FFF)
}

/// Gather `count` words as data for non-incrementing writes to `offset`.
pub const fn gather_nonincr(offset: u32, count: u32) -> u32 {
    (OP_GATHER << 28) | ((offset & 0xFFF) << 16) | GATHER_INSERT | (count & 0x7FFF)
}

pub const NOOP: u32 = nonincr(0, 0);

/// Data word for [`METHOD_INCR_SYNCPT`].
pub const fn incr_syncpt(cond: u32, id: SyncptId) -> u32 {
    ((cond & 0xFF) << 8) | (id & 0xFF)
}

/// Data word for [`METHOD_WAIT_SYNCPT`]. Thresholds compare on 24 bits.
pub const fn wait_syncpt(id: SyncptId, thresh: u32) -> u32 {
    ((id & 0xFF) << 24) | (thresh & 0x00FF_FFFF)
}

/// A decoded opcode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    SetClass { class_id: u32, offset: u32, mask: u32 },
    Incr { offset: u32, count: u32 },
    NonIncr { offset: u32, count: u32 },
    Mask { offset: u32, mask: u32 },
    Imm { offset: u32, value: u32 },
    Restart { addr: u32 },
    Gather { count: u32, insert: Option<u32> },
    Unknown(u32),
}

impl Opcode {
    pub fn decode(word: u32) -> Self {
        let offset = (word >> 16) & 0xFFF;
        match word >> 28 {
            OP_SETCLASS => Self::SetClass {
                class_id: (word >> 6) & 0x3FF,
                offset,
                mask: word & 0x3F,
            },
            OP_INCR => Self::Incr {
                offset,
                count: word & 0xFFFF,
            },
            OP_NONINCR => Self::NonIncr {
                offset,
                count: word & 0xFFFF,
            },
            OP_MASK => Self::Mask {
                offset,
                mask: word & 0xFFFF,
            },
            OP_IMM => Self::Imm {
                offset,
                value: word & 0xFFFF,
            },
            OP_RESTART => Self::Restart {
                addr: (word & 0x0FFF_FFFF) << 4,
            },
            OP_GATHER => Self::Gather {
                count: word & 0x7FFF,
                insert: (word & GATHER_INSERT != 0).then_some(offset),
            },
            _ => Self::Unknown(word),
        }
    }
}
