// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel command fetcher.
//!
//! Executes one word per [`Fetcher::step`] so a channel can be stopped
//! between any two words. Words come from the push buffer at GET, or from
//! the gather in progress. A method write that cannot complete yet (an
//! unmet sync point wait) stalls the fetcher without consuming the word.
//!
//! | Opcode   | Data words                                   |
//! |----------|----------------------------------------------|
//! | SETCLASS | one per bit of `mask`                        |
//! | INCR     | `count`, to `offset`, `offset + 1`, ...      |
//! | NONINCR  | `count`, all to `offset`                     |
//! | MASK     | one per bit of `mask`                        |
//! | IMM      | none, value in the opcode                    |
//! | RESTART  | none, GET jumps                              |
//! | GATHER   | one: bus address of `count` words            |

use nvhost_common::{PhysAddr, WORD_BYTES};
use nvhost_core::opcodes::Opcode;

/// What the fetcher is connected to.
pub trait FetchBus {
    fn read_word(&self, addr: PhysAddr) -> Option<u32>;

    /// Write `value` to method `offset` of `class`. Returns `false` if the
    /// write has to be retried later.
    fn write_method(&mut self, class: u32, offset: u32, value: u32) -> bool;
}

/// Result of one [`Fetcher::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// One word executed.
    Executed,
    /// GET reached PUT and no gather is in progress.
    Idle,
    /// A method write is blocked.
    Stalled,
    /// Read from an address outside any allocation.
    Fault(PhysAddr),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Pending {
    #[default]
    None,
    Incr { offset: u32, count: u32 },
    NonIncr { offset: u32, count: u32 },
    Mask { offset: u32, mask: u32 },
    GatherAddr { count: u32, insert: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GatherCursor {
    addr: PhysAddr,
    remaining: u32,
    /// Method the gathered words are written to, if they are data.
    insert: Option<u32>,
}

enum Outcome {
    Consume,
    Stall,
    /// GET has been rewritten.
    Jump,
}

#[derive(Debug, Default)]
pub struct Fetcher {
    class: u32,
    pending: Pending,
    gather: Option<GatherCursor>,
    words: u64,
}

impl Fetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all decode state, as a module reset does.
    pub fn reset(&mut self) {
        *self = Self {
            words: self.words,
            ..Self::default()
        };
    }

    pub fn class(&self) -> u32 {
        self.class
    }

    /// Words executed since creation.
    pub fn words_executed(&self) -> u64 {
        self.words
    }

    pub fn in_gather(&self) -> bool {
        self.gather.is_some()
    }

    pub fn step(&mut self, get: &mut PhysAddr, put: PhysAddr, bus: &mut dyn FetchBus) -> Step {
        let (addr, from_gather) = match self.gather {
            Some(g) => (g.addr, true),
            None if *get == put => return Step::Idle,
            None => (*get, false),
        };
        let Some(word) = bus.read_word(addr) else {
            log::warn!("fetch: fault at 0x{:08X}", addr);
            return Step::Fault(addr);
        };

        let outcome = match self.gather {
            Some(GatherCursor {
                insert: Some(method),
                ..
            }) => {
                if bus.write_method(self.class, method, word) {
                    Outcome::Consume
                } else {
                    Outcome::Stall
                }
            }
            _ => self.exec(word, from_gather, get, bus),
        };

        match outcome {
            Outcome::Stall => return Step::Stalled,
            Outcome::Jump => {}
            Outcome::Consume if from_gather => {
                if let Some(g) = &mut self.gather {
                    g.addr += WORD_BYTES;
                    g.remaining -= 1;
                    if g.remaining == 0 {
                        self.gather = None;
                    }
                }
            }
            Outcome::Consume => *get += WORD_BYTES,
        }
        self.words += 1;
        Step::Executed
    }

    fn write(&mut self, offset: u32, value: u32, bus: &mut dyn FetchBus) -> bool {
        bus.write_method(self.class, offset, value)
    }

    fn exec(
        &mut self,
        word: u32,
        from_gather: bool,
        get: &mut PhysAddr,
        bus: &mut dyn FetchBus,
    ) -> Outcome {
        match self.pending {
            Pending::Incr { offset, count } => {
                if !self.write(offset, word, bus) {
                    return Outcome::Stall;
                }
                self.pending = if count > 1 {
                    Pending::Incr {
                        offset: offset + 1,
                        count: count - 1,
                    }
                } else {
                    Pending::None
                };
                Outcome::Consume
            }
            Pending::NonIncr { offset, count } => {
                if !self.write(offset, word, bus) {
                    return Outcome::Stall;
                }
                self.pending = if count > 1 {
                    Pending::NonIncr {
                        offset,
                        count: count - 1,
                    }
                } else {
                    Pending::None
                };
                Outcome::Consume
            }
            Pending::Mask { offset, mask } => {
                let bit = mask.trailing_zeros();
                if !self.write(offset + bit, word, bus) {
                    return Outcome::Stall;
                }
                let rest = mask & (mask - 1);
                self.pending = if rest != 0 {
                    Pending::Mask { offset, mask: rest }
                } else {
                    Pending::None
                };
                Outcome::Consume
            }
            Pending::GatherAddr { count, insert } => {
                self.pending = Pending::None;
                if count > 0 {
                    self.gather = Some(GatherCursor {
                        addr: word,
                        remaining: count,
                        insert,
                    });
                }
                Outcome::Consume
            }
            Pending::None => self.exec_opcode(word, from_gather, get, bus),
        }
    }

    fn exec_opcode(
        &mut self,
        word: u32,
        from_gather: bool,
        get: &mut PhysAddr,
        bus: &mut dyn FetchBus,
    ) -> Outcome {
        match Opcode::decode(word) {
            Opcode::SetClass {
                class_id,
                offset,
                mask,
            } => {
                self.class = class_id;
                if mask != 0 {
                    self.pending = Pending::Mask { offset, mask };
                }
            }
            Opcode::Incr { offset, count } if count > 0 => {
                self.pending = Pending::Incr { offset, count };
            }
            Opcode::NonIncr { offset, count } if count > 0 => {
                self.pending = Pending::NonIncr { offset, count };
            }
            Opcode::Incr { .. } | Opcode::NonIncr { .. } => {}
            Opcode::Mask { offset, mask } if mask != 0 => {
                self.pending = Pending::Mask { offset, mask };
            }
            Opcode::Mask { .. } => {}
            Opcode::Imm { offset, value } => {
                if !self.write(offset, value, bus) {
                    return Outcome::Stall;
                }
            }
            Opcode::Restart { addr } => {
                if from_gather {
                    log::warn!("fetch: RESTART inside a gather ignored");
                } else {
                    log::trace!("fetch: restart to 0x{:08X}", addr);
                    *get = addr;
                    return Outcome::Jump;
                }
            }
            Opcode::Gather { count, insert } => {
                if from_gather {
                    log::warn!("fetch: nested GATHER ignored");
                } else {
                    self.pending = Pending::GatherAddr { count, insert };
                }
            }
            Opcode::Unknown(word) => {
                log::warn!("fetch: unknown opcode 0x{:08X}", word);
            }
        }
        Outcome::Consume
    }
}
