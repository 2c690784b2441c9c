// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Builder for client command buffers.

use nvhost_common::SyncptId;
use nvhost_core::opcodes::{self, CLASS_HOST1X, METHOD_INCR_SYNCPT, METHOD_WAIT_SYNCPT};

/// Host class method that copies its data word to the channel read FIFO.
/// Simulator only.
pub const METHOD_ECHO: u32 = 0x3F;

#[derive(Debug, Clone, Default)]
pub struct CmdBuf {
    words: Vec<u32>,
    incrs: Vec<(SyncptId, u32)>,
}

impl CmdBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setclass(mut self, class_id: u32) -> Self {
        self.words.push(opcodes::setclass(class_id, 0, 0));
        self
    }

    /// Increment `id` once the unit is done with the preceding work.
    pub fn incr_syncpt(mut self, id: SyncptId) -> Self {
        self.words.push(opcodes::nonincr(METHOD_INCR_SYNCPT, 1));
        self.words.push(opcodes::incr_syncpt(opcodes::COND_OP_DONE, id));
        match self.incrs.iter_mut().find(|(sp, _)| *sp == id) {
            Some((_, n)) => *n += 1,
            None => self.incrs.push((id, 1)),
        }
        self
    }

    /// Block the channel until `id` reaches `thresh`. Switches to the host
    /// class.
    pub fn wait_syncpt(mut self, id: SyncptId, thresh: u32) -> Self {
        self.words.push(opcodes::setclass(CLASS_HOST1X, 0, 0));
        self.words.push(opcodes::nonincr(METHOD_WAIT_SYNCPT, 1));
        self.words.push(opcodes::wait_syncpt(id, thresh));
        self
    }

    /// Push `values` to the read FIFO. Switches to the host class.
    pub fn echo(mut self, values: &[u32]) -> Self {
        self.words.push(opcodes::setclass(CLASS_HOST1X, 0, 0));
        self.words
            .push(opcodes::nonincr(METHOD_ECHO, values.len() as u32));
        self.words.extend_from_slice(values);
        self
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Increments this buffer performs on `id`.
    pub fn incrs(&self, id: SyncptId) -> u32 {
        self.incrs
            .iter()
            .find(|(sp, _)| *sp == id)
            .map_or(0, |(_, n)| *n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvhost_core::opcodes::Opcode;

    #[test]
    fn test_counts_increments_per_syncpt() {
        let buf = CmdBuf::new()
            .setclass(0x60)
            .incr_syncpt(22)
            .incr_syncpt(6)
            .incr_syncpt(22);
        assert_eq!(buf.incrs(22), 2);
        assert_eq!(buf.incrs(6), 1);
        assert_eq!(buf.incrs(5), 0);
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn test_wait_encoding() {
        let buf = CmdBuf::new().wait_syncpt(5, 3);
        assert_eq!(
            Opcode::decode(buf.words()[1]),
            Opcode::NonIncr {
                offset: METHOD_WAIT_SYNCPT,
                count: 1
            }
        );
        assert_eq!(buf.words()[2], opcodes::wait_syncpt(5, 3));
    }
}
