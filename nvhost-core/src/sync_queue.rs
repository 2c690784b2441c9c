// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sync queue: FIFO of submitted batches and the resources they hold.
//!
//! Entries live in a `VecDeque`, but space is still accounted as a ring of
//! `size` words so back-pressure matches a fixed-size record buffer: an
//! entry takes a header of [`HEADER_WORDS`] plus [`HANDLE_WORDS`] per handle.
//!
//! With `MIN = HEADER_WORDS + HANDLE_WORDS` the cursors always stay in
//! `[0, size - MIN]`: whenever an advance leaves less than `MIN` words before
//! the end, the cursor wraps to 0. The writer may use every word up to the
//! end of the buffer unless the reader is ahead of it, and never the word
//! just before the reader. When the reader sits at 0 the writer must also
//! leave `MIN` words unused at the end, otherwise its own wrap would land on
//! the reader and make a full queue look empty. Under those rules an enqueue
//! that respects [`SyncQueue::space`] never moves the write cursor onto the
//! read cursor.

use std::collections::VecDeque;
use std::sync::Arc;

use nvhost_common::{PhysAddr, SyncptId, SYNCPT_INVALID};

use crate::mem::{MemClient, MemHandle};
use crate::timeout::TimeoutContext;

pub const HEADER_WORDS: u32 = 8;
pub const HANDLE_WORDS: u32 = 1;
pub const MIN_ENTRY_WORDS: u32 = HEADER_WORDS + HANDLE_WORDS;

/// Leading hardware-context save of a batch: the slots it occupies and the
/// sync point increments it performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxSaveSlots {
    /// Slots of abandoned submissions in front of the save.
    pub lead: u32,
    pub slots: u32,
    pub incrs: u32,
}

/// One submitted batch, or one chunk of a batch whose handles did not fit
/// in a single entry. Only the first chunk carries push buffer slots.
pub struct SyncQueueEntry {
    pub syncpt_id: SyncptId,
    pub syncpt_val: u32,
    /// PUT when the batch began.
    pub first_get: PhysAddr,
    /// Copied from the context at submission; zeroed once replayed.
    pub timeout_ms: u32,
    pub timeout: Arc<TimeoutContext>,
    pub nr_slots: u32,
    pub client: Arc<dyn MemClient>,
    pub handles: Vec<Arc<MemHandle>>,
    pub ctxsave: Option<CtxSaveSlots>,
    offset: u32,
}

impl SyncQueueEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        syncpt_id: SyncptId,
        syncpt_val: u32,
        first_get: PhysAddr,
        timeout: Arc<TimeoutContext>,
        nr_slots: u32,
        client: Arc<dyn MemClient>,
        handles: Vec<Arc<MemHandle>>,
        ctxsave: Option<CtxSaveSlots>,
    ) -> Self {
        Self {
            syncpt_id,
            syncpt_val,
            first_get,
            timeout_ms: timeout.timeout_ms(),
            timeout,
            nr_slots,
            client,
            handles,
            ctxsave,
            offset: 0,
        }
    }

    /// Words occupied in the ring.
    pub fn words(&self) -> u32 {
        HEADER_WORDS + HANDLE_WORDS * self.handles.len() as u32
    }

    /// Ring offset, for dumps.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn dump(&self, level: log::Level) {
        log::log!(
            level,
            "sync_queue: index 0x{:X} syncpt {} val {} first_get 0x{:08X} timeout {} slots {} handles {}{}",
            self.offset,
            self.syncpt_id,
            self.syncpt_val,
            self.first_get,
            self.timeout_ms,
            self.nr_slots,
            self.handles.len(),
            match self.ctxsave {
                Some(save) => format!(" ctxsave {}+{}/{}", save.lead, save.slots, save.incrs),
                None => String::new(),
            }
        );
    }
}

pub struct SyncQueue {
    size: u32,
    read: u32,
    write: u32,
    entries: VecDeque<SyncQueueEntry>,
}

impl SyncQueue {
    pub fn new(size: u32) -> Self {
        assert!(
            size >= 2 * MIN_ENTRY_WORDS,
            "sync_queue: size {size} below two minimum entries"
        );
        Self {
            size,
            read: 0,
            write: 0,
            entries: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        assert!(self.entries.is_empty(), "sync_queue: reset while not empty");
        self.read = 0;
        self.write = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn read_cursor(&self) -> u32 {
        self.read
    }

    pub fn write_cursor(&self) -> u32 {
        self.write
    }

    fn check_cursors(&self) {
        let limit = self.size - MIN_ENTRY_WORDS;
        if self.read > limit || self.write > limit {
            self.dump(log::Level::Error);
            panic!(
                "sync_queue: cursor beyond wrap point (read 0x{:X} write 0x{:X})",
                self.read, self.write
            );
        }
    }

    /// Handles that can be queued in one entry without waiting. 0 if not
    /// even a minimum entry fits.
    pub fn space(&self) -> u32 {
        self.check_cursors();
        let free = if self.read > self.write {
            self.read - 1 - self.write
        } else if self.read == 0 {
            self.size - self.write - MIN_ENTRY_WORDS
        } else {
            self.size - self.write
        };
        if free < MIN_ENTRY_WORDS {
            return 0;
        }
        (free - HEADER_WORDS) / HANDLE_WORDS
    }

    /// [`space`](Self::space) clamped to `n_handles`.
    pub fn space_for(&self, n_handles: u32) -> u32 {
        self.space().min(n_handles)
    }

    /// Append an entry. The caller must have waited for enough space.
    pub fn enqueue(&mut self, mut entry: SyncQueueEntry) {
        let n = entry.handles.len() as u32;
        if entry.syncpt_id == SYNCPT_INVALID || self.space() == 0 || self.space() < n {
            self.dump(log::Level::Error);
            panic!(
                "sync_queue: enqueue of {} handles with space {} (syncpt {})",
                n,
                self.space(),
                entry.syncpt_id
            );
        }
        entry.offset = self.write;
        let mut write = self.write + entry.words();
        debug_assert!(write <= self.size);
        if write + MIN_ENTRY_WORDS > self.size {
            // Wrapping onto a reader at 0 would empty a non-empty queue.
            if self.read == 0 {
                self.dump(log::Level::Error);
                panic!("sync_queue: write wrapped onto read cursor 0");
            }
            write = 0;
        }
        self.write = write;
        self.entries.push_back(entry);
    }

    /// Oldest entry, or `None` if the queue is empty.
    pub fn head(&self) -> Option<&SyncQueueEntry> {
        self.check_cursors();
        if self.is_empty() {
            debug_assert!(self.entries.is_empty());
            return None;
        }
        self.entries.front()
    }

    /// Remove the oldest entry. The caller releases its resources.
    pub fn dequeue_head(&mut self) -> SyncQueueEntry {
        let Some(entry) = self.entries.pop_front() else {
            panic!("sync_queue: dequeue from empty queue");
        };
        let mut read = self.read + entry.words();
        debug_assert!(read <= self.size);
        if read + MIN_ENTRY_WORDS > self.size {
            read = 0;
        }
        self.read = read;
        entry
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncQueueEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SyncQueueEntry> {
        self.entries.iter_mut()
    }

    pub fn dump(&self, level: log::Level) {
        log::log!(
            level,
            "sync_queue: size {} read 0x{:X} write 0x{:X} entries {}",
            self.size,
            self.read,
            self.write,
            self.entries.len()
        );
        for entry in &self.entries {
            entry.dump(level);
        }
    }
}
