// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Memory handles and the pinning collaborator.
//!
//! A handle reference (`Arc<MemHandle>`) keeps the buffer alive. Pinning is
//! separate bookkeeping: a pinned handle is resident and has a bus address
//! the DMA engine may fetch from. The sync queue owns one reference per
//! in-flight handle and unpins it when the batch completes.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nvhost_common::{MemError, PhysAddr};

/// A buffer of 32-bit words shared between the CPU and the DMA engine.
pub struct MemHandle {
    id: u32,
    words: Box<[AtomicU32]>,
}

impl MemHandle {
    pub fn new(id: u32, len: usize) -> Self {
        Self {
            id,
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Length in words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn read(&self, idx: usize) -> u32 {
        self.words[idx].load(Ordering::Acquire)
    }

    pub fn write(&self, idx: usize, value: u32) {
        self.words[idx].store(value, Ordering::Release);
    }

    /// Copy `data` into the buffer starting at word `offset`.
    pub fn write_slice(&self, offset: usize, data: &[u32]) {
        for (i, &w) in data.iter().enumerate() {
            self.write(offset + i, w);
        }
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.words.iter().map(|w| w.load(Ordering::Acquire)).collect()
    }
}

impl fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemHandle")
            .field("id", &self.id)
            .field("len", &self.words.len())
            .finish()
    }
}

/// One user of the memory allocator (a process, or the host itself).
pub trait MemClient: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate a physically contiguous buffer of `words` words.
    fn alloc(&self, words: usize) -> Result<Arc<MemHandle>, MemError>;

    /// Make `handle` resident and return its bus address.
    fn pin(&self, handle: &Arc<MemHandle>) -> Result<PhysAddr, MemError>;

    /// Release one pin on each handle.
    fn unpin(&self, handles: &[Arc<MemHandle>]);
}

/// Pin every handle in order. On failure the handles pinned so far are
/// unpinned again before the error is returned.
pub fn pin_array(
    client: &dyn MemClient,
    handles: &[Arc<MemHandle>],
) -> Result<Vec<PhysAddr>, MemError> {
    let mut addrs = Vec::with_capacity(handles.len());
    for (i, handle) in handles.iter().enumerate() {
        match client.pin(handle) {
            Ok(addr) => addrs.push(addr),
            Err(err) => {
                log::debug!(
                    "mem: {} failed to pin handle {} ({}), unpinning {} handles",
                    client.name(),
                    handle.id(),
                    err,
                    i
                );
                client.unpin(&handles[..i]);
                return Err(err);
            }
        }
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeMem;

    #[test]
    fn test_handle_words() {
        let h = MemHandle::new(7, 4);
        h.write_slice(1, &[0xAA, 0xBB]);
        assert_eq!(h.id(), 7);
        assert_eq!(h.to_vec(), vec![0, 0xAA, 0xBB, 0]);
        assert_eq!(h.read(2), 0xBB);
    }

    #[test]
    fn test_pin_array_rolls_back() {
        let mem = FakeMem::new();
        let handles: Vec<_> = (0..4).map(|_| mem.alloc(8).unwrap()).collect();
        mem.fail_pin(handles[2].id());

        let err = pin_array(&*mem, &handles).unwrap_err();
        assert_eq!(err, MemError::PinFailed(handles[2].id()));
        for h in &handles {
            assert_eq!(mem.pin_count(h), 0);
        }
    }

    #[test]
    fn test_pin_array_addresses() {
        let mem = FakeMem::new();
        let a = mem.alloc(4).unwrap();
        let b = mem.alloc(4).unwrap();
        let addrs = pin_array(&*mem, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_ne!(addrs[0], addrs[1]);
        assert_eq!(mem.pin_count(&a), 1);
        mem.unpin(&[a.clone(), b]);
        assert_eq!(mem.pin_count(&a), 0);
    }
}
