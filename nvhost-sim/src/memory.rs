// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Simulated physically contiguous memory.
//!
//! Every allocation gets a 16-byte aligned bus address from a bump
//! allocator. Addresses are never reused, so a stale pointer in a push
//! buffer reads as a fault instead of someone else's data.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use nvhost_common::{MemError, PhysAddr, WORD_BYTES};
use nvhost_core::mem::{MemClient, MemHandle};
use parking_lot::Mutex;

const BASE_ADDR: PhysAddr = 0x0010_0000;
const ALIGN: u32 = 16;

struct Region {
    handle: Weak<MemHandle>,
    pins: u32,
}

struct State {
    next_id: u32,
    next_addr: PhysAddr,
    limit_words: usize,
    regions: BTreeMap<PhysAddr, Region>,
    addr_of: HashMap<u32, PhysAddr>,
    fail_next_pin: bool,
}

/// The memory bus shared by every client and the DMA fetcher.
pub struct SimMemory {
    state: Mutex<State>,
}

impl SimMemory {
    /// `limit_words` caps the total live allocation.
    pub fn new(limit_words: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_id: 1,
                next_addr: BASE_ADDR,
                limit_words,
                regions: BTreeMap::new(),
                addr_of: HashMap::new(),
                fail_next_pin: false,
            }),
        })
    }

    /// A named allocation client on this bus.
    pub fn client(self: &Arc<Self>, name: &str) -> Arc<SimClient> {
        Arc::new(SimClient {
            name: name.to_string(),
            mem: self.clone(),
        })
    }

    /// Word at `addr`, if it lies inside a live allocation.
    pub fn read_word(&self, addr: PhysAddr) -> Option<u32> {
        let st = self.state.lock();
        let (&base, region) = st.regions.range(..=addr).next_back()?;
        let handle = region.handle.upgrade()?;
        let idx = ((addr - base) / WORD_BYTES) as usize;
        (idx < handle.len()).then(|| handle.read(idx))
    }

    pub fn pin_count(&self, handle: &MemHandle) -> u32 {
        let st = self.state.lock();
        st.addr_of
            .get(&handle.id())
            .and_then(|addr| st.regions.get(addr))
            .map_or(0, |r| r.pins)
    }

    /// Allocations currently pinned at least once.
    pub fn pinned_regions(&self) -> usize {
        self.state
            .lock()
            .regions
            .values()
            .filter(|r| r.pins > 0)
            .count()
    }

    /// Make the next pin fail, to exercise rollback paths.
    pub fn fail_next_pin(&self) {
        self.state.lock().fail_next_pin = true;
    }

    fn alloc(&self, words: usize) -> Result<Arc<MemHandle>, MemError> {
        let mut st = self.state.lock();
        st.regions.retain(|_, r| r.handle.strong_count() > 0);
        let live: usize = st
            .regions
            .values()
            .filter_map(|r| r.handle.upgrade())
            .map(|h| h.len())
            .sum();
        if live + words > st.limit_words {
            return Err(MemError::OutOfMemory { words });
        }
        let id = st.next_id;
        st.next_id += 1;
        let addr = st.next_addr;
        let bytes = (words as u32 * WORD_BYTES).max(WORD_BYTES);
        st.next_addr = (addr + bytes + ALIGN - 1) & !(ALIGN - 1);
        let handle = Arc::new(MemHandle::new(id, words));
        st.regions.insert(
            addr,
            Region {
                handle: Arc::downgrade(&handle),
                pins: 0,
            },
        );
        st.addr_of.insert(id, addr);
        log::trace!("sim_mem: handle {} {} words at 0x{:08X}", id, words, addr);
        Ok(handle)
    }

    fn pin(&self, handle: &Arc<MemHandle>) -> Result<PhysAddr, MemError> {
        let mut st = self.state.lock();
        if std::mem::take(&mut st.fail_next_pin) {
            return Err(MemError::PinFailed(handle.id()));
        }
        let addr = *st
            .addr_of
            .get(&handle.id())
            .ok_or(MemError::PinFailed(handle.id()))?;
        let region = st
            .regions
            .get_mut(&addr)
            .ok_or(MemError::PinFailed(handle.id()))?;
        region.pins += 1;
        Ok(addr)
    }

    fn unpin(&self, handles: &[Arc<MemHandle>]) {
        let mut st = self.state.lock();
        for handle in handles {
            let Some(&addr) = st.addr_of.get(&handle.id()) else {
                log::error!("sim_mem: unpin of unknown handle {}", handle.id());
                continue;
            };
            match st.regions.get_mut(&addr) {
                Some(region) if region.pins > 0 => region.pins -= 1,
                _ => panic!("sim_mem: unpin of unpinned handle {}", handle.id()),
            }
        }
    }
}

/// [`MemClient`] view of a [`SimMemory`].
pub struct SimClient {
    name: String,
    mem: Arc<SimMemory>,
}

impl SimClient {
    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.mem
    }

    /// Allocate a buffer holding `words`.
    pub fn alloc_with(&self, words: &[u32]) -> Result<Arc<MemHandle>, MemError> {
        let handle = self.mem.alloc(words.len())?;
        handle.write_slice(0, words);
        Ok(handle)
    }
}

impl MemClient for SimClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, words: usize) -> Result<Arc<MemHandle>, MemError> {
        self.mem.alloc(words)
    }

    fn pin(&self, handle: &Arc<MemHandle>) -> Result<PhysAddr, MemError> {
        self.mem.pin(handle)
    }

    fn unpin(&self, handles: &[Arc<MemHandle>]) {
        self.mem.unpin(handles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_aligned_and_readable() {
        let mem = SimMemory::new(1 << 16);
        let client = mem.client("test");
        let a = client.alloc_with(&[1, 2, 3]).unwrap();
        let b = client.alloc_with(&[9]).unwrap();
        let pa = client.pin(&a).unwrap();
        let pb = client.pin(&b).unwrap();
        assert_eq!(pa % ALIGN, 0);
        assert_eq!(pb % ALIGN, 0);
        assert_eq!(mem.read_word(pa + 8), Some(3));
        assert_eq!(mem.read_word(pa + 12), None);
        assert_eq!(mem.read_word(pb), Some(9));
        assert_eq!(mem.read_word(BASE_ADDR - 4), None);
    }

    #[test]
    fn test_pin_counts() {
        let mem = SimMemory::new(1 << 16);
        let client = mem.client("test");
        let h = client.alloc(4).unwrap();
        client.pin(&h).unwrap();
        client.pin(&h).unwrap();
        assert_eq!(mem.pin_count(&h), 2);
        client.unpin(&[h.clone(), h.clone()]);
        assert_eq!(mem.pin_count(&h), 0);
        assert_eq!(mem.pinned_regions(), 0);
    }

    #[test]
    fn test_fail_next_pin_once() {
        let mem = SimMemory::new(1 << 16);
        let client = mem.client("test");
        let h = client.alloc(4).unwrap();
        mem.fail_next_pin();
        assert_eq!(client.pin(&h), Err(MemError::PinFailed(h.id())));
        assert!(client.pin(&h).is_ok());
    }

    #[test]
    fn test_out_of_memory_and_reuse_after_drop() {
        let mem = SimMemory::new(64);
        let client = mem.client("test");
        let h = client.alloc(60).unwrap();
        assert_eq!(
            client.alloc(8).unwrap_err(),
            MemError::OutOfMemory { words: 8 }
        );
        let addr = client.pin(&h).unwrap();
        client.unpin(std::slice::from_ref(&h));
        drop(h);
        assert!(client.alloc(8).is_ok());
        // The dropped region is gone from the bus.
        assert_eq!(mem.read_word(addr), None);
    }
}
