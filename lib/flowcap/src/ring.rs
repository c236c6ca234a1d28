// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A bounded pool of open artifact file handles.
//!
//! Any number of flows may be live at once, but only `capacity` of them
//! may hold an open file. When the ring is full, or the OS reports
//! descriptor exhaustion, the least-recently-used handle is quietly
//! closed; its owner reopens on the next write.

use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

/// Names an open handle in the ring.
///
/// Ids are generation-tagged: once the underlying handle has been
/// evicted, a stale id resolves to `None` rather than to whatever flow
/// now occupies the slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HandleId {
    idx: u32,
    seal: u32,
}

struct Entry {
    file: File,
    tick: u64,
}

struct Slot {
    seal: u32,
    entry: Option<Entry>,
}

pub struct HandleRing {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Recency order: lowest tick is least recently used.
    by_tick: BTreeMap<u64, u32>,
    next_tick: u64,
    capacity: usize,
}

impl HandleRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_tick: BTreeMap::new(),
            next_tick: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.by_tick.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tick.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Open `path` read-write, evicting the least-recently-used handle
    /// when the ring is full or the OS reports EMFILE/ENFILE. Other
    /// open errors are surfaced to the caller.
    ///
    /// A fresh artifact (`reopen == false`) is created and truncated; a
    /// reopen after eviction must preserve the bytes already written.
    pub fn open(&mut self, path: &Path, reopen: bool) -> io::Result<HandleId> {
        while self.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        if !reopen {
            opts.truncate(true);
        }

        loop {
            match opts.open(path) {
                Ok(file) => return Ok(self.insert(file)),
                Err(e) if is_fd_exhaustion(&e) => {
                    if !self.evict_oldest() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve an id to its file, or `None` if it has been evicted.
    pub fn file(&mut self, id: HandleId) -> Option<&mut File> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.seal != id.seal {
            return None;
        }
        slot.entry.as_mut().map(|e| &mut e.file)
    }

    /// Mark a handle most recently used.
    pub fn touch(&mut self, id: HandleId) {
        let tick = self.next_tick;
        let Some(slot) = self.slots.get_mut(id.idx as usize) else {
            return;
        };
        if slot.seal != id.seal {
            return;
        }
        let Some(entry) = slot.entry.as_mut() else {
            return;
        };

        self.by_tick.remove(&entry.tick);
        entry.tick = tick;
        self.next_tick += 1;
        self.by_tick.insert(tick, id.idx);
    }

    /// Close a handle, returning its file so the caller can flush it.
    /// Stale ids are a no-op.
    pub fn close(&mut self, id: HandleId) -> Option<File> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.seal != id.seal {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.seal = slot.seal.wrapping_add(1);
        self.by_tick.remove(&entry.tick);
        self.free.push(id.idx);
        Some(entry.file)
    }

    /// Close the least-recently-used handle. Returns `false` when the
    /// ring is empty.
    pub fn evict_oldest(&mut self) -> bool {
        let Some((_, &idx)) = self.by_tick.iter().next() else {
            return false;
        };
        let seal = self.slots[idx as usize].seal;
        self.close(HandleId { idx, seal }).is_some()
    }

    fn insert(&mut self, file: File) -> HandleId {
        let tick = self.next_tick;
        self.next_tick += 1;

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].entry = Some(Entry { file, tick });
                idx
            }
            None => {
                let idx = self.slots.len() as u32;
                let entry = Some(Entry { file, tick });
                self.slots.push(Slot { seal: 0, entry });
                idx
            }
        };

        self.by_tick.insert(tick, idx);
        HandleId { idx, seal: self.slots[idx as usize].seal }
    }
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}
