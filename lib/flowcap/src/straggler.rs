// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Absorbing data that straggles in after a flow was torn down.
//!
//! A retransmission arriving after its flow's FIN has been processed
//! would otherwise open a brand new flow and artifact. The cache
//! remembers recently closed flows; a late segment whose bytes exactly
//! match what the artifact already holds is silently dropped.

use crate::addr::FlowAddr;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::PathBuf;

/// A closed flow remembered for straggler matching.
#[derive(Clone, Debug)]
pub struct StragglerRecord {
    pub addr: FlowAddr,
    pub path: PathBuf,
    pub isn: u32,
}

impl StragglerRecord {
    /// Does `payload` at sequence number `seq` exactly match bytes the
    /// saved artifact already holds? Any read failure counts as no
    /// match, so the segment falls through to normal flow creation.
    pub fn matches(&self, seq: u32, payload: &[u8]) -> bool {
        let offset = u64::from(seq.wrapping_sub(self.isn).wrapping_sub(1));

        let Ok(mut file) = File::open(&self.path) else {
            return false;
        };
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return false;
        }

        let mut saved = vec![0u8; payload.len()];
        match file.read_exact(&mut saved) {
            Ok(()) => saved == payload,
            Err(_) => false,
        }
    }
}

/// A bounded FIFO of recently closed flows.
///
/// Eviction is strictly by insertion order; a lookup does not renew a
/// record's lease on the cache.
pub struct StragglerCache {
    order: VecDeque<FlowAddr>,
    map: BTreeMap<FlowAddr, StragglerRecord>,
    capacity: usize,
}

impl StragglerCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { order: VecDeque::new(), map: BTreeMap::new(), capacity }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Record a just-finalized flow, evicting the oldest record when
    /// the cache is full. Re-recording the same flow address replaces
    /// the old record and restarts its position in the FIFO.
    pub fn record(&mut self, rec: StragglerRecord) {
        if self.capacity == 0 {
            return;
        }

        let addr = rec.addr;
        if self.map.insert(addr, rec).is_some() {
            self.order.retain(|a| *a != addr);
        }
        self.order.push_back(addr);

        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }
    }

    pub fn lookup(&self, addr: &FlowAddr) -> Option<&StragglerRecord> {
        self.map.get(addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::Family;
    use crate::addr::PackedAddr;
    use std::io::Write;

    fn addr(port: u16) -> FlowAddr {
        FlowAddr::new(
            PackedAddr::from([10, 0, 0, 1]),
            PackedAddr::from([10, 0, 0, 2]),
            port,
            80,
            Family::V4,
        )
    }

    fn record(port: u16) -> StragglerRecord {
        StragglerRecord {
            addr: addr(port),
            path: PathBuf::from("/nonexistent"),
            isn: 0,
        }
    }

    #[test]
    fn fifo_eviction() {
        let mut cache = StragglerCache::with_capacity(2);
        cache.record(record(1));
        cache.record(record(2));
        cache.record(record(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&addr(1)).is_none());
        assert!(cache.lookup(&addr(2)).is_some());
        assert!(cache.lookup(&addr(3)).is_some());
    }

    #[test]
    fn rerecord_restarts_fifo_position() {
        let mut cache = StragglerCache::with_capacity(2);
        cache.record(record(1));
        cache.record(record(2));
        cache.record(record(1)); // 1 is now newest
        cache.record(record(3)); // evicts 2

        assert!(cache.lookup(&addr(1)).is_some());
        assert!(cache.lookup(&addr(2)).is_none());
        assert!(cache.lookup(&addr(3)).is_some());
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let mut cache = StragglerCache::with_capacity(0);
        cache.record(record(1));
        assert!(cache.is_empty());
    }

    #[test]
    fn matches_against_saved_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello, straggler")
            .unwrap();

        let isn = 5000u32;
        let rec = StragglerRecord { addr: addr(1), path, isn };

        // First payload byte lands at artifact offset seq - isn - 1.
        assert!(rec.matches(isn.wrapping_add(1), b"hello"));
        assert!(rec.matches(isn.wrapping_add(8), b"straggler"));
        assert!(!rec.matches(isn.wrapping_add(1), b"other"));
        // Runs past end of file.
        assert!(!rec.matches(isn.wrapping_add(8), b"straggler?!"));
    }

    #[test]
    fn missing_artifact_never_matches() {
        let rec = record(1);
        assert!(!rec.matches(1, b"data"));
    }
}
