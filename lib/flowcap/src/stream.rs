// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-sided TCP stream reconstruction.
//!
//! A [`StreamState`] maps sequence numbers onto byte offsets in a flow
//! artifact. Two invariants hold throughout:
//!
//! * `nsn - isn - 1 == pos (mod 2^32)`: the next expected sequence
//!   number and the file position advance in lock step, so offset
//!   arithmetic survives 32-bit sequence wraparound.
//! * Bookkeeping (`pos`, `nsn`, high-water mark) advances by the full
//!   segment length even when the write itself was capped or dropped,
//!   so later segments still land at the right offsets.
//!
//! `StreamState` is deliberately not `Clone`: exactly one copy of each
//! flow's state exists, and it is destroyed only by the demultiplexer's
//! single finalize path.

use crate::addr::FlowAddr;
use crate::config::Config;
use crate::flow::Direction;
use crate::flow::FlowRecord;
use crate::intervals::IntervalSet;
use crate::report::CloseEvent;
use crate::report::unix_micros;
use crate::ring::HandleId;
use crate::ring::HandleRing;
use slog::Logger;
use slog::debug;
use slog::warn;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

pub struct StreamState {
    pub flow: FlowRecord,
    pub dir: Direction,

    path: PathBuf,
    handle: Option<HandleId>,
    /// The artifact exists on disk; reopens must not truncate it.
    file_created: bool,
    /// Actual file position, when known. `None` after open, reopen, or
    /// a failed write; the next store seeks unconditionally.
    cursor: Option<u64>,

    isn: u32,
    nsn: u32,
    pos: u64,
    /// High-water mark: the largest offset ever written past, which is
    /// the artifact's logical length.
    last_byte: u64,

    syn_count: u32,
    fin_count: u32,
    /// Stream length implied by the first FIN, used to detect a
    /// completely captured stream.
    fin_size: Option<u64>,

    seen: IntervalSet,

    out_of_order: u64,
    violations: u64,
    dropped_writes: u64,
}

impl StreamState {
    pub fn new(flow: FlowRecord, isn: u32, path: PathBuf) -> Self {
        Self {
            flow,
            dir: Direction::Unknown,
            path,
            handle: None,
            file_created: false,
            cursor: None,
            isn,
            nsn: isn.wrapping_add(1),
            pos: 0,
            last_byte: 0,
            syn_count: 0,
            fin_count: 0,
            fin_size: None,
            seen: IntervalSet::new(),
            out_of_order: 0,
            violations: 0,
            dropped_writes: 0,
        }
    }

    pub fn addr(&self) -> FlowAddr {
        self.flow.addr
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn isn(&self) -> u32 {
        self.isn
    }

    /// The sequence number the next in-order byte would carry.
    pub fn nsn(&self) -> u32 {
        self.nsn
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn last_byte(&self) -> u64 {
        self.last_byte
    }

    pub fn syn_count(&self) -> u32 {
        self.syn_count
    }

    pub fn fin_count(&self) -> u32 {
        self.fin_count
    }

    pub fn seen_bytes(&self) -> u64 {
        self.seen.total()
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes
    }

    pub fn handle(&self) -> Option<HandleId> {
        self.handle
    }

    pub fn file_created(&self) -> bool {
        self.file_created
    }

    /// Note a SYN. Classifies direction on the first SYN; a SYN
    /// carrying payload is a protocol violation worth counting.
    pub fn record_syn(&mut self, ack: bool, payload_len: usize) {
        self.syn_count += 1;
        if self.dir == Direction::Unknown {
            self.dir = if ack {
                Direction::ServerToClient
            } else {
                Direction::ClientToServer
            };
        }
        if payload_len > 0 {
            self.violations += 1;
        }
    }

    /// Note a FIN. The first FIN pins the stream's total length;
    /// returns `true` for that first FIN.
    pub fn record_fin(&mut self, seq: u32, payload_len: u32) -> bool {
        self.fin_count += 1;
        if self.fin_count > 1 {
            return false;
        }
        // The FIN occupies the sequence slot after the last data byte.
        let end = seq.wrapping_add(payload_len);
        self.fin_size =
            Some(u64::from(end.wrapping_sub(self.isn).wrapping_sub(1)));
        true
    }

    /// The stream is complete when a FIN pinned its length and every
    /// byte up to that length has been captured.
    pub fn is_complete(&self) -> bool {
        match self.fin_size {
            Some(size) => self.seen.total() == size,
            None => false,
        }
    }

    /// Store one segment's payload. `delta` is the signed distance from
    /// the next expected sequence number, computed by the caller as
    /// `seq.wrapping_sub(nsn) as i32`.
    ///
    /// Write failures are counted, never fatal: sequence bookkeeping
    /// advances regardless so the rest of the stream stays aligned.
    pub fn store(
        &mut self,
        ring: &mut HandleRing,
        cfg: &Config,
        log: &Logger,
        data: &[u8],
        delta: i32,
    ) {
        if data.is_empty() {
            return;
        }
        let full_len = data.len() as u64;
        self.flow.bytes += full_len;

        let signed_offset = self.pos as i64 + i64::from(delta);
        let mut insert_bytes = 0u64;
        let offset = if signed_offset < 0 {
            if self.syn_count > 0 {
                // We watched this stream begin; data claiming to
                // precede the ISN is bogus.
                debug!(
                    log, "segment before start of stream, dropped";
                    "flow" => %self.flow.addr,
                    "delta" => delta,
                );
                self.violations += 1;
                return;
            }
            // We joined mid-stream and guessed the origin too late.
            // Shift the artifact right and restate the ISN so these
            // earlier bytes land at offset zero.
            insert_bytes = signed_offset.unsigned_abs();
            0
        } else {
            signed_offset as u64
        };

        // Cap the write, never the advance.
        let mut wlen = data.len();
        if let Some(max) = cfg.max_bytes_per_flow {
            if offset >= max {
                wlen = 0;
            } else if offset + full_len > max {
                wlen = (max - offset) as usize;
            }
        }

        if wlen > 0 || insert_bytes > 0 {
            match self.ensure_open(ring, log) {
                Some(id) => {
                    ring.touch(id);
                    if let Some(file) = ring.file(id) {
                        self.write_payload(
                            file,
                            log,
                            &data[..wlen],
                            offset,
                            insert_bytes,
                        );
                    }
                }
                None => self.dropped_writes += 1,
            }
        }

        let new_pos = offset + full_len;
        self.nsn =
            self.nsn.wrapping_add((new_pos as i64 - self.pos as i64) as u32);
        self.pos = new_pos;
        if new_pos > self.last_byte {
            self.last_byte = new_pos;
        }

        debug_assert_eq!(
            self.nsn.wrapping_sub(self.isn).wrapping_sub(1),
            self.pos as u32,
        );
    }

    fn write_payload(
        &mut self,
        file: &mut File,
        log: &Logger,
        data: &[u8],
        offset: u64,
        insert_bytes: u64,
    ) {
        if insert_bytes > 0 {
            if let Err(e) = shift_right(file, insert_bytes) {
                warn!(
                    log, "artifact shift failed";
                    "flow" => %self.flow.addr,
                    "path" => %self.path.display(),
                    "err" => %e,
                );
                self.dropped_writes += 1;
                return;
            }
            self.isn = self.isn.wrapping_sub(insert_bytes as u32);
            self.nsn = self.isn.wrapping_add(1);
            self.pos = 0;
            self.last_byte += insert_bytes;
            self.out_of_order += 1;
            // Prior coverage is in the old coordinate system.
            self.seen.clear();
            self.cursor = None;
        }

        if data.is_empty() {
            return;
        }

        if self.cursor != Some(offset) {
            if offset < self.cursor.unwrap_or(self.pos) {
                self.out_of_order += 1;
            }
            if let Err(e) = file.seek(SeekFrom::Start(offset)) {
                warn!(
                    log, "artifact seek failed";
                    "flow" => %self.flow.addr,
                    "err" => %e,
                );
                self.dropped_writes += 1;
                self.cursor = None;
                return;
            }
        }

        match file.write_all(data) {
            Ok(()) => {
                let wrote = data.len() as u64;
                self.seen.insert(offset..offset + wrote);
                self.cursor = Some(offset + wrote);
            }
            Err(e) => {
                warn!(
                    log, "artifact write failed";
                    "flow" => %self.flow.addr,
                    "path" => %self.path.display(),
                    "err" => %e,
                );
                self.dropped_writes += 1;
                self.cursor = None;
            }
        }
    }

    fn ensure_open(
        &mut self,
        ring: &mut HandleRing,
        log: &Logger,
    ) -> Option<HandleId> {
        if let Some(id) = self.handle {
            if ring.file(id).is_some() {
                return Some(id);
            }
            // Evicted behind our back.
            self.handle = None;
            self.cursor = None;
        }

        match ring.open(&self.path, self.file_created) {
            Ok(id) => {
                self.handle = Some(id);
                self.file_created = true;
                self.cursor = None;
                Some(id)
            }
            Err(e) => {
                warn!(
                    log, "cannot open flow artifact";
                    "flow" => %self.flow.addr,
                    "path" => %self.path.display(),
                    "err" => %e,
                );
                None
            }
        }
    }

    /// Release this flow's handle, if it still holds one.
    pub fn close_handle(&mut self, ring: &mut HandleRing) {
        if let Some(id) = self.handle.take() {
            drop(ring.close(id));
        }
        self.cursor = None;
    }

    pub fn close_event(&self) -> CloseEvent {
        let addr = self.flow.addr;
        CloseEvent {
            path: self.file_created.then(|| self.path.clone()),
            src: addr.src_ip(),
            sport: addr.sport,
            dst: addr.dst_ip(),
            dport: addr.dport,
            vlan: self.flow.vlan,
            size: self.last_byte,
            seen_bytes: self.seen.total(),
            start_us: unix_micros(self.flow.tstart),
            end_us: unix_micros(self.flow.tlast),
            packets: self.flow.packets,
            out_of_order: self.out_of_order,
            violations: self.violations,
            dropped_writes: self.dropped_writes,
        }
    }
}

/// Shift the entire file contents right by `by` bytes, growing the
/// file. Copies back-to-front in chunks so overlapping regions are
/// safe.
fn shift_right(file: &mut File, by: u64) -> io::Result<()> {
    let len = file.metadata()?.len();
    let mut buf = vec![0u8; 64 * 1024];

    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        let start = remaining - chunk as u64;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..chunk])?;
        file.seek(SeekFrom::Start(start + by))?;
        file.write_all(&buf[..chunk])?;
        remaining = start;
    }
    Ok(())
}
