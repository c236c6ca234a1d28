// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flow demultiplexer.
//!
//! [`Demux`] owns every piece of per-flow state and routes each packet
//! to (or creates, or tears down) the flow it belongs to. All teardown
//! funnels through one private finalize path, so each flow's close
//! event, straggler record, and scanner pass happen exactly once.

use crate::addr::FlowAddr;
use crate::config::Config;
use crate::flow::FlowRecord;
use crate::ip;
use crate::naming::FlowNamer;
use crate::naming::TemplateNamer;
use crate::packet::PacketRecord;
use crate::report::NullReporter;
use crate::report::Reporter;
use crate::ring::HandleRing;
use crate::scan::Scanner;
use crate::straggler::StragglerCache;
use crate::straggler::StragglerRecord;
use crate::stream::StreamState;
use crate::tcp::TcpFlags;
use crate::tcp::TcpHdr;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::trace;
use slog::warn;
use std::collections::BTreeMap;
use std::fs;
use std::time::SystemTime;

/// What became of one ingested packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ingest {
    /// Attributed to a flow (possibly by discarding it deliberately).
    Processed,
    /// Not usable TCP: truncated, fragmented, or another protocol.
    Skipped,
}

pub struct Demux {
    cfg: Config,
    log: Logger,
    flows: BTreeMap<FlowAddr, StreamState>,
    ring: HandleRing,
    stragglers: StragglerCache,
    namer: Box<dyn FlowNamer>,
    reporter: Box<dyn Reporter>,
    scanners: Vec<Box<dyn Scanner>>,
    flow_counter: u64,
    packet_counter: u64,
}

impl Demux {
    pub fn new(cfg: Config, log: Logger) -> Self {
        let ring = HandleRing::with_capacity(cfg.handle_capacity());
        let stragglers = StragglerCache::with_capacity(cfg.straggler_capacity);
        let namer = Box::new(TemplateNamer::new(
            cfg.outdir.clone(),
            cfg.template.clone(),
        ));
        Self {
            cfg,
            log,
            flows: BTreeMap::new(),
            ring,
            stragglers,
            namer,
            reporter: Box::new(NullReporter),
            scanners: Vec::new(),
            flow_counter: 0,
            packet_counter: 0,
        }
    }

    pub fn set_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporter = reporter;
    }

    pub fn set_namer(&mut self, namer: Box<dyn FlowNamer>) {
        self.namer = namer;
    }

    pub fn register_scanner(&mut self, scanner: Box<dyn Scanner>) {
        self.scanners.push(scanner);
    }

    pub fn num_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn flows_created(&self) -> u64 {
        self.flow_counter
    }

    pub fn packets(&self) -> u64 {
        self.packet_counter
    }

    pub fn get(&self, addr: &FlowAddr) -> Option<&StreamState> {
        self.flows.get(addr)
    }

    /// Route one packet. The slice in `pkt.ip` must start at the IP
    /// header; the capture layer has already stripped the datalink.
    pub fn ingest(&mut self, pkt: &PacketRecord) -> Ingest {
        self.packet_counter += 1;

        let dgram = match ip::parse(pkt.ip) {
            Ok(dgram) => dgram,
            Err(e) => {
                trace!(self.log, "skipping packet"; "reason" => %e);
                return Ingest::Skipped;
            }
        };

        let hdr = match TcpHdr::parse(dgram.tcp) {
            Ok(hdr) => hdr,
            Err(e) => {
                trace!(self.log, "skipping packet"; "reason" => %e);
                return Ingest::Skipped;
            }
        };

        let payload = &dgram.tcp[hdr.hdr_len..];
        let addr = FlowAddr::new(
            dgram.src,
            dgram.dst,
            hdr.sport,
            hdr.dport,
            dgram.family,
        );
        self.process_tcp(pkt, addr, &hdr, payload);
        Ingest::Processed
    }

    fn process_tcp(
        &mut self,
        pkt: &PacketRecord,
        addr: FlowAddr,
        hdr: &TcpHdr,
        payload: &[u8],
    ) {
        let seq = hdr.seq;
        let syn = hdr.flags.contains(TcpFlags::SYN);
        let ack = hdr.flags.contains(TcpFlags::ACK);
        let fin = hdr.flags.contains(TcpFlags::FIN);
        let rst = hdr.flags.contains(TcpFlags::RST);

        // A replayed handshake against a stream that already carried
        // data is noise; honoring it would corrupt the artifact.
        if syn {
            if let Some(state) = self.flows.get(&addr) {
                if state.syn_count() > 0 && state.pos() > 0 {
                    debug!(
                        self.log, "replayed SYN ignored";
                        "flow" => %addr,
                    );
                    return;
                }
            }
        }

        if !self.flows.contains_key(&addr) {
            // RST, FIN, and bare ACKs with no payload cannot start a
            // meaningful flow.
            if payload.is_empty() && !syn {
                return;
            }

            // Data straggling in after teardown: if a recently closed
            // flow already recorded exactly these bytes, drop them
            // instead of opening a fresh flow.
            if !payload.is_empty() {
                if let Some(rec) = self.stragglers.lookup(&addr) {
                    if rec.matches(seq, payload) {
                        trace!(
                            self.log, "straggler absorbed";
                            "flow" => %addr,
                            "bytes" => payload.len(),
                        );
                        return;
                    }
                }
            }
        }

        // A sequence number wildly far from the expected one means the
        // 4-tuple was reused for a new connection.
        let mut connection_count = 0;
        let mut delta = 0i32;
        if let Some(state) = self.flows.get(&addr) {
            delta = seq.wrapping_sub(state.nsn()) as i32;
            if delta.unsigned_abs() > self.cfg.max_seek.unsigned_abs() {
                debug!(
                    self.log, "sequence diverged, starting new connection";
                    "flow" => %addr,
                    "delta" => delta,
                );
                connection_count = state.flow.connection_count + 1;
                self.finalize(addr);
                delta = 0;
            }
        }

        if !self.flows.contains_key(&addr) {
            if payload.is_empty() && !syn {
                return;
            }
            // With no SYN the first byte of this segment defines the
            // origin: pretend the ISN came one earlier.
            let isn = if syn { seq } else { seq.wrapping_sub(1) };
            let id = self.flow_counter;
            self.flow_counter += 1;
            let flow = FlowRecord::new(addr, id, connection_count, pkt);
            let path = self.namer.path_for(&flow);
            debug!(
                self.log, "new flow";
                "flow" => %addr,
                "path" => %path.display(),
                "isn" => isn,
            );
            self.flows.insert(addr, StreamState::new(flow, isn, path));
        }

        let Some(state) = self.flows.get_mut(&addr) else {
            return;
        };

        state.flow.tlast = pkt.ts;
        state.flow.packets += 1;

        if syn {
            state.record_syn(ack, payload.len());
        }

        if !payload.is_empty() {
            state.store(&mut self.ring, &self.cfg, &self.log, payload, delta);
        }

        let mut teardown = rst;
        if rst {
            debug!(self.log, "flow reset"; "flow" => %addr);
        } else {
            if fin && !state.record_fin(seq, payload.len() as u32) {
                // Duplicate FIN: just refresh ring recency.
                if let Some(id) = state.handle() {
                    self.ring.touch(id);
                }
            }
            if state.is_complete() {
                debug!(
                    self.log, "stream complete";
                    "flow" => %addr,
                    "bytes" => state.seen_bytes(),
                );
                teardown = true;
            }
        }

        if teardown {
            self.finalize(addr);
        }
    }

    /// Tear down flows with no traffic since `now - idle_timeout`.
    pub fn sweep_idle(&mut self, now: SystemTime) {
        let Some(timeout) = self.cfg.idle_timeout else {
            return;
        };

        let expired: Vec<FlowAddr> = self
            .flows
            .iter()
            .filter(|(_, state)| {
                now.duration_since(state.flow.tlast)
                    .map(|idle| idle > timeout)
                    .unwrap_or(false)
            })
            .map(|(addr, _)| *addr)
            .collect();

        for addr in expired {
            debug!(self.log, "idle flow expired"; "flow" => %addr);
            self.finalize(addr);
        }
    }

    /// Tear down one flow, if present.
    pub fn remove(&mut self, addr: &FlowAddr) {
        self.finalize(*addr);
    }

    /// Tear down every live flow. Iteration order is unspecified.
    pub fn remove_all(&mut self) {
        let addrs: Vec<FlowAddr> = self.flows.keys().copied().collect();
        for addr in addrs {
            self.finalize(addr);
        }
    }

    /// The single exit path for flow state. Flushes and closes the
    /// handle, emits the close event, runs scanners, and records the
    /// flow for straggler matching, in that order.
    fn finalize(&mut self, addr: FlowAddr) {
        let Some(mut state) = self.flows.remove(&addr) else {
            return;
        };
        state.close_handle(&mut self.ring);

        let ev = state.close_event();
        info!(
            self.log, "flow closed";
            "flow" => %addr,
            "size" => ev.size,
            "seen" => ev.seen_bytes,
            "packets" => ev.packets,
        );
        self.reporter.on_close(&ev);

        if self.cfg.post_process
            && state.file_created()
            && !self.scanners.is_empty()
        {
            match fs::read(state.path()) {
                Ok(data) => {
                    for scanner in &mut self.scanners {
                        scanner.on_close(&ev, &data);
                    }
                }
                Err(e) => {
                    warn!(
                        self.log, "cannot read artifact for scanning";
                        "path" => %state.path().display(),
                        "err" => %e,
                    );
                }
            }
        }

        if state.file_created() {
            self.stragglers.record(StragglerRecord {
                addr,
                path: state.path().to_path_buf(),
                isn: state.isn(),
            });
        }
    }
}
