// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-sided TCP stream reconstruction from packet captures.
//!
//! Each direction of each TCP connection is treated as an independent
//! flow and reassembled into its own artifact file: payload bytes are
//! written at `sequence - isn - 1`, so retransmissions overwrite
//! themselves and holes stay holes until (unless) the missing segment
//! arrives.
//!
//! The interesting pieces:
//!
//! * [`demux::Demux`] — routes packets to flows and owns all teardown.
//! * [`stream::StreamState`] — the per-flow reconstruction machine.
//! * [`ring::HandleRing`] — keeps unbounded live flows within a
//!   bounded file-descriptor budget.
//! * [`straggler::StragglerCache`] — absorbs retransmissions that
//!   arrive after their flow was torn down.
//! * [`capture::Capture`] — legacy pcap input and datalink stripping.

pub mod addr;
pub mod capture;
pub mod config;
pub mod demux;
pub mod flow;
pub mod intervals;
pub mod ip;
pub mod naming;
pub mod packet;
pub mod report;
pub mod ring;
pub mod scan;
pub mod straggler;
pub mod stream;
pub mod tcp;

pub use addr::FlowAddr;
pub use config::Config;
pub use demux::Demux;
pub use demux::Ingest;
pub use packet::PacketRecord;
