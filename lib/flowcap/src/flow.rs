// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-flow bookkeeping.

use crate::addr::FlowAddr;
use crate::packet::MacPair;
use crate::packet::PacketRecord;
use serde::Deserialize;
use serde::Serialize;
use std::time::SystemTime;

/// Advisory direction classification taken from handshake flags.
///
/// A bare SYN marks the client side, a SYN+ACK the server side. Flows
/// first seen mid-conversation stay `Unknown`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum Direction {
    #[default]
    Unknown,
    ClientToServer,
    ServerToClient,
}

/// Identity and traffic accounting for one flow direction.
#[derive(Clone, Debug)]
pub struct FlowRecord {
    pub addr: FlowAddr,

    /// Position in the global creation order, starting at zero.
    pub id: u64,

    /// How many times this 4-tuple has been reused. Incremented when a
    /// divergent sequence jump forces a fresh connection.
    pub connection_count: u64,

    pub vlan: Option<u16>,
    pub macs: Option<MacPair>,

    /// Timestamp of the packet that created the flow.
    pub tstart: SystemTime,

    /// Timestamp of the most recent packet.
    pub tlast: SystemTime,

    /// Packets attributed to this flow.
    pub packets: u64,

    /// Payload bytes offered to the reconstructor, before any
    /// truncation cap.
    pub bytes: u64,
}

impl FlowRecord {
    pub fn new(
        addr: FlowAddr,
        id: u64,
        connection_count: u64,
        pkt: &PacketRecord,
    ) -> Self {
        Self {
            addr,
            id,
            connection_count,
            vlan: pkt.vlan,
            macs: pkt.macs,
            tstart: pkt.ts,
            tlast: pkt.ts,
            packets: 0,
            bytes: 0,
        }
    }
}
