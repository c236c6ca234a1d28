// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Normalized packet records handed to the demultiplexer.

use std::time::SystemTime;

/// Source and destination MAC addresses of a captured frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MacPair {
    pub src: [u8; 6],
    pub dst: [u8; 6],
}

/// A single captured packet, normalized by the capture layer: the
/// datalink header has been stripped and `ip` starts at the IP header.
#[derive(Clone, Copy, Debug)]
pub struct PacketRecord<'p> {
    /// Capture timestamp.
    pub ts: SystemTime,

    /// IP datagram bytes, clamped to what was captured.
    pub ip: &'p [u8],

    /// Capture length of the original frame.
    pub caplen: u32,

    /// 802.1Q VLAN id, if the frame was tagged.
    pub vlan: Option<u16>,

    /// Frame MAC addresses, when the datalink carried them.
    pub macs: Option<MacPair>,
}
