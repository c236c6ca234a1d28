// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPv4 and IPv6 fixed-header extraction.
//!
//! Only enough of the network layer is parsed to find the TCP segment
//! and the flow endpoints. IPv6 extension headers are not walked; a
//! datagram whose next header is not TCP is skipped.

use crate::addr::Family;
use crate::addr::PackedAddr;
use thiserror::Error;

pub const IP4_HDR_MIN: usize = 20;
pub const IP6_HDR_SIZE: usize = 40;
pub const IPPROTO_TCP: u8 = 6;

const IP4_FRAG_OFFSET_MASK: u16 = 0x1FFF;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum IpHdrError {
    #[error("truncated IP datagram: {0} bytes")]
    Truncated(usize),

    #[error("unsupported IP version {0}")]
    BadVersion(u8),

    #[error("IPv4 header length {0} smaller than base header")]
    BadHeaderLen(usize),

    #[error("non-initial IPv4 fragment")]
    Fragment,

    #[error("non-TCP protocol {0}")]
    NotTcp(u8),
}

/// The TCP portion of an IP datagram, plus the flow endpoints.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IpDatagram<'a> {
    pub src: PackedAddr,
    pub dst: PackedAddr,
    pub family: Family,
    /// TCP header and payload, clamped to the captured bytes.
    pub tcp: &'a [u8],
}

/// Extract the TCP segment from an IP datagram of either family.
pub fn parse(data: &[u8]) -> Result<IpDatagram<'_>, IpHdrError> {
    let Some(first) = data.first() else {
        return Err(IpHdrError::Truncated(0));
    };

    match first >> 4 {
        4 => parse_v4(data),
        6 => parse_v6(data),
        version => Err(IpHdrError::BadVersion(version)),
    }
}

fn parse_v4(data: &[u8]) -> Result<IpDatagram<'_>, IpHdrError> {
    if data.len() < IP4_HDR_MIN {
        return Err(IpHdrError::Truncated(data.len()));
    }

    let proto = data[9];
    if proto != IPPROTO_TCP {
        return Err(IpHdrError::NotTcp(proto));
    }

    // Only the initial fragment carries the TCP header.
    let frag = u16::from_be_bytes([data[6], data[7]]);
    if frag & IP4_FRAG_OFFSET_MASK != 0 {
        return Err(IpHdrError::Fragment);
    }

    let hdr_len = usize::from(data[0] & 0x0F) * 4;
    if hdr_len < IP4_HDR_MIN {
        return Err(IpHdrError::BadHeaderLen(hdr_len));
    }

    let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if hdr_len > total_len || hdr_len > data.len() {
        return Err(IpHdrError::Truncated(data.len()));
    }

    // The capture may be shorter than the datagram claims.
    let end = total_len.min(data.len());

    let mut src = [0u8; 4];
    src.copy_from_slice(&data[12..16]);
    let mut dst = [0u8; 4];
    dst.copy_from_slice(&data[16..20]);

    Ok(IpDatagram {
        src: PackedAddr::from(src),
        dst: PackedAddr::from(dst),
        family: Family::V4,
        tcp: &data[hdr_len..end],
    })
}

fn parse_v6(data: &[u8]) -> Result<IpDatagram<'_>, IpHdrError> {
    if data.len() < IP6_HDR_SIZE {
        return Err(IpHdrError::Truncated(data.len()));
    }

    let next = data[6];
    if next != IPPROTO_TCP {
        return Err(IpHdrError::NotTcp(next));
    }

    let payload_len = usize::from(u16::from_be_bytes([data[4], data[5]]));
    if payload_len == 0 {
        return Err(IpHdrError::Truncated(data.len()));
    }

    let end = (IP6_HDR_SIZE + payload_len).min(data.len());

    let mut src = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&data[24..40]);

    Ok(IpDatagram {
        src: PackedAddr::from(src),
        dst: PackedAddr::from(dst),
        family: Family::V6,
        tcp: &data[IP6_HDR_SIZE..end],
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn v4_datagram(proto: u8, frag: u16, payload: &[u8]) -> Vec<u8> {
        let total = IP4_HDR_MIN + payload.len();
        let mut pkt = vec![0u8; total];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        pkt[6..8].copy_from_slice(&frag.to_be_bytes());
        pkt[8] = 64;
        pkt[9] = proto;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[16..20].copy_from_slice(&[10, 0, 0, 2]);
        pkt[20..].copy_from_slice(payload);
        pkt
    }

    #[test]
    fn v4_tcp() {
        let pkt = v4_datagram(IPPROTO_TCP, 0, b"stub tcp bytes");
        let dgram = parse(&pkt).unwrap();
        assert_eq!(dgram.family, Family::V4);
        assert_eq!(dgram.src, PackedAddr::from([10, 0, 0, 1]));
        assert_eq!(dgram.dst, PackedAddr::from([10, 0, 0, 2]));
        assert_eq!(dgram.tcp, b"stub tcp bytes");
    }

    #[test]
    fn v4_not_tcp() {
        let pkt = v4_datagram(17, 0, b"udp");
        assert_eq!(parse(&pkt), Err(IpHdrError::NotTcp(17)));
    }

    #[test]
    fn v4_fragment() {
        let pkt = v4_datagram(IPPROTO_TCP, 0x00B9, b"mid-fragment");
        assert_eq!(parse(&pkt), Err(IpHdrError::Fragment));
    }

    #[test]
    fn v4_short_capture_is_clamped() {
        // total_len claims 20 bytes of payload but only 4 were captured.
        let mut pkt = v4_datagram(IPPROTO_TCP, 0, b"full payload covered");
        pkt.truncate(IP4_HDR_MIN + 4);
        let dgram = parse(&pkt).unwrap();
        assert_eq!(dgram.tcp, b"full");
    }

    #[test]
    fn v6_tcp() {
        let payload = b"tcp goes here";
        let mut pkt = vec![0u8; IP6_HDR_SIZE + payload.len()];
        pkt[0] = 0x60;
        pkt[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        pkt[6] = IPPROTO_TCP;
        pkt[23] = 1; // src ::1
        pkt[39] = 2; // dst ::2
        pkt[IP6_HDR_SIZE..].copy_from_slice(payload);

        let dgram = parse(&pkt).unwrap();
        assert_eq!(dgram.family, Family::V6);
        assert_eq!(dgram.tcp, payload);
    }

    #[test]
    fn bad_version() {
        assert_eq!(parse(&[0x50; 40]), Err(IpHdrError::BadVersion(5)));
        assert_eq!(parse(&[]), Err(IpHdrError::Truncated(0)));
    }
}
