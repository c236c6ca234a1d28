// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading saved captures and stripping datalink headers.

use crate::packet::MacPair;
use pcap_parser::Linktype;
use pcap_parser::pcap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use std::time::SystemTime;
use thiserror::Error;

const ETHERTYPE_IP4: u16 = 0x0800;
const ETHERTYPE_IP6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

const ETHER_HDR_SIZE: usize = 14;
const VLAN_TAG_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("not a legacy pcap file: {0}")]
    BadHeader(String),

    #[error("malformed pcap block at offset {0}")]
    BadBlock(usize),
}

/// An offline legacy-pcap capture, held in memory.
///
/// The whole file is read up front, which keeps frame slices zero-copy
/// but means memory use tracks capture size. Captures that dwarf
/// available memory would need a streaming reader instead.
pub struct Capture {
    data: Vec<u8>,
    linktype: Linktype,
    /// Offset of the first block, just past the file header.
    body: usize,
}

impl Capture {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let data = fs::read(path)?;
        let (rest, hdr) = pcap::parse_pcap_header(&data)
            .map_err(|e| CaptureError::BadHeader(format!("{e:?}")))?;
        let body = data.len() - rest.len();
        let linktype = hdr.network;
        Ok(Self { data, linktype, body })
    }

    pub fn linktype(&self) -> Linktype {
        self.linktype
    }

    pub fn frames(&self) -> Frames<'_> {
        Frames { capture: self, offset: self.body }
    }
}

/// One captured frame.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'c> {
    pub ts: SystemTime,
    pub caplen: u32,
    pub data: &'c [u8],
}

pub struct Frames<'c> {
    capture: &'c Capture,
    offset: usize,
}

impl<'c> Iterator for Frames<'c> {
    type Item = Result<Frame<'c>, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.capture.data.len() {
            return None;
        }

        match pcap::parse_pcap_frame(&self.capture.data[self.offset..]) {
            Ok((rest, block)) => {
                self.offset = self.capture.data.len() - rest.len();
                let ts = SystemTime::UNIX_EPOCH
                    + Duration::new(
                        u64::from(block.ts_sec),
                        block.ts_usec.saturating_mul(1000),
                    );
                Some(Ok(Frame { ts, caplen: block.caplen, data: block.data }))
            }
            Err(_) => {
                let at = self.offset;
                // A bad block poisons the rest of the file.
                self.offset = self.capture.data.len();
                Some(Err(CaptureError::BadBlock(at)))
            }
        }
    }
}

/// The result of peeling the datalink header off a frame.
#[derive(Clone, Copy, Debug)]
pub struct Stripped<'p> {
    pub ip: &'p [u8],
    pub vlan: Option<u16>,
    pub macs: Option<MacPair>,
}

/// Strip the datalink header, returning the IP datagram within.
/// `None` means the frame carries no IP payload we can use.
pub fn strip_datalink(
    linktype: Linktype,
    frame: &[u8],
) -> Option<Stripped<'_>> {
    if linktype == Linktype::ETHERNET {
        return strip_ethernet(frame);
    }

    // BSD loopback: a 4-byte host-order AF_* tag precedes the datagram.
    if linktype == Linktype::NULL || linktype == Linktype::LOOP {
        if frame.len() <= 4 {
            return None;
        }
        return Some(Stripped { ip: &frame[4..], vlan: None, macs: None });
    }

    if linktype == Linktype::RAW
        || linktype == Linktype::IPV4
        || linktype == Linktype::IPV6
    {
        return Some(Stripped { ip: frame, vlan: None, macs: None });
    }

    None
}

fn strip_ethernet(frame: &[u8]) -> Option<Stripped<'_>> {
    if frame.len() < ETHER_HDR_SIZE {
        return None;
    }

    let mut dst = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    let mut src = [0u8; 6];
    src.copy_from_slice(&frame[6..12]);
    let macs = Some(MacPair { src, dst });

    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut off = ETHER_HDR_SIZE;
    let mut vlan = None;

    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < ETHER_HDR_SIZE + VLAN_TAG_SIZE {
            return None;
        }
        vlan = Some(u16::from_be_bytes([frame[14], frame[15]]) & 0x0FFF);
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
        off += VLAN_TAG_SIZE;
    }

    match ethertype {
        ETHERTYPE_IP4 | ETHERTYPE_IP6 => {
            Some(Stripped { ip: &frame[off..], vlan, macs })
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ether_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xAA]); // dst
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xBB]); // src
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn ethernet_ip4() {
        let frame = ether_frame(ETHERTYPE_IP4, b"ip bytes");
        let s = strip_datalink(Linktype::ETHERNET, &frame).unwrap();
        assert_eq!(s.ip, b"ip bytes");
        assert_eq!(s.vlan, None);
        let macs = s.macs.unwrap();
        assert_eq!(macs.src[5], 0xBB);
        assert_eq!(macs.dst[5], 0xAA);
    }

    #[test]
    fn ethernet_vlan_tag() {
        let mut tagged = Vec::new();
        // VLAN 5, priority bits set, inner ethertype IPv4.
        tagged.extend_from_slice(&0xA005u16.to_be_bytes());
        tagged.extend_from_slice(&ETHERTYPE_IP4.to_be_bytes());
        tagged.extend_from_slice(b"inner");
        let frame = ether_frame(ETHERTYPE_VLAN, &tagged);

        let s = strip_datalink(Linktype::ETHERNET, &frame).unwrap();
        assert_eq!(s.vlan, Some(5));
        assert_eq!(s.ip, b"inner");
    }

    #[test]
    fn non_ip_ethertype_skipped() {
        let frame = ether_frame(0x0806, b"arp"); // ARP
        assert!(strip_datalink(Linktype::ETHERNET, &frame).is_none());
    }

    #[test]
    fn raw_and_loopback() {
        let s = strip_datalink(Linktype::RAW, b"datagram").unwrap();
        assert_eq!(s.ip, b"datagram");

        let mut lo = vec![2, 0, 0, 0]; // AF_INET tag
        lo.extend_from_slice(b"datagram");
        let s = strip_datalink(Linktype::NULL, &lo).unwrap();
        assert_eq!(s.ip, b"datagram");
    }

    #[test]
    fn truncated_frames_skipped() {
        assert!(strip_datalink(Linktype::ETHERNET, &[0u8; 10]).is_none());
        assert!(strip_datalink(Linktype::NULL, &[0u8; 4]).is_none());
    }
}
