// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TCP header parsing.

use bitflags::bitflags;
use thiserror::Error;

pub const TCP_HDR_MIN: usize = 20;
pub const TCP_HDR_OFFSET_MASK: u8 = 0xF0;
pub const TCP_HDR_OFFSET_SHIFT: u8 = 4;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum TcpHdrError {
    #[error("truncated TCP header: {0} bytes")]
    Truncated(usize),

    #[error("data offset {0} smaller than base header")]
    BadDataOffset(usize),

    #[error("data offset {need} runs past end of segment ({have} bytes)")]
    TruncatedOptions { need: usize, have: usize },
}

/// The fixed TCP header fields the reconstructor cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpHdr {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub flags: TcpFlags,
    /// Header length including options, in bytes.
    pub hdr_len: usize,
}

impl TcpHdr {
    /// Parse the header at the start of `data`. The payload begins at
    /// `data[hdr_len..]`.
    pub fn parse(data: &[u8]) -> Result<Self, TcpHdrError> {
        if data.len() < TCP_HDR_MIN {
            return Err(TcpHdrError::Truncated(data.len()));
        }

        let hdr_len =
            usize::from((data[12] & TCP_HDR_OFFSET_MASK) >> TCP_HDR_OFFSET_SHIFT)
                * 4;
        if hdr_len < TCP_HDR_MIN {
            return Err(TcpHdrError::BadDataOffset(hdr_len));
        }
        if hdr_len > data.len() {
            return Err(TcpHdrError::TruncatedOptions {
                need: hdr_len,
                have: data.len(),
            });
        }

        Ok(Self {
            sport: u16::from_be_bytes([data[0], data[1]]),
            dport: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            flags: TcpFlags::from_bits_truncate(data[13]),
            hdr_len,
        })
    }
}
