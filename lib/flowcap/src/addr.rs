// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flow identity types.
//!
//! A [`FlowAddr`] names exactly one direction of a TCP conversation;
//! the two directions of a connection are distinct flows with distinct
//! artifacts. The ordering derived here is what keys the flow table.

use core::fmt;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// Address family of a flow.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum Family {
    V4,
    V6,
}

/// A 16-byte address cell holding either an IPv4 or IPv6 address.
///
/// IPv4 addresses occupy bytes 0..4 with the remainder zeroed, so the
/// byte-wise comparison derived here is stable across both families.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
    PartialOrd, Serialize,
)]
pub struct PackedAddr([u8; 16]);

impl PackedAddr {
    pub fn bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_ip(self, family: Family) -> IpAddr {
        match family {
            Family::V4 => {
                let mut quad = [0u8; 4];
                quad.copy_from_slice(&self.0[..4]);
                IpAddr::V4(Ipv4Addr::from(quad))
            }
            Family::V6 => IpAddr::V6(Ipv6Addr::from(self.0)),
        }
    }
}

impl From<[u8; 4]> for PackedAddr {
    fn from(quad: [u8; 4]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&quad);
        Self(bytes)
    }
}

impl From<[u8; 16]> for PackedAddr {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl From<Ipv4Addr> for PackedAddr {
    fn from(ip: Ipv4Addr) -> Self {
        Self::from(ip.octets())
    }
}

impl From<Ipv6Addr> for PackedAddr {
    fn from(ip: Ipv6Addr) -> Self {
        Self::from(ip.octets())
    }
}

/// One direction of a TCP connection.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct FlowAddr {
    pub src: PackedAddr,
    pub dst: PackedAddr,
    pub sport: u16,
    pub dport: u16,
    pub family: Family,
}

impl FlowAddr {
    pub fn new(
        src: PackedAddr,
        dst: PackedAddr,
        sport: u16,
        dport: u16,
        family: Family,
    ) -> Self {
        Self { src, dst, sport, dport, family }
    }

    /// The identity of the opposite direction of this conversation.
    pub fn reversed(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
            family: self.family,
        }
    }

    pub fn src_ip(&self) -> IpAddr {
        self.src.to_ip(self.family)
    }

    pub fn dst_ip(&self) -> IpAddr {
        self.dst.to_ip(self.family)
    }
}

impl fmt::Display for FlowAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip(),
            self.sport,
            self.dst_ip(),
            self.dport,
        )
    }
}
