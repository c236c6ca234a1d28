// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Close-event reporting.

use serde::Deserialize;
use serde::Serialize;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::SystemTime;

/// Everything worth knowing about a flow at the moment it is torn
/// down. Emitted exactly once per flow.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CloseEvent {
    /// Artifact path, or `None` if no payload was ever written.
    pub path: Option<PathBuf>,

    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
    pub vlan: Option<u16>,

    /// Stream high-water mark: the artifact's logical length.
    pub size: u64,

    /// Distinct payload bytes actually captured; less than `size` when
    /// the stream has unfilled gaps.
    pub seen_bytes: u64,

    /// Flow start and last-packet times, microseconds since the epoch.
    pub start_us: u64,
    pub end_us: u64,

    pub packets: u64,
    pub out_of_order: u64,
    pub violations: u64,
    pub dropped_writes: u64,
}

pub(crate) fn unix_micros(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Consumes close events.
pub trait Reporter {
    fn on_close(&mut self, ev: &CloseEvent);
}

/// Discards every event.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_close(&mut self, _ev: &CloseEvent) {}
}

/// Writes one JSON document per line per close event.
pub struct JsonLinesReporter<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> Reporter for JsonLinesReporter<W> {
    fn on_close(&mut self, ev: &CloseEvent) {
        if let Ok(doc) = serde_json::to_string(ev) {
            let _ = writeln!(self.out, "{doc}");
        }
    }
}
