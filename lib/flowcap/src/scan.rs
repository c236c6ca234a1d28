// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-close content scanners.

use crate::report::CloseEvent;
use slog::Logger;
use slog::info;

/// A scanner sees each artifact exactly once, after the flow has been
/// finalized and its handle flushed and closed.
pub trait Scanner {
    fn name(&self) -> &'static str;

    fn on_close(&mut self, ev: &CloseEvent, data: &[u8]);
}

/// Logs a CRC32 digest of every finalized artifact.
pub struct DigestScanner {
    log: Logger,
}

impl DigestScanner {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl Scanner for DigestScanner {
    fn name(&self) -> &'static str {
        "crc32"
    }

    fn on_close(&mut self, ev: &CloseEvent, data: &[u8]) {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        let digest = hasher.finalize();

        let path = ev
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        info!(
            self.log, "artifact digest";
            "path" => path,
            "crc32" => format!("{digest:08x}"),
            "bytes" => data.len(),
        );
    }
}
