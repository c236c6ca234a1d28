// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demultiplexer configuration.

use crate::naming::DEFAULT_TEMPLATE;
use nix::sys::resource::Resource;
use nix::sys::resource::getrlimit;
use std::path::PathBuf;
use std::time::Duration;

/// Largest sequence jump, in either direction, still attributed to the
/// current connection. Anything larger means the 4-tuple was reused.
pub const DEFAULT_MAX_SEEK: i32 = 1024 * 1024 * 16;

/// Closed flows remembered for straggler absorption.
pub const DEFAULT_STRAGGLER_CAPACITY: usize = 100;

/// Descriptors held back from the handle ring for stdio, the capture
/// file, the report stream, and scanner reads.
pub const RESERVED_FDS: usize = 6;

const FALLBACK_HANDLE_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct Config {
    /// Directory artifacts are written into.
    pub outdir: PathBuf,

    /// Artifact filename template, see [`crate::naming::TemplateNamer`].
    pub template: String,

    /// Cap on bytes written per flow artifact. Offsets past the cap are
    /// still tracked so sequence accounting survives the truncation.
    pub max_bytes_per_flow: Option<u64>,

    /// See [`DEFAULT_MAX_SEEK`].
    pub max_seek: i32,

    /// Handle-ring capacity. `None` derives it from `RLIMIT_NOFILE`.
    pub max_open_handles: Option<usize>,

    /// Close flows idle longer than this. `None` keeps flows open until
    /// FIN, RST, divergence, or final teardown.
    pub idle_timeout: Option<Duration>,

    pub straggler_capacity: usize,

    /// Run registered scanners over each artifact at close.
    pub post_process: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            outdir: PathBuf::from("."),
            template: DEFAULT_TEMPLATE.to_string(),
            max_bytes_per_flow: None,
            max_seek: DEFAULT_MAX_SEEK,
            max_open_handles: None,
            idle_timeout: None,
            straggler_capacity: DEFAULT_STRAGGLER_CAPACITY,
            post_process: false,
        }
    }
}

impl Config {
    /// The handle-ring capacity: the configured value, or the soft
    /// descriptor limit minus a reserved margin.
    pub fn handle_capacity(&self) -> usize {
        match self.max_open_handles {
            Some(n) => n.max(1),
            None => derived_fd_limit(),
        }
    }
}

fn derived_fd_limit() -> usize {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) => {
            (soft as usize).saturating_sub(RESERVED_FDS).max(1)
        }
        Err(_) => FALLBACK_HANDLE_CAPACITY,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn explicit_capacity_wins() {
        let cfg = Config { max_open_handles: Some(17), ..Default::default() };
        assert_eq!(cfg.handle_capacity(), 17);

        // Zero is clamped; the ring cannot run with no handles.
        let cfg = Config { max_open_handles: Some(0), ..Default::default() };
        assert_eq!(cfg.handle_capacity(), 1);
    }

    #[test]
    fn derived_capacity_is_positive() {
        let cfg = Config::default();
        assert!(cfg.handle_capacity() >= 1);
    }
}
