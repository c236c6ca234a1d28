// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Artifact naming.

use crate::addr::Family;
use crate::addr::PackedAddr;
use crate::flow::FlowRecord;
use std::fmt::Write;
use std::fs;
use std::path::PathBuf;

/// Produces artifact paths for new flows.
pub trait FlowNamer {
    /// An unused path for `flow`'s artifact. Must not return a path
    /// that already exists on disk.
    fn path_for(&mut self, flow: &FlowRecord) -> PathBuf;
}

pub const DEFAULT_TEMPLATE: &str = "%A.%a-%B.%b";

/// Renders filename templates over the flow identity:
///
/// * `%A` / `%a` — source address / port, zero-padded for sortability
/// * `%B` / `%b` — destination address / port
/// * `%V` — VLAN id, or `none`
/// * `%N` — flow id in creation order
/// * `%%` — a literal percent sign
///
/// Reused 4-tuples get a `cN` suffix; residual collisions (from an
/// earlier run, say) are resolved by probing numbered variants.
pub struct TemplateNamer {
    outdir: PathBuf,
    template: String,
}

impl TemplateNamer {
    pub fn new(outdir: PathBuf, template: String) -> Self {
        Self { outdir, template }
    }

    fn render(&self, flow: &FlowRecord) -> String {
        let mut out = String::new();
        let mut chars = self.template.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('A') => {
                    out.push_str(&addr_label(&flow.addr.src, flow.addr.family))
                }
                Some('a') => {
                    let _ = write!(out, "{:05}", flow.addr.sport);
                }
                Some('B') => {
                    out.push_str(&addr_label(&flow.addr.dst, flow.addr.family))
                }
                Some('b') => {
                    let _ = write!(out, "{:05}", flow.addr.dport);
                }
                Some('V') => match flow.vlan {
                    Some(vlan) => {
                        let _ = write!(out, "{vlan}");
                    }
                    None => out.push_str("none"),
                },
                Some('N') => {
                    let _ = write!(out, "{}", flow.id);
                }
                Some('%') => out.push('%'),
                // Unknown or trailing escapes render literally.
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}

impl FlowNamer for TemplateNamer {
    fn path_for(&mut self, flow: &FlowRecord) -> PathBuf {
        let mut name = self.render(flow);
        if flow.connection_count > 0 {
            let _ = write!(name, "c{}", flow.connection_count);
        }

        let base = self.outdir.join(&name);
        if fs::symlink_metadata(&base).is_err() {
            return base;
        }

        for n in 1u32.. {
            let probe = self.outdir.join(format!("{name}--{n}"));
            if fs::symlink_metadata(&probe).is_err() {
                return probe;
            }
        }
        unreachable!()
    }
}

/// A filesystem-safe, fixed-width rendering of an address. IPv4 octets
/// are zero-padded to three digits; IPv6 groups are joined with `_`
/// since `:` is hostile to many filesystems.
fn addr_label(addr: &PackedAddr, family: Family) -> String {
    let bytes = addr.bytes();
    match family {
        Family::V4 => format!(
            "{:03}.{:03}.{:03}.{:03}",
            bytes[0], bytes[1], bytes[2], bytes[3],
        ),
        Family::V6 => {
            let mut out = String::new();
            for (i, pair) in bytes.chunks_exact(2).enumerate() {
                if i > 0 {
                    out.push('_');
                }
                let _ = write!(out, "{:02x}{:02x}", pair[0], pair[1]);
            }
            out
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::FlowAddr;
    use crate::packet::PacketRecord;
    use std::time::SystemTime;

    fn flow(vlan: Option<u16>, connection_count: u64) -> FlowRecord {
        let addr = FlowAddr::new(
            PackedAddr::from([10, 0, 0, 1]),
            PackedAddr::from([10, 0, 0, 2]),
            49152,
            80,
            Family::V4,
        );
        let pkt = PacketRecord {
            ts: SystemTime::UNIX_EPOCH,
            ip: &[],
            caplen: 0,
            vlan,
            macs: None,
        };
        FlowRecord::new(addr, 7, connection_count, &pkt)
    }

    #[test]
    fn default_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut namer = TemplateNamer::new(
            dir.path().to_path_buf(),
            DEFAULT_TEMPLATE.to_string(),
        );
        let path = namer.path_for(&flow(None, 0));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "010.000.000.001.49152-010.000.000.002.00080",
        );
    }

    #[test]
    fn escapes_and_vlan() {
        let dir = tempfile::tempdir().unwrap();
        let mut namer = TemplateNamer::new(
            dir.path().to_path_buf(),
            "v%V-n%N-100%%".to_string(),
        );
        let path = namer.path_for(&flow(Some(42), 0));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "v42-n7-100%");
    }

    #[test]
    fn connection_count_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut namer =
            TemplateNamer::new(dir.path().to_path_buf(), "%a".to_string());
        let path = namer.path_for(&flow(None, 2));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "49152c2");
    }

    #[test]
    fn collisions_probe_numbered_variants() {
        let dir = tempfile::tempdir().unwrap();
        let mut namer =
            TemplateNamer::new(dir.path().to_path_buf(), "%a".to_string());

        std::fs::write(dir.path().join("49152"), b"taken").unwrap();
        std::fs::write(dir.path().join("49152--1"), b"also taken").unwrap();

        let path = namer.path_for(&flow(None, 0));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "49152--2");
    }
}
