// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flowcap command-line tool: read pcap files, write one artifact
//! per TCP flow direction.

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use flowcap::Config;
use flowcap::Demux;
use flowcap::Ingest;
use flowcap::PacketRecord;
use flowcap::capture;
use flowcap::capture::Capture;
use flowcap::config::DEFAULT_MAX_SEEK;
use flowcap::config::DEFAULT_STRAGGLER_CAPACITY;
use flowcap::naming::DEFAULT_TEMPLATE;
use flowcap::report::JsonLinesReporter;
use flowcap::scan::DigestScanner;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use nix::sys::signal::sigaction;
use slog::Drain;
use slog::Logger;
use slog::info;
use slog::o;
use slog::warn;
use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Reconstruct TCP streams from pcap captures.
#[derive(Debug, Parser)]
#[command(name = "flowcap", version, about)]
struct Args {
    /// pcap files to read, in order
    #[arg(short = 'r', value_name = "FILE", required = true)]
    read: Vec<PathBuf>,

    /// Directory to write flow artifacts into
    #[arg(short = 'o', long, default_value = ".")]
    outdir: PathBuf,

    /// Artifact filename template (%A/%a source address/port,
    /// %B/%b destination, %V vlan, %N flow id, %% literal)
    #[arg(short = 'T', long, default_value = DEFAULT_TEMPLATE)]
    template: String,

    /// Cap on bytes written per flow artifact
    #[arg(short = 'b', long, value_name = "BYTES")]
    max_bytes: Option<u64>,

    /// Largest tolerated sequence jump before a segment is treated as
    /// a new connection on a reused 4-tuple
    #[arg(long, default_value_t = DEFAULT_MAX_SEEK, value_name = "BYTES")]
    max_seek: i32,

    /// Max simultaneously open artifact files (default: from the
    /// process descriptor limit)
    #[arg(short = 'f', long, value_name = "N")]
    max_files: Option<usize>,

    /// Close flows idle for more than this many seconds
    #[arg(short = 't', long, value_name = "SECONDS")]
    idle_timeout: Option<u64>,

    /// Recently closed flows remembered for straggler absorption
    #[arg(long, default_value_t = DEFAULT_STRAGGLER_CAPACITY, value_name = "N")]
    stragglers: usize,

    /// Run post-close scanners over each finished artifact
    #[arg(short = 'p', long)]
    post_process: bool,

    /// Write close events, one JSON document per line, to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

/// Scanning the flow table for idle flows costs O(flows), so it runs
/// once per this many packets rather than after every one.
const SWEEP_INTERVAL: u64 = 256;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)
            .context("installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action)
            .context("installing SIGTERM handler")?;
    }
    Ok(())
}

fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log = build_logger();
    install_signal_handlers()?;

    fs::create_dir_all(&args.outdir).with_context(|| {
        format!("creating output directory {}", args.outdir.display())
    })?;

    let cfg = Config {
        outdir: args.outdir,
        template: args.template,
        max_bytes_per_flow: args.max_bytes,
        max_seek: args.max_seek,
        max_open_handles: args.max_files,
        idle_timeout: args.idle_timeout.map(Duration::from_secs),
        straggler_capacity: args.stragglers,
        post_process: args.post_process,
    };

    let mut demux = Demux::new(cfg, log.clone());

    if let Some(path) = &args.report {
        let out = File::create(path).with_context(|| {
            format!("creating report file {}", path.display())
        })?;
        demux.set_reporter(Box::new(JsonLinesReporter::new(BufWriter::new(
            out,
        ))));
    }
    if args.post_process {
        demux.register_scanner(Box::new(DigestScanner::new(log.clone())));
    }

    let mut processed = 0u64;
    let mut skipped = 0u64;
    let mut since_sweep = 0u64;

    'files: for path in &args.read {
        let cap = Capture::open(path)
            .with_context(|| format!("opening capture {}", path.display()))?;
        info!(
            log, "reading capture";
            "file" => %path.display(),
            "linktype" => ?cap.linktype(),
        );

        for frame in cap.frames() {
            if SHUTDOWN.load(Ordering::SeqCst) {
                warn!(log, "interrupted, closing open flows");
                break 'files;
            }

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        log, "capture cut short";
                        "file" => %path.display(),
                        "err" => %e,
                    );
                    break;
                }
            };

            let Some(stripped) =
                capture::strip_datalink(cap.linktype(), frame.data)
            else {
                skipped += 1;
                continue;
            };

            let rec = PacketRecord {
                ts: frame.ts,
                ip: stripped.ip,
                caplen: frame.caplen,
                vlan: stripped.vlan,
                macs: stripped.macs,
            };
            match demux.ingest(&rec) {
                Ingest::Processed => processed += 1,
                Ingest::Skipped => skipped += 1,
            }

            since_sweep += 1;
            if since_sweep >= SWEEP_INTERVAL {
                demux.sweep_idle(frame.ts);
                since_sweep = 0;
            }
        }
    }

    demux.remove_all();

    info!(
        log, "done";
        "packets" => processed + skipped,
        "processed" => processed,
        "skipped" => skipped,
        "flows" => demux.flows_created(),
    );
    Ok(())
}
