//! # VAVPP CLI
//!
//! Probe VA-API video post-processing and push synthetic streams through the
//! deinterlacing pipeline.
//!
//! ## Usage
//! ```bash
//! # What does the GPU offer?
//! vavpp probe
//!
//! # Reference window bookkeeping against the mock backend
//! vavpp simulate --frames 5 --forward 1 --backward 1 --opts deint=weave:reversal-bug=no
//!
//! # Real hardware, with per-request reference traces
//! RUST_LOG=vavpp_core=trace vavpp run --frames 50
//! ```

use std::io::{self, Write};
use std::str::FromStr;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vavpp_core::mock::{self, MockBackend};
use vavpp_core::negotiate::probe_backend;
use vavpp_core::vaapi::VaapiBackend;
use vavpp_core::{
    DeintOptions, FieldFlags, Frame, ImageFormat, SoftwareImage, StreamParams, VppBackend, VppError, VppFilter,
};

/// Surface ids of simulated input frames start here, clear of the ids the
/// mock backend hands out.
const SIM_SURFACE_BASE: u32 = 0x1000;

#[derive(Parser, Debug)]
#[command(name = "vavpp", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print filters, deinterlacing algorithms and pipeline caps as JSON.
    Probe(ProbeArgs),
    /// Drive synthetic frames through the mock backend.
    Simulate(SimulateArgs),
    /// Upload synthetic NV12 frames into the VA-API backend.
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// DRM render node.
    #[arg(long, default_value = "/dev/dri/renderD128")]
    device: String,

    /// Probe the mock backend instead of VA-API.
    #[arg(long, default_value_t = false)]
    mock: bool,
}

#[derive(Args, Debug)]
struct StreamArgs {
    /// Number of input frames.
    #[arg(long, default_value_t = 10)]
    frames: u32,

    /// Filter options, e.g. `deint=motion-adaptive:interlaced-only=no`.
    #[arg(long, default_value = "")]
    opts: String,

    /// Filter options as JSON, overrides --opts.
    #[arg(long)]
    json_opts: Option<String>,

    /// Mark frames progressive instead of interlaced.
    #[arg(long, default_value_t = false)]
    progressive: bool,

    /// Bottom field first.
    #[arg(long, default_value_t = false)]
    bff: bool,

    /// Input frame rate, used for timestamps.
    #[arg(long, default_value_t = 25.0)]
    fps: f64,
}

impl StreamArgs {
    fn options(&self) -> Result<DeintOptions> {
        let options = match &self.json_opts {
            Some(json) => DeintOptions::from_json(json)?,
            None => DeintOptions::from_str(&self.opts)?,
        };
        Ok(options)
    }

    fn fields(&self) -> FieldFlags {
        let mut fields = FieldFlags::empty();
        if !self.progressive {
            fields |= FieldFlags::INTERLACED;
        }
        if !self.bff {
            fields |= FieldFlags::TOP_FIRST;
        }
        fields
    }
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    #[command(flatten)]
    stream: StreamArgs,

    /// Forward references the mock reports.
    #[arg(long, default_value_t = 0)]
    forward: u32,

    /// Backward references the mock reports.
    #[arg(long, default_value_t = 0)]
    backward: u32,

    /// Make the pipeline capability query fail.
    #[arg(long, default_value_t = false)]
    fail_caps: bool,

    /// Also print every render request.
    #[arg(long, default_value_t = false)]
    requests: bool,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    stream: StreamArgs,

    /// DRM render node.
    #[arg(long, default_value = "/dev/dri/renderD128")]
    device: String,

    #[arg(long, default_value_t = 720)]
    width: u32,

    #[arg(long, default_value_t = 576)]
    height: u32,
}

// ============================================================================
// Stream Driver
// ============================================================================

#[derive(Debug, Default, Serialize)]
struct Summary {
    inputs: u32,
    outputs: u32,
    dropped_inputs: u32,
    failed_outputs: u32,
}

/// Feed `frames` and then end of stream, calling `emit` for every output.
fn drive<B: VppBackend>(
    vpp: &mut VppFilter<B>,
    frames: impl IntoIterator<Item = Frame>,
    mut emit: impl FnMut(&Frame) -> Result<()>,
) -> Result<Summary> {
    let mut summary = Summary::default();

    for input in frames.into_iter().map(Some).chain(std::iter::once(None)) {
        let eof = input.is_none();
        if !eof {
            summary.inputs += 1;
        }
        if let Err(e) = vpp.filter_input(input) {
            check_fatal(e)?;
            summary.dropped_inputs += 1;
            continue;
        }

        loop {
            match vpp.filter_output() {
                Ok(Some(frame)) => {
                    summary.outputs += 1;
                    emit(&frame)?;
                }
                Ok(None) => break,
                Err(e) => {
                    check_fatal(e)?;
                    summary.failed_outputs += 1;
                }
            }
        }
    }
    Ok(summary)
}

fn check_fatal(e: VppError) -> Result<()> {
    if e.is_fatal() {
        return Err(e.into());
    }
    warn!("{}", e);
    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_probe(args: ProbeArgs) -> Result<()> {
    let report = if args.mock {
        let mut backend = MockBackend::new();
        json!({ "report": probe_backend(&mut backend)? })
    } else {
        let mut backend = VaapiBackend::open_device(&args.device)
            .with_context(|| format!("opening {}", args.device))?;
        let (major, minor) = backend.version();
        json!({
            "device": args.device,
            "va_version": format!("{}.{}", major, minor),
            "vendor": backend.vendor(),
            "report": probe_backend(&mut backend)?,
        })
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_simulate(args: SimulateArgs) -> Result<()> {
    let options = args.stream.options()?;
    let mut backend = MockBackend::new().with_refs(args.forward, args.backward);
    if args.fail_caps {
        backend.fail_on("vaQueryVideoProcPipelineCaps");
    }

    let mut vpp = VppFilter::open(backend, options)?;
    vpp.reconfig(&StreamParams::hardware(720, 576, 720, 576))?;
    info!(
        "simulating {} frames, mock refs forward={} backward={}",
        args.stream.frames, args.forward, args.backward
    );

    let fields = args.stream.fields();
    let fps = args.stream.fps;
    let frames = (1..=args.stream.frames).map(|n| {
        mock::hw_frame(SIM_SURFACE_BASE + n, 720, 576)
            .with_fields(fields)
            .with_pts(n as f64 / fps)
    });

    let mut index = 0u32;
    let summary = drive(&mut vpp, frames, |frame| {
        index += 1;
        print_json(&json!({
            "output": index,
            "surface": frame.surface_id(),
            "pts": frame.pts,
            "interlaced": frame.is_interlaced(),
        }))
    })?;

    if args.requests {
        for submission in vpp.backend().submissions() {
            print_json(&json!({
                "request": submission.request,
                "deint_flags": submission.deint_flags.map(|f| f.bits()),
            }))?;
        }
    }

    print_json(&json!({
        "summary": summary,
        "stats": vpp.stats(),
        "queue_depth": {
            "backward": vpp.queue().backward_depth(),
            "forward": vpp.queue().forward_depth(),
        },
    }))
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let options = args.stream.options()?;
    let backend = VaapiBackend::open_device(&args.device).with_context(|| format!("opening {}", args.device))?;
    let mut vpp = VppFilter::open(backend, options)?;
    vpp.reconfig(&StreamParams::software(ImageFormat::Nv12, args.width, args.height))?;

    let fields = args.stream.fields();
    let fps = args.stream.fps;
    let (width, height) = (args.width, args.height);
    let frames = (0..args.stream.frames).map(|n| {
        Frame::from_image(SoftwareImage::filled(ImageFormat::Nv12, width, height, (n * 8) as u8))
            .with_fields(fields)
            .with_pts(n as f64 / fps)
    });

    let summary = drive(&mut vpp, frames, |_| Ok(()))?;
    let created = vpp.pool().map(|p| p.created()).unwrap_or(0);
    print_json(&json!({
        "summary": summary,
        "stats": vpp.stats(),
        "pool_surfaces": created,
    }))
}

/// `RUST_LOG` if set, otherwise info for the library.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vavpp_core=info"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Probe(args) => cmd_probe(args),
        Command::Simulate(args) => cmd_simulate(args),
        Command::Run(args) => cmd_run(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_default_level() {
        std::env::set_var("RUST_LOG", "vavpp_core=trace");
        let filter = log_filter();
        assert_eq!(filter.to_string(), "vavpp_core=trace");
        assert_eq!(filter.max_level_hint(), Some(tracing::level_filters::LevelFilter::TRACE));
    }

    #[test]
    fn stream_flags_follow_options() {
        let cli = Cli::parse_from(["vavpp", "simulate", "--frames", "3", "--bff", "--opts", "deint=weave"]);
        let Command::Simulate(args) = cli.cmd else {
            panic!("expected simulate");
        };
        assert_eq!(args.stream.frames, 3);
        assert_eq!(args.stream.fields(), FieldFlags::INTERLACED);
        assert_eq!(args.stream.options().unwrap().deint, vavpp_core::DeintMode::Weave);
    }
}
