//! ofbench: benchmark a switch over its control channel.
//!
//! # Usage
//!
//! ```bash
//! ofbench --listen 0.0.0.0:6633 --control-device eth0 --data eth1 echo_rtt=count=20
//! ofbench ./target/release/libmy_test.so=threshold=4
//! ```
//!
//! Statistics lines go to stdout; progress and diagnostics go to stderr.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use ofbench::modules::builtin_catalog;
use ofbench::{ChannelSpec, Harness, HarnessConfig, RunEvent, TestOutcome, TestReport};
use ofbench_core::{ControlConfig, UnknownKindPolicy};
use ofbench_registry::{split_reference, DylibLoader, ModuleLoader, ModuleRegistry};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "ofbench")]
#[command(about = "Benchmark a switch over its control channel")]
struct Args {
    /// Address to accept the switch's control connection on
    #[arg(long, default_value = "0.0.0.0:6633")]
    listen: SocketAddr,

    /// Capture device watching the control interface
    #[arg(long, default_value = "lo")]
    control_device: String,

    /// Capture device for a data channel; repeat for more channels
    #[arg(long = "data", short = 'd')]
    data: Vec<String>,

    /// Protocol version byte to accept (e.g. 0x01)
    #[arg(long, default_value = "0x01", value_parser = parse_version)]
    protocol_version: u8,

    /// What to do with a message of unknown kind: abort or drop
    #[arg(long, default_value_t = UnknownKindPolicy::Abort)]
    unknown_kind: UnknownKindPolicy,

    /// Initial size of the control reassembly buffer in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    buffer_capacity: usize,

    /// Milliseconds the traffic generator gets to stop before it is aborted
    #[arg(long, default_value_t = 1000)]
    traffic_grace_ms: u64,

    /// Test modules: a built-in name or a shared object path, optionally
    /// followed by `=args`
    #[arg(required = true)]
    modules: Vec<String>,
}

fn parse_version(raw: &str) -> Result<u8, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid protocol version `{raw}`: {e}"))
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ofbench: failed to create runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ofbench: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn banner(text: &str) {
    eprintln!("-----------------------------------------------");
    eprintln!("{text}");
    eprintln!("-----------------------------------------------");
}

fn print_report(report: &TestReport) {
    for line in report.stats_lines() {
        println!("{line}");
    }
    if let Some(traffic) = &report.traffic {
        println!("{traffic}");
    }
    if let TestOutcome::Skipped(reason) = &report.outcome {
        eprintln!("ofbench: {} skipped: {reason}", report.module);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let catalog = builtin_catalog();
    let dylibs = DylibLoader::new();
    let mut registry = ModuleRegistry::new();
    for spec in &args.modules {
        let (reference, init_args) = split_reference(spec);
        let loader: &dyn ModuleLoader = if catalog.contains(reference) {
            &catalog
        } else {
            &dylibs
        };
        if let Err(e) = registry.load(loader, reference, init_args) {
            eprintln!("ofbench: skipping {reference}: {e}");
        }
    }
    if registry.is_empty() {
        anyhow::bail!("no test module could be loaded");
    }

    let mut channels = vec![ChannelSpec::pcap(args.control_device)];
    channels.extend(args.data.into_iter().map(ChannelSpec::pcap));
    let config = HarnessConfig {
        channels,
        control: ControlConfig {
            protocol_version: args.protocol_version,
            unknown_kind: args.unknown_kind,
            initial_capacity: args.buffer_capacity,
        },
        traffic_grace: Duration::from_millis(args.traffic_grace_ms),
    };

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("cannot listen on {}", args.listen))?;
    eprintln!("ofbench: waiting for the switch on {}", args.listen);
    let (stream, peer) = listener
        .accept()
        .await
        .context("accepting control connection")?;
    stream.set_nodelay(true)?;
    tracing::info!(%peer, "switch connected");

    let mut harness = Harness::new(config, registry);
    harness.connect(stream);

    let total = harness.handles().len();
    eprintln!("Running {} Test{}", total, if total > 1 { "s" } else { "" });
    let reports = harness
        .run(|event| match event {
            RunEvent::Starting { module } => {
                banner(&format!("------------ TEST {module} ----------"));
            }
            RunEvent::Finished(report) => print_report(report),
        })
        .await?;
    if reports
        .last()
        .is_some_and(|r| r.outcome == TestOutcome::ControlClosed)
    {
        eprintln!("ofbench: switch control connection reset, exiting");
        return Ok(());
    }

    banner("---------------    Finished   -----------------");
    Ok(())
}
