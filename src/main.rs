use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

mod dissect;
mod pacer;
mod pcap_dump;
mod probe;
mod transmit;
mod watch;

use pcap_dump::PcapDumpSink;
use probe::ProbeSpec;
use transmit::{InterfaceSink, SendPlan, transmit};
use watch::WatchConfig;

const DEFAULT_INTERFACE: &str = "veth0";
const DEFAULT_INTER_SECONDS: f64 = 0.2;

#[derive(Parser, Debug)]
#[command(name = "dns-inject")]
#[command(about = "Inject a fixed DNS query frame onto a network interface")]
#[command(version = "1.0.0")]
struct Cli {
    /// Defaults to `send` with its default options
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose logging (default: false)
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send the DNS query frame on an interface
    Send(SendArgs),
    /// Write the DNS query frame to a PCAP file instead of the wire
    Dump {
        /// Output PCAP file path
        #[arg(short, long)]
        output: PathBuf,

        /// Number of copies to write
        #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        count: u64,
    },
    /// Capture on an interface and count frames matching the DNS query
    Watch {
        /// Interface to capture on
        #[arg(short, long, default_value = DEFAULT_INTERFACE)]
        iface: String,

        /// Capture duration in seconds
        #[arg(short, long, default_value_t = 5)]
        duration: u64,

        /// Fail unless exactly this many matching frames are seen
        #[arg(short, long)]
        expect: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Interface to transmit on
    #[arg(short, long, default_value = DEFAULT_INTERFACE)]
    iface: String,

    /// Number of times to send the frame
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    count: u64,

    /// Repeat until interrupted with Ctrl+C
    #[arg(long)]
    r#loop: bool,

    /// Delay between repeated sends, in seconds
    #[arg(long, default_value_t = DEFAULT_INTER_SECONDS)]
    inter: f64,
}

impl Default for SendArgs {
    fn default() -> Self {
        Self {
            iface: DEFAULT_INTERFACE.to_string(),
            count: 1,
            r#loop: false,
            inter: DEFAULT_INTER_SECONDS,
        }
    }
}

fn parse_inter(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("Invalid inter-send delay: {} seconds", seconds))
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down...");
        running_clone.store(false, Ordering::Relaxed);
    })
    .context("Failed to install Ctrl+C handler")?;

    Ok(running)
}

fn run_send(args: SendArgs) -> Result<()> {
    let spec = ProbeSpec::default();
    let frame = spec.build_frame()?;
    let plan = SendPlan {
        count: args.count,
        forever: args.r#loop,
        inter: parse_inter(args.inter)?,
    };

    info!("Injecting DNS query for {} on {}", spec.qname, args.iface);
    debug!("Send plan: {:?}", plan);

    let mut sink = InterfaceSink::open(&args.iface)?;

    let running = if plan.repeats() {
        interrupt_flag()?
    } else {
        Arc::new(AtomicBool::new(true))
    };

    let report = transmit(&mut sink, &frame, &plan, &running)?;
    report.log_summary(&args.iface);

    Ok(())
}

fn run_dump(output: PathBuf, count: u64) -> Result<()> {
    let spec = ProbeSpec::default();
    let frame = spec.build_frame()?;
    let plan = SendPlan {
        count,
        forever: false,
        inter: Duration::ZERO,
    };

    info!("Writing DNS query for {} to {}", spec.qname, output.display());

    let mut sink = PcapDumpSink::create(&output)?;
    transmit(&mut sink, &frame, &plan, &AtomicBool::new(true))?;
    sink.finish()?;

    Ok(())
}

fn run_watch(iface: String, duration: u64, expect: Option<u64>) -> Result<()> {
    let spec = ProbeSpec::default();
    let config = WatchConfig::new(&iface, Duration::from_secs(duration));
    let running = interrupt_flag()?;

    let report = watch::watch(&config, &spec, &running)?;

    if let Some(expected) = expect {
        if report.matches != expected {
            bail!(
                "Expected {} matching frames on {}, saw {}",
                expected,
                iface,
                report.matches
            );
        }
        info!("Saw the expected {} matching frames", expected);
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command.unwrap_or_else(|| Commands::Send(SendArgs::default())) {
        Commands::Send(args) => run_send(args),
        Commands::Dump { output, count } => run_dump(output, count),
        Commands::Watch {
            iface,
            duration,
            expect,
        } => run_watch(iface, duration, expect),
    }
}
