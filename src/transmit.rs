use anyhow::{Context, Result, bail};
use pnet::datalink::{self, Channel, DataLinkSender, NetworkInterface};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::pacer::SendPacer;

/// Destination for serialized frames
pub trait FrameSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Human-readable target, used in log lines
    fn target(&self) -> &str;
}

/// Raw link-layer sender bound to one network interface
pub struct InterfaceSink {
    interface: NetworkInterface,
    tx: Box<dyn DataLinkSender>,
}

/// Look up an interface by name without opening anything on it
pub fn find_interface(name: &str) -> Result<NetworkInterface> {
    let interfaces = datalink::interfaces();

    match interfaces.iter().find(|iface| iface.name == name) {
        Some(interface) => Ok(interface.clone()),
        None => {
            let available: Vec<&str> = interfaces.iter().map(|iface| iface.name.as_str()).collect();
            bail!(
                "Network interface {} not found (available: {})",
                name,
                available.join(", ")
            )
        }
    }
}

impl InterfaceSink {
    pub fn open(name: &str) -> Result<Self> {
        let interface = find_interface(name)?;

        if !interface.is_up() {
            warn!("Interface {} is not up, frames may be dropped", interface.name);
        }
        debug!(
            "Opening datalink channel on {} (index {}, mac {:?})",
            interface.name, interface.index, interface.mac
        );

        let channel = datalink::channel(&interface, datalink::Config::default()).with_context(|| {
            format!(
                "Failed to open raw channel on {} (requires root or CAP_NET_RAW)",
                interface.name
            )
        })?;

        let tx = match channel {
            Channel::Ethernet(tx, _rx) => tx,
            _ => bail!("Unsupported datalink channel type on {}", interface.name),
        };

        Ok(Self { interface, tx })
    }
}

impl FrameSink for InterfaceSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        match self.tx.send_to(frame, None) {
            Some(result) => {
                result.with_context(|| format!("Failed to send frame on {}", self.interface.name))
            }
            None => bail!("No send buffer available on {}", self.interface.name),
        }
    }

    fn target(&self) -> &str {
        &self.interface.name
    }
}

/// How many times, and how fast, to emit the frame
#[derive(Debug, Clone)]
pub struct SendPlan {
    /// Number of sends when not looping; a value below 1 still sends once
    pub count: u64,
    /// Repeat until the running flag is cleared
    pub forever: bool,
    /// Delay between consecutive sends
    pub inter: Duration,
}

impl SendPlan {
    /// More than one send is planned, so an interrupt can cut the run short
    pub fn repeats(&self) -> bool {
        self.forever || self.count > 1
    }
}

impl Default for SendPlan {
    fn default() -> Self {
        Self {
            count: 1,
            forever: false,
            inter: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct TransmitReport {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

impl TransmitReport {
    pub fn log_summary(&self, target: &str) {
        info!("======= INJECTION SUMMARY =======");
        info!("Target: {}", target);
        info!("Frames sent: {}", self.frames_sent);
        info!("Bytes sent: {}", self.bytes_sent);
        info!("Total time: {:.3} seconds", self.elapsed.as_secs_f64());
        info!("=================================");
    }
}

/// Send `frame` to `sink` according to `plan`.
///
/// The frame always goes out at least once. The first failed send aborts the
/// run and is returned as is.
pub fn transmit<S: FrameSink + ?Sized>(
    sink: &mut S,
    frame: &[u8],
    plan: &SendPlan,
    running: &AtomicBool,
) -> Result<TransmitReport> {
    let mut pacer = SendPacer::new(plan.inter);
    let mut report = TransmitReport::default();
    let start_time = Instant::now();

    let interrupted = |sent: u64| sent > 0 && !running.load(Ordering::Relaxed);

    loop {
        if interrupted(report.frames_sent) {
            info!("Interrupted after {} frames", report.frames_sent);
            break;
        }

        pacer.acquire();

        // Ctrl+C may land while waiting out the inter-send delay
        if interrupted(report.frames_sent) {
            info!("Interrupted after {} frames", report.frames_sent);
            break;
        }

        sink.send_frame(frame)?;

        report.frames_sent += 1;
        report.bytes_sent += frame.len() as u64;
        debug!(
            "Sent frame #{} ({} bytes) to {}",
            report.frames_sent,
            frame.len(),
            sink.target()
        );

        if !plan.forever && report.frames_sent >= plan.count {
            break;
        }
    }

    report.elapsed = start_time.elapsed();
    Ok(report)
}
