use anyhow::{Context, Result};
use pcap::{Capture, Error as PcapError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::dissect::dissect;
use crate::probe::ProbeSpec;

/// Live capture settings for verifying an injection
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub interface: String,
    pub duration: Duration,
    pub filter: String,
    pub read_timeout_ms: i32,
}

impl WatchConfig {
    pub fn new(interface: &str, duration: Duration) -> Self {
        Self {
            interface: interface.to_string(),
            duration,
            filter: "udp".to_string(),
            read_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchReport {
    pub frames_seen: u64,
    pub dns_frames: u64,
    pub matches: u64,
}

impl WatchReport {
    /// Account for one captured frame, returning whether it is the probe
    pub fn observe(&mut self, frame: &[u8], spec: &ProbeSpec) -> bool {
        self.frames_seen += 1;

        let summary = match dissect(frame) {
            Some(summary) => summary,
            None => return false,
        };
        self.dns_frames += 1;

        if summary.matches(spec) {
            self.matches += 1;
            info!(
                "Probe #{}: {} -> {} {}:{} -> {}:{} rd={} ip_csum_ok={} udp_csum_ok={}",
                self.matches,
                summary.src_mac,
                summary.dst_mac,
                summary.src_ip,
                summary.src_port,
                summary.dst_ip,
                summary.dst_port,
                summary.recursion_desired,
                summary.ipv4_checksum_ok,
                summary.udp_checksum_ok
            );
            true
        } else {
            debug!(
                "Ignoring DNS frame {}:{} -> {}:{} ({} questions)",
                summary.src_ip,
                summary.src_port,
                summary.dst_ip,
                summary.dst_port,
                summary.questions.len()
            );
            false
        }
    }
}

/// End of the capture window; `None` when it lies beyond what `Instant` can hold
fn capture_deadline(start: Instant, duration: Duration) -> Option<Instant> {
    start.checked_add(duration)
}

/// Capture on an interface for a bounded time and count probe frames
pub fn watch(config: &WatchConfig, spec: &ProbeSpec, running: &AtomicBool) -> Result<WatchReport> {
    info!(
        "Watching {} for {:.1} seconds (filter: {})",
        config.interface,
        config.duration.as_secs_f64(),
        config.filter
    );

    let mut capture = Capture::from_device(config.interface.as_str())
        .with_context(|| format!("Failed to create capture on {}", config.interface))?
        .promisc(true)
        .snaplen(65535)
        .timeout(config.read_timeout_ms)
        .immediate_mode(true)
        .open()
        .with_context(|| format!("Failed to open capture on {}", config.interface))?;

    capture
        .filter(&config.filter, true)
        .with_context(|| format!("Invalid BPF filter: {}", config.filter))?;

    let mut report = WatchReport::default();
    let deadline = capture_deadline(Instant::now(), config.duration);

    while deadline.is_none_or(|deadline| Instant::now() < deadline)
        && running.load(Ordering::Relaxed)
    {
        match capture.next_packet() {
            Ok(packet) => {
                report.observe(packet.data, spec);
            }
            Err(PcapError::TimeoutExpired) => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Capture on {} failed", config.interface));
            }
        }
    }

    info!(
        "Watch finished: {} frames, {} DNS, {} matching probe",
        report.frames_seen, report.dns_frames, report.matches
    );

    Ok(report)
}
