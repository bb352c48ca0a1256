use anyhow::{Context, Result};
use pcap::{Capture, Dead, Linktype, Packet, PacketHeader, Savefile};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::transmit::FrameSink;

/// Writes frames to a pcap savefile instead of the wire
pub struct PcapDumpSink {
    // Dropped before the handle it was opened from
    savefile: Savefile,
    _capture: Capture<Dead>,
    target: String,
    path: PathBuf,
    packets_written: u64,
}

impl PcapDumpSink {
    pub fn create(path: &Path) -> Result<Self> {
        debug!("Creating PCAP file with libpcap: {}", path.display());

        let capture =
            Capture::dead(Linktype::ETHERNET).context("Failed to create pcap handle for writing")?;
        let savefile = capture
            .savefile(path)
            .with_context(|| format!("Failed to create PCAP file: {}", path.display()))?;

        Ok(Self {
            savefile,
            _capture: capture,
            target: path.display().to_string(),
            path: path.to_path_buf(),
            packets_written: 0,
        })
    }

    /// Flush buffered packets to disk and return how many were written
    pub fn finish(mut self) -> Result<u64> {
        self.savefile
            .flush()
            .with_context(|| format!("Failed to flush PCAP file: {}", self.path.display()))?;

        info!(
            "PCAP file written to: {} ({} packets)",
            self.path.display(),
            self.packets_written
        );
        Ok(self.packets_written)
    }
}

impl FrameSink for PcapDumpSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let length = u32::try_from(frame.len()).context("Frame too large for PCAP record")?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let header = PacketHeader {
            ts: libc::timeval {
                tv_sec: timestamp.as_secs() as libc::time_t,
                tv_usec: timestamp.subsec_micros() as libc::suseconds_t,
            },
            caplen: length,
            len: length,
        };

        self.savefile.write(&Packet::new(&header, frame));
        self.packets_written += 1;
        Ok(())
    }

    fn target(&self) -> &str {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissect::dissect;
    use crate::probe::ProbeSpec;
    use crate::transmit::{SendPlan, transmit};
    use pcap::Error as PcapError;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn read_frames(path: &Path) -> Vec<Vec<u8>> {
        let mut capture = Capture::from_file(path).unwrap();
        assert_eq!(capture.get_datalink(), Linktype::ETHERNET);

        let mut frames = Vec::new();
        loop {
            match capture.next_packet() {
                Ok(packet) => frames.push(packet.data.to_vec()),
                Err(PcapError::NoMorePackets) => break,
                Err(e) => panic!("Error reading packet: {}", e),
            }
        }
        frames
    }

    #[test]
    fn test_dump_single_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.pcap");
        let spec = ProbeSpec::default();
        let frame = spec.build_frame().unwrap();

        let mut sink = PcapDumpSink::create(&path).unwrap();
        let report =
            transmit(&mut sink, &frame, &SendPlan::default(), &AtomicBool::new(true)).unwrap();
        assert_eq!(report.frames_sent, 1);
        assert_eq!(sink.finish().unwrap(), 1);

        let frames = read_frames(&path);
        assert_eq!(frames, vec![frame]);
        assert!(dissect(&frames[0]).unwrap().matches(&spec));
    }

    #[test]
    fn test_dump_counted_sends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burst.pcap");
        let frame = ProbeSpec::default().build_frame().unwrap();
        let plan = SendPlan {
            count: 3,
            forever: false,
            inter: Duration::ZERO,
        };

        let mut sink = PcapDumpSink::create(&path).unwrap();
        transmit(&mut sink, &frame, &plan, &AtomicBool::new(true)).unwrap();
        sink.finish().unwrap();

        assert_eq!(read_frames(&path).len(), 3);
    }

    #[test]
    fn test_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("probe.pcap");
        assert!(PcapDumpSink::create(&path).is_err());
    }
}
