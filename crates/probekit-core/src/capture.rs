use crate::packet::Packet;
use std::fs::File;
use std::io;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Receives a copy of every packet read from a channel.
pub trait CaptureSink {
    fn capture(&mut self, packet: &Packet) -> io::Result<()>;
}

/// The classic pcap magic number (microsecond timestamps).
const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65535;

/// Raw IP frames, no link layer header.
const LINKTYPE_RAW: u32 = 101;

/// Writes captured packets in the classic pcap format.
///
/// The file header is written on construction and every packet becomes a single record
/// timestamped with the wall clock time at which it was captured.
pub struct PcapWriter<W: Write> {
    inner: W,
}

impl PcapWriter<BufWriter<File>> {
    /// Create (or truncate) a pcap file at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut inner: W) -> io::Result<Self> {
        inner.write_all(&PCAP_MAGIC.to_le_bytes())?;
        inner.write_all(&PCAP_VERSION_MAJOR.to_le_bytes())?;
        inner.write_all(&PCAP_VERSION_MINOR.to_le_bytes())?;
        inner.write_all(&0_i32.to_le_bytes())?;
        inner.write_all(&0_u32.to_le_bytes())?;
        inner.write_all(&PCAP_SNAPLEN.to_le_bytes())?;
        inner.write_all(&LINKTYPE_RAW.to_le_bytes())?;
        Ok(Self { inner })
    }

    /// Write a single record with an explicit timestamp.
    pub fn write_record(&mut self, packet: &Packet, timestamp: SystemTime) -> io::Result<()> {
        let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
        let seconds = u32::try_from(since_epoch.as_secs()).unwrap_or(u32::MAX);
        let captured = &packet.as_bytes()[..packet.len().min(PCAP_SNAPLEN as usize)];
        let captured_len = u32::try_from(captured.len()).unwrap_or(PCAP_SNAPLEN);
        let original_len = u32::try_from(packet.len()).unwrap_or(u32::MAX);
        self.inner.write_all(&seconds.to_le_bytes())?;
        self.inner
            .write_all(&since_epoch.subsec_micros().to_le_bytes())?;
        self.inner.write_all(&captured_len.to_le_bytes())?;
        self.inner.write_all(&original_len.to_le_bytes())?;
        self.inner.write_all(captured)?;
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> CaptureSink for PcapWriter<W> {
    fn capture(&mut self, packet: &Packet) -> io::Result<()> {
        self.write_record(packet, SystemTime::now())
    }
}
