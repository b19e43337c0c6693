//! Writing captured packets to pcap savefiles
//!
//! Packets are stored with linktype `IEEE802_11_RADIOTAP`, so radio information
//! survives when present. Frames are written including their checksum.
use pcap::{Capture, Linktype, Packet, PacketHeader, Savefile};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::packet::CapturedPacket;
use crate::radiotap;

/// A pcap savefile receiving captured packets.
pub struct PcapDump {
    savefile: Savefile,
}

impl PcapDump {
    /// Create (or truncate) a savefile at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, pcap::Error> {
        log::trace!("Creating pcap dump at {}", path.as_ref().display());
        let savefile = Capture::dead(Linktype::IEEE802_11_RADIOTAP)?.savefile(path)?;
        Ok(Self { savefile })
    }

    /// Append a packet, timestamped with the current time.
    pub fn write(&mut self, packet: &CapturedPacket) {
        let data = radiotap::encode_capture(packet.frame(), packet.radio_info());
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let header = PacketHeader {
            ts: libc::timeval {
                tv_sec: since_epoch.as_secs() as libc::time_t,
                tv_usec: since_epoch.subsec_micros() as libc::suseconds_t,
            },
            caplen: data.len() as u32,
            len: data.len() as u32,
        };
        self.savefile.write(&Packet::new(&header, &data));
    }

    pub fn flush(&mut self) -> Result<(), pcap::Error> {
        self.savefile.flush()
    }
}
