//! Frame and packet structs used throughout the library.
use std::ops::Deref;

/// Length of the 802.11 frame check sequence.
pub const FCS_LENGTH: usize = 4;

/// An 802.11 frame, always including its trailing 4-byte checksum.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Build a frame from bytes that lack a checksum by appending CRC-32 of them.
    pub fn with_checksum(data: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(data.len() + FCS_LENGTH);
        bytes.extend_from_slice(data);
        bytes.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
        Frame(bytes)
    }

    /// Wrap bytes which already end in a checksum. The checksum is not verified.
    pub fn from_checksummed(bytes: Vec<u8>) -> Self {
        Frame(bytes)
    }

    /// The trailing checksum, if the frame is long enough to hold one.
    pub fn checksum(&self) -> Option<u32> {
        let start = self.0.len().checked_sub(FCS_LENGTH)?;
        let mut fcs = [0u8; FCS_LENGTH];
        fcs.copy_from_slice(&self.0[start..]);
        Some(u32::from_le_bytes(fcs))
    }

    /// Whether the trailing checksum matches the frame contents.
    pub fn has_valid_checksum(&self) -> bool {
        self.checksum() == Some(crc32fast::hash(self.body()))
    }

    /// Frame bytes without the trailing checksum.
    pub fn body(&self) -> &[u8] {
        &self.0[..self.0.len().saturating_sub(FCS_LENGTH)]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Supplemental radio information some hardware reports with each frame.
///
/// Fields the hardware does not report are 0.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct RadioInfo {
    /// Center frequency of the channel in MHz
    pub frequency_mhz: u16,
    /// Noise power in dBm
    pub noise_power_dbm: i8,
    /// Signal power in dBm
    pub signal_power_dbm: i8,
    /// Absolute transmit power at the antenna port in dBm
    pub transmit_power_dbm: i8,
}

/// A frame read from the capture device, with radio information when the
/// active data-link type carries it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CapturedPacket {
    frame: Frame,
    radio_info: Option<RadioInfo>,
}

impl CapturedPacket {
    pub(crate) fn new(frame: Frame, radio_info: Option<RadioInfo>) -> Self {
        Self { frame, radio_info }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn radio_info(&self) -> Option<&RadioInfo> {
        self.radio_info.as_ref()
    }

    pub fn into_parts(self) -> (Frame, Option<RadioInfo>) {
        (self.frame, self.radio_info)
    }
}
