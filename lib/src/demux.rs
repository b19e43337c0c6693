//! Splitting of batched capture reads
//!
//! A single read from the capture device returns every record buffered since
//! the last read, back to back. Each record starts with a `bpf_hdr`:
//!
//! ```text
//! 0        8            12           16          18
//! | tstamp | caplen u32 | datlen u32 | hdrlen u16 | ... padding ... | payload |
//! ```
//!
//! The payload starts `hdrlen` bytes into the record and is `caplen` bytes
//! long. The next record starts at the next 4-byte boundary after it.
use std::ops::Range;

use crate::errors::ParseError;
use crate::packet::{CapturedPacket, Frame};
use crate::radiotap;

/// Smallest number of remaining bytes that can hold another record header.
const MIN_RECORD_LENGTH: usize = 18;

const CAPLEN_OFFSET: usize = 8;
const DATALEN_OFFSET: usize = 12;
const HDRLEN_OFFSET: usize = 16;

/// Format the capture device delivers frames in.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum DataLink {
    /// 802.11 frames prefixed with a radiotap header (`DLT_IEEE802_11_RADIO`)
    Radiotap,
    /// Bare 802.11 frames without a checksum (`DLT_IEEE802_11`)
    Ieee80211,
}

impl DataLink {
    /// The `DLT_*` value of this data-link type.
    pub fn dlt(self) -> u32 {
        match self {
            DataLink::Radiotap => 127,
            DataLink::Ieee80211 => 105,
        }
    }

    /// Whether captures on this data-link type carry radio information.
    pub fn has_radio_info(self) -> bool {
        self == DataLink::Radiotap
    }
}

/// Locate the payload of every record in a read buffer.
///
/// Returns byte ranges into `data`, in record order. Trailing bytes too short
/// to hold a record header are ignored.
pub fn record_ranges(data: &[u8]) -> Result<Vec<Range<usize>>, ParseError> {
    if data.is_empty() {
        return Err(ParseError::BufferUnderflow);
    }

    let mut ranges = Vec::with_capacity(1);
    let mut offset = 0;
    while data.len() - offset >= MIN_RECORD_LENGTH {
        let record = &data[offset..];
        let captured_length = read_u32(record, CAPLEN_OFFSET);
        let original_length = read_u32(record, DATALEN_OFFSET);
        let header_length = u16::from_le_bytes([record[HDRLEN_OFFSET], record[HDRLEN_OFFSET + 1]]);

        // Lengths past i32::MAX cannot describe anything our buffer holds.
        // A record header is never shorter than the fixed bpf_hdr fields.
        if (captured_length as i32) < 0
            || (original_length as i32) < 0
            || (header_length as usize) < MIN_RECORD_LENGTH
        {
            return Err(ParseError::BufferUnderflow);
        }

        let start = offset + header_length as usize;
        let end = start + captured_length as usize;
        if end > data.len() {
            return Err(ParseError::BufferUnderflow);
        }

        ranges.push(start..end);
        offset = align4(end);
        if offset >= data.len() {
            break;
        }
    }

    Ok(ranges)
}

/// Split a read buffer into captured packets.
///
/// Payloads are decoded according to `datalink`. Any malformed record fails
/// the whole batch.
pub fn split(data: &[u8], datalink: DataLink) -> Result<Vec<CapturedPacket>, ParseError> {
    record_ranges(data)?
        .into_iter()
        .map(|range| decode_payload(&data[range], datalink))
        .collect()
}

/// Decode the payload of a single capture record.
pub fn decode_payload(payload: &[u8], datalink: DataLink) -> Result<CapturedPacket, ParseError> {
    match datalink {
        DataLink::Radiotap => {
            let (frame, info) = radiotap::decode(payload)?;
            Ok(CapturedPacket::new(frame, Some(info)))
        }
        // This data-link type never includes the checksum.
        DataLink::Ieee80211 => Ok(CapturedPacket::new(Frame::with_checksum(payload), None)),
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}
