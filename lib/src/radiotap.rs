//! Radiotap header codec
//!
//! Radiotap is the variable-length metadata header that precedes raw 802.11
//! frames on the `IEEE802_11_RADIO` data-link type. A little-endian bitmap
//! announces which optional fields follow; every field has a fixed size and
//! must start at a multiple of its alignment, measured from the start of the
//! field area that follows the last present word. Unknown field ids can therefore only be skipped by walking the
//! table of known fields in id order.
use bilge::prelude::*;

use crate::errors::ParseError;
use crate::packet::{Frame, RadioInfo};

/// Size of the fixed part: version, pad, length and the first present word.
const FIXED_HEADER_LENGTH: usize = 8;

/// Bit in a present word announcing that another present word follows.
const PRESENT_EXT: u32 = 1 << 31;

const FIELD_FLAGS: usize = 1;
const FIELD_RATE: usize = 2;
const FIELD_CHANNEL: usize = 3;
const FIELD_DBM_ANTSIGNAL: usize = 5;
const FIELD_DBM_ANTNOISE: usize = 6;
const FIELD_DBM_TX_POWER: usize = 10;

/// Alignment and size of a radiotap data field.
#[derive(Debug, Clone, Copy)]
struct FieldInfo {
    align: usize,
    size: usize,
}

const fn field(align: usize, size: usize) -> FieldInfo {
    FieldInfo { align, size }
}

/// Known fields, indexed by their radiotap id.
const FIELDS: [FieldInfo; 14] = [
    field(8, 8), // TSFT
    field(1, 1), // Flags
    field(1, 1), // Rate
    field(2, 4), // Channel: frequency + channel flags
    field(2, 2), // FHSS
    field(1, 1), // Antenna signal (dBm)
    field(1, 1), // Antenna noise (dBm)
    field(2, 2), // Lock quality
    field(2, 2), // TX attenuation
    field(2, 2), // TX attenuation (dB)
    field(1, 1), // TX power (dBm)
    field(1, 1), // Antenna
    field(1, 1), // Antenna signal (dB)
    field(1, 1), // Antenna noise (dB)
];

const CHANNEL_2GHZ: u16 = 0x0080;
const CHANNEL_5GHZ: u16 = 0x0100;

/// The radiotap Flags field
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, PartialEq)]
pub struct RadiotapFlags {
    pub cfp: bool,
    pub short_preamble: bool,
    pub wep: bool,
    pub fragmentation: bool,
    pub fcs_at_end: bool, // Frame includes its FCS
    pub data_pad: bool,   // Padding between the 802.11 header and payload
    pub bad_fcs: bool,
    pub short_gi: bool,
}

/// Decode a radiotap-prefixed capture into its frame and radio information.
///
/// The returned frame always ends in a checksum: when the Flags field does not
/// announce one, CRC-32 of the frame bytes is appended.
pub fn decode(data: &[u8]) -> Result<(Frame, RadioInfo), ParseError> {
    if data.len() < FIXED_HEADER_LENGTH {
        return Err(ParseError::BufferUnderflow);
    }

    let header_length = u16::from_le_bytes([data[2], data[3]]) as usize;
    if data.len() < header_length || header_length < FIXED_HEADER_LENGTH {
        return Err(ParseError::BufferUnderflow);
    }
    let header = &data[..header_length];

    let present = read_u32(header, 4)?;

    // Only the first present word maps to fields we know; skip the others.
    let mut fields_start = FIXED_HEADER_LENGTH;
    let mut word = present;
    while word & PRESENT_EXT != 0 {
        word = read_u32(header, fields_start)?;
        fields_start += 4;
    }
    let fields = &header[fields_start..];

    let mut info = RadioInfo::default();
    let mut flags = RadiotapFlags::from(0u8);
    let mut offset = 0;
    for (index, field) in FIELDS.iter().enumerate() {
        if present & (1 << index) == 0 {
            continue;
        }
        offset = align(offset, field.align);
        let value = fields
            .get(offset..offset + field.size)
            .ok_or(ParseError::BufferUnderflow)?;

        match index {
            FIELD_FLAGS => flags = RadiotapFlags::from(value[0]),
            FIELD_CHANNEL => info.frequency_mhz = u16::from_le_bytes([value[0], value[1]]),
            FIELD_DBM_ANTSIGNAL => info.signal_power_dbm = value[0] as i8,
            FIELD_DBM_ANTNOISE => info.noise_power_dbm = value[0] as i8,
            FIELD_DBM_TX_POWER => info.transmit_power_dbm = value[0] as i8,
            _ => {}
        }
        offset += field.size;
    }

    if flags.data_pad() {
        return Err(ParseError::UnsupportedFormat("radiotap data padding"));
    }

    let body = &data[header_length..];
    let frame = if flags.fcs_at_end() {
        Frame::from_checksummed(body.to_vec())
    } else {
        Frame::with_checksum(body)
    };

    Ok((frame, info))
}

/// Prefix a frame for injection with a minimal radiotap header.
///
/// The header carries the Flags field (FCS included) and the Rate field, in
/// units of 500 kbit/s.
pub fn encode(frame: &Frame, data_rate: u8) -> Vec<u8> {
    let mut header = HeaderWriter::new();
    header.push(FIELD_FLAGS, &[u8::from(fcs_flags())]);
    header.push(FIELD_RATE, &[data_rate]);
    header.finish(frame)
}

/// Prefix a captured frame with a radiotap header describing how it was received.
///
/// This is the inverse of [`decode`]: decoding the result yields the same frame
/// and radio information.
pub fn encode_capture(frame: &Frame, info: Option<&RadioInfo>) -> Vec<u8> {
    let mut header = HeaderWriter::new();
    header.push(FIELD_FLAGS, &[u8::from(fcs_flags())]);

    if let Some(info) = info {
        let channel_flags = match info.frequency_mhz {
            0 => 0,
            f if f < 3000 => CHANNEL_2GHZ,
            _ => CHANNEL_5GHZ,
        };
        let mut channel = [0u8; 4];
        channel[..2].copy_from_slice(&info.frequency_mhz.to_le_bytes());
        channel[2..].copy_from_slice(&channel_flags.to_le_bytes());

        header.push(FIELD_CHANNEL, &channel);
        header.push(FIELD_DBM_ANTSIGNAL, &[info.signal_power_dbm as u8]);
        header.push(FIELD_DBM_ANTNOISE, &[info.noise_power_dbm as u8]);
        header.push(FIELD_DBM_TX_POWER, &[info.transmit_power_dbm as u8]);
    }

    header.finish(frame)
}

fn fcs_flags() -> RadiotapFlags {
    let mut flags = RadiotapFlags::from(0u8);
    flags.set_fcs_at_end(true);
    flags
}

/// Builds a header from fields pushed in ascending id order.
struct HeaderWriter {
    bytes: Vec<u8>,
    present: u32,
}

impl HeaderWriter {
    fn new() -> Self {
        Self {
            bytes: vec![0; FIXED_HEADER_LENGTH],
            present: 0,
        }
    }

    fn push(&mut self, index: usize, value: &[u8]) {
        let field = FIELDS[index];
        debug_assert_eq!(field.size, value.len());
        debug_assert!(self.present >> index == 0, "fields must be pushed in id order");

        let start = align(self.bytes.len(), field.align);
        self.bytes.resize(start, 0);
        self.bytes.extend_from_slice(value);
        self.present |= 1 << index;
    }

    fn finish(mut self, frame: &Frame) -> Vec<u8> {
        let length = self.bytes.len() as u16;
        self.bytes[2..4].copy_from_slice(&length.to_le_bytes());
        self.bytes[4..8].copy_from_slice(&self.present.to_le_bytes());
        self.bytes.extend_from_slice(frame);
        self.bytes
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(ParseError::BufferUnderflow)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn align(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Beacon for "PickleTown" on channel 11, without its checksum.
    const BEACON_BODY: &[u8] = b"\x80\x00\x00\x00\xff\xff\xff\xff\xff\xff\x2e\xb0\x5d\x27\x56\xa9\x2e\xb0\x5d\x27\x56\xa9\x20\x77\xbb\x6a\x04\xd3\xe0\x00\x00\x00\xc8\x00\x11\x00\x00\x0a\x50\x69\x63\x6b\x6c\x65\x54\x6f\x77\x6e\x01\x08\x82\x84\x8b\x96\x24\x30\x48\x6c\x03\x01\x0b";

    fn beacon() -> Vec<u8> {
        Frame::with_checksum(BEACON_BODY).into_bytes()
    }

    fn header(present: &[u32], fields: &[u8]) -> Vec<u8> {
        let length = 4 + 4 * present.len() + fields.len();
        let mut data = vec![0, 0];
        data.extend_from_slice(&(length as u16).to_le_bytes());
        for word in present {
            data.extend_from_slice(&word.to_le_bytes());
        }
        data.extend_from_slice(fields);
        data
    }

    #[test]
    fn short_buffers_underflow() {
        let full = encode(&Frame::from_checksummed(beacon()), 2);
        for len in 0..FIXED_HEADER_LENGTH {
            assert_eq!(decode(&full[..len]), Err(ParseError::BufferUnderflow));
        }
    }

    #[test]
    fn bad_header_length_underflows() {
        // Claims 7 bytes of header
        let data = [0, 0, 7, 0, 0, 0, 0, 0, 0xaa];
        assert_eq!(decode(&data), Err(ParseError::BufferUnderflow));

        // Claims more header than there is data
        let data = [0, 0, 32, 0, 0, 0, 0, 0, 0xaa];
        assert_eq!(decode(&data), Err(ParseError::BufferUnderflow));
    }

    #[test]
    fn encode_layout() {
        let frame = Frame::from_checksummed(vec![0xde, 0xad, 0xbe, 0xef]);
        let data = encode(&frame, 0x0c);
        assert_eq!(
            data,
            vec![0, 0, 10, 0, 0x06, 0, 0, 0, 0x10, 0x0c, 0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn encode_decode_keeps_frame() {
        let frame = Frame::from_checksummed(beacon());
        let (decoded, info) = decode(&encode(&frame, 2)).expect("decode radiotap");
        assert_eq!(decoded, frame);
        assert_eq!(info, RadioInfo::default());
    }

    #[test]
    fn missing_fcs_flag_appends_checksum() {
        let body = BEACON_BODY;
        let mut data = header(&[1 << FIELD_DBM_ANTSIGNAL], &[0xd6]);
        data.extend_from_slice(body);

        let (frame, info) = decode(&data).expect("decode radiotap");
        assert_eq!(frame.len(), body.len() + 4);
        assert_eq!(frame.body(), body);
        assert_eq!(frame.checksum(), Some(crc32fast::hash(body)));
        assert_eq!(info.signal_power_dbm, -42);
    }

    #[test]
    fn present_fcs_flag_keeps_frame() {
        let mut data = header(&[1 << FIELD_FLAGS], &[0x10]);
        data.extend_from_slice(&beacon());

        let (frame, _) = decode(&data).expect("decode radiotap");
        assert_eq!(frame.as_bytes(), &beacon()[..]);
        assert!(frame.has_valid_checksum());
    }

    #[test]
    fn aligned_fields() {
        let present = (1 << 0)
            | (1 << FIELD_FLAGS)
            | (1 << FIELD_CHANNEL)
            | (1 << FIELD_DBM_ANTSIGNAL)
            | (1 << FIELD_DBM_ANTNOISE)
            | (1 << FIELD_DBM_TX_POWER);
        let mut fields = Vec::new();
        fields.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes()); // TSFT, offset 8
        fields.push(0x10); // flags, offset 16
        fields.push(0); // padding for the channel
        fields.extend_from_slice(&2462u16.to_le_bytes()); // channel, offset 18
        fields.extend_from_slice(&0x00a0u16.to_le_bytes());
        fields.push(0xc4); // -60 dBm signal
        fields.push(0x9c); // -100 dBm noise
        fields.push(0x0f); // 15 dBm transmit power
        let mut data = header(&[present], &fields);
        assert_eq!(data.len(), 25);
        data.extend_from_slice(&beacon());

        let (frame, info) = decode(&data).expect("decode radiotap");
        assert_eq!(frame.as_bytes(), &beacon()[..]);
        assert_eq!(
            info,
            RadioInfo {
                frequency_mhz: 2462,
                noise_power_dbm: -100,
                signal_power_dbm: -60,
                transmit_power_dbm: 15,
            }
        );
    }

    #[test]
    fn extended_present_word() {
        let mut fields = Vec::new();
        fields.extend_from_slice(&5180u16.to_le_bytes());
        fields.extend_from_slice(&0x0140u16.to_le_bytes());
        let mut data = header(&[PRESENT_EXT | (1 << FIELD_CHANNEL), 0], &fields);
        data.extend_from_slice(&beacon());

        let (frame, info) = decode(&data).expect("decode radiotap");
        assert_eq!(info.frequency_mhz, 5180);
        // No Flags field, so a checksum is appended to the (already checksummed) bytes
        assert_eq!(frame.len(), beacon().len() + 4);
    }

    #[test]
    fn alignment_counts_from_field_area() {
        // Two present words put the field area at 12, which already suits TSFT.
        let mut fields = Vec::new();
        fields.extend_from_slice(&7u64.to_le_bytes()); // TSFT, offset 12
        fields.push(0xba); // -70 dBm, offset 20
        let mut data = header(&[PRESENT_EXT | 1 | (1 << FIELD_DBM_ANTSIGNAL), 0], &fields);
        assert_eq!(data.len(), 21);
        data.extend_from_slice(&beacon());

        let (_, info) = decode(&data).expect("decode radiotap");
        assert_eq!(info.signal_power_dbm, -70);
    }

    #[test]
    fn tsft_after_flags_pads_within_field_area() {
        let mut fields = vec![0x10]; // flags, offset 12
        fields.extend_from_slice(&[0; 7]);
        fields.extend_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes()); // TSFT, offset 20
        fields.push(0xc4); // -60 dBm, offset 28
        let mut data = header(
            &[PRESENT_EXT | 1 | (1 << FIELD_FLAGS) | (1 << FIELD_DBM_ANTSIGNAL), 0],
            &fields,
        );
        assert_eq!(data.len(), 29);
        data.extend_from_slice(&beacon());

        let (frame, info) = decode(&data).expect("decode radiotap");
        assert_eq!(info.signal_power_dbm, -60);
        assert_eq!(frame.as_bytes(), &beacon()[..]);
    }

    #[test]
    fn chained_present_words() {
        let mut data = header(
            &[PRESENT_EXT | (1 << FIELD_FLAGS), PRESENT_EXT, 0],
            &[0x10],
        );
        data.extend_from_slice(&beacon());

        let (frame, _) = decode(&data).expect("decode radiotap");
        assert_eq!(frame.as_bytes(), &beacon()[..]);
    }

    #[test]
    fn truncated_present_words_underflow() {
        let data = header(&[PRESENT_EXT], &[]);
        assert_eq!(decode(&data), Err(ParseError::BufferUnderflow));
    }

    #[test]
    fn field_past_header_underflows() {
        // Channel announced, but only 2 of its 4 bytes are inside the header
        let mut data = header(&[1 << FIELD_CHANNEL], &[0x6c, 0x09]);
        data.extend_from_slice(&beacon());
        assert_eq!(decode(&data), Err(ParseError::BufferUnderflow));
    }

    #[test]
    fn data_padding_is_unsupported() {
        let mut data = header(&[1 << FIELD_FLAGS], &[0x30]);
        data.extend_from_slice(&beacon());
        assert!(matches!(
            decode(&data),
            Err(ParseError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn capture_encoding_round_trip() {
        let frame = Frame::from_checksummed(beacon());
        let info = RadioInfo {
            frequency_mhz: 2437,
            noise_power_dbm: -95,
            signal_power_dbm: -51,
            transmit_power_dbm: 20,
        };

        let data = encode_capture(&frame, Some(&info));
        // flags at 8, pad at 9, channel at 10..14, signal, noise, tx power
        assert_eq!(u16::from_le_bytes([data[2], data[3]]), 17);

        let (decoded, decoded_info) = decode(&data).expect("decode radiotap");
        assert_eq!(decoded, frame);
        assert_eq!(decoded_info, info);
    }

    #[test]
    fn capture_encoding_without_info() {
        let frame = Frame::from_checksummed(beacon());
        let data = encode_capture(&frame, None);
        assert_eq!(&data[..9], &[0, 0, 9, 0, 0x02, 0, 0, 0, 0x10]);
    }

    #[test]
    fn flags_bits() {
        let flags = RadiotapFlags::from(0x30u8);
        assert!(flags.fcs_at_end());
        assert!(flags.data_pad());
        assert!(!flags.bad_fcs());
        assert_eq!(u8::from(fcs_flags()), 0x10);
    }
}
