mod bpf;
mod channel;
mod demux;
#[cfg(feature = "pcap_dump")]
mod dump;
mod errors;
mod handle;
mod ifconfig;
mod packet;
pub mod radiotap;
mod stream;

// Public re-export
pub use crate::bpf::{open_first, BpfDevice, Descriptor, DeviceConfig, Request, DEFAULT_TX_RATE};
#[cfg(unix)]
pub use crate::bpf::{open_device, BpfFd};
pub use crate::channel::{resolve_channel, Channel, ChannelController, ChannelWidth};
pub use crate::demux::{decode_payload, record_ranges, split, DataLink};
#[cfg(feature = "pcap_dump")]
pub use crate::dump::PcapDump;
pub use crate::errors::{CaptureError, ChannelError, ParseError};
pub use crate::handle::{CaptureSource, Handle};
#[cfg(unix)]
pub use crate::handle::{open_handle, BpfHandle};
pub use crate::ifconfig::{parse_channel_list, parse_current_channel, IfconfigController};
pub use crate::packet::{CapturedPacket, Frame, RadioInfo, FCS_LENGTH};
pub use crate::stream::{FrameStream, PacketSink};
