//! WLAN channels and the capability used to tune the radio.
//!
//! Tuning is not done through the capture descriptor. Whatever talks to the
//! OS control plane implements [`ChannelController`] and is handed to the
//! [`Handle`](crate::Handle) when it is opened.
use std::fmt;

use crate::errors::ChannelError;

/// Width of a WLAN channel.
#[derive(Debug, Default, Eq, PartialEq, Hash, Copy, Clone)]
pub enum ChannelWidth {
    /// Width not given; the controller picks one it supports.
    #[default]
    Unspecified,
    Mhz20,
    Mhz40,
}

impl ChannelWidth {
    /// Width for the given number of megahertz.
    ///
    /// Only 20 and 40 MHz are represented; any other input is `Unspecified`.
    pub fn from_megahertz(mhz: u32) -> Self {
        match mhz {
            20 => ChannelWidth::Mhz20,
            40 => ChannelWidth::Mhz40,
            _ => ChannelWidth::Unspecified,
        }
    }

    /// Get width in megahertz, 0 when unspecified.
    pub fn megahertz(self) -> u32 {
        match self {
            ChannelWidth::Mhz20 => 20,
            ChannelWidth::Mhz40 => 40,
            ChannelWidth::Unspecified => 0,
        }
    }
}

/// A WiFi channel: its number and the width of its frequency range.
#[derive(Debug, Default, Eq, PartialEq, Hash, Copy, Clone)]
pub struct Channel {
    pub number: u32,
    pub width: ChannelWidth,
}

impl Channel {
    pub fn new(number: u32, width: ChannelWidth) -> Self {
        Self { number, width }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.width {
            ChannelWidth::Unspecified => write!(f, "{}", self.number),
            width => write!(f, "{} ({} MHz)", self.number, width.megahertz()),
        }
    }
}

/// Control-plane access to the radio behind a capture interface.
///
/// Implementations must tolerate `release` being called more than once.
pub trait ChannelController: Send + Sync {
    /// Channels the interface can be tuned to.
    fn supported_channels(&self) -> Result<Vec<Channel>, ChannelError>;

    /// Channel the interface is currently tuned to.
    fn current_channel(&self) -> Result<Channel, ChannelError>;

    /// Tune the interface to `channel`. The width is always specified here.
    fn set_channel(&self, channel: Channel) -> Result<(), ChannelError>;

    /// Give back any OS resources held by the controller.
    fn release(&mut self);
}

/// Resolve a requested channel against the supported set.
///
/// A request with an explicit width must match exactly. An unspecified width
/// takes the first supported channel with the same number.
pub fn resolve_channel(requested: Channel, supported: &[Channel]) -> Result<Channel, ChannelError> {
    supported
        .iter()
        .copied()
        .find(|candidate| match requested.width {
            ChannelWidth::Unspecified => candidate.number == requested.number,
            _ => *candidate == requested,
        })
        .ok_or(ChannelError::Unsupported(requested))
}
