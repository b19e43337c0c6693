use clap::{Args, Parser, Subcommand};
use rawfi_lib::{Channel, ChannelWidth, DeviceConfig, DEFAULT_TX_RATE};
use simplelog::LevelFilter;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Log level for output (error, warn, info, debug, trace)
    #[arg(global = true, long, default_value = "info", value_enum)]
    pub loglevel: LevelFilter,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture raw 802.11 frames from an interface. Must be executed as root.
    Sniff(SniffArgs),

    /// Inject a raw 802.11 frame. Must be executed as root.
    Inject(InjectArgs),

    /// List the channels an interface supports
    Channels(ChannelsArgs),
}

/// Capture device settings shared by the capturing subcommands.
#[derive(Args)]
pub struct DeviceArgs {
    /// Network interface to capture on
    #[arg(long)]
    pub interface: String,

    /// Read buffer size in bytes; negotiated with the OS if absent
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Read timeout in milliseconds; also bounds how long shutdown waits for a read
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..))]
    pub read_timeout_ms: u64,

    /// Whether the device should buffer packets instead of returning them immediately
    #[arg(long, default_value = "false")]
    pub buffered: bool,

    /// Rate code (500 kbit/s units) announced for injected frames
    #[arg(long, default_value_t = DEFAULT_TX_RATE)]
    pub tx_rate: u8,
}

impl DeviceArgs {
    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            buffer_size: self.buffer_size,
            immediate: !self.buffered,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            tx_rate: self.tx_rate,
            ..Default::default()
        }
    }
}

#[derive(Parser)]
pub struct SniffArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Channel to tune to before capturing
    #[arg(long)]
    pub channel: Option<u32>,

    /// Channel width in MHz (20 or 40); picked automatically if absent
    #[arg(long, requires = "channel")]
    pub width: Option<u32>,

    /// Output file of captured packets
    #[arg(long)]
    pub pcap_out: Option<PathBuf>,

    /// Stop after this many packets
    #[arg(long)]
    pub count: Option<usize>,

    /// Whether to print captured packets
    #[arg(long, default_value = "false")]
    pub print: bool,
}

impl SniffArgs {
    pub fn requested_channel(&self) -> Option<Channel> {
        let width = self
            .width
            .map_or(ChannelWidth::Unspecified, ChannelWidth::from_megahertz);
        self.channel.map(|number| Channel::new(number, width))
    }
}

#[derive(Parser)]
pub struct InjectArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Frame to send as hex, e.g. "c0000000ffffffffffff..."
    #[arg(long)]
    pub frame: String,

    /// How often to send the frame
    #[arg(long, default_value = "1")]
    pub repeat: usize,

    /// Whether the given frame already ends in its checksum
    #[arg(long, default_value = "false")]
    pub raw_checksum: bool,
}

#[derive(Parser)]
pub struct ChannelsArgs {
    #[arg(long)]
    pub interface: String,
}
