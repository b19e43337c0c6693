//! Channel control through BSD `ifconfig`
//!
//! Channels are listed with `ifconfig <if> list chan`, the current channel is
//! read from the plain `ifconfig <if>` status and switching runs
//! `ifconfig <if> channel <n>[:ht/40]`.
use std::path::PathBuf;
use std::process::Command;

use crate::channel::{Channel, ChannelController, ChannelWidth};
use crate::errors::ChannelError;

const DEFAULT_PROGRAM: &str = "ifconfig";

/// [`ChannelController`] that shells out to `ifconfig`.
#[derive(Debug, Clone)]
pub struct IfconfigController {
    interface: String,
    program: PathBuf,
    released: bool,
}

impl IfconfigController {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            program: PathBuf::from(DEFAULT_PROGRAM),
            released: false,
        }
    }

    /// Use a different `ifconfig` binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Run the program with the interface name followed by `args`, returning stdout.
    fn run(&self, args: &[&str]) -> Result<String, ChannelError> {
        if self.released {
            return Err(ChannelError::Closed);
        }

        let program = self.program.display().to_string();
        log::trace!("Running {} {} {}", program, self.interface, args.join(" "));
        let output = Command::new(&self.program)
            .arg(&self.interface)
            .args(args)
            .output()
            .map_err(|source| ChannelError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ChannelError::CommandFailed {
                program,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ChannelController for IfconfigController {
    fn supported_channels(&self) -> Result<Vec<Channel>, ChannelError> {
        Ok(parse_channel_list(&self.run(&["list", "chan"])?))
    }

    fn current_channel(&self) -> Result<Channel, ChannelError> {
        let status = self.run(&[])?;
        parse_current_channel(&status).ok_or(ChannelError::Parse { input: status })
    }

    fn set_channel(&self, channel: Channel) -> Result<(), ChannelError> {
        self.run(&["channel", &channel_argument(channel)]).map(|_| ())
    }

    fn release(&mut self) {
        if !self.released {
            log::trace!("Releasing channel control of {}", self.interface);
        }
        self.released = true;
    }
}

/// Channel as given to `ifconfig <if> channel`.
fn channel_argument(channel: Channel) -> String {
    match channel.width {
        ChannelWidth::Mhz40 => format!("{}:ht/40", channel.number),
        _ => channel.number.to_string(),
    }
}

/// Parse the output of `ifconfig <if> list chan`.
///
/// Lines hold one or more entries like `Channel  36 : 5180  MHz 11a ht/40+`.
/// Every channel supports 20 MHz; those with a `/40` flag support 40 MHz too.
pub fn parse_channel_list(output: &str) -> Vec<Channel> {
    let mut channels = Vec::new();
    for line in output.lines() {
        // Splitting at "Channel" yields one entry per part.
        for entry in line.split("Channel").skip(1) {
            let mut tokens = entry.split_whitespace();
            let number = match tokens.next().and_then(|n| n.parse::<u32>().ok()) {
                Some(number) => number,
                None => continue,
            };
            let wide = tokens.any(|flag| flag.contains("/40"));

            let mut push = |width| {
                let channel = Channel::new(number, width);
                if !channels.contains(&channel) {
                    channels.push(channel);
                }
            };
            push(ChannelWidth::Mhz20);
            if wide {
                push(ChannelWidth::Mhz40);
            }
        }
    }
    channels
}

/// Parse the current channel from `ifconfig <if>` status output.
///
/// Looks for `channel 6 (2437 MHz 11g ht/20)`; the width is 40 MHz if the
/// attributes carry a `/40` flag.
pub fn parse_current_channel(output: &str) -> Option<Channel> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "channel" {
            continue;
        }
        let number = match tokens.next().and_then(|n| n.parse::<u32>().ok()) {
            Some(number) => number,
            None => continue,
        };

        let mut width = ChannelWidth::Mhz20;
        if let Some(first) = tokens.next().filter(|t| t.starts_with('(')) {
            let mut attribute = first;
            loop {
                if attribute.contains("/40") {
                    width = ChannelWidth::Mhz40;
                }
                if attribute.ends_with(')') {
                    break;
                }
                match tokens.next() {
                    Some(next) => attribute = next,
                    None => break,
                }
            }
        }
        return Some(Channel::new(number, width));
    }
    None
}
