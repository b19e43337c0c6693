use crossbeam_channel::{bounded, RecvTimeoutError};
#[cfg(feature = "pcap_dump")]
use rawfi_lib::PcapDump;
use rawfi_lib::{
    open_handle, CapturedPacket, ChannelController, Frame, FrameStream, IfconfigController,
    PacketSink,
};

use std::error::Error;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crate::cli::{ChannelsArgs, InjectArgs, SniffArgs};

/// How many received packets may wait for printing before the receiver blocks.
const QUEUE_CAPACITY: usize = 1024;

pub fn run_sniff(args: SniffArgs) -> Result<(), Box<dyn Error>> {
    let requested_channel = args.requested_channel();
    let SniffArgs {
        device,
        pcap_out,
        count,
        print,
        ..
    } = args;

    let controller = IfconfigController::new(&device.interface);
    let handle = Arc::new(open_handle(&device.interface, controller, &device.config())?);
    if let Some(channel) = requested_channel {
        handle.set_channel(channel)?;
        log::info!("Tuned {} to channel {}", device.interface, handle.channel()?);
    }

    // Set up the `running` flag for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);

    // Set up CTRL+C handler for graceful shutdown
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut stream = FrameStream::new(handle.clone());
    if let Some(path) = pcap_out {
        #[cfg(feature = "pcap_dump")]
        stream.subscribe(PacketSink::Pcap(PcapDump::create(&path)?));
        #[cfg(not(feature = "pcap_dump"))]
        log::warn!(
            "Built without pcap support; not writing {}",
            path.display()
        );
    }
    let (tx, rx) = bounded(QUEUE_CAPACITY);
    stream.subscribe(PacketSink::Queue(tx));
    stream.start();

    let mut received = 0usize;
    while running.load(Ordering::SeqCst) && count.map_or(true, |count| received < count) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(packet) => {
                received += 1;
                if print {
                    print_packet(received, &packet);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("Shutting down gracefully...");
    stream.stop();
    handle.close()?;
    log::info!("Captured {} packet(s)", received);
    if let Some(e) = stream.last_parse_error() {
        log::warn!(
            "Dropped {} malformed batch(es), last: {}",
            stream.malformed_batches(),
            e
        );
    }
    Ok(())
}

pub fn run_inject(args: InjectArgs) -> Result<(), Box<dyn Error>> {
    let bytes = parse_hex(&args.frame)?;
    let frame = if args.raw_checksum {
        let frame = Frame::from_checksummed(bytes);
        if !frame.has_valid_checksum() {
            log::warn!("Frame checksum does not match its contents; sending anyway");
        }
        frame
    } else {
        Frame::with_checksum(&bytes)
    };

    let interface = &args.device.interface;
    let handle = open_handle(
        interface,
        IfconfigController::new(interface),
        &args.device.config(),
    )?;

    for _ in 0..args.repeat {
        if let Err(e) = handle.send(&frame) {
            handle.close()?;
            return Err(e.into());
        }
    }
    log::info!("Sent {} frame(s) of {} bytes", args.repeat, frame.len());
    handle.close()?;
    Ok(())
}

pub fn run_channels(args: ChannelsArgs) -> Result<(), Box<dyn Error>> {
    let mut controller = IfconfigController::new(&args.interface);
    let current = controller.current_channel();
    let supported = controller.supported_channels();
    controller.release();

    match current {
        Ok(channel) => println!("Current channel: {}", channel),
        Err(e) => log::warn!("Could not determine current channel: {}", e),
    }
    println!("Supported channels:");
    for channel in supported? {
        println!(" - {}", channel);
    }
    Ok(())
}

fn print_packet(index: usize, packet: &CapturedPacket) {
    let frame = packet.frame();
    let frame_control = frame.first().copied().unwrap_or_default();
    print!(
        "#{} len={} fc=0x{:02x} fcs_ok={}",
        index,
        frame.len(),
        frame_control,
        frame.has_valid_checksum()
    );
    match packet.radio_info() {
        Some(info) => println!(
            " freq={}MHz signal={}dBm noise={}dBm",
            info.frequency_mhz, info.signal_power_dbm, info.noise_power_dbm
        ),
        None => println!(),
    }
}

/// Parse a hex string like "c0 00 3a01" into bytes. Whitespace and `:` are ignored.
fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(format!("expected an even number of hex digits: {:?}", input));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|_| format!("invalid hex byte {:?}", byte))
        })
        .collect()
}
