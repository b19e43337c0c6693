//! Stream-based receiving
//!
//! A [`FrameStream`] runs a background thread that keeps receiving from a shared
//! [`Handle`] and forwards every packet to the registered sinks. The handle
//! stays usable from other threads meanwhile, e.g. for injecting frames or
//! switching channels. Batches the device delivers malformed are skipped but
//! counted, see [`FrameStream::malformed_batches`].
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

#[cfg(feature = "pcap_dump")]
use crate::dump::PcapDump;
use crate::channel::ChannelController;
use crate::errors::{CaptureError, ParseError};
use crate::handle::{CaptureSource, Handle};
use crate::packet::CapturedPacket;

/// A destination for received packets.
pub enum PacketSink {
    /// Forward packets to an in-process queue.
    Queue(Sender<CapturedPacket>),
    /// Append packets to a pcap savefile.
    #[cfg(feature = "pcap_dump")]
    Pcap(PcapDump),
}

impl PacketSink {
    /// Hand a packet to the sink. False once a queue's receiving side is gone.
    fn accept(&mut self, packet: &CapturedPacket) -> bool {
        match self {
            PacketSink::Queue(queue) => queue.send(packet.clone()).is_ok(),
            #[cfg(feature = "pcap_dump")]
            PacketSink::Pcap(dump) => {
                dump.write(packet);
                true
            }
        }
    }

    fn finish(self) {
        match self {
            PacketSink::Queue(_) => {}
            #[cfg(feature = "pcap_dump")]
            PacketSink::Pcap(mut dump) => {
                if let Err(e) = dump.flush() {
                    log::error!("Error flushing pcap dump: {}", e);
                }
            }
        }
    }
}

/// Malformed batches seen by the receive loop.
#[derive(Default)]
struct ParseFailures {
    count: AtomicUsize,
    last: Mutex<Option<ParseError>>,
}

impl ParseFailures {
    fn record(&self, error: ParseError) {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

/// Receives from a [`Handle`] in the background and feeds sinks.
pub struct FrameStream<D, C>
where
    D: CaptureSource + 'static,
    C: ChannelController + 'static,
{
    handle: Arc<Handle<D, C>>,
    sinks: Vec<PacketSink>,
    running: Arc<AtomicBool>,
    failures: Arc<ParseFailures>,
    receiver: Option<JoinHandle<()>>,
}

impl<D, C> FrameStream<D, C>
where
    D: CaptureSource + 'static,
    C: ChannelController + 'static,
{
    pub fn new(handle: Arc<Handle<D, C>>) -> Self {
        Self {
            handle,
            sinks: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            failures: Arc::new(ParseFailures::default()),
            receiver: None,
        }
    }

    /// Registers a sink. Sinks take effect on the next [`start`](Self::start).
    pub fn subscribe(&mut self, sink: PacketSink) {
        self.sinks.push(sink);
    }

    /// Whether the background receiver is still active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of read batches dropped because they could not be parsed.
    pub fn malformed_batches(&self) -> usize {
        self.failures.count.load(Ordering::SeqCst)
    }

    /// Why the most recent malformed batch was dropped.
    pub fn last_parse_error(&self) -> Option<ParseError> {
        self.failures
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts receiving in a background thread.
    ///
    /// Receiving continues until [`stop`](Self::stop) is called, the handle is
    /// closed, the device fails, or every queue sink is disconnected. Does
    /// nothing if the stream is already running.
    pub fn start(&mut self) {
        if self.receiver.is_some() {
            log::warn!("Frame stream is already running");
            return;
        }

        log::info!("Starting frame stream with {} sink(s)", self.sinks.len());
        self.running.store(true, Ordering::SeqCst);

        let handle = self.handle.clone();
        let running = self.running.clone();
        let failures = self.failures.clone();
        let sinks = std::mem::take(&mut self.sinks);
        self.receiver = Some(thread::spawn(move || {
            forward(handle, running, &failures, sinks)
        }));
    }

    /// Stops the background receiver and waits for it to finish.
    ///
    /// Registered sinks are flushed and dropped, so queue receivers observe a
    /// disconnect. Subscribe again before restarting.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(receiver) = self.receiver.take() {
            log::info!("Stopping frame stream");
            if let Err(e) = receiver.join() {
                log::error!("Couldn't join receiver thread. Error: {:?}", e);
            }
        }
    }
}

impl<D, C> Drop for FrameStream<D, C>
where
    D: CaptureSource + 'static,
    C: ChannelController + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receive loop of the background thread.
///
/// Polls instead of blocking in `receive`, so a cleared `running` flag is seen
/// at every read timeout.
fn forward<D, C>(
    handle: Arc<Handle<D, C>>,
    running: Arc<AtomicBool>,
    failures: &ParseFailures,
    mut sinks: Vec<PacketSink>,
) where
    D: CaptureSource,
    C: ChannelController,
{
    let mut forwarded = 0usize;
    while running.load(Ordering::SeqCst) {
        let packet = match handle.poll() {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(CaptureError::Closed) => {
                log::debug!("Handle closed, ending frame stream");
                break;
            }
            Err(CaptureError::Parse(e)) => {
                log::warn!("Dropping malformed capture batch: {}", e);
                failures.record(e);
                continue;
            }
            Err(e) => {
                log::error!("Receiving failed; Stopping frame stream. Error: {}", e);
                break;
            }
        };

        let subscribed = sinks.len();
        sinks.retain_mut(|sink| sink.accept(&packet));
        if sinks.len() < subscribed {
            log::debug!("Dropped {} disconnected sink(s)", subscribed - sinks.len());
            if sinks.is_empty() {
                break;
            }
        }
        forwarded += 1;
    }

    running.store(false, Ordering::SeqCst);
    sinks.into_iter().for_each(PacketSink::finish);
    log::info!("Frame stream ended after {} packet(s)", forwarded);
}
