//! Thread-safe capture and injection handle
//!
//! A [`Handle`] combines a capture device with a channel controller. Receiving,
//! sending and channel control each serialize on their own lock, so e.g. a
//! blocked receive never holds up a send. The device and controller themselves
//! sit behind a single read-write guard which [`Handle::close`] takes exclusively
//! to release them. Once a close is pending no operation takes that guard
//! again, so close waits for at most one read timeout.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use crate::bpf::{BpfDevice, Descriptor};
use crate::channel::{resolve_channel, Channel, ChannelController, ChannelWidth};
use crate::errors::{CaptureError, ChannelError};
use crate::packet::{CapturedPacket, Frame};

/// A source of captured packets that frames can also be injected into.
pub trait CaptureSource: Send + Sync {
    /// Read whatever packets are available, blocking until some are.
    fn read_batch(&self) -> Result<Vec<CapturedPacket>, CaptureError>;

    /// Inject a checksum-complete frame.
    fn write(&self, frame: &Frame) -> Result<(), CaptureError>;

    fn close(self) -> Result<(), CaptureError>
    where
        Self: Sized;
}

impl<F: Descriptor> CaptureSource for BpfDevice<F> {
    fn read_batch(&self) -> Result<Vec<CapturedPacket>, CaptureError> {
        BpfDevice::read_batch(self)
    }

    fn write(&self, frame: &Frame) -> Result<(), CaptureError> {
        BpfDevice::write(self, frame)
    }

    fn close(self) -> Result<(), CaptureError> {
        BpfDevice::close(self)
    }
}

/// Everything `close` releases. Both are `None` once the handle is closed.
struct Resources<D, C> {
    device: Option<D>,
    controller: Option<C>,
}

pub struct Handle<D: CaptureSource, C: ChannelController> {
    queue: Mutex<VecDeque<CapturedPacket>>,
    send_lock: Mutex<()>,
    channel_lock: Mutex<()>,
    closed: Mutex<bool>,
    /// Set before `close` waits for the resource guard.
    closing: AtomicBool,
    resources: RwLock<Resources<D, C>>,
}

impl<D: CaptureSource, C: ChannelController> Handle<D, C> {
    /// Create a handle from an already configured device.
    pub fn new(device: D, controller: C) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            send_lock: Mutex::new(()),
            channel_lock: Mutex::new(()),
            closed: Mutex::new(false),
            closing: AtomicBool::new(false),
            resources: RwLock::new(Resources {
                device: Some(device),
                controller: Some(controller),
            }),
        }
    }

    /// Receive the next packet.
    ///
    /// Blocks until a packet arrives, reading further batches from the device
    /// whenever the internal queue runs dry. Read timeouts are not reported;
    /// they only give [`close`](Self::close) the chance to take effect, after
    /// which this returns [`CaptureError::Closed`].
    pub fn receive(&self) -> Result<CapturedPacket, CaptureError> {
        let mut queue = lock(&self.queue);
        loop {
            if let Some(packet) = self.next_queued(&mut queue)? {
                return Ok(packet);
            }
            match self.read_batch() {
                Ok(batch) => queue.extend(batch),
                Err(CaptureError::ReadTimeout) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive a packet if one arrives before the read timeout expires.
    ///
    /// Makes at most one read from the device, returning `Ok(None)` when it times out.
    pub fn poll(&self) -> Result<Option<CapturedPacket>, CaptureError> {
        let mut queue = lock(&self.queue);
        if let Some(packet) = self.next_queued(&mut queue)? {
            return Ok(Some(packet));
        }
        match self.read_batch() {
            Ok(batch) => {
                queue.extend(batch);
                Ok(queue.pop_front())
            }
            Err(CaptureError::ReadTimeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Inject a frame, which must already end in its checksum.
    pub fn send(&self, frame: &Frame) -> Result<(), CaptureError> {
        let _guard = lock(&self.send_lock);
        if self.is_closed() {
            return Err(CaptureError::Closed);
        }
        let resources = self.resources();
        resources
            .device
            .as_ref()
            .ok_or(CaptureError::Closed)?
            .write(frame)
    }

    /// The channel the interface is currently tuned to.
    pub fn channel(&self) -> Result<Channel, ChannelError> {
        let _guard = lock(&self.channel_lock);
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.resources()
            .controller
            .as_ref()
            .ok_or(ChannelError::Closed)?
            .current_channel()
    }

    /// Tune the interface to `channel`.
    ///
    /// Without a width, the first width the interface supports for this channel
    /// number is used.
    pub fn set_channel(&self, channel: Channel) -> Result<(), ChannelError> {
        let _guard = lock(&self.channel_lock);
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let resources = self.resources();
        let controller = resources.controller.as_ref().ok_or(ChannelError::Closed)?;

        let channel = match channel.width {
            ChannelWidth::Unspecified => {
                resolve_channel(channel, &controller.supported_channels()?)?
            }
            _ => channel,
        };
        log::debug!("Switching to channel {}", channel);
        controller.set_channel(channel)
    }

    pub fn supported_channels(&self) -> Result<Vec<Channel>, ChannelError> {
        let _guard = lock(&self.channel_lock);
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.resources()
            .controller
            .as_ref()
            .ok_or(ChannelError::Closed)?
            .supported_channels()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Release the device and the channel controller.
    ///
    /// Waits for an in-flight read or write to finish, which the device's read
    /// timeout bounds. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), CaptureError> {
        let mut closed = lock(&self.closed);
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.closing.store(true, Ordering::SeqCst);

        let (device, controller) = {
            let mut resources = self
                .resources
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            (resources.device.take(), resources.controller.take())
        };

        if let Some(mut controller) = controller {
            controller.release();
        }
        let result = device.map_or(Ok(()), |device| device.close());
        log::info!("Closed capture handle");
        result
    }

    fn resources(&self) -> RwLockReadGuard<'_, Resources<D, C>> {
        self.resources.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop a queued packet, unless the handle was closed meanwhile.
    fn next_queued(
        &self,
        queue: &mut VecDeque<CapturedPacket>,
    ) -> Result<Option<CapturedPacket>, CaptureError> {
        if self.is_closed() {
            return Err(CaptureError::Closed);
        }
        Ok(queue.pop_front())
    }

    /// Read one batch, holding the resource guard only for this single read.
    fn read_batch(&self) -> Result<Vec<CapturedPacket>, CaptureError> {
        if self.is_closed() {
            return Err(CaptureError::Closed);
        }
        self.resources()
            .device
            .as_ref()
            .ok_or(CaptureError::Closed)?
            .read_batch()
    }
}

#[cfg(unix)]
mod open {
    use super::Handle;
    use crate::bpf::{open_device, BpfDevice, BpfFd, DeviceConfig};
    use crate::channel::ChannelController;
    use crate::errors::CaptureError;

    /// A handle on a BPF device node.
    pub type BpfHandle<C> = Handle<BpfDevice<BpfFd>, C>;

    impl<C: ChannelController> Handle<BpfDevice<BpfFd>, C> {
        /// Open a capture device for `interface` and wrap it in a handle.
        pub fn open(
            interface: &str,
            controller: C,
            config: &DeviceConfig,
        ) -> Result<Self, CaptureError> {
            let device = open_device(interface, config)?;
            log::info!(
                "Opened capture handle on {} ({}, {:?})",
                interface,
                device.path().display(),
                device.datalink()
            );
            Ok(Handle::new(device, controller))
        }
    }

    /// Open a capture handle for `interface` using the given controller.
    pub fn open_handle<C: ChannelController>(
        interface: &str,
        controller: C,
        config: &DeviceConfig,
    ) -> Result<BpfHandle<C>, CaptureError> {
        Handle::open(interface, controller, config)
    }
}

#[cfg(unix)]
pub use open::{open_handle, BpfHandle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bpf::tests::{configured, record, ScriptedFd};
    use crate::demux::DataLink;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Device returning scripted batches, then timing out forever.
    #[derive(Default)]
    pub(crate) struct MockDevice {
        pub batches: Mutex<VecDeque<Result<Vec<CapturedPacket>, CaptureError>>>,
        pub sent: Arc<Mutex<Vec<Frame>>>,
        pub closed: Arc<AtomicBool>,
        pub reads: Arc<AtomicUsize>,
        pub tick: Duration,
    }

    impl MockDevice {
        pub fn with_batches(batches: Vec<Result<Vec<CapturedPacket>, CaptureError>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                tick: Duration::from_millis(1),
                ..Default::default()
            }
        }
    }

    impl CaptureSource for MockDevice {
        fn read_batch(&self) -> Result<Vec<CapturedPacket>, CaptureError> {
            assert!(!self.closed.load(Ordering::SeqCst), "read after close");
            self.reads.fetch_add(1, Ordering::SeqCst);
            let next = self.batches.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                thread::sleep(self.tick);
                Err(CaptureError::ReadTimeout)
            })
        }

        fn write(&self, frame: &Frame) -> Result<(), CaptureError> {
            assert!(!self.closed.load(Ordering::SeqCst), "write after close");
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn close(self) -> Result<(), CaptureError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct MockController {
        pub supported: Vec<Channel>,
        pub current: Mutex<Option<Channel>>,
        pub released: Arc<AtomicUsize>,
    }

    impl MockController {
        pub fn with_channels(supported: Vec<Channel>) -> Self {
            Self {
                supported,
                ..Default::default()
            }
        }
    }

    impl ChannelController for MockController {
        fn supported_channels(&self) -> Result<Vec<Channel>, ChannelError> {
            Ok(self.supported.clone())
        }

        fn current_channel(&self) -> Result<Channel, ChannelError> {
            self.current
                .lock()
                .unwrap()
                .ok_or(ChannelError::Parse { input: String::new() })
        }

        fn set_channel(&self, channel: Channel) -> Result<(), ChannelError> {
            *self.current.lock().unwrap() = Some(channel);
            Ok(())
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn packet(body: &[u8]) -> CapturedPacket {
        CapturedPacket::new(Frame::with_checksum(body), None)
    }

    #[test]
    fn receive_drains_batches_in_order() {
        let device = MockDevice::with_batches(vec![
            Ok(vec![packet(b"one"), packet(b"two")]),
            Err(CaptureError::ReadTimeout),
            Ok(vec![packet(b"three")]),
        ]);
        let handle = Handle::new(device, MockController::default());

        assert_eq!(handle.receive().unwrap().frame().body(), b"one");
        assert_eq!(handle.receive().unwrap().frame().body(), b"two");
        assert_eq!(handle.receive().unwrap().frame().body(), b"three");
    }

    #[test]
    fn receive_propagates_fatal_errors() {
        let device = MockDevice::with_batches(vec![
            Err(CaptureError::ReadTimeout),
            Err(CaptureError::DeviceDown),
        ]);
        let handle = Handle::new(device, MockController::default());
        assert!(matches!(handle.receive(), Err(CaptureError::DeviceDown)));
    }

    #[test]
    fn fatal_errors_leave_queue_alone() {
        let device = MockDevice::with_batches(vec![
            Ok(vec![packet(b"one"), packet(b"two")]),
            Err(CaptureError::DeviceDown),
            Ok(vec![packet(b"three")]),
        ]);
        let reads = device.reads.clone();
        let handle = Handle::new(device, MockController::default());

        assert_eq!(handle.receive().unwrap().frame().body(), b"one");
        // Queued packets are handed out without touching the device.
        assert_eq!(handle.receive().unwrap().frame().body(), b"two");
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        assert!(matches!(handle.receive(), Err(CaptureError::DeviceDown)));
        assert!(!handle.is_closed());
        assert_eq!(handle.receive().unwrap().frame().body(), b"three");
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn poll_serves_queue_before_reading() {
        let device = MockDevice::with_batches(vec![
            Ok(vec![packet(b"one"), packet(b"two")]),
            Err(CaptureError::DeviceDown),
        ]);
        let handle = Handle::new(device, MockController::default());

        assert_eq!(handle.poll().unwrap().unwrap().frame().body(), b"one");
        assert_eq!(handle.poll().unwrap().unwrap().frame().body(), b"two");
        assert!(matches!(handle.poll(), Err(CaptureError::DeviceDown)));
    }

    #[test]
    fn poll_returns_at_timeout() {
        let device = MockDevice::with_batches(vec![
            Err(CaptureError::ReadTimeout),
            Ok(vec![packet(b"late")]),
        ]);
        let handle = Handle::new(device, MockController::default());

        assert!(handle.poll().unwrap().is_none());
        assert_eq!(handle.poll().unwrap().unwrap().frame().body(), b"late");
        assert!(handle.poll().unwrap().is_none());
    }

    #[test]
    fn receive_from_bpf_device() {
        let first = Frame::with_checksum(b"\x80\x00\x00\x00\x01");
        let second = Frame::with_checksum(b"\x40\x00\x00\x00\x02");
        let mut batch = record(first.body());
        batch.extend(record(second.body()));
        let fd = ScriptedFd::default().with_reads(vec![Ok(Vec::new()), Ok(batch)]);

        let handle = Handle::new(
            configured(fd, DataLink::Ieee80211),
            MockController::default(),
        );
        assert_eq!(handle.receive().unwrap().frame(), &first);
        assert_eq!(handle.receive().unwrap().frame(), &second);
    }

    #[test]
    fn send_reaches_device() {
        let device = MockDevice::default();
        let sent = device.sent.clone();
        let handle = Handle::new(device, MockController::default());

        let frame = Frame::with_checksum(b"\xc0\x00");
        handle.send(&frame).unwrap();
        assert_eq!(*sent.lock().unwrap(), vec![frame]);
    }

    #[test]
    fn operations_fail_after_close() {
        let device = MockDevice::with_batches(vec![Ok(vec![packet(b"queued"), packet(b"more")])]);
        let closed = device.closed.clone();
        let controller = MockController::with_channels(vec![Channel::new(6, ChannelWidth::Mhz20)]);
        let released = controller.released.clone();
        let handle = Handle::new(device, controller);

        // Leaves a packet in the queue.
        handle.receive().unwrap();
        handle.close().unwrap();
        assert!(handle.is_closed());
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        assert!(matches!(handle.receive(), Err(CaptureError::Closed)));
        assert!(matches!(handle.poll(), Err(CaptureError::Closed)));
        assert!(matches!(
            handle.send(&Frame::with_checksum(b"x")),
            Err(CaptureError::Closed)
        ));
        assert!(matches!(
            handle.set_channel(Channel::new(6, ChannelWidth::Mhz20)),
            Err(ChannelError::Closed)
        ));
        assert!(matches!(handle.channel(), Err(ChannelError::Closed)));
        assert!(matches!(
            handle.supported_channels(),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn close_twice_is_noop() {
        let controller = MockController::default();
        let released = controller.released.clone();
        let handle = Handle::new(MockDevice::default(), controller);

        handle.close().unwrap();
        handle.close().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_channel_picks_supported_width() {
        let controller = MockController::with_channels(vec![
            Channel::new(1, ChannelWidth::Mhz20),
            Channel::new(36, ChannelWidth::Mhz40),
            Channel::new(36, ChannelWidth::Mhz20),
        ]);
        let handle = Handle::new(MockDevice::default(), controller);

        handle
            .set_channel(Channel::new(36, ChannelWidth::Unspecified))
            .unwrap();
        assert_eq!(handle.channel().unwrap(), Channel::new(36, ChannelWidth::Mhz40));

        assert!(matches!(
            handle.set_channel(Channel::new(14, ChannelWidth::Unspecified)),
            Err(ChannelError::Unsupported(_))
        ));
    }

    #[test]
    fn set_channel_keeps_explicit_width() {
        let handle = Handle::new(MockDevice::default(), MockController::default());
        handle
            .set_channel(Channel::new(11, ChannelWidth::Mhz20))
            .unwrap();
        assert_eq!(handle.channel().unwrap(), Channel::new(11, ChannelWidth::Mhz20));
    }

    #[test]
    fn close_unblocks_receive() {
        let device = MockDevice {
            tick: Duration::from_millis(5),
            ..Default::default()
        };
        let handle = Arc::new(Handle::new(device, MockController::default()));

        let receiver = {
            let handle = handle.clone();
            thread::spawn(move || handle.receive())
        };
        thread::sleep(Duration::from_millis(30));
        handle.close().unwrap();

        let result = receiver.join().expect("receiver thread panicked");
        assert!(matches!(result, Err(CaptureError::Closed)));
    }

    #[test]
    fn close_waits_for_one_pending_read_at_most() {
        let tick = Duration::from_millis(300);
        let device = MockDevice {
            tick,
            ..Default::default()
        };
        let reads = device.reads.clone();
        let closed = device.closed.clone();
        let handle = Arc::new(Handle::new(device, MockController::default()));

        let receiver = {
            let handle = handle.clone();
            thread::spawn(move || handle.receive())
        };
        // Let the receiver block inside its first read.
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        handle.close().unwrap();
        let waited = started.elapsed();

        assert!(closed.load(Ordering::SeqCst));
        assert!(waited < tick + Duration::from_millis(150), "close took {:?}", waited);
        assert!(matches!(
            receiver.join().expect("receiver thread panicked"),
            Err(CaptureError::Closed)
        ));
        assert!(reads.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn concurrent_send_and_close() {
        let device = MockDevice::default();
        let sent = device.sent.clone();
        let handle = Arc::new(Handle::new(device, MockController::default()));

        let sender = {
            let handle = handle.clone();
            thread::spawn(move || {
                let frame = Frame::with_checksum(b"\x80\x00");
                let mut delivered = 0usize;
                loop {
                    match handle.send(&frame) {
                        Ok(()) => delivered += 1,
                        Err(CaptureError::Closed) => return delivered,
                        Err(e) => panic!("unexpected send error: {}", e),
                    }
                }
            })
        };
        thread::sleep(Duration::from_millis(5));
        handle.close().unwrap();

        let delivered = sender.join().expect("sender thread panicked");
        assert_eq!(delivered, sent.lock().unwrap().len());
    }

    #[test]
    fn send_does_not_wait_for_receive() {
        let device = MockDevice {
            tick: Duration::from_millis(5),
            ..Default::default()
        };
        let handle = Arc::new(Handle::new(device, MockController::default()));

        let receiver = {
            let handle = handle.clone();
            thread::spawn(move || handle.receive())
        };
        thread::sleep(Duration::from_millis(10));
        handle.send(&Frame::with_checksum(b"\x80\x00")).unwrap();
        handle.close().unwrap();

        assert!(matches!(
            receiver.join().expect("receiver thread panicked"),
            Err(CaptureError::Closed)
        ));
    }
}
