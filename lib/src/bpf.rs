//! BPF capture device
//!
//! Owns a `/dev/bpf*` descriptor and performs the primitive operations on it:
//! configuration ioctls, batched blocking reads and frame writes. The device is
//! not synchronized against being closed while in use; the [`Handle`](crate::Handle)
//! provides that.
use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::demux::{self, DataLink};
use crate::errors::CaptureError;
use crate::packet::{CapturedPacket, Frame};
use crate::radiotap;

/// Device node tried before the numbered ones.
pub const PRIMARY_DEVICE_PATH: &str = "/dev/bpf";

/// Upper bound on numbered device nodes to try.
const MAX_DEVICE_INDEX: usize = 256;

/// Largest read buffer asked for during negotiation.
const MAX_BUFFER_SIZE: usize = 0x80000;

/// Smallest read buffer negotiation falls back to.
const MIN_BUFFER_SIZE: usize = 0x100;

/// Integers are handed to ioctls in a buffer of this many bytes.
const IOCTL_INTEGER_SIZE: usize = 8;

/// Room for a `struct ifreq`, with generous slack.
const IFREQ_SIZE: usize = 128;

/// Longest interface name, excluding the terminating NUL.
const MAX_INTERFACE_NAME: usize = 15;

/// Default injection rate, in units of 500 kbit/s.
pub const DEFAULT_TX_RATE: u8 = 2;

/// Configuration requests understood by the capture device.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Request {
    /// `BIOCSETIF`: attach to a network interface
    SetInterface,
    /// `BIOCSDLT`: select the data-link type
    SetDatalink,
    /// `BIOCPROMISC`: enter promiscuous mode
    Promiscuous,
    /// `BIOCSBLEN`: set the read buffer length
    SetBufferLength,
    /// `BIOCGBLEN`: get the read buffer length
    GetBufferLength,
    /// `BIOCIMMEDIATE`: return reads as soon as a packet arrives
    Immediate,
    /// `BIOCSHDRCMPLT`: do not fill in link-level source addresses
    HeaderComplete,
    /// `BIOCSRTIMEOUT`: set the read timeout
    ReadTimeout,
}

impl Request {
    /// The ioctl request code.
    pub fn code(self) -> u64 {
        match self {
            Request::SetInterface => 0x8020426c,
            Request::SetDatalink => 0x80044278,
            Request::Promiscuous => 0x20004269,
            Request::SetBufferLength => 0xc0044266,
            Request::GetBufferLength => 0x40044266,
            Request::Immediate => 0x80044270,
            Request::HeaderComplete => 0x80044275,
            Request::ReadTimeout => 0x8010426d,
        }
    }
}

/// The raw control surface of an open capture descriptor.
pub trait Descriptor: Send + Sync {
    /// Issue a configuration request. `arg` is passed by pointer, or as null when absent.
    fn control(&self, request: Request, arg: Option<&mut [u8]>) -> io::Result<()>;

    /// Blocking read of whatever the device has buffered.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocking write of a single frame.
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Release the descriptor.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Settings applied when a device is opened.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Read buffer size; negotiated with the OS when `None`.
    pub buffer_size: Option<usize>,
    pub promiscuous: bool,
    /// Return reads as soon as a packet arrives instead of when the buffer fills.
    pub immediate: bool,
    /// Send frames with the link-level addresses exactly as given.
    pub header_complete: bool,
    /// Read timeout. Reads never block for longer, which bounds how long
    /// closing a handle waits for a pending read.
    pub read_timeout: Duration,
    /// Rate announced in the radiotap header of injected frames, in 500 kbit/s.
    pub tx_rate: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            buffer_size: None,
            promiscuous: true,
            immediate: true,
            header_complete: true,
            read_timeout: Duration::from_millis(100),
            tx_rate: DEFAULT_TX_RATE,
        }
    }
}

/// Open the first usable capture device node.
///
/// Tries [`PRIMARY_DEVICE_PATH`], then `/dev/bpf0`, `/dev/bpf1`, ... Busy nodes are
/// skipped; a permission failure ends the search immediately.
pub fn open_first<T, F>(mut open: F) -> Result<(T, PathBuf), CaptureError>
where
    F: FnMut(&Path) -> io::Result<T>,
{
    let primary = PathBuf::from(PRIMARY_DEVICE_PATH);
    match open(&primary) {
        Ok(fd) => return Ok((fd, primary)),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(permission_denied(&primary))
        }
        Err(e) => log::trace!("Could not open {}: {}", primary.display(), e),
    }

    for index in 0..MAX_DEVICE_INDEX {
        let path = PathBuf::from(format!("{}{}", PRIMARY_DEVICE_PATH, index));
        match open(&path) {
            Ok(fd) => return Ok((fd, path)),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(permission_denied(&path))
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                log::debug!("{} is busy, trying the next device", path.display());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CaptureError::NoDeviceAvailable)
            }
            Err(e) => return Err(CaptureError::io(format!("open {}", path.display()), e)),
        }
    }

    Err(CaptureError::NoDeviceAvailable)
}

fn permission_denied(path: &Path) -> CaptureError {
    CaptureError::PermissionDenied {
        path: path.display().to_string(),
    }
}

/// A BPF device and the session state negotiated on it.
pub struct BpfDevice<F: Descriptor> {
    fd: F,
    path: PathBuf,
    datalink: Option<DataLink>,
    read_buffer: Mutex<Vec<u8>>,
    tx_rate: u8,
}

impl<F: Descriptor> BpfDevice<F> {
    /// Wrap an open descriptor. Nothing is configured yet.
    pub fn from_descriptor(fd: F, path: PathBuf) -> Self {
        Self {
            fd,
            path,
            datalink: None,
            read_buffer: Mutex::new(Vec::new()),
            tx_rate: DEFAULT_TX_RATE,
        }
    }

    /// Path of the device node this descriptor was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data-link type selected for this session, if any.
    pub fn datalink(&self) -> Option<DataLink> {
        self.datalink
    }

    /// Size of the read buffer; 0 until one was set.
    pub fn buffer_size(&self) -> usize {
        self.read_buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Apply the full setup sequence for capturing and injecting on `interface`.
    ///
    /// The buffer size must be set before the interface is bound.
    pub fn configure(&mut self, interface: &str, config: &DeviceConfig) -> Result<(), CaptureError> {
        match config.buffer_size {
            Some(size) => self.set_read_buffer_size(size)?,
            None => {
                self.negotiate_buffer_size()?;
            }
        }
        self.bind_interface(interface)?;
        self.select_datalink()?;
        if config.promiscuous {
            self.enter_promiscuous_mode()?;
        }
        self.set_immediate_mode(config.immediate)?;
        self.set_header_complete(config.header_complete)?;
        self.set_read_timeout(config.read_timeout)?;
        self.tx_rate = config.tx_rate;
        Ok(())
    }

    /// Set the read buffer size. Fails if the OS grants less than `size`.
    pub fn set_read_buffer_size(&mut self, size: usize) -> Result<(), CaptureError> {
        let length = u32::try_from(size).map_err(|_| CaptureError::InvalidBufferSize(size))?;
        self.control_int(Request::SetBufferLength, length)?;

        let mut granted = [0u8; IOCTL_INTEGER_SIZE];
        self.control(Request::GetBufferLength, Some(&mut granted))?;
        let granted = u32::from_le_bytes([granted[0], granted[1], granted[2], granted[3]]) as usize;
        if granted < size {
            return Err(CaptureError::UnsupportedBufferSize {
                requested: size,
                granted,
            });
        }

        *self.read_buffer.get_mut().unwrap_or_else(PoisonError::into_inner) = vec![0; size];
        Ok(())
    }

    /// Find the largest read buffer size the OS accepts, halving on every refusal.
    pub fn negotiate_buffer_size(&mut self) -> Result<usize, CaptureError> {
        let mut size = MAX_BUFFER_SIZE;
        while size >= MIN_BUFFER_SIZE {
            match self.set_read_buffer_size(size) {
                Ok(()) => {
                    log::trace!("Negotiated read buffer of {} bytes", size);
                    return Ok(size);
                }
                Err(e) => log::debug!("Read buffer of {} bytes refused: {}", size, e),
            }
            size >>= 1;
        }
        Err(CaptureError::BufferNegotiation)
    }

    /// Attach the device to a network interface.
    pub fn bind_interface(&self, name: &str) -> Result<(), CaptureError> {
        if name.is_empty() || name.len() > MAX_INTERFACE_NAME || name.contains('\0') {
            return Err(CaptureError::InvalidInterfaceName(name.to_string()));
        }

        let mut ifreq = [0u8; IFREQ_SIZE];
        ifreq[..name.len()].copy_from_slice(name.as_bytes());
        self.fd
            .control(Request::SetInterface, Some(&mut ifreq))
            .map_err(|e| match e.raw_os_error() {
                Some(libc::ENXIO) => CaptureError::NoSuchDevice {
                    interface: name.to_string(),
                },
                Some(libc::ENETDOWN) => CaptureError::InterfaceDown {
                    interface: name.to_string(),
                },
                _ => CaptureError::io(format!("bind to {}", name), e),
            })
    }

    /// Switch to a data-link type that delivers raw 802.11 frames.
    ///
    /// Radiotap is preferred; bare 802.11 headers are the fallback.
    pub fn select_datalink(&mut self) -> Result<DataLink, CaptureError> {
        for datalink in [DataLink::Radiotap, DataLink::Ieee80211] {
            match self.control_int(Request::SetDatalink, datalink.dlt()) {
                Ok(()) => {
                    log::trace!("Using data-link type {:?}", datalink);
                    self.datalink = Some(datalink);
                    return Ok(datalink);
                }
                Err(e) => log::debug!("Data-link type {:?} refused: {}", datalink, e),
            }
        }
        Err(CaptureError::NoDatalink)
    }

    pub fn enter_promiscuous_mode(&self) -> Result<(), CaptureError> {
        self.control(Request::Promiscuous, None)
    }

    pub fn set_immediate_mode(&self, enabled: bool) -> Result<(), CaptureError> {
        self.control_int(Request::Immediate, enabled as u32)
    }

    /// With header complete mode on, link-level source addresses can be forged.
    pub fn set_header_complete(&self, enabled: bool) -> Result<(), CaptureError> {
        self.control_int(Request::HeaderComplete, enabled as u32)
    }

    /// After `timeout` without data, reads fail with [`CaptureError::ReadTimeout`].
    ///
    /// A zero timeval means "block forever" to the OS, so timeouts below one
    /// microsecond are refused.
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<(), CaptureError> {
        if timeout.as_micros() == 0 {
            return Err(CaptureError::InvalidReadTimeout(timeout));
        }
        let mut timeval = [0u8; 16];
        timeval[..8].copy_from_slice(&timeout.as_secs().to_le_bytes());
        timeval[8..].copy_from_slice(&u64::from(timeout.subsec_micros()).to_le_bytes());
        self.control(Request::ReadTimeout, Some(&mut timeval))
    }

    /// Rate announced when injecting on the radiotap data-link type.
    pub fn set_tx_rate(&mut self, rate: u8) {
        self.tx_rate = rate;
    }

    /// Read one batch of packets.
    ///
    /// Blocks until the device returns data. Interrupted reads are retried; an
    /// expired read timeout is reported as [`CaptureError::ReadTimeout`].
    pub fn read_batch(&self) -> Result<Vec<CapturedPacket>, CaptureError> {
        let datalink = self
            .datalink
            .ok_or(CaptureError::NotConfigured("data-link type"))?;
        let mut buffer = self.read_buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.is_empty() {
            return Err(CaptureError::NotConfigured("read buffer size"));
        }

        loop {
            match self.fd.read(&mut buffer) {
                Ok(0) => return Err(CaptureError::ReadTimeout),
                Ok(amount) => {
                    log::trace!("Read {} bytes from {}", amount, self.path.display());
                    return Ok(demux::split(&buffer[..amount], datalink)?);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(match e.raw_os_error() {
                        Some(libc::ENXIO) => CaptureError::DeviceDown,
                        Some(libc::ETIMEDOUT) => CaptureError::ReadTimeout,
                        _ => CaptureError::io(format!("read {}", self.path.display()), e),
                    })
                }
            }
        }
    }

    /// Inject a frame. It must already end in its checksum.
    pub fn write(&self, frame: &Frame) -> Result<(), CaptureError> {
        let datalink = self
            .datalink
            .ok_or(CaptureError::NotConfigured("data-link type"))?;

        // Even the bare 802.11 data-link type expects the checksum on writes.
        let data = match datalink {
            DataLink::Radiotap => Cow::Owned(radiotap::encode(frame, self.tx_rate)),
            DataLink::Ieee80211 => Cow::Borrowed(frame.as_bytes()),
        };

        let written = self
            .fd
            .write(&data)
            .map_err(|e| CaptureError::io(format!("write {}", self.path.display()), e))?;
        if written < data.len() {
            return Err(CaptureError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Release the descriptor.
    pub fn close(self) -> Result<(), CaptureError> {
        let path = self.path;
        self.fd
            .close()
            .map_err(|e| CaptureError::io(format!("close {}", path.display()), e))
    }

    fn control(&self, request: Request, arg: Option<&mut [u8]>) -> Result<(), CaptureError> {
        self.fd
            .control(request, arg)
            .map_err(|e| CaptureError::io(format!("{:?} on {}", request, self.path.display()), e))
    }

    fn control_int(&self, request: Request, value: u32) -> Result<(), CaptureError> {
        let mut arg = [0u8; IOCTL_INTEGER_SIZE];
        arg[..4].copy_from_slice(&value.to_le_bytes());
        self.control(request, Some(&mut arg))
    }
}

/// A `/dev/bpf*` node opened for reading and writing.
#[cfg(unix)]
#[derive(Debug)]
pub struct BpfFd(std::fs::File);

#[cfg(unix)]
impl BpfFd {
    pub fn open(path: &Path) -> io::Result<Self> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(BpfFd)
    }
}

#[cfg(unix)]
impl Descriptor for BpfFd {
    fn control(&self, request: Request, arg: Option<&mut [u8]>) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let ptr = arg.map_or(std::ptr::null_mut(), |arg| arg.as_mut_ptr());
        // SAFETY: every request with an argument is handed a buffer at least as
        // large as the structure the kernel reads or writes for it.
        let result = unsafe { libc::ioctl(self.0.as_raw_fd(), request.code() as _, ptr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &self.0, buf)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &self.0, data)
    }

    fn close(self) -> io::Result<()> {
        use std::os::unix::io::IntoRawFd;

        let fd = self.0.into_raw_fd();
        // SAFETY: ownership of the descriptor was just taken from the file.
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Open the first free device node and configure it for `interface`.
#[cfg(unix)]
pub fn open_device(interface: &str, config: &DeviceConfig) -> Result<BpfDevice<BpfFd>, CaptureError> {
    let (fd, path) = open_first(BpfFd::open)?;
    log::debug!("Opened {}", path.display());

    let mut device = BpfDevice::from_descriptor(fd, path);
    if let Err(e) = device.configure(interface, config) {
        if let Err(close_error) = device.close() {
            log::warn!("Failed to close capture device: {}", close_error);
        }
        return Err(e);
    }
    Ok(device)
}
