use crossbeam_channel::{bounded, Receiver};
use pyo3::exceptions::{PyIOError, PyPermissionError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;
use rawfi_lib::{
    open_handle, BpfDevice, BpfFd, BpfHandle, CaptureError, CapturedPacket, Channel,
    ChannelError, ChannelWidth, DeviceConfig, Frame, FrameStream, IfconfigController, PacketSink,
};
use std::sync::Arc;
use std::time::Duration;

/// Radio information reported alongside a captured frame
#[pyclass(get_all, name = "RadioInfo")]
#[derive(Clone)]
pub struct PyRadioInfo {
    /// Center frequency of the channel in MHz (0 if not reported)
    pub frequency_mhz: u16,
    /// Noise power in dBm
    pub noise_power_dbm: i8,
    /// Signal power in dBm
    pub signal_power_dbm: i8,
    /// Transmit power in dBm
    pub transmit_power_dbm: i8,
}

/// A captured frame
#[pyclass(get_all, name = "Packet")]
pub struct PyPacket {
    /// Frame bytes including the trailing checksum
    pub frame: Py<PyBytes>,
    /// Radio information, if the capture device reports it
    pub radio_info: Option<Py<PyRadioInfo>>,
}

/// Handle to a capture device
///
/// Captures and injects raw 802.11 frames on an interface in monitor mode.
/// Packets can either be received directly or streamed through a background
/// thread into an internal queue.
#[pyclass]
pub struct Handle {
    handle: Arc<BpfHandle<IfconfigController>>,
    stream: Option<FrameStream<BpfDevice<BpfFd>, IfconfigController>>,
    receiver: Option<Receiver<CapturedPacket>>,
}

#[pymethods]
impl Handle {
    /// Open a handle on an interface
    ///
    /// # Arguments
    /// * `interface` - Name of the network interface, e.g. "en0"
    /// * `buffer_size` - Read buffer size; negotiated with the OS if None
    /// * `read_timeout_ms` - Read timeout, at least 1; also bounds how long `close` waits
    /// * `immediate` - Whether reads return as soon as a packet arrives
    /// * `tx_rate` - Rate code announced for injected frames (500 kbit/s units)
    #[new]
    #[pyo3(signature = (interface, buffer_size=None, read_timeout_ms=100, immediate=true, tx_rate=2))]
    pub fn new(
        py: Python<'_>,
        interface: &str,
        buffer_size: Option<usize>,
        read_timeout_ms: u64,
        immediate: bool,
        tx_rate: u8,
    ) -> PyResult<Self> {
        let config = DeviceConfig {
            buffer_size,
            immediate,
            read_timeout: Duration::from_millis(read_timeout_ms),
            tx_rate,
            ..Default::default()
        };
        let controller = IfconfigController::new(interface);
        let handle = py
            .allow_threads(|| open_handle(interface, controller, &config))
            .map_err(capture_error)?;

        Ok(Handle {
            handle: Arc::new(handle),
            stream: None,
            receiver: None,
        })
    }

    /// Receive the next packet, blocking until one arrives.
    pub fn receive(&self, py: Python<'_>) -> PyResult<PyPacket> {
        let handle = &self.handle;
        let packet = py
            .allow_threads(|| handle.receive())
            .map_err(capture_error)?;
        to_py_packet(py, packet)
    }

    /// Receive a packet if one arrives within the read timeout, else None.
    pub fn poll(&self, py: Python<'_>) -> PyResult<Option<PyPacket>> {
        let handle = &self.handle;
        match py.allow_threads(|| handle.poll()).map_err(capture_error)? {
            Some(packet) => Ok(Some(to_py_packet(py, packet)?)),
            None => Ok(None),
        }
    }

    /// Inject a frame.
    ///
    /// The checksum is appended unless `raw_checksum` says the frame already ends in one.
    #[pyo3(signature = (frame, raw_checksum=false))]
    pub fn send(&self, py: Python<'_>, frame: &[u8], raw_checksum: bool) -> PyResult<()> {
        let frame = if raw_checksum {
            Frame::from_checksummed(frame.to_vec())
        } else {
            Frame::with_checksum(frame)
        };
        let handle = &self.handle;
        py.allow_threads(|| handle.send(&frame))
            .map_err(capture_error)
    }

    /// Current channel as a (number, width in MHz) tuple
    pub fn channel(&self) -> PyResult<(u32, u32)> {
        let channel = self.handle.channel().map_err(channel_error)?;
        Ok((channel.number, channel.width.megahertz()))
    }

    /// Switch channel. Without a width, a supported one is picked.
    #[pyo3(signature = (number, width_mhz=0))]
    pub fn set_channel(&self, number: u32, width_mhz: u32) -> PyResult<()> {
        let channel = Channel::new(number, ChannelWidth::from_megahertz(width_mhz));
        self.handle.set_channel(channel).map_err(channel_error)
    }

    /// Supported channels as (number, width in MHz) tuples
    pub fn supported_channels(&self) -> PyResult<Vec<(u32, u32)>> {
        let channels = self.handle.supported_channels().map_err(channel_error)?;
        Ok(channels
            .into_iter()
            .map(|c| (c.number, c.width.megahertz()))
            .collect())
    }

    /// Start receiving in the background into a queue of `queue_size` packets.
    ///
    /// If the queue is not drained by `poll_stream` often enough, the receiver
    /// blocks and the capture device drops packets.
    #[pyo3(signature = (queue_size=1000))]
    pub fn start_stream(&mut self, queue_size: usize) -> PyResult<()> {
        if self.stream.is_some() {
            return Err(PyRuntimeError::new_err("stream is already running"));
        }

        let (sender, receiver) = bounded(queue_size);
        let mut stream = FrameStream::new(self.handle.clone());
        stream.subscribe(PacketSink::Queue(sender));
        stream.start();

        self.stream = Some(stream);
        self.receiver = Some(receiver);
        Ok(())
    }

    /// Take a streamed packet from the queue if available, else None.
    ///
    /// This function is nonblocking.
    pub fn poll_stream(&self, py: Python<'_>) -> PyResult<Option<PyPacket>> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("stream was not started"))?;
        match receiver.try_recv() {
            Ok(packet) => Ok(Some(to_py_packet(py, packet)?)),
            Err(_) => Ok(None),
        }
    }

    /// Number of read batches the stream dropped as malformed
    pub fn malformed_batches(&self) -> usize {
        self.stream
            .as_ref()
            .map_or(0, |stream| stream.malformed_batches())
    }

    /// Stop the background receiver, if running.
    pub fn stop_stream(&mut self, py: Python<'_>) {
        if let Some(mut stream) = self.stream.take() {
            py.allow_threads(|| stream.stop());
        }
        self.receiver = None;
    }

    /// Release the capture device and channel control.
    ///
    /// Further calls fail. Closing twice does nothing.
    pub fn close(&mut self, py: Python<'_>) -> PyResult<()> {
        self.stop_stream(py);
        let handle = &self.handle;
        py.allow_threads(|| handle.close()).map_err(capture_error)
    }
}

fn to_py_packet(py: Python<'_>, packet: CapturedPacket) -> PyResult<PyPacket> {
    let (frame, info) = packet.into_parts();
    let radio_info = info
        .map(|info| {
            Py::new(
                py,
                PyRadioInfo {
                    frequency_mhz: info.frequency_mhz,
                    noise_power_dbm: info.noise_power_dbm,
                    signal_power_dbm: info.signal_power_dbm,
                    transmit_power_dbm: info.transmit_power_dbm,
                },
            )
        })
        .transpose()?;

    Ok(PyPacket {
        frame: PyBytes::new(py, frame.as_bytes()).unbind(),
        radio_info,
    })
}

fn capture_error(e: CaptureError) -> PyErr {
    match e {
        CaptureError::PermissionDenied { .. } => PyPermissionError::new_err(e.to_string()),
        CaptureError::Closed
        | CaptureError::InvalidInterfaceName(_)
        | CaptureError::InvalidBufferSize(_)
        | CaptureError::InvalidReadTimeout(_) => {
            PyValueError::new_err(e.to_string())
        }
        _ => PyIOError::new_err(e.to_string()),
    }
}

fn channel_error(e: ChannelError) -> PyErr {
    match e {
        ChannelError::Closed | ChannelError::Unsupported(_) => PyValueError::new_err(e.to_string()),
        _ => PyIOError::new_err(e.to_string()),
    }
}

#[pymodule]
fn rawfi(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Handle>()?;
    m.add_class::<PyPacket>()?;
    m.add_class::<PyRadioInfo>()?;
    Ok(())
}
