//! Output sinks
//!
//! Exactly one sink is active per run: a v4l2loopback virtual device, a
//! file, or standard output.

mod file;
mod loopback;

pub use file::StreamSink;
pub use loopback::{discover_output_nodes, LoopbackDevice, LoopbackOptions};

use crate::config::{OutputTarget, StreamConfig};
use crate::error::Result;

/// Geometry of a converted frame, used for lazy device format negotiation.
/// Raw (unconverted) payloads carry no geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
}

/// The single active output destination
pub enum Sink {
    /// Virtual video device
    Loopback(LoopbackDevice),
    /// File or stdout stream
    Stream(StreamSink),
}

impl Sink {
    pub fn stream_to_stdout() -> Self {
        Sink::Stream(StreamSink::stdout())
    }

    pub fn stream_to_file(path: &std::path::Path) -> Result<Self> {
        Ok(Sink::Stream(StreamSink::file(path)?))
    }

    /// Push one frame. `info` is present when the bytes are converted
    /// output with known geometry.
    pub fn write_frame(&mut self, data: &[u8], info: Option<FrameInfo>) -> Result<()> {
        match self {
            Sink::Loopback(device) => device.write_frame(data, info),
            Sink::Stream(stream) => stream.write_frame(data),
        }
    }

    /// Whether a failed write must stop the stream. Stream sinks cannot
    /// tolerate lost bytes; the loopback device just shows a stale frame.
    pub fn write_errors_fatal(&self) -> bool {
        matches!(self, Sink::Stream(_))
    }

    pub fn bytes_written(&self) -> u64 {
        match self {
            Sink::Loopback(device) => device.bytes_written(),
            Sink::Stream(stream) => stream.bytes_written(),
        }
    }

    /// Release the sink; for a self-allocated device this also asks the
    /// module to remove the node.
    pub fn teardown(&mut self) {
        if let Sink::Loopback(device) = self {
            device.teardown();
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Sink::Loopback(device) => device.path().display().to_string(),
            Sink::Stream(stream) => stream.describe(),
        }
    }
}

/// Build the sink selected by the configuration.
///
/// `camera_model` labels a self-allocated device after the bound camera.
pub fn create_sink(config: &StreamConfig, camera_model: Option<&str>) -> Result<Sink> {
    match &config.output {
        OutputTarget::Device => {
            let device = if config.self_alloc {
                LoopbackDevice::provision(&LoopbackOptions {
                    index: config.device,
                    label: camera_model.map(str::to_owned),
                })?
            } else {
                LoopbackDevice::open_existing(config.device.unwrap_or(0))?
            };
            Ok(Sink::Loopback(device))
        }
        OutputTarget::File(path) => Sink::stream_to_file(path),
        OutputTarget::Stdout => Ok(Sink::stream_to_stdout()),
    }
}
