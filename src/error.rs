//! Error types for webcamize

use thiserror::Error;

/// Result type alias for webcamize operations
pub type Result<T> = std::result::Result<T, Error>;

/// Webcamize error type
#[derive(Error, Debug)]
pub enum Error {
    // Camera errors
    #[error("Camera error: {0}")]
    Camera(String),

    #[error("No cameras detected")]
    NoCamera,

    #[error("Preview capture failed: {0}")]
    Capture(String),

    #[error("Payload fetch failed: {0}")]
    PayloadFetch(String),

    // Converter errors
    #[error("Payload probe failed: {0}")]
    Probe(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Rescale failed: {0}")]
    Rescale(String),

    // Output errors
    #[error("Loopback control error: {0}")]
    LoopbackControl(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Device {0} does not advertise video output capability")]
    NotOutputCapable(String),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Stream output error: {0}")]
    StreamOutput(String),

    // General errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),
}

impl Error {
    /// Errors that spoil a single frame but leave the stream healthy.
    pub fn is_frame_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Probe(_) | Error::Decode(_) | Error::Rescale(_) | Error::Ffmpeg(_)
        )
    }

    /// Errors raised before the streaming loop can start
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Error::NoCamera
                | Error::Camera(_)
                | Error::LoopbackControl(_)
                | Error::Device(_)
                | Error::NotOutputCapable(_)
                | Error::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_are_recoverable() {
        assert!(Error::Decode("bad packet".into()).is_frame_recoverable());
        assert!(Error::Probe("unknown container".into()).is_frame_recoverable());
        assert!(!Error::Capture("usb gone".into()).is_frame_recoverable());
        assert!(!Error::ShortWrite { written: 3, expected: 8 }.is_frame_recoverable());
    }

    #[test]
    fn setup_errors_are_not_runtime() {
        assert!(Error::NoCamera.is_setup());
        assert!(!Error::Capture("x".into()).is_setup());
    }
}
