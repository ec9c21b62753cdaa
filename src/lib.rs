//! Webcamize — tethered cameras as virtual webcams
//!
//! Streams live-view previews from a gphoto2-capable camera into a
//! v4l2loopback virtual video device (or a file/stdout stream), decoding
//! and rescaling each preview frame to planar YUV 4:2:0 on the way.
//!
//! # Example
//!
//! ```rust,no_run
//! use webcamize::{camera, convert::Converter, output::Sink, pump};
//!
//! fn main() -> webcamize::Result<()> {
//!     let cam = camera::bind(None, 0)?;
//!     let sink = Sink::stream_to_stdout();
//!     let mut session = pump::Session::new(cam, Converter::new()?, sink);
//!     let pump = pump::FramePump::new(pump::PumpOptions::default(), pump::CancelToken::new());
//!     pump.run(&mut session)?;
//!     Ok(())
//! }
//! ```

pub mod camera;
pub mod config;
pub mod convert;
pub mod elevate;
pub mod error;
pub mod output;
pub mod pump;

// Re-exports for convenience
pub use camera::BoundCamera;
pub use config::StreamConfig;
pub use convert::{Converter, FrameArena};
pub use error::{Error, Result};
pub use output::{FrameInfo, Sink};
pub use pump::{CancelToken, FramePump, PumpOptions, Session, Stats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
