//! Frame pump
//!
//! The steady-state loop: capture one preview, convert it, write it to the
//! sink, and sleep off whatever is left of the pacing period. A session
//! owns all streaming state; nothing lives in process globals.

use crate::camera::BoundCamera;
use crate::convert::{ConvertedFrame, Converter};
use crate::error::Result;
use crate::output::{FrameInfo, Sink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Cooperative cancellation token.
///
/// Set asynchronously (Ctrl-C), observed only at the top of each cycle;
/// in-flight capture/convert/write/sleep always completes.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one streaming run
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Completed capture cycles
    pub cycles: u64,
    /// Frames that went through the converter
    pub frames_converted: u64,
    /// Frames written as raw payloads (conversion off or failed)
    pub frames_raw: u64,
    /// Non-fatal device write failures
    pub failed_writes: u64,
    /// Total bytes pushed into the sink
    pub bytes_written: u64,
}

/// Everything one streaming run owns: the bound camera, the conversion
/// pipeline, and the single active sink.
pub struct Session {
    pub camera: BoundCamera,
    pub converter: Converter,
    pub sink: Sink,
    pub stats: Stats,
}

impl Session {
    pub fn new(camera: BoundCamera, converter: Converter, sink: Sink) -> Self {
        Self { camera, converter, sink, stats: Stats::default() }
    }
}

/// Pump behavior knobs
#[derive(Debug, Clone)]
pub struct PumpOptions {
    /// Minimum wall-clock duration of one cycle
    pub period: Duration,
    /// Decode + rescale payloads (false streams them untouched)
    pub convert: bool,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self { period: Duration::from_micros(1_000_000 / 30), convert: true }
    }
}

/// The pacing loop driver
pub struct FramePump {
    options: PumpOptions,
    cancel: CancelToken,
}

impl FramePump {
    pub fn new(options: PumpOptions, cancel: CancelToken) -> Self {
        Self { options, cancel }
    }

    /// Drive the session until cancellation or a fatal error.
    pub fn run(&self, session: &mut Session) -> Result<Stats> {
        info!(
            "Streaming {} to {} ({} ms/frame)",
            session.camera.model(),
            session.sink.describe(),
            self.options.period.as_millis()
        );

        while !self.cancel.is_cancelled() {
            let cycle_start = Instant::now();

            self.run_cycle(session)?;
            session.stats.cycles += 1;

            let sleep = pacing_sleep(self.options.period, cycle_start.elapsed());
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }

        session.stats.bytes_written = session.sink.bytes_written();
        info!(
            "Stream stopped: {} cycles, {} converted, {} raw, {} bytes",
            session.stats.cycles,
            session.stats.frames_converted,
            session.stats.frames_raw,
            session.stats.bytes_written
        );
        Ok(session.stats.clone())
    }

    fn run_cycle(&self, session: &mut Session) -> Result<()> {
        // Capture and payload fetch failures are fatal: the camera is gone.
        let payload = session.camera.capture_preview()?;

        let (data, info) = if self.options.convert {
            resolve_frame(
                session.converter.convert(&payload),
                &payload,
                &mut session.stats,
            )?
        } else {
            session.stats.frames_raw += 1;
            (&payload[..], None)
        };

        match session.sink.write_frame(data, info) {
            Ok(()) => Ok(()),
            Err(e) if !session.sink.write_errors_fatal() => {
                session.stats.failed_writes += 1;
                warn!("Device write failed, continuing: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Pick this cycle's bytes: the converted frame, or the raw payload when
/// conversion failed recoverably (that cycle only).
fn resolve_frame<'a>(
    converted: Result<ConvertedFrame<'a>>,
    raw: &'a [u8],
    stats: &mut Stats,
) -> Result<(&'a [u8], Option<FrameInfo>)> {
    match converted {
        Ok(frame) => {
            stats.frames_converted += 1;
            let info = FrameInfo { width: frame.width, height: frame.height };
            Ok((frame.data, Some(info)))
        }
        Err(e) if e.is_frame_recoverable() => {
            warn!("Conversion failed, passing raw payload for this frame: {}", e);
            stats.frames_raw += 1;
            Ok((raw, None))
        }
        Err(e) => Err(e),
    }
}

/// Sleep remainder for one cycle: max(0, period - elapsed). Overruns are
/// never compensated on later cycles.
pub fn pacing_sleep(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn pacing_sleeps_the_remainder() {
        let period = Duration::from_millis(40);
        assert_eq!(
            pacing_sleep(period, Duration::from_millis(15)),
            Duration::from_millis(25)
        );
    }

    #[test]
    fn pacing_never_negative_and_never_compensates() {
        let period = Duration::from_millis(40);
        // overrun: no sleep this cycle
        assert_eq!(pacing_sleep(period, Duration::from_millis(55)), Duration::ZERO);
        // the next cycle starts from a clean slate
        assert_eq!(
            pacing_sleep(period, Duration::from_millis(10)),
            Duration::from_millis(30)
        );
        assert_eq!(pacing_sleep(period, period), Duration::ZERO);
    }

    #[test]
    fn converted_frame_is_preferred() {
        let mut stats = Stats::default();
        let converted = ConvertedFrame { data: &[1, 2, 3], width: 640, height: 480 };
        let raw = [9u8; 8];

        let (data, info) = resolve_frame(Ok(converted), &raw, &mut stats).unwrap();
        assert_eq!(data, &[1, 2, 3]);
        assert_eq!(info, Some(FrameInfo { width: 640, height: 480 }));
        assert_eq!(stats.frames_converted, 1);
        assert_eq!(stats.frames_raw, 0);
    }

    #[test]
    fn recoverable_failure_substitutes_raw_for_one_cycle() {
        let mut stats = Stats::default();
        let raw = [7u8; 16];

        let (data, info) =
            resolve_frame(Err(Error::Decode("bad frame".into())), &raw, &mut stats).unwrap();
        assert_eq!(data, &raw[..]);
        assert_eq!(info, None);
        assert_eq!(stats.frames_raw, 1);

        // next cycle converts again as usual
        let converted = ConvertedFrame { data: &[1], width: 2, height: 2 };
        let (data, _) = resolve_frame(Ok(converted), &raw, &mut stats).unwrap();
        assert_eq!(data, &[1]);
        assert_eq!(stats.frames_converted, 1);
    }

    #[test]
    fn non_frame_errors_propagate() {
        let mut stats = Stats::default();
        let raw = [0u8; 4];
        let result = resolve_frame(
            Err(Error::Capture("camera unplugged".into())),
            &raw,
            &mut stats,
        );
        assert!(result.is_err());
        assert_eq!(stats.frames_raw, 0);
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
