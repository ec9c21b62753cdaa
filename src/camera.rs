//! Camera binding via libgphoto2
//!
//! Enumerates tethered cameras, resolves a requested model (falling back to
//! the first detected camera when the name does not match), and hands out an
//! open handle that serves one preview payload per pump cycle.

use crate::error::{Error, Result};
use gphoto2::list::CameraDescriptor;
use gphoto2::{Camera, Context};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of matching a requested model against the enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Index into the enumerated list
    pub index: usize,
    /// The requested name was not found and the first entry was used instead
    pub fallback: bool,
}

/// Pick a camera from the enumerated model names.
///
/// Exact-matches `requested` when given; a miss selects the first entry and
/// flags the fallback. Returns None only for an empty enumeration.
pub fn select(requested: Option<&str>, models: &[&str]) -> Option<Selection> {
    if models.is_empty() {
        return None;
    }
    match requested {
        Some(name) => match models.iter().position(|m| *m == name) {
            Some(index) => Some(Selection { index, fallback: false }),
            None => Some(Selection { index: 0, fallback: true }),
        },
        None => Some(Selection { index: 0, fallback: false }),
    }
}

/// An open, initialized camera ready for per-cycle preview capture
pub struct BoundCamera {
    context: Context,
    camera: Camera,
    model: String,
    port: String,
    frames_captured: u64,
}

impl BoundCamera {
    /// Model name of the bound camera
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Connection path the camera was resolved on
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Number of previews served so far
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    /// Capture one preview and fetch its payload.
    ///
    /// The returned bytes are fresh each call; the converter copies what it
    /// needs, nothing is retained here.
    pub fn capture_preview(&mut self) -> Result<Box<[u8]>> {
        let file = self
            .camera
            .capture_preview()
            .wait()
            .map_err(|e| Error::Capture(e.to_string()))?;

        let data = file
            .get_data(&self.context)
            .wait()
            .map_err(|e| Error::PayloadFetch(e.to_string()))?;

        self.frames_captured += 1;
        Ok(data)
    }
}

/// Enumerate all cameras the subsystem can see
fn enumerate(context: &Context) -> Result<Vec<CameraDescriptor>> {
    let cameras = context
        .list_cameras()
        .wait()
        .map_err(|e| Error::Camera(format!("Enumeration failed: {}", e)))?;
    Ok(cameras.collect())
}

/// Enumeration with a bounded wait for a camera to appear.
///
/// Polls once per second until the deadline; `wait_secs == 0` enumerates
/// exactly once. The only retry loop on the camera side.
fn enumerate_with_wait(context: &Context, wait_secs: u64) -> Result<Vec<CameraDescriptor>> {
    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    loop {
        let found = enumerate(context)?;
        if !found.is_empty() || Instant::now() >= deadline {
            return Ok(found);
        }
        debug!("No cameras yet, polling again");
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Resolve and open a camera.
///
/// `requested` exact-matches against enumerated model names; a miss logs a
/// warning and binds the first camera instead. An empty enumeration is fatal.
pub fn bind(requested: Option<&str>, wait_secs: u64) -> Result<BoundCamera> {
    let context = Context::new().map_err(|e| Error::Camera(e.to_string()))?;

    let candidates = enumerate_with_wait(&context, wait_secs)?;
    if candidates.is_empty() {
        return Err(Error::NoCamera);
    }
    for descriptor in &candidates {
        debug!("Detected camera {} at {}", descriptor.model, descriptor.port);
    }

    let models: Vec<&str> = candidates.iter().map(|d| d.model.as_str()).collect();
    let selection = select(requested, &models).ok_or(Error::NoCamera)?;
    if selection.fallback {
        warn!(
            "Camera \"{}\" not found, falling back to \"{}\"",
            requested.unwrap_or_default(),
            models[selection.index]
        );
    }

    let descriptor = &candidates[selection.index];
    let camera = context
        .get_camera(descriptor)
        .wait()
        .map_err(|e| Error::Camera(format!("Failed to open {}: {}", descriptor.model, e)))?;

    info!("Bound camera {} at {}", descriptor.model, descriptor.port);

    Ok(BoundCamera {
        context,
        camera,
        model: descriptor.model.clone(),
        port: descriptor.port.clone(),
        frames_captured: 0,
    })
}

/// List detected cameras as (model, port) pairs, for status reporting
pub fn detect() -> Result<Vec<(String, String)>> {
    let context = Context::new().map_err(|e| Error::Camera(e.to_string()))?;
    Ok(enumerate(&context)?
        .into_iter()
        .map(|d| (d.model, d.port))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_selects_requested() {
        let models = ["Canon EOS R6", "Nikon Z6", "Sony A7 III"];
        let selection = select(Some("Nikon Z6"), &models).unwrap();
        assert_eq!(selection.index, 1);
        assert!(!selection.fallback);
    }

    #[test]
    fn missing_name_falls_back_to_first() {
        let models = ["Canon EOS R6", "Nikon Z6"];
        let selection = select(Some("Fuji X-T5"), &models).unwrap();
        assert_eq!(selection.index, 0);
        assert!(selection.fallback);
    }

    #[test]
    fn no_request_takes_first() {
        let models = ["Canon EOS R6", "Nikon Z6"];
        let selection = select(None, &models).unwrap();
        assert_eq!(selection.index, 0);
        assert!(!selection.fallback);
    }

    #[test]
    fn empty_enumeration_selects_nothing() {
        assert!(select(Some("anything"), &[]).is_none());
        assert!(select(None, &[]).is_none());
    }

    #[test]
    fn match_is_exact_not_substring() {
        let models = ["Canon EOS R6 Mark II"];
        let selection = select(Some("Canon EOS R6"), &models).unwrap();
        assert!(selection.fallback);
    }
}
