//! v4l2loopback device provisioning
//!
//! Talks to the v4l2loopback control interface to add and remove virtual
//! video nodes, then writes raw frames to the node like any V4L2 output
//! device. The `v4l2loopback` kernel module must be loadable; provisioning
//! attempts a best-effort `modprobe` when the control device is missing.

use super::FrameInfo;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use v4l::video::Output;
use v4l::FourCC;

const CONTROL_PATH: &str = "/dev/v4l2loopback";
const DEFAULT_CARD_LABEL: &str = "Webcamize Camera";
const CARD_LABEL_LEN: usize = 32;

// v4l2loopback.h control codes
const V4L2LOOPBACK_CTL_ADD: libc::c_ulong = 0x4C80;
const V4L2LOOPBACK_CTL_REMOVE: libc::c_ulong = 0x4C81;

/// Creation request, mirrors `struct v4l2_loopback_config`
#[repr(C)]
struct V4l2LoopbackConfig {
    output_nr: libc::c_int,
    unused: libc::c_int,
    card_label: [libc::c_char; CARD_LABEL_LEN],
    min_width: libc::c_uint,
    max_width: libc::c_uint,
    min_height: libc::c_uint,
    max_height: libc::c_uint,
    max_buffers: libc::c_int,
    max_openers: libc::c_int,
    debug: libc::c_int,
    announce_all_caps: libc::c_int,
}

/// How to provision a device
#[derive(Debug, Clone, Default)]
pub struct LoopbackOptions {
    /// Requested device index; None asks the module to pick one
    pub index: Option<u32>,
    /// Human label for the node, usually the camera model
    pub label: Option<String>,
}

/// A ready virtual output node
pub struct LoopbackDevice {
    path: PathBuf,
    index: u32,
    node: File,
    /// Index to remove at teardown, present only for self-allocated nodes
    self_allocated: Option<u32>,
    format_set: bool,
    frames_written: u64,
    bytes_written: u64,
}

impl LoopbackDevice {
    /// Create a node through the control interface and open it.
    pub fn provision(options: &LoopbackOptions) -> Result<Self> {
        let control = open_control()?;
        let label = options.label.as_deref().unwrap_or(DEFAULT_CARD_LABEL);

        let index = match create_node(&control, options.index, label) {
            Ok(index) => index,
            Err(e) if options.index.is_some() => {
                warn!(
                    "Failed to create /dev/video{} ({}), retrying with auto index",
                    options.index.unwrap_or_default(),
                    e
                );
                create_node(&control, None, label)?
            }
            Err(e) => return Err(e),
        };
        info!("Created loopback device /dev/video{} (\"{}\")", index, label);

        let mut device = Self::open_at(index)?;
        device.self_allocated = Some(index);
        Ok(device)
    }

    /// Open a pre-existing node without touching the control interface.
    pub fn open_existing(index: u32) -> Result<Self> {
        Self::open_at(index)
    }

    fn open_at(index: u32) -> Result<Self> {
        let path = node_path(index);
        wait_for_node(&path);
        if !path.exists() {
            return Err(Error::Device(format!("{} does not exist", path.display())));
        }

        require_output_capability(&path)?;

        let node = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| Error::Device(format!("Failed to open {}: {}", path.display(), e)))?;

        debug!("Opened {}", path.display());
        Ok(Self {
            path,
            index,
            node,
            self_allocated: None,
            format_set: false,
            frames_written: 0,
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write one frame. The first frame that knows its geometry negotiates
    /// the node's pixel format; the descriptor is never set again for this
    /// provisioning.
    pub fn write_frame(&mut self, data: &[u8], info: Option<FrameInfo>) -> Result<()> {
        if let Some(info) = info {
            self.negotiate_format(info);
        }

        let written = self
            .node
            .write(data)
            .map_err(|e| Error::Device(format!("Write to {} failed: {}", self.path.display(), e)))?;
        self.bytes_written += written as u64;
        if written < data.len() {
            return Err(Error::ShortWrite { written, expected: data.len() });
        }

        self.frames_written += 1;
        Ok(())
    }

    /// Set the format descriptor once per provisioning. Returns whether a
    /// negotiation was performed by this call.
    fn negotiate_format(&mut self, info: FrameInfo) -> bool {
        if self.format_set {
            return false;
        }
        // Set even if the ioctl fails below: v4l2loopback frequently
        // auto-negotiates from writes, and the descriptor must not be
        // re-submitted on later frames.
        self.format_set = true;

        let fmt = v4l::Format::new(info.width, info.height, FourCC::new(b"YU12"));
        match v4l::Device::with_path(&self.path) {
            Ok(device) => match device.set_format(&fmt) {
                Ok(_) => info!(
                    "Set {} format: {}x{} YU12",
                    self.path.display(),
                    info.width,
                    info.height
                ),
                Err(e) => warn!(
                    "Could not set format on {} (may still work): {}",
                    self.path.display(),
                    e
                ),
            },
            Err(e) => warn!("Could not reopen {} for format setup: {}", self.path.display(), e),
        }
        true
    }

    /// Close the node and, for self-allocated devices, issue one removal
    /// request. Failures are logged and never escalate shutdown.
    pub fn teardown(&mut self) -> bool {
        let Some(index) = self.self_allocated.take() else {
            return false;
        };

        info!("Removing loopback device /dev/video{}", index);
        match OpenOptions::new().read(true).write(true).open(CONTROL_PATH) {
            Ok(control) => {
                let ret = unsafe {
                    libc::ioctl(control.as_raw_fd(), V4L2LOOPBACK_CTL_REMOVE, index as libc::c_int)
                };
                if ret < 0 {
                    warn!(
                        "Failed to remove /dev/video{}: {}",
                        index,
                        std::io::Error::last_os_error()
                    );
                }
            }
            Err(e) => warn!("Loopback control unavailable for removal: {}", e),
        }
        true
    }

    #[cfg(test)]
    fn for_tests(node: File, index: u32, self_allocated: Option<u32>) -> Self {
        Self {
            path: node_path(index),
            index,
            node,
            self_allocated,
            format_set: false,
            frames_written: 0,
            bytes_written: 0,
        }
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn node_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/video{}", index))
}

/// Open the control interface, loading the kernel module on demand.
/// The modprobe is best-effort; only a still-missing control device is fatal.
fn open_control() -> Result<File> {
    let open = || OpenOptions::new().read(true).write(true).open(CONTROL_PATH);

    match open() {
        Ok(control) => Ok(control),
        Err(first) => {
            debug!("{} unavailable ({}), trying modprobe", CONTROL_PATH, first);
            match Command::new("modprobe").arg("v4l2loopback").status() {
                Ok(status) if status.success() => debug!("Loaded v4l2loopback module"),
                Ok(status) => warn!("modprobe v4l2loopback exited with {}", status),
                Err(e) => warn!("Could not run modprobe: {}", e),
            }
            open().map_err(|e| {
                Error::LoopbackControl(format!("Cannot open {}: {}", CONTROL_PATH, e))
            })
        }
    }
}

/// Submit one creation request; returns the assigned device index.
fn create_node(control: &File, index: Option<u32>, label: &str) -> Result<u32> {
    let mut config = V4l2LoopbackConfig {
        output_nr: index.map(|n| n as libc::c_int).unwrap_or(-1),
        unused: -1,
        card_label: encode_label(label),
        min_width: 0,
        max_width: 0,
        min_height: 0,
        max_height: 0,
        max_buffers: 0,
        max_openers: 0,
        debug: 0,
        announce_all_caps: 0,
    };

    let ret = unsafe {
        libc::ioctl(
            control.as_raw_fd(),
            V4L2LOOPBACK_CTL_ADD,
            &mut config as *mut V4l2LoopbackConfig,
        )
    };
    if ret < 0 {
        return Err(Error::LoopbackControl(format!(
            "Device creation failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ret as u32)
}

/// Truncate a label to what fits the fixed-width card_label field,
/// respecting UTF-8 boundaries.
fn truncate_label(label: &str) -> &str {
    let mut end = label.len().min(CARD_LABEL_LEN - 1);
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}

fn encode_label(label: &str) -> [libc::c_char; CARD_LABEL_LEN] {
    let mut field = [0 as libc::c_char; CARD_LABEL_LEN];
    for (dst, src) in field.iter_mut().zip(truncate_label(label).bytes()) {
        *dst = src as libc::c_char;
    }
    field
}

/// Node creation is asynchronous; give the device node a moment to appear.
fn wait_for_node(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !path.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn require_output_capability(path: &Path) -> Result<()> {
    let device = v4l::Device::with_path(path)
        .map_err(|e| Error::Device(format!("Failed to query {}: {}", path.display(), e)))?;
    let caps = device
        .query_caps()
        .map_err(|e| Error::Device(format!("QUERYCAP on {} failed: {}", path.display(), e)))?;

    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_OUTPUT) {
        return Err(Error::NotOutputCapable(path.display().to_string()));
    }
    debug!("{}: driver {}, card \"{}\"", path.display(), caps.driver, caps.card);
    Ok(())
}

/// Scan /dev for output-capable video nodes (loopback candidates), for
/// status reporting.
pub fn discover_output_nodes() -> Vec<(PathBuf, String)> {
    let mut nodes = Vec::new();

    let Ok(entries) = std::fs::read_dir("/dev") else {
        return nodes;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_video = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("video"))
            .unwrap_or(false);
        if !is_video {
            continue;
        }
        if let Ok(device) = v4l::Device::with_path(&path) {
            if let Ok(caps) = device.query_caps() {
                if caps.capabilities.contains(v4l::capability::Flags::VIDEO_OUTPUT) {
                    nodes.push((path, caps.card.to_string()));
                }
            }
        }
    }

    nodes.sort();
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_fits_fixed_field() {
        assert_eq!(truncate_label("Canon EOS R6"), "Canon EOS R6");

        let long = "An Unreasonably Long Camera Model Name Mark IV";
        let truncated = truncate_label(long);
        assert!(truncated.len() <= CARD_LABEL_LEN - 1);
        assert!(long.starts_with(truncated));
    }

    #[test]
    fn label_truncation_respects_utf8() {
        // 20 two-byte chars: byte 31 falls mid-character
        let label = "ä".repeat(20);
        let truncated = truncate_label(&label);
        assert_eq!(truncated.len(), 30);
        assert_eq!(truncated, "ä".repeat(15));
    }

    #[test]
    fn encoded_label_is_nul_terminated() {
        let field = encode_label("Nikon Z6");
        assert_eq!(field[8], 0);
        assert_eq!(field[CARD_LABEL_LEN - 1], 0);
        assert_eq!(field[0] as u8 as char, 'N');
    }

    #[test]
    fn format_negotiated_exactly_once() {
        let tmp = tempfile::tempfile().unwrap();
        let mut device = LoopbackDevice::for_tests(tmp, 99, None);
        let info = FrameInfo { width: 640, height: 480 };

        assert!(device.negotiate_format(info));
        assert!(!device.negotiate_format(info));
        assert!(!device.negotiate_format(FrameInfo { width: 800, height: 600 }));
    }

    #[test]
    fn writes_do_not_renegotiate_format() {
        let tmp = tempfile::tempfile().unwrap();
        let mut device = LoopbackDevice::for_tests(tmp, 99, None);
        let info = Some(FrameInfo { width: 4, height: 2 });

        device.write_frame(&[0u8; 12], info).unwrap();
        assert!(device.format_set);
        device.write_frame(&[0u8; 12], info).unwrap();
        assert_eq!(device.frames_written(), 2);
        assert_eq!(device.bytes_written(), 24);
    }

    #[test]
    fn teardown_removes_exactly_once() {
        let tmp = tempfile::tempfile().unwrap();
        let mut device = LoopbackDevice::for_tests(tmp, 99, Some(99));

        assert!(device.teardown());
        assert!(!device.teardown());

        let tmp = tempfile::tempfile().unwrap();
        let mut foreign = LoopbackDevice::for_tests(tmp, 3, None);
        assert!(!foreign.teardown());
    }
}
