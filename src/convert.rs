//! Preview payload conversion
//!
//! Lazily probes the first payload to find its video stream and decoder,
//! then reuses one decoder + rescaler pair for the rest of the run. The
//! rescaler is rebuilt only when the decoded geometry changes, and the
//! output buffer only ever grows.

use crate::error::{Error, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec;
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::video::Video;
use std::ffi::CStr;
use std::os::raw::{c_int, c_void};
use tracing::debug;

/// Fixed output pixel layout: planar YUV 4:2:0
pub const TARGET_FORMAT: Pixel = Pixel::YUV420P;

/// Decoded geometry the rescaler was configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub format: Pixel,
}

/// Grow-only output buffer.
///
/// Capacity is monotonically non-decreasing for the life of the run; the
/// logical length tracks the most recent frame.
pub struct FrameArena {
    buf: Vec<u8>,
    len: usize,
}

impl FrameArena {
    pub fn new() -> Self {
        Self { buf: Vec::new(), len: 0 }
    }

    /// Bytes one YUV 4:2:0 frame of the given geometry needs
    pub fn required_capacity(width: u32, height: u32) -> usize {
        let (width, height) = (width as usize, height as usize);
        let chroma = ((width + 1) / 2) * ((height + 1) / 2);
        width * height + 2 * chroma
    }

    /// Grow to at least `needed` bytes; never shrinks.
    pub fn ensure_capacity(&mut self, needed: usize) {
        if needed > self.buf.len() {
            self.buf.resize(needed, 0);
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The most recently packed frame
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.len = len;
    }
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of one converted frame; valid until the next conversion
pub struct ConvertedFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

struct ScalerState {
    context: scaling::Context,
    output: Video,
    geometry: Geometry,
}

impl ScalerState {
    fn new(geometry: Geometry) -> Result<Self> {
        debug!(
            "Creating rescaler: {:?} {}x{} -> {:?}",
            geometry.format, geometry.width, geometry.height, TARGET_FORMAT
        );

        let context = scaling::Context::get(
            geometry.format,
            geometry.width,
            geometry.height,
            TARGET_FORMAT,
            geometry.width,
            geometry.height,
            scaling::Flags::BILINEAR,
        )
        .map_err(|e| Error::Rescale(format!("Failed to create rescaler: {}", e)))?;

        let output = Video::new(TARGET_FORMAT, geometry.width, geometry.height);

        Ok(Self { context, output, geometry })
    }
}

/// The rescaler must be rebuilt iff the decoded geometry differs from the
/// one it was configured for (or none was configured yet).
fn rescaler_stale(configured: Option<Geometry>, decoded: Geometry) -> bool {
    configured != Some(decoded)
}

struct DecodePipeline {
    decoder: ffmpeg::decoder::Video,
    decoded: Video,
    scratch: Video,
    scaler: Option<ScalerState>,
}

impl DecodePipeline {
    fn build(payload: &[u8]) -> Result<Self> {
        let id = probe_video_codec(payload)?;
        debug!("Probed payload codec: {:?}", id);

        let decoder_codec = ffmpeg::decoder::find(id)
            .ok_or_else(|| Error::Probe(format!("No decoder for {:?}", id)))?;

        let mut context = codec::Context::new_with_codec(decoder_codec);
        context.set_threading(codec::threading::Config::kind(codec::threading::Type::Frame));
        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).flags |= ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
            (*raw).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;
        }
        attach_hw_device(&mut context);

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| Error::Probe(format!("Failed to open decoder: {}", e)))?;

        Ok(Self {
            decoder,
            decoded: Video::empty(),
            scratch: Video::empty(),
            scaler: None,
        })
    }

    /// Feed the payload as one encoded unit and pull exactly one picture.
    fn decode_one(&mut self, payload: &[u8]) -> Result<()> {
        let packet = ffmpeg::Packet::copy(payload);
        self.decoder
            .send_packet(&packet)
            .map_err(|e| Error::Decode(format!("Decoder rejected payload: {}", e)))?;

        self.decoder
            .receive_frame(&mut self.decoded)
            .map_err(|e| Error::Decode(format!("No picture decoded: {}", e)))?;

        match self.decoder.receive_frame(&mut self.scratch) {
            Err(ffmpeg::Error::Other { errno: ffmpeg::util::error::EAGAIN }) => Ok(()),
            Err(ffmpeg::Error::Eof) => Ok(()),
            Ok(()) => Err(Error::Decode("More than one picture in payload".into())),
            Err(e) => Err(Error::Decode(e.to_string())),
        }
    }
}

/// Lazy decode + rescale pipeline with a grow-only output buffer
pub struct Converter {
    pipeline: Option<DecodePipeline>,
    arena: FrameArena,
}

impl Converter {
    /// Prepare the converter. The decoder itself is built on the first
    /// payload, once the codec is known.
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(|e| Error::Decode(format!("FFmpeg init failed: {}", e)))?;
        Ok(Self { pipeline: None, arena: FrameArena::new() })
    }

    /// Whether the decode pipeline has been built
    pub fn is_ready(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Current output buffer capacity in bytes
    pub fn buffer_capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Convert one payload to the target layout.
    ///
    /// Any failure here spoils only this cycle: a failed first probe leaves
    /// the pipeline unbuilt (the next payload re-probes from scratch), and a
    /// failed decode or rescale leaves all built state untouched.
    pub fn convert(&mut self, payload: &[u8]) -> Result<ConvertedFrame<'_>> {
        if self.pipeline.is_none() {
            let built = DecodePipeline::build(payload)?;
            self.pipeline = Some(built);
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Err(Error::Probe("Pipeline unavailable".into()));
        };

        pipeline.decode_one(payload)?;

        let geometry = Geometry {
            width: pipeline.decoded.width(),
            height: pipeline.decoded.height(),
            format: pipeline.decoded.format(),
        };
        if rescaler_stale(pipeline.scaler.as_ref().map(|s| s.geometry), geometry) {
            pipeline.scaler = Some(ScalerState::new(geometry)?);
        }

        let scaler = match pipeline.scaler.as_mut() {
            Some(scaler) => scaler,
            None => return Err(Error::Rescale("Rescaler unavailable".into())),
        };
        scaler
            .context
            .run(&pipeline.decoded, &mut scaler.output)
            .map_err(|e| Error::Rescale(format!("Rescale failed: {}", e)))?;

        self.arena
            .ensure_capacity(FrameArena::required_capacity(geometry.width, geometry.height));
        let len = pack_planes(&scaler.output, &mut self.arena);
        self.arena.set_len(len);

        Ok(ConvertedFrame {
            data: self.arena.data(),
            width: geometry.width,
            height: geometry.height,
        })
    }
}

/// Pack the planar output frame into the arena, stride-aware, returning the
/// logical frame size.
fn pack_planes(frame: &Video, arena: &mut FrameArena) -> usize {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let chroma_w = (width + 1) / 2;
    let chroma_h = (height + 1) / 2;

    let mut offset = 0;
    let buf = arena.as_mut_slice();
    for (plane, (w, h)) in [(width, height), (chroma_w, chroma_h), (chroma_w, chroma_h)]
        .into_iter()
        .enumerate()
    {
        let stride = frame.stride(plane);
        let data = frame.data(plane);
        for row in 0..h {
            let src = row * stride;
            buf[offset..offset + w].copy_from_slice(&data[src..src + w]);
            offset += w;
        }
    }
    offset
}

/// Probe an in-memory payload for its first video stream's codec.
///
/// Opens the payload through a custom read-only AVIO context; everything
/// allocated here is released before returning.
fn probe_video_codec(payload: &[u8]) -> Result<codec::Id> {
    const PROBE_IO_SIZE: usize = 4096;

    struct ProbeCursor {
        data: *const u8,
        len: usize,
        pos: usize,
    }

    unsafe extern "C" fn probe_read(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
        let cursor = &mut *(opaque as *mut ProbeCursor);
        let remaining = cursor.len.saturating_sub(cursor.pos);
        if remaining == 0 {
            return ffi::AVERROR_EOF;
        }
        let n = remaining.min(buf_size as usize);
        std::ptr::copy_nonoverlapping(cursor.data.add(cursor.pos), buf, n);
        cursor.pos += n;
        n as c_int
    }

    unsafe fn free_probe_io(avio: &mut *mut ffi::AVIOContext) {
        if !avio.is_null() {
            // ffmpeg may have replaced the buffer we allocated
            ffi::av_freep(&mut (**avio).buffer as *mut *mut u8 as *mut c_void);
            ffi::avio_context_free(avio);
        }
    }

    unsafe {
        let io_buf = ffi::av_malloc(PROBE_IO_SIZE) as *mut u8;
        if io_buf.is_null() {
            return Err(Error::Probe("Failed to allocate probe buffer".into()));
        }

        let mut cursor = ProbeCursor {
            data: payload.as_ptr(),
            len: payload.len(),
            pos: 0,
        };
        let mut avio = ffi::avio_alloc_context(
            io_buf,
            PROBE_IO_SIZE as c_int,
            0,
            &mut cursor as *mut ProbeCursor as *mut c_void,
            Some(probe_read),
            None,
            None,
        );
        if avio.is_null() {
            ffi::av_free(io_buf as *mut c_void);
            return Err(Error::Probe("Failed to allocate probe IO context".into()));
        }

        let mut fmt_ctx = ffi::avformat_alloc_context();
        if fmt_ctx.is_null() {
            free_probe_io(&mut avio);
            return Err(Error::Probe("Failed to allocate format context".into()));
        }
        (*fmt_ctx).pb = avio;

        let ret = ffi::avformat_open_input(
            &mut fmt_ctx,
            std::ptr::null(),
            std::ptr::null_mut::<ffi::AVInputFormat>() as _,
            std::ptr::null_mut(),
        );
        if ret < 0 {
            // open_input frees the format context on failure
            free_probe_io(&mut avio);
            return Err(Error::Probe(format!(
                "Unrecognized payload: {}",
                ffmpeg::Error::from(ret)
            )));
        }

        let result = (|| {
            if ffi::avformat_find_stream_info(fmt_ctx, std::ptr::null_mut()) < 0 {
                return Err(Error::Probe("Failed to read stream info".into()));
            }
            let stream = ffi::av_find_best_stream(
                fmt_ctx,
                ffi::AVMediaType::AVMEDIA_TYPE_VIDEO,
                -1,
                -1,
                std::ptr::null_mut(),
                0,
            );
            if stream < 0 {
                return Err(Error::Probe("No video stream in payload".into()));
            }
            let par = (*(*(*fmt_ctx).streams.add(stream as usize))).codecpar;
            Ok(codec::Id::from((*par).codec_id))
        })();

        ffi::avformat_close_input(&mut fmt_ctx);
        free_probe_io(&mut avio);
        result
    }
}

/// Attach any available hardware decode device; absence is not an error.
fn attach_hw_device(context: &mut codec::Context) {
    unsafe {
        let mut kind = ffi::av_hwdevice_iterate_types(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE);
        while kind != ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            let mut device: *mut ffi::AVBufferRef = std::ptr::null_mut();
            if ffi::av_hwdevice_ctx_create(
                &mut device,
                kind,
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            ) >= 0
            {
                (*context.as_mut_ptr()).hw_device_ctx = device;
                let name = ffi::av_hwdevice_get_type_name(kind);
                if !name.is_null() {
                    debug!(
                        "Using hardware decode device: {}",
                        CStr::from_ptr(name).to_string_lossy()
                    );
                }
                return;
            }
            kind = ffi::av_hwdevice_iterate_types(kind);
        }
    }
    debug!("No hardware decode device available, decoding in software");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_capacity_yuv420() {
        assert_eq!(FrameArena::required_capacity(640, 480), 640 * 480 * 3 / 2);
        assert_eq!(FrameArena::required_capacity(2, 2), 6);
        // odd dimensions round the chroma planes up
        assert_eq!(FrameArena::required_capacity(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn arena_never_shrinks() {
        let mut arena = FrameArena::new();
        arena.ensure_capacity(100);
        assert_eq!(arena.capacity(), 100);
        arena.ensure_capacity(50);
        assert_eq!(arena.capacity(), 100);
        arena.ensure_capacity(200);
        assert_eq!(arena.capacity(), 200);
    }

    #[test]
    fn stale_check_matches_geometry() {
        let vga = Geometry { width: 640, height: 480, format: Pixel::YUVJ422P };
        let svga = Geometry { width: 800, height: 600, format: Pixel::YUVJ422P };

        assert!(rescaler_stale(None, vga));
        assert!(!rescaler_stale(Some(vga), vga));
        assert!(rescaler_stale(Some(vga), svga));
        assert!(rescaler_stale(
            Some(vga),
            Geometry { format: Pixel::YUV420P, ..vga }
        ));
    }

    #[test]
    fn geometry_sequence_rebuilds_once_and_capacity_grows() {
        // 640x480, 640x480, 800x600: one rebuild after the initial build,
        // capacity never below what the first payload established.
        let sequence = [(640u32, 480u32), (640, 480), (800, 600)];
        let mut configured: Option<Geometry> = None;
        let mut arena = FrameArena::new();
        let mut rebuilds = 0;
        let mut first_capacity = 0;

        for (i, (width, height)) in sequence.into_iter().enumerate() {
            let decoded = Geometry { width, height, format: Pixel::YUVJ422P };
            if rescaler_stale(configured, decoded) {
                rebuilds += 1;
                configured = Some(decoded);
            }
            let needed = FrameArena::required_capacity(width, height);
            arena.ensure_capacity(needed);
            assert!(arena.capacity() >= needed);
            if i == 0 {
                first_capacity = arena.capacity();
            }
        }

        assert_eq!(rebuilds, 2); // initial build + the 800x600 switch
        assert!(arena.capacity() >= first_capacity);
    }
}
