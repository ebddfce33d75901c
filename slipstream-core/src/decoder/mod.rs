//! # Decode Engine
//!
//! Wraps whichever decoder backend opened first:
//!
//! ```text
//!   V4L2 vendor (bcm2835, venus, ...) ─► V4L2 generic ─► software (openh264)
//!         hardware, only when asked for and displayable        always last
//! ```
//!
//! `submit` takes access units in bitstream order. `receive` never blocks:
//! it fills the caller's pre-allocated picture or reports that nothing is
//! ready. The engine stamps decode order, submit time and colour
//! description on every picture so renderers never look at the backend.
//! A colour description the backend parses from the stream replaces the
//! negotiated one as soon as it changes.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::network::{AccessUnit, StreamParams, VideoCodec};
use crate::picture::{ColorRange, Colorspace, DecodedPicture, PixelFormat};

#[cfg(feature = "software-decode")]
pub mod software;
pub mod v4l2;
pub mod v4l2_sys;

/// Surfaces a hardware decoder keeps beyond the ring: reference frames
/// plus the ones on screen and pending a flip
pub const EXTRA_DECODER_SURFACES: usize = 4;

// ============================================================================
// Backend Interface
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecoderKind {
    /// Stateful V4L2 decoder from a known SoC vendor driver
    V4l2Vendor,
    /// Any other stateful V4L2 memory-to-memory decoder
    V4l2Generic,
    Software,
}

impl DecoderKind {
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Self::Software)
    }

    /// Lower is tried first
    pub fn priority(&self) -> u32 {
        match self {
            Self::V4l2Vendor => 1,
            Self::V4l2Generic => 2,
            Self::Software => 99,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::V4l2Vendor => "v4l2-vendor",
            Self::V4l2Generic => "v4l2",
            Self::Software => "software",
        }
    }
}

/// Everything a backend needs to open
#[derive(Debug, Clone)]
pub struct DecoderInit {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Requested output layout
    pub format: PixelFormat,
    /// Hardware surfaces to allocate
    pub pool_size: usize,
    /// Thread hint, 0 = backend default
    pub threads: u32,
}

pub trait VideoDecoder: Send {
    fn name(&self) -> &'static str;

    fn is_hardware(&self) -> bool;

    /// Layout `receive` produces
    fn output_format(&self) -> PixelFormat;

    /// Queue one access unit. Errors end the current decode context.
    fn submit(&mut self, unit: &AccessUnit) -> Result<()>;

    /// Fill `picture` with the next decoded frame. `Ok(false)` when none is
    /// ready; never blocks.
    fn receive(&mut self, picture: &mut DecodedPicture) -> Result<bool>;

    /// Wait until output may be ready. Synchronous backends return at once.
    fn wait_output(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    /// Drop queued bitstream and references, keeping allocations
    fn reset(&mut self) -> Result<()>;

    /// Colour description signalled by the stream, once the backend knows it
    fn color(&self) -> Option<(Colorspace, ColorRange)> {
        None
    }

    /// Hardware surfaces in the decoder's pool, 0 for software
    fn surface_pool_capacity(&self) -> usize {
        0
    }
}

pub trait DecoderProvider: Send + Sync {
    fn kind(&self) -> DecoderKind;

    fn name(&self) -> &str;

    fn supports(&self, codec: VideoCodec) -> bool;

    fn supports_444(&self, codec: VideoCodec) -> bool;

    fn open(&self, init: &DecoderInit) -> Result<Box<dyn VideoDecoder>>;
}

/// V4L2 devices found on this machine (vendor drivers first) then software
pub fn builtin_providers() -> Vec<Box<dyn DecoderProvider>> {
    let mut providers: Vec<Box<dyn DecoderProvider>> = v4l2::probe_devices()
        .into_iter()
        .map(|device| Box::new(v4l2::V4l2Provider::new(device)) as Box<dyn DecoderProvider>)
        .collect();
    #[cfg(feature = "software-decode")]
    providers.push(Box::new(software::SoftwareProvider));
    providers
}

// ============================================================================
// 4:4:4 Negotiation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degrade444 {
    /// The host cannot encode 4:4:4
    ServerUnsupported,
    /// The selected local decoder cannot decode 4:4:4
    LocalUnsupported,
}

impl fmt::Display for Degrade444 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerUnsupported => write!(f, "server-unsupported"),
            Self::LocalUnsupported => write!(f, "local-unsupported"),
        }
    }
}

/// Output layout for a backend, plus the reason 4:4:4 was dropped if it was
pub fn choose_format(
    params: &StreamParams,
    want_444: bool,
    hardware: bool,
    backend_444: bool,
) -> (PixelFormat, Option<Degrade444>) {
    let (yuv444, degrade) = if !want_444 {
        (false, None)
    } else if !params.server_supports_yuv444 {
        (false, Some(Degrade444::ServerUnsupported))
    } else if !backend_444 {
        (false, Some(Degrade444::LocalUnsupported))
    } else {
        (true, None)
    };

    let format = match (hardware, params.hdr, yuv444) {
        (true, false, false) => PixelFormat::Nv12,
        (true, false, true) => PixelFormat::Nv24,
        (true, true, false) => PixelFormat::P010,
        (true, true, true) => PixelFormat::Yuv444p10,
        (false, false, false) => PixelFormat::Yuv420p,
        (false, false, true) => PixelFormat::Yuv444p,
        (false, true, false) => PixelFormat::P010,
        (false, true, true) => PixelFormat::Yuv444p10,
    };
    (format, degrade)
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Allowed to pick a hardware backend
    pub hardware: bool,
    /// 4:4:4 requested by the client
    pub yuv444: bool,
    pub pool_size: usize,
    pub threads: u32,
}

struct Submitted {
    at: Instant,
    keyframe: bool,
}

pub struct DecodeEngine {
    decoder: Box<dyn VideoDecoder>,
    kind: DecoderKind,
    format: PixelFormat,
    degrade: Option<Degrade444>,
    width: u32,
    height: u32,
    colorspace: Colorspace,
    range: ColorRange,
    /// Last colour description the backend reported
    reported: Option<(Colorspace, ColorRange)>,
    /// Reported change not yet picked up by the pipeline
    color_change: Option<(Colorspace, ColorRange)>,
    next_sequence: u64,
    in_decoder: VecDeque<Submitted>,
    submitted: u64,
    received: u64,
}

impl DecodeEngine {
    /// Open the first provider that accepts the stream, in priority order
    pub fn init(
        providers: &[Box<dyn DecoderProvider>],
        params: &StreamParams,
        options: &EngineOptions,
    ) -> Result<Self> {
        params.validate()?;

        let mut ranked: Vec<&dyn DecoderProvider> = providers.iter().map(|p| p.as_ref()).collect();
        ranked.sort_by_key(|p| p.kind().priority());

        let mut last_error = None;
        for provider in ranked {
            if provider.kind().is_hardware() && !options.hardware {
                continue;
            }
            if !provider.supports(params.codec) {
                tracing::debug!(decoder = provider.name(), codec = params.codec.name(), "codec not supported");
                continue;
            }

            let hardware = provider.kind().is_hardware();
            let want_444 = options.yuv444 && params.yuv444;
            let (format, degrade) = choose_format(params, want_444, hardware, provider.supports_444(params.codec));

            let init = DecoderInit {
                codec: params.codec,
                width: params.width,
                height: params.height,
                format,
                pool_size: options.pool_size,
                threads: options.threads,
            };

            match provider.open(&init) {
                Ok(decoder) => {
                    if let Some(reason) = degrade {
                        tracing::warn!(reason = %reason, "4:4:4 unavailable, decoding 4:2:0");
                    }
                    tracing::info!(
                        decoder = decoder.name(),
                        kind = provider.kind().name(),
                        codec = params.codec.name(),
                        format = ?decoder.output_format(),
                        "decoder selected for {}x{}",
                        params.width,
                        params.height
                    );
                    return Ok(Self {
                        format: decoder.output_format(),
                        decoder,
                        kind: provider.kind(),
                        degrade,
                        width: params.width,
                        height: params.height,
                        colorspace: params.colorspace,
                        range: params.range(),
                        reported: None,
                        color_change: None,
                        next_sequence: 0,
                        in_decoder: VecDeque::new(),
                        submitted: 0,
                        received: 0,
                    });
                }
                Err(e) => {
                    tracing::warn!(decoder = provider.name(), "decoder failed to open: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(PipelineError::BackendUnavailable(match last_error {
            Some(e) => format!("no decoder for {}: {}", params.codec.name(), e),
            None => format!("no decoder for {}", params.codec.name()),
        }))
    }

    pub fn submit(&mut self, unit: &AccessUnit) -> Result<()> {
        self.decoder.submit(unit)?;
        self.in_decoder.push_back(Submitted { at: Instant::now(), keyframe: unit.keyframe });
        self.submitted += 1;
        Ok(())
    }

    /// Non-blocking. On `Ok(true)` the picture carries a new frame.
    pub fn receive(&mut self, picture: &mut DecodedPicture) -> Result<bool> {
        if !self.decoder.receive(picture)? {
            return Ok(false);
        }
        self.check_stream_color();
        picture.sequence = self.next_sequence;
        self.next_sequence += 1;
        picture.colorspace = self.colorspace;
        picture.range = self.range;
        match self.in_decoder.pop_front() {
            Some(s) => {
                picture.submitted_at = Some(s.at);
                picture.keyframe = s.keyframe;
            }
            None => picture.submitted_at = None,
        }
        self.received += 1;
        Ok(true)
    }

    pub fn wait_output(&mut self, timeout: Duration) -> Result<bool> {
        self.decoder.wait_output(timeout)
    }

    /// Start a new decode context after a bitstream error
    pub fn reset(&mut self) -> Result<()> {
        self.in_decoder.clear();
        self.decoder.reset()
    }

    fn check_stream_color(&mut self) {
        let Some(color) = self.decoder.color() else {
            return;
        };
        if self.reported == Some(color) {
            return;
        }
        self.reported = Some(color);
        if (self.colorspace, self.range) != color {
            tracing::info!(colorspace = ?color.0, range = ?color.1, "stream colour description changed");
            self.set_color(color.0, color.1);
            self.color_change = Some(color);
        }
    }

    /// Colour description to stamp on pictures from now on
    pub fn set_color(&mut self, colorspace: Colorspace, range: ColorRange) {
        self.colorspace = colorspace;
        self.range = range;
    }

    pub fn color(&self) -> (Colorspace, ColorRange) {
        (self.colorspace, self.range)
    }

    /// A change the stream signalled since the last call
    pub fn take_color_change(&mut self) -> Option<(Colorspace, ColorRange)> {
        self.color_change.take()
    }

    pub fn name(&self) -> &'static str {
        self.decoder.name()
    }

    pub fn kind(&self) -> DecoderKind {
        self.kind
    }

    pub fn is_hardware(&self) -> bool {
        self.decoder.is_hardware()
    }

    pub fn output_format(&self) -> PixelFormat {
        self.format
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn degrade_reason(&self) -> Option<Degrade444> {
        self.degrade
    }

    pub fn surface_pool_capacity(&self) -> usize {
        self.decoder.surface_pool_capacity()
    }

    /// Access units submitted but not yet returned as pictures
    pub fn in_decoder(&self) -> usize {
        self.in_decoder.len()
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.submitted, self.received)
    }

    /// Allocate a ring picture in this engine's output layout
    pub fn allocate_picture(&self) -> DecodedPicture {
        let mut picture = DecodedPicture::allocate(self.format, self.width, self.height);
        picture.colorspace = self.colorspace;
        picture.range = self.range;
        picture
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDecoderProvider, ProbeLog, BT2020_FULL_UNIT};

    fn params() -> StreamParams {
        StreamParams { width: 64, height: 32, ..Default::default() }
    }

    fn options(hardware: bool) -> EngineOptions {
        EngineOptions { hardware, yuv444: true, pool_size: 7, threads: 0 }
    }

    fn providers(log: &ProbeLog, hw_ok: bool) -> Vec<Box<dyn DecoderProvider>> {
        vec![
            Box::new(MockDecoderProvider::new(DecoderKind::Software, true, false, log)),
            Box::new(MockDecoderProvider::new(DecoderKind::V4l2Generic, hw_ok, true, log)),
            Box::new(MockDecoderProvider::new(DecoderKind::V4l2Vendor, hw_ok, true, log)),
        ]
    }

    #[test]
    fn test_vendor_first_when_hardware_allowed() {
        let log = ProbeLog::default();
        let engine = DecodeEngine::init(&providers(&log, true), &params(), &options(true)).unwrap();
        assert_eq!(engine.kind(), DecoderKind::V4l2Vendor);
        assert!(engine.is_hardware());
    }

    #[test]
    fn test_software_when_hardware_not_requested() {
        let log = ProbeLog::default();
        let engine = DecodeEngine::init(&providers(&log, true), &params(), &options(false)).unwrap();
        assert_eq!(engine.kind(), DecoderKind::Software);
        assert_eq!(log.opened_decoders(), vec![DecoderKind::Software]);
    }

    #[test]
    fn test_falls_through_failed_hardware() {
        let log = ProbeLog::default();
        let engine = DecodeEngine::init(&providers(&log, false), &params(), &options(true)).unwrap();
        assert_eq!(engine.kind(), DecoderKind::Software);
    }

    #[test]
    fn test_444_degrade_reasons() {
        let mut p = params();
        p.yuv444 = true;
        p.server_supports_yuv444 = false;
        assert_eq!(choose_format(&p, true, false, true), (PixelFormat::Yuv420p, Some(Degrade444::ServerUnsupported)));

        p.server_supports_yuv444 = true;
        assert_eq!(choose_format(&p, true, false, false), (PixelFormat::Yuv420p, Some(Degrade444::LocalUnsupported)));
        assert_eq!(choose_format(&p, true, true, true), (PixelFormat::Nv24, None));
        assert_eq!(choose_format(&p, false, true, true), (PixelFormat::Nv12, None));

        p.hdr = true;
        assert_eq!(choose_format(&p, false, true, true).0, PixelFormat::P010);
        assert_eq!(Degrade444::LocalUnsupported.to_string(), "local-unsupported");
    }

    #[test]
    fn test_engine_stamps_pictures() {
        let log = ProbeLog::default();
        let mut p = params();
        p.colorspace = Colorspace::Bt601;
        p.full_range = true;
        let mut engine = DecodeEngine::init(&providers(&log, false), &p, &options(false)).unwrap();
        let mut picture = engine.allocate_picture();

        engine.submit(&AccessUnit::new(vec![0x65], true, 0)).unwrap();
        engine.submit(&AccessUnit::new(vec![0x41], false, 1)).unwrap();
        assert_eq!(engine.in_decoder(), 2);

        assert!(engine.receive(&mut picture).unwrap());
        assert_eq!(picture.sequence, 0);
        assert!(picture.keyframe);
        assert_eq!(picture.colorspace, Colorspace::Bt601);
        assert_eq!(picture.range, ColorRange::Full);
        assert!(picture.submitted_at.is_some());

        assert!(engine.receive(&mut picture).unwrap());
        assert_eq!(picture.sequence, 1);
        assert!(!picture.keyframe);
        assert!(!engine.receive(&mut picture).unwrap());
        assert_eq!(engine.counts(), (2, 2));
    }

    #[test]
    fn test_stream_colour_change_replaces_negotiated() {
        let log = ProbeLog::default();
        let mut engine = DecodeEngine::init(&providers(&log, false), &params(), &options(false)).unwrap();
        let mut picture = engine.allocate_picture();

        engine.submit(&AccessUnit::new(vec![0x65], true, 0)).unwrap();
        assert!(engine.receive(&mut picture).unwrap());
        assert_eq!((picture.colorspace, picture.range), (Colorspace::Bt709, ColorRange::Limited));
        assert_eq!(engine.take_color_change(), None);

        engine.submit(&AccessUnit::new(vec![BT2020_FULL_UNIT], true, 1)).unwrap();
        assert!(engine.receive(&mut picture).unwrap());
        assert_eq!((picture.colorspace, picture.range), (Colorspace::Bt2020, ColorRange::Full));
        assert_eq!(engine.take_color_change(), Some((Colorspace::Bt2020, ColorRange::Full)));
        assert_eq!(engine.take_color_change(), None);

        // an explicit override holds until the stream reports something new
        engine.set_color(Colorspace::Bt601, ColorRange::Limited);
        engine.submit(&AccessUnit::new(vec![0x41], false, 2)).unwrap();
        assert!(engine.receive(&mut picture).unwrap());
        assert_eq!(picture.colorspace, Colorspace::Bt601);
        assert_eq!(engine.take_color_change(), None);
    }

    #[test]
    fn test_no_decoder_is_fatal() {
        let log = ProbeLog::default();
        let providers: Vec<Box<dyn DecoderProvider>> =
            vec![Box::new(MockDecoderProvider::new(DecoderKind::Software, false, false, &log))];
        let err = DecodeEngine::init(&providers, &params(), &options(false)).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rejects_zero_sized_stream() {
        let log = ProbeLog::default();
        let p = StreamParams { width: 0, ..Default::default() };
        assert!(DecodeEngine::init(&providers(&log, true), &p, &options(true)).is_err());
    }
}
