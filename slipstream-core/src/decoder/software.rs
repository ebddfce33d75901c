//! Software H.264 decoding through OpenH264.
//!
//! OpenH264 hands back a borrowed picture per access unit, so frames are
//! copied once into a small staging pool at submit time. `receive` then
//! swaps buffers with the ring picture instead of copying again.

use std::collections::VecDeque;

use openh264::decoder::Decoder;
use openh264::formats::YUVSource;

use super::{DecoderInit, DecoderKind, DecoderProvider, VideoDecoder};
use crate::error::{PipelineError, Result};
use crate::network::{AccessUnit, VideoCodec};
use crate::picture::{DecodedPicture, PixelFormat};

const NAME: &str = "openh264";

/// Decoded frames waiting for `receive`; more means the caller stopped draining
const MAX_STAGED: usize = 4;

pub struct SoftwareProvider;

impl DecoderProvider for SoftwareProvider {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Software
    }

    fn name(&self) -> &str {
        NAME
    }

    fn supports(&self, codec: VideoCodec) -> bool {
        codec == VideoCodec::H264
    }

    fn supports_444(&self, _codec: VideoCodec) -> bool {
        // constrained baseline/high profiles only
        false
    }

    fn open(&self, init: &DecoderInit) -> Result<Box<dyn VideoDecoder>> {
        Ok(Box::new(SoftwareDecoder::new(init)?))
    }
}

pub struct SoftwareDecoder {
    decoder: Decoder,
    width: u32,
    height: u32,
    ready: VecDeque<DecodedPicture>,
    spare: Vec<DecodedPicture>,
    frames: u64,
}

impl SoftwareDecoder {
    pub fn new(init: &DecoderInit) -> Result<Self> {
        if init.codec != VideoCodec::H264 {
            return Err(PipelineError::BackendUnavailable(format!("{} cannot decode {}", NAME, init.codec.name())));
        }
        if init.format != PixelFormat::Yuv420p {
            tracing::debug!(requested = ?init.format, "software decoder only produces 4:2:0");
        }
        if init.threads > 0 {
            tracing::debug!(threads = init.threads, "thread hint ignored, OpenH264 decodes on the caller's thread");
        }
        let decoder = Decoder::new()
            .map_err(|e| PipelineError::BackendUnavailable(format!("OpenH264 init failed: {:?}", e)))?;
        Ok(Self {
            decoder,
            width: init.width,
            height: init.height,
            ready: VecDeque::with_capacity(MAX_STAGED),
            spare: Vec::with_capacity(MAX_STAGED),
            frames: 0,
        })
    }

    fn staging_picture(
        ready: &VecDeque<DecodedPicture>,
        spare: &mut Vec<DecodedPicture>,
        width: u32,
        height: u32,
    ) -> Result<DecodedPicture> {
        if ready.len() >= MAX_STAGED {
            return Err(PipelineError::ResourceExhausted(format!(
                "{} decoded frames were never received",
                ready.len()
            )));
        }
        let mut picture = spare
            .pop()
            .unwrap_or_else(|| DecodedPicture::allocate(PixelFormat::Yuv420p, width, height));
        picture.reshape(PixelFormat::Yuv420p, width, height);
        Ok(picture)
    }
}

/// Copy strided Y, U and V planes into `picture`
fn copy_planes(sources: [(&[u8], usize); 3], picture: &mut DecodedPicture) -> bool {
    picture
        .planes
        .iter_mut()
        .zip(sources)
        .all(|(plane, (src, stride))| plane.copy_from(src, stride))
}

impl VideoDecoder for SoftwareDecoder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn output_format(&self) -> PixelFormat {
        PixelFormat::Yuv420p
    }

    fn submit(&mut self, unit: &AccessUnit) -> Result<()> {
        let decoded = self
            .decoder
            .decode(&unit.data)
            .map_err(|e| PipelineError::decode(NAME, format!("{:?}", e)))?;

        let Some(yuv) = decoded else {
            // parameter sets or a frame still being reordered
            return Ok(());
        };

        let (w, h) = yuv.dimensions();
        let (width, height) = (w as u32, h as u32);
        if (width, height) != (self.width, self.height) {
            tracing::info!("stream resolution changed {}x{} -> {}x{}", self.width, self.height, width, height);
            self.width = width;
            self.height = height;
        }

        let mut staged = Self::staging_picture(&self.ready, &mut self.spare, width, height)?;
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let sources = [(yuv.y(), y_stride), (yuv.u(), u_stride), (yuv.v(), v_stride)];
        if !copy_planes(sources, &mut staged) {
            self.spare.push(staged);
            return Err(PipelineError::decode(NAME, "decoded planes smaller than reported size"));
        }
        self.ready.push_back(staged);
        self.frames += 1;
        Ok(())
    }

    fn receive(&mut self, picture: &mut DecodedPicture) -> Result<bool> {
        let Some(mut staged) = self.ready.pop_front() else {
            return Ok(false);
        };
        picture.surface = None;
        picture.swap_contents(&mut staged);
        self.spare.push(staged);
        Ok(true)
    }

    fn reset(&mut self) -> Result<()> {
        while let Some(staged) = self.ready.pop_front() {
            self.spare.push(staged);
        }
        // OpenH264 has no flush-and-forget; a fresh instance drops all references
        self.decoder = Decoder::new().map_err(|e| PipelineError::decode(NAME, format!("reinit: {:?}", e)))?;
        tracing::debug!(frames = self.frames, "software decoder reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(codec: VideoCodec) -> DecoderInit {
        DecoderInit { codec, width: 4, height: 2, format: PixelFormat::Yuv420p, pool_size: 0, threads: 0 }
    }

    #[test]
    fn test_copy_strips_stride_padding() {
        let y: Vec<u8> = (0..16).collect();
        let (u, v) = ([7u8; 4], [9u8; 4]);
        let mut picture = DecodedPicture::allocate(PixelFormat::Yuv420p, 4, 2);
        assert!(copy_planes([(&y, 8), (&u, 4), (&v, 4)], &mut picture));
        assert_eq!(picture.planes[0].row(0), &[0, 1, 2, 3]);
        assert_eq!(picture.planes[0].row(1), &[8, 9, 10, 11]);
        assert_eq!(picture.planes[1].row(0), &[7, 7]);
        assert_eq!(picture.planes[2].row(0), &[9, 9]);
    }

    #[test]
    fn test_short_source_rejected() {
        let (y, c) = ([0u8; 6], [0u8; 4]);
        let mut picture = DecodedPicture::allocate(PixelFormat::Yuv420p, 4, 2);
        assert!(!copy_planes([(&y, 8), (&c, 4), (&c, 4)], &mut picture));
    }

    #[test]
    fn test_provider_is_h264_only() {
        assert!(SoftwareProvider.supports(VideoCodec::H264));
        assert!(!SoftwareProvider.supports(VideoCodec::Av1));
        assert!(!SoftwareProvider.supports_444(VideoCodec::H264));
        assert!(SoftwareProvider.open(&init(VideoCodec::Hevc)).is_err());
    }

    #[test]
    fn test_receive_empty_and_reset() {
        let mut decoder = SoftwareDecoder::new(&init(VideoCodec::H264)).unwrap();
        let mut picture = DecodedPicture::allocate(PixelFormat::Yuv420p, 4, 2);
        assert!(!decoder.receive(&mut picture).unwrap());
        decoder.reset().unwrap();
        assert!(!decoder.receive(&mut picture).unwrap());
    }

    #[test]
    fn test_receive_swaps_staged_buffers() {
        let mut decoder = SoftwareDecoder::new(&init(VideoCodec::H264)).unwrap();
        let mut staged = SoftwareDecoder::staging_picture(&decoder.ready, &mut decoder.spare, 4, 2).unwrap();
        staged.planes[0].data[0] = 42;
        decoder.ready.push_back(staged);

        let mut picture = DecodedPicture::allocate(PixelFormat::Yuv420p, 16, 16);
        assert!(decoder.receive(&mut picture).unwrap());
        assert_eq!(picture.width, 4);
        assert_eq!(picture.planes[0].row(0)[0], 42);
        assert_eq!(decoder.spare.len(), 1);
        assert_eq!(decoder.spare[0].width, 16);
    }
}
