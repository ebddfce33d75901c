//! Annex B bitstream utilities
//!
//! Start-code scanning, NAL classification and access-unit splitting for
//! H.264 and HEVC elementary streams. Used for keyframe detection during
//! resync and by stream replay sources.

use crate::network::VideoCodec;

/// Annex B start code (4-byte version)
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Check if data begins with an Annex B start code
pub fn is_annexb(data: &[u8]) -> bool {
    if data.len() < 3 {
        return false;
    }
    (data.len() >= 4 && data[0] == 0 && data[1] == 0 && data[2] == 0 && data[3] == 1)
        || (data[0] == 0 && data[1] == 0 && data[2] == 1)
}

/// Iterate NAL payloads (start codes stripped) of an Annex B buffer
pub fn nal_units(data: &[u8]) -> NalIter<'_> {
    NalIter { data, pos: find_start_code(data, 0).map(|(_, end)| end) }
}

pub struct NalIter<'a> {
    data: &'a [u8],
    pos: Option<usize>,
}

impl<'a> Iterator for NalIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.pos?;
        match find_start_code(self.data, start) {
            Some((code_start, next)) => {
                self.pos = Some(next);
                Some(trim_trailing_zeros(&self.data[start..code_start]))
            }
            None => {
                self.pos = None;
                (start < self.data.len()).then(|| &self.data[start..])
            }
        }
    }
}

/// Returns (start of the start code, first byte after it)
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let start = if i > from && data[i - 1] == 0 { i - 1 } else { i };
            return Some((start, i + 3));
        }
        i += 1;
    }
    None
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let mut end = nal.len();
    while end > 0 && nal[end - 1] == 0 {
        end -= 1;
    }
    &nal[..end]
}

// ============================================================================
// NAL Classification
// ============================================================================

pub fn h264_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

pub fn hevc_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3F)
}

const H264_NAL_IDR: u8 = 5;
const H264_NAL_SEI: u8 = 6;
const H264_NAL_SPS: u8 = 7;
const H264_NAL_PPS: u8 = 8;
const H264_NAL_AUD: u8 = 9;

const HEVC_NAL_IRAP_FIRST: u8 = 16;
const HEVC_NAL_IRAP_LAST: u8 = 21;
const HEVC_NAL_VPS: u8 = 32;
const HEVC_NAL_AUD: u8 = 35;
const HEVC_NAL_PREFIX_SEI: u8 = 39;

const AV1_OBU_SEQUENCE_HEADER: u8 = 1;

/// Does this access unit start a decodable sequence?
pub fn is_keyframe(codec: VideoCodec, access_unit: &[u8]) -> bool {
    match codec {
        VideoCodec::H264 => nal_units(access_unit)
            .any(|nal| h264_nal_type(nal) == Some(H264_NAL_IDR)),
        VideoCodec::Hevc => nal_units(access_unit).any(|nal| {
            matches!(hevc_nal_type(nal), Some(t) if (HEVC_NAL_IRAP_FIRST..=HEVC_NAL_IRAP_LAST).contains(&t))
        }),
        // Low-overhead OBU stream: a key frame carries a sequence header first
        VideoCodec::Av1 => access_unit
            .first()
            .map(|b| (b >> 3) & 0x0F == AV1_OBU_SEQUENCE_HEADER)
            .unwrap_or(false),
    }
}

/// Is this NAL a VCL NAL that begins a new picture?
fn starts_picture(codec: VideoCodec, nal: &[u8]) -> bool {
    match codec {
        VideoCodec::H264 => {
            let t = nal[0] & 0x1F;
            // first_mb_in_slice == 0 is ue(v) "1"
            (1..=5).contains(&t) && nal.len() > 1 && nal[1] & 0x80 != 0
        }
        VideoCodec::Hevc => {
            let t = (nal[0] >> 1) & 0x3F;
            t < 32 && nal.len() > 2 && nal[2] & 0x80 != 0
        }
        VideoCodec::Av1 => false,
    }
}

/// Non-VCL NALs that may only appear before the first slice of an AU
fn starts_prefix(codec: VideoCodec, nal: &[u8]) -> bool {
    match codec {
        VideoCodec::H264 => matches!(
            nal[0] & 0x1F,
            H264_NAL_AUD | H264_NAL_SPS | H264_NAL_PPS | H264_NAL_SEI
        ),
        VideoCodec::Hevc => {
            let t = (nal[0] >> 1) & 0x3F;
            (HEVC_NAL_VPS..=HEVC_NAL_AUD).contains(&t) || t == HEVC_NAL_PREFIX_SEI
        }
        VideoCodec::Av1 => false,
    }
}

/// Split an Annex B elementary stream into access units.
///
/// Each returned access unit keeps its start codes so it can be fed to a
/// decoder verbatim.
pub fn split_access_units(codec: VideoCodec, stream: &[u8]) -> Vec<Vec<u8>> {
    let mut units = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut has_picture = false;

    for nal in nal_units(stream) {
        if nal.is_empty() {
            continue;
        }
        let boundary = has_picture && (starts_prefix(codec, nal) || starts_picture(codec, nal));
        if boundary {
            units.push(std::mem::take(&mut current));
            has_picture = false;
        }
        if starts_picture(codec, nal) || (!starts_prefix(codec, nal) && codec != VideoCodec::Av1) {
            has_picture = true;
        }
        current.extend_from_slice(&ANNEX_B_START_CODE);
        current.extend_from_slice(nal);
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_stream() -> Vec<u8> {
        let mut s = Vec::new();
        // SPS, PPS, IDR slice
        for nal in [&[0x67, 0x42, 0x00][..], &[0x68, 0xCE], &[0x65, 0x88, 0x80]] {
            s.extend_from_slice(&ANNEX_B_START_CODE);
            s.extend_from_slice(nal);
        }
        // Two P slices, each a new picture (first_mb_in_slice = 0)
        for _ in 0..2 {
            s.extend_from_slice(&[0, 0, 1]);
            s.extend_from_slice(&[0x41, 0x9A, 0x01]);
        }
        s
    }

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb(&[0x00, 0x00, 0x00, 0x05, 0x67]));
    }

    #[test]
    fn test_nal_iteration_handles_both_start_codes() {
        let stream = h264_stream();
        let nals: Vec<&[u8]> = nal_units(&stream).collect();
        assert_eq!(nals.len(), 5);
        assert_eq!(h264_nal_type(nals[0]), Some(7));
        assert_eq!(h264_nal_type(nals[2]), Some(5));
        assert_eq!(nals[3], &[0x41, 0x9A, 0x01]);
    }

    #[test]
    fn test_split_access_units() {
        let units = split_access_units(VideoCodec::H264, &h264_stream());
        assert_eq!(units.len(), 3);
        assert!(is_keyframe(VideoCodec::H264, &units[0]));
        assert!(!is_keyframe(VideoCodec::H264, &units[1]));
        assert!(!is_keyframe(VideoCodec::H264, &units[2]));
    }

    #[test]
    fn test_hevc_keyframe() {
        // IDR_W_RADL (19) NAL header: type << 1
        let au = [0, 0, 0, 1, 19 << 1, 0x01, 0x80];
        assert!(is_keyframe(VideoCodec::Hevc, &au));
        // TRAIL_R (1)
        let au = [0, 0, 0, 1, 1 << 1, 0x01, 0x80];
        assert!(!is_keyframe(VideoCodec::Hevc, &au));
    }
}
