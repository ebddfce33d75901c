//! Boundary with the network/session layer.
//!
//! Inbound: access units tagged keyframe or not, plus the negotiated stream
//! parameters. Outbound: keyframe requests and the pending frame count.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::picture::{ColorRange, Colorspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    Hevc,
    Av1,
}

impl VideoCodec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::H264 => "H.264",
            Self::Hevc => "HEVC",
            Self::Av1 => "AV1",
        }
    }
}

/// One compressed frame's worth of bitstream
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub keyframe: bool,
    pub frame_number: u64,
    pub received_at: Instant,
}

impl AccessUnit {
    pub fn new(data: impl Into<Bytes>, keyframe: bool, frame_number: u64) -> Self {
        Self { data: data.into(), keyframe, frame_number, received_at: Instant::now() }
    }
}

/// Static HDR metadata (SMPTE ST 2086 + CTA-861.3 light levels).
///
/// Chromaticities are in units of 0.00002, max luminance in nits,
/// min luminance in 0.0001 nits, matching the HDMI infoframe encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HdrMetadata {
    pub display_primaries: [(u16, u16); 3],
    pub white_point: (u16, u16),
    pub max_display_luminance: u16,
    pub min_display_luminance: u16,
    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}

/// Parameters negotiated by the session layer before streaming starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamParams {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Client asked for 4:4:4 chroma
    pub yuv444: bool,
    /// Host is able to encode 4:4:4
    pub server_supports_yuv444: bool,
    /// 10-bit HDR stream
    pub hdr: bool,
    pub full_range: bool,
    pub colorspace: Colorspace,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            width: 1920,
            height: 1080,
            fps: 60,
            yuv444: false,
            server_supports_yuv444: false,
            hdr: false,
            full_range: false,
            colorspace: Colorspace::Bt709,
        }
    }
}

impl StreamParams {
    pub fn range(&self) -> ColorRange {
        if self.full_range { ColorRange::Full } else { ColorRange::Limited }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            return Err(crate::error::PipelineError::Config(format!(
                "stream {}x{}@{} has a zero dimension",
                self.width, self.height, self.fps
            )));
        }
        Ok(())
    }
}

/// Control channel back to the session layer
pub trait SessionLink: Send + Sync {
    /// Ask the host for a fresh IDR frame
    fn request_keyframe(&self);

    /// Current HDR metadata, if the host sent any
    fn hdr_metadata(&self) -> Option<HdrMetadata> {
        None
    }
}

// ============================================================================
// Access Unit Queue
// ============================================================================

/// Inbound queue between the network receive path and the decode thread.
///
/// Unbounded on purpose: the network side never blocks. Back-pressure is
/// applied by the frame ring, and the queue depth is what backlog warnings
/// are computed from.
pub struct AccessUnitQueue {
    units: Mutex<VecDeque<AccessUnit>>,
    ready: Condvar,
    closed: AtomicBool,
    pushed: AtomicU64,
}

impl AccessUnitQueue {
    pub fn new() -> Self {
        Self {
            units: Mutex::new(VecDeque::with_capacity(16)),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
        }
    }

    /// Submit an access unit in bitstream order. Returns false once closed.
    pub fn push(&self, unit: AccessUnit) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.units.lock().push_back(unit);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        true
    }

    /// Block until an access unit is available, the timeout expires, or the
    /// queue is closed.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<AccessUnit> {
        let deadline = Instant::now() + timeout;
        let mut units = self.units.lock();
        loop {
            if let Some(unit) = units.pop_front() {
                return Some(unit);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if self.ready.wait_until(&mut units, deadline).timed_out() {
                return units.pop_front();
            }
        }
    }

    /// Drop everything queued, returning how many units were discarded
    pub fn clear(&self) -> usize {
        let mut units = self.units.lock();
        let n = units.len();
        units.clear();
        n
    }

    /// Pending frame count, readable by the session layer for diagnostics
    pub fn pending(&self) -> usize {
        self.units.lock().len()
    }

    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Wake every waiter and refuse further input
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.units.lock();
        self.ready.notify_all();
    }

    /// Accept input again after a reconfiguration
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for AccessUnitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_queue_fifo_and_pending() {
        let queue = AccessUnitQueue::new();
        for i in 0..4 {
            queue.push(AccessUnit::new(vec![i as u8], i == 0, i));
        }
        assert_eq!(queue.pending(), 4);
        let first = queue.pop_blocking(Duration::from_millis(10)).unwrap();
        assert!(first.keyframe);
        assert_eq!(first.frame_number, 0);
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn test_close_wakes_waiter() {
        let queue = Arc::new(AccessUnitQueue::new());
        let q = queue.clone();
        let waiter = thread::spawn(move || q.pop_blocking(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        queue.close();
        assert!(waiter.join().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!queue.push(AccessUnit::new(vec![0], true, 0)));
    }

    #[test]
    fn test_stream_params_validate() {
        assert!(StreamParams::default().validate().is_ok());
        let params = StreamParams { height: 0, ..Default::default() };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_pop_times_out() {
        let queue = AccessUnitQueue::new();
        assert!(queue.pop_blocking(Duration::from_millis(5)).is_none());
    }
}
