//! Elementary-stream replay standing in for the network layer.
//!
//! Splits an Annex B file into access units and feeds them to the session
//! queue at the stream frame rate. A keyframe request from the pipeline
//! makes the feeder jump to the next IDR/IRAP, which is what a real host
//! encoder would answer with.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::Serialize;

use slipstream_core::bitstream;
use slipstream_core::network::{AccessUnit, AccessUnitQueue, SessionLink, VideoCodec};

/// One access unit of the replayed file
#[derive(Debug, Clone)]
pub struct ReplayUnit {
    pub data: Bytes,
    pub keyframe: bool,
}

/// Guess the codec from the file extension
pub fn codec_for(path: &Path) -> Option<VideoCodec> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "h264" | "264" | "avc" => Some(VideoCodec::H264),
        "h265" | "265" | "hevc" => Some(VideoCodec::Hevc),
        _ => None,
    }
}

/// Read and split an Annex B elementary stream
pub fn load(path: &Path, codec: VideoCodec) -> Result<Vec<ReplayUnit>> {
    if codec == VideoCodec::Av1 {
        bail!("AV1 has no Annex B framing, replay needs H.264 or HEVC");
    }
    let stream = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if !bitstream::is_annexb(&stream) {
        bail!("{} is not an Annex B elementary stream", path.display());
    }

    let units: Vec<ReplayUnit> = bitstream::split_access_units(codec, &stream)
        .into_iter()
        .map(|au| {
            let keyframe = bitstream::is_keyframe(codec, &au);
            ReplayUnit { data: Bytes::from(au), keyframe }
        })
        .collect();
    if !units.iter().any(|u| u.keyframe) {
        bail!("{} contains no keyframe", path.display());
    }

    tracing::info!(
        file = %path.display(),
        units = units.len(),
        keyframes = units.iter().filter(|u| u.keyframe).count(),
        "stream loaded"
    );
    Ok(units)
}

/// Index of the first keyframe at or after `from`, wrapping when looping
fn next_keyframe(units: &[ReplayUnit], from: usize, looping: bool) -> Option<usize> {
    let tail = units.iter().skip(from).position(|u| u.keyframe).map(|i| from + i);
    match tail {
        Some(i) => Some(i),
        None if looping => units.iter().position(|u| u.keyframe),
        None => None,
    }
}

// ============================================================================
// Session Link
// ============================================================================

/// What the pipeline sends back to the "host"
#[derive(Debug, Default)]
pub struct ReplayLink {
    keyframe_wanted: AtomicBool,
    keyframe_requests: AtomicU64,
}

impl ReplayLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn take_request(&self) -> bool {
        self.keyframe_wanted.swap(false, Ordering::SeqCst)
    }

    pub fn keyframe_requests(&self) -> u64 {
        self.keyframe_requests.load(Ordering::Relaxed)
    }
}

impl SessionLink for ReplayLink {
    fn request_keyframe(&self) {
        self.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        self.keyframe_wanted.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Feeder
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub sent: u64,
    pub keyframe_seeks: u64,
    pub loops: u64,
}

pub struct Replay {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<ReplayStats>>,
}

impl Replay {
    pub fn spawn(
        units: Vec<ReplayUnit>,
        fps: u32,
        looping: bool,
        queue: Arc<AccessUnitQueue>,
        link: Arc<ReplayLink>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let interval = Duration::from_secs(1) / fps.max(1);

        let feeder = Feeder { units, interval, looping, queue, link, stop: stop.clone() };
        let done = finished.clone();
        let handle = thread::Builder::new()
            .name("slipstream-replay".into())
            .spawn(move || {
                let stats = feeder.run();
                done.store(true, Ordering::SeqCst);
                stats
            })
            .context("spawning replay thread")?;

        Ok(Self { stop, finished, handle: Some(handle) })
    }

    /// Every access unit has been handed to the session
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn stop(mut self) -> ReplayStats {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.take().and_then(|h| h.join().ok()).unwrap_or_default()
    }
}

impl Drop for Replay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

struct Feeder {
    units: Vec<ReplayUnit>,
    interval: Duration,
    looping: bool,
    queue: Arc<AccessUnitQueue>,
    link: Arc<ReplayLink>,
    stop: Arc<AtomicBool>,
}

impl Feeder {
    fn run(self) -> ReplayStats {
        let mut stats = ReplayStats::default();
        let mut index = 0;
        let mut next_due = Instant::now();

        while !self.stop.load(Ordering::SeqCst) {
            if self.link.take_request() {
                match next_keyframe(&self.units, index, self.looping) {
                    Some(key) => {
                        tracing::info!(from = index, to = key, "keyframe requested, seeking");
                        index = key;
                        stats.keyframe_seeks += 1;
                    }
                    None => {
                        tracing::info!("keyframe requested but none left in stream");
                        break;
                    }
                }
            }

            if index >= self.units.len() {
                if !self.looping {
                    break;
                }
                index = 0;
                stats.loops += 1;
            }

            let unit = &self.units[index];
            if !self.queue.push(AccessUnit::new(unit.data.clone(), unit.keyframe, stats.sent)) {
                tracing::debug!("session queue closed");
                break;
            }
            stats.sent += 1;
            index += 1;

            next_due += self.interval;
            let now = Instant::now();
            if next_due > now {
                thread::sleep(next_due - now);
            } else {
                // running late, do not try to catch up in a burst
                next_due = now;
            }
        }

        tracing::info!(sent = stats.sent, seeks = stats.keyframe_seeks, "replay finished");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn unit(keyframe: bool) -> ReplayUnit {
        ReplayUnit { data: Bytes::from_static(&[0, 0, 0, 1, 0x65]), keyframe }
    }

    #[test]
    fn test_codec_from_extension() {
        assert_eq!(codec_for(Path::new("a.h264")), Some(VideoCodec::H264));
        assert_eq!(codec_for(Path::new("b.HEVC")), Some(VideoCodec::Hevc));
        assert_eq!(codec_for(Path::new("c.mkv")), None);
    }

    #[test]
    fn test_next_keyframe() {
        let units = vec![unit(true), unit(false), unit(false), unit(true), unit(false)];
        assert_eq!(next_keyframe(&units, 1, false), Some(3));
        assert_eq!(next_keyframe(&units, 3, false), Some(3));
        assert_eq!(next_keyframe(&units, 4, false), None);
        assert_eq!(next_keyframe(&units, 4, true), Some(0));
    }

    #[test]
    fn test_load_rejects_non_annexb() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a bitstream").unwrap();
        assert!(load(file.path(), VideoCodec::H264).is_err());
    }

    #[test]
    fn test_feeds_in_order_then_finishes() {
        let queue = Arc::new(AccessUnitQueue::new());
        let link = ReplayLink::new();
        let units = vec![unit(true), unit(false), unit(false)];
        let replay = Replay::spawn(units, 1000, false, queue.clone(), link).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !replay.finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = replay.stop();
        assert_eq!(stats.sent, 3);
        let numbers: Vec<u64> = (0..3).filter_map(|_| queue.pop_blocking(Duration::ZERO)).map(|u| u.frame_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_keyframe_request_skips_ahead() {
        let queue = Arc::new(AccessUnitQueue::new());
        let link = ReplayLink::new();
        link.request_keyframe();
        let units = vec![unit(false), unit(false), unit(true), unit(false)];
        let replay = Replay::spawn(units, 1000, false, queue.clone(), link.clone()).unwrap();
        let stats = replay.stop_when_finished();
        assert_eq!(stats.keyframe_seeks, 1);
        assert_eq!(stats.sent, 2);
        let first = queue.pop_blocking(Duration::ZERO).unwrap();
        assert!(first.keyframe);
        assert_eq!(link.keyframe_requests(), 1);
    }

    impl Replay {
        fn stop_when_finished(self) -> ReplayStats {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !self.finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            self.stop()
        }
    }
}
