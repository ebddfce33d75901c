//! # Frame Ring
//!
//! Fixed pool of decoded pictures shared by the decode (producer) and
//! render (consumer) stages. Each slot moves through
//!
//! ```text
//!   Free ──acquire_fill──► Filling ──publish──► Ready
//!    ▲                        │                   │
//!    │                     cancel          acquire_present
//!    │                        ▼                   ▼
//!    └──────────release───────────────────── Presenting
//! ```
//!
//! Slots are filled at `head` and presented at `tail`, so pictures reach
//! the screen in decode order. The picture itself moves out of the ring
//! while a stage holds it and back in on publish/release; a slot cannot be
//! filled again until the renderer has released it.
//!
//! Ready pictures are counted by a semaphore. Slot occupancy is guarded by
//! one mutex and a condition variable the producer waits on when the next
//! slot is not free. `shutdown` wakes both sides.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{PipelineError, Result};
use crate::picture::DecodedPicture;

// ============================================================================
// Semaphore
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Acquired,
    TimedOut,
    Closed,
}

/// Counting semaphore that can be closed to release every waiter
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
    closed: AtomicBool,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self { count: Mutex::new(initial), cond: Condvar::new(), closed: AtomicBool::new(false) }
    }

    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    /// Take one unit, waiting at most `timeout` (forever if `None`)
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return WaitResult::Closed;
            }
            if *count > 0 {
                *count -= 1;
                return WaitResult::Acquired;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut count, deadline).timed_out() {
                        return WaitResult::TimedOut;
                    }
                }
                None => self.cond.wait(&mut count),
            }
        }
    }

    /// Sentinel post: every current and future waiter returns `Closed`
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.count.lock();
        self.cond.notify_all();
    }

    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

// ============================================================================
// Ring
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filling,
    Ready,
    Presenting,
}

/// A slot being filled by the decode stage
#[derive(Debug)]
pub struct FillSlot {
    pub index: usize,
    pub picture: DecodedPicture,
}

/// A slot being drawn by the render stage
#[derive(Debug)]
pub struct PresentSlot {
    pub index: usize,
    pub picture: DecodedPicture,
}

struct RingState {
    states: Vec<SlotState>,
    pictures: Vec<Option<DecodedPicture>>,
    head: usize,
    tail: usize,
    done: bool,
    fill_waits: u64,
}

pub struct FrameRing {
    state: Mutex<RingState>,
    slot_freed: Condvar,
    ready: Semaphore,
    capacity: usize,
}

impl FrameRing {
    /// Build a ring owning `pictures`, one per slot
    pub fn new(pictures: Vec<DecodedPicture>) -> Self {
        let capacity = pictures.len();
        Self {
            state: Mutex::new(RingState {
                states: vec![SlotState::Free; capacity],
                pictures: pictures.into_iter().map(Some).collect(),
                head: 0,
                tail: 0,
                done: false,
                fill_waits: 0,
            }),
            slot_freed: Condvar::new(),
            ready: Semaphore::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the next slot in order, blocking while it is still occupied
    pub fn acquire_fill(&self) -> Result<FillSlot> {
        let mut state = self.state.lock();
        loop {
            if state.done {
                return Err(PipelineError::ShuttingDown);
            }
            let index = state.head;
            if state.states[index] == SlotState::Free {
                let picture = state.pictures[index].take().ok_or_else(|| {
                    PipelineError::ResourceExhausted(format!("free slot {} has no picture", index))
                })?;
                state.states[index] = SlotState::Filling;
                state.head = (index + 1) % self.capacity;
                return Ok(FillSlot { index, picture });
            }
            state.fill_waits += 1;
            tracing::trace!(slot = index, "waiting for slot to be released");
            self.slot_freed.wait(&mut state);
        }
    }

    /// Hand a filled picture to the render stage
    pub fn publish(&self, slot: FillSlot) -> Result<()> {
        {
            let mut state = self.state.lock();
            Self::check(&state, slot.index, SlotState::Filling)?;
            state.states[slot.index] = SlotState::Ready;
            state.pictures[slot.index] = Some(slot.picture);
        }
        self.ready.post();
        Ok(())
    }

    /// Return an unfilled slot; the next acquire gets the same slot
    pub fn cancel(&self, mut slot: FillSlot) -> Result<()> {
        slot.picture.reset();
        let mut state = self.state.lock();
        Self::check(&state, slot.index, SlotState::Filling)?;
        state.states[slot.index] = SlotState::Free;
        state.pictures[slot.index] = Some(slot.picture);
        state.head = slot.index;
        self.slot_freed.notify_all();
        Ok(())
    }

    /// Take the oldest ready picture. `Ok(None)` on timeout.
    pub fn acquire_present(&self, timeout: Option<Duration>) -> Result<Option<PresentSlot>> {
        match self.ready.wait(timeout) {
            WaitResult::Acquired => {}
            WaitResult::TimedOut => return Ok(None),
            WaitResult::Closed => return Err(PipelineError::ShuttingDown),
        }
        let mut state = self.state.lock();
        if state.done {
            return Err(PipelineError::ShuttingDown);
        }
        let index = state.tail;
        Self::check(&state, index, SlotState::Ready)?;
        let picture = state.pictures[index]
            .take()
            .ok_or_else(|| PipelineError::ResourceExhausted(format!("ready slot {} has no picture", index)))?;
        state.states[index] = SlotState::Presenting;
        state.tail = (index + 1) % self.capacity;
        Ok(Some(PresentSlot { index, picture }))
    }

    /// The render stage is done with a picture; its slot becomes free
    pub fn release(&self, mut slot: PresentSlot) -> Result<()> {
        // drops any hardware surface the renderer did not keep
        slot.picture.reset();
        let mut state = self.state.lock();
        Self::check(&state, slot.index, SlotState::Presenting)?;
        state.states[slot.index] = SlotState::Free;
        state.pictures[slot.index] = Some(slot.picture);
        self.slot_freed.notify_all();
        Ok(())
    }

    fn check(state: &RingState, index: usize, expected: SlotState) -> Result<()> {
        match state.states.get(index) {
            Some(s) if *s == expected => Ok(()),
            other => Err(PipelineError::ResourceExhausted(format!(
                "slot {} is {:?}, expected {:?}",
                index, other, expected
            ))),
        }
    }

    /// Set the done flag and wake every waiter on both sides
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.done = true;
            self.slot_freed.notify_all();
        }
        self.ready.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().done
    }

    /// Reset every picture still parked in the ring, returning hardware
    /// surfaces to the decoder. Slots held by a stage are untouched.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        for (s, picture) in state
            .states
            .clone()
            .iter()
            .zip(state.pictures.iter_mut())
        {
            if let Some(picture) = picture {
                if *s == SlotState::Ready {
                    dropped += 1;
                }
                picture.reset();
            }
        }
        for s in state.states.iter_mut() {
            if *s == SlotState::Ready {
                *s = SlotState::Free;
            }
        }
        dropped
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.state.lock().states.get(index).copied()
    }

    /// Pictures decoded but not yet taken by the renderer
    pub fn ready_count(&self) -> usize {
        self.state.lock().states.iter().filter(|s| **s == SlotState::Ready).count()
    }

    /// Slots currently owned by a stage
    pub fn outstanding(&self) -> usize {
        self.state
            .lock()
            .states
            .iter()
            .filter(|s| matches!(s, SlotState::Filling | SlotState::Presenting))
            .count()
    }

    /// Times the producer had to wait for a slot
    pub fn fill_waits(&self) -> u64 {
        self.state.lock().fill_waits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::PixelFormat;
    use std::sync::Arc;
    use std::thread;

    fn ring(n: usize) -> Arc<FrameRing> {
        Arc::new(FrameRing::new(
            (0..n).map(|_| DecodedPicture::allocate(PixelFormat::Yuv420p, 16, 16)).collect(),
        ))
    }

    #[test]
    fn test_presents_in_decode_order() {
        let ring = ring(3);
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for seq in 0..50u64 {
                    let mut slot = ring.acquire_fill().unwrap();
                    slot.picture.sequence = seq;
                    ring.publish(slot).unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 50 {
            let slot = ring.acquire_present(Some(Duration::from_secs(5))).unwrap().unwrap();
            assert_eq!(ring.slot_state(slot.index), Some(SlotState::Presenting));
            seen.push(slot.picture.sequence);
            ring.release(slot).unwrap();
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
        assert_eq!(ring.outstanding(), 0);
    }

    #[test]
    fn test_producer_blocks_after_ring_fills() {
        let ring = ring(3);
        for _ in 0..3 {
            let slot = ring.acquire_fill().unwrap();
            ring.publish(slot).unwrap();
        }
        assert_eq!(ring.ready_count(), 3);

        let blocked = {
            let ring = ring.clone();
            thread::spawn(move || {
                let slot = ring.acquire_fill().unwrap();
                let index = slot.index;
                ring.publish(slot).unwrap();
                index
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());
        // one wait, not a spin
        assert_eq!(ring.fill_waits(), 1);
        assert_eq!(ring.ready_count(), 3);

        let slot = ring.acquire_present(None).unwrap().unwrap();
        assert_eq!(slot.index, 0);
        ring.release(slot).unwrap();
        assert_eq!(blocked.join().unwrap(), 0);
    }

    #[test]
    fn test_presenting_slot_is_not_refilled() {
        let ring = ring(2);
        let a = ring.acquire_fill().unwrap();
        ring.publish(a).unwrap();
        let b = ring.acquire_fill().unwrap();
        ring.publish(b).unwrap();

        let presenting = ring.acquire_present(None).unwrap().unwrap();
        assert_eq!(presenting.index, 0);

        let waiter = {
            let ring = ring.clone();
            thread::spawn(move || ring.acquire_fill().map(|s| s.index))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        ring.release(presenting).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_cancel_reuses_slot() {
        let ring = ring(3);
        let slot = ring.acquire_fill().unwrap();
        assert_eq!(slot.index, 0);
        ring.cancel(slot).unwrap();
        let again = ring.acquire_fill().unwrap();
        assert_eq!(again.index, 0);
        assert!(ring.acquire_present(Some(Duration::from_millis(5))).unwrap().is_none());
        ring.publish(again).unwrap();
        assert_eq!(ring.acquire_present(Some(Duration::from_millis(5))).unwrap().unwrap().index, 0);
    }

    #[test]
    fn test_shutdown_wakes_both_sides() {
        let ring = ring(2);
        for _ in 0..2 {
            let slot = ring.acquire_fill().unwrap();
            ring.publish(slot).unwrap();
        }
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || ring.acquire_fill().map(|_| ()))
        };
        let empty = self::ring(2);
        let consumer = {
            let empty = empty.clone();
            thread::spawn(move || empty.acquire_present(None).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        ring.shutdown();
        empty.shutdown();
        assert!(matches!(producer.join().unwrap(), Err(PipelineError::ShuttingDown)));
        assert!(matches!(consumer.join().unwrap(), Err(PipelineError::ShuttingDown)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_release_out_of_state_is_an_error() {
        let ring = ring(2);
        let slot = ring.acquire_fill().unwrap();
        let bogus = PresentSlot { index: slot.index, picture: DecodedPicture::allocate(PixelFormat::Nv12, 2, 2) };
        assert!(matches!(ring.release(bogus), Err(PipelineError::ResourceExhausted(_))));
    }

    #[test]
    fn test_clear_returns_hardware_surfaces() {
        let source = crate::testing::MockSurfaceSource::new(4);
        let ring = ring(3);
        let mut slot = ring.acquire_fill().unwrap();
        slot.picture.surface = Some(source.surface(2));
        ring.publish(slot).unwrap();
        assert_eq!(source.outstanding(), 1);

        assert_eq!(ring.clear(), 1);
        assert_eq!(source.outstanding(), 0);
        assert_eq!(ring.slot_state(0), Some(SlotState::Free));
    }

    #[test]
    fn test_semaphore_timeout_and_close() {
        let sem = Semaphore::new(1);
        assert_eq!(sem.wait(Some(Duration::from_millis(1))), WaitResult::Acquired);
        assert_eq!(sem.wait(Some(Duration::from_millis(1))), WaitResult::TimedOut);
        sem.post();
        assert_eq!(sem.available(), 1);
        sem.close();
        assert_eq!(sem.wait(None), WaitResult::Closed);
    }
}
