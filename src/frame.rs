//! Frames and the rolling evidence buffer.
//!
//! - `Frame`: timestamped RGB8 pixels. Pixels are shared and immutable, so
//!   cloning a frame never copies or aliases a mutable buffer.
//! - `EvidenceBuffer`: bounded ring buffer of recent frames, read back as a
//!   clip once a violation fires.
//!
//! The engine never inspects pixel values. It only checks that a frame is
//! well-formed before acting on detections keyed to it.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Build-time maximum frame buffer capacity.
/// At 20 fps, 600 frames = 30 seconds of pre-roll.
pub const MAX_BUFFER_FRAMES: usize = 600;

/// Bytes per pixel of the RGB8 layout every source produces.
pub const BYTES_PER_PIXEL: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct Frame {
    /// Capture time as an offset from the stream clock origin.
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(timestamp: Duration, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            timestamp,
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// Read-only access to the RGB8 pixel rows.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Rejects zero-size frames and frames whose pixel buffer does not match
    /// the declared dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "malformed frame: zero size ({}x{})",
                self.width,
                self.height
            ));
        }
        let expected = self.width as usize * self.height as usize * BYTES_PER_PIXEL;
        if self.pixels.len() != expected {
            return Err(anyhow!(
                "malformed frame: {} pixel bytes for {}x{} (expected {})",
                self.pixels.len(),
                self.width,
                self.height,
                expected
            ));
        }
        Ok(())
    }

    /// True when both frames share one pixel allocation.
    pub fn shares_pixels_with(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// EvidenceBuffer: Bounded ring buffer for clip assembly
// ----------------------------------------------------------------------------

/// Fixed-capacity rolling window of the most recent frames.
///
/// - `push` is O(1); once full, the oldest frame is dropped
/// - `snapshot` hands out an owned, chronologically ordered copy
pub struct EvidenceBuffer {
    buffer: VecDeque<Frame>,
    capacity: usize,
    pushed: u64,
}

impl EvidenceBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("evidence buffer capacity must be >= 1"));
        }
        if capacity > MAX_BUFFER_FRAMES {
            return Err(anyhow!(
                "evidence buffer capacity {} exceeds maximum of {} frames",
                capacity,
                MAX_BUFFER_FRAMES
            ));
        }
        Ok(Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            pushed: 0,
        })
    }

    pub fn push(&mut self, frame: Frame) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(frame);
        self.pushed += 1;
    }

    /// Up to the last `max_frames` frames, oldest first.
    ///
    /// The returned frames are owned by the caller; later pushes do not
    /// change them and nothing done to them reaches the live buffer.
    pub fn snapshot(&self, max_frames: usize) -> Vec<Frame> {
        let take = max_frames.min(self.buffer.len());
        let skip = self.buffer.len() - take;
        self.buffer.iter().skip(skip).cloned().collect()
    }

    /// Get the most recent frame (non-consuming).
    pub fn latest(&self) -> Option<&Frame> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames pushed since construction, including overwritten ones.
    pub fn frames_pushed(&self) -> u64 {
        self.pushed
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.buffer.iter().map(|f| f.byte_len()).sum()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(t_ms: u64) -> Frame {
        Frame::new(Duration::from_millis(t_ms), 2, 2, vec![(t_ms % 256) as u8; 12])
    }

    fn timestamps(frames: &[Frame]) -> Vec<u64> {
        frames.iter().map(|f| f.timestamp.as_millis() as u64).collect()
    }

    #[test]
    fn frame_validation_rejects_malformed_frames() {
        assert!(make_test_frame(0).validate().is_ok());
        assert!(Frame::new(Duration::ZERO, 0, 4, vec![]).validate().is_err());
        assert!(Frame::new(Duration::ZERO, 4, 4, vec![0; 10]).validate().is_err());
    }

    #[test]
    fn buffer_rejects_zero_and_oversized_capacity() {
        assert!(EvidenceBuffer::new(0).is_err());
        assert!(EvidenceBuffer::new(MAX_BUFFER_FRAMES + 1).is_err());
        assert_eq!(EvidenceBuffer::new(60).unwrap().capacity(), 60);
    }

    #[test]
    fn buffer_enforces_capacity() {
        let mut buf = EvidenceBuffer::new(5).unwrap();
        for i in 0..12 {
            buf.push(make_test_frame(i));
        }
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.frames_pushed(), 12);
        assert_eq!(timestamps(&buf.snapshot(5)), vec![7, 8, 9, 10, 11]);
        assert_eq!(buf.latest().unwrap().timestamp, Duration::from_millis(11));
    }

    #[test]
    fn snapshot_length_is_min_of_request_pushed_and_capacity() {
        let mut buf = EvidenceBuffer::new(4).unwrap();
        assert!(buf.snapshot(3).is_empty());

        buf.push(make_test_frame(1));
        buf.push(make_test_frame(2));
        assert_eq!(timestamps(&buf.snapshot(3)), vec![1, 2]);
        assert_eq!(timestamps(&buf.snapshot(1)), vec![2]);

        for i in 3..10 {
            buf.push(make_test_frame(i));
        }
        assert_eq!(buf.snapshot(100).len(), 4);
        assert_eq!(timestamps(&buf.snapshot(2)), vec![8, 9]);
    }

    #[test]
    fn snapshot_is_independent_of_later_pushes() {
        let mut buf = EvidenceBuffer::new(3).unwrap();
        for i in 0..3 {
            buf.push(make_test_frame(i));
        }
        let mut snap = buf.snapshot(3);
        // frames in the snapshot share pixels with the buffered frames
        // but not with each other
        assert!(snap[2].shares_pixels_with(buf.latest().unwrap()));
        assert!(!snap[0].shares_pixels_with(&snap[1]));
        for i in 3..6 {
            buf.push(make_test_frame(i));
        }
        assert_eq!(timestamps(&snap), vec![0, 1, 2]);

        snap.clear();
        assert_eq!(buf.len(), 3);
        assert_eq!(timestamps(&buf.snapshot(3)), vec![3, 4, 5]);
    }
}
