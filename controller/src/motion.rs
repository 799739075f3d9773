use std::{
    io::ErrorKind,
    time::{Duration, Instant},
};

use motion_power_common::MotionVector;
use tokio::io::{AsyncRead, AsyncReadExt};

pub type MotionFrame = Vec<MotionVector>;

/// Frame size in macroblocks. The encoder writes one extra column per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub columns: usize,
    pub rows: usize,
}

impl FrameGeometry {
    pub fn vector_count(&self) -> usize {
        (self.columns + 1) * self.rows
    }

    pub fn byte_len(&self) -> usize {
        self.vector_count() * MotionVector::SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionResult {
    pub count: u32,
    pub triggered: bool,
}

/// Counts the vectors longer than `magnitude_threshold`.
///
/// Squared lengths are compared so a vector exactly at the threshold never counts.
/// Every vector is looked at because `count` gets sent to the listener.
pub fn score(
    frame: &[MotionVector],
    magnitude_threshold: u32,
    total_threshold: u32,
) -> DetectionResult {
    let limit = u64::from(magnitude_threshold).pow(2);
    let count = frame
        .iter()
        .filter(|vector| u64::from(vector.magnitude_squared()) > limit)
        .count() as u32;
    DetectionResult {
        count,
        triggered: count >= total_threshold,
    }
}

/// Reads whole frames from the encoder's motion vector output
pub struct FrameReader<R> {
    reader: R,
    geometry: FrameGeometry,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, geometry: FrameGeometry) -> Self {
        Self {
            reader,
            geometry,
            buf: vec![0; geometry.byte_len()],
        }
    }

    /// Returns `None` once the stream ends, including in the middle of a frame
    pub async fn next_frame(&mut self) -> std::io::Result<Option<MotionFrame>> {
        match self.reader.read_exact(&mut self.buf).await {
            Ok(_) => {}
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(error) => return Err(error),
        }
        let frame = self
            .buf
            .chunks_exact(MotionVector::SIZE)
            .map(|chunk| MotionVector::from_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect::<MotionFrame>();
        debug_assert_eq!(frame.len(), self.geometry.vector_count());
        Ok(Some(frame))
    }
}

/// Lets through at most one frame per interval. The rest still have to be read.
pub struct Sampler {
    interval: Duration,
    last_scored: Option<Instant>,
}

impl Sampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_scored: None,
        }
    }

    pub fn should_score(&mut self, now: Instant) -> bool {
        match self.last_scored {
            Some(last_scored) if now.saturating_duration_since(last_scored) < self.interval => {
                false
            }
            _ => {
                self.last_scored = Some(now);
                true
            }
        }
    }
}
