//! Value types that flow between the pipeline stages.
//!
//! The pipeline moves exactly three kinds of payload:
//! - `ByteChunk`: raw bytes straight off the file (reader output)
//! - `AlignedChunk`: bytes trimmed to codec-safe boundaries (parser output)
//! - `PcmChunk`: normalized interleaved samples (decoder output)
//!
//! All of them are plain owned values. A stage releases its chunk by letting
//! it go out of scope; nothing here is shared or reference-counted.

use std::time::Duration;

/// A raw slice of the input file.
///
/// Consecutive chunks from one reader cover a contiguous byte range with no
/// gaps unless a seek happened in between (`is_seek_point` marks the first
/// chunk after open or after a seek).
#[derive(Debug, Clone)]
pub struct ByteChunk {
    pub data: Vec<u8>,
    /// Absolute file offset of `data[0]`.
    pub start_offset: u64,
    /// True for the chunk that reaches end-of-file; it may be short.
    pub is_last: bool,
    /// True for the first chunk after open or an explicit seek.
    pub is_seek_point: bool,
}

impl ByteChunk {
    /// Absolute file offset one past the final byte.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A byte chunk whose trailing edge falls on a codec-safe boundary.
///
/// Produced by the format parser's `align`. Bytes the parser withheld are
/// carried over into the next chunk, so aligned chunks from one stream still
/// cover the audio byte range contiguously.
#[derive(Debug, Clone)]
pub struct AlignedChunk {
    pub data: Vec<u8>,
    /// Absolute file offset of `data[0]`.
    pub start_offset: u64,
    /// True when the parser has seen the end of the audio data.
    pub is_last: bool,
    /// Codec-safe resume positions discovered while aligning this chunk.
    pub seek_points: Vec<SeekPoint>,
    /// Index of the first codec packet in this chunk, for formats whose
    /// packet boundaries come from a table (MP4) rather than the bytes.
    pub first_packet: Option<u64>,
}

impl AlignedChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A run of decoded, normalized, interleaved `f32` samples in [-1, 1].
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// Interleaved samples; `samples.len()` is a multiple of `channel_count`.
    pub samples: Vec<f32>,
    /// Absolute index of the first frame, in per-channel frames, counted from
    /// the post-priming origin (frame 0 is the first musical frame).
    pub start_frame: u64,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// True on the final chunk of the stream (often emitted by `flush`).
    pub is_last: bool,
}

impl PcmChunk {
    /// Number of per-channel frames held.
    pub fn frames(&self) -> usize {
        if self.channel_count == 0 {
            return 0;
        }
        self.samples.len() / self.channel_count as usize
    }

    /// Wall-clock span covered by this chunk.
    pub fn span(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

/// A byte offset at which the decoder may resume without prior context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekPoint {
    pub time: Duration,
    pub byte_offset: u64,
    /// Whether resuming here lands exactly on `time` or at the nearest
    /// codec-safe boundary at or before it.
    pub is_exact: bool,
}

/// Outcome of translating a time to a resume position.
#[derive(Debug, Clone)]
pub struct SeekResult {
    /// Where decoding will actually resume. `actual_time <= requested`.
    pub actual_time: Duration,
    pub byte_offset: u64,
    pub is_exact: bool,
    /// Present when the seek was approximate.
    pub warning: Option<String>,
}

/// A format parser's chunk-size recommendation for a given file.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSizing {
    pub recommended: usize,
    /// Smallest size that still fits the codec's largest frame plus carry-over.
    pub min: usize,
    pub max: usize,
}

impl ChunkSizing {
    /// Resolve the effective chunk size from the recommendation, an optional
    /// caller hint, and an optional per-job memory budget.
    pub fn resolve(&self, hint: Option<usize>, memory_budget: Option<usize>) -> usize {
        let mut size = hint.unwrap_or(self.recommended);
        if let Some(budget) = memory_budget {
            // Keep a single chunk well under the budget so decoded output and
            // the aggregator window fit beside it.
            size = size.min(budget / 4);
        }
        size.clamp(self.min, self.max)
    }
}
