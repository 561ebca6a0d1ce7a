//! `waveline`: bounded-memory waveform summaries for large audio files.
//!
//! This crate turns compressed audio (MP3, WAV, FLAC, OGG Vorbis, Opus, and
//! MP4/AAC) into fixed-resolution amplitude sequences suitable for rendering,
//! using a chunked streaming pipeline whose working set does not grow with
//! the input: a 10 GB file costs the same memory as a 1 MB file.
//!
//! This crate provides:
//! - A chunked file reader and per-format chunk parsers (frame/page/sample
//!   alignment, seek points, encoder-delay detection)
//! - Streaming decoder adapters over Symphonia (and audiopus for Opus)
//! - A downsampling aggregator with exact output resolution
//! - A worker pool with progress reporting, cancellation, deadlines, and a
//!   global memory budget
//!
//! The library is designed to be embedded in apps and services; for one-off
//! use, [`summarize_file`] runs a whole job inline:
//!
//! ```no_run
//! let summary = waveline::summarize_file("album/track01.flac", 800)?;
//! assert_eq!(summary.resolution(), 800);
//! # Ok::<(), waveline::Error>(())
//! ```

// Streaming pipeline stages, leaves first.
pub mod chunk;
pub mod reader;

pub mod format;

pub mod decode;

pub mod aggregator;

// Job orchestration.
pub mod pipeline;
pub mod pool;
pub mod progress;

// Shared vocabulary.
pub mod error;
pub mod job;
pub mod summary;

// Logging configuration and control.
pub mod logging;

pub use error::{Error, Result};
pub use job::{Algorithm, JobDescriptor, Normalization, ScalingCurve};
pub use logging::init as init_logging;
pub use pipeline::{summarize, summarize_file};
pub use pool::{JobHandle, JobId, PoolConfig, PoolStats, WaveformPool};
pub use progress::{CancelHandle, CancelReason, Progress};
pub use summary::AudioSummary;
