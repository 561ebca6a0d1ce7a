//! The per-job pipeline: read → align → decode → aggregate.
//!
//! One job runs the four stages as a pull loop on a single thread, one chunk
//! at a time. That gives the three properties the streaming design needs
//! without any cross-thread machinery inside a job:
//! - laziness: no chunk exists before the loop asks the reader for it,
//! - backpressure: the next chunk is only read after the current one has
//!   been aggregated and released,
//! - cancellability: the shared token is checked at every chunk boundary.
//!
//! Error policy (applied here, surfaced by the stages):
//! - a chunk that decodes to nothing is skipped, up to the job's
//!   consecutive-failure budget, then the job aborts with `PartialFailure`;
//! - memory refusals from the watchdog halve the chunk size and retry the
//!   same chunk, twice, then abort with the memory error;
//! - sustained memory pressure halves the chunk size for subsequent chunks.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::aggregator::WaveformAggregator;
use crate::decode::StreamDecoder;
use crate::error::{Error, Result};
use crate::format::FormatParser;
use crate::job::JobDescriptor;
use crate::pool::MemoryWatchdog;
use crate::progress::{CancelHandle, CancelReason, Progress};
use crate::reader::{ChunkReader, MIN_CHUNK_SIZE};
use crate::summary::AudioSummary;

/// How many watchdog-driven halvings a single chunk may retry before the
/// job aborts with the memory error.
const MAX_MEMORY_HALVINGS: u32 = 2;

/// Fraction of the budget at which the watchdog's pressure signal shrinks
/// subsequent chunks.
pub(crate) const PRESSURE_FRACTION: f64 = 0.8;

/// Run one job to completion on the calling thread.
///
/// `publish` receives interim progress records; the terminal record is the
/// caller's responsibility (the pool sends it alongside the result).
pub(crate) fn run_job(
    job: &JobDescriptor,
    cancel: &CancelHandle,
    watchdog: &MemoryWatchdog,
    mut publish: impl FnMut(Progress),
) -> Result<AudioSummary> {
    if job.resolution == 0 {
        return Err(Error::Other("target resolution must be at least 1".into()));
    }

    let deadline = job.deadline.map(|limit| Instant::now() + limit);
    check_stop(cancel, deadline)?;

    let mut reader = ChunkReader::open(&job.path, MIN_CHUNK_SIZE)?;
    let mut parser = FormatParser::new(&mut reader)?;
    let info = parser.stream_info().clone();

    info!(
        path = %job.path.display(),
        format = info.format.name(),
        sample_rate = info.sample_rate,
        channels = info.channel_count,
        total_frames = ?info.total_frames,
        "starting waveform job"
    );

    let sizing = parser.optimal_chunk_size(reader.size_bytes());
    let mut chunk_size = sizing.resolve(job.chunk_size_hint, job.memory_budget);
    reader.set_chunk_size(chunk_size);

    let mut decoder = StreamDecoder::new(&info, parser.decoder_spec())?;
    let mut aggregator = WaveformAggregator::new(
        job.resolution,
        job.algorithm,
        job.normalization,
        job.scaling_curve,
        job.smoothing_window,
        info.total_frames,
    );

    reader.seek_to_byte(info.audio_start)?;

    let file_size = reader.size_bytes().max(1);
    let mut consecutive_failures = 0u32;
    let mut memory_halvings = 0u32;
    let mut first_decode_error: Option<Error> = None;
    let mut first_record = true;

    loop {
        check_stop(cancel, deadline)?;

        // Reserve the chunk (plus alignment carry) against the global
        // budget before it exists; refusal retries the same chunk smaller.
        let reservation = match watchdog.reserve(chunk_size + parser.carry_over_len()) {
            Ok(reservation) => reservation,
            Err(err) if err.wants_smaller_chunks() => {
                if memory_halvings >= MAX_MEMORY_HALVINGS || chunk_size <= sizing.min {
                    return Err(err);
                }
                memory_halvings += 1;
                chunk_size = (chunk_size / 2).max(sizing.min);
                reader.set_chunk_size(chunk_size);
                warn!(chunk_size, "memory refusal; retrying chunk halved");
                continue;
            }
            Err(err) => return Err(err),
        };

        let Some(byte_chunk) = reader.read_next()? else {
            break;
        };
        let is_last = byte_chunk.is_last;
        let bytes_consumed = byte_chunk.end_offset();

        let aligned = parser.align(byte_chunk)?;
        let stream_done = aligned.is_last;

        match decoder.feed(&aligned) {
            Ok(pcm_chunks) => {
                consecutive_failures = 0;
                let mut produced = false;
                for pcm in &pcm_chunks {
                    aggregator.push(pcm)?;
                    produced = true;
                }
                if produced {
                    let fraction = (bytes_consumed as f64 / file_size as f64) as f32;
                    let partial = job.report_partial.then(|| aggregator.snapshot());
                    let record = Progress::interim(fraction, partial);
                    let record = if first_record {
                        first_record = false;
                        record.with_status("decoding audio")
                    } else {
                        record
                    };
                    publish(record);
                }
            }
            Err(err) if err.is_recoverable_decode() => {
                consecutive_failures += 1;
                warn!(
                    %err,
                    consecutive_failures,
                    budget = job.max_consecutive_failures,
                    "chunk decode failed; skipping"
                );
                if consecutive_failures > job.max_consecutive_failures {
                    let first = first_decode_error.take().unwrap_or(err);
                    return Err(Error::PartialFailure {
                        completed_points: aggregator.points_emitted(),
                        first_error: Box::new(first),
                    });
                }
                first_decode_error.get_or_insert(err);
                // Fresh codec state for the next chunk; the parser emits
                // codec-safe boundaries so decoding can resume there.
                decoder.reset();
            }
            Err(err) => return Err(err),
        }

        drop(reservation);

        if watchdog.under_pressure() && chunk_size > sizing.min {
            chunk_size = (chunk_size / 2).max(sizing.min);
            reader.set_chunk_size(chunk_size);
            debug!(chunk_size, "memory pressure; shrinking subsequent chunks");
        }

        // `stream_done` covers formats whose audio region ends before the
        // file does (MP4 trailing boxes, trailing tags).
        if is_last || stream_done {
            break;
        }
    }

    check_stop(cancel, deadline)?;

    for pcm in decoder.flush()? {
        aggregator.push(&pcm)?;
    }

    let summary = aggregator.finalize()?;
    info!(
        points = summary.resolution(),
        duration_ms = summary.duration().as_millis() as u64,
        "waveform job finished"
    );
    Ok(summary)
}

/// Run one job inline on the calling thread, without a pool.
///
/// This is the simplest way to get a summary and the primary testing
/// surface. The job's own cancel handle and memory budget are honored; with
/// no budget the watchdog admits everything.
pub fn summarize(job: &JobDescriptor) -> Result<AudioSummary> {
    let cancel = job.cancel.clone().unwrap_or_default();
    let watchdog = MemoryWatchdog::new(job.memory_budget.unwrap_or(usize::MAX));
    run_job(job, &cancel, &watchdog, |_| {})
}

/// `summarize` with defaults: RMS amplitudes at the given resolution.
pub fn summarize_file(path: impl Into<std::path::PathBuf>, resolution: usize) -> Result<AudioSummary> {
    summarize(&JobDescriptor::new(path, resolution))
}

fn check_stop(cancel: &CancelHandle, deadline: Option<Instant>) -> Result<()> {
    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            cancel.cancel_with(CancelReason::Deadline);
        }
    }
    if cancel.is_cancelled() {
        return Err(cancel.as_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Algorithm, Normalization};
    use std::io::Write;
    use std::time::Duration;

    /// 16-bit mono PCM WAV with the given samples.
    fn wav_bytes(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    fn write_wav(sample_rate: u32, samples: &[i16]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::with_suffix(".wav").expect("temp file");
        file.write_all(&wav_bytes(sample_rate, samples))
            .expect("write fixture");
        file
    }

    #[test]
    fn silent_wav_yields_zero_summary() -> Result<()> {
        let file = write_wav(44_100, &vec![0i16; 44_100]);
        let summary = summarize_file(file.path(), 10)?;

        assert_eq!(summary.resolution(), 10);
        assert!(summary.amplitudes().iter().all(|&a| a == 0.0));
        assert_eq!(summary.sample_rate(), 44_100);
        assert_eq!(summary.channel_count(), 1);
        assert_eq!(summary.duration(), Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn chunk_size_does_not_change_the_summary() -> Result<()> {
        // Large enough that the small hint needs several chunks (the WAV
        // minimum chunk is 64 KiB).
        let samples: Vec<i16> = (0..200_000).map(|i| ((i * 37) % 20_000) as i16).collect();
        let file = write_wav(16_000, &samples);

        let mut small = JobDescriptor::new(file.path(), 50);
        small.chunk_size_hint = Some(MIN_CHUNK_SIZE);
        let mut large = JobDescriptor::new(file.path(), 50);
        large.chunk_size_hint = Some(1 << 20);

        let a = summarize(&small)?;
        let b = summarize(&large)?;

        assert_eq!(a.resolution(), 50);
        assert_eq!(b.resolution(), 50);
        for (x, y) in a.amplitudes().iter().zip(b.amplitudes()) {
            assert!((x - y).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn full_scale_square_wave_peaks_near_unity() -> Result<()> {
        let samples: Vec<i16> = (0..8000)
            .map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN })
            .collect();
        let file = write_wav(8000, &samples);

        let mut job = JobDescriptor::new(file.path(), 20);
        job.algorithm = Algorithm::Peak;
        job.normalization = Normalization::Peak;
        let summary = summarize(&job)?;

        assert!(summary.normalized());
        assert!(summary.amplitudes().iter().all(|&a| a >= 0.95));
        Ok(())
    }

    #[test]
    fn missing_file_fails_before_any_decode() {
        let err = summarize_file("/no/such/audio.flac", 10).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn garbage_file_is_unsupported() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&[0x42u8; 4096]).expect("write fixture");
        let err = summarize_file(file.path(), 10).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn pre_cancelled_job_resolves_cancelled() {
        let file = write_wav(8000, &vec![0i16; 8000]);
        let cancel = CancelHandle::new();
        cancel.cancel();

        let mut job = JobDescriptor::new(file.path(), 10);
        job.cancel = Some(cancel);
        let err = summarize(&job).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn zero_deadline_resolves_deadline() {
        let file = write_wav(8000, &vec![0i16; 8000]);
        let mut job = JobDescriptor::new(file.path(), 10);
        job.deadline = Some(Duration::ZERO);
        let err = summarize(&job).unwrap_err();
        assert!(matches!(err, Error::Deadline));
    }

    #[test]
    fn zero_resolution_is_rejected() {
        let file = write_wav(8000, &[0i16; 8]);
        let err = summarize_file(file.path(), 0).unwrap_err();
        assert!(err.to_string().contains("resolution"));
    }

    #[test]
    fn impossible_memory_budget_aborts_with_memory_error() {
        let file = write_wav(8000, &vec![0i16; 64_000]);
        let mut job = JobDescriptor::new(file.path(), 10);
        // A watchdog that cannot even hold one minimum-size chunk.
        job.memory_budget = Some(1024);
        let err = summarize(&job).unwrap_err();
        assert!(matches!(err, Error::MemoryExceeded { .. }));
    }

    #[test]
    fn progress_fractions_are_monotone_and_reach_one() -> Result<()> {
        let samples: Vec<i16> = (0..48_000).map(|i| (i % 1000) as i16).collect();
        let file = write_wav(16_000, &samples);

        let mut job = JobDescriptor::new(file.path(), 25);
        job.chunk_size_hint = Some(MIN_CHUNK_SIZE);
        job.report_partial = true;

        let cancel = CancelHandle::new();
        let watchdog = MemoryWatchdog::new(usize::MAX);
        let mut fractions = Vec::new();
        let mut partial_lens = Vec::new();
        run_job(&job, &cancel, &watchdog, |record| {
            fractions.push(record.fraction);
            if let Some(partial) = record.partial {
                partial_lens.push(partial.len());
            }
        })?;

        assert!(fractions.len() > 1, "expected several progress records");
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert!((fractions.last().copied().unwrap() - 1.0).abs() < 1e-3);
        assert!(partial_lens.windows(2).all(|w| w[0] <= w[1]));
        Ok(())
    }
}
