//! WAV (RIFF) parsing and alignment.
//!
//! Walks the RIFF chunk list once to find `fmt ` and `data`, then aligns
//! byte chunks to whole frames (`block_align` multiples). WAV is the one
//! format where every frame boundary is a perfect seek point, so
//! `time_to_byte` is exact.

use std::time::Duration;

use crate::chunk::{AlignedChunk, ByteChunk, ChunkSizing, SeekPoint, SeekResult};
use crate::error::{Error, Result};
use crate::format::{AudioFormat, DecoderSpec, StreamInfo, default_chunk_sizing};
use crate::reader::ChunkReader;

/// WAVE format tags we decode.
const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// How raw WAV sample bytes map to f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavSampleFormat {
    /// Unsigned 8-bit PCM (offset binary).
    U8,
    /// Signed little-endian PCM of 16, 24, or 32 bits.
    SignedPcm { bits: u16 },
    /// IEEE float of 32 or 64 bits.
    Float { bits: u16 },
}

#[derive(Debug)]
pub struct WavParser {
    info: StreamInfo,
    sample_format: WavSampleFormat,
    block_align: u16,
    /// Withheld partial-frame bytes; always shorter than one frame.
    carry: Vec<u8>,
    carry_start: u64,
}

impl WavParser {
    /// Walk the RIFF chunk list and locate `fmt ` and `data`.
    pub fn from_reader(reader: &mut ChunkReader) -> Result<Self> {
        let file_size = reader.size_bytes();
        let header = reader.read_exact_at(0, 12)?;
        if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
            return Err(Error::CorruptedHeader("RIFF/WAVE signature mismatch".into()));
        }

        let mut fmt: Option<FmtChunk> = None;
        let mut data: Option<(u64, u64)> = None;

        // Chunks are (fourcc, u32le size, payload, pad-to-even).
        let mut offset = 12u64;
        while offset + 8 <= file_size {
            let chunk_header = reader.read_exact_at(offset, 8)?;
            let id: [u8; 4] = chunk_header[0..4].try_into().expect("fourcc");
            let len = u32::from_le_bytes(chunk_header[4..8].try_into().expect("size")) as u64;
            let payload = offset + 8;

            match &id {
                b"fmt " => {
                    if len < 16 {
                        return Err(Error::CorruptedHeader(format!(
                            "fmt chunk is {len} bytes, need at least 16"
                        )));
                    }
                    let read_len = len.min(40) as usize;
                    let bytes = reader.read_exact_at(payload, read_len)?;
                    fmt = Some(parse_fmt(&bytes)?);
                }
                b"data" => {
                    let end = (payload + len).min(file_size);
                    data = Some((payload, end));
                    // A streamed/growing WAV may declare a zero or oversized
                    // data length; trust the file size instead.
                    if payload + len > file_size {
                        tracing::warn!(
                            declared = len,
                            available = file_size - payload,
                            "wav data chunk exceeds file; clipping"
                        );
                    }
                }
                _ => {}
            }

            if fmt.is_some() && data.is_some() {
                break;
            }
            offset = payload + len + (len & 1);
        }

        let fmt = fmt.ok_or_else(|| Error::CorruptedHeader("missing fmt chunk".into()))?;
        let (audio_start, audio_end) =
            data.ok_or_else(|| Error::CorruptedHeader("missing data chunk".into()))?;

        let block_align = fmt.block_align;
        if block_align == 0 {
            return Err(Error::CorruptedHeader("fmt declares zero block align".into()));
        }

        let total_frames = (audio_end - audio_start) / block_align as u64;

        let info = StreamInfo {
            format: AudioFormat::Wav,
            sample_rate: fmt.sample_rate,
            channel_count: fmt.channels,
            bits_per_sample: Some(fmt.bits as u32),
            total_frames: Some(total_frames),
            encoder_delay_frames: 0,
            audio_start,
            audio_end,
        };

        Ok(Self {
            info,
            sample_format: fmt.sample_format,
            block_align,
            carry: Vec::new(),
            carry_start: audio_start,
        })
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn decoder_spec(&self) -> DecoderSpec {
        DecoderSpec::Wav {
            sample_format: self.sample_format,
            block_align: self.block_align,
        }
    }

    pub fn align(&mut self, chunk: ByteChunk) -> Result<AlignedChunk> {
        let start_offset = if self.carry.is_empty() {
            chunk.start_offset
        } else {
            self.carry_start
        };

        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(&chunk.data);

        // Clip anything past the data chunk (trailing LIST/id3 chunks).
        let stream_end_in_buf =
            (self.info.audio_end.saturating_sub(start_offset) as usize).min(data.len());
        data.truncate(stream_end_in_buf);

        let is_last = chunk.is_last || start_offset + data.len() as u64 >= self.info.audio_end;
        if is_last {
            // Drop a trailing partial frame; it cannot be decoded.
            let whole = data.len() - data.len() % self.block_align as usize;
            data.truncate(whole);
            return Ok(AlignedChunk {
                seek_points: self.frame_seek_point(start_offset).into_iter().collect(),
                data,
                start_offset,
                is_last: true,
                first_packet: None,
            });
        }

        let whole = data.len() - data.len() % self.block_align as usize;
        let rest = data.split_off(whole);
        self.carry = rest;
        self.carry_start = start_offset + whole as u64;

        Ok(AlignedChunk {
            seek_points: self.frame_seek_point(start_offset).into_iter().collect(),
            data,
            start_offset,
            is_last: false,
            first_packet: None,
        })
    }

    /// Every aligned chunk begins on a frame boundary, which for PCM is an
    /// exact seek point.
    fn frame_seek_point(&self, offset: u64) -> Option<SeekPoint> {
        if offset < self.info.audio_start || self.info.sample_rate == 0 {
            return None;
        }
        let frame = (offset - self.info.audio_start) / self.block_align as u64;
        Some(SeekPoint {
            time: Duration::from_secs_f64(frame as f64 / self.info.sample_rate as f64),
            byte_offset: offset,
            is_exact: true,
        })
    }

    pub fn time_to_byte(&self, time: Duration) -> Result<SeekResult> {
        let frame = (time.as_secs_f64() * self.info.sample_rate as f64).floor() as u64;
        let frame = frame.min(self.info.total_frames.unwrap_or(0));
        let byte_offset = self.info.audio_start + frame * self.block_align as u64;

        Ok(SeekResult {
            actual_time: Duration::from_secs_f64(frame as f64 / self.info.sample_rate as f64),
            byte_offset,
            is_exact: true,
            warning: None,
        })
    }

    pub fn optimal_chunk_size(&self, file_size: u64) -> ChunkSizing {
        let mut sizing = default_chunk_sizing(file_size, 64 * 1024);
        // Keep reads frame-aligned so carry-over stays under one frame.
        let align = self.block_align as usize;
        sizing.recommended -= sizing.recommended % align;
        sizing
    }

    pub fn carry_over_len(&self) -> usize {
        self.carry.len()
    }

    pub fn reset_alignment(&mut self) {
        self.carry.clear();
    }
}

struct FmtChunk {
    sample_format: WavSampleFormat,
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits: u16,
}

fn parse_fmt(bytes: &[u8]) -> Result<FmtChunk> {
    let u16_at = |at: usize| -> u16 { u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap()) };
    let u32_at = |at: usize| -> u32 { u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) };

    let mut format_tag = u16_at(0);
    let channels = u16_at(2);
    let sample_rate = u32_at(4);
    let block_align = u16_at(12);
    let bits = u16_at(14);

    if format_tag == WAVE_FORMAT_EXTENSIBLE {
        // The real format lives in the first two bytes of the SubFormat GUID.
        if bytes.len() < 26 {
            return Err(Error::CorruptedHeader(
                "extensible fmt chunk too short for SubFormat".into(),
            ));
        }
        format_tag = u16_at(24);
    }

    let sample_format = match (format_tag, bits) {
        (WAVE_FORMAT_PCM, 8) => WavSampleFormat::U8,
        (WAVE_FORMAT_PCM, 16 | 24 | 32) => WavSampleFormat::SignedPcm { bits },
        (WAVE_FORMAT_IEEE_FLOAT, 32 | 64) => WavSampleFormat::Float { bits },
        (tag, bits) => {
            return Err(Error::UnsupportedCodec(format!(
                "wave format tag {tag:#06x} with {bits} bits"
            )));
        }
    };

    Ok(FmtChunk {
        sample_format,
        channels,
        sample_rate,
        block_align,
        bits,
    })
}
