//! FLAC parsing and alignment.
//!
//! Walks the metadata blocks once (`STREAMINFO` is mandatory and gives the
//! exact stream parameters; `SEEKTABLE` gives exact seek points when the
//! encoder wrote one), then aligns byte chunks to frame starts. FLAC frame
//! headers carry a CRC-8, so boundary detection validates candidates instead
//! of trusting the 14-bit sync code alone.

use std::time::Duration;

use tracing::debug;

use crate::chunk::{AlignedChunk, ByteChunk, ChunkSizing, SeekPoint, SeekResult};
use crate::error::{Error, Result};
use crate::format::{AudioFormat, DecoderSpec, StreamInfo, default_chunk_sizing};
use crate::reader::ChunkReader;

/// Fallback carry bound when STREAMINFO does not declare a max frame size.
const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

const BLOCK_STREAMINFO: u8 = 0;
const BLOCK_SEEKTABLE: u8 = 3;

const SEEKPOINT_PLACEHOLDER: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
struct SeekTableEntry {
    sample: u64,
    /// Byte offset relative to the first frame.
    offset: u64,
}

pub struct FlacParser {
    info: StreamInfo,
    max_block_size: u16,
    min_block_size: u16,
    max_frame_size: usize,
    seek_table: Vec<SeekTableEntry>,
    carry: Vec<u8>,
    carry_start: u64,
}

impl FlacParser {
    pub fn from_reader(reader: &mut ChunkReader) -> Result<Self> {
        let file_size = reader.size_bytes();
        let magic = reader.read_exact_at(0, 4)?;
        if &magic[..] != b"fLaC" {
            return Err(Error::CorruptedHeader("fLaC signature mismatch".into()));
        }

        let mut offset = 4u64;
        let mut streaminfo: Option<Vec<u8>> = None;
        let mut seek_table = Vec::new();

        loop {
            let header = reader.read_exact_at(offset, 4)?;
            let is_last = header[0] & 0x80 != 0;
            let block_type = header[0] & 0x7F;
            let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as u64;
            let payload = offset + 4;

            match block_type {
                BLOCK_STREAMINFO => {
                    if len < 34 {
                        return Err(Error::CorruptedHeader(format!(
                            "STREAMINFO is {len} bytes, expected 34"
                        )));
                    }
                    streaminfo = Some(reader.read_exact_at(payload, 34)?);
                }
                BLOCK_SEEKTABLE => {
                    let bytes = reader.read_exact_at(payload, len as usize)?;
                    for entry in bytes.chunks_exact(18) {
                        let sample = u64::from_be_bytes(entry[0..8].try_into().expect("u64"));
                        if sample == SEEKPOINT_PLACEHOLDER {
                            continue;
                        }
                        let byte = u64::from_be_bytes(entry[8..16].try_into().expect("u64"));
                        seek_table.push(SeekTableEntry {
                            sample,
                            offset: byte,
                        });
                    }
                    debug!(entries = seek_table.len(), "parsed flac seek table");
                }
                _ => {}
            }

            offset = payload + len;
            if is_last {
                break;
            }
            if offset >= file_size {
                return Err(Error::Truncated {
                    offset: file_size,
                    detail: "metadata blocks run past end of file".into(),
                });
            }
        }

        let streaminfo =
            streaminfo.ok_or_else(|| Error::CorruptedHeader("missing STREAMINFO".into()))?;

        let min_block_size = u16::from_be_bytes(streaminfo[0..2].try_into().expect("u16"));
        let max_block_size = u16::from_be_bytes(streaminfo[2..4].try_into().expect("u16"));
        let max_frame_size =
            u32::from_be_bytes([0, streaminfo[7], streaminfo[8], streaminfo[9]]) as usize;

        let sample_rate = ((streaminfo[10] as u32) << 12)
            | ((streaminfo[11] as u32) << 4)
            | ((streaminfo[12] as u32) >> 4);
        let channel_count = (((streaminfo[12] >> 1) & 0x7) + 1) as u16;
        let bits_per_sample =
            ((((streaminfo[12] & 0x1) << 4) | (streaminfo[13] >> 4)) + 1) as u32;
        let total_samples = (((streaminfo[13] as u64) & 0xF) << 32)
            | u32::from_be_bytes(streaminfo[14..18].try_into().expect("u32")) as u64;

        if sample_rate == 0 {
            return Err(Error::CorruptedHeader("STREAMINFO declares zero sample rate".into()));
        }

        let info = StreamInfo {
            format: AudioFormat::Flac,
            sample_rate,
            channel_count,
            bits_per_sample: Some(bits_per_sample),
            total_frames: (total_samples > 0).then_some(total_samples),
            encoder_delay_frames: 0,
            audio_start: offset,
            audio_end: file_size,
        };

        Ok(Self {
            info,
            max_block_size,
            min_block_size,
            max_frame_size: if max_frame_size == 0 {
                DEFAULT_MAX_FRAME
            } else {
                max_frame_size
            },
            seek_table,
            carry: Vec::new(),
            carry_start: offset,
        })
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn decoder_spec(&self) -> DecoderSpec {
        DecoderSpec::Flac {
            max_block_size: self.max_block_size,
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

        let mut seek_points = Vec::new();
        if chunk.is_last {
            if let Some((rel, header)) = first_frame_start(&data, 0) {
                seek_points.extend(self.seek_point_for(start_offset + rel as u64, &header));
            }
            return Ok(AlignedChunk {
                data,
                start_offset,
                is_last: true,
                seek_points,
                first_packet: None,
            });
        }

        // Frame lengths are unknown until the next sync, so the boundary we
        // can safely emit through is the *last validated frame start*.
        let mut last_start = 0usize;
        let mut search = 0usize;
        let mut first = true;
        while let Some((pos, header)) = first_frame_start(&data, search) {
            if first {
                seek_points.extend(self.seek_point_for(start_offset + pos as u64, &header));
                first = false;
            }
            last_start = pos;
            search = pos + 1;
        }

        let rest = data.split_off(last_start);
        self.carry = rest;
        self.carry_start = start_offset + last_start as u64;

        if self.carry.len() > self.max_frame_size.saturating_mul(2) {
            // No sync in far too long; keep a tail and let the decoder's
            // resync handle the rest.
            let drop = self.carry.len() - self.max_frame_size;
            self.carry.drain(..drop);
            self.carry_start += drop as u64;
        }

        Ok(AlignedChunk {
            data,
            start_offset,
            is_last: false,
            seek_points,
            first_packet: None,
        })
    }

    fn seek_point_for(&self, byte_offset: u64, header: &FrameHeaderInfo) -> Option<SeekPoint> {
        let sample = if header.variable_blocking {
            header.coded_number
        } else {
            header.coded_number * self.min_block_size.max(1) as u64
        };
        Some(SeekPoint {
            time: Duration::from_secs_f64(sample as f64 / self.info.sample_rate as f64),
            byte_offset,
            is_exact: true,
        })
    }

    pub fn time_to_byte(&self, time: Duration) -> Result<SeekResult> {
        let target_sample = (time.as_secs_f64() * self.info.sample_rate as f64) as u64;

        if !self.seek_table.is_empty() {
            // Last entry at or before the target sample.
            let entry = self
                .seek_table
                .iter()
                .take_while(|e| e.sample <= target_sample)
                .last()
                .copied()
                .unwrap_or(SeekTableEntry {
                    sample: 0,
                    offset: 0,
                });

            let actual_time =
                Duration::from_secs_f64(entry.sample as f64 / self.info.sample_rate as f64);
            let is_exact = entry.sample == target_sample;
            return Ok(SeekResult {
                actual_time,
                byte_offset: self.info.audio_start + entry.offset,
                is_exact,
                warning: (!is_exact)
                    .then(|| "seek table resolves to an earlier frame boundary".into()),
            });
        }

        // No seek table: interpolate linearly over the frame span.
        let total = self.info.total_frames.ok_or(Error::SeekUnsupported)?;
        if total == 0 {
            return Err(Error::SeekUnsupported);
        }
        let fraction = (target_sample as f64 / total as f64).clamp(0.0, 1.0);
        let span = self.info.audio_end - self.info.audio_start;
        Ok(SeekResult {
            actual_time: Duration::from_secs_f64(
                fraction * total as f64 / self.info.sample_rate as f64,
            ),
            byte_offset: self.info.audio_start + (fraction * span as f64) as u64,
            is_exact: false,
            warning: Some("no seek table; byte offset interpolated from duration".into()),
        })
    }

    pub fn optimal_chunk_size(&self, file_size: u64) -> ChunkSizing {
        default_chunk_sizing(file_size, self.max_frame_size.max(64 * 1024))
    }

    pub fn carry_over_len(&self) -> usize {
        self.carry.len()
    }

    pub fn reset_alignment(&mut self) {
        self.carry.clear();
    }
}

/// Fields decoded from a validated frame header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeaderInfo {
    /// Frame number (fixed blocking) or first sample number (variable).
    pub coded_number: u64,
    pub variable_blocking: bool,
}

/// Find the first validated frame start at or after `from`.
pub(crate) fn first_frame_start(buf: &[u8], from: usize) -> Option<(usize, FrameHeaderInfo)> {
    let mut pos = from;
    while pos + 16 <= buf.len() {
        if buf[pos] == 0xFF && buf[pos + 1] & 0xFE == 0xF8 {
            if let Some(info) = validate_frame_header(&buf[pos..]) {
                return Some((pos, info));
            }
        }
        pos += 1;
    }
    None
}

/// Validate a candidate frame header, including its CRC-8.
fn validate_frame_header(buf: &[u8]) -> Option<FrameHeaderInfo> {
    let variable_blocking = buf[1] & 0x1 != 0;

    let bs_bits = buf[2] >> 4;
    let sr_bits = buf[2] & 0xF;
    if bs_bits == 0 || sr_bits == 0xF {
        return None;
    }

    let chan_bits = buf[3] >> 4;
    let ss_bits = (buf[3] >> 1) & 0x7;
    if chan_bits > 10 || ss_bits == 0b011 || ss_bits == 0b111 || buf[3] & 0x1 != 0 {
        return None;
    }

    // Coded frame/sample number, UTF-8-like, up to 7 bytes.
    let mut pos = 4;
    let first = buf[pos];
    let extra = match first {
        0x00..=0x7F => 0,
        0xC0..=0xDF => 1,
        0xE0..=0xEF => 2,
        0xF0..=0xF7 => 3,
        0xF8..=0xFB => 4,
        0xFC..=0xFD => 5,
        0xFE => 6,
        _ => return None,
    };
    let mut coded_number = match extra {
        0 => first as u64,
        n => (first as u64) & (0x7F >> (n + 1)),
    };
    pos += 1;
    for _ in 0..extra {
        if pos >= buf.len() {
            return None;
        }
        let b = buf[pos];
        if b & 0xC0 != 0x80 {
            return None;
        }
        coded_number = (coded_number << 6) | (b & 0x3F) as u64;
        pos += 1;
    }

    // Inline block size / sample rate fields, when the 4-bit codes say so.
    pos += match bs_bits {
        6 => 1,
        7 => 2,
        _ => 0,
    };
    pos += match sr_bits {
        12 => 1,
        13 | 14 => 2,
        _ => 0,
    };

    if pos >= buf.len() {
        return None;
    }
    if crc8(&buf[..pos]) != buf[pos] {
        return None;
    }

    Some(FrameHeaderInfo {
        coded_number,
        variable_blocking,
    })
}

/// CRC-8 with polynomial 0x07, as used by FLAC frame headers.
fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal frame header for fixed blocking, frame number `n`
    /// (single byte coded), 4096-sample blocks, 44.1 kHz stereo 16-bit.
    pub(crate) fn frame_header(n: u8) -> Vec<u8> {
        assert!(n < 0x80);
        // bs=12 (4096), sr=9 (44.1k), chan=1 (stereo), ss=4 (16-bit).
        let mut header = vec![0xFF, 0xF8, 0xC9, 0x18, n];
        header.push(crc8(&header));
        header
    }

    /// A fLaC file skeleton: STREAMINFO only, then `frames` fake frames of
    /// `frame_len` bytes each.
    pub(crate) fn flac_fixture(total_samples: u64, frames: usize, frame_len: usize) -> Vec<u8> {
        let mut out = b"fLaC".to_vec();
        out.push(0x80); // last block, STREAMINFO
        out.extend_from_slice(&[0x00, 0x00, 34]);

        let mut si = Vec::new();
        si.extend_from_slice(&4096u16.to_be_bytes()); // min block
        si.extend_from_slice(&4096u16.to_be_bytes()); // max block
        si.extend_from_slice(&[0, 0, 0]); // min frame size unknown
        si.extend_from_slice(&[0, 0x40, 0]); // max frame size 16384
        // rate 44100 (20 bits), channels-1 = 1 (3 bits), bps-1 = 15 (5 bits),
        // total samples (36 bits).
        let packed: u64 = (44_100u64 << 44) | (1u64 << 41) | (15u64 << 36) | total_samples;
        si.extend_from_slice(&packed.to_be_bytes());
        si.extend_from_slice(&[0u8; 16]); // md5
        assert_eq!(si.len(), 34);
        out.extend_from_slice(&si);

        for i in 0..frames {
            let header = frame_header(i as u8);
            out.extend_from_slice(&header);
            out.resize(out.len() + frame_len - header.len(), 0xAA);
        }
        out
    }

    fn parser_for(bytes: &[u8]) -> (FlacParser, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(bytes).expect("write fixture");
        let mut reader =
            ChunkReader::open(file.path(), crate::reader::MIN_CHUNK_SIZE).expect("open");
        let parser = FlacParser::from_reader(&mut reader).expect("parse");
        (parser, file)
    }

    #[test]
    fn streaminfo_fields_decode() {
        let (parser, _file) = parser_for(&flac_fixture(88_200, 4, 64));
        let info = parser.stream_info();
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channel_count, 2);
        assert_eq!(info.bits_per_sample, Some(16));
        assert_eq!(info.total_frames, Some(88_200));
        assert_eq!(info.audio_start, 4 + 4 + 34);
        assert_eq!(info.duration(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn frame_header_crc_gates_validation() {
        let good = frame_header(3);
        assert!(validate_frame_header(&good).is_some());

        let mut bad = good.clone();
        *bad.last_mut().expect("crc byte") ^= 0xFF;
        assert!(validate_frame_header(&bad).is_none());
    }

    #[test]
    fn align_emits_through_last_validated_start() {
        let frame_len = 64;
        let bytes = flac_fixture(4096 * 3, 3, frame_len);
        let (mut parser, _file) = parser_for(&bytes);
        let start = parser.stream_info().audio_start;

        let aligned = parser
            .align(ByteChunk {
                data: bytes[start as usize..].to_vec(),
                start_offset: start,
                is_last: false,
                is_seek_point: true,
            })
            .expect("align");

        // Everything through the start of frame 2 is emitted; the final
        // frame is withheld because its end is unknown.
        assert_eq!(aligned.data.len(), 2 * frame_len);
        assert_eq!(parser.carry_over_len(), frame_len);

        // The first seek point is exact and derived from the frame number.
        let point = aligned.seek_points.first().expect("seek point");
        assert!(point.is_exact);
        assert_eq!(point.time, Duration::ZERO);

        let tail = parser
            .align(ByteChunk {
                data: Vec::new(),
                start_offset: bytes.len() as u64,
                is_last: true,
                is_seek_point: false,
            })
            .expect("align last");
        assert!(tail.is_last);
        assert_eq!(tail.data.len(), frame_len);
    }

    #[test]
    fn seek_without_table_interpolates() {
        let (parser, _file) = parser_for(&flac_fixture(88_200, 4, 64));
        let seek = parser.time_to_byte(Duration::from_secs(1)).expect("seek");
        assert!(!seek.is_exact);
        assert!(seek.warning.is_some());
        assert!(seek.byte_offset >= parser.stream_info().audio_start);
    }
}
