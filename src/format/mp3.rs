//! MP3 (MPEG audio layer III) parsing and alignment.
//!
//! MP3 files have no container: the stream is a run of self-describing
//! frames, optionally wrapped in ID3 tags. Alignment walks frame headers
//! (11-bit sync word plus sanity checks on the header fields) and emits only
//! whole frames; a junk run between frames is skipped by resynchronization.
//!
//! The first frame often carries a Xing/Info tag with the frame count and a
//! LAME extension declaring the encoder delay and trailing padding. Both are
//! consumed here: the delay feeds the decoder's priming skip, the counts feed
//! duration and the aggregator's sizing hint.

use std::time::Duration;

use tracing::debug;

use crate::chunk::{AlignedChunk, ByteChunk, ChunkSizing, SeekPoint, SeekResult};
use crate::error::{Error, Result};
use crate::format::{AudioFormat, StreamInfo, default_chunk_sizing};
use crate::reader::ChunkReader;

/// Largest possible layer III frame (320 kbps at 8 kHz, padded) with margin.
pub(crate) const MAX_FRAME_LEN: usize = 4096;

/// Alignment carry is bounded by a few frames; beyond that we are lost in
/// junk and drop the oldest bytes while searching for sync.
const MAX_CARRY: usize = 4 * MAX_FRAME_LEN;

const BITRATES_V1_L3: [u32; 15] =
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L3: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MpegVersion {
    V1,
    V2,
    V2_5,
}

/// A validated layer III frame header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub version: MpegVersion,
    pub bitrate_bps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_len: usize,
    pub samples_per_frame: u32,
    /// Whether a CRC-16 follows the header.
    pub has_crc: bool,
}

/// Parse and sanity-check a layer III header at the start of `buf`.
pub(crate) fn parse_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < 4 || buf[0] != 0xFF || buf[1] & 0xE0 != 0xE0 {
        return None;
    }

    let version = match (buf[1] >> 3) & 0x3 {
        0b00 => MpegVersion::V2_5,
        0b10 => MpegVersion::V2,
        0b11 => MpegVersion::V1,
        _ => return None,
    };
    // Layer III only; the sibling layers never appear in .mp3 files we care
    // to summarize and rejecting them hardens resync.
    if (buf[1] >> 1) & 0x3 != 0b01 {
        return None;
    }
    let has_crc = buf[1] & 0x1 == 0;

    let bitrate_index = (buf[2] >> 4) as usize;
    if bitrate_index == 0 || bitrate_index >= 15 {
        // Free-format streams are not supported.
        return None;
    }
    let sample_rate_index = ((buf[2] >> 2) & 0x3) as usize;
    if sample_rate_index == 3 {
        return None;
    }
    let padding = ((buf[2] >> 1) & 0x1) as usize;

    let (bitrate_kbps, sample_rate, samples_per_frame) = match version {
        MpegVersion::V1 => (
            BITRATES_V1_L3[bitrate_index],
            [44_100, 48_000, 32_000][sample_rate_index],
            1152,
        ),
        MpegVersion::V2 => (
            BITRATES_V2_L3[bitrate_index],
            [22_050, 24_000, 16_000][sample_rate_index],
            576,
        ),
        MpegVersion::V2_5 => (
            BITRATES_V2_L3[bitrate_index],
            [11_025, 12_000, 8_000][sample_rate_index],
            576,
        ),
    };

    let bitrate_bps = bitrate_kbps * 1000;
    let frame_len =
        (samples_per_frame as usize / 8) * bitrate_bps as usize / sample_rate as usize + padding;
    if frame_len < 24 || frame_len > MAX_FRAME_LEN {
        return None;
    }

    let channels = if (buf[3] >> 6) == 0b11 { 1 } else { 2 };

    Some(FrameHeader {
        version,
        bitrate_bps,
        sample_rate,
        channels,
        frame_len,
        samples_per_frame,
        has_crc,
    })
}

/// Walk whole frames from the start of `buf`.
///
/// Returns the end of the last complete frame. Junk runs are skipped by
/// scanning forward for the next verifiable sync.
pub(crate) fn walk_frames(buf: &[u8]) -> FrameWalk {
    let mut pos = 0;
    let mut last_end = 0;
    let mut frames = 0u64;
    let mut synced = false;

    while pos + 4 <= buf.len() {
        match parse_frame_header(&buf[pos..]) {
            Some(header) if pos + header.frame_len <= buf.len() => {
                // While resyncing, demand a plausible successor; a lone sync
                // pattern inside junk rarely survives this check.
                let next = pos + header.frame_len;
                if !synced && next + 4 <= buf.len() && parse_frame_header(&buf[next..]).is_none() {
                    pos += 1;
                    continue;
                }
                synced = true;
                frames += 1;
                pos = next;
                last_end = next;
            }
            Some(_) => break, // partial frame; wait for more bytes
            None => {
                synced = false;
                pos += 1;
            }
        }
    }

    FrameWalk {
        consumed: last_end,
        frames,
    }
}

pub(crate) struct FrameWalk {
    /// Bytes from the buffer start through the last complete frame.
    pub consumed: usize,
    pub frames: u64,
}

pub struct Mp3Parser {
    info: StreamInfo,
    /// Xing TOC (100 bytes of 1/256 file-fraction offsets), when present.
    toc: Option<[u8; 100]>,
    carry: Vec<u8>,
    carry_start: u64,
    frames_emitted: u64,
    samples_per_frame: u32,
}

impl Mp3Parser {
    pub fn from_reader(reader: &mut ChunkReader) -> Result<Self> {
        let file_size = reader.size_bytes();

        // Skip a leading ID3v2 tag.
        let mut audio_start = 0u64;
        let head = reader.read_exact_at(0, 10.min(file_size as usize))?;
        if head.len() == 10 && &head[0..3] == b"ID3" {
            let size = syncsafe_u32(&head[6..10]) as u64;
            let footer = if head[5] & 0x10 != 0 { 10 } else { 0 };
            audio_start = 10 + size + footer;
        }

        // An ID3v1 tag occupies the final 128 bytes.
        let mut audio_end = file_size;
        if file_size >= audio_start + 128 {
            let tail = reader.read_exact_at(file_size - 128, 3)?;
            if &tail[..] == b"TAG" {
                audio_end = file_size - 128;
            }
        }

        if audio_start >= audio_end {
            return Err(Error::CorruptedHeader("no audio bytes between tags".into()));
        }

        // Find the first real frame; tolerate a little junk after the tag.
        let probe_len = (audio_end - audio_start).min(64 * 1024) as usize;
        let probe = reader.read_exact_at(audio_start, probe_len)?;
        let (first_frame_rel, header) = find_first_frame(&probe)
            .ok_or_else(|| Error::CorruptedHeader("no MPEG frame sync found".into()))?;
        audio_start += first_frame_rel as u64;

        let mut encoder_delay = 0u32;
        let mut total_frames: Option<u64> = None;
        let mut toc = None;

        if let Some(xing) = parse_xing(&probe[first_frame_rel..], &header) {
            toc = xing.toc;
            encoder_delay = xing.delay;
            if let Some(frame_count) = xing.frames {
                let gross = frame_count as u64 * header.samples_per_frame as u64;
                let trimmed = gross.saturating_sub((xing.delay + xing.padding) as u64);
                total_frames = Some(trimmed);
            }
            debug!(
                delay = xing.delay,
                padding = xing.padding,
                frames = ?xing.frames,
                "parsed xing/lame tag"
            );
            // The tag lives in an otherwise-silent frame; the decoder must
            // never see it.
            audio_start += header.frame_len as u64;
        }

        let audio_bytes = audio_end - audio_start;

        if total_frames.is_none() {
            // CBR estimate from the first frame's bitrate. Good enough for
            // the aggregator hint; VBR streams without a Xing tag are rare.
            let seconds = audio_bytes as f64 * 8.0 / header.bitrate_bps as f64;
            total_frames = Some((seconds * header.sample_rate as f64) as u64);
        }

        let info = StreamInfo {
            format: AudioFormat::Mp3,
            sample_rate: header.sample_rate,
            channel_count: header.channels,
            bits_per_sample: None,
            total_frames,
            encoder_delay_frames: encoder_delay,
            audio_start,
            audio_end,
        };

        Ok(Self {
            info,
            toc,
            carry: Vec::new(),
            carry_start: audio_start,
            frames_emitted: 0,
            samples_per_frame: header.samples_per_frame,
        })
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn align(&mut self, chunk: ByteChunk) -> Result<AlignedChunk> {
        let start_offset = if self.carry.is_empty() {
            chunk.start_offset
        } else {
            self.carry_start
        };

        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(&chunk.data);

        // Clip a trailing ID3v1 region.
        let end_in_buf = (self.info.audio_end.saturating_sub(start_offset) as usize).min(data.len());
        data.truncate(end_in_buf);

        let is_last = chunk.is_last || start_offset + data.len() as u64 >= self.info.audio_end;

        let seek_point = self.chunk_seek_point(start_offset);
        let walk = walk_frames(&data);

        if is_last {
            // Emit everything; the decoder resyncs over any trailing junk.
            self.frames_emitted += walk.frames;
            return Ok(AlignedChunk {
                data,
                start_offset,
                is_last: true,
                seek_points: seek_point.into_iter().collect(),
                first_packet: None,
            });
        }

        let rest = data.split_off(walk.consumed);
        self.carry = rest;
        self.carry_start = start_offset + walk.consumed as u64;
        self.frames_emitted += walk.frames;

        if self.carry.len() > MAX_CARRY {
            // Lost sync in garbage; keep only the tail that could still hold
            // the start of a real frame.
            let drop = self.carry.len() - MAX_FRAME_LEN;
            self.carry.drain(..drop);
            self.carry_start += drop as u64;
        }

        Ok(AlignedChunk {
            data,
            start_offset,
            is_last: false,
            seek_points: seek_point.into_iter().collect(),
            first_packet: None,
        })
    }

    /// Each aligned chunk starts at a frame boundary; that is a codec-safe
    /// resume point (modulo the bit reservoir, hence not exact).
    fn chunk_seek_point(&self, offset: u64) -> Option<SeekPoint> {
        if self.info.sample_rate == 0 {
            return None;
        }
        let frames = self.frames_emitted;
        Some(SeekPoint {
            time: Duration::from_secs_f64(
                frames as f64 * self.samples_per_frame as f64 / self.info.sample_rate as f64,
            ),
            byte_offset: offset,
            is_exact: false,
        })
    }

    pub fn time_to_byte(&self, time: Duration) -> Result<SeekResult> {
        let duration = self.info.duration().ok_or(Error::SeekUnsupported)?;
        if duration.is_zero() {
            return Err(Error::SeekUnsupported);
        }

        let fraction = (time.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0);
        let audio_bytes = self.info.audio_end - self.info.audio_start;

        let byte_offset = match &self.toc {
            Some(toc) => {
                // The TOC maps percent-of-time to 1/256ths-of-file.
                let idx = ((fraction * 100.0) as usize).min(99);
                self.info.audio_start + toc[idx] as u64 * audio_bytes / 256
            }
            None => self.info.audio_start + (fraction * audio_bytes as f64) as u64,
        };

        Ok(SeekResult {
            actual_time: Duration::from_secs_f64(fraction * duration.as_secs_f64()),
            byte_offset,
            is_exact: false,
            warning: Some("mp3 seek resolves to the nearest frame at or before the target".into()),
        })
    }

    pub fn optimal_chunk_size(&self, file_size: u64) -> ChunkSizing {
        default_chunk_sizing(file_size, 8 * MAX_FRAME_LEN)
    }

    pub fn carry_over_len(&self) -> usize {
        self.carry.len()
    }

    pub fn reset_alignment(&mut self) {
        self.carry.clear();
    }
}

/// Locate the first verifiable frame in `buf`.
fn find_first_frame(buf: &[u8]) -> Option<(usize, FrameHeader)> {
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        if let Some(header) = parse_frame_header(&buf[pos..]) {
            let next = pos + header.frame_len;
            if next + 4 > buf.len() || parse_frame_header(&buf[next..]).is_some() {
                return Some((pos, header));
            }
        }
        pos += 1;
    }
    None
}

struct XingTag {
    frames: Option<u32>,
    toc: Option<[u8; 100]>,
    delay: u32,
    padding: u32,
}

/// Parse a Xing/Info tag (and its LAME extension) from the first frame.
fn parse_xing(frame: &[u8], header: &FrameHeader) -> Option<XingTag> {
    let side_info = match (header.version, header.channels) {
        (MpegVersion::V1, 1) => 17,
        (MpegVersion::V1, _) => 32,
        (_, 1) => 9,
        (_, _) => 17,
    };
    let mut pos = 4 + side_info + if header.has_crc { 2 } else { 0 };

    if frame.len() < pos + 8 {
        return None;
    }
    let id = &frame[pos..pos + 4];
    if id != b"Xing" && id != b"Info" {
        return None;
    }
    pos += 4;

    let flags = u32::from_be_bytes(frame[pos..pos + 4].try_into().ok()?);
    pos += 4;

    let mut frames = None;
    if flags & 0x1 != 0 {
        frames = Some(u32::from_be_bytes(frame.get(pos..pos + 4)?.try_into().ok()?));
        pos += 4;
    }
    if flags & 0x2 != 0 {
        pos += 4; // byte count; the file size already tells us
    }
    let mut toc = None;
    if flags & 0x4 != 0 {
        let table: [u8; 100] = frame.get(pos..pos + 100)?.try_into().ok()?;
        toc = Some(table);
        pos += 100;
    }
    if flags & 0x8 != 0 {
        pos += 4; // quality
    }

    // LAME extension: 9-byte encoder string, then packed fields; the delay
    // and padding sit in the 3 bytes at offset 21.
    let mut delay = 0u32;
    let mut padding = 0u32;
    if let Some(lame) = frame.get(pos..pos + 24) {
        if &lame[0..4] == b"LAME" || &lame[0..4] == b"Lavf" || &lame[0..4] == b"Lavc" {
            let d0 = lame[21] as u32;
            let d1 = lame[22] as u32;
            let d2 = lame[23] as u32;
            delay = (d0 << 4) | (d1 >> 4);
            padding = ((d1 & 0x0F) << 8) | d2;
        }
    }

    Some(XingTag {
        frames,
        toc,
        delay,
        padding,
    })
}

fn syncsafe_u32(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32 & 0x7F) << 21)
        | ((bytes[1] as u32 & 0x7F) << 14)
        | ((bytes[2] as u32 & 0x7F) << 7)
        | (bytes[3] as u32 & 0x7F)
}
