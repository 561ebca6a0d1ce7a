//! MP4 (ISO BMFF) parsing and alignment for AAC audio tracks.
//!
//! Walks `moov` once to build a flat sample table (`stsz`/`stsc`/`stco`,
//! timing from `stts`, the AudioSpecificConfig from `esds`). Alignment then
//! emits samples in decode order, dropping inter-sample gaps (interleaved
//! non-audio chunks), so the decoder can split packets along the size table
//! alone.
//!
//! Fragmented MP4 (`moof`) is not supported; those files carry no usable
//! `stbl` and fail at construction with `NoAudioStream`.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::chunk::{AlignedChunk, ByteChunk, ChunkSizing, SeekPoint, SeekResult};
use crate::error::{Error, Result};
use crate::format::{AudioFormat, DecoderSpec, StreamInfo, default_chunk_sizing};
use crate::reader::ChunkReader;

pub struct Mp4Parser {
    info: StreamInfo,
    audio_specific_config: Vec<u8>,
    /// Per-sample file offsets, decode order, non-decreasing.
    offsets: Vec<u64>,
    /// Per-sample byte sizes, shared with the decoder adapter.
    sizes: Arc<[u32]>,
    /// Per-sample start positions in per-channel frames.
    start_frames: Vec<u64>,
    next_sample: usize,
    carry: Vec<u8>,
    carry_offset: u64,
}

impl Mp4Parser {
    pub fn from_reader(reader: &mut ChunkReader) -> Result<Self> {
        let file_size = reader.size_bytes();

        // Locate the moov box among the top-level boxes.
        let mut moov: Option<Vec<u8>> = None;
        let mut offset = 0u64;
        while offset + 8 <= file_size {
            let header = reader.read_exact_at(offset, 8)?;
            let mut size = u32::from_be_bytes(header[0..4].try_into().expect("size")) as u64;
            let kind: [u8; 4] = header[4..8].try_into().expect("fourcc");
            let mut payload = offset + 8;
            if size == 1 {
                let large = reader.read_exact_at(offset + 8, 8)?;
                size = u64::from_be_bytes(large.try_into().expect("largesize"));
                payload += 8;
            } else if size == 0 {
                size = file_size - offset;
            }
            if size < 8 || offset + size > file_size {
                return Err(Error::Truncated {
                    offset,
                    detail: format!("box {} runs past end of file", fourcc(&kind)),
                });
            }
            if &kind == b"moov" {
                moov = Some(reader.read_exact_at(payload, (offset + size - payload) as usize)?);
                break;
            }
            offset += size;
        }

        let moov = moov.ok_or(Error::NoAudioStream)?;
        let track = find_audio_track(&moov).ok_or(Error::NoAudioStream)?;
        let table = build_sample_table(&track)?;

        if table.offsets.is_empty() {
            return Err(Error::NoAudioStream);
        }

        let total_source_frames: u64 = table.total_frames;
        let delay = table.edit_delay_frames;
        let audio_start = *table.offsets.first().expect("non-empty");
        let audio_end = {
            let last = table.offsets.len() - 1;
            table.offsets[last] + table.sizes[last] as u64
        };

        debug!(
            samples = table.offsets.len(),
            sample_rate = table.sample_rate,
            delay,
            "built mp4 sample table"
        );

        let info = StreamInfo {
            format: AudioFormat::Mp4,
            sample_rate: table.sample_rate,
            channel_count: table.channels,
            bits_per_sample: None,
            total_frames: Some(total_source_frames.saturating_sub(delay as u64)),
            encoder_delay_frames: delay,
            audio_start,
            audio_end,
        };

        Ok(Self {
            info,
            audio_specific_config: table.audio_specific_config,
            offsets: table.offsets,
            sizes: table.sizes.into(),
            start_frames: table.start_frames,
            next_sample: 0,
            carry: Vec::new(),
            carry_offset: 0,
        })
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn decoder_spec(&self) -> DecoderSpec {
        DecoderSpec::Mp4 {
            audio_specific_config: self.audio_specific_config.clone(),
            sample_sizes: Arc::clone(&self.sizes),
        }
    }

    pub fn align(&mut self, chunk: ByteChunk) -> Result<AlignedChunk> {
        let (buf_start, mut data) = if self.carry.is_empty() {
            (chunk.start_offset, chunk.data)
        } else {
            let mut data = std::mem::take(&mut self.carry);
            data.extend_from_slice(&chunk.data);
            (self.carry_offset, data)
        };
        let buf_end = buf_start + data.len() as u64;

        let first_emitted = self.next_sample;
        let mut out = Vec::new();
        while self.next_sample < self.offsets.len() {
            let off = self.offsets[self.next_sample];
            let size = self.sizes[self.next_sample] as u64;
            if off < buf_start {
                // A seek landed past this sample; skip it.
                self.next_sample += 1;
                continue;
            }
            if off + size > buf_end {
                break;
            }
            let rel = (off - buf_start) as usize;
            out.extend_from_slice(&data[rel..rel + size as usize]);
            self.next_sample += 1;
        }

        let exhausted = self.next_sample >= self.offsets.len();

        // Keep only bytes that belong to the next (incomplete) sample; the
        // gap bytes before it are non-audio interleave.
        self.carry.clear();
        if !exhausted {
            let off = self.offsets[self.next_sample];
            if off < buf_end {
                let rel = (off.saturating_sub(buf_start)) as usize;
                self.carry.extend_from_slice(&data[rel..]);
                self.carry_offset = off.max(buf_start);
            } else {
                self.carry_offset = buf_end;
            }
        }
        data.clear();

        let start_offset = self
            .offsets
            .get(first_emitted)
            .copied()
            .unwrap_or(buf_start);

        let seek_points = if first_emitted < self.next_sample {
            vec![SeekPoint {
                time: Duration::from_secs_f64(
                    self.start_frames[first_emitted] as f64 / self.info.sample_rate as f64,
                ),
                byte_offset: start_offset,
                is_exact: true,
            }]
        } else {
            Vec::new()
        };

        Ok(AlignedChunk {
            data: out,
            start_offset,
            is_last: exhausted || chunk.is_last,
            seek_points,
            first_packet: Some(first_emitted as u64),
        })
    }

    pub fn time_to_byte(&self, time: Duration) -> Result<SeekResult> {
        let target_frame = (time.as_secs_f64() * self.info.sample_rate as f64) as u64;
        let idx = match self.start_frames.binary_search(&target_frame) {
            Ok(idx) => idx,
            Err(0) => 0,
            Err(insert) => insert - 1,
        };

        let actual_frame = self.start_frames[idx];
        Ok(SeekResult {
            actual_time: Duration::from_secs_f64(
                actual_frame as f64 / self.info.sample_rate as f64,
            ),
            byte_offset: self.offsets[idx],
            is_exact: actual_frame == target_frame,
            warning: (actual_frame != target_frame)
                .then(|| "seek resolved to the previous AAC sample boundary".into()),
        })
    }

    pub fn optimal_chunk_size(&self, file_size: u64) -> ChunkSizing {
        let max_sample = self.sizes.iter().copied().max().unwrap_or(0) as usize;
        default_chunk_sizing(file_size, (4 * max_sample).max(256 * 1024))
    }

    pub fn carry_over_len(&self) -> usize {
        self.carry.len()
    }

    pub fn reset_alignment(&mut self) {
        self.carry.clear();
        self.next_sample = 0;
    }
}

struct AudioTrack<'a> {
    mdhd: &'a [u8],
    stbl: BoxMap<'a>,
    elst: Option<&'a [u8]>,
}

struct SampleTable {
    sample_rate: u32,
    channels: u16,
    audio_specific_config: Vec<u8>,
    offsets: Vec<u64>,
    sizes: Vec<u32>,
    start_frames: Vec<u64>,
    total_frames: u64,
    edit_delay_frames: u32,
}

/// Child boxes of one container, by fourcc (first occurrence).
struct BoxMap<'a> {
    entries: Vec<([u8; 4], &'a [u8])>,
}

impl<'a> BoxMap<'a> {
    fn parse(data: &'a [u8]) -> Self {
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= data.len() {
            let size = u32::from_be_bytes(data[pos..pos + 4].try_into().expect("size")) as usize;
            let kind: [u8; 4] = data[pos + 4..pos + 8].try_into().expect("fourcc");
            if size < 8 || pos + size > data.len() {
                break;
            }
            entries.push((kind, &data[pos + 8..pos + size]));
            pos += size;
        }
        Self { entries }
    }

    fn get(&self, kind: &[u8; 4]) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, v)| *v)
    }

    fn all(&self, kind: &[u8; 4]) -> impl Iterator<Item = &'a [u8]> + '_ {
        let kind = *kind;
        self.entries
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, v)| *v)
    }
}

fn find_audio_track(moov: &[u8]) -> Option<AudioTrack<'_>> {
    let moov_children = BoxMap::parse(moov);
    for trak in moov_children.all(b"trak") {
        let trak_children = BoxMap::parse(trak);
        let Some(mdia) = trak_children.get(b"mdia") else {
            continue;
        };
        let mdia_children = BoxMap::parse(mdia);
        let Some(hdlr) = mdia_children.get(b"hdlr") else {
            continue;
        };
        // handler type sits after version/flags + predefined.
        if hdlr.len() < 12 || &hdlr[8..12] != b"soun" {
            continue;
        }
        let Some(mdhd) = mdia_children.get(b"mdhd") else {
            continue;
        };
        let Some(minf) = mdia_children.get(b"minf") else {
            continue;
        };
        let Some(stbl_bytes) = BoxMap::parse(minf).get(b"stbl") else {
            continue;
        };

        let elst = trak_children
            .get(b"edts")
            .and_then(|edts| BoxMap::parse(edts).get(b"elst"));

        return Some(AudioTrack {
            mdhd,
            stbl: BoxMap::parse(stbl_bytes),
            elst,
        });
    }
    None
}

fn build_sample_table(track: &AudioTrack<'_>) -> Result<SampleTable> {
    let corrupted = |what: &str| Error::CorruptedHeader(format!("mp4 {what}"));

    // mdhd: timescale at 12 (v0) or 20 (v1).
    let mdhd = track.mdhd;
    if mdhd.is_empty() {
        return Err(corrupted("empty mdhd"));
    }
    let timescale = match mdhd[0] {
        0 if mdhd.len() >= 16 => u32::from_be_bytes(mdhd[12..16].try_into().expect("u32")),
        1 if mdhd.len() >= 24 => u32::from_be_bytes(mdhd[20..24].try_into().expect("u32")),
        _ => return Err(corrupted("mdhd too short")),
    };

    // stsd -> mp4a -> channels, sample rate, esds.
    let stsd = track.stbl.get(b"stsd").ok_or_else(|| corrupted("missing stsd"))?;
    let (sample_rate, channels, asc) = parse_stsd(stsd)?;
    let sample_rate = if sample_rate != 0 { sample_rate } else { timescale };

    // stsz: per-sample sizes.
    let stsz = track.stbl.get(b"stsz").ok_or_else(|| corrupted("missing stsz"))?;
    if stsz.len() < 12 {
        return Err(corrupted("stsz too short"));
    }
    let fixed_size = u32::from_be_bytes(stsz[4..8].try_into().expect("u32"));
    let sample_count = u32::from_be_bytes(stsz[8..12].try_into().expect("u32")) as usize;
    let mut sizes = Vec::with_capacity(sample_count);
    if fixed_size != 0 {
        sizes.resize(sample_count, fixed_size);
    } else {
        if stsz.len() < 12 + sample_count * 4 {
            return Err(corrupted("stsz size table truncated"));
        }
        for i in 0..sample_count {
            let at = 12 + i * 4;
            sizes.push(u32::from_be_bytes(stsz[at..at + 4].try_into().expect("u32")));
        }
    }

    // stco/co64: chunk offsets.
    let chunk_offsets: Vec<u64> = if let Some(stco) = track.stbl.get(b"stco") {
        read_table_u32(stco)?.into_iter().map(u64::from).collect()
    } else if let Some(co64) = track.stbl.get(b"co64") {
        read_table_u64(co64)?
    } else {
        return Err(corrupted("missing stco/co64"));
    };

    // stsc: samples-per-chunk runs.
    let stsc = track.stbl.get(b"stsc").ok_or_else(|| corrupted("missing stsc"))?;
    if stsc.len() < 8 {
        return Err(corrupted("stsc too short"));
    }
    let stsc_count = u32::from_be_bytes(stsc[4..8].try_into().expect("u32")) as usize;
    if stsc.len() < 8 + stsc_count * 12 {
        return Err(corrupted("stsc run table truncated"));
    }
    let mut runs = Vec::with_capacity(stsc_count);
    for i in 0..stsc_count {
        let at = 8 + i * 12;
        let first_chunk = u32::from_be_bytes(stsc[at..at + 4].try_into().expect("u32"));
        let per_chunk = u32::from_be_bytes(stsc[at + 4..at + 8].try_into().expect("u32"));
        runs.push((first_chunk, per_chunk));
    }

    // Expand chunk runs into per-sample file offsets.
    let mut offsets = Vec::with_capacity(sample_count);
    let mut sample = 0usize;
    'chunks: for (chunk_idx, &chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = chunk_idx as u32 + 1;
        let per_chunk = runs
            .iter()
            .take_while(|(first, _)| *first <= chunk_number)
            .last()
            .map(|(_, n)| *n)
            .unwrap_or(0);

        let mut within = chunk_offset;
        for _ in 0..per_chunk {
            if sample >= sample_count {
                break 'chunks;
            }
            offsets.push(within);
            within += sizes[sample] as u64;
            sample += 1;
        }
    }
    offsets.truncate(sample);
    sizes.truncate(sample);

    // stts: per-sample durations -> start frames in the media timescale,
    // rescaled to the sample rate when they differ.
    let stts = track.stbl.get(b"stts").ok_or_else(|| corrupted("missing stts"))?;
    if stts.len() < 8 {
        return Err(corrupted("stts too short"));
    }
    let stts_count = u32::from_be_bytes(stts[4..8].try_into().expect("u32")) as usize;
    if stts.len() < 8 + stts_count * 8 {
        return Err(corrupted("stts run table truncated"));
    }
    let rescale = |ticks: u64| -> u64 {
        if timescale == sample_rate || timescale == 0 {
            ticks
        } else {
            ticks * sample_rate as u64 / timescale as u64
        }
    };

    let mut start_frames = Vec::with_capacity(offsets.len());
    let mut elapsed_ticks = 0u64;
    'stts: for i in 0..stts_count {
        let at = 8 + i * 8;
        let count = u32::from_be_bytes(stts[at..at + 4].try_into().expect("u32"));
        let delta = u32::from_be_bytes(stts[at + 4..at + 8].try_into().expect("u32")) as u64;
        for _ in 0..count {
            if start_frames.len() >= offsets.len() {
                break 'stts;
            }
            start_frames.push(rescale(elapsed_ticks));
            elapsed_ticks += delta;
        }
    }
    // Tolerate a short stts by extending with the last delta.
    let last_delta = (stts_count > 0)
        .then(|| {
            let at = 8 + (stts_count - 1) * 8;
            u32::from_be_bytes(stts[at + 4..at + 8].try_into().expect("u32")) as u64
        })
        .unwrap_or(1024);
    while start_frames.len() < offsets.len() {
        start_frames.push(rescale(elapsed_ticks));
        elapsed_ticks += last_delta;
    }
    let total_frames = rescale(elapsed_ticks);

    // elst media_time declares the leading trim (encoder delay).
    let edit_delay_frames = track
        .elst
        .and_then(|elst| parse_elst_delay(elst))
        .map(rescale)
        .unwrap_or(0) as u32;

    Ok(SampleTable {
        sample_rate,
        channels,
        audio_specific_config: asc,
        offsets,
        sizes,
        start_frames,
        total_frames,
        edit_delay_frames,
    })
}

fn parse_stsd(stsd: &[u8]) -> Result<(u32, u16, Vec<u8>)> {
    let corrupted = |what: &str| Error::CorruptedHeader(format!("mp4 {what}"));

    if stsd.len() < 16 {
        return Err(corrupted("stsd too short"));
    }
    // version/flags + entry count, then the first sample entry.
    let entry = &stsd[8..];
    let kind = &entry[4..8];
    if kind != b"mp4a" {
        return Err(Error::UnsupportedCodec(format!(
            "mp4 sample entry {} (only mp4a/AAC is supported)",
            fourcc(kind.try_into().expect("fourcc"))
        )));
    }
    if entry.len() < 36 {
        return Err(corrupted("mp4a entry too short"));
    }
    // 8 byte box header + 6 reserved + 2 data-ref + 8 version/revision/vendor.
    let channels = u16::from_be_bytes(entry[24..26].try_into().expect("u16"));
    // 16.16 fixed point; the integer part is the rate.
    let sample_rate = u32::from_be_bytes(entry[32..36].try_into().expect("u32")) >> 16;

    // Child boxes of mp4a follow at offset 36; esds holds the ASC.
    let children = BoxMap::parse(&entry[36..]);
    let esds = children.get(b"esds").ok_or_else(|| corrupted("missing esds"))?;
    let asc = parse_esds_asc(esds).ok_or_else(|| corrupted("esds without decoder config"))?;

    Ok((sample_rate, channels, asc))
}

/// Dig the AudioSpecificConfig out of the esds descriptor chain.
fn parse_esds_asc(esds: &[u8]) -> Option<Vec<u8>> {
    // Skip version/flags.
    let mut pos = 4usize;

    let read_descriptor = |buf: &[u8], pos: &mut usize| -> Option<(u8, usize)> {
        let tag = *buf.get(*pos)?;
        *pos += 1;
        // Expandable length: 7 bits per byte, high bit continues.
        let mut len = 0usize;
        for _ in 0..4 {
            let b = *buf.get(*pos)?;
            *pos += 1;
            len = (len << 7) | (b & 0x7F) as usize;
            if b & 0x80 == 0 {
                break;
            }
        }
        Some((tag, len))
    };

    // ES descriptor (0x03): ES_ID + flags, then nested descriptors.
    let (tag, _) = read_descriptor(esds, &mut pos)?;
    if tag != 0x03 {
        return None;
    }
    pos += 3;

    // DecoderConfigDescriptor (0x04): object type + stream info.
    let (tag, _) = read_descriptor(esds, &mut pos)?;
    if tag != 0x04 {
        return None;
    }
    pos += 13;

    // DecoderSpecificInfo (0x05): the AudioSpecificConfig itself.
    let (tag, len) = read_descriptor(esds, &mut pos)?;
    if tag != 0x05 {
        return None;
    }
    esds.get(pos..pos + len).map(|b| b.to_vec())
}

fn parse_elst_delay(elst: &[u8]) -> Option<u64> {
    if elst.len() < 8 {
        return None;
    }
    let version = elst[0];
    let count = u32::from_be_bytes(elst[4..8].try_into().ok()?);
    if count == 0 {
        return None;
    }
    // First entry: (duration, media_time, rate); media_time > 0 is the trim.
    match version {
        0 if elst.len() >= 16 => {
            let media_time = i32::from_be_bytes(elst[12..16].try_into().ok()?);
            (media_time > 0).then_some(media_time as u64)
        }
        1 if elst.len() >= 24 => {
            let media_time = i64::from_be_bytes(elst[16..24].try_into().ok()?);
            (media_time > 0).then_some(media_time as u64)
        }
        _ => None,
    }
}

fn read_table_u32(data: &[u8]) -> Result<Vec<u32>> {
    if data.len() < 8 {
        return Err(Error::CorruptedHeader("mp4 offset table too short".into()));
    }
    let count = u32::from_be_bytes(data[4..8].try_into().expect("u32")) as usize;
    if data.len() < 8 + count * 4 {
        return Err(Error::CorruptedHeader("mp4 offset table truncated".into()));
    }
    Ok((0..count)
        .map(|i| {
            let at = 8 + i * 4;
            u32::from_be_bytes(data[at..at + 4].try_into().expect("u32"))
        })
        .collect())
}

fn read_table_u64(data: &[u8]) -> Result<Vec<u64>> {
    if data.len() < 8 {
        return Err(Error::CorruptedHeader("mp4 offset table too short".into()));
    }
    let count = u32::from_be_bytes(data[4..8].try_into().expect("u32")) as usize;
    if data.len() < 8 + count * 8 {
        return Err(Error::CorruptedHeader("mp4 offset table truncated".into()));
    }
    Ok((0..count)
        .map(|i| {
            let at = 8 + i * 8;
            u64::from_be_bytes(data[at..at + 8].try_into().expect("u64"))
        })
        .collect())
}

fn fourcc(kind: &[u8; 4]) -> String {
    kind.iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}
