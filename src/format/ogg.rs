//! OGG parsing and alignment, for Vorbis and Opus payloads.
//!
//! Pages are the codec-safe unit: alignment emits whole pages and withholds
//! a trailing partial page. Header packets (Vorbis identification/comment/
//! setup, `OpusHead`/`OpusTags`) are assembled once at construction; the
//! Vorbis headers travel to the decoder verbatim, the Opus header contributes
//! the pre-skip count.
//!
//! Granule positions give the stream clock: for seekable files the final
//! page's granule (found in a bounded tail window) yields the total frame
//! count without scanning the whole file.

use std::time::Duration;

use tracing::{debug, warn};

use crate::chunk::{AlignedChunk, ByteChunk, ChunkSizing, SeekPoint, SeekResult};
use crate::error::{Error, Result};
use crate::format::{AudioFormat, DecoderSpec, StreamInfo, default_chunk_sizing};
use crate::reader::ChunkReader;

/// Largest possible page: 27-byte header, 255 lacing values, 255 * 255 body.
pub(crate) const MAX_PAGE_LEN: usize = 27 + 255 + 255 * 255;

/// Granule value meaning "no packet finishes on this page".
const GRANULE_NONE: u64 = u64::MAX;

/// Opus output is always 48 kHz; granules count in this rate.
const OPUS_SAMPLE_RATE: u32 = 48_000;

/// How far we are willing to read while assembling header packets.
const MAX_HEADER_SPAN: usize = 1024 * 1024;

/// Tail window scanned for the final granule position.
const TAIL_PROBE_LEN: usize = 64 * 1024;

/// A parsed page header (body not included).
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageInfo {
    pub granule: u64,
    pub serial: u32,
    pub is_continued: bool,
    pub is_bos: bool,
    pub header_len: usize,
    pub body_len: usize,
}

impl PageInfo {
    pub fn total_len(&self) -> usize {
        self.header_len + self.body_len
    }
}

/// Parse a complete page at the start of `buf`.
///
/// `None` means "not a page here or not enough bytes yet"; callers decide
/// whether to wait for more data or to resync.
pub(crate) fn parse_page(buf: &[u8]) -> Option<PageInfo> {
    if buf.len() < 27 || &buf[0..4] != b"OggS" || buf[4] != 0 {
        return None;
    }
    let n_segments = buf[26] as usize;
    if buf.len() < 27 + n_segments {
        return None;
    }
    let body_len: usize = buf[27..27 + n_segments].iter().map(|&l| l as usize).sum();
    let header_len = 27 + n_segments;
    if buf.len() < header_len + body_len {
        return None;
    }

    Some(PageInfo {
        granule: u64::from_le_bytes(buf[6..14].try_into().expect("granule")),
        serial: u32::from_le_bytes(buf[14..18].try_into().expect("serial")),
        is_continued: buf[5] & 0x1 != 0,
        is_bos: buf[5] & 0x2 != 0,
        header_len,
        body_len,
    })
}

/// Append the packets completed in one page body to `out`, carrying an
/// unfinished packet in `partial` across pages.
pub(crate) fn extract_packets(
    page: &PageInfo,
    page_bytes: &[u8],
    partial: &mut Vec<u8>,
    out: &mut Vec<Vec<u8>>,
) {
    if !page.is_continued {
        // A fresh page must start a fresh packet; a stale partial means we
        // lost the preceding page (seek or corruption).
        if !partial.is_empty() {
            warn!(dropped = partial.len(), "dropping unfinished ogg packet");
            partial.clear();
        }
    }

    let lacing = &page_bytes[27..27 + (page.header_len - 27)];
    let mut body_pos = page.header_len;
    for &segment in lacing {
        let len = segment as usize;
        partial.extend_from_slice(&page_bytes[body_pos..body_pos + len]);
        body_pos += len;
        if len < 255 {
            out.push(std::mem::take(partial));
        }
    }
}

enum OggCodec {
    Vorbis {
        ident_packet: Vec<u8>,
        setup_packet: Vec<u8>,
    },
    Opus {
        pre_skip: u16,
    },
}

pub struct OggParser {
    info: StreamInfo,
    codec: OggCodec,
    serial: u32,
    carry: Vec<u8>,
    carry_start: u64,
}

impl OggParser {
    pub fn from_reader(reader: &mut ChunkReader) -> Result<Self> {
        let file_size = reader.size_bytes();

        // Assemble the header packets of the first audio stream. Header
        // packets always finish before audio pages begin, so the window only
        // needs to cover the header span.
        let mut window_len = (64 * 1024).min(file_size as usize);
        let mut window = reader.read_exact_at(0, window_len)?;

        let mut cursor = 0usize;
        let mut serial: Option<u32> = None;
        let mut partial = Vec::new();
        let mut packets: Vec<Vec<u8>> = Vec::new();
        let mut audio_start: Option<u64> = None;
        let packets_needed;

        // First pass: find the BOS page of a stream we can decode.
        let codec_kind = loop {
            let Some(page) = parse_page(&window[cursor..]) else {
                if window_len < MAX_HEADER_SPAN && (window_len as u64) < file_size {
                    window_len = (window_len * 2).min(file_size as usize).min(MAX_HEADER_SPAN);
                    window = reader.read_exact_at(0, window_len)?;
                    continue;
                }
                return Err(Error::CorruptedHeader("no decodable ogg stream found".into()));
            };
            let body = &window[cursor + page.header_len..cursor + page.total_len()];
            if page.is_bos {
                if body.starts_with(b"OpusHead") {
                    serial = Some(page.serial);
                    break "opus";
                }
                if body.starts_with(b"\x01vorbis") {
                    serial = Some(page.serial);
                    break "vorbis";
                }
            }
            cursor += page.total_len();
        };

        let serial = serial.expect("serial set with codec");
        packets_needed = match codec_kind {
            "vorbis" => 3,
            _ => 2,
        };

        // Second pass: collect header packets for our serial and note where
        // audio pages begin.
        cursor = 0;
        loop {
            let Some(page) = parse_page(&window[cursor..]) else {
                if window_len < MAX_HEADER_SPAN && (window_len as u64) < file_size {
                    window_len = (window_len * 2).min(file_size as usize).min(MAX_HEADER_SPAN);
                    window = reader.read_exact_at(0, window_len)?;
                    continue;
                }
                return Err(Error::Truncated {
                    offset: file_size.min(window_len as u64),
                    detail: "ogg header packets never completed".into(),
                });
            };
            let page_bytes = &window[cursor..cursor + page.total_len()];
            if page.serial == serial {
                extract_packets(&page, page_bytes, &mut partial, &mut packets);
            }
            cursor += page.total_len();
            if packets.len() >= packets_needed {
                audio_start = Some(cursor as u64);
                break;
            }
        }

        let audio_start = audio_start.expect("loop exits with audio start");

        let (codec, sample_rate, channel_count, pre_skip) = match codec_kind {
            "opus" => {
                let head = &packets[0];
                if head.len() < 19 {
                    return Err(Error::CorruptedHeader("OpusHead too short".into()));
                }
                let channels = head[9] as u16;
                let pre_skip = u16::from_le_bytes(head[10..12].try_into().expect("pre-skip"));
                debug!(channels, pre_skip, "parsed OpusHead");
                (
                    OggCodec::Opus { pre_skip },
                    OPUS_SAMPLE_RATE,
                    channels,
                    pre_skip,
                )
            }
            _ => {
                let ident = &packets[0];
                if ident.len() < 30 {
                    return Err(Error::CorruptedHeader(
                        "vorbis identification header too short".into(),
                    ));
                }
                let channels = ident[11] as u16;
                let sample_rate =
                    u32::from_le_bytes(ident[12..16].try_into().expect("sample rate"));
                (
                    OggCodec::Vorbis {
                        ident_packet: packets[0].clone(),
                        setup_packet: packets[2].clone(),
                    },
                    sample_rate,
                    channels,
                    0,
                )
            }
        };

        // Duration probe: the last page of our stream carries the final
        // granule position.
        let total_frames = last_granule(reader, file_size, serial)?.map(|granule| {
            granule.saturating_sub(pre_skip as u64)
        });

        let info = StreamInfo {
            format: match codec {
                OggCodec::Vorbis { .. } => AudioFormat::OggVorbis,
                OggCodec::Opus { .. } => AudioFormat::OggOpus,
            },
            sample_rate,
            channel_count,
            bits_per_sample: None,
            total_frames,
            encoder_delay_frames: pre_skip as u32,
            audio_start,
            audio_end: file_size,
        };

        Ok(Self {
            info,
            codec,
            serial,
            carry: Vec::new(),
            carry_start: audio_start,
        })
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn decoder_spec(&self) -> DecoderSpec {
        match &self.codec {
            OggCodec::Vorbis {
                ident_packet,
                setup_packet,
            } => DecoderSpec::OggVorbis {
                serial: self.serial,
                ident_packet: ident_packet.clone(),
                setup_packet: setup_packet.clone(),
            },
            OggCodec::Opus { pre_skip } => DecoderSpec::OggOpus {
                serial: self.serial,
                pre_skip: *pre_skip,
            },
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

        if chunk.is_last {
            return Ok(AlignedChunk {
                seek_points: self.page_seek_points(&data, start_offset),
                data,
                start_offset,
                is_last: true,
                first_packet: None,
            });
        }

        // Emit whole pages; a partial page at the tail is withheld.
        let mut consumed = 0usize;
        loop {
            match parse_page(&data[consumed..]) {
                Some(page) => consumed += page.total_len(),
                None => {
                    // Either a partial page, or junk. Junk only happens after
                    // corruption; resync by scanning for the capture pattern.
                    if data.len() - consumed >= MAX_PAGE_LEN {
                        match crate::format::find_subslice(&data[consumed + 1..], b"OggS") {
                            Some(rel) => {
                                warn!(skipped = rel + 1, "resynced to next ogg page");
                                consumed += rel + 1;
                                continue;
                            }
                            None => {
                                let keep = data.len() - 4;
                                consumed = consumed.max(keep);
                            }
                        }
                    }
                    break;
                }
            }
        }

        let seek_points = self.page_seek_points(&data[..consumed], start_offset);
        let rest = data.split_off(consumed);
        self.carry = rest;
        self.carry_start = start_offset + consumed as u64;

        Ok(AlignedChunk {
            data,
            start_offset,
            is_last: false,
            seek_points,
            first_packet: None,
        })
    }

    /// Pages of our stream with a granule are resumable positions. The
    /// granule stamps the *end* of the page, so the point is approximate.
    fn page_seek_points(&self, data: &[u8], start_offset: u64) -> Vec<SeekPoint> {
        let mut points = Vec::new();
        let mut pos = 0usize;
        while let Some(page) = parse_page(&data[pos..]) {
            if page.serial == self.serial && page.granule != GRANULE_NONE {
                let frames = page
                    .granule
                    .saturating_sub(self.info.encoder_delay_frames as u64);
                points.push(SeekPoint {
                    time: Duration::from_secs_f64(frames as f64 / self.info.sample_rate as f64),
                    byte_offset: start_offset + pos as u64,
                    is_exact: false,
                });
            }
            pos += page.total_len();
        }
        points
    }

    pub fn time_to_byte(&self, time: Duration) -> Result<SeekResult> {
        let total = self.info.total_frames.ok_or(Error::SeekUnsupported)?;
        if total == 0 || self.info.sample_rate == 0 {
            return Err(Error::SeekUnsupported);
        }

        let duration = total as f64 / self.info.sample_rate as f64;
        let fraction = (time.as_secs_f64() / duration).clamp(0.0, 1.0);
        let span = self.info.audio_end - self.info.audio_start;

        Ok(SeekResult {
            actual_time: Duration::from_secs_f64(fraction * duration),
            byte_offset: self.info.audio_start + (fraction * span as f64) as u64,
            is_exact: false,
            warning: Some(
                "ogg seek interpolates by granule; decoding resumes at the prior page".into(),
            ),
        })
    }

    pub fn optimal_chunk_size(&self, file_size: u64) -> ChunkSizing {
        default_chunk_sizing(file_size, 4 * MAX_PAGE_LEN)
    }

    pub fn carry_over_len(&self) -> usize {
        self.carry.len()
    }

    pub fn reset_alignment(&mut self) {
        self.carry.clear();
    }
}

/// Scan a bounded tail window for the last granule of `serial`.
fn last_granule(reader: &mut ChunkReader, file_size: u64, serial: u32) -> Result<Option<u64>> {
    let probe_len = TAIL_PROBE_LEN.min(file_size as usize);
    let probe_start = file_size - probe_len as u64;
    let tail = reader.read_exact_at(probe_start, probe_len)?;

    let mut best = None;
    let mut pos = 0usize;
    while let Some(rel) = crate::format::find_subslice(&tail[pos..], b"OggS") {
        let at = pos + rel;
        if let Some(page) = parse_page(&tail[at..]) {
            if page.serial == serial && page.granule != GRANULE_NONE {
                best = Some(page.granule);
            }
            pos = at + page.total_len();
        } else {
            pos = at + 1;
        }
        if pos >= tail.len() {
            break;
        }
    }

    if best.is_none() {
        warn!("no closing granule found in tail window; duration unknown");
    }
    Ok(best)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Build one page. `packets` become lacing runs; packets of exactly 255
    /// bytes would need continuation, so tests keep them shorter.
    pub(crate) fn page(
        serial: u32,
        sequence: u32,
        granule: u64,
        flags: u8,
        packets: &[&[u8]],
    ) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut body = Vec::new();
        for packet in packets {
            assert!(packet.len() < 255);
            lacing.push(packet.len() as u8);
            body.extend_from_slice(packet);
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"OggS");
        out.push(0); // version
        out.push(flags);
        out.extend_from_slice(&granule.to_le_bytes());
        out.extend_from_slice(&serial.to_le_bytes());
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // crc, unchecked
        out.push(lacing.len() as u8);
        out.extend_from_slice(&lacing);
        out.extend_from_slice(&body);
        out
    }

    fn opus_head(channels: u8, pre_skip: u16) -> Vec<u8> {
        let mut head = b"OpusHead".to_vec();
        head.push(1); // version
        head.push(channels);
        head.extend_from_slice(&pre_skip.to_le_bytes());
        head.extend_from_slice(&48_000u32.to_le_bytes()); // input rate
        head.extend_from_slice(&0u16.to_le_bytes()); // output gain
        head.push(0); // channel mapping family
        head
    }

    /// An Opus stream: header pages, then `audio_pages` single-packet pages.
    pub(crate) fn opus_fixture(pre_skip: u16, audio_pages: usize, final_granule: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&page(7, 0, GRANULE_NONE, 0x2, &[&opus_head(2, pre_skip)]));
        out.extend_from_slice(&page(7, 1, GRANULE_NONE, 0, &[b"OpusTags\x00\x00\x00\x00\x00\x00\x00\x00"]));
        for i in 0..audio_pages {
            let granule = if i + 1 == audio_pages {
                final_granule
            } else {
                (i as u64 + 1) * 960
            };
            let flags = if i + 1 == audio_pages { 0x4 } else { 0 };
            out.extend_from_slice(&page(7, 2 + i as u32, granule, flags, &[&[0xFC, 0xFF, 0xFE]]));
        }
        out
    }

    fn parser_for(bytes: &[u8]) -> (OggParser, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(bytes).expect("write fixture");
        let mut reader =
            ChunkReader::open(file.path(), crate::reader::MIN_CHUNK_SIZE).expect("open");
        let parser = OggParser::from_reader(&mut reader).expect("parse");
        (parser, file)
    }

    #[test]
    fn opus_headers_and_tail_granule() {
        let bytes = opus_fixture(312, 5, 5 * 960);
        let (parser, _file) = parser_for(&bytes);

        let info = parser.stream_info();
        assert_eq!(info.format, AudioFormat::OggOpus);
        assert_eq!(info.sample_rate, 48_000);
        assert_eq!(info.channel_count, 2);
        assert_eq!(info.encoder_delay_frames, 312);
        assert_eq!(info.total_frames, Some(5 * 960 - 312));

        match parser.decoder_spec() {
            DecoderSpec::OggOpus { serial, pre_skip } => {
                assert_eq!(serial, 7);
                assert_eq!(pre_skip, 312);
            }
            other => panic!("wrong decoder spec: {other:?}"),
        }
    }

    #[test]
    fn align_withholds_partial_pages() {
        let bytes = opus_fixture(0, 4, 4 * 960);
        let (mut parser, _file) = parser_for(&bytes);
        let start = parser.stream_info().audio_start as usize;

        // Feed the audio region minus the final 10 bytes.
        let cut = bytes.len() - 10;
        let aligned = parser
            .align(ByteChunk {
                data: bytes[start..cut].to_vec(),
                start_offset: start as u64,
                is_last: false,
                is_seek_point: true,
            })
            .expect("align");

        // Three whole pages out, the clipped fourth withheld.
        assert_eq!(parser.carry_over_len(), bytes.len() - 10 - start - aligned.data.len());
        assert!(!aligned.seek_points.is_empty());
        assert!(aligned.seek_points.iter().all(|p| !p.is_exact));

        let tail = parser
            .align(ByteChunk {
                data: bytes[cut..].to_vec(),
                start_offset: cut as u64,
                is_last: true,
                is_seek_point: false,
            })
            .expect("align last");
        assert!(tail.is_last);
        assert_eq!(tail.data.len(), 10 + parser_carry_before_last(&bytes, start, cut));
    }

    fn parser_carry_before_last(bytes: &[u8], start: usize, cut: usize) -> usize {
        // The withheld bytes are exactly the clipped final page minus the
        // ten bytes held back from the first feed.
        let mut consumed = start;
        loop {
            match parse_page(&bytes[consumed..cut]) {
                Some(page) => consumed += page.total_len(),
                None => break,
            }
        }
        cut - consumed
    }

    #[test]
    fn packet_extraction_respects_lacing() {
        let bytes = page(9, 0, 0, 0, &[b"alpha", b"beta"]);
        let info = parse_page(&bytes).expect("page");
        let mut partial = Vec::new();
        let mut packets = Vec::new();
        extract_packets(&info, &bytes, &mut partial, &mut packets);

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], b"alpha");
        assert_eq!(packets[1], b"beta");
        assert!(partial.is_empty());
    }

    #[test]
    fn vorbis_stream_info_comes_from_ident_header() {
        let mut ident = b"\x01vorbis".to_vec();
        ident.extend_from_slice(&0u32.to_le_bytes()); // version
        ident.push(2); // channels
        ident.extend_from_slice(&44_100u32.to_le_bytes());
        ident.extend_from_slice(&[0u8; 13]); // bitrates, blocksizes, framing

        let comment = b"\x03vorbis\x00\x00\x00\x00\x00".to_vec();
        let setup = b"\x05vorbis-setup-data".to_vec();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&page(3, 0, GRANULE_NONE, 0x2, &[&ident]));
        bytes.extend_from_slice(&page(3, 1, GRANULE_NONE, 0, &[&comment, &setup]));
        bytes.extend_from_slice(&page(3, 2, 8820, 0x4, &[&[0u8; 20]]));

        let (parser, _file) = parser_for(&bytes);
        let info = parser.stream_info();
        assert_eq!(info.format, AudioFormat::OggVorbis);
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channel_count, 2);
        assert_eq!(info.total_frames, Some(8820));

        match parser.decoder_spec() {
            DecoderSpec::OggVorbis {
                serial,
                ident_packet,
                setup_packet,
            } => {
                assert_eq!(serial, 3);
                assert!(ident_packet.starts_with(b"\x01vorbis"));
                assert!(setup_packet.starts_with(b"\x05vorbis"));
            }
            other => panic!("wrong decoder spec: {other:?}"),
        }
    }
}
