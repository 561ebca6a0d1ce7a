//! Format chunk parsers.
//!
//! One parser per supported container/codec. Each parser:
//! - identifies its format from magic bytes (never the file extension),
//! - walks the headers once at construction (via the reader) to produce a
//!   `StreamInfo` and a `DecoderSpec`,
//! - aligns arbitrary byte chunks to codec-safe boundaries with a bounded
//!   carry-over buffer,
//! - translates times to byte offsets for seeking,
//! - recommends a chunk size for the file.
//!
//! Parsers are a tagged enum rather than trait objects: the format set is
//! closed, dispatch stays explicit, and each variant keeps its own state
//! without boxing.

pub mod flac;
pub mod mp3;
pub mod mp4;
pub mod ogg;
pub mod wav;

use std::sync::Arc;
use std::time::Duration;

use crate::chunk::{AlignedChunk, ByteChunk, ChunkSizing, SeekResult};
use crate::error::{Error, Result};
use crate::reader::ChunkReader;

pub use flac::FlacParser;
pub use mp3::Mp3Parser;
pub use mp4::Mp4Parser;
pub use ogg::OggParser;
pub use wav::{WavParser, WavSampleFormat};

/// How many leading bytes detection may need. OGG streams reveal their codec
/// only inside the first page body, so this is more than a magic word.
pub const DETECT_PREFIX_LEN: usize = 512;

/// The supported formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Wav,
    Flac,
    OggVorbis,
    OggOpus,
    Mp4,
}

impl AudioFormat {
    /// Identify a format from the file's leading bytes.
    ///
    /// Signatures: `ID3`/`0xFFEx` (MP3), `RIFF..WAVE`, `fLaC`, `OggS` (codec
    /// from the first page body), `ftyp` at offset 4 (MP4).
    pub fn detect(header: &[u8]) -> Option<AudioFormat> {
        if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE" {
            return Some(AudioFormat::Wav);
        }
        if header.starts_with(b"fLaC") {
            return Some(AudioFormat::Flac);
        }
        if header.starts_with(b"OggS") {
            // The first page of the first logical stream carries the codec's
            // identification packet; it sits within the detection prefix.
            if find_subslice(header, b"OpusHead").is_some() {
                return Some(AudioFormat::OggOpus);
            }
            if find_subslice(header, b"\x01vorbis").is_some() {
                return Some(AudioFormat::OggVorbis);
            }
            return None;
        }
        if header.len() >= 12 && &header[4..8] == b"ftyp" {
            return Some(AudioFormat::Mp4);
        }
        if header.starts_with(b"ID3") {
            return Some(AudioFormat::Mp3);
        }
        if header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0 {
            return Some(AudioFormat::Mp3);
        }
        None
    }

    pub fn name(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::OggVorbis => "ogg/vorbis",
            AudioFormat::OggOpus => "ogg/opus",
            AudioFormat::Mp4 => "mp4/aac",
        }
    }
}

/// Stream parameters discovered while walking the headers.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bits_per_sample: Option<u32>,
    /// Playable per-channel frames (priming and trailing padding excluded)
    /// when the headers declare or imply them.
    pub total_frames: Option<u64>,
    /// Leading priming frames the decoder must discard (LAME delay for MP3,
    /// `OpusHead` pre-skip for Opus, zero for lossless formats).
    pub encoder_delay_frames: u32,
    /// First byte of codec audio data.
    pub audio_start: u64,
    /// One past the last byte of codec audio data.
    pub audio_end: u64,
}

impl StreamInfo {
    pub fn duration(&self) -> Option<Duration> {
        let frames = self.total_frames?;
        if self.sample_rate == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            frames as f64 / self.sample_rate as f64,
        ))
    }

    pub(crate) fn require_audio(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channel_count == 0 {
            return Err(Error::NoAudioStream);
        }
        Ok(())
    }
}

/// Format-specific material the decoder adapter needs at construction.
#[derive(Debug, Clone)]
pub enum DecoderSpec {
    Wav {
        sample_format: WavSampleFormat,
        block_align: u16,
    },
    Mp3,
    Flac {
        max_block_size: u16,
    },
    OggVorbis {
        /// Serial number of the selected logical stream.
        serial: u32,
        /// Identification and setup header packets, verbatim.
        ident_packet: Vec<u8>,
        setup_packet: Vec<u8>,
    },
    OggOpus {
        serial: u32,
        pre_skip: u16,
    },
    Mp4 {
        /// AudioSpecificConfig from the `esds` box.
        audio_specific_config: Vec<u8>,
        /// Per-sample byte sizes, in decode order; the adapter splits aligned
        /// bytes into packets along these.
        sample_sizes: Arc<[u32]>,
    },
}

/// Tagged dispatch over the per-format parsers.
pub enum FormatParser {
    Mp3(Mp3Parser),
    Wav(WavParser),
    Flac(FlacParser),
    Ogg(OggParser),
    Mp4(Mp4Parser),
}

impl FormatParser {
    /// Detect the format and walk its headers.
    ///
    /// The reader's streaming position is left untouched; the pipeline seeks
    /// to `stream_info().audio_start` before the first aligned read.
    pub fn new(reader: &mut ChunkReader) -> Result<Self> {
        let prefix_len = DETECT_PREFIX_LEN.min(reader.size_bytes() as usize);
        let prefix = reader.read_exact_at(0, prefix_len)?;

        let format = AudioFormat::detect(&prefix).ok_or_else(|| {
            Error::UnsupportedFormat(format!(
                "no known signature in the first {prefix_len} bytes"
            ))
        })?;

        let parser = match format {
            AudioFormat::Mp3 => FormatParser::Mp3(Mp3Parser::from_reader(reader)?),
            AudioFormat::Wav => FormatParser::Wav(WavParser::from_reader(reader)?),
            AudioFormat::Flac => FormatParser::Flac(FlacParser::from_reader(reader)?),
            AudioFormat::OggVorbis | AudioFormat::OggOpus => {
                FormatParser::Ogg(OggParser::from_reader(reader)?)
            }
            AudioFormat::Mp4 => FormatParser::Mp4(Mp4Parser::from_reader(reader)?),
        };

        parser.stream_info().require_audio()?;
        Ok(parser)
    }

    pub fn format(&self) -> AudioFormat {
        self.stream_info().format
    }

    pub fn stream_info(&self) -> &StreamInfo {
        match self {
            FormatParser::Mp3(p) => p.stream_info(),
            FormatParser::Wav(p) => p.stream_info(),
            FormatParser::Flac(p) => p.stream_info(),
            FormatParser::Ogg(p) => p.stream_info(),
            FormatParser::Mp4(p) => p.stream_info(),
        }
    }

    /// Material the decoder adapter needs; cheap to clone except for MP4's
    /// shared sample-size table.
    pub fn decoder_spec(&self) -> DecoderSpec {
        match self {
            FormatParser::Mp3(_) => DecoderSpec::Mp3,
            FormatParser::Wav(p) => p.decoder_spec(),
            FormatParser::Flac(p) => p.decoder_spec(),
            FormatParser::Ogg(p) => p.decoder_spec(),
            FormatParser::Mp4(p) => p.decoder_spec(),
        }
    }

    /// Align a raw chunk to codec-safe boundaries.
    ///
    /// Bytes that do not yet end on a boundary are withheld in a carry-over
    /// buffer bounded by the codec's maximum frame size and prepended to the
    /// next chunk. On the last chunk everything left is emitted.
    pub fn align(&mut self, chunk: ByteChunk) -> Result<AlignedChunk> {
        match self {
            FormatParser::Mp3(p) => p.align(chunk),
            FormatParser::Wav(p) => p.align(chunk),
            FormatParser::Flac(p) => p.align(chunk),
            FormatParser::Ogg(p) => p.align(chunk),
            FormatParser::Mp4(p) => p.align(chunk),
        }
    }

    /// Translate a stream time to a resume byte offset.
    pub fn time_to_byte(&self, time: Duration) -> Result<SeekResult> {
        match self {
            FormatParser::Mp3(p) => p.time_to_byte(time),
            FormatParser::Wav(p) => p.time_to_byte(time),
            FormatParser::Flac(p) => p.time_to_byte(time),
            FormatParser::Ogg(p) => p.time_to_byte(time),
            FormatParser::Mp4(p) => p.time_to_byte(time),
        }
    }

    /// Recommended chunk sizing for this format and file size.
    pub fn optimal_chunk_size(&self, file_size: u64) -> ChunkSizing {
        match self {
            FormatParser::Mp3(p) => p.optimal_chunk_size(file_size),
            FormatParser::Wav(p) => p.optimal_chunk_size(file_size),
            FormatParser::Flac(p) => p.optimal_chunk_size(file_size),
            FormatParser::Ogg(p) => p.optimal_chunk_size(file_size),
            FormatParser::Mp4(p) => p.optimal_chunk_size(file_size),
        }
    }

    /// Bytes currently withheld for alignment. Counted against the memory
    /// budget alongside the in-flight chunk.
    pub fn carry_over_len(&self) -> usize {
        match self {
            FormatParser::Mp3(p) => p.carry_over_len(),
            FormatParser::Wav(p) => p.carry_over_len(),
            FormatParser::Flac(p) => p.carry_over_len(),
            FormatParser::Ogg(p) => p.carry_over_len(),
            FormatParser::Mp4(p) => p.carry_over_len(),
        }
    }

    /// Reset alignment state after an out-of-band seek; the next chunk is
    /// treated as starting fresh at a codec-safe boundary.
    pub fn reset_alignment(&mut self) {
        match self {
            FormatParser::Mp3(p) => p.reset_alignment(),
            FormatParser::Wav(p) => p.reset_alignment(),
            FormatParser::Flac(p) => p.reset_alignment(),
            FormatParser::Ogg(p) => p.reset_alignment(),
            FormatParser::Mp4(p) => p.reset_alignment(),
        }
    }
}

/// Default sizing shared by the parsers: 10 MB chunks for large files, a
/// quarter of the file (at least 1 MB) for small ones.
pub(crate) fn default_chunk_sizing(file_size: u64, codec_min: usize) -> ChunkSizing {
    const LARGE_FILE: u64 = 100 * 1024 * 1024;
    const LARGE_CHUNK: usize = 10 * 1024 * 1024;
    const SMALL_FLOOR: usize = 1024 * 1024;
    const MAX_CHUNK: usize = 64 * 1024 * 1024;

    let recommended = if file_size >= LARGE_FILE {
        LARGE_CHUNK
    } else {
        ((file_size / 4) as usize).clamp(SMALL_FLOOR, LARGE_CHUNK)
    };

    ChunkSizing {
        recommended: recommended.max(codec_min),
        min: codec_min,
        max: MAX_CHUNK,
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_magic_bytes_only() {
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&36u32.to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        assert_eq!(AudioFormat::detect(&wav), Some(AudioFormat::Wav));

        assert_eq!(AudioFormat::detect(b"fLaC\x00\x00\x00\x22"), Some(AudioFormat::Flac));
        assert_eq!(AudioFormat::detect(b"ID3\x04\x00\x00\x00\x00\x00\x00"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::detect(&[0xFF, 0xFB, 0x90, 0x00]), Some(AudioFormat::Mp3));

        let mut mp4 = vec![0, 0, 0, 24];
        mp4.extend_from_slice(b"ftypM4A ");
        mp4.extend_from_slice(&[0u8; 8]);
        assert_eq!(AudioFormat::detect(&mp4), Some(AudioFormat::Mp4));

        assert_eq!(AudioFormat::detect(b"not audio"), None);
    }

    #[test]
    fn ogg_detection_needs_the_codec_id() {
        let mut opus = b"OggS".to_vec();
        opus.extend_from_slice(&[0u8; 24]);
        opus.extend_from_slice(b"OpusHead");
        assert_eq!(AudioFormat::detect(&opus), Some(AudioFormat::OggOpus));

        let mut vorbis = b"OggS".to_vec();
        vorbis.extend_from_slice(&[0u8; 24]);
        vorbis.extend_from_slice(b"\x01vorbis");
        assert_eq!(AudioFormat::detect(&vorbis), Some(AudioFormat::OggVorbis));

        // A bare page with no identification packet is not enough.
        assert_eq!(AudioFormat::detect(b"OggS\x00\x02"), None);
    }

    #[test]
    fn sizing_defaults_follow_file_size() {
        let large = default_chunk_sizing(500 * 1024 * 1024, 4096);
        assert_eq!(large.recommended, 10 * 1024 * 1024);

        let small = default_chunk_sizing(2 * 1024 * 1024, 4096);
        assert_eq!(small.recommended, 1024 * 1024);

        let mid = default_chunk_sizing(80 * 1024 * 1024, 4096);
        assert_eq!(mid.recommended, 10 * 1024 * 1024);
    }
}
