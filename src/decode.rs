//! Streaming decoder adapters.
//!
//! One adapter per codec family, all behind `StreamDecoder`:
//! - WAV PCM is converted by hand (it is a byte-layout transform, not a
//!   codec),
//! - MP3, FLAC, Vorbis, and AAC decode through Symphonia's codec registry,
//!   fed packets that this module carves out of the aligned chunks,
//! - Opus decodes through audiopus (feature `opus`).
//!
//! The adapter owns all decoder state. Dropping it releases the codec
//! resources on every exit path; nothing here is shared across workers.
//!
//! Priming is applied centrally: the declared encoder delay is skipped
//! before any sample reaches a `PcmChunk`, counted across chunk boundaries,
//! so `start_frame == 0` is the first musical frame.

use std::sync::Arc;

use symphonia::core::audio::{AudioBufferRef, Channels, SampleBuffer};
use symphonia::core::codecs::{
    CODEC_TYPE_AAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_VORBIS, CodecParameters,
    DecoderOptions,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use tracing::{debug, trace};

use crate::chunk::{AlignedChunk, PcmChunk};
use crate::error::{Error, Result};
use crate::format::wav::WavSampleFormat;
use crate::format::{DecoderSpec, StreamInfo, flac, mp3, ogg};

/// Streaming decoder for one audio stream.
///
/// Feed aligned chunks in stream order; each call returns zero or one
/// `PcmChunk` of normalized interleaved samples.
pub struct StreamDecoder {
    backend: Backend,
    sample_rate: u32,
    channel_count: u16,
    /// Priming frames still to drop before emitting samples.
    pending_skip: u64,
    declared_delay: u64,
    /// Post-priming frames emitted so far; the next chunk's `start_frame`.
    frames_emitted: u64,
    /// Running packet counter, used as the frame index in decode errors.
    packet_index: u64,
}

enum Backend {
    Wav {
        sample_format: WavSampleFormat,
    },
    Symphonia {
        decoder: Box<dyn symphonia::core::codecs::Decoder>,
        sample_buf: Option<SampleBuffer<f32>>,
        packetizer: Packetizer,
    },
    #[cfg(feature = "opus")]
    Opus {
        decoder: audiopus::coder::Decoder,
        packetizer: Packetizer,
        /// Scratch sized for the largest Opus frame (120 ms at 48 kHz).
        scratch: Vec<f32>,
    },
}

/// Splits aligned chunk bytes into codec packets.
enum Packetizer {
    /// MPEG frames, self-delimiting via their headers.
    Mp3Frames,
    /// FLAC frames, delimited by validated frame starts.
    FlacFrames,
    /// OGG pages of one logical stream, reassembled along the lacing.
    OggPackets { serial: u32, partial: Vec<u8> },
    /// MP4 samples, delimited by the stbl size table.
    Mp4Samples { sizes: Arc<[u32]>, cursor: u64 },
}

impl Packetizer {
    /// Carve `data` into packets. Borrowed ranges where the bytes are already
    /// contiguous, owned buffers where reassembly is required (OGG lacing).
    fn split(&mut self, data: &[u8]) -> Result<Vec<PacketBytes>> {
        let mut out = Vec::new();
        match self {
            Packetizer::Mp3Frames => {
                let mut pos = 0usize;
                while pos + 4 <= data.len() {
                    match mp3::parse_frame_header(&data[pos..]) {
                        Some(header) if pos + header.frame_len <= data.len() => {
                            out.push(PacketBytes::Range(pos..pos + header.frame_len));
                            pos += header.frame_len;
                        }
                        _ => pos += 1,
                    }
                }
            }
            Packetizer::FlacFrames => {
                let mut starts = Vec::new();
                let mut search = 0usize;
                while let Some((pos, _)) = flac::first_frame_start(data, search) {
                    starts.push(pos);
                    search = pos + 1;
                }
                for (i, &start) in starts.iter().enumerate() {
                    let end = starts.get(i + 1).copied().unwrap_or(data.len());
                    out.push(PacketBytes::Range(start..end));
                }
            }
            Packetizer::OggPackets { serial, partial } => {
                let mut pos = 0usize;
                let mut owned = Vec::new();
                while pos < data.len() {
                    match ogg::parse_page(&data[pos..]) {
                        Some(page) => {
                            let page_bytes = &data[pos..pos + page.total_len()];
                            if page.serial == *serial {
                                ogg::extract_packets(&page, page_bytes, partial, &mut owned);
                            }
                            pos += page.total_len();
                        }
                        None => pos += 1, // junk between pages; resync
                    }
                }
                out.extend(owned.into_iter().map(PacketBytes::Owned));
            }
            Packetizer::Mp4Samples { sizes, cursor } => {
                let mut pos = 0usize;
                while pos < data.len() {
                    let Some(&size) = sizes.get(*cursor as usize) else {
                        break;
                    };
                    let size = size as usize;
                    if pos + size > data.len() {
                        return Err(Error::CorruptedHeader(format!(
                            "aligned mp4 chunk ends inside sample {cursor}"
                        )));
                    }
                    out.push(PacketBytes::Range(pos..pos + size));
                    pos += size;
                    *cursor += 1;
                }
            }
        }
        Ok(out)
    }

    fn reset(&mut self) {
        if let Packetizer::OggPackets { partial, .. } = self {
            partial.clear();
        }
    }
}

#[derive(Debug)]
enum PacketBytes {
    Range(std::ops::Range<usize>),
    Owned(Vec<u8>),
}

impl PacketBytes {
    fn slice<'a>(&'a self, data: &'a [u8]) -> &'a [u8] {
        match self {
            PacketBytes::Range(range) => &data[range.clone()],
            PacketBytes::Owned(bytes) => bytes,
        }
    }
}

impl StreamDecoder {
    /// Build the adapter for one stream.
    ///
    /// Fails with `UnsupportedCodec` when the registry has no decoder for
    /// the stream (or the `opus` feature is disabled for an Opus stream).
    pub fn new(info: &StreamInfo, spec: DecoderSpec) -> Result<Self> {
        let channel_mask = channel_mask(info.channel_count);

        let backend = match spec {
            DecoderSpec::Wav { sample_format, .. } => Backend::Wav { sample_format },
            DecoderSpec::Mp3 => {
                let mut params = CodecParameters::new();
                params
                    .for_codec(CODEC_TYPE_MP3)
                    .with_sample_rate(info.sample_rate)
                    .with_channels(channel_mask);
                Backend::Symphonia {
                    decoder: make_decoder(&params)?,
                    sample_buf: None,
                    packetizer: Packetizer::Mp3Frames,
                }
            }
            DecoderSpec::Flac { max_block_size } => {
                let mut params = CodecParameters::new();
                params
                    .for_codec(CODEC_TYPE_FLAC)
                    .with_sample_rate(info.sample_rate)
                    .with_channels(channel_mask)
                    .with_bits_per_sample(info.bits_per_sample.unwrap_or(16))
                    .with_max_frames_per_packet(u64::from(max_block_size))
                    .with_packet_data_integrity(true);
                Backend::Symphonia {
                    decoder: make_decoder(&params)?,
                    sample_buf: None,
                    packetizer: Packetizer::FlacFrames,
                }
            }
            DecoderSpec::OggVorbis {
                serial,
                ident_packet,
                setup_packet,
            } => {
                // The Vorbis decoder wants the identification and setup
                // headers back to back as its extra data.
                let mut extra = Vec::with_capacity(ident_packet.len() + setup_packet.len());
                extra.extend_from_slice(&ident_packet);
                extra.extend_from_slice(&setup_packet);

                let mut params = CodecParameters::new();
                params
                    .for_codec(CODEC_TYPE_VORBIS)
                    .with_sample_rate(info.sample_rate)
                    .with_channels(channel_mask)
                    .with_extra_data(extra.into_boxed_slice());
                Backend::Symphonia {
                    decoder: make_decoder(&params)?,
                    sample_buf: None,
                    packetizer: Packetizer::OggPackets {
                        serial,
                        partial: Vec::new(),
                    },
                }
            }
            DecoderSpec::OggOpus { serial, pre_skip: _ } => {
                #[cfg(feature = "opus")]
                {
                    let channels = match info.channel_count {
                        1 => audiopus::Channels::Mono,
                        2 => audiopus::Channels::Stereo,
                        n => {
                            return Err(Error::UnsupportedCodec(format!(
                                "{n}-channel opus (mapping family > 0)"
                            )));
                        }
                    };
                    let decoder =
                        audiopus::coder::Decoder::new(audiopus::SampleRate::Hz48000, channels)
                            .map_err(|err| Error::UnsupportedCodec(format!("opus init: {err}")))?;
                    // 120 ms at 48 kHz per channel is the codec maximum.
                    let scratch = vec![0.0f32; 5760 * info.channel_count as usize];
                    Backend::Opus {
                        decoder,
                        packetizer: Packetizer::OggPackets {
                            serial,
                            partial: Vec::new(),
                        },
                        scratch,
                    }
                }
                #[cfg(not(feature = "opus"))]
                {
                    let _ = serial;
                    return Err(Error::UnsupportedCodec(
                        "opus (built without the `opus` feature)".into(),
                    ));
                }
            }
            DecoderSpec::Mp4 {
                audio_specific_config,
                sample_sizes,
            } => {
                let mut params = CodecParameters::new();
                params
                    .for_codec(CODEC_TYPE_AAC)
                    .with_sample_rate(info.sample_rate)
                    .with_channels(channel_mask)
                    .with_extra_data(audio_specific_config.into_boxed_slice());
                Backend::Symphonia {
                    decoder: make_decoder(&params)?,
                    sample_buf: None,
                    packetizer: Packetizer::Mp4Samples {
                        sizes: sample_sizes,
                        cursor: 0,
                    },
                }
            }
        };

        debug!(
            format = info.format.name(),
            delay = info.encoder_delay_frames,
            "decoder ready"
        );

        Ok(Self {
            backend,
            sample_rate: info.sample_rate,
            channel_count: info.channel_count,
            pending_skip: u64::from(info.encoder_delay_frames),
            declared_delay: u64::from(info.encoder_delay_frames),
            frames_emitted: 0,
            packet_index: 0,
        })
    }

    /// Decode one aligned chunk into at most one `PcmChunk`.
    ///
    /// Per-packet decode errors are skipped (corrupt frames are routine in
    /// the wild); the call fails with `DecodeFailed` only when a non-empty
    /// chunk produced nothing at all, which is the pipeline's cue to apply
    /// its chunk-level recovery.
    pub fn feed(&mut self, chunk: &AlignedChunk) -> Result<Vec<PcmChunk>> {
        if let (Some(first), Backend::Symphonia { packetizer, .. }) =
            (chunk.first_packet, &mut self.backend)
        {
            // Table-indexed formats tell us which packet the chunk starts
            // at; honor it so skips and seeks cannot desynchronize us.
            if let Packetizer::Mp4Samples { cursor, .. } = packetizer {
                *cursor = first;
            }
        }

        let mut samples: Vec<f32> = Vec::new();
        let mut decode_errors = 0u32;
        let mut first_error: Option<String> = None;

        match &mut self.backend {
            Backend::Wav { sample_format } => {
                convert_wav_samples(&chunk.data, *sample_format, &mut samples);
            }
            Backend::Symphonia {
                decoder,
                sample_buf,
                packetizer,
            } => {
                let packets = packetizer.split(&chunk.data)?;
                for packet_bytes in &packets {
                    let bytes = packet_bytes.slice(&chunk.data);
                    let packet = Packet::new_from_slice(0, self.packet_index, 0, bytes);
                    match decoder.decode(&packet) {
                        Ok(decoded) => copy_interleaved(decoded, sample_buf, &mut samples),
                        Err(SymphoniaError::DecodeError(detail)) => {
                            trace!(packet = self.packet_index, detail, "skipping bad packet");
                            decode_errors += 1;
                            first_error.get_or_insert_with(|| detail.to_string());
                        }
                        Err(SymphoniaError::IoError(err)) => {
                            decode_errors += 1;
                            first_error.get_or_insert_with(|| err.to_string());
                        }
                        Err(SymphoniaError::ResetRequired) => {
                            decoder.reset();
                            decode_errors += 1;
                            first_error.get_or_insert_with(|| "decoder reset required".into());
                        }
                        Err(err) => {
                            return Err(Error::DecodeFailed {
                                frame_index: self.packet_index,
                                detail: err.to_string(),
                            });
                        }
                    }
                    self.packet_index += 1;
                }
            }
            #[cfg(feature = "opus")]
            Backend::Opus {
                decoder,
                packetizer,
                scratch,
            } => {
                let packets = packetizer.split(&chunk.data)?;
                for packet_bytes in &packets {
                    let bytes = packet_bytes.slice(&chunk.data);
                    match decoder.decode_float(Some(bytes), scratch, false) {
                        Ok(frames) => {
                            samples.extend_from_slice(
                                &scratch[..frames * self.channel_count as usize],
                            );
                        }
                        Err(err) => {
                            trace!(packet = self.packet_index, %err, "skipping bad opus packet");
                            decode_errors += 1;
                            first_error.get_or_insert_with(|| err.to_string());
                        }
                    }
                    self.packet_index += 1;
                }
            }
        }

        if samples.is_empty() && decode_errors > 0 {
            return Err(Error::DecodeFailed {
                frame_index: self.packet_index.saturating_sub(u64::from(decode_errors)),
                detail: first_error.unwrap_or_else(|| "no packet in chunk decoded".into()),
            });
        }
        if decode_errors > 0 {
            debug!(decode_errors, "chunk decoded partially");
        }

        self.apply_priming_skip(&mut samples);
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let start_frame = self.frames_emitted;
        self.frames_emitted += samples.len() as u64 / u64::from(self.channel_count);

        Ok(vec![PcmChunk {
            samples,
            start_frame,
            sample_rate: self.sample_rate,
            channel_count: self.channel_count,
            is_last: chunk.is_last,
        }])
    }

    /// Drain anything buffered at end-of-stream.
    ///
    /// The adapters decode packet-at-a-time, so there is nothing to drain;
    /// the hook exists so the pipeline's shutdown sequence is uniform.
    pub fn flush(&mut self) -> Result<Vec<PcmChunk>> {
        Ok(Vec::new())
    }

    /// Resume decoding at a resolved seek target.
    ///
    /// The caller translates the time through the format parser
    /// (`ChunkReader::seek_to_time`); this drops the codec state and
    /// re-anchors the frame counter so subsequent `PcmChunk`s carry
    /// positions relative to the seek target.
    pub fn seek(&mut self, seek: &crate::chunk::SeekResult) -> Result<()> {
        self.reset();
        self.frames_emitted =
            (seek.actual_time.as_secs_f64() * f64::from(self.sample_rate)) as u64;
        Ok(())
    }

    /// Reset codec state after a seek or a skipped chunk.
    ///
    /// The priming skip is *not* re-armed: priming samples exist only at the
    /// stream head.
    pub fn reset(&mut self) {
        match &mut self.backend {
            Backend::Wav { .. } => {}
            Backend::Symphonia {
                decoder,
                packetizer,
                ..
            } => {
                decoder.reset();
                packetizer.reset();
            }
            #[cfg(feature = "opus")]
            Backend::Opus { packetizer, .. } => {
                packetizer.reset();
            }
        }
    }

    /// Post-priming frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// The priming skip declared by the stream headers.
    pub fn declared_delay(&self) -> u64 {
        self.declared_delay
    }

    fn apply_priming_skip(&mut self, samples: &mut Vec<f32>) {
        if self.pending_skip == 0 {
            return;
        }
        let channels = u64::from(self.channel_count.max(1));
        let frames = samples.len() as u64 / channels;
        let drop = frames.min(self.pending_skip);
        samples.drain(..(drop * channels) as usize);
        self.pending_skip -= drop;
        if drop > 0 {
            trace!(
                dropped = drop,
                remaining = self.pending_skip,
                "skipped priming frames"
            );
        }
    }
}

fn make_decoder(params: &CodecParameters) -> Result<Box<dyn symphonia::core::codecs::Decoder>> {
    symphonia::default::get_codecs()
        .make(params, &DecoderOptions::default())
        .map_err(|err| Error::UnsupportedCodec(err.to_string()))
}

/// Map a plain channel count onto a Symphonia channel mask.
fn channel_mask(count: u16) -> Channels {
    match count {
        1 => Channels::FRONT_LEFT,
        2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
        n => Channels::from_bits_truncate((1u32 << n.min(31)) - 1),
    }
}

/// Copy a decoded buffer into `out` as interleaved f32.
fn copy_interleaved(
    decoded: AudioBufferRef<'_>,
    sample_buf: &mut Option<SampleBuffer<f32>>,
    out: &mut Vec<f32>,
) {
    if sample_buf.is_none() {
        let spec = *decoded.spec();
        let duration = decoded.capacity() as u64;
        *sample_buf = Some(SampleBuffer::<f32>::new(duration, spec));
    }
    let buf = sample_buf.as_mut().expect("sample buffer initialized");
    buf.copy_interleaved_ref(decoded);
    out.extend_from_slice(buf.samples());
}

/// Convert raw WAV sample bytes into normalized f32.
fn convert_wav_samples(data: &[u8], format: WavSampleFormat, out: &mut Vec<f32>) {
    match format {
        WavSampleFormat::U8 => {
            out.extend(data.iter().map(|&b| (b as f32 - 128.0) / 128.0));
        }
        WavSampleFormat::SignedPcm { bits: 16 } => {
            out.extend(
                data.chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
            );
        }
        WavSampleFormat::SignedPcm { bits: 24 } => {
            out.extend(data.chunks_exact(3).map(|b| {
                let raw = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                raw as f32 / 8_388_608.0
            }));
        }
        WavSampleFormat::SignedPcm { .. } => {
            out.extend(
                data.chunks_exact(4)
                    .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0),
            );
        }
        WavSampleFormat::Float { bits: 32 } => {
            out.extend(
                data.chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]).clamp(-1.0, 1.0)),
            );
        }
        WavSampleFormat::Float { .. } => {
            out.extend(data.chunks_exact(8).map(|b| {
                let v = f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                (v as f32).clamp(-1.0, 1.0)
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;

    fn wav_info(sample_rate: u32, channels: u16, delay: u32) -> StreamInfo {
        StreamInfo {
            format: AudioFormat::Wav,
            sample_rate,
            channel_count: channels,
            bits_per_sample: Some(16),
            total_frames: None,
            encoder_delay_frames: delay,
            audio_start: 44,
            audio_end: u64::MAX,
        }
    }

    fn wav_decoder(sample_rate: u32, channels: u16, delay: u32) -> StreamDecoder {
        StreamDecoder::new(
            &wav_info(sample_rate, channels, delay),
            DecoderSpec::Wav {
                sample_format: WavSampleFormat::SignedPcm { bits: 16 },
                block_align: 2 * channels,
            },
        )
        .expect("wav adapter")
    }

    fn aligned(data: Vec<u8>, is_last: bool) -> AlignedChunk {
        AlignedChunk {
            data,
            start_offset: 44,
            is_last,
            seek_points: Vec::new(),
            first_packet: None,
        }
    }

    fn pcm16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn wav_samples_normalize_to_unit_range() {
        let mut decoder = wav_decoder(8000, 1, 0);
        let chunks = decoder
            .feed(&aligned(pcm16(&[0, 16384, -16384, 32767, i16::MIN]), true))
            .expect("decode");

        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.start_frame, 0);
        assert_eq!(chunk.channel_count, 1);
        assert!(chunk.is_last);
        let s = &chunk.samples;
        assert_eq!(s.len(), 5);
        assert!((s[0] - 0.0).abs() < 1e-6);
        assert!((s[1] - 0.5).abs() < 1e-6);
        assert!((s[2] + 0.5).abs() < 1e-6);
        assert!(s[3] <= 1.0 && s[3] > 0.999);
        assert!((s[4] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn start_frame_counts_across_feeds() {
        let mut decoder = wav_decoder(8000, 2, 0);

        let first = decoder
            .feed(&aligned(pcm16(&[1, 1, 2, 2, 3, 3]), false))
            .expect("decode");
        assert_eq!(first[0].start_frame, 0);
        assert_eq!(first[0].frames(), 3);

        let second = decoder.feed(&aligned(pcm16(&[4, 4]), true)).expect("decode");
        assert_eq!(second[0].start_frame, 3);
        assert_eq!(decoder.frames_emitted(), 4);
    }

    #[test]
    fn priming_skip_spans_chunks() {
        // Declared delay of 5 frames; feed 3, then 4. The first chunk is
        // swallowed whole, the second loses its leading 2 frames.
        let mut decoder = wav_decoder(8000, 1, 5);

        let first = decoder
            .feed(&aligned(pcm16(&[10, 11, 12]), false))
            .expect("decode");
        assert!(first.is_empty());

        let second = decoder
            .feed(&aligned(pcm16(&[13, 14, 15, 16]), true))
            .expect("decode");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].start_frame, 0);
        let samples = &second[0].samples;
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 15.0 / 32768.0).abs() < 1e-6);
        assert!((samples[1] - 16.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn u8_and_f32_wav_conversions() {
        let mut out = Vec::new();
        convert_wav_samples(&[0, 128, 255], WavSampleFormat::U8, &mut out);
        assert!((out[0] + 1.0).abs() < 1e-6);
        assert!((out[1] - 0.0).abs() < 1e-6);
        assert!(out[2] < 1.0 && out[2] > 0.99);

        let mut out = Vec::new();
        let bytes: Vec<u8> = [0.25f32, -2.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        convert_wav_samples(&bytes, WavSampleFormat::Float { bits: 32 }, &mut out);
        assert!((out[0] - 0.25).abs() < 1e-6);
        assert_eq!(out[1], -1.0); // out-of-range floats clamp
    }

    #[test]
    fn i24_conversion_sign_extends() {
        let mut out = Vec::new();
        // 0x800000 is -8388608 (full-scale negative), 0x7FFFFF full-scale
        // positive.
        let bytes = vec![0x00, 0x00, 0x80, 0xFF, 0xFF, 0x7F];
        convert_wav_samples(&bytes, WavSampleFormat::SignedPcm { bits: 24 }, &mut out);
        assert!((out[0] + 1.0).abs() < 1e-6);
        assert!(out[1] > 0.9999 && out[1] <= 1.0);
    }

    #[test]
    fn mp3_packetizer_splits_on_frames() {
        let data = crate::format::mp3::tests::frames(3);
        let mut packetizer = Packetizer::Mp3Frames;
        let packets = packetizer.split(&data).expect("split");
        assert_eq!(packets.len(), 3);
        for packet in &packets {
            assert_eq!(
                packet.slice(&data).len(),
                crate::format::mp3::tests::FRAME_LEN
            );
        }
    }

    #[test]
    fn mp4_packetizer_follows_size_table_and_hint() {
        let sizes: Arc<[u32]> = vec![3u32, 2, 4].into();
        let mut packetizer = Packetizer::Mp4Samples {
            sizes: Arc::clone(&sizes),
            cursor: 1,
        };

        // Bytes for samples 1 and 2 only.
        let data = vec![0u8; 6];
        let packets = packetizer.split(&data).expect("split");
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].slice(&data).len(), 2);
        assert_eq!(packets[1].slice(&data).len(), 4);
    }

    #[test]
    fn mp4_packetizer_rejects_torn_samples() {
        let sizes: Arc<[u32]> = vec![4u32].into();
        let mut packetizer = Packetizer::Mp4Samples { sizes, cursor: 0 };
        let err = packetizer.split(&[0u8; 3]).unwrap_err();
        assert!(matches!(err, Error::CorruptedHeader(_)));
    }

    #[test]
    fn empty_chunk_produces_no_output() {
        let mut decoder = wav_decoder(8000, 1, 0);
        let chunks = decoder.feed(&aligned(Vec::new(), false)).expect("decode");
        assert!(chunks.is_empty());
        assert!(decoder.flush().expect("flush").is_empty());
    }
}
