//! Chunked file reader.
//!
//! The reader is the only component that touches the filesystem. It yields
//! the file as a lazy sequence of bounded `ByteChunk`s:
//! - at most one chunk's worth of bytes lives in memory per reader,
//! - the chunk size can be re-tuned between reads (adaptive sizing),
//! - seeking invalidates buffered state; the next read starts at the target.
//!
//! No retry policy lives here. The pipeline decides what a failed read means.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::chunk::{ByteChunk, SeekResult};
use crate::error::{Error, Result};
use crate::format::FormatParser;

/// Minimum chunk size the reader will accept; smaller requests are bumped.
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Streaming reader over one input file.
#[derive(Debug)]
pub struct ChunkReader {
    file: File,
    path: PathBuf,
    size: u64,
    pos: u64,
    chunk_size: usize,
    /// Set when open/seek made the next chunk discontiguous with its
    /// predecessor.
    next_is_seek_point: bool,
}

impl ChunkReader {
    /// Open `path` for chunked reading.
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| Error::from_open(err, path))?;
        let size = file
            .metadata()
            .map_err(|err| Error::from_open(err, path))?
            .len();

        debug!(path = %path.display(), size, chunk_size, "opened input");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            pos: 0,
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
            next_is_seek_point: true,
        })
    }

    /// Read the next chunk, or `None` at end-of-file.
    ///
    /// Returns at most `chunk_size` bytes in file order. The final chunk has
    /// `is_last` set and may be short.
    pub fn read_next(&mut self) -> Result<Option<ByteChunk>> {
        if self.pos >= self.size {
            return Ok(None);
        }

        let remaining = (self.size - self.pos) as usize;
        let want = remaining.min(self.chunk_size);
        let mut data = vec![0u8; want];

        let mut filled = 0;
        while filled < want {
            match self.file.read(&mut data[filled..]) {
                Ok(0) => {
                    // The file shrank under us; surface it rather than
                    // silently emitting a short stream.
                    return Err(Error::Truncated {
                        offset: self.pos + filled as u64,
                        detail: format!(
                            "expected {} more bytes of {}",
                            want - filled,
                            self.path.display()
                        ),
                    });
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }

        let start_offset = self.pos;
        self.pos += want as u64;

        let chunk = ByteChunk {
            data,
            start_offset,
            is_last: self.pos >= self.size,
            is_seek_point: std::mem::take(&mut self.next_is_seek_point),
        };
        Ok(Some(chunk))
    }

    /// Jump to a stream time.
    ///
    /// The format parser translates the time to a codec-safe byte offset;
    /// the result says whether decoding will resume exactly at `time` or at
    /// an earlier boundary. On `SeekUnsupported` the caller falls back to
    /// sequential scanning from offset zero.
    pub fn seek_to_time(
        &mut self,
        parser: &mut FormatParser,
        time: Duration,
    ) -> Result<SeekResult> {
        let seek = parser.time_to_byte(time)?;
        self.seek_to_byte(seek.byte_offset)?;
        parser.reset_alignment();
        Ok(seek)
    }

    /// Jump to an absolute byte offset. The next `read_next` starts there.
    pub fn seek_to_byte(&mut self, offset: u64) -> Result<()> {
        let offset = offset.min(self.size);
        self.file.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        self.next_is_seek_point = true;
        Ok(())
    }

    /// Read exactly `len` bytes at `offset` without disturbing the streaming
    /// position. Used by format parsers while walking headers.
    pub(crate) fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.size {
            return Err(Error::Truncated {
                offset: self.size,
                detail: format!("header read of {len} bytes at {offset} runs past end of file"),
            });
        }

        let resume = self.pos;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Truncated {
                    offset,
                    detail: "short read while parsing headers".into(),
                }
            } else {
                Error::Io(err)
            }
        })?;
        self.file.seek(SeekFrom::Start(resume))?;
        Ok(buf)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    /// Current streaming offset (start of the next chunk).
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Re-tune the chunk size for subsequent reads.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(MIN_CHUNK_SIZE);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(bytes).expect("write fixture");
        file
    }

    #[test]
    fn reads_file_in_order_with_correct_offsets() -> Result<()> {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let file = write_temp(&payload);

        let mut reader = ChunkReader::open(file.path(), MIN_CHUNK_SIZE)?;
        assert_eq!(reader.size_bytes(), 10_000);

        let mut seen = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = reader.read_next()? {
            assert_eq!(chunk.start_offset, seen.len() as u64);
            assert_eq!(chunk.end_offset(), (seen.len() + chunk.len()) as u64);
            assert_eq!(chunk.is_seek_point, chunks == 0);
            seen.extend_from_slice(&chunk.data);
            chunks += 1;
            if chunk.is_last {
                break;
            }
        }

        assert_eq!(seen, payload);
        assert_eq!(chunks, 3); // 4096 + 4096 + 1808
        assert!(reader.read_next()?.is_none());
        Ok(())
    }

    #[test]
    fn open_missing_file_reports_file_not_found() {
        let err = ChunkReader::open("/definitely/not/here.wav", MIN_CHUNK_SIZE).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn seek_marks_next_chunk_as_seek_point() -> Result<()> {
        let file = write_temp(&vec![7u8; 20_000]);
        let mut reader = ChunkReader::open(file.path(), MIN_CHUNK_SIZE)?;

        let first = reader.read_next()?.expect("first chunk");
        assert!(first.is_seek_point);

        let second = reader.read_next()?.expect("second chunk");
        assert!(!second.is_seek_point);

        reader.seek_to_byte(16_000)?;
        let jumped = reader.read_next()?.expect("post-seek chunk");
        assert!(jumped.is_seek_point);
        assert_eq!(jumped.start_offset, 16_000);
        assert!(jumped.is_last);
        Ok(())
    }

    #[test]
    fn read_exact_at_preserves_streaming_position() -> Result<()> {
        let payload: Vec<u8> = (0..200u8).collect();
        let file = write_temp(&payload);
        let mut reader = ChunkReader::open(file.path(), MIN_CHUNK_SIZE)?;

        let header = reader.read_exact_at(100, 10)?;
        assert_eq!(header, &payload[100..110]);
        assert_eq!(reader.position(), 0);

        let chunk = reader.read_next()?.expect("chunk");
        assert_eq!(chunk.data, payload);
        Ok(())
    }

    #[test]
    fn read_exact_at_past_eof_is_truncated() -> Result<()> {
        let file = write_temp(&[0u8; 10]);
        let mut reader = ChunkReader::open(file.path(), MIN_CHUNK_SIZE)?;
        let err = reader.read_exact_at(5, 10).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
        Ok(())
    }
}
