use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Waveline's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Waveline's crate-wide error type.
///
/// Every failure a job can surface lives in this one enum so cross-language
/// adapters get a small, stable taxonomy. Internally the crate uses `anyhow`
/// for context-rich plumbing; the bridge below flattens those chains into
/// `Other` at the public boundary so downstream libraries aren't forced to
/// adopt `anyhow` in their own APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The input path does not exist.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// The input path exists but is not readable by this process.
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// The file ended before a structure the format requires was complete.
    #[error("file truncated at byte {offset}: {detail}")]
    Truncated { offset: u64, detail: String },

    /// Any other I/O failure while reading the input.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The file's leading bytes match no supported container signature.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The container signature matched but its header did not parse.
    #[error("corrupted header: {0}")]
    CorruptedHeader(String),

    /// The container parsed but holds no decodable audio stream.
    #[error("no audio stream in container")]
    NoAudioStream,

    /// The audio stream uses a codec this build cannot decode.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A mid-stream decode failure. Recoverable: the pipeline may skip the
    /// offending chunk and continue (see the consecutive-failure budget on
    /// `JobDescriptor`).
    #[error("decode failed at frame {frame_index}: {detail}")]
    DecodeFailed { frame_index: u64, detail: String },

    /// The stream cannot be seeked at all (e.g. headerless VBR MP3 with no
    /// usable index). Callers fall back to sequential scanning from zero.
    #[error("seeking is not supported by this stream")]
    SeekUnsupported,

    /// The memory watchdog refused an allocation against the global budget.
    #[error("memory budget exceeded: {needed} bytes needed, {available} available")]
    MemoryExceeded { needed: usize, available: usize },

    /// A single chunk exceeded what the decoder can hold; the pipeline
    /// responds by halving the chunk size and retrying.
    #[error("chunk of {size} bytes exceeds the codec limit of {max}")]
    ChunkTooLarge { size: usize, max: usize },

    /// The job was cancelled cooperatively.
    #[error("job cancelled")]
    Cancelled,

    /// The job's wall-clock deadline expired before completion.
    #[error("job deadline expired")]
    Deadline,

    /// The job aborted mid-stream after producing some amplitude points.
    #[error("aborted after {completed_points} amplitude points: {first_error}")]
    PartialFailure {
        completed_points: usize,
        first_error: Box<Error>,
    },

    /// Context-bearing internal failures flattened from `anyhow`.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify an error from opening `path`, preserving the taxonomy the
    /// reader promises (`FileNotFound` / `PermissionDenied` / `Io`).
    pub(crate) fn from_open(err: io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.to_path_buf()),
            _ => Error::Io(err),
        }
    }

    /// Whether the pipeline's skip-and-continue recovery applies.
    pub(crate) fn is_recoverable_decode(&self) -> bool {
        matches!(self, Error::DecodeFailed { .. })
    }

    /// Whether chunk-halving retry applies.
    pub(crate) fn wants_smaller_chunks(&self) -> bool {
        matches!(
            self,
            Error::MemoryExceeded { .. } | Error::ChunkTooLarge { .. }
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_errors_map_to_taxonomy() {
        let path = std::path::Path::new("/no/such/file.mp3");

        let not_found = Error::from_open(io::Error::from(io::ErrorKind::NotFound), path);
        assert!(matches!(not_found, Error::FileNotFound(_)));

        let denied = Error::from_open(io::Error::from(io::ErrorKind::PermissionDenied), path);
        assert!(matches!(denied, Error::PermissionDenied(_)));

        let other = Error::from_open(io::Error::from(io::ErrorKind::Interrupted), path);
        assert!(matches!(other, Error::Io(_)));
    }

    #[test]
    fn recovery_classification() {
        let decode = Error::DecodeFailed {
            frame_index: 7,
            detail: "bad huffman table".into(),
        };
        assert!(decode.is_recoverable_decode());
        assert!(!decode.wants_smaller_chunks());

        let too_large = Error::ChunkTooLarge {
            size: 1 << 24,
            max: 1 << 20,
        };
        assert!(too_large.wants_smaller_chunks());
    }

    #[test]
    fn anyhow_chains_are_flattened_with_context() {
        let err: Error = anyhow::Error::msg("root cause")
            .context("while aligning chunk")
            .into();
        let msg = err.to_string();
        assert!(msg.contains("while aligning chunk"));
        assert!(msg.contains("root cause"));
    }
}
