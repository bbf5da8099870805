//! Common errors used throughout `blamforge`.

use num_enum::TryFromPrimitiveError;
use std::io::Error as StdIoError;
use std::num::TryFromIntError;
use std::result::Result as StdResult;
use std::string::{FromUtf8Error, FromUtf16Error};
use thiserror::Error;

use crate::map::{CacheFileEngine, CacheFileType};
use crate::types::class::TagClass;

#[derive(Error, Debug)]
/// Errors that can occur when loading or compiling a tag.
pub enum TagError {
    /// The tag could not be resolved against any of the ordered tag roots.
    #[error("tag {path}.{extension} was not found in any tag root")]
    NotFound {
        /// Virtual path of the tag, `\`-separated, no extension.
        path: String,
        /// On-disk extension derived from the tag class.
        extension: &'static str,
    },
    /// The tag file does not end its header with the `blam` four-cc.
    #[error("incorrect tag file magic, expected 'blam', found {0:#010X}")]
    IncorrectMagic(u32),
    /// The tag file header carries a class other than the one requested.
    #[error("tag class mismatch, expected {expected:?}, found {found:#010X}")]
    IncorrectClass {
        expected: TagClass,
        found: u32,
    },
    /// A four-cc in a tag file or reference is not a known tag class.
    #[error("unknown tag class four-cc")]
    UnknownClass(#[from] TryFromPrimitiveError<TagClass>),
    /// The tag file body does not match the checksum recorded in its header.
    #[error("tag {path} failed its checksum, expected {expected:#010X}, found {found:#010X}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        found: u32,
    },
    /// Structural invariants were violated inside a tag (bad counts,
    /// out-of-range indices).
    #[error("invalid tag data in {tag}: {reason}")]
    InvalidData {
        tag: String,
        reason: String,
    },
    /// A reference resolved to a tag whose class is not in the expected
    /// class chain.
    #[error("{tag} references {path} as {expected:?}, but it is {found:?}")]
    BrokenReference {
        tag: String,
        path: String,
        expected: TagClass,
        found: TagClass,
    },
}

#[derive(Error, Debug)]
/// Errors that can occur when reading or writing a cache file image.
pub enum MapError {
    /// A head/foot literal failed validation.
    #[error("incorrect cache file literal {0:#010X}")]
    IncorrectLiteral(u32),
    /// The engine code in the header is not recognized.
    #[error("unknown cache file engine")]
    UnknownEngine(#[from] TryFromPrimitiveError<CacheFileEngine>),
    /// The cache file type field is not SP, MP, or UI.
    #[error("unknown cache file type")]
    UnknownType(#[from] TryFromPrimitiveError<CacheFileType>),
    /// The header failed a sanity bound (sizes, offsets).
    #[error("invalid map: {0}")]
    Invalid(String),
    /// A section exceeds the target engine's budget.
    #[error("{what} is {size:#X} bytes, exceeding the {limit:#X} byte limit")]
    SizeExceeded {
        what: &'static str,
        size: u64,
        limit: u64,
    },
}

#[derive(Error, Debug)]
/// Errors that can occur while resolving and pre-compiling the tag graph.
pub enum BuildError {
    /// The requested operation is not valid for the target engine.
    #[error("{what} is not supported on {engine:?}")]
    UnsupportedEngine {
        engine: CacheFileEngine,
        what: String,
    },
    /// An external-index hint names a tag that cannot be honoured against
    /// the loaded resource maps.
    #[error("index hint for {path} cannot be honoured: {reason}")]
    ResourceMismatch {
        path: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
/// Errors that can occur when compressing or decompressing a cache file.
pub enum CompressionError {
    /// The codec reported a failure while compressing.
    #[error("compression failed: {0}")]
    CompressionFailure(String),
    /// The codec reported a failure or the output did not match the
    /// recorded decompressed size.
    #[error("decompression failed: {0}")]
    DecompressionFailure(String),
    /// Round-trip size check failed.
    #[error("decompressed size mismatch, expected {expected}, found {found}")]
    SizeMismatch {
        expected: u64,
        found: u64,
    },
    /// The input image is not compressed.
    #[error("map is not compressed")]
    NotCompressed,
    /// The input image is already compressed.
    #[error("map is already compressed")]
    AlreadyCompressed,
}

#[derive(Error, Debug)]
/// Standard error type used throughout `blamforge`.
pub enum Error {
    /// IO error from [`std::io`] operations.
    #[error("failed to read or write a buffer")]
    ReadError(#[from] StdIoError),
    /// UTF-8 decoding error in a fixed or length-prefixed string.
    #[error("incorrect UTF-8 encoding found when reading string")]
    Utf8ReadingError(#[from] FromUtf8Error),
    /// UTF-16 decoding error in a string list payload.
    #[error("incorrect UTF-16 encoding found when reading string")]
    Utf16ReadingError(#[from] FromUtf16Error),
    /// Integer type conversion error.
    #[error("integer conversion failed")]
    TryFromIntError(#[from] TryFromIntError),
    /// Tag loading or compilation error.
    #[error("error occurred while processing a tag")]
    TagError(#[from] TagError),
    /// Cache file image error.
    #[error("error occurred while processing a map")]
    MapError(#[from] MapError),
    /// Workload resolution error.
    #[error("error occurred while building")]
    BuildError(#[from] BuildError),
    /// Compression or decompression error.
    #[error("error occurred in a compression codec")]
    CompressionError(#[from] CompressionError),
}

/// Standard result type used throughout `blamforge`.
pub type Result<T> = StdResult<T, Error>;
