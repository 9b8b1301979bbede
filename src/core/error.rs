use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::Location;

/// What went wrong while decoding a cabinet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The bit or byte source was exhausted in the middle of an element.
    ShortRead,
    /// A Huffman decode walked into a missing branch of the tree.
    OffTree,
    /// Reserved or unknown block type tag.
    InvalidBlockType(u8),
    /// A stored block failed its length complement check, or an LZX block
    /// declared zero length.
    InvalidBlockLength,
    /// A back-reference distance exceeds the available history.
    InvalidMatch { distance: usize, available: usize },
    /// A code-length stream broke the canonical construction rules.
    InvalidCodebook,
    /// A CFDATA block does not open with the `CK` signature.
    BadMsZipSignature,
    /// Quantum, an unknown algorithm, or an out-of-range LZX window.
    UnsupportedCompression(u16),
    /// Missing `MSCF` signature or a structurally short header.
    BadCabHeader,
    /// The folder stream ended before a file's byte range was satisfied.
    TruncatedCabinet,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ShortRead => write!(f, "input exhausted mid-element"),
            ErrorKind::OffTree => write!(f, "huffman decode walked off the tree"),
            ErrorKind::InvalidBlockType(t) => write!(f, "invalid block type {}", t),
            ErrorKind::InvalidBlockLength => write!(f, "invalid block length"),
            ErrorKind::InvalidMatch {
                distance,
                available,
            } => write!(
                f,
                "match distance {} exceeds {} bytes of history",
                distance, available
            ),
            ErrorKind::InvalidCodebook => write!(f, "malformed code length table"),
            ErrorKind::BadMsZipSignature => write!(f, "CFDATA block missing CK signature"),
            ErrorKind::UnsupportedCompression(t) => {
                write!(f, "unsupported compression type {:#06x}", t)
            }
            ErrorKind::BadCabHeader => write!(f, "missing MSCF signature or short header"),
            ErrorKind::TruncatedCabinet => {
                write!(f, "folder data ended before file contents")
            }
        }
    }
}

#[derive(Debug)]
pub struct CabError {
    pub kind: ErrorKind,
    pub context: Option<String>,
    pub location: &'static Location<'static>,
}

pub type Res<T> = Result<T, CabError>;

impl CabError {
    #[track_caller]
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub(crate) fn context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: Some(context.into()),
            location: Location::caller(),
        }
    }
}

impl Display for CabError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error at {}", self.location)?;
        if let Some(context) = &self.context {
            write!(f, " ({})", context)?
        }
        write!(f, ": {}", self.kind)
    }
}

impl Error for CabError {}

impl From<CabError> for std::io::Error {
    fn from(value: CabError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, value)
    }
}

/// Implemented by decoders so raised errors carry their state.
pub(crate) trait Raise {
    fn describe(&self) -> Option<String> {
        None
    }

    #[track_caller]
    fn raise<T>(&self, kind: ErrorKind) -> Res<T> {
        Err(CabError {
            kind,
            context: self.describe(),
            location: Location::caller(),
        })
    }
}
