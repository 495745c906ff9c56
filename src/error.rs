use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

// Errors raised while decoding on-disk structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    // The "-FVE-FS-" (or To Go) signature was not found.
    BadSignature,
    // A format version outside the supported set.
    UnsupportedVersion(u16),
    // The data ended before a fixed-size structure was complete.
    Truncated,
    // A declared size would read past the enclosing buffer.
    SizeOutOfBounds,
    // A structural constraint was violated.
    Invalid(&'static str),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormatError::BadSignature => write!(f, "Invalid BitLocker signature"),
            FormatError::UnsupportedVersion(v) => write!(f, "Unsupported format version: {}", v),
            FormatError::Truncated => write!(f, "Truncated data"),
            FormatError::SizeOutOfBounds => write!(f, "Size value out of bounds"),
            FormatError::Invalid(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    // AES-CCM authentication failed.
    WrongKey,
    InvalidKeySize,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::WrongKey => write!(f, "Authentication failed (wrong key)"),
            CryptoError::InvalidKeySize => write!(f, "Invalid key size"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    // Sector access was attempted on a locked volume.
    KeysNotSet,
    // None of the supplied credentials applies to any key protector.
    NoMatchingProtector,
    // Every applicable key protector rejected the supplied credentials.
    WrongKeyOrNoMatch,
    InvalidRecoveryPassword,
    InvalidStartupKey,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyError::KeysNotSet => write!(f, "Keys are not set (volume is locked)"),
            KeyError::NoMatchingProtector => write!(f, "No key protector matches the supplied credentials"),
            KeyError::WrongKeyOrNoMatch => write!(f, "Wrong key or no matching key protector"),
            KeyError::InvalidRecoveryPassword => write!(f, "Invalid recovery password"),
            KeyError::InvalidStartupKey => write!(f, "Invalid startup key"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    ZeroLengthBuffer,
    InvalidSeek,
    IndexOutOfBounds,
}

impl fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArgumentError::ZeroLengthBuffer => write!(f, "Zero-length buffer"),
            ArgumentError::InvalidSeek => write!(f, "Invalid seek offset"),
            ArgumentError::IndexOutOfBounds => write!(f, "Index out of bounds"),
        }
    }
}

/// All errors the library can produce.
#[derive(Debug)]
pub enum Error {
    Format(FormatError),
    Crypto(CryptoError),
    Key(KeyError),
    Argument(ArgumentError),
    /// The underlying byte source failed (including short reads).
    Io(io::Error),
    /// The caller raised the abort signal during a long-running operation.
    Aborted,
}

impl Error {
    /// True for failures that a different credential could fix.
    pub fn is_key_failure(&self) -> bool {
        matches!(self, Error::Key(_) | Error::Crypto(CryptoError::WrongKey))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Format(e) => write!(f, "Format error: {}", e),
            Error::Crypto(e) => write!(f, "Crypto error: {}", e),
            Error::Key(e) => write!(f, "Key error: {}", e),
            Error::Argument(e) => write!(f, "Argument error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Aborted => write!(f, "Operation aborted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::Io(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<FormatError> for Error {
    fn from(e: FormatError) -> Self {
        Error::Format(e)
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<KeyError> for Error {
    fn from(e: KeyError) -> Self {
        Error::Key(e)
    }
}

impl From<ArgumentError> for Error {
    fn from(e: ArgumentError) -> Self {
        Error::Argument(e)
    }
}

// Read and Seek impls surface crate errors through io::Error.
impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            Error::Argument(ArgumentError::InvalidSeek) => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
            Error::Format(_) => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
