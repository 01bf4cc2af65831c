//! # Error
//!
//! Error taxonomy for payload verification. Every failure collapses to one of the stable
//! numeric codes in [`ErrorCode`], which is what the host UI keys its messages on.

use thiserror::Error;

use crate::code::EncodeError;

/// Stable numeric result codes reported to the host
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Payload fetched, verified and applied
    Ok = 0,
    /// Server has no payload for this game
    Stage0MissingStage1 = -20901,
    /// Payload digest differs from the one advertised in stage0
    Stage0HashMismatch = -20902,
    /// Payload buffer could not be allocated
    Stage1Alloc = -20910,
    /// Request could not be made
    Stage1MakeRequest = -20911,
    /// Server returned an error or malformed response
    Stage1Response = -20912,
    /// Payload header or structure is invalid
    Stage1HeaderCheck = -20913,
    /// Declared payload length disagrees with the received length
    Stage1LengthError = -20914,
    /// Payload salt differs from the session salt
    Stage1SaltMismatch = -20915,
    /// Payload targets a different game
    Stage1GameIdMismatch = -20916,
    /// Payload signature did not verify
    Stage1SignatureInvalid = -20917,
    /// Server is still preparing the payload
    Stage1Waiting = -20918,
    /// Payload is incompatible with the running game build
    GameMismatch = -20930,
}

impl ErrorCode {
    /// Raw code value
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

/// Structural or bounds violations inside a payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Fewer bytes available than a field requires
    #[error("payload truncated: needed {needed} bytes at offset {offset:#x}")]
    Truncated {
        /// Offset of the read
        offset: usize,
        /// Bytes the read needed
        needed: usize,
    },
    /// Header magic is not `WWFC/Payload`
    #[error("bad payload magic")]
    BadMagic,
    /// Declared `total_size` disagrees with the received byte count
    #[error("payload length mismatch: header declares {declared} bytes, received {actual}")]
    LengthMismatch {
        /// Size from the header
        declared: u32,
        /// Bytes actually received
        actual: usize,
    },
    /// A region lies outside the payload body
    #[error("{name} range {start:#x}..{end:#x} is outside the payload")]
    RangeOutOfBounds {
        /// Region name
        name: &'static str,
        /// Region start
        start: u32,
        /// Region end
        end: u32,
    },
    /// A region ends before it starts
    #[error("{name} range {start:#x}..{end:#x} ends before it starts")]
    RangeInverted {
        /// Region name
        name: &'static str,
        /// Region start
        start: u32,
        /// Region end
        end: u32,
    },
    /// Two regions share bytes
    #[error("{first} range overlaps {second} range")]
    RangesOverlap {
        /// First region name
        first: &'static str,
        /// Second region name
        second: &'static str,
    },
    /// A region length is not a multiple of its element size
    #[error("{name} length {len:#x} is not a multiple of {unit}")]
    Misaligned {
        /// Region name
        name: &'static str,
        /// Region length
        len: u32,
        /// Element size
        unit: u32,
    },
    /// Patch type byte is not a known instruction kind
    #[error("unknown patch type {0}")]
    UnknownPatchType(u8),
    /// A fixup points at a word outside the payload
    #[error("fixup at {offset:#x} points outside the payload")]
    FixupOutOfBounds {
        /// Offset that was pointed at
        offset: u32,
    },
    /// WRITE record reads data from outside the payload
    #[error("write source {source_address:#x} (+{len:#x}) is outside the payload")]
    WriteSourceOutOfBounds {
        /// Source address from the record
        source_address: u32,
        /// Length from the record
        len: u32,
    },
}

/// Network and negotiation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Stage0 reported that no payload exists for this game
    #[error("server has no payload for this game")]
    MissingStage1,
    /// Response is larger than the payload buffer
    #[error("payload of {size} bytes exceeds the {max} byte buffer")]
    Alloc {
        /// Size the server sent
        size: usize,
        /// Buffer limit
        max: usize,
    },
    /// Transport could not make the request
    #[error("request failed: {0}")]
    MakeRequest(String),
    /// Server answered with an error or malformed response
    #[error("bad response: {0}")]
    Response(String),
    /// Payload is not ready yet; retry later
    #[error("server is still preparing the payload")]
    Waiting,
    /// Attempt was cancelled by the host
    #[error("payload fetch cancelled")]
    Cancelled,
    /// Retry budget or deadline ran out while waiting
    #[error("payload fetch timed out")]
    TimedOut,
    /// A stage was requested from the wrong state
    #[error("stage requested out of order")]
    OutOfOrder,
}

/// Hash, salt and signature failures. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    /// Computed digest differs from the advertised one
    #[error("payload digest does not match the advertised digest")]
    DigestMismatch,
    /// Payload salt is not the session salt
    #[error("payload salt does not match the session salt")]
    SaltMismatch,
    /// Signature failed verification
    #[error("payload signature is invalid")]
    SignatureInvalid,
    /// Embedded key material could not be decoded
    #[error("public key is invalid: {0}")]
    InvalidKey(&'static str),
}

/// Payload does not fit the running game
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompatibilityError {
    /// Payload name differs from the requesting game
    #[error("payload is for {actual:?}, expected {expected:?}")]
    GameIdMismatch {
        /// Game the client asked for
        expected: String,
        /// Game named in the payload
        actual: String,
    },
    /// Payload format is newer than this verifier understands
    #[error("payload format {format_version} (compat {compat}) is not supported by format {supported}")]
    UnsupportedFormat {
        /// Payload's format version
        format_version: u32,
        /// Oldest format the payload is compatible with
        compat: u32,
        /// Format this verifier implements
        supported: u32,
    },
}

/// Failures while applying a patch batch
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Write target is not in a permitted region
    #[error("patch target {address:#x} (+{len:#x}) is outside the patchable region")]
    OutOfRegion {
        /// Target address
        address: u32,
        /// Write length
        len: usize,
    },
    /// Instruction could not be encoded
    #[error("{0}")]
    Encode(#[from] EncodeError),
    /// Host address space rejected a write; earlier writes were rolled back
    #[error("write to {address:#x} failed: {reason}")]
    Write {
        /// Target address
        address: u32,
        /// Underlying error
        reason: String,
    },
}

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read or written
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration is not valid TOML for the expected schema
    #[error("config parse error: {0}")]
    Parse(String),
    /// A field has an unusable value
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Any failure of a verify-and-apply attempt
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Structural payload error
    #[error("{0}")]
    Format(#[from] FormatError),
    /// Negotiation error
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    /// Authentication error
    #[error("{0}")]
    Trust(#[from] TrustError),
    /// Game compatibility error
    #[error("{0}")]
    Compatibility(#[from] CompatibilityError),
    /// Patch application error
    #[error("{0}")]
    Apply(#[from] ApplyError),
}

impl PayloadError {
    /// Stable code reported to the host for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Format(e) => match e {
                FormatError::Truncated { .. } | FormatError::LengthMismatch { .. } => {
                    ErrorCode::Stage1LengthError
                }
                _ => ErrorCode::Stage1HeaderCheck,
            },
            Self::Protocol(e) => match e {
                ProtocolError::MissingStage1 => ErrorCode::Stage0MissingStage1,
                ProtocolError::Alloc { .. } => ErrorCode::Stage1Alloc,
                ProtocolError::MakeRequest(_) | ProtocolError::OutOfOrder => {
                    ErrorCode::Stage1MakeRequest
                }
                ProtocolError::Response(_) => ErrorCode::Stage1Response,
                ProtocolError::Waiting | ProtocolError::Cancelled | ProtocolError::TimedOut => {
                    ErrorCode::Stage1Waiting
                }
            },
            Self::Trust(e) => match e {
                TrustError::DigestMismatch => ErrorCode::Stage0HashMismatch,
                TrustError::SaltMismatch => ErrorCode::Stage1SaltMismatch,
                TrustError::SignatureInvalid | TrustError::InvalidKey(_) => {
                    ErrorCode::Stage1SignatureInvalid
                }
            },
            Self::Compatibility(e) => match e {
                CompatibilityError::GameIdMismatch { .. } => ErrorCode::Stage1GameIdMismatch,
                CompatibilityError::UnsupportedFormat { .. } => ErrorCode::GameMismatch,
            },
            Self::Apply(_) => ErrorCode::GameMismatch,
        }
    }

    /// Whether the orchestrator may retry after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::Waiting))
    }
}

/// Collapses an attempt's result into the code shown to the host
pub fn result_code<T>(result: &Result<T, PayloadError>) -> i32 {
    match result {
        Ok(_) => ErrorCode::Ok.as_i32(),
        Err(e) => e.code().as_i32(),
    }
}
