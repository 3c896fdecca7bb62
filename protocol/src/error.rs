use std::fmt;

use thiserror::Error;

/// Reply type code used by the store to signal a failed command.
pub const ERROR_TYPE_CODE: u32 = 0;

/// `error_type` value carried by every well-formed error reply.
pub const SERVER_ERROR_TYPE: i32 = 1000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("handshake failed")]
    HandshakeFailed,
    #[error("unknown command code {0}")]
    UnknownCommand(u32),
    #[error("unexpected reply code {got} (expected {expected})")]
    UnexpectedReply { got: u32, expected: u32 },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid cryptographic input: {0}")]
    CryptoInvalid(String),
    #[error("strong checksum mismatch in block {block}")]
    ChecksumFailed { block: u64 },
    #[error("encoded filename is {0} bytes, exceeding the 14-bit length field")]
    FilenameTooLong(usize),
    #[error("unexpected end of stream")]
    EndOfStream,
    #[error("server error: {0}")]
    Server(ServerErrorKind),
}

/// Failure reported by the store in an error reply.
///
/// Subtypes 1 through 16 of error type 1000 have well-known meanings;
/// everything else is preserved in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    WrongVersion,
    NotInRightProtocolPhase,
    BadLogin,
    CannotLockStoreForWriting,
    SessionReadOnly,
    FileDoesNotVerify,
    DoesNotExist,
    DirectoryAlreadyExists,
    CannotDeleteRoot,
    TargetNameExists,
    StorageLimitExceeded,
    DiffFromFileDoesNotExist,
    DoesNotExistInDirectory,
    PatchConsistencyError,
    MultiplyReferencedObject,
    DisabledAccount,
    Unknown { error_type: i32, subtype: i32 },
}

impl ServerErrorKind {
    pub fn from_wire(error_type: i32, subtype: i32) -> Self {
        if error_type != SERVER_ERROR_TYPE {
            return Self::Unknown {
                error_type,
                subtype,
            };
        }
        match subtype {
            1 => Self::WrongVersion,
            2 => Self::NotInRightProtocolPhase,
            3 => Self::BadLogin,
            4 => Self::CannotLockStoreForWriting,
            5 => Self::SessionReadOnly,
            6 => Self::FileDoesNotVerify,
            7 => Self::DoesNotExist,
            8 => Self::DirectoryAlreadyExists,
            9 => Self::CannotDeleteRoot,
            10 => Self::TargetNameExists,
            11 => Self::StorageLimitExceeded,
            12 => Self::DiffFromFileDoesNotExist,
            13 => Self::DoesNotExistInDirectory,
            14 => Self::PatchConsistencyError,
            15 => Self::MultiplyReferencedObject,
            16 => Self::DisabledAccount,
            _ => Self::Unknown {
                error_type,
                subtype,
            },
        }
    }
}

impl fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongVersion => write!(f, "WrongVersion"),
            Self::NotInRightProtocolPhase => write!(f, "NotInRightProtocolPhase"),
            Self::BadLogin => write!(f, "BadLogin"),
            Self::CannotLockStoreForWriting => write!(f, "CannotLockStoreForWriting"),
            Self::SessionReadOnly => write!(f, "SessionReadOnly"),
            Self::FileDoesNotVerify => write!(f, "FileDoesNotVerify"),
            Self::DoesNotExist => write!(f, "DoesNotExist"),
            Self::DirectoryAlreadyExists => write!(f, "DirectoryAlreadyExists"),
            Self::CannotDeleteRoot => write!(f, "CannotDeleteRoot"),
            Self::TargetNameExists => write!(f, "TargetNameExists"),
            Self::StorageLimitExceeded => write!(f, "StorageLimitExceeded"),
            Self::DiffFromFileDoesNotExist => write!(f, "DiffFromFileDoesNotExist"),
            Self::DoesNotExistInDirectory => write!(f, "DoesNotExistInDirectory"),
            Self::PatchConsistencyError => write!(f, "PatchConsistencyError"),
            Self::MultiplyReferencedObject => write!(f, "MultiplyReferencedObject"),
            Self::DisabledAccount => write!(f, "DisabledAccount"),
            Self::Unknown {
                error_type,
                subtype,
            } => write!(f, "unknown error ({error_type}, {subtype})"),
        }
    }
}
