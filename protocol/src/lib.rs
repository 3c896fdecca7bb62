//! Wire types for the BoxBackup store protocol.
//!
//! The protocol is a framed request/response exchange: each frame is a
//! [`Header`] (`size`, `command`) followed by a fixed-layout big-endian
//! body. Certain replies are followed by a sideband stream frame whose
//! command code is [`STREAM_FRAME`]. This crate defines every command and
//! reply body, the registry mapping request types to their command and
//! expected-reply codes, the stream sub-headers, and the error taxonomy.
//! It performs no I/O.

use std::{fmt, num::ParseIntError, str::FromStr};

use derive_more::{From, Into};

pub mod error;
pub mod mode;
pub mod streams;
pub mod wire;

pub use error::{Error, ServerErrorKind};
pub use wire::{Header, WireRecord};

/// Magic exchanged by both sides before the first command, zero-padded
/// to [`HANDSHAKE_LEN`] bytes.
pub const HANDSHAKE_MAGIC: &[u8] = b"Box-Backup:v=C";
pub const HANDSHAKE_LEN: usize = 32;

/// Command code of a stream frame; its `size` is the body length alone.
pub const STREAM_FRAME: u32 = 0xFFFF_FFFF;

/// Directory entry flag bits.
pub const FLAG_FILE: i16 = 1;
pub const FLAG_DIR: i16 = 2;
pub const FLAG_DELETED: i16 = 4;
pub const FLAG_OLD_VERSION: i16 = 8;

/// `ListDirectory` selectors for "include everything".
pub const FLAGS_INCLUDE_EVERYTHING: i16 = -1;
pub const FLAGS_EXCLUDE_NOTHING: i16 = 0;

/// Login flag requesting a read-only session.
pub const LOGIN_READ_ONLY: i32 = 1;

/// Identifier of a stored object (file or directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, From, Into, PartialOrd, Ord)]
pub struct ObjectId(pub i64);

impl ObjectId {
    /// The root directory.
    pub const ROOT: ObjectId = ObjectId(1);
    /// "Unset" in requests that take an optional object.
    pub const UNSET: ObjectId = ObjectId(0);

    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).map(ObjectId)
        } else {
            s.parse().map(ObjectId)
        }
    }
}

/// A request type with its command code and the reply code the store is
/// expected to answer with.
pub trait Request: WireRecord {
    const CODE: u32;
    const REPLY_CODE: u32;
}

macro_rules! request_type {
    ($request:ty, $code:literal, $reply_code:literal) => {
        impl Request for $request {
            const CODE: u32 = $code;
            const REPLY_CODE: u32 = $reply_code;
        }
    };
}

use wire::wire_record;

wire_record! {
    /// Body of an error reply (reply code 0).
    pub struct ErrorReply {
        pub error_type: i32,
        pub error_subtype: i32,
    }
}

wire_record! {
    /// Protocol version exchange; the store answers with its own version.
    pub struct Version {
        pub version: i32,
    }
}
request_type!(Version, 1, 1);

wire_record! {
    /// Authenticates the session for an account.
    pub struct Login {
        pub client_id: i32,
        pub flags: i32,
    }
}
request_type!(Login, 2, 3);

wire_record! {
    pub struct LoginConfirmed {
        pub client_store_marker: i64,
        pub blocks_used: i64,
        pub blocks_soft_limit: i64,
        pub blocks_hard_limit: i64,
    }
}

wire_record! {
    /// Ends the session; the store echoes it back.
    pub struct Finished {}
}
request_type!(Finished, 4, 4);

wire_record! {
    /// Generic affirmative reply carrying the object acted upon.
    pub struct Success {
        pub object_id: ObjectId,
    }
}

wire_record! {
    pub struct SetClientStoreMarker {
        pub client_store_marker: i64,
    }
}
request_type!(SetClientStoreMarker, 6, 0);

wire_record! {
    /// Fetches an object in store order (block index at the end).
    /// The reply is followed by a stream.
    pub struct GetObject {
        pub object_id: ObjectId,
    }
}
request_type!(GetObject, 10, 5);

wire_record! {
    /// `FLAG_MOVE_ALL_WITH_SAME_NAME` and `FLAG_ALLOW_MOVE_OVER_DELETED`
    /// may be set in `flags`. An encoded filename trails the body.
    pub struct MoveObject {
        pub object_id: ObjectId,
        pub move_from_directory: ObjectId,
        pub move_to_directory: ObjectId,
        pub flags: i32,
    }
}
request_type!(MoveObject, 11, 0);

pub const FLAG_MOVE_ALL_WITH_SAME_NAME: i32 = 1;
pub const FLAG_ALLOW_MOVE_OVER_DELETED: i32 = 2;

wire_record! {
    /// Looks up the name path of an object. Set `object_id` to
    /// [`ObjectId::UNSET`] for information on the directory alone.
    pub struct GetObjectName {
        pub object_id: ObjectId,
        pub containing_directory_id: ObjectId,
    }
}
request_type!(GetObjectName, 12, 13);

wire_record! {
    /// `num_name_elements` filename objects follow in a stream; zero
    /// means the object does not exist.
    pub struct ObjectName {
        pub num_name_elements: i32,
        pub modification_time: i64,
        pub attributes_hash: i64,
        pub flags: i16,
    }
}

wire_record! {
    /// An encoded directory name trails the body; a stream with the
    /// directory attributes follows the frame.
    pub struct CreateDirectory {
        pub containing_directory_id: ObjectId,
        pub attributes_mod_time: i64,
    }
}
request_type!(CreateDirectory, 20, 0);

wire_record! {
    /// `CreateDirectory` variant carrying the directory modification time.
    pub struct CreateDirectory2 {
        pub containing_directory_id: ObjectId,
        pub attributes_mod_time: i64,
        pub modification_time: i64,
    }
}
request_type!(CreateDirectory2, 46, 0);

wire_record! {
    /// Lists a directory. The reply is followed by a `DIR_` stream.
    /// `FLAGS_INCLUDE_EVERYTHING` / `FLAGS_EXCLUDE_NOTHING` select all
    /// entries.
    pub struct ListDirectory {
        pub object_id: ObjectId,
        pub flags_must_be_set: i16,
        pub flags_not_to_be_set: i16,
        pub send_attributes: bool,
    }
}
request_type!(ListDirectory, 21, 5);

wire_record! {
    /// A stream with the new attributes follows the frame.
    pub struct ChangeDirAttributes {
        pub object_id: ObjectId,
        pub attributes_mod_time: i64,
    }
}
request_type!(ChangeDirAttributes, 22, 0);

wire_record! {
    pub struct DeleteDirectory {
        pub object_id: ObjectId,
    }
}
request_type!(DeleteDirectory, 23, 0);

wire_record! {
    pub struct UndeleteDirectory {
        pub object_id: ObjectId,
    }
}
request_type!(UndeleteDirectory, 24, 0);

wire_record! {
    /// Uploads an encoded file. An encoded filename trails the body and
    /// the encoded file follows as a stream.
    pub struct StoreFile {
        pub directory_object_id: ObjectId,
        pub modification_time: i64,
        pub attributes_hash: i64,
        /// Zero if the file is not a diff.
        pub diff_from_file_id: ObjectId,
    }
}
request_type!(StoreFile, 30, 5);

wire_record! {
    /// Fetches a file in stream order (block index first). The reply is
    /// followed by a stream.
    pub struct GetFile {
        pub in_directory: ObjectId,
        pub object_id: ObjectId,
    }
}
request_type!(GetFile, 31, 5);

wire_record! {
    /// An encoded filename trails the body; a stream with the new
    /// attributes follows the frame.
    pub struct SetReplacementFileAttributes {
        pub in_directory: ObjectId,
        pub attributes_hash: i64,
    }
}
request_type!(SetReplacementFileAttributes, 32, 0);

wire_record! {
    /// An encoded filename trails the body. The reply carries the
    /// deleted object, or [`ObjectId::UNSET`] if nothing matched.
    pub struct DeleteFile {
        pub in_directory: ObjectId,
    }
}
request_type!(DeleteFile, 33, 5);

wire_record! {
    /// A stream with the block index follows the reply.
    pub struct GetBlockIndexByID {
        pub object_id: ObjectId,
    }
}
request_type!(GetBlockIndexByID, 34, 5);

wire_record! {
    /// An encoded filename trails the body. The reply carries the found
    /// object ([`ObjectId::UNSET`] if absent); a stream with the block
    /// index follows only when it was found.
    pub struct GetBlockIndexByName {
        pub in_directory: ObjectId,
    }
}
request_type!(GetBlockIndexByName, 35, 5);

wire_record! {
    pub struct UndeleteFile {
        pub in_directory: ObjectId,
        pub object_id: ObjectId,
    }
}
request_type!(UndeleteFile, 36, 0);

wire_record! {
    pub struct GetAccountUsage {}
}
request_type!(GetAccountUsage, 40, 41);

wire_record! {
    pub struct AccountUsage {
        pub blocks_used: i64,
        pub blocks_in_old_files: i64,
        pub blocks_in_deleted_files: i64,
        pub blocks_in_directories: i64,
        pub blocks_soft_limit: i64,
        pub blocks_hard_limit: i64,
        pub block_size: i32,
    }
}

wire_record! {
    pub struct GetIsAlive {}
}
request_type!(GetIsAlive, 42, 43);

wire_record! {
    pub struct IsAlive {}
}

wire_record! {
    pub struct GetAccountUsage2 {}
}
request_type!(GetAccountUsage2, 44, 45);

wire_record! {
    pub struct AccountUsage2 {
        pub padding: u32,
        pub account_enabled: bool,
        pub client_store_marker: i64,
        pub block_size: i32,
        pub last_object_id_used: i64,
        pub blocks_used: i64,
        pub blocks_in_current_files: i64,
        pub blocks_in_old_files: i64,
        pub blocks_in_deleted_files: i64,
        pub blocks_in_directories: i64,
        pub blocks_soft_limit: i64,
        pub blocks_hard_limit: i64,
        pub num_current_files: i64,
        pub num_old_files: i64,
        pub num_deleted_files: i64,
        pub num_directories: i64,
    }
}

/// A decoded reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Error(ErrorReply),
    Version(Version),
    LoginConfirmed(LoginConfirmed),
    Finished,
    Success(Success),
    ObjectName(ObjectName),
    AccountUsage(AccountUsage),
    IsAlive,
    AccountUsage2(AccountUsage2),
}

impl Reply {
    /// Decodes a reply body by its received command code. Returns the
    /// reply and the number of body bytes consumed; surplus bytes are
    /// the caller's to diagnose.
    pub fn decode(code: u32, body: &[u8]) -> Result<(Self, usize), Error> {
        fn record<R: WireRecord>(body: &[u8]) -> Result<(R, usize), Error> {
            R::decode(body).map(|r| (r, R::WIRE_SIZE))
        }

        Ok(match code {
            0 => {
                let (body, used) = record::<ErrorReply>(body)?;
                (Self::Error(body), used)
            }
            1 => {
                let (body, used) = record::<Version>(body)?;
                (Self::Version(body), used)
            }
            3 => {
                let (body, used) = record::<LoginConfirmed>(body)?;
                (Self::LoginConfirmed(body), used)
            }
            4 => (Self::Finished, 0),
            5 => {
                let (body, used) = record::<Success>(body)?;
                (Self::Success(body), used)
            }
            13 => {
                let (body, used) = record::<ObjectName>(body)?;
                (Self::ObjectName(body), used)
            }
            41 => {
                let (body, used) = record::<AccountUsage>(body)?;
                (Self::AccountUsage(body), used)
            }
            43 => (Self::IsAlive, 0),
            45 => {
                let (body, used) = record::<AccountUsage2>(body)?;
                (Self::AccountUsage2(body), used)
            }
            other => return Err(Error::UnknownCommand(other)),
        })
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Error(_) => 0,
            Self::Version(_) => 1,
            Self::LoginConfirmed(_) => 3,
            Self::Finished => 4,
            Self::Success(_) => 5,
            Self::ObjectName(_) => 13,
            Self::AccountUsage(_) => 41,
            Self::IsAlive => 43,
            Self::AccountUsage2(_) => 45,
        }
    }

    pub fn into_success(self) -> Result<Success, Error> {
        match self {
            Self::Success(success) => Ok(success),
            other => Err(Error::UnexpectedReply {
                got: other.code(),
                expected: 5,
            }),
        }
    }

    pub fn into_version(self) -> Result<Version, Error> {
        match self {
            Self::Version(version) => Ok(version),
            other => Err(Error::UnexpectedReply {
                got: other.code(),
                expected: 1,
            }),
        }
    }

    pub fn into_login_confirmed(self) -> Result<LoginConfirmed, Error> {
        match self {
            Self::LoginConfirmed(confirmed) => Ok(confirmed),
            other => Err(Error::UnexpectedReply {
                got: other.code(),
                expected: 3,
            }),
        }
    }

    pub fn into_object_name(self) -> Result<ObjectName, Error> {
        match self {
            Self::ObjectName(name) => Ok(name),
            other => Err(Error::UnexpectedReply {
                got: other.code(),
                expected: 13,
            }),
        }
    }

    pub fn into_account_usage(self) -> Result<AccountUsage, Error> {
        match self {
            Self::AccountUsage(usage) => Ok(usage),
            other => Err(Error::UnexpectedReply {
                got: other.code(),
                expected: 41,
            }),
        }
    }

    pub fn into_account_usage2(self) -> Result<AccountUsage2, Error> {
        match self {
            Self::AccountUsage2(usage) => Ok(usage),
            other => Err(Error::UnexpectedReply {
                got: other.code(),
                expected: 45,
            }),
        }
    }
}
