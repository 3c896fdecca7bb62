//! Key material for a store session.
//!
//! Keys live in a fixed-layout 1 KiB file with deliberate gaps between
//! entries. Filenames, attributes, and block-index entries use maximum
//! length (448-bit) Blowfish keys; file data uses a 256-bit AES key.
//! The filename IV is fixed so that equal names in a directory encrypt
//! identically, which the store relies on for entry deduplication.

use std::fmt;
use std::path::Path;

use boxtin_protocol::Error;

pub const KEY_FILE_SIZE: usize = 1024;

const FILENAME_KEY_OFFSET: usize = 0;
const FILENAME_IV_OFFSET: usize = 56;
const ATTRIBUTES_KEY_OFFSET: usize = 64;
const FILE_BLOWFISH_KEY_OFFSET: usize = 128;
const BLOCK_INDEX_KEY_OFFSET: usize = 192;
const ATTRIBUTE_HASH_SECRET_OFFSET: usize = 256;
const FILE_AES_KEY_OFFSET: usize = 384;

/// The five session keys plus the fixed filename IV. Immutable once
/// loaded.
#[derive(Clone)]
pub struct KeyBundle {
    filename_key: [u8; 56],
    filename_iv: [u8; 8],
    attributes_key: [u8; 56],
    file_blowfish_key: [u8; 56],
    block_index_key: [u8; 56],
    attribute_hash_secret: [u8; 128],
    file_aes_key: [u8; 32],
}

fn section<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

impl KeyBundle {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = fs_err::read(path)
            .map_err(|err| Error::ConfigInvalid(format!("cannot read key file: {err}")))?;
        if data.len() < KEY_FILE_SIZE {
            return Err(Error::ConfigInvalid(format!(
                "key file {} is {} bytes, expected {KEY_FILE_SIZE}",
                path.display(),
                data.len(),
            )));
        }
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < KEY_FILE_SIZE {
            return Err(Error::ConfigInvalid(format!(
                "key material is {} bytes, expected {KEY_FILE_SIZE}",
                data.len()
            )));
        }
        Ok(Self {
            filename_key: section(data, FILENAME_KEY_OFFSET),
            filename_iv: section(data, FILENAME_IV_OFFSET),
            attributes_key: section(data, ATTRIBUTES_KEY_OFFSET),
            file_blowfish_key: section(data, FILE_BLOWFISH_KEY_OFFSET),
            block_index_key: section(data, BLOCK_INDEX_KEY_OFFSET),
            attribute_hash_secret: section(data, ATTRIBUTE_HASH_SECRET_OFFSET),
            file_aes_key: section(data, FILE_AES_KEY_OFFSET),
        })
    }

    pub fn filename_key(&self) -> &[u8; 56] {
        &self.filename_key
    }

    pub fn filename_iv(&self) -> &[u8; 8] {
        &self.filename_iv
    }

    pub fn attributes_key(&self) -> &[u8; 56] {
        &self.attributes_key
    }

    pub fn file_blowfish_key(&self) -> &[u8; 56] {
        &self.file_blowfish_key
    }

    pub fn block_index_key(&self) -> &[u8; 56] {
        &self.block_index_key
    }

    pub fn attribute_hash_secret(&self) -> &[u8; 128] {
        &self.attribute_hash_secret
    }

    pub fn file_aes_key(&self) -> &[u8; 32] {
        &self.file_aes_key
    }
}

impl fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBundle").finish_non_exhaustive()
    }
}
