//! Cipher primitives bound to their key use-cases.
//!
//! Filenames, attributes, and block-index entries are Blowfish-CBC under
//! distinct keys; file data is AES-256-CBC. PKCS#7 padding is applied
//! manually: the store tolerates malformed padding by leaving it in
//! place, so unpadding must be equally lenient.

use std::io::Write;

use aes::Aes256;
use blowfish::Blowfish;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use deflate::{write::ZlibEncoder, CompressionOptions};
use inflate::InflateWriter;
use tracing::warn;

use boxtin_protocol::Error;

use crate::keys::KeyBundle;

pub const BLOWFISH_BLOCK: usize = 8;
pub const AES_BLOCK: usize = 16;

type BlowfishCbcEnc = cbc::Encryptor<Blowfish>;
type BlowfishCbcDec = cbc::Decryptor<Blowfish>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Stateless apart from its key material; shared read-only across all
/// operations of a session.
pub struct CipherSuite {
    keys: KeyBundle,
}

pub fn pkcs7_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad = block_size - data.len() % block_size;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad as u8).take(pad));
    out
}

/// Strips PKCS#7 padding, returning the input unchanged when the
/// padding is malformed.
pub fn pkcs7_unpad(data: &[u8]) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let n = last as usize;
    if n == 0 || n > data.len() {
        return data;
    }
    let (head, tail) = data.split_at(data.len() - n);
    if tail.iter().all(|&b| b == last) {
        head
    } else {
        data
    }
}

fn check_aligned(len: usize, block_size: usize) -> Result<(), Error> {
    if len % block_size != 0 {
        return Err(Error::CryptoInvalid(format!(
            "{len} bytes is not a multiple of the {block_size}-byte cipher block"
        )));
    }
    Ok(())
}

fn blowfish_encrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), Error> {
    check_aligned(buf.len(), BLOWFISH_BLOCK)?;
    let cipher = BlowfishCbcEnc::new_from_slices(key, iv)
        .map_err(|err| Error::CryptoInvalid(format!("bad blowfish key or IV: {err}")))?;
    let len = buf.len();
    cipher
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| Error::CryptoInvalid("blowfish encryption failed".into()))?;
    Ok(())
}

fn blowfish_decrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), Error> {
    check_aligned(buf.len(), BLOWFISH_BLOCK)?;
    let cipher = BlowfishCbcDec::new_from_slices(key, iv)
        .map_err(|err| Error::CryptoInvalid(format!("bad blowfish key or IV: {err}")))?;
    cipher
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| Error::CryptoInvalid("blowfish decryption failed".into()))?;
    Ok(())
}

impl CipherSuite {
    pub fn new(keys: KeyBundle) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeyBundle {
        &self.keys
    }

    /// The filename IV is fixed, so a given name always encrypts to the
    /// same bytes.
    pub fn encrypt_filename(&self, name: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buf = pkcs7_pad(name, BLOWFISH_BLOCK);
        blowfish_encrypt(self.keys.filename_key(), self.keys.filename_iv(), &mut buf)?;
        Ok(buf)
    }

    pub fn decrypt_filename(&self, cipher: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buf = cipher.to_vec();
        blowfish_decrypt(self.keys.filename_key(), self.keys.filename_iv(), &mut buf)?;
        let len = pkcs7_unpad(&buf).len();
        buf.truncate(len);
        Ok(buf)
    }

    /// Returns `iv || ciphertext`; the IV must be fresh for every block.
    pub fn encrypt_attributes(&self, plain: &[u8], iv: &[u8; 8]) -> Result<Vec<u8>, Error> {
        let padded = pkcs7_pad(plain, BLOWFISH_BLOCK);
        let mut out = Vec::with_capacity(iv.len() + padded.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(&padded);
        blowfish_encrypt(self.keys.attributes_key(), iv, &mut out[BLOWFISH_BLOCK..])?;
        Ok(out)
    }

    pub fn decrypt_attributes(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() < BLOWFISH_BLOCK {
            return Err(Error::CryptoInvalid(
                "attribute ciphertext shorter than its IV".into(),
            ));
        }
        let (iv, ciphertext) = data.split_at(BLOWFISH_BLOCK);
        let mut buf = ciphertext.to_vec();
        blowfish_decrypt(self.keys.attributes_key(), iv, &mut buf)?;
        let len = pkcs7_unpad(&buf).len();
        buf.truncate(len);
        Ok(buf)
    }

    /// Encrypts one block-index entry in place. Every entry of an index
    /// uses the index-wide IV base.
    pub fn encrypt_block_index_entry(
        &self,
        entry: &mut [u8],
        iv_base: &[u8; 8],
    ) -> Result<(), Error> {
        blowfish_encrypt(self.keys.block_index_key(), iv_base, entry)
    }

    pub fn decrypt_block_index_entry(
        &self,
        entry: &mut [u8],
        iv_base: &[u8; 8],
    ) -> Result<(), Error> {
        blowfish_decrypt(self.keys.block_index_key(), iv_base, entry)
    }

    /// Returns `iv || ciphertext`; the IV must be fresh for every block.
    pub fn encrypt_file_data(&self, plain: &[u8], iv: &[u8; 16]) -> Result<Vec<u8>, Error> {
        let padded = pkcs7_pad(plain, AES_BLOCK);
        let mut out = Vec::with_capacity(iv.len() + padded.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(&padded);
        let len = out.len() - AES_BLOCK;
        let cipher = Aes256CbcEnc::new_from_slices(self.keys.file_aes_key(), iv)
            .map_err(|err| Error::CryptoInvalid(format!("bad AES key or IV: {err}")))?;
        cipher
            .encrypt_padded_mut::<NoPadding>(&mut out[AES_BLOCK..], len)
            .map_err(|_| Error::CryptoInvalid("AES encryption failed".into()))?;
        Ok(out)
    }

    pub fn decrypt_file_data(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() < AES_BLOCK {
            return Err(Error::CryptoInvalid(
                "file data ciphertext shorter than its IV".into(),
            ));
        }
        let (iv, ciphertext) = data.split_at(AES_BLOCK);
        check_aligned(ciphertext.len(), AES_BLOCK)?;
        let mut buf = ciphertext.to_vec();
        let cipher = Aes256CbcDec::new_from_slices(self.keys.file_aes_key(), iv)
            .map_err(|err| Error::CryptoInvalid(format!("bad AES key or IV: {err}")))?;
        cipher
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| Error::CryptoInvalid("AES decryption failed".into()))?;
        let len = pkcs7_unpad(&buf).len();
        buf.truncate(len);
        Ok(buf)
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            CompressionOptions::high(),
        );
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    /// `clear_size` comes from the block-index entry; the strong
    /// checksum is the authority on content, so a differing size is
    /// only diagnosed here.
    pub fn decompress(&self, data: &[u8], clear_size: usize) -> Result<Vec<u8>, Error> {
        let mut writer = InflateWriter::from_zlib(Vec::with_capacity(clear_size));
        writer
            .write_all(data)
            .map_err(|err| Error::ProtocolViolation(format!("inflate failed: {err}")))?;
        let out = writer
            .finish()
            .map_err(|err| Error::ProtocolViolation(format!("inflate failed: {err}")))?;
        if out.len() != clear_size {
            warn!(
                expected = clear_size,
                actual = out.len(),
                "decompressed block size differs from its index entry"
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_FILE_SIZE;

    fn suite() -> CipherSuite {
        let material: Vec<u8> = (0..KEY_FILE_SIZE).map(|i| (i % 251) as u8).collect();
        CipherSuite::new(KeyBundle::from_bytes(&material).unwrap())
    }

    #[test]
    pub fn filename_roundtrip() {
        let suite = suite();
        let encrypted = suite.encrypt_filename(b"hello.txt").unwrap();
        assert_ne!(encrypted, b"hello.txt");
        assert_eq!(encrypted.len() % BLOWFISH_BLOCK, 0);
        assert_eq!(suite.decrypt_filename(&encrypted).unwrap(), b"hello.txt");
    }

    #[test]
    pub fn filename_encryption_is_deterministic() {
        let suite = suite();
        assert_eq!(
            suite.encrypt_filename(b"same-name").unwrap(),
            suite.encrypt_filename(b"same-name").unwrap()
        );
    }

    #[test]
    pub fn attributes_roundtrip() {
        let suite = suite();
        let iv = [7u8; 8];
        let encrypted = suite.encrypt_attributes(b"some attribute bytes", &iv).unwrap();
        assert_eq!(&encrypted[..8], &iv);
        assert_eq!(
            suite.decrypt_attributes(&encrypted).unwrap(),
            b"some attribute bytes"
        );
    }

    #[test]
    pub fn block_index_entry_roundtrip_in_place() {
        let suite = suite();
        let iv_base = [3u8; 8];
        let original = *b"twenty-four byte entry!!";
        let mut entry = original;
        suite.encrypt_block_index_entry(&mut entry, &iv_base).unwrap();
        assert_ne!(entry, original);
        suite.decrypt_block_index_entry(&mut entry, &iv_base).unwrap();
        assert_eq!(entry, original);
    }

    #[test]
    pub fn file_data_roundtrip() {
        let suite = suite();
        let iv = [9u8; 16];
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let plain: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let encrypted = suite.encrypt_file_data(&plain, &iv).unwrap();
            assert_eq!(&encrypted[..16], &iv);
            assert_eq!(suite.decrypt_file_data(&encrypted).unwrap(), plain);
        }
    }

    #[test]
    pub fn unaligned_ciphertext_is_rejected() {
        let suite = suite();
        assert!(matches!(
            suite.decrypt_filename(&[0u8; 13]),
            Err(Error::CryptoInvalid(_))
        ));
        assert!(matches!(
            suite.decrypt_file_data(&[0u8; 24]),
            Err(Error::CryptoInvalid(_))
        ));
    }

    #[test]
    pub fn malformed_padding_is_left_in_place() {
        assert_eq!(pkcs7_unpad(&[1, 2, 3, 4]), &[1, 2, 3]);
        // Value larger than the buffer.
        assert_eq!(pkcs7_unpad(&[1, 2, 9]), &[1, 2, 9]);
        // Inconsistent padding bytes.
        assert_eq!(pkcs7_unpad(&[1, 3, 2, 2, 3]), &[1, 3, 2, 2, 3]);
        // Zero is never valid padding.
        assert_eq!(pkcs7_unpad(&[1, 2, 0]), &[1, 2, 0]);
    }

    #[test]
    pub fn compression_roundtrip() {
        let suite = suite();
        let plain: Vec<u8> = b"abcdef".repeat(500);
        let compressed = suite.compress(&plain).unwrap();
        assert!(compressed.len() < plain.len());
        assert_eq!(suite.decompress(&compressed, plain.len()).unwrap(), plain);
    }

    #[test]
    pub fn corrupt_zlib_input_is_a_protocol_violation() {
        let suite = suite();
        assert!(matches!(
            suite.decompress(&[0xde, 0xad, 0xbe, 0xef], 10),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
