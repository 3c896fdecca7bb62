//! Filename and attribute codecs, and directory stream decoding.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use rand::RngCore;
use tracing::{debug, warn};

use boxtin_protocol::mode::FileMode;
use boxtin_protocol::streams::{
    AttributeRecord, DirEntryHeader, DirStreamHeader, ATTRIBUTE_TYPE_GENERIC_UNIX, DIR_MAGIC,
};
use boxtin_protocol::{Error, WireRecord};

use crate::crypto::CipherSuite;
use crate::file::{wire_micros, wire_time, RemoteEntry};
use crate::stream::StreamReader;

/// The filename length field is 14 bits wide.
pub const MAX_FILENAME_ENCODED: usize = (1 << 14) - 1;

const FILENAME_ENCODING_CLEAR: u16 = 1;
const FILENAME_ENCODING_BLOWFISH: u16 = 2;
const ATTRIBUTE_ENCODING_BLOWFISH: u8 = 2;

/// Some directory streams pad the attribute block with filler bytes;
/// give up after this many to avoid walking a corrupt stream forever.
const MAX_ATTRIBUTE_PREFILLER: usize = 16;

/// Encodes a filename: a little-endian `u16` of `total_len << 2 | 2`
/// followed by the Blowfish ciphertext. The length includes the two
/// header bytes.
pub fn write_filename(crypt: &CipherSuite, name: &str) -> Result<Vec<u8>, Error> {
    let ciphertext = crypt.encrypt_filename(name.as_bytes())?;
    let total = 2 + ciphertext.len();
    if total > MAX_FILENAME_ENCODED {
        return Err(Error::FilenameTooLong(total));
    }
    let header = (total as u16) << 2 | FILENAME_ENCODING_BLOWFISH;
    let mut out = Vec::with_capacity(total);
    let mut raw = [0u8; 2];
    LittleEndian::write_u16(&mut raw, header);
    out.extend_from_slice(&raw);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn read_filename<T: Read>(
    crypt: &CipherSuite,
    rd: &mut StreamReader<T>,
) -> Result<String, Error> {
    let mut raw = [0u8; 2];
    rd.read_exact(&mut raw)?;
    let header = LittleEndian::read_u16(&raw);
    let encoding = header & 0x3;
    let total = (header >> 2) as usize;
    if total < 2 {
        return Err(Error::ProtocolViolation(format!(
            "filename length {total} does not cover its own header"
        )));
    }
    let mut payload = vec![0u8; total - 2];
    rd.read_exact(&mut payload)?;
    debug!(len = payload.len(), encoding, "read filename");

    let clear = match encoding {
        FILENAME_ENCODING_CLEAR => payload,
        FILENAME_ENCODING_BLOWFISH => crypt.decrypt_filename(&payload)?,
        other => {
            return Err(Error::ProtocolViolation(format!(
                "unknown filename encoding {other}"
            )))
        }
    };
    String::from_utf8(clear)
        .map_err(|_| Error::ProtocolViolation("filename is not valid UTF-8".into()))
}

/// Encodes an attribute block: a big-endian `u32` size, the encoding
/// byte, then `iv || ciphertext` under a fresh 8-byte IV. A symlink
/// target or opaque xattr blob is carried after the packed record.
pub fn write_attributes(crypt: &CipherSuite, entry: &RemoteEntry) -> Result<Vec<u8>, Error> {
    let record = AttributeRecord {
        attribute_type: ATTRIBUTE_TYPE_GENERIC_UNIX,
        uid: entry.uid,
        gid: entry.gid,
        modification_time: wire_micros(entry.modified_at),
        attr_modification_time: wire_micros(entry.attributes_modified_at),
        user_defined_flags: entry.user_flags,
        file_generation_number: entry.generation,
        mode: entry.mode.to_wire(),
    };
    let mut plain = record.encode();
    if let Some(target) = &entry.symlink_target {
        plain.extend_from_slice(target.as_bytes());
    } else if let Some(xattrs) = &entry.xattrs {
        plain.extend_from_slice(xattrs);
    }

    let mut iv = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut iv);
    let encrypted = crypt.encrypt_attributes(&plain, &iv)?;

    let mut out = Vec::with_capacity(4 + 1 + encrypted.len());
    let mut size = [0u8; 4];
    BigEndian::write_i32(&mut size, (1 + encrypted.len()) as i32);
    out.extend_from_slice(&size);
    out.push(ATTRIBUTE_ENCODING_BLOWFISH);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Decodes the next attribute block into `entry`.
///
/// The block may be preceded by filler: bytes are skipped while the
/// peeked big-endian length could not fit in the stream's remainder.
pub fn read_attributes<T: Read>(
    crypt: &CipherSuite,
    rd: &mut StreamReader<T>,
    entry: &mut RemoteEntry,
) -> Result<(), Error> {
    let mut skipped = Vec::new();
    loop {
        let declared = BigEndian::read_u32(rd.peek(4)?);
        if u64::from(declared) < u64::from(rd.remaining()) {
            break;
        }
        if skipped.len() >= MAX_ATTRIBUTE_PREFILLER {
            return Err(Error::ProtocolViolation(format!(
                "no attribute block within {MAX_ATTRIBUTE_PREFILLER} bytes of filler"
            )));
        }
        let mut byte = [0u8; 1];
        rd.read_exact(&mut byte)?;
        skipped.push(byte[0]);
    }
    if !skipped.is_empty() {
        warn!(?skipped, "skipped filler bytes before an attribute block");
    }

    let mut raw = [0u8; 4];
    rd.read_exact(&mut raw)?;
    let size = BigEndian::read_i32(&raw);
    if size <= 0 {
        return Ok(());
    }

    let mut encoding = [0u8; 1];
    rd.read_exact(&mut encoding)?;
    if encoding[0] != ATTRIBUTE_ENCODING_BLOWFISH {
        return Err(Error::ProtocolViolation(format!(
            "unknown attribute encoding {}",
            encoding[0]
        )));
    }
    let mut ciphertext = vec![0u8; size as usize - 1];
    rd.read_exact(&mut ciphertext)?;

    let plain = crypt.decrypt_attributes(&ciphertext)?;
    let record = AttributeRecord::decode(&plain).map_err(|_| {
        Error::ProtocolViolation("attribute block shorter than its record".into())
    })?;
    if record.attribute_type != ATTRIBUTE_TYPE_GENERIC_UNIX {
        return Err(Error::ProtocolViolation(format!(
            "unknown attribute type {}",
            record.attribute_type
        )));
    }

    entry.uid = record.uid;
    entry.gid = record.gid;
    entry.mode = FileMode::from_wire(record.mode);
    entry.modified_at = wire_time(record.modification_time);
    entry.attributes_modified_at = wire_time(record.attr_modification_time);
    entry.user_flags = record.user_defined_flags;
    entry.generation = record.file_generation_number;

    let tail = &plain[AttributeRecord::WIRE_SIZE..];
    if !tail.is_empty() {
        if entry.mode.is_symlink() {
            entry.symlink_target = Some(String::from_utf8_lossy(tail).into_owned());
            debug!(symlink = ?entry.symlink_target, "read symlink target");
        } else {
            debug!(len = tail.len(), "preserving opaque extended attribute data");
            entry.xattrs = Some(tail.to_vec());
        }
    }
    Ok(())
}

/// Decodes a `DIR_` stream: the directory header, its own attribute
/// block, then one `{entry header, filename, attributes}` group per
/// entry. Returns the directory itself and its entries.
pub fn read_dir_stream<T: Read>(
    crypt: &CipherSuite,
    rd: &mut StreamReader<T>,
) -> Result<(RemoteEntry, Vec<RemoteEntry>), Error> {
    let header: DirStreamHeader = rd.read_record()?;
    if header.magic != DIR_MAGIC {
        return Err(Error::ProtocolViolation(format!(
            "directory stream has magic {:#x}",
            header.magic
        )));
    }
    debug!(
        object = %header.object_id,
        entries = header.num_entries,
        "directory stream"
    );

    let mut dir = RemoteEntry {
        id: header.object_id,
        parent_id: header.container_id,
        attributes_modified_at: wire_time(header.attributes_mod_time),
        ..RemoteEntry::default()
    };
    read_attributes(crypt, rd, &mut dir)?;

    let mut entries = Vec::new();
    for _ in 0..header.num_entries {
        let entry_header: DirEntryHeader = rd.read_record()?;
        let name = read_filename(crypt, rd)?;
        let mut entry = RemoteEntry {
            name,
            id: entry_header.object_id,
            parent_id: header.object_id,
            size_in_blocks: entry_header.size_in_blocks,
            flags: entry_header.flags,
            modified_at: wire_time(entry_header.modification_time),
            ..RemoteEntry::default()
        };
        read_attributes(crypt, rd, &mut entry)?;
        entries.push(entry);
    }
    Ok((dir, entries))
}
