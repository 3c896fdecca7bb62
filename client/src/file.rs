//! Reading and writing encoded files.
//!
//! Downloads arrive in one of two layouts: stream order (`bidx` first,
//! used by `GetFile`) decodes blocks as they arrive; store order
//! (`file` first, used by `GetObject`) carries the index at the end, so
//! the data region is buffered before any block can be decoded.
//! Uploads are chunked, checksummed, optionally compressed, encrypted,
//! and shipped as a single store-order stream body.

use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, warn};

use md5::{Digest, Md5};

use boxtin_protocol::mode::{FileKind, FileMode};
use boxtin_protocol::streams::{
    BlockIndexEntry, BlockIndexHeader, FileStreamHeader, FILE_MAGIC, INDEX_MAGIC,
};
use boxtin_protocol::{Error, GetFile, GetObject, ObjectId, StoreFile, WireRecord};

use crate::blocks::{decode_block, encode_block, rolling_checksum, BlockIndex};
use crate::chunker::Chunker;
use crate::codec::{read_attributes, read_dir_stream, read_filename, write_attributes, write_filename};
use crate::connection::Connection;
use crate::crypto::CipherSuite;
use crate::stream::StreamReader;

/// Chunker parameters for uploads: mean chunk size and its hard cap.
const CHUNK_MEAN: u32 = 8192;
const CHUNK_MAX: u32 = 3 * CHUNK_MEAN;

/// Converts a wire time in microseconds since the epoch.
pub fn wire_time(micros: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros as i64).unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn wire_micros(time: DateTime<Utc>) -> u64 {
    time.timestamp_micros().max(0) as u64
}

/// A stored file or directory as described by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub id: ObjectId,
    pub parent_id: ObjectId,
    pub size_in_blocks: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: FileMode,
    /// `FLAG_*` bits from the directory entry.
    pub flags: i16,
    pub modified_at: DateTime<Utc>,
    pub attributes_modified_at: DateTime<Utc>,
    pub user_flags: u32,
    pub generation: u32,
    pub symlink_target: Option<String>,
    /// Opaque extended-attribute data, preserved verbatim.
    pub xattrs: Option<Vec<u8>>,
}

impl Default for RemoteEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: ObjectId::UNSET,
            parent_id: ObjectId::UNSET,
            size_in_blocks: 0,
            uid: 0,
            gid: 0,
            mode: FileMode::default(),
            flags: 0,
            modified_at: DateTime::UNIX_EPOCH,
            attributes_modified_at: DateTime::UNIX_EPOCH,
            user_flags: 0,
            generation: 0,
            symlink_target: None,
            xattrs: None,
        }
    }
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.flags & boxtin_protocol::FLAG_DIR != 0 || self.mode.is_dir()
    }
}

/// An object fetched in store order.
#[derive(Debug)]
pub enum Object {
    File {
        entry: RemoteEntry,
        data: Vec<u8>,
    },
    Directory {
        entry: RemoteEntry,
        entries: Vec<RemoteEntry>,
    },
}

/// An open download. Owns the sideband stream; the connection is free
/// again once the reader is closed or dropped.
pub struct FileReader<'a, T> {
    stream: StreamReader<'a, T>,
    crypt: Arc<CipherSuite>,
    entry: RemoteEntry,
    index: BlockIndex,
    tolerance: u16,
    current_block: usize,
    buffered: Vec<u8>,
    buffered_pos: usize,
}

impl<T: Read + Write> Connection<T> {
    /// Issues `GetFile` and positions the reader after the block index,
    /// file header, filename, and attributes of the stream-order reply.
    pub fn open_file(
        &mut self,
        dir_id: ObjectId,
        object_id: ObjectId,
    ) -> Result<FileReader<'_, T>, Error> {
        self.execute(
            &GetFile {
                in_directory: dir_id,
                object_id,
            },
            None,
            None,
        )?
        .into_success()?;

        let crypt = self.crypt.clone();
        let tolerance = self.weak_checksum_tolerance;
        let mut stream = self.get_stream()?;

        let magic = stream.peek(4)?;
        if magic != INDEX_MAGIC.to_be_bytes() {
            return Err(Error::ProtocolViolation(format!(
                "file stream opens with magic {magic:02x?}"
            )));
        }
        let index = BlockIndex::read(&crypt, &mut stream)?;

        let header: FileStreamHeader = stream.read_record()?;
        if header.magic != FILE_MAGIC {
            return Err(Error::ProtocolViolation(format!(
                "file header has magic {:#x}",
                header.magic
            )));
        }
        if header.num_blocks != index.num_blocks() {
            return Err(Error::ProtocolViolation(format!(
                "file header claims {} blocks, index claims {}",
                header.num_blocks,
                index.num_blocks()
            )));
        }

        let mut entry = RemoteEntry {
            id: object_id,
            parent_id: header.container_id,
            size_in_blocks: header.num_blocks,
            modified_at: wire_time(header.modification_time.max(0) as u64),
            ..RemoteEntry::default()
        };
        entry.name = read_filename(&crypt, &mut stream)?;
        read_attributes(&crypt, &mut stream, &mut entry)?;
        debug!(name = %entry.name, blocks = header.num_blocks, "opened file");

        Ok(FileReader {
            stream,
            crypt,
            entry,
            index,
            tolerance,
            current_block: 0,
            buffered: Vec::new(),
            buffered_pos: 0,
        })
    }
}

impl<T: Read> FileReader<'_, T> {
    pub fn entry(&self) -> &RemoteEntry {
        &self.entry
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    /// Copies decoded plaintext into `buf`, decoding further blocks
    /// lazily. Returns zero at end of data.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut copied = 0;
        while copied < buf.len() {
            if self.buffered_pos < self.buffered.len() {
                let available = &self.buffered[self.buffered_pos..];
                let take = available.len().min(buf.len() - copied);
                buf[copied..copied + take].copy_from_slice(&available[..take]);
                self.buffered_pos += take;
                copied += take;
                continue;
            }
            if !self.load_next_block()? {
                break;
            }
        }
        Ok(copied)
    }

    pub fn read_to_end(&mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Drains whatever is left of the stream so the connection is ready
    /// for the next command.
    pub fn close(mut self) -> Result<(), Error> {
        let discarded = self.stream.drain()?;
        if discarded > 0 {
            debug!(discarded, "discarded unread stream bytes on close");
        }
        Ok(())
    }

    fn load_next_block(&mut self) -> Result<bool, Error> {
        loop {
            if self.current_block >= self.index.entries.len() {
                return Ok(false);
            }
            let block = self.current_block;
            let size = self.index.sizes[block];
            self.current_block += 1;

            if size <= 0 {
                match self.fetch_foreign_block(self.index.header.other_file_id, size)? {
                    Some(data) => {
                        self.buffered = data;
                        self.buffered_pos = 0;
                        return Ok(true);
                    }
                    None => continue,
                }
            }

            let mut raw = vec![0u8; size as usize];
            self.stream.read_exact(&mut raw)?;
            self.buffered = decode_block(
                &self.crypt,
                &raw,
                &self.index.entries[block],
                block as u64,
                self.tolerance,
            )?;
            self.buffered_pos = 0;
            return Ok(true);
        }
    }

    /// Resolution hook for blocks referenced from another file's index
    /// (`size <= 0` entries). Substituting the referenced block would
    /// require a secondary fetch against `other_file_id`; for now such
    /// blocks are reported and skipped.
    fn fetch_foreign_block(
        &mut self,
        other_file_id: ObjectId,
        block_ref: i64,
    ) -> Result<Option<Vec<u8>>, Error> {
        warn!(
            other_file = %other_file_id,
            block = -block_ref,
            "skipping reference to a block of another file"
        );
        Ok(None)
    }
}

/// An upload in progress. Bytes fed to `write` pass through the
/// chunker; `commit` assembles the store-order stream and ships it.
pub struct FileWriter {
    crypt: Arc<CipherSuite>,
    name: String,
    dir_id: ObjectId,
    entry: RemoteEntry,
    attributes_hash: i64,
    chunker: Chunker,
    chunks: Vec<Vec<u8>>,
}

impl<T: Read + Write> Connection<T> {
    /// Starts an upload into `dir_id`. The chunker is keyed with a
    /// fresh random secret per file.
    pub fn create_file(
        &mut self,
        dir_id: ObjectId,
        name: &str,
        modified_at: DateTime<Utc>,
        uid: u32,
        gid: u32,
    ) -> Result<FileWriter, Error> {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let chunker = Chunker::new(&key, CHUNK_MEAN, CHUNK_MAX)?;
        Ok(FileWriter {
            crypt: self.crypt.clone(),
            name: name.to_string(),
            dir_id,
            entry: RemoteEntry {
                name: name.to_string(),
                parent_id: dir_id,
                uid,
                gid,
                mode: FileMode::new(FileKind::Regular, 0o600),
                modified_at,
                attributes_modified_at: modified_at,
                ..RemoteEntry::default()
            },
            attributes_hash: 0,
            chunker,
            chunks: Vec::new(),
        })
    }
}

impl FileWriter {
    pub fn set_mode(&mut self, mode: FileMode) {
        self.entry.mode = mode;
    }

    pub fn set_attributes_hash(&mut self, hash: i64) {
        self.attributes_hash = hash;
    }

    pub fn write(&mut self, data: &[u8]) {
        self.chunker.write(data);
        self.chunks.append(&mut self.chunker.take_chunks());
    }

    /// Encodes all chunks and sends the whole file as the stream body
    /// of a `StoreFile` command. Returns the new object.
    pub fn commit<T: Read + Write>(self, conn: &mut Connection<T>) -> Result<ObjectId, Error> {
        let FileWriter {
            crypt,
            name,
            dir_id,
            entry,
            attributes_hash,
            chunker,
            mut chunks,
        } = self;
        chunks.extend(chunker.finish());

        let mut index = BlockIndex {
            header: BlockIndexHeader {
                magic: INDEX_MAGIC,
                other_file_id: ObjectId::UNSET,
                entry_iv_base: [0u8; 8],
                num_blocks: chunks.len() as i64,
            },
            sizes: Vec::with_capacity(chunks.len()),
            entries: Vec::with_capacity(chunks.len()),
        };
        rand::thread_rng().fill_bytes(&mut index.header.entry_iv_base);

        let mut blocks = Vec::with_capacity(chunks.len());
        let mut max_clear_size = 0i32;
        for chunk in &chunks {
            let encoded = encode_block(&crypt, chunk)?;
            max_clear_size = max_clear_size.max(encoded.entry.size);
            index.sizes.push(encoded.encoded_size());
            index.entries.push(encoded.entry);
            blocks.push(encoded.payload);
        }

        let modification_time = wire_micros(entry.modified_at) as i64;
        let header = FileStreamHeader {
            magic: FILE_MAGIC,
            num_blocks: chunks.len() as i64,
            container_id: dir_id,
            modification_time,
            max_block_clear_size: max_clear_size,
            options: 0,
        };

        let filename = write_filename(&crypt, &name)?;
        let attributes = write_attributes(&crypt, &entry)?;

        let mut body = Vec::new();
        header.encode_into(&mut body);
        body.extend_from_slice(&filename);
        body.extend_from_slice(&attributes);
        for block in &blocks {
            body.extend_from_slice(block);
        }
        index.encode_into(&crypt, &mut body)?;
        debug!(
            name = %name,
            blocks = chunks.len(),
            bytes = body.len(),
            "committing file"
        );

        let success = conn
            .execute(
                &StoreFile {
                    directory_object_id: dir_id,
                    modification_time,
                    attributes_hash,
                    diff_from_file_id: ObjectId::UNSET,
                },
                Some(&filename),
                Some(&body),
            )?
            .into_success()?;
        Ok(success.object_id)
    }
}

impl<T: Read + Write> Connection<T> {
    /// Uploads `content` as a single uncompressed block, bypassing the
    /// chunker. Intended for small payloads.
    pub fn store_small_file(
        &mut self,
        dir_id: ObjectId,
        modification_time: i64,
        attributes_hash: i64,
        name: &str,
        content: &[u8],
    ) -> Result<ObjectId, Error> {
        let crypt = self.crypt.clone();
        let filename = write_filename(&crypt, name)?;
        let attributes = write_attributes(&crypt, &RemoteEntry::default())?;

        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = crypt.encrypt_file_data(content, &iv)?;

        let mut index = BlockIndex {
            header: BlockIndexHeader {
                magic: INDEX_MAGIC,
                other_file_id: ObjectId::UNSET,
                entry_iv_base: [0u8; 8],
                num_blocks: 1,
            },
            sizes: vec![1 + ciphertext.len() as i64],
            entries: vec![BlockIndexEntry {
                size: content.len() as i32,
                weak_checksum: rolling_checksum(content),
                strong_checksum: Md5::digest(content).into(),
            }],
        };
        rand::thread_rng().fill_bytes(&mut index.header.entry_iv_base);

        let header = FileStreamHeader {
            magic: FILE_MAGIC,
            num_blocks: 1,
            container_id: dir_id,
            modification_time,
            max_block_clear_size: content.len() as i32,
            options: 0,
        };

        let mut body = Vec::new();
        header.encode_into(&mut body);
        body.extend_from_slice(&filename);
        body.extend_from_slice(&attributes);
        body.push(0b10);
        body.extend_from_slice(&ciphertext);
        index.encode_into(&crypt, &mut body)?;

        let success = self
            .execute(
                &StoreFile {
                    directory_object_id: dir_id,
                    modification_time,
                    attributes_hash,
                    diff_from_file_id: ObjectId::UNSET,
                },
                Some(&filename),
                Some(&body),
            )?
            .into_success()?;
        Ok(success.object_id)
    }

    /// Fetches an object in store order and decodes it fully: a file's
    /// data region is buffered until its trailing index arrives, a
    /// directory decodes as its entry list.
    pub fn read_object(&mut self, object_id: ObjectId) -> Result<Object, Error> {
        self.execute(&GetObject { object_id }, None, None)?
            .into_success()?;

        let crypt = self.crypt.clone();
        let tolerance = self.weak_checksum_tolerance;
        let mut stream = self.get_stream()?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(stream.peek(4)?);
        let object = match &magic {
            b"file" => read_store_order_file(&crypt, &mut stream, object_id, tolerance)?,
            b"bidx" => read_stream_order_file(&crypt, &mut stream, object_id, tolerance)?,
            b"DIR_" => {
                let (mut entry, entries) = read_dir_stream(&crypt, &mut stream)?;
                entry.id = object_id;
                Object::Directory { entry, entries }
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown stream magic {other:02x?}"
                )))
            }
        };

        let leftover = stream.drain()?;
        if leftover > 0 {
            warn!(leftover, "stream not fully consumed by object decoding");
        }
        Ok(object)
    }
}

fn read_file_metadata<T: Read>(
    crypt: &CipherSuite,
    stream: &mut StreamReader<T>,
    object_id: ObjectId,
) -> Result<(FileStreamHeader, RemoteEntry), Error> {
    let header: FileStreamHeader = stream.read_record()?;
    if header.magic != FILE_MAGIC {
        return Err(Error::ProtocolViolation(format!(
            "file header has magic {:#x}",
            header.magic
        )));
    }
    let mut entry = RemoteEntry {
        id: object_id,
        parent_id: header.container_id,
        size_in_blocks: header.num_blocks,
        modified_at: wire_time(header.modification_time.max(0) as u64),
        ..RemoteEntry::default()
    };
    entry.name = read_filename(crypt, stream)?;
    read_attributes(crypt, stream, &mut entry)?;
    Ok((header, entry))
}

/// Store order: header, filename, attributes, inline blocks, index.
/// The data region length is everything left minus the index.
fn read_store_order_file<T: Read>(
    crypt: &CipherSuite,
    stream: &mut StreamReader<T>,
    object_id: ObjectId,
    tolerance: u16,
) -> Result<Object, Error> {
    let (header, entry) = read_file_metadata(crypt, stream, object_id)?;

    let index_size = BlockIndex::wire_size(header.num_blocks) as u64;
    let data_size = u64::from(stream.remaining())
        .checked_sub(index_size)
        .ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "stream too short for a {} block index",
                header.num_blocks
            ))
        })?;
    let mut data_region = vec![0u8; data_size as usize];
    stream.read_exact(&mut data_region)?;

    let index = BlockIndex::read(crypt, stream)?;
    if index.num_blocks() != header.num_blocks {
        return Err(Error::ProtocolViolation(format!(
            "file header claims {} blocks, index claims {}",
            header.num_blocks,
            index.num_blocks()
        )));
    }

    let mut data = Vec::new();
    let mut offset = 0usize;
    for (block, (&size, index_entry)) in index.sizes.iter().zip(&index.entries).enumerate() {
        if size <= 0 {
            warn!(
                other_file = %index.header.other_file_id,
                block = -size,
                "skipping reference to a block of another file"
            );
            continue;
        }
        let end = offset + size as usize;
        let raw = data_region.get(offset..end).ok_or_else(|| {
            Error::ProtocolViolation("block sizes overrun the data region".into())
        })?;
        offset = end;
        data.extend_from_slice(&decode_block(
            crypt,
            raw,
            index_entry,
            block as u64,
            tolerance,
        )?);
    }
    Ok(Object::File { entry, data })
}

/// Stream order: index, header, filename, attributes, inline blocks.
fn read_stream_order_file<T: Read>(
    crypt: &CipherSuite,
    stream: &mut StreamReader<T>,
    object_id: ObjectId,
    tolerance: u16,
) -> Result<Object, Error> {
    let index = BlockIndex::read(crypt, stream)?;
    let (header, entry) = read_file_metadata(crypt, stream, object_id)?;
    if header.num_blocks != index.num_blocks() {
        return Err(Error::ProtocolViolation(format!(
            "file header claims {} blocks, index claims {}",
            header.num_blocks,
            index.num_blocks()
        )));
    }

    let mut data = Vec::new();
    for (block, (&size, index_entry)) in index.sizes.iter().zip(&index.entries).enumerate() {
        if size <= 0 {
            warn!(
                other_file = %index.header.other_file_id,
                block = -size,
                "skipping reference to a block of another file"
            );
            continue;
        }
        let mut raw = vec![0u8; size as usize];
        stream.read_exact(&mut raw)?;
        data.extend_from_slice(&decode_block(
            crypt,
            raw.as_slice(),
            index_entry,
            block as u64,
            tolerance,
        )?);
    }
    Ok(Object::File { entry, data })
}
