//! Session tests against a scripted transport: canned server bytes in,
//! every written byte checked against what the protocol requires.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use boxtin::blocks::{rolling_checksum, BlockIndex};
use boxtin::codec::write_filename;
use boxtin::file::wire_time;
use boxtin::{CipherSuite, Connection, KeyBundle, Object, RemoteEntry, StreamReader};
use boxtin_protocol::mode::{FileKind, FileMode};
use boxtin_protocol::streams::{
    AttributeRecord, DirEntryHeader, DirStreamHeader, FileStreamHeader, DIR_MAGIC, FILE_MAGIC,
};
use boxtin_protocol::{
    Error, ErrorReply, Header, LoginConfirmed, ObjectId, ServerErrorKind, StoreFile, Success,
    WireRecord, FLAG_DIR, FLAG_FILE, HANDSHAKE_LEN, HANDSHAKE_MAGIC, STREAM_FRAME,
};

struct ReplayTransport {
    reads: Cursor<Vec<u8>>,
    written: Vec<u8>,
}

impl ReplayTransport {
    fn new(reads: Vec<u8>) -> Self {
        Self {
            reads: Cursor::new(reads),
            written: Vec::new(),
        }
    }
}

impl Read for ReplayTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reads.read(buf)
    }
}

impl Write for ReplayTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn suite() -> Arc<CipherSuite> {
    let material: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    Arc::new(CipherSuite::new(KeyBundle::from_bytes(&material).unwrap()))
}

fn handshake() -> Vec<u8> {
    let mut hello = vec![0u8; HANDSHAKE_LEN];
    hello[..HANDSHAKE_MAGIC.len()].copy_from_slice(HANDSHAKE_MAGIC);
    hello
}

fn frame(command: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Header {
        size: (Header::WIRE_SIZE + body.len()) as u32,
        command,
    }
    .encode();
    out.extend_from_slice(body);
    out
}

fn stream_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Header {
        size: body.len() as u32,
        command: STREAM_FRAME,
    }
    .encode();
    out.extend_from_slice(body);
    out
}

#[test]
fn handshake_and_version_bytes_are_exact() {
    let mut reads = handshake();
    reads.extend(frame(1, &[0, 0, 0, 1]));
    let mut transport = ReplayTransport::new(reads);

    let mut conn = Connection::new(&mut transport, suite());
    assert_eq!(conn.check_version(1).unwrap(), 1);
    drop(conn);

    let mut expected = handshake();
    expected.extend([0, 0, 0, 12, 0, 0, 0, 1, 0, 0, 0, 1]);
    assert_eq!(transport.written, expected);
}

#[test]
fn handshake_mismatch_fails() {
    let mut reads = handshake();
    reads[0] ^= 0xFF;
    let mut transport = ReplayTransport::new(reads);
    let mut conn = Connection::new(&mut transport, suite());
    assert!(matches!(conn.check_version(1), Err(Error::HandshakeFailed)));
}

#[test]
fn login_roundtrips_its_confirmation() {
    let confirmed = LoginConfirmed {
        client_store_marker: 0x0102030405060708,
        blocks_used: 2000,
        blocks_soft_limit: 3000,
        blocks_hard_limit: 4000,
    };
    let mut reads = handshake();
    reads.extend(frame(3, &confirmed.encode()));
    let mut transport = ReplayTransport::new(reads);

    let mut conn = Connection::new(&mut transport, suite());
    let reply = conn.login(1, true).unwrap();
    assert_eq!(reply, confirmed);
    drop(conn);

    // Login frame: size 16, command 2, client 1, read-only flag.
    let request = &transport.written[HANDSHAKE_LEN..];
    assert_eq!(
        request,
        [0, 0, 0, 16, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 1]
    );
}

#[test]
fn every_server_error_subtype_maps_to_its_kind() {
    let expected = [
        ServerErrorKind::WrongVersion,
        ServerErrorKind::NotInRightProtocolPhase,
        ServerErrorKind::BadLogin,
        ServerErrorKind::CannotLockStoreForWriting,
        ServerErrorKind::SessionReadOnly,
        ServerErrorKind::FileDoesNotVerify,
        ServerErrorKind::DoesNotExist,
        ServerErrorKind::DirectoryAlreadyExists,
        ServerErrorKind::CannotDeleteRoot,
        ServerErrorKind::TargetNameExists,
        ServerErrorKind::StorageLimitExceeded,
        ServerErrorKind::DiffFromFileDoesNotExist,
        ServerErrorKind::DoesNotExistInDirectory,
        ServerErrorKind::PatchConsistencyError,
        ServerErrorKind::MultiplyReferencedObject,
        ServerErrorKind::DisabledAccount,
    ];
    for (subtype, kind) in (1..=16).zip(expected) {
        let error = ErrorReply {
            error_type: 1000,
            error_subtype: subtype,
        };
        let mut reads = handshake();
        reads.extend(frame(0, &error.encode()));
        let mut transport = ReplayTransport::new(reads);
        let mut conn = Connection::new(&mut transport, suite());
        match conn.check_version(1) {
            Err(Error::Server(got)) => assert_eq!(got, kind),
            other => panic!("expected a server error, got {other:?}"),
        }
    }

    let error = ErrorReply {
        error_type: 7,
        error_subtype: 3,
    };
    let mut reads = handshake();
    reads.extend(frame(0, &error.encode()));
    let mut transport = ReplayTransport::new(reads);
    let mut conn = Connection::new(&mut transport, suite());
    assert!(matches!(
        conn.check_version(1),
        Err(Error::Server(ServerErrorKind::Unknown {
            error_type: 7,
            subtype: 3
        }))
    ));
}

#[test]
fn mismatched_reply_codes_are_rejected() {
    let mut reads = handshake();
    reads.extend(frame(43, &[]));
    let mut transport = ReplayTransport::new(reads);
    let mut conn = Connection::new(&mut transport, suite());
    assert!(matches!(
        conn.check_version(1),
        Err(Error::UnexpectedReply {
            got: 43,
            expected: 1
        })
    ));
}

fn encode_attributes(crypt: &CipherSuite, entry: &RemoteEntry) -> Vec<u8> {
    boxtin::codec::write_attributes(crypt, entry).unwrap()
}

#[test]
fn list_directory_decodes_entries() {
    let crypt = suite();

    let mut listing = DirStreamHeader {
        magic: DIR_MAGIC,
        num_entries: 2,
        object_id: ObjectId::ROOT,
        container_id: ObjectId::UNSET,
        attributes_mod_time: 1_700_000_000_000_000,
        options_present: 0,
    }
    .encode();
    listing.extend(encode_attributes(
        &crypt,
        &RemoteEntry {
            mode: FileMode::new(FileKind::Directory, 0o700),
            ..RemoteEntry::default()
        },
    ));

    listing.extend(
        DirEntryHeader {
            modification_time: 1_700_000_100_000_000,
            object_id: ObjectId(0x20),
            size_in_blocks: 3,
            attributes_hash: 99,
            flags: FLAG_FILE,
        }
        .encode(),
    );
    listing.extend(write_filename(&crypt, "hello.txt").unwrap());
    listing.extend(encode_attributes(
        &crypt,
        &RemoteEntry {
            uid: 1000,
            gid: 100,
            mode: FileMode::new(FileKind::Regular, 0o644),
            ..RemoteEntry::default()
        },
    ));

    listing.extend(
        DirEntryHeader {
            modification_time: 1_700_000_200_000_000,
            object_id: ObjectId(0x21),
            size_in_blocks: 1,
            attributes_hash: 100,
            flags: FLAG_DIR,
        }
        .encode(),
    );
    listing.extend(write_filename(&crypt, "nested").unwrap());
    listing.extend(encode_attributes(
        &crypt,
        &RemoteEntry {
            mode: FileMode::new(FileKind::Directory, 0o755),
            ..RemoteEntry::default()
        },
    ));

    assert_eq!(&listing[..4], b"DIR_");

    let mut reads = handshake();
    reads.extend(frame(5, &Success { object_id: ObjectId::ROOT }.encode()));
    reads.extend(stream_frame(&listing));
    let mut transport = ReplayTransport::new(reads);

    let mut conn = Connection::new(&mut transport, crypt);
    let entries = conn.read_dir(ObjectId::ROOT).unwrap();
    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0].name, "hello.txt");
    assert_eq!(entries[0].id, ObjectId(0x20));
    assert_eq!(entries[0].parent_id, ObjectId::ROOT);
    assert_eq!(entries[0].size_in_blocks, 3);
    assert_eq!(entries[0].uid, 1000);
    assert_eq!(entries[0].mode, FileMode::new(FileKind::Regular, 0o644));
    assert!(!entries[0].is_dir());

    assert_eq!(entries[1].name, "nested");
    assert!(entries[1].is_dir());
    drop(conn);

    // ListDirectory frame: object 1, everything included, attributes on.
    let request = &transport.written[HANDSHAKE_LEN..];
    assert_eq!(
        request,
        [
            0, 0, 0, 21, 0, 0, 0, 21, // size 21, command 21
            0, 0, 0, 0, 0, 0, 0, 1, // root
            0xFF, 0xFF, // FlagsMustBeSet = -1
            0, 0, // FlagsNotToBeSet = 0
            1, // SendAttributes
        ]
    );
}

#[test]
fn store_small_file_emits_the_documented_layout() {
    let crypt = suite();
    let mut reads = handshake();
    reads.extend(frame(5, &Success { object_id: ObjectId(4) }.encode()));
    let mut transport = ReplayTransport::new(reads);

    let mut conn = Connection::new(&mut transport, crypt.clone());
    let stored = conn
        .store_small_file(ObjectId::ROOT, 2, 3, "foo", b"bar")
        .unwrap();
    assert_eq!(stored, ObjectId(4));
    drop(conn);

    let written = &transport.written[HANDSHAKE_LEN..];
    let header = Header::decode(written).unwrap();
    assert_eq!(header.command, 30);

    let body_start = Header::WIRE_SIZE;
    let request = StoreFile::decode(&written[body_start..]).unwrap();
    assert_eq!(request.directory_object_id, ObjectId::ROOT);
    assert_eq!(request.modification_time, 2);
    assert_eq!(request.attributes_hash, 3);
    assert_eq!(request.diff_from_file_id, ObjectId::UNSET);

    // The trailer is the encrypted filename, which is deterministic.
    let trailer = &written[body_start + StoreFile::WIRE_SIZE..header.size as usize];
    let expected_filename = write_filename(&crypt, "foo").unwrap();
    assert_eq!(trailer, expected_filename);

    // Stream frame follows the request.
    let stream_header = Header::decode(&written[header.size as usize..]).unwrap();
    assert_eq!(stream_header.command, STREAM_FRAME);
    let stream = &written[header.size as usize + Header::WIRE_SIZE..];
    assert_eq!(stream.len(), stream_header.size as usize);

    // File header, filename, attribute block, one block, index.
    let file_header = FileStreamHeader::decode(stream).unwrap();
    assert_eq!(file_header.magic, FILE_MAGIC);
    assert_eq!(file_header.num_blocks, 1);
    assert_eq!(file_header.container_id, ObjectId::ROOT);
    assert_eq!(file_header.modification_time, 2);
    assert_eq!(file_header.max_block_clear_size, 3);

    let mut pos = FileStreamHeader::WIRE_SIZE;
    let filename_len = (LittleEndian::read_u16(&stream[pos..]) >> 2) as usize;
    assert_eq!(&stream[pos..pos + filename_len], expected_filename);
    pos += filename_len;

    let attr_size = byteorder::BigEndian::read_u32(&stream[pos..]) as usize;
    let attr_block = &stream[pos + 4 + 1..pos + 4 + attr_size];
    let attr_plain = crypt.decrypt_attributes(attr_block).unwrap();
    let record = AttributeRecord::decode(&attr_plain).unwrap();
    assert_eq!(record.attribute_type, 1);
    pos += 4 + attr_size;

    // One uncompressed AES block: flags byte then iv || ciphertext.
    let index_size = BlockIndex::wire_size(1);
    let block = &stream[pos..stream.len() - index_size];
    assert_eq!(block[0], 0b10);
    assert_eq!(crypt.decrypt_file_data(&block[1..]).unwrap(), b"bar");

    // Trailing index: clear size 3, the documented weak checksum, and
    // MD5("bar").
    let index_bytes = &stream[stream.len() - index_size..];
    let mut cursor = Cursor::new(index_bytes.to_vec());
    let mut reader = StreamReader::new(&mut cursor, index_size as u32);
    let index = BlockIndex::read(&crypt, &mut reader).unwrap();
    assert_eq!(index.num_blocks(), 1);
    assert_eq!(index.sizes[0], block.len() as i64);
    assert_eq!(index.entries[0].size, 3);
    assert_eq!(index.entries[0].weak_checksum, 602 << 16 | 309);
    assert_eq!(index.entries[0].weak_checksum, rolling_checksum(b"bar"));
    assert_eq!(
        index.entries[0].strong_checksum,
        [
            0x37, 0xb5, 0x1d, 0x19, 0x4a, 0x75, 0x13, 0xe4, 0x5b, 0x56, 0xf6, 0x52, 0x4f, 0x2d,
            0x51, 0xf2
        ]
    );
}

fn upload_content() -> Vec<u8> {
    // Half compressible text, half incompressible noise, so both block
    // encodings appear.
    let mut content = b"the quick brown fox jumps over the lazy dog. ".repeat(700);
    let mut noise = vec![0u8; 30_000];
    StdRng::seed_from_u64(42).fill_bytes(&mut noise);
    content.extend(noise);
    content
}

/// Uploads `content` through the chunked writer and returns the stream
/// body that went to the wire.
fn upload_stream_body(crypt: &Arc<CipherSuite>, content: &[u8]) -> Vec<u8> {
    let mut reads = handshake();
    reads.extend(frame(5, &Success { object_id: ObjectId(7) }.encode()));
    let mut transport = ReplayTransport::new(reads);

    let mut conn = Connection::new(&mut transport, crypt.clone());
    let mut writer = conn
        .create_file(
            ObjectId::ROOT,
            "data.bin",
            wire_time(1_700_000_000_000_000),
            1000,
            100,
        )
        .unwrap();
    for piece in content.chunks(4096) {
        writer.write(piece);
    }
    assert_eq!(writer.commit(&mut conn).unwrap(), ObjectId(7));
    drop(conn);

    let written = &transport.written[HANDSHAKE_LEN..];
    let request_header = Header::decode(written).unwrap();
    let stream_header = Header::decode(&written[request_header.size as usize..]).unwrap();
    assert_eq!(stream_header.command, STREAM_FRAME);
    written[request_header.size as usize + Header::WIRE_SIZE..].to_vec()
}

#[test]
fn uploads_read_back_identically_in_both_orders() {
    let crypt = suite();
    let content = upload_content();
    let body = upload_stream_body(&crypt, &content);

    // Store order, as uploaded and as GetObject returns it.
    let mut reads = handshake();
    reads.extend(frame(5, &Success { object_id: ObjectId(7) }.encode()));
    reads.extend(stream_frame(&body));
    let mut transport = ReplayTransport::new(reads);
    let mut conn = Connection::new(&mut transport, crypt.clone());
    let object = conn.read_object(ObjectId(7)).unwrap();
    let Object::File { entry, data } = object else {
        panic!("expected a file");
    };
    assert_eq!(entry.name, "data.bin");
    assert_eq!(entry.uid, 1000);
    assert_eq!(entry.gid, 100);
    assert_eq!(data, content);

    // Stream order is the same bytes with the trailing index rotated to
    // the front, as GetFile returns it.
    let file_header = FileStreamHeader::decode(&body).unwrap();
    let index_size = BlockIndex::wire_size(file_header.num_blocks);
    let index_start = body.len() - index_size;
    let mut rotated = body[index_start..].to_vec();
    rotated.extend_from_slice(&body[..index_start]);

    let mut reads = handshake();
    reads.extend(frame(5, &Success { object_id: ObjectId(7) }.encode()));
    reads.extend(stream_frame(&rotated));
    reads.extend(frame(4, &[]));
    let mut transport = ReplayTransport::new(reads);
    let mut conn = Connection::new(&mut transport, crypt.clone());
    {
        let mut reader = conn.open_file(ObjectId::ROOT, ObjectId(7)).unwrap();
        assert_eq!(reader.entry().name, "data.bin");
        assert_eq!(reader.entry().size_in_blocks, file_header.num_blocks);
        let streamed = reader.read_to_end().unwrap();
        assert_eq!(streamed, content);
        reader.close().unwrap();
    }
    // The stream was fully consumed, so the connection is still in sync
    // for the next command.
    conn.finish().unwrap();
}

#[test]
fn tampered_uploads_fail_the_strong_checksum() {
    let crypt = suite();
    let content = upload_content();
    let mut body = upload_stream_body(&crypt, &content);

    // Corrupt the stored MD5 of the first block: flip a bit inside the
    // last cipher block of its encrypted index entry, which garbles the
    // decrypted digest but leaves the entry's size field intact.
    let file_header = FileStreamHeader::decode(&body).unwrap();
    assert!(file_header.num_blocks > 1);
    let index_start = body.len() - BlockIndex::wire_size(file_header.num_blocks);
    let first_entry = index_start + 28 + 8;
    body[first_entry + 20] ^= 1;

    let mut reads = handshake();
    reads.extend(frame(5, &Success { object_id: ObjectId(7) }.encode()));
    reads.extend(stream_frame(&body));
    let mut transport = ReplayTransport::new(reads);
    let mut conn = Connection::new(&mut transport, crypt);
    assert!(matches!(
        conn.read_object(ObjectId(7)),
        Err(Error::ChecksumFailed { block: 0 })
    ));
}
