//! Sub-headers carried inside sideband streams: encoded files, block
//! indexes, and directory listings.

use crate::wire::wire_record;
use crate::ObjectId;

/// Magic of an encoded file header ("file"), also its version.
pub const FILE_MAGIC: i32 = 0x6669_6C65;
/// Magic of a directory stream ("DIR_").
pub const DIR_MAGIC: i32 = 0x4449_525F;
/// Magic of a block index ("bidx").
pub const INDEX_MAGIC: i32 = 0x6269_6478;

/// Attribute record type for generic Unix attributes.
pub const ATTRIBUTE_TYPE_GENERIC_UNIX: i32 = 1;

wire_record! {
    /// Header of an encoded file.
    ///
    /// In store order it opens the stream and the block index trails the
    /// data; in stream order the block index comes first instead.
    /// An encrypted filename follows, then an attribute block.
    pub struct FileStreamHeader {
        pub magic: i32,
        pub num_blocks: i64,
        pub container_id: ObjectId,
        /// Microseconds since the epoch.
        pub modification_time: i64,
        /// Largest clear size of any block in the file.
        pub max_block_clear_size: i32,
        pub options: i32,
    }
}

wire_record! {
    /// Header of a block index.
    pub struct BlockIndexHeader {
        pub magic: i32,
        /// File whose blocks may be referenced by negative size entries;
        /// zero for self-contained files.
        pub other_file_id: ObjectId,
        /// IV for the per-entry encryption below.
        pub entry_iv_base: [u8; 8],
        pub num_blocks: i64,
    }
}

wire_record! {
    /// One decrypted block index entry. On the wire each entry is
    /// preceded by an 8-byte size (or back-reference when non-positive)
    /// and encrypted under the block-index key.
    pub struct BlockIndexEntry {
        /// Clear (decrypted, decompressed) size of the block.
        pub size: i32,
        pub weak_checksum: u32,
        /// MD5 of the block plaintext.
        pub strong_checksum: [u8; 16],
    }
}

wire_record! {
    /// Header of a directory stream. Followed by the directory's own
    /// attribute block, then `num_entries` entries.
    pub struct DirStreamHeader {
        pub magic: i32,
        pub num_entries: i32,
        pub object_id: ObjectId,
        pub container_id: ObjectId,
        pub attributes_mod_time: u64,
        pub options_present: i32,
    }
}

wire_record! {
    /// One directory entry. Followed by an encoded filename and an
    /// attribute block.
    pub struct DirEntryHeader {
        pub modification_time: u64,
        pub object_id: ObjectId,
        pub size_in_blocks: i64,
        pub attributes_hash: u64,
        pub flags: i16,
    }
}

wire_record! {
    /// Plaintext of an attribute block (`ATTRIBUTE_TYPE_GENERIC_UNIX`).
    ///
    /// A symlink target or an opaque extended-attribute blob may trail
    /// the record.
    pub struct AttributeRecord {
        pub attribute_type: i32,
        pub uid: u32,
        pub gid: u32,
        /// Microseconds since the epoch.
        pub modification_time: u64,
        /// Microseconds since the epoch.
        pub attr_modification_time: u64,
        pub user_defined_flags: u32,
        pub file_generation_number: u32,
        pub mode: u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireRecord;

    #[test]
    fn magics_spell_their_names() {
        assert_eq!(&FILE_MAGIC.to_be_bytes(), b"file");
        assert_eq!(&DIR_MAGIC.to_be_bytes(), b"DIR_");
        assert_eq!(&INDEX_MAGIC.to_be_bytes(), b"bidx");
    }

    #[test]
    fn record_sizes_match_the_wire_layout() {
        assert_eq!(FileStreamHeader::WIRE_SIZE, 36);
        assert_eq!(BlockIndexHeader::WIRE_SIZE, 28);
        assert_eq!(BlockIndexEntry::WIRE_SIZE, 24);
        assert_eq!(DirStreamHeader::WIRE_SIZE, 36);
        assert_eq!(DirEntryHeader::WIRE_SIZE, 34);
        assert_eq!(AttributeRecord::WIRE_SIZE, 38);
    }
}
