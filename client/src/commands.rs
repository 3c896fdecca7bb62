//! Typed operations over the connection, one per protocol command.

use std::io::{Read, Write};

use tracing::{debug, info};

use boxtin_protocol::{
    AccountUsage, AccountUsage2, ChangeDirAttributes, CreateDirectory, CreateDirectory2,
    DeleteDirectory, DeleteFile, Error, Finished, GetAccountUsage, GetAccountUsage2,
    GetBlockIndexByID, GetBlockIndexByName, GetIsAlive, GetObjectName, Login, LoginConfirmed,
    ListDirectory, MoveObject, ObjectId, SetClientStoreMarker, SetReplacementFileAttributes,
    UndeleteDirectory, UndeleteFile, Version, FLAGS_EXCLUDE_NOTHING, FLAGS_INCLUDE_EVERYTHING,
    LOGIN_READ_ONLY,
};

use crate::blocks::BlockIndex;
use crate::codec::{read_dir_stream, read_filename, write_attributes, write_filename};
use crate::connection::Connection;
use crate::file::RemoteEntry;

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: i32 = 1;

impl<T: Read + Write> Connection<T> {
    /// Exchanges protocol versions; returns the store's.
    pub fn check_version(&mut self, version: i32) -> Result<i32, Error> {
        let reply = self
            .execute(&Version { version }, None, None)?
            .into_version()?;
        debug!(version = reply.version, "store version");
        Ok(reply.version)
    }

    pub fn login(&mut self, account: i32, read_only: bool) -> Result<LoginConfirmed, Error> {
        let flags = if read_only { LOGIN_READ_ONLY } else { 0 };
        let confirmed = self
            .execute(
                &Login {
                    client_id: account,
                    flags,
                },
                None,
                None,
            )?
            .into_login_confirmed()?;
        info!(
            marker = confirmed.client_store_marker,
            used = confirmed.blocks_used,
            "logged in"
        );
        Ok(confirmed)
    }

    /// Logs out; the connection should be closed afterwards.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.execute(&Finished {}, None, None)?;
        info!("logged out");
        Ok(())
    }

    /// Lists a directory, returning the directory's own entry and its
    /// contents.
    pub fn list_directory(
        &mut self,
        dir_id: ObjectId,
        flags_must_be_set: i16,
        flags_not_to_be_set: i16,
        send_attributes: bool,
    ) -> Result<(RemoteEntry, Vec<RemoteEntry>), Error> {
        self.execute(
            &ListDirectory {
                object_id: dir_id,
                flags_must_be_set,
                flags_not_to_be_set,
                send_attributes,
            },
            None,
            None,
        )?
        .into_success()?;

        let crypt = self.crypt.clone();
        let mut stream = self.get_stream()?;
        let listing = read_dir_stream(&crypt, &mut stream)?;
        let leftover = stream.drain()?;
        if leftover > 0 {
            debug!(leftover, "discarded trailing directory stream bytes");
        }
        Ok(listing)
    }

    /// Lists every entry of a directory, attributes included.
    pub fn read_dir(&mut self, dir_id: ObjectId) -> Result<Vec<RemoteEntry>, Error> {
        self.list_directory(
            dir_id,
            FLAGS_INCLUDE_EVERYTHING,
            FLAGS_EXCLUDE_NOTHING,
            true,
        )
        .map(|(_, entries)| entries)
    }

    /// Resolves the name path of an object, innermost element first as
    /// the store sends it. `None` when the object does not exist.
    pub fn get_object_name(
        &mut self,
        dir_id: ObjectId,
        object_id: ObjectId,
    ) -> Result<Option<Vec<String>>, Error> {
        let reply = self
            .execute(
                &GetObjectName {
                    object_id,
                    containing_directory_id: dir_id,
                },
                None,
                None,
            )?
            .into_object_name()?;
        if reply.num_name_elements == 0 {
            return Ok(None);
        }

        let crypt = self.crypt.clone();
        let mut stream = self.get_stream()?;
        let mut path = Vec::new();
        for _ in 0..reply.num_name_elements {
            path.push(read_filename(&crypt, &mut stream)?);
        }
        stream.drain()?;
        Ok(Some(path))
    }

    pub fn account_usage(&mut self) -> Result<AccountUsage, Error> {
        self.execute(&GetAccountUsage {}, None, None)?
            .into_account_usage()
    }

    pub fn account_usage2(&mut self) -> Result<AccountUsage2, Error> {
        self.execute(&GetAccountUsage2 {}, None, None)?
            .into_account_usage2()
    }

    pub fn is_alive(&mut self) -> Result<(), Error> {
        self.execute(&GetIsAlive {}, None, None)?;
        Ok(())
    }

    /// Deletes a file by name. Returns the deleted object, or `None`
    /// when the name was not present in the directory.
    pub fn delete_file(
        &mut self,
        dir_id: ObjectId,
        name: &str,
    ) -> Result<Option<ObjectId>, Error> {
        let crypt = self.crypt.clone();
        let filename = write_filename(&crypt, name)?;
        let success = self
            .execute(&DeleteFile { in_directory: dir_id }, Some(&filename), None)?
            .into_success()?;
        if success.object_id.is_unset() {
            return Ok(None);
        }
        Ok(Some(success.object_id))
    }

    pub fn undelete_file(&mut self, dir_id: ObjectId, object_id: ObjectId) -> Result<(), Error> {
        self.execute(
            &UndeleteFile {
                in_directory: dir_id,
                object_id,
            },
            None,
            None,
        )?;
        Ok(())
    }

    pub fn get_block_index_by_id(&mut self, object_id: ObjectId) -> Result<BlockIndex, Error> {
        self.execute(&GetBlockIndexByID { object_id }, None, None)?
            .into_success()?;
        let crypt = self.crypt.clone();
        let mut stream = self.get_stream()?;
        let index = BlockIndex::read(&crypt, &mut stream)?;
        stream.drain()?;
        Ok(index)
    }

    /// `None` when the name was not found in the directory (no stream
    /// follows in that case).
    pub fn get_block_index_by_name(
        &mut self,
        dir_id: ObjectId,
        name: &str,
    ) -> Result<Option<(ObjectId, BlockIndex)>, Error> {
        let crypt = self.crypt.clone();
        let filename = write_filename(&crypt, name)?;
        let success = self
            .execute(
                &GetBlockIndexByName {
                    in_directory: dir_id,
                },
                Some(&filename),
                None,
            )?
            .into_success()?;
        if success.object_id.is_unset() {
            return Ok(None);
        }
        let mut stream = self.get_stream()?;
        let index = BlockIndex::read(&crypt, &mut stream)?;
        stream.drain()?;
        Ok(Some((success.object_id, index)))
    }

    /// Creates a directory named `name` with the given attributes.
    pub fn create_directory(
        &mut self,
        dir_id: ObjectId,
        name: &str,
        attributes: &RemoteEntry,
    ) -> Result<(), Error> {
        let crypt = self.crypt.clone();
        let filename = write_filename(&crypt, name)?;
        let attribute_block = write_attributes(&crypt, attributes)?;
        self.execute(
            &CreateDirectory {
                containing_directory_id: dir_id,
                attributes_mod_time: crate::file::wire_micros(attributes.attributes_modified_at)
                    as i64,
            },
            Some(&filename),
            Some(&attribute_block),
        )?;
        Ok(())
    }

    /// `CreateDirectory` variant that also records the directory
    /// modification time.
    pub fn create_directory2(
        &mut self,
        dir_id: ObjectId,
        name: &str,
        attributes: &RemoteEntry,
    ) -> Result<(), Error> {
        let crypt = self.crypt.clone();
        let filename = write_filename(&crypt, name)?;
        let attribute_block = write_attributes(&crypt, attributes)?;
        self.execute(
            &CreateDirectory2 {
                containing_directory_id: dir_id,
                attributes_mod_time: crate::file::wire_micros(attributes.attributes_modified_at)
                    as i64,
                modification_time: crate::file::wire_micros(attributes.modified_at) as i64,
            },
            Some(&filename),
            Some(&attribute_block),
        )?;
        Ok(())
    }

    pub fn change_dir_attributes(
        &mut self,
        dir_id: ObjectId,
        attributes: &RemoteEntry,
    ) -> Result<(), Error> {
        let crypt = self.crypt.clone();
        let attribute_block = write_attributes(&crypt, attributes)?;
        self.execute(
            &ChangeDirAttributes {
                object_id: dir_id,
                attributes_mod_time: crate::file::wire_micros(attributes.attributes_modified_at)
                    as i64,
            },
            None,
            Some(&attribute_block),
        )?;
        Ok(())
    }

    pub fn delete_directory(&mut self, dir_id: ObjectId) -> Result<(), Error> {
        self.execute(&DeleteDirectory { object_id: dir_id }, None, None)?;
        Ok(())
    }

    pub fn undelete_directory(&mut self, dir_id: ObjectId) -> Result<(), Error> {
        self.execute(&UndeleteDirectory { object_id: dir_id }, None, None)?;
        Ok(())
    }

    pub fn move_object(
        &mut self,
        object_id: ObjectId,
        from_dir: ObjectId,
        to_dir: ObjectId,
        flags: i32,
        new_name: &str,
    ) -> Result<(), Error> {
        let crypt = self.crypt.clone();
        let filename = write_filename(&crypt, new_name)?;
        self.execute(
            &MoveObject {
                object_id,
                move_from_directory: from_dir,
                move_to_directory: to_dir,
                flags,
            },
            Some(&filename),
            None,
        )?;
        Ok(())
    }

    pub fn set_replacement_file_attributes(
        &mut self,
        dir_id: ObjectId,
        name: &str,
        attributes_hash: i64,
        attributes: &RemoteEntry,
    ) -> Result<(), Error> {
        let crypt = self.crypt.clone();
        let filename = write_filename(&crypt, name)?;
        let attribute_block = write_attributes(&crypt, attributes)?;
        self.execute(
            &SetReplacementFileAttributes {
                in_directory: dir_id,
                attributes_hash,
            },
            Some(&filename),
            Some(&attribute_block),
        )?;
        Ok(())
    }

    pub fn set_client_store_marker(&mut self, marker: i64) -> Result<(), Error> {
        self.execute(
            &SetClientStoreMarker {
                client_store_marker: marker,
            },
            None,
            None,
        )?;
        Ok(())
    }
}
