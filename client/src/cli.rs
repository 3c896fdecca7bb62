use std::path::PathBuf;

use clap::{Parser, Subcommand};

use boxtin_protocol::ObjectId;

#[derive(Debug, Parser)]
#[clap(name = "boxtin", about = "Client for BoxBackup stores")]
pub struct Cli {
    /// Main configuration file.
    #[clap(long, default_value = "/etc/boxbackup/bbackupd.conf")]
    pub config: PathBuf,
    /// Verify the store certificate against this hostname instead of
    /// the configured one. An empty value disables server-name
    /// verification.
    #[clap(long, default_value = "")]
    pub tls_host: String,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// List a directory. Object ids accept decimal or 0x-prefixed hex.
    Ls {
        #[clap(default_value = "1")]
        dir_id: ObjectId,
    },
    /// Download a file into a local file.
    Get {
        dir_id: ObjectId,
        object_id: ObjectId,
        output: PathBuf,
    },
    /// Fetch an object in store order and write its content to stdout.
    Cat { object_id: ObjectId },
    /// Upload a local file.
    Put {
        local_path: PathBuf,
        #[clap(default_value = "1")]
        dir_id: ObjectId,
        /// Name on the store; defaults to the local file name.
        name: Option<String>,
    },
    /// Delete a file by name.
    Rm { dir_id: ObjectId, name: String },
    /// Create a directory.
    Mkdir { dir_id: ObjectId, name: String },
    /// Print the name path of an object.
    Name {
        dir_id: ObjectId,
        object_id: ObjectId,
    },
    /// Show account usage.
    Usage,
    /// Check that the store answers.
    Ping,
}

impl Command {
    /// Commands that never write may log in read-only.
    pub fn is_read_only(&self) -> bool {
        !matches!(
            self,
            Command::Put { .. } | Command::Rm { .. } | Command::Mkdir { .. }
        )
    }
}
