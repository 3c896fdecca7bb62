//! Client for BoxBackup stores: a framed request/response protocol
//! over mutually-authenticated TLS, with filenames, attributes,
//! block-index entries, and file data each encrypted under their own
//! key, and files split into content-defined chunks with per-block
//! checksums.

pub mod blocks;
pub mod chunker;
pub mod cli;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod file;
pub mod keys;
pub mod stream;
pub mod tls;

pub use commands::PROTOCOL_VERSION;
pub use config::Config;
pub use connection::Connection;
pub use crypto::CipherSuite;
pub use file::{FileReader, FileWriter, Object, RemoteEntry};
pub use keys::KeyBundle;
pub use stream::StreamReader;
