use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use prettytable::{format::FormatBuilder, row, Table};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{prelude::*, EnvFilter};

use boxtin::cli::{Cli, Command};
use boxtin::tls::TlsTransport;
use boxtin::{
    CipherSuite, Config, Connection, KeyBundle, Object, RemoteEntry, PROTOCOL_VERSION,
};
use boxtin_protocol::mode::{FileKind, FileMode};
use boxtin_protocol::{FLAG_DELETED, FLAG_DIR, FLAG_FILE, FLAG_OLD_VERSION};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env()?,
        )
        .init();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let keys = KeyBundle::load(&config.keys_file)?;
    let crypt = Arc::new(CipherSuite::new(keys));
    let transport = boxtin::tls::connect(&config, &cli.tls_host)?;
    let mut conn = Connection::new(transport, crypt);

    conn.check_version(PROTOCOL_VERSION)?;
    conn.login(config.account_number as i32, cli.command.is_read_only())?;
    run_command(&mut conn, cli.command)?;
    conn.finish()?;
    Ok(())
}

fn run_command(conn: &mut Connection<TlsTransport>, command: Command) -> Result<()> {
    match command {
        Command::Ls { dir_id } => {
            let entries = conn.read_dir(dir_id)?;
            print_listing(&entries);
        }
        Command::Get {
            dir_id,
            object_id,
            output,
        } => {
            let mut reader = conn.open_file(dir_id, object_id)?;
            let name = reader.entry().name.clone();
            let data = reader.read_to_end()?;
            reader.close()?;
            fs_err::write(&output, &data)?;
            println!("{} -> {} ({} bytes)", name, output.display(), data.len());
        }
        Command::Cat { object_id } => match conn.read_object(object_id)? {
            Object::File { data, .. } => std::io::stdout().write_all(&data)?,
            Object::Directory { .. } => bail!("object {object_id} is a directory"),
        },
        Command::Put {
            local_path,
            dir_id,
            name,
        } => {
            let name = match name {
                Some(name) => name,
                None => local_path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        anyhow!("cannot derive a name from {}", local_path.display())
                    })?,
            };
            let metadata = fs_err::metadata(&local_path)?;
            let modified_at: DateTime<Utc> = metadata.modified()?.into();
            let (uid, gid) = file_owner(&metadata);

            let mut writer = conn.create_file(dir_id, &name, modified_at, uid, gid)?;
            let mut input = fs_err::File::open(&local_path)?;
            let mut buf = [0u8; 65536];
            loop {
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                writer.write(&buf[..n]);
            }
            let object_id = writer.commit(conn)?;
            println!("stored {name} as {object_id}");
        }
        Command::Rm { dir_id, name } => match conn.delete_file(dir_id, &name)? {
            Some(object_id) => println!("deleted {name} ({object_id})"),
            None => bail!("{name} was not found in {dir_id}"),
        },
        Command::Mkdir { dir_id, name } => {
            let now = Utc::now();
            let attributes = RemoteEntry {
                mode: FileMode::new(FileKind::Directory, 0o755),
                modified_at: now,
                attributes_modified_at: now,
                ..RemoteEntry::default()
            };
            conn.create_directory(dir_id, &name, &attributes)?;
            println!("created {name}");
        }
        Command::Name { dir_id, object_id } => match conn.get_object_name(dir_id, object_id)? {
            Some(mut path) => {
                path.reverse();
                println!("{}", path.join("/"));
            }
            None => bail!("object {object_id} not found in {dir_id}"),
        },
        Command::Usage => {
            let usage = conn.account_usage2()?;
            println!("account enabled:     {}", usage.account_enabled);
            println!("block size:          {}", usage.block_size);
            println!("blocks used:         {}", usage.blocks_used);
            println!("  in current files:  {}", usage.blocks_in_current_files);
            println!("  in old files:      {}", usage.blocks_in_old_files);
            println!("  in deleted files:  {}", usage.blocks_in_deleted_files);
            println!("  in directories:    {}", usage.blocks_in_directories);
            println!("soft limit:          {}", usage.blocks_soft_limit);
            println!("hard limit:          {}", usage.blocks_hard_limit);
            println!("current files:       {}", usage.num_current_files);
            println!("old files:           {}", usage.num_old_files);
            println!("deleted files:       {}", usage.num_deleted_files);
            println!("directories:         {}", usage.num_directories);
        }
        Command::Ping => {
            conn.is_alive()?;
            println!("store is alive");
        }
    }
    Ok(())
}

fn print_listing(entries: &[RemoteEntry]) {
    let mut table = Table::new();
    table.set_format(FormatBuilder::new().column_separator(' ').padding(0, 1).build());
    table.add_row(row!["ID", "NAME", "MODIFIED", "MODE", "FLAGS"]);
    for entry in entries {
        table.add_row(row![
            entry.id,
            entry.name,
            entry.modified_at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:o}", entry.mode.to_wire()),
            flag_string(entry.flags),
        ]);
    }
    table.printstd();
}

fn flag_string(flags: i16) -> String {
    let mut out = String::new();
    if flags & FLAG_FILE != 0 {
        out.push('f');
    }
    if flags & FLAG_DIR != 0 {
        out.push('d');
    }
    if flags & FLAG_DELETED != 0 {
        out.push('x');
    }
    if flags & FLAG_OLD_VERSION != 0 {
        out.push('o');
    }
    out
}

#[cfg(target_family = "unix")]
fn file_owner(metadata: &std::fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;

    (metadata.uid(), metadata.gid())
}

#[cfg(not(target_family = "unix"))]
fn file_owner(_metadata: &std::fs::Metadata) -> (u32, u32) {
    (0, 0)
}
