//! # silo CLI
//!
//! Command-line client for the silo chunk store: uploads files and
//! directory trees as chunked, versioned records, restores them, and
//! inspects the store.
//!
//! Chunk identifiers are content digests computed here, client-side; the
//! daemon accepts whatever identifier it is handed.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use walkdir::WalkDir;

use silo_config::logging::{init_logging, LogLevel};
use silo_config::Config;
use silo_ipc::client::Client;
use silo_ipc::{RecordAttrs, RecordKind, Request, Response};
use silo_store::id::{self, content_id, ObjectId};

#[derive(Parser)]
#[command(name = "silo")]
#[command(version, about = "Silo chunk store client", long_about = None)]
struct Cli {
    /// Daemon socket path (overrides config)
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file or directory tree as a versioned record
    Put {
        path: PathBuf,

        /// Identifier of the version this upload supersedes
        #[arg(long)]
        previous: Option<String>,

        /// Chunking granularity in bytes (overrides config)
        #[arg(long)]
        chunk_size: Option<u32>,
    },

    /// Fetch a record and reassemble its content
    Get {
        id: String,

        /// Write content here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show chunk metadata
    Head { id: String },

    /// Take an extra reference on a chunk
    Addref { id: String },

    /// Drop a reference on a chunk
    Deref { id: String },

    /// Print the version chain of a record, newest first
    History { id: String },

    /// Store-wide accounting
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogLevel::Warn);

    let cli = Cli::parse();
    let config = Config::load()?;
    let socket = cli
        .socket
        .unwrap_or_else(|| config.daemon.socket.clone())
        .to_string_lossy()
        .into_owned();

    let mut client = Client::connect(&socket)
        .await
        .with_context(|| format!("connecting to daemon at {socket}"))?;

    match cli.command {
        Commands::Put {
            path,
            previous,
            chunk_size,
        } => {
            let chunk_size = chunk_size.unwrap_or(config.store.chunk_size).max(1);
            let record_hex = put_path(&mut client, &path, previous, chunk_size).await?;
            println!("{record_hex}");
        }
        Commands::Get { id, output } => cmd_get(&mut client, &id, output.as_deref()).await?,
        Commands::Head { id } => cmd_head(&mut client, &id).await?,
        Commands::Addref { id } => {
            match send(&mut client, Request::ChunkAddref { path: store_path(&id) }).await? {
                Response::RefCountAck(refcount) => println!("refcount {refcount}"),
                other => bail!("unexpected response: {other:?}"),
            }
        }
        Commands::Deref { id } => {
            match send(&mut client, Request::ChunkDeref { path: store_path(&id) }).await? {
                Response::DerefAck {
                    refcount: Some(refcount),
                } => println!("refcount {refcount}"),
                Response::DerefAck { refcount: None } => println!("deleted"),
                other => bail!("unexpected response: {other:?}"),
            }
        }
        Commands::History { id } => cmd_history(&mut client, &id).await?,
        Commands::Status => {
            let (chunks, bytes, refs) = client.status().await?;
            println!("{chunks} chunks, {bytes} bytes, {refs} references");
        }
    }
    Ok(())
}

fn store_path(hex: &str) -> String {
    format!("/store/{hex}")
}

fn files_path(hex: &str) -> String {
    format!("/files/{hex}")
}

/// Send a request, turning an error response into a CLI failure.
async fn send(client: &mut Client, request: Request) -> Result<Response> {
    match client.send(request).await? {
        Response::Error { kind, message } => bail!("daemon error ({kind:?}): {message}"),
        other => Ok(other),
    }
}

/// Upload a file or a directory tree; returns the root record id.
async fn put_path(
    client: &mut Client,
    path: &Path,
    previous: Option<String>,
    chunk_size: u32,
) -> Result<String> {
    let meta = fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
    if !meta.is_dir() {
        return put_file(client, path, previous, chunk_size).await;
    }

    // Children before parents, so every directory record can list the ids
    // of records that already exist.
    let mut children: HashMap<PathBuf, Vec<String>> = HashMap::new();
    let mut root_hex = None;
    for entry in WalkDir::new(path).sort_by_file_name().contents_first(true) {
        let entry = entry?;
        let record_hex = if entry.file_type().is_dir() {
            let entries = children.remove(entry.path()).unwrap_or_default();
            let previous = if entry.path() == path {
                previous.clone()
            } else {
                None
            };
            put_directory(client, entry.path(), entries, previous).await?
        } else {
            put_file(client, entry.path(), None, chunk_size).await?
        };
        if let Some(parent) = entry.path().parent() {
            children
                .entry(parent.to_path_buf())
                .or_default()
                .push(record_hex.clone());
        }
        root_hex = Some(record_hex);
    }
    root_hex.context("empty walk")
}

/// Chunk one file, upload its chunks, create its record, then release
/// the upload references; the record is the sole owner afterwards.
async fn put_file(
    client: &mut Client,
    path: &Path,
    previous: Option<String>,
    chunk_size: u32,
) -> Result<String> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let meta = fs::metadata(path)?;
    let name = file_name(path);

    let mut entries = Vec::new();
    for piece in data.chunks(chunk_size as usize) {
        let chunk_hex = id::to_hex(&content_id(piece));
        match send(
            client,
            Request::ChunkPut {
                path: store_path(&chunk_hex),
                data: piece.to_vec(),
                parity: None,
            },
        )
        .await?
        {
            Response::RefCountAck(refcount) => {
                debug!(chunk = %chunk_hex, refcount, "uploaded chunk");
            }
            other => bail!("unexpected response: {other:?}"),
        }
        entries.push(chunk_hex);
    }

    let content_hash = content_id(&data);
    let record_hex = id::to_hex(&version_id(
        &name,
        meta.mtime(),
        &content_hash,
        previous.as_deref(),
    ));
    let created = send(
        client,
        Request::FileCreate {
            path: files_path(&record_hex),
            kind: RecordKind::File,
            attrs: RecordAttrs {
                name,
                hash: Some(id::to_hex(&content_hash)),
                size: data.len() as u64,
                mode: meta.mode(),
                chunk_size,
                mtime: meta.mtime(),
                ctime: meta.ctime(),
            },
            entries: entries.clone(),
            previous,
        },
    )
    .await;

    // Hand ownership to the record: drop the references our puts took.
    // On failure this also undoes the upload.
    for chunk_hex in &entries {
        if let Err(e) = send(
            client,
            Request::ChunkDeref {
                path: store_path(chunk_hex),
            },
        )
        .await
        {
            warn!(chunk = %chunk_hex, error = %e, "failed to release upload reference");
        }
    }

    match created? {
        Response::FileAck(info) => Ok(info.id),
        other => bail!("unexpected response: {other:?}"),
    }
}

async fn put_directory(
    client: &mut Client,
    path: &Path,
    entries: Vec<String>,
    previous: Option<String>,
) -> Result<String> {
    let meta = fs::metadata(path)?;
    let name = file_name(path);

    let listing = entries.join("");
    let record_hex = id::to_hex(&version_id(
        &name,
        meta.mtime(),
        &content_id(listing.as_bytes()),
        previous.as_deref(),
    ));
    match send(
        client,
        Request::FileCreate {
            path: files_path(&record_hex),
            kind: RecordKind::Directory,
            attrs: RecordAttrs {
                name,
                hash: None,
                size: 0,
                mode: meta.mode(),
                chunk_size: 0,
                mtime: meta.mtime(),
                ctime: meta.ctime(),
            },
            entries,
            previous,
        },
    )
    .await?
    {
        Response::FileAck(info) => Ok(info.id),
        other => bail!("unexpected response: {other:?}"),
    }
}

async fn cmd_get(client: &mut Client, hex: &str, output: Option<&Path>) -> Result<()> {
    let info = match send(client, Request::FileGet { path: files_path(hex) }).await? {
        Response::FileAck(info) => info,
        other => bail!("unexpected response: {other:?}"),
    };

    if info.kind == RecordKind::Directory {
        for entry in &info.entries {
            println!("{entry}");
        }
        return Ok(());
    }

    let mut content = Vec::with_capacity(info.attrs.size as usize);
    for chunk_hex in &info.entries {
        match send(
            client,
            Request::ChunkGet {
                path: store_path(chunk_hex),
            },
        )
        .await?
        {
            Response::ChunkDataAck { data, .. } => content.extend_from_slice(&data),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    match output {
        Some(path) => {
            fs::write(path, &content).with_context(|| format!("writing {}", path.display()))?
        }
        None => std::io::stdout().write_all(&content)?,
    }
    Ok(())
}

async fn cmd_head(client: &mut Client, hex: &str) -> Result<()> {
    match send(client, Request::ChunkHead { path: store_path(hex) }).await? {
        Response::ChunkHeadAck(info) => {
            println!(
                "{hex}: {} bytes, weaksum {:#010x}, refcount {}",
                info.length, info.weaksum, info.refcount
            );
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}

async fn cmd_history(client: &mut Client, hex: &str) -> Result<()> {
    match send(client, Request::FileHistory { path: files_path(hex) }).await? {
        Response::HistoryAck(chain) => {
            for info in chain {
                println!(
                    "{} {} {} bytes mtime {}",
                    info.id, info.attrs.name, info.attrs.size, info.attrs.mtime
                );
            }
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Derive a record id for one version of a logical file. Versions of the
/// same name with different content, timestamps or ancestry land on
/// distinct ids; chunk ids stay pure content digests.
fn version_id(name: &str, mtime: i64, content_hash: &ObjectId, previous: Option<&str>) -> ObjectId {
    let mut buf = Vec::with_capacity(name.len() + 8 + 16 + 32);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&mtime.to_le_bytes());
    buf.extend_from_slice(content_hash);
    if let Some(prev) = previous {
        buf.extend_from_slice(prev.as_bytes());
    }
    content_id(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_id_varies_with_inputs() {
        let hash = content_id(b"content");
        let base = version_id("notes.txt", 1_700_000_000, &hash, None);

        assert_eq!(version_id("notes.txt", 1_700_000_000, &hash, None), base);
        assert_ne!(version_id("other.txt", 1_700_000_000, &hash, None), base);
        assert_ne!(version_id("notes.txt", 1_700_000_001, &hash, None), base);
        assert_ne!(
            version_id("notes.txt", 1_700_000_000, &content_id(b"changed"), None),
            base
        );
        assert_ne!(
            version_id(
                "notes.txt",
                1_700_000_000,
                &hash,
                Some("d41d8cd98f00b204e9800998ecf8427e"),
            ),
            base
        );
    }

    #[test]
    fn test_file_name_falls_back_to_path() {
        assert_eq!(file_name(Path::new("/a/b/notes.txt")), "notes.txt");
        assert_eq!(file_name(Path::new("/")), "/");
    }

    #[test]
    fn test_chunk_split_covers_all_bytes() {
        let data = vec![7u8; 10_000];
        let pieces: Vec<_> = data.chunks(4096).collect();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces.iter().map(|p| p.len()).sum::<usize>(), data.len());
    }
}
