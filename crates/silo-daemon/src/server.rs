//! The transport adapter: a Unix-socket server translating framed
//! requests into store and filer calls.
//!
//! All store semantics live in `silo-store`/`silo-filer`; this module
//! only extracts identifiers from request paths, maps service errors
//! onto wire error kinds, and shuttles typed metadata records back.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tracing::{error, info, warn};

use silo_config::Config;
use silo_filer::{FileAttrs, FileKind, FileRecord, Filer, FilerError};
use silo_ipc::{
    ChunkInfo, ErrorKind, FileInfo, RecordAttrs, RecordKind, Request, Response, MAX_FRAME_SIZE,
};
use silo_store::{id, ChunkMeta, ChunkStore, Deref, ObjectId, StoreError};

/// The services a connection dispatches into. Shared across all
/// connection tasks; holds no other state.
pub struct DaemonState {
    chunks: Arc<ChunkStore>,
    filer: Filer,
}

impl DaemonState {
    pub fn new() -> Self {
        let chunks = Arc::new(ChunkStore::in_memory());
        let filer = Filer::in_memory(chunks.clone());
        Self { chunks, filer }
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind the configured socket and serve until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    let socket_path = config.daemon.socket;
    if socket_path.exists() {
        tokio::fs::remove_file(&socket_path).await?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!("silod: listening on {:?}", socket_path);

    let state = Arc::new(DaemonState::new());
    tokio::select! {
        result = serve(listener, state) => result?,
        _ = signal::ctrl_c() => {
            info!("silod: shutdown signal received");
        }
    }

    if socket_path.exists() {
        tokio::fs::remove_file(&socket_path).await?;
    }
    Ok(())
}

/// Accept loop; one task per connection.
pub async fn serve(listener: UnixListener, state: Arc<DaemonState>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = state.clone();
                tokio::spawn(handle_connection(stream, state));
            }
            Err(err) => {
                error!("silod: accept error: {err}");
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, state: Arc<DaemonState>) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            warn!("silod: dropping connection, oversized frame ({len} bytes)");
            return;
        }
        let mut buf = vec![0u8; len];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }

        let response = match bincode::deserialize::<Request>(&buf) {
            Ok(request) => handle_request(request, &state),
            Err(e) => Response::Error {
                kind: ErrorKind::Internal,
                message: format!("invalid request frame: {e}"),
            },
        };

        let resp_bytes = match bincode::serialize(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("silod: failed to serialize response: {e}");
                return;
            }
        };
        let resp_len = (resp_bytes.len() as u32).to_le_bytes();
        if stream.write_all(&resp_len).await.is_err() {
            return;
        }
        if stream.write_all(&resp_bytes).await.is_err() {
            return;
        }
    }
}

fn handle_request(request: Request, state: &DaemonState) -> Response {
    match request {
        Request::Handshake { client_version } => {
            info!("silod: handshake from client {client_version}");
            Response::HandshakeAck {
                server_version: env!("CARGO_PKG_VERSION").to_string(),
            }
        }
        Request::Status => match state.chunks.stats() {
            Ok(stats) => Response::StatusAck {
                chunks: stats.chunks,
                bytes: stats.bytes,
                refs: stats.refs,
            },
            Err(e) => store_error(e),
        },
        Request::ChunkHead { path } => {
            match id::from_path(&path).and_then(|cid| state.chunks.head(&cid)) {
                Ok(meta) => Response::ChunkHeadAck(chunk_info(meta)),
                Err(e) => store_error(e),
            }
        }
        Request::ChunkGet { path } => {
            match id::from_path(&path).and_then(|cid| state.chunks.get(&cid)) {
                Ok(chunk) => Response::ChunkDataAck {
                    info: chunk_info(chunk.meta()),
                    data: chunk.data,
                },
                Err(e) => store_error(e),
            }
        }
        Request::ChunkPut { path, data, parity } => {
            match id::from_path(&path).and_then(|cid| state.chunks.put(&cid, data, parity)) {
                Ok(refcount) => Response::RefCountAck(refcount),
                Err(e) => store_error(e),
            }
        }
        Request::ChunkAddref { path } => {
            match id::from_path(&path).and_then(|cid| state.chunks.addref(&cid)) {
                Ok(refcount) => Response::RefCountAck(refcount),
                Err(e) => store_error(e),
            }
        }
        Request::ChunkDeref { path } => {
            match id::from_path(&path).and_then(|cid| state.chunks.deref(&cid)) {
                Ok(Deref::Live(refcount)) => Response::DerefAck {
                    refcount: Some(refcount),
                },
                Ok(Deref::Deleted) => Response::DerefAck { refcount: None },
                Err(e) => store_error(e),
            }
        }
        Request::FileCreate {
            path,
            kind,
            attrs,
            entries,
            previous,
        } => match file_create(state, &path, kind, attrs, &entries, previous.as_deref()) {
            Ok(record) => Response::FileAck(file_info(&record)),
            Err(e) => filer_error(e),
        },
        Request::FileGet { path } => {
            let fetched = id::from_path(&path)
                .map_err(FilerError::from)
                .and_then(|rid| state.filer.get(&rid));
            match fetched {
                Ok(record) => Response::FileAck(file_info(&record)),
                Err(e) => filer_error(e),
            }
        }
        Request::FileSupersede {
            path,
            new_id,
            attrs,
            entries,
        } => match file_supersede(state, &path, &new_id, attrs, &entries) {
            Ok(record) => Response::FileAck(file_info(&record)),
            Err(e) => filer_error(e),
        },
        Request::FileHistory { path } => file_history(state, &path),
    }
}

fn file_create(
    state: &DaemonState,
    path: &str,
    kind: RecordKind,
    attrs: RecordAttrs,
    entries: &[String],
    previous: Option<&str>,
) -> Result<FileRecord, FilerError> {
    let record_id = id::from_path(path).map_err(FilerError::from)?;
    let entries = parse_ids(entries)?;
    let previous = previous
        .map(id::parse)
        .transpose()
        .map_err(FilerError::from)?;
    state
        .filer
        .create(record_id, file_kind(kind), file_attrs(attrs)?, entries, previous)
}

fn file_supersede(
    state: &DaemonState,
    path: &str,
    new_id: &str,
    attrs: RecordAttrs,
    entries: &[String],
) -> Result<FileRecord, FilerError> {
    let old_id = id::from_path(path).map_err(FilerError::from)?;
    let new_id = id::parse(new_id).map_err(FilerError::from)?;
    let entries = parse_ids(entries)?;
    state
        .filer
        .supersede(&old_id, new_id, file_attrs(attrs)?, entries)
}

fn file_history(state: &DaemonState, path: &str) -> Response {
    let record_id = match id::from_path(path) {
        Ok(rid) => rid,
        Err(e) => return store_error(e),
    };
    let mut chain = Vec::new();
    for step in state.filer.history(&record_id) {
        match step {
            Ok(record) => chain.push(file_info(&record)),
            Err(e) => return filer_error(e),
        }
    }
    Response::HistoryAck(chain)
}

fn parse_ids(hex_ids: &[String]) -> Result<Vec<ObjectId>, FilerError> {
    hex_ids
        .iter()
        .map(|hex| id::parse(hex).map_err(FilerError::from))
        .collect()
}

fn file_kind(kind: RecordKind) -> FileKind {
    match kind {
        RecordKind::File => FileKind::File,
        RecordKind::Directory => FileKind::Directory,
    }
}

fn record_kind(kind: FileKind) -> RecordKind {
    match kind {
        FileKind::File => RecordKind::File,
        FileKind::Directory => RecordKind::Directory,
    }
}

fn file_attrs(attrs: RecordAttrs) -> Result<FileAttrs, FilerError> {
    let hash = attrs
        .hash
        .as_deref()
        .map(id::parse)
        .transpose()
        .map_err(FilerError::from)?;
    Ok(FileAttrs {
        name: attrs.name,
        hash,
        size: attrs.size,
        mode: attrs.mode,
        chunk_size: attrs.chunk_size,
        mtime: attrs.mtime,
        ctime: attrs.ctime,
    })
}

fn chunk_info(meta: ChunkMeta) -> ChunkInfo {
    ChunkInfo {
        length: meta.length,
        weaksum: meta.weaksum,
        refcount: meta.refcount,
        parity: meta.parity,
    }
}

fn file_info(record: &FileRecord) -> FileInfo {
    FileInfo {
        id: id::to_hex(&record.id),
        kind: record_kind(record.kind),
        attrs: RecordAttrs {
            name: record.attrs.name.clone(),
            hash: record.attrs.hash.as_ref().map(id::to_hex),
            size: record.attrs.size,
            mode: record.attrs.mode,
            chunk_size: record.attrs.chunk_size,
            mtime: record.attrs.mtime,
            ctime: record.attrs.ctime,
        },
        previous: record.previous.as_ref().map(id::to_hex),
        entries: record.entries.iter().map(id::to_hex).collect(),
    }
}

fn store_error(e: StoreError) -> Response {
    let kind = match &e {
        StoreError::InvalidId(_) => ErrorKind::InvalidId,
        StoreError::NotFound(_) => ErrorKind::NotFound,
        StoreError::Consistency(_) => ErrorKind::Internal,
        StoreError::Storage(_) => ErrorKind::Unavailable,
    };
    Response::Error {
        kind,
        message: e.to_string(),
    }
}

fn filer_error(e: FilerError) -> Response {
    let kind = match &e {
        FilerError::NotFound(_) => ErrorKind::NotFound,
        FilerError::Exists(_) => ErrorKind::Exists,
        FilerError::Reference(_) => ErrorKind::Reference,
        FilerError::Cycle(_) => ErrorKind::Internal,
        FilerError::Store(StoreError::InvalidId(_)) => ErrorKind::InvalidId,
        FilerError::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
        FilerError::Store(StoreError::Consistency(_)) => ErrorKind::Internal,
        FilerError::Store(StoreError::Storage(_)) | FilerError::Storage(_) => {
            ErrorKind::Unavailable
        }
    };
    Response::Error {
        kind,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_ipc::client::Client;
    use silo_store::id::content_id;

    async fn spawn_server() -> (tempfile::TempDir, String) {
        let temp = tempfile::TempDir::new().unwrap();
        let socket = temp.path().join("silod.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve(listener, Arc::new(DaemonState::new())));
        let socket = socket.to_string_lossy().into_owned();
        (temp, socket)
    }

    fn attrs(name: &str, size: u64) -> RecordAttrs {
        RecordAttrs {
            name: name.to_string(),
            hash: None,
            size,
            mode: 0o644,
            chunk_size: 65536,
            mtime: 1_700_000_000,
            ctime: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_chunk_protocol_over_socket() {
        let (_temp, socket) = spawn_server().await;
        let mut client = Client::connect(&socket).await.unwrap();
        assert!(!client.handshake().await.unwrap().is_empty());

        let data = b"end to end".to_vec();
        let path = format!("/store/{}", id::to_hex(&content_id(&data)));

        let put = Request::ChunkPut {
            path: path.clone(),
            data: data.clone(),
            parity: None,
        };
        assert!(matches!(
            client.send(put.clone()).await.unwrap(),
            Response::RefCountAck(1)
        ));
        assert!(matches!(
            client.send(put).await.unwrap(),
            Response::RefCountAck(2)
        ));

        match client
            .send(Request::ChunkGet { path: path.clone() })
            .await
            .unwrap()
        {
            Response::ChunkDataAck { info, data: body } => {
                assert_eq!(body, data);
                assert_eq!(info.length, data.len() as u64);
                assert_eq!(info.refcount, 2);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        assert!(matches!(
            client
                .send(Request::ChunkDeref { path: path.clone() })
                .await
                .unwrap(),
            Response::DerefAck { refcount: Some(1) }
        ));
        assert!(matches!(
            client
                .send(Request::ChunkDeref { path: path.clone() })
                .await
                .unwrap(),
            Response::DerefAck { refcount: None }
        ));
        assert!(matches!(
            client.send(Request::ChunkGet { path }).await.unwrap(),
            Response::Error {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_file_protocol_over_socket() {
        let (_temp, socket) = spawn_server().await;
        let mut client = Client::connect(&socket).await.unwrap();

        let data = b"file body".to_vec();
        let chunk_hex = id::to_hex(&content_id(&data));
        client
            .send(Request::ChunkPut {
                path: format!("/store/{chunk_hex}"),
                data: data.clone(),
                parity: None,
            })
            .await
            .unwrap();

        let v1_hex = id::to_hex(&content_id(b"version 1"));
        let created = client
            .send(Request::FileCreate {
                path: format!("/files/{v1_hex}"),
                kind: RecordKind::File,
                attrs: attrs("notes.txt", data.len() as u64),
                entries: vec![chunk_hex.clone()],
                previous: None,
            })
            .await
            .unwrap();
        match &created {
            Response::FileAck(info) => {
                assert_eq!(info.id, v1_hex);
                assert_eq!(info.entries, vec![chunk_hex.clone()]);
                assert!(info.previous.is_none());
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Creating the file took a reference on its chunk.
        match client
            .send(Request::ChunkHead {
                path: format!("/store/{chunk_hex}"),
            })
            .await
            .unwrap()
        {
            Response::ChunkHeadAck(info) => assert_eq!(info.refcount, 2),
            other => panic!("unexpected response: {other:?}"),
        }

        let v2_hex = id::to_hex(&content_id(b"version 2"));
        match client
            .send(Request::FileSupersede {
                path: format!("/files/{v1_hex}"),
                new_id: v2_hex.clone(),
                attrs: attrs("notes.txt", data.len() as u64),
                entries: vec![chunk_hex.clone()],
            })
            .await
            .unwrap()
        {
            Response::FileAck(info) => {
                assert_eq!(info.id, v2_hex);
                assert_eq!(info.previous.as_deref(), Some(v1_hex.as_str()));
            }
            other => panic!("unexpected response: {other:?}"),
        }

        match client
            .send(Request::FileHistory {
                path: format!("/files/{v2_hex}"),
            })
            .await
            .unwrap()
        {
            Response::HistoryAck(chain) => {
                let ids: Vec<_> = chain.iter().map(|info| info.id.as_str()).collect();
                assert_eq!(ids, vec![v2_hex.as_str(), v1_hex.as_str()]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_id_is_rejected() {
        let (_temp, socket) = spawn_server().await;
        let mut client = Client::connect(&socket).await.unwrap();

        assert!(matches!(
            client
                .send(Request::ChunkHead {
                    path: "/store/not-a-valid-id".to_string(),
                })
                .await
                .unwrap(),
            Response::Error {
                kind: ErrorKind::InvalidId,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_file_reference_is_reported() {
        let (_temp, socket) = spawn_server().await;
        let mut client = Client::connect(&socket).await.unwrap();

        let missing = id::to_hex(&content_id(b"never stored"));
        let record = id::to_hex(&content_id(b"record"));
        assert!(matches!(
            client
                .send(Request::FileCreate {
                    path: format!("/files/{record}"),
                    kind: RecordKind::File,
                    attrs: attrs("ghost.txt", 0),
                    entries: vec![missing],
                    previous: None,
                })
                .await
                .unwrap(),
            Response::Error {
                kind: ErrorKind::Reference,
                ..
            }
        ));
    }
}
