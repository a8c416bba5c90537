//! # silo-ipc
//!
//! Wire protocol between the silo daemon and its clients: bincode frames
//! prefixed with a little-endian u32 length, over a Unix stream socket.
//!
//! Requests carry identifier-bearing paths (`/store/<id>`, `/files/<id>`)
//! verbatim; the daemon owns extraction and validation. Responses carry
//! typed metadata records rather than loose string maps.

use serde::{Deserialize, Serialize};

/// Cap on a single frame, request or response.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default daemon socket path.
pub fn default_socket_path() -> &'static str {
    "/tmp/silod.sock"
}

/// Record shape discriminator on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    File,
    Directory,
}

/// Chunk metadata as reported by head/get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub length: u64,
    pub weaksum: u32,
    pub refcount: u64,
    pub parity: Option<Vec<u8>>,
}

/// File record attributes, threaded through the core unchanged.
/// Identifier-valued fields travel as 32-hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAttrs {
    pub name: String,
    pub hash: Option<String>,
    pub size: u64,
    pub mode: u32,
    pub chunk_size: u32,
    pub mtime: i64,
    pub ctime: i64,
}

/// A full file record on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub kind: RecordKind,
    pub attrs: RecordAttrs,
    pub previous: Option<String>,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Handshake {
        client_version: String,
    },
    Status,
    ChunkHead {
        path: String,
    },
    ChunkGet {
        path: String,
    },
    ChunkPut {
        path: String,
        data: Vec<u8>,
        parity: Option<Vec<u8>>,
    },
    ChunkAddref {
        path: String,
    },
    ChunkDeref {
        path: String,
    },
    FileCreate {
        path: String,
        kind: RecordKind,
        attrs: RecordAttrs,
        entries: Vec<String>,
        previous: Option<String>,
    },
    FileGet {
        path: String,
    },
    FileSupersede {
        path: String,
        new_id: String,
        attrs: RecordAttrs,
        entries: Vec<String>,
    },
    FileHistory {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    HandshakeAck {
        server_version: String,
    },
    StatusAck {
        chunks: u64,
        bytes: u64,
        refs: u64,
    },
    ChunkHeadAck(ChunkInfo),
    ChunkDataAck {
        info: ChunkInfo,
        data: Vec<u8>,
    },
    RefCountAck(u64),
    /// `refcount` is `None` when the deref deleted the chunk.
    DerefAck {
        refcount: Option<u64>,
    },
    FileAck(FileInfo),
    /// Version chain, newest first.
    HistoryAck(Vec<FileInfo>),
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// Failure classification, so callers can tell retryable from terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidId,
    NotFound,
    Reference,
    Exists,
    /// Backend failed or timed out; retry is reasonable.
    Unavailable,
    /// The server hit a state its invariants forbid.
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable)
    }
}

pub mod client {
    //! Async client side of the protocol.

    use super::{Request, Response, MAX_FRAME_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    pub struct Client {
        stream: UnixStream,
    }

    impl Client {
        /// Connect to a daemon socket.
        pub async fn connect(socket_path: &str) -> anyhow::Result<Self> {
            let stream = UnixStream::connect(socket_path).await?;
            Ok(Self { stream })
        }

        /// Send one request and wait for its response.
        pub async fn send(&mut self, request: Request) -> anyhow::Result<Response> {
            let req_bytes = bincode::serialize(&request)?;
            if req_bytes.len() > MAX_FRAME_SIZE {
                anyhow::bail!("request frame too large: {} bytes", req_bytes.len());
            }
            let req_len = (req_bytes.len() as u32).to_le_bytes();
            self.stream.write_all(&req_len).await?;
            self.stream.write_all(&req_bytes).await?;

            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf).await?;
            let resp_len = u32::from_le_bytes(len_buf) as usize;
            if resp_len > MAX_FRAME_SIZE {
                anyhow::bail!("response frame too large: {resp_len} bytes");
            }

            let mut resp_buf = vec![0u8; resp_len];
            self.stream.read_exact(&mut resp_buf).await?;
            Ok(bincode::deserialize(&resp_buf)?)
        }

        /// Exchange versions with the daemon.
        pub async fn handshake(&mut self) -> anyhow::Result<String> {
            let request = Request::Handshake {
                client_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            match self.send(request).await? {
                Response::HandshakeAck { server_version } => Ok(server_version),
                Response::Error { message, .. } => anyhow::bail!("handshake failed: {message}"),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }

        /// Store-wide accounting.
        pub async fn status(&mut self) -> anyhow::Result<(u64, u64, u64)> {
            match self.send(Request::Status).await? {
                Response::StatusAck {
                    chunks,
                    bytes,
                    refs,
                } => Ok((chunks, bytes, refs)),
                Response::Error { message, .. } => anyhow::bail!("status failed: {message}"),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
    }
}
