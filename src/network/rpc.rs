//! Wire messages for the backing-node protocol.
//!
//! Every frame is a big-endian `u32` length followed by a bincode payload.
//! A request carries a batch of commands that the node executes in order,
//! which is how batch reads and writes are pipelined into one round trip.

use crate::error::{Error, NetworkError, Result};
use crate::types::StoredEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest accepted frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A single command executed by a backing node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeCommand {
    /// Read a value.
    Get { key: String },

    /// Read a value with its remaining TTL.
    GetWithTtl { key: String },

    /// Write a value.
    Set {
        key: String,
        value: Vec<u8>,
        ttl_ms: Option<u64>,
    },

    /// Delete a key.
    Del { key: String },

    /// Set a TTL on an existing key.
    Expire { key: String, ttl_ms: u64 },

    /// List keys by prefix.
    Keys { prefix: String },

    /// Liveness check.
    Ping,
}

/// The result of one command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeReply {
    /// Value for `Get`.
    Value(Option<Vec<u8>>),

    /// Entry for `GetWithTtl`.
    Entry(Option<StoredEntry>),

    /// Acknowledgement for `Set`.
    Ok,

    /// Whether the key existed, for `Del` and `Expire`.
    Existed(bool),

    /// Keys for `Keys`.
    Keys(Vec<String>),

    /// Reply to `Ping`.
    Pong,

    /// The command failed on the node.
    Error(String),
}

/// A batch of commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    /// Request id echoed in the response.
    pub request_id: u64,

    /// Commands to execute in order.
    pub commands: Vec<NodeCommand>,
}

impl NodeRequest {
    /// Create a request.
    pub fn new(request_id: u64, commands: Vec<NodeCommand>) -> Self {
        Self {
            request_id,
            commands,
        }
    }
}

/// Replies for a request, one per command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResponse {
    /// Id of the request being answered.
    pub request_id: u64,

    /// Replies in command order.
    pub replies: Vec<NodeReply>,
}

/// Frame a message with a length prefix for TCP transmission.
pub fn frame_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::SendFailed("message too large".to_string()).into());
    }

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);
    Ok(framed)
}

/// Write one framed message.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let framed = frame_message(msg)?;
    writer
        .write_all(&framed)
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Read one framed message. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Network(e.into())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::ReceiveFailed("message too large".to_string()).into());
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

    Ok(Some(bincode::deserialize(&data)?))
}
