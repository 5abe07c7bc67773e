// Hello exchange - one JSON line each way carrying the peers' identities

use crate::{PeerId, ProximityError, Result};
use serde::{Deserialize, Serialize};
use shared::Identity;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub const HELLO_VERSION: u8 = 1;

/// Upper bound on a hello line, identity strings are capped at 255 bytes each
const MAX_HELLO_LEN: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    pub peer_id: PeerId,
    pub identity: Identity,
}

impl Hello {
    pub fn new(peer_id: impl Into<PeerId>, identity: Identity) -> Self {
        Self {
            version: HELLO_VERSION,
            peer_id: peer_id.into(),
            identity,
        }
    }
}

pub async fn write_hello<W>(writer: &mut W, hello: &Hello) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(hello)?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| ProximityError::NetworkError(format!("Failed to send hello: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| ProximityError::NetworkError(format!("Failed to flush hello: {}", e)))
}

pub async fn read_hello<R>(reader: &mut R) -> Result<Hello>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = BufReader::new(reader.take(MAX_HELLO_LEN))
        .read_line(&mut line)
        .await
        .map_err(|e| ProximityError::NetworkError(format!("Failed to read hello: {}", e)))?;

    if read == 0 {
        return Err(ProximityError::NetworkError(
            "Peer closed the connection before hello".to_string(),
        ));
    }
    if !line.ends_with('\n') {
        return Err(ProximityError::InvalidInput("Hello line too long".to_string()));
    }

    let hello: Hello = serde_json::from_str(line.trim_end())?;
    if hello.version != HELLO_VERSION {
        return Err(ProximityError::InvalidInput(format!(
            "Unsupported hello version {} (expected {})",
            hello.version, HELLO_VERSION
        )));
    }
    hello.identity.validate()?;

    Ok(hello)
}

/// Outbound side: send ours, then read theirs
pub async fn initiate<S>(stream: &mut S, local: &Hello) -> Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_hello(stream, local).await?;
    read_hello(stream).await
}

/// Inbound side: read theirs, then send ours
pub async fn respond<S>(stream: &mut S, local: &Hello) -> Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = read_hello(stream).await?;
    write_hello(stream, local).await?;
    Ok(remote)
}
