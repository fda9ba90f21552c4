//! Content-Length framed JSON messages exchanged with a worker over stdio.

use crate::logging::WORKER_PROTOCOL_TARGET;
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Refuse frames larger than this; a bogus header would otherwise make us
/// allocate whatever the peer claims.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub id: u64,
    pub exit_code: i32,
    pub output: String,
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_string(message)?;
    trace!(target: WORKER_PROTOCOL_TARGET, ">>> {}", body);

    let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// before a new frame started.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if saw_header {
                return Err(anyhow!("stream closed inside frame header"));
            }
            return Ok(None);
        }
        saw_header = true;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("invalid Content-Length: {value}"))?;
                content_length = Some(len);
            }
        } else {
            return Err(anyhow!("invalid header line: {line:?}"));
        }
    }

    let len = content_length.ok_or_else(|| anyhow!("frame without Content-Length"))?;
    if len > MAX_FRAME_SIZE {
        return Err(anyhow!("frame of {len} bytes exceeds limit"));
    }

    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    trace!(
        target: WORKER_PROTOCOL_TARGET,
        "<<< {}",
        String::from_utf8_lossy(&body)
    );

    Ok(Some(serde_json::from_slice(&body)?))
}
