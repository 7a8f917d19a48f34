//! Transport layer for dispatcher ↔ worker communication.
//!
//! A worker listens on a Unix-domain stream socket. Each exchange uses a
//! fresh connection: the dispatcher writes one JSON request and half-closes,
//! then reads the reply until the worker closes its end.

pub mod protocol;
pub mod unix_socket;

pub use protocol::{RequestContext, ResponseEnvelope, ServiceRequest};
pub use unix_socket::WorkerSocket;

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::status::{NeedsAction, Step};

/// Bytes requested per read from a worker.
const CHUNK_SIZE: usize = 8192;

/// Maximum response size (256 MB). Safety valve against runaway workers.
const MAX_RESPONSE_SIZE: usize = 256 * 1024 * 1024;

/// Write a request and half-close the stream.
pub async fn send_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    req: &ServiceRequest<'_>,
) -> Result<()> {
    let payload = req.encode()?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read a complete reply, waiting at most `chunk_timeout` for each chunk.
///
/// A stalled worker is reported as needs-action so the caller can replace
/// it; any other read error is a hard failure.
pub async fn recv_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    socket: &Path,
    chunk_timeout: Duration,
) -> Result<Step<Vec<u8>>> {
    let mut response = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        let Ok(read) = tokio::time::timeout(chunk_timeout, reader.read(&mut chunk)).await else {
            return Ok(Step::NeedsAction(NeedsAction::ResponseTimeout {
                socket: socket.to_path_buf(),
                timeout: chunk_timeout,
            }));
        };
        let n = read.with_context(|| format!("Failed to read from socket {}", socket.display()))?;
        if n == 0 {
            return Ok(Step::Ready(response));
        }

        ensure!(
            response.len() + n <= MAX_RESPONSE_SIZE,
            "Response from {} exceeds max size {MAX_RESPONSE_SIZE}",
            socket.display()
        );
        response.extend_from_slice(&chunk[..n]);
    }
}
