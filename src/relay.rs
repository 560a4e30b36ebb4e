//! Byte relays between a client and its backend.
//!
//! Both relays forward bytes opaquely and end as soon as either side reports
//! end-of-stream. Every chunk read is written out in full before the next
//! read on that side, so no byte is dropped or reordered within a direction.

use anyhow::{Context, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToBackend => f.write_str("client->backend"),
            Self::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// Copies `reader` into `writer` until `reader` reaches end-of-stream.
async fn copy_one_way<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    direction: Direction,
    total: &mut u64,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .with_context(|| format!("Failed to read ({direction})"))?;
        if n == 0 {
            debug!(%direction, "Stream closed");
            return Ok(());
        }

        debug!(%direction, bytes = n, "Forwarding data");
        writer
            .write_all(&buffer[..n])
            .await
            .with_context(|| format!("Failed to write {n} bytes ({direction})"))?;
        *total += n as u64;
    }
}

/// Forwards both directions concurrently until the first one stops.
///
/// Used for WebSocket upgrades, where either peer may talk at any time for
/// the life of the connection. The direction still running when the other
/// stops is abandoned; closing the streams afterwards is the caller's job.
pub async fn relay_full_duplex<C, B>(
    client: &mut C,
    backend: &mut B,
    buffer_size: usize,
) -> Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = RelayStats::default();
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut backend_reader, mut backend_writer) = tokio::io::split(backend);

    let client_to_backend = copy_one_way(
        &mut client_reader,
        &mut backend_writer,
        buffer_size,
        Direction::ClientToBackend,
        &mut stats.client_to_backend,
    );
    let backend_to_client = copy_one_way(
        &mut backend_reader,
        &mut client_writer,
        buffer_size,
        Direction::BackendToClient,
        &mut stats.backend_to_client,
    );

    let result = tokio::select! {
        result = client_to_backend => result,
        result = backend_to_client => result,
    };
    result?;

    Ok(stats)
}

enum Ready {
    Client(std::io::Result<usize>),
    Backend(std::io::Result<usize>),
}

/// Forwards whichever side has data ready, one chunk at a time, from a single
/// loop.
///
/// Used for plain connections. Waits on both reads at once; the read that
/// completes first is forwarded to the other side before waiting again.
pub async fn relay_multiplexed<C, B>(
    client: &mut C,
    backend: &mut B,
    buffer_size: usize,
) -> Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = RelayStats::default();
    let mut client_buffer = vec![0u8; buffer_size];
    let mut backend_buffer = vec![0u8; buffer_size];

    loop {
        // `read` is cancel safe: the losing branch has consumed nothing.
        let ready = tokio::select! {
            result = client.read(&mut client_buffer) => Ready::Client(result),
            result = backend.read(&mut backend_buffer) => Ready::Backend(result),
        };

        match ready {
            Ready::Client(result) => {
                let n = result.context("Failed to read from client")?;
                if n == 0 {
                    debug!(direction = %Direction::ClientToBackend, "Stream closed");
                    break;
                }
                debug!(direction = %Direction::ClientToBackend, bytes = n, "Forwarding data");
                backend
                    .write_all(&client_buffer[..n])
                    .await
                    .with_context(|| format!("Failed to write {n} bytes to backend"))?;
                stats.client_to_backend += n as u64;
            }
            Ready::Backend(result) => {
                let n = result.context("Failed to read from backend")?;
                if n == 0 {
                    debug!(direction = %Direction::BackendToClient, "Stream closed");
                    break;
                }
                debug!(direction = %Direction::BackendToClient, bytes = n, "Forwarding data");
                client
                    .write_all(&backend_buffer[..n])
                    .await
                    .with_context(|| format!("Failed to write {n} bytes to client"))?;
                stats.backend_to_client += n as u64;
            }
        }
    }

    Ok(stats)
}
