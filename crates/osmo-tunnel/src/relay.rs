//! Paired bidirectional relays.
//!
//! Both forwarding loops of a relay run concurrently; as soon as either one
//! stops (EOF or error) both endpoints are closed.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{ByteSink, ByteSource, ByteStream, TunnelError};

const RELAY_BUFFER: usize = 32 * 1024;

/// Bytes moved by one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Local endpoint to remote stream.
    pub bytes_to_remote: u64,
    /// Remote stream to local endpoint.
    pub bytes_to_local: u64,
    /// Why the relay stopped, if not a clean EOF.
    pub error: Option<String>,
}

async fn read_into_sink<R>(
    reader: &mut R,
    sink: &mut ByteSink,
    count: &mut u64,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.send(Bytes::copy_from_slice(&buf[..n])).await?;
        *count += n as u64;
    }
}

async fn source_into_writer<W>(
    source: &mut ByteSource,
    writer: &mut W,
    count: &mut u64,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        *count += chunk.len() as u64;
    }
    Ok(())
}

async fn source_into_sink(
    source: &mut ByteSource,
    sink: &mut ByteSink,
    count: &mut u64,
) -> Result<(), TunnelError> {
    while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        let len = chunk.len() as u64;
        sink.send(chunk).await?;
        *count += len;
    }
    Ok(())
}

/// Relay between a local byte stream (socket) and a remote session stream.
pub async fn relay_io<L>(local: L, remote: ByteStream) -> RelayStats
where
    L: AsyncRead + AsyncWrite + Send,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let ByteStream {
        mut sink,
        mut source,
    } = remote;
    let mut stats = RelayStats::default();

    let result = tokio::select! {
        r = read_into_sink(&mut local_rd, &mut sink, &mut stats.bytes_to_remote) => r,
        r = source_into_writer(&mut source, &mut local_wr, &mut stats.bytes_to_local) => r,
    };
    stats.error = result.err().map(|e| e.to_string());

    if let Err(e) = local_wr.shutdown().await {
        debug!("Local endpoint shutdown failed: {e}");
    }
    if let Err(e) = sink.close().await {
        debug!("Remote endpoint close failed: {e}");
    }
    stats
}

/// Relay frames between a local frame stream and a remote session stream.
pub async fn relay_frames(local: ByteStream, remote: ByteStream) -> RelayStats {
    let ByteStream {
        sink: mut local_sink,
        source: mut local_source,
    } = local;
    let ByteStream {
        sink: mut remote_sink,
        source: mut remote_source,
    } = remote;
    let mut stats = RelayStats::default();

    let result = tokio::select! {
        r = source_into_sink(&mut local_source, &mut remote_sink, &mut stats.bytes_to_remote) => r,
        r = source_into_sink(&mut remote_source, &mut local_sink, &mut stats.bytes_to_local) => r,
    };
    stats.error = result.err().map(|e| e.to_string());

    if let Err(e) = local_sink.close().await {
        debug!("Local endpoint close failed: {e}");
    }
    if let Err(e) = remote_sink.close().await {
        debug!("Remote endpoint close failed: {e}");
    }
    stats
}
