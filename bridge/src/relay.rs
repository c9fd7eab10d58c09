use std::io;
use std::net::Shutdown;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::{BridgeError, Direction};

pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    /// False when the outbound flow was cut off after the grace period.
    pub outbound_completed: bool,
}

/// Relay bytes between `peer` and the local `input`/`output` until both
/// directions have closed.
///
/// Each direction runs as its own task. End of `input` half-closes the peer's
/// write side; end of the peer stream shuts `output` down. Once the peer is
/// done the outbound flow gets `grace` to finish before it is dropped. An I/O
/// error on either side aborts the other and fails the relay.
pub async fn relay<I, O>(
    peer: TcpStream,
    input: I,
    output: O,
    grace: Duration,
) -> Result<RelayReport, BridgeError>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let inbound_error = |source: io::Error| BridgeError::Io {
        direction: Direction::Inbound,
        source,
    };
    let std_peer = peer.into_std().map_err(inbound_error)?;
    let read_control = std_peer.try_clone().map_err(inbound_error)?;
    let peer = TcpStream::from_std(std_peer).map_err(inbound_error)?;

    let (peer_read, peer_write) = peer.into_split();
    let mut inbound = tokio::spawn(pump(peer_read, output, Direction::Inbound));
    let mut outbound = tokio::spawn(pump(input, peer_write, Direction::Outbound));

    let mut report = RelayReport::default();

    tokio::select! {
        joined = &mut inbound => {
            report.inbound_bytes = match settle(joined, Direction::Inbound) {
                Ok(bytes) => bytes,
                Err(err) => {
                    outbound.abort();
                    return Err(err);
                }
            };
            close_peer_read(&read_control);

            match tokio::time::timeout(grace, &mut outbound).await {
                Ok(joined) => match settle(joined, Direction::Outbound) {
                    Ok(bytes) => {
                        report.outbound_bytes = bytes;
                        report.outbound_completed = true;
                    }
                    Err(BridgeError::Io { source, .. }) if peer_gone(&source) => {
                        debug!("Agent went away before input was drained: {}", source);
                    }
                    Err(err) => return Err(err),
                },
                Err(_) => {
                    outbound.abort();
                    debug!("Input still open {:?} after agent closed; finishing", grace);
                }
            }
        }
        joined = &mut outbound => {
            report.outbound_bytes = match settle(joined, Direction::Outbound) {
                Ok(bytes) => bytes,
                Err(err) => {
                    inbound.abort();
                    return Err(err);
                }
            };
            report.outbound_completed = true;
            report.inbound_bytes = settle(inbound.await, Direction::Inbound)?;
            close_peer_read(&read_control);
        }
    }

    Ok(report)
}

async fn pump<R, W>(mut reader: R, mut writer: W, direction: Direction) -> Result<u64, BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let io_error = |source: io::Error| BridgeError::Io { direction, source };
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await.map_err(io_error)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(io_error)?;
        writer.flush().await.map_err(io_error)?;
        total += n as u64;
    }

    writer.shutdown().await.map_err(io_error)?;
    debug!("{} closed after {} bytes", direction, total);
    Ok(total)
}

fn settle(
    joined: Result<Result<u64, BridgeError>, JoinError>,
    direction: Direction,
) -> Result<u64, BridgeError> {
    match joined {
        Ok(result) => result,
        Err(err) => {
            warn!("{} task ended abnormally: {}", direction, err);
            Err(BridgeError::Task {
                direction,
                message: err.to_string(),
            })
        }
    }
}

/// An owned read half cannot shut itself down, so a duplicate handle stops
/// reads on the socket once the peer has finished sending.
fn close_peer_read(control: &std::net::TcpStream) {
    if let Err(err) = control.shutdown(Shutdown::Read) {
        debug!("Peer read side already closed: {}", err);
    }
}

fn peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}
