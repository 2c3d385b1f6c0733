//! TCP transport and line framing

use crate::constants::{DIAL_TIMEOUT_MS, MAX_LINE_LENGTH};
use crate::engine::Op;
use crate::error::{PbxError, PbxResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Establish the engine connection with a dial timeout.
pub(crate) async fn dial(host: &str, port: u16) -> PbxResult<TcpStream> {
    match timeout(
        Duration::from_millis(DIAL_TIMEOUT_MS),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(stream)) => {
            debug!("[CONNECT] TCP connection established to {}:{}", host, port);
            Ok(stream)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(PbxError::Io(e))
        }
        Err(_) => {
            warn!("[CONNECT] TCP connect timed out after {}ms", DIAL_TIMEOUT_MS);
            Err(PbxError::Timeout {
                timeout_ms: DIAL_TIMEOUT_MS,
            })
        }
    }
}

/// Spawn the reader task for one socket.
///
/// Each received line re-enters the session as an [`Op::Line`] tagged with
/// the socket generation, so lines from a replaced socket are discarded by
/// the receiver. EOF and read errors turn into [`Op::SocketClosed`].
pub(crate) fn spawn_reader(
    read_half: OwnedReadHalf,
    socket: u64,
    ops: WeakUnboundedSender<Op>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        let error = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if line.len() > MAX_LINE_LENGTH {
                        warn!("dropping over-long line ({} bytes)", line.len());
                        continue;
                    }
                    trace!(socket, "recv line: {}", line);
                    let Some(ops) = ops.upgrade() else { return };
                    if ops.send(Op::Line { socket, line }).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!(socket, "connection closed (EOF)");
                    break None;
                }
                Err(e) => {
                    warn!(socket, "read error: {}", e);
                    break Some(e.to_string());
                }
            }
        };
        if let Some(ops) = ops.upgrade() {
            let _ = ops.send(Op::SocketClosed { socket, error });
        }
    })
}

/// Write half of the engine socket; one newline-terminated line at a time,
/// no batching.
pub(crate) struct LineWriter {
    writer: OwnedWriteHalf,
}

impl LineWriter {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        LineWriter { writer }
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        trace!("send line: {}", line);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }
}

impl std::fmt::Debug for LineWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineWriter").finish()
    }
}
