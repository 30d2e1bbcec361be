//! Line-delimited JSON framing (spec.md §6): newline is the only frame
//! delimiter, one JSON value per line, line length capped at 1 MiB.

use crate::error::{IpcError, IpcResult};
use crate::protocol::Message;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reads frames off `reader` one at a time. Returns `Ok(None)` at clean
/// EOF. A line over the size cap is reported as an error but does not
/// close the stream — the caller decides whether to keep reading past a
/// single oversized line.
pub struct FrameReader<R> {
    lines: tokio::io::Lines<BufReader<R>>,
}

impl<R: tokio::io::AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Reads the next line and parses it. `Ok(Ok(msg))` is a well-formed
    /// message; `Ok(Err(_))` is a line that was read but failed to parse
    /// (spec.md §4.13: logged and dropped, the loop continues); `Ok(None)`
    /// is EOF.
    pub async fn next_frame(&mut self) -> IpcResult<Option<Result<Message, IpcError>>> {
        let line = match self.lines.next_line().await? {
            Some(line) => line,
            None => return Ok(None),
        };
        if line.len() > MAX_LINE_BYTES {
            return Ok(Some(Err(IpcError::LineTooLong)));
        }
        if line.trim().is_empty() {
            return Ok(Some(Err(IpcError::Malformed("empty line".to_string()))));
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(msg) => Ok(Some(Ok(msg))),
            Err(e) => Ok(Some(Err(IpcError::Malformed(e.to_string())))),
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, message: &Message) -> IpcResult<()> {
        let mut line = serde_json::to_vec(message).map_err(|e| IpcError::Malformed(e.to_string()))?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JobOutcome;
    use roboppi_common::JobId;
    use std::time::Duration;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let msg = Message::Heartbeat {
            timestamp: chrono::Utc::now(),
        };
        writer.write_frame(&msg).await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(server);
        let frame = reader.next_frame().await.unwrap().unwrap().unwrap();
        assert!(matches!(frame, Message::Heartbeat { .. }));
    }

    #[tokio::test]
    async fn malformed_line_is_reported_without_closing_the_stream() {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"not json\n").await.unwrap();
        let msg = Message::JobCompleted {
            job_id: JobId::new(),
            outcome: JobOutcome::Succeeded,
            result: roboppi_common::WorkerResult::cancelled(Duration::from_millis(1)),
        };
        let body = serde_json::to_vec(&msg).unwrap();
        client.write_all(&body).await.unwrap();
        client.write_all(b"\n").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        let first = reader.next_frame().await.unwrap().unwrap();
        assert!(first.is_err());
        let second = reader.next_frame().await.unwrap().unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(reader.next_frame().await.unwrap().is_none());
    }
}
