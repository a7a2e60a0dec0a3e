//! Newline-delimited message framing for JSON-RPC over TCP.
//!
//! Each message is one line of UTF-8 JSON terminated by `\n`. A trailing
//! `\r` is tolerated and stripped so peers writing CRLF still interoperate.
//!
//! # Wire Format
//!
//! ```text
//! {"jsonrpc":"2.0","id":1,"method":"debug/run","params":{}}\n
//! {"jsonrpc":"2.0","method":"debug/output","params":{"text":"..."}}\n
//! ```
//!
//! Framing only splits lines. Whether a line is valid JSON is decided by
//! [`Message::decode`](super::message::Message::decode).

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum line size (16MB) to prevent OOM from malicious/buggy peers.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Read one line from the stream.
///
/// Returns `Ok(None)` on a clean EOF. A final line without a terminator is
/// still returned. The terminator is not part of the returned bytes.
///
/// # Errors
///
/// Returns an error if:
/// - The underlying read fails
/// - The line exceeds MAX_MESSAGE_SIZE before a terminator is seen
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = (MAX_MESSAGE_SIZE + 1) as u64;
    let bytes_read = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut line)
        .await
        .context("Failed to read message line")?;

    // EOF - connection closed
    if bytes_read == 0 {
        return Ok(None);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if line.len() > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Message size exceeds maximum {} bytes",
            MAX_MESSAGE_SIZE
        ));
    }

    Ok(Some(line))
}

/// Write one message line and flush.
///
/// `body` must not contain a newline; compact `serde_json` output never does.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_message<W>(writer: &mut W, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.extend_from_slice(body.as_bytes());
    frame.push(b'\n');

    writer
        .write_all(&frame)
        .await
        .context("Failed to write message")?;

    writer.flush().await.context("Failed to flush message")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, BufReader};
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (client, server) = duplex(1024);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let mut reader = BufReader::new(server);

        let message = r#"{"jsonrpc":"2.0","method":"test","id":1}"#;
        write_message(&mut client_write, message)
            .await
            .expect("Write failed");

        let received = timeout(TEST_TIMEOUT, read_message(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed")
            .expect("Unexpected EOF");

        assert_eq!(received, message.as_bytes());
    }

    #[tokio::test]
    async fn test_read_multiple_lines_in_one_chunk() {
        let (mut client, server) = duplex(1024);
        let mut reader = BufReader::new(server);

        client
            .write_all(b"{\"a\":1}\n{\"b\":2}\n")
            .await
            .expect("Write failed");

        let first = read_message(&mut reader).await.unwrap().unwrap();
        let second = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, b"{\"a\":1}");
        assert_eq!(second, b"{\"b\":2}");
    }

    #[tokio::test]
    async fn test_read_strips_crlf() {
        let (mut client, server) = duplex(1024);
        let mut reader = BufReader::new(server);

        client.write_all(b"{\"test\":true}\r\n").await.unwrap();

        let received = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(received, b"{\"test\":true}");
    }

    #[tokio::test]
    async fn test_read_unterminated_final_line() {
        let (mut client, server) = duplex(1024);
        let mut reader = BufReader::new(server);

        client.write_all(b"{\"tail\":1}").await.unwrap();
        drop(client);

        let received = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(received, b"{\"tail\":1}");
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connection_closed_returns_none() {
        let (client, server) = duplex(64);
        drop(client);

        let mut reader = BufReader::new(server);
        let result = timeout(TEST_TIMEOUT, read_message(&mut reader))
            .await
            .expect("Test timed out")
            .expect("EOF should not be an error");

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_message() {
        let (mut client, server) = duplex(64 * 1024);
        let mut reader = BufReader::new(server);

        let writer = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            let mut written = 0;
            while written <= MAX_MESSAGE_SIZE {
                if client.write_all(&chunk).await.is_err() {
                    break;
                }
                written += chunk.len();
            }
        });

        let result = timeout(TEST_TIMEOUT, read_message(&mut reader))
            .await
            .expect("Test timed out");

        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("exceeds maximum"),
            "Expected size error, got: {}",
            err_msg
        );

        drop(reader);
        let _ = writer.await;
    }
}
