//! Rendezvous wire protocol
//!
//! One request per connection. Each message is a single line of JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::hashing::Fingerprint;

/// Largest accepted frame, newline included.
pub const MAX_FRAME_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame exceeds {} bytes", MAX_FRAME_BYTES)]
    FrameTooLarge,

    #[error("Peer closed the connection")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Submit { fingerprint: Fingerprint, formula: String },
    Status { fingerprint: Fingerprint },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Accepted { already_pending: bool },
    Status { pending: bool },
    Rejected { reason: String },
    /// The worker is going idle and takes no more work.
    ShuttingDown,
}

/// One frame, newline included, refused if the peer would not accept it.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    if line.len() as u64 > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge);
    }
    Ok(line)
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode(message)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R, T>(reader: R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut limited = BufReader::new(reader.take(MAX_FRAME_BYTES));
    let mut line = String::new();
    let read = limited.read_line(&mut line).await?;
    if read == 0 {
        return Err(ProtocolError::Closed);
    }
    if !line.ends_with('\n') {
        return Err(if read as u64 >= MAX_FRAME_BYTES {
            ProtocolError::FrameTooLarge
        } else {
            ProtocolError::Closed
        });
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let fp = Fingerprint::of("x^2");
        let json = serde_json::to_value(Request::Status { fingerprint: fp.clone() }).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["fingerprint"], fp.as_str());
    }

    #[test]
    fn test_request_with_bad_fingerprint_rejected() {
        let raw = r#"{"type":"status","fingerprint":"../x"}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[tokio::test]
    async fn test_message_over_duplex() {
        let (mut client, server) = tokio::io::duplex(4096);
        let request = Request::Submit {
            fingerprint: Fingerprint::of("a"),
            formula: "a".into(),
        };
        write_message(&mut client, &request).await.unwrap();
        let got: Request = read_message(server).await.unwrap();
        assert_eq!(got, request);
    }

    #[tokio::test]
    async fn test_closed_before_newline() {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"{\"type\":").await.unwrap();
        drop(client);
        let got: Result<Response, _> = read_message(server).await;
        assert!(matches!(got, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_not_sent() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let formula = "\\".repeat(MAX_FRAME_BYTES as usize / 2);
        let request = Request::Submit {
            fingerprint: Fingerprint::of(&formula),
            formula,
        };
        let err = write_message(&mut client, &request).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge));

        drop(client);
        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        assert!(sent.is_empty());
    }
}
