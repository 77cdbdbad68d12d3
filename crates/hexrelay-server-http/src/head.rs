//! Request head reading
//!
//! Only enough of the request is parsed to route it. Every byte read off the
//! socket is kept so it can be replayed to the agent unchanged.

use hexrelay_proto::HOST_HEADER;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Upper bound on bytes read while looking for the end of the head (64 KiB)
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("Connection closed before any data")]
    Closed,

    #[error("Connection closed before end of request head")]
    Truncated,

    #[error("Request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Invalid request head: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Routing-relevant parts of a request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    /// Value of the `X-Hexrelay-Host` header
    pub override_host: Option<String>,
    /// Length of the head including the blank line
    pub head_len: usize,
}

impl RequestHead {
    /// Try to parse a complete head from the start of `buffer`
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn parse(buffer: &[u8]) -> Result<Option<Self>, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(buffer) {
            Ok(httparse::Status::Complete(head_len)) => head_len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(HeadError::Invalid(e.to_string())),
        };

        let header_value = |name: &str| {
            req.headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case(name))
                .map(|header| String::from_utf8_lossy(header.value).trim().to_string())
        };

        Ok(Some(Self {
            method: req.method.unwrap_or("").to_string(),
            path: req.path.unwrap_or("").to_string(),
            host: header_value("host"),
            override_host: header_value(HOST_HEADER),
            head_len,
        }))
    }
}

/// Read from `reader` until a full request head is buffered
///
/// Returns the parsed head and every byte read so far, which may include the
/// start of the body.
pub async fn read_request_head<R>(
    reader: &mut R,
    max_size: usize,
) -> Result<(RequestHead, Vec<u8>), HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let remaining = max_size.saturating_sub(buffer.len());
        if remaining == 0 {
            return Err(HeadError::TooLarge(max_size));
        }

        let limit = remaining.min(READ_CHUNK);
        let n = reader.read(&mut chunk[..limit]).await?;
        if n == 0 {
            return Err(if buffer.is_empty() {
                HeadError::Closed
            } else {
                HeadError::Truncated
            });
        }
        buffer.extend_from_slice(&chunk[..n]);
        trace!("Buffered {} bytes of request head", buffer.len());

        if let Some(head) = RequestHead::parse(&buffer)? {
            return Ok((head, buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_complete_head() {
        let raw = b"GET /path HTTP/1.1\r\nHost: foo-hexrelay.example.com\r\nX-Hexrelay-Host: bar-hexrelay.example.com\r\n\r\nbody";
        let head = RequestHead::parse(raw).unwrap().unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/path");
        assert_eq!(head.host.as_deref(), Some("foo-hexrelay.example.com"));
        assert_eq!(head.override_host.as_deref(), Some("bar-hexrelay.example.com"));
        assert_eq!(head.head_len, raw.len() - 4);
    }

    #[test]
    fn test_header_names_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nHOST: a.b.c\r\nx-hexrelay-host: d.e.f\r\n\r\n";
        let head = RequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.host.as_deref(), Some("a.b.c"));
        assert_eq!(head.override_host.as_deref(), Some("d.e.f"));
    }

    #[test]
    fn test_partial_head() {
        assert_eq!(RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a").unwrap(), None);
    }

    #[test]
    fn test_invalid_head() {
        assert!(matches!(
            RequestHead::parse(b"\x00\x01 garbage\r\n\r\n"),
            Err(HeadError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_read_keeps_body_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let raw = b"POST /x HTTP/1.1\r\nHost: a.b.c\r\nContent-Length: 5\r\n\r\nhello";
        client.write_all(raw).await.unwrap();

        let (head, buffered) = read_request_head(&mut server, MAX_HEAD_SIZE).await.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(buffered, raw);
    }

    #[tokio::test]
    async fn test_read_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let reader = tokio::spawn(async move {
            read_request_head(&mut server, MAX_HEAD_SIZE).await
        });

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"Host: a.b.c\r\n\r\n").await.unwrap();

        let (head, buffered) = reader.await.unwrap().unwrap();
        assert_eq!(head.host.as_deref(), Some("a.b.c"));
        assert_eq!(buffered, b"GET / HTTP/1.1\r\nHost: a.b.c\r\n\r\n");
    }

    #[tokio::test]
    async fn test_read_limits() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(matches!(
            read_request_head(&mut server, MAX_HEAD_SIZE).await,
            Err(HeadError::Closed)
        ));

        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\nHost: a.b.c\r\n").await.unwrap();
        drop(client);
        assert!(matches!(
            read_request_head(&mut server, MAX_HEAD_SIZE).await,
            Err(HeadError::Truncated)
        ));

        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .await
            .unwrap();
        assert!(matches!(
            read_request_head(&mut server, 32).await,
            Err(HeadError::TooLarge(32))
        ));
    }
}
