// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Minimal HTTP/1.1 over an established TLS stream: one request in, one
//! response out. No request bodies, no keep-alive, no transfer encodings.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ConnectionError;

/// Size of the request read buffer. A request that does not complete within
/// this many bytes terminates the connection.
pub(crate) const READ_BUF_LEN: usize = 4096;

const MAX_HEADERS: usize = 100;

pub(crate) const STATUS_OK: &str = "HTTP/1.1 200 OK";
pub(crate) const STATUS_NOT_FOUND: &str = "HTTP/1.1 404 Not Found";
pub(crate) const STATUS_METHOD_NOT_ALLOWED: &str = "HTTP/1.1 405 Method Not Allowed";

pub(crate) const CONTENT_TYPE_JSON: &str = "Content-Type: application/json";

/// A parsed request line.
pub(crate) struct Request {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) minor_version: u8,
}

/// Read one request from `stream`, re-running the incremental parser after
/// every read until it completes, fails, or the buffer fills.
pub(crate) async fn read_request<S>(stream: &mut S) -> Result<Request, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0_u8; READ_BUF_LEN];
    let mut len = 0;
    loop {
        let read = stream
            .read(&mut buf[len..])
            .await
            .map_err(ConnectionError::Read)?;
        if read == 0 {
            return Err(ConnectionError::Read(
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }
        len += read;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf[..len])? {
            httparse::Status::Complete(_) => {
                return Ok(Request {
                    method: parsed.method.unwrap_or_default().to_owned(),
                    path: parsed.path.unwrap_or_default().to_owned(),
                    minor_version: parsed.version.unwrap_or_default(),
                });
            }
            httparse::Status::Partial if len == buf.len() => {
                return Err(ConnectionError::TooLong);
            }
            httparse::Status::Partial => {}
        }
    }
}

/// Write one response and flush it: status line, `\r\n`-terminated header
/// lines, blank line, body, trailing `\r\n\r\n`. No `Content-Length` is
/// emitted; clients read until end-of-stream.
pub(crate) async fn write_response<S>(
    stream: &mut S,
    status: &str,
    headers: &[&str],
    body: &[u8],
) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(status.len() + body.len() + 64);
    message.extend_from_slice(status.as_bytes());
    message.extend_from_slice(b"\r\n");
    for header in headers {
        message.extend_from_slice(header.as_bytes());
        message.extend_from_slice(b"\r\n");
    }
    message.extend_from_slice(b"\r\n");
    message.extend_from_slice(body);
    message.extend_from_slice(b"\r\n\r\n");

    stream
        .write_all(&message)
        .await
        .map_err(ConnectionError::Write)?;
    stream.flush().await.map_err(ConnectionError::Write)
}
