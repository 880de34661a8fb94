// SPDX-License-Identifier: MIT

//! Message framing: `Name: Value\r\n` headers, a blank line, then the
//! body.
//!
//! Messages with an unknown `Content-Type` and a valid `Content-Length`
//! are skipped; an unknown type without a length is unrecoverable
//! because the body boundary is lost, and the connection must be torn
//! down.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Body is a single JSON-RPC 2.0 message.
pub const CONTENT_TYPE_JSON: &str = "application/zb-store-rpc+json";
/// Body is an export stream (self-terminating).
pub const CONTENT_TYPE_EXPORT: &str = "application/zb-store-export";

/// Correlates an export body with the JSON-RPC request it answers.
pub const EXPORT_ID_HEADER: &str = "Zb-Export-Id";

/// JSON-RPC bodies are bounded.
pub const MAX_JSON_BODY: u64 = 1024 * 1024;
/// A single header line cannot plausibly exceed this.
const MAX_HEADER_LINE: usize = 8 * 1024;
const MAX_HEADER_COUNT: usize = 64;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The framing is broken; the connection cannot continue.
    #[error("unrecoverable framing error: {0}")]
    Unrecoverable(String),
}

/// Header block of one message.
#[derive(Clone, Debug, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Case-insensitive lookup of the first header named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> Result<Option<u64>, FrameError> {
        match self.get("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .parse::<u64>()
                .map(Some)
                .map_err(|_| FrameError::Unrecoverable(format!("bad Content-Length {v:?}"))),
        }
    }
}

/// A parsed message head, with JSON bodies already consumed.
#[derive(Debug)]
pub enum Frame {
    /// A complete JSON-RPC body.
    Json(Vec<u8>),
    /// An export stream follows on the connection; the caller must
    /// consume it (it is self-terminating) before reading more frames.
    Export {
        export_id: Option<String>,
        content_length: Option<u64>,
    },
}

async fn read_header_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<String>, FrameError> {
    let mut line = String::new();
    let mut limited = reader.take(MAX_HEADER_LINE as u64);
    let n = limited.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with("\r\n") {
        return Err(FrameError::Unrecoverable(format!(
            "header line missing CRLF: {line:?}"
        )));
    }
    line.truncate(line.len() - 2);
    Ok(Some(line))
}

/// Read the next message. Returns `Ok(None)` on a clean end of stream
/// (EOF at a message boundary).
pub async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, FrameError> {
    loop {
        let mut headers = Headers::default();

        // Header block.
        let Some(first) = read_header_line(reader).await? else {
            return Ok(None);
        };
        let mut line = first;
        loop {
            if line.is_empty() {
                break;
            }
            if headers.0.len() >= MAX_HEADER_COUNT {
                return Err(FrameError::Unrecoverable("too many headers".into()));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::Unrecoverable(format!("malformed header {line:?}")))?;
            headers
                .0
                .push((name.trim().to_string(), value.trim().to_string()));

            line = read_header_line(reader)
                .await?
                .ok_or_else(|| FrameError::Unrecoverable("EOF inside header block".into()))?;
        }

        let content_length = headers.content_length()?;
        let content_type = headers.get("Content-Type").unwrap_or(CONTENT_TYPE_JSON);

        if content_type.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
            let len = content_length.ok_or_else(|| {
                FrameError::Unrecoverable("JSON message without Content-Length".into())
            })?;
            if len > MAX_JSON_BODY {
                return Err(FrameError::Unrecoverable(format!(
                    "JSON body of {len} bytes exceeds the {MAX_JSON_BODY} byte bound"
                )));
            }
            let mut body = vec![0u8; len as usize];
            reader.read_exact(&mut body).await?;
            return Ok(Some(Frame::Json(body)));
        }

        if content_type.eq_ignore_ascii_case(CONTENT_TYPE_EXPORT) {
            return Ok(Some(Frame::Export {
                export_id: headers.get(EXPORT_ID_HEADER).map(str::to_string),
                content_length,
            }));
        }

        // Unknown type: skip it if we know where it ends.
        match content_length {
            Some(len) => {
                tracing::debug!(content_type, len, "skipping message of unknown type");
                let skipped = tokio::io::copy(&mut reader.take(len), &mut tokio::io::sink()).await?;
                if skipped != len {
                    return Err(FrameError::Unrecoverable("EOF inside skipped body".into()));
                }
            }
            None => {
                return Err(FrameError::Unrecoverable(format!(
                    "message of unknown type {content_type:?} with no Content-Length"
                )));
            }
        }
    }
}

/// Write a JSON message.
pub async fn write_json_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let head = format!(
        "Content-Length: {}\r\nContent-Type: {CONTENT_TYPE_JSON}\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Write the head of an export message; the caller streams the export
/// body (including its terminator) directly afterwards.
pub async fn write_export_frame_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    export_id: Option<&str>,
    content_length: Option<u64>,
) -> io::Result<()> {
    let mut head = String::new();
    if let Some(len) = content_length {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str(&format!("Content-Type: {CONTENT_TYPE_EXPORT}\r\n"));
    if let Some(id) = export_id {
        head.push_str(&format!("{EXPORT_ID_HEADER}: {id}\r\n"));
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await
}
