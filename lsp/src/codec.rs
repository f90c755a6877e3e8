//! `Content-Length` framing for JSON-RPC over the server's stdio.
//!
//! Each message is `Content-Length: N\r\n\r\n` followed by N bytes of JSON.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body. clangd symbol answers for a full
/// firmware tree stay well below this.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read one frame.
    ///
    /// `Ok(None)` means the stream ended cleanly between frames. EOF inside
    /// a header block or body is an error.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(content_length) = self.read_content_length().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            bail!("frame of {content_length} bytes exceeds limit of {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        serde_json::from_slice(&body)
            .map(Some)
            .context("frame body is not JSON")
    }

    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut line = String::new();
        let mut in_header_block = false;

        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading header line")?;

            if read == 0 {
                if in_header_block {
                    bail!("stream ended inside a header block");
                }
                return Ok(None);
            }
            in_header_block = true;

            let header = line.trim();
            if header.is_empty() {
                break;
            }

            let Some((name, value)) = header.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let len = value
                    .trim()
                    .parse()
                    .with_context(|| format!("bad Content-Length `{}`", value.trim()))?;
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .context("header block has no Content-Length")
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let body = serde_json::to_vec(msg).context("serializing frame")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")
    }

    /// Close the write side so the peer sees EOF.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing writer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    #[tokio::test]
    async fn test_written_frames_read_back_in_order() {
        let open = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": { "textDocument": { "uri": "file:///fw/keymap.c" } }
        });
        let close = serde_json::json!({"jsonrpc": "2.0", "method": "textDocument/didClose"});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&open).await.unwrap();
        writer.write_frame(&close).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), open);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), close);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_header_name_is_case_insensitive_and_extra_headers_ignored() {
        let body = r#"{"jsonrpc":"2.0","id":7,"result":null}"#;
        let frame = format!(
            "content-type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut reader = FrameReader::new(frame.as_bytes());
        let value = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(value["id"], 7);
    }

    #[tokio::test]
    async fn test_length_counts_bytes_not_chars() {
        // "ü" is two bytes.
        let frame = framed(r#"{"name":"Grüße"}"#);
        let mut reader = FrameReader::new(frame.as_slice());
        let value = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(value["name"], "Grüße");
    }

    #[tokio::test]
    async fn test_truncated_input_is_an_error() {
        for input in [
            &b"Content-Length: 10\r\n"[..],
            &b"Content-Length: 50\r\n\r\n{}"[..],
            &b"Content-Type: text/plain\r\n\r\n{}"[..],
            &b"Content-Length: ten\r\n\r\n"[..],
        ] {
            let mut reader = FrameReader::new(input);
            assert!(reader.read_frame().await.is_err(), "{input:?}");
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_allocation() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_non_json_body_is_an_error() {
        let frame = framed("I[12:00:00.000] clangd version 17");
        let mut reader = FrameReader::new(frame.as_slice());
        assert!(reader.read_frame().await.is_err());
    }
}
