//! In-memory language server peer for tests.

use std::time::Duration;

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use crate::codec::{FrameReader, FrameWriter};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) type ClientReader = ReadHalf<DuplexStream>;
pub(crate) type ClientWriter = WriteHalf<DuplexStream>;

/// The server end of a duplex pipe, driven frame by frame from a test.
pub(crate) struct FakeServer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: Option<FrameWriter<WriteHalf<DuplexStream>>>,
}

impl FakeServer {
    /// Returns the client's transport halves and the server driving them.
    pub fn pair() -> ((ClientReader, ClientWriter), Self) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        (
            (client_read, client_write),
            Self {
                reader: FrameReader::new(server_read),
                writer: Some(FrameWriter::new(server_write)),
            },
        )
    }

    pub async fn recv(&mut self) -> serde_json::Value {
        tokio::time::timeout(WAIT, self.reader.read_frame())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client frame is well formed")
            .expect("client closed the stream")
    }

    /// Receive one frame and check its method.
    pub async fn expect(&mut self, method: &str) -> serde_json::Value {
        let frame = self.recv().await;
        assert_eq!(frame["method"], method, "unexpected frame {frame}");
        frame
    }

    /// `true` once the client has closed its write side.
    pub async fn recv_eof(&mut self) -> bool {
        matches!(
            tokio::time::timeout(WAIT, self.reader.read_frame()).await,
            Ok(Ok(None) | Err(_))
        )
    }

    pub async fn send(&mut self, frame: serde_json::Value) {
        self.writer
            .as_mut()
            .expect("server already hung up")
            .write_frame(&frame)
            .await
            .expect("client is reading");
    }

    pub async fn reply(&mut self, request: &serde_json::Value, result: serde_json::Value) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": result
        }))
        .await;
    }

    pub async fn reply_error(&mut self, request: &serde_json::Value, code: i64, message: &str) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": code, "message": message }
        }))
        .await;
    }

    pub async fn notify(&mut self, method: &str, params: serde_json::Value) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        }))
        .await;
    }

    /// Close the server's write side so the client sees end of stream.
    pub async fn hang_up(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await.expect("shutting down server writer");
        }
    }
}

/// A clangd `initialize` result with everything the client requires.
pub(crate) fn clangd_capabilities() -> serde_json::Value {
    serde_json::json!({
        "capabilities": {
            "astProvider": true,
            "workspaceSymbolProvider": true,
            "documentSymbolProvider": true,
            "textDocumentSync": { "openClose": true, "change": 2 }
        },
        "serverInfo": { "name": "clangd", "version": "17.0.6" }
    })
}
