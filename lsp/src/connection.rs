//! JSON-RPC connection over the language server's stdio.
//!
//! A writer task drains an outgoing queue into a [`FrameWriter`]; a reader
//! task resolves pending calls from responses and hands everything else to
//! a [`Handler`]. When the reader stops, for any reason, every pending call
//! is failed at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::LspError;
use crate::protocol::{Notification, Request, Response};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// How long `close()` lets queued frames drain before giving up on them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// A message from the server that did not answer one of our calls.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Present for server requests, absent for notifications.
    pub id: Option<serde_json::Value>,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

impl Inbound {
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }
}

/// Receives every inbound message that is not a response.
///
/// The returned value becomes the `result` of the reply when the message is
/// a server request; for notifications it is discarded.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: &Inbound) -> serde_json::Value;
}

struct Inner {
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: CancellationToken,
    request_timeout: Duration,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Start the reader and writer tasks and return the calling side.
    pub fn serve<R, W, H>(reader: R, writer: W, handler: H, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        H: Handler,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_closed = closed.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("LSP write error: {e:#}");
                            writer_closed.cancel();
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        if let Err(e) = writer.shutdown().await {
                            tracing::debug!("closing LSP writer: {e:#}");
                        }
                        break;
                    }
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_closed = closed.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                let frame = tokio::select! {
                    () = reader_closed.cancelled() => break,
                    frame = reader.read_frame() => frame,
                };
                match frame {
                    Ok(Some(frame)) => {
                        dispatch_frame(&frame, &reader_pending, &reader_writer_tx, &handler).await;
                    }
                    Ok(None) => {
                        tracing::info!("language server closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("LSP read error: {e:#}");
                        break;
                    }
                }
            }
            reader_closed.cancel();
            // Dropping the senders fails every waiting call.
            reader_pending.lock().await.clear();
        });

        Self {
            inner: Arc::new(Inner {
                writer_tx,
                next_id: AtomicU64::new(1),
                pending,
                closed,
                request_timeout,
                tasks: Mutex::new(Some((reader_handle, writer_handle))),
            }),
        }
    }

    /// Send a request and wait for its reply.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, LspError> {
        if self.is_closed() {
            return Err(LspError::Transport(format!(
                "connection closed before `{method}`"
            )));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        // The reader may have drained the table between the check above and
        // the insert.
        if self.is_closed() {
            self.inner.pending.lock().await.remove(&id);
            return Err(LspError::Transport(format!(
                "connection closed before `{method}`"
            )));
        }

        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| LspError::Transport(format!("serializing `{method}`: {e}")));
        let sent = match frame {
            Ok(frame) => self
                .inner
                .writer_tx
                .send(WriterCommand::Send(frame))
                .await
                .map_err(|_| LspError::Transport(String::from("writer channel closed"))),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        tracing::debug!(id, method, "request sent");

        let body = match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => {
                self.inner.pending.lock().await.remove(&id);
                return Err(LspError::Transport(format!(
                    "connection closed while waiting for `{method}`"
                )));
            }
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                return Err(LspError::Timeout {
                    method: method.to_string(),
                });
            }
        };

        response_result(method, body)
    }

    /// Queue a notification. Success means the frame was queued, not that
    /// the server acted on it.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), LspError> {
        if self.is_closed() {
            return Err(LspError::Transport(format!(
                "connection closed before `{method}`"
            )));
        }
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| LspError::Transport(format!("serializing `{method}`: {e}")))?;
        self.inner
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| LspError::Transport(String::from("writer channel closed")))?;
        tracing::debug!(method, "notification sent");
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection has stopped reading.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Flush queued frames, close the write side, and stop both tasks.
    pub async fn close(&self) {
        let _ = self.inner.writer_tx.send(WriterCommand::Shutdown).await;

        let tasks = self.inner.tasks.lock().await.take();
        if let Some((reader, writer)) = tasks {
            let writer_abort = writer.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, writer).await.is_err() {
                tracing::debug!("LSP writer did not drain in time");
                writer_abort.abort();
            }
            self.inner.closed.cancel();
            let _ = reader.await;
        }
        self.inner.closed.cancel();
    }
}

fn response_result(
    method: &str,
    mut body: serde_json::Value,
) -> Result<serde_json::Value, LspError> {
    if let Some(error) = body.get("error") {
        return Err(LspError::Call {
            method: method.to_string(),
            code: error["code"].as_i64().unwrap_or_default(),
            message: error["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(body
        .get_mut("result")
        .map(serde_json::Value::take)
        .unwrap_or_default())
}

async fn dispatch_frame<H: Handler + ?Sized>(
    frame: &serde_json::Value,
    pending: &Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
    writer_tx: &mpsc::Sender<WriterCommand>,
    handler: &H,
) {
    let Some(incoming) = parse_incoming(frame) else {
        tracing::trace!("Ignoring malformed JSON-RPC frame");
        return;
    };

    match incoming {
        IncomingFrame::Response { id, body } => {
            let sender = pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(body);
                }
                None => tracing::debug!(id, "reply for unknown request"),
            }
        }
        IncomingFrame::ServerRequest { id, method, params } => {
            let inbound = Inbound {
                id: Some(id.clone()),
                method,
                params,
            };
            // Strict peers wait for an answer to every request.
            let result = handler.handle(&inbound);
            match serde_json::to_value(Response::new(id, result)) {
                Ok(reply) => {
                    let _ = writer_tx.send(WriterCommand::Send(reply)).await;
                }
                Err(e) => tracing::warn!(method = %inbound.method, "serializing reply: {e}"),
            }
        }
        IncomingFrame::Notification { method, params } => {
            let inbound = Inbound {
                id: None,
                method,
                params,
            };
            handler.handle(&inbound);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeServer, WAIT};

    struct Recorder(mpsc::UnboundedSender<Inbound>);

    impl Handler for Recorder {
        fn handle(&self, message: &Inbound) -> serde_json::Value {
            let _ = self.0.send(message.clone());
            serde_json::Value::Null
        }
    }

    fn connect(timeout: Duration) -> (Connection, FakeServer, mpsc::UnboundedReceiver<Inbound>) {
        let ((reader, writer), server) = FakeServer::pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::serve(reader, writer, Recorder(tx), timeout);
        (connection, server, rx)
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_reply() {
        let (connection, mut server, _rx) = connect(WAIT);

        let (result, ()) = tokio::join!(
            connection.call("workspace/symbol", Some(serde_json::json!({"query": "KC"}))),
            async {
                let request = server.expect("workspace/symbol").await;
                assert_eq!(request["params"]["query"], "KC");
                server
                    .reply(&request, serde_json::json!([{"name": "KC_A"}]))
                    .await;
            }
        );

        assert_eq!(result.unwrap()[0]["name"], "KC_A");
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let (connection, mut server, _rx) = connect(WAIT);

        let (first, second, ()) = tokio::join!(
            connection.call("a", None),
            connection.call("b", None),
            async {
                let one = server.recv().await;
                let two = server.recv().await;
                assert_ne!(one["id"], two["id"]);
                // Answer out of order, each with its own method name.
                server.reply(&two, two["method"].clone()).await;
                server.reply(&one, one["method"].clone()).await;
            }
        );

        assert_eq!(first.unwrap(), "a");
        assert_eq!(second.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_error_reply_becomes_call_error() {
        let (connection, mut server, _rx) = connect(WAIT);

        let (result, ()) = tokio::join!(connection.call("workspace/symbol", None), async {
            let request = server.expect("workspace/symbol").await;
            server.reply_error(&request, -32600, "invalid request").await;
        });

        match result.unwrap_err() {
            LspError::Call {
                method,
                code,
                message,
            } => {
                assert_eq!(method, "workspace/symbol");
                assert_eq!(code, -32600);
                assert_eq!(message, "invalid request");
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out_and_is_forgotten() {
        let (connection, mut server, _rx) = connect(Duration::from_millis(20));

        let (result, ()) = tokio::join!(connection.call("shutdown", None), async {
            server.expect("shutdown").await;
        });

        assert!(matches!(result, Err(LspError::Timeout { .. })));
        assert!(connection.inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_server_request_gets_null_reply_and_reaches_handler() {
        let (_connection, mut server, mut rx) = connect(WAIT);

        server
            .send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "window/workDoneProgress/create",
                "params": { "token": "backgroundIndexProgress" }
            }))
            .await;

        let reply = server.recv().await;
        assert_eq!(reply["id"], 0);
        assert!(reply.get("result").is_some());
        assert!(reply["result"].is_null());

        let inbound = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(inbound.is_request());
        assert_eq!(inbound.method, "window/workDoneProgress/create");
    }

    #[tokio::test]
    async fn test_notification_reaches_handler_without_reply() {
        let (connection, mut server, mut rx) = connect(WAIT);

        server
            .send(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "$/progress",
                "params": { "token": "backgroundIndexProgress", "value": { "kind": "end" } }
            }))
            .await;

        let inbound = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(!inbound.is_request());
        assert_eq!(inbound.params.unwrap()["value"]["kind"], "end");

        // Nothing was written back: the next frame the server sees is ours.
        connection.notify("initialized", None).await.unwrap();
        assert_eq!(server.recv().await["method"], "initialized");
    }

    #[tokio::test]
    async fn test_server_eof_fails_pending_calls() {
        let (connection, mut server, _rx) = connect(Duration::from_secs(60));

        let (result, ()) = tokio::join!(connection.call("workspace/symbol", None), async {
            server.expect("workspace/symbol").await;
            server.hang_up().await;
        });

        assert!(matches!(result, Err(LspError::Transport(_))), "{result:?}");
        tokio::time::timeout(WAIT, connection.closed()).await.unwrap();
        assert!(connection.is_closed());
        assert!(matches!(
            connection.call("shutdown", None).await,
            Err(LspError::Transport(_))
        ));
        assert!(matches!(
            connection.notify("exit", None).await,
            Err(LspError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_close_flushes_queued_frames_then_ends_stream() {
        let (connection, mut server, _rx) = connect(WAIT);

        connection.notify("exit", None).await.unwrap();
        connection.close().await;

        assert_eq!(server.recv().await["method"], "exit");
        assert!(server.recv_eof().await);
        assert!(connection.is_closed());
    }

    #[test]
    fn test_parse_incoming_shapes() {
        let response = serde_json::json!({"jsonrpc": "2.0", "id": 4, "result": null});
        assert!(matches!(
            parse_incoming(&response),
            Some(IncomingFrame::Response { id: 4, .. })
        ));

        let request = serde_json::json!({"jsonrpc": "2.0", "id": "x", "method": "m"});
        assert!(matches!(
            parse_incoming(&request),
            Some(IncomingFrame::ServerRequest { .. })
        ));

        let notification = serde_json::json!({"jsonrpc": "2.0", "method": "m"});
        assert!(matches!(
            parse_incoming(&notification),
            Some(IncomingFrame::Notification { .. })
        ));

        assert!(parse_incoming(&serde_json::json!({"jsonrpc": "2.0"})).is_none());
        // Our ids are numeric, so a string-id response cannot be ours.
        assert!(parse_incoming(&serde_json::json!({"id": "7", "result": 1})).is_none());
    }
}
