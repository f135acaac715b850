//! [`WsCon`] – a websocket as a bus connection.
//!
//! Frames are JSON in text messages; binary messages are accepted when they
//! hold JSON too. Ping/pong is handled by tungstenite and never surfaces here.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rxbus_types::BusError;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;
use uuid::Uuid;

use crate::con::{Con, ConType};

pub struct WsCon<S> {
    sid: String,
    name: Option<String>,
    tokens: Vec<String>,
    closed: AtomicBool,
    closing: Notify,
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WsCon<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already upgraded websocket.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sid: Uuid::new_v4().to_string(),
            name: None,
            tokens: Vec::new(),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tokens(mut self, tokens: Vec<String>) -> Self {
        self.tokens = tokens;
        self
    }
}

#[async_trait]
impl<S> Con for WsCon<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn sid(&self) -> &str {
        &self.sid
    }

    fn con_type(&self) -> ConType {
        ConType::Ws
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn tokens(&self) -> &[String] {
        &self.tokens
    }

    async fn recv(&self) -> Result<Option<Value>, BusError> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut stream = self.stream.lock().await;
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.closing.notified() => return Ok(None),
                msg = stream.next() => msg,
            };
            let parsed = match msg {
                None | Some(Ok(Message::Close(_))) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(BusError::Closed(format!("websocket {} failed: {e}", self.sid)));
                }
                Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => serde_json::from_slice::<Value>(&bytes),
                Some(Ok(_)) => continue,
            };
            match parsed {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!(consid = %self.sid, error = %e, "non-JSON websocket frame skipped"),
            }
        }
    }

    async fn send(&self, frame: &Value) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed(format!("websocket {} is closed", self.sid)));
        }
        let text = serde_json::to_string(frame).map_err(|e| BusError::Val(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| BusError::Closed(format!("websocket {} send failed: {e}", self.sid)))
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closing.notify_one();
        let mut sink = self.sink.lock().await;
        // The peer may already be gone; a failed close handshake is not an error.
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (WsCon<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (WsCon::new(server), client)
    }

    #[tokio::test]
    async fn text_frames_roundtrip_as_json() {
        let (con, mut client) = pair().await;

        client
            .send(Message::Text(json!({"sid": "a"}).to_string().into()))
            .await
            .unwrap();
        assert_eq!(con.recv().await.unwrap(), Some(json!({"sid": "a"})));

        con.send(&json!({"codeid": 0})).await.unwrap();
        let got = client.next().await.unwrap().unwrap();
        let text = got.into_text().unwrap();
        assert_eq!(serde_json::from_str::<Value>(text.as_str()).unwrap(), json!({"codeid": 0}));
    }

    #[tokio::test]
    async fn garbage_is_skipped_and_binary_json_accepted() {
        let (con, mut client) = pair().await;

        client.send(Message::Text("not json".into())).await.unwrap();
        client
            .send(Message::Binary(br#"{"n": 1}"#.to_vec().into()))
            .await
            .unwrap();
        assert_eq!(con.recv().await.unwrap(), Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn close_frame_ends_the_stream() {
        let (con, mut client) = pair().await;
        client.close(None).await.unwrap();
        assert_eq!(con.recv().await.unwrap(), None);
        assert!(con.is_closed());
        assert!(con.send(&json!({})).await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (con, _client) = pair().await;
        con.close().await.unwrap();
        con.close().await.unwrap();
        assert_eq!(con.recv().await.unwrap(), None);
        assert_eq!(con.con_type(), ConType::Ws);
    }
}
