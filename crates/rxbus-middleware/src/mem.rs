//! In-process connections.
//!
//! [`MemCon::pair`] returns the bus side of a channel pair together with the
//! [`MemPeer`] that plays the remote end. Useful for embedding a client in the
//! same process as the bus, and as the mock connection in tests. A `MemCon`
//! can pose as any [`ConType`] so it can stand in for a websocket or UDP peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rxbus_types::BusError;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, mpsc};
use uuid::Uuid;

use crate::con::{Con, ConType};

/// Bus side of an in-process connection.
pub struct MemCon {
    sid: String,
    con_type: ConType,
    name: Option<String>,
    tokens: Vec<String>,
    closed: AtomicBool,
    closing: Notify,
    inbox: Mutex<mpsc::Receiver<Value>>,
    outbox: mpsc::Sender<Value>,
}

/// Remote side of an in-process connection.
pub struct MemPeer {
    tx: mpsc::Sender<Value>,
    rx: mpsc::Receiver<Value>,
}

impl MemCon {
    /// A connected pair whose channels buffer `capacity` frames each way.
    pub fn pair(capacity: usize) -> (MemCon, MemPeer) {
        let (to_bus, inbox) = mpsc::channel(capacity.max(1));
        let (outbox, from_bus) = mpsc::channel(capacity.max(1));
        let con = MemCon {
            sid: Uuid::new_v4().to_string(),
            con_type: ConType::Mem,
            name: None,
            tokens: Vec::new(),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
            inbox: Mutex::new(inbox),
            outbox,
        };
        (con, MemPeer { tx: to_bus, rx: from_bus })
    }

    /// Report `con_type` instead of [`ConType::Mem`].
    pub fn with_con_type(mut self, con_type: ConType) -> Self {
        self.con_type = con_type;
        self
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
impl Con for MemCon {
    fn sid(&self) -> &str {
        &self.sid
    }

    fn con_type(&self) -> ConType {
        self.con_type
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
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            biased;
            _ = self.closing.notified() => Ok(None),
            frame = inbox.recv() => Ok(frame),
        }
    }

    async fn send(&self, frame: &Value) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed(format!("connection {} is closed", self.sid)));
        }
        self.outbox
            .send(frame.clone())
            .await
            .map_err(|_| BusError::Closed(format!("peer of {} went away", self.sid)))
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closing.notify_one();
        }
        Ok(())
    }
}

impl MemPeer {
    /// Send a frame to the bus.
    pub async fn send(&self, frame: Value) -> Result<(), BusError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| BusError::Closed("bus side of the connection went away".to_string()))
    }

    /// Next frame from the bus, or `None` once the bus side is dropped.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Like [`MemPeer::recv`] but gives up after `limit`.
    pub async fn recv_timeout(&mut self, limit: Duration) -> Option<Value> {
        tokio::time::timeout(limit, self.rx.recv()).await.ok().flatten()
    }
}
