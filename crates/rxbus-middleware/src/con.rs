//! The connection abstraction.
//!
//! The bus never speaks a transport protocol itself. Every live link
//! (websocket, UDP peer, in-process channel) is wrapped in a [`Con`] and handed
//! to [`Bus::con`][crate::bus::Bus::con], which drives it until it ends.
//!
//! # Contract
//!
//! * `recv` yields decoded JSON frames; `Ok(None)` is end-of-stream.
//! * `send` fails once the connection is closed.
//! * `close` is idempotent: closing a closed connection succeeds.
//! * `recv` and `send` may be called concurrently from different tasks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rxbus_types::BusError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection kinds a [`Transport`][crate::transport::Transport] can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConType {
    Ws,
    Udp,
    /// In-process channel pair, see [`MemCon`][crate::mem::MemCon].
    Mem,
}

impl fmt::Display for ConType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConType::Ws => write!(f, "ws"),
            ConType::Udp => write!(f, "udp"),
            ConType::Mem => write!(f, "mem"),
        }
    }
}

/// One live transport-level link.
#[async_trait]
pub trait Con: Send + Sync {
    /// Unique id of this connection.
    fn sid(&self) -> &str;

    fn con_type(&self) -> ConType;

    fn is_closed(&self) -> bool;

    /// Optional human readable name, used in logs.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Credentials presented when the connection was opened.
    fn tokens(&self) -> &[String] {
        &[]
    }

    /// Next inbound frame, or `None` once the peer is gone.
    async fn recv(&self) -> Result<Option<Value>, BusError>;

    async fn send(&self, frame: &Value) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

/// Iterate the inbound frames of `con`.
///
/// The stream ends at end-of-stream, or right after yielding the first
/// receive error.
pub fn frames(con: Arc<dyn Con>) -> BoxStream<'static, Result<Value, BusError>> {
    stream::unfold(Some(con), |state| async move {
        let con = state?;
        match con.recv().await {
            Ok(Some(frame)) => Some((Ok(frame), Some(con))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Close `con` unless it already is, logging instead of failing.
pub(crate) async fn close_quietly(con: &Arc<dyn Con>) {
    if con.is_closed() {
        return;
    }
    if let Err(e) = con.close().await {
        tracing::debug!(consid = con.sid(), error = %e, "close failed");
    }
}
