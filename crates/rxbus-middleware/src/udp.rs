//! UDP peers as bus connections.
//!
//! UDP has no connections, so one shared socket is demultiplexed by peer
//! address: [`UdpPeers::route`] hands each datagram to the [`UdpCon`] of its
//! sender and creates that connection on first contact. Every datagram carries
//! exactly one JSON frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rxbus_types::BusError;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::con::{Con, ConType};

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Value>>>>;

/// Datagram demultiplexer for one socket.
pub struct UdpPeers {
    socket: Arc<UdpSocket>,
    mtu: usize,
    inbox_size: usize,
    peers: PeerMap,
}

impl UdpPeers {
    /// `inbox_size` frames are buffered per peer before datagrams are dropped.
    pub fn new(socket: Arc<UdpSocket>, mtu: usize, inbox_size: usize) -> Self {
        Self {
            socket,
            mtu,
            inbox_size: inbox_size.max(1),
            peers: Arc::default(),
        }
    }

    /// Deliver a datagram from `peer`.
    ///
    /// Returns the new connection when `peer` was not known yet; the caller
    /// hands it to the bus.
    pub fn route(&self, peer: SocketAddr, datagram: &[u8]) -> Option<UdpCon> {
        let mut frame: Value = match serde_json::from_slice(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer, error = %e, "invalid datagram dropped");
                return None;
            }
        };

        let mut peers = self.peers.lock();
        if let Some(tx) = peers.get(&peer) {
            match tx.try_send(frame) {
                Ok(()) => return None,
                Err(TrySendError::Full(_)) => {
                    warn!(%peer, "peer inbox full, datagram dropped");
                    return None;
                }
                Err(TrySendError::Closed(returned)) => {
                    frame = returned;
                    peers.remove(&peer);
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.inbox_size);
        if tx.try_send(frame).is_err() {
            return None;
        }
        peers.insert(peer, tx);
        debug!(%peer, "new udp peer");
        Some(UdpCon {
            sid: Uuid::new_v4().to_string(),
            peer,
            mtu: self.mtu,
            socket: Arc::clone(&self.socket),
            peers: Arc::clone(&self.peers),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    /// Number of peers with an open connection.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One remote UDP peer.
pub struct UdpCon {
    sid: String,
    peer: SocketAddr,
    mtu: usize,
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    closed: AtomicBool,
    closing: Notify,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Value>>,
}

impl UdpCon {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Con for UdpCon {
    fn sid(&self) -> &str {
        &self.sid
    }

    fn con_type(&self) -> ConType {
        ConType::Udp
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
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
            return Err(BusError::Closed(format!("udp peer {} is closed", self.peer)));
        }
        let bytes = serde_json::to_vec(frame).map_err(|e| BusError::Val(e.to_string()))?;
        if bytes.len() > self.mtu {
            return Err(BusError::Val(format!(
                "frame of {} bytes exceeds the mtu of {}",
                bytes.len(),
                self.mtu
            )));
        }
        self.socket
            .send_to(&bytes, self.peer)
            .await
            .map(|_| ())
            .map_err(|e| BusError::Closed(format!("udp send to {} failed: {e}", self.peer)))
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.peers.lock().remove(&self.peer);
            self.closing.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn sockets() -> (Arc<UdpSocket>, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (Arc::new(server), client)
    }

    #[tokio::test]
    async fn first_datagram_creates_a_connection() {
        let (server, client) = sockets().await;
        let peers = UdpPeers::new(Arc::clone(&server), 1400, 8);
        let from = client.local_addr().unwrap();

        let con = peers.route(from, br#"{"n": 1}"#).unwrap();
        assert!(peers.route(from, br#"{"n": 2}"#).is_none());
        assert_eq!(peers.len(), 1);
        assert_eq!(con.peer(), from);
        assert_eq!(con.recv().await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(con.recv().await.unwrap(), Some(json!({"n": 2})));
    }

    #[tokio::test]
    async fn invalid_json_is_dropped() {
        let (server, client) = sockets().await;
        let peers = UdpPeers::new(server, 1400, 8);
        assert!(peers.route(client.local_addr().unwrap(), b"\x00\x01").is_none());
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn full_inbox_drops_datagrams() {
        let (server, client) = sockets().await;
        let peers = UdpPeers::new(server, 1400, 1);
        let from = client.local_addr().unwrap();

        let con = peers.route(from, br#"{"n": 1}"#).unwrap();
        assert!(peers.route(from, br#"{"n": 2}"#).is_none());
        assert_eq!(con.recv().await.unwrap(), Some(json!({"n": 1})));
        con.close().await.unwrap();
        assert_eq!(con.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_reaches_the_peer_and_respects_the_mtu() {
        let (server, client) = sockets().await;
        let peers = UdpPeers::new(server, 64, 8);
        let con = peers.route(client.local_addr().unwrap(), b"{}").unwrap();

        con.send(&json!({"codeid": 1, "msg": {}})).await.unwrap();
        let mut buf = [0u8; 128];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let got: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(got, json!({"codeid": 1, "msg": {}}));

        let big = json!({"blob": "x".repeat(100)});
        assert!(matches!(con.send(&big).await, Err(BusError::Val(_))));
    }

    #[tokio::test]
    async fn closing_forgets_the_peer() {
        let (server, client) = sockets().await;
        let peers = UdpPeers::new(server, 1400, 8);
        let from = client.local_addr().unwrap();

        let con = peers.route(from, b"{}").unwrap();
        con.close().await.unwrap();
        assert!(peers.is_empty());
        assert!(peers.route(from, b"{}").is_some());
    }
}
