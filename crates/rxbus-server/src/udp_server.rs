//! [`UdpServer`] – datagram listener feeding the bus.

use std::net::SocketAddr;
use std::sync::Arc;

use rxbus_middleware::{Bus, Transport, UdpPeers};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::ServerError;

/// Largest datagram the listener reads.
const RECV_BUF_SIZE: usize = 64 * 1024;

pub struct UdpServer {
    bus: Bus,
    socket: Arc<UdpSocket>,
    peers: UdpPeers,
}

impl UdpServer {
    /// Bind the socket described by `transport`.
    ///
    /// Each peer buffers up to `max_inp_queue_size` frames and may not be sent
    /// frames larger than `mtu`.
    pub async fn bind(bus: Bus, transport: &Transport) -> Result<Self, ServerError> {
        let addr = transport.bind_addr();
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let socket = Arc::new(socket);
        let peers = UdpPeers::new(
            Arc::clone(&socket),
            transport.mtu,
            transport.max_inp_queue_size,
        );
        Ok(Self { bus, socket, peers })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive datagrams forever, opening a connection per new peer.
    pub async fn run(self) {
        if let Ok(addr) = self.socket.local_addr() {
            info!(%addr, "udp listener ready");
        }
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "udp receive failed");
                    continue;
                }
            };
            if let Some(con) = self.peers.route(peer, &buf[..len]) {
                let bus = self.bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = bus.con(Arc::new(con)).await {
                        warn!(%peer, error = %e, "udp peer rejected");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxbus_middleware::{Bmsg, BusCfg};
    use rxbus_types::{OK_CODE, WELCOME_CODE};
    use serde_json::{Value, json};
    use std::time::Duration;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn start(transport: Transport) -> Result<(Bus, SocketAddr), Box<dyn std::error::Error>> {
        let bus = Bus::new(BusCfg::with_transports(vec![transport.clone()]))?;
        bus.init()?;
        let server = UdpServer::bind(bus.clone(), &transport).await?;
        let addr = server.local_addr()?;
        tokio::spawn(server.run());
        Ok((bus, addr))
    }

    /// Send an Ok datagram from `client` and return the Welcome it triggers.
    async fn hello(
        bus: &Bus,
        client: &UdpSocket,
        addr: SocketAddr,
    ) -> Result<Bmsg, Box<dyn std::error::Error>> {
        let ok_id = bus.code_table().codeid(OK_CODE, false).ok_or("no ok codeid")?;
        let hello = json!({"sid": "hello-1", "codeid": ok_id, "msg": {}});
        client.send_to(hello.to_string().as_bytes(), addr).await?;

        let mut buf = [0u8; 2048];
        let (len, _) =
            tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await??;
        let frame: Value = serde_json::from_slice(&buf[..len])?;
        Ok(Bmsg::deserialize_from_net(frame, None, &bus.code_table())?)
    }

    #[tokio::test]
    async fn first_datagram_opens_a_welcomed_connection() -> TestResult {
        let (bus, addr) = start(Transport::udp("127.0.0.1", 0)).await?;
        let client = UdpSocket::bind("127.0.0.1:0").await?;

        let welcome = hello(&bus, &client, addr).await?;
        assert_eq!(welcome.code, WELCOME_CODE);
        assert_eq!(bus.con_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn idle_peer_is_unregistered_and_can_come_back() -> TestResult {
        let transport =
            Transport::udp("127.0.0.1", 0).with_inactivity_timeout(Duration::from_millis(100));
        let (bus, addr) = start(transport).await?;
        let client = UdpSocket::bind("127.0.0.1:0").await?;

        hello(&bus, &client, addr).await?;
        assert_eq!(bus.con_count(), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.con_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await?;

        // The expired peer was dropped from the demultiplexer too, so the
        // next datagram opens a new, freshly welcomed connection.
        let welcome = hello(&bus, &client, addr).await?;
        assert_eq!(welcome.code, WELCOME_CODE);
        assert_eq!(bus.con_count(), 1);
        Ok(())
    }
}
