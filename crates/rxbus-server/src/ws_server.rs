//! [`WsServer`] – websocket listener feeding the bus.
//!
//! Every TCP client that completes a websocket upgrade on the transport's
//! route becomes a [`WsCon`] driven by [`Bus::con`] on its own task. Upgrades
//! on any other path are answered with `404 Not Found`.

use std::net::SocketAddr;
use std::sync::Arc;

use rxbus_middleware::{Bus, Transport, WsCon};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::ServerError;

pub struct WsServer {
    bus: Bus,
    route: Arc<str>,
    listener: TcpListener,
}

impl WsServer {
    /// Bind the listener described by `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(bus: Bus, transport: &Transport) -> Result<Self, ServerError> {
        let addr = transport.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self {
            bus,
            route: Arc::from(transport.route.as_str()),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients forever.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, route = %self.route, "websocket listener ready");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let bus = self.bus.clone();
                    let route = Arc::clone(&self.route);
                    tokio::spawn(handle_client(stream, peer, bus, route));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, bus: Bus, route: Arc<str>) {
    let check_route = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == &*route {
            return Ok(resp);
        }
        let mut reject = ErrorResponse::new(Some(format!(
            "no websocket endpoint at {}",
            req.uri().path()
        )));
        *reject.status_mut() = StatusCode::NOT_FOUND;
        Err(reject)
    };

    let ws = match accept_hdr_async(stream, check_route).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let con = WsCon::new(ws).with_name(peer.to_string());
    if let Err(e) = bus.con(Arc::new(con)).await {
        warn!(%peer, error = %e, "websocket connection rejected");
    }
}
