//! `rxbus-server` – network surfaces and process glue for the bus.
//!
//! 1. **Listens** on every server transport in the bus config: a websocket
//!    listener per `ws` transport ([`WsServer`]) and a datagram listener per
//!    `udp` transport ([`UdpServer`]).
//! 2. **Loads** the bus config from TOML with `RXBUS_*` overrides
//!    ([`config`]).
//! 3. **Sets up** structured logging ([`logging`]).
//!
//! # Usage
//!
//! ```rust,no_run
//! use rxbus_middleware::{Bus, BusCfg};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rxbus_server::ServerError> {
//!     let bus = Bus::new(BusCfg::default())?;
//!     bus.init()?;
//!     let listeners = rxbus_server::serve(&bus).await?;
//!     for listener in listeners {
//!         let _ = listener.await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod udp_server;
pub mod ws_server;

use rxbus_middleware::{Bus, ConType};
use rxbus_types::BusError;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

pub use udp_server::UdpServer;
pub use ws_server::WsServer;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Start a listener for every server transport of `bus` and return their
/// tasks.
///
/// In-process transports need no listener and are skipped.
pub async fn serve(bus: &Bus) -> Result<Vec<JoinHandle<()>>, ServerError> {
    let mut listeners = Vec::new();
    for transport in bus.cfg().transports.iter().filter(|t| t.is_server) {
        match transport.con_type {
            ConType::Ws => {
                let server = WsServer::bind(bus.clone(), transport).await?;
                listeners.push(tokio::spawn(server.run()));
            }
            ConType::Udp => {
                let server = UdpServer::bind(bus.clone(), transport).await?;
                listeners.push(tokio::spawn(server.run()));
            }
            ConType::Mem => debug!("in-process transport needs no listener"),
        }
    }
    Ok(listeners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxbus_middleware::{BusCfg, Transport};

    #[tokio::test]
    async fn serve_starts_one_listener_per_network_transport() -> Result<(), Box<dyn std::error::Error>>
    {
        let cfg = BusCfg::with_transports(vec![
            Transport::ws("127.0.0.1", 0, "/rx"),
            Transport::udp("127.0.0.1", 0),
            Transport::mem(),
        ]);
        let bus = Bus::new(cfg)?;
        bus.init()?;

        let listeners = serve(&bus).await?;
        assert_eq!(listeners.len(), 2);
        for listener in listeners {
            listener.abort();
        }
        Ok(())
    }

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let bus = Bus::new(BusCfg::with_transports(vec![Transport::ws(
            "256.0.0.1",
            0,
            "/rx",
        )]))
        .unwrap();
        let err = serve(&bus).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.to_string().contains("256.0.0.1"));
    }
}
