//! Transports: what kinds of connection the bus accepts, and the runtime
//! queues behind each kind.
//!
//! A [`Transport`] is pure configuration. At [`Bus::init`][crate::bus::Bus::init]
//! every server transport becomes an [`ActiveTransport`]: two bounded queues
//! and two pump tasks.
//!
//! ```text
//!  con read loop ──► inp queue ──► inbound pump ──► on_recv ──► parse ──► con inbox ──► dispatch
//!  publish ──► serialize ──► out queue ──► outbound pump ──► on_send ──► con.send
//! ```
//!
//! Both pumps process frames strictly in queue order. Local dispatch runs off
//! the inbound pump, on one task per connection, so a slow subscriber only
//! holds up messages from its own connection.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use rxbus_types::BusError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::WeakBus;
use crate::con::{Con, ConType};

/// Frame hook, called with the connection sid and the raw frame.
///
/// Errors and panics raised by a hook are logged and otherwise ignored; the
/// frame is processed either way.
pub type ConHook = Arc<dyn Fn(&str, &Value) -> Result<(), BusError> + Send + Sync>;

/// Default datagram size limit for UDP transports.
pub const DEFAULT_MTU: usize = 1400;
/// Default capacity of both transport queues.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;
/// Inactivity limit of UDP connections that configure none. Datagram peers
/// never signal end-of-stream, so they always expire.
pub const DEFAULT_UDP_INACTIVITY: Duration = Duration::from_secs(60);

/// Static description of an acceptable connection kind.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Transport {
    pub con_type: ConType,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Path a websocket upgrade must target.
    pub route: String,
    pub is_server: bool,
    pub max_inp_queue_size: usize,
    pub max_out_queue_size: usize,
    /// Seconds without an inbound frame before a connection is dropped.
    /// UDP connections fall back to [`DEFAULT_UDP_INACTIVITY`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout: Option<f64>,
    pub mtu: usize,
    #[serde(skip)]
    pub on_send: Option<ConHook>,
    #[serde(skip)]
    pub on_recv: Option<ConHook>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::ws("localhost", 3000, "/rx")
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("con_type", &self.con_type)
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("route", &self.route)
            .field("is_server", &self.is_server)
            .field("max_inp_queue_size", &self.max_inp_queue_size)
            .field("max_out_queue_size", &self.max_out_queue_size)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("mtu", &self.mtu)
            .field("on_send", &self.on_send.as_ref().map(|_| "<hook>"))
            .field("on_recv", &self.on_recv.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl Transport {
    fn base(con_type: ConType, protocol: &str) -> Self {
        Self {
            con_type,
            protocol: protocol.to_string(),
            host: "localhost".to_string(),
            port: 0,
            route: String::new(),
            is_server: true,
            max_inp_queue_size: DEFAULT_QUEUE_SIZE,
            max_out_queue_size: DEFAULT_QUEUE_SIZE,
            inactivity_timeout: None,
            mtu: DEFAULT_MTU,
            on_send: None,
            on_recv: None,
        }
    }

    /// Server websocket transport listening on `host:port` at `route`.
    pub fn ws(host: impl Into<String>, port: u16, route: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            route: route.into(),
            ..Self::base(ConType::Ws, "ws")
        }
    }

    /// Server UDP transport bound to `host:port`.
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::base(ConType::Udp, "udp")
        }
    }

    /// In-process transport for [`MemCon`][crate::mem::MemCon] connections.
    pub fn mem() -> Self {
        Self::base(ConType::Mem, "mem")
    }

    pub fn with_inactivity_timeout(mut self, limit: Duration) -> Self {
        self.inactivity_timeout = Some(limit.as_secs_f64());
        self
    }

    pub fn with_queue_sizes(mut self, inp: usize, out: usize) -> Self {
        self.max_inp_queue_size = inp;
        self.max_out_queue_size = out;
        self
    }

    pub fn with_on_send(mut self, hook: ConHook) -> Self {
        self.on_send = Some(hook);
        self
    }

    pub fn with_on_recv(mut self, hook: ConHook) -> Self {
        self.on_recv = Some(hook);
        self
    }

    /// Inactivity limit as a [`Duration`]. Non-positive values disable it,
    /// except on UDP where they select [`DEFAULT_UDP_INACTIVITY`].
    pub fn inactivity_limit(&self) -> Option<Duration> {
        let configured = self
            .inactivity_timeout
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        match self.con_type {
            ConType::Udp => Some(configured.unwrap_or(DEFAULT_UDP_INACTIVITY)),
            _ => configured,
        }
    }

    /// `host:port` the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ActiveTransport
// ─────────────────────────────────────────────────────────────────────────────

/// A frame queued for a pump, together with the connection it belongs to.
pub(crate) type Frame = (Arc<dyn Con>, Value);

/// Runtime queues and pump tasks of one transport. Aborts its tasks on drop.
pub(crate) struct ActiveTransport {
    transport: Transport,
    inp_tx: mpsc::Sender<Frame>,
    out_tx: mpsc::Sender<Frame>,
    inp_task: JoinHandle<()>,
    out_task: JoinHandle<()>,
}

impl ActiveTransport {
    /// Spawn both pumps. Must be called inside a tokio runtime.
    pub(crate) fn spawn(transport: Transport, bus: WeakBus, log_send: bool, log_recv: bool) -> Self {
        let (inp_tx, inp_rx) = mpsc::channel(transport.max_inp_queue_size.max(1));
        let (out_tx, out_rx) = mpsc::channel(transport.max_out_queue_size.max(1));
        let inp_task = tokio::spawn(inbound_pump(
            inp_rx,
            transport.on_recv.clone(),
            log_recv,
            bus,
        ));
        let out_task = tokio::spawn(outbound_pump(out_rx, transport.on_send.clone(), log_send));
        debug!(con_type = %transport.con_type, "transport pumps started");
        Self {
            transport,
            inp_tx,
            out_tx,
            inp_task,
            out_task,
        }
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn inp_tx(&self) -> &mpsc::Sender<Frame> {
        &self.inp_tx
    }

    pub(crate) fn out_tx(&self) -> &mpsc::Sender<Frame> {
        &self.out_tx
    }
}

impl Drop for ActiveTransport {
    fn drop(&mut self) {
        self.inp_task.abort();
        self.out_task.abort();
    }
}

async fn inbound_pump(
    mut rx: mpsc::Receiver<Frame>,
    on_recv: Option<ConHook>,
    log_recv: bool,
    bus: WeakBus,
) {
    while let Some((con, frame)) = rx.recv().await {
        run_hook("on_recv", on_recv.as_ref(), con.sid(), &frame);
        if log_recv {
            info!(consid = con.sid(), frame = %frame, "net recv");
        }
        let Some(bus) = bus.upgrade() else {
            debug!("bus dropped, inbound pump exits");
            return;
        };
        bus.accept_net_frame(&con, frame).await;
    }
}

async fn outbound_pump(mut rx: mpsc::Receiver<Frame>, on_send: Option<ConHook>, log_send: bool) {
    while let Some((con, frame)) = rx.recv().await {
        run_hook("on_send", on_send.as_ref(), con.sid(), &frame);
        if log_send {
            info!(consid = con.sid(), frame = %frame, "net send");
        }
        if con.is_closed() {
            debug!(consid = con.sid(), "connection closed, frame dropped");
            continue;
        }
        if let Err(e) = con.send(&frame).await {
            warn!(consid = con.sid(), error = %e, "send failed");
        }
    }
}

fn run_hook(kind: &'static str, hook: Option<&ConHook>, consid: &str, frame: &Value) {
    let Some(hook) = hook else {
        return;
    };
    match std::panic::catch_unwind(AssertUnwindSafe(|| hook(consid, frame))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(hook = kind, consid, error = %e, "hook failed"),
        Err(_) => error!(hook = kind, consid, "hook panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_describe_the_standard_ws_server() {
        let t = Transport::default();
        assert_eq!(t.con_type, ConType::Ws);
        assert_eq!(t.bind_addr(), "localhost:3000");
        assert_eq!(t.route, "/rx");
        assert!(t.is_server);
        assert_eq!(t.max_inp_queue_size, 10_000);
        assert_eq!(t.max_out_queue_size, 10_000);
        assert_eq!(t.mtu, 1400);
        assert_eq!(t.inactivity_limit(), None);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let t: Transport = serde_json::from_str(r#"{"con_type": "udp", "port": 4000}"#).unwrap();
        assert_eq!(t.con_type, ConType::Udp);
        assert_eq!(t.port, 4000);
        assert_eq!(t.mtu, DEFAULT_MTU);
        assert!(t.on_recv.is_none());
    }

    #[test]
    fn inactivity_limit_ignores_non_positive_values() {
        let mut t = Transport::mem();
        t.inactivity_timeout = Some(0.0);
        assert_eq!(t.inactivity_limit(), None);
        t.inactivity_timeout = Some(-1.0);
        assert_eq!(t.inactivity_limit(), None);
        let t = Transport::mem().with_inactivity_timeout(Duration::from_millis(250));
        assert_eq!(t.inactivity_limit(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn udp_connections_always_expire() {
        let t = Transport::udp("127.0.0.1", 0);
        assert_eq!(t.inactivity_limit(), Some(DEFAULT_UDP_INACTIVITY));

        let mut t: Transport = serde_json::from_str(r#"{"con_type": "udp"}"#).unwrap();
        assert_eq!(t.inactivity_limit(), Some(DEFAULT_UDP_INACTIVITY));
        t.inactivity_timeout = Some(0.0);
        assert_eq!(t.inactivity_limit(), Some(DEFAULT_UDP_INACTIVITY));

        let t = t.with_inactivity_timeout(Duration::from_secs(5));
        assert_eq!(t.inactivity_limit(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn debug_hides_hooks() {
        let t = Transport::mem().with_on_send(Arc::new(|_: &str, _: &Value| Ok(())));
        let dbg = format!("{t:?}");
        assert!(dbg.contains("<hook>"));
    }

    #[test]
    fn hook_errors_and_panics_are_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let failing: ConHook = Arc::new(move |_: &str, _: &Value| {
            counted.fetch_add(1, Ordering::SeqCst);
            Err(BusError::Val("nope".into()))
        });
        let panicking: ConHook =
            Arc::new(|_: &str, _: &Value| -> Result<(), BusError> { panic!("hook blew up") });

        run_hook("on_recv", Some(&failing), "c1", &Value::Null);
        run_hook("on_recv", Some(&panicking), "c1", &Value::Null);
        run_hook("on_recv", None, "c1", &Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
