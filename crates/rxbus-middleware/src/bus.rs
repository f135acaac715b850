//! [`Bus`] – the broker.
//!
//! One explicitly constructed service object owns every table the broker
//! needs and is shared by cloning the handle:
//!
//! | Table | Keyed by | Holds |
//! |---|---|---|
//! | connections | consid | open [`Con`]s and when they were opened |
//! | transports | [`ConType`] | one [`ActiveTransport`] per connection kind |
//! | subscriptions | code | subscriber callbacks in registration order |
//! | waiters | request sid | the pending `pubr` reply slot |
//! | last messages | code | the most recent message of every code |
//!
//! All tables sit behind one [`parking_lot::Mutex`] that is never held
//! across an `.await`.
//!
//! # Dispatch
//!
//! Every message goes through the same three stages, strictly in order:
//!
//! 1. **net** – serialised and queued for each target connection;
//! 2. **local** – handed to each subscriber of its code, in registration order;
//! 3. **linked** – delivered to the `pubr` waiter whose request sid equals the
//!    message's `lsid`.
//!
//! Whatever a subscriber returns is published back as a reply linked to the
//! message that triggered it and addressed to the connection it came from.
//!
//! Inbound messages are dispatched by one task per connection, in arrival
//! order. Replies to a pending `pubr` bypass that queue, so a subscriber may
//! itself `pubr` any peer, including the one it is handling.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use rxbus_types::{
    BUILTIN_ECODES, BusError, DEFAULT_CODE_ORDER, Msg, OK_CODE, OkMsg, WELCOME_CODE, Welcome,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bmsg::{Bmsg, Payload, Reply, new_sid};
use crate::cfg::BusCfg;
use crate::code::{CodeEntry, CodeRegistry, CodeTable};
use crate::con::{Con, ConType, close_quietly, frames};
use crate::subs::{SubFn, SubId, SubRet, SubTable};
use crate::transport::{ActiveTransport, Frame};

/// `lsid` operator resolving to the sid of the message being handled.
pub const MSID_OPERATOR: &str = "$ctx::msid";

/// Context a subscriber is invoked with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgCtx {
    /// Connection the message arrived on; `None` for local publishes.
    pub consid: Option<String>,
    /// Sid of the message being handled.
    pub msid: Option<String>,
}

/// Options of [`Bus::publish`] and [`Bus::pubr`].
#[derive(Debug, Clone)]
pub struct PubOpts {
    /// Sid to send under. A fresh one is generated when unset.
    pub sid: Option<String>,
    /// Connections to send to. Empty means "the connection in `ctx`, if any".
    pub target_consids: Vec<String>,
    /// Sid this message replies to, or [`MSID_OPERATOR`].
    pub lsid: Option<String>,
    pub send_to_net: bool,
    pub send_to_inner: bool,
    /// Upper bound on how long `pubr` waits for its reply.
    pub pubr_timeout: Option<Duration>,
    pub ctx: MsgCtx,
}

impl Default for PubOpts {
    fn default() -> Self {
        Self {
            sid: None,
            target_consids: Vec::new(),
            lsid: None,
            send_to_net: true,
            send_to_inner: true,
            pubr_timeout: None,
            ctx: MsgCtx::default(),
        }
    }
}

impl PubOpts {
    /// Send under `sid` instead of a fresh one, e.g. to retry a request
    /// idempotently.
    pub fn sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    /// Add `consid` to the targets.
    pub fn to(mut self, consid: impl Into<String>) -> Self {
        self.target_consids.push(consid.into());
        self
    }

    pub fn lsid(mut self, lsid: impl Into<String>) -> Self {
        self.lsid = Some(lsid.into());
        self
    }

    /// Reply to the message described by `ctx`, on the connection it came from.
    pub fn reply_to(mut self, ctx: &MsgCtx) -> Self {
        self.lsid = Some(MSID_OPERATOR.to_string());
        self.ctx = ctx.clone();
        self
    }

    pub fn ctx(mut self, ctx: MsgCtx) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn net(mut self, send: bool) -> Self {
        self.send_to_net = send;
        self
    }

    pub fn inner(mut self, send: bool) -> Self {
        self.send_to_inner = send;
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.pubr_timeout = Some(limit);
        self
    }
}

/// Options of [`Bus::sub`].
#[derive(Debug, Clone, Copy)]
pub struct SubOpts {
    /// Replay the last message of the code to the new subscriber.
    pub recv_last_msg: bool,
}

impl Default for SubOpts {
    fn default() -> Self {
        Self {
            recv_last_msg: true,
        }
    }
}

impl SubOpts {
    pub fn no_replay() -> Self {
        Self {
            recv_last_msg: false,
        }
    }
}

/// Handle returned by [`Bus::sub`]. Dropping it keeps the subscription.
#[derive(Debug, Clone)]
pub struct Unsub {
    bus: WeakBus,
    subsid: SubId,
}

impl Unsub {
    pub fn subsid(&self) -> SubId {
        self.subsid
    }

    /// Remove the subscription. Returns whether it was still active.
    pub fn unsub(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.unsub(self.subsid),
            None => false,
        }
    }
}

/// Introspection snapshot of an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConInfo {
    pub consid: String,
    pub con_type: ConType,
    pub name: Option<String>,
    pub opened_at: DateTime<Utc>,
}

struct ConEntry {
    con: Arc<dyn Con>,
    opened_at: DateTime<Utc>,
    /// Parsed inbound messages awaiting local dispatch, in arrival order.
    inbox: mpsc::Sender<Bmsg>,
}

struct BusState {
    initd: bool,
    registry: CodeRegistry,
    ecodes: Vec<String>,
    table: Arc<CodeTable>,
    welcome_frame: Value,
    transports: HashMap<ConType, ActiveTransport>,
    cons: HashMap<String, ConEntry>,
    subs: SubTable,
    waiters: HashMap<String, oneshot::Sender<Bmsg>>,
    last_msgs: HashMap<String, Bmsg>,
}

impl BusState {
    fn rebuild_table(&mut self) -> Result<(), BusError> {
        let table = CodeTable::new(self.registry.get_regd_codes(), self.ecodes.clone());
        let welcome = serde_json::to_value(table.welcome())
            .map_err(|e| BusError::Val(format!("cannot encode welcome: {e}")))?;
        self.welcome_frame = Bmsg::new(WELCOME_CODE, false, welcome).serialize_to_net(&table)?;
        self.table = Arc::new(table);
        Ok(())
    }

    /// The current Welcome frame under a fresh sid.
    fn welcome(&self) -> Value {
        let mut frame = self.welcome_frame.clone();
        if let Some(fields) = frame.as_object_mut() {
            fields.insert("sid".to_string(), Value::String(new_sid()));
        }
        frame
    }

    /// Outbound queue of the transport serving `con`.
    fn out_tx(&self, con: &Arc<dyn Con>) -> mpsc::Sender<Frame> {
        match self.transports.get(&con.con_type()) {
            Some(active) => active.out_tx().clone(),
            None => panic!(
                "connection {} is registered without a {} transport",
                con.sid(),
                con.con_type()
            ),
        }
    }
}

struct BusInner {
    cfg: BusCfg,
    state: Mutex<BusState>,
    next_subsid: AtomicU64,
}

/// Shared handle to the broker. Clones are cheap and share all state.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

/// Non-owning [`Bus`] handle, used by tasks that must not keep it alive.
#[derive(Clone)]
pub struct WeakBus(Weak<BusInner>);

impl WeakBus {
    pub fn upgrade(&self) -> Option<Bus> {
        self.0.upgrade().map(|inner| Bus { inner })
    }
}

impl std::fmt::Debug for WeakBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakBus")
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Bus")
            .field("initd", &st.initd)
            .field("codes", &st.table.codes())
            .field("cons", &st.cons.len())
            .field("subs", &st.subs.len())
            .finish()
    }
}

impl Bus {
    /// Build a bus from `cfg` and register its types and error codes.
    ///
    /// Nothing is spawned until [`Bus::init`].
    pub fn new(cfg: BusCfg) -> Result<Self, BusError> {
        let mut registry = CodeRegistry::new();
        let mut types = vec![CodeEntry::of::<Welcome>(), CodeEntry::of::<OkMsg>()];
        types.extend(cfg.reg_types.iter().cloned());
        registry.upd(&types, &DEFAULT_CODE_ORDER)?;

        let mut ecodes: Vec<String> = BUILTIN_ECODES.iter().map(|c| c.to_string()).collect();
        for code in &cfg.reg_ecodes {
            if !ecodes.contains(code) {
                ecodes.push(code.clone());
            }
        }

        let mut state = BusState {
            initd: false,
            registry,
            ecodes,
            table: Arc::default(),
            welcome_frame: Value::Null,
            transports: HashMap::new(),
            cons: HashMap::new(),
            subs: SubTable::default(),
            waiters: HashMap::new(),
            last_msgs: HashMap::new(),
        };
        state.rebuild_table()?;

        Ok(Self {
            inner: Arc::new(BusInner {
                cfg,
                state: Mutex::new(state),
                next_subsid: AtomicU64::new(1),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakBus {
        WeakBus(Arc::downgrade(&self.inner))
    }

    pub fn cfg(&self) -> &BusCfg {
        &self.inner.cfg
    }

    /// Start one [`ActiveTransport`] per distinct server connection kind.
    ///
    /// Idempotent. Fails with [`BusError::Unsupported`] outside a tokio
    /// runtime.
    pub fn init(&self) -> Result<(), BusError> {
        if Handle::try_current().is_err() {
            return Err(BusError::Unsupported(
                "bus init requires a tokio runtime".to_string(),
            ));
        }
        let cfg = &self.inner.cfg;
        let mut st = self.inner.state.lock();
        if st.initd {
            return Ok(());
        }
        for transport in cfg.transports.iter().filter(|t| t.is_server) {
            if st.transports.contains_key(&transport.con_type) {
                warn!(con_type = %transport.con_type, "duplicate transport ignored");
                continue;
            }
            let active = ActiveTransport::spawn(
                transport.clone(),
                self.downgrade(),
                cfg.log_net_send,
                cfg.log_net_recv,
            );
            st.transports.insert(transport.con_type, active);
        }
        st.initd = true;
        info!(transports = st.transports.len(), "bus initialised");
        Ok(())
    }

    pub fn is_initd(&self) -> bool {
        self.inner.state.lock().initd
    }

    /// Stop every transport, close every connection and clear all tables
    /// except the code registry.
    ///
    /// In-flight [`Bus::pubr`] calls fail with [`BusError::Closed`].
    pub async fn destroy(&self) {
        let (transports, cons) = {
            let mut st = self.inner.state.lock();
            st.initd = false;
            st.subs.clear();
            st.waiters.clear();
            st.last_msgs.clear();
            (
                std::mem::take(&mut st.transports),
                std::mem::take(&mut st.cons),
            )
        };
        drop(transports);
        for entry in cons.into_values() {
            close_quietly(&entry.con).await;
        }
        info!("bus destroyed");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Code registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Register payload types and re-welcome every open connection if the
    /// code list changed.
    pub fn reg_types(&self, types: &[CodeEntry]) -> Result<(), BusError> {
        let mut st = self.inner.state.lock();
        if st.registry.upd(types, &DEFAULT_CODE_ORDER)? {
            self.codes_changed(&mut st)?;
        }
        Ok(())
    }

    pub fn reg<T: Msg>(&self) -> Result<(), BusError> {
        self.reg_types(&[CodeEntry::of::<T>()])
    }

    /// Register extra error codes, appended after the existing ones.
    pub fn reg_ecodes<I, S>(&self, ecodes: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut st = self.inner.state.lock();
        let mut changed = false;
        for code in ecodes {
            let code = code.into();
            if !st.ecodes.contains(&code) {
                st.ecodes.push(code);
                changed = true;
            }
        }
        if changed {
            self.codes_changed(&mut st)?;
        }
        Ok(())
    }

    /// Current codeid snapshot.
    pub fn code_table(&self) -> Arc<CodeTable> {
        Arc::clone(&self.inner.state.lock().table)
    }

    fn codes_changed(&self, st: &mut BusState) -> Result<(), BusError> {
        st.rebuild_table()?;
        debug!(codes = st.table.codes().len(), ecodes = st.table.ecodes().len(), "code table rebuilt");
        for entry in st.cons.values() {
            let tx = st.out_tx(&entry.con);
            match tx.try_send((Arc::clone(&entry.con), st.welcome())) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => match Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let _ = tx.send(frame).await;
                        });
                    }
                    Err(_) => warn!(consid = entry.con.sid(), "outbound queue full, welcome dropped"),
                },
                Err(TrySendError::Closed(_)) => {
                    debug!(consid = entry.con.sid(), "transport stopped, welcome dropped");
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────

    /// Drive `con` until it ends.
    ///
    /// Sends the current Welcome first, then forwards every inbound frame to
    /// the transport's inbound queue. Returns once the connection reached
    /// end-of-stream, failed, or stayed silent past the transport's
    /// inactivity timeout; the connection is closed and unregistered on every
    /// exit path.
    pub async fn con(&self, con: Arc<dyn Con>) -> Result<(), BusError> {
        let consid = con.sid().to_string();
        let found = {
            let st = self.inner.state.lock();
            st.transports.get(&con.con_type()).map(|active| {
                (
                    active.out_tx().clone(),
                    active.inp_tx().clone(),
                    active.transport().inactivity_limit(),
                    active.transport().max_inp_queue_size,
                )
            })
        };
        let Some((out_tx, inp_tx, inactivity, inbox_size)) = found else {
            warn!(consid = %consid, con_type = %con.con_type(), "no transport for connection type, closing");
            close_quietly(&con).await;
            return Err(BusError::Unsupported(format!(
                "no transport registered for {} connections",
                con.con_type()
            )));
        };

        let permit = out_tx
            .reserve()
            .await
            .map_err(|_| BusError::Closed("transport is shut down".to_string()))?;
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_size.max(1));
        {
            let mut st = self.inner.state.lock();
            if st.cons.contains_key(&consid) {
                warn!(consid = %consid, "connection already registered");
                return Err(BusError::AlreadyProcessed(format!(
                    "connection {consid} is already registered"
                )));
            }
            st.cons.insert(
                consid.clone(),
                ConEntry {
                    con: Arc::clone(&con),
                    opened_at: Utc::now(),
                    inbox: inbox_tx,
                },
            );
            permit.send((Arc::clone(&con), st.welcome()));
        }
        tokio::spawn(drain_inbox(self.downgrade(), inbox_rx));
        let guard = ConGuard {
            inner: &self.inner,
            con: Arc::clone(&con),
        };
        info!(consid = %consid, con_type = %con.con_type(), name = ?con.name(), "connection opened");

        let mut inbound = frames(Arc::clone(&con));
        loop {
            let next = match inactivity {
                Some(limit) => match tokio::time::timeout(limit, inbound.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        info!(consid = %consid, ?limit, "connection inactive, closing");
                        break;
                    }
                },
                None => inbound.next().await,
            };
            match next {
                Some(Ok(frame)) => {
                    if inp_tx.send((Arc::clone(&con), frame)).await.is_err() {
                        debug!(consid = %consid, "transport stopped, closing");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(consid = %consid, error = %e, "receive failed, closing");
                    break;
                }
                None => break,
            }
        }

        close_quietly(&con).await;
        drop(guard);
        info!(consid = %consid, "connection closed");
        Ok(())
    }

    /// Close an open connection; its read loop then unregisters it.
    pub async fn close_con(&self, consid: &str) -> Result<(), BusError> {
        let con = self
            .inner
            .state
            .lock()
            .cons
            .get(consid)
            .map(|entry| Arc::clone(&entry.con));
        let con = con.ok_or_else(|| BusError::NotFound(format!("connection {consid} not found")))?;
        if con.is_closed() {
            return Err(BusError::Val(format!("connection {consid} is already closed")));
        }
        con.close().await
    }

    /// Open connections, oldest first.
    pub fn cons(&self) -> Vec<ConInfo> {
        let mut infos: Vec<ConInfo> = self
            .inner
            .state
            .lock()
            .cons
            .iter()
            .map(|(consid, entry)| ConInfo {
                consid: consid.clone(),
                con_type: entry.con.con_type(),
                name: entry.con.name().map(str::to_string),
                opened_at: entry.opened_at,
            })
            .collect();
        infos.sort_by_key(|info| info.opened_at);
        infos
    }

    pub fn con_count(&self) -> usize {
        self.inner.state.lock().cons.len()
    }

    /// Parse a frame received on `con` and dispatch it locally.
    pub(crate) async fn accept_net_frame(&self, con: &Arc<dyn Con>, frame: Value) {
        let table = self.code_table();
        let sid = frame.get("sid").and_then(Value::as_str).map(str::to_string);
        match Bmsg::deserialize_from_net(frame, Some(con.sid()), &table) {
            Ok(bmsg) => self.route_inbound(bmsg).await,
            Err(e) => {
                warn!(consid = con.sid(), sid = ?sid, error = %e, "malformed frame dropped");
                let Some(sid) = sid else {
                    return;
                };
                let opts = PubOpts::default().lsid(sid).to(con.sid()).inner(false);
                let reply = Payload::Err(BusError::Val(e.msg().to_string()));
                if let Err(e) = self.publish_payload(reply, opts).await {
                    warn!(consid = con.sid(), error = %e, "cannot report malformed frame");
                }
            }
        }
    }

    /// Hand a parsed inbound message to its connection's dispatcher.
    ///
    /// Replies to a pending `pubr` skip the queue so a subscriber awaiting one
    /// cannot stall behind itself. So do messages of connections that are
    /// already gone.
    async fn route_inbound(&self, bmsg: Bmsg) {
        let inbox = {
            let st = self.inner.state.lock();
            let awaited = bmsg
                .lsid
                .as_ref()
                .is_some_and(|lsid| st.waiters.contains_key(lsid));
            if awaited {
                None
            } else {
                bmsg.src_consid
                    .as_ref()
                    .and_then(|consid| st.cons.get(consid))
                    .map(|entry| entry.inbox.clone())
            }
        };
        let bmsg = match inbox {
            Some(tx) => match tx.send(bmsg).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(bmsg)) => bmsg,
            },
            None => bmsg,
        };
        let bus = self.clone();
        tokio::spawn(async move { bus.dispatch(bmsg, false, true).await });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe `f` to messages of type `T`.
    ///
    /// `T` must be registered. With [`SubOpts::recv_last_msg`] the last
    /// message of `T`'s code, if any, is handed to `f` before this returns.
    pub async fn sub<T, F, Fut>(&self, f: F, opts: SubOpts) -> Result<Unsub, BusError>
    where
        T: Msg,
        F: Fn(T, MsgCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubRet> + Send + 'static,
    {
        let code = self
            .inner
            .state
            .lock()
            .registry
            .get_from_type(TypeId::of::<T>())
            .map_err(|_| {
                BusError::NotFound(format!("type {} is not registered", std::any::type_name::<T>()))
            })?;
        let subfn: SubFn = Arc::new(move |bmsg: Bmsg, ctx: MsgCtx| match bmsg.decode::<T>() {
            Ok(msg) => f(msg, ctx).boxed(),
            Err(e) => futures_util::future::ready(Err(e)).boxed(),
        });
        self.sub_fn(code, subfn, opts).await
    }

    /// Subscribe `f` to raw envelopes of `code`, which may be a regular or an
    /// error code.
    pub async fn sub_code<F, Fut>(&self, code: &str, f: F, opts: SubOpts) -> Result<Unsub, BusError>
    where
        F: Fn(Bmsg, MsgCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubRet> + Send + 'static,
    {
        let known = {
            let st = self.inner.state.lock();
            st.registry.has_code(code) || st.ecodes.iter().any(|c| c == code)
        };
        if !known {
            return Err(BusError::NotFound(format!("code {code} is not registered")));
        }
        let subfn: SubFn = Arc::new(move |bmsg: Bmsg, ctx: MsgCtx| f(bmsg, ctx).boxed());
        self.sub_fn(code.to_string(), subfn, opts).await
    }

    async fn sub_fn(&self, code: String, subfn: SubFn, opts: SubOpts) -> Result<Unsub, BusError> {
        let subsid = self.inner.next_subsid.fetch_add(1, Ordering::Relaxed);
        let last = {
            let mut st = self.inner.state.lock();
            st.subs.insert(code.clone(), subsid, Arc::clone(&subfn));
            if opts.recv_last_msg {
                st.last_msgs.get(&code).cloned()
            } else {
                None
            }
        };
        debug!(subsid, code = %code, "subscribed");
        if let Some(bmsg) = last {
            let ctx = MsgCtx {
                consid: bmsg.src_consid.clone(),
                msid: Some(bmsg.sid.clone()),
            };
            if let Err(e) = invoke(&subfn, bmsg, ctx).await {
                warn!(subsid, code = %code, error = %e, "subscriber failed on last message");
            }
        }
        Ok(Unsub {
            bus: self.downgrade(),
            subsid,
        })
    }

    /// Remove a subscription. Unknown ids are logged and ignored.
    pub fn unsub(&self, subsid: SubId) -> bool {
        let removed = self.inner.state.lock().subs.remove(subsid);
        if !removed {
            debug!(subsid, "unsub of unknown subscription");
        }
        removed
    }

    pub fn unsub_many(&self, subsids: &[SubId]) {
        for subsid in subsids {
            self.unsub(*subsid);
        }
    }

    pub fn sub_count(&self) -> usize {
        self.inner.state.lock().subs.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────────

    /// Publish `msg`. Returns the sid it was sent under.
    pub async fn publish<T: Msg>(&self, msg: &T, opts: PubOpts) -> Result<String, BusError> {
        self.publish_payload(Payload::of(msg)?, opts).await
    }

    /// Publish an error message under the error's code.
    pub async fn publish_err(&self, err: BusError, opts: PubOpts) -> Result<String, BusError> {
        self.publish_payload(Payload::Err(err), opts).await
    }

    /// Publish `msg` and wait for the message linked to it.
    ///
    /// An error reply is returned as `Err`. Fails with
    /// [`BusError::Timeout`] once `opts.pubr_timeout` elapses and with
    /// [`BusError::Closed`] if the bus is destroyed meanwhile.
    pub async fn pubr<T: Msg>(&self, msg: &T, opts: PubOpts) -> Result<Bmsg, BusError> {
        let bmsg = self.envelope(Payload::of(msg)?, &opts)?;
        let sid = bmsg.sid.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.inner.state.lock();
            if st.waiters.contains_key(&sid) {
                return Err(BusError::AlreadyProcessed(format!(
                    "a reply to {sid} is already awaited"
                )));
            }
            st.waiters.insert(sid.clone(), tx);
        }
        let _waiter = WaiterGuard {
            inner: &self.inner,
            sid: sid.clone(),
        };

        self.dispatch(bmsg, opts.send_to_net, opts.send_to_inner).await;

        let reply = match opts.pubr_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| BusError::Timeout(format!("no reply to {sid} within {limit:?}")))?,
            None => rx.await,
        };
        let reply = reply.map_err(|_| {
            BusError::Closed(format!("bus destroyed while awaiting a reply to {sid}"))
        })?;
        match reply.err() {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }

    /// Number of `pubr` calls still waiting for their reply.
    pub fn pending_replies(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    async fn publish_payload(&self, payload: Payload, opts: PubOpts) -> Result<String, BusError> {
        let bmsg = self.envelope(payload, &opts)?;
        let sid = bmsg.sid.clone();
        self.dispatch(bmsg, opts.send_to_net, opts.send_to_inner).await;
        Ok(sid)
    }

    fn envelope(&self, payload: Payload, opts: &PubOpts) -> Result<Bmsg, BusError> {
        let lsid = resolve_lsid(opts.lsid.as_deref(), &opts.ctx)?;
        let (code, is_err, msg) = match payload {
            Payload::Typed {
                type_id,
                type_name,
                msg,
            } => {
                let code = self
                    .inner
                    .state
                    .lock()
                    .registry
                    .get_from_type(type_id)
                    .map_err(|_| BusError::NotFound(format!("type {type_name} is not registered")))?;
                (code, false, msg)
            }
            Payload::Err(err) => {
                let msg = serde_json::to_value(err.to_dto())
                    .map_err(|e| BusError::Val(format!("cannot encode error: {e}")))?;
                (err.code().to_string(), true, msg)
            }
        };
        let target_consids = if opts.target_consids.is_empty() {
            opts.ctx.consid.iter().cloned().collect()
        } else {
            opts.target_consids.clone()
        };
        Ok(Bmsg {
            sid: opts.sid.clone().unwrap_or_else(new_sid),
            lsid,
            code,
            is_err,
            msg,
            target_consids,
            src_consid: None,
        })
    }

    fn dispatch(&self, bmsg: Bmsg, to_net: bool, to_inner: bool) -> BoxFuture<'_, ()> {
        async move {
            if to_net {
                self.send_to_net(&bmsg).await;
            }

            let subs = {
                let mut st = self.inner.state.lock();
                st.last_msgs.insert(bmsg.code.clone(), bmsg.clone());
                if to_inner {
                    st.subs.for_code(&bmsg.code)
                } else {
                    Vec::new()
                }
            };
            for (subsid, subfn) in subs {
                self.call_sub(subsid, &subfn, &bmsg).await;
            }

            if let Some(lsid) = &bmsg.lsid {
                let waiter = self.inner.state.lock().waiters.remove(lsid);
                if let Some(tx) = waiter {
                    let _ = tx.send(bmsg.clone());
                }
            }
        }
        .boxed()
    }

    async fn send_to_net(&self, bmsg: &Bmsg) {
        if bmsg.target_consids.is_empty() {
            return;
        }
        let (frame, sends) = {
            let st = self.inner.state.lock();
            let frame = match bmsg.serialize_to_net(&st.table) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(sid = %bmsg.sid, code = %bmsg.code, error = %e, "net send aborted");
                    return;
                }
            };
            let mut sends = Vec::with_capacity(bmsg.target_consids.len());
            for consid in &bmsg.target_consids {
                match st.cons.get(consid) {
                    Some(entry) => sends.push((Arc::clone(&entry.con), st.out_tx(&entry.con))),
                    None => warn!(consid = %consid, sid = %bmsg.sid, "target connection not found, skipped"),
                }
            }
            (frame, sends)
        };
        for (con, tx) in sends {
            if tx.send((Arc::clone(&con), frame.clone())).await.is_err() {
                warn!(consid = con.sid(), sid = %bmsg.sid, "transport stopped, frame dropped");
            }
        }
    }

    async fn call_sub(&self, subsid: SubId, subfn: &SubFn, bmsg: &Bmsg) {
        let ctx = MsgCtx {
            consid: bmsg.src_consid.clone(),
            msid: Some(bmsg.sid.clone()),
        };
        let reply = match invoke(subfn, bmsg.clone(), ctx.clone()).await {
            Ok(Some(reply)) => reply,
            Ok(None) if is_ack(&bmsg.code) => return,
            Ok(None) => Reply::ok(),
            Err(e) => {
                warn!(subsid, sid = %bmsg.sid, code = %bmsg.code, error = %e, "subscriber failed");
                Reply::err(e)
            }
        };
        let opts = PubOpts::default().reply_to(&ctx);
        if let Err(e) = self.publish_payload(reply.0, opts).await {
            warn!(subsid, sid = %bmsg.sid, error = %e, "auto-reply failed");
        }
    }
}

/// Dispatch one connection's inbound messages in arrival order. Ends once the
/// connection is unregistered and its queue is empty.
async fn drain_inbox(bus: WeakBus, mut inbox: mpsc::Receiver<Bmsg>) {
    while let Some(bmsg) = inbox.recv().await {
        let Some(bus) = bus.upgrade() else {
            return;
        };
        bus.dispatch(bmsg, false, true).await;
    }
}

fn is_ack(code: &str) -> bool {
    code == WELCOME_CODE || code == OK_CODE
}

fn resolve_lsid(lsid: Option<&str>, ctx: &MsgCtx) -> Result<Option<String>, BusError> {
    match lsid {
        None => Ok(None),
        Some(MSID_OPERATOR) => Ok(ctx.msid.clone()),
        Some(op) if op.starts_with('$') => {
            Err(BusError::Val(format!("unrecognized lsid operator {op}")))
        }
        Some(lsid) => Ok(Some(lsid.to_string())),
    }
}

/// Run a subscriber, turning a panic in the call or in its future into
/// [`BusError::Panic`].
async fn invoke(subfn: &SubFn, bmsg: Bmsg, ctx: MsgCtx) -> SubRet {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| subfn(bmsg, ctx))) {
        Ok(fut) => fut,
        Err(payload) => return Err(BusError::Panic(panic_message(payload))),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(ret) => ret,
        Err(payload) => Err(BusError::Panic(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "subscriber panicked".to_string()
    }
}

/// Unregisters a connection when its read loop ends, however it ends.
struct ConGuard<'a> {
    inner: &'a BusInner,
    con: Arc<dyn Con>,
}

impl Drop for ConGuard<'_> {
    fn drop(&mut self) {
        {
            let mut st = self.inner.state.lock();
            let owned = st
                .cons
                .get(self.con.sid())
                .is_some_and(|entry| Arc::ptr_eq(&entry.con, &self.con));
            if owned {
                st.cons.remove(self.con.sid());
            }
        }
        if !self.con.is_closed()
            && let Ok(handle) = Handle::try_current()
        {
            let con = Arc::clone(&self.con);
            handle.spawn(async move { close_quietly(&con).await });
        }
    }
}

/// Removes a `pubr` waiter on every exit path.
struct WaiterGuard<'a> {
    inner: &'a BusInner,
    sid: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().waiters.remove(&self.sid);
    }
}
