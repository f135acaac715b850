//! `rxbus-middleware` – the broker.
//!
//! Accepts connections of any supported kind, announces the code table to
//! each of them, and routes typed messages between remote peers and local
//! subscribers, with request/response correlation on top.
//!
//! # Modules
//!
//! - [`bus`] – the [`Bus`] itself: connection, subscription and reply tables
//!   and the dispatch engine.
//! - [`code`] – payload type ↔ code ↔ codeid registry.
//! - [`bmsg`] – the [`Bmsg`] envelope and its JSON wire codec.
//! - [`con`] – the [`Con`] trait every connection implements.
//! - [`transport`] – transport configuration and its runtime queues.
//! - [`ws`], [`udp`], [`mem`] – websocket, UDP and in-process connections.
//!
//! # Example
//!
//! ```rust,no_run
//! use rxbus_middleware::{Bus, BusCfg, CodeEntry, MsgCtx, PubOpts, Reply, SubOpts};
//! use rxbus_types::Msg;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping { val: i64 }
//! impl Msg for Ping { const CODE: &'static str = "demo::ping"; }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Pong { val: i64 }
//! impl Msg for Pong { const CODE: &'static str = "demo::pong"; }
//!
//! # async fn demo() -> Result<(), rxbus_types::BusError> {
//! let cfg = BusCfg::default()
//!     .reg(CodeEntry::of::<Ping>())
//!     .reg(CodeEntry::of::<Pong>());
//! let bus = Bus::new(cfg)?;
//! bus.init()?;
//!
//! bus.sub(
//!     |ping: Ping, _ctx: MsgCtx| async move { Reply::of(&Pong { val: ping.val + 1 }).map(Some) },
//!     SubOpts::default(),
//! )
//! .await?;
//!
//! let pong: Pong = bus.pubr(&Ping { val: 1 }, PubOpts::default()).await?.decode()?;
//! assert_eq!(pong.val, 2);
//! # Ok(())
//! # }
//! ```

pub mod bmsg;
pub mod bus;
pub mod cfg;
pub mod code;
pub mod con;
pub mod mem;
pub mod subs;
pub mod transport;
pub mod udp;
pub mod ws;

pub use bmsg::{Bmsg, Reply};
pub use bus::{Bus, ConInfo, MSID_OPERATOR, MsgCtx, PubOpts, SubOpts, Unsub, WeakBus};
pub use cfg::BusCfg;
pub use code::{CodeEntry, CodeRegistry, CodeTable};
pub use con::{Con, ConType, frames};
pub use mem::{MemCon, MemPeer};
pub use subs::{SubFn, SubId, SubRet};
pub use transport::{ConHook, Transport};
pub use udp::{UdpCon, UdpPeers};
pub use ws::WsCon;
