//! `rxbus-types` – shared vocabulary of the bus.
//!
//! Everything a peer and the broker must agree on without depending on the
//! broker itself:
//!
//! - [`Msg`] – the trait that binds a payload type to its stable string code.
//! - [`Welcome`] and [`OkMsg`] – the two built-in payloads pinned to codeids
//!   `0` and `1`.
//! - [`BusError`] – the error taxonomy, which doubles as the set of built-in
//!   error codes sent over the wire.
//! - [`ErrDto`] – the single payload shape shared by every error message.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A payload that can travel over the bus.
///
/// `CODE` is the stable identifier shared with every peer; codeids are
/// derived from it at runtime and may differ between runs, codes may not.
///
/// ```
/// use rxbus_types::Msg;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping {
///     val: i64,
/// }
///
/// impl Msg for Ping {
///     const CODE: &'static str = "demo::ping";
/// }
/// ```
pub trait Msg: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CODE: &'static str;
}

/// Code of the handshake message (always codeid `0`).
pub const WELCOME_CODE: &str = "rxbus::welcome";
/// Code of the empty acknowledgement (always codeid `1`).
pub const OK_CODE: &str = "rxbus::ok";
/// Codes that are always pinned to the front of the code list, in order.
pub const DEFAULT_CODE_ORDER: [&str; 2] = [WELCOME_CODE, OK_CODE];

/// Handshake announcing the current codeid mapping to a connection.
///
/// Regular codeids are indices into `codes`; error codeids continue after the
/// last regular code, i.e. `codes.len() + index into ecodes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub codes: Vec<String>,
    #[serde(default)]
    pub ecodes: Vec<String>,
}

impl Msg for Welcome {
    const CODE: &'static str = WELCOME_CODE;
}

/// Successful-but-empty reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkMsg {}

impl Msg for OkMsg {
    const CODE: &'static str = OK_CODE;
}

/// Wire payload of every error message. The error kind travels in the codeid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrDto {
    #[serde(default)]
    pub msg: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

pub const NOT_FOUND_ERR: &str = "not_found_err";
pub const ALREADY_PROCESSED_ERR: &str = "already_processed_err";
pub const VAL_ERR: &str = "val_err";
pub const PANIC_ERR: &str = "panic_err";
pub const UNSUPPORTED_ERR: &str = "unsupported_err";
pub const TIMEOUT_ERR: &str = "timeout_err";
pub const CLOSED_ERR: &str = "closed_err";

/// Error codes every bus registers before any user-supplied ones.
pub const BUILTIN_ECODES: [&str; 7] = [
    NOT_FOUND_ERR,
    ALREADY_PROCESSED_ERR,
    VAL_ERR,
    PANIC_ERR,
    UNSUPPORTED_ERR,
    TIMEOUT_ERR,
    CLOSED_ERR,
];

/// Failure of a bus operation, or an error message received from a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    /// Unknown code, sid, subscription or connection.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An lsid that already has an in-flight waiter, or a duplicate sid.
    #[error("Already processed: {0}")]
    AlreadyProcessed(String),

    /// Malformed input, e.g. an inbound frame without `sid`.
    #[error("Validation failed: {0}")]
    Val(String),

    /// A subscriber panicked while handling a message.
    #[error("Subscriber panicked: {0}")]
    Panic(String),

    /// A connection type with no registered transport.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The connection, queue or bus went away.
    #[error("Closed: {0}")]
    Closed(String),

    /// An application-defined error code registered through `reg_ecodes`.
    #[error("{code}: {msg}")]
    Custom { code: String, msg: String },
}

impl BusError {
    /// Stable wire code of this error.
    pub fn code(&self) -> &str {
        match self {
            BusError::NotFound(_) => NOT_FOUND_ERR,
            BusError::AlreadyProcessed(_) => ALREADY_PROCESSED_ERR,
            BusError::Val(_) => VAL_ERR,
            BusError::Panic(_) => PANIC_ERR,
            BusError::Unsupported(_) => UNSUPPORTED_ERR,
            BusError::Timeout(_) => TIMEOUT_ERR,
            BusError::Closed(_) => CLOSED_ERR,
            BusError::Custom { code, .. } => code,
        }
    }

    /// Human readable detail, without the kind prefix.
    pub fn msg(&self) -> &str {
        match self {
            BusError::NotFound(m)
            | BusError::AlreadyProcessed(m)
            | BusError::Val(m)
            | BusError::Panic(m)
            | BusError::Unsupported(m)
            | BusError::Timeout(m)
            | BusError::Closed(m) => m,
            BusError::Custom { msg, .. } => msg,
        }
    }

    /// Rebuild an error from its wire code and message.
    ///
    /// Codes outside [`BUILTIN_ECODES`] become [`BusError::Custom`].
    pub fn from_code(code: &str, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            NOT_FOUND_ERR => BusError::NotFound(msg),
            ALREADY_PROCESSED_ERR => BusError::AlreadyProcessed(msg),
            VAL_ERR => BusError::Val(msg),
            PANIC_ERR => BusError::Panic(msg),
            UNSUPPORTED_ERR => BusError::Unsupported(msg),
            TIMEOUT_ERR => BusError::Timeout(msg),
            CLOSED_ERR => BusError::Closed(msg),
            other => BusError::Custom {
                code: other.to_string(),
                msg,
            },
        }
    }

    pub fn custom(code: impl Into<String>, msg: impl Into<String>) -> Self {
        BusError::Custom {
            code: code.into(),
            msg: msg.into(),
        }
    }

    /// The wire payload carried by an error message.
    pub fn to_dto(&self) -> ErrDto {
        ErrDto {
            msg: self.msg().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_codes_roundtrip_through_from_code() {
        let errs = [
            BusError::NotFound("a".into()),
            BusError::AlreadyProcessed("b".into()),
            BusError::Val("c".into()),
            BusError::Panic("d".into()),
            BusError::Unsupported("e".into()),
            BusError::Timeout("f".into()),
            BusError::Closed("g".into()),
        ];
        for err in errs {
            assert!(BUILTIN_ECODES.contains(&err.code()));
            assert_eq!(BusError::from_code(err.code(), err.msg()), err);
        }
    }

    #[test]
    fn unknown_code_becomes_custom() {
        let err = BusError::from_code("auth_err", "bad token");
        assert_eq!(err, BusError::custom("auth_err", "bad token"));
        assert_eq!(err.code(), "auth_err");
        assert_eq!(err.to_string(), "auth_err: bad token");
    }

    #[test]
    fn default_code_order_pins_welcome_then_ok() {
        assert_eq!(DEFAULT_CODE_ORDER, [Welcome::CODE, OkMsg::CODE]);
    }

    #[test]
    fn welcome_without_ecodes_deserializes() {
        let welcome: Welcome =
            serde_json::from_str(r#"{"codes":["rxbus::welcome","rxbus::ok"]}"#).unwrap();
        assert_eq!(welcome.codes.len(), 2);
        assert!(welcome.ecodes.is_empty());
    }

    #[test]
    fn err_dto_carries_message_only() {
        let dto = BusError::Timeout("no reply".into()).to_dto();
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json, serde_json::json!({"msg": "no reply"}));
    }

    #[test]
    fn bus_error_display() {
        let err = BusError::NotFound("code demo::ping".to_string());
        assert!(err.to_string().contains("Not found"));
        assert!(err.to_string().contains("demo::ping"));
    }
}
