//! [`Bmsg`] – the routing envelope around every payload, and its wire codec.
//!
//! On the wire an envelope is a JSON object:
//!
//! ```json
//! {"sid": "9f0c…", "lsid": "41aa…", "codeid": 3, "msg": {"val": 2}}
//! ```
//!
//! `lsid` is omitted when absent. The resolved code, the error flag, the
//! target connections and the origin connection are bookkeeping that never
//! leaves the process; the error flag is recovered from the codeid range.

use std::any::TypeId;

use rxbus_types::{BusError, ErrDto, Msg, OkMsg};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::code::CodeTable;

/// Fresh message id.
pub fn new_sid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// One message in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Bmsg {
    pub sid: String,
    /// Sid of the message this one replies to.
    pub lsid: Option<String>,
    pub code: String,
    pub is_err: bool,
    pub msg: Value,
    pub(crate) target_consids: Vec<String>,
    pub(crate) src_consid: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct NetBmsg {
    sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lsid: Option<String>,
    codeid: u32,
    #[serde(default = "empty_object")]
    msg: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Bmsg {
    /// Envelope with a fresh sid and no routing.
    pub fn new(code: impl Into<String>, is_err: bool, msg: Value) -> Self {
        Self {
            sid: new_sid(),
            lsid: None,
            code: code.into(),
            is_err,
            msg,
            target_consids: Vec::new(),
            src_consid: None,
        }
    }

    /// Connections this envelope is addressed to.
    pub fn target_consids(&self) -> &[String] {
        &self.target_consids
    }

    /// Connection this envelope arrived on, for inbound messages.
    pub fn src_consid(&self) -> Option<&str> {
        self.src_consid.as_deref()
    }

    /// The error carried by this envelope, if it is an error message.
    pub fn err(&self) -> Option<BusError> {
        if !self.is_err {
            return None;
        }
        let dto: ErrDto = serde_json::from_value(self.msg.clone()).unwrap_or_default();
        Some(BusError::from_code(&self.code, dto.msg))
    }

    /// Decode the payload as `T`.
    ///
    /// Error messages decode to their [`BusError`]; a code mismatch fails
    /// with [`BusError::Val`].
    pub fn decode<T: Msg>(&self) -> Result<T, BusError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        if self.code != T::CODE {
            return Err(BusError::Val(format!(
                "cannot decode {} as {}",
                self.code,
                T::CODE
            )));
        }
        serde_json::from_value(self.msg.clone())
            .map_err(|e| BusError::Val(format!("malformed {} payload: {e}", self.code)))
    }

    /// Wire form of this envelope under `table`.
    ///
    /// Fails with [`BusError::NotFound`] if the code has no codeid in `table`.
    pub fn serialize_to_net(&self, table: &CodeTable) -> Result<Value, BusError> {
        let codeid = table.codeid(&self.code, self.is_err).ok_or_else(|| {
            BusError::NotFound(format!("code {} has no codeid", self.code))
        })?;
        let net = NetBmsg {
            sid: self.sid.clone(),
            lsid: self.lsid.clone(),
            codeid,
            msg: self.msg.clone(),
        };
        serde_json::to_value(net).map_err(|e| BusError::Val(e.to_string()))
    }

    /// Rebuild an envelope from a wire frame received on `src_consid`.
    pub fn deserialize_from_net(
        frame: Value,
        src_consid: Option<&str>,
        table: &CodeTable,
    ) -> Result<Bmsg, BusError> {
        let net: NetBmsg = serde_json::from_value(frame)
            .map_err(|e| BusError::Val(format!("invalid frame: {e}")))?;
        let (code, is_err) = table
            .resolve(net.codeid)
            .ok_or_else(|| BusError::NotFound(format!("unknown codeid {}", net.codeid)))?;
        Ok(Bmsg {
            sid: net.sid,
            lsid: net.lsid,
            code: code.to_string(),
            is_err,
            msg: net.msg,
            target_consids: Vec::new(),
            src_consid: src_consid.map(str::to_string),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outgoing payloads
// ─────────────────────────────────────────────────────────────────────────────

/// A payload waiting for its code to be resolved against the registry.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Typed {
        type_id: TypeId,
        type_name: &'static str,
        msg: Value,
    },
    Err(BusError),
}

impl Payload {
    pub(crate) fn of<T: Msg>(msg: &T) -> Result<Self, BusError> {
        let msg = serde_json::to_value(msg)
            .map_err(|e| BusError::Val(format!("cannot encode {}: {e}", T::CODE)))?;
        Ok(Payload::Typed {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            msg,
        })
    }

    pub(crate) fn ok() -> Self {
        Payload::Typed {
            type_id: TypeId::of::<OkMsg>(),
            type_name: std::any::type_name::<OkMsg>(),
            msg: empty_object(),
        }
    }
}

/// What a subscriber sends back to the message that triggered it.
#[derive(Debug, Clone)]
pub struct Reply(pub(crate) Payload);

impl Reply {
    pub fn of<T: Msg>(msg: &T) -> Result<Self, BusError> {
        Payload::of(msg).map(Reply)
    }

    pub fn ok() -> Self {
        Reply(Payload::ok())
    }

    pub fn err(err: BusError) -> Self {
        Reply(Payload::Err(err))
    }
}

impl From<BusError> for Reply {
    fn from(err: BusError) -> Self {
        Reply::err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        val: i64,
    }
    impl Msg for Ping {
        const CODE: &'static str = "test::ping";
    }

    fn table() -> CodeTable {
        CodeTable::new(
            vec!["rxbus::welcome".into(), "rxbus::ok".into(), "test::ping".into()],
            vec!["not_found_err".into(), "val_err".into()],
        )
    }

    #[test]
    fn net_roundtrip_keeps_code_sid_lsid_and_payload() {
        let mut bmsg = Bmsg::new("test::ping", false, json!({"val": 7}));
        bmsg.lsid = Some("parent".into());
        bmsg.target_consids = vec!["c1".into()];

        let frame = bmsg.serialize_to_net(&table()).unwrap();
        assert_eq!(frame["codeid"], json!(2));
        assert!(frame.get("target_consids").is_none());

        let back = Bmsg::deserialize_from_net(frame, Some("c9"), &table()).unwrap();
        assert_eq!(back.sid, bmsg.sid);
        assert_eq!(back.lsid.as_deref(), Some("parent"));
        assert_eq!(back.code, "test::ping");
        assert_eq!(back.decode::<Ping>().unwrap(), Ping { val: 7 });
        assert_eq!(back.src_consid(), Some("c9"));
        assert!(back.target_consids().is_empty());
    }

    #[test]
    fn lsid_is_omitted_when_absent() {
        let frame = Bmsg::new("rxbus::ok", false, json!({}))
            .serialize_to_net(&table())
            .unwrap();
        assert!(frame.get("lsid").is_none());
        assert_eq!(frame["codeid"], json!(1));
    }

    #[test]
    fn frame_without_sid_fails_validation() {
        let err = Bmsg::deserialize_from_net(json!({"codeid": 1, "msg": {}}), None, &table())
            .unwrap_err();
        assert!(matches!(err, BusError::Val(_)));
    }

    #[test]
    fn unknown_codeid_is_not_found() {
        let err = Bmsg::deserialize_from_net(json!({"sid": "s", "codeid": 42}), None, &table())
            .unwrap_err();
        assert!(matches!(err, BusError::NotFound(_)));
    }

    #[test]
    fn error_codeids_decode_to_bus_errors() {
        let frame = json!({"sid": "s", "lsid": "r", "codeid": 4, "msg": {"msg": "bad"}});
        let bmsg = Bmsg::deserialize_from_net(frame, None, &table()).unwrap();
        assert!(bmsg.is_err);
        assert_eq!(bmsg.err(), Some(BusError::Val("bad".into())));
        assert_eq!(bmsg.decode::<Ping>(), Err(BusError::Val("bad".into())));
    }

    #[test]
    fn unresolvable_code_aborts_serialization() {
        let bmsg = Bmsg::new("test::unknown", false, json!({}));
        assert!(matches!(
            bmsg.serialize_to_net(&table()),
            Err(BusError::NotFound(_))
        ));
    }

    #[test]
    fn decode_rejects_other_codes() {
        let bmsg = Bmsg::new("rxbus::ok", false, json!({}));
        assert!(matches!(bmsg.decode::<Ping>(), Err(BusError::Val(_))));
    }
}
