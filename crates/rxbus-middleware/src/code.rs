//! Code registry: payload type ↔ string code ↔ integer codeid.
//!
//! [`CodeRegistry`] holds the ordered list of regular codes, each bound to the
//! concrete Rust type registered for it. Registration is an explicit table of
//! [`CodeEntry`] values built with [`CodeEntry::of`], validated once per
//! update; no runtime type introspection is involved.
//!
//! [`CodeTable`] is the immutable snapshot the wire codec works with: the
//! regular codes followed by the bus-owned error codes.
//!
//! | codeid range | meaning |
//! |---|---|
//! | `0` | [`Welcome`][rxbus_types::Welcome] |
//! | `1` | [`OkMsg`][rxbus_types::OkMsg] |
//! | `2 .. codes.len()` | regular codes in registration order |
//! | `codes.len() ..` | error codes in registration order |

use std::any::TypeId;

use rxbus_types::{BusError, Msg, Welcome};

/// One registrable payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeEntry {
    code: String,
    type_id: TypeId,
    type_name: &'static str,
}

impl CodeEntry {
    /// Entry for `T`, registered under [`Msg::CODE`].
    pub fn of<T: Msg>() -> Self {
        Self {
            code: T::CODE.to_string(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Entry for `T` under `code` instead of [`Msg::CODE`].
    pub fn named<T: Msg>(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::of::<T>()
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// Ordered registry of regular codes.
#[derive(Debug, Default, Clone)]
pub struct CodeRegistry {
    entries: Vec<CodeEntry>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `types` into the registry and reorder so that the codes named in
    /// `fixed_order` come first, in that order.
    ///
    /// * A new code is appended.
    /// * A known code with a different type is re-registered in place, keeping
    ///   its codeid.
    /// * A type already registered under another code is rejected with
    ///   [`BusError::Val`] and nothing is changed.
    ///
    /// Returns whether the registry changed.
    pub fn upd(&mut self, types: &[CodeEntry], fixed_order: &[&str]) -> Result<bool, BusError> {
        for entry in types {
            let clash = self
                .entries
                .iter()
                .chain(types.iter())
                .find(|e| e.type_id == entry.type_id && e.code != entry.code);
            if let Some(other) = clash {
                return Err(BusError::Val(format!(
                    "type {} cannot be registered as {} because it is already bound to {}",
                    entry.type_name, entry.code, other.code
                )));
            }
        }

        let before = self.get_regd_codes();
        let mut replaced = false;
        for entry in types {
            match self.entries.iter_mut().find(|e| e.code == entry.code) {
                Some(existing) if existing == entry => {}
                Some(existing) => {
                    *existing = entry.clone();
                    replaced = true;
                }
                None => self.entries.push(entry.clone()),
            }
        }

        let mut ordered = Vec::with_capacity(self.entries.len());
        for code in fixed_order {
            if let Some(pos) = self.entries.iter().position(|e| e.code == *code) {
                ordered.push(self.entries.remove(pos));
            }
        }
        ordered.append(&mut self.entries);
        self.entries = ordered;
        Ok(replaced || self.get_regd_codes() != before)
    }

    /// Code registered for `type_id`.
    pub fn get_from_type(&self, type_id: TypeId) -> Result<String, BusError> {
        self.entries
            .iter()
            .find(|e| e.type_id == type_id)
            .map(|e| e.code.clone())
            .ok_or_else(|| BusError::NotFound(format!("type {type_id:?} is not registered")))
    }

    /// All regular codes in codeid order.
    pub fn get_regd_codes(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.code.clone()).collect()
    }

    /// Type registered under `code`.
    pub fn get_regd_type_by_code(&self, code: &str) -> Result<TypeId, BusError> {
        self.entries
            .iter()
            .find(|e| e.code == code)
            .map(|e| e.type_id)
            .ok_or_else(|| BusError::NotFound(format!("code {code} is not registered")))
    }

    /// Codeid of the code registered for `type_id`.
    pub fn get_regd_codeid_by_type(&self, type_id: TypeId) -> Result<u32, BusError> {
        self.entries
            .iter()
            .position(|e| e.type_id == type_id)
            .map(|pos| pos as u32)
            .ok_or_else(|| BusError::NotFound(format!("type {type_id:?} is not registered")))
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.entries.iter().any(|e| e.code == code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Immutable snapshot of the definitive codeid list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeTable {
    codes: Vec<String>,
    ecodes: Vec<String>,
}

impl CodeTable {
    pub fn new(codes: Vec<String>, ecodes: Vec<String>) -> Self {
        Self { codes, ecodes }
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn ecodes(&self) -> &[String] {
        &self.ecodes
    }

    /// Codeid of `code`, looked up among error codes when `is_err`.
    pub fn codeid(&self, code: &str, is_err: bool) -> Option<u32> {
        if is_err {
            self.ecodes
                .iter()
                .position(|c| c == code)
                .map(|pos| (self.codes.len() + pos) as u32)
        } else {
            self.codes.iter().position(|c| c == code).map(|pos| pos as u32)
        }
    }

    /// Code behind `codeid`, and whether it is an error code.
    pub fn resolve(&self, codeid: u32) -> Option<(&str, bool)> {
        let idx = codeid as usize;
        if let Some(code) = self.codes.get(idx) {
            return Some((code, false));
        }
        self.ecodes
            .get(idx - self.codes.len())
            .map(|code| (code.as_str(), true))
    }

    pub fn welcome(&self) -> Welcome {
        Welcome {
            codes: self.codes.clone(),
            ecodes: self.ecodes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxbus_types::{DEFAULT_CODE_ORDER, OkMsg, Welcome};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        val: i64,
    }
    impl Msg for Ping {
        const CODE: &'static str = "test::ping";
    }

    #[derive(Serialize, Deserialize)]
    struct Pong {
        val: i64,
    }
    impl Msg for Pong {
        const CODE: &'static str = "test::pong";
    }

    // Same code as `Ping`, different type.
    #[derive(Serialize, Deserialize)]
    struct PingV2 {
        val: String,
    }
    impl Msg for PingV2 {
        const CODE: &'static str = "test::ping";
    }

    fn boot() -> CodeRegistry {
        let mut reg = CodeRegistry::new();
        reg.upd(
            &[CodeEntry::of::<Ping>(), CodeEntry::of::<OkMsg>(), CodeEntry::of::<Welcome>()],
            &DEFAULT_CODE_ORDER,
        )
        .unwrap();
        reg
    }

    #[test]
    fn fixed_codes_are_pinned_first() {
        let reg = boot();
        assert_eq!(
            reg.get_regd_codes(),
            vec!["rxbus::welcome", "rxbus::ok", "test::ping"]
        );
        assert_eq!(reg.get_regd_codeid_by_type(TypeId::of::<Welcome>()).unwrap(), 0);
        assert_eq!(reg.get_regd_codeid_by_type(TypeId::of::<OkMsg>()).unwrap(), 1);
    }

    #[test]
    fn later_registrations_append_and_keep_fixed_ids() {
        let mut reg = boot();
        assert!(reg.upd(&[CodeEntry::of::<Pong>()], &DEFAULT_CODE_ORDER).unwrap());
        assert_eq!(reg.get_regd_codeid_by_type(TypeId::of::<Welcome>()).unwrap(), 0);
        assert_eq!(reg.get_regd_codeid_by_type(TypeId::of::<OkMsg>()).unwrap(), 1);
        assert_eq!(reg.get_regd_codeid_by_type(TypeId::of::<Ping>()).unwrap(), 2);
        assert_eq!(reg.get_regd_codeid_by_type(TypeId::of::<Pong>()).unwrap(), 3);
    }

    #[test]
    fn registering_the_same_entry_twice_is_a_noop() {
        let mut reg = boot();
        assert!(!reg.upd(&[CodeEntry::of::<Ping>()], &DEFAULT_CODE_ORDER).unwrap());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn reregistration_replaces_type_in_place() {
        let mut reg = boot();
        assert!(reg.upd(&[CodeEntry::of::<PingV2>()], &DEFAULT_CODE_ORDER).unwrap());
        assert_eq!(reg.get_regd_codeid_by_type(TypeId::of::<PingV2>()).unwrap(), 2);
        assert_eq!(
            reg.get_regd_type_by_code("test::ping").unwrap(),
            TypeId::of::<PingV2>()
        );
        assert!(reg.get_from_type(TypeId::of::<Ping>()).is_err());
    }

    #[test]
    fn named_entry_uses_its_own_code() {
        let mut reg = boot();
        reg.upd(&[CodeEntry::named::<Pong>("test::pong.v1")], &DEFAULT_CODE_ORDER)
            .unwrap();
        assert_eq!(reg.get_from_type(TypeId::of::<Pong>()).unwrap(), "test::pong.v1");
    }

    #[test]
    fn type_under_a_second_code_is_rejected_without_changes() {
        let mut reg = boot();
        let before = reg.get_regd_codes();

        let err = reg
            .upd(&[CodeEntry::named::<Ping>("test::alias")], &DEFAULT_CODE_ORDER)
            .unwrap_err();
        assert!(matches!(err, BusError::Val(_)));
        assert_eq!(reg.get_regd_codes(), before);
        assert_eq!(reg.get_from_type(TypeId::of::<Ping>()).unwrap(), "test::ping");

        // A clash inside one batch rejects the whole batch.
        let err = reg
            .upd(
                &[CodeEntry::of::<Pong>(), CodeEntry::named::<Pong>("test::pong.v2")],
                &DEFAULT_CODE_ORDER,
            )
            .unwrap_err();
        assert!(matches!(err, BusError::Val(_)));
        assert_eq!(reg.get_regd_codes(), before);
        assert!(!reg.has_code("test::pong"));
    }

    #[test]
    fn unknown_lookups_are_not_found() {
        let reg = boot();
        assert!(matches!(
            reg.get_from_type(TypeId::of::<Pong>()),
            Err(BusError::NotFound(_))
        ));
        assert!(matches!(
            reg.get_regd_type_by_code("nope"),
            Err(BusError::NotFound(_))
        ));
    }

    #[test]
    fn table_resolves_regular_and_error_codeids() {
        let table = CodeTable::new(
            vec!["rxbus::welcome".into(), "rxbus::ok".into(), "test::ping".into()],
            vec!["val_err".into(), "auth_err".into()],
        );
        assert_eq!(table.codeid("test::ping", false), Some(2));
        assert_eq!(table.codeid("val_err", true), Some(3));
        assert_eq!(table.codeid("auth_err", true), Some(4));
        assert_eq!(table.codeid("val_err", false), None);
        assert_eq!(table.resolve(2), Some(("test::ping", false)));
        assert_eq!(table.resolve(4), Some(("auth_err", true)));
        assert_eq!(table.resolve(5), None);
    }
}
