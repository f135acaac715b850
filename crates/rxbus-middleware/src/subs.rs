//! Subscription table: code → ordered subscriber list, plus the reverse
//! index used by `unsub`.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rxbus_types::BusError;

use crate::bmsg::{Bmsg, Reply};
use crate::bus::MsgCtx;

/// Subscription id, unique for the lifetime of a bus.
pub type SubId = u64;

/// What a subscriber returns. `Ok(None)` is acknowledged with an `OkMsg`.
pub type SubRet = Result<Option<Reply>, BusError>;

/// Type-erased subscriber callback.
pub type SubFn = Arc<dyn Fn(Bmsg, MsgCtx) -> BoxFuture<'static, SubRet> + Send + Sync>;

#[derive(Default)]
pub(crate) struct SubTable {
    by_code: HashMap<String, Vec<(SubId, SubFn)>>,
    code_of: HashMap<SubId, String>,
}

impl SubTable {
    pub(crate) fn insert(&mut self, code: String, subsid: SubId, subfn: SubFn) {
        self.code_of.insert(subsid, code.clone());
        self.by_code.entry(code).or_default().push((subsid, subfn));
    }

    /// Returns whether `subsid` was subscribed.
    pub(crate) fn remove(&mut self, subsid: SubId) -> bool {
        let Some(code) = self.code_of.remove(&subsid) else {
            return false;
        };
        if let Some(list) = self.by_code.get_mut(&code) {
            list.retain(|(id, _)| *id != subsid);
            if list.is_empty() {
                self.by_code.remove(&code);
            }
        }
        true
    }

    /// Subscribers of `code` in registration order.
    pub(crate) fn for_code(&self, code: &str) -> Vec<(SubId, SubFn)> {
        self.by_code.get(code).cloned().unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.code_of.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_code.clear();
        self.code_of.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn noop() -> SubFn {
        Arc::new(|_: Bmsg, _: MsgCtx| -> BoxFuture<'static, SubRet> { async { Ok(None) }.boxed() })
    }

    #[test]
    fn keeps_registration_order_per_code() {
        let mut table = SubTable::default();
        table.insert("a".into(), 1, noop());
        table.insert("b".into(), 2, noop());
        table.insert("a".into(), 3, noop());
        let ids: Vec<SubId> = table.for_code("a").into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn remove_updates_both_indexes() {
        let mut table = SubTable::default();
        table.insert("a".into(), 1, noop());
        assert!(table.remove(1));
        assert!(!table.remove(1));
        assert!(table.for_code("a").is_empty());
        assert_eq!(table.len(), 0);
    }
}
