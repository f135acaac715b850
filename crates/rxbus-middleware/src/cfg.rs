//! Bus configuration.

use serde::{Deserialize, Serialize};

use crate::code::CodeEntry;
use crate::transport::Transport;

/// Everything [`Bus::new`][crate::bus::Bus::new] needs.
///
/// `reg_types` can only be filled in code; the rest round-trips through TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusCfg {
    #[serde(skip)]
    pub reg_types: Vec<CodeEntry>,
    /// Extra error codes, appended after the built-in ones.
    pub reg_ecodes: Vec<String>,
    pub log_net_send: bool,
    pub log_net_recv: bool,
    // Last, so TOML writes the plain keys before the `[[transports]]` tables.
    pub transports: Vec<Transport>,
}

impl Default for BusCfg {
    fn default() -> Self {
        Self {
            transports: vec![Transport::default()],
            reg_types: Vec::new(),
            reg_ecodes: Vec::new(),
            log_net_send: false,
            log_net_recv: false,
        }
    }
}

impl BusCfg {
    /// Config with the given transports and nothing else.
    pub fn with_transports(transports: Vec<Transport>) -> Self {
        Self {
            transports,
            ..Self::default()
        }
    }

    pub fn reg(mut self, entry: CodeEntry) -> Self {
        self.reg_types.push(entry);
        self
    }

    pub fn ecode(mut self, code: impl Into<String>) -> Self {
        self.reg_ecodes.push(code.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::con::ConType;

    #[test]
    fn default_has_one_ws_server() {
        let cfg = BusCfg::default();
        assert_eq!(cfg.transports.len(), 1);
        assert_eq!(cfg.transports[0].con_type, ConType::Ws);
        assert!(cfg.reg_types.is_empty());
        assert!(!cfg.log_net_send && !cfg.log_net_recv);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: BusCfg = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.transports.len(), 1);
        assert_eq!(cfg.transports[0].port, 3000);
    }

    #[test]
    fn builders_collect_ecodes() {
        let cfg = BusCfg::with_transports(vec![Transport::mem()])
            .ecode("auth_err")
            .ecode("quota_err");
        assert_eq!(cfg.reg_ecodes, vec!["auth_err", "quota_err"]);
        assert_eq!(cfg.transports[0].con_type, ConType::Mem);
    }
}
