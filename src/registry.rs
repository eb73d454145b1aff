//! Session and target-name registry
//!
//! One registry is created per running target and passed to whatever needs
//! it; there is no process-wide state. Sessions keep a weak handle back to
//! the registry that holds them so teardown can unlink itself.

use crate::session::Session;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// A target node and the portals it is reachable through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    pub name: String,
    /// `address:port,tpgt` strings as advertised by SendTargets
    pub portals: Vec<String>,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u16, Arc<Session>>>,
    targets: RwLock<Vec<TargetEntry>>,
    next_tsih: Mutex<u16>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            targets: RwLock::new(Vec::new()),
            next_tsih: Mutex::new(1),
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub fn add_target(&self, entry: TargetEntry) {
        let mut targets = self.targets.write();
        match targets.iter_mut().find(|t| t.name == entry.name) {
            Some(existing) => *existing = entry,
            None => targets.push(entry),
        }
    }

    pub fn remove_target(&self, name: &str) -> bool {
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|t| t.name != name);
        targets.len() != before
    }

    pub fn has_target(&self, name: &str) -> bool {
        self.targets.read().iter().any(|t| t.name == name)
    }

    pub fn targets(&self) -> Vec<TargetEntry> {
        self.targets.read().clone()
    }

    /// Next free TSIH; zero is reserved for "new session"
    pub fn allocate_tsih(&self) -> u16 {
        let sessions = self.sessions.read();
        let mut next = self.next_tsih.lock();
        loop {
            let tsih = *next;
            *next = next.wrapping_add(1).max(1);
            if tsih != 0 && !sessions.contains_key(&tsih) {
                return tsih;
            }
        }
    }

    pub fn insert(&self, session: Arc<Session>) {
        debug!("registering session TSIH {}", session.tsih);
        self.sessions.write().insert(session.tsih, session);
    }

    pub fn find(&self, tsih: u16) -> Option<Arc<Session>> {
        self.sessions.read().get(&tsih).cloned()
    }

    /// Session matching an initiator's (ISID, InitiatorName, TargetName)
    pub fn find_by_identity(&self, isid: &[u8; 6], initiator: &str, target: &str) -> Option<Arc<Session>> {
        self.sessions.read()
            .values()
            .find(|s| &s.isid == isid && s.initiator_name == initiator && s.target_name == target)
            .cloned()
    }

    pub fn remove(&self, tsih: u16) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(&tsih);
        if removed.is_some() {
            debug!("unregistered session TSIH {}", tsih);
        }
        removed
    }

    /// Remove `session` if it is still the one registered under its TSIH
    pub(crate) fn unregister(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.tsih) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.tsih);
                debug!("unregistered session TSIH {}", session.tsih);
                true
            }
            _ => false,
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_table() {
        let reg = SessionRegistry::new();
        reg.add_target(TargetEntry {
            name: "iqn.2026-10.test:a".into(),
            portals: vec!["127.0.0.1:3260,1".into()],
        });
        reg.add_target(TargetEntry {
            name: "iqn.2026-10.test:a".into(),
            portals: vec!["10.0.0.1:3260,1".into()],
        });
        assert_eq!(reg.targets().len(), 1);
        assert_eq!(reg.targets()[0].portals[0], "10.0.0.1:3260,1");
        assert!(reg.has_target("iqn.2026-10.test:a"));
        assert!(reg.remove_target("iqn.2026-10.test:a"));
        assert!(!reg.has_target("iqn.2026-10.test:a"));
    }

    #[test]
    fn test_tsih_skips_zero() {
        let reg = SessionRegistry::new();
        *reg.next_tsih.lock() = u16::MAX;
        assert_eq!(reg.allocate_tsih(), u16::MAX);
        assert_eq!(reg.allocate_tsih(), 1);
        assert_eq!(reg.allocate_tsih(), 2);
    }
}
