//! iSCSI session state
//!
//! A [`Session`] is shared by every connection logged in under one
//! (ISID, TSIH) pair. It owns the CmdSN window, the target transfer tag
//! counter, the connection list and the ERL 2 connection recovery records.
//! Negotiated operational parameters are fixed once login completes.

use crate::config::TargetConfig;
use crate::connection::Connection;
use crate::pdu::RESERVED_TAG;
use crate::recovery::ConnectionRecovery;
use crate::registry::SessionRegistry;
use crate::sequencing::CmdSnWindow;
use crate::sync::{UsageCount, Watch};
use crate::target::TargetContext;
use crate::timer::TimerId;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Connections the target allows per session
pub const MAX_CONNECTIONS_OFFER: u32 = 8;

/// Session state (RFC 3720 Section 7.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Free,
    /// Leading login in progress
    Active,
    LoggedIn,
    /// Last connection failed; waiting out Time2Retain
    Failed,
    /// A FAILED session picked up by a new login
    InContinue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    #[default]
    Normal,
    Discovery,
}

/// Negotiated session-wide parameters (RFC 3720 Section 12)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub max_connections: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub default_time2wait: u16,
    pub default_time2retain: u16,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u8,
    pub immediate_data: bool,
    pub initial_r2t: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            max_connections: 1,
            max_burst_length: 262144,
            first_burst_length: 65536,
            default_time2wait: 2,
            default_time2retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            immediate_data: true,
            initial_r2t: false,
        }
    }
}

fn yes_no(v: bool) -> String {
    if v { "Yes" } else { "No" }.to_string()
}

impl SessionParams {
    /// What the target proposes before hearing from the initiator
    pub fn offer(config: &TargetConfig) -> Self {
        SessionParams {
            max_connections: MAX_CONNECTIONS_OFFER,
            error_recovery_level: config.default_erl,
            initial_r2t: config.initial_r2t,
            immediate_data: config.immediate_data,
            data_pdu_in_order: config.data_pdu_in_order,
            data_sequence_in_order: config.data_sequence_in_order,
            max_outstanding_r2t: config.max_outstanding_r2t,
            max_burst_length: config.max_burst_length,
            first_burst_length: config.first_burst_length,
            ..SessionParams::default()
        }
    }

    /// Fold one initiator key into the target's offer
    ///
    /// Numeric keys take the minimum (Time2Wait the maximum). ImmediateData
    /// is ANDed; InitialR2T and both in-order keys are ORed, so they come out
    /// No only when both sides offered No. Returns false for keys that are
    /// not session parameters.
    pub fn apply_initiator_param(&mut self, key: &str, value: &str) -> bool {
        let num = || value.parse::<u32>().ok();
        match key {
            "MaxConnections" => {
                if let Some(v) = num() {
                    self.max_connections = v.clamp(1, self.max_connections);
                }
            }
            "MaxBurstLength" => {
                if let Some(v) = num() {
                    self.max_burst_length = v.clamp(512, self.max_burst_length);
                }
            }
            "FirstBurstLength" => {
                if let Some(v) = num() {
                    self.first_burst_length = v.clamp(512, self.first_burst_length);
                }
            }
            "DefaultTime2Wait" => {
                if let Ok(v) = value.parse::<u16>() {
                    self.default_time2wait = v.max(self.default_time2wait);
                }
            }
            "DefaultTime2Retain" => {
                if let Ok(v) = value.parse::<u16>() {
                    self.default_time2retain = v.min(self.default_time2retain);
                }
            }
            "MaxOutstandingR2T" => {
                if let Some(v) = num() {
                    self.max_outstanding_r2t = v.clamp(1, self.max_outstanding_r2t);
                }
            }
            "DataPDUInOrder" => self.data_pdu_in_order = self.data_pdu_in_order || value == "Yes",
            "DataSequenceInOrder" => {
                self.data_sequence_in_order = self.data_sequence_in_order || value == "Yes"
            }
            "ErrorRecoveryLevel" => {
                if let Ok(v) = value.parse::<u8>() {
                    self.error_recovery_level = v.min(self.error_recovery_level);
                }
            }
            "ImmediateData" => self.immediate_data = self.immediate_data && value == "Yes",
            "InitialR2T" => self.initial_r2t = self.initial_r2t || value == "Yes",
            _ => return false,
        }
        true
    }

    /// Declarations returned in the final login response
    pub fn response_params(&self) -> Vec<(String, String)> {
        vec![
            ("MaxConnections".into(), self.max_connections.to_string()),
            ("MaxBurstLength".into(), self.max_burst_length.to_string()),
            ("FirstBurstLength".into(), self.first_burst_length.to_string()),
            ("DefaultTime2Wait".into(), self.default_time2wait.to_string()),
            ("DefaultTime2Retain".into(), self.default_time2retain.to_string()),
            ("MaxOutstandingR2T".into(), self.max_outstanding_r2t.to_string()),
            ("DataPDUInOrder".into(), yes_no(self.data_pdu_in_order)),
            ("DataSequenceInOrder".into(), yes_no(self.data_sequence_in_order)),
            ("ErrorRecoveryLevel".into(), self.error_recovery_level.to_string()),
            ("ImmediateData".into(), yes_no(self.immediate_data)),
            ("InitialR2T".into(), yes_no(self.initial_r2t)),
        ]
    }
}

/// Lifecycle flags consulted by connection teardown
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SessionFlags {
    /// CLOSE_SESSION logout accepted
    pub logout: bool,
    /// Being torn down by session reinstatement or target shutdown
    pub reinstatement: bool,
    pub fall_back_to_erl0: bool,
    /// `stop_session` already running
    pub stop_active: bool,
    /// Picked up by a continuation login
    pub continuation: bool,
    /// `close_session` has run
    pub closed: bool,
}

pub struct Session {
    pub tsih: u16,
    pub isid: [u8; 6],
    pub session_type: SessionType,
    pub initiator_name: String,
    pub target_name: String,
    pub params: SessionParams,

    pub(crate) window: Mutex<CmdSnWindow>,
    next_ttt: AtomicU32,
    pub(crate) conns: Mutex<Vec<Arc<Connection>>>,
    pub(crate) state: Watch<SessionState>,
    flags: Mutex<SessionFlags>,
    pub(crate) recovery: Mutex<Vec<ConnectionRecovery>>,
    pub(crate) usage: UsageCount,
    pub(crate) time2retain_timer: Mutex<Option<TimerId>>,
    pub(crate) async_logout_timer: Mutex<Option<TimerId>>,
    digest_errors: AtomicU32,

    pub(crate) ctx: Arc<TargetContext>,
    registry: Weak<SessionRegistry>,
}

pub(crate) struct SessionInit {
    pub tsih: u16,
    pub isid: [u8; 6],
    pub session_type: SessionType,
    pub initiator_name: String,
    pub target_name: String,
    pub params: SessionParams,
    /// CmdSN of the leading login request
    pub cmd_sn: u32,
}

impl Session {
    pub(crate) fn new(init: SessionInit, ctx: Arc<TargetContext>, registry: Weak<SessionRegistry>) -> Arc<Self> {
        let window = CmdSnWindow::new(init.cmd_sn, ctx.config.cmdsn_depth);
        Arc::new(Session {
            tsih: init.tsih,
            isid: init.isid,
            session_type: init.session_type,
            initiator_name: init.initiator_name,
            target_name: init.target_name,
            params: init.params,
            window: Mutex::new(window),
            next_ttt: AtomicU32::new(1),
            conns: Mutex::new(Vec::new()),
            state: Watch::new(SessionState::Active),
            flags: Mutex::new(SessionFlags::default()),
            recovery: Mutex::new(Vec::new()),
            usage: UsageCount::new(),
            time2retain_timer: Mutex::new(None),
            async_logout_timer: Mutex::new(None),
            digest_errors: AtomicU32::new(0),
            ctx,
            registry,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_discovery(&self) -> bool {
        self.session_type == SessionType::Discovery
    }

    pub fn erl(&self) -> u8 {
        self.params.error_recovery_level
    }

    /// Fresh target transfer tag, never the reserved value
    pub fn next_ttt(&self) -> u32 {
        loop {
            let ttt = self.next_ttt.fetch_add(1, Ordering::SeqCst);
            if ttt != RESERVED_TAG {
                return ttt;
            }
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.conns.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn find_connection(&self, cid: u16) -> Option<Arc<Connection>> {
        self.conns.lock().iter().find(|c| c.cid == cid).cloned()
    }

    pub(crate) fn add_connection(&self, conn: Arc<Connection>) {
        self.conns.lock().push(conn);
    }

    /// Unlink `conn`; returns how many connections remain
    pub(crate) fn remove_connection(&self, conn: &Arc<Connection>) -> usize {
        let mut conns = self.conns.lock();
        conns.retain(|c| !Arc::ptr_eq(c, conn));
        conns.len()
    }

    /// (ExpCmdSN, MaxCmdSN) for an outgoing PDU
    pub fn cmd_sn_window(&self) -> (u32, u32) {
        let w = self.window.lock();
        (w.exp_cmd_sn(), w.max_cmd_sn())
    }

    pub(crate) fn increment_max_cmd_sn(&self) {
        self.window.lock().increment_max();
    }

    pub(crate) fn flags(&self) -> MutexGuard<'_, SessionFlags> {
        self.flags.lock()
    }

    pub(crate) fn record_digest_error(&self) -> u32 {
        self.digest_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn digest_errors(&self) -> u32 {
        self.digest_errors.load(Ordering::SeqCst)
    }

    pub(crate) fn registry(&self) -> Option<Arc<SessionRegistry>> {
        self.registry.upgrade()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("tsih", &self.tsih)
            .field("isid", &self.isid)
            .field("type", &self.session_type)
            .field("initiator", &self.initiator_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_default() {
        let params = SessionParams::default();
        assert_eq!(params.max_burst_length, 262144);
        assert_eq!(params.first_burst_length, 65536);
        assert_eq!(params.error_recovery_level, 0);
        assert!(params.data_pdu_in_order);
        assert!(params.data_sequence_in_order);
    }

    #[test]
    fn test_offer_uses_config_erl() {
        let config = TargetConfig {
            default_erl: 2,
            ..TargetConfig::default()
        };
        let mut params = SessionParams::offer(&config);
        assert_eq!(params.error_recovery_level, 2);
        params.apply_initiator_param("ErrorRecoveryLevel", "1");
        assert_eq!(params.error_recovery_level, 1);
        params.apply_initiator_param("MaxConnections", "2");
        assert_eq!(params.max_connections, 2);
    }

    #[test]
    fn test_numeric_negotiation() {
        let mut params = SessionParams::default();
        params.apply_initiator_param("MaxBurstLength", "131072");
        assert_eq!(params.max_burst_length, 131072);
        params.apply_initiator_param("MaxBurstLength", "999999999");
        assert_eq!(params.max_burst_length, 131072);
        params.apply_initiator_param("DefaultTime2Wait", "5");
        assert_eq!(params.default_time2wait, 5);
        params.apply_initiator_param("DefaultTime2Retain", "5");
        assert_eq!(params.default_time2retain, 5);
        params.apply_initiator_param("MaxOutstandingR2T", "0");
        assert_eq!(params.max_outstanding_r2t, 1);
    }

    #[test]
    fn test_boolean_negotiation() {
        let mut params = SessionParams::default();
        params.apply_initiator_param("ImmediateData", "No");
        assert!(!params.immediate_data);
        params.apply_initiator_param("ImmediateData", "Yes");
        assert!(!params.immediate_data);

        params.apply_initiator_param("InitialR2T", "Yes");
        assert!(params.initial_r2t);
        params.apply_initiator_param("InitialR2T", "No");
        assert!(params.initial_r2t);
    }

    #[test]
    fn test_in_order_keys_follow_target_offer() {
        // the default offer is Yes, which wins over an initiator's No
        let mut params = SessionParams::offer(&TargetConfig::default());
        params.apply_initiator_param("DataSequenceInOrder", "No");
        params.apply_initiator_param("DataPDUInOrder", "No");
        assert!(params.data_sequence_in_order);
        assert!(params.data_pdu_in_order);

        let config = TargetConfig {
            data_sequence_in_order: false,
            data_pdu_in_order: false,
            max_outstanding_r2t: 4,
            ..TargetConfig::default()
        };
        let mut params = SessionParams::offer(&config);
        params.apply_initiator_param("DataSequenceInOrder", "No");
        params.apply_initiator_param("DataPDUInOrder", "Yes");
        params.apply_initiator_param("MaxOutstandingR2T", "8");
        assert!(!params.data_sequence_in_order);
        assert!(params.data_pdu_in_order);
        assert_eq!(params.max_outstanding_r2t, 4);
    }

    #[test]
    fn test_unknown_key_not_consumed() {
        let mut params = SessionParams::default();
        assert!(!params.apply_initiator_param("HeaderDigest", "CRC32C"));
        assert!(!params.apply_initiator_param("X-com.example.Foo", "1"));
        assert_eq!(params, SessionParams::default());
    }

    #[test]
    fn test_response_params() {
        let params = SessionParams::default();
        let declared = params.response_params();
        assert!(declared.iter().any(|(k, v)| k == "ErrorRecoveryLevel" && v == "0"));
        assert!(declared.iter().any(|(k, v)| k == "InitialR2T" && v == "No"));
        assert_eq!(declared.len(), 11);
    }
}
