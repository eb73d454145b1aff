//! Target node attributes and engine tunables
//!
//! Defaults and ranges follow the iSCSI node attribute conventions used by
//! Linux-style targets. Values can be set programmatically or loaded from the
//! `[target]` table of a TOML document.

use crate::error::{IscsiError, IscsiResult};
use std::time::Duration;

pub const DATAOUT_TIMEOUT_DEFAULT: u32 = 3;
pub const DATAOUT_TIMEOUT_MIN: u32 = 2;
pub const DATAOUT_TIMEOUT_MAX: u32 = 60;
pub const DATAOUT_TIMEOUT_RETRIES_DEFAULT: u32 = 5;
pub const DATAOUT_TIMEOUT_RETRIES_MIN: u32 = 1;
pub const DATAOUT_TIMEOUT_RETRIES_MAX: u32 = 15;
pub const NOPIN_TIMEOUT_DEFAULT: u32 = 15;
pub const NOPIN_TIMEOUT_MIN: u32 = 3;
pub const NOPIN_TIMEOUT_MAX: u32 = 60;
pub const NOPIN_RESPONSE_TIMEOUT_DEFAULT: u32 = 30;
pub const NOPIN_RESPONSE_TIMEOUT_MIN: u32 = 3;
pub const NOPIN_RESPONSE_TIMEOUT_MAX: u32 = 60;
pub const MAX_ERL: u8 = 2;
pub const BURST_LENGTH_MIN: u32 = 512;
pub const BURST_LENGTH_MAX: u32 = (1 << 24) - 1;
pub const MAX_OUTSTANDING_R2T_MAX: u32 = 65535;

/// Engine-wide configuration shared by every session of a target
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Seconds to wait for solicited or unsolicited Data-Out
    pub dataout_timeout: u32,
    /// Recovery R2T attempts before the connection is failed (ERL >= 1)
    pub dataout_timeout_retries: u32,
    /// Idle seconds before an unsolicited NOP-In is sent (0 disables)
    pub nopin_timeout: u32,
    /// Seconds the initiator has to answer an unsolicited NOP-In
    pub nopin_response_timeout: u32,
    /// Hand out R2T sequences in random order when DataSequenceInOrder=No
    pub random_r2t_offsets: bool,
    /// Highest ErrorRecoveryLevel the target offers during login
    pub default_erl: u8,
    /// Size of the CmdSN window granted to each session
    pub cmdsn_depth: u32,
    /// Bound on the receive thread's wait for the backend to accept immediate data
    pub backend_wait_timeout: Duration,
    /// Bound on the receive thread's wait for a logout response to be flushed
    pub logout_timeout: Duration,
    /// Seconds advertised in a "request logout" async message
    pub async_logout_timeout: u16,
    /// Authorise TARGET WARM RESET / TARGET COLD RESET task management
    pub allow_target_reset: bool,
    /// MaxRecvDataSegmentLength the target declares
    pub max_recv_data_segment_length: u32,

    // Session keys the target offers at login; the initiator's answer is
    // folded in by the RFC 3720 negotiation rules.
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub max_outstanding_r2t: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            dataout_timeout: DATAOUT_TIMEOUT_DEFAULT,
            dataout_timeout_retries: DATAOUT_TIMEOUT_RETRIES_DEFAULT,
            nopin_timeout: NOPIN_TIMEOUT_DEFAULT,
            nopin_response_timeout: NOPIN_RESPONSE_TIMEOUT_DEFAULT,
            random_r2t_offsets: false,
            default_erl: 0,
            cmdsn_depth: 64,
            backend_wait_timeout: Duration::from_secs(30),
            logout_timeout: Duration::from_secs(15),
            async_logout_timeout: 10,
            allow_target_reset: false,
            max_recv_data_segment_length: 8192,
            initial_r2t: false,
            immediate_data: true,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            max_outstanding_r2t: 1,
            max_burst_length: 262144,
            first_burst_length: 65536,
        }
    }
}

impl TargetConfig {
    /// Check every attribute against its allowed range
    pub fn validate(&self) -> IscsiResult<()> {
        check_range(
            "dataout_timeout",
            self.dataout_timeout,
            DATAOUT_TIMEOUT_MIN,
            DATAOUT_TIMEOUT_MAX,
        )?;
        check_range(
            "dataout_timeout_retries",
            self.dataout_timeout_retries,
            DATAOUT_TIMEOUT_RETRIES_MIN,
            DATAOUT_TIMEOUT_RETRIES_MAX,
        )?;
        if self.nopin_timeout != 0 {
            check_range(
                "nopin_timeout",
                self.nopin_timeout,
                NOPIN_TIMEOUT_MIN,
                NOPIN_TIMEOUT_MAX,
            )?;
        }
        check_range(
            "nopin_response_timeout",
            self.nopin_response_timeout,
            NOPIN_RESPONSE_TIMEOUT_MIN,
            NOPIN_RESPONSE_TIMEOUT_MAX,
        )?;
        if self.default_erl > MAX_ERL {
            return Err(IscsiError::config(format!(
                "default_erl {} exceeds maximum {}",
                self.default_erl, MAX_ERL
            )));
        }
        if self.cmdsn_depth == 0 {
            return Err(IscsiError::config("cmdsn_depth must be non-zero"));
        }
        if !(512..=(1 << 24) - 1).contains(&self.max_recv_data_segment_length) {
            return Err(IscsiError::config(format!(
                "max_recv_data_segment_length {} outside 512..=16777215",
                self.max_recv_data_segment_length
            )));
        }
        check_range(
            "max_outstanding_r2t",
            self.max_outstanding_r2t,
            1,
            MAX_OUTSTANDING_R2T_MAX,
        )?;
        check_range(
            "max_burst_length",
            self.max_burst_length,
            BURST_LENGTH_MIN,
            BURST_LENGTH_MAX,
        )?;
        check_range(
            "first_burst_length",
            self.first_burst_length,
            BURST_LENGTH_MIN,
            self.max_burst_length,
        )?;
        Ok(())
    }

    /// Parse the `[target]` table of a TOML document
    ///
    /// Missing keys keep their defaults; durations are given in seconds.
    pub fn from_toml_str(contents: &str) -> IscsiResult<Self> {
        let doc = contents
            .parse::<toml::Value>()
            .map_err(|e| IscsiError::config(format!("invalid TOML: {}", e)))?;
        let table = doc
            .get("target")
            .ok_or_else(|| IscsiError::config("missing [target] section"))?;

        let mut config = TargetConfig::default();

        let int = |key: &str| -> IscsiResult<Option<u32>> {
            match table.get(key) {
                None => Ok(None),
                Some(v) => v
                    .as_integer()
                    .and_then(|i| u32::try_from(i).ok())
                    .map(Some)
                    .ok_or_else(|| IscsiError::config(format!("'{}' must be a non-negative integer", key))),
            }
        };
        let flag = |key: &str| -> IscsiResult<Option<bool>> {
            match table.get(key) {
                None => Ok(None),
                Some(v) => v
                    .as_bool()
                    .map(Some)
                    .ok_or_else(|| IscsiError::config(format!("'{}' must be a boolean", key))),
            }
        };

        if let Some(v) = int("dataout_timeout")? {
            config.dataout_timeout = v;
        }
        if let Some(v) = int("dataout_timeout_retries")? {
            config.dataout_timeout_retries = v;
        }
        if let Some(v) = int("nopin_timeout")? {
            config.nopin_timeout = v;
        }
        if let Some(v) = int("nopin_response_timeout")? {
            config.nopin_response_timeout = v;
        }
        if let Some(v) = flag("random_r2t_offsets")? {
            config.random_r2t_offsets = v;
        }
        if let Some(v) = int("default_erl")? {
            config.default_erl = u8::try_from(v)
                .map_err(|_| IscsiError::config("default_erl out of range"))?;
        }
        if let Some(v) = int("cmdsn_depth")? {
            config.cmdsn_depth = v;
        }
        if let Some(v) = int("backend_wait_timeout")? {
            config.backend_wait_timeout = Duration::from_secs(v as u64);
        }
        if let Some(v) = int("logout_timeout")? {
            config.logout_timeout = Duration::from_secs(v as u64);
        }
        if let Some(v) = int("async_logout_timeout")? {
            config.async_logout_timeout = u16::try_from(v)
                .map_err(|_| IscsiError::config("async_logout_timeout out of range"))?;
        }
        if let Some(v) = flag("allow_target_reset")? {
            config.allow_target_reset = v;
        }
        if let Some(v) = int("max_recv_data_segment_length")? {
            config.max_recv_data_segment_length = v;
        }
        if let Some(v) = flag("initial_r2t")? {
            config.initial_r2t = v;
        }
        if let Some(v) = flag("immediate_data")? {
            config.immediate_data = v;
        }
        if let Some(v) = flag("data_pdu_in_order")? {
            config.data_pdu_in_order = v;
        }
        if let Some(v) = flag("data_sequence_in_order")? {
            config.data_sequence_in_order = v;
        }
        if let Some(v) = int("max_outstanding_r2t")? {
            config.max_outstanding_r2t = v;
        }
        if let Some(v) = int("max_burst_length")? {
            config.max_burst_length = v;
        }
        if let Some(v) = int("first_burst_length")? {
            config.first_burst_length = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub(crate) fn dataout_timeout(&self) -> Duration {
        Duration::from_secs(self.dataout_timeout as u64)
    }

    pub(crate) fn nopin_timeout(&self) -> Option<Duration> {
        match self.nopin_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    pub(crate) fn nopin_response_timeout(&self) -> Duration {
        Duration::from_secs(self.nopin_response_timeout as u64)
    }
}

fn check_range(name: &str, value: u32, min: u32, max: u32) -> IscsiResult<()> {
    if value < min || value > max {
        return Err(IscsiError::config(format!(
            "{} {} outside allowed range {}..={}",
            name, value, min, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TargetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dataout_timeout, 3);
        assert_eq!(config.nopin_timeout, 15);
        assert_eq!(config.default_erl, 0);
    }

    #[test]
    fn test_nopin_zero_disables() {
        let config = TargetConfig {
            nopin_timeout: 0,
            ..TargetConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.nopin_timeout().is_none());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let config = TargetConfig {
            dataout_timeout: 1,
            ..TargetConfig::default()
        };
        assert!(matches!(config.validate(), Err(IscsiError::Config(_))));

        let config = TargetConfig {
            default_erl: 3,
            ..TargetConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TargetConfig {
            max_outstanding_r2t: 0,
            ..TargetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_first_burst_bounded_by_max_burst() {
        let config = TargetConfig {
            max_burst_length: 8192,
            first_burst_length: 16384,
            ..TargetConfig::default()
        };
        assert!(matches!(config.validate(), Err(IscsiError::Config(_))));

        let config = TargetConfig {
            first_burst_length: 8192,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_offer_from_toml() {
        let config = TargetConfig::from_toml_str(
            r#"
            [target]
            data_sequence_in_order = false
            data_pdu_in_order = false
            initial_r2t = true
            max_outstanding_r2t = 4
            max_burst_length = 16384
            first_burst_length = 4096
            "#,
        )
        .unwrap();
        assert!(!config.data_sequence_in_order);
        assert!(!config.data_pdu_in_order);
        assert!(config.initial_r2t);
        assert!(config.immediate_data);
        assert_eq!(config.max_outstanding_r2t, 4);
        assert_eq!(config.max_burst_length, 16384);
        assert_eq!(config.first_burst_length, 4096);

        assert!(TargetConfig::from_toml_str("[target]\nfirst_burst_length = 100").is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = TargetConfig::from_toml_str(
            r#"
            [target]
            dataout_timeout = 10
            nopin_timeout = 0
            default_erl = 2
            backend_wait_timeout = 5
            allow_target_reset = true
            "#,
        )
        .unwrap();
        assert_eq!(config.dataout_timeout, 10);
        assert_eq!(config.nopin_timeout, 0);
        assert_eq!(config.default_erl, 2);
        assert_eq!(config.backend_wait_timeout, Duration::from_secs(5));
        assert!(config.allow_target_reset);
        assert_eq!(config.dataout_timeout_retries, 5);
    }

    #[test]
    fn test_from_toml_errors() {
        assert!(TargetConfig::from_toml_str("[other]\nx = 1").is_err());
        assert!(TargetConfig::from_toml_str("[target]\ndefault_erl = 7").is_err());
        assert!(TargetConfig::from_toml_str("[target]\nnopin_timeout = \"x\"").is_err());
    }
}
