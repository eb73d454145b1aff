//! Minimal iSCSI initiator for testing
//!
//! A low-level client that speaks raw PDUs to a target. It tracks CmdSN,
//! ExpStatSN and MaxCmdSN for the caller but never hides what is on the
//! wire: every helper has a `send_*` half that only transmits, so tests can
//! interleave, reorder or corrupt PDUs freely.
//!
//! # Example: Basic Connection and Login
//!
//! ```no_run
//! use iscsi_target::client::IscsiClient;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = IscsiClient::connect("127.0.0.1:3260")?;
//! client.login(
//!     "iqn.2026-10.local:initiator",
//!     "iqn.2026-10.local:storage.disk1",
//! )?;
//! let data = client.read10(0, 1, 512)?;
//! assert_eq!(data.len(), 512);
//! client.logout()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Raw PDU Transmission
//!
//! ```no_run
//! use iscsi_target::client::IscsiClient;
//! use iscsi_target::pdu::IscsiPdu;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = IscsiClient::connect("127.0.0.1:3260")?;
//! let mut pdu = IscsiPdu::new();
//! pdu.opcode = 0x1c;
//! client.send_pdu(&pdu)?;
//! let reject = client.recv_pdu()?;
//! # Ok(())
//! # }
//! ```

use crate::digest::{DigestSettings, DigestType};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{
    self, flags, login_status, logout_reason, opcode, serial, IscsiPdu, RESERVED_TAG,
};
use byteorder::{BigEndian, ByteOrder};
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

/// Keys offered by [`IscsiClient::login_with`]
#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub initiator_name: String,
    /// Required for normal sessions, omitted for discovery
    pub target_name: Option<String>,
    pub discovery: bool,
    pub isid: [u8; 6],
    /// Non-zero to add a connection to an existing session
    pub tsih: u16,
    pub cid: u16,
    pub error_recovery_level: u8,
    pub immediate_data: bool,
    pub initial_r2t: bool,
    pub max_connections: u32,
    pub header_digest: bool,
    pub data_digest: bool,
    pub max_recv_data_segment_length: u32,
    /// Extra keys sent in the operational stage
    pub extra: Vec<(String, String)>,
}

impl LoginOptions {
    pub fn normal(initiator_name: &str, target_name: &str) -> Self {
        LoginOptions {
            initiator_name: initiator_name.to_string(),
            target_name: Some(target_name.to_string()),
            discovery: false,
            isid: [0x80, 0x00, 0x00, 0x00, 0x00, 0x01],
            tsih: 0,
            cid: 0,
            error_recovery_level: 0,
            immediate_data: true,
            initial_r2t: true,
            max_connections: 1,
            header_digest: false,
            data_digest: false,
            max_recv_data_segment_length: 8192,
            extra: Vec::new(),
        }
    }

    pub fn discovery(initiator_name: &str) -> Self {
        LoginOptions {
            target_name: None,
            discovery: true,
            ..LoginOptions::normal(initiator_name, "")
        }
    }
}

/// What the target answered to a login
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub status_class: u8,
    pub status_detail: u8,
    pub tsih: u16,
    /// Every key the target sent over all login responses
    pub keys: Vec<(String, String)>,
}

impl LoginResult {
    pub fn success(&self) -> bool {
        self.status_class == login_status::SUCCESS
    }

    pub fn key(&self, name: &str) -> Option<&str> {
        self.keys.iter().rev().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Data-In, R2T and status PDUs gathered for one command
#[derive(Debug, Default)]
pub struct CommandOutcome {
    pub data: Vec<u8>,
    pub data_in: Vec<IscsiPdu>,
    pub r2ts: Vec<IscsiPdu>,
    /// SCSI Response, or the final Data-In when status rode on it
    pub status: Option<IscsiPdu>,
}

impl CommandOutcome {
    /// SCSI status byte
    pub fn scsi_status(&self) -> Option<u8> {
        self.status.as_ref().map(|p| p.byte3)
    }

    pub fn stat_sn(&self) -> Option<u32> {
        self.status.as_ref().map(|p| p.stat_sn())
    }
}

/// iSCSI client for connecting to targets and sending/receiving PDUs
pub struct IscsiClient {
    stream: TcpStream,
    digests: DigestSettings,
    isid: [u8; 6],
    tsih: u16,
    cid: u16,
    cmd_sn: u32,
    exp_stat_sn: u32,
    exp_cmd_sn: u32,
    max_cmd_sn: u32,
    next_itt: u32,
    logged_in: bool,
    immediate_data: bool,
    initial_r2t: bool,
    first_burst_length: u32,
    /// Largest data segment the target accepts
    max_xmit: u32,
}

impl IscsiClient {
    /// Connect to an iSCSI target at the given address ("host:port")
    pub fn connect(addr: &str) -> IscsiResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        Ok(IscsiClient {
            stream,
            digests: DigestSettings::none(),
            isid: [0; 6],
            tsih: 0,
            cid: 0,
            cmd_sn: 1,
            exp_stat_sn: 0,
            exp_cmd_sn: 1,
            max_cmd_sn: 1,
            next_itt: 1,
            logged_in: false,
            immediate_data: false,
            initial_r2t: true,
            first_burst_length: 65536,
            max_xmit: 8192,
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> IscsiResult<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Log into a normal session with default keys, failing on any refusal
    pub fn login(&mut self, initiator_name: &str, target_name: &str) -> IscsiResult<LoginResult> {
        self.login_checked(&LoginOptions::normal(initiator_name, target_name))
    }

    /// Like [`login_with`](Self::login_with) but a refusal is an error
    pub fn login_checked(&mut self, opts: &LoginOptions) -> IscsiResult<LoginResult> {
        let result = self.login_with(opts)?;
        if !result.success() {
            return Err(IscsiError::session(format!(
                "login refused: class 0x{:02x} detail 0x{:02x}",
                result.status_class, result.status_detail
            )));
        }
        Ok(result)
    }

    /// Run the security and operational stages
    ///
    /// Returns the target's answer; a refusal is not an error here.
    pub fn login_with(&mut self, opts: &LoginOptions) -> IscsiResult<LoginResult> {
        self.isid = opts.isid;
        self.tsih = opts.tsih;
        self.cid = opts.cid;

        let mut security = vec![("InitiatorName".to_string(), opts.initiator_name.clone())];
        if opts.discovery {
            security.push(("SessionType".into(), "Discovery".into()));
        } else {
            security.push(("SessionType".into(), "Normal".into()));
            if let Some(name) = &opts.target_name {
                security.push(("TargetName".into(), name.clone()));
            }
        }
        security.push(("AuthMethod".into(), "None".into()));

        let mut all_keys = Vec::new();
        let first = self.login_step(flags::CSG_SECURITY_NEG, flags::NSG_LOGIN_OP_NEG, &security)?;
        all_keys.extend(first.keys.iter().cloned());
        if !first.success() {
            return Ok(first);
        }

        let digest = |on: bool| if on { "CRC32C,None" } else { "None" };
        let yes_no = |on: bool| if on { "Yes" } else { "No" };
        let mut operational: Vec<(String, String)> = vec![
            ("HeaderDigest".into(), digest(opts.header_digest).into()),
            ("DataDigest".into(), digest(opts.data_digest).into()),
            (
                "MaxRecvDataSegmentLength".into(),
                opts.max_recv_data_segment_length.to_string(),
            ),
        ];
        if !opts.discovery {
            operational.extend([
                ("ErrorRecoveryLevel".to_string(), opts.error_recovery_level.to_string()),
                ("ImmediateData".to_string(), yes_no(opts.immediate_data).to_string()),
                ("InitialR2T".to_string(), yes_no(opts.initial_r2t).to_string()),
                ("MaxConnections".to_string(), opts.max_connections.to_string()),
                ("DefaultTime2Wait".to_string(), "0".to_string()),
                ("DefaultTime2Retain".to_string(), "20".to_string()),
            ]);
        }
        operational.extend(opts.extra.iter().cloned());

        let second = self.login_step(flags::CSG_LOGIN_OP_NEG, flags::NSG_FULL_FEATURE, &operational)?;
        all_keys.extend(second.keys.iter().cloned());
        let result = LoginResult {
            keys: all_keys,
            ..second
        };
        if result.success() {
            self.apply_login_keys(&result);
            self.tsih = result.tsih;
            self.logged_in = true;
        }
        Ok(result)
    }

    fn login_step(&mut self, csg: u8, nsg: u8, keys: &[(String, String)]) -> IscsiResult<LoginResult> {
        let itt = self.alloc_itt();
        let mut request = IscsiPdu::login_request(
            self.isid,
            self.tsih,
            self.cid,
            self.cmd_sn,
            self.exp_stat_sn,
            csg,
            nsg,
            true,
            pdu::serialize_text_parameters(keys),
        );
        request.itt = itt;
        self.send_pdu(&request)?;

        let mut keys = Vec::new();
        loop {
            let response = self.recv_pdu()?;
            if response.opcode != opcode::LOGIN_RESPONSE {
                return Err(IscsiError::protocol(format!(
                    "expected Login Response, got {}",
                    response.opcode_name()
                )));
            }
            keys.extend(pdu::parse_text_parameters(&response.data)?);
            let status_class = response.specific[16];
            let status_detail = response.specific[17];
            let tsih = BigEndian::read_u16(&response.lun.to_be_bytes()[6..8]);
            let transit = response.flags & flags::TRANSIT != 0;
            if status_class != login_status::SUCCESS || transit {
                return Ok(LoginResult {
                    status_class,
                    status_detail,
                    tsih,
                    keys,
                });
            }
            // target stayed in the stage; answer with an empty request
            let mut again = IscsiPdu::login_request(
                self.isid,
                self.tsih,
                self.cid,
                self.cmd_sn,
                self.exp_stat_sn,
                csg,
                nsg,
                true,
                Vec::new(),
            );
            again.itt = itt;
            self.send_pdu(&again)?;
        }
    }

    fn apply_login_keys(&mut self, result: &LoginResult) {
        let on = |v: Option<&str>| v == Some("CRC32C");
        self.digests = DigestSettings {
            header: if on(result.key("HeaderDigest")) { DigestType::CRC32C } else { DigestType::None },
            data: if on(result.key("DataDigest")) { DigestType::CRC32C } else { DigestType::None },
        };
        if let Some(v) = result.key("MaxRecvDataSegmentLength").and_then(|v| v.parse().ok()) {
            self.max_xmit = v;
        }
        if let Some(v) = result.key("FirstBurstLength").and_then(|v| v.parse().ok()) {
            self.first_burst_length = v;
        }
        self.immediate_data = result.key("ImmediateData") == Some("Yes");
        self.initial_r2t = result.key("InitialR2T") != Some("No");
    }

    /// Serialise and send a PDU with the negotiated digests
    pub fn send_pdu(&mut self, pdu: &IscsiPdu) -> IscsiResult<()> {
        let bytes = pdu.encode(self.digests);
        self.send_bytes(&bytes)
    }

    /// Send bytes exactly as given
    pub fn send_bytes(&mut self, bytes: &[u8]) -> IscsiResult<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive one PDU, verifying digests and tracking the sequence numbers
    pub fn recv_pdu(&mut self) -> IscsiResult<IscsiPdu> {
        let mut reader = &self.stream;
        let pdu = IscsiPdu::read_from(&mut reader, self.digests)?;
        self.track(&pdu);
        Ok(pdu)
    }

    /// Receive PDUs until one with `itt` arrives, skipping unrelated ones
    pub fn recv_for(&mut self, itt: u32) -> IscsiResult<IscsiPdu> {
        loop {
            let pdu = self.recv_pdu()?;
            if pdu.itt == itt {
                return Ok(pdu);
            }
        }
    }

    fn track(&mut self, pdu: &IscsiPdu) {
        let consumes_stat_sn = match pdu.opcode {
            opcode::SCSI_DATA_IN => pdu.flags & flags::DATA_STATUS != 0,
            opcode::NOP_IN => pdu.itt != RESERVED_TAG,
            opcode::R2T | opcode::LOGIN_RESPONSE => false,
            _ => true,
        };
        if consumes_stat_sn {
            let next = pdu.stat_sn().wrapping_add(1);
            if serial::gt(next, self.exp_stat_sn) {
                self.exp_stat_sn = next;
            }
        } else if pdu.opcode == opcode::LOGIN_RESPONSE {
            self.exp_stat_sn = pdu.stat_sn().wrapping_add(1);
        }
        self.exp_cmd_sn = pdu.exp_cmd_sn();
        self.max_cmd_sn = pdu.max_cmd_sn();
    }

    pub fn alloc_itt(&mut self) -> u32 {
        let itt = self.next_itt;
        self.next_itt = self.next_itt.wrapping_add(1);
        if self.next_itt == RESERVED_TAG {
            self.next_itt = 1;
        }
        itt
    }

    /// Return the CmdSN for a non-immediate command and advance it
    pub fn take_cmd_sn(&mut self) -> u32 {
        let sn = self.cmd_sn;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        sn
    }

    /// Send a SCSI command; returns its ITT
    ///
    /// Write data goes as immediate data when the session negotiated
    /// ImmediateData=Yes. With InitialR2T=No the rest of the first burst
    /// follows as unsolicited Data-Out, so only what lies past
    /// FirstBurstLength waits for R2Ts.
    pub fn send_scsi_command(&mut self, cdb: &[u8], read_len: u32, write: &[u8]) -> IscsiResult<u32> {
        if cdb.len() > 16 {
            return Err(IscsiError::InvalidPdu(format!("CDB too long: {} bytes", cdb.len())));
        }
        let itt = self.alloc_itt();
        let cmd_sn = self.take_cmd_sn();
        let mut flags_byte = 0;
        let expected = if write.is_empty() {
            if read_len > 0 {
                flags_byte |= flags::READ;
            }
            read_len
        } else {
            flags_byte |= flags::WRITE;
            write.len() as u32
        };
        let first_burst = write.len().min(self.first_burst_length as usize);
        let immediate = if self.immediate_data && !write.is_empty() {
            let n = first_burst.min(self.max_xmit as usize);
            write[..n].to_vec()
        } else {
            Vec::new()
        };
        let unsolicited_from = immediate.len();
        let unsolicited_to = if self.initial_r2t { unsolicited_from } else { first_burst };
        if unsolicited_to == unsolicited_from {
            flags_byte |= flags::FINAL;
        }
        let pdu = IscsiPdu::scsi_command(0, itt, cmd_sn, self.exp_stat_sn, expected, cdb, flags_byte, immediate);
        self.send_pdu(&pdu)?;
        self.send_data_out(itt, RESERVED_TAG, write, unsolicited_from, unsolicited_to)?;
        Ok(itt)
    }

    /// Run a command to completion, answering R2Ts from `write`
    pub fn execute(&mut self, cdb: &[u8], read_len: u32, write: &[u8]) -> IscsiResult<CommandOutcome> {
        let itt = self.send_scsi_command(cdb, read_len, write)?;
        self.complete(itt, write)
    }

    /// Collect Data-In and answer R2Ts for `itt` until its status arrives
    pub fn complete(&mut self, itt: u32, write: &[u8]) -> IscsiResult<CommandOutcome> {
        let mut outcome = CommandOutcome::default();
        loop {
            let pdu = self.recv_pdu()?;
            if pdu.itt != itt {
                if pdu.opcode == opcode::REJECT {
                    return Err(IscsiError::protocol(format!("rejected, reason 0x{:02x}", pdu.byte2)));
                }
                continue;
            }
            match pdu.opcode {
                opcode::SCSI_DATA_IN => {
                    let offset = pdu.buffer_offset() as usize;
                    if outcome.data.len() < offset + pdu.data.len() {
                        outcome.data.resize(offset + pdu.data.len(), 0);
                    }
                    outcome.data[offset..offset + pdu.data.len()].copy_from_slice(&pdu.data);
                    let done = pdu.flags & flags::DATA_STATUS != 0;
                    if done {
                        outcome.status = Some(pdu.clone());
                    }
                    outcome.data_in.push(pdu);
                    if done {
                        return Ok(outcome);
                    }
                }
                opcode::R2T => {
                    self.answer_r2t(&pdu, write)?;
                    outcome.r2ts.push(pdu);
                }
                opcode::SCSI_RESPONSE => {
                    outcome.status = Some(pdu);
                    return Ok(outcome);
                }
                _ => {
                    return Err(IscsiError::protocol(format!(
                        "unexpected {} for ITT 0x{:08x}",
                        pdu.opcode_name(),
                        itt
                    )))
                }
            }
        }
    }

    /// Send the Data-Out sequence an R2T asks for
    pub fn answer_r2t(&mut self, r2t: &IscsiPdu, write: &[u8]) -> IscsiResult<()> {
        let offset = r2t.buffer_offset() as usize;
        let end = (offset + r2t.residual_count() as usize).min(write.len());
        self.send_data_out(r2t.itt, r2t.ttt(), write, offset, end)
    }

    /// Send `write[from..to]` as one Data-Out sequence
    ///
    /// `ttt` is the R2T's tag, or the reserved tag for unsolicited data.
    pub fn send_data_out(&mut self, itt: u32, ttt: u32, write: &[u8], from: usize, to: usize) -> IscsiResult<()> {
        let mut data_sn = 0;
        let mut pos = from;
        while pos < to {
            let n = (to - pos).min(self.max_xmit as usize);
            let pdu = IscsiPdu::scsi_data_out(
                0,
                itt,
                ttt,
                self.exp_stat_sn,
                data_sn,
                pos as u32,
                pos + n == to,
                write[pos..pos + n].to_vec(),
            );
            self.send_pdu(&pdu)?;
            data_sn += 1;
            pos += n;
        }
        Ok(())
    }

    /// READ(10) of `blocks` blocks at `lba`
    pub fn read10(&mut self, lba: u32, blocks: u16, block_size: u32) -> IscsiResult<Vec<u8>> {
        let len = blocks as u32 * block_size;
        let outcome = self.execute(&read10_cdb(lba, blocks), len, &[])?;
        check_good(&outcome)?;
        Ok(outcome.data)
    }

    /// WRITE(10) of whole blocks at `lba`
    pub fn write10(&mut self, lba: u32, data: &[u8], block_size: u32) -> IscsiResult<CommandOutcome> {
        let blocks = (data.len() as u32 / block_size) as u16;
        let outcome = self.execute(&write10_cdb(lba, blocks), 0, data)?;
        check_good(&outcome)?;
        Ok(outcome)
    }

    /// NOP-Out ping expecting a NOP-In echo
    pub fn ping(&mut self, data: &[u8]) -> IscsiResult<IscsiPdu> {
        let itt = self.alloc_itt();
        let cmd_sn = self.take_cmd_sn();
        let pdu = IscsiPdu::nop_out(itt, RESERVED_TAG, 0, cmd_sn, self.exp_stat_sn, false, data.to_vec());
        self.send_pdu(&pdu)?;
        self.recv_for(itt)
    }

    /// Answer a target NOP-In that wants a response
    pub fn answer_nop_in(&mut self, nop_in: &IscsiPdu) -> IscsiResult<()> {
        let pdu = IscsiPdu::nop_out(RESERVED_TAG, nop_in.ttt(), nop_in.lun, self.cmd_sn, self.exp_stat_sn, true, Vec::new());
        self.send_pdu(&pdu)
    }

    /// Send a task management request; returns the response code
    pub fn task_mgmt(&mut self, function: u8, ref_itt: u32, ref_cmd_sn: u32, exp_data_sn: u32) -> IscsiResult<u8> {
        let itt = self.alloc_itt();
        let pdu = IscsiPdu::task_mgmt_request(
            function,
            0,
            itt,
            ref_itt,
            self.cmd_sn,
            self.exp_stat_sn,
            ref_cmd_sn,
            exp_data_sn,
            true,
        );
        self.send_pdu(&pdu)?;
        let response = self.recv_for(itt)?;
        if response.opcode != opcode::TASK_MANAGEMENT_RESPONSE {
            return Err(IscsiError::protocol(format!("expected TMF response, got {}", response.opcode_name())));
        }
        Ok(response.byte2)
    }

    /// Send a Text request and collect the keys of the (final) response
    pub fn text(&mut self, keys: &[(String, String)]) -> IscsiResult<Vec<(String, String)>> {
        let itt = self.alloc_itt();
        let cmd_sn = self.take_cmd_sn();
        let pdu = IscsiPdu::text_request(
            itt,
            RESERVED_TAG,
            cmd_sn,
            self.exp_stat_sn,
            false,
            pdu::serialize_text_parameters(keys),
        );
        self.send_pdu(&pdu)?;
        let response = self.recv_for(itt)?;
        if response.opcode != opcode::TEXT_RESPONSE {
            return Err(IscsiError::protocol(format!("expected Text Response, got {}", response.opcode_name())));
        }
        pdu::parse_text_parameters(&response.data)
    }

    /// Discovery session: log in, list targets, log out
    pub fn discover(&mut self, initiator_name: &str) -> IscsiResult<Vec<(String, String)>> {
        self.login_checked(&LoginOptions::discovery(initiator_name))?;
        let targets = self.text(&[("SendTargets".to_string(), "All".to_string())])?;
        self.logout()?;
        Ok(targets)
    }

    /// Send a Logout request without waiting for the response
    pub fn send_logout(&mut self, reason: u8, cid: u16) -> IscsiResult<u32> {
        let itt = self.alloc_itt();
        let cmd_sn = self.take_cmd_sn();
        let mut pdu = IscsiPdu::logout_request(itt, reason, cid, cmd_sn, self.exp_stat_sn);
        pdu.immediate = false;
        self.send_pdu(&pdu)?;
        Ok(itt)
    }

    /// Logout with the given reason; returns the Logout Response
    pub fn logout_with(&mut self, reason: u8, cid: u16) -> IscsiResult<IscsiPdu> {
        let itt = self.send_logout(reason, cid)?;
        let response = self.recv_for(itt)?;
        if response.opcode != opcode::LOGOUT_RESPONSE {
            return Err(IscsiError::protocol(format!("expected Logout Response, got {}", response.opcode_name())));
        }
        if reason != logout_reason::REMOVE_CONNECTION_FOR_RECOVERY && (reason != logout_reason::CLOSE_CONNECTION || cid == self.cid) {
            self.logged_in = false;
        }
        Ok(response)
    }

    /// Close the whole session
    pub fn logout(&mut self) -> IscsiResult<()> {
        let response = self.logout_with(logout_reason::CLOSE_SESSION, self.cid)?;
        match response.byte2 {
            0 => Ok(()),
            code => Err(IscsiError::session(format!("logout failed with response {}", code))),
        }
    }

    /// Send a SNACK request
    pub fn snack(&mut self, snack_type: u8, itt: u32, ttt: u32, beg_run: u32, run_length: u32) -> IscsiResult<()> {
        let pdu = IscsiPdu::snack_request(snack_type, 0, itt, ttt, self.exp_stat_sn, beg_run, run_length);
        self.send_pdu(&pdu)
    }

    pub fn tsih(&self) -> u16 {
        self.tsih
    }

    pub fn isid(&self) -> [u8; 6] {
        self.isid
    }

    pub fn cmd_sn(&self) -> u32 {
        self.cmd_sn
    }

    /// Override the next CmdSN, for ordering tests
    pub fn set_cmd_sn(&mut self, cmd_sn: u32) {
        self.cmd_sn = cmd_sn;
    }

    /// Override the next ITT so connections of one session never share tags
    pub fn set_next_itt(&mut self, itt: u32) {
        self.next_itt = itt;
    }

    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn
    }

    pub fn exp_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn
    }

    pub fn max_cmd_sn(&self) -> u32 {
        self.max_cmd_sn
    }

    /// Negotiated ImmediateData and InitialR2T
    pub fn immediate_data(&self) -> (bool, bool) {
        (self.immediate_data, self.initial_r2t)
    }

    pub fn digests(&self) -> DigestSettings {
        self.digests
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }
}

fn check_good(outcome: &CommandOutcome) -> IscsiResult<()> {
    match outcome.status.as_ref() {
        Some(status) if status.opcode == opcode::SCSI_RESPONSE && status.byte2 != 0 => Err(IscsiError::Scsi(
            format!("iSCSI response 0x{:02x}", status.byte2),
        )),
        Some(status) if status.byte3 != 0 => Err(IscsiError::Scsi(format!("SCSI status 0x{:02x}", status.byte3))),
        Some(_) => Ok(()),
        None => Err(IscsiError::Scsi("no status".into())),
    }
}

pub fn read10_cdb(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x28;
    BigEndian::write_u32(&mut cdb[2..6], lba);
    BigEndian::write_u16(&mut cdb[7..9], blocks);
    cdb
}

pub fn write10_cdb(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x2A;
    BigEndian::write_u32(&mut cdb[2..6], lba);
    BigEndian::write_u16(&mut cdb[7..9], blocks);
    cdb
}
