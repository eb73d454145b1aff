//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! Target-generated PDUs share the StatSN/ExpCmdSN/MaxCmdSN layout at bytes
//! 24-35, so builders leave those fields to [`IscsiPdu::with_sequence`],
//! which the transmit loop applies once the StatSN is known.

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::digest::{self, DigestSettings, DIGEST_LEN};
use crate::error::{IscsiError, IscsiResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Reserved value for ITT and TTT fields
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// Largest value representable in the 24-bit DataSegmentLength field
pub const MAX_DATA_SEGMENT_LENGTH: u32 = 0x00FF_FFFF;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (client → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → client)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags (commonly used across PDU types)
pub mod flags {
    // Byte 0
    pub const IMMEDIATE: u8 = 0x40;
    pub const OPCODE_MASK: u8 = 0x3F;

    // Common flags
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTR_MASK: u8 = 0x07;

    // SCSI Data-In flags
    pub const DATA_ACK: u8 = 0x40;
    pub const DATA_OVERFLOW: u8 = 0x04;
    pub const DATA_UNDERFLOW: u8 = 0x02;
    pub const DATA_STATUS: u8 = 0x01;

    // SCSI Response flags
    pub const BIDI_OVERFLOW: u8 = 0x10;
    pub const BIDI_UNDERFLOW: u8 = 0x08;
    pub const RESIDUAL_OVERFLOW: u8 = 0x04;
    pub const RESIDUAL_UNDERFLOW: u8 = 0x02;

    // Task management / logout request: low 7 bits of byte 1
    pub const FUNCTION_MASK: u8 = 0x7F;

    // SNACK type: low 4 bits of byte 1
    pub const SNACK_TYPE_MASK: u8 = 0x0F;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // Login stages (CSG/NSG in bits 2-3 and 0-1)
    pub const CSG_SECURITY_NEG: u8 = 0x00;
    pub const CSG_LOGIN_OP_NEG: u8 = 0x01;
    pub const CSG_FULL_FEATURE: u8 = 0x03;
    pub const NSG_SECURITY_NEG: u8 = 0x00;
    pub const NSG_LOGIN_OP_NEG: u8 = 0x01;
    pub const NSG_FULL_FEATURE: u8 = 0x03;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;

    pub const DETAIL_NONE: u8 = 0x00;
    pub const DETAIL_AUTH_FAILED: u8 = 0x01;
    pub const DETAIL_NOT_FOUND: u8 = 0x03;
    pub const DETAIL_TOO_MANY_CONNECTIONS: u8 = 0x06;
    pub const DETAIL_MISSING_PARAMETER: u8 = 0x07;
    pub const DETAIL_SESSION_DOES_NOT_EXIST: u8 = 0x0A;
    pub const DETAIL_INVALID_DURING_LOGIN: u8 = 0x0B;
    pub const DETAIL_OUT_OF_RESOURCES: u8 = 0x02;
}

/// Reject reason codes (RFC 3720 Section 10.17.1)
pub mod reject_reason {
    pub const DATA_DIGEST_ERROR: u8 = 0x02;
    pub const SNACK_REJECT: u8 = 0x03;
    pub const PROTOCOL_ERROR: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x05;
    pub const IMMEDIATE_COMMAND_REJECT: u8 = 0x06;
    pub const TASK_IN_PROGRESS: u8 = 0x07;
    pub const INVALID_DATA_ACK: u8 = 0x08;
    pub const INVALID_PDU_FIELD: u8 = 0x09;
    pub const OUT_OF_RESOURCES: u8 = 0x0A;
    pub const NEGOTIATION_RESET: u8 = 0x0B;
    pub const WAITING_FOR_LOGOUT: u8 = 0x0C;
}

/// Task management function codes (RFC 3720 Section 10.5.1)
pub mod tmf_function {
    pub const ABORT_TASK: u8 = 1;
    pub const ABORT_TASK_SET: u8 = 2;
    pub const CLEAR_ACA: u8 = 3;
    pub const CLEAR_TASK_SET: u8 = 4;
    pub const LOGICAL_UNIT_RESET: u8 = 5;
    pub const TARGET_WARM_RESET: u8 = 6;
    pub const TARGET_COLD_RESET: u8 = 7;
    pub const TASK_REASSIGN: u8 = 8;
}

/// Task management response codes (RFC 3720 Section 10.6.1)
pub mod tmf_response {
    pub const FUNCTION_COMPLETE: u8 = 0;
    pub const TASK_DOES_NOT_EXIST: u8 = 1;
    pub const LUN_DOES_NOT_EXIST: u8 = 2;
    pub const TASK_STILL_ALLEGIANT: u8 = 3;
    pub const REASSIGN_NOT_SUPPORTED: u8 = 4;
    pub const FUNCTION_NOT_SUPPORTED: u8 = 5;
    pub const AUTHORIZATION_FAILED: u8 = 6;
    pub const FUNCTION_REJECTED: u8 = 255;
}

/// SNACK types (RFC 3720 Section 10.16)
pub mod snack_type {
    pub const DATA_R2T: u8 = 0;
    pub const STATUS: u8 = 1;
    pub const DATA_ACK: u8 = 2;
    pub const R_DATA: u8 = 3;
}

/// Async message event codes (RFC 3720 Section 10.9.1)
pub mod async_event {
    pub const SCSI_EVENT: u8 = 0;
    pub const REQUEST_LOGOUT: u8 = 1;
    pub const DROP_CONNECTION: u8 = 2;
    pub const DROP_ALL_CONNECTIONS: u8 = 3;
    pub const PARAM_NEGOTIATION: u8 = 4;
}

/// Logout reason codes
pub mod logout_reason {
    pub const CLOSE_SESSION: u8 = 0;
    pub const CLOSE_CONNECTION: u8 = 1;
    pub const REMOVE_CONNECTION_FOR_RECOVERY: u8 = 2;
}

/// Logout response codes
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

/// iSCSI response codes carried in byte 2 of a SCSI Response
pub mod iscsi_response {
    pub const COMMAND_COMPLETED: u8 = 0x00;
    pub const TARGET_FAILURE: u8 = 0x01;
}

/// Decode the 24-bit big-endian DataSegmentLength field
pub fn ntoh24(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
}

/// Encode a value into a 24-bit big-endian field
pub fn hton24(value: u32, out: &mut [u8]) {
    out[0] = ((value >> 16) & 0xFF) as u8;
    out[1] = ((value >> 8) & 0xFF) as u8;
    out[2] = (value & 0xFF) as u8;
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPdu {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 (response and status, reject reason, ...)
    pub byte2: u8,
    pub byte3: u8,
    /// Data segment length (bytes) as carried on the wire
    pub data_length: u32,
    /// Logical Unit Number (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Additional header segments (multiple of 4 bytes)
    pub ahs: Vec<u8>,
    /// Data segment (variable length)
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiPdu {
    /// Create a new empty PDU
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            byte2: 0,
            byte3: 0,
            data_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            ahs: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Decode the 48-byte BHS only; `data` stays empty and `data_length`
    /// reports how many payload bytes follow on the wire.
    pub fn parse_bhs(buf: &[u8; BHS_SIZE]) -> Self {
        let mut specific = [0u8; 28];
        specific.copy_from_slice(&buf[20..48]);
        IscsiPdu {
            opcode: buf[0] & flags::OPCODE_MASK,
            immediate: buf[0] & flags::IMMEDIATE != 0,
            flags: buf[1],
            byte2: buf[2],
            byte3: buf[3],
            data_length: ntoh24(&buf[5..8]),
            lun: BigEndian::read_u64(&buf[8..16]),
            itt: BigEndian::read_u32(&buf[16..20]),
            specific,
            ahs: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Parse a PDU from bytes
    ///
    /// The input buffer must contain at least the 48-byte BHS.
    /// If the PDU has data, the buffer must also contain the data segment.
    pub fn from_bytes(buf: &[u8]) -> IscsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);

        // Byte 0: Immediate flag (bit 6) and Opcode (bits 0-5)
        let byte0 = cursor.read_u8()?;
        let immediate = (byte0 & flags::IMMEDIATE) != 0;
        let opcode = byte0 & flags::OPCODE_MASK;

        let flags = cursor.read_u8()?;
        let byte2 = cursor.read_u8()?;
        let byte3 = cursor.read_u8()?;

        // Byte 4: Total AHS Length (4-byte units)
        let ahs_length = cursor.read_u8()?;

        // Bytes 5-7: Data Segment Length (3 bytes, big-endian)
        let data_length = cursor.read_u24::<BigEndian>()?;

        let lun = cursor.read_u64::<BigEndian>()?;
        let itt = cursor.read_u32::<BigEndian>()?;

        let mut specific = [0u8; 28];
        cursor.read_exact(&mut specific)?;

        let ahs_bytes = (ahs_length as usize) * 4;
        let padded_data_len = digest::padded(data_length as usize);
        let total_len = BHS_SIZE + ahs_bytes + padded_data_len;

        if buf.len() < total_len {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU incomplete: {} bytes, need {} (BHS={}, AHS={}, data={})",
                buf.len(),
                total_len,
                BHS_SIZE,
                ahs_bytes,
                padded_data_len
            )));
        }

        let ahs = buf[BHS_SIZE..BHS_SIZE + ahs_bytes].to_vec();
        let data_start = BHS_SIZE + ahs_bytes;
        let data = buf[data_start..data_start + data_length as usize].to_vec();

        Ok(IscsiPdu {
            opcode,
            immediate,
            flags,
            byte2,
            byte3,
            data_length,
            lun,
            itt,
            specific,
            ahs,
            data,
        })
    }

    /// Serialize the 48-byte BHS; DataSegmentLength is taken from `data`
    /// when present, otherwise from `data_length`.
    pub fn bhs_bytes(&self) -> [u8; BHS_SIZE] {
        let mut buf = [0u8; BHS_SIZE];
        buf[0] = (if self.immediate { flags::IMMEDIATE } else { 0 }) | (self.opcode & flags::OPCODE_MASK);
        buf[1] = self.flags;
        buf[2] = self.byte2;
        buf[3] = self.byte3;
        buf[4] = (self.ahs.len() / 4) as u8;
        let dlen = if self.data.is_empty() {
            self.data_length
        } else {
            self.data.len() as u32
        };
        hton24(dlen, &mut buf[5..8]);
        BigEndian::write_u64(&mut buf[8..16], self.lun);
        BigEndian::write_u32(&mut buf[16..20], self.itt);
        buf[20..48].copy_from_slice(&self.specific);
        buf
    }

    /// Serialize PDU to bytes (no digests)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode(DigestSettings::none())
    }

    /// Serialize PDU with the given digest settings
    ///
    /// Layout: BHS, AHS, header digest, data, padding, data digest. The data
    /// digest is only present when the data segment is non-empty.
    pub fn encode(&self, digests: DigestSettings) -> Vec<u8> {
        let bhs = self.bhs_bytes();
        let pad = digest::pad_len(self.data.len());
        let mut buf = Vec::with_capacity(self.total_length() + 2 * DIGEST_LEN);

        buf.extend_from_slice(&bhs);
        buf.extend_from_slice(&self.ahs);
        if digests.header.enabled() {
            let crc = digest::header_digest(&bhs, &self.ahs);
            buf.extend_from_slice(&digest::to_wire(crc));
        }
        if !self.data.is_empty() {
            buf.extend_from_slice(&self.data);
            buf.resize(buf.len() + pad, 0);
            if digests.data.enabled() {
                let crc = digest::data_digest(std::iter::once(self.data.as_slice()), pad);
                buf.extend_from_slice(&digest::to_wire(crc));
            }
        }
        buf
    }

    /// Read one complete PDU from a byte stream, verifying digests
    pub fn read_from<R: Read>(reader: &mut R, digests: DigestSettings) -> IscsiResult<Self> {
        let mut bhs = [0u8; BHS_SIZE];
        reader.read_exact(&mut bhs)?;
        let mut pdu = IscsiPdu::parse_bhs(&bhs);

        let mut ahs = vec![0u8; bhs[4] as usize * 4];
        reader.read_exact(&mut ahs)?;
        if digests.header.enabled() {
            let mut wire = [0u8; DIGEST_LEN];
            reader.read_exact(&mut wire)?;
            let received = digest::from_wire(wire);
            let computed = digest::header_digest(&bhs, &ahs);
            if received != computed {
                return Err(IscsiError::Digest {
                    kind: "header",
                    received,
                    computed,
                });
            }
        }
        pdu.ahs = ahs;

        let len = pdu.data_length as usize;
        if len > 0 {
            let mut data = vec![0u8; digest::padded(len)];
            reader.read_exact(&mut data)?;
            if digests.data.enabled() {
                let mut wire = [0u8; DIGEST_LEN];
                reader.read_exact(&mut wire)?;
                let received = digest::from_wire(wire);
                let computed = digest::data_digest(std::iter::once(data.as_slice()), 0);
                if received != computed {
                    return Err(IscsiError::Digest {
                        kind: "data",
                        received,
                        computed,
                    });
                }
            }
            data.truncate(len);
            pdu.data = data;
        }
        Ok(pdu)
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    /// Get the total PDU length including headers and padded data
    pub fn total_length(&self) -> usize {
        BHS_SIZE + self.ahs.len() + digest::padded(self.data.len())
    }

    /// Fill StatSN / ExpCmdSN / MaxCmdSN (bytes 24-35)
    pub fn with_sequence(mut self, stat_sn: u32, exp_cmd_sn: u32, max_cmd_sn: u32) -> Self {
        self.set_sequence(stat_sn, exp_cmd_sn, max_cmd_sn);
        self
    }

    pub fn set_sequence(&mut self, stat_sn: u32, exp_cmd_sn: u32, max_cmd_sn: u32) {
        BigEndian::write_u32(&mut self.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut self.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut self.specific[12..16], max_cmd_sn);
    }

    fn set_data(&mut self, data: Vec<u8>) {
        self.data_length = data.len() as u32;
        self.data = data;
    }

    fn expect_opcode(&self, expected: u8) -> IscsiResult<()> {
        if self.opcode != expected {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected {} opcode 0x{:02x}, got 0x{:02x}",
                opcode_name(expected),
                expected,
                self.opcode
            )));
        }
        Ok(())
    }

    // Field accessors shared by many PDU types

    /// Target Transfer Tag / Referenced Task Tag / CID (bytes 20-23)
    pub fn ttt(&self) -> u32 {
        BigEndian::read_u32(&self.specific[0..4])
    }

    /// StatSN for target PDUs, CmdSN for initiator PDUs (bytes 24-27)
    pub fn stat_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[4..8])
    }

    /// ExpCmdSN for target PDUs, ExpStatSN for initiator PDUs (bytes 28-31)
    pub fn exp_cmd_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[8..12])
    }

    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_cmd_sn()
    }

    /// MaxCmdSN (bytes 32-35)
    pub fn max_cmd_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[12..16])
    }

    /// DataSN / R2TSN / ExpDataSN (bytes 36-39)
    pub fn data_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[16..20])
    }

    /// Buffer offset (bytes 40-43)
    pub fn buffer_offset(&self) -> u32 {
        BigEndian::read_u32(&self.specific[20..24])
    }

    /// Residual count / desired data transfer length (bytes 44-47)
    pub fn residual_count(&self) -> u32 {
        BigEndian::read_u32(&self.specific[24..28])
    }
}

pub fn opcode_name(op: u8) -> &'static str {
    match op {
        opcode::NOP_OUT => "NOP-Out",
        opcode::SCSI_COMMAND => "SCSI Command",
        opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
        opcode::LOGIN_REQUEST => "Login Request",
        opcode::TEXT_REQUEST => "Text Request",
        opcode::SCSI_DATA_OUT => "SCSI Data-Out",
        opcode::LOGOUT_REQUEST => "Logout Request",
        opcode::SNACK_REQUEST => "SNACK Request",
        opcode::NOP_IN => "NOP-In",
        opcode::SCSI_RESPONSE => "SCSI Response",
        opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
        opcode::LOGIN_RESPONSE => "Login Response",
        opcode::TEXT_RESPONSE => "Text Response",
        opcode::SCSI_DATA_IN => "SCSI Data-In",
        opcode::LOGOUT_RESPONSE => "Logout Response",
        opcode::R2T => "Ready To Transfer",
        opcode::ASYNC_MESSAGE => "Async Message",
        opcode::REJECT => "Reject",
        _ => "Unknown",
    }
}

// ============================================================================
// Login Request/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a Login Request PDU
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: u8,
        nsg: u8,
        transit: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;

        // Flags: Transit | Continue | CSG | NSG
        pdu.flags = (if transit { flags::TRANSIT } else { 0 }) | ((csg & 0x03) << 2) | (nsg & 0x03);

        // ISID + TSIH in LUN field (bytes 8-15)
        pdu.lun = isid_tsih_to_lun(isid, tsih);

        // Bytes 20-21: CID
        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        // Bytes 24-27: CmdSN
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        // Bytes 28-31: ExpStatSN
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());

        pdu.set_data(data);
        pdu
    }

    /// Parse Login Request fields
    pub fn parse_login_request(&self) -> IscsiResult<LoginRequest> {
        self.expect_opcode(opcode::LOGIN_REQUEST)?;

        let (isid, tsih) = lun_to_isid_tsih(self.lun);

        Ok(LoginRequest {
            isid,
            tsih,
            itt: self.itt,
            cid: BigEndian::read_u16(&self.specific[0..2]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            transit: (self.flags & flags::TRANSIT) != 0,
            cont: (self.flags & flags::CONTINUE_LOGIN) != 0,
            csg: (self.flags >> 2) & 0x03,
            nsg: self.flags & 0x03,
            parameters: parse_text_parameters(&self.data)?,
        })
    }

    /// Create a Login Response PDU
    pub fn login_response(
        isid: [u8; 6],
        tsih: u16,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status_class: u8,
        status_detail: u8,
        csg: u8,
        nsg: u8,
        transit: bool,
        itt: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_RESPONSE;

        pdu.flags = (if transit { flags::TRANSIT } else { 0 }) | ((csg & 0x03) << 2) | (nsg & 0x03);
        pdu.lun = isid_tsih_to_lun(isid, tsih);
        pdu.itt = itt;
        pdu.set_sequence(stat_sn, exp_cmd_sn, max_cmd_sn);

        // Bytes 36-37: Status-Class and Status-Detail
        pdu.specific[16] = status_class;
        pdu.specific[17] = status_detail;

        pdu.set_data(data);
        pdu
    }
}

fn isid_tsih_to_lun(isid: [u8; 6], tsih: u16) -> u64 {
    let mut lun_bytes = [0u8; 8];
    lun_bytes[0..6].copy_from_slice(&isid);
    lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
    u64::from_be_bytes(lun_bytes)
}

fn lun_to_isid_tsih(lun: u64) -> ([u8; 6], u16) {
    let lun_bytes = lun.to_be_bytes();
    let mut isid = [0u8; 6];
    isid.copy_from_slice(&lun_bytes[0..6]);
    (isid, BigEndian::read_u16(&lun_bytes[6..8]))
}

/// Parsed Login Request
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub itt: u32,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub parameters: Vec<(String, String)>,
}

// ============================================================================
// SCSI Command/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a SCSI Command PDU (initiator side)
    pub fn scsi_command(
        lun: u64,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        expected_data_length: u32,
        cdb: &[u8],
        flags_byte: u8,
        immediate_data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_COMMAND;
        pdu.flags = flags_byte;
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&expected_data_length.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        let n = cdb.len().min(16);
        pdu.specific[12..12 + n].copy_from_slice(&cdb[..n]);
        pdu.set_data(immediate_data);
        pdu
    }

    /// Parse SCSI Command PDU
    pub fn parse_scsi_command(&self) -> IscsiResult<ScsiCommandPdu> {
        self.expect_opcode(opcode::SCSI_COMMAND)?;

        // CDB is in specific[12..28] (16 bytes)
        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&self.specific[12..28]);

        Ok(ScsiCommandPdu {
            lun: self.lun,
            itt: self.itt,
            immediate: self.immediate,
            read: (self.flags & flags::READ) != 0,
            write: (self.flags & flags::WRITE) != 0,
            final_flag: (self.flags & flags::FINAL) != 0,
            attr: self.flags & flags::ATTR_MASK,
            expected_data_length: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            cdb,
            payload_length: self.data_length,
        })
    }

    /// Create a SCSI Response PDU
    ///
    /// `residual_flags` carries the o/u/O/U bits; sense data is framed with
    /// its 2-byte SenseLength prefix.
    pub fn scsi_response(
        itt: u32,
        response: u8,
        status: u8,
        residual_flags: u8,
        residual_count: u32,
        exp_data_sn: u32,
        sense_data: Option<&[u8]>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_RESPONSE;
        pdu.flags = flags::FINAL | residual_flags;
        pdu.byte2 = response;
        pdu.byte3 = status;
        pdu.itt = itt;

        // Bytes 36-39: ExpDataSN
        pdu.specific[16..20].copy_from_slice(&exp_data_sn.to_be_bytes());
        // Bytes 44-47: Residual count
        pdu.specific[24..28].copy_from_slice(&residual_count.to_be_bytes());

        if let Some(sense) = sense_data {
            let mut data = Vec::with_capacity(sense.len() + 2);
            data.extend_from_slice(&(sense.len() as u16).to_be_bytes());
            data.extend_from_slice(sense);
            pdu.set_data(data);
        }

        pdu
    }

    /// Create a SCSI Data-In PDU (data from target to initiator)
    ///
    /// `flags_byte` carries F/A/O/U/S; `status` is only meaningful with S.
    pub fn scsi_data_in(
        itt: u32,
        ttt: u32,
        lun: u64,
        data_sn: u32,
        buffer_offset: u32,
        flags_byte: u8,
        status: u8,
        residual_count: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_DATA_IN;
        pdu.flags = flags_byte;
        if flags_byte & flags::DATA_STATUS != 0 {
            pdu.byte3 = status;
        }
        pdu.lun = lun;
        pdu.itt = itt;

        // Target Transfer Tag
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        // DataSN
        pdu.specific[16..20].copy_from_slice(&data_sn.to_be_bytes());
        // Buffer Offset
        pdu.specific[20..24].copy_from_slice(&buffer_offset.to_be_bytes());
        // Residual count
        pdu.specific[24..28].copy_from_slice(&residual_count.to_be_bytes());

        pdu.set_data(data);
        pdu
    }

    /// Create a SCSI Data-Out PDU (initiator side)
    pub fn scsi_data_out(
        lun: u64,
        itt: u32,
        ttt: u32,
        exp_stat_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_DATA_OUT;
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        pdu.specific[16..20].copy_from_slice(&data_sn.to_be_bytes());
        pdu.specific[20..24].copy_from_slice(&buffer_offset.to_be_bytes());
        pdu.set_data(data);
        pdu
    }

    /// Parse SCSI Data-Out PDU header (data from initiator to target)
    pub fn parse_scsi_data_out(&self) -> IscsiResult<ScsiDataOutPdu> {
        self.expect_opcode(opcode::SCSI_DATA_OUT)?;

        Ok(ScsiDataOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            data_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            final_flag: (self.flags & flags::FINAL) != 0,
            payload_length: self.data_length,
        })
    }

    /// Create an R2T PDU
    pub fn r2t(itt: u32, ttt: u32, lun: u64, r2t_sn: u32, buffer_offset: u32, desired_length: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::R2T;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[16..20].copy_from_slice(&r2t_sn.to_be_bytes());
        pdu.specific[20..24].copy_from_slice(&buffer_offset.to_be_bytes());
        pdu.specific[24..28].copy_from_slice(&desired_length.to_be_bytes());
        pdu
    }
}

/// Parsed SCSI Command
#[derive(Debug, Clone)]
pub struct ScsiCommandPdu {
    pub lun: u64,
    pub itt: u32,
    pub immediate: bool,
    pub read: bool,
    pub write: bool,
    pub final_flag: bool,
    pub attr: u8,
    pub expected_data_length: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub cdb: [u8; 16],
    /// Immediate data bytes following the header
    pub payload_length: u32,
}

/// Parsed SCSI Data-Out header
#[derive(Debug, Clone)]
pub struct ScsiDataOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub exp_stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub final_flag: bool,
    pub payload_length: u32,
}

// ============================================================================
// NOP-Out/NOP-In PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a NOP-In PDU (response to NOP-Out or target-initiated ping)
    pub fn nop_in(itt: u32, ttt: u32, lun: u64, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_IN;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.set_data(data);
        pdu
    }

    /// Create a NOP-Out PDU (initiator side)
    pub fn nop_out(itt: u32, ttt: u32, lun: u64, cmd_sn: u32, exp_stat_sn: u32, immediate: bool, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.immediate = immediate;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        pdu.set_data(data);
        pdu
    }

    /// Parse NOP-Out PDU header
    pub fn parse_nop_out(&self) -> IscsiResult<NopOutPdu> {
        self.expect_opcode(opcode::NOP_OUT)?;

        Ok(NopOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            immediate: self.immediate,
            payload_length: self.data_length,
        })
    }
}

/// Parsed NOP-Out
#[derive(Debug, Clone)]
pub struct NopOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub immediate: bool,
    pub payload_length: u32,
}

// ============================================================================
// Task Management PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a Task Management Function Request (initiator side)
    pub fn task_mgmt_request(
        function: u8,
        lun: u64,
        itt: u32,
        ref_itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        ref_cmd_sn: u32,
        exp_data_sn: u32,
        immediate: bool,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TASK_MANAGEMENT_REQUEST;
        pdu.immediate = immediate;
        pdu.flags = flags::FINAL | (function & flags::FUNCTION_MASK);
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&ref_itt.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&ref_cmd_sn.to_be_bytes());
        pdu.specific[16..20].copy_from_slice(&exp_data_sn.to_be_bytes());
        pdu
    }

    /// Parse Task Management Function Request
    pub fn parse_task_mgmt_request(&self) -> IscsiResult<TaskMgmtRequest> {
        self.expect_opcode(opcode::TASK_MANAGEMENT_REQUEST)?;

        Ok(TaskMgmtRequest {
            function: self.flags & flags::FUNCTION_MASK,
            lun: self.lun,
            itt: self.itt,
            ref_itt: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            ref_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            exp_data_sn: BigEndian::read_u32(&self.specific[16..20]),
            immediate: self.immediate,
        })
    }

    /// Create a Task Management Function Response
    pub fn task_mgmt_response(itt: u32, response: u8) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TASK_MANAGEMENT_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.byte2 = response;
        pdu.itt = itt;
        pdu
    }
}

/// Parsed Task Management Function Request
#[derive(Debug, Clone)]
pub struct TaskMgmtRequest {
    pub function: u8,
    pub lun: u64,
    pub itt: u32,
    pub ref_itt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub ref_cmd_sn: u32,
    pub exp_data_sn: u32,
    pub immediate: bool,
}

// ============================================================================
// Logout Request/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a Logout Request (initiator side)
    pub fn logout_request(itt: u32, reason: u8, cid: u16, cmd_sn: u32, exp_stat_sn: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_REQUEST;
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (reason & flags::FUNCTION_MASK);
        pdu.itt = itt;
        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        pdu
    }

    /// Parse Logout Request
    pub fn parse_logout_request(&self) -> IscsiResult<LogoutRequest> {
        self.expect_opcode(opcode::LOGOUT_REQUEST)?;

        Ok(LogoutRequest {
            itt: self.itt,
            reason: self.flags & flags::FUNCTION_MASK,
            cid: BigEndian::read_u16(&self.specific[0..2]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            immediate: self.immediate,
        })
    }

    /// Create a Logout Response PDU
    pub fn logout_response(itt: u32, response: u8, time2wait: u16, time2retain: u16) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.byte2 = response;
        pdu.itt = itt;

        // Bytes 40-41: Time2Wait
        pdu.specific[20..22].copy_from_slice(&time2wait.to_be_bytes());
        // Bytes 42-43: Time2Retain
        pdu.specific[22..24].copy_from_slice(&time2retain.to_be_bytes());

        pdu
    }
}

/// Parsed Logout Request
#[derive(Debug, Clone)]
pub struct LogoutRequest {
    pub itt: u32,
    pub reason: u8,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub immediate: bool,
}

// ============================================================================
// Text Request/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a Text Request (initiator side)
    pub fn text_request(itt: u32, ttt: u32, cmd_sn: u32, exp_stat_sn: u32, immediate: bool, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_REQUEST;
        pdu.immediate = immediate;
        pdu.flags = flags::FINAL;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        pdu.set_data(data);
        pdu
    }

    /// Parse Text Request header; parameters follow in the data segment
    pub fn parse_text_request(&self) -> IscsiResult<TextRequest> {
        self.expect_opcode(opcode::TEXT_REQUEST)?;

        Ok(TextRequest {
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            final_flag: (self.flags & flags::FINAL) != 0,
            cont: (self.flags & flags::CONTINUE) != 0,
            immediate: self.immediate,
            payload_length: self.data_length,
        })
    }

    /// Create a Text Response PDU
    pub fn text_response(itt: u32, ttt: u32, lun: u64, final_flag: bool, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_RESPONSE;
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.set_data(data);
        pdu
    }
}

/// Parsed Text Request
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub final_flag: bool,
    pub cont: bool,
    pub immediate: bool,
    pub payload_length: u32,
}

// ============================================================================
// SNACK, Reject and Async Message helpers
// ============================================================================

impl IscsiPdu {
    /// Create a SNACK Request (initiator side)
    pub fn snack_request(snack_type: u8, lun: u64, itt: u32, ttt: u32, exp_stat_sn: u32, beg_run: u32, run_length: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SNACK_REQUEST;
        pdu.flags = flags::FINAL | (snack_type & flags::SNACK_TYPE_MASK);
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        pdu.specific[20..24].copy_from_slice(&beg_run.to_be_bytes());
        pdu.specific[24..28].copy_from_slice(&run_length.to_be_bytes());
        pdu
    }

    /// Parse SNACK Request
    pub fn parse_snack_request(&self) -> IscsiResult<SnackRequest> {
        self.expect_opcode(opcode::SNACK_REQUEST)?;

        Ok(SnackRequest {
            snack_type: self.flags & flags::SNACK_TYPE_MASK,
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            beg_run: BigEndian::read_u32(&self.specific[20..24]),
            run_length: BigEndian::read_u32(&self.specific[24..28]),
        })
    }

    /// Create a Reject PDU carrying the offending header as its data segment
    pub fn reject(reason: u8, bad_header: &[u8], data_sn: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::REJECT;
        pdu.flags = flags::FINAL;
        pdu.byte2 = reason;
        pdu.itt = RESERVED_TAG;
        // Bytes 36-39: DataSN/R2TSN
        pdu.specific[16..20].copy_from_slice(&data_sn.to_be_bytes());
        pdu.set_data(bad_header.to_vec());
        pdu
    }

    /// Create an Async Message PDU
    pub fn async_message(lun: u64, event: u8, param1: u16, param2: u16, param3: u16) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::ASYNC_MESSAGE;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = RESERVED_TAG;
        // Bytes 20-23 are reserved and set to all ones alongside the ITT
        pdu.specific[0..4].copy_from_slice(&RESERVED_TAG.to_be_bytes());
        pdu.specific[16] = event;
        pdu.specific[17] = 0;
        pdu.specific[18..20].copy_from_slice(&param1.to_be_bytes());
        pdu.specific[20..22].copy_from_slice(&param2.to_be_bytes());
        pdu.specific[22..24].copy_from_slice(&param3.to_be_bytes());
        pdu
    }

    /// AsyncEvent and Parameter1..3 of an Async Message
    pub fn async_fields(&self) -> (u8, u16, u16, u16) {
        (
            self.specific[16],
            BigEndian::read_u16(&self.specific[18..20]),
            BigEndian::read_u16(&self.specific[20..22]),
            BigEndian::read_u16(&self.specific[22..24]),
        )
    }
}

/// Parsed SNACK Request
#[derive(Debug, Clone)]
pub struct SnackRequest {
    pub snack_type: u8,
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub exp_stat_sn: u32,
    pub beg_run: u32,
    pub run_length: u32,
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
pub fn parse_text_parameters(data: &[u8]) -> IscsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = String::from_utf8_lossy(chunk);
        match s.find('=') {
            Some(eq_pos) => {
                params.push((s[..eq_pos].to_string(), s[eq_pos + 1..].to_string()));
            }
            None => {
                return Err(IscsiError::protocol(format!("malformed text key '{}'", s)));
            }
        }
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

/// Serial number arithmetic (RFC 1982) used by every 32-bit sequence counter
pub mod serial {
    pub fn lt(a: u32, b: u32) -> bool {
        a != b && (b.wrapping_sub(a) as i32) > 0
    }

    pub fn gt(a: u32, b: u32) -> bool {
        lt(b, a)
    }

    pub fn le(a: u32, b: u32) -> bool {
        a == b || lt(a, b)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_bit_on_the_wire() {
        let ping = IscsiPdu::nop_out(RESERVED_TAG, 0x0000_0042, 0, 9, 4, true, Vec::new());
        let wire = ping.to_bytes();
        assert_eq!(wire.len(), BHS_SIZE);
        assert_eq!(wire[0], flags::IMMEDIATE | opcode::NOP_OUT);
        assert_eq!(wire[1], flags::FINAL);

        let back = IscsiPdu::from_bytes(&wire).unwrap();
        assert!(back.immediate);
        assert_eq!(back.itt, RESERVED_TAG);
        assert_eq!(back.ttt(), 0x42);
        assert_eq!(back.stat_sn(), 9, "CmdSN shares the StatSN slot");
    }

    #[test]
    fn test_pdu_too_short() {
        let bytes = vec![0u8; 20];
        assert!(IscsiPdu::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_hton24() {
        let mut out = [0u8; 3];
        hton24(0x0012_3456, &mut out);
        assert_eq!(out, [0x12, 0x34, 0x56]);
        assert_eq!(ntoh24(&out), 0x0012_3456);
    }

    #[test]
    fn test_data_padding() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_REQUEST;
        pdu.data = vec![1, 2, 3];

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE + 4);
        assert_eq!(&bytes[5..8], &[0, 0, 3]);
    }

    #[test]
    fn test_scsi_response_layout() {
        let sense = [0x70u8, 0, 5, 0, 0, 0, 0, 10];
        let pdu = IscsiPdu::scsi_response(
            0x1234,
            iscsi_response::COMMAND_COMPLETED,
            0x02,
            flags::RESIDUAL_UNDERFLOW,
            512,
            0,
            Some(&sense),
        )
        .with_sequence(7, 8, 9);

        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0], opcode::SCSI_RESPONSE);
        assert_eq!(bytes[1], flags::FINAL | flags::RESIDUAL_UNDERFLOW);
        assert_eq!(bytes[2], 0x00);
        assert_eq!(bytes[3], 0x02);
        assert_eq!(BigEndian::read_u32(&bytes[24..28]), 7);
        assert_eq!(BigEndian::read_u32(&bytes[28..32]), 8);
        assert_eq!(BigEndian::read_u32(&bytes[32..36]), 9);
        assert_eq!(BigEndian::read_u32(&bytes[44..48]), 512);
        // SenseLength prefix
        assert_eq!(BigEndian::read_u16(&bytes[48..50]), sense.len() as u16);
        assert_eq!(ntoh24(&bytes[5..8]), sense.len() as u32 + 2);
    }

    #[test]
    fn test_data_in_status_byte() {
        let pdu = IscsiPdu::scsi_data_in(
            0x10,
            RESERVED_TAG,
            0,
            3,
            8192,
            flags::FINAL | flags::DATA_STATUS,
            0x00,
            0,
            vec![0xAB; 100],
        );
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[1], flags::FINAL | flags::DATA_STATUS);
        assert_eq!(BigEndian::read_u32(&bytes[36..40]), 3);
        assert_eq!(BigEndian::read_u32(&bytes[40..44]), 8192);
        assert_eq!(bytes.len(), BHS_SIZE + 100);
    }

    #[test]
    fn test_data_out_fields() {
        let pdu = IscsiPdu::scsi_data_out(0, 0x42, 0x99, 5, 2, 4096, true, vec![1; 16]);
        let parsed = IscsiPdu::from_bytes(&pdu.to_bytes())
            .unwrap()
            .parse_scsi_data_out()
            .unwrap();
        assert_eq!(parsed.itt, 0x42);
        assert_eq!(parsed.ttt, 0x99);
        assert_eq!(parsed.exp_stat_sn, 5);
        assert_eq!(parsed.data_sn, 2);
        assert_eq!(parsed.buffer_offset, 4096);
        assert!(parsed.final_flag);
        assert_eq!(parsed.payload_length, 16);
    }

    #[test]
    fn test_scsi_command_fields() {
        let cdb = [0x2A, 0, 0, 0, 0, 8, 0, 0, 8, 0];
        let pdu = IscsiPdu::scsi_command(1 << 48, 7, 100, 3, 4096, &cdb, flags::FINAL | flags::WRITE, vec![]);
        let parsed = pdu.parse_scsi_command().unwrap();
        assert!(parsed.write && !parsed.read && parsed.final_flag);
        assert_eq!(parsed.expected_data_length, 4096);
        assert_eq!(parsed.cmd_sn, 100);
        assert_eq!(parsed.exp_stat_sn, 3);
        assert_eq!(&parsed.cdb[..10], &cdb);
    }

    #[test]
    fn test_logout_response_layout() {
        let pdu = IscsiPdu::logout_response(0x1234, logout_response::CID_NOT_FOUND, 2, 20);
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0], opcode::LOGOUT_RESPONSE);
        assert_eq!(bytes[2], logout_response::CID_NOT_FOUND);
        assert_eq!(BigEndian::read_u16(&bytes[40..42]), 2);
        assert_eq!(BigEndian::read_u16(&bytes[42..44]), 20);
    }

    #[test]
    fn test_reject_carries_header() {
        let bad = [0x5Au8; BHS_SIZE];
        let pdu = IscsiPdu::reject(reject_reason::PROTOCOL_ERROR, &bad, 0);
        assert_eq!(pdu.itt, RESERVED_TAG);
        assert_eq!(pdu.byte2, reject_reason::PROTOCOL_ERROR);
        assert_eq!(pdu.data.len(), BHS_SIZE);
    }

    #[test]
    fn test_async_message_fields() {
        let pdu = IscsiPdu::async_message(0, async_event::DROP_CONNECTION, 3, 2, 20);
        let parsed = IscsiPdu::from_bytes(&pdu.to_bytes()).unwrap();
        assert_eq!(parsed.itt, RESERVED_TAG);
        assert_eq!(parsed.async_fields(), (async_event::DROP_CONNECTION, 3, 2, 20));
    }

    #[test]
    fn test_encode_read_with_digests() {
        let pdu = IscsiPdu::text_response(0x77, RESERVED_TAG, 0, true, b"TargetName=iqn.x\0".to_vec())
            .with_sequence(1, 2, 3);
        let bytes = pdu.encode(DigestSettings::crc32c());
        // BHS + header digest + padded data + data digest
        assert_eq!(bytes.len(), BHS_SIZE + 4 + digest::padded(17) + 4);

        let decoded = IscsiPdu::read_from(&mut Cursor::new(&bytes), DigestSettings::crc32c()).unwrap();
        assert_eq!(decoded.itt, 0x77);
        assert_eq!(decoded.stat_sn(), 1);
        assert_eq!(decoded.exp_cmd_sn(), 2);
        assert_eq!(decoded.max_cmd_sn(), 3);
        assert_eq!(decoded.data, pdu.data);
    }

    #[test]
    fn test_read_detects_corruption() {
        let pdu = IscsiPdu::nop_in(1, RESERVED_TAG, 0, vec![9; 8]).with_sequence(1, 1, 1);
        let mut bytes = pdu.encode(DigestSettings::crc32c());
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        let err = IscsiPdu::read_from(&mut Cursor::new(&bytes), DigestSettings::crc32c()).unwrap_err();
        assert!(matches!(err, IscsiError::Digest { kind: "data", .. }));

        let mut bytes = pdu.encode(DigestSettings::crc32c());
        bytes[20] ^= 0x01;
        let err = IscsiPdu::read_from(&mut Cursor::new(&bytes), DigestSettings::crc32c()).unwrap_err();
        assert!(matches!(err, IscsiError::Digest { kind: "header", .. }));
    }

    #[test]
    fn test_text_keys_from_login_payload() {
        let keys = parse_text_parameters(b"HeaderDigest=CRC32C,None\0TargetAddress=10.0.0.1:3260,1\0").unwrap();
        assert_eq!(keys[0].1, "CRC32C,None");
        assert_eq!(keys[1], ("TargetAddress".to_string(), "10.0.0.1:3260,1".to_string()));
        assert!(parse_text_parameters(b"SendTargets\0").is_err());
    }

    #[test]
    fn test_text_keys_are_nul_terminated() {
        let keys = [("SendTargets".to_string(), "All".to_string())];
        assert_eq!(serialize_text_parameters(&keys), b"SendTargets=All\0");
    }

    #[test]
    fn test_serial_arithmetic() {
        assert!(serial::lt(1, 2));
        assert!(serial::lt(0xFFFF_FFFF, 0));
        assert!(serial::gt(0, 0xFFFF_FFF0));
        assert!(!serial::lt(5, 5));
        assert!(serial::le(5, 5));
    }

    #[test]
    fn test_opcode_names() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_COMMAND;
        assert_eq!(pdu.opcode_name(), "SCSI Command");
        pdu.opcode = 0x3E;
        assert_eq!(pdu.opcode_name(), "Unknown");
    }
}
