//! SCSI block device trait and a small SBC command set
//!
//! The engine itself never interprets CDBs; this module backs the reference
//! [`BlockDeviceBackend`](crate::backend::BlockDeviceBackend), which runs
//! commands against any [`ScsiBlockDevice`] on its worker thread.

use crate::error::IscsiResult;
use byteorder::{BigEndian, ByteOrder};

/// Block storage behind a logical unit
///
/// Owned by a single worker thread, so implementations only need `Send`.
pub trait ScsiBlockDevice: Send {
    /// Read `blocks` blocks starting at `lba`
    fn read(&self, lba: u64, blocks: u32, block_size: u32) -> IscsiResult<Vec<u8>>;

    /// Write whole blocks starting at `lba`
    fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> IscsiResult<()>;

    /// Capacity in logical blocks
    fn capacity(&self) -> u64;

    fn block_size(&self) -> u32;

    fn flush(&mut self) -> IscsiResult<()> {
        Ok(())
    }

    fn vendor_id(&self) -> &str {
        "ISCSI"
    }

    fn product_id(&self) -> &str {
        "Virtual Disk"
    }

    fn product_rev(&self) -> &str {
        "1.0"
    }
}

/// Operation codes the reference executor understands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    SynchronizeCache10 = 0x35,
    ModeSense10 = 0x5A,
    Read16 = 0x88,
    Write16 = 0x8A,
    SynchronizeCache16 = 0x91,
    ServiceActionIn16 = 0x9E,
    ReportLuns = 0xA0,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        use ScsiOpcode::*;
        Some(match val {
            0x00 => TestUnitReady,
            0x03 => RequestSense,
            0x12 => Inquiry,
            0x1A => ModeSense6,
            0x25 => ReadCapacity10,
            0x28 => Read10,
            0x2A => Write10,
            0x35 => SynchronizeCache10,
            0x5A => ModeSense10,
            0x88 => Read16,
            0x8A => Write16,
            0x91 => SynchronizeCache16,
            0x9E => ServiceActionIn16,
            0xA0 => ReportLuns,
            _ => return None,
        })
    }
}

pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional sense codes
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const WRITE_ERROR: u8 = 0x0C;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// Fixed-format sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// 18-byte fixed format, current error
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);
        data[7] = 10;
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }

    pub fn invalid_opcode() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    pub fn invalid_field() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    }

    pub fn lun_not_supported() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0)
    }

    pub fn lba_out_of_range(lba: u64) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0).with_info(lba as u32)
    }

    pub fn read_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0)
    }

    pub fn write_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR, 0)
    }

    pub fn internal_failure() -> Self {
        SenseData::new(sense_key::HARDWARE_ERROR, asc::INTERNAL_TARGET_FAILURE, 0)
    }
}

/// Outcome of executing one CDB
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    pub status: u8,
    /// Data-In payload, already clipped to the allocation length
    pub data: Vec<u8>,
    pub sense: Option<SenseData>,
}

impl ScsiResponse {
    pub fn good(data: Vec<u8>) -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data,
            sense: None,
        }
    }

    pub fn good_no_data() -> Self {
        Self::good(Vec::new())
    }

    pub fn check_condition(sense: SenseData) -> Self {
        ScsiResponse {
            status: scsi_status::CHECK_CONDITION,
            data: Vec::new(),
            sense: Some(sense),
        }
    }
}

/// Runs CDBs against a block device
pub struct ScsiHandler;

impl ScsiHandler {
    /// Execute `cdb`; `data_out` holds the write payload, if any
    pub fn execute(cdb: &[u8], device: &mut dyn ScsiBlockDevice, data_out: &[u8]) -> ScsiResponse {
        let Some(op) = cdb.first().copied().and_then(ScsiOpcode::from_u8) else {
            return ScsiResponse::check_condition(SenseData::invalid_opcode());
        };
        if cdb.len() < cdb_length(op) {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }

        match op {
            ScsiOpcode::TestUnitReady => ScsiResponse::good_no_data(),
            ScsiOpcode::RequestSense => {
                let sense = SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE, 0);
                clipped(sense.to_bytes(), cdb[4] as usize)
            }
            ScsiOpcode::Inquiry => Self::inquiry(cdb, device),
            ScsiOpcode::ModeSense6 => clipped(vec![3, 0, 0, 0], cdb[4] as usize),
            ScsiOpcode::ModeSense10 => clipped(
                vec![0, 6, 0, 0, 0, 0, 0, 0],
                BigEndian::read_u16(&cdb[7..9]) as usize,
            ),
            ScsiOpcode::ReadCapacity10 => {
                let last = device.capacity().saturating_sub(1);
                let mut data = vec![0u8; 8];
                BigEndian::write_u32(&mut data[0..4], last.min(0xFFFF_FFFF) as u32);
                BigEndian::write_u32(&mut data[4..8], device.block_size());
                ScsiResponse::good(data)
            }
            ScsiOpcode::ServiceActionIn16 => {
                // READ CAPACITY (16) is the only service action supported
                if cdb[1] & 0x1F != 0x10 {
                    return ScsiResponse::check_condition(SenseData::invalid_field());
                }
                let mut data = vec![0u8; 32];
                BigEndian::write_u64(&mut data[0..8], device.capacity().saturating_sub(1));
                BigEndian::write_u32(&mut data[8..12], device.block_size());
                clipped(data, BigEndian::read_u32(&cdb[10..14]) as usize)
            }
            ScsiOpcode::Read10 | ScsiOpcode::Read16 => {
                let (lba, blocks) = parse_rw(cdb, op);
                Self::read(device, lba, blocks)
            }
            ScsiOpcode::Write10 | ScsiOpcode::Write16 => {
                let (lba, blocks) = parse_rw(cdb, op);
                Self::write(device, lba, blocks, data_out)
            }
            ScsiOpcode::SynchronizeCache10 | ScsiOpcode::SynchronizeCache16 => match device.flush() {
                Ok(()) => ScsiResponse::good_no_data(),
                Err(_) => ScsiResponse::check_condition(SenseData::write_error()),
            },
            ScsiOpcode::ReportLuns => {
                // LUN 0 only
                let mut data = vec![0u8; 16];
                BigEndian::write_u32(&mut data[0..4], 8);
                clipped(data, BigEndian::read_u32(&cdb[6..10]) as usize)
            }
        }
    }

    fn inquiry(cdb: &[u8], device: &dyn ScsiBlockDevice) -> ScsiResponse {
        let alloc_len = BigEndian::read_u16(&cdb[3..5]) as usize;
        if cdb[1] & 0x01 != 0 {
            return match cdb[2] {
                0x00 => clipped(vec![0x00, 0x00, 0x00, 3, 0x00, 0x80, 0x83], alloc_len),
                0x80 => {
                    let mut data = vec![0x00, 0x80, 0x00, 16];
                    data.extend_from_slice(b"ISCSI00000000001");
                    clipped(data, alloc_len)
                }
                0x83 => {
                    let mut data = vec![0x00, 0x83, 0x00, 12];
                    // binary NAA designator
                    data.extend_from_slice(&[0x01, 0x03, 0x00, 0x08]);
                    data.extend_from_slice(&[0x60, 0, 0, 0, 0, 0, 0, 0x01]);
                    clipped(data, alloc_len)
                }
                _ => ScsiResponse::check_condition(SenseData::invalid_field()),
            };
        }
        if cdb[2] != 0 {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }

        let mut data = vec![0u8; 36];
        data[2] = 0x05; // SPC-3
        data[3] = 0x12; // HiSup, response format 2
        data[4] = 31;
        data[7] = 0x02; // CmdQue
        pad_ascii(&mut data[8..16], device.vendor_id());
        pad_ascii(&mut data[16..32], device.product_id());
        pad_ascii(&mut data[32..36], device.product_rev());
        clipped(data, alloc_len)
    }

    fn read(device: &dyn ScsiBlockDevice, lba: u64, blocks: u32) -> ScsiResponse {
        if blocks == 0 {
            return ScsiResponse::good_no_data();
        }
        if lba.saturating_add(blocks as u64) > device.capacity() {
            return ScsiResponse::check_condition(SenseData::lba_out_of_range(lba));
        }
        match device.read(lba, blocks, device.block_size()) {
            Ok(data) => ScsiResponse::good(data),
            Err(e) => {
                log::warn!("read of {} blocks at LBA {} failed: {}", blocks, lba, e);
                ScsiResponse::check_condition(SenseData::read_error())
            }
        }
    }

    fn write(device: &mut dyn ScsiBlockDevice, lba: u64, blocks: u32, data: &[u8]) -> ScsiResponse {
        if blocks == 0 {
            return ScsiResponse::good_no_data();
        }
        if lba.saturating_add(blocks as u64) > device.capacity() {
            return ScsiResponse::check_condition(SenseData::lba_out_of_range(lba));
        }
        let block_size = device.block_size();
        let needed = blocks as usize * block_size as usize;
        if data.len() < needed {
            return ScsiResponse::check_condition(SenseData::invalid_field());
        }
        match device.write(lba, &data[..needed], block_size) {
            Ok(()) => ScsiResponse::good_no_data(),
            Err(e) => {
                log::warn!("write of {} blocks at LBA {} failed: {}", blocks, lba, e);
                ScsiResponse::check_condition(SenseData::write_error())
            }
        }
    }
}

/// Minimum CDB length for `op`
fn cdb_length(op: ScsiOpcode) -> usize {
    match op as u8 {
        0x00..=0x1F => 6,
        0x20..=0x5F => 10,
        0x80..=0x9F => 16,
        _ => 12,
    }
}

/// LBA and block count of a READ/WRITE (10) or (16) CDB
pub fn parse_rw(cdb: &[u8], op: ScsiOpcode) -> (u64, u32) {
    match op {
        ScsiOpcode::Read16 | ScsiOpcode::Write16 => (
            BigEndian::read_u64(&cdb[2..10]),
            BigEndian::read_u32(&cdb[10..14]),
        ),
        _ => (
            BigEndian::read_u32(&cdb[2..6]) as u64,
            BigEndian::read_u16(&cdb[7..9]) as u32,
        ),
    }
}

fn clipped(mut data: Vec<u8>, alloc_len: usize) -> ScsiResponse {
    data.truncate(alloc_len);
    ScsiResponse::good(data)
}

fn pad_ascii(field: &mut [u8], value: &str) {
    field.fill(b' ');
    for (dst, src) in field.iter_mut().zip(value.bytes()) {
        *dst = src;
    }
}
