//! Per-task command records
//!
//! A [`Command`] is created for every initiator task the engine tracks and
//! for the target-originated PDUs that need queueing (Reject, unsolicited
//! NOP-In, Async Message). It is shared between the receive thread, the
//! transmit thread, backend completions and timers, so all mutable state
//! lives behind one mutex.

use crate::connection::Connection;
use crate::pdu::{BHS_SIZE, RESERVED_TAG};
use crate::sgl::ScatterList;
use crate::sync::Completion;
use crate::timer::TimerId;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};

pub type CmdHandle = Arc<Command>;

/// Where a command is in its life on the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    NewCmd,
    /// Write data is still being collected
    ReceivedLastDataOut,
    SendR2t,
    SendDataIn,
    /// Data-In retransmission requested by SNACK
    SendRecoveryDataIn,
    SendStatus,
    /// Status retransmission; reuses the StatSN already assigned
    SendStatusRecovery,
    SentStatus,
    SendReject,
    SendTaskMgtRsp,
    SendLogoutRsp,
    SendTextRsp,
    SendNopIn,
    SendNopInWantResponse,
    SentNopInWantResponse,
    SendAsyncMsg,
    /// Retire the command and release its backend resources
    Remove,
    /// Held in a connection recovery record awaiting TASK REASSIGN
    AwaitingReassign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    Scsi,
    NopOut,
    NopIn,
    TaskMgmt,
    Text,
    Logout,
    Reject,
    AsyncMsg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    #[default]
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Residual {
    #[default]
    None,
    Underflow(u32),
    Overflow(u32),
}

impl Residual {
    pub fn between(expected: u32, transferred: u32) -> Self {
        if transferred < expected {
            Residual::Underflow(expected - transferred)
        } else if transferred > expected {
            Residual::Overflow(transferred - expected)
        } else {
            Residual::None
        }
    }

    pub fn count(self) -> u32 {
        match self {
            Residual::None => 0,
            Residual::Underflow(n) | Residual::Overflow(n) => n,
        }
    }
}

/// One solicited burst
#[derive(Debug, Clone, Default)]
pub struct R2t {
    pub offset: u32,
    pub xfer_len: u32,
    pub r2t_sn: u32,
    pub ttt: u32,
    /// Handed to the transmit queue
    pub queued: bool,
    /// On the wire; TTT assigned
    pub sent: bool,
    /// All data received, or retired in favour of a recovery R2T
    pub complete: bool,
    pub recovery: bool,
    pub received: u32,
    pub next_data_sn: u32,
    /// Drop the rest of this burst and re-request it at its final PDU
    pub dump: bool,
}

/// Progress of the unsolicited burst that follows a write command
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsolicitedBurst {
    pub start: u32,
    pub received: u32,
    pub next_data_sn: u32,
    pub dump: bool,
}

/// Burst of a write when DataSequenceInOrder=No
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSequence {
    pub offset: u32,
    pub xfer_len: u32,
}

#[derive(Debug, Clone)]
pub struct RejectInfo {
    pub reason: u8,
    pub header: [u8; BHS_SIZE],
    pub fail_conn: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LogoutInfo {
    pub reason: u8,
    pub cid: u16,
    pub response: u8,
}

#[derive(Debug, Clone)]
pub struct TmrInfo {
    pub function: u8,
    pub ref_itt: u32,
    pub ref_cmd_sn: u32,
    pub exp_data_sn: u32,
    pub response: u8,
    pub call_backend: bool,
    /// Command taken over from a failed connection by TASK REASSIGN
    pub reassign: Option<CmdHandle>,
}

#[derive(Debug, Clone, Copy)]
pub struct AsyncInfo {
    pub event: u8,
    pub param1: u16,
    pub param2: u16,
    pub param3: u16,
}

/// DataSN window for a Data-In retransmission
#[derive(Debug, Clone, Copy)]
pub struct DataInRecovery {
    pub begrun: u32,
    pub run_length: u32,
}

#[derive(Debug)]
pub struct CmdInner {
    pub kind: CmdKind,
    pub state: CmdState,
    pub conn: Weak<Connection>,
    pub cid: u16,

    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub stat_sn: u32,
    pub stat_sn_assigned: bool,
    pub lun: u64,
    pub cdb: [u8; 16],
    pub attr: u8,
    pub direction: DataDirection,
    pub data_length: u32,

    pub immediate_cmd: bool,
    pub immediate_data: bool,
    pub unsolicited_data: bool,
    pub ooo_cmdsn: bool,
    pub maxcmdsn_incremented: bool,
    pub send_check_condition: bool,
    pub backend_owned: bool,
    pub backend_failed: bool,
    pub submitted: bool,
    pub completed: bool,
    pub aborted: bool,

    // write path
    pub first_burst_len: u32,
    pub next_burst_len: u32,
    pub write_data_done: u32,
    pub got_last_dataout: bool,
    pub r2t_offset: u32,
    pub r2t_sn: u32,
    pub outstanding_r2ts: u32,
    pub sent_last_r2t: bool,
    pub r2ts: Vec<R2t>,
    pub unsolicited: UnsolicitedBurst,
    pub seq_list: Vec<DataSequence>,
    pub seq_send_order: usize,
    pub dataout_timer: Option<TimerId>,
    pub dataout_retries: u32,

    // data and status
    pub buffer: Option<ScatterList>,
    pub transferred: u32,
    pub scsi_status: u8,
    pub iscsi_response: u8,
    pub sense: Option<Vec<u8>>,
    pub residual: Residual,
    pub data_sn: u32,
    pub datain_recovery: Option<DataInRecovery>,
    pub acked_data_sn: u32,

    // other opcodes
    pub ping_data: Vec<u8>,
    pub text_key: Option<String>,
    pub reject: Option<RejectInfo>,
    pub logout: Option<LogoutInfo>,
    pub tmr: Option<TmrInfo>,
    pub async_msg: Option<AsyncInfo>,
}

impl CmdInner {
    fn new(kind: CmdKind, conn: Weak<Connection>, cid: u16) -> Self {
        CmdInner {
            kind,
            state: CmdState::NewCmd,
            conn,
            cid,
            itt: RESERVED_TAG,
            ttt: RESERVED_TAG,
            cmd_sn: 0,
            exp_stat_sn: 0,
            stat_sn: 0,
            stat_sn_assigned: false,
            lun: 0,
            cdb: [0; 16],
            attr: 0,
            direction: DataDirection::None,
            data_length: 0,
            immediate_cmd: false,
            immediate_data: false,
            unsolicited_data: false,
            ooo_cmdsn: false,
            maxcmdsn_incremented: false,
            send_check_condition: false,
            backend_owned: false,
            backend_failed: false,
            submitted: false,
            completed: false,
            aborted: false,
            first_burst_len: 0,
            next_burst_len: 0,
            write_data_done: 0,
            got_last_dataout: false,
            r2t_offset: 0,
            r2t_sn: 0,
            outstanding_r2ts: 0,
            sent_last_r2t: false,
            r2ts: Vec::new(),
            unsolicited: UnsolicitedBurst::default(),
            seq_list: Vec::new(),
            seq_send_order: 0,
            dataout_timer: None,
            dataout_retries: 0,
            buffer: None,
            transferred: 0,
            scsi_status: 0,
            iscsi_response: 0,
            sense: None,
            residual: Residual::None,
            data_sn: 0,
            datain_recovery: None,
            acked_data_sn: 0,
            ping_data: Vec::new(),
            text_key: None,
            reject: None,
            logout: None,
            tmr: None,
            async_msg: None,
        }
    }

    /// Append an R2T covering `offset..offset + xfer_len`
    pub fn add_r2t(&mut self, offset: u32, xfer_len: u32, recovery: bool) {
        let r2t_sn = self.r2t_sn;
        self.r2t_sn = self.r2t_sn.wrapping_add(1);
        self.r2ts.push(R2t {
            offset,
            xfer_len,
            r2t_sn,
            ttt: RESERVED_TAG,
            recovery,
            ..R2t::default()
        });
    }

    /// R2Ts not yet handed to the transmit queue; marks them queued
    pub fn take_unqueued_r2ts(&mut self) -> usize {
        let mut n = 0;
        for r2t in self.r2ts.iter_mut().filter(|r| !r.queued && !r.complete) {
            r2t.queued = true;
            n += 1;
        }
        n
    }

    pub fn r2t_by_ttt(&self, ttt: u32) -> Option<usize> {
        self.r2ts
            .iter()
            .position(|r| r.sent && !r.complete && r.ttt == ttt)
    }

    pub fn is_write(&self) -> bool {
        self.direction == DataDirection::Write
    }

    pub fn is_read(&self) -> bool {
        self.direction == DataDirection::Read
    }

    /// Whether retiring this command should open the CmdSN window by one
    ///
    /// True at most once per command, and only for non-immediate requests
    /// that consumed a CmdSN.
    pub fn take_window_slot(&mut self) -> bool {
        let counted = matches!(
            self.kind,
            CmdKind::Scsi | CmdKind::NopOut | CmdKind::TaskMgmt | CmdKind::Text | CmdKind::Logout
        );
        if !counted || self.immediate_cmd || self.maxcmdsn_incremented {
            return false;
        }
        self.maxcmdsn_incremented = true;
        true
    }

    /// Turn this command into a Reject carrying `header`
    pub fn make_reject(&mut self, reason: u8, header: &[u8; BHS_SIZE], fail_conn: bool) {
        self.kind = CmdKind::Reject;
        self.state = CmdState::SendReject;
        self.reject = Some(RejectInfo {
            reason,
            header: *header,
            fail_conn,
        });
    }
}

#[derive(Debug)]
pub struct Command {
    inner: Mutex<CmdInner>,
    /// Signalled by the transmit thread once a Reject has been flushed
    pub(crate) reject_done: Completion,
    /// Signalled by the backend when it can accept immediate data
    pub(crate) buffer_ready: Completion,
}

impl Command {
    pub(crate) fn new(kind: CmdKind, conn: &Arc<Connection>) -> CmdHandle {
        Self::detached(kind, Arc::downgrade(conn), conn.cid)
    }

    pub(crate) fn detached(kind: CmdKind, conn: Weak<Connection>, cid: u16) -> CmdHandle {
        Arc::new(Command {
            inner: Mutex::new(CmdInner::new(kind, conn, cid)),
            reject_done: Completion::new(),
            buffer_ready: Completion::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, CmdInner> {
        self.inner.lock()
    }

    pub fn itt(&self) -> u32 {
        self.lock().itt
    }

    pub fn state(&self) -> CmdState {
        self.lock().state
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.lock().conn.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residual_between() {
        assert_eq!(Residual::between(512, 512), Residual::None);
        assert_eq!(Residual::between(512, 100), Residual::Underflow(412));
        assert_eq!(Residual::between(100, 512), Residual::Overflow(412));
        assert_eq!(Residual::Underflow(7).count(), 7);
    }

    #[test]
    fn test_r2t_bookkeeping() {
        let cmd = Command::detached(CmdKind::Scsi, Weak::new(), 1);
        let mut c = cmd.lock();
        c.add_r2t(0, 4096, false);
        c.add_r2t(4096, 4096, false);
        assert_eq!(c.r2ts[1].r2t_sn, 1);
        assert_eq!(c.take_unqueued_r2ts(), 2);
        assert_eq!(c.take_unqueued_r2ts(), 0);

        c.r2ts[0].sent = true;
        c.r2ts[0].ttt = 0x10;
        assert_eq!(c.r2t_by_ttt(0x10), Some(0));
        c.r2ts[0].complete = true;
        assert_eq!(c.r2t_by_ttt(0x10), None);
    }

    #[test]
    fn test_window_slot_taken_once() {
        let cmd = Command::detached(CmdKind::Scsi, Weak::new(), 1);
        let mut c = cmd.lock();
        assert!(c.take_window_slot());
        assert!(!c.take_window_slot());

        let imm = Command::detached(CmdKind::NopOut, Weak::new(), 1);
        let mut i = imm.lock();
        i.immediate_cmd = true;
        assert!(!i.take_window_slot());

        let reject = Command::detached(CmdKind::Reject, Weak::new(), 1);
        assert!(!reject.lock().take_window_slot());
    }

    #[test]
    fn test_make_reject() {
        let cmd = Command::detached(CmdKind::Scsi, Weak::new(), 1);
        let mut c = cmd.lock();
        c.make_reject(0x09, &[0xab; BHS_SIZE], true);
        assert_eq!(c.kind, CmdKind::Reject);
        assert_eq!(c.state, CmdState::SendReject);
        assert_eq!(c.reject.as_ref().map(|r| r.header[0]), Some(0xab));
    }
}
