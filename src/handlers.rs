//! Full-feature phase request handlers
//!
//! Each handler is called by the receive thread with the PDU's header
//! already read. The handler reads the data segment itself, validates the
//! request, builds a [`Command`] and runs it through CmdSN ordering.
//! Protocol violations become Reject PDUs; the handler waits until the
//! transmit thread has flushed the Reject before returning.

use crate::backend::{CompletionHandle, LunError, ReadyHandle, ScsiTask, TaskError, TmrCompletionHandle, TmrTask};
use crate::command::{CmdHandle, CmdKind, CmdState, Command, DataDirection, LogoutInfo, Residual, TmrInfo};
use crate::connection::{ConnState, Connection};
use crate::dataout::{build_r2ts_for_cmd, build_sequence_list, check_post_dataout, check_pre_dataout, DataOutResult};
use crate::error::{IscsiError, IscsiResult};
use crate::lifecycle;
use crate::pdu::{
    logout_reason, logout_response, parse_text_parameters, reject_reason, tmf_function, tmf_response, IscsiPdu,
    BHS_SIZE, RESERVED_TAG,
};
use crate::recovery;
use crate::scsi::{scsi_status, SenseData};
use crate::sequencing::{check_received_cmdsn, CmdSnResult};
use crate::sgl::ScatterList;
use crate::sync::WaitOutcome;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

/// What the receive loop does after a handler returns
///
/// Errors that must fail the connection are returned as `Err` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxOutcome {
    Continue,
    /// A Reject was sent and the connection stays up
    Rejected,
    /// A logout that removes this connection was accepted
    LogoutPending,
}

// ---- rejects ----

fn wait_reject_flushed(conn: &Arc<Connection>, cmd: &CmdHandle, reason: u8, fail: bool) -> IscsiResult<RxOutcome> {
    conn.queues.push_response(Arc::clone(cmd), CmdState::SendReject);
    if cmd.reject_done.wait_cancellable(None, &conn.cancel) != WaitOutcome::Completed {
        return Err(IscsiError::ConnectionClosed);
    }
    if fail {
        Err(IscsiError::Rejected { reason })
    } else {
        Ok(RxOutcome::Rejected)
    }
}

/// Queue a Reject for `header` and wait for it to reach the wire
pub(crate) fn add_reject(
    conn: &Arc<Connection>,
    reason: u8,
    header: &[u8; BHS_SIZE],
    fail: bool,
) -> IscsiResult<RxOutcome> {
    debug!("CID {}: rejecting opcode 0x{:02x} with reason 0x{:02x}", conn.cid, header[0] & 0x3f, reason);
    let cmd = Command::new(CmdKind::Reject, conn);
    cmd.lock().make_reject(reason, header, fail);
    conn.add_cmd(Arc::clone(&cmd));
    wait_reject_flushed(conn, &cmd, reason, fail)
}

/// Turn an already allocated command into a Reject
///
/// Backend resources held by the command are released first. `add_to_conn`
/// is false when the command is already on the connection's list.
pub(crate) fn add_reject_from_cmd(
    conn: &Arc<Connection>,
    cmd: &CmdHandle,
    reason: u8,
    fail: bool,
    header: &[u8; BHS_SIZE],
    add_to_conn: bool,
) -> IscsiResult<RxOutcome> {
    let (itt, backend_owned) = {
        let mut c = cmd.lock();
        lifecycle::stop_dataout_timer(&conn.session.ctx.timers, &mut c);
        let owned = std::mem::take(&mut c.backend_owned);
        c.buffer = None;
        c.make_reject(reason, header, fail);
        (c.itt, owned)
    };
    if backend_owned {
        conn.session.ctx.backend.release_task(itt);
    }
    debug!("CID {}: rejecting ITT 0x{:08x} with reason 0x{:02x}", conn.cid, itt, reason);
    if add_to_conn {
        conn.add_cmd(Arc::clone(cmd));
    }
    wait_reject_flushed(conn, cmd, reason, fail)
}

/// CmdSN check shared by every non-immediate request
///
/// Duplicates are retired here; a CmdSN past MaxCmdSN fails the connection.
fn sequence_cmd(
    conn: &Arc<Connection>,
    cmd: &CmdHandle,
    cmd_sn: u32,
    header: &[u8; BHS_SIZE],
) -> IscsiResult<CmdSnResult> {
    let result = check_received_cmdsn(conn, cmd, cmd_sn)?;
    match result {
        CmdSnResult::LowerThanExpected => {
            {
                let mut c = cmd.lock();
                c.state = CmdState::Remove;
                // a duplicate never held a window slot
                c.maxcmdsn_incremented = true;
            }
            conn.queues.push_immediate(Arc::clone(cmd), CmdState::Remove);
        }
        CmdSnResult::CannotRecover => {
            add_reject_from_cmd(conn, cmd, reject_reason::PROTOCOL_ERROR, true, header, false)?;
        }
        _ => {}
    }
    Ok(result)
}

// ---- execution ----

/// Act on a command whose CmdSN has come up (or that is immediate)
///
/// Runs with the session's window lock held for ordered commands, so it
/// only queues work and never blocks.
pub(crate) fn execute_cmd(cmd: &CmdHandle, ooo: bool) -> IscsiResult<()> {
    let Some(conn) = cmd.connection() else {
        debug!("ITT 0x{:08x} has no connection left, skipping execution", cmd.itt());
        return Ok(());
    };
    let kind = {
        let mut c = cmd.lock();
        if ooo {
            c.ooo_cmdsn = false;
        }
        if c.aborted {
            c.state = CmdState::Remove;
            drop(c);
            conn.queues.push_immediate(Arc::clone(cmd), CmdState::Remove);
            return Ok(());
        }
        c.kind
    };
    match kind {
        CmdKind::Scsi => execute_scsi(&conn, cmd),
        CmdKind::NopOut => {
            cmd.lock().state = CmdState::SendNopIn;
            conn.queues.push_response(Arc::clone(cmd), CmdState::SendNopIn);
        }
        CmdKind::TaskMgmt => execute_tmr(&conn, cmd),
        CmdKind::Text => {
            cmd.lock().state = CmdState::SendTextRsp;
            conn.queues.push_response(Arc::clone(cmd), CmdState::SendTextRsp);
        }
        CmdKind::Logout => execute_logout(&conn, cmd),
        other => warn!("ITT 0x{:08x}: nothing to execute for {:?}", cmd.itt(), other),
    }
    Ok(())
}

fn execute_scsi(conn: &Arc<Connection>, cmd: &CmdHandle) {
    let params = &conn.session.params;
    let mut c = cmd.lock();
    if c.send_check_condition {
        c.state = CmdState::SendStatus;
        drop(c);
        conn.queues.push_response(Arc::clone(cmd), CmdState::SendStatus);
        return;
    }
    if !c.is_write() || c.got_last_dataout {
        drop(c);
        submit_to_backend(conn, cmd);
        return;
    }
    // unsolicited data still arriving; its final PDU decides what follows
    if c.unsolicited_data || c.outstanding_r2ts > 0 || c.sent_last_r2t {
        return;
    }
    if !params.data_sequence_in_order && c.seq_list.is_empty() {
        build_sequence_list(&mut c, params, conn.session.ctx.config.random_r2t_offsets);
    }
    build_r2ts_for_cmd(&mut c, params, false);
    let n = c.take_unqueued_r2ts();
    drop(c);
    for _ in 0..n {
        conn.queues.push_immediate(Arc::clone(cmd), CmdState::SendR2t);
    }
}

/// Hand a command with all its data to the backend
pub(crate) fn submit_to_backend(conn: &Arc<Connection>, cmd: &CmdHandle) {
    let task = {
        let mut c = cmd.lock();
        if c.submitted || c.aborted {
            return;
        }
        c.submitted = true;
        c.backend_owned = true;
        ScsiTask {
            itt: c.itt,
            lun: c.lun,
            cdb: c.cdb,
            attr: c.attr,
            direction: c.direction,
            data_length: c.data_length,
            buffer: c.buffer.take().unwrap_or_else(|| ScatterList::new(0)),
        }
    };
    trace!("ITT 0x{:08x} submitted, CDB opcode 0x{:02x}", task.itt, task.cdb[0]);
    let _usage = conn.usage.hold();
    conn.session.ctx.backend.submit(task, CompletionHandle::new(Arc::clone(cmd)));
}

fn execute_tmr(conn: &Arc<Connection>, cmd: &CmdHandle) {
    let task = {
        let mut c = cmd.lock();
        let lun = c.lun;
        match c.tmr.as_ref() {
            Some(tmr) if tmr.call_backend => Some(TmrTask {
                function: tmr.function,
                lun,
                ref_itt: tmr.ref_itt,
            }),
            _ => {
                c.state = CmdState::SendTaskMgtRsp;
                None
            }
        }
    };
    let Some(task) = task else {
        conn.queues.push_response(Arc::clone(cmd), CmdState::SendTaskMgtRsp);
        return;
    };
    let cmd_sn = cmd.lock().cmd_sn;
    abort_tasks(conn, &task, cmd_sn);
    conn.session.ctx.backend.submit_tmr(task, TmrCompletionHandle::new(Arc::clone(cmd)));
}

/// Mark the SCSI tasks a task management function covers as aborted
///
/// Tasks not yet submitted are retired at once; submitted ones are dropped
/// when the backend completes them.
fn abort_tasks(conn: &Arc<Connection>, task: &TmrTask, tmr_cmd_sn: u32) {
    let sess = &conn.session;
    let mut retire = Vec::new();
    for owner in sess.connections() {
        for cmd in owner.commands() {
            let mut c = cmd.lock();
            if c.kind != CmdKind::Scsi || c.aborted || c.state == CmdState::SentStatus {
                continue;
            }
            let covered = match task.function {
                tmf_function::ABORT_TASK => Arc::ptr_eq(&owner, conn) && c.itt == task.ref_itt,
                tmf_function::ABORT_TASK_SET => {
                    c.lun == task.lun && crate::pdu::serial::lt(c.cmd_sn, tmr_cmd_sn)
                }
                tmf_function::CLEAR_TASK_SET | tmf_function::LOGICAL_UNIT_RESET => c.lun == task.lun,
                tmf_function::TARGET_WARM_RESET | tmf_function::TARGET_COLD_RESET => true,
                _ => false,
            };
            if !covered {
                continue;
            }
            c.aborted = true;
            debug!("ITT 0x{:08x} aborted by TMF function {}", c.itt, task.function);
            if !c.submitted {
                lifecycle::stop_dataout_timer(&sess.ctx.timers, &mut c);
                c.state = CmdState::Remove;
                retire.push((Arc::clone(&owner), Arc::clone(&cmd)));
            }
        }
    }
    for (owner, cmd) in retire {
        owner.queues.push_immediate(cmd, CmdState::Remove);
    }
}

fn execute_logout(conn: &Arc<Connection>, cmd: &CmdHandle) {
    let sess = &conn.session;
    let Some(info) = cmd.lock().logout else {
        return;
    };
    let response = match info.reason {
        logout_reason::CLOSE_SESSION => {
            sess.flags().logout = true;
            conn.flags().logout_remove = true;
            for other in sess.connections() {
                if other.state() == ConnState::LoggedIn {
                    other.set_state(ConnState::InLogout);
                }
            }
            conn.set_state(ConnState::InLogout);
            logout_response::SUCCESS
        }
        logout_reason::CLOSE_CONNECTION => {
            if info.cid == conn.cid {
                conn.flags().logout_remove = true;
                conn.set_state(ConnState::InLogout);
                logout_response::SUCCESS
            } else if sess.find_connection(info.cid).is_some() {
                logout_response::SUCCESS
            } else {
                logout_response::CID_NOT_FOUND
            }
        }
        logout_reason::REMOVE_CONNECTION_FOR_RECOVERY => {
            if sess.erl() != 2 {
                logout_response::CONNECTION_RECOVERY_NOT_SUPPORTED
            } else if info.cid == conn.cid {
                logout_response::CLEANUP_FAILED
            } else if sess.find_connection(info.cid).is_some() || recovery::has_record(sess, info.cid) {
                logout_response::SUCCESS
            } else {
                logout_response::CID_NOT_FOUND
            }
        }
        other => {
            warn!("CID {}: unknown logout reason {}", conn.cid, other);
            logout_response::CLEANUP_FAILED
        }
    };
    info!(
        "TSIH {} CID {}: logout reason {} for CID {} -> response {}",
        sess.tsih, conn.cid, info.reason, info.cid, response
    );
    {
        let mut c = cmd.lock();
        if let Some(l) = c.logout.as_mut() {
            l.response = response;
        }
        c.state = CmdState::SendLogoutRsp;
    }
    conn.queues.push_response(Arc::clone(cmd), CmdState::SendLogoutRsp);
}

// ---- data segment helpers ----

/// Read a small data segment, applying the digest policy
///
/// Returns `None` when the payload failed its digest at ERL > 0 and the
/// PDU is to be dropped.
fn read_small_payload(conn: &Arc<Connection>, len: u32, what: &str) -> IscsiResult<Option<Vec<u8>>> {
    if len == 0 {
        return Ok(Some(Vec::new()));
    }
    let payload = conn.recv_payload(len as usize)?;
    if payload.digest_ok {
        return Ok(Some(payload.data));
    }
    let sess = &conn.session;
    let errors = sess.record_digest_error();
    if sess.erl() == 0 {
        return Err(IscsiError::protocol(format!(
            "data digest error on {} at ErrorRecoveryLevel 0",
            what
        )));
    }
    warn!(
        "CID {}: dropping {} after data digest error ({} so far)",
        conn.cid, what, errors
    );
    Ok(None)
}

// ---- SCSI Command ----

pub(crate) fn handle_scsi_cmd(conn: &Arc<Connection>, pdu: &IscsiPdu) -> IscsiResult<RxOutcome> {
    let mut hdr = pdu.parse_scsi_command()?;
    let header = pdu.bhs_bytes();
    let sess = &conn.session;
    let params = &sess.params;
    let ctx = &sess.ctx;

    if !hdr.final_flag && !hdr.write {
        warn!("ITT 0x{:08x}: F bit clear on a command without write data", hdr.itt);
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if (hdr.read || hdr.write) && hdr.expected_data_length == 0 {
        // RESERVE(6) / RELEASE(6) sent with a direction bit by some initiators
        if hdr.cdb[0] == 0x16 || hdr.cdb[0] == 0x17 {
            hdr.read = false;
            hdr.write = false;
        } else {
            warn!("ITT 0x{:08x}: direction bit set with zero transfer length", hdr.itt);
            return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
        }
    }
    if !hdr.read && !hdr.write && hdr.expected_data_length != 0 {
        warn!(
            "ITT 0x{:08x}: transfer length {} without a direction",
            hdr.itt, hdr.expected_data_length
        );
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if hdr.read && hdr.write {
        warn!("ITT 0x{:08x}: bidirectional commands are not supported", hdr.itt);
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if hdr.immediate {
        warn!("ITT 0x{:08x}: immediate bit set on a SCSI command", hdr.itt);
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if hdr.payload_length > 0 && !params.immediate_data {
        warn!("ITT 0x{:08x}: immediate data with ImmediateData=No", hdr.itt);
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true);
    }
    if hdr.payload_length > 0 && !hdr.write {
        warn!("ITT 0x{:08x}: immediate data on a command without write data", hdr.itt);
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if hdr.write && !hdr.final_flag && params.initial_r2t {
        warn!("ITT 0x{:08x}: unsolicited data announced with InitialR2T=Yes", hdr.itt);
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if hdr.write && !hdr.final_flag && hdr.payload_length > 0 && hdr.payload_length == hdr.expected_data_length {
        warn!("ITT 0x{:08x}: F bit clear with all data immediate", hdr.itt);
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if hdr.payload_length > hdr.expected_data_length {
        warn!(
            "ITT 0x{:08x}: {} bytes of immediate data exceed transfer length {}",
            hdr.itt, hdr.payload_length, hdr.expected_data_length
        );
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if hdr.payload_length > conn.params.max_recv_data_segment_length {
        warn!(
            "ITT 0x{:08x}: data segment {} exceeds MaxRecvDataSegmentLength {}",
            hdr.itt, hdr.payload_length, conn.params.max_recv_data_segment_length
        );
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }
    if hdr.payload_length > params.first_burst_length {
        warn!(
            "ITT 0x{:08x}: immediate data {} exceeds FirstBurstLength {}",
            hdr.itt, hdr.payload_length, params.first_burst_length
        );
        return add_reject(conn, reject_reason::INVALID_PDU_FIELD, &header, true);
    }

    let direction = if hdr.write {
        DataDirection::Write
    } else if hdr.read {
        DataDirection::Read
    } else {
        DataDirection::None
    };
    let Some(buffer) = ctx.backend.allocate_command(hdr.expected_data_length, direction, hdr.attr) else {
        warn!("ITT 0x{:08x}: backend could not allocate {} bytes", hdr.itt, hdr.expected_data_length);
        return add_reject(conn, reject_reason::OUT_OF_RESOURCES, &header, true);
    };

    let cmd = Command::new(CmdKind::Scsi, conn);
    {
        let mut c = cmd.lock();
        c.itt = hdr.itt;
        c.cmd_sn = hdr.cmd_sn;
        c.exp_stat_sn = hdr.exp_stat_sn;
        c.lun = hdr.lun;
        c.cdb = hdr.cdb;
        c.attr = hdr.attr;
        c.direction = direction;
        c.data_length = hdr.expected_data_length;
        c.immediate_data = hdr.payload_length > 0;
        c.unsolicited_data = hdr.write && !hdr.final_flag;
        c.first_burst_len = hdr.payload_length;
        c.buffer = Some(buffer);
        if c.is_read() {
            // DataACK SNACKs name the command by this tag
            c.ttt = sess.next_ttt();
        }
    }
    trace!(
        "CID {}: SCSI command ITT 0x{:08x} CmdSN 0x{:08x} opcode 0x{:02x} EDTL {}",
        conn.cid,
        hdr.itt,
        hdr.cmd_sn,
        hdr.cdb[0],
        hdr.expected_data_length
    );

    let check_condition = match ctx.backend.lookup_lun(hdr.lun, &hdr.cdb) {
        Err(LunError::OutOfResources) => {
            return add_reject_from_cmd(conn, &cmd, reject_reason::OUT_OF_RESOURCES, true, &header, true);
        }
        Err(LunError::NonExistentLun) => Some(SenseData::lun_not_supported()),
        Ok(()) => match ctx.backend.allocate_tasks(hdr.lun, &hdr.cdb) {
            Err(TaskError::OutOfMemory) => {
                return add_reject_from_cmd(conn, &cmd, reject_reason::OUT_OF_RESOURCES, true, &header, true);
            }
            Err(TaskError::UnsupportedOpcode) => Some(SenseData::invalid_opcode()),
            Ok(()) => None,
        },
    };
    if let Some(sense) = check_condition {
        debug!("ITT 0x{:08x}: answering with CHECK CONDITION", hdr.itt);
        fail_with_sense(&cmd, sense);
    }
    conn.add_cmd(Arc::clone(&cmd));

    if hdr.payload_length == 0 {
        let result = sequence_cmd(conn, &cmd, hdr.cmd_sn, &header)?;
        conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);
        if result != CmdSnResult::LowerThanExpected && hdr.write && !hdr.final_flag && !check_condition_set(&cmd) {
            lifecycle::start_dataout_timer(conn, &cmd);
        }
        return Ok(RxOutcome::Continue);
    }

    handle_immediate_data(conn, &cmd, &hdr, &header)
}

fn check_condition_set(cmd: &CmdHandle) -> bool {
    cmd.lock().send_check_condition
}

fn fail_with_sense(cmd: &CmdHandle, sense: SenseData) {
    let mut c = cmd.lock();
    c.send_check_condition = true;
    c.backend_failed = true;
    c.scsi_status = scsi_status::CHECK_CONDITION;
    c.sense = Some(sense.to_bytes());
    c.residual = match c.direction {
        DataDirection::None => Residual::None,
        _ => Residual::between(c.data_length, 0),
    };
    c.completed = true;
}

fn handle_immediate_data(
    conn: &Arc<Connection>,
    cmd: &CmdHandle,
    hdr: &crate::pdu::ScsiCommandPdu,
    header: &[u8; BHS_SIZE],
) -> IscsiResult<RxOutcome> {
    let sess = &conn.session;
    let len = hdr.payload_length;

    if !check_condition_set(cmd) {
        sess.ctx.backend.handle_cdb(hdr.itt, hdr.lun, ReadyHandle::new(Arc::clone(cmd)));
        match cmd
            .buffer_ready
            .wait_cancellable(Some(sess.ctx.config.backend_wait_timeout), &conn.cancel)
        {
            WaitOutcome::Completed => {}
            WaitOutcome::Cancelled => return Err(IscsiError::ConnectionClosed),
            WaitOutcome::TimedOut => {
                error!(
                    "ITT 0x{:08x}: backend not ready for immediate data after {:?}",
                    hdr.itt, sess.ctx.config.backend_wait_timeout
                );
                fail_with_sense(cmd, SenseData::internal_failure());
            }
        }
    }

    if check_condition_set(cmd) {
        conn.dump_payload(len as usize)?;
        sequence_cmd(conn, cmd, hdr.cmd_sn, header)?;
        conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);
        return Ok(RxOutcome::Continue);
    }

    let taken = cmd.lock().buffer.take();
    let Some(mut buffer) = taken else {
        return Err(IscsiError::protocol("immediate data for a command without a buffer"));
    };
    let received = conn.recv_into(&mut buffer, 0, len as usize);
    cmd.lock().buffer = Some(buffer);
    if !received? {
        let errors = sess.record_digest_error();
        if sess.erl() == 0 {
            error!("ITT 0x{:08x}: immediate data digest error at ERL 0", hdr.itt);
            return add_reject_from_cmd(conn, cmd, reject_reason::DATA_DIGEST_ERROR, true, header, false);
        }
        warn!(
            "ITT 0x{:08x}: dropping command after immediate data digest error ({} so far)",
            hdr.itt, errors
        );
        {
            let mut c = cmd.lock();
            c.state = CmdState::Remove;
            c.maxcmdsn_incremented = true;
        }
        conn.queues.push_immediate(Arc::clone(cmd), CmdState::Remove);
        return Ok(RxOutcome::Continue);
    }

    let unsolicited = {
        let mut c = cmd.lock();
        c.write_data_done = len;
        if len == c.data_length {
            c.got_last_dataout = true;
            c.state = CmdState::ReceivedLastDataOut;
        }
        if c.unsolicited_data {
            c.unsolicited.start = 0;
            c.unsolicited.received = len;
            c.unsolicited.next_data_sn = 0;
            c.next_burst_len = len;
        }
        c.unsolicited_data
    };

    let result = sequence_cmd(conn, cmd, hdr.cmd_sn, header)?;
    conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);
    if unsolicited && result != CmdSnResult::LowerThanExpected {
        lifecycle::start_dataout_timer(conn, cmd);
    }
    Ok(RxOutcome::Continue)
}

// ---- SCSI Data-Out ----

pub(crate) fn handle_data_out(conn: &Arc<Connection>, pdu: &IscsiPdu) -> IscsiResult<RxOutcome> {
    let hdr = pdu.parse_scsi_data_out()?;
    let header = pdu.bhs_bytes();
    let sess = &conn.session;
    let params = &sess.params;
    let timers = &sess.ctx.timers;
    let len = hdr.payload_length;

    if len == 0 {
        warn!("ITT 0x{:08x}: Data-Out without data", hdr.itt);
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true);
    }
    if len > conn.params.max_recv_data_segment_length {
        warn!(
            "ITT 0x{:08x}: Data-Out segment {} exceeds MaxRecvDataSegmentLength {}",
            hdr.itt, len, conn.params.max_recv_data_segment_length
        );
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true);
    }

    let Some(cmd) = conn.find_cmd_by_itt(hdr.itt) else {
        debug!("Data-Out for unknown ITT 0x{:08x}, dumping payload", hdr.itt);
        conn.dump_payload(len as usize)?;
        return Ok(RxOutcome::Continue);
    };

    {
        let c = cmd.lock();
        if c.got_last_dataout || c.state == CmdState::Remove {
            debug!("ITT 0x{:08x}: Data-Out after the last one, dumping", hdr.itt);
            drop(c);
            conn.dump_payload(len as usize)?;
            return Ok(RxOutcome::Continue);
        }
        if !c.is_write() {
            warn!("ITT 0x{:08x}: Data-Out for a command without write data", hdr.itt);
            drop(c);
            return add_reject_from_cmd(conn, &cmd, reject_reason::PROTOCOL_ERROR, true, &header, false);
        }
    }
    lifecycle::mod_dataout_timer(conn, &cmd);

    let pre = {
        let mut c = cmd.lock();
        if hdr.buffer_offset.saturating_add(len) > c.data_length {
            warn!(
                "ITT 0x{:08x}: Data-Out {}+{} past transfer length {}",
                hdr.itt, hdr.buffer_offset, len, c.data_length
            );
            drop(c);
            return add_reject_from_cmd(conn, &cmd, reject_reason::INVALID_PDU_FIELD, true, &header, false);
        }
        if hdr.ttt == RESERVED_TAG {
            if params.initial_r2t {
                return Err(IscsiError::protocol(format!(
                    "ITT 0x{:08x}: unsolicited data with InitialR2T=Yes",
                    hdr.itt
                )));
            }
            if c.backend_failed || c.aborted {
                if hdr.final_flag {
                    lifecycle::stop_dataout_timer(timers, &mut c);
                }
                drop(c);
                conn.dump_payload(len as usize)?;
                return Ok(RxOutcome::Continue);
            }
        } else if c.aborted {
            if hdr.final_flag {
                c.outstanding_r2ts = c.outstanding_r2ts.saturating_sub(1);
                if c.outstanding_r2ts == 0 {
                    lifecycle::stop_dataout_timer(timers, &mut c);
                }
            }
            drop(c);
            conn.dump_payload(len as usize)?;
            return Ok(RxOutcome::Continue);
        }
        let pre = check_pre_dataout(&mut c, &hdr, params);
        let queued = if pre == DataOutResult::WithinCommandRecovery {
            c.take_unqueued_r2ts()
        } else {
            0
        };
        (pre, queued)
    };

    match pre {
        (DataOutResult::Normal, _) => {}
        (DataOutResult::WithinCommandRecovery, queued) => {
            conn.dump_payload(len as usize)?;
            for _ in 0..queued {
                conn.queues.push_immediate(Arc::clone(&cmd), CmdState::SendR2t);
            }
            return Ok(RxOutcome::Continue);
        }
        _ => {
            return Err(IscsiError::protocol(format!(
                "ITT 0x{:08x}: unrecoverable Data-Out sequence error",
                hdr.itt
            )));
        }
    }

    let taken = cmd.lock().buffer.take();
    let Some(mut buffer) = taken else {
        conn.dump_payload(len as usize)?;
        return Ok(RxOutcome::Continue);
    };
    let received = conn.recv_into(&mut buffer, hdr.buffer_offset as usize, len as usize);
    cmd.lock().buffer = Some(buffer);
    let digest_ok = received?;
    if !digest_ok {
        let errors = sess.record_digest_error();
        warn!(
            "ITT 0x{:08x}: Data-Out digest error at offset {} ({} so far)",
            hdr.itt, hdr.buffer_offset, errors
        );
    }

    let (post, queued, submit) = {
        let mut c = cmd.lock();
        let post = check_post_dataout(&mut c, &hdr, params, !digest_ok);
        match post {
            DataOutResult::Normal | DataOutResult::WithinCommandRecovery => {
                let queued = c.take_unqueued_r2ts();
                (post, queued, false)
            }
            DataOutResult::SendR2t => {
                if c.outstanding_r2ts == 0 {
                    lifecycle::stop_dataout_timer(timers, &mut c);
                }
                if !params.data_sequence_in_order && c.seq_list.is_empty() {
                    build_sequence_list(&mut c, params, sess.ctx.config.random_r2t_offsets);
                }
                build_r2ts_for_cmd(&mut c, params, false);
                let queued = c.take_unqueued_r2ts();
                (post, queued, false)
            }
            DataOutResult::SendToTransport => {
                lifecycle::stop_dataout_timer(timers, &mut c);
                c.got_last_dataout = true;
                c.state = CmdState::ReceivedLastDataOut;
                let submit = !c.ooo_cmdsn && !c.submitted;
                (post, 0, submit)
            }
            DataOutResult::CannotRecover => (post, 0, false),
        }
    };

    match post {
        DataOutResult::CannotRecover => {
            if !digest_ok {
                return add_reject_from_cmd(conn, &cmd, reject_reason::DATA_DIGEST_ERROR, true, &header, false);
            }
            Err(IscsiError::protocol(format!(
                "ITT 0x{:08x}: unrecoverable Data-Out error",
                hdr.itt
            )))
        }
        _ => {
            for _ in 0..queued {
                conn.queues.push_immediate(Arc::clone(&cmd), CmdState::SendR2t);
            }
            if submit {
                trace!("ITT 0x{:08x}: all write data received", hdr.itt);
                submit_to_backend(conn, &cmd);
            }
            Ok(RxOutcome::Continue)
        }
    }
}

// ---- NOP-Out ----

pub(crate) fn handle_nop_out(conn: &Arc<Connection>, pdu: &IscsiPdu) -> IscsiResult<RxOutcome> {
    let hdr = pdu.parse_nop_out()?;
    let header = pdu.bhs_bytes();

    if hdr.itt == RESERVED_TAG && !hdr.immediate {
        warn!("CID {}: NOP-Out with reserved ITT must be immediate", conn.cid);
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true);
    }
    if hdr.payload_length > conn.params.max_recv_data_segment_length {
        warn!(
            "CID {}: NOP-Out ping data {} exceeds MaxRecvDataSegmentLength",
            conn.cid, hdr.payload_length
        );
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true);
    }

    let Some(ping_data) = read_small_payload(conn, hdr.payload_length, "NOP-Out")? else {
        return Ok(RxOutcome::Continue);
    };

    if hdr.itt != RESERVED_TAG {
        let cmd = Command::new(CmdKind::NopOut, conn);
        {
            let mut c = cmd.lock();
            c.itt = hdr.itt;
            c.lun = hdr.lun;
            c.cmd_sn = hdr.cmd_sn;
            c.exp_stat_sn = hdr.exp_stat_sn;
            c.immediate_cmd = hdr.immediate;
            c.ping_data = ping_data;
        }
        conn.add_cmd(Arc::clone(&cmd));
        conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);
        if hdr.immediate {
            cmd.lock().state = CmdState::SendNopIn;
            conn.queues.push_response(cmd, CmdState::SendNopIn);
            return Ok(RxOutcome::Continue);
        }
        sequence_cmd(conn, &cmd, hdr.cmd_sn, &header)?;
        return Ok(RxOutcome::Continue);
    }

    conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);
    if hdr.ttt != RESERVED_TAG {
        let Some(nopin) = conn.find_nopin_by_ttt(hdr.ttt) else {
            return Err(IscsiError::protocol(format!(
                "NOP-Out answers unknown TTT 0x{:08x}",
                hdr.ttt
            )));
        };
        trace!("CID {}: NOP-In TTT 0x{:08x} answered", conn.cid, hdr.ttt);
        lifecycle::stop_nopin_response_timer(conn);
        nopin.lock().state = CmdState::Remove;
        conn.queues.push_immediate(nopin, CmdState::Remove);
        lifecycle::start_nopin_timer(conn);
    }
    Ok(RxOutcome::Continue)
}

// ---- Task Management ----

pub(crate) fn handle_task_mgt(conn: &Arc<Connection>, pdu: &IscsiPdu) -> IscsiResult<RxOutcome> {
    let hdr = pdu.parse_task_mgmt_request()?;
    let header = pdu.bhs_bytes();
    let sess = &conn.session;
    let function = hdr.function;

    if function == tmf_function::TASK_REASSIGN && !hdr.immediate {
        warn!("CID {}: TASK REASSIGN must be immediate", conn.cid);
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true);
    }
    let ref_itt = match function {
        tmf_function::ABORT_TASK | tmf_function::TASK_REASSIGN => hdr.ref_itt,
        _ => RESERVED_TAG,
    };

    let cmd = Command::new(CmdKind::TaskMgmt, conn);
    {
        let mut c = cmd.lock();
        c.itt = hdr.itt;
        c.lun = hdr.lun;
        c.cmd_sn = hdr.cmd_sn;
        c.exp_stat_sn = hdr.exp_stat_sn;
        c.immediate_cmd = hdr.immediate;
        c.state = CmdState::SendTaskMgtRsp;
    }

    let lun_checked = !matches!(
        function,
        tmf_function::TASK_REASSIGN | tmf_function::TARGET_WARM_RESET | tmf_function::TARGET_COLD_RESET
    );
    let mut reassign = None;
    let response = if lun_checked && sess.ctx.backend.lookup_lun(hdr.lun, &[0; 16]).is_err() {
        tmf_response::LUN_DOES_NOT_EXIST
    } else {
        match function {
            tmf_function::ABORT_TASK => match conn.find_cmd_by_itt(ref_itt) {
                Some(_) => tmf_response::FUNCTION_COMPLETE,
                None => tmf_response::TASK_DOES_NOT_EXIST,
            },
            tmf_function::ABORT_TASK_SET
            | tmf_function::CLEAR_ACA
            | tmf_function::CLEAR_TASK_SET
            | tmf_function::LOGICAL_UNIT_RESET => tmf_response::FUNCTION_COMPLETE,
            tmf_function::TARGET_WARM_RESET | tmf_function::TARGET_COLD_RESET => {
                if sess.ctx.config.allow_target_reset {
                    tmf_response::FUNCTION_COMPLETE
                } else {
                    tmf_response::AUTHORIZATION_FAILED
                }
            }
            tmf_function::TASK_REASSIGN => match recovery::check_task_reassign(conn, ref_itt, hdr.exp_data_sn) {
                recovery::ReassignCheck::Accepted(task) => {
                    reassign = Some(task);
                    tmf_response::FUNCTION_COMPLETE
                }
                recovery::ReassignCheck::Refused(response) => response,
                recovery::ReassignCheck::BadExpDataSn => {
                    return add_reject_from_cmd(conn, &cmd, reject_reason::INVALID_PDU_FIELD, true, &header, true);
                }
            },
            _ => tmf_response::FUNCTION_NOT_SUPPORTED,
        }
    };
    debug!(
        "CID {}: TMF function {} ref ITT 0x{:08x} -> response {}",
        conn.cid, function, ref_itt, response
    );
    cmd.lock().tmr = Some(TmrInfo {
        function,
        ref_itt,
        ref_cmd_sn: hdr.ref_cmd_sn,
        exp_data_sn: hdr.exp_data_sn,
        response,
        call_backend: response == tmf_response::FUNCTION_COMPLETE && function != tmf_function::TASK_REASSIGN,
        reassign,
    });
    conn.add_cmd(Arc::clone(&cmd));

    if !hdr.immediate {
        sequence_cmd(conn, &cmd, hdr.cmd_sn, &header)?;
        conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);
        return Ok(RxOutcome::Continue);
    }
    conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);
    execute_tmr(conn, &cmd);
    Ok(RxOutcome::Continue)
}

// ---- Text ----

pub(crate) fn handle_text(conn: &Arc<Connection>, pdu: &IscsiPdu) -> IscsiResult<RxOutcome> {
    let hdr = pdu.parse_text_request()?;
    let header = pdu.bhs_bytes();

    if hdr.payload_length > conn.params.max_recv_data_segment_length {
        warn!(
            "CID {}: text data {} exceeds MaxRecvDataSegmentLength",
            conn.cid, hdr.payload_length
        );
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true);
    }
    let Some(data) = read_small_payload(conn, hdr.payload_length, "Text request")? else {
        return Ok(RxOutcome::Continue);
    };
    let keys = parse_text_parameters(&data)?;
    let Some((_, value)) = keys.into_iter().find(|(k, _)| k == "SendTargets") else {
        return Err(IscsiError::protocol("Text request without SendTargets"));
    };
    if value != "All" && !value.is_empty() && !value.starts_with("iqn.") && !value.starts_with("eui.") && !value.starts_with("naa.") {
        return Err(IscsiError::protocol(format!("unsupported SendTargets={}", value)));
    }

    let cmd = Command::new(CmdKind::Text, conn);
    {
        let mut c = cmd.lock();
        c.itt = hdr.itt;
        c.cmd_sn = hdr.cmd_sn;
        c.exp_stat_sn = hdr.exp_stat_sn;
        c.immediate_cmd = hdr.immediate;
        c.text_key = Some(value);
    }
    conn.add_cmd(Arc::clone(&cmd));
    conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);

    if !hdr.immediate {
        sequence_cmd(conn, &cmd, hdr.cmd_sn, &header)?;
        return Ok(RxOutcome::Continue);
    }
    execute_cmd(&cmd, false)?;
    Ok(RxOutcome::Continue)
}

// ---- Logout ----

pub(crate) fn handle_logout(conn: &Arc<Connection>, pdu: &IscsiPdu) -> IscsiResult<RxOutcome> {
    let hdr = pdu.parse_logout_request()?;
    let header = pdu.bhs_bytes();

    if conn.state() != ConnState::LoggedIn {
        debug!("CID {}: logout request while {:?}, ignoring", conn.cid, conn.state());
        return Ok(RxOutcome::Continue);
    }

    let cmd = Command::new(CmdKind::Logout, conn);
    {
        let mut c = cmd.lock();
        c.itt = hdr.itt;
        c.cmd_sn = hdr.cmd_sn;
        c.exp_stat_sn = hdr.exp_stat_sn;
        c.immediate_cmd = hdr.immediate;
        c.logout = Some(LogoutInfo {
            reason: hdr.reason,
            cid: hdr.cid,
            response: logout_response::SUCCESS,
        });
    }
    let removes_this_conn = hdr.reason == logout_reason::CLOSE_SESSION
        || (hdr.reason == logout_reason::CLOSE_CONNECTION && hdr.cid == conn.cid);

    conn.add_cmd(Arc::clone(&cmd));
    if hdr.reason != logout_reason::REMOVE_CONNECTION_FOR_RECOVERY {
        conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);
    }

    if !hdr.immediate {
        let result = sequence_cmd(conn, &cmd, hdr.cmd_sn, &header)?;
        let accepted = matches!(result, CmdSnResult::Normal | CmdSnResult::HigherThanExpected);
        return Ok(if accepted && removes_this_conn {
            RxOutcome::LogoutPending
        } else {
            RxOutcome::Continue
        });
    }
    execute_cmd(&cmd, false)?;
    Ok(if removes_this_conn {
        RxOutcome::LogoutPending
    } else {
        RxOutcome::Continue
    })
}
