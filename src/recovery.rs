//! Error recovery: SNACK, connection recovery records, TASK REASSIGN and
//! asynchronous messages
//!
//! At ErrorRecoveryLevel 2 a failed connection's SCSI tasks are parked in a
//! [`ConnectionRecovery`] record on the session. The initiator moves each
//! task to a surviving (or new) connection with TASK REASSIGN, after which
//! the task resumes there: missing Data-In or status is resent, missing
//! write data is solicited again.

use crate::command::{AsyncInfo, CmdHandle, CmdKind, CmdState, Command, DataInRecovery};
use crate::connection::{ConnState, Connection};
use crate::dataout::build_r2ts_for_cmd;
use crate::error::IscsiResult;
use crate::handlers::{add_reject, submit_to_backend, RxOutcome};
use crate::lifecycle;
use crate::pdu::{async_event, reject_reason, serial, snack_type, tmf_response, IscsiPdu, BHS_SIZE};
use crate::session::Session;
use log::{debug, info, trace, warn};
use std::sync::Arc;

/// Tasks of a failed connection waiting to be reassigned
#[derive(Debug)]
pub(crate) struct ConnectionRecovery {
    pub cid: u16,
    pub cmds: Vec<CmdHandle>,
}

pub(crate) fn has_record(sess: &Session, cid: u16) -> bool {
    sess.recovery.lock().iter().any(|r| r.cid == cid)
}

/// Park the SCSI tasks of a failing connection for reassignment
///
/// Everything else is released, including tasks whose status the initiator
/// has already acknowledged and commands still waiting on CmdSN order.
pub(crate) fn prepare_cmds_for_reassign(conn: &Arc<Connection>) {
    let sess = &conn.session;
    let exp_stat_sn = conn.exp_stat_sn();
    let mut kept = Vec::new();
    for cmd in conn.take_commands() {
        let keep = {
            let mut c = cmd.lock();
            lifecycle::stop_dataout_timer(&sess.ctx.timers, &mut c);
            let acked = c.stat_sn_assigned && serial::lt(c.stat_sn, exp_stat_sn);
            let keep = c.kind == CmdKind::Scsi
                && !c.ooo_cmdsn
                && !c.immediate_cmd
                && !c.aborted
                && !acked
                && c.state != CmdState::Remove;
            if keep {
                c.state = CmdState::AwaitingReassign;
            }
            keep
        };
        if keep {
            kept.push(cmd);
        } else {
            lifecycle::release_detached(sess, &cmd);
        }
    }
    if kept.is_empty() {
        return;
    }
    info!(
        "TSIH {} CID {}: {} task(s) held for reassignment",
        sess.tsih,
        conn.cid,
        kept.len()
    );
    let mut records = sess.recovery.lock();
    match records.iter_mut().find(|r| r.cid == conn.cid) {
        Some(record) => record.cmds.extend(kept),
        None => records.push(ConnectionRecovery {
            cid: conn.cid,
            cmds: kept,
        }),
    }
}

/// Drop recovery-record tasks the initiator acknowledged up to `exp_stat_sn`
pub(crate) fn discard_acked(sess: &Session, cid: u16, exp_stat_sn: u32) {
    let released = {
        let mut records = sess.recovery.lock();
        let Some(record) = records.iter_mut().find(|r| r.cid == cid) else {
            return;
        };
        let (acked, left): (Vec<_>, Vec<_>) = std::mem::take(&mut record.cmds).into_iter().partition(|cmd| {
            let c = cmd.lock();
            c.stat_sn_assigned && serial::lt(c.stat_sn, exp_stat_sn)
        });
        record.cmds = left;
        records.retain(|r| !r.cmds.is_empty());
        acked
    };
    for cmd in &released {
        lifecycle::release_detached(sess, cmd);
    }
    if !released.is_empty() {
        debug!("CID {}: {} acknowledged task(s) pruned from recovery", cid, released.len());
    }
}

// ---- asynchronous messages ----

/// Queue an Async Message on `conn`
pub(crate) fn queue_async_message(conn: &Arc<Connection>, event: u8, param1: u16, param2: u16, param3: u16) {
    let cmd = Command::new(CmdKind::AsyncMsg, conn);
    {
        let mut c = cmd.lock();
        c.state = CmdState::SendAsyncMsg;
        c.async_msg = Some(AsyncInfo {
            event,
            param1,
            param2,
            param3,
        });
    }
    debug!("CID {}: queueing async event {}", conn.cid, event);
    conn.add_cmd(Arc::clone(&cmd));
    conn.queues.push_response(cmd, CmdState::SendAsyncMsg);
}

/// Tell the initiator, on a surviving connection, that `cid` was dropped
pub(crate) fn send_conn_drop_async(sess: &Arc<Session>, cid: u16) {
    let Some(carrier) = sess
        .connections()
        .into_iter()
        .find(|c| c.cid != cid && c.state() == ConnState::LoggedIn)
    else {
        return;
    };
    queue_async_message(
        &carrier,
        async_event::DROP_CONNECTION,
        cid,
        sess.params.default_time2wait,
        sess.params.default_time2retain,
    );
}

// ---- TASK REASSIGN ----

pub(crate) enum ReassignCheck {
    Accepted(CmdHandle),
    Refused(u8),
    /// ExpDataSN claims Data-In the target never sent
    BadExpDataSn,
}

/// Validate a TASK REASSIGN for `ref_itt` arriving on `conn`
pub(crate) fn check_task_reassign(conn: &Arc<Connection>, ref_itt: u32, exp_data_sn: u32) -> ReassignCheck {
    let sess = &conn.session;
    if sess.erl() != 2 {
        debug!("TASK REASSIGN at ERL {}, not supported", sess.erl());
        return ReassignCheck::Refused(tmf_response::REASSIGN_NOT_SUPPORTED);
    }
    let found = sess.recovery.lock()
        .iter()
        .flat_map(|r| r.cmds.iter())
        .find(|cmd| cmd.itt() == ref_itt)
        .cloned();
    let Some(cmd) = found else {
        let allegiant = sess
            .connections()
            .iter()
            .any(|c| c.find_cmd_by_itt(ref_itt).is_some());
        return ReassignCheck::Refused(if allegiant {
            tmf_response::TASK_STILL_ALLEGIANT
        } else {
            tmf_response::TASK_DOES_NOT_EXIST
        });
    };
    {
        let c = cmd.lock();
        if c.is_read() && serial::gt(exp_data_sn, c.data_sn) {
            warn!(
                "TASK REASSIGN for ITT 0x{:08x}: ExpDataSN {} beyond {} sent",
                ref_itt, exp_data_sn, c.data_sn
            );
            return ReassignCheck::BadExpDataSn;
        }
    }
    ReassignCheck::Accepted(cmd)
}

/// Resume a reassigned task on `conn` once the TMF response has gone out
pub(crate) fn complete_task_reassign(conn: &Arc<Connection>, cmd: &CmdHandle, exp_data_sn: u32) {
    let sess = &conn.session;
    {
        let mut records = sess.recovery.lock();
        for record in records.iter_mut() {
            record.cmds.retain(|c| !Arc::ptr_eq(c, cmd));
        }
        records.retain(|r| !r.cmds.is_empty());
    }

    let mut r2ts = 0;
    let next = {
        let mut c = cmd.lock();
        c.conn = Arc::downgrade(conn);
        c.cid = conn.cid;
        c.stat_sn_assigned = false;
        if c.completed {
            if c.is_read() && c.transferred > 0 {
                c.datain_recovery = Some(DataInRecovery {
                    begrun: exp_data_sn,
                    run_length: 0,
                });
                c.state = CmdState::SendRecoveryDataIn;
            } else {
                c.state = CmdState::SendStatus;
            }
            Some(c.state)
        } else if c.submitted {
            // the completion will queue on the new connection
            c.state = CmdState::NewCmd;
            None
        } else if c.is_write() && !c.got_last_dataout {
            for r in c.r2ts.iter_mut() {
                r.complete = true;
            }
            c.outstanding_r2ts = 0;
            c.sent_last_r2t = false;
            c.unsolicited_data = false;
            c.next_burst_len = 0;
            c.r2t_offset = c.write_data_done;
            c.state = CmdState::NewCmd;
            build_r2ts_for_cmd(&mut c, &sess.params, false);
            r2ts = c.take_unqueued_r2ts();
            None
        } else {
            c.state = CmdState::NewCmd;
            None
        }
    };
    conn.add_cmd(Arc::clone(cmd));
    info!(
        "ITT 0x{:08x} reassigned to CID {} ({:?})",
        cmd.itt(),
        conn.cid,
        next
    );
    match next {
        Some(state) => conn.queues.push_response(Arc::clone(cmd), state),
        None if r2ts > 0 => {
            for _ in 0..r2ts {
                conn.queues.push_immediate(Arc::clone(cmd), CmdState::SendR2t);
            }
        }
        None => {
            let ready = {
                let c = cmd.lock();
                !c.submitted && (!c.is_write() || c.got_last_dataout)
            };
            if ready {
                submit_to_backend(conn, cmd);
            }
        }
    }
}

// ---- SNACK ----

pub(crate) fn handle_snack(conn: &Arc<Connection>, pdu: &IscsiPdu) -> IscsiResult<RxOutcome> {
    let hdr = pdu.parse_snack_request()?;
    let header = pdu.bhs_bytes();
    conn.ack_from_exp_stat_sn(hdr.exp_stat_sn);

    if conn.session.erl() == 0 {
        warn!("CID {}: SNACK at ErrorRecoveryLevel 0", conn.cid);
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true);
    }
    if pdu.data_length > 0 {
        conn.dump_payload(pdu.data_length as usize)?;
    }
    match hdr.snack_type {
        snack_type::DATA_R2T => data_or_r2t_snack(conn, hdr.itt, hdr.beg_run, hdr.run_length, &header),
        snack_type::STATUS => {
            status_snack(conn, hdr.beg_run, hdr.run_length);
            Ok(RxOutcome::Continue)
        }
        snack_type::DATA_ACK => data_ack(conn, hdr.ttt, hdr.beg_run, &header),
        other => {
            warn!("CID {}: unsupported SNACK type {}", conn.cid, other);
            add_reject(conn, reject_reason::PROTOCOL_ERROR, &header, true)
        }
    }
}

fn in_run(sn: u32, begrun: u32, run_length: u32) -> bool {
    serial::le(begrun, sn) && (run_length == 0 || serial::lt(sn, begrun.wrapping_add(run_length)))
}

fn data_or_r2t_snack(
    conn: &Arc<Connection>,
    itt: u32,
    begrun: u32,
    run_length: u32,
    header: &[u8; BHS_SIZE],
) -> IscsiResult<RxOutcome> {
    let Some(cmd) = conn.find_cmd_by_itt(itt) else {
        debug!("Data/R2T SNACK for unknown ITT 0x{:08x}", itt);
        return Ok(RxOutcome::Continue);
    };
    let mut c = cmd.lock();
    if c.is_read() {
        if !c.completed || c.buffer.is_none() || !serial::lt(begrun, c.data_sn) {
            debug!(
                "ITT 0x{:08x}: Data SNACK BegRun {} outside the {} Data-In sent",
                itt, begrun, c.data_sn
            );
            drop(c);
            return add_reject(conn, reject_reason::INVALID_PDU_FIELD, header, false);
        }
        c.datain_recovery = Some(DataInRecovery { begrun, run_length });
        c.state = CmdState::SendRecoveryDataIn;
        drop(c);
        trace!("ITT 0x{:08x}: resending Data-In from DataSN {}", itt, begrun);
        conn.queues.push_response(cmd, CmdState::SendRecoveryDataIn);
        return Ok(RxOutcome::Continue);
    }
    if c.is_write() {
        let mut resend = 0;
        for r in c.r2ts.iter_mut() {
            if r.sent && !r.complete && in_run(r.r2t_sn, begrun, run_length) {
                r.sent = false;
                resend += 1;
            }
        }
        drop(c);
        if resend == 0 {
            return add_reject(conn, reject_reason::INVALID_PDU_FIELD, header, false);
        }
        trace!("ITT 0x{:08x}: resending {} R2T(s)", itt, resend);
        for _ in 0..resend {
            conn.queues.push_immediate(Arc::clone(&cmd), CmdState::SendR2t);
        }
        return Ok(RxOutcome::Continue);
    }
    drop(c);
    add_reject(conn, reject_reason::INVALID_PDU_FIELD, header, false)
}

fn status_snack(conn: &Arc<Connection>, begrun: u32, run_length: u32) {
    let mut resend = Vec::new();
    for cmd in conn.commands() {
        let mut c = cmd.lock();
        if c.state == CmdState::SentStatus && c.stat_sn_assigned && in_run(c.stat_sn, begrun, run_length) {
            c.state = CmdState::SendStatusRecovery;
            resend.push(Arc::clone(&cmd));
        }
    }
    if resend.is_empty() {
        debug!(
            "CID {}: status SNACK {}+{} matches nothing outstanding",
            conn.cid, begrun, run_length
        );
    }
    for cmd in resend {
        conn.queues.push_response(cmd, CmdState::SendStatusRecovery);
    }
}

fn data_ack(
    conn: &Arc<Connection>,
    ttt: u32,
    begrun: u32,
    header: &[u8; BHS_SIZE],
) -> IscsiResult<RxOutcome> {
    let found = conn.commands().into_iter().find(|cmd| {
        let c = cmd.lock();
        c.kind == CmdKind::Scsi && c.is_read() && c.ttt == ttt
    });
    let Some(cmd) = found else {
        warn!("CID {}: DataACK for unknown TTT 0x{:08x}", conn.cid, ttt);
        return add_reject(conn, reject_reason::INVALID_DATA_ACK, header, false);
    };
    let mut c = cmd.lock();
    if serial::gt(begrun, c.acked_data_sn) {
        c.acked_data_sn = begrun;
    }
    trace!("ITT 0x{:08x}: Data-In acknowledged below DataSN {}", c.itt, begrun);
    Ok(RxOutcome::Continue)
}
