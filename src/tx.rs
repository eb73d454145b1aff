//! Transmit thread of a full-feature connection
//!
//! Owns the write side of the transport. Immediate requests (R2Ts, command
//! retirement, NOP-In pings) always go first. A response that closes the
//! CmdSN window slot of its command opens that slot before the PDU is
//! built, so the MaxCmdSN it carries already reflects the retirement.

use crate::command::{CmdHandle, CmdKind, CmdState};
use crate::connection::{ConnState, Connection};
use crate::datain::{datain_flags, datain_layout, datain_range, residual_flags};
use crate::error::{IscsiError, IscsiResult};
use crate::lifecycle;
use crate::pdu::{
    async_event, flags, logout_reason, logout_response, serialize_text_parameters, tmf_function, tmf_response,
    IscsiPdu, RESERVED_TAG,
};
use crate::queue::{QueueKind, QueueReq};
use crate::recovery;
use crate::session::Session;
use log::{debug, info, trace, warn};
use std::sync::Arc;

/// Largest SendTargets response we build
const SEND_TARGETS_MAX: u32 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxFlow {
    Continue,
    Stop,
}

pub(crate) fn tx_thread(conn: &Arc<Connection>) -> IscsiResult<()> {
    debug!("TSIH {} CID {}: transmit thread running", conn.session.tsih, conn.cid);
    while let Some((kind, req)) = conn.queues.wait_next(&conn.cancel) {
        let flow = match kind {
            QueueKind::Immediate => handle_immediate(conn, &req)?,
            QueueKind::Response => handle_response(conn, &req)?,
        };
        if flow == TxFlow::Stop {
            return Ok(());
        }
    }
    Ok(())
}

fn open_window_slot(sess: &Session, cmd: &CmdHandle) {
    let slot = cmd.lock().take_window_slot();
    if slot {
        sess.increment_max_cmd_sn();
    }
}

fn stamp(conn: &Connection, pdu: &mut IscsiPdu, stat_sn: u32) {
    let (exp, max) = conn.session.cmd_sn_window();
    pdu.set_sequence(stat_sn, exp, max);
}

/// Retire a command whose last PDU went out, or keep it for status
/// retransmission until the initiator acknowledges its StatSN
fn finish_response(conn: &Arc<Connection>, cmd: &CmdHandle) {
    let retain = conn.session.erl() > 0 && {
        let mut c = cmd.lock();
        let keep = c.kind == CmdKind::Scsi && c.stat_sn_assigned && !c.aborted;
        if keep {
            c.state = CmdState::SentStatus;
        }
        keep
    };
    if !retain {
        lifecycle::release_cmd(conn, cmd);
    }
}

// ---- immediate queue ----

fn handle_immediate(conn: &Arc<Connection>, req: &QueueReq) -> IscsiResult<TxFlow> {
    match req.state {
        CmdState::SendR2t => send_r2t(conn, &req.cmd)?,
        CmdState::Remove => lifecycle::release_cmd(conn, &req.cmd),
        CmdState::SendNopInWantResponse => send_nopin_ping(conn, &req.cmd)?,
        other => warn!(
            "CID {}: unexpected immediate request {:?} for ITT 0x{:08x}",
            conn.cid,
            other,
            req.cmd.itt()
        ),
    }
    Ok(TxFlow::Continue)
}

fn send_r2t(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<()> {
    let sess = &conn.session;
    let (exp, max) = sess.cmd_sn_window();
    let pdu = {
        let mut c = cmd.lock();
        if c.aborted || c.state == CmdState::Remove {
            return Ok(());
        }
        let (itt, lun) = (c.itt, c.lun);
        let Some(r2t) = c.r2ts.iter_mut().find(|r| r.queued && !r.sent && !r.complete) else {
            trace!("ITT 0x{:08x}: no R2T left to send", itt);
            return Ok(());
        };
        if r2t.ttt == RESERVED_TAG {
            r2t.ttt = sess.next_ttt();
        }
        r2t.sent = true;
        trace!(
            "ITT 0x{:08x}: R2T {} offset {} length {} TTT 0x{:08x}",
            itt,
            r2t.r2t_sn,
            r2t.offset,
            r2t.xfer_len,
            r2t.ttt
        );
        IscsiPdu::r2t(itt, r2t.ttt, lun, r2t.r2t_sn, r2t.offset, r2t.xfer_len).with_sequence(
            conn.current_stat_sn(),
            exp,
            max,
        )
    };
    conn.send_pdu(&pdu)?;
    lifecycle::start_dataout_timer(conn, cmd);
    Ok(())
}

fn send_nopin_ping(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<()> {
    let ttt = {
        let mut c = cmd.lock();
        c.state = CmdState::SentNopInWantResponse;
        c.ttt
    };
    let mut pdu = IscsiPdu::nop_in(RESERVED_TAG, ttt, 0, Vec::new());
    stamp(conn, &mut pdu, conn.current_stat_sn());
    conn.send_pdu(&pdu)?;
    lifecycle::start_nopin_response_timer(conn);
    Ok(())
}

// ---- response queue ----

fn handle_response(conn: &Arc<Connection>, req: &QueueReq) -> IscsiResult<TxFlow> {
    let cmd = &req.cmd;
    if req.state != CmdState::SendReject {
        let aborted = {
            let c = cmd.lock();
            c.kind == CmdKind::Scsi && c.aborted
        };
        if aborted {
            lifecycle::release_cmd(conn, cmd);
            return Ok(TxFlow::Continue);
        }
    }
    match req.state {
        CmdState::SendDataIn => send_datain(conn, cmd, false)?,
        CmdState::SendRecoveryDataIn => send_datain(conn, cmd, true)?,
        CmdState::SendStatus | CmdState::SendStatusRecovery => send_status(conn, cmd)?,
        CmdState::SendNopIn => send_nopin_response(conn, cmd)?,
        CmdState::SendTextRsp => send_text_response(conn, cmd)?,
        CmdState::SendTaskMgtRsp => send_tmr_response(conn, cmd)?,
        CmdState::SendLogoutRsp => return send_logout_response(conn, cmd),
        CmdState::SendReject => send_reject(conn, cmd)?,
        CmdState::SendAsyncMsg => send_async(conn, cmd)?,
        other => warn!(
            "CID {}: unexpected response request {:?} for ITT 0x{:08x}",
            conn.cid,
            other,
            cmd.itt()
        ),
    }
    Ok(TxFlow::Continue)
}

/// Send read data, with status on the last PDU when there is no sense
///
/// With `recovery`, only the DataSN run requested by SNACK (or by a TASK
/// REASSIGN's ExpDataSN) is resent.
fn send_datain(conn: &Arc<Connection>, cmd: &CmdHandle, recovery: bool) -> IscsiResult<()> {
    let sess = &conn.session;
    let erl = sess.erl();

    let mut c = cmd.lock();
    let Some(buffer) = c.buffer.take() else {
        drop(c);
        debug!("ITT 0x{:08x}: no read buffer left, sending status only", cmd.itt());
        return send_status(conn, cmd);
    };
    let layout = datain_layout(c.transferred, conn.max_xmit(), sess.params.max_burst_length);
    let run = match (recovery, c.datain_recovery.take()) {
        (true, Some(r)) => datain_range(&layout, r.begrun, r.run_length),
        _ => layout,
    };
    let carries_status = c.sense.is_none();
    let ends_cmd = run.last().map(|v| v.last).unwrap_or(false);
    let slot = carries_status && ends_cmd && c.take_window_slot();
    let stat_sn = if carries_status && ends_cmd {
        if !c.stat_sn_assigned {
            c.stat_sn = conn.next_stat_sn();
            c.stat_sn_assigned = true;
        }
        c.stat_sn
    } else {
        RESERVED_TAG
    };
    let (itt, lun, ttt, status, residual) = (c.itt, c.lun, c.ttt, c.scsi_status, c.residual);
    drop(c);
    if slot {
        sess.increment_max_cmd_sn();
    }
    let (exp, max) = sess.cmd_sn_window();

    let mut sent_sn = None;
    let mut result = Ok(());
    for v in &run {
        let with_status = v.last && carries_status;
        let mut f = datain_flags(v, carries_status, residual);
        let wants_ack = erl > 0 && v.end_of_burst && !with_status;
        if wants_ack {
            f |= flags::DATA_ACK;
        }
        let mut pdu = IscsiPdu::scsi_data_in(
            itt,
            if wants_ack { ttt } else { RESERVED_TAG },
            lun,
            v.data_sn,
            v.offset,
            f,
            status,
            if with_status { residual.count() } else { 0 },
            Vec::new(),
        );
        pdu.set_sequence(if with_status { stat_sn } else { RESERVED_TAG }, exp, max);
        result = conn.send_pdu_with_sgl(&pdu, &buffer, v.offset as usize, v.length as usize);
        if result.is_err() {
            break;
        }
        sent_sn = Some(v.data_sn);
    }

    {
        let mut c = cmd.lock();
        c.buffer = Some(buffer);
        if let Some(sn) = sent_sn {
            let next = sn.wrapping_add(1);
            if crate::pdu::serial::gt(next, c.data_sn) {
                c.data_sn = next;
            }
        }
    }
    result?;
    trace!("ITT 0x{:08x}: sent {} Data-In PDU(s)", itt, run.len());

    if !ends_cmd {
        // partial retransmission; status was sent before
        let mut c = cmd.lock();
        if c.stat_sn_assigned {
            c.state = CmdState::SentStatus;
        }
        return Ok(());
    }
    if carries_status {
        finish_response(conn, cmd);
        return Ok(());
    }
    send_status(conn, cmd)
}

fn send_status(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<()> {
    let sess = &conn.session;
    let (pdu_fields, slot) = {
        let mut c = cmd.lock();
        let slot = c.take_window_slot();
        if !c.stat_sn_assigned {
            c.stat_sn = conn.next_stat_sn();
            c.stat_sn_assigned = true;
        } else {
            trace!("ITT 0x{:08x}: resending status StatSN 0x{:08x}", c.itt, c.stat_sn);
        }
        let exp_data_sn = if c.is_read() {
            c.data_sn
        } else if c.is_write() {
            c.r2t_sn
        } else {
            0
        };
        (
            (
                c.itt,
                c.iscsi_response,
                c.scsi_status,
                c.residual,
                exp_data_sn,
                c.sense.clone(),
                c.stat_sn,
            ),
            slot,
        )
    };
    if slot {
        sess.increment_max_cmd_sn();
    }
    let (itt, response, status, residual, exp_data_sn, sense, stat_sn) = pdu_fields;
    let mut pdu = IscsiPdu::scsi_response(
        itt,
        response,
        status,
        residual_flags(residual),
        residual.count(),
        exp_data_sn,
        sense.as_deref(),
    );
    stamp(conn, &mut pdu, stat_sn);
    conn.send_pdu(&pdu)?;
    trace!("ITT 0x{:08x}: status 0x{:02x} StatSN 0x{:08x}", itt, status, stat_sn);
    finish_response(conn, cmd);
    Ok(())
}

fn send_nopin_response(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<()> {
    open_window_slot(&conn.session, cmd);
    let (itt, lun, data) = {
        let mut c = cmd.lock();
        (c.itt, c.lun, std::mem::take(&mut c.ping_data))
    };
    let mut pdu = IscsiPdu::nop_in(itt, RESERVED_TAG, lun, data);
    stamp(conn, &mut pdu, conn.next_stat_sn());
    conn.send_pdu(&pdu)?;
    lifecycle::release_cmd(conn, cmd);
    Ok(())
}

/// Build the SendTargets reply for `key`: "All", empty (this session's
/// target) or one target name
fn send_targets_payload(conn: &Connection, key: &str) -> Vec<u8> {
    let sess = &conn.session;
    let targets = sess.registry().map(|r| r.targets()).unwrap_or_default();
    let limit = conn.max_xmit().min(SEND_TARGETS_MAX) as usize;
    let mut data = Vec::new();
    for target in targets {
        let wanted = match key {
            "All" => true,
            "" => target.name == sess.target_name,
            name => target.name == name,
        };
        if !wanted {
            continue;
        }
        let mut entry = vec![("TargetName".to_string(), target.name.clone())];
        entry.extend(
            target
                .portals
                .iter()
                .map(|p| ("TargetAddress".to_string(), p.clone())),
        );
        let bytes = serialize_text_parameters(&entry);
        if data.len() + bytes.len() > limit {
            warn!(
                "CID {}: SendTargets reply truncated at {} bytes",
                conn.cid,
                data.len()
            );
            break;
        }
        data.extend_from_slice(&bytes);
    }
    data
}

fn send_text_response(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<()> {
    open_window_slot(&conn.session, cmd);
    let (itt, key) = {
        let c = cmd.lock();
        (c.itt, c.text_key.clone().unwrap_or_default())
    };
    let data = send_targets_payload(conn, &key);
    let mut pdu = IscsiPdu::text_response(itt, RESERVED_TAG, 0, true, data);
    stamp(conn, &mut pdu, conn.next_stat_sn());
    conn.send_pdu(&pdu)?;
    lifecycle::release_cmd(conn, cmd);
    Ok(())
}

fn send_tmr_response(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<()> {
    open_window_slot(&conn.session, cmd);
    let (itt, function, response, exp_data_sn, reassign) = {
        let mut c = cmd.lock();
        let itt = c.itt;
        match c.tmr.as_mut() {
            Some(tmr) => (itt, tmr.function, tmr.response, tmr.exp_data_sn, tmr.reassign.take()),
            None => (itt, 0, tmf_response::FUNCTION_REJECTED, 0, None),
        }
    };
    let mut pdu = IscsiPdu::task_mgmt_response(itt, response);
    stamp(conn, &mut pdu, conn.next_stat_sn());
    conn.send_pdu(&pdu)?;
    debug!("CID {}: TMF ITT 0x{:08x} answered with {}", conn.cid, itt, response);

    if function == tmf_function::TASK_REASSIGN && response == tmf_response::FUNCTION_COMPLETE {
        if let Some(task) = reassign {
            recovery::complete_task_reassign(conn, &task, exp_data_sn);
        }
    }
    lifecycle::release_cmd(conn, cmd);
    Ok(())
}

fn send_logout_response(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<TxFlow> {
    let sess = Arc::clone(&conn.session);
    let (itt, info, exp_stat_sn) = {
        let c = cmd.lock();
        let Some(info) = c.logout else {
            return Ok(TxFlow::Continue);
        };
        (c.itt, info, c.exp_stat_sn)
    };

    let recovering = info.reason == logout_reason::REMOVE_CONNECTION_FOR_RECOVERY
        && info.response == logout_response::SUCCESS;
    let (time2wait, time2retain) = if recovering {
        // the failed connection's tasks must be in its recovery record
        // before acknowledged ones can be pruned
        if let Some(old) = sess.find_connection(info.cid) {
            old.flags().connection_recovery = true;
            lifecycle::cause_connection_reinstatement(&old, true);
        }
        recovery::discard_acked(&sess, info.cid, exp_stat_sn);
        (sess.params.default_time2wait, sess.params.default_time2retain)
    } else {
        (0, 0)
    };

    open_window_slot(&sess, cmd);
    let mut pdu = IscsiPdu::logout_response(itt, info.response, time2wait, time2retain);
    stamp(conn, &mut pdu, conn.next_stat_sn());
    let sent = conn.send_pdu(&pdu);
    lifecycle::release_cmd(conn, cmd);
    sent?;

    match info.reason {
        logout_reason::CLOSE_SESSION => {
            info!("TSIH {}: session logout complete", sess.tsih);
            conn.flags().logout_remove = false;
            conn.logout_done.complete();
            for other in sess.connections() {
                if !Arc::ptr_eq(&other, conn) {
                    lifecycle::cause_connection_reinstatement(&other, true);
                }
            }
            Ok(TxFlow::Stop)
        }
        logout_reason::CLOSE_CONNECTION if info.cid == conn.cid => {
            info!("TSIH {} CID {}: connection logout complete", sess.tsih, conn.cid);
            conn.flags().logout_remove = false;
            conn.logout_done.complete();
            Ok(TxFlow::Stop)
        }
        logout_reason::CLOSE_CONNECTION if info.response == logout_response::SUCCESS => {
            if let Some(other) = sess.find_connection(info.cid) {
                info!("TSIH {}: closing CID {} on request from CID {}", sess.tsih, info.cid, conn.cid);
                other.set_state(ConnState::InLogout);
                lifecycle::cause_connection_reinstatement(&other, true);
            }
            Ok(TxFlow::Continue)
        }
        _ => Ok(TxFlow::Continue),
    }
}

fn send_reject(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<()> {
    let Some(info) = cmd.lock().reject.clone() else {
        cmd.reject_done.complete();
        return Ok(());
    };
    let mut pdu = IscsiPdu::reject(info.reason, &info.header, 0);
    stamp(conn, &mut pdu, conn.next_stat_sn());
    let sent = conn.send_pdu(&pdu);
    cmd.reject_done.complete();
    lifecycle::release_cmd(conn, cmd);
    sent?;
    if info.fail_conn {
        return Err(IscsiError::Rejected { reason: info.reason });
    }
    Ok(())
}

fn send_async(conn: &Arc<Connection>, cmd: &CmdHandle) -> IscsiResult<()> {
    let Some(msg) = cmd.lock().async_msg else {
        lifecycle::release_cmd(conn, cmd);
        return Ok(());
    };
    let mut pdu = IscsiPdu::async_message(0, msg.event, msg.param1, msg.param2, msg.param3);
    stamp(conn, &mut pdu, conn.next_stat_sn());
    let sent = conn.send_pdu(&pdu);
    lifecycle::release_cmd(conn, cmd);
    sent?;
    info!(
        "TSIH {} CID {}: async event {} sent",
        conn.session.tsih, conn.cid, msg.event
    );
    if msg.event == async_event::DROP_ALL_CONNECTIONS {
        lifecycle::drop_session(&conn.session);
    }
    Ok(())
}
