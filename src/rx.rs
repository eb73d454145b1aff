//! Receive thread of a full-feature connection

use crate::connection::Connection;
use crate::digest::{self, DIGEST_LEN};
use crate::error::{IscsiError, IscsiResult};
use crate::handlers::{self, add_reject, RxOutcome};
use crate::pdu::{opcode, reject_reason, serial, IscsiPdu, BHS_SIZE};
use crate::recovery;
use crate::sync::WaitOutcome;
use log::{debug, info, trace, warn};
use std::sync::Arc;

/// Read the next header (BHS, AHS and header digest)
///
/// The data segment is left on the wire for the handler to consume.
fn read_pdu(conn: &Connection) -> IscsiResult<IscsiPdu> {
    let mut bhs = [0u8; BHS_SIZE];
    conn.recv_exact(&mut bhs)?;
    let mut ahs = vec![0u8; bhs[4] as usize * 4];
    conn.recv_exact(&mut ahs)?;

    if conn.params.digests.header.enabled() {
        let mut wire = [0u8; DIGEST_LEN];
        conn.recv_exact(&mut wire)?;
        let received = digest::from_wire(wire);
        let computed = digest::header_digest(&bhs, &ahs);
        if received != computed {
            let errors = conn.session.record_digest_error();
            warn!(
                "CID {}: header digest 0x{:08x} != 0x{:08x} ({} digest errors)",
                conn.cid, received, computed, errors
            );
            // the segment length can't be trusted, so the stream is lost
            return Err(IscsiError::Digest {
                kind: "header",
                received,
                computed,
            });
        }
    }

    let mut pdu = IscsiPdu::parse_bhs(&bhs);
    pdu.ahs = ahs;
    trace!(
        "CID {}: received {} ITT 0x{:08x} ({} data bytes)",
        conn.cid,
        pdu.opcode_name(),
        pdu.itt,
        pdu.data_length
    );
    Ok(pdu)
}

fn note_exp_stat_sn(conn: &Connection, pdu: &IscsiPdu) {
    let carries = matches!(
        pdu.opcode,
        opcode::NOP_OUT
            | opcode::SCSI_COMMAND
            | opcode::TASK_MANAGEMENT_REQUEST
            | opcode::TEXT_REQUEST
            | opcode::SCSI_DATA_OUT
            | opcode::LOGOUT_REQUEST
            | opcode::SNACK_REQUEST
    );
    if !carries {
        return;
    }
    let exp = pdu.exp_stat_sn();
    if serial::gt(exp, conn.exp_stat_sn()) {
        conn.set_exp_stat_sn(exp);
    }
}

fn dispatch(conn: &Arc<Connection>, pdu: &IscsiPdu) -> IscsiResult<RxOutcome> {
    if conn.session.is_discovery() && !matches!(pdu.opcode, opcode::TEXT_REQUEST | opcode::LOGOUT_REQUEST) {
        warn!(
            "CID {}: {} not allowed in a discovery session",
            conn.cid,
            pdu.opcode_name()
        );
        return add_reject(conn, reject_reason::PROTOCOL_ERROR, &pdu.bhs_bytes(), true);
    }
    match pdu.opcode {
        opcode::SCSI_COMMAND => handlers::handle_scsi_cmd(conn, pdu),
        opcode::SCSI_DATA_OUT => handlers::handle_data_out(conn, pdu),
        opcode::NOP_OUT => handlers::handle_nop_out(conn, pdu),
        opcode::TASK_MANAGEMENT_REQUEST => handlers::handle_task_mgt(conn, pdu),
        opcode::TEXT_REQUEST => handlers::handle_text(conn, pdu),
        opcode::LOGOUT_REQUEST => handlers::handle_logout(conn, pdu),
        opcode::SNACK_REQUEST => recovery::handle_snack(conn, pdu),
        other => {
            warn!("CID {}: unsupported opcode 0x{:02x}", conn.cid, other);
            add_reject(conn, reject_reason::COMMAND_NOT_SUPPORTED, &pdu.bhs_bytes(), true)
        }
    }
}

/// Body of the receive thread
///
/// Returns `Ok` when the connection is closed in an orderly way (logout or
/// a stop request) and `Err` when it has to be failed.
pub(crate) fn rx_thread(conn: &Arc<Connection>) -> IscsiResult<()> {
    debug!("TSIH {} CID {}: receive thread running", conn.session.tsih, conn.cid);
    loop {
        if conn.cancel.is_cancelled() {
            return Ok(());
        }
        let pdu = match read_pdu(conn) {
            Ok(pdu) => pdu,
            Err(_) if conn.cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        };
        note_exp_stat_sn(conn, &pdu);

        match dispatch(conn, &pdu)? {
            RxOutcome::Continue | RxOutcome::Rejected => {}
            RxOutcome::LogoutPending => {
                let timeout = conn.session.ctx.config.logout_timeout;
                match conn.logout_done.wait_cancellable(Some(timeout), &conn.cancel) {
                    WaitOutcome::Completed => info!("CID {}: logout response sent", conn.cid),
                    outcome => debug!("CID {}: stopped waiting for logout response ({:?})", conn.cid, outcome),
                }
                return Ok(());
            }
        }
    }
}
