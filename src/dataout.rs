//! Write data flow: R2T generation and Data-Out validation
//!
//! Every function here works on a locked [`CmdInner`]; the caller queues any
//! new R2Ts and owns the network side.

use crate::command::{CmdInner, DataSequence};
use crate::pdu::{ScsiDataOutPdu, RESERVED_TAG};
use crate::session::SessionParams;
use log::{debug, warn};
use rand::seq::SliceRandom;

/// Verdict on a Data-Out PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutResult {
    /// Accepted; more data expected in this burst
    Normal,
    /// Burst finished; solicit more data
    SendR2t,
    /// All data received; the command can go to the backend
    SendToTransport,
    /// Payload dropped; a recovery R2T will re-request it
    WithinCommandRecovery,
    /// Error the current ErrorRecoveryLevel cannot handle
    CannotRecover,
}

/// Which burst a Data-Out belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Burst {
    Unsolicited,
    Solicited(usize),
}

/// Queue R2Ts for the next bursts of a write
///
/// Returns how many R2Ts were added. With `recovery`, the first burst is
/// shortened by what the initiator already sent in the current burst.
pub(crate) fn build_r2ts_for_cmd(cmd: &mut CmdInner, params: &SessionParams, recovery: bool) -> usize {
    if cmd.sent_last_r2t {
        return 0;
    }
    if params.data_sequence_in_order && cmd.r2t_offset < cmd.write_data_done {
        cmd.r2t_offset = cmd.write_data_done;
    }

    let mut added = 0;
    let mut first = true;
    while cmd.outstanding_r2ts < params.max_outstanding_r2t.max(1) {
        let (offset, xfer_len) = if params.data_sequence_in_order {
            let offset = cmd.r2t_offset;
            if offset >= cmd.data_length {
                cmd.sent_last_r2t = true;
                break;
            }
            let burst = if first && recovery {
                params.max_burst_length.saturating_sub(cmd.next_burst_len)
            } else {
                params.max_burst_length
            };
            let xfer_len = burst.min(cmd.data_length - offset);
            if xfer_len == 0 {
                warn!("refusing zero-length R2T for ITT 0x{:08x}", cmd.itt);
                break;
            }
            cmd.r2t_offset += xfer_len;
            if cmd.r2t_offset == cmd.data_length {
                cmd.sent_last_r2t = true;
            }
            (offset, xfer_len)
        } else {
            let Some(seq) = cmd.seq_list.get(cmd.seq_send_order).copied() else {
                cmd.sent_last_r2t = true;
                break;
            };
            cmd.seq_send_order += 1;
            if cmd.seq_send_order == cmd.seq_list.len() {
                cmd.sent_last_r2t = true;
            }
            (seq.offset, seq.xfer_len)
        };

        cmd.outstanding_r2ts += 1;
        cmd.add_r2t(offset, xfer_len, false);
        added += 1;
        first = false;
        if cmd.sent_last_r2t {
            break;
        }
    }
    added
}

/// Split the solicited part of a write into MaxBurstLength sequences
///
/// Used when DataSequenceInOrder=No; `random` shuffles the send order.
pub(crate) fn build_sequence_list(cmd: &mut CmdInner, params: &SessionParams, random: bool) {
    let start = if params.initial_r2t {
        cmd.first_burst_len
    } else {
        // unsolicited data covers up to FirstBurstLength
        params.first_burst_length.min(cmd.data_length).max(cmd.first_burst_len)
    };
    let burst = params.max_burst_length.max(1);
    let mut seqs = Vec::new();
    let mut offset = start;
    while offset < cmd.data_length {
        let xfer_len = burst.min(cmd.data_length - offset);
        seqs.push(DataSequence { offset, xfer_len });
        offset += xfer_len;
    }
    if random {
        seqs.shuffle(&mut rand::thread_rng());
    }
    cmd.seq_list = seqs;
    cmd.seq_send_order = 0;
}

fn locate_burst(cmd: &CmdInner, hdr: &ScsiDataOutPdu) -> Option<Burst> {
    if hdr.ttt == RESERVED_TAG {
        cmd.unsolicited_data.then_some(Burst::Unsolicited)
    } else {
        cmd.r2t_by_ttt(hdr.ttt).map(Burst::Solicited)
    }
}

/// Validate a Data-Out header before its payload is read
pub(crate) fn check_pre_dataout(cmd: &mut CmdInner, hdr: &ScsiDataOutPdu, params: &SessionParams) -> DataOutResult {
    let erl = params.error_recovery_level;
    let len = hdr.payload_length;
    let end = hdr.buffer_offset.saturating_add(len);

    let Some(burst) = locate_burst(cmd, hdr) else {
        warn!(
            "Data-Out for ITT 0x{:08x} with unknown TTT 0x{:08x}",
            hdr.itt, hdr.ttt
        );
        return DataOutResult::CannotRecover;
    };

    let (expected_offset, expected_data_sn, dump) = match burst {
        Burst::Unsolicited => {
            if end > params.first_burst_length {
                warn!(
                    "unsolicited data for ITT 0x{:08x} runs past FirstBurstLength {}",
                    hdr.itt, params.first_burst_length
                );
                return DataOutResult::CannotRecover;
            }
            let u = &cmd.unsolicited;
            (u.start + u.received, u.next_data_sn, u.dump)
        }
        Burst::Solicited(i) => {
            let r = &cmd.r2ts[i];
            if hdr.buffer_offset < r.offset || end > r.offset + r.xfer_len {
                warn!(
                    "Data-Out {}+{} outside R2T {}+{} for ITT 0x{:08x}",
                    hdr.buffer_offset, len, r.offset, r.xfer_len, hdr.itt
                );
                return DataOutResult::CannotRecover;
            }
            (r.offset + r.received, r.next_data_sn, r.dump)
        }
    };

    if dump {
        if hdr.final_flag {
            recover_burst(cmd, burst, end);
        }
        return DataOutResult::WithinCommandRecovery;
    }

    let out_of_order = params.data_pdu_in_order && hdr.buffer_offset != expected_offset;
    if out_of_order || hdr.data_sn != expected_data_sn {
        if erl == 0 {
            warn!(
                "Data-Out for ITT 0x{:08x}: offset {} DataSN {}, expected {} / {}",
                hdr.itt, hdr.buffer_offset, hdr.data_sn, expected_offset, expected_data_sn
            );
            return DataOutResult::CannotRecover;
        }
        debug!(
            "Data-Out for ITT 0x{:08x} out of sequence, recovering burst",
            hdr.itt
        );
        mark_dump(cmd, burst);
        if hdr.final_flag {
            recover_burst(cmd, burst, end);
        }
        return DataOutResult::WithinCommandRecovery;
    }
    DataOutResult::Normal
}

/// Account for a received Data-Out payload
///
/// `digest_failed` reports a data digest mismatch on the payload just read.
pub(crate) fn check_post_dataout(
    cmd: &mut CmdInner,
    hdr: &ScsiDataOutPdu,
    params: &SessionParams,
    digest_failed: bool,
) -> DataOutResult {
    let Some(burst) = locate_burst(cmd, hdr) else {
        return DataOutResult::CannotRecover;
    };
    let len = hdr.payload_length;

    if digest_failed {
        if params.error_recovery_level == 0 {
            return DataOutResult::CannotRecover;
        }
        debug!(
            "data digest failure on ITT 0x{:08x} offset {}, dropping burst",
            hdr.itt, hdr.buffer_offset
        );
        mark_dump(cmd, burst);
        if hdr.final_flag {
            recover_burst(cmd, burst, hdr.buffer_offset + len);
        }
        return DataOutResult::WithinCommandRecovery;
    }

    let overrun = match burst {
        Burst::Unsolicited => {
            let u = &cmd.unsolicited;
            u.start + u.received + len > params.first_burst_length
        }
        Burst::Solicited(i) => {
            let r = &cmd.r2ts[i];
            r.received + len > r.xfer_len
        }
    };
    if overrun || cmd.write_data_done + len > cmd.data_length {
        warn!(
            "Data-Out for ITT 0x{:08x} at offset {} overruns its burst",
            hdr.itt, hdr.buffer_offset
        );
        return DataOutResult::CannotRecover;
    }

    match burst {
        Burst::Unsolicited => {
            cmd.unsolicited.received += len;
            cmd.unsolicited.next_data_sn = cmd.unsolicited.next_data_sn.wrapping_add(1);
        }
        Burst::Solicited(i) => {
            let r = &mut cmd.r2ts[i];
            r.received += len;
            r.next_data_sn = r.next_data_sn.wrapping_add(1);
        }
    }
    cmd.write_data_done += len;
    cmd.next_burst_len += len;

    if !hdr.final_flag {
        return DataOutResult::Normal;
    }

    match burst {
        Burst::Unsolicited => cmd.unsolicited_data = false,
        Burst::Solicited(i) => {
            cmd.r2ts[i].complete = true;
            cmd.outstanding_r2ts = cmd.outstanding_r2ts.saturating_sub(1);
        }
    }
    cmd.next_burst_len = 0;

    if cmd.write_data_done >= cmd.data_length {
        DataOutResult::SendToTransport
    } else {
        DataOutResult::SendR2t
    }
}

fn mark_dump(cmd: &mut CmdInner, burst: Burst) {
    match burst {
        Burst::Unsolicited => cmd.unsolicited.dump = true,
        Burst::Solicited(i) => cmd.r2ts[i].dump = true,
    }
}

/// Discard what was accepted from a broken burst and re-request it
///
/// `end` is the end offset of the burst's final PDU.
fn recover_burst(cmd: &mut CmdInner, burst: Burst, end: u32) {
    match burst {
        Burst::Unsolicited => {
            let start = cmd.unsolicited.start;
            cmd.write_data_done -= cmd.unsolicited.received;
            cmd.unsolicited = Default::default();
            cmd.unsolicited_data = false;
            let end = end.min(cmd.data_length).max(start);
            if cmd.r2t_offset < end {
                cmd.r2t_offset = end;
            }
            if end > start {
                cmd.outstanding_r2ts += 1;
                cmd.add_r2t(start, end - start, true);
            }
        }
        Burst::Solicited(i) => {
            let (offset, xfer_len, received) = {
                let r = &mut cmd.r2ts[i];
                r.complete = true;
                (r.offset, r.xfer_len, r.received)
            };
            cmd.write_data_done -= received;
            cmd.add_r2t(offset, xfer_len, true);
        }
    }
    cmd.next_burst_len = 0;
}

/// Re-solicit everything still missing after a Data-Out timeout
///
/// Outstanding R2Ts are retired in favour of recovery R2Ts covering their
/// unreceived tails. Returns the number of R2Ts added.
pub(crate) fn request_dataout_retransmission(cmd: &mut CmdInner, params: &SessionParams) -> usize {
    let before = cmd.r2ts.len();

    if cmd.unsolicited_data {
        let u = cmd.unsolicited;
        let end = params.first_burst_length.min(cmd.data_length);
        let from = u.start + if u.dump { 0 } else { u.received };
        if u.dump {
            cmd.write_data_done -= u.received;
        }
        cmd.unsolicited_data = false;
        cmd.unsolicited = Default::default();
        if cmd.r2t_offset < end {
            cmd.r2t_offset = end;
        }
        if end > from {
            cmd.outstanding_r2ts += 1;
            cmd.add_r2t(from, end - from, true);
        }
    }

    let stalled: Vec<usize> = (0..cmd.r2ts.len())
        .filter(|&i| cmd.r2ts[i].sent && !cmd.r2ts[i].complete)
        .collect();
    for i in stalled {
        let (offset, xfer_len, received, dump) = {
            let r = &mut cmd.r2ts[i];
            r.complete = true;
            (r.offset, r.xfer_len, r.received, r.dump)
        };
        let kept = if dump {
            cmd.write_data_done -= received;
            0
        } else {
            received
        };
        if xfer_len > kept {
            cmd.add_r2t(offset + kept, xfer_len - kept, true);
        } else {
            cmd.outstanding_r2ts = cmd.outstanding_r2ts.saturating_sub(1);
        }
    }

    if cmd.outstanding_r2ts == 0 && cmd.write_data_done < cmd.data_length {
        build_r2ts_for_cmd(cmd, params, true);
    }
    cmd.next_burst_len = 0;
    cmd.r2ts.len() - before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CmdKind, Command, DataDirection};
    use std::sync::Weak;

    fn params() -> SessionParams {
        SessionParams {
            max_burst_length: 8192,
            first_burst_length: 4096,
            max_outstanding_r2t: 2,
            ..SessionParams::default()
        }
    }

    fn write_cmd(len: u32) -> crate::command::CmdHandle {
        let cmd = Command::detached(CmdKind::Scsi, Weak::new(), 0);
        {
            let mut c = cmd.lock();
            c.itt = 7;
            c.direction = DataDirection::Write;
            c.data_length = len;
        }
        cmd
    }

    fn data_out(ttt: u32, data_sn: u32, offset: u32, len: u32, final_flag: bool) -> ScsiDataOutPdu {
        ScsiDataOutPdu {
            lun: 0,
            itt: 7,
            ttt,
            exp_stat_sn: 0,
            data_sn,
            buffer_offset: offset,
            final_flag,
            payload_length: len,
        }
    }

    fn send(c: &mut CmdInner, idx: usize, ttt: u32) {
        c.r2ts[idx].sent = true;
        c.r2ts[idx].ttt = ttt;
    }

    #[test]
    fn test_r2ts_respect_burst_and_outstanding() {
        let p = params();
        let cmd = write_cmd(20_000);
        let mut c = cmd.lock();
        assert_eq!(build_r2ts_for_cmd(&mut c, &p, false), 2);
        assert_eq!((c.r2ts[0].offset, c.r2ts[0].xfer_len), (0, 8192));
        assert_eq!((c.r2ts[1].offset, c.r2ts[1].xfer_len), (8192, 8192));
        assert!(!c.sent_last_r2t);
        // window full
        assert_eq!(build_r2ts_for_cmd(&mut c, &p, false), 0);
        c.outstanding_r2ts = 1;
        assert_eq!(build_r2ts_for_cmd(&mut c, &p, false), 1);
        assert_eq!(c.r2ts[2].xfer_len, 20_000 - 16_384);
        assert!(c.sent_last_r2t);
        let total: u32 = c.r2ts.iter().map(|r| r.xfer_len).sum();
        assert_eq!(total, 20_000);
    }

    #[test]
    fn test_r2ts_start_after_immediate_data() {
        let p = params();
        let cmd = write_cmd(6000);
        let mut c = cmd.lock();
        c.write_data_done = 1000;
        build_r2ts_for_cmd(&mut c, &p, false);
        assert_eq!((c.r2ts[0].offset, c.r2ts[0].xfer_len), (1000, 5000));
    }

    #[test]
    fn test_solicited_burst_completes() {
        let p = params();
        let cmd = write_cmd(4096);
        let mut c = cmd.lock();
        build_r2ts_for_cmd(&mut c, &p, false);
        send(&mut c, 0, 0x100);

        let first = data_out(0x100, 0, 0, 2048, false);
        assert_eq!(check_pre_dataout(&mut c, &first, &p), DataOutResult::Normal);
        assert_eq!(check_post_dataout(&mut c, &first, &p, false), DataOutResult::Normal);

        let last = data_out(0x100, 1, 2048, 2048, true);
        assert_eq!(check_pre_dataout(&mut c, &last, &p), DataOutResult::Normal);
        assert_eq!(
            check_post_dataout(&mut c, &last, &p, false),
            DataOutResult::SendToTransport
        );
        assert_eq!(c.write_data_done, 4096);
        assert_eq!(c.outstanding_r2ts, 0);
    }

    #[test]
    fn test_bad_datasn_at_erl0_is_fatal() {
        let p = params();
        let cmd = write_cmd(4096);
        let mut c = cmd.lock();
        build_r2ts_for_cmd(&mut c, &p, false);
        send(&mut c, 0, 0x100);
        let pdu = data_out(0x100, 3, 0, 1024, false);
        assert_eq!(check_pre_dataout(&mut c, &pdu, &p), DataOutResult::CannotRecover);
    }

    #[test]
    fn test_digest_failure_recovers_burst_at_erl1() {
        let p = SessionParams {
            error_recovery_level: 1,
            ..params()
        };
        let cmd = write_cmd(4096);
        let mut c = cmd.lock();
        build_r2ts_for_cmd(&mut c, &p, false);
        c.take_unqueued_r2ts();
        send(&mut c, 0, 0x100);

        let first = data_out(0x100, 0, 0, 2048, false);
        check_pre_dataout(&mut c, &first, &p);
        check_post_dataout(&mut c, &first, &p, false);

        let bad = data_out(0x100, 1, 2048, 2048, true);
        assert_eq!(check_pre_dataout(&mut c, &bad, &p), DataOutResult::Normal);
        assert_eq!(
            check_post_dataout(&mut c, &bad, &p, true),
            DataOutResult::WithinCommandRecovery
        );
        // accepted bytes of the broken burst are discarded and re-requested
        assert_eq!(c.write_data_done, 0);
        assert_eq!(c.take_unqueued_r2ts(), 1);
        let r = c.r2ts.last().unwrap();
        assert!(r.recovery);
        assert_eq!((r.offset, r.xfer_len), (0, 4096));
        assert_eq!(c.outstanding_r2ts, 1);
    }

    #[test]
    fn test_unsolicited_burst_then_r2t() {
        let p = params();
        let cmd = write_cmd(10_000);
        let mut c = cmd.lock();
        c.unsolicited_data = true;
        c.first_burst_len = 1024;
        c.write_data_done = 1024;
        c.unsolicited.start = 1024;

        let pdu = data_out(RESERVED_TAG, 0, 1024, 3072, true);
        assert_eq!(check_pre_dataout(&mut c, &pdu, &p), DataOutResult::Normal);
        assert_eq!(check_post_dataout(&mut c, &pdu, &p, false), DataOutResult::SendR2t);
        assert!(!c.unsolicited_data);
        build_r2ts_for_cmd(&mut c, &p, false);
        assert_eq!(c.r2ts[0].offset, 4096);

        let past = data_out(RESERVED_TAG, 0, 4000, 1000, true);
        c.unsolicited_data = true;
        assert_eq!(check_pre_dataout(&mut c, &past, &p), DataOutResult::CannotRecover);
    }

    #[test]
    fn test_pdus_out_of_order_within_burst() {
        let p = SessionParams {
            data_pdu_in_order: false,
            ..params()
        };
        let cmd = write_cmd(4096);
        let mut c = cmd.lock();
        build_r2ts_for_cmd(&mut c, &p, false);
        send(&mut c, 0, 0x100);

        let tail = data_out(0x100, 0, 2048, 2048, false);
        assert_eq!(check_pre_dataout(&mut c, &tail, &p), DataOutResult::Normal);
        assert_eq!(check_post_dataout(&mut c, &tail, &p, false), DataOutResult::Normal);
        let head = data_out(0x100, 1, 0, 2048, true);
        assert_eq!(check_pre_dataout(&mut c, &head, &p), DataOutResult::Normal);
        assert_eq!(
            check_post_dataout(&mut c, &head, &p, false),
            DataOutResult::SendToTransport
        );
    }

    #[test]
    fn test_repeated_offsets_overrun_burst() {
        let p = SessionParams {
            data_pdu_in_order: false,
            ..params()
        };
        let cmd = write_cmd(8192);
        let mut c = cmd.lock();
        c.unsolicited_data = true;
        let first = data_out(RESERVED_TAG, 0, 0, 3072, false);
        assert_eq!(check_pre_dataout(&mut c, &first, &p), DataOutResult::Normal);
        assert_eq!(check_post_dataout(&mut c, &first, &p, false), DataOutResult::Normal);
        // same window again would push the unsolicited total past FirstBurstLength
        let again = data_out(RESERVED_TAG, 1, 0, 3072, true);
        assert_eq!(check_pre_dataout(&mut c, &again, &p), DataOutResult::Normal);
        assert_eq!(
            check_post_dataout(&mut c, &again, &p, false),
            DataOutResult::CannotRecover
        );

        let cmd = write_cmd(8192);
        let mut c = cmd.lock();
        build_r2ts_for_cmd(&mut c, &p, false);
        send(&mut c, 0, 0x100);
        let part = data_out(0x100, 0, 4096, 4096, false);
        check_pre_dataout(&mut c, &part, &p);
        assert_eq!(check_post_dataout(&mut c, &part, &p, false), DataOutResult::Normal);
        let dup = data_out(0x100, 1, 4096, 4096, false);
        assert_eq!(check_pre_dataout(&mut c, &dup, &p), DataOutResult::Normal);
        assert_eq!(c.r2ts[0].xfer_len, 8192);
        assert_eq!(check_post_dataout(&mut c, &dup, &p, false), DataOutResult::Normal);
        let over = data_out(0x100, 2, 0, 1024, true);
        assert_eq!(check_pre_dataout(&mut c, &over, &p), DataOutResult::Normal);
        assert_eq!(
            check_post_dataout(&mut c, &over, &p, false),
            DataOutResult::CannotRecover
        );
    }

    #[test]
    fn test_timeout_retransmission_covers_tail() {
        let p = SessionParams {
            error_recovery_level: 1,
            ..params()
        };
        let cmd = write_cmd(8192);
        let mut c = cmd.lock();
        build_r2ts_for_cmd(&mut c, &p, false);
        send(&mut c, 0, 0x100);
        let pdu = data_out(0x100, 0, 0, 1000, false);
        check_pre_dataout(&mut c, &pdu, &p);
        check_post_dataout(&mut c, &pdu, &p, false);

        assert_eq!(request_dataout_retransmission(&mut c, &p), 1);
        let r = c.r2ts.last().unwrap();
        assert_eq!((r.offset, r.xfer_len), (1000, 7192));
        assert_eq!(c.write_data_done, 1000);
        assert_eq!(c.outstanding_r2ts, 1);
    }

    #[test]
    fn test_sequence_list_out_of_order() {
        let p = SessionParams {
            data_sequence_in_order: false,
            initial_r2t: true,
            ..params()
        };
        let cmd = write_cmd(20_000);
        let mut c = cmd.lock();
        build_sequence_list(&mut c, &p, true);
        assert_eq!(c.seq_list.len(), 3);
        let mut offsets: Vec<u32> = c.seq_list.iter().map(|s| s.offset).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 8192, 16_384]);

        assert_eq!(build_r2ts_for_cmd(&mut c, &p, false), 2);
        c.outstanding_r2ts = 0;
        assert_eq!(build_r2ts_for_cmd(&mut c, &p, false), 1);
        assert!(c.sent_last_r2t);
    }
}
