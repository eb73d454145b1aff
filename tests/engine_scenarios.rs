//! End-to-end scenarios against a target on loopback
//!
//! Each test starts its own target on an ephemeral port with an in-memory
//! disk and drives it with the raw-PDU test initiator.

use iscsi_target::client::{write10_cdb, IscsiClient, LoginOptions};
use iscsi_target::pdu::{
    async_event, flags, login_status, logout_reason, opcode, reject_reason, snack_type, tmf_function, tmf_response,
    IscsiPdu, RESERVED_TAG,
};
use iscsi_target::{IscsiError, IscsiResult, IscsiTarget, RunningTarget, ScsiBlockDevice, TargetConfig};
use once_cell::sync::Lazy;
use std::thread;
use std::time::{Duration, Instant};

const TARGET: &str = "iqn.2026-10.test:engine.disk0";
const INITIATOR: &str = "iqn.2026-10.test:initiator";
const BLOCK: u32 = 512;

static LOGGING: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    fn new(blocks: usize) -> Self {
        MemDisk {
            data: vec![0u8; blocks * BLOCK as usize],
        }
    }
}

impl ScsiBlockDevice for MemDisk {
    fn read(&self, lba: u64, blocks: u32, block_size: u32) -> IscsiResult<Vec<u8>> {
        let start = (lba * block_size as u64) as usize;
        let end = start + (blocks * block_size) as usize;
        self.data
            .get(start..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| IscsiError::Scsi("read past end".into()))
    }

    fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> IscsiResult<()> {
        let start = (lba * block_size as u64) as usize;
        match self.data.get_mut(start..start + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                Ok(())
            }
            None => Err(IscsiError::Scsi("write past end".into())),
        }
    }

    fn capacity(&self) -> u64 {
        (self.data.len() / BLOCK as usize) as u64
    }

    fn block_size(&self) -> u32 {
        BLOCK
    }
}

fn quiet_config() -> TargetConfig {
    TargetConfig {
        nopin_timeout: 0,
        ..TargetConfig::default()
    }
}

fn start_target(config: TargetConfig) -> RunningTarget {
    Lazy::force(&LOGGING);
    IscsiTarget::builder()
        .bind_addr("127.0.0.1:0")
        .target_name(TARGET)
        .config(config)
        .build(MemDisk::new(2048))
        .expect("build target")
        .start()
        .expect("start target")
}

fn connect(target: &RunningTarget) -> IscsiClient {
    IscsiClient::connect(&target.local_addr().to_string()).expect("connect")
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// The connection was closed by the target
fn assert_closed(client: &mut IscsiClient) {
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    loop {
        match client.recv_pdu() {
            Ok(pdu) if pdu.opcode == opcode::NOP_IN && pdu.itt == RESERVED_TAG => continue,
            Ok(pdu) => panic!("expected the connection to close, got {}", pdu.opcode_name()),
            Err(IscsiError::Io(e)) => {
                let open = matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut);
                assert!(!open, "connection still open");
                return;
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }
}

fn nop_out(client: &mut IscsiClient, cmd_sn: u32, data: &[u8]) -> (u32, IscsiPdu) {
    let itt = client.alloc_itt();
    let pdu = IscsiPdu::nop_out(itt, RESERVED_TAG, 0, cmd_sn, client.exp_stat_sn(), false, data.to_vec());
    (itt, pdu)
}

#[test]
fn test_login_and_window() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    let result = client.login(INITIATOR, TARGET).unwrap();
    assert_ne!(result.tsih, 0);
    assert_eq!(result.key("TargetPortalGroupTag"), Some("1"));
    assert_eq!(result.key("HeaderDigest"), Some("None"));

    let exp = client.exp_cmd_sn();
    assert_eq!(client.max_cmd_sn(), exp.wrapping_add(63));

    let nop_in = client.ping(b"hello").unwrap();
    assert_eq!(nop_in.opcode, opcode::NOP_IN);
    assert_eq!(nop_in.data, b"hello");
    assert_eq!(nop_in.exp_cmd_sn(), exp.wrapping_add(1));
    assert_eq!(nop_in.max_cmd_sn(), exp.wrapping_add(64));

    client.logout().unwrap();
    assert!(wait_until(Duration::from_secs(5), || target.registry().is_empty()));
    target.shutdown().unwrap();
}

#[test]
fn test_write_with_r2t_then_read_back() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    let opts = LoginOptions {
        immediate_data: false,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    client.login_checked(&opts).unwrap();
    assert_eq!(client.immediate_data(), (false, true));

    let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let outcome = client.write10(16, &pattern, BLOCK).unwrap();
    assert_eq!(outcome.r2ts.len(), 1);
    let r2t = &outcome.r2ts[0];
    assert_eq!(r2t.data_sn(), 0, "first R2TSN");
    assert_eq!(r2t.buffer_offset(), 0);
    assert_eq!(r2t.residual_count(), 4096);
    assert_ne!(r2t.ttt(), RESERVED_TAG);

    // R2T carries the StatSN the response then takes
    let status_sn = outcome.stat_sn().unwrap();
    assert_eq!(r2t.stat_sn(), status_sn);

    let data = client.read10(16, 8, BLOCK).unwrap();
    assert_eq!(data, pattern);

    let nop_in = client.ping(&[]).unwrap();
    assert_eq!(nop_in.stat_sn(), status_sn.wrapping_add(2));

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_write_with_immediate_data() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();
    assert_eq!(client.immediate_data(), (true, true));

    let block = vec![0x5au8; BLOCK as usize];
    let outcome = client.write10(3, &block, BLOCK).unwrap();
    assert!(outcome.r2ts.is_empty());
    assert_eq!(client.read10(3, 1, BLOCK).unwrap(), block);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_read_spans_data_in_pdus() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    let opts = LoginOptions {
        max_recv_data_segment_length: 1024,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    client.login_checked(&opts).unwrap();

    let outcome = client
        .execute(&iscsi_target::client::read10_cdb(0, 8), 8 * BLOCK, &[])
        .unwrap();
    assert_eq!(outcome.data.len(), 4096);
    assert_eq!(outcome.data_in.len(), 4);
    for (i, pdu) in outcome.data_in.iter().enumerate() {
        assert_eq!(pdu.data_sn(), i as u32);
        assert_eq!(pdu.buffer_offset(), i as u32 * 1024);
    }
    assert_eq!(outcome.scsi_status(), Some(0));

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_nop_out_with_reserved_itt() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();

    let before = client.exp_stat_sn();
    let keepalive = IscsiPdu::nop_out(RESERVED_TAG, RESERVED_TAG, 0, client.cmd_sn(), before, true, Vec::new());
    client.send_pdu(&keepalive).unwrap();

    // no answer and no StatSN consumed
    let nop_in = client.ping(&[]).unwrap();
    assert_eq!(nop_in.stat_sn(), before);

    let bad = IscsiPdu::nop_out(RESERVED_TAG, RESERVED_TAG, 0, client.cmd_sn(), before, false, Vec::new());
    client.send_pdu(&bad).unwrap();
    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_eq!(reject.byte2, reject_reason::PROTOCOL_ERROR);
    assert_closed(&mut client);
    target.shutdown().unwrap();
}

#[test]
fn test_duplicate_cmd_sn_dropped() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();

    let first = client.cmd_sn();
    client.ping(&[]).unwrap();

    let (dup_itt, dup) = nop_out(&mut client, first, &[]);
    client.send_pdu(&dup).unwrap();
    let sn = client.take_cmd_sn();
    let (itt, ping) = nop_out(&mut client, sn, &[]);
    client.send_pdu(&ping).unwrap();

    let answer = client.recv_pdu().unwrap();
    assert_eq!(answer.opcode, opcode::NOP_IN);
    assert_eq!(answer.itt, itt);
    assert_ne!(answer.itt, dup_itt);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_cmd_sn_beyond_window_fails_connection() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();

    let beyond = client.max_cmd_sn().wrapping_add(5);
    let (_, ping) = nop_out(&mut client, beyond, &[]);
    client.send_pdu(&ping).unwrap();
    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_eq!(reject.byte2, reject_reason::PROTOCOL_ERROR);
    assert_closed(&mut client);
    target.shutdown().unwrap();
}

#[test]
fn test_unknown_opcode_rejected() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();

    let mut pdu = IscsiPdu::new();
    pdu.opcode = 0x1c;
    pdu.flags = 0x80;
    pdu.itt = client.alloc_itt();
    client.send_pdu(&pdu).unwrap();
    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_eq!(reject.byte2, reject_reason::COMMAND_NOT_SUPPORTED);
    assert_eq!(&reject.data[..4], &pdu.bhs_bytes()[..4]);
    assert_closed(&mut client);
    target.shutdown().unwrap();
}

#[test]
fn test_immediate_scsi_command_rejected() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();

    let itt = client.alloc_itt();
    let mut cmd = IscsiPdu::scsi_command(
        0,
        itt,
        client.cmd_sn(),
        client.exp_stat_sn(),
        0,
        &[0u8; 6],
        0x80,
        Vec::new(),
    );
    cmd.immediate = true;
    client.send_pdu(&cmd).unwrap();
    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_eq!(reject.byte2, reject_reason::INVALID_PDU_FIELD);
    assert_closed(&mut client);
    target.shutdown().unwrap();
}

#[test]
fn test_data_digest_error_at_erl0_fails_connection() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    let opts = LoginOptions {
        header_digest: true,
        data_digest: true,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    let result = client.login_checked(&opts).unwrap();
    assert_eq!(result.key("HeaderDigest"), Some("CRC32C"));
    assert_eq!(result.key("DataDigest"), Some("CRC32C"));

    // digests work both ways
    assert_eq!(client.ping(b"checked").unwrap().data, b"checked");

    let sn = client.take_cmd_sn();
    let (_, ping) = nop_out(&mut client, sn, b"corrupt");
    let mut wire = ping.encode(client.digests());
    let last = wire.len() - 1;
    wire[last] ^= 0xff;
    client.send_bytes(&wire).unwrap();
    assert_closed(&mut client);
    target.shutdown().unwrap();
}

#[test]
fn test_data_digest_error_at_erl1_drops_pdu() {
    let target = start_target(TargetConfig {
        default_erl: 1,
        ..quiet_config()
    });
    let mut client = connect(&target);
    let opts = LoginOptions {
        data_digest: true,
        error_recovery_level: 1,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    let result = client.login_checked(&opts).unwrap();
    assert_eq!(result.key("ErrorRecoveryLevel"), Some("1"));

    let sn = client.take_cmd_sn();
    let (itt, ping) = nop_out(&mut client, sn, b"retry me");
    let mut wire = ping.encode(client.digests());
    let last = wire.len() - 1;
    wire[last] ^= 0xff;
    client.send_bytes(&wire).unwrap();

    // the same CmdSN is retried once the corrupt copy is dropped
    client.send_pdu(&ping).unwrap();
    let nop_in = client.recv_for(itt).unwrap();
    assert_eq!(nop_in.opcode, opcode::NOP_IN);
    assert_eq!(nop_in.data, b"retry me");

    let sess = target.registry().find(client.tsih()).unwrap();
    assert_eq!(sess.digest_errors(), 1);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

fn erl1_client(target: &RunningTarget, mrdsl: u32) -> IscsiClient {
    let mut client = connect(target);
    let opts = LoginOptions {
        error_recovery_level: 1,
        max_recv_data_segment_length: mrdsl,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    client.login_checked(&opts).unwrap();
    client
}

fn erl1_config() -> TargetConfig {
    TargetConfig {
        default_erl: 1,
        ..quiet_config()
    }
}

#[test]
fn test_status_snack_resends_response() {
    let target = start_target(erl1_config());
    let mut client = erl1_client(&target, 8192);

    let outcome = client.write10(40, &[0x11u8; 1024], BLOCK).unwrap();
    let status = outcome.status.unwrap();
    let sn = status.stat_sn();

    // ExpStatSN still at `sn`, so the status is not yet acknowledged
    let snack = IscsiPdu::snack_request(snack_type::STATUS, 0, RESERVED_TAG, RESERVED_TAG, sn, sn, 1);
    client.send_pdu(&snack).unwrap();
    let again = client.recv_pdu().unwrap();
    assert_eq!(again.opcode, opcode::SCSI_RESPONSE);
    assert_eq!(again.itt, status.itt);
    assert_eq!(again.stat_sn(), sn);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_data_snack_resends_data_in() {
    let target = start_target(erl1_config());
    let mut client = erl1_client(&target, 1024);

    let pattern: Vec<u8> = (0..4096u32).map(|i| (i / 7) as u8).collect();
    client.write10(64, &pattern, BLOCK).unwrap();
    let outcome = client
        .execute(&iscsi_target::client::read10_cdb(64, 8), 8 * BLOCK, &[])
        .unwrap();
    assert_eq!(outcome.data_in.len(), 4);
    let itt = outcome.data_in[0].itt;
    let sn = outcome.stat_sn().unwrap();

    let snack = IscsiPdu::snack_request(snack_type::DATA_R2T, 0, itt, RESERVED_TAG, sn, 1, 2);
    client.send_pdu(&snack).unwrap();
    for data_sn in 1..3u32 {
        let pdu = client.recv_pdu().unwrap();
        assert_eq!(pdu.opcode, opcode::SCSI_DATA_IN);
        assert_eq!(pdu.itt, itt);
        assert_eq!(pdu.data_sn(), data_sn);
        let offset = pdu.buffer_offset() as usize;
        assert_eq!(offset, data_sn as usize * 1024);
        assert_eq!(pdu.data, pattern[offset..offset + 1024]);
    }

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_snack_refused() {
    let target = start_target(erl1_config());
    let mut client = erl1_client(&target, 8192);
    client.snack(snack_type::R_DATA, RESERVED_TAG, RESERVED_TAG, 0, 0).unwrap();
    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_eq!(reject.byte2, reject_reason::PROTOCOL_ERROR);
    assert_closed(&mut client);

    // no SNACK at all below ERL 1
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();
    client.snack(snack_type::STATUS, RESERVED_TAG, RESERVED_TAG, 0, 0).unwrap();
    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_closed(&mut client);
    target.shutdown().unwrap();
}

fn login_pair(target: &RunningTarget) -> (IscsiClient, IscsiClient) {
    login_pair_at(target, 0)
}

fn login_pair_at(target: &RunningTarget, erl: u8) -> (IscsiClient, IscsiClient) {
    let mut first = connect(target);
    let opts = LoginOptions {
        max_connections: 2,
        error_recovery_level: erl,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    first.login_checked(&opts).unwrap();

    let mut second = connect(target);
    let opts = LoginOptions {
        tsih: first.tsih(),
        cid: 1,
        ..opts
    };
    second.login_checked(&opts).unwrap();
    assert_eq!(second.tsih(), first.tsih());
    second.set_cmd_sn(first.cmd_sn());
    (first, second)
}

#[test]
fn test_cmd_sn_ordering_across_connections() {
    let target = start_target(quiet_config());
    let (mut first, mut second) = login_pair(&target);

    let next = first.cmd_sn();
    let (ahead_itt, ahead) = nop_out(&mut second, next.wrapping_add(1), b"second");
    second.send_pdu(&ahead).unwrap();

    second.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    assert!(second.recv_pdu().is_err(), "CmdSN ahead of the window must wait");
    second.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let nop_in = first.ping(b"first").unwrap();
    assert_eq!(nop_in.data, b"first");
    let released = second.recv_pdu().unwrap();
    assert_eq!(released.itt, ahead_itt);
    assert_eq!(released.data, b"second");
    assert_eq!(released.exp_cmd_sn(), next.wrapping_add(2));

    first.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_too_many_connections() {
    let target = start_target(quiet_config());
    let mut first = connect(&target);
    first.login(INITIATOR, TARGET).unwrap();

    let mut extra = connect(&target);
    let opts = LoginOptions {
        tsih: first.tsih(),
        cid: 1,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    let result = extra.login_with(&opts).unwrap();
    assert_eq!(result.status_class, login_status::INITIATOR_ERROR);
    assert_eq!(result.status_detail, login_status::DETAIL_TOO_MANY_CONNECTIONS);

    first.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_close_session_closes_every_connection() {
    let target = start_target(quiet_config());
    let (mut first, mut second) = login_pair(&target);

    let response = first.logout_with(0, 0).unwrap();
    assert_eq!(response.byte2, 0);
    assert_closed(&mut second);
    assert!(wait_until(Duration::from_secs(5), || target.registry().is_empty()));
    target.shutdown().unwrap();
}

#[test]
fn test_close_other_connection() {
    let target = start_target(quiet_config());
    let (mut first, mut second) = login_pair(&target);

    let response = first.logout_with(1, 1).unwrap();
    assert_eq!(response.byte2, 0);
    assert_closed(&mut second);

    let sess = target.registry().find(first.tsih()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || sess.connection_count() == 1));
    first.ping(&[]).unwrap();

    let response = first.logout_with(1, 7).unwrap();
    assert_eq!(response.byte2, 1, "CID not found");

    first.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_session_reinstatement() {
    let target = start_target(quiet_config());
    let mut old = connect(&target);
    old.login(INITIATOR, TARGET).unwrap();

    let mut new = connect(&target);
    new.login(INITIATOR, TARGET).unwrap();
    assert_ne!(new.tsih(), old.tsih());
    assert_closed(&mut old);
    assert!(target.registry().find(old.tsih()).is_none());
    assert_eq!(target.registry().len(), 1);

    new.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_login_refusals() {
    let target = start_target(quiet_config());

    let mut client = connect(&target);
    let result = client
        .login_with(&LoginOptions::normal(INITIATOR, "iqn.2026-10.test:nobody"))
        .unwrap();
    assert_eq!(result.status_class, login_status::INITIATOR_ERROR);
    assert_eq!(result.status_detail, login_status::DETAIL_NOT_FOUND);

    let mut client = connect(&target);
    let opts = LoginOptions {
        target_name: None,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    let result = client.login_with(&opts).unwrap();
    assert_eq!(result.status_detail, login_status::DETAIL_MISSING_PARAMETER);

    let mut client = connect(&target);
    let opts = LoginOptions {
        tsih: 0x7777,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    let result = client.login_with(&opts).unwrap();
    assert_eq!(result.status_detail, login_status::DETAIL_SESSION_DOES_NOT_EXIST);

    assert!(target.registry().is_empty());
    target.shutdown().unwrap();
}

#[test]
fn test_send_targets() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    let entries = client.discover(INITIATOR).unwrap();
    assert_eq!(entries[0], ("TargetName".to_string(), TARGET.to_string()));
    assert_eq!(
        entries[1],
        ("TargetAddress".to_string(), format!("{},1", target.local_addr()))
    );

    // discovery sessions carry no SCSI traffic
    let mut client = connect(&target);
    client.login_checked(&LoginOptions::discovery(INITIATOR)).unwrap();
    let only = client
        .text(&[("SendTargets".to_string(), TARGET.to_string())])
        .unwrap();
    assert_eq!(only.len(), 2);
    let none = client
        .text(&[("SendTargets".to_string(), "iqn.2026-10.test:nobody".to_string())])
        .unwrap();
    assert!(none.is_empty());
    client.send_scsi_command(&iscsi_target::client::read10_cdb(0, 1), BLOCK, &[]).unwrap();
    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_closed(&mut client);
    target.shutdown().unwrap();
}

#[test]
fn test_task_management_responses() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();

    let sn = client.cmd_sn();
    assert_eq!(
        client.task_mgmt(tmf_function::ABORT_TASK, 0x4242, sn, 0).unwrap(),
        tmf_response::TASK_DOES_NOT_EXIST
    );
    assert_eq!(
        client.task_mgmt(tmf_function::LOGICAL_UNIT_RESET, RESERVED_TAG, sn, 0).unwrap(),
        tmf_response::FUNCTION_COMPLETE
    );
    assert_eq!(
        client.task_mgmt(tmf_function::TARGET_WARM_RESET, RESERVED_TAG, sn, 0).unwrap(),
        tmf_response::AUTHORIZATION_FAILED
    );
    assert_eq!(
        client.task_mgmt(tmf_function::TASK_REASSIGN, 0x4242, sn, 0).unwrap(),
        tmf_response::REASSIGN_NOT_SUPPORTED
    );
    assert_eq!(client.task_mgmt(0x20, RESERVED_TAG, sn, 0).unwrap(), tmf_response::FUNCTION_NOT_SUPPORTED);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_target_requests_logout() {
    let target = start_target(quiet_config());
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();

    assert!(target.request_logout(client.tsih()));
    let msg = client.recv_pdu().unwrap();
    assert_eq!(msg.opcode, opcode::ASYNC_MESSAGE);
    let (event, _, _, wait) = msg.async_fields();
    assert_eq!(event, async_event::REQUEST_LOGOUT);
    assert_eq!(wait, 10);

    client.logout().unwrap();
    assert!(wait_until(Duration::from_secs(5), || target.registry().is_empty()));
    target.shutdown().unwrap();
}

#[test]
fn test_unsolicited_nop_in_keepalive() {
    let target = start_target(TargetConfig {
        nopin_timeout: 3,
        nopin_response_timeout: 3,
        ..TargetConfig::default()
    });
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();
    let before = client.exp_stat_sn();

    let nop_in = client.recv_pdu().unwrap();
    assert_eq!(nop_in.opcode, opcode::NOP_IN);
    assert_eq!(nop_in.itt, RESERVED_TAG);
    assert_ne!(nop_in.ttt(), RESERVED_TAG);
    assert_eq!(nop_in.stat_sn(), before);
    client.answer_nop_in(&nop_in).unwrap();

    // answered in time, so the connection survives the response timeout
    thread::sleep(Duration::from_millis(3500));
    let reply = client.ping(b"alive").unwrap();
    assert_eq!(reply.data, b"alive");

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_shutdown_frees_sessions() {
    let target = start_target(TargetConfig {
        logout_timeout: Duration::from_millis(200),
        ..quiet_config()
    });
    let mut client = connect(&target);
    client.login(INITIATOR, TARGET).unwrap();
    let registry = std::sync::Arc::clone(target.registry());

    target.shutdown().unwrap();
    assert!(registry.is_empty());
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let msg = client.recv_pdu().unwrap();
    assert_eq!(msg.opcode, opcode::ASYNC_MESSAGE);
    assert_closed(&mut client);
}

fn pattern(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32).map(|i| (i.wrapping_mul(seed) >> 3) as u8).collect()
}

/// Login that leaves all write data to R2Ts or unsolicited Data-Out
fn login_without_immediate(target: &RunningTarget, erl: u8, data_digest: bool, extra: Vec<(String, String)>) -> IscsiClient {
    let mut client = connect(target);
    let opts = LoginOptions {
        immediate_data: false,
        error_recovery_level: erl,
        data_digest,
        extra,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    client.login_checked(&opts).unwrap();
    client
}

#[test]
fn test_dataout_digest_error_at_erl0_fails_connection() {
    let target = start_target(quiet_config());
    let mut client = login_without_immediate(&target, 0, true, Vec::new());
    let data = pattern(4096, 13);

    let itt = client.send_scsi_command(&write10_cdb(500, 8), 0, &data).unwrap();
    let r2t = client.recv_for(itt).unwrap();
    assert_eq!(r2t.opcode, opcode::R2T);
    let dataout = IscsiPdu::scsi_data_out(0, itt, r2t.ttt(), client.exp_stat_sn(), 0, 0, true, data.clone());
    let mut wire = dataout.encode(client.digests());
    let last = wire.len() - 1;
    wire[last] ^= 0xff;
    client.send_bytes(&wire).unwrap();

    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    if let Ok(reject) = client.recv_pdu() {
        assert_eq!(reject.opcode, opcode::REJECT);
        assert_eq!(reject.byte2, reject_reason::DATA_DIGEST_ERROR);
        assert_closed(&mut client);
    }
    target.shutdown().unwrap();
}

#[test]
fn test_dataout_digest_error_at_erl1_resolicits_burst() {
    let target = start_target(erl1_config());
    let mut client = login_without_immediate(&target, 1, true, Vec::new());
    let data = pattern(4096, 17);

    let itt = client.send_scsi_command(&write10_cdb(520, 8), 0, &data).unwrap();
    let r2t = client.recv_for(itt).unwrap();
    assert_eq!(r2t.opcode, opcode::R2T);
    let dataout = IscsiPdu::scsi_data_out(0, itt, r2t.ttt(), client.exp_stat_sn(), 0, 0, true, data.clone());
    let mut wire = dataout.encode(client.digests());
    let last = wire.len() - 1;
    wire[last] ^= 0xff;
    client.send_bytes(&wire).unwrap();

    // the corrupt burst is dropped and asked for again in full
    let recovery = client.recv_for(itt).unwrap();
    assert_eq!(recovery.opcode, opcode::R2T);
    assert_eq!(recovery.buffer_offset(), 0);
    assert_eq!(recovery.residual_count(), 4096);
    client.answer_r2t(&recovery, &data).unwrap();
    let outcome = client.complete(itt, &data).unwrap();
    assert_eq!(outcome.scsi_status(), Some(0));

    let sess = target.registry().find(client.tsih()).unwrap();
    assert_eq!(sess.digest_errors(), 1);
    assert_eq!(client.read10(520, 8, BLOCK).unwrap(), data);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_out_of_order_data_negotiated() {
    let target = start_target(TargetConfig {
        data_sequence_in_order: false,
        data_pdu_in_order: false,
        random_r2t_offsets: true,
        max_outstanding_r2t: 4,
        max_burst_length: 1024,
        first_burst_length: 1024,
        ..quiet_config()
    });
    let mut client = connect(&target);
    let opts = LoginOptions {
        immediate_data: false,
        extra: vec![
            ("DataSequenceInOrder".into(), "No".into()),
            ("DataPDUInOrder".into(), "No".into()),
        ],
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    let result = client.login_checked(&opts).unwrap();
    assert_eq!(result.key("DataSequenceInOrder"), Some("No"));
    assert_eq!(result.key("DataPDUInOrder"), Some("No"));

    let data = pattern(4096, 29);
    let itt = client.send_scsi_command(&write10_cdb(300, 8), 0, &data).unwrap();
    let mut offsets = Vec::new();
    let status = loop {
        let pdu = client.recv_for(itt).unwrap();
        match pdu.opcode {
            opcode::R2T => {
                let offset = pdu.buffer_offset() as usize;
                let end = offset + pdu.residual_count() as usize;
                offsets.push(offset);
                // the back half of each burst goes out first
                let half = offset + (end - offset) / 2;
                let exp = client.exp_stat_sn();
                let tail = IscsiPdu::scsi_data_out(0, itt, pdu.ttt(), exp, 0, half as u32, false, data[half..end].to_vec());
                let head = IscsiPdu::scsi_data_out(0, itt, pdu.ttt(), exp, 1, offset as u32, true, data[offset..half].to_vec());
                client.send_pdu(&tail).unwrap();
                client.send_pdu(&head).unwrap();
            }
            opcode::SCSI_RESPONSE => break pdu,
            _ => panic!("unexpected {}", pdu.opcode_name()),
        }
    };
    assert_eq!(status.byte3, 0);
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 1024, 2048, 3072]);
    assert_eq!(client.read10(300, 8, BLOCK).unwrap(), data);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_outstanding_r2ts_bounded() {
    let target = start_target(TargetConfig {
        max_outstanding_r2t: 2,
        max_burst_length: 1024,
        first_burst_length: 1024,
        ..quiet_config()
    });
    let mut client = connect(&target);
    let opts = LoginOptions {
        immediate_data: false,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    let result = client.login_checked(&opts).unwrap();
    assert_eq!(result.key("MaxOutstandingR2T"), Some("2"));

    let data = pattern(8192, 31);
    let itt = client.send_scsi_command(&write10_cdb(200, 16), 0, &data).unwrap();
    let mut pending: Vec<IscsiPdu> = Vec::new();
    let mut solicited = 0;
    let mut peak = 0;
    let mut r2ts = 0;
    let status = loop {
        let pdu = client.recv_for(itt).unwrap();
        match pdu.opcode {
            opcode::R2T => {
                r2ts += 1;
                solicited += pdu.residual_count() as usize;
                pending.push(pdu);
                peak = peak.max(pending.len());
                assert!(pending.len() <= 2, "more R2Ts outstanding than negotiated");
                // hold R2Ts back until the window is full or nothing more can come
                while pending.len() == 2 || (solicited == data.len() && !pending.is_empty()) {
                    let r2t = pending.remove(0);
                    client.answer_r2t(&r2t, &data).unwrap();
                }
            }
            opcode::SCSI_RESPONSE => break pdu,
            _ => panic!("unexpected {}", pdu.opcode_name()),
        }
    };
    assert_eq!(status.byte3, 0);
    assert_eq!(peak, 2);
    assert_eq!(r2ts, 8);
    assert_eq!(client.read10(200, 16, BLOCK).unwrap(), data);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_unsolicited_data_out_with_initial_r2t_off() {
    let target = start_target(TargetConfig {
        max_burst_length: 8192,
        first_burst_length: 4096,
        ..quiet_config()
    });
    let mut client = connect(&target);
    let opts = LoginOptions {
        immediate_data: false,
        initial_r2t: false,
        ..LoginOptions::normal(INITIATOR, TARGET)
    };
    let result = client.login_checked(&opts).unwrap();
    assert_eq!(result.key("InitialR2T"), Some("No"));
    assert_eq!(client.immediate_data(), (false, false));

    // fits the first burst: no R2T at all
    let small = pattern(4096, 37);
    let outcome = client.write10(600, &small, BLOCK).unwrap();
    assert!(outcome.r2ts.is_empty());

    // the rest past FirstBurstLength is solicited
    let large = pattern(12288, 41);
    let outcome = client.write10(700, &large, BLOCK).unwrap();
    assert_eq!(outcome.r2ts.len(), 1);
    assert_eq!(outcome.r2ts[0].buffer_offset(), 4096);
    assert_eq!(outcome.r2ts[0].residual_count(), 8192);

    assert_eq!(client.read10(600, 8, BLOCK).unwrap(), small);
    assert_eq!(client.read10(700, 24, BLOCK).unwrap(), large);

    client.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_orphaned_cmd_sn_refilled_on_surviving_connection() {
    let target = start_target(erl1_config());
    let (mut first, mut second) = login_pair_at(&target, 1);
    let sess = target.registry().find(first.tsih()).unwrap();

    let next = first.cmd_sn();
    let (_, ahead) = nop_out(&mut second, next.wrapping_add(1), b"lost");
    second.send_pdu(&ahead).unwrap();
    thread::sleep(Duration::from_millis(200));
    drop(second);
    assert!(wait_until(Duration::from_secs(5), || sess.connection_count() == 1));

    // the initiator retries the lost CmdSN on the connection that survived
    let (retry_itt, retry) = nop_out(&mut first, next.wrapping_add(1), b"retried");
    first.send_pdu(&retry).unwrap();
    let (gap_itt, gap) = nop_out(&mut first, next, b"gap");
    first.send_pdu(&gap).unwrap();
    first.set_cmd_sn(next.wrapping_add(2));

    assert_eq!(first.recv_for(gap_itt).unwrap().data, b"gap");
    let released = first.recv_for(retry_itt).unwrap();
    assert_eq!(released.data, b"retried");
    assert_eq!(released.exp_cmd_sn(), next.wrapping_add(2));

    first.logout().unwrap();
    target.shutdown().unwrap();
}

fn erl2_config() -> TargetConfig {
    TargetConfig {
        default_erl: 2,
        ..quiet_config()
    }
}

/// Start a WRITE(10) that gets its R2T but never any data
fn stall_write(client: &mut IscsiClient, itt: u32, lba: u32, len: u32, exp_stat_sn: u32) -> u32 {
    let cmd_sn = client.take_cmd_sn();
    let cdb = write10_cdb(lba, (len / BLOCK) as u16);
    let cmd = IscsiPdu::scsi_command(0, itt, cmd_sn, exp_stat_sn, len, &cdb, flags::WRITE | flags::FINAL, Vec::new());
    client.send_pdu(&cmd).unwrap();
    let r2t = client.recv_for(itt).unwrap();
    assert_eq!(r2t.opcode, opcode::R2T);
    cmd_sn
}

#[test]
fn test_connection_recovery_and_task_reassign() {
    let target = start_target(erl2_config());
    let (mut first, mut second) = login_pair_at(&target, 2);
    second.set_next_itt(0x1000);

    let data = pattern(4096, 43);
    let exp = second.exp_stat_sn();
    let ref_cmd_sn = stall_write(&mut second, 0x1000, 800, 4096, exp);
    first.set_cmd_sn(second.cmd_sn());
    drop(second);

    let msg = first.recv_pdu().unwrap();
    assert_eq!(msg.opcode, opcode::ASYNC_MESSAGE);
    let (event, cid, _, time2retain) = msg.async_fields();
    assert_eq!(event, async_event::DROP_CONNECTION);
    assert_eq!(cid, 1);
    assert_eq!(time2retain, 20);

    let response = first.task_mgmt(tmf_function::TASK_REASSIGN, 0x7777, 0, 0).unwrap();
    assert_eq!(response, tmf_response::TASK_DOES_NOT_EXIST);
    let response = first
        .task_mgmt(tmf_function::TASK_REASSIGN, 0x1000, ref_cmd_sn, 0)
        .unwrap();
    assert_eq!(response, tmf_response::FUNCTION_COMPLETE);

    // the write resumes on the surviving connection from offset 0
    let outcome = first.complete(0x1000, &data).unwrap();
    assert_eq!(outcome.r2ts.len(), 1);
    assert_eq!(outcome.r2ts[0].buffer_offset(), 0);
    assert_eq!(outcome.scsi_status(), Some(0));
    assert_eq!(first.read10(800, 8, BLOCK).unwrap(), data);

    first.logout().unwrap();
    target.shutdown().unwrap();
}

#[test]
fn test_remove_connection_for_recovery_prunes_acknowledged() {
    let target = start_target(erl2_config());
    let (mut first, mut second) = login_pair_at(&target, 2);
    second.set_next_itt(0x1000);

    let done = pattern(1024, 47);
    let outcome = second.write10(900, &done, BLOCK).unwrap();
    let done_itt = outcome.status.as_ref().unwrap().itt;
    let done_sn = outcome.stat_sn().unwrap();

    // ExpStatSN on the stalled write leaves the finished one unacknowledged
    let data = pattern(4096, 53);
    let ref_cmd_sn = stall_write(&mut second, 0x2000, 920, 4096, done_sn);
    first.set_cmd_sn(second.cmd_sn());

    // the logout carries the last ExpStatSN of the connection being removed
    let itt = first.alloc_itt();
    let logout = IscsiPdu::logout_request(
        itt,
        logout_reason::REMOVE_CONNECTION_FOR_RECOVERY,
        1,
        first.cmd_sn(),
        second.exp_stat_sn(),
    );
    first.send_pdu(&logout).unwrap();
    let response = first.recv_for(itt).unwrap();
    assert_eq!(response.opcode, opcode::LOGOUT_RESPONSE);
    assert_eq!(response.byte2, 0);
    assert_closed(&mut second);

    let response = first.task_mgmt(tmf_function::TASK_REASSIGN, done_itt, 0, 0).unwrap();
    assert_eq!(response, tmf_response::TASK_DOES_NOT_EXIST);
    let response = first
        .task_mgmt(tmf_function::TASK_REASSIGN, 0x2000, ref_cmd_sn, 0)
        .unwrap();
    assert_eq!(response, tmf_response::FUNCTION_COMPLETE);
    let outcome = first.complete(0x2000, &data).unwrap();
    assert_eq!(outcome.scsi_status(), Some(0));

    assert_eq!(first.read10(900, 2, BLOCK).unwrap(), done);
    assert_eq!(first.read10(920, 8, BLOCK).unwrap(), data);

    first.logout().unwrap();
    target.shutdown().unwrap();
}
