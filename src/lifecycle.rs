//! Connection and session lifecycle: thread start-up, teardown, timers
//!
//! Every connection runs one receive and one transmit thread. Whichever of
//! the two exits last runs [`close_connection`], which decides the fate of
//! the session once the connection is gone: keep it for reinstatement,
//! start Time2Retain, or close it outright.

use crate::command::{CmdHandle, CmdInner, CmdKind, CmdState, Command};
use crate::connection::{ConnState, Connection, ReinstateState};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{async_event, RESERVED_TAG};
use crate::recovery;
use crate::rx;
use crate::session::{Session, SessionState};
use crate::timer::TimerService;
use crate::tx;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

// ---- connection threads ----

/// Spawn the receive and transmit threads of a logged-in connection
pub(crate) fn start_connection_threads(conn: &Arc<Connection>) -> IscsiResult<()> {
    let tag = format!("{}-{}", conn.session.tsih, conn.cid);
    conn.live_threads.store(2, Ordering::SeqCst);

    let rx_conn = Arc::clone(conn);
    thread::Builder::new()
        .name(format!("iscsi-rx-{}", tag))
        .spawn(move || {
            let result = rx::rx_thread(&rx_conn);
            thread_exit(&rx_conn, "rx", result);
        })
        .map_err(IscsiError::Io)?;

    let tx_conn = Arc::clone(conn);
    let spawned = thread::Builder::new()
        .name(format!("iscsi-tx-{}", tag))
        .spawn(move || {
            let result = tx::tx_thread(&tx_conn);
            thread_exit(&tx_conn, "tx", result);
        });
    if let Err(e) = spawned {
        error!("CID {}: could not start transmit thread: {}", conn.cid, e);
        // the receive thread runs the teardown alone
        conn.live_threads.fetch_sub(1, Ordering::SeqCst);
        conn.request_stop();
        return Err(IscsiError::Io(e));
    }

    start_nopin_timer(conn);
    Ok(())
}

fn thread_exit(conn: &Arc<Connection>, which: &str, result: IscsiResult<()>) {
    match result {
        Ok(()) => debug!("CID {}: {} thread finished", conn.cid, which),
        Err(IscsiError::ConnectionClosed) => debug!("CID {}: {} thread saw the connection close", conn.cid, which),
        Err(IscsiError::Io(e)) => {
            info!("CID {}: {} thread transport error: {}", conn.cid, which, e);
            conn.flags().transport_failed = true;
        }
        Err(e) => {
            warn!("CID {}: {} thread failing connection: {}", conn.cid, which, e);
            conn.flags().transport_failed = true;
        }
    }
    conn.request_stop();
    if conn.live_threads.fetch_sub(1, Ordering::SeqCst) == 1 {
        close_connection(conn);
    }
}

/// Force a connection down
///
/// With `wait`, blocks until teardown has finished. Never wait from the
/// connection's own threads.
pub(crate) fn cause_connection_reinstatement(conn: &Arc<Connection>, wait: bool) {
    let first = conn.reinstate.update(|s| {
        if *s == ReinstateState::Active {
            *s = ReinstateState::Requested;
            true
        } else {
            false
        }
    });
    if first {
        debug!("TSIH {} CID {}: reinstatement requested", conn.session.tsih, conn.cid);
    }
    conn.request_stop();
    if wait {
        conn.reinstate.wait_until(|s| *s == ReinstateState::Closed, None);
    }
}

/// Mark a connection failed and bring it down without waiting
pub(crate) fn fail_connection(conn: &Arc<Connection>) {
    conn.flags().transport_failed = true;
    cause_connection_reinstatement(conn, false);
}

// ---- command release ----

/// Retire a command: unlink it and free what the backend still holds
pub(crate) fn release_cmd(conn: &Arc<Connection>, cmd: &CmdHandle) {
    conn.remove_cmd(cmd);
    release_detached(&conn.session, cmd);
}

/// Release a command that is no longer on any connection list
pub(crate) fn release_detached(sess: &Session, cmd: &CmdHandle) {
    let (itt, backend_owned, slot) = {
        let mut c = cmd.lock();
        stop_dataout_timer(&sess.ctx.timers, &mut c);
        c.state = CmdState::Remove;
        c.aborted = true;
        c.buffer = None;
        (c.itt, std::mem::take(&mut c.backend_owned), c.take_window_slot())
    };
    if slot {
        sess.increment_max_cmd_sn();
    }
    if backend_owned {
        sess.ctx.backend.release_task(itt);
    }
    trace!("ITT 0x{:08x} released", itt);
}

fn release_all_commands(conn: &Arc<Connection>) -> usize {
    let cmds = conn.take_commands();
    for cmd in &cmds {
        release_detached(&conn.session, cmd);
    }
    cmds.len()
}

// ---- connection and session teardown ----

/// Tear down a connection whose threads have both exited
pub(crate) fn close_connection(conn: &Arc<Connection>) {
    let sess = Arc::clone(&conn.session);
    conn.reinstate.set(ReinstateState::TearingDown);
    conn.logout_done.complete();
    conn.request_stop();

    let was_in_logout = conn.state() == ConnState::InLogout;
    conn.set_state(ConnState::CleanupWait);
    stop_nopin_timer(conn);
    stop_nopin_response_timer(conn);
    let dropped = conn.queues.drain();
    if dropped > 0 {
        debug!("CID {}: dropped {} queued responses", conn.cid, dropped);
    }

    let erl = sess.erl();
    let connection_recovery = {
        let sf = sess.flags();
        let mut cf = conn.flags();
        let recover = cf.connection_recovery
            || (erl == 2 && !was_in_logout && !cf.logout_remove && !sf.logout && !sf.reinstatement && !sf.fall_back_to_erl0);
        cf.connection_recovery = recover && erl == 2;
        cf.connection_recovery
    };

    let orphaned = sess.window.lock().orphan_for_conn(conn.cid);
    if !orphaned.is_empty() {
        debug!(
            "CID {}: {} out-of-order commands left their CmdSN slots open",
            conn.cid,
            orphaned.len()
        );
    }

    if connection_recovery {
        recovery::prepare_cmds_for_reassign(conn);
    } else {
        let released = release_all_commands(conn);
        trace!("CID {}: released {} commands", conn.cid, released);
    }

    let logout_unsent = {
        let mut cf = conn.flags();
        std::mem::take(&mut cf.logout_remove)
    };
    if logout_unsent {
        // the logout was accepted but its response never made it out
        let mut sf = sess.flags();
        sf.reinstatement = false;
        sf.fall_back_to_erl0 = true;
    }

    let remaining = sess.remove_connection(conn);
    if connection_recovery && remaining > 0 {
        recovery::send_conn_drop_async(&sess, conn.cid);
    }

    conn.usage.wait_zero();
    conn.shutdown_transport();
    conn.set_state(ConnState::Free);
    conn.reinstate.set(ReinstateState::Closed);
    info!(
        "TSIH {} CID {} closed ({} connection(s) left)",
        sess.tsih, conn.cid, remaining
    );

    let replaced = conn.flags().replaced;
    let mut sf = sess.flags();
    if replaced && !sf.reinstatement && !sf.logout {
        // the replacing connection joins the session next
        return;
    }
    if erl == 0 && !was_in_logout && !sf.logout {
        sf.fall_back_to_erl0 = true;
    }

    if remaining > 0 {
        if (sf.reinstatement || sf.fall_back_to_erl0) && !sf.stop_active && !sf.logout {
            sf.stop_active = true;
            drop(sf);
            stop_session(&sess, false);
        }
        return;
    }

    if sf.reinstatement {
        drop(sf);
        sess.state.set(SessionState::Failed);
        return;
    }
    if sf.fall_back_to_erl0 || sf.logout || was_in_logout {
        drop(sf);
        close_session(&sess);
        return;
    }
    let continuation = sf.continuation;
    drop(sf);
    sess.state.set(SessionState::Failed);
    if !continuation {
        start_time2retain(&sess);
    }
}

/// Stop every connection of a session
pub(crate) fn stop_session(sess: &Arc<Session>, wait: bool) {
    for conn in sess.connections() {
        cause_connection_reinstatement(&conn, wait);
    }
}

/// Release a session once its last connection is gone
///
/// Idempotent; the session leaves the registry here.
pub(crate) fn close_session(sess: &Arc<Session>) {
    {
        let mut sf = sess.flags();
        if sf.closed {
            return;
        }
        sf.closed = true;
    }
    cancel_timer(&sess.ctx.timers, &sess.time2retain_timer);
    cancel_timer(&sess.ctx.timers, &sess.async_logout_timer);
    stop_session(sess, false);
    sess.usage.wait_zero();

    let records = std::mem::take(&mut *sess.recovery.lock());
    for record in records {
        for cmd in &record.cmds {
            release_detached(sess, cmd);
        }
    }
    sess.window.lock().clear();
    sess.state.set(SessionState::Free);
    if let Some(registry) = sess.registry() {
        registry.unregister(sess);
    }
    info!("session TSIH {} ({}) released", sess.tsih, sess.initiator_name);
}

/// Close a session for reinstatement or target shutdown
///
/// Blocks until every connection has been torn down.
pub(crate) fn free_session(sess: &Arc<Session>) {
    info!("freeing session TSIH {}", sess.tsih);
    {
        let mut sf = sess.flags();
        sf.reinstatement = true;
        sf.stop_active = true;
    }
    stop_session(sess, true);
    close_session(sess);
}

/// Drop all connections after a DROP_ALL_CONNECTIONS async event went out
pub(crate) fn drop_session(sess: &Arc<Session>) {
    {
        let mut sf = sess.flags();
        sf.reinstatement = false;
        sf.fall_back_to_erl0 = true;
        sf.stop_active = true;
    }
    info!("dropping all connections of TSIH {}", sess.tsih);
    stop_session(sess, false);
}

fn start_time2retain(sess: &Arc<Session>) {
    let secs = sess.params.default_time2retain;
    if secs == 0 {
        close_session(sess);
        return;
    }
    info!("TSIH {} failed, retaining state for {}s", sess.tsih, secs);
    let weak = Arc::downgrade(sess);
    let id = sess
        .ctx
        .timers
        .schedule(Duration::from_secs(secs as u64), move || time2retain_expired(weak));
    *sess.time2retain_timer.lock() = Some(id);
}

fn time2retain_expired(sess: Weak<Session>) {
    let Some(sess) = sess.upgrade() else {
        return;
    };
    *sess.time2retain_timer.lock() = None;
    if sess.state() != SessionState::Failed {
        return;
    }
    info!("Time2Retain expired for TSIH {}", sess.tsih);
    close_session(&sess);
}

pub(crate) fn stop_time2retain(sess: &Session) {
    cancel_timer(&sess.ctx.timers, &sess.time2retain_timer);
}

fn cancel_timer(timers: &TimerService, slot: &Mutex<Option<crate::timer::TimerId>>) {
    if let Some(id) = slot.lock().take() {
        timers.cancel(id);
    }
}

// ---- target-initiated logout ----

/// Ask the initiator to log a session out (async event 1)
///
/// If it has not done so within the advertised time, every connection of
/// the session is dropped. Returns false when the session has no logged-in
/// connection to carry the request.
pub(crate) fn request_logout(sess: &Arc<Session>) -> bool {
    let timeout = sess.ctx.config.async_logout_timeout;
    let Some(conn) = sess.connections().into_iter().find(|c| c.state() == ConnState::LoggedIn) else {
        return false;
    };
    info!("TSIH {}: requesting logout within {}s", sess.tsih, timeout);
    recovery::queue_async_message(&conn, async_event::REQUEST_LOGOUT, 0, 0, timeout);

    let weak = Arc::downgrade(sess);
    let id = sess
        .ctx
        .timers
        .schedule(Duration::from_secs(timeout as u64), move || async_logout_expired(weak));
    if let Some(old) = sess.async_logout_timer.lock().replace(id) {
        sess.ctx.timers.cancel(old);
    }
    true
}

fn async_logout_expired(sess: Weak<Session>) {
    let Some(sess) = sess.upgrade() else {
        return;
    };
    *sess.async_logout_timer.lock() = None;
    if sess.flags().closed {
        return;
    }
    warn!("TSIH {} ignored the logout request", sess.tsih);
    let carrier = sess.connections().into_iter().find(|c| c.state() == ConnState::LoggedIn);
    match carrier {
        Some(conn) => recovery::queue_async_message(
            &conn,
            async_event::DROP_ALL_CONNECTIONS,
            0,
            sess.params.default_time2wait,
            sess.params.default_time2retain,
        ),
        None => drop_session(&sess),
    }
}

// ---- Data-Out timer ----

pub(crate) fn stop_dataout_timer(timers: &TimerService, c: &mut CmdInner) {
    if let Some(id) = c.dataout_timer.take() {
        timers.cancel(id);
    }
}

fn arm_dataout_timer(conn: &Arc<Connection>, cmd: &CmdHandle, c: &mut CmdInner) {
    let ctx = &conn.session.ctx;
    let weak = Arc::downgrade(cmd);
    let id = ctx
        .timers
        .schedule(ctx.config.dataout_timeout(), move || dataout_timeout(weak));
    c.dataout_timer = Some(id);
}

/// Start waiting for Data-Out on `cmd` unless a timer already runs
pub(crate) fn start_dataout_timer(conn: &Arc<Connection>, cmd: &CmdHandle) {
    let mut c = cmd.lock();
    if c.dataout_timer.is_some() || c.got_last_dataout || c.aborted {
        return;
    }
    arm_dataout_timer(conn, cmd, &mut c);
}

/// Push a running Data-Out timer back to a full period
pub(crate) fn mod_dataout_timer(conn: &Arc<Connection>, cmd: &CmdHandle) {
    let mut c = cmd.lock();
    let Some(id) = c.dataout_timer.take() else {
        return;
    };
    conn.session.ctx.timers.cancel(id);
    arm_dataout_timer(conn, cmd, &mut c);
}

fn dataout_timeout(cmd: Weak<Command>) {
    let Some(cmd) = cmd.upgrade() else {
        return;
    };
    let Some(conn) = cmd.connection() else {
        return;
    };
    let _usage = conn.usage.hold();
    let sess = &conn.session;
    let config = &sess.ctx.config;

    let mut c = cmd.lock();
    c.dataout_timer = None;
    if c.got_last_dataout || c.aborted || c.state == CmdState::Remove {
        return;
    }
    if sess.erl() == 0 {
        warn!(
            "ITT 0x{:08x}: no Data-Out within {}s at ERL 0, failing connection",
            c.itt, config.dataout_timeout
        );
        drop(c);
        fail_connection(&conn);
        return;
    }
    c.dataout_retries += 1;
    if c.dataout_retries > config.dataout_timeout_retries {
        warn!(
            "ITT 0x{:08x}: Data-Out recovery gave up after {} attempts",
            c.itt, config.dataout_timeout_retries
        );
        drop(c);
        fail_connection(&conn);
        return;
    }
    crate::dataout::request_dataout_retransmission(&mut c, &sess.params);
    let n = c.take_unqueued_r2ts();
    info!(
        "ITT 0x{:08x}: Data-Out timeout, re-requesting with {} recovery R2T(s) (attempt {})",
        c.itt, n, c.dataout_retries
    );
    arm_dataout_timer(&conn, &cmd, &mut c);
    drop(c);
    for _ in 0..n {
        conn.queues.push_immediate(Arc::clone(&cmd), CmdState::SendR2t);
    }
}

// ---- NOP-In keepalive ----

/// Arm the idle timer that sends a NOP-In ping
pub(crate) fn start_nopin_timer(conn: &Arc<Connection>) {
    let sess = &conn.session;
    if sess.is_discovery() {
        return;
    }
    let Some(delay) = sess.ctx.config.nopin_timeout() else {
        return;
    };
    let mut slot = conn.nopin_timer.lock();
    if slot.is_some() || conn.cancel.is_cancelled() {
        return;
    }
    let weak = Arc::downgrade(conn);
    *slot = Some(sess.ctx.timers.schedule(delay, move || nopin_timeout(weak)));
}

pub(crate) fn stop_nopin_timer(conn: &Connection) {
    cancel_timer(&conn.session.ctx.timers, &conn.nopin_timer);
}

fn nopin_timeout(conn: Weak<Connection>) {
    let Some(conn) = conn.upgrade() else {
        return;
    };
    *conn.nopin_timer.lock() = None;
    if conn.state() != ConnState::LoggedIn || conn.cancel.is_cancelled() {
        return;
    }
    let _usage = conn.usage.hold();
    let cmd = Command::new(CmdKind::NopIn, &conn);
    let ttt = conn.session.next_ttt();
    {
        let mut c = cmd.lock();
        c.itt = RESERVED_TAG;
        c.ttt = ttt;
        c.state = CmdState::SendNopInWantResponse;
    }
    trace!("CID {}: idle, pinging with TTT 0x{:08x}", conn.cid, ttt);
    conn.add_cmd(Arc::clone(&cmd));
    conn.queues.push_immediate(cmd, CmdState::SendNopInWantResponse);
}

/// Give the initiator a bounded time to answer a NOP-In ping
pub(crate) fn start_nopin_response_timer(conn: &Arc<Connection>) {
    let timers = &conn.session.ctx.timers;
    let delay = conn.session.ctx.config.nopin_response_timeout();
    let weak = Arc::downgrade(conn);
    let id = timers.schedule(delay, move || nopin_response_timeout(weak));
    if let Some(old) = conn.nopin_response_timer.lock().replace(id) {
        timers.cancel(old);
    }
}

pub(crate) fn stop_nopin_response_timer(conn: &Connection) {
    cancel_timer(&conn.session.ctx.timers, &conn.nopin_response_timer);
}

fn nopin_response_timeout(conn: Weak<Connection>) {
    let Some(conn) = conn.upgrade() else {
        return;
    };
    *conn.nopin_response_timer.lock() = None;
    if conn.cancel.is_cancelled() {
        return;
    }
    warn!(
        "TSIH {} CID {}: NOP-In ping unanswered after {}s, failing connection",
        conn.session.tsih, conn.cid, conn.session.ctx.config.nopin_response_timeout
    );
    fail_connection(&conn);
}
