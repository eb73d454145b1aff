//! One TCP connection of a session
//!
//! The receive thread owns the read side of the transport and the transmit
//! thread the write side. Everything else on a [`Connection`] is shared with
//! backend completions, timers and other connections of the same session.
//!
//! Lock order: session window, session connection list, connection
//! internals (`state`, `commands`, `flags`), command, queues.

use crate::command::{CmdHandle, CmdKind, CmdState};
use crate::digest::{self, DigestSettings, DIGEST_LEN};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{serial, IscsiPdu};
use crate::queue::ConnQueues;
use crate::session::Session;
use crate::sgl::ScatterList;
use crate::sync::{CancelToken, Completion, UsageCount, Watch};
use crate::timer::TimerId;
use crate::transport::Transport;
use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Connection state (RFC 3720 Section 7.1.3, target side)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Free,
    InLogin,
    LoggedIn,
    InLogout,
    LogoutRequested,
    CleanupWait,
}

/// Progress of a forced close, awaited by whoever requested it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinstateState {
    Active,
    Requested,
    TearingDown,
    Closed,
}

/// Per-connection negotiated values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    /// Largest data segment we accept
    pub max_recv_data_segment_length: u32,
    /// Largest data segment the initiator accepts
    pub max_xmit_data_segment_length: u32,
    pub digests: DigestSettings,
}

impl Default for ConnParams {
    fn default() -> Self {
        ConnParams {
            max_recv_data_segment_length: 8192,
            max_xmit_data_segment_length: 8192,
            digests: DigestSettings::none(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ConnFlags {
    /// Logged out with CLOSE_CONNECTION or CLOSE_SESSION
    pub logout_remove: bool,
    /// Keep this connection's tasks for ERL 2 reassignment
    pub connection_recovery: bool,
    /// The transport failed rather than being closed by logout
    pub transport_failed: bool,
    /// A new login with the same CID took over
    pub replaced: bool,
}

/// A received data segment
#[derive(Debug)]
pub(crate) struct Payload {
    pub data: Vec<u8>,
    pub digest_ok: bool,
}

pub struct Connection {
    pub cid: u16,
    pub session: Arc<Session>,
    pub params: ConnParams,

    state: Mutex<ConnState>,
    stat_sn: AtomicU32,
    exp_stat_sn: AtomicU32,
    commands: Mutex<Vec<CmdHandle>>,
    flags: Mutex<ConnFlags>,

    pub(crate) queues: ConnQueues,
    pub(crate) usage: UsageCount,
    pub(crate) cancel: CancelToken,
    pub(crate) reinstate: Watch<ReinstateState>,
    pub(crate) logout_done: Completion,
    pub(crate) live_threads: AtomicUsize,
    pub(crate) nopin_timer: Mutex<Option<TimerId>>,
    pub(crate) nopin_response_timer: Mutex<Option<TimerId>>,

    transport: Arc<dyn Transport>,
}

impl Connection {
    pub(crate) fn new(
        cid: u16,
        session: Arc<Session>,
        params: ConnParams,
        transport: Arc<dyn Transport>,
        stat_sn: u32,
    ) -> Arc<Self> {
        Arc::new(Connection {
            cid,
            session,
            params,
            state: Mutex::new(ConnState::InLogin),
            stat_sn: AtomicU32::new(stat_sn),
            exp_stat_sn: AtomicU32::new(stat_sn),
            commands: Mutex::new(Vec::new()),
            flags: Mutex::new(ConnFlags::default()),
            queues: ConnQueues::new(),
            usage: UsageCount::new(),
            cancel: CancelToken::new(),
            reinstate: Watch::new(ReinstateState::Active),
            logout_done: Completion::new(),
            live_threads: AtomicUsize::new(0),
            nopin_timer: Mutex::new(None),
            nopin_response_timer: Mutex::new(None),
            transport,
        })
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        let mut s = self.state.lock();
        if *s != state {
            trace!("CID {}: {:?} -> {:?}", self.cid, *s, state);
            *s = state;
        }
    }

    pub(crate) fn flags(&self) -> MutexGuard<'_, ConnFlags> {
        self.flags.lock()
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    /// Largest Data-In / text segment we may send
    pub fn max_xmit(&self) -> u32 {
        self.params.max_xmit_data_segment_length
    }

    /// Take the next StatSN
    pub(crate) fn next_stat_sn(&self) -> u32 {
        self.stat_sn.fetch_add(1, Ordering::SeqCst)
    }

    /// StatSN for PDUs that do not consume one
    pub fn current_stat_sn(&self) -> u32 {
        self.stat_sn.load(Ordering::SeqCst)
    }

    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn.load(Ordering::SeqCst)
    }

    pub(crate) fn set_exp_stat_sn(&self, exp: u32) {
        self.exp_stat_sn.store(exp, Ordering::SeqCst);
    }

    // ---- command list ----

    pub(crate) fn add_cmd(&self, cmd: CmdHandle) {
        self.commands.lock().push(cmd);
    }

    pub(crate) fn remove_cmd(&self, cmd: &CmdHandle) -> bool {
        let mut cmds = self.commands.lock();
        let before = cmds.len();
        cmds.retain(|c| !Arc::ptr_eq(c, cmd));
        cmds.len() != before
    }

    pub(crate) fn find_cmd_by_itt(&self, itt: u32) -> Option<CmdHandle> {
        self.commands.lock()
            .iter()
            .find(|c| {
                let c = c.lock();
                c.itt == itt && !matches!(c.kind, CmdKind::Reject | CmdKind::AsyncMsg | CmdKind::NopIn)
            })
            .cloned()
    }

    /// Outstanding unsolicited NOP-In with target transfer tag `ttt`
    pub(crate) fn find_nopin_by_ttt(&self, ttt: u32) -> Option<CmdHandle> {
        self.commands.lock()
            .iter()
            .find(|c| {
                let c = c.lock();
                c.kind == CmdKind::NopIn && c.ttt == ttt
            })
            .cloned()
    }

    pub(crate) fn commands(&self) -> Vec<CmdHandle> {
        self.commands.lock().clone()
    }

    pub(crate) fn take_commands(&self) -> Vec<CmdHandle> {
        std::mem::take(&mut *self.commands.lock())
    }

    /// Retire commands whose status the initiator has acknowledged
    pub(crate) fn ack_from_exp_stat_sn(&self, exp_stat_sn: u32) {
        let acked: Vec<CmdHandle> = self.commands.lock()
            .iter()
            .filter(|c| {
                let mut c = c.lock();
                if c.state == CmdState::SentStatus && c.stat_sn_assigned && serial::lt(c.stat_sn, exp_stat_sn) {
                    c.state = CmdState::Remove;
                    true
                } else {
                    false
                }
            })
            .cloned()
            .collect();
        for cmd in acked {
            trace!("ExpStatSN 0x{:08x} acknowledges ITT 0x{:08x}", exp_stat_sn, cmd.itt());
            self.queues.push_immediate(cmd, CmdState::Remove);
        }
    }

    // ---- receive side ----

    pub(crate) fn recv_exact(&self, buf: &mut [u8]) -> IscsiResult<()> {
        if self.cancel.is_cancelled() {
            return Err(IscsiError::ConnectionClosed);
        }
        let n = self.transport.recv(buf)?;
        if n < buf.len() {
            return Err(IscsiError::ConnectionClosed);
        }
        Ok(())
    }

    fn recv_digest(&self) -> IscsiResult<u32> {
        let mut wire = [0u8; DIGEST_LEN];
        self.recv_exact(&mut wire)?;
        Ok(digest::from_wire(wire))
    }

    /// Read a data segment of `len` bytes with its padding and digest
    pub(crate) fn recv_payload(&self, len: usize) -> IscsiResult<Payload> {
        let mut data = vec![0u8; digest::padded(len)];
        self.recv_exact(&mut data)?;
        let mut digest_ok = true;
        if len > 0 && self.params.digests.data.enabled() {
            let received = self.recv_digest()?;
            let computed = digest::data_digest(std::iter::once(data.as_slice()), 0);
            if received != computed {
                debug!(
                    "CID {}: data digest 0x{:08x} != 0x{:08x}",
                    self.cid, received, computed
                );
                digest_ok = false;
            }
        }
        data.truncate(len);
        Ok(Payload { data, digest_ok })
    }

    /// Read a data segment straight into `sgl` at `offset`
    ///
    /// Returns whether the data digest matched.
    pub(crate) fn recv_into(&self, sgl: &mut ScatterList, offset: usize, len: usize) -> IscsiResult<bool> {
        for run in sgl.slices_mut(offset, len)? {
            self.recv_exact(run)?;
        }
        let mut pad = [0u8; 3];
        let pad_len = digest::pad_len(len);
        self.recv_exact(&mut pad[..pad_len])?;
        if len == 0 || !self.params.digests.data.enabled() {
            return Ok(true);
        }
        let received = self.recv_digest()?;
        // recomputed over the mapped runs, not the buffers the reads used
        let runs = sgl.slices(offset, len)?;
        let computed = digest::data_digest(runs.into_iter().chain(std::iter::once(&pad[..pad_len])), 0);
        if received != computed {
            debug!(
                "CID {}: data digest 0x{:08x} != 0x{:08x} at offset {}",
                self.cid, received, computed, offset
            );
        }
        Ok(received == computed)
    }

    /// Consume and discard a data segment
    pub(crate) fn dump_payload(&self, len: usize) -> IscsiResult<()> {
        self.recv_payload(len).map(|_| ())
    }

    // ---- transmit side ----

    pub(crate) fn send_pdu(&self, pdu: &IscsiPdu) -> IscsiResult<()> {
        let bytes = pdu.encode(self.params.digests);
        let sent = self.transport.send(&[&bytes])?;
        if sent < bytes.len() {
            return Err(IscsiError::ConnectionClosed);
        }
        trace!(
            "CID {}: sent {} ITT 0x{:08x} ({} bytes)",
            self.cid,
            pdu.opcode_name(),
            pdu.itt,
            sent
        );
        Ok(())
    }

    /// Send `pdu` with `len` bytes of `sgl` from `offset` as its data segment
    pub(crate) fn send_pdu_with_sgl(
        &self,
        pdu: &IscsiPdu,
        sgl: &ScatterList,
        offset: usize,
        len: usize,
    ) -> IscsiResult<()> {
        let mut header = pdu.clone();
        header.data.clear();
        header.data_length = len as u32;
        let bhs = header.bhs_bytes();

        let mut head = Vec::with_capacity(bhs.len() + header.ahs.len() + DIGEST_LEN);
        head.extend_from_slice(&bhs);
        head.extend_from_slice(&header.ahs);
        if self.params.digests.header.enabled() {
            head.extend_from_slice(&digest::to_wire(digest::header_digest(&bhs, &header.ahs)));
        }

        let pad = digest::pad_len(len);
        let mut tail = vec![0u8; pad];
        if len > 0 && self.params.digests.data.enabled() {
            let crc = digest::data_digest(sgl.slices(offset, len)?, pad);
            tail.extend_from_slice(&digest::to_wire(crc));
        }

        let mut bufs: Vec<&[u8]> = Vec::with_capacity(2 + sgl.segment_count());
        bufs.push(&head);
        bufs.extend(sgl.slices(offset, len)?);
        bufs.push(&tail);
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let sent = self.transport.send(&bufs)?;
        if sent < total {
            return Err(IscsiError::ConnectionClosed);
        }
        Ok(())
    }

    /// Unblock both connection threads and stop queueing
    pub(crate) fn request_stop(&self) {
        self.cancel.cancel();
        self.transport.shutdown();
        self.queues.close();
    }

    pub(crate) fn shutdown_transport(&self) {
        self.transport.shutdown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("cid", &self.cid)
            .field("tsih", &self.session.tsih)
            .field("state", &self.state())
            .field("stat_sn", &self.current_stat_sn())
            .finish()
    }
}
