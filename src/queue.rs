//! Per-connection transmit queues
//!
//! The immediate queue carries R2Ts, command retirement and unsolicited
//! NOP-Ins; the response queue carries everything else. The transmit thread
//! always drains the immediate queue first, so after each response it sent
//! it looks at the immediate queue again.

use crate::command::{CmdHandle, CmdState};
use crate::sync::CancelToken;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

const WAKE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Immediate,
    Response,
}

#[derive(Debug, Clone)]
pub struct QueueReq {
    pub cmd: CmdHandle,
    pub state: CmdState,
}

#[derive(Default)]
struct Queues {
    immediate: VecDeque<QueueReq>,
    response: VecDeque<QueueReq>,
    closed: bool,
}

#[derive(Default)]
pub struct ConnQueues {
    inner: Mutex<Queues>,
    cond: Condvar,
}

impl ConnQueues {
    pub fn new() -> Self {
        ConnQueues::default()
    }

    pub fn push_immediate(&self, cmd: CmdHandle, state: CmdState) {
        self.push(QueueKind::Immediate, cmd, state);
    }

    pub fn push_response(&self, cmd: CmdHandle, state: CmdState) {
        self.push(QueueKind::Response, cmd, state);
    }

    fn push(&self, kind: QueueKind, cmd: CmdHandle, state: CmdState) {
        let mut q = self.inner.lock();
        if q.closed {
            trace!("dropping {:?} for ITT 0x{:08x}: queues closed", state, cmd.itt());
            return;
        }
        let req = QueueReq { cmd, state };
        match kind {
            QueueKind::Immediate => q.immediate.push_back(req),
            QueueKind::Response => q.response.push_back(req),
        }
        drop(q);
        self.cond.notify_all();
    }

    /// Block for the next request, immediate queue first
    ///
    /// Returns `None` once the queues are closed or `cancel` fires.
    pub fn wait_next(&self, cancel: &CancelToken) -> Option<(QueueKind, QueueReq)> {
        let mut q = self.inner.lock();
        loop {
            if q.closed || cancel.is_cancelled() {
                return None;
            }
            if let Some(req) = q.immediate.pop_front() {
                return Some((QueueKind::Immediate, req));
            }
            if let Some(req) = q.response.pop_front() {
                return Some((QueueKind::Response, req));
            }
            self.cond.wait_for(&mut q, WAKE_INTERVAL);
        }
    }

    /// Discard everything queued; returns how many requests were dropped
    pub fn drain(&self) -> usize {
        let mut q = self.inner.lock();
        let n = q.immediate.len() + q.response.len();
        q.immediate.clear();
        q.response.clear();
        n
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CmdKind, Command};
    use std::sync::{Arc, Weak};

    fn cmd(itt: u32) -> CmdHandle {
        let c = Command::detached(CmdKind::Scsi, Weak::new(), 0);
        c.lock().itt = itt;
        c
    }

    #[test]
    fn test_immediate_preferred() {
        let q = ConnQueues::new();
        let token = CancelToken::new();
        q.push_response(cmd(1), CmdState::SendStatus);
        q.push_response(cmd(2), CmdState::SendStatus);
        q.push_immediate(cmd(3), CmdState::SendR2t);

        let (kind, req) = q.wait_next(&token).unwrap();
        assert_eq!(kind, QueueKind::Immediate);
        assert_eq!(req.cmd.itt(), 3);
        let (kind, req) = q.wait_next(&token).unwrap();
        assert_eq!(kind, QueueKind::Response);
        assert_eq!(req.cmd.itt(), 1);

        // an immediate item queued behind a response still goes first
        q.push_immediate(cmd(4), CmdState::Remove);
        assert_eq!(q.wait_next(&token).unwrap().1.cmd.itt(), 4);
        assert_eq!(q.wait_next(&token).unwrap().1.cmd.itt(), 2);
    }

    #[test]
    fn test_close_wakes_waiter() {
        let q = Arc::new(ConnQueues::new());
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.wait_next(&CancelToken::new()).is_none());
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(handle.join().unwrap());
        q.push_response(cmd(1), CmdState::SendStatus);
        assert_eq!(q.drain(), 0);
    }

    #[test]
    fn test_drain_discards_both_queues() {
        let q = ConnQueues::new();
        let a = cmd(1);
        q.push_immediate(a.clone(), CmdState::SendR2t);
        q.push_response(a, CmdState::SendStatus);
        q.push_response(cmd(2), CmdState::SendStatus);
        assert_eq!(q.drain(), 3);
        assert_eq!(q.drain(), 0);
    }
}
