//! Session-wide CmdSN window and out-of-order command buffering
//!
//! Non-immediate commands from every connection of a session pass through
//! [`check_received_cmdsn`]. The command carrying ExpCmdSN is executed at
//! once; commands ahead of it wait in the out-of-order buffer until the gap
//! closes. Execution happens while the window lock is held, so the backend
//! sees commands in CmdSN order no matter which connection they arrived on.

use crate::command::CmdHandle;
use crate::connection::Connection;
use crate::error::IscsiResult;
use crate::handlers::execute_cmd;
use crate::pdu::serial;
use log::{debug, error, trace};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Classification of a received CmdSN against the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSnResult {
    /// Equal to ExpCmdSN; the command was executed
    Normal,
    /// Ahead of ExpCmdSN; the command was buffered
    HigherThanExpected,
    /// Behind ExpCmdSN or already buffered with a live command; a duplicate
    /// to be dropped
    LowerThanExpected,
    /// Beyond MaxCmdSN
    CannotRecover,
}

#[derive(Debug, Clone)]
pub struct OooEntry {
    /// Empty once the connection that sent it has been torn down; the slot
    /// still has to be passed over in order
    pub cmd: Option<CmdHandle>,
    pub cid: u16,
}

#[derive(Debug)]
pub struct CmdSnWindow {
    exp_cmd_sn: u32,
    max_cmd_sn: u32,
    ooo: BTreeMap<u32, OooEntry>,
}

impl CmdSnWindow {
    /// Window opening at `initial` with room for `depth` commands
    pub fn new(initial: u32, depth: u32) -> Self {
        CmdSnWindow {
            exp_cmd_sn: initial,
            max_cmd_sn: initial.wrapping_add(depth.max(1) - 1),
            ooo: BTreeMap::new(),
        }
    }

    pub fn exp_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn
    }

    pub fn max_cmd_sn(&self) -> u32 {
        self.max_cmd_sn
    }

    pub fn classify(&self, cmd_sn: u32) -> CmdSnResult {
        if cmd_sn == self.exp_cmd_sn {
            CmdSnResult::Normal
        } else if serial::gt(cmd_sn, self.max_cmd_sn) {
            CmdSnResult::CannotRecover
        } else if serial::lt(cmd_sn, self.exp_cmd_sn) || self.slot_held(cmd_sn) {
            CmdSnResult::LowerThanExpected
        } else {
            CmdSnResult::HigherThanExpected
        }
    }

    /// A buffered slot counts as held only while its command is attached;
    /// an orphaned slot takes the retransmission
    fn slot_held(&self, cmd_sn: u32) -> bool {
        self.ooo.get(&cmd_sn).map_or(false, |e| e.cmd.is_some())
    }

    pub fn advance(&mut self) {
        self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);
    }

    /// Open the window by one; called once per retired non-immediate command
    pub fn increment_max(&mut self) {
        self.max_cmd_sn = self.max_cmd_sn.wrapping_add(1);
    }

    /// Buffer `entry` at `cmd_sn`; returns true if it refilled an orphaned slot
    pub fn buffer(&mut self, cmd_sn: u32, entry: OooEntry) -> bool {
        self.ooo.insert(cmd_sn, entry).is_some()
    }

    /// Pop the buffered command matching ExpCmdSN, advancing past it
    pub fn take_next_ready(&mut self) -> Option<OooEntry> {
        let entry = self.ooo.remove(&self.exp_cmd_sn)?;
        self.advance();
        Some(entry)
    }

    /// Detach buffered commands that arrived on connection `cid`, keeping
    /// their CmdSN slots
    pub fn orphan_for_conn(&mut self, cid: u16) -> Vec<CmdHandle> {
        self.ooo
            .values_mut()
            .filter(|e| e.cid == cid)
            .filter_map(|e| e.cmd.take())
            .collect()
    }

    pub fn clear(&mut self) -> Vec<OooEntry> {
        std::mem::take(&mut self.ooo).into_values().collect()
    }
}

/// Run a non-immediate command through the session's CmdSN window
pub(crate) fn check_received_cmdsn(
    conn: &Arc<Connection>,
    cmd: &CmdHandle,
    cmd_sn: u32,
) -> IscsiResult<CmdSnResult> {
    let sess = &conn.session;
    let mut window = sess.window.lock();
    let result = window.classify(cmd_sn);
    match result {
        CmdSnResult::Normal => {
            window.advance();
            execute_cmd(cmd, false)?;
            while let Some(entry) = window.take_next_ready() {
                let slot = window.exp_cmd_sn().wrapping_sub(1);
                match entry.cmd {
                    Some(ref cmd) => {
                        trace!("releasing out-of-order CmdSN 0x{:08x}", slot);
                        execute_cmd(cmd, true)?;
                    }
                    None => trace!("passing over CmdSN 0x{:08x} of CID {}", slot, entry.cid),
                }
            }
        }
        CmdSnResult::HigherThanExpected => {
            debug!(
                "CmdSN 0x{:08x} ahead of ExpCmdSN 0x{:08x}, buffering",
                cmd_sn,
                window.exp_cmd_sn()
            );
            cmd.lock().ooo_cmdsn = true;
            let refilled = window.buffer(
                cmd_sn,
                OooEntry {
                    cmd: Some(Arc::clone(cmd)),
                    cid: conn.cid,
                },
            );
            if refilled {
                debug!("CmdSN 0x{:08x} retransmitted on CID {} into orphaned slot", cmd_sn, conn.cid);
            }
        }
        CmdSnResult::LowerThanExpected => {
            debug!(
                "dropping duplicate CmdSN 0x{:08x} (ExpCmdSN 0x{:08x})",
                cmd_sn,
                window.exp_cmd_sn()
            );
        }
        CmdSnResult::CannotRecover => {
            error!(
                "CmdSN 0x{:08x} beyond MaxCmdSN 0x{:08x}",
                cmd_sn,
                window.max_cmd_sn()
            );
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CmdKind, Command};
    use std::sync::Weak;

    fn entry(cid: u16) -> OooEntry {
        OooEntry {
            cmd: Some(Command::detached(CmdKind::Scsi, Weak::new(), cid)),
            cid,
        }
    }

    #[test]
    fn test_classify() {
        let mut w = CmdSnWindow::new(10, 4);
        assert_eq!(w.max_cmd_sn(), 13);
        assert_eq!(w.classify(10), CmdSnResult::Normal);
        assert_eq!(w.classify(12), CmdSnResult::HigherThanExpected);
        assert_eq!(w.classify(9), CmdSnResult::LowerThanExpected);
        assert_eq!(w.classify(14), CmdSnResult::CannotRecover);

        w.buffer(12, entry(1));
        assert_eq!(w.classify(12), CmdSnResult::LowerThanExpected);
    }

    #[test]
    fn test_gap_release_order() {
        let mut w = CmdSnWindow::new(1, 16);
        w.buffer(3, entry(1));
        w.buffer(2, entry(2));
        w.buffer(5, entry(1));

        // nothing is ready until ExpCmdSN itself arrives
        assert!(w.take_next_ready().is_none());
        w.advance();
        assert_eq!(w.take_next_ready().map(|e| e.cid), Some(2));
        assert_eq!(w.take_next_ready().map(|e| e.cid), Some(1));
        assert!(w.take_next_ready().is_none());
        assert_eq!(w.exp_cmd_sn(), 4);
        assert_eq!(w.ooo.len(), 1);
    }

    #[test]
    fn test_window_wraps() {
        let mut w = CmdSnWindow::new(u32::MAX, 4);
        assert_eq!(w.max_cmd_sn(), 2);
        assert_eq!(w.classify(1), CmdSnResult::HigherThanExpected);
        assert_eq!(w.classify(3), CmdSnResult::CannotRecover);
        w.advance();
        assert_eq!(w.exp_cmd_sn(), 0);
        w.increment_max();
        assert_eq!(w.classify(3), CmdSnResult::HigherThanExpected);
    }

    #[test]
    fn test_orphan_for_conn_keeps_slots() {
        let mut w = CmdSnWindow::new(1, 16);
        w.buffer(2, entry(1));
        w.buffer(3, entry(2));
        w.buffer(4, entry(1));
        assert_eq!(w.orphan_for_conn(1).len(), 2);
        assert_eq!(w.ooo.len(), 3);

        w.advance();
        let first = w.take_next_ready().unwrap();
        assert!(first.cmd.is_none());
        assert!(w.take_next_ready().unwrap().cmd.is_some());
        assert!(w.take_next_ready().unwrap().cmd.is_none());
        assert_eq!(w.exp_cmd_sn(), 5);
        assert!(w.clear().is_empty());
    }

    #[test]
    fn test_orphaned_slot_takes_retransmission() {
        let mut w = CmdSnWindow::new(1, 16);
        assert!(!w.buffer(2, entry(1)));
        assert_eq!(w.classify(2), CmdSnResult::LowerThanExpected);
        assert_eq!(w.orphan_for_conn(1).len(), 1);

        // the initiator resends CmdSN 2 on its surviving connection
        assert_eq!(w.classify(2), CmdSnResult::HigherThanExpected);
        assert!(w.buffer(2, entry(2)));
        assert_eq!(w.classify(2), CmdSnResult::LowerThanExpected);

        w.advance();
        let released = w.take_next_ready().unwrap();
        assert_eq!(released.cid, 2);
        assert!(released.cmd.is_some());
        assert_eq!(w.exp_cmd_sn(), 3);
    }
}
