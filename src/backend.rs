//! SCSI execution backend seam
//!
//! The engine never executes CDBs itself. It allocates a data buffer, checks
//! the LUN and task through [`ExecutionBackend`], then hands the command over
//! with [`ExecutionBackend::submit`]. The backend answers asynchronously
//! through the [`CompletionHandle`] it was given, from any thread.
//!
//! [`BlockDeviceBackend`] is a reference implementation running a small SBC
//! command set against a [`ScsiBlockDevice`] on a worker thread.

use crate::command::{CmdHandle, CmdState, DataDirection, Residual};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::tmf_response;
use crate::scsi::{ScsiBlockDevice, ScsiHandler, ScsiOpcode};
use crate::sgl::ScatterList;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::mpsc;
use std::thread;

/// Largest buffer the reference backend allocates for one command
pub const MAX_TRANSFER_LENGTH: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LunError {
    NonExistentLun,
    OutOfResources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    OutOfMemory,
    UnsupportedOpcode,
}

/// A SCSI command handed to the backend
#[derive(Debug)]
pub struct ScsiTask {
    pub itt: u32,
    pub lun: u64,
    pub cdb: [u8; 16],
    pub attr: u8,
    pub direction: DataDirection,
    pub data_length: u32,
    /// Write data for writes, the space to fill for reads
    pub buffer: ScatterList,
}

/// Result of a SCSI command
#[derive(Debug)]
pub struct ScsiCompletion {
    pub status: u8,
    /// Fixed-format sense bytes, sent in the SCSI Response
    pub sense: Option<Vec<u8>>,
    /// The task's buffer, returned to the engine
    pub buffer: ScatterList,
    /// Bytes the command produced (reads) or consumed (writes)
    pub transferred: u32,
}

/// A task management function for the backend
#[derive(Debug, Clone, Copy)]
pub struct TmrTask {
    pub function: u8,
    pub lun: u64,
    pub ref_itt: u32,
}

/// Returns a finished SCSI command to its connection
pub struct CompletionHandle {
    cmd: CmdHandle,
}

impl CompletionHandle {
    pub(crate) fn new(cmd: CmdHandle) -> Self {
        CompletionHandle { cmd }
    }

    pub fn itt(&self) -> u32 {
        self.cmd.itt()
    }

    pub fn complete(self, result: ScsiCompletion) {
        let cmd = self.cmd;
        let next = {
            let mut c = cmd.lock();
            c.completed = true;
            c.scsi_status = result.status;
            c.sense = result.sense;
            c.buffer = Some(result.buffer);
            c.residual = match c.direction {
                DataDirection::None => Residual::None,
                _ => Residual::between(c.data_length, result.transferred),
            };
            c.transferred = result.transferred.min(c.data_length);
            if c.aborted {
                Some(CmdState::Remove)
            } else if c.state == CmdState::AwaitingReassign {
                // resent once the task is reassigned
                None
            } else {
                let state = if c.is_read() && c.transferred > 0 {
                    CmdState::SendDataIn
                } else {
                    CmdState::SendStatus
                };
                c.state = state;
                Some(state)
            }
        };
        let Some(state) = next else {
            trace!("ITT 0x{:08x} completed while awaiting reassignment", cmd.itt());
            return;
        };
        let Some(conn) = cmd.connection() else {
            debug!("ITT 0x{:08x} completed after its connection went away", cmd.itt());
            return;
        };
        let _usage = conn.usage.hold();
        if state == CmdState::Remove {
            conn.queues.push_immediate(cmd, state);
        } else {
            conn.queues.push_response(cmd, state);
        }
    }
}

/// Tells the receive thread the backend can take immediate data
pub struct ReadyHandle {
    cmd: CmdHandle,
}

impl ReadyHandle {
    pub(crate) fn new(cmd: CmdHandle) -> Self {
        ReadyHandle { cmd }
    }

    pub fn ready(self) {
        self.cmd.buffer_ready.complete();
    }
}

/// Returns a task management response to its connection
pub struct TmrCompletionHandle {
    cmd: CmdHandle,
}

impl TmrCompletionHandle {
    pub(crate) fn new(cmd: CmdHandle) -> Self {
        TmrCompletionHandle { cmd }
    }

    pub fn complete(self, response: u8) {
        {
            let mut c = self.cmd.lock();
            if let Some(tmr) = c.tmr.as_mut() {
                tmr.response = response;
            }
            c.state = CmdState::SendTaskMgtRsp;
        }
        if let Some(conn) = self.cmd.connection() {
            let _usage = conn.usage.hold();
            conn.queues.push_response(self.cmd, CmdState::SendTaskMgtRsp);
        }
    }
}

/// SCSI execution collaborator
pub trait ExecutionBackend: Send + Sync {
    /// Data buffer for a new command; `None` when out of resources
    fn allocate_command(&self, data_length: u32, direction: DataDirection, attr: u8) -> Option<ScatterList>;

    fn lookup_lun(&self, lun: u64, cdb: &[u8; 16]) -> Result<(), LunError>;

    fn allocate_tasks(&self, lun: u64, cdb: &[u8; 16]) -> Result<(), TaskError>;

    /// Prepare for immediate data; the receive thread waits until `ready`
    /// is signalled before reading the payload
    fn handle_cdb(&self, _itt: u32, _lun: u64, ready: ReadyHandle) {
        ready.ready();
    }

    /// Execute a command; completion may be reported from any thread
    fn submit(&self, task: ScsiTask, done: CompletionHandle);

    fn submit_tmr(&self, _task: TmrTask, done: TmrCompletionHandle) {
        done.complete(tmf_response::FUNCTION_COMPLETE);
    }

    /// Drop whatever the backend still holds for a retired command
    fn release_task(&self, _itt: u32) {}
}

/// LUN number from the first level of a SAM LUN
pub fn lun_index(lun: u64) -> u16 {
    ((lun >> 48) & 0x3fff) as u16
}

struct Job {
    task: ScsiTask,
    done: CompletionHandle,
}

/// Single-LUN backend over a block device
///
/// Commands run one at a time on a dedicated worker thread, in submission
/// order. Dropping the backend closes the job channel and the worker exits
/// once it has drained it.
pub struct BlockDeviceBackend<D> {
    jobs: Mutex<mpsc::Sender<Job>>,
    _device: PhantomData<fn() -> D>,
}

impl<D: ScsiBlockDevice + 'static> BlockDeviceBackend<D> {
    pub fn new(device: D) -> IscsiResult<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("iscsi-backend".to_string())
            .spawn(move || worker(device, rx))
            .map_err(IscsiError::Io)?;
        Ok(BlockDeviceBackend {
            jobs: Mutex::new(tx),
            _device: PhantomData,
        })
    }
}

fn worker<D: ScsiBlockDevice>(mut device: D, jobs: mpsc::Receiver<Job>) {
    while let Ok(Job { task, done }) = jobs.recv() {
        let ScsiTask {
            itt,
            cdb,
            direction,
            data_length,
            mut buffer,
            ..
        } = task;
        let data_out = match direction {
            DataDirection::Write => buffer.to_vec(),
            _ => Vec::new(),
        };
        let response = ScsiHandler::execute(&cdb, &mut device, &data_out);
        trace!(
            "ITT 0x{:08x} opcode 0x{:02x} -> status 0x{:02x}",
            itt,
            cdb[0],
            response.status
        );
        let transferred = match direction {
            DataDirection::Read => {
                buffer.fill_from(&response.data);
                response.data.len() as u32
            }
            DataDirection::Write => data_length,
            DataDirection::None => 0,
        };
        done.complete(ScsiCompletion {
            status: response.status,
            sense: response.sense.map(|s| s.to_bytes()),
            buffer,
            transferred,
        });
    }
    debug!("backend worker exiting");
}

impl<D: ScsiBlockDevice + 'static> ExecutionBackend for BlockDeviceBackend<D> {
    fn allocate_command(&self, data_length: u32, _direction: DataDirection, _attr: u8) -> Option<ScatterList> {
        if data_length > MAX_TRANSFER_LENGTH {
            warn!("refusing {} byte transfer", data_length);
            return None;
        }
        Some(ScatterList::new(data_length as usize))
    }

    fn lookup_lun(&self, lun: u64, _cdb: &[u8; 16]) -> Result<(), LunError> {
        match lun_index(lun) {
            0 => Ok(()),
            _ => Err(LunError::NonExistentLun),
        }
    }

    fn allocate_tasks(&self, _lun: u64, cdb: &[u8; 16]) -> Result<(), TaskError> {
        ScsiOpcode::from_u8(cdb[0])
            .map(|_| ())
            .ok_or(TaskError::UnsupportedOpcode)
    }

    fn submit(&self, task: ScsiTask, done: CompletionHandle) {
        let sent = self.jobs.lock().send(Job { task, done });
        if let Err(mpsc::SendError(job)) = sent {
            warn!("backend worker gone, failing ITT 0x{:08x}", job.task.itt);
            let buffer = job.task.buffer;
            job.done.complete(ScsiCompletion {
                status: crate::scsi::scsi_status::BUSY,
                sense: None,
                buffer,
                transferred: 0,
            });
        }
    }
}
