//! A pure Rust iSCSI target protocol engine
//!
//! The engine owns the RFC 3720 full-feature phase of a target: CmdSN
//! windowing and ordering across connections, R2T flow control for writes,
//! Data-In sequencing for reads, CRC32C digests, error recovery levels 0-2,
//! task management, SNACK and logout. SCSI execution is delegated to an
//! [`ExecutionBackend`]; [`BlockDeviceBackend`] adapts any
//! [`ScsiBlockDevice`] to it.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_target::{IscsiResult, IscsiTarget, ScsiBlockDevice};
//!
//! struct MyStorage {
//!     data: Vec<u8>,
//! }
//!
//! impl ScsiBlockDevice for MyStorage {
//!     fn read(&self, lba: u64, blocks: u32, block_size: u32) -> IscsiResult<Vec<u8>> {
//!         let offset = (lba * block_size as u64) as usize;
//!         let len = (blocks * block_size) as usize;
//!         Ok(self.data[offset..offset + len].to_vec())
//!     }
//!
//!     fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> IscsiResult<()> {
//!         let offset = (lba * block_size as u64) as usize;
//!         self.data[offset..offset + data.len()].copy_from_slice(data);
//!         Ok(())
//!     }
//!
//!     fn capacity(&self) -> u64 {
//!         (self.data.len() / 512) as u64
//!     }
//!
//!     fn block_size(&self) -> u32 {
//!         512
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MyStorage { data: vec![0u8; 1024 * 1024] };
//! let target = IscsiTarget::builder()
//!     .bind_addr("0.0.0.0:3260")
//!     .target_name("iqn.2026-10.local:storage.disk1")
//!     .build(storage)?;
//! target.run()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
mod datain;
mod dataout;
pub mod digest;
pub mod error;
mod handlers;
mod lifecycle;
mod login;
pub mod pdu;
mod queue;
mod recovery;
pub mod registry;
mod rx;
pub mod scsi;
mod sequencing;
pub mod session;
pub mod sgl;
mod sync;
pub mod target;
mod timer;
pub mod transport;
mod tx;

pub use backend::{BlockDeviceBackend, CompletionHandle, ExecutionBackend, ScsiCompletion, ScsiTask};
pub use client::IscsiClient;
pub use config::TargetConfig;
pub use error::{IscsiError, IscsiResult};
pub use registry::SessionRegistry;
pub use scsi::ScsiBlockDevice;
pub use target::{IscsiTarget, IscsiTargetBuilder, RunningTarget};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
