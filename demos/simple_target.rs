//! Simple iSCSI target with in-memory storage
//!
//! Usage: `cargo run --example simple_target [config.toml]`
//!
//! The optional TOML file may carry a `[target]` table with engine tunables,
//! for example:
//!
//! ```toml
//! [target]
//! default_erl = 1
//! nopin_timeout = 10
//! ```

use iscsi_target::{IscsiError, IscsiResult, IscsiTarget, ScsiBlockDevice, TargetConfig};

/// Simple in-memory storage backend
struct MemoryStorage {
    data: Vec<u8>,
    block_size: u32,
}

impl MemoryStorage {
    fn new(size_mb: usize, block_size: u32) -> Self {
        Self {
            data: vec![0u8; size_mb * 1024 * 1024],
            block_size,
        }
    }

    fn range(&self, lba: u64, len: usize, block_size: u32) -> IscsiResult<std::ops::Range<usize>> {
        if block_size != self.block_size {
            return Err(IscsiError::Scsi(format!(
                "block size mismatch: expected {}, got {}",
                self.block_size, block_size
            )));
        }
        let offset = (lba * block_size as u64) as usize;
        if offset + len > self.data.len() {
            return Err(IscsiError::Scsi(format!(
                "access beyond device capacity: LBA {}, bytes {}",
                lba, len
            )));
        }
        Ok(offset..offset + len)
    }
}

impl ScsiBlockDevice for MemoryStorage {
    fn read(&self, lba: u64, blocks: u32, block_size: u32) -> IscsiResult<Vec<u8>> {
        let range = self.range(lba, (blocks * block_size) as usize, block_size)?;
        Ok(self.data[range].to_vec())
    }

    fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> IscsiResult<()> {
        let range = self.range(lba, data.len(), block_size)?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn capacity(&self) -> u64 {
        (self.data.len() / self.block_size as usize) as u64
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => TargetConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => TargetConfig::default(),
    };

    let storage = MemoryStorage::new(100, 512);
    println!(
        "In-memory disk: {} blocks of {} bytes",
        storage.capacity(),
        storage.block_size()
    );

    let target = IscsiTarget::builder()
        .bind_addr("0.0.0.0:3260")
        .target_name("iqn.2026-10.local:storage.memory-disk")
        .config(config)
        .build(storage)?;

    println!("Serving {} on 0.0.0.0:3260", target.target_name());
    target.run()?;
    Ok(())
}
