//! Byte-addressable persistent media behind the configuration store.
//!
//! A medium is sized with [`PersistentMedium::begin`], edited in a RAM
//! mirror with `read`/`write`, and made durable by `commit`. A commit
//! either lands completely or not at all.

use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::PathBuf,
};

use thiserror::Error;

/// Value of a byte that was never written (erased flash).
pub const ERASED_BYTE: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum MediumError {
    #[error("access at {offset}+{len} is outside the {capacity}-byte medium")]
    OutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("medium I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("medium backend failed: {0}")]
    Backend(String),
}

pub trait PersistentMedium {
    /// Makes at least `size` bytes addressable, loading what is already stored.
    fn begin(&mut self, size: usize) -> Result<(), MediumError>;
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), MediumError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MediumError>;
    fn commit(&mut self) -> Result<(), MediumError>;
}

fn check_range(offset: usize, len: usize, capacity: usize) -> Result<(), MediumError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(MediumError::OutOfRange {
            offset,
            len,
            capacity,
        }),
    }
}

/// RAM-backed medium with separate working and committed images, so tests
/// can observe what a power cut before `commit` would leave behind.
#[derive(Debug, Clone, Default)]
pub struct MemoryMedium {
    working: Vec<u8>,
    committed: Vec<u8>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// A medium whose committed content is `bytes`.
    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self {
            working: bytes.clone(),
            committed: bytes,
        }
    }

    pub fn committed(&self) -> &[u8] {
        &self.committed
    }

    /// Drops uncommitted writes, as a reboot would.
    pub fn power_cycle(&mut self) {
        self.working = self.committed.clone();
    }
}

impl PersistentMedium for MemoryMedium {
    fn begin(&mut self, size: usize) -> Result<(), MediumError> {
        self.working = self.committed.clone();
        if self.working.len() < size {
            self.working.resize(size, ERASED_BYTE);
        }
        Ok(())
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), MediumError> {
        check_range(offset, buf.len(), self.working.len())?;
        buf.copy_from_slice(&self.working[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MediumError> {
        check_range(offset, data.len(), self.working.len())?;
        self.working[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MediumError> {
        self.committed = self.working.clone();
        Ok(())
    }
}

/// EEPROM image kept in a file. Commits go through a temporary file and a
/// rename.
#[derive(Debug, Clone)]
pub struct FileMedium {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileMedium {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            image: Vec::new(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl PersistentMedium for FileMedium {
    fn begin(&mut self, size: usize) -> Result<(), MediumError> {
        self.image = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        if self.image.len() < size {
            self.image.resize(size, ERASED_BYTE);
        }
        Ok(())
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), MediumError> {
        check_range(offset, buf.len(), self.image.len())?;
        buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MediumError> {
        check_range(offset, data.len(), self.image.len())?;
        self.image[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MediumError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&self.image)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
