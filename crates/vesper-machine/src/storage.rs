use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::MachineResult;

/// A resizable, byte-addressed backing store for the simulated disk.
///
/// Keeping this behind a trait lets the disk model be exercised entirely in
/// memory, while production runs persist sectors to a host file.
pub trait SectorStorage: Send {
    /// Current length in bytes.
    fn len(&mut self) -> MachineResult<u64>;

    fn is_empty(&mut self) -> MachineResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Resize to `len` bytes, zero-filling any extension.
    fn set_len(&mut self, len: u64) -> MachineResult<()>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> MachineResult<()>;

    /// Write all of `buf` at `offset`, extending the store if required.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> MachineResult<()>;

    fn flush(&mut self) -> MachineResult<()>;
}

/// In-memory storage, used by tests.
#[derive(Clone, Debug, Default)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl SectorStorage for MemBackend {
    fn len(&mut self) -> MachineResult<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> MachineResult<()> {
        self.data.resize(len as usize, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> MachineResult<()> {
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {}..{} beyond end {}", offset, end, self.data.len()),
            )
            .into());
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> MachineResult<()> {
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> MachineResult<()> {
        Ok(())
    }
}

/// Host-file storage for a persistent disk image.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    /// Opens `path` read-write, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> MachineResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }
}

impl SectorStorage for FileBackend {
    fn len(&mut self) -> MachineResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> MachineResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> MachineResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> MachineResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> MachineResult<()> {
        self.file.flush()?;
        Ok(())
    }
}
