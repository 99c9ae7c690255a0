use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// An open file addressed by byte offset.
///
/// Transfers report the number of bytes moved so callers can tell a short
/// read (end of file) apart from a failed system call.
pub trait RawFile {
    /// Current length of the file in bytes
    fn size(&self) -> io::Result<u64>;

    /// Grow or shrink the file to exactly `len` bytes
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Read into `buf` starting at `offset`, stopping early only at end of file
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` starting at `offset`
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flush OS buffers to the device
    fn sync(&mut self) -> io::Result<()>;

    /// Release the descriptor
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Path-level operations of the raw I/O layer
pub trait Storage {
    /// Create a file that must not already exist
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn RawFile>>;

    /// Open an existing file for reading and writing
    fn open(&self, path: &Path) -> io::Result<Box<dyn RawFile>>;

    /// Delete a file by path
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// `Storage` backed by the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct OsStorage;

impl Storage for OsStorage {
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn RawFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Box::new(OsFile { file }))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn RawFile>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Box::new(OsFile { file }))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

struct OsFile {
    file: File,
}

impl RawFile for OsFile {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        // std reports close(2) failures nowhere, so surface pending write errors here
        self.file.sync_all()
    }
}
