mod buffer_manager;
mod config;
mod error;
mod file_handle;
mod file_manager;
mod header;
mod replacer;
mod storage;

#[cfg(test)]
mod tests;

pub use buffer_manager::{BufferManager, PageGuard, ScratchBlock};
pub use config::BufferConfig;
pub use error::{FileError, FileResult};
pub use file_handle::FileHandle;
pub use file_manager::PagedFileManager;
pub use header::{FileHeader, NextFree, PageHeader};
pub use replacer::{ReplacementAlgorithm, Replacer};
pub use storage::{OsStorage, RawFile, Storage};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Default number of pages in the buffer pool
pub const BUFFER_POOL_SIZE: usize = 40;

/// Smallest accepted size exponent: a file of 2^13 bytes holds the header
/// slot plus one usable page
pub const MIN_SIZE_EXPONENT: u32 = 13;

/// Largest accepted size exponent: the page count must fit the on-disk i32
pub const MAX_SIZE_EXPONENT: u32 = 43;

/// Page ID type
pub type PageId = usize;

/// Identifies an open descriptor registered with the buffer manager.
///
/// Ids are never reused within one buffer manager, so a stale id can never
/// alias a file opened later. Each id also names the pool that issued it;
/// any other pool treats it as not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    pool: u64,
    index: u64,
}

impl FileId {
    pub(crate) fn new(pool: u64, index: u64) -> Self {
        Self { pool, index }
    }

    /// Position of this file in its pool's open order
    pub fn as_u64(&self) -> u64 {
        self.index
    }
}

/// Byte offset of a page's on-disk image; slot 0 holds the file header.
pub(crate) fn page_offset(page_id: PageId) -> u64 {
    ((page_id as u64) + 1) * PAGE_SIZE as u64
}
