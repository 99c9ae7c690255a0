use std::io;
use thiserror::Error;

use super::PageId;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Short header write: {written} bytes written")]
    HeaderWrite { written: usize },

    #[error("Short header read: {read} bytes read")]
    HeaderRead { read: usize },

    #[error("Corrupt file header: {0}")]
    CorruptHeader(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File handle is already open")]
    FileAlreadyOpen,

    #[error("File handle is not open")]
    FileNotOpen,

    #[error("Invalid size exponent: {0}")]
    InvalidSizeExponent(u32),

    #[error("Invalid page: page_id={0}")]
    InvalidPage(PageId),

    #[error("Page is already free: page_id={0}")]
    PageAlreadyFree(PageId),

    #[error("Page is already in the buffer: page_id={0}")]
    PageInBuffer(PageId),

    #[error("Page is still pinned: page_id={0}")]
    PagePinned(PageId),

    #[error("Page is not pinned: page_id={0}")]
    InvalidPin(PageId),

    #[error("Buffer pool is exhausted: every slot is pinned")]
    PoolExhausted,

    #[error("Buffer pool is busy: {0} slots pinned")]
    PoolBusy(usize),

    #[error("Scratch block is no longer allocated")]
    StaleBlock,

    #[error("No free pages left in file")]
    NoFreePages,

    #[error("Free list is corrupt at page_id={0}")]
    FreeListCorrupt(PageId),

    #[error("Invalid buffer configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type FileResult<T> = Result<T, FileError>;
