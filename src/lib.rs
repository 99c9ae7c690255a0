pub mod file;

pub use file::{
    BUFFER_POOL_SIZE, BufferConfig, BufferManager, FileError, FileHandle, FileHeader, FileId,
    FileResult, NextFree, OsStorage, PAGE_SIZE, PageGuard, PageHeader, PageId, PagedFileManager,
    RawFile, ReplacementAlgorithm, ScratchBlock, Storage,
};
