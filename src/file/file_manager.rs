use log::{info, warn};
use std::io;
use std::path::Path;

use super::buffer_manager::{BufferManager, PageGuard, ScratchBlock};
use super::config::BufferConfig;
use super::error::{FileError, FileResult};
use super::file_handle::FileHandle;
use super::header::{FileHeader, NextFree, PageHeader};
use super::storage::{OsStorage, RawFile, Storage};
use super::{FileId, MAX_SIZE_EXPONENT, MIN_SIZE_EXPONENT, PAGE_SIZE, PageId};

/// Creates, opens and closes paged files, and owns the one buffer pool all
/// open files share
pub struct PagedFileManager {
    storage: Box<dyn Storage>,
    buffer_manager: BufferManager,
}

impl PagedFileManager {
    /// Create a paged file manager over the local filesystem
    pub fn new(config: BufferConfig) -> FileResult<Self> {
        Self::with_storage(config, Box::new(OsStorage))
    }

    /// Create a paged file manager over a custom raw I/O layer
    pub fn with_storage(config: BufferConfig, storage: Box<dyn Storage>) -> FileResult<Self> {
        Ok(Self {
            storage,
            buffer_manager: BufferManager::new(config)?,
        })
    }

    /// Get a reference to the buffer manager
    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffer_manager
    }

    /// Get a mutable reference to the buffer manager
    pub fn buffer_manager_mut(&mut self) -> &mut BufferManager {
        &mut self.buffer_manager
    }

    /// Change pool capacity and replacement algorithm; rejected while pages are pinned
    pub fn set_buffer_config(&mut self, config: BufferConfig) -> FileResult<()> {
        self.buffer_manager.reconfigure(config)
    }

    fn map_not_found(e: io::Error, path: &Path) -> FileError {
        match e.kind() {
            io::ErrorKind::NotFound => FileError::FileNotFound(path.display().to_string()),
            _ => FileError::Io(e),
        }
    }

    /// Create a file of `2^size_exponent` bytes with every page on the free list.
    ///
    /// Either the file ends up fully initialized or nothing is left at
    /// `path`: any failure after the file was created closes and deletes it
    /// before the error is returned.
    pub fn create_file<P: AsRef<Path>>(&mut self, path: P, size_exponent: u32) -> FileResult<()> {
        let path = path.as_ref();

        if !(MIN_SIZE_EXPONENT..=MAX_SIZE_EXPONENT).contains(&size_exponent) {
            return Err(FileError::InvalidSizeExponent(size_exponent));
        }
        let file_size = 1u64 << size_exponent;
        let num_pages = (file_size / PAGE_SIZE as u64 - 1) as usize;

        let mut raw = self.storage.create_new(path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => {
                FileError::FileAlreadyExists(path.display().to_string())
            }
            _ => FileError::Io(e),
        })?;

        if let Err(e) = Self::lay_out(&mut *raw, file_size, &FileHeader::new(num_pages)) {
            self.remove_partial(path, raw);
            return Err(e);
        }

        let file = self.buffer_manager.register_file(raw);
        if let Err(e) = self.thread_free_list(file, num_pages) {
            self.buffer_manager.discard_file(file);
            if let Ok(raw) = self.buffer_manager.unregister_file(file) {
                self.remove_partial(path, raw);
            }
            return Err(e);
        }

        let raw = self.buffer_manager.unregister_file(file)?;
        raw.close()?;

        info!(
            "Created {} with {} pages ({} bytes)",
            path.display(),
            num_pages,
            file_size
        );
        Ok(())
    }

    /// Size the file and write its header
    fn lay_out(raw: &mut dyn RawFile, file_size: u64, header: &FileHeader) -> FileResult<()> {
        raw.set_len(file_size)?;

        let image = header.to_disk_image();
        let written = raw.write_at(0, &image)?;
        if written != image.len() {
            return Err(FileError::HeaderWrite { written });
        }
        Ok(())
    }

    /// Link pages 0..num_pages into one ascending free list and push it to disk
    fn thread_free_list(&mut self, file: FileId, num_pages: usize) -> FileResult<()> {
        let bm = &mut self.buffer_manager;

        for page_id in 0..num_pages {
            let guard = bm.allocate_page(file, page_id)?;
            let next = if page_id + 1 < num_pages {
                NextFree::Page(page_id + 1)
            } else {
                NextFree::End
            };

            let result = bm
                .page_mut(&guard)
                .map(|page| PageHeader::empty(page_id, next).write_to(page))
                .and_then(|_| bm.mark_dirty(file, page_id));
            bm.unpin_page(guard)?;
            result?;
        }

        bm.flush_pages(file)?;
        bm.evict_file(file)
    }

    /// Close and delete a file whose creation failed; errors are logged only
    fn remove_partial(&self, path: &Path, raw: Box<dyn RawFile>) {
        warn!("Rolling back creation of {}", path.display());
        if let Err(e) = raw.close() {
            warn!("Failed to close partial file {}: {}", path.display(), e);
        }
        if let Err(e) = self.storage.remove(path) {
            warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }

    /// Delete a file by path
    pub fn destroy_file<P: AsRef<Path>>(&mut self, path: P) -> FileResult<()> {
        let path = path.as_ref();
        self.storage
            .remove(path)
            .map_err(|e| Self::map_not_found(e, path))?;
        info!("Destroyed {}", path.display());
        Ok(())
    }

    /// Bind `handle` to the file at `path`.
    ///
    /// An already-open handle is rejected and left untouched. A failed open
    /// leaves the handle closed.
    pub fn open_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        handle: &mut FileHandle,
    ) -> FileResult<()> {
        let path = path.as_ref();
        if handle.is_open() {
            return Err(FileError::FileAlreadyOpen);
        }

        let mut raw = self
            .storage
            .open(path)
            .map_err(|e| Self::map_not_found(e, path))?;

        let header = match Self::read_header(&mut *raw) {
            Ok(header) => header,
            Err(e) => {
                if let Err(close_err) = raw.close() {
                    warn!("Failed to close {}: {}", path.display(), close_err);
                }
                return Err(e);
            }
        };

        let file = self.buffer_manager.register_file(raw);
        handle.bind(file, path, header);
        info!(
            "Opened {} as file {} ({} pages)",
            path.display(),
            file.as_u64(),
            header.num_pages
        );
        Ok(())
    }

    /// Open the file at `path` with a fresh handle
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> FileResult<FileHandle> {
        let mut handle = FileHandle::new();
        self.open_file(path, &mut handle)?;
        Ok(handle)
    }

    fn read_header(raw: &mut dyn RawFile) -> FileResult<FileHeader> {
        let mut image = vec![0u8; FileHeader::DISK_SIZE];
        let read = raw.read_at(0, &mut image)?;
        if read != image.len() {
            return Err(FileError::HeaderRead { read });
        }

        let header = FileHeader::deserialize(&image)?;
        header.validate(raw.size()?)?;
        Ok(header)
    }

    /// Flush `handle` and release its descriptor.
    ///
    /// Fails without side effects while any of its pages is pinned. Once the
    /// flush succeeded, the handle is closed even if releasing the descriptor
    /// reports an error.
    pub fn close_file(&mut self, handle: &mut FileHandle) -> FileResult<()> {
        let file = handle.file_id()?;

        if let Some(&page_id) = self.buffer_manager.pinned_pages(file).first() {
            return Err(FileError::PagePinned(page_id));
        }

        // Flush all buffers for this file and write out the header
        handle.flush_pages(&mut self.buffer_manager)?;
        self.buffer_manager.evict_file(file)?;

        let raw = self.buffer_manager.unregister_file(file)?;
        let path = handle.path().map(|p| p.display().to_string());
        handle.unbind();
        raw.close()?;

        info!("Closed {}", path.as_deref().unwrap_or("<unknown>"));
        Ok(())
    }

    /// Drop every buffered page and scratch block; returns the number of dirty pages lost
    pub fn clear_buffer(&mut self) -> usize {
        self.buffer_manager.clear_buffer()
    }

    /// Borrow a pool slot as scratch memory
    pub fn allocate_block(&mut self) -> FileResult<ScratchBlock> {
        self.buffer_manager.allocate_block()
    }

    pub fn dispose_block(&mut self, block: ScratchBlock) -> FileResult<()> {
        self.buffer_manager.dispose_block(block)
    }

    /// Take a page off `handle`'s free list, returned pinned
    pub fn allocate_page(&mut self, handle: &mut FileHandle) -> FileResult<(PageId, PageGuard)> {
        handle.allocate_page(&mut self.buffer_manager)
    }

    /// Return a page to `handle`'s free list
    pub fn dispose_page(&mut self, handle: &mut FileHandle, page_id: PageId) -> FileResult<()> {
        handle.dispose_page(&mut self.buffer_manager, page_id)
    }

    /// Pin an in-use page
    pub fn get_page(&mut self, handle: &FileHandle, page_id: PageId) -> FileResult<PageGuard> {
        handle.get_page(&mut self.buffer_manager, page_id)
    }

    pub fn unpin_page(&mut self, handle: &FileHandle, guard: PageGuard) -> FileResult<()> {
        handle.unpin_page(&mut self.buffer_manager, guard)
    }

    pub fn mark_dirty(&mut self, handle: &FileHandle, page_id: PageId) -> FileResult<()> {
        handle.mark_dirty(&mut self.buffer_manager, page_id)
    }

    /// Force one page, or all of `handle`'s pages, to disk
    pub fn force_pages(
        &mut self,
        handle: &mut FileHandle,
        page_id: Option<PageId>,
    ) -> FileResult<()> {
        handle.force_pages(&mut self.buffer_manager, page_id)
    }

    /// Whole page image behind a pin, header included
    pub fn page(&self, guard: &PageGuard) -> FileResult<&[u8]> {
        self.buffer_manager.page(guard)
    }

    pub fn page_mut(&mut self, guard: &PageGuard) -> FileResult<&mut [u8]> {
        self.buffer_manager.page_mut(guard)
    }
}
