use log::debug;
use std::path::{Path, PathBuf};

use super::buffer_manager::{BufferManager, PageGuard};
use super::error::{FileError, FileResult};
use super::header::{FileHeader, NextFree, PageHeader};
use super::{FileId, PageId};

/// Session state of one open paged file.
///
/// The handle keeps the in-memory file header and the id under which the
/// buffer manager holds the descriptor. Every page operation borrows the
/// shared [`BufferManager`] for its duration; the handle never owns it.
#[derive(Debug, Default)]
pub struct FileHandle {
    file: Option<FileId>,
    path: Option<PathBuf>,
    header: FileHeader,
    /// Whether the in-memory header differs from the one on disk
    header_dirty: bool,
}

impl FileHandle {
    /// Create an unbound handle; `PagedFileManager::open_file` binds it
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&mut self, file: FileId, path: &Path, header: FileHeader) {
        self.file = Some(file);
        self.path = Some(path.to_path_buf());
        self.header = header;
        self.header_dirty = false;
    }

    pub(crate) fn unbind(&mut self) {
        self.file = None;
        self.path = None;
        self.header_dirty = false;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Id of the bound descriptor
    pub fn file_id(&self) -> FileResult<FileId> {
        self.file.ok_or(FileError::FileNotOpen)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn num_pages(&self) -> usize {
        self.header.num_pages
    }

    pub fn is_header_dirty(&self) -> bool {
        self.header_dirty
    }

    fn check_page(&self, page_id: PageId) -> FileResult<FileId> {
        let file = self.file_id()?;
        if page_id >= self.header.num_pages {
            return Err(FileError::InvalidPage(page_id));
        }
        Ok(file)
    }

    /// Pin a page and return its header, unpinning on any failure
    fn pin_with_header(
        &self,
        bm: &mut BufferManager,
        page_id: PageId,
    ) -> FileResult<(PageGuard, PageHeader)> {
        let file = self.check_page(page_id)?;
        let guard = bm.get_page(file, page_id)?;
        match bm.page(&guard).and_then(PageHeader::deserialize) {
            Ok(header) => Ok((guard, header)),
            Err(e) => {
                bm.unpin_page(guard)?;
                Err(e)
            }
        }
    }

    /// Pin an in-use page.
    ///
    /// Fails with `InvalidPage` for ids beyond the file or pages on the free list.
    pub fn get_page(&self, bm: &mut BufferManager, page_id: PageId) -> FileResult<PageGuard> {
        let (guard, header) = self.pin_with_header(bm, page_id)?;
        if header.is_free() {
            bm.unpin_page(guard)?;
            return Err(FileError::InvalidPage(page_id));
        }
        Ok(guard)
    }

    /// Release a pin taken through this handle.
    ///
    /// The guard is always consumed so no pin leaks, even when the handle has
    /// been closed in the meantime.
    pub fn unpin_page(&self, bm: &mut BufferManager, guard: PageGuard) -> FileResult<()> {
        let open = self.file_id();
        let unpinned = bm.unpin_page(guard);
        open?;
        unpinned
    }

    pub fn mark_dirty(&self, bm: &mut BufferManager, page_id: PageId) -> FileResult<()> {
        let file = self.check_page(page_id)?;
        bm.mark_dirty(file, page_id)
    }

    /// Pin an in-use page, pass its data region to `f`, and unpin
    pub fn read_page<F, R>(&self, bm: &mut BufferManager, page_id: PageId, f: F) -> FileResult<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let guard = self.get_page(bm, page_id)?;
        let result = bm.page(&guard).map(|page| f(&page[PageHeader::SIZE..]));
        bm.unpin_page(guard)?;
        result
    }

    /// Pin an in-use page, let `f` modify its data region, mark it dirty, and unpin
    pub fn write_page<F, R>(
        &self,
        bm: &mut BufferManager,
        page_id: PageId,
        f: F,
    ) -> FileResult<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let guard = self.get_page(bm, page_id)?;
        let result = bm
            .page_mut(&guard)
            .map(|page| f(&mut page[PageHeader::SIZE..]))
            .and_then(|r| bm.mark_dirty(guard.file(), guard.page_id()).map(|_| r));
        bm.unpin_page(guard)?;
        result
    }

    /// Read the header of any page in range, free or in use
    pub fn page_header(&self, bm: &mut BufferManager, page_id: PageId) -> FileResult<PageHeader> {
        let (guard, header) = self.pin_with_header(bm, page_id)?;
        bm.unpin_page(guard)?;
        Ok(header)
    }

    /// Take the head of the free list, returning it pinned.
    ///
    /// The page comes back with an empty-page header and a zeroed data region.
    pub fn allocate_page(&mut self, bm: &mut BufferManager) -> FileResult<(PageId, PageGuard)> {
        let file = self.file_id()?;
        let page_id = self.header.first_free.ok_or(FileError::NoFreePages)?;
        if page_id >= self.header.num_pages {
            return Err(FileError::FreeListCorrupt(page_id));
        }

        let (guard, header) = self.pin_with_header(bm, page_id)?;
        let next = match header.next_free {
            NextFree::End => None,
            NextFree::Page(next) if next < self.header.num_pages && next != page_id => Some(next),
            _ => {
                bm.unpin_page(guard)?;
                return Err(FileError::FreeListCorrupt(page_id));
            }
        };

        let initialized = bm.page_mut(&guard).map(|page| {
            page.fill(0);
            PageHeader::empty(page_id, NextFree::Used).write_to(page);
        });
        if let Err(e) = initialized.and_then(|_| bm.mark_dirty(file, page_id)) {
            bm.unpin_page(guard)?;
            return Err(e);
        }

        self.header.first_free = next;
        self.header_dirty = true;
        debug!("Allocated page {} of file {}", page_id, file.as_u64());
        Ok((page_id, guard))
    }

    /// Push an in-use page onto the head of the free list
    pub fn dispose_page(&mut self, bm: &mut BufferManager, page_id: PageId) -> FileResult<()> {
        let file = self.file_id()?;
        let (guard, mut header) = self.pin_with_header(bm, page_id)?;

        if header.is_free() {
            bm.unpin_page(guard)?;
            return Err(FileError::PageAlreadyFree(page_id));
        }
        // Our own pin is the only one allowed
        if bm.pin_count(file, page_id) != Some(1) {
            bm.unpin_page(guard)?;
            return Err(FileError::PagePinned(page_id));
        }

        header.next_free = self.header.first_free.map_or(NextFree::End, NextFree::Page);
        let linked = bm.page_mut(&guard).map(|page| header.write_to(page));
        let result = linked.and_then(|_| bm.mark_dirty(file, page_id));
        bm.unpin_page(guard)?;
        result?;

        self.header.first_free = Some(page_id);
        self.header_dirty = true;
        debug!("Disposed page {} of file {}", page_id, file.as_u64());
        Ok(())
    }

    /// Walk the free list from the header, checking it for cycles and stray ids
    pub fn free_pages(&self, bm: &mut BufferManager) -> FileResult<Vec<PageId>> {
        self.file_id()?;
        let num_pages = self.header.num_pages;
        let mut visited = vec![false; num_pages];
        let mut pages = Vec::new();
        let mut current = self.header.first_free;

        while let Some(page_id) = current {
            if page_id >= num_pages || visited[page_id] {
                return Err(FileError::FreeListCorrupt(page_id));
            }
            visited[page_id] = true;

            let header = self.page_header(bm, page_id)?;
            current = match header.next_free {
                NextFree::Page(next) => Some(next),
                NextFree::End => None,
                NextFree::Used => return Err(FileError::FreeListCorrupt(page_id)),
            };
            pages.push(page_id);
        }

        Ok(pages)
    }

    /// Head of the upper layer's list of pages with free slots
    pub fn free_slot_page(&self) -> Option<PageId> {
        self.header.free_slot_page
    }

    pub fn set_free_slot_page(&mut self, page_id: Option<PageId>) -> FileResult<()> {
        self.file_id()?;
        if let Some(id) = page_id
            && id >= self.header.num_pages
        {
            return Err(FileError::InvalidPage(id));
        }
        self.header.free_slot_page = page_id;
        self.header_dirty = true;
        Ok(())
    }

    /// Write the header to its slot at offset 0
    fn write_header(&mut self, bm: &mut BufferManager) -> FileResult<()> {
        let file = self.file_id()?;
        let image = self.header.to_disk_image();
        let written = bm.raw_file(file)?.write_at(0, &image)?;
        if written != image.len() {
            return Err(FileError::HeaderWrite { written });
        }
        self.header_dirty = false;
        Ok(())
    }

    /// Write the header back if it changed, then every dirty page of this file
    pub fn flush_pages(&mut self, bm: &mut BufferManager) -> FileResult<()> {
        let file = self.file_id()?;
        if self.header_dirty {
            self.write_header(bm)?;
        }
        bm.flush_pages(file)
    }

    /// Force one page, or every page when `page_id` is `None`, to disk
    pub fn force_pages(
        &mut self,
        bm: &mut BufferManager,
        page_id: Option<PageId>,
    ) -> FileResult<()> {
        match page_id {
            None => self.flush_pages(bm),
            Some(page_id) => {
                let file = self.check_page(page_id)?;
                if self.header_dirty {
                    self.write_header(bm)?;
                }
                bm.flush_page(file, page_id)
            }
        }
    }
}
