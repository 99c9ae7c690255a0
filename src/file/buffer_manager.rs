use ahash::AHashMap;
use log::{debug, error, info, warn};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use super::config::BufferConfig;
use super::error::{FileError, FileResult};
use super::replacer::{FrameId, Replacer};
use super::storage::RawFile;
use super::{FileId, PAGE_SIZE, PageId, page_offset};

/// A key identifying a page in the buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BufferKey {
    file: FileId,
    page_id: PageId,
}

/// What a slot currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Empty,
    Page(BufferKey),
    Scratch,
}

/// Slot in the buffer pool
struct Frame {
    /// The actual page data
    data: Vec<u8>,
    binding: Binding,
    pin_count: usize,
    /// Whether this page has been modified since it was read or written
    dirty: bool,
    /// Bumped on every bind so guards from an earlier binding are detected
    generation: u64,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE],
            binding: Binding::Empty,
            pin_count: 0,
            dirty: false,
            generation: 0,
        }
    }
}

/// Proof that a page is pinned in the buffer pool.
///
/// Returned by every pinning call and consumed by
/// [`BufferManager::unpin_page`]. Dropping a guard without unpinning leaks
/// the pin and is reported through the log.
#[derive(Debug)]
#[must_use = "a pinned page must be released with BufferManager::unpin_page"]
pub struct PageGuard {
    key: BufferKey,
    frame: FrameId,
    generation: u64,
    armed: bool,
}

impl PageGuard {
    pub fn file(&self) -> FileId {
        self.key.file
    }

    pub fn page_id(&self) -> PageId {
        self.key.page_id
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if self.armed {
            error!(
                "Page {} of file {} dropped while still pinned",
                self.key.page_id,
                self.key.file.as_u64()
            );
        }
    }
}

/// A pool slot used as scratch memory outside any file's page space.
///
/// Counts against pool capacity and stays pinned until
/// [`BufferManager::dispose_block`].
#[derive(Debug)]
#[must_use = "a scratch block must be released with BufferManager::dispose_block"]
pub struct ScratchBlock {
    frame: FrameId,
    generation: u64,
    armed: bool,
}

impl Drop for ScratchBlock {
    fn drop(&mut self) {
        if self.armed {
            error!("Scratch block in frame {} dropped without dispose", self.frame);
        }
    }
}

fn write_back(
    files: &mut AHashMap<FileId, Box<dyn RawFile>>,
    key: BufferKey,
    data: &[u8],
) -> FileResult<()> {
    let file = files.get_mut(&key.file).ok_or(FileError::FileNotOpen)?;
    let written = file.write_at(page_offset(key.page_id), data)?;
    if written != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write of page {}: {} bytes", key.page_id, written),
        )
        .into());
    }
    Ok(())
}

fn read_in(
    files: &mut AHashMap<FileId, Box<dyn RawFile>>,
    key: BufferKey,
    data: &mut [u8],
) -> FileResult<()> {
    let file = files.get_mut(&key.file).ok_or(FileError::FileNotOpen)?;
    let read = file.read_at(page_offset(key.page_id), data)?;
    if read != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read of page {}: {} bytes", key.page_id, read),
        )
        .into());
    }
    Ok(())
}

/// Source of the pool tag carried by every [`FileId`]
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Fixed-capacity pool of page buffers shared by every open file.
///
/// The pool also owns the descriptor of every open file, keyed by
/// [`FileId`], so a dirty page can be written back whichever file triggered
/// its eviction. At most one slot is ever bound to a given page.
pub struct BufferManager {
    config: BufferConfig,
    frames: Vec<Frame>,
    /// Page to slot mapping; the cache-coherency invariant lives here
    page_table: AHashMap<BufferKey, FrameId>,
    /// Unbound slots, handed out from the back
    free_frames: Vec<FrameId>,
    replacer: Replacer,
    files: AHashMap<FileId, Box<dyn RawFile>>,
    pool_id: u64,
    next_file_id: u64,
}

impl BufferManager {
    /// Create a buffer manager with an explicit configuration
    pub fn new(config: BufferConfig) -> FileResult<Self> {
        config.validate()?;
        info!(
            "Initializing buffer pool with {} pages, {} replacement",
            config.capacity, config.algorithm
        );

        let mut manager = Self {
            config,
            frames: Vec::new(),
            page_table: AHashMap::new(),
            free_frames: Vec::new(),
            replacer: Replacer::new(config.algorithm, config.capacity),
            files: AHashMap::new(),
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            next_file_id: 0,
        };
        manager.build_pool();
        Ok(manager)
    }

    fn build_pool(&mut self) {
        let capacity = self.config.capacity;
        self.frames = (0..capacity).map(|_| Frame::new()).collect();
        self.page_table = AHashMap::with_capacity(capacity);
        // Reversed so slot 0 is handed out first
        self.free_frames = (0..capacity).rev().collect();
        self.replacer = Replacer::new(self.config.algorithm, capacity);
    }

    pub fn config(&self) -> BufferConfig {
        self.config
    }

    /// Replace capacity and eviction policy.
    ///
    /// Rejected while any slot is pinned. Dirty pages are written back and
    /// every binding is dropped before the pool is rebuilt.
    pub fn reconfigure(&mut self, config: BufferConfig) -> FileResult<()> {
        config.validate()?;

        let pinned = self.pinned_count();
        if pinned > 0 {
            return Err(FileError::PoolBusy(pinned));
        }

        self.flush_all()?;
        info!(
            "Reconfiguring buffer pool: {} -> {} pages, {} -> {} replacement",
            self.config.capacity, config.capacity, self.config.algorithm, config.algorithm
        );
        self.config = config;
        self.build_pool();
        Ok(())
    }

    /// Take ownership of an open descriptor
    pub(crate) fn register_file(&mut self, file: Box<dyn RawFile>) -> FileId {
        let id = FileId::new(self.pool_id, self.next_file_id);
        self.next_file_id += 1;
        self.files.insert(id, file);
        id
    }

    /// Give back a descriptor; its pages must already have left the pool
    pub(crate) fn unregister_file(&mut self, file: FileId) -> FileResult<Box<dyn RawFile>> {
        self.files.remove(&file).ok_or(FileError::FileNotOpen)
    }

    pub(crate) fn raw_file(&mut self, file: FileId) -> FileResult<&mut (dyn RawFile + 'static)> {
        match self.files.get_mut(&file) {
            Some(raw) => Ok(&mut **raw),
            None => Err(FileError::FileNotOpen),
        }
    }

    pub fn is_file_registered(&self, file: FileId) -> bool {
        self.files.contains_key(&file)
    }

    /// Find a slot for a new binding, evicting if the pool is full
    fn acquire_frame(&mut self) -> FileResult<FrameId> {
        if let Some(frame) = self.free_frames.pop() {
            return Ok(frame);
        }

        let frames = &self.frames;
        let victim = self
            .replacer
            .victim(|f| frames[f].pin_count > 0)
            .ok_or(FileError::PoolExhausted)?;

        let Binding::Page(key) = self.frames[victim].binding else {
            // Only page bindings are tracked by the replacer
            return Err(FileError::PoolExhausted);
        };

        let frame = &mut self.frames[victim];
        if frame.dirty {
            debug!(
                "Writing back dirty page {} of file {} before eviction",
                key.page_id,
                key.file.as_u64()
            );
            if let Err(e) = write_back(&mut self.files, key, &frame.data) {
                // Keep the page buffered and evictable
                self.replacer.insert(victim);
                return Err(e);
            }
            frame.dirty = false;
        }

        debug!(
            "Evicted page {} of file {} from frame {}",
            key.page_id,
            key.file.as_u64(),
            victim
        );
        frame.binding = Binding::Empty;
        self.page_table.remove(&key);
        Ok(victim)
    }

    /// Bind `frame` to `binding`, pinned once
    fn bind(&mut self, frame_id: FrameId, binding: Binding) -> u64 {
        let frame = &mut self.frames[frame_id];
        frame.binding = binding;
        frame.pin_count = 1;
        frame.dirty = false;
        frame.generation += 1;
        if let Binding::Page(key) = binding {
            self.page_table.insert(key, frame_id);
            self.replacer.insert(frame_id);
        }
        frame.generation
    }

    /// Return a slot to the free list
    fn release(&mut self, frame_id: FrameId) {
        let frame = &mut self.frames[frame_id];
        if let Binding::Page(key) = frame.binding {
            self.page_table.remove(&key);
            self.replacer.remove(frame_id);
        }
        frame.binding = Binding::Empty;
        frame.pin_count = 0;
        frame.dirty = false;
        self.free_frames.push(frame_id);
    }

    /// Obtain a zero-filled slot for a page that is not read from disk.
    ///
    /// Used when the caller is about to initialize the page image itself.
    pub fn allocate_page(&mut self, file: FileId, page_id: PageId) -> FileResult<PageGuard> {
        let key = BufferKey { file, page_id };
        if self.page_table.contains_key(&key) {
            return Err(FileError::PageInBuffer(page_id));
        }
        if !self.files.contains_key(&file) {
            return Err(FileError::FileNotOpen);
        }

        let frame = self.acquire_frame()?;
        self.frames[frame].data.fill(0);
        let generation = self.bind(frame, Binding::Page(key));

        Ok(PageGuard {
            key,
            frame,
            generation,
            armed: true,
        })
    }

    /// Pin a page, reading it from disk if it is not buffered
    pub fn get_page(&mut self, file: FileId, page_id: PageId) -> FileResult<PageGuard> {
        let key = BufferKey { file, page_id };

        if let Some(&frame) = self.page_table.get(&key) {
            self.frames[frame].pin_count += 1;
            self.replacer.touch(frame);
            return Ok(PageGuard {
                key,
                frame,
                generation: self.frames[frame].generation,
                armed: true,
            });
        }

        if !self.files.contains_key(&file) {
            return Err(FileError::FileNotOpen);
        }

        let frame = self.acquire_frame()?;
        if let Err(e) = read_in(&mut self.files, key, &mut self.frames[frame].data) {
            self.free_frames.push(frame);
            return Err(e);
        }
        let generation = self.bind(frame, Binding::Page(key));

        Ok(PageGuard {
            key,
            frame,
            generation,
            armed: true,
        })
    }

    /// Check that a guard still refers to a live pin
    fn pinned_frame(&self, guard: &PageGuard) -> FileResult<FrameId> {
        let frame = &self.frames[guard.frame];
        if frame.generation != guard.generation
            || frame.binding != Binding::Page(guard.key)
            || frame.pin_count == 0
        {
            return Err(FileError::InvalidPin(guard.key.page_id));
        }
        Ok(guard.frame)
    }

    /// Release one pin
    pub fn unpin_page(&mut self, mut guard: PageGuard) -> FileResult<()> {
        guard.armed = false;
        let frame = self.pinned_frame(&guard)?;
        self.frames[frame].pin_count -= 1;
        Ok(())
    }

    /// Page image behind a pin
    pub fn page(&self, guard: &PageGuard) -> FileResult<&[u8]> {
        let frame = self.pinned_frame(guard)?;
        Ok(&self.frames[frame].data)
    }

    /// Mutable page image behind a pin; call `mark_dirty` to persist changes
    pub fn page_mut(&mut self, guard: &PageGuard) -> FileResult<&mut [u8]> {
        let frame = self.pinned_frame(guard)?;
        Ok(&mut self.frames[frame].data)
    }

    /// Flag a pinned page as modified
    pub fn mark_dirty(&mut self, file: FileId, page_id: PageId) -> FileResult<()> {
        let key = BufferKey { file, page_id };
        let frame_id = *self
            .page_table
            .get(&key)
            .ok_or(FileError::InvalidPin(page_id))?;

        let frame = &mut self.frames[frame_id];
        if frame.pin_count == 0 {
            return Err(FileError::InvalidPin(page_id));
        }
        frame.dirty = true;
        Ok(())
    }

    /// Write one page back if it is buffered and dirty
    pub fn flush_page(&mut self, file: FileId, page_id: PageId) -> FileResult<()> {
        let key = BufferKey { file, page_id };
        if let Some(&frame_id) = self.page_table.get(&key) {
            let frame = &mut self.frames[frame_id];
            if frame.dirty {
                write_back(&mut self.files, key, &frame.data)?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Write back every dirty page of `file` in page order, then sync it.
    ///
    /// Pinned pages are written too; their pins are untouched.
    pub fn flush_pages(&mut self, file: FileId) -> FileResult<()> {
        let mut dirty: Vec<(PageId, FrameId)> = self
            .page_table
            .iter()
            .filter(|(key, frame)| key.file == file && self.frames[**frame].dirty)
            .map(|(key, frame)| (key.page_id, *frame))
            .collect();
        dirty.sort_unstable();

        for (page_id, frame_id) in &dirty {
            let key = BufferKey {
                file,
                page_id: *page_id,
            };
            let frame = &mut self.frames[*frame_id];
            write_back(&mut self.files, key, &frame.data)?;
            frame.dirty = false;
        }

        if !dirty.is_empty() {
            debug!("Flushed {} pages of file {}", dirty.len(), file.as_u64());
        }

        self.raw_file(file)?.sync()?;
        Ok(())
    }

    /// Flush every registered file
    pub fn flush_all(&mut self) -> FileResult<()> {
        let mut files: Vec<FileId> = self.files.keys().copied().collect();
        files.sort_unstable();
        for file in files {
            self.flush_pages(file)?;
        }
        Ok(())
    }

    /// Drop an unpinned page's binding without writing it back
    pub fn dispose_buffer(&mut self, file: FileId, page_id: PageId) -> FileResult<()> {
        let key = BufferKey { file, page_id };
        let Some(&frame) = self.page_table.get(&key) else {
            return Ok(());
        };

        if self.frames[frame].pin_count > 0 {
            return Err(FileError::PagePinned(page_id));
        }
        self.release(frame);
        Ok(())
    }

    /// Buffered pages of `file` with a live pin, in page order
    pub fn pinned_pages(&self, file: FileId) -> Vec<PageId> {
        let mut pinned: Vec<PageId> = self
            .page_table
            .iter()
            .filter(|(key, frame)| key.file == file && self.frames[**frame].pin_count > 0)
            .map(|(key, _)| key.page_id)
            .collect();
        pinned.sort_unstable();
        pinned
    }

    /// Write back and unbind every page of `file`; fails if any is pinned
    pub fn evict_file(&mut self, file: FileId) -> FileResult<()> {
        if let Some(&page_id) = self.pinned_pages(file).first() {
            return Err(FileError::PagePinned(page_id));
        }

        self.flush_pages(file)?;
        self.release_file(file);
        Ok(())
    }

    /// Unbind every page of `file`, pinned or dirty, without writing anything
    pub(crate) fn discard_file(&mut self, file: FileId) {
        self.release_file(file);
    }

    /// Release every slot bound to `file`.
    ///
    /// Slots go back highest id first so the free list hands them out in
    /// ascending order, independent of page table iteration order.
    fn release_file(&mut self, file: FileId) {
        let mut frames: Vec<FrameId> = self
            .page_table
            .iter()
            .filter(|(key, _)| key.file == file)
            .map(|(_, frame)| *frame)
            .collect();
        frames.sort_unstable_by(|a, b| b.cmp(a));
        for frame in frames {
            self.release(frame);
        }
    }

    /// Drop every binding unconditionally, scratch blocks included.
    ///
    /// Unflushed changes are lost; the number of dirty pages discarded is
    /// returned and logged. Outstanding guards become invalid.
    pub fn clear_buffer(&mut self) -> usize {
        let discarded = self.dirty_count();
        if discarded > 0 {
            warn!("Clearing buffer pool discards {} dirty pages", discarded);
        }

        for frame in &mut self.frames {
            frame.binding = Binding::Empty;
            frame.pin_count = 0;
            frame.dirty = false;
        }
        self.page_table.clear();
        self.replacer.clear();
        self.free_frames = (0..self.frames.len()).rev().collect();
        discarded
    }

    /// Take a zero-filled slot as scratch memory
    pub fn allocate_block(&mut self) -> FileResult<ScratchBlock> {
        let frame = self.acquire_frame()?;
        self.frames[frame].data.fill(0);
        let generation = self.bind(frame, Binding::Scratch);
        Ok(ScratchBlock {
            frame,
            generation,
            armed: true,
        })
    }

    fn scratch_frame(&self, block: &ScratchBlock) -> FileResult<FrameId> {
        let frame = &self.frames[block.frame];
        if frame.generation != block.generation || frame.binding != Binding::Scratch {
            return Err(FileError::StaleBlock);
        }
        Ok(block.frame)
    }

    pub fn block(&self, block: &ScratchBlock) -> FileResult<&[u8]> {
        let frame = self.scratch_frame(block)?;
        Ok(&self.frames[frame].data)
    }

    pub fn block_mut(&mut self, block: &ScratchBlock) -> FileResult<&mut [u8]> {
        let frame = self.scratch_frame(block)?;
        Ok(&mut self.frames[frame].data)
    }

    /// Return a scratch block's slot to the pool
    pub fn dispose_block(&mut self, mut block: ScratchBlock) -> FileResult<()> {
        block.armed = false;
        let frame = self.scratch_frame(&block)?;
        self.release(frame);
        Ok(())
    }

    /// Get the number of slots currently bound
    pub fn buffer_pool_size(&self) -> usize {
        self.frames.len() - self.free_frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Get the number of slots with a live pin
    pub fn pinned_count(&self) -> usize {
        self.frames.iter().filter(|f| f.pin_count > 0).count()
    }

    /// Get the number of dirty pages in the buffer pool
    pub fn dirty_count(&self) -> usize {
        self.frames.iter().filter(|f| f.dirty).count()
    }

    /// Check if a page is in the buffer pool
    pub fn is_page_cached(&self, file: FileId, page_id: PageId) -> bool {
        self.page_table.contains_key(&BufferKey { file, page_id })
    }

    /// Pin count of a buffered page
    pub fn pin_count(&self, file: FileId, page_id: PageId) -> Option<usize> {
        self.page_table
            .get(&BufferKey { file, page_id })
            .map(|&frame| self.frames[frame].pin_count)
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        // Page images alone would disagree with the unwritten file headers,
        // so files that were never closed keep their last flushed state
        let dirty = self.dirty_count();
        if dirty > 0 {
            warn!(
                "Buffer pool dropped with {} dirty pages of files that were not closed",
                dirty
            );
        }
    }
}
