use super::*;
use std::cell::Cell;
use std::io;
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

/// Where the fault-injecting storage fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    SetLen,
    HeaderWriteError,
    ShortHeaderWrite,
    PageWrite(PageId),
    Sync,
}

/// Shared so a test can arm or clear the fault on files already open
type FaultSwitch = Rc<Cell<Fault>>;

struct FaultyStorage {
    fault: FaultSwitch,
}

struct FaultyFile {
    inner: Box<dyn RawFile>,
    fault: FaultSwitch,
}

fn injected() -> io::Error {
    io::Error::other("injected fault")
}

impl Storage for FaultyStorage {
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn RawFile>> {
        let inner = OsStorage.create_new(path)?;
        Ok(Box::new(FaultyFile {
            inner,
            fault: Rc::clone(&self.fault),
        }))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn RawFile>> {
        let inner = OsStorage.open(path)?;
        Ok(Box::new(FaultyFile {
            inner,
            fault: Rc::clone(&self.fault),
        }))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        OsStorage.remove(path)
    }
}

impl RawFile for FaultyFile {
    fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if self.fault.get() == Fault::SetLen {
            return Err(injected());
        }
        self.inner.set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        match self.fault.get() {
            Fault::HeaderWriteError if offset == 0 => Err(injected()),
            Fault::ShortHeaderWrite if offset == 0 => self.inner.write_at(0, &buf[..10]),
            Fault::PageWrite(page_id) if offset == page_offset(page_id) => Err(injected()),
            _ => self.inner.write_at(offset, buf),
        }
    }

    fn sync(&mut self) -> io::Result<()> {
        if self.fault.get() == Fault::Sync {
            return Err(injected());
        }
        self.inner.sync()
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.inner.close()
    }
}

fn manager(capacity: usize) -> PagedFileManager {
    PagedFileManager::new(BufferConfig::new(capacity, ReplacementAlgorithm::Lru)).unwrap()
}

fn faulty_manager(capacity: usize, fault: Fault) -> (PagedFileManager, FaultSwitch) {
    let config = BufferConfig::new(capacity, ReplacementAlgorithm::Lru);
    let switch = Rc::new(Cell::new(fault));
    let storage = FaultyStorage {
        fault: Rc::clone(&switch),
    };
    let pfm = PagedFileManager::with_storage(config, Box::new(storage)).unwrap();
    (pfm, switch)
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// Allocate `count` pages, stamping each with a byte pattern derived from its id
fn fill_pages(pfm: &mut PagedFileManager, handle: &mut FileHandle, count: usize) -> Vec<PageId> {
    let mut pages = Vec::new();
    for _ in 0..count {
        let (page_id, guard) = pfm.allocate_page(handle).unwrap();
        pfm.unpin_page(handle, guard).unwrap();
        handle
            .write_page(pfm.buffer_manager_mut(), page_id, |data| {
                data[..8].copy_from_slice(&(page_id as u64 * 31 + 7).to_le_bytes());
            })
            .unwrap();
        pages.push(page_id);
    }
    pages
}

fn stamp(pfm: &mut PagedFileManager, handle: &FileHandle, page_id: PageId) -> u64 {
    handle
        .read_page(pfm.buffer_manager_mut(), page_id, |data| {
            u64::from_le_bytes(data[..8].try_into().unwrap())
        })
        .unwrap()
}

#[test]
fn test_size_law() {
    let temp_dir = setup_test_dir();
    let mut pfm = manager(8);

    for exponent in MIN_SIZE_EXPONENT..=17 {
        let path = temp_dir.path().join(format!("size_{}.db", exponent));
        pfm.create_file(&path, exponent).unwrap();

        let file_size = 1u64 << exponent;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), file_size);

        let mut handle = pfm.open(&path).unwrap();
        assert_eq!(handle.num_pages() as u64, file_size / PAGE_SIZE as u64 - 1);
        pfm.close_file(&mut handle).unwrap();
    }
}

#[test]
fn test_free_list_complete_after_create() {
    let temp_dir = setup_test_dir();
    let path = temp_dir.path().join("test.db");
    // Pool smaller than the file so creation has to evict
    let mut pfm = manager(3);

    pfm.create_file(&path, 16).unwrap();
    let handle = pfm.open(&path).unwrap();

    let free = handle.free_pages(pfm.buffer_manager_mut()).unwrap();
    let expected: Vec<PageId> = (0..handle.num_pages()).collect();
    assert_eq!(free, expected);

    let last = handle
        .page_header(pfm.buffer_manager_mut(), handle.num_pages() - 1)
        .unwrap();
    assert_eq!(last.next_free, NextFree::End);
    assert_eq!(last.free_cnt, PageHeader::DATA_SIZE as i32);
    assert!(!last.is_full);
}

#[test]
fn test_atomic_creation_under_faults() {
    let temp_dir = setup_test_dir();

    let cases = [
        Fault::SetLen,
        Fault::HeaderWriteError,
        Fault::ShortHeaderWrite,
        Fault::PageWrite(0),
        Fault::PageWrite(5),
    ];
    for fault in cases {
        let path = temp_dir.path().join("faulty.db");
        let (mut pfm, _) = faulty_manager(2, fault);

        let result = pfm.create_file(&path, 15);
        match fault {
            Fault::ShortHeaderWrite => {
                assert!(matches!(result, Err(FileError::HeaderWrite { written: 10 })))
            }
            _ => assert!(matches!(result, Err(FileError::Io(_))), "{:?}", fault),
        }
        assert!(!path.exists(), "{:?} left a partial file", fault);
        assert_eq!(pfm.buffer_manager().buffer_pool_size(), 0, "{:?}", fault);
    }

    // The same storage without a fault creates the file
    let path = temp_dir.path().join("clean.db");
    let (mut pfm, _) = faulty_manager(2, Fault::None);
    pfm.create_file(&path, 15).unwrap();
    assert!(path.exists());
}

#[test]
fn test_atomic_creation_on_pool_exhaustion() {
    let temp_dir = setup_test_dir();
    let path = temp_dir.path().join("test.db");
    let mut pfm = manager(1);

    let block = pfm.allocate_block().unwrap();
    let result = pfm.create_file(&path, 14);
    assert!(matches!(result, Err(FileError::PoolExhausted)));
    assert!(!path.exists());

    pfm.dispose_block(block).unwrap();
    pfm.create_file(&path, 14).unwrap();
    assert!(path.exists());
}

#[test]
fn test_open_twice_rejected() {
    let temp_dir = setup_test_dir();
    let path = temp_dir.path().join("test.db");
    let other = temp_dir.path().join("other.db");
    let mut pfm = manager(4);
    pfm.create_file(&path, 14).unwrap();
    pfm.create_file(&other, 14).unwrap();

    let mut handle = FileHandle::new();
    pfm.open_file(&path, &mut handle).unwrap();
    let bound = handle.file_id().unwrap();

    let result = pfm.open_file(&other, &mut handle);
    assert!(matches!(result, Err(FileError::FileAlreadyOpen)));
    assert_eq!(handle.file_id().unwrap(), bound);
    assert_eq!(handle.path(), Some(path.as_path()));
    let next = FileId::new(bound.pool, bound.as_u64() + 1);
    assert!(!pfm.buffer_manager().is_file_registered(next));

    pfm.close_file(&mut handle).unwrap();
    pfm.open_file(&other, &mut handle).unwrap();
}

#[test]
fn test_pin_safety_under_mixed_workload() {
    let temp_dir = setup_test_dir();
    let path = temp_dir.path().join("test.db");
    let capacity = 4;
    let mut pfm = manager(capacity);
    pfm.create_file(&path, 16).unwrap();
    let mut handle = pfm.open(&path).unwrap();
    let pages = fill_pages(&mut pfm, &mut handle, 12);

    // xorshift keeps the access history reproducible
    let mut state: u32 = 0x9e37_79b9;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };

    let mut held: Vec<PageGuard> = Vec::new();
    for _ in 0..500 {
        let roll = next();
        if roll % 3 == 0 && !held.is_empty() {
            let guard = held.remove(roll as usize % held.len());
            pfm.unpin_page(&handle, guard).unwrap();
        } else {
            let page_id = pages[roll as usize % pages.len()];
            let already_buffered = pfm
                .buffer_manager()
                .is_page_cached(handle.file_id().unwrap(), page_id);
            let all_pinned = pfm.buffer_manager().pinned_count() == capacity;
            match pfm.get_page(&handle, page_id) {
                Ok(guard) => held.push(guard),
                Err(FileError::PoolExhausted) => assert!(all_pinned && !already_buffered),
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let file = handle.file_id().unwrap();
        for guard in &held {
            assert!(pfm.buffer_manager().is_page_cached(file, guard.page_id()));
        }
        assert!(pfm.buffer_manager().buffer_pool_size() <= capacity);
    }

    for guard in held {
        pfm.unpin_page(&handle, guard).unwrap();
    }
    for &page_id in &pages {
        assert_eq!(stamp(&mut pfm, &handle, page_id), page_id as u64 * 31 + 7);
    }
    pfm.close_file(&mut handle).unwrap();
}

#[test]
fn test_dirty_round_trip_across_eviction() {
    for algorithm in [
        ReplacementAlgorithm::Lru,
        ReplacementAlgorithm::Mru,
        ReplacementAlgorithm::Fifo,
        ReplacementAlgorithm::Clock,
    ] {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.db");
        let config = BufferConfig::new(3, algorithm);
        let mut pfm = PagedFileManager::new(config).unwrap();
        pfm.create_file(&path, 15).unwrap();
        let mut handle = pfm.open(&path).unwrap();

        let pages = fill_pages(&mut pfm, &mut handle, 7);
        for &page_id in &pages {
            assert_eq!(
                stamp(&mut pfm, &handle, page_id),
                page_id as u64 * 31 + 7,
                "{}",
                algorithm
            );
        }
        pfm.close_file(&mut handle).unwrap();
    }
}

#[test]
fn test_close_flushes_pages_and_header() {
    let temp_dir = setup_test_dir();
    let path = temp_dir.path().join("test.db");

    {
        let mut pfm = manager(16);
        pfm.create_file(&path, 15).unwrap();
        let mut handle = pfm.open(&path).unwrap();
        fill_pages(&mut pfm, &mut handle, 4);
        pfm.dispose_page(&mut handle, 2).unwrap();
        handle.set_free_slot_page(Some(1)).unwrap();
        pfm.close_file(&mut handle).unwrap();
    }

    // A new manager has no buffered state to fall back on
    let mut pfm = manager(16);
    let handle = pfm.open(&path).unwrap();
    assert_eq!(handle.header().first_free, Some(2));
    assert_eq!(handle.free_slot_page(), Some(1));
    assert_eq!(
        handle.free_pages(pfm.buffer_manager_mut()).unwrap(),
        vec![2, 4, 5, 6]
    );

    for page_id in [0, 1, 3] {
        assert_eq!(stamp(&mut pfm, &handle, page_id), page_id as u64 * 31 + 7);
    }
    assert!(matches!(
        pfm.get_page(&handle, 2),
        Err(FileError::InvalidPage(2))
    ));
}

#[test]
fn test_files_share_one_pool() {
    let temp_dir = setup_test_dir();
    let first_path = temp_dir.path().join("first.db");
    let second_path = temp_dir.path().join("second.db");
    let mut pfm = manager(2);
    pfm.create_file(&first_path, 14).unwrap();
    pfm.create_file(&second_path, 14).unwrap();

    let mut first = pfm.open(&first_path).unwrap();
    let mut second = pfm.open(&second_path).unwrap();

    let (a, guard) = pfm.allocate_page(&mut first).unwrap();
    pfm.page_mut(&guard).unwrap()[PageHeader::SIZE] = 11;
    pfm.mark_dirty(&first, a).unwrap();
    pfm.unpin_page(&first, guard).unwrap();

    let (b, guard) = pfm.allocate_page(&mut second).unwrap();
    pfm.page_mut(&guard).unwrap()[PageHeader::SIZE] = 22;
    pfm.mark_dirty(&second, b).unwrap();
    pfm.unpin_page(&second, guard).unwrap();

    assert_eq!(a, b);
    assert_eq!(stamp(&mut pfm, &first, a) as u8, 11);
    assert_eq!(stamp(&mut pfm, &second, b) as u8, 22);

    pfm.close_file(&mut first).unwrap();
    // Closing one file leaves the other's pages alone
    assert!(pfm.buffer_manager().is_page_cached(second.file_id().unwrap(), b));
    pfm.close_file(&mut second).unwrap();
}

#[test]
fn test_force_pages_persists_without_close() {
    let temp_dir = setup_test_dir();
    let path = temp_dir.path().join("test.db");
    let mut pfm = manager(8);
    pfm.create_file(&path, 14).unwrap();
    let mut handle = pfm.open(&path).unwrap();

    let pages = fill_pages(&mut pfm, &mut handle, 2);
    pfm.force_pages(&mut handle, None).unwrap();
    assert_eq!(pfm.buffer_manager().dirty_count(), 0);

    // Read the raw file independently of the pool
    let bytes = std::fs::read(&path).unwrap();
    let header = FileHeader::deserialize(&bytes).unwrap();
    assert_eq!(header.first_free, Some(2));
    let offset = page_offset(pages[1]) as usize + PageHeader::SIZE;
    let stored = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
    assert_eq!(stored, pages[1] as u64 * 31 + 7);

    pfm.close_file(&mut handle).unwrap();
}

#[test]
fn test_clear_buffer_loses_unflushed_changes() {
    let temp_dir = setup_test_dir();
    let path = temp_dir.path().join("test.db");
    let mut pfm = manager(8);
    pfm.create_file(&path, 14).unwrap();
    let mut handle = pfm.open(&path).unwrap();

    let pages = fill_pages(&mut pfm, &mut handle, 1);
    pfm.force_pages(&mut handle, None).unwrap();
    handle
        .write_page(pfm.buffer_manager_mut(), pages[0], |data| data[0] = 0xff)
        .unwrap();

    assert_eq!(pfm.clear_buffer(), 1);
    assert_eq!(stamp(&mut pfm, &handle, pages[0]), pages[0] as u64 * 31 + 7);
    pfm.close_file(&mut handle).unwrap();
}

#[test]
fn test_close_propagates_flush_failure() {
    for fault in [Fault::HeaderWriteError, Fault::PageWrite(1), Fault::Sync] {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.db");
        let (mut pfm, switch) = faulty_manager(8, Fault::None);
        pfm.create_file(&path, 14).unwrap();
        let mut handle = pfm.open(&path).unwrap();
        let pages = fill_pages(&mut pfm, &mut handle, 2);

        switch.set(fault);
        let result = pfm.close_file(&mut handle);
        assert!(matches!(result, Err(FileError::Io(_))), "{:?}", fault);

        // Still open and still registered, so the caller can retry
        assert!(handle.is_open(), "{:?}", fault);
        let file = handle.file_id().unwrap();
        assert!(pfm.buffer_manager().is_file_registered(file), "{:?}", fault);

        switch.set(Fault::None);
        pfm.close_file(&mut handle).unwrap();
        assert!(!handle.is_open());

        let mut pfm = manager(8);
        let handle = pfm.open(&path).unwrap();
        assert_eq!(handle.header().first_free, Some(2), "{:?}", fault);
        for &page_id in &pages {
            assert_eq!(stamp(&mut pfm, &handle, page_id), page_id as u64 * 31 + 7);
        }
    }
}

#[test]
fn test_unclosed_file_keeps_last_flushed_state() {
    let temp_dir = setup_test_dir();
    let path = temp_dir.path().join("test.db");

    {
        let mut pfm = manager(8);
        pfm.create_file(&path, 14).unwrap();
        let mut handle = pfm.open(&path).unwrap();
        let (page_id, guard) = pfm.allocate_page(&mut handle).unwrap();
        assert_eq!(page_id, 0);
        pfm.unpin_page(&handle, guard).unwrap();
        // Dropped without close_file
    }

    let mut pfm = manager(8);
    let mut handle = pfm.open(&path).unwrap();
    assert_eq!(
        handle.free_pages(pfm.buffer_manager_mut()).unwrap(),
        vec![0, 1, 2]
    );

    let (page_id, guard) = pfm.allocate_page(&mut handle).unwrap();
    assert_eq!(page_id, 0);
    pfm.unpin_page(&handle, guard).unwrap();
    pfm.close_file(&mut handle).unwrap();
}

#[test]
fn test_handle_rejected_by_other_pool() {
    let temp_dir = setup_test_dir();
    let first_path = temp_dir.path().join("first.db");
    let second_path = temp_dir.path().join("second.db");
    let mut first_pfm = manager(4);
    let mut second_pfm = manager(4);
    first_pfm.create_file(&first_path, 14).unwrap();
    second_pfm.create_file(&second_path, 14).unwrap();

    let mut first = first_pfm.open(&first_path).unwrap();
    let mut second = second_pfm.open(&second_path).unwrap();

    // Both are the first file of their pool, yet the ids differ
    let first_id = first.file_id().unwrap();
    let second_id = second.file_id().unwrap();
    assert_eq!(first_id.as_u64(), second_id.as_u64());
    assert_ne!(first_id, second_id);

    let result = first.allocate_page(second_pfm.buffer_manager_mut());
    assert!(matches!(result, Err(FileError::FileNotOpen)));
    assert_eq!(first.header().first_free, Some(0));
    assert!(!first.is_header_dirty());

    let result = first.page_header(second_pfm.buffer_manager_mut(), 1);
    assert!(matches!(result, Err(FileError::FileNotOpen)));
    assert_eq!(second_pfm.buffer_manager().buffer_pool_size(), 0);

    first_pfm.close_file(&mut first).unwrap();
    second_pfm.close_file(&mut second).unwrap();
}
