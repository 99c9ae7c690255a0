use super::error::{FileError, FileResult};
use super::{PAGE_SIZE, PageId};

/// Encoded "no page" for header page links
const NO_PAGE: i32 = -1;

/// Encoded end of the free list
const LIST_END: i32 = -1;

/// Encoded marker for a page that has been handed out
const PAGE_USED: i32 = -2;

fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn encode_page(page: Option<PageId>) -> i32 {
    page.map_or(NO_PAGE, |id| id as i32)
}

fn decode_page(raw: i32, field: &str) -> FileResult<Option<PageId>> {
    match raw {
        NO_PAGE => Ok(None),
        id if id >= 0 => Ok(Some(id as PageId)),
        other => Err(FileError::CorruptHeader(format!("{} = {}", field, other))),
    }
}

/// File header stored in the first page-sized slot of every paged file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileHeader {
    pub first_free: Option<PageId>, // 4 bytes - Head of the free list
    pub num_pages: usize,           // 4 bytes - Usable pages after the header slot
    pub free_slot_page: Option<PageId>, // 4 bytes - Head of the upper layer's slot-page list
}

impl FileHeader {
    /// Encoded field width; the on-disk slot is padded to `DISK_SIZE`
    pub const SIZE: usize = 12;

    /// The header owns a whole page-sized slot at offset 0
    pub const DISK_SIZE: usize = PAGE_SIZE;

    /// Header of a freshly created file: every page is free, threaded from page 0
    pub fn new(num_pages: usize) -> Self {
        Self {
            first_free: if num_pages > 0 { Some(0) } else { None },
            num_pages,
            free_slot_page: None,
        }
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut result = [0u8; Self::SIZE];
        write_i32(&mut result, 0, encode_page(self.first_free));
        write_i32(&mut result, 4, self.num_pages as i32);
        write_i32(&mut result, 8, encode_page(self.free_slot_page));
        result
    }

    /// Serialize into a zero-padded slot ready to be written at offset 0
    pub fn to_disk_image(&self) -> Vec<u8> {
        let mut image = vec![0u8; Self::DISK_SIZE];
        image[..Self::SIZE].copy_from_slice(&self.serialize());
        image
    }

    pub fn deserialize(data: &[u8]) -> FileResult<Self> {
        if data.len() < Self::SIZE {
            return Err(FileError::HeaderRead { read: data.len() });
        }

        let first_free = decode_page(read_i32(data, 0), "first_free")?;
        let num_pages = read_i32(data, 4);
        if num_pages < 0 {
            return Err(FileError::CorruptHeader(format!("num_pages = {}", num_pages)));
        }
        let free_slot_page = decode_page(read_i32(data, 8), "free_slot_page")?;

        Ok(Self {
            first_free,
            num_pages: num_pages as usize,
            free_slot_page,
        })
    }

    /// Check the header against the size of the file it was read from
    pub fn validate(&self, file_len: u64) -> FileResult<()> {
        let slots = file_len / PAGE_SIZE as u64;
        if file_len % PAGE_SIZE as u64 != 0 || slots == 0 || self.num_pages as u64 != slots - 1 {
            return Err(FileError::CorruptHeader(format!(
                "num_pages {} does not match file length {}",
                self.num_pages, file_len
            )));
        }

        for (name, link) in [
            ("first_free", self.first_free),
            ("free_slot_page", self.free_slot_page),
        ] {
            if let Some(page_id) = link
                && page_id >= self.num_pages
            {
                return Err(FileError::CorruptHeader(format!(
                    "{} {} is beyond num_pages {}",
                    name, page_id, self.num_pages
                )));
            }
        }

        Ok(())
    }
}

/// Free-list link carried in every page header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextFree {
    /// Page is free; the next free page follows
    Page(PageId),
    /// Page is free and last on the list
    End,
    /// Page is in use
    Used,
}

impl NextFree {
    fn encode(self) -> i32 {
        match self {
            NextFree::Page(id) => id as i32,
            NextFree::End => LIST_END,
            NextFree::Used => PAGE_USED,
        }
    }

    fn decode(raw: i32) -> FileResult<Self> {
        match raw {
            LIST_END => Ok(NextFree::End),
            PAGE_USED => Ok(NextFree::Used),
            id if id >= 0 => Ok(NextFree::Page(id as PageId)),
            other => Err(FileError::CorruptHeader(format!("next_free = {}", other))),
        }
    }
}

/// Header stored at the beginning of each page
///
/// Only `page_id`, `is_full` and `next_free` are interpreted here. The slot
/// fields belong to the record layer and are merely initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub is_full: bool,        // 4 bytes
    pub next_free: NextFree,  // 4 bytes
    pub slot_num: i32,        // 4 bytes
    pub free_cnt: i32,        // 4 bytes
    pub next_slot_page: i32,  // 4 bytes
    pub empty_slot_num: i32,  // 4 bytes
    pub page_id: PageId,      // 4 bytes
}

impl PageHeader {
    pub const SIZE: usize = 28;

    /// Bytes available to the upper layer after the header
    pub const DATA_SIZE: usize = PAGE_SIZE - Self::SIZE;

    /// Header of an empty page with the given free-list link
    pub fn empty(page_id: PageId, next_free: NextFree) -> Self {
        Self {
            is_full: false,
            next_free,
            slot_num: 0,
            free_cnt: Self::DATA_SIZE as i32,
            next_slot_page: NO_PAGE,
            empty_slot_num: 0,
            page_id,
        }
    }

    pub fn is_free(&self) -> bool {
        self.next_free != NextFree::Used
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut result = [0u8; Self::SIZE];
        write_i32(&mut result, 0, self.is_full as i32);
        write_i32(&mut result, 4, self.next_free.encode());
        write_i32(&mut result, 8, self.slot_num);
        write_i32(&mut result, 12, self.free_cnt);
        write_i32(&mut result, 16, self.next_slot_page);
        write_i32(&mut result, 20, self.empty_slot_num);
        write_i32(&mut result, 24, self.page_id as i32);
        result
    }

    pub fn deserialize(data: &[u8]) -> FileResult<Self> {
        if data.len() < Self::SIZE {
            return Err(FileError::CorruptHeader(format!(
                "Not enough data for page header: {} bytes",
                data.len()
            )));
        }

        let page_id = read_i32(data, 24);
        if page_id < 0 {
            return Err(FileError::CorruptHeader(format!("page_id = {}", page_id)));
        }

        Ok(Self {
            is_full: read_i32(data, 0) != 0,
            next_free: NextFree::decode(read_i32(data, 4))?,
            slot_num: read_i32(data, 8),
            free_cnt: read_i32(data, 12),
            next_slot_page: read_i32(data, 16),
            empty_slot_num: read_i32(data, 20),
            page_id: page_id as PageId,
        })
    }

    /// Overwrite the header bytes of a page buffer in place
    pub fn write_to(&self, page: &mut [u8]) {
        page[..Self::SIZE].copy_from_slice(&self.serialize());
    }
}
