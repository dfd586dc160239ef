//! Sequential heap file scanner.

use crate::disk::DiskManager;
use crate::heap::page::{HeapFileHeader, HeapPage};
use crate::record::RecordId;
use bytes::Bytes;
use marten_buffer::BufferPool;
use marten_common::page::{PageId, PAGE_SIZE};
use marten_common::Result;
use std::sync::Arc;

/// Cursor over every record of a heap file in (page, slot) order.
///
/// Used to drive bulk index builds. Exhaustion is reported as `Ok(None)`.
pub struct FileScan {
    /// Disk manager for page I/O.
    disk: Arc<DiskManager>,
    /// Buffer pool for page caching.
    pool: Arc<BufferPool>,
    /// File handle for the relation.
    file_id: u32,
    /// Fixed record length recovered from the file header.
    record_len: usize,
    /// Total pages in the file at scan start.
    num_pages: u32,
    /// Next page to visit (data pages start at 1).
    current_page: u32,
    /// Next slot to yield on the current page.
    current_slot: u16,
    /// Cached copy of the current page.
    page_buf: Option<HeapPage>,
}

impl FileScan {
    /// Opens a scanner over the named relation.
    pub fn new(relation_name: &str, disk: Arc<DiskManager>, pool: Arc<BufferPool>) -> Result<Self> {
        let file_id = disk.open(relation_name)?;
        let num_pages = disk.num_pages(file_id)?;

        let mut scan = Self {
            disk,
            pool,
            file_id,
            record_len: 0,
            num_pages,
            current_page: 1,
            current_slot: 0,
            page_buf: None,
        };
        let header_data = scan.fetch_page(0)?;
        scan.record_len = HeapFileHeader::decode_page(&header_data)?.record_len as usize;
        Ok(scan)
    }

    /// Returns the next record, or `Ok(None)` once the file is exhausted.
    pub fn scan_next(&mut self) -> Result<Option<(RecordId, Bytes)>> {
        loop {
            if self.current_page >= self.num_pages {
                return Ok(None);
            }

            if self.page_buf.is_none() {
                let data = self.fetch_page(self.current_page)?;
                self.page_buf = Some(HeapPage::from_bytes(data));
            }

            let page = self.page_buf.as_ref().expect("page cached above");
            match page.record(self.current_slot, self.record_len) {
                Some(record) => {
                    let rid = RecordId::new(self.current_page, self.current_slot);
                    let bytes = Bytes::copy_from_slice(record);
                    self.current_slot += 1;
                    return Ok(Some((rid, bytes)));
                }
                None => {
                    self.current_page += 1;
                    self.current_slot = 0;
                    self.page_buf = None;
                }
            }
        }
    }

    /// Fetches a page through the pool, loading from disk on a miss.
    fn fetch_page(&self, page_num: u32) -> Result<[u8; PAGE_SIZE]> {
        let page_id = PageId::new(self.file_id, page_num);

        if let Some(frame) = self.pool.fetch_page(page_id) {
            let data = frame.snapshot();
            self.pool.unpin_page(page_id, false)?;
            return Ok(data);
        }

        let disk_data = self.disk.read_page(page_id)?;
        let (frame, evicted) = self.pool.load_page(page_id, &disk_data)?;

        if let Some(evicted_page) = evicted {
            if let Err(e) = self.disk.write_page(evicted_page.page_id, &evicted_page.data) {
                let _ = self.pool.unpin_page(page_id, false);
                return Err(e);
            }
        }

        let data = frame.snapshot();
        self.pool.unpin_page(page_id, false)?;
        Ok(data)
    }
}
