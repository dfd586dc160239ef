//! HeapFile manager with buffer pool integration.
//!
//! All page I/O is routed through the buffer pool. Pages are fetched from
//! the pool, modified in memory, marked dirty on unpin, and written back
//! lazily; dirty pages displaced by eviction are written out immediately.

use crate::disk::DiskManager;
use crate::heap::page::{HeapFileHeader, HeapPage};
use crate::record::RecordId;
use bytes::Bytes;
use marten_buffer::BufferPool;
use marten_common::page::{PageId, PAGE_SIZE};
use marten_common::{MartenError, Result};
use std::sync::Arc;

/// Heap file storing fixed-length records for one relation.
///
/// Page 0 carries the file header (record length); data pages follow.
/// Records are append-only, which is all the index build path needs.
pub struct HeapFile {
    /// Disk manager for page I/O.
    disk: Arc<DiskManager>,
    /// Buffer pool for page caching.
    pool: Arc<BufferPool>,
    /// File handle for the relation.
    file_id: u32,
    /// Relation name the file was opened under.
    name: String,
    /// Fixed record length.
    record_len: usize,
}

impl HeapFile {
    /// Creates a new heap file for a relation.
    pub fn create(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        name: &str,
        record_len: usize,
    ) -> Result<Self> {
        if record_len == 0 || record_len > PAGE_SIZE - crate::heap::HEAP_PAGE_HEADER_SIZE {
            return Err(MartenError::RecordSizeMismatch {
                expected: PAGE_SIZE - crate::heap::HEAP_PAGE_HEADER_SIZE,
                actual: record_len,
            });
        }

        let file_id = disk.create(name)?;
        let header_page = disk.allocate_page(file_id)?;
        let header = HeapFileHeader {
            record_len: record_len as u16,
        };

        let heap = Self {
            disk,
            pool,
            file_id,
            name: name.to_string(),
            record_len,
        };
        heap.write_page(header_page, &header.encode_page())?;
        Ok(heap)
    }

    /// Opens an existing heap file, recovering the record length from its
    /// header page.
    pub fn open(disk: Arc<DiskManager>, pool: Arc<BufferPool>, name: &str) -> Result<Self> {
        let file_id = disk.open(name)?;

        let mut heap = Self {
            disk,
            pool,
            file_id,
            name: name.to_string(),
            record_len: 0,
        };
        let header_data = heap.fetch_page(PageId::new(file_id, 0))?;
        heap.record_len = HeapFileHeader::decode_page(&header_data)?.record_len as usize;
        Ok(heap)
    }

    /// Returns the relation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the fixed record length.
    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// Returns the number of pages in the file, header page included.
    pub fn num_pages(&self) -> Result<u32> {
        self.disk.num_pages(self.file_id)
    }

    /// Appends a record, returning its RecordId.
    pub fn insert(&self, record: &[u8]) -> Result<RecordId> {
        if record.len() != self.record_len {
            return Err(MartenError::RecordSizeMismatch {
                expected: self.record_len,
                actual: record.len(),
            });
        }

        // Try the last data page first; allocate when absent or full.
        let num_pages = self.disk.num_pages(self.file_id)?;
        if num_pages > 1 {
            let last_page_id = PageId::new(self.file_id, num_pages - 1);
            let mut page = HeapPage::from_bytes(self.fetch_page(last_page_id)?);
            match page.insert_record(record) {
                Ok(slot) => {
                    self.write_page(last_page_id, page.as_bytes())?;
                    return Ok(RecordId::new(last_page_id.page_num, slot));
                }
                Err(MartenError::PageFull) => {}
                Err(e) => return Err(e),
            }
        }

        let page_id = self.disk.allocate_page(self.file_id)?;
        let mut page = HeapPage::new();
        let slot = page.insert_record(record)?;
        self.write_page(page_id, page.as_bytes())?;
        Ok(RecordId::new(page_id.page_num, slot))
    }

    /// Retrieves a record by its RecordId.
    pub fn get(&self, rid: RecordId) -> Result<Option<Bytes>> {
        let num_pages = self.disk.num_pages(self.file_id)?;
        if rid.page_num == 0 || rid.page_num >= num_pages {
            return Ok(None);
        }

        let page_data = self.fetch_page(PageId::new(self.file_id, rid.page_num))?;
        let page = HeapPage::from_bytes(page_data);
        Ok(page
            .record(rid.slot_num, self.record_len)
            .map(Bytes::copy_from_slice))
    }

    /// Flushes all dirty pages of this file to disk.
    pub fn flush(&self) -> Result<()> {
        self.pool
            .flush_file(self.file_id, |page_id, data| {
                let mut buf = [0u8; PAGE_SIZE];
                buf.copy_from_slice(data);
                self.disk.write_page(page_id, &buf)
            })?;
        self.disk.flush_file(self.file_id)
    }

    /// Fetches a page through the pool, loading from disk on a miss.
    /// The pin is held for the duration of the copy-out.
    fn fetch_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
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

    /// Writes a page through the pool, marking it dirty.
    fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if let Some(frame) = self.pool.fetch_page(page_id) {
            frame.overwrite(data);
            self.pool.unpin_page(page_id, true)?;
            return Ok(());
        }

        let (frame, evicted) = self.pool.new_page(page_id)?;

        if let Some(evicted_page) = evicted {
            if let Err(e) = self.disk.write_page(evicted_page.page_id, &evicted_page.data) {
                let _ = self.pool.unpin_page(page_id, false);
                return Err(e);
            }
        }

        frame.overwrite(data);
        self.pool.unpin_page(page_id, true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_buffer::BufferPoolConfig;
    use marten_common::StorageConfig;
    use tempfile::tempdir;

    fn create_test_heap(record_len: usize) -> (HeapFile, Arc<BufferPool>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let disk = Arc::new(DiskManager::new(&config).unwrap());
        let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames: 64 }));
        let heap = HeapFile::create(disk, pool.clone(), "orders", record_len).unwrap();
        (heap, pool, dir)
    }

    #[test]
    fn test_heap_file_create() {
        let (heap, _pool, _dir) = create_test_heap(32);
        assert_eq!(heap.name(), "orders");
        assert_eq!(heap.record_len(), 32);
        // Header page only
        assert_eq!(heap.num_pages().unwrap(), 1);
    }

    #[test]
    fn test_heap_file_create_rejects_bad_record_len() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let disk = Arc::new(DiskManager::new(&config).unwrap());
        let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames: 8 }));

        let result = HeapFile::create(disk, pool, "orders", 0);
        assert!(matches!(result, Err(MartenError::RecordSizeMismatch { .. })));
    }

    #[test]
    fn test_heap_file_insert_and_get() {
        let (heap, _pool, _dir) = create_test_heap(16);

        let record = [0x5Au8; 16];
        let rid = heap.insert(&record).unwrap();
        assert_eq!(rid.page_num, 1);
        assert_eq!(rid.slot_num, 0);

        let fetched = heap.get(rid).unwrap().unwrap();
        assert_eq!(&fetched[..], &record);
    }

    #[test]
    fn test_heap_file_insert_wrong_length() {
        let (heap, _pool, _dir) = create_test_heap(16);

        let result = heap.insert(&[0u8; 15]);
        assert!(matches!(
            result,
            Err(MartenError::RecordSizeMismatch {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn test_heap_file_get_nonexistent() {
        let (heap, _pool, _dir) = create_test_heap(16);
        heap.insert(&[1u8; 16]).unwrap();

        assert!(heap.get(RecordId::new(0, 0)).unwrap().is_none());
        assert!(heap.get(RecordId::new(99, 0)).unwrap().is_none());
        assert!(heap.get(RecordId::new(1, 99)).unwrap().is_none());
    }

    #[test]
    fn test_heap_file_spans_pages() {
        let record_len = 1024;
        let (heap, _pool, _dir) = create_test_heap(record_len);
        let per_page = HeapPage::capacity(record_len);

        let mut rids = Vec::new();
        for i in 0..(per_page * 3) {
            let record = vec![(i % 251) as u8; record_len];
            rids.push(heap.insert(&record).unwrap());
        }

        // Header page plus three data pages
        assert_eq!(heap.num_pages().unwrap(), 4);
        assert_eq!(rids[0].page_num, 1);
        assert_eq!(rids[per_page].page_num, 2);

        for (i, rid) in rids.iter().enumerate() {
            let record = heap.get(*rid).unwrap().unwrap();
            assert_eq!(record[0], (i % 251) as u8);
        }
    }

    #[test]
    fn test_heap_file_reopen() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let disk = Arc::new(DiskManager::new(&config).unwrap());
        let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames: 64 }));

        let rid = {
            let heap =
                HeapFile::create(disk.clone(), pool.clone(), "orders", 24).unwrap();
            let rid = heap.insert(&[0x77u8; 24]).unwrap();
            heap.flush().unwrap();
            rid
        };

        let heap = HeapFile::open(disk, pool, "orders").unwrap();
        assert_eq!(heap.record_len(), 24);
        let record = heap.get(rid).unwrap().unwrap();
        assert_eq!(&record[..], &[0x77u8; 24]);
    }

    #[test]
    fn test_heap_file_no_pins_left_behind() {
        let (heap, pool, _dir) = create_test_heap(64);

        for i in 0..100u8 {
            heap.insert(&[i; 64]).unwrap();
        }
        heap.get(RecordId::new(1, 5)).unwrap();

        assert_eq!(pool.stats().pinned_frames, 0);
    }
}
