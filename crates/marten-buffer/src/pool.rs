//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::replacer::{ReplacementPolicy, SecondChanceReplacer};
use marten_common::page::{PageId, PAGE_SIZE};
use marten_common::{MartenError, Result, StorageConfig};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Information about a dirty page that was evicted from the buffer pool.
/// Caller must write this to disk to prevent data loss.
#[derive(Debug)]
pub struct EvictedPage {
    pub page_id: PageId,
    pub data: Box<[u8; PAGE_SIZE]>,
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

impl From<&StorageConfig> for BufferPoolConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            num_frames: config.buffer_pool_pages,
        }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping
/// - Free frame list for new pages
/// - Second-chance replacement; only unpinned frames are candidates
/// - Pin counting with dirty tracking on unpin
///
/// The pool performs no I/O of its own. Dirty victims are handed back as
/// [`EvictedPage`] values and flushes go through a caller-supplied
/// write-back function.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping.
    page_table: Mutex<HashMap<PageId, FrameId>>,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: SecondChanceReplacer,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(config: BufferPoolConfig) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: Mutex::new(HashMap::with_capacity(num_frames)),
            free_list: Mutex::new(free_list),
            replacer: SecondChanceReplacer::new(num_frames),
        }
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.lock().len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.lock().contains_key(&page_id)
    }

    /// Fetches a resident page, pinning it.
    ///
    /// Returns None if the page is not in the pool; the caller is then
    /// expected to load it from disk via [`BufferPool::load_page`].
    #[inline]
    pub fn fetch_page(&self, page_id: PageId) -> Option<&BufferFrame> {
        let frame_id = *self.page_table.lock().get(&page_id)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.pin();
        self.replacer.touch(frame_id);
        self.replacer.withdraw(frame_id);
        Some(frame)
    }

    /// Allocates a frame for a new page.
    ///
    /// Tries the free list first, then evicts an unpinned candidate.
    /// Returns the frame ID and any evicted dirty page that must be
    /// written to disk.
    fn allocate_frame(&self) -> Result<(FrameId, Option<EvictedPage>)> {
        {
            let mut free_list = self.free_list.lock();
            if let Some(frame_id) = free_list.pop() {
                return Ok((frame_id, None));
            }
        }

        // Candidates are exactly the frames whose pin count reached zero,
        // so any victim is safe to repurpose.
        let victim_id = self
            .replacer
            .pick_victim()
            .ok_or(MartenError::BufferPoolFull)?;
        let frame = &self.frames[victim_id.0 as usize];
        debug_assert!(!frame.is_pinned());

        let (old_page, write_back) = frame.evict();
        if let Some(page_id) = old_page {
            self.page_table.lock().remove(&page_id);
        }
        let evicted = match (old_page, write_back) {
            (Some(page_id), Some(data)) => Some(EvictedPage { page_id, data }),
            _ => None,
        };

        Ok((victim_id, evicted))
    }

    /// Admits a page into the pool, pinning it.
    ///
    /// An already-resident page is pinned and returned as-is (the image
    /// argument is ignored; the resident copy is authoritative).
    fn admit(
        &self,
        page_id: PageId,
        image: Option<&[u8]>,
    ) -> Result<(&BufferFrame, Option<EvictedPage>)> {
        if let Some(frame_id) = self.page_table.lock().get(&page_id).copied() {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.touch(frame_id);
            self.replacer.withdraw(frame_id);
            return Ok((frame, None));
        }

        let (frame_id, evicted) = self.allocate_frame()?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.install(page_id, image);
        frame.pin();

        self.page_table.lock().insert(page_id, frame_id);

        Ok((frame, evicted))
    }

    /// Makes a frame available for a freshly allocated page, pinned and
    /// zero-filled.
    ///
    /// Returns (frame, evicted) where evicted contains any dirty page
    /// that was displaced to make room; the caller must write it to disk.
    pub fn new_page(&self, page_id: PageId) -> Result<(&BufferFrame, Option<EvictedPage>)> {
        self.admit(page_id, None)
    }

    /// Loads a page image read from disk into the pool, pinned.
    pub fn load_page(
        &self,
        page_id: PageId,
        data: &[u8],
    ) -> Result<(&BufferFrame, Option<EvictedPage>)> {
        self.admit(page_id, Some(data))
    }

    /// Unpins a page, ORing in the dirty flag.
    ///
    /// When the pin count drops to zero the frame becomes an eviction
    /// candidate. Unpinning a page that is not resident fails with
    /// `BadBuffer`.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let frame_id = self
            .page_table
            .lock()
            .get(&page_id)
            .copied()
            .ok_or(MartenError::BadBuffer)?;
        let frame = &self.frames[frame_id.0 as usize];

        if is_dirty {
            frame.mark_dirty();
        }

        if frame.unpin() == 0 {
            self.replacer.enqueue(frame_id);
        }
        Ok(())
    }

    /// Flushes all dirty resident pages of a file through the callback.
    ///
    /// Fails with `PagePinned` if any page of the file is still pinned;
    /// nothing is written in that case. Returns the number of pages
    /// flushed; their dirty flags are cleared.
    pub fn flush_file<F>(&self, file_id: u32, mut flush_fn: F) -> Result<usize>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let file_pages: Vec<(PageId, FrameId)> = self
            .page_table
            .lock()
            .iter()
            .filter(|(page_id, _)| page_id.file_id == file_id)
            .map(|(&page_id, &frame_id)| (page_id, frame_id))
            .collect();

        for &(page_id, frame_id) in &file_pages {
            if self.frames[frame_id.0 as usize].is_pinned() {
                return Err(MartenError::PagePinned { page_id });
            }
        }

        let mut flushed = 0;
        for (page_id, frame_id) in file_pages {
            let frame = &self.frames[frame_id.0 as usize];
            if let Some(image) = frame.dirty_image() {
                flush_fn(page_id, &image[..])?;
                frame.clear_dirty();
                flushed += 1;
            }
        }

        Ok(flushed)
    }

    /// Deletes a page from the buffer pool, discarding its image.
    ///
    /// Returns true if the page was deleted.
    /// Returns false if the page is pinned or not in the pool.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut page_table = self.page_table.lock();
        if let Some(frame_id) = page_table.remove(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            // Cannot delete a pinned page; re-insert
            if frame.is_pinned() {
                page_table.insert(page_id, frame_id);
                return false;
            }

            self.replacer.withdraw(frame_id);
            frame.evict();
            self.free_list.lock().push(frame_id);

            return true;
        }
        false
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        let page_table = self.page_table.lock();
        for &frame_id in page_table.values() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_count += 1;
            }
            if frame.is_dirty() {
                dirty_count += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_list.lock().len(),
            used_frames: page_table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pool(num_frames: usize) -> BufferPool {
        BufferPool::new(BufferPoolConfig { num_frames })
    }

    #[test]
    fn test_buffer_pool_new() {
        let pool = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn test_buffer_pool_config_from_storage_config() {
        let storage = StorageConfig {
            buffer_pool_pages: 256,
            ..Default::default()
        };
        let config = BufferPoolConfig::from(&storage);
        assert_eq!(config.num_frames, 256);
    }

    #[test]
    fn test_buffer_pool_new_page() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        let (frame, evicted) = pool.new_page(page_id).unwrap();

        assert!(evicted.is_none());
        assert_eq!(frame.holds(), Some(page_id));
        assert!(frame.is_pinned());
        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.page_count(), 1);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_fetch_existing() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        pool.new_page(page_id).unwrap();
        pool.unpin_page(page_id, false).unwrap();

        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.holds(), Some(page_id));
        assert!(frame.is_pinned());
    }

    #[test]
    fn test_buffer_pool_fetch_nonexistent() {
        let pool = create_test_pool(10);
        assert!(pool.fetch_page(PageId::new(0, 1)).is_none());
    }

    #[test]
    fn test_buffer_pool_unpin() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        let (frame, _) = pool.new_page(page_id).unwrap();
        assert!(frame.is_pinned());

        pool.unpin_page(page_id, false).unwrap();
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_buffer_pool_unpin_nonresident() {
        let pool = create_test_pool(10);
        let result = pool.unpin_page(PageId::new(0, 99), false);
        assert!(matches!(result, Err(MartenError::BadBuffer)));
    }

    #[test]
    fn test_buffer_pool_dirty_tracking() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        pool.new_page(page_id).unwrap();
        pool.unpin_page(page_id, true).unwrap();

        let frame = pool.fetch_page(page_id).unwrap();
        assert!(frame.is_dirty());
        pool.unpin_page(page_id, false).unwrap();
        // A clean unpin does not clear a previously set dirty flag
        assert!(frame.is_dirty());
    }

    #[test]
    fn test_buffer_pool_eviction() {
        let pool = create_test_pool(3);

        for i in 0..3 {
            let page_id = PageId::new(0, i);
            pool.new_page(page_id).unwrap();
            pool.unpin_page(page_id, false).unwrap();
        }

        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.page_count(), 3);

        // Add one more page, should evict
        let new_page_id = PageId::new(0, 99);
        let (_, evicted) = pool.new_page(new_page_id).unwrap();

        assert!(evicted.is_none()); // Evicted page was clean
        assert_eq!(pool.page_count(), 3);
        assert!(pool.contains(new_page_id));
    }

    #[test]
    fn test_buffer_pool_eviction_dirty() {
        let pool = create_test_pool(1);
        let page_id1 = PageId::new(0, 1);

        let (frame, _) = pool.new_page(page_id1).unwrap();
        let mut image = [0u8; PAGE_SIZE];
        image[0] = 0xAB;
        frame.overwrite(&image);
        pool.unpin_page(page_id1, true).unwrap();

        // Add another page, should hand back the dirty victim
        let page_id2 = PageId::new(0, 2);
        let (_, evicted) = pool.new_page(page_id2).unwrap();

        let evicted = evicted.expect("dirty page should be returned on eviction");
        assert_eq!(evicted.page_id, page_id1);
        assert_eq!(evicted.data[0], 0xAB);
    }

    #[test]
    fn test_buffer_pool_eviction_prefers_cold_pages() {
        let pool = create_test_pool(3);

        for i in 0..3 {
            let page_id = PageId::new(0, i);
            pool.new_page(page_id).unwrap();
            pool.unpin_page(page_id, false).unwrap();
        }

        // Re-reading page 0 grants it a second chance
        pool.fetch_page(PageId::new(0, 0)).unwrap();
        pool.unpin_page(PageId::new(0, 0), false).unwrap();

        pool.new_page(PageId::new(0, 99)).unwrap();

        assert!(pool.contains(PageId::new(0, 0)));
        assert!(!pool.contains(PageId::new(0, 1)));
    }

    #[test]
    fn test_buffer_pool_full_all_pinned() {
        let pool = create_test_pool(2);

        pool.new_page(PageId::new(0, 1)).unwrap();
        pool.new_page(PageId::new(0, 2)).unwrap();

        let result = pool.new_page(PageId::new(0, 3));
        assert!(matches!(result, Err(MartenError::BufferPoolFull)));
    }

    #[test]
    fn test_buffer_pool_pinned_page_not_evicted() {
        let pool = create_test_pool(2);
        let pinned_id = PageId::new(0, 1);

        pool.new_page(pinned_id).unwrap(); // stays pinned
        let other_id = PageId::new(0, 2);
        pool.new_page(other_id).unwrap();
        pool.unpin_page(other_id, false).unwrap();

        // Only the unpinned page may be displaced
        pool.new_page(PageId::new(0, 3)).unwrap();
        assert!(pool.contains(pinned_id));
        assert!(!pool.contains(other_id));
    }

    #[test]
    fn test_buffer_pool_load_page() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);
        let data = [0xABu8; PAGE_SIZE];

        let (frame, _) = pool.load_page(page_id, &data).unwrap();

        // Loaded image is resident and clean (it matches disk)
        let snap = frame.snapshot();
        assert_eq!(snap[0], 0xAB);
        assert_eq!(snap[100], 0xAB);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_buffer_pool_flush_file() {
        let pool = create_test_pool(10);

        for i in 0..5 {
            let page_id = PageId::new(7, i);
            pool.new_page(page_id).unwrap();
            pool.unpin_page(page_id, i % 2 == 0).unwrap();
        }

        let mut flushed_pages = vec![];
        let flushed = pool
            .flush_file(7, |pid, _data| {
                flushed_pages.push(pid);
                Ok(())
            })
            .unwrap();

        // Pages 0, 2, 4 were dirty
        assert_eq!(flushed, 3);
        assert_eq!(flushed_pages.len(), 3);
        assert_eq!(pool.stats().dirty_frames, 0);
    }

    #[test]
    fn test_buffer_pool_flush_file_skips_other_files() {
        let pool = create_test_pool(10);

        pool.new_page(PageId::new(1, 0)).unwrap();
        pool.unpin_page(PageId::new(1, 0), true).unwrap();
        pool.new_page(PageId::new(2, 0)).unwrap();
        pool.unpin_page(PageId::new(2, 0), true).unwrap();

        let flushed = pool.flush_file(1, |_pid, _data| Ok(())).unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(pool.stats().dirty_frames, 1);
    }

    #[test]
    fn test_buffer_pool_flush_file_pinned() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(3, 0);

        pool.new_page(page_id).unwrap(); // stays pinned

        let result = pool.flush_file(3, |_pid, _data| Ok(()));
        assert!(matches!(
            result,
            Err(MartenError::PagePinned { page_id: p }) if p == page_id
        ));
    }

    #[test]
    fn test_buffer_pool_delete_page() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        pool.new_page(page_id).unwrap();
        pool.unpin_page(page_id, false).unwrap();

        assert!(pool.contains(page_id));
        assert!(pool.delete_page(page_id));
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_buffer_pool_delete_pinned_page() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        pool.new_page(page_id).unwrap();
        // Don't unpin

        assert!(!pool.delete_page(page_id));
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_duplicate_new_page() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        pool.new_page(page_id).unwrap();
        pool.unpin_page(page_id, false).unwrap();

        // Admitting the same page again returns the existing frame
        let (frame, evicted) = pool.new_page(page_id).unwrap();

        assert!(evicted.is_none());
        assert_eq!(frame.holds(), Some(page_id));
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn test_buffer_pool_load_resident_page_keeps_pool_copy() {
        let pool = create_test_pool(10);
        let page_id = PageId::new(0, 1);

        let (frame, _) = pool.new_page(page_id).unwrap();
        let mut image = [0u8; PAGE_SIZE];
        image[0] = 0x42;
        frame.overwrite(&image);
        pool.unpin_page(page_id, true).unwrap();

        // A stale disk image must not clobber the newer resident copy
        let stale = [0u8; PAGE_SIZE];
        let (frame, _) = pool.load_page(page_id, &stale).unwrap();
        assert_eq!(frame.snapshot()[0], 0x42);
        pool.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_buffer_pool_stats() {
        let pool = create_test_pool(10);

        for i in 0..5 {
            let page_id = PageId::new(0, i);
            pool.new_page(page_id).unwrap();
            if i % 2 == 0 {
                pool.unpin_page(page_id, true).unwrap(); // Dirty
            }
            // Odd pages remain pinned
        }

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 5);
        assert_eq!(stats.used_frames, 5);
        assert_eq!(stats.pinned_frames, 2); // Pages 1, 3
        assert_eq!(stats.dirty_frames, 3); // Pages 0, 2, 4
    }
}
