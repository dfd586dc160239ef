//! B+ tree index over an integer attribute of a heap relation.

use crate::btree::meta::IndexMeta;
use crate::btree::node::{InternalNode, LeafNode, EMPTY_KEY, LEAF_CAPACITY};
use crate::btree::scan::{Operator, ScanState};
use crate::disk::DiskManager;
use crate::heap::FileScan;
use crate::record::RecordId;
use marten_buffer::BufferPool;
use marten_common::page::{PageId, PAGE_SIZE};
use marten_common::{KeyType, MartenError, Result};
use std::sync::Arc;

/// Page number of the header page within the index file.
const HEADER_PAGE_NUM: u32 = 0;

/// Disk-resident B+ tree secondary index.
///
/// Maps `i32` keys read at a fixed byte offset of each relation record to
/// record ids. Supports point insertion (duplicates allowed) and half-open
/// range scans in ascending key order. The index exclusively owns its file,
/// named `"<relation>.<offset>"`; nodes reference each other only through
/// page numbers within that file.
pub struct BTreeIndex {
    /// Disk manager for page I/O.
    disk: Arc<DiskManager>,
    /// Buffer pool for page caching.
    pool: Arc<BufferPool>,
    /// File handle for the index file.
    file_id: u32,
    /// Resolved index file name.
    index_name: String,
    /// Name of the indexed relation.
    relation_name: String,
    /// Byte offset of the indexed attribute within a record.
    attr_byte_offset: usize,
    /// Type of the indexed attribute.
    key_type: KeyType,
    /// Root page number; 0 until the first key is inserted.
    root_page_num: u32,
    /// Active scan, if any. Its cursor leaf stays pinned.
    scan: Option<ScanState>,
}

impl BTreeIndex {
    /// Opens the index for a relation and attribute, building it when it
    /// does not exist yet.
    ///
    /// A fresh build drives the heap scanner over the relation and inserts
    /// every record's key. The resolved index file name is available
    /// through [`BTreeIndex::index_name`].
    pub fn new(
        relation_name: &str,
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        attr_byte_offset: usize,
        key_type: KeyType,
    ) -> Result<Self> {
        let index_name = format!("{}.{}", relation_name, attr_byte_offset);

        if disk.exists(&index_name) {
            let file_id = disk.open(&index_name)?;
            let mut index = Self {
                disk,
                pool,
                file_id,
                index_name,
                relation_name: relation_name.to_string(),
                attr_byte_offset,
                key_type,
                root_page_num: 0,
                scan: None,
            };

            let meta = IndexMeta::decode_page(&index.fetch_page(HEADER_PAGE_NUM)?)?;
            if meta.relation_name != relation_name
                || meta.attr_byte_offset != attr_byte_offset
                || meta.key_type != key_type
            {
                return Err(MartenError::InvalidIndexMeta(format!(
                    "header {:?} does not match requested index on {}.{}",
                    meta.record(),
                    relation_name,
                    attr_byte_offset
                )));
            }
            index.root_page_num = meta.root_page_num;
            return Ok(index);
        }

        let file_id = disk.create(&index_name)?;
        let header_page = disk.allocate_page(file_id)?;
        debug_assert_eq!(header_page.page_num, HEADER_PAGE_NUM);

        let mut index = Self {
            disk,
            pool,
            file_id,
            index_name,
            relation_name: relation_name.to_string(),
            attr_byte_offset,
            key_type,
            root_page_num: 0,
            scan: None,
        };
        index.write_meta()?;

        // Bulk-load from the relation's heap file
        let mut scanner = FileScan::new(
            relation_name,
            index.disk.clone(),
            index.pool.clone(),
        )?;
        while let Some((rid, record)) = scanner.scan_next()? {
            let off = index.attr_byte_offset;
            if off + 4 > record.len() {
                return Err(MartenError::Internal(format!(
                    "attribute offset {} out of bounds for record of {} bytes",
                    off,
                    record.len()
                )));
            }
            let key = i32::from_le_bytes([
                record[off],
                record[off + 1],
                record[off + 2],
                record[off + 3],
            ]);
            index.insert_entry(key, rid)?;
        }

        Ok(index)
    }

    /// Returns the resolved index file name (`"<relation>.<offset>"`).
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Returns the name of the indexed relation.
    pub fn relation_name(&self) -> &str {
        &self.relation_name
    }

    /// Returns the tree height: 0 for an empty tree, otherwise the number
    /// of node levels on a root-to-leaf path (a freshly bootstrapped tree
    /// has height 2: one internal level, one leaf level).
    pub fn height(&self) -> Result<u32> {
        if self.root_page_num == 0 {
            return Ok(0);
        }
        let root = InternalNode::from_bytes(self.fetch_page(self.root_page_num)?);
        Ok(root.level() + 1)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts a (key, rid) pair. Duplicate keys are permitted and coexist.
    pub fn insert_entry(&mut self, key: i32, rid: RecordId) -> Result<()> {
        if key == EMPTY_KEY {
            return Err(MartenError::KeyOutOfRange { key });
        }

        if self.root_page_num == 0 {
            return self.bootstrap_tree(key, rid);
        }

        if let Some((sep, new_child)) = self.insert_into_subtree(self.root_page_num, key, rid)? {
            self.grow_root(sep, new_child)?;
        }
        Ok(())
    }

    /// First insertion: build the two-leaf bottom level and a level-1 root.
    ///
    /// The left leaf stays as a permanent left-spine leaf; it is empty at
    /// first and receives keys below the bootstrap key later. With this
    /// shape the root is always an internal node.
    fn bootstrap_tree(&mut self, key: i32, rid: RecordId) -> Result<()> {
        let left_num = self.allocate_page()?;
        let right_num = self.allocate_page()?;
        let root_num = self.allocate_page()?;

        let mut left = LeafNode::new();
        let mut right = LeafNode::new();
        right.insert(key, rid);
        left.set_right_sibling(right_num);

        let mut root = InternalNode::new(1);
        root.set_child(0, left_num);
        root.insert_separator(key, right_num);

        self.write_page(left_num, left.as_bytes())?;
        self.write_page(right_num, right.as_bytes())?;
        self.write_page(root_num, root.as_bytes())?;

        self.publish_root(root_num)
    }

    /// Inserts below an internal node, splitting it if a child split
    /// propagates into a full node. Returns the (separator, new page)
    /// pair this node could not absorb, to be incorporated by its parent.
    fn insert_into_subtree(
        &self,
        page_num: u32,
        key: i32,
        rid: RecordId,
    ) -> Result<Option<(i32, u32)>> {
        let mut node = InternalNode::from_bytes(self.fetch_page(page_num)?);
        let child = node.child_at(node.child_index_for(key));

        let propagated = if node.level() == 1 {
            self.insert_into_leaf(child, key, rid)?
        } else {
            self.insert_into_subtree(child, key, rid)?
        };

        let Some((sep, new_child)) = propagated else {
            return Ok(None);
        };

        if !node.is_full() {
            node.insert_separator(sep, new_child);
            self.write_page(page_num, node.as_bytes())?;
            return Ok(None);
        }

        let new_page_num = self.allocate_page()?;
        let (median, mut sibling) = node.split_into();
        if sep < median {
            node.insert_separator(sep, new_child);
        } else {
            sibling.insert_separator(sep, new_child);
        }
        self.write_page(page_num, node.as_bytes())?;
        self.write_page(new_page_num, sibling.as_bytes())?;

        Ok(Some((median, new_page_num)))
    }

    /// Inserts into a leaf, splitting it when full. Returns the separator
    /// and new sibling page to propagate, if any.
    fn insert_into_leaf(
        &self,
        page_num: u32,
        key: i32,
        rid: RecordId,
    ) -> Result<Option<(i32, u32)>> {
        let mut leaf = LeafNode::from_bytes(self.fetch_page(page_num)?);

        if !leaf.is_full() {
            leaf.insert(key, rid);
            self.write_page(page_num, leaf.as_bytes())?;
            return Ok(None);
        }

        let new_page_num = self.allocate_page()?;
        let mut sibling = leaf.split_into(new_page_num);
        let sep = sibling.key_at(0);

        if key < sep {
            leaf.insert(key, rid);
        } else {
            sibling.insert(key, rid);
        }

        self.write_page(page_num, leaf.as_bytes())?;
        self.write_page(new_page_num, sibling.as_bytes())?;

        Ok(Some((sep, new_page_num)))
    }

    /// Grows the tree by one level after a split propagated out of the
    /// root.
    fn grow_root(&mut self, sep: i32, new_child: u32) -> Result<()> {
        let old_root_num = self.root_page_num;
        let old_level = InternalNode::from_bytes(self.fetch_page(old_root_num)?).level();

        let new_root_num = self.allocate_page()?;
        let mut root = InternalNode::new(old_level + 1);
        root.set_child(0, old_root_num);
        root.insert_separator(sep, new_child);
        self.write_page(new_root_num, root.as_bytes())?;

        self.publish_root(new_root_num)
    }

    /// Publishes a new root page and refreshes the header record.
    fn publish_root(&mut self, root_page_num: u32) -> Result<()> {
        self.root_page_num = root_page_num;
        self.write_meta()
    }

    // =========================================================================
    // Descent
    // =========================================================================

    /// Walks from the root to the leaf that would contain `key`.
    fn find_leaf(&self, key: i32) -> Result<u32> {
        let mut page_num = self.root_page_num;
        loop {
            let node = InternalNode::from_bytes(self.fetch_page(page_num)?);
            let child = node.child_at(node.child_index_for(key));
            if node.level() == 1 {
                return Ok(child);
            }
            page_num = child;
        }
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Opens a range scan. An already-active scan is silently ended first.
    ///
    /// The low operator must be `GreaterThan`/`GreaterThanOrEqual` and the
    /// high operator `LessThan`/`LessThanOrEqual` (`BadOpcodes` otherwise);
    /// `low_val` must not exceed `high_val` (`BadScanRange`). Fails with
    /// `NoSuchKeyFound` when no key satisfies the predicate; no page stays
    /// pinned in that case.
    pub fn start_scan(
        &mut self,
        low_val: i32,
        low_op: Operator,
        high_val: i32,
        high_op: Operator,
    ) -> Result<()> {
        if self.scan.is_some() {
            // endScan cannot fail with a scan active
            let _ = self.end_scan();
        }

        if !low_op.is_lower_bound() || !high_op.is_upper_bound() {
            return Err(MartenError::BadOpcodes);
        }
        if low_val > high_val {
            return Err(MartenError::BadScanRange);
        }

        if self.root_page_num == 0 {
            return Err(MartenError::NoSuchKeyFound);
        }

        let state = ScanState {
            low_val,
            low_op,
            high_val,
            high_op,
            page_num: None,
            slot: 0,
        };

        // Descend to the leaf that would hold the low bound, then walk the
        // sibling chain to the first qualifying key. The candidate leaf is
        // kept pinned while it is inspected.
        let mut page_num = self.find_leaf(low_val)?;
        let mut leaf = LeafNode::from_bytes(self.pin_page(page_num)?);
        let mut slot = 0usize;

        loop {
            if slot >= LEAF_CAPACITY || leaf.key_at(slot) == EMPTY_KEY {
                // Leaf exhausted before a qualifying key: hop to the sibling
                let sibling = leaf.right_sibling();
                self.unpin_page(page_num, false)?;
                if sibling == 0 {
                    return Err(MartenError::NoSuchKeyFound);
                }
                leaf = LeafNode::from_bytes(self.pin_page(sibling)?);
                page_num = sibling;
                slot = 0;
                continue;
            }

            let key = leaf.key_at(slot);
            if !state.satisfies_low(key) {
                slot += 1;
                continue;
            }
            if !state.satisfies_high(key) {
                // Keys only grow from here; the range is empty
                self.unpin_page(page_num, false)?;
                return Err(MartenError::NoSuchKeyFound);
            }

            self.scan = Some(ScanState {
                page_num: Some(page_num),
                slot,
                ..state
            });
            return Ok(());
        }
    }

    /// Yields the record id under the cursor and advances it.
    ///
    /// Fails with `ScanNotInitialized` when no scan is active and with
    /// `IndexScanCompleted` once the predicate is exhausted (repeatedly,
    /// until [`BTreeIndex::end_scan`]).
    pub fn scan_next(&mut self) -> Result<RecordId> {
        let state = self
            .scan
            .as_mut()
            .ok_or(MartenError::ScanNotInitialized)?;

        let Some(page_num) = state.page_num else {
            return Err(MartenError::IndexScanCompleted);
        };

        // Re-read the pinned cursor leaf so growth of the tree since the
        // last call is observed
        let page_id = PageId::new(self.file_id, page_num);
        let leaf = match self.pool.fetch_page(page_id) {
            Some(frame) => {
                let data = frame.snapshot();
                self.pool.unpin_page(page_id, false)?;
                LeafNode::from_bytes(data)
            }
            None => return Err(MartenError::BadBuffer),
        };

        let key = if state.slot < LEAF_CAPACITY {
            leaf.key_at(state.slot)
        } else {
            EMPTY_KEY
        };
        if key == EMPTY_KEY || !state.satisfies(key) {
            return Err(MartenError::IndexScanCompleted);
        }

        let rid = leaf.rid_at(state.slot);

        // Advance: step within the leaf, or cross the sibling link
        state.slot += 1;
        if state.slot >= LEAF_CAPACITY || leaf.key_at(state.slot) == EMPTY_KEY {
            let sibling = leaf.right_sibling();
            self.pool.unpin_page(page_id, false)?;
            if sibling == 0 {
                // Terminal: the next call reports completion
                self.scan.as_mut().expect("scan is active").page_num = None;
            } else {
                self.pin_page(sibling)?;
                let state = self.scan.as_mut().expect("scan is active");
                state.page_num = Some(sibling);
                state.slot = 0;
            }
        }

        Ok(rid)
    }

    /// Ends the active scan, unpinning its cursor leaf.
    pub fn end_scan(&mut self) -> Result<()> {
        let state = self.scan.take().ok_or(MartenError::ScanNotInitialized)?;
        if let Some(page_num) = state.page_num {
            self.unpin_page(page_num, false)?;
        }
        Ok(())
    }

    /// Returns true if a scan is currently active.
    pub fn scan_executing(&self) -> bool {
        self.scan.is_some()
    }

    // =========================================================================
    // Page access helpers
    // =========================================================================

    fn page_id(&self, page_num: u32) -> PageId {
        PageId::new(self.file_id, page_num)
    }

    /// Allocates a fresh page in the index file.
    fn allocate_page(&self) -> Result<u32> {
        Ok(self.disk.allocate_page(self.file_id)?.page_num)
    }

    /// Fetches a page image through the pool, loading from disk on a miss.
    /// The pin is held while the image is copied out, then released.
    fn fetch_page(&self, page_num: u32) -> Result<[u8; PAGE_SIZE]> {
        let data = self.pin_page(page_num)?;
        self.unpin_page(page_num, false)?;
        Ok(data)
    }

    /// Fetches a page image, leaving the page pinned for the caller.
    fn pin_page(&self, page_num: u32) -> Result<[u8; PAGE_SIZE]> {
        let page_id = self.page_id(page_num);

        if let Some(frame) = self.pool.fetch_page(page_id) {
            return Ok(frame.snapshot());
        }

        let disk_data = self.disk.read_page(page_id)?;
        let (frame, evicted) = self.pool.load_page(page_id, &disk_data)?;

        if let Some(evicted_page) = evicted {
            if let Err(e) = self.disk.write_page(evicted_page.page_id, &evicted_page.data) {
                let _ = self.pool.unpin_page(page_id, false);
                return Err(e);
            }
        }

        Ok(frame.snapshot())
    }

    /// Releases one pin on a page.
    fn unpin_page(&self, page_num: u32, dirty: bool) -> Result<()> {
        self.pool.unpin_page(self.page_id(page_num), dirty)
    }

    /// Writes a page image through the pool, marking it dirty.
    fn write_page(&self, page_num: u32, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let page_id = self.page_id(page_num);

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

    /// Rewrites the header record, tolerating buffer-protocol failures.
    ///
    /// The header is advisory (it enables reopening the index by name);
    /// a pinned or non-resident header page must not fail the structural
    /// operation that triggered the rewrite. Other failures propagate.
    fn write_meta(&self) -> Result<()> {
        let meta = IndexMeta {
            relation_name: self.relation_name.clone(),
            attr_byte_offset: self.attr_byte_offset,
            key_type: self.key_type,
            root_page_num: self.root_page_num,
        };
        match self.write_page(HEADER_PAGE_NUM, &meta.encode_page()?) {
            Ok(()) | Err(MartenError::PagePinned { .. }) | Err(MartenError::BadBuffer) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Flushes every dirty page of the index file to disk.
    fn flush(&self) -> Result<()> {
        self.pool.flush_file(self.file_id, |page_id, data| {
            let mut buf = [0u8; PAGE_SIZE];
            buf.copy_from_slice(data);
            self.disk.write_page(page_id, &buf)
        })?;
        self.disk.flush_file(self.file_id)
    }
}

impl Drop for BTreeIndex {
    fn drop(&mut self) {
        if self.scan.is_some() {
            let _ = self.end_scan();
        }
        let _ = self.flush();
    }
}
