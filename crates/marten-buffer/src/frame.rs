//! Buffer frames: the slots of the page cache.

use marten_common::page::{PageId, PAGE_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Index of a slot in the buffer pool's frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

/// Contents of a frame: which page it holds, whether the image has
/// diverged from disk, and the image itself. These change together, so
/// they live behind one lock.
struct FrameSlot {
    /// Page currently installed, if any.
    page_id: Option<PageId>,
    /// Image differs from the on-disk page.
    dirty: bool,
    /// Page image.
    image: Box<[u8; PAGE_SIZE]>,
}

/// A single slot of the buffer pool.
///
/// The pin count is atomic so the pool can test evictability without
/// taking the slot lock. Storage components never hold references into
/// the image: while a page is pinned they copy its image out with
/// [`BufferFrame::snapshot`] and replace it with [`BufferFrame::overwrite`],
/// so the frame can hand back a consistent write-back image at eviction.
pub struct BufferFrame {
    /// Slot index.
    id: FrameId,
    /// Number of users currently relying on the page staying resident.
    pin_count: AtomicU32,
    /// Slot contents.
    slot: Mutex<FrameSlot>,
}

impl BufferFrame {
    /// Creates an empty frame.
    pub fn new(id: FrameId) -> Self {
        Self {
            id,
            pin_count: AtomicU32::new(0),
            slot: Mutex::new(FrameSlot {
                page_id: None,
                dirty: false,
                image: Box::new([0u8; PAGE_SIZE]),
            }),
        }
    }

    /// Returns the slot index.
    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Returns the page this frame currently holds.
    pub fn holds(&self) -> Option<PageId> {
        self.slot.lock().page_id
    }

    /// Adds a pin and returns the new pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Removes a pin and returns the new pin count.
    ///
    /// Unpinning an unpinned frame is a protocol violation by the caller;
    /// the count saturates at zero rather than wrapping.
    #[inline]
    pub fn unpin(&self) -> u32 {
        match self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Returns true if any pins are outstanding.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if the image has diverged from disk.
    pub fn is_dirty(&self) -> bool {
        self.slot.lock().dirty
    }

    /// Records that the image diverged from disk.
    pub fn mark_dirty(&self) {
        self.slot.lock().dirty = true;
    }

    /// Records that the image was written back.
    pub fn clear_dirty(&self) {
        self.slot.lock().dirty = false;
    }

    /// Installs a page into this frame, clean.
    ///
    /// With an image (a page read from disk) the bytes are copied in;
    /// without one (a freshly allocated page) the image is zeroed.
    pub fn install(&self, page_id: PageId, image: Option<&[u8]>) {
        let mut slot = self.slot.lock();
        slot.page_id = Some(page_id);
        slot.dirty = false;
        match image {
            Some(src) => {
                let len = src.len().min(PAGE_SIZE);
                slot.image[..len].copy_from_slice(&src[..len]);
                slot.image[len..].fill(0);
            }
            None => slot.image.fill(0),
        }
    }

    /// Copies the page image out.
    pub fn snapshot(&self) -> [u8; PAGE_SIZE] {
        *self.slot.lock().image
    }

    /// Replaces the page image, marking the frame dirty.
    pub fn overwrite(&self, image: &[u8; PAGE_SIZE]) {
        let mut slot = self.slot.lock();
        slot.image.copy_from_slice(image);
        slot.dirty = true;
    }

    /// Returns a copy of the image when it needs writing back.
    ///
    /// The dirty flag is left set; the caller clears it with
    /// [`BufferFrame::clear_dirty`] once the write-back succeeded.
    pub fn dirty_image(&self) -> Option<Box<[u8; PAGE_SIZE]>> {
        let slot = self.slot.lock();
        if slot.dirty {
            Some(slot.image.clone())
        } else {
            None
        }
    }

    /// Vacates the frame for reuse.
    ///
    /// Returns the page that was resident and, when its image was dirty,
    /// the bytes the caller must write to disk before they are lost.
    pub fn evict(&self) -> (Option<PageId>, Option<Box<[u8; PAGE_SIZE]>>) {
        let mut slot = self.slot.lock();
        let page_id = slot.page_id.take();
        let image = if slot.dirty {
            Some(slot.image.clone())
        } else {
            None
        };
        slot.dirty = false;
        (page_id, image)
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("BufferFrame")
            .field("id", &self.id)
            .field("page", &slot.page_id)
            .field("dirty", &slot.dirty)
            .field("pins", &self.pin_count())
            .finish()
    }
}
