//! Victim selection for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Chooses which unpinned frame to repurpose when the pool is full.
///
/// The pool reports pin-lifecycle transitions: a frame whose pin count
/// falls to zero is enqueued as a candidate, a frame that is pinned again
/// or freed is withdrawn, and `touch` records a hit on a resident page.
/// Only enqueued frames are ever returned as victims.
pub trait ReplacementPolicy: Send + Sync {
    /// Records a hit on a resident page.
    fn touch(&self, frame_id: FrameId);

    /// Adds an unpinned frame to the candidate set.
    fn enqueue(&self, frame_id: FrameId);

    /// Removes a frame from the candidate set.
    fn withdraw(&self, frame_id: FrameId);

    /// Picks a frame to repurpose, removing it from the candidate set.
    fn pick_victim(&self) -> Option<FrameId>;

    /// Returns the number of candidate frames.
    fn candidates(&self) -> usize;
}

/// Second-chance replacement.
///
/// Candidates wait in arrival order. A candidate that was touched since
/// it was last considered is moved to the back of the queue once instead
/// of being evicted; a touch received while the frame was pinned counts
/// too, so a page that saw hits during its pinned lifetime outlives
/// colder pages after unpin.
pub struct SecondChanceReplacer {
    inner: Mutex<SecondChanceInner>,
}

struct SecondChanceInner {
    /// Candidate frames, oldest first.
    queue: VecDeque<FrameId>,
    /// Per-frame marks, indexed by frame id.
    marks: Vec<FrameMark>,
}

#[derive(Clone, Copy, Default)]
struct FrameMark {
    /// Frame is present in `queue`.
    queued: bool,
    /// Frame was touched since it was last considered for eviction.
    referenced: bool,
}

impl SecondChanceReplacer {
    /// Creates a policy instance covering `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(SecondChanceInner {
                queue: VecDeque::with_capacity(num_frames),
                marks: vec![FrameMark::default(); num_frames],
            }),
        }
    }
}

impl ReplacementPolicy for SecondChanceReplacer {
    fn touch(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(mark) = inner.marks.get_mut(frame_id.0 as usize) {
            mark.referenced = true;
        }
    }

    fn enqueue(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0 as usize;
        if idx >= inner.marks.len() || inner.marks[idx].queued {
            return;
        }
        inner.marks[idx].queued = true;
        inner.queue.push_back(frame_id);
    }

    fn withdraw(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0 as usize;
        if idx >= inner.marks.len() || !inner.marks[idx].queued {
            return;
        }
        inner.marks[idx].queued = false;
        inner.queue.retain(|&f| f != frame_id);
    }

    fn pick_victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        // Every candidate is requeued at most once per pick, so two
        // passes over the queue always produce a victim.
        for _ in 0..(2 * inner.queue.len()) {
            let frame_id = inner.queue.pop_front()?;
            let idx = frame_id.0 as usize;
            if inner.marks[idx].referenced {
                inner.marks[idx].referenced = false;
                inner.queue.push_back(frame_id);
            } else {
                inner.marks[idx].queued = false;
                return Some(frame_id);
            }
        }

        let frame_id = inner.queue.pop_front()?;
        inner.marks[frame_id.0 as usize].queued = false;
        Some(frame_id)
    }

    fn candidates(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
