//! Replacement-policy plug point for the buffer pool.

/// Index of an in-memory frame, in `[0, pool_size)`.
pub type FrameId = usize;

/// A replacement policy tracks frame accesses and picks eviction victims.
/// The buffer pool drives it from under its own mutex, so implementations
/// need no internal locking.
pub trait Replacer: Send {
    /// Notes an access to `frame_id` at the current instant. Frames start
    /// out untracked and become known on their first access.
    fn record_access(&mut self, frame_id: FrameId);

    /// Marks whether `frame_id` may be chosen as a victim. Unknown frames
    /// are ignored.
    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool);

    /// Picks a victim among the evictable frames and forgets it, or `None`
    /// when nothing is evictable.
    fn evict(&mut self) -> Option<FrameId>;

    /// Forgets `frame_id` entirely. Unknown frames are ignored; removing a
    /// frame that is tracked but not evictable is a programmer error and
    /// panics.
    fn remove(&mut self, frame_id: FrameId);

    /// Number of currently evictable frames.
    fn size(&self) -> usize;
}
