pub mod lru_k;
pub mod replacer;

use crate::storage::disk::{PageManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::log::{LogManager, NoopLogManager};
use crate::storage::page::{PageId, INVALID_PAGE_ID};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

type FrameData = Arc<RwLock<Box<[u8; PAGE_SIZE]>>>;
type FrameReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8; PAGE_SIZE]>>;
type FrameWriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8; PAGE_SIZE]>>;

/// Bookkeeping for one frame; the bytes themselves live behind the frame's
/// rw-latch so guards can hold page latches without the pool mutex.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.pin_count = 0;
        self.is_dirty = false;
    }
}

/// Everything the pool mutates: the page directory, free list, frame
/// metadata, the replacement policy, and the disk manager. One mutex guards
/// it all; disk I/O may happen while it is held.
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    metas: Vec<FrameMeta>,
    replacer: Box<dyn Replacer>,
    page_manager: PageManager,
}

struct BufferPoolInner {
    frames: Vec<FrameData>,
    state: Mutex<PoolState>,
    log_manager: Arc<dyn LogManager>,
    pool_size: usize,
}

/// Caches fixed-size pages in a bounded set of frames, spilling victims
/// chosen by the pluggable [`Replacer`]. Cheap to clone; clones share the
/// pool.
///
/// Pages are handed out as guards that own the pin and the page latch.
/// Guards are not reentrant: fetching a page twice from one thread while the
/// first guard is alive can deadlock, like any rw-latch.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

impl BufferPoolManager {
    pub fn new(page_manager: PageManager, replacer: Box<dyn Replacer>, pool_size: usize) -> Self {
        Self::with_log_manager(page_manager, replacer, pool_size, Arc::new(NoopLogManager::new()))
    }

    pub fn with_log_manager(
        page_manager: PageManager,
        replacer: Box<dyn Replacer>,
        pool_size: usize,
        log_manager: Arc<dyn LogManager>,
    ) -> Self {
        assert!(pool_size > 0);
        let frames = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))))
            .collect();
        let metas = (0..pool_size)
            .map(|_| FrameMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            })
            .collect();
        Self {
            inner: Arc::new(BufferPoolInner {
                frames,
                state: Mutex::new(PoolState {
                    page_table: HashMap::with_capacity(pool_size),
                    free_list: (0..pool_size).collect(),
                    metas,
                    replacer,
                    page_manager,
                }),
                log_manager,
                pool_size,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Number of pages currently resident (directory size).
    pub fn resident_page_count(&self) -> usize {
        self.inner.state.lock().page_table.len()
    }

    pub fn free_frame_count(&self) -> usize {
        self.inner.state.lock().free_list.len()
    }

    /// Number of frames the replacer could evict right now.
    pub fn evictable_frame_count(&self) -> usize {
        self.inner.state.lock().replacer.size()
    }

    /// Pin count of a resident page; `None` when not resident.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.inner.state.lock();
        let fid = *state.page_table.get(&page_id)?;
        Some(state.metas[fid].pin_count)
    }

    /// Allocates a fresh page id, homes it in a frame, and returns the page
    /// pinned behind an exclusive guard, zero-filled.
    pub fn new_page(&self) -> StorageResult<(PageId, PageWriteGuard)> {
        let (page_id, frame_id) = {
            let mut state = self.inner.state.lock();
            let frame_id = self.obtain_frame(&mut state)?;
            let page_id = match state.page_manager.allocate_page() {
                Ok(page_id) => page_id,
                Err(e) => {
                    state.free_list.push_back(frame_id);
                    return Err(e);
                }
            };
            self.inner.frames[frame_id].write().fill(0);
            let meta = &mut state.metas[frame_id];
            meta.page_id = page_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
            state.page_table.insert(page_id, frame_id);
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            (page_id, frame_id)
        };

        let data = self.inner.frames[frame_id].write_arc();
        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame_id,
                page_id,
                dirty: false,
                data,
            },
        ))
    }

    /// Fetches a page behind a shared latch, reading it from disk on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        let frame_id = self.pin_page(page_id)?;
        let data = self.inner.frames[frame_id].read_arc();
        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id,
            page_id,
            data,
        })
    }

    /// Fetches a page behind an exclusive latch, reading it from disk on a
    /// miss. The frame is marked dirty only once the guard is written
    /// through.
    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let frame_id = self.pin_page(page_id)?;
        let data = self.inner.frames[frame_id].write_arc();
        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            page_id,
            dirty: false,
            data,
        })
    }

    /// Writes a resident page to disk regardless of its dirty flag and
    /// clears the flag. `Ok(false)` when the page is not resident. Pin
    /// counts are unchanged.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        // Pin so the frame cannot be repurposed while we hold its latch.
        let frame_id = {
            let mut state = self.inner.state.lock();
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(false);
            };
            state.metas[frame_id].pin_count += 1;
            state.replacer.set_evictable(frame_id, false);
            frame_id
        };

        let result = {
            let frame = self.inner.frames[frame_id].read();
            self.inner.log_manager.flush();
            let mut state = self.inner.state.lock();
            match state.page_manager.write_page(page_id, frame.as_slice()) {
                Ok(()) => {
                    state.metas[frame_id].is_dirty = false;
                    Ok(true)
                }
                Err(e) => Err(e),
            }
        };

        unpin_frame(&self.inner, frame_id, false);
        result
    }

    /// Flushes every resident page.
    pub fn flush_all(&self) -> StorageResult<()> {
        let page_ids: Vec<PageId> = {
            let state = self.inner.state.lock();
            state.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drops a page from the pool. `Ok(true)` when the page is gone (or was
    /// never resident), `Ok(false)` when it is pinned. Dirty contents are
    /// written back first; the id is returned to the (monotonic) allocator.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.metas[frame_id].pin_count > 0 {
            return Ok(false);
        }

        if state.metas[frame_id].is_dirty {
            self.inner.log_manager.flush();
            let frame = self.inner.frames[frame_id].read();
            state.page_manager.write_page(page_id, frame.as_slice())?;
        }

        state.page_table.remove(&page_id);
        state.replacer.remove(frame_id);
        self.inner.frames[frame_id].write().fill(0);
        state.metas[frame_id].reset();
        state.free_list.push_back(frame_id);
        state.page_manager.deallocate_page(page_id);
        Ok(true)
    }

    /// Pins `page_id` into a frame under the pool mutex, loading from disk
    /// on a miss, and reports the frame.
    fn pin_page(&self, page_id: PageId) -> StorageResult<FrameId> {
        let mut state = self.inner.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.metas[frame_id].pin_count += 1;
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.obtain_frame(&mut state)?;
        {
            let mut frame = self.inner.frames[frame_id].write();
            if let Err(e) = state.page_manager.read_page(page_id, frame.as_mut_slice()) {
                drop(frame);
                state.free_list.push_back(frame_id);
                return Err(e);
            }
        }
        let meta = &mut state.metas[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        Ok(frame_id)
    }

    /// Finds a home frame: the free list first, then a replacer victim,
    /// writing the victim back if dirty. The returned frame is reset,
    /// unpinned, and unknown to the replacer.
    fn obtain_frame(&self, state: &mut PoolState) -> StorageResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = state.replacer.evict() else {
            return Err(StorageError::PoolExhausted);
        };
        let (old_page, was_dirty) = {
            let meta = &state.metas[frame_id];
            debug_assert_eq!(meta.pin_count, 0, "evicted a pinned frame");
            (meta.page_id, meta.is_dirty)
        };
        log::debug!("evicting page {old_page} from frame {frame_id} (dirty: {was_dirty})");

        if was_dirty {
            self.inner.log_manager.flush();
            let frame = self.inner.frames[frame_id].read();
            if let Err(e) = state.page_manager.write_page(old_page, frame.as_slice()) {
                drop(frame);
                // Leave the page resident so its contents are not lost.
                state.replacer.record_access(frame_id);
                state.replacer.set_evictable(frame_id, true);
                return Err(e);
            }
        }
        state.page_table.remove(&old_page);
        state.metas[frame_id].reset();
        Ok(frame_id)
    }
}

fn unpin_frame(inner: &BufferPoolInner, frame_id: FrameId, mark_dirty: bool) {
    let mut state = inner.state.lock();
    let meta = &mut state.metas[frame_id];
    if mark_dirty {
        meta.is_dirty = true;
    }
    debug_assert!(meta.pin_count > 0, "unbalanced unpin");
    meta.pin_count -= 1;
    if meta.pin_count == 0 {
        state.replacer.set_evictable(frame_id, true);
    }
}

/// Shared-latched, pinned view of a page. Dropping it unpins the frame.
pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    page_id: PageId,
    data: FrameReadGuard,
}

impl PageReadGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        unpin_frame(&self.inner, self.frame_id, false);
    }
}

/// Exclusively latched, pinned view of a page. Writing through the guard
/// marks the frame dirty; dropping it unpins.
pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    page_id: PageId,
    dirty: bool,
    data: FrameWriteGuard,
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dirty = true;
        &mut self.data
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        unpin_frame(&self.inner, self.frame_id, self.dirty);
    }
}
