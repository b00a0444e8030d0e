//! Forward iteration over the leaf chain.

use crate::access::Rid;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard};
use crate::storage::error::StorageResult;
use crate::storage::page::btree_leaf_page::BTreeLeafPage;

/// Walks the leaf chain left to right, holding the current leaf pinned and
/// share-latched. Stepping past a leaf's last entry latches the next leaf
/// before the current one is released, so entries are never skipped by a
/// concurrent split of an already-visited page.
///
/// The iterator holds a page latch between calls: do not run write
/// operations against the same tree from the same thread while one is live.
pub struct BTreeIter {
    buffer_pool: BufferPoolManager,
    current: Option<(PageReadGuard, usize)>,
}

impl BTreeIter {
    pub(crate) fn new(
        buffer_pool: BufferPoolManager,
        current: Option<(PageReadGuard, usize)>,
    ) -> Self {
        Self {
            buffer_pool,
            current,
        }
    }
}

impl Iterator for BTreeIter {
    type Item = StorageResult<(Vec<u8>, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (guard, index) = self.current.take()?;
            let leaf = BTreeLeafPage::from_data(&guard);

            if index < leaf.size() {
                let entry = (leaf.key_at(index).to_vec(), leaf.rid_at(index));
                self.current = Some((guard, index + 1));
                return Some(Ok(entry));
            }

            let next_id = leaf.next_page_id()?;
            match self.buffer_pool.fetch_page(next_id) {
                Ok(next_guard) => {
                    drop(guard);
                    self.current = Some((next_guard, 0));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
