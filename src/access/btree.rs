//! Latch-crabbed B+ tree index over byte-string keys and [`Rid`] values.
//!
//! Keys are unique and ordered by a comparator injected at construction.
//! The root page id persists in the header page (page 0) under the index
//! name, so a tree can be reopened against an existing database file.
//!
//! Traversal protocol: readers latch the child before releasing the parent
//! and hold at most two pages. Writers keep the descent path latched in a
//! vector — the operation's page set — and release all ancestors as soon as
//! the newly latched child is *safe* (cannot split for inserts, cannot
//! underflow for removals). Split and merge cascades therefore only ever
//! touch pages that are still in the path. Pages emptied by merges or a
//! root collapse are deleted only after every latch is released.

pub mod iterator;
pub mod key;

pub use self::iterator::BTreeIter;

use self::key::KeyComparator;
use crate::access::Rid;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::btree_internal_page::BTreeInternalPage;
use crate::storage::page::btree_leaf_page::BTreeLeafPage;
use crate::storage::page::btree_page::{self, BTreePageKind, BTREE_PAGE_HEADER_SIZE};
use crate::storage::page::{HeaderPage, PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::storage::PAGE_SIZE;
use parking_lot::Mutex;
use std::sync::Arc;

const LEAF_SLOT_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Remove,
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Leftmost,
    Key(&'a [u8]),
}

pub struct BTree {
    index_name: String,
    buffer_pool: BufferPoolManager,
    comparator: Arc<dyn KeyComparator>,
    leaf_max_size: usize,
    internal_max_size: usize,
    max_key_size: usize,
    /// Cached root page id, INVALID when the tree is empty. The mutex also
    /// serves as the tree-wide latch for creating the first root; descents
    /// re-check it after latching the root page and retry if it moved.
    root_page_id: Mutex<PageId>,
}

impl BTree {
    /// Opens (or registers) the index named `index_name` in the header page
    /// and returns a handle to it.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: BufferPoolManager,
        comparator: Arc<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> StorageResult<Self> {
        assert!(leaf_max_size >= 2, "leaf_max_size must be at least 2");
        assert!(internal_max_size >= 3, "internal_max_size must be at least 3");
        let index_name = index_name.into();

        let root = Self::load_or_register_root(&buffer_pool, &index_name)?;
        let worst_fanout = leaf_max_size.max(internal_max_size);
        let max_key_size = (PAGE_SIZE - BTREE_PAGE_HEADER_SIZE) / worst_fanout - LEAF_SLOT_SIZE;

        Ok(Self {
            index_name,
            buffer_pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            max_key_size,
            root_page_id: Mutex::new(root),
        })
    }

    fn load_or_register_root(
        buffer_pool: &BufferPoolManager,
        index_name: &str,
    ) -> StorageResult<PageId> {
        let registered = match buffer_pool.fetch_page(HEADER_PAGE_ID) {
            Ok(guard) => HeaderPage::from_data(&guard).get_root(index_name),
            Err(StorageError::PageNotOnDisk(_)) => {
                // Brand-new database file: the first allocation is page 0.
                let (page_id, guard) = buffer_pool.new_page()?;
                assert_eq!(page_id, HEADER_PAGE_ID, "header page must be page 0");
                drop(guard);
                None
            }
            Err(e) => return Err(e),
        };

        match registered {
            Some(root) => Ok(root.unwrap_or(INVALID_PAGE_ID)),
            None => {
                let mut guard = buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
                let mut header = HeaderPage::from_data(&guard);
                // A concurrent open may have registered the index between
                // the shared read above and this exclusive latch.
                if let Some(root) = header.get_root(index_name) {
                    return Ok(root.unwrap_or(INVALID_PAGE_ID));
                }
                header.insert_record(index_name, None)?;
                guard.copy_from_slice(header.data());
                Ok(INVALID_PAGE_ID)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.index_name
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id.lock().is_valid()
    }

    pub fn root_page_id(&self) -> Option<PageId> {
        let root = *self.root_page_id.lock();
        root.is_valid().then_some(root)
    }

    /// Rewrites the header-page record for this index. The caller holds the
    /// root mutex, so updates are serialized.
    fn persist_root(&self, new_root: PageId) -> StorageResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::from_data(&guard);
        header.update_record(&self.index_name, PageId::from_raw(new_root.0))?;
        guard.copy_from_slice(header.data());
        Ok(())
    }

    /// Point lookup.
    pub fn get_value(&self, key: &[u8]) -> StorageResult<Option<Rid>> {
        let Some(guard) = self.find_leaf_read(Target::Key(key))? else {
            return Ok(None);
        };
        let leaf = BTreeLeafPage::from_data(&guard);
        Ok(leaf.lookup(key, &*self.comparator))
    }

    /// Inserts `key -> rid`. `Ok(false)` when the key already exists.
    pub fn insert(&self, key: &[u8], rid: Rid) -> StorageResult<bool> {
        if key.len() > self.max_key_size {
            return Err(StorageError::KeyTooLarge(key.len()));
        }

        loop {
            // Empty tree: create a leaf root under the tree-wide latch.
            {
                let mut root = self.root_page_id.lock();
                if !root.is_valid() {
                    let (page_id, mut guard) = self.buffer_pool.new_page()?;
                    let mut leaf = BTreeLeafPage::new(page_id, self.leaf_max_size);
                    leaf.insert(key, rid, &*self.comparator)?;
                    guard.copy_from_slice(leaf.data());
                    drop(guard);
                    self.persist_root(page_id)?;
                    *root = page_id;
                    return Ok(true);
                }
            }

            let Some(mut path) = self.find_leaf_write(key, WriteOp::Insert)? else {
                // Lost a race with a concurrent emptying of the tree.
                continue;
            };

            let leaf_guard = path.last_mut().expect("write path holds the leaf");
            let mut leaf = BTreeLeafPage::from_data(leaf_guard);
            if !leaf.insert(key, rid, &*self.comparator)? {
                return Ok(false);
            }

            if leaf.size() == self.leaf_max_size {
                // Split: the new sibling takes the upper half and slots into
                // the leaf chain to the right.
                let right_entries = leaf.split_off_upper_half();
                let (right_id, mut right_guard) = self.buffer_pool.new_page()?;
                let mut right = BTreeLeafPage::new(right_id, self.leaf_max_size);
                right.extend(&right_entries)?;
                right.set_next_page_id(leaf.next_page_id());
                leaf.set_next_page_id(Some(right_id));

                let separator = right.first_key();
                right_guard.copy_from_slice(right.data());
                leaf_guard.copy_from_slice(leaf.data());
                drop(right_guard);

                let split_index = path.len() - 1;
                self.insert_in_parent(&mut path, split_index, separator, right_id)?;
            } else {
                leaf_guard.copy_from_slice(leaf.data());
            }
            return Ok(true);
        }
    }

    /// Installs a separator for a split of `path[node_index]`: either into
    /// the parent (splitting it recursively) or, when the split node is the
    /// root, into a freshly grown root.
    fn insert_in_parent(
        &self,
        path: &mut Vec<PageWriteGuard>,
        node_index: usize,
        key: Vec<u8>,
        right_id: PageId,
    ) -> StorageResult<()> {
        let left_id = btree_page::page_id(&path[node_index][..]);

        if node_index == 0 {
            // The split node is the root; grow the tree by one level. The
            // old root stays latched in the path until we return, so
            // concurrent descents block and then observe the new root id.
            let (new_root_id, mut guard) = self.buffer_pool.new_page()?;
            let mut new_root = BTreeInternalPage::new(new_root_id, self.internal_max_size);
            new_root.populate_new_root(left_id, &key, right_id)?;
            guard.copy_from_slice(new_root.data());
            drop(guard);

            let mut root = self.root_page_id.lock();
            self.persist_root(new_root_id)?;
            *root = new_root_id;
            return Ok(());
        }

        let parent_guard = &mut path[node_index - 1];
        let mut parent = BTreeInternalPage::from_data(parent_guard);
        if parent.size() < self.internal_max_size {
            parent.insert(&key, right_id, &*self.comparator)?;
            parent_guard.copy_from_slice(parent.data());
            return Ok(());
        }

        // Parent overflows: distribute its entries symmetrically, promote
        // the middle key, and recurse one level up.
        let (promoted, right_entries) = parent.split_insert(&key, right_id, &*self.comparator)?;
        let (new_internal_id, mut new_guard) = self.buffer_pool.new_page()?;
        let mut new_internal = BTreeInternalPage::new(new_internal_id, self.internal_max_size);
        new_internal.extend(&right_entries)?;
        new_guard.copy_from_slice(new_internal.data());
        drop(new_guard);
        parent_guard.copy_from_slice(parent.data());

        self.insert_in_parent(path, node_index - 1, promoted, new_internal_id)
    }

    /// Removes `key`; a no-op when it is absent.
    pub fn remove(&self, key: &[u8]) -> StorageResult<()> {
        let Some(mut path) = self.find_leaf_write(key, WriteOp::Remove)? else {
            return Ok(());
        };

        {
            let leaf_guard = path.last_mut().expect("write path holds the leaf");
            let mut leaf = BTreeLeafPage::from_data(leaf_guard);
            if !leaf.remove(key, &*self.comparator) {
                return Ok(());
            }
            leaf_guard.copy_from_slice(leaf.data());
        }

        let mut deleted = Vec::new();
        self.fix_underflow(&mut path, &mut deleted)?;
        drop(path);

        // Latches are gone; emptied pages can now leave the pool. A page an
        // iterator still pins simply stays resident until evicted.
        for page_id in deleted {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }

    /// Restores size invariants upward from the last node of `path`,
    /// borrowing from or merging with a sibling at each underfull level.
    fn fix_underflow(
        &self,
        path: &mut Vec<PageWriteGuard>,
        deleted: &mut Vec<PageId>,
    ) -> StorageResult<()> {
        loop {
            let depth = path.len();
            let (node_kind, node_size, node_max, node_id) = {
                let bytes = &path[depth - 1][..];
                (
                    btree_page::page_kind(bytes).expect("tree page in write path"),
                    btree_page::size(bytes),
                    btree_page::max_size(bytes),
                    btree_page::page_id(bytes),
                )
            };

            if depth == 1 {
                // The node is the root; it may shrink the tree.
                match node_kind {
                    BTreePageKind::Leaf if node_size == 0 => {
                        let mut root = self.root_page_id.lock();
                        self.persist_root(INVALID_PAGE_ID)?;
                        *root = INVALID_PAGE_ID;
                        deleted.push(node_id);
                    }
                    BTreePageKind::Internal if node_size == 1 => {
                        let only_child =
                            BTreeInternalPage::from_data(&path[0]).child_at(0);
                        let mut root = self.root_page_id.lock();
                        self.persist_root(only_child)?;
                        *root = only_child;
                        deleted.push(node_id);
                    }
                    _ => {}
                }
                return Ok(());
            }

            if node_size >= btree_page::min_size_for(node_max) {
                return Ok(());
            }

            // Consult the parent for an adjacent sibling (preferring the
            // left one) and the separator between the two.
            let (head, tail) = path.split_at_mut(depth - 1);
            let parent_guard = head.last_mut().expect("depth >= 2");
            let node_guard = &mut tail[0];
            let mut parent = BTreeInternalPage::from_data(parent_guard);
            let node_pos = parent
                .child_index(node_id)
                .expect("node is a child of its parent");
            let (sibling_pos, sep_index, node_is_left) = if node_pos > 0 {
                (node_pos - 1, node_pos, false)
            } else {
                (node_pos + 1, node_pos + 1, true)
            };
            let sibling_id = parent.child_at(sibling_pos);
            let mut sibling_guard = self.buffer_pool.fetch_page_write(sibling_id)?;
            let separator = parent.key_at(sep_index).to_vec();

            let merged = match node_kind {
                BTreePageKind::Leaf => {
                    let mut node = BTreeLeafPage::from_data(node_guard);
                    let mut sibling = BTreeLeafPage::from_data(&sibling_guard);
                    let combined = node.size() + sibling.size();
                    if combined < self.leaf_max_size - 1 {
                        // Merge right into left; the right page dies.
                        if node_is_left {
                            node.merge_from(&sibling)?;
                            node_guard.copy_from_slice(node.data());
                            deleted.push(sibling.page_id());
                        } else {
                            sibling.merge_from(&node)?;
                            sibling_guard.copy_from_slice(sibling.data());
                            deleted.push(node.page_id());
                        }
                        true
                    } else {
                        // Borrow one entry across the separator.
                        if node_is_left {
                            let (k, v) = sibling.remove_at(0);
                            node.insert_at(node.size(), &k, v)?;
                            let new_sep = sibling.first_key();
                            parent.replace_key_at(sep_index, &new_sep)?;
                        } else {
                            let (k, v) = sibling.remove_at(sibling.size() - 1);
                            node.insert_at(0, &k, v)?;
                            parent.replace_key_at(sep_index, &k)?;
                        }
                        node_guard.copy_from_slice(node.data());
                        sibling_guard.copy_from_slice(sibling.data());
                        false
                    }
                }
                BTreePageKind::Internal => {
                    let mut node = BTreeInternalPage::from_data(node_guard);
                    let mut sibling = BTreeInternalPage::from_data(&sibling_guard);
                    let combined = node.size() + sibling.size();
                    if combined <= self.internal_max_size {
                        // Merge: the separator descends with the right
                        // node's first child.
                        if node_is_left {
                            node.merge_from(&separator, &sibling)?;
                            node_guard.copy_from_slice(node.data());
                            deleted.push(sibling.page_id());
                        } else {
                            sibling.merge_from(&separator, &node)?;
                            sibling_guard.copy_from_slice(sibling.data());
                            deleted.push(node.page_id());
                        }
                        true
                    } else if node_is_left {
                        // Borrow from the right: its first child shifts
                        // over, keyed by the old separator.
                        let (next_sep, child) = sibling.delete_first();
                        node.insert_at(node.size(), &separator, child)?;
                        parent.replace_key_at(sep_index, &next_sep)?;
                        node_guard.copy_from_slice(node.data());
                        sibling_guard.copy_from_slice(sibling.data());
                        false
                    } else {
                        // Borrow from the left: its last child becomes the
                        // node's new leftmost pointer.
                        let (k, child) = sibling.remove_at(sibling.size() - 1);
                        node.insert_at(0, &[], child)?;
                        node.replace_key_at(1, &separator)?;
                        parent.replace_key_at(sep_index, &k)?;
                        node_guard.copy_from_slice(node.data());
                        sibling_guard.copy_from_slice(sibling.data());
                        false
                    }
                }
            };

            if !merged {
                parent_guard.copy_from_slice(parent.data());
                return Ok(());
            }

            // Drop the separator for the removed page and re-check the
            // parent, which just shrank.
            parent.remove_at(sep_index);
            parent_guard.copy_from_slice(parent.data());
            drop(sibling_guard);
            path.pop();
        }
    }

    /// Forward iterator over the whole tree in key order.
    pub fn iter(&self) -> StorageResult<BTreeIter> {
        let start = self.find_leaf_read(Target::Leftmost)?;
        Ok(BTreeIter::new(self.buffer_pool.clone(), start.map(|g| (g, 0))))
    }

    /// Forward iterator starting at the first key `>= key`.
    pub fn iter_from(&self, key: &[u8]) -> StorageResult<BTreeIter> {
        let Some(guard) = self.find_leaf_read(Target::Key(key))? else {
            return Ok(BTreeIter::new(self.buffer_pool.clone(), None));
        };
        let index = BTreeLeafPage::from_data(&guard).key_index(key, &*self.comparator);
        Ok(BTreeIter::new(self.buffer_pool.clone(), Some((guard, index))))
    }

    /// Shared-latch descent: latch the child, then release the parent.
    fn find_leaf_read(&self, target: Target<'_>) -> StorageResult<Option<PageReadGuard>> {
        loop {
            let root_id = *self.root_page_id.lock();
            if !root_id.is_valid() {
                return Ok(None);
            }
            let root_guard = self.buffer_pool.fetch_page(root_id)?;
            if *self.root_page_id.lock() != root_id {
                continue;
            }

            let mut current = root_guard;
            loop {
                match btree_page::page_kind(&current[..]) {
                    Some(BTreePageKind::Leaf) => return Ok(Some(current)),
                    Some(BTreePageKind::Internal) => {
                        let node = BTreeInternalPage::from_data(&current);
                        let child_id = match target {
                            Target::Leftmost => node.child_at(0),
                            Target::Key(key) => node.lookup(key, &*self.comparator),
                        };
                        // Child before parent: this cannot deadlock because
                        // we hold no latch the child's subtree could want.
                        current = self.buffer_pool.fetch_page(child_id)?;
                    }
                    None => unreachable!("descended into a non-tree page"),
                }
            }
        }
    }

    /// Exclusive-latch descent retaining the path; ancestors are released
    /// once the freshly latched child is safe for `op`.
    fn find_leaf_write(
        &self,
        key: &[u8],
        op: WriteOp,
    ) -> StorageResult<Option<Vec<PageWriteGuard>>> {
        loop {
            let root_id = *self.root_page_id.lock();
            if !root_id.is_valid() {
                return Ok(None);
            }
            let root_guard = self.buffer_pool.fetch_page_write(root_id)?;
            if *self.root_page_id.lock() != root_id {
                continue;
            }

            let mut path = vec![root_guard];
            loop {
                let current = &path[path.len() - 1];
                let child_id = match btree_page::page_kind(&current[..]) {
                    Some(BTreePageKind::Leaf) => return Ok(Some(path)),
                    Some(BTreePageKind::Internal) => {
                        BTreeInternalPage::from_data(current).lookup(key, &*self.comparator)
                    }
                    None => unreachable!("descended into a non-tree page"),
                };

                let child = self.buffer_pool.fetch_page_write(child_id)?;
                if self.is_safe(&child[..], op) {
                    path.clear();
                }
                path.push(child);
            }
        }
    }

    /// A node is safe when the operation cannot propagate through it:
    /// inserts need room for a potential separator, removals need slack
    /// above the minimum. Descent never visits the root as a child, so no
    /// root special case is needed here.
    fn is_safe(&self, bytes: &[u8], op: WriteOp) -> bool {
        let size = btree_page::size(bytes);
        let max = btree_page::max_size(bytes);
        match (op, btree_page::page_kind(bytes)) {
            // A leaf at max - 1 would hit the split trigger on insert.
            (WriteOp::Insert, Some(BTreePageKind::Leaf)) => size + 1 < max,
            (WriteOp::Insert, Some(BTreePageKind::Internal)) => size < max,
            (WriteOp::Remove, _) => size > btree_page::min_size_for(max),
            (_, None) => unreachable!("safety check on a non-tree page"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::key::{encode_i64, BytewiseComparator};
    use super::*;
    use crate::storage::buffer::lru_k::LruKReplacer;
    use crate::storage::disk::PageManager;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::{tempdir, TempDir};

    fn create_tree(leaf_max: usize, internal_max: usize) -> (TempDir, BTree) {
        let dir = tempdir().unwrap();
        let page_manager = PageManager::create(&dir.path().join("test.db")).unwrap();
        let replacer = Box::new(LruKReplacer::new(64, 2));
        let pool = BufferPoolManager::new(page_manager, replacer, 64);
        let tree = BTree::new(
            "test_index",
            pool,
            Arc::new(BytewiseComparator),
            leaf_max,
            internal_max,
        )
        .unwrap();
        (dir, tree)
    }

    fn rid(n: i64) -> Rid {
        Rid::new(PageId(1000 + (n / 100) as u32), (n % 100) as u16)
    }

    fn insert_i64(tree: &BTree, n: i64) -> bool {
        tree.insert(&encode_i64(n), rid(n)).unwrap()
    }

    fn get_i64(tree: &BTree, n: i64) -> Option<Rid> {
        tree.get_value(&encode_i64(n)).unwrap()
    }

    fn scan_keys(tree: &BTree) -> Vec<i64> {
        tree.iter()
            .unwrap()
            .map(|entry| super::key::decode_i64(&entry.unwrap().0))
            .collect()
    }

    #[test]
    fn test_empty_tree() {
        let (_dir, tree) = create_tree(4, 4);
        assert!(tree.is_empty());
        assert_eq!(get_i64(&tree, 1), None);
        tree.remove(&encode_i64(1)).unwrap();
        assert_eq!(scan_keys(&tree), Vec::<i64>::new());
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, tree) = create_tree(4, 4);
        assert!(insert_i64(&tree, 7));
        assert!(!tree.is_empty());
        assert_eq!(get_i64(&tree, 7), Some(rid(7)));
        assert_eq!(get_i64(&tree, 8), None);
    }

    #[test]
    fn test_duplicate_insert_leaves_tree_unchanged() {
        let (_dir, tree) = create_tree(4, 4);
        assert!(insert_i64(&tree, 7));
        assert!(!tree.insert(&encode_i64(7), rid(99)).unwrap());
        assert_eq!(get_i64(&tree, 7), Some(rid(7)));
    }

    #[test]
    fn test_leaf_split_builds_root() {
        let (_dir, tree) = create_tree(4, 4);
        for n in 1..=4 {
            assert!(insert_i64(&tree, n));
        }

        // The fourth insert split the leaf: the new root separates at 3.
        let root_id = tree.root_page_id().unwrap();
        let guard = tree.buffer_pool.fetch_page(root_id).unwrap();
        let root = BTreeInternalPage::from_data(&guard);
        assert_eq!(root.size(), 2);
        assert_eq!(root.key_at(1), encode_i64(3));

        let left = BTreeLeafPage::from_data(&tree.buffer_pool.fetch_page(root.child_at(0)).unwrap());
        let right = BTreeLeafPage::from_data(&tree.buffer_pool.fetch_page(root.child_at(1)).unwrap());
        assert_eq!(left.size(), 2);
        assert_eq!(right.size(), 2);
        assert_eq!(left.next_page_id(), Some(right.page_id()));

        for n in 1..=4 {
            assert_eq!(get_i64(&tree, n), Some(rid(n)));
        }
    }

    #[test]
    fn test_underflow_borrows_from_right_sibling() {
        let (_dir, tree) = create_tree(4, 4);
        for n in 1..=4 {
            insert_i64(&tree, n);
        }
        tree.remove(&encode_i64(2)).unwrap();

        // {1} borrowed 3 from {3, 4}; the root separator moved to 4.
        let root_id = tree.root_page_id().unwrap();
        let guard = tree.buffer_pool.fetch_page(root_id).unwrap();
        let root = BTreeInternalPage::from_data(&guard);
        assert_eq!(root.size(), 2);
        assert_eq!(root.key_at(1), encode_i64(4));

        let left = BTreeLeafPage::from_data(&tree.buffer_pool.fetch_page(root.child_at(0)).unwrap());
        assert_eq!(left.size(), 2);
        assert_eq!(left.key_at(0), encode_i64(1));
        assert_eq!(left.key_at(1), encode_i64(3));

        assert_eq!(scan_keys(&tree), vec![1, 3, 4]);
    }

    #[test]
    fn test_merge_collapses_root() {
        let (_dir, tree) = create_tree(4, 4);
        for n in 1..=4 {
            insert_i64(&tree, n);
        }
        // Down to two entries: the leaves merge and the root collapses.
        tree.remove(&encode_i64(2)).unwrap();
        tree.remove(&encode_i64(3)).unwrap();

        assert_eq!(scan_keys(&tree), vec![1, 4]);
        let root_id = tree.root_page_id().unwrap();
        let guard = tree.buffer_pool.fetch_page(root_id).unwrap();
        assert_eq!(
            btree_page::page_kind(&guard[..]),
            Some(BTreePageKind::Leaf)
        );
    }

    #[test]
    fn test_remove_to_empty_and_reinsert() {
        let (_dir, tree) = create_tree(4, 4);
        for n in 0..20 {
            insert_i64(&tree, n);
        }
        for n in 0..20 {
            tree.remove(&encode_i64(n)).unwrap();
        }
        assert!(tree.is_empty());
        assert_eq!(scan_keys(&tree), Vec::<i64>::new());

        assert!(insert_i64(&tree, 5));
        assert_eq!(scan_keys(&tree), vec![5]);
    }

    #[test]
    fn test_sequential_inserts_scan_in_order() {
        let (_dir, tree) = create_tree(4, 4);
        for n in 0..200 {
            assert!(insert_i64(&tree, n));
        }
        assert_eq!(scan_keys(&tree), (0..200).collect::<Vec<_>>());
        for n in 0..200 {
            assert_eq!(get_i64(&tree, n), Some(rid(n)));
        }
    }

    #[test]
    fn test_reverse_inserts_scan_in_order() {
        let (_dir, tree) = create_tree(4, 4);
        for n in (0..200).rev() {
            assert!(insert_i64(&tree, n));
        }
        assert_eq!(scan_keys(&tree), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_randomized_workload() {
        let (_dir, tree) = create_tree(6, 5);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xB7EE);
        let mut keys: Vec<i64> = (0..500).collect();
        keys.shuffle(&mut rng);
        for &n in &keys {
            assert!(insert_i64(&tree, n));
        }

        let mut to_remove = keys.clone();
        to_remove.shuffle(&mut rng);
        let removed: Vec<i64> = to_remove.into_iter().take(250).collect();
        for &n in &removed {
            tree.remove(&encode_i64(n)).unwrap();
        }
        // Removing again is a no-op.
        for &n in removed.iter().take(10) {
            tree.remove(&encode_i64(n)).unwrap();
        }

        let mut expected: Vec<i64> = keys
            .into_iter()
            .filter(|n| !removed.contains(n))
            .collect();
        expected.sort_unstable();
        assert_eq!(scan_keys(&tree), expected);
        for &n in &removed {
            assert_eq!(get_i64(&tree, n), None);
        }
        for &n in &expected {
            assert_eq!(get_i64(&tree, n), Some(rid(n)));
        }
    }

    #[test]
    fn test_iter_from_starts_mid_tree() {
        let (_dir, tree) = create_tree(4, 4);
        for n in 0..50 {
            insert_i64(&tree, n);
        }

        let keys: Vec<i64> = tree
            .iter_from(&encode_i64(17))
            .unwrap()
            .map(|entry| super::key::decode_i64(&entry.unwrap().0))
            .collect();
        assert_eq!(keys, (17..50).collect::<Vec<_>>());

        // A start key past the end yields nothing.
        let mut iter = tree.iter_from(&encode_i64(1000)).unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_empty_key_is_an_ordinary_key() {
        let (_dir, tree) = create_tree(4, 4);
        assert!(tree.insert(b"", rid(0)).unwrap());
        for n in 1..=8 {
            insert_i64(&tree, n);
        }

        assert_eq!(tree.get_value(b"").unwrap(), Some(rid(0)));
        assert!(!tree.insert(b"", rid(99)).unwrap());

        // Bytewise, the empty key sorts before everything else.
        let first = tree.iter().unwrap().next().unwrap().unwrap();
        assert_eq!(first.0, Vec::<u8>::new());
        assert_eq!(first.1, rid(0));

        tree.remove(b"").unwrap();
        assert_eq!(tree.get_value(b"").unwrap(), None);
        assert_eq!(scan_keys(&tree), (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_key_too_large_rejected() {
        let (_dir, tree) = create_tree(4, 4);
        let huge = vec![1u8; PAGE_SIZE];
        assert!(matches!(
            tree.insert(&huge, rid(0)),
            Err(StorageError::KeyTooLarge(_))
        ));
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        let (_dir, tree) = create_tree(8, 8);
        let tree = Arc::new(tree);

        let mut handles = Vec::new();
        for t in 0..4i64 {
            let tree = Arc::clone(&tree);
            handles.push(std::thread::spawn(move || {
                for n in (t * 200)..((t + 1) * 200) {
                    assert!(tree.insert(&encode_i64(n), rid(n)).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(scan_keys(&tree), (0..800).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let (_dir, tree) = create_tree(8, 8);
        let tree = Arc::new(tree);
        for n in 0..100 {
            insert_i64(&tree, n);
        }

        let writer = {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                for n in 100..300 {
                    assert!(tree.insert(&encode_i64(n), rid(n)).unwrap());
                }
            })
        };
        let reader = {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    for n in 0..100 {
                        assert_eq!(tree.get_value(&encode_i64(n)).unwrap(), Some(rid(n)));
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();

        assert_eq!(scan_keys(&tree), (0..300).collect::<Vec<_>>());
    }
}
