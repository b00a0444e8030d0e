//! B+ tree internal page: separator keys and child page ids.
//!
//! Slots are 8 bytes: key offset (u16), key length (u16), child id (u32).
//! `size` counts child pointers, slot 0 included; slot 0's key is never
//! consulted (it stands for −∞). The subtree under child `i` holds keys in
//! `[key_at(i), key_at(i + 1))`.

use crate::access::btree::key::KeyComparator;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::btree_page::{self, BTreePageKind, BTREE_PAGE_HEADER_SIZE};
use crate::storage::page::utils::{read_u16, read_u32, write_u16, write_u32};
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;
use std::cmp::Ordering;

const SLOT_SIZE: usize = 8;

pub struct BTreeInternalPage {
    data: [u8; PAGE_SIZE],
}

impl BTreeInternalPage {
    pub fn new(page_id: PageId, max_size: usize) -> Self {
        assert!(max_size >= 3, "an internal page must hold at least three pointers");
        let mut data = [0u8; PAGE_SIZE];
        btree_page::init_header(&mut data, BTreePageKind::Internal, page_id, max_size as u16);
        Self { data }
    }

    /// Wraps a copy of raw page bytes. Panics if the bytes are not internal.
    pub fn from_data(data: &[u8; PAGE_SIZE]) -> Self {
        assert_eq!(
            btree_page::page_kind(data),
            Some(BTreePageKind::Internal),
            "page is not a B+ tree internal page"
        );
        Self { data: *data }
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn page_id(&self) -> PageId {
        btree_page::page_id(&self.data)
    }

    pub fn size(&self) -> usize {
        btree_page::size(&self.data)
    }

    pub fn max_size(&self) -> usize {
        btree_page::max_size(&self.data)
    }

    pub fn min_size(&self) -> usize {
        btree_page::min_size_for(self.max_size())
    }

    fn slot_offset(index: usize) -> usize {
        BTREE_PAGE_HEADER_SIZE + index * SLOT_SIZE
    }

    /// Separator key at `index`; meaningless for index 0.
    pub fn key_at(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.size());
        let slot = Self::slot_offset(index);
        let offset = read_u16(&self.data, slot) as usize;
        let len = read_u16(&self.data, slot + 2) as usize;
        &self.data[offset..offset + len]
    }

    pub fn child_at(&self, index: usize) -> PageId {
        debug_assert!(index < self.size());
        let slot = Self::slot_offset(index);
        PageId(read_u32(&self.data, slot + 4))
    }

    /// Position of `child` among the pointers.
    pub fn child_index(&self, child: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.child_at(i) == child)
    }

    /// Child to descend into for `key`: the pointer at the last separator
    /// `<= key`, with slot 0 standing for −∞.
    pub fn lookup(&self, key: &[u8], cmp: &dyn KeyComparator) -> PageId {
        let mut lo = 1;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(self.key_at(mid), key) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.child_at(lo - 1)
    }

    /// Inserts a separator and the child to its right, keeping key order.
    pub fn insert(
        &mut self,
        key: &[u8],
        child: PageId,
        cmp: &dyn KeyComparator,
    ) -> StorageResult<()> {
        let mut lo = 1;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(self.key_at(mid), key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.insert_at(lo, key, child)
    }

    /// Seeds a fresh root with two children separated by `key`.
    pub fn populate_new_root(
        &mut self,
        left: PageId,
        key: &[u8],
        right: PageId,
    ) -> StorageResult<()> {
        assert_eq!(self.size(), 0, "new root must start empty");
        self.insert_at(0, &[], left)?;
        self.insert_at(1, key, right)
    }

    pub fn insert_at(&mut self, index: usize, key: &[u8], child: PageId) -> StorageResult<()> {
        debug_assert!(index <= self.size());
        let lower = btree_page::lower(&self.data);
        let upper = btree_page::upper(&self.data);
        let needed = SLOT_SIZE + key.len();
        if needed > upper - lower {
            return Err(StorageError::PageFull {
                required: needed,
                available: upper - lower,
            });
        }

        let slot = Self::slot_offset(index);
        self.data.copy_within(slot..lower, slot + SLOT_SIZE);
        let key_offset = if key.is_empty() { 0 } else { upper - key.len() };
        if !key.is_empty() {
            self.data[key_offset..key_offset + key.len()].copy_from_slice(key);
        }
        write_u16(&mut self.data, slot, key_offset as u16);
        write_u16(&mut self.data, slot + 2, key.len() as u16);
        write_u32(&mut self.data, slot + 4, child.0);

        let new_size = self.size() + 1;
        btree_page::set_size(&mut self.data, new_size);
        btree_page::set_lower(&mut self.data, lower + SLOT_SIZE);
        btree_page::set_upper(&mut self.data, upper - key.len());
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> (Vec<u8>, PageId) {
        debug_assert!(index < self.size());
        let slot = Self::slot_offset(index);
        let key_offset = read_u16(&self.data, slot) as usize;
        let key_len = read_u16(&self.data, slot + 2) as usize;
        let key = self.data[key_offset..key_offset + key_len].to_vec();
        let child = PageId(read_u32(&self.data, slot + 4));

        let lower = btree_page::lower(&self.data);
        let upper = btree_page::upper(&self.data);

        self.data.copy_within(slot + SLOT_SIZE..lower, slot);
        let new_size = self.size() - 1;
        btree_page::set_size(&mut self.data, new_size);
        btree_page::set_lower(&mut self.data, lower - SLOT_SIZE);

        if key_len > 0 {
            self.data.copy_within(upper..key_offset, upper + key_len);
            btree_page::set_upper(&mut self.data, upper + key_len);
            for i in 0..self.size() {
                let s = Self::slot_offset(i);
                let off = read_u16(&self.data, s) as usize;
                let len = read_u16(&self.data, s + 2) as usize;
                if len > 0 && off < key_offset {
                    write_u16(&mut self.data, s, (off + key_len) as u16);
                }
            }
        }

        (key, child)
    }

    /// Rewrites the separator at `index`, e.g. after a borrow moved the
    /// boundary between two children.
    pub fn replace_key_at(&mut self, index: usize, key: &[u8]) -> StorageResult<()> {
        debug_assert!(index > 0, "slot 0 carries no separator");
        let (_, child) = self.remove_at(index);
        self.insert_at(index, key, child)
    }

    /// Drops the first pointer, for a borrow that donated it leftward. The
    /// returned key is the separator that vanished with it (the old
    /// `key_at(1)`); the new slot 0 key becomes the ignored −∞ slot.
    pub fn delete_first(&mut self) -> (Vec<u8>, PageId) {
        let key = self.key_at(1).to_vec();
        let (_, child) = self.remove_at(0);
        (key, child)
    }

    pub fn entries(&self) -> Vec<(Vec<u8>, PageId)> {
        (0..self.size())
            .map(|i| (self.key_at(i).to_vec(), self.child_at(i)))
            .collect()
    }

    /// Appends entries already in key order.
    pub fn extend(&mut self, entries: &[(Vec<u8>, PageId)]) -> StorageResult<()> {
        for (key, child) in entries {
            self.insert_at(self.size(), key, *child)?;
        }
        Ok(())
    }

    /// Inserts `(key, child)` into an already-full page by splitting:
    /// returns the promoted middle key and the entry run for the new right
    /// sibling (its first entry is the −∞ slot).
    pub fn split_insert(
        &mut self,
        key: &[u8],
        child: PageId,
        cmp: &dyn KeyComparator,
    ) -> StorageResult<(Vec<u8>, Vec<(Vec<u8>, PageId)>)> {
        let mut entries = self.entries();
        let pos = entries
            .iter()
            .skip(1)
            .position(|(k, _)| cmp.compare(k, key) != Ordering::Less)
            .map(|p| p + 1)
            .unwrap_or(entries.len());
        entries.insert(pos, (key.to_vec(), child));

        let mid = entries.len() / 2;
        let promoted = entries[mid].0.clone();
        let mut right = entries[mid..].to_vec();
        right[0].0.clear();
        self.rebuild(&entries[..mid])?;
        Ok((promoted, right))
    }

    /// Folds `right` in: the separator key descends alongside `right`'s
    /// first child, then the rest follows.
    pub fn merge_from(
        &mut self,
        separator: &[u8],
        right: &BTreeInternalPage,
    ) -> StorageResult<()> {
        let mut entries = right.entries();
        entries[0].0 = separator.to_vec();
        self.extend(&entries)
    }

    fn rebuild(&mut self, entries: &[(Vec<u8>, PageId)]) -> StorageResult<()> {
        let page_id = self.page_id();
        let max_size = self.max_size();
        btree_page::init_header(
            &mut self.data,
            BTreePageKind::Internal,
            page_id,
            max_size as u16,
        );
        self.extend(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::btree::key::BytewiseComparator;

    fn internal_with(children: &[(&[u8], u32)]) -> BTreeInternalPage {
        let mut page = BTreeInternalPage::new(PageId(1), 64);
        for (i, (key, child)) in children.iter().enumerate() {
            page.insert_at(i, key, PageId(*child)).unwrap();
        }
        page
    }

    #[test]
    fn test_lookup_routes_by_separator() {
        let cmp = BytewiseComparator;
        let page = internal_with(&[(b"" as &[u8], 10), (b"f", 11), (b"p", 12)]);

        assert_eq!(page.lookup(b"a", &cmp), PageId(10));
        assert_eq!(page.lookup(b"f", &cmp), PageId(11));
        assert_eq!(page.lookup(b"m", &cmp), PageId(11));
        assert_eq!(page.lookup(b"p", &cmp), PageId(12));
        assert_eq!(page.lookup(b"z", &cmp), PageId(12));
    }

    #[test]
    fn test_populate_new_root() {
        let cmp = BytewiseComparator;
        let mut page = BTreeInternalPage::new(PageId(1), 8);
        page.populate_new_root(PageId(4), b"m", PageId(5)).unwrap();

        assert_eq!(page.size(), 2);
        assert_eq!(page.lookup(b"a", &cmp), PageId(4));
        assert_eq!(page.lookup(b"m", &cmp), PageId(5));
    }

    #[test]
    fn test_insert_keeps_separator_order() {
        let cmp = BytewiseComparator;
        let mut page = internal_with(&[(b"" as &[u8], 10), (b"p", 12)]);
        page.insert(b"f", PageId(11), &cmp).unwrap();

        assert_eq!(page.key_at(1), b"f");
        assert_eq!(page.child_at(1), PageId(11));
        assert_eq!(page.key_at(2), b"p");
    }

    #[test]
    fn test_child_index() {
        let page = internal_with(&[(b"" as &[u8], 10), (b"f", 11), (b"p", 12)]);
        assert_eq!(page.child_index(PageId(11)), Some(1));
        assert_eq!(page.child_index(PageId(99)), None);
    }

    #[test]
    fn test_split_insert_promotes_middle() {
        let cmp = BytewiseComparator;
        // Full at max_size 4.
        let mut page = BTreeInternalPage::new(PageId(1), 4);
        for (i, (key, child)) in [(b"" as &[u8], 10u32), (b"d", 11), (b"h", 12), (b"p", 13)]
            .iter()
            .enumerate()
        {
            page.insert_at(i, key, PageId(*child)).unwrap();
        }

        let (promoted, right) = page.split_insert(b"l", PageId(14), &cmp).unwrap();
        // Pointer order was 10,11,12,14,13 with keys d,h,l,p; mid promotes "h".
        assert_eq!(promoted, b"h");
        assert_eq!(page.size(), 2);
        assert_eq!(page.child_at(1), PageId(11));
        assert_eq!(right.len(), 3);
        assert!(right[0].0.is_empty());
        assert_eq!(right[0].1, PageId(12));
        assert_eq!(right[1], (b"l".to_vec(), PageId(14)));
        assert_eq!(right[2], (b"p".to_vec(), PageId(13)));
    }

    #[test]
    fn test_merge_from_descends_separator() {
        let cmp = BytewiseComparator;
        let mut left = internal_with(&[(b"" as &[u8], 10), (b"d", 11)]);
        let right = internal_with(&[(b"" as &[u8], 20), (b"t", 21)]);

        left.merge_from(b"m", &right).unwrap();
        assert_eq!(left.size(), 4);
        assert_eq!(left.key_at(2), b"m");
        assert_eq!(left.child_at(2), PageId(20));
        assert_eq!(left.lookup(b"x", &cmp), PageId(21));
    }

    #[test]
    fn test_delete_first() {
        let mut page = internal_with(&[(b"" as &[u8], 10), (b"f", 11), (b"p", 12)]);
        let (key, child) = page.delete_first();

        assert_eq!(key, b"f");
        assert_eq!(child, PageId(10));
        assert_eq!(page.size(), 2);
        assert_eq!(page.child_at(0), PageId(11));
        assert_eq!(page.key_at(1), b"p");
    }

    #[test]
    fn test_replace_key_at() {
        let cmp = BytewiseComparator;
        let mut page = internal_with(&[(b"" as &[u8], 10), (b"f", 11)]);
        page.replace_key_at(1, b"ff").unwrap();

        assert_eq!(page.key_at(1), b"ff");
        assert_eq!(page.lookup(b"f", &cmp), PageId(10));
        assert_eq!(page.lookup(b"ff", &cmp), PageId(11));
    }
}
