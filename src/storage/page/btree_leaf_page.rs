//! B+ tree leaf page: a sorted run of (key, rid) entries.
//!
//! Slots are 10 bytes: key offset (u16), key length (u16), rid (6 bytes).
//! Key bytes live in a heap growing down from the page end; removal compacts
//! the heap so free space stays contiguous between `lower` and `upper`.

use crate::access::btree::key::KeyComparator;
use crate::access::Rid;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::btree_page::{self, BTreePageKind, BTREE_PAGE_HEADER_SIZE};
use crate::storage::page::utils::{read_u16, write_u16};
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;
use std::cmp::Ordering;

const SLOT_SIZE: usize = 10;

pub struct BTreeLeafPage {
    data: [u8; PAGE_SIZE],
}

impl BTreeLeafPage {
    pub fn new(page_id: PageId, max_size: usize) -> Self {
        assert!(max_size >= 2, "a leaf must hold at least two entries");
        let mut data = [0u8; PAGE_SIZE];
        btree_page::init_header(&mut data, BTreePageKind::Leaf, page_id, max_size as u16);
        Self { data }
    }

    /// Wraps a copy of raw page bytes. Panics if the bytes are not a leaf.
    pub fn from_data(data: &[u8; PAGE_SIZE]) -> Self {
        assert_eq!(
            btree_page::page_kind(data),
            Some(BTreePageKind::Leaf),
            "page is not a B+ tree leaf"
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

    pub fn next_page_id(&self) -> Option<PageId> {
        btree_page::next_page_id(&self.data)
    }

    pub fn set_next_page_id(&mut self, next: Option<PageId>) {
        btree_page::set_next_page_id(&mut self.data, next);
    }

    fn slot_offset(index: usize) -> usize {
        BTREE_PAGE_HEADER_SIZE + index * SLOT_SIZE
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.size());
        let slot = Self::slot_offset(index);
        let offset = read_u16(&self.data, slot) as usize;
        let len = read_u16(&self.data, slot + 2) as usize;
        &self.data[offset..offset + len]
    }

    pub fn rid_at(&self, index: usize) -> Rid {
        debug_assert!(index < self.size());
        let slot = Self::slot_offset(index);
        Rid::from_bytes(&self.data[slot + 4..slot + 10])
    }

    pub fn first_key(&self) -> Vec<u8> {
        self.key_at(0).to_vec()
    }

    /// Index of the first entry whose key is `>= key`.
    pub fn key_index(&self, key: &[u8], cmp: &dyn KeyComparator) -> usize {
        let mut lo = 0;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(self.key_at(mid), key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn lookup(&self, key: &[u8], cmp: &dyn KeyComparator) -> Option<Rid> {
        let index = self.key_index(key, cmp);
        if index < self.size() && cmp.compare(self.key_at(index), key) == Ordering::Equal {
            Some(self.rid_at(index))
        } else {
            None
        }
    }

    /// Inserts at the sorted position. `Ok(false)` when the key is already
    /// present (keys are unique).
    pub fn insert(&mut self, key: &[u8], rid: Rid, cmp: &dyn KeyComparator) -> StorageResult<bool> {
        let index = self.key_index(key, cmp);
        if index < self.size() && cmp.compare(self.key_at(index), key) == Ordering::Equal {
            return Ok(false);
        }
        self.insert_at(index, key, rid)?;
        Ok(true)
    }

    /// Removes the entry for `key`; false when absent.
    pub fn remove(&mut self, key: &[u8], cmp: &dyn KeyComparator) -> bool {
        let index = self.key_index(key, cmp);
        if index < self.size() && cmp.compare(self.key_at(index), key) == Ordering::Equal {
            self.remove_at(index);
            true
        } else {
            false
        }
    }

    pub fn insert_at(&mut self, index: usize, key: &[u8], rid: Rid) -> StorageResult<()> {
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

        // Make room in the slot array, then place the key at the heap top.
        let slot = Self::slot_offset(index);
        self.data.copy_within(slot..lower, slot + SLOT_SIZE);
        let key_offset = if key.is_empty() { 0 } else { upper - key.len() };
        if !key.is_empty() {
            self.data[key_offset..key_offset + key.len()].copy_from_slice(key);
        }
        write_u16(&mut self.data, slot, key_offset as u16);
        write_u16(&mut self.data, slot + 2, key.len() as u16);
        self.data[slot + 4..slot + 10].copy_from_slice(&rid.to_bytes());

        let new_size = self.size() + 1;
        btree_page::set_size(&mut self.data, new_size);
        btree_page::set_lower(&mut self.data, lower + SLOT_SIZE);
        btree_page::set_upper(&mut self.data, upper - key.len());
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> (Vec<u8>, Rid) {
        debug_assert!(index < self.size());
        let slot = Self::slot_offset(index);
        let key_offset = read_u16(&self.data, slot) as usize;
        let key_len = read_u16(&self.data, slot + 2) as usize;
        let key = self.data[key_offset..key_offset + key_len].to_vec();
        let rid = Rid::from_bytes(&self.data[slot + 4..slot + 10]);

        let lower = btree_page::lower(&self.data);
        let upper = btree_page::upper(&self.data);

        // Drop the slot, then close the hole the key left in the heap.
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

        (key, rid)
    }

    pub fn entries(&self) -> Vec<(Vec<u8>, Rid)> {
        (0..self.size())
            .map(|i| (self.key_at(i).to_vec(), self.rid_at(i)))
            .collect()
    }

    /// Appends entries already in key order (greater than everything held).
    pub fn extend(&mut self, entries: &[(Vec<u8>, Rid)]) -> StorageResult<()> {
        for (key, rid) in entries {
            self.insert_at(self.size(), key, *rid)?;
        }
        Ok(())
    }

    /// Moves the upper half of the entries out, leaving the lower half in
    /// place. The caller links the returned run into a fresh sibling.
    pub fn split_off_upper_half(&mut self) -> Vec<(Vec<u8>, Rid)> {
        let entries = self.entries();
        let split = entries.len() / 2;
        let right = entries[split..].to_vec();
        self.rebuild(&entries[..split]);
        right
    }

    /// Appends every entry of `right` and takes over its leaf-chain link.
    pub fn merge_from(&mut self, right: &BTreeLeafPage) -> StorageResult<()> {
        self.extend(&right.entries())?;
        self.set_next_page_id(right.next_page_id());
        Ok(())
    }

    fn rebuild(&mut self, entries: &[(Vec<u8>, Rid)]) {
        let page_id = self.page_id();
        let max_size = self.max_size();
        let next = self.next_page_id();
        btree_page::init_header(
            &mut self.data,
            BTreePageKind::Leaf,
            page_id,
            max_size as u16,
        );
        self.set_next_page_id(next);
        // Entries came out of this page, so they are guaranteed to fit.
        self.extend(entries).unwrap();
    }
}
