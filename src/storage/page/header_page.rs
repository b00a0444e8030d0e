//! The header page (page 0): a directory of index name → root page id.
//!
//! Layout (little-endian): `u32` record count, then `record_count` fixed
//! 36-byte records of `char[32]` null-padded name + `u32` root page id.
//! Lookups are linear; updates happen in place.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::utils::{read_u32, write_u32};
use crate::storage::page::{PageId, INVALID_PAGE_ID};
use crate::storage::PAGE_SIZE;

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// In-memory copy of the header page. Mutations are written back to the
/// buffer pool by copying `data()` into the page's write guard.
pub struct HeaderPage {
    data: [u8; PAGE_SIZE],
}

impl HeaderPage {
    pub fn new() -> Self {
        Self {
            data: [0; PAGE_SIZE],
        }
    }

    pub fn from_data(data: &[u8; PAGE_SIZE]) -> Self {
        Self { data: *data }
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn record_count(&self) -> usize {
        read_u32(&self.data, RECORD_COUNT_OFFSET) as usize
    }

    fn set_record_count(&mut self, count: usize) {
        write_u32(&mut self.data, RECORD_COUNT_OFFSET, count as u32);
    }

    fn record_name(&self, index: usize) -> &[u8] {
        let start = RECORDS_OFFSET + index * RECORD_SIZE;
        let name = &self.data[start..start + NAME_SIZE];
        let len = name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        &name[..len]
    }

    fn find(&self, name: &str) -> Option<usize> {
        (0..self.record_count()).find(|&i| self.record_name(i) == name.as_bytes())
    }

    /// Root page id recorded under `name`, if the index is registered.
    /// `INVALID_PAGE_ID` is reported as `None` root on an existing record.
    pub fn get_root(&self, name: &str) -> Option<Option<PageId>> {
        self.find(name).map(|i| {
            let offset = RECORDS_OFFSET + i * RECORD_SIZE + NAME_SIZE;
            PageId::from_raw(read_u32(&self.data, offset))
        })
    }

    /// Registers a new index. Fails if the name is too long, already present,
    /// or the page is out of record slots.
    pub fn insert_record(&mut self, name: &str, root: Option<PageId>) -> StorageResult<()> {
        if self.find(name).is_some() {
            return Err(StorageError::IndexAlreadyRegistered(name.to_string()));
        }
        if name.len() > NAME_SIZE {
            return Err(StorageError::KeyTooLarge(name.len()));
        }
        let count = self.record_count();
        if count >= MAX_RECORDS {
            return Err(StorageError::HeaderFull);
        }

        let start = RECORDS_OFFSET + count * RECORD_SIZE;
        self.data[start..start + NAME_SIZE].fill(0);
        self.data[start..start + name.len()].copy_from_slice(name.as_bytes());
        write_u32(
            &mut self.data,
            start + NAME_SIZE,
            root.unwrap_or(INVALID_PAGE_ID).0,
        );
        self.set_record_count(count + 1);
        Ok(())
    }

    /// Updates the root recorded under `name` in place.
    pub fn update_record(&mut self, name: &str, root: Option<PageId>) -> StorageResult<()> {
        let i = self
            .find(name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))?;
        let offset = RECORDS_OFFSET + i * RECORD_SIZE + NAME_SIZE;
        write_u32(&mut self.data, offset, root.unwrap_or(INVALID_PAGE_ID).0);
        Ok(())
    }

    /// Removes the record under `name`; the last record slides into its slot.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let Some(i) = self.find(name) else {
            return false;
        };
        let count = self.record_count();
        if i != count - 1 {
            let last = RECORDS_OFFSET + (count - 1) * RECORD_SIZE;
            let dst = RECORDS_OFFSET + i * RECORD_SIZE;
            let moved: [u8; RECORD_SIZE] = self.data[last..last + RECORD_SIZE].try_into().unwrap();
            self.data[dst..dst + RECORD_SIZE].copy_from_slice(&moved);
        }
        self.set_record_count(count - 1);
        true
    }
}

impl Default for HeaderPage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() -> StorageResult<()> {
        let mut page = HeaderPage::new();
        assert_eq!(page.record_count(), 0);
        assert_eq!(page.get_root("orders_pk"), None);

        page.insert_record("orders_pk", Some(PageId(3)))?;
        page.insert_record("users_pk", None)?;

        assert_eq!(page.record_count(), 2);
        assert_eq!(page.get_root("orders_pk"), Some(Some(PageId(3))));
        assert_eq!(page.get_root("users_pk"), Some(None));
        assert_eq!(page.get_root("missing"), None);
        Ok(())
    }

    #[test]
    fn test_update_in_place() -> StorageResult<()> {
        let mut page = HeaderPage::new();
        page.insert_record("idx", None)?;
        page.update_record("idx", Some(PageId(9)))?;
        assert_eq!(page.get_root("idx"), Some(Some(PageId(9))));
        assert_eq!(page.record_count(), 1);

        assert!(matches!(
            page.update_record("nope", Some(PageId(1))),
            Err(StorageError::UnknownIndex(_))
        ));
        Ok(())
    }

    #[test]
    fn test_delete_record() -> StorageResult<()> {
        let mut page = HeaderPage::new();
        page.insert_record("a", Some(PageId(1)))?;
        page.insert_record("b", Some(PageId(2)))?;
        page.insert_record("c", Some(PageId(3)))?;

        assert!(page.delete_record("a"));
        assert!(!page.delete_record("a"));
        assert_eq!(page.record_count(), 2);
        // "c" slid into the vacated slot and both survivors resolve.
        assert_eq!(page.get_root("c"), Some(Some(PageId(3))));
        assert_eq!(page.get_root("b"), Some(Some(PageId(2))));
        Ok(())
    }

    #[test]
    fn test_serialization_round_trip() -> StorageResult<()> {
        let mut page = HeaderPage::new();
        page.insert_record("idx", Some(PageId(42)))?;

        let restored = HeaderPage::from_data(page.data());
        assert_eq!(restored.get_root("idx"), Some(Some(PageId(42))));
        Ok(())
    }

    #[test]
    fn test_duplicate_registration_is_a_typed_error() {
        let mut page = HeaderPage::new();
        page.insert_record("idx", Some(PageId(1))).unwrap();
        assert!(matches!(
            page.insert_record("idx", None),
            Err(StorageError::IndexAlreadyRegistered(_))
        ));
        // The existing record is untouched.
        assert_eq!(page.get_root("idx"), Some(Some(PageId(1))));
        assert_eq!(page.record_count(), 1);
    }

    #[test]
    fn test_name_too_long() {
        let mut page = HeaderPage::new();
        let long = "x".repeat(NAME_SIZE + 1);
        assert!(matches!(
            page.insert_record(&long, None),
            Err(StorageError::KeyTooLarge(_))
        ));
    }

    #[test]
    fn test_capacity() -> StorageResult<()> {
        let mut page = HeaderPage::new();
        for i in 0..MAX_RECORDS {
            page.insert_record(&format!("idx_{i}"), Some(PageId(i as u32)))?;
        }
        assert!(matches!(
            page.insert_record("one_too_many", None),
            Err(StorageError::HeaderFull)
        ));
        Ok(())
    }
}
