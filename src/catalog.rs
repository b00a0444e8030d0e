//! Catalog identifiers.
//!
//! The catalog proper (tables, schemas, index registry) lives outside this
//! crate; the lock manager only needs the table oid it keys its queues on.

use serde::{Deserialize, Serialize};

/// Identifier of a table in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableOid(pub u32);

impl std::fmt::Display for TableOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table#{}", self.0)
    }
}
