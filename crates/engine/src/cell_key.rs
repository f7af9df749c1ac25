//! Cell identity for the dependency graph and async waiter tracking.
//!
//! A `CellKey` uniquely identifies a cell across all sheets in a table.

use serde::{Deserialize, Serialize};

use crate::address::Point;
use crate::sheet::SheetId;

/// Unique identifier for a cell in a table.
///
/// Combines sheet identity with a 1-based point. Used as graph nodes in the
/// dependency graph and as waiter keys in the async cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellKey {
    /// The sheet this cell belongs to (stable, never reused after deletion).
    pub sheet: SheetId,
    pub point: Point,
}

impl CellKey {
    #[inline]
    pub fn new(sheet: SheetId, point: Point) -> Self {
        Self { sheet, point }
    }
}

impl std::fmt::Display for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sheet{}!{}", self.sheet.raw(), self.point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_equality_and_hash() {
        use std::collections::HashSet;

        let a = CellKey::new(SheetId::from_raw(1), Point::new(1, 1));
        let b = CellKey::new(SheetId::from_raw(1), Point::new(1, 1));
        let c = CellKey::new(SheetId::from_raw(2), Point::new(1, 1));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn display_uses_a1_notation() {
        let key = CellKey::new(SheetId::from_raw(1), Point::new(10, 27));
        assert_eq!(format!("{}", key), "sheet1!AA10");
    }
}
