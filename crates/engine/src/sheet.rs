//! Sparse per-sheet cell storage with ever-ensured bounds.
//!
//! Cells exist only once written; `ensure_bounds` grows the addressable
//! area without materializing anything. Structural edits (insert/remove
//! rows and columns) shift stored cells; rewriting the formulas that
//! reference them is the table store's job.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::address::Point;
use crate::cell::Cell;

/// Stable sheet identifier, never reused after deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetId(u64);

impl SheetId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Ever-ensured sheet extents, 1-based inclusive. `top`/`left` are always 1
/// today but are tracked explicitly so references can be validated against
/// all four edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl Bounds {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            top: 1,
            left: 1,
            bottom: rows.max(1),
            right: cols.max(1),
        }
    }

    /// True if the point lies inside the bounds. Sentinel-0 axes pass; they
    /// are clamped to the bounds at resolution time.
    pub fn contains(&self, p: Point) -> bool {
        (p.row == 0 || (p.row >= self.top && p.row <= self.bottom))
            && (p.col == 0 || (p.col >= self.left && p.col <= self.right))
    }

    /// Grow to cover at least `rows` x `cols`. Bounds never shrink.
    pub fn ensure(&mut self, rows: u32, cols: u32) {
        self.bottom = self.bottom.max(rows);
        self.right = self.right.max(cols);
    }
}

/// Named sparse collection of cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    id: SheetId,
    pub name: String,
    cells: FxHashMap<(u32, u32), Cell>,
    bounds: Bounds,
}

impl Sheet {
    pub fn new(id: SheetId, name: impl Into<String>, rows: u32, cols: u32) -> Self {
        Self {
            id,
            name: name.into(),
            cells: FxHashMap::default(),
            bounds: Bounds::new(rows, cols),
        }
    }

    pub fn id(&self) -> SheetId {
        self.id
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn ensure_bounds(&mut self, rows: u32, cols: u32) {
        self.bounds.ensure(rows, cols);
    }

    pub fn get(&self, p: Point) -> Option<&Cell> {
        self.cells.get(&(p.row, p.col))
    }

    pub fn get_mut(&mut self, p: Point) -> Option<&mut Cell> {
        self.cells.get_mut(&(p.row, p.col))
    }

    /// Store a cell, growing the bounds to cover it.
    pub fn set(&mut self, p: Point, cell: Cell) {
        self.bounds.ensure(p.row, p.col);
        self.cells.insert((p.row, p.col), cell);
    }

    pub fn remove(&mut self, p: Point) -> Option<Cell> {
        self.cells.remove(&(p.row, p.col))
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> impl Iterator<Item = (Point, &Cell)> {
        self.cells
            .iter()
            .map(|(&(r, c), cell)| (Point::new(r, c), cell))
    }

    pub fn cells_mut(&mut self) -> impl Iterator<Item = (Point, &mut Cell)> {
        self.cells
            .iter_mut()
            .map(|(&(r, c), cell)| (Point::new(r, c), cell))
    }

    /// Insert rows at `at`, shifting rows at and below it down.
    pub fn insert_rows(&mut self, at: u32, count: u32) {
        let shifted: Vec<_> = self
            .cells
            .keys()
            .filter(|(r, _)| *r >= at)
            .copied()
            .collect();

        let mut moved = Vec::with_capacity(shifted.len());
        for key in shifted {
            if let Some(cell) = self.cells.remove(&key) {
                moved.push((key, cell));
            }
        }
        for ((r, c), cell) in moved {
            self.cells.insert((r + count, c), cell);
            self.bounds.ensure(r + count, c);
        }
        let grown = self.bounds.bottom.saturating_add(count);
        self.bounds.ensure(grown, 0);
    }

    /// Remove `count` rows starting at `start`, shifting the rest up.
    /// Returns the removed cells for diff capture. Bounds do not shrink.
    pub fn remove_rows(&mut self, start: u32, count: u32) -> Vec<(Point, Cell)> {
        let end = start + count;
        let mut removed = Vec::new();

        let affected: Vec<_> = self
            .cells
            .keys()
            .filter(|(r, _)| *r >= start)
            .copied()
            .collect();
        for key in affected {
            if let Some(cell) = self.cells.remove(&key) {
                let (r, c) = key;
                if r < end {
                    removed.push((Point::new(r, c), cell));
                } else {
                    self.cells.insert((r - count, c), cell);
                }
            }
        }
        removed
    }

    /// Insert columns at `at`, shifting columns at and to the right of it.
    pub fn insert_cols(&mut self, at: u32, count: u32) {
        let shifted: Vec<_> = self
            .cells
            .keys()
            .filter(|(_, c)| *c >= at)
            .copied()
            .collect();

        let mut moved = Vec::with_capacity(shifted.len());
        for key in shifted {
            if let Some(cell) = self.cells.remove(&key) {
                moved.push((key, cell));
            }
        }
        for ((r, c), cell) in moved {
            self.cells.insert((r, c + count), cell);
            self.bounds.ensure(r, c + count);
        }
        let grown = self.bounds.right.saturating_add(count);
        self.bounds.ensure(0, grown);
    }

    /// Remove `count` columns starting at `start`, shifting the rest left.
    pub fn remove_cols(&mut self, start: u32, count: u32) -> Vec<(Point, Cell)> {
        let end = start + count;
        let mut removed = Vec::new();

        let affected: Vec<_> = self
            .cells
            .keys()
            .filter(|(_, c)| *c >= start)
            .copied()
            .collect();
        for key in affected {
            if let Some(cell) = self.cells.remove(&key) {
                let (r, c) = key;
                if c < end {
                    removed.push((Point::new(r, c), cell));
                } else {
                    self.cells.insert((r, c - count), cell);
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellContent;

    fn sheet() -> Sheet {
        Sheet::new(SheetId::from_raw(1), "Sheet1", 100, 26)
    }

    fn put(s: &mut Sheet, row: u32, col: u32, input: &str) {
        s.set(Point::new(row, col), Cell::new(CellContent::from_input(input), 1));
    }

    fn raw_at(s: &Sheet, row: u32, col: u32) -> Option<String> {
        s.get(Point::new(row, col)).map(|c| c.raw())
    }

    #[test]
    fn sparse_storage_materializes_nothing() {
        let s = sheet();
        assert_eq!(s.cell_count(), 0);
        assert_eq!(s.bounds().bottom, 100);
        assert!(s.get(Point::new(50, 10)).is_none());
    }

    #[test]
    fn set_grows_bounds() {
        let mut s = sheet();
        put(&mut s, 500, 30, "x");
        assert_eq!(s.bounds().bottom, 500);
        assert_eq!(s.bounds().right, 30);
    }

    #[test]
    fn ensure_bounds_never_shrinks() {
        let mut s = sheet();
        s.ensure_bounds(1000, 50);
        assert_eq!(s.bounds().bottom, 1000);
        s.ensure_bounds(10, 10);
        assert_eq!(s.bounds().bottom, 1000);
        assert_eq!(s.bounds().right, 50);
    }

    #[test]
    fn bounds_contains_sentinels() {
        let b = Bounds::new(100, 26);
        assert!(b.contains(Point::new(0, 5)));
        assert!(b.contains(Point::new(50, 0)));
        assert!(b.contains(Point::new(100, 26)));
        assert!(!b.contains(Point::new(101, 1)));
        assert!(!b.contains(Point::new(1, 27)));
    }

    #[test]
    fn insert_rows_shifts_down() {
        let mut s = sheet();
        put(&mut s, 1, 1, "top");
        put(&mut s, 5, 1, "below");
        s.insert_rows(3, 2);
        assert_eq!(raw_at(&s, 1, 1).as_deref(), Some("top"));
        assert!(s.get(Point::new(5, 1)).is_none());
        assert_eq!(raw_at(&s, 7, 1).as_deref(), Some("below"));
        assert_eq!(s.bounds().bottom, 102);
    }

    #[test]
    fn remove_rows_shifts_up_and_reports_removed() {
        let mut s = sheet();
        put(&mut s, 2, 1, "keep");
        put(&mut s, 4, 1, "gone");
        put(&mut s, 6, 1, "moves");
        let removed = s.remove_rows(4, 2);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, Point::new(4, 1));
        assert_eq!(raw_at(&s, 2, 1).as_deref(), Some("keep"));
        assert_eq!(raw_at(&s, 4, 1).as_deref(), Some("moves"));
        // Bounds are ever-ensured: removal does not shrink them.
        assert_eq!(s.bounds().bottom, 100);
    }

    #[test]
    fn insert_and_remove_cols() {
        let mut s = sheet();
        put(&mut s, 1, 2, "b");
        put(&mut s, 1, 4, "d");
        s.insert_cols(3, 1);
        assert_eq!(raw_at(&s, 1, 2).as_deref(), Some("b"));
        assert_eq!(raw_at(&s, 1, 5).as_deref(), Some("d"));

        let removed = s.remove_cols(2, 1);
        assert_eq!(removed.len(), 1);
        assert_eq!(raw_at(&s, 1, 4).as_deref(), Some("d"));
    }
}
