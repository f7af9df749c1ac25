//! The table store: every sheet, plus the mutation API the grid consumes.
//!
//! All external mutations flow through here. Each one bumps the monotonic
//! version counter, stamps the touched cells, appends an immutable history
//! entry, and returns a diff describing what changed so external undo/redo
//! can reverse it. Structural edits (insert/remove rows/columns) also
//! rewrite every formula whose references point at or past the shifted
//! region; references strictly inside a removed region are poisoned to
//! `#REF!`.
//!
//! Writes are always accepted: validation and coercion are evaluation
//! concerns, not storage concerns.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::address::Point;
use crate::cell::{Cell, CellContent};
use crate::cell_key::CellKey;
use crate::config::EngineConfig;
use crate::formula::eval::Value;
use crate::formula::refs::{adjust_entity, ShiftOp};
use crate::sheet::{Sheet, SheetId};
use crate::solver::AsyncResult;

/// One changed cell: the raw content before and after. `None` means the
/// cell did not exist / was removed. Applying a diff writes each entry's
/// `after`; reversing it swaps the fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub sheet: SheetId,
    pub point: Point,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Description of the cells a mutation changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The inverse diff: applying it undoes this one.
    pub fn reversed(&self) -> Diff {
        Diff {
            entries: self
                .entries
                .iter()
                .map(|e| DiffEntry {
                    sheet: e.sheet,
                    point: e.point,
                    before: e.after.clone(),
                    after: e.before.clone(),
                })
                .collect(),
        }
    }

    /// Keys of every touched cell.
    pub fn keys(&self) -> Vec<CellKey> {
        self.entries
            .iter()
            .map(|e| CellKey::new(e.sheet, e.point))
            .collect()
    }
}

/// What kind of mutation a history entry records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableOp {
    Write { sheet: SheetId, point: Point },
    Update { cells: usize },
    InsertRows { sheet: SheetId, at: u32, count: u32 },
    RemoveRows { sheet: SheetId, at: u32, count: u32 },
    InsertCols { sheet: SheetId, at: u32, count: u32 },
    RemoveCols { sheet: SheetId, at: u32, count: u32 },
    EnsureBounds { sheet: SheetId, rows: u32, cols: u32 },
}

/// Immutable record of one applied mutation. The engine only ever appends
/// these; consuming them (undo/redo UI) is the host's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Table version after the mutation.
    pub version: u64,
    pub op: TableOp,
    pub diff: Diff,
}

/// Sparse multi-sheet cell store with versioning and an append-only
/// history log.
pub struct Table {
    sheets: Vec<Sheet>,
    next_sheet_id: u64,
    version: u64,
    history: Vec<HistoryEntry>,
    default_rows: u32,
    default_cols: u32,
}

impl Table {
    /// A table with a single default sheet.
    pub fn new(config: &EngineConfig) -> Self {
        let mut table = Self {
            sheets: Vec::new(),
            next_sheet_id: 1,
            version: 0,
            history: Vec::new(),
            default_rows: config.default_rows,
            default_cols: config.default_cols,
        };
        table.push_sheet("Sheet1");
        table
    }

    fn push_sheet(&mut self, name: &str) -> SheetId {
        let id = SheetId::from_raw(self.next_sheet_id);
        self.next_sheet_id += 1;
        self.sheets
            .push(Sheet::new(id, name, self.default_rows, self.default_cols));
        id
    }

    /// Current version. Every mutation bumps this by exactly one.
    pub fn version(&self) -> u64 {
        self.version
    }

    // -------------------------------------------------------------------------
    // Sheet roster
    // -------------------------------------------------------------------------

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheet_by_id(&self, id: SheetId) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id() == id)
    }

    pub fn sheet_by_id_mut(&mut self, id: SheetId) -> Option<&mut Sheet> {
        self.sheets.iter_mut().find(|s| s.id() == id)
    }

    pub fn sheet_by_name(&self, name: &str) -> Option<&Sheet> {
        self.sheets
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn sheet_id_by_name(&self, name: &str) -> Option<SheetId> {
        self.sheet_by_name(name).map(|s| s.id())
    }

    /// The first sheet's id; a table always has at least one sheet.
    pub fn first_sheet_id(&self) -> SheetId {
        self.sheets[0].id()
    }

    /// Add a sheet. Returns `None` when the name is already taken
    /// (case-insensitive).
    pub fn add_sheet(&mut self, name: &str) -> Option<SheetId> {
        if name.is_empty() || self.sheet_by_name(name).is_some() {
            return None;
        }
        Some(self.push_sheet(name))
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn get(&self, sheet: SheetId, point: Point) -> Option<&Cell> {
        self.sheet_by_id(sheet)?.get(point)
    }

    /// What the grid shows for this cell right now.
    pub fn display(&self, sheet: SheetId, point: Point) -> String {
        self.get(sheet, point).map(|c| c.display()).unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Write raw input into one cell. Always accepted; formulas that fail
    /// to parse are stored poisoned and surface their syntax error on
    /// evaluation.
    pub fn write(&mut self, sheet: SheetId, point: Point, input: &str) -> Diff {
        self.version += 1;
        let entry = self.apply_cell(sheet, point, Some(input));
        let diff = Diff {
            entries: vec![entry],
        };
        debug!("write {} v{}", CellKey::new(sheet, point), self.version);
        self.log(TableOp::Write { sheet, point }, diff.clone());
        diff
    }

    /// Bulk-apply a diff (each entry's `after`). Returns the reverse diff.
    pub fn update(&mut self, diff: &Diff) -> Diff {
        self.version += 1;
        let mut applied = Vec::with_capacity(diff.entries.len());
        for entry in &diff.entries {
            applied.push(self.apply_cell(entry.sheet, entry.point, entry.after.as_deref()));
        }
        let applied = Diff { entries: applied };
        let reverse = applied.reversed();
        self.log(
            TableOp::Update {
                cells: applied.len(),
            },
            applied,
        );
        reverse
    }

    /// Grow a sheet's ever-ensured bounds without materializing cells.
    pub fn ensure_bounds(&mut self, sheet: SheetId, rows: u32, cols: u32) {
        self.version += 1;
        if let Some(s) = self.sheet_by_id_mut(sheet) {
            s.ensure_bounds(rows, cols);
        }
        self.log(
            TableOp::EnsureBounds { sheet, rows, cols },
            Diff::default(),
        );
    }

    /// Insert rows, shifting cells down and rewriting references across all
    /// sheets. `restore` (typically a reversed removal diff) is re-applied
    /// after the shift so external undo can bring removed content back.
    pub fn insert_rows(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        restore: Option<&Diff>,
    ) -> Diff {
        self.version += 1;
        if let Some(s) = self.sheet_by_id_mut(sheet) {
            s.insert_rows(at, count);
        }
        let mut entries = self.rewrite_for_shift(ShiftOp::InsertRows {
            sheet,
            before: at,
            count,
        });
        entries.extend(self.apply_restore(restore));
        let diff = Diff { entries };
        debug!("insert_rows at={} count={} v{}", at, count, self.version);
        self.log(TableOp::InsertRows { sheet, at, count }, diff.clone());
        diff
    }

    /// Remove rows. The returned diff contains the removed cells (at their
    /// old addresses) plus every rewritten formula. `restore` is re-applied
    /// after the shift, mirroring the insert signature for redo flows.
    pub fn remove_rows(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        restore: Option<&Diff>,
    ) -> Diff {
        self.version += 1;
        let removed = match self.sheet_by_id_mut(sheet) {
            Some(s) => s.remove_rows(at, count),
            None => Vec::new(),
        };
        let mut entries: Vec<DiffEntry> = removed
            .into_iter()
            .map(|(point, cell)| DiffEntry {
                sheet,
                point,
                before: Some(cell.raw()),
                after: None,
            })
            .collect();
        entries.extend(self.rewrite_for_shift(ShiftOp::RemoveRows {
            sheet,
            start: at,
            count,
        }));
        entries.extend(self.apply_restore(restore));
        let diff = Diff { entries };
        debug!("remove_rows at={} count={} v{}", at, count, self.version);
        self.log(TableOp::RemoveRows { sheet, at, count }, diff.clone());
        diff
    }

    /// Insert columns; see [`Table::insert_rows`].
    pub fn insert_cols(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        restore: Option<&Diff>,
    ) -> Diff {
        self.version += 1;
        if let Some(s) = self.sheet_by_id_mut(sheet) {
            s.insert_cols(at, count);
        }
        let mut entries = self.rewrite_for_shift(ShiftOp::InsertCols {
            sheet,
            before: at,
            count,
        });
        entries.extend(self.apply_restore(restore));
        let diff = Diff { entries };
        self.log(TableOp::InsertCols { sheet, at, count }, diff.clone());
        diff
    }

    /// Remove columns; see [`Table::remove_rows`].
    pub fn remove_cols(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        restore: Option<&Diff>,
    ) -> Diff {
        self.version += 1;
        let removed = match self.sheet_by_id_mut(sheet) {
            Some(s) => s.remove_cols(at, count),
            None => Vec::new(),
        };
        let mut entries: Vec<DiffEntry> = removed
            .into_iter()
            .map(|(point, cell)| DiffEntry {
                sheet,
                point,
                before: Some(cell.raw()),
                after: None,
            })
            .collect();
        entries.extend(self.rewrite_for_shift(ShiftOp::RemoveCols {
            sheet,
            start: at,
            count,
        }));
        entries.extend(self.apply_restore(restore));
        let diff = Diff { entries };
        self.log(TableOp::RemoveCols { sheet, at, count }, diff.clone());
        diff
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    /// The ordered, append-only log of applied mutations.
    pub fn histories(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Position external undo stacks should treat as current. The engine
    /// itself never rewinds; it only appends.
    pub fn history_index(&self) -> usize {
        self.history.len()
    }

    fn log(&mut self, op: TableOp, diff: Diff) {
        self.history.push(HistoryEntry {
            version: self.version,
            op,
            diff,
        });
    }

    // -------------------------------------------------------------------------
    // Evaluation support (called by the solver)
    // -------------------------------------------------------------------------

    /// Drop a cell's cached evaluation state.
    pub(crate) fn invalidate_cell(&mut self, key: CellKey) {
        if let Some(sheet) = self.sheet_by_id_mut(key.sheet) {
            if let Some(cell) = sheet.get_mut(key.point) {
                cell.invalidate();
            }
        }
    }

    /// Store evaluation results back onto a cell.
    pub(crate) fn set_solved(
        &mut self,
        key: CellKey,
        solved: Option<Value>,
        async_state: Option<AsyncResult>,
    ) {
        if let Some(sheet) = self.sheet_by_id_mut(key.sheet) {
            if let Some(cell) = sheet.get_mut(key.point) {
                cell.solved = solved;
                cell.async_state = async_state;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn apply_cell(&mut self, sheet: SheetId, point: Point, input: Option<&str>) -> DiffEntry {
        let version = self.version;
        let s = match self.sheet_by_id_mut(sheet) {
            Some(s) => s,
            None => {
                return DiffEntry {
                    sheet,
                    point,
                    before: None,
                    after: input.map(str::to_string),
                }
            }
        };
        let before = s.get(point).map(|c| c.raw());
        match input {
            Some(text) => {
                s.set(point, Cell::new(CellContent::from_input(text), version));
            }
            None => {
                s.remove(point);
            }
        }
        DiffEntry {
            sheet,
            point,
            before,
            after: input.map(str::to_string),
        }
    }

    fn apply_restore(&mut self, restore: Option<&Diff>) -> Vec<DiffEntry> {
        let mut entries = Vec::new();
        if let Some(diff) = restore {
            for entry in &diff.entries {
                entries.push(self.apply_cell(entry.sheet, entry.point, entry.after.as_deref()));
            }
        }
        entries
    }

    /// Rewrite every formula in every sheet for a structural edit. Returns
    /// diff entries for the formulas whose source changed.
    fn rewrite_for_shift(&mut self, op: ShiftOp) -> Vec<DiffEntry> {
        let roster: Vec<(String, SheetId)> = self
            .sheets
            .iter()
            .map(|s| (s.name.clone(), s.id()))
            .collect();
        let resolve = |name: &str| {
            roster
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, id)| *id)
        };

        let version = self.version;
        let mut entries = Vec::new();
        for sheet in &mut self.sheets {
            let ctx = sheet.id();
            for (point, cell) in sheet.cells_mut() {
                let change = if let CellContent::Formula { source, entity } = &mut cell.content {
                    if let Some(adjusted) = adjust_entity(entity, &op, ctx, &resolve) {
                        let before = source.clone();
                        *source = format!("={}", adjusted);
                        *entity = adjusted;
                        let after = source.clone();
                        Some((before, after))
                    } else {
                        None
                    }
                } else {
                    None
                };
                if let Some((before, after)) = change {
                    cell.changed_at = version;
                    cell.invalidate();
                    entries.push(DiffEntry {
                        sheet: ctx,
                        point,
                        before: Some(before),
                        after: Some(after),
                    });
                }
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::new(&EngineConfig::default())
    }

    fn write_at(t: &mut Table, addr: &str, input: &str) -> Diff {
        let a = crate::address::parse_address(addr).unwrap();
        let sid = t.first_sheet_id();
        t.write(sid, a.point, input)
    }

    fn raw_at(t: &Table, addr: &str) -> Option<String> {
        let a = crate::address::parse_address(addr).unwrap();
        t.get(t.first_sheet_id(), a.point).map(|c| c.raw())
    }

    #[test]
    fn write_bumps_version_and_appends_history() {
        let mut t = table();
        assert_eq!(t.version(), 0);
        write_at(&mut t, "A1", "42");
        write_at(&mut t, "A2", "hello");
        assert_eq!(t.version(), 2);
        assert_eq!(t.history_index(), 2);
        assert!(matches!(
            t.histories()[0].op,
            TableOp::Write { .. }
        ));
        assert_eq!(t.histories()[0].version, 1);
    }

    #[test]
    fn write_diff_captures_before_and_after() {
        let mut t = table();
        write_at(&mut t, "A1", "1");
        let diff = write_at(&mut t, "A1", "2");
        assert_eq!(diff.entries[0].before.as_deref(), Some("1"));
        assert_eq!(diff.entries[0].after.as_deref(), Some("2"));
    }

    #[test]
    fn update_applies_and_returns_reverse() {
        let mut t = table();
        write_at(&mut t, "A1", "old");
        let sid = t.first_sheet_id();
        let diff = Diff {
            entries: vec![DiffEntry {
                sheet: sid,
                point: Point::new(1, 1),
                before: None,
                after: Some("new".to_string()),
            }],
        };
        let reverse = t.update(&diff);
        assert_eq!(raw_at(&t, "A1").as_deref(), Some("new"));
        t.update(&reverse);
        assert_eq!(raw_at(&t, "A1").as_deref(), Some("old"));
    }

    #[test]
    fn duplicate_sheet_names_rejected() {
        let mut t = table();
        assert!(t.add_sheet("Data").is_some());
        assert!(t.add_sheet("data").is_none());
        assert!(t.add_sheet("Sheet1").is_none());
    }

    #[test]
    fn insert_rows_rewrites_references() {
        let mut t = table();
        write_at(&mut t, "A1", "=A5+1");
        let sid = t.first_sheet_id();
        let diff = t.insert_rows(sid, 3, 2, None);
        assert_eq!(raw_at(&t, "A1").as_deref(), Some("=A7+1"));
        assert_eq!(diff.entries.len(), 1);
        assert_eq!(diff.entries[0].before.as_deref(), Some("=A5+1"));
    }

    #[test]
    fn remove_rows_poisons_dangling_references() {
        let mut t = table();
        write_at(&mut t, "A1", "=A4");
        write_at(&mut t, "A4", "99");
        let sid = t.first_sheet_id();
        let diff = t.remove_rows(sid, 4, 1, None);
        assert_eq!(raw_at(&t, "A1").as_deref(), Some("=#REF!"));
        // The removed cell shows up in the diff with its old content.
        assert!(diff
            .entries
            .iter()
            .any(|e| e.point == Point::new(4, 1) && e.before.as_deref() == Some("99")));
    }

    #[test]
    fn remove_then_insert_with_restore_round_trips() {
        let mut t = table();
        write_at(&mut t, "A3", "keep me");
        let sid = t.first_sheet_id();
        let diff = t.remove_rows(sid, 3, 1, None);
        assert_eq!(raw_at(&t, "A3"), None);
        t.insert_rows(sid, 3, 1, Some(&diff.reversed()));
        assert_eq!(raw_at(&t, "A3").as_deref(), Some("keep me"));
    }

    #[test]
    fn cross_sheet_formulas_are_rewritten_too() {
        let mut t = table();
        let data = t.add_sheet("Data").unwrap();
        write_at(&mut t, "A1", "=Data!B2");
        t.insert_rows(data, 1, 3, None);
        assert_eq!(raw_at(&t, "A1").as_deref(), Some("=Data!B5"));
    }

    #[test]
    fn history_is_append_only_across_ops() {
        let mut t = table();
        write_at(&mut t, "A1", "1");
        let sid = t.first_sheet_id();
        t.insert_rows(sid, 1, 1, None);
        t.remove_rows(sid, 1, 1, None);
        t.ensure_bounds(sid, 5000, 200);
        let versions: Vec<u64> = t.histories().iter().map(|h| h.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }
}
