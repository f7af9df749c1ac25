//! Reference extraction and rewriting over entity trees.
//!
//! Extraction produces the `CellKey` set a formula depends on, for
//! dependency-graph construction. Rewriting adjusts references when rows or
//! columns are inserted or removed: references at or past the shifted
//! region move with it (absolute and relative alike), and references
//! strictly inside a removed region become `#REF!` poison nodes.

use rustc_hash::FxHashSet;

use crate::address::Point;
use crate::cell_key::CellKey;
use crate::formula::eval::FormulaError;
use crate::formula::parser::Entity;
use crate::sheet::{Bounds, SheetId};

/// A structural edit, scoped to one sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    InsertRows { sheet: SheetId, before: u32, count: u32 },
    RemoveRows { sheet: SheetId, start: u32, count: u32 },
    InsertCols { sheet: SheetId, before: u32, count: u32 },
    RemoveCols { sheet: SheetId, start: u32, count: u32 },
}

impl ShiftOp {
    pub fn sheet(&self) -> SheetId {
        match self {
            ShiftOp::InsertRows { sheet, .. }
            | ShiftOp::RemoveRows { sheet, .. }
            | ShiftOp::InsertCols { sheet, .. }
            | ShiftOp::RemoveCols { sheet, .. } => *sheet,
        }
    }
}

/// Extract all cell references from an entity as deduplicated `CellKey`s.
///
/// Ranges expand to their contained cells, with sentinel axes clamped to
/// the target sheet's ever-ensured bounds. References to unknown sheets are
/// skipped; they evaluate to `#REF!` and have nothing to depend on.
pub fn collect_refs<R, B>(
    entity: &Entity,
    context_sheet: SheetId,
    resolve_sheet: &R,
    bounds_of: &B,
) -> Vec<CellKey>
where
    R: Fn(&str) -> Option<SheetId>,
    B: Fn(SheetId) -> Option<Bounds>,
{
    let mut refs = FxHashSet::default();
    walk_refs(entity, context_sheet, resolve_sheet, bounds_of, &mut refs);
    refs.into_iter().collect()
}

fn walk_refs<R, B>(
    entity: &Entity,
    context_sheet: SheetId,
    resolve_sheet: &R,
    bounds_of: &B,
    refs: &mut FxHashSet<CellKey>,
) where
    R: Fn(&str) -> Option<SheetId>,
    B: Fn(SheetId) -> Option<Bounds>,
{
    match entity {
        Entity::Value(_) => {}
        Entity::Ref { sheet, point, .. } => {
            if let Some(sid) = target_sheet(sheet.as_deref(), context_sheet, resolve_sheet) {
                refs.insert(CellKey::new(sid, *point));
            }
        }
        Entity::Range {
            sheet, start, end, ..
        } => {
            let sid = match target_sheet(sheet.as_deref(), context_sheet, resolve_sheet) {
                Some(s) => s,
                None => return,
            };
            let bounds = match bounds_of(sid) {
                Some(b) => b,
                None => return,
            };
            let (mut r0, mut r1) = (start.row, end.row);
            let (mut c0, mut c1) = (start.col, end.col);
            if r0 == 0 {
                r0 = bounds.top;
                r1 = bounds.bottom;
            }
            if c0 == 0 {
                c0 = bounds.left;
                c1 = bounds.right;
            }
            if r0 > r1 {
                std::mem::swap(&mut r0, &mut r1);
            }
            if c0 > c1 {
                std::mem::swap(&mut c0, &mut c1);
            }
            // Clamp to bounds; out-of-bounds corners fail at evaluation.
            r1 = r1.min(bounds.bottom);
            c1 = c1.min(bounds.right);
            for r in r0..=r1 {
                for c in c0..=c1 {
                    refs.insert(CellKey::new(sid, Point::new(r, c)));
                }
            }
        }
        Entity::Func { args, .. } => {
            for arg in args {
                walk_refs(arg, context_sheet, resolve_sheet, bounds_of, refs);
            }
        }
    }
}

fn target_sheet<R>(
    sheet: Option<&str>,
    context_sheet: SheetId,
    resolve_sheet: &R,
) -> Option<SheetId>
where
    R: Fn(&str) -> Option<SheetId>,
{
    match sheet {
        None => Some(context_sheet),
        Some(name) => resolve_sheet(name),
    }
}

/// Rewrite an entity for a structural edit. Returns `None` when nothing in
/// the tree referenced the shifted region.
pub fn adjust_entity<R>(
    entity: &Entity,
    op: &ShiftOp,
    context_sheet: SheetId,
    resolve_sheet: &R,
) -> Option<Entity>
where
    R: Fn(&str) -> Option<SheetId>,
{
    match entity {
        Entity::Value(_) => None,
        Entity::Ref {
            sheet,
            point,
            abs_col,
            abs_row,
        } => {
            let sid = target_sheet(sheet.as_deref(), context_sheet, resolve_sheet)?;
            if sid != op.sheet() {
                return None;
            }
            match adjust_point(*point, op) {
                Adjusted::Unchanged => None,
                Adjusted::Moved(p) => Some(Entity::Ref {
                    sheet: sheet.clone(),
                    point: p,
                    abs_col: *abs_col,
                    abs_row: *abs_row,
                }),
                Adjusted::Removed => Some(Entity::poison(FormulaError::reference(
                    "referenced cells were removed",
                ))),
            }
        }
        Entity::Range {
            sheet,
            start,
            end,
            start_abs_col,
            start_abs_row,
            end_abs_col,
            end_abs_row,
        } => {
            let sid = target_sheet(sheet.as_deref(), context_sheet, resolve_sheet)?;
            if sid != op.sheet() {
                return None;
            }
            match adjust_span(*start, *end, op) {
                Adjusted::Unchanged => None,
                Adjusted::Moved((s, e)) => Some(Entity::Range {
                    sheet: sheet.clone(),
                    start: s,
                    end: e,
                    start_abs_col: *start_abs_col,
                    start_abs_row: *start_abs_row,
                    end_abs_col: *end_abs_col,
                    end_abs_row: *end_abs_row,
                }),
                Adjusted::Removed => Some(Entity::poison(FormulaError::reference(
                    "referenced range was removed",
                ))),
            }
        }
        Entity::Func { name, args } => {
            let mut changed = false;
            let new_args: Vec<Entity> = args
                .iter()
                .map(|arg| {
                    match adjust_entity(arg, op, context_sheet, resolve_sheet) {
                        Some(adjusted) => {
                            changed = true;
                            adjusted
                        }
                        None => arg.clone(),
                    }
                })
                .collect();
            if changed {
                Some(Entity::Func {
                    name: name.clone(),
                    args: new_args,
                })
            } else {
                None
            }
        }
    }
}

enum Adjusted<T> {
    Unchanged,
    Moved(T),
    Removed,
}

/// Shift one axis coordinate. Sentinel 0 never moves.
fn shift_coord(coord: u32, op: &ShiftOp) -> Adjusted<u32> {
    match *op {
        ShiftOp::InsertRows { before, count, .. } | ShiftOp::InsertCols { before, count, .. } => {
            if coord >= before && coord != 0 {
                Adjusted::Moved(coord + count)
            } else {
                Adjusted::Unchanged
            }
        }
        ShiftOp::RemoveRows { start, count, .. } | ShiftOp::RemoveCols { start, count, .. } => {
            if coord == 0 || coord < start {
                Adjusted::Unchanged
            } else if coord < start + count {
                Adjusted::Removed
            } else {
                Adjusted::Moved(coord - count)
            }
        }
    }
}

fn row_op(op: &ShiftOp) -> bool {
    matches!(op, ShiftOp::InsertRows { .. } | ShiftOp::RemoveRows { .. })
}

fn adjust_point(p: Point, op: &ShiftOp) -> Adjusted<Point> {
    let coord = if row_op(op) { p.row } else { p.col };
    match shift_coord(coord, op) {
        Adjusted::Unchanged => Adjusted::Unchanged,
        Adjusted::Removed => Adjusted::Removed,
        Adjusted::Moved(new) => {
            let moved = if row_op(op) {
                Point::new(new, p.col)
            } else {
                Point::new(p.row, new)
            };
            Adjusted::Moved(moved)
        }
    }
}

/// Adjust a range span along the edit axis. Partially-overlapping removals
/// clip the range; a range entirely inside the removed region is poisoned.
fn adjust_span(start: Point, end: Point, op: &ShiftOp) -> Adjusted<(Point, Point)> {
    let on_rows = row_op(op);
    let (lo, hi) = {
        let (a, b) = if on_rows {
            (start.row, end.row)
        } else {
            (start.col, end.col)
        };
        if a != 0 && b != 0 && a > b {
            (b, a)
        } else {
            (a, b)
        }
    };

    // Sentinel axis: the edit shifts cells within the unbounded span, the
    // reference text itself is unchanged.
    if lo == 0 || hi == 0 {
        return Adjusted::Unchanged;
    }

    let (new_lo, new_hi) = match *op {
        ShiftOp::InsertRows { before, count, .. } | ShiftOp::InsertCols { before, count, .. } => {
            let new_lo = if lo >= before { lo + count } else { lo };
            let new_hi = if hi >= before { hi + count } else { hi };
            (new_lo, new_hi)
        }
        ShiftOp::RemoveRows { start: s, count, .. }
        | ShiftOp::RemoveCols { start: s, count, .. } => {
            let e = s + count;
            if lo >= s && hi < e {
                return Adjusted::Removed;
            }
            let clip = |v: u32| {
                if v >= e {
                    v - count
                } else if v >= s {
                    s
                } else {
                    v
                }
            };
            let new_lo = clip(lo);
            // The high edge clips to the last surviving line above the cut.
            let new_hi = if hi >= e {
                hi - count
            } else if hi >= s {
                s - 1
            } else {
                hi
            };
            (new_lo, new_hi)
        }
    };

    if (new_lo, new_hi) == (lo, hi) {
        return Adjusted::Unchanged;
    }

    let rebuild = |v: u32, p: Point| {
        if on_rows {
            Point::new(v, p.col)
        } else {
            Point::new(p.row, v)
        }
    };
    Adjusted::Moved((rebuild(new_lo, start), rebuild(new_hi, end)))
}
