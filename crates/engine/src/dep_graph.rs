//! Dependency graph for formula cells.
//!
//! Tracks precedents (cells a formula depends on) and dependents (cells
//! that depend on a given cell) so invalidation after a mutation or an
//! async settle can reach everything downstream.
//!
//! # Edge Direction
//!
//! ```text
//! A → B  means  "B depends on A"  (A is a precedent of B)
//! ```
//!
//! This makes "what breaks if I change X?" trivial: follow outgoing edges.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell_key::CellKey;

/// Persistent dependency graph for formula cells.
///
/// Maintains bidirectional adjacency for O(1) lookups:
/// - `preds[B]` = cells that B depends on (precedents)
/// - `succs[A]` = cells that depend on A (dependents)
///
/// # Invariants
///
/// 1. **Bidirectional consistency:** If A ∈ preds[B] then B ∈ succs[A].
/// 2. **No dangling entries:** Empty sets are removed, not stored.
/// 3. **No duplicate edges:** Set semantics enforced by FxHashSet.
/// 4. **Atomic updates:** `replace_edges` is the only mutator that touches
///    both maps.
#[derive(Default, Debug, Clone)]
pub struct DepGraph {
    /// Precedents: for each formula cell B, the cells A it depends on.
    preds: FxHashMap<CellKey, FxHashSet<CellKey>>,
    /// Dependents: for each referenced cell A, the formula cells B that
    /// depend on it.
    succs: FxHashMap<CellKey, FxHashSet<CellKey>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cells this formula cell depends on (incoming edges).
    pub fn precedents(&self, cell: CellKey) -> impl Iterator<Item = CellKey> + '_ {
        self.preds
            .get(&cell)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    /// The cells that depend on this cell (outgoing edges).
    pub fn dependents(&self, cell: CellKey) -> impl Iterator<Item = CellKey> + '_ {
        self.succs
            .get(&cell)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    /// Number of formula cells (cells with precedents) in the graph.
    pub fn formula_cell_count(&self) -> usize {
        self.preds.len()
    }

    /// Replace all edges for a formula cell atomically.
    ///
    /// Pass an empty set to clear all edges for this cell.
    pub fn replace_edges(&mut self, formula_cell: CellKey, new_preds: FxHashSet<CellKey>) {
        if let Some(old_preds) = self.preds.remove(&formula_cell) {
            for pred in old_preds {
                if let Some(deps) = self.succs.get_mut(&pred) {
                    deps.remove(&formula_cell);
                    if deps.is_empty() {
                        self.succs.remove(&pred);
                    }
                }
            }
        }

        if new_preds.is_empty() {
            return;
        }

        for pred in &new_preds {
            self.succs.entry(*pred).or_default().insert(formula_cell);
        }
        self.preds.insert(formula_cell, new_preds);
    }

    /// Clear all edges for a cell (formula removed or cell deleted).
    pub fn clear_cell(&mut self, cell: CellKey) {
        self.replace_edges(cell, FxHashSet::default());
    }

    /// Every cell downstream of the given seeds, transitively. The seeds
    /// themselves are not included unless they are reachable from another
    /// seed.
    pub fn dependents_transitive<I>(&self, seeds: I) -> FxHashSet<CellKey>
    where
        I: IntoIterator<Item = CellKey>,
    {
        let mut out = FxHashSet::default();
        let mut stack: Vec<CellKey> = seeds.into_iter().collect();
        while let Some(cell) = stack.pop() {
            for dep in self.dependents(cell) {
                if out.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        out
    }

    /// Drop every edge. Used before a full rebuild after structural edits.
    pub fn clear(&mut self) {
        self.preds.clear();
        self.succs.clear();
    }
}
