//! The solving engine: orchestrates the table store, dependency graph,
//! function registry and the async/cache layer.
//!
//! Evaluation is cooperative and never blocks. When a formula reaches an
//! asynchronous function with no valid cache entry, it records a `Pending`
//! entry, hands the deferred computation to the spawner, and returns
//! `Pending` for the cell (and transitively for its dependents). The
//! computation runs off the evaluation path and reports back over an mpsc
//! channel; `process_completions` folds finished results in, re-solves the
//! affected cells, and notifies the change sink.

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use crate::address::{parse_address, AddressError, Point};
use crate::cell_key::CellKey;
use crate::config::EngineConfig;
use crate::dep_graph::DepGraph;
use crate::events::{CellsChangedEvent, EngineEvent, EventSink};
use crate::formula::eval::{ArgValue, EvalNote, Evaluator, FormulaError, Outcome, Value};
use crate::formula::functions::{AsyncTask, FunctionSpec, Registry};
use crate::formula::parser;
use crate::formula::refs::collect_refs;
use crate::sheet::SheetId;
use crate::table::{Diff, Table};

/// Settle state of a deferred computation, carried by every cell whose
/// formula is (or transitively depends on) an asynchronous function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AsyncResult {
    Settled(Value),
    Pending,
    Failed(FormulaError),
}

/// Stable cache key over a function name and its resolved argument values.
pub fn fingerprint(name: &str, args: &[ArgValue]) -> String {
    serde_json::to_string(&(name, args)).unwrap_or_else(|_| format!("{}:{:?}", name, args))
}

struct CacheEntry {
    result: AsyncResult,
    /// Expiry for settled results. `None` while pending, and for zero-TTL
    /// results, which stay alive only until `purge_consumed` runs after
    /// their waiters have re-solved.
    expires_at: Option<Instant>,
    ttl: Duration,
}

/// Fingerprint-keyed cache of deferred computation results, plus the cells
/// waiting on each fingerprint and the tasks scheduled this pass.
#[derive(Default)]
pub struct AsyncCache {
    entries: FxHashMap<String, CacheEntry>,
    waiters: FxHashMap<String, FxHashSet<CellKey>>,
    scheduled: Vec<(String, AsyncTask)>,
}

impl AsyncCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live, unexpired result for this fingerprint, if any. Expired
    /// entries are dropped on the way through.
    pub(crate) fn lookup(&mut self, fp: &str) -> Option<AsyncResult> {
        let entry = self.entries.get(fp)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() >= expires_at {
                self.entries.remove(fp);
                self.waiters.remove(fp);
                return None;
            }
        }
        Some(self.entries[fp].result.clone())
    }

    /// Register a cell as waiting on a fingerprint's resolution.
    pub(crate) fn add_waiter(&mut self, fp: &str, cell: CellKey) {
        self.waiters.entry(fp.to_string()).or_default().insert(cell);
    }

    /// Record a pending entry and queue the computation. At most one task
    /// is ever in flight per fingerprint: callers must check `lookup`
    /// first.
    pub(crate) fn schedule(&mut self, fp: String, task: AsyncTask, ttl: Duration) {
        self.entries.insert(
            fp.clone(),
            CacheEntry {
                result: AsyncResult::Pending,
                expires_at: None,
                ttl,
            },
        );
        self.scheduled.push((fp, task));
    }

    pub(crate) fn take_scheduled(&mut self) -> Vec<(String, AsyncTask)> {
        std::mem::take(&mut self.scheduled)
    }

    /// Fold a finished computation in. Returns the waiters to re-solve, or
    /// `None` when the completion is stale (no pending entry anymore).
    fn settle(&mut self, fp: &str, result: AsyncResult) -> Option<Vec<CellKey>> {
        let entry = self.entries.get_mut(fp)?;
        if entry.result != AsyncResult::Pending {
            return None;
        }
        entry.result = result;
        entry.expires_at = if entry.ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + entry.ttl)
        };
        Some(
            self.waiters
                .remove(fp)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default(),
        )
    }

    /// Forget a cell's interest in any pending fingerprint. Called when the
    /// cell is invalidated; if it re-solves to the same fingerprint it will
    /// re-register, and if not, the late completion finds no waiter.
    fn remove_waiter(&mut self, cell: CellKey) {
        self.waiters.retain(|_, set| {
            set.remove(&cell);
            !set.is_empty()
        });
    }

    /// Drop settled zero-TTL entries. Runs after a completion wave so the
    /// default no-reuse policy still lets the triggering waiters read the
    /// value exactly once.
    fn purge_consumed(&mut self) {
        self.entries
            .retain(|_, e| e.ttl > Duration::ZERO || e.result == AsyncResult::Pending);
    }

    /// Number of computations currently in flight.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.result == AsyncResult::Pending)
            .count()
    }
}

/// Where deferred computations run. The default spawns a thread per task;
/// tests substitute a queue they drain by hand.
pub trait Spawner: Send {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>);
}

/// Default spawner: one OS thread per deferred computation.
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(job);
    }
}

/// A finished deferred computation, delivered over the channel.
struct Completion {
    fingerprint: String,
    result: Result<Value, FormulaError>,
}

/// Origin context for an ad-hoc `solve` call.
#[derive(Clone, Copy, Debug)]
pub struct SolveContext {
    pub sheet: SheetId,
    pub point: Point,
}

/// The engine: a table store plus everything needed to keep computed
/// values consistent as the data changes.
pub struct Engine {
    table: Table,
    registry: Registry,
    graph: DepGraph,
    cache: AsyncCache,
    config: EngineConfig,
    spawner: Box<dyn Spawner>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    sink: Option<EventSink>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let (tx, rx) = channel();
        Self {
            table: Table::new(&config),
            registry: Registry::with_builtins(),
            graph: DepGraph::new(),
            cache: AsyncCache::new(),
            config,
            spawner: Box::new(ThreadSpawner),
            tx,
            rx,
            sink: None,
        }
    }

    /// Replace the spawner (tests use a hand-driven queue).
    pub fn set_spawner(&mut self, spawner: Box<dyn Spawner>) {
        self.spawner = spawner;
    }

    /// Install the change-notification sink the grid listens on.
    pub fn set_event_sink(&mut self, sink: impl FnMut(&EngineEvent) + Send + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Register a function (user-supplied or replacement built-in).
    pub fn register_function(&mut self, spec: FunctionSpec) {
        self.registry.register(spec);
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn graph(&self) -> &DepGraph {
        &self.graph
    }

    /// True while any deferred computation is in flight.
    pub fn has_pending(&self) -> bool {
        self.cache.pending_count() > 0
    }

    // -------------------------------------------------------------------------
    // Mutation API (the grid's write surface)
    // -------------------------------------------------------------------------

    pub fn write(&mut self, sheet: SheetId, point: Point, input: &str) -> Diff {
        let bounds_before = self.bounds_snapshot();
        let diff = self.table.write(sheet, point, input);
        // A write past the current bounds grows them, which widens what
        // full-column/full-row ranges cover everywhere.
        if self.bounds_snapshot() != bounds_before {
            self.rebuild_and_resolve();
            return diff;
        }
        let key = CellKey::new(sheet, point);
        self.refresh_deps(key);
        let dirty = self.invalidate([key]);
        self.solve_keys(&dirty);
        self.spawn_scheduled();
        diff
    }

    /// Write via a textual address on the first sheet (or the sheet the
    /// address names).
    pub fn write_at(&mut self, addr: &str, input: &str) -> Result<Diff, AddressError> {
        let parsed = parse_address(addr)?;
        let sheet = match &parsed.sheet {
            Some(name) => self
                .table
                .sheet_id_by_name(name)
                .unwrap_or_else(|| self.table.first_sheet_id()),
            None => self.table.first_sheet_id(),
        };
        Ok(self.write(sheet, parsed.point, input))
    }

    pub fn update(&mut self, diff: &Diff) -> Diff {
        let bounds_before = self.bounds_snapshot();
        let reverse = self.table.update(diff);
        if self.bounds_snapshot() != bounds_before {
            self.rebuild_and_resolve();
            return reverse;
        }
        for key in diff.keys() {
            self.refresh_deps(key);
        }
        let dirty = self.invalidate(diff.keys());
        self.solve_keys(&dirty);
        self.spawn_scheduled();
        reverse
    }

    pub fn insert_rows(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        restore: Option<&Diff>,
    ) -> Diff {
        let diff = self.table.insert_rows(sheet, at, count, restore);
        self.rebuild_and_resolve();
        diff
    }

    pub fn remove_rows(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        restore: Option<&Diff>,
    ) -> Diff {
        let diff = self.table.remove_rows(sheet, at, count, restore);
        self.rebuild_and_resolve();
        diff
    }

    pub fn insert_cols(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        restore: Option<&Diff>,
    ) -> Diff {
        let diff = self.table.insert_cols(sheet, at, count, restore);
        self.rebuild_and_resolve();
        diff
    }

    pub fn remove_cols(
        &mut self,
        sheet: SheetId,
        at: u32,
        count: u32,
        restore: Option<&Diff>,
    ) -> Diff {
        let diff = self.table.remove_cols(sheet, at, count, restore);
        self.rebuild_and_resolve();
        diff
    }

    /// Grow bounds. Re-solves formulas because range clamping and bounds
    /// checks depend on them.
    pub fn ensure_bounds(&mut self, sheet: SheetId, rows: u32, cols: u32) {
        self.table.ensure_bounds(sheet, rows, cols);
        self.rebuild_and_resolve();
    }

    /// Add a sheet. Existing `#REF!`s that name it become resolvable, so
    /// everything re-solves.
    pub fn add_sheet(&mut self, name: &str) -> Option<SheetId> {
        let id = self.table.add_sheet(name)?;
        self.rebuild_and_resolve();
        Some(id)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn display(&self, sheet: SheetId, point: Point) -> String {
        self.table.display(sheet, point)
    }

    /// Display via a textual address, for hosts and tests.
    pub fn display_at(&self, addr: &str) -> String {
        match parse_address(addr) {
            Ok(parsed) => {
                let sheet = match &parsed.sheet {
                    Some(name) => match self.table.sheet_id_by_name(name) {
                        Some(id) => id,
                        None => return String::new(),
                    },
                    None => self.table.first_sheet_id(),
                };
                self.display(sheet, parsed.point)
            }
            Err(_) => String::new(),
        }
    }

    /// The current computed value of a cell (solved result, or the literal
    /// for plain cells).
    pub fn value(&self, sheet: SheetId, point: Point) -> Value {
        match self.table.get(sheet, point) {
            None => Value::Empty,
            Some(cell) => cell
                .solved
                .clone()
                .unwrap_or_else(|| cell.content.literal_value()),
        }
    }

    // -------------------------------------------------------------------------
    // Solving
    // -------------------------------------------------------------------------

    /// Evaluate a formula string at the given origin without storing it.
    /// Asynchronous calls schedule as usual; re-solve after completions to
    /// pick up their settled values.
    pub fn solve(&mut self, formula: &str, ctx: SolveContext) -> Outcome {
        let entity = match parser::parse(formula) {
            Ok(e) => e,
            Err(err) => return Outcome::Ready(Value::Error(err)),
        };
        let origin = CellKey::new(ctx.sheet, ctx.point);
        let (note, notes) = {
            let mut ev = Evaluator::new(&self.table, &self.registry, &mut self.cache, &self.config);
            let note = ev.eval_formula(&entity, origin);
            (note, ev.into_notes())
        };
        self.write_back(notes);
        self.spawn_scheduled();
        note.outcome
    }

    /// Drain finished deferred computations: discard stale ones, cache the
    /// rest, re-solve every affected cell, and notify the sink. Returns the
    /// number of completions accepted.
    pub fn process_completions(&mut self) -> usize {
        let mut processed = 0;
        let mut changed: FxHashSet<CellKey> = FxHashSet::default();

        while let Ok(completion) = self.rx.try_recv() {
            let result = match completion.result {
                Ok(v) => AsyncResult::Settled(v),
                Err(e) => AsyncResult::Failed(e),
            };
            match self.cache.settle(&completion.fingerprint, result) {
                None => {
                    debug!(
                        "discarding stale completion for {}",
                        completion.fingerprint
                    );
                }
                Some(waiters) => {
                    processed += 1;
                    let dirty = self.invalidate(waiters);
                    changed.extend(self.solve_keys(&dirty));
                }
            }
        }

        // Re-solving may have scheduled follow-up computations (chains of
        // async dependencies settle in waves).
        self.spawn_scheduled();
        self.cache.purge_consumed();

        if !changed.is_empty() {
            let mut cells: Vec<CellKey> = changed.into_iter().collect();
            cells.sort_by_key(|k| (k.sheet.raw(), k.point.row, k.point.col));
            let event = EngineEvent::CellsChanged(CellsChangedEvent {
                version: self.table.version(),
                cells,
            });
            if let Some(sink) = &mut self.sink {
                sink(&event);
            }
        }
        processed
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn bounds_snapshot(&self) -> Vec<(SheetId, crate::sheet::Bounds)> {
        self.table
            .sheets()
            .iter()
            .map(|s| (s.id(), s.bounds()))
            .collect()
    }

    fn refresh_deps(&mut self, key: CellKey) {
        let preds: FxHashSet<CellKey> = match self
            .table
            .get(key.sheet, key.point)
            .and_then(|c| c.content.entity())
        {
            Some(entity) => {
                let table = &self.table;
                collect_refs(
                    entity,
                    key.sheet,
                    &|name| table.sheet_id_by_name(name),
                    &|sid| table.sheet_by_id(sid).map(|s| s.bounds()),
                )
                .into_iter()
                .collect()
            }
            None => FxHashSet::default(),
        };
        self.graph.replace_edges(key, preds);
    }

    /// Clear cached state for the seeds and everything downstream of them.
    fn invalidate<I>(&mut self, seeds: I) -> FxHashSet<CellKey>
    where
        I: IntoIterator<Item = CellKey>,
    {
        let seeds: Vec<CellKey> = seeds.into_iter().collect();
        let mut all = self.graph.dependents_transitive(seeds.iter().copied());
        all.extend(seeds);
        for key in &all {
            self.table.invalidate_cell(*key);
            self.cache.remove_waiter(*key);
        }
        all
    }

    /// Evaluate the given cells and write results back. Returns the cells
    /// that now hold a fresh state.
    fn solve_keys(&mut self, keys: &FxHashSet<CellKey>) -> Vec<CellKey> {
        let notes = {
            let mut ev = Evaluator::new(&self.table, &self.registry, &mut self.cache, &self.config);
            for key in keys {
                ev.eval_cell(*key);
            }
            ev.into_notes()
        };
        self.write_back(notes)
    }

    fn write_back(&mut self, notes: FxHashMap<CellKey, EvalNote>) -> Vec<CellKey> {
        let mut changed = Vec::with_capacity(notes.len());
        for (key, note) in notes {
            let (solved, async_state) = match note.outcome {
                Outcome::Pending => (None, Some(AsyncResult::Pending)),
                Outcome::Ready(v) => {
                    let async_state = if note.used_async {
                        Some(match &v {
                            Value::Error(e) if e.code == crate::formula::eval::ErrorCode::Async => {
                                AsyncResult::Failed(e.clone())
                            }
                            _ => AsyncResult::Settled(v.clone()),
                        })
                    } else {
                        None
                    };
                    (Some(v), async_state)
                }
            };
            self.table.set_solved(key, solved, async_state);
            changed.push(key);
        }
        changed
    }

    fn spawn_scheduled(&mut self) {
        for (fp, task) in self.cache.take_scheduled() {
            let tx = self.tx.clone();
            debug!("spawning deferred computation for {}", fp);
            self.spawner.spawn(Box::new(move || {
                let result = task.run();
                let _ = tx.send(Completion {
                    fingerprint: fp,
                    result,
                });
            }));
        }
    }

    /// Full dependency rebuild after structural edits: edges, cached
    /// values, and bounds-sensitive range expansions all shift together.
    fn rebuild_and_resolve(&mut self) {
        self.graph.clear();
        let mut formula_keys = Vec::new();
        for sheet in self.table.sheets() {
            for (point, cell) in sheet.cells() {
                if cell.content.is_formula() {
                    formula_keys.push(CellKey::new(sheet.id(), point));
                }
            }
        }
        for key in &formula_keys {
            self.refresh_deps(*key);
        }
        let dirty: FxHashSet<CellKey> = formula_keys.into_iter().collect();
        for key in &dirty {
            self.table.invalidate_cell(*key);
            self.cache.remove_waiter(*key);
        }
        self.solve_keys(&dirty);
        self.spawn_scheduled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::eval::ErrorCode;

    fn engine() -> Engine {
        Engine::new()
    }

    fn show(e: &Engine, addr: &str) -> String {
        e.display_at(addr)
    }

    #[test]
    fn literal_and_formula_basics() {
        let mut e = engine();
        e.write_at("A1", "2").unwrap();
        e.write_at("A2", "3").unwrap();
        e.write_at("A3", "=A1+A2*10").unwrap();
        assert_eq!(show(&e, "A3"), "32");
    }

    #[test]
    fn edits_propagate_to_dependents() {
        let mut e = engine();
        e.write_at("A1", "1").unwrap();
        e.write_at("A2", "=A1+1").unwrap();
        e.write_at("A3", "=A2+1").unwrap();
        assert_eq!(show(&e, "A3"), "3");
        e.write_at("A1", "10").unwrap();
        assert_eq!(show(&e, "A2"), "11");
        assert_eq!(show(&e, "A3"), "12");
    }

    #[test]
    fn self_reference_settles_to_ref_error() {
        let mut e = engine();
        e.write_at("D2", "=D2").unwrap();
        assert_eq!(show(&e, "D2"), "#REF!");
    }

    #[test]
    fn transitive_cycle_settles_to_ref_error() {
        let mut e = engine();
        e.write_at("A1", "=A2").unwrap();
        e.write_at("A2", "=A3").unwrap();
        e.write_at("A3", "=A1").unwrap();
        assert_eq!(show(&e, "A1"), "#REF!");
        // Breaking the cycle recovers all three.
        e.write_at("A3", "5").unwrap();
        assert_eq!(show(&e, "A1"), "5");
        assert_eq!(show(&e, "A2"), "5");
    }

    #[test]
    fn sum_skips_non_numeric_cells_and_takes_scalars() {
        let mut e = engine();
        e.write_at("B50", "25").unwrap();
        e.write_at("B51", "label").unwrap();
        e.write_at("C1", "=SUM(B50:B51,5,-3)").unwrap();
        assert_eq!(show(&e, "C1"), "27");
    }

    #[test]
    fn range_with_error_cell_propagates() {
        let mut e = engine();
        e.write_at("B1", "=1/0").unwrap();
        e.write_at("B2", "2").unwrap();
        e.write_at("C1", "=SUM(B1:B2)").unwrap();
        assert_eq!(show(&e, "C1"), "#DIV/0!");
    }

    #[test]
    fn unknown_function_is_name_error() {
        let mut e = engine();
        e.write_at("A1", "=NO_SUCH_FUNC(1)").unwrap();
        assert_eq!(show(&e, "A1"), "#NAME?");
    }

    #[test]
    fn parse_failure_displays_error_class() {
        let mut e = engine();
        e.write_at("A1", "=1+").unwrap();
        assert_eq!(show(&e, "A1"), "#ERROR!");
    }

    #[test]
    fn cross_sheet_references() {
        let mut e = engine();
        let data = e.add_sheet("Data").unwrap();
        e.write(data, Point::new(1, 1), "7");
        e.write_at("A1", "=Data!A1*2").unwrap();
        assert_eq!(show(&e, "A1"), "14");
        // Editing the other sheet re-solves the dependent.
        e.write(data, Point::new(1, 1), "8");
        assert_eq!(show(&e, "A1"), "16");
    }

    #[test]
    fn missing_sheet_is_ref_error_until_it_exists() {
        let mut e = engine();
        e.write_at("A1", "=Later!A1+1").unwrap();
        assert_eq!(show(&e, "A1"), "#REF!");
        let later = e.add_sheet("Later").unwrap();
        assert_eq!(show(&e, "A1"), "1");
        e.write(later, Point::new(1, 1), "41");
        assert_eq!(show(&e, "A1"), "42");
    }

    #[test]
    fn out_of_bounds_reference_is_ref_error() {
        let mut e = engine();
        e.write_at("A1", "=ZZ9999").unwrap();
        assert_eq!(show(&e, "A1"), "#REF!");
        // Growing the bounds makes the same reference legal (and empty).
        let sid = e.table().first_sheet_id();
        e.ensure_bounds(sid, 10000, 800);
        assert_eq!(show(&e, "A1"), "0");
    }

    #[test]
    fn iferror_swallows_all_but_name_errors() {
        let mut e = engine();
        e.write_at("A1", "=1/0").unwrap();
        e.write_at("B1", "=IFERROR(A1,\"fallback\")").unwrap();
        assert_eq!(show(&e, "B1"), "fallback");

        e.write_at("A2", "42").unwrap();
        e.write_at("B2", "=IFERROR(A2,\"fallback\")").unwrap();
        assert_eq!(show(&e, "B2"), "42");

        e.write_at("A3", "=TYPO_FN()").unwrap();
        e.write_at("B3", "=IFERROR(A3,\"fallback\")").unwrap();
        assert_eq!(show(&e, "B3"), "#NAME?");
    }

    #[test]
    fn if_does_not_evaluate_the_untaken_branch() {
        let mut e = engine();
        e.write_at("B1", "0").unwrap();
        e.write_at("A1", "=IF(B1=0,\"n/a\",1/B1)").unwrap();
        assert_eq!(show(&e, "A1"), "n/a");
    }

    #[test]
    fn row_and_column_use_origin_or_reference() {
        let mut e = engine();
        e.write_at("C7", "=ROW()").unwrap();
        e.write_at("C8", "=COLUMN()").unwrap();
        e.write_at("C9", "=ROW(B2)").unwrap();
        assert_eq!(show(&e, "C7"), "7");
        assert_eq!(show(&e, "C8"), "3");
        assert_eq!(show(&e, "C9"), "2");
    }

    #[test]
    fn structural_edit_keeps_results_consistent() {
        let mut e = engine();
        e.write_at("A1", "10").unwrap();
        e.write_at("A2", "20").unwrap();
        e.write_at("B1", "=SUM(A1:A2)").unwrap();
        assert_eq!(show(&e, "B1"), "30");

        let sid = e.table().first_sheet_id();
        e.insert_rows(sid, 2, 1, None);
        // The sum now spans A1:A3 with an empty row in the middle.
        assert_eq!(show(&e, "B1"), "30");
        e.write_at("A2", "5").unwrap();
        assert_eq!(show(&e, "B1"), "35");
    }

    #[test]
    fn removing_a_referenced_row_poisons_dependents() {
        let mut e = engine();
        e.write_at("A5", "9").unwrap();
        e.write_at("B1", "=A5*2").unwrap();
        let sid = e.table().first_sheet_id();
        e.remove_rows(sid, 5, 1, None);
        assert_eq!(show(&e, "B1"), "#REF!");
    }

    #[test]
    fn adhoc_solve_reads_but_never_writes() {
        let mut e = engine();
        e.write_at("A1", "6").unwrap();
        let sid = e.table().first_sheet_id();
        let out = e.solve(
            "=A1*7",
            SolveContext {
                sheet: sid,
                point: Point::new(1, 2),
            },
        );
        assert_eq!(out, Outcome::Ready(Value::Number(42.0)));
        assert_eq!(e.table().history_index(), 1);
        assert!(e.table().get(sid, Point::new(1, 2)).is_none());
    }

    #[test]
    fn adhoc_solve_surfaces_parse_errors_as_values() {
        let mut e = engine();
        let sid = e.table().first_sheet_id();
        let out = e.solve(
            "=1+",
            SolveContext {
                sheet: sid,
                point: Point::new(1, 1),
            },
        );
        match out {
            Outcome::Ready(Value::Error(err)) => assert_eq!(err.code, ErrorCode::Syntax),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn operator_chain_precedence_end_to_end() {
        let mut e = engine();
        e.write_at("A1", "=2+3*4^2").unwrap();
        e.write_at("A2", "=(2+3)*4").unwrap();
        e.write_at("A3", "=\"a\"&1+1").unwrap();
        e.write_at("A4", "=2<3").unwrap();
        assert_eq!(show(&e, "A1"), "50");
        assert_eq!(show(&e, "A2"), "20");
        assert_eq!(show(&e, "A3"), "a2");
        assert_eq!(show(&e, "A4"), "TRUE");
    }

    #[test]
    fn literal_escape_marker_displays_verbatim() {
        let mut e = engine();
        e.write_at("A1", "'=1+2").unwrap();
        assert_eq!(show(&e, "A1"), "=1+2");
    }

    #[test]
    fn writes_past_bounds_widen_full_column_ranges() {
        let mut e = engine();
        e.write_at("B1", "=SUM(A:A)").unwrap();
        e.write_at("A1", "1").unwrap();
        assert_eq!(show(&e, "B1"), "1");
        // A write beyond the ensured bounds grows them; the full-column
        // sum must pick the new cell up.
        e.write_at("A2000", "5").unwrap();
        assert_eq!(show(&e, "B1"), "6");
    }

    #[test]
    fn long_dependency_chains_resolve() {
        let mut e = engine();
        e.write_at("A1", "1").unwrap();
        for i in 2..=40u32 {
            e.write_at(&format!("A{}", i), &format!("=A{}+1", i - 1))
                .unwrap();
        }
        assert_eq!(show(&e, "A40"), "40");
        e.write_at("A1", "101").unwrap();
        assert_eq!(show(&e, "A40"), "140");
    }
}
