//! Test harness for engine operations with deterministic async control.
//!
//! This module provides `EngineHarness`, a wrapper around `Engine` that:
//! - Substitutes a hand-driven spawner so deferred computations run only
//!   when the test says so
//! - Collects emitted events for assertions
//! - Registers the async test functions (`SUM_DELAY` and a counted twin)
//!
//! Use this harness to exercise pending propagation, TTL caching and
//! staleness without real threads or timers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::events::{CellsChangedEvent, EngineEvent, EventCollector};
use crate::formula::eval::{ArgValue, FormulaError, Value};
use crate::formula::functions::{AsyncTask, Coerce, FunctionSpec, ParamSpec};
use crate::solver::{Engine, Spawner};

type Job = Box<dyn FnOnce() + Send>;

/// Spawner that queues jobs instead of running them, so tests decide when
/// deferred computations complete.
#[derive(Clone, Default)]
pub struct ManualSpawner {
    queue: Arc<Mutex<VecDeque<Job>>>,
}

impl ManualSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of computations waiting to run.
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Run everything currently queued. Returns how many jobs ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.queue.lock().unwrap().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }
}

impl Spawner for ManualSpawner {
    fn spawn(&self, job: Job) {
        self.queue.lock().unwrap().push_back(job);
    }
}

/// Build the `SUM_DELAY` spec: an asynchronous sum used throughout the
/// async tests. Arguments are taken as-is so bad input fails inside the
/// deferred computation (surfacing `#ASYNC!`), and `hits` (when given)
/// counts actual invocations for cache assertions.
fn sum_delay_spec(name: &str, hits: Option<Arc<AtomicUsize>>) -> FunctionSpec {
    FunctionSpec::asynchronous(
        name,
        1,
        None,
        vec![ParamSpec::strict(Coerce::Any)],
        Duration::from_secs(300),
        move |_, args| {
            let args: Vec<ArgValue> = args.to_vec();
            let hits = hits.clone();
            AsyncTask::new(move || {
                if let Some(hits) = &hits {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
                let mut total = 0.0;
                for v in args.iter().flat_map(|a| a.values()) {
                    match v.to_number() {
                        Ok(n) => total += n,
                        Err(e) => return Err(FormulaError::async_failed(e.message)),
                    }
                }
                Ok(Value::Number(total))
            })
        },
    )
}

/// Test harness wrapping Engine with a manual spawner and event capture.
pub struct EngineHarness {
    pub engine: Engine,
    spawner: ManualSpawner,
    events: Arc<Mutex<EventCollector>>,
}

impl EngineHarness {
    pub fn new() -> Self {
        let mut engine = Engine::new();

        let spawner = ManualSpawner::new();
        engine.set_spawner(Box::new(spawner.clone()));

        let events = Arc::new(Mutex::new(EventCollector::new()));
        let sink = events.clone();
        engine.set_event_sink(move |event| sink.lock().unwrap().push(event.clone()));

        engine.register_function(sum_delay_spec("SUM_DELAY", None));

        Self {
            engine,
            spawner,
            events,
        }
    }

    /// Register a `SUM_DELAY` twin that counts how many times its deferred
    /// computation actually ran.
    pub fn register_counted_delay(&mut self, name: &str) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        self.engine
            .register_function(sum_delay_spec(name, Some(hits.clone())));
        hits
    }

    pub fn set(&mut self, addr: &str, input: &str) {
        self.engine
            .write_at(addr, input)
            .expect("test addresses are well-formed");
    }

    pub fn show(&self, addr: &str) -> String {
        self.engine.display_at(addr)
    }

    pub fn queued(&self) -> usize {
        self.spawner.queued()
    }

    /// Run deferred computations and fold completions in until nothing is
    /// left in flight. Async chains settle in waves, each wave scheduling
    /// the next.
    pub fn settle(&mut self) -> usize {
        let mut accepted = 0;
        for _ in 0..100 {
            let ran = self.spawner.run_all();
            let processed = self.engine.process_completions();
            accepted += processed;
            if ran == 0 && processed == 0 && !self.engine.has_pending() {
                return accepted;
            }
            if ran == 0 && processed == 0 {
                break;
            }
        }
        if self.engine.has_pending() || self.queued() > 0 {
            panic!("async work did not settle");
        }
        accepted
    }

    pub fn cells_changed_events(&self) -> Vec<CellsChangedEvent> {
        self.events
            .lock()
            .unwrap()
            .events()
            .iter()
            .map(|e| match e {
                EngineEvent::CellsChanged(c) => c.clone(),
            })
            .collect()
    }

    pub fn clear_events(&mut self) {
        self.events.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_address;
    use crate::cell_key::CellKey;

    #[test]
    fn sum_delay_chain_is_pending_then_settles() {
        let mut h = EngineHarness::new();
        h.set("A1", "=SUM_DELAY(10,20)");
        h.set("A2", "=SUM_DELAY(A1,100)");
        h.set("A3", "=SUM_DELAY(A2,200)");
        h.set("A4", "=SUM_DELAY(A3,A1)");
        h.set("A5", "=SUM(A1:A4)");

        // Nothing has resolved: every cell displays empty.
        for addr in ["A1", "A2", "A3", "A4", "A5"] {
            assert_eq!(h.show(addr), "", "{} should be pending", addr);
        }

        h.settle();

        assert_eq!(h.show("A1"), "30");
        assert_eq!(h.show("A2"), "130");
        assert_eq!(h.show("A3"), "330");
        assert_eq!(h.show("A4"), "360");
        assert_eq!(h.show("A5"), "850");
    }

    #[test]
    fn async_failure_displays_async_error() {
        let mut h = EngineHarness::new();
        h.set("A1", "=SUM_DELAY(\"nope\")");
        assert_eq!(h.show("A1"), "");
        h.settle();
        assert_eq!(h.show("A1"), "#ASYNC!");
    }

    #[test]
    fn pending_propagates_through_plain_formulas() {
        let mut h = EngineHarness::new();
        h.set("A1", "=SUM_DELAY(1,1)");
        h.set("A2", "=A1*2");
        h.set("A3", "=A2&\"x\"");
        assert_eq!(h.show("A2"), "");
        assert_eq!(h.show("A3"), "");
        h.settle();
        assert_eq!(h.show("A2"), "4");
        assert_eq!(h.show("A3"), "4x");
    }

    #[test]
    fn same_fingerprint_shares_one_inflight_computation() {
        let mut h = EngineHarness::new();
        let hits = h.register_counted_delay("CDELAY");
        h.set("A1", "=CDELAY(7,8)");
        h.set("B1", "=CDELAY(7,8)");
        // One task in flight for both cells.
        assert_eq!(h.queued(), 1);
        h.settle();
        assert_eq!(h.show("A1"), "15");
        assert_eq!(h.show("B1"), "15");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settled_result_is_reused_within_ttl() {
        let mut h = EngineHarness::new();
        let hits = h.register_counted_delay("CDELAY");
        h.set("A1", "=CDELAY(1,2)");
        h.settle();
        assert_eq!(h.show("A1"), "3");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A new formula with the same fingerprint resolves synchronously
        // from cache: no new computation, no pending window.
        h.set("B1", "=CDELAY(1,2)");
        assert_eq!(h.show("B1"), "3");
        assert_eq!(h.queued(), 0);
        h.settle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn upstream_change_invalidates_cache_and_recomputes() {
        let mut h = EngineHarness::new();
        let hits = h.register_counted_delay("CDELAY");
        h.set("A1", "5");
        h.set("B1", "=CDELAY(A1,10)");
        h.settle();
        assert_eq!(h.show("B1"), "15");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        h.set("A1", "6");
        assert_eq!(h.show("B1"), "");
        h.settle();
        assert_eq!(h.show("B1"), "16");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_completion_is_discarded_after_formula_change() {
        let mut h = EngineHarness::new();
        h.set("A1", "=SUM_DELAY(2,3)");
        // Replace the formula while the first computation is still queued.
        h.set("A1", "=SUM_DELAY(10,20)");
        h.settle();
        assert_eq!(h.show("A1"), "30");
    }

    #[test]
    fn completion_events_carry_the_changed_cells() {
        let mut h = EngineHarness::new();
        h.set("A1", "=SUM_DELAY(1,2)");
        h.set("A2", "=A1+1");
        // Synchronous writes do not go through the sink.
        assert!(h.cells_changed_events().is_empty());

        h.settle();

        let events = h.cells_changed_events();
        assert!(!events.is_empty());
        let all_cells: Vec<CellKey> = events.iter().flat_map(|e| e.cells.clone()).collect();
        let sid = h.engine.table().first_sheet_id();
        let a1 = CellKey::new(sid, parse_address("A1").unwrap().point);
        let a2 = CellKey::new(sid, parse_address("A2").unwrap().point);
        assert!(all_cells.contains(&a1));
        assert!(all_cells.contains(&a2));
    }

    #[test]
    fn adhoc_solve_goes_pending_then_reads_from_cache() {
        use crate::address::Point;
        use crate::formula::eval::Outcome;
        use crate::solver::SolveContext;

        let mut h = EngineHarness::new();
        let sid = h.engine.table().first_sheet_id();
        let ctx = SolveContext {
            sheet: sid,
            point: Point::new(1, 1),
        };
        let first = h.engine.solve("=SUM_DELAY(4,5)", ctx);
        assert_eq!(first, Outcome::Pending);
        h.settle();
        let second = h.engine.solve("=SUM_DELAY(4,5)", ctx);
        assert_eq!(second, Outcome::Ready(Value::Number(9.0)));
    }
}
