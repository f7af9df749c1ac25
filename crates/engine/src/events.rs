//! Event types for engine change notifications.
//!
//! The grid installs a sink callback to learn about value changes that
//! happen outside its own synchronous calls - async completions in
//! particular. The collector is used by the test harness to verify what
//! was emitted.

use crate::cell_key::CellKey;

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Cell values changed outside a synchronous mutation call (async
    /// resolution). Tagged with the table version the changes belong to.
    CellsChanged(CellsChangedEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellsChangedEvent {
    /// Table version the changes were computed against.
    pub version: u64,
    /// Cells whose displayed value changed, sorted for determinism.
    pub cells: Vec<CellKey>,
}

/// Callback type for receiving engine events.
pub type EventSink = Box<dyn FnMut(&EngineEvent) + Send>;

/// Simple event collector for testing.
#[derive(Default)]
pub struct EventCollector {
    events: Vec<EngineEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn push(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Filter to only CellsChanged events.
    pub fn cells_changed(&self) -> Vec<&CellsChangedEvent> {
        self.events
            .iter()
            .map(|e| match e {
                EngineEvent::CellsChanged(c) => c,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Point;
    use crate::sheet::SheetId;

    #[test]
    fn collector_accumulates_and_filters() {
        let mut collector = EventCollector::new();
        assert!(collector.is_empty());

        collector.push(EngineEvent::CellsChanged(CellsChangedEvent {
            version: 3,
            cells: vec![CellKey::new(SheetId::from_raw(1), Point::new(1, 1))],
        }));

        assert_eq!(collector.len(), 1);
        assert_eq!(collector.cells_changed()[0].version, 3);

        collector.clear();
        assert!(collector.is_empty());
    }
}
