pub mod address;
pub mod cell;
pub mod cell_key;
pub mod config;
pub mod dep_graph;
pub mod events;
pub mod formula;
pub mod sheet;
pub mod solver;
pub mod table;

#[cfg(test)]
pub mod harness;

pub use address::{parse_address, Point};
pub use cell::{Cell, CellContent};
pub use cell_key::CellKey;
pub use config::EngineConfig;
pub use events::{EngineEvent, EventSink};
pub use formula::eval::{ErrorCode, FormulaError, Outcome, Value};
pub use formula::functions::{FunctionSpec, Registry};
pub use sheet::{Sheet, SheetId};
pub use solver::{AsyncResult, Engine, SolveContext, Spawner};
pub use table::{Diff, Table};
