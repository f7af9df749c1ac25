use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::formula::eval::Value;
use crate::formula::parser::{self, Entity, FORMULA_MARKER, LITERAL_MARKER};
use crate::solver::AsyncResult;

/// What a cell holds, as typed by the user. Formulas keep both the source
/// text and the parsed entity; a formula that failed to parse carries a
/// poison entity that evaluates to its syntax error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellContent {
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDate),
    Formula { source: String, entity: Entity },
}

impl Default for CellContent {
    fn default() -> Self {
        CellContent::Empty
    }
}

impl CellContent {
    /// Classify raw input. `=` starts a formula; a leading `'` escapes the
    /// rest as literal text; otherwise numbers, booleans and ISO dates are
    /// detected, and everything else is text.
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();

        if trimmed.is_empty() {
            return CellContent::Empty;
        }

        if trimmed.starts_with(FORMULA_MARKER) {
            let entity = match parser::parse(trimmed) {
                Ok(e) => e,
                Err(err) => Entity::poison(err),
            };
            return CellContent::Formula {
                source: trimmed.to_string(),
                entity,
            };
        }

        if let Some(rest) = trimmed.strip_prefix(LITERAL_MARKER) {
            return CellContent::Text(rest.to_string());
        }

        if let Ok(n) = trimmed.parse::<f64>() {
            if n.is_finite() {
                return CellContent::Number(n);
            }
        }

        let upper = trimmed.to_ascii_uppercase();
        if upper == "TRUE" {
            return CellContent::Bool(true);
        }
        if upper == "FALSE" {
            return CellContent::Bool(false);
        }

        if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return CellContent::Date(d);
        }

        CellContent::Text(trimmed.to_string())
    }

    /// The raw input form that [`CellContent::from_input`] round-trips.
    /// Text that would otherwise be re-detected as something else gets the
    /// literal-escape marker back.
    pub fn raw(&self) -> String {
        match self {
            CellContent::Empty => String::new(),
            CellContent::Number(n) => Value::Number(*n).to_text(),
            CellContent::Text(s) => {
                let needs_escape = s.starts_with(FORMULA_MARKER)
                    || s.starts_with(LITERAL_MARKER)
                    || !matches!(CellContent::from_input(s), CellContent::Text(_));
                if needs_escape {
                    format!("{}{}", LITERAL_MARKER, s)
                } else {
                    s.clone()
                }
            }
            CellContent::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            CellContent::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellContent::Formula { source, .. } => source.clone(),
        }
    }

    pub fn is_formula(&self) -> bool {
        matches!(self, CellContent::Formula { .. })
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            CellContent::Formula { entity, .. } => Some(entity),
            _ => None,
        }
    }

    /// The value of a non-formula cell. Formulas answer `Empty` here; their
    /// value comes from evaluation.
    pub fn literal_value(&self) -> Value {
        match self {
            CellContent::Empty | CellContent::Formula { .. } => Value::Empty,
            CellContent::Number(n) => Value::Number(*n),
            CellContent::Text(s) => Value::Text(s.clone()),
            CellContent::Bool(b) => Value::Bool(*b),
            CellContent::Date(d) => Value::Date(*d),
        }
    }
}

/// One cell: raw content, the cached solved value, the async settle state
/// for cells that depend on deferred computations, and the table version at
/// which the cell last changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell {
    pub content: CellContent,
    /// Cached evaluation result; `None` means not yet evaluated or
    /// invalidated by an upstream change.
    #[serde(skip)]
    pub solved: Option<Value>,
    /// Present when this cell's formula is, or transitively depends on, an
    /// asynchronous function.
    #[serde(skip)]
    pub async_state: Option<AsyncResult>,
    /// Table version stamp of the last mutation that touched this cell.
    pub changed_at: u64,
}

impl Cell {
    pub fn new(content: CellContent, changed_at: u64) -> Self {
        Self {
            content,
            solved: None,
            async_state: None,
            changed_at,
        }
    }

    pub fn raw(&self) -> String {
        self.content.raw()
    }

    /// Drop cached evaluation state. Called when this cell or anything
    /// upstream of it changes.
    pub fn invalidate(&mut self) {
        self.solved = None;
        self.async_state = None;
    }

    /// The value the grid should show for this cell right now. Pending
    /// async cells display as empty until they settle; a formula that
    /// resolves to a blank reference shows `0`, spreadsheet-style.
    pub fn display(&self) -> String {
        if matches!(self.async_state, Some(AsyncResult::Pending)) {
            return String::new();
        }
        match (&self.solved, &self.content) {
            (Some(Value::Empty), CellContent::Formula { .. }) => "0".to_string(),
            (Some(v), _) => v.display(),
            (None, CellContent::Formula { .. }) => String::new(),
            (None, content) => content.literal_value().display(),
        }
    }
}
