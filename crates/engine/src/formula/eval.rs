// Formula evaluator - walks entity trees against the table store.
//
// Errors are values here: once a formula is being evaluated, everything that
// can go wrong becomes a `Value::Error` that propagates like any other
// computed value. The only non-value outcome is `Pending`, which means a
// deferred computation somewhere in the dependency chain has not settled.

use chrono::NaiveDate;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Point;
use crate::cell_key::CellKey;
use crate::config::EngineConfig;
use crate::formula::functions::{Handler, Registry, SpecialForm};
use crate::formula::parser::{operator_precedence, Entity};
use crate::sheet::SheetId;
use crate::solver::{fingerprint, AsyncCache, AsyncResult};
use crate::table::Table;

// =============================================================================
// Error codes
// =============================================================================

/// Closed set of formula error classes. The display strings are part of the
/// grid contract and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Out-of-bounds or dangling reference, missing sheet, circular
    /// dependency.
    Ref,
    /// Unknown function or unresolvable name.
    Name,
    /// Argument present but not coercible to the required type.
    Value,
    /// Division or modulo by zero.
    Div0,
    /// Lookup found no match.
    Na,
    /// A deferred computation failed.
    Async,
    /// Malformed formula text.
    Syntax,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ref => "#REF!",
            ErrorCode::Name => "#NAME?",
            ErrorCode::Value => "#VALUE!",
            ErrorCode::Div0 => "#DIV/0!",
            ErrorCode::Na => "#N/A",
            ErrorCode::Async => "#ASYNC!",
            ErrorCode::Syntax => "#ERROR!",
        }
    }

    /// Inverse of [`ErrorCode::as_str`], used by the tokenizer for error
    /// literals in formula text.
    pub fn from_display(s: &str) -> Option<ErrorCode> {
        match s {
            "#REF!" => Some(ErrorCode::Ref),
            "#NAME?" => Some(ErrorCode::Name),
            "#VALUE!" => Some(ErrorCode::Value),
            "#DIV/0!" => Some(ErrorCode::Div0),
            "#N/A" => Some(ErrorCode::Na),
            "#ASYNC!" => Some(ErrorCode::Async),
            "#ERROR!" => Some(ErrorCode::Syntax),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A formula error value: a code plus a human-readable message. The grid
/// displays the code; the message is for logs and inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormulaError {
    pub code: ErrorCode,
    pub message: String,
}

impl FormulaError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn reference(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Ref, message)
    }

    pub fn circular() -> Self {
        Self::new(ErrorCode::Ref, "circular reference")
    }

    pub fn unknown_name(name: &str) -> Self {
        Self::new(ErrorCode::Name, format!("unknown function '{}'", name))
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Value, message)
    }

    pub fn div0() -> Self {
        Self::new(ErrorCode::Div0, "division by zero")
    }

    pub fn na(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Na, message)
    }

    pub fn async_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Async, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Syntax, message)
    }
}

impl fmt::Display for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code.as_str())
    }
}

// =============================================================================
// Value: the scalar primitive for all cell values
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDate),
    Error(FormulaError),
}

impl Default for Value {
    fn default() -> Self {
        Value::Empty
    }
}

/// Date serial epoch. Serial 1 is 1899-12-31, matching the usual
/// spreadsheet convention.
pub(crate) fn date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).expect("valid epoch date")
}

pub(crate) fn date_to_serial(d: NaiveDate) -> f64 {
    (d - date_epoch()).num_days() as f64
}

pub(crate) fn serial_to_date(n: f64) -> Option<NaiveDate> {
    date_epoch().checked_add_signed(chrono::Duration::days(n as i64))
}

/// Wrap an f64 result, turning NaN/infinity into a value error rather than
/// letting them leak into the grid.
pub fn number_or_error(n: f64) -> Value {
    if n.is_finite() {
        Value::Number(n)
    } else {
        Value::Error(FormulaError::value("result is not a finite number"))
    }
}

impl Value {
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn to_number(&self) -> Result<f64, FormulaError> {
        match self {
            Value::Empty => Ok(0.0),
            Value::Number(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Date(d) => Ok(date_to_serial(*d)),
            Value::Text(s) if s.trim().is_empty() => Ok(0.0),
            Value::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                FormulaError::value(format!("cannot convert '{}' to a number", s))
            }),
            Value::Error(e) => Err(e.clone()),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Value::Empty => String::new(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Text(s) => s.clone(),
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Error(e) => e.code.as_str().to_string(),
        }
    }

    pub fn to_bool(&self) -> Result<bool, FormulaError> {
        match self {
            Value::Empty => Ok(false),
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Text(s) => {
                let upper = s.to_ascii_uppercase();
                if upper == "TRUE" {
                    Ok(true)
                } else if upper == "FALSE" {
                    Ok(false)
                } else {
                    Err(FormulaError::value(format!(
                        "cannot convert '{}' to a boolean",
                        s
                    )))
                }
            }
            Value::Date(_) => Err(FormulaError::value("cannot convert a date to a boolean")),
            Value::Error(e) => Err(e.clone()),
        }
    }

    pub fn to_date(&self) -> Result<NaiveDate, FormulaError> {
        match self {
            Value::Date(d) => Ok(*d),
            Value::Number(n) => serial_to_date(*n)
                .ok_or_else(|| FormulaError::value("serial out of date range")),
            Value::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|_| FormulaError::value(format!("cannot convert '{}' to a date", s))),
            Value::Error(e) => Err(e.clone()),
            _ => Err(FormulaError::value("cannot convert to a date")),
        }
    }

    /// Render for the grid. Errors show their display code; everything else
    /// its natural text form.
    pub fn display(&self) -> String {
        self.to_text()
    }
}

// =============================================================================
// Evaluation outcomes and resolved arguments
// =============================================================================

/// Result of evaluating an entity: a value (possibly an error value), or
/// `Pending` when a deferred computation in the chain has not settled.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Ready(Value),
    Pending,
}

impl Outcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    /// The value, with `Pending` rendered as an empty display.
    pub fn display(&self) -> String {
        match self {
            Outcome::Ready(v) => v.display(),
            Outcome::Pending => String::new(),
        }
    }
}

/// A resolved range, row-major. Functions that accept multiple values see
/// ranges in this form; scalar contexts collapse to the top-left cell.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RangeValues {
    pub rows: Vec<Vec<Value>>,
}

impl RangeValues {
    pub fn width(&self) -> usize {
        self.rows.first().map_or(0, |r| r.len())
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn first_error(&self) -> Option<&FormulaError> {
        self.rows.iter().flatten().find_map(|v| match v {
            Value::Error(e) => Some(e),
            _ => None,
        })
    }

    /// Row-major flattening for aggregate consumption.
    pub fn flatten(&self) -> impl Iterator<Item = &Value> {
        self.rows.iter().flatten()
    }
}

/// A fully-resolved function argument.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ArgValue {
    Scalar(Value),
    Range(RangeValues),
}

impl ArgValue {
    /// Collapse to a scalar (ranges yield their top-left value).
    pub fn scalar(&self) -> Value {
        match self {
            ArgValue::Scalar(v) => v.clone(),
            ArgValue::Range(r) => r
                .rows
                .first()
                .and_then(|row| row.first())
                .cloned()
                .unwrap_or(Value::Empty),
        }
    }

    /// All contained values in argument order.
    pub fn values(&self) -> Vec<Value> {
        match self {
            ArgValue::Scalar(v) => vec![v.clone()],
            ArgValue::Range(r) => r.flatten().cloned().collect(),
        }
    }
}

/// Call-site context handed to function implementations.
#[derive(Clone, Copy, Debug)]
pub struct CallCtx {
    /// The cell the formula lives in (or the ad-hoc solve origin).
    pub origin: CellKey,
}

// =============================================================================
// Evaluator
// =============================================================================

/// Per-cell evaluation note: the outcome plus whether any asynchronous
/// function was consumed (directly or transitively) to produce it.
#[derive(Clone, Debug)]
pub struct EvalNote {
    pub outcome: Outcome,
    pub used_async: bool,
}

type Eval = (Outcome, bool);

/// Recursive, memoizing evaluator for one evaluation pass.
///
/// Carries the visited set for cycle detection on the active recursion path.
/// Cycle state lives here, never on cells, so concurrent passes triggered by
/// async completions cannot observe each other's guard flags.
pub struct Evaluator<'a> {
    table: &'a Table,
    registry: &'a Registry,
    cache: &'a mut AsyncCache,
    config: &'a EngineConfig,
    visited: FxHashSet<CellKey>,
    notes: FxHashMap<CellKey, EvalNote>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        table: &'a Table,
        registry: &'a Registry,
        cache: &'a mut AsyncCache,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            table,
            registry,
            cache,
            config,
            visited: FxHashSet::default(),
            notes: FxHashMap::default(),
        }
    }

    /// Notes for every formula cell this pass evaluated, for write-back of
    /// solved values.
    pub fn into_notes(self) -> FxHashMap<CellKey, EvalNote> {
        self.notes
    }

    /// Evaluate a cell, reusing its stored solved value when present.
    pub fn eval_cell(&mut self, key: CellKey) -> EvalNote {
        if let Some(note) = self.notes.get(&key) {
            return note.clone();
        }
        if self.visited.contains(&key) {
            // Re-entering a cell on the active path: circular reference.
            return EvalNote {
                outcome: Outcome::Ready(Value::Error(FormulaError::circular())),
                used_async: false,
            };
        }

        let sheet = match self.table.sheet_by_id(key.sheet) {
            Some(s) => s,
            None => {
                return EvalNote {
                    outcome: Outcome::Ready(Value::Error(FormulaError::reference(
                        "sheet no longer exists",
                    ))),
                    used_async: false,
                }
            }
        };
        let cell = match sheet.get(key.point) {
            Some(c) => c,
            None => {
                return EvalNote {
                    outcome: Outcome::Ready(Value::Empty),
                    used_async: false,
                }
            }
        };

        if let Some(v) = &cell.solved {
            return EvalNote {
                outcome: Outcome::Ready(v.clone()),
                used_async: cell.async_state.is_some(),
            };
        }

        match cell.content.entity() {
            Some(entity) => {
                if self.visited.len() >= self.config.max_eval_depth {
                    return EvalNote {
                        outcome: Outcome::Ready(Value::Error(FormulaError::reference(
                            "evaluation depth exceeded",
                        ))),
                        used_async: false,
                    };
                }
                let entity = entity.clone();
                self.visited.insert(key);
                let (outcome, used_async) = self.eval_entity(&entity, key);
                self.visited.remove(&key);
                let note = EvalNote {
                    outcome,
                    used_async,
                };
                self.notes.insert(key, note.clone());
                note
            }
            None => EvalNote {
                outcome: Outcome::Ready(cell.content.literal_value()),
                used_async: false,
            },
        }
    }

    /// Evaluate a free-standing entity at the given origin (ad-hoc solve).
    pub fn eval_formula(&mut self, entity: &Entity, origin: CellKey) -> EvalNote {
        let (outcome, used_async) = self.eval_entity(entity, origin);
        EvalNote {
            outcome,
            used_async,
        }
    }

    fn eval_entity(&mut self, entity: &Entity, origin: CellKey) -> Eval {
        match entity {
            Entity::Value(v) => (Outcome::Ready(v.clone()), false),
            Entity::Ref { sheet, point, .. } => self.eval_ref(sheet.as_deref(), *point, origin),
            Entity::Range { .. } => {
                // Scalar position: collapse to the top-left cell.
                match self.range_box(entity, origin) {
                    Ok((sid, r0, c0, _, _)) => {
                        self.eval_ref_resolved(sid, Point::new(r0, c0))
                    }
                    Err(e) => (Outcome::Ready(Value::Error(e)), false),
                }
            }
            Entity::Func { name, args } => self.eval_func(name, args, origin),
        }
    }

    fn eval_ref(&mut self, sheet: Option<&str>, point: Point, origin: CellKey) -> Eval {
        let sid = match sheet {
            None => origin.sheet,
            Some(name) => match self.table.sheet_id_by_name(name) {
                Some(id) => id,
                None => {
                    return (
                        Outcome::Ready(Value::Error(FormulaError::reference(format!(
                            "no sheet named '{}'",
                            name
                        )))),
                        false,
                    )
                }
            },
        };
        self.eval_ref_resolved(sid, point)
    }

    fn eval_ref_resolved(&mut self, sid: SheetId, point: Point) -> Eval {
        let sheet = match self.table.sheet_by_id(sid) {
            Some(s) => s,
            None => {
                return (
                    Outcome::Ready(Value::Error(FormulaError::reference(
                        "sheet no longer exists",
                    ))),
                    false,
                )
            }
        };
        if !sheet.bounds().contains(point) {
            return (
                Outcome::Ready(Value::Error(FormulaError::reference(format!(
                    "{} is outside the sheet bounds",
                    point
                )))),
                false,
            );
        }
        let note = self.eval_cell(CellKey::new(sid, point));
        (note.outcome, note.used_async)
    }

    fn eval_func(&mut self, name: &str, args: &[Entity], origin: CellKey) -> Eval {
        if operator_precedence(name).is_some() {
            return self.eval_operator(name, args, origin);
        }

        let spec = match self.registry.get(name) {
            Some(s) => s.clone(),
            None => {
                return (
                    Outcome::Ready(Value::Error(FormulaError::unknown_name(name))),
                    false,
                )
            }
        };

        if args.len() < spec.min_args
            || spec.max_args.is_some_and(|max| args.len() > max)
        {
            return (
                Outcome::Ready(Value::Error(FormulaError::value(format!(
                    "{} called with {} argument(s)",
                    spec.name,
                    args.len()
                )))),
                false,
            );
        }

        match spec.handler.clone() {
            Handler::Special(form) => self.eval_special(form, args, origin),
            Handler::Sync(f) => {
                let (resolved, used) = match self.resolve_args(args, &spec, origin) {
                    Ok(r) => r,
                    Err(early) => return early,
                };
                let ctx = CallCtx { origin };
                (Outcome::Ready(f(&ctx, &resolved)), used)
            }
            Handler::Async(f) => {
                let (resolved, used) = match self.resolve_args(args, &spec, origin) {
                    Ok(r) => r,
                    Err(early) => return early,
                };
                let fp = fingerprint(&spec.name, &resolved);
                match self.cache.lookup(&fp) {
                    Some(AsyncResult::Settled(v)) => (Outcome::Ready(v), true),
                    Some(AsyncResult::Failed(e)) => (Outcome::Ready(Value::Error(e)), true),
                    Some(AsyncResult::Pending) => {
                        self.cache.add_waiter(&fp, origin);
                        (Outcome::Pending, true)
                    }
                    None => {
                        let ctx = CallCtx { origin };
                        let task = f(&ctx, &resolved);
                        self.cache.schedule(fp.clone(), task, spec.ttl);
                        self.cache.add_waiter(&fp, origin);
                        (Outcome::Pending, true)
                    }
                }
            }
        }
    }

    /// Resolve and coerce argument entities per the function's parameter
    /// specs. Short-circuits on pending inputs and (for error-intolerant
    /// functions) on the first error argument.
    #[allow(clippy::type_complexity)]
    fn resolve_args(
        &mut self,
        args: &[Entity],
        spec: &crate::formula::functions::FunctionSpec,
        origin: CellKey,
    ) -> Result<(Vec<ArgValue>, bool), Eval> {
        let mut used = false;
        let mut out = Vec::with_capacity(args.len());

        for (i, arg) in args.iter().enumerate() {
            let param = spec.params.get(i).or_else(|| spec.params.last());
            match arg {
                Entity::Range { .. } => match self.resolve_range(arg, origin) {
                    RangeResolution::Pending => return Err((Outcome::Pending, true)),
                    RangeResolution::Bad(e) => {
                        if spec.error_tolerant {
                            out.push(ArgValue::Scalar(Value::Error(e)));
                        } else {
                            return Err((Outcome::Ready(Value::Error(e)), used));
                        }
                    }
                    RangeResolution::Ready(rv, u) => {
                        used |= u;
                        if !spec.error_tolerant {
                            if let Some(e) = rv.first_error() {
                                return Err((Outcome::Ready(Value::Error(e.clone())), used));
                            }
                        }
                        match coerce_range(rv, param) {
                            Ok(a) => out.push(a),
                            Err(e) => return Err((Outcome::Ready(Value::Error(e)), used)),
                        }
                    }
                },
                _ => {
                    let (outcome, u) = self.eval_entity(arg, origin);
                    used |= u;
                    let v = match outcome {
                        Outcome::Pending => return Err((Outcome::Pending, used)),
                        Outcome::Ready(v) => v,
                    };
                    if let Value::Error(_) = &v {
                        if !spec.error_tolerant {
                            return Err((Outcome::Ready(v), used));
                        }
                        out.push(ArgValue::Scalar(v));
                        continue;
                    }
                    match coerce_scalar(v, param) {
                        Ok(cv) => out.push(ArgValue::Scalar(cv)),
                        Err(e) => return Err((Outcome::Ready(Value::Error(e)), used)),
                    }
                }
            }
        }

        Ok((out, used))
    }

    /// Resolve the rectangle a range entity covers, clamping sentinel axes
    /// to the target sheet's ever-ensured bounds.
    fn range_box(
        &self,
        entity: &Entity,
        origin: CellKey,
    ) -> Result<(SheetId, u32, u32, u32, u32), FormulaError> {
        let (sheet, start, end) = match entity {
            Entity::Range {
                sheet, start, end, ..
            } => (sheet, start, end),
            _ => return Err(FormulaError::reference("not a range")),
        };
        let sid = match sheet {
            None => origin.sheet,
            Some(name) => self
                .table
                .sheet_id_by_name(name)
                .ok_or_else(|| FormulaError::reference(format!("no sheet named '{}'", name)))?,
        };
        let s = self
            .table
            .sheet_by_id(sid)
            .ok_or_else(|| FormulaError::reference("sheet no longer exists"))?;
        let b = s.bounds();

        let (mut r0, mut r1) = (start.row, end.row);
        let (mut c0, mut c1) = (start.col, end.col);
        if r0 == 0 {
            r0 = b.top;
            r1 = b.bottom;
        }
        if c0 == 0 {
            c0 = b.left;
            c1 = b.right;
        }
        if r0 > r1 {
            std::mem::swap(&mut r0, &mut r1);
        }
        if c0 > c1 {
            std::mem::swap(&mut c0, &mut c1);
        }
        if r0 < b.top || r1 > b.bottom || c0 < b.left || c1 > b.right {
            return Err(FormulaError::reference(
                "range extends outside the sheet bounds",
            ));
        }
        Ok((sid, r0, c0, r1, c1))
    }

    fn resolve_range(&mut self, entity: &Entity, origin: CellKey) -> RangeResolution {
        let (sid, r0, c0, r1, c1) = match self.range_box(entity, origin) {
            Ok(b) => b,
            Err(e) => return RangeResolution::Bad(e),
        };
        let mut used = false;
        let mut rows = Vec::with_capacity((r1 - r0 + 1) as usize);
        for r in r0..=r1 {
            let mut row = Vec::with_capacity((c1 - c0 + 1) as usize);
            for c in c0..=c1 {
                let (outcome, u) = self.eval_ref_resolved(sid, Point::new(r, c));
                used |= u;
                match outcome {
                    Outcome::Pending => return RangeResolution::Pending,
                    Outcome::Ready(v) => row.push(v),
                }
            }
            rows.push(row);
        }
        RangeResolution::Ready(RangeValues { rows }, used)
    }

    // -------------------------------------------------------------------------
    // Operators (desugared Func nodes with symbolic names)
    // -------------------------------------------------------------------------

    fn eval_operator(&mut self, name: &str, args: &[Entity], origin: CellKey) -> Eval {
        let mut used = false;
        let mut vals = Vec::with_capacity(args.len());
        for arg in args {
            let (outcome, u) = self.eval_entity(arg, origin);
            used |= u;
            match outcome {
                Outcome::Pending => return (Outcome::Pending, used),
                Outcome::Ready(v) => {
                    if v.is_error() {
                        return (Outcome::Ready(v), used);
                    }
                    vals.push(v);
                }
            }
        }

        let result = if vals.len() == 1 {
            // Unary minus is the only unary operator that survives parsing.
            match vals[0].to_number() {
                Ok(n) => number_or_error(-n),
                Err(e) => Value::Error(e),
            }
        } else {
            apply_binary(name, &vals[0], &vals[1])
        };
        (Outcome::Ready(result), used)
    }

    // -------------------------------------------------------------------------
    // Special forms: lazily-evaluated or reference-aware built-ins
    // -------------------------------------------------------------------------

    fn eval_special(&mut self, form: SpecialForm, args: &[Entity], origin: CellKey) -> Eval {
        match form {
            SpecialForm::If => {
                let (outcome, mut used) = self.eval_entity(&args[0], origin);
                let cond = match outcome {
                    Outcome::Pending => return (Outcome::Pending, used),
                    Outcome::Ready(v) => {
                        if v.is_error() {
                            return (Outcome::Ready(v), used);
                        }
                        match v.to_bool() {
                            Ok(b) => b,
                            Err(e) => return (Outcome::Ready(Value::Error(e)), used),
                        }
                    }
                };
                let branch = if cond { args.get(1) } else { args.get(2) };
                match branch {
                    Some(entity) => {
                        let (o, u) = self.eval_entity(entity, origin);
                        used |= u;
                        (o, used)
                    }
                    None => (Outcome::Ready(Value::Bool(false)), used),
                }
            }
            SpecialForm::IfError => {
                let (outcome, mut used) = self.eval_entity(&args[0], origin);
                match outcome {
                    Outcome::Pending => (Outcome::Pending, used),
                    Outcome::Ready(Value::Error(e)) => {
                        // A name-resolution error is an authoring mistake,
                        // not a data error: re-raise it instead of masking
                        // it with the fallback.
                        if e.code == ErrorCode::Name {
                            return (Outcome::Ready(Value::Error(e)), used);
                        }
                        let (o, u) = self.eval_entity(&args[1], origin);
                        used |= u;
                        (o, used)
                    }
                    Outcome::Ready(v) => (Outcome::Ready(v), used),
                }
            }
            SpecialForm::Row | SpecialForm::Column => {
                let pick = |p: Point| match form {
                    SpecialForm::Row => p.row.max(1),
                    _ => p.col.max(1),
                };
                match args.first() {
                    None => {
                        let n = pick(origin.point);
                        (Outcome::Ready(Value::Number(n as f64)), false)
                    }
                    Some(Entity::Ref { point, .. }) => {
                        (Outcome::Ready(Value::Number(pick(*point) as f64)), false)
                    }
                    Some(Entity::Range { start, .. }) => {
                        (Outcome::Ready(Value::Number(pick(*start) as f64)), false)
                    }
                    Some(_) => (
                        Outcome::Ready(Value::Error(FormulaError::value(
                            "expected a reference argument",
                        ))),
                        false,
                    ),
                }
            }
        }
    }
}

enum RangeResolution {
    Ready(RangeValues, bool),
    Pending,
    Bad(FormulaError),
}

// =============================================================================
// Coercion
// =============================================================================

use crate::formula::functions::{Coerce, ParamSpec};

fn coerce_scalar(v: Value, param: Option<&ParamSpec>) -> Result<Value, FormulaError> {
    let coerce = param.map_or(Coerce::Any, |p| p.coerce);
    match coerce {
        Coerce::Any => Ok(v),
        Coerce::Number => v.to_number().map(Value::Number),
        Coerce::Text => Ok(Value::Text(v.to_text())),
        Coerce::Bool => v.to_bool().map(Value::Bool),
        Coerce::Date => v.to_date().map(Value::Date),
    }
}

/// Coerce every element of a range. In lenient mode, cells that do not
/// already carry the target type are skipped instead of erroring, which is
/// how aggregates ignore text and blanks inside their input ranges.
fn coerce_range(rv: RangeValues, param: Option<&ParamSpec>) -> Result<ArgValue, FormulaError> {
    let (coerce, lenient) = param.map_or((Coerce::Any, false), |p| (p.coerce, p.lenient));
    if matches!(coerce, Coerce::Any) {
        return Ok(ArgValue::Range(rv));
    }

    if lenient {
        let mut kept = Vec::new();
        for v in rv.flatten() {
            let keep = match (coerce, v) {
                (Coerce::Number, Value::Number(n)) => Some(Value::Number(*n)),
                (Coerce::Number, Value::Date(d)) => Some(Value::Number(date_to_serial(*d))),
                (Coerce::Bool, Value::Bool(b)) => Some(Value::Bool(*b)),
                (Coerce::Bool, Value::Number(n)) => Some(Value::Bool(*n != 0.0)),
                (Coerce::Text, Value::Text(s)) => Some(Value::Text(s.clone())),
                (Coerce::Date, Value::Date(d)) => Some(Value::Date(*d)),
                _ => None,
            };
            if let Some(v) = keep {
                kept.push(v);
            }
        }
        return Ok(ArgValue::Range(RangeValues { rows: vec![kept] }));
    }

    let mut rows = Vec::with_capacity(rv.rows.len());
    for row in rv.rows {
        let mut out = Vec::with_capacity(row.len());
        for v in row {
            out.push(coerce_scalar(v, param)?);
        }
        rows.push(out);
    }
    Ok(ArgValue::Range(RangeValues { rows }))
}

// =============================================================================
// Binary operator semantics
// =============================================================================

fn apply_binary(op: &str, left: &Value, right: &Value) -> Value {
    match op {
        "+" | "-" | "*" | "/" | "^" => {
            let l = match left.to_number() {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            let r = match right.to_number() {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            match op {
                "+" => number_or_error(l + r),
                "-" => number_or_error(l - r),
                "*" => number_or_error(l * r),
                "/" => {
                    if r == 0.0 {
                        Value::Error(FormulaError::div0())
                    } else {
                        number_or_error(l / r)
                    }
                }
                _ => number_or_error(l.powf(r)),
            }
        }
        "&" => Value::Text(format!("{}{}", left.to_text(), right.to_text())),
        "=" | "<>" | "<" | "<=" | ">" | ">=" => compare(op, left, right),
        other => Value::Error(FormulaError::unknown_name(other)),
    }
}

/// Comparison semantics: numbers compare numerically, text compares
/// case-insensitively, booleans support only equality. Mixed operands try a
/// numeric comparison first, then fall back to text.
pub(crate) fn compare(op: &str, left: &Value, right: &Value) -> Value {
    let ord = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        (Value::Bool(a), Value::Bool(b)) => {
            return match op {
                "=" => Value::Bool(a == b),
                "<>" => Value::Bool(a != b),
                _ => Value::Error(FormulaError::value(
                    "booleans support only = and <> comparisons",
                )),
            }
        }
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        _ => match (left.to_number(), right.to_number()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b),
            _ => Some(left.to_text().to_lowercase().cmp(&right.to_text().to_lowercase())),
        },
    };

    let ord = match ord {
        Some(o) => o,
        None => return Value::Error(FormulaError::value("values are not comparable")),
    };

    let result = match op {
        "=" => ord == std::cmp::Ordering::Equal,
        "<>" => ord != std::cmp::Ordering::Equal,
        "<" => ord == std::cmp::Ordering::Less,
        "<=" => ord != std::cmp::Ordering::Greater,
        ">" => ord == std::cmp::Ordering::Greater,
        _ => ord != std::cmp::Ordering::Less,
    };
    Value::Bool(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_display_verbatim() {
        assert_eq!(ErrorCode::Ref.as_str(), "#REF!");
        assert_eq!(ErrorCode::Name.as_str(), "#NAME?");
        assert_eq!(ErrorCode::Value.as_str(), "#VALUE!");
        assert_eq!(ErrorCode::Div0.as_str(), "#DIV/0!");
        assert_eq!(ErrorCode::Na.as_str(), "#N/A");
        assert_eq!(ErrorCode::Async.as_str(), "#ASYNC!");
        assert_eq!(ErrorCode::Syntax.as_str(), "#ERROR!");
        for code in [
            "#REF!", "#NAME?", "#VALUE!", "#DIV/0!", "#N/A", "#ASYNC!", "#ERROR!",
        ] {
            assert_eq!(ErrorCode::from_display(code).map(|c| c.as_str()), Some(code));
        }
    }

    #[test]
    fn number_coercion() {
        assert_eq!(Value::Empty.to_number().unwrap(), 0.0);
        assert_eq!(Value::Bool(true).to_number().unwrap(), 1.0);
        assert_eq!(Value::Text(" 2.5 ".into()).to_number().unwrap(), 2.5);
        assert!(Value::Text("abc".into()).to_number().is_err());
        let d = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap();
        assert_eq!(Value::Date(d).to_number().unwrap(), 2.0);
    }

    #[test]
    fn date_serial_round_trip() {
        for ymd in [(1900, 1, 1), (1999, 12, 31), (2024, 2, 29)] {
            let d = NaiveDate::from_ymd_opt(ymd.0, ymd.1, ymd.2).unwrap();
            let serial = date_to_serial(d);
            assert_eq!(serial_to_date(serial), Some(d));
        }
    }

    #[test]
    fn arithmetic_operators() {
        assert_eq!(
            apply_binary("+", &Value::Number(2.0), &Value::Number(3.0)),
            Value::Number(5.0)
        );
        assert_eq!(
            apply_binary("^", &Value::Number(2.0), &Value::Number(10.0)),
            Value::Number(1024.0)
        );
        assert_eq!(
            apply_binary("/", &Value::Number(1.0), &Value::Number(0.0)),
            Value::Error(FormulaError::div0())
        );
        // Text that does not read as a number is a value error.
        assert!(matches!(
            apply_binary("+", &Value::Text("abc".into()), &Value::Number(1.0)),
            Value::Error(e) if e.code == ErrorCode::Value
        ));
    }

    #[test]
    fn concat_coerces_to_text() {
        assert_eq!(
            apply_binary("&", &Value::Number(1.0), &Value::Text("x".into())),
            Value::Text("1x".into())
        );
        assert_eq!(
            apply_binary("&", &Value::Empty, &Value::Bool(true)),
            Value::Text("TRUE".into())
        );
    }

    #[test]
    fn comparisons() {
        assert_eq!(
            apply_binary("<", &Value::Number(1.0), &Value::Number(2.0)),
            Value::Bool(true)
        );
        assert_eq!(
            apply_binary("=", &Value::Text("Apple".into()), &Value::Text("apple".into())),
            Value::Bool(true)
        );
        assert_eq!(
            apply_binary("<>", &Value::Bool(true), &Value::Bool(false)),
            Value::Bool(true)
        );
        assert!(matches!(
            apply_binary("<", &Value::Bool(true), &Value::Bool(false)),
            Value::Error(_)
        ));
        // Mixed: numeric text compares numerically.
        assert_eq!(
            apply_binary("=", &Value::Text("2".into()), &Value::Number(2.0)),
            Value::Bool(true)
        );
    }

    #[test]
    fn nonfinite_results_become_value_errors() {
        assert!(matches!(
            apply_binary("^", &Value::Number(1e308), &Value::Number(2.0)),
            Value::Error(e) if e.code == ErrorCode::Value
        ));
    }

    #[test]
    fn display_forms() {
        assert_eq!(Value::Number(3.0).display(), "3");
        assert_eq!(Value::Number(2.5).display(), "2.5");
        assert_eq!(Value::Bool(true).display(), "TRUE");
        assert_eq!(Value::Empty.display(), "");
        assert_eq!(
            Value::Error(FormulaError::div0()).display(),
            "#DIV/0!"
        );
        assert_eq!(Outcome::Pending.display(), "");
    }
}
