// Function library: a registry of named implementations with declared
// arity, per-argument coercion, and sync/async compute. Built-ins live
// here; user code registers additional functions through the same contract.

use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::formula::eval::{compare, number_or_error, ArgValue, CallCtx, FormulaError, Value};

/// Target type for argument coercion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coerce {
    Any,
    Number,
    Text,
    Bool,
    Date,
}

/// Coercion rule for one parameter position. The last spec repeats for
/// variadic tails. `lenient` applies to range elements: cells that do not
/// carry the target type are skipped instead of erroring, which is how
/// aggregates ignore text and blanks.
#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub coerce: Coerce,
    pub lenient: bool,
}

impl ParamSpec {
    pub fn strict(coerce: Coerce) -> Self {
        Self {
            coerce,
            lenient: false,
        }
    }

    pub fn lenient(coerce: Coerce) -> Self {
        Self {
            coerce,
            lenient: true,
        }
    }
}

pub type SyncFn = Arc<dyn Fn(&CallCtx, &[ArgValue]) -> Value + Send + Sync>;
pub type AsyncFn = Arc<dyn Fn(&CallCtx, &[ArgValue]) -> AsyncTask + Send + Sync>;

/// A deferred computation produced by an asynchronous function. The engine
/// never runs this inline; it is handed to the spawner and its result comes
/// back through the completion channel.
pub struct AsyncTask(Box<dyn FnOnce() -> Result<Value, FormulaError> + Send>);

impl AsyncTask {
    pub fn new(f: impl FnOnce() -> Result<Value, FormulaError> + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn run(self) -> Result<Value, FormulaError> {
        (self.0)()
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncTask")
    }
}

/// Built-ins that need lazy or reference-aware evaluation. These are still
/// registry entries (name resolution, arity), but the evaluator interprets
/// them instead of calling a handler with resolved values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialForm {
    If,
    IfError,
    Row,
    Column,
}

#[derive(Clone)]
pub enum Handler {
    Sync(SyncFn),
    Async(AsyncFn),
    Special(SpecialForm),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Sync"),
            Handler::Async(_) => f.write_str("Async"),
            Handler::Special(form) => write!(f, "Special({:?})", form),
        }
    }
}

/// Everything the evaluator needs to validate and dispatch one function.
#[derive(Clone, Debug)]
pub struct FunctionSpec {
    pub name: String,
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub params: Vec<ParamSpec>,
    pub handler: Handler,
    /// Reuse window for cached async results. Zero means no reuse: the
    /// cached entry is dropped as soon as its waiters have re-solved.
    pub ttl: Duration,
    /// Error-tolerant functions receive error arguments as values instead
    /// of short-circuiting on them.
    pub error_tolerant: bool,
}

impl FunctionSpec {
    pub fn sync(
        name: &str,
        min_args: usize,
        max_args: Option<usize>,
        params: Vec<ParamSpec>,
        f: impl Fn(&CallCtx, &[ArgValue]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            min_args,
            max_args,
            params,
            handler: Handler::Sync(Arc::new(f)),
            ttl: Duration::ZERO,
            error_tolerant: false,
        }
    }

    pub fn asynchronous(
        name: &str,
        min_args: usize,
        max_args: Option<usize>,
        params: Vec<ParamSpec>,
        ttl: Duration,
        f: impl Fn(&CallCtx, &[ArgValue]) -> AsyncTask + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            min_args,
            max_args,
            params,
            handler: Handler::Async(Arc::new(f)),
            ttl,
            error_tolerant: false,
        }
    }

    fn special(name: &str, min_args: usize, max_args: Option<usize>, form: SpecialForm) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            min_args,
            max_args,
            params: vec![ParamSpec::strict(Coerce::Any)],
            handler: Handler::Special(form),
            ttl: Duration::ZERO,
            error_tolerant: false,
        }
    }

    pub fn tolerate_errors(mut self) -> Self {
        self.error_tolerant = true;
        self
    }
}

/// Case-insensitive function registry.
pub struct Registry {
    fns: FxHashMap<String, Arc<FunctionSpec>>,
}

impl Registry {
    /// An empty registry, for hosts that want full control of the function
    /// set.
    pub fn empty() -> Self {
        Self {
            fns: FxHashMap::default(),
        }
    }

    /// A registry pre-loaded with the built-in library.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        register_builtins(&mut reg);
        reg
    }

    /// Register a function. Later registrations shadow earlier ones, so
    /// hosts can replace built-ins.
    pub fn register(&mut self, spec: FunctionSpec) {
        self.fns.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<FunctionSpec>> {
        self.fns.get(&name.to_ascii_uppercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fns.contains_key(&name.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// =============================================================================
// Built-ins
// =============================================================================

fn num_param() -> Vec<ParamSpec> {
    vec![ParamSpec::lenient(Coerce::Number)]
}

/// Collect every numeric argument value. Arguments reach aggregate handlers
/// already coerced, so the conversion here cannot fail.
fn numbers(args: &[ArgValue]) -> Vec<f64> {
    args.iter()
        .flat_map(|a| a.values())
        .filter_map(|v| v.to_number().ok())
        .collect()
}

fn register_builtins(reg: &mut Registry) {
    // --- Aggregates --------------------------------------------------------
    reg.register(FunctionSpec::sync("SUM", 1, None, num_param(), |_, args| {
        Value::Number(numbers(args).iter().sum())
    }));
    for name in ["AVERAGE", "AVG"] {
        reg.register(FunctionSpec::sync(name, 1, None, num_param(), |_, args| {
            let ns = numbers(args);
            if ns.is_empty() {
                Value::Error(FormulaError::div0())
            } else {
                Value::Number(ns.iter().sum::<f64>() / ns.len() as f64)
            }
        }));
    }
    reg.register(FunctionSpec::sync("MIN", 1, None, num_param(), |_, args| {
        Value::Number(numbers(args).into_iter().fold(f64::INFINITY, f64::min).min_finite())
    }));
    reg.register(FunctionSpec::sync("MAX", 1, None, num_param(), |_, args| {
        Value::Number(
            numbers(args)
                .into_iter()
                .fold(f64::NEG_INFINITY, f64::max)
                .max_finite(),
        )
    }));
    reg.register(FunctionSpec::sync("PRODUCT", 1, None, num_param(), |_, args| {
        let ns = numbers(args);
        if ns.is_empty() {
            Value::Number(0.0)
        } else {
            number_or_error(ns.iter().product())
        }
    }));
    reg.register(
        FunctionSpec::sync(
            "COUNT",
            1,
            None,
            vec![ParamSpec::strict(Coerce::Any)],
            |_, args| {
                let mut n = 0usize;
                for arg in args {
                    match arg {
                        ArgValue::Scalar(v) => {
                            if v.to_number().is_ok() && !matches!(v, Value::Empty | Value::Error(_))
                            {
                                n += 1;
                            }
                        }
                        ArgValue::Range(r) => {
                            n += r
                                .flatten()
                                .filter(|v| matches!(v, Value::Number(_) | Value::Date(_)))
                                .count();
                        }
                    }
                }
                Value::Number(n as f64)
            },
        )
        .tolerate_errors(),
    );
    reg.register(
        FunctionSpec::sync(
            "COUNTA",
            1,
            None,
            vec![ParamSpec::strict(Coerce::Any)],
            |_, args| {
                let n = args
                    .iter()
                    .flat_map(|a| a.values())
                    .filter(|v| !matches!(v, Value::Empty))
                    .count();
                Value::Number(n as f64)
            },
        )
        .tolerate_errors(),
    );

    // --- Scalar math -------------------------------------------------------
    reg.register(FunctionSpec::sync(
        "ABS",
        1,
        Some(1),
        vec![ParamSpec::strict(Coerce::Number)],
        |_, args| match args[0].scalar().to_number() {
            Ok(n) => Value::Number(n.abs()),
            Err(e) => Value::Error(e),
        },
    ));
    reg.register(FunctionSpec::sync(
        "ROUND",
        1,
        Some(2),
        vec![ParamSpec::strict(Coerce::Number)],
        |_, args| {
            let n = match args[0].scalar().to_number() {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            let digits = match args.get(1).map(|a| a.scalar().to_number()) {
                Some(Ok(d)) => d as i32,
                Some(Err(e)) => return Value::Error(e),
                None => 0,
            };
            let factor = 10f64.powi(digits);
            number_or_error((n * factor).round() / factor)
        },
    ));
    reg.register(FunctionSpec::sync(
        "INT",
        1,
        Some(1),
        vec![ParamSpec::strict(Coerce::Number)],
        |_, args| match args[0].scalar().to_number() {
            Ok(n) => Value::Number(n.floor()),
            Err(e) => Value::Error(e),
        },
    ));
    reg.register(FunctionSpec::sync(
        "MOD",
        2,
        Some(2),
        vec![ParamSpec::strict(Coerce::Number)],
        |_, args| {
            let a = match args[0].scalar().to_number() {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            let b = match args[1].scalar().to_number() {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            if b == 0.0 {
                Value::Error(FormulaError::div0())
            } else {
                number_or_error(a - b * (a / b).floor())
            }
        },
    ));
    reg.register(FunctionSpec::sync(
        "SQRT",
        1,
        Some(1),
        vec![ParamSpec::strict(Coerce::Number)],
        |_, args| match args[0].scalar().to_number() {
            Ok(n) if n >= 0.0 => Value::Number(n.sqrt()),
            Ok(_) => Value::Error(FormulaError::value("square root of a negative number")),
            Err(e) => Value::Error(e),
        },
    ));
    reg.register(FunctionSpec::sync(
        "POWER",
        2,
        Some(2),
        vec![ParamSpec::strict(Coerce::Number)],
        |_, args| {
            match (args[0].scalar().to_number(), args[1].scalar().to_number()) {
                (Ok(a), Ok(b)) => number_or_error(a.powf(b)),
                (Err(e), _) | (_, Err(e)) => Value::Error(e),
            }
        },
    ));

    // --- Logic -------------------------------------------------------------
    reg.register(FunctionSpec::special("IF", 2, Some(3), SpecialForm::If));
    reg.register(
        FunctionSpec::special("IFERROR", 2, Some(2), SpecialForm::IfError).tolerate_errors(),
    );
    reg.register(FunctionSpec::sync(
        "AND",
        1,
        None,
        vec![ParamSpec::lenient(Coerce::Bool)],
        |_, args| logic_fold(args, true, |acc, b| acc && b),
    ));
    reg.register(FunctionSpec::sync(
        "OR",
        1,
        None,
        vec![ParamSpec::lenient(Coerce::Bool)],
        |_, args| logic_fold(args, false, |acc, b| acc || b),
    ));
    reg.register(FunctionSpec::sync(
        "NOT",
        1,
        Some(1),
        vec![ParamSpec::strict(Coerce::Bool)],
        |_, args| match args[0].scalar().to_bool() {
            Ok(b) => Value::Bool(!b),
            Err(e) => Value::Error(e),
        },
    ));

    // --- Text --------------------------------------------------------------
    reg.register(FunctionSpec::sync(
        "CONCAT",
        1,
        None,
        vec![ParamSpec::strict(Coerce::Text)],
        |_, args| {
            let mut out = String::new();
            for v in args.iter().flat_map(|a| a.values()) {
                out.push_str(&v.to_text());
            }
            Value::Text(out)
        },
    ));
    reg.register(FunctionSpec::sync(
        "UPPER",
        1,
        Some(1),
        vec![ParamSpec::strict(Coerce::Text)],
        |_, args| Value::Text(args[0].scalar().to_text().to_uppercase()),
    ));
    reg.register(FunctionSpec::sync(
        "LOWER",
        1,
        Some(1),
        vec![ParamSpec::strict(Coerce::Text)],
        |_, args| Value::Text(args[0].scalar().to_text().to_lowercase()),
    ));
    reg.register(FunctionSpec::sync(
        "LEN",
        1,
        Some(1),
        vec![ParamSpec::strict(Coerce::Text)],
        |_, args| Value::Number(args[0].scalar().to_text().chars().count() as f64),
    ));
    reg.register(FunctionSpec::sync(
        "TRIM",
        1,
        Some(1),
        vec![ParamSpec::strict(Coerce::Text)],
        |_, args| Value::Text(args[0].scalar().to_text().trim().to_string()),
    ));

    // --- Lookup ------------------------------------------------------------
    reg.register(FunctionSpec::sync(
        "VLOOKUP",
        3,
        Some(4),
        vec![
            ParamSpec::strict(Coerce::Any),
            ParamSpec::strict(Coerce::Any),
            ParamSpec::strict(Coerce::Number),
            ParamSpec::strict(Coerce::Bool),
        ],
        |_, args| lookup(args, LookupAxis::Rows),
    ));
    reg.register(FunctionSpec::sync(
        "HLOOKUP",
        3,
        Some(4),
        vec![
            ParamSpec::strict(Coerce::Any),
            ParamSpec::strict(Coerce::Any),
            ParamSpec::strict(Coerce::Number),
            ParamSpec::strict(Coerce::Bool),
        ],
        |_, args| lookup(args, LookupAxis::Cols),
    ));
    reg.register(FunctionSpec::sync(
        "MATCH",
        2,
        Some(3),
        vec![
            ParamSpec::strict(Coerce::Any),
            ParamSpec::strict(Coerce::Any),
            ParamSpec::strict(Coerce::Number),
        ],
        |_, args| match_position(args),
    ));

    // --- Positional --------------------------------------------------------
    reg.register(FunctionSpec::special("ROW", 0, Some(1), SpecialForm::Row));
    reg.register(FunctionSpec::special(
        "COLUMN",
        0,
        Some(1),
        SpecialForm::Column,
    ));

    // --- Dates -------------------------------------------------------------
    reg.register(FunctionSpec::sync(
        "DATE",
        3,
        Some(3),
        vec![ParamSpec::strict(Coerce::Number)],
        |_, args| {
            let part = |i: usize| args[i].scalar().to_number().map(|n| n as i64);
            match (part(0), part(1), part(2)) {
                (Ok(y), Ok(m), Ok(d)) => {
                    match chrono::NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32) {
                        Some(date) => Value::Date(date),
                        None => Value::Error(FormulaError::value(format!(
                            "{}-{}-{} is not a valid date",
                            y, m, d
                        ))),
                    }
                }
                (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => Value::Error(e),
            }
        },
    ));
    reg.register(FunctionSpec::sync("TODAY", 0, Some(0), vec![], |_, _| {
        Value::Date(chrono::Local::now().date_naive())
    }));
    for (name, pick) in [
        ("YEAR", 0u8),
        ("MONTH", 1u8),
        ("DAY", 2u8),
    ] {
        reg.register(FunctionSpec::sync(
            name,
            1,
            Some(1),
            vec![ParamSpec::strict(Coerce::Date)],
            move |_, args| match args[0].scalar().to_date() {
                Ok(d) => {
                    use chrono::Datelike;
                    let n = match pick {
                        0 => d.year() as f64,
                        1 => d.month() as f64,
                        _ => d.day() as f64,
                    };
                    Value::Number(n)
                }
                Err(e) => Value::Error(e),
            },
        ));
    }
}

/// Shared AND/OR fold over coerced boolean arguments.
fn logic_fold(args: &[ArgValue], init: bool, fold: impl Fn(bool, bool) -> bool) -> Value {
    let mut acc = init;
    let mut seen = false;
    for v in args.iter().flat_map(|a| a.values()) {
        match v.to_bool() {
            Ok(b) => {
                acc = fold(acc, b);
                seen = true;
            }
            Err(e) => return Value::Error(e),
        }
    }
    if seen {
        Value::Bool(acc)
    } else {
        Value::Error(FormulaError::value("no logical values in arguments"))
    }
}

enum LookupAxis {
    Rows,
    Cols,
}

/// Row/column-indexed search across a range (VLOOKUP / HLOOKUP). The
/// trailing flag picks the mode: FALSE for exact match, TRUE (the default)
/// for approximate (largest key-lane value not greater than the key,
/// assuming sorted input).
fn lookup(args: &[ArgValue], axis: LookupAxis) -> Value {
    let key = args[0].scalar();
    let table = match &args[1] {
        ArgValue::Range(r) => r,
        ArgValue::Scalar(_) => {
            return Value::Error(FormulaError::value("lookup requires a range"))
        }
    };
    let index = match args[2].scalar().to_number() {
        Ok(n) if n >= 1.0 => n as usize,
        Ok(_) => return Value::Error(FormulaError::value("lookup index must be at least 1")),
        Err(e) => return Value::Error(e),
    };
    let approximate = match args.get(3).map(|a| a.scalar().to_bool()) {
        Some(Ok(b)) => b,
        Some(Err(e)) => return Value::Error(e),
        None => true,
    };

    let (lanes, width): (Vec<Vec<Value>>, usize) = match axis {
        LookupAxis::Rows => (table.rows.clone(), table.width()),
        LookupAxis::Cols => {
            // Transpose so each lane is one column.
            let mut lanes = vec![Vec::with_capacity(table.height()); table.width()];
            for row in &table.rows {
                for (c, v) in row.iter().enumerate() {
                    lanes[c].push(v.clone());
                }
            }
            (lanes, table.height())
        }
    };
    if index > width {
        return Value::Error(FormulaError::reference(format!(
            "lookup index {} is outside the range",
            index
        )));
    }

    let mut best: Option<&Vec<Value>> = None;
    for lane in &lanes {
        let candidate = match lane.first() {
            Some(v) => v,
            None => continue,
        };
        if value_eq(candidate, &key) {
            best = Some(lane);
            break;
        }
        if approximate && value_le(candidate, &key) {
            best = Some(lane);
        }
    }

    match best {
        Some(lane) => lane.get(index - 1).cloned().unwrap_or(Value::Empty),
        None => Value::Error(FormulaError::na("no matching value found")),
    }
}

/// MATCH: 1-based position of a key in a single row or column.
fn match_position(args: &[ArgValue]) -> Value {
    let key = args[0].scalar();
    let range = match &args[1] {
        ArgValue::Range(r) => r,
        ArgValue::Scalar(_) => {
            return Value::Error(FormulaError::value("MATCH requires a range"))
        }
    };
    let match_type = match args.get(2).map(|a| a.scalar().to_number()) {
        Some(Ok(n)) => n,
        Some(Err(e)) => return Value::Error(e),
        None => 1.0,
    };
    if range.height() > 1 && range.width() > 1 {
        return Value::Error(FormulaError::na("MATCH requires a single row or column"));
    }

    let values: Vec<&Value> = range.flatten().collect();
    if match_type == 0.0 {
        for (i, v) in values.iter().enumerate() {
            if value_eq(v, &key) {
                return Value::Number((i + 1) as f64);
            }
        }
        return Value::Error(FormulaError::na("no exact match"));
    }

    // Approximate: last position whose value is <= key (sorted ascending).
    let mut best = None;
    for (i, v) in values.iter().enumerate() {
        if value_eq(v, &key) {
            return Value::Number((i + 1) as f64);
        }
        if value_le(v, &key) {
            best = Some(i + 1);
        }
    }
    match best {
        Some(i) => Value::Number(i as f64),
        None => Value::Error(FormulaError::na("no approximate match")),
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    matches!(compare("=", a, b), Value::Bool(true))
}

fn value_le(a: &Value, b: &Value) -> bool {
    matches!(compare("<=", a, b), Value::Bool(true))
}

/// Extension trait to pin empty-aggregate results at zero.
trait FiniteOr {
    fn min_finite(self) -> f64;
    fn max_finite(self) -> f64;
}

impl FiniteOr for f64 {
    fn min_finite(self) -> f64 {
        if self.is_finite() {
            self
        } else {
            0.0
        }
    }

    fn max_finite(self) -> f64 {
        if self.is_finite() {
            self
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Point;
    use crate::cell_key::CellKey;
    use crate::formula::eval::RangeValues;
    use crate::sheet::SheetId;

    fn ctx() -> CallCtx {
        CallCtx {
            origin: CellKey::new(SheetId::from_raw(1), Point::new(1, 1)),
        }
    }

    fn call(reg: &Registry, name: &str, args: &[ArgValue]) -> Value {
        match &reg.get(name).unwrap().handler {
            Handler::Sync(f) => f(&ctx(), args),
            other => panic!("{} is not a sync handler: {:?}", name, other),
        }
    }

    fn nums(ns: &[f64]) -> ArgValue {
        ArgValue::Range(RangeValues {
            rows: vec![ns.iter().map(|n| Value::Number(*n)).collect()],
        })
    }

    #[test]
    fn registry_is_case_insensitive() {
        let reg = Registry::with_builtins();
        assert!(reg.get("sum").is_some());
        assert!(reg.get("Sum").is_some());
        assert!(reg.get("SUM").is_some());
        assert!(reg.get("NO_SUCH_FN").is_none());
    }

    #[test]
    fn user_registration_shadows_builtins() {
        let mut reg = Registry::with_builtins();
        reg.register(FunctionSpec::sync("sum", 0, None, vec![], |_, _| {
            Value::Number(99.0)
        }));
        assert_eq!(call(&reg, "SUM", &[]), Value::Number(99.0));
    }

    #[test]
    fn sum_and_average() {
        let reg = Registry::with_builtins();
        assert_eq!(
            call(&reg, "SUM", &[nums(&[25.0]), nums(&[5.0, -3.0])]),
            Value::Number(27.0)
        );
        assert_eq!(
            call(&reg, "AVERAGE", &[nums(&[2.0, 4.0, 6.0])]),
            Value::Number(4.0)
        );
        assert!(matches!(
            call(&reg, "AVERAGE", &[nums(&[])]),
            Value::Error(e) if e.code == crate::formula::eval::ErrorCode::Div0
        ));
    }

    #[test]
    fn min_max_of_nothing_is_zero() {
        let reg = Registry::with_builtins();
        assert_eq!(call(&reg, "MIN", &[nums(&[])]), Value::Number(0.0));
        assert_eq!(call(&reg, "MAX", &[nums(&[])]), Value::Number(0.0));
    }

    #[test]
    fn count_ignores_non_numbers() {
        let reg = Registry::with_builtins();
        let mixed = ArgValue::Range(RangeValues {
            rows: vec![vec![
                Value::Number(1.0),
                Value::Text("x".into()),
                Value::Empty,
                Value::Number(2.0),
            ]],
        });
        assert_eq!(call(&reg, "COUNT", &[mixed.clone()]), Value::Number(2.0));
        assert_eq!(call(&reg, "COUNTA", &[mixed]), Value::Number(3.0));
    }

    #[test]
    fn vlookup_exact_and_approximate() {
        let reg = Registry::with_builtins();
        let table = ArgValue::Range(RangeValues {
            rows: vec![
                vec![Value::Number(1.0), Value::Text("one".into())],
                vec![Value::Number(3.0), Value::Text("three".into())],
                vec![Value::Number(5.0), Value::Text("five".into())],
            ],
        });
        // Exact hit.
        assert_eq!(
            call(
                &reg,
                "VLOOKUP",
                &[
                    ArgValue::Scalar(Value::Number(3.0)),
                    table.clone(),
                    ArgValue::Scalar(Value::Number(2.0)),
                    ArgValue::Scalar(Value::Bool(false)),
                ]
            ),
            Value::Text("three".into())
        );
        // Exact miss.
        assert!(matches!(
            call(
                &reg,
                "VLOOKUP",
                &[
                    ArgValue::Scalar(Value::Number(4.0)),
                    table.clone(),
                    ArgValue::Scalar(Value::Number(2.0)),
                    ArgValue::Scalar(Value::Bool(false)),
                ]
            ),
            Value::Error(e) if e.code == crate::formula::eval::ErrorCode::Na
        ));
        // Approximate: 4 falls back to the row keyed 3.
        assert_eq!(
            call(
                &reg,
                "VLOOKUP",
                &[
                    ArgValue::Scalar(Value::Number(4.0)),
                    table.clone(),
                    ArgValue::Scalar(Value::Number(2.0)),
                ]
            ),
            Value::Text("three".into())
        );
        // Index outside the range width.
        assert!(matches!(
            call(
                &reg,
                "VLOOKUP",
                &[
                    ArgValue::Scalar(Value::Number(3.0)),
                    table,
                    ArgValue::Scalar(Value::Number(9.0)),
                ]
            ),
            Value::Error(e) if e.code == crate::formula::eval::ErrorCode::Ref
        ));
    }

    #[test]
    fn match_positions() {
        let reg = Registry::with_builtins();
        let vector = ArgValue::Range(RangeValues {
            rows: vec![vec![
                Value::Number(10.0),
                Value::Number(20.0),
                Value::Number(30.0),
            ]],
        });
        assert_eq!(
            call(
                &reg,
                "MATCH",
                &[
                    ArgValue::Scalar(Value::Number(20.0)),
                    vector.clone(),
                    ArgValue::Scalar(Value::Number(0.0)),
                ]
            ),
            Value::Number(2.0)
        );
        assert_eq!(
            call(
                &reg,
                "MATCH",
                &[ArgValue::Scalar(Value::Number(25.0)), vector],
            ),
            Value::Number(2.0)
        );
    }

    #[test]
    fn date_parts() {
        let reg = Registry::with_builtins();
        let date = call(
            &reg,
            "DATE",
            &[
                ArgValue::Scalar(Value::Number(2024.0)),
                ArgValue::Scalar(Value::Number(2.0)),
                ArgValue::Scalar(Value::Number(29.0)),
            ],
        );
        assert!(matches!(date, Value::Date(_)));
        assert_eq!(
            call(&reg, "YEAR", &[ArgValue::Scalar(date.clone())]),
            Value::Number(2024.0)
        );
        assert_eq!(
            call(&reg, "MONTH", &[ArgValue::Scalar(date.clone())]),
            Value::Number(2.0)
        );
        assert_eq!(
            call(&reg, "DAY", &[ArgValue::Scalar(date)]),
            Value::Number(29.0)
        );
        assert!(matches!(
            call(
                &reg,
                "DATE",
                &[
                    ArgValue::Scalar(Value::Number(2023.0)),
                    ArgValue::Scalar(Value::Number(2.0)),
                    ArgValue::Scalar(Value::Number(30.0)),
                ]
            ),
            Value::Error(_)
        ));
    }

    #[test]
    fn async_task_runs_once() {
        let task = AsyncTask::new(|| Ok(Value::Number(7.0)));
        assert_eq!(task.run().unwrap(), Value::Number(7.0));
    }

    #[test]
    fn mod_semantics() {
        let reg = Registry::with_builtins();
        assert_eq!(
            call(
                &reg,
                "MOD",
                &[
                    ArgValue::Scalar(Value::Number(-3.0)),
                    ArgValue::Scalar(Value::Number(2.0)),
                ]
            ),
            Value::Number(1.0)
        );
        assert!(matches!(
            call(
                &reg,
                "MOD",
                &[
                    ArgValue::Scalar(Value::Number(1.0)),
                    ArgValue::Scalar(Value::Number(0.0)),
                ]
            ),
            Value::Error(e) if e.code == crate::formula::eval::ErrorCode::Div0
        ));
    }
}
