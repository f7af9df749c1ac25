// Formula parser - converts formula strings into an entity tree
// Supports: numbers, strings, booleans, error literals, cell refs (A1, $B$2),
// ranges (A1:B5, A:A, 3:7), sheet-qualified refs ('My Sheet'!A1), functions
// (SUM(..)), and operators (+ - * / ^ & = <> < <= > >=) with conventional
// precedence. Operators desugar to Func nodes with the operator symbol as the
// function name; alphabetic names stay reserved for the function registry.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::{column_letters, parse_column_letters, quote_sheet_name, Point};
use crate::formula::eval::{ErrorCode, FormulaError, Value};

/// The character a cell input must start with to be parsed as a formula.
pub const FORMULA_MARKER: char = '=';

/// The literal-escape marker: input starting with this is stored as text
/// with the marker stripped, never parsed.
pub const LITERAL_MARKER: char = '\'';

/// Parsed formula node. Sheet qualifiers are kept as names and resolved
/// against the table store at evaluation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    /// Literal value. Parse failures are also carried here as an error
    /// value, so a broken formula evaluates to its syntax error.
    Value(Value),
    /// Single-cell reference with per-axis absolute flags.
    Ref {
        sheet: Option<String>,
        point: Point,
        abs_col: bool,
        abs_row: bool,
    },
    /// Rectangular range. Sentinel-0 components mean full-column/full-row.
    Range {
        sheet: Option<String>,
        start: Point,
        end: Point,
        start_abs_col: bool,
        start_abs_row: bool,
        end_abs_col: bool,
        end_abs_row: bool,
    },
    /// Function call, including desugared operators (`name` is then the
    /// operator symbol, e.g. `"+"`).
    Func { name: String, args: Vec<Entity> },
}

impl Entity {
    /// An entity that evaluates to the given error.
    pub fn poison(err: FormulaError) -> Entity {
        Entity::Value(Value::Error(err))
    }
}

/// Binding precedence for operator symbols; `None` for regular names.
pub fn operator_precedence(name: &str) -> Option<u8> {
    match name {
        "=" | "<>" | "<" | "<=" | ">" | ">=" => Some(1),
        "&" => Some(2),
        "+" | "-" => Some(3),
        "*" | "/" => Some(4),
        "^" => Some(5),
        _ => None,
    }
}

/// Parse a formula string (must start with [`FORMULA_MARKER`]) into an
/// entity tree. Errors are returned as values; this never panics on user
/// input.
pub fn parse(formula: &str) -> Result<Entity, FormulaError> {
    let formula = formula.trim();
    let body = formula
        .strip_prefix(FORMULA_MARKER)
        .ok_or_else(|| FormulaError::syntax("formula must start with '='"))?;
    let tokens = tokenize(body)?;
    if tokens.is_empty() {
        return Err(FormulaError::syntax("empty formula"));
    }
    let (entity, pos) = parse_cmp(&tokens, 0)?;
    if pos != tokens.len() {
        return Err(FormulaError::syntax("unexpected trailing input"));
    }
    Ok(entity)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    ErrorLit(ErrorCode),
    /// Cell reference with absolute/relative flags.
    CellRef {
        point: Point,
        abs_col: bool,
        abs_row: bool,
    },
    /// Column-only reference (`$A` or the `A` half of `A:A`).
    ColRef { col: u32, abs: bool },
    /// Row-only reference (`$3` in `$3:$7`).
    RowRef { row: u32, abs: bool },
    /// Sheet name prefix (the `Sheet1` of `Sheet1!A1`), `!` consumed.
    SheetPrefix(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Amp,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LParen,
    RParen,
    Colon,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                tokens.push(Token::Plus);
                chars.next();
            }
            '-' => {
                tokens.push(Token::Minus);
                chars.next();
            }
            '*' => {
                tokens.push(Token::Star);
                chars.next();
            }
            '/' => {
                tokens.push(Token::Slash);
                chars.next();
            }
            '^' => {
                tokens.push(Token::Caret);
                chars.next();
            }
            '&' => {
                tokens.push(Token::Amp);
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            ':' => {
                tokens.push(Token::Colon);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            '=' => {
                tokens.push(Token::Eq);
                chars.next();
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        tokens.push(Token::LtEq);
                        chars.next();
                    }
                    Some('>') => {
                        tokens.push(Token::NotEq);
                        chars.next();
                    }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    tokens.push(Token::GtEq);
                    chars.next();
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(ch) => s.push(ch),
                        None => return Err(FormulaError::syntax("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '\'' => {
                // Quoted sheet name ('My Sheet'!A1, 'Bob''s Sheet'!A1).
                // Doubled quotes inside are an escape for a single quote.
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                name.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => name.push(ch),
                        None => return Err(FormulaError::syntax("unterminated sheet name")),
                    }
                }
                if chars.next() != Some('!') {
                    return Err(FormulaError::syntax(
                        "quoted sheet name must be followed by '!'",
                    ));
                }
                tokens.push(Token::SheetPrefix(name));
            }
            '#' => {
                // Error literal (#REF!, #NAME?, #DIV/0!, ...). These appear
                // in formulas after structural edits poison a reference.
                chars.next();
                let mut code = String::from("#");
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '/' {
                        code.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(&term) = chars.peek() {
                    if term == '!' || term == '?' {
                        code.push(term);
                        chars.next();
                    }
                }
                match ErrorCode::from_display(&code) {
                    Some(ec) => tokens.push(Token::ErrorLit(ec)),
                    None => {
                        return Err(FormulaError::syntax(format!(
                            "unknown error literal '{}'",
                            code
                        )))
                    }
                }
            }
            'A'..='Z' | 'a'..='z' | '_' => {
                // Cell reference (A1), function name (SUM), column half of a
                // range (A:A), or unquoted sheet prefix (Sheet1!).
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }

                if chars.peek() == Some(&'!') {
                    chars.next();
                    tokens.push(Token::SheetPrefix(ident));
                    continue;
                }

                let upper = ident.to_ascii_uppercase();
                if upper == "TRUE" {
                    tokens.push(Token::Bool(true));
                } else if upper == "FALSE" {
                    tokens.push(Token::Bool(false));
                } else if let Some(token) = try_parse_ref(&ident) {
                    tokens.push(token);
                } else {
                    tokens.push(Token::Ident(upper));
                }
            }
            '$' => {
                // Absolute marker - collect the whole reference after it.
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '$' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match try_parse_ref(&ident) {
                    Some(token) => tokens.push(token),
                    None => {
                        return Err(FormulaError::syntax(format!(
                            "invalid cell reference '{}'",
                            ident
                        )))
                    }
                }
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = num
                    .parse()
                    .map_err(|_| FormulaError::syntax(format!("invalid number '{}'", num)))?;
                tokens.push(Token::Number(n));
            }
            other => {
                return Err(FormulaError::syntax(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

/// Parse an identifier-shaped string as a cell, column or row reference.
fn try_parse_ref(s: &str) -> Option<Token> {
    let mut chars = s.chars().peekable();

    let abs_col = chars.peek() == Some(&'$');
    if abs_col {
        chars.next();
    }
    let mut col_str = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphabetic() {
            col_str.push(c);
            chars.next();
        } else {
            break;
        }
    }

    let abs_row = chars.peek() == Some(&'$');
    if abs_row {
        chars.next();
    }
    let row_str: String = chars.collect();

    if col_str.is_empty() {
        // Row-only form ($3).
        if abs_col || row_str.is_empty() || !row_str.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let row: u32 = row_str.parse().ok()?;
        if row == 0 {
            return None;
        }
        return Some(Token::RowRef { row, abs: abs_row });
    }

    let col = parse_column_letters(&col_str)?;

    if row_str.is_empty() {
        if abs_row {
            return None;
        }
        // Column-only form (A or $A); only meaningful next to ':'. The
        // parser decides, the tokenizer just cannot tell yet.
        if abs_col {
            return Some(Token::ColRef { col, abs: true });
        }
        return None;
    }

    if !row_str.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let row: u32 = row_str.parse().ok()?;
    if row == 0 {
        return None;
    }

    Some(Token::CellRef {
        point: Point::new(row, col),
        abs_col,
        abs_row,
    })
}

fn parse_cmp(tokens: &[Token], pos: usize) -> Result<(Entity, usize), FormulaError> {
    let (mut left, mut pos) = parse_concat(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Eq => "=",
            Token::LtEq => "<=",
            Token::GtEq => ">=",
            Token::NotEq => "<>",
            _ => break,
        };
        let (right, new_pos) = parse_concat(tokens, pos + 1)?;
        left = binop(op, left, right);
        pos = new_pos;
    }

    Ok((left, pos))
}

fn parse_concat(tokens: &[Token], pos: usize) -> Result<(Entity, usize), FormulaError> {
    let (mut left, mut pos) = parse_add_sub(tokens, pos)?;

    while pos < tokens.len() {
        if tokens[pos] == Token::Amp {
            let (right, new_pos) = parse_add_sub(tokens, pos + 1)?;
            left = binop("&", left, right);
            pos = new_pos;
        } else {
            break;
        }
    }

    Ok((left, pos))
}

fn parse_add_sub(tokens: &[Token], pos: usize) -> Result<(Entity, usize), FormulaError> {
    let (mut left, mut pos) = parse_mul_div(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Plus => "+",
            Token::Minus => "-",
            _ => break,
        };
        let (right, new_pos) = parse_mul_div(tokens, pos + 1)?;
        left = binop(op, left, right);
        pos = new_pos;
    }

    Ok((left, pos))
}

fn parse_mul_div(tokens: &[Token], pos: usize) -> Result<(Entity, usize), FormulaError> {
    let (mut left, mut pos) = parse_pow(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Star => "*",
            Token::Slash => "/",
            _ => break,
        };
        let (right, new_pos) = parse_pow(tokens, pos + 1)?;
        left = binop(op, left, right);
        pos = new_pos;
    }

    Ok((left, pos))
}

// Exponentiation is right-associative: 2^3^2 is 2^(3^2).
fn parse_pow(tokens: &[Token], pos: usize) -> Result<(Entity, usize), FormulaError> {
    let (base, pos) = parse_unary(tokens, pos)?;

    if pos < tokens.len() && tokens[pos] == Token::Caret {
        let (exponent, new_pos) = parse_pow(tokens, pos + 1)?;
        return Ok((binop("^", base, exponent), new_pos));
    }

    Ok((base, pos))
}

fn parse_unary(tokens: &[Token], pos: usize) -> Result<(Entity, usize), FormulaError> {
    match tokens.get(pos) {
        Some(Token::Minus) => {
            let (inner, pos) = parse_unary(tokens, pos + 1)?;
            Ok((
                Entity::Func {
                    name: "-".to_string(),
                    args: vec![inner],
                },
                pos,
            ))
        }
        Some(Token::Plus) => parse_unary(tokens, pos + 1),
        _ => parse_primary(tokens, pos),
    }
}

fn parse_primary(tokens: &[Token], pos: usize) -> Result<(Entity, usize), FormulaError> {
    let tok = tokens
        .get(pos)
        .ok_or_else(|| FormulaError::syntax("unexpected end of formula"))?;

    match tok {
        Token::Number(n) => {
            // A number followed by ':' is the row half of a full-row range.
            if tokens.get(pos + 1) == Some(&Token::Colon) {
                return parse_reference(tokens, pos, None);
            }
            Ok((Entity::Value(Value::Number(*n)), pos + 1))
        }
        Token::Str(s) => Ok((Entity::Value(Value::Text(s.clone())), pos + 1)),
        Token::Bool(b) => Ok((Entity::Value(Value::Bool(*b)), pos + 1)),
        Token::ErrorLit(code) => Ok((
            Entity::Value(Value::Error(FormulaError::new(*code, ""))),
            pos + 1,
        )),
        Token::SheetPrefix(name) => {
            let (entity, new_pos) = parse_reference(tokens, pos + 1, Some(name.clone()))?;
            Ok((entity, new_pos))
        }
        Token::Ident(name) => {
            if let Some(Token::LParen) = tokens.get(pos + 1) {
                let (args, new_pos) = parse_args(tokens, pos + 2)?;
                return Ok((
                    Entity::Func {
                        name: name.clone(),
                        args,
                    },
                    new_pos,
                ));
            }
            // Bare identifier: a column half of a full-column range (A:A),
            // otherwise an unknown name.
            if ident_as_column(name).is_some() && tokens.get(pos + 1) == Some(&Token::Colon) {
                return parse_reference(tokens, pos, None);
            }
            Err(FormulaError::syntax(format!("unexpected name '{}'", name)))
        }
        Token::LParen => {
            let (entity, pos) = parse_cmp(tokens, pos + 1)?;
            match tokens.get(pos) {
                Some(Token::RParen) => Ok((entity, pos + 1)),
                _ => Err(FormulaError::syntax("missing closing parenthesis")),
            }
        }
        _ => parse_reference(tokens, pos, None),
    }
}

/// Column number for an ident that is pure letters (the `A` of `A:A`).
fn ident_as_column(name: &str) -> Option<u32> {
    if name.chars().all(|c| c.is_ascii_alphabetic()) {
        parse_column_letters(name)
    } else {
        None
    }
}

/// One corner of a reference: either a full cell or a sentinel axis.
struct Corner {
    point: Point,
    abs_col: bool,
    abs_row: bool,
}

fn corner_at(tokens: &[Token], pos: usize) -> Option<(Corner, usize)> {
    match tokens.get(pos)? {
        Token::CellRef {
            point,
            abs_col,
            abs_row,
        } => Some((
            Corner {
                point: *point,
                abs_col: *abs_col,
                abs_row: *abs_row,
            },
            pos + 1,
        )),
        Token::ColRef { col, abs } => Some((
            Corner {
                point: Point::new(0, *col),
                abs_col: *abs,
                abs_row: false,
            },
            pos + 1,
        )),
        Token::RowRef { row, abs } => Some((
            Corner {
                point: Point::new(*row, 0),
                abs_col: false,
                abs_row: *abs,
            },
            pos + 1,
        )),
        Token::Ident(name) => {
            let col = ident_as_column(name)?;
            Some((
                Corner {
                    point: Point::new(0, col),
                    abs_col: false,
                    abs_row: false,
                },
                pos + 1,
            ))
        }
        Token::Number(n) => {
            // Row half of a full-row range (the 3 of 3:7).
            if *n >= 1.0 && n.fract() == 0.0 && *n <= u32::MAX as f64 {
                Some((
                    Corner {
                        point: Point::new(*n as u32, 0),
                        abs_col: false,
                        abs_row: false,
                    },
                    pos + 1,
                ))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Parse a cell reference or range starting at `pos`, with an optional
/// sheet qualifier already consumed.
fn parse_reference(
    tokens: &[Token],
    pos: usize,
    sheet: Option<String>,
) -> Result<(Entity, usize), FormulaError> {
    let (start, after_start) = match corner_at(tokens, pos) {
        Some(c) => c,
        None => return Err(FormulaError::syntax("expected a value or cell reference")),
    };

    if tokens.get(after_start) == Some(&Token::Colon) {
        if let Some((end, after_end)) = corner_at(tokens, after_start + 1) {
            // Both corners must be the same shape: A1:B2, A:B or 3:7.
            let shape_ok = (start.point.unbounded_row() == end.point.unbounded_row())
                && (start.point.unbounded_col() == end.point.unbounded_col());
            if !shape_ok {
                return Err(FormulaError::syntax("mismatched range corners"));
            }
            return Ok((
                Entity::Range {
                    sheet,
                    start: start.point,
                    end: end.point,
                    start_abs_col: start.abs_col,
                    start_abs_row: start.abs_row,
                    end_abs_col: end.abs_col,
                    end_abs_row: end.abs_row,
                },
                after_end,
            ));
        }
        return Err(FormulaError::syntax("expected a range end after ':'"));
    }

    // A bare corner with a sentinel axis is not a valid standalone ref.
    if start.point.unbounded_row() || start.point.unbounded_col() {
        return Err(FormulaError::syntax("incomplete reference"));
    }

    Ok((
        Entity::Ref {
            sheet,
            point: start.point,
            abs_col: start.abs_col,
            abs_row: start.abs_row,
        },
        after_start,
    ))
}

fn parse_args(tokens: &[Token], mut pos: usize) -> Result<(Vec<Entity>, usize), FormulaError> {
    let mut args = Vec::new();

    if tokens.get(pos) == Some(&Token::RParen) {
        return Ok((args, pos + 1));
    }

    loop {
        // Empty argument slot: IF(a,b,) or IF(a,,c).
        if matches!(tokens.get(pos), Some(Token::Comma | Token::RParen)) {
            args.push(Entity::Value(Value::Empty));
            match tokens.get(pos) {
                Some(Token::RParen) => return Ok((args, pos + 1)),
                Some(Token::Comma) => {
                    pos += 1;
                    continue;
                }
                _ => unreachable!(),
            }
        }

        let (arg, new_pos) = parse_cmp(tokens, pos)?;
        args.push(arg);
        pos = new_pos;

        match tokens.get(pos) {
            Some(Token::RParen) => return Ok((args, pos + 1)),
            Some(Token::Comma) => pos += 1,
            _ => {
                return Err(FormulaError::syntax(
                    "expected ',' or ')' in function call",
                ))
            }
        }
    }
}

fn binop(op: &str, left: Entity, right: Entity) -> Entity {
    Entity::Func {
        name: op.to_string(),
        args: vec![left, right],
    }
}

// =============================================================================
// Canonical source rendering (used when structural edits rewrite formulas)
// =============================================================================

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_entity(self, f)
    }
}

fn write_entity(entity: &Entity, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match entity {
        Entity::Value(v) => write_literal(v, f),
        Entity::Ref {
            sheet,
            point,
            abs_col,
            abs_row,
        } => {
            if let Some(name) = sheet {
                write!(f, "{}!", quote_sheet_name(name))?;
            }
            write_corner(f, *point, *abs_col, *abs_row)
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
            if let Some(name) = sheet {
                write!(f, "{}!", quote_sheet_name(name))?;
            }
            write_corner(f, *start, *start_abs_col, *start_abs_row)?;
            write!(f, ":")?;
            write_corner(f, *end, *end_abs_col, *end_abs_row)
        }
        Entity::Func { name, args } => {
            if let Some(prec) = operator_precedence(name) {
                if args.len() == 2 {
                    write_operand(&args[0], prec, name == "^", f)?;
                    write!(f, "{}", name)?;
                    return write_operand(&args[1], prec, name != "^", f);
                }
                if args.len() == 1 {
                    write!(f, "{}", name)?;
                    return write_operand(&args[0], u8::MAX, true, f);
                }
            }
            write!(f, "{}(", name)?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write_entity(arg, f)?;
            }
            write!(f, ")")
        }
    }
}

/// Write an operand, parenthesizing when its precedence would otherwise
/// re-associate the expression. `wrap_equal` parenthesizes equal-precedence
/// operands (the right side of left-associative operators and the left side
/// of `^`).
fn write_operand(
    arg: &Entity,
    parent_prec: u8,
    wrap_equal: bool,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let needs_parens = match arg {
        Entity::Func { name, args } if args.len() == 2 => match operator_precedence(name) {
            Some(p) => p < parent_prec || (p == parent_prec && wrap_equal),
            None => false,
        },
        _ => false,
    };
    if needs_parens {
        write!(f, "(")?;
        write_entity(arg, f)?;
        write!(f, ")")
    } else {
        write_entity(arg, f)
    }
}

fn write_corner(f: &mut fmt::Formatter<'_>, point: Point, abs_col: bool, abs_row: bool) -> fmt::Result {
    if point.col > 0 {
        if abs_col {
            write!(f, "$")?;
        }
        write!(f, "{}", column_letters(point.col))?;
    }
    if point.row > 0 {
        if abs_row {
            write!(f, "$")?;
        }
        write!(f, "{}", point.row)?;
    }
    Ok(())
}

fn write_literal(v: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match v {
        Value::Empty => Ok(()),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                write!(f, "{}", *n as i64)
            } else {
                write!(f, "{}", n)
            }
        }
        Value::Text(s) => write!(f, "\"{}\"", s),
        Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
        Value::Date(d) => write!(
            f,
            "DATE({},{},{})",
            chrono::Datelike::year(d),
            chrono::Datelike::month(d),
            chrono::Datelike::day(d)
        ),
        Value::Error(e) => write!(f, "{}", e.code.as_str()),
    }
}
