use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use regex::Regex;
use serde_json::json;

use super::require_array;
use crate::{
    row::{numeric_value, value_text, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "expression";

/// Derived columns from small expressions. Column references use `{col}`
/// placeholders; `type` picks the evaluator (`math`, `string`, `date`) or
/// `auto` infers it from the expression text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionTransformation;

impl Transformation for ExpressionTransformation {
    fn type_name(&self) -> &'static str {
        "expression"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let expressions = require_array(config, "expressions", OPERATOR)?;
        if expressions.is_empty() {
            return Err(TransformError::invalid(OPERATOR, "expressions is empty"));
        }
        for spec in expressions {
            if spec.get("target_column").and_then(Value::as_str).is_none() {
                return Err(TransformError::invalid(OPERATOR, "expression needs a target_column"));
            }
            if spec.get("expression").and_then(Value::as_str).is_none() {
                return Err(TransformError::invalid(OPERATOR, "expression text is required"));
            }
            if let Some(kind) = spec.get("type").and_then(Value::as_str) {
                if !matches!(kind, "auto" | "math" | "string" | "date") {
                    return Err(TransformError::invalid(
                        OPERATOR,
                        format!("invalid expression type: {kind}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let expressions = require_array(config, "expressions", OPERATOR)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut output = row;
            for spec in expressions {
                let target = spec
                    .get("target_column")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let text = spec
                    .get("expression")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let kind = spec.get("type").and_then(Value::as_str).unwrap_or("auto");
                let value = evaluate(&output, text, kind);
                output.insert(target.to_string(), value);
            }
            out.push(output);
        }
        Ok(out)
    }
}

fn evaluate(row: &Row, expression: &str, kind: &str) -> Value {
    let kind = if kind == "auto" {
        infer_kind(expression)
    } else {
        kind
    };
    match kind {
        "math" => evaluate_math(row, expression),
        "date" => evaluate_date(row, expression),
        _ => evaluate_string(row, expression),
    }
}

/// Mirror of the config-free inference: arithmetic operators make it math,
/// the known string functions make it string, the date functions date, and
/// anything else is treated as a string template.
fn infer_kind(expression: &str) -> &'static str {
    let upper = expression.to_uppercase();
    if ["DATEADD", "DATEDIFF", "DATEPART"]
        .iter()
        .any(|f| upper.contains(f))
    {
        return "date";
    }
    if ["UPPER", "LOWER", "TRIM", "CONCAT", "REGEX_REPLACE", "SPLIT"]
        .iter()
        .any(|f| upper.contains(f))
    {
        return "string";
    }
    if expression.contains(['+', '-', '*', '/']) {
        return "math";
    }
    "string"
}

/// Substitute `{col}` placeholders with the row's values.
fn substitute(row: &Row, expression: &str, for_math: bool) -> String {
    let mut result = String::with_capacity(expression.len());
    let mut rest = expression;
    while let Some(open) = rest.find('{') {
        result.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        match tail.find('}') {
            Some(close) => {
                let column = &tail[..close];
                let replacement = match row.get(column) {
                    Some(value) if for_math => {
                        numeric_value(value).map_or_else(|| "0".to_string(), |n| n.to_string())
                    }
                    Some(value) => value_text(value),
                    None if for_math => "0".to_string(),
                    None => String::new(),
                };
                result.push_str(&replacement);
                rest = &tail[close + 1..];
            }
            None => {
                result.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn evaluate_math(row: &Row, expression: &str) -> Value {
    let substituted = substitute(row, expression, true);
    match MathParser::new(&substituted).parse() {
        Some(result) => json!(result),
        None => Value::Null,
    }
}

/// Minimal arithmetic parser: + - * / with precedence, parentheses, unary
/// minus.
struct MathParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> MathParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Option<f64> {
        let value = self.expr()?;
        self.skip_spaces();
        if self.pos == self.input.len() {
            Some(value)
        } else {
            None
        }
    }

    fn skip_spaces(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn expr(&mut self) -> Option<f64> {
        let mut left = self.term()?;
        loop {
            self.skip_spaces();
            match self.input.get(self.pos) {
                Some(b'+') => {
                    self.pos += 1;
                    left += self.term()?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    left -= self.term()?;
                }
                _ => return Some(left),
            }
        }
    }

    fn term(&mut self) -> Option<f64> {
        let mut left = self.factor()?;
        loop {
            self.skip_spaces();
            match self.input.get(self.pos) {
                Some(b'*') => {
                    self.pos += 1;
                    left *= self.factor()?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    left /= divisor;
                }
                _ => return Some(left),
            }
        }
    }

    fn factor(&mut self) -> Option<f64> {
        self.skip_spaces();
        match self.input.get(self.pos)? {
            b'(' => {
                self.pos += 1;
                let value = self.expr()?;
                self.skip_spaces();
                if self.input.get(self.pos) == Some(&b')') {
                    self.pos += 1;
                    Some(value)
                } else {
                    None
                }
            }
            b'-' => {
                self.pos += 1;
                Some(-self.factor()?)
            }
            _ => self.number(),
        }
    }

    fn number(&mut self) -> Option<f64> {
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit() || *c == b'.')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()?
            .parse()
            .ok()
    }
}

fn column_value(row: &Row, column: &str) -> String {
    row.get(column).map(value_text).unwrap_or_default()
}

static UPPER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^UPPER\((\w+)\)$").expect("static regex"));
static LOWER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^LOWER\((\w+)\)$").expect("static regex"));
static TRIM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^TRIM\((\w+)\)$").expect("static regex"));
static CONCAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^CONCAT\(([^)]+)\)$").expect("static regex"));
static REPLACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^REGEX_REPLACE\((\w+),\s*'([^']*)',\s*'([^']*)'\)$").expect("static regex")
});
static SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^SPLIT\((\w+),\s*'([^']*)'\)$").expect("static regex"));

fn evaluate_string(row: &Row, expression: &str) -> Value {
    let trimmed = expression.trim();
    if let Some(captures) = UPPER_RE.captures(trimmed) {
        return json!(column_value(row, &captures[1]).to_uppercase());
    }
    if let Some(captures) = LOWER_RE.captures(trimmed) {
        return json!(column_value(row, &captures[1]).to_lowercase());
    }
    if let Some(captures) = TRIM_RE.captures(trimmed) {
        return json!(column_value(row, &captures[1]).trim());
    }
    if let Some(captures) = CONCAT_RE.captures(trimmed) {
        let mut result = String::new();
        for part in captures[1].split(',') {
            let part = part.trim();
            if let Some(literal) = part.strip_prefix('\'').and_then(|p| p.strip_suffix('\'')) {
                result.push_str(literal);
            } else {
                result.push_str(&column_value(row, part));
            }
        }
        return json!(result);
    }
    if let Some(captures) = REPLACE_RE.captures(trimmed) {
        let value = column_value(row, &captures[1]);
        return match Regex::new(&captures[2]) {
            Ok(pattern) => json!(pattern.replace_all(&value, &captures[3]).into_owned()),
            Err(_) => Value::Null,
        };
    }
    if let Some(captures) = SPLIT_RE.captures(trimmed) {
        let value = column_value(row, &captures[1]);
        let parts: Vec<Value> = value.split(&captures[2]).map(|p| json!(p)).collect();
        return Value::Array(parts);
    }
    // No function matched: treat the expression as a template.
    json!(substitute(row, expression, false))
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

static DATEADD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^DATEADD\((\w+),\s*(-?\d+)\)$").expect("static regex"));
static DATEDIFF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^DATEDIFF\((\w+),\s*(\w+)\)$").expect("static regex"));
static DATEPART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^DATEPART\((\w+),\s*'(\w+)'\)$").expect("static regex"));

fn evaluate_date(row: &Row, expression: &str) -> Value {
    let trimmed = expression.trim();
    if let Some(captures) = DATEADD_RE.captures(trimmed) {
        let Some(datetime) = parse_datetime(&column_value(row, &captures[1])) else {
            return Value::Null;
        };
        let days: i64 = captures[2].parse().unwrap_or(0);
        let shifted = datetime + chrono::Duration::days(days);
        return json!(shifted.format("%Y-%m-%d").to_string());
    }
    if let Some(captures) = DATEDIFF_RE.captures(trimmed) {
        let a = parse_datetime(&column_value(row, &captures[1]));
        let b = parse_datetime(&column_value(row, &captures[2]));
        return match (a, b) {
            (Some(a), Some(b)) => json!((a - b).num_days()),
            _ => Value::Null,
        };
    }
    if let Some(captures) = DATEPART_RE.captures(trimmed) {
        let Some(datetime) = parse_datetime(&column_value(row, &captures[1])) else {
            return Value::Null;
        };
        let part = captures[2].to_lowercase();
        return match part.as_str() {
            "year" => json!(datetime.year()),
            "month" => json!(datetime.month()),
            "day" => json!(datetime.day()),
            "hour" => json!(datetime.hour()),
            "minute" => json!(datetime.minute()),
            "second" => json!(datetime.second()),
            _ => Value::Null,
        };
    }
    Value::Null
}
