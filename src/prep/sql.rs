//! SQL text equivalent to the fitted transforms.
//!
//! Nothing here is executed; the statements are persisted next to each
//! fitted transform so an external query engine can replay them.

use std::collections::BTreeSet;

use crate::{
    stats::values::CategoryValue,
    timeaux::T_ORD_COL,
    transform::FillWindow,
};

/// Name of the source relation in emitted statements.
pub const SOURCE_TABLE: &str = "__THIS__";

/// SQL literal of a double; non-finite values become casts from strings.
pub fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "CAST('NaN' AS DOUBLE)".to_string()
    } else if v.is_infinite() {
        let sign = if v > 0.0 { "" } else { "-" };
        format!("CAST('{sign}Infinity' AS DOUBLE)")
    } else {
        format!("{v:?}")
    }
}

/// `(STRING(c) = 'NaN') OR (c <= lower) OR ...` for the given bounds.
pub fn null_condition(
    column: &str,
    lower: Option<f64>,
    upper: Option<f64>,
    outlier_min: Option<f64>,
    outlier_max: Option<f64>,
) -> String {
    let mut cond = format!("(STRING({column}) = 'NaN')");
    let parts = [
        (lower, "<="),
        (upper, ">="),
        (outlier_min, "<"),
        (outlier_max, ">"),
    ];
    for (bound, op) in parts {
        if let Some(b) = bound {
            cond.push_str(&format!(" OR ({column} {op} {})", float_literal(b)));
        }
    }
    cond
}

/// `CASE WHEN <cond> THEN NULL ELSE c END`.
pub fn nulled(column: &str, cond: &str) -> String {
    format!("CASE WHEN {cond} THEN NULL ELSE {column} END")
}

/// `<func>(CASE WHEN <cond> THEN NULL ELSE c END) OVER <window>`.
pub fn window_aggregate(func: &str, column: &str, cond: &str, window: &str) -> String {
    format!("{func}({}) OVER {window}", nulled(column, cond))
}

/// `COALESCE(CASE WHEN <cond> THEN NULL ELSE c END, <fallbacks>...)`.
pub fn coalesce(column: &str, cond: &str, fallbacks: &[String]) -> String {
    let mut parts = vec![nulled(column, cond)];
    parts.extend(fallbacks.iter().cloned());
    format!("COALESCE({})", parts.join(", "))
}

/// Definition of one named window.
pub fn window_definition(window: FillWindow, index_col: &str) -> String {
    let frame = match window {
        FillWindow::Partition => return format!("{} AS (PARTITION BY {index_col})", window.sql_name()),
        FillWindow::Before => "ROWS BETWEEN UNBOUNDED PRECEDING AND 1 PRECEDING",
        FillWindow::After => "ROWS BETWEEN 1 FOLLOWING AND UNBOUNDED FOLLOWING",
    };
    format!(
        "{} AS (PARTITION BY {index_col} ORDER BY {T_ORD_COL} {frame})",
        window.sql_name()
    )
}

/// `WINDOW a AS (...), b AS (...)`, or `None` when no window is used.
pub fn window_clause(windows: &BTreeSet<FillWindow>, index_col: &str) -> Option<String> {
    if windows.is_empty() {
        return None;
    }
    let defs: Vec<String> = windows
        .iter()
        .map(|w| window_definition(*w, index_col))
        .collect();
    Some(format!("WINDOW {}", defs.join(", ")))
}

/// `SELECT *, <expr> AS <name>, ... FROM __THIS__ [<clause>]`.
pub fn select_statement(items: &[(String, String)], clause: Option<&str>) -> String {
    let mut select = String::from("SELECT *");
    for (expr, name) in items {
        select.push_str(&format!(", {expr} AS {name}"));
    }
    select.push_str(&format!(" FROM {SOURCE_TABLE}"));
    if let Some(clause) = clause {
        select.push(' ');
        select.push_str(clause);
    }
    select
}

/// SQL literal of a category value.
pub fn literal(value: &CategoryValue) -> String {
    match value {
        CategoryValue::Null => "NULL".to_string(),
        CategoryValue::Bool(b) => b.to_string().to_uppercase(),
        CategoryValue::Int(i) => i.to_string(),
        CategoryValue::Float(f) => float_literal(*f),
        CategoryValue::Str(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

/// `CASE WHEN (c = 'A') THEN 0 ... ELSE n END`.
pub fn category_index(column: &str, cats: &[CategoryValue]) -> String {
    if cats == [CategoryValue::Bool(false), CategoryValue::Bool(true)] {
        return format!("CASE WHEN {column} IS NULL THEN 2 WHEN {column} THEN 1 ELSE 0 END");
    }
    let mut expr = String::from("CASE");
    for (i, cat) in cats.iter().enumerate() {
        let cond = match cat {
            CategoryValue::Float(_) => format!("(ABS({column} - {}) < 1e-6)", literal(cat)),
            _ => format!("({column} = {})", literal(cat)),
        };
        expr.push_str(&format!(" WHEN {cond} THEN {i}"));
    }
    expr.push_str(&format!(" ELSE {} END", cats.len()));
    expr
}
