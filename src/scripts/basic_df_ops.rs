//! Built-in table operations available under the `basic_df_ops` package.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value as JsonValue;

use super::{ScriptParams, ScriptRegistry, BUILTIN_PACKAGE};
use crate::error::{Error, Result};
use crate::table::{JoinKind, Table};
use crate::value::Value;

/// Aggregations understood by [`summarise`].
pub const AGGREGATIONS: [&str; 6] = ["n", "n_distinct", "sum", "mean", "min", "max"];

/// Registers every operation of the package.
pub fn register(registry: &mut ScriptRegistry) {
    registry.register(BUILTIN_PACKAGE, "summarise", summarise);
    registry.register(BUILTIN_PACKAGE, "rename_columns", rename_columns);
    registry.register(BUILTIN_PACKAGE, "divide", divide);
    registry.register(BUILTIN_PACKAGE, "multiply", multiply);
    registry.register(BUILTIN_PACKAGE, "remap_term_values", remap_term_values);
    registry.register(BUILTIN_PACKAGE, "ct_cartesian_product", ct_cartesian_product);
    registry.register(BUILTIN_PACKAGE, "select_columns", select_columns);
    registry.register(BUILTIN_PACKAGE, "filter_equals", filter_equals);
    registry.register(BUILTIN_PACKAGE, "sort", sort);
}

fn bad(message: impl Into<String>) -> Error {
    Error::Table(message.into())
}

fn str_param<'p>(params: &'p ScriptParams, key: &str) -> Result<&'p str> {
    params
        .get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| bad(format!("parameter '{key}' must be a string")))
}

fn str_list(params: &ScriptParams, key: &str) -> Result<Vec<String>> {
    match params.get(key) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::String(s)) => Ok(vec![s.clone()]),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| bad(format!("parameter '{key}' must list strings")))
            })
            .collect(),
        Some(other) => Err(bad(format!("parameter '{key}' must be a list, got {other}"))),
    }
}

fn str_map(params: &ScriptParams, key: &str) -> Result<BTreeMap<String, String>> {
    let Some(JsonValue::Object(map)) = params.get(key) else {
        return Err(bad(format!("parameter '{key}' must be an object")));
    };
    map.iter()
        .map(|(k, v)| match v {
            JsonValue::String(s) => Ok((k.clone(), s.clone())),
            other => Ok((k.clone(), other.to_string())),
        })
        .collect()
}

fn column<'t>(table: &'t Table, name: &str) -> Result<Vec<&'t Value>> {
    table
        .column(name)
        .ok_or_else(|| bad(format!("unknown column '{name}'")))
}

/// Aggregates `value_cols` per `by` group.
///
/// `agg` maps aggregation names to output columns (`{"n": "N"}`) or lists
/// aggregation names used as output columns. With several value columns
/// the output is named `<output>_<value column>`.
pub fn summarise(table: Table, params: &ScriptParams) -> Result<Table> {
    let by = str_list(params, "by")?;
    let value_cols = str_list(params, "value_cols")?;
    let aggs: Vec<(String, String)> = match params.get("agg") {
        Some(JsonValue::Object(_)) => str_map(params, "agg")?.into_iter().collect(),
        _ => str_list(params, "agg")?
            .into_iter()
            .map(|a| (a.clone(), a))
            .collect(),
    };
    if aggs.is_empty() {
        return Err(bad("summarise needs at least one aggregation"));
    }
    for (agg, _) in &aggs {
        if !AGGREGATIONS.contains(&agg.as_str()) {
            return Err(bad(format!("unknown aggregation '{agg}'")));
        }
    }
    let targets: Vec<Option<&str>> = if value_cols.is_empty() {
        vec![None]
    } else {
        value_cols.iter().map(|c| Some(c.as_str())).collect()
    };
    let mut columns = by.clone();
    for (_, out) in &aggs {
        for target in &targets {
            columns.push(match target {
                Some(col) if value_cols.len() > 1 => format!("{out}_{col}"),
                _ => out.clone(),
            });
        }
    }
    let present = Value::Bool(true);
    let mut result = Table::new(columns);
    for group in table.group_by(&by)? {
        let mut row = group.key.clone();
        for (agg, _) in &aggs {
            for target in &targets {
                let values: Vec<&Value> = match target {
                    Some(col) => {
                        let idx = table
                            .column_index(col)
                            .ok_or_else(|| bad(format!("unknown column '{col}'")))?;
                        group
                            .rows
                            .iter()
                            .filter_map(|&r| table.row(r).map(|row| &row[idx]))
                            .filter(|v| !v.is_null())
                            .collect()
                    }
                    None => group.rows.iter().map(|_| &present).collect(),
                };
                row.push(aggregate(agg, &values));
            }
        }
        result.push_row(row)?;
    }
    Ok(result)
}

fn aggregate(agg: &str, values: &[&Value]) -> Value {
    let numbers = || values.iter().filter_map(|v| v.as_f64());
    match agg {
        "n" => Value::Int(values.len() as i64),
        "n_distinct" => {
            let distinct: HashSet<_> = values.iter().map(|v| v.key()).collect();
            Value::Int(distinct.len() as i64)
        }
        "sum" if values.iter().all(|v| matches!(v, Value::Int(_))) => Value::Int(
            values
                .iter()
                .filter_map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .sum(),
        ),
        "sum" => Value::Float(numbers().sum()),
        "mean" => {
            let count = numbers().count();
            if count == 0 {
                Value::Null
            } else {
                Value::Float(numbers().sum::<f64>() / count as f64)
            }
        }
        "min" => values
            .iter()
            .min_by(|a, b| a.total_cmp(b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        "max" => values
            .iter()
            .max_by(|a, b| a.total_cmp(b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Renames columns per `mapping`.
pub fn rename_columns(mut table: Table, params: &ScriptParams) -> Result<Table> {
    table.rename_columns(&str_map(params, "mapping")?)?;
    Ok(table)
}

/// `result = numerator / denominator`; null when either side is null or
/// the denominator is zero.
pub fn divide(mut table: Table, params: &ScriptParams) -> Result<Table> {
    let numerator = str_param(params, "numerator")?;
    let denominator = str_param(params, "denominator")?;
    let result = str_param(params, "result")?;
    let values = column(&table, numerator)?
        .into_iter()
        .zip(column(&table, denominator)?)
        .map(|(n, d)| match (n.as_f64(), d.as_f64()) {
            (Some(n), Some(d)) if d != 0.0 => Value::Float(n / d),
            _ => Value::Null,
        })
        .collect();
    table.set_column(result, values)?;
    Ok(table)
}

/// `result = column * factor`.
pub fn multiply(mut table: Table, params: &ScriptParams) -> Result<Table> {
    let source = str_param(params, "column")?;
    let factor = params
        .get("factor")
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| bad("parameter 'factor' must be a number"))?;
    let result = params
        .get("result")
        .and_then(JsonValue::as_str)
        .unwrap_or(source)
        .to_owned();
    let values = column(&table, source)?
        .into_iter()
        .map(|v| v.as_f64().map(|x| Value::Float(x * factor)).unwrap_or(Value::Null))
        .collect();
    table.set_column(result, values)?;
    Ok(table)
}

/// Maps the values of `column` through `mapping` into `target`.
pub fn remap_term_values(table: Table, params: &ScriptParams) -> Result<Table> {
    let source = str_param(params, "column")?.to_owned();
    let target = params
        .get("target")
        .and_then(JsonValue::as_str)
        .unwrap_or(&source)
        .to_owned();
    let mapping = str_map(params, "mapping")?;
    let remove_unmapped = params
        .get("remove_unmapped_rows")
        .and_then(JsonValue::as_bool)
        .unwrap_or(true);
    let mapped = |v: &Value| mapping.get(&v.to_string());
    let mut table = if remove_unmapped {
        column(&table, &source)?;
        table.filter(|row| row.get(&source).map_or(false, |v| mapped(v).is_some()))
    } else {
        table
    };
    let values = column(&table, &source)?
        .into_iter()
        .map(|v| match mapped(v) {
            Some(to) => Value::from(to.as_str()),
            None if target == source => v.clone(),
            None => Value::Null,
        })
        .collect();
    table.set_column(target, values)?;
    Ok(table)
}

/// Adds a row for every combination of the listed controlled terms that the
/// table does not already contain.
pub fn ct_cartesian_product(table: Table, params: &ScriptParams) -> Result<Table> {
    let Some(JsonValue::Object(terms)) = params.get("terms") else {
        return Err(bad("parameter 'terms' must map columns to term lists"));
    };
    let mut cross = Table::new(Vec::<String>::new());
    cross.push_row(Vec::new())?;
    for (col, values) in terms {
        let JsonValue::Array(values) = values else {
            return Err(bad(format!("terms of '{col}' must be a list")));
        };
        let mut columns: Vec<String> = cross.columns().to_vec();
        columns.push(col.clone());
        let mut next = Table::new(columns);
        for row in 0..cross.len() {
            let base = cross.row(row).map(<[Value]>::to_vec).unwrap_or_default();
            for value in values {
                let mut extended = base.clone();
                extended.push(Value::from_json(value));
                next.push_row(extended)?;
            }
        }
        cross = next;
    }
    if cross.columns().is_empty() {
        return Ok(table);
    }
    table.join(&cross, JoinKind::Outer)
}

/// Projects `columns`.
pub fn select_columns(table: Table, params: &ScriptParams) -> Result<Table> {
    table.select(&str_list(params, "columns")?)
}

/// Keeps rows whose `column` equals `value`.
pub fn filter_equals(table: Table, params: &ScriptParams) -> Result<Table> {
    let name = str_param(params, "column")?;
    column(&table, name)?;
    let expected = params.get("value").map(Value::from_json).unwrap_or(Value::Null).key();
    Ok(table.filter(|row| row.get(name).map(Value::key).as_ref() == Some(&expected)))
}

/// Sorts ascending by `by`.
pub fn sort(mut table: Table, params: &ScriptParams) -> Result<Table> {
    table.sort_by(&str_list(params, "by")?)?;
    Ok(table)
}
