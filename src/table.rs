//! In-memory tabular context threaded through a pipeline run.
//!
//! A [`Table`] is an ordered list of named columns with row-major storage.
//! It offers the primitive operations actions and scripts rely on: project,
//! filter, group, sort, natural join and record serialization.
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::value::{Value, ValueKey};

/// Row as a column-name keyed map.
pub type Record = BTreeMap<String, Value>;

/// Join flavour for [`Table::join`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinKind {
    /// Keep only rows with a match on both sides.
    Inner,
    /// Keep unmatched rows from both sides, padding with nulls.
    Outer,
}

/// Ordered table of named columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Borrowed view of one row.
#[derive(Clone, Copy, Debug)]
pub struct RowRef<'a> {
    table: &'a Table,
    index: usize,
}

impl<'a> RowRef<'a> {
    /// Value of `column` in this row.
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.table.get(self.index, column)
    }

    /// Position of the row in its table.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Rows sharing one grouping key.
#[derive(Clone, Debug)]
pub struct Group {
    /// Key values in `by` order.
    pub key: Vec<Value>,
    /// Row indices belonging to the group.
    pub rows: Vec<usize>,
}

impl Table {
    /// Creates an empty table with the given columns.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Table with no columns and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a table from row vectors, checking their width.
    pub fn from_rows<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Value>>,
    ) -> Result<Self> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Builds a table from records. Columns follow first appearance.
    pub fn from_records(records: &[Record]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for name in record.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    /// Builds a table from a JSON array of objects.
    pub fn from_json_records(records: &[JsonValue]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(records.len());
        for record in records {
            let JsonValue::Object(map) = record else {
                return Err(Error::Table(format!("expected an object per row, got {record}")));
            };
            parsed.push(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect::<Record>(),
            );
        }
        Ok(Self::from_records(&parsed))
    }

    /// Column names in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates over rows.
    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        (0..self.rows.len()).map(move |index| RowRef { table: self, index })
    }

    /// Raw row slice.
    pub fn row(&self, index: usize) -> Option<&[Value]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Position of a column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// True when the column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Values of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Cell lookup.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Appends a row; its width must match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Table(format!(
                "row has {} values but table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Replaces an existing column or appends a new one.
    pub fn set_column(&mut self, name: impl Into<String>, values: Vec<Value>) -> Result<()> {
        let name = name.into();
        if values.len() != self.rows.len() {
            return Err(Error::Table(format!(
                "column '{name}' has {} values but table has {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        match self.column_index(&name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name);
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
        Ok(())
    }

    /// Renames columns; unknown source names are ignored.
    pub fn rename_columns(&mut self, mapping: &BTreeMap<String, String>) -> Result<()> {
        for (from, to) in mapping {
            if let Some(idx) = self.column_index(from) {
                if from != to && self.has_column(to) {
                    return Err(Error::Table(format!(
                        "cannot rename '{from}' to existing column '{to}'"
                    )));
                }
                self.columns[idx] = to.clone();
            }
        }
        Ok(())
    }

    /// Removes columns by name; unknown names are ignored.
    pub fn drop_columns(&mut self, names: &[&str]) {
        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !names.contains(&c.as_str()))
            .map(|(i, _)| i)
            .collect();
        self.columns = keep.iter().map(|&i| self.columns[i].clone()).collect();
        for row in &mut self.rows {
            *row = keep.iter().map(|&i| row[i].clone()).collect();
        }
    }

    /// Projects the named columns, in the given order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Table> {
        let mut idxs = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            idxs.push(
                self.column_index(name)
                    .ok_or_else(|| Error::Table(format!("unknown column '{name}'")))?,
            );
        }
        Ok(Table {
            columns: names.iter().map(|n| n.as_ref().to_owned()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| idxs.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        })
    }

    /// Keeps rows matching the predicate.
    pub fn filter<F>(&self, predicate: F) -> Table
    where
        F: Fn(RowRef<'_>) -> bool,
    {
        let rows = self
            .rows()
            .filter(|row| predicate(*row))
            .map(|row| self.rows[row.index].clone())
            .collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Stable sort by the given columns, ascending.
    pub fn sort_by<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        let mut idxs = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            idxs.push(
                self.column_index(name)
                    .ok_or_else(|| Error::Table(format!("unknown column '{name}'")))?,
            );
        }
        self.rows.sort_by(|a, b| {
            idxs.iter()
                .map(|&i| a[i].total_cmp(&b[i]))
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    /// Groups rows by the given columns. Groups are ordered by key.
    pub fn group_by<S: AsRef<str>>(&self, by: &[S]) -> Result<Vec<Group>> {
        let mut idxs = Vec::with_capacity(by.len());
        for name in by {
            let name = name.as_ref();
            idxs.push(
                self.column_index(name)
                    .ok_or_else(|| Error::Table(format!("unknown column '{name}'")))?,
            );
        }
        let mut slots: HashMap<Vec<ValueKey>, usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        for (row_idx, row) in self.rows.iter().enumerate() {
            let key: Vec<ValueKey> = idxs.iter().map(|&i| row[i].key()).collect();
            let slot = *slots.entry(key).or_insert_with(|| {
                groups.push(Group {
                    key: idxs.iter().map(|&i| row[i].clone()).collect(),
                    rows: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].rows.push(row_idx);
        }
        groups.sort_by(|a, b| {
            a.key
                .iter()
                .zip(&b.key)
                .map(|(x, y)| x.total_cmp(y))
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(groups)
    }

    /// Natural join on every column present in both tables.
    ///
    /// Null keys never match. With [`JoinKind::Outer`] unmatched rows from
    /// either side are kept with nulls in the other side's columns.
    pub fn join(&self, other: &Table, kind: JoinKind) -> Result<Table> {
        let shared: Vec<&String> = self
            .columns
            .iter()
            .filter(|c| other.has_column(c))
            .collect();
        if shared.is_empty() {
            return Err(Error::Table("natural join needs at least one shared column".into()));
        }
        let left_key: Vec<usize> = shared.iter().filter_map(|c| self.column_index(c)).collect();
        let right_key: Vec<usize> = shared.iter().filter_map(|c| other.column_index(c)).collect();
        let right_rest: Vec<usize> = (0..other.columns.len())
            .filter(|i| !right_key.contains(i))
            .collect();

        let mut index: HashMap<Vec<ValueKey>, Vec<usize>> = HashMap::new();
        for (i, row) in other.rows.iter().enumerate() {
            if right_key.iter().any(|&k| row[k].is_null()) {
                continue;
            }
            index
                .entry(right_key.iter().map(|&k| row[k].key()).collect())
                .or_default()
                .push(i);
        }

        let mut columns = self.columns.clone();
        columns.extend(right_rest.iter().map(|&i| other.columns[i].clone()));
        let mut rows = Vec::new();
        let mut right_matched = vec![false; other.rows.len()];
        for row in &self.rows {
            let matches = if left_key.iter().any(|&k| row[k].is_null()) {
                None
            } else {
                index.get(&left_key.iter().map(|&k| row[k].key()).collect::<Vec<_>>())
            };
            match matches {
                Some(hits) => {
                    for &hit in hits {
                        right_matched[hit] = true;
                        let mut combined = row.clone();
                        combined.extend(right_rest.iter().map(|&i| other.rows[hit][i].clone()));
                        rows.push(combined);
                    }
                }
                None if kind == JoinKind::Outer => {
                    let mut combined = row.clone();
                    combined.extend(right_rest.iter().map(|_| Value::Null));
                    rows.push(combined);
                }
                None => {}
            }
        }
        if kind == JoinKind::Outer {
            for (i, matched) in right_matched.iter().enumerate() {
                if *matched {
                    continue;
                }
                let right = &other.rows[i];
                let mut combined: Vec<Value> = self
                    .columns
                    .iter()
                    .map(|c| {
                        other
                            .column_index(c)
                            .map(|idx| right[idx].clone())
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                combined.extend(right_rest.iter().map(|&idx| right[idx].clone()));
                rows.push(combined);
            }
        }
        Ok(Table { columns, rows })
    }

    /// Row-wise records.
    pub fn to_records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    /// Row-wise JSON objects, as passed to stores and remote services.
    pub fn to_json_records(&self) -> Vec<JsonValue> {
        self.rows
            .iter()
            .map(|row| {
                JsonValue::Object(
                    self.columns
                        .iter()
                        .cloned()
                        .zip(row.iter().map(Value::to_json))
                        .collect(),
                )
            })
            .collect()
    }

    /// Writes the table as CSV with a header row.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut out = csv::Writer::from_writer(writer);
        out.write_record(&self.columns)?;
        for row in &self.rows {
            out.write_record(row.iter().map(|v| v.to_string()))?;
        }
        out.flush()?;
        Ok(())
    }
}
