//! Merge stage: left-join per-table outputs into one wide dataset
//!
//! The base table is the input with the most distinct entity identifiers (ties
//! go to the earlier input). Every other input is left-joined onto it in input
//! order, keyed by entity identifier, plus date when both sides are time-varying
//! and declare a date field.
//!
//! Join semantics follow a relational left join: every base row survives, a key
//! with several right-side matches yields one output row per match, and a key
//! with none gets explicit nulls. Null keys never match. A column name already
//! present in the output is renamed `<column>_<short_name>`.

use crate::catalog::TableSpec;
use crate::output::{read_table, OutputError};
use crate::{Record, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// One table participating in a merge
#[derive(Debug, Clone)]
pub struct MergeInput {
    /// Catalog short name, used for collision suffixes
    pub short_name: String,
    /// Entity identifier column
    pub entity_field: String,
    /// Date key column, when declared
    pub date_field: Option<String>,
    /// Whether the table is time-varying
    pub time_varying: bool,
    /// Columns in output order
    pub columns: Vec<String>,
    /// Rows
    pub rows: Vec<Record>,
}

impl MergeInput {
    /// Input built from a catalog spec and in-memory rows
    pub fn new(spec: &TableSpec, columns: Vec<String>, rows: Vec<Record>) -> Self {
        Self {
            short_name: spec.short_name.clone(),
            entity_field: spec.entity_column().to_string(),
            date_field: spec.date_column().map(str::to_string),
            time_varying: spec.time_varying,
            columns,
            rows,
        }
    }

    /// Input read back from a per-table CSV file
    pub fn from_csv(spec: &TableSpec, path: &Path) -> Result<Self, MergeError> {
        let table = read_table(path).map_err(|e| MergeError::Input {
            table: spec.short_name.clone(),
            source: e,
        })?;
        Ok(Self::new(spec, table.columns, table.rows))
    }

    /// Number of distinct non-null entity identifiers
    pub fn distinct_entities(&self) -> usize {
        self.rows
            .iter()
            .filter_map(|row| key_part(row.get(&self.entity_field)))
            .collect::<HashSet<_>>()
            .len()
    }

    fn date_key(&self) -> Option<&str> {
        if self.time_varying {
            self.date_field.as_deref()
        } else {
            None
        }
    }
}

/// Result of a merge
#[derive(Debug, Clone)]
pub struct MergedDataset {
    /// Base table short name
    pub base_table: String,
    /// Tables in join order, base first
    pub tables: Vec<String>,
    /// Base key columns (entity, then date when used)
    pub key_columns: Vec<String>,
    /// Output columns in order
    pub columns: Vec<String>,
    /// Output rows; every row has every column
    pub rows: Vec<Record>,
}

/// Merge errors
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// Nothing to merge
    #[error("no tables available to merge")]
    NoInputs,

    /// An input could not be read
    #[error("failed to read merge input '{table}': {source}")]
    Input {
        /// Short name of the input
        table: String,
        /// Underlying error
        #[source]
        source: OutputError,
    },

    /// The merged file could not be written
    #[error("failed to write merged file: {0}")]
    Output(#[from] OutputError),
}

/// Join key component: strings as-is, numbers and booleans rendered, null and empty as no key
fn key_part(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn row_key(row: &Record, fields: &[&str]) -> Option<Vec<String>> {
    fields.iter().map(|f| key_part(row.get(*f))).collect()
}

/// Left-join `inputs` into one dataset
pub fn merge(inputs: Vec<MergeInput>) -> Result<MergedDataset, MergeError> {
    if inputs.is_empty() {
        return Err(MergeError::NoInputs);
    }

    let mut base_index = 0;
    let mut base_entities = 0;
    for (index, input) in inputs.iter().enumerate() {
        let entities = input.distinct_entities();
        debug!(table = %input.short_name, entities, "Merge input");
        if index == 0 || entities > base_entities {
            base_index = index;
            base_entities = entities;
        }
    }

    let mut inputs = inputs;
    let base = inputs.remove(base_index);
    info!(
        base = %base.short_name,
        entities = base_entities,
        others = inputs.len(),
        "Merging tables"
    );

    let mut columns = base.columns.clone();
    let mut column_set: HashSet<String> = columns.iter().cloned().collect();
    let mut rows: Vec<Record> = base
        .rows
        .into_iter()
        .map(|mut row| {
            for column in &columns {
                row.entry(column.clone()).or_insert(Value::Null);
            }
            row
        })
        .collect();

    let base_date = base.date_field.clone().filter(|_| base.time_varying);
    let mut key_columns = vec![base.entity_field.clone()];
    if let Some(date) = &base_date {
        key_columns.push(date.clone());
    }
    let mut tables = vec![base.short_name.clone()];

    for right in inputs {
        // Date joins only apply when both sides carry a date key
        let join_on_date = base_date.is_some() && right.date_key().is_some();
        let mut left_fields: Vec<&str> = vec![base.entity_field.as_str()];
        let mut right_fields: Vec<&str> = vec![right.entity_field.as_str()];
        if join_on_date {
            if let (Some(left_date), Some(right_date)) = (base_date.as_deref(), right.date_key()) {
                left_fields.push(left_date);
                right_fields.push(right_date);
            }
        }

        // Output names for the right side's non-key columns
        let mut renames: Vec<(String, String)> = Vec::new();
        for column in &right.columns {
            if right_fields.contains(&column.as_str()) {
                continue;
            }
            let mut name = column.clone();
            if column_set.contains(&name) {
                name = format!("{column}_{}", right.short_name);
                let mut n = 2;
                while column_set.contains(&name) {
                    name = format!("{column}_{}_{n}", right.short_name);
                    n += 1;
                }
            }
            column_set.insert(name.clone());
            columns.push(name.clone());
            renames.push((column.clone(), name));
        }

        let mut index: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
        for (i, row) in right.rows.iter().enumerate() {
            if let Some(key) = row_key(row, &right_fields) {
                index.entry(key).or_default().push(i);
            }
        }

        let mut joined = Vec::with_capacity(rows.len());
        let mut matched = 0usize;
        for row in rows {
            let matches = row_key(&row, &left_fields).and_then(|key| index.get(&key));
            match matches {
                Some(hits) => {
                    matched += 1;
                    for &hit in hits {
                        let mut out = row.clone();
                        let source = &right.rows[hit];
                        for (from, to) in &renames {
                            let value = source.get(from).cloned().unwrap_or(Value::Null);
                            out.insert(to.clone(), value);
                        }
                        joined.push(out);
                    }
                }
                None => {
                    let mut out = row;
                    for (_, to) in &renames {
                        out.insert(to.clone(), Value::Null);
                    }
                    joined.push(out);
                }
            }
        }

        debug!(
            table = %right.short_name,
            join_on_date,
            matched_rows = matched,
            output_rows = joined.len(),
            "Joined table"
        );
        rows = joined;
        tables.push(right.short_name);
    }

    Ok(MergedDataset {
        base_table: base.short_name,
        tables,
        key_columns,
        columns,
        rows,
    })
}
