//! Target row schema and typed row values.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::fmt;

/// Column stamped with the wall clock on every normalized row.
pub const LAST_UPDATED: &str = "last_updated";

static NULL_VALUE: FieldValue = FieldValue::Null;

/// Storage type of a column. Decimal places are part of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Date,
    Timestamp,
    /// Whole number, rounded to nearest on coercion
    Integer,
    /// Real number rounded to `scale` decimal places
    Real { scale: u32 },
}

/// One column of a target relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    /// Rows missing this value are rejected by the normalizer
    pub required: bool,
}

impl ColumnSpec {
    fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, ColumnKind::Date)
    }

    pub fn timestamp(name: &str) -> Self {
        Self::new(name, ColumnKind::Timestamp)
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnKind::Integer)
    }

    pub fn real(name: &str, scale: u32) -> Self {
        Self::new(name, ColumnKind::Real { scale })
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Shape of a target relation: columns plus the natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub key_columns: Vec<String>,
}

impl TableSchema {
    /// Build a schema. Key columns are marked required and a
    /// [`LAST_UPDATED`] timestamp column is appended when absent.
    pub fn new(name: &str, columns: Vec<ColumnSpec>, key_columns: &[&str]) -> Self {
        let keys: Vec<String> = key_columns.iter().map(|k| k.to_string()).collect();
        let mut columns: Vec<ColumnSpec> = columns
            .into_iter()
            .map(|mut c| {
                if keys.contains(&c.name) {
                    c.required = true;
                }
                c
            })
            .collect();

        if !columns.iter().any(|c| c.name == LAST_UPDATED) {
            columns.push(ColumnSpec::timestamp(LAST_UPDATED).required());
        }

        Self {
            name: name.to_string(),
            columns,
            key_columns: keys,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn key_names(&self) -> Vec<&str> {
        self.key_columns.iter().map(String::as_str).collect()
    }

    /// Name of the intermediate relation used for staged backfills.
    pub fn staging_name(&self) -> String {
        format!("{}_staging", self.name)
    }
}

/// A typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Real(f64),
    Integer(i64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Text(s) => write!(f, "{}", s),
            Self::Real(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.3f")),
        }
    }
}

/// A normalized record ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Work unit that produced this row
    pub unit_id: String,
    pub values: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            values: BTreeMap::new(),
        }
    }

    /// Value of `column`, or `Null` when absent.
    pub fn get(&self, column: &str) -> &FieldValue {
        self.values.get(column).unwrap_or(&NULL_VALUE)
    }

    pub fn set(&mut self, column: impl Into<String>, value: FieldValue) {
        self.values.insert(column.into(), value);
    }

    /// Natural key rendered as strings, in key-column order.
    pub fn natural_key(&self, key_columns: &[String]) -> Vec<String> {
        key_columns
            .iter()
            .map(|k| self.get(k).to_string())
            .collect()
    }
}
