//! Table schemas for the write path.
//!
//! Records written through `floe write` are checked against the configured
//! column list before they reach the broker, so the bulk load rarely has to
//! spend its error budget on malformed rows.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::warn;

use crate::config::validate_identifier;
use crate::error::{ConfigError, InvalidColumnTypeSnafu};

static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$").expect("timestamp pattern is valid")
});

static DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date pattern is valid"));

/// Reasons a record is refused.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    #[snafu(display("Key {key} is not a column of {table}"))]
    UnknownColumn { table: String, key: String },

    #[snafu(display("Column {column} of {table} is not null but missing"))]
    MissingColumn { table: String, column: String },

    #[snafu(display("Value {value} for column {column} does not conform to type {column_type}"))]
    TypeMismatch {
        column: String,
        value: String,
        column_type: ColumnType,
    },
}

/// Supported warehouse column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Decimal,
    Real,
    DoublePrecision,
    Boolean,
    Char(usize),
    Varchar(usize),
    Date,
    Timestamp,
}

impl FromStr for ColumnType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let (name, width) = match lowered.split_once('(') {
            Some((name, rest)) => (name.trim(), rest.strip_suffix(')').map(str::trim)),
            None => (lowered.as_str(), None),
        };

        let parsed = match (name, width) {
            ("smallint" | "int2", None) => ColumnType::SmallInt,
            ("integer" | "int" | "int4", None) => ColumnType::Integer,
            ("bigint" | "int8", None) => ColumnType::BigInt,
            ("decimal" | "numeric", _) => ColumnType::Decimal,
            ("real" | "float4", None) => ColumnType::Real,
            ("double precision" | "float8" | "float", None) => ColumnType::DoublePrecision,
            ("boolean" | "bool", None) => ColumnType::Boolean,
            ("char" | "character", Some(n)) => ColumnType::Char(n.parse().map_err(|_| ())?),
            ("char" | "character", None) => ColumnType::Char(1),
            ("varchar" | "character varying", Some(n)) => {
                ColumnType::Varchar(n.parse().map_err(|_| ())?)
            }
            ("varchar" | "character varying", None) => ColumnType::Varchar(256),
            ("date", None) => ColumnType::Date,
            ("timestamp", None) => ColumnType::Timestamp,
            _ => return Err(()),
        };
        Ok(parsed)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::SmallInt => write!(f, "smallint"),
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Decimal => write!(f, "decimal"),
            ColumnType::Real => write!(f, "real"),
            ColumnType::DoublePrecision => write!(f, "double precision"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Char(n) => write!(f, "char({n})"),
            ColumnType::Varchar(n) => write!(f, "varchar({n})"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Timestamp => write!(f, "timestamp"),
        }
    }
}

fn is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

impl ColumnType {
    /// Check `value` and return the value to store.
    fn check(&self, column: &str, value: &Value) -> Result<Value, ValidationError> {
        let accepted = match (self, value) {
            (ColumnType::SmallInt, Value::Number(n)) => n
                .as_i64()
                .is_some_and(|v| i16::try_from(v).is_ok()),
            (ColumnType::Integer, Value::Number(n)) => {
                n.as_i64().is_some_and(|v| i32::try_from(v).is_ok())
            }
            (ColumnType::BigInt, Value::Number(n)) => n.is_i64(),
            (ColumnType::Decimal, Value::String(_)) => is_numeric(value),
            (ColumnType::Real | ColumnType::DoublePrecision, _) => is_numeric(value),
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Char(width) | ColumnType::Varchar(width), Value::String(s)) => {
                if s.chars().count() > *width {
                    warn!(
                        column,
                        width,
                        length = s.chars().count(),
                        "Value too long for column; truncating"
                    );
                    return Ok(Value::String(s.chars().take(*width).collect()));
                }
                true
            }
            (ColumnType::Date, Value::String(s)) => DATE.is_match(s),
            (ColumnType::Timestamp, Value::String(s)) => TIMESTAMP.is_match(s),
            _ => false,
        };

        ensure!(
            accepted,
            TypeMismatchSnafu {
                column,
                value: value.to_string(),
                column_type: *self,
            }
        );
        Ok(value.clone())
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Extra DDL constraint such as `not null`.
    #[serde(default)]
    pub constraint: Option<String>,
}

impl ColumnSpec {
    pub fn column_type(&self) -> Result<ColumnType, ConfigError> {
        self.type_name.parse().map_err(|()| {
            InvalidColumnTypeSnafu {
                column: self.name.clone(),
                type_name: self.type_name.clone(),
            }
            .build()
        })
    }

    fn is_not_null(&self) -> bool {
        self.constraint
            .as_deref()
            .is_some_and(|c| c.trim().eq_ignore_ascii_case("not null"))
    }
}

/// Column list plus physical attributes of a warehouse table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub distkey: Option<String>,
    #[serde(default)]
    pub sortkey: Option<String>,
}

impl TableSchema {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for column in &self.columns {
            validate_identifier(&column.name)?;
            column.column_type()?;
        }
        for key in self.distkey.iter().chain(self.sortkey.iter()) {
            validate_identifier(key)?;
        }
        Ok(())
    }

    /// Validate a record for `table`, returning the cleaned record.
    pub fn validate_record(
        &self,
        table: &str,
        record: Map<String, Value>,
    ) -> Result<Map<String, Value>, ValidationError> {
        for key in record.keys() {
            ensure!(
                self.columns.iter().any(|c| &c.name == key),
                UnknownColumnSnafu { table, key }
            );
        }

        let mut cleaned = Map::with_capacity(record.len());
        for column in &self.columns {
            match record.get(&column.name) {
                Some(value) => {
                    // Types were checked by `validate` when the config loaded.
                    let column_type = column.column_type().unwrap_or(ColumnType::Varchar(65535));
                    cleaned.insert(column.name.clone(), column_type.check(&column.name, value)?);
                }
                None => ensure!(
                    !column.is_not_null(),
                    MissingColumnSnafu {
                        table,
                        column: &column.name
                    }
                ),
            }
        }
        Ok(cleaned)
    }

    /// Render `CREATE TABLE` for this schema.
    pub fn ddl(&self, table: &str) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| match &c.constraint {
                Some(constraint) => format!("  {} {} {}", c.name, c.type_name, constraint),
                None => format!("  {} {}", c.name, c.type_name),
            })
            .collect();

        let mut ddl = format!("CREATE TABLE {table} (\n{}\n)", columns.join(",\n"));
        if let Some(distkey) = &self.distkey {
            ddl.push_str(&format!("\nDISTKEY({distkey})"));
        }
        if let Some(sortkey) = &self.sortkey {
            ddl.push_str(&format!("\nSORTKEY({sortkey})"));
        }
        ddl.push(';');
        ddl
    }
}
