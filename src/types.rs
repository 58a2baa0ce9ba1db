use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A primitive SQL value, used both for bound parameters and result rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(b) if *b => write!(f, "TRUE"),
            Self::Boolean(_) => write!(f, "FALSE"),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

/// A row of values
pub type Row = Vec<Value>;

/// Result column names
pub type Columns = Vec<String>;

/// A forward-only row iterator. Restarting it requires re-executing the statement.
pub type Rows = Box<dyn Iterator<Item = Row> + Send>;

/// The result of a statement executed through a connection.
pub enum ResultSet {
    /// Rows returned by a query.
    Query { columns: Columns, rows: Rows },
    /// Number of rows affected by a DML statement.
    Update { count: u64 },
    /// Per-statement row counts of a batch run.
    Batch { counts: Vec<u64> },
    /// No result, e.g. a directive or a DDL statement.
    Empty,
}

impl ResultSet {
    /// Builds a query result over already materialized rows.
    pub fn from_rows(columns: Columns, rows: Vec<Row>) -> Self {
        ResultSet::Query { columns, rows: Box::new(rows.into_iter()) }
    }

    /// Consumes a query result, collecting its rows.
    pub fn into_rows(self) -> Result<Vec<Row>> {
        match self {
            ResultSet::Query { rows, .. } => Ok(rows.collect()),
            other => Err(Error::Value(format!("Expected rows, got {:?}", other))),
        }
    }

    /// Returns the affected row count of a DML result.
    pub fn count(&self) -> Result<u64> {
        match self {
            ResultSet::Update { count } => Ok(*count),
            other => Err(Error::Value(format!("Expected row count, got {:?}", other))),
        }
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultSet::Query { columns, .. } => {
                f.debug_struct("Query").field("columns", columns).finish_non_exhaustive()
            }
            ResultSet::Update { count } => f.debug_struct("Update").field("count", count).finish(),
            ResultSet::Batch { counts } => f.debug_struct("Batch").field("counts", counts).finish(),
            ResultSet::Empty => write!(f, "Empty"),
        }
    }
}
