//! Value types shared by every native driver

use std::fmt;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Closed,
    /// Connection attempt in progress
    Opening,
    /// Connected and usable
    Open,
    /// Connected but unusable; must be closed and reopened
    Broken,
    /// Released; every further use fails
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Broken => "broken",
            ConnectionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Driver decides
    #[default]
    Unspecified,
    /// Dirty reads allowed
    ReadUncommitted,
    /// Only committed data is read
    ReadCommitted,
    /// Read rows stay stable for the transaction
    RepeatableRead,
    /// Full serializability
    Serializable,
    /// Row versioning snapshot
    Snapshot,
}

/// How the command text is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandType {
    /// A SQL statement
    #[default]
    Text,
    /// Name of a stored procedure
    StoredProcedure,
    /// Name of a table whose rows are returned
    TableDirect,
}

/// Hints for a reader execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandBehavior {
    /// All rows of the result
    #[default]
    Default,
    /// Only the first result set
    SingleResult,
    /// At most one row
    SingleRow,
    /// Column information only, no rows
    SchemaOnly,
    /// Close the connection once the reader has been consumed
    CloseConnection,
}

/// How command results are applied to the source row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateRowSource {
    /// Results are ignored
    None,
    /// Output parameters are mapped back
    OutputParameters,
    /// The first returned row is mapped back
    FirstReturnedRecord,
    /// Both output parameters and the first returned row
    #[default]
    Both,
}

/// A single database value
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// 64-bit integer
    Integer(i64),
    /// Double precision float
    Real(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl Value {
    /// Whether this is SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The integer value, if this is an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// The float value; integers are widened
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The text value, if this is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The bytes, if this is a blob
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A named command parameter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameter {
    /// Parameter name (may be empty for positional binding)
    pub name: String,
    /// Bound value
    pub value: Value,
}

impl Parameter {
    /// Create a parameter
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered parameter collection of a command
///
/// Parameters are bound in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters(Vec<Parameter>);

impl Parameters {
    /// Append a parameter built from a name and a value
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.push(Parameter::new(name, value));
        self
    }

    /// Append an existing parameter
    pub fn push(&mut self, parameter: Parameter) {
        self.0.push(parameter);
    }

    /// Look a parameter up by name
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.0.iter().find(|p| p.name == name)
    }

    /// Remove every parameter
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in binding order
    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Parameters {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Materialized result of a reader execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    /// Column names in result order
    pub columns: Vec<String>,
    /// Row values, each aligned with `columns`
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value at `row` in the column called `column`
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    /// First column of the first row
    pub fn first_value(&self) -> Option<&Value> {
        self.rows.first()?.first()
    }
}
