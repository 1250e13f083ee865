//! Conjunctive equality queries, rendered as WQL.

use crate::value::Value;
use std::fmt;

/// A single `field = value` predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// `SELECT <fields> FROM <class> WHERE <f1> AND <f2> ...`
///
/// # Example
///
/// ```
/// use halyard_wmi::Query;
///
/// let query = Query::select("Msvm_VirtualSystemSettingData")
///     .and_eq("VirtualSystemType", "Microsoft:Hyper-V:System:Realized");
/// assert_eq!(
///     query.to_string(),
///     "SELECT * FROM Msvm_VirtualSystemSettingData WHERE VirtualSystemType = 'Microsoft:Hyper-V:System:Realized'"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    class: String,
    fields: Vec<String>,
    filters: Vec<Filter>,
}

impl Query {
    /// Select all properties of `class`.
    pub fn select(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Restrict the selected properties.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Add an equality predicate.
    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::equals(field, value));
        self
    }

    /// Add an already-built predicate.
    pub fn and(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::String(s) => {
            f.write_str("'")?;
            for c in s.chars() {
                if c == '\'' || c == '\\' {
                    f.write_str("\\")?;
                }
                write!(f, "{c}")?;
            }
            f.write_str("'")
        }
        Value::Bool(b) => f.write_str(if *b { "TRUE" } else { "FALSE" }),
        Value::Null => f.write_str("NULL"),
        other => write!(f, "{other}"),
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = if self.fields.is_empty() {
            "*".to_string()
        } else {
            self.fields.join(", ")
        };
        write!(f, "SELECT {fields} FROM {}", self.class)?;
        for (i, filter) in self.filters.iter().enumerate() {
            f.write_str(if i == 0 { " WHERE " } else { " AND " })?;
            write!(f, "{} = ", filter.field)?;
            write_literal(f, &filter.value)?;
        }
        Ok(())
    }
}
