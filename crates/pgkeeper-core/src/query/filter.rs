//! WHERE-clause conditions with bound parameters.

use crate::db::Value;
use crate::ident::Ident;

/// Comparison operator of a [`Filter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    ILike,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::ILike => "ILIKE",
            CompareOp::IsNull => "IS NULL",
            CompareOp::IsNotNull => "IS NOT NULL",
        }
    }

    fn takes_value(self) -> bool {
        !matches!(self, CompareOp::IsNull | CompareOp::IsNotNull)
    }
}

/// `column <op> value`. Filters are joined with `AND`.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub column: Ident,
    pub op: CompareOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: Ident, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            column,
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: Ident, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Eq, value)
    }

    pub fn gt(column: Ident, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Gt, value)
    }

    pub fn lt(column: Ident, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Lt, value)
    }

    pub fn is_null(column: Ident) -> Self {
        Self::new(column, CompareOp::IsNull, Value::Null)
    }
}

/// Accumulates SQL conditions and their `$n` parameters.
#[derive(Debug, Default)]
pub(crate) struct Conditions {
    clauses: Vec<String>,
    pub(crate) params: Vec<Value>,
}

impl Conditions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts numbering after already bound parameters.
    pub(crate) fn with_params(params: Vec<Value>) -> Self {
        Self {
            clauses: Vec::new(),
            params,
        }
    }

    /// Binds `value` and returns its placeholder.
    pub(crate) fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    pub(crate) fn push_clause(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    pub(crate) fn push_filters(&mut self, filters: &[Filter]) {
        for f in filters {
            let clause = if f.op.takes_value() {
                let p = self.bind(f.value.clone());
                format!("{} {} {p}", f.column, f.op.as_sql())
            } else {
                format!("{} {}", f.column, f.op.as_sql())
            };
            self.clauses.push(clause);
        }
    }

    /// ` WHERE a AND b`, or an empty string.
    pub(crate) fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}
