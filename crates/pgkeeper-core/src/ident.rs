//! Names and keywords that are inlined into SQL text.
//!
//! Identifiers cannot be bound as `$n` parameters, so every table, column and
//! schema name that ends up in generated SQL goes through [`Ident`], and every
//! keyword comes from a closed enum.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENT_LEN: usize = 63;

/// A validated, optionally schema-qualified SQL identifier.
///
/// Accepted: lowercase ASCII letters, digits and `_`, not starting with a
/// digit, at most 63 bytes per part, with at most one `schema.` prefix.
/// Such names never need quoting, so they render as-is.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let mut parts = name.split('.');
        let valid = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), None, _) => valid_part(a),
            (Some(a), Some(b), None) => valid_part(a) && valid_part(b),
            _ => false,
        };
        if valid {
            Ok(Ident(name))
        } else {
            Err(Error::InvalidIdentifier(name))
        }
    }

    /// For names fixed in this crate's source.
    pub(crate) fn from_static(name: &'static str) -> Self {
        debug_assert!(Ident::new(name).is_ok(), "invalid built-in identifier {name}");
        Ident(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name without any schema prefix.
    pub fn unqualified(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// The schema prefix, if any.
    pub fn schema(&self) -> Option<&str> {
        self.0.split_once('.').map(|(s, _)| s)
    }

    /// Appends `_suffix` to the unqualified name, keeping the schema.
    pub fn with_suffix(&self, suffix: &str) -> Result<Self, Error> {
        Ident::new(format!("{}_{}", self.0, suffix))
    }
}

fn valid_part(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_IDENT_LEN
        && !s.starts_with(|c: char| c.is_ascii_digit())
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Ident {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ident::new(s)
    }
}

impl TryFrom<String> for Ident {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ident::new(s)
    }
}

impl TryFrom<&str> for Ident {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ident::new(s)
    }
}

impl From<Ident> for String {
    fn from(i: Ident) -> Self {
        i.0
    }
}

/// Validates a list of column names.
pub fn idents<S: AsRef<str>>(names: &[S]) -> Result<Vec<Ident>, Error> {
    names.iter().map(|n| Ident::new(n.as_ref())).collect()
}

/// Joins identifiers with `, `.
pub(crate) fn join(idents: &[Ident]) -> String {
    idents
        .iter()
        .map(Ident::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quotes a name read back from the catalog, which may not be a valid [`Ident`].
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes `schema.name` as two identifiers.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// `date_trunc` field names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Interval {
    pub fn as_sql(self) -> &'static str {
        match self {
            Interval::Minute => "minute",
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
            Interval::Quarter => "quarter",
            Interval::Year => "year",
        }
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" => Ok(Interval::Minute),
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            "quarter" => Ok(Interval::Quarter),
            "year" => Ok(Interval::Year),
            _ => Err(Error::InvalidArgument(format!("unknown interval {s:?}"))),
        }
    }
}

/// Aggregate functions usable in generated SQL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregate {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl Aggregate {
    pub fn as_sql(self) -> &'static str {
        match self {
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Count => "COUNT",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

impl FromStr for Aggregate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUM" => Ok(Aggregate::Sum),
            "AVG" => Ok(Aggregate::Avg),
            "COUNT" => Ok(Aggregate::Count),
            "MIN" => Ok(Aggregate::Min),
            "MAX" => Ok(Aggregate::Max),
            _ => Err(Error::InvalidArgument(format!("unknown aggregate {s:?}"))),
        }
    }
}

/// ORDER BY direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}
