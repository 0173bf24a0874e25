//! Parser for partition bound expressions as printed by `pg_get_expr`.
//!
//! Handles range bounds such as
//! `FOR VALUES FROM ('2024-07-01 00:00:00+00') TO ('2024-08-01 00:00:00+00')`,
//! `FROM (MINVALUE) TO ('2024-01-01')` and `DEFAULT`. Only the first column
//! of a multi-column bound is interpreted.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;

/// One side of a range bound.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundValue {
    MinValue,
    MaxValue,
    Time(DateTime<Utc>),
    /// A literal that is not a date or timestamp, kept verbatim.
    Other(String),
}

impl BoundValue {
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            BoundValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

/// A parsed partition bound.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum PartitionBound {
    Range { from: BoundValue, to: BoundValue },
    Default,
    /// LIST/HASH bounds or anything else not understood.
    Unsupported(String),
}

impl PartitionBound {
    /// Inclusive lower bound, when it is a point in time.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        match self {
            PartitionBound::Range { from, .. } => from.as_time(),
            _ => None,
        }
    }

    /// Exclusive upper bound, when it is a point in time.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        match self {
            PartitionBound::Range { to, .. } => to.as_time(),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Literal(String),
    Open,
    Close,
    Comma,
    Cast,
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            ',' => tokens.push(Token::Comma),
            ':' => {
                if chars.next() != Some(':') {
                    return None;
                }
                tokens.push(Token::Cast);
            }
            '\'' => {
                let mut lit = String::new();
                loop {
                    match chars.next()? {
                        '\'' if chars.peek() == Some(&'\'') => {
                            chars.next();
                            lit.push('\'');
                        }
                        '\'' => break,
                        c => lit.push(c),
                    }
                }
                tokens.push(Token::Literal(lit));
            }
            c => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_whitespace() || matches!(n, '(' | ')' | ',' | ':' | '\'') {
                        break;
                    }
                    word.push(n);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Some(tokens)
}

fn is_keyword(token: Option<&Token>, keyword: &str) -> bool {
    matches!(token, Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
}

/// Parses a parenthesized bound list and returns its first value.
fn parse_list(tokens: &[Token], pos: &mut usize) -> Option<BoundValue> {
    if tokens.get(*pos) != Some(&Token::Open) {
        return None;
    }
    *pos += 1;

    let mut first: Option<BoundValue> = None;
    let mut depth = 0usize;
    let mut after_cast = false;
    loop {
        let token = tokens.get(*pos)?;
        *pos += 1;
        match token {
            Token::Close if depth == 0 => break,
            Token::Close => depth -= 1,
            Token::Open => depth += 1,
            Token::Cast => after_cast = true,
            Token::Comma if depth == 0 => {
                // Only the leading column is interpreted.
                first.get_or_insert(BoundValue::Other(String::new()));
                after_cast = false;
            }
            Token::Comma => {}
            Token::Literal(s) if first.is_none() && !after_cast => {
                first = Some(match parse_timestamp(s) {
                    Some(t) => BoundValue::Time(t),
                    None => BoundValue::Other(s.clone()),
                });
            }
            Token::Word(w) if first.is_none() && !after_cast => {
                first = Some(if w.eq_ignore_ascii_case("MINVALUE") {
                    BoundValue::MinValue
                } else if w.eq_ignore_ascii_case("MAXVALUE") {
                    BoundValue::MaxValue
                } else {
                    BoundValue::Other(w.clone())
                });
            }
            Token::Literal(_) | Token::Word(_) => {}
        }
    }
    first
}

/// Parses the text of a partition bound.
pub fn parse_bound(expr: &str) -> PartitionBound {
    let unsupported = || PartitionBound::Unsupported(expr.to_string());
    let Some(tokens) = tokenize(expr) else {
        return unsupported();
    };

    if tokens.len() == 1 && is_keyword(tokens.first(), "DEFAULT") {
        return PartitionBound::Default;
    }
    if !(is_keyword(tokens.first(), "FOR")
        && is_keyword(tokens.get(1), "VALUES")
        && is_keyword(tokens.get(2), "FROM"))
    {
        return unsupported();
    }

    let mut pos = 3;
    let Some(from) = parse_list(&tokens, &mut pos) else {
        return unsupported();
    };
    if !is_keyword(tokens.get(pos), "TO") {
        return unsupported();
    }
    pos += 1;
    let Some(to) = parse_list(&tokens, &mut pos) else {
        return unsupported();
    };
    if pos != tokens.len() {
        return unsupported();
    }
    PartitionBound::Range { from, to }
}

/// Parses a date or timestamp literal as printed by PostgreSQL.
///
/// Timestamps without an offset are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(t) = DateTime::parse_from_str(s, fmt) {
            return Some(t.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}
