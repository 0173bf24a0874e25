//! Conversions between [`Value`] and the PostgreSQL binary wire format.
//!
//! Parameters are converted according to the type the server inferred for
//! the placeholder. A value that does not fit that type is an error, never a
//! reinterpretation of bytes. Result columns of types without a native
//! mapping are decoded to text (NUMERIC, UUID) or JSON (common arrays);
//! anything else is a decode error.

use std::error::Error as StdError;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};

use super::Value;
use crate::error::DbError;
use crate::partition::parse_timestamp;

type BoxError = Box<dyn StdError + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

fn cannot_bind(value: &Value, ty: &Type) -> BoxError {
    format!("cannot bind {} parameter as {}", value.type_name(), ty).into()
}

fn int_param(value: &Value, ty: &Type) -> Result<i64, BoxError> {
    match value {
        Value::Int(i) => Ok(*i),
        // Only whole floats inside the i64 range convert.
        Value::Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
            Ok(*f as i64)
        }
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("{s:?} is not a valid {ty}").into()),
        other => Err(cannot_bind(other, ty)),
    }
}

fn float_param(value: &Value, ty: &Type) -> Result<f64, BoxError> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) if (*i as f64) as i64 == *i => Ok(*i as f64),
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{s:?} is not a valid {ty}").into()),
        other => Err(cannot_bind(other, ty)),
    }
}

fn timestamp_param(value: &Value, ty: &Type) -> Result<DateTime<Utc>, BoxError> {
    match value {
        Value::Timestamp(ts) => Ok(*ts),
        Value::Date(d) => Ok(d.and_time(NaiveTime::MIN).and_utc()),
        Value::Text(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_timestamp(s))
            .ok_or_else(|| format!("{s:?} is not a valid {ty}").into()),
        other => Err(cannot_bind(other, ty)),
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if let Value::Null = self {
            return Ok(IsNull::Yes);
        }
        match *ty {
            // Text placeholders take the rendered value, so `$1::text::numeric`
            // style casts work for every variant.
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                match self {
                    Value::Text(s) => s.to_sql(ty, out),
                    other => other.to_key_string().to_sql(ty, out),
                }
            }
            Type::BOOL => match self {
                Value::Bool(b) => b.to_sql(ty, out),
                Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" | "on" | "1" => true.to_sql(ty, out),
                    "false" | "f" | "no" | "off" | "0" => false.to_sql(ty, out),
                    _ => Err(format!("{s:?} is not a valid boolean").into()),
                },
                other => Err(cannot_bind(other, ty)),
            },
            Type::INT2 => i16::try_from(int_param(self, ty)?)?.to_sql(ty, out),
            Type::INT4 => i32::try_from(int_param(self, ty)?)?.to_sql(ty, out),
            Type::INT8 => int_param(self, ty)?.to_sql(ty, out),
            Type::OID => u32::try_from(int_param(self, ty)?)?.to_sql(ty, out),
            Type::FLOAT4 => (float_param(self, ty)? as f32).to_sql(ty, out),
            Type::FLOAT8 => float_param(self, ty)?.to_sql(ty, out),
            Type::NUMERIC => {
                let text = match self {
                    Value::Int(i) => i.to_string(),
                    Value::Float(f) if f.is_finite() => f.to_string(),
                    Value::Text(s) => s.trim().to_string(),
                    other => return Err(cannot_bind(other, ty)),
                };
                encode_numeric(&text, out)?;
                Ok(IsNull::No)
            }
            Type::TIMESTAMPTZ => timestamp_param(self, ty)?.to_sql(ty, out),
            Type::TIMESTAMP => timestamp_param(self, ty)?.naive_utc().to_sql(ty, out),
            Type::DATE => match self {
                Value::Date(d) => d.to_sql(ty, out),
                Value::Timestamp(ts) => ts.date_naive().to_sql(ty, out),
                Value::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map_err(|_| format!("{s:?} is not a valid date"))?
                    .to_sql(ty, out),
                other => Err(cannot_bind(other, ty)),
            },
            Type::JSON | Type::JSONB => {
                let json = match self {
                    Value::Json(j) => j.clone(),
                    Value::Text(s) => serde_json::from_str(s)?,
                    Value::Bool(b) => serde_json::Value::from(*b),
                    Value::Int(i) => serde_json::Value::from(*i),
                    Value::Float(f) => serde_json::Value::from(*f),
                    other => return Err(cannot_bind(other, ty)),
                };
                json.to_sql(ty, out)
            }
            Type::UUID => match self {
                Value::Text(s) => {
                    out.put_slice(&parse_uuid(s)?);
                    Ok(IsNull::No)
                }
                other => Err(cannot_bind(other, ty)),
            },
            _ => Err(cannot_bind(self, ty)),
        }
    }

    // The variant is only known at bind time; mismatches are reported by
    // `to_sql`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Writes a decimal string in NUMERIC binary form.
fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
    let invalid = || -> BoxError { format!("{text:?} is not a valid numeric").into() };

    if text.eq_ignore_ascii_case("nan") {
        out.put_slice(&[0, 0, 0, 0]);
        out.put_u16(NUMERIC_NAN);
        out.put_u16(0);
        return Ok(());
    }

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() && frac_part.is_empty()
        || !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }
    let dscale = u16::try_from(frac_part.len()).map_err(|_| invalid())?;

    // Base-10000 groups aligned on the decimal point.
    let int_part = int_part.trim_start_matches('0');
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let digits_str = format!(
        "{}{}{}{}",
        "0".repeat(int_pad),
        int_part,
        frac_part,
        "0".repeat(frac_pad)
    );
    let mut groups: Vec<i16> = digits_str
        .as_bytes()
        .chunks(4)
        .map(|c| c.iter().fold(0i16, |acc, d| acc * 10 + (d - b'0') as i16))
        .collect();
    let mut weight = ((int_part.len() + int_pad) / 4) as i32 - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i32;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let (weight, sign) = if groups.is_empty() {
        (0, NUMERIC_POS)
    } else if negative {
        (weight, NUMERIC_NEG)
    } else {
        (weight, NUMERIC_POS)
    };
    out.put_i16(i16::try_from(groups.len()).map_err(|_| invalid())?);
    out.put_i16(i16::try_from(weight).map_err(|_| invalid())?);
    out.put_u16(sign);
    out.put_u16(dscale);
    for g in groups {
        out.put_i16(g);
    }
    Ok(())
}

/// Renders NUMERIC binary form as a decimal string at its display scale.
fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let header = |i: usize| -> Result<u16, BoxError> {
        raw.get(i..i + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric".into())
    };
    let ndigits = header(0)? as usize;
    let weight = header(2)? as i16 as i32;
    let sign = header(4)?;
    let dscale = header(6)? as usize;
    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    let digits = (0..ndigits)
        .map(|i| header(8 + 2 * i))
        .collect::<Result<Vec<_>, _>>()?;
    let digit = |idx: i32| -> u16 {
        usize::try_from(idx)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut s = String::new();
    if sign == NUMERIC_NEG {
        s.push('-');
    }
    if weight < 0 {
        s.push('0');
    } else {
        s.push_str(&digit(0).to_string());
        for i in 1..=weight {
            s.push_str(&format!("{:04}", digit(i)));
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut j = 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(weight + j)));
            j += 1;
        }
        frac.truncate(dscale);
        s.push('.');
        s.push_str(&frac);
    }
    Ok(s)
}

fn parse_uuid(s: &str) -> Result<[u8; 16], BoxError> {
    let hex: Vec<u8> = s.trim().bytes().filter(|b| *b != b'-').collect();
    if hex.len() != 32 {
        return Err(format!("{s:?} is not a valid uuid").into());
    }
    let mut bytes = [0u8; 16];
    for (i, pair) in hex.chunks(2).enumerate() {
        let pair = std::str::from_utf8(pair)?;
        bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| format!("{s:?} is not a valid uuid"))?;
    }
    Ok(bytes)
}

fn format_uuid(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() != 16 {
        return Err("uuid must be 16 bytes".into());
    }
    let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

/// NUMERIC or UUID column read as text.
struct TextRendered(String);

impl<'a> FromSql<'a> for TextRendered {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        match *ty {
            Type::NUMERIC => decode_numeric(raw).map(TextRendered),
            Type::UUID => format_uuid(raw).map(TextRendered),
            _ => Err(format!("cannot render {ty} as text").into()),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::NUMERIC | Type::UUID)
    }
}

/// Decodes column `idx` of a driver row.
pub(crate) fn decode_value(row: &postgres::Row, idx: usize) -> Result<Value, DbError> {
    let column = &row.columns()[idx];
    let decode = |e: postgres::Error| DbError::Decode {
        column: column.name().to_string(),
        message: e.to_string(),
    };
    fn json<T: serde::Serialize>(v: Option<T>) -> Value {
        v.and_then(|v| serde_json::to_value(v).ok())
            .map(Value::Json)
            .unwrap_or(Value::Null)
    }

    let value = match *column.type_() {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map_err(decode)?.into(),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map_err(decode)?
            .map(|v| v as i64)
            .into(),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map_err(decode)?
            .map(|v| v as i64)
            .into(),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map_err(decode)?.into(),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)
            .map_err(decode)?
            .map(|v| v as i64)
            .into(),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(decode)?
            .map(|v| v as f64)
            .into(),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map_err(decode)?.into(),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR | Type::UNKNOWN => row
            .try_get::<_, Option<String>>(idx)
            .map_err(decode)?
            .into(),
        Type::NUMERIC | Type::UUID => row
            .try_get::<_, Option<TextRendered>>(idx)
            .map_err(decode)?
            .map(|t| t.0)
            .into(),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map_err(decode)?
            .into(),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map_err(decode)?
            .into(),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .map_err(decode)?
            .into(),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map_err(decode)?
            .into(),
        Type::BOOL_ARRAY => json(row.try_get::<_, Option<Vec<Option<bool>>>>(idx).map_err(decode)?),
        Type::INT2_ARRAY => json(row.try_get::<_, Option<Vec<Option<i16>>>>(idx).map_err(decode)?),
        Type::INT4_ARRAY => json(row.try_get::<_, Option<Vec<Option<i32>>>>(idx).map_err(decode)?),
        Type::INT8_ARRAY => json(row.try_get::<_, Option<Vec<Option<i64>>>>(idx).map_err(decode)?),
        Type::FLOAT8_ARRAY => {
            json(row.try_get::<_, Option<Vec<Option<f64>>>>(idx).map_err(decode)?)
        }
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY => {
            json(row.try_get::<_, Option<Vec<Option<String>>>>(idx).map_err(decode)?)
        }
        ref other => {
            return Err(DbError::Decode {
                column: column.name().to_string(),
                message: format!("unsupported column type {other}; cast it to text in SQL"),
            });
        }
    };
    Ok(value)
}
