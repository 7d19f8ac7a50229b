use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;

/// Largest precision honoured by numeric format specifiers.
const MAX_PRECISION: usize = 64;

/// Owned value bound to a template placeholder or carried as scope state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

/// Discriminant of a [`LogValue`], used as the key of format overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    I64,
    U64,
    F64,
    Str,
    Timestamp,
}

impl LogValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            LogValue::Null => ValueKind::Null,
            LogValue::Bool(_) => ValueKind::Bool,
            LogValue::I64(_) => ValueKind::I64,
            LogValue::U64(_) => ValueKind::U64,
            LogValue::F64(_) => ValueKind::F64,
            LogValue::Str(_) => ValueKind::Str,
            LogValue::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LogValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Render with a format specifier taken from a `{Name:spec}` placeholder.
    ///
    /// Numbers understand `X`, `D`, `N`, `F`, `P` and `E` with an optional
    /// precision (`F3`, `X8`); timestamps take a `strftime` pattern. Specs
    /// that do not apply to the value fall back to the plain string form.
    pub fn format_with(&self, spec: &str) -> String {
        let spec = spec.trim();
        if spec.is_empty() {
            return self.to_string();
        }
        let formatted = match self {
            LogValue::I64(v) => format_integer(i128::from(*v), spec),
            LogValue::U64(v) => format_integer(i128::from(*v), spec),
            LogValue::F64(v) => format_float(*v, spec),
            LogValue::Timestamp(ts) => Some(format_timestamp(ts, spec)),
            _ => None,
        };
        formatted.unwrap_or_else(|| self.to_string())
    }
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::Null => f.write_str("null"),
            LogValue::Bool(v) => write!(f, "{v}"),
            LogValue::I64(v) => write!(f, "{v}"),
            LogValue::U64(v) => write!(f, "{v}"),
            LogValue::F64(v) => write!(f, "{v}"),
            LogValue::Str(v) => f.write_str(v),
            LogValue::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

fn split_spec(spec: &str) -> Option<(char, Option<usize>)> {
    let mut chars = spec.chars();
    let code = chars.next()?;
    let rest = chars.as_str();
    if rest.is_empty() {
        return Some((code, None));
    }
    let precision = rest.parse::<usize>().ok()?;
    Some((code, Some(precision.min(MAX_PRECISION))))
}

fn format_integer(v: i128, spec: &str) -> Option<String> {
    let (code, precision) = split_spec(spec)?;
    let width = precision.unwrap_or(0);
    match code {
        'X' | 'x' => {
            // Negative values print their two's complement, as i64.
            let bits = if v < 0 { v as i64 as u64 } else { v as u64 };
            Some(if code == 'X' {
                format!("{bits:0width$X}")
            } else {
                format!("{bits:0width$x}")
            })
        }
        'D' | 'd' => {
            let digits = format!("{:0width$}", v.unsigned_abs());
            Some(if v < 0 { format!("-{digits}") } else { digits })
        }
        _ => {
            // Integer arithmetic only: f64 loses digits above 2^53.
            let sign = if v < 0 { "-" } else { "" };
            let magnitude = v.unsigned_abs();
            let fraction = zero_fraction(precision.unwrap_or(2));
            match code.to_ascii_uppercase() {
                'F' => Some(format!("{sign}{magnitude}{fraction}")),
                'N' => Some(format!("{sign}{}{fraction}", group_thousands(&magnitude.to_string()))),
                'P' => Some(format!("{sign}{}{fraction} %", magnitude * 100)),
                'E' => Some(format!(
                    "{sign}{}",
                    integer_scientific(magnitude, precision.unwrap_or(6), code.is_ascii_uppercase())
                )),
                _ => None,
            }
        }
    }
}

fn zero_fraction(precision: usize) -> String {
    if precision == 0 {
        String::new()
    } else {
        format!(".{}", "0".repeat(precision))
    }
}

/// Scientific notation of an exact integer, rounding half up.
fn integer_scientific(magnitude: u128, precision: usize, upper: bool) -> String {
    let digits = magnitude.to_string();
    let mut exponent = digits.len() - 1;
    let mut kept: Vec<u8> = digits.bytes().take(precision + 1).map(|b| b - b'0').collect();
    if digits.len() > precision + 1 && digits.as_bytes()[precision + 1] >= b'5' {
        let mut i = kept.len();
        loop {
            if i == 0 {
                // Every kept digit was 9.
                kept.insert(0, 1);
                kept.pop();
                exponent += 1;
                break;
            }
            i -= 1;
            if kept[i] == 9 {
                kept[i] = 0;
            } else {
                kept[i] += 1;
                break;
            }
        }
    }
    kept.resize(precision + 1, 0);

    let mut mantissa = String::with_capacity(precision + 2);
    mantissa.push(char::from(b'0' + kept[0]));
    if precision > 0 {
        mantissa.push('.');
        mantissa.extend(kept[1..].iter().map(|d| char::from(b'0' + d)));
    }
    let marker = if upper { 'E' } else { 'e' };
    format!("{mantissa}{marker}+{exponent:03}")
}

fn format_float(v: f64, spec: &str) -> Option<String> {
    let (code, precision) = split_spec(spec)?;
    match code.to_ascii_uppercase() {
        'F' => Some(format!("{:.*}", precision.unwrap_or(2), v)),
        'N' => Some(group_thousands(&format!("{:.*}", precision.unwrap_or(2), v))),
        'P' => Some(format!("{:.*} %", precision.unwrap_or(2), v * 100.0)),
        'E' => Some(format_scientific(v, precision.unwrap_or(6), code.is_ascii_uppercase())),
        _ => None,
    }
}

fn format_scientific(v: f64, precision: usize, upper: bool) -> String {
    let raw = format!("{v:.precision$e}");
    let Some((mantissa, exponent)) = raw.split_once('e') else {
        return raw;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return raw;
    };
    let marker = if upper { 'E' } else { 'e' };
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}{marker}{sign}{:03}", exponent.unsigned_abs())
}

fn group_thousands(plain: &str) -> String {
    let (sign, rest) = match plain.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", plain),
    };
    let (int_part, frac) = match rest.find('.') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return plain.to_string();
    }
    let mut grouped = String::with_capacity(plain.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{sign}{grouped}{frac}")
}

fn format_timestamp(ts: &DateTime<Utc>, spec: &str) -> String {
    let items: Vec<Item<'_>> = StrftimeItems::new(spec).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return ts.to_rfc3339_opts(SecondsFormat::Millis, true);
    }
    ts.format_with_items(items.iter()).to_string()
}

macro_rules! from_signed {
    ($($ty:ty),*) => {
        $(impl From<$ty> for LogValue {
            fn from(v: $ty) -> Self {
                LogValue::I64(v as i64)
            }
        })*
    };
}

macro_rules! from_unsigned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for LogValue {
            fn from(v: $ty) -> Self {
                LogValue::U64(v as u64)
            }
        })*
    };
}

from_signed!(i8, i16, i32, i64, isize);
from_unsigned!(u8, u16, u32, u64, usize);

impl From<bool> for LogValue {
    fn from(v: bool) -> Self {
        LogValue::Bool(v)
    }
}

impl From<f32> for LogValue {
    fn from(v: f32) -> Self {
        LogValue::F64(f64::from(v))
    }
}

impl From<f64> for LogValue {
    fn from(v: f64) -> Self {
        LogValue::F64(v)
    }
}

impl From<&str> for LogValue {
    fn from(v: &str) -> Self {
        LogValue::Str(v.to_string())
    }
}

impl From<String> for LogValue {
    fn from(v: String) -> Self {
        LogValue::Str(v)
    }
}

impl From<&String> for LogValue {
    fn from(v: &String) -> Self {
        LogValue::Str(v.clone())
    }
}

impl From<char> for LogValue {
    fn from(v: char) -> Self {
        LogValue::Str(v.to_string())
    }
}

impl From<DateTime<Utc>> for LogValue {
    fn from(v: DateTime<Utc>) -> Self {
        LogValue::Timestamp(v)
    }
}

impl<T: Into<LogValue>> From<Option<T>> for LogValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(LogValue::Null, Into::into)
    }
}
