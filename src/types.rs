//! Value conversion between Rust and the text protocol.
//!
//! Rows arrive as text. [`FromField`] turns a raw field into a Rust value with
//! C-style leniency: empty or NULL becomes zero/false/empty, and numbers are
//! read from the leading numeric text of the field, so `"42abc"` reads as 42
//! and `"abc"` as 0. [`Value`] goes the other way, for prepared-statement
//! parameters.

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{PoolError, Result};

/// Text layout of DATETIME columns.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// Bind parameters
// ============================================================================

/// A parameter bound to a prepared statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Double(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
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
        Value::Bytes(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Typed field extraction
// ============================================================================

/// Conversion from a raw text-protocol field.
///
/// `raw` is `None` when the field is NULL or empty.
pub trait FromField: Sized {
    fn from_field(raw: Option<&[u8]>) -> Result<Self>;
}

impl FromField for i32 {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        let v = raw.map(|b| leading_int(&text(b))).unwrap_or(0);
        Ok(v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
    }
}

impl FromField for i64 {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        Ok(raw.map(|b| leading_int(&text(b))).unwrap_or(0))
    }
}

impl FromField for u32 {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        let v = raw.map(|b| leading_uint(&text(b))).unwrap_or(0);
        Ok(u32::try_from(v).unwrap_or(u32::MAX))
    }
}

impl FromField for u64 {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        Ok(raw.map(|b| leading_uint(&text(b))).unwrap_or(0))
    }
}

impl FromField for bool {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        Ok(raw.map(|b| leading_int(&text(b)) == 1).unwrap_or(false))
    }
}

impl FromField for f32 {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        Ok(raw.map(|b| leading_float(&text(b))).unwrap_or(0.0) as f32)
    }
}

impl FromField for f64 {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        Ok(raw.map(|b| leading_float(&text(b))).unwrap_or(0.0))
    }
}

impl FromField for String {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        Ok(raw.map(|b| text(b).into_owned()).unwrap_or_default())
    }
}

impl FromField for Vec<u8> {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        Ok(raw.map(<[u8]>::to_vec).unwrap_or_default())
    }
}

/// NULL reads as the Unix epoch; use `Option<NaiveDateTime>` to tell them apart.
impl FromField for NaiveDateTime {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            Some(b) => parse_datetime(&text(b)),
            None => Ok(NaiveDateTime::default()),
        }
    }
}

impl<T: FromField> FromField for Option<T> {
    fn from_field(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            Some(_) => T::from_field(raw).map(Some),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Text helpers
// ============================================================================

#[inline]
fn text(raw: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(raw)
}

/// Split off an optional sign, returning `(negative, rest)`.
fn split_sign(s: &str) -> (bool, &str) {
    let s = s.trim_start();
    match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    }
}

/// Integer value of the leading decimal digits, saturating on overflow.
pub fn leading_int(s: &str) -> i64 {
    let (negative, digits) = split_sign(s);
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        let d = i64::from(b - b'0');
        value = if negative {
            value.saturating_mul(10).saturating_sub(d)
        } else {
            value.saturating_mul(10).saturating_add(d)
        };
    }
    value
}

/// Unsigned counterpart of [`leading_int`]; negative text reads as 0.
pub fn leading_uint(s: &str) -> u64 {
    let (negative, digits) = split_sign(s);
    if negative {
        return 0;
    }
    digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |acc, b| {
            acc.saturating_mul(10).saturating_add(u64::from(b - b'0'))
        })
}

/// Floating-point value of the leading numeric text, 0.0 if there is none.
pub fn leading_float(s: &str) -> f64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'-' | b'+')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut has_digits = end > int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        if has_digits || frac_end > frac_start {
            has_digits = true;
            end = frac_end;
        }
    }
    if !has_digits {
        return 0.0;
    }

    // Exponent only counts when at least one digit follows it.
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'-' | b'+') {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > digits_start {
            end = exp_end;
        }
    }

    s[..end].parse().unwrap_or(0.0)
}

/// Parse `YYYY-MM-DD HH:MM:SS[.fff]`, its `T`-separated form, or a bare date.
pub fn parse_datetime(s: &str) -> Result<NaiveDateTime> {
    let s = s.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| PoolError::Conversion(format!("invalid datetime: {:?}", s)))
}

pub fn format_datetime(dt: &NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}
