//! SQLite value encoding and decoding.
//!
//! Bind parameters go in through [`ToSql`] for [`Value`]. Column values come
//! out in text form, the way a text-protocol server would send them, so the
//! cursor's coercion rules apply unchanged.

use bytes::Bytes;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};

use crate::types::{format_datetime, Value};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            // SQLite integers are signed; larger values are stored as text.
            Value::UInt(u) => match i64::try_from(*u) {
                Ok(i) => ToSqlOutput::Owned(SqlValue::Integer(i)),
                Err(_) => ToSqlOutput::Owned(SqlValue::Text(u.to_string())),
            },
            Value::Double(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::DateTime(dt) => ToSqlOutput::Owned(SqlValue::Text(format_datetime(dt))),
        })
    }
}

/// Render a column value as text bytes. NULL becomes `None`.
pub fn text_bytes(value: ValueRef<'_>) -> Option<Bytes> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(Bytes::from(i.to_string())),
        ValueRef::Real(f) => Some(Bytes::from(f.to_string())),
        ValueRef::Text(t) => Some(Bytes::copy_from_slice(t)),
        ValueRef::Blob(b) => Some(Bytes::copy_from_slice(b)),
    }
}
