//! Row cursor over a buffered result set.

use std::collections::HashMap;

use crate::driver::{RawResult, RawRow};
use crate::error::{PoolError, Result};
use crate::types::FromField;

/// Anything that can address a field: a column index or a column name.
pub trait FieldKey {
    fn resolve(&self, cursor: &RowCursor) -> Result<usize>;
}

impl FieldKey for usize {
    fn resolve(&self, _cursor: &RowCursor) -> Result<usize> {
        Ok(*self)
    }
}

impl FieldKey for &str {
    fn resolve(&self, cursor: &RowCursor) -> Result<usize> {
        cursor.field_index(self)
    }
}

impl FieldKey for String {
    fn resolve(&self, cursor: &RowCursor) -> Result<usize> {
        cursor.field_index(self)
    }
}

/// Iterator-like view of a [`RawResult`] with typed field access.
///
/// Typical use:
///
/// ```rust,ignore
/// let cursor = conn.execute_query("SELECT id, name FROM users")?;
/// while cursor.next_row().is_ok() {
///     let id: i64 = cursor.get_field("id")?;
///     let name: String = cursor.get_field(1usize)?;
/// }
/// ```
#[derive(Debug, Default)]
pub struct RowCursor {
    result: Option<RawResult>,
    /// Index of the current row within the result
    current: Option<usize>,
    field_indexes: HashMap<String, usize>,
}

impl RowCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new result, releasing whatever was bound before.
    ///
    /// A missing result (a statement without a result set) fails with
    /// [`PoolError::NoResultSet`] and leaves the cursor unbound.
    pub fn bind(&mut self, result: Option<RawResult>) -> Result<()> {
        self.close();
        let result = result.ok_or(PoolError::NoResultSet)?;

        // First occurrence wins for duplicated column names.
        for (i, column) in result.columns().iter().enumerate() {
            self.field_indexes.entry(column.name.clone()).or_insert(i);
        }
        self.result = Some(result);
        Ok(())
    }

    /// Advance to the next row.
    ///
    /// Results are fully buffered, so once bound the only failure is
    /// [`PoolError::EndOfRows`]; callers loop until it is returned.
    pub fn next_row(&mut self) -> Result<()> {
        let result = self.result.as_mut().ok_or(PoolError::NotBound)?;
        match result.fetch_index() {
            Some(index) => {
                self.current = Some(index);
                Ok(())
            }
            None => {
                self.current = None;
                Err(PoolError::EndOfRows)
            }
        }
    }

    pub fn row_count(&self) -> Result<u64> {
        self.result
            .as_ref()
            .map(RawResult::row_count)
            .ok_or(PoolError::NotBound)
    }

    /// Reposition so the next [`next_row`](Self::next_row) lands on row `offset`.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        let result = self.result.as_mut().ok_or(PoolError::NotBound)?;
        result.seek(offset);
        self.current = None;
        Ok(())
    }

    pub fn field_count(&self) -> usize {
        self.result.as_ref().map_or(0, RawResult::field_count)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.result
            .as_ref()
            .map(|r| r.columns().iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.field_indexes
            .get(name)
            .copied()
            .ok_or_else(|| PoolError::UnknownField(name.to_string()))
    }

    /// Raw bytes of a field in the current row, `None` when NULL or empty.
    pub fn field_bytes<K: FieldKey>(&self, key: K) -> Result<Option<&[u8]>> {
        let index = key.resolve(self)?;
        let row = self.current_row()?;
        let count = self.field_count();
        if index >= count {
            return Err(PoolError::FieldIndex { index, count });
        }
        Ok(row
            .get(index)
            .and_then(|v| v.as_deref())
            .filter(|v| !v.is_empty()))
    }

    /// Typed value of a field in the current row.
    pub fn get_field<T: FromField, K: FieldKey>(&self, key: K) -> Result<T> {
        T::from_field(self.field_bytes(key)?)
    }

    pub fn is_null<K: FieldKey>(&self, key: K) -> Result<bool> {
        self.field_bytes(key).map(|v| v.is_none())
    }

    pub fn is_bound(&self) -> bool {
        self.result.is_some()
    }

    /// Release the bound result and the field map. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.result = None;
        self.current = None;
        self.field_indexes.clear();
    }

    fn current_row(&self) -> Result<&RawRow> {
        let result = self.result.as_ref().ok_or(PoolError::NotBound)?;
        self.current
            .and_then(|i| result.row(i))
            .ok_or(PoolError::NoCurrentRow)
    }
}

impl From<RawResult> for RowCursor {
    fn from(result: RawResult) -> Self {
        let mut cursor = RowCursor::new();
        // Binding a present result cannot fail.
        let _ = cursor.bind(Some(result));
        cursor
    }
}
