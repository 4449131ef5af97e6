//! Conversion of rusqlite failures into driver errors.

use crate::driver::DriverError;

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        DriverError::new(err.to_string())
    }
}

/// Error returned by every call on a closed session.
pub(crate) fn closed() -> DriverError {
    DriverError::new("SQLite connection is closed")
}
