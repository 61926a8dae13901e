use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

/// A raw feed entry that could not be turned into a [`crate::neo::NeoObject`].
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed record {reference}: {reason}")]
pub struct MalformedRecord {
    /// `neo_reference_id` of the entry, else its `id`, else `"unknown"`.
    pub reference: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("feed returned an error: {0}")]
    Api(String),

    #[error("unexpected feed response structure: {0}")]
    Structure(#[from] serde_json::Error),

    #[error(transparent)]
    MalformedRecord(#[from] MalformedRecord),

    #[error("failed to persist record {id}: {source}")]
    PersistenceRow {
        id: i64,
        #[source]
        source: rusqlite::Error,
    },

    #[error("persistence failed, open transaction rolled back: {0}")]
    PersistenceFatal(#[source] rusqlite::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Whether a SQLite error is caused by the row being written rather than by the
/// connection or transaction it was written through.
pub fn is_row_error(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;

    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig
        ),
        rusqlite::Error::ToSqlConversionFailure(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn constraint_violation_is_row_error() {
        assert!(is_row_error(&sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT)));
    }

    #[test]
    fn busy_and_io_are_fatal() {
        assert!(!is_row_error(&sqlite_failure(rusqlite::ffi::SQLITE_BUSY)));
        assert!(!is_row_error(&sqlite_failure(rusqlite::ffi::SQLITE_IOERR)));
        assert!(!is_row_error(&rusqlite::Error::QueryReturnedNoRows));
    }

    #[test]
    fn malformed_record_message_names_reference() {
        let err = IngestError::from(MalformedRecord {
            reference: "3542519".into(),
            reason: "missing field `name`".into(),
        });
        assert_eq!(err.to_string(), "malformed record 3542519: missing field `name`");
    }
}
