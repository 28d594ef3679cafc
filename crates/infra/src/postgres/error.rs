//! sqlx error classification.
//!
//! | sqlx error | SQLSTATE | kind | scenario |
//! |---|---|---|---|
//! | `Io`, `Tls`, `Protocol` | n/a | retriable | socket reset, handshake or framing failure |
//! | `PoolTimedOut`, `PoolClosed` | n/a | retriable | pool exhausted or shutting down |
//! | `Database` | class `08` | retriable | connection exception |
//! | `Database` | `53300` | retriable | too many connections |
//! | `Database` | `57P01`-`57P03` | retriable | admin/crash shutdown, cannot connect now |
//! | `Database` | `40001`, `40P01` | retriable | serialization failure, deadlock |
//! | `Database` | `57014` | retriable | statement cancelled (server-side timeout) |
//! | anything else | any | fatal | syntax error, constraint violation, decode error |

use chainsync_sync::{SourceError, StoreError};

const RETRIABLE_CODES: &[&str] = &["53300", "57P01", "57P02", "57P03", "40001", "40P01", "57014"];

/// True when the SQLSTATE marks a transient condition.
pub fn is_retriable_code(code: &str) -> bool {
    code.starts_with("08") || RETRIABLE_CODES.contains(&code)
}

/// Classify a sqlx error for the executor's retry loop.
pub fn classify_sqlx_error(operation: &str, err: sqlx::Error) -> SourceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            let msg = format!("database error in {operation} [{code}]: {}", db_err.message());
            if is_retriable_code(&code) {
                SourceError::retriable(msg)
            } else {
                SourceError::fatal(msg)
            }
        }
        sqlx::Error::Io(e) => SourceError::retriable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => SourceError::retriable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Protocol(e) => {
            SourceError::retriable(format!("protocol error in {operation}: {e}"))
        }
        sqlx::Error::PoolTimedOut => {
            SourceError::retriable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            SourceError::retriable(format!("connection pool closed in {operation}"))
        }
        other => SourceError::fatal(format!("sqlx error in {operation}: {other}")),
    }
}

/// Write-path errors keep the operation and classification in the message.
pub fn map_store_error(operation: &str, err: sqlx::Error) -> StoreError {
    StoreError::backend(classify_sqlx_error(operation, err).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_class_and_listed_codes_are_retriable() {
        for code in ["08000", "08006", "08P01", "53300", "57P01", "40001", "40P01", "57014"] {
            assert!(is_retriable_code(code), "{code}");
        }
    }

    #[test]
    fn logic_errors_are_fatal() {
        for code in ["42601", "23505", "42P01", "22P02", ""] {
            assert!(!is_retriable_code(code), "{code}");
        }
    }

    #[test]
    fn transport_errors_are_retriable() {
        let io = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(classify_sqlx_error("query", io).is_retriable());
        assert!(classify_sqlx_error("query", sqlx::Error::PoolTimedOut).is_retriable());
        assert!(classify_sqlx_error("query", sqlx::Error::Protocol("bad frame".into())).is_retriable());
    }

    #[test]
    fn row_not_found_is_fatal() {
        let err = classify_sqlx_error("query", sqlx::Error::RowNotFound);
        assert!(!err.is_retriable());
        assert!(err.message.contains("query"));
    }
}
