//! ストレージエラーの分類ユーティリティ。
use sqlx::Error as SqlxError;

use crate::error::StoreError;

/// 一時的とみなすPostgreSQLのSQLSTATE。
///
/// serialization_failure, deadlock_detected, lock_not_available, query_canceled,
/// too_many_connections。
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57014", "53300"];

/// sqlxのエラーを [`StoreError`] に変換する。
///
/// プールのタイムアウト、I/Oエラー、ロック競合は再試行可能として扱う。
pub(crate) fn classify_sqlx(error: SqlxError) -> StoreError {
    match &error {
        SqlxError::PoolTimedOut | SqlxError::Io(_) => StoreError::Transient(error.to_string()),
        SqlxError::Database(db) => {
            let transient = db
                .code()
                .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()));
            if transient {
                StoreError::Transient(error.to_string())
            } else {
                StoreError::Backend(anyhow::Error::new(error))
            }
        }
        _ => StoreError::Backend(anyhow::Error::new(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_transient() {
        assert!(classify_sqlx(SqlxError::PoolTimedOut).is_transient());
    }

    #[test]
    fn io_error_is_transient() {
        let error = SqlxError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(classify_sqlx(error).is_transient());
    }

    #[test]
    fn row_not_found_is_not_transient() {
        assert!(!classify_sqlx(SqlxError::RowNotFound).is_transient());
    }

    #[test]
    fn closed_pool_is_not_transient() {
        assert!(!classify_sqlx(SqlxError::PoolClosed).is_transient());
    }
}
