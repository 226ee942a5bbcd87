//! Error taxonomy shared by every core operation.
//!
//! Each variant maps onto one [`ErrorKind`]. The `Display` form is what gets
//! logged; [`Error::user_message`] is the rewritten form a front door may show.

use thiserror::Error;

/// User-visible text for anything the store or the runtime failed on.
pub const GENERIC_FAILURE: &str = "Please check the server log for the exact error message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    NotFound,
    Conflict,
    RateLimited,
    Transient,
    Internal,
}

/// Second-factor verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TwoFactorError {
    #[error("2FA required, not provided")]
    NotProvided,
    #[error("Invalid 2FA")]
    Invalid,
    #[error("2FA required but not configured")]
    RequiredButAbsent,
    #[error("Unknown Hash Type")]
    UnknownKind,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("Password mismatch")]
    PasswordMismatch,
    #[error(transparent)]
    TwoFactor(#[from] TwoFactorError),
    #[error("Login incorrect")]
    LoginIncorrect(#[source] Box<Error>),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Unauthorized(_) | Self::PasswordMismatch | Self::LoginIncorrect(_) => {
                ErrorKind::Unauthorized
            }
            Self::TwoFactor(_) => ErrorKind::Unauthorized,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Database(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            Self::Database(err) if is_unique_violation(err) => ErrorKind::Conflict,
            Self::Database(_) => ErrorKind::Transient,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The text a front door may show. Authorization failures never carry the
    /// predicate that denied, store failures never carry driver detail.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Unauthorized(_) => "Access denied".to_string(),
            Self::LoginIncorrect(_) | Self::PasswordMismatch | Self::TwoFactor(_) => {
                "Login incorrect".to_string()
            }
            Self::Database(sqlx::Error::RowNotFound) => "No such entry".to_string(),
            Self::Database(err) if is_unique_violation(err) => "Entry already exists".to_string(),
            Self::Database(_) | Self::Internal(_) => GENERIC_FAILURE.to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the failure is worth a single local retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_)
            )
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// SQLSTATE 23505.
#[must_use]
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind as DbErrorKind};
    use std::{borrow::Cow, error::Error as StdError, fmt};

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test db error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test db error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> DbErrorKind {
            DbErrorKind::Other
        }
    }

    #[test]
    fn unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));
        assert_eq!(Error::from(err).kind(), ErrorKind::Conflict);

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));
        assert_eq!(Error::from(err).kind(), ErrorKind::Transient);

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn user_message_hides_details() {
        let err = Error::unauthorized("Not a group admin");
        assert_eq!(err.user_message(), "Access denied");
        assert_eq!(err.to_string(), "Not a group admin");

        let err = Error::LoginIncorrect(Box::new(TwoFactorError::Invalid.into()));
        assert_eq!(err.user_message(), "Login incorrect");
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.user_message(), GENERIC_FAILURE);
        assert!(err.is_transient());
    }

    #[test]
    fn two_factor_messages() {
        assert_eq!(
            TwoFactorError::NotProvided.to_string(),
            "2FA required, not provided"
        );
        assert_eq!(
            TwoFactorError::RequiredButAbsent.to_string(),
            "2FA required but not configured"
        );
    }
}
