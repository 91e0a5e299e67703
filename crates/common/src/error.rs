use thiserror::Error;

/// The error kinds that cross crate boundaries.
///
/// Validation failures are never retried; `Transient` failures are retried by
/// the scheduler or backed off by the event loops; `DoNotRerun` wraps an error
/// a handler has decided is useless to retry.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource absent (cache miss, token not present). Callers often
    /// translate this to `false`/`None`.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input: bad signature framing, JSON missing `salt`, hostname
    /// containing a newline, Hello not sent first.
    #[error("{0}")]
    Invalid(String),

    /// Valid shape, wrong credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// First factor passed, second factor required. Carries the half-token
    /// and the supported second-factor methods.
    #[error("second factor required")]
    HalfAuthenticated {
        half_token: String,
        supported_methods: Vec<String>,
    },

    /// Required configuration missing at call time; setup is not complete.
    #[error("configuration incomplete: {0}")]
    ConfigFault(String),

    /// I/O or broker failure. Retried by the scheduler's refire policy.
    #[error("transient failure: {source}")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Produced by handlers that have determined further retries are useless.
    #[error(transparent)]
    DoNotRerun(Box<Error>),

    /// Anything else. Logged and surfaced as 500.
    #[error("internal error: {source}")]
    Internal {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    #[must_use]
    pub fn config_fault(message: impl Into<String>) -> Self {
        Self::ConfigFault(message.into())
    }

    #[must_use]
    pub fn transient(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transient {
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn transient_msg(message: impl Into<String>) -> Self {
        Self::Transient {
            source: message.into().into(),
        }
    }

    #[must_use]
    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal {
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn internal_msg(message: impl Into<String>) -> Self {
        Self::Internal {
            source: message.into().into(),
        }
    }

    /// Wrap an error so the scheduler abandons the task instead of refiring.
    #[must_use]
    pub fn do_not_rerun(err: Error) -> Self {
        Self::DoNotRerun(Box::new(err))
    }

    /// Whether this error may be echoed to callers (400-class) rather than
    /// masked as an internal failure.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Invalid(_)
                | Self::Unauthorized(_)
                | Self::HalfAuthenticated { .. }
        )
    }

    /// HTTP status this error surfaces as.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Invalid(_) => 400,
            Self::Unauthorized(_) | Self::HalfAuthenticated { .. } => 401,
            Self::ConfigFault(_) => 503,
            Self::Transient { .. } | Self::DoNotRerun(_) | Self::Internal { .. } => 500,
        }
    }

    /// Strip a `DoNotRerun` wrapper. Returns `(was_wrapped, inner)`.
    #[must_use]
    pub fn unwrap_do_not_rerun(self) -> (bool, Error) {
        match self {
            Self::DoNotRerun(inner) => (true, *inner),
            other => (false, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_kinds() {
        assert!(Error::invalid("bad salt").is_user_facing());
        assert!(Error::unauthorized("nope").is_user_facing());
        assert!(Error::not_found("token").is_user_facing());
        assert!(!Error::internal_msg("boom").is_user_facing());
        assert!(!Error::config_fault("s3").is_user_facing());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::not_found("x").http_status(), 404);
        assert_eq!(Error::invalid("x").http_status(), 400);
        assert_eq!(Error::unauthorized("x").http_status(), 401);
        assert_eq!(
            Error::HalfAuthenticated {
                half_token: "t".into(),
                supported_methods: vec!["totp".into()],
            }
            .http_status(),
            401
        );
        assert_eq!(Error::config_fault("x").http_status(), 503);
        assert_eq!(Error::internal_msg("x").http_status(), 500);
    }

    #[test]
    fn test_do_not_rerun_roundtrip() {
        let wrapped = Error::do_not_rerun(Error::invalid("stop"));
        let (no_rerun, inner) = wrapped.unwrap_do_not_rerun();
        assert!(no_rerun);
        assert_eq!(inner.to_string(), "stop");

        let (no_rerun, _) = Error::invalid("keep going").unwrap_do_not_rerun();
        assert!(!no_rerun);
    }
}
