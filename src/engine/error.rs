//! Error types for dispatch and configuration.
//!
//! ```text
//!     submit() outcome            status   retryable
//!     ─────────────────────────── ──────── ─────────
//!     InvalidTier                  400      no
//!     RateLimitExceeded            429      yes
//!     CircuitOpen                  503      yes
//!     ResourceExhausted            503      yes
//!     Timeout                      500      yes
//!     Downstream / FaultInjected   500      no
//! ```

use super::pool::PoolKind;
use super::task::BoxError;
use http::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Classified failure of a single [`Dispatcher::submit`](crate::Dispatcher::submit) call.
///
/// Every variant is terminal for that call; the engine never retries.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The tier identifier is not part of the registry.
    #[error("unknown tier `{tier}`")]
    InvalidTier {
        /// The identifier the caller supplied.
        tier: String,
    },

    /// Admission control denied the request.
    #[error("rate limit exceeded for tier `{tier}` (retry after {retry_after:?})")]
    RateLimitExceeded {
        /// Tier whose quota was exhausted.
        tier: String,
        /// Time until the current window ends for this admission key.
        retry_after: Duration,
    },

    /// The tier's circuit breaker short-circuited the request.
    #[error("circuit open for tier `{tier}`")]
    CircuitOpen {
        /// Tier whose breaker rejected the request.
        tier: String,
    },

    /// A bounded pool could not hand out a permit in time.
    #[error("{pool} exhausted for tier `{tier}`")]
    ResourceExhausted {
        /// Tier whose pool was saturated.
        tier: String,
        /// Which pool ran dry.
        pool: PoolKind,
    },

    /// The attempt exceeded the breaker timeout.
    #[error("tier `{tier}` timed out after {after:?}")]
    Timeout {
        /// Tier whose attempt timed out.
        tier: String,
        /// The configured breaker timeout.
        after: Duration,
    },

    /// The task body failed.
    #[error("downstream error in tier `{tier}`: {source}")]
    Downstream {
        /// Tier the task ran in.
        tier: String,
        /// Error returned by the operation.
        #[source]
        source: BoxError,
    },

    /// The task was a fault-injection task.
    #[error("injected fault in tier `{tier}`")]
    FaultInjected {
        /// Tier the task ran in.
        tier: String,
    },
}

/// Fieldless classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`DispatchError::InvalidTier`].
    InvalidTier,
    /// See [`DispatchError::RateLimitExceeded`].
    RateLimitExceeded,
    /// See [`DispatchError::CircuitOpen`].
    CircuitOpen,
    /// See [`DispatchError::ResourceExhausted`].
    ResourceExhausted,
    /// See [`DispatchError::Timeout`].
    Timeout,
    /// See [`DispatchError::Downstream`].
    Downstream,
    /// See [`DispatchError::FaultInjected`].
    FaultInjected,
}

impl DispatchError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTier { .. } => ErrorKind::InvalidTier,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Downstream { .. } => ErrorKind::Downstream,
            Self::FaultInjected { .. } => ErrorKind::FaultInjected,
        }
    }

    /// The transport status a server should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::InvalidTier => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::CircuitOpen | ErrorKind::ResourceExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Timeout | ErrorKind::Downstream | ErrorKind::FaultInjected => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether backing off and retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimitExceeded
                | ErrorKind::CircuitOpen
                | ErrorKind::ResourceExhausted
                | ErrorKind::Timeout
        )
    }

    /// The tier named by the error.
    pub fn tier(&self) -> &str {
        match self {
            Self::InvalidTier { tier }
            | Self::RateLimitExceeded { tier, .. }
            | Self::CircuitOpen { tier }
            | Self::ResourceExhausted { tier, .. }
            | Self::Timeout { tier, .. }
            | Self::Downstream { tier, .. }
            | Self::FaultInjected { tier } => tier,
        }
    }
}

/// Invalid engine configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration defines no tiers.
    #[error("at least one tier must be configured")]
    NoTiers,

    /// A tier was given an empty name.
    #[error("tier names must not be empty")]
    EmptyTierName,

    /// A field holds a value outside its allowed range.
    #[error("tier `{tier}`: {field} {reason}")]
    InvalidValue {
        /// Tier the field belongs to (empty when validated standalone).
        tier: String,
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The TOML document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::InvalidValue {
            tier: String::new(),
            field,
            reason,
        }
    }

    /// Attaches a tier name to a standalone validation error.
    pub(crate) fn in_tier(self, name: &str) -> Self {
        match self {
            Self::InvalidValue { field, reason, .. } => Self::InvalidValue {
                tier: name.to_string(),
                field,
                reason,
            },
            other => other,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
