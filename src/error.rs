use std::time::Duration;

use crate::schema::ExchangeId;

/// A helper Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error taxonomy for the ingestion pipeline.
///
/// Each variant maps to one recovery policy:
///
/// - `Transport`       → reconnect with exponential backoff, keep subscriptions
/// - `Protocol`        → log and drop the offending frame, session continues
/// - `BookContinuity`  → discard the book, refetch a REST snapshot, resume
/// - `Auth`            → halt the user-data stream only
/// - `RateLimited`     → respect retry-after, back off that endpoint
/// - `Config`          → fail supervisor startup, never degrade silently
/// - `Invariant`       → abort the symbol session, resynchronize via REST
///
/// Connectors recover locally where possible; only errors that cannot be
/// recovered in-session reach the supervisor through the error callback.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Dial, read or write failure on a streaming or REST transport.
    #[error("transport error on {exchange}: {message}")]
    Transport {
        exchange: ExchangeId,
        message: String,
    },

    /// Malformed frame, invalid JSON or a missing required field.
    #[error("protocol violation on {exchange}: {message}")]
    Protocol {
        exchange: ExchangeId,
        message: String,
    },

    /// Sequence gap or checksum mismatch in an incremental book stream.
    #[error("book continuity lost on {exchange} {symbol}: expected seq {expected}, got {got}")]
    BookContinuity {
        exchange: ExchangeId,
        symbol: String,
        expected: u64,
        got: u64,
    },

    /// Signature rejected or login refused by the venue.
    #[error("authentication rejected by {exchange}: {message}")]
    Auth {
        exchange: ExchangeId,
        message: String,
    },

    /// HTTP 429 or a venue-specific throttle code.
    #[error("rate limited by {exchange} (retry after {retry_after:?})")]
    RateLimited {
        exchange: ExchangeId,
        retry_after: Option<Duration>,
    },

    /// Unknown exchange name, invalid credential format, bad config value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Impossible state, e.g. a crossed book after a clean apply.
    #[error("invariant violated on {exchange} {symbol}: {message}")]
    Invariant {
        exchange: ExchangeId,
        symbol: String,
        message: String,
    },
}

impl IngestError {
    /// Stable machine-readable code carried on bus-visible errors.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Transport { .. } => "transport",
            IngestError::Protocol { .. } => "protocol",
            IngestError::BookContinuity { .. } => "book_continuity",
            IngestError::Auth { .. } => "auth",
            IngestError::RateLimited { .. } => "rate_limited",
            IngestError::Config(_) => "config",
            IngestError::Invariant { .. } => "invariant",
        }
    }

    /// True when the session can keep running after logging this error.
    ///
    /// Transport errors are recoverable through the reconnect loop;
    /// protocol errors by dropping the frame; continuity and invariant
    /// errors through a snapshot resync.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, IngestError::Config(_) | IngestError::Auth { .. })
    }

    pub fn transport(exchange: ExchangeId, e: impl std::fmt::Display) -> Self {
        IngestError::Transport {
            exchange,
            message: e.to_string(),
        }
    }

    pub fn protocol(exchange: ExchangeId, e: impl std::fmt::Display) -> Self {
        IngestError::Protocol {
            exchange,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let e = IngestError::Config("bad".into());
        assert_eq!(e.code(), "config");
        assert!(!e.is_recoverable());

        let e = IngestError::BookContinuity {
            exchange: ExchangeId::Binance,
            symbol: "BTCUSDT".into(),
            expected: 11,
            got: 13,
        };
        assert_eq!(e.code(), "book_continuity");
        assert!(e.is_recoverable());
    }
}
