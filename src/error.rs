//! Error type for the access layer.

use thiserror::Error;

use crate::codes::ReturnCode;
use crate::engine::EngineError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Numeric codes for conditions raised by this layer rather than by the
/// engine. They sit in a band separate from [`ReturnCode`] values.
pub mod codes {
    /// A null or missing key was supplied.
    pub const KEY_NULL: i32 = -40896;
    /// A zero-length key was supplied.
    pub const KEY_ZERO_LENGTH: i32 = -40895;
    /// A buffer descriptor was resolved more than once.
    pub const BUFFER_REUSED: i32 = -40894;
    /// A read-only descriptor was used for output.
    pub const NOT_WRITABLE: i32 = -40893;
    /// An allocation token was redeemed more than once.
    pub const ALREADY_MATERIALIZED: i32 = -40892;
    /// The operation/position combination is not supported.
    pub const UNSUPPORTED: i32 = -40891;
    /// The cursor has already been closed.
    pub const CURSOR_CLOSED: i32 = -40890;
    /// The record store has already been closed.
    pub const STORE_CLOSED: i32 = -40889;
    /// The store configuration is malformed.
    pub const INVALID_CONFIG: i32 = -40888;
}

/// The single error type surfaced by record store and cursor operations.
///
/// Every variant carries a stable numeric code (see [`StoreError::code`])
/// and a composed message that chains any nested engine failure text, so
/// callers never see a bare native code without context.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A zero-length key was passed to a record operation.
    #[error("{method}: zero length key not allowed")]
    KeyZeroLength {
        /// Operation that rejected the key.
        method: &'static str,
    },

    /// A buffer descriptor was resolved into a transfer slot twice.
    #[error("buffer descriptor already resolved")]
    BufferReused,

    /// A descriptor that is neither writable nor empty was used for output.
    #[error("buffer descriptor is not writable")]
    NotWritable,

    /// A copy-on-demand allocation was materialized more than once.
    #[error("transfer result already materialized")]
    AlreadyMaterialized,

    /// The requested operation/position combination cannot be performed.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The cursor was used after it was closed.
    #[error("cursor is closed")]
    CursorClosed,

    /// The record store was used after it was closed.
    #[error("record store is closed")]
    StoreClosed,

    /// The store configuration failed validation before any engine call.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The deadlock retry budget was exhausted without a clean attempt.
    #[error("{method} exceeded deadlock retry limit after {retries} attempts, giving up")]
    DeadlockRetriesExhausted {
        /// Operation that gave up.
        method: &'static str,
        /// Number of attempts made.
        retries: u32,
    },

    /// The engine failed with a native code outside the domain outcomes.
    ///
    /// `message` chains the engine's own text and, when a rollback that
    /// followed the failure also failed, the rollback text as well.
    #[error("{method}: engine error {code}: {message}")]
    Engine {
        /// Operation during which the engine failed.
        method: &'static str,
        /// Native engine code.
        code: i32,
        /// Composed human-readable message.
        message: String,
    },
}

impl StoreError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::KeyZeroLength { .. } => codes::KEY_ZERO_LENGTH,
            Self::BufferReused => codes::BUFFER_REUSED,
            Self::NotWritable => codes::NOT_WRITABLE,
            Self::AlreadyMaterialized => codes::ALREADY_MATERIALIZED,
            Self::Unsupported(_) => codes::UNSUPPORTED,
            Self::CursorClosed => codes::CURSOR_CLOSED,
            Self::StoreClosed => codes::STORE_CLOSED,
            Self::InvalidConfig(_) => codes::INVALID_CONFIG,
            Self::DeadlockRetriesExhausted { .. } => ReturnCode::Deadlock.code(),
            Self::Engine { code, .. } => *code,
        }
    }

    /// Wraps a native engine failure.
    pub(crate) fn engine(method: &'static str, err: EngineError) -> Self {
        Self::Engine {
            method,
            code: err.code,
            message: err.message,
        }
    }

    /// Wraps a native engine failure whose follow-up rollback also failed.
    /// Both messages are concatenated so no information is lost.
    pub(crate) fn engine_with_rollback(
        method: &'static str,
        err: EngineError,
        rollback: StoreError,
    ) -> Self {
        Self::Engine {
            method,
            code: err.code,
            message: format!("{}\n{}", err.message, rollback),
        }
    }

    /// Wraps an unexpected engine return code.
    pub(crate) fn unexpected_code(method: &'static str, ret: ReturnCode) -> Self {
        Self::Engine {
            method,
            code: ret.code(),
            message: format!("unexpected return code {ret:?}"),
        }
    }
}
