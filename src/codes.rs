//! Engine-facing return codes, cursor positions, and operation flags.
//!
//! The numeric values live in the engine's reserved band so they survive a
//! round trip through [`crate::error::StoreError::code`] without colliding
//! with OS errno values.

/// Result code returned by every engine record and cursor call.
///
/// This is a closed enumeration: engines must map any internal condition
/// onto one of these codes or fail the call with an
/// [`crate::engine::EngineError`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReturnCode {
    /// The operation completed.
    Success = 0,
    /// The supplied output region is smaller than the (windowed) value.
    BufferSmall = -30999,
    /// The key exists but its record was deleted or never populated.
    KeyEmpty = -30997,
    /// The key/value pair already exists (exclusive insert refused).
    KeyExist = -30996,
    /// The lock manager aborted this call to break a deadlock cycle.
    Deadlock = -30995,
    /// A lock could not be granted within the engine's limits.
    LockNotGranted = -30994,
    /// No record was found for the key (or cursor reached the end).
    NotFound = -30988,
    /// A page referenced by the access method is missing.
    PageNotFound = -30986,
    /// The engine requires recovery to be run before further access.
    RunRecovery = -30973,
    /// Verification found a malformed store.
    VerifyBad = -30970,
    /// Verification cannot proceed at all.
    VerifyFatal = -30969,
}

impl ReturnCode {
    /// Raw numeric code, as surfaced through [`crate::error::StoreError`].
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Whether this code signals a lock-manager conflict that the retry
    /// engine should absorb.
    pub const fn is_deadlock(self) -> bool {
        matches!(self, Self::Deadlock)
    }
}

/// Positioning directive for cursor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorPosition {
    /// Stay on the current record.
    Current,
    /// Move to the first record.
    First,
    /// Move to the last record.
    Last,
    /// Move to the next record.
    Next,
    /// Move to the previous record.
    Previous,
    /// Exact-match the caller-supplied key.
    Set,
    /// Move to the smallest key greater than or equal to the supplied key.
    /// The matched key is written back through the key slot.
    SetRange,
    /// Insert before the current record (insert-ordered access methods).
    Before,
    /// Insert after the current record (insert-ordered access methods).
    After,
    /// Insert, positioning at the first duplicate for the key.
    KeyFirst,
    /// Insert, positioning at the last duplicate for the key.
    KeyLast,
}

impl CursorPosition {
    /// Whether this position reads the key slot instead of writing it.
    pub const fn reads_key(self) -> bool {
        matches!(
            self,
            Self::Set | Self::SetRange | Self::Before | Self::After | Self::KeyFirst | Self::KeyLast
        )
    }
}

/// Raw operation flag bits shared by the typed flag wrappers.
pub mod flags {
    /// Acquire a write lock on read so the record can be modified in place.
    pub const RMW: u32 = 1 << 0;
    /// Refuse the write if the key already exists.
    pub const NO_OVERWRITE: u32 = 1 << 1;
    /// Open the cursor with write intent (required by CDB-style engines).
    pub const WRITE_CURSOR: u32 = 1 << 2;
    /// Read without honoring other transactions' write locks.
    pub const READ_UNCOMMITTED: u32 = 1 << 3;
    /// Degrade to committed-read isolation for this call.
    pub const READ_COMMITTED: u32 = 1 << 4;
}

macro_rules! op_flags {
    ($(#[$doc:meta])* $name:ident { $($(#[$fdoc:meta])* $flag:ident = $bits:expr;)* }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub u32);

        impl $name {
            /// No flags set.
            pub const NONE: Self = Self(0);
            $($(#[$fdoc])* pub const $flag: Self = Self($bits);)*

            /// Raw flag bits handed to the engine.
            pub const fn bits(self) -> u32 {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

op_flags!(
    /// Flags accepted by read operations.
    GetOpFlags {
        /// Retain a write lock on the record being read.
        RMW = flags::RMW;
        /// Read without honoring other transactions' write locks.
        READ_UNCOMMITTED = flags::READ_UNCOMMITTED;
        /// Degrade to committed-read isolation for this call.
        READ_COMMITTED = flags::READ_COMMITTED;
    }
);

op_flags!(
    /// Flags accepted by write operations.
    PutOpFlags {
        /// Refuse the write if the key already exists.
        NO_OVERWRITE = flags::NO_OVERWRITE;
    }
);

op_flags!(
    /// Flags accepted by delete operations.
    DeleteOpFlags {}
);

op_flags!(
    /// Flags accepted by existence probes.
    ExistsOpFlags {
        /// Retain a write lock on the record being probed.
        RMW = flags::RMW;
        /// Read without honoring other transactions' write locks.
        READ_UNCOMMITTED = flags::READ_UNCOMMITTED;
    }
);
