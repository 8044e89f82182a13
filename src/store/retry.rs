//! Deadlock-aware retry loops.
//!
//! Every record operation runs inside [`deadlock_loop`]: the attempt
//! executes against the scope's transaction, and when the lock manager
//! sacrifices the call the transaction is rolled back and the attempt
//! replayed, up to the store's retry budget. Cursor operations run outside
//! transaction scopes and use [`cursor_deadlock_loop`], which retries the
//! bare call.

use tracing::{error, warn};

use crate::codes::ReturnCode;
use crate::engine::{EngineResult, StorageEngine};
use crate::error::{Result, StoreError};
use crate::store::scope::TransactionScope;

/// Runs `attempt` under the scope's transaction until it completes without
/// a deadlock or the budget is exhausted.
///
/// A deadlock may arrive as [`ReturnCode::Deadlock`] or as a native error
/// whose code says the same; both consume one attempt. Non-deadlock native
/// errors roll the transaction back and surface immediately, chaining the
/// rollback's own failure text when the rollback fails too.
pub(crate) fn deadlock_loop<E, F>(
    scope: &mut TransactionScope<'_, E>,
    budget: u32,
    method: &'static str,
    mut attempt: F,
) -> Result<ReturnCode>
where
    E: StorageEngine,
    F: FnMut(Option<&E::Txn>) -> EngineResult<ReturnCode>,
{
    let mut retries = 0u32;
    loop {
        match attempt(scope.begin()?) {
            Ok(code) if code.is_deadlock() => {}
            Ok(code) => return Ok(code),
            Err(err) if err.is_deadlock() => {}
            Err(err) => {
                return match scope.rollback() {
                    Ok(()) => Err(StoreError::engine(method, err)),
                    Err(rollback) => Err(StoreError::engine_with_rollback(method, err, rollback)),
                };
            }
        }
        scope.rollback()?;
        retries += 1;
        if retries >= budget {
            error!(method, retries, "deadlock retry budget exhausted, giving up");
            return Err(StoreError::DeadlockRetriesExhausted { method, retries });
        }
        warn!(method, retry = retries, "deadlock detected, retrying");
    }
}

/// Retry loop for cursor calls, which run with no transaction to roll
/// back. The cursor keeps its position, so a replay resumes where the
/// sacrificed call left off.
pub(crate) fn cursor_deadlock_loop<F>(
    budget: u32,
    method: &'static str,
    mut attempt: F,
) -> Result<ReturnCode>
where
    F: FnMut() -> EngineResult<ReturnCode>,
{
    let mut retries = 0u32;
    loop {
        match attempt() {
            Ok(code) if code.is_deadlock() => {}
            Ok(code) => return Ok(code),
            Err(err) if err.is_deadlock() => {}
            Err(err) => return Err(StoreError::engine(method, err)),
        }
        retries += 1;
        if retries >= budget {
            error!(method, retries, "deadlock retry budget exhausted, giving up");
            return Err(StoreError::DeadlockRetriesExhausted { method, retries });
        }
        warn!(method, retry = retries, "deadlock detected, retrying");
    }
}
