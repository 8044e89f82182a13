//! Per-operation transaction scope.

use tracing::{debug, error};

use crate::engine::StorageEngine;
use crate::error::{Result, StoreError};

/// Transaction wrapper covering one record operation and its retries.
///
/// The transaction begins lazily on first use and at most once per scope
/// generation; a rollback resets the scope so the next [`begin`] starts a
/// fresh transaction for the retry. For untransacted stores the scope is
/// inert and [`begin`] yields `None`.
///
/// Dropping a scope that was neither committed nor rolled back rolls the
/// transaction back, so an early `?` return cannot leak engine locks.
///
/// [`begin`]: TransactionScope::begin
pub struct TransactionScope<'s, E: StorageEngine> {
    engine: &'s E,
    transactional: bool,
    begun: bool,
    txn: Option<E::Txn>,
}

impl<'s, E: StorageEngine> TransactionScope<'s, E> {
    pub(crate) fn new(engine: &'s E, transactional: bool) -> Self {
        Self {
            engine,
            transactional,
            begun: false,
            txn: None,
        }
    }

    /// Begins the transaction if this scope is transactional and none is
    /// active, then hands out the handle. Idempotent between resets.
    pub fn begin(&mut self) -> Result<Option<&E::Txn>> {
        if !self.transactional {
            return Ok(None);
        }
        if !self.begun {
            let txn = self
                .engine
                .txn_begin()
                .map_err(|e| StoreError::engine("begin", e))?;
            self.txn = Some(txn);
            self.begun = true;
            debug!("transaction begun");
        }
        Ok(self.txn.as_ref())
    }

    /// Commits the active transaction, if any.
    pub fn commit(&mut self) -> Result<()> {
        if !self.begun {
            return Ok(());
        }
        self.begun = false;
        if let Some(txn) = self.txn.take() {
            self.engine
                .txn_commit(txn)
                .map_err(|e| StoreError::engine("commit", e))?;
            debug!("transaction committed");
        }
        Ok(())
    }

    /// Rolls back the active transaction, if any.
    ///
    /// The begun flag clears before the engine is called, so a failed
    /// abort is never re-attempted by the drop backstop.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.begun {
            return Ok(());
        }
        self.begun = false;
        if let Some(txn) = self.txn.take() {
            self.engine
                .txn_abort(txn)
                .map_err(|e| StoreError::engine("rollback", e))?;
            debug!("transaction rolled back");
        }
        Ok(())
    }
}

impl<E: StorageEngine> Drop for TransactionScope<'_, E> {
    fn drop(&mut self) {
        if self.begun {
            if let Err(err) = self.rollback() {
                error!(%err, "rollback on scope drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::engine::memory::MemoryEngine;

    fn engine() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.open(&StoreConfig::new("t")).unwrap();
        engine
    }

    #[test]
    fn begin_is_idempotent() {
        let engine = engine();
        let mut scope = TransactionScope::new(&engine, true);
        assert!(scope.begin().unwrap().is_some());
        assert!(scope.begin().unwrap().is_some());
        scope.commit().unwrap();
        assert_eq!(engine.txn_stats().begun, 1);
        assert_eq!(engine.txn_stats().committed, 1);
    }

    #[test]
    fn untransacted_scope_is_inert() {
        let engine = engine();
        let mut scope = TransactionScope::new(&engine, false);
        assert!(scope.begin().unwrap().is_none());
        scope.commit().unwrap();
        drop(scope);
        assert_eq!(engine.txn_stats().begun, 0);
    }

    #[test]
    fn drop_rolls_back_unfinished_scope() {
        let engine = engine();
        {
            let mut scope = TransactionScope::new(&engine, true);
            scope.begin().unwrap();
        }
        let stats = engine.txn_stats();
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.committed, 0);
    }

    #[test]
    fn rollback_then_begin_starts_fresh() {
        let engine = engine();
        let mut scope = TransactionScope::new(&engine, true);
        scope.begin().unwrap();
        scope.rollback().unwrap();
        scope.begin().unwrap();
        scope.commit().unwrap();
        let stats = engine.txn_stats();
        assert_eq!(stats.begun, 2);
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.committed, 1);
    }
}
