//! Store configuration.

/// On-disk organization strategy of the underlying engine.
///
/// External to this layer; passed through to the engine at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMethod {
    /// Sorted key access.
    BTree,
    /// Hashed key access.
    Hash,
    /// Fixed-length record queue.
    Queue,
    /// Record-number access.
    Recno,
    /// Let the engine discover the method from an existing store.
    Unknown,
}

/// Configuration supplied when opening a [`crate::store::RecordStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Name of the backing store (file name for file-backed engines).
    pub name: String,
    /// Access method to open the store with.
    pub access_method: AccessMethod,
    /// Whether operations run inside engine transactions.
    ///
    /// When `false` the deadlock retry budget is forced to 1: there is no
    /// transaction to roll back, so a conflicted call cannot be replayed
    /// against a consistent snapshot more than once.
    pub transactional: bool,
    /// Upper bound on attempts for a deadlocked operation.
    pub max_deadlock_retries: u32,
    /// Create the store if it does not exist.
    pub create: bool,
    /// Open the store read-only.
    pub read_only: bool,
    /// Page size hint for the engine, zero to accept the engine default.
    pub page_size: u32,
    /// Record length for `Queue` stores, zero to accept the engine default.
    pub record_length: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            access_method: AccessMethod::BTree,
            transactional: true,
            max_deadlock_retries: 1,
            create: true,
            read_only: false,
            page_size: 0,
            record_length: 0,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration for a named store with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the access method.
    pub fn access_method(mut self, method: AccessMethod) -> Self {
        self.access_method = method;
        self
    }

    /// Enables or disables transactional operation.
    pub fn transactional(mut self, enabled: bool) -> Self {
        self.transactional = enabled;
        self
    }

    /// Sets the deadlock retry budget.
    pub fn max_deadlock_retries(mut self, retries: u32) -> Self {
        self.max_deadlock_retries = retries;
        self
    }

    /// Sets the page size hint.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the fixed record length for queue stores.
    pub fn record_length(mut self, bytes: u32) -> Self {
        self.record_length = bytes;
        self
    }

    /// Opens the store read-only.
    pub fn read_only(mut self, enabled: bool) -> Self {
        self.read_only = enabled;
        self
    }

    /// Retry budget effective for this configuration.
    ///
    /// Untransacted stores always get a budget of 1.
    pub(crate) fn effective_retry_budget(&self) -> u32 {
        if self.transactional {
            self.max_deadlock_retries.max(1)
        } else {
            1
        }
    }
}
