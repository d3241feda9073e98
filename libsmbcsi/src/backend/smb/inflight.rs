use std::sync::Arc;

use dashmap::DashSet;
use tracing::debug;

use crate::error::CsiError;

/// Keys of controller operations currently in progress.
///
/// A second request for a busy key fails fast with [`CsiError::Aborted`]; the
/// orchestrator retries it once the first one has finished.
#[derive(Debug, Clone, Default)]
pub struct OperationLocks {
    keys: Arc<DashSet<String>>,
}

/// Held for the duration of one operation.  Dropping it, including when the
/// request future is cancelled, frees the key.
#[derive(Debug)]
pub struct OperationGuard {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl OperationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: impl Into<String>) -> Result<OperationGuard, CsiError> {
        let key = key.into();
        if !self.keys.insert(key.clone()) {
            debug!(%key, "operation already in flight");
            return Err(CsiError::Aborted(format!(
                "an operation for {key} is already in progress"
            )));
        }
        Ok(OperationGuard {
            keys: Arc::clone(&self.keys),
            key,
        })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}
