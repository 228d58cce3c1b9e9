//! Per-account mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per account, created on first use.
///
/// Every mutation of an account's node set (reconcile pass, removal,
/// provisioning commit) runs while holding the account's guard.
#[derive(Clone, Default)]
pub struct AccountLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `account`.
    pub async fn lock(&self, account: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(account.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_account_serializes() {
        let locks = AccountLocks::new();
        let guard = locks.lock("rcc-aws").await;

        let other = locks.clone();
        let blocked = tokio::time::timeout(Duration::from_millis(50), other.lock("rcc-aws")).await;
        assert!(blocked.is_err());

        // Other accounts are independent.
        let _lab = tokio::time::timeout(Duration::from_millis(50), locks.lock("lab-gcp"))
            .await
            .unwrap();

        drop(guard);
        let _again = locks.lock("rcc-aws").await;
    }
}
