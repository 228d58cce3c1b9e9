//! Scheduler association management.
//!
//! The external scheduler authorizes a user to submit work under an account
//! through an association. [`AssociationSync`] keeps those associations equal
//! to the onboarding membership of active accounts.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod backend;
mod sync;

pub use backend::{MemoryScheduler, SacctmgrBackend};
pub use sync::{AccountDelta, AssociationSync, FailedAccount, SyncConfig, SyncReport};

/// A user authorized under an account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Association {
    pub account: String,
    pub user: String,
}

impl Association {
    pub fn new(account: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            user: user.into(),
        }
    }
}

impl std::fmt::Display for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.account)
    }
}

/// Scheduler capability used by the control plane.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    /// Every user association currently configured.
    async fn associations(&self) -> Result<BTreeSet<Association>>;

    async fn grant(&self, association: &Association) -> Result<()>;

    async fn revoke(&self, association: &Association) -> Result<()>;

    /// Jobs currently running on a node.
    async fn active_jobs(&self, hostname: &str) -> Result<u32>;
}
