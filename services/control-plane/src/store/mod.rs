//! Durable state: accounts, budgets, live nodes, usage journal, scheduler
//! membership and service units, all in one SQLite file.

mod models;
#[allow(clippy::module_inception)]
mod store;

pub use models::{
    Budget, CloudAccount, DesiredState, JournalEntry, Membership, NodeInstance, NodeRequest,
    NodeStatus, ObservedState, ServiceUnit, UnitKind, Vendor, LEGACY_MEMBERSHIP_VERSION,
};
pub use store::{StateStore, StoreError, StoreHealth};
