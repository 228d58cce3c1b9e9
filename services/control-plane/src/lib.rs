//! skyway control plane library.
//!
//! Manages bursting of an HPC scheduler's compute nodes into public cloud
//! accounts: cloud account records, per-account budgets, node lifecycle
//! against the vendors, scheduler associations, and the supervisor that
//! keeps the long-running pieces alive. The `skyway-daemon` binary runs the
//! supervisor; the `skyway` CLI uses the same library directly.

pub mod accounts;
pub mod association;
pub mod billing;
pub mod budget;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod error;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod vendor;
