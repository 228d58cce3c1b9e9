//! Scheduler backends.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Association, SchedulerBackend};

/// Slurm accounting backend (`sacctmgr` / `squeue`).
#[derive(Debug, Clone, Default)]
pub struct SacctmgrBackend;

impl SacctmgrBackend {
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "Running scheduler command");
        let out = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {program}"))?;

        if !out.status.success() {
            bail!(
                "{program} exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Parse `sacctmgr -nP show associations format=account,user` output.
///
/// Account-level rows (empty user) are skipped.
pub(crate) fn parse_associations(output: &str) -> BTreeSet<Association> {
    output
        .lines()
        .filter_map(|line| {
            let (account, user) = line.trim().split_once('|')?;
            let user = user.trim_end_matches('|');
            if account.is_empty() || user.is_empty() {
                return None;
            }
            Some(Association::new(account, user))
        })
        .collect()
}

#[async_trait]
impl SchedulerBackend for SacctmgrBackend {
    async fn associations(&self) -> Result<BTreeSet<Association>> {
        let out = Self::run(
            "sacctmgr",
            &["-nP", "show", "associations", "format=account,user"],
        )
        .await?;
        Ok(parse_associations(&out))
    }

    async fn grant(&self, association: &Association) -> Result<()> {
        let name = format!("name={}", association.user);
        let account = format!("account={}", association.account);
        Self::run("sacctmgr", &["-i", "add", "user", &name, &account]).await?;
        Ok(())
    }

    async fn revoke(&self, association: &Association) -> Result<()> {
        let name = format!("name={}", association.user);
        let account = format!("account={}", association.account);
        Self::run("sacctmgr", &["-i", "remove", "user", &name, &account]).await?;
        Ok(())
    }

    async fn active_jobs(&self, hostname: &str) -> Result<u32> {
        let out = Self::run("squeue", &["-h", "-w", hostname, "-t", "RUNNING", "-o", "%i"]).await?;
        Ok(out.lines().filter(|l| !l.trim().is_empty()).count() as u32)
    }
}

/// In-memory scheduler with failure injection.
#[derive(Default)]
pub struct MemoryScheduler {
    associations: Mutex<BTreeSet<Association>>,
    jobs: Mutex<HashMap<String, u32>>,
    /// Grants/revokes touching these accounts fail.
    failing_accounts: Mutex<BTreeSet<String>>,
    /// Fail the N-th next mutating call (1-based); 0 disables.
    fail_after: AtomicU32,
    unreachable: std::sync::atomic::AtomicBool,
    mutations: AtomicU32,
    /// Grants and revokes land, then answer after this long.
    response_delay: Mutex<Duration>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed associations.
    pub fn with_associations(associations: impl IntoIterator<Item = Association>) -> Self {
        let scheduler = Self::default();
        if let Ok(mut set) = scheduler.associations.lock() {
            set.extend(associations);
        }
        scheduler
    }

    pub fn snapshot(&self) -> BTreeSet<Association> {
        self.associations
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Make grants and revokes for `account` fail.
    pub fn fail_account(&self, account: &str) {
        if let Ok(mut set) = self.failing_accounts.lock() {
            set.insert(account.to_string());
        }
    }

    pub fn heal_account(&self, account: &str) {
        if let Ok(mut set) = self.failing_accounts.lock() {
            set.remove(account);
        }
    }

    /// Fail the `n`-th next mutating call, counting from 1.
    pub fn fail_nth_mutation(&self, n: u32) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay the answer to every grant and revoke after it has landed.
    pub fn set_response_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.response_delay.lock() {
            *d = delay;
        }
    }

    pub fn set_active_jobs(&self, hostname: &str, jobs: u32) {
        if let Ok(mut map) = self.jobs.lock() {
            map.insert(hostname.to_string(), jobs);
        }
    }

    /// Successful grants and revokes so far.
    pub fn mutation_count(&self) -> u32 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn check_mutation(&self, association: &Association) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("[MEMORY] scheduler unreachable");
        }
        let failing = self
            .failing_accounts
            .lock()
            .map(|s| s.contains(&association.account))
            .unwrap_or(false);
        if failing {
            bail!("[MEMORY] account {} rejected by scheduler", association.account);
        }

        let countdown = self
            .fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                n => Some(n - 1),
            });
        if countdown == Ok(1) {
            bail!("[MEMORY] injected failure on {association}");
        }
        Ok(())
    }

    async fn respond(&self) {
        let delay = self.response_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeSet<Association>>> {
        self.associations
            .lock()
            .map_err(|_| anyhow!("[MEMORY] scheduler state poisoned"))
    }
}

#[async_trait]
impl SchedulerBackend for MemoryScheduler {
    async fn associations(&self) -> Result<BTreeSet<Association>> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("[MEMORY] scheduler unreachable");
        }
        Ok(self.lock()?.clone())
    }

    async fn grant(&self, association: &Association) -> Result<()> {
        self.check_mutation(association)?;
        self.lock()?.insert(association.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.respond().await;
        Ok(())
    }

    async fn revoke(&self, association: &Association) -> Result<()> {
        self.check_mutation(association)?;
        self.lock()?.remove(association);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.respond().await;
        Ok(())
    }

    async fn active_jobs(&self, hostname: &str) -> Result<u32> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("[MEMORY] scheduler unreachable");
        }
        Ok(self
            .jobs
            .lock()
            .ok()
            .and_then(|m| m.get(hostname).copied())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_associations() {
        let output = "rcc-aws||\nrcc-aws|alice|\nrcc-aws|bob\nlab-gcp|alice\n\n";
        let parsed = parse_associations(output);

        assert_eq!(parsed.len(), 3);
        assert!(parsed.contains(&Association::new("rcc-aws", "alice")));
        assert!(parsed.contains(&Association::new("lab-gcp", "alice")));
    }

    #[tokio::test]
    async fn test_nth_mutation_failure() {
        let scheduler = MemoryScheduler::new();
        scheduler.fail_nth_mutation(2);

        let a = Association::new("rcc-aws", "alice");
        let b = Association::new("rcc-aws", "bob");
        scheduler.grant(&a).await.unwrap();
        assert!(scheduler.grant(&b).await.is_err());
        scheduler.grant(&b).await.unwrap();

        assert_eq!(scheduler.snapshot().len(), 2);
        assert_eq!(scheduler.mutation_count(), 2);
    }
}
