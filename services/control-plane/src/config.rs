use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use skyway_reconcile::EvictionOrder;

use crate::association::SyncConfig;
use crate::billing::BillingConfig;
use crate::budget::EnforcerConfig;
use crate::controller::{ControllerConfig, DenyPolicy};
use crate::supervisor::SupervisorConfig;

pub const DEFAULT_DB_PATH: &str = "/var/lib/skyway/skyway.db";
pub const DEFAULT_CLOUD_CONFIG: &str = "/etc/skyway/cloud.toml";
pub const DEFAULT_VENDOR_DRIVER: &str = "/usr/libexec/skyway/vendor-driver";

/// Where vendor calls go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorSelection {
    /// In-memory vendor (dev mode).
    Mock,
    /// External driver executable.
    Driver(PathBuf),
}

/// Which scheduler backend manages associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerSelection {
    #[default]
    Sacctmgr,
    Memory,
}

impl FromStr for SchedulerSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sacctmgr" => Ok(Self::Sacctmgr),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown scheduler '{other}' (expected sacctmgr or memory)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub cloud_config: PathBuf,
    pub log_level: String,
    pub vendor: VendorSelection,
    pub scheduler: SchedulerSelection,
    pub sync_interval: Duration,
    pub controller: ControllerConfig,
    pub enforcer: EnforcerConfig,
    pub sync: SyncConfig,
    pub supervisor: SupervisorConfig,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secs = |key: &str, default: u64| -> Result<Duration> {
            match var(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a number of seconds, got '{v}'")),
                None => Ok(Duration::from_secs(default)),
            }
        };
        let parsed = |key: &str| -> Option<(String, String)> { var(key).map(|v| (key.to_string(), v)) };

        let db_path = var("SKYWAY_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()).into();
        let cloud_config = var("SKYWAY_CLOUD_CONFIG")
            .unwrap_or_else(|| DEFAULT_CLOUD_CONFIG.to_string())
            .into();
        let log_level = var("SKYWAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let mock = var("SKYWAY_VENDOR_MOCK")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);
        let vendor = if mock {
            VendorSelection::Mock
        } else {
            VendorSelection::Driver(
                var("SKYWAY_VENDOR_DRIVER")
                    .unwrap_or_else(|| DEFAULT_VENDOR_DRIVER.to_string())
                    .into(),
            )
        };

        let scheduler = match parsed("SKYWAY_SCHEDULER") {
            Some((key, v)) => v.parse::<SchedulerSelection>().map_err(|e| anyhow!("{key}: {e}"))?,
            None => SchedulerSelection::default(),
        };

        let deny_policy = match parsed("SKYWAY_DENY_POLICY") {
            Some((key, v)) => v.parse::<DenyPolicy>().map_err(|e| anyhow!("{key}: {e}"))?,
            None => DenyPolicy::default(),
        };
        let max_admission_attempts = match var("SKYWAY_MAX_ADMISSION_ATTEMPTS") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("SKYWAY_MAX_ADMISSION_ATTEMPTS must be a count, got '{v}'"))?,
            None => 5,
        };

        let overage_allowance = match var("SKYWAY_OVERAGE_ALLOWANCE") {
            Some(v) => {
                let value: f64 = v
                    .trim()
                    .parse()
                    .with_context(|| format!("SKYWAY_OVERAGE_ALLOWANCE must be an amount, got '{v}'"))?;
                if !value.is_finite() || value < 0.0 {
                    return Err(anyhow!("SKYWAY_OVERAGE_ALLOWANCE must not be negative"));
                }
                value
            }
            None => 0.0,
        };
        let eviction_order = match parsed("SKYWAY_EVICTION_ORDER") {
            Some((key, v)) => v.parse::<EvictionOrder>().map_err(|e| anyhow!("{key}: {e}"))?,
            None => EvictionOrder::default(),
        };

        let reconcile_interval = secs("SKYWAY_RECONCILE_INTERVAL", 60)?;
        if reconcile_interval.is_zero() {
            return Err(anyhow!("SKYWAY_RECONCILE_INTERVAL must be positive"));
        }
        let health_interval = secs("SKYWAY_HEALTH_INTERVAL", 10)?;
        if health_interval.is_zero() {
            return Err(anyhow!("SKYWAY_HEALTH_INTERVAL must be positive"));
        }
        let sync_interval = secs("SKYWAY_SYNC_INTERVAL", 300)?;
        if sync_interval.is_zero() {
            return Err(anyhow!("SKYWAY_SYNC_INTERVAL must be positive"));
        }

        let controller = ControllerConfig {
            reconcile_interval,
            drain_grace: secs("SKYWAY_DRAIN_GRACE", 300)?,
            orphan_grace: secs("SKYWAY_ORPHAN_GRACE", 900)?,
            provision_timeout: secs("SKYWAY_PROVISION_TIMEOUT", 1800)?,
            deny_policy,
            max_admission_attempts,
            ..ControllerConfig::default()
        };

        let enforcer = EnforcerConfig {
            overage_allowance,
            admission_horizon: secs("SKYWAY_ADMISSION_HORIZON", 3600)?,
            eviction_horizon: reconcile_interval,
            eviction_order,
        };

        let sync = SyncConfig {
            timeout: secs("SKYWAY_SYNC_TIMEOUT", 60)?,
            ..SyncConfig::default()
        };

        let supervisor = SupervisorConfig {
            health_interval,
            ..SupervisorConfig::default()
        };

        let billing = BillingConfig {
            interval: reconcile_interval,
            ..BillingConfig::default()
        };

        Ok(Self {
            db_path,
            cloud_config,
            log_level,
            vendor,
            scheduler,
            sync_interval,
            controller,
            enforcer,
            sync,
            supervisor,
            billing,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("SKYWAY_VENDOR_MOCK", "1")]).unwrap();

        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.vendor, VendorSelection::Mock);
        assert_eq!(config.scheduler, SchedulerSelection::Sacctmgr);
        assert_eq!(config.controller.reconcile_interval, Duration::from_secs(60));
        assert_eq!(config.controller.deny_policy, DenyPolicy::Requeue);
        assert_eq!(config.enforcer.admission_horizon, Duration::from_secs(3600));
        assert_eq!(config.enforcer.overage_allowance, 0.0);
        assert_eq!(config.supervisor.health_interval, Duration::from_secs(10));
        assert_eq!(config.sync.timeout, Duration::from_secs(60));
        assert_eq!(config.sync_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_default_vendor_is_driver() {
        let config = config(&[]).unwrap();
        assert_eq!(
            config.vendor,
            VendorSelection::Driver(PathBuf::from(DEFAULT_VENDOR_DRIVER))
        );
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("SKYWAY_VENDOR_DRIVER", "/usr/libexec/skyway/aws"),
            ("SKYWAY_SCHEDULER", "memory"),
            ("SKYWAY_RECONCILE_INTERVAL", "30"),
            ("SKYWAY_DENY_POLICY", "reject"),
            ("SKYWAY_OVERAGE_ALLOWANCE", "2.5"),
            ("SKYWAY_EVICTION_ORDER", "oldest-first"),
        ])
        .unwrap();

        assert_eq!(
            config.vendor,
            VendorSelection::Driver(PathBuf::from("/usr/libexec/skyway/aws"))
        );
        assert_eq!(config.scheduler, SchedulerSelection::Memory);
        assert_eq!(config.controller.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.enforcer.eviction_horizon, Duration::from_secs(30));
        assert_eq!(config.controller.deny_policy, DenyPolicy::Reject);
        assert_eq!(config.enforcer.overage_allowance, 2.5);
        assert_eq!(config.enforcer.eviction_order, EvictionOrder::OldestFirst);
    }

    #[rstest]
    #[case::bad_interval(&[("SKYWAY_RECONCILE_INTERVAL", "soon")])]
    #[case::zero_interval(&[("SKYWAY_VENDOR_MOCK", "1"), ("SKYWAY_HEALTH_INTERVAL", "0")])]
    #[case::bad_policy(&[("SKYWAY_VENDOR_MOCK", "1"), ("SKYWAY_DENY_POLICY", "maybe")])]
    #[case::negative_allowance(&[("SKYWAY_VENDOR_MOCK", "1"), ("SKYWAY_OVERAGE_ALLOWANCE", "-1")])]
    fn test_invalid(#[case] vars: &[(&str, &str)]) {
        assert!(config(vars).is_err());
    }
}
