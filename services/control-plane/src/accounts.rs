//! Account registry.
//!
//! Thin layer over the state store that validates operator input before it
//! reaches the database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::{Error, Result};
use crate::store::{CloudAccount, Membership, StateStore, Vendor, LEGACY_MEMBERSHIP_VERSION};

/// Input for [`AccountRegistry::create`].
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub owner: String,
    pub vendor: Vendor,
    pub vendor_account_id: String,
    pub endpoints: BTreeMap<String, String>,
    pub protected_nodes: BTreeSet<String>,
}

/// Management of cloud account identity and endpoints.
#[derive(Clone)]
pub struct AccountRegistry {
    store: Arc<StateStore>,
}

impl AccountRegistry {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Create an account (active).
    pub fn create(&self, new: NewAccount) -> Result<CloudAccount> {
        validate_name("account name", &new.name)?;
        require_non_empty("owner", &new.owner)?;
        require_non_empty("vendor account id", &new.vendor_account_id)?;
        for (name, address) in &new.endpoints {
            validate_name("endpoint name", name)?;
            require_non_empty("endpoint address", address)?;
        }

        let account = CloudAccount {
            name: new.name,
            owner: new.owner,
            vendor: new.vendor,
            vendor_account_id: new.vendor_account_id,
            endpoints: new.endpoints,
            protected_nodes: new.protected_nodes,
            active: true,
            created_at: Utc::now().timestamp(),
        };
        self.store.insert_account(&account)?;

        info!(account = %account.name, vendor = %account.vendor, "Account created");
        Ok(account)
    }

    pub fn get(&self, name: &str) -> Result<CloudAccount> {
        Ok(self.store.require_account(name)?)
    }

    pub fn list(&self) -> Result<Vec<CloudAccount>> {
        Ok(self.store.list_accounts()?)
    }

    /// Activate or deactivate an account. Inactive accounts admit no new
    /// nodes and lose their scheduler associations on the next sync.
    pub fn set_active(&self, name: &str, active: bool) -> Result<()> {
        self.store.set_account_active(name, active)?;
        info!(account = %name, active, "Account active flag updated");
        Ok(())
    }

    /// Change the vendor identity of an account that has never run nodes.
    pub fn update_identity(&self, name: &str, vendor: Vendor, vendor_account_id: &str) -> Result<()> {
        require_non_empty("vendor account id", vendor_account_id)?;
        self.store
            .update_account_identity(name, vendor, vendor_account_id)?;
        Ok(())
    }

    pub fn set_endpoint(&self, account: &str, name: &str, address: &str) -> Result<()> {
        validate_name("endpoint name", name)?;
        require_non_empty("endpoint address", address)?;
        self.store.set_endpoint(account, name, address)?;
        Ok(())
    }

    pub fn remove_endpoint(&self, account: &str, name: &str) -> Result<()> {
        Ok(self.store.remove_endpoint(account, name)?)
    }

    /// Exclude an instance name from import, eviction and billing.
    pub fn protect(&self, account: &str, instance_name: &str) -> Result<()> {
        require_non_empty("instance name", instance_name)?;
        Ok(self.store.add_protected_node(account, instance_name)?)
    }

    /// Record an onboarding membership row.
    pub fn add_member(&self, account: &str, username: &str) -> Result<()> {
        validate_name("username", username)?;
        self.store.add_membership(&Membership {
            username: username.to_string(),
            account: account.to_string(),
            source_version: LEGACY_MEMBERSHIP_VERSION,
        })?;
        Ok(())
    }

    pub fn remove_member(&self, account: &str, username: &str) -> Result<()> {
        Ok(self.store.remove_membership(username, account)?)
    }

    /// Usernames associated with an account.
    pub fn members(&self, account: &str) -> Result<Vec<String>> {
        self.store.require_account(account)?;
        Ok(self
            .store
            .list_membership()?
            .into_iter()
            .filter(|m| m.account == account)
            .map(|m| m.username)
            .collect())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Names end up in hostnames and scheduler commands, so keep them shell-safe.
fn validate_name(field: &str, value: &str) -> Result<()> {
    require_non_empty(field, value)?;
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid || value.starts_with('-') {
        return Err(Error::Validation(format!(
            "{field} '{value}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::{NodeInstance, NodeStatus};

    fn registry() -> AccountRegistry {
        AccountRegistry::new(Arc::new(StateStore::open_in_memory().unwrap()))
    }

    fn new_account(name: &str) -> NewAccount {
        NewAccount {
            name: name.to_string(),
            owner: "pi-smith".to_string(),
            vendor: Vendor::Aws,
            vendor_account_id: "123456789012".to_string(),
            endpoints: BTreeMap::new(),
            protected_nodes: BTreeSet::new(),
        }
    }

    #[test]
    fn test_create_and_list() {
        let registry = registry();
        registry.create(new_account("rcc-aws")).unwrap();
        registry.create(new_account("lab-aws")).unwrap();

        let names: Vec<_> = registry.list().unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["lab-aws", "rcc-aws"]);

        let err = registry.create(new_account("rcc-aws")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }

    #[rstest::rstest]
    #[case("")]
    #[case("rcc aws")]
    #[case("-rcc")]
    #[case("rcc;rm")]
    fn test_rejects_bad_names(#[case] name: &str) {
        let err = registry().create(new_account(name)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_endpoints() {
        let registry = registry();
        registry.create(new_account("rcc-aws")).unwrap();

        registry.set_endpoint("rcc-aws", "io", "10.0.0.5").unwrap();
        registry.set_endpoint("rcc-aws", "io", "10.0.0.6:22").unwrap();
        assert_eq!(
            registry.get("rcc-aws").unwrap().endpoints.get("io").map(String::as_str),
            Some("10.0.0.6:22")
        );

        registry.remove_endpoint("rcc-aws", "io").unwrap();
        let err = registry.remove_endpoint("rcc-aws", "io").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = registry.set_endpoint("missing", "io", "10.0.0.5").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_identity_frozen_once_nodes_exist() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let registry = AccountRegistry::new(store.clone());
        registry.create(new_account("rcc-aws")).unwrap();

        registry
            .update_identity("rcc-aws", Vendor::Aws, "999999999999")
            .unwrap();

        store
            .insert_node(
                &NodeInstance {
                    hostname: "rcc-aws-t1-001".to_string(),
                    node_type: "t1".to_string(),
                    account: "rcc-aws".to_string(),
                    instance_id: None,
                    ip: None,
                    started_at: 0,
                    status: NodeStatus::Provisioning,
                    rate: 1.0,
                    drain_started_at: None,
                },
                None,
            )
            .unwrap();

        let err = registry
            .update_identity("rcc-aws", Vendor::Gcp, "proj-1")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_members() {
        let registry = registry();
        registry.create(new_account("rcc-aws")).unwrap();
        registry.add_member("rcc-aws", "alice").unwrap();
        registry.add_member("rcc-aws", "bob").unwrap();
        registry.add_member("rcc-aws", "alice").unwrap();

        assert_eq!(registry.members("rcc-aws").unwrap(), vec!["alice", "bob"]);

        let err = registry.add_member("nope", "alice").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
