//! Node-type catalog and hostname convention.
//!
//! The catalog is loaded from a TOML document that lists, per vendor, the
//! node types users may request:
//!
//! ```toml
//! [vendors.aws.node-types.t1]
//! name = "t2.micro"
//! price = 0.0116
//! cores = 1
//! memgb = 1
//! ```
//!
//! Hostnames follow `{account}-{node_type}-{NNN}`, e.g. `rcc-aws-t1-001`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::Vendor;

/// A requestable node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeSpec {
    /// Vendor-side shape / instance type.
    pub name: String,

    /// Price per hour.
    pub price: f64,

    #[serde(default)]
    pub cores: u32,

    #[serde(default)]
    pub memgb: u32,

    #[serde(default)]
    pub gpu: Option<u32>,

    #[serde(default, rename = "gpu-type")]
    pub gpu_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    vendors: BTreeMap<String, VendorSection>,
}

#[derive(Debug, Default, Deserialize)]
struct VendorSection {
    #[serde(default, rename = "node-types")]
    node_types: BTreeMap<String, NodeTypeSpec>,
}

/// Node types per vendor.
#[derive(Debug, Clone, Default)]
pub struct NodeTypeCatalog {
    vendors: BTreeMap<Vendor, BTreeMap<String, NodeTypeSpec>>,
}

impl NodeTypeCatalog {
    /// Load the catalog from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read node-type catalog {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid node-type catalog {}", path.display()))
    }

    /// Parse the catalog from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(contents)?;

        let mut vendors = BTreeMap::new();
        for (vendor, section) in file.vendors {
            let vendor: Vendor = vendor
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            for (node_type, spec) in &section.node_types {
                anyhow::ensure!(
                    spec.price >= 0.0,
                    "node type {vendor}/{node_type} has a negative price"
                );
                anyhow::ensure!(
                    !node_type.contains('-'),
                    "node type name '{node_type}' must not contain '-'"
                );
            }
            vendors.insert(vendor, section.node_types);
        }

        Ok(Self { vendors })
    }

    /// Add or replace a node type.
    pub fn insert(&mut self, vendor: Vendor, node_type: impl Into<String>, spec: NodeTypeSpec) {
        self.vendors
            .entry(vendor)
            .or_default()
            .insert(node_type.into(), spec);
    }

    /// Look up a node type.
    pub fn spec(&self, vendor: Vendor, node_type: &str) -> Option<&NodeTypeSpec> {
        self.vendors.get(&vendor)?.get(node_type)
    }

    /// Per-hour price of a node type.
    pub fn rate(&self, vendor: Vendor, node_type: &str) -> Option<f64> {
        self.spec(vendor, node_type).map(|s| s.price)
    }

    /// Map a vendor shape back to the catalog's node type.
    pub fn type_for_shape(&self, vendor: Vendor, shape: &str) -> Option<&str> {
        self.vendors
            .get(&vendor)?
            .iter()
            .find(|(_, spec)| spec.name == shape)
            .map(|(name, _)| name.as_str())
    }

    /// All node types offered by a vendor, sorted by name.
    pub fn types(&self, vendor: Vendor) -> Vec<(&str, &NodeTypeSpec)> {
        self.vendors
            .get(&vendor)
            .map(|types| types.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default()
    }
}

/// Build a hostname for the `index`-th node of a type.
pub fn hostname(account: &str, node_type: &str, index: u32) -> String {
    format!("{account}-{node_type}-{index:03}")
}

/// Parse a hostname belonging to `account` into `(node_type, index)`.
///
/// Returns `None` for names that do not follow the convention.
pub fn parse_hostname(account: &str, host: &str) -> Option<(String, u32)> {
    let rest = host.strip_prefix(account)?.strip_prefix('-')?;
    let (node_type, index) = rest.rsplit_once('-')?;
    if node_type.is_empty() || node_type.contains('-') {
        return None;
    }
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((node_type.to_string(), index.parse().ok()?))
}
