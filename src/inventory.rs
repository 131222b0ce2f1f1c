//! Host inventory.
//!
//! The inventory is an external collaborator: something owns a directory
//! of host records keyed by symbolic name and answers point lookups. The
//! core consults it per request and tolerates the answer changing
//! between calls. [`StaticInventory`] is the bundled implementation,
//! loaded once from a JSON document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoutError};
use crate::validate::validate_host_name;

fn default_port() -> u16 {
    22
}

/// Connection parameters for one remote machine. Immutable for the
/// lifetime of the process, shared by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

#[async_trait]
pub trait HostInventory: Send + Sync {
    /// All known hosts, keyed by name. Ordered so error messages and
    /// listings come out deterministically.
    async fn get_hosts(&self) -> BTreeMap<String, Arc<HostRecord>>;

    async fn get_host(&self, name: &str) -> Option<Arc<HostRecord>>;
}

pub struct StaticInventory {
    hosts: BTreeMap<String, Arc<HostRecord>>,
}

impl StaticInventory {
    pub fn new(records: Vec<HostRecord>) -> Result<Self> {
        let mut hosts = BTreeMap::new();
        for record in records {
            validate_host_name(&record.name)?;
            if record.address.is_empty() {
                return Err(ScoutError::validation(format!(
                    "host '{}' has an empty address",
                    record.name
                )));
            }
            if record.user.is_empty() {
                return Err(ScoutError::validation(format!(
                    "host '{}' has an empty user",
                    record.name
                )));
            }
            let name = record.name.clone();
            if hosts.insert(name.clone(), Arc::new(record)).is_some() {
                return Err(ScoutError::validation(format!(
                    "duplicate host name '{name}' in inventory"
                )));
            }
        }
        Ok(Self { hosts })
    }

    /// Load a JSON array of host records.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ScoutError::validation(format!("cannot read inventory {}: {e}", path.display()))
        })?;
        let records: Vec<HostRecord> = serde_json::from_str(&text)
            .map_err(|e| ScoutError::validation(format!("invalid inventory: {e}")))?;
        Self::new(records)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[async_trait]
impl HostInventory for StaticInventory {
    async fn get_hosts(&self) -> BTreeMap<String, Arc<HostRecord>> {
        self.hosts.clone()
    }

    async fn get_host(&self, name: &str) -> Option<Arc<HostRecord>> {
        self.hosts.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> HostRecord {
        HostRecord {
            name: name.into(),
            address: "10.0.0.1".into(),
            port: 22,
            user: "ops".into(),
            identity_file: None,
        }
    }

    #[tokio::test]
    async fn lookup_and_listing() {
        let inv = StaticInventory::new(vec![record("beta"), record("alpha")]).unwrap();
        assert!(inv.get_host("alpha").await.is_some());
        assert!(inv.get_host("gamma").await.is_none());
        let names: Vec<_> = inv.get_hosts().await.into_keys().collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn rejects_bad_records() {
        assert!(StaticInventory::new(vec![record("bad host")]).is_err());
        assert!(StaticInventory::new(vec![record("a"), record("a")]).is_err());
        let mut no_user = record("h");
        no_user.user = String::new();
        assert!(StaticInventory::new(vec![no_user]).is_err());
    }

    #[tokio::test]
    async fn loads_records_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        tokio::fs::write(
            &path,
            r#"[{"name":"h1","address":"1.2.3.4","user":"root"}]"#,
        )
        .await
        .unwrap();
        let inv = StaticInventory::from_file(&path).await.unwrap();
        assert_eq!(inv.len(), 1);
        assert!(inv.get_host("h1").await.is_some());
    }

    #[test]
    fn json_defaults() {
        let records: Vec<HostRecord> =
            serde_json::from_str(r#"[{"name":"h1","address":"1.2.3.4","user":"root"}]"#).unwrap();
        assert_eq!(records[0].port, 22);
        assert!(records[0].identity_file.is_none());
    }
}
