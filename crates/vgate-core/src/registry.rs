//! Static target registry: target identifier → backend `host:port`.
//!
//! Loaded once at startup from configuration and read-only afterwards.

use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One console backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl TargetEntry {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` form suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Immutable lookup table of console targets.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: HashMap<String, TargetEntry>,
}

impl TargetRegistry {
    /// Build a registry, rejecting empty or duplicate identifiers.
    pub fn new(entries: impl IntoIterator<Item = TargetEntry>) -> GateResult<Self> {
        let mut targets = HashMap::new();
        for entry in entries {
            if entry.id.trim().is_empty() {
                return Err(GateError::Config("target id must not be empty".into()));
            }
            if entry.host.trim().is_empty() {
                return Err(GateError::Config(format!(
                    "target {} has an empty host",
                    entry.id
                )));
            }
            if targets.contains_key(&entry.id) {
                return Err(GateError::Config(format!(
                    "duplicate target id: {}",
                    entry.id
                )));
            }
            targets.insert(entry.id.clone(), entry);
        }
        Ok(Self { targets })
    }

    pub fn lookup(&self, id: &str) -> Option<&TargetEntry> {
        self.targets.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.targets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Target ids in sorted order.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TargetRegistry {
        TargetRegistry::new(vec![
            TargetEntry::new("vm1", "localhost", 5900),
            TargetEntry::new("vm2", "10.0.0.7", 5901),
        ])
        .unwrap()
    }

    #[test]
    fn lookup_hit_and_miss() {
        let registry = sample();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("vm2").unwrap().address(), "10.0.0.7:5901");
        assert!(registry.lookup("vm3").is_none());
        assert!(!registry.contains("VM1"));
    }

    #[test]
    fn rejects_duplicates() {
        let err = TargetRegistry::new(vec![
            TargetEntry::new("vm1", "a", 1),
            TargetEntry::new("vm1", "b", 2),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_empty_id() {
        assert!(TargetRegistry::new(vec![TargetEntry::new(" ", "a", 1)]).is_err());
    }

    #[test]
    fn ipv6_address_is_bracketed() {
        assert_eq!(TargetEntry::new("v6", "::1", 5900).address(), "[::1]:5900");
    }

    #[test]
    fn deserializes_from_toml() {
        #[derive(Deserialize)]
        struct File {
            targets: Vec<TargetEntry>,
        }
        let file: File = toml::from_str(
            r#"
            [[targets]]
            id = "vm1"
            host = "localhost"
            port = 5900
            "#,
        )
        .unwrap();
        let registry = TargetRegistry::new(file.targets).unwrap();
        assert_eq!(registry.ids(), vec!["vm1"]);
    }
}
