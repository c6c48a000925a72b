//! Device endpoint table shared between supervisors and the control surface.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Network endpoint reported by a tunnel helper.
///
/// Serialises as the two-element JSON array `[ip, port]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "(String, u16)", from = "(String, u16)")]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl From<Endpoint> for (String, u16) {
    fn from(endpoint: Endpoint) -> Self {
        (endpoint.ip, endpoint.port)
    }
}

impl From<(String, u16)> for Endpoint {
    fn from((ip, port): (String, u16)) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// Map from device identifier to the endpoint of its running helper.
///
/// A single mutex guards the whole map; every operation holds it only for
/// one map access. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    inner: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        // A panic while holding the guard cannot leave the map half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the endpoint for a device, replacing any previous one.
    pub fn set(&self, udid: &str, endpoint: Endpoint) {
        self.lock().insert(udid.to_string(), endpoint);
    }

    /// Retire the endpoint for a device. Returns the removed endpoint.
    pub fn remove(&self, udid: &str) -> Option<Endpoint> {
        self.lock().remove(udid)
    }

    pub fn get(&self, udid: &str) -> Option<Endpoint> {
        self.lock().get(udid).cloned()
    }

    pub fn contains(&self, udid: &str) -> bool {
        self.lock().contains_key(udid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Point-in-time copy of the table, ordered by identifier.
    pub fn snapshot(&self) -> BTreeMap<String, Endpoint> {
        self.lock()
            .iter()
            .map(|(udid, endpoint)| (udid.clone(), endpoint.clone()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_serializes_as_pair() {
        let json = serde_json::to_string(&Endpoint::new("2001:db8::1", 12345)).unwrap();
        assert_eq!(json, r#"["2001:db8::1",12345]"#);

        let back: Endpoint = serde_json::from_str(r#"["fd00::2",49151]"#).unwrap();
        assert_eq!(back, Endpoint::new("fd00::2", 49151));
    }

    #[test]
    fn endpoint_display_brackets_ipv6() {
        assert_eq!(Endpoint::new("fd00::2", 1).to_string(), "[fd00::2]:1");
        assert_eq!(Endpoint::new("10.0.0.2", 80).to_string(), "10.0.0.2:80");
    }

    #[test]
    fn set_replace_remove() {
        let table = AddressTable::new();
        assert!(table.is_empty());

        table.set("AAA", Endpoint::new("fd00::1", 1000));
        table.set("AAA", Endpoint::new("fd00::1", 2000));
        table.set("BBB", Endpoint::new("fd00::2", 3000));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("AAA").unwrap().port, 2000);

        assert_eq!(table.remove("AAA").unwrap().port, 2000);
        assert!(table.remove("AAA").is_none());
        assert!(!table.contains("AAA"));
        assert!(table.contains("BBB"));
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let table = AddressTable::new();
        table.set("BBB", Endpoint::new("fd00::2", 2));
        table.set("AAA", Endpoint::new("fd00::1", 1));

        let snap = table.snapshot();
        table.remove("AAA");

        assert_eq!(snap.keys().collect::<Vec<_>>(), vec!["AAA", "BBB"]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn snapshot_json_matches_control_surface_shape() {
        let table = AddressTable::new();
        table.set("AAA", Endpoint::new("2001:db8::1", 12345));
        let json = serde_json::to_value(table.snapshot()).unwrap();
        assert_eq!(json, serde_json::json!({"AAA": ["2001:db8::1", 12345]}));
    }
}
