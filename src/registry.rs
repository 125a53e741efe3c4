//! Process-wide registry of circuits, keyed by (group, name).
//!
//! One breaker per named dependency across every call site in the process.
//! The map itself sits behind a readers-writer lock; handles are cloned out
//! before any async query so the lock is never held across an await.

use crate::circuit_breaker::CircuitBreaker;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Mapping from group to name to breaker.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    inner: RwLock<HashMap<String, HashMap<String, CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group: &str, name: &str) -> Option<CircuitBreaker> {
        self.inner.read().unwrap().get(group).and_then(|named| named.get(name)).cloned()
    }

    /// Upsert a breaker under `(group, name)`.
    pub fn set(&self, group: &str, name: &str, circuit: CircuitBreaker) {
        self.inner
            .write()
            .unwrap()
            .entry(group.to_owned())
            .or_default()
            .insert(name.to_owned(), circuit);
    }

    /// First writer wins: returns the resident breaker, building one only
    /// when the key is vacant.
    pub(crate) fn get_or_insert_with<F>(&self, group: &str, name: &str, build: F) -> CircuitBreaker
    where
        F: FnOnce() -> CircuitBreaker,
    {
        self.inner
            .write()
            .unwrap()
            .entry(group.to_owned())
            .or_default()
            .entry(name.to_owned())
            .or_insert_with(build)
            .clone()
    }

    /// Replace the registry with an empty one. Intended for tests.
    pub fn reset(&self) {
        *self.inner.write().unwrap() = HashMap::new();
    }

    /// Number of registered circuits across all groups.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted (group, name, breaker) entries; handles cloned out of the lock.
    pub fn entries(&self) -> Vec<(String, String, CircuitBreaker)> {
        let map = self.inner.read().unwrap();
        let mut entries: Vec<(String, String, CircuitBreaker)> = map
            .iter()
            .flat_map(|(group, named)| {
                named.iter().map(|(name, circuit)| (group.clone(), name.clone(), circuit.clone()))
            })
            .collect();
        drop(map);
        entries.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        entries
    }

    /// Serialize the registry into the debug JSON document: an array of
    /// `{"group", "circuit": [...]}` objects. Reading state never mutates
    /// the registry.
    pub async fn to_json(&self) -> serde_json::Result<String> {
        let mut groups: Vec<GroupDoc> = Vec::new();
        for (group, _, circuit) in self.entries() {
            let doc = circuit_doc(&circuit).await;
            match groups.last_mut() {
                Some(last) if last.group == group => last.circuit.push(doc),
                _ => groups.push(GroupDoc { group, circuit: vec![doc] }),
            }
        }
        serde_json::to_string(&groups)
    }
}

#[derive(Debug, Serialize)]
struct GroupDoc {
    group: String,
    circuit: Vec<CircuitDoc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CircuitDoc {
    name: String,
    group: String,
    is_open: bool,
    state: String,
    percentile90: f64,
    mean: f64,
    variance: f64,
    max: i64,
    min: i64,
    failures: u64,
    timeouts: u64,
    fallback: u64,
    panics: u64,
    fallback_errors: u64,
    total: u64,
    success: u64,
    error_percentage: f64,
    last_success: Option<String>,
    last_failure: Option<String>,
    last_timeout: Option<String>,
}

async fn circuit_doc(circuit: &CircuitBreaker) -> CircuitDoc {
    let (is_open, reason) = circuit.evaluate().await;
    let snapshot = circuit.metric().snapshot().await;
    let stats = circuit.metric().stats();
    let time_of_day =
        |stamp: Option<chrono::DateTime<chrono::Local>>| -> Option<String> {
            stamp.map(|s| s.format("%H:%M:%S%.3f").to_string())
        };
    CircuitDoc {
        name: circuit.name().to_owned(),
        group: circuit.group().to_owned(),
        is_open,
        state: format!("{}: {}", if is_open { "open" } else { "closed" }, reason),
        percentile90: stats.percentile(0.90),
        mean: stats.mean,
        variance: stats.variance,
        max: stats.max,
        min: stats.min,
        failures: snapshot.counts.failures,
        timeouts: snapshot.counts.timeouts,
        fallback: snapshot.counts.fallback,
        panics: snapshot.counts.panics,
        fallback_errors: snapshot.counts.fallback_errors,
        total: snapshot.counts.total,
        success: snapshot.counts.success,
        error_percentage: snapshot.counts.error_percentage,
        last_success: time_of_day(snapshot.last_success),
        last_failure: time_of_day(snapshot.last_failure),
        last_timeout: time_of_day(snapshot.last_timeout),
    }
}

/// The process-wide registry.
pub fn circuits() -> &'static CircuitRegistry {
    static REGISTRY: OnceLock<CircuitRegistry> = OnceLock::new();
    REGISTRY.get_or_init(CircuitRegistry::default)
}

/// Drop every registered circuit. Test hook; running executors keep their
/// handles, only the lookup table empties.
pub fn circuits_reset() {
    circuits().reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitOptions;
    use serde_json::Value;

    fn local_registry_with(pairs: &[(&str, &str)]) -> CircuitRegistry {
        let registry = CircuitRegistry::new();
        for (group, name) in pairs {
            let circuit = CircuitBreaker::new_circuit(group, name, CircuitOptions::default())
                .expect("valid default options");
            registry.set(group, name, circuit);
        }
        registry
    }

    #[test]
    fn get_misses_on_an_empty_registry() {
        let registry = CircuitRegistry::new();
        assert!(registry.get("testGroup", "testKey").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn set_and_get_round_trip() {
        let registry = local_registry_with(&[
            ("regGroup1", "key1"),
            ("regGroup1", "key2"),
            ("regGroup2", "key1"),
            ("regGroup2", "key2"),
        ]);

        assert_eq!(registry.len(), 4);
        for (group, name) in
            [("regGroup1", "key1"), ("regGroup1", "key2"), ("regGroup2", "key1"), ("regGroup2", "key2")]
        {
            let found = registry.get(group, name).expect("registered");
            assert_eq!(found.group(), group);
            assert_eq!(found.name(), name);
        }
        assert!(registry.get("regGroup1", "missing").is_none());
    }

    #[tokio::test]
    async fn reset_empties_the_map() {
        let registry = local_registry_with(&[("regReset", "a")]);
        assert!(!registry.is_empty());
        registry.reset();
        assert!(registry.get("regReset", "a").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn entries_come_back_sorted() {
        let registry = local_registry_with(&[
            ("regSortB", "z"),
            ("regSortA", "b"),
            ("regSortA", "a"),
        ]);
        let keys: Vec<(String, String)> =
            registry.entries().into_iter().map(|(g, n, _)| (g, n)).collect();
        assert_eq!(
            keys,
            vec![
                ("regSortA".to_owned(), "a".to_owned()),
                ("regSortA".to_owned(), "b".to_owned()),
                ("regSortB".to_owned(), "z".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_registry_serializes_to_an_empty_array() {
        let registry = CircuitRegistry::new();
        assert_eq!(registry.to_json().await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn json_document_groups_circuits_and_carries_every_field() {
        let registry = local_registry_with(&[
            ("regJson", "alpha"),
            ("regJson", "beta"),
        ]);
        let circuit = registry.get("regJson", "alpha").unwrap();
        circuit.metric().success(std::time::Duration::from_millis(2)).await;
        circuit.metric().timeout().await;

        let json = registry.to_json().await.unwrap();
        let parsed: Value = serde_json::from_str(&json).expect("well-formed JSON");

        let groups = parsed.as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["group"], "regJson");

        let docs = groups[0]["circuit"].as_array().unwrap();
        assert_eq!(docs.len(), 2);
        let alpha = &docs[0];
        for key in [
            "name", "group", "isOpen", "state", "percentile90", "mean", "variance", "max", "min",
            "failures", "timeouts", "fallback", "panics", "fallbackErrors", "total", "success",
            "errorPercentage", "lastSuccess", "lastFailure", "lastTimeout",
        ] {
            assert!(alpha.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(alpha["name"], "alpha");
        assert_eq!(alpha["isOpen"], false);
        assert_eq!(alpha["state"], "closed: not enough requests");
        assert_eq!(alpha["failures"], 1);
        assert_eq!(alpha["timeouts"], 1);
        assert_eq!(alpha["success"], 1);
        assert_eq!(alpha["total"], 2);
        assert!(alpha["lastTimeout"].is_string());
        assert!(docs[1]["lastSuccess"].is_null());
    }

    #[tokio::test]
    async fn serializing_does_not_mutate_the_registry() {
        let registry = local_registry_with(&[("regNoMut", "only")]);
        let circuit = registry.get("regNoMut", "only").unwrap();
        circuit.metric().fail().await;

        let before = circuit.metric().health_counts().await;
        let _ = registry.to_json().await.unwrap();
        let _ = registry.to_json().await.unwrap();
        let after = circuit.metric().health_counts().await;

        assert_eq!(before, after);
        assert_eq!(registry.len(), 1);
    }
}
