//! Per-scenario telemetry clients, created lazily and dropped in finalize.

use std::collections::HashMap;
use std::sync::Mutex;

/// Handle to a scenario's dashboard endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryClient {
    pub scenario: String,
    pub endpoint: String,
}

/// Keyed registry of telemetry clients. Read-mostly; exclusive only on
/// create and delete.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, TelemetryClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, scenario: &str, endpoint: &str) -> TelemetryClient {
        let mut clients = self.clients.lock().unwrap();
        clients
            .entry(scenario.to_string())
            .or_insert_with(|| TelemetryClient {
                scenario: scenario.to_string(),
                endpoint: endpoint.to_string(),
            })
            .clone()
    }

    pub fn get(&self, scenario: &str) -> Option<TelemetryClient> {
        self.clients.lock().unwrap().get(scenario).cloned()
    }

    pub fn remove(&self, scenario: &str) -> Option<TelemetryClient> {
        self.clients.lock().unwrap().remove(scenario)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent_and_keeps_the_first_endpoint() {
        let registry = ClientRegistry::new();
        let first = registry.get_or_create("demo", "http://grafana.demo:3000");
        let second = registry.get_or_create("demo", "http://other:3000");

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_releases_the_registration() {
        let registry = ClientRegistry::new();
        registry.get_or_create("demo", "http://grafana.demo:3000");

        assert!(registry.remove("demo").is_some());
        assert!(registry.remove("demo").is_none());
        assert!(registry.is_empty());
    }
}
