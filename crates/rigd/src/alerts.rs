//! Alert registrations backing metrics expressions.
//!
//! The engine registers alert rules keyed by their owner and asks whether an
//! alert has fired. Firing comes from outside (the metrics stack pushes
//! notifications); absence of a firing alert is the common case, so the
//! query has no error channel.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::expressions::AlertRule;

pub trait AlertSource: Send + Sync {
    fn set_alert(&self, owner: &str, rule: AlertRule);
    fn unset_alert(&self, owner: &str);
    /// Returns (info, fired) for the owner's alert.
    fn fired_alert(&self, owner: &str) -> (String, bool);
}

#[derive(Debug)]
struct AlertEntry {
    rule: AlertRule,
    fired: bool,
    info: String,
}

/// In-memory alert registry. Notifications arrive via `fire`.
#[derive(Debug, Default)]
pub struct AlertRegistry {
    entries: Mutex<HashMap<String, AlertEntry>>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a notification for an owner's alert. Unknown owners are
    /// ignored: their registration was already dropped.
    pub fn fire(&self, owner: &str, info: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(owner) {
            entry.fired = true;
            entry.info = info.into();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl AlertSource for AlertRegistry {
    fn set_alert(&self, owner: &str, rule: AlertRule) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(owner.to_string()).or_insert(AlertEntry {
            rule,
            fired: false,
            info: String::new(),
        });
    }

    fn unset_alert(&self, owner: &str) {
        self.entries.lock().unwrap().remove(owner);
    }

    fn fired_alert(&self, owner: &str) -> (String, bool) {
        let entries = self.entries.lock().unwrap();
        match entries.get(owner) {
            Some(entry) if entry.fired => (entry.info.clone(), true),
            Some(entry) => (format!("alert on panel {} is quiet", entry.rule.panel), false),
            None => ("no alert registered".to_string(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::parse_alert_expr;

    fn rule() -> AlertRule {
        parse_alert_expr("avg() of query(throughput, 1m, now) is below(100)").unwrap()
    }

    #[test]
    fn unfired_alert_reports_quiet() {
        let registry = AlertRegistry::new();
        registry.set_alert("demo/pressure", rule());

        let (info, fired) = registry.fired_alert("demo/pressure");
        assert!(!fired);
        assert!(info.contains("throughput"));
    }

    #[test]
    fn fire_marks_the_owner_alert() {
        let registry = AlertRegistry::new();
        registry.set_alert("demo/pressure", rule());
        registry.fire("demo/pressure", "throughput dropped to 42");

        let (info, fired) = registry.fired_alert("demo/pressure");
        assert!(fired);
        assert_eq!(info, "throughput dropped to 42");
    }

    #[test]
    fn unset_drops_the_registration() {
        let registry = AlertRegistry::new();
        registry.set_alert("demo/pressure", rule());
        registry.unset_alert("demo/pressure");

        let (_, fired) = registry.fired_alert("demo/pressure");
        assert!(!fired);
        assert!(registry.is_empty());
    }

    #[test]
    fn firing_an_unknown_owner_is_ignored() {
        let registry = AlertRegistry::new();
        registry.fire("ghost", "boo");
        let (info, fired) = registry.fired_alert("ghost");
        assert!(!fired);
        assert_eq!(info, "no alert registered");
    }
}
