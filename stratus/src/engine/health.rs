use chrono::{DateTime, Duration as ChronoDuration, Utc};
use smol_str::SmolStr;
use std::collections::{HashMap, HashSet};
use stratus_model::event::Heartbeat;

/// Tracks component heartbeats from `system.health.*` and reports components
/// that stop beating.
///
/// Alerts fire once per unhealthy transition, not once per check.
#[derive(Debug)]
pub struct HealthMonitor {
    threshold: ChronoDuration,
    last_seen: HashMap<SmolStr, DateTime<Utc>>,
    unhealthy: HashSet<SmolStr>,
}

impl HealthMonitor {
    pub fn new(threshold: std::time::Duration) -> Self {
        Self {
            threshold: ChronoDuration::from_std(threshold)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
            last_seen: HashMap::new(),
            unhealthy: HashSet::new(),
        }
    }

    pub fn observe(&mut self, heartbeat: &Heartbeat) {
        self.last_seen
            .insert(heartbeat.component.clone(), heartbeat.time);
        self.unhealthy.remove(&heartbeat.component);
    }

    /// Components whose last heartbeat is older than the threshold, reported
    /// once per lapse.
    pub fn newly_unhealthy(&mut self, now: DateTime<Utc>) -> Vec<(SmolStr, DateTime<Utc>)> {
        let mut lapsed = Vec::new();
        for (component, last) in &self.last_seen {
            if now - *last > self.threshold && !self.unhealthy.contains(component) {
                lapsed.push((component.clone(), *last));
            }
        }
        for (component, _) in &lapsed {
            self.unhealthy.insert(component.clone());
        }
        lapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lapse_reported_once_until_recovery() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(30));
        let start = Utc::now();
        monitor.observe(&Heartbeat::new("connector".into(), start));

        // Healthy inside the threshold.
        assert!(monitor
            .newly_unhealthy(start + ChronoDuration::seconds(10))
            .is_empty());

        // Lapsed: reported exactly once.
        let late = start + ChronoDuration::seconds(60);
        assert_eq!(monitor.newly_unhealthy(late).len(), 1);
        assert!(monitor.newly_unhealthy(late).is_empty());

        // A fresh heartbeat re-arms the alert.
        monitor.observe(&Heartbeat::new("connector".into(), late));
        assert!(monitor
            .newly_unhealthy(late + ChronoDuration::seconds(5))
            .is_empty());
        assert_eq!(
            monitor
                .newly_unhealthy(late + ChronoDuration::seconds(120))
                .len(),
            1
        );
    }
}
