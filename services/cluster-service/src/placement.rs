//! Capacity-aware host selection.
//!
//! Hosts qualify when both CPU and memory utilization are below their
//! thresholds. The qualifying host with the lowest CPU wins, lowest memory
//! breaking ties, and the first candidate in input order breaking exact ties.
//! When nothing qualifies the least loaded host is reported in a capacity
//! alert and no host is chosen.

use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::alert::{AlertFanout, CapacityAlert};
use crate::error::ServiceError;

/// Utilization summary of one host cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub host_id: String,
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

impl HostMetrics {
    pub fn new(host_id: impl Into<String>, cpu_pct: f64, mem_pct: f64) -> Self {
        Self {
            host_id: host_id.into(),
            cpu_pct,
            mem_pct,
        }
    }

    fn below(&self, thresholds: &Thresholds) -> bool {
        self.cpu_pct < thresholds.cpu_pct && self.mem_pct < thresholds.mem_pct
    }

    fn load_order(&self, other: &Self) -> Ordering {
        self.cpu_pct
            .total_cmp(&other.cpu_pct)
            .then(self.mem_pct.total_cmp(&other.mem_pct))
    }
}

/// Utilization ceilings, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_pct: 75.0,
            mem_pct: 80.0,
        }
    }
}

/// Result of ranking a candidate set.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// A host below both thresholds.
    Selected(HostMetrics),
    /// Every host is over a threshold; `best` is the least loaded.
    Exhausted { best: HostMetrics },
    /// No candidates.
    Empty,
}

/// Least loaded host by CPU then memory, first wins on ties.
fn least_loaded<'a>(hosts: impl Iterator<Item = &'a HostMetrics>) -> Option<&'a HostMetrics> {
    hosts.fold(None, |best, host| match best {
        Some(current) if host.load_order(current) != Ordering::Less => Some(current),
        _ => Some(host),
    })
}

/// Rank `candidates` against `thresholds`.
pub fn select(candidates: &[HostMetrics], thresholds: &Thresholds) -> Placement {
    if let Some(host) = least_loaded(candidates.iter().filter(|h| h.below(thresholds))) {
        return Placement::Selected(host.clone());
    }
    match least_loaded(candidates.iter()) {
        Some(best) => Placement::Exhausted { best: best.clone() },
        None => Placement::Empty,
    }
}

/// Chooses a host and raises alerts when the fleet is full.
#[derive(Clone, Default)]
pub struct PlacementSelector {
    thresholds: Thresholds,
    alerts: AlertFanout,
}

impl PlacementSelector {
    pub fn new(thresholds: Thresholds, alerts: AlertFanout) -> Self {
        Self { thresholds, alerts }
    }

    /// Pick a host for a new virtual cluster.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub async fn place(&self, candidates: &[HostMetrics]) -> Result<HostMetrics, ServiceError> {
        match select(candidates, &self.thresholds) {
            Placement::Selected(host) => {
                info!(
                    host_cluster_id = %host.host_id,
                    cpu_pct = host.cpu_pct,
                    mem_pct = host.mem_pct,
                    "Selected host cluster"
                );
                Ok(host)
            }
            Placement::Exhausted { best } => {
                warn!(
                    host_cluster_id = %best.host_id,
                    cpu_pct = best.cpu_pct,
                    mem_pct = best.mem_pct,
                    "No host cluster below capacity thresholds"
                );
                let alert = CapacityAlert {
                    best,
                    thresholds: self.thresholds,
                    candidates: candidates.len(),
                    raised_at: Utc::now(),
                };
                self.alerts.raise(&alert).await;
                Err(ServiceError::ResourceExhausted(format!(
                    "all {} host clusters are over capacity",
                    candidates.len()
                )))
            }
            Placement::Empty => Err(ServiceError::NotFound("no host found in region".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertError, CapacityAlerter};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn host(id: &str, cpu: f64, mem: f64) -> HostMetrics {
        HostMetrics::new(id, cpu, mem)
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<CapacityAlert>>);

    #[async_trait]
    impl CapacityAlerter for Recording {
        async fn raise(&self, alert: &CapacityAlert) -> Result<(), AlertError> {
            self.0.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    #[test]
    fn test_selects_only_host_below_both_thresholds() {
        let hosts = [host("a", 80.0, 90.0), host("b", 70.0, 60.0), host("c", 50.0, 70.0)];
        assert_eq!(
            select(&hosts, &Thresholds::default()),
            Placement::Selected(host("c", 50.0, 70.0))
        );
    }

    #[test]
    fn test_equal_cpu_lower_memory_wins() {
        let hosts = [host("a", 40.0, 60.0), host("b", 40.0, 30.0)];
        assert_eq!(
            select(&hosts, &Thresholds::default()),
            Placement::Selected(host("b", 40.0, 30.0))
        );
    }

    #[test]
    fn test_exact_tie_keeps_first() {
        let hosts = [host("a", 10.0, 10.0), host("b", 10.0, 10.0)];
        assert_eq!(
            select(&hosts, &Thresholds::default()),
            Placement::Selected(host("a", 10.0, 10.0))
        );
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let hosts = [host("a", 75.0, 10.0), host("b", 10.0, 80.0)];
        assert_eq!(
            select(&hosts, &Thresholds::default()),
            Placement::Exhausted { best: host("b", 10.0, 80.0) }
        );
    }

    #[test]
    fn test_all_over_threshold_reports_global_minimum() {
        let hosts = [host("a", 95.0, 90.0), host("b", 80.0, 85.0), host("c", 80.0, 99.0)];
        assert_eq!(
            select(&hosts, &Thresholds::default()),
            Placement::Exhausted { best: host("b", 80.0, 85.0) }
        );
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(select(&[], &Thresholds::default()), Placement::Empty);
    }

    #[tokio::test]
    async fn test_place_raises_alert_when_exhausted() {
        let recording = Arc::new(Recording::default());
        let selector = PlacementSelector::new(
            Thresholds::default(),
            AlertFanout::new(vec![recording.clone()]),
        );

        let hosts = [host("a", 90.0, 90.0), host("b", 85.0, 70.0)];
        let err = selector.place(&hosts).await.unwrap_err();
        assert!(matches!(err, ServiceError::ResourceExhausted(_)));

        let alerts = recording.0.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].best.host_id, "b");
        assert_eq!(alerts[0].candidates, 2);
    }

    #[tokio::test]
    async fn test_place_empty_is_not_found() {
        let recording = Arc::new(Recording::default());
        let selector = PlacementSelector::new(
            Thresholds::default(),
            AlertFanout::new(vec![recording.clone()]),
        );

        let err = selector.place(&[]).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(ref m) if m == "no host found in region"));
        assert!(recording.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_place_selects_without_alert() {
        let recording = Arc::new(Recording::default());
        let selector = PlacementSelector::new(
            Thresholds { cpu_pct: 50.0, mem_pct: 50.0 },
            AlertFanout::new(vec![recording.clone()]),
        );

        let chosen = selector.place(&[host("a", 20.0, 20.0)]).await.unwrap();
        assert_eq!(chosen.host_id, "a");
        assert!(recording.0.lock().unwrap().is_empty());
    }

    fn hosts_strategy() -> impl Strategy<Value = Vec<HostMetrics>> {
        proptest::collection::vec((0.0f64..=100.0, 0.0f64..=100.0), 0..12).prop_map(|pairs| {
            pairs
                .into_iter()
                .enumerate()
                .map(|(i, (cpu, mem))| host(&format!("h{i}"), cpu, mem))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_selected_host_is_below_and_minimal(hosts in hosts_strategy()) {
            let thresholds = Thresholds::default();
            match select(&hosts, &thresholds) {
                Placement::Selected(chosen) => {
                    prop_assert!(chosen.cpu_pct < thresholds.cpu_pct);
                    prop_assert!(chosen.mem_pct < thresholds.mem_pct);
                    for other in hosts.iter().filter(|h| h.below(&thresholds)) {
                        prop_assert!(chosen.load_order(other) != Ordering::Greater);
                    }
                }
                Placement::Exhausted { best } => {
                    prop_assert!(hosts.iter().all(|h| !h.below(&thresholds)));
                    prop_assert!(hosts.contains(&best));
                }
                Placement::Empty => prop_assert!(hosts.is_empty()),
            }
        }
    }
}
