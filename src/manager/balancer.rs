//! Round-robin selection among running instances of one capability

use crate::error::{OrchestratorError, Result};
use crate::service::{CapabilityType, Service};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Round-robin balancer with one counter per capability
#[derive(Debug, Default)]
pub struct LoadBalancer {
    counters: Mutex<HashMap<CapabilityType, usize>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick `candidates[counter % len]` and advance the capability's counter.
    ///
    /// Candidates are expected to share one capability; the first one's
    /// capability keys the counter.
    pub fn select(&self, candidates: &[Arc<Service>]) -> Result<Arc<Service>> {
        let first = candidates.first().ok_or(OrchestratorError::NoCandidates)?;

        let mut counters = self.counters.lock();
        let counter = counters.entry(first.capability()).or_insert(0);
        let chosen = candidates[*counter % candidates.len()].clone();
        *counter = counter.wrapping_add(1);

        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ScriptedProvider;

    fn service(id: &str, capability: CapabilityType) -> Arc<Service> {
        Arc::new(Service::new(
            id,
            capability,
            Arc::new(ScriptedProvider::decision(id, "HOLD", 0.5)),
        ))
    }

    #[test]
    fn test_round_robin_is_fair() {
        let balancer = LoadBalancer::new();
        let candidates = vec![
            service("a", CapabilityType::Decision),
            service("b", CapabilityType::Decision),
            service("c", CapabilityType::Decision),
        ];

        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select(&candidates).unwrap().id().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_counters_are_per_capability() {
        let balancer = LoadBalancer::new();
        let decisions = vec![service("d1", CapabilityType::Decision), service("d2", CapabilityType::Decision)];
        let sentiment = vec![service("s1", CapabilityType::Sentiment), service("s2", CapabilityType::Sentiment)];

        assert_eq!(balancer.select(&decisions).unwrap().id(), "d1");
        assert_eq!(balancer.select(&sentiment).unwrap().id(), "s1");
        assert_eq!(balancer.select(&decisions).unwrap().id(), "d2");
        assert_eq!(balancer.select(&sentiment).unwrap().id(), "s2");
    }

    #[test]
    fn test_shrinking_candidate_list_stays_in_bounds() {
        let balancer = LoadBalancer::new();
        let three = vec![
            service("a", CapabilityType::Decision),
            service("b", CapabilityType::Decision),
            service("c", CapabilityType::Decision),
        ];
        balancer.select(&three).unwrap();
        balancer.select(&three).unwrap();

        let one = vec![three[0].clone()];
        assert_eq!(balancer.select(&one).unwrap().id(), "a");
    }

    #[test]
    fn test_empty_candidates() {
        let balancer = LoadBalancer::new();
        assert!(matches!(balancer.select(&[]), Err(OrchestratorError::NoCandidates)));
    }
}
