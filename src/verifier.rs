//! Replacement discovery and health acceptance
//!
//! Given an expected replacement count and a creation-time floor, the
//! verifier polls the compute fabric for freshly launched instances carrying
//! the target fingerprint, waits for each to reach the running state, and
//! applies the retry decision table to whatever failed.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::compute::{ComputeBackend, Filter, Instance, InstanceState, TAG_COMPONENT};
use crate::state::Role;
use crate::strategy::StrategyTiming;
use crate::{Error, Result};

/// Failed fraction of a fleet larger than two that still permits a retry
const RETRY_FAILURE_THRESHOLD: f64 = 0.25;

/// Maximum verifier entries within one invocation chain
const MAX_PROVISION_ATTEMPTS: u32 = 2;

/// Waits for and health-checks replacement instances
pub struct ReplacementVerifier<'a> {
    compute: &'a dyn ComputeBackend,
    fingerprint: &'a str,
    timing: &'a StrategyTiming,
}

impl<'a> ReplacementVerifier<'a> {
    /// Create a verifier against the given backend and target fingerprint
    pub fn new(
        compute: &'a dyn ComputeBackend,
        fingerprint: &'a str,
        timing: &'a StrategyTiming,
    ) -> Self {
        Self {
            compute,
            fingerprint,
            timing,
        }
    }

    /// Wait for `expected` accepted replacements for `role`, launched at or
    /// after `floor`. Returns the accepted instance ids, accumulated across
    /// any retry rounds.
    pub async fn verify(
        &self,
        role: Role,
        expected: usize,
        floor: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut accepted = Vec::new();
        let mut expected = expected;
        let mut floor = floor;
        let mut attempts = 0u32;

        while expected > 0 {
            attempts += 1;
            info!(
                component = %role,
                expected,
                attempt = attempts,
                "Waiting for replacement instances"
            );

            let candidates = self.find_replacements(role, expected, floor).await?;
            let (healthy, failed) = self.check_health(&candidates).await;
            accepted.extend(healthy);

            if failed.is_empty() {
                break;
            }

            let total = candidates.len();
            let failed_count = failed.len();

            // Failure rate at or under 25% permits a retry. Fleets of one or
            // two instances instead tolerate a single failed candidate.
            if total > 2 {
                if failed_count as f64 / total as f64 > RETRY_FAILURE_THRESHOLD {
                    return Err(Error::verification(format!(
                        "{failed_count} of {total} replacement {role} instances failed \
                         verification: failure threshold too high"
                    )));
                }
            } else if failed_count > 1 {
                return Err(Error::verification(format!(
                    "{failed_count} of {total} replacement {role} instances failed \
                     verification: failure threshold too high"
                )));
            }

            if attempts >= MAX_PROVISION_ATTEMPTS {
                return Err(Error::verification(format!(
                    "replacement {role} instances failed verification: \
                     reached max number of attempts"
                )));
            }

            info!(
                component = %role,
                failed = ?failed,
                "Failed to find valid replacement instances, trying again"
            );

            floor = Utc::now();
            for id in &failed {
                if let Err(e) = self.compute.terminate_instance(id).await {
                    warn!(instance = %id, error = %e, "Failed to terminate failed candidate");
                }
                tokio::time::sleep(self.timing.retry_termination_grace).await;
            }
            expected = failed_count;
        }

        Ok(accepted)
    }

    /// Poll until at least `expected` instances carrying the target
    /// fingerprint and launched at or after `floor` are visible
    async fn find_replacements(
        &self,
        role: Role,
        expected: usize,
        floor: DateTime<Utc>,
    ) -> Result<Vec<Instance>> {
        let filters = [
            Filter::tag(TAG_COMPONENT, role.as_str()),
            Filter::Fingerprint(self.fingerprint.to_string()),
            Filter::states(vec![InstanceState::Pending, InstanceState::Running]),
        ];

        for attempt in 0..self.timing.find_poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.timing.find_poll_interval).await;
            }

            let found: Vec<Instance> = self
                .compute
                .describe_instances(&filters)
                .await?
                .into_iter()
                .filter(|i| i.launch_time >= floor)
                .collect();

            if found.len() >= expected {
                return Ok(found);
            }

            info!(
                component = %role,
                found = found.len(),
                expected,
                "Waiting for replacement instances to appear"
            );
        }

        Err(Error::verification(format!(
            "timed out waiting for {expected} replacement {role} instances to appear"
        )))
    }

    /// Partition candidates into accepted and failed ids
    async fn check_health(&self, candidates: &[Instance]) -> (Vec<String>, Vec<String>) {
        let mut accepted = Vec::new();
        let mut failed = Vec::new();
        for candidate in candidates {
            if self.reaches_running(&candidate.id).await {
                accepted.push(candidate.id.clone());
            } else {
                warn!(instance = %candidate.id, "Replacement instance never reached running");
                failed.push(candidate.id.clone());
            }
        }
        (accepted, failed)
    }

    async fn reaches_running(&self, id: &str) -> bool {
        let filters = [Filter::Ids(vec![id.to_string()])];
        for attempt in 0..self.timing.health_poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.timing.health_poll_interval).await;
            }
            match self.compute.describe_instances(&filters).await {
                Ok(instances)
                    if instances
                        .iter()
                        .any(|i| i.id == id && i.state == InstanceState::Running) =>
                {
                    return true;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(instance = %id, error = %e, "Health poll failed");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::MockComputeBackend;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn fast_timing() -> StrategyTiming {
        StrategyTiming {
            termination_grace: Duration::ZERO,
            convergence_poll_attempts: 3,
            convergence_poll_interval: Duration::ZERO,
            find_poll_attempts: 3,
            find_poll_interval: Duration::ZERO,
            health_poll_attempts: 2,
            health_poll_interval: Duration::ZERO,
            retry_termination_grace: Duration::ZERO,
        }
    }

    fn fresh(id: &str, state: InstanceState) -> Instance {
        Instance {
            id: id.to_string(),
            launch_time: Utc::now(),
            state,
            tags: BTreeMap::new(),
        }
    }

    /// Floor safely before every `fresh` launch time
    fn floor() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(60)
    }

    /// Mock compute where discovery returns `fleet` and health polls report
    /// the per-instance state from `fleet`.
    fn backend_with(fleet: Vec<Instance>) -> MockComputeBackend {
        let mut compute = MockComputeBackend::new();
        let discovery = fleet.clone();
        compute
            .expect_describe_instances()
            .returning(move |filters| {
                let ids = filters.iter().find_map(|f| match f {
                    Filter::Ids(ids) => Some(ids.clone()),
                    _ => None,
                });
                match ids {
                    Some(ids) => Ok(discovery
                        .iter()
                        .filter(|i| ids.contains(&i.id))
                        .cloned()
                        .collect()),
                    None => Ok(discovery.clone()),
                }
            });
        compute
    }

    #[tokio::test]
    async fn single_replacement_is_accepted() {
        let compute = backend_with(vec![fresh("i-new", InstanceState::Running)]);
        let timing = fast_timing();
        let verifier = ReplacementVerifier::new(&compute, "v2", &timing);

        let accepted = verifier.verify(Role::Etcd, 1, floor()).await.unwrap();
        assert_eq!(accepted, vec!["i-new"]);
    }

    #[tokio::test]
    async fn expecting_zero_is_trivially_satisfied() {
        let compute = MockComputeBackend::new();
        let timing = fast_timing();
        let verifier = ReplacementVerifier::new(&compute, "v2", &timing);

        let accepted = verifier.verify(Role::Node, 0, floor()).await.unwrap();
        assert!(accepted.is_empty());
    }

    #[tokio::test]
    async fn stale_instances_are_not_replacements() {
        let mut stale = fresh("i-old", InstanceState::Running);
        stale.launch_time = Utc::now() - chrono::Duration::hours(1);

        let compute = backend_with(vec![stale]);
        let timing = fast_timing();
        let verifier = ReplacementVerifier::new(&compute, "v2", &timing);

        let err = verifier.verify(Role::Master, 1, floor()).await.unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn large_fleet_over_threshold_aborts() {
        // 3 of 10 failed: 30% > 25%
        let mut fleet: Vec<Instance> = (0..7)
            .map(|n| fresh(&format!("i-ok{n}"), InstanceState::Running))
            .collect();
        fleet.extend((0..3).map(|n| fresh(&format!("i-bad{n}"), InstanceState::Pending)));

        let compute = backend_with(fleet);
        let timing = fast_timing();
        let verifier = ReplacementVerifier::new(&compute, "v2", &timing);

        let err = verifier.verify(Role::Node, 10, floor()).await.unwrap_err();
        assert!(err.to_string().contains("failure threshold too high"));
    }

    #[tokio::test]
    async fn large_fleet_at_threshold_retries() {
        // 2 of 10 failed: exactly 20%, under the 25% ceiling, so a retry
        // is permitted. The retry round moves the creation-time floor
        // forward, the original fleet no longer qualifies, and discovery
        // times out rather than aborting on the threshold.
        let mut fleet: Vec<Instance> = (0..8)
            .map(|n| fresh(&format!("i-ok{n}"), InstanceState::Running))
            .collect();
        fleet.extend((0..2).map(|n| fresh(&format!("i-bad{n}"), InstanceState::Pending)));

        let mut compute = backend_with(fleet);
        compute.expect_terminate_instance().returning(|_| Ok(()));

        let timing = fast_timing();
        let verifier = ReplacementVerifier::new(&compute, "v2", &timing);

        let err = verifier.verify(Role::Node, 10, floor()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn small_fleet_with_two_failures_aborts() {
        let fleet = vec![
            fresh("i-bad1", InstanceState::Pending),
            fresh("i-bad2", InstanceState::Pending),
        ];
        let compute = backend_with(fleet);
        let timing = fast_timing();
        let verifier = ReplacementVerifier::new(&compute, "v2", &timing);

        let err = verifier.verify(Role::Master, 2, floor()).await.unwrap_err();
        assert!(err.to_string().contains("failure threshold too high"));
    }

    #[tokio::test]
    async fn total_failure_of_one_is_retried_then_capped() {
        // N=1, k=1 is 100% failure but the small-fleet branch only rejects
        // k > 1, so one retry happens; the second failed round then trips
        // the attempt cap.
        let mut bad = fresh("i-bad", InstanceState::Pending);
        bad.launch_time = Utc::now() + chrono::Duration::hours(1);
        let mut compute = backend_with(vec![bad]);
        compute
            .expect_terminate_instance()
            .times(1)
            .returning(|_| Ok(()));

        let timing = fast_timing();
        let verifier = ReplacementVerifier::new(&compute, "v2", &timing);

        let err = verifier.verify(Role::Node, 1, floor()).await.unwrap_err();
        assert!(err.to_string().contains("reached max number of attempts"));
    }
}
