//! Provision-then-terminate replacement
//!
//! Used for workers: the fleet is large and workload continuity requires new
//! capacity before old capacity leaves. The ASG desired count is doubled,
//! the replacement fleet verified, old nodes cordoned, and only then are the
//! original instances terminated, paced by a grace period.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::{RollingStrategy, StrategyContext};
use crate::compute::{ScalingAction, ScalingProcess};
use crate::cordon::cordon_nodes;
use crate::state::{ComponentRun, Role};
use crate::verifier::ReplacementVerifier;
use crate::{Error, Result};

const SUSPENDED: &[ScalingProcess] = &[ScalingProcess::AzRebalance, ScalingProcess::Terminate];
const RESUMED: &[ScalingProcess] = &[
    ScalingProcess::AzRebalance,
    ScalingProcess::Terminate,
    ScalingProcess::Launch,
];

/// Variant B: provision and verify the replacement fleet before terminating
/// the original instances
pub struct ProvisionFirst;

#[async_trait]
impl RollingStrategy for ProvisionFirst {
    fn role(&self) -> Role {
        Role::Node
    }

    fn suspended_processes(&self) -> &'static [ScalingProcess] {
        SUSPENDED
    }

    fn resumed_processes(&self) -> &'static [ScalingProcess] {
        RESUMED
    }

    async fn execute(&self, ctx: &StrategyContext<'_>, run: &ComponentRun) -> Result<()> {
        let role = self.role();
        let compute = ctx.compute;

        // A desired/current mismatch means the ASG is already mid-change;
        // replacing instances on top of that needs a human first.
        let mut desired = 0u32;
        for asg in &run.asgs {
            let d = compute.desired_count(asg).await.map_err(|e| {
                Error::operational(format!("failed to get the desired count for ASG {asg}: {e}"))
            })?;
            let current = compute.instance_count(asg).await.map_err(|e| {
                Error::operational(format!("failed to get the current count for ASG {asg}: {e}"))
            })?;
            info!(asg = %asg, desired = d, current, "Checked ASG counts");
            if current != d {
                return Err(Error::preflight(format!(
                    "the desired count ({d}) in the ASG {asg} does not match the number of \
                     instances in the ASG ({current})"
                )));
            }
            desired = d;
        }

        let creation_floor = Utc::now();
        for asg in &run.asgs {
            info!(asg = %asg, desired = desired * 2, "Inflating ASG desired count");
            compute.set_desired_count(asg, desired * 2).await.map_err(|e| {
                Error::operational(format!("failed to set the desired count for ASG {asg}: {e}"))
            })?;
        }

        let verifier = ReplacementVerifier::new(compute, ctx.fingerprint, ctx.timing);
        let replacements = verifier.verify(role, desired as usize, creation_floor).await?;
        info!(component = %role, replacements = replacements.len(), "Replacement fleet verified");

        // Keep the scheduler off the outgoing nodes while they drain away.
        // A cordon failure is logged but never blocks the termination step.
        let roster = run.roster_ids();
        if let Err(e) = cordon_nodes(ctx.kube, &roster).await {
            warn!(component = %role, error = %e, "Cordoning failed; continuing with termination");
        }

        // No backfill of the instances about to be terminated.
        for asg in &run.asgs {
            compute
                .manage_processes(asg, &[ScalingProcess::Launch], ScalingAction::Suspend)
                .await
                .map_err(|e| {
                    Error::operational(format!("failed to suspend processes on {asg}: {e}"))
                })?;
        }

        // Terminate must be unlocked or the ASG never evicts the instances.
        for asg in &run.asgs {
            compute
                .manage_processes(asg, &[ScalingProcess::Terminate], ScalingAction::Resume)
                .await
                .map_err(|e| {
                    Error::operational(format!("failed to resume processes on {asg}: {e}"))
                })?;
        }

        for id in &roster {
            compute.terminate_instance(id).await.map_err(|e| {
                Error::operational(format!("failed to terminate {role} instance {id}: {e}"))
            })?;
            info!(
                instance = %id,
                grace = ?ctx.timing.termination_grace,
                "Waiting before the next termination"
            );
            tokio::time::sleep(ctx.timing.termination_grace).await;
        }

        // Wait for each ASG to shed the terminated instances. On timeout the
        // desired count stays inflated at 2x; the error says so.
        for asg in &run.asgs {
            let mut converged = false;
            for _ in 0..ctx.timing.convergence_poll_attempts {
                let count = compute.instance_count(asg).await.map_err(|e| {
                    Error::operational(format!(
                        "failed to validate the number of instances in ASG {asg}: {e}"
                    ))
                })?;
                if count == desired {
                    info!(asg = %asg, "All old instances have left the ASG");
                    converged = true;
                    break;
                }
                info!(asg = %asg, count, desired, "Waiting for old instances to leave the ASG");
                tokio::time::sleep(ctx.timing.convergence_poll_interval).await;
            }
            if !converged {
                return Err(Error::convergence(format!(
                    "timed out waiting for instances to be removed from ASG {asg}; \
                     desired count remains inflated at {}",
                    desired * 2
                )));
            }
        }

        for asg in &run.asgs {
            info!(asg = %asg, desired, "Restoring ASG desired count");
            compute.set_desired_count(asg, desired).await.map_err(|e| {
                Error::operational(format!("failed to set the desired count for ASG {asg}: {e}"))
            })?;
        }

        Ok(())
    }
}
