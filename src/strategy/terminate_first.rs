//! Terminate-then-verify replacement
//!
//! Used for etcd and masters: their ASGs are small and capacity-capped, so
//! the fleet cannot be doubled. Each instance is terminated and its single
//! replacement verified before the next instance is touched.

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{RollingStrategy, StrategyContext};
use crate::compute::ScalingProcess;
use crate::state::{ComponentRun, Role};
use crate::verifier::ReplacementVerifier;
use crate::{Error, Result};

const SUSPENDED: &[ScalingProcess] = &[ScalingProcess::AzRebalance];

/// Variant A: terminate one instance at a time and wait for its replacement
pub struct TerminateFirst {
    role: Role,
}

impl TerminateFirst {
    /// Create the strategy for the given role
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

#[async_trait]
impl RollingStrategy for TerminateFirst {
    fn role(&self) -> Role {
        self.role
    }

    fn suspended_processes(&self) -> &'static [ScalingProcess] {
        SUSPENDED
    }

    fn resumed_processes(&self) -> &'static [ScalingProcess] {
        SUSPENDED
    }

    async fn execute(&self, ctx: &StrategyContext<'_>, run: &ComponentRun) -> Result<()> {
        let verifier = ReplacementVerifier::new(ctx.compute, ctx.fingerprint, ctx.timing);

        for instance in &run.instances {
            let terminate_time = Utc::now();
            info!(component = %self.role, instance = %instance.id, "Terminating instance");

            ctx.compute
                .terminate_instance(&instance.id)
                .await
                .map_err(|e| {
                    Error::operational(format!(
                        "failed to terminate {} instance {}: {e}",
                        self.role, instance.id
                    ))
                })?;

            // One replacement must appear and become healthy before the next
            // member goes away.
            verifier.verify(self.role, 1, terminate_time).await?;
        }

        Ok(())
    }
}
