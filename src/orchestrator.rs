//! Top-level orchestration
//!
//! Loads the inventory once, brackets the run with cluster-autoscaler
//! management when workers are in scope, fans out one task per requested
//! role, and reports the aggregate outcome. Component failures never cross
//! component boundaries and never abort the run.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::autoscaler::AutoscalerControl;
use crate::compute::ComputeBackend;
use crate::config::RollerConfig;
use crate::inventory::Inventory;
use crate::kube::OrchestratorBackend;
use crate::notify::Notifier;
use crate::state::{ComponentRun, Role, RollerState};
use crate::strategy::{self, StrategyContext, StrategyTiming};
use crate::Result;

/// Drives one complete rolling-replacement run
pub struct Orchestrator {
    compute: Arc<dyn ComputeBackend>,
    kube: Arc<dyn OrchestratorBackend>,
    notifier: Arc<dyn Notifier>,
    config: RollerConfig,
    timing: StrategyTiming,
}

impl Orchestrator {
    /// Assemble an orchestrator over the given backends
    pub fn new(
        compute: Arc<dyn ComputeBackend>,
        kube: Arc<dyn OrchestratorBackend>,
        notifier: Arc<dyn Notifier>,
        config: RollerConfig,
    ) -> Self {
        let timing = StrategyTiming::with_termination_grace(config.termination_grace());
        Self {
            compute,
            kube,
            notifier,
            config,
            timing,
        }
    }

    /// Replace the production pacing and poll budgets
    pub fn with_timing(mut self, timing: StrategyTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Run the replacement across every requested role.
    ///
    /// Returns an error only for configuration and inventory failures,
    /// which are fatal before any side effect. Component and autoscaler
    /// failures are recorded in the returned state.
    pub async fn run(&self) -> Result<RollerState> {
        let identity = self.config.cluster_identity();
        let targets = self.config.target_components()?;
        let fingerprint = &self.config.target_fingerprint;

        let inventory = Inventory::load(&*self.compute, &identity, fingerprint).await?;
        let mut state = RollerState::new(inventory);

        // The autoscaler is only in play when workers are being replaced.
        if targets.contains(&Role::Node) {
            AutoscalerControl::new(&*self.kube)
                .disable(&mut state.autoscaler)
                .await;
        }

        let start = state.start_text(&identity, &targets, fingerprint);
        debug!("{start}");
        if let Err(e) = self.notifier.post(&start).await {
            error!(error = %e, "Failed to post the start notification");
        }

        info!(cluster = %identity, components = ?targets, "Starting rolling replacement");

        let shared_inventory = Arc::new(state.inventory.clone());
        let mut handles = Vec::new();
        for role in &targets {
            let role = *role;
            let compute = Arc::clone(&self.compute);
            let kube = Arc::clone(&self.kube);
            let fingerprint = fingerprint.clone();
            let timing = self.timing.clone();
            let inventory = Arc::clone(&shared_inventory);

            handles.push((
                role,
                tokio::spawn(async move {
                    let ctx = StrategyContext {
                        compute: &*compute,
                        kube: &*kube,
                        fingerprint: &fingerprint,
                        timing: &timing,
                    };
                    let variant = strategy::strategy_for(role);
                    strategy::run(variant.as_ref(), &ctx, &inventory).await
                }),
            ));
        }

        for (role, handle) in handles {
            match handle.await {
                Ok(run) => state.components.push(run),
                Err(e) => {
                    // A panicked task still yields a failed component record.
                    error!(component = %role, error = %e, "Component task aborted");
                    let mut run = ComponentRun::new(role);
                    run.fail(format!("component task aborted: {e}"));
                    state.components.push(run);
                }
            }
        }

        if state.autoscaler.managed {
            AutoscalerControl::new(&*self.kube)
                .enable(&mut state.autoscaler)
                .await;
        }

        let summary = state.summary_text(&identity, &targets);
        debug!("{summary}");
        if let Err(e) = self.notifier.post(&summary).await {
            error!(error = %e, "Failed to post the summary notification");
        }

        info!(
            cluster = %identity,
            success = state.overall_success(),
            "Rolling replacement finished"
        );
        Ok(state)
    }
}
