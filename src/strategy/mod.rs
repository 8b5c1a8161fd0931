//! Rolling replacement strategies
//!
//! Both variants share a preparation phase (partition the inventory, resolve
//! ASG membership, gate on etcd health, suspend scaling processes) and the
//! guarantee that suspended processes are resumed on every exit path. The
//! variants differ in ordering: [`TerminateFirst`] retires an instance and
//! then waits for its replacement; [`ProvisionFirst`] provisions the whole
//! replacement fleet before any termination.

pub mod provision_first;
pub mod terminate_first;

pub use provision_first::ProvisionFirst;
pub use terminate_first::TerminateFirst;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::compute::{
    instances_matching_tag, unique_tag_values, ComputeBackend, Instance, ScalingAction,
    ScalingProcess, TAG_ASG, TAG_HEALTHY,
};
use crate::inventory::Inventory;
use crate::kube::OrchestratorBackend;
use crate::state::{ComponentRun, Role};
use crate::{Error, Result};

/// Pacing and poll budgets for a strategy run.
///
/// Defaults are the production constants; tests shrink them.
#[derive(Debug, Clone)]
pub struct StrategyTiming {
    /// Grace period between sequential terminations of original instances
    pub termination_grace: Duration,
    /// Poll attempts while waiting for an ASG to shed terminated instances
    pub convergence_poll_attempts: u32,
    /// Interval between convergence polls
    pub convergence_poll_interval: Duration,
    /// Poll attempts while waiting for replacement instances to appear
    pub find_poll_attempts: u32,
    /// Interval between discovery polls
    pub find_poll_interval: Duration,
    /// Poll attempts while waiting for one replacement to reach running
    pub health_poll_attempts: u32,
    /// Interval between health polls
    pub health_poll_interval: Duration,
    /// Grace period between terminations of failed replacement candidates
    pub retry_termination_grace: Duration,
}

impl Default for StrategyTiming {
    fn default() -> Self {
        Self {
            termination_grace: Duration::from_secs(180),
            convergence_poll_attempts: 30,
            convergence_poll_interval: Duration::from_secs(30),
            find_poll_attempts: 30,
            find_poll_interval: Duration::from_secs(30),
            health_poll_attempts: 30,
            health_poll_interval: Duration::from_secs(30),
            retry_termination_grace: Duration::from_secs(30),
        }
    }
}

impl StrategyTiming {
    /// Production timing with the given inter-termination grace period
    pub fn with_termination_grace(grace: Duration) -> Self {
        Self {
            termination_grace: grace,
            ..Default::default()
        }
    }
}

/// Backends and run-wide parameters a strategy executes against
pub struct StrategyContext<'a> {
    /// Compute fabric
    pub compute: &'a dyn ComputeBackend,
    /// Kubernetes scheduler
    pub kube: &'a dyn OrchestratorBackend,
    /// Target provisioning fingerprint
    pub fingerprint: &'a str,
    /// Pacing and poll budgets
    pub timing: &'a StrategyTiming,
}

/// One rolling-replacement algorithm.
///
/// Implementations drive only the variant-specific middle part; preparation
/// and the deferred process resumption are shared and live in [`run`].
#[async_trait]
pub trait RollingStrategy: Send + Sync {
    /// Role this strategy replaces
    fn role(&self) -> Role;

    /// Scaling processes suspended before any destructive action
    fn suspended_processes(&self) -> &'static [ScalingProcess];

    /// Scaling processes resumed on every exit path
    fn resumed_processes(&self) -> &'static [ScalingProcess];

    /// Replace the prepared roster
    async fn execute(&self, ctx: &StrategyContext<'_>, run: &ComponentRun) -> Result<()>;
}

/// Select the strategy variant for a role.
///
/// Workers are replaced provision-first; etcd and masters live in small
/// capacity-capped ASGs and are replaced terminate-first.
pub fn strategy_for(role: Role) -> Box<dyn RollingStrategy> {
    match role {
        Role::Node => Box::new(ProvisionFirst),
        Role::Etcd | Role::Master => Box::new(TerminateFirst::new(role)),
    }
}

/// Run one role's replacement end to end, producing its [`ComponentRun`].
///
/// Never returns an error: every failure is recorded on the run.
pub async fn run(
    strategy: &dyn RollingStrategy,
    ctx: &StrategyContext<'_>,
    inventory: &Inventory,
) -> ComponentRun {
    let role = strategy.role();
    let mut run = ComponentRun::new(role);
    info!(component = %role, "Starting instance replacement");

    if let Err(e) = prepare(inventory, &mut run) {
        warn!(component = %role, error = %e, "Preparation failed");
        run.fail(e);
        return run;
    }

    if run.instances.is_empty() {
        info!(component = %role, "No out-of-date instances; nothing to do");
        run.succeed();
        return run;
    }

    let executed = match suspend_processes(ctx, &run, strategy.suspended_processes()).await {
        Ok(()) => strategy.execute(ctx, &run).await,
        Err(e) => Err(e),
    };

    // Deferred resume: must run on success and on every failure path above,
    // including a suspension that failed partway through the ASG list.
    let resumed = resume_processes(ctx, &run, strategy.resumed_processes()).await;

    match executed {
        Ok(()) => match resumed {
            Ok(()) => run.succeed(),
            Err(e) => run.fail(e),
        },
        Err(e) => {
            warn!(component = %role, error = %e, "Replacement failed");
            run.fail(e);
        }
    }

    info!(component = %role, status = ?run.status, "Replacement finished");
    run
}

/// Partition the inventory for the role, resolve ASG membership, and gate on
/// etcd health. Performs no mutations.
fn prepare(inventory: &Inventory, run: &mut ComponentRun) -> Result<()> {
    run.instances = inventory.for_role(run.role);
    if run.instances.is_empty() {
        return Ok(());
    }

    run.asgs = unique_tag_values(TAG_ASG, &run.instances)?;

    if run.role == Role::Etcd {
        validate_etcd_health(&run.instances)?;
    }

    debug!(
        component = %run.role,
        instances = ?run.roster_ids(),
        asgs = ?run.asgs,
        "Prepared component roster"
    );
    Ok(())
}

/// Every etcd member must carry `healthy=True` before anything is terminated
fn validate_etcd_health(instances: &[Instance]) -> Result<()> {
    let healthy = instances_matching_tag(TAG_HEALTHY, "True", instances);
    if healthy.len() != instances.len() {
        return Err(Error::preflight(
            "etcd components are not healthy. Please fix and run again",
        ));
    }
    Ok(())
}

async fn suspend_processes(
    ctx: &StrategyContext<'_>,
    run: &ComponentRun,
    processes: &[ScalingProcess],
) -> Result<()> {
    for asg in &run.asgs {
        info!(asg = %asg, ?processes, "Suspending autoscaling processes");
        ctx.compute
            .manage_processes(asg, processes, ScalingAction::Suspend)
            .await
            .map_err(|e| {
                Error::operational(format!("failed to suspend processes on {asg}: {e}"))
            })?;
    }
    Ok(())
}

/// Resume on every ASG, reporting the first failure only after attempting
/// all of them
async fn resume_processes(
    ctx: &StrategyContext<'_>,
    run: &ComponentRun,
    processes: &[ScalingProcess],
) -> Result<()> {
    let mut first_error = None;
    for asg in &run.asgs {
        info!(asg = %asg, ?processes, "Resuming autoscaling processes");
        if let Err(e) = ctx
            .compute
            .manage_processes(asg, processes, ScalingAction::Resume)
            .await
        {
            warn!(asg = %asg, error = %e, "Failed to resume autoscaling processes");
            if first_error.is_none() {
                first_error = Some(Error::operational(format!(
                    "failed to resume processes on {asg}: {e}"
                )));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
