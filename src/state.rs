//! Per-role run records and the aggregate roller state
//!
//! `RollerState` is an explicit value owned by the orchestrator. Each role
//! task builds and returns its own [`ComponentRun`]; the aggregate is only
//! assembled after every task has finished, so no locking is needed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::compute::Instance;
use crate::inventory::Inventory;

/// A logical kind of node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Distributed consensus store
    Etcd,
    /// Control-plane master
    Master,
    /// Worker node
    Node,
}

impl Role {
    /// All roles, in the default rolling order
    pub const ALL: [Role; 3] = [Role::Node, Role::Master, Role::Etcd];

    /// The `ServiceComponent` tag value identifying this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Etcd => "etcd",
            Self::Master => "k8s-master",
            Self::Node => "k8s-node",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "etcd" => Ok(Self::Etcd),
            "k8s-master" => Ok(Self::Master),
            "k8s-node" => Ok(Self::Node),
            other => Err(format!("unknown component {other:?}")),
        }
    }
}

/// Terminal status of a component run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentStatus {
    /// Still in flight
    #[default]
    Pending,
    /// Every instance replaced and verified
    Success,
    /// Replacement aborted; see the recorded error
    Failure,
}

/// Lifecycle record for one role within a run.
///
/// Created when its strategy starts and transitions to success or failure
/// exactly once. The initial roster is never shrunk; replacement instances
/// discovered later are not members.
#[derive(Debug, Clone)]
pub struct ComponentRun {
    /// Which role this run replaces
    pub role: Role,
    /// When the strategy started
    pub started_at: DateTime<Utc>,
    /// When the strategy reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal status
    pub status: ComponentStatus,
    /// Initial roster of out-of-date instances
    pub instances: Vec<Instance>,
    /// ASGs the roster belongs to
    pub asgs: Vec<String>,
    /// Terminal error, when status is failure
    pub error: Option<String>,
}

impl ComponentRun {
    /// Create a pending run for the given role
    pub fn new(role: Role) -> Self {
        Self {
            role,
            started_at: Utc::now(),
            finished_at: None,
            status: ComponentStatus::Pending,
            instances: Vec::new(),
            asgs: Vec::new(),
            error: None,
        }
    }

    /// Ids of the initial roster, in roster order
    pub fn roster_ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.id.clone()).collect()
    }

    /// Mark the run successful; a no-op once terminal
    pub fn succeed(&mut self) {
        if self.status == ComponentStatus::Pending {
            self.status = ComponentStatus::Success;
            self.finished_at = Some(Utc::now());
        }
    }

    /// Mark the run failed with the given error; a no-op once terminal
    pub fn fail(&mut self, error: impl fmt::Display) {
        if self.status == ComponentStatus::Pending {
            self.status = ComponentStatus::Failure;
            self.error = Some(error.to_string());
            self.finished_at = Some(Utc::now());
        }
    }

    /// Wall-clock duration of the run so far
    pub fn duration(&self) -> Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// Sub-status of cluster-autoscaler management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoscalerStatus {
    /// No autoscaler operation failed
    #[default]
    Success,
    /// A scale operation failed; surfaced in the summary, never fatal
    Failure,
}

impl fmt::Display for AutoscalerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

/// Cluster-autoscaler management state for one run
#[derive(Debug, Clone, Default)]
pub struct AutoscalerState {
    /// True once the autoscaler was successfully disabled; a re-enable is
    /// then owed at the end of the run
    pub managed: bool,
    /// Whether any scale operation failed
    pub status: AutoscalerStatus,
    /// Error from the failed scale operation, if any
    pub error: Option<String>,
}

/// Aggregate state for one invocation of the roller
#[derive(Debug, Clone)]
pub struct RollerState {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Snapshot of out-of-date instances, computed once
    pub inventory: Inventory,
    /// One record per requested role, populated as tasks finish
    pub components: Vec<ComponentRun>,
    /// Cluster-autoscaler sub-state, written only from the main task
    pub autoscaler: AutoscalerState,
}

impl RollerState {
    /// Create the aggregate around a freshly loaded inventory
    pub fn new(inventory: Inventory) -> Self {
        Self {
            started_at: Utc::now(),
            inventory,
            components: Vec::new(),
            autoscaler: AutoscalerState::default(),
        }
    }

    /// Overall success: every component succeeded and no autoscaler
    /// operation failed
    pub fn overall_success(&self) -> bool {
        self.components
            .iter()
            .all(|c| c.status == ComponentStatus::Success)
            && self.autoscaler.status != AutoscalerStatus::Failure
    }

    /// Start-of-run notification text
    pub fn start_text(&self, cluster: &str, targets: &[Role], fingerprint: &str) -> String {
        format!(
            "Starting a rolling update on cluster {} with the components {} as the target components.\n\
             Target fingerprint is set to {}\n\
             Management of cluster autoscaler is set to {}",
            cluster,
            render_roles(targets),
            fingerprint,
            self.autoscaler.managed,
        )
    }

    /// End-of-run summary text
    pub fn summary_text(&self, cluster: &str, targets: &[Role]) -> String {
        let status = if self.overall_success() {
            "success"
        } else {
            "failure"
        };

        let mut summary = format!(
            "Finished a rolling update on cluster {} with the components {} as the target components.\n\
             Overall status: {}\n\
             Overall duration: {}\n",
            cluster,
            render_roles(targets),
            status,
            format_whole_minutes(Utc::now() - self.started_at),
        );

        for component in &self.components {
            let status = match component.status {
                ComponentStatus::Success => "success",
                _ => "failure",
            };
            summary.push_str(&format!(
                "Component {} status: {} - duration: {}\n",
                component.role,
                status,
                format_whole_minutes(component.duration()),
            ));
            if let Some(ref error) = component.error {
                summary.push_str(&format!("Component {} error: {}\n", component.role, error));
            }
        }

        summary.push_str(&format!(
            "Cluster autoscaler managed: {}, status: {}",
            self.autoscaler.managed, self.autoscaler.status,
        ));
        summary
    }
}

fn render_roles(targets: &[Role]) -> String {
    let names: Vec<&str> = targets.iter().map(Role::as_str).collect();
    format!("[{}]", names.join(", "))
}

/// Render a duration truncated to whole minutes, e.g. `1h7m` or `42m`
fn format_whole_minutes(duration: Duration) -> String {
    let minutes = duration.num_minutes().max(0);
    if minutes >= 60 {
        format!("{}h{}m", minutes / 60, minutes % 60)
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_their_wire_names() {
        assert_eq!("etcd".parse::<Role>().unwrap(), Role::Etcd);
        assert_eq!("k8s-master".parse::<Role>().unwrap(), Role::Master);
        assert_eq!("k8s-node".parse::<Role>().unwrap(), Role::Node);
        assert!("controller".parse::<Role>().is_err());
    }

    #[test]
    fn component_run_is_terminal_exactly_once() {
        let mut run = ComponentRun::new(Role::Etcd);
        run.fail("etcd components are not healthy");
        run.succeed();

        assert_eq!(run.status, ComponentStatus::Failure);
        assert!(run.error.as_deref().unwrap().contains("not healthy"));
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn overall_success_requires_all_components_and_autoscaler() {
        let mut state = RollerState::new(Inventory::empty());

        let mut ok = ComponentRun::new(Role::Master);
        ok.succeed();
        state.components.push(ok);
        assert!(state.overall_success());

        state.autoscaler.status = AutoscalerStatus::Failure;
        assert!(!state.overall_success());

        state.autoscaler.status = AutoscalerStatus::Success;
        let mut failed = ComponentRun::new(Role::Node);
        failed.fail("timed out");
        state.components.push(failed);
        assert!(!state.overall_success());
    }

    #[test]
    fn summary_lists_components_and_autoscaler() {
        let mut state = RollerState::new(Inventory::empty());
        let mut run = ComponentRun::new(Role::Node);
        run.fail("the desired count (6) in the ASG workers does not match");
        state.components.push(run);

        let summary = state.summary_text("prod-us-east-1-main", &[Role::Node]);
        assert!(summary.contains("Overall status: failure"));
        assert!(summary.contains("Component k8s-node status: failure"));
        assert!(summary.contains("Component k8s-node error:"));
        assert!(summary.contains("Cluster autoscaler managed: false, status: success"));
    }

    #[test]
    fn durations_render_as_whole_minutes() {
        assert_eq!(format_whole_minutes(Duration::seconds(59)), "0m");
        assert_eq!(format_whole_minutes(Duration::seconds(125)), "2m");
        assert_eq!(format_whole_minutes(Duration::minutes(67)), "1h7m");
    }
}
