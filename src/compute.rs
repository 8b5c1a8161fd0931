//! Cloud compute data model and backend interface
//!
//! The roller only ever talks to the compute fabric through
//! [`ComputeBackend`]. The shipped implementation drives the `aws` CLI;
//! tests substitute in-memory fakes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Tag marking cluster membership
pub const TAG_CLUSTER: &str = "KubernetesCluster";
/// Tag marking role membership
pub const TAG_COMPONENT: &str = "ServiceComponent";
/// Tag carrying ASG membership
pub const TAG_ASG: &str = "aws:autoscaling:groupName";
/// etcd-only liveness tag; the string "True" means healthy
pub const TAG_HEALTHY: &str = "healthy";
/// Tag carrying the provisioning fingerprint an instance was built from
pub const TAG_FINGERPRINT: &str = "AnsibleVersion";

/// Timeout for a single cloud CLI invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle state of a compute instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Launch requested, not yet running
    Pending,
    /// Up and billable
    Running,
    /// Termination requested, still winding down
    Terminating,
    /// Gone
    Terminated,
    /// Anything else (stopped, stopping, ...)
    Other,
}

impl InstanceState {
    /// Cloud-side state name, where one exists
    pub fn wire_name(&self) -> Option<&'static str> {
        match self {
            Self::Pending => Some("pending"),
            Self::Running => Some("running"),
            Self::Terminating => Some("shutting-down"),
            Self::Terminated => Some("terminated"),
            Self::Other => None,
        }
    }

    /// Parse a cloud-side state name
    pub fn from_wire(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::Terminating,
            "terminated" => Self::Terminated,
            _ => Self::Other,
        }
    }
}

/// A cloud VM as the roller sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Unique instance id
    pub id: String,
    /// When the instance was launched
    pub launch_time: DateTime<Utc>,
    /// Lifecycle state
    pub state: InstanceState,
    /// Instance tags
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    /// Value of the given tag, if present
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Name of the ASG this instance belongs to, if tagged
    pub fn asg_name(&self) -> Option<&str> {
        self.tag(TAG_ASG)
    }
}

/// Server-side filter for instance queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Tag equality
    Tag {
        /// Tag key
        key: String,
        /// Required value
        value: String,
    },
    /// Lifecycle state is one of the given states
    States(Vec<InstanceState>),
    /// Provisioning fingerprint equals the given value
    Fingerprint(String),
    /// Instance id is one of the given ids
    Ids(Vec<String>),
}

impl Filter {
    /// Tag-equality filter
    pub fn tag(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Tag {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Lifecycle-state filter
    pub fn states(states: impl Into<Vec<InstanceState>>) -> Self {
        Self::States(states.into())
    }
}

/// A suspendable ASG scaling process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingProcess {
    /// Cross-AZ instance rebalancing
    AzRebalance,
    /// Launching replacement instances
    Launch,
    /// Evicting terminated instances
    Terminate,
}

impl fmt::Display for ScalingProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AzRebalance => "AZRebalance",
            Self::Launch => "Launch",
            Self::Terminate => "Terminate",
        };
        f.write_str(name)
    }
}

/// Direction of a scaling-process change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    /// Stop the processes from running
    Suspend,
    /// Allow the processes to run again; resuming a process that is not
    /// suspended is a no-op
    Resume,
}

/// Capability set the roller needs from the compute fabric.
///
/// Every call can fail transiently; callers treat a failure as a
/// component-level failure rather than retrying here. Implementations must
/// be safe for concurrent use.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// All instances matching every filter
    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>>;

    /// Instances matching every filter whose fingerprint tag differs from
    /// `fingerprint` (including instances without the tag)
    async fn describe_instances_not_matching_fingerprint(
        &self,
        filters: &[Filter],
        fingerprint: &str,
    ) -> Result<Vec<Instance>>;

    /// Request termination; returns once the request is accepted, not once
    /// the instance is gone
    async fn terminate_instance(&self, id: &str) -> Result<()>;

    /// Desired capacity of the named ASG
    async fn desired_count(&self, asg: &str) -> Result<u32>;

    /// Number of instances currently in the named ASG
    async fn instance_count(&self, asg: &str) -> Result<u32>;

    /// Set the desired capacity of the named ASG
    async fn set_desired_count(&self, asg: &str, count: u32) -> Result<()>;

    /// Suspend or resume scaling processes on the named ASG
    async fn manage_processes(
        &self,
        asg: &str,
        processes: &[ScalingProcess],
        action: ScalingAction,
    ) -> Result<()>;
}

/// Subset of `pool` whose tag `key` equals `value`
pub fn instances_matching_tag(key: &str, value: &str, pool: &[Instance]) -> Vec<Instance> {
    pool.iter()
        .filter(|i| i.tag(key) == Some(value))
        .cloned()
        .collect()
}

/// Distinct values of tag `key` across `instances`, sorted.
///
/// An instance without the tag is an error; resolving ASG membership must
/// not silently drop members.
pub fn unique_tag_values(key: &str, instances: &[Instance]) -> Result<Vec<String>> {
    let mut values = BTreeSet::new();
    for instance in instances {
        match instance.tag(key) {
            Some(v) => {
                values.insert(v.to_string());
            }
            None => {
                return Err(Error::preflight(format!(
                    "instance {} is missing the {key} tag",
                    instance.id
                )));
            }
        }
    }
    Ok(values.into_iter().collect())
}

// ---------------------------------------------------------------------------
// aws CLI backend
// ---------------------------------------------------------------------------

/// [`ComputeBackend`] backed by the `aws` CLI.
///
/// Credentials come from the standard AWS credential chain; the configured
/// profile and region are passed on every invocation.
pub struct AwsCliBackend {
    region: String,
    profile: Option<String>,
}

impl AwsCliBackend {
    /// Create a backend for the given region and optional named profile
    pub fn new(region: impl Into<String>, profile: Option<String>) -> Self {
        Self {
            region: region.into(),
            profile,
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let mut cmd = tokio::process::Command::new("aws");
        cmd.args(args)
            .arg("--output")
            .arg("json")
            .arg("--region")
            .arg(&self.region);
        if let Some(ref profile) = self.profile {
            cmd.arg("--profile").arg(profile);
        }

        debug!(command = ?args, "Executing aws CLI");

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                Error::operational(format!(
                    "aws {} timed out after {:?}",
                    args.join(" "),
                    COMMAND_TIMEOUT
                ))
            })?
            .map_err(|e| Error::operational(format!("failed to execute aws CLI: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::operational(format!(
                "aws {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn describe_asg(&self, asg: &str) -> Result<RawAsg> {
        let out = self
            .run(&[
                "autoscaling".to_string(),
                "describe-auto-scaling-groups".to_string(),
                "--auto-scaling-group-names".to_string(),
                asg.to_string(),
            ])
            .await?;

        let parsed: DescribeAsgsOutput = serde_json::from_str(&out)
            .map_err(|e| Error::operational(format!("unparsable describe-auto-scaling-groups output: {e}")))?;

        parsed
            .auto_scaling_groups
            .into_iter()
            .next()
            .ok_or_else(|| Error::operational(format!("ASG {asg} not found")))
    }
}

/// Translate filters into `aws ec2 describe-instances` arguments
fn describe_args(filters: &[Filter]) -> Vec<String> {
    let mut args = vec!["ec2".to_string(), "describe-instances".to_string()];
    let mut filter_args = Vec::new();

    for filter in filters {
        match filter {
            Filter::Tag { key, value } => {
                filter_args.push(format!("Name=tag:{key},Values={value}"));
            }
            Filter::States(states) => {
                let names: Vec<&str> = states.iter().filter_map(|s| s.wire_name()).collect();
                if !names.is_empty() {
                    filter_args.push(format!("Name=instance-state-name,Values={}", names.join(",")));
                }
            }
            Filter::Fingerprint(value) => {
                filter_args.push(format!("Name=tag:{TAG_FINGERPRINT},Values={value}"));
            }
            Filter::Ids(ids) => {
                args.push("--instance-ids".to_string());
                args.extend(ids.iter().cloned());
            }
        }
    }

    if !filter_args.is_empty() {
        args.push("--filters".to_string());
        args.extend(filter_args);
    }
    args
}

#[derive(Deserialize)]
struct DescribeInstancesOutput {
    #[serde(rename = "Reservations", default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
struct Reservation {
    #[serde(rename = "Instances", default)]
    instances: Vec<RawInstance>,
}

#[derive(Deserialize)]
struct RawInstance {
    #[serde(rename = "InstanceId")]
    instance_id: String,
    #[serde(rename = "LaunchTime")]
    launch_time: DateTime<Utc>,
    #[serde(rename = "State")]
    state: RawState,
    #[serde(rename = "Tags", default)]
    tags: Vec<RawTag>,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
struct RawTag {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Deserialize)]
struct DescribeAsgsOutput {
    #[serde(rename = "AutoScalingGroups", default)]
    auto_scaling_groups: Vec<RawAsg>,
}

#[derive(Deserialize)]
struct RawAsg {
    #[serde(rename = "DesiredCapacity")]
    desired_capacity: u32,
    #[serde(rename = "Instances", default)]
    instances: Vec<serde_json::Value>,
}

impl From<RawInstance> for Instance {
    fn from(raw: RawInstance) -> Self {
        Instance {
            id: raw.instance_id,
            launch_time: raw.launch_time,
            state: InstanceState::from_wire(&raw.state.name),
            tags: raw.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        }
    }
}

fn parse_instances(json: &str) -> Result<Vec<Instance>> {
    let parsed: DescribeInstancesOutput = serde_json::from_str(json)
        .map_err(|e| Error::operational(format!("unparsable describe-instances output: {e}")))?;
    Ok(parsed
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .map(Instance::from)
        .collect())
}

#[async_trait]
impl ComputeBackend for AwsCliBackend {
    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>> {
        let out = self.run(&describe_args(filters)).await?;
        parse_instances(&out)
    }

    async fn describe_instances_not_matching_fingerprint(
        &self,
        filters: &[Filter],
        fingerprint: &str,
    ) -> Result<Vec<Instance>> {
        // EC2 filters cannot express tag inequality; filter client-side.
        let instances = self.describe_instances(filters).await?;
        Ok(instances
            .into_iter()
            .filter(|i| i.tag(TAG_FINGERPRINT) != Some(fingerprint))
            .collect())
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        self.run(&[
            "ec2".to_string(),
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
            id.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn desired_count(&self, asg: &str) -> Result<u32> {
        Ok(self.describe_asg(asg).await?.desired_capacity)
    }

    async fn instance_count(&self, asg: &str) -> Result<u32> {
        Ok(self.describe_asg(asg).await?.instances.len() as u32)
    }

    async fn set_desired_count(&self, asg: &str, count: u32) -> Result<()> {
        self.run(&[
            "autoscaling".to_string(),
            "set-desired-capacity".to_string(),
            "--auto-scaling-group-name".to_string(),
            asg.to_string(),
            "--desired-capacity".to_string(),
            count.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn manage_processes(
        &self,
        asg: &str,
        processes: &[ScalingProcess],
        action: ScalingAction,
    ) -> Result<()> {
        let subcommand = match action {
            ScalingAction::Suspend => "suspend-processes",
            ScalingAction::Resume => "resume-processes",
        };
        let mut args = vec![
            "autoscaling".to_string(),
            subcommand.to_string(),
            "--auto-scaling-group-name".to_string(),
            asg.to_string(),
            "--scaling-processes".to_string(),
        ];
        args.extend(processes.iter().map(|p| p.to_string()));
        self.run(&args).await?;
        Ok(())
    }
}
