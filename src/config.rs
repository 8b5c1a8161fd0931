//! Run configuration
//!
//! Every input can be supplied as a flag or through the environment, which
//! is how the deployed job is driven. Validation is fatal before any side
//! effect.

use std::time::Duration;

use clap::Parser;

use crate::state::Role;
use crate::{Error, Result};

/// Configuration for one invocation of the roller
#[derive(Parser, Debug, Clone)]
#[command(
    name = "roller",
    version,
    about = "Rolling replacement of the instances backing a Kubernetes cluster"
)]
pub struct RollerConfig {
    /// Short name of the target cluster
    #[arg(long, env = "CLUSTER")]
    pub cluster: String,

    /// Cloud account owning the cluster; forms the cluster identity
    #[arg(long, env = "AWS_ACCOUNT")]
    pub aws_account: Option<String>,

    /// Named credentials profile; substitutes for the account in the
    /// cluster identity when no account is set
    #[arg(long, env = "AWS_PROFILE")]
    pub aws_profile: Option<String>,

    /// Cloud region
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: String,

    /// Target provisioning fingerprint instances must match
    #[arg(long = "fingerprint", env = "ANSIBLE_VERSION")]
    pub target_fingerprint: String,

    /// Kubernetes API server URL
    #[arg(long, env = "KUBERNETES_SERVER")]
    pub kubernetes_server: String,

    /// Kubernetes basic-auth username
    #[arg(long, env = "KUBERNETES_USERNAME")]
    pub kubernetes_username: String,

    /// Kubernetes basic-auth password
    #[arg(long, env = "KUBERNETES_PASSWORD", hide_env_values = true)]
    pub kubernetes_password: String,

    /// Incoming-webhook URL for status notifications
    #[arg(long, env = "SLACK_WEBHOOK", hide_env_values = true)]
    pub slack_webhook: String,

    /// Comma-separated subset of etcd,k8s-master,k8s-node; all three when
    /// unset
    #[arg(long, env = "ROLLER_COMPONENTS")]
    pub components: Option<String>,

    /// Numeric log verbosity (0-4); RUST_LOG overrides when set
    #[arg(long, env = "ROLLER_LOG_LEVEL", default_value_t = 2)]
    pub log_level: u8,

    /// Grace period between worker terminations, in seconds
    #[arg(long, env = "TERMINATION_WAIT_PERIOD_SECONDS", default_value_t = 180)]
    pub termination_wait_seconds: u64,
}

impl RollerConfig {
    /// Cross-field validation not expressible per-flag
    pub fn validate(&self) -> Result<()> {
        if self.aws_account.is_none() && self.aws_profile.is_none() {
            return Err(Error::config("set one of AWS_ACCOUNT or AWS_PROFILE"));
        }
        self.target_components()?;
        Ok(())
    }

    /// Composite identity selecting cloud inventory:
    /// `{account}-{region}-{cluster}`
    pub fn cluster_identity(&self) -> String {
        let account = self
            .aws_account
            .as_deref()
            .or(self.aws_profile.as_deref())
            .unwrap_or_default();
        format!("{}-{}-{}", account, self.aws_region, self.cluster)
    }

    /// Roles to roll, in request order with duplicates removed
    pub fn target_components(&self) -> Result<Vec<Role>> {
        let list = match self.components.as_deref().map(str::trim) {
            None | Some("") => return Ok(Role::ALL.to_vec()),
            Some(list) => list,
        };

        let mut roles = Vec::new();
        for name in list.split(',') {
            let role: Role = name.parse().map_err(Error::config)?;
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        Ok(roles)
    }

    /// Grace period between worker terminations
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_wait_seconds)
    }

    /// Map the numeric verbosity onto a tracing filter directive
    pub fn log_filter(&self) -> &'static str {
        match self.log_level {
            0 | 1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> RollerConfig {
        RollerConfig {
            cluster: "main".to_string(),
            aws_account: Some("acct".to_string()),
            aws_profile: None,
            aws_region: "us-east-1".to_string(),
            target_fingerprint: "v2".to_string(),
            kubernetes_server: "https://k8s.example.com".to_string(),
            kubernetes_username: "admin".to_string(),
            kubernetes_password: "secret".to_string(),
            slack_webhook: "https://hooks.example.com/T/B/x".to_string(),
            components: None,
            log_level: 2,
            termination_wait_seconds: 180,
        }
    }

    #[test]
    fn identity_combines_account_region_cluster() {
        assert_eq!(sample_config().cluster_identity(), "acct-us-east-1-main");
    }

    #[test]
    fn identity_falls_back_to_profile() {
        let mut config = sample_config();
        config.aws_account = None;
        config.aws_profile = Some("staging".to_string());
        assert_eq!(config.cluster_identity(), "staging-us-east-1-main");
    }

    #[test]
    fn requires_account_or_profile() {
        let mut config = sample_config();
        config.aws_account = None;
        config.aws_profile = None;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.aws_profile = Some("staging".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unset_components_means_all_three() {
        let config = sample_config();
        assert_eq!(config.target_components().unwrap(), Role::ALL.to_vec());

        let mut empty = sample_config();
        empty.components = Some("".to_string());
        assert_eq!(empty.target_components().unwrap(), Role::ALL.to_vec());
    }

    #[test]
    fn components_parse_and_deduplicate() {
        let mut config = sample_config();
        config.components = Some("etcd,k8s-node,etcd".to_string());
        assert_eq!(
            config.target_components().unwrap(),
            vec![Role::Etcd, Role::Node]
        );
    }

    #[test]
    fn unknown_component_is_a_configuration_error() {
        let mut config = sample_config();
        config.components = Some("etcd,controller".to_string());
        assert!(matches!(
            config.target_components(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn log_levels_map_onto_filters() {
        let mut config = sample_config();
        for (level, filter) in [(0, "warn"), (1, "warn"), (2, "info"), (3, "debug"), (4, "trace")] {
            config.log_level = level;
            assert_eq!(config.log_filter(), filter);
        }
    }
}
