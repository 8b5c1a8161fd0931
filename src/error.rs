//! Error types for the roller

use thiserror::Error;

/// Main error type for rolling-replacement operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing or unparsable configuration input
    #[error("configuration error: {0}")]
    Config(String),

    /// Cloud inventory lookup failed
    #[error("inventory error: {0}")]
    Inventory(String),

    /// Validation failed before any mutation (unhealthy etcd, count
    /// mismatch, instance missing its ASG tag)
    #[error("preflight error: {0}")]
    Preflight(String),

    /// Cloud or orchestrator call failed during a strategy
    #[error("operational error: {0}")]
    Operational(String),

    /// Replacement instances failed health verification
    #[error("verification error: {0}")]
    Verification(String),

    /// ASG instance count did not return to desired within the poll budget
    #[error("convergence error: {0}")]
    Convergence(String),

    /// One or more nodes could not be cordoned
    #[error("cordon error: {0}")]
    Cordon(String),

    /// Status notification webhook failed
    #[error("notifier error: {0}")]
    Notifier(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an inventory error with the given message
    pub fn inventory(msg: impl Into<String>) -> Self {
        Self::Inventory(msg.into())
    }

    /// Create a preflight error with the given message
    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    /// Create an operational error with the given message
    pub fn operational(msg: impl Into<String>) -> Self {
        Self::Operational(msg.into())
    }

    /// Create a verification error with the given message
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    /// Create a convergence error with the given message
    pub fn convergence(msg: impl Into<String>) -> Self {
        Self::Convergence(msg.into())
    }

    /// Create a cordon error with the given message
    pub fn cordon(msg: impl Into<String>) -> Self {
        Self::Cordon(msg.into())
    }

    /// Create a notifier error with the given message
    pub fn notifier(msg: impl Into<String>) -> Self {
        Self::Notifier(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_errors_carry_their_message() {
        let err = Error::preflight("etcd components are not healthy");
        assert!(err.to_string().contains("preflight error"));
        assert!(err.to_string().contains("not healthy"));
    }

    #[test]
    fn errors_are_categorized() {
        match Error::verification("failure threshold too high") {
            Error::Verification(msg) => assert!(msg.contains("threshold")),
            _ => panic!("expected Verification variant"),
        }

        match Error::convergence("timed out waiting for instances") {
            Error::Convergence(msg) => assert!(msg.contains("timed out")),
            _ => panic!("expected Convergence variant"),
        }
    }

    #[test]
    fn constructors_accept_string_and_str() {
        let asg = "workers-a";
        let err = Error::operational(format!("failed to suspend processes on {asg}"));
        assert!(err.to_string().contains("workers-a"));

        let err = Error::notifier("webhook returned 503");
        assert!(err.to_string().contains("503"));
    }
}
