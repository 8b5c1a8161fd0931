//! Cluster-autoscaler management
//!
//! The cluster autoscaler would fight the roller while workers are being
//! replaced, so it is scaled to zero before any strategy runs and scaled
//! back up after every strategy has finished. Failures here are never
//! fatal; they only mark the autoscaler sub-status.

use tracing::{info, warn};

use crate::kube::OrchestratorBackend;
use crate::state::{AutoscalerState, AutoscalerStatus};

/// Deployment name of the cluster autoscaler
pub const AUTOSCALER_DEPLOYMENT: &str = "cluster-autoscaler";

/// Namespace hosting the cluster autoscaler
pub const AUTOSCALER_NAMESPACE: &str = "kube-system";

/// Scales the cluster-autoscaler deployment around a run
pub struct AutoscalerControl<'a, K: ?Sized> {
    kube: &'a K,
}

impl<'a, K: OrchestratorBackend + ?Sized> AutoscalerControl<'a, K> {
    /// Create a control handle over the given backend
    pub fn new(kube: &'a K) -> Self {
        Self { kube }
    }

    /// Scale the autoscaler to zero replicas.
    ///
    /// On success the state is marked managed: a re-enable is owed at the
    /// end of the run. On failure the sub-status records the failure and
    /// the roll proceeds without autoscaler management.
    pub async fn disable(&self, state: &mut AutoscalerState) {
        info!("Disabling the cluster autoscaler");
        match self
            .kube
            .scale_deployment(AUTOSCALER_NAMESPACE, AUTOSCALER_DEPLOYMENT, 0)
            .await
        {
            Ok(()) => {
                info!("Successfully disabled the cluster autoscaler");
                state.managed = true;
            }
            Err(e) => {
                let message = format!(
                    "unable to manage the cluster-autoscaler deployment, will skip: {e}"
                );
                warn!("{message}");
                state.status = AutoscalerStatus::Failure;
                state.error = Some(message);
            }
        }
    }

    /// Scale the autoscaler back to one replica
    pub async fn enable(&self, state: &mut AutoscalerState) {
        info!("Enabling the cluster autoscaler");
        match self
            .kube
            .scale_deployment(AUTOSCALER_NAMESPACE, AUTOSCALER_DEPLOYMENT, 1)
            .await
        {
            Ok(()) => {
                info!("Successfully enabled the cluster autoscaler");
            }
            Err(e) => {
                let message = format!("unable to re-enable the cluster-autoscaler deployment: {e}");
                warn!("{message}");
                state.status = AutoscalerStatus::Failure;
                state.error = Some(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::MockOrchestratorBackend;
    use crate::Error;

    #[tokio::test]
    async fn successful_disable_marks_managed() {
        let mut kube = MockOrchestratorBackend::new();
        kube.expect_scale_deployment()
            .withf(|ns, name, replicas| {
                ns == AUTOSCALER_NAMESPACE && name == AUTOSCALER_DEPLOYMENT && *replicas == 0
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut state = AutoscalerState::default();
        AutoscalerControl::new(&kube).disable(&mut state).await;

        assert!(state.managed);
        assert_eq!(state.status, AutoscalerStatus::Success);
    }

    #[tokio::test]
    async fn failed_disable_is_nonfatal_and_unmanaged() {
        let mut kube = MockOrchestratorBackend::new();
        kube.expect_scale_deployment()
            .returning(|_, _, _| Err(Error::operational("deployment not found")));

        let mut state = AutoscalerState::default();
        AutoscalerControl::new(&kube).disable(&mut state).await;

        assert!(!state.managed);
        assert_eq!(state.status, AutoscalerStatus::Failure);
        assert!(state.error.as_deref().unwrap().contains("will skip"));
    }

    #[tokio::test]
    async fn failed_enable_keeps_managed_but_fails_substatus() {
        let mut kube = MockOrchestratorBackend::new();
        kube.expect_scale_deployment()
            .withf(|_, _, replicas| *replicas == 1)
            .returning(|_, _, _| Err(Error::operational("timeout")));

        let mut state = AutoscalerState {
            managed: true,
            ..Default::default()
        };
        AutoscalerControl::new(&kube).enable(&mut state).await;

        assert!(state.managed);
        assert_eq!(state.status, AutoscalerStatus::Failure);
        assert!(state.error.as_deref().unwrap().contains("re-enable"));
    }
}
