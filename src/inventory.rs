//! Immutable snapshot of out-of-date instances
//!
//! Built once at run start; later instance discoveries are replacements and
//! never become inventory members.

use tracing::info;

use crate::compute::{
    instances_matching_tag, ComputeBackend, Filter, Instance, InstanceState, TAG_CLUSTER,
    TAG_COMPONENT,
};
use crate::state::Role;
use crate::{Error, Result};

/// All running instances belonging to the target cluster whose fingerprint
/// differs from the target fingerprint
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    instances: Vec<Instance>,
}

impl Inventory {
    /// Load the snapshot from the compute backend.
    ///
    /// An empty inventory is not an error; it means every instance already
    /// matches the target fingerprint.
    pub async fn load<C>(compute: &C, cluster: &str, fingerprint: &str) -> Result<Self>
    where
        C: ComputeBackend + ?Sized,
    {
        let filters = [
            Filter::tag(TAG_CLUSTER, cluster),
            Filter::states(vec![InstanceState::Running]),
        ];

        let instances = compute
            .describe_instances_not_matching_fingerprint(&filters, fingerprint)
            .await
            .map_err(|e| Error::inventory(e.to_string()))?;

        info!(
            cluster = %cluster,
            fingerprint = %fingerprint,
            count = instances.len(),
            "Loaded inventory of out-of-date instances"
        );
        Ok(Self { instances })
    }

    /// An inventory with no members
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot built directly from instances, bypassing the backend
    #[cfg(test)]
    pub(crate) fn from_instances(instances: Vec<Instance>) -> Self {
        Self { instances }
    }

    /// Members whose `ServiceComponent` tag matches the role
    pub fn for_role(&self, role: Role) -> Vec<Instance> {
        instances_matching_tag(TAG_COMPONENT, role.as_str(), &self.instances)
    }

    /// Whether the given instance id is an inventory member
    pub fn contains(&self, id: &str) -> bool {
        self.instances.iter().any(|i| i.id == id)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when no instance needs replacing
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
