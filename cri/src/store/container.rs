//! Container records.

use multicri_core::api::{Container, ContainerFilter, ContainerStats, ContainerStatsFilter};
use multicri_core::error::Result;
use multicri_core::{ContainerMetadata, ContainerState};
use multicri_runtime::ContainerLookup;

use super::{Collection, Persist};

/// Store for container records.
pub struct ContainerStore {
    containers: Collection<ContainerMetadata>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self {
            containers: Collection::in_memory(),
        }
    }

    pub fn load(persist: Box<dyn Persist<ContainerMetadata>>) -> Result<Self> {
        Ok(Self {
            containers: Collection::load(persist, |_| true)?,
        })
    }

    pub fn add(&self, container: ContainerMetadata) {
        self.containers.add(container);
    }

    pub fn update(&self, container: ContainerMetadata) {
        self.containers.update(container);
    }

    pub fn remove(&self, id: &str) -> Option<ContainerMetadata> {
        self.containers.remove(id)
    }

    pub fn get(&self, id: &str) -> Result<ContainerMetadata> {
        self.containers.get(id)
    }

    /// Containers belonging to a sandbox.
    pub fn by_sandbox(&self, sandbox_id: &str) -> Vec<ContainerMetadata> {
        self.containers.list(|c| c.sandbox_id() == sandbox_id)
    }

    /// Remove every container of a sandbox.
    pub fn remove_by_sandbox(&self, sandbox_id: &str) -> Vec<ContainerMetadata> {
        self.containers
            .remove_where(|c| c.sandbox_id() == sandbox_id)
    }

    /// Containers matching a CRI filter whose owning sandbox's handler
    /// `is_local` accepts.
    pub fn list(
        &self,
        filter: Option<&ContainerFilter>,
        is_local: impl Fn(&str) -> bool,
    ) -> Vec<ContainerMetadata> {
        self.containers.list(|container| {
            if !is_local(container.runtime_handler()) {
                return false;
            }
            let Some(filter) = filter else {
                return true;
            };
            if !filter.id.is_empty() && filter.id != container.id {
                return false;
            }
            if !filter.pod_sandbox_id.is_empty() && filter.pod_sandbox_id != container.sandbox_id()
            {
                return false;
            }
            if let Some(state) = &filter.state {
                if ContainerState::from_cri(state.state) != Some(container.state) {
                    return false;
                }
            }
            container.matches_labels(&filter.label_selector)
        })
    }

    pub fn list_k8s(
        &self,
        filter: Option<&ContainerFilter>,
        is_local: impl Fn(&str) -> bool,
    ) -> Vec<Container> {
        self.list(filter, is_local)
            .iter()
            .map(ContainerMetadata::to_container)
            .collect()
    }

    /// Stats (attributes only) for containers matching a stats filter.
    pub fn list_stats(
        &self,
        filter: Option<&ContainerStatsFilter>,
        is_local: impl Fn(&str) -> bool,
    ) -> Vec<ContainerStats> {
        let filter = filter.map(|f| ContainerFilter {
            id: f.id.clone(),
            state: None,
            pod_sandbox_id: f.pod_sandbox_id.clone(),
            label_selector: f.label_selector.clone(),
        });
        self.list(filter.as_ref(), is_local)
            .iter()
            .map(container_stats)
            .collect()
    }
}

impl Default for ContainerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerLookup for ContainerStore {
    fn lookup(&self, id: &str) -> Result<ContainerMetadata> {
        self.get(id)
    }
}

/// Stats for a container. Usage is not sampled.
pub fn container_stats(container: &ContainerMetadata) -> ContainerStats {
    ContainerStats {
        attributes: Some(container.attributes()),
        cpu: None,
        memory: None,
        writable_layer: None,
    }
}
