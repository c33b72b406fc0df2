//! Pod sandbox records.

use std::path::Path;

use multicri_core::api::{PodSandbox, PodSandboxFilter};
use multicri_core::error::{CriError, Result};
use multicri_core::{SandboxMetadata, SandboxState};

use super::{Collection, Persist};

/// Store for pod sandbox records.
pub struct SandboxStore {
    sandboxes: Collection<SandboxMetadata>,
}

impl SandboxStore {
    /// Create a new empty, unpersisted sandbox store.
    pub fn new() -> Self {
        Self {
            sandboxes: Collection::in_memory(),
        }
    }

    /// Load persisted sandboxes, dropping those whose network namespace is gone.
    pub fn load(persist: Box<dyn Persist<SandboxMetadata>>) -> Result<Self> {
        let sandboxes = Collection::load(persist, |sandbox: &SandboxMetadata| {
            sandbox.netns_path.is_empty() || Path::new(&sandbox.netns_path).exists()
        })?;
        Ok(Self { sandboxes })
    }

    pub fn add(&self, sandbox: SandboxMetadata) {
        self.sandboxes.add(sandbox);
    }

    pub fn update(&self, sandbox: SandboxMetadata) {
        self.sandboxes.update(sandbox);
    }

    pub fn remove(&self, id: &str) -> Option<SandboxMetadata> {
        self.sandboxes.remove(id)
    }

    pub fn get(&self, id: &str) -> Result<SandboxMetadata> {
        self.sandboxes.get(id)
    }

    /// Record a new container in the sandbox's container list.
    pub fn add_container(&self, sandbox_id: &str, container_id: &str) -> Result<()> {
        self.sandboxes.modify(sandbox_id, |sandbox| {
            if !sandbox.containers.iter().any(|c| c == container_id) {
                sandbox.containers.push(container_id.to_string());
            }
        })
    }

    /// Drop a container from the sandbox's container list. A sandbox that is
    /// already gone is not an error.
    pub fn remove_container(&self, sandbox_id: &str, container_id: &str) -> Result<()> {
        match self.sandboxes.modify(sandbox_id, |sandbox| {
            sandbox.containers.retain(|c| c != container_id);
        }) {
            Ok(()) | Err(CriError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Sandboxes matching a CRI filter whose handler `is_local` accepts.
    pub fn list(
        &self,
        filter: Option<&PodSandboxFilter>,
        is_local: impl Fn(&str) -> bool,
    ) -> Vec<SandboxMetadata> {
        self.sandboxes.list(|sandbox| {
            if !is_local(&sandbox.runtime_handler) {
                return false;
            }
            let Some(filter) = filter else {
                return true;
            };
            if !filter.id.is_empty() && filter.id != sandbox.id {
                return false;
            }
            if let Some(state) = &filter.state {
                if SandboxState::from_cri(state.state) != Some(sandbox.state) {
                    return false;
                }
            }
            sandbox.matches_labels(&filter.label_selector)
        })
    }

    /// CRI view of [`SandboxStore::list`].
    pub fn list_k8s(
        &self,
        filter: Option<&PodSandboxFilter>,
        is_local: impl Fn(&str) -> bool,
    ) -> Vec<PodSandbox> {
        self.list(filter, is_local)
            .iter()
            .map(SandboxMetadata::to_pod_sandbox)
            .collect()
    }
}

impl Default for SandboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use multicri_core::api::{PodSandboxConfig, PodSandboxMetadata, PodSandboxStateValue};
    use multicri_core::metadata::POD_UID_LABEL;

    use super::*;
    use crate::store::JsonFileStore;

    fn test_sandbox(id: &str) -> SandboxMetadata {
        let config = PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: format!("pod-{}", id),
                uid: format!("uid-{}", id),
                namespace: "default".to_string(),
                attempt: 0,
            }),
            labels: HashMap::from([("app".to_string(), "test".to_string())]),
            ..Default::default()
        };
        SandboxMetadata::new(id.to_string(), config, "multicri".to_string())
    }

    fn all(_: &str) -> bool {
        true
    }

    #[test]
    fn test_add_and_get() {
        let store = SandboxStore::new();
        store.add(test_sandbox("sb1"));

        let sandbox = store.get("sb1").unwrap();
        assert_eq!(sandbox.name(), "pod-sb1");
        assert_eq!(sandbox.state, SandboxState::NotReady);
        assert!(store.get("missing").is_err());
    }

    #[test]
    fn test_container_list_membership() {
        let store = SandboxStore::new();
        store.add(test_sandbox("sb1"));

        store.add_container("sb1", "c1").unwrap();
        store.add_container("sb1", "c1").unwrap();
        store.add_container("sb1", "c2").unwrap();
        assert_eq!(store.get("sb1").unwrap().containers, vec!["c1", "c2"]);

        store.remove_container("sb1", "c1").unwrap();
        store.remove_container("gone", "c2").unwrap();
        assert_eq!(store.get("sb1").unwrap().containers, vec!["c2"]);
        assert!(store.add_container("gone", "c3").is_err());
    }

    #[test]
    fn test_list_filters() {
        let store = SandboxStore::new();
        store.add(test_sandbox("sb1"));
        let mut ready = test_sandbox("sb2");
        ready.state = SandboxState::Ready;
        store.add(ready);

        assert_eq!(store.list(None, all).len(), 2);

        let by_id = PodSandboxFilter {
            id: "sb1".to_string(),
            ..Default::default()
        };
        assert_eq!(store.list(Some(&by_id), all).len(), 1);

        let by_state = PodSandboxFilter {
            state: Some(PodSandboxStateValue {
                state: multicri_core::api::PodSandboxState::SandboxReady as i32,
            }),
            ..Default::default()
        };
        let listed = store.list(Some(&by_state), all);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "sb2");

        let by_uid = PodSandboxFilter {
            label_selector: HashMap::from([(POD_UID_LABEL.to_string(), "uid-sb2".to_string())]),
            ..Default::default()
        };
        assert_eq!(store.list(Some(&by_uid), all)[0].id, "sb2");

        let by_label = PodSandboxFilter {
            label_selector: HashMap::from([("app".to_string(), "other".to_string())]),
            ..Default::default()
        };
        assert!(store.list(Some(&by_label), all).is_empty());
    }

    #[test]
    fn test_list_hides_remote_records() {
        let store = SandboxStore::new();
        store.add(test_sandbox("local"));
        let mut shadow = test_sandbox("remote");
        shadow.runtime_handler = "gpu".to_string();
        store.add(shadow);

        let listed = store.list_k8s(None, |handler| handler == "multicri");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "local");
    }

    #[test]
    fn test_load_drops_missing_netns() {
        let tmp = tempfile::tempdir().unwrap();
        let persist = || Box::new(JsonFileStore::<SandboxMetadata>::in_cache(tmp.path(), "sandboxes"));
        {
            let store = SandboxStore::load(persist()).unwrap();
            store.add(test_sandbox("plain"));
            let mut stale = test_sandbox("stale");
            stale.netns_path = tmp.path().join("no-such-netns").display().to_string();
            store.add(stale);
            let mut alive = test_sandbox("alive");
            alive.netns_path = tmp.path().display().to_string();
            store.add(alive);
        }

        let store = SandboxStore::load(persist()).unwrap();
        assert!(store.get("plain").is_ok());
        assert!(store.get("alive").is_ok());
        assert!(store.get("stale").is_err());
    }
}
