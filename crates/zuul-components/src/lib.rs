//! Ephemeral registration of live processes (spec §4.C): schedulers,
//! executors, mergers, and launchers register under
//! `/components/<kind>/<hostname>-<seq>` as ephemeral sequential nodes
//! carrying their JSON [`ComponentRegistration`]. Session loss drops the
//! node automatically (it's ephemeral), which is how the rest of the system
//! learns a process died without a heartbeat protocol of its own.

pub mod min_ready;

use std::sync::Arc;

use tracing::warn;
use zuul_types::{ComponentKind, ComponentRegistration, ComponentState};
use zuul_zk::stat::WatchEvent;
use zuul_zk::{CoordinationClient, ZkError};

const ROOT: &str = "/components";

/// Handle to this process's own registration, returned by [`ComponentRegistry::register`].
/// Dropping it does not deregister — the node lives until the session that
/// created it is declared lost (or [`ComponentHandle::deregister`] is called
/// explicitly, e.g. for a graceful `stop`).
pub struct ComponentHandle {
    client: Arc<dyn CoordinationClient>,
    path: String,
}

impl ComponentHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn read(&self) -> Result<(ComponentRegistration, i64), ZkError> {
        let (data, stat) = self.client.get(&self.path).await?;
        let reg = serde_json::from_slice(&data).map_err(|e| ZkError::Other(e.to_string()))?;
        Ok((reg, stat.version))
    }

    pub async fn update_state(&self, state: ComponentState) -> Result<(), ZkError> {
        let (mut reg, version) = self.read().await?;
        reg.state = state;
        let data = serde_json::to_vec(&reg).map_err(|e| ZkError::Other(e.to_string()))?;
        self.client.set(&self.path, &data, version).await?;
        Ok(())
    }

    pub async fn set_accepting_work(&self, accepting: bool) -> Result<(), ZkError> {
        let (mut reg, version) = self.read().await?;
        reg.accepting_work = accepting;
        let data = serde_json::to_vec(&reg).map_err(|e| ZkError::Other(e.to_string()))?;
        self.client.set(&self.path, &data, version).await?;
        Ok(())
    }

    /// Graceful deregistration ahead of session loss, e.g. on `stop` (spec §6).
    pub async fn deregister(&self) -> Result<(), ZkError> {
        match self.client.delete(&self.path, -1, false).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_node() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Typed front end over the `/components` subtree. Consumers use `all()` /
/// `all_of_kind()` to decide work eligibility (`running` + `accepting_work`)
/// and to compute per-label hash rings ([`min_ready`]).
pub struct ComponentRegistry {
    client: Arc<dyn CoordinationClient>,
}

impl ComponentRegistry {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    async fn ensure_path(&self, path: &str) -> Result<(), ZkError> {
        let mut built = String::new();
        for segment in path.trim_start_matches('/').split('/') {
            built.push('/');
            built.push_str(segment);
            if self.client.exists(&built).await?.is_none() {
                match self.client.create(&built, b"", false, false).await {
                    Ok(_) | Err(ZkError::NodeExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Registers `registration` as a new ephemeral sequential node and
    /// returns the handle this process uses to keep it current.
    pub async fn register(
        &self,
        registration: ComponentRegistration,
    ) -> Result<ComponentHandle, ZkError> {
        let kind_root = format!("{ROOT}/{}", registration.kind.as_str());
        self.ensure_path(&kind_root).await?;

        let data = serde_json::to_vec(&registration).map_err(|e| ZkError::Other(e.to_string()))?;
        let path = self
            .client
            .create(
                &format!("{kind_root}/{}-", registration.hostname),
                &data,
                true,
                true,
            )
            .await?;

        Ok(ComponentHandle {
            client: self.client.clone(),
            path,
        })
    }

    pub async fn all_of_kind(
        &self,
        kind: ComponentKind,
    ) -> Result<Vec<ComponentRegistration>, ZkError> {
        let kind_root = format!("{ROOT}/{}", kind.as_str());
        let names = match self.client.children(&kind_root).await {
            Ok(names) => names,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let path = format!("{kind_root}/{name}");
            match self.client.get(&path).await {
                Ok((data, _)) => match serde_json::from_slice(&data) {
                    Ok(reg) => out.push(reg),
                    Err(e) => warn!(path = %path, error = %e, "dropping unparseable component registration"),
                },
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub async fn all(&self) -> Result<Vec<ComponentRegistration>, ZkError> {
        const KINDS: [ComponentKind; 5] = [
            ComponentKind::Scheduler,
            ComponentKind::Executor,
            ComponentKind::Merger,
            ComponentKind::Launcher,
            ComponentKind::Web,
        ];
        let mut out = Vec::new();
        for kind in KINDS {
            out.extend(self.all_of_kind(kind).await?);
        }
        Ok(out)
    }

    /// A live view: every `NodeAdded`/`NodeUpdated`/`NodeRemoved` under
    /// `/components` as they happen, for callers that want to react rather
    /// than poll (e.g. the stats thread, §4.K).
    pub fn watch(&self) -> tokio::sync::broadcast::Receiver<WatchEvent> {
        self.client.watch_tree(ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_zk::MemoryCoordinationClient;

    fn registration(hostname: &str, kind: ComponentKind) -> ComponentRegistration {
        let mut reg = ComponentRegistration::new(hostname, kind);
        reg.state = ComponentState::Running;
        reg.accepting_work = true;
        reg
    }

    #[tokio::test]
    async fn register_then_all_of_kind_finds_it() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let registry = ComponentRegistry::new(client);

        registry
            .register(registration("sched-1", ComponentKind::Scheduler))
            .await
            .unwrap();
        registry
            .register(registration("exec-1", ComponentKind::Executor))
            .await
            .unwrap();

        let schedulers = registry.all_of_kind(ComponentKind::Scheduler).await.unwrap();
        assert_eq!(schedulers.len(), 1);
        assert_eq!(schedulers[0].hostname, "sched-1");

        assert_eq!(registry.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn session_loss_drops_registration() {
        let client = Arc::new(MemoryCoordinationClient::new());
        let registry = ComponentRegistry::new(client.clone());

        registry
            .register(registration("exec-1", ComponentKind::Executor))
            .await
            .unwrap();
        assert_eq!(
            registry.all_of_kind(ComponentKind::Executor).await.unwrap().len(),
            1
        );

        client.expire_session().await;
        assert!(registry
            .all_of_kind(ComponentKind::Executor)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_state_persists_through_registry() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let registry = ComponentRegistry::new(client);

        let handle = registry
            .register(registration("merger-1", ComponentKind::Merger))
            .await
            .unwrap();
        handle.update_state(ComponentState::Paused).await.unwrap();

        let all = registry.all_of_kind(ComponentKind::Merger).await.unwrap();
        assert_eq!(all[0].state, ComponentState::Paused);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let registry = ComponentRegistry::new(client);

        let handle = registry
            .register(registration("web-1", ComponentKind::Web))
            .await
            .unwrap();
        handle.deregister().await.unwrap();
        handle.deregister().await.unwrap();
    }
}
