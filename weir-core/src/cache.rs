//! Process-definition cache.
//!
//! Resolved graphs are memoized by definition id with secondary indexes for
//! (key, tenant) → latest version and (deployment, key). Entries are filled
//! lazily through the out-of-scope deployment collaborator and invalidated
//! only on deployment events, never by time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, StoreError};
use crate::graph::{ProcessDefinition, ProcessGraph};

/// Deployment collaborator: re-resolves definitions from durable storage on
/// a cache miss.
#[async_trait]
pub trait DefinitionResolver: Send + Sync {
    async fn resolve_by_id(&self, id: Uuid) -> Result<Option<ProcessDefinition>, StoreError>;
    async fn resolve_latest(
        &self,
        key: &str,
        tenant: Option<&str>,
    ) -> Result<Option<ProcessDefinition>, StoreError>;
    async fn resolve_by_deployment(
        &self,
        deployment_id: Uuid,
        key: &str,
    ) -> Result<Option<ProcessDefinition>, StoreError>;
}

type KeyTenant = (String, Option<String>);

#[derive(Default)]
struct CacheInner {
    by_id: HashMap<Uuid, Arc<ProcessDefinition>>,
    latest_by_key: HashMap<KeyTenant, Uuid>,
    by_deployment: HashMap<(Uuid, String), Uuid>,
    suspended: HashSet<Uuid>,
}

/// What a redeploy changed, as seen by the cache.
pub struct DeploymentChange {
    /// Latest version of the same key before the deploy, if it was cached.
    pub previous: Option<Arc<ProcessDefinition>>,
    pub current: Arc<ProcessDefinition>,
}

pub struct DefinitionCache {
    resolver: Arc<dyn DefinitionResolver>,
    inner: RwLock<CacheInner>,
}

impl DefinitionCache {
    pub fn new(resolver: Arc<dyn DefinitionResolver>) -> Self {
        Self {
            resolver,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    /// A miss on an id that truly does not exist is NotFound, not a retry
    /// signal.
    pub async fn definition_by_id(&self, id: Uuid) -> EngineResult<Arc<ProcessDefinition>> {
        if let Some(found) = self.inner.read().unwrap().by_id.get(&id) {
            return Ok(Arc::clone(found));
        }
        let resolved = self
            .resolver
            .resolve_by_id(id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))?;
        Ok(self.admit(resolved))
    }

    pub async fn latest_by_key(
        &self,
        key: &str,
        tenant: Option<&str>,
    ) -> EngineResult<Arc<ProcessDefinition>> {
        let cached_id = self
            .inner
            .read()
            .unwrap()
            .latest_by_key
            .get(&(key.to_string(), tenant.map(str::to_string)))
            .copied();
        if let Some(id) = cached_id {
            return self.definition_by_id(id).await;
        }
        let resolved = self
            .resolver
            .resolve_latest(key, tenant)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        Ok(self.admit(resolved))
    }

    pub async fn by_deployment(
        &self,
        deployment_id: Uuid,
        key: &str,
    ) -> EngineResult<Arc<ProcessDefinition>> {
        let cached_id = self
            .inner
            .read()
            .unwrap()
            .by_deployment
            .get(&(deployment_id, key.to_string()))
            .copied();
        if let Some(id) = cached_id {
            return self.definition_by_id(id).await;
        }
        let resolved = self
            .resolver
            .resolve_by_deployment(deployment_id, key)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        Ok(self.admit(resolved))
    }

    fn admit(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let shared = Arc::new(definition);
        let mut inner = self.inner.write().unwrap();
        let key = (shared.key.clone(), shared.tenant_id.clone());
        let newer_than_cached = inner
            .latest_by_key
            .get(&key)
            .and_then(|id| inner.by_id.get(id))
            .map_or(true, |cached| cached.version <= shared.version);
        if newer_than_cached {
            inner.latest_by_key.insert(key, shared.id);
        }
        inner
            .by_deployment
            .insert((shared.deployment_id, shared.key.clone()), shared.id);
        inner.by_id.insert(shared.id, Arc::clone(&shared));
        shared
    }

    /// Definition suspension is a cooperative flag consulted before starting
    /// instances and when scheduling work.
    pub fn is_suspended(&self, id: Uuid) -> bool {
        self.inner.read().unwrap().suspended.contains(&id)
    }

    pub fn set_suspended(&self, id: Uuid, suspended: bool) {
        let mut inner = self.inner.write().unwrap();
        if suspended {
            inner.suspended.insert(id);
        } else {
            inner.suspended.remove(&id);
        }
    }

    /// Invalidation hook for a freshly deployed definition. Re-resolves the
    /// new entry and reports the previously cached latest version of the
    /// same key so the caller can reconcile declarations.
    pub async fn on_definition_deployed(&self, id: Uuid) -> EngineResult<DeploymentChange> {
        let resolved = self
            .resolver
            .resolve_by_id(id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))?;

        let previous = {
            let inner = self.inner.read().unwrap();
            inner
                .latest_by_key
                .get(&(resolved.key.clone(), resolved.tenant_id.clone()))
                .filter(|prev| **prev != id)
                .and_then(|prev| inner.by_id.get(prev))
                .map(Arc::clone)
        };
        let current = self.admit(resolved);
        Ok(DeploymentChange { previous, current })
    }

    /// Invalidation hook for a removed definition: entry-by-entry, only the
    /// mappings of that definition are dropped.
    pub fn on_definition_removed(&self, id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        inner.by_id.remove(&id);
        inner.latest_by_key.retain(|_, v| *v != id);
        inner.by_deployment.retain(|_, v| *v != id);
        inner.suspended.remove(&id);
    }
}

// ─── In-memory deployment repository ──────────────────────────

/// Minimal deployment collaborator: versioned definition storage without
/// any parsing. Doubles as the resolver in tests and embedded setups.
#[derive(Default)]
pub struct InMemoryDefinitionRepository {
    definitions: RwLock<HashMap<Uuid, ProcessDefinition>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a graph under `key`, assigning the next version number.
    pub fn deploy(
        &self,
        key: impl Into<String>,
        tenant: Option<String>,
        graph: ProcessGraph,
    ) -> ProcessDefinition {
        let key = key.into();
        let mut definitions = self.definitions.write().unwrap();
        let version = definitions
            .values()
            .filter(|d| d.key == key && d.tenant_id == tenant)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1;
        let definition = ProcessDefinition::new(key, version, tenant, Uuid::now_v7(), graph);
        definitions.insert(definition.id, definition.clone());
        definition
    }

    pub fn remove(&self, id: Uuid) {
        self.definitions.write().unwrap().remove(&id);
    }
}

#[async_trait]
impl DefinitionResolver for InMemoryDefinitionRepository {
    async fn resolve_by_id(&self, id: Uuid) -> Result<Option<ProcessDefinition>, StoreError> {
        Ok(self.definitions.read().unwrap().get(&id).cloned())
    }

    async fn resolve_latest(
        &self,
        key: &str,
        tenant: Option<&str>,
    ) -> Result<Option<ProcessDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .unwrap()
            .values()
            .filter(|d| d.key == key && d.tenant_id.as_deref() == tenant)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn resolve_by_deployment(
        &self,
        deployment_id: Uuid,
        key: &str,
    ) -> Result<Option<ProcessDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .unwrap()
            .values()
            .find(|d| d.deployment_id == deployment_id && d.key == key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, NodeKind};

    fn graph() -> ProcessGraph {
        GraphBuilder::new()
            .node("start", NodeKind::start())
            .node("end", NodeKind::EndEvent)
            .flow("f1", "start", "end")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn fills_lazily_and_serves_from_cache() {
        let repo = Arc::new(InMemoryDefinitionRepository::new());
        let deployed = repo.deploy("order", None, graph());
        let cache = DefinitionCache::new(repo.clone());

        let first = cache.definition_by_id(deployed.id).await.unwrap();
        assert_eq!(first.key, "order");

        // Removing from the repository does not evict the cache entry;
        // only deployment events do.
        repo.remove(deployed.id);
        let second = cache.definition_by_id(deployed.id).await.unwrap();
        assert_eq!(second.id, deployed.id);

        cache.on_definition_removed(deployed.id);
        let err = cache.definition_by_id(deployed.id).await.unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn redeploy_moves_the_latest_pointer() {
        let repo = Arc::new(InMemoryDefinitionRepository::new());
        let v1 = repo.deploy("order", None, graph());
        let cache = DefinitionCache::new(repo.clone());

        let latest = cache.latest_by_key("order", None).await.unwrap();
        assert_eq!(latest.version, 1);

        let v2 = repo.deploy("order", None, graph());
        let change = cache.on_definition_deployed(v2.id).await.unwrap();
        assert_eq!(change.previous.as_ref().unwrap().id, v1.id);
        assert_eq!(change.current.version, 2);

        let latest = cache.latest_by_key("order", None).await.unwrap();
        assert_eq!(latest.id, v2.id);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let repo = Arc::new(InMemoryDefinitionRepository::new());
        let cache = DefinitionCache::new(repo);
        let err = cache.definition_by_id(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn suspension_flag_roundtrip() {
        let repo = Arc::new(InMemoryDefinitionRepository::new());
        let deployed = repo.deploy("order", None, graph());
        let cache = DefinitionCache::new(repo);

        assert!(!cache.is_suspended(deployed.id));
        cache.set_suspended(deployed.id, true);
        assert!(cache.is_suspended(deployed.id));
        cache.set_suspended(deployed.id, false);
        assert!(!cache.is_suspended(deployed.id));
    }
}
