//! Per-session agent instance pool.
//!
//! Each session owns one agent per [`Tier`], all bound to the same LLM
//! backend. Instances are built lazily on the session's first turn and
//! reused afterwards. Entries are versioned by the LLM configuration id the
//! session asked for; a session whose binding changes gets a fresh set.
//!
//! Construction is single-flight per session: concurrent first turns wait
//! on one build instead of racing to overwrite each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex as AsyncMutex;

use crate::classifier::Tier;
use crate::error::{AgentError, Result};
use crate::runtime::Agent;

/// The four agents of one session.
#[derive(Debug, Clone)]
pub struct AgentInstances {
    pub simple: Arc<Agent>,
    pub medium: Arc<Agent>,
    pub complex: Arc<Agent>,
    pub eval: Arc<Agent>,
    /// Configuration id this set was built for; `None` is the default.
    pub config_id: Option<String>,
}

impl AgentInstances {
    pub fn get(&self, tier: Tier) -> &Arc<Agent> {
        match tier {
            Tier::Simple => &self.simple,
            Tier::Medium => &self.medium,
            Tier::Complex => &self.complex,
            Tier::Eval => &self.eval,
        }
    }

    fn serves(&self, config_id: Option<&str>) -> bool {
        self.config_id.as_deref() == config_id
    }
}

/// Cache of [`AgentInstances`] keyed by session id.
#[derive(Debug, Default)]
pub struct AgentPool {
    instances: RwLock<HashMap<String, Arc<AgentInstances>>>,
    build_locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached instances for `session_id`, whatever their version.
    pub fn get(&self, session_id: &str) -> Option<Arc<AgentInstances>> {
        self.instances.read().ok()?.get(session_id).cloned()
    }

    fn current(&self, session_id: &str, config_id: Option<&str>) -> Option<Arc<AgentInstances>> {
        self.get(session_id).filter(|i| i.serves(config_id))
    }

    fn build_lock(&self, session_id: &str) -> Result<Arc<AsyncMutex<()>>> {
        if let Some(lock) = self
            .build_locks
            .read()
            .map_err(|_| AgentError::Internal("agent pool lock poisoned".into()))?
            .get(session_id)
        {
            return Ok(Arc::clone(lock));
        }
        let mut locks = self
            .build_locks
            .write()
            .map_err(|_| AgentError::Internal("agent pool lock poisoned".into()))?;
        Ok(Arc::clone(locks.entry(session_id.to_owned()).or_default()))
    }

    /// Return the session's instances for `config_id`, building them with
    /// `build` if absent or built for another configuration.
    ///
    /// At most one `build` runs per session at a time; callers that waited
    /// reuse its result. A failed build caches nothing.
    pub async fn ensure<F, Fut>(
        &self,
        session_id: &str,
        config_id: Option<&str>,
        build: F,
    ) -> Result<Arc<AgentInstances>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AgentInstances>>,
    {
        if let Some(found) = self.current(session_id, config_id) {
            return Ok(found);
        }

        let lock = self.build_lock(session_id)?;
        let _guard = lock.lock().await;
        if let Some(found) = self.current(session_id, config_id) {
            return Ok(found);
        }

        let built = Arc::new(build().await?);
        tracing::info!(
            session_id,
            config_id = config_id.unwrap_or("default"),
            provider = built.simple.backend().provider(),
            model = built.simple.backend().model(),
            "agent instances created"
        );
        self.instances
            .write()
            .map_err(|_| AgentError::Internal("agent pool lock poisoned".into()))?
            .insert(session_id.to_owned(), Arc::clone(&built));
        Ok(built)
    }

    /// Drop a session's instances and build lock.
    pub fn invalidate(&self, session_id: &str) -> bool {
        let removed = self
            .instances
            .write()
            .map(|mut map| map.remove(session_id).is_some())
            .unwrap_or(false);
        if let Ok(mut locks) = self.build_locks.write() {
            locks.remove(session_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.instances.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
