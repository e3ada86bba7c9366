//! Tenant provisioning hub.
//!
//! Storage and search both need to react when a tenant appears or goes away.
//! Each registers a [`TenantListener`]; the hub fans every event out to all
//! of them in registration order. Deleting a tenant that lives in shared
//! storage means removing its rows one partition at a time, so listeners may
//! hand that work to a background task and return its handle.

use crate::error::Result;
use crate::types::Tenant;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// Background cleanup started by a tenant deletion. Resolves to the number
/// of rows or documents removed.
pub type BackgroundJob = tokio::task::JoinHandle<Result<usize>>;

#[async_trait]
pub trait TenantListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_tenant_created(&self, tenant: &Tenant) -> Result<()>;

    async fn on_tenant_deleted(&self, tenant: &Tenant) -> Result<Option<BackgroundJob>>;
}

#[derive(Default)]
pub struct TenantLifecycle {
    listeners: RwLock<Vec<Arc<dyn TenantListener>>>,
}

impl TenantLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn TenantListener>) {
        tracing::debug!("[LIFECYCLE] registered listener {}", listener.name());
        match self.listeners.write() {
            Ok(mut list) => list.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn TenantListener>> {
        match self.listeners.read() {
            Ok(list) => list.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Provisions storage for a new tenant. Stops at the first listener
    /// that fails.
    pub async fn tenant_created(&self, tenant: &Tenant) -> Result<()> {
        tracing::info!(
            "[LIFECYCLE {}] created (shared_table={}, shared_index={})",
            tenant.name(),
            tenant.shared_table,
            tenant.shared_index
        );
        for listener in self.snapshot() {
            listener.on_tenant_created(tenant).await?;
        }
        Ok(())
    }

    /// Tears down a tenant. Every listener runs even if an earlier one
    /// fails; the first error is returned after all have been notified.
    pub async fn tenant_deleted(&self, tenant: &Tenant) -> Result<Vec<BackgroundJob>> {
        tracing::info!("[LIFECYCLE {}] deleted", tenant.name());
        let mut jobs = Vec::new();
        let mut first_error = None;
        for listener in self.snapshot() {
            match listener.on_tenant_deleted(tenant).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        "[LIFECYCLE {}] listener {} failed: {}",
                        tenant.name(),
                        listener.name(),
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(jobs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShortstackError;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        events: Arc<Mutex<Vec<String>>>,
        fail_delete: bool,
    }

    #[async_trait]
    impl TenantListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_tenant_created(&self, tenant: &Tenant) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:created:{}", self.name, tenant.name()));
            Ok(())
        }

        async fn on_tenant_deleted(&self, tenant: &Tenant) -> Result<Option<BackgroundJob>> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:deleted:{}", self.name, tenant.name()));
            if self.fail_delete {
                return Err(ShortstackError::Backend("boom".into()));
            }
            Ok(Some(tokio::spawn(async { Ok(3) })))
        }
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let hub = TenantLifecycle::new();
        for (name, fail) in [("store", true), ("search", false)] {
            hub.register(Arc::new(Recorder {
                name: name.into(),
                events: Arc::clone(&events),
                fail_delete: fail,
            }));
        }

        hub.tenant_created(&Tenant::new("acme")).await.unwrap();
        let result = hub.tenant_deleted(&Tenant::new("acme")).await;
        assert!(result.is_err());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "store:created:acme",
                "search:created:acme",
                "store:deleted:acme",
                "search:deleted:acme"
            ]
        );
    }

    #[tokio::test]
    async fn test_background_jobs_are_returned() {
        let hub = TenantLifecycle::new();
        hub.register(Arc::new(Recorder {
            name: "store".into(),
            events: Arc::new(Mutex::new(Vec::new())),
            fail_delete: false,
        }));
        let jobs = hub.tenant_deleted(&Tenant::shared("acme")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        for job in jobs {
            assert_eq!(job.await.unwrap().unwrap(), 3);
        }
    }
}
