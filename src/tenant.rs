use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use crate::cache::{KvStore, NamespacedKv};
use crate::clock::Clock;
use crate::engine::{Engine, EnginePorts, EngineSettings, ExpiryProcessor};
use crate::jobs::DurableJobQueue;
use crate::limits::*;
use crate::reaper;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant name too long")]
    NameTooLong,
    #[error("empty tenant name")]
    EmptyName,
    #[error("too many tenants")]
    TooMany,
    #[error("could not open tenant storage: {0}")]
    Io(#[from] std::io::Error),
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL, a job
/// queue with its expiry worker, and a compactor. Tenant = database name from
/// the pgwire connection. The side store is shared, namespaced per tenant.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    side_store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        side_store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            side_store,
            clock,
            settings,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> Result<Arc<Engine>, TenantError> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(TenantError::NameTooLong);
        }
        // Sanitized name keys the map and names the files, so it cannot escape data_dir.
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(TenantError::EmptyName);
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(TenantError::TooMany);
        }

        // The shard lock is held while opening, so one tenant never gets two engines.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let engine = self.open_tenant(&safe_name)?;
                slot.insert(engine.clone());
                engine
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant = %safe_name, "tenant opened");
        Ok(engine)
    }

    /// Open every tenant that already has a log under `data_dir`, so its
    /// expiry worker runs without waiting for a client. Returns the names.
    pub fn open_existing(&self) -> Result<Vec<String>, TenantError> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if !matches!(path.extension().and_then(|e| e.to_str()), Some("wal" | "jobs")) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Files this manager did not name are left alone.
            if !stem.is_empty() && sanitize(stem) == stem {
                names.insert(stem.to_string());
            }
        }
        for name in &names {
            self.get_or_create(name)?;
        }
        Ok(names.into_iter().collect())
    }

    fn open_tenant(&self, name: &str) -> Result<Arc<Engine>, TenantError> {
        let queue = Arc::new(DurableJobQueue::open(
            self.data_dir.join(format!("{name}.jobs")),
            self.clock.clone(),
        )?);
        let ports = EnginePorts {
            side_store: Arc::new(NamespacedKv::new(self.side_store.clone(), name)),
            jobs: queue.clone(),
            clock: self.clock.clone(),
        };
        let engine = Arc::new(Engine::new(
            self.data_dir.join(format!("{name}.wal")),
            ports,
            self.settings,
        )?);

        let processor = Arc::new(ExpiryProcessor::new(engine.clone()));
        tokio::spawn(reaper::run_expiry_worker(queue.clone(), processor));
        tokio::spawn(reaper::run_compactor(engine.clone(), queue, self.compact_threshold));
        Ok(engine)
    }
}

fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
