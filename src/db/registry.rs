//! The master engine plus its slave engines.

use crate::config::DbSettings;
use crate::db::engine::{Engine, PoolStatus};
use crate::db::selector::{SlaveSelector, UniformRandom};
use crate::error::{DbError, DbResult};
use crate::models::Role;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Every engine of the process, keyed by role.
#[derive(Debug, Clone)]
pub struct Engines {
    master: Engine,
    slaves: Vec<Engine>,
    selector: Arc<dyn SlaveSelector>,
}

/// Pool status of one engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub role: String,
    #[serde(flatten)]
    pub pool: PoolStatus,
}

impl Engines {
    /// Build one engine per configured role.
    ///
    /// Engines connect lazily; nothing touches the network here.
    pub fn configure(settings: &DbSettings) -> DbResult<Self> {
        let application_name = settings.application_name.as_deref();
        let master = Engine::new(
            Role::Master,
            &settings.master,
            application_name,
            settings.pool_timeout,
        )?;
        let slaves = settings
            .slaves
            .iter()
            .enumerate()
            .map(|(idx, config)| {
                Engine::new(
                    Role::Slave(idx),
                    config,
                    application_name,
                    settings.pool_timeout,
                )
            })
            .collect::<DbResult<Vec<_>>>()?;

        info!(slaves = slaves.len(), "Configured engines");
        Self::from_engines(master, slaves)
    }

    /// Assemble engines built elsewhere. At least one slave is required.
    pub fn from_engines(master: Engine, slaves: Vec<Engine>) -> DbResult<Self> {
        if slaves.is_empty() {
            return Err(DbError::configuration(
                "At least one slave engine is required (use the master's configuration as a fallback)",
            ));
        }
        Ok(Self {
            master,
            slaves,
            selector: Arc::new(UniformRandom),
        })
    }

    /// Replace the slave selection strategy.
    pub fn with_selector(mut self, selector: Arc<dyn SlaveSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn master(&self) -> &Engine {
        &self.master
    }

    pub fn slaves(&self) -> &[Engine] {
        &self.slaves
    }

    /// Pick the slave engine for a new read session.
    pub fn choose_slave(&self) -> &Engine {
        let idx = self.selector.select(self.slaves.len());
        // Selector output is untrusted; clamp to a valid index.
        &self.slaves[idx.min(self.slaves.len() - 1)]
    }

    /// Close every pool. Call on graceful shutdown.
    pub fn dispose_all(&self) {
        self.master.dispose();
        for slave in &self.slaves {
            slave.dispose();
        }
        info!("Disposed all engines");
    }

    /// Abandon every inherited connection. Call first thing in a forked child.
    pub fn reset_after_fork(&self) {
        self.master.reset_after_fork();
        for slave in &self.slaves {
            slave.reset_after_fork();
        }
    }

    pub fn status(&self) -> Vec<EngineStatus> {
        std::iter::once(&self.master)
            .chain(self.slaves.iter())
            .map(|engine| EngineStatus {
                role: engine.role().to_string(),
                pool: engine.status(),
            })
            .collect()
    }
}
