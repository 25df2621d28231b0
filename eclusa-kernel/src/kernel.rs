//! Assemblage : store + définitions + détecteur + tracker + pipeline + serveur TCP.
//! Utilisé tel quel par le binaire et par le TestHarness du devkit.

use crate::config::{KernelConfig, StoreBackend};
use crate::detector::BitChangeDetector;
use crate::health::{HealthTracker, KernelHealth};
use crate::mapping::DefinitionMap;
use crate::pipeline::Pipeline;
use crate::server::TcpServer;
use crate::store::{read_seed_file, FaultStore, MemoryStore, SqliteStore, StoreError};
use crate::tracker::OccurrenceTracker;
use std::sync::Arc;

#[derive(Clone)]
pub struct Kernel {
    pub config: KernelConfig,
    pub store: Arc<dyn FaultStore>,
    pub definitions: Arc<DefinitionMap>,
    pub pipeline: Arc<Pipeline>,
    pub server: Arc<TcpServer>,
    pub health: HealthTracker,
}

impl Kernel {
    /// Ouvre le backend configuré et importe le fichier seed s'il y en a un
    pub fn open_store(config: &KernelConfig) -> Result<Arc<dyn FaultStore>, StoreError> {
        let store: Arc<dyn FaultStore> = match config.store.backend {
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.store.path)?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };

        if let Some(seed) = &config.store.seed_file {
            let defs = read_seed_file(seed)?;
            let count = store.upsert_definitions(&defs)?;
            tracing::info!(seed = %seed.display(), definitions = count, "definitions seeded");
        }

        Ok(store)
    }

    /// Câble tous les composants ; à appeler dans un runtime tokio
    pub fn build(config: KernelConfig, store: Arc<dyn FaultStore>) -> Self {
        let health = HealthTracker::new();
        let definitions = Arc::new(DefinitionMap::load(store.as_ref()));
        if definitions.is_degraded() {
            tracing::warn!("running with legacy static definitions");
        }

        let tracker = OccurrenceTracker::new(Arc::clone(&definitions), Arc::clone(&store), health.clone());
        let pipeline = Arc::new(Pipeline::start(
            Arc::new(BitChangeDetector::new()),
            tracker,
            health.clone(),
            &config.pipeline,
        ));
        let server = Arc::new(TcpServer::new(config.tcp.clone(), Arc::clone(&pipeline), health.clone()));

        Self { config, store, definitions, pipeline, server, health }
    }

    pub fn health(&self) -> KernelHealth {
        self.health.get_health(self.definitions.len(), self.definitions.source(), self.store.info())
    }

    /// Arrêt ordonné : plus de lectures TCP, puis vidage de la file de persistance
    pub async fn shutdown(&self) {
        self.server.stop().await;
        self.pipeline.close().await;
    }
}
