/*!
Test Harness pour le kernel eclusa

Démarre un kernel complet (store mémoire, pipeline, serveur TCP sur port
éphémère) et fournit:
- Connexion de PLC simulés
- Envoi de trames avec attente de persistance
- Assertions sur les occurrences par code de définition
*/

use crate::plc_stub::PlcClient;
use anyhow::{bail, Context, Result};
use eclusa_kernel::config::{KernelConfig, StoreBackend};
use eclusa_kernel::models::{FaultDefinition, Occurrence};
use eclusa_kernel::server::ServerError;
use eclusa_kernel::store::{FaultStore, MemoryStore};
use eclusa_kernel::Kernel;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub kernel: Kernel,
    pub store: Arc<MemoryStore>,
    pub addr: SocketAddr,
    serve: JoinHandle<Result<(), ServerError>>,
}

impl TestHarness {
    /// Kernel complet sur 127.0.0.1:0 avec les définitions données
    pub async fn start(definitions: Vec<FaultDefinition>) -> Result<Self> {
        env_logger::try_init().ok();

        let store = Arc::new(MemoryStore::with_definitions(definitions));
        let mut config = KernelConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.http = None;
        let kernel = Kernel::build(config, Arc::clone(&store) as Arc<dyn FaultStore>);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = Arc::clone(&kernel.server);
        let serve = tokio::spawn(async move { server.serve(listener).await });
        log::info!("🧪 Test kernel listening on {} ({} definitions)", addr, kernel.definitions.len());

        Ok(Self { kernel, store, addr, serve })
    }

    pub async fn connect(&self) -> Result<PlcClient> {
        let plc = PlcClient::connect(self.addr).await?;
        self.wait_for(|h| h.kernel.server.connection_count() > 0)
            .await
            .context("connection never registered")?;
        Ok(plc)
    }

    /// Envoie une trame et attend que ses transitions soient persistées
    pub async fn send_words(&self, plc: &mut PlcClient, words: &[u16]) -> Result<()> {
        let before = self.kernel.health().frames_received;
        plc.send_words(words).await?;

        let detector = Arc::clone(self.kernel.pipeline.detector());
        self.wait_for(|h| {
            h.kernel.health().frames_received > before
                && words.iter().enumerate().all(|(i, w)| detector.last_value(i as u32) == Some(*w))
        })
        .await
        .context("frame never reached the detector")?;

        self.kernel.pipeline.flush().await;
        Ok(())
    }

    fn definition_id(&self, code: &str) -> Result<i64> {
        match self.kernel.definitions.by_code(code) {
            Some(def) => Ok(def.id),
            None => bail!("unknown definition code: {}", code),
        }
    }

    pub fn active_for(&self, code: &str) -> Result<Vec<Occurrence>> {
        Ok(self.store.active_for(self.definition_id(code)?))
    }

    pub fn history_for(&self, code: &str) -> Result<Vec<Occurrence>> {
        Ok(self.store.history_for(self.definition_id(code)?))
    }

    pub fn assert_active(&self, code: &str) -> Result<Occurrence> {
        let mut active = self.active_for(code)?;
        match active.len() {
            1 => Ok(active.remove(0)),
            n => bail!("expected exactly one active occurrence for {}, found {}", code, n),
        }
    }

    pub fn assert_resolved(&self, code: &str) -> Result<()> {
        if !self.active_for(code)?.is_empty() {
            bail!("{} is still active", code);
        }
        if !self.history_for(code)?.iter().any(|o| !o.is_active()) {
            bail!("{} has no resolved occurrence", code);
        }
        Ok(())
    }

    async fn wait_for<F>(&self, mut condition: F) -> Result<()>
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        while !condition(self) {
            if tokio::time::Instant::now() >= deadline {
                bail!("timed out after {:?}", SETTLE_TIMEOUT);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Arrêt du kernel, vérifie que la boucle d'acceptation s'est terminée proprement
    pub async fn shutdown(self) -> Result<()> {
        self.kernel.shutdown().await;
        self.serve.await?.context("accept loop failed")?;
        log::info!("🧪 Test kernel stopped");
        Ok(())
    }
}
