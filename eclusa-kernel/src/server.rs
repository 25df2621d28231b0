/**
 * CONNECTION MANAGER - Serveur TCP des PLC
 *
 * RÔLE :
 * Accepter les connexions PLC, lire les trames brutes et les pousser dans le
 * pipeline. Une tâche par connexion, un registre partagé des connexions
 * ouvertes pour l'API et pour l'arrêt.
 *
 * LECTURE :
 * - chaque read est borné par le timeout PLC ; timeout = on réessaie
 * - 0 octet = fin de flux, la tâche s'arrête et se désenregistre
 * - erreur I/O = warning puis fin de tâche
 * - n > 0 octets = ingestion synchrone (la connexion attend le pipeline)
 *
 * ARRÊT (stop, exécuté une seule fois) :
 * 1. signal d'arrêt levé
 * 2. attente de la fermeture du listener
 * 3. fermeture forcée de chaque connexion enregistrée
 * 4. attente de la fin de toutes les tâches de connexion
 */

use crate::config::TcpConf;
use crate::health::HealthTracker;
use crate::pipeline::Pipeline;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server already started")]
    AlreadyStarted,
}

struct ConnectionHandle {
    id: u64,
    token: CancellationToken,
    connected_at: OffsetDateTime,
    last_activity: OffsetDateTime,
}

/// Connexions ouvertes par adresse distante ; verrou jamais tenu à travers un `.await`
type Registry = Arc<Mutex<HashMap<SocketAddr, ConnectionHandle>>>;

/// Vue d'une connexion pour l'API
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub remote: SocketAddr,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

pub struct TcpServer {
    config: TcpConf,
    pipeline: Arc<Pipeline>,
    health: HealthTracker,
    registry: Registry,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    listener_closed: CancellationToken,
    started: AtomicBool,
    stopped: OnceCell<()>,
    next_id: AtomicU64,
}

impl TcpServer {
    pub fn new(config: TcpConf, pipeline: Arc<Pipeline>, health: HealthTracker) -> Self {
        Self {
            config,
            pipeline,
            health,
            registry: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            listener_closed: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: OnceCell::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bind sur tcp.host:tcp.port puis boucle d'acceptation jusqu'à `stop()`
    pub async fn start(&self) -> Result<(), ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        self.serve(listener).await
    }

    /// Boucle d'acceptation sur un listener déjà lié (port 0 dans les tests)
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        match listener.local_addr() {
            Ok(local) => tracing::info!(%local, "PLC listener ready"),
            Err(e) => tracing::warn!(error = %e, "PLC listener ready, local address unknown"),
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        self.spawn_connection(stream, peer);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        drop(listener);
        self.listener_closed.cancel();
        tracing::info!("PLC listener closed");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let now = OffsetDateTime::now_utc();
        {
            let mut registry = self.registry.lock();
            if let Some(previous) = registry.insert(
                peer,
                ConnectionHandle { id, token: token.clone(), connected_at: now, last_activity: now },
            ) {
                previous.token.cancel();
            }
        }
        self.health.connection_opened();
        tracing::info!(%peer, "PLC connected");

        let session = Session {
            id,
            peer,
            token,
            pipeline: Arc::clone(&self.pipeline),
            health: self.health.clone(),
            registry: Arc::clone(&self.registry),
            read_timeout: self.config.read_timeout,
            buffer_size: self.config.buffer_size.max(2),
        };
        self.tasks.spawn(session.run(stream));
    }

    /// Arrêt gracieux ; les appels répétés ou concurrents attendent le même arrêt
    pub async fn stop(&self) {
        self.stopped
            .get_or_init(|| async {
                tracing::info!("stopping PLC server");
                self.shutdown.cancel();
                if self.started.load(Ordering::SeqCst) {
                    self.listener_closed.cancelled().await;
                }

                let tokens: Vec<CancellationToken> =
                    self.registry.lock().values().map(|c| c.token.clone()).collect();
                for token in &tokens {
                    token.cancel();
                }

                self.tasks.close();
                self.tasks.wait().await;
                tracing::info!(closed = tokens.len(), "PLC server stopped");
            })
            .await;
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .registry
            .lock()
            .iter()
            .map(|(remote, c)| ConnectionInfo {
                remote: *remote,
                connected_at: c.connected_at,
                last_activity: c.last_activity,
            })
            .collect();
        list.sort_by_key(|c| c.connected_at);
        list
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

struct Session {
    id: u64,
    peer: SocketAddr,
    token: CancellationToken,
    pipeline: Arc<Pipeline>,
    health: HealthTracker,
    registry: Registry,
    read_timeout: std::time::Duration,
    buffer_size: usize,
}

impl Session {
    async fn run(self, mut stream: TcpStream) {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let read = tokio::select! {
                _ = self.token.cancelled() => {
                    tracing::debug!(peer = %self.peer, "connection closed by shutdown");
                    break;
                }
                read = tokio::time::timeout(self.read_timeout, stream.read(&mut buf)) => read,
            };

            match read {
                Err(_elapsed) => continue,
                Ok(Ok(0)) => {
                    tracing::info!(peer = %self.peer, "PLC closed the connection");
                    break;
                }
                Ok(Ok(n)) => {
                    let captured_at = OffsetDateTime::now_utc();
                    self.touch(captured_at);
                    self.health.frame_received(n);
                    self.pipeline.ingest(&buf[..n], captured_at, self.peer).await;
                }
                Ok(Err(e)) => {
                    tracing::warn!(peer = %self.peer, error = %e, "PLC read failed");
                    break;
                }
            }
        }

        self.deregister();
    }

    fn touch(&self, at: OffsetDateTime) {
        if let Some(handle) = self.registry.lock().get_mut(&self.peer).filter(|h| h.id == self.id) {
            handle.last_activity = at;
        }
    }

    fn deregister(&self) {
        let mut registry = self.registry.lock();
        // une reconnexion depuis la même adresse a pu remplacer l'entrée
        if registry.get(&self.peer).is_some_and(|h| h.id == self.id) {
            registry.remove(&self.peer);
        }
        drop(registry);
        self.health.connection_closed();
        tracing::debug!(peer = %self.peer, "connection deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConf;
    use crate::detector::BitChangeDetector;
    use crate::mapping::DefinitionMap;
    use crate::models::ResolvedBy;
    use crate::store::MemoryStore;
    use crate::tracker::OccurrenceTracker;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct Fixture {
        server: Arc<TcpServer>,
        pipeline: Arc<Pipeline>,
        store: Arc<MemoryStore>,
        addr: SocketAddr,
        serve: tokio::task::JoinHandle<Result<(), ServerError>>,
    }

    async fn fixture(read_timeout: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let health = HealthTracker::new();
        let tracker = OccurrenceTracker::new(Arc::new(DefinitionMap::legacy()), store.clone(), health.clone());
        let pipeline = Arc::new(Pipeline::start(Arc::new(BitChangeDetector::new()), tracker, health.clone(), &PipelineConf::default()));
        let config = TcpConf { host: "127.0.0.1".into(), port: 0, read_timeout, buffer_size: 64 };
        let server = Arc::new(TcpServer::new(config, Arc::clone(&pipeline), health));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });
        Fixture { server, pipeline, store, addr, serve }
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_lock_cycle_over_tcp() {
        let fx = fixture(Duration::from_secs(1)).await;
        let mut plc = TcpStream::connect(fx.addr).await.unwrap();

        plc.write_all(&[0x00, 0x00]).await.unwrap();
        let detector = Arc::clone(fx.pipeline.detector());
        eventually("first word", || detector.last_value(0) == Some(0)).await;

        plc.write_all(&[0x00, 0x03]).await.unwrap();
        let store = Arc::clone(&fx.store);
        eventually("two active", || store.active_for(9001).len() == 1 && store.active_for(9002).len() == 1).await;

        plc.write_all(&[0x00, 0x01]).await.unwrap();
        eventually("sensor resolved", || store.active_for(9002).is_empty()).await;

        let closed = store.history_for(9002);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].resolved_by, Some(ResolvedBy::Plc));
        assert_eq!(store.active_for(9001).len(), 1);

        fx.server.stop().await;
        fx.serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_repeated_frames_open_once() {
        let fx = fixture(Duration::from_secs(1)).await;
        let mut plc = TcpStream::connect(fx.addr).await.unwrap();
        let store = Arc::clone(&fx.store);
        let detector = Arc::clone(fx.pipeline.detector());

        plc.write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]).await.unwrap();
        eventually("baseline", || detector.tracked_words() == 3).await;

        for _ in 0..3 {
            plc.write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x01]).await.unwrap();
            eventually("gate open", || store.active_for(9004).len() == 1).await;
        }
        fx.pipeline.flush().await;
        assert_eq!(store.history_for(9004).len(), 1);

        fx.server.stop().await;
    }

    #[tokio::test]
    async fn test_read_timeout_keeps_connection_open() {
        let fx = fixture(Duration::from_millis(30)).await;
        let mut plc = TcpStream::connect(fx.addr).await.unwrap();
        let server = Arc::clone(&fx.server);
        eventually("registration", || server.connection_count() == 1).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.server.connection_count(), 1);

        plc.write_all(&[0x00, 0x01]).await.unwrap();
        let store = Arc::clone(&fx.store);
        eventually("valve open", || store.active_for(9001).len() == 1).await;

        fx.server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_deregisters() {
        let fx = fixture(Duration::from_secs(1)).await;
        let plc = TcpStream::connect(fx.addr).await.unwrap();
        let server = Arc::clone(&fx.server);
        eventually("registration", || server.connection_count() == 1).await;

        let local = plc.local_addr().unwrap();
        assert_eq!(fx.server.connections()[0].remote, local);

        drop(plc);
        eventually("deregistration", || server.connection_count() == 0).await;
        fx.server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_everything_once() {
        let fx = fixture(Duration::from_secs(10)).await;
        let mut a = TcpStream::connect(fx.addr).await.unwrap();
        let mut b = TcpStream::connect(fx.addr).await.unwrap();
        let server = Arc::clone(&fx.server);
        eventually("two connections", || server.connection_count() == 2).await;

        tokio::join!(fx.server.stop(), fx.server.stop());
        fx.server.stop().await;

        assert!(fx.server.is_stopping());
        assert_eq!(fx.server.connection_count(), 0);
        fx.serve.await.unwrap().unwrap();

        let mut buf = [0u8; 4];
        for client in [&mut a, &mut b] {
            let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap();
            assert!(matches!(n, Ok(0) | Err(_)));
        }
        assert!(TcpStream::connect(fx.addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_before_start_returns() {
        let fx = fixture(Duration::from_secs(1)).await;
        fx.server.stop().await;
        fx.serve.await.unwrap().unwrap();

        let health = HealthTracker::new();
        let tracker = OccurrenceTracker::new(Arc::new(DefinitionMap::legacy()), Arc::new(MemoryStore::new()), health.clone());
        let pipeline = Arc::new(Pipeline::start(Arc::new(BitChangeDetector::new()), tracker, health.clone(), &PipelineConf::default()));
        let idle = TcpServer::new(TcpConf::default(), pipeline, health);
        tokio::time::timeout(Duration::from_secs(1), idle.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let health = HealthTracker::new();
        let tracker = OccurrenceTracker::new(Arc::new(DefinitionMap::legacy()), Arc::new(MemoryStore::new()), health.clone());
        let pipeline = Arc::new(Pipeline::start(Arc::new(BitChangeDetector::new()), tracker, health.clone(), &PipelineConf::default()));
        let config = TcpConf { host: "127.0.0.1".into(), port, ..TcpConf::default() };
        let server = TcpServer::new(config, pipeline, health);

        assert!(matches!(server.start().await, Err(ServerError::Bind { .. })));
    }
}
