use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub tcp: TcpConf,
    /// `http: null` désactive l'API REST
    pub http: Option<HttpConf>,
    pub store: StoreConf,
    pub log: LogConf,
    pub pipeline: PipelineConf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConf::default(),
            http: Some(HttpConf::default()),
            store: StoreConf::default(),
            log: LogConf::default(),
            pipeline: PipelineConf::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TcpConf {
    pub host: String,
    pub port: u16,
    /// Timeout d'une lecture PLC, ex: "5s"
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for TcpConf {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8502,
            read_timeout: Duration::from_secs(5),
            buffer_size: 4096,
        }
    }
}

impl TcpConf {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8080 }
    }
}

impl HttpConf {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub backend: StoreBackend,
    pub path: PathBuf,
    /// Fichier YAML de définitions importé au démarrage
    pub seed_file: Option<PathBuf>,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("./data/eclusa.db"),
            seed_file: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConf {
    pub level: String,
}

impl Default for LogConf {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConf {
    /// Lots de transitions en attente de persistance avant back-pressure
    pub queue_capacity: usize,
    /// Tentatives supplémentaires quand le store échoue sur une transition
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for PipelineConf {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {name}: '{value}' ({reason})")]
    InvalidVar { name: &'static str, value: String, reason: String },
}

/// Config chargée + avertissements à journaliser une fois le logger prêt
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: KernelConfig,
    pub warnings: Vec<String>,
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    Ok(serde_yaml::from_str(txt)?)
}

/// Surcharges par variables d'environnement (TCP_HOST, TCP_PORT, PLC_TIMEOUT, DB_PATH, HTTP_PORT, LOG_LEVEL).
/// Chaque variable est indépendante : une valeur invalide garde la valeur courante
/// et produit une erreur, les autres sont appliquées quand même.
pub fn apply_env_overrides<F>(config: &mut KernelConfig, lookup: F) -> Vec<ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    if let Some(host) = lookup("TCP_HOST") {
        config.tcp.host = host;
    }
    if let Some(port) = lookup("TCP_PORT") {
        match parse_var("TCP_PORT", port, |v| v.parse::<u16>().map_err(|e| e.to_string())) {
            Ok(port) => config.tcp.port = port,
            Err(e) => errors.push(e),
        }
    }
    if let Some(timeout) = lookup("PLC_TIMEOUT") {
        match parse_var("PLC_TIMEOUT", timeout, |v| humantime::parse_duration(v).map_err(|e| e.to_string())) {
            Ok(timeout) => config.tcp.read_timeout = timeout,
            Err(e) => errors.push(e),
        }
    }
    if let Some(path) = lookup("DB_PATH") {
        config.store.path = PathBuf::from(path);
    }
    if let Some(port) = lookup("HTTP_PORT") {
        match parse_var("HTTP_PORT", port, |v| v.parse::<u16>().map_err(|e| e.to_string())) {
            Ok(port) => config.http.get_or_insert_with(HttpConf::default).port = port,
            Err(e) => errors.push(e),
        }
    }
    if let Some(level) = lookup("LOG_LEVEL") {
        config.log.level = level;
    }

    errors
}

fn parse_var<T>(name: &'static str, value: String, parse: impl Fn(&str) -> Result<T, String>) -> Result<T, ConfigError> {
    parse(value.trim()).map_err(|reason| ConfigError::InvalidVar { name, value, reason })
}

pub async fn load_config() -> LoadedConfig {
    let path = std::env::var("ECLUSA_CONFIG").unwrap_or_else(|_| "eclusa.yaml".into());
    let mut warnings = Vec::new();

    let mut config = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warnings.push(format!("config invalide ({path}): {e}"));
            KernelConfig::default()
        })
    } else {
        warnings.push(format!("pas de {path}, usage config par défaut"));
        KernelConfig::default()
    };

    for e in apply_env_overrides(&mut config, |name| std::env::var(name).ok()) {
        warnings.push(format!("surcharge ignorée: {e}"));
    }

    LoadedConfig { config, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.tcp.bind_addr(), "0.0.0.0:8502");
        assert_eq!(cfg.tcp.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.tcp.buffer_size, 4096);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.pipeline.queue_capacity, 1024);
        assert_eq!(cfg.pipeline.max_retries, 3);
        assert_eq!(cfg.pipeline.retry_backoff, Duration::from_millis(200));
        assert_eq!(cfg.http.map(|h| h.bind_addr()).as_deref(), Some("0.0.0.0:8080"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            r#"
tcp:
  port: 9600
  read_timeout: 750ms
http:
  port: 8088
store:
  backend: memory
"#,
        )
        .unwrap();

        assert_eq!(cfg.tcp.port, 9600);
        assert_eq!(cfg.tcp.host, "0.0.0.0");
        assert_eq!(cfg.tcp.read_timeout, Duration::from_millis(750));
        assert_eq!(cfg.http.unwrap().bind_addr(), "0.0.0.0:8088");
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn test_http_can_be_disabled() {
        let cfg = parse_config("http: null\n").unwrap();
        assert!(cfg.http.is_none());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(parse_config("  \n").unwrap().tcp.port, 8502);
        assert!(parse_config("tcp: [oops").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TCP_HOST", "127.0.0.1"),
            ("TCP_PORT", "5020"),
            ("PLC_TIMEOUT", "2s"),
            ("DB_PATH", "/tmp/x.db"),
            ("HTTP_PORT", "9000"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut cfg = KernelConfig::default();
        assert!(apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string())).is_empty());

        assert_eq!(cfg.tcp.bind_addr(), "127.0.0.1:5020");
        assert_eq!(cfg.tcp.read_timeout, Duration::from_secs(2));
        assert_eq!(cfg.store.path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.http.as_ref().map(|h| h.port), Some(9000));
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let mut cfg = KernelConfig::default();
        let errors = apply_env_overrides(&mut cfg, |k| (k == "TCP_PORT").then(|| "huit".to_string()));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ConfigError::InvalidVar { name: "TCP_PORT", .. }));
        assert_eq!(cfg.tcp.port, 8502);
    }

    #[test]
    fn test_bad_variable_does_not_block_later_ones() {
        let env: HashMap<&str, &str> = [
            ("TCP_PORT", "oops"),
            ("PLC_TIMEOUT", "bientot"),
            ("DB_PATH", "/srv/eclusa/prod.db"),
            ("HTTP_PORT", "9090"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut cfg = KernelConfig::default();
        let errors = apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

        let names: Vec<_> = errors
            .iter()
            .filter_map(|e| match e {
                ConfigError::InvalidVar { name, .. } => Some(*name),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["TCP_PORT", "PLC_TIMEOUT"]);
        assert_eq!(cfg.tcp.port, 8502);
        assert_eq!(cfg.tcp.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.store.path, PathBuf::from("/srv/eclusa/prod.db"));
        assert_eq!(cfg.http.as_ref().map(|h| h.port), Some(9090));
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn test_durations_serialize_as_humantime() {
        let yaml = serde_yaml::to_string(&KernelConfig::default()).unwrap();
        assert!(yaml.contains("read_timeout: 5s"));
        assert!(yaml.contains("retry_backoff: 200ms"));
        assert_eq!(parse_config(&yaml).unwrap().pipeline.retry_backoff, Duration::from_millis(200));
    }
}
