use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/pipeline.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for environment variable {name}: {value}")]
    Env { name: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub labels: LabelConfig,
    pub imaging: ImagingConfig,
    pub engine: EngineConfig,
    pub gate: GateConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            cors_origins: Vec::new(),
        }
    }
}

/// The closed label set of the binary classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub positive: String,
    pub negative: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            positive: "Pneumonia".to_string(),
            negative: "Normal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    pub target_size: u32,
    pub min_edge: u32,
    pub max_bytes: usize,
    pub intensity_range: [f32; 2],
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            target_size: 224,
            min_edge: 100,
            max_bytes: 50 * 1024 * 1024,
            intensity_range: [0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Subprocess,
    Torch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub command: String,
    pub args: Vec<String>,
    pub model_path: Option<String>,
    pub timeout_secs: u64,
    pub init_timeout_secs: u64,
    pub max_concurrent: usize,
    /// Output index of the positive class for the torch engine.
    pub positive_index: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Subprocess,
            command: "python3".to_string(),
            args: vec!["scripts/cnn_worker.py".to_string()],
            model_path: None,
            timeout_secs: 60,
            init_timeout_secs: 120,
            max_concurrent: 4,
            positive_index: 0,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub threshold: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { threshold: 0.8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationProtocol {
    TextGeneration,
    ChatCompletions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLanguage {
    English,
    Spanish,
}

impl ReportLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportLanguage::English => "english",
            ReportLanguage::Spanish => "spanish",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub endpoint: String,
    pub model: String,
    pub protocol: GenerationProtocol,
    pub language: ReportLanguage,
    /// Never read from the YAML file; filled from the environment.
    #[serde(skip)]
    pub token: Option<String>,
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub attempt_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api-inference.huggingface.co/models/google/medgemma-7b".to_string(),
            model: "google/medgemma-7b".to_string(),
            protocol: GenerationProtocol::TextGeneration,
            language: ReportLanguage::English,
            token: None,
            max_new_tokens: 1000,
            temperature: 0.3,
            top_p: 0.9,
            repetition_penalty: 1.1,
            attempt_timeout_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl ReportConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub warmup_delay_secs: u64,
    pub warmup_max_delay_secs: u64,
    pub transient_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            warmup_delay_secs: 20,
            warmup_max_delay_secs: 60,
            transient_delay_secs: 5,
        }
    }
}

impl AppConfig {
    /// Loads `$PIPELINE_CONFIG` (or `config/pipeline.yaml`), applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("PIPELINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            log::warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Env {
                name: "PORT",
                value: port.clone(),
            })?;
        }
        if let Some(threshold) = lookup("CONFIDENCE_THRESHOLD") {
            self.gate.threshold = threshold.parse().map_err(|_| ConfigError::Env {
                name: "CONFIDENCE_THRESHOLD",
                value: threshold.clone(),
            })?;
        }
        if let Some(endpoint) = lookup("REPORT_ENDPOINT") {
            self.report.endpoint = endpoint;
        }
        self.report.token = lookup("HUGGINGFACE_TOKEN")
            .or_else(|| lookup("HF_TOKEN"))
            .filter(|token| !token.trim().is_empty());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(0.0..=1.0).contains(&self.gate.threshold) {
            return invalid("gate.threshold must lie in [0, 1]");
        }
        if self.labels.positive.trim().is_empty() || self.labels.negative.trim().is_empty() {
            return invalid("labels must not be empty");
        }
        if self.labels.positive == self.labels.negative {
            return invalid("positive and negative labels must differ");
        }
        if self.imaging.target_size == 0 {
            return invalid("imaging.target_size must be positive");
        }
        if self.imaging.min_edge > self.imaging.target_size {
            return invalid("imaging.min_edge must not exceed imaging.target_size");
        }
        let [low, high] = self.imaging.intensity_range;
        if !(low.is_finite() && high.is_finite() && low < high) {
            return invalid("imaging.intensity_range must be an increasing pair");
        }
        if self.engine.timeout_secs == 0 || self.engine.init_timeout_secs == 0 {
            return invalid("engine timeouts must be positive");
        }
        if self.engine.max_concurrent == 0 {
            return invalid("engine.max_concurrent must be positive");
        }
        if self.report.attempt_timeout_secs == 0 {
            return invalid("report.attempt_timeout_secs must be positive");
        }
        if self.report.retry.max_attempts == 0 {
            return invalid("report.retry.max_attempts must be at least 1");
        }
        if self.report.retry.warmup_delay_secs > self.report.retry.warmup_max_delay_secs {
            return invalid("report.retry.warmup_delay_secs must not exceed warmup_max_delay_secs");
        }
        Ok(())
    }
}
