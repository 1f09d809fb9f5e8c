use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the content moderator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Frame sampling settings
    pub sampling: SamplingConfig,

    /// Worker pool settings for per-frame classification
    pub pipeline: PipelineConfig,

    /// Classification service settings
    pub classifier: ClassifierConfig,

    /// User store settings
    pub users: UsersConfig,

    /// Reports and logging
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Frames per second of video to retain for classification
    pub target_fps: f64,

    /// Longest edge of a sampled frame in pixels; larger videos are downscaled
    pub max_edge: u32,

    /// JPEG quality of materialized frames (1-100)
    pub jpeg_quality: u8,

    /// Parent directory for per-pipeline frame directories (system temp if unset)
    pub frame_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of classification calls in flight
    pub max_workers: usize,

    /// Upper bound for one classification call (seconds)
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Memoise definitive verdicts by payload hash
    pub cache_results: bool,

    /// Baidu content censor credentials and endpoints
    pub baidu: BaiduConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaiduConfig {
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub token_endpoint: String,
    pub image_endpoint: String,
    pub text_endpoint: String,

    /// HTTP request timeout in seconds
    pub timeout_seconds: u64,

    /// Retries for transient failures
    pub max_retries: u32,

    /// Base delay between retries, doubled on every attempt
    pub retry_backoff_ms: u64,

    /// Map the provider's "suspected" conclusion to non-compliant instead of indeterminate
    pub suspected_is_non_compliant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsersConfig {
    /// JSON file backing the user store
    pub store_path: PathBuf,

    /// Require `--user`/`--password` before moderation commands run
    pub require_login: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory where JSON reports are written (disabled if unset)
    pub report_dir: Option<PathBuf>,

    /// Log level
    pub log_level: String,
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Load configuration from the first readable file, then apply env overrides
    pub fn load() -> Result<Self> {
        let config_paths = [
            "content-moderator.toml",
            "config/content-moderator.toml",
        ];

        for path in &config_paths {
            if Path::new(path).exists() {
                return Self::from_file(Path::new(path));
            }
        }

        Self::from_env()
    }

    /// Load configuration from a TOML file, then apply env overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let mut config: Config = toml::from_str(&config_str)
            .map_err(|e| anyhow!("Failed to parse config {}: {}", path.display(), e))?;
        tracing::info!("📄 Loaded configuration from: {}", path.display());

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(api_key) = std::env::var("MODERATOR_API_KEY") {
            self.classifier.baidu.api_key = Some(api_key);
        }

        if let Ok(secret_key) = std::env::var("MODERATOR_SECRET_KEY") {
            self.classifier.baidu.secret_key = Some(secret_key);
        }

        if let Ok(workers) = std::env::var("MODERATOR_WORKERS") {
            match workers.parse() {
                Ok(workers) => self.pipeline.max_workers = workers,
                Err(_) => tracing::warn!("Ignoring invalid MODERATOR_WORKERS: {}", workers),
            }
        }

        if let Ok(fps) = std::env::var("MODERATOR_TARGET_FPS") {
            match fps.parse() {
                Ok(fps) => self.sampling.target_fps = fps,
                Err(_) => tracing::warn!("Ignoring invalid MODERATOR_TARGET_FPS: {}", fps),
            }
        }

        if let Ok(dir) = std::env::var("MODERATOR_REPORT_DIR") {
            self.output.report_dir = Some(PathBuf::from(dir));
        }

        if let Ok(path) = std::env::var("MODERATOR_USER_STORE") {
            self.users.store_path = PathBuf::from(path);
        }

        if let Ok(log_level) = std::env::var("MODERATOR_LOG_LEVEL") {
            self.output.log_level = log_level;
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_workers == 0 {
            return Err(anyhow!("max_workers must be greater than 0"));
        }

        if self.pipeline.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than 0"));
        }

        if !(self.sampling.target_fps.is_finite() && self.sampling.target_fps > 0.0) {
            return Err(anyhow!("target_fps must be a positive number"));
        }

        if self.sampling.max_edge == 0 {
            return Err(anyhow!("max_edge must be greater than 0"));
        }

        if !(1..=100).contains(&self.sampling.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }

        Ok(())
    }

    /// Whether Baidu credentials are present
    pub fn has_credentials(&self) -> bool {
        self.classifier.baidu.api_key.is_some() && self.classifier.baidu.secret_key.is_some()
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Content Moderator Configuration:\n\
            - Workers: {}\n\
            - Target FPS: {}\n\
            - Max Frame Edge: {}px\n\
            - Request Timeout: {}s\n\
            - Result Cache: {}\n\
            - Credentials: {}\n\
            - User Store: {}",
            self.pipeline.max_workers,
            self.sampling.target_fps,
            self.sampling.max_edge,
            self.pipeline.request_timeout_secs,
            self.classifier.cache_results,
            if self.has_credentials() { "configured" } else { "missing" },
            self.users.store_path.display(),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            pipeline: PipelineConfig::default(),
            classifier: ClassifierConfig::default(),
            users: UsersConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            target_fps: crate::sampler::DEFAULT_TARGET_FPS,
            max_edge: 1280,
            jpeg_quality: 90,
            frame_dir: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().min(8), // Use available cores, max 8
            request_timeout_secs: 10,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_results: true,
            baidu: BaiduConfig::default(),
        }
    }
}

impl Default for BaiduConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            secret_key: None,
            token_endpoint: "https://aip.baidubce.com/oauth/2.0/token".to_string(),
            image_endpoint:
                "https://aip.baidubce.com/rest/2.0/solution/v1/img_censor/v2/user_defined"
                    .to_string(),
            text_endpoint:
                "https://aip.baidubce.com/rest/2.0/solution/v1/text_censor/v2/user_defined"
                    .to_string(),
            timeout_seconds: 8,
            max_retries: 2,
            retry_backoff_ms: 250,
            suspected_is_non_compliant: false,
        }
    }
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/users.json"),
            require_login: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            report_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.pipeline.max_workers = workers;
        self
    }

    pub fn with_target_fps(mut self, fps: f64) -> Self {
        self.config.sampling.target_fps = fps;
        self
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.config.pipeline.request_timeout_secs = secs;
        self
    }

    pub fn with_frame_dir(mut self, dir: PathBuf) -> Self {
        self.config.sampling.frame_dir = Some(dir);
        self
    }

    pub fn with_report_dir(mut self, dir: PathBuf) -> Self {
        self.config.output.report_dir = Some(dir);
        self
    }

    pub fn with_credentials(mut self, api_key: String, secret_key: String) -> Self {
        self.config.classifier.baidu.api_key = Some(api_key);
        self.config.classifier.baidu.secret_key = Some(secret_key);
        self
    }

    pub fn with_user_store(mut self, path: PathBuf) -> Self {
        self.config.users.store_path = path;
        self
    }

    pub fn enable_caching(mut self, enable: bool) -> Self {
        self.config.classifier.cache_results = enable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sampling.target_fps, 2.0);
        assert!(config.pipeline.max_workers >= 1);
        assert!(config.classifier.cache_results);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .with_workers(3)
            .with_target_fps(5.0)
            .enable_caching(false)
            .build();

        assert_eq!(config.pipeline.max_workers, 3);
        assert_eq!(config.sampling.target_fps, 5.0);
        assert!(!config.classifier.cache_results);
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        assert!(ConfigBuilder::new().with_workers(0).build().validate().is_err());
        assert!(ConfigBuilder::new().with_target_fps(0.0).build().validate().is_err());
        assert!(ConfigBuilder::new().with_target_fps(f64::NAN).build().validate().is_err());
        assert!(ConfigBuilder::new().with_request_timeout(0).build().validate().is_err());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("content-moderator.toml");
        std::fs::write(&path, "[sampling]\ntarget_fps = 4.0\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sampling.target_fps, 4.0);
        assert_eq!(config.sampling.max_edge, 1280);
        assert_eq!(config.pipeline.request_timeout_secs, 10);
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("saved.toml");
        let config = ConfigBuilder::new().with_workers(2).build();

        config.save(&path).unwrap();
        let reloaded = Config::from_file(&path).unwrap();
        assert_eq!(reloaded.pipeline.max_workers, 2);
    }
}
