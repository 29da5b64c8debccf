use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::governor::DEFAULT_THRESHOLD_LADDER;
use crate::limits::RateLimitConfig;
use crate::pricing::{PriceSnapshot, PricingError, PricingTable};

pub const MASTER_KEY_ENV: &str = "KEYMETER_MASTER_KEY";
pub const PEPPER_ENV: &str = "KEYMETER_PEPPER";
pub const ADMIN_TOKEN_ENV: &str = "KEYMETER_ADMIN_TOKEN";

const DEFAULT_UPSTREAM_URL: &str = "https://api.openai.com";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("{name} must be exactly {expected} hex characters")]
    BadKeyLength { name: &'static str, expected: usize },
    #[error("{name} must be at least {minimum} hex characters")]
    KeyTooShort { name: &'static str, minimum: usize },
    #[error("{name} must be hex-encoded")]
    BadKeyEncoding { name: &'static str },
    #[error("invalid listen address {0}")]
    BadListenAddr(String),
    #[error("invalid budget threshold {0}: must be within 1..=100")]
    BadThreshold(u32),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Pricing(#[from] PricingError),
}

/// Optional TOML file: models with prices, rate-limit window, threshold
/// ladder, upstream settings. Secrets never live here.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub upstream_url: Option<String>,
    #[serde(default)]
    pub upstream_timeout_secs: Option<u64>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub budget_thresholds: Option<Vec<u32>>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub prompt_usd_per_mtok: f64,
    pub completion_usd_per_mtok: f64,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully validated runtime configuration. Constructed once at startup;
/// a malformed master key or pepper aborts before the listener binds.
pub struct AppConfig {
    pub listen: SocketAddr,
    pub sqlite_path: PathBuf,
    pub upstream_url: String,
    pub upstream_timeout: Duration,
    pub master_key: [u8; 32],
    pub pepper: Vec<u8>,
    pub admin_token: Option<String>,
    pub allowed_models: Vec<String>,
    pub pricing: PricingTable,
    pub rate_limit: RateLimitConfig,
    pub thresholds: Vec<u32>,
}

pub struct LoadOptions {
    pub listen: String,
    pub sqlite_path: PathBuf,
    pub upstream_url: Option<String>,
    pub config_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let file = match &options.config_path {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };

        let master_key = decode_master_key(&require_env(MASTER_KEY_ENV)?)?;
        let pepper = decode_pepper(&require_env(PEPPER_ENV)?)?;
        let admin_token = std::env::var(ADMIN_TOKEN_ENV)
            .ok()
            .filter(|token| !token.is_empty());

        let listen: SocketAddr = options
            .listen
            .parse()
            .map_err(|_| ConfigError::BadListenAddr(options.listen.clone()))?;

        let (allowed_models, pricing) = if file.models.is_empty() {
            let pricing = PricingTable::builtin();
            let models = vec![
                "gpt-4o".to_string(),
                "gpt-4o-mini".to_string(),
                "gpt-4.1".to_string(),
                "o3-mini".to_string(),
            ];
            (models, pricing)
        } else {
            let mut pricing = PricingTable::default();
            let mut models = Vec::with_capacity(file.models.len());
            for model in &file.models {
                pricing.insert(
                    model.name.clone(),
                    PriceSnapshot::from_usd_per_mtok(
                        &model.name,
                        model.prompt_usd_per_mtok,
                        model.completion_usd_per_mtok,
                    )?,
                );
                models.push(model.name.clone());
            }
            (models, pricing)
        };

        let thresholds = validate_thresholds(
            file.budget_thresholds
                .unwrap_or_else(|| DEFAULT_THRESHOLD_LADDER.to_vec()),
        )?;

        Ok(Self {
            listen,
            sqlite_path: options.sqlite_path,
            upstream_url: options
                .upstream_url
                .or(file.upstream_url)
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            upstream_timeout: Duration::from_secs(
                file.upstream_timeout_secs
                    .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS)
                    .max(1),
            ),
            master_key,
            pepper,
            admin_token,
            allowed_models,
            pricing,
            rate_limit: file.rate_limit.unwrap_or_default(),
            thresholds,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingEnv(name))
}

/// 256-bit AEAD master key, hex-encoded.
pub fn decode_master_key(raw: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(raw.trim()).map_err(|_| ConfigError::BadKeyEncoding {
        name: MASTER_KEY_ENV,
    })?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::BadKeyLength {
            name: MASTER_KEY_ENV,
            expected: 64,
        })
}

/// Fingerprint pepper: hex-encoded, at least 32 bytes after decoding.
pub fn decode_pepper(raw: &str) -> Result<Vec<u8>, ConfigError> {
    let bytes =
        hex::decode(raw.trim()).map_err(|_| ConfigError::BadKeyEncoding { name: PEPPER_ENV })?;
    if bytes.len() < 32 {
        return Err(ConfigError::KeyTooShort {
            name: PEPPER_ENV,
            minimum: 64,
        });
    }
    Ok(bytes)
}

/// Sorted descending, deduplicated, each threshold within 1..=100.
pub fn validate_thresholds(mut thresholds: Vec<u32>) -> Result<Vec<u32>, ConfigError> {
    for threshold in &thresholds {
        if *threshold == 0 || *threshold > 100 {
            return Err(ConfigError::BadThreshold(*threshold));
        }
    }
    thresholds.sort_unstable_by(|a, b| b.cmp(a));
    thresholds.dedup();
    Ok(thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_must_be_32_hex_bytes() {
        assert!(decode_master_key(&"ab".repeat(32)).is_ok());
        assert!(matches!(
            decode_master_key("abcd"),
            Err(ConfigError::BadKeyLength { .. })
        ));
        assert!(matches!(
            decode_master_key("not-hex"),
            Err(ConfigError::BadKeyEncoding { .. })
        ));
    }

    #[test]
    fn pepper_must_be_at_least_32_bytes() {
        assert!(decode_pepper(&"cd".repeat(32)).is_ok());
        assert!(matches!(
            decode_pepper(&"cd".repeat(16)),
            Err(ConfigError::KeyTooShort { .. })
        ));
    }

    #[test]
    fn thresholds_are_validated_and_sorted_descending() {
        assert_eq!(
            validate_thresholds(vec![50, 100, 75, 90, 75]).unwrap(),
            vec![100, 90, 75, 50]
        );
        assert!(matches!(
            validate_thresholds(vec![0]),
            Err(ConfigError::BadThreshold(0))
        ));
        assert!(matches!(
            validate_thresholds(vec![101]),
            Err(ConfigError::BadThreshold(101))
        ));
    }

    #[test]
    fn file_config_parses_models_and_limits() {
        let raw = r#"
            upstream_url = "https://llm.internal"
            upstream_timeout_secs = 30

            [rate_limit]
            max_requests = 10
            window_secs = 60

            budget_thresholds = [100, 90, 75, 50]

            [[models]]
            name = "gpt-4o"
            prompt_usd_per_mtok = 2.5
            completion_usd_per_mtok = 10.0
        "#;
        let parsed: FileConfig = toml::from_str(raw).unwrap();
        assert_eq!(parsed.upstream_url.as_deref(), Some("https://llm.internal"));
        assert_eq!(parsed.models.len(), 1);
        assert_eq!(parsed.rate_limit.unwrap().max_requests, 10);
    }
}
