use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::catalog::DEFAULT_API_BASE;
use crate::error::AbiError;
use crate::registration::{DEFAULT_ATLAS_DIR, RegistrationConfig};

const DEFAULT_CONFIG_FILE: &str = "abi-connect.json";
const DEFAULT_DATA_ROOT: &str = "abi-data";
const DEFAULT_PAGE_SIZE: u64 = 50;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BACKOFF_SECS: u64 = 10;

/// On-disk configuration file. Every field is optional; absent fields fall
/// back to the defaults `ResolvedConfig` documents.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_secs: Option<u64>,
    #[serde(default)]
    pub atlas_dir: Option<String>,
    #[serde(default)]
    pub registration_transform: Option<String>,
    #[serde(default)]
    pub registration_interpolation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_root: Utf8PathBuf,
    pub api_base_url: String,
    pub page_size: u64,
    pub max_retries: u32,
    pub backoff_secs: u64,
    pub registration: RegistrationConfig,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from `path`, or from `abi-connect.json` in the
    /// working directory when no path is given. A missing default file is
    /// fine; a missing explicit file is an error.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AbiError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AbiError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AbiError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AbiError> {
        let page_size = config.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(AbiError::ConfigParse(
                "page_size must be greater than zero".to_string(),
            ));
        }

        let atlas_dir = Utf8PathBuf::from(
            config
                .atlas_dir
                .unwrap_or_else(|| DEFAULT_ATLAS_DIR.to_string()),
        );
        let mut registration = RegistrationConfig::with_atlas_dir(&atlas_dir);
        if let Some(transform) = config.registration_transform {
            registration.transform = Utf8PathBuf::from(transform);
        }
        if let Some(interpolation) = config.registration_interpolation {
            registration.interpolation = interpolation;
        }

        Ok(ResolvedConfig {
            data_root: Utf8PathBuf::from(
                config
                    .data_root
                    .unwrap_or_else(|| DEFAULT_DATA_ROOT.to_string()),
            ),
            api_base_url: config
                .api_base_url
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            page_size,
            max_retries: config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            backoff_secs: config.backoff_secs.unwrap_or(DEFAULT_BACKOFF_SECS),
            registration,
        })
    }
}
