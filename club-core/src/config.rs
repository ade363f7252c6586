use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::app_dir::AppDir;
use crate::blob_store::{BlobStoreError, S3BlobStore, S3Config};
use crate::document_store::{SqliteDocumentStore, StoreError};

pub const DEFAULT_IDENTITY_URL: &str = "http://localhost:3000";
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Document store error: {0}")]
    Store(#[from] StoreError),
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobStoreError),
}

/// YAML config file structure for non-secret settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigYaml {
    /// Base URL of the identity-verification server
    pub identity_url: Option<String>,
    /// Bucket holding photos, headers and logos
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    /// Custom S3 endpoint (MinIO etc.)
    pub s3_endpoint: Option<String>,
    /// Base for public photo URLs, when served through a CDN
    pub s3_public_base_url: Option<String>,
    /// Where gallery downloads are saved
    pub download_dir: Option<PathBuf>,
}

/// Application configuration
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub app_dir: AppDir,
    pub identity_url: String,
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_public_base_url: Option<String>,
    pub download_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let dev_mode = std::env::var("CLUB_DEV_MODE").is_ok() || dotenvy::dotenv().is_ok();
        if dev_mode {
            info!("Dev mode activated - loading from .env");
            Ok(Self::from_env())
        } else {
            info!("Production mode - loading from config.yaml");
            Self::from_config_file()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from `CLUB_*` variables as returned by `lookup`. Empty values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let app_dir = var("CLUB_APP_DIR")
            .map(AppDir::new)
            .unwrap_or_else(AppDir::platform_default);

        Self {
            app_dir,
            identity_url: var("CLUB_IDENTITY_URL")
                .unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string()),
            s3_bucket: var("CLUB_S3_BUCKET"),
            s3_region: var("CLUB_S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            s3_endpoint: var("CLUB_S3_ENDPOINT"),
            s3_public_base_url: var("CLUB_S3_PUBLIC_URL"),
            download_dir: var("CLUB_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(crate::download::default_download_dir),
        }
    }

    pub fn from_config_file() -> Result<Self, ConfigError> {
        Self::load_from_app_dir(AppDir::platform_default())
    }

    /// Read `config.yaml` from `app_dir`. A missing file means defaults.
    pub fn load_from_app_dir(app_dir: AppDir) -> Result<Self, ConfigError> {
        let config_path = app_dir.config_path();
        let yaml = match std::fs::read_to_string(&config_path) {
            Ok(content) => Self::parse_yaml(&content, &config_path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", config_path.display());
                ConfigYaml::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            app_dir,
            identity_url: yaml
                .identity_url
                .unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string()),
            s3_bucket: yaml.s3_bucket,
            s3_region: yaml
                .s3_region
                .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            s3_endpoint: yaml.s3_endpoint,
            s3_public_base_url: yaml.s3_public_base_url,
            download_dir: yaml
                .download_dir
                .unwrap_or_else(crate::download::default_download_dir),
        })
    }

    fn parse_yaml(content: &str, path: &Path) -> Result<ConfigYaml, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| {
            ConfigError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn save_to_config_yaml(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&*self.app_dir)?;
        let yaml = ConfigYaml {
            identity_url: Some(self.identity_url.clone()),
            s3_bucket: self.s3_bucket.clone(),
            s3_region: Some(self.s3_region.clone()),
            s3_endpoint: self.s3_endpoint.clone(),
            s3_public_base_url: self.s3_public_base_url.clone(),
            download_dir: Some(self.download_dir.clone()),
        };
        let content =
            serde_yaml::to_string(&yaml).map_err(|e| ConfigError::Serialization(e.to_string()))?;
        std::fs::write(self.app_dir.config_path(), content)?;
        Ok(())
    }

    /// S3 settings with credentials from `CLUB_S3_ACCESS_KEY` and
    /// `CLUB_S3_SECRET_KEY`. Credentials are never read from config.yaml.
    pub fn s3_config(&self) -> Result<S3Config, ConfigError> {
        self.s3_config_with(|key| std::env::var(key).ok())
    }

    pub fn s3_config_with(
        &self,
        secrets: impl Fn(&str) -> Option<String>,
    ) -> Result<S3Config, ConfigError> {
        let bucket_name = self
            .s3_bucket
            .clone()
            .ok_or_else(|| ConfigError::Config("No S3 bucket configured".to_string()))?;
        let secret = |key: &str| {
            secrets(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::Config(format!("{key} is not set")))
        };

        let config = S3Config {
            bucket_name,
            region: self.s3_region.clone(),
            access_key_id: secret("CLUB_S3_ACCESS_KEY")?,
            secret_access_key: secret("CLUB_S3_SECRET_KEY")?,
            endpoint_url: self.s3_endpoint.clone(),
            public_base_url: self.s3_public_base_url.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn open_document_store(&self) -> Result<SqliteDocumentStore, ConfigError> {
        std::fs::create_dir_all(&*self.app_dir)?;
        Ok(SqliteDocumentStore::open(&self.app_dir.db_path()).await?)
    }

    pub async fn open_blob_store(&self) -> Result<S3BlobStore, ConfigError> {
        Ok(S3BlobStore::new(self.s3_config()?).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn from_lookup_uses_defaults() {
        let config = Config::from_lookup(lookup(&[("CLUB_APP_DIR", "/tmp/club")]));
        assert_eq!(config.app_dir, AppDir::new("/tmp/club"));
        assert_eq!(config.identity_url, DEFAULT_IDENTITY_URL);
        assert_eq!(config.s3_region, DEFAULT_S3_REGION);
        assert_eq!(config.s3_bucket, None);
    }

    #[test]
    fn from_lookup_reads_values_and_ignores_empty() {
        let config = Config::from_lookup(lookup(&[
            ("CLUB_APP_DIR", "/tmp/club"),
            ("CLUB_IDENTITY_URL", "https://id.club.test"),
            ("CLUB_S3_BUCKET", "club-photos"),
            ("CLUB_S3_ENDPOINT", ""),
            ("CLUB_DOWNLOAD_DIR", "/tmp/dl"),
        ]));
        assert_eq!(config.identity_url, "https://id.club.test");
        assert_eq!(config.s3_bucket.as_deref(), Some("club-photos"));
        assert_eq!(config.s3_endpoint, None);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/dl"));
    }

    #[test]
    fn config_yaml_fields_are_optional() {
        let config: ConfigYaml = serde_yaml::from_str("s3_bucket: photos\n").unwrap();
        assert_eq!(config.s3_bucket.as_deref(), Some("photos"));
        assert!(config.identity_url.is_none());
    }

    #[test]
    fn missing_config_yaml_means_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_from_app_dir(AppDir::new(tmp.path())).unwrap();
        assert_eq!(config.identity_url, DEFAULT_IDENTITY_URL);
    }

    #[test]
    fn save_and_load_config_yaml_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::from_lookup(lookup(&[("CLUB_DOWNLOAD_DIR", "/tmp/dl")]));
        config.app_dir = AppDir::new(tmp.path().join("club"));
        config.s3_bucket = Some("club-photos".into());
        config.s3_public_base_url = Some("https://cdn.club.test".into());

        config.save_to_config_yaml().unwrap();
        let loaded = Config::load_from_app_dir(config.app_dir.clone()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn malformed_config_yaml_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("config.yaml"), "s3_bucket: [unclosed\n").unwrap();
        let err = Config::load_from_app_dir(AppDir::new(tmp.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Serialization(msg) if msg.contains("Failed to parse")));
    }

    #[test]
    fn s3_config_needs_bucket_and_env_credentials() {
        let mut config = Config::from_lookup(lookup(&[]));
        assert!(matches!(
            config.s3_config_with(lookup(&[])),
            Err(ConfigError::Config(_))
        ));

        config.s3_bucket = Some("club-photos".into());
        assert!(matches!(
            config.s3_config_with(lookup(&[("CLUB_S3_ACCESS_KEY", "AKIA")])),
            Err(ConfigError::Config(msg)) if msg.contains("CLUB_S3_SECRET_KEY")
        ));

        let s3 = config
            .s3_config_with(lookup(&[
                ("CLUB_S3_ACCESS_KEY", "AKIA"),
                ("CLUB_S3_SECRET_KEY", "secret"),
            ]))
            .unwrap();
        assert_eq!(s3.bucket_name, "club-photos");
        assert_eq!(s3.region, DEFAULT_S3_REGION);
        assert_eq!(s3.access_key_id, "AKIA");
    }
}
