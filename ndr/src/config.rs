//! Configuration of a repository.

use std::{env, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result};
use ndr_base::Name;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, DurationMilliSeconds};

use crate::{
    cache::DEFAULT_FLUSH_INTERVAL,
    fetch::{FetchOptions, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY},
    storage::StorageConfig,
    transport::DEFAULT_LIFETIME,
};

/// Environment variable overriding [`RepoConfig::repo_name`].
pub const ENV_REPO_NAME: &str = "NDR_REPO_NAME";

/// Default name of the repository.
pub const DEFAULT_REPO_NAME: &str = "/ndr/repo";

/// The configuration of a repository.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepoConfig {
    /// Name the repository receives commands under.
    #[serde_as(as = "DisplayFromStr")]
    pub repo_name: Name,
    /// Serve reads for the whole namespace instead of per inserted object.
    pub register_root: bool,
    /// Durable storage.
    pub storage: StorageConfig,
    /// Interval between cache flushes.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub flush_interval: Duration,
    /// How long insert and sync records stay queryable after they finished.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub insert_record_grace: Duration,
    /// How long delete records stay queryable after they finished.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub delete_record_grace: Duration,
    /// Window in which a repeated sync advertisement is ignored and not retransmitted.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sync_dedupe_window: Duration,
    /// Segment retrieval.
    pub fetch: FetchConfig,
    /// Address to accept bulk ingestion connections on.
    pub bulk_insert_addr: Option<SocketAddr>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            repo_name: default_repo_name(),
            register_root: false,
            storage: StorageConfig::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            insert_record_grace: Duration::from_secs(10),
            delete_record_grace: Duration::from_secs(60),
            sync_dedupe_window: Duration::from_secs(2),
            fetch: FetchConfig::default(),
            bulk_insert_addr: None,
        }
    }
}

fn default_repo_name() -> Name {
    Name::from_components(
        ["ndr", "repo"]
            .into_iter()
            .map(ndr_base::Component::generic),
    )
}

impl RepoConfig {
    /// Reads the configuration from `file`, or uses the defaults when `file` is `None`.
    ///
    /// [`ENV_REPO_NAME`] overrides the repository name.
    pub async fn load(file: Option<&Path>) -> Result<RepoConfig> {
        let mut config = match file {
            Some(file) => {
                let config = tokio::fs::read_to_string(file)
                    .await
                    .with_context(|| format!("failed to read {}", file.display()))?;
                Self::load_toml(&config)?
            }
            None => Self::default(),
        };

        // override from env var
        if let Ok(name) = env::var(ENV_REPO_NAME) {
            config.repo_name = name
                .parse()
                .with_context(|| format!("invalid {ENV_REPO_NAME}"))?;
        }
        Ok(config)
    }

    /// Parses a toml configuration.
    pub fn load_toml(s: &str) -> Result<RepoConfig> {
        let config = toml::from_str(s)?;
        Ok(config)
    }
}

/// Segment retrieval settings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Maximum outstanding requests per fetch.
    pub concurrency: usize,
    /// Retries per segment, zero retries forever.
    pub max_retries: u32,
    /// Lifetime of each request.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lifetime: Duration,
    /// Pause before retrying after a negative acknowledgement.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            lifetime: DEFAULT_LIFETIME,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl FetchConfig {
    /// Fetch options for `start..=end` with these settings.
    pub fn options(&self, start: u64, end: Option<u64>) -> FetchOptions {
        FetchOptions {
            start,
            end,
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            lifetime: self.lifetime,
            retry_delay: self.retry_delay,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn default_config() {
        let config = RepoConfig::load_toml("").unwrap();
        assert_eq!(config, RepoConfig::default());
        assert_eq!(config.repo_name.to_string(), DEFAULT_REPO_NAME);
    }

    #[test]
    fn full_config() -> Result<()> {
        let config = RepoConfig::load_toml(
            r#"
            repo_name = "/example/repo"
            register_root = true
            flush_interval = 500
            sync_dedupe_window = 1000
            bulk_insert_addr = "127.0.0.1:7376"

            [storage]
            kind = "redb"
            path = "/var/lib/ndr/objects.redb"

            [fetch]
            concurrency = 4
            max_retries = 0
            "#,
        )?;
        assert_eq!(config.repo_name, "/example/repo".parse()?);
        assert!(config.register_root);
        assert_eq!(config.flush_interval, Duration::from_millis(500));
        assert_eq!(config.sync_dedupe_window, Duration::from_secs(1));
        assert_eq!(config.delete_record_grace, Duration::from_secs(60));
        assert_eq!(
            config.storage,
            StorageConfig::Redb {
                path: PathBuf::from("/var/lib/ndr/objects.redb")
            }
        );
        assert_eq!(config.fetch.concurrency, 4);
        assert_eq!(config.fetch.max_retries, 0);
        assert_eq!(config.fetch.lifetime, DEFAULT_LIFETIME);
        assert_eq!(config.bulk_insert_addr, Some("127.0.0.1:7376".parse()?));
        Ok(())
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(RepoConfig::load_toml("repo = \"/x\"").is_err());
    }

    #[tokio::test]
    async fn load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ndr.toml");
        tokio::fs::write(&path, "repo_name = \"/from/file\"\n").await?;
        let config = RepoConfig::load(Some(&path)).await?;
        if env::var(ENV_REPO_NAME).is_err() {
            assert_eq!(config.repo_name, "/from/file".parse()?);
        }
        assert!(RepoConfig::load(Some(&dir.path().join("missing.toml")))
            .await
            .is_err());
        Ok(())
    }
}
