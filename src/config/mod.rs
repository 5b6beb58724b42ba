use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Environment variable overriding the state root
pub const STATE_DIR_ENV: &str = "PHOTON_DIR";

/// Extension that marks a file as a photon source
pub const PHOTON_EXTENSION: &str = ".photon.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root for instance state, the compile cache and the socket
    pub state_dir: PathBuf,

    /// Directory scanned for photon sources; defaults to `state_dir`
    pub photon_dir: Option<PathBuf>,

    /// Socket path; defaults to `<state_dir>/daemon.sock`
    pub socket_path: Option<PathBuf>,

    /// Number of events retained per channel for replay
    pub channel_buffer_size: usize,

    /// Quiet period before a burst of edits triggers a reload
    pub debounce_ms: u64,

    /// Lock acquisition timeout when neither request nor method names one
    pub lock_timeout_ms: u64,

    pub scheduler_tick_secs: u64,

    /// Watch every photon under `photon_dir` at startup, not only loaded ones
    pub proactive_watch: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            photon_dir: None,
            socket_path: None,
            channel_buffer_size: 30,
            debounce_ms: 100,
            lock_timeout_ms: 30_000,
            scheduler_tick_secs: 30,
            proactive_watch: true,
        }
    }
}

fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return PathBuf::from(shellexpand::tilde(&dir).as_ref());
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".photon")
}

impl DaemonConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `<state_dir>/daemon.toml` is
    /// used when present and defaults otherwise.
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let expanded = shellexpand::tilde(path);
                info!("📄 Reading config from: {}", expanded);
                Self::from_file(Path::new(expanded.as_ref())).await?
            }
            None => {
                let candidate = default_state_dir().join("daemon.toml");
                if fs::try_exists(&candidate).await.unwrap_or(false) {
                    info!("📄 Reading config from: {}", candidate.display());
                    Self::from_file(&candidate).await?
                } else {
                    debug!("📋 No config file found, using defaults");
                    Self::default()
                }
            }
        };

        // The environment always wins over the file
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            config.state_dir = PathBuf::from(shellexpand::tilde(&dir).as_ref());
        }
        config.state_dir = PathBuf::from(
            shellexpand::tilde(&config.state_dir.to_string_lossy()).as_ref(),
        );

        debug!(
            "📋 Config loaded: state_dir={}, buffer={}, debounce={}ms",
            config.state_dir.display(),
            config.channel_buffer_size,
            config.debounce_ms
        );
        Ok(config)
    }

    async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    /// Config rooted at `state_dir` with every other setting defaulted
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    pub fn photon_dir(&self) -> PathBuf {
        self.photon_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.clone())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("daemon.sock"))
    }

    pub fn instance_state_dir(&self) -> PathBuf {
        self.state_dir.join("state")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join(".cache")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DaemonConfig::from_toml_str(
            r#"
state_dir = "/tmp/photon-test"
channel_buffer_size = 10
"#,
        )
        .unwrap();

        assert_eq!(config.state_dir, PathBuf::from("/tmp/photon-test"));
        assert_eq!(config.channel_buffer_size, 10);
        assert_eq!(config.debounce_ms, 100);
        assert!(config.proactive_watch);
    }

    #[test]
    fn test_derived_paths() {
        let config = DaemonConfig::with_state_dir("/srv/photon");
        assert_eq!(config.socket_path(), PathBuf::from("/srv/photon/daemon.sock"));
        assert_eq!(config.photon_dir(), PathBuf::from("/srv/photon"));
        assert_eq!(config.instance_state_dir(), PathBuf::from("/srv/photon/state"));
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/photon/.cache"));
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(DaemonConfig::from_toml_str("channel_buffer_size = \"many\"").is_err());
    }

    #[tokio::test]
    async fn test_missing_explicit_config_is_an_error() {
        let result = DaemonConfig::load(Some("/definitely/not/here/daemon.toml")).await;
        assert!(result.is_err());
    }
}
