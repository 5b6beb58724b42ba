//! Content-addressed compile cache in front of a [`PhotonLoader`].
//!
//! Artifacts live at `<cache_dir>/<photon>/<sha256>.json`. The same source bytes
//! always map to the same artifact, so a changed file can never pick up a stale
//! artifact and reverting a file reuses the earlier one.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{PhotonLoader, PhotonModule};
use crate::error::{DaemonError, Result};

pub struct PhotonCompiler {
    loader: Arc<dyn PhotonLoader>,
    cache_dir: PathBuf,
    compilations: AtomicUsize,
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Resolve symlinks and read the source: `(real path, bytes)`
pub async fn read_source(name: &str, source_path: &Path) -> Result<(PathBuf, Vec<u8>)> {
    let real_path = fs::canonicalize(source_path).await.map_err(|e| {
        DaemonError::load(name, format!("cannot resolve {}: {}", source_path.display(), e))
    })?;
    let source = fs::read(&real_path).await.map_err(|e| {
        DaemonError::load(name, format!("cannot read {}: {}", real_path.display(), e))
    })?;
    Ok((real_path, source))
}

impl PhotonCompiler {
    pub fn new(loader: Arc<dyn PhotonLoader>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            cache_dir: cache_dir.into(),
            compilations: AtomicUsize::new(0),
        }
    }

    pub fn artifact_path(&self, name: &str, hash: &str) -> PathBuf {
        self.cache_dir.join(name).join(format!("{hash}.json"))
    }

    /// How many times the loader actually compiled source (cache misses)
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Read `source_path` and produce a module, compiling only on a cache miss
    pub async fn load(&self, name: &str, source_path: &Path) -> Result<PhotonModule> {
        let (real_path, source) = read_source(name, source_path).await?;
        self.load_source(name, real_path, &source).await
    }

    pub async fn load_source(
        &self,
        name: &str,
        real_path: PathBuf,
        source: &[u8],
    ) -> Result<PhotonModule> {
        let hash = content_hash(source);
        let artifact_path = self.artifact_path(name, &hash);

        let artifact = match self.read_artifact(&artifact_path).await {
            Some(artifact) => {
                debug!("♻️  Reusing compiled artifact for '{}' ({})", name, &hash[..12]);
                artifact
            }
            None => {
                let text = std::str::from_utf8(source)
                    .map_err(|e| DaemonError::load(name, format!("source is not UTF-8: {e}")))?;
                let artifact = self
                    .loader
                    .compile(name, text)
                    .map_err(|e| DaemonError::load(name, e))?;
                self.compilations.fetch_add(1, Ordering::Relaxed);
                self.write_artifact(&artifact_path, &artifact).await?;
                info!("🔨 Compiled photon '{}' ({})", name, &hash[..12]);
                artifact
            }
        };

        let class = self
            .loader
            .instantiate(name, &artifact)
            .map_err(|e| DaemonError::load(name, e))?;

        Ok(PhotonModule::new(name, real_path, hash, artifact_path, class))
    }

    async fn read_artifact(&self, path: &Path) -> Option<Value> {
        let bytes = fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!("⚠️  Ignoring corrupt artifact {:?}: {}", path, e);
                None
            }
        }
    }

    async fn write_artifact(&self, path: &Path, artifact: &Value) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a concurrent reader never sees a partial artifact
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec(artifact)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}
