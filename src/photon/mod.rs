use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

pub mod compiler;
pub mod manifest;

pub use compiler::PhotonCompiler;
pub use manifest::ManifestLoader;

/// Serializable state of one live photon object, keyed by declared field name
pub type PhotonState = Map<String, Value>;

/// Lock requirement attached to a method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Capability record consulted before a method is invoked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<LockSpec>,
    /// Cron expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<String>,
    #[serde(default)]
    pub webhook: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            capabilities: Capabilities::default(),
        }
    }

    pub fn locked(mut self, lock_name: impl Into<String>, timeout_ms: Option<u64>) -> Self {
        self.capabilities.locked = Some(LockSpec {
            name: lock_name.into(),
            timeout_ms,
        });
        self
    }

    pub fn scheduled(mut self, cron: impl Into<String>) -> Self {
        self.capabilities.scheduled = Some(cron.into());
        self
    }

    pub fn webhook(mut self) -> Self {
        self.capabilities.webhook = true;
        self
    }
}

/// A live photon object
#[async_trait]
pub trait PhotonObject: Send + Sync {
    /// Invoke a method. Errors surface to the caller as invocation errors.
    async fn call(&mut self, method: &str, args: Value) -> Result<Value>;

    /// Current values of every declared state key
    fn snapshot(&self) -> PhotonState;

    /// Shallow copy of `state` into this object. Callers filter it to the
    /// class's `state_keys` first (see [`migrate_state`]).
    fn restore(&mut self, state: &PhotonState);
}

/// Executable form of a compiled photon
pub trait PhotonClass: Send + Sync {
    fn descriptors(&self) -> Vec<MethodDescriptor>;

    fn state_keys(&self) -> Vec<String>;

    fn construct(&self) -> Box<dyn PhotonObject>;
}

/// The external module loader: turns source text into something the daemon can run.
///
/// Compilation produces a serializable artifact so the compiler can cache it by
/// content hash and rebuild classes without recompiling.
pub trait PhotonLoader: Send + Sync {
    fn compile(&self, name: &str, source: &str) -> Result<Value>;

    fn instantiate(&self, name: &str, artifact: &Value) -> Result<Arc<dyn PhotonClass>>;
}

/// Compiled representation of one photon's source. Replaced, never mutated.
pub struct PhotonModule {
    pub name: String,
    /// Source path with symlinks resolved
    pub source_path: PathBuf,
    pub content_hash: String,
    pub artifact_path: PathBuf,
    pub descriptors: Vec<MethodDescriptor>,
    class: Arc<dyn PhotonClass>,
}

impl PhotonModule {
    pub fn new(
        name: impl Into<String>,
        source_path: PathBuf,
        content_hash: String,
        artifact_path: PathBuf,
        class: Arc<dyn PhotonClass>,
    ) -> Self {
        Self {
            name: name.into(),
            source_path,
            content_hash,
            artifact_path,
            descriptors: class.descriptors(),
            class,
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn construct(&self) -> Box<dyn PhotonObject> {
        self.class.construct()
    }

    pub fn state_keys(&self) -> Vec<String> {
        self.class.state_keys()
    }

    pub fn scheduled_methods(&self) -> impl Iterator<Item = (&MethodDescriptor, &str)> {
        self.descriptors
            .iter()
            .filter_map(|d| d.capabilities.scheduled.as_deref().map(|cron| (d, cron)))
    }
}

impl std::fmt::Debug for PhotonModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotonModule")
            .field("name", &self.name)
            .field("source_path", &self.source_path)
            .field("content_hash", &self.content_hash)
            .field("methods", &self.descriptors.len())
            .finish()
    }
}

/// Keep only the declared keys of `state`
pub fn migrate_state(state: &PhotonState, declared: &[String]) -> PhotonState {
    state
        .iter()
        .filter(|(key, _)| declared.iter().any(|d| d == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_migrate_state_drops_undeclared_keys() {
        let mut state = PhotonState::new();
        state.insert("items".to_string(), json!(["a"]));
        state.insert("renamed".to_string(), json!(3));

        let migrated = migrate_state(&state, &["items".to_string(), "added".to_string()]);
        assert_eq!(migrated.len(), 1);
        assert_eq!(migrated["items"], json!(["a"]));
    }

    #[test]
    fn test_descriptor_builder() {
        let d = MethodDescriptor::new("sync")
            .locked("sync", Some(500))
            .scheduled("*/5 * * * *")
            .webhook();
        assert_eq!(d.capabilities.locked.as_ref().map(|l| l.name.as_str()), Some("sync"));
        assert_eq!(d.capabilities.scheduled.as_deref(), Some("*/5 * * * *"));
        assert!(d.capabilities.webhook);
    }
}
