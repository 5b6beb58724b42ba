use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::PHOTON_EXTENSION;
use crate::error::{DaemonError, Result};
use crate::photon::compiler::{content_hash, read_source};
use crate::photon::{migrate_state, PhotonCompiler, PhotonModule, PhotonObject, PhotonState};

/// Name under which the empty ("default") instance is stored and reported
pub const DEFAULT_INSTANCE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub photon: String,
    pub instance: String,
}

/// A live object for one (photon, instance) pair
pub struct PhotonInstance {
    pub photon: String,
    pub name: String,
    object: Box<dyn PhotonObject>,
    module: Arc<PhotonModule>,
    dirty: bool,
    last_accessed: Instant,
    state_path: PathBuf,
}

impl PhotonInstance {
    pub fn snapshot(&self) -> PhotonState {
        self.object.snapshot()
    }

    pub fn module(&self) -> &Arc<PhotonModule> {
        &self.module
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }
}

/// Shared handle; locking it serializes every call on the instance in arrival order
pub type InstanceHandle = Arc<Mutex<PhotonInstance>>;

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub data: Value,
    /// Whether the call changed (and therefore persisted) state
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftCorrection {
    pub photon: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub enum ReloadOutcome {
    /// Content hash unchanged
    Unchanged,
    Reloaded {
        module: Arc<PhotonModule>,
        migrated: usize,
    },
    /// The photon was not loaded yet; its artifact was compiled ahead of first use
    Precompiled,
}

impl ReloadOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReloadOutcome::Unchanged => "unchanged",
            ReloadOutcome::Reloaded { .. } => "reloaded",
            ReloadOutcome::Precompiled => "precompiled",
        }
    }
}

/// Sole owner of loaded modules and live instances
pub struct InstanceRegistry {
    compiler: PhotonCompiler,
    state_dir: PathBuf,
    photon_dir: PathBuf,
    modules: RwLock<HashMap<String, Arc<PhotonModule>>>,
    /// Path each photon was loaded from, before symlink resolution
    source_paths: RwLock<HashMap<String, PathBuf>>,
    instances: RwLock<HashMap<InstanceKey, InstanceHandle>>,
    /// The daemon's notion of the current instance per photon
    defaults: RwLock<HashMap<String, String>>,
    drift_corrections: AtomicU64,
    /// Serializes module loads and swaps so a photon compiles once
    load_gate: Mutex<()>,
}

fn validate_photon_name(photon: &str) -> Result<()> {
    if photon.is_empty()
        || photon.starts_with('.')
        || photon.contains(|c: char| matches!(c, '/' | '\\'))
    {
        return Err(DaemonError::protocol(format!("Invalid photon name '{photon}'")));
    }
    Ok(())
}

/// Map "default" and surrounding whitespace onto the canonical empty name
pub fn normalize_instance(name: &str) -> Result<String> {
    let name = name.trim();
    if name == DEFAULT_INSTANCE {
        return Ok(String::new());
    }
    if name.starts_with('.') || name.contains(|c: char| matches!(c, '/' | '\\')) {
        return Err(DaemonError::protocol(format!("Invalid instance name '{name}'")));
    }
    Ok(name.to_string())
}

pub fn display_instance(name: &str) -> &str {
    if name.is_empty() {
        DEFAULT_INSTANCE
    } else {
        name
    }
}

impl InstanceRegistry {
    pub fn new(compiler: PhotonCompiler, state_dir: impl Into<PathBuf>, photon_dir: impl Into<PathBuf>) -> Self {
        Self {
            compiler,
            state_dir: state_dir.into(),
            photon_dir: photon_dir.into(),
            modules: RwLock::new(HashMap::new()),
            source_paths: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
            drift_corrections: AtomicU64::new(0),
            load_gate: Mutex::new(()),
        }
    }

    pub fn compiler(&self) -> &PhotonCompiler {
        &self.compiler
    }

    pub fn default_source_path(&self, photon: &str) -> PathBuf {
        self.photon_dir.join(format!("{photon}{PHOTON_EXTENSION}"))
    }

    pub fn state_path(&self, photon: &str, instance: &str) -> PathBuf {
        self.state_dir
            .join(photon)
            .join(format!("{}.json", display_instance(instance)))
    }

    pub async fn module(&self, photon: &str) -> Option<Arc<PhotonModule>> {
        self.modules.read().await.get(photon).cloned()
    }

    pub async fn source_path(&self, photon: &str) -> Option<PathBuf> {
        self.source_paths.read().await.get(photon).cloned()
    }

    /// Loaded module for `photon`, compiling it on first reference.
    ///
    /// The flag is true when this call performed the load, so the caller can
    /// start watching the source and register scheduled methods.
    pub async fn load_module(
        &self,
        photon: &str,
        path: Option<&Path>,
    ) -> Result<(Arc<PhotonModule>, bool)> {
        validate_photon_name(photon)?;
        if let Some(module) = self.module(photon).await {
            return Ok((module, false));
        }

        let _gate = self.load_gate.lock().await;
        if let Some(module) = self.module(photon).await {
            return Ok((module, false));
        }

        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self.default_source_path(photon),
        };
        let module = Arc::new(self.compiler.load(photon, &path).await?);
        info!(
            "📦 Loaded photon '{}' from {:?} ({} methods)",
            photon,
            module.source_path,
            module.descriptors.len()
        );

        self.source_paths.write().await.insert(photon.to_string(), path);
        self.modules
            .write()
            .await
            .insert(photon.to_string(), Arc::clone(&module));
        Ok((module, true))
    }

    /// Cached instance, or a new one hydrated from its state file
    pub async fn resolve(&self, photon: &str, instance: &str) -> Result<InstanceHandle> {
        let instance = normalize_instance(instance)?;
        let key = InstanceKey {
            photon: photon.to_string(),
            instance: instance.clone(),
        };
        if let Some(handle) = self.instances.read().await.get(&key) {
            return Ok(Arc::clone(handle));
        }

        let (module, _) = self.load_module(photon, None).await?;
        let state_path = self.state_path(photon, &instance);
        let mut object = module.construct();
        if let Some(state) = read_state(&state_path).await {
            debug!("💾 Hydrating {}/{} from {:?}", photon, display_instance(&instance), state_path);
            object.restore(&migrate_state(&state, &module.state_keys()));
        }

        let created = Arc::new(Mutex::new(PhotonInstance {
            photon: photon.to_string(),
            name: instance,
            object,
            module,
            dirty: false,
            last_accessed: Instant::now(),
            state_path,
        }));

        // Another caller may have won the race; keep exactly one instance per key
        let mut instances = self.instances.write().await;
        let handle = instances.entry(key).or_insert(created);
        Ok(Arc::clone(handle))
    }

    /// Call `method` on the instance. State is persisted before returning
    /// whenever the call changed it, including calls that fail midway.
    pub async fn invoke(
        &self,
        photon: &str,
        instance: &str,
        method: &str,
        args: Value,
    ) -> Result<InvokeOutcome> {
        let handle = self.resolve(photon, instance).await?;
        let mut inst = handle.lock().await;
        inst.last_accessed = Instant::now();
        // Created from the old module while a reload was collecting instances
        if let Some(latest) = self.module(photon).await {
            if !Arc::ptr_eq(&inst.module, &latest) {
                migrate_instance(&mut inst, &latest);
            }
        }

        let before = inst.object.snapshot();
        let result = inst.object.call(method, args).await;
        if inst.object.snapshot() != before {
            inst.dirty = true;
        }

        let changed = inst.dirty;
        if inst.dirty {
            persist(&inst).await?;
            inst.dirty = false;
        }

        let data = result.map_err(|e| DaemonError::invocation(method, e))?;
        Ok(InvokeOutcome { data, changed })
    }

    /// Make `instance` the current one for `photon`. Does not create it.
    pub async fn switch_instance(&self, photon: &str, instance: &str) -> Result<String> {
        let instance = normalize_instance(instance)?;
        let previous = self
            .defaults
            .write()
            .await
            .insert(photon.to_string(), instance.clone())
            .unwrap_or_default();
        info!(
            "🔀 Switched '{}' from instance '{}' to '{}'",
            photon,
            display_instance(&previous),
            display_instance(&instance)
        );
        Ok(instance)
    }

    pub async fn current_instance(&self, photon: &str) -> String {
        self.defaults
            .read()
            .await
            .get(photon)
            .cloned()
            .unwrap_or_default()
    }

    /// Pick the instance a command addresses.
    ///
    /// A client hint that disagrees with the daemon's current instance is drift
    /// (typically after a restart): it is logged, counted and the hint wins.
    /// Without a hint drift cannot be detected; the session's own selection or
    /// the daemon's current instance is used.
    pub async fn effective_instance(
        &self,
        photon: &str,
        hint: Option<&str>,
        session_choice: Option<&str>,
    ) -> Result<(String, Option<DriftCorrection>)> {
        let Some(hint) = hint else {
            let name = match session_choice {
                Some(choice) => normalize_instance(choice)?,
                None => self.current_instance(photon).await,
            };
            return Ok((name, None));
        };

        let hint = normalize_instance(hint)?;
        let mut defaults = self.defaults.write().await;
        let current = defaults.get(photon).cloned().unwrap_or_default();
        if current == hint {
            return Ok((hint, None));
        }

        warn!(
            "🧭 Instance drift on '{}': daemon had '{}', client expects '{}'; using '{}'",
            photon,
            display_instance(&current),
            display_instance(&hint),
            display_instance(&hint)
        );
        self.drift_corrections.fetch_add(1, Ordering::Relaxed);
        defaults.insert(photon.to_string(), hint.clone());
        let correction = DriftCorrection {
            photon: photon.to_string(),
            from: current,
            to: hint.clone(),
        };
        Ok((hint, Some(correction)))
    }

    pub fn drift_corrections(&self) -> u64 {
        self.drift_corrections.load(Ordering::Relaxed)
    }

    /// Instance names known in memory or on disk
    pub async fn list_instances(&self, photon: &str) -> Vec<String> {
        let mut names: BTreeSet<String> = self
            .instances
            .read()
            .await
            .keys()
            .filter(|key| key.photon == photon)
            .map(|key| display_instance(&key.instance).to_string())
            .collect();

        if let Ok(mut entries) = fs::read_dir(self.state_dir.join(photon)).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.insert(stem.to_string());
                    }
                }
            }
        }
        names.into_iter().collect()
    }

    /// Re-read a photon's source and swap in the new module when its content
    /// changed. Live instances keep their state: it is copied shallowly into a
    /// fresh object of the new class.
    ///
    /// On failure the previous module stays in place.
    pub async fn reload(&self, photon: &str) -> Result<ReloadOutcome> {
        validate_photon_name(photon)?;
        let (module, handles) = {
            let _gate = self.load_gate.lock().await;

            let path = self
                .source_path(photon)
                .await
                .unwrap_or_else(|| self.default_source_path(photon));

            let Some(current) = self.module(photon).await else {
                self.compiler.load(photon, &path).await?;
                debug!("🔨 Precompiled unloaded photon '{}'", photon);
                return Ok(ReloadOutcome::Precompiled);
            };

            let (real_path, source) = read_source(photon, &path).await?;
            if content_hash(&source) == current.content_hash {
                debug!("⏭️ '{}' content unchanged, skipping reload", photon);
                return Ok(ReloadOutcome::Unchanged);
            }

            let module = Arc::new(self.compiler.load_source(photon, real_path, &source).await?);
            self.modules
                .write()
                .await
                .insert(photon.to_string(), Arc::clone(&module));

            let handles: Vec<InstanceHandle> = self
                .instances
                .read()
                .await
                .iter()
                .filter(|(key, _)| key.photon == photon)
                .map(|(_, handle)| Arc::clone(handle))
                .collect();
            (module, handles)
        };

        // The load gate is released: waiting on a slow call here must not
        // hold up loads of other photons.
        let mut migrated = 0;
        for handle in handles {
            let mut inst = handle.lock().await;
            // A later reload may have swapped the module again meanwhile
            let latest = self.module(photon).await.unwrap_or_else(|| Arc::clone(&module));
            if Arc::ptr_eq(&inst.module, &latest) {
                continue;
            }
            migrate_instance(&mut inst, &latest);
            migrated += 1;
        }

        info!("🔥 Reloaded photon '{}' ({} instance(s) migrated)", photon, migrated);
        Ok(ReloadOutcome::Reloaded { module, migrated })
    }

    pub async fn photon_count(&self) -> usize {
        self.modules.read().await.len()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn loaded_photons(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Move `inst` onto `module`, copying its declared state over shallowly
fn migrate_instance(inst: &mut PhotonInstance, module: &Arc<PhotonModule>) {
    let state = migrate_state(&inst.object.snapshot(), &module.state_keys());
    let mut object = module.construct();
    object.restore(&state);
    inst.object = object;
    inst.module = Arc::clone(module);
}

async fn read_state(path: &Path) -> Option<PhotonState> {
    let bytes = fs::read(path).await.ok()?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(state)) => Some(state),
        Ok(_) => {
            warn!("⚠️  State file {:?} is not an object, starting fresh", path);
            None
        }
        Err(e) => {
            warn!("⚠️  Unreadable state file {:?}: {}", path, e);
            None
        }
    }
}

async fn persist(inst: &PhotonInstance) -> Result<()> {
    if let Some(parent) = inst.state_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(&inst.object.snapshot())?;
    let tmp = inst.state_path.with_extension("json.tmp");
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, &inst.state_path).await?;
    debug!("💾 Persisted {}/{}", inst.photon, display_instance(&inst.name));
    Ok(())
}
