use anyhow::{anyhow, Result};
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A watched photon's source settled after a burst of file events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotonChange {
    pub photon: String,
    /// Resolved source path at the time the change fired
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
struct WatchTarget {
    /// Path as the photon was registered (may be a symlink)
    original: PathBuf,
    /// `original` with its directory canonicalized but the file name kept
    link: PathBuf,
    /// Fully resolved source file
    real: PathBuf,
}

impl WatchTarget {
    fn matches(&self, path: &Path) -> bool {
        path == self.real || path == self.link
    }
}

#[derive(Default)]
struct WatchState {
    targets: HashMap<String, WatchTarget>,
    watched_dirs: HashSet<PathBuf>,
    /// Trailing debounce timer per photon
    pending: HashMap<String, JoinHandle<()>>,
}

struct Inner {
    watcher: Mutex<RecommendedWatcher>,
    state: Mutex<WatchState>,
    debounce: Duration,
    changes: mpsc::UnboundedSender<PhotonChange>,
}

/// Watches photon source files and reports settled changes.
///
/// Directories are watched rather than files so that editors which save by
/// writing a temp file and renaming it over the original keep being tracked,
/// and so that edits to a symlink's target are seen. Every burst of events for
/// one photon collapses into a single [`PhotonChange`] once `debounce` passes
/// without further events.
pub struct PhotonWatcher {
    inner: Arc<Inner>,
}

impl PhotonWatcher {
    pub fn new(debounce: Duration) -> Result<(Self, mpsc::UnboundedReceiver<PhotonChange>)> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Err(e) = raw_tx.send(event) {
                        debug!("File watch event dropped: {}", e);
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            Config::default(),
        )?;

        let (changes, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            watcher: Mutex::new(watcher),
            state: Mutex::new(WatchState::default()),
            debounce,
            changes,
        });

        // Holds a weak handle so dropping the watcher ends the loop
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                Inner::handle_event(&inner, event).await;
            }
            debug!("🔍 File watcher channel closed");
        });

        Ok((Self { inner }, rx))
    }

    /// Start tracking `path` as the source of `photon`. Re-watching a photon
    /// replaces its previous path.
    pub async fn watch(&self, photon: &str, path: &Path) -> Result<()> {
        let target = resolve_target(path).await?;
        let mut state = self.inner.state.lock().await;
        self.inner.watch_dir_of(&mut state, &target.real).await?;
        self.inner.watch_dir_of(&mut state, &target.link).await?;

        if target.real != target.link {
            info!("👀 Watching '{}' at {:?} (-> {:?})", photon, target.original, target.real);
        } else {
            info!("👀 Watching '{}' at {:?}", photon, target.real);
        }
        state.targets.insert(photon.to_string(), target);
        Ok(())
    }

    pub async fn unwatch(&self, photon: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if let Some(pending) = state.pending.remove(photon) {
            pending.abort();
        }
        state.targets.remove(photon).is_some()
    }

    pub async fn is_watching(&self, photon: &str) -> bool {
        self.inner.state.lock().await.targets.contains_key(photon)
    }

    pub async fn watched_photons(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().await.targets.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Inner {
    async fn watch_dir_of(&self, state: &mut WatchState, file: &Path) -> Result<()> {
        let dir = file
            .parent()
            .ok_or_else(|| anyhow!("{:?} has no parent directory", file))?
            .to_path_buf();
        if state.watched_dirs.contains(&dir) {
            return Ok(());
        }
        self.watcher
            .lock()
            .await
            .watch(&dir, RecursiveMode::NonRecursive)?;
        debug!("👀 Watching directory: {:?}", dir);
        state.watched_dirs.insert(dir);
        Ok(())
    }

    async fn handle_event(inner: &Arc<Inner>, event: Event) {
        match event.kind {
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
            _ => return,
        }

        let mut state = inner.state.lock().await;
        let touched: Vec<String> = state
            .targets
            .iter()
            .filter(|(_, target)| event.paths.iter().any(|p| target.matches(p)))
            .map(|(photon, _)| photon.clone())
            .collect();

        for photon in touched {
            debug!("🔍 {:?} touches '{}'", event.kind, photon);
            if let Some(previous) = state.pending.remove(&photon) {
                previous.abort();
            }
            let weak = Arc::downgrade(inner);
            let debounce = inner.debounce;
            let key = photon.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                if let Some(inner) = weak.upgrade() {
                    inner.fire(&key).await;
                }
            });
            state.pending.insert(photon, timer);
        }
    }

    /// Debounce elapsed: re-resolve the source and report the change
    async fn fire(&self, photon: &str) {
        let mut state = self.state.lock().await;
        state.pending.remove(photon);
        let Some(current) = state.targets.get(photon).cloned() else {
            return;
        };

        let resolved = match resolve_target(&current.original).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    "⚠️  Source of '{}' is gone ({}); keeping the loaded module",
                    photon, e
                );
                return;
            }
        };

        if resolved.real != current.real {
            info!("🔗 '{}' now resolves to {:?}", photon, resolved.real);
            if let Err(e) = self.watch_dir_of(&mut state, &resolved.real).await {
                warn!("⚠️  Cannot watch new location of '{}': {}", photon, e);
            }
        }
        let path = resolved.real.clone();
        state.targets.insert(photon.to_string(), resolved);
        drop(state);

        info!("📁 Photon source changed: '{}'", photon);
        let _ = self.changes.send(PhotonChange {
            photon: photon.to_string(),
            path,
        });
    }
}

async fn resolve_target(path: &Path) -> Result<WatchTarget> {
    let real = fs::canonicalize(path).await?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("{:?} is not a file path", path))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::canonicalize(parent).await?,
        _ => std::env::current_dir()?,
    };
    Ok(WatchTarget {
        original: path.to_path_buf(),
        link: dir.join(file_name),
        real,
    })
}
