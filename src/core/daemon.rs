use anyhow::{Context, Result as AnyResult};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::{DaemonConfig, PHOTON_EXTENSION};
use crate::core::channels::{ChannelHub, ConnectionId};
use crate::core::hot_reload::{PhotonChange, PhotonWatcher};
use crate::core::locks::LockManager;
use crate::core::registry::{display_instance, InstanceRegistry, ReloadOutcome, DEFAULT_INSTANCE};
use crate::core::scheduler::{self, ScheduledJob, Scheduler};
use crate::core::session::Session;
use crate::error::{DaemonError, Result};
use crate::ipc::protocol::CommandRequest;
use crate::ipc::server::IpcServer;
use crate::photon::{ManifestLoader, PhotonCompiler, PhotonLoader, PhotonModule};

/// Notable things the daemon did on its own, for observers and tests
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DaemonEvent {
    Reloaded { photon: String, migrated: usize },
    ReloadFailed { photon: String, error: String },
    DriftCorrected { photon: String, from: String, to: String },
    JobFired { job_id: String, photon: String, method: String },
    JobFailed { job_id: String, error: String },
}

/// Who issued a command. Webhook-only methods reject everything but `Webhook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    Client,
    Webhook,
    Scheduler,
}

/// Process-wide context shared by every connection and background task
pub struct Daemon {
    config: DaemonConfig,
    registry: InstanceRegistry,
    channels: ChannelHub,
    locks: LockManager,
    scheduler: Scheduler,
    watcher: PhotonWatcher,
    changes: Mutex<Option<mpsc::UnboundedReceiver<PhotonChange>>>,
    events: broadcast::Sender<DaemonEvent>,
    start_time: Instant,
    next_connection: AtomicU64,
    connections: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    pub async fn new(config: DaemonConfig) -> AnyResult<Arc<Self>> {
        Self::with_loader(config, Arc::new(ManifestLoader::new())).await
    }

    /// Build a daemon around a custom module loader
    pub async fn with_loader(config: DaemonConfig, loader: Arc<dyn PhotonLoader>) -> AnyResult<Arc<Self>> {
        info!("🔧 Initializing photon registry under {:?}", config.state_dir);
        let compiler = PhotonCompiler::new(loader, config.cache_dir());
        let registry = InstanceRegistry::new(compiler, config.instance_state_dir(), config.photon_dir());
        let (watcher, changes) = PhotonWatcher::new(config.debounce())?;
        let (events, _) = broadcast::channel(100);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            channels: ChannelHub::new(config.channel_buffer_size),
            locks: LockManager::new(config.lock_timeout()),
            scheduler: Scheduler::new(),
            registry,
            watcher,
            changes: Mutex::new(Some(changes)),
            events,
            start_time: Instant::now(),
            next_connection: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            shutdown,
            config,
        }))
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn channels(&self) -> &ChannelHub {
        &self.channels
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn watcher(&self) -> &PhotonWatcher {
        &self.watcher
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DaemonEvent> {
        self.events.subscribe()
    }

    /// Daemon events as a stream; lagged receivers silently skip what they missed
    pub fn event_stream(&self) -> impl Stream<Item = DaemonEvent> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    fn emit(&self, event: DaemonEvent) {
        // No observers is fine
        let _ = self.events.send(event);
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) -> usize {
        self.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("🛑 Shutdown requested");
        }
    }

    /// Bind the socket and start every background task.
    ///
    /// The socket accepts connections as soon as this returns. The handle
    /// completes once the daemon has shut down and removed its socket file.
    pub async fn spawn(self: &Arc<Self>) -> AnyResult<JoinHandle<AnyResult<()>>> {
        let socket_path = self.config.socket_path();
        tokio::fs::create_dir_all(&self.config.state_dir)
            .await
            .with_context(|| format!("cannot create state dir {:?}", self.config.state_dir))?;

        if self.config.proactive_watch {
            self.watch_photon_dir().await;
        }

        let listener = IpcServer::bind(&socket_path).await?;
        self.spawn_reload_loop().await;
        self.spawn_scheduler_loop();

        let server = IpcServer::new(Arc::clone(self));
        Ok(tokio::spawn(server.serve(listener, socket_path)))
    }

    /// Run until ctrl-c or a `shutdown` request
    pub async fn run(self: &Arc<Self>) -> AnyResult<()> {
        info!("🚀 Starting photon daemon v{}", env!("CARGO_PKG_VERSION"));
        let mut server = self.spawn().await?;

        tokio::select! {
            result = &mut server => return result?,
            _ = signal::ctrl_c() => {
                info!("🛑 Received shutdown signal");
                self.shutdown();
            }
        }

        server.await??;
        info!("👋 Photon daemon stopped");
        Ok(())
    }

    /// Watch every photon source in the photon directory, loaded or not, so
    /// edits made before first use are compiled ahead of time.
    async fn watch_photon_dir(&self) {
        let dir = self.config.photon_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("📂 No photon directory at {:?}: {}", dir, e);
                return;
            }
        };

        let mut count = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(photon) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(PHOTON_EXTENSION))
            else {
                continue;
            };
            match self.watcher.watch(photon, &path).await {
                Ok(()) => count += 1,
                Err(e) => warn!("⚠️  Cannot watch {:?}: {}", path, e),
            }
        }
        info!("📂 Watching {} photon source(s) in {:?}", count, dir);
    }

    async fn spawn_reload_loop(self: &Arc<Self>) {
        let Some(mut changes) = self.changes.lock().await.take() else {
            return;
        };
        let daemon = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => {
                        let Some(change) = change else { break };
                        // Failures are logged and broadcast inside reload_photon
                        let _ = daemon.reload_photon(&change.photon).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("🔥 Reload loop stopped");
        });
    }

    fn spawn_scheduler_loop(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        let tick = self.config.scheduler_tick();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        daemon.run_due_jobs().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("⏰ Scheduler loop stopped");
        });
    }

    /// Fire every job due this minute, concurrently
    pub async fn run_due_jobs(&self) -> usize {
        let due = self.scheduler.due_jobs(&scheduler::now()).await;
        let count = due.len();
        join_all(due.iter().map(|job| self.fire_job(job))).await;
        count
    }

    pub async fn fire_job(&self, job: &ScheduledJob) {
        info!("⏰ Firing job '{}' ({}.{})", job.id, job.photon, job.method);
        let command = job.to_command();
        match self.execute_command(&command, None, None, CommandOrigin::Scheduler).await {
            Ok(_) => self.emit(DaemonEvent::JobFired {
                job_id: job.id.clone(),
                photon: job.photon.clone(),
                method: job.method.clone(),
            }),
            Err(e) => {
                warn!("⚠️  Job '{}' failed: {}", job.id, e);
                self.emit(DaemonEvent::JobFailed {
                    job_id: job.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Loaded module for `photon`. A first load also starts watching its
    /// source and registers its scheduled methods.
    pub async fn ensure_module(&self, photon: &str, path: Option<&Path>) -> Result<Arc<PhotonModule>> {
        let (module, fresh) = self.registry.load_module(photon, path).await?;
        if fresh {
            self.scheduler.sync_module(&module).await;
            let source = self
                .registry
                .source_path(photon)
                .await
                .unwrap_or_else(|| module.source_path.clone());
            if let Err(e) = self.watcher.watch(photon, &source).await {
                warn!("⚠️  Cannot watch source of '{}': {}", photon, e);
            }
        }
        Ok(module)
    }

    /// Re-read a photon from disk, swapping in the new module when it changed
    pub async fn reload_photon(&self, photon: &str) -> Result<ReloadOutcome> {
        match self.registry.reload(photon).await {
            Ok(outcome) => {
                if let ReloadOutcome::Reloaded { module, migrated } = &outcome {
                    self.scheduler.sync_module(module).await;
                    self.emit(DaemonEvent::Reloaded {
                        photon: photon.to_string(),
                        migrated: *migrated,
                    });
                }
                Ok(outcome)
            }
            Err(e) => {
                error!("❌ Reload of '{}' failed, keeping previous version: {}", photon, e);
                self.emit(DaemonEvent::ReloadFailed {
                    photon: photon.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Run one `command` (or webhook, or scheduled job) end to end.
    ///
    /// The named lock of a locked method is taken before the instance itself,
    /// so a lock timeout never leaves the instance queue blocked. Commands that
    /// change state publish `state-changed` on the photon's channel, skipping
    /// `publisher`.
    pub async fn execute_command(
        &self,
        cmd: &CommandRequest,
        session: Option<&mut Session>,
        publisher: Option<ConnectionId>,
        origin: CommandOrigin,
    ) -> Result<Value> {
        let photon = cmd.photon_name.as_str();
        let module = self.ensure_module(photon, cmd.photon_path.as_deref()).await?;
        let args = cmd.args_object();

        match cmd.method.as_str() {
            "_use" => {
                let requested = args
                    .get("name")
                    .and_then(Value::as_str)
                    .or(cmd.instance_name.as_deref())
                    .unwrap_or(DEFAULT_INSTANCE);
                let name = self.registry.switch_instance(photon, requested).await?;
                if let Some(session) = session {
                    session.select_instance(photon, &name);
                }
                return Ok(json!({ "instance": display_instance(&name) }));
            }
            "_instances" => {
                let current = match session.as_deref().and_then(|s| s.current_instance(photon)) {
                    Some(choice) => choice.to_string(),
                    None => self.registry.current_instance(photon).await,
                };
                return Ok(json!({
                    "instances": self.registry.list_instances(photon).await,
                    "current": display_instance(&current),
                }));
            }
            _ => {}
        }

        let descriptor = module
            .method(&cmd.method)
            .cloned()
            .ok_or_else(|| DaemonError::not_found("method", format!("{}.{}", photon, cmd.method)))?;
        if origin == CommandOrigin::Webhook && !descriptor.capabilities.webhook {
            return Err(DaemonError::protocol(format!(
                "Method '{}.{}' is not exposed as a webhook",
                photon, cmd.method
            )));
        }

        let session_choice = session
            .as_deref()
            .and_then(|s| s.current_instance(photon))
            .map(str::to_string);
        let (instance, drift) = self
            .registry
            .effective_instance(photon, cmd.instance_name.as_deref(), session_choice.as_deref())
            .await?;
        if let Some(drift) = drift {
            self.emit(DaemonEvent::DriftCorrected {
                photon: drift.photon,
                from: display_instance(&drift.from).to_string(),
                to: display_instance(&drift.to).to_string(),
            });
        }

        let holder = session.as_deref().map(|s| s.connection);
        if let (Some(session), Some(_)) = (session, cmd.instance_name.as_deref()) {
            session.select_instance(photon, &instance);
        }

        let token = match &descriptor.capabilities.locked {
            Some(spec) => {
                let held_by_caller = match &holder {
                    Some(holder) => self.locks.holder_of(&spec.name).await == Some(*holder),
                    None => false,
                };
                if held_by_caller {
                    None
                } else {
                    let wait = spec.timeout_ms.map(Duration::from_millis);
                    Some(self.locks.acquire(&spec.name, wait).await?)
                }
            }
            None => None,
        };

        let outcome = self
            .registry
            .invoke(photon, &instance, &cmd.method, args)
            .await;
        if let Some(token) = token {
            self.locks.release(token);
        }
        let outcome = outcome?;

        if outcome.changed {
            let message = json!({
                "event": "state-changed",
                "instance": display_instance(&instance),
                "method": cmd.method,
                "data": outcome.data,
            });
            self.channels.publish(photon, message, publisher).await;
        }
        Ok(outcome.data)
    }

    pub async fn status(&self) -> Value {
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSecs": self.uptime().as_secs(),
            "photons": self.registry.loaded_photons().await,
            "instances": self.registry.instance_count().await,
            "channels": self.channels.channel_count().await,
            "connections": self.connections.load(Ordering::Relaxed),
            "jobs": self.scheduler.len().await,
            "driftCorrections": self.registry.drift_corrections(),
        })
    }
}
