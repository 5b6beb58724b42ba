use anyhow::Result;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::channels::{ConnectionId, Outbox};
use crate::core::daemon::{CommandOrigin, Daemon};
use crate::core::scheduler::{CronSchedule, JobSource, ScheduledJob};
use crate::core::session::Session;
use crate::error::DaemonError;
use crate::ipc::protocol::{Request, Response};

/// Line-delimited JSON server on the daemon's Unix socket
pub struct IpcServer {
    daemon: Arc<Daemon>,
}

impl IpcServer {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }

    /// Bind `socket_path`, replacing a stale socket left by a previous run
    pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if socket_path.exists() {
            debug!("🧹 Removing stale socket {:?}", socket_path);
            tokio::fs::remove_file(socket_path).await?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!("🔌 IPC server listening on: {:?}", socket_path);
        Ok(listener)
    }

    pub async fn serve(self, listener: UnixListener, socket_path: PathBuf) -> Result<()> {
        let mut shutdown = self.daemon.shutdown_signal();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let daemon = Arc::clone(&self.daemon);
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_client(daemon, stream).await {
                                warn!("⚠️  Error handling client: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("❌ Failed to accept connection: {}", e),
                },
                _ = shutdown.changed() => break,
            }
            if self.daemon.is_shutting_down() {
                break;
            }
        }

        drop(listener);
        if let Err(e) = tokio::fs::remove_file(&socket_path).await {
            debug!("Socket {:?} already gone: {}", socket_path, e);
        }
        info!("🔌 IPC server stopped");
        Ok(())
    }

    async fn handle_client(daemon: Arc<Daemon>, stream: UnixStream) -> Result<()> {
        let conn = daemon.next_connection_id();
        let open = daemon.connection_opened();
        info!("📞 Client {} connected ({} open)", conn, open);

        let (reader, mut writer) = stream.into_split();
        let (outbox, mut frames) = mpsc::unbounded_channel::<Response>();

        // Pushes and responses share one ordered queue per connection
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let line = match frame.to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("⚠️  Cannot encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!("Client {} went away mid-write: {}", conn, e);
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        let mut shutdown = daemon.shutdown_signal();
        let mut session: Option<Session> = None;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = shutdown.changed() => break,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("⚠️  Read error on client {}: {}", conn, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let (response, stop) = match Request::parse(&line) {
                Err((id, err)) => {
                    debug!("📨 Rejected frame from client {}: {}", conn, err);
                    (Response::error(id, &err), false)
                }
                Ok(request) => {
                    debug!("📨 {} request '{}' from client {}", request.kind(), request.id(), conn);
                    let (session_id, client_type) = request.session_hints();
                    let session =
                        session.get_or_insert_with(|| Session::new(conn, session_id, client_type));
                    let stop = matches!(request, Request::Shutdown { .. });
                    let id = request.id().to_string();
                    let response = match Self::process_request(&daemon, request, session, &outbox).await {
                        Ok(response) => response,
                        Err(err) => Response::error(id, &err),
                    };
                    (response, stop)
                }
            };

            if outbox.send(response).is_err() {
                break;
            }
            if stop {
                daemon.shutdown();
                break;
            }
        }

        if let Some(session) = &session {
            let released = daemon.locks().release_all_for(conn).await;
            if !released.is_empty() {
                info!("🔓 Released {:?} held by departing session {}", released, session.id);
            }
        }
        daemon.channels().remove_connection(conn).await;
        drop(outbox);
        let _ = writer_task.await;

        let open = daemon.connection_closed();
        info!("👋 Client {} disconnected ({} open)", conn, open);
        Ok(())
    }

    async fn process_request(
        daemon: &Daemon,
        request: Request,
        session: &mut Session,
        outbox: &Outbox,
    ) -> Result<Response, DaemonError> {
        let conn: ConnectionId = session.connection;

        match request {
            Request::Ping { id } => Ok(Response::Pong { id }),

            Request::Command(cmd) => {
                let data = daemon
                    .execute_command(&cmd, Some(session), Some(conn), CommandOrigin::Client)
                    .await?;
                Ok(Response::result(cmd.id, data))
            }

            Request::Webhook(cmd) => {
                let data = daemon
                    .execute_command(&cmd, Some(session), Some(conn), CommandOrigin::Webhook)
                    .await?;
                Ok(Response::result(cmd.id, data))
            }

            Request::Subscribe {
                id,
                channel,
                last_event_id,
                ..
            } => {
                daemon
                    .channels()
                    .subscribe(&channel, conn, outbox.clone(), last_event_id)
                    .await;
                session.add_subscription(&channel);
                Ok(Response::success(
                    id,
                    json!({ "subscribed": true, "channel": channel }),
                ))
            }

            Request::Unsubscribe { id, channel } => {
                let unsubscribed = daemon.channels().unsubscribe(&channel, conn).await;
                session.remove_subscription(&channel);
                Ok(Response::success(
                    id,
                    json!({ "unsubscribed": unsubscribed, "channel": channel }),
                ))
            }

            Request::Publish {
                id,
                channel,
                message,
                ..
            } => {
                let event_id = daemon.channels().publish(&channel, message, Some(conn)).await;
                Ok(Response::success(
                    id,
                    json!({ "published": true, "channel": channel, "eventId": event_id }),
                ))
            }

            Request::GetEventsSince {
                id,
                channel,
                last_event_id,
            } => {
                let (events, refresh_needed) =
                    daemon.channels().events_since(&channel, last_event_id).await;
                Ok(Response::success(
                    id,
                    json!({ "events": events, "refreshNeeded": refresh_needed }),
                ))
            }

            Request::Status { id } => Ok(Response::success(id, daemon.status().await)),

            Request::Reload {
                id,
                photon_name,
                photon_path,
            } => {
                let loaded = daemon.registry().module(&photon_name).await.is_some();
                let outcome = match photon_path {
                    Some(path) if !loaded => {
                        daemon.ensure_module(&photon_name, Some(path.as_path())).await?;
                        "loaded"
                    }
                    _ => daemon.reload_photon(&photon_name).await?.label(),
                };
                Ok(Response::success(
                    id,
                    json!({ "photonName": photon_name, "outcome": outcome }),
                ))
            }

            Request::Lock {
                id,
                lock_name,
                timeout,
            } => {
                let wait = timeout.map(Duration::from_millis);
                daemon.locks().acquire_for(session.connection, &lock_name, wait).await?;
                Ok(Response::success(
                    id,
                    json!({ "locked": true, "lockName": lock_name }),
                ))
            }

            Request::Unlock { id, lock_name } => {
                if !daemon.locks().release_for(session.connection, &lock_name).await {
                    return Err(DaemonError::not_found("lock held by this session", lock_name));
                }
                Ok(Response::success(
                    id,
                    json!({ "unlocked": true, "lockName": lock_name }),
                ))
            }

            Request::Schedule {
                id,
                photon_name,
                photon_path,
                job_id,
                method,
                cron,
                args,
                instance_name,
            } => {
                let cron = CronSchedule::parse(&cron).map_err(|e| DaemonError::protocol(e.to_string()))?;
                let module = daemon.ensure_module(&photon_name, photon_path.as_deref()).await?;
                if module.method(&method).is_none() {
                    return Err(DaemonError::not_found(
                        "method",
                        format!("{photon_name}.{method}"),
                    ));
                }

                let job_id = job_id.unwrap_or_else(|| format!("job_{}", uuid::Uuid::new_v4().simple()));
                let mut job = ScheduledJob::new(&job_id, &photon_name, &method, cron, JobSource::Client);
                job.photon_path = photon_path;
                job.args = args;
                job.instance_name = instance_name;
                let summary = job.summary();
                daemon.scheduler().register(job).await;
                Ok(Response::success(id, summary))
            }

            Request::Unschedule { id, job_id } => {
                let unscheduled = daemon.scheduler().unregister(&job_id).await;
                Ok(Response::success(
                    id,
                    json!({ "unscheduled": unscheduled, "jobId": job_id }),
                ))
            }

            Request::ListJobs { id } => {
                let jobs: Vec<Value> = daemon
                    .scheduler()
                    .list()
                    .await
                    .iter()
                    .map(ScheduledJob::summary)
                    .collect();
                Ok(Response::success(id, json!({ "jobs": jobs })))
            }

            Request::Shutdown { id } => {
                info!("🛑 Shutdown requested by session {}", session.id);
                Ok(Response::success(id, json!({ "shuttingDown": true })))
            }
        }
    }
}
