use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::protocol::{CommandRequest, Request, Response};

/// Default round-trip timeout for requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Async client for the daemon socket.
///
/// Responses are matched to requests by id. Pushed `channel_message` and
/// `refresh_needed` frames that arrive while waiting are queued for
/// [`DaemonClient::next_push`].
pub struct DaemonClient {
    writer: OwnedWriteHalf,
    frames: mpsc::UnboundedReceiver<Response>,
    pushes: VecDeque<Response>,
    next_id: AtomicU64,
    session_id: String,
}

impl DaemonClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("cannot connect to daemon at {}", socket_path.display()))?;
        debug!("🔌 Connected to {:?}", socket_path);

        let (reader, writer) = stream.into_split();
        let (tx, frames) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<Response>(&line) {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("⚠️  Unparsable frame from daemon: {}", e),
                }
            }
        });

        Ok(Self {
            writer,
            frames,
            pushes: VecDeque::new(),
            next_id: AtomicU64::new(1),
            session_id: format!("session_{}", uuid::Uuid::new_v4().simple()),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Fresh request id, unique within this client
    pub fn next_id(&self) -> String {
        format!("req_{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Write a raw line, bypassing request encoding
    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    /// Send `request` and wait for the frame carrying its id
    pub async fn request(&mut self, request: &Request, wait: Duration) -> Result<Response> {
        let line = request.to_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.wait_for(request.id(), wait).await
    }

    /// Wait for the response with id `id`, queueing pushes that arrive first
    pub async fn wait_for(&mut self, id: &str, wait: Duration) -> Result<Response> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = timeout(remaining, self.frames.recv())
                .await
                .map_err(|_| anyhow!("timed out after {:?} waiting for response '{}'", wait, id))?
                .ok_or_else(|| anyhow!("daemon closed the connection"))?;

            if frame.is_push() {
                self.pushes.push_back(frame);
            } else if frame.id() == id {
                return Ok(frame);
            } else {
                debug!("Dropping uncorrelated frame '{}'", frame.id());
            }
        }
    }

    /// Next pushed frame, queued or live. `None` when nothing arrives within `wait`.
    pub async fn next_push(&mut self, wait: Duration) -> Result<Option<Response>> {
        if let Some(frame) = self.pushes.pop_front() {
            return Ok(Some(frame));
        }
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(frame) = timeout(remaining, self.frames.recv()).await else {
                return Ok(None);
            };
            let frame = frame.ok_or_else(|| anyhow!("daemon closed the connection"))?;
            if frame.is_push() {
                return Ok(Some(frame));
            }
            debug!("Dropping uncorrelated frame '{}'", frame.id());
        }
    }

    /// Pushes received so far without waiting
    pub fn drain_pushes(&mut self) -> Vec<Response> {
        while let Ok(frame) = self.frames.try_recv() {
            if frame.is_push() {
                self.pushes.push_back(frame);
            }
        }
        self.pushes.drain(..).collect()
    }

    /// Send `request` and unwrap a `result` frame into its data
    pub async fn call(&mut self, request: &Request) -> Result<Value> {
        match self.request(request, DEFAULT_TIMEOUT).await? {
            Response::Result { data, .. } => Ok(data),
            Response::Pong { .. } => Ok(Value::String("pong".to_string())),
            Response::Error { error, code, .. } => bail!("{} ({})", error, code),
            other => bail!("unexpected response {:?}", other),
        }
    }

    /// Invoke a photon method as this client's session
    pub async fn command(&mut self, photon: &str, method: &str, args: Value) -> Result<Value> {
        let mut cmd = CommandRequest::new(self.next_id(), photon, method).with_args(args);
        cmd.session_id = Some(self.session_id.clone());
        cmd.client_type = Some("cli".to_string());
        self.call(&Request::Command(cmd)).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        let id = self.next_id();
        match self.request(&Request::Ping { id }, DEFAULT_TIMEOUT).await? {
            Response::Pong { .. } => Ok(()),
            other => bail!("unexpected response to ping {:?}", other),
        }
    }
}
