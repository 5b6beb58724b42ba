use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::channels::ConnectionId;
use crate::error::{DaemonError, Result};

/// Proof of holding a named lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockToken {
    name: String,
    _permit: OwnedSemaphorePermit,
}

impl LockToken {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named mutual-exclusion sections shared by every connection.
///
/// Waiters are served in arrival order; a waiter that exceeds its timeout fails
/// with [`DaemonError::LockTimeout`] instead of blocking forever.
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    /// Locks taken through `lock` requests, keyed by lock name. Owned by the
    /// connection that took them; client-chosen session ids can collide.
    held: Mutex<HashMap<String, (ConnectionId, LockToken)>>,
    default_timeout: Duration,
}

impl LockManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    async fn semaphore(&self, name: &str) -> Arc<Semaphore> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    pub async fn acquire(&self, name: &str, wait: Option<Duration>) -> Result<LockToken> {
        let wait = wait.unwrap_or(self.default_timeout);
        let semaphore = self.semaphore(name).await;

        match timeout(wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!("🔒 Acquired lock '{}'", name);
                Ok(LockToken {
                    name: name.to_string(),
                    _permit: permit,
                })
            }
            // The semaphore is never closed
            Ok(Err(_)) => Err(DaemonError::protocol(format!("lock '{name}' is closed"))),
            Err(_) => {
                warn!("⏱️  Timed out after {:?} waiting for lock '{}'", wait, name);
                Err(DaemonError::LockTimeout {
                    name: name.to_string(),
                    timeout: wait,
                })
            }
        }
    }

    pub fn release(&self, token: LockToken) {
        debug!("🔓 Released lock '{}'", token.name);
        drop(token);
    }

    pub async fn is_locked(&self, name: &str) -> bool {
        self.locks
            .lock()
            .await
            .get(name)
            .is_some_and(|s| s.available_permits() == 0)
    }

    /// Take `name` on behalf of a connection. Re-locking a lock the holder
    /// already owns succeeds without waiting.
    pub async fn acquire_for(
        &self,
        holder: ConnectionId,
        name: &str,
        wait: Option<Duration>,
    ) -> Result<()> {
        if let Some((owner, _)) = self.held.lock().await.get(name) {
            if *owner == holder {
                return Ok(());
            }
        }

        let token = self.acquire(name, wait).await?;
        self.held
            .lock()
            .await
            .insert(name.to_string(), (holder, token));
        Ok(())
    }

    /// Release a held lock. Only its holder may release it.
    pub async fn release_for(&self, holder: ConnectionId, name: &str) -> bool {
        let mut held = self.held.lock().await;
        match held.get(name) {
            Some((owner, _)) if *owner == holder => {
                if let Some((_, token)) = held.remove(name) {
                    self.release(token);
                }
                true
            }
            _ => false,
        }
    }

    /// Drop every lock a disconnected connection still holds
    pub async fn release_all_for(&self, holder: ConnectionId) -> Vec<String> {
        let mut held = self.held.lock().await;
        let names: Vec<String> = held
            .iter()
            .filter(|(_, (owner, _))| *owner == holder)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            if let Some((_, token)) = held.remove(name) {
                self.release(token);
            }
        }
        names
    }

    pub async fn holder_of(&self, name: &str) -> Option<ConnectionId> {
        self.held.lock().await.get(name).map(|(owner, _)| *owner)
    }
}
