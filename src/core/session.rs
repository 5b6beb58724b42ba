use std::collections::{HashMap, HashSet};
use std::time::Instant;

use super::channels::ConnectionId;

/// Ephemeral per-connection context. Holds instance *names*, never instances.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub client_type: String,
    pub connection: ConnectionId,
    /// Instance selected per photon through `_use`
    instances: HashMap<String, String>,
    subscriptions: HashSet<String>,
    pub created_at: Instant,
}

impl Session {
    pub fn new(connection: ConnectionId, id: Option<&str>, client_type: Option<&str>) -> Self {
        Self {
            id: id
                .map(str::to_string)
                .unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4().simple())),
            client_type: client_type.unwrap_or("unknown").to_string(),
            connection,
            instances: HashMap::new(),
            subscriptions: HashSet::new(),
            created_at: Instant::now(),
        }
    }

    pub fn current_instance(&self, photon: &str) -> Option<&str> {
        self.instances.get(photon).map(String::as_str)
    }

    pub fn select_instance(&mut self, photon: &str, instance: &str) {
        self.instances.insert(photon.to_string(), instance.to_string());
    }

    pub fn add_subscription(&mut self, channel: &str) -> bool {
        self.subscriptions.insert(channel.to_string())
    }

    pub fn remove_subscription(&mut self, channel: &str) -> bool {
        self.subscriptions.remove(channel)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }
}
