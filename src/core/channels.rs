//! Per-channel bounded event log with replay, plus live fan-out.
//!
//! Buffers live as long as the process. After a restart every buffer is empty
//! and ids start again at 1, so any replay request that cannot be proven
//! complete is answered with `refresh_needed`.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use crate::ipc::protocol::{push_id, Response};

pub type ConnectionId = u64;

/// Outbound frame queue of one connection
pub type Outbox = mpsc::UnboundedSender<Response>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedEvent {
    pub id: u64,
    pub message: Value,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl BufferedEvent {
    pub fn to_push(&self, channel: &str) -> Response {
        Response::ChannelMessage {
            id: push_id(),
            channel: channel.to_string(),
            event_id: self.id,
            message: self.message.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Answer to "what did I miss since `lastEventId`?"
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    /// `lastEventId` was 0: nothing to replay
    Fresh,
    Events(Vec<BufferedEvent>),
    RefreshNeeded,
}

#[derive(Debug)]
pub struct ChannelBuffer {
    next_id: u64,
    events: VecDeque<BufferedEvent>,
    capacity: usize,
}

impl ChannelBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            next_id: 1,
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an event, evicting the oldest when full. Returns the new id.
    pub fn push(&mut self, message: Value) -> &BufferedEvent {
        let id = self.next_id;
        self.next_id += 1;
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(BufferedEvent {
            id,
            message,
            timestamp: now_millis(),
        });
        &self.events[self.events.len() - 1]
    }

    pub fn oldest_id(&self) -> Option<u64> {
        self.events.front().map(|e| e.id)
    }

    pub fn newest_id(&self) -> Option<u64> {
        self.events.back().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn since(&self, last_event_id: u64) -> Replay {
        if last_event_id == 0 {
            return Replay::Fresh;
        }
        let (Some(oldest), Some(newest)) = (self.oldest_id(), self.newest_id()) else {
            return Replay::RefreshNeeded;
        };
        // Older than the horizon: events were evicted. Newer than anything we
        // issued: the id comes from a previous daemon lifetime.
        if last_event_id < oldest || last_event_id > newest {
            return Replay::RefreshNeeded;
        }
        Replay::Events(
            self.events
                .iter()
                .filter(|e| e.id > last_event_id)
                .cloned()
                .collect(),
        )
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub replayed: usize,
    pub refresh_needed: bool,
}

#[derive(Default)]
struct HubState {
    buffers: HashMap<String, ChannelBuffer>,
    subscribers: HashMap<String, HashMap<ConnectionId, Outbox>>,
}

/// All channel buffers and subscriptions of the daemon
pub struct ChannelHub {
    capacity: usize,
    state: Mutex<HubState>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(HubState::default()),
        }
    }

    /// Buffer `message` and push it to every subscriber except `publisher`.
    ///
    /// Delivery only enqueues onto each connection's outbox, so a slow reader
    /// never holds up the publisher.
    pub async fn publish(&self, channel: &str, message: Value, publisher: Option<ConnectionId>) -> u64 {
        let mut state = self.state.lock().await;
        let HubState {
            buffers,
            subscribers,
        } = &mut *state;

        let event = buffers
            .entry(channel.to_string())
            .or_insert_with(|| ChannelBuffer::new(self.capacity))
            .push(message);
        let event_id = event.id;

        if let Some(subs) = subscribers.get_mut(channel) {
            let push = event.to_push(channel);
            subs.retain(|conn, outbox| {
                if Some(*conn) == publisher {
                    return true;
                }
                // A closed outbox means the connection is gone
                outbox.send(push.clone()).is_ok()
            });
            trace!("📣 Event {} on '{}' fanned out to {} subscriber(s)", event_id, channel, subs.len());
        }

        event_id
    }

    /// Register a subscription and, when `last_event_id` asks for it, enqueue the
    /// replay (or a `refresh_needed`) on `outbox` before returning.
    ///
    /// Registration and replay happen under one lock, so no event is lost or
    /// duplicated between the replayed tail and the live stream.
    pub async fn subscribe(
        &self,
        channel: &str,
        conn: ConnectionId,
        outbox: Outbox,
        last_event_id: Option<u64>,
    ) -> SubscribeOutcome {
        let mut state = self.state.lock().await;

        let mut outcome = SubscribeOutcome {
            replayed: 0,
            refresh_needed: false,
        };

        if let Some(last) = last_event_id {
            let replay = match state.buffers.get(channel) {
                Some(buffer) => buffer.since(last),
                None if last == 0 => Replay::Fresh,
                None => Replay::RefreshNeeded,
            };
            match replay {
                Replay::Fresh => {}
                Replay::Events(events) => {
                    for event in &events {
                        let _ = outbox.send(event.to_push(channel));
                    }
                    outcome.replayed = events.len();
                }
                Replay::RefreshNeeded => {
                    let _ = outbox.send(Response::RefreshNeeded {
                        id: push_id(),
                        channel: channel.to_string(),
                        last_event_id: last,
                        oldest_event_id: state.buffers.get(channel).and_then(|b| b.oldest_id()),
                    });
                    outcome.refresh_needed = true;
                }
            }
        }

        state
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .insert(conn, outbox);

        debug!(
            "📡 Connection {} subscribed to '{}' (replayed {}, refresh {})",
            conn, channel, outcome.replayed, outcome.refresh_needed
        );
        outcome
    }

    pub async fn unsubscribe(&self, channel: &str, conn: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let Some(subs) = state.subscribers.get_mut(channel) else {
            return false;
        };
        let removed = subs.remove(&conn).is_some();
        if subs.is_empty() {
            state.subscribers.remove(channel);
        }
        removed
    }

    /// Drop every subscription of a disconnected connection
    pub async fn remove_connection(&self, conn: ConnectionId) -> usize {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        state.subscribers.retain(|_, subs| {
            if subs.remove(&conn).is_some() {
                removed += 1;
            }
            !subs.is_empty()
        });
        removed
    }

    /// Polling form of the replay path: `(events, refresh_needed)`
    pub async fn events_since(&self, channel: &str, last_event_id: u64) -> (Vec<BufferedEvent>, bool) {
        let state = self.state.lock().await;
        let replay = match state.buffers.get(channel) {
            Some(buffer) => buffer.since(last_event_id),
            None if last_event_id == 0 => Replay::Fresh,
            None => Replay::RefreshNeeded,
        };
        match replay {
            Replay::Fresh => (Vec::new(), false),
            Replay::Events(events) => (events, false),
            Replay::RefreshNeeded => (Vec::new(), true),
        }
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .await
            .subscribers
            .get(channel)
            .map_or(0, HashMap::len)
    }

    pub async fn channel_count(&self) -> usize {
        self.state.lock().await.buffers.len()
    }
}
