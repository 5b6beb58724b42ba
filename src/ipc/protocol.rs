use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::DaemonError;

/// Request types understood by the daemon, in the order they are documented
pub const REQUEST_TYPES: &[&str] = &[
    "ping",
    "command",
    "subscribe",
    "unsubscribe",
    "publish",
    "get_events_since",
    "status",
    "reload",
    "lock",
    "unlock",
    "schedule",
    "unschedule",
    "list_jobs",
    "webhook",
    "shutdown",
];

/// Messages sent from client to daemon, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    Ping {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
    },
    /// Invoke a photon method
    Command(CommandRequest),
    /// Start receiving `channel_message` pushes, optionally replaying missed events
    Subscribe {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        photon_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_type: Option<String>,
        #[serde(
            default,
            deserialize_with = "lenient_event_id",
            skip_serializing_if = "Option::is_none"
        )]
        last_event_id: Option<u64>,
    },
    Unsubscribe {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        channel: String,
    },
    Publish {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        channel: String,
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        photon_name: Option<String>,
    },
    /// Polling counterpart of subscribe's replay path
    GetEventsSince {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        channel: String,
        #[serde(deserialize_with = "required_event_id")]
        last_event_id: u64,
    },
    Status {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
    },
    /// Re-read a photon's source from disk right away
    Reload {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        photon_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        photon_path: Option<PathBuf>,
    },
    /// Hold a named lock for the lifetime of the session (or until `unlock`)
    Lock {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        lock_name: String,
        /// Milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    Unlock {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        lock_name: String,
    },
    Schedule {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        photon_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        photon_path: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        method: String,
        cron: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_name: Option<String>,
    },
    Unschedule {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
        job_id: String,
    },
    ListJobs {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
    },
    /// Out-of-band trigger; only methods flagged as webhooks accept it
    Webhook(CommandRequest),
    Shutdown {
        #[serde(deserialize_with = "lenient_id")]
        id: String,
    },
}

/// Payload of `command` and `webhook` requests. Scheduled jobs synthesize one too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    pub photon_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photon_path: Option<PathBuf>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    /// Instance the client believes it is using; corrects drift after a restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl CommandRequest {
    pub fn new(id: impl Into<String>, photon_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            photon_name: photon_name.into(),
            photon_path: None,
            method: method.into(),
            args: Value::Null,
            session_id: None,
            client_type: None,
            instance_name: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_instance(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = Some(instance_name.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.photon_path = Some(path.into());
        self
    }

    /// Arguments as handed to the photon: missing args become an empty object
    pub fn args_object(&self) -> Value {
        if self.args.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.args.clone()
        }
    }
}

/// Messages sent from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Response {
    Pong {
        id: String,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
        #[serde(default)]
        data: Value,
    },
    Error {
        id: String,
        error: String,
        #[serde(default)]
        code: String,
    },
    /// Pushed event, live or replayed
    ChannelMessage {
        id: String,
        channel: String,
        event_id: u64,
        message: Value,
        timestamp: u64,
    },
    /// The replay window cannot prove the client is up to date; refetch full state
    RefreshNeeded {
        id: String,
        channel: String,
        last_event_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oldest_event_id: Option<u64>,
    },
}

impl Request {
    /// Parse and validate one frame.
    ///
    /// On failure the request id is still returned when it could be read, so the
    /// error response can be correlated.
    pub fn parse(line: &str) -> Result<Self, (String, DaemonError)> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| (String::new(), DaemonError::protocol(format!("Invalid JSON: {e}"))))?;

        let id = value.get("id").and_then(id_to_string).unwrap_or_default();

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err((id, DaemonError::protocol("Request type must be a string"))),
            None if value.is_object() => {
                return Err((id, DaemonError::protocol("Missing request type")))
            }
            None => return Err((id, DaemonError::protocol("Request must be a JSON object"))),
        };
        if !REQUEST_TYPES.contains(&kind.as_str()) {
            return Err((id, DaemonError::protocol(format!("Unknown request type: {kind}"))));
        }

        let request: Request = serde_json::from_value(value)
            .map_err(|e| (id.clone(), DaemonError::protocol(format!("Invalid '{kind}' request: {e}"))))?;
        request.validate().map_err(|e| (id, e))?;
        Ok(request)
    }

    /// Field-level checks serde cannot express
    pub fn validate(&self) -> Result<(), DaemonError> {
        fn non_empty(field: &str, value: &str) -> Result<(), DaemonError> {
            if value.trim().is_empty() {
                Err(DaemonError::protocol(format!("Field '{field}' must not be empty")))
            } else {
                Ok(())
            }
        }

        match self {
            Request::Command(cmd) | Request::Webhook(cmd) => {
                non_empty("photonName", &cmd.photon_name)?;
                non_empty("method", &cmd.method)?;
                if !(cmd.args.is_null() || cmd.args.is_object()) {
                    return Err(DaemonError::protocol("Field 'args' must be an object"));
                }
                Ok(())
            }
            Request::Subscribe { channel, .. }
            | Request::Unsubscribe { channel, .. }
            | Request::Publish { channel, .. }
            | Request::GetEventsSince { channel, .. } => non_empty("channel", channel),
            Request::Reload { photon_name, .. } => non_empty("photonName", photon_name),
            Request::Lock { lock_name, .. } | Request::Unlock { lock_name, .. } => {
                non_empty("lockName", lock_name)
            }
            Request::Schedule {
                photon_name,
                method,
                cron,
                ..
            } => {
                non_empty("photonName", photon_name)?;
                non_empty("method", method)?;
                non_empty("cron", cron)
            }
            Request::Unschedule { job_id, .. } => non_empty("jobId", job_id),
            Request::Ping { .. }
            | Request::Status { .. }
            | Request::ListJobs { .. }
            | Request::Shutdown { .. } => Ok(()),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Request::Command(cmd) | Request::Webhook(cmd) => &cmd.id,
            Request::Ping { id }
            | Request::Subscribe { id, .. }
            | Request::Unsubscribe { id, .. }
            | Request::Publish { id, .. }
            | Request::GetEventsSince { id, .. }
            | Request::Status { id }
            | Request::Reload { id, .. }
            | Request::Lock { id, .. }
            | Request::Unlock { id, .. }
            | Request::Schedule { id, .. }
            | Request::Unschedule { id, .. }
            | Request::ListJobs { id }
            | Request::Shutdown { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "ping",
            Request::Command(_) => "command",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Publish { .. } => "publish",
            Request::GetEventsSince { .. } => "get_events_since",
            Request::Status { .. } => "status",
            Request::Reload { .. } => "reload",
            Request::Lock { .. } => "lock",
            Request::Unlock { .. } => "unlock",
            Request::Schedule { .. } => "schedule",
            Request::Unschedule { .. } => "unschedule",
            Request::ListJobs { .. } => "list_jobs",
            Request::Webhook(_) => "webhook",
            Request::Shutdown { .. } => "shutdown",
        }
    }

    /// Session id and client type, when the request carries them
    pub fn session_hints(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Request::Command(cmd) | Request::Webhook(cmd) => {
                (cmd.session_id.as_deref(), cmd.client_type.as_deref())
            }
            Request::Subscribe { client_type, .. } => (None, client_type.as_deref()),
            _ => (None, None),
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl Response {
    pub fn result(id: impl Into<String>, data: Value) -> Self {
        Response::Result {
            id: id.into(),
            success: None,
            data,
        }
    }

    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Response::Result {
            id: id.into(),
            success: Some(true),
            data,
        }
    }

    pub fn error(id: impl Into<String>, err: &DaemonError) -> Self {
        Response::Error {
            id: id.into(),
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Response::Pong { id }
            | Response::Result { id, .. }
            | Response::Error { id, .. }
            | Response::ChannelMessage { id, .. }
            | Response::RefreshNeeded { id, .. } => id,
        }
    }

    /// Pushes are not correlated with any request
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            Response::ChannelMessage { .. } | Response::RefreshNeeded { .. }
        )
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Fresh id for a pushed notification
pub fn push_id() -> String {
    format!("push_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Text(s) => s,
        StringOrNumber::Unsigned(n) => n.to_string(),
        StringOrNumber::Signed(n) => n.to_string(),
    })
}

fn parse_event_id<E: serde::de::Error>(raw: StringOrNumber) -> Result<u64, E> {
    match raw {
        StringOrNumber::Unsigned(n) => Ok(n),
        StringOrNumber::Signed(n) if n < 0 => Ok(0),
        StringOrNumber::Signed(n) => Ok(n as u64),
        StringOrNumber::Text(s) if s.trim().is_empty() => Ok(0),
        StringOrNumber::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| E::custom(format!("invalid lastEventId '{s}'"))),
    }
}

fn lenient_event_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<StringOrNumber>::deserialize(deserializer)? {
        Some(raw) => parse_event_id(raw).map(Some),
        None => Ok(None),
    }
}

fn required_event_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    parse_event_id(StringOrNumber::deserialize(deserializer)?)
}
