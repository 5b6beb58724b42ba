//! Built-in loader for declarative photons.
//!
//! A manifest photon is a TOML file (`<name>.photon.toml`):
//!
//! ```toml
//! description = "Shopping list"
//!
//! [state]
//! items = []
//!
//! [[methods]]
//! name = "add"
//! action = "push"
//! field = "items"
//! locked = true            # or a lock name: locked = "list-write"
//! lock_timeout_ms = 500
//!
//! [[methods]]
//! name = "list"
//! action = "get"
//! field = "items"
//! scheduled = "0 * * * *"
//! webhook = true
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{
    Capabilities, LockSpec, MethodDescriptor, PhotonClass, PhotonLoader, PhotonObject,
    PhotonState,
};
use crate::core::scheduler::CronSchedule;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub methods: Vec<ManifestMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMethod {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<LockedFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<String>,
    #[serde(default)]
    pub webhook: bool,
    /// Artificial latency, applied before the action runs
    #[serde(default)]
    pub delay_ms: u64,
    /// Fixed value for `set`, error text for `fail`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LockedFlag {
    Flag(bool),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Get,
    Set,
    Merge,
    Push,
    Remove,
    Increment,
    Clear,
    Echo,
    Fail,
}

impl Action {
    fn needs_field(self) -> bool {
        !matches!(self, Action::Get | Action::Echo | Action::Fail)
    }
}

impl ManifestMethod {
    fn descriptor(&self) -> MethodDescriptor {
        let locked = match &self.locked {
            Some(LockedFlag::Flag(true)) => Some(LockSpec {
                name: self.name.clone(),
                timeout_ms: self.lock_timeout_ms,
            }),
            Some(LockedFlag::Name(name)) => Some(LockSpec {
                name: name.clone(),
                timeout_ms: self.lock_timeout_ms,
            }),
            Some(LockedFlag::Flag(false)) | None => None,
        };
        MethodDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            capabilities: Capabilities {
                locked,
                scheduled: self.scheduled.clone(),
                webhook: self.webhook,
            },
        }
    }
}

impl ManifestDefinition {
    pub fn parse(source: &str) -> Result<Self> {
        let definition: ManifestDefinition =
            toml::from_str(source).map_err(|e| anyhow!("invalid manifest: {}", e))?;
        definition.validate()?;
        Ok(definition)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for method in &self.methods {
            if method.name.trim().is_empty() {
                bail!("method name must not be empty");
            }
            if method.name.starts_with('_') {
                bail!("method '{}': names starting with '_' are reserved", method.name);
            }
            if !seen.insert(method.name.as_str()) {
                bail!("method '{}' is declared twice", method.name);
            }
            match &method.field {
                Some(field) if !self.state.contains_key(field) => {
                    bail!("method '{}' refers to undeclared state field '{}'", method.name, field)
                }
                None if method.action.needs_field() => {
                    bail!("method '{}': action {:?} needs a field", method.name, method.action)
                }
                _ => {}
            }
            if let Some(cron) = &method.scheduled {
                CronSchedule::parse(cron)
                    .map_err(|e| anyhow!("method '{}': {}", method.name, e))?;
            }
        }
        Ok(())
    }
}

/// Loader for TOML manifest photons
#[derive(Debug, Default)]
pub struct ManifestLoader;

impl ManifestLoader {
    pub fn new() -> Self {
        Self
    }
}

impl PhotonLoader for ManifestLoader {
    fn compile(&self, name: &str, source: &str) -> Result<Value> {
        trace!("📜 Compiling manifest photon '{}'", name);
        let definition = ManifestDefinition::parse(source)?;
        Ok(serde_json::to_value(definition)?)
    }

    fn instantiate(&self, _name: &str, artifact: &Value) -> Result<Arc<dyn PhotonClass>> {
        let definition: ManifestDefinition = serde_json::from_value(artifact.clone())?;
        Ok(Arc::new(ManifestClass {
            definition: Arc::new(definition),
        }))
    }
}

pub struct ManifestClass {
    definition: Arc<ManifestDefinition>,
}

impl PhotonClass for ManifestClass {
    fn descriptors(&self) -> Vec<MethodDescriptor> {
        self.definition
            .methods
            .iter()
            .map(ManifestMethod::descriptor)
            .collect()
    }

    fn state_keys(&self) -> Vec<String> {
        self.definition.state.keys().cloned().collect()
    }

    fn construct(&self) -> Box<dyn PhotonObject> {
        Box::new(ManifestObject {
            definition: Arc::clone(&self.definition),
            state: self.definition.state.clone(),
        })
    }
}

pub struct ManifestObject {
    definition: Arc<ManifestDefinition>,
    state: PhotonState,
}

impl ManifestObject {
    fn field_mut(&mut self, method: &ManifestMethod) -> Result<&mut Value> {
        let field = method
            .field
            .as_deref()
            .ok_or_else(|| anyhow!("method '{}' has no field", method.name))?;
        self.state
            .get_mut(field)
            .ok_or_else(|| anyhow!("state field '{}' is missing", field))
    }

    fn default_of(&self, method: &ManifestMethod) -> Value {
        method
            .field
            .as_deref()
            .and_then(|f| self.definition.state.get(f))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn apply(&mut self, method: &ManifestMethod, args: Value) -> Result<Value> {
        match method.action {
            Action::Get => Ok(match method.field.as_deref() {
                Some(field) => self.state.get(field).cloned().unwrap_or(Value::Null),
                None => Value::Object(self.state.clone()),
            }),
            Action::Set => {
                let value = args
                    .get("value")
                    .cloned()
                    .or_else(|| method.value.clone())
                    .unwrap_or(args);
                *self.field_mut(method)? = value.clone();
                Ok(value)
            }
            Action::Merge => {
                let target = self.field_mut(method)?;
                if target.is_null() {
                    *target = Value::Object(Map::new());
                }
                let (Some(target_map), Value::Object(incoming)) = (target.as_object_mut(), args)
                else {
                    bail!("merge needs an object field and object arguments");
                };
                target_map.extend(incoming);
                Ok(target.clone())
            }
            Action::Push => {
                let item = match args {
                    Value::Object(mut map) if map.contains_key("item") => {
                        map.remove("item").unwrap_or(Value::Null)
                    }
                    other => other,
                };
                let target = self.field_mut(method)?;
                let list = target
                    .as_array_mut()
                    .ok_or_else(|| anyhow!("push needs an array field"))?;
                list.push(item);
                Ok(target.clone())
            }
            Action::Remove => {
                let target = self.field_mut(method)?;
                match target {
                    Value::Array(list) => {
                        if let Some(index) = args.get("index").and_then(Value::as_u64) {
                            let index = index as usize;
                            if index >= list.len() {
                                bail!("index {} out of range ({} items)", index, list.len());
                            }
                            list.remove(index);
                        } else if let Some(item) = args.get("item") {
                            list.retain(|v| v != item);
                        } else {
                            bail!("remove needs 'index' or 'item'");
                        }
                    }
                    Value::Object(map) => {
                        let key = args
                            .get("key")
                            .and_then(Value::as_str)
                            .ok_or_else(|| anyhow!("remove needs 'key'"))?;
                        map.remove(key);
                    }
                    _ => bail!("remove needs an array or object field"),
                }
                Ok(target.clone())
            }
            Action::Increment => {
                let by = args.get("by").cloned().unwrap_or(Value::from(1));
                let target = self.field_mut(method)?;
                let next = match (target.as_i64(), by.as_i64()) {
                    (Some(current), Some(by)) => Value::from(current.saturating_add(by)),
                    _ => {
                        let current = target
                            .as_f64()
                            .ok_or_else(|| anyhow!("increment needs a numeric field"))?;
                        let by = by
                            .as_f64()
                            .ok_or_else(|| anyhow!("'by' must be a number"))?;
                        Value::from(current + by)
                    }
                };
                *target = next.clone();
                Ok(next)
            }
            Action::Clear => {
                let default = self.default_of(method);
                *self.field_mut(method)? = default.clone();
                Ok(default)
            }
            Action::Echo => Ok(args),
            Action::Fail => {
                let message = args
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| method.value.as_ref().and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| format!("method '{}' failed", method.name));
                Err(anyhow!(message))
            }
        }
    }
}

#[async_trait]
impl PhotonObject for ManifestObject {
    async fn call(&mut self, method: &str, args: Value) -> Result<Value> {
        let definition = Arc::clone(&self.definition);
        let method = definition
            .methods
            .iter()
            .find(|m| m.name == method)
            .ok_or_else(|| anyhow!("method '{}' not found", method))?;

        if method.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(method.delay_ms)).await;
        }
        self.apply(method, args)
    }

    fn snapshot(&self) -> PhotonState {
        self.state.clone()
    }

    fn restore(&mut self, state: &PhotonState) {
        for (key, value) in state {
            self.state.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photon::migrate_state;
    use serde_json::json;

    const TODO: &str = r#"
description = "todo list"

[state]
items = []
count = 0
meta = {}

[[methods]]
name = "add"
action = "push"
field = "items"
locked = "todo-write"
lock_timeout_ms = 250

[[methods]]
name = "list"
action = "get"
field = "items"
webhook = true

[[methods]]
name = "bump"
action = "increment"
field = "count"
scheduled = "*/5 * * * *"

[[methods]]
name = "tag"
action = "merge"
field = "meta"

[[methods]]
name = "drop"
action = "remove"
field = "items"

[[methods]]
name = "reset"
action = "clear"
field = "items"

[[methods]]
name = "boom"
action = "fail"
value = "kaput"
"#;

    fn class() -> Arc<dyn PhotonClass> {
        let loader = ManifestLoader::new();
        let artifact = loader.compile("todo", TODO).unwrap();
        loader.instantiate("todo", &artifact).unwrap()
    }

    #[test]
    fn test_descriptors_carry_capabilities() {
        let descriptors = class().descriptors();
        let add = descriptors.iter().find(|d| d.name == "add").unwrap();
        assert_eq!(
            add.capabilities.locked,
            Some(LockSpec {
                name: "todo-write".to_string(),
                timeout_ms: Some(250)
            })
        );
        let list = descriptors.iter().find(|d| d.name == "list").unwrap();
        assert!(list.capabilities.webhook);
        assert!(list.capabilities.locked.is_none());
        let bump = descriptors.iter().find(|d| d.name == "bump").unwrap();
        assert_eq!(bump.capabilities.scheduled.as_deref(), Some("*/5 * * * *"));
    }

    #[tokio::test]
    async fn test_actions() {
        let mut obj = class().construct();

        obj.call("add", json!({"item": "milk"})).await.unwrap();
        obj.call("add", json!({"item": "eggs"})).await.unwrap();
        assert_eq!(obj.call("list", json!({})).await.unwrap(), json!(["milk", "eggs"]));

        obj.call("drop", json!({"index": 0})).await.unwrap();
        assert_eq!(obj.call("list", json!({})).await.unwrap(), json!(["eggs"]));

        assert_eq!(obj.call("bump", json!({})).await.unwrap(), json!(1));
        assert_eq!(obj.call("bump", json!({"by": 4})).await.unwrap(), json!(5));

        obj.call("tag", json!({"owner": "ada"})).await.unwrap();
        assert_eq!(obj.snapshot()["meta"], json!({"owner": "ada"}));

        obj.call("reset", json!({})).await.unwrap();
        assert_eq!(obj.snapshot()["items"], json!([]));

        let err = obj.call("boom", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "kaput");
        assert!(obj.call("missing", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_is_shallow_over_declared_keys() {
        let class = class();
        let mut obj = class.construct();
        let mut state = PhotonState::new();
        state.insert("items".to_string(), json!(["kept"]));
        state.insert("gone".to_string(), json!(true));
        obj.restore(&migrate_state(&state, &class.state_keys()));

        let snapshot = obj.snapshot();
        assert_eq!(snapshot["items"], json!(["kept"]));
        assert_eq!(snapshot["count"], json!(0));
        assert!(!snapshot.contains_key("gone"));
    }

    #[test]
    fn test_invalid_manifests() {
        let loader = ManifestLoader::new();
        let undeclared = "[[methods]]\nname = \"x\"\naction = \"push\"\nfield = \"nope\"\n";
        assert!(loader.compile("bad", undeclared).is_err());

        let unknown_action = "[state]\na = 1\n[[methods]]\nname = \"x\"\naction = \"teleport\"\nfield = \"a\"\n";
        assert!(loader.compile("bad", unknown_action).is_err());

        let reserved = "[[methods]]\nname = \"_use\"\naction = \"echo\"\n";
        assert!(loader.compile("bad", reserved).is_err());

        let bad_cron = "[[methods]]\nname = \"x\"\naction = \"echo\"\nscheduled = \"every tuesday\"\n";
        assert!(loader.compile("bad", bad_cron).is_err());
    }
}
