//! Command registry
//!
//! Extension code probes for commands that a headless host never registers,
//! so executing an unknown command logs and resolves to `null`.

use crate::error::{AgentError, Result};
use crate::events::Subscription;
use crate::sync::{read, write};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, warn};

pub const SET_CONTEXT: &str = "setContext";

type CommandCallback = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type CommandMap = RwLock<HashMap<String, (u64, CommandCallback)>>;

pub struct CommandRegistry {
    next_id: AtomicU64,
    commands: Arc<CommandMap>,
    context: RwLock<HashMap<String, Value>>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            commands: Arc::new(RwLock::new(HashMap::new())),
            context: RwLock::new(HashMap::new()),
        }
    }

    /// Register a command; a later registration of the same name replaces it
    pub fn register<F, Fut>(&self, name: &str, callback: F) -> Subscription
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: CommandCallback = Arc::new(move |args| callback(args).boxed());
        if write(&self.commands)
            .insert(name.to_string(), (id, callback))
            .is_some()
        {
            debug!("Command {} re-registered", name);
        }

        let commands: Weak<CommandMap> = Arc::downgrade(&self.commands);
        let name = name.to_string();
        Subscription::new(move || {
            if let Some(commands) = commands.upgrade() {
                let mut commands = write(&commands);
                // Only remove the registration this subscription created
                if commands.get(&name).is_some_and(|(existing, _)| *existing == id) {
                    commands.remove(&name);
                }
            }
        })
    }

    pub fn has(&self, name: &str) -> bool {
        name == SET_CONTEXT || read(&self.commands).contains_key(name)
    }

    /// Registered command names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.commands).keys().cloned().collect();
        names.push(SET_CONTEXT.to_string());
        names.sort();
        names
    }

    pub async fn execute(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        if name == SET_CONTEXT {
            return self.set_context(args);
        }

        let callback = read(&self.commands).get(name).map(|(_, callback)| Arc::clone(callback));
        match callback {
            Some(callback) => callback(args).await,
            None => {
                warn!("Command not found: {}", name);
                Ok(Value::Null)
            }
        }
    }

    fn set_context(&self, args: Vec<Value>) -> Result<Value> {
        let mut args = args.into_iter();
        let key = match args.next() {
            Some(Value::String(key)) => key,
            other => {
                return Err(AgentError::InvalidParams(format!(
                    "setContext expects a string key, got {other:?}"
                )))
            }
        };
        let value = args.next().unwrap_or(Value::Null);
        debug!("Context key {} = {}", key, value);
        write(&self.context).insert(key, value);
        Ok(Value::Null)
    }

    pub fn context_value(&self, key: &str) -> Option<Value> {
        read(&self.context).get(key).cloned()
    }

    pub fn clear_context(&self) {
        write(&self.context).clear();
    }
}
