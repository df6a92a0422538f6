//! Layered configuration resolver
//!
//! Values resolve in this order:
//!
//! 1. in-memory overrides written through [`ConfigurationResolver::update`]
//! 2. the client's custom configuration map
//! 3. keys computed from the latest client info and extension configuration
//! 4. a section rebuilt from dotted override/custom keys below it
//! 5. static defaults
//!
//! Stored keys are dotted paths. A section request splits the stored keys on
//! their dots, but never splits keys found inside stored values: provider
//! identifiers are dotted strings and must stay whole.

use crate::capabilities::Capability;
use crate::protocol::{ClientInfo, ExtensionConfiguration};
use crate::sync::{read, write};
use serde_json::{json, Map, Value};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Telemetry is always reported through the agent
const TELEMETRY_LEVEL: &str = "agent";

pub struct ConfigurationResolver {
    namespace: String,
    overrides: RwLock<Map<String, Value>>,
    client: RwLock<ClientInfo>,
}

impl ConfigurationResolver {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            overrides: RwLock::new(Map::new()),
            client: RwLock::new(ClientInfo::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_client_info(&self, client: ClientInfo) {
        *write(&self.client) = client;
    }

    pub fn set_extension_configuration(&self, configuration: ExtensionConfiguration) {
        write(&self.client).extension_configuration = Some(configuration);
    }

    fn custom(&self) -> Map<String, Value> {
        read(&self.client)
            .extension_configuration
            .as_ref()
            .and_then(|config| config.custom_configuration.clone())
            .unwrap_or_default()
    }

    /// Resolve a dotted key or section; `None` when nothing provides it
    pub fn get(&self, section: &str) -> Option<Value> {
        if let Some(value) = read(&self.overrides).get(section) {
            return Some(value.clone());
        }
        let custom = self.custom();
        if let Some(value) = custom.get(section) {
            return Some(value.clone());
        }
        if let Some(value) = self.special(section) {
            return Some(value);
        }
        if let Some(value) = self.section(section, &custom) {
            return Some(value);
        }
        self.default_value(section)
    }

    pub fn get_or(&self, section: &str, default: Value) -> Value {
        self.get(section).unwrap_or(default)
    }

    /// True when some stored key starts with `section`
    pub fn has(&self, section: &str) -> bool {
        read(&self.overrides)
            .keys()
            .chain(self.custom().keys())
            .any(|key| key.starts_with(section))
    }

    /// Write an override; there is no way to remove one
    pub fn update(&self, section: &str, value: Value) {
        debug!("Configuration override {} = {}", section, value);
        write(&self.overrides).insert(section.to_string(), value);
    }

    /// Values derived from client state, recomputed on every read
    fn special(&self, section: &str) -> Option<Value> {
        let key = section
            .strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix('.'));
        let client = read(&self.client);
        let extension = client.extension_configuration.as_ref();

        if section == "http.proxy" {
            return extension.and_then(|e| e.proxy.clone()).map(Value::String);
        }

        let key = key?;
        if let Some(capability) = key.strip_prefix("agent.capabilities.") {
            return Capability::ALL
                .into_iter()
                .find(|candidate| candidate.wire_name() == capability)
                .map(|candidate| Value::Bool(client.capabilities.supports(candidate)));
        }

        match key {
            "serverEndpoint" => extension.map(|e| Value::String(e.server_endpoint.clone())),
            "proxy" => extension.and_then(|e| e.proxy.clone()).map(Value::String),
            "telemetry.level" => Some(Value::String(TELEMETRY_LEVEL.to_string())),
            "autocomplete.enabled" => Some(Value::Bool(true)),
            "autocomplete.advanced.provider" => extension
                .and_then(|e| e.autocomplete_advanced_provider.clone())
                .map(Value::String),
            "autocomplete.advanced.model" => extension
                .and_then(|e| e.autocomplete_advanced_model.clone())
                .map(Value::String),
            "debug.verbose" => extension.and_then(|e| e.verbose_debug).map(Value::Bool),
            "codebase" => extension.and_then(|e| e.codebase.clone()).map(Value::String),
            "agent.ide.name" => Some(Value::String(ide_display_name(&client.name))),
            "agent.ide.version" => client.ide_version.clone().map(Value::String),
            "agent.extension.version" => Some(Value::String(client.version.clone())),
            _ => None,
        }
    }

    /// Rebuild a section from stored keys below it, or descend into a stored
    /// value whose key is a prefix of `section`
    fn section(&self, section: &str, custom: &Map<String, Value>) -> Option<Value> {
        let overrides = read(&self.overrides);
        let prefix = format!("{section}.");

        let mut object = Map::new();
        // Custom first so overrides win on conflicts
        for (key, value) in custom.iter().chain(overrides.iter()) {
            if let Some(rest) = key.strip_prefix(&prefix) {
                insert_path(&mut object, rest, value.clone());
            }
        }
        if !object.is_empty() {
            return Some(Value::Object(object));
        }

        for (key, value) in overrides.iter().chain(custom.iter()) {
            if let Some(rest) = section
                .strip_prefix(key.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
            {
                return descend(value, rest);
            }
        }
        None
    }

    fn default_value(&self, section: &str) -> Option<Value> {
        let value = match section {
            "editor.insertSpaces" => json!(true),
            "editor.tabSize" => json!(4),
            "files.exclude" | "search.exclude" => json!({}),
            _ => {
                let key = section
                    .strip_prefix(&self.namespace)
                    .and_then(|rest| rest.strip_prefix('.'))?;
                match key {
                    "debug.verbose" => json!(false),
                    "codeActions.enabled" => json!(true),
                    "commandCodeLenses" => json!(false),
                    "chat.preInstruction" => json!(""),
                    "autocomplete.languages" => json!({ "*": true }),
                    _ => return None,
                }
            }
        };
        Some(value)
    }
}

/// Insert `value` at a dotted path, creating intermediate objects
fn insert_path(object: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            object.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = object
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

fn descend(value: &Value, path: &str) -> Option<Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
        .cloned()
}

fn ide_display_name(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "vscode" => "VSCode".to_string(),
        "jetbrains" => "JetBrains".to_string(),
        "emacs" => "Emacs".to_string(),
        "neovim" => "Neovim".to_string(),
        _ => name.to_string(),
    }
}

/// View of the resolver below an optional section prefix
#[derive(Clone)]
pub struct ScopedConfiguration {
    resolver: Arc<ConfigurationResolver>,
    prefix: Option<String>,
}

impl ScopedConfiguration {
    /// Language sections such as `[jsonc]` fall back to the unscoped view
    pub fn new(resolver: Arc<ConfigurationResolver>, section: Option<&str>) -> Self {
        let prefix = section
            .filter(|section| !section.is_empty() && !section.starts_with('['))
            .map(str::to_string);
        Self { resolver, prefix }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn full_key(&self, key: &str) -> String {
        match (&self.prefix, key.is_empty()) {
            (Some(prefix), true) => prefix.clone(),
            (Some(prefix), false) => format!("{prefix}.{key}"),
            (None, _) => key.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.resolver.get(&self.full_key(key))
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.resolver.get_or(&self.full_key(key), default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.resolver.has(&self.full_key(key))
    }

    pub fn update(&self, key: &str, value: Value) {
        self.resolver.update(&self.full_key(key), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ClientCapabilities, Toggle};

    fn resolver_with_custom(custom: Value) -> ConfigurationResolver {
        let resolver = ConfigurationResolver::new("assistant");
        let Value::Object(custom) = custom else {
            panic!("custom configuration must be an object");
        };
        resolver.set_client_info(ClientInfo {
            name: "neovim".to_string(),
            version: "1.2.3".to_string(),
            extension_configuration: Some(ExtensionConfiguration {
                server_endpoint: "https://example.com/".to_string(),
                custom_configuration: Some(custom),
                ..Default::default()
            }),
            ..Default::default()
        });
        resolver
    }

    #[test]
    fn test_nested_dotted_keys_are_not_split() {
        let resolver = resolver_with_custom(json!({"foo.bar": {"baz.qux": true}}));
        assert_eq!(resolver.get("foo.bar.baz.qux"), None);
        assert_eq!(resolver.get("foo"), Some(json!({"bar": {"baz.qux": true}})));
        assert_eq!(resolver.get("foo.bar"), Some(json!({"baz.qux": true})));
    }

    #[test]
    fn test_section_descends_into_plain_keys() {
        let resolver = resolver_with_custom(json!({"a": {"b": {"c": 1}}}));
        assert_eq!(resolver.get("a.b.c"), Some(json!(1)));
        assert_eq!(resolver.get("a.missing"), None);
    }

    #[test]
    fn test_override_beats_custom_beats_special() {
        let resolver = resolver_with_custom(json!({
            "assistant.serverEndpoint": "https://custom.example.com/",
            "shared.key": "custom"
        }));
        assert_eq!(resolver.get("shared.key"), Some(json!("custom")));
        assert_eq!(
            resolver.get("assistant.serverEndpoint"),
            Some(json!("https://custom.example.com/"))
        );

        resolver.update("shared.key", json!("override"));
        resolver.update("assistant.serverEndpoint", json!("https://override.example.com/"));
        assert_eq!(resolver.get("shared.key"), Some(json!("override")));
        assert_eq!(
            resolver.get("assistant.serverEndpoint"),
            Some(json!("https://override.example.com/"))
        );

        // Sections merge both layers with overrides winning
        assert_eq!(resolver.get("shared"), Some(json!({"key": "override"})));
    }

    #[test]
    fn test_special_keys_follow_client_state() {
        let resolver = resolver_with_custom(json!({}));
        assert_eq!(resolver.get("assistant.telemetry.level"), Some(json!("agent")));
        assert_eq!(resolver.get("assistant.agent.ide.name"), Some(json!("Neovim")));
        assert_eq!(
            resolver.get("assistant.serverEndpoint"),
            Some(json!("https://example.com/"))
        );
        assert_eq!(
            resolver.get("assistant.agent.capabilities.codeLenses"),
            Some(json!(false))
        );

        resolver.set_client_info(ClientInfo {
            name: "vscode".to_string(),
            capabilities: ClientCapabilities {
                code_lenses: Toggle::Enabled,
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(resolver.get("assistant.agent.ide.name"), Some(json!("VSCode")));
        assert_eq!(
            resolver.get("assistant.agent.capabilities.codeLenses"),
            Some(json!(true))
        );
    }

    #[test]
    fn test_defaults_and_has() {
        let resolver = resolver_with_custom(json!({"assistant.chat.model": "x"}));
        assert_eq!(resolver.get("editor.tabSize"), Some(json!(4)));
        assert_eq!(resolver.get("assistant.debug.verbose"), Some(json!(false)));
        assert_eq!(resolver.get("unknown.key"), None);
        assert_eq!(resolver.get_or("unknown.key", json!(7)), json!(7));

        assert!(resolver.has("assistant.chat"));
        assert!(resolver.has("assistant.ch"));
        assert!(!resolver.has("editor"));
    }

    #[test]
    fn test_scoped_configuration() {
        let resolver = Arc::new(resolver_with_custom(json!({"assistant.chat.model": "x"})));
        let scoped = ScopedConfiguration::new(Arc::clone(&resolver), Some("assistant"));
        assert_eq!(scoped.get("chat.model"), Some(json!("x")));
        assert_eq!(scoped.get("telemetry.level"), Some(json!("agent")));

        scoped.update("chat.model", json!("y"));
        assert_eq!(resolver.get("assistant.chat.model"), Some(json!("y")));

        let language = ScopedConfiguration::new(Arc::clone(&resolver), Some("[jsonc]"));
        assert_eq!(language.prefix(), None);
        assert_eq!(language.get("editor.tabSize"), Some(json!(4)));
    }

    #[test]
    fn test_returned_values_are_copies() {
        let resolver = resolver_with_custom(json!({}));
        resolver.update("list", json!([1, 2]));
        let mut value = resolver.get("list").unwrap();
        value.as_array_mut().unwrap().push(json!(3));
        assert_eq!(resolver.get("list"), Some(json!([1, 2])));
    }
}
