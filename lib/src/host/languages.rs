//! Language feature provider registries
//!
//! Providers are keyed by registration id, not by selector: registering the
//! same selector twice yields two providers. Each registry exposes add/remove
//! events so the dispatcher can mirror registrations to the client.

use crate::documents::AgentTextDocument;
use crate::error::Result;
use crate::events::EventEmitter;
use crate::pending::PendingTasks;
use crate::protocol::{Position, Range};
use crate::sync::{read, write};
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

/// One clause of a document selector; every present field must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl DocumentFilter {
    pub fn language(language: &str) -> Self {
        Self {
            language: Some(language.to_string()),
            ..Default::default()
        }
    }
}

/// A document matches when any filter matches
#[derive(Debug, Clone, Default)]
pub struct DocumentSelector {
    filters: Vec<(DocumentFilter, Option<GlobMatcher>)>,
}

impl DocumentSelector {
    pub fn new(filters: Vec<DocumentFilter>) -> Self {
        let filters = filters
            .into_iter()
            .map(|filter| {
                let matcher = filter.pattern.as_deref().and_then(|pattern| {
                    Glob::new(pattern)
                        .map(|glob| glob.compile_matcher())
                        .map_err(|e| warn!("Ignoring invalid selector pattern {}: {}", pattern, e))
                        .ok()
                });
                (filter, matcher)
            })
            .collect();
        Self { filters }
    }

    /// Matches every document
    pub fn all() -> Self {
        Self::new(vec![DocumentFilter {
            language: Some("*".to_string()),
            ..Default::default()
        }])
    }

    pub fn matches(&self, document: &AgentTextDocument) -> bool {
        let url = Url::parse(&document.uri).ok();
        self.filters.iter().any(|(filter, matcher)| {
            let language_ok = filter
                .language
                .as_deref()
                .map_or(true, |language| language == "*" || language == document.language_id);
            let scheme_ok = filter
                .scheme
                .as_deref()
                .map_or(true, |scheme| url.as_ref().is_some_and(|url| url.scheme() == scheme));
            let pattern_ok = match (&filter.pattern, matcher) {
                (None, _) => true,
                (Some(_), Some(matcher)) => url
                    .as_ref()
                    .map(|url| matcher.is_match(url.path()))
                    .unwrap_or(false),
                (Some(_), None) => false,
            };
            language_ok && scheme_ok && pattern_ok
        })
    }
}

/// Registration change carried by provider add/remove events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderEvent {
    pub id: u64,
}

pub struct ProviderRegistry<P: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, DocumentSelector, Arc<P>)>>,
    pub on_did_add: EventEmitter<ProviderEvent>,
    pub on_did_remove: EventEmitter<ProviderEvent>,
}

impl<P: ?Sized + Send + Sync> ProviderRegistry<P> {
    pub fn new(tasks: Arc<PendingTasks>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
            on_did_add: EventEmitter::new(Arc::clone(&tasks)),
            on_did_remove: EventEmitter::new(tasks),
        }
    }

    pub fn register(&self, selector: DocumentSelector, provider: Arc<P>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        write(&self.entries).push((id, selector, provider));
        self.on_did_add.fire(ProviderEvent { id });
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let removed = {
            let mut entries = write(&self.entries);
            let before = entries.len();
            entries.retain(|(existing, _, _)| *existing != id);
            entries.len() != before
        };
        if removed {
            self.on_did_remove.fire(ProviderEvent { id });
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<Arc<P>> {
        read(&self.entries)
            .iter()
            .find(|(existing, _, _)| *existing == id)
            .map(|(_, _, provider)| Arc::clone(provider))
    }

    /// Providers whose selector matches, in registration order
    pub fn providers_for(&self, document: &AgentTextDocument) -> Vec<Arc<P>> {
        read(&self.entries)
            .iter()
            .filter(|(_, selector, _)| selector.matches(document))
            .map(|(_, _, provider)| Arc::clone(provider))
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub title: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeLens {
    pub range: Range,
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeAction {
    pub title: String,
    pub kind: Option<String>,
    pub command: Option<Command>,
    pub is_preferred: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    Automatic,
    Invoke,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineCompletionItem {
    pub insert_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldingRange {
    pub start: u32,
    pub end: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[async_trait]
pub trait CodeLensProvider: Send + Sync {
    async fn provide_code_lenses(
        &self,
        document: &AgentTextDocument,
        token: CancellationToken,
    ) -> Result<Vec<CodeLens>>;

    /// Fires when the provider's lenses may have changed
    fn on_did_change(&self) -> Option<&EventEmitter<()>> {
        None
    }
}

#[async_trait]
pub trait CodeActionProvider: Send + Sync {
    async fn provide_code_actions(
        &self,
        document: &AgentTextDocument,
        range: Range,
        trigger: TriggerKind,
        token: CancellationToken,
    ) -> Result<Vec<CodeAction>>;
}

#[async_trait]
pub trait InlineCompletionProvider: Send + Sync {
    async fn provide_inline_completions(
        &self,
        document: &AgentTextDocument,
        position: Position,
        trigger: TriggerKind,
        token: CancellationToken,
    ) -> Result<Vec<InlineCompletionItem>>;
}

#[async_trait]
pub trait FoldingRangeProvider: Send + Sync {
    async fn provide_folding_ranges(
        &self,
        document: &AgentTextDocument,
        token: CancellationToken,
    ) -> Result<Vec<FoldingRange>>;
}

pub struct Languages {
    pub code_lenses: ProviderRegistry<dyn CodeLensProvider>,
    pub code_actions: ProviderRegistry<dyn CodeActionProvider>,
    pub inline_completions: ProviderRegistry<dyn InlineCompletionProvider>,
    pub folding_ranges: ProviderRegistry<dyn FoldingRangeProvider>,
}

impl Languages {
    pub fn new(tasks: Arc<PendingTasks>) -> Self {
        Self {
            code_lenses: ProviderRegistry::new(Arc::clone(&tasks)),
            code_actions: ProviderRegistry::new(Arc::clone(&tasks)),
            inline_completions: ProviderRegistry::new(Arc::clone(&tasks)),
            folding_ranges: ProviderRegistry::new(tasks),
        }
    }
}

/// Icon reference found in a title, at a character offset of the stripped text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleIcon {
    pub value: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayTitle {
    pub text: String,
    pub icons: Vec<TitleIcon>,
}

fn icon_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\(([^)]*)\)").ok())
        .as_ref()
}

/// Split `$(icon)` markup out of a title
pub fn strip_icons(title: &str) -> DisplayTitle {
    let mut text = String::with_capacity(title.len());
    let mut icons = Vec::new();
    let mut last = 0;
    let Some(pattern) = icon_pattern() else {
        return DisplayTitle {
            text: title.to_string(),
            icons,
        };
    };
    for captures in pattern.captures_iter(title) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        text.push_str(&title[last..whole.start()]);
        icons.push(TitleIcon {
            value: format!("$({})", name.as_str()),
            position: text.chars().count(),
        });
        last = whole.end();
    }
    text.push_str(&title[last..]);
    DisplayTitle { text, icons }
}

/// Code lens in the shape `codeLenses/display` carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolCodeLens {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<ProtocolCommand>,
    pub is_resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolCommand {
    pub title: DisplayTitle,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl From<&CodeLens> for ProtocolCodeLens {
    fn from(lens: &CodeLens) -> Self {
        Self {
            range: lens.range,
            command: lens.command.as_ref().map(|command| ProtocolCommand {
                title: strip_icons(&command.title),
                command: command.command.clone(),
                arguments: command.arguments.clone(),
            }),
            is_resolved: lens.command.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoLenses;

    #[async_trait]
    impl CodeLensProvider for NoLenses {
        async fn provide_code_lenses(
            &self,
            _document: &AgentTextDocument,
            _token: CancellationToken,
        ) -> Result<Vec<CodeLens>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_strip_icons() {
        let title = strip_icons("$(sync~spin) Editing $(check)done");
        assert_eq!(title.text, " Editing done");
        assert_eq!(
            title.icons,
            vec![
                TitleIcon {
                    value: "$(sync~spin)".to_string(),
                    position: 0
                },
                TitleIcon {
                    value: "$(check)".to_string(),
                    position: 9
                },
            ]
        );
        assert!(strip_icons("plain").icons.is_empty());
    }

    #[test]
    fn test_selector_matching() {
        let document = AgentTextDocument::new("file:///src/app.ts", Some(String::new()));
        assert!(DocumentSelector::new(vec![DocumentFilter::language("typescript")]).matches(&document));
        assert!(!DocumentSelector::new(vec![DocumentFilter::language("rust")]).matches(&document));
        assert!(DocumentSelector::all().matches(&document));

        let by_pattern = DocumentSelector::new(vec![DocumentFilter {
            scheme: Some("file".to_string()),
            pattern: Some("**/*.ts".to_string()),
            ..Default::default()
        }]);
        assert!(by_pattern.matches(&document));

        let untitled = DocumentSelector::new(vec![DocumentFilter {
            scheme: Some("untitled".to_string()),
            ..Default::default()
        }]);
        assert!(!untitled.matches(&document));
    }

    #[test]
    fn test_registry_keys_by_registration() {
        let registry: ProviderRegistry<dyn CodeLensProvider> =
            ProviderRegistry::new(PendingTasks::new(false));
        let first = registry.register(DocumentSelector::all(), Arc::new(NoLenses));
        let second = registry.register(DocumentSelector::all(), Arc::new(NoLenses));
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(first));
        assert!(!registry.unregister(first));
        assert!(registry.get(second).is_some());

        let document = AgentTextDocument::new("file:///a.rs", None);
        assert_eq!(registry.providers_for(&document).len(), 1);
    }
}
