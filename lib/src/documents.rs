//! Document and editor state
//!
//! The [`DocumentManager`] owns every open document, applies incremental edits
//! sent by the client, and keeps the active/visible editor views. All map
//! mutations happen inside one synchronous section so concurrent handlers
//! cannot lose updates; events are fired afterwards.

use crate::events::EventEmitter;
use crate::pending::PendingTasks;
use crate::protocol::{ContentChange, Position, ProtocolTextDocument, Range};
use crate::sync::{read, write};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A document as the agent knows it
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTextDocument {
    pub uri: String,
    pub language_id: String,
    pub version: u64,
    content: Option<String>,
    pub selection: Option<Range>,
    pub visible_range: Option<Range>,
}

impl AgentTextDocument {
    pub fn new(uri: impl Into<String>, content: Option<String>) -> Self {
        let uri = uri.into();
        Self {
            language_id: language_id_for_uri(&uri).to_string(),
            uri,
            version: 1,
            content,
            selection: None,
            visible_range: None,
        }
    }

    /// `None` when the client focused the document without sending content
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    pub fn line_count(&self) -> usize {
        self.text().split('\n').count()
    }

    pub fn offset_at(&self, position: Position) -> usize {
        offset_at(self.text(), position)
    }

    pub fn position_at(&self, offset: usize) -> Position {
        position_at(self.text(), offset)
    }

    /// Text inside `range`, or the whole document
    pub fn get_text(&self, range: Option<Range>) -> String {
        let text = self.text();
        match range {
            None => text.to_string(),
            Some(range) => {
                let start = offset_at(text, range.start);
                let end = offset_at(text, range.end);
                text[start.min(end)..start.max(end)].to_string()
            }
        }
    }

    pub fn to_protocol(&self) -> ProtocolTextDocument {
        ProtocolTextDocument {
            uri: self.uri.clone(),
            content: self.content.clone(),
            language_id: Some(self.language_id.clone()),
            selection: self.selection,
            visible_range: self.visible_range,
            content_changes: None,
        }
    }
}

fn language_id_for_uri(uri: &str) -> &'static str {
    let extension = uri
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, extension)| extension)
        .unwrap_or_default();
    match extension {
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "rs" => "rust",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "cs" => "csharp",
        "md" => "markdown",
        "json" => "json",
        "jsonc" => "jsonc",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "html" => "html",
        "css" => "css",
        "sh" => "shellscript",
        _ => "plaintext",
    }
}

/// Byte offsets of every line start
fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(index, _)| index + 1))
        .collect()
}

/// Byte offset of a UTF-16 based position, clamped to the line and document
pub fn offset_at(text: &str, position: Position) -> usize {
    let starts = line_starts(text);
    let Some(&line_start) = starts.get(position.line as usize) else {
        return text.len();
    };
    let line_end = starts
        .get(position.line as usize + 1)
        .map(|next| next - 1)
        .unwrap_or(text.len());
    let line = text[line_start..line_end].trim_end_matches('\r');

    let mut units = 0u32;
    for (index, ch) in line.char_indices() {
        if units >= position.character {
            return line_start + index;
        }
        units += ch.len_utf16() as u32;
    }
    line_start + line.len()
}

/// Position of a byte offset, clamped to the document
pub fn position_at(text: &str, offset: usize) -> Position {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    let before = &text[..offset];
    let line = before.matches('\n').count();
    let line_start = before.rfind('\n').map(|index| index + 1).unwrap_or(0);
    Position {
        line: line as u32,
        character: text[line_start..offset].encode_utf16().count() as u32,
    }
}

/// Normalized change, in the shape the host's change event carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentContentChange {
    pub range: Range,
    /// Offset of `range.start` in UTF-16 code units
    pub range_offset: usize,
    /// Length of the replaced text in UTF-16 code units
    pub range_length: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextDocumentChangeEvent {
    pub document: AgentTextDocument,
    pub content_changes: Vec<TextDocumentContentChange>,
}

/// Apply edits one after another; each range refers to the text produced by
/// the previous edit
pub fn apply_content_changes(
    text: &str,
    changes: &[ContentChange],
) -> (String, Vec<TextDocumentContentChange>) {
    let mut current = text.to_string();
    let mut normalized = Vec::with_capacity(changes.len());

    for change in changes {
        let a = offset_at(&current, change.range.start);
        let b = offset_at(&current, change.range.end);
        let (start, end) = (a.min(b), a.max(b));

        normalized.push(TextDocumentContentChange {
            range: Range::new(position_at(&current, start), position_at(&current, end)),
            range_offset: current[..start].encode_utf16().count(),
            range_length: current[start..end].encode_utf16().count(),
            text: change.text.clone(),
        });
        current.replace_range(start..end, &change.text);
    }

    (current, normalized)
}

/// Smallest single replacement turning `old` into `new`
pub fn diff_content(old: &str, new: &str) -> Option<TextDocumentContentChange> {
    if old == new {
        return None;
    }

    let prefix = old
        .char_indices()
        .zip(new.chars())
        .take_while(|((_, a), b)| a == b)
        .last()
        .map(|((index, ch), _)| index + ch.len_utf8())
        .unwrap_or(0);

    let max_suffix = (old.len() - prefix).min(new.len() - prefix);
    let suffix = old[prefix..]
        .chars()
        .rev()
        .zip(new[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(ch, _)| ch.len_utf8())
        .scan(0usize, |total, len| {
            *total += len;
            Some(*total)
        })
        .take_while(|total| *total <= max_suffix)
        .last()
        .unwrap_or(0);

    let old_end = old.len() - suffix;
    let new_end = new.len() - suffix;
    Some(TextDocumentContentChange {
        range: Range::new(position_at(old, prefix), position_at(old, old_end)),
        range_offset: old[..prefix].encode_utf16().count(),
        range_length: old[prefix..old_end].encode_utf16().count(),
        text: new[prefix..new_end].to_string(),
    })
}

/// The client and the agent disagree about a document's content
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDivergence {
    pub uri: String,
    /// What the client says the document contains
    pub expected: String,
    /// What applying the client's edits produced
    pub actual: String,
}

impl DocumentDivergence {
    /// Human-readable report pointing at the first differing line
    pub fn describe(&self) -> String {
        let first_difference = self
            .expected
            .lines()
            .zip(self.actual.lines())
            .position(|(expected, actual)| expected != actual)
            .unwrap_or_else(|| self.expected.lines().count().min(self.actual.lines().count()));
        let expected_line = self.expected.lines().nth(first_difference).unwrap_or_default();
        let actual_line = self.actual.lines().nth(first_difference).unwrap_or_default();
        format!(
            "Document {} diverged from the client at line {}:\n  client: {:?}\n  agent:  {:?}",
            self.uri,
            first_difference + 1,
            expected_line,
            actual_line
        )
    }
}

/// Result of loading a document with incremental changes
#[derive(Debug, Clone)]
pub struct DocumentUpdate {
    pub document: AgentTextDocument,
    pub event: TextDocumentChangeEvent,
    pub divergence: Option<DocumentDivergence>,
}

/// An editor showing one document
#[derive(Debug, Clone, PartialEq)]
pub struct TextEditor {
    pub uri: String,
    pub selection: Range,
    pub visible_ranges: Vec<Range>,
}

#[derive(Debug, Default)]
struct EditorState {
    active: Option<TextEditor>,
    visible: Vec<TextEditor>,
}

pub struct DocumentManager {
    documents: RwLock<HashMap<String, AgentTextDocument>>,
    editors: RwLock<EditorState>,
    pub on_did_open: EventEmitter<AgentTextDocument>,
    pub on_did_change: EventEmitter<TextDocumentChangeEvent>,
    pub on_did_close: EventEmitter<AgentTextDocument>,
    pub on_did_save: EventEmitter<AgentTextDocument>,
    pub on_did_change_active_editor: EventEmitter<Option<TextEditor>>,
    pub on_did_change_visible_editors: EventEmitter<Vec<TextEditor>>,
}

impl DocumentManager {
    pub fn new(tasks: Arc<PendingTasks>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            editors: RwLock::new(EditorState::default()),
            on_did_open: EventEmitter::new(Arc::clone(&tasks)),
            on_did_change: EventEmitter::new(Arc::clone(&tasks)),
            on_did_close: EventEmitter::new(Arc::clone(&tasks)),
            on_did_save: EventEmitter::new(Arc::clone(&tasks)),
            on_did_change_active_editor: EventEmitter::new(Arc::clone(&tasks)),
            on_did_change_visible_editors: EventEmitter::new(tasks),
        }
    }

    /// Store a snapshot; missing content keeps what was known before
    pub fn load_document(&self, document: &ProtocolTextDocument) -> AgentTextDocument {
        let mut documents = write(&self.documents);
        let stored = documents
            .entry(document.uri.clone())
            .and_modify(|existing| {
                existing.version += 1;
                if let Some(content) = &document.content {
                    existing.content = Some(content.clone());
                }
            })
            .or_insert_with(|| AgentTextDocument::new(&document.uri, document.content.clone()));
        Self::apply_metadata(stored, document);
        stored.clone()
    }

    /// Apply the client's edits to the stored content
    ///
    /// When the client also sends the content it expects, a mismatch is
    /// reported as a divergence and the client's content wins so both sides
    /// are in sync again.
    pub fn load_document_with_changes(&self, document: &ProtocolTextDocument) -> DocumentUpdate {
        let mut documents = write(&self.documents);
        let previous = documents
            .get(&document.uri)
            .and_then(|existing| existing.content.clone())
            .unwrap_or_default();

        let (content, content_changes, divergence) = match &document.content_changes {
            Some(changes) if !changes.is_empty() => {
                let (computed, normalized) = apply_content_changes(&previous, changes);
                match &document.content {
                    Some(expected) if *expected != computed => (
                        expected.clone(),
                        normalized,
                        Some(DocumentDivergence {
                            uri: document.uri.clone(),
                            expected: expected.clone(),
                            actual: computed,
                        }),
                    ),
                    _ => (computed, normalized, None),
                }
            }
            _ => match &document.content {
                Some(content) => {
                    let change = diff_content(&previous, content);
                    (content.clone(), change.into_iter().collect(), None)
                }
                None => (previous, Vec::new(), None),
            },
        };

        let stored = documents
            .entry(document.uri.clone())
            .and_modify(|existing| existing.version += 1)
            .or_insert_with(|| AgentTextDocument::new(&document.uri, None));
        stored.content = Some(content);
        Self::apply_metadata(stored, document);

        let snapshot = stored.clone();
        DocumentUpdate {
            event: TextDocumentChangeEvent {
                document: snapshot.clone(),
                content_changes,
            },
            document: snapshot,
            divergence,
        }
    }

    fn apply_metadata(stored: &mut AgentTextDocument, document: &ProtocolTextDocument) {
        if let Some(language_id) = &document.language_id {
            stored.language_id = language_id.clone();
        }
        if document.selection.is_some() {
            stored.selection = document.selection;
        }
        if document.visible_range.is_some() {
            stored.visible_range = document.visible_range;
        }
    }

    pub fn get(&self, uri: &str) -> Option<AgentTextDocument> {
        read(&self.documents).get(uri).cloned()
    }

    /// All documents sorted by URI
    pub fn all(&self) -> Vec<AgentTextDocument> {
        let mut documents: Vec<_> = read(&self.documents).values().cloned().collect();
        documents.sort_by(|a, b| a.uri.cmp(&b.uri));
        documents
    }

    pub fn len(&self) -> usize {
        read(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, uri: &str) -> Option<AgentTextDocument> {
        write(&self.documents).remove(uri)
    }

    pub fn new_text_editor(&self, document: &AgentTextDocument) -> TextEditor {
        TextEditor {
            uri: document.uri.clone(),
            selection: document.selection.unwrap_or_default(),
            visible_ranges: document.visible_range.into_iter().collect(),
        }
    }

    pub fn active_text_editor(&self) -> Option<TextEditor> {
        read(&self.editors).active.clone()
    }

    pub fn visible_text_editors(&self) -> Vec<TextEditor> {
        read(&self.editors).visible.clone()
    }

    /// Replace the active editor and wait until every listener has seen it
    pub async fn set_active_text_editor(&self, editor: Option<TextEditor>) {
        let visible: Vec<TextEditor> = editor.iter().cloned().collect();
        {
            let mut editors = write(&self.editors);
            editors.active = editor.clone();
            editors.visible = visible.clone();
        }
        self.on_did_change_active_editor.fire_and_wait(editor).await;
        self.on_did_change_visible_editors
            .fire_and_wait(visible)
            .await;
    }

    /// Forget every document and editor
    pub fn reset(&self) {
        write(&self.documents).clear();
        *write(&self.editors) = EditorState::default();
    }
}
