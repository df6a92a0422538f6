//! Diagnostics published by the client, stored per URI

use crate::events::EventEmitter;
use crate::pending::PendingTasks;
use crate::protocol::{Location, Range};
use crate::sync::{read, write};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
    Suggestion,
}

/// Diagnostic as sent by `diagnostics/publish`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolDiagnostic {
    pub location: Location,
    pub message: String,
    pub severity: DiagnosticSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    pub message: String,
    pub severity: DiagnosticSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ProtocolDiagnostic {
    pub fn into_diagnostic(self) -> (String, Diagnostic) {
        (
            self.location.uri,
            Diagnostic {
                range: self.location.range,
                message: self.message,
                severity: self.severity,
                code: self.code,
                source: self.source,
            },
        )
    }
}

pub struct DiagnosticsStore {
    entries: RwLock<HashMap<String, Vec<Diagnostic>>>,
    /// URIs whose diagnostics changed
    pub on_did_change: EventEmitter<Vec<String>>,
}

impl DiagnosticsStore {
    pub fn new(tasks: Arc<PendingTasks>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            on_did_change: EventEmitter::new(tasks),
        }
    }

    /// Replace the diagnostics of every URI present in the batch
    pub fn publish(&self, diagnostics: Vec<ProtocolDiagnostic>) -> Vec<String> {
        let mut grouped: BTreeMap<String, Vec<Diagnostic>> = BTreeMap::new();
        for diagnostic in diagnostics {
            let (uri, diagnostic) = diagnostic.into_diagnostic();
            grouped.entry(uri).or_default().push(diagnostic);
        }

        let uris: Vec<String> = grouped.keys().cloned().collect();
        {
            let mut entries = write(&self.entries);
            for (uri, diagnostics) in grouped {
                entries.insert(uri, diagnostics);
            }
        }
        if !uris.is_empty() {
            self.on_did_change.fire(uris.clone());
        }
        uris
    }

    pub fn set(&self, uri: &str, diagnostics: Vec<Diagnostic>) {
        write(&self.entries).insert(uri.to_string(), diagnostics);
        self.on_did_change.fire(vec![uri.to_string()]);
    }

    pub fn get(&self, uri: &str) -> Vec<Diagnostic> {
        read(&self.entries).get(uri).cloned().unwrap_or_default()
    }

    /// Every URI with its diagnostics, sorted by URI
    pub fn all(&self) -> Vec<(String, Vec<Diagnostic>)> {
        let mut all: Vec<_> = read(&self.entries)
            .iter()
            .map(|(uri, diagnostics)| (uri.clone(), diagnostics.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn clear(&self) {
        write(&self.entries).clear();
    }
}
