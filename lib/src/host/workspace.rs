//! Workspace facade: folders, file search, documents, configuration, edits
//! and disk access

use super::HostContext;
use crate::capabilities::Capability;
use crate::client::WorkspaceEditParams;
use crate::configuration::ScopedConfiguration;
use crate::documents::AgentTextDocument;
use crate::error::{AgentError, Result};
use crate::events::EventEmitter;
use crate::pending::PendingTasks;
use crate::protocol::ProtocolTextDocument;
use crate::sync::{read, write};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use url::Url;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFolder {
    pub name: String,
    pub uri: String,
    pub index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceFoldersChangeEvent {
    pub added: Vec<WorkspaceFolder>,
    pub removed: Vec<WorkspaceFolder>,
}

impl WorkspaceFoldersChangeEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct WorkspaceFolders {
    folders: RwLock<Vec<WorkspaceFolder>>,
    pub on_did_change: EventEmitter<WorkspaceFoldersChangeEvent>,
}

fn folder_name(uri: &str) -> String {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(uri)
        .to_string()
}

impl WorkspaceFolders {
    pub fn new(tasks: Arc<PendingTasks>) -> Self {
        Self {
            folders: RwLock::new(Vec::new()),
            on_did_change: EventEmitter::new(tasks),
        }
    }

    pub fn list(&self) -> Vec<WorkspaceFolder> {
        read(&self.folders).clone()
    }

    pub fn root(&self) -> Option<WorkspaceFolder> {
        read(&self.folders).first().cloned()
    }

    /// Replace the folder set, reindexing densely from zero
    ///
    /// Only the first URI is kept; the workspace has at most one root.
    pub fn replace(&self, uris: &[String]) -> WorkspaceFoldersChangeEvent {
        if uris.len() > 1 {
            debug!("Ignoring {} extra workspace folders", uris.len() - 1);
        }
        let next: Vec<WorkspaceFolder> = uris
            .iter()
            .take(1)
            .enumerate()
            .map(|(index, uri)| WorkspaceFolder {
                name: folder_name(uri),
                uri: uri.clone(),
                index,
            })
            .collect();

        let mut folders = write(&self.folders);
        let removed = folders
            .iter()
            .filter(|folder| !next.iter().any(|candidate| candidate.uri == folder.uri))
            .cloned()
            .collect();
        let added = next
            .iter()
            .filter(|folder| !folders.iter().any(|existing| existing.uri == folder.uri))
            .cloned()
            .collect();
        *folders = next;
        WorkspaceFoldersChangeEvent { added, removed }
    }
}

/// Search scope of `find_files`
#[derive(Debug, Clone, PartialEq)]
pub struct FilePattern {
    /// Folder URI the pattern is relative to; every workspace folder when absent
    pub base: Option<String>,
    pub pattern: String,
}

impl From<&str> for FilePattern {
    fn from(pattern: &str) -> Self {
        Self {
            base: None,
            pattern: pattern.to_string(),
        }
    }
}

pub fn uri_to_path(uri: &str) -> Result<PathBuf> {
    let url = Url::parse(uri).map_err(|e| AgentError::InvalidParams(format!("Invalid URI {uri}: {e}")))?;
    url.to_file_path()
        .map_err(|_| AgentError::InvalidParams(format!("Not a file URI: {uri}")))
}

pub fn path_to_uri(path: &Path) -> Result<String> {
    Url::from_file_path(path)
        .map(String::from)
        .map_err(|_| AgentError::InvalidParams(format!("Not an absolute path: {}", path.display())))
}

fn glob_set(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| AgentError::InvalidParams(format!("Invalid glob {pattern}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| AgentError::InvalidParams(format!("Invalid glob set: {e}")))
}

fn find_in_roots(
    roots: Vec<PathBuf>,
    include: GlobSet,
    exclude: Option<GlobSet>,
    max_results: Option<usize>,
) -> Vec<PathBuf> {
    let mut matches = Vec::new();
    for root in roots {
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };
            if !include.is_match(relative) {
                continue;
            }
            if exclude.as_ref().is_some_and(|exclude| exclude.is_match(relative)) {
                continue;
            }
            matches.push(entry.path().to_path_buf());
        }
    }
    matches.sort();
    if let Some(max) = max_results {
        matches.truncate(max);
    }
    matches
}

/// Disk access by URI
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    File,
    Directory,
    SymbolicLink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub file_type: FileType,
    pub size: u64,
}

impl FileSystem {
    pub async fn read_file(&self, uri: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(uri_to_path(uri)?).await?)
    }

    pub async fn write_file(&self, uri: &str, contents: &[u8]) -> Result<()> {
        let path = uri_to_path(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(path, contents).await?)
    }

    pub async fn stat(&self, uri: &str) -> Result<FileStat> {
        let metadata = tokio::fs::symlink_metadata(uri_to_path(uri)?).await?;
        let file_type = if metadata.is_symlink() {
            FileType::SymbolicLink
        } else if metadata.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };
        Ok(FileStat {
            file_type,
            size: metadata.len(),
        })
    }

    /// Entries of a directory as `(name, type)`, sorted by name
    pub async fn read_directory(&self, uri: &str) -> Result<Vec<(String, FileType)>> {
        let mut entries = tokio::fs::read_dir(uri_to_path(uri)?).await?;
        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_symlink() {
                FileType::SymbolicLink
            } else if file_type.is_dir() {
                FileType::Directory
            } else {
                FileType::File
            };
            result.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        result.sort();
        Ok(result)
    }

    pub async fn create_directory(&self, uri: &str) -> Result<()> {
        Ok(tokio::fs::create_dir_all(uri_to_path(uri)?).await?)
    }

    pub async fn delete(&self, uri: &str, recursive: bool) -> Result<()> {
        let path = uri_to_path(uri)?;
        if tokio::fs::metadata(&path).await?.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_dir(path).await?;
            }
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(tokio::fs::rename(uri_to_path(from)?, uri_to_path(to)?).await?)
    }
}

impl HostContext {
    pub fn fs(&self) -> FileSystem {
        FileSystem
    }

    /// Replace the workspace folders and wait for every listener
    pub async fn replace_workspace_folders(&self, uris: &[String]) -> WorkspaceFoldersChangeEvent {
        let event = self.workspace_folders.replace(uris);
        if !event.is_empty() {
            info!(
                "Workspace folders changed: +{} -{}",
                event.added.len(),
                event.removed.len()
            );
            self.workspace_folders
                .on_did_change
                .fire_and_wait(event.clone())
                .await;
        }
        event
    }

    /// URIs of files matching `include` and not `exclude`, sorted
    pub async fn find_files(
        &self,
        include: FilePattern,
        exclude: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<String>> {
        let roots = match &include.base {
            Some(base) => vec![uri_to_path(base)?],
            None => self
                .workspace_folders
                .list()
                .iter()
                .map(|folder| uri_to_path(&folder.uri))
                .collect::<Result<Vec<_>>>()?,
        };
        let include_set = glob_set(&[include.pattern.as_str()])?;
        let exclude_set = exclude.map(|pattern| glob_set(&[pattern])).transpose()?;

        let paths = tokio::task::spawn_blocking(move || {
            find_in_roots(roots, include_set, exclude_set, max_results)
        })
        .await
        .map_err(|e| AgentError::Internal(format!("File search failed: {e}")))?;

        paths.iter().map(|path| path_to_uri(path)).collect()
    }

    /// Open a document, reading it from disk when the client never sent it
    pub async fn open_text_document(&self, uri: &str) -> Result<AgentTextDocument> {
        if let Some(document) = self.documents.get(uri).filter(AgentTextDocument::is_loaded) {
            return Ok(document);
        }
        let bytes = self.fs().read_file(uri).await?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        Ok(self
            .documents
            .load_document(&ProtocolTextDocument::new(uri, Some(content))))
    }

    /// Configuration below `section`; language sections fall back to the root
    pub fn get_configuration(&self, section: Option<&str>) -> ScopedConfiguration {
        ScopedConfiguration::new(Arc::clone(&self.configuration), section)
    }

    pub async fn apply_edit(&self, edit: &WorkspaceEditParams) -> Result<bool> {
        self.capabilities()
            .require(Capability::EditWorkspace, "workspace/edit")?;
        self.client.apply_workspace_edit(edit).await
    }
}
