//! Headless editor host for IDE extensions
//!
//! The crate serves JSON-RPC to an editor client and re-implements the
//! slice of the editor's extension host API that one hosted [`Extension`]
//! needs: documents, configuration, commands, language providers, webview
//! panels, progress, edit tasks and persistent state.

pub mod agent;
pub mod auth;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod configuration;
pub mod connection;
pub mod documents;
pub mod edit_tasks;
pub mod error;
pub mod events;
pub mod extension;
pub mod host;
pub mod panels;
pub mod pending;
pub mod progress;
pub mod protocol;
pub mod recording;
pub mod server;
pub mod storage;
pub(crate) mod sync;
pub mod transport;

pub use agent::Agent;
pub use config::AgentConfig;
pub use connection::ExitReason;
pub use error::{AgentError, Result};
pub use extension::{Extension, NoopExtension};
pub use host::HostContext;
pub use server::AgentServer;
