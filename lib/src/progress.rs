//! Progress reporting
//!
//! Every [`ProgressManager::with_progress`] call owns one token id from start to
//! end. The end notification and token release happen in a drop guard, so a
//! task that fails, panics or is itself dropped still ends its progress.

use crate::client::ClientProxy;
use crate::error::Result;
use crate::sync::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub cancellable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Handle given to a progress task for incremental updates
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    id: String,
    client: Option<ClientProxy>,
}

impl ProgressReporter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn report(&self, message: Option<&str>, increment: Option<f64>) {
        if let Some(client) = &self.client {
            client.progress_report(&self.id, message, increment);
        }
    }
}

pub struct ProgressManager {
    client: ClientProxy,
    enabled: AtomicBool,
    next_id: AtomicU64,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

struct ProgressGuard<'a> {
    manager: &'a ProgressManager,
    id: String,
    notify: bool,
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        lock(&self.manager.tokens).remove(&self.id);
        if self.notify {
            self.manager.client.progress_end(&self.id);
        }
        debug!("Progress {} ended", self.id);
    }
}

impl ProgressManager {
    pub fn new(client: ClientProxy) -> Self {
        Self {
            client,
            enabled: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Whether progress notifications are forwarded to the client
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number of progress operations that have not ended
    pub fn active_count(&self) -> usize {
        lock(&self.tokens).len()
    }

    pub async fn with_progress<F, Fut, T>(&self, options: ProgressOptions, task: F) -> Result<T>
    where
        F: FnOnce(ProgressReporter, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = format!("progress-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        let notify = self.is_enabled();
        let options = serde_json::to_value(&options)?;

        lock(&self.tokens).insert(id.clone(), token.clone());
        if notify {
            self.client.progress_start(&id, &options);
        }
        let _guard = ProgressGuard {
            manager: self,
            id: id.clone(),
            notify,
        };

        let reporter = ProgressReporter {
            id,
            client: notify.then(|| self.client.clone()),
        };
        task(reporter, token).await
    }

    /// Cancel a live progress operation; unknown ids are ignored
    pub fn cancel(&self, id: &str) -> bool {
        match lock(&self.tokens).get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => {
                debug!("Ignoring cancel for unknown progress {}", id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::error::AgentError;
    use std::sync::Arc;

    fn manager() -> Arc<ProgressManager> {
        Arc::new(ProgressManager::new(ClientProxy::new(Connection::new())))
    }

    #[tokio::test]
    async fn test_token_released_on_success_and_failure() {
        let manager = manager();
        manager.set_enabled(true);

        let value = manager
            .with_progress(ProgressOptions::default(), |reporter, _| async move {
                reporter.report(Some("half"), Some(50.0));
                Ok(1)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(manager.active_count(), 0);

        let result: Result<()> = manager
            .with_progress(ProgressOptions::default(), |_, _| async {
                Err(AgentError::Internal("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_reaches_task_token() {
        let manager = manager();
        let (id_tx, id_rx) = tokio::sync::oneshot::channel();

        let runner = Arc::clone(&manager);
        let task = tokio::spawn(async move {
            runner
                .with_progress(
                    ProgressOptions {
                        cancellable: true,
                        ..Default::default()
                    },
                    |reporter, token| async move {
                        let _ = id_tx.send(reporter.id().to_string());
                        token.cancelled().await;
                        Ok(token.is_cancelled())
                    },
                )
                .await
        });

        let id = id_rx.await.unwrap();
        assert_eq!(manager.active_count(), 1);
        assert!(manager.cancel(&id));
        assert!(task.await.unwrap().unwrap());
        assert_eq!(manager.active_count(), 0);
        assert!(!manager.cancel(&id));
    }

    #[tokio::test]
    async fn test_dropped_task_releases_token() {
        let manager = manager();
        let future = manager.with_progress(ProgressOptions::default(), |_, token| async move {
            token.cancelled().await;
            Ok(())
        });
        let result = tokio::time::timeout(std::time::Duration::from_millis(10), future).await;
        assert!(result.is_err());
        assert_eq!(manager.active_count(), 0);
    }
}
