//! Edit task plumbing
//!
//! Edit tasks belong to the product's fixup controller. The agent only
//! forwards `editTask/*` requests to it and translates its tasks into the
//! wire shape.

use crate::error::{ErrorData, Result};
use crate::events::EventEmitter;
use crate::pending::PendingTasks;
use crate::protocol::Range;
use crate::sync::{read, write};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

/// Controller-side task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupTaskState {
    Idle,
    Working,
    Inserting,
    Applying,
    Formatting,
    Applied,
    Finished,
    Error,
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixupTask {
    pub id: String,
    pub uri: String,
    pub instruction: String,
    pub selection_range: Range,
    pub state: FixupTaskState,
    pub error: Option<ErrorData>,
    pub model: Option<String>,
    pub original_text: Option<String>,
}

/// Task state as the client sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditTaskState {
    Idle,
    Working,
    Inserting,
    Applying,
    Applied,
    Finished,
    Error,
    Pending,
}

impl From<FixupTaskState> for EditTaskState {
    fn from(state: FixupTaskState) -> Self {
        match state {
            FixupTaskState::Idle => EditTaskState::Idle,
            FixupTaskState::Working => EditTaskState::Working,
            FixupTaskState::Inserting => EditTaskState::Inserting,
            // Formatting is part of applying from the client's point of view
            FixupTaskState::Applying | FixupTaskState::Formatting => EditTaskState::Applying,
            FixupTaskState::Applied => EditTaskState::Applied,
            FixupTaskState::Finished => EditTaskState::Finished,
            FixupTaskState::Error => EditTaskState::Error,
            FixupTaskState::Pending => EditTaskState::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditTask {
    pub id: String,
    pub state: EditTaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
    pub selection_range: Range,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
}

impl From<&FixupTask> for EditTask {
    fn from(task: &FixupTask) -> Self {
        Self {
            id: task.id.clone(),
            state: task.state.into(),
            error: task.error.clone(),
            selection_range: task.selection_range,
            instruction: task.instruction.clone(),
            model: task.model.clone(),
            original_text: task.original_text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditTaskEvent {
    Updated(FixupTask),
    Deleted(FixupTask),
}

/// The product's edit task controller
#[async_trait]
pub trait FixupController: Send + Sync {
    async fn accept(&self, id: &str) -> Result<()>;
    async fn undo(&self, id: &str) -> Result<()>;
    async fn cancel(&self, id: &str) -> Result<()>;
    /// Start the task again; returns the replacement task
    async fn retry(&self, id: &str) -> Result<Option<FixupTask>>;
    fn task(&self, id: &str) -> Option<FixupTask>;
    fn tasks(&self) -> Vec<FixupTask>;
    fn events(&self) -> &EventEmitter<EditTaskEvent>;
}

/// Task bookkeeping without any model behind it
pub struct InMemoryFixupController {
    tasks: RwLock<HashMap<String, FixupTask>>,
    events: EventEmitter<EditTaskEvent>,
}

impl InMemoryFixupController {
    pub fn new(pending: Arc<PendingTasks>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            events: EventEmitter::new(pending),
        }
    }

    pub fn create_task(&self, uri: &str, instruction: &str, selection_range: Range) -> FixupTask {
        let task = FixupTask {
            id: Ulid::new().to_string(),
            uri: uri.to_string(),
            instruction: instruction.to_string(),
            selection_range,
            state: FixupTaskState::Pending,
            error: None,
            model: None,
            original_text: None,
        };
        write(&self.tasks).insert(task.id.clone(), task.clone());
        self.events.fire(EditTaskEvent::Updated(task.clone()));
        task
    }

    pub fn set_state(&self, id: &str, state: FixupTaskState) -> Option<FixupTask> {
        let task = {
            let mut tasks = write(&self.tasks);
            let task = tasks.get_mut(id)?;
            task.state = state;
            task.clone()
        };
        self.events.fire(EditTaskEvent::Updated(task.clone()));
        Some(task)
    }

    fn remove(&self, id: &str, operation: &str) -> Option<FixupTask> {
        let removed = write(&self.tasks).remove(id);
        match &removed {
            Some(task) => {
                debug!("Edit task {} removed by {}", id, operation);
                self.events.fire(EditTaskEvent::Deleted(task.clone()));
            }
            None => warn!("{} ignored for unknown edit task {}", operation, id),
        }
        removed
    }
}

#[async_trait]
impl FixupController for InMemoryFixupController {
    async fn accept(&self, id: &str) -> Result<()> {
        if self.set_state(id, FixupTaskState::Finished).is_some() {
            self.remove(id, "accept");
        } else {
            warn!("accept ignored for unknown edit task {}", id);
        }
        Ok(())
    }

    async fn undo(&self, id: &str) -> Result<()> {
        self.remove(id, "undo");
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        self.remove(id, "cancel");
        Ok(())
    }

    async fn retry(&self, id: &str) -> Result<Option<FixupTask>> {
        let Some(previous) = self.remove(id, "retry") else {
            return Ok(None);
        };
        Ok(Some(self.create_task(
            &previous.uri,
            &previous.instruction,
            previous.selection_range,
        )))
    }

    fn task(&self, id: &str) -> Option<FixupTask> {
        read(&self.tasks).get(id).cloned()
    }

    fn tasks(&self) -> Vec<FixupTask> {
        read(&self.tasks).values().cloned().collect()
    }

    fn events(&self) -> &EventEmitter<EditTaskEvent> {
        &self.events
    }
}
