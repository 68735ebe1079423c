use crate::models::{LabelRef, SystemLabel, ThreadAttributes};
use serde::Serialize;

/// Represents an action that can be undone
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoableAction {
    /// Threads were moved to Trash
    Trash,
    /// Threads were archived
    Archive,
    /// Threads were moved into a folder or system label
    Move { target: LabelRef },
}

impl UndoableAction {
    /// Returns a human-readable description for status messages
    pub fn description(&self) -> String {
        match self {
            UndoableAction::Trash => "trash".to_string(),
            UndoableAction::Archive => "archive".to_string(),
            UndoableAction::Move { target } => format!("move to {}", target.display_name()),
        }
    }

    /// Label the threads were moved into
    pub fn target(&self) -> LabelRef {
        match self {
            UndoableAction::Trash => LabelRef::System(SystemLabel::Trash),
            UndoableAction::Archive => LabelRef::System(SystemLabel::Archive),
            UndoableAction::Move { target } => target.clone(),
        }
    }
}

/// Labels the threads carried before the action, carried in the success
/// toast so the UI can hand it back to `ThreadActions::undo`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UndoToken {
    pub action: UndoableAction,
    pub previous: Vec<(String, ThreadAttributes)>,
}

impl UndoToken {
    pub fn thread_ids(&self) -> Vec<String> {
        self.previous.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}
