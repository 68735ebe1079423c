//! Remote mutation contract.
//!
//! The mail store itself lives elsewhere. Every label response carries the
//! full post-mutation label set of each thread it touched, so a response can
//! be applied on its own without knowing what else is in flight.

use crate::models::{MailboxFilter, SystemLabel, ThreadPage, UserLabelRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedThread {
    pub thread_id: String,
    pub system_labels: Vec<SystemLabel>,
    pub user_labels: Vec<UserLabelRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelsResponse {
    pub updated_threads: Vec<UpdatedThread>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadStatusResponse {
    pub updated_thread_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub thread_ids: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Thread not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait RemoteMailStore: Send + Sync {
    /// System labels are applied as a move: the server drops the thread's
    /// other system labels and its folder. User labels follow the same
    /// exclusivity rules as the local diff engine.
    async fn apply_labels(
        &self,
        thread_ids: &[String],
        system_labels: &[SystemLabel],
        user_labels: &[UserLabelRef],
    ) -> Result<LabelsResponse, RemoteError>;

    async fn remove_labels(
        &self,
        thread_ids: &[String],
        system_labels: &[SystemLabel],
        user_labels: &[UserLabelRef],
    ) -> Result<LabelsResponse, RemoteError>;

    async fn set_read_status(&self, thread_ids: &[String], read: bool) -> Result<ReadStatusResponse, RemoteError>;

    async fn delete_thread(&self, thread_ids: &[String]) -> Result<DeleteResponse, RemoteError>;

    async fn set_all_threads_read_status(&self, label: &str, read: bool) -> Result<(), RemoteError>;

    async fn list_threads(
        &self,
        label: &str,
        filter: &MailboxFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ThreadPage, RemoteError>;

    /// Cancel a scheduled send; the email goes back to being a draft.
    async fn unschedule_send(&self, thread_id: &str, scheduled_email_id: &str) -> Result<LabelsResponse, RemoteError>;
}
