//! In-memory remote mail store.
//!
//! Holds authoritative thread state behind the [`RemoteMailStore`] contract
//! and applies label changes with the same exclusivity engine the client
//! uses. Calls can be delayed and made to fail, which is how the demo binary
//! and the tests exercise slow and failing remotes.

use crate::diff::{compute_diff, LabelRequest};
use crate::models::{LabelRef, MailboxFilter, MailboxViewKey, PageInfo, SystemLabel, Thread, ThreadPage, UserLabelRef};
use crate::remote::{DeleteResponse, LabelsResponse, ReadStatusResponse, RemoteError, RemoteMailStore, UpdatedThread};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
pub struct InMemoryMailStore {
    threads: Mutex<HashMap<String, Thread>>,
    failures: AtomicUsize,
    calls: AtomicUsize,
    latency: Option<Duration>,
}

impl InMemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(threads: impl IntoIterator<Item = Thread>) -> Self {
        let store = Self::new();
        for thread in threads {
            store.insert(thread);
        }
        store
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, thread: Thread) {
        self.lock().insert(thread.thread_id.clone(), thread);
    }

    pub fn thread(&self, thread_id: &str) -> Option<Thread> {
        self.lock().get(thread_id).cloned()
    }

    /// Make the next `n` calls fail with a 503.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of calls served so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Thread>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn begin(&self, call: &str) -> Result<(), RemoteError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            debug!(call, "injected failure");
            return Err(RemoteError::Server {
                status: 503,
                message: "Service unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn relabel<F>(&self, thread_ids: &[String], request: F) -> LabelsResponse
    where
        F: Fn(&Thread) -> LabelRequest,
    {
        let mut threads = self.lock();
        let mut updated_threads = Vec::new();
        for thread_id in thread_ids {
            let Some(thread) = threads.get_mut(thread_id) else {
                continue;
            };
            let diff = compute_diff(&thread.attributes, &request(thread));
            diff.apply(&mut thread.attributes);
            updated_threads.push(updated(thread));
        }
        LabelsResponse { updated_threads }
    }
}

fn updated(thread: &Thread) -> UpdatedThread {
    UpdatedThread {
        thread_id: thread.thread_id.clone(),
        system_labels: thread.attributes.system_labels.iter().copied().collect(),
        user_labels: thread.attributes.user_labels.iter().cloned().collect(),
    }
}

/// System labels move the thread: its other system labels and, unless kept
/// by the request, its folder are dropped.
fn apply_request(thread: &Thread, system_labels: &[SystemLabel], user_labels: &[UserLabelRef]) -> LabelRequest {
    let add: BTreeSet<LabelRef> = system_labels
        .iter()
        .copied()
        .map(LabelRef::System)
        .chain(user_labels.iter().cloned().map(LabelRef::User))
        .collect();
    if system_labels.is_empty() {
        return LabelRequest::add(add);
    }
    let attrs = &thread.attributes;
    let mut remove: BTreeSet<LabelRef> = attrs
        .system_labels
        .iter()
        .filter(|label| !system_labels.contains(label))
        .copied()
        .map(LabelRef::System)
        .collect();
    if let Some(folder) = attrs.folder() {
        if !user_labels.contains(folder) {
            remove.insert(LabelRef::User(folder.clone()));
        }
    }
    LabelRequest {
        add,
        remove,
        ..LabelRequest::default()
    }
}

#[async_trait]
impl RemoteMailStore for InMemoryMailStore {
    async fn apply_labels(
        &self,
        thread_ids: &[String],
        system_labels: &[SystemLabel],
        user_labels: &[UserLabelRef],
    ) -> Result<LabelsResponse, RemoteError> {
        self.begin("apply_labels").await?;
        Ok(self.relabel(thread_ids, |thread| apply_request(thread, system_labels, user_labels)))
    }

    async fn remove_labels(
        &self,
        thread_ids: &[String],
        system_labels: &[SystemLabel],
        user_labels: &[UserLabelRef],
    ) -> Result<LabelsResponse, RemoteError> {
        self.begin("remove_labels").await?;
        let remove: Vec<LabelRef> = system_labels
            .iter()
            .copied()
            .map(LabelRef::System)
            .chain(user_labels.iter().cloned().map(LabelRef::User))
            .collect();
        Ok(self.relabel(thread_ids, |_| LabelRequest::remove(remove.iter().cloned())))
    }

    async fn set_read_status(&self, thread_ids: &[String], read: bool) -> Result<ReadStatusResponse, RemoteError> {
        self.begin("set_read_status").await?;
        let mut threads = self.lock();
        let mut updated_thread_ids = Vec::new();
        for thread_id in thread_ids {
            if let Some(thread) = threads.get_mut(thread_id) {
                thread.attributes.read = read;
                updated_thread_ids.push(thread_id.clone());
            }
        }
        Ok(ReadStatusResponse { updated_thread_ids })
    }

    async fn delete_thread(&self, thread_ids: &[String]) -> Result<DeleteResponse, RemoteError> {
        self.begin("delete_thread").await?;
        let mut threads = self.lock();
        let thread_ids = thread_ids
            .iter()
            .filter(|id| threads.remove(id.as_str()).is_some())
            .cloned()
            .collect();
        Ok(DeleteResponse { thread_ids })
    }

    async fn set_all_threads_read_status(&self, label: &str, read: bool) -> Result<(), RemoteError> {
        self.begin("set_all_threads_read_status").await?;
        for thread in self.lock().values_mut() {
            if thread.attributes.view_labels().contains(label) {
                thread.attributes.read = read;
            }
        }
        Ok(())
    }

    async fn list_threads(
        &self,
        label: &str,
        filter: &MailboxFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ThreadPage, RemoteError> {
        self.begin("list_threads").await?;
        let key = MailboxViewKey::new(label).with_filter(*filter);
        let mut matching: Vec<Thread> = self.lock().values().filter(|t| key.admits(t)).cloned().collect();
        matching.sort_by(|a, b| {
            b.latest_activity()
                .cmp(&a.latest_activity())
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });

        let offset = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let threads: Vec<Thread> = matching.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + threads.len();
        let has_next_page = next < matching.len();
        Ok(ThreadPage {
            threads,
            page_info: PageInfo {
                cursor: has_next_page.then(|| next.to_string()),
                has_next_page,
            },
        })
    }

    async fn unschedule_send(&self, thread_id: &str, scheduled_email_id: &str) -> Result<LabelsResponse, RemoteError> {
        self.begin("unschedule_send").await?;
        let mut threads = self.lock();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| RemoteError::NotFound(thread_id.to_string()))?;
        let email = thread
            .emails
            .iter_mut()
            .find(|e| e.email_id == scheduled_email_id)
            .ok_or_else(|| RemoteError::NotFound(scheduled_email_id.to_string()))?;
        email.scheduled_send_at = None;

        let diff = compute_diff(&thread.attributes, &LabelRequest::unschedule());
        diff.apply(&mut thread.attributes);
        Ok(LabelsResponse {
            updated_threads: vec![updated(thread)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::*;

    fn ids(page: &ThreadPage) -> Vec<&str> {
        page.threads.iter().map(|t| t.thread_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_apply_system_label_moves_thread() {
        let remote = InMemoryMailStore::with_threads([thread("t1", false, &[SystemLabel::Inbox])]);
        let response = remote
            .apply_labels(&["t1".to_string()], &[SystemLabel::Spam], &[])
            .await
            .unwrap();
        assert_eq!(response.updated_threads[0].system_labels, vec![SystemLabel::Spam]);
    }

    #[tokio::test]
    async fn test_apply_inbox_restores_from_trash_and_folder() {
        let trashed = thread("t1", false, &[SystemLabel::Trash]);
        let mut filed = thread("t2", false, &[]);
        filed.attributes.user_labels.insert(folder_x());
        let remote = InMemoryMailStore::with_threads([trashed, filed]);

        let response = remote
            .apply_labels(&["t1".to_string(), "t2".to_string()], &[SystemLabel::Inbox], &[])
            .await
            .unwrap();
        for update in &response.updated_threads {
            assert_eq!(update.system_labels, vec![SystemLabel::Inbox]);
            assert!(update.user_labels.is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_threads_are_left_out_of_response() {
        let remote = InMemoryMailStore::with_threads([thread("t1", false, &[SystemLabel::Inbox])]);
        let response = remote
            .apply_labels(&["t1".to_string(), "gone".to_string()], &[SystemLabel::Trash], &[])
            .await
            .unwrap();
        assert_eq!(response.updated_threads.len(), 1);
    }

    #[tokio::test]
    async fn test_list_threads_pages_newest_first() {
        let remote = InMemoryMailStore::with_threads([
            thread_at("old", false, &[SystemLabel::Inbox], 1),
            thread_at("new", true, &[SystemLabel::Inbox], 9),
            thread_at("mid", false, &[SystemLabel::Inbox], 5),
            thread_at("sent", false, &[SystemLabel::Sent], 7),
        ]);

        let first = remote.list_threads("INBOX", &MailboxFilter::default(), None, 2).await.unwrap();
        assert_eq!(ids(&first), vec!["new", "mid"]);
        assert!(first.page_info.has_next_page);

        let cursor = first.page_info.cursor.clone();
        let second = remote
            .list_threads("INBOX", &MailboxFilter::default(), cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(ids(&second), vec!["old"]);
        assert!(!second.page_info.has_next_page);

        let unread = remote.list_threads("INBOX", &MailboxFilter::unread(), None, 10).await.unwrap();
        assert_eq!(ids(&unread), vec!["mid", "old"]);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let remote = InMemoryMailStore::with_threads([thread("t1", false, &[SystemLabel::Inbox])]);
        remote.fail_next(1);
        let ids = vec!["t1".to_string()];
        assert!(matches!(
            remote.set_read_status(&ids, true).await,
            Err(RemoteError::Server { status: 503, .. })
        ));
        assert!(remote.set_read_status(&ids, true).await.is_ok());
        assert_eq!(remote.calls(), 2);
        assert!(remote.thread("t1").unwrap().attributes.read);
    }

    #[tokio::test]
    async fn test_unschedule_unknown_email_is_not_found() {
        let remote = InMemoryMailStore::with_threads([thread("t1", true, &[SystemLabel::ScheduleSend])]);
        assert!(matches!(
            remote.unschedule_send("t1", "nope").await,
            Err(RemoteError::NotFound(_))
        ));
        let response = remote.unschedule_send("t1", "t1-e1").await.unwrap();
        assert_eq!(response.updated_threads[0].system_labels, vec![SystemLabel::Drafts]);
    }
}
