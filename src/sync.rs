//! Background refresh of high-traffic mailboxes.
//!
//! The poller refetches the first page of each configured label (and of
//! every filter variant of it that is loaded) on a fixed interval. It is not
//! serialized against user actions: each fetch carries the cache sequence it
//! was issued at, so threads written locally while the fetch was in flight
//! keep their optimistic state.

use crate::cache::{RefreshSummary, SharedCache};
use crate::config::SyncConfig;
use crate::models::MailboxViewKey;
use crate::remote::{RemoteError, RemoteMailStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SyncState {
    pub synced_labels: HashSet<String>,
    pub currently_syncing: Option<String>,
    /// Last remote error, cleared by the next successful poll of any label.
    pub last_error: Option<String>,
}

pub struct Poller {
    cache: SharedCache,
    remote: Arc<dyn RemoteMailStore>,
    config: SyncConfig,
    state: Arc<Mutex<SyncState>>,
    refresh_tx: Option<mpsc::Sender<()>>,
}

impl Poller {
    pub fn new(cache: SharedCache, remote: Arc<dyn RemoteMailStore>, config: &SyncConfig) -> Self {
        Self {
            cache,
            remote,
            config: config.clone(),
            state: Arc::new(Mutex::new(SyncState::default())),
            refresh_tx: None,
        }
    }

    /// Signal `tx` whenever a poll changed the cache.
    pub fn with_refresh(mut self, tx: mpsc::Sender<()>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    pub fn state(&self) -> Arc<Mutex<SyncState>> {
        Arc::clone(&self.state)
    }

    fn update_state(&self, f: impl FnOnce(&mut SyncState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    /// Load the first page of a view, replacing whatever it held.
    pub async fn load_view(&self, key: &MailboxViewKey) -> Result<(), RemoteError> {
        self.fetch(key, None, false).await
    }

    /// Append the next page of an already loaded view. Does nothing when the
    /// view has no further pages.
    pub async fn load_more(&self, key: &MailboxViewKey) -> Result<(), RemoteError> {
        let cursor = self.cache.with(|cache| {
            cache
                .view(key)
                .filter(|view| view.has_next_page)
                .and_then(|view| view.cursor.clone())
        });
        match cursor {
            Some(cursor) => self.fetch(key, Some(cursor), true).await,
            None => Ok(()),
        }
    }

    async fn fetch(&self, key: &MailboxViewKey, cursor: Option<String>, append: bool) -> Result<(), RemoteError> {
        let issued_at = self.cache.with(|cache| cache.sequence());
        let page = self
            .remote
            .list_threads(&key.label, &key.filter, cursor.as_deref(), self.config.page_size)
            .await?;
        self.cache.with(|cache| cache.load_page(key, page, issued_at, append));
        Ok(())
    }

    /// Views refreshed by one poll: each configured label unfiltered, plus
    /// every filter variant of it currently loaded.
    fn poll_keys(&self) -> Vec<MailboxViewKey> {
        let mut keys = Vec::new();
        for label in &self.config.poll_labels {
            let base = MailboxViewKey::new(label.as_str());
            let variants: Vec<MailboxViewKey> = self
                .cache
                .with(|cache| cache.views().variants(label).cloned().collect());
            if !variants.contains(&base) {
                keys.push(base);
            }
            keys.extend(variants);
        }
        keys
    }

    /// Refresh every polled view once. A label whose fetch fails is skipped
    /// until the next poll.
    pub async fn poll_once(&self) -> RefreshSummary {
        let mut total = RefreshSummary::default();
        for key in self.poll_keys() {
            self.update_state(|state| state.currently_syncing = Some(key.label.clone()));

            let issued_at = self.cache.with(|cache| cache.sequence());
            let result = self
                .remote
                .list_threads(&key.label, &key.filter, None, self.config.page_size)
                .await;
            let page = match result {
                Ok(page) => page,
                Err(e) => {
                    warn!(label = %key.label, error = %e, "poll failed");
                    self.update_state(|state| {
                        state.currently_syncing = None;
                        state.last_error = Some(e.to_string());
                    });
                    continue;
                }
            };

            let summary = self
                .cache
                .with(|cache| cache.refresh_first_page(&key, page, issued_at));
            debug!(
                label = %key.label,
                filter = ?key.filter,
                inserted = summary.inserted,
                updated = summary.updated,
                stale = summary.stale,
                dropped = summary.dropped,
                "poll merged"
            );
            total.inserted += summary.inserted;
            total.updated += summary.updated;
            total.stale += summary.stale;
            total.dropped += summary.dropped;

            self.update_state(|state| {
                state.synced_labels.insert(key.label.clone());
                state.currently_syncing = None;
                state.last_error = None;
            });
        }

        if total.has_changes() {
            if let Some(tx) = &self.refresh_tx {
                // a full channel already has a refresh queued
                let _ = tx.try_send(());
            }
        }
        total
    }

    /// Poll forever at the configured interval.
    pub async fn run(self) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        info!(labels = ?self.config.poll_labels, interval_secs = interval.as_secs(), "poller started");
        loop {
            let summary = self.poll_once().await;
            if summary.has_changes() {
                info!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    dropped = summary.dropped,
                    "mailboxes refreshed"
                );
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Settled, ThreadActions};
    use crate::config::Config;
    use crate::memory::InMemoryMailStore;
    use crate::models::fixtures::*;
    use crate::models::{MailboxFilter, SystemLabel};

    fn setup(remote: &Arc<InMemoryMailStore>, config: &SyncConfig) -> (SharedCache, Poller) {
        let cache = SharedCache::default();
        let client: Arc<dyn RemoteMailStore> = remote.clone();
        let poller = Poller::new(cache.clone(), client, config);
        (cache, poller)
    }

    fn listed(cache: &SharedCache, key: &MailboxViewKey) -> Vec<String> {
        cache.with(|c| c.view(key).map(|v| v.thread_ids.clone()).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_poll_picks_up_new_threads() {
        let remote = Arc::new(InMemoryMailStore::with_threads([
            thread_at("t1", false, &[SystemLabel::Inbox], 10),
            thread_at("s1", true, &[SystemLabel::Sent], 5),
        ]));
        let (cache, poller) = setup(&remote, &SyncConfig::default());
        let (tx, mut rx) = mpsc::channel(1);
        let poller = poller.with_refresh(tx);

        let summary = poller.poll_once().await;
        assert_eq!(summary.inserted, 2);
        assert!(rx.try_recv().is_ok());
        assert_eq!(cache.with(|c| c.unread_count("INBOX")), 1);

        remote.insert(thread_at("t2", false, &[SystemLabel::Inbox], 20));
        let summary = poller.poll_once().await;
        assert_eq!(summary.inserted, 1);
        assert_eq!(listed(&cache, &MailboxViewKey::system(SystemLabel::Inbox)), vec!["t2", "t1"]);
        assert_eq!(cache.with(|c| c.unread_count("INBOX")), 2);

        let state = poller.state();
        let state = state.lock().unwrap();
        assert!(state.synced_labels.contains("INBOX"));
        assert!(state.synced_labels.contains("SENT"));
        assert_eq!(state.currently_syncing, None);
    }

    #[tokio::test]
    async fn test_poll_refreshes_loaded_filter_variants() {
        let remote = Arc::new(InMemoryMailStore::with_threads([thread_at("t1", false, &[SystemLabel::Inbox], 10)]));
        let (cache, poller) = setup(&remote, &SyncConfig::default());
        let unread = MailboxViewKey::system(SystemLabel::Inbox).with_filter(MailboxFilter::unread());
        poller.load_view(&unread).await.unwrap();

        remote.insert(thread_at("t2", false, &[SystemLabel::Inbox], 20));
        poller.poll_once().await;
        assert_eq!(listed(&cache, &unread), vec!["t2", "t1"]);
    }

    #[tokio::test]
    async fn test_poll_drops_threads_moved_elsewhere() {
        let remote = Arc::new(InMemoryMailStore::with_threads([
            thread_at("t1", false, &[SystemLabel::Inbox], 10),
            thread_at("t2", false, &[SystemLabel::Inbox], 20),
        ]));
        let (cache, poller) = setup(&remote, &SyncConfig::default());
        let inbox = MailboxViewKey::system(SystemLabel::Inbox);
        poller.poll_once().await;

        // moved on another device
        remote.insert(thread_at("t1", false, &[SystemLabel::Archive], 10));
        let summary = poller.poll_once().await;
        assert_eq!(summary.dropped, 1);
        assert_eq!(listed(&cache, &inbox), vec!["t2"]);
        assert_eq!(cache.with(|c| c.unread_count("INBOX")), 1);
    }

    #[tokio::test]
    async fn test_poll_issued_before_local_write_does_not_revert_it() {
        let remote = Arc::new(InMemoryMailStore::with_threads([thread_at("t1", false, &[SystemLabel::Inbox], 10)]));
        let config = Config::default();
        let (cache, poller) = setup(&remote, &config.sync);
        poller.poll_once().await;

        let client: Arc<dyn RemoteMailStore> = remote.clone();
        let actions = ThreadActions::new(cache.clone(), client, &config);

        // the poll captures its sequence, then the user trashes the thread
        // while the server still lists it in Inbox
        let issued_at = cache.with(|c| c.sequence());
        let page = remote
            .list_threads("INBOX", &MailboxFilter::default(), None, 50)
            .await
            .unwrap();
        let pending = actions.trash(&["t1".to_string()], false).unwrap();

        let inbox = MailboxViewKey::system(SystemLabel::Inbox);
        let summary = cache.with(|c| c.refresh_first_page(&inbox, page, issued_at));
        assert_eq!(summary.stale, 1);
        assert!(listed(&cache, &inbox).is_empty());

        assert_eq!(pending.settle().await, Settled::Confirmed);
        poller.poll_once().await;
        assert!(listed(&cache, &inbox).is_empty());
        assert!(cache.thread("t1").unwrap().attributes.system_labels.contains(&SystemLabel::Trash));
    }

    #[tokio::test]
    async fn test_failed_poll_is_recorded_and_skipped() {
        let remote = Arc::new(InMemoryMailStore::with_threads([thread_at("s1", false, &[SystemLabel::Sent], 10)]));
        let (cache, poller) = setup(&remote, &SyncConfig::default());
        remote.fail_next(1);

        let summary = poller.poll_once().await;
        assert_eq!(summary.inserted, 1);
        assert!(cache.thread("s1").is_some());

        let state = poller.state();
        let state = state.lock().unwrap();
        assert!(!state.synced_labels.contains("INBOX"));
        assert!(state.synced_labels.contains("SENT"));
    }

    #[tokio::test]
    async fn test_load_more_appends_next_page() {
        let remote = Arc::new(InMemoryMailStore::with_threads(
            (0..5).map(|i| thread_at(&format!("t{}", i), true, &[SystemLabel::Inbox], i)),
        ));
        let config = SyncConfig {
            page_size: 2,
            ..SyncConfig::default()
        };
        let (cache, poller) = setup(&remote, &config);
        let inbox = MailboxViewKey::system(SystemLabel::Inbox);

        poller.load_view(&inbox).await.unwrap();
        assert_eq!(listed(&cache, &inbox), vec!["t4", "t3"]);
        poller.load_more(&inbox).await.unwrap();
        poller.load_more(&inbox).await.unwrap();
        assert_eq!(listed(&cache, &inbox), vec!["t4", "t3", "t2", "t1", "t0"]);
        assert!(!cache.with(|c| c.view(&inbox).unwrap().has_next_page));

        let calls = remote.calls();
        poller.load_more(&inbox).await.unwrap();
        assert_eq!(remote.calls(), calls);
    }
}
