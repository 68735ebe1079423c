//! Mailbox cache service.
//!
//! Bundles the thread store, the mailbox view index and the unread counters
//! behind one object so a single write keeps all three in step. Consumers
//! hold a [`SharedCache`] handle; only the orchestrator, the poller and page
//! loads write through it.

use crate::counters::{CounterDelta, UnreadCounters};
use crate::diff::LabelDiff;
use crate::models::{MailboxFilter, MailboxViewKey, PageInfo, SystemLabel, Thread, ThreadAttributes, ThreadPage};
use crate::remote::UpdatedThread;
use crate::store::{AttributeChange, Merge, ThreadStore};
use crate::views::{MailboxView, MailboxViewIndex};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// What a first-page refresh changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshSummary {
    pub inserted: usize,
    pub updated: usize,
    pub stale: usize,
    pub dropped: usize,
}

impl RefreshSummary {
    pub fn has_changes(&self) -> bool {
        self.inserted + self.updated + self.dropped > 0
    }
}

#[derive(Debug, Default)]
pub struct MailCache {
    store: ThreadStore,
    views: MailboxViewIndex,
    counters: UnreadCounters,
}

impl MailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    pub fn views(&self) -> &MailboxViewIndex {
        &self.views
    }

    pub fn counters(&self) -> &UnreadCounters {
        &self.counters
    }

    pub fn sequence(&self) -> u64 {
        self.store.sequence()
    }

    pub fn thread(&self, thread_id: &str) -> Option<&Thread> {
        self.store.get(thread_id)
    }

    pub fn unread_count(&self, label: &str) -> u32 {
        self.counters.get(label)
    }

    pub fn view(&self, key: &MailboxViewKey) -> Option<&MailboxView> {
        self.views.view(key)
    }

    /// Threads of a view in view order.
    pub fn view_threads(&self, key: &MailboxViewKey) -> Vec<Thread> {
        self.views
            .view(key)
            .map(|view| {
                view.thread_ids
                    .iter()
                    .filter_map(|id| self.store.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Install a `listThreads` page fetched at `issued_at`.
    pub fn load_page(&mut self, key: &MailboxViewKey, page: ThreadPage, issued_at: u64, append: bool) {
        let (ids, _) = self.merge_threads(key, page.threads, issued_at);
        debug!(label = %key.label, count = ids.len(), append, "page loaded");
        self.views.load_page(key, ids, page.page_info, append);
    }

    /// Merge a refetched first page. A complete page drops every cached
    /// thread it no longer lists. A partial page drops only threads strictly
    /// newer than its oldest entry: threads tied with that entry may sit on
    /// the next page, since the server breaks ties by thread ID.
    pub fn refresh_first_page(&mut self, key: &MailboxViewKey, page: ThreadPage, issued_at: u64) -> RefreshSummary {
        let complete = !page.page_info.has_next_page;
        let page_info = page.page_info.clone();
        let oldest = page.threads.iter().map(Thread::latest_activity).min();
        let server_ids: HashSet<String> = page.threads.iter().map(|t| t.thread_id.clone()).collect();

        let (head, mut summary) = self.merge_threads(key, page.threads, issued_at);

        let mut dropped = HashSet::new();
        if let (Some(oldest), Some(view)) = (oldest, self.views.view(key)) {
            for id in &view.thread_ids {
                if server_ids.contains(id) {
                    continue;
                }
                let Some(thread) = self.store.get(id) else {
                    continue;
                };
                let fresh = self.store.stamp_of(id).is_some_and(|stamp| stamp <= issued_at);
                if fresh && (complete || thread.latest_activity() > oldest) {
                    dropped.insert(id.clone());
                }
            }
        }

        // the server says these lost the label; mirror that for unfiltered views
        if key.filter == MailboxFilter::default() {
            let updates: Vec<UpdatedThread> = dropped
                .iter()
                .filter_map(|id| self.store.get(id))
                .map(|thread| without_label(thread, &key.label))
                .collect();
            let changes = self.store.reconcile_stamped(&updates, issued_at);
            self.settle(&changes, CounterDelta::new());
        }

        summary.dropped = dropped.len();
        self.views.refresh_head(key, head, &dropped, page_info);
        summary
    }

    fn merge_threads(&mut self, key: &MailboxViewKey, threads: Vec<Thread>, issued_at: u64) -> (Vec<String>, RefreshSummary) {
        let mut summary = RefreshSummary::default();
        let mut batch = CounterDelta::new();
        let mut changes = Vec::new();
        let mut ids = Vec::new();

        for thread in threads {
            let thread_id = thread.thread_id.clone();
            match self.store.merge(thread, issued_at) {
                Merge::Inserted => {
                    summary.inserted += 1;
                    batch.record(None, self.store.read(&thread_id));
                }
                Merge::Updated(change) => {
                    if !change.is_noop() {
                        summary.updated += 1;
                        changes.push(change);
                    }
                }
                Merge::Stale => {
                    summary.stale += 1;
                    debug!(%thread_id, "server copy older than local write");
                }
            }
            if self.store.get(&thread_id).is_some_and(|t| key.admits(t)) {
                ids.push(thread_id);
            }
        }

        self.settle(&changes, batch);
        (ids, summary)
    }

    /// Optimistic label writes for a batch of threads. Counter deltas are
    /// netted across the batch and committed once.
    pub fn apply_diffs(&mut self, diffs: &[(String, LabelDiff)]) -> Vec<AttributeChange> {
        let changes: Vec<AttributeChange> = diffs
            .iter()
            .filter(|(_, diff)| !diff.is_empty())
            .filter_map(|(id, diff)| self.store.apply(id, |attrs| diff.apply(attrs)))
            .collect();
        self.settle(&changes, CounterDelta::new());
        changes
    }

    pub fn set_read(&mut self, thread_ids: &[String], read: bool) -> Vec<AttributeChange> {
        let mut changes = Vec::new();
        for thread_id in thread_ids {
            if self.store.read(thread_id).is_some_and(|attrs| attrs.read == read) {
                continue;
            }
            if let Some(change) = self.store.apply(thread_id, |attrs| attrs.read = read) {
                changes.push(change);
            }
        }
        self.settle(&changes, CounterDelta::new());
        changes
    }

    /// Put threads back to `snapshot`, skipping any thread written after
    /// `written_at`.
    pub fn restore(&mut self, snapshot: &[(String, ThreadAttributes)], written_at: u64) -> Vec<AttributeChange> {
        let mut changes = Vec::new();
        for (thread_id, before) in snapshot {
            match self.store.stamp_of(thread_id) {
                Some(stamp) if stamp <= written_at => {
                    if let Some(change) = self.store.apply(thread_id, |attrs| *attrs = before.clone()) {
                        changes.push(change);
                    }
                }
                Some(_) => debug!(%thread_id, "newer local write, restore skipped"),
                None => {}
            }
        }
        self.settle(&changes, CounterDelta::new());
        changes
    }

    pub fn reconcile(&mut self, updated: &[UpdatedThread]) -> Vec<AttributeChange> {
        let changes = self.store.reconcile(updated);
        self.settle(&changes, CounterDelta::new());
        changes
    }

    pub fn confirm(&mut self, thread_ids: &[String], issued_at: u64) -> usize {
        self.store.confirm(thread_ids, issued_at)
    }

    pub fn reconcile_stamped(&mut self, updated: &[UpdatedThread], issued_at: u64) -> Vec<AttributeChange> {
        let changes = self.store.reconcile_stamped(updated, issued_at);
        self.settle(&changes, CounterDelta::new());
        changes
    }

    /// Drop threads from the store and every view.
    pub fn remove_threads(&mut self, thread_ids: &[String]) -> Vec<Thread> {
        let mut batch = CounterDelta::new();
        let mut removed = Vec::new();
        for thread_id in thread_ids {
            if let Some(thread) = self.store.remove(thread_id) {
                self.views.remove_everywhere(thread_id);
                batch.record(Some(&thread.attributes), None);
                removed.push(thread);
            }
        }
        self.counters.commit(&batch);
        removed
    }

    /// Put removed threads back. Threads cached again in the meantime (a
    /// poll may have refetched them) are left as they are.
    pub fn reinsert(&mut self, threads: Vec<Thread>) -> usize {
        let mut batch = CounterDelta::new();
        let mut restored = 0;
        let unlabelled = ThreadAttributes::default();
        for thread in threads {
            if self.store.contains(&thread.thread_id) {
                continue;
            }
            batch.record(None, Some(&thread.attributes));
            self.views.apply_transition(&unlabelled, &thread);
            self.store.insert(thread);
            restored += 1;
        }
        self.counters.commit(&batch);
        restored
    }

    /// Zero the label's counter and mark every cached thread under it read.
    /// Threads not cached are left for their next fetch.
    pub fn mark_all_read(&mut self, label: &str) -> Vec<AttributeChange> {
        let ids: Vec<String> = self
            .store
            .threads()
            .filter(|t| !t.attributes.read && t.attributes.view_labels().contains(label))
            .map(|t| t.thread_id.clone())
            .collect();
        let changes = self.set_read(&ids, true);
        self.counters.reset(label);
        changes
    }

    fn settle(&mut self, changes: &[AttributeChange], mut batch: CounterDelta) {
        for change in changes.iter().filter(|c| !c.is_noop()) {
            if let Some(thread) = self.store.get(&change.thread_id) {
                self.views.apply_transition(&change.before, thread);
            }
            batch.record(Some(&change.before), Some(&change.after));
        }
        self.counters.commit(&batch);
    }
}

fn without_label(thread: &Thread, label: &str) -> UpdatedThread {
    let attrs = &thread.attributes;
    UpdatedThread {
        thread_id: thread.thread_id.clone(),
        system_labels: attrs
            .system_labels
            .iter()
            .copied()
            .filter(|l| l.as_str() != label)
            .collect::<Vec<SystemLabel>>(),
        user_labels: attrs
            .user_labels
            .iter()
            .filter(|l| l.label_id != label)
            .cloned()
            .collect(),
    }
}

/// Cloneable handle to the process-wide cache. The lock is only ever held
/// for synchronous work, never across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct SharedCache {
    inner: Arc<Mutex<MailCache>>,
}

impl SharedCache {
    pub fn new(cache: MailCache) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MailCache) -> R) -> R {
        let mut cache = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut cache)
    }

    pub fn thread(&self, thread_id: &str) -> Option<Thread> {
        self.with(|cache| cache.thread(thread_id).cloned())
    }

    pub fn view_threads(&self, key: &MailboxViewKey) -> Vec<Thread> {
        self.with(|cache| cache.view_threads(key))
    }

    pub fn unread_counts(&self) -> HashMap<String, u32> {
        self.with(|cache| cache.counters().snapshot())
    }
}
