use crate::models::{Thread, ThreadAttributes};
use crate::remote::UpdatedThread;
use std::collections::HashMap;
use tracing::debug;

/// Before and after attributes of one thread write.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    pub thread_id: String,
    pub before: ThreadAttributes,
    pub after: ThreadAttributes,
}

impl AttributeChange {
    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

/// Outcome of merging a server copy of a thread into the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Merge {
    Inserted,
    Updated(AttributeChange),
    /// A local write landed after the fetch was issued; only new emails
    /// were taken from the server copy.
    Stale,
}

#[derive(Debug, Clone)]
struct Entry {
    thread: Thread,
    /// Sequence number of the last optimistic write.
    stamp: u64,
}

/// Local cache of threads keyed by thread ID.
///
/// Every optimistic write advances a store-wide sequence and stamps the
/// thread with it. Server data captured at an earlier sequence is stale for
/// any thread stamped later, which keeps slow responses and polls from
/// clobbering newer local state.
#[derive(Debug, Default)]
pub struct ThreadStore {
    threads: HashMap<String, Entry>,
    sequence: u64,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write sequence. Capture it when issuing a remote call.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn contains(&self, thread_id: &str) -> bool {
        self.threads.contains_key(thread_id)
    }

    pub fn get(&self, thread_id: &str) -> Option<&Thread> {
        self.threads.get(thread_id).map(|entry| &entry.thread)
    }

    pub fn read(&self, thread_id: &str) -> Option<&ThreadAttributes> {
        self.get(thread_id).map(|thread| &thread.attributes)
    }

    /// Attributes for every requested ID that is cached, in request order.
    pub fn read_many<'a>(&'a self, thread_ids: &'a [String]) -> Vec<(&'a str, &'a ThreadAttributes)> {
        thread_ids
            .iter()
            .filter_map(|id| self.read(id).map(|attrs| (id.as_str(), attrs)))
            .collect()
    }

    pub fn stamp_of(&self, thread_id: &str) -> Option<u64> {
        self.threads.get(thread_id).map(|entry| entry.stamp)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values().map(|entry| &entry.thread)
    }

    /// Cache a thread seen for the first time, or replace a cached copy.
    /// Returns the previous copy.
    pub fn insert(&mut self, thread: Thread) -> Option<Thread> {
        let stamp = self.stamp_of(&thread.thread_id).unwrap_or(0);
        self.threads
            .insert(thread.thread_id.clone(), Entry { thread, stamp })
            .map(|entry| entry.thread)
    }

    /// Optimistic write. Does nothing and returns `None` when the thread is
    /// not cached.
    pub fn apply<F>(&mut self, thread_id: &str, mutator: F) -> Option<AttributeChange>
    where
        F: FnOnce(&mut ThreadAttributes),
    {
        let Some(entry) = self.threads.get_mut(thread_id) else {
            debug!(thread_id, "store miss, write ignored");
            return None;
        };
        let before = entry.thread.attributes.clone();
        mutator(&mut entry.thread.attributes);
        self.sequence += 1;
        entry.stamp = self.sequence;
        Some(AttributeChange {
            thread_id: thread_id.to_string(),
            before,
            after: entry.thread.attributes.clone(),
        })
    }

    /// Overwrite labels with server-confirmed state. The read flag is not
    /// part of a label response and is kept. Applying the same response
    /// twice changes nothing the second time.
    pub fn reconcile(&mut self, updated: &[UpdatedThread]) -> Vec<AttributeChange> {
        self.reconcile_from(updated, u64::MAX)
    }

    /// Like [`ThreadStore::reconcile`], but skips threads written locally
    /// after `issued_at`.
    pub fn reconcile_stamped(&mut self, updated: &[UpdatedThread], issued_at: u64) -> Vec<AttributeChange> {
        self.reconcile_from(updated, issued_at)
    }

    fn reconcile_from(&mut self, updated: &[UpdatedThread], issued_at: u64) -> Vec<AttributeChange> {
        let mut changes = Vec::new();
        for update in updated {
            let Some(entry) = self.threads.get_mut(&update.thread_id) else {
                debug!(thread_id = %update.thread_id, "reconcile target no longer cached");
                continue;
            };
            if entry.stamp > issued_at {
                debug!(
                    thread_id = %update.thread_id,
                    stamp = entry.stamp,
                    issued_at,
                    "stale response skipped"
                );
                continue;
            }
            // a poll issued before this answer may predate the server's write
            self.sequence += 1;
            entry.stamp = self.sequence;
            let before = entry.thread.attributes.clone();
            entry.thread.attributes.system_labels = update.system_labels.iter().copied().collect();
            entry.thread.attributes.user_labels = update.user_labels.iter().cloned().collect();
            if entry.thread.attributes != before {
                changes.push(AttributeChange {
                    thread_id: update.thread_id.clone(),
                    before,
                    after: entry.thread.attributes.clone(),
                });
            }
        }
        changes
    }

    /// Re-stamp threads the server confirmed without returning labels, so
    /// polls issued before the confirmation stay stale for them. Threads
    /// written locally after `issued_at` keep their stamp.
    pub fn confirm(&mut self, thread_ids: &[String], issued_at: u64) -> usize {
        let mut confirmed = 0;
        for thread_id in thread_ids {
            let Some(entry) = self.threads.get_mut(thread_id) else {
                continue;
            };
            if entry.stamp > issued_at {
                continue;
            }
            self.sequence += 1;
            entry.stamp = self.sequence;
            confirmed += 1;
        }
        confirmed
    }

    /// Merge a server copy fetched at `issued_at`. New emails are always
    /// appended; attributes are taken only when no newer local write exists.
    pub fn merge(&mut self, server: Thread, issued_at: u64) -> Merge {
        let Some(entry) = self.threads.get_mut(&server.thread_id) else {
            let thread_id = server.thread_id.clone();
            self.threads.insert(thread_id, Entry { thread: server, stamp: 0 });
            return Merge::Inserted;
        };
        entry.thread.append_emails(&server.emails);
        if entry.stamp > issued_at {
            return Merge::Stale;
        }
        let before = entry.thread.attributes.clone();
        entry.thread.attributes = server.attributes;
        Merge::Updated(AttributeChange {
            thread_id: server.thread_id,
            before,
            after: entry.thread.attributes.clone(),
        })
    }

    /// Drop a thread entirely. Only permanent deletion does this.
    pub fn remove(&mut self, thread_id: &str) -> Option<Thread> {
        self.threads.remove(thread_id).map(|entry| entry.thread)
    }
}
