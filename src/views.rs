use crate::models::{MailboxViewKey, PageInfo, Thread, ThreadAttributes};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Ordered thread IDs of one (label, filter) projection plus its
/// pagination state. Threads themselves live in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MailboxView {
    pub thread_ids: Vec<String>,
    pub cursor: Option<String>,
    pub has_next_page: bool,
}

impl MailboxView {
    pub fn contains(&self, thread_id: &str) -> bool {
        self.thread_ids.iter().any(|id| id == thread_id)
    }

    pub fn len(&self) -> usize {
        self.thread_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thread_ids.is_empty()
    }

    fn prepend(&mut self, thread_id: &str) -> bool {
        if self.contains(thread_id) {
            return false;
        }
        self.thread_ids.insert(0, thread_id.to_string());
        true
    }

    fn remove(&mut self, thread_id: &str) -> bool {
        let len = self.thread_ids.len();
        self.thread_ids.retain(|id| id != thread_id);
        self.thread_ids.len() != len
    }
}

/// Every loaded mailbox view, keyed by label and filter. A view becomes
/// active when its first page is loaded or a thread is added to it.
#[derive(Debug, Default)]
pub struct MailboxViewIndex {
    views: HashMap<MailboxViewKey, MailboxView>,
}

impl MailboxViewIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self, key: &MailboxViewKey) -> Option<&MailboxView> {
        self.views.get(key)
    }

    pub fn is_active(&self, key: &MailboxViewKey) -> bool {
        self.views.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &MailboxViewKey> {
        self.views.keys()
    }

    /// Active filter variants of one label.
    pub fn variants<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a MailboxViewKey> + 'a {
        self.views.keys().filter(move |key| key.label == label)
    }

    /// Prepend the thread when it passes the view's filter.
    pub fn add_to_view(&mut self, key: &MailboxViewKey, thread: &Thread) -> bool {
        if !key.filter.matches(thread) {
            return false;
        }
        self.views
            .entry(key.clone())
            .or_default()
            .prepend(&thread.thread_id)
    }

    pub fn remove_from_view(&mut self, key: &MailboxViewKey, thread_id: &str) -> bool {
        self.views
            .get_mut(key)
            .is_some_and(|view| view.remove(thread_id))
    }

    pub fn remove_everywhere(&mut self, thread_id: &str) {
        for view in self.views.values_mut() {
            view.remove(thread_id);
        }
    }

    /// Move a thread in and out of views after its attributes changed from
    /// `before` to the thread's current attributes.
    ///
    /// Labels the thread left drop it from every active filter variant;
    /// labels it gained prepend it to each variant whose filter it passes.
    /// A read flip re-evaluates read-filtered variants the same way. A view
    /// the thread already qualified for is left alone, so threads outside
    /// the loaded window are not pulled in by unrelated changes.
    pub fn apply_transition(&mut self, before: &ThreadAttributes, thread: &Thread) {
        let has_attachments = thread.has_attachments();
        for (key, view) in self.views.iter_mut() {
            let was = key.admits_attributes(before, has_attachments);
            let now = key.admits(thread);
            if !now {
                view.remove(&thread.thread_id);
            } else if !was {
                view.prepend(&thread.thread_id);
            }
        }
    }

    /// Install a page from the server, keeping server order. The first page
    /// replaces the view; later pages append.
    pub fn load_page(&mut self, key: &MailboxViewKey, thread_ids: Vec<String>, page_info: PageInfo, append: bool) {
        let view = self.views.entry(key.clone()).or_default();
        if !append {
            view.thread_ids.clear();
        }
        let mut seen: HashSet<String> = view.thread_ids.iter().cloned().collect();
        for id in thread_ids {
            if seen.insert(id.clone()) {
                view.thread_ids.push(id);
            }
        }
        view.cursor = page_info.cursor;
        view.has_next_page = page_info.has_next_page;
    }

    /// Replace the head of a view with a refreshed first page, keeping the
    /// loaded tail (minus `dropped`) after it.
    pub fn refresh_head(&mut self, key: &MailboxViewKey, head: Vec<String>, dropped: &HashSet<String>, page_info: PageInfo) {
        let active = self.views.contains_key(key);
        let view = self.views.entry(key.clone()).or_default();
        let mut seen: HashSet<String> = head.iter().cloned().collect();
        let tail: Vec<String> = view
            .thread_ids
            .drain(..)
            .filter(|id| !dropped.contains(id) && seen.insert(id.clone()))
            .collect();
        view.thread_ids = head;
        view.thread_ids.extend(tail);
        if !active {
            view.cursor = page_info.cursor;
            view.has_next_page = page_info.has_next_page;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::*;
    use crate::models::{MailboxFilter, SystemLabel};

    fn ids(view: &MailboxView) -> Vec<&str> {
        view.thread_ids.iter().map(String::as_str).collect()
    }

    fn inbox() -> MailboxViewKey {
        MailboxViewKey::system(SystemLabel::Inbox)
    }

    fn inbox_unread() -> MailboxViewKey {
        inbox().with_filter(MailboxFilter::unread())
    }

    #[test]
    fn test_add_respects_filter_and_dedups() {
        let mut index = MailboxViewIndex::new();
        let unread = thread("t1", false, &[SystemLabel::Inbox]);
        let read = thread("t2", true, &[SystemLabel::Inbox]);

        assert!(index.add_to_view(&inbox_unread(), &unread));
        assert!(!index.add_to_view(&inbox_unread(), &unread));
        assert!(!index.add_to_view(&inbox_unread(), &read));
        assert_eq!(ids(index.view(&inbox_unread()).unwrap()), vec!["t1"]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut index = MailboxViewIndex::new();
        assert!(!index.remove_from_view(&inbox(), "t1"));
        index.load_page(&inbox(), vec!["t1".to_string()], PageInfo::default(), false);
        assert!(!index.remove_from_view(&inbox(), "t2"));
        assert!(index.remove_from_view(&inbox(), "t1"));
    }

    #[test]
    fn test_load_page_keeps_server_order_and_appends() {
        let mut index = MailboxViewIndex::new();
        let first = PageInfo {
            cursor: Some("c1".to_string()),
            has_next_page: true,
        };
        index.load_page(&inbox(), vec!["b".into(), "a".into(), "b".into()], first, false);
        index.load_page(&inbox(), vec!["a".into(), "c".into()], PageInfo::default(), true);

        let view = index.view(&inbox()).unwrap();
        assert_eq!(ids(view), vec!["b", "a", "c"]);
        assert!(!view.has_next_page);
        assert_eq!(view.cursor, None);
    }

    #[test]
    fn test_transition_moves_thread_between_labels() {
        let mut index = MailboxViewIndex::new();
        let trash = MailboxViewKey::system(SystemLabel::Trash);
        index.load_page(&inbox(), vec!["t1".into(), "t2".into()], PageInfo::default(), false);
        index.load_page(&inbox_unread(), vec!["t1".into()], PageInfo::default(), false);
        index.load_page(&trash, vec!["t9".into()], PageInfo::default(), false);

        let before = thread("t1", false, &[SystemLabel::Inbox]).attributes;
        let after = thread("t1", false, &[SystemLabel::Trash]);
        index.apply_transition(&before, &after);

        assert_eq!(ids(index.view(&inbox()).unwrap()), vec!["t2"]);
        assert!(index.view(&inbox_unread()).unwrap().is_empty());
        assert_eq!(ids(index.view(&trash).unwrap()), vec!["t1", "t9"]);
    }

    #[test]
    fn test_read_flip_updates_unread_variant_only() {
        let mut index = MailboxViewIndex::new();
        index.load_page(&inbox(), vec!["t1".into()], PageInfo::default(), false);
        index.load_page(&inbox_unread(), vec!["t1".into()], PageInfo::default(), false);

        let before = thread("t1", false, &[SystemLabel::Inbox]).attributes;
        let after = thread("t1", true, &[SystemLabel::Inbox]);
        index.apply_transition(&before, &after);
        assert_eq!(ids(index.view(&inbox()).unwrap()), vec!["t1"]);
        assert!(index.view(&inbox_unread()).unwrap().is_empty());

        index.apply_transition(&after.attributes, &thread("t1", false, &[SystemLabel::Inbox]));
        assert_eq!(ids(index.view(&inbox_unread()).unwrap()), vec!["t1"]);
    }

    #[test]
    fn test_unrelated_change_does_not_pull_in_unloaded_thread() {
        let mut index = MailboxViewIndex::new();
        index.load_page(&inbox(), vec!["t1".into()], PageInfo::default(), false);

        let before = thread("t7", false, &[SystemLabel::Inbox]).attributes;
        let mut after = thread("t7", false, &[SystemLabel::Inbox]);
        after.attributes.user_labels.insert(plain_work());
        index.apply_transition(&before, &after);

        assert_eq!(ids(index.view(&inbox()).unwrap()), vec!["t1"]);
    }

    #[test]
    fn test_refresh_head_keeps_tail() {
        let mut index = MailboxViewIndex::new();
        index.load_page(&inbox(), vec!["a".into(), "b".into(), "c".into()], PageInfo::default(), false);
        let dropped = HashSet::from(["b".to_string()]);
        index.refresh_head(&inbox(), vec!["n".into(), "a".into()], &dropped, PageInfo::default());
        assert_eq!(ids(index.view(&inbox()).unwrap()), vec!["n", "a", "c"]);
    }
}
