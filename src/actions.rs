//! Mutation orchestrator.
//!
//! Every user action runs in two phases. The optimistic phase computes a
//! label diff per thread, writes it to the cache and returns right away with
//! the toast to show. The remote phase is a [`PendingMutation`]: a boxed
//! future the caller awaits or spawns, which issues the remote call and
//! then reconciles the server's answer, or reports the failure and puts the
//! threads back when rollback is enabled.
//!
//! Plan limits are checked before anything is computed, so a rejected
//! action leaves the cache untouched.

use crate::cache::{MailCache, SharedCache};
use crate::config::{Config, PlanLimits};
use crate::diff::{compute_diff, LabelDiff, LabelRequest};
use crate::models::{Label, LabelRef, SystemLabel, Thread, ThreadAttributes, UserLabelRef};
use crate::notify::{thread_count, Notification, NotificationAction};
use crate::remote::{DeleteResponse, LabelsResponse, ReadStatusResponse, RemoteError, RemoteMailStore};
use crate::store::AttributeChange;
use crate::undo::{UndoToken, UndoableAction};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How the remote phase of an action ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    /// The server accepted the change and its answer was reconciled.
    Confirmed,
    /// Nothing changed locally, so nothing was sent.
    Unchanged,
    /// The remote call failed. Carries the failure toast.
    Failed(Notification),
}

impl Settled {
    fn combine(self, other: Settled) -> Settled {
        match (self, other) {
            (Settled::Failed(n), _) | (_, Settled::Failed(n)) => Settled::Failed(n),
            (Settled::Confirmed, _) | (_, Settled::Confirmed) => Settled::Confirmed,
            _ => Settled::Unchanged,
        }
    }
}

/// An action whose optimistic write is already visible.
pub struct PendingMutation {
    /// Success toast, shown as soon as the action returns.
    pub toast: Option<Notification>,
    /// Threads the optimistic write changed.
    pub thread_ids: Vec<String>,
    remote: BoxFuture<'static, Settled>,
}

impl fmt::Debug for PendingMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMutation")
            .field("toast", &self.toast)
            .field("thread_ids", &self.thread_ids)
            .finish_non_exhaustive()
    }
}

impl PendingMutation {
    fn unchanged() -> Self {
        Self {
            toast: None,
            thread_ids: Vec::new(),
            remote: future::ready(Settled::Unchanged).boxed(),
        }
    }

    /// Nothing was written and nothing will be sent.
    pub fn is_noop(&self) -> bool {
        self.thread_ids.is_empty() && self.toast.is_none()
    }

    /// Run the remote phase to completion.
    pub async fn settle(self) -> Settled {
        self.remote.await
    }

    /// Hand the remote phase to the runtime and keep the toast.
    pub fn spawn(self) -> (Option<Notification>, tokio::task::JoinHandle<Settled>) {
        (self.toast, tokio::spawn(self.remote))
    }

    fn join(self, other: PendingMutation) -> PendingMutation {
        let mut thread_ids = self.thread_ids;
        thread_ids.extend(other.thread_ids);
        let (a, b) = (self.remote, other.remote);
        Self {
            toast: self.toast.or(other.toast),
            thread_ids,
            remote: async move {
                let (a, b) = future::join(a, b).await;
                a.combine(b)
            }
            .boxed(),
        }
    }
}

/// Rejections raised before any state is touched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("No threads selected")]
    EmptySelection,

    #[error("Label limit reached ({count} of {limit})")]
    LabelQuotaExceeded { count: usize, limit: usize },

    #[error("Folder limit reached ({count} of {limit})")]
    FolderQuotaExceeded { count: usize, limit: usize },

    #[error("Not in Trash: {}", .0.join(", "))]
    NotInTrash(Vec<String>),
}

impl ActionError {
    /// The prompt shown in place of the action.
    pub fn notification(&self) -> Notification {
        match self {
            ActionError::EmptySelection => Notification::failure("Nothing selected", "Select at least one thread."),
            ActionError::LabelQuotaExceeded { limit, .. } => Notification::upsell(
                "Label limit reached",
                format!("Your plan includes {} labels. Upgrade to use more.", limit),
            ),
            ActionError::FolderQuotaExceeded { limit, .. } => Notification::upsell(
                "Folder limit reached",
                format!("Your plan includes {} folders. Upgrade to use more.", limit),
            ),
            ActionError::NotInTrash(ids) => Notification::failure(
                "Can't delete permanently",
                format!("Move {} to Trash first.", thread_count(ids.len())),
            ),
        }
    }
}

/// Prior attributes of the threads an optimistic write changed, and the
/// cache sequence right after the write.
#[derive(Debug, Clone, Default)]
struct Optimistic {
    previous: Vec<(String, ThreadAttributes)>,
    written_at: u64,
}

impl Optimistic {
    fn from_changes(changes: Vec<AttributeChange>, written_at: u64) -> Self {
        Self {
            previous: changes.into_iter().map(|c| (c.thread_id, c.before)).collect(),
            written_at,
        }
    }

    fn thread_ids(&self) -> Vec<String> {
        self.previous.iter().map(|(id, _)| id.clone()).collect()
    }

    fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }

    fn subset(&self, thread_ids: &[String]) -> Self {
        Self {
            previous: self
                .previous
                .iter()
                .filter(|(id, _)| thread_ids.contains(id))
                .cloned()
                .collect(),
            written_at: self.written_at,
        }
    }
}

/// What a failed remote call puts back.
enum Compensation {
    Restore(Optimistic),
    Reinsert(Vec<Thread>),
}

impl Compensation {
    fn apply(self, cache: &mut MailCache) -> usize {
        match self {
            Compensation::Restore(optimistic) => cache.restore(&optimistic.previous, optimistic.written_at).len(),
            Compensation::Reinsert(threads) => cache.reinsert(threads),
        }
    }
}

fn ensure_selection(thread_ids: &[String]) -> Result<(), ActionError> {
    if thread_ids.is_empty() {
        return Err(ActionError::EmptySelection);
    }
    Ok(())
}

fn split_labels(labels: BTreeSet<LabelRef>) -> (Vec<SystemLabel>, Vec<UserLabelRef>) {
    let mut system = Vec::new();
    let mut user = Vec::new();
    for label in labels {
        match label {
            LabelRef::System(label) => system.push(label),
            LabelRef::User(label) => user.push(label),
        }
    }
    (system, user)
}

fn label_names(labels: &[UserLabelRef]) -> String {
    labels
        .iter()
        .map(|label| label.label_name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn reconcile_after(written_at: u64) -> impl FnOnce(&mut MailCache, LabelsResponse) + Send + 'static {
    move |cache, response| {
        let corrected = cache.reconcile_stamped(&response.updated_threads, written_at);
        if !corrected.is_empty() {
            debug!(threads = corrected.len(), "server state differed from optimistic write");
        }
    }
}

pub struct ThreadActions {
    cache: SharedCache,
    remote: Arc<dyn RemoteMailStore>,
    plan: PlanLimits,
    labels: Vec<Label>,
    rollback_on_failure: bool,
}

impl ThreadActions {
    pub fn new(cache: SharedCache, remote: Arc<dyn RemoteMailStore>, config: &Config) -> Self {
        Self {
            cache,
            remote,
            plan: config.plan.clone(),
            labels: Vec::new(),
            rollback_on_failure: config.rollback_on_failure,
        }
    }

    /// The account's label catalog, used for plan limit checks.
    pub fn with_labels(mut self, labels: Vec<Label>) -> Self {
        self.labels = labels;
        self
    }

    pub fn set_labels(&mut self, labels: Vec<Label>) {
        self.labels = labels;
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Move threads to Trash. Drafts have no Trash on the server and are
    /// deleted outright; `is_draft_set` marks the whole selection as drafts.
    pub fn trash(&self, thread_ids: &[String], is_draft_set: bool) -> Result<PendingMutation, ActionError> {
        ensure_selection(thread_ids)?;
        let (drafts, threads): (Vec<String>, Vec<String>) = self.cache.with(|cache| {
            thread_ids
                .iter()
                .cloned()
                .partition::<Vec<String>, _>(|id| is_draft_set || cache.store().read(id).is_some_and(ThreadAttributes::is_draft))
        });

        let moved = self.move_threads(UndoableAction::Trash, &threads, &[]);
        if drafts.is_empty() {
            return Ok(moved);
        }

        let (count, remote) = self.delete(drafts.clone(), "Couldn't discard drafts".to_string());
        info!(drafts = count, "drafts discarded");
        let title = if drafts.len() == 1 {
            "Draft discarded".to_string()
        } else {
            format!("{} drafts discarded", drafts.len())
        };
        let discarded = PendingMutation {
            toast: Some(Notification::new(title)),
            thread_ids: drafts,
            remote,
        };
        Ok(moved.join(discarded))
    }

    pub fn archive(&self, thread_ids: &[String]) -> Result<PendingMutation, ActionError> {
        ensure_selection(thread_ids)?;
        Ok(self.move_threads(UndoableAction::Archive, thread_ids, &[]))
    }

    /// Move threads into a folder or system label, leaving the system labels
    /// of the view they are moved from. Drafts stay where they are.
    pub fn move_to_folder_or_system_label(
        &self,
        thread_ids: &[String],
        target: &LabelRef,
        current_system_labels: &[SystemLabel],
    ) -> Result<PendingMutation, ActionError> {
        ensure_selection(thread_ids)?;
        match target {
            LabelRef::System(SystemLabel::Trash) => return self.trash(thread_ids, false),
            LabelRef::User(label) if !label.is_folder() => {
                return self.apply_user_label(thread_ids, std::slice::from_ref(label));
            }
            LabelRef::User(folder) => self.check_quota([folder])?,
            LabelRef::System(_) => {}
        }

        let movable: Vec<String> = self.cache.with(|cache| {
            thread_ids
                .iter()
                .filter(|id| !cache.store().read(id).is_some_and(ThreadAttributes::is_draft))
                .cloned()
                .collect()
        });
        let action = UndoableAction::Move { target: target.clone() };
        Ok(self.move_threads(action, &movable, current_system_labels))
    }

    /// Add user labels. Plain labels sit alongside everything else; a folder
    /// follows the folder rules.
    pub fn apply_user_label(&self, thread_ids: &[String], labels: &[UserLabelRef]) -> Result<PendingMutation, ActionError> {
        ensure_selection(thread_ids)?;
        if labels.is_empty() {
            return Ok(PendingMutation::unchanged());
        }
        self.check_quota(labels)?;

        let optimistic = self.relabel(thread_ids, |_, _| {
            LabelRequest::add(labels.iter().cloned().map(LabelRef::User))
        });
        if optimistic.is_empty() {
            return Ok(PendingMutation::unchanged());
        }
        let count = optimistic.previous.len();
        info!(threads = count, labels = %label_names(labels), "labels applied");

        let toast = Notification::new(format!("Applied {} to {}", label_names(labels), thread_count(count)));
        let thread_ids = optimistic.thread_ids();
        let remote = self.send_apply(
            "Couldn't apply labels".to_string(),
            optimistic,
            Vec::new(),
            labels.to_vec(),
        );
        Ok(PendingMutation {
            toast: Some(toast),
            thread_ids,
            remote,
        })
    }

    pub fn remove_user_label(&self, thread_ids: &[String], labels: &[UserLabelRef]) -> Result<PendingMutation, ActionError> {
        ensure_selection(thread_ids)?;
        let optimistic = self.relabel(thread_ids, |_, _| {
            LabelRequest::remove(labels.iter().cloned().map(LabelRef::User))
        });
        if optimistic.is_empty() {
            return Ok(PendingMutation::unchanged());
        }
        let count = optimistic.previous.len();
        info!(threads = count, labels = %label_names(labels), "labels removed");

        let toast = Notification::new(format!("Removed {} from {}", label_names(labels), thread_count(count)));
        let thread_ids = optimistic.thread_ids();
        let remote = {
            let client = Arc::clone(&self.remote);
            let ids = thread_ids.clone();
            let labels = labels.to_vec();
            let written_at = optimistic.written_at;
            let call = async move { client.remove_labels(&ids, &[], &labels).await };
            self.dispatch(
                "remove_labels",
                "Couldn't remove labels".to_string(),
                Compensation::Restore(optimistic),
                call,
                reconcile_after(written_at),
            )
        };
        Ok(PendingMutation {
            toast: Some(toast),
            thread_ids,
            remote,
        })
    }

    pub fn mark_read_unread(&self, thread_ids: &[String], read: bool) -> Result<PendingMutation, ActionError> {
        ensure_selection(thread_ids)?;
        let optimistic = self.cache.with(|cache| {
            let changes = cache.set_read(thread_ids, read);
            Optimistic::from_changes(changes, cache.sequence())
        });
        if optimistic.is_empty() {
            return Ok(PendingMutation::unchanged());
        }
        info!(threads = optimistic.previous.len(), read, "read status applied");

        let thread_ids = optimistic.thread_ids();
        let written_at = optimistic.written_at;
        let client = Arc::clone(&self.remote);
        let ids = thread_ids.clone();
        let call = async move { client.set_read_status(&ids, read).await };
        let title = if read { "Couldn't mark as read" } else { "Couldn't mark as unread" };
        let remote = self.dispatch(
            "set_read_status",
            title.to_string(),
            Compensation::Restore(optimistic),
            call,
            move |cache, response: ReadStatusResponse| {
                let confirmed = cache.confirm(&response.updated_thread_ids, written_at);
                debug!(threads = confirmed, read, "read status confirmed");
            },
        );
        Ok(PendingMutation {
            toast: None,
            thread_ids,
            remote,
        })
    }

    /// Delete threads for good. Every cached thread in the selection must be
    /// in Trash; uncached IDs are ignored.
    pub fn delete_threads_permanently(&self, thread_ids: &[String]) -> Result<PendingMutation, ActionError> {
        ensure_selection(thread_ids)?;
        let (cached, outside): (Vec<String>, Vec<String>) = self.cache.with(|cache| {
            let store = cache.store();
            let cached: Vec<String> = thread_ids.iter().filter(|id| store.contains(id)).cloned().collect();
            let outside: Vec<String> = cached
                .iter()
                .filter(|id| {
                    !store
                        .read(id)
                        .is_some_and(|attrs| attrs.system_labels.contains(&SystemLabel::Trash))
                })
                .cloned()
                .collect();
            (cached, outside)
        });
        if !outside.is_empty() {
            return Err(ActionError::NotInTrash(outside));
        }
        if cached.is_empty() {
            return Ok(PendingMutation::unchanged());
        }

        let (count, remote) = self.delete(cached.clone(), "Couldn't delete".to_string());
        info!(threads = count, "threads deleted permanently");
        Ok(PendingMutation {
            toast: Some(Notification::new(format!("Deleted {} forever", thread_count(count)))),
            thread_ids: cached,
            remote,
        })
    }

    /// Cancel a scheduled send. The thread goes back to Drafts.
    pub fn unschedule_send(&self, thread_id: &str, scheduled_email_id: &str) -> Result<PendingMutation, ActionError> {
        let thread_ids = vec![thread_id.to_string()];
        let optimistic = self.relabel(&thread_ids, |_, _| LabelRequest::unschedule());
        if optimistic.is_empty() {
            return Ok(PendingMutation::unchanged());
        }
        info!(thread_id, scheduled_email_id, "scheduled send cancelled");

        let client = Arc::clone(&self.remote);
        let (id, email_id) = (thread_id.to_string(), scheduled_email_id.to_string());
        let written_at = optimistic.written_at;
        let call = async move { client.unschedule_send(&id, &email_id).await };
        let remote = self.dispatch(
            "unschedule_send",
            "Couldn't cancel the scheduled send".to_string(),
            Compensation::Restore(optimistic),
            call,
            reconcile_after(written_at),
        );
        Ok(PendingMutation {
            toast: Some(Notification::new("Send cancelled").with_body("The message is back in Drafts.")),
            thread_ids,
            remote,
        })
    }

    /// Mark every thread under a label read. The server covers threads that
    /// are not cached; locally only the cached ones flip.
    pub fn mark_all_read(&self, label: &str) -> PendingMutation {
        let optimistic = self.cache.with(|cache| {
            let changes = cache.mark_all_read(label);
            Optimistic::from_changes(changes, cache.sequence())
        });
        info!(label, threads = optimistic.previous.len(), "marked all read");

        let thread_ids = optimistic.thread_ids();
        let client = Arc::clone(&self.remote);
        let remote_label = label.to_string();
        let call = async move { client.set_all_threads_read_status(&remote_label, true).await };
        let remote = self.dispatch(
            "set_all_threads_read_status",
            "Couldn't mark all as read".to_string(),
            Compensation::Restore(optimistic),
            call,
            |_, ()| {},
        );
        PendingMutation {
            toast: None,
            thread_ids,
            remote,
        }
    }

    /// Return the threads of a trash, archive or move to the labels they
    /// carried before it.
    pub fn undo(&self, token: &UndoToken) -> PendingMutation {
        let before: HashMap<&str, &ThreadAttributes> =
            token.previous.iter().map(|(id, attrs)| (id.as_str(), attrs)).collect();
        let optimistic = self.relabel(&token.thread_ids(), |id, current| {
            before
                .get(id)
                .map_or_else(LabelRequest::default, |attrs| LabelRequest::revert_to(attrs, current))
        });
        if optimistic.is_empty() {
            return PendingMutation::unchanged();
        }
        info!(action = %token.action.description(), threads = optimistic.previous.len(), "undo applied");

        // one remote call per distinct label set
        let mut groups: BTreeMap<BTreeSet<LabelRef>, Vec<String>> = BTreeMap::new();
        for (id, _) in &optimistic.previous {
            if let Some(attrs) = before.get(id.as_str()) {
                groups.entry(attrs.labels()).or_default().push(id.clone());
            }
        }
        let failure = format!("Couldn't undo {}", token.action.description());
        let calls: Vec<BoxFuture<'static, Settled>> = groups
            .into_iter()
            .map(|(labels, ids)| {
                let (system, user) = split_labels(labels);
                self.send_apply(failure.clone(), optimistic.subset(&ids), system, user)
            })
            .collect();

        PendingMutation {
            toast: Some(Notification::new(format!("Undid {}", token.action.description()))),
            thread_ids: optimistic.thread_ids(),
            remote: async move {
                future::join_all(calls)
                    .await
                    .into_iter()
                    .fold(Settled::Unchanged, Settled::combine)
            }
            .boxed(),
        }
    }

    fn move_threads(&self, action: UndoableAction, thread_ids: &[String], from: &[SystemLabel]) -> PendingMutation {
        let target = action.target();
        let optimistic = self.relabel(thread_ids, |_, current| LabelRequest::move_to(target.clone(), from, current));
        if optimistic.is_empty() {
            return PendingMutation::unchanged();
        }
        let count = optimistic.previous.len();
        info!(action = %action.description(), threads = count, "optimistic move applied");

        let title = match &action {
            UndoableAction::Trash => format!("Moved {} to Trash", thread_count(count)),
            UndoableAction::Archive => format!("Archived {}", thread_count(count)),
            UndoableAction::Move { target } => format!("Moved {} to {}", thread_count(count), target.display_name()),
        };
        let failure = format!("Couldn't {}", action.description());
        let token = UndoToken {
            action,
            previous: optimistic.previous.clone(),
        };
        let (system, user) = split_labels(BTreeSet::from([target]));
        let thread_ids = optimistic.thread_ids();
        let remote = self.send_apply(failure, optimistic, system, user);
        PendingMutation {
            toast: Some(Notification::new(title).with_action(NotificationAction::Undo { token })),
            thread_ids,
            remote,
        }
    }

    /// Compute and write one diff per cached thread. Threads whose diff is
    /// empty are left out.
    fn relabel<F>(&self, thread_ids: &[String], request: F) -> Optimistic
    where
        F: Fn(&str, &ThreadAttributes) -> LabelRequest,
    {
        self.cache.with(|cache| {
            let diffs: Vec<(String, LabelDiff)> = cache
                .store()
                .read_many(thread_ids)
                .into_iter()
                .map(|(id, current)| (id.to_string(), compute_diff(current, &request(id, current))))
                .filter(|(_, diff)| !diff.is_empty())
                .collect();
            for (thread_id, diff) in &diffs {
                debug!(
                    %thread_id,
                    rule = ?diff.rule,
                    add = diff.to_add.len(),
                    remove = diff.to_remove.len(),
                    "label diff"
                );
            }
            let changes = cache.apply_diffs(&diffs);
            Optimistic::from_changes(changes, cache.sequence())
        })
    }

    fn check_quota<'a>(&self, labels: impl IntoIterator<Item = &'a UserLabelRef>) -> Result<(), ActionError> {
        let (mut folders, mut plain) = (false, false);
        for label in labels {
            if label.is_folder() {
                folders = true;
            } else {
                plain = true;
            }
        }
        let owned = |folder: bool| {
            self.labels
                .iter()
                .filter(|label| match label {
                    Label::UserFolder { .. } => folder,
                    Label::UserPlain { .. } => !folder,
                    Label::System { .. } => false,
                })
                .count()
        };
        if let (true, Some(limit)) = (plain, self.plan.max_labels) {
            let count = owned(false);
            if count > limit {
                warn!(count, limit, "label quota exceeded");
                return Err(ActionError::LabelQuotaExceeded { count, limit });
            }
        }
        if let (true, Some(limit)) = (folders, self.plan.max_folders) {
            let count = owned(true);
            if count > limit {
                warn!(count, limit, "folder quota exceeded");
                return Err(ActionError::FolderQuotaExceeded { count, limit });
            }
        }
        Ok(())
    }

    fn send_apply(
        &self,
        failure: String,
        optimistic: Optimistic,
        system: Vec<SystemLabel>,
        user: Vec<UserLabelRef>,
    ) -> BoxFuture<'static, Settled> {
        let client = Arc::clone(&self.remote);
        let ids = optimistic.thread_ids();
        let written_at = optimistic.written_at;
        let call = async move { client.apply_labels(&ids, &system, &user).await };
        self.dispatch(
            "apply_labels",
            failure,
            Compensation::Restore(optimistic),
            call,
            reconcile_after(written_at),
        )
    }

    /// Remove threads locally and delete them on the server. Returns how
    /// many were cached.
    fn delete(&self, thread_ids: Vec<String>, failure: String) -> (usize, BoxFuture<'static, Settled>) {
        let removed = self.cache.with(|cache| cache.remove_threads(&thread_ids));
        let count = removed.len();
        let client = Arc::clone(&self.remote);
        let call = async move { client.delete_thread(&thread_ids).await };
        let remote = self.dispatch(
            "delete_thread",
            failure,
            Compensation::Reinsert(removed),
            call,
            |_, response: DeleteResponse| {
                debug!(threads = response.thread_ids.len(), "delete confirmed");
            },
        );
        (count, remote)
    }

    fn dispatch<T, Fut, F>(
        &self,
        call_name: &'static str,
        failure: String,
        compensation: Compensation,
        call: Fut,
        on_success: F,
    ) -> BoxFuture<'static, Settled>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
        F: FnOnce(&mut MailCache, T) + Send + 'static,
    {
        let cache = self.cache.clone();
        let rollback = self.rollback_on_failure;
        async move {
            debug!(call = call_name, "remote call issued");
            match call.await {
                Ok(response) => {
                    cache.with(|cache| on_success(cache, response));
                    Settled::Confirmed
                }
                Err(e) => {
                    warn!(call = call_name, error = %e, "remote mutation failed");
                    if rollback {
                        let restored = cache.with(|cache| compensation.apply(cache));
                        info!(call = call_name, threads = restored, "optimistic write rolled back");
                    }
                    Settled::Failed(Notification::failure(failure, e.to_string()))
                }
            }
        }
        .boxed()
    }
}
