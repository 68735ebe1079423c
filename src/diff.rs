//! Label diff engine.
//!
//! Turns a thread's current labels and a requested transition into the
//! labels to add and the labels to remove, applying the exclusivity rules:
//! Trash and Archive absorb every other label, leaving them restores the
//! thread to a target set, and a thread carries at most one folder, which
//! evicts its system labels.
//!
//! Everything here is pure. The same inputs always give the same diff, and
//! `to_add` and `to_remove` never overlap.

use crate::models::{LabelRef, SystemLabel, ThreadAttributes};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A requested label transition for one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRequest {
    pub add: BTreeSet<LabelRef>,
    pub remove: BTreeSet<LabelRef>,
    /// System labels the thread returns to when it leaves Trash, Archive or
    /// its only folder without naming a destination.
    pub restore_to: BTreeSet<SystemLabel>,
}

impl Default for LabelRequest {
    fn default() -> Self {
        Self {
            add: BTreeSet::new(),
            remove: BTreeSet::new(),
            restore_to: BTreeSet::from([SystemLabel::Inbox]),
        }
    }
}

impl LabelRequest {
    pub fn add(labels: impl IntoIterator<Item = LabelRef>) -> Self {
        Self {
            add: labels.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn remove(labels: impl IntoIterator<Item = LabelRef>) -> Self {
        Self {
            remove: labels.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Move into `target`, leaving the system labels of the view the thread
    /// is moved from. Moving into a system label or another folder also
    /// leaves the current folder.
    pub fn move_to(target: LabelRef, from: &[SystemLabel], current: &ThreadAttributes) -> Self {
        let mut remove: BTreeSet<LabelRef> = from.iter().copied().map(LabelRef::System).collect();
        if let Some(folder) = current.folder() {
            let folder = LabelRef::User(folder.clone());
            if folder != target && (target.is_folder() || target.as_system().is_some()) {
                remove.insert(folder);
            }
        }
        Self {
            add: BTreeSet::from([target]),
            remove,
            ..Self::default()
        }
    }

    /// Scheduled send back to Drafts. There is no Trash or Archive history
    /// to restore.
    pub fn unschedule() -> Self {
        Self {
            add: BTreeSet::from([LabelRef::System(SystemLabel::Drafts)]),
            remove: BTreeSet::from([LabelRef::System(SystemLabel::ScheduleSend)]),
            restore_to: BTreeSet::new(),
        }
    }

    /// Return a thread to exactly the labels it carried in `before`.
    pub fn revert_to(before: &ThreadAttributes, current: &ThreadAttributes) -> Self {
        let target = before.labels();
        let remove = current.labels().difference(&target).cloned().collect();
        Self {
            add: target,
            remove,
            restore_to: BTreeSet::new(),
        }
    }

    fn adds_system(&self, label: SystemLabel) -> bool {
        self.add.contains(&LabelRef::System(label))
    }

    fn added_folder(&self) -> Option<&LabelRef> {
        self.add.iter().find(|label| label.is_folder())
    }
}

/// Which row of the rule table produced a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rule {
    EnterTrash,
    EnterArchive,
    Restore,
    Relabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDiff {
    pub to_add: BTreeSet<LabelRef>,
    pub to_remove: BTreeSet<LabelRef>,
    pub rule: Rule,
}

impl LabelDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Apply to a thread's attributes. Applying twice equals applying once.
    pub fn apply(&self, attributes: &mut ThreadAttributes) {
        let mut labels = attributes.labels();
        for label in &self.to_remove {
            labels.remove(label);
        }
        for label in &self.to_add {
            labels.replace(label.clone());
        }
        attributes.set_labels(labels);
    }
}

struct Context<'a> {
    current: &'a ThreadAttributes,
    labels: BTreeSet<LabelRef>,
    request: &'a LabelRequest,
}

impl Context<'_> {
    fn exclusive_labels(&self) -> BTreeSet<LabelRef> {
        self.current
            .system_labels
            .iter()
            .filter(|label| label.is_exclusive())
            .copied()
            .map(LabelRef::System)
            .collect()
    }
}

type Guard = fn(&Context<'_>) -> bool;

/// Evaluated top to bottom; the first matching guard picks the rule.
const RULES: &[(Rule, Guard)] = &[
    (Rule::EnterTrash, enters_trash),
    (Rule::EnterArchive, enters_archive),
    (Rule::Restore, restores),
    (Rule::Relabel, always),
];

fn enters_trash(cx: &Context<'_>) -> bool {
    cx.request.adds_system(SystemLabel::Trash)
}

fn enters_archive(cx: &Context<'_>) -> bool {
    cx.request.adds_system(SystemLabel::Archive)
}

fn restores(cx: &Context<'_>) -> bool {
    let exclusive = cx.exclusive_labels();
    if exclusive.is_empty() {
        return false;
    }
    let leaves = exclusive.iter().any(|label| cx.request.remove.contains(label));
    let adds_system = cx
        .request
        .add
        .iter()
        .any(|label| matches!(label, LabelRef::System(l) if !l.is_exclusive()));
    leaves || adds_system
}

fn always(_: &Context<'_>) -> bool {
    true
}

/// Compute the labels to add and remove for one thread.
pub fn compute_diff(current: &ThreadAttributes, request: &LabelRequest) -> LabelDiff {
    let cx = Context {
        current,
        labels: current.labels(),
        request,
    };
    let rule = RULES
        .iter()
        .find(|(_, guard)| guard(&cx))
        .map(|(rule, _)| *rule)
        .unwrap_or(Rule::Relabel);

    let (to_add, to_remove) = match rule {
        Rule::EnterTrash => absorb(&cx, SystemLabel::Trash),
        Rule::EnterArchive => absorb(&cx, SystemLabel::Archive),
        Rule::Restore => {
            let mut to_add = request.add.clone();
            if !has_destination(&to_add) {
                to_add.extend(request.restore_to.iter().copied().map(LabelRef::System));
            }
            let mut to_remove = cx.exclusive_labels();
            to_remove.extend(request.remove.iter().cloned());
            fold_folder_rules(&cx, to_add, to_remove)
        }
        Rule::Relabel => fold_folder_rules(&cx, request.add.clone(), request.remove.clone()),
    };

    normalize(&cx, rule, to_add, to_remove)
}

fn absorb(cx: &Context<'_>, label: SystemLabel) -> (BTreeSet<LabelRef>, BTreeSet<LabelRef>) {
    let target = LabelRef::System(label);
    let to_remove = cx.labels.iter().filter(|l| **l != target).cloned().collect();
    (BTreeSet::from([target]), to_remove)
}

fn has_destination(labels: &BTreeSet<LabelRef>) -> bool {
    labels
        .iter()
        .any(|label| label.is_folder() || label.as_system().is_some())
}

fn fold_folder_rules(
    cx: &Context<'_>,
    mut to_add: BTreeSet<LabelRef>,
    mut to_remove: BTreeSet<LabelRef>,
) -> (BTreeSet<LabelRef>, BTreeSet<LabelRef>) {
    let current_folder = cx.current.folder().cloned().map(LabelRef::User);

    if let Some(folder) = cx.request.added_folder().cloned() {
        // at most one folder per thread
        to_add.retain(|label| !label.is_folder() || *label == folder);
        match &current_folder {
            None => {
                to_remove.extend(cx.current.system_labels.iter().copied().map(LabelRef::System));
            }
            Some(existing) if *existing != folder => {
                to_remove.insert(existing.clone());
            }
            Some(_) => {}
        }
        return (to_add, to_remove);
    }

    if let Some(existing) = current_folder {
        if to_remove.contains(&existing) {
            let requested: BTreeSet<LabelRef> = cx
                .request
                .add
                .iter()
                .filter(|label| label.as_system().is_some())
                .cloned()
                .collect();
            if requested.is_empty() {
                to_add.extend(cx.request.restore_to.iter().copied().map(LabelRef::System));
            } else {
                to_add.extend(requested);
            }
        }
    }
    (to_add, to_remove)
}

fn normalize(
    cx: &Context<'_>,
    rule: Rule,
    mut to_add: BTreeSet<LabelRef>,
    mut to_remove: BTreeSet<LabelRef>,
) -> LabelDiff {
    to_remove.retain(|label| !to_add.contains(label) && cx.labels.contains(label));
    to_add.retain(|label| !cx.labels.contains(label));
    LabelDiff {
        to_add,
        to_remove,
        rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::*;
    use crate::models::UserLabelRef;

    fn sys(label: SystemLabel) -> LabelRef {
        LabelRef::System(label)
    }

    fn user(label: UserLabelRef) -> LabelRef {
        LabelRef::User(label)
    }

    fn attrs_from(labels: &BTreeSet<LabelRef>) -> ThreadAttributes {
        let mut attrs = ThreadAttributes::default();
        attrs.set_labels(labels.clone());
        attrs
    }

    /// Every subset of a small universe, skipping sets that already break
    /// the one-folder and Trash/Archive invariants.
    fn label_sets(universe: &[LabelRef]) -> Vec<BTreeSet<LabelRef>> {
        (0..(1u32 << universe.len()))
            .map(|mask| {
                universe
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, label)| label.clone())
                    .collect::<BTreeSet<_>>()
            })
            .filter(|set| set.iter().filter(|l| l.is_folder()).count() <= 1)
            .collect()
    }

    fn universe() -> Vec<LabelRef> {
        vec![
            sys(SystemLabel::Inbox),
            sys(SystemLabel::Sent),
            sys(SystemLabel::Spam),
            user(plain_work()),
            user(folder_x()),
        ]
    }

    #[test]
    fn test_trash_absorbs_every_label() {
        for set in label_sets(&universe()) {
            let diff = compute_diff(&attrs_from(&set), &LabelRequest::add([sys(SystemLabel::Trash)]));
            assert_eq!(diff.rule, Rule::EnterTrash);
            assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Trash)]));
            assert_eq!(diff.to_remove, set);
        }
    }

    #[test]
    fn test_archive_absorbs_every_label() {
        for set in label_sets(&universe()) {
            let diff = compute_diff(&attrs_from(&set), &LabelRequest::add([sys(SystemLabel::Archive)]));
            assert_eq!(diff.rule, Rule::EnterArchive);
            assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Archive)]));
            assert_eq!(diff.to_remove, set);
        }
    }

    #[test]
    fn test_archive_from_trash_swaps_exclusive_label() {
        let current = ThreadAttributes::new(true, [SystemLabel::Trash]);
        let diff = compute_diff(&current, &LabelRequest::add([sys(SystemLabel::Archive)]));
        assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Archive)]));
        assert_eq!(diff.to_remove, BTreeSet::from([sys(SystemLabel::Trash)]));
    }

    #[test]
    fn test_restore_adds_intended_set_and_removes_exclusive_label() {
        let mut base = universe();
        base.retain(|label| !matches!(label, LabelRef::System(SystemLabel::Inbox)));
        for exclusive in [SystemLabel::Trash, SystemLabel::Archive] {
            for mut set in label_sets(&base).into_iter().filter(|s| !s.iter().any(|l| l.is_folder())) {
                set.insert(sys(exclusive));
                let request = LabelRequest {
                    add: BTreeSet::from([sys(SystemLabel::Inbox)]),
                    remove: BTreeSet::from([sys(exclusive)]),
                    ..LabelRequest::default()
                };
                let diff = compute_diff(&attrs_from(&set), &request);
                assert_eq!(diff.rule, Rule::Restore);
                assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Inbox)]));
                assert_eq!(diff.to_remove, BTreeSet::from([sys(exclusive)]));
            }
        }
    }

    #[test]
    fn test_removing_trash_alone_restores_to_inbox() {
        let current = ThreadAttributes::new(false, [SystemLabel::Trash]);
        let diff = compute_diff(&current, &LabelRequest::remove([sys(SystemLabel::Trash)]));
        assert_eq!(diff.rule, Rule::Restore);
        assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Inbox)]));
        assert_eq!(diff.to_remove, BTreeSet::from([sys(SystemLabel::Trash)]));
    }

    #[test]
    fn test_move_out_of_trash_is_a_restore() {
        let current = ThreadAttributes::new(true, [SystemLabel::Trash]);
        let request = LabelRequest::move_to(sys(SystemLabel::Inbox), &[], &current);
        let diff = compute_diff(&current, &request);
        assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Inbox)]));
        assert_eq!(diff.to_remove, BTreeSet::from([sys(SystemLabel::Trash)]));
    }

    #[test]
    fn test_entering_folder_evicts_system_labels() {
        let current = ThreadAttributes::new(false, [SystemLabel::Inbox, SystemLabel::Sent]);
        let diff = compute_diff(&current, &LabelRequest::add([user(folder_x())]));
        assert_eq!(diff.to_add, BTreeSet::from([user(folder_x())]));
        assert_eq!(
            diff.to_remove,
            BTreeSet::from([sys(SystemLabel::Inbox), sys(SystemLabel::Sent)])
        );
    }

    #[test]
    fn test_second_folder_replaces_first() {
        let current = ThreadAttributes::default().with_user_label(folder_x());
        let diff = compute_diff(&current, &LabelRequest::add([user(folder_y())]));
        assert_eq!(diff.to_add, BTreeSet::from([user(folder_y())]));
        assert_eq!(diff.to_remove, BTreeSet::from([user(folder_x())]));
    }

    #[test]
    fn test_leaving_only_folder_restores_visibility() {
        let current = ThreadAttributes::default()
            .with_user_label(folder_x())
            .with_user_label(plain_work());
        let diff = compute_diff(&current, &LabelRequest::remove([user(folder_x())]));
        assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Inbox)]));
        assert_eq!(diff.to_remove, BTreeSet::from([user(folder_x())]));
    }

    #[test]
    fn test_move_from_folder_to_system_label() {
        let current = ThreadAttributes::default().with_user_label(folder_x());
        let request = LabelRequest::move_to(sys(SystemLabel::Spam), &[], &current);
        let diff = compute_diff(&current, &request);
        assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Spam)]));
        assert_eq!(diff.to_remove, BTreeSet::from([user(folder_x())]));
    }

    #[test]
    fn test_plain_labels_are_orthogonal() {
        let current = ThreadAttributes::new(false, [SystemLabel::Inbox]);
        let diff = compute_diff(&current, &LabelRequest::add([user(plain_work())]));
        assert_eq!(diff.rule, Rule::Relabel);
        assert_eq!(diff.to_add, BTreeSet::from([user(plain_work())]));
        assert!(diff.to_remove.is_empty());

        let labelled = current.with_user_label(plain_work());
        let diff = compute_diff(&labelled, &LabelRequest::remove([user(plain_work())]));
        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_remove, BTreeSet::from([user(plain_work())]));
    }

    #[test]
    fn test_unschedule_moves_to_drafts() {
        let current = ThreadAttributes::new(true, [SystemLabel::ScheduleSend]);
        let diff = compute_diff(&current, &LabelRequest::unschedule());
        assert_eq!(diff.to_add, BTreeSet::from([sys(SystemLabel::Drafts)]));
        assert_eq!(diff.to_remove, BTreeSet::from([sys(SystemLabel::ScheduleSend)]));
    }

    #[test]
    fn test_diff_sides_are_disjoint_and_second_pass_is_empty() {
        let requests = [
            LabelRequest::add([sys(SystemLabel::Trash)]),
            LabelRequest::add([sys(SystemLabel::Archive)]),
            LabelRequest::add([user(folder_y())]),
            LabelRequest::add([user(plain_work())]),
            LabelRequest::remove([user(folder_x())]),
            LabelRequest::remove([sys(SystemLabel::Inbox)]),
        ];
        for set in label_sets(&universe()) {
            for request in &requests {
                let mut attrs = attrs_from(&set);
                let diff = compute_diff(&attrs, request);
                assert!(diff.to_add.is_disjoint(&diff.to_remove));

                diff.apply(&mut attrs);
                let once = attrs.clone();
                diff.apply(&mut attrs);
                assert_eq!(attrs, once);

                assert!(compute_diff(&attrs, request).is_empty(), "{:?} on {:?}", request, set);
            }
        }
    }

    #[test]
    fn test_revert_to_restores_prior_labels() {
        let before = ThreadAttributes::new(false, [SystemLabel::Inbox]).with_user_label(plain_work());
        let mut current = before.clone();
        compute_diff(&current, &LabelRequest::add([sys(SystemLabel::Trash)])).apply(&mut current);
        assert_eq!(current.system_labels, BTreeSet::from([SystemLabel::Trash]));

        let diff = compute_diff(&current, &LabelRequest::revert_to(&before, &current));
        diff.apply(&mut current);
        assert_eq!(current.labels(), before.labels());
    }
}
