use chrono::{DateTime, Utc};
use inflections::case::to_title_case;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Predefined mailbox categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemLabel {
    Inbox,
    Sent,
    Drafts,
    Spam,
    Archive,
    Trash,
    ScheduleSend,
}

impl SystemLabel {
    pub const ALL: [SystemLabel; 7] = [
        SystemLabel::Inbox,
        SystemLabel::Sent,
        SystemLabel::Drafts,
        SystemLabel::Spam,
        SystemLabel::Archive,
        SystemLabel::Trash,
        SystemLabel::ScheduleSend,
    ];

    /// Wire identifier, also used as the view label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "INBOX",
            Self::Sent => "SENT",
            Self::Drafts => "DRAFTS",
            Self::Spam => "SPAM",
            Self::Archive => "ARCHIVE",
            Self::Trash => "TRASH",
            Self::ScheduleSend => "SCHEDULE_SEND",
        }
    }

    /// Parses a wire identifier. Anything else is a user label ID.
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.as_str() == s)
    }

    /// Trash and Archive absorb every other label a thread carries.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Trash | Self::Archive)
    }

    pub fn display_name(&self) -> String {
        to_title_case(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelVariant {
    Plain,
    Folder,
}

/// A user label as carried on a thread. Identity is the label ID alone, so a
/// rename or recolor never makes the same label look like two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLabelRef {
    pub label_id: String,
    pub variant: LabelVariant,
    pub label_name: String,
    pub color: Option<String>,
}

impl UserLabelRef {
    pub fn plain(label_id: &str, label_name: &str) -> Self {
        Self {
            label_id: label_id.to_string(),
            variant: LabelVariant::Plain,
            label_name: label_name.to_string(),
            color: None,
        }
    }

    pub fn folder(label_id: &str, label_name: &str) -> Self {
        Self {
            label_id: label_id.to_string(),
            variant: LabelVariant::Folder,
            label_name: label_name.to_string(),
            color: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.variant == LabelVariant::Folder
    }
}

impl PartialEq for UserLabelRef {
    fn eq(&self, other: &Self) -> bool {
        self.label_id == other.label_id
    }
}

impl Eq for UserLabelRef {}

impl Hash for UserLabelRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.label_id.hash(state);
    }
}

impl PartialOrd for UserLabelRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UserLabelRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.label_id.cmp(&other.label_id)
    }
}

/// Account-level label definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Label {
    System {
        id: SystemLabel,
        name: String,
        icon: String,
    },
    UserPlain {
        id: String,
        name: String,
        color: Option<String>,
    },
    UserFolder {
        id: String,
        name: String,
        color: Option<String>,
    },
}

impl Label {
    pub fn system(id: SystemLabel) -> Self {
        Label::System {
            id,
            name: id.display_name(),
            icon: id.as_str().to_lowercase(),
        }
    }

    pub fn view_id(&self) -> String {
        match self {
            Label::System { id, .. } => id.as_str().to_string(),
            Label::UserPlain { id, .. } | Label::UserFolder { id, .. } => id.clone(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Label::System { name, .. }
            | Label::UserPlain { name, .. }
            | Label::UserFolder { name, .. } => name,
        }
    }

    /// The reference a thread carries for this label.
    pub fn to_ref(&self) -> LabelRef {
        match self {
            Label::System { id, .. } => LabelRef::System(*id),
            Label::UserPlain { id, name, color } => LabelRef::User(UserLabelRef {
                label_id: id.clone(),
                variant: LabelVariant::Plain,
                label_name: name.clone(),
                color: color.clone(),
            }),
            Label::UserFolder { id, name, color } => LabelRef::User(UserLabelRef {
                label_id: id.clone(),
                variant: LabelVariant::Folder,
                label_name: name.clone(),
                color: color.clone(),
            }),
        }
    }
}

/// One label as it sits on a thread, system or user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelRef {
    System(SystemLabel),
    User(UserLabelRef),
}

impl LabelRef {
    pub fn view_id(&self) -> String {
        match self {
            LabelRef::System(label) => label.as_str().to_string(),
            LabelRef::User(label) => label.label_id.clone(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            LabelRef::System(label) => label.display_name(),
            LabelRef::User(label) => label.label_name.clone(),
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, LabelRef::User(label) if label.is_folder())
    }

    pub fn as_system(&self) -> Option<SystemLabel> {
        match self {
            LabelRef::System(label) => Some(*label),
            LabelRef::User(_) => None,
        }
    }
}

impl From<SystemLabel> for LabelRef {
    fn from(label: SystemLabel) -> Self {
        LabelRef::System(label)
    }
}

impl From<UserLabelRef> for LabelRef {
    fn from(label: UserLabelRef) -> Self {
        LabelRef::User(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadAttributes {
    pub read: bool,
    #[serde(default)]
    pub system_labels: BTreeSet<SystemLabel>,
    #[serde(default)]
    pub user_labels: BTreeSet<UserLabelRef>,
}

impl ThreadAttributes {
    pub fn new(read: bool, system_labels: impl IntoIterator<Item = SystemLabel>) -> Self {
        Self {
            read,
            system_labels: system_labels.into_iter().collect(),
            user_labels: BTreeSet::new(),
        }
    }

    pub fn with_user_label(mut self, label: UserLabelRef) -> Self {
        self.user_labels.insert(label);
        self
    }

    /// System and user labels as one set.
    pub fn labels(&self) -> BTreeSet<LabelRef> {
        self.system_labels
            .iter()
            .copied()
            .map(LabelRef::System)
            .chain(self.user_labels.iter().cloned().map(LabelRef::User))
            .collect()
    }

    pub fn contains(&self, label: &LabelRef) -> bool {
        match label {
            LabelRef::System(label) => self.system_labels.contains(label),
            LabelRef::User(label) => self.user_labels.contains(label),
        }
    }

    pub fn folder(&self) -> Option<&UserLabelRef> {
        self.user_labels.iter().find(|label| label.is_folder())
    }

    pub fn is_draft(&self) -> bool {
        self.system_labels.contains(&SystemLabel::Drafts)
    }

    /// Labels under which the thread is listed. A folder hides the thread
    /// from every system-label view.
    pub fn view_labels(&self) -> BTreeSet<String> {
        let mut labels: BTreeSet<String> = self
            .user_labels
            .iter()
            .map(|label| label.label_id.clone())
            .collect();
        if self.folder().is_none() {
            labels.extend(self.system_labels.iter().map(|l| l.as_str().to_string()));
        }
        labels
    }

    /// Replace the label sets, keeping the read flag.
    pub fn set_labels(&mut self, labels: BTreeSet<LabelRef>) {
        self.system_labels.clear();
        self.user_labels.clear();
        for label in labels {
            match label {
                LabelRef::System(label) => {
                    self.system_labels.insert(label);
                }
                LabelRef::User(label) => {
                    self.user_labels.insert(label);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub attachment_id: String,
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub email_id: String,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    #[serde(default)]
    pub scheduled_send_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub emails: Vec<Email>,
    pub attributes: ThreadAttributes,
    pub emails_updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn has_attachments(&self) -> bool {
        self.emails.iter().any(|email| !email.attachments.is_empty())
    }

    /// Timestamp the server orders threads by.
    pub fn latest_activity(&self) -> DateTime<Utc> {
        self.emails
            .iter()
            .map(|email| email.created_at)
            .max()
            .unwrap_or(self.emails_updated_at)
    }

    /// Appends emails not already in the thread. Emails are never rewritten
    /// or reordered once cached.
    pub fn append_emails(&mut self, emails: &[Email]) -> usize {
        let mut appended = 0;
        for email in emails {
            if self.emails.iter().any(|e| e.email_id == email.email_id) {
                continue;
            }
            self.emails.push(email.clone());
            self.emails_updated_at = self.emails_updated_at.max(email.created_at);
            appended += 1;
        }
        appended
    }
}

/// Optional predicates a mailbox view narrows its label by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxFilter {
    #[serde(default)]
    pub read: Option<bool>,
    #[serde(default)]
    pub attachments: Option<bool>,
}

impl MailboxFilter {
    pub fn unread() -> Self {
        Self {
            read: Some(false),
            attachments: None,
        }
    }

    pub fn with_attachments() -> Self {
        Self {
            read: None,
            attachments: Some(true),
        }
    }

    pub fn matches(&self, thread: &Thread) -> bool {
        self.accepts(thread.attributes.read, thread.has_attachments())
    }

    pub fn accepts(&self, read: bool, has_attachments: bool) -> bool {
        self.read.is_none_or(|r| r == read)
            && self.attachments.is_none_or(|a| a == has_attachments)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxViewKey {
    pub label: String,
    #[serde(default)]
    pub filter: MailboxFilter,
}

impl MailboxViewKey {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            filter: MailboxFilter::default(),
        }
    }

    pub fn system(label: SystemLabel) -> Self {
        Self::new(label.as_str())
    }

    pub fn with_filter(mut self, filter: MailboxFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Whether the thread belongs in this view given its cached state.
    pub fn admits(&self, thread: &Thread) -> bool {
        self.admits_attributes(&thread.attributes, thread.has_attachments())
    }

    pub fn admits_attributes(&self, attributes: &ThreadAttributes, has_attachments: bool) -> bool {
        attributes.view_labels().contains(&self.label)
            && self.filter.accepts(attributes.read, has_attachments)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub cursor: Option<String>,
    pub has_next_page: bool,
}

/// One page of a `listThreads` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadPage {
    pub threads: Vec<Thread>,
    pub page_info: PageInfo,
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_user_label_identity_is_label_id() {
        let mut renamed = plain_work();
        renamed.label_name = "Job".to_string();
        renamed.color = Some("#ff0000".to_string());
        assert_eq!(renamed, plain_work());
    }

    #[test]
    fn test_folder_hides_system_view_labels() {
        let attrs = ThreadAttributes::new(false, [SystemLabel::Inbox]).with_user_label(folder_x());
        let labels = attrs.view_labels();
        assert!(labels.contains("folder-x"));
        assert!(!labels.contains("INBOX"));
    }

    #[test]
    fn test_filter_matches_read_and_attachments() {
        let mut t = thread("t1", false, &[SystemLabel::Inbox]);
        assert!(MailboxFilter::unread().matches(&t));
        assert!(!MailboxFilter::with_attachments().matches(&t));

        t.emails[0].attachments.push(AttachmentMeta {
            attachment_id: "a1".to_string(),
            filename: "report.pdf".to_string(),
            size: 1024,
        });
        t.attributes.read = true;
        assert!(!MailboxFilter::unread().matches(&t));
        assert!(MailboxFilter::with_attachments().matches(&t));
    }

    #[test]
    fn test_append_emails_skips_known_ids() {
        let mut t = thread("t1", true, &[SystemLabel::Inbox]);
        let appended = t.append_emails(&[email("t1-e1", 0), email("t1-e2", 5)]);
        assert_eq!(appended, 1);
        assert_eq!(t.emails.len(), 2);
        assert_eq!(t.emails[1].email_id, "t1-e2");
        assert_eq!(t.emails_updated_at, t.emails[1].created_at);

        // an older email arriving late leaves the timestamp alone
        t.append_emails(&[email("t1-e0", 1)]);
        assert_eq!(t.emails_updated_at, t.emails[1].created_at);
    }

    #[test]
    fn test_system_label_round_trips_wire_id() {
        for label in SystemLabel::ALL {
            assert_eq!(SystemLabel::from_wire(label.as_str()), Some(label));
        }
        assert_eq!(SystemLabel::from_wire("folder-x"), None);
    }
}
