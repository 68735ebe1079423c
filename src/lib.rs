//! Client-side mail cache that keeps threads, mailbox views and unread
//! counters consistent under optimistic label mutations.

pub mod actions;
pub mod cache;
pub mod config;
pub mod counters;
pub mod diff;
pub mod memory;
pub mod models;
pub mod notify;
pub mod remote;
pub mod store;
pub mod sync;
pub mod undo;
pub mod views;

pub use actions::{ActionError, PendingMutation, Settled, ThreadActions};
pub use cache::{MailCache, SharedCache};
pub use config::Config;
pub use diff::{compute_diff, LabelDiff, LabelRequest};
pub use models::{LabelRef, MailboxFilter, MailboxViewKey, SystemLabel, Thread, ThreadAttributes, UserLabelRef};
pub use remote::{RemoteError, RemoteMailStore};
