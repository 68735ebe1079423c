use chrono::{Duration as ChronoDuration, Utc};
use mailmirror::memory::InMemoryMailStore;
use mailmirror::models::{Email, Label};
use mailmirror::notify::Notification;
use mailmirror::sync::Poller;
use mailmirror::{
    Config, LabelRef, MailboxFilter, MailboxViewKey, RemoteMailStore, Settled, SharedCache, SystemLabel, Thread,
    ThreadActions, ThreadAttributes, UserLabelRef,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn seed_thread(id: &str, subject: &str, minutes_ago: i64, attributes: ThreadAttributes) -> Thread {
    let created_at = Utc::now() - ChronoDuration::minutes(minutes_ago);
    Thread {
        thread_id: id.to_string(),
        emails: vec![Email {
            email_id: format!("{}-1", id),
            from_address: Some("team@example.com".to_string()),
            subject: Some(subject.to_string()),
            created_at,
            attachments: Vec::new(),
            scheduled_send_at: None,
        }],
        attributes,
        emails_updated_at: created_at,
    }
}

fn print_view(cache: &SharedCache, key: &MailboxViewKey) {
    let threads = cache.view_threads(key);
    let unread = cache.with(|c| c.unread_count(&key.label));
    println!("{} ({} unread)", key.label, unread);
    for thread in threads {
        let subject = thread
            .emails
            .first()
            .and_then(|e| e.subject.clone())
            .unwrap_or_default();
        let marker = if thread.attributes.read { " " } else { "*" };
        println!("  {} {:<4} {}", marker, thread.thread_id, subject);
    }
}

fn print_toast(toast: Option<&Notification>) {
    if let Some(toast) = toast {
        match &toast.body {
            Some(body) => println!("> {}: {}", toast.title, body),
            None => println!("> {}", toast.title),
        }
    }
}

fn report(settled: Settled) {
    if let Settled::Failed(toast) = settled {
        print_toast(Some(&toast));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug_logging = std::env::args().any(|arg| arg == "--debug");
    let watch = std::env::args().any(|arg| arg == "--watch");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_logging {
            EnvFilter::new("mailmirror=debug,info")
        } else {
            EnvFilter::new("mailmirror=info,warn")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load();
    let projects = UserLabelRef::folder("label-projects", "Projects");
    let remote = Arc::new(
        InMemoryMailStore::with_threads([
            seed_thread("t1", "Quarterly report", 5, ThreadAttributes::new(false, [SystemLabel::Inbox])),
            seed_thread("t2", "Lunch on Friday?", 30, ThreadAttributes::new(false, [SystemLabel::Inbox])),
            seed_thread("t3", "Your receipt", 90, ThreadAttributes::new(true, [SystemLabel::Inbox])),
            seed_thread("t4", "Old newsletter", 600, ThreadAttributes::new(true, [SystemLabel::Trash])),
        ])
        .with_latency(Duration::from_millis(50)),
    );
    let client: Arc<dyn RemoteMailStore> = remote.clone();

    let cache = SharedCache::default();
    let poller = Poller::new(cache.clone(), client.clone(), &config.sync);
    let actions = ThreadActions::new(cache.clone(), client, &config).with_labels(vec![
        Label::system(SystemLabel::Inbox),
        Label::system(SystemLabel::Trash),
        Label::UserFolder {
            id: projects.label_id.clone(),
            name: projects.label_name.clone(),
            color: None,
        },
    ]);

    let inbox = MailboxViewKey::system(SystemLabel::Inbox);
    let unread = inbox.clone().with_filter(MailboxFilter::unread());
    let trash = MailboxViewKey::system(SystemLabel::Trash);
    let folder = MailboxViewKey::new(projects.label_id.as_str());
    for key in [&inbox, &unread, &trash, &folder] {
        poller.load_view(key).await?;
    }
    info!(threads = cache.with(|c| c.store().len()), "mailboxes loaded");
    print_view(&cache, &inbox);
    print_view(&cache, &trash);

    let selection = vec!["t1".to_string()];
    let pending = actions
        .trash(&selection, false)
        .map_err(|e| anyhow::anyhow!("trash rejected: {}", e))?;
    print_toast(pending.toast.as_ref());
    let token = pending.toast.as_ref().and_then(Notification::undo_token).cloned();
    print_view(&cache, &inbox);
    print_view(&cache, &trash);
    report(pending.settle().await);

    if let Some(token) = token {
        let pending = actions.undo(&token);
        print_toast(pending.toast.as_ref());
        report(pending.settle().await);
        print_view(&cache, &inbox);
    }

    let pending = actions
        .move_to_folder_or_system_label(&["t2".to_string()], &LabelRef::User(projects), &[SystemLabel::Inbox])
        .map_err(|e| anyhow::anyhow!("move rejected: {}", e))?;
    print_toast(pending.toast.as_ref());
    report(pending.settle().await);
    print_view(&cache, &inbox);
    print_view(&cache, &folder);

    // a failing server: the archive is rolled back
    remote.fail_next(1);
    let pending = actions
        .archive(&["t3".to_string()])
        .map_err(|e| anyhow::anyhow!("archive rejected: {}", e))?;
    print_toast(pending.toast.as_ref());
    report(pending.settle().await);
    print_view(&cache, &inbox);

    let pending = actions
        .delete_threads_permanently(&["t4".to_string()])
        .map_err(|e| anyhow::anyhow!("delete rejected: {}", e))?;
    print_toast(pending.toast.as_ref());
    report(pending.settle().await);
    print_view(&cache, &trash);

    let counts = cache.unread_counts();
    println!("{}", serde_json::to_string_pretty(&counts)?);

    if watch {
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);
        tokio::spawn(poller.with_refresh(refresh_tx).run());
        while refresh_rx.recv().await.is_some() {
            print_view(&cache, &inbox);
        }
    }

    Ok(())
}
