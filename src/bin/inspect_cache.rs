use mailmirror::models::ThreadPage;
use mailmirror::{MailCache, MailboxViewKey};
use serde::Deserialize;
use std::env;

/// One saved `listThreads` response and the view it was fetched for.
#[derive(Debug, Deserialize)]
struct PageDump {
    key: MailboxViewKey,
    page: ThreadPage,
    #[serde(default)]
    append: bool,
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <pages.json>", args[0]);
        eprintln!("The file holds an array of {{ \"key\": ..., \"page\": ... }} entries.");
        std::process::exit(1);
    }

    let content = std::fs::read_to_string(&args[1])
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args[1], e))?;
    let dumps: Vec<PageDump> = serde_json::from_str(&content)?;

    let mut cache = MailCache::new();
    for dump in dumps {
        let issued_at = cache.sequence();
        cache.load_page(&dump.key, dump.page, issued_at, dump.append);
    }

    println!("Threads cached: {}", cache.store().len());
    let mut keys: Vec<&MailboxViewKey> = cache.views().keys().collect();
    keys.sort_by(|a, b| a.label.cmp(&b.label));
    for key in keys {
        let Some(view) = cache.view(key) else {
            continue;
        };
        println!(
            "{} {:?}: {} threads, more: {}",
            key.label,
            key.filter,
            view.len(),
            view.has_next_page
        );
        for thread_id in &view.thread_ids {
            println!("  {}", thread_id);
        }
    }

    let mut counts: Vec<(String, u32)> = cache.counters().snapshot().into_iter().filter(|(_, n)| *n > 0).collect();
    counts.sort();
    println!("Unread:");
    for (label, count) in counts {
        println!("  {:<16} {}", label, count);
    }
    Ok(())
}
