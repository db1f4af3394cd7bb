//! Sync status overview.
//!
//! `cinesync status` prints every committed watermark with its age, so an
//! operator can see at a glance which families are keeping up. With
//! `--counts` it also asks the index for the document count of each enabled
//! family.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::elastic::ElasticClient;
use crate::index::SearchIndex;
use crate::models::Watermark;
use crate::state::{self, format_timestamp, WatermarkStore};

/// Run the status command: read the state store and print a summary.
pub async fn run_status(config: &Config, counts: bool) -> Result<()> {
    let watermarks = WatermarkStore::new(state::open_state_store(config).await?);
    let mut entries = watermarks.entries().await?;
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    println!("cinesync status");
    println!("===============");
    println!();
    println!(
        "  State:       {} ({})",
        config.state.backend,
        config.state.path.display()
    );
    println!("  Index:       {}", config.elasticsearch.url);
    println!();

    print!("{}", render_watermarks(&entries, Utc::now()));

    if counts {
        let client = ElasticClient::new(&config.elasticsearch)?;
        println!();
        println!("  {:<12} {:<24} {:>10}", "FAMILY", "INDEX", "DOCS");
        println!("  {}", "-".repeat(48));
        for family in config.enabled_families()? {
            let name = &config.index_for(family).name;
            let shown = match client.count(name).await {
                Ok(n) => n.to_string(),
                Err(e) => format!("error: {}", e),
            };
            println!("  {:<12} {:<24} {:>10}", family.as_str(), name, shown);
        }
    }

    println!();
    Ok(())
}

/// The watermark table, one line per key.
pub fn render_watermarks(entries: &[Watermark], now: DateTime<Utc>) -> String {
    if entries.is_empty() {
        return "  No watermarks committed yet.\n".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!("  {:<20} {:<32} {}\n", "KEY", "WATERMARK", "AGE"));
    out.push_str(&format!("  {}\n", "-".repeat(66)));
    for entry in entries {
        let (shown, age) = match entry.last_seen {
            Some(ts) => (format_timestamp(ts), format_age(ts, now)),
            None => ("never".to_string(), "-".to_string()),
        };
        out.push_str(&format!("  {:<20} {:<32} {}\n", entry.key, shown, age));
    }
    out
}

/// Age of a watermark as a relative string (e.g. "3 hours ago").
fn format_age(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();

    if delta < 0 {
        "in the future".to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    }
}
