//! Status command handler

use anyhow::Result;

use garage_core::{Config, Container, Store};

use crate::output::{Output, OutputFormat};

/// Show storage, outbox and sync state
pub async fn show(store: &Store, config: &Config, output: &Output) -> Result<()> {
    let stats = store.outbox().stats().await?;
    let health = store.sync().refresh_health().await;

    let mut counts = Vec::with_capacity(Container::ALL.len());
    for container in Container::ALL {
        counts.push((container, store.count(container).await?));
    }

    match output.format {
        OutputFormat::Json => {
            let count_map: serde_json::Map<String, serde_json::Value> = counts
                .iter()
                .map(|(c, n)| (c.table_name().to_string(), (*n).into()))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "database": store.local().path(),
                    "durable": store.is_durable(),
                    "remote_url": config.active_remote_url(),
                    "online": store.sync().is_online(),
                    "health": health,
                    "outbox": stats,
                    "counts": count_map
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", health.label());
        }
        OutputFormat::Human => {
            println!("Garage Status");
            println!("=============");
            println!();
            println!("Storage:");
            match store.local().path() {
                Some(path) => println!("  Database: {}", path.display()),
                None => println!("  Database: (in memory)"),
            }
            if !store.is_durable() {
                println!("  Warning:  changes will not survive a restart");
            }
            println!();
            println!("Sync:");
            match config.active_remote_url() {
                Some(url) => {
                    println!("  Remote: {}", url);
                    println!(
                        "  Link:   {}",
                        if store.sync().is_online() {
                            "online"
                        } else {
                            "offline"
                        }
                    );
                }
                None => println!("  Remote: (disabled)"),
            }
            println!("  Health: {}", health);
            println!();
            println!("Outbox:");
            println!("  Pending: {}", stats.pending);
            println!("  Failed:  {}", stats.failed);
            println!();
            println!("Records:");
            for (container, count) in &counts {
                println!("  {:<15} {}", container.table_name(), count);
            }
        }
    }

    Ok(())
}
