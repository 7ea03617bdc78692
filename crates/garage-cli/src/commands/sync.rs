//! Sync command handlers

use anyhow::{bail, Result};

use garage_core::sync::{DrainReport, PullReport, ReplayResult, SyncSkip};
use garage_core::{Config, Store};

use crate::output::{Output, OutputFormat};

fn require_remote(config: &Config) -> Result<()> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             garage config set sync_enabled true\n  \
             garage config set remote_url https://your-project.example.com"
        );
    }

    if config.active_remote_url().is_none() {
        bail!(
            "Remote URL not configured. Set it with:\n  \
             garage config set remote_url https://your-project.example.com"
        );
    }

    Ok(())
}

/// Drain the outbox, then refresh every container for `owner`
pub async fn sync(store: &Store, config: &Config, owner: &str, output: &Output) -> Result<()> {
    require_remote(config)?;

    output.message("Sending queued changes...");
    let report = store.sync().sync_all(owner).await;

    match output.format {
        OutputFormat::Json => output.print_json(&report),
        OutputFormat::Quiet => {}
        OutputFormat::Human => {
            print_drain(&report.drain);
            print_pull(&report.pull);
            println!();
            println!("Health: {}", store.sync().health());
        }
    }

    if let Some(ref error) = report.drain.error {
        bail!("Sync failed: {}", error);
    }
    Ok(())
}

/// Refresh every container for `owner` from the remote
pub async fn pull(store: &Store, config: &Config, owner: &str, output: &Output) -> Result<()> {
    require_remote(config)?;

    let report = store.sync().pull_all(owner).await;

    match output.format {
        OutputFormat::Json => output.print_json(&report),
        OutputFormat::Quiet => {}
        OutputFormat::Human => print_pull(&report),
    }

    if report.errors() > 0 && report.applied() == 0 && output.format == OutputFormat::Human {
        output.message("Nothing was pulled; check the log for remote errors.");
    }
    Ok(())
}

/// Replay the outbox once
pub async fn drain(store: &Store, config: &Config, output: &Output) -> Result<()> {
    require_remote(config)?;

    let report = store.sync().drain().await;

    match output.format {
        OutputFormat::Json => output.print_json(&report),
        OutputFormat::Quiet => {}
        OutputFormat::Human => {
            print_drain(&report);
            println!();
            println!("Health: {}", store.sync().health());
        }
    }

    if let Some(ref error) = report.error {
        bail!("Drain failed: {}", error);
    }
    Ok(())
}

fn skip_reason(skip: SyncSkip) -> &'static str {
    match skip {
        SyncSkip::AlreadyDraining => "another sync is already running",
        SyncSkip::Offline => "offline",
    }
}

fn print_drain(report: &DrainReport) {
    if let Some(skip) = report.skipped {
        println!("Outbox: skipped ({})", skip_reason(skip));
        return;
    }
    if report.outcomes.is_empty() {
        println!("✓ Outbox: nothing to send");
        return;
    }

    println!(
        "Outbox: {} applied, {} retrying, {} failed, {} deferred",
        report.applied(),
        report.retried(),
        report.failed(),
        report.deferred()
    );
    for outcome in &report.outcomes {
        match &outcome.result {
            ReplayResult::Retried { retry_count, error } => println!(
                "  retry {} {} {}/{}: {}",
                retry_count, outcome.action, outcome.container, outcome.record_id, error
            ),
            ReplayResult::Failed { error } => println!(
                "  failed {} {}/{}: {}",
                outcome.action, outcome.container, outcome.record_id, error
            ),
            ReplayResult::Applied | ReplayResult::Deferred => {}
        }
    }
    if report.failed() > 0 {
        println!("  Review with `garage outbox list --failed`");
    }
}

fn print_pull(report: &PullReport) {
    if let Some(skip) = report.skipped {
        println!("Pull: skipped ({})", skip_reason(skip));
        return;
    }

    println!(
        "Pull: {} record(s) applied, {} kept local with unsent changes",
        report.applied(),
        report.protected()
    );
    for container in &report.containers {
        if let Some(ref error) = container.error {
            println!("  {}: {}", container.container, error);
        }
        for failure in &container.failures {
            println!("  {}/{}: {}", container.container, failure.id, failure.error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_remote() {
        let mut config = Config::default();
        let err = require_remote(&config).unwrap_err().to_string();
        assert!(err.contains("sync_enabled"));

        config.sync_enabled = true;
        let err = require_remote(&config).unwrap_err().to_string();
        assert!(err.contains("remote_url"));

        config.remote_url = Some("https://db.example.com".to_string());
        assert!(require_remote(&config).is_ok());
    }
}
