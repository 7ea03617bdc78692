//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use garage_core::{MutationRecord, Record};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }

    /// Print a list of records
    pub fn print_records(&self, records: &[Record]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No records found.");
                    return;
                }
                for record in records {
                    let updated = record
                        .updated_at
                        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default();
                    println!(
                        "{} | {} | {}",
                        short_id(&record.id),
                        updated,
                        truncate(&summarize_fields(record), 60)
                    );
                }
                println!("\n{} record(s)", records.len());
            }
            OutputFormat::Json => self.print_json(records),
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", record.id);
                }
            }
        }
    }

    /// Print a list of outbox entries
    pub fn print_mutations(&self, mutations: &[MutationRecord]) {
        match self.format {
            OutputFormat::Human => {
                if mutations.is_empty() {
                    println!("Outbox is empty.");
                    return;
                }
                for m in mutations {
                    println!(
                        "{} | {} | {:<6} {}/{} | retries {}{}",
                        m.id,
                        m.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                        m.action,
                        m.container,
                        short_id(m.record_id()),
                        m.retry_count,
                        m.last_error
                            .as_deref()
                            .map(|e| format!(" | {}", truncate(e, 50)))
                            .unwrap_or_default()
                    );
                }
                let noun = if mutations.len() == 1 { "entry" } else { "entries" };
                println!("\n{} {}", mutations.len(), noun);
            }
            OutputFormat::Json => self.print_json(mutations),
            OutputFormat::Quiet => {
                for m in mutations {
                    println!("{}", m.id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// First eight characters of an id
fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

/// Compact `key=value` rendering of a record's fields
fn summarize_fields(record: &Record) -> String {
    record
        .fields
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
