//! Data models for the garage store
//!
//! Defines the shapes that flow through every layer: business `Record`s,
//! the `Container` partitions they live in, and the `MutationRecord`s the
//! outbox keeps for replay against the remote backend.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Field names owned by `Record` itself; never stored in `fields`
pub const RESERVED_FIELDS: &[&str] = &["id", "user_id", "created_at", "updated_at"];

/// Generate a new globally unique record id
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

/// A business entity (customer, vendor, job, ledger entry, ...)
///
/// The entity-specific attributes are kept as a JSON object so every
/// container shares one storage and replay path. On the wire the owner is
/// called `user_id`, matching the remote schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Globally unique id, assigned client-side and never regenerated
    pub id: String,
    /// The authenticated user this record belongs to
    #[serde(rename = "user_id")]
    pub owner_id: String,
    /// Set once on first write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Refreshed on every local or remote write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Entity-specific fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create an empty record with a fresh id
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self::with_id(new_record_id(), owner_id)
    }

    /// Create an empty record with a specific id
    pub fn with_id(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            created_at: None,
            updated_at: None,
            fields: Map::new(),
        }
    }

    /// Build a record from caller-supplied data
    ///
    /// A string `id` in `data` is kept; otherwise a new one is assigned.
    /// Reserved keys are stripped from the field map and the owner always
    /// comes from `owner_id`.
    pub fn from_data(mut data: Map<String, Value>, owner_id: impl Into<String>) -> Self {
        let id = match data.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => new_record_id(),
        };
        strip_reserved(&mut data);
        Self {
            id,
            owner_id: owner_id.into(),
            created_at: None,
            updated_at: None,
            fields: data,
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a single field
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            self.fields.insert(key, value.into());
        }
    }

    /// Get a single field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Shallow-merge `patch` onto this record's fields
    ///
    /// Identity and timestamp keys in the patch are ignored; a `null`
    /// value is stored as `null`, it does not remove the field.
    pub fn merge(&mut self, mut patch: Map<String, Value>) {
        strip_reserved(&mut patch);
        for (key, value) in patch {
            self.fields.insert(key, value);
        }
    }

    /// The minimal `{id, user_id}` snapshot queued for a delete
    pub fn tombstone(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self::with_id(id, owner_id)
    }
}

fn strip_reserved(map: &mut Map<String, Value>) {
    for key in RESERVED_FIELDS {
        map.remove(*key);
    }
}

/// A named partition of records of one entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Profiles,
    Customers,
    Vendors,
    Suppliers,
    Labours,
    Inventory,
    Jobs,
    LedgerEntries,
    Settings,
    Companies,
}

impl Container {
    /// Every entity container, in schema creation order
    pub const ALL: [Container; 10] = [
        Container::Profiles,
        Container::Customers,
        Container::Vendors,
        Container::Suppliers,
        Container::Labours,
        Container::Inventory,
        Container::Jobs,
        Container::LedgerEntries,
        Container::Settings,
        Container::Companies,
    ];

    /// Table name, shared by the local schema and the remote backend
    pub fn table_name(&self) -> &'static str {
        match self {
            Container::Profiles => "profiles",
            Container::Customers => "customers",
            Container::Vendors => "vendors",
            Container::Suppliers => "suppliers",
            Container::Labours => "labours",
            Container::Inventory => "inventory",
            Container::Jobs => "jobs",
            Container::LedgerEntries => "ledger_entries",
            Container::Settings => "settings",
            Container::Companies => "companies",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Error returned when a container, action or status name is unknown
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
}

impl FromStr for Container {
    type Err = ParseNameError;

    /// Accepts table names (`ledger_entries`) and camelCase (`ledgerEntries`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        Container::ALL
            .into_iter()
            .find(|c| c.table_name().replace('_', "") == normalized)
            .ok_or_else(|| ParseNameError {
                kind: "container",
                value: s.to_string(),
            })
    }
}

/// What a queued mutation does to the remote copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationAction {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            "delete" => Ok(MutationAction::Delete),
            _ => Err(ParseNameError {
                kind: "mutation action",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting for the next drain
    Pending,
    /// Confirmed remotely; the entry is removed right after
    Completed,
    /// Quarantined for operator review, never replayed automatically
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Completed => "completed",
            MutationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "completed" => Ok(MutationStatus::Completed),
            "failed" => Ok(MutationStatus::Failed),
            _ => Err(ParseNameError {
                kind: "mutation status",
                value: s.to_string(),
            }),
        }
    }
}

/// One queued create/update/delete awaiting remote confirmation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationRecord {
    /// Queue-local unique id
    pub id: String,
    pub action: MutationAction,
    pub container: Container,
    /// Full snapshot for create/update, `{id, user_id}` for delete
    pub payload: Record,
    pub enqueued_at: DateTime<Utc>,
    pub status: MutationStatus,
    pub retry_count: u32,
    /// Message of the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MutationRecord {
    /// Id of the record this mutation targets
    pub fn record_id(&self) -> &str {
        &self.payload.id
    }
}
