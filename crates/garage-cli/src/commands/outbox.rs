//! Outbox inspection and operator actions on failed entries

use anyhow::{bail, Result};

use garage_core::Store;

use crate::output::Output;

/// List pending entries, or failed ones with `failed`
pub async fn list(store: &Store, failed: bool, output: &Output) -> Result<()> {
    let entries = if failed {
        store.outbox().list_failed().await?
    } else {
        store.outbox().list_pending().await?
    };
    output.print_mutations(&entries);
    Ok(())
}

/// Put a failed entry back into the queue
pub async fn retry(store: &Store, id: String, output: &Output) -> Result<()> {
    if !store.sync().requeue(&id).await? {
        bail!(
            "No failed outbox entry '{}'\nList failed entries with `garage outbox list --failed`.",
            id
        );
    }
    output.success(&format!("Requeued {}", id));
    Ok(())
}

/// Drop a failed entry for good
pub async fn discard(store: &Store, id: String, output: &Output) -> Result<()> {
    if !store.sync().discard(&id).await? {
        bail!(
            "No failed outbox entry '{}'\nOnly failed entries can be discarded.",
            id
        );
    }
    output.success(&format!("Discarded {}", id));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use garage_core::{Connectivity, Container, SyncSettings};

    async fn offline_store() -> Store {
        Store::open_at(None, None, Connectivity::new(false), SyncSettings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_retry_and_discard_require_failed_entry() {
        let store = offline_store().await;
        let output = Output::new(OutputFormat::Quiet);

        let mut data = serde_json::Map::new();
        data.insert("name".into(), "Ravi".into());
        store.create(Container::Customers, data, "u1").await.unwrap();
        store.sync().flush().await;

        let pending = store.outbox().list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);

        // Pending entries are not operator-actionable
        assert!(retry(&store, pending[0].id.clone(), &output).await.is_err());
        assert!(discard(&store, pending[0].id.clone(), &output).await.is_err());

        store
            .outbox()
            .mark_failed(&pending[0].id, "rejected")
            .await
            .unwrap();
        retry(&store, pending[0].id.clone(), &output).await.unwrap();
        assert_eq!(store.outbox().stats().await.unwrap().pending, 1);

        store
            .outbox()
            .mark_failed(&pending[0].id, "rejected again")
            .await
            .unwrap();
        discard(&store, pending[0].id.clone(), &output).await.unwrap();
        let stats = store.outbox().stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 0);
    }
}
