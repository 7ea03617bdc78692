//! Record listing

use anyhow::{anyhow, Result};

use garage_core::{Container, Store};

use crate::output::Output;

/// Parse a container name, listing the valid ones on failure
pub fn parse_container(name: &str) -> Result<Container> {
    name.parse().map_err(|e| {
        let valid: Vec<&str> = Container::ALL.iter().map(|c| c.table_name()).collect();
        anyhow!("{}\nValid containers: {}", e, valid.join(", "))
    })
}

/// List local records in a container, or show one by id
pub async fn list(
    store: &Store,
    container: &str,
    owner: &str,
    id: Option<String>,
    output: &Output,
) -> Result<()> {
    let container = parse_container(container)?;

    let records = match id {
        Some(id) => {
            let record = store
                .read_one(container, &id)
                .await?
                .filter(|r| r.owner_id == owner)
                .ok_or_else(|| anyhow!("No record '{}' in {} for {}", id, container, owner))?;
            vec![record]
        }
        None => store.read(container, owner).await?,
    };

    output.print_records(&records);
    Ok(())
}
