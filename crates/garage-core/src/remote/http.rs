//! HTTPS backend for a PostgREST-style API
//!
//! Each container maps to `{base_url}/rest/v1/{table}`. Owner scoping uses
//! the `user_id` column filter, and the api key is sent both as `apikey`
//! and as a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use tracing::debug;

use super::{RemoteBackend, RemoteError, RemoteResult};
use crate::models::{Container, Record};

/// Remote backend speaking HTTP to the hosted database
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    /// Create a backend; every request is bounded by `timeout`
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("garage/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn table_url(&self, container: Container) -> String {
        format!("{}/rest/v1/{}", self.base_url, container.table_name())
    }

    fn request(&self, method: Method, container: Container) -> RequestBuilder {
        let builder = self.client.request(method, self.table_url(container));
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> RemoteResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!("Remote returned {}: {}", status, body);
        Err(RemoteError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn insert(&self, container: Container, record: &Record) -> RemoteResult<()> {
        let builder = self
            .request(Method::POST, container)
            .header("Prefer", "return=minimal")
            .json(record);
        self.send(builder).await?;
        Ok(())
    }

    async fn upsert(&self, container: Container, record: &Record) -> RemoteResult<()> {
        let builder = self
            .request(Method::POST, container)
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(record);
        self.send(builder).await?;
        Ok(())
    }

    async fn delete_where(
        &self,
        container: Container,
        id: &str,
        owner_id: &str,
    ) -> RemoteResult<()> {
        let builder = self
            .request(Method::DELETE, container)
            .query(&[
                ("id", format!("eq.{}", id)),
                ("user_id", format!("eq.{}", owner_id)),
            ])
            .header("Prefer", "return=representation");
        let response = self.send(builder).await?;

        // An empty representation means no row matched
        let deleted: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        if deleted.is_empty() {
            return Err(RemoteError::NotFound);
        }
        Ok(())
    }

    async fn select_all(&self, container: Container, owner_id: &str) -> RemoteResult<Vec<Record>> {
        let builder = self
            .request(Method::GET, container)
            .query(&[("select", "*".to_string()), ("user_id", format!("eq.{}", owner_id))]);
        let response = self.send(builder).await?;

        response
            .json::<Vec<Record>>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url_trims_trailing_slash() {
        let backend =
            HttpBackend::new("https://db.example.com/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            backend.table_url(Container::LedgerEntries),
            "https://db.example.com/rest/v1/ledger_entries"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        // Port 1 on loopback refuses connections
        let backend = HttpBackend::new(
            "http://127.0.0.1:1",
            Some("key".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();

        let err = backend
            .upsert(Container::Customers, &Record::with_id("c-1", "u1"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {:?}", err);
    }
}
