//! Embedding catalog retrieval over HTTP.

use thiserror::Error;
use vigil_core::catalog::{parse_catalog, CatalogEntry, CatalogError};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Fetch every enrolled identity. A non-success status yields an empty
/// catalog; transport and body errors are returned.
pub async fn fetch_catalog(client: &reqwest::Client, url: &str) -> Result<Vec<CatalogEntry>, FetchError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        tracing::warn!(url, status = status.as_u16(), "catalog request returned non-success status");
        return Ok(Vec::new());
    }

    let body = response.text().await?;
    let entries = parse_catalog(&body)?;
    tracing::info!(url, entries = entries.len(), "catalog fetched");
    Ok(entries)
}
