//! Identity index (re)builds from the remote catalog.
//!
//! A build fetches the catalog, constructs a new generation on the blocking
//! pool, persists it and installs it. Readers keep using the previous
//! generation until the install.

use crate::catalog::{fetch_catalog, FetchError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use vigil_core::forest::ForestConfig;
use vigil_core::persist;
use vigil_core::store::{Generation, IdentityIndex};

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("index build task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct IndexRefresher {
    client: reqwest::Client,
    catalog_url: String,
    index_path: PathBuf,
    dim: usize,
    forest: ForestConfig,
    index: Arc<IdentityIndex>,
}

impl IndexRefresher {
    pub fn new(
        client: reqwest::Client,
        catalog_url: &str,
        index_path: PathBuf,
        dim: usize,
        forest: ForestConfig,
        index: Arc<IdentityIndex>,
    ) -> Self {
        Self {
            client,
            catalog_url: catalog_url.to_string(),
            index_path,
            dim,
            forest,
            index,
        }
    }

    /// Initial build. Falls back to the persisted index when the catalog is
    /// unreachable or yields no usable records; installs an empty generation
    /// when neither is available.
    pub async fn startup(&self) {
        match self.build().await {
            Ok(generation) if !generation.is_empty() => {
                let generation = self.persist(generation).await;
                self.index.install(generation);
            }
            Ok(empty) => {
                tracing::warn!(url = %self.catalog_url, "catalog has no usable records; trying persisted index");
                self.install_persisted_or(empty).await;
            }
            Err(e) => {
                tracing::warn!(url = %self.catalog_url, error = %e, "catalog unavailable; trying persisted index");
                self.install_persisted_or(self.empty()).await;
            }
        }
    }

    /// Rebuild from the catalog and install the result. On error the
    /// current generation stays in place.
    pub async fn refresh(&self) -> Result<usize, RefreshError> {
        let generation = self.build().await?;
        let records = generation.len();
        let generation = if records > 0 {
            self.persist(generation).await
        } else {
            generation
        };
        self.index.install(generation);
        Ok(records)
    }

    /// Refresh every `interval`, starting one interval from now.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.refresh().await {
                    Ok(records) => tracing::info!(records, "identity index refreshed"),
                    Err(e) => tracing::warn!(error = %e, "index refresh failed; keeping previous generation"),
                }
            }
        })
    }

    async fn build(&self) -> Result<Generation, RefreshError> {
        let entries = fetch_catalog(&self.client, &self.catalog_url).await?;
        let dim = self.dim;
        let forest = self.forest.clone();
        Ok(tokio::task::spawn_blocking(move || Generation::build(entries, dim, &forest)).await?)
    }

    /// Save `generation` to the index path, handing it back either way.
    async fn persist(&self, generation: Generation) -> Generation {
        let path = self.index_path.clone();
        let saved = tokio::task::spawn_blocking(move || {
            let result = persist::save_to_path(&generation, &path);
            (generation, result)
        })
        .await;

        match saved {
            Ok((generation, Ok(()))) => generation,
            Ok((generation, Err(e))) => {
                tracing::warn!(path = %self.index_path.display(), error = %e, "failed to persist identity index");
                generation
            }
            Err(e) => {
                // The generation moved into the panicked task; nothing to install.
                tracing::error!(error = %e, "index persist task failed");
                self.empty()
            }
        }
    }

    async fn install_persisted_or(&self, fallback: Generation) {
        let path = self.index_path.clone();
        let loaded = tokio::task::spawn_blocking(move || persist::load_from_path(&path)).await;

        let generation = match loaded {
            Ok(Ok(generation)) if generation.dim() == self.dim => generation,
            Ok(Ok(generation)) => {
                tracing::warn!(got = generation.dim(), want = self.dim, "persisted index has wrong dimension");
                fallback
            }
            Ok(Err(e)) => {
                tracing::warn!(path = %self.index_path.display(), error = %e, "no usable persisted index");
                fallback
            }
            Err(e) => {
                tracing::error!(error = %e, "index load task failed");
                fallback
            }
        };
        self.index.install(generation);
    }

    fn empty(&self) -> Generation {
        Generation::build(Vec::new(), self.dim, &self.forest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;
    use vigil_core::catalog::CatalogEntry;
    use vigil_core::types::Embedding;

    const CATALOG: &str = r#"[
        {"username":"alice","member_id":1,"image_vector":[0,[1.0,0.0,0.0]]},
        {"username":"bob","member_id":2,"image_vector":[0,[0.0,1.0,0.0]]},
        {"username":"broken","member_id":3}
    ]"#;

    async fn serve_catalog(status: StatusCode, body: &'static str) -> String {
        let app = Router::new().route("/catalog", get(move || async move { (status, body) }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}/catalog")
    }

    /// A URL on a port nothing listens on.
    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/catalog")
    }

    fn refresher(url: &str, index_path: PathBuf) -> (IndexRefresher, Arc<IdentityIndex>) {
        let index = Arc::new(IdentityIndex::new());
        let refresher = IndexRefresher::new(
            reqwest::Client::new(),
            url,
            index_path,
            3,
            ForestConfig { n_trees: 4, ..Default::default() },
            index.clone(),
        );
        (refresher, index)
    }

    fn persisted(path: &std::path::Path, names: &[&str]) {
        let entries = names
            .iter()
            .enumerate()
            .map(|(i, n)| CatalogEntry::new(n, &(i + 10).to_string(), vec![1.0, i as f32, 0.0]));
        persist::save_to_path(&Generation::build(entries, 3, &ForestConfig::default()), path).unwrap();
    }

    #[tokio::test]
    async fn test_startup_builds_persists_and_installs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.vidx");
        let url = serve_catalog(StatusCode::OK, CATALOG).await;
        let (refresher, index) = refresher(&url, path.clone());

        refresher.startup().await;

        let generation = index.snapshot().unwrap();
        assert_eq!(generation.len(), 2);
        let hits = generation.query(&Embedding::new(vec![0.1, 1.0, 0.0]), 1, None).unwrap();
        assert_eq!(generation.store().get(hits[0].label).unwrap().username, "bob");
        assert_eq!(persist::load_from_path(&path).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_startup_falls_back_to_persisted_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.vidx");
        persisted(&path, &["carol", "dave", "erin"]);
        let (refresher, index) = refresher(&dead_url().await, path);

        refresher.startup().await;
        assert_eq!(index.snapshot().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_startup_error_status_uses_persisted_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.vidx");
        persisted(&path, &["carol"]);
        let url = serve_catalog(StatusCode::INTERNAL_SERVER_ERROR, "oops").await;
        let (refresher, index) = refresher(&url, path);

        refresher.startup().await;
        assert_eq!(index.snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_startup_without_anything_installs_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (refresher, index) = refresher(&dead_url().await, dir.path().join("missing.vidx"));

        refresher.startup().await;
        let generation = index.snapshot().unwrap();
        assert!(generation.is_empty());
        assert_eq!(index.generation(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.vidx");
        let url = serve_catalog(StatusCode::OK, CATALOG).await;
        let (good, index) = refresher(&url, path.clone());
        good.startup().await;
        let before = index.snapshot().unwrap();

        let broken = IndexRefresher::new(
            reqwest::Client::new(),
            &serve_catalog(StatusCode::OK, "{not json").await,
            path,
            3,
            ForestConfig::default(),
            index.clone(),
        );
        assert!(matches!(broken.refresh().await, Err(RefreshError::Fetch(_))));
        assert!(Arc::ptr_eq(&before, &index.snapshot().unwrap()));
    }

    #[tokio::test]
    async fn test_refresh_with_empty_catalog_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.vidx");
        persisted(&path, &["carol", "dave"]);
        let url = serve_catalog(StatusCode::OK, "[]").await;
        let (refresher, index) = refresher(&url, path.clone());

        assert_eq!(refresher.refresh().await.unwrap(), 0);
        assert!(index.snapshot().unwrap().is_empty());
        assert_eq!(persist::load_from_path(&path).unwrap().len(), 2);
    }
}
