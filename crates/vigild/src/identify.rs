//! The identification job run for each captured frame.

use crate::sink::{ResultSink, UploadReport};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vigil_core::extractor::EmbeddingExtractor;
use vigil_core::resolver::{IdentityResolver, Resolution};
use vigil_core::store::IdentityIndex;
use vigil_core::types::{CaptureEvent, IdentificationResult};

/// How one capture ended. Every variant other than a match reports as unknown.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Resolved(Resolution),
    /// The extractor found no face in the saved image.
    NoFace,
    ExtractionFailed(String),
}

impl JobOutcome {
    pub fn result(&self) -> IdentificationResult {
        match self {
            JobOutcome::Resolved(resolution) => resolution.clone().into(),
            JobOutcome::NoFace | JobOutcome::ExtractionFailed(_) => IdentificationResult::unknown(),
        }
    }
}

/// Work performed for one capture event.
#[async_trait]
pub trait CaptureJob: Send + Sync + 'static {
    async fn run(&self, event: CaptureEvent) -> JobOutcome;
}

/// Extract, resolve, then report through the sink.
pub struct Identifier {
    extractor: Arc<Mutex<Box<dyn EmbeddingExtractor>>>,
    index: Arc<IdentityIndex>,
    resolver: IdentityResolver,
    sink: Arc<dyn ResultSink>,
}

impl Identifier {
    pub fn new(
        extractor: Box<dyn EmbeddingExtractor>,
        index: Arc<IdentityIndex>,
        resolver: IdentityResolver,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            extractor: Arc::new(Mutex::new(extractor)),
            index,
            resolver,
            sink,
        }
    }

    pub async fn identify(&self, event: CaptureEvent) -> JobOutcome {
        let outcome = self.resolve_capture(&event.image_path).await;
        match &outcome {
            JobOutcome::Resolved(Resolution::Matched { username, avg_distance, .. }) => {
                tracing::info!(username = %username, avg_distance, "identified");
            }
            JobOutcome::Resolved(other) => tracing::info!(resolution = ?other, "no confident match"),
            JobOutcome::NoFace => tracing::warn!(path = %event.image_path.display(), "no face in captured image"),
            JobOutcome::ExtractionFailed(error) => {
                tracing::warn!(path = %event.image_path.display(), error = %error, "embedding extraction failed")
            }
        }

        self.report(&event, &outcome.result()).await;
        outcome
    }

    async fn resolve_capture(&self, image_path: &Path) -> JobOutcome {
        let extractor = self.extractor.clone();
        let path: PathBuf = image_path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extractor.lock().extract(&path)).await;

        match extracted {
            Ok(Ok(Some(embedding))) => JobOutcome::Resolved(self.resolver.resolve(&self.index, &embedding)),
            Ok(Ok(None)) => JobOutcome::NoFace,
            Ok(Err(e)) => JobOutcome::ExtractionFailed(e.to_string()),
            Err(e) => JobOutcome::ExtractionFailed(format!("extraction task failed: {e}")),
        }
    }

    /// Publish the name, then upload the snapshot. Failures are logged only.
    async fn report(&self, event: &CaptureEvent, result: &IdentificationResult) {
        let image = match tokio::fs::read(&event.image_path).await {
            Ok(bytes) => Some(STANDARD.encode(bytes)),
            Err(e) => {
                tracing::warn!(path = %event.image_path.display(), error = %e, "failed to read capture for upload");
                None
            }
        };

        if let Err(e) = self.sink.publish(result.display_name()).await {
            tracing::warn!(error = %e, "result publish failed");
        }

        let Some(base64_image) = image else {
            return;
        };
        let report = UploadReport {
            base64_image,
            member_id: result.wire_member_id(),
            timestamp: event.timestamp.clone(),
        };
        if let Err(e) = self.sink.upload(&report).await {
            tracing::warn!(error = %e, "snapshot upload failed");
        }
    }
}

#[async_trait]
impl CaptureJob for Identifier {
    async fn run(&self, event: CaptureEvent) -> JobOutcome {
        self.identify(event).await
    }
}
