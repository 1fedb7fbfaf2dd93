use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use vigil_core::detector::OnnxPresenceDetector;
use vigil_core::extractor::OnnxExtractor;
use vigil_core::resolver::IdentityResolver;
use vigil_core::store::IdentityIndex;

mod catalog;
mod config;
mod dispatcher;
mod engine;
mod feed;
mod identify;
mod refresh;
mod sink;

use config::Config;
use dispatcher::IdentificationDispatcher;
use engine::EngineOptions;
use identify::Identifier;
use refresh::IndexRefresher;
use sink::{HttpUploader, MqttPublisher, RemoteSink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vigild starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        source = %config.source,
        catalog = %config.catalog_url,
        k = config.k,
        threshold = config.distance_threshold,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.captured_dir)
        .with_context(|| format!("failed to create {}", config.captured_dir.display()))?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let index = Arc::new(IdentityIndex::new());
    let refresher = Arc::new(IndexRefresher::new(
        http.clone(),
        &config.catalog_url,
        config.index_path.clone(),
        config.dimension,
        config.forest(),
        index.clone(),
    ));
    refresher.startup().await;
    if let Some(generation) = index.snapshot() {
        tracing::info!(records = generation.len(), "identity index ready");
    }
    let _refresh_task = config
        .refresh_interval()
        .map(|interval| refresher.clone().spawn_periodic(interval));

    let detector_path = config.detector_model_path();
    let live_detector = OnnxPresenceDetector::load(&detector_path, config.detector_confidence)
        .context("failed to load face detector")?;
    let crop_detector = OnnxPresenceDetector::load(&detector_path, config.detector_confidence)
        .context("failed to load face detector")?;
    let extractor = OnnxExtractor::load(&config.embedder_model_path(), crop_detector, config.dimension)
        .context("failed to load face embedder")?;

    let sink = RemoteSink::new(
        MqttPublisher::connect(&config.mqtt_url, &config.mqtt_topic).context("failed to configure MQTT")?,
        HttpUploader::new(http, &config.upload_url),
    );
    let identifier = Identifier::new(
        Box::new(extractor),
        index,
        IdentityResolver::new(config.resolver()),
        Arc::new(sink),
    );
    let dispatcher = Arc::new(IdentificationDispatcher::new(
        Arc::new(identifier),
        Handle::current(),
        config.job_timeout(),
    ));

    let (feed_tx, feed_rx) = watch::channel(None);
    let feed_addr = config.feed_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = feed::serve(&feed_addr, feed_rx).await {
            tracing::error!(addr = %feed_addr, error = %e, "video feed server failed");
        }
    });

    let mut engine = engine::spawn_engine(
        EngineOptions {
            source: config.source.clone(),
            debounce: config.debounce(),
            captured_dir: config.captured_dir.clone(),
            box_padding: config.box_padding,
        },
        Box::new(live_detector),
        dispatcher,
        feed_tx,
    )
    .await
    .context("failed to start frame loop")?;

    tracing::info!("vigild ready");

    let interrupted = tokio::select! {
        result = engine.wait() => {
            result.context("frame loop stopped")?;
            false
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            true
        }
    };

    if interrupted {
        tracing::info!("vigild shutting down");
        engine.stop();
        match tokio::time::timeout(Duration::from_secs(5), engine.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "frame loop did not exit cleanly"),
            Err(_) => tracing::warn!("frame loop still blocked on its source; exiting anyway"),
        }
    } else {
        tracing::info!("frame source finished; vigild exiting");
    }

    Ok(())
}
